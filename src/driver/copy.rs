use super::Db;
use crate::core::Result;
use log::warn;
use std::collections::BTreeMap;

/// Outcome of copying one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollCopyStats {
    pub copied: usize,
    pub failed: usize,
}

/// Outcome of `copy_db`, per collection name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub collections: BTreeMap<String, CollCopyStats>,
}

impl CopyReport {
    pub fn copied(&self) -> usize {
        self.collections.values().map(|s| s.copied).sum()
    }

    pub fn failed(&self) -> usize {
        self.collections.values().map(|s| s.failed).sum()
    }
}

/// Copies every entity of every collection from one database into another,
/// possibly across backends.
///
/// Entities that fail to load or save are counted and skipped. Only failing
/// to enumerate the source aborts the copy. The target assigns fresh mtimes.
pub fn copy_db(from: &Db, to: &Db) -> Result<CopyReport> {
    let mut report = CopyReport::default();

    for coll in from.list_collection_names()? {
        let mut stats = CollCopyStats::default();
        for id in from.list_ids(&coll)? {
            let outcome = from
                .load(&coll, &id)
                .and_then(|record| match record {
                    Some(record) => to.save(&coll, &id, &record.payload).map(Some),
                    // Removed since the listing.
                    None => Ok(None),
                });
            match outcome {
                Ok(Some(_)) => stats.copied += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!("copy of {}/{} from {} failed: {}", coll, id, from.descriptor(), err);
                    stats.failed += 1;
                }
            }
        }
        report.collections.insert(coll, stats);
    }

    Ok(report)
}
