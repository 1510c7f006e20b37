//! Common imports grouped by abstraction level.
//!
//! `app` covers what application code needs day to day.
//! `backend` is for writing or wiring storage drivers.

pub mod app {
    //! Typed collections on top of a `Store`.
    pub use crate::{
        Coll, CollOptions, Entity, EntityState, Result, Store, StoreConfig, StoreError,
    };
}

pub mod backend {
    //! Driver contract, element tree and converters.
    pub use crate::converter::{Converter, from_element, to_element};
    pub use crate::driver::{Db, Driver, ID_FIELD, MTIME_FIELD, Record, check_id, check_payload};
    pub use crate::{ConnectionDescriptor, Element, MtimeClock, WriteConcern};
}
