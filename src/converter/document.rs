//! Element tree <-> BSON-like documents
//!
//! Document stores distinguish 32- and 64-bit integers and reserve `.` and a
//! leading `$` in field names. Keys are escaped on the way in and restored on
//! the way out so any application key survives a round trip.

use super::Converter;
use crate::core::{Element, Result, StoreError, element::ElementMap};
use std::collections::BTreeMap;

pub type Document = BTreeMap<String, Bson>;

/// Native value of the document backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Bson {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Array(Vec<Bson>),
    Document(Document),
}

impl Bson {
    /// Numeric view used when reading metadata fields.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(i) => Some(*i as i64),
            Self::Int64(i) => Some(*i),
            Self::Double(f) if f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

const ESCAPED_DOLLAR: &str = "\\u0024";
const ESCAPED_DOT: &str = "\\u002e";

/// Escapes characters a document store refuses in field names.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '$' => out.push_str(ESCAPED_DOLLAR),
            '.' => out.push_str(ESCAPED_DOT),
            other => out.push(other),
        }
    }
    out
}

/// Reverses `escape_key`. Unknown escape sequences are kept verbatim.
pub fn unescape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut rest = key;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("\\\\") {
            out.push('\\');
            rest = &tail[2..];
        } else if tail.starts_with(ESCAPED_DOLLAR) {
            out.push('$');
            rest = &tail[ESCAPED_DOLLAR.len()..];
        } else if tail.starts_with(ESCAPED_DOT) {
            out.push('.');
            rest = &tail[ESCAPED_DOT.len()..];
        } else {
            out.push('\\');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Converts element trees to documents for the document backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentConverter;

impl DocumentConverter {
    /// Converts a top-level object into a document.
    pub fn to_document(&self, element: &Element) -> Result<Document> {
        match self.to_native(element)? {
            Bson::Document(doc) => Ok(doc),
            _ => Err(StoreError::Serialization(format!(
                "Entity payload must be an object, got {}",
                element.type_name()
            ))),
        }
    }

    pub fn from_document(&self, doc: &Document) -> Result<Element> {
        let mut out = ElementMap::new();
        for (key, value) in doc {
            out.insert(unescape_key(key), self.from_native(value)?);
        }
        Ok(Element::Object(out))
    }
}

impl Converter for DocumentConverter {
    type Native = Bson;

    fn to_native(&self, element: &Element) -> Result<Bson> {
        match element {
            Element::Null => Ok(Bson::Null),
            Element::Bool(b) => Ok(Bson::Boolean(*b)),
            Element::Int(i) => Ok(i32::try_from(*i).map(Bson::Int32).unwrap_or(Bson::Int64(*i))),
            Element::Float(f) => {
                if f.is_finite() {
                    Ok(Bson::Double(*f))
                } else {
                    Err(StoreError::Serialization(format!("Cannot store non-finite float {}", f)))
                }
            }
            Element::String(s) => Ok(Bson::String(s.clone())),
            Element::Array(items) => items
                .iter()
                .map(|item| self.to_native(item))
                .collect::<Result<Vec<_>>>()
                .map(Bson::Array),
            Element::Object(map) => {
                let mut doc = Document::new();
                for (key, value) in map {
                    doc.insert(escape_key(key), self.to_native(value)?);
                }
                Ok(Bson::Document(doc))
            }
        }
    }

    fn from_native(&self, native: &Bson) -> Result<Element> {
        match native {
            Bson::Null => Ok(Element::Null),
            Bson::Boolean(b) => Ok(Element::Bool(*b)),
            Bson::Int32(i) => Ok(Element::Int(*i as i64)),
            Bson::Int64(i) => Ok(Element::Int(*i)),
            Bson::Double(f) => Ok(Element::Float(*f)),
            Bson::String(s) => Ok(Element::String(s.clone())),
            Bson::Array(items) => items
                .iter()
                .map(|item| self.from_native(item))
                .collect::<Result<Vec<_>>>()
                .map(Element::Array),
            Bson::Document(doc) => self.from_document(doc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for key in ["plain", "a.b", "$set", "back\\slash", "\\u0024", "mix.$\\.x", ""] {
            let escaped = escape_key(key);
            assert!(!escaped.contains('.'), "{escaped}");
            assert!(!escaped.contains('$'), "{escaped}");
            assert_eq!(unescape_key(&escaped), key);
        }
    }

    #[test]
    fn test_integer_width_selection() {
        let converter = DocumentConverter;
        assert_eq!(converter.to_native(&Element::Int(7)).unwrap(), Bson::Int32(7));
        assert_eq!(
            converter.to_native(&Element::Int(i64::from(i32::MAX) + 1)).unwrap(),
            Bson::Int64(i64::from(i32::MAX) + 1)
        );
        assert_eq!(converter.from_native(&Bson::Int32(7)).unwrap(), Element::Int(7));
    }

    #[test]
    fn test_document_round_trip_with_dotted_keys() {
        let converter = DocumentConverter;
        let mut world = Element::object();
        world.insert("world.nether", 2.5);
        let mut element = Element::object();
        element.insert("homes", world);
        element.insert("$balance", 100);

        let doc = converter.to_document(&element).unwrap();
        assert!(doc.keys().all(|k| !k.contains('$')));
        assert_eq!(converter.from_document(&doc).unwrap(), element);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = DocumentConverter.to_document(&Element::Array(vec![])).unwrap_err();
        assert!(err.is_serialization());
    }
}
