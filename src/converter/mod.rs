//! Element tree converters
//!
//! Each backend stores entities in its own native document shape. A
//! `Converter` maps the backend-neutral `Element` tree to that shape and back,
//! losslessly for every value an entity can produce.
//!
//! - `json.rs` - `serde_json::Value` documents (flat files)
//! - `document.rs` - BSON-like documents with typed integers and escaped keys
//!
//! Typed entities (and any leaf type with serde impls) enter and leave the
//! tree through `to_element` / `from_element`.

mod document;
mod encode;
mod json;

pub use document::{Bson, Document, DocumentConverter, escape_key, unescape_key};
pub use json::JsonConverter;

use crate::core::{Element, Result, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bidirectional mapping between the element tree and a backend-native value.
pub trait Converter {
    type Native;

    fn to_native(&self, element: &Element) -> Result<Self::Native>;

    fn from_native(&self, native: &Self::Native) -> Result<Element>;
}

/// Encodes any serializable value into an element tree.
pub fn to_element<T: Serialize + ?Sized>(value: &T) -> Result<Element> {
    value.serialize(encode::ElementEncoder)
}

/// Materializes a typed value from an element tree.
pub fn from_element<T: DeserializeOwned>(element: &Element) -> Result<T> {
    let json = JsonConverter.to_native(element)?;
    T::deserialize(json).map_err(|e| StoreError::Serialization(e.to_string()))
}
