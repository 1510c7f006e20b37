//! Element tree <-> `serde_json::Value`

use super::Converter;
use crate::core::{Element, Result, StoreError, element::ElementMap};
use serde_json::{Map, Number, Value as JsonValue};

/// Converts element trees to JSON values for text-based backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    type Native = JsonValue;

    fn to_native(&self, element: &Element) -> Result<JsonValue> {
        match element {
            Element::Null => Ok(JsonValue::Null),
            Element::Bool(b) => Ok(JsonValue::Bool(*b)),
            Element::Int(i) => Ok(JsonValue::Number(Number::from(*i))),
            Element::Float(f) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| StoreError::Serialization(format!("Cannot store non-finite float {}", f))),
            Element::String(s) => Ok(JsonValue::String(s.clone())),
            Element::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.to_native(item)?);
                }
                Ok(JsonValue::Array(out))
            }
            Element::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), self.to_native(value)?);
                }
                Ok(JsonValue::Object(out))
            }
        }
    }

    fn from_native(&self, native: &JsonValue) -> Result<Element> {
        match native {
            JsonValue::Null => Ok(Element::Null),
            JsonValue::Bool(b) => Ok(Element::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Element::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Element::Float(f))
                } else {
                    Err(StoreError::Serialization(format!("Unrepresentable number {}", n)))
                }
            }
            JsonValue::String(s) => Ok(Element::String(s.clone())),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.from_native(item))
                .collect::<Result<Vec<_>>>()
                .map(Element::Array),
            JsonValue::Object(map) => {
                let mut out = ElementMap::new();
                for (key, value) in map {
                    out.insert(key.clone(), self.from_native(value)?);
                }
                Ok(Element::Object(out))
            }
        }
    }
}
