//! Backend-neutral element tree
//!
//! `Element` is the canonical in-transit shape of an entity: every backend
//! converts its native documents to and from this tree, and typed entities are
//! encoded into it through serde.

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub type ElementMap = BTreeMap<String, Element>;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Element {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Element>),
    Object(ElementMap),
}

impl Element {
    pub fn object() -> Self {
        Self::Object(ElementMap::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Element]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ElementMap> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ElementMap> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a field when this element is an object.
    pub fn get(&self, key: &str) -> Option<&Element> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Inserts a field, turning `Null` into an empty object first.
    ///
    /// Returns the previous value of the field. Non-object elements are left
    /// untouched and the value is handed back.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Element>) -> Option<Element> {
        if self.is_null() {
            *self = Self::object();
        }
        match self {
            Self::Object(map) => map.insert(key.into(), value.into()),
            _ => Some(value.into()),
        }
    }

    /// Removes a field when this element is an object.
    pub fn remove(&mut self, key: &str) -> Option<Element> {
        self.as_object_mut().and_then(|map| map.remove(key))
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "<{}>", self.type_name()),
        }
    }
}

impl From<bool> for Element {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Element {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<i64> for Element {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Element {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Element {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Element>> for Element {
    fn from(value: Vec<Element>) -> Self {
        Self::Array(value)
    }
}

impl From<ElementMap> for Element {
    fn from(value: ElementMap) -> Self {
        Self::Object(value)
    }
}

impl<T: Into<Element>> From<Option<T>> for Element {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

impl Serialize for Element {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

struct ElementVisitor;

impl<'de> Visitor<'de> for ElementVisitor {
    type Value = Element;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON-shaped value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Element, E> {
        Ok(Element::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Element, E> {
        Ok(Element::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Element, D::Error> {
        Element::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Element, E> {
        Ok(Element::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Element, E> {
        Ok(Element::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Element, E> {
        i64::try_from(v)
            .map(Element::Int)
            .map_err(|_| E::custom(format!("integer {} does not fit in a signed 64-bit element", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Element, E> {
        Ok(Element::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Element, E> {
        Ok(Element::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Element, E> {
        Ok(Element::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Element, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Element::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Element, A::Error> {
        let mut map = ElementMap::new();
        while let Some((key, value)) = access.next_entry::<String, Element>()? {
            map.insert(key, value);
        }
        Ok(Element::Object(map))
    }
}

impl<'de> Deserialize<'de> for Element {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ElementVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_promotes_null_to_object() {
        let mut element = Element::Null;
        element.insert("name", "alice");
        assert_eq!(element.get("name"), Some(&Element::from("alice")));
        assert_eq!(element.type_name(), "object");
    }

    #[test]
    fn test_insert_on_scalar_is_rejected() {
        let mut element = Element::Int(3);
        let returned = element.insert("x", 1);
        assert_eq!(returned, Some(Element::Int(1)));
        assert_eq!(element, Element::Int(3));
    }

    #[test]
    fn test_as_i64_accepts_integral_floats_only() {
        assert_eq!(Element::Float(4.0).as_i64(), Some(4));
        assert_eq!(Element::Float(4.5).as_i64(), None);
        assert_eq!(Element::Float(f64::NAN).as_i64(), None);
    }

    #[test]
    fn test_serde_json_text_round_trip() {
        let text = r#"{"a":[1,2.5,"x",null,true],"b":{"c":-7}}"#;
        let element: Element = serde_json::from_str(text).unwrap();
        assert_eq!(element.get("b").and_then(|b| b.get("c")), Some(&Element::Int(-7)));
        assert_eq!(serde_json::to_string(&element).unwrap(), text);
    }

    #[test]
    fn test_large_unsigned_degrades_to_float() {
        let element: Element = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(element, Element::Float(_)));
    }
}
