//! Direct serde encoder into the element tree.
//!
//! Values the tree cannot hold exactly (non-finite floats, integers outside
//! the `i64` range, non-scalar map keys) fail with `StoreError::Serialization`
//! instead of being coerced.

use crate::core::{Element, ElementMap, StoreError};
use serde::ser::{self, Serialize};
use std::fmt::Display;

impl ser::Error for StoreError {
    fn custom<T: Display>(msg: T) -> Self {
        StoreError::Serialization(msg.to_string())
    }
}

type EncodeResult = std::result::Result<Element, StoreError>;

fn out_of_range(value: impl Display) -> StoreError {
    StoreError::Serialization(format!("integer {} does not fit in a signed 64-bit element", value))
}

pub(crate) struct ElementEncoder;

impl ser::Serializer for ElementEncoder {
    type Ok = Element;
    type Error = StoreError;

    type SerializeSeq = SeqEncoder;
    type SerializeTuple = SeqEncoder;
    type SerializeTupleStruct = SeqEncoder;
    type SerializeTupleVariant = VariantSeqEncoder;
    type SerializeMap = MapEncoder;
    type SerializeStruct = MapEncoder;
    type SerializeStructVariant = VariantMapEncoder;

    fn serialize_bool(self, v: bool) -> EncodeResult {
        Ok(Element::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> EncodeResult {
        Ok(Element::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> EncodeResult {
        Ok(Element::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> EncodeResult {
        Ok(Element::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> EncodeResult {
        Ok(Element::Int(v))
    }

    fn serialize_i128(self, v: i128) -> EncodeResult {
        i64::try_from(v).map(Element::Int).map_err(|_| out_of_range(v))
    }

    fn serialize_u8(self, v: u8) -> EncodeResult {
        Ok(Element::Int(v.into()))
    }

    fn serialize_u16(self, v: u16) -> EncodeResult {
        Ok(Element::Int(v.into()))
    }

    fn serialize_u32(self, v: u32) -> EncodeResult {
        Ok(Element::Int(v.into()))
    }

    fn serialize_u64(self, v: u64) -> EncodeResult {
        i64::try_from(v).map(Element::Int).map_err(|_| out_of_range(v))
    }

    fn serialize_u128(self, v: u128) -> EncodeResult {
        i64::try_from(v).map(Element::Int).map_err(|_| out_of_range(v))
    }

    fn serialize_f32(self, v: f32) -> EncodeResult {
        self.serialize_f64(v.into())
    }

    fn serialize_f64(self, v: f64) -> EncodeResult {
        if !v.is_finite() {
            return Err(StoreError::Serialization(format!(
                "non-finite float {} cannot be stored",
                v
            )));
        }
        Ok(Element::Float(v))
    }

    fn serialize_char(self, v: char) -> EncodeResult {
        Ok(Element::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> EncodeResult {
        Ok(Element::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> EncodeResult {
        Ok(Element::Array(v.iter().map(|b| Element::Int((*b).into())).collect()))
    }

    fn serialize_none(self) -> EncodeResult {
        Ok(Element::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> EncodeResult {
        value.serialize(self)
    }

    fn serialize_unit(self) -> EncodeResult {
        Ok(Element::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> EncodeResult {
        Ok(Element::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> EncodeResult {
        Ok(Element::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> EncodeResult {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> EncodeResult {
        let mut map = ElementMap::new();
        map.insert(variant.to_string(), value.serialize(ElementEncoder)?);
        Ok(Element::Object(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqEncoder, StoreError> {
        Ok(SeqEncoder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqEncoder, StoreError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SeqEncoder, StoreError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqEncoder, StoreError> {
        Ok(VariantSeqEncoder {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapEncoder, StoreError> {
        Ok(MapEncoder {
            map: ElementMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapEncoder, StoreError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapEncoder, StoreError> {
        Ok(VariantMapEncoder {
            variant,
            map: ElementMap::new(),
        })
    }
}

pub(crate) struct SeqEncoder {
    items: Vec<Element>,
}

impl ser::SerializeSeq for SeqEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        self.items.push(value.serialize(ElementEncoder)?);
        Ok(())
    }

    fn end(self) -> EncodeResult {
        Ok(Element::Array(self.items))
    }
}

impl ser::SerializeTuple for SeqEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> EncodeResult {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> EncodeResult {
        ser::SerializeSeq::end(self)
    }
}

/// `{ variant: [fields...] }`
pub(crate) struct VariantSeqEncoder {
    variant: &'static str,
    items: Vec<Element>,
}

impl ser::SerializeTupleVariant for VariantSeqEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        self.items.push(value.serialize(ElementEncoder)?);
        Ok(())
    }

    fn end(self) -> EncodeResult {
        let mut map = ElementMap::new();
        map.insert(self.variant.to_string(), Element::Array(self.items));
        Ok(Element::Object(map))
    }
}

pub(crate) struct MapEncoder {
    map: ElementMap,
    next_key: Option<String>,
}

impl ser::SerializeMap for MapEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), StoreError> {
        self.next_key = Some(map_key(key.serialize(ElementEncoder)?)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| StoreError::Serialization("map value without a key".into()))?;
        self.map.insert(key, value.serialize(ElementEncoder)?);
        Ok(())
    }

    fn end(self) -> EncodeResult {
        Ok(Element::Object(self.map))
    }
}

impl ser::SerializeStruct for MapEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), value.serialize(ElementEncoder)?);
        Ok(())
    }

    fn end(self) -> EncodeResult {
        Ok(Element::Object(self.map))
    }
}

/// `{ variant: { fields... } }`
pub(crate) struct VariantMapEncoder {
    variant: &'static str,
    map: ElementMap,
}

impl ser::SerializeStructVariant for VariantMapEncoder {
    type Ok = Element;
    type Error = StoreError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), value.serialize(ElementEncoder)?);
        Ok(())
    }

    fn end(self) -> EncodeResult {
        let mut outer = ElementMap::new();
        outer.insert(self.variant.to_string(), Element::Object(self.map));
        Ok(Element::Object(outer))
    }
}

// Scalar keys are stringified the same way serde_json does it.
fn map_key(key: Element) -> Result<String, StoreError> {
    match key {
        Element::String(s) => Ok(s),
        Element::Int(i) => Ok(i.to_string()),
        Element::Bool(b) => Ok(b.to_string()),
        other => Err(StoreError::Serialization(format!(
            "map key must be a string, got {}",
            other.type_name()
        ))),
    }
}
