// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod trace_utils;

use serde::ser::SerializeStruct;
use serde::Serialize;
use std::collections::HashMap;

/// Checks if the `value` represents an empty string. Used to skip serializing
/// empty strings with serde.
fn is_empty_str(value: &String) -> bool {
    value.is_empty()
}

fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    t == &T::default()
}

fn serialize_lower_64_bits<S>(v: &u128, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(*v as u64)
}

/// The wire representation of a finished span in the v0.4 trace format.
///
/// Fields that are empty or zero are omitted from the encoded map, whether
/// the map behind them was never allocated or allocated and left empty; the
/// agent treats both the same.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Span {
    pub service: String,
    pub name: String,
    pub resource: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub r#type: String,
    #[serde(serialize_with = "serialize_lower_64_bits")]
    pub trace_id: u128,
    pub span_id: u64,
    #[serde(skip_serializing_if = "is_default")]
    pub parent_id: u64,
    pub start: i64,
    pub duration: i64,
    #[serde(skip_serializing_if = "is_default")]
    pub error: i32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub meta_struct: HashMap<String, Vec<u8>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub span_links: Vec<SpanLink>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub span_events: Vec<SpanEvent>,
}

/// A causal reference to a span in another trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanLink {
    pub trace_id: u64,
    #[serde(skip_serializing_if = "is_default")]
    pub trace_id_high: u64,
    pub span_id: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub tracestate: String,
    #[serde(skip_serializing_if = "is_default")]
    pub flags: u32,
}

/// A timestamped event attached to a span.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanEvent {
    pub time_unix_nano: u64,
    pub name: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, AttributeAnyValue>,
}

/// An event attribute value: either a scalar or a homogeneous array of
/// scalars. Encoded as a tagged map (`type` + one `*_value` field).
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeAnyValue {
    SingleValue(AttributeArrayValue),
    Array(Vec<AttributeArrayValue>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttributeArrayValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Double(f64),
}

impl From<&AttributeArrayValue> for u8 {
    fn from(attribute: &AttributeArrayValue) -> u8 {
        match attribute {
            AttributeArrayValue::String(_) => 0,
            AttributeArrayValue::Boolean(_) => 1,
            AttributeArrayValue::Integer(_) => 2,
            AttributeArrayValue::Double(_) => 3,
        }
    }
}

impl From<&AttributeAnyValue> for u8 {
    fn from(attribute: &AttributeAnyValue) -> u8 {
        match attribute {
            AttributeAnyValue::SingleValue(value) => value.into(),
            AttributeAnyValue::Array(_) => 4,
        }
    }
}

fn serialize_attribute_scalar<S>(
    state: &mut S::SerializeStruct,
    attribute: &AttributeArrayValue,
) -> Result<(), S::Error>
where
    S: serde::Serializer,
{
    let attribute_type: u8 = attribute.into();
    state.serialize_field("type", &attribute_type)?;
    match attribute {
        AttributeArrayValue::String(value) => state.serialize_field("string_value", value),
        AttributeArrayValue::Boolean(value) => state.serialize_field("bool_value", value),
        AttributeArrayValue::Integer(value) => state.serialize_field("int_value", value),
        AttributeArrayValue::Double(value) => state.serialize_field("double_value", value),
    }
}

impl Serialize for AttributeArrayValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("AttributeArrayValue", 2)?;
        serialize_attribute_scalar::<S>(&mut state, self)?;
        state.end()
    }
}

#[derive(Serialize)]
struct ArrayValueWrapper<'a> {
    values: &'a Vec<AttributeArrayValue>,
}

impl Serialize for AttributeAnyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("AttributeAnyValue", 2)?;
        match self {
            AttributeAnyValue::SingleValue(attribute) => {
                serialize_attribute_scalar::<S>(&mut state, attribute)?;
            }
            AttributeAnyValue::Array(values) => {
                let value_type: u8 = self.into();
                state.serialize_field("type", &value_type)?;
                state.serialize_field("array_value", &ArrayValueWrapper { values })?;
            }
        }
        state.end()
    }
}

/// A trace chunk: the finished spans of one trace, shipped together.
pub type TraceChunk = Vec<Span>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_serializing_empty_fields() {
        let expected = b"\x87\xa7service\xa0\xa4name\xa0\xa8resource\xa0\xa8trace_id\x00\xa7span_id\x00\xa5start\x00\xa8duration\x00";
        let val = Span::default();
        let serialized = rmp_serde::encode::to_vec_named(&val).unwrap();
        assert_eq!(expected, serialized.as_slice());
    }

    #[test]
    fn empty_map_encodes_like_absent_map() {
        let mut with_empty = Span::default();
        with_empty.meta = HashMap::new();
        with_empty.metrics = HashMap::new();
        let absent = Span::default();
        assert_eq!(
            rmp_serde::encode::to_vec_named(&with_empty).unwrap(),
            rmp_serde::encode::to_vec_named(&absent).unwrap(),
        );
    }

    #[test]
    fn trace_id_serializes_lower_64_bits() {
        let span = Span {
            trace_id: (0xDEAD_BEEF_u128 << 64) | 42,
            ..Default::default()
        };
        let bytes = rmp_serde::encode::to_vec_named(&span).unwrap();
        let value: rmpv::Value = rmpv::decode::read_value(&mut bytes.as_slice()).unwrap();
        let map = value.as_map().unwrap();
        let trace_id = map
            .iter()
            .find(|(k, _)| k.as_str() == Some("trace_id"))
            .map(|(_, v)| v.as_u64().unwrap())
            .unwrap();
        assert_eq!(trace_id, 42);
    }

    #[test]
    fn serialize_event_attribute_double() {
        // `expected` is the span encoded by hand, byte for byte.
        let expected = b"\x88\xa7service\xa0\xa4name\xa0\xa8resource\xa0\xa8trace_id\x00\xa7span_id\x00\xa5start\x00\xa8duration\x00\xabspan_events\x91\x83\xaetime_unix_nano\xcf\x17\xf8I\xe1\xeb\xe5\x1f`\xa4name\xa4test\xaaattributes\x81\xaatest.event\x82\xa4type\x03\xacdouble_value\xcb@\x10\xcc\xcc\xcc\xcc\xcc\xcd";

        let span = Span {
            span_events: vec![SpanEvent {
                time_unix_nano: 1727211691770716000,
                name: "test".to_string(),
                attributes: HashMap::from([(
                    "test.event".to_string(),
                    AttributeAnyValue::SingleValue(AttributeArrayValue::Double(4.2)),
                )]),
            }],
            ..Default::default()
        };

        let serialized = rmp_serde::encode::to_vec_named(&span).unwrap();
        assert_eq!(expected, serialized.as_slice());
    }

    #[test]
    fn array_attribute_type_tag() {
        let attribute = AttributeAnyValue::Array(vec![
            AttributeArrayValue::String("a".to_string()),
            AttributeArrayValue::String("b".to_string()),
        ]);
        assert_eq!(u8::from(&attribute), 4);
        let scalar = AttributeAnyValue::SingleValue(AttributeArrayValue::Integer(1));
        assert_eq!(u8::from(&scalar), 2);
    }
}
