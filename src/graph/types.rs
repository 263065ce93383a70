use crate::error::{Error, Result};
use crate::store::Scalar;
use serde_json::{Map, Number, Value};

/// Key carrying a record's type in document form
pub const TYPE_TAG: &str = "ClassName";

/// A value inside an extracted record
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Null,
    Scalar(Scalar),
    /// A to-one relation
    Node(ExtractedRecord),
    /// A to-many relation
    List(Vec<ExtractedRecord>),
}

impl Extracted {
    pub fn to_json(&self) -> Value {
        match self {
            Extracted::Null => Value::Null,
            Extracted::Scalar(scalar) => scalar_to_json(scalar),
            Extracted::Node(record) => record.to_json(),
            Extracted::List(records) => {
                Value::Array(records.iter().map(ExtractedRecord::to_json).collect())
            }
        }
    }

    /// Decode a JSON value; nested objects become records, arrays lists
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Extracted::Null,
            Value::Bool(b) => Extracted::Scalar(Scalar::Bool(b)),
            Value::Number(n) => Extracted::Scalar(number_to_scalar(&n)),
            Value::String(s) => Extracted::Scalar(Scalar::Text(s)),
            Value::Object(map) => Extracted::Node(ExtractedRecord::from_map(map)?),
            Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Null => {}
                        Value::Object(map) => records.push(ExtractedRecord::from_map(map)?),
                        other => {
                            return Err(Error::malformed(format!(
                                "to-many member must be an object, got {}",
                                other
                            )))
                        }
                    }
                }
                Extracted::List(records)
            }
        })
    }
}

/// One object flattened into field name → value, in schema order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractedRecord {
    pub type_name: Option<String>,
    pub fields: Vec<(String, Extracted)>,
}

impl ExtractedRecord {
    pub fn new(type_name: impl Into<String>) -> Self {
        ExtractedRecord {
            type_name: Some(type_name.into()),
            fields: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: Extracted) {
        self.fields.push((name.into(), value));
    }

    pub fn with(mut self, name: impl Into<String>, value: Extracted) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Extracted> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Document form, type tag first
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(type_name) = &self.type_name {
            map.insert(TYPE_TAG.to_string(), Value::String(type_name.clone()));
        }
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(Error::malformed(format!("expected an object record, got {}", other))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut record = ExtractedRecord::default();
        for (key, value) in map {
            if key == TYPE_TAG {
                match value {
                    Value::String(type_name) if !type_name.is_empty() => {
                        record.type_name = Some(type_name)
                    }
                    Value::Null => {}
                    other => {
                        return Err(Error::malformed(format!("invalid {} {}", TYPE_TAG, other)))
                    }
                }
                continue;
            }
            record.push(key, Extracted::from_json(value)?);
        }
        Ok(record)
    }
}

fn scalar_to_json(scalar: &Scalar) -> Value {
    match scalar {
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::Int(n) => Value::Number((*n).into()),
        Scalar::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Scalar::Text(s) => Value::String(s.clone()),
    }
}

fn number_to_scalar(n: &Number) -> Scalar {
    if let Some(i) = n.as_i64() {
        Scalar::Int(i)
    } else {
        Scalar::Float(n.as_f64().unwrap_or_default())
    }
}
