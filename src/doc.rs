//! Module `doc` implement the self-describing document stored in records.
//!
//! A [Doc] is an ordered list of `(field, value)` pairs, serialized to CBOR
//! on its way into a record payload. Field order is preserved, duplicate
//! fields are not allowed. [Value] is the dynamic value type; nested
//! documents and arrays nest the same way.

use cbordata::{Cbor, Cborize, FromCbor, IntoCbor, Tag};

const VALUE_VER: &str = "recstore/value/0.1.0";
const PROP_VER: &str = "recstore/prop/0.1.0";
const DOC_VER: &str = "recstore/doc/0.1.0";

/// Dynamic value held by a document field.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Doc),
}

impl Value {
    const ID: &'static str = VALUE_VER;
}

// `cbordata_derive::Cborize` mis-generates the enum-to-cbor match arm for
// unit variants (it evaluates to `Cbor` instead of pushing onto `items`,
// tripping a match-arm type mismatch), so `Value` implements `IntoCbor`/
// `FromCbor` by hand here, following the same wire format the derive macro
// produces for enums with named/unnamed variants.
impl IntoCbor for Value {
    fn into_cbor(self) -> cbordata::Result<Cbor> {
        let value = self;
        let mut items: Vec<Cbor> = Vec::default();

        let val: Cbor = {
            let id = Value::ID.into_cbor()?;
            Tag::from_identifier(id).into()
        };
        items.push(val);

        match value {
            Value::Null => {
                items.push("Null".into_cbor()?);
            }
            Value::Bool(a) => {
                items.push("Bool".into_cbor()?);
                items.push(a.into_cbor()?);
            }
            Value::Integer(a) => {
                items.push("Integer".into_cbor()?);
                items.push(a.into_cbor()?);
            }
            Value::Float(a) => {
                items.push("Float".into_cbor()?);
                items.push(a.into_cbor()?);
            }
            Value::Text(a) => {
                items.push("Text".into_cbor()?);
                items.push(a.into_cbor()?);
            }
            Value::Bytes(a) => {
                items.push("Bytes".into_cbor()?);
                items.push(Cbor::from_bytes(a)?);
            }
            Value::Array(a) => {
                items.push("Array".into_cbor()?);
                items.push(a.into_cbor()?);
            }
            Value::Object(a) => {
                items.push("Object".into_cbor()?);
                items.push(a.into_cbor()?);
            }
        }

        items.into_cbor()
    }
}

impl FromCbor for Value {
    fn from_cbor(value: Cbor) -> cbordata::Result<Value> {
        use cbordata::Error;

        let mut items = Vec::<Cbor>::from_cbor(value)?;

        if items.len() < 2 {
            cbordata::err_at!(FailConvert, msg: "empty msg for Value")?;
        }
        let data_id = items.remove(0);
        let type_id: Cbor = {
            let id = Value::ID.into_cbor()?;
            Tag::from_identifier(id).into()
        };
        if data_id != type_id {
            cbordata::err_at!(FailConvert, msg: "bad Value")?
        }

        let variant_name = String::from_cbor(items.remove(0))?;

        let val = match variant_name.as_str() {
            "Null" => {
                if !items.is_empty() {
                    cbordata::err_at!(FailConvert, msg: "bad arity {}", items.len())?;
                }
                Value::Null
            }
            "Bool" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Bool(bool::from_cbor(items.remove(0))?)
            }
            "Integer" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Integer(i64::from_cbor(items.remove(0))?)
            }
            "Float" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Float(f64::from_cbor(items.remove(0))?)
            }
            "Text" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Text(String::from_cbor(items.remove(0))?)
            }
            "Bytes" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Bytes(items.remove(0).into_bytes()?)
            }
            "Array" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Array(Vec::<Value>::from_cbor(items.remove(0))?)
            }
            "Object" => {
                if items.len() != 1 {
                    cbordata::err_at!(FailConvert, msg: "bad arity 1 {}", items.len())?;
                }
                Value::Object(Doc::from_cbor(items.remove(0))?)
            }
            _ => cbordata::err_at!(
                FailConvert, msg: "invalid variant_name {}", variant_name
            )?,
        };
        Ok(val)
    }
}

impl From<bool> for Value {
    fn from(val: bool) -> Value {
        Value::Bool(val)
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Value {
        Value::Integer(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Value {
        Value::Float(val)
    }
}

impl From<&str> for Value {
    fn from(val: &str) -> Value {
        Value::Text(val.to_string())
    }
}

impl From<String> for Value {
    fn from(val: String) -> Value {
        Value::Text(val)
    }
}

/// One `field: value` binding inside a document.
#[derive(Clone, Debug, PartialEq, Cborize)]
pub struct Prop {
    pub field: String,
    pub value: Value,
}

impl Prop {
    const ID: &'static str = PROP_VER;
}

/// Ordered collection of `field: value` bindings.
#[derive(Clone, Debug, PartialEq, Default, Cborize)]
pub struct Doc {
    pub pairs: Vec<Prop>,
}

impl Doc {
    const ID: &'static str = DOC_VER;

    pub fn new() -> Doc {
        Doc { pairs: Vec::default() }
    }

    /// Set `field` to `value`, replacing an existing binding in place.
    pub fn set<V>(mut self, field: &str, value: V) -> Doc
    where
        V: Into<Value>,
    {
        let value = value.into();
        match self.pairs.iter_mut().find(|p| p.field == field) {
            Some(p) => p.value = value,
            None => self.pairs.push(Prop { field: field.to_string(), value }),
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.pairs.iter().find(|p| p.field == field).map(|p| &p.value)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl From<Vec<(String, Value)>> for Doc {
    fn from(pairs: Vec<(String, Value)>) -> Doc {
        let pairs = pairs.into_iter().map(|(field, value)| Prop { field, value }).collect();
        Doc { pairs }
    }
}
