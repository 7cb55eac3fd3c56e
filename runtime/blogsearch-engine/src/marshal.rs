//! Value marshaling between host types and the engine representation.
//!
//! Host-facing: the tagged [`Value`], parameter sets, and conversions from
//! dynamic JSON input. Engine-facing: tracked allocations in the engine
//! heap for bound text/blob parameters, and column decoding dispatched on
//! the engine's reported type tag.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::c_int;

use rusqlite::ffi;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DbError, Result};

/// A single engine value, tagged the way the engine tags columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Number rule shared by every dynamic entry point: a float that
    /// survives truncation to 64-bit integer width intact binds as an
    /// integer, everything else stays a real.
    pub fn from_f64(v: f64) -> Self {
        if v.is_finite() && v == v.trunc() && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Value::Integer(v as i64)
        } else {
            Value::Real(v)
        }
    }

    /// Convert a dynamic JSON value. Unsupported shapes (objects, arrays
    /// holding anything but bytes) fail with [`DbError::Binding`] rather
    /// than coercing.
    pub fn from_json(v: &serde_json::Value) -> Result<Self> {
        match v {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::from_f64(f))
                } else {
                    Err(DbError::Binding(format!("number {n} is out of range")))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(items) => {
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    let byte = item
                        .as_u64()
                        .filter(|b| *b <= u64::from(u8::MAX))
                        .ok_or_else(|| {
                            DbError::Binding(format!("array element {item} is not a byte"))
                        })?;
                    bytes.push(byte as u8);
                }
                Ok(Value::Blob(bytes))
            }
            serde_json::Value::Object(_) => {
                Err(DbError::Binding("objects cannot be bound".into()))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::from_f64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => serializer.serialize_bytes(b),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("null, a number, a boolean, a string, or a byte sequence")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D2: Deserializer<'de>>(
                self,
                deserializer: D2,
            ) -> std::result::Result<Value, D2::Error> {
                Value::deserialize(deserializer)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
                Ok(Value::Integer(i64::from(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
                Ok(Value::Integer(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
                Ok(i64::try_from(v).map_or(Value::Real(v as f64), Value::Integer))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
                Ok(Value::from_f64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
                Ok(Value::Text(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
                Ok(Value::Text(v))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
                Ok(Value::Blob(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
                Ok(Value::Blob(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Value, A::Error> {
                let mut bytes = Vec::new();
                while let Some(element) = seq.next_element::<i64>()? {
                    let byte = u8::try_from(element).map_err(|_| {
                        de::Error::custom(format!("sequence element {element} is not a byte"))
                    })?;
                    bytes.push(byte);
                }
                Ok(Value::Blob(bytes))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Parameter sets accepted by bind: positional (1-based) or named
/// (placeholder names carry their prefix, e.g. `$term`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(HashMap<String, Value>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Convert a dynamic JSON parameter set: an array binds positionally,
    /// an object by name.
    pub fn from_json(v: &serde_json::Value) -> Result<Self> {
        match v {
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Params::Positional),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                .collect::<Result<HashMap<_, _>>>()
                .map(Params::Named),
            other => Err(DbError::Binding(format!(
                "parameters must be an array or an object, got {other}"
            ))),
        }
    }
}

/// One materialized result set: column names plus rows of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

/// Engine-heap allocations backing the current parameter bindings.
///
/// Every tracked pointer is freed exactly once: on rebind, reset,
/// finalize, or drop, whichever comes first. Release order is arbitrary.
pub(crate) struct BoundMem {
    ptrs: Vec<MemPtr>,
}

#[derive(Clone, Copy)]
struct MemPtr(*mut c_void);

impl BoundMem {
    pub(crate) fn new() -> Self {
        Self { ptrs: Vec::new() }
    }

    /// Copy `bytes` into a fresh engine allocation and track it.
    pub(crate) fn alloc(&mut self, bytes: &[u8]) -> Result<*const c_void> {
        // The engine allocator returns null for zero-size requests.
        let size = bytes.len().max(1) as c_int;
        // SAFETY: a plain allocator call; null means out of memory.
        let ptr = unsafe { ffi::sqlite3_malloc(size) };
        if ptr.is_null() {
            return Err(DbError::Engine {
                code: ffi::SQLITE_NOMEM,
                message: "out of memory".into(),
            });
        }
        // SAFETY: ptr addresses at least bytes.len() writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len()) };
        self.ptrs.push(MemPtr(ptr));
        Ok(ptr.cast_const())
    }

    pub(crate) fn free_all(&mut self) {
        while let Some(MemPtr(ptr)) = self.ptrs.pop() {
            // SAFETY: each pointer came from sqlite3_malloc and is popped
            // before freeing, so it cannot be freed twice.
            unsafe { ffi::sqlite3_free(ptr) };
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ptrs.len()
    }
}

impl Drop for BoundMem {
    fn drop(&mut self) {
        self.free_all();
    }
}

/// Decode column `col` of the current row by the engine's type tag.
///
/// # Safety
///
/// `stmt` must be a live statement handle positioned on a row.
pub(crate) unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, col: c_int) -> Value {
    match unsafe { ffi::sqlite3_column_type(stmt, col) } {
        ffi::SQLITE_INTEGER => Value::Integer(unsafe { ffi::sqlite3_column_int64(stmt, col) }),
        ffi::SQLITE_FLOAT => Value::Real(unsafe { ffi::sqlite3_column_double(stmt, col) }),
        ffi::SQLITE_TEXT => {
            let ptr = unsafe { ffi::sqlite3_column_text(stmt, col) };
            let len = unsafe { ffi::sqlite3_column_bytes(stmt, col) } as usize;
            let bytes = if ptr.is_null() {
                &[][..]
            } else {
                // SAFETY: the engine reports len valid bytes at ptr until
                // the next engine call.
                unsafe { std::slice::from_raw_parts(ptr, len) }
            };
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        ffi::SQLITE_BLOB => {
            let ptr = unsafe { ffi::sqlite3_column_blob(stmt, col) };
            let len = unsafe { ffi::sqlite3_column_bytes(stmt, col) } as usize;
            // The view into engine memory dies with the next engine call;
            // copy out immediately.
            let bytes = if ptr.is_null() || len == 0 {
                Vec::new()
            } else {
                // SAFETY: as above, valid for len bytes right now.
                unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }.to_vec()
            };
            Value::Blob(bytes)
        }
        _ => Value::Null,
    }
}

/// Decode one scalar-function argument.
///
/// # Safety
///
/// `value` must be a live argument handle inside a function callback.
pub(crate) unsafe fn read_argument(value: *mut ffi::sqlite3_value) -> Value {
    match unsafe { ffi::sqlite3_value_type(value) } {
        ffi::SQLITE_INTEGER => Value::Integer(unsafe { ffi::sqlite3_value_int64(value) }),
        ffi::SQLITE_FLOAT => Value::Real(unsafe { ffi::sqlite3_value_double(value) }),
        ffi::SQLITE_TEXT => {
            let ptr = unsafe { ffi::sqlite3_value_text(value) };
            let len = unsafe { ffi::sqlite3_value_bytes(value) } as usize;
            let bytes = if ptr.is_null() {
                &[][..]
            } else {
                // SAFETY: the engine reports len valid bytes at ptr for
                // the duration of the callback.
                unsafe { std::slice::from_raw_parts(ptr, len) }
            };
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        ffi::SQLITE_BLOB => {
            let ptr = unsafe { ffi::sqlite3_value_blob(value) };
            let len = unsafe { ffi::sqlite3_value_bytes(value) } as usize;
            let bytes = if ptr.is_null() || len == 0 {
                Vec::new()
            } else {
                // SAFETY: as above.
                unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }.to_vec()
            };
            Value::Blob(bytes)
        }
        _ => Value::Null,
    }
}

/// Encode a scalar-function result. The variant is the tag; there is no
/// runtime shape inspection.
///
/// # Safety
///
/// `ctx` must be the context of the currently executing callback.
pub(crate) unsafe fn write_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
    match value {
        Value::Null => unsafe { ffi::sqlite3_result_null(ctx) },
        Value::Integer(i) => unsafe { ffi::sqlite3_result_int64(ctx, *i) },
        Value::Real(f) => unsafe { ffi::sqlite3_result_double(ctx, *f) },
        Value::Text(s) => unsafe {
            ffi::sqlite3_result_text(
                ctx,
                s.as_ptr().cast(),
                s.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        },
        Value::Blob(b) if b.is_empty() => unsafe { ffi::sqlite3_result_zeroblob(ctx, 0) },
        Value::Blob(b) => unsafe {
            ffi::sqlite3_result_blob(
                ctx,
                b.as_ptr().cast(),
                b.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_floats_become_integers() {
        assert_eq!(Value::from_f64(3.0), Value::Integer(3));
        assert_eq!(Value::from_f64(-0.0), Value::Integer(0));
        assert_eq!(Value::from_f64(3.5), Value::Real(3.5));
        assert!(matches!(Value::from_f64(f64::NAN), Value::Real(v) if v.is_nan()));
        assert!(matches!(Value::from_f64(1e300), Value::Real(_)));
    }

    #[test]
    fn booleans_coerce_to_integers() {
        assert_eq!(Value::from(true), Value::Integer(1));
        assert_eq!(Value::from(false), Value::Integer(0));
    }

    #[test]
    fn json_conversion_accepts_supported_shapes() {
        let term = serde_json::json!("fox");
        assert_eq!(Value::from_json(&term).expect("text"), Value::Text("fox".into()));
        let blob = serde_json::json!([1, 2, 255]);
        assert_eq!(
            Value::from_json(&blob).expect("blob"),
            Value::Blob(vec![1, 2, 255])
        );
        let nil = serde_json::json!(null);
        assert_eq!(Value::from_json(&nil).expect("null"), Value::Null);
    }

    #[test]
    fn json_conversion_rejects_unsupported_shapes() {
        let object = serde_json::json!({"k": 1});
        assert!(matches!(
            Value::from_json(&object),
            Err(crate::DbError::Binding(_))
        ));
        let mixed = serde_json::json!([1, "x"]);
        assert!(matches!(
            Value::from_json(&mixed),
            Err(crate::DbError::Binding(_))
        ));
        let wide = serde_json::json!([1, 256]);
        assert!(matches!(
            Value::from_json(&wide),
            Err(crate::DbError::Binding(_))
        ));
    }

    #[test]
    fn value_round_trips_through_json() {
        let values = vec![
            Value::Null,
            Value::Integer(42),
            Value::Real(1.25),
            Value::Text("hello".into()),
            Value::Blob(vec![0, 1, 2]),
        ];
        let encoded = serde_json::to_string(&values).expect("encode");
        let decoded: Vec<Value> = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, values);
    }

    #[test]
    fn params_from_json_picks_shape() {
        let positional = serde_json::json!([1, "a"]);
        assert!(matches!(
            Params::from_json(&positional).expect("positional"),
            Params::Positional(values) if values.len() == 2
        ));
        let named = serde_json::json!({"$a": 1});
        assert!(matches!(
            Params::from_json(&named).expect("named"),
            Params::Named(values) if values.len() == 1
        ));
        assert!(Params::from_json(&serde_json::json!("nope")).is_err());
    }
}
