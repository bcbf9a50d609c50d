//! Typed message arguments
//!
//! A [`Value`] is one argument of a message body. Encoding to and from the
//! wire format is the transport's business; the connection engine only
//! needs each value's type signature and, for argument matching, its
//! string form.

use bytes::Bytes;

/// One typed D-Bus argument
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    /// Index into the message's file-descriptor table
    UnixFd(u32),
    Variant(Box<Value>),
    /// `ay`, kept as a contiguous buffer
    ByteArray(Bytes),
    Array {
        /// Element signature, needed when the array is empty
        element: String,
        items: Vec<Value>,
    },
    Struct(Vec<Value>),
    Dict {
        key: String,
        value: String,
        entries: Vec<(Value, Value)>,
    },
}

impl Value {
    /// The value's complete type signature
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Bool(_) => "b".into(),
            Value::Int16(_) => "n".into(),
            Value::UInt16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::UInt32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::UInt64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::String(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::UnixFd(_) => "h".into(),
            Value::Variant(_) => "v".into(),
            Value::ByteArray(_) => "ay".into(),
            Value::Array { element, .. } => format!("a{}", element),
            Value::Struct(fields) => {
                let inner: String = fields.iter().map(Value::signature).collect();
                format!("({})", inner)
            }
            Value::Dict { key, value, .. } => format!("a{{{}{}}}", key, value),
        }
    }

    /// String contents of string-like values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if any
    pub fn into_inner(self) -> Value {
        match self {
            Value::Variant(inner) => *inner,
            other => other,
        }
    }

    /// Build a string array (`as`)
    pub fn string_array<I, S>(items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array {
            element: "s".into(),
            items: items.into_iter().map(|s| Value::String(s.into())).collect(),
        }
    }

    /// Wrap in a variant
    pub fn variant(value: impl Into<Value>) -> Value {
        Value::Variant(Box::new(value.into()))
    }
}

/// Concatenated signature of an argument list
pub fn signature_of(args: &[Value]) -> String {
    args.iter().map(Value::signature).collect()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::ByteArray(v)
    }
}
