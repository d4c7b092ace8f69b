//! The dynamically typed value container carried in message argument lists.

use crate::validate;
use std::fmt::{self, Write};

/// A validated object path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Option<Self> {
        let path = path.into();
        validate::is_valid_object_path(&path).then_some(ObjectPath(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated type signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn new(sig: impl Into<String>) -> Option<Self> {
        let sig = sig.into();
        validate::is_valid_signature(&sig).then_some(Signature(sig))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unix file descriptor slot. Negative numbers are "not valid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixFd(pub i32);

impl UnixFd {
    pub fn invalid() -> Self {
        UnixFd(-1)
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

/// A value that carries its own type on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant(pub Value);

/// Any value representable in the D-Bus type system.
///
/// Arrays and dictionaries carry their element signatures so that empty
/// containers keep their type.
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
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(UnixFd),
    Array { element: String, items: Vec<Value> },
    Struct(Vec<Value>),
    Dict { key: String, value: String, entries: Vec<(Value, Value)> },
    Variant(Box<Value>),
    /// No value at all. Marshals to nothing.
    Empty,
}

impl Value {
    /// The wire signature of this value, a single complete type.
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
            Value::Str(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::UnixFd(_) => "h".into(),
            Value::Array { element, .. } => format!("a{}", element),
            Value::Struct(fields) => {
                let mut s = String::from("(");
                for f in fields {
                    s.push_str(&f.signature());
                }
                s.push(')');
                s
            }
            Value::Dict { key, value, .. } => format!("a{{{}{}}}", key, value),
            Value::Variant(_) => "v".into(),
            Value::Empty => String::new(),
        }
    }

    /// A short human readable name of the value's wire type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix fd",
            Value::Array { .. } => "array",
            Value::Struct(_) => "struct",
            Value::Dict { .. } => "dict",
            Value::Variant(_) => "variant",
            Value::Empty => "invalid",
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Value::Array { .. } | Value::Struct(_) | Value::Dict { .. } | Value::Variant(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn variant(v: Value) -> Value {
        Value::Variant(Box::new(v))
    }
}

macro_rules! value_from {
    ($t:ty, $case:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$case(v)
            }
        }
    };
}

value_from!(u8, Byte);
value_from!(bool, Bool);
value_from!(i16, Int16);
value_from!(u16, UInt16);
value_from!(i32, Int32);
value_from!(u32, UInt32);
value_from!(i64, Int64);
value_from!(u64, UInt64);
value_from!(f64, Double);
value_from!(String, Str);
value_from!(ObjectPath, ObjectPath);
value_from!(Signature, Signature);
value_from!(UnixFd, UnixFd);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(Box::new(v.0))
    }
}

fn write_basic(out: &mut String, v: &Value) {
    // writing into a String cannot fail
    let _ = match v {
        Value::Byte(x) => write!(out, "{}", x),
        Value::Bool(x) => write!(out, "{}", x),
        Value::Int16(x) => write!(out, "{}", x),
        Value::UInt16(x) => write!(out, "{}", x),
        Value::Int32(x) => write!(out, "{}", x),
        Value::UInt32(x) => write!(out, "{}", x),
        Value::Int64(x) => write!(out, "{}", x),
        Value::UInt64(x) => write!(out, "{}", x),
        Value::Double(x) => write!(out, "{}", x),
        Value::Str(s) => write!(out, "\"{}\"", s),
        Value::ObjectPath(p) => write!(out, "[ObjectPath: {}]", p),
        Value::Signature(s) => write!(out, "[Signature: {}]", s),
        Value::UnixFd(fd) => write!(
            out,
            "[Unix FD: {}]",
            if fd.is_valid() { "valid" } else { "not valid" }
        ),
        _ => Ok(()),
    };
}

fn write_value(out: &mut String, v: &Value) {
    match v {
        Value::Array { items, .. } => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push('}');
        }
        Value::Dict { entries, .. } => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, k);
                out.push_str(" = ");
                write_value(out, v);
            }
            out.push('}');
        }
        Value::Struct(fields) => {
            out.push_str("[Argument: ");
            out.push_str(&v.signature());
            out.push(' ');
            for (i, f) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, f);
            }
            out.push(']');
        }
        Value::Variant(inner) => {
            out.push_str("[Variant(");
            out.push_str(inner.type_name());
            out.push_str("): ");
            write_value(out, inner);
            out.push(']');
        }
        basic => write_basic(out, basic),
    }
}

/// Render a value for debugging output.
pub fn argument_to_string(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v);
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&argument_to_string(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_of_compound_values() {
        let v = Value::Struct(vec![
            Value::Int32(1),
            Value::Array { element: "s".into(), items: vec![] },
            Value::Dict { key: "s".into(), value: "v".into(), entries: vec![] },
        ]);
        assert_eq!(v.signature(), "(iasa{sv})");
        assert_eq!(Value::variant(Value::Byte(1)).signature(), "v");
        assert_eq!(Value::Empty.signature(), "");
    }

    #[test]
    fn debug_rendering() {
        let arr = Value::Array {
            element: "i".into(),
            items: vec![1.into(), 2.into(), 3.into()],
        };
        assert_eq!(argument_to_string(&arr), "{1, 2, 3}");

        let path = Value::ObjectPath(ObjectPath::new("/obj").unwrap());
        assert_eq!(argument_to_string(&path), "[ObjectPath: /obj]");

        let sig = Value::Signature(Signature::new("a{sv}").unwrap());
        assert_eq!(argument_to_string(&sig), "[Signature: a{sv}]");

        assert_eq!(argument_to_string(&Value::UnixFd(UnixFd(3))), "[Unix FD: valid]");
        assert_eq!(argument_to_string(&Value::UnixFd(UnixFd::invalid())), "[Unix FD: not valid]");

        let var = Value::variant(Value::Int32(7));
        assert_eq!(argument_to_string(&var), "[Variant(int32): 7]");

        let dict = Value::Dict {
            key: "s".into(),
            value: "v".into(),
            entries: vec![("k".into(), Value::variant(true.into()))],
        };
        assert_eq!(argument_to_string(&dict), "{\"k\" = [Variant(boolean): true]}");

        let st = Value::Struct(vec![1.into(), "x".into()]);
        assert_eq!(argument_to_string(&st), "[Argument: (is) 1, \"x\"]");
    }

    #[test]
    fn newtypes_validate() {
        assert!(ObjectPath::new("relative").is_none());
        assert!(Signature::new("a{").is_none());
        assert!(Signature::new("").is_some());
    }
}
