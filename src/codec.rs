//! Marshalling of values to and from the D-Bus wire format.
//!
//! [`Marshaller`] appends little endian, naturally aligned data to a buffer
//! while building the signature of what it wrote. [`Demarshaller`] walks a
//! buffer guided by its signature. Compound types are bracketed with
//! `begin_*`/`end_*` pairs on both sides; callers must pair them correctly,
//! a mismatch is a debug assertion.

use crate::validate;
use crate::value::{ObjectPath, Signature, UnixFd, Value, Variant};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Variants may nest without bound in a signature, so reading is capped.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("type mismatch: expected `{expected}', found `{found}'")]
    TypeMismatch { expected: String, found: String },
    #[error("unexpected end of data")]
    UnexpectedEnd,
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("invalid object path `{0}'")]
    InvalidObjectPath(String),
    #[error("invalid signature `{0}'")]
    InvalidSignature(String),
    #[error("invalid boolean value {0}")]
    InvalidBoolean(u32),
    #[error("values nested too deeply")]
    TooDeep,
}

pub type Result<T> = std::result::Result<T, CodecError>;

fn alignment(code: u8) -> usize {
    match code {
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// What kind of value comes next in a [`Demarshaller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Basic,
    Variant,
    Array,
    Structure,
    Map,
    MapEntry,
    Unknown,
}

#[derive(Debug)]
enum Open {
    Structure,
    Array { len_pos: usize, body: usize },
    Map { len_pos: usize, body: usize },
    MapEntry,
}

macro_rules! write_fixed {
    ($name:ident, $t:ty, $code:expr) => {
        pub fn $name(&mut self, v: $t) {
            self.sig($code);
            self.align(std::mem::size_of::<$t>());
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    };
}

#[derive(Debug, Default)]
pub struct Marshaller {
    buf: Vec<u8>,
    signature: String,
    open: Vec<Open>,
    // > 0 inside arrays and variants, whose signature is recorded up front
    silent: usize,
    // first failure, reported by finish
    error: Option<CodecError>,
}

impl Marshaller {
    pub fn new() -> Self {
        Self::default()
    }

    fn align(&mut self, n: usize) {
        while self.buf.len() % n != 0 {
            self.buf.push(0);
        }
    }

    fn sig(&mut self, s: &str) {
        if self.silent == 0 {
            self.signature.push_str(s);
        }
    }

    write_fixed!(write_u8, u8, "y");
    write_fixed!(write_i16, i16, "n");
    write_fixed!(write_u16, u16, "q");
    write_fixed!(write_i32, i32, "i");
    write_fixed!(write_u32, u32, "u");
    write_fixed!(write_i64, i64, "x");
    write_fixed!(write_u64, u64, "t");
    write_fixed!(write_f64, f64, "d");

    pub fn write_bool(&mut self, v: bool) {
        self.sig("b");
        self.align(4);
        self.buf.extend_from_slice(&(v as u32).to_le_bytes());
    }

    fn raw_string(&mut self, s: &str) {
        self.align(4);
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    // callers check the length against the signature limit
    fn raw_signature(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn write_str(&mut self, s: &str) {
        self.sig("s");
        self.raw_string(s);
    }

    pub fn write_object_path(&mut self, p: &ObjectPath) {
        self.sig("o");
        self.raw_string(p.as_str());
    }

    pub fn write_signature(&mut self, s: &Signature) {
        self.sig("g");
        self.raw_signature(s.as_str());
    }

    pub fn write_unix_fd(&mut self, fd: UnixFd) {
        self.sig("h");
        self.align(4);
        self.buf.extend_from_slice(&fd.0.to_le_bytes());
    }

    /// Write `v` wrapped in a variant. A value whose signature cannot be
    /// carried by a variant is not written, and `finish` fails.
    pub fn write_variant(&mut self, v: &Value) {
        let inner = v.signature();
        if !validate::is_valid_signature(&inner) {
            if self.error.is_none() {
                self.error = Some(CodecError::InvalidSignature(inner));
            }
            return;
        }
        self.sig("v");
        self.raw_signature(&inner);
        self.silent += 1;
        self.write_value(v);
        self.silent -= 1;
    }

    pub fn write_value(&mut self, v: &Value) {
        match v {
            Value::Byte(x) => self.write_u8(*x),
            Value::Bool(x) => self.write_bool(*x),
            Value::Int16(x) => self.write_i16(*x),
            Value::UInt16(x) => self.write_u16(*x),
            Value::Int32(x) => self.write_i32(*x),
            Value::UInt32(x) => self.write_u32(*x),
            Value::Int64(x) => self.write_i64(*x),
            Value::UInt64(x) => self.write_u64(*x),
            Value::Double(x) => self.write_f64(*x),
            Value::Str(s) => self.write_str(s),
            Value::ObjectPath(p) => self.write_object_path(p),
            Value::Signature(s) => self.write_signature(s),
            Value::UnixFd(fd) => self.write_unix_fd(*fd),
            Value::Array { element, items } => {
                self.begin_array(element);
                for item in items {
                    self.write_value(item);
                }
                self.end_array();
            }
            Value::Struct(fields) => {
                self.begin_structure();
                for f in fields {
                    self.write_value(f);
                }
                self.end_structure();
            }
            Value::Dict { key, value, entries } => {
                self.begin_map(key, value);
                for (k, v) in entries {
                    self.begin_map_entry();
                    self.write_value(k);
                    self.write_value(v);
                    self.end_map_entry();
                }
                self.end_map();
            }
            Value::Variant(inner) => self.write_variant(inner),
            Value::Empty => (),
        }
    }

    pub fn begin_structure(&mut self) {
        self.sig("(");
        self.align(8);
        self.open.push(Open::Structure);
    }

    pub fn end_structure(&mut self) {
        match self.open.pop() {
            Some(Open::Structure) => self.sig(")"),
            other => debug_assert!(false, "end_structure closes {:?}", other),
        }
    }

    /// Start an array whose elements have the signature `element`.
    pub fn begin_array(&mut self, element: &str) {
        self.sig(&format!("a{}", element));
        self.align(4);
        let len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.align(alignment(element.as_bytes().first().copied().unwrap_or(b'y')));
        let body = self.buf.len();
        self.open.push(Open::Array { len_pos, body });
        self.silent += 1;
    }

    fn patch_len(&mut self, len_pos: usize, body: usize) {
        let len = (self.buf.len() - body) as u32;
        self.buf[len_pos..len_pos + 4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn end_array(&mut self) {
        match self.open.pop() {
            Some(Open::Array { len_pos, body }) => {
                self.patch_len(len_pos, body);
                self.silent -= 1;
            }
            other => debug_assert!(false, "end_array closes {:?}", other),
        }
    }

    pub fn begin_map(&mut self, key: &str, value: &str) {
        debug_assert!(
            key.len() == 1 && validate::is_basic_type(key.as_bytes()[0]),
            "map key `{}' is not a basic type",
            key
        );
        self.sig(&format!("a{{{}{}}}", key, value));
        self.align(4);
        let len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.align(8);
        let body = self.buf.len();
        self.open.push(Open::Map { len_pos, body });
        self.silent += 1;
    }

    pub fn end_map(&mut self) {
        match self.open.pop() {
            Some(Open::Map { len_pos, body }) => {
                self.patch_len(len_pos, body);
                self.silent -= 1;
            }
            other => debug_assert!(false, "end_map closes {:?}", other),
        }
    }

    pub fn begin_map_entry(&mut self) {
        self.align(8);
        self.open.push(Open::MapEntry);
    }

    pub fn end_map_entry(&mut self) {
        match self.open.pop() {
            Some(Open::MapEntry) => (),
            other => debug_assert!(false, "end_map_entry closes {:?}", other),
        }
    }

    /// The signature of everything written so far.
    pub fn current_signature(&self) -> &str {
        &self.signature
    }

    pub fn error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }

    pub fn finish(self) -> Result<Argument> {
        debug_assert!(self.open.is_empty(), "unterminated {:?}", self.open);
        match self.error {
            Some(e) => Err(e),
            None => Ok(Argument {
                signature: self.signature,
                data: self.buf,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Top,
    Structure,
    Array,
    Map,
    MapEntry,
    Variant,
}

#[derive(Debug)]
struct Scope {
    sig: String,
    pos: usize,
    kind: ScopeKind,
    // byte offset where an array or map body ends
    end: usize,
}

macro_rules! read_fixed {
    ($name:ident, $t:ty, $code:expr) => {
        pub fn $name(&mut self) -> Result<$t> {
            self.consume($code)?;
            self.align(std::mem::size_of::<$t>())?;
            let bytes = self.take(std::mem::size_of::<$t>())?;
            let mut raw = [0u8; std::mem::size_of::<$t>()];
            raw.copy_from_slice(bytes);
            Ok(<$t>::from_le_bytes(raw))
        }
    };
}

pub struct Demarshaller<'a> {
    buf: &'a [u8],
    pos: usize,
    scopes: Vec<Scope>,
    depth: usize,
}

impl<'a> Demarshaller<'a> {
    pub fn new(buf: &'a [u8], signature: &str) -> Self {
        Demarshaller {
            buf,
            pos: 0,
            scopes: vec![Scope {
                sig: signature.to_string(),
                pos: 0,
                kind: ScopeKind::Top,
                end: buf.len(),
            }],
            depth: 0,
        }
    }

    fn scope(&self) -> &Scope {
        // the top scope is never popped
        &self.scopes[self.scopes.len() - 1]
    }

    fn scope_mut(&mut self) -> &mut Scope {
        let n = self.scopes.len() - 1;
        &mut self.scopes[n]
    }

    /// True when the current compound scope has no more values.
    pub fn at_end(&self) -> bool {
        let s = self.scope();
        match s.kind {
            ScopeKind::Array | ScopeKind::Map => self.pos >= s.end,
            _ => s.pos >= s.sig.len(),
        }
    }

    /// The signature of the next value, without consuming it.
    pub fn current_signature(&self) -> &str {
        if self.at_end() {
            return "";
        }
        let s = self.scope();
        if matches!(s.kind, ScopeKind::Array | ScopeKind::Map) {
            // one element type, and `{..}` only parses after an `a`
            return &s.sig;
        }
        let rest = &s.sig[s.pos..];
        match validate::single_type_len(rest) {
            Some(n) => &rest[..n],
            None => "",
        }
    }

    pub fn current_type(&self) -> ElementType {
        let sig = self.current_signature().as_bytes();
        match sig.first() {
            None => ElementType::Unknown,
            Some(b'v') => ElementType::Variant,
            Some(b'a') if sig.get(1) == Some(&b'{') => ElementType::Map,
            Some(b'a') => ElementType::Array,
            Some(b'(') => ElementType::Structure,
            Some(b'{') => ElementType::MapEntry,
            Some(c) if validate::is_basic_type(*c) => ElementType::Basic,
            Some(_) => ElementType::Unknown,
        }
    }

    fn advance(&mut self, n: usize) {
        let s = self.scope_mut();
        s.pos += n;
        if matches!(s.kind, ScopeKind::Array | ScopeKind::Map) && s.pos >= s.sig.len() {
            s.pos = 0;
        }
    }

    fn mismatch(&self, expected: &str) -> CodecError {
        CodecError::TypeMismatch {
            expected: expected.to_string(),
            found: self.current_signature().to_string(),
        }
    }

    fn consume(&mut self, code: &str) -> Result<()> {
        if self.at_end() {
            return Err(CodecError::UnexpectedEnd);
        }
        if self.current_signature() != code {
            return Err(self.mismatch(code));
        }
        self.advance(code.len());
        Ok(())
    }

    fn align(&mut self, n: usize) -> Result<()> {
        let aligned = (self.pos + n - 1) / n * n;
        if aligned > self.buf.len() {
            return Err(CodecError::UnexpectedEnd);
        }
        self.pos = aligned;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let buf = self.buf;
        let end = self.pos.checked_add(n).ok_or(CodecError::UnexpectedEnd)?;
        let bytes = buf.get(self.pos..end).ok_or(CodecError::UnexpectedEnd)?;
        self.pos = end;
        Ok(bytes)
    }

    fn raw_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn raw_string(&mut self) -> Result<&'a str> {
        let len = self.raw_u32()? as usize;
        let bytes = self.take(len)?;
        self.take(1)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    fn raw_signature(&mut self) -> Result<&'a str> {
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?;
        self.take(1)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    read_fixed!(read_u8, u8, "y");
    read_fixed!(read_i16, i16, "n");
    read_fixed!(read_u16, u16, "q");
    read_fixed!(read_i32, i32, "i");
    read_fixed!(read_u32, u32, "u");
    read_fixed!(read_i64, i64, "x");
    read_fixed!(read_u64, u64, "t");
    read_fixed!(read_f64, f64, "d");

    pub fn read_bool(&mut self) -> Result<bool> {
        self.consume("b")?;
        match self.raw_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(CodecError::InvalidBoolean(n)),
        }
    }

    pub fn read_str(&mut self) -> Result<String> {
        self.consume("s")?;
        Ok(self.raw_string()?.to_string())
    }

    pub fn read_object_path(&mut self) -> Result<ObjectPath> {
        self.consume("o")?;
        let s = self.raw_string()?;
        ObjectPath::new(s).ok_or_else(|| CodecError::InvalidObjectPath(s.to_string()))
    }

    pub fn read_signature(&mut self) -> Result<Signature> {
        self.consume("g")?;
        let s = self.raw_signature()?;
        Signature::new(s).ok_or_else(|| CodecError::InvalidSignature(s.to_string()))
    }

    pub fn read_unix_fd(&mut self) -> Result<UnixFd> {
        self.consume("h")?;
        Ok(UnixFd(self.raw_u32()? as i32))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }
        Ok(())
    }

    fn leave(&mut self, kind: ScopeKind) -> Option<Scope> {
        if self.scopes.len() == 1 {
            debug_assert!(false, "closing {:?} at top level", kind);
            return None;
        }
        let scope = self.scopes.pop();
        debug_assert!(
            scope.as_ref().map(|s| s.kind) == Some(kind),
            "closing {:?} but {:?} is open",
            kind,
            scope.as_ref().map(|s| s.kind)
        );
        self.depth -= 1;
        scope
    }

    /// Read the value wrapped in a variant.
    pub fn read_variant(&mut self) -> Result<Value> {
        self.consume("v")?;
        let sig = self.raw_signature()?;
        if !validate::is_valid_single_signature(sig) {
            return Err(CodecError::InvalidSignature(sig.to_string()));
        }
        self.enter()?;
        self.scopes.push(Scope {
            sig: sig.to_string(),
            pos: 0,
            kind: ScopeKind::Variant,
            end: 0,
        });
        let v = self.read_value();
        self.leave(ScopeKind::Variant);
        v
    }

    pub fn begin_structure(&mut self) -> Result<()> {
        if self.current_type() != ElementType::Structure {
            return Err(self.mismatch("("));
        }
        let sig = self.current_signature().to_string();
        self.advance(sig.len());
        self.align(8)?;
        self.enter()?;
        self.scopes.push(Scope {
            sig: sig[1..sig.len() - 1].to_string(),
            pos: 0,
            kind: ScopeKind::Structure,
            end: 0,
        });
        Ok(())
    }

    /// Close a structure, skipping any fields left unread.
    pub fn end_structure(&mut self) -> Result<()> {
        while !self.at_end() {
            self.read_value()?;
        }
        self.leave(ScopeKind::Structure);
        Ok(())
    }

    fn open_container(&mut self, kind: ScopeKind) -> Result<()> {
        let sig = self.current_signature().to_string();
        self.advance(sig.len());
        let element = sig[1..].to_string();
        let len = self.raw_u32()? as usize;
        self.align(alignment(element.as_bytes()[0]))?;
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEnd);
        }
        self.enter()?;
        self.scopes.push(Scope {
            sig: element,
            pos: 0,
            kind,
            end,
        });
        Ok(())
    }

    pub fn begin_array(&mut self) -> Result<()> {
        if self.current_type() != ElementType::Array {
            return Err(self.mismatch("a"));
        }
        self.open_container(ScopeKind::Array)
    }

    pub fn end_array(&mut self) -> Result<()> {
        if let Some(s) = self.leave(ScopeKind::Array) {
            self.pos = s.end;
        }
        Ok(())
    }

    pub fn begin_map(&mut self) -> Result<()> {
        if self.current_type() != ElementType::Map {
            return Err(self.mismatch("a{"));
        }
        self.open_container(ScopeKind::Map)
    }

    pub fn end_map(&mut self) -> Result<()> {
        if let Some(s) = self.leave(ScopeKind::Map) {
            self.pos = s.end;
        }
        Ok(())
    }

    pub fn begin_map_entry(&mut self) -> Result<()> {
        if self.current_type() != ElementType::MapEntry {
            return Err(self.mismatch("{"));
        }
        let sig = self.current_signature().to_string();
        self.advance(sig.len());
        self.align(8)?;
        self.enter()?;
        self.scopes.push(Scope {
            sig: sig[1..sig.len() - 1].to_string(),
            pos: 0,
            kind: ScopeKind::MapEntry,
            end: 0,
        });
        Ok(())
    }

    pub fn end_map_entry(&mut self) -> Result<()> {
        while !self.at_end() {
            self.read_value()?;
        }
        self.leave(ScopeKind::MapEntry);
        Ok(())
    }

    /// Read the next value, whatever its type.
    pub fn read_value(&mut self) -> Result<Value> {
        if self.at_end() {
            return Err(CodecError::UnexpectedEnd);
        }
        let sig = self.current_signature().to_string();
        match self.current_type() {
            ElementType::Basic => match sig.as_bytes()[0] {
                b'y' => self.read_u8().map(Value::Byte),
                b'b' => self.read_bool().map(Value::Bool),
                b'n' => self.read_i16().map(Value::Int16),
                b'q' => self.read_u16().map(Value::UInt16),
                b'i' => self.read_i32().map(Value::Int32),
                b'u' => self.read_u32().map(Value::UInt32),
                b'x' => self.read_i64().map(Value::Int64),
                b't' => self.read_u64().map(Value::UInt64),
                b'd' => self.read_f64().map(Value::Double),
                b's' => self.read_str().map(Value::Str),
                b'o' => self.read_object_path().map(Value::ObjectPath),
                b'g' => self.read_signature().map(Value::Signature),
                _ => self.read_unix_fd().map(Value::UnixFd),
            },
            ElementType::Variant => Ok(Value::Variant(Box::new(self.read_variant()?))),
            ElementType::Array => {
                let element = sig[1..].to_string();
                self.begin_array()?;
                let mut items = Vec::new();
                while !self.at_end() {
                    items.push(self.read_value()?);
                }
                self.end_array()?;
                Ok(Value::Array { element, items })
            }
            ElementType::Map => {
                let key = sig[2..3].to_string();
                let value = sig[3..sig.len() - 1].to_string();
                self.begin_map()?;
                let mut entries = Vec::new();
                while !self.at_end() {
                    self.begin_map_entry()?;
                    let k = self.read_value()?;
                    let v = self.read_value()?;
                    self.end_map_entry()?;
                    entries.push((k, v));
                }
                self.end_map()?;
                Ok(Value::Dict { key, value, entries })
            }
            ElementType::Structure => {
                self.begin_structure()?;
                let mut fields = Vec::new();
                while !self.at_end() {
                    fields.push(self.read_value()?);
                }
                self.end_structure()?;
                Ok(Value::Struct(fields))
            }
            ElementType::MapEntry | ElementType::Unknown => Err(CodecError::InvalidSignature(sig)),
        }
    }
}

/// A marshalled sequence of values together with its signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Argument {
    signature: String,
    data: Vec<u8>,
}

impl Argument {
    pub fn from_parts(signature: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        let signature = signature.into();
        if !validate::is_valid_signature(&signature) {
            return Err(CodecError::InvalidSignature(signature));
        }
        Ok(Argument { signature, data })
    }

    pub fn from_value(v: &Value) -> Result<Self> {
        let mut m = Marshaller::new();
        m.write_value(v);
        m.finish()
    }

    pub fn from_values(vs: &[Value]) -> Result<Self> {
        let mut m = Marshaller::new();
        for v in vs {
            m.write_value(v);
        }
        m.finish()
    }

    pub fn marshal<T: DBusType>(v: &T) -> Result<Self> {
        let mut m = Marshaller::new();
        v.marshal(&mut m);
        m.finish()
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn reader(&self) -> Demarshaller<'_> {
        Demarshaller::new(&self.data, &self.signature)
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        let mut d = self.reader();
        let mut out = Vec::new();
        while !d.at_end() {
            out.push(d.read_value()?);
        }
        Ok(out)
    }

    pub fn demarshal<T: DBusType>(&self) -> Result<T> {
        T::demarshal(&mut self.reader())
    }
}

/// A Rust type with a static D-Bus signature.
pub trait DBusType: Sized {
    fn signature() -> String;
    fn marshal(&self, m: &mut Marshaller);
    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self>;
    fn to_value(&self) -> Value;

    /// Extract from a dynamic value of exactly this type.
    fn from_value(v: &Value) -> Option<Self> {
        if v.signature() != Self::signature() {
            return None;
        }
        Argument::from_value(v).ok()?.demarshal().ok()
    }
}

macro_rules! basic_type {
    ($t:ty, $sig:expr, $case:ident, $write:ident, $read:ident) => {
        impl DBusType for $t {
            fn signature() -> String {
                $sig.into()
            }

            fn marshal(&self, m: &mut Marshaller) {
                m.$write(*self)
            }

            fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
                d.$read()
            }

            fn to_value(&self) -> Value {
                Value::$case(*self)
            }

            fn from_value(v: &Value) -> Option<Self> {
                match v {
                    Value::$case(x) => Some(*x),
                    _ => None,
                }
            }
        }
    };
}

basic_type!(u8, "y", Byte, write_u8, read_u8);
basic_type!(bool, "b", Bool, write_bool, read_bool);
basic_type!(i16, "n", Int16, write_i16, read_i16);
basic_type!(u16, "q", UInt16, write_u16, read_u16);
basic_type!(i32, "i", Int32, write_i32, read_i32);
basic_type!(u32, "u", UInt32, write_u32, read_u32);
basic_type!(i64, "x", Int64, write_i64, read_i64);
basic_type!(u64, "t", UInt64, write_u64, read_u64);
basic_type!(f64, "d", Double, write_f64, read_f64);
basic_type!(UnixFd, "h", UnixFd, write_unix_fd, read_unix_fd);

impl DBusType for String {
    fn signature() -> String {
        "s".into()
    }

    fn marshal(&self, m: &mut Marshaller) {
        m.write_str(self)
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        d.read_str()
    }

    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl DBusType for ObjectPath {
    fn signature() -> String {
        "o".into()
    }

    fn marshal(&self, m: &mut Marshaller) {
        m.write_object_path(self)
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        d.read_object_path()
    }

    fn to_value(&self) -> Value {
        Value::ObjectPath(self.clone())
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::ObjectPath(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl DBusType for Signature {
    fn signature() -> String {
        "g".into()
    }

    fn marshal(&self, m: &mut Marshaller) {
        m.write_signature(self)
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        d.read_signature()
    }

    fn to_value(&self) -> Value {
        Value::Signature(self.clone())
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Signature(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl DBusType for Variant {
    fn signature() -> String {
        "v".into()
    }

    fn marshal(&self, m: &mut Marshaller) {
        m.write_variant(&self.0)
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        d.read_variant().map(Variant)
    }

    fn to_value(&self) -> Value {
        Value::Variant(Box::new(self.0.clone()))
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Variant(inner) => Some(Variant((**inner).clone())),
            _ => None,
        }
    }
}

impl<T: DBusType> DBusType for Vec<T> {
    fn signature() -> String {
        format!("a{}", T::signature())
    }

    fn marshal(&self, m: &mut Marshaller) {
        m.begin_array(&T::signature());
        for item in self {
            item.marshal(m);
        }
        m.end_array();
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        d.begin_array()?;
        let mut out = Vec::new();
        while !d.at_end() {
            out.push(T::demarshal(d)?);
        }
        d.end_array()?;
        Ok(out)
    }

    fn to_value(&self) -> Value {
        Value::Array {
            element: T::signature(),
            items: self.iter().map(|v| v.to_value()).collect(),
        }
    }
}

fn marshal_entries<'a, K, V, I>(m: &mut Marshaller, entries: I)
where
    K: DBusType + 'a,
    V: DBusType + 'a,
    I: Iterator<Item = (&'a K, &'a V)>,
{
    m.begin_map(&K::signature(), &V::signature());
    for (k, v) in entries {
        m.begin_map_entry();
        k.marshal(m);
        v.marshal(m);
        m.end_map_entry();
    }
    m.end_map();
}

fn demarshal_entries<K: DBusType, V: DBusType>(d: &mut Demarshaller<'_>) -> Result<Vec<(K, V)>> {
    d.begin_map()?;
    let mut out = Vec::new();
    while !d.at_end() {
        d.begin_map_entry()?;
        let k = K::demarshal(d)?;
        let v = V::demarshal(d)?;
        d.end_map_entry()?;
        out.push((k, v));
    }
    d.end_map()?;
    Ok(out)
}

fn entries_value<'a, K, V, I>(entries: I) -> Value
where
    K: DBusType + 'a,
    V: DBusType + 'a,
    I: Iterator<Item = (&'a K, &'a V)>,
{
    Value::Dict {
        key: K::signature(),
        value: V::signature(),
        entries: entries.map(|(k, v)| (k.to_value(), v.to_value())).collect(),
    }
}

impl<K: DBusType + Ord, V: DBusType> DBusType for BTreeMap<K, V> {
    fn signature() -> String {
        format!("a{{{}{}}}", K::signature(), V::signature())
    }

    fn marshal(&self, m: &mut Marshaller) {
        marshal_entries(m, self.iter())
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        Ok(demarshal_entries(d)?.into_iter().collect())
    }

    fn to_value(&self) -> Value {
        entries_value(self.iter())
    }
}

impl<K: DBusType + Eq + Hash, V: DBusType> DBusType for HashMap<K, V> {
    fn signature() -> String {
        format!("a{{{}{}}}", K::signature(), V::signature())
    }

    fn marshal(&self, m: &mut Marshaller) {
        marshal_entries(m, self.iter())
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        Ok(demarshal_entries(d)?.into_iter().collect())
    }

    fn to_value(&self) -> Value {
        entries_value(self.iter())
    }
}

/// A dictionary read as an ordered list of entries. Duplicate keys are kept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DictEntries<K, V>(pub Vec<(K, V)>);

impl<K: DBusType, V: DBusType> DBusType for DictEntries<K, V> {
    fn signature() -> String {
        format!("a{{{}{}}}", K::signature(), V::signature())
    }

    fn marshal(&self, m: &mut Marshaller) {
        marshal_entries(m, self.0.iter().map(|(k, v)| (k, v)))
    }

    fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
        demarshal_entries(d).map(DictEntries)
    }

    fn to_value(&self) -> Value {
        entries_value(self.0.iter().map(|(k, v)| (k, v)))
    }
}

macro_rules! struct_type {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: DBusType),+> DBusType for ($($name,)+) {
            fn signature() -> String {
                let mut s = String::from("(");
                $(s.push_str(&$name::signature());)+
                s.push(')');
                s
            }

            fn marshal(&self, m: &mut Marshaller) {
                let ($($name,)+) = self;
                m.begin_structure();
                $($name.marshal(m);)+
                m.end_structure();
            }

            fn demarshal(d: &mut Demarshaller<'_>) -> Result<Self> {
                d.begin_structure()?;
                let v = ($($name::demarshal(d)?,)+);
                d.end_structure()?;
                Ok(v)
            }

            fn to_value(&self) -> Value {
                let ($($name,)+) = self;
                Value::Struct(vec![$($name.to_value()),+])
            }
        }
    };
}

struct_type!(A);
struct_type!(A, B);
struct_type!(A, B, C);
struct_type!(A, B, C, D);
struct_type!(A, B, C, D, E);

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: DBusType + PartialEq + std::fmt::Debug>(v: T) {
        let arg = Argument::marshal(&v).unwrap();
        assert_eq!(arg.signature(), T::signature());
        assert_eq!(arg.demarshal::<T>().unwrap(), v);
        // and through the dynamic representation
        let values = arg.values().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], v.to_value());
        assert_eq!(T::from_value(&values[0]), Some(v));
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(0xabu8);
        round_trip(true);
        round_trip(-5i16);
        round_trip(65535u16);
        round_trip(i32::MIN);
        round_trip(u32::MAX);
        round_trip(-1i64 << 40);
        round_trip(u64::MAX);
        round_trip(3.25f64);
        round_trip(String::from("héllo"));
        round_trip(ObjectPath::new("/org/example").unwrap());
        round_trip(Signature::new("a{sv}").unwrap());
    }

    #[test]
    fn compound_round_trip() {
        round_trip(vec![1i32, 2, 3]);
        round_trip(Vec::<String>::new());
        round_trip((1u8, String::from("x"), 2.5f64));
        round_trip(vec![(1i32, vec![String::from("a")]), (2, vec![])]);
        let mut m = BTreeMap::new();
        m.insert(String::from("a"), Variant(Value::Int32(1)));
        m.insert(String::from("b"), Variant(Value::Str("x".into())));
        round_trip(m);
    }

    #[test]
    fn duplicate_keys_are_preserved() {
        let entries = DictEntries(vec![(1u32, String::from("a")), (1, String::from("b"))]);
        let arg = Argument::marshal(&entries).unwrap();
        assert_eq!(arg.signature(), "a{us}");
        let back: DictEntries<u32, String> = arg.demarshal().unwrap();
        assert_eq!(back, entries);
        // a map type collapses them
        let map: BTreeMap<u32, String> = arg.demarshal().unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn wire_layout() {
        let mut m = Marshaller::new();
        m.write_u8(1);
        m.write_i32(2);
        m.write_str("ab");
        let arg = m.finish().unwrap();
        assert_eq!(arg.signature(), "yis");
        assert_eq!(
            arg.data(),
            &[1, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0][..]
        );
    }

    #[test]
    fn empty_array_of_structs_pads_to_element_alignment() {
        let mut m = Marshaller::new();
        m.begin_array("(ii)");
        m.end_array();
        let arg = m.finish().unwrap();
        assert_eq!(arg.signature(), "a(ii)");
        assert_eq!(arg.data(), &[0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert_eq!(arg.demarshal::<Vec<(i32, i32)>>().unwrap(), vec![]);
    }

    #[test]
    fn builder_signature_tracking() {
        let mut m = Marshaller::new();
        m.begin_structure();
        m.write_str("k");
        m.begin_map("s", "v");
        m.begin_map_entry();
        m.write_str("x");
        m.write_variant(&Value::Array {
            element: "i".into(),
            items: vec![1.into()],
        });
        m.end_map_entry();
        m.end_map();
        m.end_structure();
        assert_eq!(m.current_signature(), "(sa{sv})");
    }

    #[test]
    fn reader_introspection() {
        let arg = Argument::from_values(&[
            Value::Int32(1),
            Value::Dict {
                key: "s".into(),
                value: "v".into(),
                entries: vec![],
            },
            Value::Struct(vec![Value::Byte(1)]),
            Value::variant(Value::Bool(true)),
            Value::Array {
                element: "s".into(),
                items: vec![],
            },
        ])
        .unwrap();
        let mut d = arg.reader();
        assert_eq!(d.current_type(), ElementType::Basic);
        assert_eq!(d.current_signature(), "i");
        assert_eq!(d.read_i32().unwrap(), 1);
        assert_eq!(d.current_type(), ElementType::Map);
        assert_eq!(d.current_signature(), "a{sv}");
        d.begin_map().unwrap();
        assert!(d.at_end());
        d.end_map().unwrap();
        assert_eq!(d.current_type(), ElementType::Structure);
        d.begin_structure().unwrap();
        assert_eq!(d.read_u8().unwrap(), 1);
        assert!(d.at_end());
        d.end_structure().unwrap();
        assert_eq!(d.current_type(), ElementType::Variant);
        assert_eq!(d.read_variant().unwrap(), Value::Bool(true));
        assert_eq!(d.current_type(), ElementType::Array);
        d.begin_array().unwrap();
        assert!(d.at_end());
        d.end_array().unwrap();
        assert!(d.at_end());
        assert_eq!(d.current_type(), ElementType::Unknown);
    }

    #[test]
    fn unread_struct_fields_are_skipped() {
        let arg = Argument::from_values(&[
            Value::Struct(vec![Value::Str("skip".into()), Value::Int64(9)]),
            Value::UInt16(7),
        ])
        .unwrap();
        let mut d = arg.reader();
        d.begin_structure().unwrap();
        d.end_structure().unwrap();
        assert_eq!(d.read_u16().unwrap(), 7);
    }

    #[test]
    fn type_mismatch() {
        let arg = Argument::marshal(&5i32).unwrap();
        let err = arg.demarshal::<String>().unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: "s".into(),
                found: "i".into()
            }
        );
        let err = Argument::marshal(&vec![1u8]).unwrap().demarshal::<Vec<u32>>().unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn truncated_data() {
        let arg = Argument::marshal(&String::from("hello")).unwrap();
        let short = Argument::from_parts("s", arg.data()[..6].to_vec()).unwrap();
        assert_eq!(short.demarshal::<String>().unwrap_err(), CodecError::UnexpectedEnd);
        assert!(Argument::from_parts("a{", vec![]).is_err());
    }

    #[test]
    fn bad_boolean() {
        let arg = Argument::from_parts("b", vec![2, 0, 0, 0]).unwrap();
        assert_eq!(arg.demarshal::<bool>().unwrap_err(), CodecError::InvalidBoolean(2));
    }

    #[test]
    fn nested_variants_are_bounded() {
        let mut v = Value::Int32(0);
        for _ in 0..(MAX_DEPTH + 1) {
            v = Value::variant(v);
        }
        let arg = Argument::from_value(&v).unwrap();
        assert_eq!(arg.values().unwrap_err(), CodecError::TooDeep);
    }

    #[test]
    fn oversized_variant_signatures_are_refused() {
        let wide = Value::Struct(vec![Value::Int32(0); 300]);
        let err = Argument::from_value(&Value::variant(wide.clone())).unwrap_err();
        assert!(matches!(err, CodecError::InvalidSignature(ref s) if s.len() == 302));

        let mut m = Marshaller::new();
        m.write_u8(1);
        m.write_variant(&wide);
        assert!(m.error().is_some());
        // nothing of the variant made it out
        assert_eq!(m.current_signature(), "y");
        assert!(m.finish().is_err());

        // the limit itself is fine
        let full = Value::Struct(vec![Value::Int32(0); 253]);
        let arg = Argument::from_value(&Value::variant(full.clone())).unwrap();
        assert_eq!(arg.values().unwrap(), vec![Value::variant(full)]);
    }
}
