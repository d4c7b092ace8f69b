//! Registry of the types method tables refer to.
//!
//! Each type is known by a numeric id, a name (used in method prototypes
//! and in type-name annotations) and its wire signature. Signatures that no
//! registered type covers get an opaque placeholder: it preserves the
//! signature's identity for bookkeeping but can never hold a value.

use crate::codec::DBusType;
use crate::validate;
use crate::value::{ObjectPath, Signature, UnixFd, Value};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Known,
    /// Placeholder for a signature nothing was registered for.
    Opaque,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: ArcStr,
    pub signature: ArcStr,
    pub kind: TypeKind,
}

const BUILTINS: &[(&str, &str)] = &[
    ("u8", "y"),
    ("bool", "b"),
    ("i16", "n"),
    ("u16", "q"),
    ("i32", "i"),
    ("u32", "u"),
    ("i64", "x"),
    ("u64", "t"),
    ("f64", "d"),
    ("String", "s"),
    ("ObjectPath", "o"),
    ("Signature", "g"),
    ("UnixFd", "h"),
    ("Variant", "v"),
    ("Vec<u8>", "ay"),
    ("Vec<String>", "as"),
    ("Vec<ObjectPath>", "ao"),
    ("Vec<Signature>", "ag"),
    ("Vec<Variant>", "av"),
    ("VariantMap", "a{sv}"),
];

#[derive(Default)]
struct Inner {
    types: Vec<TypeInfo>,
    by_signature: FxHashMap<ArcStr, TypeId>,
    by_name: FxHashMap<ArcStr, TypeId>,
    opaque: FxHashMap<ArcStr, TypeId>,
}

impl Inner {
    fn insert(&mut self, name: ArcStr, signature: ArcStr, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeInfo {
            id,
            name: name.clone(),
            signature: signature.clone(),
            kind: kind.clone(),
        });
        self.by_name.insert(name, id);
        match kind {
            TypeKind::Known => {
                self.by_signature.entry(signature).or_insert(id);
            }
            TypeKind::Opaque => {
                self.opaque.insert(signature, id);
            }
        }
        id
    }
}

pub struct TypeRegistry {
    inner: RwLock<Inner>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        for (name, sig) in BUILTINS {
            inner.insert(ArcStr::from(*name), ArcStr::from(*sig), TypeKind::Known);
        }
        TypeRegistry {
            inner: RwLock::new(inner),
        }
    }

    /// Register a type under `name` with an explicit signature. Returns the
    /// existing id if the name is taken, `None` if the signature is not a
    /// single complete type.
    pub fn register_signature(&self, name: &str, signature: &str) -> Option<TypeId> {
        if !validate::is_valid_single_signature(signature) {
            return None;
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.by_name.get(name) {
            return Some(*id);
        }
        Some(inner.insert(ArcStr::from(name), ArcStr::from(signature), TypeKind::Known))
    }

    pub fn register<T: DBusType>(&self, name: &str) -> TypeId {
        let sig = T::signature();
        // DBusType signatures are single complete types by construction
        self.register_signature(name, &sig)
            .unwrap_or_else(|| self.opaque_type(&sig))
    }

    /// The first known type registered for `signature`.
    pub fn for_signature(&self, signature: &str) -> Option<TypeId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_signature.get(signature).copied()
    }

    /// The builtin type with wire signature `signature`.
    pub fn builtin_for_signature(&self, signature: &str) -> Option<TypeId> {
        self.for_signature(signature)
            .filter(|id| (id.0 as usize) < BUILTINS.len())
    }

    pub fn by_name(&self, name: &str) -> Option<TypeId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.get(name).copied()
    }

    pub fn info(&self, id: TypeId) -> Option<TypeInfo> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.types.get(id.0 as usize).cloned()
    }

    pub fn name(&self, id: TypeId) -> Option<ArcStr> {
        self.info(id).map(|i| i.name)
    }

    pub fn signature(&self, id: TypeId) -> Option<ArcStr> {
        self.info(id).map(|i| i.signature)
    }

    pub fn is_opaque(&self, id: TypeId) -> bool {
        matches!(self.info(id), Some(TypeInfo { kind: TypeKind::Opaque, .. }))
    }

    /// The placeholder for `signature`, created on first use.
    pub fn opaque_type(&self, signature: &str) -> TypeId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.opaque.get(signature) {
            return *id;
        }
        log::debug!("registering placeholder type for signature {}", signature);
        let name = ArcStr::from(format!("Opaque<{}>", signature));
        inner.insert(name, ArcStr::from(signature), TypeKind::Opaque)
    }

    /// A default constructed value of type `id`.
    ///
    /// # Panics
    ///
    /// Placeholder types can never be instantiated; asking for a value of
    /// one is a contract violation.
    pub fn default_value(&self, id: TypeId) -> Option<Value> {
        let info = self.info(id)?;
        if info.kind == TypeKind::Opaque {
            panic!(
                "type {} stands in for the unresolved signature `{}' and cannot be instantiated",
                info.name, info.signature
            );
        }
        default_for_signature(&info.signature)
    }
}

fn default_for_signature(sig: &str) -> Option<Value> {
    let bytes = sig.as_bytes();
    Some(match *bytes.first()? {
        b'y' => Value::Byte(0),
        b'b' => Value::Bool(false),
        b'n' => Value::Int16(0),
        b'q' => Value::UInt16(0),
        b'i' => Value::Int32(0),
        b'u' => Value::UInt32(0),
        b'x' => Value::Int64(0),
        b't' => Value::UInt64(0),
        b'd' => Value::Double(0.),
        b's' => Value::Str(String::new()),
        b'o' => Value::ObjectPath(ObjectPath::new("/")?),
        b'g' => Value::Signature(Signature::new("")?),
        b'h' => Value::UnixFd(UnixFd::invalid()),
        b'v' => Value::variant(Value::Str(String::new())),
        b'a' if bytes.get(1) == Some(&b'{') => Value::Dict {
            key: sig[2..3].to_string(),
            value: sig[3..sig.len() - 1].to_string(),
            entries: Vec::new(),
        },
        b'a' => Value::Array {
            element: sig[1..].to_string(),
            items: Vec::new(),
        },
        b'(' => {
            let inner = validate::split_signature(&sig[1..sig.len() - 1])?;
            Value::Struct(
                inner
                    .into_iter()
                    .map(default_for_signature)
                    .collect::<Option<Vec<_>>>()?,
            )
        }
        _ => return None,
    })
}
