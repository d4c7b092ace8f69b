//! Method tables generated from introspection data.
//!
//! Introspection XML is parsed into plain [`InterfaceDescription`]s, which
//! are turned into an [`InterfaceMethodTable`]: method and signal
//! descriptors keyed by their normalized prototype, plus property
//! descriptors. Tables are cached per interface name in the connection's
//! [`InterfaceRegistry`], except for names in the reserved `local.`
//! namespace, which are regenerated on every request.

use crate::connection::{CallMode, Connection, INTROSPECTABLE_INTERFACE};
use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageType};
use crate::types::{TypeId, TypeRegistry};
use crate::validate;
use crate::xml;
use arcstr::ArcStr;
use fxhash::FxHashMap;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

pub const MERGED_INTERFACE: &str = "local.Merged";
pub const LOCAL_PREFIX: &str = "local.";
pub const NO_REPLY_ANNOTATION: &str = "org.freedesktop.DBus.Method.NoReply";
pub const TYPE_NAME_ANNOTATION: &str = "org.qtproject.QtDBus.QtTypeName";
pub const LEGACY_TYPE_NAME_ANNOTATION: &str = "com.trolltech.QtDBus.QtTypeName";

pub type Annotations = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgDescription {
    pub name: String,
    pub signature: String,
    pub annotations: Annotations,
}

/// A method, or a signal (which only has output arguments).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDescription {
    pub name: String,
    pub input_args: Vec<ArgDescription>,
    pub output_args: Vec<ArgDescription>,
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(PropertyAccess::Read),
            "write" => Some(PropertyAccess::Write),
            "readwrite" => Some(PropertyAccess::ReadWrite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescription {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescription {
    pub name: String,
    pub annotations: Annotations,
    pub methods: Vec<MethodDescription>,
    pub signals: Vec<MethodDescription>,
    pub properties: Vec<PropertyDescription>,
}

impl InterfaceDescription {
    /// Union of several interfaces under the name `local.Merged`. Where
    /// names collide the later interface wins.
    pub fn merge<'a>(ifaces: impl IntoIterator<Item = &'a InterfaceDescription>) -> Self {
        let mut merged = InterfaceDescription {
            name: MERGED_INTERFACE.to_string(),
            ..Default::default()
        };
        for iface in ifaces {
            merged
                .annotations
                .extend(iface.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged.methods.extend(iface.methods.iter().cloned());
            merged.signals.extend(iface.signals.iter().cloned());
            for p in &iface.properties {
                merged.properties.retain(|q| q.name != p.name);
                merged.properties.push(p.clone());
            }
        }
        merged
    }
}

fn annotations(list: &[&xml::Annotation]) -> Annotations {
    list.iter().map(|a| (a.name.clone(), a.value.clone())).collect()
}

fn arg(a: &xml::Arg) -> ArgDescription {
    ArgDescription {
        name: a.name.clone().unwrap_or_default(),
        signature: a.typ.clone(),
        annotations: a.annotations.iter().map(|a| (a.name.clone(), a.value.clone())).collect(),
    }
}

fn interface(i: &xml::Interface) -> InterfaceDescription {
    let methods = i
        .methods()
        .into_iter()
        .map(|m| {
            let (outs, ins): (Vec<&xml::Arg>, Vec<&xml::Arg>) =
                m.args().into_iter().partition(|a| a.is_output());
            MethodDescription {
                name: m.name.clone(),
                input_args: ins.into_iter().map(arg).collect(),
                output_args: outs.into_iter().map(arg).collect(),
                annotations: annotations(&m.annotations()),
            }
        })
        .collect();
    let signals = i
        .signals()
        .into_iter()
        .map(|s| MethodDescription {
            name: s.name.clone(),
            input_args: Vec::new(),
            output_args: s.args().into_iter().map(arg).collect(),
            annotations: annotations(&s.annotations()),
        })
        .collect();
    let properties = i
        .properties()
        .into_iter()
        .filter_map(|p| match PropertyAccess::parse(&p.access) {
            Some(access) => Some(PropertyDescription {
                name: p.name.clone(),
                signature: p.typ.clone(),
                access,
                annotations: p
                    .annotations
                    .iter()
                    .map(|a| (a.name.clone(), a.value.clone()))
                    .collect(),
            }),
            None => {
                log::warn!("property {}.{} has invalid access {:?}", i.name, p.name, p.access);
                None
            }
        })
        .collect();
    InterfaceDescription {
        name: i.name.clone(),
        annotations: annotations(&i.annotations()),
        methods,
        signals,
        properties,
    }
}

/// Parse an introspection document. A document that cannot be parsed is
/// treated as empty.
pub fn parse_interfaces(doc: &str) -> Vec<InterfaceDescription> {
    if doc.trim().is_empty() {
        return Vec::new();
    }
    match doc.parse::<xml::Node>() {
        Ok(node) => node.interfaces().into_iter().map(interface).collect(),
        Err(e) => {
            log::warn!("failed to parse introspection data: {}", e);
            Vec::new()
        }
    }
}

/// Canonical form of a prototype: whitespace is dropped, except a single
/// space between two identifier characters.
pub fn normalize_prototype(proto: &str) -> String {
    let ident = |c: char| c.is_alphanumeric() || c == '_';
    let mut out = String::with_capacity(proto.len());
    let mut pending_space = false;
    for c in proto.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && ident(c) && out.chars().last().map(ident).unwrap_or(false) {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTag {
    None,
    /// The method never replies, calls to it need not wait.
    NoReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: ArcStr,
    pub prototype: ArcStr,
    pub kind: MemberKind,
    pub tag: MethodTag,
    pub inputs: Vec<TypeId>,
    pub outputs: Vec<TypeId>,
    pub input_signature: String,
    pub output_signature: String,
    /// Input argument names followed by the names of outputs after the
    /// first.
    pub parameter_names: Vec<String>,
    /// Name of the type of the first output, empty if there is none.
    pub return_type: ArcStr,
}

impl MethodDescriptor {
    pub fn is_no_reply(&self) -> bool {
        self.tag == MethodTag::NoReply
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: ArcStr,
    pub signature: String,
    pub type_id: TypeId,
    pub readable: bool,
    pub writable: bool,
}

/// The generated description of one interface.
#[derive(Debug, Clone, Default)]
pub struct InterfaceMethodTable {
    interface: ArcStr,
    members: Vec<MethodDescriptor>,
    by_prototype: FxHashMap<ArcStr, usize>,
    properties: Vec<PropertyDescriptor>,
    by_property: FxHashMap<ArcStr, usize>,
}

impl InterfaceMethodTable {
    pub fn new(interface: &str) -> Self {
        InterfaceMethodTable {
            interface: ArcStr::from(interface),
            ..Default::default()
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.properties.is_empty()
    }

    fn insert(&mut self, desc: MethodDescriptor) {
        match self.by_prototype.get(&desc.prototype) {
            Some(i) => self.members[*i] = desc,
            None => {
                self.by_prototype.insert(desc.prototype.clone(), self.members.len());
                self.members.push(desc);
            }
        }
    }

    fn insert_property(&mut self, desc: PropertyDescriptor) {
        match self.by_property.get(&desc.name) {
            Some(i) => self.properties[*i] = desc,
            None => {
                self.by_property.insert(desc.name.clone(), self.properties.len());
                self.properties.push(desc);
            }
        }
    }

    /// Look up a member by prototype, e.g. `Frobnicate(String,i32)`.
    pub fn member(&self, prototype: &str) -> Option<&MethodDescriptor> {
        let key = normalize_prototype(prototype);
        self.by_prototype.get(key.as_str()).map(|i| &self.members[*i])
    }

    pub fn members(&self) -> &[MethodDescriptor] {
        &self.members
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.members.iter().filter(|m| m.kind == MemberKind::Method)
    }

    pub fn signals(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.members.iter().filter(|m| m.kind == MemberKind::Signal)
    }

    /// The first method called `name`, whatever its arguments.
    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods().find(|m| m.name == name)
    }

    pub fn find_signal(&self, name: &str) -> Option<&MethodDescriptor> {
        self.signals().find(|m| m.name == name)
    }

    /// True if some method called `name` is tagged as not replying.
    pub fn is_no_reply(&self, name: &str) -> bool {
        self.methods().any(|m| m.name == name && m.is_no_reply())
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.by_property.get(name).map(|i| &self.properties[*i])
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }
}

struct ResolvedType {
    id: TypeId,
    name: ArcStr,
}

fn lookup_annotation<'a>(
    own: Option<&'a Annotations>,
    member: &'a Annotations,
    suffix: &str,
) -> Option<&'a str> {
    for base in [TYPE_NAME_ANNOTATION, LEGACY_TYPE_NAME_ANNOTATION] {
        if let Some(v) = own.and_then(|a| a.get(base)) {
            if !v.is_empty() {
                return Some(v);
            }
        }
        let key = format!("{}{}", base, suffix);
        if let Some(v) = member.get(&key) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}

// Resolve a single complete signature to a type. Builtin types resolve by
// signature alone, anything else needs a type name annotation naming a
// registered type with that signature. None if the signature is not a
// single complete type.
fn resolve_type(
    types: &TypeRegistry,
    signature: &str,
    own: Option<&Annotations>,
    member: &Annotations,
    suffix: &str,
) -> Option<ResolvedType> {
    if !validate::is_valid_single_signature(signature) {
        return None;
    }
    let id = types.builtin_for_signature(signature).or_else(|| {
        let name = lookup_annotation(own, member, suffix)?;
        let id = types.by_name(name)?;
        // a named type must marshal to the same signature
        (types.signature(id)?.as_str() == signature).then_some(id)
    });
    let id = id.unwrap_or_else(|| types.opaque_type(signature));
    let name = types.name(id)?;
    Some(ResolvedType { id, name })
}

fn generate_member(
    types: &TypeRegistry,
    iface: &str,
    m: &MethodDescription,
    kind: MemberKind,
) -> Option<MethodDescriptor> {
    let mut desc = MethodDescriptor {
        name: ArcStr::from(m.name.as_str()),
        prototype: ArcStr::default(),
        kind,
        tag: MethodTag::None,
        inputs: Vec::new(),
        outputs: Vec::new(),
        input_signature: String::new(),
        output_signature: String::new(),
        parameter_names: Vec::new(),
        return_type: ArcStr::default(),
    };
    let mut params: Vec<String> = Vec::new();
    for (i, a) in m.input_args.iter().enumerate() {
        let suffix = format!(".In{}", i);
        let t = resolve_type(types, &a.signature, Some(&a.annotations), &m.annotations, &suffix)?;
        desc.inputs.push(t.id);
        desc.input_signature.push_str(&a.signature);
        desc.parameter_names.push(a.name.clone());
        params.push(t.name.to_string());
    }
    for (i, a) in m.output_args.iter().enumerate() {
        let suffix = format!(".Out{}", i);
        let t = resolve_type(types, &a.signature, Some(&a.annotations), &m.annotations, &suffix)?;
        match kind {
            // signal arguments are the signal's parameters
            MemberKind::Signal => {
                desc.outputs.push(t.id);
                desc.output_signature.push_str(&a.signature);
                desc.parameter_names.push(a.name.clone());
                params.push(t.name.to_string());
            }
            MemberKind::Method => {
                desc.outputs.push(t.id);
                desc.output_signature.push_str(&a.signature);
                if i == 0 {
                    desc.return_type = t.name;
                } else {
                    desc.parameter_names.push(a.name.clone());
                    params.push(format!("{}&", t.name));
                }
            }
        }
    }
    if kind == MemberKind::Method
        && m.annotations.get(NO_REPLY_ANNOTATION).map(|v| v == "true").unwrap_or(false)
    {
        desc.tag = MethodTag::NoReply;
    }
    let proto = normalize_prototype(&format!("{}({})", m.name, params.join(",")));
    log::debug!("{}: generated {:?} {}", iface, kind, proto);
    desc.prototype = ArcStr::from(proto);
    Some(desc)
}

/// Build the method table of one interface. Properties go first, then
/// signals, then methods, so a method replaces a signal with the same
/// prototype.
pub fn generate(types: &TypeRegistry, iface: &InterfaceDescription) -> InterfaceMethodTable {
    let mut table = InterfaceMethodTable::new(&iface.name);
    for p in &iface.properties {
        match resolve_type(types, &p.signature, None, &p.annotations, "") {
            Some(t) => table.insert_property(PropertyDescriptor {
                name: ArcStr::from(p.name.as_str()),
                signature: p.signature.clone(),
                type_id: t.id,
                readable: p.access != PropertyAccess::Write,
                writable: p.access != PropertyAccess::Read,
            }),
            None => log::warn!(
                "skipping property {}.{} with invalid signature {}",
                iface.name,
                p.name,
                p.signature
            ),
        }
    }
    for (members, kind) in [
        (&iface.signals, MemberKind::Signal),
        (&iface.methods, MemberKind::Method),
    ] {
        for m in members {
            match generate_member(types, &iface.name, m, kind) {
                Some(desc) => table.insert(desc),
                None => log::warn!(
                    "skipping {:?} {}.{} with an invalid argument signature",
                    kind,
                    iface.name,
                    m.name
                ),
            }
        }
    }
    table
}

/// The type registry and method table cache of one connection.
#[derive(Default)]
pub struct InterfaceRegistry {
    types: TypeRegistry,
    cache: Mutex<FxHashMap<String, Arc<InterfaceMethodTable>>>,
    generated: AtomicU64,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn cached(&self, interface: &str) -> Option<Arc<InterfaceMethodTable>> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(interface).cloned()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear()
    }

    /// Number of tables generated so far, cached or not.
    pub fn generation_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    fn generate_one(&self, iface: &InterfaceDescription) -> Arc<InterfaceMethodTable> {
        self.generated.fetch_add(1, Ordering::Relaxed);
        Arc::new(generate(&self.types, iface))
    }

    /// The method table of `interface` described by the document `doc`.
    pub fn table_from_xml(&self, interface: &str, doc: &str) -> Result<Arc<InterfaceMethodTable>> {
        self.table_for(interface, &parse_interfaces(doc))
    }

    /// The method table of `interface` among the parsed `ifaces`.
    ///
    /// Every named interface in `ifaces` is cached as a side effect, apart
    /// from `local.` ones. An empty `interface` merges all of them into a
    /// `local.Merged` table. An empty `ifaces` yields an empty table.
    pub fn table_for(
        &self,
        interface: &str,
        ifaces: &[InterfaceDescription],
    ) -> Result<Arc<InterfaceMethodTable>> {
        let mut found = None;
        for iface in ifaces {
            let cacheable = !iface.name.starts_with(LOCAL_PREFIX);
            let table = match cacheable.then(|| self.cached(&iface.name)).flatten() {
                Some(t) => t,
                None => {
                    let mut t = self.generate_one(iface);
                    if cacheable {
                        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                        // another thread may have won the race
                        t = cache.entry(iface.name.clone()).or_insert(t).clone();
                    }
                    t
                }
            };
            if !interface.is_empty() && iface.name == interface {
                found = Some(table);
            }
        }
        if let Some(t) = found {
            return Ok(t);
        }
        if ifaces.is_empty() {
            self.generated.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::new(InterfaceMethodTable::new(interface)));
        }
        if interface.is_empty() {
            return Ok(self.generate_one(&InterfaceDescription::merge(ifaces)));
        }
        Err(Error::new(
            ErrorKind::UnknownInterface,
            format!("Interface '{}' was not found", interface),
        ))
    }
}

/// Find the method table of `interface` on the remote object, asking it
/// for its introspection data unless the table is cached.
pub fn find_method_table(
    conn: &dyn Connection,
    service: &str,
    path: &str,
    interface: &str,
) -> Result<Arc<InterfaceMethodTable>> {
    let registry = conn.registry();
    if !interface.is_empty() {
        if let Some(t) = registry.cached(interface) {
            return Ok(t);
        }
    }
    let msg = Message::method_call(service, path, INTROSPECTABLE_INTERFACE, "Introspect");
    let reply = conn.call(msg, CallMode::Block, None);
    let doc = match reply.kind() {
        MessageType::Reply if reply.signature() == "s" => {
            reply.argument::<String>(0).unwrap_or_default()
        }
        MessageType::Reply => {
            return Err(Error::new(
                ErrorKind::InvalidSignature,
                format!(
                    "Introspect on {} {} replied with signature \"{}\"",
                    service,
                    path,
                    reply.signature()
                ),
            ))
        }
        MessageType::Error => {
            let e = Error::from(&reply);
            if e.kind() != ErrorKind::UnknownMethod {
                return Err(e);
            }
            log::debug!("{} {} is not introspectable", service, path);
            String::new()
        }
        _ => {
            return Err(Error::new(
                ErrorKind::Disconnected,
                "Not connected to D-Bus server",
            ))
        }
    };
    registry.table_from_xml(interface, &doc)
}
