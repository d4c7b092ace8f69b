//! The client side view of one remote object interface.
//!
//! An [`AbstractInterface`] binds a connection to a (service, path,
//! interface) triple. It validates the triple once at construction, tracks
//! the unique name currently owning the service, and issues blocking,
//! asynchronous and callback based calls plus property reads and writes.
//! The outcome of the last operation is kept as [`AbstractInterface::last_error`].

use crate::codec::DBusType;
use crate::connection::{
    CallMode, Connection, ConnectionMode, SignalHandler, SignalSubscription, SubscriptionId,
    DBUS_SERVICE, PROPERTIES_INTERFACE,
};
use crate::error::{Error, ErrorKind, Result};
use crate::event::EventQueue;
use crate::introspect::{self, InterfaceMethodTable, MemberKind, MethodDescriptor, PropertyDescriptor};
use crate::message::{Message, MessageType};
use crate::pending::{PendingCall, ReplyCallback};
use crate::validate::{self, AllowEmpty};
use crate::value::Value;
use fxhash::FxHashMap;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::{self, ThreadId},
    time::Duration,
};

const DISCONNECTED: &str = "Not connected to D-Bus server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Bound at runtime; needs a service (outside peer mode) and a path,
    /// the interface name may be empty.
    Dynamic,
    /// Backed by a fixed method table; needs an interface name, service
    /// and path may be left empty and supplied later.
    Generated,
}

/// Identifies one local handler connected with
/// [`AbstractInterface::connect_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalConnection(u64);

type LocalHandler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

struct RelayHandler {
    id: SignalConnection,
    signature: Option<String>,
    handler: LocalHandler,
}

// one subscription on the connection per remote signal, shared by every
// local handler of that signal
struct Relay {
    subscription: SubscriptionId,
    handlers: Vec<RelayHandler>,
}

struct Inner {
    conn: Arc<dyn Connection>,
    kind: InterfaceKind,
    service: String,
    path: String,
    interface: String,
    valid: bool,
    owner_thread: ThreadId,
    queue: EventQueue,
    last_error: Mutex<Error>,
    current_owner: Mutex<String>,
    timeout: Mutex<Option<Duration>>,
    table: Mutex<Option<Arc<InterfaceMethodTable>>>,
    relays: Mutex<FxHashMap<String, Relay>>,
    owner_watch: Mutex<Option<SubscriptionId>>,
    next_handler: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// the error a message stands for, never "no error" unless it is a reply
fn reply_error(reply: &Message) -> Error {
    match reply.kind() {
        MessageType::Reply => Error::none(),
        MessageType::Error => Error::from(reply),
        _ => Error::new(ErrorKind::Disconnected, DISCONNECTED),
    }
}

impl Inner {
    fn set_last_error(&self, e: Error) {
        *lock(&self.last_error) = e;
    }

    fn is_peer(&self) -> bool {
        self.conn.mode() == ConnectionMode::Peer
    }

    fn is_valid(&self) -> bool {
        if self.is_peer() {
            self.valid
        } else {
            !lock(&self.current_owner).is_empty()
        }
    }

    // service and path may be wildcards at construction, calls need them
    fn can_make_calls(&self) -> bool {
        let check = if self.service.is_empty() && !self.is_peer() {
            validate::check_bus_name(&self.service, AllowEmpty::EmptyNotAllowed)
        } else if self.path.is_empty() {
            validate::check_object_path(&self.path, AllowEmpty::EmptyNotAllowed)
        } else {
            Ok(())
        };
        match check {
            Ok(()) => true,
            Err(e) => {
                self.set_last_error(e);
                false
            }
        }
    }

    // the error to short circuit with when calls are not possible
    fn refusal(&self) -> Error {
        let e = lock(&self.last_error).clone();
        if e.is_error() {
            e
        } else {
            Error::new(
                ErrorKind::ServiceUnknown,
                format!("The name {} has no owner", self.service),
            )
        }
    }

    fn ready(&self) -> bool {
        self.is_valid() && self.can_make_calls()
    }

    fn method_call(&self, member: &str, args: Vec<Value>) -> Message {
        let mut msg = Message::method_call(&self.service, &self.path, &self.interface, member);
        msg.set_arguments(args);
        msg
    }

    fn timeout(&self) -> Option<Duration> {
        *lock(&self.timeout)
    }

    fn is_current_sender(&self, sender: &str) -> bool {
        sender.is_empty()
            || sender == self.service
            || self.service.is_empty()
            || *lock(&self.current_owner) == sender
    }

    // runs on the owner thread
    fn relay(&self, member: &str, msg: &Message) {
        if !self.is_current_sender(msg.service()) {
            return;
        }
        let handlers: Vec<LocalHandler> = {
            let relays = lock(&self.relays);
            match relays.get(member) {
                None => return,
                Some(r) => r
                    .handlers
                    .iter()
                    .filter(|h| match &h.signature {
                        None => true,
                        Some(sig) => msg.signature().starts_with(sig.as_str()),
                    })
                    .map(|h| h.handler.clone())
                    .collect(),
            }
        };
        for h in handlers {
            h(msg);
        }
    }
}

/// A remote interface.
///
/// The thread that creates the interface owns it: name owner updates and
/// signal relays are delivered on that thread's [`EventQueue`], and only
/// calls made from that thread update the last error.
pub struct AbstractInterface {
    inner: Arc<Inner>,
}

impl AbstractInterface {
    pub fn new(
        conn: Arc<dyn Connection>,
        service: &str,
        path: &str,
        interface: &str,
        kind: InterfaceKind,
    ) -> Self {
        let peer = conn.mode() == ConnectionMode::Peer;
        let dynamic = kind == InterfaceKind::Dynamic;
        let service_policy = if dynamic && !peer {
            AllowEmpty::EmptyNotAllowed
        } else {
            AllowEmpty::EmptyAllowed
        };
        let path_policy = if dynamic {
            AllowEmpty::EmptyNotAllowed
        } else {
            AllowEmpty::EmptyAllowed
        };
        let iface_policy = if dynamic {
            AllowEmpty::EmptyAllowed
        } else {
            AllowEmpty::EmptyNotAllowed
        };
        let checked = validate::check_bus_name(service, service_policy)
            .and_then(|()| validate::check_object_path(path, path_policy))
            .and_then(|()| validate::check_interface_name(interface, iface_policy))
            .and_then(|()| {
                if conn.is_connected() {
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::Disconnected, DISCONNECTED))
                }
            });
        let (valid, last_error) = match checked {
            Ok(()) => (true, Error::none()),
            Err(e) => {
                log::debug!("interface {} {} {} is not valid: {}", service, path, interface, e);
                (false, e)
            }
        };
        let inner = Arc::new(Inner {
            conn,
            kind,
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            valid,
            owner_thread: thread::current().id(),
            queue: EventQueue::current(),
            last_error: Mutex::new(last_error),
            current_owner: Mutex::new(String::new()),
            timeout: Mutex::new(None),
            table: Mutex::new(None),
            relays: Mutex::new(FxHashMap::default()),
            owner_watch: Mutex::new(None),
            next_handler: AtomicU64::new(0),
        });
        let iface = AbstractInterface { inner };
        iface.init_owner_tracking();
        iface
    }

    fn init_owner_tracking(&self) {
        let inner = &self.inner;
        if !inner.valid || inner.is_peer() || inner.service.is_empty() {
            return;
        }
        if inner.service == DBUS_SERVICE {
            // the bus driver is always there
            *lock(&inner.current_owner) = DBUS_SERVICE.to_string();
            return;
        }
        if validate::is_valid_unique_connection_name(&inner.service) {
            // a unique name is its own owner and never changes hands
            *lock(&inner.current_owner) = inner.service.clone();
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let id = inner.conn.connect_name_owner_changed(
            &inner.service,
            Arc::new(move |name: &str, _old: &str, new: &str| {
                if let Some(inner) = weak.upgrade() {
                    if name == inner.service {
                        log::debug!("owner of {} is now {:?}", name, new);
                        *lock(&inner.current_owner) = new.to_string();
                    }
                }
            }),
        );
        *lock(&inner.owner_watch) = Some(id);
        match inner.conn.get_name_owner(&inner.service) {
            Ok(owner) if !owner.is_empty() => *lock(&inner.current_owner) = owner,
            Ok(_) => inner.set_last_error(Error::new(
                ErrorKind::ServiceUnknown,
                format!("The name {} has no owner", inner.service),
            )),
            Err(e) => {
                log::debug!("no owner for {}: {}", inner.service, e);
                inner.set_last_error(e)
            }
        }
    }

    /// False if construction validation failed or, outside peer mode, the
    /// service currently has no owner.
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.conn
    }

    pub fn kind(&self) -> InterfaceKind {
        self.inner.kind
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    /// The unique name owning the service, empty if unknown.
    pub fn current_owner(&self) -> String {
        lock(&self.inner.current_owner).clone()
    }

    pub fn last_error(&self) -> Error {
        lock(&self.inner.last_error).clone()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    /// `None` uses the transport default.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *lock(&self.inner.timeout) = timeout;
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.inner.owner_thread
    }

    /// The method table used for call mode detection and dynamic
    /// dispatch, if one has been set or loaded.
    pub fn method_table(&self) -> Option<Arc<InterfaceMethodTable>> {
        lock(&self.inner.table).clone()
    }

    pub fn set_method_table(&self, table: Arc<InterfaceMethodTable>) {
        *lock(&self.inner.table) = Some(table);
    }

    /// Introspect the remote object and keep the resulting method table.
    pub fn load_method_table(&self) -> Result<Arc<InterfaceMethodTable>> {
        let inner = &self.inner;
        if !inner.ready() {
            return Err(inner.refusal());
        }
        let service = match lock(&inner.current_owner).clone() {
            owner if owner.is_empty() => inner.service.clone(),
            owner => owner,
        };
        match introspect::find_method_table(&*inner.conn, &service, &inner.path, &inner.interface) {
            Ok(table) => {
                self.set_method_table(table.clone());
                Ok(table)
            }
            Err(e) => {
                inner.set_last_error(e.clone());
                Err(e)
            }
        }
    }

    /// Call `method` with `args`, detecting the call mode from the method
    /// table.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Message {
        self.call_with_argument_list(CallMode::AutoDetect, method, args)
    }

    /// Call `method` with `args`. The reply always has at least one
    /// argument. Failures come back as error messages, without touching
    /// the connection when they are detected locally.
    ///
    /// Anything after the first `.` in `method` is ignored.
    pub fn call_with_argument_list(&self, mode: CallMode, method: &str, args: Vec<Value>) -> Message {
        let inner = &self.inner;
        if !inner.ready() {
            return Message::error(&inner.refusal());
        }
        let member = match method.find('.') {
            Some(pos) => &method[..pos],
            None => method,
        };
        let mode = match mode {
            CallMode::AutoDetect => match &*lock(&inner.table) {
                Some(t) if t.is_no_reply(member) => CallMode::NoBlock,
                _ => CallMode::Block,
            },
            mode => mode,
        };
        let msg = inner.method_call(member, args);
        log::debug!("calling {} ({:?})", msg, mode);
        let mut reply = inner.conn.call(msg, mode, inner.timeout());
        if thread::current().id() == inner.owner_thread {
            inner.set_last_error(Error::from(&reply));
        }
        if reply.arguments().is_empty() {
            reply.push_argument(Value::Empty);
        }
        reply
    }

    /// Start a call to `method` and return at once.
    pub fn async_call(&self, method: &str, args: Vec<Value>) -> PendingCall {
        let inner = &self.inner;
        if !inner.ready() {
            return PendingCall::from_error(&inner.refusal());
        }
        inner.conn.async_call(inner.method_call(method, args), inner.timeout())
    }

    /// Call `method`, delivering the outcome to `callback` on the calling
    /// thread's event queue. The last error is cleared and not updated by
    /// the outcome. Returns true if the call was queued.
    pub fn call_with_callback(&self, method: &str, args: Vec<Value>, callback: ReplyCallback) -> bool {
        let inner = &self.inner;
        if !inner.ready() {
            return false;
        }
        let msg = inner.method_call(method, args);
        inner.set_last_error(Error::none());
        inner.conn.call_with_callback(msg, callback, inner.timeout())
    }

    /// Call the method described by `desc` with `args`, checking the
    /// arguments against it first. Returns the return value followed by
    /// the other output arguments.
    ///
    /// # Panics
    ///
    /// If the reply lacks an output whose type is an unresolved
    /// placeholder, since no value of it can be made.
    pub fn invoke(&self, desc: &MethodDescriptor, args: Vec<Value>) -> Result<Vec<Value>> {
        let inner = &self.inner;
        let fail = |e: Error| {
            inner.set_last_error(e.clone());
            Err(e)
        };
        if desc.kind != MemberKind::Method {
            return fail(Error::new(
                ErrorKind::InvalidArgs,
                format!("{} is a signal and cannot be called", desc.prototype),
            ));
        }
        if args.len() != desc.inputs.len() {
            return fail(Error::new(
                ErrorKind::InvalidArgs,
                format!(
                    "{} expects {} arguments, got {}",
                    desc.prototype,
                    desc.inputs.len(),
                    args.len()
                ),
            ));
        }
        let sig: String = args.iter().map(|a| a.signature()).collect();
        if sig != desc.input_signature {
            return fail(Error::new(
                ErrorKind::InvalidArgs,
                format!(
                    "{} expects signature \"{}\", got \"{}\"",
                    desc.prototype, desc.input_signature, sig
                ),
            ));
        }
        let mode = if desc.is_no_reply() {
            CallMode::NoBlock
        } else {
            CallMode::Block
        };
        let reply = self.call_with_argument_list(mode, &desc.name, args);
        match reply.kind() {
            MessageType::Reply => (),
            MessageType::Invalid if mode == CallMode::NoBlock => return Ok(Vec::new()),
            _ => return Err(reply_error(&reply)),
        }
        let types = inner.conn.registry().types();
        let mut values = reply.into_arguments();
        values.retain(|v| *v != Value::Empty);
        values.truncate(desc.outputs.len());
        for (v, id) in values.iter().zip(&desc.outputs) {
            let want = types.signature(*id).unwrap_or_default();
            if v.signature() != want.as_str() {
                return fail(Error::new(
                    ErrorKind::InvalidSignature,
                    format!(
                        "Unexpected reply signature to {}: got \"{}\", expected \"{}\"",
                        desc.prototype,
                        v.signature(),
                        want
                    ),
                ));
            }
        }
        for id in &desc.outputs[values.len()..] {
            values.push(types.default_value(*id).unwrap_or(Value::Empty));
        }
        Ok(values)
    }

    // shared part of property reads: the unwrapped value of the Get reply
    fn get_property(&self, name: &str) -> Result<Value> {
        let inner = &self.inner;
        if !inner.valid || !inner.can_make_calls() {
            return Err(inner.refusal());
        }
        let msg = Message::method_call(&inner.service, &inner.path, PROPERTIES_INTERFACE, "Get")
            .with_argument(inner.interface.as_str())
            .with_argument(name);
        let reply = inner.conn.call(msg, CallMode::Block, inner.timeout());
        let fail = |e: Error| {
            inner.set_last_error(e.clone());
            Err(e)
        };
        if reply.kind() != MessageType::Reply {
            return fail(reply_error(&reply));
        }
        if reply.signature() != "v" {
            return fail(Error::new(
                ErrorKind::InvalidSignature,
                format!(
                    "Invalid signature `{}' in return from call to {}",
                    reply.signature(),
                    PROPERTIES_INTERFACE
                ),
            ));
        }
        match reply.into_arguments().into_iter().next() {
            Some(Value::Variant(v)) => Ok(*v),
            _ => fail(Error::new(ErrorKind::InvalidSignature, "Empty variant in property reply")),
        }
    }

    fn mismatch(&self, name: &str, found: &Value, expected_type: &str, expected_sig: &str) -> Error {
        let e = Error::new(
            ErrorKind::InvalidSignature,
            format!(
                "Unexpected `{}' ({}) when retrieving property `{}.{}' (expected type `{}' ({}))",
                found.type_name(),
                found.signature(),
                self.inner.interface,
                name,
                expected_type,
                expected_sig
            ),
        );
        self.inner.set_last_error(e.clone());
        e
    }

    /// Read property `name` as a `T`. The value must have exactly `T`'s
    /// signature, unless `T` is itself a variant, which accepts anything.
    pub fn property<T: DBusType>(&self, name: &str) -> Result<T> {
        let value = self.get_property(name)?;
        let expected = T::signature();
        let decoded = if expected == "v" {
            T::from_value(&Value::variant(value.clone()))
        } else {
            T::from_value(&value)
        };
        match decoded {
            Some(v) => {
                self.inner.set_last_error(Error::none());
                Ok(v)
            }
            None => {
                let types = self.inner.conn.registry().types();
                let tname = types
                    .for_signature(&expected)
                    .and_then(|id| types.name(id))
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| std::any::type_name::<T>().to_string());
                Err(self.mismatch(name, &value, &tname, &expected))
            }
        }
    }

    /// Read property `name` whatever its type.
    pub fn property_value(&self, name: &str) -> Result<Value> {
        let v = self.get_property(name)?;
        self.inner.set_last_error(Error::none());
        Ok(v)
    }

    /// Read the property described by `desc`.
    pub fn read_property(&self, desc: &PropertyDescriptor) -> Result<Value> {
        let types = self.inner.conn.registry().types();
        if types.is_opaque(desc.type_id) {
            return Err(self.unregistered(desc));
        }
        let value = self.get_property(&desc.name)?;
        if desc.signature != "v" && value.signature() != desc.signature {
            let tname = types.name(desc.type_id).unwrap_or_default();
            return Err(self.mismatch(&desc.name, &value, &tname, &desc.signature));
        }
        self.inner.set_last_error(Error::none());
        Ok(value)
    }

    fn unregistered(&self, desc: &PropertyDescriptor) -> Error {
        let types = self.inner.conn.registry().types();
        let tname = types.name(desc.type_id).unwrap_or_default();
        log::warn!(
            "type {} must be registered before it can be used for property {}.{}",
            tname,
            self.inner.interface,
            desc.name
        );
        let e = Error::new(
            ErrorKind::Failed,
            format!("Unregistered type {} cannot be handled", tname),
        );
        self.inner.set_last_error(e.clone());
        e
    }

    /// Write `value` to property `name`.
    pub fn set_property<T: DBusType>(&self, name: &str, value: &T) -> Result<()> {
        // a variant is sent as the property value itself, not nested
        let value = match value.to_value() {
            Value::Variant(inner) => *inner,
            v => v,
        };
        self.set_property_value(name, value)
    }

    pub fn set_property_value(&self, name: &str, value: Value) -> Result<()> {
        let inner = &self.inner;
        if !inner.valid || !inner.can_make_calls() {
            return Err(inner.refusal());
        }
        let msg = Message::method_call(&inner.service, &inner.path, PROPERTIES_INTERFACE, "Set")
            .with_argument(inner.interface.as_str())
            .with_argument(name)
            .with_argument(Value::variant(value));
        let reply = inner.conn.call(msg, CallMode::Block, inner.timeout());
        let e = reply_error(&reply);
        inner.set_last_error(e.clone());
        if e.is_error() {
            Err(e)
        } else {
            Ok(())
        }
    }

    /// Write the property described by `desc`.
    pub fn write_property(&self, desc: &PropertyDescriptor, value: Value) -> Result<()> {
        if self.inner.conn.registry().types().is_opaque(desc.type_id) {
            return Err(self.unregistered(desc));
        }
        if desc.signature != "v" && value.signature() != desc.signature {
            let e = Error::new(
                ErrorKind::InvalidSignature,
                format!(
                    "Property `{}.{}' has signature `{}', got `{}'",
                    self.inner.interface,
                    desc.name,
                    desc.signature,
                    value.signature()
                ),
            );
            self.inner.set_last_error(e.clone());
            return Err(e);
        }
        self.set_property_value(&desc.name, value)
    }

    /// Run `handler` on this interface's owner thread for every `member`
    /// signal the remote object emits. Connecting several handlers to one
    /// signal installs a single relay on the connection.
    pub fn connect_signal<F>(&self, member: &str, handler: F) -> Option<SignalConnection>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.connect_relay(member, None, Arc::new(handler))
    }

    /// Like `connect_signal`, for the signal described by `desc`. Only
    /// emissions carrying the signal's arguments are delivered.
    pub fn connect_member<F>(&self, desc: &MethodDescriptor, handler: F) -> Option<SignalConnection>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if desc.kind != MemberKind::Signal {
            return None;
        }
        self.connect_relay(&desc.name, Some(desc.output_signature.clone()), Arc::new(handler))
    }

    fn connect_relay(
        &self,
        member: &str,
        signature: Option<String>,
        handler: LocalHandler,
    ) -> Option<SignalConnection> {
        let inner = &self.inner;
        if !inner.valid || !validate::is_valid_member_name(member) {
            return None;
        }
        let id = SignalConnection(inner.next_handler.fetch_add(1, Ordering::Relaxed));
        let entry = RelayHandler {
            id,
            signature,
            handler,
        };
        let mut relays = lock(&inner.relays);
        if let Some(relay) = relays.get_mut(member) {
            relay.handlers.push(entry);
            return Some(id);
        }
        let weak = Arc::downgrade(inner);
        let queue = inner.queue.clone();
        let name = member.to_string();
        let relay: SignalHandler = Arc::new(move |msg: &Message| {
            let weak = weak.clone();
            let name = name.clone();
            let msg = msg.clone();
            queue.post(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.relay(&name, &msg)
                }
            });
        });
        let sub = SignalSubscription::new(&inner.service, &inner.path, &inner.interface, member);
        let subscription = inner.conn.connect_signal(sub, relay);
        relays.insert(
            member.to_string(),
            Relay {
                subscription,
                handlers: vec![entry],
            },
        );
        Some(id)
    }

    /// Disconnect a handler. The relay goes away with its last handler.
    pub fn disconnect_signal(&self, id: SignalConnection) -> bool {
        let inner = &self.inner;
        let mut relays = lock(&inner.relays);
        let member = relays
            .iter()
            .find(|(_, r)| r.handlers.iter().any(|h| h.id == id))
            .map(|(m, _)| m.clone());
        let member = match member {
            Some(m) => m,
            None => return false,
        };
        let empty = match relays.get_mut(&member) {
            Some(relay) => {
                relay.handlers.retain(|h| h.id != id);
                relay.handlers.is_empty()
            }
            None => false,
        };
        if empty {
            if let Some(relay) = relays.remove(&member) {
                inner.conn.disconnect_signal(relay.subscription);
            }
        }
        true
    }
}

impl Drop for AbstractInterface {
    fn drop(&mut self) {
        let inner = &self.inner;
        if let Some(id) = lock(&inner.owner_watch).take() {
            inner.conn.disconnect_name_owner_changed(id);
        }
        for (_, relay) in lock(&inner.relays).drain() {
            inner.conn.disconnect_signal(relay.subscription);
        }
    }
}
