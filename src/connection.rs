//! The connection contract consumed by remote interfaces.
//!
//! A [`Connection`] moves messages to and from the bus. The trait carries
//! default implementations for everything that can be expressed in terms
//! of its required methods, so a transport only has to provide blocking
//! and asynchronous calls plus signal subscriptions.

use crate::error::{Error, ErrorKind, Result};
use crate::event::EventQueue;
use crate::introspect::InterfaceRegistry;
use crate::message::{Message, MessageType};
use crate::pending::{PendingCall, ReplyCallback};
use crate::validate;
use std::{
    fmt::{self, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Connected to a bus daemon, names have owners.
    Bus,
    /// Direct peer to peer connection, no owner tracking.
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Send and return at once without waiting for a reply.
    NoBlock,
    /// Wait for the reply.
    Block,
    /// `NoBlock` for methods annotated as not replying, `Block` otherwise.
    /// Transports treat it as `Block`.
    AutoDetect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Called from the connection's dispatch context for every matching
/// signal.
pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Called with (name, old owner, new owner).
pub type OwnerChangedHandler = Arc<dyn Fn(&str, &str, &str) + Send + Sync + 'static>;

/// Which signals a subscription wants. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SignalSubscription {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub arg0: String,
}

impl SignalSubscription {
    pub fn new(
        sender: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        SignalSubscription {
            sender: sender.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            arg0: String::new(),
        }
    }

    pub fn with_arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = arg0.into();
        self
    }

    /// The subscription for owner changes of `service`.
    pub fn name_owner_changed(service: &str) -> Self {
        SignalSubscription::new(DBUS_SERVICE, "", DBUS_INTERFACE, NAME_OWNER_CHANGED)
            .with_arg0(service)
    }

    /// The bus daemon match rule selecting these signals.
    pub fn match_rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        for (key, val) in [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
            ("arg0", &self.arg0),
        ] {
            if !val.is_empty() {
                let _ = write!(rule, ",{}='{}'", key, val);
            }
        }
        rule
    }

    /// Local filtering of a received signal. A well-known sender name is
    /// left to the daemon's match rule, since messages carry the unique
    /// name of their sender.
    pub fn matches(&self, msg: &Message) -> bool {
        if msg.kind() != MessageType::Signal {
            return false;
        }
        let sender_ok = self.sender.is_empty()
            || self.sender == msg.service()
            || (!validate::is_valid_unique_connection_name(&self.sender)
                && self.sender != DBUS_SERVICE);
        let arg0_ok = self.arg0.is_empty()
            || msg.arguments().first().and_then(|a| a.as_str()) == Some(self.arg0.as_str());
        sender_ok
            && (self.path.is_empty() || self.path == msg.path())
            && (self.interface.is_empty() || self.interface == msg.interface())
            && (self.member.is_empty() || self.member == msg.member())
            && arg0_ok
    }
}

impl fmt::Display for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.match_rule())
    }
}

/// A table of signal subscriptions for transports to dispatch through.
#[derive(Default)]
pub struct SignalRouter {
    next: AtomicU64,
    subs: Mutex<Vec<(SubscriptionId, SignalSubscription, SignalHandler)>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sub: SignalSubscription, handler: SignalHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        log::debug!("subscribing {:?} to {}", id, sub);
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sub, handler));
        id
    }

    /// Remove a subscription, returning it if it existed.
    pub fn remove(&self, id: SubscriptionId) -> Option<SignalSubscription> {
        let mut subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
        let pos = subs.iter().position(|(i, _, _)| *i == id)?;
        Some(subs.remove(pos).1)
    }

    /// True if another subscription still uses exactly this filter.
    pub fn has_subscription(&self, sub: &SignalSubscription) -> bool {
        let subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
        subs.iter().any(|(_, s, _)| s == sub)
    }

    pub fn len(&self) -> usize {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler whose subscription matches `msg`. Returns the
    /// number of handlers run.
    pub fn deliver(&self, msg: &Message) -> usize {
        let handlers: Vec<SignalHandler> = {
            let subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
            subs.iter()
                .filter(|(_, s, _)| s.matches(msg))
                .map(|(_, _, h)| h.clone())
                .collect()
        };
        for h in &handlers {
            h(msg);
        }
        handlers.len()
    }
}

pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Bus
    }

    /// Per connection type registry and method table cache.
    fn registry(&self) -> &InterfaceRegistry;

    /// Send `msg`. Blocks for the reply unless `mode` is `NoBlock`, in
    /// which case the returned message is invalid. Failures come back as
    /// error messages.
    fn call(&self, msg: Message, mode: CallMode, timeout: Option<Duration>) -> Message;

    /// Send `msg` and return at once.
    fn async_call(&self, msg: Message, timeout: Option<Duration>) -> PendingCall;

    /// Send `msg` and deliver the outcome to `callback` on the calling
    /// thread's event queue. Returns false if the call could not be
    /// queued, in which case no handler runs.
    fn call_with_callback(
        &self,
        msg: Message,
        callback: ReplyCallback,
        timeout: Option<Duration>,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        let call = self.async_call(msg, timeout);
        if let Some(sig) = callback.expected_signature() {
            call.set_expected_signature(sig);
        }
        call.on_finished(move |call| callback.deliver(call.reply()));
        true
    }

    /// The unique name currently owning `name`. Unique names are their own
    /// owner; anything else is asked of the bus daemon.
    fn get_name_owner(&self, name: &str) -> Result<String> {
        if validate::is_valid_unique_connection_name(name) {
            return Ok(name.to_string());
        }
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "GetNameOwner")
            .with_argument(name);
        let reply = self.call(msg, CallMode::Block, None);
        match reply.kind() {
            MessageType::Reply => reply.argument::<String>(0).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidSignature,
                    format!("Unexpected reply signature `{}' to GetNameOwner", reply.signature()),
                )
            }),
            MessageType::Error => Err(Error::from(&reply)),
            _ => Err(Error::new(ErrorKind::Disconnected, "Not connected to D-Bus server")),
        }
    }

    fn connect_signal(&self, sub: SignalSubscription, handler: SignalHandler) -> SubscriptionId;

    fn disconnect_signal(&self, id: SubscriptionId) -> bool;

    /// Watch owner changes of `service`. The handler runs on the calling
    /// thread's event queue.
    fn connect_name_owner_changed(
        &self,
        service: &str,
        handler: OwnerChangedHandler,
    ) -> SubscriptionId {
        let queue = EventQueue::current();
        self.connect_signal(
            SignalSubscription::name_owner_changed(service),
            Arc::new(move |msg: &Message| {
                let (name, old, new) = match (
                    msg.argument::<String>(0),
                    msg.argument::<String>(1),
                    msg.argument::<String>(2),
                ) {
                    (Some(n), Some(o), Some(w)) => (n, o, w),
                    _ => {
                        log::warn!("malformed {} signal: {}", NAME_OWNER_CHANGED, msg);
                        return;
                    }
                };
                let handler = handler.clone();
                queue.post(move || handler(&name, &old, &new));
            }),
        )
    }

    fn disconnect_name_owner_changed(&self, id: SubscriptionId) -> bool {
        self.disconnect_signal(id)
    }
}
