//! An in-memory connection that records what it is asked to send and
//! answers from a script.
#![allow(dead_code)]

use dbus_remote::{
    connection::{
        CallMode, Connection, ConnectionMode, SignalHandler, SignalRouter, SignalSubscription,
        SubscriptionId, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE, NAME_OWNER_CHANGED,
    },
    error::{Error, ErrorKind, Result},
    introspect::InterfaceRegistry,
    message::Message,
    pending::{CallHandle, Completer, PendingCall},
};
use fxhash::FxHashMap;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

// the handle of a queued call, counting cancellations
struct Queued(Arc<AtomicUsize>);

impl CallHandle for Queued {
    fn cancel(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockConnection {
    connected: AtomicBool,
    peer: AtomicBool,
    registry: InterfaceRegistry,
    router: SignalRouter,
    owners: Mutex<FxHashMap<String, String>>,
    replies: Mutex<FxHashMap<String, Message>>,
    calls: Mutex<Vec<(Message, CallMode)>>,
    async_calls: Mutex<Vec<Message>>,
    pending: Mutex<Vec<(String, Completer)>>,
    cancelled: Arc<AtomicUsize>,
    // complete async calls from a helper thread instead of queueing them
    threaded: AtomicBool,
}

impl MockConnection {
    pub fn new() -> Self {
        MockConnection {
            connected: AtomicBool::new(true),
            peer: AtomicBool::new(false),
            registry: InterfaceRegistry::new(),
            router: SignalRouter::new(),
            owners: Mutex::new(FxHashMap::default()),
            replies: Mutex::new(FxHashMap::default()),
            calls: Mutex::new(Vec::new()),
            async_calls: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicUsize::new(0)),
            threaded: AtomicBool::new(false),
        }
    }

    /// A connection on which `service` is owned by `owner`.
    pub fn with_owner(service: &str, owner: &str) -> Self {
        let conn = MockConnection::new();
        lock(&conn.owners).insert(service.to_string(), owner.to_string());
        conn
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed)
    }

    pub fn set_peer(&self, peer: bool) {
        self.peer.store(peer, Ordering::Relaxed)
    }

    pub fn set_threaded(&self, threaded: bool) {
        self.threaded.store(threaded, Ordering::Relaxed)
    }

    /// Answer calls to `member` with `reply`.
    pub fn reply_to(&self, member: &str, reply: Message) {
        lock(&self.replies).insert(member.to_string(), reply);
    }

    fn scripted(&self, member: &str) -> Message {
        lock(&self.replies).get(member).cloned().unwrap_or_else(|| {
            Message::error(&Error::new(
                ErrorKind::UnknownMethod,
                format!("No such method '{}'", member),
            ))
        })
    }

    pub fn calls(&self) -> Vec<(Message, CallMode)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len() + lock(&self.async_calls).len()
    }

    pub fn async_calls(&self) -> Vec<Message> {
        lock(&self.async_calls).clone()
    }

    /// Number of queued asynchronous calls.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// How many queued calls were cancelled by their callers.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Complete every queued asynchronous call from the script.
    pub fn complete_all(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.pending));
        let n = pending.len();
        for (member, completer) in pending {
            completer.complete(self.scripted(&member));
        }
        n
    }

    /// Drop every queued asynchronous call without completing it.
    pub fn abandon_all(&self) {
        lock(&self.pending).clear()
    }

    /// Deliver `msg` to the matching subscriptions, as the bus would.
    pub fn emit(&self, msg: &Message) -> usize {
        self.router.deliver(msg)
    }

    pub fn subscriptions(&self) -> usize {
        self.router.len()
    }

    /// Change the owner of `service` and announce it.
    pub fn change_owner(&self, service: &str, new: &str) {
        let old = lock(&self.owners)
            .insert(service.to_string(), new.to_string())
            .unwrap_or_default();
        let sig = Message::signal(DBUS_PATH, DBUS_INTERFACE, NAME_OWNER_CHANGED)
            .with_sender(DBUS_SERVICE)
            .with_argument(service)
            .with_argument(old)
            .with_argument(new);
        self.emit(&sig);
    }
}

impl Connection for MockConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn mode(&self) -> ConnectionMode {
        if self.peer.load(Ordering::Relaxed) {
            ConnectionMode::Peer
        } else {
            ConnectionMode::Bus
        }
    }

    fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    fn call(&self, msg: Message, mode: CallMode, _timeout: Option<Duration>) -> Message {
        let member = msg.member().to_string();
        lock(&self.calls).push((msg, mode));
        match mode {
            CallMode::NoBlock => Message::invalid(),
            _ => self.scripted(&member),
        }
    }

    fn async_call(&self, msg: Message, _timeout: Option<Duration>) -> PendingCall {
        let member = msg.member().to_string();
        lock(&self.async_calls).push(msg);
        let (call, completer) = PendingCall::new();
        if self.threaded.load(Ordering::Relaxed) {
            let reply = self.scripted(&member);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                completer.complete(reply)
            });
        } else {
            call.set_handle(Arc::new(Queued(self.cancelled.clone())));
            lock(&self.pending).push((member, completer));
        }
        call
    }

    fn get_name_owner(&self, name: &str) -> Result<String> {
        match lock(&self.owners).get(name) {
            Some(owner) if !owner.is_empty() => Ok(owner.clone()),
            _ => Err(Error::with_name(
                "org.freedesktop.DBus.Error.NameHasNoOwner",
                format!("Could not get owner of name '{}': no such name", name),
            )),
        }
    }

    fn connect_signal(&self, sub: SignalSubscription, handler: SignalHandler) -> SubscriptionId {
        self.router.add(sub, handler)
    }

    fn disconnect_signal(&self, id: SubscriptionId) -> bool {
        self.router.remove(id).is_some()
    }
}
