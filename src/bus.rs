//! A [`Connection`] to a real bus through libdbus and dbus-tokio.
//!
//! The connection is driven by an IO task on the tokio runtime the bus
//! was opened from. Every method call runs as its own task on that
//! runtime and completes its [`PendingCall`] from there. Dropping the last
//! handle to a call aborts its task and forgets the reply.
//!
//! A [`BusConnection`] must be opened inside a tokio runtime. Blocking
//! calls park the calling thread, so from async code they belong in
//! `tokio::task::block_in_place` on a multi threaded runtime.

use crate::connection::{
    CallMode, Connection, SignalHandler, SignalRouter, SignalSubscription, SubscriptionId,
};
use crate::error::{Error, ErrorKind, Result};
use crate::introspect::InterfaceRegistry;
use crate::message::Message;
use crate::pending::{CallHandle, PendingCall};
use crate::value::{ObjectPath, Signature, UnixFd, Value};
use dbus::{
    arg::{
        messageitem::{MessageItem, MessageItemArray, MessageItemDict},
        ArgType, RefArg,
    },
    channel::{Channel, MatchingReceiver, Sender, Token},
    message::{MatchRule, MessageType as DMessageType},
    nonblock::{NonblockReply, SyncConnection},
    strings::{BusName, Interface, Member, Path as DPath, Signature as DSignature},
};
use dbus_tokio::connection::IOResource;
use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    prelude::*,
};
use fxhash::FxHashMap;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle};

const DISCONNECTED: &str = "Not connected to D-Bus server";

/// Used when a call has no timeout of its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

fn dbus_error(e: dbus::Error) -> Error {
    match e.name() {
        Some(name) => Error::with_name(name, e.message().unwrap_or("")),
        None => Error::new(ErrorKind::Failed, e.message().unwrap_or("")),
    }
}

fn invalid(kind: ErrorKind) -> impl Fn(String) -> Error {
    move |e| Error::new(kind, e)
}

fn to_item(v: &Value) -> Result<MessageItem> {
    let array_error = |e| Error::new(ErrorKind::InvalidArgs, format!("{:?}", e));
    Ok(match v {
        Value::Byte(x) => MessageItem::Byte(*x),
        Value::Bool(x) => MessageItem::Bool(*x),
        Value::Int16(x) => MessageItem::Int16(*x),
        Value::UInt16(x) => MessageItem::UInt16(*x),
        Value::Int32(x) => MessageItem::Int32(*x),
        Value::UInt32(x) => MessageItem::UInt32(*x),
        Value::Int64(x) => MessageItem::Int64(*x),
        Value::UInt64(x) => MessageItem::UInt64(*x),
        Value::Double(x) => MessageItem::Double(*x),
        Value::Str(s) => MessageItem::Str(s.clone()),
        Value::ObjectPath(p) => MessageItem::ObjectPath(
            DPath::new(p.as_str()).map_err(invalid(ErrorKind::InvalidObjectPath))?,
        ),
        Value::Signature(s) => MessageItem::Signature(
            DSignature::new(s.as_str()).map_err(invalid(ErrorKind::InvalidSignature))?,
        ),
        Value::UnixFd(_) => {
            return Err(Error::new(
                ErrorKind::NotSupported,
                "passing unix fds is not supported",
            ))
        }
        Value::Array { element, items } => {
            let items = items.iter().map(to_item).collect::<Result<Vec<_>>>()?;
            let sig = DSignature::new(format!("a{}", element))
                .map_err(invalid(ErrorKind::InvalidSignature))?;
            MessageItem::Array(MessageItemArray::new(items, sig).map_err(array_error)?)
        }
        Value::Struct(fields) => {
            MessageItem::Struct(fields.iter().map(to_item).collect::<Result<Vec<_>>>()?)
        }
        Value::Dict { key, value, entries } => {
            let entries = entries
                .iter()
                .map(|(k, v)| Ok((to_item(k)?, to_item(v)?)))
                .collect::<Result<Vec<_>>>()?;
            let k = DSignature::new(key.as_str()).map_err(invalid(ErrorKind::InvalidSignature))?;
            let v = DSignature::new(value.as_str()).map_err(invalid(ErrorKind::InvalidSignature))?;
            MessageItem::Dict(MessageItemDict::new(entries, k, v).map_err(array_error)?)
        }
        Value::Variant(inner) => MessageItem::Variant(Box::new(to_item(inner)?)),
        Value::Empty => {
            return Err(Error::new(ErrorKind::InvalidArgs, "cannot send an empty value"))
        }
    })
}

macro_rules! downcast {
    ($v:expr, $t:ty, $case:ident) => {
        $v.as_any()
            .downcast_ref::<$t>()
            .map(|x| Value::$case(*x))
            .unwrap_or(Value::Empty)
    };
}

fn from_refarg(v: &dyn RefArg) -> Value {
    let children = || -> Vec<Value> {
        v.as_iter()
            .map(|i| i.map(from_refarg).collect())
            .unwrap_or_default()
    };
    match v.arg_type() {
        ArgType::Byte => downcast!(v, u8, Byte),
        ArgType::Boolean => downcast!(v, bool, Bool),
        ArgType::Int16 => downcast!(v, i16, Int16),
        ArgType::UInt16 => downcast!(v, u16, UInt16),
        ArgType::Int32 => downcast!(v, i32, Int32),
        ArgType::UInt32 => downcast!(v, u32, UInt32),
        ArgType::Int64 => downcast!(v, i64, Int64),
        ArgType::UInt64 => downcast!(v, u64, UInt64),
        ArgType::Double => downcast!(v, f64, Double),
        ArgType::String => Value::Str(v.as_str().unwrap_or("").to_string()),
        ArgType::ObjectPath => v
            .as_str()
            .and_then(ObjectPath::new)
            .map(Value::ObjectPath)
            .unwrap_or(Value::Empty),
        ArgType::Signature => v
            .as_str()
            .and_then(Signature::new)
            .map(Value::Signature)
            .unwrap_or(Value::Empty),
        ArgType::UnixFd => {
            log::debug!("unix fd arguments are not passed through");
            Value::UnixFd(UnixFd::invalid())
        }
        ArgType::Variant => children()
            .into_iter()
            .next()
            .map(Value::variant)
            .unwrap_or(Value::Empty),
        ArgType::Struct | ArgType::DictEntry => Value::Struct(children()),
        ArgType::Array => {
            let sig = v.signature();
            let sig: &str = &sig;
            if sig.starts_with("a{") && sig.len() >= 4 {
                let mut entries = Vec::new();
                let mut it = children().into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    entries.push((k, v));
                }
                Value::Dict {
                    key: sig[2..3].to_string(),
                    value: sig[3..sig.len() - 1].to_string(),
                    entries,
                }
            } else {
                Value::Array {
                    element: sig.get(1..).unwrap_or("").to_string(),
                    items: children(),
                }
            }
        }
        ArgType::Invalid => Value::Empty,
    }
}

fn read_args(msg: &dbus::Message) -> Vec<Value> {
    let mut it = msg.iter_init();
    let mut args = Vec::new();
    while let Some(a) = it.get_refarg() {
        args.push(from_refarg(&*a));
        it.next();
    }
    args
}

fn to_dbus(msg: &Message) -> Result<dbus::Message> {
    let dest = BusName::new(msg.service()).map_err(invalid(ErrorKind::InvalidService))?;
    let path = DPath::new(msg.path()).map_err(invalid(ErrorKind::InvalidObjectPath))?;
    // libdbus method calls always carry an interface here
    let iface = Interface::new(msg.interface()).map_err(invalid(ErrorKind::InvalidInterface))?;
    let member = Member::new(msg.member()).map_err(invalid(ErrorKind::InvalidMember))?;
    let mut out = dbus::Message::new_method_call(dest, path, iface, member)
        .map_err(invalid(ErrorKind::Failed))?;
    let items = msg.arguments().iter().map(to_item).collect::<Result<Vec<_>>>()?;
    out.append_items(&items);
    out.set_no_reply(msg.no_reply());
    Ok(out)
}

fn from_dbus(msg: &dbus::Message) -> Message {
    let sender = msg.sender().map(|s| String::from(&*s)).unwrap_or_default();
    let path = msg.path().map(|p| String::from(&*p)).unwrap_or_default();
    let iface = msg.interface().map(|i| String::from(&*i)).unwrap_or_default();
    let member = msg.member().map(|m| String::from(&*m)).unwrap_or_default();
    let args = read_args(msg);
    let mut out = match msg.msg_type() {
        DMessageType::Signal => Message::signal(path, iface, member).with_sender(sender),
        DMessageType::MethodCall => {
            let dest = msg.destination().map(|d| String::from(&*d)).unwrap_or_default();
            Message::method_call(dest, path, iface, member)
        }
        DMessageType::MethodReturn => Message::reply(Vec::new()).with_sender(sender),
        DMessageType::Error => {
            let e = msg
                .duplicate()
                .ok()
                .and_then(|mut m| m.as_result().err().map(dbus_error))
                .unwrap_or_else(|| Error::new(ErrorKind::Failed, "malformed error reply"));
            return Message::error(&e).with_sender(sender);
        }
    };
    out.set_arguments(args);
    out
}

fn disconnected() -> Message {
    Message::error(&Error::new(ErrorKind::Disconnected, DISCONNECTED))
}

// forgets the reply callback of a call that ended early
struct ReplyGuard {
    conn: Arc<SyncConnection>,
    token: Token,
}

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        let _ = self.conn.cancel_reply(self.token);
    }
}

async fn method_call(
    conn: Arc<SyncConnection>,
    msg: Message,
    timeout: Option<Duration>,
) -> Message {
    let m = match to_dbus(&msg) {
        Ok(m) => m,
        Err(e) => return Message::error(&e),
    };
    let (tx, rx) = oneshot::channel();
    let token = match conn.send_with_reply(
        m,
        Box::new(move |reply: dbus::Message, _: &SyncConnection| {
            let _ = tx.send(reply);
        }),
    ) {
        Ok(token) => token,
        Err(()) => return disconnected(),
    };
    let _guard = ReplyGuard { conn, token };
    match tokio::time::timeout(timeout.unwrap_or(DEFAULT_TIMEOUT), rx).await {
        Ok(Ok(reply)) => from_dbus(&reply),
        Ok(Err(_)) => disconnected(),
        Err(_) => Message::error(&Error::new(
            ErrorKind::NoReply,
            "Did not receive a reply. The reply timeout expired.",
        )),
    }
}

/// The task running one call.
struct CallTask {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallHandle for CallTask {
    fn block(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = futures::executor::block_on(task) {
                if e.is_panic() {
                    log::warn!("call task panicked: {}", e);
                }
            }
        }
    }

    fn cancel(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

// Runs `reply` on the runtime and completes the returned call with its
// output. The task is aborted if the call is dropped first.
fn spawn_call<F>(rt: &Handle, reply: F) -> PendingCall
where
    F: Future<Output = Message> + Send + 'static,
{
    let (call, completer) = PendingCall::new();
    let task = rt.spawn(async move { completer.complete(reply.await) });
    call.set_handle(Arc::new(CallTask {
        task: Mutex::new(Some(task)),
    }));
    call
}

enum RuleUpdate {
    Add(String),
    Remove(String),
}

// applies match rule changes in the order they were made
async fn update_rules(conn: Arc<SyncConnection>, mut updates: UnboundedReceiver<RuleUpdate>) {
    while let Some(u) = updates.next().await {
        match u {
            RuleUpdate::Add(rule) => {
                if let Err(e) = conn.add_match_no_cb(&rule).await {
                    log::warn!("failed to add match rule {}: {}", rule, e);
                }
            }
            RuleUpdate::Remove(rule) => {
                if let Err(e) = conn.remove_match_no_cb(&rule).await {
                    log::warn!("failed to remove match rule {}: {}", rule, e);
                }
            }
        }
    }
}

fn runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| Error::new(ErrorKind::Failed, e.to_string()))
}

/// A bus connection backed by libdbus.
pub struct BusConnection {
    conn: Arc<SyncConnection>,
    rt: Handle,
    router: Arc<SignalRouter>,
    registry: InterfaceRegistry,
    // installed daemon match rules and how many subscriptions use each
    rules: Mutex<FxHashMap<String, usize>>,
    updates: UnboundedSender<RuleUpdate>,
    io: JoinHandle<()>,
}

impl BusConnection {
    /// Connect to the session bus. Must be called within a tokio runtime.
    pub fn session() -> Result<Self> {
        let rt = runtime()?;
        let (resource, conn) = {
            let _enter = rt.enter();
            dbus_tokio::connection::new_session_sync().map_err(dbus_error)?
        };
        BusConnection::new(rt, resource, conn)
    }

    /// Connect to the system bus. Must be called within a tokio runtime.
    pub fn system() -> Result<Self> {
        let rt = runtime()?;
        let (resource, conn) = {
            let _enter = rt.enter();
            dbus_tokio::connection::new_system_sync().map_err(dbus_error)?
        };
        BusConnection::new(rt, resource, conn)
    }

    fn new(
        rt: Handle,
        resource: IOResource<SyncConnection>,
        conn: Arc<SyncConnection>,
    ) -> Result<Self> {
        let io = rt.spawn(async move {
            let err = resource.await;
            log::warn!("lost the bus connection: {}", err);
        });
        let router = Arc::new(SignalRouter::new());
        let mut rule = MatchRule::new();
        rule.msg_type = Some(DMessageType::Signal);
        let r = router.clone();
        conn.start_receive(
            rule,
            Box::new(move |msg: dbus::Message, _: &SyncConnection| {
                r.deliver(&from_dbus(&msg));
                true
            }),
        );
        let (updates, rx) = mpsc::unbounded();
        rt.spawn(update_rules(conn.clone(), rx));
        log::debug!("connected to the bus as {}", &*conn.unique_name());
        Ok(BusConnection {
            conn,
            rt,
            router,
            registry: InterfaceRegistry::new(),
            rules: Mutex::new(FxHashMap::default()),
            updates,
            io,
        })
    }

    pub fn unique_name(&self) -> String {
        String::from(&*self.conn.unique_name())
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.io.abort();
    }
}

impl Connection for BusConnection {
    fn is_connected(&self) -> bool {
        let channel: &Channel = (*self.conn).as_ref();
        channel.is_connected()
    }

    fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    fn call(&self, msg: Message, mode: CallMode, timeout: Option<Duration>) -> Message {
        log::debug!("bus call {} ({:?})", msg, mode);
        match mode {
            CallMode::NoBlock => {
                let mut m = match to_dbus(&msg) {
                    Ok(m) => m,
                    Err(e) => return Message::error(&e),
                };
                m.set_no_reply(true);
                match self.conn.send(m) {
                    Ok(_) => Message::invalid(),
                    Err(()) => disconnected(),
                }
            }
            CallMode::Block | CallMode::AutoDetect => {
                let call = spawn_call(&self.rt, method_call(self.conn.clone(), msg, timeout));
                call.wait_for_finished();
                call.reply()
            }
        }
    }

    fn async_call(&self, msg: Message, timeout: Option<Duration>) -> PendingCall {
        spawn_call(&self.rt, method_call(self.conn.clone(), msg, timeout))
    }

    fn connect_signal(&self, sub: SignalSubscription, handler: SignalHandler) -> SubscriptionId {
        let rule = sub.match_rule();
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let n = rules.entry(rule.clone()).or_insert(0);
        if *n == 0 {
            let _ = self.updates.unbounded_send(RuleUpdate::Add(rule.clone()));
        }
        *n += 1;
        self.router.add(sub, handler)
    }

    fn disconnect_signal(&self, id: SubscriptionId) -> bool {
        let sub = match self.router.remove(id) {
            Some(sub) => sub,
            None => return false,
        };
        let rule = sub.match_rule();
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = rules.get_mut(&rule) {
            *n -= 1;
            if *n == 0 {
                rules.remove(&rule);
                let _ = self.updates.unbounded_send(RuleUpdate::Remove(rule));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn items_from_values() {
        let v = Value::Dict {
            key: "s".into(),
            value: "v".into(),
            entries: vec![("k".into(), Value::variant(Value::Int32(1)))],
        };
        let item = to_item(&v).unwrap();
        assert_eq!(&*item.signature(), "a{sv}");

        let empty = Value::Array {
            element: "(ii)".into(),
            items: vec![],
        };
        assert_eq!(&*to_item(&empty).unwrap().signature(), "a(ii)");
        assert!(to_item(&Value::UnixFd(UnixFd(3))).is_err());
        assert!(to_item(&Value::Empty).is_err());
    }

    #[test]
    fn message_round_trip() {
        let msg = Message::method_call("org.example.Foo", "/obj", "org.example.Iface", "Method")
            .with_argument("x")
            .with_argument(Value::Struct(vec![1u32.into(), 2.5f64.into()]))
            .with_argument(Value::Array {
                element: "s".into(),
                items: vec!["a".into(), "b".into()],
            });
        let m = to_dbus(&msg).unwrap();
        let back = from_dbus(&m);
        assert_eq!(back.kind(), MessageType::MethodCall);
        assert_eq!(back.member(), "Method");
        assert_eq!(back.arguments(), msg.arguments());
    }

    #[test]
    fn bad_names_are_refused() {
        let msg = Message::method_call("org.example.Foo", "not-a-path", "org.example.Iface", "M");
        assert_eq!(to_dbus(&msg).unwrap_err().kind(), ErrorKind::InvalidObjectPath);
    }

    struct Dropped(Arc<AtomicBool>);

    impl Drop for Dropped {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_a_call_aborts_its_task() {
        let gone = Arc::new(AtomicBool::new(false));
        let guard = Dropped(gone.clone());
        let call = spawn_call(&Handle::current(), async move {
            let _guard = guard;
            futures::future::pending::<Message>().await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!gone.load(Ordering::SeqCst));
        assert!(!call.is_finished());
        drop(call);
        for _ in 0..100 {
            if gone.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiting_joins_the_task() {
        let call = spawn_call(&Handle::current(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Message::reply(vec![1i32.into()])
        });
        let c = call.clone();
        tokio::task::block_in_place(move || c.wait_for_finished());
        assert!(call.is_valid());
        assert_eq!(call.argument::<i32>(0), Some(1));

        let call = spawn_call(&Handle::current(), async { Message::reply(vec![]) });
        assert_eq!(call.await.kind(), MessageType::Reply);
    }
}
