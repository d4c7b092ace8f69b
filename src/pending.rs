//! In-flight asynchronous calls.
//!
//! A [`PendingCall`] is a cheap, clonable view of one shared call state.
//! The state starts out pending and becomes finished exactly once, when the
//! connection delivers the reply (or an error) through the call's
//! [`Completer`]. Dropping the last handle of a call that is still pending
//! cancels it.
//!
//! Watchers are never notified in-line. Completion, or attaching to a call
//! that already finished, posts the notification to the watcher's thread
//! [`EventQueue`].

use crate::codec::DBusType;
use crate::error::{Error, ErrorKind};
use crate::event::EventQueue;
use crate::message::{Message, MessageType};
use crate::value::Value;
use std::{
    fmt,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll, Waker},
    thread::ThreadId,
};

const DISCONNECTED: &str = "Not connected to D-Bus server";

/// The transport's side of one in-flight call.
pub trait CallHandle: Send + Sync {
    /// Drive the transport until this call has been completed. Transports
    /// that complete calls from their own dispatch context need not
    /// implement this; waiters then sleep until completion.
    fn block(&self) {}

    /// The call was dropped before it finished. Whatever completes it later
    /// will find nobody listening.
    fn cancel(&self) {}
}

type Handler = Box<dyn FnOnce(PendingCall) + Send + 'static>;

struct Watch {
    queue: EventQueue,
    // None for internal watches that live as long as the call
    alive: Option<Weak<()>>,
    handler: Handler,
}

struct State {
    reply: Message,
    expected: Option<String>,
    handle: Option<Arc<dyn CallHandle>>,
    // some thread is inside CallHandle::block
    waiting: bool,
    watches: Vec<Watch>,
    wakers: Vec<Waker>,
}

impl State {
    fn is_finished(&self) -> bool {
        self.reply.kind() != MessageType::Invalid
    }

    fn check_signature(&mut self) {
        let expected = match self.expected.as_deref() {
            Some(e) if !e.is_empty() => e,
            _ => return,
        };
        if self.reply.kind() != MessageType::Reply {
            return;
        }
        let got = self.reply.signature();
        if !got.starts_with(expected) {
            let msg = format!(
                "Unexpected reply signature: got \"{}\", expected \"{}\"",
                got, expected
            );
            log::debug!("{}", msg);
            self.reply = Message::error(&Error::new(ErrorKind::InvalidSignature, msg));
        }
    }
}

struct Shared {
    state: Mutex<State>,
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(self: &Arc<Self>, reply: Message) {
        let (watches, wakers) = {
            let mut st = self.lock();
            if st.is_finished() {
                log::debug!("ignoring second completion of a pending call");
                return;
            }
            st.reply = match reply.kind() {
                // an invalid message would leave the call pending forever
                MessageType::Invalid => Message::error(&Error::new(
                    ErrorKind::NoReply,
                    "Did not receive a reply",
                )),
                _ => reply,
            };
            st.check_signature();
            st.handle = None;
            self.finished.notify_all();
            (std::mem::take(&mut st.watches), std::mem::take(&mut st.wakers))
        };
        for w in wakers {
            w.wake();
        }
        dispatch(Some(Arc::downgrade(self)), watches);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !st.is_finished() {
            if let Some(handle) = st.handle.take() {
                log::debug!("cancelling pending call dropped before it finished");
                handle.cancel();
            }
        }
    }
}

// One queued notification per destination thread, running that thread's
// watchers in the order they were attached.
fn dispatch(shared: Option<Weak<Shared>>, watches: Vec<Watch>) {
    let mut by_thread: Vec<(ThreadId, EventQueue, Vec<Watch>)> = Vec::new();
    for w in watches {
        let id = w.queue.thread();
        match by_thread.iter_mut().find(|(t, _, _)| *t == id) {
            Some((_, _, ws)) => ws.push(w),
            None => by_thread.push((id, w.queue.clone(), vec![w])),
        }
    }
    for (_, queue, ws) in by_thread {
        let shared = shared.clone();
        queue.post(move || {
            for w in ws {
                let live = w.alive.as_ref().map(|a| a.strong_count() > 0).unwrap_or(true);
                if !live {
                    continue;
                }
                let call = match &shared {
                    None => PendingCall::null(),
                    Some(weak) => match weak.upgrade() {
                        Some(s) => PendingCall { shared: Some(s) },
                        None => continue,
                    },
                };
                (w.handler)(call);
            }
        });
    }
}

/// A handle to an asynchronous call. A null call (one built from an
/// invalid message) counts as finished.
#[derive(Clone)]
pub struct PendingCall {
    shared: Option<Arc<Shared>>,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Completes one pending call. Handed to the connection along with the
/// outgoing message. A completer dropped without completing fails the call
/// as disconnected.
pub struct Completer {
    shared: Option<Weak<Shared>>,
}

impl Completer {
    /// Deliver the reply. Does nothing if every handle to the call has been
    /// dropped in the meantime.
    pub fn complete(mut self, reply: Message) {
        if let Some(shared) = self.shared.take().and_then(|w| w.upgrade()) {
            shared.finish(reply);
        }
    }

    /// False once nobody holds the call any more.
    pub fn is_wanted(&self) -> bool {
        self.shared.as_ref().map(|w| w.strong_count() > 0).unwrap_or(false)
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take().and_then(|w| w.upgrade()) {
            shared.finish(Message::error(&Error::new(ErrorKind::Disconnected, DISCONNECTED)));
        }
    }
}

impl PendingCall {
    /// A new pending call and the completer that finishes it.
    pub fn new() -> (PendingCall, Completer) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                reply: Message::invalid(),
                expected: None,
                handle: None,
                waiting: false,
                watches: Vec::new(),
                wakers: Vec::new(),
            }),
            finished: Condvar::new(),
        });
        let completer = Completer {
            shared: Some(Arc::downgrade(&shared)),
        };
        (PendingCall { shared: Some(shared) }, completer)
    }

    fn null() -> PendingCall {
        PendingCall { shared: None }
    }

    /// An already finished call carrying `error`.
    pub fn from_error(error: &Error) -> PendingCall {
        PendingCall::from_completed_call(Message::error(error))
    }

    /// An already finished call carrying `msg`. Anything other than a reply
    /// or an error reply yields a null call.
    pub fn from_completed_call(msg: Message) -> PendingCall {
        match msg.kind() {
            MessageType::Reply | MessageType::Error => {
                let (call, completer) = PendingCall::new();
                completer.complete(msg);
                call
            }
            _ => PendingCall::null(),
        }
    }

    /// Attach the transport handle used for blocking waits and
    /// cancellation.
    pub fn set_handle(&self, handle: Arc<dyn CallHandle>) {
        if let Some(shared) = &self.shared {
            let mut st = shared.lock();
            if !st.is_finished() {
                st.handle = Some(handle);
            }
        }
    }

    pub fn expected_signature(&self) -> Option<String> {
        self.shared.as_ref().and_then(|s| s.lock().expected.clone())
    }

    /// Require the reply signature to start with `sig`. A reply that does
    /// not is turned into an `InvalidSignature` error, now if the call has
    /// already finished.
    pub fn set_expected_signature(&self, sig: &str) {
        if let Some(shared) = &self.shared {
            let mut st = shared.lock();
            st.expected = Some(sig.to_string());
            if st.is_finished() {
                st.check_signature();
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.shared {
            None => true,
            Some(s) => s.lock().is_finished(),
        }
    }

    /// The reply, or an invalid message while the call is pending.
    pub fn reply(&self) -> Message {
        match &self.shared {
            None => Message::invalid(),
            Some(s) => s.lock().reply.clone(),
        }
    }

    /// True if the call finished with a normal reply.
    pub fn is_valid(&self) -> bool {
        self.reply().kind() == MessageType::Reply
    }

    pub fn is_error(&self) -> bool {
        match &self.shared {
            None => true,
            Some(s) => s.lock().reply.kind() == MessageType::Error,
        }
    }

    pub fn error(&self) -> Error {
        match &self.shared {
            None => Error::new(ErrorKind::Disconnected, DISCONNECTED),
            Some(s) => Error::from(&s.lock().reply),
        }
    }

    pub fn argument_at(&self, i: usize) -> Option<Value> {
        self.shared
            .as_ref()
            .and_then(|s| s.lock().reply.arguments().get(i).cloned())
    }

    pub fn argument<T: DBusType>(&self, i: usize) -> Option<T> {
        self.argument_at(i).as_ref().and_then(T::from_value)
    }

    /// Block the calling thread until the call has finished. Safe from any
    /// thread; the first waiter drives the transport, later ones sleep
    /// until it is done.
    pub fn wait_for_finished(&self) {
        let shared = match &self.shared {
            None => return,
            Some(s) => s,
        };
        let mut st = shared.lock();
        if st.is_finished() {
            return;
        }
        if st.waiting {
            while !st.is_finished() {
                st = shared.finished.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
            return;
        }
        st.waiting = true;
        let handle = st.handle.clone();
        drop(st);
        if let Some(handle) = handle {
            handle.block();
        }
        let mut st = shared.lock();
        while !st.is_finished() {
            st = shared.finished.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st.waiting = false;
    }

    fn attach(&self, queue: EventQueue, alive: Option<Weak<()>>, handler: Handler) {
        let watch = Watch {
            queue,
            alive,
            handler,
        };
        match &self.shared {
            None => dispatch(None, vec![watch]),
            Some(shared) => {
                let mut st = shared.lock();
                if st.is_finished() {
                    drop(st);
                    dispatch(Some(Arc::downgrade(shared)), vec![watch]);
                } else {
                    st.watches.push(watch);
                }
            }
        }
    }

    /// Run `f` on the calling thread's event queue once the call has
    /// finished. The call is kept alive until then.
    pub fn on_finished<F>(&self, f: F)
    where
        F: FnOnce(PendingCall) + Send + 'static,
    {
        let keep = self.clone();
        self.attach(
            EventQueue::current(),
            None,
            Box::new(move |call| {
                drop(keep);
                f(call)
            }),
        )
    }
}

impl Future for PendingCall {
    type Output = Message;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Message> {
        let shared = match &self.shared {
            None => return Poll::Ready(Message::invalid()),
            Some(s) => s,
        };
        let mut st = shared.lock();
        if st.is_finished() {
            return Poll::Ready(st.reply.clone());
        }
        if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            st.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Watches a pending call and runs a handler on the thread that created
/// the watcher once the call has finished. Dropping the watcher before
/// then discards the notification.
pub struct PendingCallWatcher {
    call: PendingCall,
    _alive: Arc<()>,
}

impl PendingCallWatcher {
    pub fn new<F>(call: &PendingCall, handler: F) -> PendingCallWatcher
    where
        F: FnOnce(PendingCall) + Send + 'static,
    {
        let alive = Arc::new(());
        call.attach(
            EventQueue::current(),
            Some(Arc::downgrade(&alive)),
            Box::new(handler),
        );
        PendingCallWatcher {
            call: call.clone(),
            _alive: alive,
        }
    }
}

impl Deref for PendingCallWatcher {
    type Target = PendingCall;

    fn deref(&self) -> &PendingCall {
        &self.call
    }
}

/// Decoding of a reply's leading arguments into a typed tuple.
pub trait FromArguments: Sized {
    /// The concatenated signature of the tuple's fields.
    fn signature() -> String;
    fn from_arguments(args: &[Value]) -> Option<Self>;
}

impl FromArguments for () {
    fn signature() -> String {
        String::new()
    }

    fn from_arguments(_: &[Value]) -> Option<Self> {
        Some(())
    }
}

macro_rules! from_arguments {
    ($($t:ident: $i:tt),+) => {
        impl<$($t: DBusType),+> FromArguments for ($($t,)+) {
            fn signature() -> String {
                let mut s = String::new();
                $(s.push_str(&$t::signature());)+
                s
            }

            fn from_arguments(args: &[Value]) -> Option<Self> {
                Some(($($t::from_value(args.get($i)?)?,)+))
            }
        }
    };
}

from_arguments!(A: 0);
from_arguments!(A: 0, B: 1);
from_arguments!(A: 0, B: 1, C: 2);
from_arguments!(A: 0, B: 1, C: 2, D: 3);

/// Success and error handlers for a call made with a callback. Exactly one
/// of them runs.
pub struct ReplyCallback {
    expected: Option<String>,
    on_reply: Box<dyn FnOnce(Message) + Send + 'static>,
    on_error: Option<Box<dyn FnOnce(Error, Message) + Send + 'static>>,
}

impl ReplyCallback {
    /// A handler that takes the whole reply message, any signature.
    pub fn new<F>(f: F) -> ReplyCallback
    where
        F: FnOnce(Message) + Send + 'static,
    {
        ReplyCallback {
            expected: None,
            on_reply: Box::new(f),
            on_error: None,
        }
    }

    /// A handler taking the reply's leading arguments as `A`. The reply
    /// signature must start with `A::signature()`.
    pub fn typed<A, F>(f: F) -> ReplyCallback
    where
        A: FromArguments,
        F: FnOnce(A) + Send + 'static,
    {
        ReplyCallback {
            expected: Some(A::signature()),
            on_reply: Box::new(move |msg: Message| match A::from_arguments(msg.arguments()) {
                Some(a) => f(a),
                None => log::warn!("reply {} does not decode as the expected arguments", msg),
            }),
            on_error: None,
        }
    }

    pub fn on_error<F>(mut self, f: F) -> ReplyCallback
    where
        F: FnOnce(Error, Message) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn expected_signature(&self) -> Option<&str> {
        self.expected.as_deref()
    }

    /// Hand the finished reply to the matching handler.
    pub fn deliver(self, reply: Message) {
        match reply.kind() {
            MessageType::Reply => (self.on_reply)(reply),
            _ => {
                let error = match reply.kind() {
                    MessageType::Error => Error::from(&reply),
                    _ => Error::new(ErrorKind::Disconnected, DISCONNECTED),
                };
                match self.on_error {
                    Some(f) => f(error, reply),
                    None => log::debug!("unhandled error reply to callback: {}", error),
                }
            }
        }
    }
}
