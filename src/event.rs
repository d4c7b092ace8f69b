//! Per-thread queues of deferred notifications.
//!
//! Anything that must run "on the owning thread" (watcher completions,
//! callback delivery, name owner updates) is posted to that thread's
//! [`EventQueue`] and runs the next time the thread calls
//! [`EventQueue::process_events`]. Posting never runs the job in-line,
//! even when the poster is the owning thread.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use std::{
    cell::RefCell,
    fmt,
    thread::{self, ThreadId},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static LOCAL: (EventQueue, RefCell<UnboundedReceiver<Job>>) = {
        let (tx, rx) = unbounded();
        (EventQueue { tx, thread: thread::current().id() }, RefCell::new(rx))
    };
}

/// A handle to one thread's event queue. Cheap to clone and `Send`, so it
/// can be handed to whatever context completes the work.
#[derive(Clone)]
pub struct EventQueue {
    tx: UnboundedSender<Job>,
    thread: ThreadId,
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").field("thread", &self.thread).finish()
    }
}

impl EventQueue {
    /// The queue of the calling thread.
    pub fn current() -> EventQueue {
        LOCAL.with(|(q, _)| q.clone())
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// True if the calling thread owns this queue.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queue `f` to run on the owning thread. If that thread has exited the
    /// job is dropped.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.unbounded_send(Box::new(f)).is_err() {
            log::debug!("event queue of {:?} is gone, dropping event", self.thread);
        }
    }

    /// Run every job queued for the calling thread, including jobs queued
    /// by the jobs themselves. Returns the number of jobs run.
    pub fn process_events() -> usize {
        let mut n = 0;
        // the receiver borrow is released before each job runs, jobs may post
        while let Some(job) = LOCAL.with(|(_, rx)| rx.borrow_mut().try_next().ok().flatten()) {
            job();
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn post_is_deferred() {
        let hits = Arc::new(AtomicUsize::new(0));
        let q = EventQueue::current();
        let h = hits.clone();
        q.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(EventQueue::process_events(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(EventQueue::process_events(), 0);
    }

    #[test]
    fn jobs_may_post_jobs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        EventQueue::current().post(move || {
            let h2 = h.clone();
            EventQueue::current().post(move || {
                h2.fetch_add(10, Ordering::SeqCst);
            });
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(EventQueue::process_events(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn cross_thread_post() {
        let q = EventQueue::current();
        assert!(q.is_current());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        thread::spawn(move || {
            assert!(!q.is_current());
            q.post(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        EventQueue::process_events();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
