use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event_loop::EventLoop;
use crate::ready::Ready;
use crate::timestamp::Timestamp;

/// Poller bookkeeping states; a deleted channel that becomes interested
/// again is re-added without a lookup.
pub(crate) const STATE_NEW: i8 = -1;
pub(crate) const STATE_ADDED: i8 = 1;
pub(crate) const STATE_DELETED: i8 = 2;

struct Handlers {
    read: Option<Box<dyn FnMut(Timestamp) + Send>>,
    write: Option<Box<dyn FnMut() + Send>>,
    close: Option<Box<dyn FnMut() + Send>>,
    error: Option<Box<dyn FnMut() + Send>>,
}

/// The registration of one file descriptor within one [`EventLoop`].
///
/// A channel never owns its descriptor; it carries the interest mask, the
/// readiness last reported by the poller, and the callbacks dispatched for
/// each event class. A channel belongs to exactly one loop for its entire
/// life, and only that loop's thread may change its interest.
pub struct Channel {
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    self_weak: Weak<Channel>,
    events: AtomicU8,
    revents: AtomicU8,
    state: AtomicI8,
    event_handling: AtomicBool,
    handlers: Mutex<Handlers>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            fd,
            event_loop,
            self_weak: self_weak.clone(),
            events: AtomicU8::new(Ready::empty().bits()),
            revents: AtomicU8::new(Ready::empty().bits()),
            state: AtomicI8::new(STATE_NEW),
            event_handling: AtomicBool::new(false),
            handlers: Mutex::new(Handlers {
                read: None,
                write: None,
                close: None,
                error: None,
            }),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Ready {
        Ready::from_bits(self.events.load(Ordering::SeqCst))
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.revents.store(revents.bits(), Ordering::SeqCst);
    }

    pub fn is_none_event(&self) -> bool {
        self.events().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.events().is_writable()
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + Send + 'static) {
        self.handlers.lock().unwrap().read = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().write = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().close = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().error = Some(Box::new(cb));
    }

    /// Ties this channel to its owner. The owner is locked for the duration
    /// of event dispatch, so a callback can never outlive it; if the lock
    /// fails the event is skipped.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(&self) {
        self.modify_events(|ev| ev.insert(Ready::readable()));
    }

    pub fn disable_reading(&self) {
        self.modify_events(|ev| ev.remove(Ready::readable()));
    }

    pub fn enable_writing(&self) {
        self.modify_events(|ev| ev.insert(Ready::writable()));
    }

    pub fn disable_writing(&self) {
        self.modify_events(|ev| ev.remove(Ready::writable()));
    }

    pub fn disable_all(&self) {
        self.modify_events(|ev| *ev = Ready::empty());
    }

    /// Detaches the channel from its poller. Interest must already be fully
    /// disabled.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        if self.state.load(Ordering::SeqCst) == STATE_NEW {
            return;
        }
        if let (Some(event_loop), Some(channel)) =
            (self.event_loop.upgrade(), self.self_weak.upgrade())
        {
            event_loop.remove_channel(&channel);
        }
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.upgrade()
    }

    pub(crate) fn poller_state(&self) -> i8 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_poller_state(&self, state: i8) {
        self.state.store(state, Ordering::SeqCst);
    }

    fn modify_events(&self, f: impl FnOnce(&mut Ready)) {
        let mut ev = self.events();
        f(&mut ev);
        self.events.store(ev.bits(), Ordering::SeqCst);
        self.update();
    }

    fn update(&self) {
        if let (Some(event_loop), Some(channel)) =
            (self.event_loop.upgrade(), self.self_weak.upgrade())
        {
            event_loop.update_channel(&channel);
        }
    }

    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(owner) => {
                // hold the owner across dispatch; a dead owner means the
                // event is stale
                if let Some(_guard) = owner.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.event_handling.store(true, Ordering::SeqCst);
        let revents = Ready::from_bits(self.revents.load(Ordering::SeqCst));
        log::trace!("channel fd = {} handling {:?}", self.fd, revents);

        let mut handlers = self.handlers.lock().unwrap();

        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }

        if revents.is_error() {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }

        if revents.is_readable() {
            if let Some(cb) = handlers.read.as_mut() {
                cb(receive_time);
            }
        }

        if revents.is_writable() {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }

        self.event_handling.store(false, Ordering::SeqCst);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::SeqCst));
    }
}
