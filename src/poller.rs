use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::channel::{Channel, STATE_ADDED, STATE_DELETED, STATE_NEW};
use crate::ready::Ready;
use crate::sys::epoll::Epoll;
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Readiness oracle over a set of [`Channel`]s, backed by epoll.
///
/// The poller owns no channels; it indexes them by descriptor. For every
/// channel it knows, the kernel registration matches the channel's current
/// interest mask.
pub(crate) struct Poller {
    epoll: Epoll,
    channels: HashMap<RawFd, Weak<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> std::io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            channels: HashMap::new(),
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
        })
    }

    /// Waits for readiness, pushing ready channels into `active` with their
    /// reported readiness recorded. Returns a timestamp taken right after
    /// wakeup.
    pub fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let n = match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => {
                log::error!("Poller::poll epoll_wait: {}", e);
                0
            }
        };

        let now = Timestamp::now();

        if n > 0 {
            log::trace!("{} events happened", n);
            self.fill_active_channels(active);
            if n == self.events.capacity() {
                self.events.reserve(self.events.capacity());
            }
        } else {
            log::trace!("nothing happened");
        }

        now
    }

    fn fill_active_channels(&self, active: &mut Vec<Arc<Channel>>) {
        for event in &self.events {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => {
                    channel.set_revents(Ready::from_epoll(event.events));
                    active.push(channel);
                }
                None => {
                    // owner dropped its channel without detaching it first
                    log::error!("Poller: ready fd = {} has no live channel", fd);
                }
            }
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(registered) => registered
                .upgrade()
                .map(|c| std::ptr::eq(&*c, channel))
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        let fd = channel.fd();
        log::trace!(
            "Poller::update_channel fd = {} events = {:?}",
            fd,
            channel.events()
        );

        if state == STATE_NEW || state == STATE_DELETED {
            if state == STATE_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, Arc::downgrade(channel));
            } else {
                assert!(self.channels.contains_key(&fd));
            }

            channel.set_poller_state(STATE_ADDED);
            self.ctl_or_die("add", self.epoll.add(fd, fd as u64, channel.events()));
        } else {
            assert!(self.channels.contains_key(&fd));
            assert_eq!(state, STATE_ADDED);

            if channel.is_none_event() {
                if let Err(e) = self.epoll.delete(fd) {
                    log::error!("Poller: epoll del fd = {}: {}", fd, e);
                }
                channel.set_poller_state(STATE_DELETED);
            } else {
                self.ctl_or_die("mod", self.epoll.modify(fd, fd as u64, channel.events()));
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        log::trace!("Poller::remove_channel fd = {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());

        let state = channel.poller_state();
        assert!(state == STATE_ADDED || state == STATE_DELETED);

        self.channels.remove(&fd);

        if state == STATE_ADDED {
            if let Err(e) = self.epoll.delete(fd) {
                log::error!("Poller: epoll del fd = {}: {}", fd, e);
            }
        }
        channel.set_poller_state(STATE_NEW);
    }

    fn ctl_or_die(&self, op: &str, result: std::io::Result<()>) {
        if let Err(e) = result {
            log::error!("Poller: epoll {}: {}", op, e);
            panic!("Poller: epoll {} failed: {}", op, e);
        }
    }
}
