use std::{fmt, ops};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

/// Readiness of one descriptor, and the interest a channel registers for.
///
/// Only the readable and writable bits ever go into an interest mask; the
/// error and hang-up bits appear on the way back from the poller, which
/// reports them whether or not they were asked for. Channel dispatch reads
/// the mask in a fixed order: hang-up without readability is a close, error
/// is an error, readable feeds the read callback, writable the write
/// callback.
///
/// ```
/// use ripple_io::Ready;
///
/// let mask = Ready::readable() | Ready::writable();
/// assert!(mask.is_readable() && mask.is_writable());
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    const READABLE: u8 = 0b0001;
    const WRITABLE: u8 = 0b0010;
    const ERROR: u8 = 0b0100;
    const HUP: u8 = 0b1000;

    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(Ready::READABLE)
    }

    pub fn writable() -> Ready {
        Ready(Ready::WRITABLE)
    }

    /// An error condition on the descriptor; never part of an interest
    /// mask.
    pub fn error() -> Ready {
        Ready(Ready::ERROR)
    }

    /// The peer hung up entirely. A peer that only shut down its write
    /// side surfaces as readable instead, so the zero-length read can run
    /// the half-close path.
    pub fn hup() -> Ready {
        Ready(Ready::HUP)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    pub fn is_hup(self) -> bool {
        self.contains(Ready::hup())
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Raw bits, for the channel's atomic mask slots.
    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> Ready {
        Ready(bits)
    }

    /// Kernel bits for registering this mask with `epoll_ctl`. Readable
    /// interest asks for urgent data too; registration is level-triggered,
    /// so no `EPOLLET`.
    pub(crate) fn to_epoll_interest(self) -> u32 {
        let mut bits = 0;

        if self.is_readable() {
            bits |= EPOLLIN | EPOLLPRI;
        }
        if self.is_writable() {
            bits |= EPOLLOUT;
        }

        bits as u32
    }

    /// Readiness reported by `epoll_wait`. `EPOLLRDHUP` folds into
    /// readable so a half-closed peer drives the ordinary read path;
    /// `EPOLLHUP` keeps its own bit because hang-up without readability
    /// dispatches as a close.
    pub(crate) fn from_epoll(events: u32) -> Ready {
        let events = events as libc::c_int;
        let mut ready = Ready::empty();

        if events & (EPOLLIN | EPOLLPRI | EPOLLRDHUP) != 0 {
            ready.insert(Ready::readable());
        }
        if events & EPOLLOUT != 0 {
            ready.insert(Ready::writable());
        }
        if events & EPOLLERR != 0 {
            ready.insert(Ready::error());
        }
        if events & EPOLLHUP != 0 {
            ready.insert(Ready::hup());
        }

        ready
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Ready(none)");
        }

        let mut names = Vec::with_capacity(4);
        if self.is_readable() {
            names.push("readable");
        }
        if self.is_writable() {
            names.push("writable");
        }
        if self.is_error() {
            names.push("error");
        }
        if self.is_hup() {
            names.push("hup");
        }

        write!(f, "Ready({})", names.join("|"))
    }
}

#[cfg(test)]
mod test {
    use super::Ready;
    use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

    #[test]
    fn insert_and_remove() {
        let mut mask = Ready::readable() | Ready::hup();
        assert!(mask.is_readable());
        assert!(mask.is_hup());
        assert!(!mask.is_writable());

        mask.remove(Ready::readable());
        assert!(!mask.is_readable());
        assert_eq!(mask, Ready::hup());
    }

    #[test]
    fn interest_covers_urgent_data_but_not_kernel_only_bits() {
        let interest = (Ready::readable() | Ready::writable()).to_epoll_interest();
        assert_ne!(interest & EPOLLIN as u32, 0);
        assert_ne!(interest & EPOLLPRI as u32, 0);
        assert_ne!(interest & EPOLLOUT as u32, 0);
        assert_eq!(interest & EPOLLERR as u32, 0);
        assert_eq!(interest & EPOLLHUP as u32, 0);

        assert_eq!(Ready::empty().to_epoll_interest(), 0);
    }

    #[test]
    fn half_closed_peer_reads_as_readable() {
        let ready = Ready::from_epoll(EPOLLRDHUP as u32);
        assert!(ready.is_readable());
        assert!(!ready.is_hup());
    }

    #[test]
    fn full_hangup_keeps_its_own_bit() {
        let ready = Ready::from_epoll(EPOLLHUP as u32);
        assert!(ready.is_hup());
        assert!(!ready.is_readable());

        // hang-up alongside pending data goes down the read path
        let ready = Ready::from_epoll((EPOLLHUP | EPOLLIN) as u32);
        assert!(ready.is_hup());
        assert!(ready.is_readable());
    }

    #[test]
    fn error_bit_round_trips_from_the_kernel() {
        let ready = Ready::from_epoll(EPOLLERR as u32);
        assert!(ready.is_error());
        assert_eq!(format!("{:?}", ready), "Ready(error)");
    }

    #[test]
    fn debug_lists_set_bits() {
        assert_eq!(format!("{:?}", Ready::empty()), "Ready(none)");
        assert_eq!(
            format!("{:?}", Ready::readable() | Ready::writable()),
            "Ready(readable|writable)"
        );
    }
}
