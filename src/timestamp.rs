use std::fmt;
use std::time::Duration;

/// A wall-clock instant in microseconds since the Unix epoch.
///
/// Timestamps report when something happened (a poll return, a message
/// arrival) and render into logs; timer scheduling runs on the monotonic
/// clock instead and never consults this type.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

pub const MICROS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    pub fn now() -> Timestamp {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            libc::gettimeofday(&mut tv, std::ptr::null_mut());
        }
        Timestamp(tv.tv_sec as i64 * MICROS_PER_SECOND + tv.tv_usec as i64)
    }

    pub fn invalid() -> Timestamp {
        Timestamp(0)
    }

    pub fn valid(&self) -> bool {
        self.0 > 0
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.0
    }

    pub(crate) fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn add(self, d: Duration) -> Timestamp {
        Timestamp(self.0 + d.as_micros() as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let seconds = self.0 / MICROS_PER_SECOND;
        let micros = self.0 % MICROS_PER_SECOND;
        write!(f, "{}.{:06}", seconds, micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_is_valid_and_monotone_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.valid());
        assert!(b >= a);
    }

    #[test]
    fn add_advances_by_duration() {
        let t = Timestamp::from_micros(1_500_000);
        let later = t.add(Duration::from_millis(750));
        assert_eq!(later.micros_since_epoch(), 2_250_000);
        assert_eq!(format!("{}", later), "2.250000");
    }

    #[test]
    fn default_is_invalid() {
        assert!(!Timestamp::default().valid());
    }
}
