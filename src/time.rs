//! Logical simulation time.
//!
//! Every clock in the kernel is a [`VirtualTime`]: entity LVTs, event send
//! and receive stamps, batch dispatch times and GVT. It never reads the
//! wall clock. Unlike a sequential simulator's clock, an entity's LVT can
//! move backward when a rollback restores an older checkpoint.

/// A logical tick in simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualTime(u64);

impl VirtualTime {
    /// The initialization instant. No event is ever received at `ZERO`.
    pub const ZERO: VirtualTime = VirtualTime(0);

    /// "No pending work". GVT takes this value once nothing is left to run.
    pub const INFINITY: VirtualTime = VirtualTime(u64::MAX);

    #[inline]
    pub fn new(ticks: u64) -> Self {
        VirtualTime(ticks)
    }

    #[inline]
    pub fn ticks(self) -> u64 {
        self.0
    }

    /// `delta` ticks later, or `None` if that would overflow into
    /// [`INFINITY`](Self::INFINITY).
    #[inline]
    pub fn advance(self, delta: u64) -> Option<VirtualTime> {
        match self.0.checked_add(delta) {
            Some(t) if t != u64::MAX => Some(VirtualTime(t)),
            _ => None,
        }
    }

    /// Receive time of an event sent now with `delay`.
    #[inline]
    pub fn plus(self, delay: u64) -> Option<VirtualTime> {
        self.advance(delay)
    }

    /// Like [`advance`](Self::advance) but clamps to infinity. Used for
    /// optimism bounds, where "unbounded" is the natural overflow.
    #[inline]
    pub fn saturating_advance(self, delta: u64) -> VirtualTime {
        self.advance(delta).unwrap_or(VirtualTime::INFINITY)
    }

    #[inline]
    pub fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }
}

impl std::fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.is_infinite() {
            true => f.write_str("T=inf"),
            false => write!(f, "T={}", self.0),
        }
    }
}
