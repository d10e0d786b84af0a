// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time, measured in ticks of the scheduler timer.

/// In-kernel timestamp representation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Deadline `ticks` after `self`. Saturates rather than wrapping, so a
    /// huge sleep just never expires.
    pub fn after(self, ticks: u32) -> Self {
        Self(self.0.saturating_add(u64::from(ticks)))
    }

    /// The timestamp one tick later.
    pub fn next(self) -> Self {
        self.after(1)
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_combine_little_end_first() {
        assert_eq!(u64::from(Timestamp::from([1, 2])), (2 << 32) | 1);
    }

    #[test]
    fn after_saturates() {
        let t = Timestamp::from(u64::MAX - 1);
        assert_eq!(t.after(10), Timestamp::from(u64::MAX));
        assert_eq!(Timestamp::ZERO.next(), Timestamp::from(1));
    }
}
