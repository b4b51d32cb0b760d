//! The credit ledger: a scalar reputation exchanged between peers.
use std::fmt;

use speedy::{Readable, Writable};
use tracing::trace;

/// A snapshot of a ledger, as carried by requests and piece data.
#[derive(Debug, Clone, Copy, PartialEq, Readable, Writable)]
pub struct CreditValue {
    pub value: f64,
    pub seq: i64,
}

impl CreditValue {
    /// What we assume about a peer we have not heard from.
    pub const UNKNOWN: CreditValue = CreditValue {
        value: 0.0,
        seq: -1,
    };

    pub fn new(value: f64, seq: i64) -> Self {
        Self { value, seq }
    }

    /// Last writer wins on the sequence number, ties keep `self`.
    pub fn merge(self, other: CreditValue) -> CreditValue {
        if other.seq > self.seq {
            other
        } else {
            self
        }
    }
}

impl Default for CreditValue {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for CreditValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}", self.value)
    }
}

/// The local ledger. Only the engine writes to it.
#[derive(Debug, Default)]
pub struct Credit {
    value: f64,
    seq: i64,
}

impl Credit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, v: f64, reason: &str) {
        self.value += v;
        self.seq += 1;
        trace!(
            "added {v} to credit, value={} seq={} ({reason})",
            self.value,
            self.seq
        );
    }

    pub fn value(&self) -> CreditValue {
        CreditValue::new(self.value, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_highest_sequence() {
        let old = CreditValue::new(10.0, 3);
        let new = CreditValue::new(-4.0, 7);

        assert_eq!(old.merge(new), new);
        assert_eq!(new.merge(old), new);
    }

    #[test]
    fn merge_tie_keeps_existing() {
        let a = CreditValue::new(1.0, 5);
        let b = CreditValue::new(2.0, 5);
        assert_eq!(a.merge(b), a);
    }

    #[test]
    fn unknown_loses_to_anything() {
        let first = CreditValue::new(0.0, 0);
        assert_eq!(CreditValue::UNKNOWN.merge(first), first);
    }

    #[test]
    fn ledger_bumps_sequence() {
        let mut credit = Credit::new();
        assert_eq!(credit.value(), CreditValue::new(0.0, 0));

        credit.add(16384.0, "sent chunk");
        credit.add(-262144.0, "received piece");

        let v = credit.value();
        assert_eq!(v.seq, 2);
        assert_eq!(v.value, 16384.0 - 262144.0);
    }
}
