//! Orderings over peer records.
//!
//! Every ranker sorts the best peer first. Peers a ranker considers
//! ineligible get a zero (or the smallest positive) comparison value, so
//! they sink to the end of the list.
use std::cmp::Ordering;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::PeerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRanker {
    /// Bytes per second received from the peer, ties broken by the number
    /// of pieces it sent us. Zero if the peer choked us or we don't want
    /// anything from it.
    ReceivePerformance,
    /// Raw receive rate, regardless of choking and interest.
    PotentialReceive,
    /// Bytes per second sent to the peer, zero if it is not interested.
    SendPerformance,
    CreditForLeecher,
    CreditForSeeder,
    /// Newest peers first.
    SequenceNumber,
}

impl PeerRanker {
    pub fn name(&self) -> &'static str {
        match self {
            PeerRanker::ReceivePerformance => "Receive performance",
            PeerRanker::PotentialReceive => "Potential receive performance",
            PeerRanker::SendPerformance => "Send performance",
            PeerRanker::CreditForLeecher => "Credit for leecher",
            PeerRanker::CreditForSeeder => "Credit for seeder",
            PeerRanker::SequenceNumber => "Sequence number",
        }
    }

    /// The scalar this ranker sorts on, also used to fill upload slots.
    pub fn value(&self, p: &PeerRecord) -> f64 {
        match self {
            PeerRanker::ReceivePerformance => {
                if p.peer_has_choked_us() || !p.we_are_interested() {
                    0.0
                } else {
                    p.receive_rate()
                }
            }
            PeerRanker::PotentialReceive => p.receive_rate(),
            PeerRanker::SendPerformance => {
                if p.peer_is_interested() {
                    p.send_rate()
                } else {
                    0.0
                }
            }
            PeerRanker::CreditForLeecher => {
                if p.peer_has_choked_us() || !p.we_are_interested() {
                    f64::MIN_POSITIVE
                } else {
                    p.credit()
                }
            }
            PeerRanker::CreditForSeeder => {
                if p.peer_is_interested() {
                    p.credit()
                } else {
                    f64::MIN_POSITIVE
                }
            }
            PeerRanker::SequenceNumber => p.seq as f64,
        }
    }

    /// `Less` means `a` ranks before `b`.
    pub fn compare(&self, a: &PeerRecord, b: &PeerRecord) -> Ordering {
        let by_value = self.value(b).total_cmp(&self.value(a));
        match self {
            PeerRanker::ReceivePerformance | PeerRanker::PotentialReceive => {
                by_value.then_with(|| b.received_pieces().cmp(&a.received_pieces()))
            }
            _ => by_value,
        }
    }
}

/// The pair of rankers that decide who gets served, one for while we are
/// downloading and one for once we are seeding.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum RankingPolicy {
    /// Reward the peers that give us the most, then the ones that take the
    /// most once we have everything.
    #[default]
    TitForTat,
    /// Reward the peers with the most credit.
    Credit,
    /// Plain insertion order, a baseline without any feedback.
    OneTrack,
}

impl RankingPolicy {
    pub fn leecher(&self) -> PeerRanker {
        match self {
            RankingPolicy::TitForTat => PeerRanker::ReceivePerformance,
            RankingPolicy::Credit => PeerRanker::CreditForLeecher,
            RankingPolicy::OneTrack => PeerRanker::SequenceNumber,
        }
    }

    pub fn seeder(&self) -> PeerRanker {
        match self {
            RankingPolicy::TitForTat => PeerRanker::SendPerformance,
            // peers keep paying for what we give them
            RankingPolicy::Credit => PeerRanker::CreditForLeecher,
            RankingPolicy::OneTrack => PeerRanker::SequenceNumber,
        }
    }

    pub fn potential(&self) -> PeerRanker {
        PeerRanker::PotentialReceive
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{credit::CreditValue, peer::PeerId};

    use super::*;

    fn record(n: u8, seq: u64) -> PeerRecord {
        PeerRecord::new(PeerId::from([n; 20]), 4, Duration::from_millis(800), seq)
    }

    #[test]
    fn sequence_number_prefers_newest() {
        let a = record(1, 1);
        let b = record(2, 2);
        assert_eq!(PeerRanker::SequenceNumber.compare(&a, &b), Ordering::Greater);
        assert_eq!(PeerRanker::SequenceNumber.compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn credit_zeroes_peers_that_choked_us() {
        let mut a = record(1, 1);
        let mut b = record(2, 2);
        a.update_credit(CreditValue::new(500.0, 1));
        b.update_credit(CreditValue::new(100.0, 1));

        let r = PeerRanker::CreditForLeecher;
        assert_eq!(r.compare(&a, &b), Ordering::Less);

        a.set_peer_has_choked_us(true);
        assert_eq!(r.value(&a), f64::MIN_POSITIVE);
        assert_eq!(r.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn send_performance_ignores_uninterested() {
        let mut a = record(1, 1);
        a.set_peer_is_interested(false);
        assert_eq!(PeerRanker::SendPerformance.value(&a), 0.0);
    }
}
