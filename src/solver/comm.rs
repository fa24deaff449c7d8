//! Communication backend abstraction for the split exchange.
//!
//! Provides the transport contract the planner and the exchange protocol
//! rely on (all-gather for setup, tagged point-to-point messages for every
//! step) and a no-op single-process implementation.

use crate::error::Result;

/// Tag of a point-to-point message. Every exchange phase has its own tag so
/// a host never confuses two messages from the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageTag {
    LongToShort,
    ShortToLong,
    LongToLong,
    ToReducedTree,
    FromReducedTree,
    /// Setup collectives.
    Gather,
}

impl MessageTag {
    pub fn code(self) -> i32 {
        match self {
            MessageTag::LongToShort => 1,
            MessageTag::ShortToLong => 2,
            MessageTag::LongToLong => 3,
            MessageTag::ToReducedTree => 4,
            MessageTag::FromReducedTree => 5,
            MessageTag::Gather => 6,
        }
    }
}

/// A receive posted before the matching send may have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReceive {
    pub peer: usize,
    pub tag: MessageTag,
    pub len: usize,
}

/// Abstraction over inter-host communication.
///
/// Implementations: `SingleProcessComm` (no-op), `LocalComm` (threads in one
/// process), `MpiComm` (via mpi crate). Delivery between a pair of hosts is
/// assumed reliable and ordered per tag.
pub trait CommunicationBackend: Send + Sync {
    /// This host's rank.
    fn rank(&self) -> usize;

    /// Total number of hosts.
    fn num_ranks(&self) -> usize;

    /// Every host's `local` value, indexed by rank.
    fn all_gather_count(&self, local: i64) -> Result<Vec<i64>>;

    /// Concatenation of every host's `local` slice in rank order. `counts`
    /// is the result of a preceding [`all_gather_count`](Self::all_gather_count).
    fn all_gather_varcount(&self, local: &[i64], counts: &[usize]) -> Result<Vec<i64>>;

    /// Post a receive of `len` values from `peer`. Does not block.
    fn post_receive(&self, peer: usize, tag: MessageTag, len: usize) -> PendingReceive;

    /// Send `data` to `peer`. Must not wait for the peer to reach the
    /// matching `wait`.
    fn send(&self, peer: usize, tag: MessageTag, data: &[f64]) -> Result<()>;

    /// Block until the posted receive has arrived and copy it into `buf`.
    fn wait(&self, pending: PendingReceive, buf: &mut [f64]) -> Result<()>;
}

/// No-op communication backend for a single host.
///
/// Splits between threads of one host need no messages, so every
/// point-to-point call is unreachable in a consistent plan.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn all_gather_count(&self, local: i64) -> Result<Vec<i64>> {
        Ok(vec![local])
    }

    fn all_gather_varcount(&self, local: &[i64], _counts: &[usize]) -> Result<Vec<i64>> {
        Ok(local.to_vec())
    }

    fn post_receive(&self, peer: usize, tag: MessageTag, len: usize) -> PendingReceive {
        PendingReceive { peer, tag, len }
    }

    fn send(&self, peer: usize, tag: MessageTag, _data: &[f64]) -> Result<()> {
        Err(crate::error::MultisplitError::Transport(format!(
            "single-process backend has no peer {} to send {:?} to",
            peer, tag
        )))
    }

    fn wait(&self, pending: PendingReceive, _buf: &mut [f64]) -> Result<()> {
        Err(crate::error::MultisplitError::Transport(format!(
            "single-process backend has no peer {} to receive {:?} from",
            pending.peer, pending.tag
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_rank_and_size() {
        let comm = SingleProcessComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.num_ranks(), 1);
    }

    #[test]
    fn single_process_gathers_are_identity() {
        let comm = SingleProcessComm;
        assert_eq!(comm.all_gather_count(3).unwrap(), vec![3]);
        let got = comm.all_gather_varcount(&[4, 5, 6], &[3]).unwrap();
        assert_eq!(got, vec![4, 5, 6]);
    }

    #[test]
    fn single_process_reports_missing_peer() {
        let comm = SingleProcessComm;
        let pending = comm.post_receive(1, MessageTag::LongToLong, 2);
        let mut buf = [0.0; 2];
        assert!(comm.wait(pending, &mut buf).is_err());
        assert!(comm.send(1, MessageTag::LongToLong, &buf).is_err());
    }

    #[test]
    fn tags_are_distinct() {
        let tags = [
            MessageTag::LongToShort,
            MessageTag::ShortToLong,
            MessageTag::LongToLong,
            MessageTag::ToReducedTree,
            MessageTag::FromReducedTree,
            MessageTag::Gather,
        ];
        let mut codes: Vec<i32> = tags.iter().map(|t| t.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), tags.len());
    }
}
