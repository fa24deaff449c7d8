//! In-process communication backend.
//!
//! Every host is an OS thread of the same process. Each host owns one inbox
//! (a `crossbeam_channel` queue) and holds a sender to every inbox, so sends
//! never block. Receives match on `(source, tag)`; messages that arrive
//! before they are waited for are parked in a per-host stash.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::comm::{CommunicationBackend, MessageTag, PendingReceive};
use crate::error::{MultisplitError, Result};

#[derive(Debug)]
struct Envelope {
    src: usize,
    tag: MessageTag,
    data: Vec<f64>,
}

/// One host's endpoint of an in-process cluster.
pub struct LocalComm {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: Mutex<Vec<Envelope>>,
}

impl LocalComm {
    /// Create the endpoints of an `n`-host cluster, indexed by rank.
    pub fn cluster(n: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                peers: senders.clone(),
                inbox,
                stash: Mutex::new(Vec::new()),
            })
            .collect()
    }

    fn take(&self, src: usize, tag: MessageTag) -> Result<Vec<f64>> {
        {
            let mut stash = self
                .stash
                .lock()
                .map_err(|_| MultisplitError::Transport("message stash poisoned".into()))?;
            if let Some(pos) = stash.iter().position(|e| e.src == src && e.tag == tag) {
                return Ok(stash.remove(pos).data);
            }
        }
        loop {
            let env = self.inbox.recv().map_err(|_| {
                MultisplitError::Transport(format!(
                    "host {}: every peer disconnected while waiting for {:?} from {}",
                    self.rank, tag, src
                ))
            })?;
            if env.src == src && env.tag == tag {
                return Ok(env.data);
            }
            tracing::trace!(host = self.rank, src = env.src, tag = ?env.tag, "parking early message");
            self.stash
                .lock()
                .map_err(|_| MultisplitError::Transport("message stash poisoned".into()))?
                .push(env);
        }
    }

    fn gather_values(&self, local: &[f64]) -> Result<Vec<Vec<f64>>> {
        for peer in 0..self.peers.len() {
            if peer != self.rank {
                self.send(peer, MessageTag::Gather, local)?;
            }
        }
        (0..self.peers.len())
            .map(|src| {
                if src == self.rank {
                    Ok(local.to_vec())
                } else {
                    self.take(src, MessageTag::Gather)
                }
            })
            .collect()
    }
}

impl CommunicationBackend for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.peers.len()
    }

    fn all_gather_count(&self, local: i64) -> Result<Vec<i64>> {
        let all = self.gather_values(&[local as f64])?;
        all.iter()
            .map(|v| match v.as_slice() {
                [x] => Ok(*x as i64),
                _ => Err(MultisplitError::Transport(format!(
                    "count gather delivered {} values",
                    v.len()
                ))),
            })
            .collect()
    }

    fn all_gather_varcount(&self, local: &[i64], counts: &[usize]) -> Result<Vec<i64>> {
        let data: Vec<f64> = local.iter().map(|&x| x as f64).collect();
        let all = self.gather_values(&data)?;
        let mut out = Vec::with_capacity(counts.iter().sum());
        for (src, (values, &expected)) in all.iter().zip(counts).enumerate() {
            if values.len() != expected {
                return Err(MultisplitError::Transport(format!(
                    "host {} contributed {} values, expected {}",
                    src,
                    values.len(),
                    expected
                )));
            }
            out.extend(values.iter().map(|&x| x as i64));
        }
        Ok(out)
    }

    fn post_receive(&self, peer: usize, tag: MessageTag, len: usize) -> PendingReceive {
        PendingReceive { peer, tag, len }
    }

    fn send(&self, peer: usize, tag: MessageTag, data: &[f64]) -> Result<()> {
        let inbox = self.peers.get(peer).ok_or_else(|| {
            MultisplitError::Transport(format!(
                "host {}: no peer {} in a {}-host cluster",
                self.rank,
                peer,
                self.peers.len()
            ))
        })?;
        let env = Envelope {
            src: self.rank,
            tag,
            data: data.to_vec(),
        };
        inbox.send(env).map_err(|_| {
            MultisplitError::Transport(format!(
                "host {}: peer {} has left, {:?} not delivered",
                self.rank, peer, tag
            ))
        })
    }

    fn wait(&self, pending: PendingReceive, buf: &mut [f64]) -> Result<()> {
        let data = self.take(pending.peer, pending.tag)?;
        if data.len() != pending.len || buf.len() != pending.len {
            return Err(MultisplitError::Transport(format!(
                "host {}: {:?} from {} carried {} values, expected {}",
                self.rank,
                pending.tag,
                pending.peer,
                data.len(),
                pending.len
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn gathers_are_rank_ordered() {
        let comms = LocalComm::cluster(3);
        let results: Vec<Vec<i64>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let r = c.rank() as i64;
                        let counts = c.all_gather_count(r + 1).unwrap();
                        let counts: Vec<usize> = counts.iter().map(|&x| x as usize).collect();
                        let local: Vec<i64> = (0..=r).map(|k| 10 * r + k).collect();
                        c.all_gather_varcount(&local, &counts).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in &results {
            assert_eq!(r, &vec![0, 10, 11, 20, 21, 22]);
        }
    }

    #[test]
    fn receives_match_on_tag_not_arrival_order() {
        let comms = LocalComm::cluster(2);
        comms[1].send(0, MessageTag::LongToLong, &[1.0, 2.0]).unwrap();
        comms[1].send(0, MessageTag::ToReducedTree, &[3.0]).unwrap();
        let first = comms[0].post_receive(1, MessageTag::ToReducedTree, 1);
        let second = comms[0].post_receive(1, MessageTag::LongToLong, 2);
        let mut a = [0.0];
        let mut b = [0.0; 2];
        comms[0].wait(first, &mut a).unwrap();
        comms[0].wait(second, &mut b).unwrap();
        assert_eq!(a, [3.0]);
        assert_eq!(b, [1.0, 2.0]);
    }

    #[test]
    fn wrong_length_is_a_transport_error() {
        let comms = LocalComm::cluster(2);
        comms[0].send(1, MessageTag::ShortToLong, &[1.0, 2.0, 3.0]).unwrap();
        let pending = comms[1].post_receive(0, MessageTag::ShortToLong, 2);
        let mut buf = [0.0; 2];
        let err = comms[1].wait(pending, &mut buf).unwrap_err();
        assert!(matches!(err, MultisplitError::Transport(_)));
    }

    #[test]
    fn send_to_departed_peer_is_a_transport_error() {
        let mut comms = LocalComm::cluster(2);
        drop(comms.pop());
        let err = comms[0].send(1, MessageTag::LongToLong, &[1.0]).unwrap_err();
        assert!(matches!(err, MultisplitError::Transport(_)));
        assert!(format!("{err}").contains("peer 1 has left"));
    }

    #[test]
    fn send_to_unknown_peer_is_a_transport_error() {
        let comms = LocalComm::cluster(1);
        assert!(comms[0].send(3, MessageTag::LongToLong, &[1.0]).is_err());
    }
}
