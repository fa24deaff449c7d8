//! MPI communication backend for the split exchange.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements `CommunicationBackend` using `mpi::traits::*`.
//!
//! # Usage
//!
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```
//!
//! # Point-to-point messages
//!
//! Sends are immediate (`MPI_Isend`). While a send is incomplete, and while
//! `wait` looks for its message, every incoming exchange message is
//! received into a per-rank stash keyed by `(source, tag)`. A rank inside
//! the transport therefore always accepts what its peers send, so two
//! ranks sending large messages to each other in the same pass both make
//! progress regardless of the MPI eager limit.

use std::sync::{Mutex, MutexGuard};

use super::comm::{CommunicationBackend, MessageTag, PendingReceive};
use crate::error::{MultisplitError, Result};
use mpi::datatype::PartitionMut;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

/// A message received before anyone waited for it.
struct Parked {
    src: usize,
    tag: i32,
    data: Vec<f64>,
}

/// MPI-based communication backend.
///
/// Wraps the MPI world communicator. Requires `mpi::initialize()` to have
/// been called before construction.
pub struct MpiComm {
    stash: Mutex<Vec<Parked>>,
}

impl MpiComm {
    /// Create a new MPI communication backend.
    pub fn new() -> Self {
        Self {
            stash: Mutex::new(Vec::new()),
        }
    }

    fn stash(&self) -> Result<MutexGuard<'_, Vec<Parked>>> {
        self.stash
            .lock()
            .map_err(|_| MultisplitError::Transport("message stash poisoned".into()))
    }

    /// Receive one incoming message into the stash. Returns whether one was
    /// there; with `block`, waits until one arrives.
    fn park(&self, world: &SimpleCommunicator, block: bool) -> Result<bool> {
        let matched = if block {
            Some(world.any_process().matched_probe())
        } else {
            world.any_process().immediate_matched_probe()
        };
        let Some((message, status)) = matched else {
            return Ok(false);
        };
        let (data, _) = message.matched_receive_vec::<f64>();
        self.stash()?.push(Parked {
            src: status.source_rank() as usize,
            tag: status.tag(),
            data,
        });
        Ok(true)
    }

    /// Oldest stashed message from `src` with `tag`.
    fn unpark(&self, src: usize, tag: MessageTag) -> Result<Option<Vec<f64>>> {
        let mut stash = self.stash()?;
        let code = tag.code();
        let found = stash.iter().position(|p| p.src == src && p.tag == code);
        Ok(found.map(|pos| stash.remove(pos).data))
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationBackend for MpiComm {
    fn rank(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.rank() as usize
    }

    fn num_ranks(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.size() as usize
    }

    fn all_gather_count(&self, local: i64) -> Result<Vec<i64>> {
        let world = SimpleCommunicator::world();
        let mut all = vec![0i64; world.size() as usize];
        world.all_gather_into(&local, &mut all[..]);
        Ok(all)
    }

    fn all_gather_varcount(&self, local: &[i64], counts: &[usize]) -> Result<Vec<i64>> {
        let world = SimpleCommunicator::world();
        let counts: Vec<Count> = counts.iter().map(|&c| c as Count).collect();
        let displs: Vec<Count> = counts
            .iter()
            .scan(0, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect();
        let total: Count = counts.iter().sum();
        if total < 0 {
            return Err(MultisplitError::Transport("negative gather size".into()));
        }
        let mut all = vec![0i64; total as usize];
        {
            let mut partition = PartitionMut::new(&mut all[..], counts, displs);
            world.all_gather_varcount_into(local, &mut partition);
        }
        Ok(all)
    }

    fn post_receive(&self, peer: usize, tag: MessageTag, len: usize) -> PendingReceive {
        PendingReceive { peer, tag, len }
    }

    fn send(&self, peer: usize, tag: MessageTag, data: &[f64]) -> Result<()> {
        let world = SimpleCommunicator::world();
        if peer >= world.size() as usize {
            return Err(MultisplitError::Transport(format!(
                "no rank {} in a world of {}",
                peer,
                world.size()
            )));
        }
        mpi::request::scope(|scope| {
            let mut request = world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(scope, data, tag.code());
            loop {
                match request.test() {
                    Ok(_) => return Ok(()),
                    Err(pending) => match self.park(&world, false) {
                        Ok(true) => request = pending,
                        Ok(false) => {
                            std::thread::yield_now();
                            request = pending;
                        }
                        Err(e) => {
                            pending.wait();
                            return Err(e);
                        }
                    },
                }
            }
        })
    }

    fn wait(&self, pending: PendingReceive, buf: &mut [f64]) -> Result<()> {
        if buf.len() != pending.len {
            return Err(MultisplitError::Transport(format!(
                "receive buffer holds {} values, expected {}",
                buf.len(),
                pending.len
            )));
        }
        let world = SimpleCommunicator::world();
        loop {
            if let Some(data) = self.unpark(pending.peer, pending.tag)? {
                if data.len() != pending.len {
                    return Err(MultisplitError::Transport(format!(
                        "{:?} from {} carried {} values, expected {}",
                        pending.tag,
                        pending.peer,
                        data.len(),
                        pending.len
                    )));
                }
                buf.copy_from_slice(&data);
                return Ok(());
            }
            self.park(&world, true)?;
        }
    }
}
