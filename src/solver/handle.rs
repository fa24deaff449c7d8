//! Stable handles into kernel-owned node storage.
//!
//! The plan never caches addresses. A [`NodeRef`] keeps the node's identity
//! next to its resolved index, and [`Slot`] names any value the exchange
//! reads or writes. Indices are refreshed by `rebind` after the kernel
//! reallocates its storage.

use crate::error::{MultisplitError, Result};
use crate::solver::backbone::BackboneLayout;
use crate::tree::{NodeId, ThreadTree};

/// Resolved reference to a node on one of this host's threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub thread: usize,
    pub id: NodeId,
    pub index: usize,
}

impl NodeRef {
    pub fn resolve(threads: &[ThreadTree], thread: usize, id: NodeId) -> Result<Self> {
        let index = threads
            .get(thread)
            .and_then(|t| t.index_of(id))
            .ok_or_else(|| {
                MultisplitError::Structure(format!("node {} is not stored on thread {}", id, thread))
            })?;
        Ok(Self { thread, id, index })
    }

    pub fn rebind(&mut self, threads: &[ThreadTree]) -> Result<()> {
        *self = Self::resolve(threads, self.thread, self.id)?;
        Ok(())
    }
}

/// A value touched by the exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    D(NodeRef),
    Rhs(NodeRef),
    /// Fill-in towards sid1 of the backbone node at `offset`.
    Sid1A { thread: usize, offset: usize },
    /// Fill-in towards sid0 of the backbone node at `offset`.
    Sid1B { thread: usize, offset: usize },
    /// Position in the flat receive buffer.
    Recv(usize),
    /// Position in the flat send buffer.
    Send(usize),
}

impl Slot {
    pub fn rebind(&mut self, threads: &[ThreadTree]) -> Result<()> {
        match self {
            Slot::D(node) | Slot::Rhs(node) => node.rebind(threads),
            _ => Ok(()),
        }
    }
}

/// Mutable view of everything a [`Slot`] can point at.
pub struct Workspace<'a> {
    pub threads: &'a mut [ThreadTree],
    pub layouts: &'a mut [BackboneLayout],
    pub recv: &'a mut [f64],
    pub send: &'a mut [f64],
}

impl Workspace<'_> {
    pub fn get(&self, slot: Slot) -> f64 {
        match slot {
            Slot::D(n) => self.threads[n.thread].d[n.index],
            Slot::Rhs(n) => self.threads[n.thread].rhs[n.index],
            Slot::Sid1A { thread, offset } => self.layouts[thread].sid1a[offset],
            Slot::Sid1B { thread, offset } => self.layouts[thread].sid1b[offset],
            Slot::Recv(k) => self.recv[k],
            Slot::Send(k) => self.send[k],
        }
    }

    pub fn set(&mut self, slot: Slot, value: f64) {
        match slot {
            Slot::D(n) => self.threads[n.thread].d[n.index] = value,
            Slot::Rhs(n) => self.threads[n.thread].rhs[n.index] = value,
            Slot::Sid1A { thread, offset } => self.layouts[thread].sid1a[offset] = value,
            Slot::Sid1B { thread, offset } => self.layouts[thread].sid1b[offset] = value,
            Slot::Recv(k) => self.recv[k] = value,
            Slot::Send(k) => self.send[k] = value,
        }
    }

    pub fn scale(&mut self, slot: Slot, factor: f64) {
        let v = self.get(slot);
        self.set(slot, v * factor);
    }

    pub fn add(&mut self, slot: Slot, value: f64) {
        let v = self.get(slot);
        self.set(slot, v + value);
    }
}
