//! The split solver.
//!
//! [`MultiSplit`] is the entry point. The other modules are its layers:
//! split registry, per-thread backbone layout, communication plan, the
//! five-pass exchange with its ReducedTrees, and the transports.

pub mod backbone;
pub mod comm;
pub mod comm_local;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod control;
pub mod exchange;
pub mod handle;
pub mod plan;
pub mod reduced_tree;
pub mod reference;
pub mod registry;

pub use comm::{CommunicationBackend, SingleProcessComm};
pub use comm_local::LocalComm;
#[cfg(feature = "distributed")]
pub use comm_mpi::MpiComm;
pub use control::MultiSplit;
pub use registry::{BackboneStyle, Sid, SplitLocation};
