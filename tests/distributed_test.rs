//! MPI transport tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 1 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.
//! MPI initializes once per process, so every check runs inside one test.

#![cfg(feature = "distributed")]

use multisplit::analysis::{self, RunOptions};
use multisplit::solver::comm::{CommunicationBackend, MessageTag};
use multisplit::solver::comm_mpi::MpiComm;
use multisplit::solver::reference;

/// Well past any MPI eager limit.
const LARGE: usize = 1 << 20;

fn threaded_cable(comm: &MpiComm) {
    // One rank whose two threads share a ReducedTree sid, so the whole
    // exchange runs through the MPI backend without a peer.
    let input = "\
host 0 threads=2
cell 0 thread=0
node 0 parent=- d=3 rhs=1
node 1 parent=0 d=3 rhs=2 a=-1 b=-1
node 2 parent=1 d=1.5 rhs=0.5 a=-1 b=-1
split 2 sid=7 style=reduced
cell 2 thread=1
node 0 parent=- d=1.5 rhs=0.5
node 1 parent=0 d=3 rhs=1 a=-1 b=-1
split 0 sid=7 style=reduced
end
";
    let model = multisplit::parser::parse(input).expect("parse failed");
    let run = analysis::run_host(&model.hosts[0], comm, &RunOptions::default()).expect("solve failed");
    let expected = reference::reference_solve(&model).expect("reference failed");
    let worst = analysis::max_deviation(std::slice::from_ref(&run), &expected).expect("check failed");
    assert!(worst < 1e-12, "deviation {worst}");
    assert_eq!(run.counters.messages_sent, 0);
}

fn large_messages_to_self(comm: &MpiComm) {
    // A blocking send to self of this size would never return.
    let me = comm.rank();
    let long: Vec<f64> = (0..LARGE).map(|i| i as f64).collect();
    let first = comm.post_receive(me, MessageTag::LongToLong, LARGE);
    let second = comm.post_receive(me, MessageTag::ToReducedTree, 3);
    comm.send(me, MessageTag::LongToLong, &long).expect("send failed");
    comm.send(me, MessageTag::ToReducedTree, &[1.0, 2.0, 3.0]).expect("send failed");

    // Waited for in the opposite order of arrival.
    let mut small = [0.0; 3];
    comm.wait(second, &mut small).expect("wait failed");
    assert_eq!(small, [1.0, 2.0, 3.0]);
    let mut buf = vec![0.0; LARGE];
    comm.wait(first, &mut buf).expect("wait failed");
    assert_eq!(buf, long);
}

fn wrong_length_is_reported(comm: &MpiComm) {
    let me = comm.rank();
    let pending = comm.post_receive(me, MessageTag::ShortToLong, 2);
    comm.send(me, MessageTag::ShortToLong, &[1.0, 2.0, 3.0]).expect("send failed");
    let mut buf = [0.0; 2];
    assert!(comm.wait(pending, &mut buf).is_err());
}

#[test]
fn single_rank_transport() {
    let _universe = mpi::initialize().expect("MPI init failed");
    let comm = MpiComm::new();
    assert_eq!(comm.num_ranks(), 1);
    assert!(comm.send(1, MessageTag::LongToLong, &[0.0]).is_err());

    threaded_cable(&comm);
    large_messages_to_self(&comm);
    wrong_length_is_reported(&comm);
}
