//! Communication planner.
//!
//! `exchange_setup` runs once per topology or layout change. Every host
//! gathers every other host's `(sid, relation)` list, then derives the same
//! global picture independently: which hosts exchange which split rows, in
//! which phase, and which host solves the ReducedTree of each reduced cell.
//! The result is an [`ExchangePlan`] reused by every step.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use crate::error::{MultisplitError, Result};
use crate::solver::backbone::BackboneLayout;
use crate::solver::comm::{CommunicationBackend, MessageTag};
use crate::solver::handle::{NodeRef, Slot};
use crate::solver::reduced_tree::ReducedTree;
use crate::solver::registry::{BbRelation, Sid, SplitRegistry};
use crate::tree::ThreadTree;

/// Message phase. Declaration order is send order within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    LongToShort,
    ToReducedTree,
    LongToLong,
    FromReducedTree,
    ShortToLong,
}

impl Phase {
    pub fn tag(self) -> MessageTag {
        match self {
            Phase::LongToShort => MessageTag::LongToShort,
            Phase::ToReducedTree => MessageTag::ToReducedTree,
            Phase::LongToLong => MessageTag::LongToLong,
            Phase::FromReducedTree => MessageTag::FromReducedTree,
            Phase::ShortToLong => MessageTag::ShortToLong,
        }
    }

    /// Sent in pass 2, before any answer exists.
    pub fn is_contribution(self) -> bool {
        matches!(self, Phase::LongToShort | Phase::ToReducedTree | Phase::LongToLong)
    }

    /// Received in pass 3, needed before short backbones and ReducedTrees
    /// can be solved.
    pub fn feeds_solvers(self) -> bool {
        matches!(self, Phase::LongToShort | Phase::ToReducedTree)
    }
}

/// One split row entry as exchanged during planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitEntry {
    pub sid: Sid,
    pub relation: BbRelation,
}

impl SplitEntry {
    fn encode(&self, out: &mut Vec<i64>) {
        let (kind, other) = match self.relation {
            BbRelation::Long => (0, -1),
            BbRelation::Short => (1, -1),
            BbRelation::ReducedTree { other: None } => (2, -1),
            BbRelation::ReducedTree { other: Some(o) } => (3, o as i64),
        };
        out.extend([self.sid as i64, kind, other]);
    }

    fn decode(chunk: &[i64]) -> Result<Self> {
        let bad = || MultisplitError::Transport(format!("malformed split entry {:?}", chunk));
        let &[sid, kind, other] = chunk else { return Err(bad()) };
        let sid = Sid::try_from(sid).map_err(|_| bad())?;
        let relation = match kind {
            0 => BbRelation::Long,
            1 => BbRelation::Short,
            2 => BbRelation::ReducedTree { other: None },
            3 => BbRelation::ReducedTree {
                other: Some(Sid::try_from(other).map_err(|_| bad())?),
            },
            _ => return Err(bad()),
        };
        Ok(Self { sid, relation })
    }
}

const ENTRY_WIDTH: usize = 3;

/// A split point of this host with its resolved storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalEntry {
    pub entry: SplitEntry,
    pub node: NodeRef,
    pub area: f64,
    /// Offset into the thread's fill-in arrays when the node is on a backbone.
    pub offset: Option<usize>,
}

/// One planned message.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub peer: usize,
    pub phase: Phase,
    /// Nodes whose `(d, rhs)` pairs open the message, in order.
    pub nodes: Vec<NodeRef>,
    /// `(sid1a, sid1b)` fill-in pairs following the nodes.
    pub offdiag: Vec<(Slot, Slot)>,
    pub displ: usize,
    pub size: usize,
}

impl TransferInfo {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.displ..self.displ + self.size
    }
}

/// A split node with non-zero area taking part in a ReducedTree.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaNode {
    pub node: NodeRef,
    pub area: f64,
    /// Row values scaled by `area / 100` before the ReducedTree sees them.
    pub scaled: Vec<Slot>,
}

/// Everything the exchange needs, built once by [`exchange_setup`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePlan {
    pub host: usize,
    /// Outbound messages sorted by phase, then peer.
    pub sends: Vec<TransferInfo>,
    /// Inbound messages sorted by phase, then peer.
    pub receives: Vec<TransferInfo>,
    pub send_buf: Vec<f64>,
    pub recv_buf: Vec<f64>,
    /// ReducedTrees this host was elected to solve.
    pub reduced_trees: Vec<ReducedTree>,
    /// Non-zero-area nodes whose rows travel to a remote ReducedTree.
    pub area_buf: Vec<AreaNode>,
    /// Non-zero-area nodes whose rows feed a local ReducedTree.
    pub area_rt: Vec<AreaNode>,
    /// RHS adjustment of every area node, `area_buf` first.
    pub adjust: Vec<f64>,
    /// Zero-area split nodes, whose voltage follows from their neighbours.
    pub algebraic: Vec<NodeRef>,
    /// Storage generation of every thread when the handles were resolved.
    pub generations: Vec<u64>,
}

impl ExchangePlan {
    pub fn is_current(&self, threads: &[ThreadTree]) -> bool {
        self.generations.len() == threads.len()
            && threads.iter().zip(&self.generations).all(|(t, &g)| t.generation() == g)
    }

    /// Refresh every handle after the kernel reallocated node storage.
    pub fn rebind(&mut self, threads: &[ThreadTree]) -> Result<()> {
        for t in self.sends.iter_mut().chain(self.receives.iter_mut()) {
            for n in &mut t.nodes {
                n.rebind(threads)?;
            }
        }
        for rt in &mut self.reduced_trees {
            rt.rebind(threads)?;
        }
        for n in &mut self.algebraic {
            n.rebind(threads)?;
        }
        for a in self.area_buf.iter_mut().chain(self.area_rt.iter_mut()) {
            a.node.rebind(threads)?;
            for s in &mut a.scaled {
                s.rebind(threads)?;
            }
        }
        self.generations = threads.iter().map(ThreadTree::generation).collect();
        Ok(())
    }

    pub fn area_nodes(&self) -> impl Iterator<Item = &AreaNode> {
        self.area_buf.iter().chain(&self.area_rt)
    }

    /// Human-readable dump of the plan.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "host {}: {} sends, {} receives", self.host, self.sends.len(), self.receives.len());
        for (dir, list) in [("send", &self.sends), ("recv", &self.receives)] {
            for t in list {
                let nodes: Vec<String> = t.nodes.iter().map(|n| n.id.to_string()).collect();
                let _ = writeln!(
                    s,
                    "  {} {:?} peer={} displ={} size={} nodes=[{}] offdiag={}",
                    dir,
                    t.phase,
                    t.peer,
                    t.displ,
                    t.size,
                    nodes.join(" "),
                    t.offdiag.len()
                );
            }
        }
        for rt in &self.reduced_trees {
            let _ = writeln!(
                s,
                "  reduced tree sids={:?} ip={:?} pieces={} offdiag={}",
                rt.sids(),
                rt.ip,
                rt.rmap.len(),
                rt.offdiag.len()
            );
        }
        let _ = writeln!(s, "  area nodes: {} remote, {} local", self.area_buf.len(), self.area_rt.len());
        s
    }
}

/// Resolve this host's split points, in registry order, sid0 before sid1.
pub fn local_entries(
    registry: &SplitRegistry,
    layouts: &[BackboneLayout],
    threads: &[ThreadTree],
) -> Result<Vec<LocalEntry>> {
    let mut out = Vec::new();
    for record in registry.records() {
        for (sid, relation, id) in record.entries() {
            let node = NodeRef::resolve(threads, record.thread, id)?;
            let offset = layouts
                .get(record.thread)
                .and_then(|l| l.offset(node.index))
                .filter(|_| record.is_backbone());
            out.push(LocalEntry {
                entry: SplitEntry { sid, relation },
                node,
                area: threads[node.thread].area[node.index],
                offset,
            });
        }
    }
    Ok(out)
}

/// All-gather every host's split entries. A host that failed to prepare
/// passes `None`; every host then fails together instead of waiting on it.
pub fn gather_entries(
    comm: &dyn CommunicationBackend,
    local: Option<&[LocalEntry]>,
) -> Result<Vec<Vec<SplitEntry>>> {
    let mut wire = Vec::new();
    if let Some(entries) = local {
        for e in entries {
            e.entry.encode(&mut wire);
        }
    }
    let count = if local.is_some() { wire.len() as i64 } else { -1 };
    let counts = comm.all_gather_count(count)?;
    if let Some(host) = counts.iter().position(|&c| c < 0) {
        return Err(MultisplitError::Structure(format!(
            "host {} could not prepare its split layout",
            host
        )));
    }
    let counts: Vec<usize> = counts.iter().map(|&c| c as usize).collect();
    let payload = comm.all_gather_varcount(&wire, &counts)?;

    let mut hosts = Vec::with_capacity(counts.len());
    let mut at = 0;
    for &c in &counts {
        if c % ENTRY_WIDTH != 0 {
            return Err(MultisplitError::Transport(format!("split entry payload of {} values", c)));
        }
        let entries = payload[at..at + c]
            .chunks(ENTRY_WIDTH)
            .map(SplitEntry::decode)
            .collect::<Result<Vec<_>>>()?;
        hosts.push(entries);
        at += c;
    }
    Ok(hosts)
}

/// Take part in a rebuild's collectives only to report a local failure, so
/// that every peer's `rebuild` fails instead of waiting.
pub fn withdraw(comm: &dyn CommunicationBackend) -> Result<()> {
    comm.all_gather_count(-1)?;
    Ok(())
}

/// Index pairs `(sid0, sid1)` of reduced backbones. Both ends of a backbone
/// are listed next to each other, sid0 first.
pub fn backbone_pairs(entries: &[SplitEntry]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        if let BbRelation::ReducedTree { other: Some(o) } = entries[i].relation {
            if let Some(next) = entries.get(i + 1) {
                if next.sid == o && next.relation == (BbRelation::ReducedTree { other: Some(entries[i].sid) }) {
                    pairs.push((i, i + 1));
                    i += 2;
                    continue;
                }
            }
        }
        i += 1;
    }
    pairs
}

/// A reduced cell: every sid connected through reduced backbones.
#[derive(Debug)]
struct ReducedCell {
    sids: Vec<Sid>,
    edges: Vec<(Sid, Sid)>,
    host: usize,
}

fn validate(hosts: &[Vec<SplitEntry>]) -> Result<HashSet<Sid>> {
    let mut reduced: HashSet<Sid> = HashSet::new();
    let mut plain: HashSet<Sid> = HashSet::new();
    let mut short: HashMap<Sid, usize> = HashMap::new();
    for (h, entries) in hosts.iter().enumerate() {
        let mut seen: HashSet<Sid> = HashSet::new();
        for e in entries {
            if e.relation.is_reduced() {
                reduced.insert(e.sid);
                continue;
            }
            if !seen.insert(e.sid) {
                return Err(MultisplitError::Config(format!(
                    "sid {} is declared on two pieces of host {}",
                    e.sid, h
                )));
            }
            plain.insert(e.sid);
            if e.relation == BbRelation::Short {
                *short.entry(e.sid).or_default() += 1;
            }
        }
    }
    if let Some(sid) = reduced.intersection(&plain).min() {
        return Err(MultisplitError::Config(format!(
            "sid {} joins reduced-tree and non-reduced pieces",
            sid
        )));
    }
    if let Some((sid, _)) = short.iter().filter(|(_, &n)| n > 1).min() {
        return Err(MultisplitError::Config(format!("sid {} joins two short backbones", sid)));
    }
    Ok(short.keys().copied().collect())
}

fn reduced_cells(hosts: &[Vec<SplitEntry>]) -> (Vec<ReducedCell>, HashMap<Sid, usize>) {
    let mut adjacent: HashMap<Sid, Vec<Sid>> = HashMap::new();
    for entries in hosts {
        for e in entries {
            if let BbRelation::ReducedTree { other } = e.relation {
                let list = adjacent.entry(e.sid).or_default();
                if let Some(o) = other {
                    list.push(o);
                }
            }
        }
    }

    let mut cell_of: HashMap<Sid, usize> = HashMap::new();
    let mut cells: Vec<ReducedCell> = Vec::new();
    for entries in hosts {
        for e in entries.iter().filter(|e| e.relation.is_reduced()) {
            if cell_of.contains_key(&e.sid) {
                continue;
            }
            let c = cells.len();
            let mut queue = VecDeque::from([e.sid]);
            cell_of.insert(e.sid, c);
            while let Some(s) = queue.pop_front() {
                for &t in adjacent.get(&s).map(Vec::as_slice).unwrap_or(&[]) {
                    if !cell_of.contains_key(&t) {
                        cell_of.insert(t, c);
                        queue.push_back(t);
                    }
                }
            }
            cells.push(ReducedCell {
                sids: Vec::new(),
                edges: Vec::new(),
                host: usize::MAX,
            });
        }
    }

    for (h, entries) in hosts.iter().enumerate() {
        for e in entries.iter().filter(|e| e.relation.is_reduced()) {
            let cell = &mut cells[cell_of[&e.sid]];
            if !cell.sids.contains(&e.sid) {
                cell.sids.push(e.sid);
            }
        }
        for (i, j) in backbone_pairs(entries) {
            let cell = &mut cells[cell_of[&entries[i].sid]];
            cell.edges.push((entries[i].sid, entries[j].sid));
            if cell.host == usize::MAX {
                cell.host = h;
            }
        }
    }
    for cell in &mut cells {
        if cell.host == usize::MAX {
            cell.host = hosts
                .iter()
                .position(|entries| entries.iter().any(|e| e.relation.is_reduced() && cell.sids.contains(&e.sid)))
                .unwrap_or(0);
        }
    }
    (cells, cell_of)
}

/// Indices into `entries` of the reduced entries whose cell is solved on `host`.
fn entries_for_host(
    entries: &[SplitEntry],
    cells: &[ReducedCell],
    cell_of: &HashMap<Sid, usize>,
    host: usize,
) -> Vec<usize> {
    entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.relation.is_reduced() && cells[cell_of[&e.sid]].host == host)
        .map(|(i, _)| i)
        .collect()
}

#[derive(Default)]
struct Buffers {
    send_len: usize,
    recv_len: usize,
}

impl Buffers {
    fn send(&mut self, size: usize) -> usize {
        let at = self.send_len;
        self.send_len += size;
        at
    }

    fn recv(&mut self, size: usize) -> usize {
        let at = self.recv_len;
        self.recv_len += size;
        at
    }
}

impl ExchangePlan {
    /// Derive this host's plan from every host's gathered entries.
    /// `local` must correspond entry for entry to `hosts[me]`.
    pub fn build(
        me: usize,
        hosts: &[Vec<SplitEntry>],
        local: &[LocalEntry],
        threads: &[ThreadTree],
    ) -> Result<Self> {
        let mine = hosts.get(me).map(Vec::as_slice).unwrap_or(&[]);
        if mine.len() != local.len() || mine.iter().zip(local).any(|(a, b)| *a != b.entry) {
            return Err(MultisplitError::Structure(format!(
                "host {}: gathered split entries disagree with local ones",
                me
            )));
        }
        let connects_to_short = validate(hosts)?;
        let mut bufs = Buffers::default();
        let mut sends: Vec<TransferInfo> = Vec::new();
        let mut receives: Vec<TransferInfo> = Vec::new();

        // Non-reduced links, grouped per (phase, peer), ordered by sid.
        let mut out_links: BTreeMap<(Phase, usize), Vec<(Sid, NodeRef)>> = BTreeMap::new();
        let mut in_links: BTreeMap<(Phase, usize), Vec<(Sid, NodeRef)>> = BTreeMap::new();
        for le in local.iter().filter(|le| !le.entry.relation.is_reduced()) {
            let sid = le.entry.sid;
            for (h, entries) in hosts.iter().enumerate() {
                if h == me {
                    continue;
                }
                let Some(remote) = entries.iter().find(|e| e.sid == sid && !e.relation.is_reduced()) else {
                    continue;
                };
                let link = (sid, le.node);
                match (le.entry.relation, remote.relation) {
                    (BbRelation::Long, BbRelation::Short) => {
                        out_links.entry((Phase::LongToShort, h)).or_default().push(link);
                        in_links.entry((Phase::ShortToLong, h)).or_default().push(link);
                    }
                    (BbRelation::Short, BbRelation::Long) => {
                        in_links.entry((Phase::LongToShort, h)).or_default().push(link);
                        out_links.entry((Phase::ShortToLong, h)).or_default().push(link);
                    }
                    (BbRelation::Long, BbRelation::Long) if !connects_to_short.contains(&sid) => {
                        out_links.entry((Phase::LongToLong, h)).or_default().push(link);
                        in_links.entry((Phase::LongToLong, h)).or_default().push(link);
                    }
                    _ => {}
                }
            }
        }
        for ((phase, peer), mut links) in out_links {
            links.sort_by_key(|(sid, _)| *sid);
            let size = 2 * links.len();
            sends.push(TransferInfo {
                peer,
                phase,
                nodes: links.into_iter().map(|(_, n)| n).collect(),
                offdiag: Vec::new(),
                displ: bufs.send(size),
                size,
            });
        }
        for ((phase, peer), mut links) in in_links {
            links.sort_by_key(|(sid, _)| *sid);
            let size = 2 * links.len();
            receives.push(TransferInfo {
                peer,
                phase,
                nodes: links.into_iter().map(|(_, n)| n).collect(),
                offdiag: Vec::new(),
                displ: bufs.recv(size),
                size,
            });
        }

        // Reduced cells.
        let (cells, cell_of) = reduced_cells(hosts);
        let mut rt_index: HashMap<usize, usize> = HashMap::new();
        let mut reduced_trees = Vec::new();
        for (c, cell) in cells.iter().enumerate() {
            // Every host checks every cell so that all of them agree on failure.
            let rt = ReducedTree::new(&cell.sids, &cell.edges)?;
            if cell.host == me {
                rt_index.insert(c, reduced_trees.len());
                reduced_trees.push(rt);
            }
        }
        let mut area_buf = Vec::new();
        let mut area_rt = Vec::new();

        for (h, entries) in hosts.iter().enumerate() {
            let picked = entries_for_host(entries, &cells, &cell_of, me);
            if picked.is_empty() {
                continue;
            }
            let filtered: Vec<SplitEntry> = picked.iter().map(|&i| entries[i]).collect();
            let pairs = backbone_pairs(&filtered);
            let n = filtered.len();
            let tree_of = |sid: Sid| rt_index[&cell_of[&sid]];

            if h == me {
                for (k, &i) in picked.iter().enumerate() {
                    let le = &local[i];
                    let slots = (Slot::Rhs(le.node), Slot::D(le.node));
                    reduced_trees[tree_of(filtered[k].sid)].add_piece(filtered[k].sid, slots, slots)?;
                }
                let mut fill: HashMap<usize, Slot> = HashMap::new();
                for &(i, j) in &pairs {
                    let (a, b) = (&local[picked[i]], &local[picked[j]]);
                    let (Some(oa), Some(ob)) = (a.offset, b.offset) else {
                        return Err(MultisplitError::Structure(format!(
                            "reduced backbone {}-{} is not laid out as a backbone",
                            a.entry.sid, b.entry.sid
                        )));
                    };
                    let sa = Slot::Sid1A { thread: a.node.thread, offset: oa };
                    let sb = Slot::Sid1B { thread: b.node.thread, offset: ob };
                    let rt = &mut reduced_trees[tree_of(a.entry.sid)];
                    rt.add_offdiag(a.entry.sid, b.entry.sid, sa)?;
                    rt.add_offdiag(b.entry.sid, a.entry.sid, sb)?;
                    fill.insert(i, sa);
                    fill.insert(j, sb);
                }
                for (k, &i) in picked.iter().enumerate() {
                    let le = &local[i];
                    if le.area > 0.0 {
                        let mut scaled = vec![Slot::D(le.node), Slot::Rhs(le.node)];
                        scaled.extend(fill.get(&k));
                        area_rt.push(AreaNode { node: le.node, area: le.area, scaled });
                    }
                }
            } else {
                let size_in = 2 * n + 2 * pairs.len();
                let rd = bufs.recv(size_in);
                let sd = bufs.send(2 * n);
                receives.push(TransferInfo {
                    peer: h,
                    phase: Phase::ToReducedTree,
                    nodes: Vec::new(),
                    offdiag: Vec::new(),
                    displ: rd,
                    size: size_in,
                });
                sends.push(TransferInfo {
                    peer: h,
                    phase: Phase::FromReducedTree,
                    nodes: Vec::new(),
                    offdiag: Vec::new(),
                    displ: sd,
                    size: 2 * n,
                });
                for (k, e) in filtered.iter().enumerate() {
                    reduced_trees[tree_of(e.sid)].add_piece(
                        e.sid,
                        (Slot::Recv(rd + 2 * k + 1), Slot::Recv(rd + 2 * k)),
                        (Slot::Send(sd + 2 * k + 1), Slot::Send(sd + 2 * k)),
                    )?;
                }
                for (q, &(i, j)) in pairs.iter().enumerate() {
                    let (si, sj) = (filtered[i].sid, filtered[j].sid);
                    let rt = &mut reduced_trees[tree_of(si)];
                    rt.add_offdiag(si, sj, Slot::Recv(rd + 2 * n + 2 * q))?;
                    rt.add_offdiag(sj, si, Slot::Recv(rd + 2 * n + 2 * q + 1))?;
                }
            }
        }

        // Contributions of this host to ReducedTrees solved elsewhere.
        let mut hosts_solving: Vec<usize> = cells.iter().map(|c| c.host).filter(|&h| h != me).collect();
        hosts_solving.sort_unstable();
        hosts_solving.dedup();
        for r in hosts_solving {
            let picked = entries_for_host(mine, &cells, &cell_of, r);
            if picked.is_empty() {
                continue;
            }
            let filtered: Vec<SplitEntry> = picked.iter().map(|&i| mine[i]).collect();
            let pairs = backbone_pairs(&filtered);
            let n = filtered.len();
            let size_out = 2 * n + 2 * pairs.len();
            let sd = bufs.send(size_out);
            let rd = bufs.recv(2 * n);
            let nodes: Vec<NodeRef> = picked.iter().map(|&i| local[i].node).collect();
            let mut offdiag = Vec::with_capacity(pairs.len());
            let mut fill: HashMap<usize, Slot> = HashMap::new();
            for (q, &(i, j)) in pairs.iter().enumerate() {
                let (a, b) = (&local[picked[i]], &local[picked[j]]);
                let (Some(oa), Some(ob)) = (a.offset, b.offset) else {
                    return Err(MultisplitError::Structure(format!(
                        "reduced backbone {}-{} is not laid out as a backbone",
                        a.entry.sid, b.entry.sid
                    )));
                };
                offdiag.push((
                    Slot::Sid1A { thread: a.node.thread, offset: oa },
                    Slot::Sid1B { thread: b.node.thread, offset: ob },
                ));
                fill.insert(i, Slot::Send(sd + 2 * n + 2 * q));
                fill.insert(j, Slot::Send(sd + 2 * n + 2 * q + 1));
            }
            for (k, &i) in picked.iter().enumerate() {
                let le = &local[i];
                if le.area > 0.0 {
                    let mut scaled = vec![Slot::Send(sd + 2 * k), Slot::Send(sd + 2 * k + 1)];
                    scaled.extend(fill.get(&k));
                    area_buf.push(AreaNode { node: le.node, area: le.area, scaled });
                }
            }
            sends.push(TransferInfo {
                peer: r,
                phase: Phase::ToReducedTree,
                nodes: nodes.clone(),
                offdiag,
                displ: sd,
                size: size_out,
            });
            receives.push(TransferInfo {
                peer: r,
                phase: Phase::FromReducedTree,
                nodes,
                offdiag: Vec::new(),
                displ: rd,
                size: 2 * n,
            });
        }

        sends.sort_by_key(|t| (t.phase, t.peer));
        receives.sort_by_key(|t| (t.phase, t.peer));
        let n_area = area_buf.len() + area_rt.len();
        let mut algebraic: Vec<NodeRef> = Vec::new();
        for le in local.iter().filter(|le| le.area == 0.0) {
            if !algebraic.contains(&le.node) {
                algebraic.push(le.node);
            }
        }
        tracing::debug!(
            host = me,
            sends = sends.len(),
            receives = receives.len(),
            reduced_trees = reduced_trees.len(),
            send_len = bufs.send_len,
            recv_len = bufs.recv_len,
            "exchange plan built"
        );
        Ok(Self {
            host: me,
            sends,
            receives,
            send_buf: vec![0.0; bufs.send_len],
            recv_buf: vec![0.0; bufs.recv_len],
            reduced_trees,
            area_buf,
            area_rt,
            adjust: vec![0.0; n_area],
            algebraic,
            generations: threads.iter().map(ThreadTree::generation).collect(),
        })
    }
}

/// Gather every host's split entries and build this host's plan.
pub fn exchange_setup(
    comm: &dyn CommunicationBackend,
    local: Option<&[LocalEntry]>,
    threads: &[ThreadTree],
) -> Result<ExchangePlan> {
    let _span = tracing::info_span!("exchange_setup", host = comm.rank()).entered();
    let hosts = gather_entries(comm, local)?;
    let local = local.unwrap_or(&[]);
    ExchangePlan::build(comm.rank(), &hosts, local, threads)
}
