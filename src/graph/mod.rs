//! Distributed graph view.
//!
//! Each machine holds a local store: the vertices it owns plus ghost
//! copies of remote vertices adjacent to its edges. Local vertex ids
//! are dense, with owned vertices placed before ghosts and both
//! groups ordered by ascending global id — the lock protocol's
//! ascending local-id walk therefore projects to a monotone global-id
//! order. The graph is static for the lifetime of a run.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{EngineError, Result};
use crate::rpc::ProcId;

pub type GlobalVid = u64;
pub type LocalVid = u32;
pub type EdgeId = u32;

/// Ownership and replication facts about one local vertex.
#[derive(Debug, Clone)]
pub struct VertexRecord {
    pub global_id: GlobalVid,
    pub owner: ProcId,
    /// Machines holding a copy, excluding the owner. Identical on
    /// every machine that carries the vertex.
    pub mirrors: SmallVec<[ProcId; 4]>,
}

struct EdgeRecord<E> {
    source: LocalVid,
    target: LocalVid,
    data: Mutex<E>,
}

/// One machine's slice of the distributed graph.
pub struct DistributedGraph<V, E> {
    proc: ProcId,
    nprocs: usize,
    records: Vec<VertexRecord>,
    global_to_local: HashMap<GlobalVid, LocalVid>,
    num_own: usize,
    vertex_data: Vec<Mutex<V>>,
    edges: Vec<EdgeRecord<E>>,
    in_edges: Vec<Vec<EdgeId>>,
    out_edges: Vec<Vec<EdgeId>>,
}

impl<V, E> std::fmt::Debug for DistributedGraph<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedGraph").finish_non_exhaustive()
    }
}

impl<V, E> DistributedGraph<V, E> {
    pub fn procid(&self) -> ProcId {
        self.proc
    }

    pub fn numprocs(&self) -> usize {
        self.nprocs
    }

    pub fn num_local_vertices(&self) -> usize {
        self.records.len()
    }

    pub fn num_local_edges(&self) -> usize {
        self.edges.len()
    }

    /// Owned vertices occupy local ids `0..num_local_own_vertices()`.
    pub fn num_local_own_vertices(&self) -> usize {
        self.num_own
    }

    pub fn lvid_is_ghost(&self, lvid: LocalVid) -> bool {
        (lvid as usize) >= self.num_own
    }

    /// True when this machine is the authoritative replica.
    pub fn is_master(&self, lvid: LocalVid) -> bool {
        self.records[lvid as usize].owner == self.proc
    }

    pub fn local_to_global(&self, lvid: LocalVid) -> GlobalVid {
        self.records[lvid as usize].global_id
    }

    pub fn global_to_local(&self, gvid: GlobalVid) -> Option<LocalVid> {
        self.global_to_local.get(&gvid).copied()
    }

    pub fn record(&self, lvid: LocalVid) -> &VertexRecord {
        &self.records[lvid as usize]
    }

    /// All machines holding this vertex, ascending, owner included.
    pub fn replicas(&self, lvid: LocalVid) -> SmallVec<[ProcId; 4]> {
        let record = self.record(lvid);
        let mut replicas = record.mirrors.clone();
        replicas.push(record.owner);
        replicas.sort_unstable();
        replicas
    }

    /// Edge ids targeting `lvid`, ascending by source local id.
    pub fn in_edge_ids(&self, lvid: LocalVid) -> &[EdgeId] {
        &self.in_edges[lvid as usize]
    }

    /// Edge ids sourced at `lvid`, ascending by target local id.
    pub fn out_edge_ids(&self, lvid: LocalVid) -> &[EdgeId] {
        &self.out_edges[lvid as usize]
    }

    pub fn source(&self, eid: EdgeId) -> LocalVid {
        self.edges[eid as usize].source
    }

    pub fn target(&self, eid: EdgeId) -> LocalVid {
        self.edges[eid as usize].target
    }

    /// Vertex data, guarded by its short per-vertex mutex. Callers
    /// spin-yield on `try_lock` rather than parking.
    pub fn vertex_data(&self, lvid: LocalVid) -> &Mutex<V> {
        &self.vertex_data[lvid as usize]
    }

    /// Edge data, guarded by its short per-edge mutex.
    pub fn edge_data(&self, eid: EdgeId) -> &Mutex<E> {
        &self.edges[eid as usize].data
    }
}

/// Replicated global description of a graph, buildable into each
/// machine's local view. Construction is deterministic: every machine
/// building from the same description derives identical placement.
pub struct GraphBuilder<V, E> {
    vertices: BTreeMap<GlobalVid, (V, Option<ProcId>)>,
    edges: Vec<(GlobalVid, GlobalVid, E)>,
}

impl<V: Clone, E: Clone> Default for GraphBuilder<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone, E: Clone> GraphBuilder<V, E> {
    pub fn new() -> Self {
        Self {
            vertices: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    /// Adds a vertex with default placement (`gvid % nprocs`).
    pub fn add_vertex(&mut self, gvid: GlobalVid, data: V) -> &mut Self {
        self.vertices.insert(gvid, (data, None));
        self
    }

    /// Adds a vertex pinned to an explicit owner machine.
    pub fn add_vertex_on(&mut self, gvid: GlobalVid, data: V, owner: ProcId) -> &mut Self {
        self.vertices.insert(gvid, (data, Some(owner)));
        self
    }

    pub fn add_edge(&mut self, source: GlobalVid, target: GlobalVid, data: E) -> &mut Self {
        self.edges.push((source, target, data));
        self
    }

    fn owner_of(&self, gvid: GlobalVid, nprocs: usize) -> ProcId {
        match self.vertices.get(&gvid) {
            Some((_, Some(owner))) => *owner,
            _ => (gvid % nprocs as u64) as ProcId,
        }
    }

    /// Materializes machine `proc`'s local view.
    ///
    /// An edge lives on the owner of each endpoint; a vertex is
    /// therefore present wherever it is owned or adjacent to a
    /// locally stored edge, and its mirror list is derived from the
    /// full edge list so every machine agrees on it.
    pub fn build(&self, proc: ProcId, nprocs: usize) -> Result<DistributedGraph<V, E>> {
        if nprocs == 0 || proc >= nprocs {
            return Err(EngineError::Config(format!(
                "machine {proc} outside cluster of {nprocs}"
            )));
        }
        let mut seen_edges = BTreeSet::new();
        for (src, dst, _) in &self.edges {
            for gvid in [src, dst] {
                if !self.vertices.contains_key(gvid) {
                    return Err(EngineError::InvalidGraph(format!(
                        "edge ({src}, {dst}) references unknown vertex {gvid}"
                    )));
                }
            }
            // The lock walk visits each neighbor id once; self loops
            // and parallel edges would double-acquire.
            if src == dst {
                return Err(EngineError::InvalidGraph(format!("self loop on vertex {src}")));
            }
            if !seen_edges.insert((*src, *dst)) {
                return Err(EngineError::InvalidGraph(format!(
                    "duplicate edge ({src}, {dst})"
                )));
            }
        }
        for (gvid, (_, placement)) in &self.vertices {
            if let Some(owner) = placement {
                if *owner >= nprocs {
                    return Err(EngineError::InvalidGraph(format!(
                        "vertex {gvid} pinned to machine {owner} outside cluster of {nprocs}"
                    )));
                }
            }
        }

        // Presence of every vertex on every machine, for mirror lists.
        let mut presence: BTreeMap<GlobalVid, BTreeSet<ProcId>> = BTreeMap::new();
        for (gvid, _) in self.vertices.iter() {
            presence
                .entry(*gvid)
                .or_default()
                .insert(self.owner_of(*gvid, nprocs));
        }
        for (src, dst, _) in &self.edges {
            let src_owner = self.owner_of(*src, nprocs);
            let dst_owner = self.owner_of(*dst, nprocs);
            for machine in [src_owner, dst_owner] {
                presence.entry(*src).or_default().insert(machine);
                presence.entry(*dst).or_default().insert(machine);
            }
        }

        // Local vertex set: owned first, then ghosts, both ascending
        // by global id.
        let mut owned: Vec<GlobalVid> = Vec::new();
        let mut ghosts: Vec<GlobalVid> = Vec::new();
        for (gvid, machines) in &presence {
            if !machines.contains(&proc) {
                continue;
            }
            if self.owner_of(*gvid, nprocs) == proc {
                owned.push(*gvid);
            } else {
                ghosts.push(*gvid);
            }
        }
        let num_own = owned.len();
        let mut global_to_local = HashMap::new();
        let mut records = Vec::new();
        let mut vertex_data = Vec::new();
        for gvid in owned.into_iter().chain(ghosts) {
            let lvid = records.len() as LocalVid;
            let owner = self.owner_of(gvid, nprocs);
            let mirrors: SmallVec<[ProcId; 4]> = presence[&gvid]
                .iter()
                .copied()
                .filter(|m| *m != owner)
                .collect();
            global_to_local.insert(gvid, lvid);
            records.push(VertexRecord {
                global_id: gvid,
                owner,
                mirrors,
            });
            vertex_data.push(Mutex::new(self.vertices[&gvid].0.clone()));
        }

        let mut edges = Vec::new();
        let mut in_edges = vec![Vec::new(); records.len()];
        let mut out_edges = vec![Vec::new(); records.len()];
        for (src, dst, data) in &self.edges {
            let src_owner = self.owner_of(*src, nprocs);
            let dst_owner = self.owner_of(*dst, nprocs);
            if src_owner != proc && dst_owner != proc {
                continue;
            }
            let source = global_to_local[src];
            let target = global_to_local[dst];
            let eid = edges.len() as EdgeId;
            edges.push(EdgeRecord {
                source,
                target,
                data: Mutex::new(data.clone()),
            });
            in_edges[target as usize].push(eid);
            out_edges[source as usize].push(eid);
        }
        for (lvid, list) in in_edges.iter_mut().enumerate() {
            list.sort_unstable_by_key(|&eid| edges[eid as usize].source);
            debug_assert!(list.iter().all(|&e| edges[e as usize].target as usize == lvid));
        }
        for list in out_edges.iter_mut() {
            list.sort_unstable_by_key(|&eid| edges[eid as usize].target);
        }

        Ok(DistributedGraph {
            proc,
            nprocs,
            records,
            global_to_local,
            num_own,
            vertex_data,
            edges,
            in_edges,
            out_edges,
        })
    }
}
