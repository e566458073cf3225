//! Vertex array for one sub-interval.
//!
//! The arena pre-allocates per-vertex in- and out-edge slots from the
//! degree store, so the shard loaders can fill them in parallel through
//! atomic cursors. Each slot points at the edge's value cell inside a
//! shard buffer; the buffers outlive the arena.

use crate::engine::degrees::Degree;
use crate::types::{FixedWidth, SyncCell, VId};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub struct EdgeRef<E> {
    nb: VId,
    cell: *const SyncCell<E>,
}

impl<E> Clone for EdgeRef<E> {
    fn clone(&self) -> Self {
        EdgeRef {
            nb: self.nb,
            cell: self.cell,
        }
    }
}

impl<E> Copy for EdgeRef<E> {}

impl<E> Default for EdgeRef<E> {
    fn default() -> Self {
        EdgeRef {
            nb: 0,
            cell: std::ptr::null(),
        }
    }
}

// The cells live in shard buffers that are kept alive for the whole
// sub-interval; loaders on different threads fill disjoint slots.
unsafe impl<E> Send for EdgeRef<E> {}
unsafe impl<E> Sync for EdgeRef<E> {}

/// One incident edge of a vertex under update.
///
/// Graphs sharded without edge values have no cell behind the edge;
/// reads then yield the default value and writes are dropped.
pub struct Edge<'a, E: FixedWidth> {
    nb: VId,
    cell: Option<&'a SyncCell<E>>,
}

impl<'a, E: FixedWidth> Edge<'a, E> {
    /// Id of the vertex on the other side of the edge.
    pub fn vertex_id(&self) -> VId {
        self.nb
    }

    pub fn get_data(&self) -> E {
        self.cell.map(|c| c.get()).unwrap_or_default()
    }

    pub fn set_data(&self, value: E) {
        if let Some(cell) = self.cell {
            cell.set(value);
        }
    }
}

pub struct VertexArena<E: FixedWidth> {
    start: VId,
    end: VId,
    in_offsets: Vec<u32>,
    out_offsets: Vec<u32>,
    in_fill: Vec<AtomicU32>,
    out_fill: Vec<AtomicU32>,
    in_slots: Vec<SyncCell<EdgeRef<E>>>,
    out_slots: Vec<SyncCell<EdgeRef<E>>>,
    parallel_safe: Vec<AtomicBool>,
}

impl<E: FixedWidth> VertexArena<E> {
    /// `degrees` covers exactly `[start, end]`. With `load_outedges`
    /// disabled no out-edge slots are allocated.
    pub fn new(start: VId, end: VId, degrees: &[Degree], load_outedges: bool) -> Self {
        let n = (end - start + 1) as usize;
        assert_eq!(degrees.len(), n);
        let mut in_offsets = Vec::with_capacity(n + 1);
        let mut out_offsets = Vec::with_capacity(n + 1);
        let (mut in_total, mut out_total) = (0u32, 0u32);
        for d in degrees {
            in_offsets.push(in_total);
            out_offsets.push(out_total);
            in_total += d.indegree;
            if load_outedges {
                out_total += d.outdegree;
            }
        }
        in_offsets.push(in_total);
        out_offsets.push(out_total);
        VertexArena {
            start,
            end,
            in_offsets,
            out_offsets,
            in_fill: (0..n).map(|_| AtomicU32::new(0)).collect(),
            out_fill: (0..n).map(|_| AtomicU32::new(0)).collect(),
            in_slots: (0..in_total).map(|_| SyncCell::new(EdgeRef::default())).collect(),
            out_slots: (0..out_total)
                .map(|_| SyncCell::new(EdgeRef::default()))
                .collect(),
            parallel_safe: (0..n).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    pub fn start(&self) -> VId {
        self.start
    }

    pub fn end(&self) -> VId {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn local(&self, vid: VId) -> usize {
        assert!(
            vid >= self.start && vid <= self.end,
            "vertex id outside sub-interval"
        );
        (vid - self.start) as usize
    }

    /// Called by the memory shard for each in-edge of `vid`.
    pub fn add_inedge(&self, vid: VId, nb: VId, cell: *const SyncCell<E>) {
        let v = self.local(vid);
        let slot = self.in_fill[v].fetch_add(1, Ordering::AcqRel);
        let base = self.in_offsets[v];
        assert!(
            base + slot < self.in_offsets[v + 1],
            "in-degree overflow for vertex {}",
            vid
        );
        self.in_slots[(base + slot) as usize].set(EdgeRef { nb, cell });
    }

    /// Called by shard loaders for each out-edge of `vid`.
    pub fn add_outedge(&self, vid: VId, nb: VId, cell: *const SyncCell<E>) {
        let v = self.local(vid);
        let slot = self.out_fill[v].fetch_add(1, Ordering::AcqRel);
        let base = self.out_offsets[v];
        assert!(
            base + slot < self.out_offsets[v + 1],
            "out-degree overflow for vertex {}",
            vid
        );
        self.out_slots[(base + slot) as usize].set(EdgeRef { nb, cell });
    }

    /// Marks a vertex as sharing an edge cell with another vertex of the
    /// sub-interval. Such vertices must not be updated concurrently; the
    /// engine runs them one at a time.
    pub fn mark_conflict(&self, vid: VId) {
        self.parallel_safe[self.local(vid)].store(false, Ordering::Release);
    }

    pub fn parallel_safe(&self, index: usize) -> bool {
        self.parallel_safe[index].load(Ordering::Acquire)
    }

    pub fn vertex<'a, V: FixedWidth>(
        &'a self,
        index: usize,
        data: Option<&'a SyncCell<V>>,
    ) -> VertexRef<'a, V, E> {
        VertexRef {
            arena: self,
            index,
            data,
        }
    }
}

/// The vertex object handed to `update`.
pub struct VertexRef<'a, V: FixedWidth, E: FixedWidth> {
    arena: &'a VertexArena<E>,
    index: usize,
    data: Option<&'a SyncCell<V>>,
}

impl<'a, V: FixedWidth, E: FixedWidth> VertexRef<'a, V, E> {
    pub fn id(&self) -> VId {
        self.arena.start + self.index as VId
    }

    pub fn num_inedges(&self) -> usize {
        self.arena.in_fill[self.index].load(Ordering::Acquire) as usize
    }

    pub fn num_outedges(&self) -> usize {
        self.arena.out_fill[self.index].load(Ordering::Acquire) as usize
    }

    pub fn num_edges(&self) -> usize {
        self.num_inedges() + self.num_outedges()
    }

    fn edge_at(&self, slots: &'a [SyncCell<EdgeRef<E>>], base: u32, i: usize) -> Edge<'a, E> {
        let r = slots[base as usize + i].get();
        Edge {
            nb: r.nb,
            cell: unsafe { r.cell.as_ref() },
        }
    }

    pub fn inedge(&self, i: usize) -> Edge<'a, E> {
        assert!(i < self.num_inedges(), "in-edge index out of range");
        self.edge_at(&self.arena.in_slots, self.arena.in_offsets[self.index], i)
    }

    pub fn outedge(&self, i: usize) -> Edge<'a, E> {
        assert!(i < self.num_outedges(), "out-edge index out of range");
        self.edge_at(&self.arena.out_slots, self.arena.out_offsets[self.index], i)
    }

    /// In-edges first, then out-edges.
    pub fn edge(&self, i: usize) -> Edge<'a, E> {
        let nin = self.num_inedges();
        if i < nin {
            self.inedge(i)
        } else {
            self.outedge(i - nin)
        }
    }

    pub fn get_data(&self) -> V {
        self.data
            .expect("vertex data storage is disabled for this run")
            .get()
    }

    pub fn set_data(&self, value: V) {
        self.data
            .expect("vertex data storage is disabled for this run")
            .set(value);
    }
}
