//! Connected components by label propagation.
//!
//! Each endpoint of an edge owns one half of the edge value and writes
//! its current component label there; a vertex adopts the minimum label
//! among its neighbors. The run terminates once an iteration changes no
//! label.

use crate::config::Config;
use crate::engine::{read_vertex_data, Context, GraphEngine, VertexProgram, VertexRef};
use crate::error::Result;
use crate::types::{FixedWidth, VId};
use std::sync::atomic::{AtomicUsize, Ordering};

const UNSET: VId = VId::MAX;

/// Labels written independently by the two endpoints of an edge.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiLabel {
    smaller_side: VId,
    larger_side: VId,
}

impl Default for BiLabel {
    fn default() -> Self {
        BiLabel {
            smaller_side: UNSET,
            larger_side: UNSET,
        }
    }
}

impl FixedWidth for BiLabel {}

impl BiLabel {
    /// The label last written by the other endpoint. An endpoint that
    /// has not written yet counts as its own id.
    fn neighbor_label(&self, my_id: VId, nb_id: VId) -> VId {
        let label = if my_id < nb_id {
            self.larger_side
        } else {
            self.smaller_side
        };
        if label == UNSET {
            nb_id
        } else {
            label
        }
    }

    fn my_label(&self, my_id: VId, nb_id: VId) -> VId {
        if my_id < nb_id {
            self.smaller_side
        } else {
            self.larger_side
        }
    }

    fn set_my_label(&mut self, my_id: VId, nb_id: VId, label: VId) {
        if my_id < nb_id {
            self.smaller_side = label;
        } else {
            self.larger_side = label;
        }
    }
}

pub struct ConnectedComponents {
    changes: AtomicUsize,
}

impl ConnectedComponents {
    pub fn new() -> Self {
        ConnectedComponents {
            changes: AtomicUsize::new(0),
        }
    }
}

impl Default for ConnectedComponents {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexProgram for ConnectedComponents {
    type VertexData = VId;
    type EdgeData = BiLabel;

    fn update(&self, vertex: &VertexRef<VId, BiLabel>, context: &Context<BiLabel>) {
        let mut min_label = vertex.id();
        for i in 0..vertex.num_edges() {
            let edge = vertex.edge(i);
            min_label =
                min_label.min(edge.get_data().neighbor_label(vertex.id(), edge.vertex_id()));
        }
        vertex.set_data(min_label);

        for i in 0..vertex.num_edges() {
            let edge = vertex.edge(i);
            let mut data = edge.get_data();
            if data.my_label(vertex.id(), edge.vertex_id()) != min_label {
                data.set_my_label(vertex.id(), edge.vertex_id(), min_label);
                edge.set_data(data);
                self.changes.fetch_add(1, Ordering::Relaxed);
                context.add_task(edge.vertex_id());
            }
        }
    }

    fn before_iteration(&self, _iteration: u32, _context: &Context<BiLabel>) {
        self.changes.store(0, Ordering::Relaxed);
    }

    fn after_iteration(&self, iteration: u32, context: &Context<BiLabel>) {
        log::info!(
            "cc iteration {}: {} label changes",
            iteration,
            self.changes.load(Ordering::Relaxed)
        );
        if self.changes.load(Ordering::Relaxed) == 0 {
            context.set_last_iteration(iteration);
        }
    }
}

/// Runs label propagation and returns the final component label of every
/// vertex.
pub fn run(base: &str, nshards: usize, niters: u32, config: &Config) -> Result<Vec<VId>> {
    let program = ConnectedComponents::new();
    let mut engine: GraphEngine<VId, BiLabel> = GraphEngine::new(base, nshards, false, config)?;
    engine.run(&program, niters)?;
    read_vertex_data::<VId>(base, engine.num_vertices())
}
