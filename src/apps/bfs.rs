//! Breadth-first search with selective scheduling.
//!
//! Iteration 0 initializes every distance to unreachable, the root then
//! seeds its neighborhood, and scheduled vertices relax to one past the
//! minimum distance on their incident edges.

use crate::config::Config;
use crate::engine::{read_vertex_data, Context, GraphEngine, VertexProgram, VertexRef};
use crate::error::Result;
use crate::types::VId;

pub const UNREACHED: u32 = u32::MAX;

pub struct Bfs {
    root: VId,
}

impl Bfs {
    pub fn new(root: VId) -> Self {
        Bfs { root }
    }
}

impl VertexProgram for Bfs {
    type VertexData = u32;
    type EdgeData = u32;

    fn update(&self, vertex: &VertexRef<u32, u32>, context: &Context<u32>) {
        if context.iteration == 0 {
            vertex.set_data(UNREACHED);
            for i in 0..vertex.num_outedges() {
                vertex.outedge(i).set_data(UNREACHED);
            }
        } else if context.iteration == 1 {
            // Only the root is scheduled here.
            vertex.set_data(0);
            for i in 0..vertex.num_edges() {
                vertex.edge(i).set_data(0);
                context.add_task(vertex.edge(i).vertex_id());
            }
        } else {
            let mut min_level = UNREACHED;
            for i in 0..vertex.num_edges() {
                min_level = min_level.min(vertex.edge(i).get_data());
            }
            if min_level < UNREACHED {
                vertex.set_data(min_level + 1);
                for i in 0..vertex.num_edges() {
                    let edge = vertex.edge(i);
                    if edge.get_data() == UNREACHED {
                        edge.set_data(min_level + 1);
                        context.add_task(edge.vertex_id());
                    }
                }
            }
        }
    }

    fn after_iteration(&self, iteration: u32, context: &Context<u32>) {
        if iteration == 0 {
            context.add_task(self.root);
        }
    }
}

/// Runs BFS from `root` and returns the distance of every vertex
/// ([`UNREACHED`] for vertices outside the root's component).
pub fn run(base: &str, nshards: usize, root: VId, niters: u32, config: &Config) -> Result<Vec<u32>> {
    let program = Bfs::new(root);
    let mut engine: GraphEngine<u32, u32> = GraphEngine::new(base, nshards, true, config)?;
    engine.set_reset_vertexdata(true);
    engine.run(&program, niters)?;
    read_vertex_data::<u32>(base, engine.num_vertices())
}
