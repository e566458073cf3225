//! Minimum spanning forest by Boruvka steps with graph contraction.
//!
//! Each round runs a few label-propagation iterations over the minimum
//! incident edges, then a contraction pass that emits settled MST edges
//! to a text output and unsettled edges (relabeled by component) into a
//! sharded output, which becomes the next round's smaller graph.

use crate::config::Config;
use crate::engine::{Context, GraphEngine, VertexProgram, VertexRef};
use crate::error::Result;
use crate::filenames;
use crate::output::{BasicTextOutput, ShardedGraphOutput};
use crate::preprocessing::{DuplicateEdgeFilter, Sharder};
use crate::types::{FixedWidth, VId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const UNSET: VId = VId::MAX;

/// Edge state for Boruvka: component labels written by each endpoint,
/// the original edge identity, the MST mark and the weight. The layout
/// has no implicit padding, so shard files are reproducible.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MstEdge {
    pub weight: f64,
    smaller_side: VId,
    larger_side: VId,
    pub orig_src: VId,
    pub orig_dst: VId,
    in_mst: u32,
    reserved: u32,
}

impl Default for MstEdge {
    fn default() -> Self {
        MstEdge {
            weight: 0.0,
            smaller_side: UNSET,
            larger_side: UNSET,
            orig_src: 0,
            orig_dst: 0,
            in_mst: 0,
            reserved: 0,
        }
    }
}

impl FixedWidth for MstEdge {
    fn parse_text(s: &str) -> Option<Self> {
        Some(MstEdge {
            weight: s.parse().ok()?,
            ..MstEdge::default()
        })
    }
}

impl MstEdge {
    pub fn with_weight(weight: f64) -> Self {
        MstEdge {
            weight,
            ..MstEdge::default()
        }
    }

    fn my_label(&self, my_id: VId, nb_id: VId) -> VId {
        if my_id < nb_id {
            self.smaller_side
        } else {
            self.larger_side
        }
    }

    fn neighbor_label(&self, my_id: VId, nb_id: VId) -> VId {
        if my_id < nb_id {
            self.larger_side
        } else {
            self.smaller_side
        }
    }

    fn set_my_label(&mut self, my_id: VId, nb_id: VId, label: VId) {
        if my_id < nb_id {
            self.smaller_side = label;
        } else {
            self.larger_side = label;
        }
    }

    fn labels_agree(&self) -> bool {
        self.smaller_side == self.larger_side
    }
}

/// Keeps the lightest copy of a duplicate edge in the contracted graph.
pub struct AcceptMinimum;

impl DuplicateEdgeFilter<MstEdge> for AcceptMinimum {
    fn accept_first(&self, first: &MstEdge, second: &MstEdge) -> bool {
        first.weight < second.weight
    }
}

pub struct BoruvkaStep;

impl VertexProgram for BoruvkaStep {
    type VertexData = ();
    type EdgeData = MstEdge;

    fn update(&self, vertex: &VertexRef<(), MstEdge>, context: &Context<MstEdge>) {
        if vertex.num_edges() == 0 {
            return;
        }

        if context.iteration == 0 {
            let mut min_weight = f64::INFINITY;
            let mut min_index = 0;
            for i in 0..vertex.num_edges() {
                let edge = vertex.edge(i);
                let mut data = edge.get_data();
                // Remember the original identity before any contraction
                // renames the endpoints.
                if data.orig_src == data.orig_dst {
                    data.orig_src = vertex.id();
                    data.orig_dst = edge.vertex_id();
                    edge.set_data(data);
                }
                // Ties prefer an edge already in the forest.
                if data.weight < min_weight
                    || (data.weight == min_weight && data.in_mst != 0)
                {
                    min_weight = data.weight;
                    min_index = i;
                }
            }
            let edge = vertex.edge(min_index);
            let mut data = edge.get_data();
            if data.in_mst == 0 {
                data.in_mst = 1;
                edge.set_data(data);
            }
        }

        // Component id: the minimum neighbor label over forest edges.
        let mut min_component = vertex.id();
        for i in 0..vertex.num_edges() {
            let edge = vertex.edge(i);
            let data = edge.get_data();
            if data.in_mst != 0 {
                min_component =
                    min_component.min(data.neighbor_label(vertex.id(), edge.vertex_id()));
            }
        }

        for i in 0..vertex.num_edges() {
            let edge = vertex.edge(i);
            let mut data = edge.get_data();
            if data.my_label(vertex.id(), edge.vertex_id()) != min_component {
                data.set_my_label(vertex.id(), edge.vertex_id(), min_component);
                edge.set_data(data);
                if data.in_mst != 0
                    && data.neighbor_label(vertex.id(), edge.vertex_id()) != min_component
                {
                    context.add_task(edge.vertex_id());
                }
            }
        }
    }

    fn before_iteration(&self, iteration: u32, context: &Context<MstEdge>) {
        log::info!(
            "boruvka iteration {}, scheduled tasks={}",
            iteration,
            context.num_tasks()
        );
    }
}

pub struct ContractionStep {
    mst_output: usize,
    contracted_output: usize,
    new_edges: AtomicBool,
    total_weight: Mutex<f64>,
}

impl ContractionStep {
    pub fn new(mst_output: usize, contracted_output: usize) -> Self {
        ContractionStep {
            mst_output,
            contracted_output,
            new_edges: AtomicBool::new(false),
            total_weight: Mutex::new(0.0),
        }
    }

    pub fn new_edges(&self) -> bool {
        self.new_edges.load(Ordering::Acquire)
    }

    pub fn total_weight(&self) -> f64 {
        *self.total_weight.lock()
    }
}

impl VertexProgram for ContractionStep {
    type VertexData = ();
    type EdgeData = MstEdge;

    fn update(&self, vertex: &VertexRef<(), MstEdge>, context: &Context<MstEdge>) {
        // Each edge is visited once, through its in-endpoint.
        for i in 0..vertex.num_inedges() {
            let edge = vertex.inedge(i);
            let mut data = edge.get_data();

            if data.in_mst != 0 && data.weight >= 0.0 {
                *self.total_weight.lock() += data.weight;
            }

            if data.in_mst != 0 && data.labels_agree() {
                if data.weight >= 0.0 {
                    context
                        .output(self.mst_output)
                        .output_edge(data.orig_src, data.orig_dst, data.weight)
                        .expect("mst output failed");
                }
            } else if !data.labels_agree() {
                let a = data.my_label(vertex.id(), edge.vertex_id());
                let b = data.neighbor_label(vertex.id(), edge.vertex_id());
                // A forest edge crossing components is emitted now, but
                // stays in the contracted graph with an invalid weight so
                // the components remain connected without affecting the
                // total.
                if data.in_mst != 0 {
                    if data.weight >= 0.0 {
                        context
                            .output(self.mst_output)
                            .output_edge(data.orig_src, data.orig_dst, data.weight)
                            .expect("mst output failed");
                    }
                    data.weight = -1.0;
                }
                data.smaller_side = UNSET;
                data.larger_side = UNSET;
                self.new_edges.store(true, Ordering::Release);
                context
                    .output(self.contracted_output)
                    .output_edgeval(a.min(b), a.max(b), data)
                    .expect("contracted output failed");
            }
            // Settled non-forest edges are discarded.
        }
    }
}

/// Runs Boruvka rounds with contraction until the forest is complete.
/// Returns the total forest weight; the selected edges are appended to
/// `<base>.mst`.
pub fn run(base: &str, nshards: usize, config: &Config) -> Result<f64> {
    let mut base = base.to_string();
    let mut nshards = nshards;
    let mst_out = Arc::new(BasicTextOutput::create(format!("{}.mst", base), "\t")?);
    let mut total_weight = 0.0;

    for round in 0..100 {
        log::info!("msf round {} on {} ({} shards)", round, base, nshards);

        let boruvka = BoruvkaStep;
        let mut engine: GraphEngine<(), MstEdge> =
            GraphEngine::new(&base, nshards, true, config)?;
        engine.set_disable_vertexdata_storage(true);
        let niters = if nshards > 1 { 3 } else { 1000 };
        engine.run(&boruvka, niters)?;

        let contracted_base = format!("{}C", base);
        let contracted_nshards = (nshards + 1) / 2;
        filenames::delete_shards(&contracted_base, contracted_nshards)?;
        let mut nested: Sharder<MstEdge> = Sharder::new(&contracted_base, config);
        nested.set_duplicate_filter(Box::new(AcceptMinimum));
        let contracted_out = Arc::new(ShardedGraphOutput::new(nested));

        let mut engine: GraphEngine<(), MstEdge> =
            GraphEngine::new(&base, nshards, true, config)?;
        engine.set_disable_vertexdata_storage(true);
        engine.set_modifies_outedges(false);
        engine.set_disable_outedges(true);
        let mst_index = engine.add_output(mst_out.clone());
        let contracted_index = engine.add_output(contracted_out.clone());
        let contraction = ContractionStep::new(mst_index, contracted_index);
        engine.run(&contraction, 1)?;

        total_weight += contraction.total_weight();
        if !contraction.new_edges() {
            log::info!("msf complete after {} rounds: weight {}", round + 1, total_weight);
            break;
        }

        nshards = contracted_out.finish_sharding(&contracted_nshards.to_string())?;
        base = contracted_base;
    }
    Ok(total_weight)
}
