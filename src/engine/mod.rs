//! The parallel-sliding-windows execution engine.
//!
//! Each iteration walks the shards in order. The shard owning the current
//! execution interval is loaded whole (the memory shard) while a window
//! slides across every other shard; vertices of the interval are updated
//! in parallel one sub-interval at a time, and modified edge values are
//! committed back before the window moves on. A shard fully scanned once
//! per iteration means an edge written through one endpoint in iteration
//! `k` is visible to the other endpoint in iteration `k + 1`.

pub mod context;
pub mod degrees;
pub mod scheduler;
pub mod vertex;
pub mod vertexdata;

pub use context::Context;
pub use vertex::{Edge, VertexRef};
pub use vertexdata::read_vertex_data;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::filenames;
use crate::io::StripedIo;
use crate::output::GraphOutput;
use crate::shards::edata::{self, EdataFiles};
use crate::shards::{MemoryShard, SlidingShard};
use crate::types::{FixedWidth, VId};
use degrees::DegreeData;
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;
use scheduler::Scheduler;
use std::mem::size_of;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use vertex::VertexArena;
use vertexdata::VertexDataFile;

/// A vertex-centric program. Only `update` is required; the hooks default
/// to no-ops. Updates run concurrently, so per-program state must be
/// synchronized by the program itself.
pub trait VertexProgram: Send + Sync {
    type VertexData: FixedWidth;
    type EdgeData: FixedWidth;

    fn update(
        &self,
        vertex: &VertexRef<Self::VertexData, Self::EdgeData>,
        context: &Context<Self::EdgeData>,
    );

    fn before_iteration(&self, _iteration: u32, _context: &Context<Self::EdgeData>) {}

    fn after_iteration(&self, _iteration: u32, _context: &Context<Self::EdgeData>) {}

    fn before_exec_interval(&self, _start: VId, _end: VId, _context: &Context<Self::EdgeData>) {}

    fn after_exec_interval(&self, _start: VId, _end: VId, _context: &Context<Self::EdgeData>) {}
}

pub struct GraphEngine<V: FixedWidth, E: FixedWidth> {
    base: String,
    config: Config,
    nshards: usize,
    intervals: Vec<(VId, VId)>,
    nvertices: u64,
    io: StripedIo,
    use_scheduler: bool,
    modifies_inedges: bool,
    modifies_outedges: bool,
    disable_outedges: bool,
    disable_vertexdata: bool,
    reset_vertexdata: bool,
    initialize_edges: bool,
    outputs: Vec<Arc<dyn GraphOutput<E>>>,
    _marker: std::marker::PhantomData<V>,
}

impl<V: FixedWidth, E: FixedWidth> GraphEngine<V, E> {
    pub fn new(base: &str, nshards: usize, use_scheduler: bool, config: &Config) -> Result<Self> {
        let intervals = filenames::read_intervals(base, nshards)?;
        let nvertices = filenames::read_num_vertices(base)?;
        match intervals.last() {
            Some(&(_, end)) if end as u64 + 1 == nvertices => {}
            _ => {
                return Err(Error::Config(format!(
                    "intervals of {} do not cover the {} vertices",
                    base, nvertices
                )))
            }
        }
        Ok(GraphEngine {
            base: base.to_string(),
            config: config.clone(),
            nshards,
            intervals,
            nvertices,
            io: StripedIo::new(config),
            use_scheduler,
            modifies_inedges: true,
            modifies_outedges: true,
            disable_outedges: false,
            disable_vertexdata: false,
            reset_vertexdata: false,
            initialize_edges: false,
            outputs: Vec::new(),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn set_modifies_inedges(&mut self, value: bool) {
        self.modifies_inedges = value;
    }

    pub fn set_modifies_outedges(&mut self, value: bool) {
        self.modifies_outedges = value;
    }

    /// Skip loading out-edges entirely; programs then see in-edges only.
    pub fn set_disable_outedges(&mut self, value: bool) {
        self.disable_outedges = value;
    }

    pub fn set_disable_vertexdata_storage(&mut self, value: bool) {
        self.disable_vertexdata = value;
    }

    /// Zero-fill the vertex data file at run start.
    pub fn set_reset_vertexdata(&mut self, value: bool) {
        self.reset_vertexdata = value;
    }

    /// Zero-fill every edge-value block at run start.
    pub fn set_initialize_edges_before_run(&mut self, value: bool) {
        self.initialize_edges = value;
    }

    /// Registers an output stream; returns its index for
    /// [`Context::output`].
    pub fn add_output(&mut self, output: Arc<dyn GraphOutput<E>>) -> usize {
        self.outputs.push(output);
        self.outputs.len() - 1
    }

    pub fn intervals(&self) -> &[(VId, VId)] {
        &self.intervals
    }

    pub fn num_vertices(&self) -> u64 {
        self.nvertices
    }

    // Largest sub-interval end whose estimated in-memory footprint fits
    // the budget, capped by `maxwindow`.
    fn subinterval_end(&self, degrees: &DegreeData, start: VId, cap_end: VId) -> VId {
        let budget = (self.config.membudget_mb() * 1024 * 1024 / 4) as u64;
        let mut used = 0u64;
        let mut end = start;
        for (i, d) in degrees.window_slice().iter().enumerate() {
            used += 64 + (d.indegree as u64 + d.outdegree as u64) * 32;
            if used > budget && i > 0 {
                break;
            }
            end = start + i as VId;
        }
        end.min(cap_end)
    }

    pub fn run<P>(&mut self, program: &P, niters: u32) -> Result<()>
    where
        P: VertexProgram<VertexData = V, EdgeData = E>,
    {
        info!(
            "engine start: {} shards, {} vertices, {} iterations",
            self.nshards, self.nvertices, niters
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.execthreads())
            .build()
            .map_err(|e| Error::Config(format!("cannot build thread pool: {}", e)))?;
        let scheduler = if self.use_scheduler {
            Some(Scheduler::new(self.nvertices as usize))
        } else {
            None
        };
        let mut vdata: Option<VertexDataFile<V>> = if self.disable_vertexdata {
            None
        } else {
            Some(VertexDataFile::open(
                &self.io,
                &self.base,
                self.nvertices,
                self.reset_vertexdata,
            )?)
        };
        if self.initialize_edges && size_of::<E>() > 0 {
            for shard in 0..self.nshards {
                let files = EdataFiles::new::<E>(&self.base, shard, self.nshards);
                edata::zero_fill(&files, files.read_size()?)?;
            }
        }
        let mut degrees = DegreeData::open(&self.io, &self.base)?;
        let last_iteration = AtomicI64::new(-1);
        let load_outedges = !self.disable_outedges;
        let write_back_windows = self.modifies_outedges && load_outedges;

        for iteration in 0..niters {
            let context = Context {
                iteration,
                num_iterations: niters,
                nvertices: self.nvertices,
                scheduler: scheduler.as_ref(),
                last_iteration: &last_iteration,
                outputs: &self.outputs,
            };
            info!(
                "iteration {}/{} ({} tasks)",
                iteration,
                niters,
                context.num_tasks()
            );
            program.before_iteration(iteration, &context);

            let mut sliding: Vec<SlidingShard<E>> = (0..self.nshards)
                .map(|shard| {
                    SlidingShard::open(
                        &self.io,
                        &self.base,
                        shard,
                        self.nshards,
                        self.config.blocksize(),
                        write_back_windows,
                    )
                })
                .collect::<Result<_>>()?;

            for p in 0..self.nshards {
                let interval = self.intervals[p];
                program.before_exec_interval(interval.0, interval.1, &context);

                // The memory shard reads bytes the sliding window may
                // still be writing; drain first.
                sliding[p].flush(&self.io)?;
                self.io.wait_for_writes()?;
                let mut memshard: MemoryShard<E> =
                    MemoryShard::load(&self.io, &self.base, p, self.nshards, interval)?;

                let mut sub_start = interval.0;
                while sub_start <= interval.1 {
                    let cap_end = interval
                        .1
                        .min(sub_start.saturating_add(self.config.maxwindow() as VId - 1));
                    degrees.load(&self.io, sub_start, cap_end)?;
                    let sub_end = self.subinterval_end(&degrees, sub_start, cap_end);
                    debug!("sub-interval [{}, {}] of shard {}", sub_start, sub_end, p);

                    let n = (sub_end - sub_start + 1) as usize;
                    let arena: VertexArena<E> = VertexArena::new(
                        sub_start,
                        sub_end,
                        &degrees.window_slice()[..n],
                        load_outedges,
                    );
                    if let Some(vdata) = &mut vdata {
                        vdata.load(&self.io, sub_start, sub_end)?;
                    }
                    self.io.wait_for_writes()?;

                    let failures: Mutex<Vec<Error>> = Mutex::new(Vec::new());
                    {
                        let arena = &arena;
                        let io = &self.io;
                        let failures = &failures;
                        let memshard = &mut memshard;
                        pool.install(|| {
                            rayon::scope(|s| {
                                s.spawn(move |_| {
                                    memshard.load_vertices(arena, load_outedges);
                                });
                                if load_outedges {
                                    for (q, shard) in sliding.iter_mut().enumerate() {
                                        if q == p {
                                            continue;
                                        }
                                        s.spawn(move |_| {
                                            if let Err(e) = shard.read_next_vertices(io, arena) {
                                                failures.lock().push(e);
                                            }
                                        });
                                    }
                                }
                            });
                        });
                    }
                    if let Some(failure) = failures.into_inner().into_iter().next() {
                        return Err(failure);
                    }

                    let vdata_cells = vdata.as_ref().map(|v| v.cells());
                    let scheduler_ref = scheduler.as_ref();
                    let context_ref = &context;
                    let update_vertex = |i: usize| {
                        let vid = sub_start + i as VId;
                        if let Some(s) = scheduler_ref {
                            if !s.has_task(vid) {
                                return;
                            }
                        }
                        let vertex = arena.vertex::<V>(i, vdata_cells.map(|c| &c[i]));
                        program.update(&vertex, context_ref);
                    };
                    pool.install(|| {
                        (0..arena.len()).into_par_iter().for_each(|i| {
                            if arena.parallel_safe(i) {
                                update_vertex(i);
                            }
                        });
                    });
                    // Vertices sharing an edge cell inside the sub-interval
                    // run one at a time.
                    for i in 0..arena.len() {
                        if !arena.parallel_safe(i) {
                            update_vertex(i);
                        }
                    }

                    if write_back_windows {
                        for (q, shard) in sliding.iter_mut().enumerate() {
                            if q != p {
                                shard.commit_window(&self.io)?;
                            }
                        }
                    }
                    if let Some(vdata) = &vdata {
                        vdata.commit(&self.io)?;
                    }
                    sub_start = sub_end + 1;
                }

                if self.modifies_inedges || write_back_windows {
                    memshard.commit(&self.io)?;
                } else {
                    memshard.release(&self.io)?;
                }
                let (offset, next_src, edge_idx) = memshard.continuation();
                sliding[p].set_position(offset, next_src, edge_idx);
                program.after_exec_interval(interval.0, interval.1, &context);
            }

            for shard in sliding.iter_mut() {
                shard.close(&self.io)?;
            }
            self.io.wait_for_writes()?;
            program.after_iteration(iteration, &context);

            if let Some(scheduler) = &scheduler {
                scheduler.new_iteration();
                if scheduler.num_tasks() == 0 {
                    info!("no tasks scheduled; terminating after iteration {}", iteration);
                    break;
                }
            }
            let last = last_iteration.load(Ordering::SeqCst);
            if last >= 0 && iteration as i64 >= last {
                info!("last iteration {} reached", last);
                break;
            }
        }

        if let Some(vdata) = &vdata {
            vdata.close(&self.io)?;
        }
        degrees.close(&self.io)?;
        self.io.wait_for_writes()?;
        Ok(())
    }
}
