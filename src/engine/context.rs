//! Per-run context handed to vertex programs.

use crate::engine::scheduler::Scheduler;
use crate::output::GraphOutput;
use crate::types::{FixedWidth, VId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub struct Context<'a, E: FixedWidth> {
    pub iteration: u32,
    pub num_iterations: u32,
    pub nvertices: u64,
    pub(crate) scheduler: Option<&'a Scheduler>,
    pub(crate) last_iteration: &'a AtomicI64,
    pub(crate) outputs: &'a [Arc<dyn GraphOutput<E>>],
}

impl<'a, E: FixedWidth> Context<'a, E> {
    pub fn scheduler_enabled(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Schedules `vid` for the next iteration. Ignored when selective
    /// scheduling is disabled (everything runs anyway).
    pub fn add_task(&self, vid: VId) {
        if let Some(scheduler) = self.scheduler {
            scheduler.add_task(vid);
        }
    }

    /// Tasks scheduled for the current iteration.
    pub fn num_tasks(&self) -> usize {
        self.scheduler.map_or(0, |s| s.num_tasks())
    }

    /// Requests termination after iteration `iteration` completes.
    pub fn set_last_iteration(&self, iteration: u32) {
        self.last_iteration
            .store(iteration as i64, Ordering::SeqCst);
    }

    /// Output stream registered with the engine under `index`.
    pub fn output(&self, index: usize) -> &dyn GraphOutput<E> {
        &*self.outputs[index]
    }
}
