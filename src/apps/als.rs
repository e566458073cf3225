//! Alternating least squares matrix factorization.
//!
//! Ratings are edges from user vertices to item vertices; latent factors
//! live in memory, so vertex data storage is disabled and edges are never
//! modified. Each update solves the rank-R regularized normal equations
//! for one vertex against its neighbors' current factors.

use crate::config::Config;
use crate::engine::{Context, GraphEngine, VertexProgram, VertexRef};
use crate::error::Result;
use crate::types::SyncCell;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct Als<const R: usize> {
    factors: Vec<SyncCell<[f64; R]>>,
    lambda: f64,
    sse: Mutex<(f64, u64)>,
    last_rmse: Mutex<f64>,
}

impl<const R: usize> Als<R> {
    pub fn new(nvertices: u64, lambda: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let factors = (0..nvertices)
            .map(|_| {
                let mut f = [0.0; R];
                for x in f.iter_mut() {
                    *x = rng.gen::<f64>() * 0.1;
                }
                SyncCell::new(f)
            })
            .collect();
        Als {
            factors,
            lambda,
            sse: Mutex::new((0.0, 0)),
            last_rmse: Mutex::new(f64::INFINITY),
        }
    }

    pub fn rmse(&self) -> f64 {
        *self.last_rmse.lock()
    }
}

// Solves `a x = b` in place by Gaussian elimination with partial
// pivoting; the systems are tiny (rank x rank).
fn solve<const R: usize>(mut a: [[f64; R]; R], mut b: [f64; R]) -> [f64; R] {
    for col in 0..R {
        let pivot = (col..R)
            .max_by(|&i, &j| crate::tools::total_f64(a[i][col].abs(), a[j][col].abs()))
            .unwrap();
        a.swap(col, pivot);
        b.swap(col, pivot);
        let diag = a[col][col];
        if diag.abs() < 1e-12 {
            continue;
        }
        for row in col + 1..R {
            let factor = a[row][col] / diag;
            for k in col..R {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0; R];
    for col in (0..R).rev() {
        let mut sum = b[col];
        for k in col + 1..R {
            sum -= a[col][k] * x[k];
        }
        x[col] = if a[col][col].abs() < 1e-12 {
            0.0
        } else {
            sum / a[col][col]
        };
    }
    x
}

impl<const R: usize> VertexProgram for Als<R> {
    type VertexData = ();
    type EdgeData = f32;

    fn update(&self, vertex: &VertexRef<(), f32>, _context: &Context<f32>) {
        let nedges = vertex.num_edges();
        if nedges == 0 {
            return;
        }

        let mut xtx = [[0.0f64; R]; R];
        let mut xty = [0.0f64; R];
        for i in 0..nedges {
            let edge = vertex.edge(i);
            let nb = self.factors[edge.vertex_id() as usize].get();
            let rating = edge.get_data() as f64;
            for row in 0..R {
                xty[row] += nb[row] * rating;
                for col in 0..R {
                    xtx[row][col] += nb[row] * nb[col];
                }
            }
        }
        for d in 0..R {
            xtx[d][d] += self.lambda * nedges as f64;
        }
        let factor = solve(xtx, xty);
        self.factors[vertex.id() as usize].set(factor);

        // Training error accumulated over user vertices only, so every
        // rating is counted once per iteration.
        if vertex.num_outedges() > 0 {
            let mut sse = 0.0;
            for i in 0..vertex.num_outedges() {
                let edge = vertex.outedge(i);
                let nb = self.factors[edge.vertex_id() as usize].get();
                let prediction: f64 = (0..R).map(|k| factor[k] * nb[k]).sum();
                let err = edge.get_data() as f64 - prediction;
                sse += err * err;
            }
            let mut total = self.sse.lock();
            total.0 += sse;
            total.1 += vertex.num_outedges() as u64;
        }
    }

    fn before_iteration(&self, _iteration: u32, _context: &Context<f32>) {
        *self.sse.lock() = (0.0, 0);
    }

    fn after_iteration(&self, iteration: u32, _context: &Context<f32>) {
        let (sse, count) = *self.sse.lock();
        let rmse = (sse / count.max(1) as f64).sqrt();
        *self.last_rmse.lock() = rmse;
        log::info!("als iteration {}: training rmse {:.6}", iteration, rmse);
    }
}

/// Runs ALS over a sharded ratings graph; returns the final training
/// RMSE. `als.lambda` configures the regularization (default 0.065).
pub fn run<const R: usize>(
    base: &str,
    nshards: usize,
    niters: u32,
    config: &Config,
) -> Result<f64> {
    let nvertices = crate::filenames::read_num_vertices(base)?;
    let lambda = config
        .get("als.lambda")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.065);
    let program: Als<R> = Als::new(nvertices, lambda, 0xa15);
    let mut engine: GraphEngine<(), f32> = GraphEngine::new(base, nshards, false, config)?;
    engine.set_disable_vertexdata_storage(true);
    engine.set_modifies_inedges(false);
    engine.set_modifies_outedges(false);
    engine.run(&program, niters)?;
    Ok(program.rmse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_small_system() {
        // 2x + y = 5, x + 3y = 10 -> x = 1, y = 3.
        let x = solve([[2.0, 1.0], [1.0, 3.0]], [5.0, 10.0]);
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_solve_needs_pivoting() {
        let x = solve([[0.0, 1.0], [1.0, 0.0]], [2.0, 3.0]);
        assert!((x[0] - 3.0).abs() < 1e-9);
        assert!((x[1] - 2.0).abs() < 1e-9);
    }
}
