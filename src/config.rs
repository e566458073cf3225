//! Run configuration.
//!
//! A [`Config`] is an explicit option map threaded through the I/O manager,
//! the sharder and the engine. Unset keys fall back to built-in defaults.

use std::collections::HashMap;

pub const DEFAULT_BLOCKSIZE: usize = 1024 * 1024;

#[derive(Clone, Default)]
pub struct Config {
    opts: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn set<K: Into<String>, V: ToString>(&mut self, key: K, value: V) -> &mut Self {
        self.opts.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.opts.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.opts
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: usize) -> usize {
        self.opts
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// Memory budget in megabytes; drives shovel sizing, automatic shard
    /// count selection and sub-window sizing.
    pub fn membudget_mb(&self) -> usize {
        self.get_int("membudget_mb", 1024)
    }

    /// Compute parallelism for vertex updates.
    pub fn execthreads(&self) -> usize {
        self.get_int("execthreads", rayon::current_num_threads())
    }

    /// I/O worker threads per stripe.
    pub fn niothreads(&self) -> usize {
        self.get_int("niothreads", 1).max(1)
    }

    /// Bytes per I/O block.
    pub fn blocksize(&self) -> usize {
        self.get_int("io.blocksize", DEFAULT_BLOCKSIZE)
    }

    /// Stripe size; defaults to half the I/O block size.
    pub fn stripesize(&self) -> usize {
        self.get_int("io.stripesize", self.blocksize() / 2)
    }

    /// Number of stripe roots.
    pub fn multiplex(&self) -> usize {
        self.get_int("multiplex", 1).max(1)
    }

    /// Parent directory containing the `1/`, `2/`, ... stripe roots.
    pub fn multiplex_root(&self) -> String {
        self.get_string("multiplex_root", "")
    }

    /// Maximum bytes the I/O manager may pin in memory.
    pub fn preload_max_bytes(&self) -> usize {
        self.get_int("preload.max_megabytes", 0) * 1024 * 1024
    }

    /// Hard cap on the number of vertices in one sub-interval.
    pub fn maxwindow(&self) -> usize {
        self.get_int("maxwindow", 5_000_000)
    }
}
