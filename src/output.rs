//! Append-only outputs, callable from parallel update callbacks.

use crate::error::{Error, Result};
use crate::preprocessing::sharder::Sharder;
use crate::types::{FixedWidth, VId};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub trait GraphOutput<E>: Send + Sync {
    /// Emits one weighted edge as text.
    fn output_edge(&self, src: VId, dst: VId, weight: f64) -> Result<()>;

    /// Emits one edge with its full value into a sharded output.
    fn output_edgeval(&self, src: VId, dst: VId, value: E) -> Result<()>;
}

/// Line-oriented single-file output.
pub struct BasicTextOutput {
    writer: Mutex<BufWriter<File>>,
    delimiter: String,
}

impl BasicTextOutput {
    pub fn create<P: AsRef<Path>>(path: P, delimiter: &str) -> Result<Self> {
        let file = File::create(path.as_ref()).map_err(|e| Error::io(e, path.as_ref()))?;
        Ok(BasicTextOutput {
            writer: Mutex::new(BufWriter::new(file)),
            delimiter: delimiter.to_string(),
        })
    }
}

impl Drop for BasicTextOutput {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

impl<E> GraphOutput<E> for BasicTextOutput {
    fn output_edge(&self, src: VId, dst: VId, weight: f64) -> Result<()> {
        let mut writer = self.writer.lock();
        writeln!(
            writer,
            "{}{}{}{}{}",
            src, self.delimiter, dst, self.delimiter, weight
        )
        .map_err(|e| Error::io(e, Path::new("<text output>")))
    }

    fn output_edgeval(&self, _src: VId, _dst: VId, _value: E) -> Result<()> {
        panic!("text output cannot carry typed edge values");
    }
}

/// Sharded output: emitted edges feed a nested sharder, producing a new
/// graph when the run finishes.
pub struct ShardedGraphOutput<E: FixedWidth> {
    sharder: Mutex<Sharder<E>>,
}

impl<E: FixedWidth> ShardedGraphOutput<E> {
    pub fn new(sharder: Sharder<E>) -> Self {
        ShardedGraphOutput {
            sharder: Mutex::new(sharder),
        }
    }

    pub fn num_edges(&self) -> u64 {
        self.sharder.lock().num_edges()
    }

    /// Runs the nested merge and returns the new shard count.
    pub fn finish_sharding(&self, nshards_spec: &str) -> Result<usize> {
        self.sharder.lock().execute_sharding(nshards_spec)
    }
}

impl<E: FixedWidth> GraphOutput<E> for ShardedGraphOutput<E> {
    fn output_edge(&self, _src: VId, _dst: VId, _weight: f64) -> Result<()> {
        panic!("sharded output requires the full edge value");
    }

    fn output_edgeval(&self, src: VId, dst: VId, value: E) -> Result<()> {
        self.sharder.lock().add_edge_with_value(src, dst, value)
    }
}
