//! External-memory sharder.
//!
//! Edges are buffered into RAM shovels, sorted by destination and spilled
//! to numbered run files. A k-way merge then streams the runs in
//! destination order into shard buffers; each full buffer is re-sorted by
//! source and emitted as one shard (adjacency file plus edge-value
//! blocks). Finally the intervals, vertex-count and degree files are
//! written.
//!
//! Sharding is not idempotent mid-run: a partial shard set must be
//! deleted (see [`crate::filenames::delete_shards`]) before retrying.

use crate::config::Config;
use crate::engine::degrees::{self, Degree};
use crate::error::{Error, Result};
use crate::filenames;
use crate::io::StripedIo;
use crate::preprocessing::kwaymerge::{self, MergeSink};
use crate::preprocessing::shovel::{self, ShovelEdge, ShovelSource};
use crate::shards::adjacency::{AdjacencyStream, AdjacencyWriter};
use crate::shards::edata::{BlockWriter, EdataFiles};
use crate::tools::GroupBy;
use crate::types::{FixedWidth, VId};
use log::{debug, info};
use rayon::slice::ParallelSliceMut;
use std::fs::File;
use std::io::BufWriter;
use std::mem::size_of;
use std::os::unix::fs::FileExt;

/// Collapses duplicate `(src, dst)` edges while a shard is finalized.
pub trait DuplicateEdgeFilter<E>: Send + Sync {
    /// Returns true if `first` should be kept over `second`.
    fn accept_first(&self, first: &E, second: &E) -> bool;
}

pub struct Sharder<E: FixedWidth> {
    base: String,
    config: Config,
    shovel_buf: Vec<ShovelEdge<E>>,
    shovel_size: usize,
    num_shovels: usize,
    max_vertex_id: VId,
    shoveled_edges: u64,
    no_edgevalues: bool,
    filter: Option<Box<dyn DuplicateEdgeFilter<E>>>,
}

impl<E: FixedWidth> Sharder<E> {
    pub fn new(base: &str, config: &Config) -> Self {
        let shovel_size =
            (config.membudget_mb() * 1024 * 1024 / 4 / size_of::<ShovelEdge<E>>()).max(16);
        Sharder {
            base: base.to_string(),
            config: config.clone(),
            shovel_buf: Vec::with_capacity(shovel_size),
            shovel_size,
            num_shovels: 0,
            max_vertex_id: 0,
            shoveled_edges: 0,
            no_edgevalues: false,
            filter: None,
        }
    }

    pub fn set_duplicate_filter(&mut self, filter: Box<dyn DuplicateEdgeFilter<E>>) {
        self.filter = Some(filter);
    }

    /// Skip edge-value block emission entirely.
    pub fn set_no_edgevalues(&mut self) {
        self.no_edgevalues = true;
    }

    pub fn num_edges(&self) -> u64 {
        self.shoveled_edges
    }

    pub fn max_vertex_id(&self) -> VId {
        self.max_vertex_id
    }

    pub fn add_edge(&mut self, src: VId, dst: VId) -> Result<()> {
        self.add_edge_with_value(src, dst, E::default())
    }

    pub fn add_edge_with_value(&mut self, src: VId, dst: VId, value: E) -> Result<()> {
        if src == dst {
            // Self-edges never reach the shards.
            return Ok(());
        }
        self.shovel_buf.push(ShovelEdge { src, dst, value });
        if self.shovel_buf.len() >= self.shovel_size {
            self.flush_shovel()?;
        }
        self.max_vertex_id = self.max_vertex_id.max(src).max(dst);
        self.shoveled_edges += 1;
        Ok(())
    }

    fn flush_shovel(&mut self) -> Result<()> {
        info!(
            "sorting shovel {} ({} edges)",
            self.num_shovels,
            self.shovel_buf.len()
        );
        self.shovel_buf.par_sort_unstable_by(shovel::dst_order);
        shovel::write_shovel(
            &filenames::shovel_file(&self.base, self.num_shovels),
            &self.shovel_buf,
        )?;
        self.shovel_buf.clear();
        self.num_shovels += 1;
        Ok(())
    }

    fn determine_nshards(&self, spec: &str) -> Result<usize> {
        if spec.contains("auto") || spec == "0" {
            let max_shardsize = self.config.membudget_mb() as f64 * 1024.0 * 1024.0 / 8.0;
            let nshards = (2.0
                + (self.shoveled_edges as f64 * size_of::<E>() as f64) / max_shardsize
                + 0.5) as usize;
            info!(
                "automatic shard count: {} (budget {} mb)",
                nshards,
                self.config.membudget_mb()
            );
            Ok(nshards.max(1))
        } else {
            spec.parse()
                .map_err(|_| Error::Config(format!("invalid shard count {:?}", spec)))
        }
    }

    /// Runs the merge phase and writes the full shard set. Returns the
    /// number of shards created.
    pub fn execute_sharding(&mut self, nshards_spec: &str) -> Result<usize> {
        if !self.shovel_buf.is_empty() || self.num_shovels == 0 {
            self.flush_shovel()?;
        }
        let nshards = self.determine_nshards(nshards_spec)?;
        if filenames::shards_exist(&self.base, nshards) {
            return Err(Error::Config(format!(
                "shard files for {} ({} shards) already exist; delete them before resharding",
                self.base, nshards
            )));
        }

        let membudget = self.config.membudget_mb() * 1024 * 1024;
        let count_inmem =
            membudget / 3 > (self.max_vertex_id as usize + 1) * size_of::<Degree>();
        let mut degrees =
            count_inmem.then(|| vec![Degree::default(); self.max_vertex_id as usize + 1]);

        let mut sink = ShardWriter {
            base: self.base.clone(),
            nshards,
            edges_per_shard: self.shoveled_edges / nshards as u64 + 1,
            max_vertex_id: self.max_vertex_id,
            no_edgevalues: self.no_edgevalues,
            filter: self.filter.as_deref(),
            degrees: degrees.as_mut(),
            buffer: Vec::new(),
            prev_dst: None,
            interval_start: 0,
            intervals: Vec::new(),
            shardnum: 0,
        };
        let bufsize = (membudget / 2 / self.num_shovels.max(1))
            .max(64 * size_of::<ShovelEdge<E>>());
        let sources = (0..self.num_shovels)
            .map(|i| ShovelSource::open(filenames::shovel_file(&self.base, i), bufsize))
            .collect::<Result<Vec<ShovelSource<E>>>>()?;
        kwaymerge::merge(sources, &mut sink, |e: &ShovelEdge<E>| (e.dst, e.src))?;
        let intervals = sink.intervals;

        for i in 0..self.num_shovels {
            let _ = std::fs::remove_file(filenames::shovel_file(&self.base, i));
        }

        filenames::write_intervals(&self.base, &intervals)?;
        filenames::write_num_vertices(&self.base, self.max_vertex_id as u64 + 1)?;
        match degrees {
            Some(degrees) => degrees::write_degree_file(&self.base, &degrees)?,
            None => streaming_degree_pass(
                &self.base,
                nshards,
                self.max_vertex_id as u64 + 1,
                &self.config,
            )?,
        }
        info!(
            "sharding done: {} shards, {} edges, {} vertices",
            nshards,
            self.shoveled_edges,
            self.max_vertex_id + 1
        );
        Ok(nshards)
    }
}

struct ShardWriter<'a, E: FixedWidth> {
    base: String,
    nshards: usize,
    edges_per_shard: u64,
    max_vertex_id: VId,
    no_edgevalues: bool,
    filter: Option<&'a dyn DuplicateEdgeFilter<E>>,
    degrees: Option<&'a mut Vec<Degree>>,
    buffer: Vec<ShovelEdge<E>>,
    prev_dst: Option<VId>,
    interval_start: VId,
    intervals: Vec<(VId, VId)>,
    shardnum: usize,
}

impl<'a, E: FixedWidth> ShardWriter<'a, E> {
    fn next_shard(&mut self) -> Result<()> {
        let end = self.prev_dst.unwrap_or(self.max_vertex_id);
        self.intervals.push((self.interval_start, end));
        self.interval_start = end + 1;
        let edges = std::mem::take(&mut self.buffer);
        let shard = self.shardnum;
        self.shardnum += 1;
        self.finish_shard(shard, edges)
    }

    fn finish_shard(&mut self, shard: usize, mut edges: Vec<ShovelEdge<E>>) -> Result<()> {
        debug!("finalizing shard {} with {} edges", shard, edges.len());
        edges.par_sort_unstable_by(shovel::src_order);

        if let Some(filter) = self.filter {
            let mut kept: Vec<ShovelEdge<E>> = Vec::with_capacity(edges.len());
            for edge in edges.drain(..) {
                match kept.last_mut() {
                    Some(prev) if prev.src == edge.src && prev.dst == edge.dst => {
                        if filter.accept_first(&edge.value, &prev.value) {
                            *prev = edge;
                        }
                    }
                    _ => kept.push(edge),
                }
            }
            debug!("after duplicate elimination: {} edges", kept.len());
            edges = kept;
        }

        let adj_path = filenames::shard_adj(&self.base, shard, self.nshards);
        let adj_file = File::create(&adj_path).map_err(|e| Error::io(e, &adj_path))?;
        let mut adj = AdjacencyWriter::new(BufWriter::new(adj_file));
        let mut blocks = if self.no_edgevalues {
            None
        } else {
            Some(BlockWriter::create(EdataFiles::new::<E>(
                &self.base,
                shard,
                self.nshards,
            ))?)
        };

        let mut dsts: Vec<VId> = Vec::new();
        for (src, run) in GroupBy::new(&edges, |e| e.src) {
            dsts.clear();
            dsts.extend(run.iter().map(|e| e.dst));
            adj.record(src, &dsts)
                .map_err(|e| Error::io(e, &adj_path))?;
            if let Some(blocks) = &mut blocks {
                for edge in run {
                    blocks.append(&edge.value)?;
                }
            }
            if let Some(degrees) = &mut self.degrees {
                degrees[src as usize].outdegree += run.len() as u32;
                for edge in run {
                    degrees[edge.dst as usize].indegree += 1;
                }
            }
        }
        adj.finish().map_err(|e| Error::io(e, &adj_path))?;
        if let Some(blocks) = blocks {
            blocks.finish()?;
        }
        Ok(())
    }
}

impl<'a, E: FixedWidth> MergeSink<ShovelEdge<E>> for ShardWriter<'a, E> {
    fn add(&mut self, edge: ShovelEdge<E>) -> Result<()> {
        // Cut only between distinct destinations, so every edge of one
        // destination lands in exactly one shard.
        if self.buffer.len() as u64 >= self.edges_per_shard && self.prev_dst != Some(edge.dst) {
            self.next_shard()?;
        }
        self.prev_dst = Some(edge.dst);
        self.buffer.push(edge);
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        self.next_shard()?;
        if self.shardnum != self.nshards {
            return Err(Error::Invariant(format!(
                "merge produced {} shards, expected {}; too few distinct destinations",
                self.shardnum, self.nshards
            )));
        }
        // Sources may exceed the last destination seen; the intervals must
        // still partition [0, max_vertex_id].
        if let Some(last) = self.intervals.last_mut() {
            last.1 = last.1.max(self.max_vertex_id);
        }
        Ok(())
    }
}

// Degree counting with window-bounded memory: one scan of every shard's
// adjacency file per vertex window.
fn streaming_degree_pass(
    base: &str,
    nshards: usize,
    nvertices: u64,
    config: &Config,
) -> Result<()> {
    info!("computing degrees with a streaming pass");
    let io = StripedIo::new(config);
    let path = filenames::degree_file(base);
    let out = File::create(&path).map_err(|e| Error::io(e, &path))?;
    out.set_len(nvertices * size_of::<Degree>() as u64)
        .map_err(|e| Error::io(e, &path))?;

    let window = config.maxwindow() as u64;
    let mut window_start = 0u64;
    while window_start < nvertices {
        let window_end = (window_start + window - 1).min(nvertices - 1);
        let mut counts = vec![Degree::default(); (window_end - window_start + 1) as usize];
        for shard in 0..nshards {
            let mut stream = AdjacencyStream::open(
                &io,
                filenames::shard_adj(base, shard, nshards),
                crate::config::DEFAULT_BLOCKSIZE,
            )?;
            let mut dsts = Vec::new();
            while let Some(src) = stream.next_record(&io, &mut dsts)? {
                let src = src as u64;
                if src >= window_start && src <= window_end {
                    counts[(src - window_start) as usize].outdegree += dsts.len() as u32;
                }
                for &dst in &dsts {
                    let dst = dst as u64;
                    if dst >= window_start && dst <= window_end {
                        counts[(dst - window_start) as usize].indegree += 1;
                    }
                }
                dsts.clear();
            }
            stream.close(&io)?;
        }
        out.write_all_at(
            crate::types::as_bytes(&counts),
            window_start * size_of::<Degree>() as u64,
        )
        .map_err(|e| Error::io_at(e, &path, window_start * size_of::<Degree>() as u64))?;
        window_start = window_end + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::adjacency::AdjacencyDecoder;

    fn shard_tiny(dir: &tempfile::TempDir, nshards: &str, membudget: usize) -> (String, usize) {
        let base = dir.path().join("tiny").to_string_lossy().into_owned();
        let mut config = Config::new();
        config.set("membudget_mb", membudget);
        let mut sharder: Sharder<u32> = Sharder::new(&base, &config);
        for &(src, dst) in &[(0, 1), (1, 2), (3, 4), (4, 5), (5, 3), (2, 2)] {
            sharder.add_edge_with_value(src, dst, src * 100 + dst).unwrap();
        }
        let nshards = sharder.execute_sharding(nshards).unwrap();
        (base, nshards)
    }

    fn decode_shard(base: &str, shard: usize, nshards: usize) -> Vec<(VId, VId)> {
        let bytes = std::fs::read(filenames::shard_adj(base, shard, nshards)).unwrap();
        AdjacencyDecoder::new(&bytes)
            .flat_map(|r| {
                let src = r.src;
                r.dsts().map(move |d| (src, d)).collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_single_shard_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (base, nshards) = shard_tiny(&dir, "1", 16);
        assert_eq!(nshards, 1);
        assert_eq!(filenames::read_num_vertices(&base).unwrap(), 6);
        assert_eq!(filenames::read_intervals(&base, 1).unwrap(), vec![(0, 5)]);

        // Self-edge (2, 2) is dropped; records ordered by src, dsts by dst.
        let edges = decode_shard(&base, 0, 1);
        assert_eq!(edges, vec![(0, 1), (1, 2), (3, 4), (4, 5), (5, 3)]);

        // Edge-value slots align one-for-one with the adjacency dsts.
        let files = EdataFiles::new::<u32>(&base, 0, 1);
        assert_eq!(files.read_size().unwrap(), 5 * 4);
        let block = std::fs::read(files.block_path(0)).unwrap();
        let values = crate::types::copy_values::<u32>(&block);
        assert_eq!(values, vec![1, 102, 304, 405, 503]);
    }

    #[test]
    fn test_degrees() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = shard_tiny(&dir, "1", 16);
        let bytes = std::fs::read(filenames::degree_file(&base)).unwrap();
        let degrees = crate::types::copy_values::<Degree>(&bytes);
        let expect = |i, o| Degree {
            indegree: i,
            outdegree: o,
        };
        assert_eq!(
            degrees,
            vec![
                expect(0, 1),
                expect(1, 1),
                expect(1, 0),
                expect(1, 1),
                expect(1, 1),
                expect(1, 1)
            ]
        );
        // Sum of in-degrees equals sum of out-degrees equals edge count.
        let total_in: u32 = degrees.iter().map(|d| d.indegree).sum();
        let total_out: u32 = degrees.iter().map(|d| d.outdegree).sum();
        assert_eq!((total_in, total_out), (5, 5));
    }

    #[test]
    fn test_interval_partition_and_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mod7").to_string_lossy().into_owned();
        let mut config = Config::new();
        config.set("membudget_mb", 16);
        let mut sharder: Sharder<u32> = Sharder::new(&base, &config);
        for i in 1..=100u32 {
            sharder.add_edge_with_value(i, (i * 7) % 100, i).unwrap();
        }
        let nshards = sharder.execute_sharding("4").unwrap();
        assert_eq!(nshards, 4);

        let intervals = filenames::read_intervals(&base, 4).unwrap();
        assert_eq!(intervals[0].0, 0);
        assert_eq!(intervals[3].1, 100);
        for w in intervals.windows(2) {
            assert_eq!(w[1].0, w[0].1 + 1);
        }

        // Every edge lands in the shard owning its destination. One input
        // edge (50, 50) is a self-edge and never reaches the shards.
        let mut total = 0;
        for (p, &(lo, hi)) in intervals.iter().enumerate() {
            for (_, dst) in decode_shard(&base, p, 4) {
                assert!(dst >= lo && dst <= hi);
                total += 1;
            }
        }
        assert_eq!(total, 99);
    }

    #[test]
    fn test_deterministic_resharding() {
        let dir = tempfile::tempdir().unwrap();
        let mut outputs = Vec::new();
        for run in 0..2 {
            let base = dir
                .path()
                .join(format!("det{}", run))
                .to_string_lossy()
                .into_owned();
            let mut config = Config::new();
            config.set("membudget_mb", 16);
            let mut sharder: Sharder<u32> = Sharder::new(&base, &config);
            for i in 1..=100u32 {
                sharder.add_edge_with_value(i, (i * 7) % 100, i).unwrap();
            }
            sharder.execute_sharding("4").unwrap();
            let mut bytes = Vec::new();
            for p in 0..4 {
                bytes.push(std::fs::read(filenames::shard_adj(&base, p, 4)).unwrap());
                let files = EdataFiles::new::<u32>(&base, p, 4);
                for b in 0..files.nblocks(files.read_size().unwrap()) {
                    bytes.push(std::fs::read(files.block_path(b)).unwrap());
                }
            }
            outputs.push(bytes);
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_multi_shovel_merge() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("multi").to_string_lossy().into_owned();
        // A zero budget clamps the shovel size to its minimum, forcing
        // many runs through the k-way merge.
        let mut config = Config::new();
        config.set("membudget_mb", 0);
        let mut sharder: Sharder<u32> = Sharder::new(&base, &config);
        for i in 1..=100u32 {
            sharder.add_edge_with_value(i, (i * 7) % 100, i).unwrap();
        }
        let nshards = sharder.execute_sharding("2").unwrap();

        let mut edges = Vec::new();
        for p in 0..nshards {
            edges.extend(decode_shard(&base, p, nshards));
        }
        edges.sort();
        let mut expect: Vec<(VId, VId)> = (1..=100u32)
            .map(|i| (i, (i * 7) % 100))
            .filter(|&(s, d)| s != d)
            .collect();
        expect.sort();
        assert_eq!(edges, expect);
    }

    #[test]
    fn test_duplicate_filter() {
        struct KeepSmaller;
        impl DuplicateEdgeFilter<u32> for KeepSmaller {
            fn accept_first(&self, first: &u32, second: &u32) -> bool {
                first < second
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dup").to_string_lossy().into_owned();
        let mut sharder: Sharder<u32> = Sharder::new(&base, &Config::new());
        sharder.set_duplicate_filter(Box::new(KeepSmaller));
        sharder.add_edge_with_value(0, 1, 9).unwrap();
        sharder.add_edge_with_value(0, 1, 3).unwrap();
        sharder.add_edge_with_value(0, 1, 5).unwrap();
        sharder.add_edge_with_value(1, 2, 1).unwrap();
        sharder.execute_sharding("1").unwrap();

        assert_eq!(decode_shard(&base, 0, 1), vec![(0, 1), (1, 2)]);
        let files = EdataFiles::new::<u32>(&base, 0, 1);
        let block = std::fs::read(files.block_path(0)).unwrap();
        assert_eq!(crate::types::copy_values::<u32>(&block), vec![3, 1]);
    }

    #[test]
    fn test_refuses_existing_shards() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = shard_tiny(&dir, "1", 16);
        let mut sharder: Sharder<u32> = Sharder::new(&base, &Config::new());
        sharder.add_edge(0, 1).unwrap();
        match sharder.execute_sharding("1") {
            Err(Error::Config(_)) => {}
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }
}
