//! On-disk naming scheme and small helpers around the derived files.
//!
//! All files of a sharded graph are derived from a base path:
//!
//! ```text
//! <base>.numvertices                          vertex count (text)
//! <base>.<P>.intervals                        one interval end per line
//! <base>.shard.<p>_of_<P>.adj                 adjacency file of shard p
//! <base>.shard.<p>_of_<P>.edata.B<bs>/<i>     edge-value block i
//! <base>.shard.<p>_of_<P>.edata.size          total edge-value bytes (text)
//! <base>.degree                               (in, out) degree per vertex
//! <base>.<n>B.vdata                           vertex data, n bytes each
//! <base>.<i>.shovel                           temporary sorted run i
//! ```

use crate::error::{Error, Result};
use crate::types::VId;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

pub fn num_vertices_file(base: &str) -> PathBuf {
    PathBuf::from(format!("{}.numvertices", base))
}

pub fn intervals_file(base: &str, nshards: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}.intervals", base, nshards))
}

pub fn degree_file(base: &str) -> PathBuf {
    PathBuf::from(format!("{}.degree", base))
}

pub fn shard_adj(base: &str, shard: usize, nshards: usize) -> PathBuf {
    PathBuf::from(format!("{}.shard.{}_of_{}.adj", base, shard, nshards))
}

pub fn shard_edata_dir(base: &str, shard: usize, nshards: usize, blocksize: usize) -> PathBuf {
    PathBuf::from(format!(
        "{}.shard.{}_of_{}.edata.B{}",
        base, shard, nshards, blocksize
    ))
}

pub fn edata_block(dir: &PathBuf, block: usize) -> PathBuf {
    dir.join(block.to_string())
}

pub fn shard_edata_size(base: &str, shard: usize, nshards: usize) -> PathBuf {
    PathBuf::from(format!("{}.shard.{}_of_{}.edata.size", base, shard, nshards))
}

pub fn shovel_file(base: &str, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}.shovel", base, index))
}

pub fn vertex_data_file(base: &str, value_size: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}B.vdata", base, value_size))
}

/// Writes the intervals file: one inclusive interval end per line.
pub fn write_intervals(base: &str, intervals: &[(VId, VId)]) -> Result<()> {
    let path = intervals_file(base, intervals.len());
    let mut f = fs::File::create(&path).map_err(|e| Error::io(e, &path))?;
    for &(_, end) in intervals {
        writeln!(f, "{}", end).map_err(|e| Error::io(e, &path))?;
    }
    Ok(())
}

/// Reads the intervals file back into `(start, end)` pairs.
pub fn read_intervals(base: &str, nshards: usize) -> Result<Vec<(VId, VId)>> {
    let path = intervals_file(base, nshards);
    let text = fs::read_to_string(&path).map_err(|e| Error::io(e, &path))?;
    let mut intervals = Vec::with_capacity(nshards);
    let mut start = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let end: VId = line
            .trim()
            .parse()
            .map_err(|_| Error::Invariant(format!("malformed intervals file {:?}", path)))?;
        intervals.push((start, end));
        start = end + 1;
    }
    if intervals.len() != nshards {
        return Err(Error::Invariant(format!(
            "intervals file {:?} has {} entries, expected {}",
            path,
            intervals.len(),
            nshards
        )));
    }
    Ok(intervals)
}

pub fn write_num_vertices(base: &str, num_vertices: u64) -> Result<()> {
    let path = num_vertices_file(base);
    let mut f = fs::File::create(&path).map_err(|e| Error::io(e, &path))?;
    writeln!(f, "{}", num_vertices).map_err(|e| Error::io(e, &path))
}

pub fn read_num_vertices(base: &str) -> Result<u64> {
    let path = num_vertices_file(base);
    let text = fs::read_to_string(&path).map_err(|e| Error::io(e, &path))?;
    text.trim()
        .parse()
        .map_err(|_| Error::Invariant(format!("malformed vertex count file {:?}", path)))
}

/// Looks for an existing `<base>.<P>.intervals` file and returns `P`.
pub fn find_nshards(base: &str) -> Option<usize> {
    for nshards in 1..=4096 {
        if intervals_file(base, nshards).exists() {
            return Some(nshards);
        }
    }
    None
}

pub fn shards_exist(base: &str, nshards: usize) -> bool {
    intervals_file(base, nshards).exists() && shard_adj(base, 0, nshards).exists()
}

/// Removes a shard set and its derived files. Missing files are ignored;
/// a partial shard set left by an interrupted run must be deleted with this
/// before the sharder is called again.
pub fn delete_shards(base: &str, nshards: usize) -> Result<()> {
    let _ = fs::remove_file(intervals_file(base, nshards));
    let _ = fs::remove_file(num_vertices_file(base));
    let _ = fs::remove_file(degree_file(base));
    let base_path = PathBuf::from(base);
    let stem = base_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = match base_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    for shard in 0..nshards {
        let _ = fs::remove_file(shard_adj(base, shard, nshards));
        let _ = fs::remove_file(shard_edata_size(base, shard, nshards));
        // Block directories embed the block size in their name; match on
        // the prefix instead of guessing it.
        let prefix = format!("{}.shard.{}_of_{}.edata.B", stem, shard, nshards);
        if let Ok(entries) = fs::read_dir(&parent) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    fs::remove_dir_all(entry.path())
                        .map_err(|e| Error::io(e, &entry.path()))?;
                }
            }
        }
    }
    Ok(())
}
