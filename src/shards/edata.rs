//! Edge-data block files.
//!
//! A shard's edge values are stored in fixed-size blocks, one file per
//! block, under the shard's `edata.B<bs>` directory. Values appear in the
//! same order as the destination ids of the shard's adjacency file. A
//! `.size` sidecar records the total byte count so a shard can be checked
//! against its adjacency file when opened.

use crate::error::{Error, Result};
use crate::filenames;
use std::fs;
use std::io::Write;
use std::mem::size_of;
use std::path::PathBuf;

const DEFAULT_BLOCK: usize = 4096 * 1024;

/// Block size for an edge-value type: 4 MiB rounded up until it divides
/// evenly into values. The sharder and the engine derive it from the same
/// type, so no discovery pass is needed.
pub fn block_size<E>() -> usize {
    let esize = size_of::<E>();
    if esize == 0 {
        return DEFAULT_BLOCK;
    }
    let mut bs = DEFAULT_BLOCK;
    while bs % esize != 0 {
        bs += 1;
    }
    bs
}

#[derive(Clone)]
pub struct EdataFiles {
    pub dir: PathBuf,
    pub size_path: PathBuf,
    pub blocksize: usize,
}

impl EdataFiles {
    pub fn new<E>(base: &str, shard: usize, nshards: usize) -> Self {
        Self::with_block_size(base, shard, nshards, block_size::<E>())
    }

    pub fn with_block_size(base: &str, shard: usize, nshards: usize, blocksize: usize) -> Self {
        EdataFiles {
            dir: filenames::shard_edata_dir(base, shard, nshards, blocksize),
            size_path: filenames::shard_edata_size(base, shard, nshards),
            blocksize,
        }
    }

    pub fn block_path(&self, block: usize) -> PathBuf {
        filenames::edata_block(&self.dir, block)
    }

    pub fn nblocks(&self, total_bytes: u64) -> usize {
        ((total_bytes + self.blocksize as u64 - 1) / self.blocksize as u64) as usize
    }

    /// Bytes covered by block `i` of a shard holding `total_bytes`.
    pub fn block_len(&self, block: usize, total_bytes: u64) -> usize {
        let start = (block * self.blocksize) as u64;
        ((total_bytes - start) as usize).min(self.blocksize)
    }

    pub fn read_size(&self) -> Result<u64> {
        let text = fs::read_to_string(&self.size_path)
            .map_err(|e| Error::io(e, &self.size_path))?;
        text.trim().parse().map_err(|_| {
            Error::Invariant(format!("malformed edata size file {:?}", self.size_path))
        })
    }

    pub fn write_size(&self, total_bytes: u64) -> Result<()> {
        fs::write(&self.size_path, format!("{}", total_bytes))
            .map_err(|e| Error::io(e, &self.size_path))
    }
}

/// Sequential block emitter used while a shard is finalized.
pub struct BlockWriter {
    files: EdataFiles,
    buf: Vec<u8>,
    blockid: usize,
    total: u64,
}

impl BlockWriter {
    pub fn create(files: EdataFiles) -> Result<Self> {
        fs::create_dir_all(&files.dir).map_err(|e| Error::io(e, &files.dir))?;
        let buf = Vec::with_capacity(files.blocksize);
        Ok(BlockWriter {
            files,
            buf,
            blockid: 0,
            total: 0,
        })
    }

    fn flush_block(&mut self) -> Result<()> {
        let path = self.files.block_path(self.blockid);
        let mut f = fs::File::create(&path).map_err(|e| Error::io(e, &path))?;
        f.write_all(&self.buf).map_err(|e| Error::io(e, &path))?;
        self.blockid += 1;
        self.buf.clear();
        Ok(())
    }

    pub fn append<E: Copy>(&mut self, value: &E) -> Result<()> {
        if self.buf.len() == self.files.blocksize {
            self.flush_block()?;
        }
        self.buf
            .extend_from_slice(crate::types::as_bytes(std::slice::from_ref(value)));
        self.total += size_of::<E>() as u64;
        Ok(())
    }

    /// Flushes the trailing partial block and writes the size sidecar.
    pub fn finish(mut self) -> Result<u64> {
        if !self.buf.is_empty() || self.blockid == 0 {
            self.flush_block()?;
        }
        self.files.write_size(self.total)?;
        Ok(self.total)
    }
}

/// Rewrites every block of a shard with zeroes; used by
/// `set_initialize_edges_before_run`.
pub fn zero_fill(files: &EdataFiles, total_bytes: u64) -> Result<()> {
    for block in 0..files.nblocks(total_bytes) {
        let path = files.block_path(block);
        let len = files.block_len(block, total_bytes);
        fs::write(&path, vec![0u8; len]).map_err(|e| Error::io(e, &path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_divides_value_size() {
        assert_eq!(block_size::<u32>() % 4, 0);
        assert_eq!(block_size::<[u8; 12]>() % 12, 0);
        let odd = block_size::<[u8; 7]>();
        assert_eq!(odd % 7, 0);
        assert!(odd >= DEFAULT_BLOCK);
    }

    #[test]
    fn test_block_writer_splits_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("g").to_string_lossy().into_owned();
        let files = EdataFiles::with_block_size(&base, 0, 1, 8);
        let mut writer = BlockWriter::create(files.clone()).unwrap();
        for value in 0u32..5 {
            writer.append(&value).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 20);

        assert_eq!(files.read_size().unwrap(), 20);
        assert_eq!(files.nblocks(20), 3);
        assert_eq!(files.block_len(0, 20), 8);
        assert_eq!(files.block_len(2, 20), 4);
        assert_eq!(fs::read(files.block_path(0)).unwrap().len(), 8);
        assert_eq!(fs::read(files.block_path(2)).unwrap().len(), 4);
    }

    #[test]
    fn test_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("g").to_string_lossy().into_owned();
        let files = EdataFiles::with_block_size(&base, 0, 1, 8);
        let mut writer = BlockWriter::create(files.clone()).unwrap();
        for value in 1u32..=4 {
            writer.append(&value).unwrap();
        }
        writer.finish().unwrap();
        zero_fill(&files, 16).unwrap();
        assert_eq!(fs::read(files.block_path(0)).unwrap(), vec![0u8; 8]);
        assert_eq!(fs::read(files.block_path(1)).unwrap(), vec![0u8; 8]);
    }
}
