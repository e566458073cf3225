//! Shovel runs: sorted intermediate files produced during external sort.

use crate::error::{Error, Result};
use crate::preprocessing::kwaymerge::MergeSource;
use crate::types::{FixedWidth, VId};
use std::fs::File;
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// One edge as it travels through the external sort.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ShovelEdge<E> {
    pub src: VId,
    pub dst: VId,
    pub value: E,
}

/// Shovel order: by destination, ties by source.
pub fn dst_order<E>(a: &ShovelEdge<E>, b: &ShovelEdge<E>) -> std::cmp::Ordering {
    (a.dst, a.src).cmp(&(b.dst, b.src))
}

/// Shard-finalization order: by source, ties by destination.
pub fn src_order<E>(a: &ShovelEdge<E>, b: &ShovelEdge<E>) -> std::cmp::Ordering {
    (a.src, a.dst).cmp(&(b.src, b.dst))
}

pub fn write_shovel<E: FixedWidth>(path: &Path, edges: &[ShovelEdge<E>]) -> Result<()> {
    std::fs::write(path, crate::types::as_bytes(edges)).map_err(|e| Error::io(e, path))
}

/// Buffered reader over one shovel file, a sorted merge source. The
/// buffer is word-aligned so edges can be viewed in place.
pub struct ShovelSource<E> {
    file: File,
    path: PathBuf,
    num_edges: u64,
    consumed: u64,
    buffer: Vec<u64>,
    capacity_edges: usize,
    buffer_edges: usize,
    buf_idx: usize,
    _marker: std::marker::PhantomData<E>,
}

impl<E: FixedWidth> ShovelSource<E> {
    pub fn open(path: PathBuf, bufsize_bytes: usize) -> Result<Self> {
        let file = File::open(&path).map_err(|e| Error::io(e, &path))?;
        let len = file.metadata().map_err(|e| Error::io(e, &path))?.len();
        let edge_size = size_of::<ShovelEdge<E>>() as u64;
        if len % edge_size != 0 {
            return Err(Error::Invariant(format!(
                "shovel {:?} is not a whole number of edges",
                path
            )));
        }
        let capacity_edges = (bufsize_bytes / edge_size as usize).max(1);
        let mut source = ShovelSource {
            file,
            path,
            num_edges: len / edge_size,
            consumed: 0,
            buffer: vec![0u64; (capacity_edges * edge_size as usize + 7) / 8],
            capacity_edges,
            buffer_edges: 0,
            buf_idx: 0,
            _marker: std::marker::PhantomData,
        };
        source.load_next()?;
        Ok(source)
    }

    fn load_next(&mut self) -> Result<()> {
        let edge_size = size_of::<ShovelEdge<E>>();
        let remaining = self.num_edges - self.consumed;
        let want = (self.capacity_edges as u64).min(remaining) as usize;
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.as_mut_ptr() as *mut u8,
                want * edge_size,
            )
        };
        let offset = self.consumed * edge_size as u64;
        self.file
            .read_exact_at(bytes, offset)
            .map_err(|e| Error::io_at(e, &self.path, offset))?;
        self.buffer_edges = want;
        self.buf_idx = 0;
        Ok(())
    }
}

impl<E: FixedWidth> MergeSource<ShovelEdge<E>> for ShovelSource<E> {
    fn has_more(&self) -> bool {
        self.consumed < self.num_edges
    }

    fn next(&mut self) -> Result<ShovelEdge<E>> {
        assert!(self.has_more());
        if self.buf_idx == self.buffer_edges {
            self.load_next()?;
        }
        let edges = unsafe {
            std::slice::from_raw_parts(
                self.buffer.as_ptr() as *const ShovelEdge<E>,
                self.buffer_edges,
            )
        };
        let edge = edges[self.buf_idx];
        self.buf_idx += 1;
        self.consumed += 1;
        Ok(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_small_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.shovel");
        let edges: Vec<ShovelEdge<u32>> = (0..100)
            .map(|i| ShovelEdge {
                src: i,
                dst: i * 2,
                value: i * 3,
            })
            .collect();
        write_shovel(&path, &edges).unwrap();

        // Buffer holds only a few edges, forcing repeated refills.
        let mut source: ShovelSource<u32> = ShovelSource::open(path, 40).unwrap();
        let mut got = Vec::new();
        while source.has_more() {
            got.push(source.next().unwrap());
        }
        assert_eq!(got.len(), edges.len());
        assert!(got
            .iter()
            .zip(&edges)
            .all(|(a, b)| (a.src, a.dst, a.value) == (b.src, b.dst, b.value)));
    }
}
