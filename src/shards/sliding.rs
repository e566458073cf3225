//! Sliding shard: a windowed read cursor over one shard.
//!
//! The adjacency stream and the edge-value block stream advance together,
//! one sub-interval at a time. The next block is prefetched asynchronously
//! while the current one is served; blocks a writable window touched are
//! written back when the window is committed.

use crate::error::{Error, Result};
use crate::filenames;
use crate::io::{IoBuf, SessionId, StripedIo};
use crate::shards::adjacency::AdjacencyStream;
use crate::shards::edata::EdataFiles;
use crate::engine::vertex::VertexArena;
use crate::types::{FixedWidth, SyncCell, VId};
use log::debug;
use std::mem::size_of;
use std::sync::Arc;

struct WindowBlock {
    idx: usize,
    session: SessionId,
    buf: Arc<IoBuf>,
    len: usize,
}

struct SlidingEdata {
    files: EdataFiles,
    total: u64,
    blocks: Vec<WindowBlock>,
    readahead: Option<WindowBlock>,
}

pub struct SlidingShard<E: FixedWidth> {
    shard: usize,
    adj: AdjacencyStream,
    pending: Option<(VId, Vec<VId>)>,
    edata: Option<SlidingEdata>,
    edge_idx: u64,
    write_back: bool,
    _marker: std::marker::PhantomData<E>,
}

impl<E: FixedWidth> SlidingShard<E> {
    /// `write_back` enables committing served windows back to disk; pass
    /// false when the program does not modify out-edges.
    pub fn open(
        io: &StripedIo,
        base: &str,
        shard: usize,
        nshards: usize,
        chunk_size: usize,
        write_back: bool,
    ) -> Result<Self> {
        let adj = AdjacencyStream::open(io, filenames::shard_adj(base, shard, nshards), chunk_size)?;
        let edata = if size_of::<E>() == 0 {
            None
        } else {
            let files = EdataFiles::new::<E>(base, shard, nshards);
            let total = files.read_size()?;
            Some(SlidingEdata {
                files,
                total,
                blocks: Vec::new(),
                readahead: None,
            })
        };
        Ok(SlidingShard {
            shard,
            adj,
            pending: None,
            edata,
            edge_idx: 0,
            write_back,
            _marker: std::marker::PhantomData,
        })
    }

    fn load_block(io: &StripedIo, ed: &mut SlidingEdata, idx: usize) -> Result<()> {
        match ed.readahead.take() {
            Some(block) if block.idx == idx => {
                io.wait_for_reads()?;
                ed.blocks.push(block);
            }
            other => {
                // A stale prefetch (after a cursor jump) is discarded.
                if let Some(stale) = other {
                    io.wait_for_reads()?;
                    io.close_session(stale.session)?;
                }
                let len = ed.files.block_len(idx, ed.total);
                let buf = IoBuf::alloc(len);
                let session = io.open_session(ed.files.block_path(idx), false)?;
                io.preada_now(session, &buf, 0, len, 0)?;
                ed.blocks.push(WindowBlock {
                    idx,
                    session,
                    buf,
                    len,
                });
            }
        }
        // Prefetch the next block while this one is served.
        let next = idx + 1;
        if (next * ed.files.blocksize) < ed.total as usize {
            let len = ed.files.block_len(next, ed.total);
            let buf = IoBuf::alloc(len);
            let session = io.open_session(ed.files.block_path(next), false)?;
            io.preada_async(session, &buf, 0, len, 0);
            ed.readahead = Some(WindowBlock {
                idx: next,
                session,
                buf,
                len,
            });
        }
        Ok(())
    }

    fn cell(&mut self, io: &StripedIo, edge: u64) -> Result<*const SyncCell<E>> {
        let ed = match &mut self.edata {
            Some(ed) => ed,
            None => return Ok(std::ptr::null()),
        };
        let byte = edge * size_of::<E>() as u64;
        let idx = (byte / ed.files.blocksize as u64) as usize;
        let within = (byte % ed.files.blocksize as u64) as usize;
        if ed.blocks.last().map(|b| b.idx) != Some(idx) {
            Self::load_block(io, ed, idx)?;
        }
        let block = ed.blocks.last().unwrap();
        if within + size_of::<E>() > block.len {
            return Err(Error::Invariant(format!(
                "edge data of shard {} is shorter than its adjacency",
                self.shard
            )));
        }
        Ok(unsafe { block.buf.cells::<E>(within, 1) }.as_ptr())
    }

    /// Advances the window up to the arena's end, filling out-edge slots
    /// of the sources it passes.
    pub fn read_next_vertices(
        &mut self,
        io: &StripedIo,
        arena: &VertexArena<E>,
    ) -> Result<()> {
        let window_end = arena.end();
        loop {
            let (src, dsts) = match self.pending.take() {
                Some(record) => record,
                None => {
                    let mut dsts = Vec::new();
                    match self.adj.next_record(io, &mut dsts)? {
                        Some(src) => (src, dsts),
                        None => return Ok(()),
                    }
                }
            };
            if src > window_end {
                self.pending = Some((src, dsts));
                return Ok(());
            }
            let in_window = src >= arena.start();
            for &dst in &dsts {
                let cell = self.cell(io, self.edge_idx)?;
                self.edge_idx += 1;
                if in_window {
                    arena.add_outedge(src, dst, cell);
                }
            }
        }
    }

    /// Writes back the blocks a window finished with. The block still
    /// being consumed stays resident for the next window.
    pub fn commit_window(&mut self, io: &StripedIo) -> Result<()> {
        let ed = match &mut self.edata {
            Some(ed) => ed,
            None => return Ok(()),
        };
        let current = (self.edge_idx * size_of::<E>() as u64 / ed.files.blocksize as u64) as usize;
        let write_back = self.write_back;
        let keep = ed.blocks.split_off(
            ed.blocks
                .iter()
                .position(|b| b.idx >= current)
                .unwrap_or(ed.blocks.len()),
        );
        for block in std::mem::replace(&mut ed.blocks, keep) {
            if write_back {
                io.pwritea_async(block.session, Arc::clone(&block.buf), 0, block.len, 0);
            }
            io.close_session(block.session)?;
        }
        Ok(())
    }

    /// Flushes all resident blocks (including a partially consumed one)
    /// and drops any prefetch. Must be called before the shard is loaded
    /// as the memory shard and at the end of an iteration.
    pub fn flush(&mut self, io: &StripedIo) -> Result<()> {
        let ed = match &mut self.edata {
            Some(ed) => ed,
            None => return Ok(()),
        };
        if let Some(stale) = ed.readahead.take() {
            io.wait_for_reads()?;
            io.close_session(stale.session)?;
        }
        for block in ed.blocks.drain(..) {
            if self.write_back {
                debug!("shard {}: flushing block {}", self.shard, block.idx);
                io.pwritea_async(block.session, Arc::clone(&block.buf), 0, block.len, 0);
            }
            io.close_session(block.session)?;
        }
        Ok(())
    }

    /// Repositions the stream where the memory shard left off.
    pub fn set_position(&mut self, offset: u64, next_src: VId, edge_idx: u64) {
        debug_assert!(self.edata.as_ref().map_or(true, |ed| ed.blocks.is_empty()));
        self.adj.set_offset(offset, next_src);
        self.pending = None;
        self.edge_idx = edge_idx;
    }

    pub fn close(&mut self, io: &StripedIo) -> Result<()> {
        self.flush(io)?;
        self.adj.close(io)
    }
}
