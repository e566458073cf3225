//! Memory shard: the fully loaded shard covering the execution interval.
//!
//! The whole adjacency file and every edge-value block are loaded up
//! front; a per-record offset table then gives each vertex update O(1)
//! access to its in-edge value slots. After the interval is processed the
//! whole edge-value blob is written back.

use crate::engine::vertex::VertexArena;
use crate::error::{Error, Result};
use crate::filenames;
use crate::io::{IoBuf, SessionId, StripedIo};
use crate::shards::adjacency::AdjacencyDecoder;
use crate::shards::edata::EdataFiles;
use crate::types::{FixedWidth, VId};
use log::debug;
use std::mem::size_of;
use std::sync::Arc;

struct MemRecord {
    src: VId,
    dst_pos: u32,
    count: u32,
    first_edge: u32,
    consumed: u32,
}

struct MemEdata {
    files: EdataFiles,
    total: u64,
    blob: Arc<IoBuf>,
    sessions: Vec<SessionId>,
}

pub struct MemoryShard<E: FixedWidth> {
    shard: usize,
    interval: (VId, VId),
    adj: Arc<IoBuf>,
    records: Vec<MemRecord>,
    edata: Option<MemEdata>,
    // Where the sliding stream continues after this interval:
    // (adjacency offset, next source id, edge ordinal).
    continuation: (u64, VId, u64),
    _marker: std::marker::PhantomData<E>,
}

impl<E: FixedWidth> MemoryShard<E> {
    pub fn load(
        io: &StripedIo,
        base: &str,
        shard: usize,
        nshards: usize,
        interval: (VId, VId),
    ) -> Result<Self> {
        let adj_path = filenames::shard_adj(base, shard, nshards);
        let adj_len = std::fs::metadata(&adj_path)
            .map_err(|e| Error::io(e, &adj_path))?
            .len() as usize;
        let adj = IoBuf::alloc(adj_len);
        let adj_session = io.open_session(&adj_path, true)?;
        io.preada_now(adj_session, &adj, 0, adj_len, 0)?;
        io.close_session(adj_session)?;

        let mut records = Vec::new();
        let mut total_edges = 0u64;
        let mut continuation = None;
        {
            let mut decoder = AdjacencyDecoder::new(unsafe { adj.bytes() });
            while let Some(record) = decoder.next() {
                if record.src > interval.1 && continuation.is_none() {
                    continuation = Some((record.head_pos as u64, record.src, total_edges));
                }
                records.push(MemRecord {
                    src: record.src,
                    dst_pos: record.dst_pos as u32,
                    count: record.len() as u32,
                    first_edge: total_edges as u32,
                    consumed: 0,
                });
                total_edges += record.len() as u64;
            }
        }
        let continuation =
            continuation.unwrap_or((adj_len as u64, interval.1 + 1, total_edges));
        debug!(
            "memory shard {}: {} records, {} edges",
            shard,
            records.len(),
            total_edges
        );

        let edata = if size_of::<E>() == 0 {
            None
        } else {
            let files = EdataFiles::new::<E>(base, shard, nshards);
            let total = files.read_size()?;
            if total != total_edges * size_of::<E>() as u64 {
                return Err(Error::Invariant(format!(
                    "shard {}: {} edge-value bytes for {} adjacency edges",
                    shard, total, total_edges
                )));
            }
            let blob = IoBuf::alloc(total as usize);
            let mut sessions = Vec::new();
            for block in 0..files.nblocks(total) {
                let session = io.open_session(files.block_path(block), false)?;
                io.preada_async(
                    session,
                    &blob,
                    block * files.blocksize,
                    files.block_len(block, total),
                    0,
                );
                sessions.push(session);
            }
            io.wait_for_reads()?;
            Some(MemEdata {
                files,
                total,
                blob,
                sessions,
            })
        };

        Ok(MemoryShard {
            shard,
            interval,
            adj,
            records,
            edata,
            continuation,
            _marker: std::marker::PhantomData,
        })
    }

    /// Fills the arena with in-edges for the sub-interval, and out-edges
    /// for sources falling inside it. In-edge consumption advances
    /// monotonically because sub-intervals ascend.
    ///
    /// An edge with both endpoints inside the sub-interval puts the same
    /// value cell behind one vertex's out-edge and the other's in-edge;
    /// both endpoints are flagged so the engine updates them one at a
    /// time.
    pub fn load_vertices(&mut self, arena: &VertexArena<E>, load_outedges: bool) {
        for record in &mut self.records {
            let dsts = unsafe {
                &self.adj.bytes()[record.dst_pos as usize..(record.dst_pos + record.count * 4) as usize]
            };
            let dst = |i: u32| -> VId {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&dsts[i as usize * 4..i as usize * 4 + 4]);
                VId::from_ne_bytes(raw)
            };
            if load_outedges && record.src >= arena.start() && record.src <= arena.end() {
                for i in 0..record.count {
                    let d = dst(i);
                    let cell = match &self.edata {
                        Some(ed) => unsafe {
                            ed.blob
                                .cells::<E>((record.first_edge + i) as usize * size_of::<E>(), 1)
                                .as_ptr()
                        },
                        None => std::ptr::null(),
                    };
                    if self.edata.is_some() && d >= arena.start() && d <= arena.end() {
                        arena.mark_conflict(record.src);
                        arena.mark_conflict(d);
                    }
                    arena.add_outedge(record.src, d, cell);
                }
            }
            while record.consumed < record.count {
                let d = dst(record.consumed);
                if d > arena.end() {
                    break;
                }
                debug_assert!(d >= arena.start(), "destination below sub-interval");
                let cell = match &self.edata {
                    Some(ed) => unsafe {
                        ed.blob
                            .cells::<E>(
                                (record.first_edge + record.consumed) as usize * size_of::<E>(),
                                1,
                            )
                            .as_ptr()
                    },
                    None => std::ptr::null(),
                };
                arena.add_inedge(d, record.src, cell);
                record.consumed += 1;
            }
        }
    }

    /// Queues the whole edge-value blob for write-back and releases the
    /// block sessions.
    pub fn commit(&mut self, io: &StripedIo) -> Result<()> {
        if let Some(ed) = &mut self.edata {
            debug!("memory shard {}: committing edge blob", self.shard);
            for (block, session) in ed.sessions.drain(..).enumerate() {
                io.pwritea_async(
                    session,
                    Arc::clone(&ed.blob),
                    block * ed.files.blocksize,
                    ed.files.block_len(block, ed.total),
                    0,
                );
                io.close_session(session)?;
            }
        }
        Ok(())
    }

    /// Drops the shard without writing anything back.
    pub fn release(&mut self, io: &StripedIo) -> Result<()> {
        if let Some(ed) = &mut self.edata {
            for session in ed.sessions.drain(..) {
                io.close_session(session)?;
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> (VId, VId) {
        self.interval
    }

    pub fn num_edges(&self) -> u64 {
        self.records.iter().map(|r| r.count as u64).sum()
    }

    /// Stream continuation for this shard's sliding cursor.
    pub fn continuation(&self) -> (u64, VId, u64) {
        self.continuation
    }
}
