//! Degree store.
//!
//! Flat `(in_degree, out_degree)` records for every vertex id, built by
//! the sharder and paged in by the engine to size vertex arenas.

use crate::error::{Error, Result};
use crate::filenames;
use crate::io::{IoBuf, SessionId, StripedIo};
use crate::types::VId;
use std::mem::size_of;
use std::sync::Arc;

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct Degree {
    pub indegree: u32,
    pub outdegree: u32,
}

/// Writes the whole degree file in one go (in-memory counting path).
pub fn write_degree_file(base: &str, degrees: &[Degree]) -> Result<()> {
    let path = filenames::degree_file(base);
    std::fs::write(&path, crate::types::as_bytes(degrees)).map_err(|e| Error::io(e, &path))
}

pub struct DegreeData {
    session: SessionId,
    nvertices: u64,
    window: (VId, VId),
    buf: Arc<IoBuf>,
}

impl DegreeData {
    pub fn open(io: &StripedIo, base: &str) -> Result<Self> {
        let path = filenames::degree_file(base);
        let len = std::fs::metadata(&path)
            .map_err(|e| Error::io(e, &path))?
            .len();
        let session = io.open_session(&path, true)?;
        Ok(DegreeData {
            session,
            nvertices: len / size_of::<Degree>() as u64,
            window: (1, 0),
            buf: IoBuf::alloc(0),
        })
    }

    pub fn nvertices(&self) -> u64 {
        self.nvertices
    }

    /// Loads the degrees of `[start, end]`.
    pub fn load(&mut self, io: &StripedIo, start: VId, end: VId) -> Result<()> {
        assert!((end as u64) < self.nvertices);
        let nbytes = (end - start + 1) as usize * size_of::<Degree>();
        if nbytes > self.buf.len() {
            self.buf = IoBuf::alloc(nbytes);
        }
        io.preada_now(
            self.session,
            &self.buf,
            0,
            nbytes,
            start as u64 * size_of::<Degree>() as u64,
        )?;
        self.window = (start, end);
        Ok(())
    }

    pub fn degree(&self, vid: VId) -> Degree {
        let (start, end) = self.window;
        assert!(vid >= start && vid <= end, "degree outside loaded window");
        unsafe { self.buf.typed::<Degree>(0, (end - start + 1) as usize)[(vid - start) as usize] }
    }

    pub fn window_slice(&self) -> &[Degree] {
        let (start, end) = self.window;
        if start > end {
            return &[];
        }
        unsafe { self.buf.typed::<Degree>(0, (end - start + 1) as usize) }
    }

    pub fn close(&self, io: &StripedIo) -> Result<()> {
        io.close_session(self.session)
    }
}
