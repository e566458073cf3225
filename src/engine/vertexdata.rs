//! Flat per-vertex data file, paged by sub-interval.

use crate::error::{Error, Result};
use crate::filenames;
use crate::io::{IoBuf, SessionId, StripedIo};
use crate::types::{FixedWidth, SyncCell, VId};
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;

pub struct VertexDataFile<V: FixedWidth> {
    session: SessionId,
    path: PathBuf,
    window: (VId, VId),
    buf: Arc<IoBuf>,
    _marker: PhantomData<V>,
}

impl<V: FixedWidth> VertexDataFile<V> {
    /// Opens the vertex data file, creating or zero-filling it as needed.
    pub fn open(io: &StripedIo, base: &str, nvertices: u64, reset: bool) -> Result<Self> {
        let path = filenames::vertex_data_file(base, size_of::<V>());
        let expected = nvertices * size_of::<V>() as u64;
        let current = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if reset || current != expected {
            let f = std::fs::File::create(&path).map_err(|e| Error::io(e, &path))?;
            f.set_len(expected).map_err(|e| Error::io(e, &path))?;
        }
        let session = io.open_session(&path, false)?;
        Ok(VertexDataFile {
            session,
            path,
            window: (1, 0),
            buf: IoBuf::alloc(0),
            _marker: PhantomData,
        })
    }

    pub fn load(&mut self, io: &StripedIo, start: VId, end: VId) -> Result<()> {
        let nbytes = (end - start + 1) as usize * size_of::<V>();
        if nbytes > self.buf.len() {
            self.buf = IoBuf::alloc(nbytes);
        }
        io.preada_now(
            self.session,
            &self.buf,
            0,
            nbytes,
            start as u64 * size_of::<V>() as u64,
        )?;
        self.window = (start, end);
        Ok(())
    }

    /// Shared cells of the loaded window, indexed by `vid - start`.
    pub fn cells(&self) -> &[SyncCell<V>] {
        let (start, end) = self.window;
        if start > end {
            return &[];
        }
        unsafe { self.buf.cells::<V>(0, (end - start + 1) as usize) }
    }

    pub fn commit(&self, io: &StripedIo) -> Result<()> {
        let (start, end) = self.window;
        if start > end {
            return Ok(());
        }
        let nbytes = (end - start + 1) as usize * size_of::<V>();
        io.pwritea_now(
            self.session,
            &self.buf,
            0,
            nbytes,
            start as u64 * size_of::<V>() as u64,
        )
    }

    pub fn close(&self, io: &StripedIo) -> Result<()> {
        io.close_session(self.session)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Reads the full vertex data file after a run.
pub fn read_vertex_data<V: FixedWidth>(base: &str, nvertices: u64) -> Result<Vec<V>> {
    let path = filenames::vertex_data_file(base, size_of::<V>());
    let bytes = std::fs::read(&path).map_err(|e| Error::io(e, &path))?;
    if bytes.len() as u64 != nvertices * size_of::<V>() as u64 {
        return Err(Error::Invariant(format!(
            "vertex data file {:?} has {} bytes, expected {}",
            path,
            bytes.len(),
            nvertices * size_of::<V>() as u64
        )));
    }
    Ok(crate::types::copy_values::<V>(&bytes))
}
