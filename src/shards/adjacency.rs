//! Adjacency codec.
//!
//! One record per source vertex with at least one edge in the shard, in
//! ascending source order:
//!
//! ```text
//! +---------+-------------------+-----+-----+-----+
//! | count c | c4: u32 if c=0xff | dst | dst | ... |
//! +---------+-------------------+-----+-----+-----+
//! ```
//!
//! A zero count byte followed by `k` skips `k + 1` source ids that have no
//! edges in the shard; longer runs use repeated zero/k pairs.

use crate::error::{Error, Result};
use crate::io::{IoBuf, SessionId, StripedIo};
use crate::types::VId;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const COUNT_ESCAPE: u8 = 0xff;
const MAX_SKIP: u32 = 254;
// A record head is at most one count byte plus a four-byte count.
const MAX_HEAD: usize = 5;

pub struct AdjacencyWriter<W: Write> {
    w: W,
    next_src: VId,
}

impl<W: Write> AdjacencyWriter<W> {
    pub fn new(w: W) -> Self {
        AdjacencyWriter { w, next_src: 0 }
    }

    /// Appends the record of `src`. Records must arrive in strictly
    /// ascending source order with a non-empty destination list.
    pub fn record(&mut self, src: VId, dsts: &[VId]) -> std::io::Result<()> {
        assert!(src >= self.next_src, "adjacency records out of order");
        assert!(!dsts.is_empty());
        let mut gap = src - self.next_src;
        while gap > 0 {
            self.w.write_all(&[0])?;
            gap -= 1;
            let k = gap.min(MAX_SKIP);
            self.w.write_all(&[k as u8])?;
            gap -= k;
        }
        if dsts.len() < COUNT_ESCAPE as usize {
            self.w.write_all(&[dsts.len() as u8])?;
        } else {
            self.w.write_all(&[COUNT_ESCAPE])?;
            self.w.write_all(&(dsts.len() as u32).to_ne_bytes())?;
        }
        self.w.write_all(crate::types::as_bytes(dsts))?;
        self.next_src = src + 1;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<W> {
        self.w.flush()?;
        Ok(self.w)
    }
}

enum Head {
    Skip(u32),
    Count(u32),
}

// Returns the parsed head and the bytes it consumed, or None if `bytes`
// ends inside the head.
fn parse_head(bytes: &[u8]) -> Option<(Head, usize)> {
    let &c = bytes.first()?;
    match c {
        0 => {
            let &k = bytes.get(1)?;
            Some((Head::Skip(k as u32 + 1), 2))
        }
        COUNT_ESCAPE => {
            if bytes.len() < MAX_HEAD {
                return None;
            }
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[1..5]);
            Some((Head::Count(u32::from_ne_bytes(raw)), MAX_HEAD))
        }
        c => Some((Head::Count(c as u32), 1)),
    }
}

/// One decoded adjacency record.
pub struct AdjRecord<'a> {
    pub src: VId,
    /// Byte offset of the record's count byte.
    pub head_pos: usize,
    /// Byte offset of the destination array.
    pub dst_pos: usize,
    dst_bytes: &'a [u8],
}

impl<'a> AdjRecord<'a> {
    pub fn len(&self) -> usize {
        self.dst_bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.dst_bytes.is_empty()
    }

    /// The destination array is packed behind one-byte counts, so it is
    /// not necessarily aligned; read each id unaligned.
    pub fn dst(&self, i: usize) -> VId {
        read_vid(self.dst_bytes, i)
    }

    pub fn dsts(&self) -> impl Iterator<Item = VId> + 'a {
        let bytes = self.dst_bytes;
        (0..bytes.len() / 4).map(move |i| read_vid(bytes, i))
    }
}

#[inline]
fn read_vid(bytes: &[u8], i: usize) -> VId {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
    VId::from_ne_bytes(raw)
}

/// Decodes a fully loaded adjacency file.
pub struct AdjacencyDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    next_src: VId,
}

impl<'a> AdjacencyDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        AdjacencyDecoder {
            bytes,
            pos: 0,
            next_src: 0,
        }
    }

    /// Byte offset just past the last record returned.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn next_src(&self) -> VId {
        self.next_src
    }
}

impl<'a> Iterator for AdjacencyDecoder<'a> {
    type Item = AdjRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.bytes.len() {
            let head_pos = self.pos;
            let (head, used) = parse_head(&self.bytes[self.pos..])
                .expect("truncated adjacency record head");
            self.pos += used;
            match head {
                Head::Skip(n) => self.next_src += n,
                Head::Count(count) => {
                    let nbytes = count as usize * 4;
                    let record = AdjRecord {
                        src: self.next_src,
                        head_pos,
                        dst_pos: self.pos,
                        dst_bytes: &self.bytes[self.pos..self.pos + nbytes],
                    };
                    self.pos += nbytes;
                    self.next_src += 1;
                    return Some(record);
                }
            }
        }
        None
    }
}

/// A streaming cursor over an adjacency file, refilled in chunks through
/// the I/O manager. Used by the sliding shards and the degree pass.
pub struct AdjacencyStream {
    session: SessionId,
    path: PathBuf,
    file_len: u64,
    buf: Arc<IoBuf>,
    buf_start: u64,
    buf_len: usize,
    pos: usize,
    next_src: VId,
    chunk_size: usize,
}

impl AdjacencyStream {
    pub fn open<P: AsRef<Path>>(io: &StripedIo, path: P, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_len = std::fs::metadata(&path)
            .map_err(|e| Error::io(e, &path))?
            .len();
        let session = io.open_session(&path, true)?;
        Ok(AdjacencyStream {
            session,
            path,
            file_len,
            buf: IoBuf::alloc(chunk_size.max(MAX_HEAD)),
            buf_start: 0,
            buf_len: 0,
            pos: 0,
            next_src: 0,
            chunk_size: chunk_size.max(MAX_HEAD),
        })
    }

    pub fn close(&self, io: &StripedIo) -> Result<()> {
        io.close_session(self.session)
    }

    /// Absolute file offset of the cursor.
    pub fn offset(&self) -> u64 {
        self.buf_start + self.pos as u64
    }

    pub fn next_src(&self) -> VId {
        self.next_src
    }

    pub fn eof(&self) -> bool {
        self.offset() >= self.file_len
    }

    /// Repositions the cursor; used to continue the stream where the
    /// memory shard left off.
    pub fn set_offset(&mut self, offset: u64, next_src: VId) {
        self.buf_start = offset;
        self.buf_len = 0;
        self.pos = 0;
        self.next_src = next_src;
    }

    // Makes at least `need` bytes available at the cursor (less only at
    // end of file). Returns the number of available bytes.
    fn ensure(&mut self, io: &StripedIo, need: usize) -> Result<usize> {
        let avail = self.buf_len - self.pos;
        let remaining = self.file_len - self.offset();
        if avail >= need.min(remaining as usize) {
            return Ok(avail);
        }
        self.buf_start += self.pos as u64;
        self.pos = 0;
        let want = (self.chunk_size.max(need) as u64).min(remaining) as usize;
        if want > self.buf.len() {
            self.buf = IoBuf::alloc(want);
        }
        io.preada_now(self.session, &self.buf, 0, want, self.buf_start)
            .map_err(|e| match e {
                Error::Io { source, offset, .. } => Error::io_at(source, &self.path, offset),
                other => other,
            })?;
        self.buf_len = want;
        Ok(want)
    }

    /// Decodes the next record, appending its destinations to `dsts`.
    /// Returns the record's source id, or `None` at end of file.
    pub fn next_record(&mut self, io: &StripedIo, dsts: &mut Vec<VId>) -> Result<Option<VId>> {
        loop {
            if self.eof() {
                return Ok(None);
            }
            self.ensure(io, MAX_HEAD)?;
            let bytes = unsafe { &self.buf.bytes()[self.pos..self.buf_len] };
            let (head, used) = parse_head(bytes).ok_or_else(|| {
                Error::Invariant(format!("truncated adjacency head in {:?}", self.path))
            })?;
            self.pos += used;
            match head {
                Head::Skip(n) => self.next_src += n,
                Head::Count(count) => {
                    let mut left = count as usize;
                    while left > 0 {
                        let avail = self.ensure(io, left * 4)?;
                        if avail < 4 {
                            return Err(Error::Invariant(format!(
                                "truncated adjacency record in {:?}",
                                self.path
                            )));
                        }
                        let take = (avail / 4).min(left);
                        let bytes = unsafe { &self.buf.bytes()[self.pos..self.pos + take * 4] };
                        dsts.extend((0..take).map(|i| read_vid(bytes, i)));
                        self.pos += take * 4;
                        left -= take;
                    }
                    let src = self.next_src;
                    self.next_src += 1;
                    return Ok(Some(src));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write as _;

    fn encode(records: &[(VId, Vec<VId>)]) -> Vec<u8> {
        let mut writer = AdjacencyWriter::new(Vec::new());
        for (src, dsts) in records {
            writer.record(*src, dsts).unwrap();
        }
        writer.finish().unwrap()
    }

    fn decode(bytes: &[u8]) -> Vec<(VId, Vec<VId>)> {
        AdjacencyDecoder::new(bytes)
            .map(|r| (r.src, r.dsts().collect()))
            .collect()
    }

    #[test]
    fn test_roundtrip_simple() {
        let records = vec![(0, vec![1, 2, 3]), (1, vec![2]), (2, vec![0, 4])];
        assert_eq!(decode(&encode(&records)), records);
    }

    #[test]
    fn test_roundtrip_gaps() {
        // Gaps of 1, 255 (one full zero pair), 256 and a leading gap.
        let records = vec![
            (3, vec![0]),
            (5, vec![1]),
            (260, vec![2]),
            (516, vec![3, 4]),
        ];
        assert_eq!(decode(&encode(&records)), records);
    }

    #[test]
    fn test_roundtrip_long_record() {
        let big: Vec<VId> = (0..300).collect();
        let records = vec![(0, vec![9]), (7, big)];
        let bytes = encode(&records);
        // 300 >= 0xff forces the four-byte count escape.
        assert_eq!(decode(&bytes), records);
    }

    #[test]
    fn test_skip_run_is_compact() {
        let bytes = encode(&[(1, vec![5])]);
        // Gap of one source id: a single (0, 0) pair.
        assert_eq!(bytes, vec![0, 0, 1, 5, 0, 0, 0]);
    }

    #[test]
    fn test_stream_matches_decoder() {
        let records: Vec<(VId, Vec<VId>)> = (0..200)
            .filter(|i| i % 3 != 1)
            .map(|i| (i, (0..(i % 7 + 1)).collect()))
            .collect();
        let bytes = encode(&records);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.adj");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let io = StripedIo::new(&Config::new());
        // A tiny chunk size forces many refills across record boundaries.
        let mut stream = AdjacencyStream::open(&io, &path, 16).unwrap();
        let mut got = Vec::new();
        let mut dsts = Vec::new();
        while let Some(src) = stream.next_record(&io, &mut dsts).unwrap() {
            got.push((src, dsts.clone()));
            dsts.clear();
        }
        assert_eq!(got, records);
        stream.close(&io).unwrap();
    }

    #[test]
    fn test_stream_set_offset() {
        let records = vec![(0, vec![1]), (1, vec![2]), (4, vec![3])];
        let bytes = encode(&records);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.adj");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let io = StripedIo::new(&Config::new());
        let mut stream = AdjacencyStream::open(&io, &path, 64).unwrap();
        let mut dsts = Vec::new();
        stream.next_record(&io, &mut dsts).unwrap();
        let (offset, next) = (stream.offset(), stream.next_src());

        // Re-enter at the saved position.
        let mut stream2 = AdjacencyStream::open(&io, &path, 64).unwrap();
        stream2.set_offset(offset, next);
        let mut dsts2 = Vec::new();
        assert_eq!(stream2.next_record(&io, &mut dsts2).unwrap(), Some(1));
        assert_eq!(dsts2, vec![2]);
        assert_eq!(stream2.next_record(&io, &mut dsts2).unwrap(), Some(4));
    }
}
