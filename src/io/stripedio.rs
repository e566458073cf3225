//! The striped I/O manager.
//!
//! A session's logical byte range is split into stripes of `io.stripesize`
//! bytes; stripe `i` of a multiplexed session lives under the `<i+1>/`
//! subdirectory of `multiplex_root`. Each stripe owns `niothreads` worker
//! threads consuming three queues (priority, read, write). Reads are
//! drained ahead of writes whenever any read is pending, so synchronous
//! readers do not starve behind async prefetches.
//!
//! Small hot files can be pinned fully in memory: operations on a pinned
//! session degenerate to memcpy, async writes only mark the blob dirty and
//! the blob is written back when the session closes.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::buffer::IoBuf;
use crate::io::queue::TaskQueue;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type SessionId = usize;

#[derive(Clone, Copy)]
enum Action {
    Read,
    Write,
}

struct IoTask {
    action: Action,
    file: Arc<File>,
    path: Arc<PathBuf>,
    buf: Arc<IoBuf>,
    buf_off: usize,
    len: usize,
    offset: u64,
    countdown: Option<Arc<AtomicUsize>>,
}

struct ThreadInfo {
    prio: TaskQueue<IoTask>,
    reads: TaskQueue<IoTask>,
    writes: TaskQueue<IoTask>,
    pending_reads: AtomicI64,
    pending_writes: AtomicI64,
    running: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl ThreadInfo {
    fn new() -> Self {
        ThreadInfo {
            prio: TaskQueue::new(),
            reads: TaskQueue::new(),
            writes: TaskQueue::new(),
            pending_reads: AtomicI64::new(0),
            pending_writes: AtomicI64::new(0),
            running: AtomicBool::new(true),
            failure: Mutex::new(None),
        }
    }

    fn record_failure(&self, error: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

fn execute_task(info: &ThreadInfo, task: IoTask) {
    let region = unsafe { &mut task.buf.bytes_mut()[task.buf_off..task.buf_off + task.len] };
    let result = match task.action {
        Action::Read => task.file.read_exact_at(region, task.offset),
        Action::Write => task.file.write_all_at(region, task.offset),
    };
    if let Err(e) = result {
        info.record_failure(Error::io_at(e, &task.path, task.offset));
    }
    match task.action {
        Action::Read => info.pending_reads.fetch_sub(1, Ordering::AcqRel),
        Action::Write => info.pending_writes.fetch_sub(1, Ordering::AcqRel),
    };
    if let Some(countdown) = &task.countdown {
        countdown.fetch_sub(1, Ordering::AcqRel);
    }
}

fn io_thread_loop(info: Arc<ThreadInfo>) {
    while info.running.load(Ordering::Acquire) {
        // Prioritize reads whenever a reader is waiting.
        let task = if info.pending_reads.load(Ordering::Acquire) > 0 {
            info.prio.safepop().or_else(|| info.reads.safepop())
        } else {
            info.writes.safepop()
        };
        match task {
            Some(task) => execute_task(&info, task),
            None => thread::sleep(Duration::from_millis(2)),
        }
    }
    // Drain remaining work on shutdown so queued writes are not lost.
    loop {
        let task = info
            .prio
            .safepop()
            .or_else(|| info.reads.safepop())
            .or_else(|| info.writes.safepop());
        match task {
            Some(task) => execute_task(&info, task),
            None => break,
        }
    }
}

/// A file kept fully in memory.
pub struct PinnedFile {
    path: PathBuf,
    data: UnsafeCell<Box<[u8]>>,
    touched: AtomicBool,
}

unsafe impl Send for PinnedFile {}
unsafe impl Sync for PinnedFile {}

impl PinnedFile {
    unsafe fn read_into(&self, buf: &Arc<IoBuf>, buf_off: usize, nbytes: usize, off: u64) {
        let data = &*self.data.get();
        buf.bytes_mut()[buf_off..buf_off + nbytes]
            .copy_from_slice(&data[off as usize..off as usize + nbytes]);
    }

    unsafe fn write_from(&self, buf: &Arc<IoBuf>, buf_off: usize, nbytes: usize, off: u64) {
        let data = &mut *self.data.get();
        data[off as usize..off as usize + nbytes]
            .copy_from_slice(&buf.bytes()[buf_off..buf_off + nbytes]);
        self.touched.store(true, Ordering::Release);
    }
}

struct Session {
    path: PathBuf,
    files: Vec<Arc<File>>,
    pinned: Option<Arc<PinnedFile>>,
    start_mplex: usize,
    open: bool,
}

struct Chunk {
    thread: usize,
    buf_off: usize,
    len: usize,
    file_off: u64,
}

pub struct StripedIo {
    sessions: Mutex<Vec<Session>>,
    infos: Vec<Arc<ThreadInfo>>,
    threads: Vec<JoinHandle<()>>,
    stripesize: usize,
    multiplex: usize,
    niothreads: usize,
    multiplex_root: String,
    pinned: Mutex<Vec<Arc<PinnedFile>>>,
    preload_budget: AtomicI64,
}

impl StripedIo {
    pub fn new(config: &Config) -> Self {
        let multiplex = config.multiplex();
        let niothreads = config.niothreads();
        // Without multiplexing one stripe spans essentially the whole file.
        let stripesize = if multiplex > 1 {
            config.stripesize()
        } else {
            1024 * 1024 * 1024
        };
        let mut infos = Vec::with_capacity(multiplex * niothreads);
        let mut threads = Vec::with_capacity(multiplex * niothreads);
        for _ in 0..multiplex * niothreads {
            let info = Arc::new(ThreadInfo::new());
            infos.push(Arc::clone(&info));
            threads.push(thread::spawn(move || io_thread_loop(info)));
        }
        info!(
            "i/o manager: multiplex={} niothreads={} stripesize={}",
            multiplex, niothreads, stripesize
        );
        StripedIo {
            sessions: Mutex::new(Vec::new()),
            infos,
            threads,
            stripesize,
            multiplex,
            niothreads,
            multiplex_root: config.multiplex_root(),
            pinned: Mutex::new(Vec::new()),
            preload_budget: AtomicI64::new(config.preload_max_bytes() as i64),
        }
    }

    fn stripe_path(&self, logical: &Path, stripe: usize) -> PathBuf {
        if self.multiplex > 1 {
            PathBuf::from(format!(
                "{}{}/{}",
                self.multiplex_root,
                1 + stripe % self.multiplex,
                logical.display()
            ))
        } else {
            logical.to_path_buf()
        }
    }

    // The stripe permutation must be the same every time a file is opened.
    fn start_mplex(&self, path: &Path) -> usize {
        let mut hash: i64 = 1;
        for byte in path.to_string_lossy().bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as i64);
        }
        hash.unsigned_abs() as usize % self.multiplex
    }

    fn try_pin(&self, path: &Path) -> Option<Arc<PinnedFile>> {
        let len = std::fs::metadata(path).ok()?.len() as i64;
        if len == 0 {
            return None;
        }
        if self.preload_budget.fetch_sub(len, Ordering::AcqRel) < len {
            self.preload_budget.fetch_add(len, Ordering::AcqRel);
            return None;
        }
        let data = std::fs::read(path).ok()?;
        info!("pinned {:?} ({} bytes)", path, data.len());
        let pinned = Arc::new(PinnedFile {
            path: path.to_path_buf(),
            data: UnsafeCell::new(data.into_boxed_slice()),
            touched: AtomicBool::new(false),
        });
        self.pinned.lock().push(Arc::clone(&pinned));
        Some(pinned)
    }

    /// Opens a session. One descriptor is opened per stripe worker thread,
    /// plus a dedicated descriptor for the synchronous path when the
    /// session is not multiplexed.
    pub fn open_session<P: AsRef<Path>>(&self, path: P, readonly: bool) -> Result<SessionId> {
        let logical = path.as_ref().to_path_buf();
        let pinned = {
            let registry = self.pinned.lock();
            registry.iter().find(|p| p.path == logical).cloned()
        };
        let pinned = match pinned {
            Some(p) => Some(p),
            None => self.try_pin(&logical),
        };

        let mut files = Vec::new();
        if pinned.is_none() {
            let extra = if self.multiplex == 1 { 1 } else { 0 };
            for stripe in 0..self.multiplex {
                let fname = self.stripe_path(&logical, stripe);
                for _ in 0..self.niothreads + extra {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(!readonly)
                        .open(&fname)
                        .map_err(|e| Error::io(e, &fname))?;
                    files.push(Arc::new(file));
                }
            }
        }

        let mut sessions = self.sessions.lock();
        let id = sessions.len();
        debug!("open session {} for {:?} (readonly={})", id, logical, readonly);
        sessions.push(Session {
            start_mplex: self.start_mplex(&logical),
            path: logical,
            files,
            pinned,
            open: true,
        });
        Ok(id)
    }

    /// Closes the session's descriptors. The slot stays reserved so stale
    /// session ids never alias a newly opened session. A dirty pinned blob
    /// is written back here.
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        let (pinned, path) = {
            let mut sessions = self.sessions.lock();
            let s = &mut sessions[session];
            if !s.open {
                return Ok(());
            }
            s.open = false;
            s.files.clear();
            (s.pinned.take(), s.path.clone())
        };
        if let Some(pinned) = pinned {
            self.commit_pinned_file(&pinned)?;
        }
        debug!("closed session {} for {:?}", session, path);
        Ok(())
    }

    fn commit_pinned_file(&self, pinned: &PinnedFile) -> Result<()> {
        if pinned.touched.swap(false, Ordering::AcqRel) {
            let data = unsafe { &*pinned.data.get() };
            std::fs::write(&pinned.path, data).map_err(|e| Error::io(e, &pinned.path))?;
            info!("committed pinned file {:?}", pinned.path);
        }
        Ok(())
    }

    /// Writes every dirty pinned blob back to disk.
    pub fn commit_pinned(&self) -> Result<()> {
        let registry: Vec<_> = self.pinned.lock().iter().cloned().collect();
        for pinned in registry {
            self.commit_pinned_file(&pinned)?;
        }
        Ok(())
    }

    fn with_session<T>(&self, session: SessionId, f: impl FnOnce(&Session) -> T) -> T {
        let sessions = self.sessions.lock();
        f(&sessions[session])
    }

    fn stripe_chunks(&self, start_mplex: usize, nbytes: usize, off: u64) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let end = off + nbytes as u64;
        let mut idx = off;
        let mut buf_off = 0;
        let mut rng = rand::thread_rng();
        while idx < end {
            let stripe_off = (idx % self.stripesize as u64) as usize;
            let len = (self.stripesize - stripe_off).min((end - idx) as usize);
            let mplex = ((idx / self.stripesize as u64) as usize + start_mplex) % self.multiplex;
            let thread = mplex * self.niothreads + rng.gen_range(0..self.niothreads);
            chunks.push(Chunk {
                thread,
                buf_off,
                len,
                file_off: idx,
            });
            buf_off += len;
            idx += len as u64;
        }
        chunks
    }

    fn enqueue(
        &self,
        session: SessionId,
        action: Action,
        buf: &Arc<IoBuf>,
        buf_off: usize,
        nbytes: usize,
        off: u64,
        prio: bool,
        countdown: Option<Arc<AtomicUsize>>,
    ) -> usize {
        let (start_mplex, files, path) = self.with_session(session, |s| {
            (s.start_mplex, s.files.clone(), Arc::new(s.path.clone()))
        });
        let chunks = self.stripe_chunks(start_mplex, nbytes, off);
        let n = chunks.len();
        if let Some(countdown) = &countdown {
            countdown.store(n, Ordering::Release);
        }
        for chunk in chunks {
            let info = &self.infos[chunk.thread];
            let task = IoTask {
                action,
                file: Arc::clone(&files[chunk.thread]),
                path: Arc::clone(&path),
                buf: Arc::clone(buf),
                buf_off: buf_off + chunk.buf_off,
                len: chunk.len,
                offset: chunk.file_off,
                countdown: countdown.clone(),
            };
            match task.action {
                Action::Read => {
                    info.pending_reads.fetch_add(1, Ordering::AcqRel);
                    if prio {
                        info.prio.push(task);
                    } else {
                        info.reads.push(task);
                    }
                }
                Action::Write => {
                    info.pending_writes.fetch_add(1, Ordering::AcqRel);
                    info.writes.push(task);
                }
            }
        }
        n
    }

    /// Blocking read: the buffer range holds the file contents on return.
    pub fn preada_now(
        &self,
        session: SessionId,
        buf: &Arc<IoBuf>,
        buf_off: usize,
        nbytes: usize,
        off: u64,
    ) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        enum Direct {
            Pinned(Arc<PinnedFile>),
            File(Arc<File>, PathBuf),
            Striped,
        }
        let direct = self.with_session(session, |s| {
            if let Some(p) = &s.pinned {
                Direct::Pinned(Arc::clone(p))
            } else if self.multiplex == 1 {
                // Dedicated trailing descriptor for synchronous reads.
                Direct::File(Arc::clone(s.files.last().unwrap()), s.path.clone())
            } else {
                Direct::Striped
            }
        });
        match direct {
            Direct::Pinned(pinned) => {
                unsafe { pinned.read_into(buf, buf_off, nbytes, off) };
                Ok(())
            }
            Direct::File(file, path) => {
                let region = unsafe { &mut buf.bytes_mut()[buf_off..buf_off + nbytes] };
                file.read_exact_at(region, off)
                    .map_err(|e| Error::io_at(e, &path, off))
            }
            Direct::Striped => {
                let countdown = Arc::new(AtomicUsize::new(usize::MAX));
                self.enqueue(
                    session,
                    Action::Read,
                    buf,
                    buf_off,
                    nbytes,
                    off,
                    true,
                    Some(Arc::clone(&countdown)),
                );
                while countdown.load(Ordering::Acquire) > 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                self.collect_failure()
            }
        }
    }

    /// Queues a read; completion is observed through [`wait_for_reads`].
    ///
    /// [`wait_for_reads`]: StripedIo::wait_for_reads
    pub fn preada_async(
        &self,
        session: SessionId,
        buf: &Arc<IoBuf>,
        buf_off: usize,
        nbytes: usize,
        off: u64,
    ) {
        if nbytes == 0 {
            return;
        }
        let pinned = self.with_session(session, |s| s.pinned.clone());
        if let Some(pinned) = pinned {
            unsafe { pinned.read_into(buf, buf_off, nbytes, off) };
            return;
        }
        self.enqueue(session, Action::Read, buf, buf_off, nbytes, off, false, None);
    }

    /// Queues a write. The caller keeps the buffer alive by holding its
    /// `Arc`; dropping the last reference after [`wait_for_writes`] frees
    /// the buffer.
    ///
    /// [`wait_for_writes`]: StripedIo::wait_for_writes
    pub fn pwritea_async(
        &self,
        session: SessionId,
        buf: Arc<IoBuf>,
        buf_off: usize,
        nbytes: usize,
        off: u64,
    ) {
        if nbytes == 0 {
            return;
        }
        let pinned = self.with_session(session, |s| s.pinned.clone());
        if let Some(pinned) = pinned {
            unsafe { pinned.write_from(&buf, buf_off, nbytes, off) };
            return;
        }
        self.enqueue(session, Action::Write, &buf, buf_off, nbytes, off, false, None);
    }

    /// Synchronous striped write.
    pub fn pwritea_now(
        &self,
        session: SessionId,
        buf: &Arc<IoBuf>,
        buf_off: usize,
        nbytes: usize,
        off: u64,
    ) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        let (start_mplex, files, pinned, path) = self.with_session(session, |s| {
            (
                s.start_mplex,
                s.files.clone(),
                s.pinned.clone(),
                s.path.clone(),
            )
        });
        if let Some(pinned) = pinned {
            unsafe { pinned.write_from(buf, buf_off, nbytes, off) };
            return Ok(());
        }
        for chunk in self.stripe_chunks(start_mplex, nbytes, off) {
            let region = unsafe {
                &buf.bytes()[buf_off + chunk.buf_off..buf_off + chunk.buf_off + chunk.len]
            };
            files[chunk.thread]
                .write_all_at(region, chunk.file_off)
                .map_err(|e| Error::io_at(e, &path, chunk.file_off))?;
        }
        Ok(())
    }

    fn collect_failure(&self) -> Result<()> {
        for info in &self.infos {
            if let Some(error) = info.failure.lock().take() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Waits for every pending read, globally.
    pub fn wait_for_reads(&self) -> Result<()> {
        for info in &self.infos {
            while info.pending_reads.load(Ordering::Acquire) > 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.collect_failure()
    }

    /// Waits for every pending write, globally. Callers needing
    /// read-after-write on the same bytes must call this in between.
    pub fn wait_for_writes(&self) -> Result<()> {
        for info in &self.infos {
            while info.pending_writes.load(Ordering::Acquire) > 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.collect_failure()
    }
}

impl Drop for StripedIo {
    fn drop(&mut self) {
        let _ = self.wait_for_writes();
        for info in &self.infos {
            info.running.store(false, Ordering::Release);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        let _ = self.commit_pinned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Write;

    fn io_with(multiplex: usize, niothreads: usize) -> StripedIo {
        let mut config = Config::new();
        config.set("multiplex", multiplex).set("niothreads", niothreads);
        StripedIo::new(&config)
    }

    fn temp_file_with(len: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        (dir, path)
    }

    #[test]
    fn test_sync_roundtrip_random_offsets() {
        let io = io_with(1, 2);
        let (_dir, path) = temp_file_with(64 * 1024);
        let session = io.open_session(&path, false).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let offsets: Vec<u64> = (0..1000)
            .map(|_| rng.gen_range(0..(64 * 1024 - 8) / 8) * 8)
            .collect();
        for (i, &off) in offsets.iter().enumerate() {
            let buf = IoBuf::from_vec(types::as_bytes(&[i as u64]).to_vec());
            io.pwritea_now(session, &buf, 0, 8, off).unwrap();
        }
        // Later writes win on colliding offsets.
        let mut expect = std::collections::HashMap::new();
        for (i, &off) in offsets.iter().enumerate() {
            expect.insert(off, i as u64);
        }
        for (&off, &value) in &expect {
            let buf = IoBuf::alloc(8);
            io.preada_now(session, &buf, 0, 8, off).unwrap();
            assert_eq!(unsafe { buf.typed::<u64>(0, 1) }[0], value);
        }
        io.close_session(session).unwrap();
    }

    #[test]
    fn test_async_read_after_write() {
        let io = io_with(1, 2);
        let (_dir, path) = temp_file_with(4096);
        let session = io.open_session(&path, false).unwrap();

        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        io.pwritea_async(session, IoBuf::from_vec(data.clone()), 0, 4096, 0);
        io.wait_for_writes().unwrap();

        let buf = IoBuf::alloc(4096);
        io.preada_async(session, &buf, 0, 4096, 0);
        io.wait_for_reads().unwrap();
        assert_eq!(unsafe { buf.bytes() }, data.as_slice());
    }

    #[test]
    fn test_pinned_session() {
        let mut config = Config::new();
        config.set("preload.max_megabytes", 1);
        let io = StripedIo::new(&config);
        let (_dir, path) = temp_file_with(1024);

        let session = io.open_session(&path, true).unwrap();
        let payload = IoBuf::from_vec(vec![7u8; 512]);
        io.pwritea_async(session, Arc::clone(&payload), 0, 512, 256);
        let buf = IoBuf::alloc(512);
        io.preada_now(session, &buf, 0, 512, 256).unwrap();
        assert_eq!(unsafe { buf.bytes() }, &[7u8; 512][..]);

        // Not yet on disk; committed when the session closes.
        assert_eq!(std::fs::read(&path).unwrap()[256], 0);
        io.close_session(session).unwrap();
        assert_eq!(std::fs::read(&path).unwrap()[256], 7);
    }

    #[test]
    fn test_missing_file_error() {
        let io = io_with(1, 1);
        let err = io.open_session("/nonexistent/file", true).unwrap_err();
        match err {
            Error::Io { path, .. } => assert_eq!(path, PathBuf::from("/nonexistent/file")),
            other => panic!("unexpected error {}", other),
        }
    }
}
