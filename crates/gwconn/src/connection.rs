//! Buffered non-blocking connections.
//!
//! A [`Connection`] owns one fd and two [`gwcore::ByteBuffer`]s: unread
//! input bytes live in `inbuf[inbuf_start..]`, unwritten output bytes in
//! `outbuf[outbuf_start..]`. Everything else — framing, claim/lock
//! elision, FD-multiplexer registration — is built on that pair.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use gwcore::ByteBuffer;

use crate::error::{ConnError, FlushOutcome, RegisterOutcome, WaitOutcome, WriteOutcome};
use crate::errno::is_transient;
use crate::multiplexer::{Multiplexer, Readiness, Registration};
use crate::raw_io::{self, PollWait};

const READ_CHUNK: usize = 4096;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LENGTH_PREFIX_LEN: usize = 4;

/// Tracks which thread, if any, has `claim`ed a connection.
///
/// Once claimed, [`Slot::access`] stops taking its mutex for the
/// claiming thread — see the struct doc on [`Slot`] for why that's
/// sound.
struct ClaimState {
    claimed: AtomicBool,
    claimed_by: Mutex<Option<ThreadId>>,
}

impl ClaimState {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            claimed_by: Mutex::new(None),
        }
    }

    fn claim(&self) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            panic!("Connection::claim called on an already-claimed connection");
        }
        *self.claimed_by.lock().unwrap() = Some(thread::current().id());
    }

    fn bypass_for_current_thread(&self) -> bool {
        if !self.claimed.load(Ordering::Acquire) {
            return false;
        }
        *self.claimed_by.lock().unwrap() == Some(thread::current().id())
    }
}

/// A `Mutex<T>`-alike whose claiming thread bypasses the mutex
/// entirely: a pinned-to-one-thread cell is sound to access without
/// locking because nothing else is allowed to touch it, and that's
/// exactly `Connection::claim`'s contract ("no other thread may touch
/// the connection"). Unclaimed, this is a plain mutex and behaves
/// exactly like one.
struct Slot<T> {
    cell: std::cell::UnsafeCell<T>,
    mutex: Mutex<()>,
}

// Safety: `cell` is only ever reached through `access`, which either
// holds `mutex` for the duration of the borrow or has established (via
// `ClaimState`) that no other thread will call `access` concurrently.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn new(value: T) -> Self {
        Self {
            cell: std::cell::UnsafeCell::new(value),
            mutex: Mutex::new(()),
        }
    }

    fn access<'a>(&'a self, claim: &'a ClaimState) -> SlotGuard<'a, T> {
        if claim.bypass_for_current_thread() {
            SlotGuard::Bypassed(self.cell.get())
        } else {
            SlotGuard::Locked(self.mutex.lock().unwrap(), self.cell.get())
        }
    }
}

enum SlotGuard<'a, T> {
    Locked(std::sync::MutexGuard<'a, ()>, *mut T),
    Bypassed(*mut T),
}

impl<'a, T> std::ops::Deref for SlotGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        let ptr = match self {
            SlotGuard::Locked(_, p) => *p,
            SlotGuard::Bypassed(p) => *p,
        };
        unsafe { &*ptr }
    }
}

impl<'a, T> std::ops::DerefMut for SlotGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        let ptr = match self {
            SlotGuard::Locked(_, p) => *p,
            SlotGuard::Bypassed(p) => *p,
        };
        unsafe { &mut *ptr }
    }
}

struct InputState {
    inbuf: ByteBuffer,
    inbuf_start: usize,
    read_eof: bool,
    read_error: bool,
    listening_pollin: bool,
}

struct OutputState {
    outbuf: ByteBuffer,
    outbuf_start: usize,
    output_buffering_threshold: u32,
    listening_pollout: bool,
}

struct RegistrationState {
    mux: Arc<Multiplexer>,
    handle: Registration,
}

/// A non-blocking byte-stream connection with buffered output and
/// framed, non-blocking reads.
///
/// `Connection` exclusively owns its fd and both buffers; it only holds
/// a `Arc`/`Weak` relationship with the [`Multiplexer`] it may be
/// registered with, never the reverse.
pub struct Connection {
    fd: RawFd,
    claim: ClaimState,
    input: Slot<InputState>,
    output: Slot<OutputState>,
    registration: Mutex<Option<RegistrationState>>,
}

impl Connection {
    /// Connect to `addr` over TCP and wrap the resulting socket. Uses a
    /// non-blocking `connect(2)` followed by one bounded `poll(2)` wait
    /// for writability (default 10-second deadline) rather than parking
    /// the calling thread for the whole handshake.
    pub fn connect_tcp(addr: SocketAddr) -> Result<Arc<Connection>, ConnError> {
        Self::connect_tcp_timeout(addr, DEFAULT_CONNECT_TIMEOUT)
    }

    /// As [`Connection::connect_tcp`], with an explicit connect
    /// timeout.
    pub fn connect_tcp_timeout(
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<Connection>, ConnError> {
        let fd = raw_io::connect_tcp_nonblocking(addr, timeout).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                ConnError::ConnectTimedOut
            } else {
                ConnError::Connect(err)
            }
        })?;
        Self::wrap_fd(fd)
    }

    /// As [`Connection::connect_tcp`], but blocks the calling thread for
    /// the entire handshake instead of polling. Kept for callers that
    /// already run the connect on a throwaway thread and would rather
    /// not reason about the non-blocking path.
    pub fn connect_tcp_blocking(
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<Connection>, ConnError> {
        let fd = raw_io::connect_tcp_blocking(addr, timeout).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                ConnError::ConnectTimedOut
            } else {
                ConnError::Connect(err)
            }
        })?;
        Self::wrap_fd(fd)
    }

    /// Wrap an already-open fd (e.g. one returned by `accept(2)`),
    /// switching it to non-blocking mode. Takes ownership: the fd is
    /// closed when the returned `Connection` is dropped.
    pub fn wrap_fd(fd: RawFd) -> Result<Arc<Connection>, ConnError> {
        raw_io::set_nonblocking(fd).map_err(ConnError::SetNonblocking)?;
        Ok(Arc::new(Connection {
            fd,
            claim: ClaimState::new(),
            input: Slot::new(InputState {
                inbuf: ByteBuffer::new(),
                inbuf_start: 0,
                read_eof: false,
                read_error: false,
                listening_pollin: false,
            }),
            output: Slot::new(OutputState {
                outbuf: ByteBuffer::new(),
                outbuf_start: 0,
                output_buffering_threshold: 0,
                listening_pollout: false,
            }),
            registration: Mutex::new(None),
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Mark this connection as owned by the current thread, eliding
    /// subsequent locking for it. Calling this twice on the same
    /// connection (from any thread) is a program error.
    pub fn claim(&self) {
        self.claim.claim();
    }

    // ---- write path ----------------------------------------------------

    /// Append `bytes` to the output buffer and attempt a non-blocking
    /// drain.
    pub fn write(&self, bytes: &[u8]) -> WriteOutcome {
        let mut out = self.output.access(&self.claim);
        out.outbuf.append(bytes);
        self.try_write_locked(&mut out)
    }

    /// As [`Connection::write`], but prefixes `bytes` with its length as
    /// a 4-byte big-endian `u32`.
    pub fn write_with_length(&self, bytes: &[u8]) -> WriteOutcome {
        assert!(
            bytes.len() <= i32::MAX as usize,
            "frame too large for a 4-byte length prefix"
        );
        let mut out = self.output.access(&self.claim);
        out.outbuf.append(&(bytes.len() as u32).to_be_bytes());
        out.outbuf.append(bytes);
        self.try_write_locked(&mut out)
    }

    /// Block until the output buffer is fully drained.
    pub fn flush(&self) -> FlushOutcome {
        loop {
            let outcome = {
                let mut out = self.output.access(&self.claim);
                self.try_write_locked(&mut out)
            };
            match outcome {
                WriteOutcome::Flushed => return FlushOutcome::Done,
                WriteOutcome::Error => return FlushOutcome::Error,
                WriteOutcome::Buffered => {}
            }
            match raw_io::poll_fd(self.fd, Readiness::writable(), -1) {
                Ok(PollWait::Ready(_)) | Ok(PollWait::TimedOut) => continue,
                Ok(PollWait::Interrupted) => return FlushOutcome::Woken,
                Err(err) => {
                    tracing::warn!(target: "gwconn::connection", %err, "poll failed during flush");
                    return FlushOutcome::Error;
                }
            }
        }
    }

    /// Update the output-buffering threshold. If the new threshold is
    /// at or below the currently buffered byte count, attempts an
    /// immediate drain.
    pub fn set_output_buffering(&self, threshold: u32) {
        let mut out = self.output.access(&self.claim);
        out.output_buffering_threshold = threshold;
        self.try_write_locked(&mut out);
    }

    /// `outbuf_start` advances by whatever `write(2)` accepts; once it
    /// passes the halfway mark the consumed prefix is dropped so the
    /// buffer doesn't grow without bound under sustained partial
    /// writes.
    fn try_write_locked(&self, out: &mut OutputState) -> WriteOutcome {
        let buffered = out.outbuf.len() - out.outbuf_start;
        if (buffered as u64) < out.output_buffering_threshold as u64 {
            self.sync_pollout_interest(out);
            return WriteOutcome::Buffered;
        }
        if buffered == 0 {
            self.sync_pollout_interest(out);
            return WriteOutcome::Flushed;
        }

        match raw_io::raw_write(self.fd, &out.outbuf.as_slice()[out.outbuf_start..]) {
            Ok(n) => {
                out.outbuf_start += n;
                if out.outbuf_start * 2 > out.outbuf.len() {
                    out.outbuf.delete_prefix(out.outbuf_start);
                    out.outbuf_start = 0;
                }
            }
            Err(err) => {
                if !is_transient(&err) {
                    tracing::warn!(target: "gwconn::connection", %err, "fatal write error");
                    self.sync_pollout_interest(out);
                    return WriteOutcome::Error;
                }
            }
        }

        let still_buffered = out.outbuf.len() > out.outbuf_start;
        self.sync_pollout_interest(out);
        if still_buffered {
            WriteOutcome::Buffered
        } else {
            WriteOutcome::Flushed
        }
    }

    fn sync_pollout_interest(&self, out: &mut OutputState) {
        out.listening_pollout = out.outbuf.len() > out.outbuf_start;
        if let Some(reg) = self.registration.lock().unwrap().as_ref() {
            let _ = reg.handle.set_writable(out.listening_pollout);
        }
    }

    // ---- read path -------------------------------------------------

    fn read_into_inbuf_locked(&self, inp: &mut InputState) {
        if inp.read_eof || inp.read_error {
            return;
        }
        if inp.inbuf_start > 0 {
            inp.inbuf.delete_prefix(inp.inbuf_start);
            inp.inbuf_start = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        match raw_io::raw_read(self.fd, &mut chunk) {
            Ok(0) => inp.read_eof = true,
            Ok(n) => inp.inbuf.append(&chunk[..n]),
            Err(err) => {
                if !is_transient(&err) {
                    tracing::warn!(target: "gwconn::connection", %err, "fatal read error");
                    inp.read_error = true;
                }
            }
        }
        self.sync_pollin_interest(inp);
    }

    fn sync_pollin_interest(&self, inp: &mut InputState) {
        inp.listening_pollin = !(inp.read_eof || inp.read_error);
        if let Some(reg) = self.registration.lock().unwrap().as_ref() {
            let _ = reg.handle.set_readable(inp.listening_pollin);
        }
    }

    /// Try `attempt` against the current buffer; if it can't be
    /// satisfied, perform exactly one more non-blocking read and retry
    /// once more. Every framed read goes through this.
    fn with_retry<T>(&self, mut attempt: impl FnMut(&mut InputState) -> Option<T>) -> Option<T> {
        let mut inp = self.input.access(&self.claim);
        if let Some(v) = attempt(&mut inp) {
            return Some(v);
        }
        self.read_into_inbuf_locked(&mut inp);
        attempt(&mut inp)
    }

    /// Return all currently available bytes, or `None` if none.
    pub fn read_everything(&self) -> Option<Vec<u8>> {
        self.with_retry(|inp| {
            let available = inp.inbuf.len() - inp.inbuf_start;
            if available == 0 {
                return None;
            }
            let bytes = inp.inbuf.copy_range(inp.inbuf_start, available);
            inp.inbuf_start = inp.inbuf.len();
            Some(bytes)
        })
    }

    /// Return exactly `n` bytes, or `None` if not yet available.
    pub fn read_fixed(&self, n: usize) -> Option<Vec<u8>> {
        self.with_retry(|inp| {
            let available = inp.inbuf.len() - inp.inbuf_start;
            if available < n {
                return None;
            }
            let bytes = inp.inbuf.copy_range(inp.inbuf_start, n);
            inp.inbuf_start += n;
            Some(bytes)
        })
    }

    /// Return the bytes up to (not including) the next LF, stripping a
    /// trailing CR immediately before it. `None` if no LF is yet
    /// available; nothing is consumed in that case.
    pub fn read_line(&self) -> Option<Vec<u8>> {
        self.with_retry(|inp| {
            let lf = inp.inbuf.find_byte(b'\n', inp.inbuf_start)?;
            let mut end = lf;
            if end > inp.inbuf_start && inp.inbuf.as_slice()[end - 1] == b'\r' {
                end -= 1;
            }
            let bytes = inp.inbuf.copy_range(inp.inbuf_start, end - inp.inbuf_start);
            inp.inbuf_start = lf + 1;
            Some(bytes)
        })
    }

    /// Read a 4-byte big-endian length prefix followed by that many
    /// payload bytes. A negative (top-bit-set) length is corruption:
    /// the 4 bytes are discarded and framing resumes from the next
    /// position.
    pub fn read_with_length(&self) -> Option<Vec<u8>> {
        enum Step {
            Corrupt,
            Frame(Vec<u8>),
        }

        loop {
            let step = self.with_retry(|inp| {
                let available = inp.inbuf.len() - inp.inbuf_start;
                if available < LENGTH_PREFIX_LEN {
                    return None;
                }
                let raw = inp.inbuf.copy_range(inp.inbuf_start, LENGTH_PREFIX_LEN);
                let len = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if len < 0 {
                    inp.inbuf_start += LENGTH_PREFIX_LEN;
                    return Some(Step::Corrupt);
                }
                let len = len as usize;
                if available - LENGTH_PREFIX_LEN < len {
                    return None;
                }
                let bytes = inp.inbuf.copy_range(inp.inbuf_start + LENGTH_PREFIX_LEN, len);
                inp.inbuf_start += LENGTH_PREFIX_LEN + len;
                Some(Step::Frame(bytes))
            });
            match step {
                None => return None,
                Some(Step::Corrupt) => continue,
                Some(Step::Frame(bytes)) => return Some(bytes),
            }
        }
    }

    /// Scan for `start_mark`, discard anything before it, then scan for
    /// `end_mark` and return the inclusive `[start_mark..=end_mark]`
    /// slice. If `start_mark` is missing entirely, the whole buffer is
    /// discarded. If `end_mark` is missing after a found start, nothing
    /// further is consumed.
    pub fn read_packet(&self, start_mark: u8, end_mark: u8) -> Option<Vec<u8>> {
        self.with_retry(|inp| match inp.inbuf.find_byte(start_mark, inp.inbuf_start) {
            Some(start) => {
                inp.inbuf_start = start;
                let end = inp.inbuf.find_byte(end_mark, start + 1)?;
                let len = end - start + 1;
                let bytes = inp.inbuf.copy_range(start, len);
                inp.inbuf_start = end + 1;
                Some(bytes)
            }
            None => {
                inp.inbuf_start = inp.inbuf.len();
                None
            }
        })
    }

    // ---- polling integration -------------------------------------------

    /// Register with `mux`, dispatching `callback` on every readable
    /// event. Idempotent if already registered with the same `mux`
    /// (the callback is swapped in); fails if registered elsewhere.
    pub fn register(
        self: &Arc<Self>,
        mux: &Arc<Multiplexer>,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> RegisterOutcome {
        {
            let existing = self.registration.lock().unwrap();
            if let Some(state) = existing.as_ref() {
                if !Arc::ptr_eq(&state.mux, mux) {
                    return RegisterOutcome::AlreadyRegisteredElsewhere;
                }
            }
        }
        // Drop any prior registration (to this same mux, re-binding the
        // callback) before installing the new one.
        let _ = self.registration.lock().unwrap().take();

        let initial_interest = {
            let out = self.output.access(&self.claim);
            let inp = self.input.access(&self.claim);
            Readiness {
                readable: !(inp.read_eof || inp.read_error),
                writable: out.outbuf.len() > out.outbuf_start,
            }
        };

        let weak_self = Arc::downgrade(self);
        let user_callback: Arc<dyn Fn(&Arc<Connection>) + Send + Sync> = Arc::new(callback);
        let handle = mux
            .register(self.fd, initial_interest, move |_fd, readiness| {
                if let Some(conn) = weak_self.upgrade() {
                    poll_callback(&conn, readiness, &user_callback);
                }
            })
            .expect("multiplexer registration failed");

        *self.registration.lock().unwrap() = Some(RegistrationState {
            mux: mux.clone(),
            handle,
        });
        {
            let mut out = self.output.access(&self.claim);
            out.listening_pollout = initial_interest.writable;
        }
        {
            let mut inp = self.input.access(&self.claim);
            inp.listening_pollin = initial_interest.readable;
        }
        RegisterOutcome::Registered
    }

    /// Clear registration and listening flags, unregistering from
    /// whichever multiplexer this was registered with (quiesced: any
    /// in-flight callback invocation finishes before this returns).
    pub fn unregister(&self) {
        let _ = self.registration.lock().unwrap().take();
        {
            let mut out = self.output.access(&self.claim);
            out.listening_pollout = false;
        }
        {
            let mut inp = self.input.access(&self.claim);
            inp.listening_pollin = false;
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration.lock().unwrap().is_some()
    }

    /// Helper for non-registered use: attempt a non-blocking drain
    /// first; if nothing was buffered to write, block (bounded by
    /// `timeout`) for readiness and dispatch the result to the internal
    /// read/write paths.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        {
            let mut out = self.output.access(&self.claim);
            let before = out.outbuf.len() - out.outbuf_start;
            if before > 0 {
                match self.try_write_locked(&mut out) {
                    WriteOutcome::Error => return WaitOutcome::Error,
                    _ => {
                        let after = out.outbuf.len() - out.outbuf_start;
                        if after < before {
                            return WaitOutcome::Progress;
                        }
                    }
                }
            }
        }

        let interest = {
            let out = self.output.access(&self.claim);
            let inp = self.input.access(&self.claim);
            Readiness {
                writable: out.outbuf.len() > out.outbuf_start,
                readable: !(inp.read_eof || inp.read_error),
            }
        };
        if interest.is_empty() {
            return WaitOutcome::Timeout;
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        match raw_io::poll_fd(self.fd, interest, timeout_ms) {
            Ok(PollWait::TimedOut) => WaitOutcome::Timeout,
            Ok(PollWait::Interrupted) => WaitOutcome::Progress,
            Ok(PollWait::Ready(readiness)) => {
                if readiness.writable {
                    let mut out = self.output.access(&self.claim);
                    self.try_write_locked(&mut out);
                }
                if readiness.readable {
                    let mut inp = self.input.access(&self.claim);
                    self.read_into_inbuf_locked(&mut inp);
                }
                WaitOutcome::Progress
            }
            Err(err) => {
                tracing::warn!(target: "gwconn::connection", %err, "poll failed in wait()");
                WaitOutcome::Error
            }
        }
    }

    // ---- observers -------------------------------------------------

    pub fn outbuf_len(&self) -> usize {
        let out = self.output.access(&self.claim);
        out.outbuf.len() - out.outbuf_start
    }

    pub fn inbuf_len(&self) -> usize {
        let inp = self.input.access(&self.claim);
        inp.inbuf.len() - inp.inbuf_start
    }

    pub fn eof(&self) -> bool {
        self.input.access(&self.claim).read_eof
    }

    pub fn read_error(&self) -> bool {
        self.input.access(&self.claim).read_error
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.registration.lock().unwrap().take();
        let mut out = self.output.access(&self.claim);
        self.try_write_locked(&mut out);
        drop(out);
        raw_io::close(self.fd);
    }
}

/// The multiplexer's callback for a registered connection: drains
/// output on POLLOUT (which self-adjusts POLLOUT interest via
/// `try_write_locked`), and on POLLIN tops up `inbuf` before handing
/// control to the user's callback.
fn poll_callback(
    conn: &Arc<Connection>,
    readiness: Readiness,
    user_callback: &Arc<dyn Fn(&Arc<Connection>) + Send + Sync>,
) {
    if readiness.writable {
        let mut out = conn.output.access(&conn.claim);
        conn.try_write_locked(&mut out);
    }
    if readiness.readable {
        {
            let mut inp = conn.input.access(&conn.claim);
            conn.read_into_inbuf_locked(&mut inp);
        }
        user_callback(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Connection::wrap_fd(a.into_raw_fd()).unwrap();
        let b = Connection::wrap_fd(b.into_raw_fd()).unwrap();
        (a, b)
    }

    fn spin_until<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(v) = poll() {
                return v;
            }
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for condition");
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn write_then_read_fixed_round_trips() {
        let (a, b) = pair();
        assert_eq!(a.write(b"HELLO"), WriteOutcome::Flushed);
        let got = spin_until(|| b.read_fixed(5));
        assert_eq!(got, b"HELLO".to_vec());
    }

    #[test]
    fn write_with_length_then_read_with_length_round_trips() {
        let (a, b) = pair();
        assert_eq!(a.write_with_length(b"HELLO"), WriteOutcome::Flushed);
        let got = spin_until(|| b.read_with_length());
        assert_eq!(got, b"HELLO".to_vec());
    }

    #[test]
    fn read_line_strips_lf_and_crlf() {
        let (a, b) = pair();
        a.write(b"line1\nline2\r\nline3");
        let first = spin_until(|| b.read_line());
        assert_eq!(first, b"line1".to_vec());
        let second = spin_until(|| b.read_line());
        assert_eq!(second, b"line2".to_vec());
        // no trailing LF yet for "line3"
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(b.read_line(), None);
    }

    #[test]
    fn negative_length_prefix_is_discarded_then_framing_resumes() {
        let (a, b) = pair();
        let mut bad = (-1i32).to_be_bytes().to_vec();
        bad.extend_from_slice(&5u32.to_be_bytes());
        bad.extend_from_slice(b"HELLO");
        a.write(&bad);
        let got = spin_until(|| b.read_with_length());
        assert_eq!(got, b"HELLO".to_vec());
    }

    #[test]
    fn read_packet_extracts_inclusive_marked_frame() {
        let (a, b) = pair();
        a.write(b"junk\x02payload\x03trailing");
        let got = spin_until(|| b.read_packet(0x02, 0x03));
        assert_eq!(got, b"\x02payload\x03".to_vec());
    }

    #[test]
    fn read_packet_with_no_start_mark_discards_everything() {
        let (a, b) = pair();
        a.write(b"no marks here");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(b.read_packet(0x02, 0x03), None);
        assert_eq!(b.inbuf_len(), 0);
    }

    #[test]
    fn eof_is_observed_after_peer_closes() {
        let (a, b) = pair();
        drop(a);
        spin_until(|| if b.eof() { Some(()) } else { b.read_everything(); None });
        assert!(b.eof());
    }

    #[test]
    fn output_buffering_threshold_defers_then_flush_drains() {
        let (a, b) = pair();
        a.set_output_buffering(1024);
        assert_eq!(a.write(b"short"), WriteOutcome::Buffered);
        assert_eq!(a.outbuf_len(), 5);
        a.set_output_buffering(0);
        assert_eq!(a.outbuf_len(), 0);
        let got = spin_until(|| b.read_fixed(5));
        assert_eq!(got, b"short".to_vec());
    }

    #[test]
    fn flush_blocks_until_drained() {
        let (a, b) = pair();
        let big = vec![b'x'; 256 * 1024];
        a.set_output_buffering(u32::MAX);
        a.write(&big);
        let drainer = {
            let b = b.clone();
            thread::spawn(move || {
                let mut total = 0usize;
                while total < big.len() {
                    if let Some(chunk) = b.read_everything() {
                        total += chunk.len();
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                total
            })
        };
        a.set_output_buffering(0);
        assert_eq!(a.flush(), FlushOutcome::Done);
        assert_eq!(drainer.join().unwrap(), 256 * 1024);
    }

    #[test]
    #[should_panic(expected = "already-claimed")]
    fn double_claim_panics() {
        let (a, _b) = pair();
        a.claim();
        a.claim();
    }

    #[test]
    fn register_dispatches_callback_across_chunked_writes() {
        let (a, b) = pair();
        let mux = Multiplexer::new().unwrap();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let outcome = b.register(&mux, move |conn| {
            if let Some(chunk) = conn.read_everything() {
                let _ = tx.send(chunk);
            }
        });
        assert_eq!(outcome, RegisterOutcome::Registered);

        let payload: Vec<u8> = (0..100u16).map(|i| (i % 256) as u8).collect();
        for chunk in payload.chunks(10) {
            a.write(chunk);
            thread::sleep(Duration::from_millis(2));
        }

        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while received.len() < payload.len() && std::time::Instant::now() < deadline {
            if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(200)) {
                received.extend(chunk);
            }
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn register_to_a_second_multiplexer_fails() {
        let (_a, b) = pair();
        let mux1 = Multiplexer::new().unwrap();
        let mux2 = Multiplexer::new().unwrap();
        assert_eq!(b.register(&mux1, |_| {}), RegisterOutcome::Registered);
        assert_eq!(
            b.register(&mux2, |_| {}),
            RegisterOutcome::AlreadyRegisteredElsewhere
        );
    }

    #[test]
    fn wait_reports_progress_then_timeout() {
        let (a, b) = pair();
        a.write(b"ping");
        let outcome = spin_until(|| match b.wait(Duration::from_millis(50)) {
            WaitOutcome::Progress => Some(WaitOutcome::Progress),
            _ => None,
        });
        assert_eq!(outcome, WaitOutcome::Progress);
        assert_eq!(b.wait(Duration::from_millis(20)), WaitOutcome::Timeout);
    }
}
