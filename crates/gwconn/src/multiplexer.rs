//! FD Multiplexer: a thread-safe registry mapping file descriptors to an
//! interest mask and a user callback, backed by [`mio`]'s portable
//! epoll/kqueue wrapper and served by one dedicated background thread.
//!
//! A [`Connection`](crate::connection::Connection) never touches `mio`
//! directly — it goes through [`Multiplexer::register`] and the
//! [`Registration`] handle that comes back.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

/// Which directions a registered fd is ready for, independent of
/// `libc::POLLIN`/`POLLOUT`'s exact bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness { readable: false, writable: false };

    pub fn readable() -> Self {
        Readiness { readable: true, writable: false }
    }

    pub fn writable() -> Self {
        Readiness { readable: false, writable: true }
    }

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    fn to_mio(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Callback invoked from the multiplexer's worker thread when a
/// registered fd becomes ready.
pub type Callback = Box<dyn Fn(RawFd, Readiness) + Send + Sync>;

struct Entry {
    fd: RawFd,
    interest: Readiness,
    /// `true` while `interest` is actually installed with the OS
    /// selector. An empty interest is represented by deregistering
    /// rather than by registering for nothing, since `mio::Interest`
    /// has no "none" value.
    live: bool,
    callback: Arc<Mutex<Option<Callback>>>,
}

const WAKE_TOKEN: Token = Token(usize::MAX);

/// A thread-safe fd → (interest, callback) registry, with one dedicated
/// thread blocked in `epoll_wait`/`kevent` (via `mio::Poll`) dispatching
/// callbacks as fds become ready.
pub struct Multiplexer {
    registry: mio::Registry,
    waker: Waker,
    entries: Mutex<HashMap<Token, Entry>>,
    next_token: AtomicUsize,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Create a multiplexer and spawn its worker thread immediately.
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKE_TOKEN)?;
        let stopping = Arc::new(AtomicBool::new(false));

        let mux = Arc::new(Self {
            registry,
            waker,
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            stopping,
            worker: Mutex::new(None),
        });

        let worker_mux = mux.clone();
        let handle = thread::Builder::new()
            .name("gw-mux".into())
            .spawn(move || run(worker_mux, poll))
            .expect("failed to spawn gw-mux worker thread");
        *mux.worker.lock().unwrap() = Some(handle);

        Ok(mux)
    }

    /// Register `fd` with the given initial `interest`. `callback` is
    /// invoked (from the worker thread, never the caller's) every time
    /// `fd` becomes ready for one of the registered directions.
    ///
    /// An empty `interest` is a legal starting point: the fd is tracked
    /// but not yet handed to the OS selector until
    /// [`Registration::set_interest`] supplies a non-empty mask.
    pub fn register(
        self: &Arc<Self>,
        fd: RawFd,
        interest: Readiness,
        callback: impl Fn(RawFd, Readiness) + Send + Sync + 'static,
    ) -> io::Result<Registration> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            fd,
            interest: Readiness::NONE,
            live: false,
            callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
        };
        self.entries.lock().unwrap().insert(token, entry);

        let registration = Registration {
            mux: self.clone(),
            token,
            fd,
        };
        registration.set_interest(interest)?;
        Ok(registration)
    }

    fn apply_interest(&self, token: Token, fd: RawFd, interest: Readiness) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        install_interest(&mut entries, &self.registry, token, fd, interest)
    }

    /// Update a single direction of `token`'s interest, leaving the
    /// other as-is — the caller (e.g. the write path clearing POLLOUT
    /// once drained) only knows about its own half-duplex, not the
    /// other one.
    fn apply_interest_bit(&self, token: Token, fd: RawFd, readable_bit: bool, value: bool) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let mut next = entries.get(&token).map(|e| e.interest).unwrap_or(Readiness::NONE);
        if readable_bit {
            next.readable = value;
        } else {
            next.writable = value;
        }
        install_interest(&mut entries, &self.registry, token, fd, next)
    }
}

fn install_interest(
    entries: &mut HashMap<Token, Entry>,
    registry: &mio::Registry,
    token: Token,
    fd: RawFd,
    new_interest: Readiness,
) -> io::Result<()> {
    let entry = match entries.get_mut(&token) {
        Some(e) => e,
        None => return Ok(()), // already unregistered, racing caller
    };
    match (entry.live, new_interest.to_mio()) {
        (false, Some(mio_interest)) => {
            registry.register(&mut SourceFd(&fd), token, mio_interest)?;
            entry.live = true;
        }
        (true, Some(mio_interest)) => {
            registry.reregister(&mut SourceFd(&fd), token, mio_interest)?;
        }
        (true, None) => {
            registry.deregister(&mut SourceFd(&fd))?;
            entry.live = false;
        }
        (false, None) => {}
    }
    entry.interest = new_interest;
    Ok(())
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// A live registration returned by [`Multiplexer::register`]. Dropping
/// it unregisters the fd (see [`Registration::unregister`]'s quiescing
/// guarantee).
pub struct Registration {
    mux: Arc<Multiplexer>,
    token: Token,
    fd: RawFd,
}

impl Registration {
    /// Replace the registered interest mask. Idempotent no-op if
    /// unchanged; downgrades to a deregister if `interest` is empty.
    pub fn set_interest(&self, interest: Readiness) -> io::Result<()> {
        self.mux.apply_interest(self.token, self.fd, interest)
    }

    /// Set or clear just the readable bit, preserving writable.
    pub fn set_readable(&self, value: bool) -> io::Result<()> {
        self.mux.apply_interest_bit(self.token, self.fd, true, value)
    }

    /// Set or clear just the writable bit, preserving readable.
    pub fn set_writable(&self, value: bool) -> io::Result<()> {
        self.mux.apply_interest_bit(self.token, self.fd, false, value)
    }

    /// Unregister the fd. Blocks until any callback invocation already
    /// in progress for this registration has returned — a fresh call
    /// can never be dispatched afterward, since the entry is removed
    /// from the registry *before* we wait on the callback slot.
    pub fn unregister(&self) {
        let entry = self.mux.entries.lock().unwrap().remove(&self.token);
        if let Some(entry) = entry {
            // Taking this lock after the entry is gone from the map is
            // what quiesces an in-flight dispatch: the worker thread
            // holds it for the duration of the callback call.
            *entry.callback.lock().unwrap() = None;
            if entry.live {
                let _ = self.mux.registry.deregister(&mut SourceFd(&self.fd));
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn run(mux: Arc<Multiplexer>, mut poll: Poll) {
    let mut events = Events::with_capacity(256);
    loop {
        if mux.stopping.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(target: "gwconn::multiplexer", %err, "poll failed");
            continue;
        }
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let dispatch = {
                let entries = mux.entries.lock().unwrap();
                entries.get(&token).map(|e| (e.fd, e.callback.clone()))
            };
            let (fd, callback) = match dispatch {
                Some(pair) => pair,
                None => continue,
            };
            let readiness = Readiness {
                readable: event.is_readable(),
                writable: event.is_writable(),
            };
            let guard = callback.lock().unwrap();
            if let Some(cb) = guard.as_ref() {
                cb(fd, readiness);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn readable_callback_fires_after_peer_writes() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mux = Multiplexer::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let _reg = mux
            .register(b.as_raw_fd(), Readiness::readable(), move |_fd, readiness| {
                tx.send(readiness).unwrap();
            })
            .unwrap();

        use std::io::Write;
        (&a).write_all(b"hi").unwrap();

        let readiness = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(readiness.readable);
    }

    #[test]
    fn unregister_stops_further_dispatch() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mux = Multiplexer::new().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let reg = mux
            .register(b.as_raw_fd(), Readiness::readable(), move |_fd, _r| {
                let _ = tx.send(());
            })
            .unwrap();
        reg.unregister();

        use std::io::Write;
        (&a).write_all(b"hi").unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn set_interest_can_downgrade_to_empty_and_back() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mux = Multiplexer::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let reg = mux
            .register(b.as_raw_fd(), Readiness::readable(), move |_fd, r| {
                let _ = tx.send(r);
            })
            .unwrap();

        reg.set_interest(Readiness::NONE).unwrap();

        use std::io::Write;
        (&a).write_all(b"ignored while paused").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        reg.set_interest(Readiness::readable()).unwrap();
        let readiness = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(readiness.readable);
    }
}
