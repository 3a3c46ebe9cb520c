//! Public API: `TimerSet` and the `Timer` handles it hands out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gwcore::EventQueue;

use crate::state::SetState;
use crate::worker;

pub(crate) struct Shared<E> {
    pub(crate) state: Mutex<SetState<E>>,
    pub(crate) condvar: Condvar,
    pub(crate) stopping: AtomicBool,
    pub(crate) queue: Arc<EventQueue<E>>,
}

/// A set of timers served by one dedicated worker thread.
///
/// Dropping the set stops every timer it still owns active (draining the
/// heap), signals the worker to exit, and joins it. `Timer` handles
/// created from the set are independent `Arc`-backed values — they
/// outlive a dropped `TimerSet` and clean up their own slot when they in
/// turn are dropped.
pub struct TimerSet<E>
where
    E: Clone + PartialEq + Send + 'static,
{
    shared: Arc<Shared<E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E> TimerSet<E>
where
    E: Clone + PartialEq + Send + 'static,
{
    /// Create a new timer set producing expiry events into `queue`. Adds
    /// the set as a producer of `queue` for the set's lifetime and spawns
    /// the worker thread immediately.
    pub fn new(queue: Arc<EventQueue<E>>) -> Self {
        queue.add_producer();
        let shared = Arc::new(Shared {
            state: Mutex::new(SetState::new()),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
            queue,
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("gw-timer".into())
            .spawn(move || worker::run(worker_shared))
            .expect("failed to spawn gw-timer worker thread");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Allocate a new, inactive timer bound to this set.
    pub fn create_timer(&self) -> Timer<E> {
        let id = self.shared.state.lock().unwrap().alloc();
        Timer {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Number of timers currently armed (in the heap).
    pub fn active_timers(&self) -> usize {
        self.shared.state.lock().unwrap().active_count()
    }
}

impl<E> Drop for TimerSet<E>
where
    E: Clone + PartialEq + Send + 'static,
{
    fn drop(&mut self) {
        {
            // Drain the heap: stop every still-active timer. We don't
            // touch in-flight events here — those belong to firings the
            // worker already produced, and are the downstream consumer's
            // business, not ours to retract on shutdown.
            let mut state = self.shared.state.lock().unwrap();
            state.disarm_all();
        }
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.queue.remove_producer();
    }
}

/// A single timer belonging to a `TimerSet`.
///
/// Dropping a `Timer` stops it (removing it from the heap and cancelling
/// any still-queued duplicate) and releases its template event.
pub struct Timer<E>
where
    E: Clone + PartialEq + Send + 'static,
{
    id: usize,
    shared: Arc<Shared<E>>,
}

impl<E> Timer<E>
where
    E: Clone + PartialEq + Send + 'static,
{
    /// Arm the timer to fire `interval` from now, using `event` as its
    /// new template (replacing any previous one).
    pub fn start_with(&self, interval: Duration, event: E) {
        self.start_inner(interval, Some(event));
    }

    /// Arm the timer to fire `interval` from now, reusing its existing
    /// template event.
    ///
    /// # Panics
    ///
    /// Panics if the timer has never been given a template event via
    /// [`start_with`](Self::start_with).
    pub fn start(&self, interval: Duration) {
        self.start_inner(interval, None);
    }

    fn start_inner(&self, interval: Duration, event: Option<E>) {
        let deadline = std::time::Instant::now() + interval;
        let became_root = {
            let mut state = self.shared.state.lock().unwrap();
            let data = state.timer_mut(self.id);

            if let Some(ev) = event {
                data.template_event = Some(ev);
            } else if data.template_event.is_none() {
                panic!("Timer::start called with no template event set");
            }

            self.cancel_stale_in_flight(&mut state);
            state.arm(self.id, deadline)
        };
        if became_root {
            self.shared.condvar.notify_one();
        }
    }

    /// Stop the timer: remove it from the heap if present, and cancel
    /// any firing of it still sitting unconsumed on the output queue.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.disarm(self.id);
        self.cancel_stale_in_flight(&mut state);
    }

    /// Remove and release any in-flight duplicate of this timer's last
    /// firing still sitting on the output queue. Closes the race between
    /// a timer firing and the caller restarting or stopping it before a
    /// downstream consumer observes the original firing.
    fn cancel_stale_in_flight(&self, state: &mut std::sync::MutexGuard<'_, SetState<E>>) {
        let stale = state.timer_mut(self.id).in_flight_event.take();
        if let Some(stale) = stale {
            let removed = self.shared.queue.delete_equal(&stale);
            if removed > 0 {
                tracing::debug!(
                    target: "gwtimer::timer",
                    timer = self.id,
                    "cancelled in-flight duplicate before consumption"
                );
            }
        }
    }

    /// Whether this timer is currently armed.
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().unwrap().timer(self.id).is_active()
    }
}

impl<E> Drop for Timer<E>
where
    E: Clone + PartialEq + Send + 'static,
{
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.disarm(self.id);
        self.cancel_stale_in_flight(&mut state);
        state.free(self.id);
    }
}
