//! The timer set's single background worker thread.
//!
//! Mirrors the loop described in the expiry protocol: hold the set lock
//! for the duration of each heap manipulation *and* the corresponding
//! event production, then sleep — indefinitely if the heap is empty, or
//! until the next deadline — on a `Condvar` that `Timer::start`/`stop`
//! signal when the root changes.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::set::Shared;

pub(crate) fn run<E>(shared: std::sync::Arc<Shared<E>>)
where
    E: Clone + PartialEq + Send + 'static,
{
    loop {
        let mut state = shared.state.lock().unwrap();

        if shared.stopping.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        if let Some(id) = state.pop_due(now) {
            let event = {
                let data = state.timer_mut(id);
                let event = data
                    .template_event
                    .clone()
                    .expect("armed timer fired with no template event");
                data.in_flight_event = Some(event.clone());
                event
            };
            tracing::trace!(target: "gwtimer::worker", timer = id, "firing timer");
            shared.queue.produce(event);
            drop(state);
            continue;
        }

        match state.next_deadline() {
            None => {
                tracing::trace!(target: "gwtimer::worker", "heap empty, sleeping indefinitely");
                let _guard = shared.condvar.wait(state).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    let sleep_for = deadline - now;
                    tracing::trace!(target: "gwtimer::worker", ?sleep_for, "sleeping until next deadline");
                    let _ = shared.condvar.wait_timeout(state, sleep_for).unwrap();
                }
                // else: already due again (a concurrent rearm beat us to
                // the lock) — loop around and re-check immediately.
            }
        }
    }
}
