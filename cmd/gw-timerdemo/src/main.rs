//! gwtimer demo
//!
//! Starts a `TimerSet`, arms a few timers against a plain
//! `EventQueue<String>`, and prints each firing as it's consumed.

use std::sync::Arc;
use std::time::Duration;

use gwcore::EventQueue;
use gwtimer::TimerSet;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== gwtimer demo ===\n");

    let queue: Arc<EventQueue<String>> = Arc::new(EventQueue::new());
    let set: TimerSet<String> = TimerSet::new(queue.clone());

    let retransmit = set.create_timer();
    let abort = set.create_timer();

    println!("arming 'retransmit' for 1s, 'abort' for 3s");
    retransmit.start_with(Duration::from_secs(1), "retransmit-timeout".to_string());
    abort.start_with(Duration::from_secs(3), "abort-timeout".to_string());

    println!("restarting 'retransmit' for 2s (cancels the 1s firing if still in flight)\n");
    retransmit.start_with(Duration::from_secs(2), "retransmit-timeout".to_string());

    let start = std::time::Instant::now();
    for _ in 0..2 {
        let event = queue.consume();
        println!("[{:>5.1}s] fired: {event}", start.elapsed().as_secs_f64());
    }

    println!("\ndone, active timers remaining: {}", set.active_timers());
}
