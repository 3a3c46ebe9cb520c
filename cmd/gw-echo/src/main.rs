//! gw-echo
//!
//! A TCP echo server built entirely on `gwconn`: one accept loop feeds
//! every incoming socket into a single `Multiplexer`, and an echo
//! callback drains and re-writes whatever `read_everything` hands it.
//! Proves out `gwconn`'s registration + framed-read + buffered-write
//! path under real (if small-scale) concurrent load.
//!
//! Usage:
//!     cargo run -p gw-echo -- [port]
//!     echo "hello" | nc localhost 9999

use std::net::TcpListener;
use std::os::unix::io::IntoRawFd;

use gwconn::{Connection, Multiplexer, RegisterOutcome};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(9999);

    let listener = TcpListener::bind(("0.0.0.0", port)).expect("failed to bind listener");
    let mux = Multiplexer::new().expect("failed to start multiplexer");

    println!("gw-echo listening on 0.0.0.0:{port}");

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        let fd = stream.into_raw_fd();

        let conn = match Connection::wrap_fd(fd) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(%err, "failed to wrap accepted socket");
                continue;
            }
        };

        let outcome = conn.register(&mux, move |conn| {
            if let Some(bytes) = conn.read_everything() {
                conn.write(&bytes);
            }
            if conn.eof() || conn.read_error() {
                conn.unregister();
            }
        });
        match outcome {
            RegisterOutcome::Registered => {
                tracing::info!(?peer, "accepted connection");
            }
            RegisterOutcome::AlreadyRegisteredElsewhere => {
                unreachable!("freshly wrapped connection can't already be registered")
            }
        }
    }
}
