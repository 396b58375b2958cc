#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use ans_nvme::{Completion, Request};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(2);

/// `RUST_LOG=ans_nvme=debug cargo test` shows the engine's view of a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A flush whose completion lands on the returned channel.
pub fn flush() -> (Request, Receiver<Completion>) {
    let (tx, rx) = mpsc::channel();
    let req = Request::flush(move |c| {
        let _ = tx.send(c);
    });
    (req, rx)
}

/// A point in time past every deadline set up to `after` from now.
pub fn past_deadline(after: Duration) -> Instant {
    Instant::now() + after + Duration::from_millis(50)
}
