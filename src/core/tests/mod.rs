//! Scenario-level and property-based tests against the public `Queue`/`Session` surface,
//! mirroring the teacher's `tests/basic.rs`/`tests/invariants.rs` split: one module for the
//! eight literal end-to-end scenarios, one for the cross-cutting invariants.

mod invariants;
mod size_limits;

use std::path::Path;
use std::sync::Once;

use crate::config::QueueOptions;
use crate::queue::Queue;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-scoped `tracing` subscriber once per process, filtered by `RUST_LOG` (off by
/// default). Mirrors the teacher's `fmt().with_test_writer().init()` pattern for surfacing
/// recovery/retry warnings when a scenario test fails.
fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

async fn open(root: &Path) -> Queue {
    init_test_logging();
    Queue::open(QueueOptions::from_path(root).build().unwrap())
        .await
        .unwrap()
}
