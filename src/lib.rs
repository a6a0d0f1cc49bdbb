//! A persistent, transactional, single-node disk queue.
//!
//! A queue is a directory on disk holding an append-only transaction log, a set of rolling
//! `data.NNNN` payload files, and an advisory checkpoint. Work against it happens through
//! [`Session`]: buffer enqueues and tentative dequeues locally, then [`Session::flush`] them as
//! one atomic transaction, or [`Session::dispose`] to abandon the session and reinstate any
//! tentatively-dequeued entries.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)] // long-types happen, especially in async code
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod checkpoint;
pub mod config;
mod core;
mod error;
mod fs;
mod lock;
mod queue;
mod session;
mod txlog;

pub use config::{QueueOptions, QueueOptionsBuilder, TruncationPolicy};
pub use core::Entry;
pub use error::QueueError;
pub use queue::Queue;
pub use session::Session;
