//! MCM Job Worker Library
//!
//! Background job processing for the magazine back end: a Redis-backed
//! queue, a single-consumer dispatch loop, a distributed lock manager, and
//! the handlers the loop routes to.
//!
//! ## Module Overview
//!
//! - `queue`: job queue over a shared list (Redis or in-process)
//! - `message`: wire envelope and topic payloads
//! - `worker`: dispatch loop, panic isolation, per-job deadlines
//! - `context`: deadline/cancellation carried into every job I/O call
//! - `lock`: TTL-bound distributed locks
//! - `export`: contribution-session export (staging, fan-out download, archive, upload)
//! - `staging` / `archive`: staging tree layout and zip construction
//! - `notification` / `converter`: the simpler topic handlers
//! - `services`: interfaces of the back-end collaborators
//! - `api_client`: HTTP implementation of those interfaces
//! - `config` / `telemetry`: environment configuration and OpenTelemetry
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use mcm_worker::{message::Message, queue::{MemoryQueue, Queue}, worker::Worker};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
//!     queue.add(&Message::export_contribute_session(42)).await.unwrap();
//!
//!     // Register handlers with `with_handler`, then run until shutdown.
//!     let worker = Worker::new(queue, Duration::from_secs(300));
//!     worker.run(CancellationToken::new()).await;
//! }
//! ```

pub mod api_client;
pub mod archive;
pub mod config;
pub mod context;
pub mod converter;
pub mod error;
pub mod export;
pub mod lock;
pub mod message;
pub mod notification;
pub mod queue;
pub mod services;
pub mod staging;
pub mod telemetry;
pub mod worker;

pub use context::JobContext;
pub use error::{JobError, LockError, QueueError};
pub use message::{Message, Topic};
pub use worker::{JobHandler, Worker, WorkerState};
