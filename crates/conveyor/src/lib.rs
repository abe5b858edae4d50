//! # Conveyor
//!
//! Worker-side publishing pipeline for CVMFS repositories.
//!
//! Jobs arrive as JSON messages on an AMQP queue. Each one names a
//! repository, a payload archive and an optional subpath and script. The
//! worker opens a repository transaction, unpacks the payload into the
//! repository tree, runs the script, and commits or aborts. The message is
//! acknowledged only after the transaction has ended.
//!
//! ## Pipeline
//!
//! 1. [`consumer::Consumer`] takes one delivery from a [`consumer::JobSource`]
//!    (prefetch 1) and decodes the job description.
//! 2. [`runner::JobRunner`] opens a [`transaction::RepositoryTransaction`].
//! 3. [`stage::PayloadStager`] downloads the payload into the staging area,
//!    extracts it, and prepares and runs the optional script.
//! 4. The transaction is committed if every step succeeded and aborted
//!    otherwise; the delivery is then acked or nacked with requeue.
//!
//! Undecodable messages are nacked without requeue and never touch a
//! repository.
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::{consumer::Consumer, queue::BrokerConnection, runner::JobRunner};
//!
//! let connection = BrokerConnection::open(&config.queue, &mut reporter)?;
//! let mut source = connection.consume()?;
//! let mut consumer = Consumer::new(JobRunner::new(publisher, stager), poll_interval);
//! let stats = consumer.run(&mut source, &mut reporter)?;
//! ```
//!
//! ## Modules
//!
//! - [`job`]: Building job descriptions for submission
//! - [`transaction`]: `Publisher` seam and scoped repository transactions
//! - [`stage`]: Staging area, payload fetch, extraction, scripts
//! - [`runner`]: One job inside one transaction
//! - [`consumer`]: The delivery loop
//! - [`queue`]: AMQP adapter
//! - [`submit`]: Publishing job descriptions

pub mod consumer;

/// Failure kinds of a single job.
pub mod error;

pub mod job;

/// AMQP connection, topology and consumer.
pub mod queue;

pub mod runner;

pub mod stage;

pub mod submit;

pub mod transaction;

/// Wire and state types.
/// Re-exported from conveyor-types microcrate.
pub use conveyor_types as types;

/// Worker and broker configuration.
/// Re-exported from conveyor-config microcrate.
pub use conveyor_config as config;

/// Append-only JSONL event log.
/// Re-exported from conveyor-events microcrate.
pub use conveyor_events as events;

/// Retry schedules for broker connections.
/// Re-exported from conveyor-retry microcrate.
pub use conveyor_retry as retry;
