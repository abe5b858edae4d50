//! The consume loop: one delivery at a time, acknowledged after the job's
//! transaction has ended.
//!
//! The loop talks to the broker only through [`JobSource`], so it can be
//! driven by [`crate::queue::AmqpJobSource`] in production and by an
//! in-memory queue in tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use conveyor_events::EventLog;
use conveyor_types::{DeliveryState, ErrorClass, EventType, JobDescriptor, JobEvent, UNKNOWN_JOB};

use crate::error::JobError;
use crate::runner::{JobRunner, Reporter};

/// One message handed out by the broker.
pub trait Delivery {
    fn body(&self) -> &[u8];
    /// Set when the broker has delivered this message before.
    fn redelivered(&self) -> bool;
}

/// What a poll of the broker produced.
#[derive(Debug)]
pub enum Received<D> {
    Delivery(D),
    /// Nothing arrived within the poll interval
    Idle,
    /// The source is drained and will deliver nothing more
    Closed,
}

/// A broker queue with manual acknowledgement.
pub trait JobSource {
    type Delivery: Delivery;

    fn next_delivery(&mut self, timeout: Duration) -> Result<Received<Self::Delivery>>;
    fn ack(&mut self, delivery: Self::Delivery) -> Result<()>;
    fn nack(&mut self, delivery: Self::Delivery, requeue: bool) -> Result<()>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Nacked { requeue: bool },
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    /// Failed jobs handed back for redelivery
    pub requeued: u64,
    /// Undecodable messages dropped for good
    pub rejected: u64,
}

pub struct Consumer {
    runner: JobRunner,
    poll_interval: Duration,
    events_file: Option<PathBuf>,
    events: EventLog,
    shutdown: Arc<AtomicBool>,
    state: DeliveryState,
}

impl Consumer {
    pub fn new(runner: JobRunner, poll_interval: Duration) -> Self {
        Self {
            runner,
            poll_interval,
            events_file: None,
            events: EventLog::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: DeliveryState::Waiting,
        }
    }

    /// Append every delivery's events to this JSONL file.
    pub fn with_events_file(mut self, path: Option<PathBuf>) -> Self {
        self.events_file = path;
        self
    }

    /// Flag that stops [`Consumer::run`] before its next poll once set.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Events of the most recent delivery that were not written to a file.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Process deliveries until shutdown is requested or the source closes.
    ///
    /// Broker errors end the loop; job failures never do.
    pub fn run<S: JobSource>(
        &mut self,
        source: &mut S,
        reporter: &mut dyn Reporter,
    ) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        reporter.info("waiting for jobs");

        while !self.shutdown.load(Ordering::SeqCst) {
            self.state = DeliveryState::Waiting;
            let delivery = match source.next_delivery(self.poll_interval)? {
                Received::Delivery(delivery) => delivery,
                Received::Idle => continue,
                Received::Closed => {
                    reporter.warn("broker stopped delivering; leaving consume loop");
                    break;
                }
            };

            stats.delivered += 1;
            match self.handle(source, delivery, reporter)? {
                DeliveryOutcome::Acked => stats.acked += 1,
                DeliveryOutcome::Nacked { requeue: true } => stats.requeued += 1,
                DeliveryOutcome::Nacked { requeue: false } => stats.rejected += 1,
            }
        }

        self.state = DeliveryState::Waiting;
        Ok(stats)
    }

    /// Decode, run and settle one delivery.
    pub fn handle<S: JobSource>(
        &mut self,
        source: &mut S,
        delivery: S::Delivery,
        reporter: &mut dyn Reporter,
    ) -> Result<DeliveryOutcome> {
        self.state = DeliveryState::Delivered;
        self.events.clear();

        let job = match JobDescriptor::from_json(delivery.body()) {
            Ok(job) => job,
            Err(err) => {
                let err = JobError::from(err);
                reporter.error(&format!("dropping message: {err}"));
                self.events.record(JobEvent::now(
                    UNKNOWN_JOB,
                    EventType::DescriptorRejected {
                        message: err.to_string(),
                    },
                ));
                source.nack(delivery, false)?;
                self.state = DeliveryState::NackSent;
                self.events.record(JobEvent::now(
                    UNKNOWN_JOB,
                    EventType::MessageNacked { requeue: false },
                ));
                self.flush_events(reporter);
                return Ok(DeliveryOutcome::Nacked { requeue: false });
            }
        };

        self.events.record(JobEvent::now(
            job.id(),
            EventType::JobReceived {
                repo: job.repo().to_string(),
                path: job.path().to_string(),
                redelivered: delivery.redelivered(),
            },
        ));
        reporter.info(&format!("start publishing job {}", job.id()));

        self.state = DeliveryState::Processing;
        let started = Instant::now();
        let result = self.runner.run(&job, reporter, &mut self.events);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (error, class) = match &result {
            Ok(()) => (None, None),
            Err(err) => (Some(err.to_string()), Some(err.class())),
        };
        self.events.record(JobEvent::now(
            job.id(),
            EventType::JobFinished {
                success: result.is_ok(),
                duration_ms,
                error,
                class,
            },
        ));

        let outcome = match result {
            Ok(()) => {
                source.ack(delivery)?;
                self.state = DeliveryState::AckSent;
                self.events
                    .record(JobEvent::now(job.id(), EventType::MessageAcked));
                reporter.info(&format!("finished publishing job {}", job.id()));
                DeliveryOutcome::Acked
            }
            Err(err) => {
                let requeue = err.class() == ErrorClass::Retryable;
                reporter.error(&format!("job {} failed: {err}", job.id()));
                source.nack(delivery, requeue)?;
                self.state = DeliveryState::NackSent;
                self.events
                    .record(JobEvent::now(job.id(), EventType::MessageNacked { requeue }));
                DeliveryOutcome::Nacked { requeue }
            }
        };

        self.flush_events(reporter);
        Ok(outcome)
    }

    fn flush_events(&mut self, reporter: &mut dyn Reporter) {
        if let Some(path) = &self.events_file
            && let Err(e) = self.events.drain_to_file(path)
        {
            reporter.warn(&format!("could not write events: {e:#}"));
        }
    }
}
