//! Applying one job inside one repository transaction.

use std::time::Instant;

use conveyor_events::EventLog;
use conveyor_types::{EventType, JobDescriptor, JobEvent, Script};

use crate::error::JobError;
use crate::stage::PayloadStager;
use crate::transaction::{Publisher, RepositoryTransaction};

/// Progress sink for operator-facing messages.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Runs jobs against one publisher and one staging area.
pub struct JobRunner {
    publisher: Box<dyn Publisher>,
    stager: PayloadStager,
}

impl JobRunner {
    pub fn new(publisher: Box<dyn Publisher>, stager: PayloadStager) -> Self {
        Self { publisher, stager }
    }

    /// Open a transaction, fetch and unpack the payload, run the optional
    /// script, then commit if every step succeeded and abort otherwise.
    ///
    /// When both the job body and the abort fail, the body's error is
    /// returned and the abort failure is only reported.
    pub fn run(
        &mut self,
        job: &JobDescriptor,
        reporter: &mut dyn Reporter,
        events: &mut EventLog,
    ) -> Result<(), JobError> {
        let txn = RepositoryTransaction::begin(self.publisher.as_mut(), job, reporter)?;
        events.record(JobEvent::now(
            job.id(),
            EventType::TransactionOpened {
                target: txn.target().to_string(),
            },
        ));

        let applied = apply(&self.stager, job, reporter, events);
        let ended = txn.end(applied.is_ok(), reporter);

        match (applied, ended) {
            (Ok(()), Ok(_)) => {
                events.record(JobEvent::now(job.id(), EventType::TransactionCommitted));
                Ok(())
            }
            (Ok(()), Err(commit)) => Err(commit),
            (Err(err), ended) => {
                if let Err(abort) = ended {
                    reporter.error(&format!("{}: {abort}", job.id()));
                }
                events.record(JobEvent::now(
                    job.id(),
                    EventType::TransactionAborted {
                        reason: err.to_string(),
                    },
                ));
                Err(err)
            }
        }
    }
}

fn apply(
    stager: &PayloadStager,
    job: &JobDescriptor,
    reporter: &mut dyn Reporter,
    events: &mut EventLog,
) -> Result<(), JobError> {
    let target_dir = stager.target_dir(job);

    reporter.info(&format!("{}: downloading {}", job.id(), job.payload()));
    let archive = stager.fetch(job.payload())?;
    events.record(JobEvent::now(
        job.id(),
        EventType::PayloadFetched {
            uri: job.payload().to_string(),
            bytes: archive.len(),
        },
    ));

    reporter.info(&format!(
        "{}: unpacking into {}",
        job.id(),
        target_dir.display()
    ));
    let extracted = stager.extract(&archive, &target_dir);
    if let Err(e) = archive.remove() {
        reporter.warn(&format!("{}: could not remove staged payload: {e}", job.id()));
    }
    extracted?;
    events.record(JobEvent::now(
        job.id(),
        EventType::PayloadExtracted {
            target_dir: target_dir.display().to_string(),
        },
    ));

    if let Some(script) = job.script() {
        let kind = match script {
            Script::Embedded(_) => "embedded",
            Script::Remote(_) => "remote",
        };
        reporter.info(&format!("{}: running {kind} transaction script", job.id()));

        let started = Instant::now();
        let prepared = stager.prepare_script(script)?;
        let result = stager.run_script(job, prepared.path())?;
        let stdout = result.stdout.trim_end();
        if !stdout.is_empty() {
            reporter.info(&format!("{}: script output:\n{stdout}", job.id()));
        }
        events.record(JobEvent::now(
            job.id(),
            EventType::ScriptExecuted {
                duration_ms: started.elapsed().as_millis() as u64,
            },
        ));
    }

    Ok(())
}
