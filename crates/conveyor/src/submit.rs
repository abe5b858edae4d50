//! Submitting jobs to the broker.

use anyhow::Result;
use conveyor_config::QueueConfig;
use conveyor_types::JobDescriptor;
use serde::{Deserialize, Serialize};

use crate::queue::BrokerConnection;
use crate::runner::Reporter;

/// Printed after a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub status: String,
    pub job_id: String,
}

impl SubmitReceipt {
    pub fn ok(job: &JobDescriptor) -> Self {
        Self {
            status: "ok".to_string(),
            job_id: job.id().to_string(),
        }
    }
}

/// Connect, publish `job` once and disconnect.
pub fn submit(
    config: &QueueConfig,
    job: &JobDescriptor,
    reporter: &mut dyn Reporter,
) -> Result<SubmitReceipt> {
    let connection = BrokerConnection::open(config, reporter)?;
    connection.publish(job)?;
    reporter.info(&format!(
        "submitted job {} to {}",
        job.id(),
        config.new_job_exchange
    ));
    connection.close()?;
    Ok(SubmitReceipt::ok(job))
}
