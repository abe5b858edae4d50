//! Building job descriptors on the submission side.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use conveyor_types::{JobDescriptor, Script};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use uuid::Uuid;

/// Optional parts of a job submission.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Local script file, or a reference when `remote_script` is set
    pub script: Option<String>,
    pub remote_script: bool,
    pub script_args: Option<String>,
    /// Comma-separated job ids
    pub deps: Option<String>,
}

/// Fresh job id.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build a descriptor with a new id.
///
/// A local script is read, gzip-compressed and base64-encoded into the
/// descriptor; a remote one is carried verbatim.
pub fn create(
    repo: &str,
    payload: &str,
    path: &str,
    options: &CreateOptions,
) -> Result<JobDescriptor> {
    let mut job = JobDescriptor::new(new_job_id(), repo, payload, path)?;

    if let Some(script) = &options.script {
        let script = if options.remote_script {
            Script::Remote(script.clone())
        } else {
            let path = Path::new(script);
            let content = std::fs::read(path)
                .with_context(|| format!("could not read script file {}", path.display()))?;
            Script::Embedded(pack_script(&content)?)
        };
        job = job.with_script(script);
    }

    if let Some(args) = &options.script_args {
        job = job.with_script_args(args.clone());
    }

    if let Some(deps) = &options.deps {
        job = job.with_deps(split_deps(deps));
    }

    Ok(job)
}

/// Split a comma-separated id list, dropping empty items.
pub fn split_deps(deps: &str) -> Vec<String> {
    deps.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

/// gzip + base64 a script body for embedding.
pub fn pack_script(content: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(content)
        .context("could not compress script")?;
    let compressed = encoder.finish().context("could not finish gzip stream")?;
    Ok(STANDARD.encode(compressed))
}

/// Reverse of [`pack_script`].
pub fn unpack_script(body: &str) -> Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(body.trim())
        .context("base64 decoding failed")?;
    let mut content = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut content)
        .context("decompression failed")?;
    Ok(content)
}
