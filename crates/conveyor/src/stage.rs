//! Staging area, payload download, extraction and transaction scripts.
//!
//! Everything a job writes outside the repository goes into the staging
//! directory. Staged files are guards: they are removed when dropped, so a
//! failed download or extraction leaves nothing behind.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use conveyor_process::{CommandResult, run_command, run_command_in_dir, tail};
use conveyor_types::{JobDescriptor, Script};
use md5::Md5;
use reqwest::blocking::Client;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{JobError, reason};
use crate::job::unpack_script;

/// Name of the unpacked embedded script inside the staging area.
pub const SCRIPT_FILE: &str = "transaction.sh";

/// File name used when a URL has no usable last path segment.
pub const DEFAULT_PAYLOAD_NAME: &str = "payload";

/// Query parameter that carries the expected payload digest.
pub const CHECKSUM_PARAM: &str = "checksum";

/// Worker-owned scratch directory, emptied on creation and removed on drop.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn create(dir: &Path) -> Result<Self> {
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to clear staging directory {}", dir.display())
                });
            }
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create staging directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// A file in the staging area that is deleted when dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    len: u64,
    removed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            len: 0,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes as written.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete now and report failures instead of ignoring them.
    pub fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Downloads one URL into a local file.
pub trait Fetcher {
    /// Write the body at `url` to `dest`, returning the number of bytes.
    fn fetch(&self, url: &Url, dest: &Path) -> Result<u64>;
}

/// HTTP(S) fetcher with a whole-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("conveyor/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url, dest: &Path) -> Result<u64> {
        let mut resp = self
            .http
            .get(url.as_str())
            .send()
            .context("download request failed")?;
        if !resp.status().is_success() {
            bail!("unexpected status: {}", resp.status());
        }
        let mut file = File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let written = resp
            .copy_to(&mut file)
            .context("failed to read response body")?;
        Ok(written)
    }
}

/// Digest algorithms accepted in a `checksum` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Algorithm of a bare digest, inferred from its length in bytes.
    fn from_len(len: usize) -> Option<Self> {
        [Self::Md5, Self::Sha1, Self::Sha256]
            .into_iter()
            .find(|algorithm| algorithm.digest_len() == len)
    }

    pub fn digest_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    fn hash(self, reader: &mut impl io::Read) -> io::Result<Vec<u8>> {
        match self {
            Self::Md5 => digest_reader::<Md5>(reader),
            Self::Sha1 => digest_reader::<Sha1>(reader),
            Self::Sha256 => digest_reader::<Sha256>(reader),
        }
    }
}

fn digest_reader<D: Digest + io::Write>(reader: &mut impl io::Read) -> io::Result<Vec<u8>> {
    let mut hasher = D::new();
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Expected digest of a payload, given as `<algorithm>:<hex>` or bare hex.
///
/// A bare digest is md5, sha1 or sha256 depending on its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: Vec<u8>,
}

impl Checksum {
    pub fn parse(value: &str) -> Result<Self> {
        let (named, hex_digest) = match value.split_once(':') {
            Some((name, hex_digest)) => {
                let algorithm = ChecksumAlgorithm::from_name(name.trim())
                    .ok_or_else(|| anyhow!("unsupported checksum algorithm: {name}"))?;
                (Some(algorithm), hex_digest)
            }
            None => (None, value),
        };
        let digest = hex::decode(hex_digest.trim()).context("checksum is not valid hex")?;
        let algorithm = match named {
            Some(algorithm) if algorithm.digest_len() != digest.len() => bail!(
                "checksum has {} bytes, expected {} for {algorithm:?}",
                digest.len(),
                algorithm.digest_len()
            ),
            Some(algorithm) => algorithm,
            None => ChecksumAlgorithm::from_len(digest.len())
                .ok_or_else(|| anyhow!("checksum has {} bytes, expected 16, 20 or 32", digest.len()))?,
        };
        Ok(Self { algorithm, digest })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn verify(&self, path: &Path) -> Result<()> {
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let actual = self
            .algorithm
            .hash(&mut file)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if actual != self.digest {
            bail!(
                "checksum mismatch: expected {}, got {}",
                hex::encode(&self.digest),
                hex::encode(actual)
            );
        }
        Ok(())
    }
}

/// Local file name for a downloaded URL: its last path segment.
pub fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or(DEFAULT_PAYLOAD_NAME)
        .to_string()
}

/// A script ready to run.
#[derive(Debug)]
pub enum PreparedScript {
    /// Unpacked or downloaded into the staging area
    Staged(StagedFile),
    /// Already present on the worker host
    Host(PathBuf),
}

impl PreparedScript {
    pub fn path(&self) -> &Path {
        match self {
            PreparedScript::Staged(file) => file.path(),
            PreparedScript::Host(path) => path,
        }
    }
}

/// Moves payloads and scripts from their sources into the repository.
pub struct PayloadStager {
    staging: StagingArea,
    repository_root: PathBuf,
    http: Box<dyn Fetcher>,
}

impl PayloadStager {
    pub fn new(
        staging: StagingArea,
        repository_root: impl Into<PathBuf>,
        http: Box<dyn Fetcher>,
    ) -> Self {
        Self {
            staging,
            repository_root: repository_root.into(),
            http,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    pub fn repository_root(&self) -> &Path {
        &self.repository_root
    }

    /// `<root>/<repo>` with the job's path appended.
    pub fn target_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.repository_dir(job)
            .join(job.path().trim_start_matches('/'))
    }

    fn repository_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.repository_root.join(job.repo())
    }

    /// Download `uri` into the staging area.
    ///
    /// `file://` URIs are copied. A `checksum` query parameter is verified
    /// against the staged bytes.
    pub fn fetch(&self, uri: &str) -> Result<StagedFile, JobError> {
        self.fetch_inner(uri).map_err(|err| JobError::Fetch {
            uri: uri.to_string(),
            reason: reason(&err),
        })
    }

    fn fetch_inner(&self, uri: &str) -> Result<StagedFile> {
        let url = Url::parse(uri).context("invalid URI")?;
        let checksum = url
            .query_pairs()
            .find(|(key, _)| key == CHECKSUM_PARAM)
            .map(|(_, value)| Checksum::parse(&value))
            .transpose()?;

        let mut staged = StagedFile::new(self.staging.path().join(file_name_for(&url)));
        staged.len = match url.scheme() {
            "file" => {
                let source = url
                    .to_file_path()
                    .map_err(|()| anyhow!("not a local file path"))?;
                fs::copy(&source, staged.path())
                    .with_context(|| format!("failed to copy {}", source.display()))?
            }
            "http" | "https" => self.http.fetch(&url, staged.path())?,
            other => bail!("unsupported scheme: {other}"),
        };

        if let Some(checksum) = checksum {
            checksum.verify(staged.path())?;
        }
        Ok(staged)
    }

    /// Unpack a tar archive into `target_dir`, creating it first.
    pub fn extract(&self, archive: &StagedFile, target_dir: &Path) -> Result<(), JobError> {
        let failed = |reason: String| JobError::Extract {
            archive: archive.path().display().to_string(),
            target_dir: target_dir.display().to_string(),
            reason,
        };

        fs::create_dir_all(target_dir)
            .map_err(|e| failed(format!("could not create target directory: {e}")))?;

        let args = [
            OsStr::new("-C"),
            target_dir.as_os_str(),
            OsStr::new("-xf"),
            archive.path().as_os_str(),
        ];
        let result = run_command("tar", &args).map_err(|e| failed(reason(&e)))?;
        result.ok().map_err(|e| failed(reason(&e)))?;
        Ok(())
    }

    /// Make a job script runnable.
    ///
    /// Embedded scripts are unpacked to [`SCRIPT_FILE`]. Remote references
    /// that parse as `http`, `https` or `file` URLs are fetched; anything else
    /// names a script already on this host.
    pub fn prepare_script(&self, script: &Script) -> Result<PreparedScript, JobError> {
        match script {
            Script::Embedded(body) => {
                let staged = self
                    .unpack_embedded(body)
                    .map_err(|e| JobError::Script(format!("could not unpack script: {}", reason(&e))))?;
                Ok(PreparedScript::Staged(staged))
            }
            Script::Remote(reference) => match Url::parse(reference) {
                Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => {
                    let staged = self.fetch(reference)?;
                    make_executable(staged.path()).map_err(|e| {
                        JobError::Script(format!("could not make script executable: {e}"))
                    })?;
                    Ok(PreparedScript::Staged(staged))
                }
                _ => Ok(PreparedScript::Host(PathBuf::from(reference))),
            },
        }
    }

    fn unpack_embedded(&self, body: &str) -> Result<StagedFile> {
        let content = unpack_script(body)?;
        let mut staged = StagedFile::new(self.staging.path().join(SCRIPT_FILE));
        fs::write(staged.path(), &content)
            .with_context(|| format!("failed to write {}", staged.path().display()))?;
        staged.len = content.len() as u64;
        make_executable(staged.path())
            .with_context(|| format!("failed to chmod {}", staged.path().display()))?;
        Ok(staged)
    }

    /// Run the script from the repository directory with the job's repo,
    /// path and script arguments.
    pub fn run_script(
        &self,
        job: &JobDescriptor,
        script: &Path,
    ) -> Result<CommandResult, JobError> {
        let mut args = vec![job.repo(), job.path()];
        if let Some(extra) = job.script_args() {
            args.push(extra);
        }

        let result = run_command_in_dir(script, args.as_slice(), &self.repository_dir(job))
            .map_err(|e| JobError::Script(reason(&e)))?;
        if !result.success {
            return Err(JobError::Script(format!(
                "exit code {}: {}",
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                tail(&result.stderr, conveyor_process::DEFAULT_TAIL_LINES)
            )));
        }
        Ok(result)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
