//! Repository transactions.
//!
//! A publish transaction is opened on a target (repository plus optional
//! subpath) and must end in exactly one of commit or abort. The
//! [`Publisher`] trait is the seam to the tool that does this on the host;
//! [`CvmfsServer`] drives the real `cvmfs_server` binary.

use anyhow::Result;
use conveyor_process::run_command;
use conveyor_types::{JobDescriptor, TransactionState};

use crate::error::{JobError, reason};
use crate::runner::Reporter;

/// The host tool that opens and closes repository transactions.
pub trait Publisher {
    /// Open a transaction on `target`. May fail if one is already open or the
    /// target is leased elsewhere.
    fn begin(&mut self, target: &str) -> Result<()>;
    /// Publish everything written since `begin`.
    fn commit(&mut self, repo: &str) -> Result<()>;
    /// Discard everything written since `begin`.
    fn abort(&mut self, repo: &str) -> Result<()>;
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn begin(&mut self, target: &str) -> Result<()> {
        (**self).begin(target)
    }

    fn commit(&mut self, repo: &str) -> Result<()> {
        (**self).commit(repo)
    }

    fn abort(&mut self, repo: &str) -> Result<()> {
        (**self).abort(repo)
    }
}

/// Publisher backed by the `cvmfs_server` command line tool.
#[derive(Debug, Clone)]
pub struct CvmfsServer {
    program: String,
}

impl CvmfsServer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn invoke(&self, args: &[&str]) -> Result<()> {
        run_command(&self.program, args)?.ok()?;
        Ok(())
    }
}

impl Publisher for CvmfsServer {
    fn begin(&mut self, target: &str) -> Result<()> {
        self.invoke(&["transaction", target])
    }

    fn commit(&mut self, repo: &str) -> Result<()> {
        self.invoke(&["publish", repo])
    }

    fn abort(&mut self, repo: &str) -> Result<()> {
        self.invoke(&["abort", "-f", repo])
    }
}

/// Publisher that only records what it was asked to do. Used for mock mode.
#[derive(Debug, Clone, Default)]
pub struct DryRunPublisher {
    invocations: Vec<String>,
}

impl DryRunPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, formatted like `transaction repo/path`.
    pub fn invocations(&self) -> &[String] {
        &self.invocations
    }
}

impl Publisher for DryRunPublisher {
    fn begin(&mut self, target: &str) -> Result<()> {
        self.invocations.push(format!("transaction {target}"));
        Ok(())
    }

    fn commit(&mut self, repo: &str) -> Result<()> {
        self.invocations.push(format!("publish {repo}"));
        Ok(())
    }

    fn abort(&mut self, repo: &str) -> Result<()> {
        self.invocations.push(format!("abort -f {repo}"));
        Ok(())
    }
}

/// An open transaction on one repository target.
///
/// Created only by a successful [`RepositoryTransaction::begin`] and consumed
/// by [`RepositoryTransaction::end`]. If it is dropped while still open, for
/// example while unwinding, it aborts on a best-effort basis.
pub struct RepositoryTransaction<'a, P: Publisher + ?Sized> {
    publisher: &'a mut P,
    repo: String,
    target: String,
    job_id: String,
    state: TransactionState,
}

impl<'a, P: Publisher + ?Sized> RepositoryTransaction<'a, P> {
    pub fn begin(
        publisher: &'a mut P,
        job: &JobDescriptor,
        reporter: &mut dyn Reporter,
    ) -> Result<Self, JobError> {
        let target = job.target();
        reporter.info(&format!("{}: opening transaction on {target}", job.id()));

        if let Err(err) = publisher.begin(&target) {
            return Err(JobError::BeginRejected {
                target,
                reason: reason(&err),
            });
        }

        Ok(Self {
            publisher,
            repo: job.repo().to_string(),
            target,
            job_id: job.id().to_string(),
            state: TransactionState::Active,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commit on success, abort otherwise. Exactly one of the two runs; a
    /// failed commit is not followed by an abort.
    pub fn end(
        mut self,
        success: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<TransactionState, JobError> {
        if success {
            reporter.info(&format!("{}: publishing {}", self.job_id, self.repo));
            self.state = TransactionState::Committed;
            self.publisher
                .commit(&self.repo)
                .map_err(|err| JobError::Commit {
                    repo: self.repo.clone(),
                    reason: reason(&err),
                })?;
        } else {
            reporter.warn(&format!(
                "{}: aborting transaction on {}",
                self.job_id, self.repo
            ));
            self.state = TransactionState::Aborted;
            self.publisher
                .abort(&self.repo)
                .map_err(|err| JobError::Abort {
                    repo: self.repo.clone(),
                    reason: reason(&err),
                })?;
        }
        Ok(self.state)
    }
}

impl<P: Publisher + ?Sized> Drop for RepositoryTransaction<'_, P> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Aborted;
            let _ = self.publisher.abort(&self.repo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
    }

    impl Reporter for Recorder {
        fn info(&mut self, msg: &str) {
            self.lines.push(format!("info {msg}"));
        }
        fn warn(&mut self, msg: &str) {
            self.lines.push(format!("warn {msg}"));
        }
        fn error(&mut self, msg: &str) {
            self.lines.push(format!("error {msg}"));
        }
    }

    #[derive(Default)]
    struct Scripted {
        calls: Vec<String>,
        reject_begin: bool,
        fail_commit: bool,
    }

    impl Publisher for Scripted {
        fn begin(&mut self, target: &str) -> Result<()> {
            self.calls.push(format!("begin {target}"));
            if self.reject_begin {
                anyhow::bail!("another transaction is already open");
            }
            Ok(())
        }
        fn commit(&mut self, repo: &str) -> Result<()> {
            self.calls.push(format!("commit {repo}"));
            if self.fail_commit {
                anyhow::bail!("signing failed");
            }
            Ok(())
        }
        fn abort(&mut self, repo: &str) -> Result<()> {
            self.calls.push(format!("abort {repo}"));
            Ok(())
        }
    }

    fn job(path: &str) -> JobDescriptor {
        JobDescriptor::new("j1", "example.repo", "http://x/a.tar", path).expect("job")
    }

    #[test]
    fn begin_uses_repo_and_path_as_target() {
        let mut publisher = Scripted::default();
        let mut reporter = Recorder::default();
        let txn =
            RepositoryTransaction::begin(&mut publisher, &job("/sw"), &mut reporter).expect("begin");
        assert_eq!(txn.target(), "example.repo/sw");
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.end(true, &mut reporter).expect("end"), TransactionState::Committed);
        assert_eq!(publisher.calls, ["begin example.repo/sw", "commit example.repo"]);
    }

    #[test]
    fn root_path_targets_the_whole_repository() {
        let mut publisher = Scripted::default();
        let mut reporter = Recorder::default();
        let txn =
            RepositoryTransaction::begin(&mut publisher, &job("/"), &mut reporter).expect("begin");
        assert_eq!(txn.target(), "example.repo");
    }

    #[test]
    fn rejected_begin_does_not_abort() {
        let mut publisher = Scripted {
            reject_begin: true,
            ..Scripted::default()
        };
        let mut reporter = Recorder::default();
        let err = RepositoryTransaction::begin(&mut publisher, &job("/sw"), &mut reporter)
            .err()
            .expect("begin must fail");
        assert!(matches!(err, JobError::BeginRejected { .. }));
        assert!(err.to_string().contains("already open"));
        assert_eq!(publisher.calls, ["begin example.repo/sw"]);
    }

    #[test]
    fn failure_aborts_once() {
        let mut publisher = Scripted::default();
        let mut reporter = Recorder::default();
        let txn =
            RepositoryTransaction::begin(&mut publisher, &job("/sw"), &mut reporter).expect("begin");
        assert_eq!(txn.end(false, &mut reporter).expect("end"), TransactionState::Aborted);
        assert_eq!(publisher.calls, ["begin example.repo/sw", "abort example.repo"]);
        assert!(reporter.lines.iter().any(|l| l.starts_with("warn j1: aborting")));
    }

    #[test]
    fn failed_commit_is_not_followed_by_abort() {
        let mut publisher = Scripted {
            fail_commit: true,
            ..Scripted::default()
        };
        let mut reporter = Recorder::default();
        let txn =
            RepositoryTransaction::begin(&mut publisher, &job("/sw"), &mut reporter).expect("begin");
        let err = txn.end(true, &mut reporter).expect_err("commit must fail");
        assert!(matches!(err, JobError::Commit { .. }));
        assert_eq!(publisher.calls, ["begin example.repo/sw", "commit example.repo"]);
    }

    #[test]
    fn dropping_an_open_transaction_aborts() {
        let mut publisher = Scripted::default();
        let mut reporter = Recorder::default();
        {
            let _txn = RepositoryTransaction::begin(&mut publisher, &job("/sw"), &mut reporter)
                .expect("begin");
        }
        assert_eq!(publisher.calls, ["begin example.repo/sw", "abort example.repo"]);
    }

    #[test]
    fn works_through_a_boxed_publisher() {
        let mut publisher: Box<dyn Publisher> = Box::new(DryRunPublisher::new());
        let mut reporter = Recorder::default();
        let txn = RepositoryTransaction::begin(publisher.as_mut(), &job("/sw"), &mut reporter)
            .expect("begin");
        txn.end(true, &mut reporter).expect("end");
    }

    #[test]
    fn dry_run_records_command_lines() {
        let mut publisher = DryRunPublisher::new();
        publisher.begin("r/sw").expect("begin");
        publisher.abort("r").expect("abort");
        assert_eq!(publisher.invocations(), ["transaction r/sw", "abort -f r"]);
    }

    #[cfg(unix)]
    #[test]
    fn cvmfs_server_passes_expected_arguments() {
        use std::os::unix::fs::PermissionsExt;

        let td = tempfile::tempdir().expect("tempdir");
        let log = td.path().join("calls.log");
        let program = td.path().join("fake_cvmfs_server");
        std::fs::write(
            &program,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\n", log.display()),
        )
        .expect("write");
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let mut server = CvmfsServer::new(program.display().to_string());
        server.begin("example.repo/sw").expect("begin");
        server.commit("example.repo").expect("commit");
        server.abort("example.repo").expect("abort");

        let calls = std::fs::read_to_string(&log).expect("log");
        assert_eq!(
            calls,
            "transaction example.repo/sw\npublish example.repo\nabort -f example.repo\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn cvmfs_server_surfaces_non_zero_exit() {
        use std::os::unix::fs::PermissionsExt;

        let td = tempfile::tempdir().expect("tempdir");
        let program = td.path().join("fake_cvmfs_server");
        std::fs::write(&program, "#!/bin/sh\necho 'repository is busy' >&2\nexit 1\n")
            .expect("write");
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let mut server = CvmfsServer::new(program.display().to_string());
        let err = server.begin("example.repo").expect_err("must fail");
        assert!(format!("{err:#}").contains("repository is busy"));
    }
}
