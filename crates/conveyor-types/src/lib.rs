//! Core domain types for conveyor.
//!
//! The job descriptor is the wire contract between `conveyor submit` and the
//! consuming worker; the remaining types describe the transaction and
//! delivery state machines and the lifecycle events recorded for each job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification for delivery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Redelivering the message may succeed
    #[default]
    Retryable,
    /// Redelivering the message can never succeed
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Reasons a job descriptor cannot be built or decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("job description field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("job description field `{field}` escapes the repository: {value:?}")]
    EscapesRepository { field: &'static str, value: String },
    #[error("invalid job description: {0}")]
    Invalid(String),
}

/// Repository path of the root directory.
pub const ROOT_PATH: &str = "/";

/// Prefix `path` with `/` unless it already starts with one.
///
/// An empty path is the repository root.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        ROOT_PATH.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Transaction script attached to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// gzip-compressed, base64-encoded script content
    Embedded(String),
    /// Reference resolved by the worker (URI or host path)
    Remote(String),
}

/// One unit of work: materialize `payload` at `path` inside `repo`.
///
/// A descriptor is immutable once built. `path` always starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireDescriptor", try_from = "WireDescriptor")]
pub struct JobDescriptor {
    id: String,
    repo: String,
    payload: String,
    path: String,
    script: Option<Script>,
    script_args: Option<String>,
    deps: Option<Vec<String>>,
}

impl JobDescriptor {
    /// Build a descriptor, normalizing `path`.
    pub fn new(
        id: impl Into<String>,
        repo: impl Into<String>,
        payload: impl Into<String>,
        path: &str,
    ) -> Result<Self, DescriptorError> {
        let descriptor = Self {
            id: id.into(),
            repo: repo.into(),
            payload: payload.into(),
            path: normalize_path(path),
            script: None,
            script_args: None,
            deps: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.script = Some(script);
        self
    }

    pub fn with_script_args(mut self, args: impl Into<String>) -> Self {
        self.script_args = Some(args.into());
        self
    }

    pub fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.deps = Some(deps);
        self
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        for (field, value) in [
            ("id", &self.id),
            ("repo", &self.repo),
            ("payload", &self.payload),
        ] {
            if value.trim().is_empty() {
                return Err(DescriptorError::EmptyField(field));
            }
        }
        if self.repo.contains('/') || matches!(self.repo.as_str(), "." | "..") {
            return Err(DescriptorError::EscapesRepository {
                field: "repo",
                value: self.repo.clone(),
            });
        }
        if self.path.split('/').any(|segment| segment == "..") {
            return Err(DescriptorError::EscapesRepository {
                field: "path",
                value: self.path.clone(),
            });
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    pub fn script_args(&self) -> Option<&str> {
        self.script_args.as_deref()
    }

    pub fn deps(&self) -> &[String] {
        self.deps.as_deref().unwrap_or_default()
    }

    /// Transaction target handed to the publishing tool.
    ///
    /// `repo` followed by `path`, or just `repo` for the root path.
    pub fn target(&self) -> String {
        if self.path == ROOT_PATH {
            self.repo.clone()
        } else {
            format!("{}{}", self.repo, self.path)
        }
    }

    /// Decode a descriptor from a message body.
    pub fn from_json(body: &[u8]) -> Result<Self, DescriptorError> {
        serde_json::from_slice(body).map_err(|e| DescriptorError::Invalid(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, DescriptorError> {
        serde_json::to_string(self).map_err(|e| DescriptorError::Invalid(e.to_string()))
    }
}

/// Flat key-value form of a descriptor, as carried in broker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireDescriptor {
    id: String,
    repo: String,
    payload: String,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_script: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script_args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deps: Option<Vec<String>>,
}

impl From<JobDescriptor> for WireDescriptor {
    fn from(job: JobDescriptor) -> Self {
        let (script, remote_script) = match job.script {
            Some(Script::Embedded(body)) => (Some(body), Some(false)),
            Some(Script::Remote(reference)) => (Some(reference), Some(true)),
            None => (None, None),
        };
        Self {
            id: job.id,
            repo: job.repo,
            payload: job.payload,
            path: job.path,
            script,
            remote_script,
            script_args: job.script_args,
            deps: job.deps,
        }
    }
}

impl TryFrom<WireDescriptor> for JobDescriptor {
    type Error = DescriptorError;

    fn try_from(wire: WireDescriptor) -> Result<Self, Self::Error> {
        if wire.path.is_empty() {
            return Err(DescriptorError::EmptyField("path"));
        }
        let script = wire.script.map(|s| {
            if wire.remote_script.unwrap_or(false) {
                Script::Remote(s)
            } else {
                Script::Embedded(s)
            }
        });
        let descriptor = Self {
            id: wire.id,
            repo: wire.repo,
            payload: wire.payload,
            path: normalize_path(&wire.path),
            script,
            script_args: wire.script_args,
            deps: wire.deps,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Lifecycle of one repository transaction once `begin` has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Lifecycle of one broker delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Waiting,
    Delivered,
    Processing,
    AckSent,
    NackSent,
}

/// Lifecycle event of a job, one JSONL line in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Job id, or `unknown` for a message that could not be decoded
    pub job: String,
}

impl JobEvent {
    pub fn now(job: impl Into<String>, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            job: job.into(),
        }
    }
}

/// Job id used for events of undecodable messages.
pub const UNKNOWN_JOB: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    JobReceived {
        repo: String,
        path: String,
        redelivered: bool,
    },
    DescriptorRejected {
        message: String,
    },
    TransactionOpened {
        target: String,
    },
    PayloadFetched {
        uri: String,
        bytes: u64,
    },
    PayloadExtracted {
        target_dir: String,
    },
    ScriptExecuted {
        duration_ms: u64,
    },
    TransactionCommitted,
    TransactionAborted {
        reason: String,
    },
    JobFinished {
        success: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<ErrorClass>,
    },
    MessageAcked,
    MessageNacked {
        requeue: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(path: &str) -> JobDescriptor {
        JobDescriptor::new("7d4f0c2e", "example.repo", "http://x/a.tar", path).expect("valid")
    }

    #[test]
    fn target_joins_repo_and_path() {
        assert_eq!(job("sw/v1").target(), "example.repo/sw/v1");
        assert_eq!(job("/sw/v1").target(), "example.repo/sw/v1");
        assert_eq!(job("/").target(), "example.repo");
    }

    #[test]
    fn empty_path_is_root() {
        assert_eq!(job("").path(), "/");
        assert_eq!(job("").target(), "example.repo");
    }

    #[test]
    fn empty_required_fields_are_rejected() {
        assert_eq!(
            JobDescriptor::new("id", "", "http://x/a.tar", "/"),
            Err(DescriptorError::EmptyField("repo"))
        );
        assert_eq!(
            JobDescriptor::new(" ", "r", "http://x/a.tar", "/"),
            Err(DescriptorError::EmptyField("id"))
        );
    }

    #[test]
    fn wire_form_is_flat() {
        let desc = job("d")
            .with_script(Script::Embedded("H4sI".to_string()))
            .with_deps(vec!["a".to_string(), "b".to_string()]);
        let value: serde_json::Value = serde_json::to_value(&desc).expect("serialize");
        insta::assert_snapshot!(serde_json::to_string_pretty(&value).expect("pretty"), @r#"
        {
          "deps": [
            "a",
            "b"
          ],
          "id": "7d4f0c2e",
          "path": "/d",
          "payload": "http://x/a.tar",
          "remote_script": false,
          "repo": "example.repo",
          "script": "H4sI"
        }
        "#);
    }

    #[test]
    fn decoding_requires_core_fields() {
        for missing in ["repo", "payload", "path", "id"] {
            let mut doc = serde_json::json!({
                "id": "1", "repo": "r", "payload": "http://x/a.tar", "path": "/d"
            });
            doc.as_object_mut().expect("object").remove(missing);
            let body = serde_json::to_vec(&doc).expect("encode");
            let err = JobDescriptor::from_json(&body).expect_err("must reject");
            assert!(err.to_string().contains(missing), "{missing}: {err}");
        }
    }

    #[test]
    fn decoding_rejects_garbage() {
        assert!(JobDescriptor::from_json(b"not json").is_err());
        assert!(JobDescriptor::from_json(b"[]").is_err());
    }

    #[test]
    fn decoding_normalizes_path_and_script_kind() {
        let desc = JobDescriptor::from_json(
            br#"{"id":"1","repo":"r","payload":"p","path":"d","script":"https://x/s.sh","remote_script":true}"#,
        )
        .expect("decode");
        assert_eq!(desc.path(), "/d");
        assert_eq!(desc.script(), Some(&Script::Remote("https://x/s.sh".to_string())));
        assert!(desc.deps().is_empty());
    }

    #[test]
    fn script_without_flag_is_embedded() {
        let desc = JobDescriptor::from_json(
            br#"{"id":"1","repo":"r","payload":"p","path":"/","script":"H4sI"}"#,
        )
        .expect("decode");
        assert_eq!(desc.script(), Some(&Script::Embedded("H4sI".to_string())));
    }

    #[test]
    fn parent_segments_are_rejected() {
        for path in ["/../../etc", "..", "sw/../../x"] {
            let err = JobDescriptor::new("1", "r", "p", path).expect_err(path);
            assert!(matches!(err, DescriptorError::EscapesRepository { field: "path", .. }));
        }
        for repo in ["..", "a/b", "."] {
            let err = JobDescriptor::new("1", repo, "p", "/").expect_err(repo);
            assert!(matches!(err, DescriptorError::EscapesRepository { field: "repo", .. }));
        }
        assert!(JobDescriptor::new("1", "r", "p", "/sw/v1..2/.hidden").is_ok());

        let err = JobDescriptor::from_json(br#"{"id":"1","repo":"r","payload":"p","path":"/../etc"}"#)
            .expect_err("decode");
        assert!(err.to_string().contains("escapes the repository"), "{err}");
    }

    #[test]
    fn event_is_tagged_by_type() {
        let event = JobEvent::now("42", EventType::MessageNacked { requeue: true });
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains(r#""event_type":{"type":"message_nacked","requeue":true}"#));
        assert!(json.contains(r#""job":"42""#));
    }

    proptest! {
        #[test]
        fn stored_path_always_has_leading_slash(p in "[a-z0-9/._-]{0,24}") {
            prop_assume!(!p.split('/').any(|segment| segment == ".."));
            let stored = job(&p).path().to_string();
            prop_assert!(stored.starts_with('/'));
            if p.starts_with('/') {
                prop_assert_eq!(stored, p);
            } else if p.is_empty() {
                prop_assert_eq!(stored, "/");
            } else {
                prop_assert_eq!(stored, format!("/{p}"));
            }
        }

        #[test]
        fn wire_round_trip_preserves_descriptor(
            repo in "[a-z][a-z0-9.]{0,15}",
            path in "[a-z0-9/]{0,16}",
            remote in any::<bool>(),
        ) {
            let script = if remote {
                Script::Remote("https://x/s.sh".to_string())
            } else {
                Script::Embedded("H4sI".to_string())
            };
            let desc = JobDescriptor::new("id-1", repo, "file:///tmp/a.tar", &path)
                .expect("valid")
                .with_script(script);
            let body = desc.to_json().expect("encode");
            let decoded = JobDescriptor::from_json(body.as_bytes()).expect("decode");
            prop_assert_eq!(decoded, desc);
        }
    }
}
