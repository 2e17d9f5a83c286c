use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::strategy::{BuildKind, BuildRequest};

/// Hash field names of a job record in the shared store.
pub mod fields {
    pub const JOB_ID: &str = "job_id";
    pub const KIND: &str = "kind";
    pub const STATUS: &str = "status";
    pub const STUDENT_ID: &str = "student_id";
    pub const STUDENT_NAME: &str = "student_name";
    pub const ASSIGNMENT_ID: &str = "assignment_id";
    pub const LAB_NAME: &str = "lab_name";
    pub const BUILD_PARAMS: &str = "build_params";
    pub const QUEUED_AT: &str = "queued_at";
    pub const STARTED_AT: &str = "started_at";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const HEARTBEAT_AT: &str = "heartbeat_at";
    pub const RESULT: &str = "result";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Compiling,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Compiling => "compiling",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// `queued -> compiling -> {complete, failed}`, plus `queued -> cancelled`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Compiling)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Compiling, JobStatus::Complete)
                | (JobStatus::Compiling, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "compiling" => Ok(JobStatus::Compiling),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Why a job ended without a successful build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool ran and reported failure (non-zero exit).
    BuildFailed,
    /// The subprocess exceeded its wall-clock budget and was killed.
    Timeout,
    /// The strategy could not prepare the build (missing file, bad parameters).
    Precondition,
    /// The build tool could not be started.
    Spawn,
    /// No strategy is registered for the job's kind in this pool.
    UnsupportedKind,
    StaleHeartbeat,
    MissingHeartbeat,
    Cancelled,
    /// The strategy task panicked or the worker hit an unexpected fault.
    Internal,
}

/// Terminal outcome of a job. Written exactly once, together with the terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Names of build outputs copied to the request's publish directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl JobResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.clone(),
            error: Some(message),
            error_kind: Some(kind),
            exit_code: None,
            artifacts: Vec::new(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(reason),
            error_kind: Some(FailureKind::Cancelled),
            exit_code: None,
            artifacts: Vec::new(),
        }
    }
}

/// Caller-supplied data for a new job. Opaque to the queue apart from `request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub student_id: String,
    pub student_name: String,
    pub assignment_id: String,
    pub lab_name: String,
    pub request: BuildRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub kind: BuildKind,
    pub status: JobStatus,
    pub student_id: String,
    pub student_name: String,
    pub assignment_id: String,
    pub lab_name: String,
    pub request: BuildRequest,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
}

impl JobRecord {
    pub fn new(submission: JobSubmission) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            kind: submission.request.spec.kind(),
            status: JobStatus::Queued,
            student_id: submission.student_id,
            student_name: submission.student_name,
            assignment_id: submission.assignment_id,
            lab_name: submission.lab_name,
            request: submission.request,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            result: None,
        }
    }

    /// Ownership is the submitting student's identity.
    pub fn owned_by(&self, owner: &str) -> bool {
        self.student_id == owner
    }

    /// Flatten into hash fields. Absent timestamps and results are stored as empty strings.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>> {
        let result = match &self.result {
            Some(result) => serde_json::to_string(result)?,
            None => String::new(),
        };
        Ok(vec![
            (fields::JOB_ID, self.job_id.to_string()),
            (fields::KIND, self.kind.to_string()),
            (fields::STATUS, self.status.to_string()),
            (fields::STUDENT_ID, self.student_id.clone()),
            (fields::STUDENT_NAME, self.student_name.clone()),
            (fields::ASSIGNMENT_ID, self.assignment_id.clone()),
            (fields::LAB_NAME, self.lab_name.clone()),
            (fields::BUILD_PARAMS, serde_json::to_string(&self.request)?),
            (fields::QUEUED_AT, format_timestamp(&self.queued_at)),
            (fields::STARTED_AT, format_optional(&self.started_at)),
            (fields::COMPLETED_AT, format_optional(&self.completed_at)),
            (fields::HEARTBEAT_AT, format_optional(&self.heartbeat_at)),
            (fields::RESULT, result),
        ])
    }

    pub fn from_fields(job_id: &str, map: &HashMap<String, String>) -> Result<Self> {
        let corrupt = |reason: String| QueueError::CorruptRecord {
            job_id: job_id.to_string(),
            reason,
        };
        let required = |name: &str| -> Result<&str> {
            map.get(name)
                .map(String::as_str)
                .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
        };
        let optional = |name: &str| -> &str { map.get(name).map(String::as_str).unwrap_or("") };

        let parsed_id = Uuid::parse_str(job_id).map_err(|e| corrupt(e.to_string()))?;
        let kind = required(fields::KIND)?.parse().map_err(corrupt)?;
        let status = required(fields::STATUS)?.parse().map_err(corrupt)?;
        let request = serde_json::from_str(required(fields::BUILD_PARAMS)?)
            .map_err(|e| corrupt(format!("build_params: {}", e)))?;
        let queued_at = parse_timestamp(required(fields::QUEUED_AT)?)
            .map_err(|e| corrupt(format!("queued_at: {}", e)))?
            .ok_or_else(|| corrupt("queued_at is empty".to_string()))?;

        let timestamp = |name: &str| {
            parse_timestamp(optional(name)).map_err(|e| corrupt(format!("{}: {}", name, e)))
        };

        let result = match optional(fields::RESULT) {
            "" => None,
            raw => Some(
                serde_json::from_str(raw).map_err(|e| corrupt(format!("result: {}", e)))?,
            ),
        };

        Ok(Self {
            job_id: parsed_id,
            kind,
            status,
            student_id: optional(fields::STUDENT_ID).to_string(),
            student_name: optional(fields::STUDENT_NAME).to_string(),
            assignment_id: optional(fields::ASSIGNMENT_ID).to_string(),
            lab_name: optional(fields::LAB_NAME).to_string(),
            request,
            queued_at,
            started_at: timestamp(fields::STARTED_AT)?,
            completed_at: timestamp(fields::COMPLETED_AT)?,
            heartbeat_at: timestamp(fields::HEARTBEAT_AT)?,
            result,
        })
    }
}

/// A record as seen by pollers, annotated with its place in the queue.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub record: JobRecord,
    /// 1-indexed position in the queue list; 0 once the job has left it.
    pub position: usize,
    /// Only present while the job is queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn format_optional(ts: &Option<DateTime<Utc>>) -> String {
    ts.as_ref().map(format_timestamp).unwrap_or_default()
}

pub fn parse_timestamp(raw: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{BuildSpec, CompileSpec};
    use std::path::PathBuf;

    fn submission() -> JobSubmission {
        JobSubmission {
            student_id: "1042".to_string(),
            student_name: "Ada Student".to_string(),
            assignment_id: "77".to_string(),
            lab_name: "lab3".to_string(),
            request: BuildRequest {
                work_dir: PathBuf::from("/tmp/builds/1042-77"),
                publish_dir: None,
                spec: BuildSpec::Compile(CompileSpec {
                    source_files: vec!["lab3.c".to_string(), "hw_interface.c".to_string()],
                    output_name: "firmware".to_string(),
                    template_dir: None,
                }),
            },
        }
    }

    #[test]
    fn new_record_is_queued_without_result() {
        let record = JobRecord::new(submission());
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.kind, BuildKind::Compile);
        assert!(record.started_at.is_none());
        assert!(record.heartbeat_at.is_none());
        assert!(record.result.is_none());
        assert!(record.owned_by("1042"));
        assert!(!record.owned_by("9999"));
    }

    #[test]
    fn absent_values_are_stored_as_empty_strings() {
        let record = JobRecord::new(submission());
        let flat: HashMap<&str, String> = record.to_fields().unwrap().into_iter().collect();
        assert_eq!(flat[fields::STATUS], "queued");
        assert_eq!(flat[fields::KIND], "compile");
        assert_eq!(flat[fields::STARTED_AT], "");
        assert_eq!(flat[fields::RESULT], "");
    }

    #[test]
    fn record_survives_flat_field_storage() {
        let mut record = JobRecord::new(submission());
        record.status = JobStatus::Failed;
        record.started_at = Some(Utc::now());
        record.completed_at = Some(Utc::now());
        record.result = Some(JobResult::failure(FailureKind::Timeout, "build timed out"));

        let map: HashMap<String, String> = record
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = JobRecord::from_fields(&record.job_id.to_string(), &map).unwrap();

        assert_eq!(restored, record);
    }

    #[test]
    fn from_fields_reports_corruption() {
        let mut map = HashMap::new();
        map.insert(fields::STATUS.to_string(), "exploded".to_string());
        let err = JobRecord::from_fields(&Uuid::new_v4().to_string(), &map).unwrap_err();
        assert!(matches!(err, QueueError::CorruptRecord { .. }));
    }

    #[test]
    fn status_transitions_are_one_directional() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Compiling));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Compiling.can_transition_to(Complete));
        assert!(Compiling.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Complete));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Compiling.can_transition_to(Queued));
        assert!(!Compiling.can_transition_to(Cancelled));
        for terminal in [Complete, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Compiling, Complete, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parses_its_own_display() {
        for status in [
            JobStatus::Queued,
            JobStatus::Compiling,
            JobStatus::Complete,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }
}
