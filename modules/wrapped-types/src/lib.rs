//! Shared types for the wrapped scraper service and its RPC clients.

use serde::{Deserialize, Serialize};

// =====================================================
// Domain Types
// =====================================================

/// Lifecycle state of a waitlist job.
///
/// `PendingUpload` is the alternate-ingestion placeholder: a row created by
/// the upload-secret path that the worker must never claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    PendingUpload,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::PendingUpload => "pending_upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "pending_upload" => Some(JobStatus::PendingUpload),
            _ => None,
        }
    }
}

/// Processing mode for a waitlist job.
///
/// Restricted mode only touches public channels: no private channels, no
/// DMs, and no special-recipient query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Default,
    Restricted,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Default => "default",
            JobMode::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(JobMode::Default),
            "restricted" => Some(JobMode::Restricted),
            _ => None,
        }
    }
}

/// A waitlist job. Exactly one exists per user at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub user_id: String,
    pub platform_user_id: String,
    /// Short-lived user token. Cleared (set to empty) once the job
    /// completes; never exposed over RPC.
    pub credential: String,
    pub status: JobStatus,
    pub mode: JobMode,
    pub enqueued_at: String,
    pub github_handle: Option<String>,
    pub result_json: Option<String>,
    pub global_stats_id: Option<String>,
}

/// A top channel entry, rank 1 = most messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopChannel {
    pub name: String,
    pub rank: u32,
}

/// A top DM partner entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopDm {
    pub name: String,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// The scraper's output for one user, stored on the completed job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WrappedStats {
    pub top_channels: Vec<TopChannel>,
    pub top_dms: Vec<TopDm>,
    pub total_messages: u64,
    pub confessions_messages: u64,
    pub meta_messages: u64,
    /// Absent (zero) in restricted mode.
    pub prox_messages: u64,
}

/// The fully assembled payload served to the front end: stored stats plus
/// the best-effort auxiliary lookups and the deterministic group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedData {
    pub user_name: String,
    pub total_messages: u64,
    pub top_channels: Vec<TopChannel>,
    pub top_dms: Vec<TopDm>,
    pub confessions_messages: u64,
    pub meta_messages: u64,
    pub prox_messages: u64,
    pub tracked_hours: u64,
    pub project_submissions: u64,
    pub project_names: Vec<String>,
    pub group_name: String,
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinWaitlistRequest {
    pub user_id: String,
    /// Identifier used in platform API queries; defaults to `user_id`.
    pub platform_user_id: Option<String>,
    pub credential: String,
    pub mode: Option<JobMode>,
    pub github_handle: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserIdRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadRequest {
    pub secret: String,
    pub data: WrappedStats,
    pub github_handle: Option<String>,
}

// =====================================================
// RPC Response Types
// =====================================================

/// Position of a user's job in the waitlist. Position 0 means the job is
/// already processing, completed, or waiting on an upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueuePosition {
    pub status: JobStatus,
    pub position: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub queue_size: i64,
    pub is_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadSecret {
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub queue_size: i64,
    pub completed_jobs: i64,
    pub worker_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::PendingUpload,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("nope"), None);
    }

    #[test]
    fn mode_roundtrip() {
        assert_eq!(JobMode::parse("default"), Some(JobMode::Default));
        assert_eq!(JobMode::parse("restricted"), Some(JobMode::Restricted));
        assert_eq!(JobMode::parse(""), None);
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobMode::Restricted).unwrap(),
            "\"restricted\""
        );
    }

    #[test]
    fn stats_serialization_skips_missing_image() {
        let dm = TopDm {
            name: "orpheus".to_string(),
            count: 3,
            image: None,
        };
        let json = serde_json::to_string(&dm).unwrap();
        assert!(!json.contains("image"));
    }
}
