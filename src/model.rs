//! Domain types shared by the ledger, the backends and the session API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

numeric_id!(
    /// Row id of a file in the shared corpus.
    FileId
);
numeric_id!(
    /// Row id of a workflow.
    WorkflowId
);
numeric_id!(
    /// Row id of an action. Same-named actions in different workflows have different ids.
    ActionId
);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Identity of a registered worker lease.
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Lifecycle status of one (file, action) queue record.
pub enum QueueStatus {
    Unattempted,
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 6] = [
        QueueStatus::Unattempted,
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Unattempted => "unattempted",
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }

    /// Accepts the stored lowercase name in any case, or the single-letter
    /// code used by older tooling (`U`, `P`, `R`, `C`, `F`, `S`).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let status = match value.to_ascii_lowercase().as_str() {
            "unattempted" | "u" => QueueStatus::Unattempted,
            "pending" | "p" => QueueStatus::Pending,
            "processing" | "r" => QueueStatus::Processing,
            "completed" | "c" => QueueStatus::Completed,
            "failed" | "f" => QueueStatus::Failed,
            "skipped" | "s" => QueueStatus::Skipped,
            _ => return None,
        };
        Some(status)
    }

    /// Edges of the queue state machine. Anything not listed needs an override.
    pub fn can_transition_to(self, to: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, to),
            (Unattempted, Pending)
                | (Pending, Processing)
                | (Skipped, Processing)
                | (Processing, Completed | Failed | Skipped | Pending)
                | (Completed | Failed | Skipped, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Skipped
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::parse(s).ok_or_else(|| format!("unknown queue status `{s}`"))
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    BelowNormal = 2,
    #[default]
    Normal = 3,
    AboveNormal = 4,
    High = 5,
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Priority::Low),
            2 => Some(Priority::BelowNormal),
            3 => Some(Priority::Normal),
            4 => Some(Priority::AboveNormal),
            5 => Some(Priority::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::BelowNormal => "below_normal",
            Priority::Normal => "normal",
            Priority::AboveNormal => "above_normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(number) = s.trim().parse::<i16>() {
            return Priority::from_i16(number)
                .ok_or_else(|| format!("priority {number} out of range 1..=5"));
        }
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "low" => Ok(Priority::Low),
            "below_normal" => Ok(Priority::BelowNormal),
            "normal" => Ok(Priority::Normal),
            "above_normal" => Ok(Priority::AboveNormal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    #[default]
    Undefined,
    Redaction,
    Extraction,
    Classification,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Undefined => "undefined",
            WorkflowType::Redaction => "redaction",
            WorkflowType::Extraction => "extraction",
            WorkflowType::Classification => "classification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "undefined" => Some(WorkflowType::Undefined),
            "redaction" => Some(WorkflowType::Redaction),
            "extraction" => Some(WorkflowType::Extraction),
            "classification" => Some(WorkflowType::Classification),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowType::parse(s).ok_or_else(|| format!("unknown workflow type `{s}`"))
    }
}

/// Which queue records a dequeue call may claim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMode {
    PendingAnyUser,
    SkippedAnyUser,
    SkippedForUser(String),
}

impl QueueMode {
    pub fn source_status(&self) -> QueueStatus {
        match self {
            QueueMode::PendingAnyUser => QueueStatus::Pending,
            QueueMode::SkippedAnyUser | QueueMode::SkippedForUser(_) => QueueStatus::Skipped,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            QueueMode::SkippedForUser(user) => Some(user),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Tie-break within a priority band.
pub enum DequeueOrder {
    #[default]
    Sequence,
    Random,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub workflow_type: WorkflowType,
    pub track_history: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub name: String,
    /// `None` for legacy actions that are not scoped to a workflow.
    pub workflow_id: Option<WorkflowId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub size_bytes: i64,
    pub page_count: i32,
    pub deleted: bool,
}

/// Ledger row for one (file, action) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub file_id: FileId,
    pub action_id: ActionId,
    pub status: QueueStatus,
    pub priority: Priority,
    pub sequence: i64,
    pub lease_id: Option<LeaseId>,
    pub comment: Option<String>,
    pub skipped_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A record handed to a worker by dequeue; it is Processing under the worker's lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedFile {
    pub file_id: FileId,
    pub path: String,
    pub size_bytes: i64,
    pub page_count: i32,
    pub action_id: ActionId,
    pub action_name: String,
    pub workflow_id: Option<WorkflowId>,
    pub priority: Priority,
    pub sequence: i64,
    pub lease_id: LeaseId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLease {
    pub id: LeaseId,
    pub session_id: Uuid,
    pub machine: String,
    pub process_id: i64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Audit row written for workflows that track history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub file_id: FileId,
    pub action_id: ActionId,
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub lease_id: Option<LeaseId>,
    pub comment: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// What a worker reports after processing a claimed file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Failed { comment: Option<String> },
    Skipped,
    /// Hand the file back to the queue.
    Requeue,
}

impl Outcome {
    pub fn target_status(&self) -> QueueStatus {
        match self {
            Outcome::Completed => QueueStatus::Completed,
            Outcome::Failed { .. } => QueueStatus::Failed,
            Outcome::Skipped => QueueStatus::Skipped,
            Outcome::Requeue => QueueStatus::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounters {
    pub files: i64,
    pub bytes: i64,
    pub pages: i64,
}

impl StatusCounters {
    pub fn is_zero(&self) -> bool {
        self.files == 0 && self.bytes == 0 && self.pages == 0
    }

    pub(crate) fn add(&mut self, sign: i64, bytes: i64, pages: i64) {
        self.files += sign;
        self.bytes += sign * bytes;
        self.pages += sign * pages;
    }

    pub(crate) fn merge(&mut self, other: &StatusCounters) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.pages += other.pages;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatusCounters {
    pub action_id: ActionId,
    pub status: QueueStatus,
    pub counters: StatusCounters,
}

/// Per-status rollup for one action name over a resolved set of action ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub action: String,
    pub action_ids: Vec<ActionId>,
    pub by_status: BTreeMap<QueueStatus, StatusCounters>,
}

impl AggregateStats {
    pub fn counters(&self, status: QueueStatus) -> StatusCounters {
        self.by_status.get(&status).copied().unwrap_or_default()
    }

    pub fn total(&self) -> StatusCounters {
        let mut total = StatusCounters::default();
        for counters in self.by_status.values() {
            total.merge(counters);
        }
        total
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertSummary {
    pub lease_id: LeaseId,
    pub records_reverted: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertReport {
    pub leases_reverted: usize,
    pub records_reverted: u64,
    pub failures: usize,
}
