//! Run and node execution records.
//!
//! Node results move `pending -> running -> success | failed | skipped`. A
//! terminal result is never rewritten, which lets stores persist every step
//! as it happens and lets an interrupted run resume from what was written.

use crate::frontier::SkipReason;
use crate::node::NodeId;
use chainweave_core::{ExecutionId, UserId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nodes are still executing.
    Running,
    /// Every reached node succeeded or was skipped.
    Success,
    /// Some nodes failed but their failure policy let the run continue.
    PartialSuccess,
    /// A node failed and stopped its downstream branch.
    Failed,
}

impl RunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Ready and waiting for a dispatch slot.
    Pending,
    /// Handler is executing.
    Running,
    /// Handler succeeded.
    Success,
    /// Handler failed, timed out, or panicked.
    Failed,
    /// Never executed because no route reached it.
    Skipped,
}

impl NodeStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// The execution record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    /// The node this record is for.
    pub node_id: NodeId,
    /// Current status.
    pub status: NodeStatus,
    /// Input the node was dispatched with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    /// Output produced on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    /// Error text on failure, exactly as the handler reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Informational message from the handler, or why the node was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Dollar cost the node reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// How many times the handler was retried.
    #[serde(default)]
    pub retry_count: u32,
    /// When the handler was first invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    /// Creates a pending record.
    #[must_use]
    pub fn pending(node_id: NodeId, input: JsonValue) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            input: Some(input),
            output: None,
            error: None,
            message: None,
            cost: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Creates a skipped record.
    #[must_use]
    pub fn skipped(node_id: NodeId, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            status: NodeStatus::Skipped,
            input: None,
            output: None,
            error: None,
            message: Some(reason.to_string()),
            cost: None,
            retry_count: 0,
            started_at: None,
            finished_at: Some(now),
        }
    }

    /// Marks the node as running.
    pub fn start(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the node as succeeded.
    pub fn succeed(&mut self, output: JsonValue, cost: Option<f64>, message: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Success;
        self.output = Some(output);
        self.cost = cost;
        self.message = message;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the node as failed.
    pub fn fail(&mut self, error: String, cost: Option<f64>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Failed;
        self.error = Some(error);
        self.cost = cost;
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock time between start and finish.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds())
    }
}

/// A record of a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Unique identifier for this run.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Who the run is billed to.
    pub user_id: UserId,
    /// Current status.
    pub status: RunStatus,
    /// The payload the run was triggered with.
    pub trigger_payload: JsonValue,
    /// Whether side effects were simulated.
    pub test_mode: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Creates a running record with a fresh execution id.
    #[must_use]
    pub fn start(
        workflow_id: WorkflowId,
        user_id: UserId,
        trigger_payload: JsonValue,
        test_mode: bool,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            user_id,
            status: RunStatus::Running,
            trigger_payload,
            test_mode,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Marks the run finished.
    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(at);
    }
}
