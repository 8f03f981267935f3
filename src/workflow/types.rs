//! Core workflow type definitions
//!
//! Defines the process graph (definitions, nodes, edges, variables) and the
//! runtime entities the engine drives (instances, history entries, tasks).
//! Everything here serializes to camelCase JSON so a durable store layered
//! under the engine can persist the entities losslessly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Variable bag carried by an instance and merged by each completed step
pub type Variables = HashMap<String, Value>;

// ── Definitions ──────────────────────────────────────────────────────

/// Lifecycle of a definition version. Only `Active` versions can be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Deprecated,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }
}

/// A versioned, immutable process graph
///
/// Nodes keep their declaration order; the first `start` node is the entry
/// point of every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "approval-flow")
    pub id: String,
    /// Monotonic version number; several versions may share an id
    pub version: u32,
    /// Human-readable name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: DefinitionStatus,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Declared input variables
    #[serde(default)]
    pub variables: Vec<WorkflowVariable>,
}

impl WorkflowDefinition {
    /// Look up a node by id
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// The entry node of the graph, if one is declared
    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|node| matches!(node.kind, NodeKind::Start))
    }

    /// Outgoing edges of a node in declaration order
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.source_node_id == node_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }
}

/// Declared type of a workflow variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// RFC 3339 timestamp carried as a string
    Date,
}

impl VariableType {
    /// Whether a JSON value is acceptable for this declared type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Date => value
                .as_str()
                .map(|raw| DateTime::parse_from_rfc3339(raw).is_ok())
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── Nodes ────────────────────────────────────────────────────────────

/// A single typed step in the graph
///
/// The node type and its configuration travel together in `kind`, so
/// `{"id": "a", "name": "A", "type": "timer", "delaySecs": 5}` is a timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Type-specific node configuration, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task(TaskConfig),
    Approval(TaskConfig),
    Condition(ConditionConfig),
    Parallel,
    Gateway(GatewayConfig),
    Timer(TimerConfig),
    Webhook(WebhookConfig),
    Script(ScriptConfig),
    Custom(CustomConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Start => NodeType::Start,
            Self::End => NodeType::End,
            Self::Task(_) => NodeType::Task,
            Self::Approval(_) => NodeType::Approval,
            Self::Condition(_) => NodeType::Condition,
            Self::Parallel => NodeType::Parallel,
            Self::Gateway(_) => NodeType::Gateway,
            Self::Timer(_) => NodeType::Timer,
            Self::Webhook(_) => NodeType::Webhook,
            Self::Script(_) => NodeType::Script,
            Self::Custom(_) => NodeType::Custom,
        }
    }
}

/// Plain node type tag, used in history entries and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Task,
    Approval,
    Condition,
    Parallel,
    Gateway,
    Timer,
    Webhook,
    Script,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    #[default]
    User,
    Role,
    Group,
}

/// Configuration shared by `task` and `approval` nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    pub assignees: Vec<String>,
    pub assignee_type: AssigneeType,
    /// Seconds until the created task is due
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Node entered when the task is rejected. Without it a rejection fails
    /// the whole instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_target: Option<String>,
}

/// One `expression → target` pair of a condition node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionBranch {
    pub expression: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionConfig {
    /// Evaluated in order; the first true expression wins
    pub branches: Vec<ConditionBranch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Number of incoming branch arrivals required before the gateway is
    /// entered. 1 means every arrival passes straight through.
    pub join_count: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { join_count: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    /// Expression yielding the delay in seconds; wins over `delay_secs`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_expression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    #[serde(rename_all = "camelCase")]
    ApiKey { header: String, value: String },
}

/// Outbound HTTP call made by a webhook node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Target URL; `{{name}}` placeholders are filled from variables
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
    /// Request body; defaults to the instance variables for body-carrying methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// JSONPath applied to the response body before it is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_path: Option<String>,
    /// Variable receiving the captured response; defaults to the node id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_on_error: Option<bool>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Sandboxed script executed by a script node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    #[serde(default = "default_language")]
    pub language: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_on_error: Option<bool>,
}

fn default_language() -> String {
    "lua".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    /// Name of the registered handler
    pub handler: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_on_error: Option<bool>,
}

/// Directed transition between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source_node_id: String,
    pub target_node_id: String,
    /// Guard expression; the edge fires when it evaluates truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source_node_id: source.into(),
            target_node_id: target.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

// ── Instances ────────────────────────────────────────────────────────

/// Instance status. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Suspended,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Suspended => "suspended",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
}

/// One running (or finished) execution of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: InstanceStatus,
    /// Nodes entered but not yet completed, in entry order, without duplicates
    pub current_node_ids: Vec<String>,
    pub variables: Variables,
    /// Append-only audit trail
    pub history: Vec<WorkflowHistoryEntry>,
    pub metadata: InstanceMetadata,
    pub initiator: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the instance failed, was canceled or suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_active(&self, node_id: &str) -> bool {
        self.current_node_ids.iter().any(|id| id == node_id)
    }

    /// Adds a node to the active set; returns false if it was already active
    pub(crate) fn activate(&mut self, node_id: &str) -> bool {
        if self.is_active(node_id) {
            return false;
        }
        self.current_node_ids.push(node_id.to_string());
        true
    }

    pub(crate) fn deactivate(&mut self, node_id: &str) -> bool {
        let before = self.current_node_ids.len();
        self.current_node_ids.retain(|id| id != node_id);
        before != self.current_node_ids.len()
    }

    pub(crate) fn record(&mut self, entry: WorkflowHistoryEntry) {
        self.updated_at = entry.timestamp;
        self.history.push(entry);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Entered,
    Completed,
    Failed,
    Skipped,
    Rejected,
}

/// Immutable record of one node entry, completion, skip, rejection or failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub action: HistoryAction,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WorkflowHistoryEntry {
    pub fn new(node: &WorkflowNode, action: HistoryAction, actor: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            node_type: node.node_type(),
            action,
            actor: actor.to_string(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
    Canceled,
}

impl TaskStatus {
    /// Pending and in-progress tasks can still be acted on
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Task,
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComment {
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A unit of human work created when a task or approval node is entered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub id: String,
    pub instance_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub node_name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub assignees: Vec<String>,
    pub assignee_type: AssigneeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<TaskComment>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    /// Data submitted with the completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

// ── Requests ─────────────────────────────────────────────────────────

/// Input of `start_workflow`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub variables: Option<Variables>,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

impl StartWorkflowRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables
            .get_or_insert_with(Variables::new)
            .insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Complete,
    Reject,
}

/// Input of `complete_workflow_task`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskRequest {
    pub action: TaskAction,
    #[serde(default)]
    pub data: Option<Variables>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl CompleteTaskRequest {
    pub fn complete() -> Self {
        Self {
            action: TaskAction::Complete,
            data: None,
            comment: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            action: TaskAction::Reject,
            data: None,
            comment: None,
        }
    }

    pub fn with_data(mut self, data: Variables) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
