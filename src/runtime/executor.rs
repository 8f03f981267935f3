/// Node execution handlers
///
/// `dispatch` decides, synchronously and without side effects, what entering
/// a node means: auto-complete, route to a specific target, wait for a human
/// task, wait for a timer, or hand off to an external collaborator. The
/// external calls themselves run in `invoke_external`, which the engine only
/// awaits outside the instance critical section.

use crate::{
    error::{EngineError, EngineResult},
    runtime::{
        condition,
        http::HttpClient,
        script::ScriptRunner,
    },
    workflow::types::{
        ConditionConfig, CustomConfig, NodeKind, ScriptConfig, TaskConfig, TaskKind, TimerConfig,
        Variables, WebhookConfig, WorkflowInstance, WorkflowNode,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Longest timer a node may request (ten years)
pub const MAX_TIMER_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// What entering a node asks the engine to do next
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Complete immediately and follow outgoing edges
    Advance { data: Variables },
    /// Complete immediately and enter `target` only; `None` ends the branch
    Route { target: Option<String>, data: Variables },
    /// Create a task and wait for `completeWorkflowTask`
    AwaitTask { kind: TaskKind, config: TaskConfig },
    /// Re-enter after `delay`
    AwaitTimer { delay: Duration },
    /// Call a collaborator outside the critical section, then re-enter
    AwaitExternal(ExternalCall),
}

/// Work deferred until the instance lock is released
#[derive(Debug, Clone)]
pub struct ExternalCall {
    pub instance_id: String,
    pub node_id: String,
    pub kind: ExternalKind,
    /// Variable snapshot taken when the node was entered
    pub variables: Variables,
}

#[derive(Debug, Clone)]
pub enum ExternalKind {
    Webhook(WebhookConfig),
    Script(ScriptConfig),
    Custom(CustomConfig),
}

/// Captured outcome of an external call
#[derive(Debug, Clone)]
pub struct ExternalResult {
    /// Variables to merge when the node completes
    pub data: Variables,
    pub error: Option<String>,
    /// Whether `error` should fail the instance
    pub halt_on_error: bool,
}

/// Input handed to a custom node handler
#[derive(Debug, Clone)]
pub struct CustomNodeContext {
    pub instance_id: String,
    pub node_id: String,
    pub params: Value,
    pub variables: Variables,
}

/// Application-provided behavior for `custom` nodes, registered by name
#[async_trait]
pub trait CustomNodeHandler: Send + Sync {
    async fn handle(&self, ctx: CustomNodeContext) -> Result<Value>;
}

pub struct NodeExecutor {
    http_client: Arc<dyn HttpClient>,
    script_runner: Arc<dyn ScriptRunner>,
    custom_handlers: HashMap<String, Arc<dyn CustomNodeHandler>>,
    /// Fallback when a node does not set `haltOnError`
    halt_on_error: bool,
}

impl NodeExecutor {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        script_runner: Arc<dyn ScriptRunner>,
        custom_handlers: HashMap<String, Arc<dyn CustomNodeHandler>>,
        halt_on_error: bool,
    ) -> Self {
        Self {
            http_client,
            script_runner,
            custom_handlers,
            halt_on_error,
        }
    }

    /// Decide what entering `node` means for `instance`
    pub fn dispatch(&self, node: &WorkflowNode, instance: &WorkflowInstance) -> EngineResult<NodeOutcome> {
        tracing::debug!("⚙️ Dispatching {:?} node: {}", node.node_type(), node.id);

        match &node.kind {
            NodeKind::Start | NodeKind::Parallel | NodeKind::Gateway(_) => Ok(NodeOutcome::Advance {
                data: Variables::new(),
            }),
            NodeKind::End => Ok(NodeOutcome::Route {
                target: None,
                data: Variables::new(),
            }),
            NodeKind::Task(config) => Ok(NodeOutcome::AwaitTask {
                kind: TaskKind::Task,
                config: config.clone(),
            }),
            NodeKind::Approval(config) => Ok(NodeOutcome::AwaitTask {
                kind: TaskKind::Approval,
                config: config.clone(),
            }),
            NodeKind::Condition(config) => self.route_condition(node, config, &instance.variables),
            NodeKind::Timer(config) => {
                let delay = timer_delay(node, config, &instance.variables)?;
                Ok(NodeOutcome::AwaitTimer { delay })
            }
            NodeKind::Webhook(config) => Ok(external(node, instance, ExternalKind::Webhook(config.clone()))),
            NodeKind::Script(config) => Ok(external(node, instance, ExternalKind::Script(config.clone()))),
            NodeKind::Custom(config) => {
                if self.custom_handlers.contains_key(&config.handler) {
                    Ok(external(node, instance, ExternalKind::Custom(config.clone())))
                } else {
                    tracing::warn!(
                        "⚠️ No handler registered for custom node {} (handler '{}'), auto-progressing",
                        node.id,
                        config.handler
                    );
                    Ok(NodeOutcome::Advance { data: Variables::new() })
                }
            }
        }
    }

    /// First true branch wins, then the default, otherwise the branch ends
    fn route_condition(
        &self,
        node: &WorkflowNode,
        config: &ConditionConfig,
        variables: &Variables,
    ) -> EngineResult<NodeOutcome> {
        let mut target = None;
        for branch in &config.branches {
            let matched = condition::evaluate_bool(&branch.expression, variables).map_err(|e| {
                EngineError::ExecutionError(format!(
                    "Condition '{}' on node '{}' failed: {}",
                    branch.expression, node.id, e
                ))
            })?;
            if matched {
                target = Some(branch.target.clone());
                break;
            }
        }
        let target = target.or_else(|| config.default_node_id.clone());

        tracing::debug!("🔀 Condition {} routed to {:?}", node.id, target);

        let mut data = Variables::new();
        data.insert(
            format!("{}_branch", node.id),
            Value::String(target.clone().unwrap_or_else(|| "none".to_string())),
        );
        Ok(NodeOutcome::Route { target, data })
    }

    /// Run the collaborator behind an external node and capture the result
    pub async fn invoke_external(&self, call: &ExternalCall) -> ExternalResult {
        match &call.kind {
            ExternalKind::Webhook(config) => self.invoke_webhook(call, config).await,
            ExternalKind::Script(config) => {
                let outcome = self.script_runner.run(config, &call.variables).await;
                self.capture(
                    result_key(&config.result_variable, &call.node_id),
                    config.halt_on_error,
                    outcome,
                )
            }
            ExternalKind::Custom(config) => {
                let outcome = match self.custom_handlers.get(&config.handler) {
                    Some(handler) => {
                        handler
                            .handle(CustomNodeContext {
                                instance_id: call.instance_id.clone(),
                                node_id: call.node_id.clone(),
                                params: config.params.clone(),
                                variables: call.variables.clone(),
                            })
                            .await
                    }
                    None => Err(anyhow::anyhow!("No handler registered for '{}'", config.handler)),
                };
                self.capture(
                    result_key(&config.result_variable, &call.node_id),
                    config.halt_on_error,
                    outcome,
                )
            }
        }
    }

    async fn invoke_webhook(&self, call: &ExternalCall, config: &WebhookConfig) -> ExternalResult {
        let key = result_key(&config.result_variable, &call.node_id);
        let halt_on_error = config.halt_on_error.unwrap_or(self.halt_on_error);

        let response = match self.http_client.call(config, &call.variables).await {
            Ok(response) => response,
            Err(e) => return failure(key, halt_on_error, e.to_string()),
        };

        let data = match &config.response_path {
            Some(path) => match select_path(&response.body, path) {
                Ok(selected) => selected,
                Err(e) => return failure(key, halt_on_error, e.to_string()),
            },
            None => response.body.clone(),
        };

        let error = if response.success {
            None
        } else {
            Some(format!("HTTP request returned status {}", response.status))
        };

        let mut captured = Variables::new();
        captured.insert(
            key,
            json!({
                "status": response.status,
                "success": response.success,
                "headers": response.headers,
                "data": data,
            }),
        );

        ExternalResult {
            data: captured,
            error,
            halt_on_error,
        }
    }

    fn capture(&self, key: String, halt_on_error: Option<bool>, outcome: Result<Value>) -> ExternalResult {
        let halt_on_error = halt_on_error.unwrap_or(self.halt_on_error);
        match outcome {
            Ok(value) => {
                let mut data = Variables::new();
                data.insert(key, value);
                ExternalResult {
                    data,
                    error: None,
                    halt_on_error,
                }
            }
            Err(e) => failure(key, halt_on_error, e.to_string()),
        }
    }
}

fn external(node: &WorkflowNode, instance: &WorkflowInstance, kind: ExternalKind) -> NodeOutcome {
    NodeOutcome::AwaitExternal(ExternalCall {
        instance_id: instance.id.clone(),
        node_id: node.id.clone(),
        kind,
        variables: instance.variables.clone(),
    })
}

fn result_key(result_variable: &Option<String>, node_id: &str) -> String {
    result_variable.clone().unwrap_or_else(|| node_id.to_string())
}

fn failure(key: String, halt_on_error: bool, error: String) -> ExternalResult {
    tracing::warn!("⚠️ External call for '{}' failed: {}", key, error);
    let mut data = Variables::new();
    data.insert(key, json!({ "success": false, "error": error }));
    ExternalResult {
        data,
        error: Some(error),
        halt_on_error,
    }
}

/// Fixed delay, or an expression yielding a non-negative number of seconds,
/// at most `MAX_TIMER_DELAY_SECS`
fn timer_delay(node: &WorkflowNode, config: &TimerConfig, variables: &Variables) -> EngineResult<Duration> {
    let max = Duration::from_secs(MAX_TIMER_DELAY_SECS);

    if let Some(expression) = &config.delay_expression {
        let value = condition::evaluate(expression, variables).map_err(|e| {
            EngineError::ExecutionError(format!(
                "Delay expression '{}' on node '{}' failed: {}",
                expression, node.id, e
            ))
        })?;
        return match value.as_f64().and_then(|secs| Duration::try_from_secs_f64(secs).ok()) {
            Some(delay) if delay <= max => Ok(delay),
            _ => Err(EngineError::ExecutionError(format!(
                "Delay expression '{}' on node '{}' must yield between 0 and {} seconds, got {}",
                expression, node.id, MAX_TIMER_DELAY_SECS, value
            ))),
        };
    }

    match config.delay_secs {
        Some(secs) if secs <= MAX_TIMER_DELAY_SECS => Ok(Duration::from_secs(secs)),
        Some(secs) => Err(EngineError::ExecutionError(format!(
            "Timer node '{}' delay of {} seconds exceeds {} seconds",
            node.id, secs, MAX_TIMER_DELAY_SECS
        ))),
        None => Err(EngineError::ExecutionError(format!(
            "Timer node '{}' has no delay configured",
            node.id
        ))),
    }
}

/// Apply a JSONPath to a response body; a single match is unwrapped
fn select_path(body: &Value, path: &str) -> Result<Value> {
    let matches = jsonpath_lib::select(body, path)
        .map_err(|e| anyhow::anyhow!("Invalid response path '{}': {:?}", path, e))?;
    Ok(match matches.as_slice() {
        [] => Value::Null,
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::http::HttpResponse;
    use crate::workflow::types::{ConditionBranch, InstanceMetadata, InstanceStatus};
    use chrono::Utc;

    struct CannedHttp {
        status: u16,
        body: Value,
    }

    #[async_trait]
    impl HttpClient for CannedHttp {
        async fn call(&self, _config: &WebhookConfig, _variables: &Variables) -> Result<HttpResponse> {
            Ok(HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body: self.body.clone(),
                success: (200..300).contains(&self.status),
            })
        }
    }

    struct FailingScripts;

    #[async_trait]
    impl ScriptRunner for FailingScripts {
        async fn run(&self, _config: &ScriptConfig, _variables: &Variables) -> Result<Value> {
            Err(anyhow::anyhow!("sandbox exploded"))
        }
    }

    fn executor(status: u16, body: Value) -> NodeExecutor {
        NodeExecutor::new(
            Arc::new(CannedHttp { status, body }),
            Arc::new(FailingScripts),
            HashMap::new(),
            false,
        )
    }

    fn instance_with(variables: Value) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: "i-1".into(),
            workflow_id: "wf".into(),
            workflow_version: 1,
            status: InstanceStatus::Running,
            current_node_ids: Vec::new(),
            variables: serde_json::from_value(variables).unwrap(),
            history: Vec::new(),
            metadata: InstanceMetadata::default(),
            initiator: "alice".into(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    fn condition_node(default: Option<&str>) -> WorkflowNode {
        WorkflowNode::new(
            "check",
            "Check",
            NodeKind::Condition(ConditionConfig {
                branches: vec![
                    ConditionBranch {
                        expression: "amount > 1000".into(),
                        target: "high".into(),
                    },
                    ConditionBranch {
                        expression: "amount > 100".into(),
                        target: "medium".into(),
                    },
                ],
                default_node_id: default.map(String::from),
            }),
        )
    }

    fn webhook(response_path: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            url: "https://example.test/hook".into(),
            method: "POST".into(),
            headers: HashMap::new(),
            auth: None,
            body: None,
            timeout_secs: None,
            response_path: response_path.map(String::from),
            result_variable: Some("reply".into()),
            halt_on_error: None,
        }
    }

    #[test]
    fn test_condition_first_true_branch_wins() {
        let executor = executor(200, Value::Null);
        let outcome = executor
            .dispatch(&condition_node(Some("low")), &instance_with(json!({"amount": 5000})))
            .unwrap();

        match outcome {
            NodeOutcome::Route { target, data } => {
                assert_eq!(target.as_deref(), Some("high"));
                assert_eq!(data["check_branch"], json!("high"));
            }
            other => panic!("expected route, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_falls_back_to_default_then_none() {
        let executor = executor(200, Value::Null);
        let small = instance_with(json!({"amount": 50}));

        match executor.dispatch(&condition_node(Some("low")), &small).unwrap() {
            NodeOutcome::Route { target, .. } => assert_eq!(target.as_deref(), Some("low")),
            other => panic!("expected route, got {:?}", other),
        }
        match executor.dispatch(&condition_node(None), &small).unwrap() {
            NodeOutcome::Route { target, data } => {
                assert!(target.is_none());
                assert_eq!(data["check_branch"], json!("none"));
            }
            other => panic!("expected route, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_evaluation_error_is_execution_error() {
        let executor = executor(200, Value::Null);
        let err = executor
            .dispatch(&condition_node(None), &instance_with(json!({"amount": "lots"})))
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }

    #[test]
    fn test_timer_delay_from_expression() {
        let executor = executor(200, Value::Null);
        let node = WorkflowNode::new(
            "wait",
            "Wait",
            NodeKind::Timer(TimerConfig {
                delay_secs: Some(60),
                delay_expression: Some("retries * 2".into()),
            }),
        );

        match executor.dispatch(&node, &instance_with(json!({"retries": 3}))).unwrap() {
            NodeOutcome::AwaitTimer { delay } => assert_eq!(delay, Duration::from_secs(6)),
            other => panic!("expected timer, got {:?}", other),
        }
        assert!(executor
            .dispatch(&node, &instance_with(json!({"retries": -1})))
            .is_err());
    }

    #[test]
    fn test_timer_delay_beyond_limit_is_execution_error() {
        let executor = executor(200, Value::Null);
        let node = WorkflowNode::new(
            "wait",
            "Wait",
            NodeKind::Timer(TimerConfig {
                delay_secs: None,
                delay_expression: Some("seconds".into()),
            }),
        );

        for seconds in [json!(1e20), json!(MAX_TIMER_DELAY_SECS + 1)] {
            let err = executor
                .dispatch(&node, &instance_with(json!({ "seconds": seconds })))
                .unwrap_err();
            assert_eq!(err.code(), "EXECUTION_ERROR");
        }
        assert!(executor
            .dispatch(&node, &instance_with(json!({ "seconds": MAX_TIMER_DELAY_SECS })))
            .is_ok());

        let fixed = WorkflowNode::new(
            "wait",
            "Wait",
            NodeKind::Timer(TimerConfig {
                delay_secs: Some(u64::MAX),
                delay_expression: None,
            }),
        );
        assert!(executor.dispatch(&fixed, &instance_with(json!({}))).is_err());
    }

    #[test]
    fn test_unregistered_custom_node_auto_progresses() {
        let executor = executor(200, Value::Null);
        let node = WorkflowNode::new(
            "enrich",
            "Enrich",
            NodeKind::Custom(CustomConfig {
                handler: "crm-lookup".into(),
                params: Value::Null,
                result_variable: None,
                halt_on_error: None,
            }),
        );
        assert!(matches!(
            executor.dispatch(&node, &instance_with(json!({}))).unwrap(),
            NodeOutcome::Advance { .. }
        ));
    }

    #[tokio::test]
    async fn test_webhook_response_path_selects_body() {
        let executor = executor(200, json!({"order": {"id": 42, "state": "paid"}}));
        let call = ExternalCall {
            instance_id: "i-1".into(),
            node_id: "notify".into(),
            kind: ExternalKind::Webhook(webhook(Some("$.order.state"))),
            variables: Variables::new(),
        };

        let result = executor.invoke_external(&call).await;
        assert!(result.error.is_none());
        assert_eq!(result.data["reply"]["data"], json!("paid"));
        assert_eq!(result.data["reply"]["status"], json!(200));
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_captured() {
        let executor = executor(503, json!({"message": "down"}));
        let call = ExternalCall {
            instance_id: "i-1".into(),
            node_id: "notify".into(),
            kind: ExternalKind::Webhook(webhook(None)),
            variables: Variables::new(),
        };

        let result = executor.invoke_external(&call).await;
        assert!(result.error.is_some());
        assert!(!result.halt_on_error);
        assert_eq!(result.data["reply"]["success"], json!(false));
    }

    #[tokio::test]
    async fn test_script_failure_is_captured_under_node_id() {
        let executor = executor(200, Value::Null);
        let call = ExternalCall {
            instance_id: "i-1".into(),
            node_id: "score".into(),
            kind: ExternalKind::Script(ScriptConfig {
                language: "lua".into(),
                body: "return 1".into(),
                result_variable: None,
                halt_on_error: Some(true),
            }),
            variables: Variables::new(),
        };

        let result = executor.invoke_external(&call).await;
        assert!(result.halt_on_error);
        assert_eq!(result.data["score"]["success"], json!(false));
        assert_eq!(result.data["score"]["error"], json!("sandbox exploded"));
    }
}
