/// End-to-end engine scenarios over an in-memory registry
///
/// External collaborators are replaced by canned implementations; the Lua
/// sandbox and the timer scheduler are the real ones.

use async_trait::async_trait;
use flowpilot::{
    runtime::{
        events::RecordingEventSink,
        executor::{CustomNodeContext, CustomNodeHandler},
        http::{HttpClient, HttpResponse},
    },
    workflow::types::{
        CompleteTaskRequest, HistoryAction, InstanceStatus, StartWorkflowRequest, TaskStatus, Variables,
        WebhookConfig, WorkflowInstance,
    },
    DefinitionRegistry, WorkflowEngine,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

struct Harness {
    engine: Arc<WorkflowEngine>,
    events: Arc<RecordingEventSink>,
}

async fn harness(definitions: Vec<Value>) -> Harness {
    harness_with(definitions, |builder| builder).await
}

async fn harness_with(
    definitions: Vec<Value>,
    configure: impl FnOnce(flowpilot::EngineBuilder) -> flowpilot::EngineBuilder,
) -> Harness {
    let registry = DefinitionRegistry::in_memory();
    for definition in definitions {
        registry.register(serde_json::from_value(definition).unwrap()).unwrap();
    }
    let events = Arc::new(RecordingEventSink::new());
    let builder = WorkflowEngine::builder(Arc::new(registry)).with_event_sink(events.clone());
    let engine = configure(builder).build().await.unwrap();
    Harness { engine, events }
}

fn approval_flow() -> Value {
    json!({
        "id": "approval-flow",
        "version": 1,
        "name": "Purchase approval",
        "status": "active",
        "nodes": [
            {"id": "start-node", "name": "Start", "type": "start"},
            {"id": "approval-node", "name": "Manager approval", "type": "approval", "assignees": ["manager"]},
            {"id": "end-node", "name": "End", "type": "end"}
        ],
        "edges": [
            {"sourceNodeId": "start-node", "targetNodeId": "approval-node"},
            {"sourceNodeId": "approval-node", "targetNodeId": "end-node"}
        ],
        "variables": [
            {"name": "amount", "type": "number", "required": true}
        ]
    })
}

fn routing_flow() -> Value {
    json!({
        "id": "routing",
        "version": 1,
        "name": "Value routing",
        "status": "active",
        "nodes": [
            {"id": "start", "name": "Start", "type": "start"},
            {"id": "check", "name": "Check amount", "type": "condition",
             "branches": [{"expression": "amount > 1000", "target": "high-value"}],
             "defaultNodeId": "standard"},
            {"id": "high-value", "name": "Director review", "type": "task", "assignees": ["director"]},
            {"id": "standard", "name": "Clerk review", "type": "task", "assignees": ["clerk"]}
        ],
        "edges": [
            {"sourceNodeId": "start", "targetNodeId": "check"}
        ]
    })
}

fn single_step(id: &str, node: Value) -> Value {
    json!({
        "id": id,
        "version": 1,
        "name": id,
        "status": "active",
        "nodes": [
            {"id": "start", "name": "Start", "type": "start"},
            node,
            {"id": "end", "name": "End", "type": "end"}
        ],
        "edges": [
            {"sourceNodeId": "start", "targetNodeId": "step"},
            {"sourceNodeId": "step", "targetNodeId": "end"}
        ]
    })
}

fn amount(value: i64) -> StartWorkflowRequest {
    StartWorkflowRequest::new("approval-flow").with_variable("amount", json!(value))
}

/// Poll until the instance satisfies `done` or a few seconds pass
async fn wait_for(engine: &WorkflowEngine, id: &str, done: impl Fn(&WorkflowInstance) -> bool) -> WorkflowInstance {
    for _ in 0..250 {
        let instance = engine.get_workflow_instance(id).await.unwrap();
        if done(&instance) {
            return instance;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("instance {} never reached the expected state", id);
}

fn count(instance: &WorkflowInstance, action: HistoryAction) -> usize {
    instance.history.iter().filter(|entry| entry.action == action).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approval_start_creates_one_task() {
    let h = harness(vec![approval_flow()]).await;

    let instance = h.engine.start_workflow(amount(500), "requester").await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.current_node_ids, vec!["approval-node".to_string()]);
    assert_eq!(instance.workflow_version, 1);
    assert_eq!(instance.variables["amount"], json!(500));

    let tasks = h.engine.list_workflow_tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].node_id, "approval-node");
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(h.engine.get_tasks_by_assignee("manager").await.len(), 1);
    assert!(h.engine.get_tasks_by_assignee("someone-else").await.is_empty());

    assert_eq!(h.events.names(), vec!["workflow:started", "task:created"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completing_the_approval_completes_the_instance() {
    let h = harness(vec![approval_flow()]).await;
    let started = h.engine.start_workflow(amount(500), "requester").await.unwrap();
    let task = h.engine.get_tasks_by_assignee("manager").await.remove(0);

    let mut data = Variables::new();
    data.insert("approved".into(), json!(true));
    let completed_task = h
        .engine
        .complete_workflow_task(
            &task.id,
            CompleteTaskRequest::complete().with_data(data).with_comment("looks fine"),
            "manager",
        )
        .await
        .unwrap();
    assert_eq!(completed_task.status, TaskStatus::Completed);
    assert_eq!(completed_task.completed_by.as_deref(), Some("manager"));
    assert_eq!(completed_task.comments.len(), 1);

    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.completed_at.is_some());
    assert!(instance.current_node_ids.is_empty());
    assert_eq!(instance.variables["approved"], json!(true));

    let end_entries: Vec<HistoryAction> = instance
        .history
        .iter()
        .filter(|entry| entry.node_id == "end-node")
        .map(|entry| entry.action)
        .collect();
    assert_eq!(end_entries, vec![HistoryAction::Entered, HistoryAction::Completed]);

    assert_eq!(
        h.events.names(),
        vec!["workflow:started", "task:created", "task:completed", "workflow:completed"]
    );

    // The end node is gone from the active set; completing it again is an error
    let err = h
        .engine
        .progress_workflow(&started.id, "end-node", Variables::new(), "manager")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejecting_the_approval_fails_the_instance() {
    let h = harness(vec![approval_flow()]).await;
    let started = h.engine.start_workflow(amount(500), "requester").await.unwrap();
    let task = h.engine.list_workflow_tasks().await.remove(0);

    let rejected = h
        .engine
        .complete_workflow_task(&task.id, CompleteTaskRequest::reject().with_comment("over budget"), "manager")
        .await
        .unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);

    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.current_node_ids.is_empty());
    assert_eq!(count(&instance, HistoryAction::Failed), 1);

    let tail: Vec<HistoryAction> = instance.history.iter().rev().take(2).map(|entry| entry.action).collect();
    assert_eq!(tail, vec![HistoryAction::Failed, HistoryAction::Rejected]);

    assert_eq!(
        h.events.names(),
        vec!["workflow:started", "task:created", "task:rejected", "workflow:failed"]
    );

    let err = h
        .engine
        .complete_workflow_task(&task.id, CompleteTaskRequest::complete(), "manager")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TASK_STATUS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejection_with_reject_target_routes_back() {
    let definition = json!({
        "id": "rework",
        "version": 1,
        "name": "Rework loop",
        "status": "active",
        "nodes": [
            {"id": "start", "name": "Start", "type": "start"},
            {"id": "draft", "name": "Draft", "type": "task", "assignees": ["author"]},
            {"id": "review", "name": "Review", "type": "approval", "assignees": ["editor"], "rejectTarget": "draft"},
            {"id": "end", "name": "End", "type": "end"}
        ],
        "edges": [
            {"sourceNodeId": "start", "targetNodeId": "draft"},
            {"sourceNodeId": "draft", "targetNodeId": "review"},
            {"sourceNodeId": "review", "targetNodeId": "end"}
        ]
    });
    let h = harness(vec![definition]).await;
    let started = h.engine.start_workflow(StartWorkflowRequest::new("rework"), "author").await.unwrap();

    let draft = h.engine.get_tasks_by_assignee("author").await.remove(0);
    h.engine
        .complete_workflow_task(&draft.id, CompleteTaskRequest::complete(), "author")
        .await
        .unwrap();
    let review = h.engine.get_tasks_by_assignee("editor").await.remove(0);
    h.engine
        .complete_workflow_task(&review.id, CompleteTaskRequest::reject(), "editor")
        .await
        .unwrap();

    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.current_node_ids, vec!["draft".to_string()]);
    assert_eq!(count(&instance, HistoryAction::Rejected), 1);
    assert_eq!(count(&instance, HistoryAction::Failed), 0);
    assert_eq!(h.engine.get_tasks_by_assignee("author").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn condition_routes_to_first_match_or_default() {
    let h = harness(vec![routing_flow()]).await;

    let high = h
        .engine
        .start_workflow(StartWorkflowRequest::new("routing").with_variable("amount", json!(1500)), "alice")
        .await
        .unwrap();
    assert_eq!(high.current_node_ids, vec!["high-value".to_string()]);
    assert_eq!(high.variables["check_branch"], json!("high-value"));

    let standard = h
        .engine
        .start_workflow(StartWorkflowRequest::new("routing").with_variable("amount", json!(500)), "alice")
        .await
        .unwrap();
    assert_eq!(standard.current_node_ids, vec!["standard".to_string()]);
    assert_eq!(
        standard.history.iter().filter(|entry| entry.node_id == "standard").count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progressing_an_already_completed_node_fails() {
    let definition = single_step("manual", json!({"id": "step", "name": "Step", "type": "task", "assignees": ["ops"]}));
    let h = harness(vec![definition]).await;
    let started = h.engine.start_workflow(StartWorkflowRequest::new("manual"), "ops").await.unwrap();

    let progressed = h
        .engine
        .progress_workflow(&started.id, "step", Variables::new(), "ops")
        .await
        .unwrap();
    assert_eq!(progressed.status, InstanceStatus::Completed);

    let err = h
        .engine
        .progress_workflow(&started.id, "step", Variables::new(), "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");

    // Progressing closed the open task with the node
    let task = h.engine.list_workflow_tasks().await.remove(0);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_validates_declared_variables() {
    let h = harness(vec![approval_flow()]).await;

    let err = h
        .engine
        .start_workflow(StartWorkflowRequest::new("approval-flow"), "requester")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let err = h
        .engine
        .start_workflow(
            StartWorkflowRequest::new("approval-flow").with_variable("amount", json!("a lot")),
            "requester",
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let err = h
        .engine
        .start_workflow(StartWorkflowRequest::new("unknown"), "requester")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKFLOW_NOT_FOUND");

    assert!(h.engine.list_workflow_instances().await.is_empty());
    assert!(h.engine.list_workflow_tasks().await.is_empty());
    assert!(h.events.names().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_node_fires_and_progresses() {
    let definition = single_step("waiting", json!({"id": "step", "name": "Wait", "type": "timer", "delaySecs": 1}));
    let h = harness(vec![definition]).await;
    let started = h.engine.start_workflow(StartWorkflowRequest::new("waiting"), "ops").await.unwrap();
    assert_eq!(started.current_node_ids, vec!["step".to_string()]);

    let instance = wait_for(&h.engine, &started.id, |instance| !instance.is_running()).await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    let fired = instance
        .history
        .iter()
        .find(|entry| entry.node_id == "step" && entry.action == HistoryAction::Completed)
        .unwrap();
    assert_eq!(fired.actor, "timer");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canceled_instance_timer_never_fires() {
    let definition = single_step("waiting", json!({"id": "step", "name": "Wait", "type": "timer", "delaySecs": 2}));
    let h = harness(vec![definition]).await;
    let started = h.engine.start_workflow(StartWorkflowRequest::new("waiting"), "ops").await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let canceled = h
        .engine
        .cancel_workflow(&started.id, "ops", Some("no longer needed".into()))
        .await
        .unwrap();
    assert_eq!(canceled.status, InstanceStatus::Canceled);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Canceled);
    assert_eq!(instance.history.len(), canceled.history.len());
    assert_eq!(instance.current_node_ids, vec!["step".to_string()]);
    assert_eq!(h.events.names(), vec!["workflow:started", "workflow:canceled"]);
}

struct CannedHttp {
    status: u16,
    body: Value,
    calls: AtomicUsize,
}

#[async_trait]
impl HttpClient for CannedHttp {
    async fn call(&self, _config: &WebhookConfig, _variables: &Variables) -> anyhow::Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status: self.status,
            headers: HashMap::new(),
            body: self.body.clone(),
            success: (200..300).contains(&self.status),
        })
    }
}

fn webhook_step(halt_on_error: bool) -> Value {
    single_step(
        "notify",
        json!({
            "id": "step",
            "name": "Notify",
            "type": "webhook",
            "url": "https://hooks.example.com/{{orderId}}",
            "method": "POST",
            "responsePath": "$.ticket",
            "resultVariable": "ticket",
            "haltOnError": halt_on_error
        }),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_result_is_captured_and_the_branch_continues() {
    let http = Arc::new(CannedHttp {
        status: 200,
        body: json!({"ticket": "T-42"}),
        calls: AtomicUsize::new(0),
    });
    let client = http.clone();
    let h = harness_with(vec![webhook_step(true)], move |builder| builder.with_http_client(client)).await;

    let started = h
        .engine
        .start_workflow(StartWorkflowRequest::new("notify").with_variable("orderId", json!("o-1")), "shop")
        .await
        .unwrap();
    let instance = wait_for(&h.engine, &started.id, |instance| !instance.is_running()).await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables["ticket"]["status"], json!(200));
    assert_eq!(instance.variables["ticket"]["data"], json!("T-42"));
    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_failure_halts_or_continues_per_policy() {
    let failing = || {
        Arc::new(CannedHttp {
            status: 503,
            body: json!({"error": "unavailable"}),
            calls: AtomicUsize::new(0),
        })
    };

    let client = failing();
    let halting = harness_with(vec![webhook_step(true)], move |builder| builder.with_http_client(client)).await;
    let started = halting.engine.start_workflow(StartWorkflowRequest::new("notify"), "shop").await.unwrap();
    let instance = wait_for(&halting.engine, &started.id, |instance| !instance.is_running()).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.as_ref().unwrap().contains("503"));
    assert_eq!(count(&instance, HistoryAction::Failed), 1);

    let client = failing();
    let lenient = harness_with(vec![webhook_step(false)], move |builder| builder.with_http_client(client)).await;
    let started = lenient.engine.start_workflow(StartWorkflowRequest::new("notify"), "shop").await.unwrap();
    let instance = wait_for(&lenient.engine, &started.id, |instance| !instance.is_running()).await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables["ticket"]["success"], json!(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_node_result_feeds_edge_guards() {
    let definition = json!({
        "id": "scored",
        "version": 1,
        "name": "Scored intake",
        "status": "active",
        "nodes": [
            {"id": "start", "name": "Start", "type": "start"},
            {"id": "score", "name": "Score", "type": "script", "language": "lua",
             "body": "return { value = vars.amount * 2 }", "resultVariable": "score"},
            {"id": "review", "name": "Review", "type": "task", "assignees": ["analyst"]},
            {"id": "end", "name": "End", "type": "end"}
        ],
        "edges": [
            {"sourceNodeId": "start", "targetNodeId": "score"},
            {"sourceNodeId": "score", "targetNodeId": "review", "condition": "score.value > 100"},
            {"sourceNodeId": "score", "targetNodeId": "end", "condition": "score.value <= 100"}
        ]
    });
    let h = harness(vec![definition]).await;

    let big = h
        .engine
        .start_workflow(StartWorkflowRequest::new("scored").with_variable("amount", json!(80)), "intake")
        .await
        .unwrap();
    let big = wait_for(&h.engine, &big.id, |instance| instance.is_active("review")).await;
    assert_eq!(big.variables["score"]["value"], json!(160));

    let small = h
        .engine
        .start_workflow(StartWorkflowRequest::new("scored").with_variable("amount", json!(10)), "intake")
        .await
        .unwrap();
    let small = wait_for(&h.engine, &small.id, |instance| !instance.is_running()).await;
    assert_eq!(small.status, InstanceStatus::Completed);
}

struct Enrich;

#[async_trait]
impl CustomNodeHandler for Enrich {
    async fn handle(&self, ctx: CustomNodeContext) -> anyhow::Result<Value> {
        let region = ctx.params["region"].as_str().unwrap_or("unknown").to_string();
        Ok(json!({"region": region, "node": ctx.node_id}))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_handler_runs_by_name() {
    let definition = single_step(
        "enriched",
        json!({"id": "step", "name": "Enrich", "type": "custom", "handler": "enrich", "params": {"region": "eu"}}),
    );
    let h = harness_with(vec![definition], |builder| builder.with_custom_handler("enrich", Arc::new(Enrich))).await;

    let started = h.engine.start_workflow(StartWorkflowRequest::new("enriched"), "ops").await.unwrap();
    let instance = wait_for(&h.engine, &started.id, |instance| !instance.is_running()).await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables["step"], json!({"region": "eu", "node": "step"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_of_one_task_apply_once() {
    let h = harness(vec![approval_flow()]).await;
    let started = h.engine.start_workflow(amount(500), "requester").await.unwrap();
    let task = h.engine.list_workflow_tasks().await.remove(0);

    let mut handles = Vec::new();
    for n in 0..8 {
        let engine = Arc::clone(&h.engine);
        let task_id = task.id.clone();
        handles.push(tokio::spawn(async move {
            engine
                .complete_workflow_task(&task_id, CompleteTaskRequest::complete(), &format!("manager-{}", n))
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 1);

    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance
            .history
            .iter()
            .filter(|entry| entry.node_id == "approval-node" && entry.action == HistoryAction::Completed)
            .count(),
        1
    );
    assert_eq!(
        h.events.names().iter().filter(|name| **name == "workflow:completed").count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diamond_without_gateway_enters_the_merge_node_once() {
    let definition = json!({
        "id": "diamond",
        "version": 1,
        "name": "Diamond",
        "status": "active",
        "nodes": [
            {"id": "start", "name": "Start", "type": "start"},
            {"id": "split", "name": "Split", "type": "parallel"},
            {"id": "left", "name": "Left", "type": "parallel"},
            {"id": "right", "name": "Right", "type": "parallel"},
            {"id": "review", "name": "Review", "type": "task", "assignees": ["clerk"]},
            {"id": "end", "name": "End", "type": "end"}
        ],
        "edges": [
            {"sourceNodeId": "start", "targetNodeId": "split"},
            {"sourceNodeId": "split", "targetNodeId": "left"},
            {"sourceNodeId": "split", "targetNodeId": "right"},
            {"sourceNodeId": "left", "targetNodeId": "review"},
            {"sourceNodeId": "right", "targetNodeId": "review"},
            {"sourceNodeId": "review", "targetNodeId": "end"}
        ]
    });
    let h = harness(vec![definition]).await;

    let started = h.engine.start_workflow(StartWorkflowRequest::new("diamond"), "ops").await.unwrap();
    assert_eq!(started.current_node_ids, vec!["review".to_string()]);
    assert_eq!(h.engine.list_workflow_tasks().await.len(), 1);

    let skipped: Vec<&Value> = started
        .history
        .iter()
        .filter(|entry| entry.node_id == "review" && entry.action == HistoryAction::Skipped)
        .filter_map(|entry| entry.data.as_ref())
        .collect();
    assert_eq!(skipped, vec![&json!({"reason": "already active"})]);

    let task = h.engine.get_tasks_by_assignee("clerk").await.remove(0);
    h.engine
        .complete_workflow_task(&task.id, CompleteTaskRequest::complete(), "clerk")
        .await
        .unwrap();
    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance
            .history
            .iter()
            .filter(|entry| entry.node_id == "end" && entry.action == HistoryAction::Entered)
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_of_parallel_branches_both_apply() {
    let definition = json!({
        "id": "two-reviews",
        "version": 1,
        "name": "Two reviews",
        "status": "active",
        "nodes": [
            {"id": "start", "name": "Start", "type": "start"},
            {"id": "split", "name": "Split", "type": "parallel"},
            {"id": "legal", "name": "Legal review", "type": "task", "assignees": ["legal"]},
            {"id": "finance", "name": "Finance review", "type": "task", "assignees": ["finance"]},
            {"id": "join", "name": "Join", "type": "gateway", "joinCount": 2},
            {"id": "end", "name": "End", "type": "end"}
        ],
        "edges": [
            {"sourceNodeId": "start", "targetNodeId": "split"},
            {"sourceNodeId": "split", "targetNodeId": "legal"},
            {"sourceNodeId": "split", "targetNodeId": "finance"},
            {"sourceNodeId": "legal", "targetNodeId": "join"},
            {"sourceNodeId": "finance", "targetNodeId": "join"},
            {"sourceNodeId": "join", "targetNodeId": "end"}
        ]
    });
    let h = harness(vec![definition]).await;
    let started = h.engine.start_workflow(StartWorkflowRequest::new("two-reviews"), "ops").await.unwrap();
    assert_eq!(started.current_node_ids.len(), 2);

    let mut handles = Vec::new();
    for (assignee, key) in [("legal", "legalOk"), ("finance", "financeOk")] {
        let task = h.engine.get_tasks_by_assignee(assignee).await.remove(0);
        let engine = Arc::clone(&h.engine);
        handles.push(tokio::spawn(async move {
            let mut data = Variables::new();
            data.insert(key.into(), json!(true));
            engine
                .complete_workflow_task(&task.id, CompleteTaskRequest::complete().with_data(data), assignee)
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    let instance = h.engine.get_workflow_instance(&started.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.current_node_ids.is_empty());
    assert_eq!(instance.variables["legalOk"], json!(true));
    assert_eq!(instance.variables["financeOk"], json!(true));
    for node_id in ["legal", "finance", "join", "end"] {
        assert_eq!(
            instance
                .history
                .iter()
                .filter(|entry| entry.node_id == node_id && entry.action == HistoryAction::Completed)
                .count(),
            1,
            "{} completed more than once",
            node_id
        );
    }
    assert_eq!(
        h.events.names().iter().filter(|name| **name == "workflow:completed").count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_range_timer_delay_fails_the_instance() {
    let definition = single_step(
        "far-future",
        json!({"id": "step", "name": "Wait", "type": "timer", "delayExpression": "seconds"}),
    );
    let h = harness(vec![definition]).await;

    let instance = h
        .engine
        .start_workflow(
            StartWorkflowRequest::new("far-future").with_variable("seconds", json!(1e20)),
            "ops",
        )
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.current_node_ids.is_empty());
    assert!(instance.error.as_deref().unwrap_or_default().contains("step"));
}
