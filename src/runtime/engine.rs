/// Workflow engine: instance lifecycle and the transition algorithm
///
/// Every instance lives behind its own `tokio::sync::Mutex`; the instance map
/// is only locked long enough to look a slot up or insert one. A transition
/// is planned against the current state first (active node, edge guards,
/// target existence) and only committed once planning succeeded, so a caller
/// error never leaves an instance half-updated.
///
/// Nodes that complete on their own (start, parallel, gateway, condition,
/// end) are drained from a queue inside the same critical section. Webhook,
/// script and custom nodes are collected as `ExternalCall`s and spawned only
/// after the lock is released; their results re-enter as a new serialized
/// call that re-checks that the instance is still running.

use crate::{
    config::EngineSettings,
    error::{EngineError, EngineResult},
    runtime::{
        events::{EventSink, NullEventSink, WorkflowEvent},
        executor::{CustomNodeHandler, ExternalCall, NodeExecutor, NodeOutcome},
        http::{HttpClient, ReqwestHttpClient},
        scheduler::{TimerCallback, TimerKey, TimerScheduler, TimerTask},
        script::{LuaScriptRunner, ScriptRunner},
        tasks::{push_comment, TaskManager},
    },
    workflow::{
        registry::DefinitionRepository,
        types::{
            CompleteTaskRequest, HistoryAction, InstanceMetadata, InstanceStatus, NodeKind,
            StartWorkflowRequest, TaskAction, TaskStatus, Variables, WorkflowDefinition,
            WorkflowHistoryEntry, WorkflowInstance, WorkflowTask,
        },
    },
};
use chrono::Utc;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{Mutex, RwLock};

/// Actor recorded for steps the engine takes on its own
pub const SYSTEM_ACTOR: &str = "system";
/// Actor recorded when a timer node fires
pub const TIMER_ACTOR: &str = "timer";

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Mutable state guarded by one instance lock
struct InstanceSlot {
    instance: WorkflowInstance,
    /// The exact version the instance was started from
    definition: Arc<WorkflowDefinition>,
    /// Gateway id → branch arrivals counted towards its join
    join_arrivals: HashMap<String, usize>,
    /// Completed steps, for the runaway guard
    steps: usize,
}

#[derive(Debug)]
enum Route {
    /// Follow every outgoing edge whose guard holds
    Edges,
    /// Enter exactly this node
    Target(String),
    /// The branch ends here
    End,
}

/// A request to complete an active node
#[derive(Debug)]
struct Completion {
    node_id: String,
    data: Variables,
    actor: String,
    route: Route,
    action: HistoryAction,
}

impl Completion {
    fn auto(node_id: &str, data: Variables, route: Route) -> Self {
        Self {
            node_id: node_id.to_string(),
            data,
            actor: SYSTEM_ACTOR.to_string(),
            route,
            action: HistoryAction::Completed,
        }
    }
}

/// Result of planning a completion
struct Transition {
    variables: Variables,
    targets: Vec<String>,
}

/// Work accumulated during one critical section
#[derive(Default)]
struct Pass {
    queue: VecDeque<Completion>,
    externals: Vec<ExternalCall>,
}

pub struct WorkflowEngine {
    definitions: Arc<dyn DefinitionRepository>,
    instances: RwLock<HashMap<String, Arc<Mutex<InstanceSlot>>>>,
    tasks: TaskManager,
    executor: NodeExecutor,
    timers: TimerScheduler,
    events: Arc<dyn EventSink>,
    settings: EngineSettings,
    this: Weak<WorkflowEngine>,
}

/// Assembles an engine from its collaborators
pub struct EngineBuilder {
    definitions: Arc<dyn DefinitionRepository>,
    http_client: Option<Arc<dyn HttpClient>>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
    event_sink: Option<Arc<dyn EventSink>>,
    custom_handlers: HashMap<String, Arc<dyn CustomNodeHandler>>,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.script_runner = Some(runner);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Register the handler invoked by custom nodes naming `name`
    pub fn with_custom_handler(mut self, name: impl Into<String>, handler: Arc<dyn CustomNodeHandler>) -> Self {
        self.custom_handlers.insert(name.into(), handler);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Start the timer scheduler and assemble the engine
    pub async fn build(self) -> anyhow::Result<Arc<WorkflowEngine>> {
        let settings = self.settings;

        let timers = TimerScheduler::new().await?;
        timers.start().await?;

        let http_client = self.http_client.unwrap_or_else(|| {
            Arc::new(ReqwestHttpClient::new(Duration::from_secs(settings.webhook_timeout_secs)))
        });
        let script_runner = self.script_runner.unwrap_or_else(|| {
            Arc::new(LuaScriptRunner::new(
                Duration::from_secs(settings.script_timeout_secs),
                settings.script_memory_limit,
            ))
        });
        let events = self.event_sink.unwrap_or_else(|| Arc::new(NullEventSink));
        let executor = NodeExecutor::new(
            http_client,
            script_runner,
            self.custom_handlers,
            settings.halt_on_error,
        );
        let definitions = self.definitions;

        tracing::info!(
            "⚙️ Workflow engine ready (max {} steps per instance, halt_on_error={})",
            settings.max_steps_per_instance,
            settings.halt_on_error
        );

        Ok(Arc::new_cyclic(|this| WorkflowEngine {
            definitions,
            instances: RwLock::new(HashMap::new()),
            tasks: TaskManager::new(),
            executor,
            timers,
            events,
            settings,
            this: this.clone(),
        }))
    }
}

impl WorkflowEngine {
    pub fn builder(definitions: Arc<dyn DefinitionRepository>) -> EngineBuilder {
        EngineBuilder {
            definitions,
            http_client: None,
            script_runner: None,
            event_sink: None,
            custom_handlers: HashMap::new(),
            settings: EngineSettings::default(),
        }
    }

    /// Stop firing timers
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.timers.shutdown().await
    }

    // ── Exposed operations ───────────────────────────────────────────

    /// Create an instance of the highest active version of a workflow and
    /// run it until every branch waits on a task, timer or external call
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
        initiator: &str,
    ) -> EngineResult<WorkflowInstance> {
        let definition = self
            .definitions
            .get(&request.workflow_id)
            .filter(|definition| definition.is_active())
            .ok_or_else(|| EngineError::WorkflowNotFound(request.workflow_id.clone()))?;

        let mut variables = request.variables.unwrap_or_default();
        validate_variables(&definition, &variables)?;

        let start_id = definition
            .start_node()
            .map(|node| node.id.clone())
            .ok_or_else(|| {
                EngineError::InvalidWorkflowDefinition(format!(
                    "Workflow '{}' v{} has no start node",
                    definition.id, definition.version
                ))
            })?;

        for declared in &definition.variables {
            if let Some(default) = &declared.default_value {
                variables
                    .entry(declared.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            workflow_version: definition.version,
            status: InstanceStatus::Running,
            current_node_ids: Vec::new(),
            variables,
            history: Vec::new(),
            metadata: InstanceMetadata {
                priority: request.priority.unwrap_or_default(),
                due_date: request.due_date,
                business_key: request.business_key,
            },
            initiator: initiator.to_string(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };
        let instance_id = instance.id.clone();

        let handle = Arc::new(Mutex::new(InstanceSlot {
            instance,
            definition: Arc::clone(&definition),
            join_arrivals: HashMap::new(),
            steps: 0,
        }));
        let mut slot = handle.lock().await;
        self.instances
            .write()
            .await
            .insert(instance_id.clone(), Arc::clone(&handle));

        tracing::info!(
            "🚀 Starting workflow {} v{} as instance {} (initiator: {})",
            definition.id,
            definition.version,
            instance_id,
            initiator
        );

        let mut pass = Pass::default();
        let entered = self.enter_node(&mut slot, &start_id, initiator, &mut pass).await;
        self.events.publish(WorkflowEvent::WorkflowStarted {
            instance_id: instance_id.clone(),
            workflow_id: definition.id.clone(),
            initiator: initiator.to_string(),
            at: now,
        });

        let externals = match entered {
            Ok(()) => self.drain(&mut slot, pass).await,
            Err(e) => {
                self.fail_instance(&mut slot, &start_id, SYSTEM_ACTOR, &e.to_string())
                    .await;
                Vec::new()
            }
        };

        let snapshot = slot.instance.clone();
        drop(slot);
        self.spawn_externals(externals);
        Ok(snapshot)
    }

    /// Complete an active node on behalf of `actor` and follow its edges
    pub async fn progress_workflow(
        &self,
        instance_id: &str,
        node_id: &str,
        data: Variables,
        actor: &str,
    ) -> EngineResult<WorkflowInstance> {
        let handle = self.slot(instance_id).await?;
        let mut slot = handle.lock().await;

        if !slot.instance.is_active(node_id) {
            return Err(not_active(instance_id, node_id));
        }
        ensure_running(&slot.instance)?;

        let completion = Completion {
            node_id: node_id.to_string(),
            data,
            actor: actor.to_string(),
            route: Route::Edges,
            action: HistoryAction::Completed,
        };
        let transition = plan(&slot, &completion)?;

        // A node completed directly takes its open task with it
        for task in self.tasks.for_instance(instance_id).await {
            if task.node_id != node_id || !task.status.is_open() {
                continue;
            }
            let closed = self
                .tasks
                .update(&task.id, |task| {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.completed_by = Some(actor.to_string());
                })
                .await;
            if let Some(task) = closed {
                self.events.publish(WorkflowEvent::TaskCompleted {
                    task,
                    actor: actor.to_string(),
                });
            }
        }

        let externals = self.proceed(&mut slot, completion, transition).await;
        let snapshot = slot.instance.clone();
        drop(slot);
        self.spawn_externals(externals);
        Ok(snapshot)
    }

    /// Complete or reject a pending task
    pub async fn complete_workflow_task(
        &self,
        task_id: &str,
        request: CompleteTaskRequest,
        actor: &str,
    ) -> EngineResult<WorkflowTask> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let handle = self.slot(&task.instance_id).await?;
        let mut slot = handle.lock().await;

        // Re-read under the instance lock; a concurrent call may have won
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if !task.status.is_open() {
            return Err(EngineError::InvalidTaskStatus {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        ensure_running(&slot.instance)?;

        let definition = Arc::clone(&slot.definition);
        let node = definition.node(&task.node_id).ok_or_else(|| {
            EngineError::ExecutionError(format!("Task node '{}' not found in definition", task.node_id))
        })?;
        let reject_target = match &node.kind {
            NodeKind::Task(config) | NodeKind::Approval(config) => config.reject_target.clone(),
            _ => None,
        };

        let data = request.data.unwrap_or_default();
        let submitted = (!data.is_empty()).then(|| Value::Object(data.clone().into_iter().collect()));

        let (status, route, action) = match request.action {
            TaskAction::Complete => (TaskStatus::Completed, Some(Route::Edges), HistoryAction::Completed),
            TaskAction::Reject => (
                TaskStatus::Rejected,
                reject_target.map(Route::Target),
                HistoryAction::Rejected,
            ),
        };

        // Everything fallible happens before the task or instance changes
        let planned = match route {
            Some(route) => {
                let completion = Completion {
                    node_id: task.node_id.clone(),
                    data,
                    actor: actor.to_string(),
                    route,
                    action,
                };
                let transition = plan(&slot, &completion)?;
                Some((completion, transition))
            }
            None => {
                if !slot.instance.is_active(&task.node_id) {
                    return Err(not_active(&task.instance_id, &task.node_id));
                }
                None
            }
        };

        let comment = request.comment;
        let updated = self
            .tasks
            .update(task_id, |task| {
                task.status = status;
                task.completed_at = Some(Utc::now());
                task.completed_by = Some(actor.to_string());
                task.result = submitted.clone();
                if let Some(text) = &comment {
                    push_comment(task, actor, text);
                }
            })
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        tracing::info!("📝 Task {} {} by {}", task_id, updated.status, actor);
        self.events.publish(match status {
            TaskStatus::Rejected => WorkflowEvent::TaskRejected {
                task: updated.clone(),
                actor: actor.to_string(),
            },
            _ => WorkflowEvent::TaskCompleted {
                task: updated.clone(),
                actor: actor.to_string(),
            },
        });

        let externals = match planned {
            Some((completion, transition)) => self.proceed(&mut slot, completion, transition).await,
            None => {
                let mut entry = WorkflowHistoryEntry::new(node, HistoryAction::Rejected, actor);
                if let Some(data) = submitted {
                    entry = entry.with_data(data);
                }
                slot.instance.record(entry);
                let reason = format!("Task '{}' at node '{}' was rejected by {}", task_id, node.id, actor);
                self.fail_instance(&mut slot, &node.id, actor, &reason).await;
                Vec::new()
            }
        };

        drop(slot);
        self.spawn_externals(externals);
        Ok(updated)
    }

    /// Move a pending task to in_progress for `actor`
    pub async fn claim_task(&self, task_id: &str, actor: &str) -> EngineResult<WorkflowTask> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let handle = self.slot(&task.instance_id).await?;
        let slot = handle.lock().await;
        ensure_running(&slot.instance)?;

        let claimed = self
            .tasks
            .update(task_id, |task| {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::InProgress;
                    task.claimed_by = Some(actor.to_string());
                }
            })
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        if claimed.claimed_by.as_deref() != Some(actor) || claimed.status != TaskStatus::InProgress {
            return Err(EngineError::InvalidTaskStatus {
                task_id: task_id.to_string(),
                status: claimed.status,
            });
        }

        tracing::info!("🙋 Task {} claimed by {}", task_id, actor);
        Ok(claimed)
    }

    pub async fn cancel_workflow(
        &self,
        instance_id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> EngineResult<WorkflowInstance> {
        self.terminate(instance_id, actor, reason, InstanceStatus::Canceled)
            .await
    }

    pub async fn suspend_workflow(
        &self,
        instance_id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> EngineResult<WorkflowInstance> {
        self.terminate(instance_id, actor, reason, InstanceStatus::Suspended)
            .await
    }

    pub async fn get_workflow_instance(&self, instance_id: &str) -> EngineResult<WorkflowInstance> {
        let handle = self.slot(instance_id).await?;
        let slot = handle.lock().await;
        Ok(slot.instance.clone())
    }

    /// Snapshots of every instance, oldest first
    pub async fn list_workflow_instances(&self) -> Vec<WorkflowInstance> {
        let handles: Vec<Arc<Mutex<InstanceSlot>>> =
            self.instances.read().await.values().cloned().collect();

        let mut instances = Vec::with_capacity(handles.len());
        for handle in handles {
            instances.push(handle.lock().await.instance.clone());
        }
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        instances
    }

    pub async fn get_workflow_task(&self, task_id: &str) -> EngineResult<WorkflowTask> {
        self.tasks
            .get(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list_workflow_tasks(&self) -> Vec<WorkflowTask> {
        self.tasks.list().await
    }

    /// Open tasks assigned to `principal`
    pub async fn get_tasks_by_assignee(&self, principal: &str) -> Vec<WorkflowTask> {
        self.tasks.by_assignee(principal).await
    }

    pub fn list_workflow_definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.definitions.list()
    }

    // ── Transition algorithm ─────────────────────────────────────────

    async fn slot(&self, instance_id: &str) -> EngineResult<Arc<Mutex<InstanceSlot>>> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    /// Plan an automatic re-entry; a planning error fails the instance
    async fn resume(&self, slot: &mut InstanceSlot, completion: Completion) -> Vec<ExternalCall> {
        match plan(slot, &completion) {
            Ok(transition) => self.proceed(slot, completion, transition).await,
            Err(e) => {
                self.fail_instance(slot, &completion.node_id, SYSTEM_ACTOR, &e.to_string())
                    .await;
                Vec::new()
            }
        }
    }

    /// Commit a planned completion and drain the automatic steps it triggers
    async fn proceed(
        &self,
        slot: &mut InstanceSlot,
        completion: Completion,
        transition: Transition,
    ) -> Vec<ExternalCall> {
        let mut pass = Pass::default();
        self.apply(slot, completion, transition, &mut pass).await;
        self.drain(slot, pass).await
    }

    async fn drain(&self, slot: &mut InstanceSlot, mut pass: Pass) -> Vec<ExternalCall> {
        while let Some(completion) = pass.queue.pop_front() {
            if !slot.instance.is_running() {
                break;
            }
            match plan(slot, &completion) {
                Ok(transition) => self.apply(slot, completion, transition, &mut pass).await,
                Err(e) => {
                    self.fail_instance(slot, &completion.node_id, SYSTEM_ACTOR, &e.to_string())
                        .await
                }
            }
        }

        if slot.instance.is_running() {
            pass.externals
        } else {
            Vec::new()
        }
    }

    async fn apply(&self, slot: &mut InstanceSlot, completion: Completion, transition: Transition, pass: &mut Pass) {
        slot.steps += 1;
        if slot.steps > self.settings.max_steps_per_instance {
            let reason = format!(
                "Step limit of {} exceeded; the graph is probably looping",
                self.settings.max_steps_per_instance
            );
            self.fail_instance(slot, &completion.node_id, SYSTEM_ACTOR, &reason)
                .await;
            return;
        }
        self.commit(slot, completion, transition, pass).await;
    }

    /// Record the completion, merge its data and enter the planned targets
    async fn commit(&self, slot: &mut InstanceSlot, completion: Completion, transition: Transition, pass: &mut Pass) {
        let definition = Arc::clone(&slot.definition);
        let Some(node) = definition.node(&completion.node_id) else {
            return;
        };

        let mut entry = WorkflowHistoryEntry::new(node, completion.action, &completion.actor);
        if !completion.data.is_empty() {
            entry = entry.with_data(Value::Object(completion.data.into_iter().collect()));
        }
        slot.instance.record(entry);
        slot.instance.variables = transition.variables;
        slot.instance.deactivate(&node.id);

        tracing::debug!(
            "✅ Node {} completed in instance {} → {:?}",
            node.id,
            slot.instance.id,
            transition.targets
        );

        for target in &transition.targets {
            if let Err(e) = self.enter_node(slot, target, &completion.actor, pass).await {
                self.fail_instance(slot, target, SYSTEM_ACTOR, &e.to_string())
                    .await;
                return;
            }
        }

        if slot.instance.is_running() && slot.instance.current_node_ids.is_empty() {
            if !matches!(node.kind, NodeKind::End) {
                tracing::warn!(
                    "⚠️ Instance {} has no active node left after '{}'; completing without an end node",
                    slot.instance.id,
                    node.id
                );
            }
            self.complete_instance(slot).await;
        }
    }

    /// Enter a node and act on what its handler asks for
    async fn enter_node(
        &self,
        slot: &mut InstanceSlot,
        node_id: &str,
        actor: &str,
        pass: &mut Pass,
    ) -> EngineResult<()> {
        let definition = Arc::clone(&slot.definition);
        let node = definition
            .node(node_id)
            .ok_or_else(|| EngineError::ExecutionError(format!("Edge target '{}' does not exist", node_id)))?;

        if let NodeKind::Gateway(config) = &node.kind {
            if config.join_count > 1 {
                let arrivals = {
                    let counter = slot.join_arrivals.entry(node.id.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if arrivals < config.join_count {
                    slot.instance.record(
                        WorkflowHistoryEntry::new(node, HistoryAction::Skipped, actor).with_data(json!({
                            "reason": "awaiting join",
                            "arrivals": arrivals,
                            "required": config.join_count,
                        })),
                    );
                    return Ok(());
                }
                slot.join_arrivals.remove(&node.id);
            }
        }

        if slot.instance.is_active(&node.id) {
            slot.instance.record(
                WorkflowHistoryEntry::new(node, HistoryAction::Skipped, actor)
                    .with_data(json!({ "reason": "already active" })),
            );
            return Ok(());
        }

        slot.instance
            .record(WorkflowHistoryEntry::new(node, HistoryAction::Entered, actor));
        slot.instance.activate(&node.id);

        match self.executor.dispatch(node, &slot.instance)? {
            NodeOutcome::Advance { data } => pass
                .queue
                .push_back(Completion::auto(&node.id, data, Route::Edges)),
            NodeOutcome::Route { target, data } => {
                let route = target.map(Route::Target).unwrap_or(Route::End);
                pass.queue.push_back(Completion::auto(&node.id, data, route));
            }
            NodeOutcome::AwaitTask { kind, config } => {
                let task = self
                    .tasks
                    .create(
                        &slot.instance.id,
                        &slot.instance.workflow_id,
                        node,
                        kind,
                        &config,
                        &slot.instance.metadata,
                    )
                    .await;
                tracing::info!(
                    "📋 Task {} created at node {} for {:?}",
                    task.id,
                    node.id,
                    task.assignees
                );
                self.events.publish(WorkflowEvent::TaskCreated { task });
            }
            NodeOutcome::AwaitTimer { delay } => {
                self.schedule_timer(&slot.instance.id, &node.id, delay).await?;
            }
            NodeOutcome::AwaitExternal(call) => pass.externals.push(call),
        }
        Ok(())
    }

    // ── Terminal transitions ─────────────────────────────────────────

    /// Shared part of every terminal transition: status, timers, open tasks
    async fn finish(&self, slot: &mut InstanceSlot, status: InstanceStatus, error: Option<String>) {
        let now = Utc::now();
        slot.instance.status = status;
        slot.instance.completed_at = Some(now);
        slot.instance.updated_at = now;
        slot.instance.error = error;
        slot.join_arrivals.clear();

        let instance_id = slot.instance.id.clone();
        let canceled_timers = self.timers.cancel_instance(&instance_id).await;
        if canceled_timers > 0 {
            tracing::debug!("🛑 Canceled {} timers of instance {}", canceled_timers, instance_id);
        }
        for task in self.tasks.cancel_open(&instance_id).await {
            self.events.publish(WorkflowEvent::TaskCanceled { task });
        }
    }

    async fn complete_instance(&self, slot: &mut InstanceSlot) {
        self.finish(slot, InstanceStatus::Completed, None).await;
        tracing::info!("🏁 Workflow instance completed: {}", slot.instance.id);
        self.events.publish(WorkflowEvent::WorkflowCompleted {
            instance_id: slot.instance.id.clone(),
            workflow_id: slot.instance.workflow_id.clone(),
            at: Utc::now(),
        });
    }

    /// Fail a running instance with one `failed` entry for `node_id`
    async fn fail_instance(&self, slot: &mut InstanceSlot, node_id: &str, actor: &str, reason: &str) {
        if !slot.instance.is_running() {
            return;
        }

        let definition = Arc::clone(&slot.definition);
        if let Some(node) = definition.node(node_id) {
            slot.instance.record(
                WorkflowHistoryEntry::new(node, HistoryAction::Failed, actor)
                    .with_data(json!({ "error": reason })),
            );
        }
        slot.instance.deactivate(node_id);
        self.finish(slot, InstanceStatus::Failed, Some(reason.to_string()))
            .await;

        tracing::error!("❌ Workflow instance {} failed at {}: {}", slot.instance.id, node_id, reason);
        self.events.publish(WorkflowEvent::WorkflowFailed {
            instance_id: slot.instance.id.clone(),
            workflow_id: slot.instance.workflow_id.clone(),
            node_id: node_id.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    async fn terminate(
        &self,
        instance_id: &str,
        actor: &str,
        reason: Option<String>,
        status: InstanceStatus,
    ) -> EngineResult<WorkflowInstance> {
        let handle = self.slot(instance_id).await?;
        let mut slot = handle.lock().await;
        ensure_running(&slot.instance)?;

        let error = reason
            .clone()
            .unwrap_or_else(|| format!("{} by {}", status, actor));
        self.finish(&mut slot, status, Some(error)).await;

        let at = Utc::now();
        let workflow_id = slot.instance.workflow_id.clone();
        let event = match status {
            InstanceStatus::Suspended => WorkflowEvent::WorkflowSuspended {
                instance_id: instance_id.to_string(),
                workflow_id,
                actor: actor.to_string(),
                reason,
                at,
            },
            _ => WorkflowEvent::WorkflowCanceled {
                instance_id: instance_id.to_string(),
                workflow_id,
                actor: actor.to_string(),
                reason,
                at,
            },
        };
        tracing::info!("🛑 Workflow instance {} {} by {}", instance_id, status, actor);
        self.events.publish(event);

        Ok(slot.instance.clone())
    }

    // ── Deferred re-entry ────────────────────────────────────────────

    async fn schedule_timer(&self, instance_id: &str, node_id: &str, delay: Duration) -> EngineResult<()> {
        let engine = self.this.clone();
        let fire_instance = instance_id.to_string();
        let fire_node = node_id.to_string();
        let on_fire: TimerCallback = Arc::new(move || {
            let engine = engine.clone();
            let instance_id = fire_instance.clone();
            let node_id = fire_node.clone();
            Box::pin(async move {
                if let Some(engine) = engine.upgrade() {
                    engine.on_timer_fired(instance_id, node_id).await;
                }
            }) as TimerTask
        });

        self.timers
            .schedule(TimerKey::new(instance_id, node_id), delay, on_fire)
            .await
            .map_err(|e| {
                EngineError::ExecutionError(format!("Failed to schedule timer for node '{}': {}", node_id, e))
            })?;
        tracing::debug!("⏰ Timer node {} waits {:?} in instance {}", node_id, delay, instance_id);
        Ok(())
    }

    fn on_timer_fired(self: Arc<Self>, instance_id: String, node_id: String) -> BoxedTask {
        Box::pin(async move {
            let Ok(handle) = self.slot(&instance_id).await else {
                return;
            };
            let mut slot = handle.lock().await;
            if !slot.instance.is_running() || !slot.instance.is_active(&node_id) {
                tracing::debug!("⏭️ Timer {}:{} fired for an inactive node", instance_id, node_id);
                return;
            }

            let completion = Completion {
                node_id,
                data: Variables::new(),
                actor: TIMER_ACTOR.to_string(),
                route: Route::Edges,
                action: HistoryAction::Completed,
            };
            let externals = self.resume(&mut slot, completion).await;
            drop(slot);
            self.spawn_externals(externals);
        })
    }

    fn spawn_externals(&self, externals: Vec<ExternalCall>) {
        if externals.is_empty() {
            return;
        }
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        for call in externals {
            tokio::spawn(Arc::clone(&engine).run_external(call));
        }
    }

    /// Run one collaborator call with no lock held, then re-enter
    fn run_external(self: Arc<Self>, call: ExternalCall) -> BoxedTask {
        Box::pin(async move {
            tracing::debug!("🌐 External call for node {} of instance {}", call.node_id, call.instance_id);
            let result = self.executor.invoke_external(&call).await;

            let Ok(handle) = self.slot(&call.instance_id).await else {
                return;
            };
            let mut slot = handle.lock().await;
            if !slot.instance.is_running() || !slot.instance.is_active(&call.node_id) {
                tracing::debug!(
                    "⏭️ Dropping late result of node {}: instance {} is {}",
                    call.node_id,
                    call.instance_id,
                    slot.instance.status
                );
                return;
            }

            if let Some(error) = &result.error {
                if result.halt_on_error {
                    slot.instance.variables.extend(result.data.clone());
                    self.fail_instance(&mut slot, &call.node_id, SYSTEM_ACTOR, error)
                        .await;
                    return;
                }
                tracing::warn!(
                    "⚠️ Node {} of instance {} failed, continuing: {}",
                    call.node_id,
                    call.instance_id,
                    error
                );
            }

            let completion = Completion::auto(&call.node_id, result.data, Route::Edges);
            let externals = self.resume(&mut slot, completion).await;
            drop(slot);
            self.spawn_externals(externals);
        })
    }
}

/// Check a completion against the current state without changing anything
fn plan(slot: &InstanceSlot, completion: &Completion) -> EngineResult<Transition> {
    let instance = &slot.instance;
    let definition = &slot.definition;

    if !instance.is_active(&completion.node_id) {
        return Err(not_active(&instance.id, &completion.node_id));
    }
    if definition.node(&completion.node_id).is_none() {
        return Err(EngineError::ExecutionError(format!(
            "Node '{}' not found in workflow '{}'",
            completion.node_id, definition.id
        )));
    }

    let mut variables = instance.variables.clone();
    variables.extend(completion.data.clone());

    let targets = match &completion.route {
        Route::Edges => {
            let mut targets = Vec::new();
            for edge in definition.outgoing(&completion.node_id) {
                let fires = match &edge.condition {
                    Some(guard) => crate::runtime::condition::evaluate_bool(guard, &variables).map_err(|e| {
                        EngineError::ExecutionError(format!(
                            "Condition '{}' on edge {} -> {} failed: {}",
                            guard, edge.source_node_id, edge.target_node_id, e
                        ))
                    })?,
                    None => true,
                };
                if fires {
                    targets.push(edge.target_node_id.clone());
                }
            }
            targets
        }
        Route::Target(target) => vec![target.clone()],
        Route::End => Vec::new(),
    };

    if let Some(dangling) = targets.iter().find(|target| definition.node(target).is_none()) {
        return Err(EngineError::ExecutionError(format!(
            "Node '{}' routes to unknown node '{}'",
            completion.node_id, dangling
        )));
    }

    Ok(Transition { variables, targets })
}

fn ensure_running(instance: &WorkflowInstance) -> EngineResult<()> {
    if instance.is_running() {
        Ok(())
    } else {
        Err(EngineError::InvalidWorkflowStatus {
            instance_id: instance.id.clone(),
            status: instance.status,
        })
    }
}

fn not_active(instance_id: &str, node_id: &str) -> EngineError {
    EngineError::ExecutionError(format!(
        "Node '{}' is not active in instance '{}'",
        node_id, instance_id
    ))
}

/// Required variables must be supplied; supplied values must match their type
fn validate_variables(definition: &WorkflowDefinition, provided: &Variables) -> EngineResult<()> {
    for declared in &definition.variables {
        match provided.get(&declared.name) {
            None | Some(Value::Null) if declared.required => {
                return Err(EngineError::ValidationError(format!(
                    "Missing required variable '{}'",
                    declared.name
                )));
            }
            Some(value) if !value.is_null() && !declared.var_type.accepts(value) => {
                return Err(EngineError::ValidationError(format!(
                    "Variable '{}' must be of type {:?}, got {}",
                    declared.name, declared.var_type, value
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
