/// Hot-reload definition registry using ArcSwap
///
/// Reads are lock-free: every update builds a new map and swaps the pointer,
/// so running instances keep the `Arc<WorkflowDefinition>` they started with
/// while new starts see the new version immediately.

use crate::{
    error::{EngineError, EngineResult},
    runtime::{condition::Expression, executor::MAX_TIMER_DELAY_SECS, tasks::MAX_TASK_TIMEOUT_SECS},
    workflow::{
        storage::DefinitionStorage,
        types::{NodeKind, WorkflowDefinition},
    },
};
use anyhow::Result;
use arc_swap::ArcSwap;
use petgraph::{
    algo::is_cyclic_directed,
    graph::{DiGraph, NodeIndex},
    visit::Bfs,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Source of immutable definitions for the engine
pub trait DefinitionRepository: Send + Sync {
    /// Highest active version of a workflow
    fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>>;

    /// Every registered version of every workflow
    fn list(&self) -> Vec<Arc<WorkflowDefinition>>;
}

/// Non-fatal findings of graph validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphReport {
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct DefinitionRegistry {
    /// Key: workflow id, value: versions sorted ascending
    definitions: ArcSwap<HashMap<String, Vec<Arc<WorkflowDefinition>>>>,
    storage: Option<DefinitionStorage>,
}

impl DefinitionRegistry {
    /// Registry backed by persistent storage
    pub fn new(storage: DefinitionStorage) -> Self {
        Self {
            definitions: ArcSwap::new(Arc::new(HashMap::new())),
            storage: Some(storage),
        }
    }

    /// Registry without persistence, for embedding and tests
    pub fn in_memory() -> Self {
        Self {
            definitions: ArcSwap::new(Arc::new(HashMap::new())),
            storage: None,
        }
    }

    /// Load every stored definition. Invalid ones are skipped with a warning.
    pub async fn init_from_storage(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let mut registry: HashMap<String, Vec<Arc<WorkflowDefinition>>> = HashMap::new();
        for definition in storage.load_all().await? {
            match validate_graph(&definition) {
                Ok(_) => registry
                    .entry(definition.id.clone())
                    .or_default()
                    .push(Arc::new(definition)),
                Err(e) => tracing::warn!(
                    "⚠️ Skipping stored definition {} v{}: {}",
                    definition.id,
                    definition.version,
                    e
                ),
            }
        }
        for versions in registry.values_mut() {
            versions.sort_by_key(|definition| definition.version);
        }

        self.definitions.store(Arc::new(registry));
        tracing::info!(
            "Initialized definition registry with {} workflows",
            self.definitions.load().len()
        );
        Ok(())
    }

    /// Validate and register a definition in memory
    ///
    /// A draft version may be replaced (including by its activated copy); an
    /// active version is immutable and changes need a new version number.
    pub fn register(&self, definition: WorkflowDefinition) -> EngineResult<GraphReport> {
        let report = validate_graph(&definition)?;
        self.ensure_replaceable(&definition)?;
        for warning in &report.warnings {
            tracing::warn!("⚠️ Definition {} v{}: {}", definition.id, definition.version, warning);
        }

        let definition = Arc::new(definition);
        self.definitions.rcu(|current| {
            let mut next = (**current).clone();
            let versions = next.entry(definition.id.clone()).or_default();
            versions.retain(|existing| existing.version != definition.version);
            versions.push(Arc::clone(&definition));
            versions.sort_by_key(|existing| existing.version);
            next
        });

        tracing::info!(
            "🔥 Registered definition {} v{} ({})",
            definition.id,
            definition.version,
            definition.status.as_str()
        );
        Ok(report)
    }

    /// Validate, persist (when storage is configured) and register
    pub async fn save(&self, definition: WorkflowDefinition) -> EngineResult<GraphReport> {
        validate_graph(&definition)?;
        self.ensure_replaceable(&definition)?;
        if let Some(storage) = &self.storage {
            storage.save(&definition).await.map_err(|e| {
                EngineError::ExecutionError(format!("Failed to persist definition {}: {}", definition.id, e))
            })?;
        }
        self.register(definition)
    }

    fn ensure_replaceable(&self, definition: &WorkflowDefinition) -> EngineResult<()> {
        match self.get_version(&definition.id, definition.version) {
            Some(existing) if existing.is_active() => Err(EngineError::InvalidWorkflowDefinition(format!(
                "{} v{} is already active; publish a new version instead",
                definition.id, definition.version
            ))),
            _ => Ok(()),
        }
    }

    /// A specific version, whatever its status
    pub fn get_version(&self, workflow_id: &str, version: u32) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .load()
            .get(workflow_id)?
            .iter()
            .find(|definition| definition.version == version)
            .cloned()
    }
}

impl DefinitionRepository for DefinitionRegistry {
    fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .load()
            .get(workflow_id)?
            .iter()
            .rev()
            .find(|definition| definition.is_active())
            .cloned()
    }

    fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.load();
        let mut all: Vec<Arc<WorkflowDefinition>> = definitions.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id).then(a.version.cmp(&b.version)));
        all
    }
}

/// Structural validation of a definition graph
///
/// Hard errors: empty id, duplicate node ids, edges or routing targets that
/// name unknown nodes, expressions that do not parse and timer delays or task
/// timeouts beyond their limits. Warnings: missing start node, cycles (bounded at run
/// time by the step limit) and nodes unreachable from the start node.
pub fn validate_graph(definition: &WorkflowDefinition) -> EngineResult<GraphReport> {
    let invalid = |message: String| EngineError::InvalidWorkflowDefinition(message);

    if definition.id.trim().is_empty() {
        return Err(invalid("definition id must not be empty".to_string()));
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &definition.nodes {
        if index.contains_key(node.id.as_str()) {
            return Err(invalid(format!("duplicate node id '{}'", node.id)));
        }
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    let lookup = |node_id: &str, context: &str| {
        index
            .get(node_id)
            .copied()
            .ok_or_else(|| invalid(format!("{} references unknown node '{}'", context, node_id)))
    };

    for edge in &definition.edges {
        let context = format!("edge {} -> {}", edge.source_node_id, edge.target_node_id);
        let source = lookup(&edge.source_node_id, &context)?;
        let target = lookup(&edge.target_node_id, &context)?;
        graph.add_edge(source, target, ());
    }

    // Routing that bypasses edges still belongs to the graph
    for node in &definition.nodes {
        let source = index[node.id.as_str()];
        let mut routed: Vec<&str> = Vec::new();
        match &node.kind {
            NodeKind::Condition(config) => {
                routed.extend(config.branches.iter().map(|branch| branch.target.as_str()));
                routed.extend(config.default_node_id.as_deref());
            }
            NodeKind::Task(config) | NodeKind::Approval(config) => {
                routed.extend(config.reject_target.as_deref());
            }
            _ => {}
        }
        for target in routed {
            let target = lookup(target, &format!("node '{}'", node.id))?;
            graph.add_edge(source, target, ());
        }
    }

    for edge in &definition.edges {
        if let Some(condition) = &edge.condition {
            Expression::parse(condition).map_err(|e| {
                invalid(format!(
                    "edge {} -> {} has an invalid condition: {}",
                    edge.source_node_id, edge.target_node_id, e
                ))
            })?;
        }
    }

    for node in &definition.nodes {
        let mut expressions: Vec<&str> = Vec::new();
        match &node.kind {
            NodeKind::Condition(config) => {
                expressions.extend(config.branches.iter().map(|branch| branch.expression.as_str()));
            }
            NodeKind::Timer(config) => {
                expressions.extend(config.delay_expression.as_deref());
                if config.delay_secs.is_some_and(|secs| secs > MAX_TIMER_DELAY_SECS) {
                    return Err(invalid(format!(
                        "timer node '{}' delay exceeds {} seconds",
                        node.id, MAX_TIMER_DELAY_SECS
                    )));
                }
            }
            NodeKind::Task(config) | NodeKind::Approval(config) => {
                if config.timeout_secs.is_some_and(|secs| secs > MAX_TASK_TIMEOUT_SECS) {
                    return Err(invalid(format!(
                        "node '{}' timeout exceeds {} seconds",
                        node.id, MAX_TASK_TIMEOUT_SECS
                    )));
                }
            }
            _ => {}
        }
        for expression in expressions {
            Expression::parse(expression)
                .map_err(|e| invalid(format!("node '{}' has an invalid expression: {}", node.id, e)))?;
        }
    }

    let mut report = GraphReport::default();

    match definition.start_node() {
        Some(start) => {
            let mut reachable = HashSet::new();
            let mut bfs = Bfs::new(&graph, index[start.id.as_str()]);
            while let Some(visited) = bfs.next(&graph) {
                reachable.insert(visited);
            }
            for node in &definition.nodes {
                if !reachable.contains(&index[node.id.as_str()]) {
                    report
                        .warnings
                        .push(format!("node '{}' is unreachable from the start node", node.id));
                }
            }
        }
        None => report.warnings.push("no start node declared".to_string()),
    }

    if is_cyclic_directed(&graph) {
        report
            .warnings
            .push("graph contains a cycle; instances are bounded by the step limit".to_string());
    }

    Ok(report)
}
