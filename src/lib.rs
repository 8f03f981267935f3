/// flowpilot: workflow execution engine
///
/// Interprets declarative process graphs (nodes, edges, variables) and drives
/// running instances through tasks, approvals, branching, parallel fan-out,
/// timers, webhooks and scripts to completion or failure.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// Workflow definition layer - types, storage and hot-reload registry
pub mod workflow;

// Runtime execution engine - instances, transitions and node dispatch
pub mod runtime;

// HTTP API layer - REST adapter over the engine's exposed operations
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use runtime::{EngineBuilder, WorkflowEngine, WorkflowEvent};
pub use server::start_server;
pub use workflow::{DefinitionRegistry, DefinitionRepository, WorkflowDefinition, WorkflowInstance, WorkflowTask};
