/// Workflow definition layer
///
/// Type definitions for definitions, instances and tasks, SQLite persistence
/// of definitions, and the lock-free hot-reload registry the engine reads from.

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for definitions
pub mod storage;

// Hot-reload registry using ArcSwap
pub mod registry;

// Re-export commonly used types
pub use registry::{DefinitionRegistry, DefinitionRepository};
pub use types::{WorkflowDefinition, WorkflowEdge, WorkflowInstance, WorkflowNode, WorkflowTask};
