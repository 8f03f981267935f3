/// Runtime Execution Engine
///
/// This module drives workflow instances through their process graph.
/// It handles:
/// - Instance lifecycle and the transition algorithm
/// - Per-node-type dispatch (tasks, conditions, timers, webhooks, scripts)
/// - Human task bookkeeping
/// - Lifecycle event publication

// Instance manager and transition algorithm
pub mod engine;

// Per-node-type behavior and external calls
pub mod executor;

// Restricted expression language for edge guards and condition nodes
pub mod condition;

// Pending human/approval tasks
pub mod tasks;

// One-shot timers for timer nodes
pub mod scheduler;

// Lifecycle events and sinks
pub mod events;

// Webhook HTTP client
pub mod http;

// Lua sandbox for script nodes
pub mod script;

// Re-export main types
pub use engine::{EngineBuilder, WorkflowEngine};
pub use events::{ChannelEventSink, EventSink, WorkflowEvent};
pub use executor::{CustomNodeContext, CustomNodeHandler};
pub use http::HttpClient;
pub use script::ScriptRunner;
