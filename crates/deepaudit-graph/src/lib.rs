//! deepaudit-graph: the dynamic agent tree, inter-agent message bus, event
//! stream, and parallel task executor that sit between the orchestrator and
//! the rest of the agent population.

pub mod controller;
pub mod events;
pub mod executor;
pub mod message_bus;
pub mod registry;

pub use controller::{ActiveAgentsSummary, FindingsSummary, GraphController, StopAllResult, StopResult};
pub use events::{EventType, GraphEvent, GraphEventBus, DEFAULT_EVENT_BUFFER};
pub use executor::{
    DynamicExecutor, ExecutionResult, ExecutionTask, TaskOutcome, TaskRunner, DEFAULT_CONCURRENCY,
    DEFAULT_TASK_TIMEOUT,
};
pub use message_bus::{AgentMessage, MessageBus, MessagePriority, MessageType};
pub use registry::{AgentEdge, AgentGraphRegistry, AgentNode, AgentStatistics, AgentTree, NodeStatus};
