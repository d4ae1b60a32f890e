//! Agent role definitions, the shared ReAct loop, and orchestrator dispatch.
//!
//! Five roles (`AgentRole`) share one state machine (`ReactLoop`); only the
//! orchestrator extends it with dispatch/merge behavior (`OrchestratorContext`).
//! See `role.rs` for the role table, `react.rs` for the loop, `orchestrator.rs`
//! for dispatch.

mod orchestrator;
mod react;
mod role;

pub use orchestrator::{run_orchestrator, OrchestratorContext};
pub use react::{parse_agent_step, AgentResult, AgentStep, OrchestratorOps, ReactLoop};
pub use role::AgentRole;
