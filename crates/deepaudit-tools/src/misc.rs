//! `think` and `reflect`: no-op-to-the-world tools whose only effect is
//! echoing the agent's own reasoning text back as an observation. Several
//! ReAct transcripts in the corpus rely on an explicit "thinking out loud"
//! action distinct from the `Thought:` preamble the loop already parses —
//! these exist so that pattern keeps working verbatim.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use deepaudit_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

#[derive(Deserialize)]
struct ThoughtArgs {
    thought: String,
}

pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Record a reasoning step without taking any action; the text is echoed back as the observation"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description())
            .with_parameters(ToolParameters::new().add_property("thought", PropertySchema::string("Reasoning to record"), true))
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, Error> {
        let args: ThoughtArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;
        Ok(ToolOutput::success(args.thought))
    }
}

pub struct ReflectTool;

#[async_trait]
impl Tool for ReflectTool {
    fn name(&self) -> &str {
        "reflect"
    }

    fn description(&self) -> &str {
        "Record a reflection on progress so far without taking any action; the text is echoed back as the observation"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description())
            .with_parameters(ToolParameters::new().add_property("thought", PropertySchema::string("Reflection to record"), true))
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, Error> {
        let args: ThoughtArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;
        Ok(ToolOutput::success(args.thought))
    }
}

pub fn create_misc_tools() -> Vec<Box<dyn Tool>> {
    vec![Box::new(ThinkTool), Box::new(ReflectTool)]
}
