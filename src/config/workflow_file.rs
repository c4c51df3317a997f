//! Declarative workflow definitions and their compilation into graphs.

use super::ConfigError;
use crate::agents::{AgentRegistry, AgentResponse};
use crate::context::{ContextSchema, MergePolicy};
use crate::orchestration::graph::{Transition, WorkflowGraph};
use crate::orchestration::steps::{AgentStep, ErrorHandlerStep, RecoveryPolicy};
use crate::shared::ids::{CapabilityId, StepId, WorkflowType};
use crate::state::WorkflowState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// `next` value that completes the workflow.
pub const END_STEP: &str = "end";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub id: String,
    pub entry: String,
    /// Id for the built-in error handler; defaults to `handle_error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    /// Context field -> merge policy name.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub id: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchDefinition>,
}

/// Route on a context value. `key` may address nested fields with dots
/// (`risk.level`); the rendered value is looked up in `cases`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BranchDefinition {
    pub key: String,
    #[serde(default)]
    pub cases: BTreeMap<String, String>,
    pub default: String,
}

impl WorkflowDefinition {
    pub fn validate(&self) -> Result<(), ConfigError> {
        WorkflowType::parse(&self.id).map_err(|err| ConfigError::workflow(&self.id, err))?;
        if self.steps.is_empty() {
            return Err(ConfigError::workflow(&self.id, "`steps` must be non-empty"));
        }

        let mut step_ids = BTreeSet::new();
        for step in &self.steps {
            self.parse_step_id(&step.id)?;
            if step.id == END_STEP {
                return Err(ConfigError::workflow(
                    &self.id,
                    format!("step id `{END_STEP}` is reserved"),
                ));
            }
            if !step_ids.insert(step.id.as_str()) {
                return Err(ConfigError::workflow(
                    &self.id,
                    format!("step `{}` is declared more than once", step.id),
                ));
            }
        }
        if let Some(error_step) = &self.error_step {
            self.parse_step_id(error_step)?;
            if step_ids.contains(error_step.as_str()) {
                return Err(ConfigError::workflow(
                    &self.id,
                    format!("error step `{error_step}` collides with a declared step"),
                ));
            }
        }
        if !step_ids.contains(self.entry.as_str()) {
            return Err(ConfigError::workflow(
                &self.id,
                format!("entry `{}` is not a declared step", self.entry),
            ));
        }

        for (field, policy) in &self.context {
            if field.trim().is_empty() {
                return Err(ConfigError::workflow(&self.id, "context field names must be non-empty"));
            }
            MergePolicy::from_name(policy)
                .map_err(|err| ConfigError::workflow(&self.id, err.to_string()))?;
        }

        for step in &self.steps {
            CapabilityId::parse(&step.capability)
                .map_err(|err| ConfigError::workflow(&self.id, format!("step `{}`: {err}", step.id)))?;
            if let Some(key) = &step.output_key {
                if key.trim().is_empty() {
                    return Err(ConfigError::workflow(
                        &self.id,
                        format!("step `{}` output_key must be non-empty", step.id),
                    ));
                }
            }
            match (&step.next, &step.branch) {
                (Some(next), None) => {
                    if next != END_STEP && !step_ids.contains(next.as_str()) {
                        return Err(ConfigError::workflow(
                            &self.id,
                            format!("step `{}` routes to unknown step `{next}`", step.id),
                        ));
                    }
                }
                (None, Some(branch)) => {
                    if branch.key.trim().is_empty() {
                        return Err(ConfigError::workflow(
                            &self.id,
                            format!("step `{}` branch key must be non-empty", step.id),
                        ));
                    }
                    for target in branch.cases.values().chain(std::iter::once(&branch.default)) {
                        if !step_ids.contains(target.as_str()) {
                            return Err(ConfigError::workflow(
                                &self.id,
                                format!("step `{}` branches to unknown step `{target}`", step.id),
                            ));
                        }
                    }
                }
                _ => {
                    return Err(ConfigError::workflow(
                        &self.id,
                        format!("step `{}` must declare exactly one of `next` or `branch`", step.id),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Build the graph, binding each step to a registered capability.
    pub fn compile(
        &self,
        agents: &AgentRegistry,
        recovery: RecoveryPolicy,
    ) -> Result<WorkflowGraph, ConfigError> {
        self.validate()?;
        let workflow_type =
            WorkflowType::parse(&self.id).map_err(|err| ConfigError::workflow(&self.id, err))?;

        let mut schema = ContextSchema::new();
        for (field, policy) in &self.context {
            let policy = MergePolicy::from_name(policy)
                .map_err(|err| ConfigError::workflow(&self.id, err.to_string()))?;
            schema = schema.field(field.clone(), policy);
        }

        let mut builder =
            WorkflowGraph::builder(workflow_type, self.parse_step_id(&self.entry)?)
                .recovery_policy(recovery);
        for step in &self.steps {
            let capability = CapabilityId::parse(&step.capability)
                .map_err(|err| ConfigError::workflow(&self.id, err))?;
            if !agents.contains(&capability) {
                return Err(ConfigError::MissingCapability {
                    workflow: self.id.clone(),
                    step: step.id.clone(),
                    capability: step.capability.clone(),
                });
            }

            let mut agent_step = AgentStep::new(capability);
            if let Some(key) = &step.output_key {
                // Output keys without an explicit policy keep the latest payload.
                if !schema.declares(key) {
                    schema = schema.field(key.clone(), MergePolicy::Overwrite);
                }
                agent_step = agent_step.output_key(key.clone());
            }
            if let Some(payload) = &step.fallback {
                agent_step = agent_step.fallback(
                    AgentResponse::success(payload.clone(), 0.0).with_reasoning("fallback payload"),
                );
            }

            builder = builder.step(
                self.parse_step_id(&step.id)?,
                Arc::new(agent_step),
                self.transition_for(step)?,
            );
        }

        if let Some(error_step) = &self.error_step {
            let id = self.parse_step_id(error_step)?;
            builder = builder
                .step(
                    id.clone(),
                    Arc::new(ErrorHandlerStep::new(recovery)),
                    Transition::Recovery,
                )
                .error_step(id);
        }

        builder
            .context(schema)
            .build()
            .map_err(|err| ConfigError::workflow(&self.id, err.to_string()))
    }

    fn transition_for(&self, step: &StepDefinition) -> Result<Transition, ConfigError> {
        if let Some(branch) = &step.branch {
            let mut cases = BTreeMap::new();
            for (value, target) in &branch.cases {
                cases.insert(value.clone(), self.parse_step_id(target)?);
            }
            let default = self.parse_step_id(&branch.default)?;
            let targets = cases
                .values()
                .cloned()
                .chain(std::iter::once(default.clone()))
                .collect::<Vec<_>>();
            let key = branch.key.clone();
            return Ok(Transition::conditional(targets, move |state| {
                branch_value(state, &key)
                    .and_then(|value| cases.get(&value).cloned())
                    .unwrap_or_else(|| default.clone())
            }));
        }
        match step.next.as_deref() {
            Some(END_STEP) | None => Ok(Transition::Terminal),
            Some(next) => Ok(Transition::Fixed(self.parse_step_id(next)?)),
        }
    }

    fn parse_step_id(&self, raw: &str) -> Result<StepId, ConfigError> {
        StepId::parse(raw).map_err(|err| ConfigError::workflow(&self.id, err))
    }
}

fn branch_value(state: &WorkflowState, key: &str) -> Option<String> {
    let mut parts = key.split('.');
    let mut value = state.context_value(parts.next()?)?;
    for part in parts {
        value = match value {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}
