//! Static workflow graphs: a dispatch table from step id to step
//! implementation plus each step's declared transition.
//!
//! All targets are checked when the graph is built, so routing at run time
//! can only pick from declared steps.

use crate::context::ContextSchema;
use crate::orchestration::steps::{ErrorHandlerStep, RecoveryPolicy, WorkflowStep};
use crate::shared::ids::{StepId, WorkflowType};
use crate::state::WorkflowState;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const DEFAULT_ERROR_STEP: &str = "handle_error";

pub type RouteSelector = Arc<dyn Fn(&WorkflowState) -> StepId + Send + Sync>;

#[derive(Clone)]
pub enum Transition {
    Fixed(StepId),
    /// Selector over the post-step state; must return one of `targets`.
    Conditional {
        targets: BTreeSet<StepId>,
        select: RouteSelector,
    },
    Terminal,
    /// Only valid on the error step; the target comes from its recovery decision.
    Recovery,
}

impl Transition {
    pub fn conditional<I, F>(targets: I, select: F) -> Self
    where
        I: IntoIterator<Item = StepId>,
        F: Fn(&WorkflowState) -> StepId + Send + Sync + 'static,
    {
        Transition::Conditional {
            targets: targets.into_iter().collect(),
            select: Arc::new(select),
        }
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Fixed(step) => f.debug_tuple("Fixed").field(step).finish(),
            Transition::Conditional { targets, .. } => f
                .debug_struct("Conditional")
                .field("targets", targets)
                .finish_non_exhaustive(),
            Transition::Terminal => f.write_str("Terminal"),
            Transition::Recovery => f.write_str("Recovery"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Step(StepId),
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("workflow `{workflow_type}` entry step `{step}` is not declared")]
    UnknownEntry {
        workflow_type: WorkflowType,
        step: StepId,
    },
    #[error("workflow `{workflow_type}` error step `{step}` is not declared")]
    UnknownErrorStep {
        workflow_type: WorkflowType,
        step: StepId,
    },
    #[error("workflow `{workflow_type}` declares step `{step}` twice")]
    DuplicateStep {
        workflow_type: WorkflowType,
        step: StepId,
    },
    #[error("step `{from}` routes to undeclared step `{to}`")]
    UnknownTarget { from: StepId, to: StepId },
    #[error("step `{step}` has a conditional transition with no targets")]
    EmptyConditional { step: StepId },
    #[error("error step `{step}` must use the recovery transition")]
    ErrorStepTransition { step: StepId },
    #[error("step `{step}` uses the recovery transition but is not the error step")]
    MisplacedRecovery { step: StepId },
    #[error("step `{step}` is not part of workflow `{workflow_type}`")]
    UnknownStep {
        workflow_type: WorkflowType,
        step: StepId,
    },
    #[error("step `{from}` selected undeclared next step `{selected}`")]
    UndeclaredRoute { from: StepId, selected: StepId },
}

struct GraphNode {
    step: Arc<dyn WorkflowStep>,
    transition: Transition,
}

pub struct WorkflowGraph {
    workflow_type: WorkflowType,
    entry: StepId,
    error_step: StepId,
    nodes: BTreeMap<StepId, GraphNode>,
    context: ContextSchema,
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("workflow_type", &self.workflow_type)
            .field("entry", &self.entry)
            .field("error_step", &self.error_step)
            .field("steps", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkflowGraph {
    pub fn builder(workflow_type: WorkflowType, entry: StepId) -> GraphBuilder {
        GraphBuilder::new(workflow_type, entry)
    }

    pub fn workflow_type(&self) -> &WorkflowType {
        &self.workflow_type
    }

    pub fn entry(&self) -> &StepId {
        &self.entry
    }

    pub fn error_step(&self) -> &StepId {
        &self.error_step
    }

    pub fn context(&self) -> &ContextSchema {
        &self.context
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.nodes.keys()
    }

    pub fn step(&self, id: &StepId) -> Result<Arc<dyn WorkflowStep>, GraphError> {
        self.nodes
            .get(id)
            .map(|node| node.step.clone())
            .ok_or_else(|| self.unknown_step(id))
    }

    pub fn transition(&self, id: &StepId) -> Result<&Transition, GraphError> {
        self.nodes
            .get(id)
            .map(|node| &node.transition)
            .ok_or_else(|| self.unknown_step(id))
    }

    /// Next step after `from` for every transition except `Recovery`,
    /// which the engine resolves from the error step's decision.
    pub fn resolve_next(
        &self,
        from: &StepId,
        state: &WorkflowState,
    ) -> Result<NextStep, GraphError> {
        match self.transition(from)? {
            Transition::Fixed(next) => Ok(NextStep::Step(next.clone())),
            Transition::Terminal => Ok(NextStep::End),
            Transition::Conditional { targets, select } => {
                let selected = select(state);
                if targets.contains(&selected) {
                    Ok(NextStep::Step(selected))
                } else {
                    Err(GraphError::UndeclaredRoute {
                        from: from.clone(),
                        selected,
                    })
                }
            }
            Transition::Recovery => Err(GraphError::MisplacedRecovery { step: from.clone() }),
        }
    }

    fn unknown_step(&self, id: &StepId) -> GraphError {
        GraphError::UnknownStep {
            workflow_type: self.workflow_type.clone(),
            step: id.clone(),
        }
    }
}

pub struct GraphBuilder {
    workflow_type: WorkflowType,
    entry: StepId,
    error_step: Option<StepId>,
    recovery: RecoveryPolicy,
    nodes: Vec<(StepId, GraphNode)>,
    context: ContextSchema,
}

impl GraphBuilder {
    pub fn new(workflow_type: WorkflowType, entry: StepId) -> Self {
        Self {
            workflow_type,
            entry,
            error_step: None,
            recovery: RecoveryPolicy::default(),
            nodes: Vec::new(),
            context: ContextSchema::new(),
        }
    }

    pub fn step(
        mut self,
        id: StepId,
        step: Arc<dyn WorkflowStep>,
        transition: Transition,
    ) -> Self {
        self.nodes.push((id, GraphNode { step, transition }));
        self
    }

    /// Use a custom error-handling step instead of the built-in one.
    pub fn error_step(mut self, id: StepId) -> Self {
        self.error_step = Some(id);
        self
    }

    /// Policy for the built-in error step.
    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    pub fn context(mut self, schema: ContextSchema) -> Self {
        self.context = schema;
        self
    }

    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        let GraphBuilder {
            workflow_type,
            entry,
            error_step,
            recovery,
            nodes: declared,
            context,
        } = self;

        let mut nodes = BTreeMap::new();
        for (id, node) in declared {
            if nodes.contains_key(&id) {
                return Err(GraphError::DuplicateStep {
                    workflow_type,
                    step: id,
                });
            }
            nodes.insert(id, node);
        }

        let error_step = match error_step {
            Some(id) => {
                if !nodes.contains_key(&id) {
                    return Err(GraphError::UnknownErrorStep {
                        workflow_type,
                        step: id,
                    });
                }
                id
            }
            None => {
                let id = StepId::parse(DEFAULT_ERROR_STEP).map_err(|_| {
                    GraphError::UnknownErrorStep {
                        workflow_type: workflow_type.clone(),
                        step: entry.clone(),
                    }
                })?;
                if nodes.contains_key(&id) {
                    return Err(GraphError::DuplicateStep {
                        workflow_type,
                        step: id,
                    });
                }
                nodes.insert(
                    id.clone(),
                    GraphNode {
                        step: Arc::new(ErrorHandlerStep::new(recovery)),
                        transition: Transition::Recovery,
                    },
                );
                id
            }
        };

        if !nodes.contains_key(&entry) {
            return Err(GraphError::UnknownEntry {
                workflow_type,
                step: entry,
            });
        }

        for (id, node) in &nodes {
            let is_error_step = *id == error_step;
            match &node.transition {
                Transition::Recovery if !is_error_step => {
                    return Err(GraphError::MisplacedRecovery { step: id.clone() });
                }
                Transition::Recovery => {}
                _ if is_error_step => {
                    return Err(GraphError::ErrorStepTransition { step: id.clone() });
                }
                Transition::Terminal => {}
                Transition::Fixed(target) => {
                    if !nodes.contains_key(target) {
                        return Err(GraphError::UnknownTarget {
                            from: id.clone(),
                            to: target.clone(),
                        });
                    }
                }
                Transition::Conditional { targets, .. } => {
                    if targets.is_empty() {
                        return Err(GraphError::EmptyConditional { step: id.clone() });
                    }
                    if let Some(target) = targets.iter().find(|target| !nodes.contains_key(*target))
                    {
                        return Err(GraphError::UnknownTarget {
                            from: id.clone(),
                            to: target.clone(),
                        });
                    }
                }
            }
        }

        Ok(WorkflowGraph {
            workflow_type,
            entry,
            error_step,
            nodes,
            context,
        })
    }
}
