//! Context accumulation: folds step observations into a workflow's
//! `accumulated_context` using merge policies declared per field up front.
//!
//! Merging never performs I/O and is deterministic for a given
//! `(state, observation)` pair, so any checkpoint can be rebuilt by
//! replaying observations.

use crate::state::WorkflowState;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type CombineFn = Arc<dyn Fn(Option<&Value>, &Value) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("observation field `{field}` has no declared merge policy")]
    UndeclaredField { field: String },
    #[error("combine `{combiner}` failed for field `{field}`: {message}")]
    CombineFailed {
        field: String,
        combiner: String,
        message: String,
    },
    #[error("unknown merge policy `{name}`")]
    UnknownPolicy { name: String },
}

#[derive(Clone)]
pub enum MergePolicy {
    /// Concatenate incoming values onto the existing list.
    Append,
    Overwrite,
    Combine { name: String, combine: CombineFn },
}

impl std::fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergePolicy::Append => f.write_str("Append"),
            MergePolicy::Overwrite => f.write_str("Overwrite"),
            MergePolicy::Combine { name, .. } => f.debug_tuple("Combine").field(name).finish(),
        }
    }
}

impl MergePolicy {
    pub fn combine<F>(name: impl Into<String>, combine: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        MergePolicy::Combine {
            name: name.into(),
            combine: Arc::new(combine),
        }
    }

    /// Set union of arrays, keeping first-seen order.
    pub fn union() -> Self {
        Self::combine("union", combine_union)
    }

    pub fn sum() -> Self {
        Self::combine("sum", combine_sum)
    }

    pub fn max() -> Self {
        Self::combine("max", combine_max)
    }

    /// Resolve a policy by its configuration name.
    pub fn from_name(name: &str) -> Result<Self, ContextError> {
        match name.trim() {
            "append" => Ok(MergePolicy::Append),
            "overwrite" => Ok(MergePolicy::Overwrite),
            "union" => Ok(Self::union()),
            "sum" => Ok(Self::sum()),
            "max" => Ok(Self::max()),
            other => Err(ContextError::UnknownPolicy {
                name: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MergePolicy::Append => "append",
            MergePolicy::Overwrite => "overwrite",
            MergePolicy::Combine { name, .. } => name,
        }
    }
}

/// Merge-policy table, fixed once the schema is built.
#[derive(Debug, Clone, Default)]
pub struct ContextSchema {
    fields: BTreeMap<String, MergePolicy>,
}

impl ContextSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, policy: MergePolicy) -> Self {
        self.fields.insert(key.into(), policy);
        self
    }

    pub fn policy(&self, key: &str) -> Option<&MergePolicy> {
        self.fields.get(key)
    }

    pub fn declares(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &MergePolicy)> {
        self.fields
            .iter()
            .map(|(key, policy)| (key.as_str(), policy))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    values: BTreeMap<String, Value>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl From<Map<String, Value>> for Observation {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            values: map.into_iter().collect(),
        }
    }
}

/// Returns a new state with `observation` folded in. Either every field
/// merges or the state is left untouched.
pub fn merge(
    schema: &ContextSchema,
    state: &WorkflowState,
    observation: &Observation,
) -> Result<WorkflowState, ContextError> {
    if let Some((field, _)) = observation.iter().find(|(key, _)| !schema.declares(key)) {
        return Err(ContextError::UndeclaredField {
            field: field.to_string(),
        });
    }

    let mut next = state.clone();
    let context = next.context_mut();
    for (key, incoming) in observation.iter() {
        let Some(policy) = schema.policy(key) else {
            continue;
        };
        let merged = merge_value(policy, key, context.get(key), incoming)?;
        context.insert(key.to_string(), merged);
    }
    Ok(next)
}

fn merge_value(
    policy: &MergePolicy,
    field: &str,
    existing: Option<&Value>,
    incoming: &Value,
) -> Result<Value, ContextError> {
    match policy {
        MergePolicy::Overwrite => Ok(incoming.clone()),
        MergePolicy::Append => {
            let mut items = match existing {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(other) => vec![other.clone()],
            };
            match incoming {
                Value::Array(values) => items.extend(values.iter().cloned()),
                value => items.push(value.clone()),
            }
            Ok(Value::Array(items))
        }
        MergePolicy::Combine { name, combine } => {
            combine(existing, incoming).map_err(|message| ContextError::CombineFailed {
                field: field.to_string(),
                combiner: name.clone(),
                message,
            })
        }
    }
}

fn as_items(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn combine_union(existing: Option<&Value>, incoming: &Value) -> Result<Value, String> {
    let mut merged: Vec<Value> = Vec::new();
    for item in as_items(existing)
        .into_iter()
        .chain(as_items(Some(incoming)))
    {
        if !merged.contains(&item) {
            merged.push(item);
        }
    }
    Ok(Value::Array(merged))
}

fn expect_number<'a>(value: &'a Value, role: &str) -> Result<&'a Number, String> {
    match value {
        Value::Number(number) => Ok(number),
        other => Err(format!("{role} value `{other}` is not a number")),
    }
}

fn combine_sum(existing: Option<&Value>, incoming: &Value) -> Result<Value, String> {
    let incoming = expect_number(incoming, "incoming")?;
    let Some(existing) = existing.filter(|value| !value.is_null()) else {
        return Ok(Value::Number(incoming.clone()));
    };
    let existing = expect_number(existing, "existing")?;
    if let (Some(left), Some(right)) = (existing.as_i64(), incoming.as_i64()) {
        if let Some(total) = left.checked_add(right) {
            return Ok(Value::from(total));
        }
    }
    let total = existing.as_f64().unwrap_or(0.0) + incoming.as_f64().unwrap_or(0.0);
    Number::from_f64(total)
        .map(Value::Number)
        .ok_or_else(|| format!("sum {total} is not representable"))
}

fn combine_max(existing: Option<&Value>, incoming: &Value) -> Result<Value, String> {
    let incoming_number = expect_number(incoming, "incoming")?;
    let Some(existing) = existing.filter(|value| !value.is_null()) else {
        return Ok(incoming.clone());
    };
    let existing_number = expect_number(existing, "existing")?;
    if incoming_number.as_f64() > existing_number.as_f64() {
        Ok(incoming.clone())
    } else {
        Ok(existing.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::{StepId, ThreadId, UserId, WorkflowType};
    use serde_json::json;

    fn state() -> WorkflowState {
        WorkflowState::new(
            ThreadId::parse("t-ctx").expect("thread"),
            UserId::parse("u-1").expect("user"),
            WorkflowType::parse("assessment").expect("type"),
            StepId::parse("intake").expect("step"),
            Value::Null,
            0,
        )
    }

    fn schema() -> ContextSchema {
        ContextSchema::new()
            .field("findings", MergePolicy::Append)
            .field("summary", MergePolicy::Overwrite)
            .field("frameworks", MergePolicy::union())
            .field("risk_points", MergePolicy::sum())
            .field("peak_severity", MergePolicy::max())
    }

    #[test]
    fn each_policy_merges_as_declared() {
        let first = Observation::new()
            .with("findings", json!(["missing dpo"]))
            .with("summary", json!("draft"))
            .with("frameworks", json!(["gdpr", "soc2"]))
            .with("risk_points", json!(3))
            .with("peak_severity", json!(2));
        let second = Observation::new()
            .with("findings", json!("no retention policy"))
            .with("summary", json!("final"))
            .with("frameworks", json!(["soc2", "hipaa"]))
            .with("risk_points", json!(4))
            .with("peak_severity", json!(1));

        let merged = merge(&schema(), &state(), &first).expect("first merge");
        let merged = merge(&schema(), &merged, &second).expect("second merge");

        assert_eq!(
            merged.context_value("findings"),
            Some(&json!(["missing dpo", "no retention policy"]))
        );
        assert_eq!(merged.context_value("summary"), Some(&json!("final")));
        assert_eq!(
            merged.context_value("frameworks"),
            Some(&json!(["gdpr", "soc2", "hipaa"]))
        );
        assert_eq!(merged.context_value("risk_points"), Some(&json!(7)));
        assert_eq!(merged.context_value("peak_severity"), Some(&json!(2)));
    }

    #[test]
    fn merge_is_pure_and_deterministic() {
        let base = state();
        let observation = Observation::new()
            .with("findings", json!(["a"]))
            .with("risk_points", json!(1.5));
        let left = merge(&schema(), &base, &observation).expect("left");
        let right = merge(&schema(), &base, &observation).expect("right");
        assert_eq!(left, right);
        assert!(base.accumulated_context().is_empty());
    }

    #[test]
    fn undeclared_fields_reject_the_whole_observation() {
        let observation = Observation::new()
            .with("findings", json!(["a"]))
            .with("mood", json!("happy"));
        let err = merge(&schema(), &state(), &observation).expect_err("undeclared");
        assert_eq!(
            err,
            ContextError::UndeclaredField {
                field: "mood".to_string()
            }
        );
    }

    #[test]
    fn numeric_combiners_reject_non_numbers() {
        let observation = Observation::new().with("risk_points", json!("high"));
        let err = merge(&schema(), &state(), &observation).expect_err("not a number");
        assert!(matches!(err, ContextError::CombineFailed { ref combiner, .. } if combiner == "sum"));
    }

    #[test]
    fn policies_resolve_by_name() {
        assert_eq!(MergePolicy::from_name("union").expect("union").name(), "union");
        assert!(MergePolicy::from_name("median").is_err());
    }
}
