//! Reusable workflow templates
//!
//! A template is a parameterized workflow definition. Instantiation
//! substitutes `{{param}}` placeholders in task kwargs and submits a fresh
//! workflow; deleting a template never touches instances already submitted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::Condition;
use super::engine::{WorkflowSpec, WorkflowTaskSpec};
use crate::task::DependencyKind;

/// Parameterized workflow definition stored in the broker fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub template_id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub tasks: Vec<WorkflowTaskSpec>,

    /// child node key -> parent node keys
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,

    /// child node key -> dependency kind (wait-for-all when absent)
    #[serde(default)]
    pub kinds: HashMap<String, DependencyKind>,

    /// child node key -> gating condition
    #[serde(default)]
    pub conditions: HashMap<String, Condition>,

    pub created_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowTemplate {
    pub fn new(template_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            tasks: Vec::new(),
            dependencies: HashMap::new(),
            kinds: HashMap::new(),
            conditions: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_task(mut self, task: WorkflowTaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_dependency(
        mut self,
        child: impl Into<String>,
        parents: Vec<String>,
    ) -> Self {
        self.dependencies.insert(child.into(), parents);
        self
    }

    pub fn with_condition(mut self, child: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(child.into(), condition);
        self
    }

    /// Substitute parameters and produce a submittable workflow spec
    ///
    /// A kwarg whose entire value is a `{{param}}` placeholder is replaced by
    /// the parameter value; placeholders without a binding stay as-is.
    pub fn instantiate(
        &self,
        workflow_name: impl Into<String>,
        parameters: &HashMap<String, Value>,
    ) -> WorkflowSpec {
        let tasks = self
            .tasks
            .iter()
            .map(|spec| {
                let mut task = spec.clone();
                for value in task.descriptor.kwargs.values_mut() {
                    if let Some(name) = placeholder_name(value) {
                        if let Some(bound) = parameters.get(name) {
                            *value = bound.clone();
                        }
                    }
                }
                task
            })
            .collect();

        WorkflowSpec {
            name: workflow_name.into(),
            tasks,
            dependencies: self.dependencies.clone(),
            kinds: self.kinds.clone(),
            conditions: self.conditions.clone(),
        }
    }
}

fn placeholder_name(value: &Value) -> Option<&str> {
    let raw = value.as_str()?;
    raw.strip_prefix("{{")?.strip_suffix("}}").map(str::trim)
}
