//! Workflow construction, readiness evaluation, and completion handling
//!
//! A workflow is an immutable set of tasks plus directed edges plus optional
//! per-child conditions. Submission is atomic: a cycle anywhere means nothing
//! is persisted. Completion events drive readiness; each ready child is
//! released exactly once through the store's conditional transition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::condition::Condition;
use super::graph::DependencyGraph;
use crate::broker::Broker;
use crate::error::CoreError;
use crate::events::{AlertEvent, AlertSeverity, CompletionEvent};
use crate::store::{StatusChange, TaskFilter, TaskStore};
use crate::task::{DependencyKind, DlqEntry, Task, TaskDescriptor, TaskStatus};

/// One node of a workflow: a node key plus the task to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTaskSpec {
    /// Node key, unique within the workflow; conditions and edges refer to it
    pub key: String,

    pub descriptor: TaskDescriptor,
}

impl WorkflowTaskSpec {
    pub fn new(key: impl Into<String>, descriptor: TaskDescriptor) -> Self {
        Self {
            key: key.into(),
            descriptor,
        }
    }
}

/// A submittable workflow definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
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
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task: WorkflowTaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_dependency(mut self, child: impl Into<String>, parents: Vec<String>) -> Self {
        self.dependencies.insert(child.into(), parents);
        self
    }

    pub fn with_kind(mut self, child: impl Into<String>, kind: DependencyKind) -> Self {
        self.kinds.insert(child.into(), kind);
        self
    }

    pub fn with_condition(mut self, child: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(child.into(), condition);
        self
    }
}

/// Workflow bookkeeping kept in the broker fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub workflow_id: Uuid,
    pub name: String,

    /// node key -> task id
    pub task_ids: HashMap<String, Uuid>,

    pub dependencies: HashMap<String, Vec<String>>,
    pub kinds: HashMap<String, DependencyKind>,
    pub conditions: HashMap<String, Condition>,

    /// Topological layering for visualization and bulk release
    pub execution_levels: Vec<Vec<String>>,

    pub created_at: DateTime<Utc>,
}

impl WorkflowMeta {
    /// Node key for a task id, if this workflow owns it
    pub fn key_of(&self, task_id: Uuid) -> Option<&str> {
        self.task_ids
            .iter()
            .find(|(_, id)| **id == task_id)
            .map(|(key, _)| key.as_str())
    }
}

/// Result of an atomic workflow submission
#[derive(Debug, Clone)]
pub struct WorkflowSubmission {
    pub workflow_id: Uuid,
    pub task_ids: HashMap<String, Uuid>,
}

/// Aggregate status over a workflow's tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusSummary {
    pub workflow_id: Uuid,
    pub total: usize,
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub progress_percent: f64,
}

/// Builds workflows and reacts to completion events
pub struct WorkflowEngine {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,

    /// Whether submissions may carry the custom retry strategy
    allow_custom_strategy: bool,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            allow_custom_strategy: false,
        }
    }

    /// Accept the custom retry strategy (a custom backoff is plugged in)
    pub fn with_custom_strategy_allowed(mut self, allowed: bool) -> Self {
        self.allow_custom_strategy = allowed;
        self
    }

    /// Atomically submit a workflow: validate, persist all tasks, release roots
    #[instrument(skip(self, spec), fields(workflow = %spec.name))]
    pub async fn submit(&self, spec: WorkflowSpec) -> Result<WorkflowSubmission, CoreError> {
        if spec.tasks.is_empty() {
            return Err(CoreError::InvalidTask("workflow has no tasks".into()));
        }

        let mut graph = DependencyGraph::new();
        let mut keys = HashSet::new();
        for task in &spec.tasks {
            if !keys.insert(task.key.clone()) {
                return Err(CoreError::InvalidTask(format!(
                    "duplicate workflow node key: {}",
                    task.key
                )));
            }
            let parents = spec.dependencies.get(&task.key).cloned().unwrap_or_default();
            for parent in &parents {
                if !spec.tasks.iter().any(|t| &t.key == parent) {
                    return Err(CoreError::InvalidTask(format!(
                        "unknown parent node: {parent}"
                    )));
                }
            }
            let kind = spec.kinds.get(&task.key).copied().unwrap_or_default();
            graph.add_node(task.key.clone(), &parents, kind);
        }

        if let Some(node) = graph.find_cycle() {
            return Err(CoreError::CycleDetected(node));
        }

        for task in &spec.tasks {
            crate::submit::validate_descriptor(&task.descriptor, self.allow_custom_strategy)?;
        }

        let workflow_id = Uuid::now_v7();

        // Materialize tasks, then wire parent ids in a second pass.
        let mut tasks: HashMap<String, Task> = HashMap::new();
        let mut task_ids: HashMap<String, Uuid> = HashMap::new();
        for spec_task in &spec.tasks {
            let mut descriptor = spec_task.descriptor.clone();
            descriptor.workflow_id = Some(workflow_id);
            descriptor.dependency_kind =
                spec.kinds.get(&spec_task.key).copied().unwrap_or_default();
            let task = Task::from_descriptor(descriptor);
            task_ids.insert(spec_task.key.clone(), task.id);
            tasks.insert(spec_task.key.clone(), task);
        }
        for (child, parents) in &spec.dependencies {
            let parent_ids: Vec<Uuid> = parents
                .iter()
                .filter_map(|p| task_ids.get(p).copied())
                .collect();
            if let Some(task) = tasks.get_mut(child) {
                task.descriptor.depends_on = parent_ids;
            }
        }

        let rows: Vec<Task> = spec
            .tasks
            .iter()
            .map(|t| tasks[&t.key].clone())
            .collect();
        self.store.insert_workflow(&rows).await?;

        let meta = WorkflowMeta {
            workflow_id,
            name: spec.name.clone(),
            task_ids: task_ids.clone(),
            dependencies: spec.dependencies.clone(),
            kinds: spec.kinds.clone(),
            conditions: spec.conditions.clone(),
            execution_levels: graph.execution_levels(),
            created_at: Utc::now(),
        };
        self.broker.put_workflow_meta(meta.clone()).await?;

        // Release the roots.
        for key in graph.ready_nodes(&HashSet::new()) {
            let task = &tasks[&key];
            self.gate_and_release(task, Some(&meta)).await?;
        }

        info!(
            %workflow_id,
            tasks = spec.tasks.len(),
            "workflow submitted"
        );

        Ok(WorkflowSubmission {
            workflow_id,
            task_ids,
        })
    }

    /// Instantiate a stored template and submit the result
    pub async fn submit_from_template(
        &self,
        template_id: &str,
        workflow_name: &str,
        parameters: &HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowSubmission, CoreError> {
        let template = self
            .broker
            .template(template_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("template {template_id}")))?;

        self.submit(template.instantiate(workflow_name, parameters))
            .await
    }

    /// React to one completion event: release ready children or propagate
    /// upstream failure
    #[instrument(skip(self), fields(task_id = %event.task_id, status = %event.status))]
    pub async fn handle_completion(&self, event: CompletionEvent) -> Result<(), CoreError> {
        match event.status {
            TaskStatus::Completed => self.release_ready_children(event.task_id).await,
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.propagate_to_children(event.task_id, event.status).await
            }
            _ => Ok(()),
        }
    }

    /// Consume the completion channel until shutdown
    ///
    /// Delivery is best-effort; a lagging subscription logs and keeps going,
    /// and state is recoverable by re-reading the store.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.broker.subscribe_completions();
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle_completion(event).await {
                            error!(task_id = %event.task_id, "completion handling failed: {}", e);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "completion channel lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    debug!("workflow engine: shutdown requested");
                    break;
                }
            }
        }
    }

    /// Aggregate status over one workflow
    pub async fn workflow_status(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowStatusSummary, CoreError> {
        let tasks = self
            .store
            .list_tasks(
                TaskFilter::by_workflow(workflow_id),
                crate::store::Pagination {
                    offset: 0,
                    limit: u32::MAX,
                },
            )
            .await?;

        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let total = tasks.len();
        let completed = count(TaskStatus::Completed);

        Ok(WorkflowStatusSummary {
            workflow_id,
            total,
            pending: count(TaskStatus::Pending),
            queued: count(TaskStatus::Queued),
            running: count(TaskStatus::Running),
            completed,
            failed: count(TaskStatus::Failed),
            cancelled: count(TaskStatus::Cancelled),
            progress_percent: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64 * 100.0
            },
        })
    }

    async fn release_ready_children(&self, parent_id: Uuid) -> Result<(), CoreError> {
        let children = self.store.pending_children_of(parent_id).await?;
        if children.is_empty() {
            return Ok(());
        }

        for child in children {
            let parents = self.fetch_parents(&child).await?;
            if !is_ready(&child, &parents) {
                continue;
            }

            let meta = match child.descriptor.workflow_id {
                Some(wf) => self.broker.workflow_meta(wf).await?,
                None => None,
            };
            self.gate_and_release(&child, meta.as_ref()).await?;
        }
        Ok(())
    }

    /// Condition-gate a ready task, then release it into its queue
    ///
    /// Exactly one caller wins the PENDING -> QUEUED (or skip) transition;
    /// losers observe InvalidTransition and back off.
    async fn gate_and_release(
        &self,
        task: &Task,
        meta: Option<&WorkflowMeta>,
    ) -> Result<(), CoreError> {
        let condition = meta.and_then(|m| {
            m.key_of(task.id)
                .and_then(|key| m.conditions.get(key))
        });

        if let Some(condition) = condition {
            let context = self.condition_context(task, meta).await?;
            if !condition.evaluate(&context) {
                match self.store.skip(task.id).await {
                    Ok(_) => {
                        debug!(task_id = %task.id, "condition false, task skipped");
                        let _ = self
                            .broker
                            .publish_completion(CompletionEvent {
                                task_id: task.id,
                                status: TaskStatus::Completed,
                            })
                            .await;
                    }
                    Err(crate::store::StoreError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                return Ok(());
            }
        }

        match self
            .store
            .transition(task.id, TaskStatus::Pending, StatusChange::Queued)
            .await
        {
            Ok(queued) => {
                self.broker
                    .put_task_meta(queued.id, (&queued).into())
                    .await?;
                self.broker
                    .enqueue(queued.id, queued.descriptor.priority)
                    .await?;
                debug!(task_id = %queued.id, "dependent task released");
                Ok(())
            }
            // Another release already won, or the task was cancelled.
            Err(crate::store::StoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail pending descendants whose required parents terminally failed
    async fn propagate_to_children(
        &self,
        parent_id: Uuid,
        parent_status: TaskStatus,
    ) -> Result<(), CoreError> {
        let mut frontier = VecDeque::from([(parent_id, parent_status)]);

        while let Some((failed_id, failed_status)) = frontier.pop_front() {
            let children = self.store.pending_children_of(failed_id).await?;
            for child in children {
                let parents = self.fetch_parents(&child).await?;
                if !failure_is_fatal(&child, &parents) {
                    continue;
                }

                let reason = match failed_status {
                    TaskStatus::Cancelled => format!("Parent task {failed_id} cancelled"),
                    _ => format!("Parent task {failed_id} failed"),
                };

                match self.store.propagate_failure(child.id, reason.clone()).await {
                    Ok(failed_child) => {
                        warn!(task_id = %failed_child.id, %reason, "upstream failure propagated");

                        let entry = DlqEntry {
                            task_id: failed_child.id,
                            reason,
                            attempts: 0,
                            descriptor: failed_child.descriptor.clone(),
                            dead_at: Utc::now(),
                        };
                        self.store.insert_dlq(&entry).await?;
                        self.broker.push_dlq(&entry).await?;
                        let _ = self
                            .broker
                            .publish_alert(AlertEvent::new(
                                "task.dead_lettered",
                                AlertSeverity::Warning,
                                serde_json::json!({
                                    "task_id": failed_child.id,
                                    "reason": "upstream failure",
                                }),
                            ))
                            .await;

                        // Propagation is transitive.
                        frontier.push_back((failed_child.id, TaskStatus::Failed));
                    }
                    Err(crate::store::StoreError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn fetch_parents(&self, child: &Task) -> Result<Vec<Task>, CoreError> {
        let mut parents = Vec::with_capacity(child.descriptor.depends_on.len());
        for parent_id in &child.descriptor.depends_on {
            parents.push(self.store.get_task(*parent_id).await?);
        }
        Ok(parents)
    }

    /// `{parent-name -> {"result": parent result}}` for condition evaluation
    async fn condition_context(
        &self,
        child: &Task,
        meta: Option<&WorkflowMeta>,
    ) -> Result<serde_json::Value, CoreError> {
        let parents = self.fetch_parents(child).await?;
        let mut context = serde_json::Map::new();
        for parent in &parents {
            let name = meta
                .and_then(|m| m.key_of(parent.id))
                .unwrap_or(&parent.descriptor.name)
                .to_string();
            context.insert(
                name,
                serde_json::json!({
                    "result": parent.result.clone().unwrap_or(serde_json::Value::Null)
                }),
            );
        }
        Ok(serde_json::Value::Object(context))
    }
}

fn is_ready(child: &Task, parents: &[Task]) -> bool {
    if parents.is_empty() {
        return true;
    }
    let completed = |t: &Task| t.status == TaskStatus::Completed;
    match child.descriptor.dependency_kind {
        DependencyKind::WaitForAll | DependencyKind::Sequential => parents.iter().all(completed),
        DependencyKind::WaitForAny => parents.iter().any(completed),
    }
}

/// Whether the child can no longer become ready given its parents' states
fn failure_is_fatal(child: &Task, parents: &[Task]) -> bool {
    if parents.is_empty() {
        return false;
    }
    let dead = |t: &Task| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled);
    match child.descriptor.dependency_kind {
        DependencyKind::WaitForAll | DependencyKind::Sequential => parents.iter().any(dead),
        DependencyKind::WaitForAny => parents.iter().all(dead),
    }
}
