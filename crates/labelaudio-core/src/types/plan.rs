//! Plan (task graph) definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use super::{Task, TaskId};

/// Structural problems in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("empty plan")]
    EmptyPlan,

    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("task '{0}' references undefined task '{1}'")]
    MissingDependency(String, String),

    #[error("task '{0}' references itself")]
    SelfDependency(String),

    #[error("task graph contains a cycle involving task: {0}")]
    CycleDetected(String),
}

/// A directed acyclic graph of tasks derived from one instruction.
///
/// Edges are implicit: a task that binds an input to another task's output
/// depends on that task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Namespace for everything this plan stores.
    pub run_id: String,
    pub instruction: String,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(instruction: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            run_id: format!("run-{}", uuid::Uuid::new_v4()),
            instruction: instruction.into(),
            tasks,
            created_at: Utc::now(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    pub fn roots(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|task| task.is_root()).collect()
    }

    /// Reverse edges: producer -> consumers, in plan order.
    pub fn dependents(&self) -> HashMap<TaskId, Vec<TaskId>> {
        let mut out: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in &self.tasks {
            out.entry(task.id.clone()).or_default();
            for dep in task.dependencies() {
                out.entry(dep).or_default().push(task.id.clone());
            }
        }
        out
    }

    /// Every task transitively downstream of `id`, breadth first.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let dependents = self.dependents();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([id.clone()]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for next in dependents.get(&current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    out.push(next.clone());
                    queue.push_back(next.clone());
                }
            }
        }
        out
    }

    /// Tasks ordered so every producer precedes its consumers.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, PlanValidationError> {
        let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();
        for task in &self.tasks {
            in_degree.insert(&task.id, task.dependencies().len());
        }
        let dependents = self.dependents();
        let mut queue: VecDeque<&TaskId> = self
            .tasks
            .iter()
            .filter(|task| in_degree.get(&task.id) == Some(&0))
            .map(|task| &task.id)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.clone());
            for next in dependents.get(current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        if let Some(task) = self.get_task(next) {
                            queue.push_back(&task.id);
                        }
                    }
                }
            }
        }
        if order.len() == self.tasks.len() {
            return Ok(order);
        }
        let stuck = self
            .tasks
            .iter()
            .find(|task| !order.contains(&task.id))
            .map(|task| task.id.to_string())
            .unwrap_or_default();
        Err(PlanValidationError::CycleDetected(stuck))
    }

    /// Check ids are unique, references resolve and the graph is acyclic.
    ///
    /// In an acyclic graph every task is reachable from some root, so no
    /// separate reachability pass is needed.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        if self.tasks.is_empty() {
            return Err(PlanValidationError::EmptyPlan);
        }
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanValidationError::DuplicateTaskId(task.id.to_string()));
            }
        }
        for task in &self.tasks {
            for dep in task.dependencies() {
                if dep == task.id {
                    return Err(PlanValidationError::SelfDependency(task.id.to_string()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(PlanValidationError::MissingDependency(
                        task.id.to_string(),
                        dep.to_string(),
                    ));
                }
            }
        }
        self.topological_order().map(|_| ())
    }
}
