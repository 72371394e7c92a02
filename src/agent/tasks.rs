use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::agent::goals::GoalTracker;
use crate::database::{CompanionDatabase, KnowledgeStore};
use crate::llm_client::ModelBackend;

/// Consecutive failures after which a task is auto-disabled until reset.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Failure from a task body, tagged with whether it belongs to the model
/// backend so the scheduler can route it to the circuit breaker without
/// inspecting error text.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("model backend: {0:#}")]
    Backend(#[source] anyhow::Error),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn is_backend(&self) -> bool {
        matches!(self, TaskError::Backend(_))
    }
}

/// Capabilities that gate groups of autonomous behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Web,
    Learn,
    Message,
}

impl FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Capability::Web),
            "learn" => Ok(Capability::Learn),
            "message" => Ok(Capability::Message),
            other => Err(anyhow::anyhow!(
                "Unknown capability '{}'. Expected web, learn, or message",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapabilityFlags {
    pub web: bool,
    pub learn: bool,
    pub message: bool,
}

impl CapabilityFlags {
    pub fn set(&mut self, capability: Capability, enabled: bool) {
        match capability {
            Capability::Web => self.web = enabled,
            Capability::Learn => self.learn = enabled,
            Capability::Message => self.message = enabled,
        }
    }
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self {
            web: true,
            learn: true,
            message: true,
        }
    }
}

/// Everything a task body may touch. Cloning is cheap; all fields are
/// shared handles onto the agent's state.
#[derive(Clone)]
pub struct TaskContext {
    pub backend: Arc<dyn ModelBackend>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub database: Option<Arc<CompanionDatabase>>,
    pub goals: Arc<Mutex<GoalTracker>>,
    pub capabilities: Arc<RwLock<CapabilityFlags>>,
    pub persona: String,
}

/// One recurring unit of autonomous work. Returning `Ok` counts as success;
/// any error counts as a failure. Bodies are expected to unwind cleanly when
/// the enclosing timeout cancels them.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self, task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// Read-only view of a task, handed to bodies and status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub interval_secs: u64,
    pub priority: u8,
    pub enabled: bool,
    pub is_running: bool,
    pub failure_count: u32,
}

pub struct AutonomousTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub interval_secs: u64,
    /// Advisory only; the scheduler never preempts on priority.
    pub priority: u8,
    pub enabled: bool,
    /// None means the task has never run and is due immediately.
    pub last_run: Option<Instant>,
    pub is_running: bool,
    pub failure_count: u32,
    body: Arc<dyn TaskBody>,
}

impl AutonomousTask {
    pub fn new(
        id: &str,
        name: &str,
        description: &str,
        interval_secs: u64,
        priority: u8,
        body: Arc<dyn TaskBody>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            interval_secs,
            priority,
            enabled: true,
            last_run: None,
            is_running: false,
            failure_count: 0,
            body,
        }
    }

    pub fn body(&self) -> Arc<dyn TaskBody> {
        self.body.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            interval_secs: self.interval_secs,
            priority: self.priority,
            enabled: self.enabled,
            is_running: self.is_running,
            failure_count: self.failure_count,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            Some(last) => now.duration_since(last).as_secs() >= self.interval_secs,
            None => true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ResetReport {
    pub reset: usize,
    pub skipped_running: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryCounts {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub running: usize,
}

/// Named recurring tasks, iterated in stable (id) order every tick.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, AutonomousTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite by id; last write wins.
    pub fn register(&mut self, task: AutonomousTask) {
        tracing::info!("Registered autonomous task: {}", task.name);
        self.tasks.insert(task.id.clone(), task);
    }

    /// Returns false when no task had that id.
    pub fn remove(&mut self, task_id: &str) -> bool {
        if self.tasks.remove(task_id).is_some() {
            tracing::info!("Removed autonomous task: {}", task_id);
            true
        } else {
            false
        }
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut AutonomousTask> {
        self.tasks.get_mut(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<&AutonomousTask> {
        self.tasks.get(task_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AutonomousTask> {
        self.tasks.values_mut()
    }

    /// Zero failure counts and re-enable. A running task is never touched —
    /// resetting it would race the in-flight execution's own bookkeeping.
    pub fn reset_failures(&mut self, task_id: Option<&str>) -> ResetReport {
        let mut report = ResetReport::default();
        let targets: Vec<&mut AutonomousTask> = match task_id {
            Some(id) => self.tasks.get_mut(id).into_iter().collect(),
            None => self.tasks.values_mut().collect(),
        };

        for task in targets {
            if task.is_running {
                tracing::warn!("Cannot reset {} - task is currently running", task.id);
                report.skipped_running += 1;
                continue;
            }
            task.failure_count = 0;
            task.enabled = true;
            report.reset += 1;
        }

        tracing::info!(
            "Reset {} task failure count(s) ({} running task(s) skipped)",
            report.reset,
            report.skipped_running
        );
        report
    }

    pub fn counts(&self) -> RegistryCounts {
        let enabled = self.tasks.values().filter(|t| t.enabled).count();
        let running = self.tasks.values().filter(|t| t.is_running).count();
        RegistryCounts {
            total: self.tasks.len(),
            enabled,
            disabled: self.tasks.len() - enabled,
            running,
        }
    }

    pub fn any_running(&self) -> bool {
        self.tasks.values().any(|t| t.is_running)
    }

    pub fn force_clear_running(&mut self) {
        for task in self.tasks.values_mut() {
            task.is_running = false;
        }
    }

    pub fn running_task_names(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.is_running)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn enabled_task_names(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks.values().map(|t| t.snapshot()).collect()
    }

    /// Per-task failure counts for tasks that have failed at least once.
    pub fn failure_counts(&self) -> BTreeMap<String, u32> {
        self.tasks
            .values()
            .filter(|t| t.failure_count > 0)
            .map(|t| (t.id.clone(), t.failure_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopBody;

    #[async_trait]
    impl TaskBody for NoopBody {
        async fn run(&self, _task: &TaskSnapshot, _ctx: &TaskContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn task(id: &str) -> AutonomousTask {
        AutonomousTask::new(id, id, "test task", 60, 5, Arc::new(NoopBody))
    }

    #[test]
    fn register_overwrites_by_id() {
        let mut registry = TaskRegistry::new();
        registry.register(task("a"));
        let mut replacement = task("a");
        replacement.interval_secs = 120;
        registry.register(replacement);

        assert_eq!(registry.counts().total, 1);
        assert_eq!(registry.get("a").unwrap().interval_secs, 120);
    }

    #[test]
    fn remove_is_noop_for_unknown_id() {
        let mut registry = TaskRegistry::new();
        registry.register(task("a"));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
    }

    #[test]
    fn reset_refuses_running_tasks() {
        let mut registry = TaskRegistry::new();
        registry.register(task("busy"));
        registry.register(task("idle"));

        {
            let busy = registry.get_mut("busy").unwrap();
            busy.is_running = true;
            busy.failure_count = 2;
            busy.enabled = false;
        }
        {
            let idle = registry.get_mut("idle").unwrap();
            idle.failure_count = 3;
            idle.enabled = false;
        }

        let report = registry.reset_failures(None);
        assert_eq!(report.reset, 1);
        assert_eq!(report.skipped_running, 1);
        assert_eq!(registry.get("busy").unwrap().failure_count, 2);
        assert!(!registry.get("busy").unwrap().enabled);
        assert_eq!(registry.get("idle").unwrap().failure_count, 0);
        assert!(registry.get("idle").unwrap().enabled);

        // Targeted reset of the running task is also refused
        let report = registry.reset_failures(Some("busy"));
        assert_eq!(report.reset, 0);
        assert_eq!(report.skipped_running, 1);
    }

    #[test]
    fn never_run_tasks_are_due() {
        let t = task("fresh");
        assert!(t.is_due(Instant::now()));

        let mut ran = task("ran");
        let now = Instant::now();
        ran.last_run = Some(now);
        assert!(!ran.is_due(now + Duration::from_secs(59)));
        assert!(ran.is_due(now + Duration::from_secs(60)));
    }
}
