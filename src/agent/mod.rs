//! The autonomous agent: a tick loop that runs registered background tasks,
//! guarded by per-task failure counts and a circuit breaker around the model
//! backend, plus a periodic free-form decision cycle.

pub mod actions;
pub mod builtins;
pub mod circuit;
pub mod goals;
pub mod performance;
pub mod tasks;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CompanionConfig;
use crate::database::{CompanionDatabase, KnowledgeStore};
use crate::llm_client::ModelBackend;

use actions::{ActionEntry, ActionLog};
use circuit::CircuitBreaker;
use goals::{Goal, GoalTracker};
use performance::{tuned_interval, PerformanceTracker};
use tasks::{
    AutonomousTask, Capability, CapabilityFlags, ResetReport, TaskBody, TaskContext,
    TaskRegistry, TaskSnapshot, MAX_CONSECUTIVE_FAILURES,
};

/// Char-safe prefix, since model output can be arbitrary UTF-8.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Scheduler knobs, resolved once at construction.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub persona: String,
    pub tick_interval: Duration,
    pub task_timeout: Duration,
    pub decision_interval: Duration,
    pub decision_timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub max_goals: usize,
    pub action_log_capacity: usize,
    pub optimization_enabled: bool,
    pub shutdown_timeout: Duration,
    pub capabilities: CapabilityFlags,
}

impl AgentSettings {
    pub fn from_config(config: &CompanionConfig) -> Self {
        Self {
            persona: config.persona_name.clone(),
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            decision_interval: Duration::from_secs(config.decision_interval_secs),
            decision_timeout: Duration::from_secs(config.decision_timeout_secs),
            breaker_threshold: config.breaker_failure_threshold,
            breaker_cooldown: Duration::from_secs(config.breaker_cooldown_secs),
            max_goals: config.max_goals,
            action_log_capacity: config.action_log_capacity,
            optimization_enabled: config.optimization_enabled,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            capabilities: CapabilityFlags {
                web: config.allow_web_research,
                learn: config.allow_learning,
                message: config.allow_messaging,
            },
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&CompanionConfig::default())
    }
}

/// Point-in-time view of the agent for the control API and logs.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub disabled_tasks: usize,
    pub currently_running: usize,
    pub running_task_names: Vec<String>,
    pub failed_tasks: BTreeMap<String, u32>,
    pub circuit_breaker_open: bool,
    pub active_goals: usize,
    pub completed_goals: usize,
    pub recent_actions: Vec<ActionEntry>,
}

pub struct AutonomousAgent {
    settings: AgentSettings,
    backend: Arc<dyn ModelBackend>,
    knowledge: Arc<dyn KnowledgeStore>,
    database: Option<Arc<CompanionDatabase>>,
    registry: Arc<RwLock<TaskRegistry>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    performance: Arc<Mutex<PerformanceTracker>>,
    goals: Arc<Mutex<GoalTracker>>,
    actions: Arc<Mutex<ActionLog>>,
    capabilities: Arc<RwLock<CapabilityFlags>>,
    running: AtomicBool,
    /// Held for the duration of one decision cycle so cycles never overlap.
    decision_lock: Arc<Mutex<()>>,
    decision_handle: Mutex<Option<JoinHandle<()>>>,
    /// true whenever the loop is not executing; stop() waits on this.
    loop_exited: watch::Sender<bool>,
}

impl AutonomousAgent {
    pub fn new(
        settings: AgentSettings,
        backend: Arc<dyn ModelBackend>,
        knowledge: Arc<dyn KnowledgeStore>,
        database: Option<Arc<CompanionDatabase>>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            "model backend",
            settings.breaker_threshold,
            settings.breaker_cooldown,
        );
        let goals = GoalTracker::new(settings.max_goals);
        let actions = ActionLog::new(settings.action_log_capacity);
        let capabilities = settings.capabilities;
        let (loop_exited, _) = watch::channel(true);

        Self {
            settings,
            backend,
            knowledge,
            database,
            registry: Arc::new(RwLock::new(TaskRegistry::new())),
            breaker: Arc::new(Mutex::new(breaker)),
            performance: Arc::new(Mutex::new(PerformanceTracker::new())),
            goals: Arc::new(Mutex::new(goals)),
            actions: Arc::new(Mutex::new(actions)),
            capabilities: Arc::new(RwLock::new(capabilities)),
            running: AtomicBool::new(false),
            decision_lock: Arc::new(Mutex::new(())),
            decision_handle: Mutex::new(None),
            loop_exited,
        }
    }

    pub async fn register_default_tasks(&self) {
        let mut registry = self.registry.write().await;
        for task in builtins::default_tasks() {
            registry.register(task);
        }
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            backend: self.backend.clone(),
            knowledge: self.knowledge.clone(),
            database: self.database.clone(),
            goals: self.goals.clone(),
            capabilities: self.capabilities.clone(),
            persona: self.settings.persona.clone(),
        }
    }

    /// Main scheduler loop. Idempotent: a second call while the loop is live
    /// logs a warning and returns immediately.
    pub async fn run_loop(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Agent loop already running");
            return;
        }
        let _ = self.loop_exited.send(false);
        tracing::info!(
            "Autonomous agent started (tick every {}s)",
            self.settings.tick_interval.as_secs()
        );

        let mut last_decision: Option<Instant> = None;
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            Arc::clone(&self).run_tick(now).await;

            let decision_due = match last_decision {
                Some(at) => now.duration_since(at) >= self.settings.decision_interval,
                None => true,
            };
            if decision_due {
                // Stamped whether or not a cycle actually starts, so a busy
                // or gated cycle doesn't retrigger on the very next tick.
                last_decision = Some(now);
                Arc::clone(&self).maybe_spawn_decision(now).await;
            }

            tokio::time::sleep(self.settings.tick_interval).await;
        }

        tracing::info!("Autonomous agent loop exited");
        let _ = self.loop_exited.send(true);
    }

    /// One pass over the registry: collect due tasks under the lock, then
    /// spawn each body so a slow task never stalls the loop.
    async fn run_tick(self: Arc<Self>, now: Instant) {
        let mut due: Vec<(TaskSnapshot, Arc<dyn TaskBody>)> = Vec::new();
        {
            let mut registry = self.registry.write().await;
            let mut breaker = self.breaker.lock().await;
            for task in registry.iter_mut() {
                if !task.enabled {
                    continue;
                }
                if task.is_running {
                    tracing::debug!("Task {} is still running, skipping", task.id);
                    continue;
                }
                if task.failure_count >= MAX_CONSECUTIVE_FAILURES {
                    tracing::warn!(
                        "Task {} disabled after {} consecutive failures",
                        task.name,
                        task.failure_count
                    );
                    task.enabled = false;
                    task.last_run = Some(now);
                    continue;
                }
                if !task.is_due(now) {
                    continue;
                }
                if !breaker.allow(now) {
                    // Consume this slot; the task waits a full interval.
                    task.last_run = Some(now);
                    continue;
                }
                task.is_running = true;
                due.push((task.snapshot(), task.body()));
            }
        }

        for (snapshot, body) in due {
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                agent.execute_task(snapshot, body, now).await;
            });
        }
    }

    /// Run one task body under the global timeout and record the outcome.
    /// Bookkeeping at the tail runs on every path: `last_run` is stamped to
    /// the tick that launched the task, and the running flag always clears.
    async fn execute_task(
        self: Arc<Self>,
        task: TaskSnapshot,
        body: Arc<dyn TaskBody>,
        started: Instant,
    ) {
        tracing::info!("Running autonomous task: {}", task.name);
        // The body runs in its own spawned task so a panic inside it unwinds
        // there and surfaces as a JoinError; the bookkeeping below must run
        // no matter how the body exits.
        let mut run = {
            let task = task.clone();
            let ctx = self.task_context();
            tokio::spawn(async move { body.run(&task, &ctx).await })
        };
        let outcome = tokio::time::timeout(self.settings.task_timeout, &mut run).await;
        let elapsed = started.elapsed().as_secs_f64();

        let success = matches!(outcome, Ok(Ok(Ok(()))));
        let entry = match outcome {
            Ok(Ok(Ok(()))) => {
                self.breaker.lock().await.record_success();
                self.performance.lock().await.record(&task.id, true, elapsed);
                tracing::info!("Task {} completed in {:.1}s", task.name, elapsed);
                ActionEntry::success(&task.name)
            }
            Ok(Ok(Err(err))) => {
                if err.is_backend() {
                    self.breaker.lock().await.record_failure(Instant::now());
                }
                self.performance.lock().await.record(&task.id, false, elapsed);
                tracing::error!("Task {} failed: {}", task.name, err);
                ActionEntry::failed(&task.name, &err.to_string())
            }
            Ok(Err(join_error)) => {
                self.performance.lock().await.record(&task.id, false, elapsed);
                tracing::error!("Task {} panicked: {}", task.name, join_error);
                ActionEntry::failed(&task.name, &format!("task panicked: {}", join_error))
            }
            Err(_) => {
                run.abort();
                self.breaker.lock().await.record_failure(Instant::now());
                self.performance.lock().await.record(
                    &task.id,
                    false,
                    self.settings.task_timeout.as_secs_f64(),
                );
                tracing::error!(
                    "Task {} timed out after {}s",
                    task.name,
                    self.settings.task_timeout.as_secs()
                );
                ActionEntry::timeout(&task.name, self.settings.task_timeout)
            }
        };
        self.actions.lock().await.push(entry);

        let mut registry = self.registry.write().await;
        if let Some(t) = registry.get_mut(&task.id) {
            if success {
                t.failure_count = 0;
            } else {
                t.failure_count += 1;
            }
            t.last_run = Some(started);
            t.is_running = false;
        }
    }

    /// Start a decision cycle unless one is already in flight or the model
    /// backend is gated. A previous cycle that is somehow still unfinished
    /// gets cancelled before the new one starts.
    async fn maybe_spawn_decision(self: Arc<Self>, now: Instant) {
        if self.decision_lock.try_lock().is_err() {
            tracing::debug!("Decision cycle still in progress, skipping");
            return;
        }
        if !self.breaker.lock().await.allow(now) {
            tracing::debug!("Model backend circuit open, skipping decision cycle");
            return;
        }

        let mut slot = self.decision_handle.lock().await;
        if let Some(handle) = slot.take() {
            if !handle.is_finished() {
                tracing::warn!("Cancelling lingering decision cycle");
                handle.abort();
            }
            let _ = handle.await;
        }

        let agent = Arc::clone(&self);
        *slot = Some(tokio::spawn(async move {
            agent.make_decision().await;
        }));
    }

    /// Ask the model whether anything proactive is worth doing, based on the
    /// recent action log. Only substantive answers are recorded.
    async fn make_decision(self: Arc<Self>) {
        let _guard = self.decision_lock.lock().await;

        let enabled = self.registry.read().await.enabled_task_names();
        if enabled.is_empty() {
            return;
        }

        let recent = self.actions.lock().await.recent(5);
        let recent_lines = if recent.is_empty() {
            "  (no recent activity)".to_string()
        } else {
            recent
                .iter()
                .map(|a| match &a.detail {
                    Some(detail) => format!(
                        "  - {} [{}]: {}",
                        a.name,
                        a.status.as_str(),
                        truncate_chars(detail, 80)
                    ),
                    None => format!("  - {} [{}]", a.name, a.status.as_str()),
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "You are {}, an autonomous AI companion. Recent activity:\n{}\n\n\
             Available behaviors: {}\n\n\
             Is there anything proactive worth doing right now beyond the scheduled work? \
             Answer in one sentence, or say \"nothing\".",
            self.settings.persona,
            recent_lines,
            enabled.join(", ")
        );

        match tokio::time::timeout(self.settings.decision_timeout, self.backend.complete(&prompt))
            .await
        {
            Ok(Ok(reply)) => {
                let decision = reply.trim();
                if decision.len() > 10 && !decision.to_lowercase().contains("nothing") {
                    let decision = truncate_chars(decision, 200);
                    tracing::info!("Autonomous decision: {}", decision);
                    self.actions
                        .lock()
                        .await
                        .push(ActionEntry::decided("autonomous_decision", &decision));
                }
            }
            Ok(Err(e)) => {
                self.breaker.lock().await.record_failure(Instant::now());
                tracing::warn!("Decision cycle failed: {:#}", e);
            }
            Err(_) => {
                self.breaker.lock().await.record_failure(Instant::now());
                tracing::warn!(
                    "Decision cycle timed out after {}s",
                    self.settings.decision_timeout.as_secs()
                );
            }
        }
    }

    /// Stop the loop. With `wait_for_tasks`, in-flight tasks get up to the
    /// shutdown timeout to finish before their running flags are cleared by
    /// force; without it, the flags are cleared immediately.
    pub async fn stop(&self, wait_for_tasks: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Agent loop is not running");
            return;
        }
        tracing::info!("Stopping autonomous agent...");

        if let Some(handle) = self.decision_handle.lock().await.take() {
            handle.abort();
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }

        if wait_for_tasks {
            let deadline = Instant::now() + self.settings.shutdown_timeout;
            while self.registry.read().await.any_running() {
                if Instant::now() >= deadline {
                    tracing::warn!("Shutdown timeout reached, force-clearing running task flags");
                    self.registry.write().await.force_clear_running();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        } else {
            self.registry.write().await.force_clear_running();
        }

        let mut exited = self.loop_exited.subscribe();
        let acknowledged =
            tokio::time::timeout(Duration::from_secs(5), exited.wait_for(|done| *done)).await;
        if !matches!(acknowledged, Ok(Ok(_))) {
            tracing::warn!("Agent loop did not acknowledge shutdown within 5s");
        }
        tracing::info!("Autonomous agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- Control surface ----

    pub async fn register_task(&self, task: AutonomousTask) {
        self.registry.write().await.register(task);
    }

    pub async fn remove_task(&self, task_id: &str) -> bool {
        self.registry.write().await.remove(task_id)
    }

    pub async fn reset_failures(&self, task_id: Option<&str>) -> ResetReport {
        self.registry.write().await.reset_failures(task_id)
    }

    pub async fn set_capability(&self, capability: Capability, enabled: bool) {
        self.capabilities.write().await.set(capability, enabled);
        tracing::info!("Capability {:?} set to {}", capability, enabled);
    }

    pub async fn create_goal(
        &self,
        description: &str,
        category: &str,
        priority: u8,
    ) -> Option<String> {
        self.goals.lock().await.create(description, category, priority)
    }

    pub async fn complete_goal(&self, goal_id: &str, outcome: &str) -> Option<Goal> {
        self.goals.lock().await.complete(goal_id, outcome)
    }

    pub async fn active_goals(&self) -> Vec<Goal> {
        self.goals.lock().await.active_goals().to_vec()
    }

    pub async fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.registry.read().await.snapshots()
    }

    pub async fn recent_actions(&self, n: usize) -> Vec<ActionEntry> {
        self.actions.lock().await.recent(n)
    }

    /// Apply interval self-tuning to every task with enough history.
    /// Returns (task id, old interval, new interval) for each change.
    pub async fn optimize_task_intervals(&self) -> Vec<(String, u64, u64)> {
        if !self.settings.optimization_enabled {
            tracing::debug!("Interval optimization is disabled");
            return Vec::new();
        }

        let performance = self.performance.lock().await;
        let mut registry = self.registry.write().await;
        let mut applied = Vec::new();
        for task in registry.iter_mut() {
            let Some(record) = performance.get(&task.id) else {
                continue;
            };
            if let Some(new_interval) = tuned_interval(record, task.interval_secs) {
                if new_interval != task.interval_secs {
                    tracing::info!(
                        "Tuned {} interval: {}s -> {}s",
                        task.id,
                        task.interval_secs,
                        new_interval
                    );
                    applied.push((task.id.clone(), task.interval_secs, new_interval));
                    task.interval_secs = new_interval;
                }
            }
        }
        applied
    }

    pub async fn status(&self) -> AgentStatus {
        let registry = self.registry.read().await;
        let counts = registry.counts();
        let goals = self.goals.lock().await;
        AgentStatus {
            running: self.is_running(),
            total_tasks: counts.total,
            active_tasks: counts.enabled,
            disabled_tasks: counts.disabled,
            currently_running: counts.running,
            running_task_names: registry.running_task_names(),
            failed_tasks: registry.failure_counts(),
            circuit_breaker_open: self.breaker.lock().await.is_open(),
            active_goals: goals.active_count(),
            completed_goals: goals.completed_count(),
            recent_actions: self.actions.lock().await.recent(10),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted model backend that counts how often it was called.
    pub struct CountingBackend {
        reply: String,
        fail: bool,
        calls: AtomicUsize,
    }

    impl CountingBackend {
        pub fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: String::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelBackend for CountingBackend {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("connection refused"))
            } else {
                Ok(self.reply.clone())
            }
        }

        async fn complete_with_image(&self, prompt: &str, _image: &[u8]) -> anyhow::Result<String> {
            self.complete(prompt).await
        }
    }

    pub fn make_context(
        backend: Arc<CountingBackend>,
    ) -> (TaskContext, Arc<CompanionDatabase>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CompanionDatabase::new(dir.path().join("test.db")).unwrap());
        let ctx = TaskContext {
            backend,
            knowledge: db.clone(),
            database: Some(db.clone()),
            goals: Arc::new(Mutex::new(GoalTracker::new(10))),
            capabilities: Arc::new(RwLock::new(CapabilityFlags::default())),
            persona: "Solace".to_string(),
        };
        (ctx, db, dir)
    }

    pub fn make_agent(
        settings: AgentSettings,
        backend: Arc<dyn ModelBackend>,
    ) -> (Arc<AutonomousAgent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CompanionDatabase::new(dir.path().join("agent.db")).unwrap());
        let agent = Arc::new(AutonomousAgent::new(settings, backend, db.clone(), Some(db)));
        (agent, dir)
    }
}
