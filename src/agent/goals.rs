use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
}

/// A longer-horizon unit of autonomous work, distinct from a recurring task.
/// Progress only ever moves forward while the goal is active.
#[derive(Debug, Clone, Serialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub category: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub progress: u8,
    pub status: GoalStatus,
    pub steps: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

/// Bounded list of active goals plus the archive of completed ones.
/// Creation past the cap is refused outright rather than evicting.
#[derive(Debug)]
pub struct GoalTracker {
    active: Vec<Goal>,
    completed: Vec<Goal>,
    max_goals: usize,
    created_count: u64,
}

impl GoalTracker {
    pub fn new(max_goals: usize) -> Self {
        Self {
            active: Vec::new(),
            completed: Vec::new(),
            max_goals,
            created_count: 0,
        }
    }

    /// Create a goal, or None when the active list is at capacity.
    pub fn create(&mut self, description: &str, category: &str, priority: u8) -> Option<String> {
        if self.active.len() >= self.max_goals {
            tracing::warn!("Maximum goals ({}) reached, refusing new goal", self.max_goals);
            return None;
        }

        let now = Utc::now();
        let id = format!("goal_{}_{}", now.timestamp(), self.created_count);
        self.created_count += 1;

        self.active.push(Goal {
            id: id.clone(),
            description: description.to_string(),
            category: category.to_string(),
            priority,
            created_at: now,
            progress: 0,
            status: GoalStatus::Active,
            steps: Vec::new(),
            completed_at: None,
            outcome: None,
        });
        tracing::info!("New goal created: {}", description);
        Some(id)
    }

    /// Mark a goal completed and move it to the archive. Returns the
    /// finished record, or None when no active goal has that id (including
    /// the second call for an already-completed goal).
    pub fn complete(&mut self, goal_id: &str, outcome: &str) -> Option<Goal> {
        let index = self.active.iter().position(|g| g.id == goal_id)?;
        let mut goal = self.active.remove(index);
        goal.status = GoalStatus::Completed;
        goal.completed_at = Some(Utc::now());
        goal.outcome = Some(outcome.to_string());
        tracing::info!("Goal completed: {}", goal.description);
        self.completed.push(goal.clone());
        Some(goal)
    }

    /// Append a step note and advance progress (clamped at 100).
    /// Returns the new progress, or None for an unknown goal.
    pub fn advance(&mut self, goal_id: &str, step: &str, increment: u8) -> Option<u8> {
        let goal = self.active.iter_mut().find(|g| g.id == goal_id)?;
        // Step text comes straight from the model; cut on characters, not bytes
        goal.steps.push(truncate_chars(step, 100));
        goal.progress = goal.progress.saturating_add(increment).min(100);
        Some(goal.progress)
    }

    /// The active goal worth working on next.
    pub fn highest_priority_active(&self) -> Option<&Goal> {
        self.active.iter().max_by_key(|g| g.priority)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn active_goals(&self) -> &[Goal] {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_refused_at_cap() {
        let mut tracker = GoalTracker::new(2);
        assert!(tracker.create("first", "general", 5).is_some());
        assert!(tracker.create("second", "general", 5).is_some());
        assert!(tracker.create("third", "general", 5).is_none());
        assert_eq!(tracker.active_count(), 2);
    }

    #[test]
    fn completion_moves_goal_exactly_once() {
        let mut tracker = GoalTracker::new(10);
        let id = tracker.create("learn async rust", "learning", 5).unwrap();

        let done = tracker.complete(&id, "finished the book").unwrap();
        assert_eq!(done.status, GoalStatus::Completed);
        assert_eq!(done.outcome.as_deref(), Some("finished the book"));
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.completed_count(), 1);

        // Second completion of the same id fails
        assert!(tracker.complete(&id, "again").is_none());
    }

    #[test]
    fn progress_is_monotone_and_clamped() {
        let mut tracker = GoalTracker::new(10);
        let id = tracker.create("organize notes", "general", 5).unwrap();

        assert_eq!(tracker.advance(&id, "sorted folder", 40), Some(40));
        assert_eq!(tracker.advance(&id, "tagged files", 40), Some(80));
        assert_eq!(tracker.advance(&id, "wrote index", 40), Some(100));
        // Never goes past 100
        assert_eq!(tracker.advance(&id, "once more", 40), Some(100));

        let goal = tracker.active_goals().first().unwrap();
        assert_eq!(goal.steps.len(), 4);
    }

    #[test]
    fn step_notes_truncate_on_character_boundaries() {
        let mut tracker = GoalTracker::new(10);
        let id = tracker.create("read the archive", "learning", 5).unwrap();

        // A multibyte character straddling the 100-byte mark must not panic
        let step = format!("{}é plus trailing text", "a".repeat(99));
        assert_eq!(tracker.advance(&id, &step, 10), Some(10));

        let note = &tracker.active_goals()[0].steps[0];
        assert_eq!(note.chars().count(), 100);
        assert!(note.ends_with('é'));
    }

    #[test]
    fn highest_priority_wins() {
        let mut tracker = GoalTracker::new(10);
        tracker.create("low", "general", 2).unwrap();
        tracker.create("high", "general", 8).unwrap();
        tracker.create("mid", "general", 5).unwrap();
        assert_eq!(tracker.highest_priority_active().unwrap().description, "high");
    }
}
