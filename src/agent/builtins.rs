//! Built-in recurring behaviors registered at startup. Each body is a small
//! pass-through over the model backend, knowledge store, and chat history;
//! the scheduler in `agent::mod` owns all failure bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use crate::agent::tasks::{AutonomousTask, TaskBody, TaskContext, TaskError, TaskSnapshot};
use crate::agent::truncate_chars;
use crate::database::KnowledgeStore;

/// Scope id for knowledge that isn't tied to a particular user.
pub const GLOBAL_SCOPE: i64 = 0;
const SELF_TEST_SCOPE: i64 = -1;

const ACTIVITY_CURSOR_STATE_KEY: &str = "activity_last_seen_message_id";
const GOAL_STEP_INCREMENT: u8 = 10;
const GOAL_SPAWN_PROBABILITY: f64 = 0.3;
const HISTORY_RETENTION_DAYS: i64 = 30;

/// The default autonomous task set, with the cadence each behavior wants.
pub fn default_tasks() -> Vec<AutonomousTask> {
    vec![
        AutonomousTask::new(
            "extract_learnings",
            "Extract Learning Points",
            "Analyze recent conversations for learnable facts",
            600,
            5,
            Arc::new(ExtractLearnings),
        ),
        AutonomousTask::new(
            "track_goals",
            "Track and Pursue Goals",
            "Work on active goals and evaluate progress",
            1800,
            5,
            Arc::new(TrackGoals),
        ),
        AutonomousTask::new(
            "monitor_activity",
            "Monitor Chat Activity",
            "Check for new messages that need attention",
            300,
            4,
            Arc::new(MonitorActivity),
        ),
        AutonomousTask::new(
            "offer_suggestions",
            "Offer Proactive Suggestions",
            "Think of ways to be helpful based on context",
            900,
            3,
            Arc::new(OfferSuggestions),
        ),
        AutonomousTask::new(
            "research_topics",
            "Research Interesting Topics",
            "Autonomously research topics worth learning about",
            1800,
            3,
            Arc::new(ResearchTopics),
        ),
        AutonomousTask::new(
            "summarize_conversations",
            "Summarize Long Conversations",
            "Create summaries of lengthy conversations for memory",
            3600,
            2,
            Arc::new(SummarizeConversations),
        ),
        AutonomousTask::new(
            "consolidate_knowledge",
            "Consolidate Knowledge",
            "Organize and deduplicate learned facts",
            3600,
            2,
            Arc::new(ConsolidateKnowledge),
        ),
        AutonomousTask::new(
            "self_test",
            "Test Own Capabilities",
            "Periodically test autonomous functions",
            7200,
            1,
            Arc::new(SelfTest),
        ),
        AutonomousTask::new(
            "prune_history",
            "Prune Old Chat History",
            "Delete conversation history past the retention window",
            86_400,
            1,
            Arc::new(PruneHistory),
        ),
    ]
}

/// Pull one memorable fact out of recent chat history.
pub struct ExtractLearnings;

#[async_trait]
impl TaskBody for ExtractLearnings {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        if !ctx.capabilities.read().await.learn {
            return Ok(());
        }
        let Some(db) = ctx.database.as_ref() else {
            tracing::debug!("Learning extraction skipped: no database");
            return Ok(());
        };

        let messages = db.get_recent_messages(20)?;
        if messages.len() < 5 {
            tracing::debug!("Not enough recent chat to learn from");
            return Ok(());
        }

        let transcript = messages
            .iter()
            .map(|m| format!("{}: {}", m.author, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "You are {}. Here are recent messages from your conversations:\n\n{}\n\n\
             What's one learnable fact about the user or the ongoing work worth remembering? \
             Keep it under 50 words, or answer \"none\".",
            ctx.persona, transcript
        );

        let fact = ctx
            .backend
            .complete(&prompt)
            .await
            .map_err(TaskError::Backend)?;
        let fact = fact.trim();
        if fact.len() > 10 && !fact.to_lowercase().starts_with("none") {
            if ctx.knowledge.record_fact(GLOBAL_SCOPE, fact, "conversation_learning")? {
                tracing::info!("Learned: {}", truncate_chars(fact, 100));
            }
        }
        Ok(())
    }
}

/// Pick a topic, ask the model for one fact about it, remember the fact.
pub struct ResearchTopics;

#[async_trait]
impl TaskBody for ResearchTopics {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        if !ctx.capabilities.read().await.web {
            return Ok(());
        }

        let topic_prompt = format!(
            "You are {}. What's one interesting topic related to AI, technology, or science \
             you'd like to learn more about right now? Answer with just the topic name, nothing else.",
            ctx.persona
        );
        let topic = ctx
            .backend
            .complete(&topic_prompt)
            .await
            .map_err(TaskError::Backend)?;
        let topic = truncate_chars(topic.trim(), 100);
        if topic.len() <= 5 {
            return Ok(());
        }

        tracing::info!("Researching: {}", topic);
        let fact_prompt = format!(
            "Summarize one interesting, concrete fact about '{}' that would be worth remembering. \
             Keep it under 50 words.",
            topic
        );
        let fact = ctx
            .backend
            .complete(&fact_prompt)
            .await
            .map_err(TaskError::Backend)?;
        let fact = fact.trim();
        if fact.len() > 10 {
            if ctx.knowledge.record_fact(GLOBAL_SCOPE, fact, "autonomous_research")? {
                tracing::info!("Learned: {}", truncate_chars(fact, 100));
            } else {
                tracing::debug!("Research fact already known");
            }
        }
        Ok(())
    }
}

/// Condense a long conversation into a remembered summary.
pub struct SummarizeConversations;

#[async_trait]
impl TaskBody for SummarizeConversations {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        let Some(db) = ctx.database.as_ref() else {
            return Ok(());
        };
        if db.count_messages()? < 30 {
            tracing::debug!("Conversation too short to summarize");
            return Ok(());
        }

        let messages = db.get_recent_messages(30)?;
        let transcript = messages
            .iter()
            .map(|m| format!("{}: {}", m.author, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize the following conversation in under 80 words, keeping decisions and \
             open questions:\n\n{}",
            transcript
        );
        let summary = ctx
            .backend
            .complete(&prompt)
            .await
            .map_err(TaskError::Backend)?;
        let summary = summary.trim();
        if summary.len() > 10 {
            ctx.knowledge
                .record_fact(GLOBAL_SCOPE, summary, "conversation_summary")?;
            tracing::info!("Stored conversation summary ({} chars)", summary.len());
        }
        Ok(())
    }
}

/// Ask the model to spot duplicate facts. Review-only: nothing is merged yet.
pub struct ConsolidateKnowledge;

#[async_trait]
impl TaskBody for ConsolidateKnowledge {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        if !ctx.capabilities.read().await.learn {
            return Ok(());
        }

        let facts = ctx.knowledge.list_facts(GLOBAL_SCOPE)?;
        if facts.len() < 10 {
            tracing::debug!("Not enough facts to consolidate yet ({})", facts.len());
            return Ok(());
        }

        let recent = &facts[facts.len().saturating_sub(20)..];
        let numbered = recent
            .iter()
            .enumerate()
            .map(|(i, fact)| format!("{}. {}", i + 1, fact))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Analyze these learned facts and identify any duplicates or highly similar items:\n\n\
             {}\n\nList the numbers of duplicate/similar facts (e.g., \"3 and 7 are duplicates\"). \
             If no duplicates, say \"none\".",
            numbered
        );

        let analysis = ctx
            .backend
            .complete(&prompt)
            .await
            .map_err(TaskError::Backend)?;
        let analysis = analysis.trim();
        if analysis.eq_ignore_ascii_case("none") {
            tracing::debug!("All recent facts are unique");
        } else {
            tracing::info!("Knowledge consolidation: {}", truncate_chars(analysis, 100));
        }
        Ok(())
    }
}

/// Exercise the backend, knowledge store, and state KV end to end.
/// Individual check failures are reported, not propagated: the point is the
/// report, and a flaky backend already shows up through the other tasks.
pub struct SelfTest;

#[async_trait]
impl TaskBody for SelfTest {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        tracing::info!("Running self-tests...");
        let mut passed = 0usize;
        let mut total = 0usize;

        total += 1;
        match tokio::time::timeout(
            Duration::from_secs(10),
            ctx.backend.complete("Reply with OK if you can hear me."),
        )
        .await
        {
            Ok(Ok(reply)) if !reply.trim().is_empty() => {
                passed += 1;
                tracing::debug!("Backend self-test passed");
            }
            _ => tracing::debug!("Backend self-test failed"),
        }

        total += 1;
        let marker = format!("Self-test marker at {}", Utc::now().to_rfc3339());
        let knowledge_ok = ctx
            .knowledge
            .record_fact(SELF_TEST_SCOPE, &marker, "self_test")
            .is_ok()
            && ctx
                .knowledge
                .list_facts(SELF_TEST_SCOPE)
                .map(|facts| facts.iter().any(|f| f == &marker))
                .unwrap_or(false);
        if knowledge_ok {
            passed += 1;
            tracing::debug!("Knowledge self-test passed");
        } else {
            tracing::debug!("Knowledge self-test failed");
        }

        if let Some(db) = ctx.database.as_ref() {
            total += 1;
            let state_ok = db.set_state("self_test_marker", &marker).is_ok()
                && db.get_state("self_test_marker").ok().flatten().as_deref()
                    == Some(marker.as_str());
            if state_ok {
                passed += 1;
                tracing::debug!("State self-test passed");
            } else {
                tracing::debug!("State self-test failed");
            }
        }

        tracing::info!("Self-test complete: {}/{} passed", passed, total);
        Ok(())
    }
}

/// Watch chat history for activity since the last check, via a cursor in
/// the state KV.
pub struct MonitorActivity;

#[async_trait]
impl TaskBody for MonitorActivity {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        if !ctx.capabilities.read().await.message {
            return Ok(());
        }
        let Some(db) = ctx.database.as_ref() else {
            return Ok(());
        };

        let cursor = db
            .get_state(ACTIVITY_CURSOR_STATE_KEY)?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let new_messages = db.count_messages_after(cursor)?;
        if new_messages > 0 {
            tracing::info!("{} new message(s) since last activity check", new_messages);
        } else {
            tracing::debug!("No new chat activity");
        }
        db.set_state(
            ACTIVITY_CURSOR_STATE_KEY,
            &db.latest_message_id()?.to_string(),
        )?;
        Ok(())
    }
}

/// Trim chat history that has aged past the retention window. Learned facts
/// and summaries are untouched; only raw messages age out.
pub struct PruneHistory;

#[async_trait]
impl TaskBody for PruneHistory {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        let Some(db) = ctx.database.as_ref() else {
            return Ok(());
        };
        let cutoff = Utc::now() - chrono::Duration::days(HISTORY_RETENTION_DAYS);
        let deleted = db.delete_messages_before(cutoff)?;
        if deleted > 0 {
            tracing::info!(
                "Pruned {} chat message(s) older than {} days",
                deleted,
                HISTORY_RETENTION_DAYS
            );
        }
        Ok(())
    }
}

/// Proactively drop a helpful suggestion into the chat history.
pub struct OfferSuggestions;

#[async_trait]
impl TaskBody for OfferSuggestions {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        if !ctx.capabilities.read().await.message {
            return Ok(());
        }
        let Some(db) = ctx.database.as_ref() else {
            return Ok(());
        };

        let facts = ctx.knowledge.list_facts(GLOBAL_SCOPE)?;
        let context = if facts.is_empty() {
            "  (nothing yet)".to_string()
        } else {
            facts[facts.len().saturating_sub(5)..]
                .iter()
                .map(|f| format!("  - {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = format!(
            "You are {}, a proactive companion. Recent things you've learned:\n{}\n\n\
             Suggest ONE brief, helpful thing you could tell the user right now, \
             or answer \"nothing\".",
            ctx.persona, context
        );

        let suggestion = ctx
            .backend
            .complete(&prompt)
            .await
            .map_err(TaskError::Backend)?;
        let suggestion = suggestion.trim();
        if suggestion.len() > 10 && !suggestion.to_lowercase().contains("nothing") {
            db.save_message(&ctx.persona, &format!("[suggestion] {}", suggestion))?;
            tracing::info!("Offered suggestion: {}", truncate_chars(suggestion, 80));
        }
        Ok(())
    }
}

/// Advance the highest-priority goal by one model-suggested step, or
/// occasionally spawn a new goal when there are none.
pub struct TrackGoals;

#[async_trait]
impl TaskBody for TrackGoals {
    async fn run(&self, _task: &TaskSnapshot, ctx: &TaskContext) -> Result<(), TaskError> {
        let current = {
            let goals = ctx.goals.lock().await;
            goals.highest_priority_active().cloned()
        };

        let Some(goal) = current else {
            if rand::thread_rng().gen_bool(GOAL_SPAWN_PROBABILITY) {
                spawn_goal(ctx).await?;
            }
            return Ok(());
        };

        let steps = if goal.steps.is_empty() {
            "None yet".to_string()
        } else {
            goal.steps.join(", ")
        };
        let prompt = format!(
            "You are {}. You have this goal: {}\n\nCurrent progress: {}%\nSteps completed: {}\n\n\
             What's ONE specific action you can take right now to make progress? \
             Be brief (under 50 words).",
            ctx.persona, goal.description, goal.progress, steps
        );
        let action = ctx
            .backend
            .complete(&prompt)
            .await
            .map_err(TaskError::Backend)?;
        let action = action.trim();

        if action.len() > 10 && !action.to_lowercase().starts_with("none") {
            tracing::info!("Working on goal: {}", truncate_chars(action, 80));
            let mut goals = ctx.goals.lock().await;
            if let Some(progress) = goals.advance(&goal.id, action, GOAL_STEP_INCREMENT) {
                if progress >= 100 {
                    goals.complete(&goal.id, "Goal achieved through autonomous work");
                }
            }
        }
        Ok(())
    }
}

async fn spawn_goal(ctx: &TaskContext) -> Result<(), TaskError> {
    let prompt = format!(
        "You are {}. Based on your recent activities, what's ONE goal you should pursue?\n\n\
         Examples:\n- Learn more about a specific technology\n- Organize knowledge in a category\n\
         - Improve a specific capability\n- Research a topic in depth\n\n\
         Respond with just the goal description (under 50 words), or \"none\".",
        ctx.persona
    );
    let description = ctx
        .backend
        .complete(&prompt)
        .await
        .map_err(TaskError::Backend)?;
    let description = description.trim();
    if description.len() > 10 && !description.to_lowercase().starts_with("none") {
        ctx.goals.lock().await.create(description, "autonomous", 3);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{make_context, CountingBackend};
    use crate::agent::tasks::Capability;
    use crate::database::KnowledgeStore;

    fn snapshot() -> TaskSnapshot {
        TaskSnapshot {
            id: "test".to_string(),
            name: "test".to_string(),
            description: String::new(),
            interval_secs: 60,
            priority: 5,
            enabled: true,
            is_running: false,
            failure_count: 0,
        }
    }

    #[tokio::test]
    async fn extract_learnings_records_a_fact() {
        let backend = Arc::new(CountingBackend::replying(
            "The user prefers concise answers during code review sessions.",
        ));
        let (ctx, db, _dir) = make_context(backend.clone());
        for i in 0..6 {
            db.save_message("user", &format!("message {}", i)).unwrap();
        }

        ExtractLearnings.run(&snapshot(), &ctx).await.unwrap();

        assert_eq!(backend.calls(), 1);
        let facts = ctx.knowledge.list_facts(GLOBAL_SCOPE).unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].contains("concise answers"));
    }

    #[tokio::test]
    async fn extract_learnings_ignores_none_answers() {
        let backend = Arc::new(CountingBackend::replying("none"));
        let (ctx, db, _dir) = make_context(backend);
        for i in 0..6 {
            db.save_message("user", &format!("message {}", i)).unwrap();
        }

        ExtractLearnings.run(&snapshot(), &ctx).await.unwrap();
        assert!(ctx.knowledge.list_facts(GLOBAL_SCOPE).unwrap().is_empty());
    }

    #[tokio::test]
    async fn research_respects_web_capability() {
        let backend = Arc::new(CountingBackend::replying("Quantum error correction"));
        let (ctx, _db, _dir) = make_context(backend.clone());
        ctx.capabilities.write().await.set(Capability::Web, false);

        ResearchTopics.run(&snapshot(), &ctx).await.unwrap();
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn monitor_activity_moves_the_cursor() {
        let backend = Arc::new(CountingBackend::replying("unused"));
        let (ctx, db, _dir) = make_context(backend);
        db.save_message("user", "ping").unwrap();
        db.save_message("user", "pong").unwrap();

        MonitorActivity.run(&snapshot(), &ctx).await.unwrap();

        let cursor = db.get_state(ACTIVITY_CURSOR_STATE_KEY).unwrap().unwrap();
        assert_eq!(cursor, db.latest_message_id().unwrap().to_string());
    }

    #[tokio::test]
    async fn track_goals_advances_and_completes() {
        let backend = Arc::new(CountingBackend::replying(
            "Draft a short outline of the remaining chapters.",
        ));
        let (ctx, _db, _dir) = make_context(backend);
        let id = {
            let mut goals = ctx.goals.lock().await;
            let id = goals.create("finish the reading list", "learning", 7).unwrap();
            // Bring the goal to the edge of completion
            for i in 0..9 {
                goals.advance(&id, &format!("step {}", i), 10);
            }
            id
        };

        TrackGoals.run(&snapshot(), &ctx).await.unwrap();

        let mut goals = ctx.goals.lock().await;
        assert_eq!(goals.active_count(), 0);
        assert_eq!(goals.completed_count(), 1);
        assert!(goals.complete(&id, "again").is_none());
    }

    #[tokio::test]
    async fn pruning_spares_messages_inside_the_retention_window() {
        let backend = Arc::new(CountingBackend::replying("unused"));
        let (ctx, db, _dir) = make_context(backend);
        db.save_message("user", "fresh").unwrap();
        db.save_message("user", "also fresh").unwrap();

        PruneHistory.run(&snapshot(), &ctx).await.unwrap();
        assert_eq!(db.count_messages().unwrap(), 2);
    }

    #[tokio::test]
    async fn suggestions_land_in_chat_history() {
        let backend = Arc::new(CountingBackend::replying(
            "You could revisit yesterday's notes on the deployment checklist.",
        ));
        let (ctx, db, _dir) = make_context(backend);

        OfferSuggestions.run(&snapshot(), &ctx).await.unwrap();

        let messages = db.get_recent_messages(5).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.starts_with("[suggestion]"));
        assert_eq!(messages[0].author, "Solace");
    }
}
