pub mod agent;
pub mod config;
pub mod database;
pub mod llm_client;
pub mod server;

pub use agent::AutonomousAgent;
pub use config::CompanionConfig;
pub use database::{CompanionDatabase, KnowledgeStore};
pub use llm_client::{LlmClient, ModelBackend};
