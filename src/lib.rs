pub mod agent;
pub mod config;
pub mod history;
pub mod notify;
pub mod orchestrator;
pub mod query;
pub mod stream;

pub use agent::{AgentClient, AgentTransport, Disconnected, QueryRequest};
pub use config::{AgentConfig, OrchestratorConfig};
pub use history::{ConversationHistory, PersistedTurn};
pub use notify::{LogObserver, NoopObserver, Observers, QueryObserver};
pub use orchestrator::Orchestrator;
