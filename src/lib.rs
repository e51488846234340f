pub mod action;
pub mod agent;
pub mod browser;
pub mod conversation;
pub mod coords;
pub mod llm;
pub mod prompt;
pub mod protocol;

pub use agent::{Agent, AgentConfig, AgentError, Task, TaskReport, TaskState};
pub use browser::{Browser, BrowserConfig};
pub use conversation::{Conversation, SubGoal, SubGoalStatus, SubGoalTracker};
pub use llm::{LlmClient, LlmConfig};
pub use protocol::{decode_response, extract_tag, Decision};
