mod generate;
mod health;
mod history;

pub use generate::{GenerateRequest, generate};
pub use health::health;
pub use history::{conversation_messages, list_conversations};
