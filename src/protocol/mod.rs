pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod mapping;
pub mod openai_chat;
pub mod openai_responses;
pub mod schema;
pub mod tool_name;
