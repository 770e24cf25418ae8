//! Inbox triage: time-boxed LLM classification and filing of recent mail.

pub mod classifier;
pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod server;
