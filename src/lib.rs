//! Support agent: classify, answer or escalate customer support email.

pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod mail;
pub mod pipeline;
pub mod store;
