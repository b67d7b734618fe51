//! Risk-analysis (LLM) service adapter.

pub mod client;
pub mod types;

pub use client::LlmAnalysisClient;
