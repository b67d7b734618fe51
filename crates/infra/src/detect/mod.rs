//! Object-detection service adapter.

pub mod client;
pub mod types;

pub use client::HttpDetectionClient;
