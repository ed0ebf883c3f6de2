//! Semantic tool filter.
//!
//! Ranks an arbitrarily large tool registry against a conversation window
//! and returns a small relevant subset. Without an embedding backend the
//! filter degrades to a stable first-N pass-through and the caller relies
//! on explicit pins.

pub mod embedding;
pub mod index;

pub use embedding::EmbeddingClient;
pub use index::{FilterOptions, FilterOutput, ScoredTool, ServerTools, ToolFilter};
