//! Embedding index over the ingested tool registry.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::embedding::{cosine, EmbeddingClient};
use crate::config::FilterConfig;
use crate::mcp::protocol::Tool;
use crate::{Error, Result};

/// Degraded mode returns at most this many tools.
const DEGRADED_LIMIT: usize = 120;

/// Embedding batch size per backend call.
const BATCH_SIZE: usize = 64;

/// One server's tool set, as submitted to `initialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerTools {
    /// Server id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Tools advertised by the server
    pub tools: Vec<Tool>,
}

/// Conversation message submitted to `filter`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    /// `user`, `assistant`, or `tool`
    #[serde(default)]
    pub role: String,
    /// Message content: a string or a structured content array
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    /// Flatten the content into plain text.
    fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| {
                    item.get("text")
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                })
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

/// Per-call overrides of the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    /// Maximum tools returned
    pub top_k: Option<usize>,
    /// Minimum cosine score
    pub min_score: Option<f32>,
    /// Number of most recent messages used as context
    pub context_messages: Option<usize>,
    /// Cap on context size in estimated tokens
    pub max_context_tokens: Option<usize>,
}

/// A tool with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredTool {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input JSON Schema
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Owning server id
    #[serde(rename = "serverId")]
    pub server_id: String,
    /// Owning server name
    #[serde(rename = "serverName", skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Cosine score; pinned tools carry 1.0
    pub score: f32,
}

/// Timing and sizing metrics for one `filter` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMetrics {
    /// End-to-end milliseconds
    pub total_time: u64,
    /// Milliseconds spent embedding the context
    pub embedding_time: u64,
    /// Milliseconds spent scoring and sorting
    pub scoring_time: u64,
    /// Estimated tokens in the embedded context
    pub context_tokens: usize,
    /// True when no embedding backend is configured
    pub degraded: bool,
}

/// `filter` result: ordered tools plus metrics.
#[derive(Debug, Clone, Serialize)]
pub struct FilterOutput {
    /// Ordered relevant subset
    pub tools: Vec<ScoredTool>,
    /// Call metrics
    pub metrics: FilterMetrics,
}

struct IndexedTool {
    name: String,
    description: Option<String>,
    input_schema: Value,
    server_id: String,
    server_name: Option<String>,
    embedding: Option<Vec<f32>>,
}

struct IndexState {
    /// Insertion order preserved for degraded-mode stability
    tools: Vec<IndexedTool>,
    by_name: HashMap<String, usize>,
}

/// The tool filter index. `initialize` fully replaces the membership.
pub struct ToolFilter {
    embeddings: Option<EmbeddingClient>,
    defaults: FilterConfig,
    state: RwLock<Option<IndexState>>,
}

impl ToolFilter {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            embeddings: EmbeddingClient::from_config(config),
            defaults: config.clone(),
            state: RwLock::new(None),
        }
    }

    /// Ingest the registry, replacing any previous index. Duplicate tool
    /// names keep the first occurrence; later ones are dropped with a
    /// warning.
    pub async fn initialize(&self, servers: Vec<ServerTools>) -> Result<usize> {
        let mut tools = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for server in servers {
            for tool in server.tools {
                if by_name.contains_key(&tool.name) {
                    warn!(tool = %tool.name, server = %server.id, "Duplicate tool name dropped");
                    continue;
                }
                by_name.insert(tool.name.clone(), tools.len());
                tools.push(IndexedTool {
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    server_id: server.id.clone(),
                    server_name: server.name.clone(),
                    embedding: None,
                });
            }
        }

        if let Some(ref client) = self.embeddings {
            let inputs: Vec<String> = tools
                .iter()
                .map(|t| match &t.description {
                    Some(description) => format!("{} {description}", t.name),
                    None => t.name.clone(),
                })
                .collect();

            for (batch_start, chunk) in inputs.chunks(BATCH_SIZE).enumerate() {
                let vectors = client.embed(chunk).await?;
                for (offset, vector) in vectors.into_iter().enumerate() {
                    tools[batch_start * BATCH_SIZE + offset].embedding = Some(vector);
                }
            }
        }

        let count = tools.len();
        *self.state.write() = Some(IndexState { tools, by_name });
        debug!(tools = count, "Tool filter index rebuilt");
        Ok(count)
    }

    /// Drop the index; the next `filter` fails until `initialize` runs again.
    pub fn clear(&self) {
        *self.state.write() = None;
    }

    /// Select a relevant subset for the conversation window.
    ///
    /// # Errors
    ///
    /// `FilterNotInitialized` when `initialize` has not run.
    pub async fn filter(
        &self,
        messages: &[ChatMessage],
        options: &FilterOptions,
        pins: &[String],
    ) -> Result<FilterOutput> {
        let started = Instant::now();

        {
            let state = self.state.read();
            if state.is_none() {
                return Err(Error::FilterNotInitialized);
            }
        }

        let top_k = options.top_k.unwrap_or(self.defaults.top_k);
        let min_score = options.min_score.unwrap_or(self.defaults.min_score);
        let context_messages = options
            .context_messages
            .unwrap_or(self.defaults.context_messages);
        let max_context_tokens = options
            .max_context_tokens
            .unwrap_or(self.defaults.max_context_tokens);

        let Some(ref client) = self.embeddings else {
            return Ok(self.degraded(pins));
        };

        // Context: the most recent messages, tail-truncated to the token cap.
        let mut context = messages
            .iter()
            .rev()
            .take(context_messages)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(ChatMessage::text)
            .collect::<Vec<_>>()
            .join("\n");
        let max_chars = max_context_tokens * 4;
        if context.len() > max_chars {
            let cut = context.len() - max_chars;
            // Keep the most recent end of the window
            context = context
                .char_indices()
                .find(|(i, _)| *i >= cut)
                .map_or_else(String::new, |(i, _)| context[i..].to_string());
        }
        let context_tokens = context.len().div_ceil(4);

        let embed_started = Instant::now();
        let context_embedding = client
            .embed(std::slice::from_ref(&context))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("empty embeddings response".to_string()))?;
        let embedding_time = elapsed_ms(embed_started);

        let scoring_started = Instant::now();
        let state = self.state.read();
        let state = state.as_ref().ok_or(Error::FilterNotInitialized)?;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut result: Vec<ScoredTool> = Vec::new();

        // Pins bypass scoring and lead the result in submission order.
        for pin in pins {
            if let Some(&idx) = state.by_name.get(pin) {
                if seen.insert(state.tools[idx].name.as_str()) {
                    result.push(scored(&state.tools[idx], 1.0));
                }
            }
        }

        let mut scored_tools: Vec<(f32, &IndexedTool)> = state
            .tools
            .iter()
            .filter(|tool| !seen.contains(tool.name.as_str()))
            .filter_map(|tool| {
                let embedding = tool.embedding.as_ref()?;
                let score = cosine(&context_embedding, embedding);
                (score >= min_score).then_some((score, tool))
            })
            .collect();

        // Descending score; ties broken by shorter then lexicographic name
        // for determinism.
        scored_tools.sort_by(|(score_a, tool_a), (score_b, tool_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tool_a.name.len().cmp(&tool_b.name.len()))
                .then_with(|| tool_a.name.cmp(&tool_b.name))
        });

        for (score, tool) in scored_tools.into_iter().take(top_k) {
            result.push(scored(tool, score));
        }
        let scoring_time = elapsed_ms(scoring_started);

        Ok(FilterOutput {
            tools: result,
            metrics: FilterMetrics {
                total_time: elapsed_ms(started),
                embedding_time,
                scoring_time,
                context_tokens,
                degraded: false,
            },
        })
    }

    /// No backend: first tools in ingestion order, pins leading.
    fn degraded(&self, pins: &[String]) -> FilterOutput {
        let state = self.state.read();
        let state = state.as_ref().expect("checked by caller");

        let mut seen: HashSet<&str> = HashSet::new();
        let mut tools: Vec<ScoredTool> = Vec::new();

        for pin in pins {
            if let Some(&idx) = state.by_name.get(pin) {
                if seen.insert(state.tools[idx].name.as_str()) {
                    tools.push(scored(&state.tools[idx], 1.0));
                }
            }
        }

        for tool in &state.tools {
            if tools.len() >= DEGRADED_LIMIT {
                break;
            }
            if seen.insert(tool.name.as_str()) {
                tools.push(scored(tool, 0.0));
            }
        }

        FilterOutput {
            tools,
            metrics: FilterMetrics {
                total_time: 0,
                embedding_time: 0,
                scoring_time: 0,
                context_tokens: 0,
                degraded: true,
            },
        }
    }
}

fn scored(tool: &IndexedTool, score: f32) -> ScoredTool {
    ScoredTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
        server_id: tool.server_id.clone(),
        server_name: tool.server_name.clone(),
        score,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(instant: Instant) -> u64 {
    instant.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: Some(format!("{name} description")),
            input_schema: json!({"type": "object"}),
        }
    }

    fn servers(counts: &[(&str, usize)]) -> Vec<ServerTools> {
        counts
            .iter()
            .map(|(id, n)| ServerTools {
                id: (*id).to_string(),
                name: Some((*id).to_string()),
                tools: (0..*n).map(|i| tool(&format!("{id}_tool_{i}"))).collect(),
            })
            .collect()
    }

    fn degraded_filter() -> ToolFilter {
        // No embeddings endpoint configured
        ToolFilter::new(&FilterConfig::default())
    }

    // =========================================================================
    // Initialization and membership
    // =========================================================================

    #[tokio::test]
    async fn filter_before_initialize_is_rejected() {
        let filter = degraded_filter();
        let err = filter
            .filter(&[], &FilterOptions::default(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "FilterNotInitialized");
    }

    #[tokio::test]
    async fn duplicates_keep_first() {
        let filter = degraded_filter();
        let mut batch = servers(&[("a", 1)]);
        batch.push(ServerTools {
            id: "b".to_string(),
            name: None,
            tools: vec![tool("a_tool_0")],
        });

        let count = filter.initialize(batch).await.unwrap();
        assert_eq!(count, 1);

        let output = filter
            .filter(&[], &FilterOptions::default(), &[])
            .await
            .unwrap();
        assert_eq!(output.tools.len(), 1);
        assert_eq!(output.tools[0].server_id, "a");
    }

    #[tokio::test]
    async fn initialize_fully_replaces() {
        let filter = degraded_filter();
        filter.initialize(servers(&[("old", 3)])).await.unwrap();
        filter.initialize(servers(&[("new", 2)])).await.unwrap();

        let output = filter
            .filter(&[], &FilterOptions::default(), &[])
            .await
            .unwrap();
        assert_eq!(output.tools.len(), 2);
        assert!(output.tools.iter().all(|t| t.server_id == "new"));
    }

    #[tokio::test]
    async fn clear_drops_the_index() {
        let filter = degraded_filter();
        filter.initialize(servers(&[("a", 1)])).await.unwrap();
        filter.clear();

        let err = filter
            .filter(&[], &FilterOptions::default(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "FilterNotInitialized");
    }

    // =========================================================================
    // Degraded mode
    // =========================================================================

    #[tokio::test]
    async fn degraded_returns_first_120_stable() {
        let filter = degraded_filter();
        filter.initialize(servers(&[("big", 500)])).await.unwrap();

        let first = filter
            .filter(&[], &FilterOptions::default(), &[])
            .await
            .unwrap();
        let second = filter
            .filter(&[], &FilterOptions::default(), &[])
            .await
            .unwrap();

        assert_eq!(first.tools.len(), 120);
        assert!(first.metrics.degraded);
        assert_eq!(first.metrics.total_time, 0);

        // Unique names, stable order
        let names: Vec<_> = first.tools.iter().map(|t| t.name.clone()).collect();
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        let second_names: Vec<_> = second.tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, second_names);
    }

    #[tokio::test]
    async fn degraded_pins_lead_in_submission_order() {
        let filter = degraded_filter();
        filter.initialize(servers(&[("s", 200)])).await.unwrap();

        let pins = vec!["s_tool_150".to_string(), "s_tool_7".to_string()];
        let output = filter
            .filter(&[], &FilterOptions::default(), &pins)
            .await
            .unwrap();

        assert_eq!(output.tools[0].name, "s_tool_150");
        assert_eq!(output.tools[1].name, "s_tool_7");

        // Pinned names never repeat later in the result
        let occurrences = output
            .tools
            .iter()
            .filter(|t| t.name == "s_tool_7")
            .count();
        assert_eq!(occurrences, 1);
    }

    #[tokio::test]
    async fn unknown_pins_are_ignored() {
        let filter = degraded_filter();
        filter.initialize(servers(&[("s", 3)])).await.unwrap();

        let pins = vec!["missing_tool".to_string()];
        let output = filter
            .filter(&[], &FilterOptions::default(), &pins)
            .await
            .unwrap();
        assert!(output.tools.iter().all(|t| t.name != "missing_tool"));
    }

    // =========================================================================
    // Message flattening
    // =========================================================================

    #[test]
    fn message_text_from_string() {
        let message: ChatMessage =
            serde_json::from_value(json!({"role": "user", "content": "hello"})).unwrap();
        assert_eq!(message.text(), "hello");
    }

    #[test]
    fn message_text_from_content_array() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "part one"}, {"type": "text", "text": "part two"}]
        }))
        .unwrap();
        assert_eq!(message.text(), "part one part two");
    }

    #[test]
    fn message_text_from_missing_content() {
        let message: ChatMessage = serde_json::from_value(json!({"role": "tool"})).unwrap();
        assert_eq!(message.text(), "");
    }
}
