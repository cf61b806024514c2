//! Canonical streaming shapes and the delta accumulator.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

use super::response::{
    Choice, FunctionCall, GatewayResponse, ResponseMessage, ToolCall, Usage,
};

/// The delta carried by one streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkDelta {
    /// A content fragment.
    Content(String),
    /// An incremental tool-call fragment. `id` and `name` arrive on the
    /// first fragment for an index; `arguments` accumulates across
    /// fragments.
    ToolCall {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    /// Final usage-only sentinel some providers emit after the last
    /// content delta.
    Usage(Usage),
}

/// One canonical streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn content(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            provider: String::new(),
            delta: ChunkDelta::Content(text.into()),
            finish_reason: None,
        }
    }
}

/// The end-of-stream marker. Exactly one terminates every stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// What the caller's channel yields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamItem {
    Chunk(StreamChunk),
    End(StreamEnd),
}

/// Accumulates deltas into a synthesized [`GatewayResponse`] so post-hooks
/// and governance see one response per streaming request.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    id: String,
    model: String,
    provider: String,
    content: String,
    tool_calls: Vec<(usize, Option<String>, Option<String>, String)>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the accumulated state.
    pub fn push(&mut self, chunk: &StreamChunk) {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if self.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if self.provider.is_empty() {
            self.provider = chunk.provider.clone();
        }
        if let Some(reason) = &chunk.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
        match &chunk.delta {
            ChunkDelta::Content(text) => self.content.push_str(text),
            ChunkDelta::ToolCall { index, id, name, arguments } => {
                match self.tool_calls.iter_mut().find(|(i, ..)| i == index) {
                    Some((_, slot_id, slot_name, slot_args)) => {
                        if slot_id.is_none() {
                            *slot_id = id.clone();
                        }
                        if slot_name.is_none() {
                            *slot_name = name.clone();
                        }
                        slot_args.push_str(arguments);
                    }
                    None => self
                        .tool_calls
                        .push((*index, id.clone(), name.clone(), arguments.clone())),
                }
            }
            ChunkDelta::Usage(usage) => self.usage = Some(*usage),
        }
    }

    /// Total characters of content delivered so far. Governance uses this
    /// as the lower-bound token estimate when usage never arrives.
    pub fn delivered_chars(&self) -> usize {
        self.content.len()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Synthesize the accumulated response. Called exactly once, when the
    /// stream ends (successfully or not).
    pub fn finish(self) -> GatewayResponse {
        let tool_calls = if self.tool_calls.is_empty() {
            None
        } else {
            Some(
                self.tool_calls
                    .into_iter()
                    .map(|(index, id, name, arguments)| ToolCall {
                        id: id.unwrap_or_else(|| format!("call_{}", index)),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: name.unwrap_or_default(),
                            arguments,
                        },
                    })
                    .collect(),
            )
        };
        let content = if self.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(self.content)
        };
        GatewayResponse {
            id: if self.id.is_empty() {
                format!("bf-{}", uuid::Uuid::new_v4())
            } else {
                self.id
            },
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: self.model,
            provider: self.provider,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls,
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
            data: None,
            raw_request: None,
            raw_response: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_concatenates_content() {
        let mut acc = StreamAccumulator::new();
        for text in ["Hel", "lo", " world"] {
            acc.push(&StreamChunk::content("c1", "m", text));
        }
        let resp = acc.finish();
        assert_eq!(resp.first_content(), Some("Hello world"));
        assert_eq!(resp.id, "c1");
    }

    #[test]
    fn test_accumulator_assembles_tool_calls() {
        let mut acc = StreamAccumulator::new();
        let mut chunk = StreamChunk::content("c1", "m", "");
        chunk.delta = ChunkDelta::ToolCall {
            index: 0,
            id: Some("call_a".to_string()),
            name: Some("get_weather".to_string()),
            arguments: "{\"city\":".to_string(),
        };
        acc.push(&chunk);
        chunk.delta = ChunkDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            arguments: "\"Oslo\"}".to_string(),
        };
        acc.push(&chunk);

        let resp = acc.finish();
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Oslo\"}");
    }

    #[test]
    fn test_accumulator_records_usage_sentinel() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamChunk::content("c1", "m", "hi"));
        let mut chunk = StreamChunk::content("c1", "m", "");
        chunk.delta = ChunkDelta::Usage(Usage::new(3, 1));
        acc.push(&chunk);
        assert_eq!(acc.usage().unwrap().total_tokens, 4);
    }
}
