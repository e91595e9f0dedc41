//! Wire types for the upstream Responses API.

use serde::Deserialize;
use serde::Serialize;

/// Output item of a Responses API body.
///
/// The API returns function-call arguments as a *string* that contains JSON,
/// not as an already-parsed object. It is kept raw here and parsed at the
/// call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: String,
        content: Vec<ContentItem>,
    },
    FunctionCall {
        name: String,
        arguments: String,
        #[serde(default)]
        call_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    OutputText { text: String },
    #[serde(other)]
    Other,
}

/// Deserialized body of a non-streaming `/responses` call.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesApiResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub output: Vec<ResponseItem>,
    /// Convenience field some backends include alongside `output`.
    #[serde(default)]
    pub output_text: Option<String>,
}

/// Best-effort extraction of assistant text from a Responses API body.
pub fn extract_output_text(resp: &ResponsesApiResponse) -> String {
    let mut out = String::new();
    for item in &resp.output {
        if let ResponseItem::Message { content, .. } = item {
            for content_item in content {
                if let ContentItem::OutputText { text } = content_item {
                    out.push_str(text);
                }
            }
        }
    }
    let joined = out.trim().to_string();
    if !joined.is_empty() {
        return joined;
    }
    resp.output_text.clone().unwrap_or_default()
}
