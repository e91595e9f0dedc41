//! Shared plumbing for planner and translator calls against the upstream
//! Responses API.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::Config;
use crate::error::EnvVarError;
use crate::error::Result;
use crate::error::TerminusErr;
use crate::models::ResponsesApiResponse;
use crate::util::backoff;

/// Optional request fields, in the order they are dropped when the upstream
/// rejects one it does not understand.
const OPTIONAL_FIELD_DROP_ORDER: &[&str] = &[
    "response_format",
    "tools",
    "tool_choice",
    "reasoning",
    "text",
    "metadata",
    "previous_response_id",
];

/// Statuses worth retrying; everything else propagates immediately.
fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

#[derive(Clone)]
pub struct ModelClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    max_retries: u64,
}

impl ModelClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_retries: config.request_max_retries,
        }
    }

    fn api_key(&self) -> Result<String> {
        self.api_key.clone().ok_or_else(|| {
            TerminusErr::EnvVar(EnvVarError {
                var: "OPENAI_API_KEY".to_string(),
                instructions: Some(
                    "Set it to reach the planner/translator models, or enable the \
                     deterministic offline mode with TERMINUS_FAKE=true."
                        .to_string(),
                ),
            })
        })
    }

    /// POST the payload to `/responses`, retrying transient failures with
    /// back-off and progressively dropping optional fields the upstream
    /// rejects.
    pub async fn responses(&self, mut payload: Map<String, Value>) -> Result<ResponsesApiResponse> {
        let url = format!("{}/responses", self.api_base);
        let api_key = self.api_key()?;
        let mut drop_order: Vec<&'static str> = OPTIONAL_FIELD_DROP_ORDER.to_vec();

        debug!(url, "POST");
        trace!("request payload: {}", serde_json::Value::Object(payload.clone()));

        let mut attempt = 0u64;
        loop {
            let res = self
                .http
                .post(&url)
                .bearer_auth(&api_key)
                .json(&payload)
                .send()
                .await;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json::<ResponsesApiResponse>().await?);
                }
                Ok(resp) => {
                    let status = resp.status();
                    // Pull out Retry-After before the body consumes the
                    // response.
                    let retry_after_secs = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let body = resp.text().await.unwrap_or_default();

                    if status == StatusCode::BAD_REQUEST
                        && let Some(dropped) =
                            drop_unsupported_field(&mut payload, &mut drop_order, &body)
                    {
                        warn!(dropped, "upstream rejected an optional field; retrying without it");
                        continue;
                    }

                    // The endpoint returns structured JSON bodies even for
                    // 4xx/5xx; include the text so callers see the exact
                    // upstream message.
                    if !is_transient(status) {
                        return Err(TerminusErr::UnexpectedStatus(status, body));
                    }

                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(TerminusErr::RetryLimit(status));
                    }

                    let delay = retry_after_secs
                        .map(|s| Duration::from_millis(s * 1_000))
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(e.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

/// Build the two-message `input` array shared by planner and translator
/// requests.
pub(crate) fn input_messages(system_prompt: &str, user_content: &str) -> Value {
    json!([
        {"role": "system", "content": system_prompt},
        {"role": "user", "content": user_content},
    ])
}

/// Metadata tag correlating upstream safety logs with a runtime session.
pub(crate) fn safety_tag(prefix: &str, session_id: &str) -> Value {
    json!({"safety_identifier": format!("{prefix}{session_id}")})
}

/// When a 400 names an unknown/unsupported parameter, pop the next optional
/// field that is present in the payload. `None` when the body does not look
/// like a parameter complaint or nothing is left to drop; the 400 is then
/// surfaced as-is.
fn drop_unsupported_field(
    payload: &mut Map<String, Value>,
    drop_order: &mut Vec<&'static str>,
    body: &str,
) -> Option<&'static str> {
    if !mentions_unsupported_parameter(body) {
        return None;
    }
    let position = drop_order.iter().position(|key| payload.contains_key(*key))?;
    let key = drop_order.remove(position);
    payload.remove(key);
    Some(key)
}

fn mentions_unsupported_parameter(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("unknown parameter")
        || body.contains("unsupported parameter")
        || body.contains("unexpected keyword")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn payload_with(keys: &[&str]) -> Map<String, Value> {
        let mut payload = Map::new();
        for key in keys {
            payload.insert(key.to_string(), json!({}));
        }
        payload
    }

    #[test]
    fn drops_optional_fields_in_priority_order() {
        let mut payload = payload_with(&["model", "input", "tools", "metadata"]);
        let mut order: Vec<&'static str> = OPTIONAL_FIELD_DROP_ORDER.to_vec();
        let body = "Unknown parameter: 'tools'";

        assert_eq!(
            drop_unsupported_field(&mut payload, &mut order, body),
            Some("tools")
        );
        assert_eq!(
            drop_unsupported_field(&mut payload, &mut order, body),
            Some("metadata")
        );
        // Required fields are never dropped.
        assert_eq!(drop_unsupported_field(&mut payload, &mut order, body), None);
        assert!(payload.contains_key("model"));
        assert!(payload.contains_key("input"));
    }

    #[test]
    fn unrelated_bad_requests_do_not_trigger_drops() {
        let mut payload = payload_with(&["model", "tools"]);
        let mut order: Vec<&'static str> = OPTIONAL_FIELD_DROP_ORDER.to_vec();
        assert_eq!(
            drop_unsupported_field(&mut payload, &mut order, "invalid api key"),
            None
        );
        assert!(payload.contains_key("tools"));
    }

    #[test]
    fn safety_tag_concatenates_prefix_and_session() {
        assert_eq!(
            safety_tag("terminus-", "abc123def456"),
            json!({"safety_identifier": "terminus-abc123def456"})
        );
    }
}
