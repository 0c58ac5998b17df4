//! HTTP client for the child runner's API.
//!
//! The runner exposes a small session-oriented surface: create a session,
//! prompt it, read its messages, abort it, enumerate providers, and a
//! server-sent event stream. Calls right after startup retry briefly on
//! connection-refused while the socket comes up.

use crate::constants::{RUNNER_CONNECT_RETRIES, RUNNER_CONNECT_RETRY_DELAY_MS};
use crate::Result;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// A single event from the runner's `/event` stream.
#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub event_type: String,
    pub properties: Value,
}

/// One conversational message inside a runner session.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RunnerApi {
    http: reqwest::Client,
    base: String,
    credential: Option<(String, String)>,
}

impl RunnerApi {
    pub fn new(base: impl Into<String>, credential: Option<(String, String)>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base, path));
        if let Some((user, pass)) = &self.credential {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }

    /// Sends a request, retrying transient connection-refused at startup.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response.error_for_status()?),
                Err(e) if e.is_connect() && attempt < RUNNER_CONNECT_RETRIES => {
                    attempt += 1;
                    debug!("runner not accepting connections yet (attempt {attempt}): {e}");
                    tokio::time::sleep(Duration::from_millis(RUNNER_CONNECT_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `POST /session` — returns the new session id, or `None` when the
    /// runner answered without one.
    pub async fn create_session(&self, title: &str) -> Result<Option<String>> {
        let response = self
            .send_with_retry(|| {
                self.request(reqwest::Method::POST, "/session")
                    .json(&json!({ "title": title }))
            })
            .await?;
        let body: Value = response.json().await?;
        Ok(body
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(String::from))
    }

    /// `POST /session/{id}/prompt` — resolves with the final assistant text
    /// once the run finishes.
    pub async fn prompt(
        &self,
        session_id: &str,
        model: Option<&(String, String)>,
        text: &str,
    ) -> Result<String> {
        let mut body = json!({
            "parts": [{ "type": "text", "text": text }]
        });
        if let Some((provider_id, model_id)) = model {
            body["model"] = json!({ "providerID": provider_id, "modelID": model_id });
        }
        let response = self
            .send_with_retry(|| {
                self.request(
                    reqwest::Method::POST,
                    &format!("/session/{session_id}/prompt"),
                )
                .json(&body)
            })
            .await?;
        let reply: Value = response.json().await.unwrap_or(Value::Null);
        Ok(assistant_text(&reply))
    }

    /// `GET /session/{id}/messages`
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let response = self
            .send_with_retry(|| {
                self.request(
                    reqwest::Method::GET,
                    &format!("/session/{session_id}/messages"),
                )
            })
            .await?;
        let body: Value = response.json().await?;
        let entries = body.as_array().cloned().unwrap_or_default();
        Ok(entries
            .iter()
            .map(|entry| SessionMessage {
                role: entry
                    .pointer("/info/role")
                    .or_else(|| entry.get("role"))
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .to_string(),
                text: assistant_text(entry),
            })
            .collect())
    }

    /// `POST /session/{id}/abort`
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        self.send_with_retry(|| {
            self.request(
                reqwest::Method::POST,
                &format!("/session/{session_id}/abort"),
            )
        })
        .await?;
        Ok(())
    }

    /// `GET /provider` — tolerant of both `{providers: [...]}` and a bare
    /// array.
    pub async fn list_providers(&self) -> Result<Vec<Value>> {
        let response = self
            .send_with_retry(|| self.request(reqwest::Method::GET, "/provider"))
            .await?;
        let body: Value = response.json().await?;
        Ok(match body {
            Value::Array(providers) => providers,
            Value::Object(mut map) => match map.remove("providers") {
                Some(Value::Array(providers)) => providers,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        })
    }

    /// `GET /event` — the runner's server-sent event stream. Undecodable
    /// frames are skipped.
    pub async fn subscribe_events(&self) -> Result<BoxStream<'static, RunnerEvent>> {
        let response = self
            .send_with_retry(|| {
                self.request(reqwest::Method::GET, "/event")
                    .header(reqwest::header::ACCEPT, "text/event-stream")
            })
            .await?;
        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|frame| async move {
                let frame = frame.ok()?;
                let value: Value = serde_json::from_str(&frame.data).ok()?;
                let event_type = value.get("type")?.as_str()?.to_string();
                let properties = value
                    .get("properties")
                    .cloned()
                    .unwrap_or(Value::Null);
                Some(RunnerEvent {
                    event_type,
                    properties,
                })
            });
        Ok(stream.boxed())
    }
}

/// Concatenated text parts of a message value, tolerating the handful of
/// shapes runners emit (`{parts}`, `{info, parts}`, bare string).
fn assistant_text(value: &Value) -> String {
    if let Some(text) = value.as_str() {
        return text.to_string();
    }
    let parts = value
        .get("parts")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();
    parts
        .iter()
        .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_session_returns_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/session")
            .with_status(200)
            .with_body(r#"{"id":"sess-1"}"#)
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        let id = api.create_session("task").await.unwrap();
        assert_eq!(id.as_deref(), Some("sess-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_session_without_id_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/session")
            .with_status(200)
            .with_body(r#"{}"#)
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        assert_eq!(api.create_session("task").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prompt_extracts_final_text_parts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/session/s1/prompt")
            .with_status(200)
            .with_body(
                r#"{"info":{"role":"assistant"},"parts":[
                    {"type":"text","text":"hello "},
                    {"type":"tool","tool":"bash"},
                    {"type":"text","text":"world"}
                ]}"#,
            )
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        let reply = api.prompt("s1", None, "hi").await.unwrap();
        assert_eq!(reply, "hello world");
    }

    #[tokio::test]
    async fn prompt_sends_model_reference() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/session/s1/prompt")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": {"providerID": "anthropic", "modelID": "claude-sonnet-4"}
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        let model = ("anthropic".to_string(), "claude-sonnet-4".to_string());
        api.prompt("s1", Some(&model), "hi").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn list_messages_maps_roles_and_text() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/session/s1/messages")
            .with_status(200)
            .with_body(
                r#"[
                    {"info":{"role":"user"},"parts":[{"type":"text","text":"hi"}]},
                    {"info":{"role":"assistant"},"parts":[{"type":"text","text":"[]"}]}
                ]"#,
            )
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        let messages = api.list_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].text, "[]");
    }

    #[tokio::test]
    async fn list_providers_accepts_both_shapes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/provider")
            .with_status(200)
            .with_body(r#"{"providers":[{"id":"anthropic"}]}"#)
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        let providers = api.list_providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0]["id"], "anthropic");
    }

    #[tokio::test]
    async fn subscribe_events_decodes_sse_frames() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/event")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"s1\"}}\n\n\
                 data: not-json\n\n\
                 data: {\"type\":\"message.part.updated\",\"properties\":{}}\n\n",
            )
            .create_async()
            .await;

        let api = RunnerApi::new(server.url(), None);
        let events: Vec<RunnerEvent> = api.subscribe_events().await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "session.idle");
        assert_eq!(events[0].properties["sessionID"], "s1");
    }

    #[tokio::test]
    async fn basic_auth_header_is_applied() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/provider")
            .match_header("authorization", mockito::Matcher::Regex("^Basic ".to_string()))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let api = RunnerApi::new(
            server.url(),
            Some(("gateway".to_string(), "secret".to_string())),
        );
        api.list_providers().await.unwrap();
        mock.assert_async().await;
    }
}
