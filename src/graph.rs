use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::{debug, warn};

use crate::client::{ServiceError, ServiceResult};

/// One event from a streaming graph run.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A piece of AI-generated text to append to the transcript.
    AiChunk(String),
    /// Human-in-the-loop interrupt; the run resumes via `RunInput::Resume`.
    Interrupt(Value),
    /// Terminal marker; nothing further arrives on this stream.
    Done,
    /// Anything the classifier does not recognize, kept for debug display.
    Other(Value),
}

/// First call vs. resume-after-interrupt payload.
#[derive(Debug, Clone)]
pub enum RunInput {
    Input(Value),
    Resume(Value),
}

impl RunInput {
    /// Plain user message as graph input.
    pub fn user_message(text: &str) -> Self {
        RunInput::Input(json!({
            "messages": [{ "type": "human", "content": text }]
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphThread {
    pub thread_id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Client for the graph-execution service. Threads are scoped to a user via
/// metadata; runs stream server-sent events.
pub struct GraphClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<&str>) -> ServiceResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(key.trim()).map_err(|_| ServiceError::InvalidApiKey)?,
            );
        }

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> ServiceResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(ServiceError::NotFound(body))
        } else {
            Err(ServiceError::Api { status, body })
        }
    }

    pub async fn search_threads(&self, user_id: &str) -> ServiceResult<Vec<GraphThread>> {
        let response = self
            .http_client
            .post(self.url("/threads/search"))
            .json(&json!({ "metadata": { "user_id": user_id } }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn create_thread(
        &self,
        user_id: &str,
        assistant_name: Option<&str>,
    ) -> ServiceResult<GraphThread> {
        let mut metadata = json!({ "user_id": user_id });
        if let Some(name) = assistant_name {
            metadata["assistant_name"] = json!(name);
        }

        let response = self
            .http_client
            .post(self.url("/threads"))
            .json(&json!({ "metadata": metadata }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> ServiceResult<()> {
        let response = self
            .http_client
            .delete(self.url(&format!("/threads/{}", thread_id)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_all_threads(&self, user_id: &str) -> ServiceResult<()> {
        for thread in self.search_threads(user_id).await? {
            self.delete_thread(&thread.thread_id).await?;
        }
        Ok(())
    }

    /// Start (or resume) a run and stream its events. The stream always
    /// finishes with `Done` once the server closes the connection.
    pub async fn run_stream(
        &self,
        assistant_id: &str,
        thread_id: &str,
        input: RunInput,
    ) -> ServiceResult<Pin<Box<dyn Stream<Item = ServiceResult<GraphEvent>> + Send>>> {
        let mut payload = json!({
            "assistant_id": assistant_id,
            "stream_mode": "updates",
        });
        match input {
            RunInput::Input(value) => payload["input"] = value,
            RunInput::Resume(value) => payload["command"] = json!({ "resume": value }),
        }

        let response = self
            .http_client
            .post(self.url(&format!("/threads/{}/runs/stream", thread_id)))
            .json(&payload)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(parse_event_stream(response))
    }
}

/// Parse a server-sent-event response into graph events: accumulate bytes
/// into lines, track the current `event:` name, classify each `data:` frame.
fn parse_event_stream(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = ServiceResult<GraphEvent>> + Send>> {
    let stream = response.bytes_stream();

    Box::pin(async_stream::stream! {
        let mut byte_chunks = Box::pin(stream);
        let mut buffer = String::new();
        let mut current_event = String::new();

        while let Some(chunk_result) = byte_chunks.next().await {
            let bytes = match chunk_result {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(ServiceError::Transport(e));
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                if let Some(name) = line.strip_prefix("event: ") {
                    current_event = name.to_string();
                } else if let Some(data) = line.strip_prefix("data: ") {
                    match serde_json::from_str::<Value>(data) {
                        Ok(value) => {
                            for event in classify(&current_event, &value) {
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            warn!("Unparseable stream frame: {}", e);
                            yield Ok(GraphEvent::Other(Value::String(data.to_string())));
                        }
                    }
                }
            }
        }

        yield Ok(GraphEvent::Done);
    })
}

/// Classify one `data:` frame. Only `updates` frames carry AI text or
/// interrupts; everything else is passed through as `Other`.
fn classify(event_name: &str, data: &Value) -> Vec<GraphEvent> {
    if event_name != "updates" {
        debug!("Pass-through stream event '{}'", event_name);
        return vec![GraphEvent::Other(json!({
            "event": event_name,
            "data": data,
        }))];
    }

    if let Some(items) = data.get("__interrupt__") {
        let payload = items
            .as_array()
            .and_then(|list| list.first())
            .cloned()
            .unwrap_or_else(|| items.clone());
        return vec![GraphEvent::Interrupt(payload)];
    }

    let mut events = Vec::new();
    if let Some(nodes) = data.as_object() {
        for payload in nodes.values() {
            let messages = payload
                .get("messages")
                .and_then(|m| m.as_array())
                .map(|m| m.as_slice())
                .unwrap_or_default();
            for message in messages {
                if message.get("type").and_then(|t| t.as_str()) != Some("ai") {
                    continue;
                }
                if let Some(text) = message_content_text(message) {
                    events.push(GraphEvent::AiChunk(text));
                }
            }
        }
    }
    events
}

/// AI message content: plain string, or a part list whose text fields get
/// concatenated.
fn message_content_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_classify_ai_text() {
        let data = json!({
            "respond": {
                "messages": [
                    { "type": "human", "content": "hi" },
                    { "type": "ai", "content": "hello there" }
                ]
            }
        });
        assert_eq!(
            classify("updates", &data),
            vec![GraphEvent::AiChunk("hello there".to_string())]
        );
    }

    #[test]
    fn test_classify_interrupt_takes_first_item() {
        let data = json!({
            "__interrupt__": [
                { "value": { "question": "approve?" }, "id": "int_1" }
            ]
        });
        let events = classify("updates", &data);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GraphEvent::Interrupt(v)
            if v.get("id").and_then(|i| i.as_str()) == Some("int_1")));
    }

    #[test]
    fn test_classify_non_update_is_passed_through() {
        let events = classify("metadata", &json!({ "run_id": "r1" }));
        assert!(matches!(events[0], GraphEvent::Other(_)));
    }

    #[test]
    fn test_part_list_content_is_concatenated() {
        let message = json!({
            "type": "ai",
            "content": [ { "text": "one " }, { "text": "two" } ]
        });
        assert_eq!(message_content_text(&message), Some("one two".to_string()));
    }

    #[tokio::test]
    async fn test_delete_all_threads_scoped_to_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "thread_id": "t1", "metadata": { "user_id": "alex" } },
                { "thread_id": "t2", "metadata": { "user_id": "alex" } }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/threads/t1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/threads/t2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GraphClient::new(server.uri(), Some("secret")).unwrap();
        client.delete_all_threads("alex").await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stream_yields_chunks_then_done() {
        let body = concat!(
            "event: metadata\n",
            "data: {\"run_id\": \"r1\"}\n",
            "\n",
            "event: updates\n",
            "data: {\"respond\": {\"messages\": [{\"type\": \"ai\", \"content\": \"mapped\"}]}}\n",
            "\n",
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/t1/runs/stream"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = GraphClient::new(server.uri(), None).unwrap();
        let mut stream = client
            .run_stream("agent", "t1", RunInput::user_message("map my data"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        assert!(matches!(events[0], GraphEvent::Other(_)));
        assert_eq!(events[1], GraphEvent::AiChunk("mapped".to_string()));
        assert_eq!(events.last(), Some(&GraphEvent::Done));
    }
}
