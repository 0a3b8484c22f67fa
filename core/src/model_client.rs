//! Shared chat-endpoint client.
//!
//! One instance is shared by reference across every agent so the semaphore
//! bounds concurrency globally. Transient failures (429, 503, 504, transport
//! errors) retry with exponential backoff and jitter; client errors fail the
//! calling agent immediately and are never retried.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::trace;

use crate::config::ModelConfig;
use crate::error::AmbientErr;
use crate::error::Result;
use crate::flags::AMBIENT_REQUEST_MAX_RETRIES;
use crate::util::backoff;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

pub struct ModelClient {
    config: ModelConfig,
    client: reqwest::Client,
    permits: Semaphore,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            config,
            client,
            permits,
        }
    }

    /// Send a non-streaming chat completion and return the first choice's
    /// message content.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AmbientErr::Config("model client closed".to_string()))?;

        let payload = json!({
            "model": self.config.model_id,
            "messages": messages,
            "temperature": temperature.unwrap_or(self.config.temperature),
        });
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        trace!("POST {url}");

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;

            let res = self.client.post(&url).json(&payload).send().await;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    let content = body["choices"][0]["message"]["content"]
                        .as_str()
                        .map(str::to_string);
                    return content.ok_or(AmbientErr::EmptyModelResponse);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !is_transient(status) {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(AmbientErr::UnexpectedStatus(status, body));
                    }
                    if attempt > *AMBIENT_REQUEST_MAX_RETRIES {
                        return Err(AmbientErr::RetryLimit(status));
                    }
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let delay = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| backoff(attempt));
                    debug!("model endpoint returned {status}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt > *AMBIENT_REQUEST_MAX_RETRIES {
                        return Err(err.into());
                    }
                    let delay = backoff(attempt);
                    debug!("model request failed ({err}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// True when the endpoint answers its model listing route.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }

    /// Model ids known to the endpoint; empty on any failure.
    pub async fn list_models(&self) -> Vec<String> {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let Ok(resp) = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        else {
            return Vec::new();
        };
        if !resp.status().is_success() {
            return Vec::new();
        }
        let Ok(body) = resp.json::<serde_json::Value>().await else {
            return Vec::new();
        };
        body["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn client_for(server: &MockServer) -> ModelClient {
        ModelClient::new(ModelConfig {
            base_url: format!("{}/v1", server.uri()),
            max_concurrency: 2,
            timeout_seconds: 5,
            ..ModelConfig::default()
        })
    }

    fn completion_body(content: &str) -> serde_json::Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[tokio::test]
    async fn returns_message_content_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("[]")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let content = client
            .chat_completion(&[ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(content, "[]");
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let content = client
            .chat_completion(&[ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(content, "ok");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .chat_completion(&[ChatMessage::user("hi")], None)
            .await;
        assert!(matches!(
            err,
            Err(AmbientErr::UnexpectedStatus(StatusCode::BAD_REQUEST, _))
        ));
    }

    #[tokio::test]
    async fn health_check_reports_endpoint_reachability() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": [{ "id": "kimi-k2.5:cloud" }] })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.health_check().await);
        assert_eq!(client.list_models().await, vec!["kimi-k2.5:cloud"]);
    }
}
