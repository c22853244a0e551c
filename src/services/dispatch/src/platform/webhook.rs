//! Generic JSON webhook sender using HTTP POST

use super::{creator, Sender, SenderCreator};
use crate::config::{PlatformConfig, WebhookPlatformConfig};
use crate::error::{DispatchError, Result};
use crate::models::{Capabilities, Message, MessageFormat, SendResult, Target};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SUPPORTED_TARGET_TYPES: [&str; 3] = ["user", "group", "channel"];
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Posts one JSON document per target to the configured webhook URL
pub struct WebhookSender {
    name: String,
    config: WebhookPlatformConfig,
    client: Client,
}

impl WebhookSender {
    pub fn new(name: &str, config: &WebhookPlatformConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                DispatchError::config(format!("Invalid header name '{}': {}", key, e))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                DispatchError::config(format!("Invalid header value for '{}': {}", key, e))
            })?;
            headers.insert(header_name, header_value);
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| DispatchError::config(format!("Failed to create HTTP client: {}", e)))?;

        info!(platform = name, url = %config.url, "Webhook sender initialized");

        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            client,
        })
    }

    /// Creator registered under the `webhook` platform kind
    pub fn creator() -> SenderCreator {
        creator(|name, config| match config {
            PlatformConfig::Webhook(webhook) => {
                Ok(Arc::new(WebhookSender::new(name, webhook)?) as Arc<dyn Sender>)
            }
            other => Err(DispatchError::config(format!(
                "platform '{}' is configured as '{}', expected 'webhook'",
                name,
                other.kind()
            ))),
        })
    }

    fn payload(&self, message: &Message, target: &Target) -> serde_json::Value {
        json!({
            "message_id": message.id,
            "title": message.title,
            "body": message.body,
            "format": message.format,
            "priority": message.priority,
            "target": {
                "type": target.target_type,
                "value": target.value,
            },
            "metadata": message.metadata,
            "variables": message.variables,
            "platform_data": message.platform_data.get(&self.name),
        })
    }

    async fn post(&self, message: &Message, target: &Target) -> std::result::Result<SendResult, reqwest::Error> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.config.url)
            .json(&self.payload(message, target))
            .send()
            .await?;

        let status = response.status();
        let header_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.unwrap_or_default();
        let elapsed = started.elapsed();

        if status.is_success() {
            let body_id = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("message_id").and_then(|id| id.as_str()).map(str::to_string));
            Ok(SendResult::success(target.clone(), header_id.or(body_id))
                .with_duration(elapsed)
                .with_response(text))
        } else {
            let error = match status.as_u16() {
                429 => format!("rate limit exceeded: HTTP {}", status),
                401 | 403 => format!("unauthorized: HTTP {}", status),
                503 => format!("service unavailable: HTTP {}", status),
                _ => format!("HTTP {}: {}", status, text),
            };
            Ok(SendResult::failure(target.clone(), error)
                .with_duration(elapsed)
                .with_response(text))
        }
    }
}

#[async_trait]
impl Sender for WebhookSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &Message, targets: &[Target]) -> Result<Vec<SendResult>> {
        let capabilities = self.capabilities();
        if !capabilities.supports_format(message.format) {
            return Err(DispatchError::validation(
                "format",
                format!("{} does not support {:?}", self.name, message.format),
            ));
        }

        let mut results = Vec::with_capacity(targets.len());
        let mut transport_errors = Vec::new();

        for target in targets {
            if let Err(e) = self.validate_target(target) {
                results.push(SendResult::failure(target.clone(), e.to_string()));
                continue;
            }

            match self.post(message, target).await {
                Ok(result) => {
                    debug!(
                        platform = %self.name,
                        target = %target.value,
                        success = result.success,
                        "Webhook delivery attempted"
                    );
                    results.push(result);
                }
                Err(e) => {
                    let error = if e.is_timeout() {
                        format!("timeout: {}", e)
                    } else {
                        format!("connection error: {}", e)
                    };
                    warn!(platform = %self.name, target = %target.value, error = %error, "Webhook request failed");
                    transport_errors.push(error.clone());
                    results.push(SendResult::failure(target.clone(), error));
                }
            }
        }

        // Every request failing before a response arrived means the platform itself is down
        if !targets.is_empty() && transport_errors.len() == targets.len() {
            return Err(DispatchError::platform(
                self.name.clone(),
                transport_errors.join("; "),
            ));
        }

        Ok(results)
    }

    fn validate_target(&self, target: &Target) -> Result<()> {
        if target.value.trim().is_empty() {
            return Err(DispatchError::validation("target.value", "must not be empty"));
        }
        if !SUPPORTED_TARGET_TYPES.contains(&target.target_type.as_str()) {
            return Err(DispatchError::validation(
                "target.type",
                format!("unsupported target type '{}'", target.target_type),
            ));
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: self.name.clone(),
            supported_target_types: SUPPORTED_TARGET_TYPES.iter().map(|s| s.to_string()).collect(),
            supported_formats: vec![MessageFormat::Text, MessageFormat::Markdown],
            max_message_size: MAX_MESSAGE_SIZE,
            supports_scheduling: false,
            supports_attachments: false,
            supports_rich_content: true,
        }
    }

    async fn is_healthy(&self) -> Result<()> {
        reqwest::Url::parse(&self.config.url)
            .map(|_| ())
            .map_err(|e| DispatchError::config(format!("invalid webhook url: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        debug!(platform = %self.name, "Webhook sender closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(url: String) -> WebhookPlatformConfig {
        WebhookPlatformConfig {
            url,
            timeout_ms: 2_000,
            headers: HashMap::from([("x-api-key".to_string(), "k1".to_string())]),
            user_agent: "dispatch-test/1.0".to_string(),
        }
    }

    fn create_test_message() -> Message {
        Message::new("Deploy finished", "All green")
            .with_target(Target::new("user", "U1", "chat"))
            .with_target(Target::new("group", "G1", "chat"))
    }

    #[tokio::test]
    async fn test_send_success_per_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-api-key", "k1"))
            .and(body_partial_json(json!({"title": "Deploy finished"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-1"})))
            .expect(2)
            .mount(&server)
            .await;

        let sender = WebhookSender::new("chat", &create_test_config(format!("{}/hook", server.uri())))
            .unwrap();
        let message = create_test_message();
        let results = sender.send(&message, &message.targets).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_http_error_is_per_target_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let sender = WebhookSender::new("chat", &create_test_config(server.uri())).unwrap();
        let message = create_test_message();
        let results = sender.send(&message, &message.targets).await.unwrap();

        assert!(results.iter().all(|r| !r.success));
        assert!(results[0].error.as_deref().unwrap().contains("rate limit"));
    }

    #[tokio::test]
    async fn test_invalid_target_type_rejected_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sender = WebhookSender::new("chat", &create_test_config(server.uri())).unwrap();
        let message = Message::new("t", "b").with_target(Target::new("email", "a@b.c", "chat"));
        let results = sender.send(&message, &message.targets).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
    }

    #[tokio::test]
    async fn test_unreachable_platform_errors_outright() {
        // Nothing listens on port 9 locally
        let sender =
            WebhookSender::new("chat", &create_test_config("http://127.0.0.1:9/hook".to_string()))
                .unwrap();
        let message = create_test_message();
        let result = sender.send(&message, &message.targets).await;
        assert!(matches!(result, Err(DispatchError::Platform { .. })));
    }

    #[test]
    fn test_creator_rejects_other_kinds() {
        let config = PlatformConfig::Sms(crate::config::SmsPlatformConfig {
            provider: "twilio".to_string(),
            account_id: "a".to_string(),
            auth_token: "t".to_string(),
            from_number: "+1".to_string(),
        });
        let create = WebhookSender::creator();
        assert!(create("sms", &config).is_err());
    }

    #[tokio::test]
    async fn test_html_not_supported() {
        let sender =
            WebhookSender::new("chat", &create_test_config("http://localhost/hook".to_string()))
                .unwrap();
        let message = create_test_message().with_format(MessageFormat::Html);
        assert!(sender.send(&message, &message.targets).await.is_err());
        assert!(sender.is_healthy().await.is_ok());
    }
}
