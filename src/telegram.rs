use crate::error::SinkError;
use crate::shipper::NotificationSink;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub api_url: String,
}

/// Delivers log buffers as documents through the Telegram Bot API.
pub struct TelegramSink {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            endpoint: send_document_url(&config.api_url, &config.token),
        })
    }
}

fn send_document_url(api_url: &str, token: &str) -> String {
    format!("{}/bot{}/sendDocument", api_url.trim_end_matches('/'), token)
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, chat_id: i64, buffer: Vec<u8>, label: &str) -> Result<(), SinkError> {
        let size = buffer.len();
        let document = Part::bytes(buffer)
            .file_name(format!("{}.log", label))
            .mime_str("text/plain")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", label.to_string())
            .part("document", document);

        let response = self.http.post(&self.endpoint).multipart(form).send().await?;
        let status = response.status();
        // Telegram explains rejections in the body, so read it before the status.
        let body: Option<ApiResponse> = response.json().await.ok();

        match body {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => {
                debug!("Delivered {} ({} bytes) to chat {}", label, size, chat_id);
                Ok(())
            }
            body => Err(SinkError::Rejected {
                status: status.as_u16(),
                description: body
                    .and_then(|b| b.description)
                    .unwrap_or_else(|| status.to_string()),
            }),
        }
    }
}
