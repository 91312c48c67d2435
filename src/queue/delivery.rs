//! The delivery collaborator and its Telegram Bot API implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::Result;
use crate::config::TelegramConfig;
use crate::models::{Priority, UserId};

/// Per-request timeout of the Bot API client.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Worth retrying later (throttling, network, server errors).
    Transient(String),
    /// The recipient is unreachable for good, e.g. blocked the bot.
    Permanent(String),
    /// This message can never be delivered, but the recipient is fine.
    Rejected(String),
}

/// Sends rendered text to one user.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, user_id: UserId, text: &str, priority: Priority) -> SendOutcome;
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: UserId,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    disable_notification: bool,
}

#[derive(Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Maps a Bot API status and error description to a [`SendOutcome`].
pub fn classify_response(status: u16, description: &str) -> SendOutcome {
    let lower = description.to_lowercase();
    if lower.contains("bot was blocked")
        || lower.contains("user is deactivated")
        || lower.contains("chat not found")
        || status == 403
    {
        return SendOutcome::Permanent(description.to_string());
    }
    match status {
        200..=299 => SendOutcome::Delivered,
        408 | 429 => SendOutcome::Transient(description.to_string()),
        500..=599 => SendOutcome::Transient(format!("server error {status}: {description}")),
        _ => SendOutcome::Rejected(format!("status {status}: {description}")),
    }
}

/// Delivers messages through the Telegram Bot API `sendMessage` method.
pub struct TelegramClient {
    http: reqwest::Client,
    send_url: Zeroizing<String>,
}

impl fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramClient")
            .field("send_url", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    /// Builds a client on top of a TLS-configured HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Tls`](crate::KlaxonError::Tls) if the HTTP
    /// client cannot be constructed.
    pub fn new(config: &TelegramConfig, tls_config: rustls::ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| crate::KlaxonError::Tls(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            send_url: Zeroizing::new(format!(
                "{}/bot{}/sendMessage",
                config.api_url.trim_end_matches('/'),
                config.bot_token.as_str()
            )),
        })
    }
}

#[async_trait]
impl DeliveryClient for TelegramClient {
    async fn send(&self, user_id: UserId, text: &str, priority: Priority) -> SendOutcome {
        let request = SendMessageRequest {
            chat_id: user_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
            disable_notification: priority < Priority::NORMAL,
        };

        let response = match self.http.post(self.send_url.as_str()).json(&request).send().await {
            Ok(response) => response,
            // The URL carries the token, so never log the error's URL.
            Err(e) => return SendOutcome::Transient(e.without_url().to_string()),
        };

        let status = response.status().as_u16();
        let body: BotApiResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return SendOutcome::Transient(format!(
                    "unreadable response ({status}): {}",
                    e.without_url()
                ));
            }
        };
        if body.ok {
            debug!(user_id, "Message delivered");
            return SendOutcome::Delivered;
        }

        let mut description = body.description.unwrap_or_default();
        if let Some(retry_after) = body.parameters.and_then(|p| p.retry_after) {
            description = format!("{description} (retry after {retry_after}s)");
        }
        classify_response(status, &description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_recipient_is_permanent() {
        assert!(matches!(
            classify_response(403, "Forbidden: bot was blocked by the user"),
            SendOutcome::Permanent(_)
        ));
        assert!(matches!(
            classify_response(400, "Bad Request: chat not found"),
            SendOutcome::Permanent(_)
        ));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(matches!(
            classify_response(429, "Too Many Requests: retry after 3"),
            SendOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_response(502, "Bad Gateway"),
            SendOutcome::Transient(_)
        ));
    }

    #[test]
    fn malformed_message_is_rejected_not_permanent() {
        assert!(matches!(
            classify_response(400, "Bad Request: can't parse entities"),
            SendOutcome::Rejected(_)
        ));
    }

    #[test]
    fn debug_hides_token() {
        let config = TelegramConfig {
            bot_token: Zeroizing::new("123:secret".to_string()),
            api_url: "https://api.telegram.org".to_string(),
        };
        let tls = crate::tls::build_tls_config(None).unwrap();
        let client = TelegramClient::new(&config, tls).unwrap();
        assert!(!format!("{client:?}").contains("secret"));
    }
}
