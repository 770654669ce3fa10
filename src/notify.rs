//! Notification sink boundary.
//!
//! Two fire-and-forget operations: send a text message, send a file with a
//! caption. Both are gated on the presence of the two configured
//! credentials; their absence silently disables the sink, and delivery
//! failures degrade to a warning rather than interrupting the pipeline.

use std::path::Path;
use std::time::Duration;

use crate::config::BuilderConfig;

const API_BASE: &str = "https://api.telegram.org";

/// Best-effort message/file sink.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    token: Option<String>,
    chat_id: Option<String>,
}

impl Notifier {
    pub fn from_config(config: &BuilderConfig) -> Self {
        Notifier {
            token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
        }
    }

    /// Disabled sink (tests, credential-less runs).
    pub fn disabled() -> Self {
        Notifier::default()
    }

    pub fn enabled(&self) -> bool {
        self.token.is_some() && self.chat_id.is_some()
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.token.as_deref()?, self.chat_id.as_deref()?))
    }

    /// Send a text message. Fire-and-forget.
    pub fn send_message(&self, text: &str) {
        let Some((token, chat_id)) = self.credentials() else {
            return;
        };
        let result = client().and_then(|client| {
            client
                .post(format!("{API_BASE}/bot{token}/sendMessage"))
                .json(&serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                }))
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)
        });
        if let Err(e) = result {
            log::warn!("Notification message not delivered: {e}");
        }
    }

    /// Send a file with a caption. Fire-and-forget.
    pub fn send_file(&self, path: &Path, caption: &str) {
        let Some((token, chat_id)) = self.credentials() else {
            return;
        };
        let form = match reqwest::blocking::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .file("document", path)
        {
            Ok(form) => form,
            Err(e) => {
                log::warn!("Notification file {} not readable: {e}", path.display());
                return;
            }
        };
        let result = client().and_then(|client| {
            client
                .post(format!("{API_BASE}/bot{token}/sendDocument"))
                .multipart(form)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)
        });
        if let Err(e) = result {
            log::warn!("Notification file not delivered: {e}");
        }
    }
}

fn client() -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
}
