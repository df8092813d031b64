//! Minimal Telegram Bot API transport
//!
//! Long-polls `getUpdates`, hands each update to the [`Dispatcher`] and
//! delivers its replies. Also implements [`Notifier`] so the status poller
//! can push completion messages.

use anyhow::{anyhow, bail, Context, Result};
use recon_bot_sdk::{async_trait, Identity, Notifier, NotifyResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::dispatcher::{Dispatcher, Incoming, Reply};

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct InlineKeyboardButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

impl Update {
    /// Transport-neutral view of the update, if it is one the bot handles
    pub fn to_incoming(&self) -> Option<Incoming> {
        if let Some(message) = &self.message {
            let identity = Identity(message.chat.id);
            return Some(match &message.text {
                Some(text) => Incoming::Text {
                    identity,
                    text: text.clone(),
                },
                None => Incoming::Other { identity },
            });
        }

        let query = self.callback_query.as_ref()?;
        let message = query.message.as_ref()?;
        Some(Incoming::Callback {
            identity: Identity(message.chat.id),
            message_id: Some(message.message_id),
            data: query.data.clone()?,
        })
    }
}

pub struct TelegramApi {
    client: reqwest::Client,
    /// `<api_url>/bot<token>`; never logged
    base: String,
}

impl TelegramApi {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        // Must outlive the long-poll timeout
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base: format!(
                "{}/bot{}",
                config.api_url.trim_end_matches('/'),
                config.token
            ),
        })
    }

    async fn parse<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
        let api: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| e.without_url())
            .with_context(|| format!("Telegram {} returned an unreadable response", method))?;

        if !api.ok {
            bail!(
                "Telegram {} failed: {}",
                method,
                api.description.unwrap_or_default()
            );
        }
        api.result
            .ok_or_else(|| anyhow!("Telegram {} returned no result", method))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .client
            .post(format!("{}/{}", self.base, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.without_url())
            .with_context(|| format!("Telegram {} request failed", method))?;

        Self::parse(method, response).await
    }

    pub async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<Vec<Update>> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body).await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.call::<serde_json::Value>("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    pub async fn send_html(&self, chat_id: i64, html: &str) -> Result<()> {
        self.call::<serde_json::Value>(
            "sendMessage",
            json!({ "chat_id": chat_id, "text": html, "parse_mode": "HTML" }),
        )
        .await?;
        Ok(())
    }

    pub async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, String)],
    ) -> Result<()> {
        let rows: Vec<Vec<InlineKeyboardButton>> = buttons
            .iter()
            .map(|(label, data)| {
                vec![InlineKeyboardButton {
                    text: label,
                    callback_data: data,
                }]
            })
            .collect();

        self.call::<serde_json::Value>(
            "sendMessage",
            json!({
                "chat_id": chat_id,
                "text": text,
                "reply_markup": { "inline_keyboard": rows },
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        self.call::<serde_json::Value>(
            "editMessageText",
            json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str) -> Result<()> {
        self.call::<serde_json::Value>(
            "answerCallbackQuery",
            json!({ "callback_query_id": callback_query_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn send_document(&self, chat_id: i64, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes.is_empty() {
            bail!("{} is empty", path.display());
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("output")
            .to_string();
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let response = self
            .client
            .post(format!("{}/sendDocument", self.base))
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.without_url())
            .context("Telegram sendDocument request failed")?;

        Self::parse::<serde_json::Value>("sendDocument", response).await?;
        Ok(())
    }

    /// Send one dispatcher reply to `chat_id`
    pub async fn deliver(&self, chat_id: i64, reply: &Reply) -> Result<()> {
        match reply {
            Reply::Text(text) => self.send_message(chat_id, text).await,
            Reply::Html(html) => self.send_html(chat_id, html).await,
            Reply::Keyboard { text, buttons } => self.send_keyboard(chat_id, text, buttons).await,
            Reply::Edit { message_id, text } => {
                self.edit_message_text(chat_id, *message_id, text).await
            }
            Reply::Document(path) => self.send_document(chat_id, path).await,
        }
    }
}

#[async_trait]
impl Notifier for TelegramApi {
    async fn notify(&self, identity: Identity, text: &str) -> NotifyResult {
        self.send_message(identity.0, text).await.map_err(Into::into)
    }
}

/// Long-poll for updates until `shutdown` is cancelled
pub async fn run_polling(
    api: &TelegramApi,
    dispatcher: &Dispatcher,
    poll_timeout_secs: u64,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("telegram polling started");
    let mut offset: Option<i64> = None;

    loop {
        let updates = tokio::select! {
            _ = shutdown.cancelled() => break,
            updates = api.get_updates(offset, poll_timeout_secs) => updates,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);

            if let Some(query) = &update.callback_query {
                if let Err(e) = api.answer_callback_query(&query.id).await {
                    debug!(error = %e, "failed to answer callback query");
                }
            }

            let Some(incoming) = update.to_incoming() else {
                continue;
            };
            let chat_id = match &incoming {
                Incoming::Text { identity, .. }
                | Incoming::Callback { identity, .. }
                | Incoming::Other { identity } => identity.0,
            };

            for reply in dispatcher.route(incoming).await {
                if let Err(e) = api.deliver(chat_id, &reply).await {
                    warn!(chat_id, error = %e, "failed to deliver reply");
                }
            }
        }
    }

    info!("telegram polling stopped");
    Ok(())
}
