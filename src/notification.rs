//! Push notifications shown by the worker and their click handling.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::error::{Error, Result};

const VIBRATE_PATTERN: [u32; 3] = [100, 50, 100];

/// Action identifier that opens the application.
pub const ACTION_EXPLORE: &str = "explore";
/// Action identifier that only dismisses.
pub const ACTION_CLOSE: &str = "close";

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// Data attached to a notification and handed back on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// Arrival time in milliseconds since the Unix epoch.
    pub date_of_arrival: i64,
    pub primary_key: u32,
    /// Page opened by the default action.
    pub url: String,
}

/// A shown notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

/// Structured push payload. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
    title: Option<String>,
    body: Option<String>,
    url: Option<String>,
}

impl Notification {
    /// Builds the notification for a push message.
    ///
    /// A JSON object payload may set `title`, `body` and `url`; any other
    /// payload text becomes the body. Without a payload the configured
    /// default body is used.
    #[must_use]
    pub fn from_push(config: &NotificationConfig, payload: Option<&str>) -> Self {
        let payload = payload.map(str::trim).filter(|text| !text.is_empty());
        let parsed = payload
            .filter(|text| text.starts_with('{'))
            .and_then(|text| serde_json::from_str::<PushPayload>(text).ok());

        let (title, body, url) = match (parsed, payload) {
            (Some(p), _) => (p.title, p.body, p.url),
            (None, Some(text)) => (None, Some(text.to_string()), None),
            (None, None) => (None, None, None),
        };

        Self {
            id: Uuid::new_v4(),
            title: title.unwrap_or_else(|| config.title.clone()),
            body: body.unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: VIBRATE_PATTERN.to_vec(),
            data: NotificationData {
                date_of_arrival: Utc::now().timestamp_millis(),
                primary_key: 1,
                url: url.unwrap_or_else(|| config.open_url.clone()),
            },
            actions: vec![
                NotificationAction {
                    action: ACTION_EXPLORE.to_string(),
                    title: "Open app".to_string(),
                    icon: config.icon.clone(),
                },
                NotificationAction {
                    action: ACTION_CLOSE.to_string(),
                    title: "Dismiss".to_string(),
                    icon: config.icon.clone(),
                },
            ],
        }
    }
}

/// What a click on a notification led to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClickOutcome {
    /// A window was opened on `url`.
    OpenWindow { url: String },
    /// The notification was closed without further action.
    Dismissed,
}

/// Notifications currently on display.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    shown: Mutex<HashMap<Uuid, Notification>>,
}

impl NotificationCenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Displays `notification`.
    pub async fn show(&self, notification: Notification) {
        log::info!("Showing notification {}: {}", notification.id, notification.body);
        self.shown
            .lock()
            .await
            .insert(notification.id, notification);
    }

    /// Returns the notifications on display.
    pub async fn shown(&self) -> Vec<Notification> {
        self.shown.lock().await.values().cloned().collect()
    }

    /// Handles a click on notification `id`. The notification is closed
    /// either way; every action except `close` opens its target page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `id` is not on display.
    pub async fn click(&self, id: Uuid, action: Option<&str>) -> Result<ClickOutcome> {
        let notification = self
            .shown
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| Error::InvalidState(format!("notification {id} is not shown")))?;

        Ok(if action == Some(ACTION_CLOSE) {
            ClickOutcome::Dismissed
        } else {
            ClickOutcome::OpenWindow {
                url: notification.data.url,
            }
        })
    }
}
