//! Notification sinks.
//!
//! A sink is fire-and-forget from the workflow's point of view: it reports
//! whether the notice was handed off, and any error it raises is caught at
//! the workflow boundary and recorded as a failed notification.
//!
//! - `LogSink`: writes the notice to the log (default)
//! - `MqttSink`: publishes a JSON notice to a broker (feature: notify-mqtt)

#[cfg(feature = "notify-mqtt")]
pub mod mqtt;

#[cfg(feature = "notify-mqtt")]
pub use mqtt::MqttSink;

use anyhow::Result;
use serde::Serialize;

pub const NOTICE_SUBJECT: &str = "Blocked Emergency Exit Detected";

/// What gets sent when a human confirms an exit as blocked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub subject: String,
    pub recipient: String,
    pub image_ref: String,
    pub timestamp_s: u64,
}

impl Notice {
    pub fn blocked_exit(recipient: &str, image_ref: &str, timestamp_s: u64) -> Self {
        Self {
            subject: NOTICE_SUBJECT.to_string(),
            recipient: recipient.to_string(),
            image_ref: image_ref.to_string(),
            timestamp_s,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: bool,
}

pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, notice: &Notice) -> Result<Delivery>;
}

/// Sink that only logs. Always reports delivery.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, notice: &Notice) -> Result<Delivery> {
        log::warn!(
            "{}: to={} image={} at={}",
            notice.subject,
            notice.recipient,
            notice.image_ref,
            notice.timestamp_s
        );
        Ok(Delivery { delivered: true })
    }
}
