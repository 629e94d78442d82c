use crate::types::now_unix;

/// An operator-facing alert. `unique_key` lets sinks de-duplicate
/// repeated occurrences of the same condition.
#[derive(Debug, Clone)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub unique_key: String,
    pub created_at: u64,
}

impl Alert {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        unique_key: impl Into<String>,
    ) -> Self {
        Alert {
            title: title.into(),
            message: message.into(),
            unique_key: unique_key.into(),
            created_at: now_unix(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn add(&self, alert: Alert);
}

/// Default sink: alerts surface in the log stream.
pub struct LogAlerts;

impl AlertSink for LogAlerts {
    fn add(&self, alert: Alert) {
        tracing::error!(
            title = %alert.title,
            unique_key = %alert.unique_key,
            "{}",
            alert.message
        );
    }
}
