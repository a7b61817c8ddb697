//! Terminal listener that renders bus messages through `tracing`.

use crate::bus::message::{Level, Message, Topic};
use crate::bus::router::Inbox;

/// Renders every message at or above a threshold and stops on the first
/// fatal message outside of shutdown.
#[derive(Debug, Clone, Copy)]
pub struct LogSink {
    threshold: Level,
}

impl LogSink {
    /// Topics the sink listens to.
    pub const TOPICS: &'static [Topic] = Topic::ALL;

    pub fn new(threshold: Level) -> Self {
        Self { threshold }
    }

    /// Consume the inbox.
    ///
    /// Returns the fatal message that should halt the process, or `None` if
    /// the inbox closed first. Fatal `Shutdown` messages do not halt; `main`
    /// owns the grace period for those.
    pub async fn run(self, mut inbox: Inbox) -> Option<Message> {
        while let Some(message) = inbox.recv().await {
            if message.level() >= self.threshold {
                render(&message);
            }

            if halts_process(&message) {
                return Some(message);
            }
        }
        None
    }
}

/// True for a fatal message on any topic but `Shutdown`.
pub fn halts_process(message: &Message) -> bool {
    message.level() == Level::Fatal && message.topic() != Topic::Shutdown
}

/// Emit one message as a structured `tracing` event.
pub fn render(message: &Message) {
    let topic = message.topic().as_str();
    let status = message.status().as_str();
    let text = message.text();

    match message.level() {
        Level::Debug => tracing::debug!(topic, status, "{}", text),
        Level::Info => tracing::info!(topic, status, "{}", text),
        Level::Change => tracing::info!(topic, status, change = true, "{}", text),
        Level::Warning => tracing::warn!(topic, status, "{}", text),
        Level::Error => tracing::error!(topic, status, "{}", text),
        Level::Fatal => tracing::error!(topic, status, fatal = true, "{}", text),
    }
}
