//! The event record carried on every topic.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// Bus topics. Every topic carries the same [`Message`] shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Init,
    Shutdown,
    Environment,
    Docker,
    TcpHealth,
    Vulcan,
}

impl Topic {
    /// Every topic, in declaration order.
    pub const ALL: &'static [Topic] = &[
        Topic::Init,
        Topic::Shutdown,
        Topic::Environment,
        Topic::Docker,
        Topic::TcpHealth,
        Topic::Vulcan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Init => "init",
            Topic::Shutdown => "shutdown",
            Topic::Environment => "environment",
            Topic::Docker => "docker",
            Topic::TcpHealth => "tcp-health",
            Topic::Vulcan => "vulcan",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a message.
///
/// Ordered from least to most severe. `Change` sits between `Info` and
/// `Warning` and marks a state transition rather than an informational log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    Debug,
    #[default]
    Info,
    Change,
    Warning,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Change => "change",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "change" => Ok(Level::Change),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            _ => Err(format!(
                "{} is not a valid log level (debug, info, change, warning, error, fatal)",
                s
            )),
        }
    }
}

/// Directional state attached to `Change` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Neutral,
    Good,
    Bad,
    Up,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Neutral => "neutral",
            Status::Good => "good",
            Status::Bad => "bad",
            Status::Up => "up",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: Topic,
    level: Level,
    status: Status,
    text: String,
    sent_at: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(topic: Topic, level: Level, status: Status, text: impl Into<String>) -> Self {
        Self {
            topic,
            level,
            status,
            text: text.into(),
            sent_at: Utc::now(),
        }
    }

    /// A bare `Info` message with no text, as used for `Init`.
    pub fn signal(topic: Topic) -> Self {
        Self::new(topic, Level::Info, Status::Neutral, "")
    }

    /// The `Shutdown` announcement: fatal-level, but not a failure.
    pub fn shutdown(text: impl Into<String>) -> Self {
        Self::new(Topic::Shutdown, Level::Fatal, Status::Neutral, text)
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// True for a `Change`-level message with the given status.
    pub fn is_change(&self, status: Status) -> bool {
        self.level == Level::Change && self.status == status
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({})",
            self.sent_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.topic,
            self.level
        )?;
        if !self.text.is_empty() {
            write!(f, ": {}", self.text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Change);
        assert!(Level::Change < Level::Warning);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("change".parse::<Level>().unwrap(), Level::Change);
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn test_display_omits_empty_text() {
        let msg = Message::signal(Topic::Init);
        let rendered = msg.to_string();
        assert!(rendered.ends_with("init (info)"), "got {rendered}");

        let msg = Message::new(Topic::Docker, Level::Change, Status::Up, "container running");
        assert!(msg.to_string().ends_with("docker (change): container running"));
    }

    #[test]
    fn test_shutdown_is_neutral() {
        let message = Message::shutdown("interrupted, waiting 5s to finish");
        assert_eq!(message.topic(), Topic::Shutdown);
        assert_eq!(message.level(), Level::Fatal);
        assert_eq!(message.status(), Status::Neutral);
    }

    #[test]
    fn test_is_change() {
        let up = Message::new(Topic::Docker, Level::Change, Status::Up, "");
        assert!(up.is_change(Status::Up));
        assert!(!up.is_change(Status::Down));

        let info = Message::new(Topic::Docker, Level::Info, Status::Up, "");
        assert!(!info.is_change(Status::Up));
    }
}
