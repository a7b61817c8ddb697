//! Topic router fanning bus messages out to listener tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::message::{Level, Message, Status, Topic};

/// Capacity of the router's inbound queue.
pub const INBOUND_CAPACITY: usize = 10;
/// Capacity of each subscriber's inbox.
pub const SUBSCRIBER_CAPACITY: usize = 10;

/// Receiving side handed to each listener.
pub type Inbox = mpsc::Receiver<Message>;

type Receivers = Arc<RwLock<HashMap<Topic, Vec<mpsc::Sender<Message>>>>>;

/// Write side of the router's inbound queue.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Message>,
}

impl Publisher {
    /// Enqueue a message for routing.
    ///
    /// Only waits for room in the inbound queue; it never waits on
    /// subscribers and never fails.
    pub async fn publish(&self, message: Message) {
        if self.tx.send(message).await.is_err() {
            tracing::debug!("Router loop gone, message dropped");
        }
    }

    /// A sender bound to one topic.
    pub fn messenger(&self, topic: Topic) -> Messenger {
        Messenger {
            topic,
            publisher: self.clone(),
        }
    }
}

/// Publishes messages on a fixed topic.
#[derive(Debug, Clone)]
pub struct Messenger {
    topic: Topic,
    publisher: Publisher,
}

impl Messenger {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn send(&self, level: Level, status: Status, text: impl Into<String>) {
        self.publisher
            .publish(Message::new(self.topic, level, status, text))
            .await;
    }

    pub async fn debug(&self, text: impl Into<String>) {
        self.send(Level::Debug, Status::Neutral, text).await;
    }

    pub async fn info(&self, text: impl Into<String>) {
        self.send(Level::Info, Status::Neutral, text).await;
    }

    pub async fn change(&self, status: Status, text: impl Into<String>) {
        self.send(Level::Change, status, text).await;
    }

    pub async fn warning(&self, text: impl Into<String>) {
        self.send(Level::Warning, Status::Bad, text).await;
    }

    pub async fn error(&self, text: impl Into<String>) {
        self.send(Level::Error, Status::Bad, text).await;
    }

    pub async fn fatal(&self, text: impl Into<String>) {
        self.send(Level::Fatal, Status::Bad, text).await;
    }
}

/// In-process publish/subscribe bus.
///
/// A single routing task drains the inbound queue and forwards each message
/// to every inbox registered for its topic, in registration order. A full
/// inbox stalls the routing task (and therefore every topic) until the
/// listener catches up.
pub struct Router {
    receivers: Receivers,
    publisher: Publisher,
    subscriber_capacity: usize,
    route_task: JoinHandle<()>,
}

impl Router {
    /// Create a router and spawn its routing task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_capacity(INBOUND_CAPACITY, SUBSCRIBER_CAPACITY)
    }

    /// Create a router with explicit queue capacities (minimum 1 each).
    pub fn with_capacity(inbound: usize, subscriber: usize) -> Self {
        let (tx, rx) = mpsc::channel(inbound.max(1));
        let receivers: Receivers = Arc::new(RwLock::new(HashMap::new()));
        let route_task = tokio::spawn(route(rx, Arc::clone(&receivers)));

        Self {
            receivers,
            publisher: Publisher { tx },
            subscriber_capacity: subscriber.max(1),
            route_task,
        }
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub async fn publish(&self, message: Message) {
        self.publisher.publish(message).await;
    }

    /// Subscribe a listener to `topics` and spawn it.
    ///
    /// The inbox is recorded under every topic before the listener starts, so
    /// anything published after this call returns reaches it.
    pub fn register<F, Fut>(&self, topics: &[Topic], listener: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(Inbox, Publisher) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let inbox = self.subscribe(topics);
        tokio::spawn(listener(inbox, self.publisher()))
    }

    /// Record a new inbox under `topics` without spawning anything.
    pub fn subscribe(&self, topics: &[Topic]) -> Inbox {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let mut receivers = self
            .receivers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for topic in topics {
            receivers.entry(*topic).or_default().push(tx.clone());
        }
        rx
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.route_task.abort();
    }
}

async fn route(mut rx: mpsc::Receiver<Message>, receivers: Receivers) {
    while let Some(message) = rx.recv().await {
        let targets = receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.topic())
            .cloned();

        let Some(targets) = targets else {
            continue;
        };

        for target in targets {
            // A listener that returned has dropped its inbox; skip it.
            let _ = target.send(message.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let router = Router::new();
        for _ in 0..(INBOUND_CAPACITY * 5) {
            tokio::time::timeout(
                Duration::from_secs(1),
                router.publish(Message::signal(Topic::Vulcan)),
            )
            .await
            .expect("publish must not block on an empty topic");
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber_once() {
        let router = Router::new();
        let mut first = router.subscribe(&[Topic::Docker]);
        let mut second = router.subscribe(&[Topic::Docker, Topic::Init]);

        router
            .publish(Message::new(Topic::Docker, Level::Info, Status::Neutral, "a"))
            .await;
        router
            .publish(Message::new(Topic::Docker, Level::Info, Status::Neutral, "b"))
            .await;

        for inbox in [&mut first, &mut second] {
            assert_eq!(inbox.recv().await.unwrap().text(), "a");
            assert_eq!(inbox.recv().await.unwrap().text(), "b");
        }

        // Init only goes to the second inbox.
        router.publish(Message::signal(Topic::Init)).await;
        assert_eq!(second.recv().await.unwrap().topic(), Topic::Init);
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exited_listener_does_not_stall_routing() {
        let router = Router::new();
        let quitter = router.register(&[Topic::Init], |_inbox, _out| async {});
        quitter.await.unwrap();

        let mut live = router.subscribe(&[Topic::Init]);
        router.publish(Message::signal(Topic::Init)).await;
        assert_eq!(live.recv().await.unwrap().topic(), Topic::Init);
    }

    #[tokio::test]
    async fn test_listener_can_publish_back() {
        let router = Router::new();
        let mut docker = router.subscribe(&[Topic::Docker]);

        router.register(&[Topic::Init], |mut inbox, out| async move {
            if inbox.recv().await.is_some() {
                out.messenger(Topic::Docker)
                    .change(Status::Up, "container running")
                    .await;
            }
        });

        router.publish(Message::signal(Topic::Init)).await;
        let reply = docker.recv().await.unwrap();
        assert!(reply.is_change(Status::Up));
        assert_eq!(reply.text(), "container running");
    }
}
