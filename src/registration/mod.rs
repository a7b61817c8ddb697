//! Vulcan listener: keeps an endpoint entry for this instance in vulcand's
//! etcd namespace while the container is healthy.
//!
//! The entry carries a TTL and is rewritten every half TTL, so a crashed
//! agent disappears from the load balancer on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::bus::{Inbox, Level, Messenger, Publisher, Status, Topic};
use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::store::{self, ConfigStore};

/// What to register and where.
#[derive(Debug, Clone)]
pub struct RegistrationSettings {
    pub enabled: bool,
    pub group: String,
    pub id: String,
    pub container_name: String,
    pub namespace: String,
    pub public_host: String,
    /// Container port whose published host port is advertised; 0 means none.
    pub public_port: u16,
    pub ttl: Duration,
    /// Trust TCP health instead of the container start event.
    pub tcp_health: bool,
}

impl RegistrationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.vulcan.enabled,
            group: config.group.clone(),
            id: config.id.clone(),
            container_name: config.container_name(),
            namespace: config.vulcan.namespace.clone(),
            public_host: config.vulcan.public_host.clone(),
            public_port: config.vulcan.public_port,
            ttl: config.vulcan.ttl,
            tcp_health: config.health.enabled(),
        }
    }

    /// Topic whose `Up`/`Down` changes drive registration.
    pub fn trusted_topic(&self) -> Topic {
        if self.tcp_health {
            Topic::TcpHealth
        } else {
            Topic::Docker
        }
    }

    pub fn key(&self) -> String {
        store::endpoint_key(&self.namespace, &self.group, &self.id)
    }

    fn refresh_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(1))
    }
}

/// Mirrors health transitions into vulcand's registry.
pub struct RegistrationEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ConfigStore>,
    settings: RegistrationSettings,
    key: String,
    registered: bool,
}

impl RegistrationEngine {
    pub const TOPICS: &'static [Topic] = &[
        Topic::Init,
        Topic::Shutdown,
        Topic::Docker,
        Topic::TcpHealth,
    ];

    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ConfigStore>,
        settings: RegistrationSettings,
    ) -> Self {
        let key = settings.key();
        Self {
            runtime,
            store,
            settings,
            key,
            registered: false,
        }
    }

    pub async fn run(mut self, mut inbox: Inbox, publisher: Publisher) {
        let send = publisher.messenger(Topic::Vulcan);
        let mut refresh: Option<Interval> = None;
        let trusted = self.settings.trusted_topic();

        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else {
                        return;
                    };

                    match message.topic() {
                        Topic::Init => {
                            if !self.settings.enabled {
                                return;
                            }
                            if self.settings.public_port == 0 {
                                send.error("cannot register a service on port 0").await;
                                return;
                            }
                            send.debug(format!("setting up vulcan at {}", self.key)).await;
                            refresh = Some(self.ticker());
                        }
                        Topic::Shutdown => {
                            self.deregister(&send).await;
                            send.change(Status::Down, "tearing down vulcan").await;
                            return;
                        }
                        topic if topic == trusted => {
                            if refresh.is_none() || message.level() != Level::Change {
                                continue;
                            }
                            match message.status() {
                                Status::Up if !self.registered => {
                                    if self.register(&send).await {
                                        self.registered = true;
                                        send.change(Status::Up, format!("registered {}", self.key))
                                            .await;
                                    }
                                }
                                Status::Down if self.registered => {
                                    if self.deregister(&send).await {
                                        self.registered = false;
                                        send.change(
                                            Status::Down,
                                            format!("deregistered {}", self.key),
                                        )
                                        .await;
                                    }
                                }
                                _ => {}
                            }
                        }
                        Topic::Docker | Topic::TcpHealth => {}
                        other => {
                            send.fatal(format!("vulcan can't process {} messages", other))
                                .await;
                            return;
                        }
                    }
                }
                _ = tick(&mut refresh) => {
                    if self.registered {
                        self.register(&send).await;
                    }
                }
            }
        }
    }

    fn ticker(&self) -> Interval {
        let period = self.settings.refresh_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Write `host:port` with the TTL. Failures are reported, not returned.
    async fn register(&self, send: &Messenger) -> bool {
        let settings = &self.settings;
        let port = match self
            .runtime
            .public_port(&settings.container_name, settings.public_port)
            .await
        {
            Ok(port) => port,
            Err(e) => {
                send.error(e.to_string()).await;
                return false;
            }
        };

        let address = format!("{}:{}", settings.public_host, port);
        match self.store.set(&self.key, &address, Some(settings.ttl)).await {
            Ok(()) => {
                tracing::trace!(key = %self.key, %address, "Refreshed registration");
                true
            }
            Err(e) => {
                send.error(e.to_string()).await;
                false
            }
        }
    }

    async fn deregister(&self, send: &Messenger) -> bool {
        match self.store.delete(&self.key).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                send.debug(format!("{} was not registered", self.key)).await;
                true
            }
            Err(e) => {
                send.error(e.to_string()).await;
                false
            }
        }
    }
}

async fn tick(refresh: &mut Option<Interval>) {
    match refresh {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
