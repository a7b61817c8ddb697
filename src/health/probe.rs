//! TCP health listener: once the container reports running, connect to its
//! published port on an interval and report health transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::bus::{Inbox, Level, Messenger, Publisher, Status, Topic};
use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::health::detector::HealthDetector;

/// Where and how often to probe.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub container_name: String,
    /// Container port to probe; 0 disables the probe.
    pub port: u16,
    /// Host the published port is reachable on.
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub threshold: u32,
}

impl ProbeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            container_name: config.container_name(),
            port: config.health.port,
            host: config.health.host.clone(),
            interval: config.health.interval,
            timeout: config.health.timeout,
            threshold: config.health.threshold,
        }
    }
}

#[derive(Debug)]
enum ProbeState {
    /// Waiting for `Init`.
    Idle,
    /// No port configured.
    Disabled,
    /// Waiting for the container to come up.
    Ready,
    /// Probing on every tick.
    Probing(Interval),
}

pub struct TcpHealthProbe {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ProbeSettings,
    detector: HealthDetector,
}

impl TcpHealthProbe {
    pub const TOPICS: &'static [Topic] = &[Topic::Init, Topic::Shutdown, Topic::Docker];

    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ProbeSettings) -> Self {
        let detector = HealthDetector::new(settings.threshold);
        Self {
            runtime,
            settings,
            detector,
        }
    }

    pub async fn run(mut self, mut inbox: Inbox, publisher: Publisher) {
        let send = publisher.messenger(Topic::TcpHealth);
        let mut state = ProbeState::Idle;

        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else {
                        return;
                    };

                    match message.topic() {
                        Topic::Init => {
                            if self.settings.port == 0 {
                                send.debug("no port set, TCP health disabled").await;
                                state = ProbeState::Disabled;
                            } else if matches!(state, ProbeState::Idle) {
                                state = ProbeState::Ready;
                            }
                        }
                        Topic::Docker => {
                            if !matches!(state, ProbeState::Ready) || !message.is_change(Status::Up) {
                                continue;
                            }
                            send.info(format!(
                                "healthcheck starting on {}:{}",
                                self.settings.host, self.settings.port
                            ))
                            .await;
                            state = ProbeState::Probing(self.ticker());
                        }
                        Topic::Shutdown => return,
                        other => {
                            send.fatal(format!("TCP health can't process {} messages", other))
                                .await;
                            return;
                        }
                    }
                }
                _ = tick(&mut state) => {
                    let passed = self.probe(&send).await;
                    if let Some(healthy) = self.detector.observe(passed) {
                        let status = if healthy { Status::Up } else { Status::Down };
                        send.send(Level::Change, status, format!("healthy: {}", healthy))
                            .await;
                    }
                }
            }
        }
    }

    /// First tick one interval after arming.
    fn ticker(&self) -> Interval {
        let period = self.settings.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// One probe: resolve the published port, then connect.
    async fn probe(&self, send: &Messenger) -> bool {
        let settings = &self.settings;
        let public = match self
            .runtime
            .public_port(&settings.container_name, settings.port)
            .await
        {
            Ok(port) => port,
            Err(e) => {
                send.debug(e.to_string()).await;
                return false;
            }
        };

        let connect = TcpStream::connect((settings.host.as_str(), public));
        match tokio::time::timeout(settings.timeout, connect).await {
            Ok(Ok(_)) => {
                send.debug("check passed").await;
                true
            }
            Ok(Err(e)) => {
                send.debug(format!("dial {}:{}: {}", settings.host, public, e))
                    .await;
                false
            }
            Err(_) => {
                send.debug(format!(
                    "dial {}:{}: timed out after {:?}",
                    settings.host, public, settings.timeout
                ))
                .await;
                false
            }
        }
    }
}

async fn tick(state: &mut ProbeState) {
    match state {
        ProbeState::Probing(ticker) => {
            ticker.tick().await;
        }
        _ => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::bus::{Message, Router};
    use crate::testing::FakeRuntime;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings(port: u16) -> ProbeSettings {
        ProbeSettings {
            container_name: "api-a1".to_string(),
            port,
            host: "127.0.0.1".to_string(),
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
            threshold: 3,
        }
    }

    fn up() -> Message {
        Message::new(Topic::Docker, Level::Change, Status::Up, "container running")
    }

    async fn next_change(out: &mut Inbox) -> Message {
        tokio::time::timeout(WAIT, async {
            loop {
                let message = out.recv().await.expect("bus closed");
                if message.level() == Level::Change {
                    return message;
                }
            }
        })
        .await
        .expect("timed out waiting for a health change")
    }

    #[tokio::test]
    async fn test_reports_up_then_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public = listener.local_addr().unwrap().port();

        let runtime = Arc::new(FakeRuntime::new().with_container("api-a1"));
        runtime.set_port(8080, public);

        let router = Router::new();
        let mut out = router.subscribe(&[Topic::TcpHealth]);
        let probe = TcpHealthProbe::new(runtime.clone(), settings(8080));
        router.register(TcpHealthProbe::TOPICS, |inbox, publisher| {
            probe.run(inbox, publisher)
        });

        router.publish(Message::signal(Topic::Init)).await;
        router.publish(up()).await;

        let healthy = next_change(&mut out).await;
        assert_eq!(healthy.status(), Status::Up);
        assert_eq!(healthy.text(), "healthy: true");

        drop(listener);
        let unhealthy = next_change(&mut out).await;
        assert_eq!(unhealthy.status(), Status::Down);
        assert_eq!(unhealthy.text(), "healthy: false");
    }

    #[tokio::test]
    async fn test_disabled_without_port() {
        let runtime = Arc::new(FakeRuntime::new().with_container("api-a1"));
        let router = Router::new();
        let mut out = router.subscribe(&[Topic::TcpHealth]);
        let probe = TcpHealthProbe::new(runtime.clone(), settings(0));
        router.register(TcpHealthProbe::TOPICS, |inbox, publisher| {
            probe.run(inbox, publisher)
        });

        router.publish(Message::signal(Topic::Init)).await;
        router.publish(up()).await;

        let disabled = out.recv().await.unwrap();
        assert_eq!(disabled.level(), Level::Debug);
        assert_eq!(disabled.text(), "no port set, TCP health disabled");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out.try_recv().is_err());
        assert!(runtime.calls().iter().all(|c| !matches!(
            c,
            crate::testing::RuntimeCall::PublicPort { .. }
        )));
    }

    #[tokio::test]
    async fn test_ignores_up_before_init_and_non_change() {
        let runtime = Arc::new(FakeRuntime::new().with_container("api-a1"));
        let router = Router::new();
        let mut out = router.subscribe(&[Topic::TcpHealth]);
        let probe = TcpHealthProbe::new(runtime.clone(), settings(8080));
        let task = router.register(TcpHealthProbe::TOPICS, |inbox, publisher| {
            probe.run(inbox, publisher)
        });

        router.publish(up()).await;
        router.publish(Message::signal(Topic::Init)).await;
        router
            .publish(Message::new(Topic::Docker, Level::Info, Status::Good, "docker ready"))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out.try_recv().is_err());

        router.publish(Message::signal(Topic::Shutdown)).await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}
