//! Docker listener: restarts the workload container when its configuration
//! changes.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{Inbox, Level, Messenger, Publisher, Status, Topic};
use crate::config::Config;
use crate::container::{ContainerRef, ContainerRuntime, ContainerSpec};
use crate::environment::{CacheReader, Snapshot};
use crate::error::{ContainerError, StoreError};
use crate::reconcile::debounce::Debouncer;
use crate::store::{self, Acquisition, ConfigStore, RetryBudget, acquire_lock};

/// What the engine needs to know about the workload.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// `<group>-<id>`.
    pub container_name: String,
    /// Image without tag.
    pub image: String,
    pub registry: Option<String>,
    pub dns: Vec<String>,
    pub command: Vec<String>,
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub lock_budget: RetryBudget,
    /// Quiet period before a restart.
    pub debounce: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            container_name: config.container_name(),
            image: config.docker.image.clone(),
            registry: config.docker.registry.clone(),
            dns: config.docker.dns.clone(),
            command: config.docker.command.clone(),
            lock_key: store::lock_key(&config.group),
            lock_ttl: config.reconcile.lock_ttl,
            lock_budget: config.reconcile.lock_budget,
            debounce: config.reconcile.debounce,
        }
    }
}

/// Why a restart stopped early.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("error pulling {image}: {source}")]
    Pull {
        image: String,
        source: ContainerError,
    },

    #[error("error acquiring lock {key}: {source}")]
    Lock { key: String, source: StoreError },

    #[error("error getting containers: {0}")]
    Lookup(ContainerError),

    #[error("error removing old container: {0}")]
    Remove(ContainerError),

    #[error("could not start container: {0}")]
    Start(ContainerError),

    #[error("restart abandoned, shutting down")]
    Cancelled,
}

impl RestartError {
    /// Level the failure is reported at.
    ///
    /// A failed pull leaves the old container running, so it is only an
    /// error; everything later may have left the host without a workload.
    pub fn level(&self) -> Level {
        match self {
            RestartError::Cancelled => Level::Debug,
            RestartError::Pull { .. } => Level::Error,
            _ => Level::Fatal,
        }
    }
}

/// Performs restarts; cheap to clone into debounce tasks.
#[derive(Clone)]
struct Restarter {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ConfigStore>,
    cache: CacheReader,
    settings: Arc<EngineSettings>,
    serial: Arc<Mutex<()>>,
    stopping: CancellationToken,
    send: Messenger,
}

impl Restarter {
    async fn run(self) {
        let _serial = self.serial.lock().await;

        match self.restart().await {
            Ok(container) => {
                tracing::debug!(id = %container.id, "Container replaced");
                self.send.change(Status::Up, "container running").await;
            }
            Err(RestartError::Cancelled) => {
                self.send.debug(RestartError::Cancelled.to_string()).await;
            }
            Err(e) => self.send.send(e.level(), Status::Bad, e.to_string()).await,
        }
    }

    fn ensure_running(&self) -> Result<(), RestartError> {
        if self.stopping.is_cancelled() {
            return Err(RestartError::Cancelled);
        }
        Ok(())
    }

    async fn restart(&self) -> Result<ContainerRef, RestartError> {
        self.ensure_running()?;
        let settings = &self.settings;
        let snapshot = self.cache.snapshot();
        let image = format!("{}:{}", settings.image, snapshot.tag);

        self.send.info(format!("pulling {}", image)).await;
        let pulled = tokio::select! {
            _ = self.stopping.cancelled() => return Err(RestartError::Cancelled),
            pulled = self.runtime.pull(
                &settings.image,
                &snapshot.tag,
                settings.registry.as_deref(),
            ) => pulled,
        };
        pulled.map_err(|source| RestartError::Pull {
            image: image.clone(),
            source,
        })?;
        self.send.debug(format!("pulled {}", image)).await;

        self.send
            .debug(format!("trying to acquire lock at {}", settings.lock_key))
            .await;
        // An abandoned exclusive create is left to expire with its TTL.
        let acquired = tokio::select! {
            _ = self.stopping.cancelled() => return Err(RestartError::Cancelled),
            acquired = acquire_lock(
                self.store.clone(),
                &settings.lock_key,
                settings.lock_ttl,
                settings.lock_budget,
            ) => acquired,
        };
        let acquisition = acquired.map_err(|source| RestartError::Lock {
            key: settings.lock_key.clone(),
            source,
        })?;

        let lock = match acquisition {
            Acquisition::Held(lock) => {
                self.send
                    .debug(format!("got lock after {} tries", lock.attempts()))
                    .await;
                Some(lock)
            }
            Acquisition::GaveUp { attempts } => {
                self.send
                    .warning(format!(
                        "lock still held after {} tries, restarting without it",
                        attempts
                    ))
                    .await;
                None
            }
        };

        let result = match self.ensure_running() {
            Ok(()) => self.replace(image, &snapshot).await,
            Err(e) => Err(e),
        };

        if let Some(lock) = lock
            && let Err(e) = lock.release().await
        {
            self.send
                .warning(format!("failed to release lock: {}", e))
                .await;
        }

        result
    }

    /// Remove whatever runs under our name and start the new container.
    async fn replace(
        &self,
        image: String,
        snapshot: &Snapshot,
    ) -> Result<ContainerRef, RestartError> {
        let name = &self.settings.container_name;

        match self.runtime.find_by_name(name).await {
            Ok(existing) => {
                self.send
                    .info("container running, cleaning before restart")
                    .await;
                match self.runtime.kill_and_remove(&existing.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => self.send.warning(e.to_string()).await,
                    Err(e) => return Err(RestartError::Remove(e)),
                }
            }
            Err(e) if e.is_not_found() => self.send.debug("no container running").await,
            Err(e) => return Err(RestartError::Lookup(e)),
        }

        self.send.debug("starting new container").await;
        let spec = ContainerSpec {
            name: name.clone(),
            image,
            env: snapshot.env_pairs(),
            command: self.settings.command.clone(),
            dns: self.settings.dns.clone(),
            publish_all_ports: true,
        };

        self.runtime
            .create_and_start(&spec)
            .await
            .map_err(RestartError::Start)
    }
}

/// Subscribes to configuration changes and keeps the container in step.
pub struct ReconciliationEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ConfigStore>,
    cache: CacheReader,
    settings: Arc<EngineSettings>,
    debouncer: Debouncer,
}

impl ReconciliationEngine {
    pub const TOPICS: &'static [Topic] = &[Topic::Init, Topic::Shutdown, Topic::Environment];

    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ConfigStore>,
        cache: CacheReader,
        settings: EngineSettings,
    ) -> Self {
        let debouncer = Debouncer::new(settings.debounce);
        Self {
            runtime,
            store,
            cache,
            settings: Arc::new(settings),
            debouncer,
        }
    }

    pub async fn run(mut self, mut inbox: Inbox, publisher: Publisher) {
        let send = publisher.messenger(Topic::Docker);
        let restarter = Restarter {
            runtime: self.runtime.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            serial: Arc::new(Mutex::new(())),
            stopping: CancellationToken::new(),
            send: send.clone(),
        };

        while let Some(message) = inbox.recv().await {
            match message.topic() {
                Topic::Init => {
                    if self.settings.image.trim().is_empty() {
                        send.fatal("image is required for docker").await;
                        return;
                    }
                    send.send(
                        Level::Info,
                        Status::Good,
                        format!("docker ready ({})", self.settings.container_name),
                    )
                    .await;
                }
                Topic::Environment => {
                    if message.level() < Level::Change {
                        continue;
                    }

                    let quiet = self.debouncer.quiet();
                    if self.debouncer.schedule(restarter.clone().run()) {
                        send.debug(format!(
                            "additional configuration changes, resetting timer to {:?}",
                            quiet
                        ))
                        .await;
                    } else {
                        send.info(format!(
                            "detected configuration change, waiting {:?} to restart",
                            quiet
                        ))
                        .await;
                    }
                }
                Topic::Shutdown => {
                    restarter.stopping.cancel();
                    if self.debouncer.cancel() {
                        send.debug("dropped pending restart").await;
                    }
                    // Wait out a restart that already touched the container.
                    let _serial = restarter.serial.lock().await;
                    self.stop(&send).await;
                    return;
                }
                other => {
                    send.fatal(format!("docker can't process {} messages", other))
                        .await;
                    return;
                }
            }
        }
    }

    /// Best-effort removal of the running container.
    async fn stop(&self, send: &Messenger) {
        let name = &self.settings.container_name;
        match self.runtime.find_by_name(name).await {
            Ok(container) => {
                send.send(Level::Info, Status::Down, "shutting down container")
                    .await;
                match self.runtime.kill_and_remove(&container.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => send.warning(e.to_string()).await,
                    Err(e) => send.fatal(e.to_string()).await,
                }
            }
            Err(e) if e.is_not_found() => send.debug("no container running").await,
            Err(e) => {
                send.fatal(format!("error getting containers: {}", e))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bus::{Message, Router};
    use crate::environment::cache;
    use crate::testing::{FakeRuntime, MemoryStore, RuntimeCall};

    fn settings() -> EngineSettings {
        EngineSettings {
            container_name: "api-a1".to_string(),
            image: "acme/api".to_string(),
            registry: None,
            dns: vec!["10.0.0.2".to_string()],
            command: vec!["serve".to_string()],
            lock_key: "/forerunner/locks/api".to_string(),
            lock_ttl: Duration::from_secs(10),
            lock_budget: RetryBudget::default(),
            debounce: Duration::from_secs(2),
        }
    }

    struct Harness {
        router: Router,
        runtime: Arc<FakeRuntime>,
        store: Arc<MemoryStore>,
        out: Inbox,
    }

    fn start(runtime: FakeRuntime, store: MemoryStore, settings: EngineSettings) -> Harness {
        let router = Router::new();
        let runtime = Arc::new(runtime);
        let store = Arc::new(store);
        let (writer, reader) = cache::cache();
        writer.set_tag("v3");
        drop(writer);

        let out = router.subscribe(&[Topic::Docker]);
        let engine = ReconciliationEngine::new(runtime.clone(), store.clone(), reader, settings);
        router.register(ReconciliationEngine::TOPICS, |inbox, publisher| {
            engine.run(inbox, publisher)
        });
        Harness {
            router,
            runtime,
            store,
            out,
        }
    }

    async fn change(router: &Router) {
        router
            .publish(Message::new(
                Topic::Environment,
                Level::Change,
                Status::Neutral,
                "tag is v3",
            ))
            .await;
    }

    /// Drain until a message at `level` or above arrives.
    async fn until(out: &mut Inbox, level: Level) -> Message {
        loop {
            let message = out.recv().await.expect("bus closed");
            if message.level() >= level {
                return message;
            }
        }
    }

    #[test]
    fn test_restart_error_levels() {
        let pull = RestartError::Pull {
            image: "acme/api:v1".to_string(),
            source: ContainerError::Unavailable {
                reason: "down".to_string(),
            },
        };
        assert_eq!(pull.level(), Level::Error);
        assert_eq!(
            RestartError::Start(ContainerError::Unavailable {
                reason: "down".to_string()
            })
            .level(),
            Level::Fatal
        );
    }

    #[tokio::test]
    async fn test_init_without_image_is_fatal() {
        let mut s = settings();
        s.image = String::new();
        let mut h = start(FakeRuntime::new(), MemoryStore::new(), s);

        h.router.publish(Message::signal(Topic::Init)).await;
        let fatal = h.out.recv().await.unwrap();
        assert_eq!(fatal.level(), Level::Fatal);
        assert_eq!(fatal.text(), "image is required for docker");
    }

    #[tokio::test]
    async fn test_init_reports_ready() {
        let mut h = start(FakeRuntime::new(), MemoryStore::new(), settings());
        h.router.publish(Message::signal(Topic::Init)).await;

        let ready = h.out.recv().await.unwrap();
        assert_eq!(ready.level(), Level::Info);
        assert_eq!(ready.status(), Status::Good);
        assert_eq!(ready.text(), "docker ready (api-a1)");
    }

    #[tokio::test]
    async fn test_below_change_is_ignored() {
        let mut h = start(FakeRuntime::new(), MemoryStore::new(), settings());
        h.router
            .publish(Message::new(
                Topic::Environment,
                Level::Info,
                Status::Neutral,
                "setting watch",
            ))
            .await;
        h.router.publish(Message::signal(Topic::Shutdown)).await;

        assert_eq!(h.out.recv().await.unwrap().text(), "no container running");
        assert!(h.runtime.calls().iter().all(|c| !matches!(c, RuntimeCall::Pull { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_failure_keeps_old_container() {
        let runtime = FakeRuntime::new().with_container("api-a1");
        runtime.fail_pulls("manifest unknown");
        let mut h = start(runtime, MemoryStore::new(), settings());

        change(&h.router).await;
        let error = until(&mut h.out, Level::Error).await;

        assert_eq!(error.level(), Level::Error);
        assert!(error.text().starts_with("error pulling acme/api:v3"));
        assert_eq!(h.runtime.kills(), 0);
        assert!(h.runtime.running().is_some());
        assert_eq!(h.store.create_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_error_aborts_restart() {
        let store = MemoryStore::new();
        store.fail_creates("cluster unavailable");
        let mut h = start(FakeRuntime::new(), store, settings());

        change(&h.router).await;
        let fatal = until(&mut h.out, Level::Error).await;

        assert_eq!(fatal.level(), Level::Fatal);
        assert!(fatal.text().starts_with("error acquiring lock /forerunner/locks/api"));
        assert!(h.runtime.started().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_container_still_restarts() {
        let runtime = FakeRuntime::new().with_container("api-a1");
        runtime.vanish_on_kill();
        let mut h = start(runtime, MemoryStore::new(), settings());

        change(&h.router).await;
        let warning = until(&mut h.out, Level::Change).await;
        assert_eq!(warning.level(), Level::Warning);

        let up = until(&mut h.out, Level::Change).await;
        assert!(up.is_change(Status::Up));
        let started = h.runtime.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].image, "acme/api:v3");
        assert_eq!(started[0].dns, vec!["10.0.0.2"]);
        assert_eq!(started[0].command, vec!["serve"]);
        assert!(started[0].publish_all_ports);
        assert!(!h.store.contains("/forerunner/locks/api"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_is_fatal_and_releases_lock() {
        let runtime = FakeRuntime::new();
        runtime.fail_starts("port is already allocated");
        let mut h = start(runtime, MemoryStore::new(), settings());

        change(&h.router).await;
        let fatal = until(&mut h.out, Level::Error).await;

        assert_eq!(fatal.level(), Level::Fatal);
        assert_eq!(
            fatal.text(),
            "could not start container: Docker API error during start: port is already allocated"
        );
        assert!(!h.store.contains("/forerunner/locks/api"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_restart_and_stops_container() {
        let mut h = start(
            FakeRuntime::new().with_container("api-a1"),
            MemoryStore::new(),
            settings(),
        );

        change(&h.router).await;
        h.router.publish(Message::signal(Topic::Shutdown)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut texts = Vec::new();
        while let Ok(message) = h.out.try_recv() {
            texts.push(message.text().to_string());
        }
        assert_eq!(
            texts,
            vec![
                "detected configuration change, waiting 2s to restart",
                "dropped pending restart",
                "shutting down container",
            ]
        );
        assert!(h.runtime.started().is_empty());
        assert!(h.runtime.running().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_restart_waiting_on_lock() {
        let store = MemoryStore::new();
        store.hold_lock_for(5);
        let mut h = start(FakeRuntime::new().with_container("api-a1"), store, settings());

        change(&h.router).await;
        // Debounce fired at 2s; the first lock attempt failed.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.store.create_attempts(), 1);

        h.router.publish(Message::signal(Topic::Shutdown)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut texts = Vec::new();
        while let Ok(message) = h.out.try_recv() {
            texts.push(message.text().to_string());
        }
        assert!(texts.contains(&"restart abandoned, shutting down".to_string()));
        assert_eq!(texts.last().map(String::as_str), Some("shutting down container"));
        assert_eq!(h.store.create_attempts(), 1);
        assert!(h.runtime.started().is_empty());
        assert_eq!(h.runtime.kills(), 1);
        assert!(h.runtime.running().is_none());
    }

    #[test]
    fn test_cancelled_restart_is_quiet() {
        assert_eq!(RestartError::Cancelled.level(), Level::Debug);
    }
}
