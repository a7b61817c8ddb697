//! Wires every listener onto one router.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bus::{LogSink, Message, Publisher, Router, Topic};
use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::environment::{self, EnvironmentWatcher};
use crate::health::{ProbeSettings, TcpHealthProbe};
use crate::reconcile::{EngineSettings, ReconciliationEngine};
use crate::registration::{RegistrationEngine, RegistrationSettings};
use crate::store::ConfigStore;

/// A running set of listeners.
///
/// Nothing happens until [`init`](Self::init) publishes the `Init` message.
pub struct Agent {
    router: Router,
    sink: Option<JoinHandle<Option<Message>>>,
    listeners: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Register the log sink, environment watcher, reconciliation engine,
    /// TCP health probe and registration engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let router = Router::new();

        let sink = LogSink::new(config.log.level);
        let sink = router.register(LogSink::TOPICS, move |inbox, _| sink.run(inbox));

        let (writer, reader) = environment::cache();
        let watcher = EnvironmentWatcher::new(store.clone(), writer, &config.etcd);
        let engine = ReconciliationEngine::new(
            runtime.clone(),
            store.clone(),
            reader,
            EngineSettings::from_config(config),
        );
        let probe = TcpHealthProbe::new(runtime.clone(), ProbeSettings::from_config(config));
        let registration = RegistrationEngine::new(
            runtime,
            store,
            RegistrationSettings::from_config(config),
        );

        let listeners = vec![
            router.register(EnvironmentWatcher::TOPICS, |inbox, publisher| {
                watcher.run(inbox, publisher)
            }),
            router.register(ReconciliationEngine::TOPICS, |inbox, publisher| {
                engine.run(inbox, publisher)
            }),
            router.register(TcpHealthProbe::TOPICS, |inbox, publisher| {
                probe.run(inbox, publisher)
            }),
            router.register(RegistrationEngine::TOPICS, |inbox, publisher| {
                registration.run(inbox, publisher)
            }),
        ];

        tracing::debug!(
            container = %config.container_name(),
            listeners = listeners.len(),
            "Agent started"
        );

        Self {
            router,
            sink: Some(sink),
            listeners,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn publisher(&self) -> Publisher {
        self.router.publisher()
    }

    /// Start every listener.
    pub async fn init(&self) {
        self.router.publish(Message::signal(Topic::Init)).await;
    }

    /// Tell every listener to wind down.
    pub async fn shutdown(&self, text: impl Into<String>) {
        self.router.publish(Message::shutdown(text)).await;
    }

    /// Resolves with the first message that should halt the process.
    ///
    /// Cancel-safe. Once the sink has finished this never resolves again.
    pub async fn halted(&mut self) -> Option<Message> {
        let Some(sink) = self.sink.as_mut() else {
            return std::future::pending().await;
        };
        let result = sink.await;
        self.sink = None;
        result.ok().flatten()
    }

    /// Wait for every listener except the log sink to return.
    pub async fn join(self) {
        for listener in self.listeners {
            if let Err(e) = listener.await {
                tracing::warn!("Listener task failed: {}", e);
            }
        }
    }
}
