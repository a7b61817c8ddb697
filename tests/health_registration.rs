//! Health probing drives vulcand registration, on the real clock.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use forerunner::agent::Agent;
use forerunner::bus::{Message, Status, Topic};
use forerunner::cli::Cli;
use forerunner::config::Config;
use forerunner::testing::{FakeRuntime, MemoryStore, Recorder};

const ENDPOINT: &str = "/vulcand/upstreams/api/endpoints/a1";

fn count(messages: &[Message], topic: Topic, status: Status) -> usize {
    messages
        .iter()
        .filter(|m| m.topic() == topic && m.is_change(status))
        .count()
}

#[tokio::test]
async fn test_health_gates_registration() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let store = Arc::new(MemoryStore::new());
    store.put("/forerunner/tag", "v1");
    store.put("/forerunner/env", "{}");
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_port(8080, port);

    let cli = Cli::try_parse_from([
        "forerunner",
        "--group",
        "api",
        "--id",
        "a1",
        "--image",
        "acme/api",
        "--tcp-health-port",
        "8080",
        "--register-vulcan",
        "--public-host",
        "10.1.2.3",
        "--public-port",
        "8080",
    ])
    .unwrap();
    let mut config = Config::from_cli(&cli).unwrap();
    config.reconcile.debounce = Duration::from_millis(10);
    config.health.interval = Duration::from_millis(20);
    config.health.timeout = Duration::from_millis(200);
    config.health.threshold = 3;

    let agent = Agent::start(&config, runtime.clone(), store.clone());
    let recorder = Recorder::attach(agent.router(), &[Topic::TcpHealth, Topic::Vulcan]);
    agent.init().await;

    let registered = recorder
        .wait_for(Duration::from_secs(5), |m| {
            count(m, Topic::Vulcan, Status::Up) == 1
        })
        .await;
    assert!(registered, "never registered: {:?}", recorder.messages());
    assert_eq!(count(&recorder.messages(), Topic::TcpHealth, Status::Up), 1);
    assert_eq!(store.value(ENDPOINT), Some(format!("10.1.2.3:{}", port)));

    drop(listener);

    let deregistered = recorder
        .wait_for(Duration::from_secs(5), |m| {
            count(m, Topic::Vulcan, Status::Down) == 1
        })
        .await;
    assert!(deregistered, "never deregistered: {:?}", recorder.messages());
    assert!(!store.contains(ENDPOINT));

    // Further failures do not repeat the transition.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let messages = recorder.messages();
    assert_eq!(count(&messages, Topic::TcpHealth, Status::Down), 1);
    assert_eq!(count(&messages, Topic::Vulcan, Status::Down), 1);

    agent.shutdown("interrupted, waiting 5s to finish").await;
    tokio::time::timeout(Duration::from_secs(2), agent.join())
        .await
        .expect("listeners did not stop");
}
