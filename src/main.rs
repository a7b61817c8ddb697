//! Forerunner - main entry point.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use forerunner::{
    agent::Agent,
    bus::{Level, Message, log::render},
    cli::Cli,
    config::{Config, LogConfig},
    container::{ContainerRuntime, DockerRuntime},
    signals::{Signal, Signals},
    store::{ConfigStore, EtcdStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env before parsing so it can fill in flags
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_tracing(&LogConfig {
        level: cli.log_level,
        json: cli.log_json,
    });

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let runtime: Arc<dyn ContainerRuntime> =
        match DockerRuntime::connect(&config.docker.endpoint).await {
            Ok(runtime) => Arc::new(runtime),
            Err(e) => {
                tracing::error!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
        };

    let store: Arc<dyn ConfigStore> = match EtcdStore::new(config.etcd.hosts.clone()) {
        Ok(store) => Arc::new(store.with_request_timeout(config.etcd.request_timeout)),
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut signals = Signals::install()?;
    let mut agent = Agent::start(&config, runtime, store);

    tracing::info!(
        container = %config.container_name(),
        image = %config.docker.image,
        prefix = %config.etcd.prefix,
        "Starting forerunner"
    );
    agent.init().await;

    tokio::select! {
        Some(fatal) = agent.halted() => return Ok(halt(&fatal)),
        signal = signals.recv() => {
            if signal == Signal::Kill {
                return Ok(kill());
            }
        }
    }

    let grace = config.shutdown_timeout;
    agent
        .shutdown(format!("interrupted, waiting {:?} to finish", grace))
        .await;

    tokio::select! {
        _ = tokio::time::sleep(grace) => {}
        Some(fatal) = agent.halted() => return Ok(halt(&fatal)),
        signal = signals.recv() => {
            if signal == Signal::Kill {
                return Ok(kill());
            }
            tracing::warn!("Second interrupt, exiting without waiting");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(log: &LogConfig) {
    let default_directive = if log.level == Level::Debug {
        "forerunner=debug"
    } else {
        "forerunner=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    if log.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn halt(fatal: &Message) -> ExitCode {
    tracing::error!(topic = fatal.topic().as_str(), "Halting: {}", fatal.text());
    ExitCode::FAILURE
}

fn kill() -> ExitCode {
    render(&Message::shutdown("kill signal received, halting immediately"));
    ExitCode::SUCCESS
}
