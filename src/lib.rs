//! Forerunner: a sidecar that keeps one container running from etcd
//! configuration and registers it with vulcand.
//!
//! ```text
//!                 ┌─────────────┐  Environment  ┌──────────────────────┐   Docker
//!   etcd watch ──►│ Environment │──────────────►│ ReconciliationEngine │──────────┐
//!                 │   Watcher   │               │ debounce, lock, pull │          │
//!                 └─────────────┘               └──────────────────────┘          ▼
//!                        │ ConfigCache                                  ┌────────────────┐
//!                        └──────────── snapshot read at restart ───────►│ TcpHealthProbe │
//!                                                                       └────────────────┘
//!                                                                          │ TcpHealth
//!                                                                          ▼
//!                                                              ┌────────────────────┐
//!                                                              │ RegistrationEngine │──► vulcand
//!                                                              └────────────────────┘
//! ```
//!
//! Every component is a listener on the [`bus::Router`]; see [`agent::Agent`]
//! for the wiring.

pub mod agent;
pub mod bus;
pub mod cli;
pub mod config;
pub mod container;
pub mod environment;
pub mod error;
pub mod health;
pub mod reconcile;
pub mod registration;
pub mod signals;
pub mod store;
pub mod testing;
