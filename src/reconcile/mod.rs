//! Container reconciliation.
//!
//! A configuration change arms the [`Debouncer`]; when the quiet period ends
//! the restart runs on its own task:
//!
//! ```text
//! snapshot ─► pull image:tag ─► acquire /forerunner/locks/<group>
//!                 │ fail: Error            │ taken 100x: proceed without
//!                 ▼                        ▼
//!            (old container      find <group>-<id> ─► kill + remove
//!             keeps running)               │
//!                                          ▼
//!                                create + start ─► release lock ─► Change/Up
//! ```

pub mod debounce;
pub mod engine;

pub use debounce::Debouncer;
pub use engine::{EngineSettings, ReconciliationEngine, RestartError};
