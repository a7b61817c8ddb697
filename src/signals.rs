//! OS signal handling.
//!
//! ## Unix
//! - **SIGINT** / **SIGTERM**: graceful shutdown ([`Signal::Interrupt`])
//! - **SIGQUIT**: halt without the grace period ([`Signal::Kill`])
//!
//! ## Other platforms
//! Only Ctrl-C is handled, as [`Signal::Interrupt`].

/// What the process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Shut down after the grace period.
    Interrupt,
    /// Stop right away.
    Kill,
}

/// Installed signal handlers; receive from them repeatedly.
#[cfg(unix)]
pub struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::Interrupt,
            _ = self.terminate.recv() => Signal::Interrupt,
            _ = self.quit.recv() => Signal::Kill,
        }
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Signal {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Signal::Interrupt,
            // Could not listen; never fire.
            Err(_) => std::future::pending().await,
        }
    }
}
