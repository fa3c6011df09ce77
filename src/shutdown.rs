use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator for a migration run.
///
/// The first SIGINT/SIGTERM cancels the token handed to the coordinator, which
/// stops dispatching and lets in-flight work finish within its grace period.
/// A second signal exits immediately; uncommitted work stays in its
/// pre-dispatch stage and is picked up by the next `resume`.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Install signal handlers on a background task
    pub fn install_signal_handlers(&self) -> Result<()> {
        info!("Installing signal handlers for graceful shutdown");
        let token = self.token.clone();

        #[cfg(unix)]
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::spawn(async move {
            #[cfg(unix)]
            let terminated = async {
                terminate.recv().await;
            };
            #[cfg(not(unix))]
            let terminated = std::future::pending::<()>();

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for ctrl-c: {}", e);
                        return;
                    }
                }
                _ = terminated => {}
            }

            info!("Shutdown signal received; finishing in-flight work (signal again to exit now)");
            token.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second signal received; exiting without waiting");
                std::process::exit(130);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_share_cancellation() {
        let shutdown = ShutdownCoordinator::new();
        let token = shutdown.token();
        assert!(!token.is_cancelled());
        shutdown.token().cancel();
        assert!(token.is_cancelled());
    }
}
