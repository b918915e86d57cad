use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::cancel::CancelRegistry;
use crate::config::Config;
use crate::driver::ConnectionDriver;
use crate::error::Error;

/// Accepts client sockets and spawns one [`ConnectionDriver`] per
/// connection. Accept errors are logged and the loop continues;
/// shutdown closes the listener and lets in-flight drivers complete
/// on their own.
pub struct Listener {
    config: Arc<Config>,
    registry: Arc<CancelRegistry>,
    shutdown: Arc<Notify>,
}

impl Listener {
    pub fn new(config: Arc<Config>, registry: Arc<CancelRegistry>) -> Self {
        Listener {
            config,
            registry,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn serve(&self) -> Result<(), Error> {
        let tcp_listener = TcpListener::bind(&self.config.bind)
            .await
            .map_err(|e| Error::Io(e))?;
        log::info!("listening on {}", self.config.bind);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    log::info!("shutdown requested, closing listener");
                    return Ok(());
                }
                accepted = tcp_listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let driver = ConnectionDriver::new(
                                self.config.clone(),
                                self.registry.clone(),
                                addr.to_string(),
                            );
                            tokio::spawn(driver.run(socket));
                        }
                        Err(e) => {
                            log::warn!("accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}
