//! In-process stand-ins for child processes
//!
//! A plugin runs the peer half of the handshake on a Tokio task instead of in
//! a forked process. It is what tests pass to [`spawn`](crate::process::spawn)
//! when no real executable is wanted.

use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::ProcessError;
use crate::process::echo::answer_handshake;
use crate::process::handler::ProcessHandler;
use crate::transport::{Role, Transport};

/// [`ProcessHandler`] over a plugin task
pub struct PluginHandler {
    transport: Arc<Transport>,
    result: Option<oneshot::Receiver<Result<(), ProcessError>>>,
}

impl std::fmt::Debug for PluginHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandler")
            .field("transport", &self.transport)
            .field("waited", &self.result.is_none())
            .finish()
    }
}

#[async_trait]
impl ProcessHandler for PluginHandler {
    /// Close the plugin's side of the connection
    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.transport.close();
        Ok(())
    }

    /// Take the plugin task's result. Only the first call gets it.
    async fn wait(&mut self) -> Result<(), ProcessError> {
        let result = self.result.take().ok_or(ProcessError::AlreadyWaited)?;
        result.await.unwrap_or(Err(ProcessError::PluginAborted))
    }
}

/// Serve the peer half of the handshake on `stream` from a background task
pub fn run_plugin(stream: UnixStream) -> Result<PluginHandler, ProcessError> {
    run_plugin_with_config(stream, &TransportConfig::default())
}

pub fn run_plugin_with_config(
    stream: UnixStream,
    config: &TransportConfig,
) -> Result<PluginHandler, ProcessError> {
    let transport = Arc::new(Transport::from_std_unix(stream, Role::Server, config)?);
    let (result_tx, result_rx) = oneshot::channel();

    let task_transport = Arc::clone(&transport);
    tokio::spawn(async move {
        let result = answer_handshake(&task_transport).await.map(|message| {
            debug!("Plugin echoed {:?}", message);
        });
        if let Err(ref e) = result {
            debug!("Plugin handshake ended: {}", e);
        }
        let _ = result_tx.send(result);
    });

    Ok(PluginHandler {
        transport,
        result: Some(result_rx),
    })
}

/// Launcher that ignores the command and runs a plugin on the socket
pub fn plugin_launcher(
) -> impl FnOnce(&str, &[String], OwnedFd) -> Result<Box<dyn ProcessHandler>, ProcessError> {
    |command: &str, _args: &[String], socket: OwnedFd| {
        debug!("Running {} as an in-process plugin", command);
        let handler = run_plugin(UnixStream::from(socket))?;
        Ok(Box::new(handler) as Box<dyn ProcessHandler>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::echo::request_echo;

    #[tokio::test]
    async fn test_plugin_answers_and_reports_success() {
        let (parent, child) = UnixStream::pair().unwrap();
        let mut handler = run_plugin(child).unwrap();
        let transport = Transport::from_std_unix(parent, Role::Client, &Default::default()).unwrap();

        request_echo(&transport, "hello").await.unwrap();
        handler.kill().await.unwrap();
        handler.wait().await.unwrap();
        assert!(matches!(
            handler.wait().await,
            Err(ProcessError::AlreadyWaited)
        ));
    }

    #[tokio::test]
    async fn test_kill_before_handshake_reports_error() {
        let (_parent, child) = UnixStream::pair().unwrap();
        let mut handler = run_plugin(child).unwrap();

        handler.kill().await.unwrap();
        assert!(matches!(
            handler.wait().await,
            Err(ProcessError::Transport(_))
        ));
    }
}
