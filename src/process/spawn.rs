//! Bring up a handshake-verified transport to a new process or plugin
//!
//! ```text
//! Created -> SocketPaired -> Launched -> TransportEstablished
//!         -> HandshakeSent -> HandshakeConfirmed
//! ```
//!
//! Any step can fail; the caller then gets the error and no handle.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::ProcessError;
use crate::process::echo::request_echo;
use crate::process::handler::ProcessHandler;
use crate::transport::{Role, Sender, Transport};

/// Where a spawn attempt has got to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    Created,
    SocketPaired,
    Launched,
    TransportEstablished,
    HandshakeSent,
    HandshakeConfirmed,
    Failed,
}

/// A running counterpart with a live transport to it
pub struct ProcessHandle {
    handler: Box<dyn ProcessHandler>,
    transport: Transport,
    /// Set once the counterpart has been reaped through [`ProcessHandle::wait_for_exit`]
    exited: bool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("transport", &self.transport)
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Open a new channel to the counterpart
    pub fn create_channel(&self) -> Result<Sender, ProcessError> {
        Ok(self.transport.new_send_channel()?)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Wait for the counterpart to finish on its own, without killing it.
    ///
    /// Returns its exit result. A later [`close`](Self::close) only drops the
    /// connection.
    pub async fn wait_for_exit(&mut self) -> Result<(), ProcessError> {
        if self.exited {
            return Err(ProcessError::AlreadyWaited);
        }
        let result = self.handler.wait().await;
        self.exited = true;
        result
    }

    /// Kill the counterpart, drop the connection and wait for it to finish.
    ///
    /// A failed kill is returned straight away (after dropping the connection)
    /// since waiting could then block forever.
    pub async fn close(mut self) -> Result<(), ProcessError> {
        if self.exited {
            self.transport.close();
            return Ok(());
        }
        let killed = self.handler.kill().await;
        self.transport.close();
        if let Err(e) = killed {
            warn!("Kill failed, not waiting for counterpart: {}", e);
            return Err(e);
        }
        self.handler.wait().await
    }
}

/// Spawn with the default [`BridgeConfig`]
pub async fn spawn<F>(command: &str, args: &[String], launcher: F) -> Result<ProcessHandle, ProcessError>
where
    F: FnOnce(&str, &[String], OwnedFd) -> Result<Box<dyn ProcessHandler>, ProcessError>,
{
    spawn_with_config(command, args, launcher, &BridgeConfig::default()).await
}

/// Pair a socket, hand one end to `launcher` and handshake over the other.
///
/// If anything fails after the launcher ran, the handler is killed so no
/// counterpart is left running.
pub async fn spawn_with_config<F>(
    command: &str,
    args: &[String],
    launcher: F,
    config: &BridgeConfig,
) -> Result<ProcessHandle, ProcessError>
where
    F: FnOnce(&str, &[String], OwnedFd) -> Result<Box<dyn ProcessHandler>, ProcessError>,
{
    trace_state(command, SpawnState::Created);

    let (parent, child) = UnixStream::pair().map_err(|e| fail(command, e.into()))?;
    trace_state(command, SpawnState::SocketPaired);

    let mut handler = launcher(command, args, OwnedFd::from(child)).map_err(|e| fail(command, e))?;
    trace_state(command, SpawnState::Launched);

    match connect(command, parent, config).await {
        Ok(transport) => {
            info!("{} is ready", command);
            Ok(ProcessHandle {
                handler,
                transport,
                exited: false,
            })
        }
        Err(e) => {
            let e = fail(command, e);
            if handler.kill().await.is_ok() {
                if let Err(exit) = handler.wait().await {
                    debug!("{} after failed spawn: {}", command, exit);
                }
            }
            Err(e)
        }
    }
}

async fn connect(
    command: &str,
    parent: UnixStream,
    config: &BridgeConfig,
) -> Result<Transport, ProcessError> {
    let transport = Transport::from_std_unix(parent, Role::Client, &config.transport)?;
    trace_state(command, SpawnState::TransportEstablished);

    trace_state(command, SpawnState::HandshakeSent);
    request_echo(&transport, &config.handshake_message).await?;
    trace_state(command, SpawnState::HandshakeConfirmed);
    Ok(transport)
}

fn trace_state(command: &str, state: SpawnState) {
    debug!("Spawn {}: {:?}", command, state);
}

fn fail(command: &str, e: ProcessError) -> ProcessError {
    warn!("Spawn {}: {:?} ({})", command, SpawnState::Failed, e);
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::plugin::plugin_launcher;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_spawn_plugin_and_close() {
        let handle = spawn("echo-plugin", &[], plugin_launcher()).await.unwrap();
        handle.create_channel().unwrap();
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_launcher_error_is_returned() {
        let result = spawn("missing", &[], |_: &str, _: &[String], _: OwnedFd| {
            Err(ProcessError::Launch("no such plugin".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ProcessError::Launch(ref m)) if m == "no such plugin"));
    }

    #[tokio::test]
    async fn test_channels_reach_counterpart_after_handshake() {
        let (peer_tx, peer_rx) = tokio::sync::oneshot::channel();
        let launcher = move |_: &str,
                             _: &[String],
                             socket: OwnedFd|
              -> Result<Box<dyn ProcessHandler>, ProcessError> {
            let transport =
                Transport::from_std_unix(UnixStream::from(socket), Role::Server, &Default::default())?;
            let _ = peer_tx.send(transport);
            Ok(Box::new(Idle) as Box<dyn ProcessHandler>)
        };

        let spawned = tokio::spawn(async move { spawn("custom", &[], launcher).await });
        let peer = peer_rx.await.unwrap();
        crate::process::echo::answer_handshake(&peer).await.unwrap();
        let handle = spawned.await.unwrap().unwrap();

        handle.create_channel().unwrap().send(&json!({"n": 1})).unwrap();
        let mut inbound = peer.wait_receive_channel().await.unwrap();
        assert_eq!(inbound.receive::<Value>().await.unwrap(), json!({"n": 1}));
    }

    #[derive(Default)]
    struct Calls {
        kills: std::sync::atomic::AtomicUsize,
        waits: std::sync::atomic::AtomicUsize,
    }

    /// Finishes with `code` on its own and counts the calls it gets
    struct Exits {
        code: i32,
        calls: std::sync::Arc<Calls>,
    }

    #[async_trait::async_trait]
    impl ProcessHandler for Exits {
        async fn kill(&mut self) -> Result<(), ProcessError> {
            self.calls.kills.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn wait(&mut self) -> Result<(), ProcessError> {
            self.calls.waits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.code == 0 {
                Ok(())
            } else {
                Err(ProcessError::Launch(format!("exit {}", self.code)))
            }
        }
    }

    async fn spawn_exiting(code: i32, calls: std::sync::Arc<Calls>) -> ProcessHandle {
        let (peer_tx, peer_rx) = tokio::sync::oneshot::channel();
        let launcher = move |_: &str,
                             _: &[String],
                             socket: OwnedFd|
              -> Result<Box<dyn ProcessHandler>, ProcessError> {
            let transport =
                Transport::from_std_unix(UnixStream::from(socket), Role::Server, &Default::default())?;
            let _ = peer_tx.send(transport);
            Ok(Box::new(Exits { code, calls }) as Box<dyn ProcessHandler>)
        };
        let spawned = tokio::spawn(async move { spawn("exits", &[], launcher).await });
        let peer = peer_rx.await.unwrap();
        crate::process::echo::answer_handshake(&peer).await.unwrap();
        spawned.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_wait_for_exit_then_close_skips_kill() {
        use std::sync::atomic::Ordering;

        let calls = std::sync::Arc::new(Calls::default());
        let mut handle = spawn_exiting(0, calls.clone()).await;

        handle.wait_for_exit().await.unwrap();
        assert!(matches!(
            handle.wait_for_exit().await,
            Err(ProcessError::AlreadyWaited)
        ));
        handle.close().await.unwrap();

        assert_eq!(calls.kills.load(Ordering::SeqCst), 0);
        assert_eq!(calls.waits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_failure() {
        let calls = std::sync::Arc::new(Calls::default());
        let mut handle = spawn_exiting(3, calls).await;

        let err = handle.wait_for_exit().await.unwrap_err();
        assert!(matches!(err, ProcessError::Launch(ref m) if m == "exit 3"));
        handle.close().await.unwrap();
    }

    struct Idle;

    #[async_trait::async_trait]
    impl ProcessHandler for Idle {
        async fn kill(&mut self) -> Result<(), ProcessError> {
            Ok(())
        }
        async fn wait(&mut self) -> Result<(), ProcessError> {
            Ok(())
        }
    }
}
