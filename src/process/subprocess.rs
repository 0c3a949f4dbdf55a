//! Real child processes
//!
//! The parent keeps one end of a socket pair and the child gets the other end
//! installed at a fixed descriptor (3 unless configured otherwise). The
//! descriptor number is also put in the child's environment so the child does
//! not have to guess.

use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::ProcessError;
use crate::process::handler::ProcessHandler;

/// [`ProcessHandler`] over an OS child process
#[derive(Debug)]
pub struct SubprocessHandler {
    child: Child,
    status: Option<ExitStatus>,
}

impl SubprocessHandler {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            status: None,
        }
    }

    /// OS process id, while the child has not been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl ProcessHandler for SubprocessHandler {
    /// Send SIGKILL, unless the child is already gone
    async fn kill(&mut self) -> Result<(), ProcessError> {
        if self.status.is_some() {
            return Ok(());
        }
        if let Some(status) = self.child.try_wait()? {
            debug!("Child already exited with {}", status);
            self.status = Some(status);
            return Ok(());
        }
        debug!("Killing child {:?}", self.child.id());
        self.child.start_kill()?;
        Ok(())
    }

    /// Reap the child; anything but a successful exit is [`ProcessError::Exited`]
    async fn wait(&mut self) -> Result<(), ProcessError> {
        let status = match self.status {
            Some(status) => status,
            None => {
                let status = self.child.wait().await?;
                self.status = Some(status);
                status
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Exited { status })
        }
    }
}

/// Launcher for real processes, to pass to [`spawn`](crate::process::spawn)
pub fn subprocess_launcher(
    config: BridgeConfig,
) -> impl FnOnce(&str, &[String], OwnedFd) -> Result<Box<dyn ProcessHandler>, ProcessError> {
    move |command: &str, args: &[String], socket: OwnedFd| {
        let handler = launch_subprocess(command, args, socket, &config)?;
        Ok(Box::new(handler) as Box<dyn ProcessHandler>)
    }
}

/// Start `command` with `socket` installed as descriptor `config.child_fd`
pub fn launch_subprocess(
    command: &str,
    args: &[String],
    socket: OwnedFd,
    config: &BridgeConfig,
) -> Result<SubprocessHandler, ProcessError> {
    let source: RawFd = socket.as_raw_fd();
    let target: RawFd = config.child_fd;

    let mut cmd = Command::new(command);
    cmd.args(args)
        .env(&config.fd_env_var, target.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: the hook runs between fork and exec and only makes the
    // async-signal-safe dup2/fcntl system calls.
    unsafe {
        cmd.pre_exec(move || {
            if source == target {
                // Already in place; dup2 would be a no-op that keeps CLOEXEC
                fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
            } else {
                nix::unistd::dup2(source, target)?;
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| ProcessError::Launch(format!("failed to start {}: {}", command, e)))?;
    // The child holds its own copy now
    drop(socket);

    info!("Started {} (pid {:?})", command, child.id());
    Ok(SubprocessHandler::new(child))
}

static INHERITED_TAKEN: AtomicBool = AtomicBool::new(false);

/// Child side: claim the socket the parent installed.
///
/// Can only succeed once per process.
pub fn inherited_stream(config: &BridgeConfig) -> Result<UnixStream, ProcessError> {
    let raw = std::env::var(&config.fd_env_var)
        .map_err(|_| ProcessError::NoInheritedSocket(format!("{} is not set", config.fd_env_var)))?;
    let fd: RawFd = raw.trim().parse().map_err(|_| {
        ProcessError::NoInheritedSocket(format!("{}={:?} is not a descriptor", config.fd_env_var, raw))
    })?;
    if fd < 0 {
        return Err(ProcessError::NoInheritedSocket(format!(
            "negative descriptor {}",
            fd
        )));
    }

    if INHERITED_TAKEN.swap(true, Ordering::SeqCst) {
        return Err(ProcessError::NoInheritedSocket(
            "already claimed by this process".to_string(),
        ));
    }
    if let Err(e) = fcntl(fd, FcntlArg::F_GETFD) {
        INHERITED_TAKEN.store(false, Ordering::SeqCst);
        return Err(ProcessError::NoInheritedSocket(format!(
            "descriptor {} is not open: {}",
            fd, e
        )));
    }

    // SAFETY: the descriptor is open and INHERITED_TAKEN guarantees nothing
    // else in this process claims ownership of it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    // Keep it out of our own children
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(std::io::Error::from)?;
    debug!("Claimed inherited socket on descriptor {}", fd);
    Ok(UnixStream::from(owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> SubprocessHandler {
        let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
        SubprocessHandler::new(child)
    }

    #[tokio::test]
    async fn test_clean_exit_is_ok() {
        let mut handler = shell("exit 0");
        handler.wait().await.unwrap();
        // Stored status is reused
        handler.kill().await.unwrap();
        handler.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_status() {
        let mut handler = shell("exit 3");
        let err = handler.wait().await.unwrap_err();
        assert_eq!(err.exit_status().and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_kill_is_reported_as_exit_failure() {
        use std::os::unix::process::ExitStatusExt;

        let mut handler = shell("sleep 30");
        handler.kill().await.unwrap();
        let err = handler.wait().await.unwrap_err();
        assert_eq!(
            err.exit_status().and_then(|s| s.signal()),
            Some(libc::SIGKILL)
        );
    }

    #[test]
    fn test_inherited_stream_requires_variable() {
        let config = BridgeConfig {
            fd_env_var: "CHANBRIDGE_TEST_UNSET_FD".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            inherited_stream(&config),
            Err(ProcessError::NoInheritedSocket(_))
        ));
    }
}
