//! Lifecycle interface shared by real child processes and in-process plugins

use async_trait::async_trait;

use crate::error::ProcessError;

/// Something running on the far side of a bridge connection
#[async_trait]
pub trait ProcessHandler: Send {
    /// Ask it to stop. Returns once the request is made, not once it stopped.
    async fn kill(&mut self) -> Result<(), ProcessError>;

    /// Wait for it to finish and report how it went
    async fn wait(&mut self) -> Result<(), ProcessError>;
}
