//! Liveness handshake
//!
//! The parent opens a channel and sends an [`EchoMessage`] with a reply channel
//! attached. The peer sends the same message back on that reply channel. Only
//! then is the connection handed to application code.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProcessError;
use crate::transport::{pipe, Transport};

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoMessage {
    pub message: String,
}

/// Parent half: send `message` and wait for the same text to come back
pub async fn request_echo(transport: &Transport, message: &str) -> Result<(), ProcessError> {
    let channel = transport
        .new_send_channel()
        .map_err(|e| ProcessError::Handshake(format!("could not open channel: {}", e)))?;
    let (mut echoes, reply) = pipe();
    channel
        .send_with_reply(
            &EchoMessage {
                message: message.to_string(),
            },
            reply,
        )
        .map_err(|e| ProcessError::Handshake(format!("could not send: {}", e)))?;
    debug!("Handshake {:?} sent", message);

    let echo: EchoMessage = echoes
        .receive()
        .await
        .map_err(|e| ProcessError::Handshake(format!("no echo received: {}", e)))?;
    if echo.message != message {
        return Err(ProcessError::Handshake(format!(
            "expected echo {:?}, got {:?}",
            message, echo.message
        )));
    }
    Ok(())
}

/// Peer half: wait for the handshake channel and echo its message back.
///
/// Returns the message that was echoed.
pub async fn answer_handshake(transport: &Transport) -> Result<String, ProcessError> {
    let mut channel = transport.wait_receive_channel().await?;
    let (echo, reply) = channel.receive_with_reply::<EchoMessage>().await?;
    let reply = reply.ok_or_else(|| {
        ProcessError::Handshake("handshake arrived without a reply channel".to_string())
    })?;
    reply.send(&EchoMessage {
        message: echo.message.clone(),
    })?;
    debug!("Answered handshake {:?}", echo.message);
    Ok(echo.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Transport::client(a).unwrap(), Transport::server(b).unwrap())
    }

    #[tokio::test]
    async fn test_handshake_completes() {
        let (parent, child) = connected_pair();
        let answer = tokio::spawn(async move { answer_handshake(&child).await });

        request_echo(&parent, "hello").await.unwrap();
        assert_eq!(answer.await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_missing_reply_channel_is_rejected() {
        let (parent, child) = connected_pair();
        parent
            .new_send_channel()
            .unwrap()
            .send(&EchoMessage {
                message: "hello".to_string(),
            })
            .unwrap();

        assert!(matches!(
            answer_handshake(&child).await,
            Err(ProcessError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_closing_fails_handshake() {
        let (parent, child) = connected_pair();
        drop(child);

        assert!(matches!(
            request_echo(&parent, "hello").await,
            Err(ProcessError::Handshake(_))
        ));
    }
}
