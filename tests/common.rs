//! Shared helpers for integration tests

#![allow(dead_code)]

use std::time::Duration;

use chanbridge::bus::{Bus, NetClient};

/// External deadline applied to every blocking step in these tests
pub const DEADLINE: Duration = Duration::from_secs(3);

/// Attach a fresh client to `bus` over an in-memory stream
pub async fn join(bus: &Bus, identity: &str) -> NetClient {
    let (near, far) = tokio::io::duplex(64 * 1024);
    bus.connect(far).await.expect("bus accepts connection");
    NetClient::new(near, identity).expect("client transport")
}

/// Attach a client over a Unix socket pair instead of an in-memory stream
pub async fn join_unix(bus: &Bus, identity: &str) -> NetClient {
    let (near, far) = std::os::unix::net::UnixStream::pair().expect("socket pair");
    bus.connect_std(far).await.expect("bus accepts connection");
    near.set_nonblocking(true).expect("nonblocking");
    let near = tokio::net::UnixStream::from_std(near).expect("tokio stream");
    NetClient::new(near, identity).expect("client transport")
}

/// Run `fut` under [`DEADLINE`], panicking with `what` if it expires
pub async fn within<F: std::future::Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(DEADLINE, fut).await {
        Ok(output) => output,
        Err(_) => panic!("{} did not finish within {:?}", what, DEADLINE),
    }
}
