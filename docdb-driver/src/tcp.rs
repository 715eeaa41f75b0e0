//! Use to establish a TCP connection to the server for a pool slot

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    time::timeout,
};

pub async fn tcp_stream<A: ToSocketAddrs + std::fmt::Debug>(
    connect_timeout: Duration,
    destination: A,
) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(&destination))
        .await
        .map_err(|_| {
            anyhow!(
                "destination {destination:?} did not respond to connection attempt within {connect_timeout:?}"
            )
        })?
        .with_context(|| format!("Failed to connect to destination {destination:?}"))?;
    // requests are small and latency bound
    stream.set_nodelay(true)?;
    Ok(stream)
}
