//! Network link bring-up.
//!
//! The server must not listen before the host has a usable link. A
//! [`LinkProvider`] reports either "link up" with the local address or
//! "link failed" once its retries are exhausted.

use crate::config::LinkConfig;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Details of an established link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub local_ip: IpAddr,
}

/// Source of the "link up" / "link failed" signal.
pub trait LinkProvider {
    /// Wait until the link is usable or bring-up has failed for good.
    async fn bring_up(&mut self) -> Result<LinkInfo, LinkError>;
}

/// A link that is always up.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticLink;

impl LinkProvider for StaticLink {
    async fn bring_up(&mut self) -> Result<LinkInfo, LinkError> {
        Ok(LinkInfo {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        })
    }
}

/// Waits for the host to have a route to `probe_addr`.
///
/// Each attempt connects an unbound UDP socket, which selects a route and a
/// local address without sending anything.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    probe_addr: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl RouteProbe {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            probe_addr: config.probe_addr.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    async fn probe(&self) -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(self.probe_addr.as_str()).await?;
        let local_ip = socket.local_addr()?.ip();
        if local_ip.is_unspecified() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no local address assigned",
            ));
        }
        Ok(local_ip)
    }
}

impl LinkProvider for RouteProbe {
    async fn bring_up(&mut self) -> Result<LinkInfo, LinkError> {
        let attempts = self.max_retries + 1;
        let mut attempt = 1;

        loop {
            match self.probe().await {
                Ok(local_ip) => {
                    info!(local_ip = %local_ip, attempt, "Link up");
                    return Ok(LinkInfo { local_ip });
                }
                Err(e) if attempt < attempts => {
                    debug!(error = %e, attempt, "Link probe failed");
                    info!(
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Retrying link bring-up"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(error = %e, attempts, "Link bring-up failed");
                    return Err(LinkError::RetriesExhausted { attempts, last: e });
                }
            }
        }
    }
}

/// Link bring-up errors
#[derive(Debug)]
pub enum LinkError {
    RetriesExhausted { attempts: u32, last: io::Error },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::RetriesExhausted { attempts, last } => {
                write!(f, "Link not up after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::RetriesExhausted { last, .. } => Some(last),
        }
    }
}
