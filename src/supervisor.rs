//! Startup sequencing: link, counter, acceptor.
//!
//! The listening socket is only created once the link provider reports the
//! link up. If bring-up fails no listener exists and nothing is admitted.

use crate::config::Config;
use crate::counter::SessionCounter;
use crate::link::{LinkError, LinkProvider};
use crate::server::{Server, ServerError};
use crate::shutdown::Shutdown;
use tracing::info;

/// Brings the echo server up in order and runs it.
pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bring up the link, create the session counter and bind the acceptor.
    pub async fn start<L: LinkProvider>(&self, link: &mut L) -> Result<Server, SupervisorError> {
        info!("Waiting for network link");
        let link_info = link.bring_up().await?;

        let counter = SessionCounter::new(self.config.max_clients);
        let server = Server::bind(self.config.clone(), counter)?;

        info!(
            local_ip = %link_info.local_ip,
            address = %server.local_addr(),
            max_clients = server.counter().max_clients(),
            "Server ready"
        );
        Ok(server)
    }

    /// Start the server and accept connections until shutdown.
    pub async fn run<L: LinkProvider>(
        &self,
        link: &mut L,
        shutdown: Shutdown,
    ) -> Result<(), SupervisorError> {
        let server = self.start(link).await?;
        server.run(shutdown).await?;
        info!("Server stopped");
        Ok(())
    }
}

/// Errors that stop the server from starting or running
#[derive(Debug)]
pub enum SupervisorError {
    Link(LinkError),
    Server(ServerError),
}

impl From<LinkError> for SupervisorError {
    fn from(e: LinkError) -> Self {
        SupervisorError::Link(e)
    }
}

impl From<ServerError> for SupervisorError {
    fn from(e: ServerError) -> Self {
        SupervisorError::Server(e)
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Link(e) => write!(f, "Network link unavailable: {e}"),
            SupervisorError::Server(e) => write!(f, "Server error: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Link(e) => Some(e),
            SupervisorError::Server(e) => Some(e),
        }
    }
}
