// ABOUTME: Docker backend handle over the bollard client.
// ABOUTME: Connection helpers plus crate-internal access to the raw API.

use crate::error::{Error, Result};
use crate::execution::{sealed::Sealed, ContainerClient};

/// Handle on a Docker-compatible daemon.
///
/// Cloning is cheap; the underlying bollard client is shared. The caller
/// keeps ownership of any client passed in - the library never closes it.
#[derive(Clone)]
pub struct Docker {
    client: bollard::Docker,
}

impl Docker {
    /// Wrap an already-connected bollard client.
    pub fn new(client: bollard::Docker) -> Self {
        Self { client }
    }

    /// Connect using the platform defaults (unix socket or named pipe).
    pub fn connect_local() -> Result<Self> {
        let client = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// Connect to an explicit unix socket path.
    pub fn connect_unix(socket_path: &str, timeout_secs: u64) -> Result<Self> {
        let client =
            bollard::Docker::connect_with_unix(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub(crate) fn api(&self) -> &bollard::Docker {
        &self.client
    }
}

impl Sealed for Docker {}
impl ContainerClient for Docker {}
