//! Identity allocation and peer discovery against the relay's HTTP side.

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{PROTOCOL_VERSION, SessionConfig};
use crate::error::{Error, ErrorKind};

/// Relay-side directory capability: mint fresh identities and enumerate the
/// peers currently registered under the same key.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn allocate_id(&self) -> Result<String, Error>;
    async fn list_peers(&self) -> Result<Vec<String>, Error>;
}

pub struct HttpDirectory {
    base: String,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base: config.http_endpoint(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn allocate_id(&self) -> Result<String, Error> {
        // Cache-busting query, since some relays sit behind aggressive CDNs.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let url = format!(
            "{}/id?ts={}{}&version={PROTOCOL_VERSION}",
            self.base,
            ts,
            rand::random::<u32>()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::new(ErrorKind::Network, err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::new(
                ErrorKind::ServerError,
                format!("identity allocation failed with status {}", response.status()),
            ));
        }
        let id = response
            .text()
            .await
            .map_err(|err| Error::new(ErrorKind::ServerError, err.to_string()))?;
        Ok(id.trim().to_string())
    }

    async fn list_peers(&self) -> Result<Vec<String>, Error> {
        let url = format!("{}/peers", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::new(ErrorKind::Network, err.to_string()))?;
        if !response.status().is_success() {
            // Relays reject this endpoint outright when discovery is off.
            return Err(Error::new(
                ErrorKind::ServerError,
                format!("peer listing failed with status {}", response.status()),
            ));
        }
        response
            .json::<Vec<String>>()
            .await
            .map_err(|err| Error::new(ErrorKind::ServerError, err.to_string()))
    }
}
