//! ICE Configuration Retrieval
//!
//! Einmal pro Session, nach dem Öffnen des Control-Channels, werden die
//! ICE-Server abgeholt. Der Fetcher ist ein Trait, damit Embedder ihren
//! eigenen Request/Response-Weg einhängen können; der Default liefert die
//! statisch konfigurierten Server.

use crate::config::IceServerConfig;
use async_trait::async_trait;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Error, Debug)]
pub enum IceError {
    #[error("Failed to fetch ICE configuration: {0}")]
    FetchFailed(String),
}

/// Liefert die ICE-Server-Beschreibungen für die Peer-Connection
#[async_trait]
pub trait IceConfigFetcher: Send + Sync {
    async fn fetch_ice_servers(&self) -> Result<Vec<RTCIceServer>, IceError>;
}

/// Default-Fetcher: statische Serverliste aus der Konfiguration
pub struct StaticIceConfig {
    servers: Vec<IceServerConfig>,
}

impl StaticIceConfig {
    pub fn new(servers: Vec<IceServerConfig>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl IceConfigFetcher for StaticIceConfig {
    async fn fetch_ice_servers(&self) -> Result<Vec<RTCIceServer>, IceError> {
        Ok(self.servers.iter().cloned().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ice_servers;

    #[tokio::test]
    async fn test_static_fetcher_maps_configured_servers() {
        let fetcher = StaticIceConfig::new(default_ice_servers());
        let servers = fetcher.fetch_ice_servers().await.unwrap();

        assert!(!servers.is_empty());
        assert!(servers[0].urls[0].starts_with("stun:"));
    }
}
