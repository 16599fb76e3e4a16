//! Resolver for the operator's own public address.

use super::{check_status, http_client, AddressResolver, ClientError};
use crate::config::SelfIpConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;

#[derive(Debug, Deserialize)]
struct IpResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
}

impl IpResponse {
    fn address(self) -> Result<IpAddr, ClientError> {
        if !self.success {
            return Err(ClientError::InvalidResponse(format!(
                "address lookup unsuccessful: {}",
                self.message
            )));
        }
        self.message.trim().parse().map_err(|_| {
            ClientError::InvalidResponse(format!("not an IP address: {}", self.message))
        })
    }
}

/// HTTP own-address resolver.
pub struct HttpAddressResolver {
    config: SelfIpConfig,
    client: Client,
}

impl HttpAddressResolver {
    pub fn new(config: SelfIpConfig) -> Result<Self, ClientError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl AddressResolver for HttpAddressResolver {
    async fn resolve(&self) -> Result<IpAddr, ClientError> {
        let response = check_status(self.client.get(&self.config.url).send().await?).await?;
        let body: IpResponse = response.json().await.map_err(|e| {
            ClientError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;
        body.address()
    }
}
