//! Virtual networks as Linux bridges managed with `ip link`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::process::{run, run_optional};
use super::{DriverError, DriverResult, NetworkDriver, NetworkInfo, NetworkSpec};
use crate::model::NetworkState;

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    flags: Vec<String>,
}

fn parse_link_state(output: &str) -> DriverResult<NetworkState> {
    let links: Vec<Link> = serde_json::from_str(output)
        .map_err(|e| DriverError::Parse(format!("ip -j link: {e}")))?;
    let link = links
        .first()
        .ok_or_else(|| DriverError::Parse("ip -j link: empty".into()))?;
    if link.flags.iter().any(|f| f == "UP") {
        Ok(NetworkState::On)
    } else {
        Ok(NetworkState::Off)
    }
}

#[derive(Debug, Default)]
pub struct IpBridges;

impl IpBridges {
    async fn link_state(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        let output = run_optional("ip", &["-j", "link", "show", "dev", &network.bridge])
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("bridge {}", network.bridge)))?;
        Ok(NetworkInfo {
            state: parse_link_state(&output)?,
        })
    }
}

#[async_trait]
impl NetworkDriver for IpBridges {
    async fn create(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        if run_optional("ip", &["link", "show", "dev", &network.bridge])
            .await?
            .is_none()
        {
            run("ip", &["link", "add", "name", &network.bridge, "type", "bridge"]).await?;
            info!(network_id = %network.id, bridge = %network.bridge, "Bridge created");
        }
        self.link_state(network).await
    }

    async fn delete(&self, network: &NetworkSpec) -> DriverResult<()> {
        if run_optional("ip", &["link", "show", "dev", &network.bridge])
            .await?
            .is_some()
        {
            run("ip", &["link", "del", "dev", &network.bridge]).await?;
            info!(network_id = %network.id, bridge = %network.bridge, "Bridge removed");
        }
        Ok(())
    }

    async fn enable(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        run("ip", &["link", "set", "dev", &network.bridge, "up"]).await?;
        self.link_state(network).await
    }

    async fn disable(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        run("ip", &["link", "set", "dev", &network.bridge, "down"]).await?;
        self.link_state(network).await
    }

    async fn query_state(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        self.link_state(network).await
    }
}
