//! Node configuration loaded from a JSON file.

use std::net::SocketAddr;
use std::path::Path;

use meridian_consensus::constants::OPEN_SERVICE;
use meridian_consensus::ChainParams;
use meridian_primitives::Fixed64;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid arbitrator public key: {0}")]
    InvalidArbitrator(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub listen: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub magic: [u8; 4],
    pub open_service: bool,
    pub min_tx_fee: i64,
    pub min_cross_chain_tx_fee: i64,
    pub coinbase_lock_time: u32,
    /// Hex-encoded compressed public keys, in rotation order.
    pub arbitrators: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:20866".parse().expect("default listen address"),
            seeds: Vec::new(),
            magic: [0x4D, 0x52, 0x44, 0x4E],
            open_service: false,
            min_tx_fee: 100,
            min_cross_chain_tx_fee: 10_000,
            coinbase_lock_time: 100,
            arbitrators: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn services(&self) -> u64 {
        if self.open_service {
            OPEN_SERVICE
        } else {
            0
        }
    }

    pub fn chain_params(&self) -> Result<ChainParams, ConfigError> {
        let mut params = ChainParams::mainnet();
        params.min_tx_fee = Fixed64::new(self.min_tx_fee);
        params.min_cross_chain_tx_fee = Fixed64::new(self.min_cross_chain_tx_fee);
        params.coinbase_lock_time = self.coinbase_lock_time;
        params.arbitrators = self
            .arbitrators
            .iter()
            .map(|hex| {
                hex_to_bytes(hex).ok_or_else(|| ConfigError::InvalidArbitrator(hex.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(params)
    }
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut chars = hex.chars();
    while let (Some(high), Some(low)) = (chars.next(), chars.next()) {
        let high = high.to_digit(16)? as u8;
        let low = low.to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_fields() {
        let config: NodeConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(config.min_tx_fee, 100);
        assert!(!config.open_service);
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn params_pick_up_overrides() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"min_tx_fee": 500, "coinbase_lock_time": 10, "arbitrators": ["02ab"]}"#,
        )
        .expect("config");
        let params = config.chain_params().expect("params");
        assert_eq!(params.min_tx_fee, Fixed64::new(500));
        assert_eq!(params.coinbase_lock_time, 10);
        assert_eq!(params.arbitrators, vec![vec![0x02, 0xAB]]);
    }

    #[test]
    fn bad_arbitrator_hex_is_an_error() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"arbitrators": ["zz"]}"#).expect("config");
        assert!(matches!(
            config.chain_params(),
            Err(ConfigError::InvalidArbitrator(_))
        ));
    }
}
