#![allow(dead_code)]

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;

/// Process-wide identifier, reported in status responses and logs.
pub const APP_NAME: &str = "arbitration-api";

/// Main configuration for the settlement engine
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    /// Destination chains the engine can pay out on, loaded from
    /// CHAINS_COUNT env vars.
    pub chains: Vec<ChainConfig>,
    pub makers: MakerConfig,
    pub rules: RulesConfig,
    pub settlement: SettlementConfig,
    pub alerts: AlertConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Per-chain configuration
#[derive(Clone, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier as used in transfer rows ("1", "10", ...)
    pub chain_id: String,
    pub rpc_url: String,
    /// Floor applied to maxFeePerGas / gasPrice (wei)
    #[serde(default)]
    pub min_fee_per_gas: u128,
    /// Floor applied to maxPriorityFeePerGas (wei)
    #[serde(default)]
    pub min_priority_fee_per_gas: u128,
    /// Batch payout router contract, required for the batch sequencer path
    #[serde(default)]
    pub router_address: Option<String>,
    /// Force a transaction type (0 legacy, 2 EIP-1559) instead of probing
    #[serde(default)]
    pub forced_tx_type: Option<u8>,
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("min_fee_per_gas", &self.min_fee_per_gas)
            .field("min_priority_fee_per_gas", &self.min_priority_fee_per_gas)
            .field("router_address", &self.router_address)
            .field("forced_tx_type", &self.forced_tx_type)
            .finish()
    }
}

/// Maker signing accounts; one Account is created per (chain, key).
#[derive(Clone, Deserialize)]
pub struct MakerConfig {
    pub private_keys: Vec<String>,
}

/// Custom Debug that redacts private keys to prevent accidental log leakage.
impl fmt::Debug for MakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MakerConfig")
            .field("private_keys", &format!("<{} redacted>", self.private_keys.len()))
            .finish()
    }
}

/// Rule/token configuration file locations
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// Directory holding maker-1.json .. maker-4.json
    pub rule_dir: String,
    pub token_registry_file: String,
    /// Dealer/EBC/chain-index graph (stand-in for the external provider)
    pub rule_graph_file: String,
}

/// Settlement tuning knobs
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Max acceptable value loss between source and target legs, in bps
    #[serde(default = "default_max_value_loss_bps")]
    pub max_value_loss_bps: u32,
    /// Sequencer drain poll interval
    #[serde(default = "default_sequencer_poll_ms")]
    pub sequencer_poll_ms: u64,
    /// Fiat quote endpoint; payouts fail closed without one
    #[serde(default)]
    pub rate_url: Option<String>,
}

/// Alert sink configuration
#[derive(Clone, Deserialize, Default)]
pub struct AlertConfig {
    pub tg_bot_token: Option<String>,
    pub tg_chat_id: Option<String>,
}

impl fmt::Debug for AlertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertConfig")
            .field("tg_bot_token", &self.tg_bot_token.as_ref().map(|_| "<redacted>"))
            .field("tg_chat_id", &self.tg_chat_id)
            .finish()
    }
}

/// Default functions
fn default_port() -> u16 {
    3000
}

fn default_max_value_loss_bps() -> u32 {
    200
}

fn default_sequencer_poll_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let server = ServerConfig {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_port()),
        };

        let chains = Self::load_chains_from_env()?;

        let makers = MakerConfig {
            private_keys: env::var("MAKER_PRIVATE_KEYS")
                .map_err(|_| eyre!("MAKER_PRIVATE_KEYS environment variable is required"))?
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        };

        let rules = RulesConfig {
            rule_dir: env::var("RULE_CONFIG_DIR")
                .map_err(|_| eyre!("RULE_CONFIG_DIR environment variable is required"))?,
            token_registry_file: env::var("TOKEN_REGISTRY_FILE")
                .map_err(|_| eyre!("TOKEN_REGISTRY_FILE environment variable is required"))?,
            rule_graph_file: env::var("RULE_GRAPH_FILE")
                .map_err(|_| eyre!("RULE_GRAPH_FILE environment variable is required"))?,
        };

        let settlement = SettlementConfig {
            max_value_loss_bps: env::var("MAX_VALUE_LOSS_BPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_max_value_loss_bps()),
            sequencer_poll_ms: env::var("SEQUENCER_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_sequencer_poll_ms()),
            rate_url: env::var("RATE_URL").ok(),
        };

        let alerts = AlertConfig {
            tg_bot_token: env::var("TG_BOT_TOKEN").ok(),
            tg_chat_id: env::var("TG_CHAT_ID").ok(),
        };

        let config = Config {
            database,
            server,
            chains,
            makers,
            rules,
            settlement,
            alerts,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load indexed CHAIN_<i>_* variables, CHAINS_COUNT of them.
    fn load_chains_from_env() -> Result<Vec<ChainConfig>> {
        let count: usize = env::var("CHAINS_COUNT")
            .map_err(|_| eyre!("CHAINS_COUNT environment variable is required"))?
            .parse()
            .wrap_err("CHAINS_COUNT must be a valid usize")?;

        let mut chains = Vec::with_capacity(count);
        for i in 0..count {
            let chain_id = env::var(format!("CHAIN_{}_ID", i))
                .map_err(|_| eyre!("CHAIN_{}_ID environment variable is required", i))?;
            let rpc_url = env::var(format!("CHAIN_{}_RPC_URL", i))
                .map_err(|_| eyre!("CHAIN_{}_RPC_URL environment variable is required", i))?;

            chains.push(ChainConfig {
                chain_id,
                rpc_url,
                min_fee_per_gas: env::var(format!("CHAIN_{}_MIN_FEE_PER_GAS", i))
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                min_priority_fee_per_gas: env::var(format!("CHAIN_{}_MIN_PRIORITY_FEE_PER_GAS", i))
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                router_address: env::var(format!("CHAIN_{}_ROUTER_ADDRESS", i)).ok(),
                forced_tx_type: env::var(format!("CHAIN_{}_TX_TYPE", i))
                    .ok()
                    .and_then(|v| v.parse().ok()),
            });
        }

        Ok(chains)
    }

    /// Chain lookup by transfer chain id.
    pub fn chain(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.chains.is_empty() {
            return Err(eyre!("at least one chain must be configured"));
        }

        for chain in &self.chains {
            if chain.chain_id.is_empty() {
                return Err(eyre!("chain_id cannot be empty"));
            }
            if chain.rpc_url.is_empty() {
                return Err(eyre!("rpc_url cannot be empty for chain {}", chain.chain_id));
            }
            if let Some(ref router) = chain.router_address {
                if router.len() != 42 || !router.starts_with("0x") {
                    return Err(eyre!(
                        "router_address for chain {} must be a valid hex address (42 chars with 0x prefix)",
                        chain.chain_id
                    ));
                }
            }
            if let Some(t) = chain.forced_tx_type {
                if t != 0 && t != 2 {
                    return Err(eyre!(
                        "forced tx type for chain {} must be 0 (legacy) or 2 (EIP-1559)",
                        chain.chain_id
                    ));
                }
            }
        }

        if self.makers.private_keys.is_empty() {
            return Err(eyre!("at least one maker private key is required"));
        }
        for key in &self.makers.private_keys {
            if key.len() != 66 || !key.starts_with("0x") {
                return Err(eyre!(
                    "maker private keys must be 66 chars (0x + 64 hex chars)"
                ));
            }
        }

        if self.rules.rule_dir.is_empty() {
            return Err(eyre!("rules.rule_dir cannot be empty"));
        }

        // A loss bound above 100% means the sanity check is off; refuse.
        if self.settlement.max_value_loss_bps > 10_000 {
            return Err(eyre!("settlement.max_value_loss_bps cannot exceed 10000"));
        }

        // Reject duplicate chain ids; two account sets for one chain would
        // race on nonces.
        for (i, a) in self.chains.iter().enumerate() {
            for b in &self.chains[i + 1..] {
                if a.chain_id == b.chain_id {
                    return Err(eyre!(
                        "FATAL: chain {} is configured twice; duplicate chains race on nonce state",
                        a.chain_id
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            server: ServerConfig { port: 3000 },
            chains: vec![
                ChainConfig {
                    chain_id: "1".to_string(),
                    rpc_url: "http://localhost:8545".to_string(),
                    min_fee_per_gas: 1_000_000_000,
                    min_priority_fee_per_gas: 100_000_000,
                    router_address: Some("0x0000000000000000000000000000000000000002".to_string()),
                    forced_tx_type: None,
                },
                ChainConfig {
                    chain_id: "10".to_string(),
                    rpc_url: "http://localhost:8546".to_string(),
                    min_fee_per_gas: 0,
                    min_priority_fee_per_gas: 0,
                    router_address: None,
                    forced_tx_type: Some(2),
                },
            ],
            makers: MakerConfig {
                private_keys: vec![
                    "0x0000000000000000000000000000000000000000000000000000000000000001"
                        .to_string(),
                ],
            },
            rules: RulesConfig {
                rule_dir: "./rules".to_string(),
                token_registry_file: "./rules/tokens.json".to_string(),
                rule_graph_file: "./rules/graph.json".to_string(),
            },
            settlement: SettlementConfig {
                max_value_loss_bps: 200,
                sequencer_poll_ms: 5000,
                rate_url: None,
            },
            alerts: AlertConfig::default(),
        }
    }

    #[test]
    fn test_default_port() {
        assert_eq!(default_port(), 3000);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_private_key_rejected() {
        let mut config = base_config();
        config.makers.private_keys = vec!["0x123".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_router_rejected() {
        let mut config = base_config();
        config.chains[0].router_address = Some("invalid".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_tx_type_rejected() {
        let mut config = base_config();
        config.chains[1].forced_tx_type = Some(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_chain_rejected() {
        let mut config = base_config();
        config.chains[1].chain_id = "1".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configured twice"), "{}", err);
    }

    #[test]
    fn test_loss_bound_capped() {
        let mut config = base_config();
        config.settlement.max_value_loss_bps = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chain_lookup() {
        let config = base_config();
        assert!(config.chain("10").is_some());
        assert!(config.chain("137").is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = base_config();
        let s = format!("{:?}", config);
        assert!(!s.contains("postgres://localhost/test"));
        assert!(!s.contains("0000000000000000000000000000000000000000000000000000000000000001"));
    }
}
