//! Rule configuration: maker rule files, the token registry, and the
//! dealer/EBC/chain-index graph.
//!
//! The four maker-N.json documents are loaded at startup and flattened into
//! directed rule records keyed by (source chain, target chain, source
//! symbol, target symbol). The graph behind the security code (which dealer,
//! EBC and chain an index digit resolves to) belongs to an external
//! collaborator; it is consumed through the `RuleGraph` trait with a
//! JSON-file implementation for deployments that snapshot it locally.

#![allow(dead_code)]

pub mod evaluator;

use alloy::primitives::U256;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::types::normalize_address;

/// Raw per-pair rule as it appears in maker-N.json.
///
/// Fee fields exist in two shapes: flat (`tradeFee`) and side-specific
/// (`chain_0_trade_fee`). The side-specific form wins when present; side 0
/// applies when the deposit's chain is the first chain of the pair key.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawRule {
    #[serde(rename = "tradeFee")]
    pub trade_fee: Option<String>,
    #[serde(rename = "withholdingFee")]
    pub withholding_fee: Option<String>,
    pub chain_0_trade_fee: Option<String>,
    pub chain_0_withholding_fee: Option<String>,
    pub chain_1_trade_fee: Option<String>,
    pub chain_1_withholding_fee: Option<String>,
    #[serde(rename = "minPrice")]
    pub min_price: Option<String>,
    #[serde(rename = "maxPrice")]
    pub max_price: Option<String>,
    #[serde(rename = "responseMakers")]
    pub response_makers: Option<RawResponseMakers>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawResponseMakers {
    #[serde(default)]
    pub response_maker_list: Vec<String>,
}

/// A flattened, directed payout rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// "chainA-chainB:symA-symB@maker-N"
    pub id: String,
    pub source_chain: String,
    pub target_chain: String,
    pub source_symbol: String,
    pub target_symbol: String,
    pub trade_fee_bps: u64,
    pub withholding_fee: U256,
    /// Parsed and carried; enforcement is disabled policy.
    pub min_price: U256,
    pub max_price: U256,
    /// Extra maker addresses permitted to fulfill, lowercased.
    pub response_maker_list: Vec<String>,
}

/// All rules, keyed by (source chain, target chain, source sym, target sym).
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: HashMap<(String, String, String, String), Rule>,
}

impl RuleSet {
    /// Load and flatten maker-1.json .. maker-4.json from a directory.
    /// Later files win on key collisions (the union semantics the maker
    /// config relies on).
    pub fn load_dir(dir: &str) -> Result<Self> {
        let mut set = RuleSet::default();
        let mut loaded = 0;
        for n in 1..=4 {
            let path = Path::new(dir).join(format!("maker-{}.json", n));
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            set.merge_document(&text, &format!("maker-{}", n))
                .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;
            loaded += 1;
        }
        if loaded == 0 {
            return Err(eyre!("no maker-N.json rule files found in {}", dir));
        }
        tracing::info!(files = loaded, rules = set.rules.len(), "Rule configuration loaded");
        Ok(set)
    }

    /// Merge one maker document: { "<chainA>-<chainB>": { "<symA>-<symB>": rule } }.
    /// Each pair entry produces two directed rules, one per direction, with
    /// the matching fee side.
    pub fn merge_document(&mut self, text: &str, origin: &str) -> Result<()> {
        let doc: HashMap<String, HashMap<String, RawRule>> =
            serde_json::from_str(text).wrap_err("invalid rule document")?;

        for (chain_pair, symbols) in doc {
            let (chain_a, chain_b) = split_pair(&chain_pair)
                .ok_or_else(|| eyre!("malformed chain pair key: {}", chain_pair))?;
            for (sym_pair, raw) in symbols {
                let (sym_a, sym_b) = split_pair(&sym_pair)
                    .ok_or_else(|| eyre!("malformed symbol pair key: {}", sym_pair))?;

                let id = format!("{}:{}@{}", chain_pair, sym_pair, origin);
                let makers: Vec<String> = raw
                    .response_makers
                    .as_ref()
                    .map(|m| m.response_maker_list.iter().map(|a| normalize_address(a)).collect())
                    .unwrap_or_default();

                let min_price = parse_u256_field(raw.min_price.as_deref(), "minPrice")?;
                let max_price = parse_u256_field(raw.max_price.as_deref(), "maxPrice")?;

                // Direction A -> B uses side-0 fees.
                let fwd = Rule {
                    id: id.clone(),
                    source_chain: chain_a.clone(),
                    target_chain: chain_b.clone(),
                    source_symbol: sym_a.clone(),
                    target_symbol: sym_b.clone(),
                    trade_fee_bps: side_fee(&raw, 0)?,
                    withholding_fee: side_withholding(&raw, 0)?,
                    min_price,
                    max_price,
                    response_maker_list: makers.clone(),
                };
                // Direction B -> A uses side-1 fees.
                let rev = Rule {
                    id,
                    source_chain: chain_b.clone(),
                    target_chain: chain_a.clone(),
                    source_symbol: sym_b.clone(),
                    target_symbol: sym_a.clone(),
                    trade_fee_bps: side_fee(&raw, 1)?,
                    withholding_fee: side_withholding(&raw, 1)?,
                    min_price,
                    max_price,
                    response_maker_list: makers,
                };

                self.insert(fwd);
                self.insert(rev);
            }
        }
        Ok(())
    }

    fn insert(&mut self, rule: Rule) {
        let key = (
            rule.source_chain.clone(),
            rule.target_chain.clone(),
            rule.source_symbol.clone(),
            rule.target_symbol.clone(),
        );
        self.rules.insert(key, rule);
    }

    pub fn lookup(
        &self,
        source_chain: &str,
        target_chain: &str,
        source_symbol: &str,
        target_symbol: &str,
    ) -> Option<&Rule> {
        self.rules.get(&(
            source_chain.to_string(),
            target_chain.to_string(),
            source_symbol.to_string(),
            target_symbol.to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn split_pair(key: &str) -> Option<(String, String)> {
    let mut it = key.splitn(2, '-');
    let a = it.next()?.trim();
    let b = it.next()?.trim();
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

fn parse_u256_field(v: Option<&str>, name: &str) -> Result<U256> {
    match v {
        None => Ok(U256::ZERO),
        Some(s) => U256::from_str(s).map_err(|_| eyre!("invalid {}: {}", name, s)),
    }
}

fn side_fee(raw: &RawRule, side: u8) -> Result<u64> {
    let specific = if side == 0 {
        raw.chain_0_trade_fee.as_deref()
    } else {
        raw.chain_1_trade_fee.as_deref()
    };
    let v = specific.or(raw.trade_fee.as_deref()).unwrap_or("0");
    v.parse().map_err(|_| eyre!("invalid trade fee: {}", v))
}

fn side_withholding(raw: &RawRule, side: u8) -> Result<U256> {
    let specific = if side == 0 {
        raw.chain_0_withholding_fee.as_deref()
    } else {
        raw.chain_1_withholding_fee.as_deref()
    };
    parse_u256_field(specific.or(raw.withholding_fee.as_deref()), "withholdingFee")
}

// ============ Token registry ============

/// A token deployment on one chain.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    pub decimals: u8,
    /// L1 identity used to pair deployments across chains
    #[serde(rename = "mainnetToken")]
    pub mainnet_token: String,
    #[serde(skip)]
    pub symbol: String,
    #[serde(skip)]
    pub chain_id: String,
}

/// Token deployments per chain, joinable on `mainnet_token`.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    /// (chain_id, symbol) -> token
    by_symbol: HashMap<(String, String), TokenInfo>,
    /// (chain_id, lowercased address) -> token
    by_address: HashMap<(String, String), TokenInfo>,
}

impl TokenRegistry {
    /// Load { "<chainId>": { "<symbol>": { address, decimals, mainnetToken } } }.
    pub fn load_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read token registry {}", path))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let doc: HashMap<String, HashMap<String, TokenInfo>> =
            serde_json::from_str(text).wrap_err("invalid token registry document")?;

        let mut reg = TokenRegistry::default();
        for (chain_id, tokens) in doc {
            for (symbol, mut info) in tokens {
                info.symbol = symbol.clone();
                info.chain_id = chain_id.clone();
                info.mainnet_token = normalize_address(&info.mainnet_token);
                reg.by_address.insert(
                    (chain_id.clone(), normalize_address(&info.address)),
                    info.clone(),
                );
                reg.by_symbol.insert((chain_id.clone(), symbol), info);
            }
        }
        Ok(reg)
    }

    pub fn by_chain_symbol(&self, chain_id: &str, symbol: &str) -> Option<&TokenInfo> {
        self.by_symbol.get(&(chain_id.to_string(), symbol.to_string()))
    }

    pub fn by_chain_address(&self, chain_id: &str, address: &str) -> Option<&TokenInfo> {
        self.by_address
            .get(&(chain_id.to_string(), normalize_address(address)))
    }

    /// The deployment of the same L1 token on another chain.
    pub fn counterpart(&self, token: &TokenInfo, target_chain: &str) -> Option<&TokenInfo> {
        self.by_symbol
            .values()
            .find(|t| t.chain_id == target_chain && t.mainnet_token == token.mainnet_token)
    }
}

// ============ Rule graph (external collaborator) ============

/// Resolves security-code index digits to dealer/EBC addresses and target
/// chains for an owner at a point in time.
///
/// The production provider is the on-chain rule graph service; `at` is the
/// unix timestamp of the deposit so a versioned provider can answer
/// historically. The JSON snapshot implementation ignores it.
pub trait RuleGraph: Send + Sync {
    fn dealer(&self, owner: &str, at: i64, index: u8) -> Option<String>;
    fn ebc(&self, owner: &str, at: i64, index: u8) -> Option<String>;
    /// Target chain id for a 2-digit chain index.
    fn chain(&self, owner: &str, at: i64, index: u8) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawGraphEntry {
    #[serde(default)]
    dealers: Vec<String>,
    #[serde(default)]
    ebcs: Vec<String>,
    #[serde(default)]
    chains: Vec<String>,
}

/// Rule graph loaded from a JSON snapshot:
/// { "<owner>": { dealers: [...], ebcs: [...], chains: [...] }, "default": {...} }.
/// Owner keys are lowercased; "default" answers for unknown owners.
#[derive(Debug, Default)]
pub struct JsonRuleGraph {
    entries: HashMap<String, RawGraphEntry>,
}

impl JsonRuleGraph {
    pub fn load_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read rule graph {}", path))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, RawGraphEntry> =
            serde_json::from_str(text).wrap_err("invalid rule graph document")?;
        let entries = raw
            .into_iter()
            .map(|(owner, e)| (normalize_address(&owner), e))
            .collect();
        Ok(Self { entries })
    }

    fn entry(&self, owner: &str) -> Option<&RawGraphEntry> {
        self.entries
            .get(&normalize_address(owner))
            .or_else(|| self.entries.get("default"))
    }
}

impl RuleGraph for JsonRuleGraph {
    fn dealer(&self, owner: &str, _at: i64, index: u8) -> Option<String> {
        self.entry(owner)?
            .dealers
            .get(index as usize)
            .map(|a| normalize_address(a))
    }

    fn ebc(&self, owner: &str, _at: i64, index: u8) -> Option<String> {
        self.entry(owner)?
            .ebcs
            .get(index as usize)
            .map(|a| normalize_address(a))
    }

    fn chain(&self, owner: &str, _at: i64, index: u8) -> Option<String> {
        self.entry(owner)?.chains.get(index as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"{
        "1-10": {
            "ETH-ETH": {
                "chain_0_trade_fee": "30",
                "chain_0_withholding_fee": "5000000000000",
                "chain_1_trade_fee": "10",
                "chain_1_withholding_fee": "2000000000000",
                "maxPrice": "2000000000000000000",
                "responseMakers": { "response_maker_list": ["0xMAKERB00000000000000000000000000000000002"] }
            }
        }
    }"#;

    #[test]
    fn test_flatten_produces_both_directions() {
        let mut set = RuleSet::default();
        set.merge_document(RULES, "maker-1").unwrap();
        assert_eq!(set.len(), 2);

        let fwd = set.lookup("1", "10", "ETH", "ETH").unwrap();
        assert_eq!(fwd.trade_fee_bps, 30);
        assert_eq!(fwd.withholding_fee, U256::from(5_000_000_000_000u64));

        let rev = set.lookup("10", "1", "ETH", "ETH").unwrap();
        assert_eq!(rev.trade_fee_bps, 10);
        assert_eq!(rev.withholding_fee, U256::from(2_000_000_000_000u64));
    }

    #[test]
    fn test_flat_fee_fallback() {
        let doc = r#"{ "1-10": { "USDC-USDC": { "tradeFee": "5", "withholdingFee": "100" } } }"#;
        let mut set = RuleSet::default();
        set.merge_document(doc, "maker-2").unwrap();
        let rule = set.lookup("10", "1", "USDC", "USDC").unwrap();
        assert_eq!(rule.trade_fee_bps, 5);
        assert_eq!(rule.withholding_fee, U256::from(100u64));
    }

    #[test]
    fn test_response_makers_lowercased() {
        let mut set = RuleSet::default();
        set.merge_document(RULES, "maker-1").unwrap();
        let rule = set.lookup("1", "10", "ETH", "ETH").unwrap();
        assert_eq!(
            rule.response_maker_list,
            vec!["0xmakerb00000000000000000000000000000000002"]
        );
    }

    #[test]
    fn test_malformed_pair_key_rejected() {
        let mut set = RuleSet::default();
        assert!(set.merge_document(r#"{ "1": { "ETH-ETH": {} } }"#, "x").is_err());
    }

    const TOKENS: &str = r#"{
        "1":  { "ETH": { "address": "0x0000000000000000000000000000000000000000", "decimals": 18, "mainnetToken": "0x0000000000000000000000000000000000000000" } },
        "10": { "ETH": { "address": "0x0000000000000000000000000000000000000000", "decimals": 18, "mainnetToken": "0x0000000000000000000000000000000000000000" },
                "USDC": { "address": "0x7F5c764cBc14f9669B88837ca1490cCa17c31607", "decimals": 6, "mainnetToken": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48" } }
    }"#;

    #[test]
    fn test_token_counterpart_by_mainnet_token() {
        let reg = TokenRegistry::from_json(TOKENS).unwrap();
        let eth_l1 = reg.by_chain_symbol("1", "ETH").unwrap();
        let on_op = reg.counterpart(eth_l1, "10").unwrap();
        assert_eq!(on_op.chain_id, "10");
        assert_eq!(on_op.symbol, "ETH");
    }

    #[test]
    fn test_token_lookup_by_address_is_case_insensitive() {
        let reg = TokenRegistry::from_json(TOKENS).unwrap();
        assert!(reg
            .by_chain_address("10", "0x7f5c764cbc14f9669b88837ca1490cca17c31607")
            .is_some());
    }

    const GRAPH: &str = r#"{
        "0xowner000000000000000000000000000000000001": {
            "dealers": ["0xD00000000000000000000000000000000000000A"],
            "ebcs": ["0xE00000000000000000000000000000000000000A", "0xE00000000000000000000000000000000000000B"],
            "chains": ["1", "10", "42161"]
        },
        "default": { "chains": ["1"] }
    }"#;

    #[test]
    fn test_graph_index_lookup() {
        let graph = JsonRuleGraph::from_json(GRAPH).unwrap();
        let owner = "0xOWNER000000000000000000000000000000000001";
        assert_eq!(graph.chain(owner, 0, 2), Some("42161".to_string()));
        assert_eq!(
            graph.ebc(owner, 0, 1),
            Some("0xe00000000000000000000000000000000000000b".to_string())
        );
        assert_eq!(graph.dealer(owner, 0, 1), None);
    }

    #[test]
    fn test_graph_default_fallback() {
        let graph = JsonRuleGraph::from_json(GRAPH).unwrap();
        assert_eq!(graph.chain("0xunknown", 0, 0), Some("1".to_string()));
    }
}
