//! Payout derivation from a source deposit.
//!
//! Two dialects share one entry point, selected on the transfer's version
//! prefix. V2 deposits carry a 4-digit security code in the trailing decimal
//! digits of the raw value (dealer, EBC, target-chain index); V1 deposits
//! use the legacy `9000 + chain index` code and put the cross-address
//! recipient in the calldata. Both splice the source nonce into the trailing
//! 4 digits of the payout amount (the safety code) so the destination sweep
//! can pair the maker's outbound transfer with its deposit.
//!
//! The truncate-then-splice arithmetic is wire-compatible with payouts that
//! already exist on chain; do not "simplify" it.

use alloy::primitives::U256;
use std::str::FromStr;
use std::sync::Arc;

use super::{Rule, RuleGraph, RuleSet, TokenInfo, TokenRegistry};
use crate::db::models::Transfer;
use crate::errors::EvaluateError;
use crate::types::{normalize_address, BridgeVersion};

/// The decoded trailing-4-digit security code of a V2 deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityCode {
    pub raw: u16,
    pub dealer_id: u8,
    pub ebc_id: u8,
    pub chain_index: u8,
}

impl SecurityCode {
    /// digit 0 = dealer, digit 1 = EBC, digits 2-3 = target chain index.
    pub fn parse(value: &U256) -> Self {
        let raw = (*value % U256::from(10_000u64)).to::<u64>() as u16;
        SecurityCode {
            raw,
            dealer_id: (raw / 1000) as u8,
            ebc_id: ((raw / 100) % 10) as u8,
            chain_index: (raw % 100) as u8,
        }
    }
}

/// A fully derived payout obligation.
#[derive(Debug, Clone)]
pub struct EvaluatedPayout {
    pub rule_id: String,
    pub target_chain: String,
    pub target_address: String,
    pub target_token: String,
    pub target_symbol: String,
    pub target_decimals: u8,
    /// Raw-unit payout amount with the safety code spliced in.
    pub target_amount: U256,
    pub source_symbol: String,
    pub source_token: String,
    pub dealer_address: String,
    pub ebc_address: String,
    pub withholding_fee: U256,
    pub trade_fee: U256,
    /// Addresses permitted to fulfill; the deposit receiver is always first.
    pub response_makers: Vec<String>,
}

/// Version-dispatching payout evaluator.
///
/// Deterministic for a given (transfer, rule snapshot); everything it needs
/// is injected so the matcher can hold one instance across sweeps.
pub struct RuleEvaluator {
    rules: Arc<RuleSet>,
    tokens: Arc<TokenRegistry>,
    graph: Arc<dyn RuleGraph>,
}

impl RuleEvaluator {
    pub fn new(rules: Arc<RuleSet>, tokens: Arc<TokenRegistry>, graph: Arc<dyn RuleGraph>) -> Self {
        Self { rules, tokens, graph }
    }

    pub fn evaluate(&self, transfer: &Transfer) -> Result<EvaluatedPayout, EvaluateError> {
        match BridgeVersion::from_version_str(&transfer.version) {
            Some(BridgeVersion::V2) => self.evaluate_v2(transfer),
            Some(BridgeVersion::V1) => self.evaluate_v1(transfer),
            None => Err(EvaluateError::RuleNotFound(format!(
                "unknown version {}",
                transfer.version
            ))),
        }
    }

    fn evaluate_v2(&self, transfer: &Transfer) -> Result<EvaluatedPayout, EvaluateError> {
        let value = parse_value(&transfer.value)?;
        let code = SecurityCode::parse(&value);
        let nonce = check_nonce(transfer.nonce)?;
        let owner = &transfer.receiver;
        let at = transfer.timestamp.timestamp();

        let dealer_address = self
            .graph
            .dealer(owner, at, code.dealer_id)
            .ok_or_else(|| EvaluateError::RuleNotFound(format!("dealer index {}", code.dealer_id)))?;
        let ebc_address = self
            .graph
            .ebc(owner, at, code.ebc_id)
            .ok_or_else(|| EvaluateError::RuleNotFound(format!("ebc index {}", code.ebc_id)))?;
        let target_chain = self
            .graph
            .chain(owner, at, code.chain_index)
            .ok_or_else(|| {
                EvaluateError::RuleNotFound(format!("chain index {}", code.chain_index))
            })?;

        let (source_token, target_token) = self.resolve_tokens(transfer, &target_chain)?;
        let rule = self.resolve_rule(transfer, &target_chain, source_token, target_token)?;

        let (target_amount, trade_fee) = derive_response_amount(
            value,
            U256::from(code.raw),
            rule.withholding_fee,
            rule.trade_fee_bps,
            nonce,
        )?;
        check_price_range(target_amount, rule)?;

        Ok(EvaluatedPayout {
            rule_id: rule.id.clone(),
            target_chain,
            target_address: normalize_address(&transfer.sender),
            target_token: target_token.address.clone(),
            target_symbol: target_token.symbol.clone(),
            target_decimals: target_token.decimals,
            target_amount,
            source_symbol: source_token.symbol.clone(),
            source_token: source_token.address.clone(),
            dealer_address,
            ebc_address,
            withholding_fee: rule.withholding_fee,
            trade_fee,
            response_makers: response_makers(&transfer.receiver, rule),
        })
    }

    fn evaluate_v1(&self, transfer: &Transfer) -> Result<EvaluatedPayout, EvaluateError> {
        let value = parse_value(&transfer.value)?;
        let code_raw = (value % U256::from(10_000u64)).to::<u64>() as u16;
        if code_raw < 9000 {
            return Err(EvaluateError::SecurityCodeInvalid(format!(
                "legacy chain code {} below 9000",
                code_raw
            )));
        }
        let chain_index = (code_raw - 9000) as u8;
        let nonce = check_nonce(transfer.nonce)?;
        let owner = &transfer.receiver;
        let at = transfer.timestamp.timestamp();

        let target_chain = self
            .graph
            .chain(owner, at, chain_index)
            .ok_or_else(|| EvaluateError::RuleNotFound(format!("chain index {}", chain_index)))?;

        // Cross-address payouts name the recipient in the swap calldata;
        // otherwise the payout goes back to the depositing address.
        let target_address = transfer
            .calldata
            .as_deref()
            .and_then(decode_v1_swap_data)
            .unwrap_or_else(|| normalize_address(&transfer.sender));

        let (source_token, target_token) = self.resolve_tokens(transfer, &target_chain)?;
        let rule = self.resolve_rule(transfer, &target_chain, source_token, target_token)?;

        let (target_amount, trade_fee) = derive_response_amount(
            value,
            U256::from(code_raw),
            rule.withholding_fee,
            rule.trade_fee_bps,
            nonce,
        )?;
        check_price_range(target_amount, rule)?;

        Ok(EvaluatedPayout {
            rule_id: rule.id.clone(),
            target_chain,
            target_address,
            target_token: target_token.address.clone(),
            target_symbol: target_token.symbol.clone(),
            target_decimals: target_token.decimals,
            target_amount,
            source_symbol: source_token.symbol.clone(),
            source_token: source_token.address.clone(),
            dealer_address: String::new(),
            ebc_address: String::new(),
            withholding_fee: rule.withholding_fee,
            trade_fee,
            response_makers: response_makers(&transfer.receiver, rule),
        })
    }

    fn resolve_tokens<'a>(
        &'a self,
        transfer: &Transfer,
        target_chain: &str,
    ) -> Result<(&'a TokenInfo, &'a TokenInfo), EvaluateError> {
        let source = self
            .tokens
            .by_chain_address(&transfer.chain_id, &transfer.token)
            .or_else(|| self.tokens.by_chain_symbol(&transfer.chain_id, &transfer.symbol))
            .ok_or_else(|| {
                EvaluateError::TokenNotFound(format!(
                    "{} on chain {}",
                    transfer.token, transfer.chain_id
                ))
            })?;
        let target = self.tokens.counterpart(source, target_chain).ok_or_else(|| {
            EvaluateError::TokenNotFound(format!(
                "no counterpart of {} on chain {}",
                source.symbol, target_chain
            ))
        })?;
        Ok((source, target))
    }

    fn resolve_rule<'a>(
        &'a self,
        transfer: &Transfer,
        target_chain: &str,
        source_token: &TokenInfo,
        target_token: &TokenInfo,
    ) -> Result<&'a Rule, EvaluateError> {
        self.rules
            .lookup(
                &transfer.chain_id,
                target_chain,
                &source_token.symbol,
                &target_token.symbol,
            )
            .ok_or_else(|| {
                EvaluateError::RuleNotFound(format!(
                    "{}->{} {}-{}",
                    transfer.chain_id, target_chain, source_token.symbol, target_token.symbol
                ))
            })
    }
}

fn parse_value(value: &str) -> Result<U256, EvaluateError> {
    U256::from_str(value)
        .map_err(|_| EvaluateError::SecurityCodeInvalid(format!("unparseable value {}", value)))
}

fn check_nonce(nonce: i64) -> Result<u64, EvaluateError> {
    if !(0..=9999).contains(&nonce) {
        return Err(EvaluateError::SecurityCodeInvalid(format!(
            "nonce {} outside the 4-digit safety code range",
            nonce
        )));
    }
    Ok(nonce as u64)
}

/// The core derivation. All integer arithmetic:
///
/// ```text
/// trade_amount   = value - code - withholding_fee
/// trading_fee    = trade_amount * fee_bps / 10000
/// response_raw   = ((trade_amount - trading_fee) / 10000) * 10000
/// response       = response_raw + nonce        // trailing 4 digits = safety code
/// ```
pub fn derive_response_amount(
    value: U256,
    code: U256,
    withholding_fee: U256,
    fee_bps: u64,
    nonce: u64,
) -> Result<(U256, U256), EvaluateError> {
    let ten_k = U256::from(10_000u64);

    let trade_amount = value
        .checked_sub(code)
        .and_then(|v| v.checked_sub(withholding_fee))
        .ok_or_else(|| {
            EvaluateError::AmountOutOfRange("deposit does not cover code + withholding fee".into())
        })?;

    let trading_fee = trade_amount * U256::from(fee_bps) / ten_k;
    let after_fee = trade_amount - trading_fee;

    let response_raw = (after_fee / ten_k) * ten_k;
    if response_raw.is_zero() {
        return Err(EvaluateError::AmountOutOfRange(
            "response amount truncates to zero".into(),
        ));
    }

    Ok((response_raw + U256::from(nonce), trading_fee))
}

fn check_price_range(amount: U256, rule: &Rule) -> Result<(), EvaluateError> {
    // minPrice enforcement is disabled policy; maxPrice of zero means unbounded.
    if !rule.max_price.is_zero() && amount > rule.max_price {
        return Err(EvaluateError::AmountOutOfRange(format!(
            "{} exceeds maxPrice {}",
            amount, rule.max_price
        )));
    }
    Ok(())
}

fn response_makers(receiver: &str, rule: &Rule) -> Vec<String> {
    let mut makers = vec![normalize_address(receiver)];
    for m in &rule.response_maker_list {
        let m = normalize_address(m);
        if !makers.contains(&m) {
            makers.push(m);
        }
    }
    makers
}

/// Extract the `t=<address>` recipient fragment from V1 swap calldata.
///
/// Calldata arrives either as plain text ("c=10&t=0x...") or as 0x-hex of
/// that text.
pub fn decode_v1_swap_data(calldata: &str) -> Option<String> {
    let text = if let Some(hex_body) = calldata.strip_prefix("0x") {
        let bytes = hex::decode(hex_body).ok()?;
        String::from_utf8(bytes).ok()?
    } else {
        calldata.to_string()
    };

    for part in text.split('&') {
        if let Some(addr) = part.trim().strip_prefix("t=") {
            let addr = addr.trim();
            if addr.len() == 42 && addr.starts_with("0x") && addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
                return Some(normalize_address(addr));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::JsonRuleGraph;
    use chrono::{TimeZone, Utc};

    const RULES: &str = r#"{
        "1-10": {
            "ETH-ETH": {
                "chain_0_trade_fee": "30",
                "chain_0_withholding_fee": "5000000000000",
                "maxPrice": "2000000000000000000"
            }
        }
    }"#;

    const TOKENS: &str = r#"{
        "1":  { "ETH": { "address": "0x0000000000000000000000000000000000000000", "decimals": 18, "mainnetToken": "0x0000000000000000000000000000000000000000" } },
        "10": { "ETH": { "address": "0x0000000000000000000000000000000000000000", "decimals": 18, "mainnetToken": "0x0000000000000000000000000000000000000000" } }
    }"#;

    const GRAPH: &str = r#"{
        "default": {
            "dealers": ["0xD00000000000000000000000000000000000000A", "0xD00000000000000000000000000000000000000B",
                        "0xD00000000000000000000000000000000000000C", "0xD00000000000000000000000000000000000000D",
                        "0xD00000000000000000000000000000000000000E", "0xD00000000000000000000000000000000000000F",
                        "0xD000000000000000000000000000000000000010", "0xD000000000000000000000000000000000000011",
                        "0xD000000000000000000000000000000000000012", "0xD000000000000000000000000000000000000013"],
            "ebcs":    ["0xE00000000000000000000000000000000000000A", "0xE00000000000000000000000000000000000000B",
                        "0xE00000000000000000000000000000000000000C", "0xE00000000000000000000000000000000000000D",
                        "0xE00000000000000000000000000000000000000E", "0xE00000000000000000000000000000000000000F",
                        "0xE000000000000000000000000000000000000010", "0xE000000000000000000000000000000000000011",
                        "0xE000000000000000000000000000000000000012", "0xE000000000000000000000000000000000000013"],
            "chains":  ["1", "10", "42161", "324", "8453", "59144", "5000", "204", "534352", "7777777",
                        "1", "10", "10", "42161"]
        }
    }"#;

    fn evaluator() -> RuleEvaluator {
        let mut rules = RuleSet::default();
        rules.merge_document(RULES, "maker-1").unwrap();
        RuleEvaluator::new(
            Arc::new(rules),
            Arc::new(TokenRegistry::from_json(TOKENS).unwrap()),
            Arc::new(JsonRuleGraph::from_json(GRAPH).unwrap()),
        )
    }

    fn v2_transfer(value: &str, nonce: i64) -> Transfer {
        Transfer {
            id: 1,
            hash: "0xA".to_string(),
            chain_id: "1".to_string(),
            sender: "0xUser000000000000000000000000000000000001".to_string(),
            receiver: "0xMaker00000000000000000000000000000000001".to_string(),
            token: "0x0000000000000000000000000000000000000000".to_string(),
            symbol: "ETH".to_string(),
            amount: "1.0".to_string(),
            value: value.to_string(),
            nonce,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            fee_amount: None,
            fee_token: None,
            version: "2-0".to_string(),
            calldata: None,
            status: 2,
            op_status: 0,
        }
    }

    #[test]
    fn test_security_code_digits() {
        let code = SecurityCode::parse(&U256::from_str("1000000000000009912").unwrap());
        assert_eq!(code.raw, 9912);
        assert_eq!(code.dealer_id, 9);
        assert_eq!(code.ebc_id, 9);
        assert_eq!(code.chain_index, 12);
    }

    #[test]
    fn test_happy_single_path_derivation() {
        // 1 ETH deposit, code 9912, nonce 12, 30 bps fee, 5e12 withholding
        let payout = evaluator()
            .evaluate(&v2_transfer("1000000000000009912", 12))
            .unwrap();

        assert_eq!(payout.target_chain, "10");
        assert_eq!(
            payout.target_amount % U256::from(10_000u64),
            U256::from(12u64)
        );
        assert_eq!(
            payout.target_amount,
            U256::from_str("996995015000000012").unwrap()
        );
        assert!(payout
            .response_makers
            .contains(&"0xmaker00000000000000000000000000000000001".to_string()));
        assert_eq!(payout.response_makers[0], "0xmaker00000000000000000000000000000000001");
    }

    #[test]
    fn test_safety_code_roundtrip() {
        // the destination safety code always equals the source nonce
        for nonce in [0i64, 1, 12, 999, 4321, 9999] {
            let payout = evaluator()
                .evaluate(&v2_transfer("1000000000000009912", nonce))
                .unwrap();
            assert_eq!(
                payout.target_amount % U256::from(10_000u64),
                U256::from(nonce as u64)
            );
        }
    }

    #[test]
    fn test_nonce_above_range_rejected() {
        let err = evaluator()
            .evaluate(&v2_transfer("1000000000000009912", 10_000))
            .unwrap_err();
        assert!(matches!(err, EvaluateError::SecurityCodeInvalid(_)));
    }

    #[test]
    fn test_unmapped_chain_index_is_rule_not_found() {
        // chain index 99 has no graph entry
        let err = evaluator()
            .evaluate(&v2_transfer("1000000000000009999", 12))
            .unwrap_err();
        assert!(matches!(err, EvaluateError::RuleNotFound(_)));
    }

    #[test]
    fn test_amount_above_max_price_rejected() {
        // 3 ETH > maxPrice of 2 ETH
        let err = evaluator()
            .evaluate(&v2_transfer("3000000000000009912", 12))
            .unwrap_err();
        assert!(matches!(err, EvaluateError::AmountOutOfRange(_)));
    }

    #[test]
    fn test_dust_deposit_rejected() {
        let err = evaluator().evaluate(&v2_transfer("9912", 12)).unwrap_err();
        assert!(matches!(err, EvaluateError::AmountOutOfRange(_)));
    }

    #[test]
    fn test_v1_chain_code_and_calldata_recipient() {
        let mut t = v2_transfer("1000000000000009001", 7);
        t.version = "1-0".to_string();
        t.calldata = Some("c=10&t=0xAbCd000000000000000000000000000000000123".to_string());

        let payout = evaluator().evaluate(&t).unwrap();
        assert_eq!(payout.target_chain, "10");
        assert_eq!(
            payout.target_address,
            "0xabcd000000000000000000000000000000000123"
        );
        assert_eq!(payout.target_amount % U256::from(10_000u64), U256::from(7u64));
    }

    #[test]
    fn test_v1_without_calldata_pays_back_to_sender() {
        let mut t = v2_transfer("1000000000000009001", 7);
        t.version = "1-0".to_string();

        let payout = evaluator().evaluate(&t).unwrap();
        assert_eq!(
            payout.target_address,
            "0xuser000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_v1_code_below_9000_rejected() {
        let mut t = v2_transfer("1000000000000008999", 7);
        t.version = "1-0".to_string();
        let err = evaluator().evaluate(&t).unwrap_err();
        assert!(matches!(err, EvaluateError::SecurityCodeInvalid(_)));
    }

    #[test]
    fn test_decode_v1_swap_data_hex_form() {
        let text = "c=10&t=0xAbCd000000000000000000000000000000000123";
        let hexed = format!("0x{}", hex::encode(text));
        assert_eq!(
            decode_v1_swap_data(&hexed),
            Some("0xabcd000000000000000000000000000000000123".to_string())
        );
        assert_eq!(decode_v1_swap_data("c=10"), None);
        assert_eq!(decode_v1_swap_data("t=0x123"), None);
    }
}
