//! Fiat quote provider and the payout value-loss bound.
//!
//! `validating_value_matches` is the last sanity gate before a payout is
//! broadcast: both legs are converted to USD and the payout may not exceed
//! the deposit's value by more than the configured loss bound. Unknown
//! symbols fail closed: a payout is never priced blind.

#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// USD quote source.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// USD price of one whole token.
    async fn usd_price(&self, symbol: &str) -> Result<BigDecimal>;
}

/// HTTP quote client; expects a JSON object of `{ "<SYMBOL>": "<price>" }`.
pub struct HttpRateProvider {
    url: String,
    client: reqwest::Client,
}

impl HttpRateProvider {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn usd_price(&self, symbol: &str) -> Result<BigDecimal> {
        let quotes: HashMap<String, String> = self
            .client
            .get(&self.url)
            .send()
            .await
            .wrap_err("rate service unreachable")?
            .json()
            .await
            .wrap_err("rate service returned invalid JSON")?;

        let raw = quotes
            .get(symbol)
            .or_else(|| quotes.get(&symbol.to_uppercase()))
            .ok_or_else(|| eyre!("no quote for symbol {}", symbol))?;
        BigDecimal::from_str(raw).map_err(|_| eyre!("invalid quote {} for {}", raw, symbol))
    }
}

/// Static quote table, for tests and offline runs.
#[derive(Default)]
pub struct FixedRateProvider {
    prices: HashMap<String, BigDecimal>,
}

impl FixedRateProvider {
    pub fn with_price(mut self, symbol: &str, price: &str) -> Self {
        self.prices
            .insert(symbol.to_uppercase(), BigDecimal::from_str(price).expect("valid price"));
        self
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    async fn usd_price(&self, symbol: &str) -> Result<BigDecimal> {
        self.prices
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| eyre!("no quote for symbol {}", symbol))
    }
}

/// Convert a raw-unit integer amount to a whole-token decimal.
pub fn raw_to_decimal(raw: &str, decimals: u8) -> Result<BigDecimal> {
    let v = BigDecimal::from_str(raw).map_err(|_| eyre!("invalid raw amount {}", raw))?;
    let scale = BigDecimal::from_str(&format!("1e{}", decimals))
        .map_err(|_| eyre!("invalid decimals {}", decimals))?;
    Ok(v / scale)
}

/// Cross-leg value check: the payout leg may not be worth more than the
/// deposit leg plus `max_loss_bps`. Returns Ok(()) when acceptable.
///
/// Any failure to price either leg rejects the payout.
pub async fn validating_value_matches(
    provider: &dyn RateProvider,
    source_symbol: &str,
    source_raw: &str,
    source_decimals: u8,
    target_symbol: &str,
    target_raw: &str,
    target_decimals: u8,
    max_loss_bps: u32,
) -> Result<()> {
    let source_usd = raw_to_decimal(source_raw, source_decimals)?
        * provider.usd_price(source_symbol).await?;
    let target_usd = raw_to_decimal(target_raw, target_decimals)?
        * provider.usd_price(target_symbol).await?;

    if source_usd.is_zero() {
        return Err(eyre!("source leg values to zero USD"));
    }
    if target_usd <= source_usd {
        return Ok(());
    }

    let loss = (&target_usd - &source_usd) / &source_usd;
    let bound = BigDecimal::from(max_loss_bps) / BigDecimal::from(10_000u32);
    if loss > bound {
        return Err(eyre!(
            "payout {} USD exceeds deposit {} USD beyond {} bps",
            target_usd.with_scale(6),
            source_usd.with_scale(6),
            max_loss_bps
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> FixedRateProvider {
        FixedRateProvider::default()
            .with_price("ETH", "3000")
            .with_price("USDC", "1")
    }

    #[tokio::test]
    async fn test_payout_below_deposit_passes() {
        // 1 ETH in, 0.997 ETH out
        validating_value_matches(
            &provider(),
            "ETH",
            "1000000000000000000",
            18,
            "ETH",
            "997000000000000000",
            18,
            200,
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_raw_to_decimal_scales() {
        let d = raw_to_decimal("1500000", 6).unwrap();
        assert_eq!(d, BigDecimal::from_str("1.5").unwrap());
    }

    #[tokio::test]
    async fn test_cross_symbol_within_bound_passes() {
        // 1 ETH in (3000 USD), 3030 USDC out = +1% with a 2% bound
        validating_value_matches(
            &provider(),
            "ETH",
            "1000000000000000000",
            18,
            "USDC",
            "3030000000",
            6,
            200,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_excess_payout_rejected() {
        // 1 ETH in, 1.1 ETH out = +10% against a 2% bound
        let err = validating_value_matches(
            &provider(),
            "ETH",
            "1000000000000000000",
            18,
            "ETH",
            "1100000000000000000",
            18,
            200,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exceeds deposit"));
    }

    #[tokio::test]
    async fn test_unknown_symbol_fails_closed() {
        let err = validating_value_matches(
            &provider(),
            "WBTC",
            "100000000",
            8,
            "ETH",
            "1000000000000000000",
            18,
            200,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no quote"));
    }
}
