//! Maker signing accounts.
//!
//! One account exists per (chain, private key). The broadcast path signs
//! locally, derives the tx hash from the signed bytes, persists the serial
//! relation, commits the nonce, and only then puts the raw transaction on
//! the wire, so a crash at any point leaves either no side effect or a
//! durable record of the attempted hash.

#![allow(dead_code)]

pub mod nonce;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::contracts::{OrbiterRouterV3, ERC20};
use crate::errors::{classify_send_error, SendError, SendErrorClass};
use crate::store::SerialSink;
use crate::types::normalize_address;
use nonce::{NonceManager, NonceManagers};

/// End-to-end bound on fee computation.
const FEE_TIMEOUT: Duration = Duration::from_secs(30);

/// Receipt poll cadence.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of an accepted broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    pub tx_hash: String,
    pub from: String,
    pub nonce: u64,
}

/// Summary of a mined receipt.
#[derive(Debug, Clone)]
pub struct ReceiptSummary {
    pub tx_hash: String,
    pub from: String,
    pub success: bool,
}

/// Chosen fee shape for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeSettings {
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    Legacy {
        gas_price: u128,
    },
}

/// The signing/broadcast capability the sequencer depends on.
#[async_trait]
pub trait SenderAccount: Send + Sync {
    fn address(&self) -> String;
    fn chain_id(&self) -> &str;

    async fn get_balance(&self) -> Result<U256>;
    async fn get_token_balance(&self, token: &str) -> Result<U256>;

    /// Native-asset payout to a single recipient.
    async fn transfer(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        to: &str,
        amount: U256,
    ) -> Result<BroadcastResult, SendError>;

    /// ERC-20 payout to a single recipient.
    async fn transfer_token(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        token: &str,
        to: &str,
        amount: U256,
    ) -> Result<BroadcastResult, SendError>;

    /// Native-asset batch payout through the router contract.
    async fn transfers(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        tos: &[String],
        amounts: &[U256],
    ) -> Result<BroadcastResult, SendError>;

    /// ERC-20 batch payout through the router contract.
    async fn transfer_tokens(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        token: &str,
        tos: &[String],
        amounts: &[U256],
    ) -> Result<BroadcastResult, SendError>;

    /// Poll until the transaction is mined or the timeout elapses.
    async fn wait_for_transaction_confirmation(
        &self,
        tx_hash: &str,
        timeout: Duration,
    ) -> Result<ReceiptSummary>;
}

/// An EVM maker account bound to one chain.
pub struct EvmAccount {
    chain_id: String,
    native_chain_id: u64,
    rpc_url: String,
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
    address: Address,
    min_fee_per_gas: u128,
    min_priority_fee_per_gas: u128,
    forced_tx_type: Option<u8>,
    router_address: Option<Address>,
    nonces: Arc<NonceManager>,
}

impl EvmAccount {
    pub fn new(chain: &ChainConfig, private_key: &str, nonces: Arc<NonceManager>) -> Result<Self> {
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer.clone());

        let native_chain_id: u64 = chain
            .chain_id
            .parse()
            .wrap_err_with(|| format!("chain id {} is not numeric", chain.chain_id))?;

        let router_address = match &chain.router_address {
            Some(r) => Some(Address::from_str(r).wrap_err("Invalid router address")?),
            None => None,
        };

        info!(
            address = %address,
            chain_id = %chain.chain_id,
            router = ?chain.router_address,
            "Maker account initialized"
        );

        Ok(Self {
            chain_id: chain.chain_id.clone(),
            native_chain_id,
            rpc_url: chain.rpc_url.clone(),
            signer,
            wallet,
            address,
            min_fee_per_gas: chain.min_fee_per_gas,
            min_priority_fee_per_gas: chain.min_priority_fee_per_gas,
            forced_tx_type: chain.forced_tx_type,
            router_address,
            nonces,
        })
    }

    fn provider(&self) -> Result<impl Provider<Http<Client>>, SendError> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|_| SendError::before(format!("invalid RPC URL {}", self.rpc_url)))?;
        Ok(ProviderBuilder::new().on_http(url))
    }

    fn address_string(&self) -> String {
        format!("0x{:x}", self.address)
    }

    /// Base request with sender identity filled in; fees, gas and nonce are
    /// added on the broadcast path.
    pub fn pregenerated_request_parameters(&self) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.address)
            .with_chain_id(self.native_chain_id)
    }

    // ============ Fees ============

    /// Pick the fee shape, bounded at 30 s end to end.
    async fn fee_settings(
        &self,
        provider: &impl Provider<Http<Client>>,
    ) -> Result<FeeSettings, SendError> {
        tokio::time::timeout(FEE_TIMEOUT, self.fee_settings_inner(provider))
            .await
            .map_err(|_| SendError::before("fee computation timed out"))?
    }

    async fn fee_settings_inner(
        &self,
        provider: &impl Provider<Http<Client>>,
    ) -> Result<FeeSettings, SendError> {
        match self.forced_tx_type {
            Some(0) => self.legacy_fees(provider).await,
            Some(2) => self.eip1559_fees(provider).await,
            _ => match provider.estimate_eip1559_fees(None).await {
                Ok(est) if est.max_fee_per_gas > 0 && est.max_priority_fee_per_gas > 0 => {
                    self.floor_1559(est.max_fee_per_gas, est.max_priority_fee_per_gas)
                }
                _ => self.legacy_fees(provider).await,
            },
        }
    }

    async fn eip1559_fees(
        &self,
        provider: &impl Provider<Http<Client>>,
    ) -> Result<FeeSettings, SendError> {
        let est = provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| SendError::before(format!("EIP1559 Fee fail: {}", e)))?;
        self.floor_1559(est.max_fee_per_gas, est.max_priority_fee_per_gas)
    }

    fn floor_1559(&self, max_fee: u128, max_priority: u128) -> Result<FeeSettings, SendError> {
        let max_fee_per_gas = max_fee.max(self.min_fee_per_gas);
        let max_priority_fee_per_gas = max_priority.max(self.min_priority_fee_per_gas);
        if max_fee_per_gas == 0 || max_priority_fee_per_gas == 0 {
            return Err(SendError::before("EIP1559 Fee fail: zero fee component"));
        }
        Ok(FeeSettings::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn legacy_fees(
        &self,
        provider: &impl Provider<Http<Client>>,
    ) -> Result<FeeSettings, SendError> {
        let price = provider
            .get_gas_price()
            .await
            .map_err(|e| SendError::before(format!("gasPrice Fee fail: {}", e)))?;
        let gas_price = price.max(self.min_fee_per_gas);
        if gas_price == 0 {
            return Err(SendError::before("gasPrice Fee fail: zero gas price"));
        }
        Ok(FeeSettings::Legacy { gas_price })
    }

    // ============ Broadcast core ============

    /// Sign, anchor, commit the nonce, broadcast. In that order.
    ///
    /// Every failure before `send_raw_transaction` returns is a before
    /// error; the vended nonce rolls back (or the manager re-syncs from the
    /// chain when the node says the nonce is stale). A failure after the
    /// call may have landed and is an after error.
    async fn sign_and_broadcast(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        mut request: TransactionRequest,
    ) -> Result<BroadcastResult, SendError> {
        let provider = self.provider()?;

        match self.fee_settings(&provider).await? {
            FeeSettings::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                request = request
                    .with_max_fee_per_gas(max_fee_per_gas)
                    .with_max_priority_fee_per_gas(max_priority_fee_per_gas);
            }
            FeeSettings::Legacy { gas_price } => {
                request = request.with_gas_price(gas_price);
            }
        }

        let gas = provider
            .estimate_gas(&request)
            .await
            .map_err(|e| SendError::before(format!("gas estimation failed: {}", e)))?;
        request = request.with_gas_limit(gas);

        if !self.nonces.is_initialized() {
            let chain_nonce = provider
                .get_transaction_count(self.address)
                .pending()
                .await
                .map_err(|e| SendError::before(format!("nonce fetch failed: {}", e)))?;
            self.nonces.initialize(chain_nonce);
        }

        // Dropped on any early return below, which rolls the nonce back.
        let handle = self.nonces.next_nonce();
        let nonce = handle.nonce();
        request = request.with_nonce(nonce);

        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| SendError::before(format!("signing failed: {}", e)))?;

        let tx_hash = format!("0x{:x}", envelope.tx_hash());
        let raw = envelope.encoded_2718();

        // The durable anchor: after this write, the attempted hash survives
        // a crash even if the broadcast outcome is never observed.
        serial
            .save_serial_rel_tx_hash(source_ids, &tx_hash, &self.address_string())
            .await
            .map_err(|e| SendError::before(format!("serial persist failed: {}", e)))?;

        handle.submit();

        debug!(
            tx_hash = %tx_hash,
            nonce,
            chain_id = %self.chain_id,
            sources = source_ids.len(),
            "Broadcasting payout"
        );

        match provider.send_raw_transaction(&raw).await {
            Ok(_) => Ok(BroadcastResult {
                tx_hash,
                from: self.address_string(),
                nonce,
            }),
            Err(e) => {
                let text = e.to_string();
                match classify_send_error(&text) {
                    SendErrorClass::NonceExpired => {
                        self.refresh_nonce_from_chain(&provider).await;
                        Err(SendError::before(format!("NONCE_EXPIRED: {}", text)))
                    }
                    SendErrorClass::Rejected => {
                        // Definitely not accepted; re-sync so the committed
                        // nonce does not leave a gap.
                        self.refresh_nonce_from_chain(&provider).await;
                        Err(SendError::before(format!("broadcast rejected: {}", text)))
                    }
                    SendErrorClass::Unknown => Err(SendError::after(format!(
                        "broadcast failed: {} (tx {})",
                        text, tx_hash
                    ))),
                }
            }
        }
    }

    async fn refresh_nonce_from_chain(&self, provider: &impl Provider<Http<Client>>) {
        match provider.get_transaction_count(self.address).pending().await {
            Ok(chain_nonce) => self.nonces.force_refresh(chain_nonce),
            Err(e) => warn!(error = %e, "Failed to refresh nonce from chain"),
        }
    }

    /// Re-read the chain's pending nonce, discarding local issuance state.
    pub async fn force_refresh_nonce(&self) -> Result<()> {
        let provider = self
            .provider()
            .map_err(|e| eyre!("provider unavailable: {}", e))?;
        let chain_nonce = provider
            .get_transaction_count(self.address)
            .pending()
            .await
            .wrap_err("Failed to fetch pending nonce")?;
        self.nonces.force_refresh(chain_nonce);
        Ok(())
    }

    /// One-shot receipt probe; `None` when the transaction is unknown to
    /// the chain (dropped or still pending).
    pub async fn check_transaction_receipt(&self, tx_hash: &str) -> Result<Option<ReceiptSummary>> {
        let provider = self
            .provider()
            .map_err(|e| eyre!("provider unavailable: {}", e))?;
        let hash: B256 = tx_hash.parse().wrap_err("Invalid transaction hash")?;
        match provider.get_transaction_receipt(hash).await? {
            Some(receipt) => Ok(Some(ReceiptSummary {
                tx_hash: tx_hash.to_string(),
                from: format!("0x{:x}", receipt.from),
                success: receipt.status(),
            })),
            None => Ok(None),
        }
    }

    /// Whether the chain has a router contract for batch payouts.
    pub fn supports_batch(&self) -> bool {
        self.router_address.is_some()
    }

    fn router(&self) -> Result<Address, SendError> {
        self.router_address
            .ok_or_else(|| SendError::before(format!("no router configured on chain {}", self.chain_id)))
    }
}

fn parse_address(addr: &str) -> Result<Address, SendError> {
    Address::from_str(addr).map_err(|_| SendError::before(format!("invalid address {}", addr)))
}

fn parse_addresses(addrs: &[String]) -> Result<Vec<Address>, SendError> {
    addrs.iter().map(|a| parse_address(a)).collect()
}

#[async_trait]
impl SenderAccount for EvmAccount {
    fn address(&self) -> String {
        self.address_string()
    }

    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn get_balance(&self) -> Result<U256> {
        let provider = self
            .provider()
            .map_err(|e| eyre!("provider unavailable: {}", e))?;
        let balance = provider.get_balance(self.address).await?;
        Ok(balance)
    }

    async fn get_token_balance(&self, token: &str) -> Result<U256> {
        let provider = self
            .provider()
            .map_err(|e| eyre!("provider unavailable: {}", e))?;
        let token_addr = Address::from_str(token).wrap_err("Invalid token address")?;
        let contract = ERC20::new(token_addr, &provider);
        let balance = contract.balanceOf(self.address).call().await?;
        Ok(balance._0)
    }

    async fn transfer(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        to: &str,
        amount: U256,
    ) -> Result<BroadcastResult, SendError> {
        let request = self
            .pregenerated_request_parameters()
            .with_to(parse_address(to)?)
            .with_value(amount);
        self.sign_and_broadcast(serial, source_ids, request).await
    }

    async fn transfer_token(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        token: &str,
        to: &str,
        amount: U256,
    ) -> Result<BroadcastResult, SendError> {
        let input = ERC20::transferCall {
            to: parse_address(to)?,
            amount,
        }
        .abi_encode();
        let request = self
            .pregenerated_request_parameters()
            .with_to(parse_address(token)?)
            .with_input(Bytes::from(input));
        self.sign_and_broadcast(serial, source_ids, request).await
    }

    async fn transfers(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        tos: &[String],
        amounts: &[U256],
    ) -> Result<BroadcastResult, SendError> {
        if tos.len() != amounts.len() {
            return Err(SendError::before("recipient/amount length mismatch"));
        }
        let router = self.router()?;
        let total = amounts.iter().fold(U256::ZERO, |acc, a| acc + *a);
        let input = OrbiterRouterV3::transfersCall {
            tos: parse_addresses(tos)?,
            values: amounts.to_vec(),
        }
        .abi_encode();
        let request = self
            .pregenerated_request_parameters()
            .with_to(router)
            .with_value(total)
            .with_input(Bytes::from(input));
        self.sign_and_broadcast(serial, source_ids, request).await
    }

    async fn transfer_tokens(
        &self,
        serial: &dyn SerialSink,
        source_ids: &[String],
        token: &str,
        tos: &[String],
        amounts: &[U256],
    ) -> Result<BroadcastResult, SendError> {
        if tos.len() != amounts.len() {
            return Err(SendError::before("recipient/amount length mismatch"));
        }
        let router = self.router()?;
        let input = OrbiterRouterV3::transferTokensCall {
            token: parse_address(token)?,
            tos: parse_addresses(tos)?,
            values: amounts.to_vec(),
        }
        .abi_encode();
        let request = self
            .pregenerated_request_parameters()
            .with_to(router)
            .with_input(Bytes::from(input));
        self.sign_and_broadcast(serial, source_ids, request).await
    }

    async fn wait_for_transaction_confirmation(
        &self,
        tx_hash: &str,
        timeout: Duration,
    ) -> Result<ReceiptSummary> {
        let provider = self
            .provider()
            .map_err(|e| eyre!("provider unavailable: {}", e))?;
        let hash: B256 = tx_hash.parse().wrap_err("Invalid transaction hash")?;

        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Some(receipt) = provider.get_transaction_receipt(hash).await? {
                return Ok(ReceiptSummary {
                    tx_hash: tx_hash.to_string(),
                    from: format!("0x{:x}", receipt.from),
                    success: receipt.status(),
                });
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }

        Err(eyre!("transaction {} not confirmed after {:?}", tx_hash, timeout))
    }
}

/// All maker accounts, indexed for sequencer resolution.
pub struct AccountManager {
    /// (chain id, lowercased address) -> account
    accounts: HashMap<(String, String), Arc<EvmAccount>>,
    by_chain: HashMap<String, Vec<Arc<EvmAccount>>>,
}

impl AccountManager {
    /// Build one account per (configured chain, maker key). Nonce managers
    /// are keyed per (chain, address) so the same key on two chains tracks
    /// two independent nonce streams.
    pub fn new(chains: &[ChainConfig], private_keys: &[String]) -> Result<Self> {
        let nonce_registry = NonceManagers::new();
        let mut accounts = HashMap::new();
        let mut by_chain: HashMap<String, Vec<Arc<EvmAccount>>> = HashMap::new();

        for chain in chains {
            for key in private_keys {
                let manager =
                    nonce_registry.for_sender(&format!("{}:{}", chain.chain_id, key_address(key)?));
                let account = Arc::new(EvmAccount::new(chain, key, manager)?);
                let addr = normalize_address(&account.address_string());
                by_chain
                    .entry(chain.chain_id.clone())
                    .or_default()
                    .push(Arc::clone(&account));
                accounts.insert((chain.chain_id.clone(), addr), account);
            }
        }

        Ok(Self { accounts, by_chain })
    }

    /// The signing account for a payout: the first configured maker on the
    /// target chain whose address is permitted by the bridge row.
    pub fn resolve(&self, chain_id: &str, response_makers: &[String]) -> Option<Arc<EvmAccount>> {
        let makers: Vec<String> = response_makers.iter().map(|m| normalize_address(m)).collect();
        self.by_chain.get(chain_id).and_then(|accounts| {
            accounts
                .iter()
                .find(|a| makers.contains(&normalize_address(&a.address_string())))
                .cloned()
        })
    }

    pub fn get(&self, chain_id: &str, address: &str) -> Option<Arc<EvmAccount>> {
        self.accounts
            .get(&(chain_id.to_string(), normalize_address(address)))
            .cloned()
    }
}

fn key_address(private_key: &str) -> Result<String> {
    let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
    Ok(format!("0x{:x}", signer.address()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ChainConfig {
        ChainConfig {
            chain_id: "1".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            min_fee_per_gas: 2_000_000_000,
            min_priority_fee_per_gas: 100_000_000,
            router_address: None,
            forced_tx_type: None,
        }
    }

    // Anvil's well-known first key; never funded anywhere that matters.
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn account() -> EvmAccount {
        EvmAccount::new(&chain(), TEST_KEY, Arc::new(NonceManager::new())).unwrap()
    }

    #[test]
    fn test_account_address_derivation() {
        let acct = account();
        assert_eq!(
            acct.address(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert_eq!(acct.chain_id(), "1");
    }

    #[test]
    fn test_fee_floors_applied() {
        let acct = account();
        // Estimates below the floors are lifted to them.
        match acct.floor_1559(1, 1).unwrap() {
            FeeSettings::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, 2_000_000_000);
                assert_eq!(max_priority_fee_per_gas, 100_000_000);
            }
            other => panic!("unexpected fee shape: {:?}", other),
        }
    }

    #[test]
    fn test_zero_fee_component_fails() {
        let mut cfg = chain();
        cfg.min_fee_per_gas = 0;
        cfg.min_priority_fee_per_gas = 0;
        let acct = EvmAccount::new(&cfg, TEST_KEY, Arc::new(NonceManager::new())).unwrap();
        let err = acct.floor_1559(0, 0).unwrap_err();
        assert!(err.to_string().contains("EIP1559 Fee fail"));
        assert!(err.is_before());
    }

    #[test]
    fn test_non_numeric_chain_id_rejected() {
        let mut cfg = chain();
        cfg.chain_id = "columbus-5".to_string();
        assert!(EvmAccount::new(&cfg, TEST_KEY, Arc::new(NonceManager::new())).is_err());
    }

    #[test]
    fn test_batch_without_router_is_before_error() {
        let acct = account();
        let err = acct.router().unwrap_err();
        assert!(err.is_before());
    }

    #[test]
    fn test_manager_resolves_permitted_maker_only() {
        let manager = AccountManager::new(&[chain()], &[TEST_KEY.to_string()]).unwrap();

        let permitted = vec!["0xF39fd6e51AAD88F6F4ce6aB8827279cffFb92266".to_string()];
        assert!(manager.resolve("1", &permitted).is_some());

        let other = vec!["0x0000000000000000000000000000000000000001".to_string()];
        assert!(manager.resolve("1", &other).is_none());
        assert!(manager.resolve("10", &permitted).is_none());
    }
}
