//! Private-transfer client (C3): talks to the relayer's upload-proof and
//! execute-transfer endpoints over HTTP, with retry/backoff, a request
//! timeout, and token/fee bookkeeping (spec Sec 4.3).
//!
//! Grounded on the upstream paymaster client's JSON-RPC-over-reqwest shape
//! (build request, `.send().await`, classify the response, surface a typed
//! error) but adapted to the relayer's two-call REST protocol rather than
//! JSON-RPC.

use crate::domain::Address;
use crate::error::{CrankError, CrankResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relayer fee, fixed at 1% (100 bps) per the mint map this client serves.
pub const FEE_BPS: u64 = 100;
const BPS_DENOMINATOR: u64 = 10_000;

/// Tokens the private relayer accepts, grounded on the reference program's
/// supported-mint list. Each maps 1:1 to a specific on-chain mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayerToken {
    Sol,
    Usdc,
    Usdt,
    Bonk,
    Wif,
    Popcat,
    Radr,
    Ore,
    Grass,
    Ray,
    Jup,
    Pyth,
    Jto,
    Render,
    Hnt,
    Mobile,
    Iot,
}

impl RelayerToken {
    pub fn symbol(self) -> &'static str {
        match self {
            RelayerToken::Sol => "SOL",
            RelayerToken::Usdc => "USDC",
            RelayerToken::Usdt => "USDT",
            RelayerToken::Bonk => "BONK",
            RelayerToken::Wif => "WIF",
            RelayerToken::Popcat => "POPCAT",
            RelayerToken::Radr => "RADR",
            RelayerToken::Ore => "ORE",
            RelayerToken::Grass => "GRASS",
            RelayerToken::Ray => "RAY",
            RelayerToken::Jup => "JUP",
            RelayerToken::Pyth => "PYTH",
            RelayerToken::Jto => "JTO",
            RelayerToken::Render => "RENDER",
            RelayerToken::Hnt => "HNT",
            RelayerToken::Mobile => "MOBILE",
            RelayerToken::Iot => "IOT",
        }
    }

    /// Resolves a mint address to its relayer token, including known
    /// wrapped-native and devnet aliases.
    pub fn from_mint(mint: &Address) -> Option<Self> {
        match mint.0.as_str() {
            "So11111111111111111111111111111111111111112" => Some(RelayerToken::Sol),
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v" => Some(RelayerToken::Usdc),
            "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU" => Some(RelayerToken::Usdc), // devnet-usdc
            "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB" => Some(RelayerToken::Usdt),
            "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263" => Some(RelayerToken::Bonk),
            "EKpQGSJtjMFqKZ9KQanSqYXRcF8fBopzLHYxdM65zcjm" => Some(RelayerToken::Wif),
            "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr" => Some(RelayerToken::Popcat),
            "RADRrrGzgCFfVeeUM9zFcVBjcTyg8iAQ1ZqFbcBGYir" => Some(RelayerToken::Radr),
            "oreoN2tQbHXVaZsr3pf66A48miqcBXCDJozganhEJgz" => Some(RelayerToken::Ore),
            "Grass7B4RdKfBCjTKgSqnXkqjwiGvQyFbuSCUJr3XXjs" => Some(RelayerToken::Grass),
            "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R" => Some(RelayerToken::Ray),
            "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN" => Some(RelayerToken::Jup),
            "HZ1JovNiVvGrGNiiYvEozEVgZ58xaU3RKwX8eACQBCt3" => Some(RelayerToken::Pyth),
            "jtojtomepa8beP8AuQc6eXt5FriJwfFMwQx2v2f9mCL" => Some(RelayerToken::Jto),
            "rndrizKT3MK1iimdxRdWabcF7Zg7AR5T4nud4EkHBof" => Some(RelayerToken::Render),
            "hntyVP6YFm1Hg25TN9WGLqM12b8TQmcknKrdu1oxWux" => Some(RelayerToken::Hnt),
            "mb1eu7TzEc71KxDpsmsKoucSSuuoGLv1drys1oP2jh6" => Some(RelayerToken::Mobile),
            "iotEVVZLEywoTn1QdwNPddxPWszn3zFhEot3MfL9fns" => Some(RelayerToken::Iot),
            _ => None,
        }
    }

    pub fn pair_supported(base: &Address, quote: &Address) -> bool {
        Self::from_mint(base).is_some() && Self::from_mint(quote).is_some()
    }
}

/// Deducts the relayer fee from a gross transfer amount.
pub fn calculate_net_amount(gross: u64) -> u64 {
    let fee = gross.saturating_mul(FEE_BPS) / BPS_DENOMINATOR;
    gross.saturating_sub(fee)
}

/// Inverse of [`calculate_net_amount`]: the gross amount whose net, after
/// fee, equals `net`. Round-trips exactly for amounts that are themselves
/// the output of `calculate_net_amount` (spec Sec 8 property 7).
pub fn calculate_gross_amount(net: u64) -> u64 {
    if net == 0 {
        return 0;
    }
    (net * BPS_DENOMINATOR).div_ceil(BPS_DENOMINATOR - FEE_BPS)
}

pub fn calculate_fee(gross: u64) -> u64 {
    gross.saturating_mul(FEE_BPS) / BPS_DENOMINATOR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Internal,
    External,
}

#[derive(Debug, Clone, Serialize)]
struct UploadProofRequest<'a> {
    sender_wallet: &'a str,
    token: &'static str,
    amount: u64,
    nonce: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadProofResponse {
    success: bool,
    proof_pda: String,
    nonce: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ExecuteTransferRequest<'a> {
    sender_wallet: &'a str,
    recipient_wallet: &'a str,
    token: &'static str,
    nonce: u32,
    relayer_fee: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecuteTransferResponse {
    success: bool,
    tx_signature: String,
    proof_pda: String,
    amount_sent: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RelayerErrorBody {
    error: String,
    code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub transfer_id: String,
    pub net_amount: u64,
    pub fee: u64,
}

/// A wallet's recorded balance in the relayer's private pool (spec Sec 4.3
/// `getPoolBalance`).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolBalance {
    pub available: u64,
    pub deposited: u64,
    pub withdrawn_to_escrow: u64,
    pub migrated: bool,
}

#[derive(Debug, Clone)]
pub struct RelayerClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

/// HTTP client for the relayer's two-step private transfer protocol:
/// upload a range proof, then execute the transfer against the resulting
/// proof id. Retries transient failures with exponential backoff and
/// reports retryability so the C6 circuit-breaker supervisor can track it.
#[derive(Clone)]
pub struct RelayerClient {
    http: reqwest::Client,
    config_base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
    nonce_counter: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl RelayerClient {
    pub fn new(config: RelayerClientConfig) -> CrankResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(CrankError::from)?;
        Ok(Self {
            http,
            config_base_url: config.base_url,
            api_key: config.api_key,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            nonce_counter: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(1)),
        })
    }

    /// Next nonce for the upload/execute pair: monotonic within this process,
    /// masked to stay within the relayer's `nonce <= 2^31` contract.
    fn next_nonce(&self) -> u32 {
        self.nonce_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) & 0x7FFF_FFFF
    }

    /// Uploads a range proof then executes the transfer, retrying each step
    /// independently. Returns the relayer's transfer id, which the settlement
    /// state machine records as the leg's transfer id.
    pub async fn transfer(
        &self,
        sender: &Address,
        recipient: &Address,
        token: RelayerToken,
        gross_amount: u64,
        kind: TransferKind,
    ) -> CrankResult<TransferOutcome> {
        let net_amount = calculate_net_amount(gross_amount);
        let fee = gross_amount - net_amount;
        let nonce = self.next_nonce();

        self.with_retry("upload-proof", || {
            self.upload_proof(sender, token, net_amount, nonce)
        })
        .await?;

        let endpoint = match kind {
            TransferKind::Internal => "internal-transfer",
            TransferKind::External => "external-transfer",
        };
        let transfer_id = self
            .with_retry(endpoint, || {
                self.execute_transfer(sender, recipient, token, nonce, fee, endpoint)
            })
            .await?;

        Ok(TransferOutcome {
            transfer_id,
            net_amount,
            fee,
        })
    }

    /// Queries the relayer's recorded private balance for `wallet`,
    /// optionally scoped to one `token`. `None` means the relayer has no
    /// balance on record for this wallet (spec Sec 4.3 `getPoolBalance`).
    pub async fn get_pool_balance(
        &self,
        wallet: &Address,
        token: Option<RelayerToken>,
    ) -> CrankResult<Option<PoolBalance>> {
        let mut url = format!("{}/zk/pool-balance?wallet={}", self.config_base_url, wallet.0);
        if let Some(token) = token {
            url.push_str(&format!("&token={}", token.symbol()));
        }

        let mut builder = self.http.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("X-API-Key", key);
        }
        let resp = builder.send().await?;
        let status = resp.status();

        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let body: Option<RelayerErrorBody> = resp.json().await.ok();
            let message = body
                .map(|b| match b.code {
                    Some(code) => format!("relayer error {code}: {}", b.error),
                    None => b.error,
                })
                .unwrap_or_else(|| format!("relayer returned HTTP {status}"));
            return Err(CrankError::private_transfer(4, message).retryable(retryable));
        }

        resp.json::<PoolBalance>().await.map(Some).map_err(CrankError::from)
    }

    /// `hasEnoughBalance` (spec Sec 4.3): true only when the relayer reports
    /// a recorded balance with at least `amount` available for `token`.
    pub async fn has_enough_balance(&self, wallet: &Address, token: RelayerToken, amount: u64) -> CrankResult<bool> {
        Ok(self
            .get_pool_balance(wallet, Some(token))
            .await?
            .is_some_and(|b| b.available >= amount))
    }

    async fn upload_proof(
        &self,
        sender: &Address,
        token: RelayerToken,
        amount: u64,
        nonce: u32,
    ) -> CrankResult<()> {
        let req = UploadProofRequest {
            sender_wallet: &sender.0,
            token: token.symbol(),
            amount,
            nonce,
        };
        let url = format!("{}/zk/upload-proof", self.config_base_url);
        let resp: UploadProofResponse = self.post(&url, &req).await?;
        if !resp.success {
            return Err(CrankError::private_transfer(2, "relayer rejected the uploaded proof"));
        }
        Ok(())
    }

    async fn execute_transfer(
        &self,
        sender: &Address,
        recipient: &Address,
        token: RelayerToken,
        nonce: u32,
        relayer_fee: u64,
        endpoint: &str,
    ) -> CrankResult<String> {
        let req = ExecuteTransferRequest {
            sender_wallet: &sender.0,
            recipient_wallet: &recipient.0,
            token: token.symbol(),
            nonce,
            relayer_fee,
        };
        let url = format!("{}/zk/{}", self.config_base_url, endpoint);
        let resp: ExecuteTransferResponse = self.post(&url, &req).await?;
        if !resp.success {
            return Err(CrankError::private_transfer(3, "relayer transfer reported failure"));
        }
        Ok(resp.tx_signature)
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &Req,
    ) -> CrankResult<Resp> {
        let mut builder = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("X-API-Key", key);
        }

        let resp = builder.send().await?;
        let status = resp.status();

        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let body: Option<RelayerErrorBody> = resp.json().await.ok();
            let message = body
                .map(|b| match b.code {
                    Some(code) => format!("relayer error {code}: {}", b.error),
                    None => b.error,
                })
                .unwrap_or_else(|| format!("relayer returned HTTP {status}"));
            return Err(CrankError::private_transfer(1, message).retryable(retryable));
        }

        resp.json::<Resp>().await.map_err(CrankError::from)
    }

    /// Exponential backoff: `retry_delay * 2^attempt`, capped at
    /// `max_retries` attempts. Only retries errors the store marks
    /// retryable.
    async fn with_retry<F, Fut, T>(&self, label: &str, mut f: F) -> CrankResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CrankResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.retryable && attempt < self.max_retries => {
                    let delay = self.retry_delay * 2u32.pow(attempt);
                    tracing::warn!(step = label, attempt, delay_ms = %delay.as_millis(), "relayer call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_and_gross_round_trip_for_fee_derived_amounts() {
        let gross = 1_000_000u64;
        let net = calculate_net_amount(gross);
        assert_eq!(net, 990_000);
        assert_eq!(calculate_gross_amount(net), gross);
    }

    #[test]
    fn fee_is_exactly_one_percent() {
        assert_eq!(calculate_fee(1_000_000), 10_000);
    }

    #[test]
    fn from_mint_resolves_known_aliases() {
        let wsol = Address("So11111111111111111111111111111111111111112".to_string());
        assert_eq!(RelayerToken::from_mint(&wsol), Some(RelayerToken::Sol));

        let devnet_usdc = Address("4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU".to_string());
        assert_eq!(RelayerToken::from_mint(&devnet_usdc), Some(RelayerToken::Usdc));
    }

    #[test]
    fn unsupported_mint_fails_pair_support_check() {
        let sol = Address("So11111111111111111111111111111111111111112".to_string());
        let unknown = Address("unknownmint".to_string());
        assert!(!RelayerToken::pair_supported(&sol, &unknown));
    }
}
