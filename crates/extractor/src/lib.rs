//! Ethereum node access: the live `newHeads` feed, single-block lookups and
//! the historical HTTP client used by the backfill.

/// Historical HTTP client
pub mod historical;

pub use historical::HistoricalClient;

use std::time::Duration;

use alloy::{
    providers::{Provider, ProviderBuilder, RootProvider, fillers::FillProvider, utils::JoinedRecommendedFillers},
    transports::TransportResult,
};
use alloy_rpc_client::ClientBuilder;
use derive_more::Debug;
use eyre::Result;
use primitives::{
    block::Block,
    headers::{HeadNotification, HeadStream},
    retries::RetryWsConnect,
};
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::{error, info, warn};
use url::Url;

/// Provider with the recommended fillers over any transport
pub type DefaultProvider = FillProvider<JoinedRecommendedFillers, RootProvider>;

/// Delay before retrying a failed subscription
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Live chain client over a reconnecting WebSocket
#[derive(Debug, Clone)]
pub struct Extractor {
    #[debug(skip)]
    provider: DefaultProvider,
}

impl Extractor {
    /// Connect to the WebSocket endpoint.
    ///
    /// The transport carries no request retry layer: block lookups on the live path
    /// are retried by the caller's own policy, with a timeout per attempt.
    pub async fn new(ws_url: Url) -> Result<Self> {
        let ws = RetryWsConnect::from_url(ws_url);
        let client = ClientBuilder::default().pubsub(ws).await?;
        let provider = ProviderBuilder::new().connect_client(client);
        Ok(Self { provider })
    }

    /// Get a stream of head notifications. The stream resubscribes automatically
    /// after disconnections. Payloads that cannot be decoded are yielded as errors.
    pub async fn head_stream(&self) -> Result<HeadStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = self.provider.clone();

        tokio::spawn(async move {
            loop {
                info!("Subscribing to newHeads");
                let sub_result = provider.subscribe::<_, serde_json::Value>(("newHeads",)).await;

                let mut head_stream = match sub_result {
                    Ok(sub) => {
                        info!("Subscribed to newHeads");
                        sub.into_stream()
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to subscribe to newHeads, retrying in 5s");
                        sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(payload) = head_stream.next().await {
                    if tx.send(HeadNotification::from_json(&payload)).is_err() {
                        error!("Head receiver dropped. Stopping newHeads task.");
                        return;
                    }
                }
                warn!("newHeads stream ended. Resubscribing...");
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    /// Fetch a block by number, `None` if the node does not know it.
    pub async fn block_by_number(&self, number: u64) -> TransportResult<Option<Block>> {
        let block = self.provider.get_block_by_number(number.into()).await?;
        Ok(block.as_ref().map(block_from_rpc))
    }
}

/// Convert an RPC block into the stored block model.
pub fn block_from_rpc(block: &alloy_rpc_types_eth::Block) -> Block {
    let header = &block.header;
    Block {
        number: header.number,
        timestamp: header.timestamp,
        gas_limit: header.gas_limit,
        gas_used: header.gas_used,
        base_fee_per_gas: header.base_fee_per_gas.unwrap_or_default(),
        transaction_count: block.transactions.len() as u64,
        difficulty: header.difficulty,
        total_difficulty: header.total_difficulty,
        size: header.size.map(|size| size.saturating_to::<u64>()).unwrap_or_default(),
        blob_gas_used: header.blob_gas_used,
        excess_blob_gas: header.excess_blob_gas,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloy::primitives::U256;
    use serde_json::json;

    use super::*;

    const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

    pub(crate) fn rpc_block_json(number: u64, timestamp: u64) -> serde_json::Value {
        json!({
            "hash": "0x0101010101010101010101010101010101010101010101010101010101010101",
            "parentHash": ZERO_HASH,
            "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
            "miner": "0x0000000000000000000000000000000000000000",
            "stateRoot": ZERO_HASH,
            "transactionsRoot": ZERO_HASH,
            "receiptsRoot": ZERO_HASH,
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "difficulty": "0x0",
            "number": format!("{number:#x}"),
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "timestamp": format!("{timestamp:#x}"),
            "extraData": "0x",
            "mixHash": ZERO_HASH,
            "nonce": "0x0000000000000000",
            "baseFeePerGas": "0x3b9aca00",
            "withdrawalsRoot": ZERO_HASH,
            "blobGasUsed": "0x20000",
            "excessBlobGas": "0x0",
            "parentBeaconBlockRoot": ZERO_HASH,
            "size": "0x220",
            "uncles": [],
            "transactions": [
                "0x0202020202020202020202020202020202020202020202020202020202020202"
            ],
            "withdrawals": []
        })
    }

    #[test]
    fn converts_post_cancun_block() {
        let rpc: alloy_rpc_types_eth::Block =
            serde_json::from_value(rpc_block_json(19_426_587, 1_710_338_135)).unwrap();

        let block = block_from_rpc(&rpc);
        assert_eq!(block.number, 19_426_587);
        assert_eq!(block.timestamp, 1_710_338_135);
        assert_eq!(block.gas_limit, 30_000_000);
        assert_eq!(block.gas_used, 21_000);
        assert_eq!(block.base_fee_per_gas, 1_000_000_000);
        assert_eq!(block.transaction_count, 1);
        assert_eq!(block.difficulty, U256::ZERO);
        assert_eq!(block.total_difficulty, None);
        assert_eq!(block.size, 0x220);
        assert_eq!(block.blob_gas_used, Some(0x20000));
        assert_eq!(block.excess_blob_gas, Some(0));
    }
}
