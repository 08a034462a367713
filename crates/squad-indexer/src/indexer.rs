//! Indexer API: message and transaction lookups
//!
//! [`IndexerApi`] is the seam the rest of the crate talks to. The production
//! implementation, [`TonIndexClient`], sends every call through the
//! [`RequestGateway`] queue and retries on rate limiting.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::address::Address;
use crate::constants;
use crate::error::IndexerResult;
use crate::gateway::{IndexerRequest, RequestGateway, RetryPolicy, with_rate_limit_retry};

// =============================================================================
// Wire Types
// =============================================================================

/// An internal message as returned by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub hash: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    /// Amount in nanotons, as a decimal string
    #[serde(default)]
    pub value: Option<String>,
    /// Unix seconds
    #[serde(default, deserialize_with = "de_unix_seconds")]
    pub created_at: u64,
    #[serde(default)]
    pub created_lt: Option<String>,
    #[serde(default)]
    pub in_msg_tx_hash: Option<String>,
    /// Transaction that emitted this message
    #[serde(default)]
    pub out_msg_tx_hash: Option<String>,
}

impl Message {
    /// Hash of the transaction whose outbound fan-out produced this message
    pub fn transaction_hash(&self) -> Option<&str> {
        self.out_msg_tx_hash.as_deref().filter(|h| !h.is_empty())
    }

    pub fn amount(&self) -> Option<u128> {
        self.value.as_deref().and_then(parse_amount)
    }
}

/// One side of a transfer inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMessage {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl TransferMessage {
    pub fn amount(&self) -> Option<u128> {
        self.value.as_deref().and_then(parse_amount)
    }
}

/// A transaction with its inbound message and outbound transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    #[serde(default)]
    pub in_msg: Option<TransferMessage>,
    #[serde(default)]
    pub out_msgs: Vec<TransferMessage>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<Transaction>,
}

/// Parse a nanoton amount. Non-numeric or overflowing values yield `None`.
pub fn parse_amount(value: &str) -> Option<u128> {
    value.trim().parse().ok()
}

/// The indexer encodes timestamps as strings in some versions, numbers in others
fn de_unix_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
        Null,
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => Ok(n),
        Seconds::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Seconds::Null => Ok(0),
    }
}

// =============================================================================
// Query
// =============================================================================

/// Filter for a message query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    /// Exact value match, in nanotons
    pub value: Option<String>,
    /// Only messages created at or after this unix time
    pub since: Option<u64>,
}

impl MessageFilter {
    /// Payout messages the contract sent to `owner`, newer than `watermark`
    pub fn payouts(contract: Address, owner: Address, watermark: Option<u64>) -> Self {
        Self {
            source: Some(contract),
            destination: Some(owner),
            value: None,
            since: watermark.map(|w| w + 1),
        }
    }

    /// Join payments `sender` made to the contract
    pub fn joins(sender: Address, contract: Address, join_value: u64) -> Self {
        Self {
            source: Some(sender),
            destination: Some(contract),
            value: Some(join_value.to_string()),
            since: None,
        }
    }

    fn to_query(&self, limit: usize, offset: usize) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(source) = &self.source {
            query.push(("source".to_string(), source.to_raw()));
        }
        if let Some(destination) = &self.destination {
            query.push(("destination".to_string(), destination.to_raw()));
        }
        if let Some(value) = &self.value {
            query.push(("value".to_string(), value.clone()));
        }
        if let Some(since) = self.since {
            query.push(("start_utime".to_string(), since.to_string()));
        }
        query.push(("limit".to_string(), limit.to_string()));
        query.push(("offset".to_string(), offset.to_string()));
        query.push(("sort".to_string(), "desc".to_string()));
        query
    }
}

// =============================================================================
// API
// =============================================================================

#[async_trait]
pub trait IndexerApi: Send + Sync {
    /// One page of messages, newest first
    async fn fetch_message_page(
        &self,
        filter: &MessageFilter,
        limit: usize,
        offset: usize,
    ) -> IndexerResult<Vec<Message>>;

    /// Look up a transaction by hash; `Ok(None)` when the indexer has no record
    async fn fetch_transaction(&self, hash: &str) -> IndexerResult<Option<Transaction>>;
}

/// Toncenter v3 client
#[derive(Clone)]
pub struct TonIndexClient {
    gateway: RequestGateway,
    retry: RetryPolicy,
}

impl TonIndexClient {
    pub fn new(gateway: RequestGateway, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    pub fn into_api(self) -> Arc<dyn IndexerApi> {
        Arc::new(self)
    }

    async fn get<T>(&self, endpoint: &str, query: Vec<(String, String)>) -> IndexerResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let value = with_rate_limit_retry(&self.retry, || {
            self.gateway
                .enqueue(IndexerRequest::get(endpoint, query.clone()))
        })
        .await?;

        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl IndexerApi for TonIndexClient {
    async fn fetch_message_page(
        &self,
        filter: &MessageFilter,
        limit: usize,
        offset: usize,
    ) -> IndexerResult<Vec<Message>> {
        let response: MessagesResponse = self
            .get(constants::MESSAGES_ENDPOINT, filter.to_query(limit, offset))
            .await?;

        debug!(
            offset,
            returned = response.messages.len(),
            "fetched message page"
        );
        Ok(response.messages)
    }

    async fn fetch_transaction(&self, hash: &str) -> IndexerResult<Option<Transaction>> {
        let query = vec![
            ("hash".to_string(), hash.to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let response: TransactionsResponse =
            self.get(constants::TRANSACTIONS_ENDPOINT, query).await?;

        Ok(response.transactions.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexerError;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CONTRACT: &str = "0:1111111111111111111111111111111111111111111111111111111111111111";
    const OWNER: &str = "0:2222222222222222222222222222222222222222222222222222222222222222";

    fn client(server: &MockServer) -> TonIndexClient {
        let gateway = RequestGateway::new(&server.uri(), None, Duration::ZERO);
        let retry = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
            jitter: 0.0,
        };
        TonIndexClient::new(gateway, retry)
    }

    #[test]
    fn test_message_decodes_string_timestamps() {
        let json = serde_json::json!({
            "hash": "abc",
            "source": CONTRACT,
            "destination": OWNER,
            "value": "299600000",
            "created_lt": "4600000000001",
            "created_at": "1717000000",
            "in_msg_tx_hash": "in",
            "out_msg_tx_hash": "out",
            "opcode": "0x00000000"
        });
        let message: Message = serde_json::from_value(json).unwrap();

        assert_eq!(message.created_at, 1_717_000_000);
        assert_eq!(message.amount(), Some(299_600_000));
        assert_eq!(message.transaction_hash(), Some("out"));
    }

    #[test]
    fn test_message_tolerates_missing_fields() {
        let message: Message =
            serde_json::from_value(serde_json::json!({ "hash": "h", "created_at": 5 })).unwrap();
        assert_eq!(message.created_at, 5);
        assert_eq!(message.source, None);
        assert_eq!(message.transaction_hash(), None);
        assert_eq!(message.amount(), None);
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("2100000000"), Some(2_100_000_000));
        assert_eq!(parse_amount(" 1 "), Some(1));
        assert_eq!(parse_amount("-5"), None);
        assert_eq!(parse_amount("1.5"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn test_payout_filter_starts_after_watermark() {
        let contract: Address = CONTRACT.parse().unwrap();
        let owner: Address = OWNER.parse().unwrap();

        let filter = MessageFilter::payouts(contract, owner, Some(1_700_000_000));
        let query = filter.to_query(100, 200);

        assert!(query.contains(&("source".to_string(), CONTRACT.to_string())));
        assert!(query.contains(&("destination".to_string(), OWNER.to_string())));
        assert!(query.contains(&("start_utime".to_string(), "1700000001".to_string())));
        assert!(query.contains(&("offset".to_string(), "200".to_string())));
        assert!(query.contains(&("sort".to_string(), "desc".to_string())));

        let cold = MessageFilter::payouts(contract, owner, None).to_query(100, 0);
        assert!(!cold.iter().any(|(k, _)| k == "start_utime"));
    }

    #[tokio::test]
    async fn test_fetch_message_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/messages"))
            .and(query_param("source", CONTRACT))
            .and(query_param("destination", OWNER))
            .and(query_param("limit", "2"))
            .and(query_param("offset", "0"))
            .and(query_param_is_missing("value"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [
                    { "hash": "m2", "created_at": "20", "out_msg_tx_hash": "t2" },
                    { "hash": "m1", "created_at": "10", "out_msg_tx_hash": "t1" }
                ],
                "address_book": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let filter = MessageFilter::payouts(CONTRACT.parse().unwrap(), OWNER.parse().unwrap(), None);
        let page = client(&server)
            .fetch_message_page(&filter, 2, 0)
            .await
            .unwrap();

        assert_eq!(page.len(), 2);
        assert_eq!(page[0].hash, "m2");
        assert_eq!(page[1].created_at, 10);
    }

    #[tokio::test]
    async fn test_fetch_transaction_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(path("/transactions"))
            .and(query_param("hash", "known"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactions": [{
                    "hash": "known",
                    "in_msg": { "source": OWNER, "value": "2100000000" },
                    "out_msgs": [{ "destination": CONTRACT, "value": "299600000" }]
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(path("/transactions"))
            .and(query_param("hash", "unknown"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "transactions": [] })),
            )
            .mount(&server)
            .await;

        let client = client(&server);
        let tx = client.fetch_transaction("known").await.unwrap().unwrap();
        assert_eq!(tx.in_msg.unwrap().amount(), Some(2_100_000_000));
        assert_eq!(tx.out_msgs.len(), 1);

        assert!(client.fetch_transaction("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_retried() {
        let server = MockServer::start().await;
        Mock::given(path("/transactions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(path("/transactions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactions": [{ "hash": "late" }]
            })))
            .mount(&server)
            .await;

        let tx = client(&server).fetch_transaction("late").await.unwrap();
        assert_eq!(tx.unwrap().hash, "late");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(path("/transactions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_transaction("x").await.unwrap_err();
        assert!(matches!(err, IndexerError::Status { status: 500, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
