//! The DynamoDB-KV backend adapter: the three primitives described in the
//! external interfaces section (GET/PUT/DELETE over a single item keyed by
//! its mapped string key), plus the throttle/server-error classification
//! that [`super::queue::KvQueue`] uses to decide whether to retry.
//!
//! Grounded on `remote_storage::S3Bucket`'s shape (a thin client struct
//! wrapping an SDK client plus a table/bucket name) and on
//! `lib/dynamodb/dynamodb_request_queue.c`'s `isthrottle()`, which scans the
//! raw response body for the literal byte string
//! `#ProvisionedThroughputExceededException` rather than parsing JSON.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::metrics;

/// The literal marker the original queue scans for in a DynamoDB error
/// response body. DynamoDB reports throttling as HTTP 400 with this
/// exception name, indistinguishable from other client errors except by
/// this string.
const THROTTLE_MARKER: &[u8] = b"#ProvisionedThroughputExceededException";

/// Byte-wise substring scan, preserved verbatim from the original's
/// `isthrottle()` rather than replaced with a JSON-aware check: any
/// response body (or SDK error message) containing this marker anywhere is
/// treated as a throttle, regardless of surrounding structure.
pub fn contains_throttle_marker(body: &[u8]) -> bool {
    if THROTTLE_MARKER.len() > body.len() {
        return false;
    }
    body.windows(THROTTLE_MARKER.len())
        .any(|w| w == THROTTLE_MARKER)
}

const ITEM_KEY_ATTR: &str = "key";
const ITEM_VALUE_ATTR: &str = "value";

#[derive(Debug, Clone)]
pub enum KvOp {
    Get(String),
    Put(String, Vec<u8>),
    Delete(String),
}

impl KvOp {
    /// Matches the `<op>` field of the original's log line
    /// (`GetItem`/`PutItem`/`DeleteItem`).
    pub fn name(&self) -> &'static str {
        match self {
            KvOp::Get(_) => "GetItem",
            KvOp::Put(..) => "PutItem",
            KvOp::Delete(_) => "DeleteItem",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            KvOp::Get(k) | KvOp::Delete(k) => k,
            KvOp::Put(k, _) => k,
        }
    }
}

#[derive(Debug)]
pub enum KvOutcome {
    /// GET found an item.
    Value(Vec<u8>),
    /// GET found nothing; distinct from an error.
    Absent,
    /// PUT/DELETE completed.
    Done,
}

#[derive(Debug)]
pub enum KvCallError {
    /// Retry after backing off: the queue should enter its rate-limited
    /// state and keep the request queued.
    Throttled,
    /// Retry without necessarily rate-limiting: a transient server-side or
    /// transport failure.
    ServerError(String),
    /// Do not retry; surface this to the caller as a failed operation.
    ClientError(String),
}

/// Backend trait the request queue schedules calls against. Exists so the
/// queue's scheduling logic can be exercised in tests without making real
/// DynamoDB calls, the same role `RemoteStorage` plays for `remote_storage`
/// callers in the teacher crate.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn call(&self, op: &KvOp, cancel: &CancellationToken) -> Result<KvOutcome, KvCallError>;
}

/// Live adapter over `aws-sdk-dynamodb`.
pub struct DynamoKv {
    client: Client,
    table: String,
}

impl DynamoKv {
    pub fn new(client: Client, table: String) -> Self {
        Self { client, table }
    }

    pub async fn from_config(region: String, endpoint_url: Option<String>, table: String) -> Self {
        Self::from_config_with_credentials(region, endpoint_url, table, None, None).await
    }

    /// Like [`Self::from_config`], but accepts explicit static credentials
    /// (e.g. for a local DynamoDB-compatible test server) instead of
    /// deferring to the default provider chain. The secret is held in a
    /// [`Zeroizing`] buffer so it is wiped from memory as soon as the
    /// credentials provider has consumed it, rather than lingering in a
    /// plain `String` for the rest of the process's lifetime.
    pub async fn from_config_with_credentials(
        region: String,
        endpoint_url: Option<String>,
        table: String,
        access_key_id: Option<String>,
        secret_access_key: Option<Zeroizing<String>>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_dynamodb::config::Credentials::new(key_id, secret.as_str(), None, None, "lbsd-config");
            loader = loader.credentials_provider(credentials);
        }
        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);
        Self::new(client, table)
    }
}

#[async_trait]
impl KvBackend for DynamoKv {
    async fn call(&self, op: &KvOp, cancel: &CancellationToken) -> Result<KvOutcome, KvCallError> {
        let started = Instant::now();
        let result = tokio::select! {
            res = self.call_inner(op) => res,
            _ = cancel.cancelled() => Err(KvCallError::ServerError("cancelled".to_string())),
        };
        let elapsed = started.elapsed();

        let status = match &result {
            Ok(_) => "ok",
            Err(KvCallError::Throttled) => "throttled",
            Err(KvCallError::ServerError(_)) => "server_error",
            Err(KvCallError::ClientError(_)) => "client_error",
        };
        debug!(
            op = op.name(),
            key = op.key(),
            status,
            elapsed_us = elapsed.as_micros() as u64,
            table = %self.table,
            "kv request completed"
        );
        result
    }
}

impl DynamoKv {
    async fn call_inner(&self, op: &KvOp) -> Result<KvOutcome, KvCallError> {
        match op {
            KvOp::Get(key) => self.get(key).await,
            KvOp::Put(key, value) => self.put(key, value).await,
            KvOp::Delete(key) => self.delete(key).await,
        }
    }

    async fn get(&self, key: &str) -> Result<KvOutcome, KvCallError> {
        let mut keymap = HashMap::new();
        keymap.insert(ITEM_KEY_ATTR.to_string(), AttributeValue::S(key.to_string()));

        let resp = self
            .client
            .get_item()
            .table_name(self.table.clone())
            .set_key(Some(keymap))
            .send()
            .await
            .map_err(classify_sdk_error)?;

        match resp.item {
            None => Ok(KvOutcome::Absent),
            Some(mut item) => match item.remove(ITEM_VALUE_ATTR) {
                Some(AttributeValue::B(blob)) => Ok(KvOutcome::Value(blob.into_inner())),
                _ => Err(KvCallError::ClientError(
                    "item missing binary value attribute".to_string(),
                )),
            },
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<KvOutcome, KvCallError> {
        let mut item = HashMap::new();
        item.insert(ITEM_KEY_ATTR.to_string(), AttributeValue::S(key.to_string()));
        item.insert(
            ITEM_VALUE_ATTR.to_string(),
            AttributeValue::B(value.to_vec().into()),
        );

        self.client
            .put_item()
            .table_name(self.table.clone())
            .set_item(Some(item))
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(KvOutcome::Done)
    }

    async fn delete(&self, key: &str) -> Result<KvOutcome, KvCallError> {
        let mut keymap = HashMap::new();
        keymap.insert(ITEM_KEY_ATTR.to_string(), AttributeValue::S(key.to_string()));

        self.client
            .delete_item()
            .table_name(self.table.clone())
            .set_key(Some(keymap))
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(KvOutcome::Done)
    }
}

/// Classify an `aws-sdk-dynamodb` error the same way the original classifies
/// an HTTP response: throttle, retryable server failure, or a terminal
/// client error. The SDK exposes `ProvisionedThroughputExceededException` as
/// a named service error, which we treat as equivalent to (and cross-check
/// against) the raw substring scan the original performs.
fn classify_sdk_error<E, R>(err: aws_sdk_dynamodb::error::SdkError<E, R>) -> KvCallError
where
    E: std::error::Error + aws_sdk_dynamodb::error::ProvideErrorMetadata + 'static,
{
    use aws_sdk_dynamodb::error::SdkError;

    let message = err.to_string();
    if contains_throttle_marker(message.as_bytes()) {
        metrics::KV_THROTTLE_EPISODES.inc();
        return KvCallError::Throttled;
    }

    match &err {
        SdkError::ServiceError(service_err) => {
            let code = service_err.err().code().unwrap_or_default();
            if code == "ProvisionedThroughputExceededException" {
                metrics::KV_THROTTLE_EPISODES.inc();
                KvCallError::Throttled
            } else if code == "InternalServerError" || code == "ServiceUnavailable" {
                KvCallError::ServerError(message)
            } else {
                KvCallError::ClientError(message)
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            warn!(error = %message, "dynamodb transport failure, will retry");
            KvCallError::ServerError(message)
        }
        _ => KvCallError::ClientError(message),
    }
}
