//! Typed HTTP clients for the three protocols.
//!
//! Error bodies are decoded into `ClientError::Api` with their wire code, so
//! workers can branch on `ErrorCode::TokenMismatch` and friends.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use aeon_core::{AggregateId, AggregateIdentifier, DomainEvent, ErrorCode, LockMetadata, Snapshot};
use aeon_infra::replay::{ReplayReport, ReplayWindow};

use crate::app::dto::{
    AwaitedItem, DeferRequest, ErrorBody, HasDomainEventsWithCausationIdResponse,
    PerformReplayRequest, StoreSnapshotRequest, WriteDomainEventsRequest,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{code} ({status}): {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream ended before an item arrived")]
    StreamEnded,
}

impl ClientError {
    /// Wire code of an error response, if the server sent one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await?;
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.code, body.message),
        Err(_) => (ErrorCode::UnknownError, text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

fn is_heartbeat(value: &JsonValue) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.len() == 1 && o.get("name").and_then(JsonValue::as_str) == Some("heartbeat"))
}

/// Reads ndjson values from a streaming response, skipping heartbeats.
struct NdjsonReader {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

impl NdjsonReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                return Ok(Some(line));
            }

            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if self.buffer.is_empty() => return Ok(None),
                None => return Ok(Some(std::mem::take(&mut self.buffer))),
            }
        }
    }

    async fn next_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ClientError> {
        while let Some(line) = self.next_line().await? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let value: JsonValue = serde_json::from_slice(&line)?;
            if is_heartbeat(&value) {
                continue;
            }
            return Ok(Some(serde_json::from_value(value)?));
        }
        Ok(None)
    }

    async fn collect<T: DeserializeOwned>(mut self) -> Result<Vec<T>, ClientError> {
        let mut values = Vec::new();
        while let Some(value) = self.next_value().await? {
            values.push(value);
        }
        Ok(values)
    }
}

fn trim_base(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

// -------------------------
// Priority queue protocol
// -------------------------

/// Worker-side client of `/await-domain-event/v2`.
#[derive(Debug, Clone)]
pub struct AwaitItemClient {
    http: reqwest::Client,
    base_url: String,
}

impl AwaitItemClient {
    /// `base_url` is the server root, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: format!("{}/await-domain-event/v2", trim_base(base_url)),
        }
    }

    /// Block until the server hands out an item and its lease.
    pub async fn await_item(&self) -> Result<AwaitedItem, ClientError> {
        let response = check(self.http.get(&self.base_url).send().await?).await?;
        NdjsonReader::new(response)
            .next_value()
            .await?
            .ok_or(ClientError::StreamEnded)
    }

    pub async fn renew_lock(&self, lock: &LockMetadata) -> Result<(), ClientError> {
        self.post("renew-lock", lock).await
    }

    pub async fn acknowledge(&self, lock: &LockMetadata) -> Result<(), ClientError> {
        self.post("acknowledge", lock).await
    }

    pub async fn defer(&self, lock: &LockMetadata, priority: i64) -> Result<(), ClientError> {
        let request = DeferRequest {
            lock: lock.clone(),
            priority,
        };
        self.post("defer", &request).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

// -------------------------
// Domain event store protocol
// -------------------------

#[derive(Debug, Clone)]
pub struct DomainEventStoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl DomainEventStoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: format!("{}/domain-event-store/v2", trim_base(base_url)),
        }
    }

    pub async fn store_domain_events(&self, domain_events: Vec<DomainEvent>) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/write", self.base_url))
            .json(&WriteDomainEventsRequest { domain_events })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn get_replay(&self, from_timestamp: Option<i64>) -> Result<Vec<DomainEvent>, ClientError> {
        let mut request = self.http.get(format!("{}/replay", self.base_url));
        if let Some(ts) = from_timestamp {
            request = request.query(&[("fromTimestamp", ts)]);
        }
        let response = check(request.send().await?).await?;
        NdjsonReader::new(response).collect().await
    }

    pub async fn get_replay_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        from_revision: Option<u64>,
        to_revision: Option<u64>,
    ) -> Result<Vec<DomainEvent>, ClientError> {
        let mut request = self
            .http
            .get(format!("{}/replay/{aggregate_id}", self.base_url));
        if let Some(from) = from_revision {
            request = request.query(&[("fromRevision", from)]);
        }
        if let Some(to) = to_revision {
            request = request.query(&[("toRevision", to)]);
        }
        let response = check(request.send().await?).await?;
        NdjsonReader::new(response).collect().await
    }

    /// `None` when the aggregate has no events.
    pub async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<DomainEvent>, ClientError> {
        self.get_optional("last-domain-event", aggregate_identifier)
            .await
    }

    pub async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<Snapshot>, ClientError> {
        self.get_optional("snapshot", aggregate_identifier).await
    }

    pub async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/snapshot", self.base_url))
            .json(&StoreSnapshotRequest { snapshot })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn get_domain_events_by_causation_id(
        &self,
        causation_id: uuid::Uuid,
    ) -> Result<Vec<DomainEvent>, ClientError> {
        let response = self
            .http
            .get(format!("{}/domain-events-by-causation-id", self.base_url))
            .query(&[("causation-id", causation_id)])
            .send()
            .await?;
        NdjsonReader::new(check(response).await?).collect().await
    }

    pub async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: uuid::Uuid,
    ) -> Result<Vec<DomainEvent>, ClientError> {
        let response = self
            .http
            .get(format!("{}/domain-events-by-correlation-id", self.base_url))
            .query(&[("correlation-id", correlation_id)])
            .send()
            .await?;
        NdjsonReader::new(check(response).await?).collect().await
    }

    pub async fn has_domain_events_with_causation_id(
        &self,
        causation_id: uuid::Uuid,
    ) -> Result<bool, ClientError> {
        let response = self
            .http
            .get(format!("{}/has-domain-events-with-causation-id", self.base_url))
            .query(&[("causation-id", causation_id)])
            .send()
            .await?;
        let body: HasDomainEventsWithCausationIdResponse = check(response).await?.json().await?;
        Ok(body.has_domain_events_with_causation_id)
    }

    pub async fn get_aggregate_identifiers(&self) -> Result<Vec<AggregateIdentifier>, ClientError> {
        let response = self
            .http
            .get(format!("{}/aggregate-identifiers", self.base_url))
            .send()
            .await?;
        NdjsonReader::new(check(response).await?).collect().await
    }

    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<T>, ClientError> {
        let identifier = serde_json::to_string(aggregate_identifier)?;
        let response = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .query(&[("aggregateIdentifier", identifier)])
            .send()
            .await?;

        match check(response).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(err) if err.code() == Some(ErrorCode::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

// -------------------------
// Replay protocol
// -------------------------

#[derive(Debug, Clone)]
pub struct ReplayClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReplayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: format!("{}/perform-replay/v2", trim_base(base_url)),
        }
    }

    pub async fn perform_replay(&self, aggregates: Vec<ReplayWindow>) -> Result<ReplayReport, ClientError> {
        let response = self
            .http
            .post(&self.base_url)
            .json(&PerformReplayRequest { aggregates })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}
