//! Source clients for the two congressional upstreams.
//!
//! Clients do transport, XML decoding, and error translation only. They
//! hand back raw records in the upstream's own vocabulary and keep no state
//! between calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use congreso_core::{Chamber, RawBill, RawParliamentarian, RawVoteEntry, RawVoteSession};
use congreso_storage::{HttpFetcher, HttpRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod camara;
pub mod fixture;
pub mod senado;
pub mod xml;

pub use camara::CamaraClient;
pub use fixture::FixtureTransport;
pub use senado::SenadoClient;

pub const CRATE_NAME: &str = "congreso-adapters";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("{upstream} upstream unavailable: {cause}")]
    UpstreamUnavailable { upstream: Chamber, cause: String },
    #[error("{upstream} upstream returned an unusable document ({reason}): {snippet}")]
    UpstreamParseError {
        upstream: Chamber,
        reason: String,
        snippet: String,
    },
}

impl SourceError {
    pub fn upstream(&self) -> Chamber {
        match self {
            SourceError::UpstreamUnavailable { upstream, .. }
            | SourceError::UpstreamParseError { upstream, .. } => *upstream,
        }
    }

    pub fn unavailable(upstream: Chamber, cause: impl ToString) -> Self {
        SourceError::UpstreamUnavailable {
            upstream,
            cause: cause.to_string(),
        }
    }

    pub fn parse(upstream: Chamber, reason: impl ToString, body: &[u8]) -> Self {
        SourceError::UpstreamParseError {
            upstream,
            reason: reason.to_string(),
            snippet: xml::snippet(body),
        }
    }
}

/// Per-pass context threaded into every upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

/// Years an upstream publishes. `to == None` means "through the current year".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub from: i32,
    pub to: Option<i32>,
}

impl Coverage {
    pub fn from_year(from: i32) -> Self {
        Self { from, to: None }
    }

    pub fn contains(&self, year: i32) -> bool {
        let to = self.to.unwrap_or_else(|| Utc::now().year());
        (self.from..=to).contains(&year)
    }
}

/// One logical upstream call. `operation` and `params` identify the call
/// independently of the wire format, which the fixture transport relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub source: Chamber,
    pub operation: &'static str,
    pub params: Vec<(&'static str, String)>,
    pub http: HttpRequest,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, ctx: &FetchContext, request: &UpstreamRequest) -> Result<Vec<u8>, SourceError>;
}

/// Live transport over the shared fetcher.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    fetcher: Arc<HttpFetcher>,
}

impl HttpTransport {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, ctx: &FetchContext, request: &UpstreamRequest) -> Result<Vec<u8>, SourceError> {
        self.fetcher
            .send(ctx.run_id, request.source.as_str(), &request.http)
            .await
            .map(|resp| resp.body)
            .map_err(|err| SourceError::unavailable(request.source, err))
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> Chamber;

    fn coverage(&self) -> Coverage;

    async fn fetch_parliamentarians(
        &self,
        ctx: &FetchContext,
    ) -> Result<Vec<RawParliamentarian>, SourceError>;

    /// Bills entered in `year`. Years outside [`SourceClient::coverage`]
    /// yield an empty list without a request.
    async fn fetch_bills(&self, ctx: &FetchContext, year: i32) -> Result<Vec<RawBill>, SourceError>;

    async fn fetch_vote_sessions(
        &self,
        ctx: &FetchContext,
        year: i32,
    ) -> Result<Vec<RawVoteSession>, SourceError>;

    async fn fetch_roll_call(
        &self,
        ctx: &FetchContext,
        session_id: &str,
    ) -> Result<Vec<RawVoteEntry>, SourceError>;
}

/// The enabled source clients, one per chamber.
#[derive(Clone, Default)]
pub struct SourceSet {
    clients: BTreeMap<Chamber, Arc<dyn SourceClient>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: Arc<dyn SourceClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn insert(&mut self, client: Arc<dyn SourceClient>) {
        self.clients.insert(client.source(), client);
    }

    pub fn get(&self, chamber: Chamber) -> Option<Arc<dyn SourceClient>> {
        self.clients.get(&chamber).cloned()
    }

    pub fn chambers(&self) -> Vec<Chamber> {
        self.clients.keys().copied().collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<dyn SourceClient>> {
        self.clients.values()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub async fn fetch_parliamentarians(
        &self,
        ctx: &FetchContext,
        chamber: Chamber,
    ) -> Result<Vec<RawParliamentarian>, SourceError> {
        match self.clients.get(&chamber) {
            Some(client) => client.fetch_parliamentarians(ctx).await,
            None => Err(SourceError::unavailable(chamber, "source not enabled")),
        }
    }
}

impl std::fmt::Debug for SourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSet")
            .field("chambers", &self.chambers())
            .finish()
    }
}
