//! Offline transport serving recorded upstream documents from disk.
//!
//! `fixtures/<source>/<operation>[_<param>...].xml`. A missing file behaves
//! like an outage of that upstream call.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::{FetchContext, SourceError, Transport, UpstreamRequest};

#[derive(Debug, Clone)]
pub struct FixtureTransport {
    root: PathBuf,
}

impl FixtureTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, request: &UpstreamRequest) -> PathBuf {
        let mut stem = request.operation.to_string();
        for (_, value) in &request.params {
            stem.push('_');
            stem.push_str(&sanitize(value));
        }
        self.root
            .join(request.source.as_str())
            .join(format!("{stem}.xml"))
    }
}

fn sanitize(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            '/' => '-',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '.' => c,
            _ => '_',
        })
        .collect()
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn send(&self, _ctx: &FetchContext, request: &UpstreamRequest) -> Result<Vec<u8>, SourceError> {
        let path = self.path_for(request);
        debug!(path = %path.display(), "serving fixture");
        tokio::fs::read(&path).await.map_err(|err| {
            SourceError::unavailable(
                request.source,
                format!("fixture {} unreadable: {err}", path.display()),
            )
        })
    }
}
