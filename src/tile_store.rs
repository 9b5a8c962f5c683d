//! Destinations for rendered tiles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::document::DocumentId;
use crate::render::TileImage;
use crate::tiles::TileCoord;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("retryable store error: {0}")]
    Retryable(String),

    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }
}

#[async_trait]
pub trait TileStore: Send + Sync {
    /// Write one tile, replacing any previous image at the same address.
    async fn put_tile(
        &self,
        document_id: DocumentId,
        tile: TileCoord,
        image: &TileImage,
    ) -> Result<(), StoreError>;
}

// ============================================================================
// HTTP object store
// ============================================================================

/// Stores tiles with `PUT {base_url}/{document_id}/{z}/{x}/{y}.png`.
///
/// 5xx, 429 and 408 responses and transport errors are retryable; other
/// non-success statuses are permanent.
#[derive(Clone)]
pub struct HttpTileStore {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl HttpTileStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tile_url(&self, document_id: DocumentId, tile: TileCoord) -> String {
        format!(
            "{}/{}/{}/{}/{}.png",
            self.base_url, document_id.0, tile.z, tile.x, tile.y
        )
    }
}

/// Whether a failed HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

#[async_trait]
impl TileStore for HttpTileStore {
    #[tracing::instrument(skip(self, image), fields(document_id = %document_id, tile = %tile))]
    async fn put_tile(
        &self,
        document_id: DocumentId,
        tile: TileCoord,
        image: &TileImage,
    ) -> Result<(), StoreError> {
        let url = self.tile_url(document_id, tile);
        let mut request = self
            .client
            .put(&url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, image.content_type.as_str())
            .body(image.bytes.clone());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Tile upload failed");
            StoreError::Retryable(e.to_string())
        })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            tracing::trace!(url = %url, status, bytes = image.bytes.len(), "Tile stored");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {} from tile store: {}", status, body);
        if is_retryable_status(status) {
            Err(StoreError::Retryable(message))
        } else {
            Err(StoreError::Permanent(message))
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Keeps tiles in memory. Failures can be scripted for tests.
#[derive(Clone, Default)]
pub struct InMemoryTileStore {
    tiles: Arc<Mutex<HashMap<(DocumentId, TileCoord), TileImage>>>,
    failures: Arc<Mutex<Vec<StoreError>>>,
}

impl InMemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `put_tile` call fail with `error`. Queued failures are
    /// consumed in FIFO order.
    pub fn fail_next(&self, error: StoreError) {
        self.failures.lock().push(error);
    }

    pub fn get(&self, document_id: DocumentId, tile: TileCoord) -> Option<TileImage> {
        self.tiles.lock().get(&(document_id, tile)).cloned()
    }

    pub fn tile_count(&self, document_id: DocumentId) -> usize {
        self.tiles
            .lock()
            .keys()
            .filter(|(doc, _)| *doc == document_id)
            .count()
    }
}

#[async_trait]
impl TileStore for InMemoryTileStore {
    async fn put_tile(
        &self,
        document_id: DocumentId,
        tile: TileCoord,
        image: &TileImage,
    ) -> Result<(), StoreError> {
        {
            let mut failures = self.failures.lock();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        self.tiles.lock().insert((document_id, tile), image.clone());
        Ok(())
    }
}
