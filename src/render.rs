//! Tile renderer abstraction.
//!
//! Rendering a tile (resampling the source raster through the document's
//! transform) is an injected capability, so the job pipeline can be driven
//! and tested without touching real imagery.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::document::DocumentId;
use crate::geometry::FittedTransform;
use crate::tiles::TileCoord;

/// Everything a renderer needs to produce one tile.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub document_id: DocumentId,
    pub tile: TileCoord,
    pub transform: Arc<FittedTransform>,
    /// Edge length of the output image in pixels.
    pub tile_size: u32,
}

/// An encoded tile image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileImage {
    pub bytes: Bytes,
    pub content_type: String,
}

impl TileImage {
    pub fn png(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: "image/png".to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Transient failure; the same request may succeed later.
    #[error("retryable render error: {0}")]
    Retryable(String),

    /// The request can never be rendered.
    #[error("permanent render error: {0}")]
    Permanent(String),
}

impl RenderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RenderError::Retryable(_))
    }
}

#[async_trait]
pub trait TileRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<TileImage, RenderError>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock renderer for testing.
///
/// Responses can be scripted per tile (keyed by `z/x/y`), in FIFO order.
/// Tiles without a scripted response render successfully to a small
/// placeholder body.
///
/// # Example
/// ```ignore
/// let renderer = MockTileRenderer::new();
/// renderer.add_response("3/1/2", Err(RenderError::Retryable("busy".into())));
/// ```
#[derive(Clone, Default)]
pub struct MockTileRenderer {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<RenderRequest>>>,
    in_flight: Arc<AtomicUsize>,
}

enum MockResponse {
    Immediate(Result<TileImage, RenderError>),
    /// Completes once the paired sender fires or is dropped.
    Triggered {
        response: Result<TileImage, RenderError>,
        trigger: oneshot::Receiver<()>,
    },
}

impl MockTileRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, tile: &str, response: Result<TileImage, RenderError>) {
        self.responses
            .lock()
            .entry(tile.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Script a response that blocks until the returned sender is used or
    /// dropped. Holding the sender forever simulates a hung renderer.
    pub fn add_response_with_trigger(
        &self,
        tile: &str,
        response: Result<TileImage, RenderError>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(tile.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    pub fn get_calls(&self) -> Vec<RenderRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls made for one tile.
    pub fn calls_for(&self, tile: TileCoord) -> usize {
        self.calls.lock().iter().filter(|c| c.tile == tile).count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TileRenderer for MockTileRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<TileImage, RenderError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(request.clone());

        let key = request.tile.to_string();
        let scripted = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        match scripted {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                let _ = trigger.await;
                response
            }
            None => Ok(TileImage::png(format!("tile {}", key).into_bytes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::transform::AffineParams;

    fn request(tile: TileCoord) -> RenderRequest {
        RenderRequest {
            document_id: DocumentId::new(),
            tile,
            transform: Arc::new(FittedTransform::Affine(AffineParams {
                longitude: [1.0, 0.0, 0.0],
                latitude: [0.0, 1.0, 0.0],
            })),
            tile_size: 256,
        }
    }

    #[tokio::test]
    async fn test_scripted_responses_are_fifo() {
        let renderer = MockTileRenderer::new();
        let tile = TileCoord::new(2, 1, 1);
        renderer.add_response("2/1/1", Err(RenderError::Retryable("busy".into())));
        renderer.add_response("2/1/1", Err(RenderError::Permanent("corrupt".into())));

        assert_eq!(
            renderer.render(&request(tile)).await,
            Err(RenderError::Retryable("busy".into()))
        );
        assert_eq!(
            renderer.render(&request(tile)).await,
            Err(RenderError::Permanent("corrupt".into()))
        );
        let image = renderer.render(&request(tile)).await.unwrap();
        assert_eq!(image.content_type, "image/png");
        assert_eq!(renderer.calls_for(tile), 3);
        assert_eq!(renderer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_triggered_response_waits() {
        let renderer = MockTileRenderer::new();
        let tile = TileCoord::new(0, 0, 0);
        let trigger = renderer.add_response_with_trigger("0/0/0", Ok(TileImage::png("x")));

        let handle = {
            let renderer = renderer.clone();
            tokio::spawn(async move { renderer.render(&request(tile)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(renderer.in_flight_count(), 1);

        trigger.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), TileImage::png("x"));
        assert_eq!(renderer.in_flight_count(), 0);
    }
}
