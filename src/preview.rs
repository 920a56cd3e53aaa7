use crate::client::{CameraClient, CameraClientError};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct FetchState {
    last_fetch: Option<Instant>,
    last_image: Option<Arc<Vec<u8>>>,
    encoding: bool,
}

/// Rate-capped access to the camera's still-image endpoint.
///
/// The fetch lock serializes requests, so concurrent fetches for the same
/// device coalesce: late arrivals observe the refreshed cache and return it
/// instead of issuing their own request. The camera's Jpeg encoder is
/// started lazily on the first fetch and stopped on [`release`](Self::release).
#[derive(Debug)]
pub struct StillImageSource {
    client: CameraClient,
    min_interval: Duration,
    state: Mutex<FetchState>,
}

impl StillImageSource {
    pub fn new(client: CameraClient, min_interval: Duration) -> Self {
        StillImageSource { client, min_interval, state: Mutex::new(FetchState::default()) }
    }

    /// Opaque URL of the image endpoint, passed through to collaborators
    /// that render frames themselves.
    pub fn url(&self) -> String {
        self.client.still_image_url()
    }

    pub async fn fetch(&self) -> Result<Arc<Vec<u8>>, CameraClientError> {
        let mut state = self.state.lock().await;
        if let (Some(at), Some(image)) = (state.last_fetch, state.last_image.as_ref()) {
            if at.elapsed() < self.min_interval {
                return Ok(Arc::clone(image));
            }
        }
        if !state.encoding {
            self.client.request("JpegEncode", Some(json!({ "Operate": "Start" }))).await?;
            debug!("📷 Jpeg encoder started");
            state.encoding = true;
        }
        let image = Arc::new(self.client.fetch_still_image().await?);
        state.last_fetch = Some(Instant::now());
        state.last_image = Some(Arc::clone(&image));
        Ok(image)
    }

    /// Stop the camera-side encoder. Safe to call when it never started.
    pub async fn release(&self) -> Result<(), CameraClientError> {
        let mut state = self.state.lock().await;
        if state.encoding {
            self.client.request("JpegEncode", Some(json!({ "Operate": "Stop" }))).await?;
            debug!("📷 Jpeg encoder stopped");
            state.encoding = false;
        }
        Ok(())
    }
}
