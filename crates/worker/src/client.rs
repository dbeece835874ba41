//! The seam between the dream manager and the worker.

use async_trait::async_trait;
use futures::stream::BoxStream;
use fusion_core::protocol::{RequestKind, ResponseBody};
use fusion_core::settings::Settings;
use fusion_core::types::DreamId;

use crate::error::WorkerError;

/// Response bodies for one request, in arrival order. The stream ends
/// after the first terminal (`stopped`) response.
pub type ResponseStream = BoxStream<'static, ResponseBody>;

/// Something that can run requests against a worker.
///
/// Implemented by [`crate::WorkerSupervisor`]; tests substitute scripted
/// clients.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Enqueue a request and stream back its response bodies.
    ///
    /// Errors only if the worker cannot be started or the request cannot be
    /// queued. A worker that dies mid-request surfaces as a crashed
    /// `Error` body on the stream, not as an `Err` here.
    async fn send_request_and_watch(
        &self,
        request_id: DreamId,
        kind: RequestKind,
        body: serde_json::Value,
    ) -> Result<ResponseStream, WorkerError>;

    /// Apply new settings, restarting the worker.
    async fn update_settings(&self, settings: Settings) -> Result<(), WorkerError>;

    async fn shutdown(&self);
}
