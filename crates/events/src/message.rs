use std::sync::Arc;

use fusion_core::dream::DreamSnapshot;
use fusion_core::protocol::WorkerResponse;

/// Payload carried on the hub.
///
/// Both variants are reference-counted so fan-out clones a pointer, not
/// image bytes.
#[derive(Debug, Clone)]
pub enum HubMessage {
    /// A worker response (or watchdog-synthesized failure).
    Response(Arc<WorkerResponse>),
    /// A dream snapshot after one fold step.
    Dream(DreamSnapshot),
}
