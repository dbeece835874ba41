//! Well-known broadcast hub channel names.

/// Every decoded worker response (and every watchdog-synthesized failure)
/// is published here. Consumers must filter by request id.
pub const CHANNEL_RESPONSE: &str = "response";

/// Dream snapshots, one per fold step. Consumers filter by dream id.
pub const CHANNEL_DREAM: &str = "dream";
