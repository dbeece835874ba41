//! WebSocket endpoints.

pub mod dream_watch;
