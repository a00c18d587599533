//! Ambient HTTP middleware: request logging for the gateway's plain HTTP routes
//! (`/health`, `/metrics`). The `/ws` upgrade route bypasses this - WebSocket
//! sessions log through the gateway's own session lifecycle events instead.

pub mod logging;

pub use logging::request_logging_simple;
