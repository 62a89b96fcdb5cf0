//! HTTP transport for the Trellis framework.
//!
//! Every request becomes a [`Connection`](trellis_core::Connection) and runs
//! through the [`Environment`](trellis_core::Environment). The buffered
//! response is written back, or, when the realtime upgrader accepted the
//! request, the WebSocket is handed to the application's realtime server.

pub mod router;
pub mod server;

// Re-export primary types for convenience.
pub use router::build_router;
pub use server::{ServerError, start_server};
