//! Realtime push for the Trellis framework.
//!
//! Browsers open a WebSocket on the realtime path with a signed id. The
//! [`Upgrader`] verifies the id inside the application pipeline and the
//! transport hands the socket to the [`RealtimeServer`], which keeps an
//! id-keyed registry, sends a `beat` heartbeat, and broadcasts
//! `{"channel": ..., "payload": ...}` frames through a [`ChannelAdapter`].
//!
//! Data subscriptions registered with the `"realtime"` handler are pushed
//! to sockets by [`SocketHandler`]; see [`handler::subscribe_socket`].
//!
//! [`ChannelAdapter`]: adapter::ChannelAdapter

pub mod adapter;
pub mod behavior;
pub mod error;
pub mod handler;
pub mod server;
pub mod socket;
pub mod upgrader;

pub use error::RealtimeError;
pub use handler::{DataPresence, SocketHandler};
pub use server::{PresenceHook, RealtimeServer};
pub use socket::{Envelope, Socket};
pub use upgrader::{PendingUpgrade, Upgrader, issue_token};
