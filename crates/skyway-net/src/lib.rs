// Network side of the client: session bootstrap over HTTP and the
// WebSocket signaling channel.

pub mod bootstrap;
pub mod channel;
pub mod transport;

pub use bootstrap::{bootstrap_url, fetch_session};
pub use channel::{spawn_signaling, ChannelCommand, ChannelNotification};
pub use transport::connect;
