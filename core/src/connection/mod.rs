//! Managed streaming connections

pub mod codec;
pub mod manager;
pub mod subscription;
pub mod transport;
pub mod ws;

pub use codec::{Inbound, JsonCodec, StreamCodec, params_match};
pub use manager::{
    ConnectionBuilder, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
};
pub use subscription::{DataCallback, ErrorCallback, Subscription, SubscriptionId};
pub use transport::{Connector, Frame, StreamSession};
pub use ws::{WsConnector, WsSession};
