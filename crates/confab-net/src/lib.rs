//! # confab-net
//!
//! Transport layer of the Confab SDK: the REST executor, the online
//! state tracker, and the socket connection with its gap-detection
//! cursor and request correlation table.
//!
//! The socket and the online monitor each run in a dedicated tokio task
//! and communicate with the rest of the SDK through typed command and
//! notification channels.

pub mod cursor;
pub mod online;
pub mod requests;
pub mod rest;
pub mod socket;

pub use cursor::StreamCursor;
pub use online::{
    spawn_online_monitor, ConnectivityProbe, OnlineCommand, OnlineNotification, OnlineState,
};
pub use requests::{PendingRequests, SocketResponse};
pub use rest::{
    execute_with_retry, HttpExecutor, HttpMethod, HttpRequest, HttpResponse, RestProbe,
    RestTransport,
};
pub use socket::{spawn_socket, SocketCommand, SocketConfig, SocketNotification};
