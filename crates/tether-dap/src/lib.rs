//! Debug Adapter Protocol transport.
//!
//! - [`dap::codec`]: `Content-Length` framing with an incremental decoder.
//! - [`dap::messages`]: the request/response/event sum type.
//! - [`DapClient`]: request/response correlation and per-event subscriptions over a stream.
//! - [`ReverseConnector`]: accepts the token-authenticated connection an adapter makes back
//!   to us.

pub mod auth;
pub mod client;
pub mod dap;
pub mod dap_tokio;
pub mod error;
pub mod reverse;

pub use crate::auth::generate_auth_token;
pub use crate::client::{DapClient, DapClientConfig, PendingResponse};
pub use crate::dap::messages::{Event, Message, Request, Response};
pub use crate::error::{DapError, Result};
pub use crate::reverse::{ReverseConnector, ReverseConnectorConfig};
