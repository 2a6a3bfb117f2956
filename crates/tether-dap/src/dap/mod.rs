pub mod codec;
pub mod messages;

/// Maximum allowed DAP message payload size (in bytes).
///
/// Caps the incoming `Content-Length` header so a hostile peer cannot make the decoder reserve
/// an enormous buffer before a single body byte has arrived.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Maximum size of a complete header block, terminator included.
pub const MAX_DAP_HEADER_BYTES: usize = 8 * 1024; // 8 KiB

/// Header carrying the pre-shared token on reverse connections.
pub const AUTH_TOKEN_HEADER: &str = "Auth-Token";
