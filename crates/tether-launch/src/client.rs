use std::net::SocketAddr;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::rpc::LaunchResponse;
use crate::LaunchError;

/// Send one request to a launch gateway and wait for its answer.
///
/// An empty answer means the gateway refused to process the request (usually a token mismatch).
pub async fn launch<T>(addr: SocketAddr, request: &T) -> Result<LaunchResponse, LaunchError>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(request)
        .map_err(|err| LaunchError::Start(format!("failed to encode launch request: {err}")))?;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    if response.iter().all(u8::is_ascii_whitespace) {
        return Err(LaunchError::Start(
            "the launch gateway refused the request".to_string(),
        ));
    }

    serde_json::from_slice(&response)
        .map_err(|err| LaunchError::Start(format!("malformed launch response: {err}")))
}
