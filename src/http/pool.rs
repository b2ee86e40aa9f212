use crate::error::Result;
use reqwest::Client;
use std::time::Duration;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared builder for every outbound HTTP client in the engine (RPC gateway,
/// venue adapters, delegated signer): pooled keep-alive connections, TCP
/// nodelay, and a caller-supplied request timeout.
pub fn create_http_client(request_timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(10)
        .connect_timeout(CONNECTION_TIMEOUT)
        .timeout(request_timeout)
        .build()?;

    Ok(client)
}