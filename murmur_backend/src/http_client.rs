//! reqwest client construction shared by the LLM and bridge adapters.

use std::panic::catch_unwind;
use std::time::Duration;

const SYSTEM_PROXY_ENV: &str = "MURMUR_ENABLE_SYSTEM_PROXY";

/// Builds a client, trying system proxy discovery only when
/// `MURMUR_ENABLE_SYSTEM_PROXY` is set. Proxy lookup can panic on some
/// sandboxed hosts, so every attempt is isolated and a direct client is the
/// last resort.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    let mut attempts = Vec::with_capacity(2);
    if system_proxy_enabled(std::env::var(SYSTEM_PROXY_ENV).ok().as_deref()) {
        attempts.push(false);
    }
    attempts.push(true);

    for no_proxy in attempts {
        match catch_unwind(|| attempt_build(timeout, no_proxy)) {
            Ok(Ok(client)) => return client,
            Ok(Err(e)) => tracing::warn!("HTTP client build failed (no_proxy={}): {}", no_proxy, e),
            Err(_) => tracing::warn!("HTTP client build panicked (no_proxy={})", no_proxy),
        }
    }

    tracing::error!("Falling back to a default HTTP client without timeouts");
    reqwest::Client::new()
}

fn system_proxy_enabled(raw: Option<&str>) -> bool {
    raw.map(|value| value.trim() == "1" || value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
