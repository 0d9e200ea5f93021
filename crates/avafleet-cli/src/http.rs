use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};

use avafleet_core::naming::parse_ipv4;

/// Service that answers with the caller's public IPv4 address as plain text.
pub const PUBLIC_IP_URL: &str = "https://api.ipify.org";

fn client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!("avafleet/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Fetch a URL and return the response body as a string.
pub fn fetch_text(url: &str) -> Result<String> {
    let resp = client(Duration::from_secs(30))?
        .get(url)
        .send()
        .with_context(|| format!("HTTP request failed: {}", url))?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {} for {}", status, url);
    }

    resp.text()
        .with_context(|| format!("Failed to read response body from {}", url))
}

/// Public IPv4 address of this machine, as seen from the internet.
pub fn current_ip() -> Result<Ipv4Addr> {
    current_ip_from(PUBLIC_IP_URL)
}

pub fn current_ip_from(url: &str) -> Result<Ipv4Addr> {
    let body = fetch_text(url)?;
    parse_ipv4(body.trim()).with_context(|| format!("{} did not return an IPv4 address", url))
}
