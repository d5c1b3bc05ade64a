use std::net::SocketAddr;

use anyhow::Context as _;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

/// RFC 3339 rendering that can’t take the process down on a degenerate
/// timestamp.
pub fn format_rfc3339(datetime: OffsetDateTime) -> String {
    datetime
        .format(&Rfc3339)
        .unwrap_or_else(|_| datetime.unix_timestamp().to_string())
}

pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

pub fn url_to_socket_addr(url: &Url) -> anyhow::Result<SocketAddr> {
    let host = url.host_str().context("URL has no host")?;
    let port = url.port_or_known_default().context("URL has no port")?;

    let host = if host == "*" { "0.0.0.0" } else { host };

    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid socket address: {host}:{port}"))
}
