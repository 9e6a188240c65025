//! Hostname classifier guarding outbound fetches against SSRF.
//!
//! Every network request the service makes as a result of user input
//! (manifest fetch, icon fetch, HTML discovery) passes its target host
//! through [`is_private_hostname`] before a connection is opened. A
//! positive match is surfaced as [`FetchError::Blocked`] so the API layer
//! can map it to a 403 rather than a generic server error.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::errors::FetchError;

/// Returns true if `hostname` names a loopback, private, link-local, or
/// cloud-metadata destination. Pure string/address classification; no DNS.
pub fn is_private_hostname(hostname: &str) -> bool {
    let host = hostname.trim().trim_start_matches('[').trim_end_matches(']');
    let lower = host.to_ascii_lowercase();

    if lower == "localhost" || lower == "metadata.google.internal" {
        return true;
    }

    if let Ok(v4) = lower.parse::<Ipv4Addr>() {
        return is_private_v4(&v4);
    }

    if let Ok(v6) = lower.parse::<Ipv6Addr>() {
        return is_private_v6(&v6);
    }

    false
}

fn is_private_v4(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    match octets[0] {
        127 => true,                           // loopback
        0 => true,                             // "this network"
        10 => true,                            // RFC1918
        172 => (16..=31).contains(&octets[1]), // RFC1918 172.16/12
        192 => octets[1] == 168,               // RFC1918 192.168/16
        169 => octets[1] == 254,               // link-local / metadata
        _ => false,
    }
}

fn is_private_v6(addr: &Ipv6Addr) -> bool {
    if addr.is_loopback() {
        return true;
    }
    let first = addr.segments()[0];
    // fc00::/7 unique-local, fe80::/10 link-local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Gate an outbound fetch target. `allow_private` is only set in dev mode
/// so local test PWAs can be packaged.
pub fn ensure_public_url(url: &Url, allow_private: bool) -> Result<(), FetchError> {
    let host = url.host_str().ok_or_else(|| FetchError::Blocked {
        host: url.to_string(),
    })?;
    if !allow_private && is_private_hostname(host) {
        return Err(FetchError::Blocked {
            host: host.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_localhost_and_metadata_names() {
        assert!(is_private_hostname("localhost"));
        assert!(is_private_hostname("LOCALHOST"));
        assert!(is_private_hostname("metadata.google.internal"));
    }

    #[test]
    fn blocks_v4_loopback_and_this_network() {
        assert!(is_private_hostname("127.0.0.1"));
        assert!(is_private_hostname("127.255.255.254"));
        assert!(is_private_hostname("0.0.0.0"));
        assert!(is_private_hostname("0.1.2.3"));
    }

    #[test]
    fn blocks_rfc1918_ranges() {
        assert!(is_private_hostname("10.0.0.1"));
        assert!(is_private_hostname("10.255.255.255"));
        assert!(is_private_hostname("172.16.0.1"));
        assert!(is_private_hostname("172.31.255.255"));
        assert!(is_private_hostname("192.168.1.1"));
    }

    #[test]
    fn allows_v4_near_misses() {
        assert!(!is_private_hostname("172.15.0.1"));
        assert!(!is_private_hostname("172.32.0.1"));
        assert!(!is_private_hostname("192.169.0.1"));
        assert!(!is_private_hostname("11.0.0.1"));
        assert!(!is_private_hostname("169.253.0.1"));
    }

    #[test]
    fn blocks_link_local() {
        assert!(is_private_hostname("169.254.169.254"));
        assert!(is_private_hostname("169.254.0.1"));
    }

    #[test]
    fn blocks_v6_ranges() {
        assert!(is_private_hostname("::1"));
        assert!(is_private_hostname("[::1]"));
        assert!(is_private_hostname("fc00::1"));
        assert!(is_private_hostname("fd12:3456::1"));
        assert!(is_private_hostname("fe80::1"));
    }

    #[test]
    fn allows_public_hosts() {
        assert!(!is_private_hostname("93.184.216.34"));
        assert!(!is_private_hostname("example.com"));
        assert!(!is_private_hostname("2606:2800:220:1:248:1893:25c8:1946"));
        assert!(!is_private_hostname("sub.domain.example.org"));
    }

    #[test]
    fn ensure_public_url_blocks_private() {
        let url = Url::parse("https://127.0.0.1/manifest.json").unwrap();
        assert!(matches!(
            ensure_public_url(&url, false),
            Err(FetchError::Blocked { .. })
        ));
        assert!(ensure_public_url(&url, true).is_ok());

        let ok = Url::parse("https://example.com/manifest.json").unwrap();
        assert!(ensure_public_url(&ok, false).is_ok());
    }
}
