// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Endpoint address helpers.
//!
//! `iftop` prints flow endpoints as `host:port`, `[ipv6]:port`, bare IPv4 or
//! bare IPv6 depending on its flags; flow typing needs the bare address.

use std::net::IpAddr;

/// Extract the bare IP (or hostname) from an `iftop` endpoint token.
///
/// Idempotent: applying it to its own output is a no-op.
pub fn extract_ip(addr: &str) -> &str {
    if let Some((head, _)) = addr.split_once("]:") {
        // [IPv6]:Port
        return head.strip_prefix('[').unwrap_or(head);
    }

    if addr.matches(':').count() == 1 {
        // IPv4:Port
        return addr.split(':').next().unwrap_or(addr);
    }

    // Bare IPv6 (several colons), bare IPv4 or hostname.
    addr
}

/// Whether `ip` parses as a private address: RFC1918 for IPv4, ULA (fc00::/7)
/// for IPv6. Unparseable input is treated as public.
pub fn is_private_ip(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private(),
        Ok(IpAddr::V6(v6)) => (v6.octets()[0] & 0xfe) == 0xfc,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_ip() {
        let tests = [
            ("1.2.3.4", "1.2.3.4"),
            ("1.2.3.4:5678", "1.2.3.4"),
            ("::FFFF:C0A8:1%1", "::FFFF:C0A8:1%1"),
            ("[::FFFF:C0A8:1%1]:80", "::FFFF:C0A8:1%1"),
            ("10.0.10.204:http", "10.0.10.204"),
            ("host.example.com:443", "host.example.com"),
            ("all", "all"),
            ("", ""),
        ];
        for (addr, expect) in tests {
            assert_eq!(extract_ip(addr), expect, "addr: {addr}");
        }
    }

    #[test]
    fn test_extract_ip_idempotent() {
        for addr in ["1.2.3.4:5678", "[fe80::1]:80", "fe80::1", "host:http"] {
            let once = extract_ip(addr);
            assert_eq!(extract_ip(once), once);
        }
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip("10.0.10.201"));
        assert!(is_private_ip("172.16.0.1"));
        assert!(is_private_ip("192.168.1.1"));
        assert!(is_private_ip("fc00::1"));
        assert!(is_private_ip("fd12:3456::1"));

        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("2001:db8::1"));
        assert!(!is_private_ip("not-an-ip"));
        assert!(!is_private_ip(""));
    }
}
