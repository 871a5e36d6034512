//! Access Guard
//!
//! Admits or rejects inbound connections by source address. When the server
//! is restricted to loopback clients, only the exact loopback forms pass:
//! `127.0.0.1`, `::1`, and the IPv4-mapped `::ffff:127.0.0.1`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use jscgi_common::{CgiError, Result};

#[derive(Debug, Clone, Copy)]
pub struct AccessGuard {
    localhost_only: bool,
}

impl AccessGuard {
    pub fn new(localhost_only: bool) -> Self {
        Self { localhost_only }
    }

    /// Returns `Err(CgiError::AccessDenied)` for a disallowed peer.
    pub fn check(&self, peer: IpAddr) -> Result<()> {
        if !self.localhost_only || is_exact_loopback(peer) {
            Ok(())
        } else {
            tracing::debug!("Rejecting non-loopback client {}", peer);
            Err(CgiError::AccessDenied(peer))
        }
    }
}

fn is_exact_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => {
            v6 == Ipv6Addr::LOCALHOST || v6.to_ipv4_mapped() == Some(Ipv4Addr::LOCALHOST)
        }
    }
}
