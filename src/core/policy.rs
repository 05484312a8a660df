use std::net::IpAddr;

use url::{Host, Url};

/// Pluggable request-url predicate, consulted at submission when installed.
pub trait UrlPolicy: Send + Sync {
    fn allows(&self, url: &Url) -> bool;
}

impl<F> UrlPolicy for F
where
    F: Fn(&Url) -> bool + Send + Sync,
{
    fn allows(&self, url: &Url) -> bool {
        self(url)
    }
}

/// Forbids non-http(s) schemes and hosts that resolve syntactically to
/// private, loopback, link-local, or otherwise reserved addresses. Hostnames
/// are allowed through; this predicate does not perform DNS resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublicAddressPolicy;

impl UrlPolicy for PublicAddressPolicy {
    fn allows(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        match url.host() {
            Some(Host::Ipv4(address)) => !is_reserved_address(IpAddr::V4(address)),
            Some(Host::Ipv6(address)) => !is_reserved_address(IpAddr::V6(address)),
            Some(Host::Domain(domain)) => !domain.eq_ignore_ascii_case("localhost"),
            None => false,
        }
    }
}

fn is_reserved_address(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // Carrier-grade NAT, 100.64.0.0/10.
                || (v4.octets()[0] == 100 && (64..=127).contains(&v4.octets()[1]))
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique local, fc00::/7.
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link local, fe80::/10.
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_reserved_address(IpAddr::V4(v4)))
        }
    }
}
