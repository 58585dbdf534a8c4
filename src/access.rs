//! Client IP allowlist

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Which peers may use the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAllowlist {
    enabled: bool,
    ips: BTreeSet<IpAddr>,
}

impl ClientAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Add an IP literal; IPv4-mapped IPv6 addresses are stored as IPv4
    pub fn add_ip(&mut self, ip: &str) -> Result<()> {
        let trimmed = ip.trim();
        let trimmed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        let parsed: IpAddr = trimmed
            .parse()
            .map_err(|_| Error::invalid_argument(format!("invalid IP address: {:?}", ip)))?;
        self.ips.insert(parsed.to_canonical());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ips.clear();
    }

    pub fn ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.ips.iter()
    }

    /// Disabled lists admit everyone
    pub fn admit(&self, ip: IpAddr) -> bool {
        !self.enabled || self.ips.contains(&ip.to_canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_disabled_admits_everyone() {
        let list = ClientAllowlist::new();
        assert!(list.admit(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))));
    }

    #[test]
    fn test_enabled_filters() {
        let mut list = ClientAllowlist::new();
        list.set_enabled(true);
        assert!(!list.admit(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        list.add_ip("192.168.1.20").unwrap();
        list.add_ip(" [::1] ").unwrap();
        assert!(list.admit("192.168.1.20".parse().unwrap()));
        assert!(list.admit(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!list.admit("192.168.1.21".parse().unwrap()));

        list.clear();
        assert!(!list.admit("192.168.1.20".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_addresses_are_canonical() {
        let mut list = ClientAllowlist::new();
        list.set_enabled(true);
        list.add_ip("10.0.0.5").unwrap();

        let mapped: IpAddr = "::ffff:10.0.0.5".parse().unwrap();
        assert!(list.admit(mapped));

        list.add_ip("::ffff:10.0.0.6").unwrap();
        assert!(list.admit("10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn test_rejects_non_ip() {
        let mut list = ClientAllowlist::new();
        for bad in ["", "localhost", "10.0.0.0/8", "300.1.1.1"] {
            assert_eq!(list.add_ip(bad).err().unwrap().code(), StatusCode::InvalidArgument);
        }
    }
}
