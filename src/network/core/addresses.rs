//! Addresses bound to the local host.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

/// Set of addresses bound to any local interface, split by IP version.
///
/// Built once at startup and only read afterwards, so it is shared between
/// capture workers behind a plain `Arc`.
#[derive(Debug, Clone, Default)]
pub struct LocalAddresses {
    v4: HashSet<IpAddr>,
    v6: HashSet<IpAddr>,
}

impl LocalAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(_) => self.v4.insert(ip),
            IpAddr::V6(_) => self.v6.insert(ip),
        };
    }

    /// Whether `ip` belongs to this host. Loopback addresses always do.
    pub fn is_local(&self, ip: &IpAddr) -> bool {
        if ip.is_loopback() {
            return true;
        }
        match ip {
            IpAddr::V4(_) => self.v4.contains(ip),
            IpAddr::V6(_) => self.v6.contains(ip),
        }
    }

    /// Addresses for one IP version (4 or 6).
    pub fn for_version(&self, version: u8) -> impl Iterator<Item = &IpAddr> {
        let set = if version == 6 { &self.v6 } else { &self.v4 };
        set.iter()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<IpAddr> for LocalAddresses {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        let mut addresses = LocalAddresses::new();
        for ip in iter {
            addresses.insert(ip);
        }
        addresses
    }
}

impl fmt::Display for LocalAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut all: Vec<String> = self
            .v4
            .iter()
            .chain(self.v6.iter())
            .map(|ip| ip.to_string())
            .collect();
        all.sort();
        write!(f, "{}", all.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_lookup_by_family() {
        let addrs: LocalAddresses = ["10.0.0.5", "fe80::1"]
            .iter()
            .map(|s| s.parse::<IpAddr>().unwrap())
            .collect();

        assert!(addrs.is_local(&"10.0.0.5".parse().unwrap()));
        assert!(addrs.is_local(&"fe80::1".parse().unwrap()));
        assert!(!addrs.is_local(&"203.0.113.5".parse().unwrap()));
        assert_eq!(addrs.for_version(4).count(), 1);
        assert_eq!(addrs.for_version(6).count(), 1);
    }

    #[test]
    fn test_loopback_is_always_local() {
        let addrs = LocalAddresses::new();
        assert!(addrs.is_local(&"127.0.0.53".parse().unwrap()));
        assert!(addrs.is_local(&"::1".parse().unwrap()));
        assert!(addrs.is_empty());
    }
}
