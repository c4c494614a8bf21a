//! Connection-time address allow-list.
//!
//! Checked once per accepted connection, before the hello is written.
//! Replaced wholesale by the `acl` control command; there is no
//! incremental editing.

use std::net::IpAddr;

/// An allow-list of client addresses.
#[derive(Debug, Clone, Default)]
pub struct AclList {
    entries: Vec<IpAddr>,
    default_deny: bool,
}

impl AclList {
    pub fn new(default_deny: bool) -> Self {
        Self {
            entries: Vec::new(),
            default_deny,
        }
    }

    /// Parse a list of address strings.
    ///
    /// Returns the offending entry on failure so the control channel can
    /// name it in the error reply.
    pub fn parse<'a, I>(specs: I, default_deny: bool) -> Result<Self, &'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = Vec::new();
        for spec in specs {
            let addr: IpAddr = spec.parse().map_err(|_| spec)?;
            entries.push(addr);
        }
        Ok(Self {
            entries,
            default_deny,
        })
    }

    /// Whether a peer at `addr` may connect.
    ///
    /// An empty list admits everyone unless `default_deny` is set.
    pub fn allows(&self, addr: IpAddr) -> bool {
        if self.entries.is_empty() {
            return !self.default_deny;
        }
        self.entries.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_list_admits_all_by_default() {
        let acl = AclList::new(false);
        assert!(acl.allows(ip("10.0.0.1")));
    }

    #[test]
    fn empty_list_with_default_deny_refuses() {
        let acl = AclList::new(true);
        assert!(!acl.allows(ip("10.0.0.1")));
    }

    #[test]
    fn listed_addresses_are_admitted() {
        let acl = AclList::parse(["127.0.0.1", "::1"], true).unwrap();
        assert!(acl.allows(ip("127.0.0.1")));
        assert!(acl.allows(ip("::1")));
        assert!(!acl.allows(ip("10.0.0.1")));
    }

    #[test]
    fn bad_spec_names_the_entry() {
        let err = AclList::parse(["127.0.0.1", "not-an-ip"], false).unwrap_err();
        assert_eq!(err, "not-an-ip");
    }
}
