//! IP reputation: blocklist ranges and the lookup contract.
//!
//! Blocklists cover IPv4 only; while any list is installed, non-IPv4 peers
//! are treated as blocked rather than silently exempted.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// An inclusive IPv4 range with a human-readable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    pub description: String,
}

impl IpRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.first <= ip && ip <= self.last
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} ({})", self.first, self.last, self.description)
    }
}

/// The lookup contract the client consults for every candidate address.
pub trait Ranger: Send + Sync {
    /// The range containing `ip`, if any list entry blocks it.
    fn lookup(&self, ip: Ipv4Addr) -> Option<IpRange>;
}

/// A sorted, non-overlapping list of blocked ranges.
pub struct RangeList {
    ranges: Vec<IpRange>,
}

impl RangeList {
    /// Builds a list; ranges are sorted by first address.
    pub fn new(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort_by_key(|r| r.first);
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl Ranger for RangeList {
    fn lookup(&self, ip: Ipv4Addr) -> Option<IpRange> {
        let idx = self.ranges.partition_point(|r| r.first <= ip);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        candidate.contains(ip).then(|| candidate.clone())
    }
}

/// The synthetic range reported for non-IPv4 peers while a list is active.
pub fn non_ipv4_range() -> IpRange {
    IpRange {
        first: Ipv4Addr::UNSPECIFIED,
        last: Ipv4Addr::UNSPECIFIED,
        description: "non-IPv4 address".into(),
    }
}

/// Applies a ranger to any address family: non-IPv4 is blocked whenever a
/// list is configured.
pub fn lookup_any(ranger: &dyn Ranger, ip: IpAddr) -> Option<IpRange> {
    match ip {
        IpAddr::V4(v4) => ranger.lookup(v4),
        IpAddr::V6(_) => Some(non_ipv4_range()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(first: [u8; 4], last: [u8; 4], what: &str) -> IpRange {
        IpRange {
            first: first.into(),
            last: last.into(),
            description: what.into(),
        }
    }

    #[test]
    fn lookup_finds_containing_range() {
        let list = RangeList::new(vec![
            range([10, 0, 0, 0], [10, 255, 255, 255], "ten-net"),
            range([192, 168, 0, 0], [192, 168, 255, 255], "rfc1918"),
        ]);
        assert_eq!(
            list.lookup([10, 3, 4, 5].into()).unwrap().description,
            "ten-net"
        );
        assert_eq!(
            list.lookup([192, 168, 1, 1].into()).unwrap().description,
            "rfc1918"
        );
        assert!(list.lookup([8, 8, 8, 8].into()).is_none());
        assert!(list.lookup([11, 0, 0, 0].into()).is_none());
    }

    #[test]
    fn boundaries_are_inclusive() {
        let list = RangeList::new(vec![range([1, 0, 0, 0], [1, 0, 0, 9], "x")]);
        assert!(list.lookup([1, 0, 0, 0].into()).is_some());
        assert!(list.lookup([1, 0, 0, 9].into()).is_some());
        assert!(list.lookup([1, 0, 0, 10].into()).is_none());
    }

    #[test]
    fn ipv6_is_blocked_when_list_present() {
        let list = RangeList::new(vec![]);
        let blocked = lookup_any(&list, "::1".parse().unwrap());
        assert_eq!(blocked.unwrap().description, "non-IPv4 address");
        assert!(lookup_any(&list, "8.8.8.8".parse().unwrap()).is_none());
    }
}
