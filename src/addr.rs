use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::io::{Error, ErrorKind};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// The multicast block from which synthetic anonymous addresses are taken.
pub const ANON_PREFIX: u32 = 0xE000_0000;

/// Prefix length of the anonymous address block.
pub const ANON_MASK_LEN: u8 = 4;

/// Netmask of the anonymous address block.
pub const ANON_NETMASK: u32 = 0xFFFF_FFFF << (32 - ANON_MASK_LEN as u32);

/// An IPv4 address in host byte order.
///
/// Ordering derived on the numeric value. Where hop ordering matters
/// (adjacency vectors, destination pairs), use [`Addr::class_cmp`], which
/// sorts anonymous addresses below named ones.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(pub u32);

impl Addr {
    /// The all-zeroes address, used as the dummy anonymous interface.
    pub const ZERO: Addr = Addr(0);

    /// Builds an address from four dotted-quad octets.
    pub fn new(a: u8, b: u8, c: u8, d: u8) -> Addr {
        Addr((u32::from(a) << 24) | (u32::from(b) << 16) | (u32::from(c) << 8) | u32::from(d))
    }

    /// True for the dummy address and for addresses in the reserved
    /// anonymous block.
    pub fn is_anon(self) -> bool {
        self.0 == 0 || (self.0 & ANON_NETMASK) == ANON_PREFIX
    }

    /// True for an address with a known routable value.
    pub fn is_named(self) -> bool {
        !self.is_anon()
    }

    /// Compares with anonymous addresses ordered below named ones, ties
    /// broken numerically.
    pub fn class_cmp(self, other: Addr) -> Ordering {
        match (self.is_anon(), other.is_anon()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.0.cmp(&other.0),
        }
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", Ipv4Addr::from(self.0))
    }
}

impl Debug for Addr {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", Ipv4Addr::from(self.0))
    }
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Addr, Error> {
        let ip: Ipv4Addr = s.parse().map_err(|_| {
            Error::new(
                ErrorKind::InvalidData,
                format!("invalid address \"{}\"", s),
            )
        })?;
        Ok(Addr(u32::from(ip)))
    }
}

fn netmask(len: u8) -> u32 {
    debug_assert!(len <= 32);
    if len == 0 {
        0
    } else {
        0xFFFF_FFFF << (32 - u32::from(len))
    }
}

/// Returns the `len`-bit prefix of `addr`.
pub fn net_prefix(addr: Addr, len: u8) -> Addr {
    Addr(addr.0 & netmask(len))
}

/// Returns the maximum address in the `addr/len` subnet (the broadcast
/// address for lengths below 31).
pub fn max_addr(addr: Addr, len: u8) -> Addr {
    Addr(addr.0 | !netmask(len))
}

/// Length of the longest common prefix of two addresses (32 when equal).
pub fn common_prefix_len(a: Addr, b: Addr) -> u8 {
    (a.0 ^ b.0).leading_zeros() as u8
}

/// True when the first `len` bits of the two addresses match.
pub fn same_prefix(a: Addr, b: Addr, len: u8) -> bool {
    len == 0 || ((a.0 ^ b.0) >> (32 - u32::from(len))) == 0
}

/// Finds the longest subnet prefix length that can hold both `a` and `b`:
/// the common prefix length, shortened while either address would be an
/// all-zeroes or all-ones host in the subnet.
pub fn max_subnet_len(a: Addr, b: Addr) -> u8 {
    let mut len = common_prefix_len(a, b);
    if len < 31 {
        let (mut lo, mut hi) = (a.0, b.0);
        if lo > hi {
            std::mem::swap(&mut lo, &mut hi);
        }
        // bump from x.111... to (x+1).000... so both checks look for zeroes
        hi = hi.wrapping_add(1);
        while len > 0 && ((lo << len) == 0 || (hi << len) == 0) {
            len -= 1;
        }
    }
    len
}

/// A network prefix: a masked address plus a prefix length.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct NetPrefix {
    /// Prefix bits; host bits are zero.
    pub addr: Addr,
    /// Prefix length in bits.
    pub len: u8,
}

impl NetPrefix {
    /// Builds a prefix, masking off the host bits of `addr`.
    pub fn new(addr: Addr, len: u8) -> NetPrefix {
        NetPrefix {
            addr: net_prefix(addr, len),
            len,
        }
    }

    /// Widens the prefix by one bit.
    pub fn enlarge(&mut self) {
        self.len -= 1;
        self.addr = net_prefix(self.addr, self.len);
    }

    /// True when `addr` falls inside this prefix.
    pub fn contains(&self, addr: Addr) -> bool {
        net_prefix(addr, self.len) == self.addr
    }
}

impl Ord for NetPrefix {
    fn cmp(&self, other: &NetPrefix) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.len.cmp(&other.len))
    }
}

impl PartialOrd for NetPrefix {
    fn partial_cmp(&self, other: &NetPrefix) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for NetPrefix {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl Debug for NetPrefix {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// An ordered set of network prefixes.
///
/// Used in two roles: as the bogon filter, where the set is kept
/// non-overlapping and membership means "some installed prefix covers this
/// address"; and as the bad-subnet recorder, where membership is exact.
#[derive(Default)]
pub struct PrefixSet {
    set: BTreeSet<NetPrefix>,
}

impl PrefixSet {
    /// Creates an empty set.
    pub fn new() -> PrefixSet {
        PrefixSet::default()
    }

    /// Number of prefixes in the set.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// True when the set holds no prefixes.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Inserts a prefix verbatim. Returns false when it was already present.
    pub fn insert(&mut self, prefix: NetPrefix) -> bool {
        self.set.insert(prefix)
    }

    /// Exact-match lookup, used by the subnet accuracy condition.
    pub fn contains_exact(&self, prefix: &NetPrefix) -> bool {
        self.set.contains(prefix)
    }

    /// True when some prefix in the set covers `addr`. Assumes the set only
    /// holds the largest prefixes (see [`PrefixSet::install`]).
    pub fn contains_addr(&self, addr: Addr) -> bool {
        let key = NetPrefix { addr, len: 32 };
        match self.set.range(..=key).next_back() {
            Some(p) => p.contains(addr),
            None => false,
        }
    }

    /// Installs a covering prefix: skipped when an existing prefix already
    /// covers it, and existing smaller prefixes inside it are removed.
    pub fn install(&mut self, addr: Addr, len: u8) {
        let key = NetPrefix::new(addr, len);
        if let Some(p) = self.set.range(..=NetPrefix { addr: key.addr, len: 32 }).next_back() {
            if p.contains(key.addr) && p.len <= key.len {
                return;
            }
        }
        let doomed: Vec<NetPrefix> = self
            .set
            .range(key..)
            .take_while(|p| key.contains(p.addr))
            .cloned()
            .collect();
        for p in doomed {
            self.set.remove(&p);
        }
        self.set.insert(key);
    }

    /// Installs the standard bogons: the RFC 5735 ranges plus the reserved
    /// block used for anonymous addresses.
    pub fn install_std_bogons(&mut self) {
        self.install(Addr::new(0, 0, 0, 0), 8); // this network (RFC1122)
        self.install(Addr::new(10, 0, 0, 0), 8); // private (RFC1918)
        self.install(Addr::new(127, 0, 0, 0), 8); // loopback (RFC1122)
        self.install(Addr::new(169, 254, 0, 0), 16); // link local (RFC3330)
        self.install(Addr::new(172, 16, 0, 0), 12); // private (RFC1918)
        self.install(Addr::new(192, 0, 0, 0), 24); // protocols (RFC5736)
        self.install(Addr::new(192, 0, 2, 0), 24); // TEST-NET-1 (RFC1166)
        self.install(Addr::new(192, 168, 0, 0), 16); // private (RFC1918)
        self.install(Addr::new(198, 18, 0, 0), 15); // benchmark (RFC2544)
        self.install(Addr::new(198, 51, 100, 0), 24); // TEST-NET-2 (RFC5737)
        self.install(Addr::new(203, 0, 113, 0), 24); // TEST-NET-3 (RFC5737)
        self.install(Addr::new(224, 0, 0, 0), 4); // multicast (RFC3171)
        self.install(Addr::new(240, 0, 0, 0), 4); // reserved (RFC1112)
    }

    /// Iterates the prefixes in address order.
    pub fn iter(&self) -> impl Iterator<Item = &NetPrefix> {
        self.set.iter()
    }

    /// Drops all prefixes and releases their storage.
    pub fn clear(&mut self) {
        self.set = BTreeSet::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_math() {
        let a = Addr::new(10, 1, 2, 200);
        assert_eq!(net_prefix(a, 24), Addr::new(10, 1, 2, 0));
        assert_eq!(max_addr(a, 24), Addr::new(10, 1, 2, 255));
        assert_eq!(net_prefix(a, 0), Addr::ZERO);
        assert_eq!(max_addr(a, 32), a);
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(
            common_prefix_len(Addr::new(10, 0, 0, 1), Addr::new(10, 0, 0, 2)),
            30
        );
        assert_eq!(
            common_prefix_len(Addr::new(10, 0, 0, 1), Addr::new(10, 0, 0, 1)),
            32
        );
        assert_eq!(
            common_prefix_len(Addr::new(10, 0, 0, 1), Addr::new(138, 0, 0, 1)),
            0
        );
    }

    #[test]
    fn test_max_subnet_len_excludes_broadcast() {
        // .1 and .2 fit in a /30
        assert_eq!(
            max_subnet_len(Addr::new(10, 0, 0, 1), Addr::new(10, 0, 0, 2)),
            30
        );
        // .1 and .3: .3 is the /30 broadcast, so only a /29 can hold both
        assert_eq!(
            max_subnet_len(Addr::new(10, 0, 0, 1), Addr::new(10, 0, 0, 3)),
            29
        );
        // .4 would be the /30 network address
        assert_eq!(
            max_subnet_len(Addr::new(10, 0, 0, 4), Addr::new(10, 0, 0, 6)),
            28
        );
        // a /31 pair is always allowed
        assert_eq!(
            max_subnet_len(Addr::new(10, 0, 0, 4), Addr::new(10, 0, 0, 5)),
            31
        );
    }

    #[test]
    fn test_anon_classification() {
        assert!(Addr::ZERO.is_anon());
        assert!(Addr(ANON_PREFIX | 1).is_anon());
        assert!(Addr::new(10, 0, 0, 1).is_named());
        assert_eq!(
            Addr(ANON_PREFIX | 1).class_cmp(Addr::new(10, 0, 0, 1)),
            Ordering::Less
        );
    }

    #[test]
    fn test_bogon_filter() {
        let mut set = PrefixSet::new();
        set.install_std_bogons();
        assert!(set.contains_addr(Addr::new(10, 1, 2, 3)));
        assert!(set.contains_addr(Addr::new(192, 168, 4, 4)));
        assert!(set.contains_addr(Addr(ANON_PREFIX | 77)));
        assert!(!set.contains_addr(Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_install_keeps_largest_prefix() {
        let mut set = PrefixSet::new();
        set.install(Addr::new(10, 1, 0, 0), 16);
        set.install(Addr::new(10, 0, 0, 0), 8); // evicts 10.1/16
        set.install(Addr::new(10, 2, 0, 0), 16); // contained, skipped
        assert_eq!(set.len(), 1);
        assert!(set.contains_addr(Addr::new(10, 200, 0, 1)));
    }

    #[test]
    fn test_exact_membership() {
        let mut set = PrefixSet::new();
        set.insert(NetPrefix::new(Addr::new(10, 0, 0, 0), 29));
        assert!(set.contains_exact(&NetPrefix::new(Addr::new(10, 0, 0, 1), 29)));
        assert!(!set.contains_exact(&NetPrefix::new(Addr::new(10, 0, 0, 1), 28)));
    }
}
