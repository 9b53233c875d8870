use crate::addr::{Addr, ANON_NETMASK, ANON_PREFIX};
use crate::idset::CompactIdSet;
use crate::seg::{Seg1Vec, Seg2Vec};
use crate::ttl::TtlVec;
use std::collections::BTreeMap;
use std::io::{Error, ErrorKind};

/// State common to named and anonymous interfaces.
///
/// Interfaces reference their node and link by id (0 = none), never by
/// pointer, so graph merges cannot dangle.
#[derive(Default)]
pub struct IfaceCore {
    /// The interface's address (immutable after creation).
    pub addr: Addr,
    /// Id of the node (router) this interface belongs to, or 0.
    pub node_id: u32,
    /// Id of the link this interface belongs to, or 0.
    pub link_id: u32,
    /// Appeared as a transit hop in some trace.
    pub seen_as_transit: bool,
    /// Appeared as the destination hop in some trace.
    pub seen_as_dest: bool,
    /// Ids of the traces in which this interface appeared.
    pub traces: CompactIdSet,
}

impl IfaceCore {
    fn new(addr: Addr) -> IfaceCore {
        IfaceCore {
            addr,
            ..IfaceCore::default()
        }
    }
}

/// An interface with a known routable address.
pub struct NamedIface {
    /// Common interface state.
    pub core: IfaceCore,
    /// Observed (previous hop, pre-previous hop) segments.
    pub prev: Seg2Vec,
    /// Observed next hops.
    pub next: Seg1Vec,
    /// TTLs observed from each vantage point.
    pub ttl: TtlVec,
    /// Appeared in a loaded alias file.
    pub pre_aliased: bool,
}

impl NamedIface {
    /// Creates an interface for `addr` with empty adjacency.
    pub fn new(addr: Addr) -> NamedIface {
        NamedIface {
            core: IfaceCore::new(addr),
            prev: Seg2Vec::new(),
            next: Seg1Vec::new(),
            ttl: TtlVec::new(),
            pre_aliased: false,
        }
    }
}

/// An interface synthesized for a non-responding hop, identified by an
/// address in the reserved anonymous block.
pub struct AnonIface {
    /// Common interface state.
    pub core: IfaceCore,
    /// Observed previous hops.
    pub prev: Seg1Vec,
    /// Address of an equivalent interface, filled in after link completion
    /// (zero when this interface stands on its own).
    pub redundant: Addr,
}

impl AnonIface {
    fn new(addr: Addr) -> AnonIface {
        AnonIface {
            core: IfaceCore::new(addr),
            prev: Seg1Vec::new(),
            redundant: Addr::ZERO,
        }
    }
}

/// The interface tables: named interfaces keyed by address, anonymous
/// interfaces indexed by their synthetic address, and the shared dummy
/// placeholder used for hops that never get their own identity.
pub struct IfaceTable {
    /// Named interfaces in address order.
    pub named: BTreeMap<Addr, NamedIface>,
    /// Anonymous interfaces; index = low address bits - 1.
    pub anon: Vec<AnonIface>,
    /// The dummy anonymous interface (address 0).
    pub dummy: AnonIface,
}

impl Default for IfaceTable {
    fn default() -> IfaceTable {
        IfaceTable {
            named: BTreeMap::new(),
            anon: Vec::new(),
            dummy: AnonIface::new(Addr::ZERO),
        }
    }
}

fn anon_index(addr: Addr) -> usize {
    ((addr.0 & !ANON_NETMASK) - 1) as usize
}

impl IfaceTable {
    /// Creates empty tables.
    pub fn new() -> IfaceTable {
        IfaceTable::default()
    }

    /// Looks up a named interface.
    pub fn named(&self, addr: Addr) -> Option<&NamedIface> {
        self.named.get(&addr)
    }

    /// Looks up a named interface for mutation.
    pub fn named_mut(&mut self, addr: Addr) -> Option<&mut NamedIface> {
        self.named.get_mut(&addr)
    }

    /// Returns the named interface for `addr`, inserting a fresh one if it
    /// was never seen.
    pub fn find_or_insert_named(&mut self, addr: Addr) -> &mut NamedIface {
        debug_assert!(addr.is_named());
        self.named.entry(addr).or_insert_with(|| NamedIface::new(addr))
    }

    /// Looks up the anonymous interface owning a synthetic address.
    pub fn anon(&self, addr: Addr) -> &AnonIface {
        if addr == Addr::ZERO {
            &self.dummy
        } else {
            &self.anon[anon_index(addr)]
        }
    }

    /// Looks up an anonymous interface for mutation.
    pub fn anon_mut(&mut self, addr: Addr) -> &mut AnonIface {
        if addr == Addr::ZERO {
            &mut self.dummy
        } else {
            &mut self.anon[anon_index(addr)]
        }
    }

    /// Allocates a fresh anonymous interface with the next synthetic
    /// address. Fails when the reserved block is exhausted.
    pub fn new_anon(&mut self) -> Result<Addr, Error> {
        let id = self.anon.len() as u32 + 1;
        if id & ANON_NETMASK != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                format!("too many anonymous hops ({})", id),
            ));
        }
        let addr = Addr(ANON_PREFIX | id);
        self.anon.push(AnonIface::new(addr));
        Ok(addr)
    }

    /// Common state of the interface at `addr`, whichever table owns it.
    ///
    /// Panics when no interface exists for a named `addr`; ingestion
    /// guarantees every recorded hop address has one.
    pub fn core(&self, addr: Addr) -> &IfaceCore {
        if addr.is_anon() {
            &self.anon(addr).core
        } else {
            match self.named.get(&addr) {
                Some(iface) => &iface.core,
                None => panic!("no interface for {}", addr),
            }
        }
    }

    /// Mutable common state of the interface at `addr`.
    pub fn core_mut(&mut self, addr: Addr) -> &mut IfaceCore {
        if addr.is_anon() {
            &mut self.anon_mut(addr).core
        } else {
            match self.named.get_mut(&addr) {
                Some(iface) => &mut iface.core,
                None => panic!("no interface for {}", addr),
            }
        }
    }

    /// Number of unique anonymous interfaces allocated so far.
    pub fn anon_count(&self) -> u32 {
        self.anon.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_or_insert_is_idempotent() {
        let mut t = IfaceTable::new();
        let a = Addr::new(10, 0, 0, 1);
        t.find_or_insert_named(a).core.seen_as_transit = true;
        t.find_or_insert_named(a);
        assert_eq!(t.named.len(), 1);
        assert!(t.named(a).unwrap().core.seen_as_transit);
    }

    #[test]
    fn test_anon_allocation_sequence() {
        let mut t = IfaceTable::new();
        let a1 = t.new_anon().unwrap();
        let a2 = t.new_anon().unwrap();
        assert_eq!(a1, Addr(ANON_PREFIX | 1));
        assert_eq!(a2, Addr(ANON_PREFIX | 2));
        assert!(a1.is_anon());
        assert_eq!(t.anon(a1).core.addr, a1);
        assert_eq!(t.anon_count(), 2);
    }

    #[test]
    fn test_dummy_dispatch() {
        let mut t = IfaceTable::new();
        assert_eq!(t.core(Addr::ZERO).addr, Addr::ZERO);
        t.core_mut(Addr::ZERO).seen_as_transit = true;
        assert!(t.dummy.core.seen_as_transit);
    }
}
