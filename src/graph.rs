use crate::addr::Addr;
use crate::config::Cfg;
use crate::iface::IfaceTable;
use crate::ttl::TtlVec;
use crate::MAX_DISTANCE;
use std::collections::BTreeMap;

/// An alias set: a router and the interfaces known to belong to it.
#[derive(Default)]
pub struct Node {
    /// Interfaces belonging to this node.
    pub ifaces: Vec<Addr>,
    /// Per-vantage minimum TTL over the node's interfaces.
    pub min_ttl: TtlVec,
    /// Per-vantage maximum TTL over the node's interfaces.
    pub max_ttl: TtlVec,
}

/// A link: the set of interfaces sharing a layer-2 medium, plus nodes known
/// to be on the link without a specific interface.
#[derive(Default)]
pub struct Link {
    /// Explicit member interfaces.
    pub ifaces: Vec<Addr>,
    /// Ids of nodes with an implicit interface on this link.
    pub nodes: Vec<u32>,
}

/// Nodes indexed by monotonically assigned id.
pub struct NodeSet {
    map: BTreeMap<u32, Node>,
    next_id: u32,
}

impl Default for NodeSet {
    fn default() -> NodeSet {
        NodeSet {
            map: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl NodeSet {
    /// Inserts an empty node and returns its id.
    pub fn add(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, Node::default());
        id
    }

    /// Node by id.
    pub fn get(&self, id: u32) -> &Node {
        &self.map[&id]
    }

    /// Mutable node by id.
    pub fn get_mut(&mut self, id: u32) -> &mut Node {
        self.map.get_mut(&id).expect("node id")
    }

    fn remove(&mut self, id: u32) -> Node {
        self.map.remove(&id).expect("node id")
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no node exists.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Highest id handed out so far.
    pub fn max_id(&self) -> u32 {
        self.next_id - 1
    }

    /// Iterates nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Node)> {
        self.map.iter()
    }
}

/// Links indexed by monotonically assigned id.
pub struct LinkSet {
    map: BTreeMap<u32, Link>,
    next_id: u32,
}

impl Default for LinkSet {
    fn default() -> LinkSet {
        LinkSet {
            map: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl LinkSet {
    /// Inserts an empty link and returns its id.
    pub fn add(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, Link::default());
        id
    }

    /// Link by id.
    pub fn get(&self, id: u32) -> &Link {
        &self.map[&id]
    }

    /// Mutable link by id.
    pub fn get_mut(&mut self, id: u32) -> &mut Link {
        self.map.get_mut(&id).expect("link id")
    }

    fn remove(&mut self, id: u32) -> Link {
        self.map.remove(&id).expect("link id")
    }

    /// Number of live links.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no link exists.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Highest id handed out so far.
    pub fn max_id(&self) -> u32 {
        self.next_id - 1
    }

    /// Iterates links in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Link)> {
        self.map.iter()
    }
}

/// Interface counts for the node table.
#[derive(Default, Debug, PartialEq)]
pub struct NodeStats {
    /// Total member interfaces.
    pub n_ifaces: u32,
    /// Anonymous members kept in the output.
    pub n_anon: u32,
    /// Anonymous members marked redundant.
    pub n_redundant: u32,
    /// Named members.
    pub n_named: u32,
}

/// Interface counts for the link table.
#[derive(Default, Debug, PartialEq)]
pub struct LinkStats {
    /// Total members, counting implicit node slots.
    pub n_ifaces: u32,
    /// Implicit node slots.
    pub n_implicit: u32,
    /// Anonymous members kept in the output.
    pub n_anon: u32,
    /// Anonymous members marked redundant.
    pub n_redundant: u32,
    /// Named members.
    pub n_named: u32,
}

/// The mutable inference state: interface tables plus the node and link
/// sets, with the alias/link merge operations that maintain their
/// back-pointer invariants.
#[derive(Default)]
pub struct Topology {
    /// Interface tables.
    pub ifaces: IfaceTable,
    /// Alias sets.
    pub nodes: NodeSet,
    /// Links.
    pub links: LinkSet,
    /// Semantic-consistency warnings produced by merges, drained into the
    /// log file by the driver.
    pub warnings: Vec<String>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Topology {
        Topology::default()
    }

    /// True when the two addresses are known to belong to one router.
    pub fn are_known_aliases(&self, a: Addr, b: Addr) -> bool {
        if a == b {
            return true;
        }
        let an = self.ifaces.core(a).node_id;
        an != 0 && an == self.ifaces.core(b).node_id
    }

    /// True when `b` equals `a` or any member of `a`'s alias set. Does not
    /// require an interface to exist for `b`.
    pub fn known_alias_of(&self, a: Addr, b: Addr) -> bool {
        if self.ifaces.core(a).addr == b {
            return true;
        }
        let node_id = self.ifaces.core(a).node_id;
        node_id != 0 && self.nodes.get(node_id).ifaces.contains(&b)
    }

    fn members_of<'a>(&'a self, x: Addr, hold: &'a [Addr; 1]) -> &'a [Addr] {
        let node_id = self.ifaces.core(x).node_id;
        if node_id != 0 {
            &self.nodes.get(node_id).ifaces
        } else {
            hold
        }
    }

    /// The no-loop condition: false when any member of `a`'s alias set
    /// shares a trace with any member of `b`'s alias set.
    pub fn alias_no_loop(&self, a: Addr, b: Addr) -> bool {
        let a_hold = [a];
        let b_hold = [b];
        for &ai in self.members_of(a, &a_hold) {
            for &bi in self.members_of(b, &b_hold) {
                let at = &self.ifaces.core(ai).traces;
                let bt = &self.ifaces.core(bi).traces;
                if at.overlaps(bt) {
                    return false;
                }
            }
        }
        true
    }

    /// Min/max TTL arrays covering `addr`: its node's merged arrays when it
    /// has a node, else its own.
    pub fn ttl_arrays(&self, addr: Addr) -> (&TtlVec, &TtlVec) {
        let core = self.ifaces.core(addr);
        if core.node_id != 0 {
            let node = self.nodes.get(core.node_id);
            (&node.min_ttl, &node.max_ttl)
        } else {
            match self.ifaces.named(addr) {
                Some(iface) => (&iface.ttl, &iface.ttl),
                None => panic!("no interface for {}", addr),
            }
        }
    }

    /// The distance condition for an alias candidate: false when combining
    /// the TTL ranges of `a` and `b` would span more than MAX_DISTANCE while
    /// exceeding both constituent spans.
    pub fn alias_distance_ok(&self, n_ttls: usize, a: Addr, b: Addr) -> bool {
        if n_ttls == 0 || a.is_anon() || b.is_anon() {
            return true;
        }
        let (a_min, a_max) = self.ttl_arrays(a);
        let (b_min, b_max) = self.ttl_arrays(b);
        if a_min.is_empty() || b_min.is_empty() {
            return true;
        }
        // Loaded alias files may have created nodes whose range already
        // exceeds MAX_DISTANCE; new candidates are allowed anywhere inside
        // that range.
        for i in 0..n_ttls {
            if !a_min.is_valid(n_ttls, i) || !b_min.is_valid(n_ttls, i) {
                continue;
            }
            let a_dist = a_max.get(n_ttls, i) - a_min.get(n_ttls, i);
            let b_dist = b_max.get(n_ttls, i) - b_min.get(n_ttls, i);
            let combo_max = a_max.get(n_ttls, i).max(b_max.get(n_ttls, i));
            let combo_min = a_min.get(n_ttls, i).min(b_min.get(n_ttls, i));
            let combo_dist = combo_max - combo_min;
            if combo_dist > MAX_DISTANCE && combo_dist > a_dist && combo_dist > b_dist {
                return false;
            }
        }
        true
    }

    /// Attaches an interface to a node, merging its TTLs into the node's
    /// min/max arrays.
    pub fn add_iface_to_node(&mut self, n_ttls: usize, node_id: u32, addr: Addr) {
        self.nodes.get_mut(node_id).ifaces.push(addr);
        self.ifaces.core_mut(addr).node_id = node_id;
        if addr.is_anon() {
            return;
        }
        let ttl = match self.ifaces.named_mut(addr) {
            Some(iface) => iface.ttl.take(),
            None => return,
        };
        if ttl.is_empty() {
            return;
        }
        let node = self.nodes.get_mut(node_id);
        if !node.min_ttl.is_empty() {
            node.min_ttl.merge_min(n_ttls, &ttl);
            node.max_ttl.merge_max(n_ttls, &ttl);
        } else {
            node.max_ttl = ttl.duplicate();
            node.min_ttl = ttl;
        }
    }

    /// Records that `a` and `b` are aliases, creating or merging nodes as
    /// needed. A repeated call with either order is a no-op.
    pub fn set_alias(&mut self, cfg: &Cfg, a: Addr, b: Addr) {
        if a == b {
            return;
        }
        let an = self.ifaces.core(a).node_id;
        let bn = self.ifaces.core(b).node_id;
        if an != 0 && bn != 0 {
            if an == bn {
                return;
            }
            // merge the smaller node into the larger
            let (keep_id, dead_id) =
                if self.nodes.get(an).ifaces.len() >= self.nodes.get(bn).ifaces.len() {
                    (an, bn)
                } else {
                    (bn, an)
                };
            for &i in &self.nodes.get(dead_id).ifaces {
                for &j in &self.nodes.get(keep_id).ifaces {
                    if !cfg.anon_shared_nodelink && (i.is_anon() || j.is_anon()) {
                        continue;
                    }
                    let il = self.ifaces.core(i).link_id;
                    if il != 0 && il == self.ifaces.core(j).link_id {
                        self.warnings.push(format!(
                            "WARNING: merging nodes N{} and N{} with shared link L{} ({}, {})",
                            keep_id, dead_id, il, i, j
                        ));
                    }
                }
            }
            let dead = self.nodes.remove(dead_id);
            for &i in &dead.ifaces {
                self.ifaces.core_mut(i).node_id = keep_id;
            }
            let keep = self.nodes.get_mut(keep_id);
            keep.ifaces.extend_from_slice(&dead.ifaces);
            if !keep.min_ttl.is_empty() && !dead.min_ttl.is_empty() {
                keep.min_ttl.merge_min(cfg.n_ttls, &dead.min_ttl);
                keep.max_ttl.merge_max(cfg.n_ttls, &dead.max_ttl);
            } else if !dead.min_ttl.is_empty() {
                keep.min_ttl = dead.min_ttl;
                keep.max_ttl = dead.max_ttl;
            }
        } else if an != 0 {
            self.add_iface_to_node(cfg.n_ttls, an, b);
        } else if bn != 0 {
            self.add_iface_to_node(cfg.n_ttls, bn, a);
        } else {
            let id = self.nodes.add();
            self.add_iface_to_node(cfg.n_ttls, id, a);
            self.add_iface_to_node(cfg.n_ttls, id, b);
        }
    }

    /// Attaches an interface to a link.
    pub fn add_iface_to_link(&mut self, link_id: u32, addr: Addr) {
        self.links.get_mut(link_id).ifaces.push(addr);
        self.ifaces.core_mut(addr).link_id = link_id;
    }

    /// Records that `a` and `b` share a medium, creating or merging links
    /// as needed.
    pub fn set_link(&mut self, cfg: &Cfg, a: Addr, b: Addr) {
        if a == b {
            return;
        }
        let al = self.ifaces.core(a).link_id;
        let bl = self.ifaces.core(b).link_id;
        if al != 0 && bl != 0 {
            if al == bl {
                return;
            }
            let (keep_id, dead_id) =
                if self.links.get(al).ifaces.len() >= self.links.get(bl).ifaces.len() {
                    (al, bl)
                } else {
                    (bl, al)
                };
            for &i in &self.links.get(dead_id).ifaces {
                for &j in &self.links.get(keep_id).ifaces {
                    if !cfg.anon_shared_nodelink && (i.is_anon() || j.is_anon()) {
                        continue;
                    }
                    let inode = self.ifaces.core(i).node_id;
                    if inode != 0 && inode == self.ifaces.core(j).node_id {
                        self.warnings.push(format!(
                            "WARNING: merging links L{} and L{} with shared node N{} ({}, {})",
                            keep_id, dead_id, inode, i, j
                        ));
                    }
                }
            }
            let dead = self.links.remove(dead_id);
            for &i in &dead.ifaces {
                self.ifaces.core_mut(i).link_id = keep_id;
            }
            let keep = self.links.get_mut(keep_id);
            keep.ifaces.extend_from_slice(&dead.ifaces);
            keep.nodes.extend_from_slice(&dead.nodes);
        } else if al != 0 {
            self.add_iface_to_link(al, b);
        } else if bl != 0 {
            self.add_iface_to_link(bl, a);
        } else {
            let id = self.links.add();
            self.add_iface_to_link(id, a);
            self.add_iface_to_link(id, b);
        }
    }

    /// Puts an implicit interface for `node_id` on `a`'s link, creating the
    /// link when `a` has none.
    pub fn set_link_node(&mut self, a: Addr, node_id: u32) {
        let al = self.ifaces.core(a).link_id;
        if al != 0 {
            self.links.get_mut(al).nodes.push(node_id);
        } else {
            let id = self.links.add();
            self.add_iface_to_link(id, a);
            self.links.get_mut(id).nodes.push(node_id);
        }
    }

    fn is_redundant_anon(&self, addr: Addr) -> bool {
        addr.is_anon() && self.ifaces.anon(addr).redundant != Addr::ZERO
    }

    /// Counts node members by interface class.
    pub fn node_stats(&self) -> NodeStats {
        let mut s = NodeStats::default();
        for (_, node) in self.nodes.iter() {
            s.n_ifaces += node.ifaces.len() as u32;
            for &i in &node.ifaces {
                if i.is_named() {
                    s.n_named += 1;
                } else if self.is_redundant_anon(i) {
                    s.n_redundant += 1;
                } else {
                    s.n_anon += 1;
                }
            }
        }
        s
    }

    /// Counts link members by interface class.
    pub fn link_stats(&self) -> LinkStats {
        let mut s = LinkStats::default();
        for (_, link) in self.links.iter() {
            s.n_ifaces += (link.ifaces.len() + link.nodes.len()) as u32;
            s.n_implicit += link.nodes.len() as u32;
            for &i in &link.ifaces {
                if i.is_named() {
                    s.n_named += 1;
                } else if self.is_redundant_anon(i) {
                    s.n_redundant += 1;
                } else {
                    s.n_anon += 1;
                }
            }
        }
        s
    }
}
