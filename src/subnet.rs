use crate::addr::{max_addr, net_prefix, Addr, NetPrefix, PrefixSet};
use crate::config::Cfg;
use crate::graph::Topology;
use crate::ttl::TtlVec;
use crate::MAX_DISTANCE;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Key of a candidate subnet: its prefix and length.
pub type SubnetKey = (Addr, u8);

/// An inferred candidate subnet over a contiguous range of the named
/// interface table.
pub struct InfSubnet {
    prefix: Addr,
    /// Prefix length.
    pub len: u8,
    /// Could still be a point-to-point link (starts true for /30 and /31,
    /// cleared when a larger subnet subsumes it).
    pub point_to_point: bool,
    /// Served as the anchor of an alias inference.
    pub used_right: bool,
    /// Served as the neighbor subnet of an alias inference.
    pub used_left: bool,
    /// Address of the subnet's first observed member.
    pub begin: Addr,
    /// Total trace appearances over the members.
    pub n_traces: u32,
    /// Fraction of usable host addresses observed.
    pub completeness: f32,
}

impl InfSubnet {
    fn new(begin: Addr, len: u8, completeness: f32) -> InfSubnet {
        InfSubnet {
            prefix: net_prefix(begin, len),
            len,
            point_to_point: len >= 30,
            used_right: false,
            used_left: false,
            begin,
            n_traces: 0,
            completeness,
        }
    }

    /// The subnet prefix.
    pub fn addr(&self) -> Addr {
        self.prefix
    }

    /// Lookup key.
    pub fn key(&self) -> SubnetKey {
        (self.prefix, self.len)
    }

    /// True when `addr` falls inside the prefix.
    pub fn contains(&self, addr: Addr) -> bool {
        net_prefix(addr, self.len) == self.prefix
    }

    /// The observed member addresses, in order.
    pub fn members(&self, topo: &Topology) -> Vec<Addr> {
        topo.ifaces
            .named
            .range(self.begin..)
            .map(|(a, _)| *a)
            .take_while(|a| self.contains(*a))
            .collect()
    }

    /// The last observed member.
    pub fn last(&self, topo: &Topology) -> Addr {
        *self.members(topo).last().expect("subnet has members")
    }
}

/// Orders two candidate subnets by reliability, best first.
pub fn rank_less(a: &InfSubnet, b: &InfSubnet, s30_beats_s31: bool) -> bool {
    if a.len == 31 && b.len == 31 {
        // both /31, both completeness 1.0
        if a.n_traces != b.n_traces {
            a.n_traces > b.n_traces
        } else {
            a.addr() < b.addr()
        }
    } else if a.len < 31 && b.len < 31 {
        if a.completeness != b.completeness {
            a.completeness > b.completeness
        } else if a.n_traces != b.n_traces {
            a.n_traces > b.n_traces
        } else if a.len != b.len {
            a.len > b.len
        } else {
            a.addr() < b.addr()
        }
    } else if s30_beats_s31 && (a.len == 30 || b.len == 30) {
        a.len == 30
    } else {
        a.len > b.len
    }
}

fn rank_cmp(a: &InfSubnet, b: &InfSubnet, s30_beats_s31: bool) -> Ordering {
    if rank_less(a, b, s30_beats_s31) {
        Ordering::Less
    } else if rank_less(b, a, s30_beats_s31) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// The candidate subnets found by inference, addressable by (prefix, len)
/// and iterable in rank order.
#[derive(Default)]
pub struct SubnetSet {
    map: BTreeMap<SubnetKey, InfSubnet>,
    ranked: Vec<SubnetKey>,
}

impl SubnetSet {
    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no candidate was found.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Candidate by key.
    pub fn get(&self, key: SubnetKey) -> &InfSubnet {
        &self.map[&key]
    }

    /// Mutable candidate by key.
    pub fn get_mut(&mut self, key: SubnetKey) -> &mut InfSubnet {
        self.map.get_mut(&key).expect("subnet key")
    }

    /// Keys in rank order, best first.
    pub fn ranked(&self) -> &[SubnetKey] {
        &self.ranked
    }

    /// Marks every subnet nested inside `key` as non-point-to-point.
    pub fn mark_non_p2p(&mut self, cfg: &Cfg, key: SubnetKey) {
        if !cfg.mark_non_p2p {
            return;
        }
        let maxaddr = max_addr(key.0, key.1);
        let doomed: Vec<SubnetKey> = self
            .map
            .range(key..)
            .map(|(k, _)| *k)
            .take_while(|k| k.0 < maxaddr)
            .collect();
        for k in doomed {
            self.map.get_mut(&k).expect("subnet key").point_to_point = false;
        }
    }

    /// Finds the smallest candidate containing both `a` and `b` whose
    /// prefix is at least `min_len` long and which is not ranked below the
    /// anchor. Walks the candidate map downward from the longest possible
    /// prefix.
    pub fn common_subnet(
        &self,
        cfg: &Cfg,
        a: Addr,
        b: Addr,
        len: u8,
        min_len: u8,
        anchor: SubnetKey,
    ) -> Option<SubnetKey> {
        let start_key = (net_prefix(a, len), len);
        let min_addr = net_prefix(a, min_len);
        let mut cur = match self.map.range(start_key..).next() {
            Some((k, _)) => *k,
            None => *self.map.keys().next_back()?,
        };
        loop {
            if cur.0 >= min_addr {
                let s = &self.map[&cur];
                if s.contains(a) && s.contains(b) {
                    let anchor_s = &self.map[&anchor];
                    if cfg.subnet_len && s.len < anchor_s.len {
                        // larger than the anchor allows
                    } else if !cfg.bug_rank
                        && cfg.subnet_rank
                        && rank_less(anchor_s, s, cfg.s30_beats_s31)
                    {
                        // ranked worse than the anchor
                    } else if cfg.bug_rank && cfg.subnet_rank && anchor < cur {
                        // historical comparison by map order
                    } else {
                        return Some(cur);
                    }
                }
            } else {
                return None;
            }
            cur = *self.map.range(..cur).next_back().map(|(k, _)| k)?;
        }
    }
}

/// Verifies a candidate range starting at the first named interface at or
/// after `begin`: the accuracy condition against the bad-subnet set, the
/// TTL distance condition, and the known-alias exclusion.
pub fn verify_subnet(
    topo: &Topology,
    cfg: &Cfg,
    bad_subnets: Option<&PrefixSet>,
    begin: Addr,
    len: u8,
) -> bool {
    // accuracy: two members appeared as non-neighbors in one trace
    if let Some(bad) = bad_subnets {
        if bad.contains_exact(&NetPrefix::new(begin, len)) {
            return false;
        }
    }

    let maxaddr = max_addr(begin, len);

    // distance: the union of member TTL ranges must stay within
    // MAX_DISTANCE per vantage point
    if cfg.ttl_beats_subnet && cfg.n_ttls > 0 {
        let n = cfg.n_ttls;
        let mut subnet_min = TtlVec::new();
        let mut subnet_max = TtlVec::new();
        for (&addr, _) in topo
            .ifaces
            .named
            .range(begin..)
            .take_while(|(a, _)| **a < maxaddr)
        {
            let (iface_min, iface_max) = topo.ttl_arrays(addr);
            if iface_min.is_empty() {
                continue;
            }
            for i in 0..n {
                if !iface_min.is_valid(n, i) {
                    continue;
                }
                if iface_min.get(n, i) < subnet_min.get_or(n, i, 256, 257) {
                    subnet_min.set(n, i, iface_min.get(n, i) as u8);
                }
                if iface_max.get(n, i) > subnet_max.get_or(n, i, -1, -2) {
                    subnet_max.set(n, i, iface_max.get(n, i) as u8);
                }
                if subnet_max.get(n, i) - subnet_min.get(n, i) > MAX_DISTANCE {
                    return false;
                }
            }
        }
    }

    // two interfaces already known as aliases can't share a subnet
    let members: Vec<Addr> = topo
        .ifaces
        .named
        .range(begin..)
        .map(|(a, _)| *a)
        .take_while(|a| *a < maxaddr)
        .collect();
    for (i, &a) in members.iter().enumerate().skip(1) {
        for &b in &members[..i] {
            if topo.are_known_aliases(a, b) {
                return false;
            }
        }
    }

    true
}

/// Recursively finds all maximal candidate ranges over the sorted address
/// snapshot, applying the completeness and middle-address conditions and
/// verifying each accepted range.
#[allow(clippy::too_many_arguments)]
fn find_smaller_subnets(
    topo: &Topology,
    cfg: &Cfg,
    bad_subnets: &PrefixSet,
    addrs: &[Addr],
    len: u8,
    out: &mut BTreeMap<SubnetKey, InfSubnet>,
    missing_mids: &mut Vec<Addr>,
) {
    let mut i = 0;
    while i < addrs.len() {
        // find the run of addresses sharing a /len prefix with addrs[i]
        let maxaddr = max_addr(addrs[i], len);
        let mut j = i + 1;
        while j < addrs.len() && addrs[j] <= maxaddr {
            j += 1;
        }
        let n = j - i;
        if n > 1 {
            // the subnet may be longer than the common prefix when a
            // broadcast address would otherwise be a member
            let sublen = crate::addr::max_subnet_len(addrs[i], addrs[j - 1]);
            let prefix = net_prefix(addrs[i], sublen);
            if sublen >= len {
                let completeness;
                let mut good = true;
                if sublen < 30 {
                    let usable = (1u64 << (32 - u32::from(sublen))) - 2;
                    completeness = n as f32 / usable as f32;
                    good = completeness >= cfg.min_completeness;
                } else {
                    completeness = 1.0;
                }

                if good && sublen < 30 && sublen >= cfg.min_subnet_middle_required {
                    // require one of the two central addresses
                    let mid1 = max_addr(prefix, sublen + 1);
                    let mid2 = Addr(mid1.0 + 1);
                    good = addrs[i..j]
                        .iter()
                        .take_while(|a| **a <= mid2)
                        .any(|a| *a == mid1 || *a == mid2);
                    if !good && cfg.mode_extract {
                        missing_mids.push(mid1);
                        missing_mids.push(mid2);
                    }
                }

                if good && verify_subnet(topo, cfg, Some(bad_subnets), addrs[i], sublen) {
                    out.insert(
                        (prefix, sublen),
                        InfSubnet::new(addrs[i], sublen, completeness),
                    );
                }
            }
            if n > 2 {
                // the run might contain smaller subnets
                find_smaller_subnets(
                    topo,
                    cfg,
                    bad_subnets,
                    &addrs[i..j],
                    sublen.max(len) + 1,
                    out,
                    missing_mids,
                );
            }
        }
        i = j;
    }
}

/// Runs subnet inference over the whole named interface table, counts
/// member traces, and ranks the candidates. `missing_mids` collects the
/// absent central addresses in extraction mode.
pub fn find_subnets(
    topo: &Topology,
    cfg: &Cfg,
    bad_subnets: &PrefixSet,
    missing_mids: &mut Vec<Addr>,
) -> SubnetSet {
    let addrs: Vec<Addr> = topo.ifaces.named.keys().cloned().collect();
    let mut map = BTreeMap::new();
    find_smaller_subnets(
        topo,
        cfg,
        bad_subnets,
        &addrs,
        cfg.min_subnet_len,
        &mut map,
        missing_mids,
    );

    for subnet in map.values_mut() {
        subnet.n_traces = topo
            .ifaces
            .named
            .range(subnet.begin..)
            .take_while(|(a, _)| subnet.contains(**a))
            .map(|(_, iface)| iface.core.traces.len())
            .sum();
    }

    let mut ranked: Vec<SubnetKey> = map.keys().cloned().collect();
    ranked.sort_by(|a, b| rank_cmp(&map[a], &map[b], cfg.s30_beats_s31));

    SubnetSet { map, ranked }
}
