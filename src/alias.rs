use crate::addr::{max_subnet_len, net_prefix, same_prefix, Addr, PrefixSet};
use crate::config::Cfg;
use crate::graph::Topology;
use crate::seg::{Seg1, Seg2};
use crate::subnet::{verify_subnet, SubnetKey, SubnetSet};
use std::io::{Error, Write};

// Variable names follow the inference diagram:
//
//   A > B > C  (forward)
//     /   /
//   E < D      (reversed)
//
// (C,D) are in the anchor subnet; (B,D) are the alias candidates. The
// neighbor condition is either (B,E) in a subnet, or (A,E) known aliases.

/// Finds the candidate subnet shared by `a` and `b`, applying the
/// configured neighbor-subnet checks against the `anchor`.
fn common_subnet(
    topo: &Topology,
    cfg: &Cfg,
    subnets: &SubnetSet,
    bad_subnets: Option<&PrefixSet>,
    a: Addr,
    b: Addr,
    anchor: SubnetKey,
) -> Option<SubnetKey> {
    let min_len = if cfg.subnet_len {
        anchor.1
    } else {
        cfg.min_subnet_len
    };
    if !a.is_named() || !b.is_named() {
        return None;
    }
    // quick test that weeds out most cases
    if !same_prefix(a, b, min_len) {
        return None;
    }
    let len = max_subnet_len(a, b);
    if len < min_len {
        return None;
    }
    if cfg.subnet_verify {
        let begin = topo
            .ifaces
            .named
            .range(net_prefix(a, len)..)
            .next()
            .map(|(k, _)| *k)?;
        if !verify_subnet(topo, cfg, bad_subnets, begin, len) {
            return None;
        }
    }
    if !cfg.subnet_inference {
        // no candidate set to consult; the anchor stands in for a match
        return Some(anchor);
    }
    subnets.common_subnet(cfg, a, b, len, min_len, anchor)
}

/// Links all interfaces covered by a candidate subnet onto one link.
pub fn link_subnet(topo: &mut Topology, cfg: &Cfg, subnets: &SubnetSet, key: SubnetKey) {
    let members = subnets.get(key).members(topo);
    let (&first, rest) = members.split_first().expect("subnet has members");
    for &other in rest {
        topo.set_link(cfg, first, other);
    }
}

/// One pass of the modified APAR inference over the ranked candidate
/// subnets. The first pass runs with `point_to_point` false; the second
/// restricts itself to candidates still flagged point-to-point, with the
/// bad-subnet set already released.
pub fn find_aliases(
    topo: &mut Topology,
    cfg: &Cfg,
    subnets: &mut SubnetSet,
    bad_subnets: Option<&PrefixSet>,
    point_to_point: bool,
    log: &mut dyn Write,
) -> Result<(), Error> {
    let ranked: Vec<SubnetKey> = subnets.ranked().to_vec();
    for key in ranked {
        if point_to_point && !subnets.get(key).point_to_point {
            continue; // not p2p, but lower-ranked candidates may be
        }
        let members = subnets.get(key).members(topo);
        for &c in &members {
            let c_prev: Vec<Seg2> = match topo.ifaces.named(c) {
                Some(iface) => iface.prev.iter().cloned().collect(),
                None => continue,
            };
            for &d in &members {
                if c == d {
                    continue;
                }
                let d_next: Vec<Seg1> = match topo.ifaces.named(d) {
                    Some(iface) => iface.next.iter().cloned().collect(),
                    None => continue,
                };
                let mut repeat_b = Addr::ZERO;
                for rec in &c_prev {
                    let b = rec.prev;
                    if repeat_b == b {
                        // the previous iteration used the same B,C,D and
                        // never looked at A or E
                        continue;
                    }
                    repeat_b = b;
                    if b == Addr::ZERO {
                        continue;
                    }
                    if topo.known_alias_of(d, b) {
                        // Let the highest ranked subnet containing D form
                        // the link; lower ranks will find it already made.
                        if topo.ifaces.core(d).link_id == 0 {
                            link_subnet(topo, cfg, subnets, key);
                        }
                        continue;
                    }
                    if subnets.get(key).contains(b) {
                        continue; // same subnet, can't be aliases
                    }
                    if cfg.ttl_beats_inferred_alias
                        && cfg.n_ttls > 0
                        && !topo.alias_distance_ok(cfg.n_ttls, b, d)
                    {
                        continue;
                    }
                    if !topo.alias_no_loop(b, d) {
                        continue;
                    }
                    if cfg.negative_alias
                        && topo.ifaces.named(b).map_or(false, |i| i.pre_aliased)
                        && topo.ifaces.named(d).map_or(false, |i| i.pre_aliased)
                    {
                        continue;
                    }

                    if point_to_point {
                        writeln!(log, "B={} C={} D={}/{}", b, c, d, key.1)?;
                        topo.set_alias(cfg, d, b);
                        topo.set_link(cfg, c, d);
                        continue;
                    }

                    if cfg.bug_pprev {
                        repeat_b = Addr::ZERO;
                        'next_hops: for nxt in &d_next {
                            let e = nxt.hop;
                            if common_subnet(topo, cfg, subnets, bad_subnets, b, e, key)
                                .is_some()
                            {
                                topo.set_alias(cfg, d, b);
                                link_subnet(topo, cfg, subnets, key);
                                if key.1 < 30 {
                                    subnets.mark_non_p2p(cfg, key);
                                }
                                break 'next_hops;
                            }
                            // the historical code walked pre-previous hops
                            // detached from their previous hop
                            for pp in &c_prev {
                                let a2 = pp.pprev;
                                if a2 == e || topo.known_alias_of(a2, e) {
                                    subnets.get_mut(key).used_right = true;
                                    topo.set_alias(cfg, d, b);
                                    link_subnet(topo, cfg, subnets, key);
                                    if key.1 < 30 {
                                        subnets.mark_non_p2p(cfg, key);
                                    }
                                    break 'next_hops;
                                }
                            }
                        }
                        continue;
                    }

                    // Find an E whose B-E subnet ranks at least as well as
                    // the anchor; prefer the E giving the smallest subnet.
                    let mut best_left: Option<SubnetKey> = None;
                    let mut best_e = Addr::ZERO;
                    for nxt in &d_next {
                        let e = nxt.hop;
                        if let Some(left) =
                            common_subnet(topo, cfg, subnets, bad_subnets, b, e, key)
                        {
                            let better = match best_left {
                                None => true,
                                Some(cur) => subnets.get(left).len > subnets.get(cur).len,
                            };
                            if better {
                                best_e = e;
                                best_left = Some(left);
                            }
                        }
                    }
                    if let Some(left) = best_left {
                        subnets.get_mut(key).used_right = true;
                        subnets.get_mut(left).used_left = true;
                        writeln!(
                            log,
                            "B={} C={} D={}/{} E={}/{}",
                            b, c, d, key.1, best_e, left.1
                        )?;
                        topo.set_alias(cfg, d, b);
                        link_subnet(topo, cfg, subnets, key);
                        if key.1 < 30 {
                            subnets.mark_non_p2p(cfg, key);
                        }
                        link_subnet(topo, cfg, subnets, left);
                        continue; // no need to check for A=E aliases
                    }

                    repeat_b = Addr::ZERO;
                    // Find an E equal to, or a known alias of, A; verify
                    // the B-E subnet the alias implies. Among several,
                    // pick the one giving the smallest subnet.
                    let a_addr = rec.pprev;
                    if a_addr == Addr::ZERO {
                        continue; // there was no A
                    }
                    let mut best_e = Addr::ZERO;
                    let mut best_len: i32 = -1;
                    for nxt in &d_next {
                        let e = nxt.hop;
                        if !topo.known_alias_of(a_addr, e) {
                            continue;
                        }
                        if !b.is_named() || !e.is_named() {
                            // nothing to verify; accept the alias as-is
                            if best_len < 0 {
                                best_e = e;
                                best_len = 0;
                            }
                            continue;
                        }
                        let mut len = max_subnet_len(b, e);
                        while len >= cfg.min_subnet_len {
                            let pfx = net_prefix(e, len);
                            let mask = u32::MAX.checked_shr(u32::from(len)).unwrap_or(0);
                            if len == 31 || cfg.bug_broadcast {
                                break;
                            }
                            let begin = match topo.ifaces.named.range(pfx..).next() {
                                Some((k, _)) => *k,
                                None => break,
                            };
                            if begin.0 & mask == 0 {
                                // the all-zeroes host address exists
                                len -= 1;
                                continue;
                            }
                            if topo.ifaces.named.contains_key(&Addr(pfx.0 | mask)) {
                                // the all-ones host address exists
                                len -= 1;
                                continue;
                            }
                            break;
                        }
                        let verified = len >= cfg.min_subnet_len && {
                            let begin = topo
                                .ifaces
                                .named
                                .range(net_prefix(e, len)..)
                                .next()
                                .map(|(k, _)| *k);
                            match begin {
                                Some(begin) => {
                                    verify_subnet(topo, cfg, bad_subnets, begin, len)
                                }
                                None => false,
                            }
                        };
                        if verified && i32::from(len) > best_len {
                            best_e = e;
                            best_len = i32::from(len);
                        }
                        // keep trying every E, to find all B-E links
                    }
                    if !cfg.alias_subnet_verify || best_len >= 0 {
                        writeln!(
                            log,
                            "A={} B={} C={} D={}/{} E={}/{}",
                            a_addr, b, c, d, key.1, best_e, best_len
                        )?;
                        subnets.get_mut(key).used_right = true;
                        topo.set_alias(cfg, d, b);
                        link_subnet(topo, cfg, subnets, key);
                        if key.1 < 30 {
                            subnets.mark_non_p2p(cfg, key);
                        }
                        if best_len == 0 && !cfg.bug_be_link {
                            // B or E was anonymous; they can be linked to
                            // each other but a whole subnet can't be
                            topo.set_link(cfg, b, best_e);
                        } else if best_len >= 0 {
                            // infer all B-E links within the subnet
                            for nxt in &d_next {
                                let e2 = nxt.hop;
                                if same_prefix(b, e2, best_len as u8) {
                                    topo.set_link(cfg, b, e2);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Topology;
    use crate::idset::CompactIdSet;
    use crate::subnet::find_subnets;

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    /// Stores one trace's hops with adjacency and trace ids, the way
    /// ingestion would.
    fn store_trace(topo: &mut Topology, id: u32, hops: &[&str]) {
        let hops: Vec<Addr> = hops.iter().map(|h| addr(h)).collect();
        for (i, &h) in hops.iter().enumerate() {
            let iface = topo.ifaces.find_or_insert_named(h);
            if i > 0 {
                let pprev = if i > 1 { hops[i - 2] } else { Addr::ZERO };
                iface.prev.insert(Seg2::new(hops[i - 1], pprev));
            }
            if i + 1 < hops.len() {
                iface.next.insert(Seg1::new(hops[i + 1]));
            }
            iface.core.traces.append(id);
        }
    }

    fn run_pass1(topo: &mut Topology, cfg: &Cfg) -> SubnetSet {
        let bad = PrefixSet::new();
        let mut mids = Vec::new();
        let mut subnets = find_subnets(topo, cfg, &bad, &mut mids);
        let mut log = Vec::new();
        find_aliases(topo, cfg, &mut subnets, Some(&bad), false, &mut log).unwrap();
        subnets
    }

    fn run(topo: &mut Topology, cfg: &Cfg) -> SubnetSet {
        let mut subnets = run_pass1(topo, cfg);
        let mut log = Vec::new();
        find_aliases(topo, cfg, &mut subnets, None, true, &mut log).unwrap();
        subnets
    }

    // Layout used by several tests: router R owns B=10.0.0.10 (toward the
    // vantage) and D=10.0.0.2 (on the 10.0.0.0/30 medium with C=10.0.0.1).
    // The forward path enters R through B and continues to C; the reverse
    // path leaves R through D toward E=10.0.0.12 = A.
    fn forward_reverse(topo: &mut Topology) {
        store_trace(topo, 1, &["10.0.0.12", "10.0.0.10", "10.0.0.1"]);
        store_trace(topo, 2, &["172.30.0.1", "10.0.0.2", "10.0.0.12"]);
    }

    #[test]
    fn test_a_equals_e_inference() {
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        forward_reverse(&mut topo);
        let subnets = run(&mut topo, &cfg);
        // B and D are aliases of router R
        assert!(topo.are_known_aliases(addr("10.0.0.2"), addr("10.0.0.10")));
        // the anchor /30 became a link holding C and D
        let c = topo.ifaces.core(addr("10.0.0.1"));
        let d = topo.ifaces.core(addr("10.0.0.2"));
        assert_ne!(c.link_id, 0);
        assert_eq!(c.link_id, d.link_id);
        assert!(subnets.get((addr("10.0.0.0"), 30)).used_right);
        // the implied B-E medium was linked too
        let b = topo.ifaces.core(addr("10.0.0.10"));
        let e = topo.ifaces.core(addr("10.0.0.12"));
        assert_ne!(b.link_id, 0);
        assert_eq!(b.link_id, e.link_id);
    }

    #[test]
    fn test_subnet_condition_inference() {
        // Both directions observed: B=10.0.0.6 and E=10.0.0.5 share an
        // inferred /30, which discharges the neighbor condition without a
        // common A.
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        store_trace(&mut topo, 1, &["10.0.0.6", "10.0.0.5", "10.0.0.1"]);
        store_trace(&mut topo, 2, &["172.30.0.1", "10.0.0.2", "10.0.0.6"]);
        let subnets = run(&mut topo, &cfg);
        assert!(topo.are_known_aliases(addr("10.0.0.5"), addr("10.0.0.2")));
        assert!(subnets.get((addr("10.0.0.0"), 30)).used_right);
        assert!(subnets.get((addr("10.0.0.4"), 30)).used_left);
    }

    #[test]
    fn test_no_loop_condition_blocks_alias() {
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        forward_reverse(&mut topo);
        // a third trace carries both B and D, so they can't be one router
        store_trace(&mut topo, 3, &["172.31.0.1", "10.0.0.10", "172.31.0.2", "10.0.0.2"]);
        let _ = run(&mut topo, &cfg);
        assert!(!topo.are_known_aliases(addr("10.0.0.2"), addr("10.0.0.10")));
    }

    #[test]
    fn test_b_inside_anchor_rejected() {
        // B=10.0.0.5 sits inside the /29 anchor, so (B,D) is not a valid
        // candidate there, and the first pass finds no other evidence
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        store_trace(&mut topo, 1, &["9.0.0.1", "10.0.0.5", "10.0.0.1"]);
        store_trace(&mut topo, 2, &["172.30.0.1", "10.0.0.2", "172.30.0.9"]);
        let _ = run_pass1(&mut topo, &cfg);
        assert!(topo.nodes.is_empty());
    }

    #[test]
    fn test_negative_alias_skips_preloaded() {
        let mut topo = Topology::new();
        let mut cfg = Cfg::default();
        cfg.negative_alias = true;
        forward_reverse(&mut topo);
        topo.ifaces
            .find_or_insert_named(addr("10.0.0.10"))
            .pre_aliased = true;
        topo.ifaces.find_or_insert_named(addr("10.0.0.2")).pre_aliased = true;
        let _ = run(&mut topo, &cfg);
        assert!(!topo.are_known_aliases(addr("10.0.0.2"), addr("10.0.0.10")));
    }

    #[test]
    fn test_idempotent_reruns() {
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        forward_reverse(&mut topo);
        let _ = run(&mut topo, &cfg);
        assert!(topo.are_known_aliases(addr("10.0.0.2"), addr("10.0.0.10")));
        let nodes_before = topo.nodes.len();
        let links_before = topo.links.len();
        // trace-id sets are still present, so a rerun must change nothing
        let bad = PrefixSet::new();
        let mut mids = Vec::new();
        let mut subnets = find_subnets(&topo, &cfg, &bad, &mut mids);
        let mut log = Vec::new();
        find_aliases(&mut topo, &cfg, &mut subnets, Some(&bad), false, &mut log).unwrap();
        assert_eq!(topo.nodes.len(), nodes_before);
        assert_eq!(topo.links.len(), links_before);
    }

    #[test]
    fn test_trace_sets_survive_until_freed() {
        // the no-loop condition relies on trace-id sets; freeing them is
        // the driver's job only after both passes
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        store_trace(&mut topo, 1, &["1.0.0.1", "2.0.0.1"]);
        let t: &CompactIdSet = &topo.ifaces.core(addr("2.0.0.1")).traces;
        assert!(!t.is_empty());
    }
}
