use crate::addr::Addr;
use crate::config::Cfg;
use crate::graph::Topology;
use crate::idset::CompactIdSet;
use crate::ingest::DstPair;
use std::collections::{BTreeMap, BTreeSet};

/// Links `i1` to an implicit interface on `i2`'s node, unless some link
/// already joins `i1` and that node. Creates the node when `i2` has none.
fn link_to_node(topo: &mut Topology, cfg: &Cfg, i1: Addr, i2: Addr) {
    let mut n2 = topo.ifaces.core(i2).node_id;
    if n2 == 0 {
        n2 = topo.nodes.add();
        topo.add_iface_to_node(cfg.n_ttls, n2, i2);
    }
    let link_id = topo.ifaces.core(i1).link_id;
    if link_id != 0 {
        let link = topo.links.get(link_id);
        for &member in &link.ifaces {
            if topo.ifaces.core(member).node_id == n2 {
                return; // already linked to an explicit interface on n2
            }
        }
        if link.nodes.contains(&n2) {
            return; // already linked to an implicit interface on n2
        }
    }
    topo.set_link_node(i1, n2);
}

/// Materializes the links that exist in paths but were not expressed by
/// alias inference: B->C links from stored adjacency, then implicit links
/// for recorded destination pairs.
pub fn find_links(topo: &mut Topology, cfg: &Cfg, dstlinks: &BTreeSet<DstPair>) {
    // B->C links for each named interface
    let named: Vec<Addr> = topo.ifaces.named.keys().cloned().collect();
    for c in named {
        let prevs: Vec<Addr> = match topo.ifaces.named(c) {
            Some(iface) => iface.prev.iter().map(|s| s.prev).collect(),
            None => continue,
        };
        let mut repeat = Addr::ZERO;
        for b in prevs {
            if repeat == b {
                continue;
            }
            repeat = b;
            link_to_node(topo, cfg, c, b);
        }
    }

    // B->C links for each anonymous interface
    for idx in 0..topo.ifaces.anon.len() {
        let c = topo.ifaces.anon[idx].core.addr;
        let prevs: Vec<Addr> = topo.ifaces.anon[idx].prev.iter().map(|s| s.hop).collect();
        for b in prevs {
            link_to_node(topo, cfg, c, b);
        }
    }

    // implicit links for destination hops, which were kept out of the
    // adjacency lists
    if !dstlinks.is_empty() {
        // node id -> ids of the links the node is already on
        let mut node_links: BTreeMap<u32, CompactIdSet> = BTreeMap::new();
        let link_ids: Vec<u32> = topo.links.iter().map(|(id, _)| *id).collect();
        for link_id in link_ids {
            let members: Vec<Addr> = topo.links.get(link_id).ifaces.clone();
            let mut nodes_on_link: BTreeSet<u32> = BTreeSet::new();
            for member in members {
                let mut node_id = topo.ifaces.core(member).node_id;
                if node_id == 0 {
                    node_id = topo.nodes.add();
                    topo.add_iface_to_node(cfg.n_ttls, node_id, member);
                }
                nodes_on_link.insert(node_id);
            }
            for &node_id in &topo.links.get(link_id).nodes {
                nodes_on_link.insert(node_id);
            }
            for node_id in nodes_on_link {
                node_links.entry(node_id).or_default().append(link_id);
            }
        }
        for pair in dstlinks {
            // the first may be named or anonymous but already exists; the
            // second (the destination) is named and may be new
            let iface0 = pair.addr[0];
            let iface1 = pair.addr[1];
            topo.ifaces.find_or_insert_named(iface1);
            for &iface in &[iface0, iface1] {
                if topo.ifaces.core(iface).node_id == 0 {
                    let node_id = topo.nodes.add();
                    topo.add_iface_to_node(cfg.n_ttls, node_id, iface);
                }
            }
            let n0 = topo.ifaces.core(iface0).node_id;
            let n1 = topo.ifaces.core(iface1).node_id;
            let overlap = match (node_links.get(&n0), node_links.get(&n1)) {
                (Some(a), Some(b)) => a.overlaps(b),
                _ => false,
            };
            if !overlap {
                let link_id = topo.links.add();
                let link = topo.links.get_mut(link_id);
                link.nodes.push(n0);
                link.nodes.push(n1);
                node_links.entry(n0).or_default().append(link_id);
                if n1 != n0 {
                    node_links.entry(n1).or_default().append(link_id);
                }
            }
        }
    }
}

/// Gives a node to every interface that ended up on a link without one.
pub fn fix_orphans(topo: &mut Topology, cfg: &Cfg) {
    let mut orphans: Vec<Addr> = Vec::new();
    for iface in topo.ifaces.named.values() {
        if iface.core.link_id != 0 && iface.core.node_id == 0 {
            orphans.push(iface.core.addr);
        }
    }
    for iface in &topo.ifaces.anon {
        if iface.core.link_id != 0 && iface.core.node_id == 0 {
            orphans.push(iface.core.addr);
        }
    }
    for addr in orphans {
        let node_id = topo.nodes.add();
        topo.add_iface_to_node(cfg.n_ttls, node_id, addr);
    }
}

/// Marks anonymous interfaces that share both node and link with another
/// kept interface on the node as redundant; they are suppressed in output.
pub fn mark_redundant_anon(topo: &mut Topology) {
    let mut redundant: Vec<(Addr, Addr)> = Vec::new();
    for (_, node) in topo.nodes.iter() {
        for &i in &node.ifaces {
            if !i.is_anon() || i == Addr::ZERO {
                continue;
            }
            if topo.ifaces.anon(i).redundant != Addr::ZERO {
                continue;
            }
            for &j in &node.ifaces {
                if i == j {
                    continue;
                }
                if topo.ifaces.core(i).link_id != topo.ifaces.core(j).link_id {
                    continue;
                }
                let keeper = j.is_named()
                    || (j.is_anon() && topo.ifaces.anon(j).redundant == Addr::ZERO);
                if keeper {
                    redundant.push((i, j));
                    break;
                }
            }
        }
    }
    for (i, j) in redundant {
        topo.ifaces.anon_mut(i).redundant = j;
    }
}

/// Counts the path sequences A,*,C whose anonymous middle hop also appears
/// as a named B in a matching A,B,C sequence. The interfaces are detected
/// but deliberately not merged; only the count is reported.
pub fn match_anonymous_ifaces(topo: &Topology) -> u32 {
    let mut matches = 0;
    for iface_c in topo.ifaces.named.values() {
        for rec1 in iface_c.prev.iter() {
            if !rec1.prev.is_anon() || rec1.pprev.is_anon() {
                continue;
            }
            // found an A,*,C sequence
            let addr_a = rec1.pprev;
            for rec2 in iface_c.prev.iter() {
                if rec2.pprev == addr_a && rec2.prev.is_named() {
                    // found a matching A,B,C sequence
                    matches += 1;
                    break;
                }
            }
        }
    }
    matches
}
