use crate::addr::{max_subnet_len, same_prefix, Addr, NetPrefix, PrefixSet};
use crate::config::Cfg;
use crate::graph::Topology;
use crate::path::PathHandler;
use crate::seg::{Seg1, Seg2};
use crate::MAXHOPS;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::io::Error;

/// A pair of hop addresses where the second was a trace destination,
/// remembered so link completion can add an implicit link later.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DstPair {
    /// The two endpoints, in hop order (or numeric order under the
    /// destination-swap compatibility switch).
    pub addr: [Addr; 2],
}

impl DstPair {
    /// Builds a pair from the penultimate hop and the destination hop.
    pub fn new(a: Addr, b: Addr, swap: bool) -> DstPair {
        if !swap || a < b {
            DstPair { addr: [a, b] }
        } else {
            DstPair { addr: [b, a] }
        }
    }
}

impl Ord for DstPair {
    fn cmp(&self, other: &DstPair) -> Ordering {
        self.addr[0]
            .class_cmp(other.addr[0])
            .then_with(|| self.addr[1].class_cmp(other.addr[1]))
    }
}

impl PartialOrd for DstPair {
    fn partial_cmp(&self, other: &DstPair) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ingestion counters, reported in the log after each trace file.
#[derive(Default)]
pub struct IngestStats {
    /// Good paths recorded (also the highest trace id).
    pub n_good_traces: u32,
    /// Anonymous hop occurrences.
    pub n_anon: u32,
    /// Hops stored over all good paths.
    pub n_total_hops: u32,
    /// Traces dropped for non-adjacent hops sharing a /31.
    pub n_bad_31_traces: u32,
    /// Hop pairs that failed the quick shared-prefix test.
    pub n_not_min_mask: u32,
    /// Hop pairs whose longest shared subnet was too small.
    pub n_not_min_net: u32,
    /// Hop pairs that produced bad-subnet marks.
    pub n_same_min_net: u32,
    /// Records stored in named `prev` lists.
    pub n_named_prev: u32,
    /// Records stored in named `next` lists.
    pub n_named_next: u32,
    /// Records stored in anonymous `prev` lists.
    pub n_anon_prev: u32,
}

/// State that outlives ingestion: the bad-subnet set consumed by subnet
/// inference, the destination pairs consumed by link completion, and the
/// counters. The anonymous-segment index is dropped with the engine.
pub struct IngestResult {
    /// Prefixes ruled out by same-trace non-adjacent hops.
    pub bad_subnets: PrefixSet,
    /// Destination hop pairs.
    pub dstlinks: BTreeSet<DstPair>,
    /// Counters.
    pub stats: IngestStats,
}

/// Storage accounting over all interfaces, reported in the log.
#[derive(Default)]
pub struct StorageSummary {
    /// Bytes held by named `prev` vectors.
    pub mem_named_prev: usize,
    /// Bytes held by named `next` vectors.
    pub mem_named_next: usize,
    /// Bytes held by anonymous `prev` vectors.
    pub mem_anon_prev: usize,
    /// Histogram of trace-id sets by raw word count (0..3, then 4+).
    pub idset_hist: [u32; 5],
}

#[derive(PartialEq, Eq, Hash)]
struct AnonSegKey {
    lo: Addr,
    hi: Addr,
    length: u32,
}

/// The path ingestion engine: canonicalizes each trace's hops into
/// interfaces, rules out subnets contradicted by the trace, coalesces
/// repeated anonymous segments, and stores adjacency and trace ids.
pub struct Ingest<'a> {
    topo: &'a mut Topology,
    cfg: &'a Cfg,
    bogons: &'a PrefixSet,
    bad_subnets: PrefixSet,
    dstlinks: BTreeSet<DstPair>,
    /// (lo, hi, length) -> index of the anonymous interface next to lo.
    anon_segs: HashMap<AnonSegKey, u32>,
    /// Canonical interface address per hop position (zero = dummy).
    ihops: Vec<Addr>,
    n_cached_hops: usize,
    n_repeated_hops: usize,
    n_stored_hops: usize,
    bad_head: u32,
    bad_tail: u32,
    stats: IngestStats,
}

impl<'a> Ingest<'a> {
    /// Creates an engine over the given topology.
    pub fn new(topo: &'a mut Topology, cfg: &'a Cfg, bogons: &'a PrefixSet) -> Ingest<'a> {
        Ingest {
            topo,
            cfg,
            bogons,
            bad_subnets: PrefixSet::new(),
            dstlinks: BTreeSet::new(),
            anon_segs: HashMap::new(),
            ihops: vec![Addr::ZERO; MAXHOPS + 1],
            n_cached_hops: 0,
            n_repeated_hops: 0,
            n_stored_hops: 0,
            bad_head: 0,
            bad_tail: 0,
            stats: IngestStats::default(),
        }
    }

    /// Highest trace id assigned so far.
    pub fn n_good_traces(&self) -> u32 {
        self.stats.n_good_traces
    }

    /// Current counters.
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Number of remembered anonymous segments.
    pub fn anon_seg_count(&self) -> usize {
        self.anon_segs.len()
    }

    /// Number of named interfaces seen so far.
    pub fn named_count(&self) -> usize {
        self.topo.ifaces.named.len()
    }

    /// Number of unique anonymous interfaces allocated so far.
    pub fn anon_iface_count(&self) -> u32 {
        self.topo.ifaces.anon_count()
    }

    /// Sizes up the adjacency vectors and trace-id sets for the log.
    pub fn storage_summary(&self) -> StorageSummary {
        let mut s = StorageSummary::default();
        for iface in self.topo.ifaces.named.values() {
            s.mem_named_prev += iface.prev.memory();
            s.mem_named_next += iface.next.memory();
            s.idset_hist[iface.core.traces.raw_len().min(4)] += 1;
        }
        for iface in &self.topo.ifaces.anon {
            s.mem_anon_prev += iface.prev.memory();
            s.idset_hist[iface.core.traces.raw_len().min(4)] += 1;
        }
        s
    }

    /// Number of prefixes in the bad-subnet set.
    pub fn bad_subnet_count(&self) -> usize {
        self.bad_subnets.len()
    }

    /// Tears the engine down, dropping the anonymous-segment index and
    /// releasing what the later stages need.
    pub fn finish(self) -> IngestResult {
        IngestResult {
            bad_subnets: self.bad_subnets,
            dstlinks: self.dstlinks,
            stats: self.stats,
        }
    }

    fn ihop(&self, base: usize, i: usize) -> Addr {
        self.ihops[base + i]
    }

    /// Marks the subnet that would contain both addresses, and every larger
    /// subnet down to the minimum length, as invalid candidates.
    fn mark_bad_subnets(&mut self, a: Addr, b: Addr) {
        if !same_prefix(a, b, self.cfg.min_subnet_len) {
            self.stats.n_not_min_mask += 1;
            return;
        }
        let len = max_subnet_len(a, b);
        if len < self.cfg.min_subnet_len {
            self.stats.n_not_min_net += 1;
            return;
        }
        self.stats.n_same_min_net += 1;
        let mut key = NetPrefix::new(a, len);
        while key.len >= self.cfg.min_subnet_len {
            if self.bad_subnets.contains_exact(&key) {
                break; // this subnet and larger are already known bad
            }
            self.bad_subnets.insert(key);
            if key.len == 0 {
                break;
            }
            key.enlarge();
        }
    }

    /// Coalesces each maximal run of dummy hops against the
    /// anonymous-segment index, reusing or allocating synthetic interfaces.
    fn coalesce_anon_runs(&mut self, base: usize, n: usize) -> Result<(), Error> {
        let mut i = 0;
        while i < n {
            if self.ihop(base, i) != Addr::ZERO {
                i += 1;
                continue;
            }
            let mut len = 1;
            while i + len < n && self.ihop(base, i + len) == Addr::ZERO {
                len += 1;
            }
            // a run needs named frames on both sides
            if i == 0 || i + len >= n {
                i += len + 1;
                continue;
            }
            let left = self.ihop(base, i - 1);
            let right = self.ihop(base, i + len);
            let reversed = self.cfg.bug_rev_anondup && left > right;
            let (lo, hi) = if reversed { (right, left) } else { (left, right) };
            let key = AnonSegKey {
                lo,
                hi,
                length: len as u32,
            };
            let positions: Vec<usize> = if reversed {
                (i..i + len).rev().collect()
            } else {
                (i..i + len).collect()
            };
            if let Some(&lo_anon) = self.anon_segs.get(&key) {
                // repeat of a known segment; reuse its interfaces
                for (k, &pos) in positions.iter().enumerate() {
                    let idx = lo_anon as usize + k;
                    self.ihops[base + pos] = self.topo.ifaces.anon[idx].core.addr;
                }
            } else {
                let lo_anon = self.topo.ifaces.anon_count();
                for &pos in &positions {
                    let addr = self.topo.ifaces.new_anon()?;
                    self.ihops[base + pos] = addr;
                }
                self.anon_segs.insert(key, lo_anon);
            }
            i += len + 1;
        }
        Ok(())
    }
}

impl<'a> PathHandler for Ingest<'a> {
    fn is_bad_hop(&self, hops: &[Addr], i: usize) -> bool {
        // A bogus address is treated as anonymous. So is an address
        // followed by itself: a router that forwards an expired probe
        // instead of answering shows up at two successive hops.
        self.bogons.contains_addr(hops[i])
            || (self.cfg.oneloop_anon && i + 1 < hops.len() && hops[i] == hops[i + 1])
    }

    fn hops_are_equal(&self, i: usize, j: usize) -> bool {
        let a = self.ihops[i];
        let b = self.ihops[j];
        a != Addr::ZERO && self.topo.are_known_aliases(a, b)
    }

    fn set_trim(&mut self, bad_head: u32, bad_tail: u32) {
        self.bad_head = bad_head;
        self.bad_tail = bad_tail;
    }

    fn preprocess_hops(&mut self, hops: &[Addr]) {
        self.n_repeated_hops = 0;
        for i in 0..hops.len() {
            // head and tail were already checked by the trimming pass
            if i > 0 && i + 1 < hops.len() && self.is_bad_hop(hops, i) {
                self.stats.n_anon += 1;
                self.ihops[i] = Addr::ZERO;
                continue;
            }
            if i < self.n_cached_hops && self.ihops[i] == hops[i] {
                // the interface was already looked up for the previous
                // trace, which commonly shares its first few hops
                if self.n_repeated_hops == i {
                    self.n_repeated_hops = i + 1;
                }
                continue;
            }
            self.topo.ifaces.find_or_insert_named(hops[i]);
            self.ihops[i] = hops[i];
        }
        self.n_cached_hops = hops.len();
    }

    fn process_hops(
        &mut self,
        hops: &[Addr],
        base: usize,
        src: Addr,
        dst: Addr,
    ) -> Result<u32, Error> {
        let mut n = hops.len();

        // non-neighboring hops must never share a /31
        for i in 0..n.saturating_sub(2) {
            if self.ihop(base, i).is_anon() {
                continue;
            }
            for j in i + 2..n {
                if self.ihop(base, j).is_anon() {
                    continue;
                }
                if same_prefix(hops[i], hops[j], 31) {
                    self.stats.n_bad_31_traces += 1;
                    return Ok(0);
                }
            }
        }

        // record subnets contradicted by non-adjacent hops
        if !self.cfg.mode_extract || self.cfg.min_subnet_middle_required < 30 {
            for i in 0..n {
                if self.ihop(base, i).is_anon() {
                    continue;
                }
                for j in i + 2..n {
                    if self.ihop(base, j).is_anon() {
                        continue;
                    }
                    self.mark_bad_subnets(hops[i], hops[j]);
                }
            }
        }

        if !self.cfg.mode_extract {
            if self.cfg.anon_dups {
                self.coalesce_anon_runs(base, n)?;
            }

            let first_transit = if self.cfg.include_src && !hops.is_empty() && hops[0] == src {
                1
            } else {
                0
            };
            let last_transit = n - if self.bad_tail == 0 { 1 } else { 0 };
            for i in first_transit..last_transit {
                let addr = self.ihop(base, i);
                self.topo.ifaces.core_mut(addr).seen_as_transit = true;
            }

            // destination hops never feed alias inference: the reply does
            // not necessarily come from the interface on the route back,
            // so a B->C link through it could be false
            if n > 0 && self.bad_tail == 0 && hops[n - 1] == dst {
                let dst_iface = self.ihop(base, n - 1);
                self.topo.ifaces.core_mut(dst_iface).seen_as_dest = true;
                if !self.cfg.infer_links {
                    if self.topo.ifaces.core(dst_iface).node_id == 0 {
                        let node = self.topo.nodes.add();
                        self.topo.add_iface_to_node(self.cfg.n_ttls, node, dst_iface);
                    }
                } else if n > 1 {
                    // creating the node and link now would cost memory the
                    // alias stage needs; remember the pair instead
                    self.dstlinks.insert(DstPair::new(
                        self.ihop(base, n - 2),
                        dst_iface,
                        self.cfg.bug_swap_dstlink,
                    ));
                }
                n -= 1;
            }

            // store path segments, skipping positions already stored for
            // the previous trace's identical prefix
            let n_repeated_stores = if base == 0 {
                self.n_stored_hops.min(self.n_repeated_hops)
            } else {
                0
            };
            let start_i = n_repeated_stores.saturating_sub(1);
            for i in start_i..n {
                let addr = self.ihop(base, i);
                if addr.is_anon() {
                    // an anonymous hop can never be in a subnet; only its
                    // prev matters, for link completion
                    if i > 0 {
                        let seg = Seg1::new(self.ihop(base, i - 1));
                        if self.topo.ifaces.anon_mut(addr).prev.insert(seg) {
                            self.stats.n_anon_prev += 1;
                        }
                    }
                    continue;
                }
                if i > 0 && i >= n_repeated_stores {
                    let pprev = if i > 1 && self.cfg.infer_aliases {
                        self.ihop(base, i - 2)
                    } else {
                        Addr::ZERO
                    };
                    let seg = Seg2::new(self.ihop(base, i - 1), pprev);
                    if self.topo.ifaces.find_or_insert_named(addr).prev.insert(seg) {
                        self.stats.n_named_prev += 1;
                    }
                }
                if i + 1 < n && i + 1 >= n_repeated_stores && self.cfg.infer_aliases {
                    let seg = Seg1::new(self.ihop(base, i + 1));
                    if self.topo.ifaces.find_or_insert_named(addr).next.insert(seg) {
                        self.stats.n_named_next += 1;
                    }
                }
            }
            self.n_stored_hops = if base == 0 { n } else { 0 };
        }

        self.stats.n_good_traces += 1;
        if self.cfg.need_traceids {
            let id = self.stats.n_good_traces;
            for i in 0..n {
                let addr = self.ihop(base, i);
                if addr == Addr::ZERO {
                    continue; // dummy
                }
                self.topo.ifaces.core_mut(addr).traces.append(id);
            }
        }

        self.stats.n_total_hops += n as u32;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ANON_PREFIX;
    use crate::path::PathLoader;

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    fn run_traces(cfg: &Cfg, topo: &mut Topology, traces: &[(&str, &str, &[&str])]) -> IngestResult {
        let mut bogons = PrefixSet::new();
        bogons.install_std_bogons();
        let mut loader = PathLoader::new();
        loader.include_dst = cfg.include_dst;
        loader.loop_policy = cfg.loop_policy;
        let mut ingest = Ingest::new(topo, cfg, &bogons);
        for (src, dst, hops) in traces {
            let hops: Vec<Addr> = hops.iter().map(|h| addr(h)).collect();
            loader
                .process_trace(&mut ingest, &hops, addr(src), addr(dst))
                .unwrap();
        }
        ingest.finish()
    }

    #[test]
    fn test_single_trace_builds_ifaces() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let result = run_traces(
            &cfg,
            &mut topo,
            &[(
                "1.0.0.1",
                "9.0.0.9",
                &["1.0.0.1", "2.0.0.1", "3.0.0.1", "4.0.0.1"],
            )],
        );
        assert_eq!(result.stats.n_good_traces, 1);
        assert_eq!(topo.ifaces.named.len(), 4);
        // source is not transit; interior hops are
        assert!(!topo.ifaces.core(addr("1.0.0.1")).seen_as_transit);
        assert!(topo.ifaces.core(addr("2.0.0.1")).seen_as_transit);
        assert!(topo.ifaces.core(addr("3.0.0.1")).seen_as_transit);
        // adjacency: 3.0.0.1 saw prev (2.0.0.1, 1.0.0.1) and next 4.0.0.1
        let iface = topo.ifaces.named(addr("3.0.0.1")).unwrap();
        assert_eq!(iface.prev.len(), 1);
        assert_eq!(iface.prev.get(0).prev, addr("2.0.0.1"));
        assert_eq!(iface.prev.get(0).pprev, addr("1.0.0.1"));
        assert_eq!(iface.next.get(0).hop, addr("4.0.0.1"));
        // every hop carries trace id 1
        assert_eq!(
            topo.ifaces
                .core(addr("2.0.0.1"))
                .traces
                .iter()
                .collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn test_bad_31_trace_discarded() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let result = run_traces(
            &cfg,
            &mut topo,
            &[(
                "1.0.0.1",
                "9.0.0.9",
                &["1.0.0.1", "5.0.0.0", "2.0.0.1", "5.0.0.1"],
            )],
        );
        assert_eq!(result.stats.n_bad_31_traces, 1);
        assert_eq!(result.stats.n_good_traces, 0);
    }

    #[test]
    fn test_bad_subnet_marking() {
        // 5.0.0.1 at hop 2 and 5.0.0.5 at hop 4: /29 through /24 marked bad
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let result = run_traces(
            &cfg,
            &mut topo,
            &[(
                "1.0.0.1",
                "9.0.0.9",
                &["1.0.0.1", "5.0.0.1", "2.0.0.1", "5.0.0.5"],
            )],
        );
        assert!(result
            .bad_subnets
            .contains_exact(&NetPrefix::new(addr("5.0.0.0"), 29)));
        assert!(result
            .bad_subnets
            .contains_exact(&NetPrefix::new(addr("5.0.0.0"), 24)));
        assert!(!result
            .bad_subnets
            .contains_exact(&NetPrefix::new(addr("5.0.0.0"), 23)));
        assert_eq!(result.stats.n_same_min_net, 1);
    }

    #[test]
    fn test_adjacent_hops_not_marked_bad() {
        // adjacent hops at distance 1 never rule out a subnet
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let result = run_traces(
            &cfg,
            &mut topo,
            &[("1.0.0.1", "9.0.0.9", &["1.0.0.1", "1.0.0.2", "2.1.0.1", "2.1.0.2"])],
        );
        assert_eq!(result.bad_subnets.len(), 0);
    }

    #[test]
    fn test_anon_coalescing_shares_ids() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let trace: &[&str] = &["1.0.0.1", "2.0.0.1", "0.0.0.0", "0.0.0.0", "0.0.0.0", "3.0.0.1"];
        run_traces(
            &cfg,
            &mut topo,
            &[("1.0.0.1", "9.0.0.9", trace), ("1.0.0.1", "9.0.0.9", trace)],
        );
        // both traces reuse the same three synthetic interfaces
        assert_eq!(topo.ifaces.anon_count(), 3);
        let first = Addr(ANON_PREFIX | 1);
        assert_eq!(
            topo.ifaces.anon(first).core.traces.iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        // the anonymous hop records its named predecessor
        assert_eq!(topo.ifaces.anon(first).prev.get(0).hop, addr("2.0.0.1"));
    }

    #[test]
    fn test_anon_reversed_not_coalesced_by_default() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        run_traces(
            &cfg,
            &mut topo,
            &[
                ("1.0.0.1", "9.0.0.9", &["1.0.0.1", "5.0.0.1", "0.0.0.0", "6.0.0.1"]),
                ("1.0.0.2", "9.0.0.9", &["1.0.0.2", "6.0.0.1", "0.0.0.0", "5.0.0.1"]),
            ],
        );
        assert_eq!(topo.ifaces.anon_count(), 2);
    }

    #[test]
    fn test_anon_reversed_coalesced_with_bug_compat() {
        let mut cfg = Cfg::default();
        cfg.bug_rev_anondup = true;
        let mut topo = Topology::new();
        run_traces(
            &cfg,
            &mut topo,
            &[
                ("1.0.0.1", "9.0.0.9", &["1.0.0.1", "5.0.0.1", "0.0.0.0", "6.0.0.1"]),
                ("1.0.0.2", "9.0.0.9", &["1.0.0.2", "6.0.0.1", "0.0.0.0", "5.0.0.1"]),
            ],
        );
        assert_eq!(topo.ifaces.anon_count(), 1);
    }

    #[test]
    fn test_destination_pair_recorded() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let result = run_traces(
            &cfg,
            &mut topo,
            &[("1.0.0.1", "4.0.0.1", &["1.0.0.1", "2.0.0.1", "3.0.0.1", "4.0.0.1"])],
        );
        assert!(topo.ifaces.core(addr("4.0.0.1")).seen_as_dest);
        assert_eq!(result.dstlinks.len(), 1);
        let pair = result.dstlinks.iter().next().unwrap();
        assert_eq!(pair.addr, [addr("3.0.0.1"), addr("4.0.0.1")]);
        // the destination does not join the trace-id sets
        assert!(topo.ifaces.core(addr("4.0.0.1")).traces.is_empty());
        // and is not marked transit
        assert!(!topo.ifaces.core(addr("4.0.0.1")).seen_as_transit);
    }

    #[test]
    fn test_oneloop_becomes_anonymous() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        run_traces(
            &cfg,
            &mut topo,
            &[(
                "1.0.0.1",
                "9.0.0.9",
                &["1.0.0.1", "2.0.0.1", "2.0.0.1", "3.0.0.1"],
            )],
        );
        // first appearance of 2.0.0.1 became anonymous
        let iface = topo.ifaces.named(addr("2.0.0.1")).unwrap();
        assert_eq!(iface.prev.len(), 1);
        assert!(iface.prev.get(0).prev.is_anon());
    }

    #[test]
    fn test_repeated_prefix_stores_once() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let result = run_traces(
            &cfg,
            &mut topo,
            &[
                ("1.0.0.1", "9.0.0.9", &["1.0.0.1", "2.0.0.1", "3.0.0.1"]),
                ("1.0.0.1", "8.0.0.8", &["1.0.0.1", "2.0.0.1", "7.0.0.1"]),
            ],
        );
        // shared prefix hop 2.0.0.1 stores its prev record only once
        assert_eq!(topo.ifaces.named(addr("2.0.0.1")).unwrap().prev.len(), 1);
        assert_eq!(result.stats.n_good_traces, 2);
        // but appears in both trace-id sets
        assert_eq!(
            topo.ifaces
                .core(addr("2.0.0.1"))
                .traces
                .iter()
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
