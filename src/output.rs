use crate::addr::Addr;
use crate::config::Cfg;
use crate::graph::Topology;
use crate::subnet::SubnetSet;
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Error, Write};

/// Opens one output file (`<base><suffix>`) and writes the standard
/// header: version, start time, normalized command line, input files.
pub fn open_output(
    cfg: &Cfg,
    suffix: &str,
    start: &DateTime<Local>,
) -> Result<BufWriter<File>, Error> {
    let name = format!("{}{}", cfg.output_basename, suffix);
    let file = File::create(&name)
        .map_err(|e| Error::new(e.kind(), format!("can't open {}: {}", name, e)))?;
    let mut out = BufWriter::new(file);
    write_header(&mut out, cfg, start)?;
    Ok(out)
}

fn write_file_options(
    out: &mut dyn Write,
    option: char,
    files: &[String],
) -> Result<(), Error> {
    for f in files {
        write!(out, "\n#   -{} {}", option, f)?;
    }
    Ok(())
}

/// Writes the `#`-prefixed header block shared by all output files.
pub fn write_header(
    out: &mut dyn Write,
    cfg: &Cfg,
    start: &DateTime<Local>,
) -> Result<(), Error> {
    writeln!(out, "# version: topo-rs {}", crate::VERSION)?;
    writeln!(
        out,
        "# start time: {} ({})",
        start.timestamp(),
        start.format("%F %T %Z")
    )?;
    write!(out, "# command line: topo{}", cfg.effective_args())?;
    write_file_options(out, 'B', &cfg.bogon_files)?;
    write_file_options(out, 'A', &cfg.alias_files)?;
    write_file_options(out, 'D', &cfg.ttl_files)?;
    write_file_options(out, 'I', &cfg.iface_files)?;
    write_file_options(out, 'P', &cfg.trace_files)?;
    writeln!(out)?;
    writeln!(out, "#")?;
    Ok(())
}

fn keep_iface(topo: &Topology, addr: Addr) -> bool {
    addr.is_named() || topo.ifaces.anon(addr).redundant == Addr::ZERO
}

/// Dumps one line per node: its id and the addresses of its kept
/// interfaces.
pub fn write_aliases(out: &mut dyn Write, topo: &Topology) -> Result<(), Error> {
    let stats = topo.node_stats();
    writeln!(
        out,
        "# found {} nodes, containing {} interfaces ({} redundant (omitted), {} anonymous, {} named).",
        topo.nodes.len(),
        stats.n_ifaces - stats.n_redundant,
        stats.n_redundant,
        stats.n_anon,
        stats.n_named
    )?;
    for (id, node) in topo.nodes.iter() {
        write!(out, "node N{}:  ", id)?;
        for &iface in &node.ifaces {
            if keep_iface(topo, iface) {
                write!(out, "{} ", iface)?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Dumps one line per link: explicit members as `N<node>:<addr>`, implicit
/// members as bare `N<node>`.
pub fn write_links(out: &mut dyn Write, topo: &Topology) -> Result<(), Error> {
    let stats = topo.link_stats();
    writeln!(
        out,
        "# found {} links, containing {} interfaces ({} implicit, {} redundant (omitted), {} anonymous, {} named).",
        topo.links.len(),
        stats.n_ifaces - stats.n_redundant,
        stats.n_implicit,
        stats.n_redundant,
        stats.n_anon,
        stats.n_named
    )?;
    for (id, link) in topo.links.iter() {
        write!(out, "link L{}:  ", id)?;
        for &iface in &link.ifaces {
            if !keep_iface(topo, iface) {
                continue;
            }
            write!(out, "N{}:{} ", topo.ifaces.core(iface).node_id, iface)?;
        }
        for node_id in &link.nodes {
            write!(out, "N{} ", node_id)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_iface_line(
    out: &mut dyn Write,
    topo: &Topology,
    addr: Addr,
) -> Result<(), Error> {
    let core = topo.ifaces.core(addr);
    write!(out, "{}", addr)?;
    if core.node_id != 0 {
        write!(out, " N{}", core.node_id)?;
    }
    if core.link_id != 0 {
        write!(out, " L{}", core.link_id)?;
    }
    if core.seen_as_transit {
        write!(out, " T")?;
    }
    if core.seen_as_dest {
        write!(out, " D")?;
    }
    writeln!(out)?;
    Ok(())
}

/// Dumps every interface with its node, link, and seen-as flags.
pub fn write_ifaces(out: &mut dyn Write, topo: &Topology) -> Result<(), Error> {
    writeln!(out, "# key:")?;
    writeln!(out, "#   N<n> = on Node id <n>")?;
    writeln!(out, "#   L<n> = on Link id <n>")?;
    writeln!(out, "#   T = appeared in a traceroute as a transit hop")?;
    writeln!(out, "#   D = appeared in a traceroute as a destination hop")?;
    writeln!(out, "#")?;
    writeln!(out, "# found {} named interfaces", topo.ifaces.named.len())?;
    for &addr in topo.ifaces.named.keys() {
        write_iface_line(out, topo, addr)?;
    }
    let n_redundant = topo
        .ifaces
        .anon
        .iter()
        .filter(|i| i.redundant != Addr::ZERO)
        .count();
    writeln!(
        out,
        "# found {} anonymous interfaces ({} kept, {} redundant)",
        topo.ifaces.anon.len(),
        topo.ifaces.anon.len() - n_redundant,
        n_redundant
    )?;
    for idx in 0..topo.ifaces.anon.len() {
        let addr = topo.ifaces.anon[idx].core.addr;
        write_iface_line(out, topo, addr)?;
    }
    Ok(())
}

/// Dumps the candidate subnets in rank order, marking the ones used as
/// anchors (CD) and as neighbor subnets (BE).
pub fn write_subnets(
    out: &mut dyn Write,
    topo: &Topology,
    subnets: &SubnetSet,
) -> Result<(), Error> {
    let mut right_nets = 0;
    let mut left_nets = 0;
    for &key in subnets.ranked() {
        let s = subnets.get(key);
        write!(
            out,
            "{}/{} ({} - {}; {}; {})",
            s.addr(),
            s.len,
            s.begin,
            s.last(topo),
            s.completeness,
            s.n_traces
        )?;
        if s.used_right {
            right_nets += 1;
            write!(out, " CD")?;
        }
        if s.used_left {
            left_nets += 1;
            write!(out, " BE")?;
        }
        writeln!(out)?;
    }
    writeln!(out, "# found {} subnets", subnets.len())?;
    writeln!(out, "# found {} CD-nets", right_nets)?;
    writeln!(out, "# found {} BE-nets", left_nets)?;
    Ok(())
}

/// Dumps the observed named addresses (extraction mode).
pub fn write_addrs(out: &mut dyn Write, topo: &Topology) -> Result<(), Error> {
    writeln!(out, "# Observed addresses: {}", topo.ifaces.named.len())?;
    for addr in topo.ifaces.named.keys() {
        writeln!(out, "{}", addr)?;
    }
    Ok(())
}

/// Dumps the addresses missing from the middles of candidate subnets
/// (extraction mode).
pub fn write_missing(out: &mut dyn Write, cfg: &Cfg, mids: &[Addr]) -> Result<(), Error> {
    write!(out, "# Missing ")?;
    if cfg.min_subnet_middle_required < 29 {
        write!(out, "/{} - ", cfg.min_subnet_middle_required)?;
    }
    writeln!(out, "/29 subnet middles: {}", mids.len())?;
    for addr in mids {
        writeln!(out, "{}", addr)?;
    }
    Ok(())
}

/// Writes pending warnings as `#`-prefixed log lines and mirrors them to
/// stderr logging.
pub fn drain_warnings(out: &mut dyn Write, warnings: &mut Vec<String>) -> Result<(), Error> {
    for w in warnings.drain(..) {
        log::warn!("{}", w);
        writeln!(out, "# {}", w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cfg;

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_aliases_format() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let a = addr("1.0.0.1");
        let b = addr("1.0.0.5");
        topo.ifaces.find_or_insert_named(a);
        topo.ifaces.find_or_insert_named(b);
        topo.set_alias(&cfg, a, b);
        let mut out = Vec::new();
        write_aliases(&mut out, &topo).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# found 1 nodes, containing 2 interfaces"));
        assert!(text.contains("node N1:  1.0.0.1 1.0.0.5 "));
    }

    #[test]
    fn test_links_format_with_implicit_node() {
        let cfg = Cfg::default();
        let mut topo = Topology::new();
        let a = addr("1.0.0.1");
        topo.ifaces.find_or_insert_named(a);
        let n1 = topo.nodes.add();
        topo.add_iface_to_node(cfg.n_ttls, n1, a);
        let n2 = topo.nodes.add();
        topo.set_link_node(a, n2);
        let mut out = Vec::new();
        write_links(&mut out, &topo).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("link L1:  N1:1.0.0.1 N2 "));
        assert!(text.contains("1 implicit"));
    }

    #[test]
    fn test_iface_flags() {
        let mut topo = Topology::new();
        let a = addr("1.0.0.1");
        let iface = topo.ifaces.find_or_insert_named(a);
        iface.core.seen_as_transit = true;
        iface.core.seen_as_dest = true;
        let mut out = Vec::new();
        write_ifaces(&mut out, &topo).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1.0.0.1 T D"));
    }

    #[test]
    fn test_header_mentions_command_line() {
        let cfg = Cfg::default();
        let now = Local::now();
        let mut out = Vec::new();
        write_header(&mut out, &cfg, &now).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("# version: topo-rs"));
        assert!(text.contains("# command line: topo -ial"));
        assert!(text.ends_with("#\n"));
    }
}
