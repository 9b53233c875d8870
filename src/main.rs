use chrono::Local;
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Error, Write};
use std::process;

use topo_rs::addr::PrefixSet;
use topo_rs::config::{Cfg, Opts};
use topo_rs::graph::Topology;
use topo_rs::ingest::{Ingest, IngestResult};
use topo_rs::path::PathLoader;
use topo_rs::subnet::find_subnets;
use topo_rs::{alias, input, links, output};

fn main() {
    env_logger::init();
    let opts = Opts::parse();
    if let Err(e) = run(&opts) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn log_node_link_counts(
    log: &mut dyn Write,
    topo: &Topology,
    label: &str,
) -> Result<(), Error> {
    let n = topo.node_stats();
    let l = topo.link_stats();
    writeln!(
        log,
        "# after {}: found {} nodes (max id {}), containing {} interfaces \
         ({} redundant (omitted), {} anonymous, {} named); and {} links \
         (max id {}), containing {} interfaces ({} implicit, {} redundant \
         (omitted), {} anonymous, {} named).",
        label,
        topo.nodes.len(),
        topo.nodes.max_id(),
        n.n_ifaces - n.n_redundant,
        n.n_redundant,
        n.n_anon,
        n.n_named,
        topo.links.len(),
        topo.links.max_id(),
        l.n_ifaces - l.n_redundant,
        l.n_implicit,
        l.n_redundant,
        l.n_anon,
        l.n_named
    )
}

fn run(opts: &Opts) -> Result<(), Error> {
    let mut cfg = Cfg::from_opts(opts)?;
    cfg.bogon_files = input::expand_file_args(&cfg.bogon_files)?;
    cfg.alias_files = input::expand_file_args(&cfg.alias_files)?;
    cfg.iface_files = input::expand_file_args(&cfg.iface_files)?;
    cfg.ttl_files = input::expand_file_args(&cfg.ttl_files)?;
    cfg.trace_files = input::expand_file_args(&cfg.trace_files)?;
    cfg.n_ttls = cfg.ttl_files.len();

    let start = Local::now();
    let mut log = output::open_output(&cfg, ".log", &start)?;

    type Out = Option<BufWriter<File>>;
    let mut out_addrs: Out = None;
    let mut out_missing: Out = None;
    let mut out_aliases: Out = None;
    let mut out_links: Out = None;
    let mut out_ifaces: Out = None;
    let mut out_subnets: Out = None;
    if cfg.mode_extract {
        out_addrs = Some(output::open_output(&cfg, ".addrs", &start)?);
        out_missing = Some(output::open_output(&cfg, ".missing", &start)?);
    } else {
        if cfg.output_aliases {
            out_aliases = Some(output::open_output(&cfg, ".aliases", &start)?);
        }
        if cfg.output_links {
            out_links = Some(output::open_output(&cfg, ".links", &start)?);
        }
        if cfg.output_ifaces {
            out_ifaces = Some(output::open_output(&cfg, ".ifaces", &start)?);
        }
        if cfg.output_subnets {
            out_subnets = Some(output::open_output(&cfg, ".subnets", &start)?);
        }
    }

    // bogons
    let mut bogons = PrefixSet::new();
    bogons.install_std_bogons();
    writeln!(log, "# loaded {} bogons", bogons.len())?;
    if cfg.bogon_files.is_empty() {
        log::warn!("no bogon files specified");
    }
    for f in &cfg.bogon_files {
        writeln!(log, "# loadBogons: {}", f)?;
        let reader = input::open_input(f)?;
        input::load_bogons(&mut bogons, reader, f)?;
        writeln!(log, "# loaded {} bogons", bogons.len())?;
    }

    let mut topo = Topology::new();

    // TTL measurements, one vantage point per file
    for (vantage, f) in cfg.ttl_files.clone().iter().enumerate() {
        writeln!(log, "# loadTTLs {} {}", vantage, f)?;
        input::check_supported(f)?;
        let reader = input::open_input(f)?;
        input::load_ttls(&mut topo, &cfg, &bogons, vantage, reader, f)?;
        output::drain_warnings(&mut log, &mut topo.warnings)?;
        writeln!(
            log,
            "# loaded distances: ifaces={}",
            topo.ifaces.named.len()
        )?;
    }

    // known interfaces
    for f in &cfg.iface_files {
        writeln!(log, "# loadIfaces: {}", f)?;
        let reader = input::open_input(f)?;
        input::load_ifaces(&mut topo, &bogons, reader, f)?;
        writeln!(log, "# loaded {} ifaces", topo.ifaces.named.len())?;
    }

    // known aliases
    for f in cfg.alias_files.clone() {
        writeln!(log, "# loadAliases: {}", f)?;
        let old_nodes = topo.nodes.len();
        let old_ifaces = topo.ifaces.named.len();
        let reader = input::open_input(&f)?;
        let stats = input::load_aliases(&mut topo, &cfg, &bogons, reader, &f, false)?;
        output::drain_warnings(&mut log, &mut topo.warnings)?;
        writeln!(
            log,
            "# loaded aliases: sets={}/{}, good ifaces={}/{}, failed distance={}, failed noLoop={}",
            topo.nodes.len() - old_nodes,
            topo.nodes.len(),
            topo.ifaces.named.len() - old_ifaces,
            topo.ifaces.named.len(),
            stats.n_fail_distance,
            stats.n_fail_noloop
        )?;
    }
    if !cfg.alias_files.is_empty() {
        log_node_link_counts(&mut log, &topo, "loadAliases")?;
    }

    // path traces
    let mut loader = PathLoader::new();
    loader.include_src = cfg.include_src;
    loader.include_dst = cfg.include_dst;
    loader.grep_dst = cfg.grep_dst;
    loader.loop_policy = cfg.loop_policy;
    let IngestResult {
        mut bad_subnets,
        dstlinks,
        stats: _,
    } = {
        let mut ingest = Ingest::new(&mut topo, &cfg, &bogons);
        for f in &cfg.trace_files {
            writeln!(log, "# loadTraces: {}", f)?;
            let reader = input::open_input(f)?;
            let n_traces = loader.load(reader, f, &mut ingest)?;
            output::drain_warnings(&mut log, &mut loader.warnings)?;
            let s = ingest.stats();
            writeln!(
                log,
                "# traces={}/{}/{} loops={} discarded={} namedIfaces={} anon={} uniq_anon={} hops={} anonSegs={}",
                n_traces,
                s.n_good_traces,
                loader.n_raw_traces,
                loader.n_loops,
                loader.n_discarded,
                ingest.named_count(),
                s.n_anon,
                ingest.anon_iface_count(),
                s.n_total_hops,
                ingest.anon_seg_count()
            )?;
            let mem = ingest.storage_summary();
            writeln!(
                log,
                "# named_prev: n={} mem={}",
                s.n_named_prev, mem.mem_named_prev
            )?;
            writeln!(
                log,
                "# named_next: n={} mem={}",
                s.n_named_next, mem.mem_named_next
            )?;
            writeln!(
                log,
                "# anon_prev: n={} mem={}",
                s.n_anon_prev, mem.mem_anon_prev
            )?;
            writeln!(
                log,
                "# TraceIDSets:  0:{} 1:{} 2:{} 3:{} >3:{}",
                mem.idset_hist[0],
                mem.idset_hist[1],
                mem.idset_hist[2],
                mem.idset_hist[3],
                mem.idset_hist[4]
            )?;
            writeln!(
                log,
                "# bad_31_traces={} not_min_mask={} not_min_net={} same_min_net={} badSubnets={}",
                s.n_bad_31_traces,
                s.n_not_min_mask,
                s.n_not_min_net,
                s.n_same_min_net,
                ingest.bad_subnet_count()
            )?;
        }
        // the anonymous-segment index dies with the engine
        ingest.finish()
    };

    if cfg.anon_match {
        let matches = links::match_anonymous_ifaces(&topo);
        writeln!(log, "# found {} redundant anonymous matches", matches)?;
    }

    if cfg.mode_extract {
        if let Some(out) = out_addrs.as_mut() {
            output::write_addrs(out, &topo)?;
        }
        if cfg.min_subnet_middle_required < 30 {
            let mut mids = Vec::new();
            let subnets = find_subnets(&topo, &cfg, &bad_subnets, &mut mids);
            writeln!(log, "# found {} subnets", subnets.len())?;
            if let Some(out) = out_missing.as_mut() {
                output::write_missing(out, &cfg, &mids)?;
            }
        }
        if let Some(out) = out_addrs.as_mut() {
            out.flush()?;
        }
        if let Some(out) = out_missing.as_mut() {
            out.flush()?;
        }
        return log.flush();
    }

    // analysis mode
    let mut subnets = if cfg.infer_aliases || cfg.output_subnets {
        let mut mids = Vec::new();
        let found = find_subnets(&topo, &cfg, &bad_subnets, &mut mids);
        writeln!(log, "# found {} subnets", found.len())?;
        Some(found)
    } else {
        None
    };

    if cfg.infer_aliases {
        if let Some(subnets) = subnets.as_mut() {
            alias::find_aliases(&mut topo, &cfg, subnets, Some(&bad_subnets), false, &mut log)?;
            output::drain_warnings(&mut log, &mut topo.warnings)?;
            log_node_link_counts(&mut log, &topo, "findAliases 1")?;

            // the bad-subnet set is only consulted by the first pass
            bad_subnets.clear();

            alias::find_aliases(&mut topo, &cfg, subnets, None, true, &mut log)?;
            output::drain_warnings(&mut log, &mut topo.warnings)?;
            log_node_link_counts(&mut log, &topo, "findAliases 2")?;
        }
    }

    if cfg.output_subnets {
        if let (Some(out), Some(subnets)) = (out_subnets.as_mut(), subnets.as_ref()) {
            output::write_subnets(out, &topo, subnets)?;
        }
    }

    // the alias stage was the last consumer of the trace-id sets, the
    // candidate subnets, and the next-hop adjacency
    for iface in topo.ifaces.named.values_mut() {
        iface.core.traces.free();
    }
    for iface in topo.ifaces.anon.iter_mut() {
        iface.core.traces.free();
    }
    drop(subnets);
    for iface in topo.ifaces.named.values_mut() {
        iface.next.free();
    }

    if cfg.infer_links {
        links::find_links(&mut topo, &cfg, &dstlinks);
        log_node_link_counts(&mut log, &topo, "findLinks")?;
        links::fix_orphans(&mut topo, &cfg);
        output::drain_warnings(&mut log, &mut topo.warnings)?;
    }

    if cfg.output_aliases {
        if cfg.anon_shared_nodelink {
            links::mark_redundant_anon(&mut topo);
        }
        if let Some(out) = out_aliases.as_mut() {
            output::write_aliases(out, &topo)?;
        }
    }
    if cfg.output_links {
        if let Some(out) = out_links.as_mut() {
            output::write_links(out, &topo)?;
        }
    }
    if cfg.output_ifaces {
        if let Some(out) = out_ifaces.as_mut() {
            output::write_ifaces(out, &topo)?;
        }
    }

    for out in [out_aliases, out_links, out_ifaces, out_subnets].iter_mut() {
        if let Some(out) = out.as_mut() {
            out.flush()?;
        }
    }
    log.flush()
}
