use topo_rs::addr::Addr;
use topo_rs::config::Cfg;
use topo_rs::output;
use topo_rs::subnet::find_subnets;

mod common;
use common::pipeline::analyze;

fn addr(s: &str) -> Addr {
    s.parse().unwrap()
}

#[test]
fn test_destination_link() {
    // the reached destination is remembered as a pair and becomes an
    // implicit link between the two routers
    let text = "# trace 1.0: 50.0.0.1 -> 20.9.0.9\n\
                20.1.0.1\n\
                20.9.0.9\n";
    let cfg = Cfg::default();
    let run = analyze(&cfg, text);

    assert_eq!(run.dstlinks.len(), 1);
    let pair = run.dstlinks.iter().next().unwrap();
    assert_eq!(pair.addr, [addr("20.1.0.1"), addr("20.9.0.9")]);
    assert!(run.topo.ifaces.core(addr("20.9.0.9")).seen_as_dest);

    let n_pen = run.topo.ifaces.core(addr("20.1.0.1")).node_id;
    let n_dst = run.topo.ifaces.core(addr("20.9.0.9")).node_id;
    assert_ne!(n_pen, 0);
    assert_ne!(n_dst, 0);
    let found = run
        .topo
        .links
        .iter()
        .any(|(_, l)| l.nodes.contains(&n_pen) && l.nodes.contains(&n_dst));
    assert!(found);
}

#[test]
fn test_destinations_excluded_without_d1() {
    let text = "# trace 1.0: 50.0.0.1 -> 20.9.0.9\n\
                20.1.0.1\n\
                20.9.0.9\n";
    let mut cfg = Cfg::default();
    cfg.include_dst = false;
    let run = analyze(&cfg, text);
    assert_eq!(run.dstlinks.len(), 0);
    assert!(run.topo.ifaces.named(addr("20.9.0.9")).is_none());
}

#[test]
fn test_extraction_outputs() {
    // extraction mode: observed addresses plus the missing middles of
    // candidate subnets
    let text = "# trace 1.0: 50.0.0.1 -> 9.9.9.9\n\
                20.0.0.1\n\
                30.0.0.1\n\
                # trace 2.0: 50.0.0.1 -> 9.9.9.8\n\
                20.0.0.2\n\
                30.0.0.2\n\
                # trace 3.0: 50.0.0.1 -> 9.9.9.7\n\
                20.0.0.6\n\
                30.0.0.3\n";
    let mut cfg = Cfg::default();
    cfg.mode_extract = true;
    cfg.infer_aliases = false;
    cfg.infer_links = false;
    cfg.include_dst = false;
    cfg.min_subnet_middle_required = 29;
    let run = analyze(&cfg, text);

    let mut addrs_out = Vec::new();
    output::write_addrs(&mut addrs_out, &run.topo).unwrap();
    let text_out = String::from_utf8(addrs_out).unwrap();
    assert!(text_out.starts_with("# Observed addresses: 7\n"));
    assert!(text_out.contains("\n20.0.0.1\n"));
    assert!(text_out.contains("\n50.0.0.1\n"));

    // 20.0.0.0/29 has .1, .2, .6 but neither middle address .3 nor .4
    let mut mids = Vec::new();
    find_subnets(&run.topo, &cfg, &run.bad_subnets, &mut mids);
    assert!(mids.contains(&addr("20.0.0.3")));
    assert!(mids.contains(&addr("20.0.0.4")));
    let mut missing_out = Vec::new();
    output::write_missing(&mut missing_out, &cfg, &mids).unwrap();
    let text_out = String::from_utf8(missing_out).unwrap();
    assert!(text_out.starts_with("# Missing /29 subnet middles:"));
}

#[test]
fn test_deterministic_output() {
    let text = "# trace 1.0: 20.0.0.12 -> 9.9.9.9\n\
                20.0.0.10\n\
                20.0.0.1\n\
                # trace 2.0: 50.0.0.1 -> 9.9.9.8\n\
                20.0.0.2\n\
                20.0.0.12\n\
                # trace 3.0: 50.0.0.1 -> 20.9.0.9\n\
                20.1.0.1\n\
                0.0.0.0\n\
                20.9.0.9\n";
    let render = || {
        let cfg = Cfg::default();
        let run = analyze(&cfg, text);
        let mut out = Vec::new();
        output::write_aliases(&mut out, &run.topo).unwrap();
        output::write_links(&mut out, &run.topo).unwrap();
        output::write_ifaces(&mut out, &run.topo).unwrap();
        output::write_subnets(&mut out, &run.topo, &run.subnets).unwrap();
        String::from_utf8(out).unwrap()
    };
    let first = render();
    let second = render();
    assert_eq!(first, second);
    // spot-check the record shapes
    assert!(first.contains("node N"));
    assert!(first.contains("link L"));
    assert!(first.contains(" CD"));
}
