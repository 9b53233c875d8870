use topo_rs::addr::{Addr, ANON_PREFIX};
use topo_rs::config::Cfg;

mod common;
use common::pipeline::analyze;

fn addr(s: &str) -> Addr {
    s.parse().unwrap()
}

const REPEATED: &str = "# trace 1.0: 50.0.0.1 -> 9.9.9.9\n\
                        20.0.0.1\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        20.0.0.9\n\
                        # trace 2.0: 50.0.0.1 -> 9.9.9.8\n\
                        20.0.0.1\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        20.0.0.9\n";

#[test]
fn test_identical_segments_coalesce() {
    let cfg = Cfg::default();
    let run = analyze(&cfg, REPEATED);
    // both traces share the same three synthetic interfaces
    assert_eq!(run.topo.ifaces.anon_count(), 3);
    let first = Addr(ANON_PREFIX | 1);
    assert!(first.is_anon());
    assert_eq!(
        run.topo
            .ifaces
            .anon(first)
            .core
            .traces
            .iter()
            .collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(
        run.topo.ifaces.anon(first).prev.get(0).hop,
        addr("20.0.0.1")
    );
}

const REVERSED: &str = "# trace 1.0: 50.0.0.1 -> 9.9.9.9\n\
                        20.0.0.1\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        20.0.0.9\n\
                        # trace 2.0: 50.0.0.2 -> 9.9.9.8\n\
                        20.0.0.9\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        0.0.0.0\n\
                        20.0.0.1\n";

#[test]
fn test_reversed_segments_stay_distinct() {
    let cfg = Cfg::default();
    let run = analyze(&cfg, REVERSED);
    assert_eq!(run.topo.ifaces.anon_count(), 6);
}

#[test]
fn test_reversed_segments_coalesce_under_bug_compat() {
    let mut cfg = Cfg::default();
    cfg.bug_rev_anondup = true;
    let run = analyze(&cfg, REVERSED);
    assert_eq!(run.topo.ifaces.anon_count(), 3);
}

#[test]
fn test_redundant_anonymous_suppressed_in_output() {
    use topo_rs::links::mark_redundant_anon;

    let cfg = Cfg::default();
    let mut run = analyze(&cfg, REPEATED);
    // put the first synthetic interface on the same node and link as its
    // named neighbor, making it redundant
    let first = Addr(ANON_PREFIX | 1);
    let named = addr("20.0.0.1");
    run.topo.set_alias(&cfg, named, first);
    run.topo.set_link(&cfg, named, first);
    mark_redundant_anon(&mut run.topo);
    assert_eq!(run.topo.ifaces.anon(first).redundant, named);

    let mut out = Vec::new();
    topo_rs::output::write_aliases(&mut out, &run.topo).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(!text.contains("224.0.0.1 "));
    assert!(text.contains("20.0.0.1 "));
}
