#[allow(dead_code)]
pub mod pipeline {
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use topo_rs::addr::PrefixSet;
    use topo_rs::alias::find_aliases;
    use topo_rs::config::Cfg;
    use topo_rs::graph::Topology;
    use topo_rs::ingest::{DstPair, Ingest};
    use topo_rs::links::{find_links, fix_orphans, mark_redundant_anon};
    use topo_rs::path::PathLoader;
    use topo_rs::subnet::{find_subnets, SubnetSet};

    /// Everything a finished analysis run leaves behind.
    pub struct Run {
        pub topo: Topology,
        pub subnets: SubnetSet,
        pub bad_subnets: PrefixSet,
        pub dstlinks: BTreeSet<DstPair>,
        pub n_good_traces: u32,
    }

    /// Runs the whole pipeline over an in-memory text trace file, in the
    /// order the binary sequences it: ingestion, subnet inference, both
    /// alias passes, link completion.
    pub fn analyze(cfg: &Cfg, text: &str) -> Run {
        let mut bogons = PrefixSet::new();
        bogons.install_std_bogons();

        let mut topo = Topology::new();
        let mut loader = PathLoader::new();
        loader.include_src = cfg.include_src;
        loader.include_dst = cfg.include_dst;
        loader.grep_dst = cfg.grep_dst;
        loader.loop_policy = cfg.loop_policy;

        let result = {
            let mut ingest = Ingest::new(&mut topo, cfg, &bogons);
            loader
                .load(Cursor::new(text), "paths.txt", &mut ingest)
                .expect("trace file parses");
            ingest.finish()
        };

        let mut mids = Vec::new();
        let mut subnets = find_subnets(&topo, cfg, &result.bad_subnets, &mut mids);
        let mut log = Vec::new();
        if cfg.infer_aliases {
            find_aliases(
                &mut topo,
                cfg,
                &mut subnets,
                Some(&result.bad_subnets),
                false,
                &mut log,
            )
            .unwrap();
            find_aliases(&mut topo, cfg, &mut subnets, None, true, &mut log).unwrap();
        }
        if cfg.infer_links {
            find_links(&mut topo, cfg, &result.dstlinks);
            fix_orphans(&mut topo, cfg);
        }
        if cfg.anon_shared_nodelink {
            mark_redundant_anon(&mut topo);
        }

        Run {
            topo,
            subnets,
            bad_subnets: result.bad_subnets,
            dstlinks: result.dstlinks,
            n_good_traces: result.stats.n_good_traces,
        }
    }
}
