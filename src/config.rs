use crate::addr::Addr;
use crate::{MIN_COMPLETENESS, MIN_SUBNET_LEN};
use clap::Parser;
use std::io::{Error, ErrorKind};

/// What to do with a trace containing a routing loop.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoopPolicy {
    /// Drop the whole trace.
    Discard,
    /// Keep only the hops before the loop.
    TruncateBefore,
    /// Keep the segments before and after the loop as separate paths.
    Split,
}

/// Command-line options. The single-letter surface mirrors the classic
/// APAR-style tools so existing batch scripts keep working.
#[derive(Parser, Debug)]
#[command(
    name = "topo",
    version,
    about = "Resolve IPv4 interface aliases and links from traceroute paths \
             using a modified APAR algorithm."
)]
pub struct Opts {
    /// Which inferences to make: any combination of 'a' (aliases) and 'l'
    /// (links). Omitting 'a' is still useful when aliases are loaded with -A.
    #[arg(short = 'i', value_name = "WHAT", default_value = "al")]
    pub infer: String,

    /// How to check the neighboring subnet during alias inference:
    /// 'l' length only, "vl" verification and length, "il" inference and
    /// length, "ir" inference and rank.
    #[arg(short = 's', value_name = "HOW", default_value = "ir")]
    pub subnet_check: String,

    /// Minimum completeness for subnet inference.
    #[arg(short = 'c', value_name = "FRAC", default_value_t = MIN_COMPLETENESS)]
    pub min_completeness: f32,

    /// How to check the subnet implied by a neighboring alias: 'n' no
    /// check, 'v' verification.
    #[arg(short = 'n', value_name = "HOW", default_value = "v")]
    pub neighbor_check: String,

    /// Subnet ranking: "30" ranks /30 above /31, "31" the reverse.
    #[arg(short = 'r', value_name = "LEN", default_value = "31")]
    pub rank: String,

    /// Anonymous interface handling: 'i' ignore, 'd' coalesce duplicate
    /// segments, 'm' match 3-hop sequences, 's' mark shared-node-and-link
    /// interfaces redundant.
    #[arg(short = 'a', value_name = "HOW", default_value = "dms")]
    pub anon: String,

    /// Middle-address requirement for inferred subnets: 'r' required,
    /// "29" required for /29 and larger, 'n' not required.
    #[arg(short = 'm', value_name = "HOW")]
    pub middle: Option<String>,

    /// Loop handling: 'd' discard trace, 'b' keep the part before the
    /// loop, "ba" keep the parts before and after.
    #[arg(short = 'l', value_name = "HOW", default_value = "b")]
    pub loops: String,

    /// Length-1 loop handling: 'a' treat the first appearance as
    /// anonymous, 'l' treat as an ordinary loop.
    #[arg(short = '1', value_name = "HOW", default_value = "a")]
    pub oneloop: String,

    /// What loaded TTLs rule out: 's' inferred subnets, 'i' inferred
    /// aliases, 'l' loaded aliases.
    #[arg(short = 't', value_name = "WHAT", default_value = "si")]
    pub ttl_rules: String,

    /// Mark a subnet as non-point-to-point when a larger subnet is used:
    /// 'y' or 'n'.
    #[arg(short = 'p', value_name = "YN", default_value = "y")]
    pub mark_non_p2p: String,

    /// What to output: any combination of 'a' (aliases), 'l' (links),
    /// 'i' (interfaces), 's' (subnets).
    #[arg(short = 'o', value_name = "WHAT", default_value = "al")]
    pub output: String,

    /// Only infer subnets with at least this prefix length.
    #[arg(short = 'z', value_name = "LEN", default_value_t = MIN_SUBNET_LEN)]
    pub min_subnet_len: u8,

    /// Require loaded alias pairs to share a prefix of this length.
    #[arg(short = 'X', value_name = "LEN", default_value_t = 0)]
    pub shared_prefix: u8,

    /// Make negative inferences for aliases absent from the -A files.
    #[arg(short = 'N')]
    pub negative_alias: bool,

    /// Base name for output files.
    #[arg(short = 'O', value_name = "BASE", default_value = "topo")]
    pub output_base: String,

    /// Destination addresses: '0' exclude, '1' include but never use in
    /// alias inference.
    #[arg(short = 'd', value_name = "01")]
    pub include_dst: Option<String>,

    /// Only use traces to this destination.
    #[arg(short = 'g', value_name = "ADDR")]
    pub grep_dst: Option<String>,

    /// Emulate historical defects: 'a' reversed anonymous coalescing,
    /// 'p' pprev iteration, 'r' old rank comparison, 'b' skip broadcast
    /// check, 'l' anonymous B-E links, 'd' swapped destination pairs.
    #[arg(short = 'b', value_name = "BUGS", default_value = "")]
    pub bugs: String,

    /// Address extraction mode: dump observed addresses (and missing
    /// subnet middles) instead of inferring topology.
    #[arg(short = 'x')]
    pub extract: bool,

    /// Bogon prefix files (CIDR per line).
    #[arg(short = 'B', value_name = "FILE", num_args = 1..)]
    pub bogon_files: Vec<String>,

    /// Known-alias files ("<addr> <addr>" per line).
    #[arg(short = 'A', value_name = "FILE", num_args = 1..)]
    pub alias_files: Vec<String>,

    /// Known-interface files (one address per line).
    #[arg(short = 'I', value_name = "FILE", num_args = 1..)]
    pub iface_files: Vec<String>,

    /// TTL measurement files ("<addr> <ttl>" per line), one vantage point
    /// per file.
    #[arg(short = 'D', value_name = "FILE", num_args = 1..)]
    pub ttl_files: Vec<String>,

    /// Path trace files (text, or iPlane "trace.out.*").
    #[arg(short = 'P', value_name = "FILE", num_args = 1..)]
    pub trace_files: Vec<String>,
}

/// The resolved run configuration, produced from [`Opts`] after validation
/// and list-file expansion.
pub struct Cfg {
    /// Bogon prefix files.
    pub bogon_files: Vec<String>,
    /// Known-alias files.
    pub alias_files: Vec<String>,
    /// Known-interface files.
    pub iface_files: Vec<String>,
    /// TTL files, one vantage point each.
    pub ttl_files: Vec<String>,
    /// Path trace files.
    pub trace_files: Vec<String>,
    /// Number of TTL vantage points (= number of TTL files).
    pub n_ttls: usize,
    /// Smallest prefix length for which subnet middles are required
    /// (32 disables the requirement).
    pub min_subnet_middle_required: u8,
    /// Minimum inferred subnet prefix length.
    pub min_subnet_len: u8,
    /// Rank /30 subnets above /31.
    pub s30_beats_s31: bool,
    /// TTL distance rules out inferred subnets.
    pub ttl_beats_subnet: bool,
    /// TTL distance rules out inferred aliases.
    pub ttl_beats_inferred_alias: bool,
    /// TTL distance rules out loaded aliases.
    pub ttl_beats_loaded_alias: bool,
    /// Verify the subnet implied by a neighboring alias.
    pub alias_subnet_verify: bool,
    /// Mark subnets non-point-to-point when a larger subnet is used.
    pub mark_non_p2p: bool,
    /// Negative inferences for pairs absent from loaded aliases.
    pub negative_alias: bool,
    /// Neighbor subnets must pass accuracy/distance verification.
    pub subnet_verify: bool,
    /// Neighbor subnets must be inferred candidates.
    pub subnet_inference: bool,
    /// Neighbor subnets must be at least as long as the anchor.
    pub subnet_len: bool,
    /// Neighbor subnets must not rank below the anchor.
    pub subnet_rank: bool,
    /// Treat the first hop of a length-1 loop as anonymous.
    pub oneloop_anon: bool,
    /// Coalesce reversed anonymous segments too.
    pub bug_rev_anondup: bool,
    /// Iterate pre-previous hops detached from their previous hop.
    pub bug_pprev: bool,
    /// Compare subnet ranks with the address order.
    pub bug_rank: bool,
    /// Skip the broadcast scan when verifying implied B-E subnets.
    pub bug_broadcast: bool,
    /// Infer whole-prefix B-E links even with anonymous endpoints.
    pub bug_be_link: bool,
    /// Order destination-link pairs numerically instead of by hop order.
    pub bug_swap_dstlink: bool,
    /// Ignore anonymous interfaces entirely.
    pub anon_ignore: bool,
    /// Coalesce identical anonymous segments.
    pub anon_dups: bool,
    /// Match anonymous 3-hop sequences against named ones.
    pub anon_match: bool,
    /// Mark anonymous interfaces sharing node and link as redundant.
    pub anon_shared_nodelink: bool,
    /// Address extraction mode.
    pub mode_extract: bool,
    /// Run alias inference.
    pub infer_aliases: bool,
    /// Run link inference.
    pub infer_links: bool,
    /// Write the .aliases file.
    pub output_aliases: bool,
    /// Write the .links file.
    pub output_links: bool,
    /// Write the .ifaces file.
    pub output_ifaces: bool,
    /// Write the .subnets file.
    pub output_subnets: bool,
    /// Prepend the source address to text traces.
    pub include_src: bool,
    /// Keep destination hops.
    pub include_dst: bool,
    /// Trace-id sets are needed by some later stage.
    pub need_traceids: bool,
    /// Base name for output files.
    pub output_basename: String,
    /// Required shared prefix length for loaded alias pairs (0 = none).
    pub shared_prefix_len: u8,
    /// Minimum completeness for inferred subnets.
    pub min_completeness: f32,
    /// Only use traces to this destination (zero = all).
    pub grep_dst: Addr,
    /// Loop handling policy.
    pub loop_policy: LoopPolicy,
}

impl Default for Cfg {
    fn default() -> Cfg {
        Cfg {
            bogon_files: Vec::new(),
            alias_files: Vec::new(),
            iface_files: Vec::new(),
            ttl_files: Vec::new(),
            trace_files: Vec::new(),
            n_ttls: 0,
            min_subnet_middle_required: 32,
            min_subnet_len: MIN_SUBNET_LEN,
            s30_beats_s31: false,
            ttl_beats_subnet: true,
            ttl_beats_inferred_alias: true,
            ttl_beats_loaded_alias: false,
            alias_subnet_verify: true,
            mark_non_p2p: true,
            negative_alias: false,
            subnet_verify: false,
            subnet_inference: true,
            subnet_len: false,
            subnet_rank: true,
            oneloop_anon: true,
            bug_rev_anondup: false,
            bug_pprev: false,
            bug_rank: false,
            bug_broadcast: false,
            bug_be_link: false,
            bug_swap_dstlink: false,
            anon_ignore: false,
            anon_dups: true,
            anon_match: true,
            anon_shared_nodelink: true,
            mode_extract: false,
            infer_aliases: true,
            infer_links: true,
            output_aliases: true,
            output_links: true,
            output_ifaces: false,
            output_subnets: false,
            include_src: true,
            include_dst: true,
            need_traceids: true,
            output_basename: "topo".to_string(),
            shared_prefix_len: 0,
            min_completeness: MIN_COMPLETENESS,
            grep_dst: Addr::ZERO,
            loop_policy: LoopPolicy::TruncateBefore,
        }
    }
}

fn bad_option(flag: char, value: &str) -> Error {
    Error::new(
        ErrorKind::InvalidInput,
        format!("invalid option -{} {}", flag, value),
    )
}

fn flag_chars(flag: char, value: &str, allowed: &str) -> Result<Vec<char>, Error> {
    if value.chars().all(|c| allowed.contains(c)) {
        Ok(value.chars().collect())
    } else {
        Err(bad_option(flag, value))
    }
}

impl Cfg {
    /// Validates the raw options and resolves them into a configuration.
    /// File lists are taken verbatim; `@`-list expansion happens when the
    /// files are opened.
    pub fn from_opts(opts: &Opts) -> Result<Cfg, Error> {
        let mut cfg = Cfg::default();

        let infer = flag_chars('i', &opts.infer, "al")?;
        cfg.infer_aliases = infer.contains(&'a');
        cfg.infer_links = infer.contains(&'l');

        let s = flag_chars('s', &opts.subnet_check, "vilr")?;
        cfg.subnet_verify = s.contains(&'v');
        cfg.subnet_inference = s.contains(&'i');
        cfg.subnet_len = s.contains(&'l');
        cfg.subnet_rank = s.contains(&'r');
        if (cfg.subnet_len && cfg.subnet_rank) || (cfg.subnet_verify && cfg.subnet_inference) {
            return Err(bad_option('s', &opts.subnet_check));
        }

        cfg.min_completeness = opts.min_completeness;

        match opts.neighbor_check.as_str() {
            "n" => cfg.alias_subnet_verify = false,
            "v" => cfg.alias_subnet_verify = true,
            _ => return Err(bad_option('n', &opts.neighbor_check)),
        }

        match opts.rank.as_str() {
            "30" => cfg.s30_beats_s31 = true,
            "31" => cfg.s30_beats_s31 = false,
            _ => return Err(bad_option('r', &opts.rank)),
        }

        let a = flag_chars('a', &opts.anon, "idms")?;
        cfg.anon_ignore = a.contains(&'i');
        cfg.anon_dups = a.contains(&'d');
        cfg.anon_match = a.contains(&'m');
        cfg.anon_shared_nodelink = a.contains(&'s');
        if cfg.anon_ignore && (cfg.anon_dups || cfg.anon_match || cfg.anon_shared_nodelink) {
            return Err(bad_option('a', &opts.anon));
        }

        let t = flag_chars('t', &opts.ttl_rules, "sil")?;
        cfg.ttl_beats_subnet = t.contains(&'s');
        cfg.ttl_beats_inferred_alias = t.contains(&'i');
        cfg.ttl_beats_loaded_alias = t.contains(&'l');

        match opts.mark_non_p2p.as_str() {
            "y" => cfg.mark_non_p2p = true,
            "n" => cfg.mark_non_p2p = false,
            _ => return Err(bad_option('p', &opts.mark_non_p2p)),
        }

        let b = flag_chars('b', &opts.bugs, "aprbld")?;
        cfg.bug_rev_anondup = b.contains(&'a');
        cfg.bug_pprev = b.contains(&'p');
        cfg.bug_rank = b.contains(&'r');
        cfg.bug_broadcast = b.contains(&'b');
        cfg.bug_be_link = b.contains(&'l');
        cfg.bug_swap_dstlink = b.contains(&'d');

        cfg.mode_extract = opts.extract;
        cfg.min_subnet_len = opts.min_subnet_len;
        cfg.shared_prefix_len = opts.shared_prefix;
        cfg.negative_alias = opts.negative_alias;

        match opts.include_dst.as_deref() {
            None => cfg.include_dst = !cfg.mode_extract,
            Some("0") => cfg.include_dst = false,
            Some("1") => cfg.include_dst = true,
            Some(other) => return Err(bad_option('d', other)),
        }

        cfg.min_subnet_middle_required = match opts.middle.as_deref() {
            None => {
                if cfg.mode_extract {
                    29
                } else {
                    32
                }
            }
            Some("n") => 32,
            Some("29") => 29,
            Some("r") => cfg.min_subnet_len,
            Some(other) => return Err(bad_option('m', other)),
        };

        cfg.loop_policy = match opts.loops.as_str() {
            "d" => LoopPolicy::Discard,
            "b" => LoopPolicy::TruncateBefore,
            "ba" => LoopPolicy::Split,
            other => return Err(bad_option('l', other)),
        };

        let one = flag_chars('1', &opts.oneloop, "al")?;
        for c in one {
            cfg.oneloop_anon = c == 'a';
        }

        let o = flag_chars('o', &opts.output, "alis")?;
        cfg.output_aliases = o.contains(&'a');
        cfg.output_links = o.contains(&'l');
        cfg.output_ifaces = o.contains(&'i');
        cfg.output_subnets = o.contains(&'s');

        cfg.output_basename = opts.output_base.clone();

        cfg.grep_dst = match &opts.grep_dst {
            Some(s) => s.parse()?,
            None => Addr::ZERO,
        };

        if cfg.mode_extract {
            cfg.infer_aliases = false;
            cfg.infer_links = false;
        }
        if cfg.bug_rank && cfg.subnet_rank {
            cfg.subnet_len = true;
        }

        cfg.bogon_files = opts.bogon_files.clone();
        cfg.alias_files = opts.alias_files.clone();
        cfg.iface_files = opts.iface_files.clone();
        cfg.ttl_files = opts.ttl_files.clone();
        cfg.trace_files = opts.trace_files.clone();
        cfg.n_ttls = cfg.ttl_files.len();

        cfg.need_traceids = cfg.infer_aliases
            || cfg.output_subnets
            || !cfg.alias_files.is_empty()
            || cfg.min_subnet_middle_required < 30;

        Ok(cfg)
    }

    /// Reconstructs the normalized flag string written into output headers.
    pub fn effective_args(&self) -> String {
        let mut out = String::new();
        if self.mode_extract {
            out.push_str(" -x");
        } else {
            out.push_str(" -i");
            if self.infer_aliases {
                out.push('a');
            }
            if self.infer_links {
                out.push('l');
            }
            let bugs = [
                (self.bug_rev_anondup, 'a'),
                (self.bug_pprev, 'p'),
                (self.bug_rank, 'r'),
                (self.bug_broadcast, 'b'),
                (self.bug_be_link, 'l'),
                (self.bug_swap_dstlink, 'd'),
            ];
            if bugs.iter().any(|(on, _)| *on) {
                out.push_str(" -b");
                for (on, c) in &bugs {
                    if *on {
                        out.push(*c);
                    }
                }
            }
            if self.grep_dst != Addr::ZERO {
                out.push_str(&format!(" -g{}", self.grep_dst));
            }
            out.push_str(if self.mark_non_p2p { " -py" } else { " -pn" });
            if !self.ttl_files.is_empty() {
                out.push_str(" -t");
                if self.ttl_beats_subnet {
                    out.push('s');
                }
                if self.ttl_beats_inferred_alias {
                    out.push('i');
                }
                if self.ttl_beats_loaded_alias {
                    out.push('l');
                }
            }
            out.push_str(if self.s30_beats_s31 { " -r30" } else { " -r31" });
            out.push_str(" -s");
            if self.subnet_verify {
                out.push('v');
            }
            if self.subnet_inference {
                out.push('i');
            }
            if self.subnet_len {
                out.push('l');
            }
            if self.subnet_rank {
                out.push('r');
            }
            out.push_str(&format!(" -c{}", self.min_completeness));
            out.push_str(if self.alias_subnet_verify { " -nv" } else { " -nn" });
            out.push_str(" -a");
            if self.anon_ignore {
                out.push('i');
            }
            if self.anon_dups {
                out.push('d');
            }
            if self.anon_match {
                out.push('m');
            }
            if self.anon_shared_nodelink {
                out.push('s');
            }
        }
        out.push_str(if self.include_dst { " -d1" } else { " -d0" });
        out.push_str(" -m");
        if self.min_subnet_middle_required == self.min_subnet_len {
            out.push('r');
        } else if self.min_subnet_middle_required == 32 {
            out.push('n');
        } else {
            out.push_str(&self.min_subnet_middle_required.to_string());
        }
        out.push_str(match self.loop_policy {
            LoopPolicy::Discard => " -ld",
            LoopPolicy::TruncateBefore => " -lb",
            LoopPolicy::Split => " -lba",
        });
        out.push_str(if self.oneloop_anon { " -1a" } else { " -1l" });
        if !self.mode_extract {
            out.push_str(" -o");
            if self.output_aliases {
                out.push('a');
            }
            if self.output_links {
                out.push('l');
            }
            if self.output_ifaces {
                out.push('i');
            }
            if self.output_subnets {
                out.push('s');
            }
        }
        out.push_str(&format!(" -O {}", self.output_basename));
        if self.shared_prefix_len != 0 {
            out.push_str(&format!(" -X {}", self.shared_prefix_len));
        }
        out.push_str(&format!(" -z {}", self.min_subnet_len));
        if self.negative_alias {
            out.push_str(" -N");
        }
        out
    }
}
