use crate::addr::{Addr, NetPrefix, PrefixSet};
use crate::config::Cfg;
use crate::graph::Topology;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Error, ErrorKind, Read};

/// Opens an input file, transparently decompressing `.gz` and `.bz2`.
pub fn open_input(path: &str) -> Result<Box<dyn BufRead>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::new(e.kind(), format!("can't open {}: {}", path, e)))?;
    let reader: Box<dyn Read> = if path.ends_with(".gz") {
        Box::new(GzDecoder::new(file))
    } else if path.ends_with(".bz2") {
        Box::new(BzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// The filename with any `.gz`/`.bz2` suffix removed, for format sniffing.
pub fn plain_name(path: &str) -> &str {
    path.trim_end_matches(".gz").trim_end_matches(".bz2")
}

/// The basename of a path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Expands `@`-prefixed list-file arguments: `@list` is replaced by the
/// filenames it contains, one per line.
pub fn expand_file_args(names: &[String]) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    for name in names {
        if let Some(list) = name.strip_prefix('@') {
            let reader = open_input(list)?;
            for line in reader.lines() {
                let line = line?;
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
            }
        } else {
            out.push(name.clone());
        }
    }
    Ok(out)
}

fn syntax_error(name: &str, lineno: u32, msg: &str) -> Error {
    Error::new(
        ErrorKind::InvalidData,
        format!("{}:{}: {}", name, lineno, msg),
    )
}

/// Loads bogon prefixes in `<addr>/<len>` form into `set`, keeping only the
/// largest covering prefixes.
pub fn load_bogons<R: BufRead>(set: &mut PrefixSet, reader: R, name: &str) -> Result<(), Error> {
    let mut lineno = 0;
    for line in reader.lines() {
        let line = line?;
        lineno += 1;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let mut parts = text.splitn(2, '/');
        let addr_str = parts.next().unwrap_or("");
        let len_str = parts.next().ok_or_else(|| {
            syntax_error(name, lineno, "syntax error; expected \"<IPaddr>/<len>\"")
        })?;
        let addr: Addr = addr_str
            .parse()
            .map_err(|e: Error| syntax_error(name, lineno, &e.to_string()))?;
        let len: u8 = match len_str.trim().parse() {
            Ok(l) if l <= 32 => l,
            _ => {
                return Err(syntax_error(
                    name,
                    lineno,
                    &format!("invalid prefix length \"{}\"", len_str),
                ));
            }
        };
        set.install(addr, len);
    }
    Ok(())
}

/// Loads known interfaces, one address per line; bogus addresses are
/// skipped.
pub fn load_ifaces<R: BufRead>(
    topo: &mut Topology,
    bogons: &PrefixSet,
    reader: R,
    name: &str,
) -> Result<u32, Error> {
    let mut lineno = 0;
    let mut n = 0;
    for line in reader.lines() {
        let line = line?;
        lineno += 1;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        if text.split_whitespace().count() != 1 {
            return Err(syntax_error(name, lineno, "syntax error; expected \"<IPaddr>\""));
        }
        let addr: Addr = text
            .parse()
            .map_err(|e: Error| syntax_error(name, lineno, &e.to_string()))?;
        if bogons.contains_addr(addr) {
            continue;
        }
        topo.ifaces.find_or_insert_named(addr);
        n += 1;
    }
    Ok(n)
}

/// Counters from one alias-file load.
#[derive(Default, Debug, PartialEq)]
pub struct AliasLoadStats {
    /// Pairs rejected by the TTL distance condition.
    pub n_fail_distance: u32,
    /// Pairs rejected by the no-loop condition.
    pub n_fail_noloop: u32,
}

/// Loads already-known alias pairs (`<addr> <addr>` per line). Both
/// addresses become pre-aliased interfaces; the merge is subject to the
/// distance and no-loop conditions and the optional shared-prefix length.
pub fn load_aliases<R: BufRead>(
    topo: &mut Topology,
    cfg: &Cfg,
    bogons: &PrefixSet,
    reader: R,
    name: &str,
    have_traces: bool,
) -> Result<AliasLoadStats, Error> {
    let mut lineno = 0;
    let mut stats = AliasLoadStats::default();
    for line in reader.lines() {
        let line = line?;
        lineno += 1;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(syntax_error(
                name,
                lineno,
                "syntax error; expected \"<IPaddr> <IPaddr>\"",
            ));
        }
        let mut pair = [Addr::ZERO; 2];
        let mut bogus = false;
        for (i, field) in fields.iter().enumerate() {
            let addr: Addr = field
                .parse()
                .map_err(|e: Error| syntax_error(name, lineno, &e.to_string()))?;
            if bogons.contains_addr(addr) {
                bogus = true;
                break;
            }
            pair[i] = addr;
            topo.ifaces.find_or_insert_named(addr).pre_aliased = true;
        }
        if bogus {
            continue;
        }
        if cfg.ttl_beats_loaded_alias
            && cfg.n_ttls > 0
            && !topo.alias_distance_ok(cfg.n_ttls, pair[0], pair[1])
        {
            stats.n_fail_distance += 1;
        } else if have_traces && !topo.alias_no_loop(pair[0], pair[1]) {
            stats.n_fail_noloop += 1;
        } else if cfg.shared_prefix_len == 0
            || crate::addr::same_prefix(pair[0], pair[1], cfg.shared_prefix_len)
        {
            topo.set_alias(cfg, pair[0], pair[1]);
        }
    }
    Ok(stats)
}

/// Loads TTL measurements for one vantage point (text lines of
/// `<addr> <ttl>`). Conflicting measurements invalidate the entry with a
/// warning pushed onto the topology's warning list. Binary ping captures
/// are not supported.
pub fn load_ttls<R: BufRead>(
    topo: &mut Topology,
    cfg: &Cfg,
    bogons: &PrefixSet,
    vantage: usize,
    reader: R,
    name: &str,
) -> Result<(), Error> {
    let mut lineno = 0;
    for line in reader.lines() {
        let line = line?;
        lineno += 1;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(syntax_error(
                name,
                lineno,
                "syntax error; expected \"<IPaddr> <TTL>\"",
            ));
        }
        let addr: Addr = fields[0]
            .parse()
            .map_err(|e: Error| syntax_error(name, lineno, &e.to_string()))?;
        let ttl: u16 = match fields[1].parse() {
            Ok(t) if t <= 255 => t,
            _ => {
                return Err(syntax_error(
                    name,
                    lineno,
                    &format!("invalid TTL \"{}\"", fields[1]),
                ));
            }
        };
        update_ttl(topo, cfg, bogons, vantage, addr, ttl as u8);
    }
    Ok(())
}

/// Records one TTL measurement, invalidating the entry on conflicting
/// values.
pub fn update_ttl(
    topo: &mut Topology,
    cfg: &Cfg,
    bogons: &PrefixSet,
    vantage: usize,
    addr: Addr,
    ttl: u8,
) {
    if bogons.contains_addr(addr) {
        return;
    }
    let n = cfg.n_ttls;
    let iface = topo.ifaces.find_or_insert_named(addr);
    if iface.ttl.is_set(n, vantage) && !iface.ttl.is_valid(n, vantage) {
        topo.warnings
            .push(format!("warning: ignoring TTL {} for {}", ttl, addr));
    } else if iface.ttl.is_set(n, vantage) && iface.ttl.get(n, vantage) != i16::from(ttl) {
        let old = iface.ttl.get(n, vantage);
        iface.ttl.invalidate(n, vantage);
        topo.warnings.push(format!(
            "warning: invalidating TTL for {} ({} != {})",
            addr, old, ttl
        ));
    } else {
        iface.ttl.set(n, vantage, ttl);
    }
}

/// Rejects file formats that would need the scamper library.
pub fn check_supported(path: &str) -> Result<(), Error> {
    if plain_name(path).ends_with(".warts") {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "{}: warts input requires the scamper library, which this \
                 build does not include",
                path
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cfg;
    use std::io::Cursor;

    #[test]
    fn test_load_bogons() {
        let mut set = PrefixSet::new();
        let data = "# comment\n10.0.0.0/8\n\n192.0.2.0/24\n";
        load_bogons(&mut set, Cursor::new(data), "bogons.txt").unwrap();
        assert!(set.contains_addr(Addr::new(10, 9, 9, 9)));
        assert!(set.contains_addr(Addr::new(192, 0, 2, 77)));
        assert!(!set.contains_addr(Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_load_bogons_syntax_error() {
        let mut set = PrefixSet::new();
        let err = load_bogons(&mut set, Cursor::new("10.0.0.0\n"), "b.txt").unwrap_err();
        assert!(err.to_string().contains("b.txt:1"));
    }

    #[test]
    fn test_load_ifaces_skips_bogus() {
        let mut topo = Topology::new();
        let mut bogons = PrefixSet::new();
        bogons.install_std_bogons();
        let data = "8.8.8.8\n10.0.0.1\n1.2.3.4\n";
        let n = load_ifaces(&mut topo, &bogons, Cursor::new(data), "i.txt").unwrap();
        assert_eq!(n, 2);
        assert_eq!(topo.ifaces.named.len(), 2);
    }

    #[test]
    fn test_load_aliases_merges() {
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        let bogons = PrefixSet::new();
        let data = "1.0.0.1 1.0.0.5\n";
        let stats =
            load_aliases(&mut topo, &cfg, &bogons, Cursor::new(data), "a.txt", false).unwrap();
        assert_eq!(stats, AliasLoadStats::default());
        let a = Addr::new(1, 0, 0, 1);
        let b = Addr::new(1, 0, 0, 5);
        assert!(topo.are_known_aliases(a, b));
        assert!(topo.ifaces.named(a).unwrap().pre_aliased);
    }

    #[test]
    fn test_load_aliases_noloop_rejects() {
        let mut topo = Topology::new();
        let cfg = Cfg::default();
        let bogons = PrefixSet::new();
        let a = Addr::new(1, 0, 0, 1);
        let b = Addr::new(1, 0, 0, 5);
        topo.ifaces.find_or_insert_named(a).core.traces.append(7);
        topo.ifaces.find_or_insert_named(b).core.traces.append(7);
        let stats =
            load_aliases(&mut topo, &cfg, &bogons, Cursor::new("1.0.0.1 1.0.0.5\n"), "a", true)
                .unwrap();
        assert_eq!(stats.n_fail_noloop, 1);
        assert!(!topo.are_known_aliases(a, b));
    }

    #[test]
    fn test_update_ttl_conflict_invalidates() {
        let mut topo = Topology::new();
        let mut cfg = Cfg::default();
        cfg.n_ttls = 1;
        let bogons = PrefixSet::new();
        let a = Addr::new(1, 0, 0, 1);
        update_ttl(&mut topo, &cfg, &bogons, 0, a, 60);
        update_ttl(&mut topo, &cfg, &bogons, 0, a, 61);
        assert_eq!(topo.ifaces.named(a).unwrap().ttl.get(1, 0), -2);
        update_ttl(&mut topo, &cfg, &bogons, 0, a, 60);
        assert_eq!(topo.ifaces.named(a).unwrap().ttl.get(1, 0), -2);
        assert_eq!(topo.warnings.len(), 2);
    }

    #[test]
    fn test_expand_keeps_plain_names() {
        let names = vec!["a.txt".to_string(), "b.txt".to_string()];
        assert_eq!(expand_file_args(&names).unwrap(), names);
    }

    #[test]
    fn test_warts_rejected() {
        assert!(check_supported("foo.warts").is_err());
        assert!(check_supported("foo.warts.gz").is_err());
        assert!(check_supported("foo.txt").is_ok());
    }
}
