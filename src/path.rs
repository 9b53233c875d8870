use crate::addr::Addr;
use crate::config::LoopPolicy;
use crate::input::{base_name, check_supported, plain_name};
use crate::MAXHOPS;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{BufRead, Error, ErrorKind};

/// Consumer of canonicalized traces. The loader trims bad head/tail hops
/// and applies the loop policy; the handler owns the per-hop interface
/// state built by `preprocess_hops`.
pub trait PathHandler {
    /// True when hop `i` should be treated as anonymous: bogus, or the
    /// first half of a length-1 loop.
    fn is_bad_hop(&self, hops: &[Addr], i: usize) -> bool;

    /// True when hops `i` and `j` resolve to the same router (used for loop
    /// detection; dummy hops never match).
    fn hops_are_equal(&self, i: usize, j: usize) -> bool;

    /// Canonicalizes the hops of one trimmed trace into interfaces.
    fn preprocess_hops(&mut self, hops: &[Addr]);

    /// Reports how many bad hops were trimmed from the head and tail.
    fn set_trim(&mut self, bad_head: u32, bad_tail: u32);

    /// Ingests one path. `base` is the offset of `hops[0]` within the
    /// preprocessed trace (non-zero for the tail segment of a split loop).
    /// Returns the number of good paths recorded.
    fn process_hops(&mut self, hops: &[Addr], base: usize, src: Addr, dst: Addr)
        -> Result<u32, Error>;
}

/// A trace that can contain multiple responses at each hop.
struct MultiTrace {
    n_hops: usize,
    src: Addr,
    dst: Addr,
    hops: Vec<Vec<Addr>>,
}

impl MultiTrace {
    fn new() -> MultiTrace {
        MultiTrace {
            n_hops: 0,
            src: Addr::ZERO,
            dst: Addr::ZERO,
            hops: vec![Vec::new(); MAXHOPS],
        }
    }

    fn truncate(&mut self, n: usize) {
        while self.n_hops > n {
            self.n_hops -= 1;
            if self.n_hops < MAXHOPS {
                self.hops[self.n_hops].clear();
            }
        }
    }
}

/// Reads trace files and feeds each canonicalized path to a [`PathHandler`].
///
/// Formats: text (traces delimited by `#` header lines, one hop per line,
/// several space-separated addresses meaning multiple responses) and iPlane
/// binary files (basename `trace.out.*`).
pub struct PathLoader {
    /// Prepend the source address to text traces.
    pub include_src: bool,
    /// Keep the destination hop.
    pub include_dst: bool,
    /// Only use traces toward this destination (zero = all).
    pub grep_dst: Addr,
    /// What to do with traces containing loops.
    pub loop_policy: LoopPolicy,
    /// Loops seen.
    pub n_loops: u32,
    /// Branches expanded from the current raw trace.
    pub n_branches: u32,
    /// Raw traces read.
    pub n_raw_traces: u32,
    /// Traces discarded for loops or bad hop counts.
    pub n_discarded: u32,
    /// Reader diagnostics, drained into the log file by the driver.
    pub warnings: Vec<String>,
    filename: String,
    lineno: u32,
}

impl Default for PathLoader {
    fn default() -> PathLoader {
        PathLoader {
            include_src: true,
            include_dst: true,
            grep_dst: Addr::ZERO,
            loop_policy: LoopPolicy::TruncateBefore,
            n_loops: 0,
            n_branches: 0,
            n_raw_traces: 0,
            n_discarded: 0,
            warnings: Vec::new(),
            filename: String::new(),
            lineno: 0,
        }
    }
}

impl PathLoader {
    /// Creates a loader with default policies.
    pub fn new() -> PathLoader {
        PathLoader::default()
    }

    /// Loads one trace file, dispatching on its name. Returns the number of
    /// good paths handed to the handler.
    pub fn load<R: BufRead>(
        &mut self,
        reader: R,
        path: &str,
        handler: &mut dyn PathHandler,
    ) -> Result<u32, Error> {
        check_supported(path)?;
        self.filename = path.to_string();
        self.lineno = 0;
        if base_name(plain_name(path)).starts_with("trace.out.") {
            self.load_iplane(reader, handler)
        } else {
            self.load_text(reader, handler)
        }
    }

    fn syntax_error(&self, msg: &str) -> Error {
        Error::new(
            ErrorKind::InvalidData,
            format!("{}:{}: {}", self.filename, self.lineno, msg),
        )
    }

    fn load_text<R: BufRead>(
        &mut self,
        reader: R,
        handler: &mut dyn PathHandler,
    ) -> Result<u32, Error> {
        let mut mtrace = MultiTrace::new();
        let mut n_traces = 0;
        for line in reader.lines() {
            let line = line?;
            self.lineno += 1;
            if line.starts_with('#') {
                self.n_raw_traces += 1;
                self.n_branches = 0;
                if mtrace.n_hops > 0 {
                    n_traces += self.process_multi(handler, &mtrace)?;
                }
                mtrace.truncate(0);
                // header format: "# trace 1.0: 129.186.1.240 -> 80.236.223.170"
                let endpoints = line.find(':').map(|i| &line[i + 1..]).and_then(|rest| {
                    let mut parts = rest.splitn(2, " -> ");
                    match (parts.next(), parts.next()) {
                        (Some(s), Some(d)) => Some((s.trim().to_string(), d.trim().to_string())),
                        _ => None,
                    }
                });
                match endpoints {
                    Some((s, d)) => {
                        mtrace.src = s
                            .parse()
                            .map_err(|e: Error| self.syntax_error(&e.to_string()))?;
                        mtrace.dst = d
                            .parse()
                            .map_err(|e: Error| self.syntax_error(&e.to_string()))?;
                    }
                    None => {
                        mtrace.src = Addr::ZERO;
                        mtrace.dst = Addr::ZERO;
                    }
                }
            } else {
                if mtrace.n_hops < MAXHOPS {
                    for token in line.split_whitespace() {
                        let addr: Addr = token
                            .parse()
                            .map_err(|e: Error| self.syntax_error(&e.to_string()))?;
                        let hop = &mut mtrace.hops[mtrace.n_hops];
                        if !hop.contains(&addr) {
                            hop.push(addr);
                        }
                    }
                }
                mtrace.n_hops += 1;
            }
        }
        if mtrace.n_hops > 0 {
            n_traces += self.process_multi(handler, &mtrace)?;
        }
        Ok(n_traces)
    }

    fn process_multi(
        &mut self,
        handler: &mut dyn PathHandler,
        mtrace: &MultiTrace,
    ) -> Result<u32, Error> {
        if mtrace.n_hops > MAXHOPS {
            self.warnings.push(format!(
                "{}:{}: hop count {} outside range [1,{}]",
                self.filename, self.lineno, mtrace.n_hops, MAXHOPS
            ));
            self.n_branches += 1;
            self.n_discarded += 1;
            return Ok(0);
        }
        let mut n_hops = mtrace.n_hops;
        let mut comb: u64 = 1;
        let mut maxuniq = 0;
        const UNIQ_LIMIT: usize = 3;
        for i in 0..mtrace.n_hops {
            let uniq = mtrace.hops[i].len();
            if uniq > UNIQ_LIMIT {
                self.warnings.push(format!(
                    "multiresponse at {} -> {}: {} unique responses at hop {}, truncating",
                    mtrace.src,
                    mtrace.dst,
                    uniq,
                    i + 1
                ));
                // can't trust this or later hops
                n_hops = i;
                break;
            }
            maxuniq = maxuniq.max(uniq);
            comb *= uniq as u64;
        }
        if maxuniq > 1 {
            self.warnings.push(format!(
                "multiresponse at {} -> {}: {} max unique responses, {} combinatorial paths.",
                mtrace.src, mtrace.dst, maxuniq, comb
            ));
        }
        if comb > 10 {
            self.warnings.push("ignoring multiresponse path".to_string());
            return Ok(0);
        }
        let mut hops = vec![Addr::ZERO; MAXHOPS + 1];
        let mut hoff = 0;
        if self.include_src {
            hops[hoff] = mtrace.src;
            hoff += 1;
        }
        self.process_multi_tail(handler, mtrace, n_hops, &mut hops, hoff, 0)
    }

    fn process_multi_tail(
        &mut self,
        handler: &mut dyn PathHandler,
        mtrace: &MultiTrace,
        n_hops: usize,
        hops: &mut Vec<Addr>,
        hoff: usize,
        moff: usize,
    ) -> Result<u32, Error> {
        let mut n_traces = 0;
        let mut hoff = hoff;
        let mut moff = moff;
        loop {
            if moff == n_hops {
                // end of trace
                return Ok(n_traces
                    + self.process_trace(handler, &hops[..hoff], mtrace.src, mtrace.dst)?);
            }
            // Because a trace may contain multiple responses at the same hop,
            // every address at this hop is tried with the remaining tail.
            let responses = &mtrace.hops[moff];
            let mut advanced = false;
            for (hi, &hop) in responses.iter().enumerate() {
                if hop == mtrace.dst {
                    hops[hoff] = hop;
                    let used = if self.include_dst { hoff + 1 } else { hoff };
                    n_traces += self.process_trace(handler, &hops[..used], mtrace.src, mtrace.dst)?;
                    continue;
                }
                hops[hoff] = hop;
                if hi == responses.len() - 1 {
                    moff += 1;
                    hoff += 1;
                    advanced = true;
                    break;
                } else {
                    n_traces +=
                        self.process_multi_tail(handler, mtrace, n_hops, hops, hoff + 1, moff + 1)?;
                }
            }
            if !advanced {
                return Ok(n_traces);
            }
        }
    }

    /// Runs one expanded path through trimming, loop handling, and the
    /// handler.
    pub fn process_trace(
        &mut self,
        handler: &mut dyn PathHandler,
        hops: &[Addr],
        src: Addr,
        dst: Addr,
    ) -> Result<u32, Error> {
        if self.grep_dst != Addr::ZERO && dst != self.grep_dst {
            return Ok(0);
        }
        self.n_branches += 1;

        if hops.is_empty() || hops.len() > MAXHOPS {
            self.warnings.push(format!(
                "{}:{}: hop count {} outside range [1,{}]",
                self.filename,
                self.lineno,
                hops.len(),
                MAXHOPS
            ));
            self.n_discarded += 1;
            return Ok(0);
        }

        // discard trailing, then leading, bad hops
        let mut hops = hops;
        let mut bad_tail = 0;
        while hops.len() > 1 && handler.is_bad_hop(hops, hops.len() - 1) {
            bad_tail += 1;
            hops = &hops[..hops.len() - 1];
        }
        let mut bad_head = 0;
        while hops.len() > 1 && handler.is_bad_hop(hops, 0) {
            bad_head += 1;
            hops = &hops[1..];
        }
        handler.set_trim(bad_head, bad_tail);

        handler.preprocess_hops(hops);

        // check for loops
        let mut n = hops.len();
        'scan: for i in 0..n.saturating_sub(1) {
            for j in (i + 1..n).rev() {
                if hops[i] != Addr::ZERO && handler.hops_are_equal(i, j) {
                    self.n_loops += 1;
                    match self.loop_policy {
                        LoopPolicy::Discard => {
                            self.n_discarded += 1;
                            return Ok(0);
                        }
                        LoopPolicy::Split => {
                            // keep the segments before and after the loop
                            let before = handler.process_hops(&hops[..i + 1], 0, src, dst)?;
                            let after = handler.process_hops(&hops[j..], j, src, dst)?;
                            return Ok(before + after);
                        }
                        LoopPolicy::TruncateBefore => {
                            n = i + 1;
                            break 'scan;
                        }
                    }
                }
            }
        }

        handler.process_hops(&hops[..n], 0, src, dst)
    }

    fn load_iplane<R: BufRead>(
        &mut self,
        mut reader: R,
        handler: &mut dyn PathHandler,
    ) -> Result<u32, Error> {
        let mut n_traces = 0;
        'records: loop {
            // record header: client id, unique id, destination count, length
            match reader.read_i32::<LittleEndian>() {
                Ok(_) => {}
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if reader.read_i32::<LittleEndian>().is_err() {
                self.warn_incomplete();
                break;
            }
            let sz = match reader.read_i32::<LittleEndian>() {
                Ok(v) => v,
                Err(_) => {
                    self.warn_incomplete();
                    break;
                }
            };
            if reader.read_i32::<LittleEndian>().is_err() {
                self.warn_incomplete();
                break;
            }
            for _ in 0..sz {
                // addresses are stored in network byte order
                let dst = match reader.read_u32::<BigEndian>() {
                    Ok(v) => Addr(v),
                    Err(_) => {
                        self.warn_incomplete();
                        break 'records;
                    }
                };
                let n_hops = match reader.read_i32::<LittleEndian>() {
                    Ok(v) if v >= 0 => v as usize,
                    _ => {
                        self.warn_incomplete();
                        break 'records;
                    }
                };
                let mut hops = Vec::with_capacity(n_hops.min(MAXHOPS));
                for _ in 0..n_hops {
                    let ip = match reader.read_u32::<BigEndian>() {
                        Ok(v) => Addr(v),
                        Err(_) => {
                            self.warn_incomplete();
                            break 'records;
                        }
                    };
                    hops.push(ip);
                    let _rtt = match reader.read_f32::<LittleEndian>() {
                        Ok(v) => v,
                        Err(_) => {
                            self.warn_incomplete();
                            break 'records;
                        }
                    };
                    let ttl = match reader.read_i32::<LittleEndian>() {
                        Ok(v) => v,
                        Err(_) => {
                            self.warn_incomplete();
                            break 'records;
                        }
                    };
                    if ttl > 512 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("{}: possibly corrupted", self.filename),
                        ));
                    }
                }
                self.n_raw_traces += 1;
                self.n_branches = 0;
                let mut n = hops.len();
                if !self.include_dst && n > 0 && hops[n - 1] == dst {
                    n -= 1;
                }
                n_traces += self.process_trace(handler, &hops[..n], Addr::ZERO, dst)?;
            }
        }
        Ok(n_traces)
    }

    fn warn_incomplete(&mut self) {
        self.warnings
            .push(format!("warning: {}: incomplete", self.filename));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Records every path it is handed, canonicalization-free.
    struct Recorder {
        paths: Vec<(Vec<Addr>, Addr, Addr)>,
        equal_pairs: Vec<(usize, usize)>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                paths: Vec::new(),
                equal_pairs: Vec::new(),
            }
        }
    }

    impl PathHandler for Recorder {
        fn is_bad_hop(&self, hops: &[Addr], i: usize) -> bool {
            hops[i] == Addr::ZERO
        }
        fn hops_are_equal(&self, i: usize, j: usize) -> bool {
            self.equal_pairs.contains(&(i, j))
        }
        fn preprocess_hops(&mut self, _hops: &[Addr]) {}
        fn set_trim(&mut self, _bad_head: u32, _bad_tail: u32) {}
        fn process_hops(
            &mut self,
            hops: &[Addr],
            _base: usize,
            src: Addr,
            dst: Addr,
        ) -> Result<u32, Error> {
            self.paths.push((hops.to_vec(), src, dst));
            Ok(1)
        }
    }

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_text_single_trace() {
        let text = "# trace 1.0: 1.0.0.1 -> 9.0.0.9\n1.0.0.2\n1.0.0.3\n";
        let mut loader = PathLoader::new();
        let mut rec = Recorder::new();
        let n = loader
            .load(Cursor::new(text), "paths.txt", &mut rec)
            .unwrap();
        assert_eq!(n, 1);
        // source prepended, both hops kept
        assert_eq!(
            rec.paths[0].0,
            vec![addr("1.0.0.1"), addr("1.0.0.2"), addr("1.0.0.3")]
        );
        assert_eq!(rec.paths[0].1, addr("1.0.0.1"));
        assert_eq!(rec.paths[0].2, addr("9.0.0.9"));
    }

    #[test]
    fn test_text_destination_hop_handling() {
        let text = "# t: 1.0.0.1 -> 9.0.0.9\n1.0.0.2\n9.0.0.9\n";
        let mut loader = PathLoader::new();
        loader.include_dst = false;
        let mut rec = Recorder::new();
        loader.load(Cursor::new(text), "p.txt", &mut rec).unwrap();
        assert_eq!(rec.paths[0].0, vec![addr("1.0.0.1"), addr("1.0.0.2")]);
    }

    #[test]
    fn test_multiresponse_expansion() {
        // two responses at hop 2 expand into two paths
        let text = "# t: 1.0.0.1 -> 9.0.0.9\n1.0.0.2\n2.0.0.1 2.0.0.2\n3.0.0.1\n";
        let mut loader = PathLoader::new();
        let mut rec = Recorder::new();
        let n = loader.load(Cursor::new(text), "p.txt", &mut rec).unwrap();
        assert_eq!(n, 2);
        assert_eq!(rec.paths[0].0[2], addr("2.0.0.1"));
        assert_eq!(rec.paths[1].0[2], addr("2.0.0.2"));
        assert_eq!(rec.paths[0].0[3], addr("3.0.0.1"));
        assert!(loader
            .warnings
            .iter()
            .any(|w| w.contains("2 max unique responses")));
    }

    #[test]
    fn test_multiresponse_limit() {
        let text = "# t: 1.0.0.1 -> 9.0.0.9\n\
                    2.0.0.1 2.0.0.2\n3.0.0.1 3.0.0.2\n4.0.0.1 4.0.0.2\n5.0.0.1 5.0.0.2\n";
        let mut loader = PathLoader::new();
        let mut rec = Recorder::new();
        let n = loader.load(Cursor::new(text), "p.txt", &mut rec).unwrap();
        // 16 combinatorial paths exceed the limit of 10
        assert_eq!(n, 0);
        assert!(loader
            .warnings
            .iter()
            .any(|w| w.contains("ignoring multiresponse path")));
    }

    #[test]
    fn test_loop_truncate_and_discard() {
        let hops = vec![
            addr("1.0.0.1"),
            addr("2.0.0.1"),
            addr("3.0.0.1"),
            addr("2.0.0.1"),
        ];
        let mut loader = PathLoader::new();
        let mut rec = Recorder::new();
        rec.equal_pairs.push((1, 3));
        loader
            .process_trace(&mut rec, &hops, Addr::ZERO, addr("9.0.0.9"))
            .unwrap();
        assert_eq!(loader.n_loops, 1);
        assert_eq!(rec.paths[0].0, vec![addr("1.0.0.1"), addr("2.0.0.1")]);

        let mut loader = PathLoader::new();
        loader.loop_policy = LoopPolicy::Discard;
        let mut rec = Recorder::new();
        rec.equal_pairs.push((1, 3));
        let n = loader
            .process_trace(&mut rec, &hops, Addr::ZERO, addr("9.0.0.9"))
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(loader.n_discarded, 1);
    }

    #[test]
    fn test_loop_split() {
        let hops = vec![
            addr("1.0.0.1"),
            addr("2.0.0.1"),
            addr("3.0.0.1"),
            addr("2.0.0.1"),
            addr("4.0.0.1"),
        ];
        let mut loader = PathLoader::new();
        loader.loop_policy = LoopPolicy::Split;
        let mut rec = Recorder::new();
        rec.equal_pairs.push((1, 3));
        let n = loader
            .process_trace(&mut rec, &hops, Addr::ZERO, addr("9.0.0.9"))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(rec.paths[0].0, vec![addr("1.0.0.1"), addr("2.0.0.1")]);
        assert_eq!(rec.paths[1].0, vec![addr("2.0.0.1"), addr("4.0.0.1")]);
    }

    #[test]
    fn test_trim_bad_hops() {
        // leading and trailing zero hops are trimmed before processing
        let hops = vec![Addr::ZERO, addr("2.0.0.1"), addr("3.0.0.1"), Addr::ZERO];
        let mut loader = PathLoader::new();
        let mut rec = Recorder::new();
        loader
            .process_trace(&mut rec, &hops, Addr::ZERO, addr("9.0.0.9"))
            .unwrap();
        assert_eq!(rec.paths[0].0, vec![addr("2.0.0.1"), addr("3.0.0.1")]);
    }

    #[test]
    fn test_grep_dst_filter() {
        let mut loader = PathLoader::new();
        loader.grep_dst = addr("9.9.9.9");
        let mut rec = Recorder::new();
        let n = loader
            .process_trace(&mut rec, &[addr("1.0.0.1")], Addr::ZERO, addr("8.8.8.8"))
            .unwrap();
        assert_eq!(n, 0);
        assert!(rec.paths.is_empty());
    }

    #[test]
    fn test_iplane_records() {
        // one record, one destination, two hops
        let mut data = Vec::new();
        for v in &[7i32, 1, 1, 0] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        data.extend_from_slice(&u32::from(std::net::Ipv4Addr::new(9, 0, 0, 9)).to_be_bytes());
        data.extend_from_slice(&2i32.to_le_bytes());
        for hop in &["5.0.0.1", "5.0.0.2"] {
            let ip: std::net::Ipv4Addr = hop.parse().unwrap();
            data.extend_from_slice(&u32::from(ip).to_be_bytes());
            data.extend_from_slice(&1.5f32.to_le_bytes());
            data.extend_from_slice(&3i32.to_le_bytes());
        }
        let mut loader = PathLoader::new();
        let mut rec = Recorder::new();
        let n = loader
            .load(Cursor::new(data), "trace.out.mon1", &mut rec)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(rec.paths[0].0, vec![addr("5.0.0.1"), addr("5.0.0.2")]);
        assert_eq!(rec.paths[0].2, addr("9.0.0.9"));
    }
}
