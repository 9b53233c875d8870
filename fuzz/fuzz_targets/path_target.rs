#![cfg_attr(feature = "libfuzzer_fuzz", no_main)]

#[cfg(feature = "libfuzzer_fuzz")]
#[macro_use]
extern crate libfuzzer_sys;

use std::io::Cursor;
use topo_rs::config::Cfg;
use topo_rs::ingest::Ingest;
use topo_rs::path::PathLoader;
use topo_rs::{PrefixSet, Topology};

fn run_path_data(data: &[u8]) {
    let cfg = Cfg::default();
    let mut bogons = PrefixSet::new();
    bogons.install_std_bogons();
    let mut topo = Topology::new();
    let mut loader = PathLoader::new();
    let mut ingest = Ingest::new(&mut topo, &cfg, &bogons);
    let _ = loader.load(Cursor::new(data), "fuzz.txt", &mut ingest);
}

#[cfg(feature = "libfuzzer_fuzz")]
fuzz_target!(|data: &[u8]| {
    run_path_data(data);
});

#[cfg(feature = "afl_fuzz")]
fn main() {
    afl::read_stdio_bytes(run_path_data);
}

#[cfg(feature = "honggfuzz_fuzz")]
fn main() {
    loop {
        honggfuzz::fuzz!(|data: &[u8]| {
            run_path_data(data);
        });
    }
}

#[cfg(not(any(
    feature = "libfuzzer_fuzz",
    feature = "afl_fuzz",
    feature = "honggfuzz_fuzz"
)))]
fn main() {}
