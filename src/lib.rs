#![deny(missing_docs)]

//! The `topo-rs` crate infers an IPv4 router-level topology from large
//! collections of traceroute paths: alias sets (interfaces belonging to one
//! router), links (interfaces sharing a medium), and the candidate subnets
//! supporting them, using a heavily modified variant of the APAR algorithm
//! over aggregated trace data.
//!
//! # Examples
//!
//! ## Inferring subnets from a text trace
//! ```
//! use std::io::Cursor;
//! use topo_rs::addr::PrefixSet;
//! use topo_rs::config::Cfg;
//! use topo_rs::graph::Topology;
//! use topo_rs::ingest::Ingest;
//! use topo_rs::path::PathLoader;
//! use topo_rs::subnet::find_subnets;
//!
//! let trace = "# trace 1.0: 1.0.0.1 -> 9.0.0.9\n5.0.0.1\n5.0.0.2\n";
//!
//! let cfg = Cfg::default();
//! let mut bogons = PrefixSet::new();
//! bogons.install_std_bogons();
//!
//! let mut topo = Topology::new();
//! let mut loader = PathLoader::new();
//! let result = {
//!     let mut ingest = Ingest::new(&mut topo, &cfg, &bogons);
//!     loader
//!         .load(Cursor::new(trace), "paths.txt", &mut ingest)
//!         .unwrap();
//!     ingest.finish()
//! };
//!
//! let mut mids = Vec::new();
//! let subnets = find_subnets(&topo, &cfg, &result.bad_subnets, &mut mids);
//! assert_eq!(subnets.len(), 1); // 5.0.0.0/30
//! ```

/// Address and prefix primitives, and prefix sets (bogons, bad subnets).
pub mod addr;
/// Modified APAR alias inference.
pub mod alias;
/// Run configuration and the command-line surface.
pub mod config;
/// Node and link tables with merge semantics.
pub mod graph;
/// Compact append-only sets of trace ids.
pub mod idset;
/// The interface tables.
pub mod iface;
/// Trace ingestion: canonicalization, bad subnets, adjacency.
pub mod ingest;
/// Input files: decompression, list expansion, auxiliary loaders.
pub mod input;
/// Link completion, orphan repair, redundant anonymous interfaces.
pub mod links;
/// Output files and record formats.
pub mod output;
/// Trace file readers and per-trace preflight.
pub mod path;
/// Path segments and sorted small adjacency vectors.
pub mod seg;
/// Candidate subnet inference and ranking.
pub mod subnet;
/// Per-vantage TTL vectors.
pub mod ttl;

pub use crate::addr::{Addr, NetPrefix, PrefixSet};
pub use crate::config::Cfg;
pub use crate::graph::Topology;

/// Crate version, recorded in output file headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest trace accepted, in hops.
pub const MAXHOPS: usize = 90;

/// Default minimum candidate subnet prefix length.
pub const MIN_SUBNET_LEN: u8 = 24;

/// Default minimum candidate subnet completeness.
pub const MIN_COMPLETENESS: f32 = 0.5;

/// Widest acceptable TTL spread within a subnet or alias set.
pub const MAX_DISTANCE: i16 = 1;
