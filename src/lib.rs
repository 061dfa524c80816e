//! latgen: online, lattice-generating Viterbi beam-search decoding.
//!
//! This crate provides the search core of a WFST speech recognizer: it
//! advances frame by frame through acoustic scores, keeps a beam-pruned
//! token network indexed by frame, and recovers word lattices or the single
//! best path by tracing back through the surviving tokens.
//!
//! # Architecture
//!
//! The decoder is built around three collaborator traits:
//!
//! - [`Graph`]: read-only access to the decoding WFST
//! - [`Decodable`]: per-frame acoustic log-likelihoods
//! - [`DeterministicLm`]: optional LM-diff graph for on-the-fly rescoring,
//!   applied through [`ComposedGraph`]
//!
//! Feature extraction, neural-network evaluation, and WFST preparation all
//! live behind those seams; the crate owns only the search.
//!
//! # Quick Start
//!
//! ```ignore
//! use latgen::{DecoderConfig, LatticeDecoder, MatrixDecodable};
//!
//! let graph = build_decoding_graph()?;
//! let mut decoder = LatticeDecoder::new(graph, DecoderConfig::default())?;
//!
//! // Streaming: feed frames as they arrive.
//! decoder.init_decoding();
//! let mut decodable = MatrixDecodable::new(loglikes);
//! decoder.advance_decoding(&mut decodable, None);
//! decoder.finalize_decoding();
//!
//! let lattice = decoder.get_raw_lattice(true)?;
//! let best = decoder.get_best_path(true)?;
//! ```

mod active;
pub mod compose;
pub mod config;
pub mod decodable;
pub mod decoder;
pub mod error;
pub mod graph;
pub mod lattice;
mod pool;

pub use compose::{ComposedGraph, DeterministicLm, LmArc};
pub use config::DecoderConfig;
pub use decodable::{Decodable, MatrixDecodable};
pub use decoder::{BestPathIterator, LatticeDecoder};
pub use error::{Error, Result};
pub use graph::{Arc, Graph, Label, StateId, VectorGraph, EPSILON};
pub use lattice::{Lattice, LatticeArc, LatticeStateId, LatticeWeight};
