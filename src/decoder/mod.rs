//! The online lattice-generating beam-search decoder.
//!
//! [`LatticeDecoder`] advances frame by frame through an acoustic
//! [`Decodable`], expanding a [`Graph`] under an adaptive beam and keeping a
//! frame-indexed token network from which lattices and best paths are traced
//! back after pruning. The implementation is split across submodules:
//! `search` holds the per-frame expansion, `prune` the lattice-beam
//! back-pruning, `traceback` the lattice and best-path extraction.

mod prune;
mod search;
mod traceback;

pub use traceback::BestPathIterator;

use std::collections::HashMap;

use tracing::debug;

use crate::active::{ActiveSet, ElemId};
use crate::config::DecoderConfig;
use crate::decodable::Decodable;
use crate::error::Result;
use crate::graph::{Arc, Graph, StateId};
use crate::pool::{LinkId, TokenId, TokenPool};

/// One slot of the token network: the tokens alive at one frame, plus the
/// dirty flags that drive incremental back-pruning.
#[derive(Debug)]
struct FrameSlot {
    head: TokenId,
    must_prune_forward_links: bool,
    must_prune_tokens: bool,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            head: TokenId::NONE,
            must_prune_forward_links: true,
            must_prune_tokens: true,
        }
    }
}

/// Online Viterbi beam-search decoder producing word lattices.
///
/// The decoder owns its graph oracle; pass a reference if the graph is
/// shared between decoders. One instance decodes one utterance at a time:
/// [`init_decoding`](LatticeDecoder::init_decoding) resets all state, and
/// instances are freely reusable across utterances.
///
/// ```
/// use latgen::{Arc, DecoderConfig, LatticeDecoder, MatrixDecodable, VectorGraph};
/// use ndarray::array;
///
/// let mut graph = VectorGraph::new();
/// let s0 = graph.add_state();
/// let s1 = graph.add_state();
/// graph.add_arc(s0, Arc::new(1, 42, 0.0, s1));
/// graph.set_final(s1, 0.0);
///
/// let mut decoder = LatticeDecoder::new(graph, DecoderConfig::default())?;
/// let mut decodable = MatrixDecodable::new(array![[0.0]]);
///
/// assert!(decoder.decode(&mut decodable));
/// let best = decoder.get_best_path(true)?;
/// let words: Vec<u32> = best.path().unwrap().0.iter().map(|a| a.olabel).collect();
/// assert_eq!(words, [0, 42]);
/// # Ok::<(), latgen::Error>(())
/// ```
pub struct LatticeDecoder<G> {
    graph: G,
    config: DecoderConfig,

    pool: TokenPool,
    /// State-to-token index for the most recent frame.
    active: ActiveSet,
    token_net: Vec<FrameSlot>,

    /// Work queue of the non-emitting expansion.
    queue: Vec<StateId>,
    /// Scratch buffer of token costs for cutoff selection.
    tmp_costs: Vec<f32>,
    /// Scratch buffer of the arcs of the state being expanded.
    arc_buf: Vec<Arc>,

    cost_offsets: Vec<f32>,
    num_toks: usize,
    warned: bool,

    /// Set once `finalize_decoding` has run; decoding further is forbidden
    /// and the three fields below hold the cached final costs.
    decoding_finalized: bool,
    final_costs: HashMap<TokenId, f32>,
    final_relative_cost: f32,
    final_best_cost: f32,
}

impl<G: Graph> LatticeDecoder<G> {
    /// Create a decoder over `graph`, validating `config`.
    pub fn new(graph: G, config: DecoderConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            graph,
            config,
            pool: TokenPool::new(),
            active: ActiveSet::new(1000),
            token_net: Vec::new(),
            queue: Vec::new(),
            tmp_costs: Vec::new(),
            arc_buf: Vec::new(),
            cost_offsets: Vec::new(),
            num_toks: 0,
            warned: false,
            decoding_finalized: false,
            final_costs: HashMap::new(),
            final_relative_cost: f32::INFINITY,
            final_best_cost: f32::INFINITY,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Number of acoustic frames consumed so far.
    pub fn num_frames_decoded(&self) -> usize {
        self.token_net.len().saturating_sub(1)
    }

    /// Prepare for a new utterance, discarding any previous token network.
    pub fn init_decoding(&mut self) {
        // Clean up from last time.
        let stale = self.active.clear();
        self.release_elems(stale);
        self.clear_token_net();
        self.num_toks = 0;
        self.cost_offsets.clear();
        self.warned = false;
        self.decoding_finalized = false;
        self.final_costs.clear();

        let start_state = self
            .graph
            .start()
            .expect("decoding graph has no start state");
        self.token_net.push(FrameSlot::new());
        let start_tok =
            self.pool
                .new_token(0.0, 0.0, LinkId::NONE, TokenId::NONE, TokenId::NONE);
        self.token_net[0].head = start_tok;
        self.active.insert(start_state, start_tok);
        self.num_toks += 1;

        self.process_nonemitting(self.config.beam);
    }

    /// Decode the whole utterance: init, advance to the last frame, finalize.
    ///
    /// Returns true if any kind of traceback is available (not necessarily
    /// from a final state; query [`reached_final`](LatticeDecoder::reached_final)
    /// for that). A false return indicates an unusual search collapse.
    pub fn decode<D: Decodable>(&mut self, decodable: &mut D) -> bool {
        self.init_decoding();
        while !decodable.is_last_frame(self.num_frames_decoded() as isize - 1) {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_token_net(self.config.lattice_beam * self.config.prune_scale);
            }
            let cost_cutoff = self.process_emitting(decodable);
            self.process_nonemitting(cost_cutoff);
        }
        self.finalize_decoding();
        !self.token_net.is_empty() && !self.token_net.last().unwrap().head.is_none()
    }

    /// Consume frames from `decodable` as they become ready.
    ///
    /// Processes at most `max_num_frames` frames (all ready frames if
    /// `None`), then returns, so the caller can interleave decoding with
    /// feeding input. Requires a prior [`init_decoding`](LatticeDecoder::init_decoding);
    /// must not be called after [`finalize_decoding`](LatticeDecoder::finalize_decoding).
    pub fn advance_decoding<D: Decodable>(
        &mut self,
        decodable: &mut D,
        max_num_frames: Option<usize>,
    ) {
        assert!(
            !self.token_net.is_empty(),
            "init_decoding() must be called before advance_decoding()"
        );
        assert!(
            !self.decoding_finalized,
            "advance_decoding() is forbidden after finalize_decoding()"
        );
        let num_frames_ready = decodable.num_frames_ready();
        // The number of ready frames may not decrease, and the decodable
        // object may not change between calls.
        assert!(
            num_frames_ready >= self.num_frames_decoded(),
            "decodable reports fewer frames ready than already decoded"
        );
        let mut target = num_frames_ready;
        if let Some(max) = max_num_frames {
            target = target.min(self.num_frames_decoded() + max);
        }
        while self.num_frames_decoded() < target {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_token_net(self.config.lattice_beam * self.config.prune_scale);
            }
            let cost_cutoff = self.process_emitting(decodable);
            self.process_nonemitting(cost_cutoff);
        }
    }

    /// Take final costs into account and run the terminal pruning sweep.
    ///
    /// Optional: lattices may be requested mid-utterance without it. After
    /// this call, decoding further is forbidden. Calling it a second time
    /// has no additional effect.
    pub fn finalize_decoding(&mut self) {
        if self.decoding_finalized {
            return;
        }
        let end_time = self.num_frames_decoded();
        let num_toks_begin = self.num_toks;

        // Prunes the final frame using the final-probs and sets
        // `decoding_finalized`.
        self.prune_forward_links_final();
        for t in (0..end_time).rev() {
            // A delta of zero means the extra costs must always propagate.
            self.prune_forward_links(t, 0.0);
            self.prune_token_list(t + 1);
        }
        self.prune_token_list(0);

        debug!(
            before = num_toks_begin,
            after = self.num_toks,
            "finalize_decoding: pruned tokens"
        );
    }

    /// Relative cost of ending in a final state: 0 when the best overall
    /// path already ends final, positive when ending final costs extra, and
    /// `INFINITY` when no surviving token is in a final state (or none
    /// survived at all).
    pub fn final_relative_cost(&self) -> f32 {
        if self.decoding_finalized {
            // compute_final_costs() is forbidden once finalized; the value
            // was cached by finalize_decoding().
            self.final_relative_cost
        } else {
            let (_, relative_cost, _) = self.compute_final_costs();
            relative_cost
        }
    }

    /// Whether the best surviving token is within the graph's final states.
    pub fn reached_final(&self) -> bool {
        self.final_relative_cost() != f32::INFINITY
    }

    /// Final costs of the tokens active on the last frame.
    ///
    /// Returns the token-to-final-cost map (empty when no active state is
    /// final), the relative cost `best_with_final - best_without_final`
    /// (infinite when nothing survived), and the best cost including finals
    /// (falling back to the best cost alone when no final state is active).
    fn compute_final_costs(&self) -> (HashMap<TokenId, f32>, f32, f32) {
        assert!(
            !self.decoding_finalized,
            "compute_final_costs() is forbidden after finalize_decoding()"
        );
        let infinity = f32::INFINITY;
        let mut final_costs = HashMap::new();
        let mut best_cost = infinity;
        let mut best_cost_with_final = infinity;

        for (state, tok) in self.active.iter() {
            let final_cost = self.graph.final_cost(state);
            let cost = self.pool.tok(tok).total_cost;
            let cost_with_final = cost + final_cost;
            best_cost = best_cost.min(cost);
            best_cost_with_final = best_cost_with_final.min(cost_with_final);
            if final_cost != infinity {
                final_costs.insert(tok, final_cost);
            }
        }

        let relative_cost = if best_cost == infinity && best_cost_with_final == infinity {
            // Likely no tokens survived at all; this is the least bad answer.
            infinity
        } else {
            best_cost_with_final - best_cost
        };
        let best = if best_cost_with_final != infinity {
            best_cost_with_final
        } else {
            best_cost
        };
        (final_costs, relative_cost, best)
    }

    /// Release every entry of a detached snapshot back to the index.
    fn release_elems(&mut self, mut e: ElemId) {
        while !e.is_none() {
            let next = self.active.tail(e);
            self.active.release(e);
            e = next;
        }
    }

    /// Delete every token and link of the token network.
    fn clear_token_net(&mut self) {
        for f in 0..self.token_net.len() {
            let mut tok = self.token_net[f].head;
            while !tok.is_none() {
                self.pool.delete_links_from(tok);
                let next = self.pool.tok(tok).next;
                self.pool.delete_token(tok);
                self.num_toks -= 1;
                tok = next;
            }
        }
        self.token_net.clear();
        debug_assert_eq!(self.num_toks, 0, "token accounting out of sync");
    }

    #[cfg(test)]
    pub(crate) fn num_toks(&self) -> usize {
        self.num_toks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decodable::MatrixDecodable;
    use crate::graph::{Arc, VectorGraph, EPSILON};
    use ndarray::Array2;
    use std::collections::HashSet;

    /// s0 -eps-> s1 -eps(word 9)-> s2, plus an emitting arc s0 -> s3.
    fn epsilon_chain_graph() -> VectorGraph {
        let mut graph = VectorGraph::new();
        let s0 = graph.add_state();
        let s1 = graph.add_state();
        let s2 = graph.add_state();
        let s3 = graph.add_state();
        graph.add_arc(s0, Arc::new(EPSILON, 0, 0.0, s1));
        graph.add_arc(s1, Arc::new(EPSILON, 9, 0.0, s2));
        graph.add_arc(s0, Arc::new(1, 0, 0.0, s3));
        graph
    }

    fn frame_tokens(decoder: &LatticeDecoder<VectorGraph>, t: usize) -> Vec<TokenId> {
        let mut out = Vec::new();
        let mut tok = decoder.token_net[t].head;
        while !tok.is_none() {
            out.push(tok);
            tok = decoder.pool.tok(tok).next;
        }
        out
    }

    #[test]
    fn init_decoding_closes_epsilon_arcs() {
        let mut decoder =
            LatticeDecoder::new(epsilon_chain_graph(), crate::DecoderConfig::default()).unwrap();
        decoder.init_decoding();

        // Start state plus its epsilon closure.
        assert_eq!(frame_tokens(&decoder, 0).len(), 3);
        assert_eq!(decoder.num_toks(), 3);
    }

    #[test]
    fn token_count_matches_network_reachability() {
        let mut decoder =
            LatticeDecoder::new(epsilon_chain_graph(), crate::DecoderConfig::default()).unwrap();
        let mut decodable = MatrixDecodable::new(Array2::zeros((1, 1)));
        decoder.init_decoding();
        decoder.advance_decoding(&mut decodable, None);

        let reachable: usize = (0..decoder.token_net.len())
            .map(|t| frame_tokens(&decoder, t).len())
            .sum();
        assert_eq!(decoder.num_toks(), reachable);
        assert_eq!(decoder.cost_offsets.len(), decoder.num_frames_decoded());
    }

    #[test]
    fn forward_links_stay_within_adjacent_frames() {
        let mut decoder =
            LatticeDecoder::new(epsilon_chain_graph(), crate::DecoderConfig::default()).unwrap();
        let mut decodable = MatrixDecodable::new(Array2::zeros((1, 1)));
        decoder.init_decoding();
        decoder.advance_decoding(&mut decodable, None);

        let frames: Vec<HashSet<TokenId>> = (0..decoder.token_net.len())
            .map(|t| frame_tokens(&decoder, t).into_iter().collect())
            .collect();
        for (t, toks) in frames.iter().enumerate() {
            for &tok in toks {
                let mut link = decoder.pool.tok(tok).links;
                while !link.is_none() {
                    let l = decoder.pool.link(link);
                    let expected_frame = if l.ilabel == EPSILON { t } else { t + 1 };
                    assert!(
                        frames[expected_frame].contains(&l.dst_tok),
                        "link from frame {t} lands outside frame {expected_frame}"
                    );
                    link = l.next;
                }
            }
        }
    }
}
