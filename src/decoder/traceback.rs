//! Best-path traceback and lattice extraction from the token network.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::decoder::LatticeDecoder;
use crate::error::{Error, Result};
use crate::graph::{Graph, EPSILON};
use crate::lattice::{Lattice, LatticeArc, LatticeStateId, LatticeWeight};
use crate::pool::TokenId;

/// Cursor into the token network for step-by-step best-path traceback.
///
/// `frame` is the index of the frame whose input label the next
/// [`trace_back_best_path`](LatticeDecoder::trace_back_best_path) call will
/// produce (assuming a non-epsilon transition). Note this is one less than
/// might be expected: it is -1 for the non-emitting transitions before the
/// first frame.
///
/// Valid only while the decoder is not mutated.
#[derive(Debug, Clone, Copy)]
pub struct BestPathIterator {
    tok: TokenId,
    frame: isize,
}

impl BestPathIterator {
    pub fn done(&self) -> bool {
        self.tok.is_none()
    }

    pub fn frame(&self) -> isize {
        self.frame
    }
}

impl<G: Graph> LatticeDecoder<G> {
    /// Find the end token of the best path through the last decoded frame.
    ///
    /// With `use_final_probs`, tokens in final states are preferred by
    /// their final cost, and tokens outside final states are skipped if any
    /// final token is active. Panics if called with `use_final_probs ==
    /// false` after finalization, or before any frame was decoded.
    pub fn best_path_end(&self, use_final_probs: bool) -> BestPathIterator {
        self.best_path_end_impl(use_final_probs).0
    }

    /// As [`best_path_end`](Self::best_path_end), also returning the final
    /// cost of the chosen token (0 when finals are unused or inactive).
    fn best_path_end_impl(&self, use_final_probs: bool) -> (BestPathIterator, f32) {
        assert!(
            !(self.decoding_finalized && !use_final_probs),
            "best_path_end(use_final_probs=false) is forbidden after finalize_decoding()"
        );
        assert!(
            self.num_frames_decoded() > 0,
            "best_path_end requires at least one decoded frame"
        );

        let mut final_costs_local = HashMap::new();
        if !self.decoding_finalized && use_final_probs {
            final_costs_local = self.compute_final_costs().0;
        }
        let final_costs = if self.decoding_finalized {
            &self.final_costs
        } else {
            &final_costs_local
        };

        let mut best_cost = f32::INFINITY;
        let mut best_final_cost = 0.0;
        let mut best_tok = TokenId::NONE;
        let mut tok = self.token_net.last().unwrap().head;
        while !tok.is_none() {
            let mut cost = self.pool.tok(tok).total_cost;
            let mut final_cost = 0.0;
            if use_final_probs && !final_costs.is_empty() {
                // Only tokens in final states may end the path.
                match final_costs.get(&tok) {
                    Some(&fc) => {
                        final_cost = fc;
                        cost += fc;
                    }
                    None => cost = f32::INFINITY,
                }
            }
            if cost < best_cost {
                best_cost = cost;
                best_tok = tok;
                best_final_cost = final_cost;
            }
            tok = self.pool.tok(tok).next;
        }
        if best_tok.is_none() {
            // Should not happen short of infinities in the likelihoods.
            warn!("best_path_end: no final token found");
        }
        (
            BestPathIterator {
                tok: best_tok,
                frame: self.num_frames_decoded() as isize - 1,
            },
            best_final_cost,
        )
    }

    /// Step one arc backwards along the best path.
    ///
    /// Returns the advanced iterator and the traced arc; the arc's
    /// `nextstate` is left at 0 for the caller to assign. The returned
    /// frame decreases by one across emitting arcs and is unchanged across
    /// epsilon arcs. Panics if the pruner has left the network inconsistent
    /// (no link from the backpointer reaches the current token).
    pub fn trace_back_best_path(&self, iter: BestPathIterator) -> (BestPathIterator, LatticeArc) {
        assert!(!iter.done(), "trace_back_best_path on a finished iterator");
        let tok = iter.tok;
        let cur_t = iter.frame;
        let mut ret_t = cur_t;
        let mut arc = LatticeArc {
            ilabel: EPSILON,
            olabel: 0,
            weight: LatticeWeight::one(),
            nextstate: 0,
        };
        let backpointer = self.pool.tok(tok).backpointer;
        if !backpointer.is_none() {
            let mut link = self.pool.tok(backpointer).links;
            let mut found = false;
            while !link.is_none() {
                let l = self.pool.link(link);
                if l.dst_tok == tok {
                    // This is the link to `tok`.
                    arc.ilabel = l.ilabel;
                    arc.olabel = l.olabel;
                    let mut acoustic_cost = l.acoustic_cost;
                    if l.ilabel != EPSILON {
                        assert!(cur_t >= 0 && (cur_t as usize) < self.cost_offsets.len());
                        acoustic_cost -= self.cost_offsets[cur_t as usize];
                        ret_t -= 1;
                    }
                    arc.weight = LatticeWeight::new(l.graph_cost, acoustic_cost);
                    found = true;
                    break;
                }
                link = l.next;
            }
            if !found {
                panic!("error tracing best path back (likely bug in token-pruning algorithm)");
            }
        }
        (
            BestPathIterator {
                tok: backpointer,
                frame: ret_t,
            },
            arc,
        )
    }

    /// The single best path through the lattice, as a linear lattice.
    pub fn get_best_path(&self, use_final_probs: bool) -> Result<Lattice> {
        let (mut iter, final_graph_cost) = self.best_path_end_impl(use_final_probs);
        if iter.done() {
            return Err(Error::SearchCollapsed {
                frame: self.num_frames_decoded(),
            });
        }
        let mut lat = Lattice::new();
        // Built in reverse: the end of the path is state 0, and the start
        // state is assigned last.
        let mut state = lat.add_state();
        lat.set_final(state, LatticeWeight::new(final_graph_cost, 0.0));
        while !iter.done() {
            let (next_iter, mut arc) = self.trace_back_best_path(iter);
            arc.nextstate = state;
            let new_state = lat.add_state();
            lat.add_arc(new_state, arc);
            state = new_state;
            iter = next_iter;
        }
        lat.set_start(state);
        Ok(lat)
    }

    /// Cross-check [`get_best_path`](Self::get_best_path) against the
    /// shortest path through [`get_raw_lattice`](Self::get_raw_lattice).
    ///
    /// Returns false (with a warning) if the two disagree on labels or
    /// differ in total cost by more than 0.1.
    pub fn test_get_best_path(&self, use_final_probs: bool) -> bool {
        let delta = 0.1;
        let lat1 = match self.get_raw_lattice(use_final_probs) {
            Ok(raw) => raw.shortest_path(),
            Err(_) => None,
        };
        let lat2 = self.get_best_path(use_final_probs).ok();

        let (Some(lat1), Some(lat2)) = (lat1, lat2) else {
            warn!("best-path test failed: missing lattice");
            return false;
        };
        let (Some((arcs1, final1)), Some((arcs2, final2))) = (lat1.path(), lat2.path()) else {
            warn!("best-path test failed: non-linear path");
            return false;
        };

        // Epsilon-free label sequences must match exactly.
        let labels = |arcs: &[LatticeArc]| -> Vec<(u32, u32)> {
            arcs.iter()
                .filter(|a| a.ilabel != EPSILON || a.olabel != 0)
                .map(|a| (a.ilabel, a.olabel))
                .collect()
        };
        if labels(&arcs1) != labels(&arcs2) {
            warn!("best-path test failed: label mismatch");
            return false;
        }

        let total = |arcs: &[LatticeArc], fin: LatticeWeight| -> f32 {
            arcs.iter().map(|a| a.weight.cost()).sum::<f32>() + fin.cost()
        };
        let diff = (total(&arcs1, final1) - total(&arcs2, final2)).abs();
        if diff > delta {
            warn!(diff, "best-path test failed: weight mismatch");
            return false;
        }
        true
    }

    /// The raw, state-level lattice over all decoded frames.
    ///
    /// Output states are allocated per token, frame by frame, each frame in
    /// topological order along its epsilon links, so state 0 is the start
    /// state. With `use_final_probs`, the last frame's states take their
    /// final weights from the graph; otherwise every last-frame state is
    /// final with weight one.
    pub fn get_raw_lattice(&self, use_final_probs: bool) -> Result<Lattice> {
        // The old interface (decode()) cannot produce a lattice without
        // final probs; use init_decoding()/advance_decoding() for that.
        assert!(
            !(self.decoding_finalized && !use_final_probs),
            "get_raw_lattice(use_final_probs=false) is forbidden after finalize_decoding()"
        );

        let mut final_costs_local = HashMap::new();
        if !self.decoding_finalized && use_final_probs {
            final_costs_local = self.compute_final_costs().0;
        }
        let final_costs = if self.decoding_finalized {
            &self.final_costs
        } else {
            &final_costs_local
        };

        let num_frames = self.num_frames_decoded();
        assert!(num_frames > 0, "no frames decoded");
        let mut lat = Lattice::new();
        let mut tok_map: HashMap<TokenId, LatticeStateId> = HashMap::with_capacity(self.num_toks);

        // First create all states.
        let mut token_list = Vec::new();
        for f in 0..=num_frames {
            if self.token_net[f].head.is_none() {
                warn!(frame = f, "get_raw_lattice: no tokens active; not producing lattice");
                return Err(Error::SearchCollapsed { frame: f });
            }
            self.top_sort_tokens(self.token_net[f].head, &mut token_list);
            for tok in token_list.iter().flatten() {
                tok_map.insert(*tok, lat.add_state());
            }
        }
        // Tokens were topologically sorted, so state zero is the start.
        lat.set_start(0);

        // Now create all arcs.
        for f in 0..=num_frames {
            let mut tok = self.token_net[f].head;
            while !tok.is_none() {
                let cur_state = tok_map[&tok];
                let mut link = self.pool.tok(tok).links;
                while !link.is_none() {
                    let l = self.pool.link(link);
                    let nextstate = *tok_map
                        .get(&l.dst_tok)
                        .expect("forward link to a token outside the network");
                    let cost_offset = if l.ilabel != EPSILON {
                        debug_assert!(f < self.cost_offsets.len());
                        self.cost_offsets[f]
                    } else {
                        0.0
                    };
                    lat.add_arc(
                        cur_state,
                        LatticeArc {
                            ilabel: l.ilabel,
                            olabel: l.olabel,
                            weight: LatticeWeight::new(l.graph_cost, l.acoustic_cost - cost_offset),
                            nextstate,
                        },
                    );
                    link = l.next;
                }
                if f == num_frames {
                    if use_final_probs && !final_costs.is_empty() {
                        if let Some(&fc) = final_costs.get(&tok) {
                            lat.set_final(cur_state, LatticeWeight::new(fc, 0.0));
                        }
                    } else {
                        lat.set_final(cur_state, LatticeWeight::one());
                    }
                }
                tok = self.pool.tok(tok).next;
            }
        }
        Ok(lat)
    }

    /// As [`get_raw_lattice`](Self::get_raw_lattice), but only emits arcs
    /// whose destination token has `extra_cost < beam`, discovering states
    /// breadth-first from the initial token.
    pub fn get_raw_lattice_pruned(&self, use_final_probs: bool, beam: f32) -> Result<Lattice> {
        assert!(
            !(self.decoding_finalized && !use_final_probs),
            "get_raw_lattice_pruned(use_final_probs=false) is forbidden after finalize_decoding()"
        );

        let mut final_costs_local = HashMap::new();
        if !self.decoding_finalized && use_final_probs {
            final_costs_local = self.compute_final_costs().0;
        }
        let final_costs = if self.decoding_finalized {
            &self.final_costs
        } else {
            &final_costs_local
        };

        let num_frames = self.num_frames_decoded();
        assert!(num_frames > 0, "no frames decoded");
        for f in 0..=num_frames {
            if self.token_net[f].head.is_none() {
                warn!(frame = f, "get_raw_lattice_pruned: no tokens active; not producing lattice");
                return Err(Error::SearchCollapsed { frame: f });
            }
        }

        let mut lat = Lattice::new();
        let mut tok_map: HashMap<TokenId, LatticeStateId> = HashMap::new();
        let mut tok_queue: VecDeque<(TokenId, usize)> = VecDeque::new();

        // The initial token is the last one in frame 0's list.
        let mut tok = self.token_net[0].head;
        while !tok.is_none() {
            let next = self.pool.tok(tok).next;
            if next.is_none() {
                let s = lat.add_state();
                tok_map.insert(tok, s);
                lat.set_start(s);
                tok_queue.push_back((tok, 0));
            }
            tok = next;
        }

        while let Some((cur_tok, cur_frame)) = tok_queue.pop_front() {
            debug_assert!(cur_frame <= self.cost_offsets.len());
            let cur_state = tok_map[&cur_tok];

            let mut link = self.pool.tok(cur_tok).links;
            while !link.is_none() {
                let (next_link, dst_tok, ilabel, olabel, graph_cost, acoustic_cost) = {
                    let l = self.pool.link(link);
                    (l.next, l.dst_tok, l.ilabel, l.olabel, l.graph_cost, l.acoustic_cost)
                };
                if self.pool.tok(dst_tok).extra_cost < beam {
                    // Both endpoints are good; keep the arc.
                    let next_frame = if ilabel == EPSILON {
                        cur_frame
                    } else {
                        cur_frame + 1
                    };
                    let nextstate = match tok_map.get(&dst_tok) {
                        Some(&s) => s,
                        None => {
                            let s = lat.add_state();
                            tok_map.insert(dst_tok, s);
                            tok_queue.push_back((dst_tok, next_frame));
                            s
                        }
                    };
                    let cost_offset = if ilabel != EPSILON {
                        self.cost_offsets[cur_frame]
                    } else {
                        0.0
                    };
                    lat.add_arc(
                        cur_state,
                        LatticeArc {
                            ilabel,
                            olabel,
                            weight: LatticeWeight::new(graph_cost, acoustic_cost - cost_offset),
                            nextstate,
                        },
                    );
                }
                link = next_link;
            }
            if cur_frame == num_frames {
                if use_final_probs && !final_costs.is_empty() {
                    if let Some(&fc) = final_costs.get(&cur_tok) {
                        lat.set_final(cur_state, LatticeWeight::new(fc, 0.0));
                    }
                } else {
                    lat.set_final(cur_state, LatticeWeight::one());
                }
            }
        }
        if lat.num_states() == 0 {
            return Err(Error::SearchCollapsed { frame: num_frames });
        }
        Ok(lat)
    }

    /// Order one frame's tokens topologically along their epsilon links.
    ///
    /// Initial positions are the reverse of the token list: new tokens sit
    /// at the list head, so the oldest token gets position 0, which is
    /// usually already close to topological order. Sweeps over the list
    /// demote any epsilon successor found behind its source to a fresh
    /// position at the end, repeating until a sweep changes nothing, so the
    /// result depends only on list order and link structure. The output may
    /// contain `None` gaps at abandoned positions; callers skip them.
    /// Panics after a bounded number of demotions, which indicates an
    /// epsilon cycle in the decoding graph (not allowed).
    pub(super) fn top_sort_tokens(&self, head: TokenId, topsorted: &mut Vec<Option<TokenId>>) {
        let mut token2pos: HashMap<TokenId, usize> = HashMap::new();
        let mut num_toks = 0;
        let mut tok = head;
        while !tok.is_none() {
            num_toks += 1;
            tok = self.pool.tok(tok).next;
        }

        let mut cur_pos = 0;
        let mut tok = head;
        while !tok.is_none() {
            cur_pos += 1;
            token2pos.insert(tok, num_toks - cur_pos);
            tok = self.pool.tok(tok).next;
        }

        let max_positions = num_toks + 1_000_000;
        loop {
            let mut changed = false;
            let mut tok = head;
            while !tok.is_none() {
                let pos = token2pos[&tok];
                let mut link = self.pool.tok(tok).links;
                while !link.is_none() {
                    let l = self.pool.link(link);
                    // Only epsilon links matter: non-epsilon links cross
                    // frames and this sorts a single frame's list.
                    if l.ilabel == EPSILON {
                        if let Some(&next_pos) = token2pos.get(&l.dst_tok) {
                            if next_pos < pos {
                                // Reassign the successor's position.
                                token2pos.insert(l.dst_tok, cur_pos);
                                cur_pos += 1;
                                changed = true;
                                assert!(
                                    cur_pos < max_positions,
                                    "epsilon cycles exist in the decoding graph (this is not allowed)"
                                );
                            }
                        }
                    }
                    link = l.next;
                }
                tok = self.pool.tok(tok).next;
            }
            if !changed {
                break;
            }
        }

        topsorted.clear();
        topsorted.resize(cur_pos, None);
        for (tok, pos) in &token2pos {
            topsorted[*pos] = Some(*tok);
        }
    }
}
