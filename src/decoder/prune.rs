//! Lattice-beam back-pruning of the token network.

use tracing::{debug, warn};

use crate::decoder::LatticeDecoder;
use crate::graph::Graph;
use crate::pool::{LinkId, TokenId};

/// Equality within a relative tolerance; exact equality covers infinities.
fn approx_equal(a: f32, b: f32, relative_tolerance: f32) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    if diff.is_infinite() || diff.is_nan() {
        return false;
    }
    diff <= relative_tolerance * (a.abs() + b.abs())
}

impl<G: Graph> LatticeDecoder<G> {
    /// Prune the outgoing links of every token on frame `t`.
    ///
    /// A link survives if the best path through it is within `lattice_beam`
    /// of the best path overall, judged by the destination's `extra_cost`.
    /// Each token's own `extra_cost` is recomputed as the minimum over its
    /// surviving links; since the frame's tokens are not in topological
    /// order, the pass iterates until no extra cost moves by more than
    /// `delta`. Returns `(extra_costs_changed, links_pruned)`.
    pub(super) fn prune_forward_links(&mut self, t: usize, delta: f32) -> (bool, bool) {
        let mut extra_costs_changed = false;
        let mut links_pruned = false;
        debug_assert!(t < self.token_net.len());

        if self.token_net[t].head.is_none() && !self.warned {
            // Empty list; should not happen.
            warn!(frame = t, "no tokens alive while pruning; warning only once per utterance");
            self.warned = true;
        }

        let mut changed = true;
        while changed {
            changed = false;
            let mut tok_id = self.token_net[t].head;
            while !tok_id.is_none() {
                // Recompute extra_cost for tok: the best (min) over the
                // link_extra_cost of its outgoing links.
                let mut tok_extra_cost = f32::INFINITY;
                let mut prev_link = LinkId::NONE;
                let mut link = self.pool.tok(tok_id).links;
                while !link.is_none() {
                    let (next_link, dst_tok, acoustic_cost, graph_cost) = {
                        let l = self.pool.link(link);
                        (l.next, l.dst_tok, l.acoustic_cost, l.graph_cost)
                    };
                    let tok_total = self.pool.tok(tok_id).total_cost;
                    let dst = self.pool.tok(dst_tok);
                    // The difference in brackets is >= 0: how much this
                    // link's path lags the best path into dst.
                    let mut link_extra_cost = dst.extra_cost
                        + ((tok_total + acoustic_cost + graph_cost) - dst.total_cost);
                    assert!(!link_extra_cost.is_nan(), "NaN link extra cost on frame {t}");
                    if link_extra_cost > self.config.lattice_beam {
                        // Excise the link.
                        if prev_link.is_none() {
                            self.pool.tok_mut(tok_id).links = next_link;
                        } else {
                            self.pool.link_mut(prev_link).next = next_link;
                        }
                        self.pool.delete_link(link);
                        link = next_link;
                        links_pruned = true;
                    } else {
                        if link_extra_cost < 0.0 {
                            // Rounding noise.
                            if link_extra_cost < -0.01 {
                                warn!(link_extra_cost, "negative extra cost");
                            }
                            link_extra_cost = 0.0;
                        }
                        if link_extra_cost < tok_extra_cost {
                            tok_extra_cost = link_extra_cost;
                        }
                        prev_link = link;
                        link = next_link;
                    }
                }
                if (tok_extra_cost - self.pool.tok(tok_id).extra_cost).abs() > delta {
                    changed = true;
                }
                // Will be +infinity or <= lattice_beam; infinity means no
                // forward link survived.
                self.pool.tok_mut(tok_id).extra_cost = tok_extra_cost;
                tok_id = self.pool.tok(tok_id).next;
            }
            if changed {
                extra_costs_changed = true;
            }
        }
        (extra_costs_changed, links_pruned)
    }

    /// Variant of [`prune_forward_links`](Self::prune_forward_links) for the
    /// last frame: seeds each token's extra cost from the final-prob terms,
    /// caches the final costs, and marks decoding finalized.
    pub(super) fn prune_forward_links_final(&mut self) {
        debug_assert!(!self.token_net.is_empty());
        let end_time = self.num_frames_decoded();

        if self.token_net[end_time].head.is_none() {
            // Empty list; should not happen.
            warn!("no tokens alive at end of utterance");
        }

        let (final_costs, final_relative_cost, final_best_cost) = self.compute_final_costs();
        self.final_costs = final_costs;
        self.final_relative_cost = final_relative_cost;
        self.final_best_cost = final_best_cost;
        self.decoding_finalized = true;
        // Free the index entries now: after prune_token_list() runs on the
        // final frame they would point at deleted tokens.
        let stale = self.active.clear();
        self.release_elems(stale);

        // As in prune_forward_links, iterate until stable, but the extra
        // cost has a term for the final-prob of the token itself.
        let delta = 1.0e-5_f32;
        let mut changed = true;
        while changed {
            changed = false;
            let mut tok_id = self.token_net[end_time].head;
            while !tok_id.is_none() {
                let final_cost = if self.final_costs.is_empty() {
                    0.0
                } else {
                    self.final_costs
                        .get(&tok_id)
                        .copied()
                        .unwrap_or(f32::INFINITY)
                };
                let mut tok_extra_cost =
                    self.pool.tok(tok_id).total_cost + final_cost - self.final_best_cost;
                // tok_extra_cost is a min over directly being final and
                // being indirectly final through links.
                let mut prev_link = LinkId::NONE;
                let mut link = self.pool.tok(tok_id).links;
                while !link.is_none() {
                    let (next_link, dst_tok, acoustic_cost, graph_cost) = {
                        let l = self.pool.link(link);
                        (l.next, l.dst_tok, l.acoustic_cost, l.graph_cost)
                    };
                    let tok_total = self.pool.tok(tok_id).total_cost;
                    let dst = self.pool.tok(dst_tok);
                    let mut link_extra_cost = dst.extra_cost
                        + ((tok_total + acoustic_cost + graph_cost) - dst.total_cost);
                    if link_extra_cost > self.config.lattice_beam {
                        if prev_link.is_none() {
                            self.pool.tok_mut(tok_id).links = next_link;
                        } else {
                            self.pool.link_mut(prev_link).next = next_link;
                        }
                        self.pool.delete_link(link);
                        link = next_link;
                    } else {
                        if link_extra_cost < 0.0 {
                            if link_extra_cost < -0.01 {
                                warn!(link_extra_cost, "negative extra cost");
                            }
                            link_extra_cost = 0.0;
                        }
                        if link_extra_cost < tok_extra_cost {
                            tok_extra_cost = link_extra_cost;
                        }
                        prev_link = link;
                        link = next_link;
                    }
                }
                // Prune away tokens worse than lattice_beam above the best
                // path. In the non-final case this shows up as having no
                // forward links; here the extra cost also carries the
                // final-prob component.
                if tok_extra_cost > self.config.lattice_beam {
                    tok_extra_cost = f32::INFINITY;
                }
                if !approx_equal(self.pool.tok(tok_id).extra_cost, tok_extra_cost, delta) {
                    changed = true;
                }
                self.pool.tok_mut(tok_id).extra_cost = tok_extra_cost;
                tok_id = self.pool.tok(tok_id).next;
            }
        }
    }

    /// Remove and destroy every token on frame `t` whose extra cost is
    /// infinite, meaning it is unreachable from the end of the graph.
    pub(super) fn prune_token_list(&mut self, t: usize) {
        debug_assert!(t < self.token_net.len());
        if self.token_net[t].head.is_none() && !self.warned {
            warn!(frame = t, "no tokens alive while pruning");
            self.warned = true;
        }
        let mut prev_tok = TokenId::NONE;
        let mut tok_id = self.token_net[t].head;
        while !tok_id.is_none() {
            let next_tok = self.pool.tok(tok_id).next;
            if self.pool.tok(tok_id).extra_cost == f32::INFINITY {
                debug_assert!(
                    self.pool.tok(tok_id).links.is_none(),
                    "pruning a token that still owns links"
                );
                if prev_tok.is_none() {
                    self.token_net[t].head = next_tok;
                } else {
                    self.pool.tok_mut(prev_tok).next = next_tok;
                }
                self.pool.delete_token(tok_id);
                self.num_toks -= 1;
            } else {
                prev_tok = tok_id;
            }
            tok_id = next_tok;
        }
    }

    /// Walk backwards through still-alive frames, pruning links and tokens
    /// whose forward+backward cost is more than `lattice_beam` off the best
    /// path. Nothing within the lattice beam is lost, regardless of what
    /// later frames bring. `delta` controls how far a cost must move before
    /// the change keeps propagating toward frame 0.
    pub(super) fn prune_token_net(&mut self, delta: f32) {
        let cur_time = self.num_frames_decoded();
        let num_toks_begin = self.num_toks;

        for t in (0..cur_time).rev() {
            if self.token_net[t].must_prune_forward_links {
                let (extra_costs_changed, links_pruned) = self.prune_forward_links(t, delta);
                if extra_costs_changed && t > 0 {
                    self.token_net[t - 1].must_prune_forward_links = true;
                }
                if links_pruned {
                    self.token_net[t].must_prune_tokens = true;
                }
                self.token_net[t].must_prune_forward_links = false;
            }
            if t + 1 != cur_time && self.token_net[t + 1].must_prune_tokens {
                self.prune_token_list(t + 1);
                self.token_net[t + 1].must_prune_tokens = false;
            }
        }
        debug!(
            before = num_toks_begin,
            after = self.num_toks,
            "prune_token_net: pruned tokens"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::approx_equal;

    #[test]
    fn approx_equal_handles_infinities() {
        let inf = f32::INFINITY;
        assert!(approx_equal(inf, inf, 1.0e-5));
        assert!(!approx_equal(inf, 1.0, 1.0e-5));
        assert!(!approx_equal(0.0, inf, 1.0e-5));
    }

    #[test]
    fn approx_equal_is_relative() {
        assert!(approx_equal(1000.0, 1000.001, 1.0e-5));
        assert!(!approx_equal(1.0, 1.1, 1.0e-5));
    }
}
