//! Per-frame expansion: cutoff selection, emitting and non-emitting passes.

use tracing::{trace, warn};

use crate::active::ElemId;
use crate::decodable::Decodable;
use crate::decoder::{FrameSlot, LatticeDecoder};
use crate::graph::{Graph, StateId, EPSILON};
use crate::pool::{LinkId, TokenId};

impl<G: Graph> LatticeDecoder<G> {
    /// Compute the pruning cutoff for the snapshot of the previous frame.
    ///
    /// Returns `(cutoff, adaptive_beam, best_entry, token_count)`. The
    /// adaptive beam equals the configured beam unless the max/min-active
    /// constraints override the beam cutoff, in which case `beam_delta`
    /// slack is added so the next-frame online cutoff is not too tight.
    pub(super) fn get_cutoff(&mut self, list_head: ElemId) -> (f32, f32, ElemId, usize) {
        let mut best_weight = f32::INFINITY;
        let mut best_elem = ElemId::NONE;
        let mut count = 0usize;

        if self.config.max_active == usize::MAX && self.config.min_active == 0 {
            let mut e = list_head;
            while !e.is_none() {
                let w = self.pool.tok(self.active.val(e)).total_cost;
                if w < best_weight {
                    best_weight = w;
                    best_elem = e;
                }
                count += 1;
                e = self.active.tail(e);
            }
            return (best_weight + self.config.beam, self.config.beam, best_elem, count);
        }

        self.tmp_costs.clear();
        let mut e = list_head;
        while !e.is_none() {
            let w = self.pool.tok(self.active.val(e)).total_cost;
            self.tmp_costs.push(w);
            if w < best_weight {
                best_weight = w;
                best_elem = e;
            }
            count += 1;
            e = self.active.tail(e);
        }

        let beam_cutoff = best_weight + self.config.beam;
        let mut min_active_cutoff = f32::INFINITY;
        let mut max_active_cutoff = f32::INFINITY;

        trace!(
            frame = self.num_frames_decoded(),
            active = count,
            "tokens active"
        );

        if self.tmp_costs.len() > self.config.max_active {
            let (_, nth, _) = self
                .tmp_costs
                .select_nth_unstable_by(self.config.max_active, |a, b| a.total_cmp(b));
            max_active_cutoff = *nth;
        }
        if max_active_cutoff < beam_cutoff {
            // max_active is tighter than the beam.
            let adaptive_beam = max_active_cutoff - best_weight + self.config.beam_delta;
            return (max_active_cutoff, adaptive_beam, best_elem, count);
        }
        if self.tmp_costs.len() > self.config.min_active {
            if self.config.min_active == 0 {
                min_active_cutoff = best_weight;
            } else {
                // When max_active applied above, the min_active-th smallest
                // overall lies in the left partition of that selection.
                let upto = if self.tmp_costs.len() > self.config.max_active
                    && self.config.min_active < self.config.max_active
                {
                    self.config.max_active
                } else {
                    self.tmp_costs.len()
                };
                let (_, nth, _) = self.tmp_costs[..upto]
                    .select_nth_unstable_by(self.config.min_active, |a, b| a.total_cmp(b));
                min_active_cutoff = *nth;
            }
        }
        if min_active_cutoff > beam_cutoff {
            // min_active is looser than the beam.
            let adaptive_beam = min_active_cutoff - best_weight + self.config.beam_delta;
            (min_active_cutoff, adaptive_beam, best_elem, count)
        } else {
            (beam_cutoff, self.config.beam, best_elem, count)
        }
    }

    fn possibly_resize_hash(&mut self, num_toks: usize) {
        let new_size = (num_toks as f32 * self.config.hash_ratio) as usize;
        self.active.set_size(new_size);
    }

    /// Locate the token of `state` on frame `t`, or insert a fresh one.
    ///
    /// A fresh token starts with zero extra cost: any token on the current
    /// frame could still end up on the winning path. When the state is
    /// already present and the new cost improves it, only `total_cost` and
    /// `backpointer` change; the link list stays intact (stale epsilon links
    /// are handled by the caller or pruned later). The flag reports whether
    /// the token is new or its cost improved.
    pub(super) fn find_or_add_token(
        &mut self,
        state: StateId,
        t: usize,
        total_cost: f32,
        backpointer: TokenId,
    ) -> (TokenId, bool) {
        debug_assert!(t < self.token_net.len());
        if let Some(e) = self.active.find(state) {
            let tok_id = self.active.val(e);
            let tok = self.pool.tok_mut(tok_id);
            if tok.total_cost > total_cost {
                tok.total_cost = total_cost;
                tok.backpointer = backpointer;
                (tok_id, true)
            } else {
                (tok_id, false)
            }
        } else {
            let head = self.token_net[t].head;
            let tok_id = self.pool.new_token(total_cost, 0.0, LinkId::NONE, head, backpointer);
            self.token_net[t].head = tok_id;
            self.num_toks += 1;
            self.active.insert(state, tok_id);
            (tok_id, true)
        }
    }

    /// Expand emitting arcs out of the previous frame, consuming one
    /// acoustic frame. Returns the online cutoff for the non-emitting pass.
    pub(super) fn process_emitting<D: Decodable>(&mut self, decodable: &mut D) -> f32 {
        debug_assert!(!self.token_net.is_empty());
        // Zero-based index of the acoustic frame about to be consumed; the
        // tokens it produces land on token-net slot `frame + 1`.
        let frame = self.token_net.len() - 1;
        self.token_net.push(FrameSlot::new());

        let prev_toks = self.active.clear();
        let (cur_cutoff, adaptive_beam, best_elem, tok_cnt) = self.get_cutoff(prev_toks);
        self.possibly_resize_hash(tok_cnt);

        // Online cutoff for the frame being created, tightened as tokens
        // are inserted.
        let mut next_cutoff = f32::INFINITY;
        // Offset subtracted from acoustic costs to keep them in a good
        // dynamic range; restored at lattice-emission time.
        let mut cost_offset = 0.0;

        // First expand only the best token, to get a reasonably tight bound
        // on next_cutoff before the main scan.
        if !best_elem.is_none() {
            let state = self.active.key(best_elem);
            let tok_cost = self.pool.tok(self.active.val(best_elem)).total_cost;
            cost_offset = -tok_cost;
            self.arc_buf.clear();
            self.arc_buf.extend(self.graph.arcs(state));
            for i in 0..self.arc_buf.len() {
                let arc = self.arc_buf[i];
                if arc.ilabel != EPSILON {
                    let ac_cost = -decodable.log_likelihood(frame, arc.ilabel);
                    let new_weight = tok_cost + arc.weight + ac_cost + cost_offset;
                    if new_weight + adaptive_beam < next_cutoff {
                        next_cutoff = new_weight + adaptive_beam;
                    }
                }
            }
        }

        self.cost_offsets.resize(frame + 1, 0.0);
        self.cost_offsets[frame] = cost_offset;

        // The snapshot owns the previous frame's entries now; each is
        // released once its expansion is done.
        let mut e = prev_toks;
        while !e.is_none() {
            let e_tail = self.active.tail(e);
            let state = self.active.key(e);
            let tok_id = self.active.val(e);
            let tok_cost = self.pool.tok(tok_id).total_cost;
            if tok_cost <= cur_cutoff {
                self.arc_buf.clear();
                self.arc_buf.extend(self.graph.arcs(state));
                for i in 0..self.arc_buf.len() {
                    let arc = self.arc_buf[i];
                    if arc.ilabel == EPSILON {
                        continue;
                    }
                    let ac_cost = cost_offset - decodable.log_likelihood(frame, arc.ilabel);
                    let graph_cost = arc.weight;
                    let total_cost = tok_cost + ac_cost + graph_cost;
                    if total_cost > next_cutoff {
                        continue;
                    }
                    if total_cost + adaptive_beam < next_cutoff {
                        // Prune by the best current token.
                        next_cutoff = total_cost + adaptive_beam;
                    }
                    let (dst_tok, _) = self.find_or_add_token(arc.dst, frame + 1, total_cost, tok_id);
                    // Put the new link at the head of the source's list.
                    let links = self.pool.tok(tok_id).links;
                    let link =
                        self.pool
                            .new_link(dst_tok, arc.ilabel, arc.olabel, graph_cost, ac_cost, links);
                    self.pool.tok_mut(tok_id).links = link;
                }
            }
            self.active.release(e);
            e = e_tail;
        }
        next_cutoff
    }

    /// Close the newest frame under epsilon arcs.
    ///
    /// States are re-queued whenever their cost improves; a revisited
    /// token's outgoing links are deleted and regenerated, since links made
    /// from its stale cost would break the Viterbi optimality of
    /// `total_cost`. Their destinations may survive and are pruned later.
    pub(super) fn process_nonemitting(&mut self, cutoff: f32) {
        debug_assert!(!self.token_net.is_empty());
        // Token-net slot being closed; the acoustic frame just consumed is
        // `t - 1`, or none when called from init_decoding().
        let t = self.token_net.len() - 1;

        debug_assert!(self.queue.is_empty());
        for (state, _) in self.active.iter() {
            self.queue.push(state);
        }
        if self.queue.is_empty() && !self.warned {
            warn!(frame = t as isize - 1, "no surviving tokens: search collapsed");
            self.warned = true;
        }

        while let Some(state) = self.queue.pop() {
            let e = self
                .active
                .find(state)
                .expect("queued state missing from active index");
            let tok_id = self.active.val(e);
            let tok_cost = self.pool.tok(tok_id).total_cost;
            if tok_cost > cutoff {
                // Not worth expanding successors.
                continue;
            }
            // If the token has existing forward links, delete them: we are
            // about to regenerate them from its improved cost.
            self.pool.delete_links_from(tok_id);

            self.arc_buf.clear();
            self.arc_buf.extend(self.graph.arcs(state));
            for i in 0..self.arc_buf.len() {
                let arc = self.arc_buf[i];
                if arc.ilabel != EPSILON {
                    continue;
                }
                let graph_cost = arc.weight;
                let total_cost = tok_cost + graph_cost;
                if total_cost < cutoff {
                    let (dst_tok, changed) = self.find_or_add_token(arc.dst, t, total_cost, tok_id);
                    let links = self.pool.tok(tok_id).links;
                    let link =
                        self.pool
                            .new_link(dst_tok, EPSILON, arc.olabel, graph_cost, 0.0, links);
                    self.pool.tok_mut(tok_id).links = link;
                    if changed {
                        self.queue.push(arc.dst);
                    }
                }
            }
        }
    }
}
