//! On-the-fly composition with a language-model difference graph.
//!
//! [`ComposedGraph`] pairs every decoding-graph state with a state of a
//! deterministic LM-diff graph and rescores word arcs as the decoder reaches
//! them. It implements [`Graph`] itself, so the search core needs no
//! knowledge of the composition: the arc weights it sees already include the
//! LM-diff adjustment.

use crate::graph::{Arc, Graph, Label, StateId, EPSILON};

/// One LM-diff transition, keyed by output (word) label.
#[derive(Debug, Clone, Copy)]
pub struct LmArc {
    /// Cost added to the base arc weight.
    pub weight: f32,
    /// Replacement output label.
    pub olabel: Label,
    /// Successor LM state.
    pub next_state: StateId,
}

/// A deterministic language-model difference graph.
///
/// Queried only for nonzero word labels. A statistical LM is expected to
/// supply an arc for every word via backoff; reporting `None` for a word is
/// treated as a fatal input error by [`ComposedGraph`].
pub trait DeterministicLm {
    fn start(&self) -> StateId;

    /// Final cost of `state`; `f32::INFINITY` if the state is not final.
    fn final_cost(&self, state: StateId) -> f32;

    /// The unique arc leaving `state` with output label `olabel`.
    fn get_arc(&self, state: StateId, olabel: Label) -> Option<LmArc>;
}

/// A decoding graph composed on the fly with an LM-diff graph.
///
/// State ids pack the pair `(graph_state, lm_state)` into a single
/// [`StateId`]; both halves must fit in 32 bits and are recoverable through
/// [`la_state`](ComposedGraph::la_state) / [`lm_state`](ComposedGraph::lm_state).
#[derive(Debug, Clone)]
pub struct ComposedGraph<G, L> {
    graph: G,
    lm: L,
}

fn pack(la: StateId, lm: StateId) -> StateId {
    debug_assert!(la <= u32::MAX as StateId, "graph state {la} exceeds 32 bits");
    debug_assert!(lm <= u32::MAX as StateId, "LM state {lm} exceeds 32 bits");
    (lm << 32) | la
}

impl<G: Graph, L: DeterministicLm> ComposedGraph<G, L> {
    pub fn new(graph: G, lm: L) -> Self {
        Self { graph, lm }
    }

    /// The decoding-graph half of a composed state id.
    pub fn la_state(state: StateId) -> StateId {
        state & u32::MAX as StateId
    }

    /// The LM half of a composed state id.
    pub fn lm_state(state: StateId) -> StateId {
        state >> 32
    }
}

impl<G: Graph, L: DeterministicLm> Graph for ComposedGraph<G, L> {
    type ArcIter<'a>
        = ComposedArcIter<'a, G, L>
    where
        Self: 'a;

    fn start(&self) -> Option<StateId> {
        let la = self.graph.start()?;
        Some(pack(la, self.lm.start()))
    }

    fn final_cost(&self, state: StateId) -> f32 {
        self.graph.final_cost(Self::la_state(state)) + self.lm.final_cost(Self::lm_state(state))
    }

    fn arcs(&self, state: StateId) -> Self::ArcIter<'_> {
        ComposedArcIter {
            inner: self.graph.arcs(Self::la_state(state)),
            lm: &self.lm,
            lm_state: Self::lm_state(state),
        }
    }
}

/// Arc iterator of [`ComposedGraph`]; rescores word arcs as they are read.
pub struct ComposedArcIter<'a, G: Graph + 'a, L> {
    inner: G::ArcIter<'a>,
    lm: &'a L,
    lm_state: StateId,
}

impl<'a, G: Graph, L: DeterministicLm> Iterator for ComposedArcIter<'a, G, L> {
    type Item = Arc;

    fn next(&mut self) -> Option<Arc> {
        let arc = self.inner.next()?;
        if arc.olabel == EPSILON {
            // No word crossed: the LM state is carried along unchanged.
            return Some(Arc {
                dst: pack(arc.dst, self.lm_state),
                ..arc
            });
        }
        let Some(lm_arc) = self.lm.get_arc(self.lm_state, arc.olabel) else {
            panic!(
                "LM-diff graph has no arc for word label {} from LM state {}",
                arc.olabel, self.lm_state
            );
        };
        Some(Arc {
            ilabel: arc.ilabel,
            olabel: lm_arc.olabel,
            weight: arc.weight + lm_arc.weight,
            dst: pack(arc.dst, lm_arc.next_state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VectorGraph;

    /// Single-state LM that charges a flat cost per word.
    struct FlatLm {
        word_cost: f32,
    }

    impl DeterministicLm for FlatLm {
        fn start(&self) -> StateId {
            0
        }

        fn final_cost(&self, _state: StateId) -> f32 {
            0.0
        }

        fn get_arc(&self, state: StateId, olabel: Label) -> Option<LmArc> {
            if olabel == 99 {
                return None; // unknown word, for the panic test
            }
            Some(LmArc {
                weight: self.word_cost,
                olabel,
                next_state: state,
            })
        }
    }

    fn two_state_graph() -> VectorGraph {
        let mut graph = VectorGraph::new();
        let s0 = graph.add_state();
        let s1 = graph.add_state();
        graph.add_arc(s0, Arc::new(1, 7, 0.5, s1));
        graph.add_arc(s0, Arc::new(2, 0, 0.25, s1));
        graph.set_final(s1, 0.0);
        graph
    }

    #[test]
    fn word_arcs_pick_up_lm_cost() {
        let composed = ComposedGraph::new(two_state_graph(), FlatLm { word_cost: 1.0 });
        let start = composed.start().unwrap();

        let arcs: Vec<Arc> = composed.arcs(start).collect();
        assert_eq!(arcs.len(), 2);

        // Word arc: base 0.5 plus LM 1.0.
        assert!((arcs[0].weight - 1.5).abs() < 0.001);
        // Epsilon-output arc: untouched.
        assert!((arcs[1].weight - 0.25).abs() < 0.001);
    }

    #[test]
    fn composed_state_halves_are_recoverable() {
        type C = ComposedGraph<VectorGraph, FlatLm>;
        let packed = pack(3, 5);

        assert_eq!(C::la_state(packed), 3);
        assert_eq!(C::lm_state(packed), 5);
    }

    #[test]
    fn final_cost_sums_both_halves() {
        let mut graph = two_state_graph();
        graph.set_final(1, 2.0);
        let composed = ComposedGraph::new(graph, FlatLm { word_cost: 1.0 });

        assert!((composed.final_cost(pack(1, 0)) - 2.0).abs() < 0.001);
        assert!(composed.final_cost(pack(0, 0)).is_infinite());
    }

    #[test]
    #[should_panic(expected = "no arc for word label")]
    fn missing_lm_arc_is_fatal() {
        let mut graph = VectorGraph::new();
        let s0 = graph.add_state();
        let s1 = graph.add_state();
        graph.add_arc(s0, Arc::new(1, 99, 0.0, s1));

        let composed = ComposedGraph::new(graph, FlatLm { word_cost: 1.0 });
        let start = composed.start().unwrap();
        let _ = composed.arcs(start).count();
    }
}
