//! Word lattices produced by the decoder.
//!
//! A [`Lattice`] is a small acceptor-style transducer: states created in
//! topological order, arcs carrying the input/output labels of the
//! underlying forward links, and weights split into graph and acoustic
//! components so downstream rescoring can rescale them independently.

use crate::graph::Label;

/// State index within one [`Lattice`].
pub type LatticeStateId = u32;

/// A lattice weight, kept as separate graph and acoustic costs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeWeight {
    pub graph_cost: f32,
    pub acoustic_cost: f32,
}

impl LatticeWeight {
    pub fn new(graph_cost: f32, acoustic_cost: f32) -> Self {
        Self {
            graph_cost,
            acoustic_cost,
        }
    }

    /// The multiplicative identity: zero cost on both components.
    pub fn one() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Combined cost of the weight.
    pub fn cost(&self) -> f32 {
        self.graph_cost + self.acoustic_cost
    }
}

/// One lattice transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeArc {
    pub ilabel: Label,
    pub olabel: Label,
    pub weight: LatticeWeight,
    pub nextstate: LatticeStateId,
}

#[derive(Debug, Clone, Default)]
struct LatticeState {
    arcs: Vec<LatticeArc>,
    final_weight: Option<LatticeWeight>,
}

/// A word lattice (or single best path) over decoded frames.
#[derive(Debug, Clone, Default)]
pub struct Lattice {
    states: Vec<LatticeState>,
    start: Option<LatticeStateId>,
}

impl Lattice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self) -> LatticeStateId {
        let id = self.states.len() as LatticeStateId;
        self.states.push(LatticeState::default());
        id
    }

    pub fn set_start(&mut self, state: LatticeStateId) {
        self.start = Some(state);
    }

    pub fn start(&self) -> Option<LatticeStateId> {
        self.start
    }

    pub fn add_arc(&mut self, state: LatticeStateId, arc: LatticeArc) {
        self.states[state as usize].arcs.push(arc);
    }

    pub fn set_final(&mut self, state: LatticeStateId, weight: LatticeWeight) {
        self.states[state as usize].final_weight = Some(weight);
    }

    pub fn final_weight(&self, state: LatticeStateId) -> Option<LatticeWeight> {
        self.states[state as usize].final_weight
    }

    pub fn arcs(&self, state: LatticeStateId) -> &[LatticeArc] {
        &self.states[state as usize].arcs
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.states.iter().map(|s| s.arcs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Walk a linear lattice from the start state, returning its arcs in
    /// order and the final weight of the terminal state.
    ///
    /// Returns `None` if the lattice is empty, some visited state has more
    /// than one outgoing arc, or the walk does not end in a final state.
    pub fn path(&self) -> Option<(Vec<LatticeArc>, LatticeWeight)> {
        let mut state = self.start?;
        let mut arcs = Vec::new();
        loop {
            match self.arcs(state) {
                [] => return self.final_weight(state).map(|w| (arcs, w)),
                [arc] => {
                    arcs.push(*arc);
                    state = arc.nextstate;
                }
                _ => return None,
            }
        }
    }

    /// The lowest-cost path through the lattice, as a linear lattice.
    ///
    /// Returns `None` if the lattice is empty or no final state is
    /// reachable. Panics if the lattice contains a cycle.
    pub fn shortest_path(&self) -> Option<Lattice> {
        let start = self.start?;
        let n = self.states.len();

        // Kahn topological order over states reachable from the start.
        let mut indegree = vec![0usize; n];
        let mut seen = vec![false; n];
        let mut stack = vec![start];
        seen[start as usize] = true;
        while let Some(s) = stack.pop() {
            for arc in self.arcs(s) {
                indegree[arc.nextstate as usize] += 1;
                if !seen[arc.nextstate as usize] {
                    seen[arc.nextstate as usize] = true;
                    stack.push(arc.nextstate);
                }
            }
        }
        let mut order = Vec::with_capacity(n);
        let mut ready = vec![start];
        while let Some(s) = ready.pop() {
            order.push(s);
            for arc in self.arcs(s) {
                let d = &mut indegree[arc.nextstate as usize];
                *d -= 1;
                if *d == 0 {
                    ready.push(arc.nextstate);
                }
            }
        }
        assert!(
            order.len() == seen.iter().filter(|&&s| s).count(),
            "cycle in lattice"
        );

        // Viterbi relaxation in topological order.
        let mut dist = vec![f32::INFINITY; n];
        let mut back: Vec<Option<(LatticeStateId, usize)>> = vec![None; n];
        dist[start as usize] = 0.0;
        for &s in &order {
            let d = dist[s as usize];
            if d.is_infinite() {
                continue;
            }
            for (i, arc) in self.arcs(s).iter().enumerate() {
                let next = d + arc.weight.cost();
                if next < dist[arc.nextstate as usize] {
                    dist[arc.nextstate as usize] = next;
                    back[arc.nextstate as usize] = Some((s, i));
                }
            }
        }

        let mut best: Option<(LatticeStateId, f32)> = None;
        for &s in &order {
            if let Some(w) = self.final_weight(s) {
                let total = dist[s as usize] + w.cost();
                if best.is_none_or(|(_, c)| total < c) {
                    best = Some((s, total));
                }
            }
        }
        let (end, total) = best?;
        if total.is_infinite() {
            return None;
        }

        // Trace back, then lay the path out forward.
        let mut rev = Vec::new();
        let mut s = end;
        while s != start {
            let (prev, i) = back[s as usize].expect("broken backpointer chain");
            rev.push(self.arcs(prev)[i]);
            s = prev;
        }
        let mut out = Lattice::new();
        let mut cur = out.add_state();
        out.set_start(cur);
        for arc in rev.iter().rev() {
            let next = out.add_state();
            out.add_arc(
                cur,
                LatticeArc {
                    nextstate: next,
                    ..*arc
                },
            );
            cur = next;
        }
        out.set_final(cur, self.final_weight(end).expect("end state is final"));
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(olabel: Label, cost: f32, nextstate: LatticeStateId) -> LatticeArc {
        LatticeArc {
            ilabel: 1,
            olabel,
            weight: LatticeWeight::new(cost, 0.0),
            nextstate,
        }
    }

    #[test]
    fn path_of_linear_lattice() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(7, 1.0, s1));
        lat.add_arc(s1, arc(8, 2.0, s2));
        lat.set_final(s2, LatticeWeight::one());

        let (arcs, final_weight) = lat.path().unwrap();
        assert_eq!(arcs.iter().map(|a| a.olabel).collect::<Vec<_>>(), [7, 8]);
        assert!((final_weight.cost() - 0.0).abs() < 0.001);
    }

    #[test]
    fn shortest_path_picks_cheaper_branch() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(7, 5.0, s1));
        lat.add_arc(s0, arc(8, 1.0, s1));
        lat.add_arc(s1, arc(9, 1.0, s2));
        lat.set_final(s2, LatticeWeight::new(0.5, 0.0));

        let best = lat.shortest_path().unwrap();
        let (arcs, final_weight) = best.path().unwrap();

        assert_eq!(arcs.iter().map(|a| a.olabel).collect::<Vec<_>>(), [8, 9]);
        let total: f32 = arcs.iter().map(|a| a.weight.cost()).sum::<f32>() + final_weight.cost();
        assert!((total - 2.5).abs() < 0.001);
    }

    #[test]
    fn shortest_path_of_empty_lattice_is_none() {
        assert!(Lattice::new().shortest_path().is_none());
    }

    #[test]
    fn shortest_path_requires_reachable_final() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(7, 1.0, s1));

        assert!(lat.shortest_path().is_none());
    }
}
