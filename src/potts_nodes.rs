//! Potts factor nodes.
//!
//! A Potts factor couples exactly two variables over the same state
//! alphabet, multiplying configurations where they disagree by `alpha`:
//!
//! `F(x, y) = 1` if `x == y`, `alpha` otherwise.
//!
//! With `alpha < 1` both endpoints prefer to share a state. Both edges use
//! the single `default` role; the message out of one slot is computed from
//! the message into the other.

use ndarray::{s, Array3, Axis};
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::chunk::{ChunkId, MessageChunk};
use crate::nodes::{BpAlgo, Role};
use crate::numeric::normalize_states;

/// Construction parameters for a [`PottsNodes`] group.
#[derive(Clone, Debug)]
pub struct PottsParams {
    /// Off-diagonal factor value; `> 0`, typically `< 1`.
    pub alpha: f64,
    pub bp_algo: BpAlgo,
}

/// A group of degree-2 Potts factor nodes.
pub struct PottsNodes {
    name: String,
    chunk: MessageChunk,
    alpha: f64,
    algo: BpAlgo,
}

impl PottsNodes {
    pub fn new(name: &str, params: PottsParams) -> Self {
        assert!(params.alpha > 0.0, "alpha must be > 0");
        PottsNodes {
            name: name.to_string(),
            chunk: MessageChunk::new(&format!("{}_default", name), 0),
            alpha: params.alpha,
            algo: params.bp_algo,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_nodes(&mut self, count: usize) -> Vec<usize> {
        self.chunk.create_entries(count)
    }

    pub fn chunk(&self, role: Role) -> &MessageChunk {
        match role {
            Role::Default => &self.chunk,
            other => panic!("Bad edge role for Potts group {}: {}", self.name, other),
        }
    }

    pub(crate) fn chunk_mut(&mut self, role: Role) -> &mut MessageChunk {
        match role {
            Role::Default => &mut self.chunk,
            other => panic!("Bad edge role for Potts group {}: {}", self.name, other),
        }
    }

    pub(crate) fn role_chunks(&self) -> Vec<(Role, &MessageChunk)> {
        vec![(Role::Default, &self.chunk)]
    }

    pub(crate) fn chunks_mut(&mut self) -> Vec<&mut MessageChunk> {
        vec![&mut self.chunk]
    }

    pub(crate) fn finalize(&mut self, rng: &mut StdRng) {
        self.chunk.finalize(rng);
        assert!(
            self.chunk.degrees().iter().all(|&d| d == 2),
            "Potts factors in group {} must have exactly two edges",
            self.name
        );
    }

    pub(crate) fn messages(&self) -> Vec<(ChunkId, Array3<f64>)> {
        let msgs = self.chunk.msgs(); // [2, S, N]
        let (_, num_states, num_nodes) = msgs.dim();

        // the message out of each slot starts from the other slot's input
        let mut out = Array3::zeros((2, num_states, num_nodes));
        out.slice_mut(s![0, .., ..]).assign(&msgs.slice(s![1, .., ..]));
        out.slice_mut(s![1, .., ..]).assign(&msgs.slice(s![0, .., ..]));

        let alpha = self.alpha;
        match self.algo {
            BpAlgo::Sum => {
                // sum over the neighbour's states: the matching state keeps
                // full weight, the rest contribute alpha times their mass
                out.mapv_inplace(|x| x * (1.0 - alpha) + alpha);
            }
            BpAlgo::Max => {
                // each state competes with alpha times the neighbour's best
                // state; the best state itself competes with the runner-up
                out.axis_iter_mut(Axis(2)).into_par_iter().for_each(|mut per_node| {
                    for slot in 0..2 {
                        let mut lane = per_node.row_mut(slot);
                        let mut best = f64::NEG_INFINITY;
                        let mut best_at = 0;
                        let mut second = f64::NEG_INFINITY;
                        for (state, &v) in lane.iter().enumerate() {
                            if v > best {
                                second = best;
                                best = v;
                                best_at = state;
                            } else if v > second {
                                second = v;
                            }
                        }
                        for (state, v) in lane.iter_mut().enumerate() {
                            let rival = if state == best_at { alpha * second } else { alpha * best };
                            if *v < rival {
                                *v = rival;
                            }
                        }
                    }
                });
            }
        }
        normalize_states(&mut out);
        vec![(self.chunk.id(), out)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(13)
    }

    fn wired_potts(algo: BpAlgo, alpha: f64, slot0: &[f64], slot1: &[f64]) -> PottsNodes {
        let mut potts = PottsNodes::new("potts", PottsParams { alpha, bp_algo: algo });
        let ids = potts.create_nodes(1);
        potts.chunk_mut(Role::Default).set_num_states(slot0.len());
        potts.chunk_mut(Role::Default).register_edge(ids[0]);
        potts.chunk_mut(Role::Default).register_edge(ids[0]);
        potts.finalize(&mut rng());

        potts.chunk_mut(Role::Default).prepare_for_distribution();
        {
            let mut rows = potts.chunk_mut(Role::Default).flat_rows_mut();
            rows.row_mut(0).assign(&ndarray::aview1(slot0));
            rows.row_mut(1).assign(&ndarray::aview1(slot1));
        }
        potts.chunk_mut(Role::Default).prepare_for_computation();
        potts
    }

    #[test]
    fn sum_product_is_affine_in_the_swapped_message() {
        let alpha = 0.1;
        let potts = wired_potts(BpAlgo::Sum, alpha, &[0.6, 0.4], &[0.2, 0.8]);
        let msgs = potts.messages();
        let out = &msgs[0].1;
        // slot 0 sends a function of slot 1's incoming message
        let expect = [0.2 * 0.9 + 0.1, 0.8 * 0.9 + 0.1];
        let tot = expect[0] + expect[1];
        assert_abs_diff_eq!(out[[0, 0, 0]], expect[0] / tot, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[0, 1, 0]], expect[1] / tot, epsilon = 1e-12);
        // and vice versa
        let expect = [0.6 * 0.9 + 0.1, 0.4 * 0.9 + 0.1];
        let tot = expect[0] + expect[1];
        assert_abs_diff_eq!(out[[1, 0, 0]], expect[0] / tot, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[1, 1, 0]], expect[1] / tot, epsilon = 1e-12);
    }

    #[test]
    fn max_product_uses_runner_up_at_the_best_state() {
        let alpha = 0.5;
        let potts = wired_potts(BpAlgo::Max, alpha, &[0.7, 0.2, 0.1], &[0.1, 0.6, 0.3]);
        let msgs = potts.messages();
        let out = &msgs[0].1;
        // slot 0: from [0.1, 0.6, 0.3], best 0.6 at state 1, second 0.3
        let expect = [
            (0.1f64).max(0.5 * 0.6), // 0.3
            (0.6f64).max(0.5 * 0.3), // 0.6
            (0.3f64).max(0.5 * 0.6), // 0.3
        ];
        let tot: f64 = expect.iter().sum();
        for state in 0..3 {
            assert_abs_diff_eq!(out[[0, state, 0]], expect[state] / tot, epsilon = 1e-12);
        }
        // slot 1: from [0.7, 0.2, 0.1], best 0.7 at state 0, second 0.2
        let expect = [
            (0.7f64).max(0.5 * 0.2), // 0.7
            (0.2f64).max(0.5 * 0.7), // 0.35
            (0.1f64).max(0.5 * 0.7), // 0.35
        ];
        let tot: f64 = expect.iter().sum();
        for state in 0..3 {
            assert_abs_diff_eq!(out[[1, state, 0]], expect[state] / tot, epsilon = 1e-12);
        }
    }

    #[test]
    fn sum_product_with_uniform_input_stays_uniform() {
        let potts = wired_potts(BpAlgo::Sum, 0.3, &[0.5, 0.5], &[0.5, 0.5]);
        let msgs = potts.messages();
        let out = &msgs[0].1;
        for d in 0..2 {
            for state in 0..2 {
                assert_abs_diff_eq!(out[[d, state, 0]], 0.5, epsilon = 1e-12);
            }
        }
    }

    #[test]
    #[should_panic(expected = "alpha must be > 0")]
    fn non_positive_alpha_panics() {
        PottsNodes::new("potts", PottsParams { alpha: 0.0, bp_algo: BpAlgo::Sum });
    }

    #[test]
    #[should_panic(expected = "exactly two edges")]
    fn degree_one_factor_panics() {
        let mut potts = PottsNodes::new("potts", PottsParams { alpha: 0.5, bp_algo: BpAlgo::Sum });
        let ids = potts.create_nodes(1);
        potts.chunk_mut(Role::Default).set_num_states(2);
        potts.chunk_mut(Role::Default).register_edge(ids[0]);
        potts.finalize(&mut rng());
    }

    #[test]
    #[should_panic(expected = "Bad edge role")]
    fn roles_other_than_default_are_rejected() {
        let potts = PottsNodes::new("potts", PottsParams { alpha: 0.5, bp_algo: BpAlgo::Sum });
        potts.chunk(Role::Input);
    }
}
