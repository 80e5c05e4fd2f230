//! Categorical factor nodes.
//!
//! A categorical factor couples one discrete `input` variable with a bank of
//! binary `output` variables, exactly one of which is on:
//! `p(out_k = 1 | in = s) = probs[s][k]`. Success parameters are shared by
//! every factor in the group and are assigned to output slots in the order
//! the outputs were wired.

use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;

use crate::chunk::{ChunkId, MessageChunk};
use crate::nodes::{BpAlgo, Role};
use crate::numeric::normalize_states;

/// Construction parameters for a [`CatNodes`] group.
#[derive(Clone, Debug)]
pub struct CatParams {
    /// `[num_input_states, num_outputs]`; row `s` holds the output
    /// probabilities when the input takes state `s`.
    pub probs: Array2<f64>,
    pub bp_algo: BpAlgo,
}

/// A group of categorical factor nodes.
pub struct CatNodes {
    name: String,
    input: MessageChunk,
    output: MessageChunk,
    /// Success parameters as `[num_outputs, num_input_states, 1]`, ready to
    /// broadcast across the factors of the group.
    probs: Array3<f64>,
    algo: BpAlgo,
}

impl CatNodes {
    pub fn new(name: &str, params: CatParams) -> Self {
        let CatParams { probs, bp_algo } = params;
        assert!(
            probs.nrows() > 0 && probs.ncols() > 0,
            "Categorical probs must be non-empty"
        );
        let probs = probs
            .reversed_axes()
            .as_standard_layout()
            .to_owned()
            .insert_axis(Axis(2));
        CatNodes {
            name: name.to_string(),
            input: MessageChunk::new(&format!("{}_input", name), 0),
            output: MessageChunk::new(&format!("{}_output", name), 0),
            probs,
            algo: bp_algo,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_outputs(&self) -> usize {
        self.probs.shape()[0]
    }

    pub fn create_nodes(&mut self, count: usize) -> Vec<usize> {
        let ids = self.input.create_entries(count);
        self.output.create_entries(count);
        ids
    }

    pub fn chunk(&self, role: Role) -> &MessageChunk {
        match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
            other => panic!("Bad edge role for categorical group {}: {}", self.name, other),
        }
    }

    pub(crate) fn chunk_mut(&mut self, role: Role) -> &mut MessageChunk {
        match role {
            Role::Input => &mut self.input,
            Role::Output => &mut self.output,
            other => panic!("Bad edge role for categorical group {}: {}", self.name, other),
        }
    }

    pub(crate) fn role_chunks(&self) -> Vec<(Role, &MessageChunk)> {
        vec![(Role::Input, &self.input), (Role::Output, &self.output)]
    }

    pub(crate) fn chunks_mut(&mut self) -> Vec<&mut MessageChunk> {
        vec![&mut self.input, &mut self.output]
    }

    pub(crate) fn finalize(&mut self, rng: &mut StdRng) {
        self.input.finalize(rng);
        self.output.finalize(rng);
        assert_eq!(
            self.output.max_degree(),
            self.num_outputs(),
            "Number of outputs of categorical group {} does not match probs: {} vs {}",
            self.name,
            self.output.max_degree(),
            self.num_outputs()
        );
        assert_eq!(
            self.output.num_states(),
            2,
            "Categorical output variables must be binary"
        );
        assert_eq!(
            self.input.max_degree(),
            1,
            "Categorical factors take exactly one input edge"
        );
        assert_eq!(
            self.input.num_states(),
            self.probs.shape()[1],
            "Input state count of categorical group {} does not match probs: {} vs {}",
            self.name,
            self.input.num_states(),
            self.probs.shape()[1]
        );
    }

    pub(crate) fn messages(&self) -> Vec<(ChunkId, Array3<f64>)> {
        let from_outputs = self.output.msgs(); // [K, 2, N]
        let from_input = self.input.msgs(); // [1, S, N]
        let (num_out, _, num_nodes) = from_outputs.dim();
        let num_in_states = from_input.dim().1;
        let sh = (num_out, num_in_states, num_nodes);

        // odds of each output being on
        let ratio = &from_outputs.slice(s![.., 1..2, ..]) / &from_outputs.slice(s![.., 0..1, ..]);

        // message to the input: reduce the ratio-weighted table over outputs
        let weighted = &self.probs.broadcast(sh).unwrap() * &ratio.broadcast(sh).unwrap();
        let mut to_input = reduce_axis(&weighted, Axis(0), self.algo).insert_axis(Axis(0));
        normalize_states(&mut to_input);

        // message to each output: the on-mass comes from the weighted input,
        // the off-mass from the other outputs' on-masses (leave-one-out)
        let weighted_in = &self.probs.broadcast(sh).unwrap() * &from_input.broadcast(sh).unwrap();
        let m_on = reduce_axis(&weighted_in, Axis(1), self.algo); // [K, N]
        let pre = &ratio.index_axis(Axis(1), 0) * &m_on;
        let m_off = exclusive_reduce(&pre, self.algo);
        let mut to_output = Array3::zeros((num_out, 2, num_nodes));
        to_output.slice_mut(s![.., 0, ..]).assign(&m_off);
        to_output.slice_mut(s![.., 1, ..]).assign(&m_on);
        normalize_states(&mut to_output);

        vec![(self.input.id(), to_input), (self.output.id(), to_output)]
    }
}

fn reduce_axis(table: &Array3<f64>, axis: Axis, algo: BpAlgo) -> Array2<f64> {
    match algo {
        BpAlgo::Sum => table.sum_axis(axis),
        BpAlgo::Max => table.fold_axis(axis, f64::NEG_INFINITY, |&m, &x| m.max(x)),
    }
}

/// For each entry `[k, n]`, the reduction of column `n` over every slot
/// except `k`. A single-slot table reduces over the empty set, which is 0.
fn exclusive_reduce(vals: &Array2<f64>, algo: BpAlgo) -> Array2<f64> {
    let (num_slots, num_nodes) = vals.dim();
    if num_slots == 1 {
        return Array2::zeros((num_slots, num_nodes));
    }
    match algo {
        BpAlgo::Sum => {
            let total = vals.sum_axis(Axis(0)).insert_axis(Axis(0));
            &total.broadcast(vals.raw_dim()).unwrap() - vals
        }
        BpAlgo::Max => {
            let mut out = Array2::zeros((num_slots, num_nodes));
            for n in 0..num_nodes {
                let mut best = f64::NEG_INFINITY;
                let mut best_at = 0;
                let mut second = f64::NEG_INFINITY;
                for k in 0..num_slots {
                    let v = vals[[k, n]];
                    if v > best {
                        second = best;
                        best = v;
                        best_at = k;
                    } else if v > second {
                        second = v;
                    }
                }
                for k in 0..num_slots {
                    out[[k, n]] = if k == best_at { second } else { best };
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    /// One factor, binary input, two outputs, with known messages written
    /// into the chunks.
    fn wired_cat(algo: BpAlgo) -> CatNodes {
        let probs = array![[0.8, 0.2], [0.3, 0.7]];
        let mut cat = CatNodes::new("cat", CatParams { probs, bp_algo: algo });
        let ids = cat.create_nodes(1);
        cat.chunk_mut(Role::Input).set_num_states(2);
        cat.chunk_mut(Role::Output).set_num_states(2);
        cat.chunk_mut(Role::Input).register_edge(ids[0]);
        cat.chunk_mut(Role::Output).register_edge(ids[0]);
        cat.chunk_mut(Role::Output).register_edge(ids[0]);
        cat.finalize(&mut rng());

        // input message [0.5, 0.5]; output messages [0.5, 0.5] and [0.2, 0.8]
        cat.chunk_mut(Role::Input).prepare_for_distribution();
        cat.chunk_mut(Role::Input)
            .flat_rows_mut()
            .row_mut(0)
            .assign(&array![0.5, 0.5]);
        cat.chunk_mut(Role::Input).prepare_for_computation();
        cat.chunk_mut(Role::Output).prepare_for_distribution();
        {
            let mut rows = cat.chunk_mut(Role::Output).flat_rows_mut();
            rows.row_mut(0).assign(&array![0.5, 0.5]);
            rows.row_mut(1).assign(&array![0.2, 0.8]);
        }
        cat.chunk_mut(Role::Output).prepare_for_computation();
        cat
    }

    #[test]
    fn message_to_input_reduces_ratio_weighted_probs() {
        let cat = wired_cat(BpAlgo::Sum);
        let msgs = cat.messages();
        let (_, to_input) = &msgs[0];
        // ratios: output 0 -> 1.0, output 1 -> 4.0
        // state 0: 0.8*1 + 0.2*4 = 1.6; state 1: 0.3*1 + 0.7*4 = 3.1
        let tot = 1.6 + 3.1;
        assert_abs_diff_eq!(to_input[[0, 0, 0]], 1.6 / tot, epsilon = 1e-9);
        assert_abs_diff_eq!(to_input[[0, 1, 0]], 3.1 / tot, epsilon = 1e-9);
    }

    #[test]
    fn message_to_outputs_uses_leave_one_out_off_mass() {
        let cat = wired_cat(BpAlgo::Sum);
        let msgs = cat.messages();
        let (_, to_output) = &msgs[1];
        // on-masses: output 0 -> 0.8*0.5 + 0.3*0.5 = 0.55
        //            output 1 -> 0.2*0.5 + 0.7*0.5 = 0.45
        // off-masses are the other output's ratio-weighted on-mass
        let pre0 = 1.0 * 0.55;
        let pre1 = 4.0 * 0.45;
        let (on0, off0) = (0.55, pre1);
        let (on1, off1) = (0.45, pre0);
        assert_abs_diff_eq!(to_output[[0, 1, 0]], on0 / (on0 + off0), epsilon = 1e-9);
        assert_abs_diff_eq!(to_output[[0, 0, 0]], off0 / (on0 + off0), epsilon = 1e-9);
        assert_abs_diff_eq!(to_output[[1, 1, 0]], on1 / (on1 + off1), epsilon = 1e-9);
        assert_abs_diff_eq!(to_output[[1, 0, 0]], off1 / (on1 + off1), epsilon = 1e-9);
    }

    #[test]
    fn exclusive_reduce_sum_subtracts_own_slot() {
        let vals = array![[1.0, 10.0], [2.0, 20.0], [4.0, 40.0]];
        let out = exclusive_reduce(&vals, BpAlgo::Sum);
        assert_abs_diff_eq!(out[[0, 0]], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[1, 1]], 50.0, epsilon = 1e-12);
    }

    #[test]
    fn exclusive_reduce_max_uses_second_max_at_the_argmax() {
        let vals = array![[1.0], [5.0], [3.0]];
        let out = exclusive_reduce(&vals, BpAlgo::Max);
        assert_eq!(out[[0, 0]], 5.0);
        assert_eq!(out[[1, 0]], 3.0);
        assert_eq!(out[[2, 0]], 5.0);
    }

    #[test]
    fn exclusive_reduce_single_slot_is_zero() {
        let vals = array![[7.0, 9.0]];
        assert_eq!(exclusive_reduce(&vals, BpAlgo::Max), Array2::zeros((1, 2)));
        assert_eq!(exclusive_reduce(&vals, BpAlgo::Sum), Array2::zeros((1, 2)));
    }

    #[test]
    #[should_panic(expected = "does not match probs")]
    fn output_count_mismatch_panics() {
        let probs = array![[0.5, 0.5], [0.5, 0.5]];
        let mut cat = CatNodes::new("cat", CatParams { probs, bp_algo: BpAlgo::Sum });
        let ids = cat.create_nodes(1);
        cat.chunk_mut(Role::Input).set_num_states(2);
        cat.chunk_mut(Role::Output).set_num_states(2);
        cat.chunk_mut(Role::Input).register_edge(ids[0]);
        // only one of the two declared outputs is wired
        cat.chunk_mut(Role::Output).register_edge(ids[0]);
        cat.finalize(&mut rng());
    }

    #[test]
    #[should_panic(expected = "Bad edge role")]
    fn default_role_is_rejected() {
        let cat = CatNodes::new(
            "cat",
            CatParams { probs: array![[1.0]], bp_algo: BpAlgo::Sum },
        );
        cat.chunk(Role::Default);
    }
}
