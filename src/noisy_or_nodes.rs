//! Noisy-OR factor nodes.
//!
//! A noisy-OR factor has many binary `input` variables and one binary
//! `output`. Each input that is on fires the output independently with
//! probability `prob_success`, and the output also turns itself on with the
//! leak probability `leak_prob`:
//!
//! `p(z = 0 | inputs) = (1 - leak_prob) * (1 - prob_success)^(#on inputs)`.
//!
//! With `prob_success = 1` this is a leaky-OR: any on input forces the
//! output on. The message updates reduce by products only, so the semiring
//! choice does not alter them. Missing input slots are padded with `[1, 0]`
//! so they vanish from the products; missing outputs are padded uniform.

use ndarray::{array, s, Array2, Array3, Axis};
use rand::rngs::StdRng;

use crate::chunk::{ChunkId, InitVal, MessageChunk, MsgInit};
use crate::nodes::{BpAlgo, Role};
use crate::numeric::normalize_states;

/// Construction parameters for a [`NoisyOrNodes`] group.
#[derive(Clone, Debug)]
pub struct NoisyOrParams {
    pub leak_prob: f64,
    pub prob_success: f64,
    pub bp_algo: BpAlgo,
}

/// A group of noisy-OR factor nodes.
pub struct NoisyOrNodes {
    name: String,
    input: MessageChunk,
    output: MessageChunk,
    leak_prob: f64,
    prob_success: f64,
}

impl NoisyOrNodes {
    pub fn new(name: &str, params: NoisyOrParams) -> Self {
        let NoisyOrParams { leak_prob, prob_success, bp_algo: _ } = params;
        assert!(
            (0.0..=1.0).contains(&leak_prob),
            "leak_prob must be in [0, 1]"
        );
        assert!(
            (0.0..=1.0).contains(&prob_success),
            "prob_success must be in [0, 1]"
        );
        // noisy-OR variables are binary by definition, so the state count is
        // fixed up front; a factor may then legitimately end up with no
        // input edges at all (its product is empty and only the leak acts)
        let mut input = MessageChunk::new(&format!("{}_input", name), 2);
        let mut output = MessageChunk::new(&format!("{}_output", name), 2);
        // pads that have no effect: an absent input is off, an absent output
        // is uncertain
        input.set_pad_msg_val(array![1.0, 0.0]);
        output.set_pad_msg_val(array![0.5, 0.5]);
        // inputs start off, up to the leak
        input.set_msg_init(MsgInit::Random {
            min: InitVal::PerState(array![1.0 - leak_prob, leak_prob]),
            range: InitVal::Scalar(0.0),
        });
        NoisyOrNodes {
            name: name.to_string(),
            input,
            output,
            leak_prob,
            prob_success,
        }
    }

    /// A leaky-OR group: `prob_success` fixed to 1.
    pub fn leaky(name: &str, leak_prob: f64) -> Self {
        Self::new(
            name,
            NoisyOrParams {
                leak_prob,
                prob_success: 1.0,
                bp_algo: BpAlgo::Sum,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
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
            other => panic!("Bad edge role for noisy-OR group {}: {}", self.name, other),
        }
    }

    pub(crate) fn chunk_mut(&mut self, role: Role) -> &mut MessageChunk {
        match role {
            Role::Input => &mut self.input,
            Role::Output => &mut self.output,
            other => panic!("Bad edge role for noisy-OR group {}: {}", self.name, other),
        }
    }

    pub(crate) fn role_chunks(&self) -> Vec<(Role, &MessageChunk)> {
        vec![(Role::Input, &self.input), (Role::Output, &self.output)]
    }

    pub(crate) fn chunks_mut(&mut self) -> Vec<&mut MessageChunk> {
        vec![&mut self.input, &mut self.output]
    }

    pub(crate) fn finalize(&mut self, rng: &mut StdRng) {
        // checked before allocation so the binary-variable requirement is
        // reported ahead of any pad-length mismatch
        assert_eq!(
            self.input.num_states(),
            2,
            "Noisy-OR input variables must be binary"
        );
        assert_eq!(
            self.output.num_states(),
            2,
            "Noisy-OR output variables must be binary"
        );
        assert_eq!(
            self.output.max_degree(),
            1,
            "Noisy-OR factors take exactly one output edge"
        );
        self.input.finalize(rng);
        self.output.finalize(rng);
    }

    pub(crate) fn messages(&self) -> Vec<(ChunkId, Array3<f64>)> {
        let from_input = self.input.msgs(); // [D, 2, N]
        let from_output = self.output.msgs(); // [1, 2, N]
        let (deg, _, num_nodes) = from_input.dim();
        let fail = 1.0 - self.prob_success;
        let stay_off = 1.0 - self.leak_prob;

        // per-slot chance the slot leaves the output off
        let in_off = from_input.index_axis(Axis(1), 0);
        let in_on = from_input.index_axis(Axis(1), 1);
        let weights: Array2<f64> = &in_off + &(&in_on * fail); // [D, N]
        let all_off = weights.fold_axis(Axis(0), 1.0, |&acc, &w| acc * w); // [N]

        // message to the output
        let off = &all_off * stay_off;
        let mut to_output = Array3::zeros((1, 2, num_nodes));
        to_output.slice_mut(s![0, 1, ..]).assign(&off.mapv(|x| 1.0 - x));
        to_output.slice_mut(s![0, 0, ..]).assign(&off);

        // message to each input: divide its own weight back out of the
        // product, then fold in the output's preference
        let mut loo = weights.mapv(f64::recip);
        loo *= &all_off.view().insert_axis(Axis(0));
        let delta = &from_output.slice(s![0, 0, ..]) - &from_output.slice(s![0, 1, ..]); // [N]
        let mut tilt = loo;
        tilt *= stay_off;
        tilt *= &delta.view().insert_axis(Axis(0)); // [D, N]

        let out_on = from_output.slice(s![0, 1, ..]).insert_axis(Axis(0)); // [1, N]
        let mut msg_off = tilt.clone();
        msg_off += &out_on.broadcast((deg, num_nodes)).unwrap();
        let mut msg_on = tilt;
        msg_on *= fail;
        msg_on += &out_on.broadcast((deg, num_nodes)).unwrap();

        let mut to_input = Array3::zeros((deg, 2, num_nodes));
        to_input.slice_mut(s![.., 0, ..]).assign(&msg_off);
        to_input.slice_mut(s![.., 1, ..]).assign(&msg_on);
        normalize_states(&mut to_input);

        vec![(self.input.id(), to_input), (self.output.id(), to_output)]
    }
}
