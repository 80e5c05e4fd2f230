//! Vectorised per-group message storage.
//!
//! A [`MessageChunk`] owns every incoming message for one edge role of one
//! node group, packed into a single rectangular tensor so that message
//! updates are batched dense operations. The tensor has two interchangeable
//! layouts: `[max_degree, num_states, num_nodes]` for computing outgoing
//! messages, and `[max_degree * num_nodes, num_states]` for scattering
//! messages across edges by flat row offset. Nodes with fewer edges than
//! `max_degree` have their trailing slots filled with a pad column that is
//! neutral under the owning family's reduction.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView3, ArrayViewMut2, Ix2, Ix3, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;

use crate::numeric::normalize_states;

/// Minimum value a message entry may take.
pub const MSG_MIN: f64 = 1e-8;
/// Maximum value a message entry may take.
pub const MSG_MAX: f64 = 1.0 - 1e-8;

static CHUNK_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Stable identity of a [`MessageChunk`]. Used as a map key by the edge
/// index; unique for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ChunkId(usize);

impl ChunkId {
    fn fresh() -> Self {
        ChunkId(CHUNK_COUNT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Current shape of the message tensor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Layout {
    /// `[max_degree, num_states, num_nodes]`, for message computation.
    Compute,
    /// `[max_degree * num_nodes, num_states]`, for message distribution.
    Distribute,
}

/// A scalar applied to every state, or one value per state.
#[derive(Clone, Debug)]
pub enum InitVal {
    Scalar(f64),
    PerState(Array1<f64>),
}

impl InitVal {
    fn per_state(&self, num_states: usize) -> Array1<f64> {
        match self {
            InitVal::Scalar(v) => Array1::from_elem(num_states, *v),
            InitVal::PerState(v) => {
                assert_eq!(
                    v.len(),
                    num_states,
                    "per-state init value has {} entries for {} states",
                    v.len(),
                    num_states
                );
                v.clone()
            }
        }
    }
}

/// Strategy used to initialise real (non-padded) message slots.
#[derive(Clone, Debug)]
pub enum MsgInit {
    /// `min + range * U[0, 1)` per entry.
    Random { min: InitVal, range: InitVal },
    /// Every entry `1 / num_states`.
    Uniform,
}

impl Default for MsgInit {
    fn default() -> Self {
        MsgInit::Random {
            min: InitVal::Scalar(0.4),
            range: InitVal::Scalar(0.2),
        }
    }
}

/// Rectangular storage for all incoming messages on one edge role of one
/// node group.
pub struct MessageChunk {
    id: ChunkId,
    name: String,
    num_states: usize,
    num_entries: usize,
    max_degree: usize,
    degree: Vec<usize>,
    pad_msg_val: Option<Array1<f64>>,
    msg_init: MsgInit,
    msgs_in: ArrayD<f64>,
    layout: Layout,
    finalized: bool,
}

impl MessageChunk {
    /// A new, empty chunk. `num_states == 0` means the state count is still
    /// unknown and will be discovered from the first attached edge.
    pub fn new(name: &str, num_states: usize) -> Self {
        MessageChunk {
            id: ChunkId::fresh(),
            name: name.to_string(),
            num_states,
            num_entries: 0,
            max_degree: 0,
            degree: Vec::new(),
            pad_msg_val: None,
            msg_init: MsgInit::default(),
            msgs_in: ArrayD::zeros(IxDyn(&[0])),
            layout: Layout::Compute,
            finalized: false,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_nodes(&self) -> usize {
        self.num_entries
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Per-node edge counts on this role.
    pub fn degrees(&self) -> &[usize] {
        &self.degree
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The pad column written into unused degree slots. Defaults to the
    /// uniform column `1 / num_states` if never set.
    pub fn set_pad_msg_val(&mut self, pad: Array1<f64>) {
        assert!(!self.finalized, "Cannot make changes to a finalized MessageChunk");
        self.pad_msg_val = Some(pad);
    }

    pub fn set_msg_init(&mut self, init: MsgInit) {
        assert!(!self.finalized, "Cannot make changes to a finalized MessageChunk");
        self.msg_init = init;
    }

    /// Set the state count on a chunk whose states are still unknown.
    pub fn set_num_states(&mut self, num_states: usize) {
        assert!(!self.finalized, "Cannot make changes to a finalized MessageChunk");
        assert!(num_states > 0, "Number of states must be > 0");
        assert_eq!(
            self.num_states, 0,
            "MessageChunk: {} already has its state count set",
            self.name
        );
        self.num_states = num_states;
    }

    /// Extend the chunk by `count` nodes and return their dense ids.
    pub fn create_entries(&mut self, count: usize) -> Vec<usize> {
        assert!(!self.finalized, "Cannot make changes to a finalized MessageChunk");
        let ids = (self.num_entries..self.num_entries + count).collect();
        self.num_entries += count;
        self.degree.resize(self.num_entries, 0);
        ids
    }

    /// Claim the next free degree slot of `id` and return it.
    pub(crate) fn register_edge(&mut self, id: usize) -> usize {
        assert!(!self.finalized, "Cannot make changes to a finalized MessageChunk");
        assert!(
            id < self.num_entries,
            "node id {} out of range for MessageChunk: {}",
            id,
            self.name
        );
        let slot = self.degree[id];
        self.degree[id] += 1;
        if self.degree[id] > self.max_degree {
            self.max_degree = self.degree[id];
        }
        slot
    }

    /// Allocate and initialise the message tensor. Real slots follow the
    /// init strategy; every slot past a node's degree gets the pad column.
    pub fn finalize(&mut self, rng: &mut StdRng) {
        assert!(!self.finalized, "MessageChunk: {} is already finalized", self.name);
        assert!(self.num_entries > 0, "MessageChunk: {} is empty", self.name);
        assert!(
            self.num_states > 0,
            "MessageChunk: {} has no state count; attach at least one edge first",
            self.name
        );

        let pad = match &self.pad_msg_val {
            Some(p) => {
                assert_eq!(
                    p.len(),
                    self.num_states,
                    "MessageChunk: {} pad value has {} entries for {} states",
                    self.name,
                    p.len(),
                    self.num_states
                );
                p.clone()
            }
            None => Array1::from_elem(self.num_states, 1.0 / self.num_states as f64),
        };

        let mut msgs = self.alloc_messages(rng);
        for (i, &deg) in self.degree.iter().enumerate() {
            msgs.slice_mut(s![deg.., .., i]).assign(&pad);
        }

        self.pad_msg_val = Some(pad);
        self.msgs_in = msgs.into_dyn();
        self.layout = Layout::Compute;
        self.finalized = true;
    }

    fn alloc_messages(&self, rng: &mut StdRng) -> Array3<f64> {
        let sz = (self.max_degree, self.num_states, self.num_entries);
        match &self.msg_init {
            MsgInit::Uniform => Array3::from_elem(sz, 1.0 / self.num_states as f64),
            MsgInit::Random { min, range } => {
                let min = min.per_state(self.num_states).into_shape((1, self.num_states, 1)).unwrap();
                let range = range
                    .per_state(self.num_states)
                    .into_shape((1, self.num_states, 1))
                    .unwrap();
                let noise = Array3::random_using(sz, Uniform::new(0.0, 1.0), rng);
                let mut msgs = noise * &range + &min;
                // initial slots carry unit mass, like every later delivery
                normalize_states(&mut msgs);
                msgs
            }
        }
    }

    /// Clip `msgs` into `[MSG_MIN, MSG_MAX]`; if anything was clipped,
    /// re-normalise each column along the state axis.
    pub fn clamp_messages(&self, msgs: &mut Array3<f64>) {
        if msgs.is_empty() {
            return;
        }
        let mut changed = false;
        msgs.mapv_inplace(|x| {
            if x > MSG_MAX {
                changed = true;
                MSG_MAX
            } else if x < MSG_MIN {
                changed = true;
                MSG_MIN
            } else {
                x
            }
        });
        if changed {
            normalize_states(msgs);
        }
    }

    /// Reorder a `[D, S, N]` tensor into the `[D*N, S]` distribute shape, so
    /// that the row for degree slot `d` of node `i` is `d * N + i`.
    pub fn roll_for_distribution(msgs: Array3<f64>) -> Array2<f64> {
        let (d, s, n) = msgs.dim();
        let swapped = msgs.permuted_axes([0, 2, 1]);
        swapped
            .as_standard_layout()
            .to_owned()
            .into_shape((d * n, s))
            .unwrap()
    }

    /// Switch the stored messages to the distribute layout. No-op if already
    /// there.
    pub fn prepare_for_distribution(&mut self) {
        assert!(self.finalized, "Cannot unroll messages: MessageChunk must be finalized");
        if self.layout == Layout::Distribute {
            return;
        }
        let msgs = mem::replace(&mut self.msgs_in, ArrayD::zeros(IxDyn(&[0])));
        let msgs = msgs.into_dimensionality::<Ix3>().unwrap();
        self.msgs_in = Self::roll_for_distribution(msgs).into_dyn();
        self.layout = Layout::Distribute;
    }

    /// Switch the stored messages back to the compute layout. No-op if
    /// already there.
    pub fn prepare_for_computation(&mut self) {
        assert!(self.finalized, "Cannot roll messages: MessageChunk must be finalized");
        if self.layout == Layout::Compute {
            return;
        }
        let flat = mem::replace(&mut self.msgs_in, ArrayD::zeros(IxDyn(&[0])));
        let flat = flat.into_dimensionality::<Ix2>().unwrap();
        let cube = flat
            .into_shape((self.max_degree, self.num_entries, self.num_states))
            .unwrap()
            .permuted_axes([0, 2, 1]);
        self.msgs_in = cube.as_standard_layout().to_owned().into_dyn();
        self.layout = Layout::Compute;
    }

    /// Incoming messages in the compute layout `[D, S, N]`.
    pub fn msgs(&self) -> ArrayView3<f64> {
        assert!(
            self.finalized && self.layout == Layout::Compute,
            "MessageChunk: {} is not in the compute layout",
            self.name
        );
        self.msgs_in.view().into_dimensionality::<Ix3>().unwrap()
    }

    /// Incoming messages in the distribute layout `[D*N, S]`.
    pub(crate) fn flat_rows_mut(&mut self) -> ArrayViewMut2<f64> {
        assert!(
            self.finalized && self.layout == Layout::Distribute,
            "MessageChunk: {} is not in the distribute layout",
            self.name
        );
        self.msgs_in.view_mut().into_dimensionality::<Ix2>().unwrap()
    }
}
