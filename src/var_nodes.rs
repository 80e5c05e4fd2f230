//! Variable-node groups.
//!
//! Outgoing messages follow the sum-product rule regardless of the peer
//! factor's semiring: the product of all other incoming messages and any
//! attached unary potentials, computed in the log domain with log-sum-exp
//! normalisation. Beliefs are the product of all incoming messages and
//! unaries, normalised the same way.

use itertools::izip;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use rand::rngs::StdRng;

use crate::chunk::{ChunkId, MessageChunk, MsgInit};
use crate::numeric::{log_sum_exp_nodes, log_sum_exp_states};

/// Clip bound for unary potentials, preventing `log(0)` while preserving the
/// dominance of a hard conditioning.
const UNARY_MIN: f64 = 1e-12;
const UNARY_MAX: f64 = 1.0 - 1e-12;

/// Construction parameters for a [`VarNodes`] group.
#[derive(Clone, Debug)]
pub struct VarParams {
    pub num_states: usize,
    pub msg_init: MsgInit,
}

impl Default for VarParams {
    fn default() -> Self {
        VarParams {
            num_states: 2,
            msg_init: MsgInit::default(),
        }
    }
}

/// A group of variable nodes sharing a state count.
pub struct VarNodes {
    name: String,
    chunk: MessageChunk,
    num_states: usize,
    /// One row of log potentials per unary, `[K, S]`. After finalisation
    /// with full coverage the rows are sorted by node id and `unary_idx` is
    /// dropped, so the table is indexed by position.
    log_unary: Option<Array2<f64>>,
    unary_idx: Option<Vec<usize>>,
}

impl VarNodes {
    pub fn new(name: &str, params: VarParams) -> Self {
        assert!(params.num_states >= 2, "Variable nodes need at least 2 states");
        let mut chunk = MessageChunk::new(&format!("{}_vars", name), params.num_states);
        chunk.set_msg_init(params.msg_init);
        VarNodes {
            name: name.to_string(),
            chunk,
            num_states: params.num_states,
            log_unary: None,
            unary_idx: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn chunk(&self) -> &MessageChunk {
        &self.chunk
    }

    pub(crate) fn chunk_mut(&mut self) -> &mut MessageChunk {
        &mut self.chunk
    }

    pub fn is_finalized(&self) -> bool {
        self.chunk.is_finalized()
    }

    /// Create `count` variable nodes and return their dense ids.
    pub fn create_nodes(&mut self, count: usize) -> Vec<usize> {
        self.chunk.create_entries(count)
    }

    /// Attach unary potentials to the given nodes, one row of `unary_vals`
    /// per id. Rows are normalised, clipped away from zero and stored as
    /// logs; a node that already has a unary gets the new log potential
    /// added onto its existing row.
    pub fn add_unaries(&mut self, node_ids: &[usize], unary_vals: ArrayView2<f64>) {
        assert!(
            !self.chunk.is_finalized(),
            "Cannot make changes to finalized variable nodes: {}",
            self.name
        );
        assert_eq!(
            unary_vals.nrows(),
            node_ids.len(),
            "Must specify one unary potential row per node id"
        );
        assert_eq!(
            unary_vals.ncols(),
            self.num_states,
            "Unary potentials must specify the same number of states as the node"
        );
        for &id in node_ids {
            assert!(
                id < self.chunk.num_nodes(),
                "node id {} out of range for variable nodes: {}",
                id,
                self.name
            );
        }

        let mut vals = unary_vals.to_owned();
        let sums = vals.sum_axis(Axis(1)).insert_axis(Axis(1));
        vals /= &sums.broadcast(vals.raw_dim()).unwrap();
        vals.mapv_inplace(|x| x.max(UNARY_MIN).min(UNARY_MAX));
        let sums = vals.sum_axis(Axis(1)).insert_axis(Axis(1));
        vals /= &sums.broadcast(vals.raw_dim()).unwrap();
        vals.mapv_inplace(f64::ln);

        match (&mut self.log_unary, &mut self.unary_idx) {
            (Some(table), Some(idx)) => {
                let mut fresh_vals = Vec::new();
                let mut fresh_ids = Vec::new();
                for (row, &id) in vals.outer_iter().zip(node_ids.iter()) {
                    if let Some(pos) = idx.iter().position(|&j| j == id) {
                        let mut existing = table.row_mut(pos);
                        existing += &row;
                    } else {
                        fresh_vals.extend(row.iter().cloned());
                        fresh_ids.push(id);
                    }
                }
                if !fresh_ids.is_empty() {
                    let fresh =
                        Array2::from_shape_vec((fresh_ids.len(), self.num_states), fresh_vals)
                            .unwrap();
                    let grown =
                        ndarray::concatenate(Axis(0), &[table.view(), fresh.view()]).unwrap();
                    *table = grown;
                    idx.extend(fresh_ids);
                }
            }
            _ => {
                self.log_unary = Some(vals);
                self.unary_idx = Some(node_ids.to_vec());
            }
        }
    }

    /// Attach a single unary potential given as a plain slice.
    pub fn add_unary(&mut self, node_id: usize, unary_vals: &[f64]) {
        let vals = ndarray::aview1(unary_vals).insert_axis(Axis(0));
        self.add_unaries(&[node_id], vals);
    }

    /// Condition the given nodes to be in `state` by attaching a (clipped)
    /// one-hot unary.
    pub fn condition_on(&mut self, node_ids: &[usize], state: usize) {
        assert!(
            state < self.num_states,
            "Conditioning state {} out of range for {} states",
            state,
            self.num_states
        );
        let mut vals = Array2::zeros((node_ids.len(), self.num_states));
        vals.column_mut(state).fill(1.0);
        self.add_unaries(node_ids, vals.view());
    }

    pub(crate) fn finalize(&mut self, rng: &mut StdRng) {
        // With a unary on every node the table can be indexed by position
        // once its rows are sorted by node id.
        if let (Some(table), Some(idx)) = (&self.log_unary, &self.unary_idx) {
            if idx.len() == self.chunk.num_nodes() {
                let mut order: Vec<usize> = (0..idx.len()).collect();
                order.sort_by_key(|&k| idx[k]);
                self.log_unary = Some(table.select(Axis(0), &order));
                self.unary_idx = None;
            }
        }
        self.chunk.finalize(rng);
    }

    fn include_unary(&self, log_table: &mut Array2<f64>) {
        match (&self.log_unary, &self.unary_idx) {
            (Some(table), Some(idx)) => {
                for (row, &node) in izip!(table.outer_iter(), idx.iter()) {
                    let mut col = log_table.column_mut(node);
                    col += &row;
                }
            }
            (Some(table), None) => {
                *log_table += &table.t();
            }
            (None, _) => {}
        }
    }

    fn messages(&self) -> Array3<f64> {
        let msgs = self.chunk.msgs();
        let (deg, num_states, num_nodes) = msgs.dim();

        // A degree-2 group swaps its two slots; no log arithmetic needed.
        if deg == 2 {
            let mut out = Array3::zeros((2, num_states, num_nodes));
            out.slice_mut(s![0, .., ..]).assign(&msgs.slice(s![1, .., ..]));
            out.slice_mut(s![1, .., ..]).assign(&msgs.slice(s![0, .., ..]));
            return out;
        }

        let mut log_msgs = msgs.to_owned();
        log_msgs.par_mapv_inplace(f64::ln);
        let mut total = log_msgs.sum_axis(Axis(0));
        self.include_unary(&mut total);

        // Leave-one-out in the log domain: subtract each slot from the total.
        let mut out = -log_msgs;
        let total = total.insert_axis(Axis(0));
        out += &total.broadcast(out.raw_dim()).unwrap();
        let lse = log_sum_exp_states(&out);
        out -= &lse.broadcast(out.raw_dim()).unwrap();
        out.par_mapv_inplace(f64::exp);
        out
    }

    pub(crate) fn compute_messages(&self) -> Vec<(ChunkId, Array3<f64>)> {
        let mut out = self.messages();
        self.chunk.clamp_messages(&mut out);
        vec![(self.chunk.id(), out)]
    }

    /// Current beliefs of the group as a `[num_states, num_nodes]` table of
    /// probabilities.
    pub fn beliefs(&self) -> Array2<f64> {
        let msgs = self.chunk.msgs();
        let mut log_msgs = msgs.to_owned();
        log_msgs.par_mapv_inplace(f64::ln);
        let mut log_bel = log_msgs.sum_axis(Axis(0));
        self.include_unary(&mut log_bel);
        let denom = log_sum_exp_nodes(&log_bel).insert_axis(Axis(0));
        log_bel -= &denom.broadcast(log_bel.raw_dim()).unwrap();
        log_bel.mapv_inplace(f64::exp);
        log_bel
    }

    /// Most likely state of every node under the current beliefs.
    pub fn map_states(&self) -> Vec<usize> {
        self.beliefs()
            .axis_iter(Axis(1))
            .map(|col| col.argmax().expect("belief column has no ordering"))
            .collect()
    }
}
