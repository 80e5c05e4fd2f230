//! The factor-graph engine.
//!
//! A [`BpGraph`] owns every node group, the edge index between their message
//! chunks, and the message-passing loop. Construction wires variable groups
//! to factor groups through [`add_edge`](BpGraph::add_edge); finalisation
//! allocates and initialises every message tensor and compacts the edge
//! index; [`do_message_passing`](BpGraph::do_message_passing) then iterates
//! damped updates in schedule order until variable beliefs hold still for a
//! streak of iterations.
//!
//! The schedule is asynchronous: each group reads the messages already
//! delivered earlier in the same iteration, so ordering follows the
//! insertion order of [`add_nodes_to_schedule`](BpGraph::add_nodes_to_schedule).

use std::collections::HashMap;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use itertools::izip;
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::chunk::{ChunkId, MessageChunk};
use crate::edge_index::EdgeIndex;
use crate::nodes::{FactorNodes, Role};
use crate::var_nodes::VarNodes;

/// Parameters of the message-passing loop.
#[derive(Clone, Debug)]
pub struct BpParams {
    /// Iteration cap.
    pub iters: usize,
    /// Damping applied at message delivery:
    /// `new = damp * old + (1 - damp) * computed`.
    pub damp: f64,
    /// Number of consecutive converged iterations required to stop.
    pub streak_lim: usize,
    /// Maximum absolute belief change still counted as converged.
    pub tol: f64,
    /// Seed for random message initialisation.
    pub seed: u64,
    /// Show a progress bar while iterating.
    pub progress: bool,
    /// Print the per-iteration diagnostic line.
    pub verbose: bool,
}

impl Default for BpParams {
    fn default() -> Self {
        BpParams {
            iters: 1000,
            damp: 0.8,
            streak_lim: 10,
            tol: 1e-4,
            seed: 0,
            progress: false,
            verbose: true,
        }
    }
}

/// Handle to a variable group owned by a [`BpGraph`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VarRef(usize);

/// Handle to a factor group owned by a [`BpGraph`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FactorRef(usize);

/// Handle to either kind of group, used for scheduling.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupRef {
    Var(VarRef),
    Factor(FactorRef),
}

impl From<VarRef> for GroupRef {
    fn from(v: VarRef) -> Self {
        GroupRef::Var(v)
    }
}

impl From<FactorRef> for GroupRef {
    fn from(f: FactorRef) -> Self {
        GroupRef::Factor(f)
    }
}

#[derive(Clone, Copy)]
enum ChunkHome {
    Var(usize),
    Factor(usize, Role),
}

/// A factor graph plus everything needed to run loopy belief propagation
/// over it.
pub struct BpGraph {
    params: BpParams,
    vars: Vec<VarNodes>,
    factors: Vec<FactorNodes>,
    schedule: Vec<GroupRef>,
    edges: EdgeIndex,
    chunk_homes: HashMap<ChunkId, ChunkHome>,
    finalized: bool,
}

impl BpGraph {
    pub fn new(params: BpParams) -> Self {
        BpGraph {
            params,
            vars: Vec::new(),
            factors: Vec::new(),
            schedule: Vec::new(),
            edges: EdgeIndex::new(),
            chunk_homes: HashMap::new(),
            finalized: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BpParams::default())
    }

    pub fn params(&self) -> &BpParams {
        &self.params
    }

    /// Take ownership of a variable group and return a handle to it.
    pub fn add_var_nodes(&mut self, group: VarNodes) -> VarRef {
        assert!(!self.finalized, "Cannot add groups to a finalized BP graph");
        self.vars.push(group);
        VarRef(self.vars.len() - 1)
    }

    /// Take ownership of a factor group and return a handle to it.
    pub fn add_factor_nodes(&mut self, group: impl Into<FactorNodes>) -> FactorRef {
        assert!(!self.finalized, "Cannot add groups to a finalized BP graph");
        self.factors.push(group.into());
        FactorRef(self.factors.len() - 1)
    }

    pub fn var_nodes(&self, var: VarRef) -> &VarNodes {
        &self.vars[var.0]
    }

    pub fn var_nodes_mut(&mut self, var: VarRef) -> &mut VarNodes {
        &mut self.vars[var.0]
    }

    pub fn factor_nodes(&self, factor: FactorRef) -> &FactorNodes {
        &self.factors[factor.0]
    }

    pub fn factor_nodes_mut(&mut self, factor: FactorRef) -> &mut FactorNodes {
        &mut self.factors[factor.0]
    }

    /// Current beliefs of a variable group, `[num_states, num_nodes]`.
    pub fn beliefs(&self, var: VarRef) -> Array2<f64> {
        self.vars[var.0].beliefs()
    }

    /// Append a group to the message-passing schedule. Idempotent; the
    /// insertion order is the order groups emit within each iteration.
    pub fn add_nodes_to_schedule(&mut self, group: impl Into<GroupRef>) {
        assert!(!self.finalized, "Cannot schedule groups on a finalized BP graph");
        let group = group.into();
        if !self.schedule.contains(&group) {
            self.schedule.push(group);
        }
    }

    /// Wire variable `var_id` of `var` to factor `factor_id` of `factor` on
    /// the given edge role. The factor role adopts the variable's state
    /// count on first use and must agree with it afterwards.
    pub fn add_edge(
        &mut self,
        var: VarRef,
        var_id: usize,
        factor: FactorRef,
        factor_id: usize,
        role: Role,
    ) {
        assert!(!self.finalized, "Cannot add edges to a finalized BP graph");

        let num_states = self.vars[var.0].chunk().num_states();
        let factor_chunk = self.factors[factor.0].chunk_mut(role);
        if factor_chunk.num_states() == 0 {
            factor_chunk.set_num_states(num_states);
        } else {
            assert_eq!(
                factor_chunk.num_states(),
                num_states,
                "Factor edge chunk and variable chunk must have the same number of states"
            );
        }
        let factor_chunk_id = factor_chunk.id();
        let factor_slot = factor_chunk.register_edge(factor_id);

        let var_chunk = self.vars[var.0].chunk_mut();
        let var_chunk_id = var_chunk.id();
        let var_slot = var_chunk.register_edge(var_id);

        self.edges.add_edge(
            var_chunk_id,
            var_id,
            var_slot,
            factor_chunk_id,
            factor_id,
            factor_slot,
        );
    }

    /// Allocate and initialise every message tensor and compact the edge
    /// index. No topology or evidence changes are permitted afterwards.
    pub fn finalize(&mut self) {
        assert!(!self.finalized, "BP graph can only be finalized once");
        assert!(
            !self.schedule.is_empty(),
            "No groups added to the message-passing schedule; use add_nodes_to_schedule first"
        );

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let schedule = self.schedule.clone();
        for group in schedule {
            match group {
                GroupRef::Var(v) => self.vars[v.0].finalize(&mut rng),
                GroupRef::Factor(f) => self.factors[f.0].finalize(&mut rng),
            }
        }
        // groups that were wired but never scheduled still need storage so
        // their peers can deliver into them
        for var in self.vars.iter_mut() {
            if !var.is_finalized() {
                var.finalize(&mut rng);
            }
        }
        for factor in self.factors.iter_mut() {
            if !factor.is_finalized() {
                factor.finalize(&mut rng);
            }
        }

        let mut sizes = HashMap::new();
        for (i, var) in self.vars.iter().enumerate() {
            let chunk = var.chunk();
            sizes.insert(chunk.id(), chunk.num_nodes());
            self.chunk_homes.insert(chunk.id(), ChunkHome::Var(i));
        }
        for (i, factor) in self.factors.iter().enumerate() {
            for (role, chunk) in factor.role_chunks() {
                sizes.insert(chunk.id(), chunk.num_nodes());
                self.chunk_homes.insert(chunk.id(), ChunkHome::Factor(i, role));
            }
        }
        self.edges.finalize(&sizes);
        self.finalized = true;
    }

    /// Run the message-passing loop until convergence or the iteration cap.
    /// Prints one diagnostic line per iteration.
    pub fn do_message_passing(&mut self) {
        assert!(
            self.finalized,
            "BP graph has not been finalized; call finalize() before message-passing"
        );

        let mut prev_bel: Vec<Option<Array2<f64>>> = vec![None; self.schedule.len()];
        let mut streak = 0usize;
        let bar = if self.params.progress {
            let bar = ProgressBar::new(self.params.iters as u64);
            bar.set_style(ProgressStyle::default_spinner().template(
                "{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ({pos}/{len}, ETA {eta})",
            ));
            bar.set_message("Calculating BP...");
            Some(bar)
        } else {
            None
        };

        for itt in 0..self.params.iters {
            let start = Instant::now();
            for k in 0..self.schedule.len() {
                let outgoing = match self.schedule[k] {
                    GroupRef::Var(v) => self.vars[v.0].compute_messages(),
                    GroupRef::Factor(f) => self.factors[f.0].compute_messages(),
                };
                for (source, msgs) in outgoing {
                    self.distribute_messages(source, msgs);
                }
            }
            let elapsed = start.elapsed().as_secs_f64();

            let (max_diff, is_converged) = if itt == 0 {
                (0.0, false)
            } else {
                self.check_converged(&prev_bel)
            };

            if self.params.verbose {
                let line = format!("{}: maxDiff: {:.6}. Time: {:.6}", itt, max_diff, elapsed);
                match &bar {
                    Some(bar) => bar.println(line),
                    None => println!("{}", line),
                }
            }

            if is_converged {
                streak += 1;
            } else {
                streak = 0;
            }
            if streak >= self.params.streak_lim {
                if self.params.verbose {
                    let line = format!("Converged on iteration: {}", itt);
                    match &bar {
                        Some(bar) => bar.println(line),
                        None => println!("{}", line),
                    }
                }
                break;
            }

            for (k, group) in self.schedule.iter().enumerate() {
                if let GroupRef::Var(v) = group {
                    prev_bel[k] = Some(self.vars[v.0].beliefs());
                }
            }
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        // leave every chunk ready for belief readout
        for var in self.vars.iter_mut() {
            var.chunk_mut().prepare_for_computation();
        }
        for factor in self.factors.iter_mut() {
            for chunk in factor.chunks_mut() {
                chunk.prepare_for_computation();
            }
        }
    }

    /// Scatter one computed `[D, S, N]` tensor into the chunks its edges
    /// lead to, damping each delivered row against the destination's
    /// current value.
    fn distribute_messages(&mut self, source: ChunkId, msgs: Array3<f64>) {
        let flat = MessageChunk::roll_for_distribution(msgs);
        let BpGraph {
            edges,
            vars,
            factors,
            chunk_homes,
            params,
            ..
        } = self;
        let damp = params.damp;

        for (dest, rows, cols) in edges.dests_of(source) {
            let chunk = match chunk_homes[&dest] {
                ChunkHome::Var(i) => vars[i].chunk_mut(),
                ChunkHome::Factor(i, role) => factors[i].chunk_mut(role),
            };
            chunk.prepare_for_distribution();
            {
                let mut stored = chunk.flat_rows_mut();
                for (&src_row, &dst_row) in izip!(rows.column(cols[0]), rows.column(cols[1])) {
                    let delivered = flat.row(src_row);
                    stored
                        .row_mut(dst_row)
                        .zip_mut_with(&delivered, |old, &new| {
                            *old = damp * *old + (1.0 - damp) * new
                        });
                }
            }
            chunk.prepare_for_computation();
        }
    }

    fn check_converged(&self, prev_bel: &[Option<Array2<f64>>]) -> (f64, bool) {
        let mut max_diff = 0.0f64;
        for (k, group) in self.schedule.iter().enumerate() {
            if let GroupRef::Var(v) = group {
                let bel = self.vars[v.0].beliefs();
                let prev = prev_bel[k]
                    .as_ref()
                    .expect("missing belief snapshot for a scheduled variable group");
                let diff = (&bel - prev).fold(0.0f64, |acc, &x| nan_max(acc, x.abs()));
                max_diff = nan_max(max_diff, diff);
            }
        }
        assert!(!max_diff.is_nan(), "Belief difference is NaN");
        (max_diff, max_diff <= self.params.tol)
    }
}

/// `max` that propagates NaN instead of discarding it.
fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}
