//! Node-group plumbing shared by the factor families.

use std::fmt;

use ndarray::Array3;
use rand::rngs::StdRng;

use crate::cat_nodes::CatNodes;
use crate::chunk::{ChunkId, MessageChunk};
use crate::noisy_or_nodes::NoisyOrNodes;
use crate::potts_nodes::PottsNodes;

/// Edge roles a factor group may declare. A role decides how a variable
/// participates in the factor's distribution, e.g. as one of many inputs to
/// a noisy-OR or as its single output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Role {
    Default,
    Input,
    Output,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Default => write!(f, "default"),
            Role::Input => write!(f, "input"),
            Role::Output => write!(f, "output"),
        }
    }
}

/// Semiring used for factor-side reductions: sum-product yields marginals,
/// max-product yields max-marginals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BpAlgo {
    Sum,
    Max,
}

/// A group of factor nodes of one parametric family.
pub enum FactorNodes {
    Cat(CatNodes),
    NoisyOr(NoisyOrNodes),
    Potts(PottsNodes),
}

impl From<CatNodes> for FactorNodes {
    fn from(f: CatNodes) -> Self {
        FactorNodes::Cat(f)
    }
}

impl From<NoisyOrNodes> for FactorNodes {
    fn from(f: NoisyOrNodes) -> Self {
        FactorNodes::NoisyOr(f)
    }
}

impl From<PottsNodes> for FactorNodes {
    fn from(f: PottsNodes) -> Self {
        FactorNodes::Potts(f)
    }
}

impl FactorNodes {
    pub fn name(&self) -> &str {
        match self {
            FactorNodes::Cat(f) => f.name(),
            FactorNodes::NoisyOr(f) => f.name(),
            FactorNodes::Potts(f) => f.name(),
        }
    }

    /// Create `count` factors across every role chunk of the group,
    /// returning their shared dense ids.
    pub fn create_nodes(&mut self, count: usize) -> Vec<usize> {
        match self {
            FactorNodes::Cat(f) => f.create_nodes(count),
            FactorNodes::NoisyOr(f) => f.create_nodes(count),
            FactorNodes::Potts(f) => f.create_nodes(count),
        }
    }

    /// The message chunk for one of the group's edge roles. Panics if the
    /// family does not declare the role.
    pub fn chunk(&self, role: Role) -> &MessageChunk {
        match self {
            FactorNodes::Cat(f) => f.chunk(role),
            FactorNodes::NoisyOr(f) => f.chunk(role),
            FactorNodes::Potts(f) => f.chunk(role),
        }
    }

    pub(crate) fn chunk_mut(&mut self, role: Role) -> &mut MessageChunk {
        match self {
            FactorNodes::Cat(f) => f.chunk_mut(role),
            FactorNodes::NoisyOr(f) => f.chunk_mut(role),
            FactorNodes::Potts(f) => f.chunk_mut(role),
        }
    }

    pub(crate) fn role_chunks(&self) -> Vec<(Role, &MessageChunk)> {
        match self {
            FactorNodes::Cat(f) => f.role_chunks(),
            FactorNodes::NoisyOr(f) => f.role_chunks(),
            FactorNodes::Potts(f) => f.role_chunks(),
        }
    }

    pub(crate) fn chunks_mut(&mut self) -> Vec<&mut MessageChunk> {
        match self {
            FactorNodes::Cat(f) => f.chunks_mut(),
            FactorNodes::NoisyOr(f) => f.chunks_mut(),
            FactorNodes::Potts(f) => f.chunks_mut(),
        }
    }

    pub(crate) fn finalize(&mut self, rng: &mut StdRng) {
        match self {
            FactorNodes::Cat(f) => f.finalize(rng),
            FactorNodes::NoisyOr(f) => f.finalize(rng),
            FactorNodes::Potts(f) => f.finalize(rng),
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.role_chunks()
            .first()
            .map(|(_, c)| c.is_finalized())
            .unwrap_or(false)
    }

    /// Compute the group's outgoing messages, one `[D, S, N]` tensor per
    /// role chunk, each clamped into the valid message range.
    pub(crate) fn compute_messages(&self) -> Vec<(ChunkId, Array3<f64>)> {
        let raw = match self {
            FactorNodes::Cat(f) => f.messages(),
            FactorNodes::NoisyOr(f) => f.messages(),
            FactorNodes::Potts(f) => f.messages(),
        };
        raw.into_iter()
            .map(|(id, mut msg)| {
                self.chunk_by_id(id).clamp_messages(&mut msg);
                (id, msg)
            })
            .collect()
    }

    fn chunk_by_id(&self, id: ChunkId) -> &MessageChunk {
        self.role_chunks()
            .into_iter()
            .map(|(_, c)| c)
            .find(|c| c.id() == id)
            .expect("internal error: message for a chunk this group does not own")
    }
}
