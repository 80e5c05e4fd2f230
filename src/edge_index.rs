//! Edge tables between message chunks.
//!
//! Edges of the factor graph are stored against unordered chunk pairs rather
//! than as cross-references between group objects, so the engine owns the
//! groups and this index owns only integer offsets. During construction each
//! edge is a `(id, slot)` pair per endpoint; finalisation rewrites every row
//! into the two flat offsets that address the endpoints' distribute-layout
//! tensors directly.

use std::collections::HashMap;

use ndarray::Array2;

use crate::chunk::ChunkId;

pub struct EdgeIndex {
    /// Build phase: `[id_a, slot_a, id_b, slot_b]` per edge, keyed by chunk pair.
    rows: HashMap<(ChunkId, ChunkId), Vec<[usize; 4]>>,
    /// Finalised: `[n_edges, 2]` flat offsets into the distribute layouts.
    offsets: HashMap<(ChunkId, ChunkId), Array2<usize>>,
    /// For each chunk, the pair keys it participates in.
    peers: HashMap<ChunkId, Vec<(ChunkId, ChunkId)>>,
    finalized: bool,
}

impl EdgeIndex {
    pub fn new() -> Self {
        EdgeIndex {
            rows: HashMap::new(),
            offsets: HashMap::new(),
            peers: HashMap::new(),
            finalized: false,
        }
    }

    /// Record an edge between node `a_id` of chunk `a` (occupying degree slot
    /// `a_slot`) and node `b_id` of chunk `b` (slot `b_slot`).
    pub fn add_edge(
        &mut self,
        a: ChunkId,
        a_id: usize,
        a_slot: usize,
        b: ChunkId,
        b_id: usize,
        b_slot: usize,
    ) {
        assert!(!self.finalized, "Cannot add edges to a finalized edge index");
        self.rows
            .entry((a, b))
            .or_insert_with(Vec::new)
            .push([a_id, a_slot, b_id, b_slot]);
    }

    /// Compact every row list and rewrite each edge into a pair of flat
    /// offsets `(slot * num_nodes + id)` for its two endpoint chunks.
    /// `num_nodes` maps every referenced chunk to its node count. Calling
    /// this twice is a no-op, so the offsets are stable.
    pub fn finalize(&mut self, num_nodes: &HashMap<ChunkId, usize>) {
        if self.finalized {
            return;
        }
        for ((a, b), rows) in self.rows.iter() {
            let n_a = *num_nodes
                .get(a)
                .expect("edge references a chunk unknown to the engine");
            let n_b = *num_nodes
                .get(b)
                .expect("edge references a chunk unknown to the engine");
            let mut table = Array2::zeros((rows.len(), 2));
            for (r, edge) in rows.iter().enumerate() {
                table[[r, 0]] = edge[1] * n_a + edge[0];
                table[[r, 1]] = edge[3] * n_b + edge[2];
            }
            self.offsets.insert((*a, *b), table);
            for &c in [*a, *b].iter() {
                self.peers.entry(c).or_insert_with(Vec::new).push((*a, *b));
            }
        }
        self.rows.clear();
        self.finalized = true;
    }

    /// Every chunk the given chunk sends messages to. Each entry carries the
    /// compacted offset table and `[src_col, dst_col]`, selecting which of
    /// its two columns holds the source rows for this direction.
    pub fn dests_of(&self, chunk: ChunkId) -> Vec<(ChunkId, &Array2<usize>, [usize; 2])> {
        assert!(self.finalized, "Edge index has not been finalized");
        let mut res = Vec::new();
        if let Some(keys) = self.peers.get(&chunk) {
            for key in keys {
                let table = &self.offsets[key];
                if chunk == key.0 {
                    res.push((key.1, table, [0, 1]));
                } else {
                    res.push((key.0, table, [1, 0]));
                }
            }
        }
        res
    }
}

impl Default for EdgeIndex {
    fn default() -> Self {
        Self::new()
    }
}
