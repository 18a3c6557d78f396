//! Deduplicating instruction store: every CFG node lives here, found again in
//! O(1) by instruction identity.

use crate::cfg::{CfgNode, NodeId};
use crate::Instruction;

/// Default number of buckets (2^16).
pub const DEFAULT_BUCKET_COUNT: usize = 65_536;

const M: u64 = 0x880355f21e6d1965;

#[inline]
fn mix(mut h: u64) -> u64 {
    h ^= h >> 23;
    h = h.wrapping_mul(0x2127598bf4325c37);
    h ^= h >> 47;
    h
}

/// fasthash-style 64-bit hash: consumes `buf` in 64-bit little-endian words
/// with a tail fold for the residual 1-7 bytes.
pub fn fasthash64(buf: &[u8], seed: u64) -> u64 {
    let mut h = seed ^ (buf.len() as u64).wrapping_mul(M);

    let mut chunks = buf.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        h ^= mix(u64::from_le_bytes(word));
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut v = 0u64;
        for (i, &b) in tail.iter().enumerate() {
            v ^= (b as u64) << (8 * i);
        }
        h ^= mix(v);
        h = h.wrapping_mul(M);
    }

    mix(h)
}

/// Hash an instruction: the opcode bytes dominate the spread, the address
/// seeds the mix.
pub fn hash_instruction(insn: &Instruction) -> u64 {
    fasthash64(insn.bytes(), insn.addr())
}

/// Separately-chained hash table keyed by instruction identity, owning every
/// CFG node for the lifetime of a trace.
///
/// The bytes participate in the hash but bucket scans compare addresses only:
/// two observations at one address are identical by construction, and address
/// comparison sidesteps any decoding-length ambiguity.
pub struct InstructionIndex {
    nodes: Vec<CfgNode>,
    buckets: Vec<Vec<NodeId>>,
    entries: usize,
    collisions: usize,
}

impl InstructionIndex {
    pub fn new() -> Self {
        Self::with_bucket_count(DEFAULT_BUCKET_COUNT)
    }

    /// A power-of-two `bucket_count` keeps the modulo cheap; other counts
    /// work but are never used by the tool.
    pub fn with_bucket_count(bucket_count: usize) -> Self {
        assert!(bucket_count > 0, "bucket count must be non-zero");
        InstructionIndex {
            nodes: Vec::new(),
            buckets: vec![Vec::new(); bucket_count],
            entries: 0,
            collisions: 0,
        }
    }

    fn bucket_of(&self, insn: &Instruction) -> usize {
        (hash_instruction(insn) % self.buckets.len() as u64) as usize
    }

    /// Insert a node, taking ownership. If a node with the same instruction
    /// address is already present, the new node is dropped and the existing
    /// id is returned. A collision is counted whenever the insertion proceeds
    /// into an already-occupied bucket.
    pub fn insert(&mut self, node: CfgNode) -> NodeId {
        let slot = self.bucket_of(node.instruction());
        let addr = node.instruction().addr();
        if let Some(&existing) = self.buckets[slot]
            .iter()
            .find(|&&id| self.nodes[id.as_usize()].instruction().addr() == addr)
        {
            return existing;
        }
        if !self.buckets[slot].is_empty() {
            self.collisions += 1;
        }
        let id = NodeId::from_usize(self.nodes.len());
        self.nodes.push(node);
        self.buckets[slot].push(id);
        self.entries += 1;
        id
    }

    /// Find the node holding `insn`, matching by address only.
    pub fn lookup(&self, insn: &Instruction) -> Option<NodeId> {
        let slot = self.bucket_of(insn);
        self.buckets[slot]
            .iter()
            .copied()
            .find(|id| self.nodes[id.as_usize()].instruction().addr() == insn.addr())
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id.as_usize()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut CfgNode {
        &mut self.nodes[id.as_usize()]
    }

    /// Number of unique instructions stored.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Number of insertions that landed in a non-empty bucket.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::from_usize)
    }
}

impl Default for InstructionIndex {
    fn default() -> Self {
        Self::new()
    }
}
