//! Per-instruction control-flow graph grown from observed execution.
//!
//! [`CfgBuilder::observe`] is the single driving operation: the tracing loop
//! hands it each executed instruction in order, and the builder extends the
//! graph edge by edge under a call-return discipline. A shadow stack mirrors
//! the unmatched call sites of the current dynamic path so that a return can
//! be credited to its caller: the continuation edge is drawn from the call
//! site to the returned-to instruction, not from the `ret` itself.

use crate::index::InstructionIndex;
use crate::{Address, InsnKind, Instruction, TraceError};

/// Handle to a node owned by the instruction index. Because the index
/// deduplicates by instruction address, two equal ids always mean the same
/// address and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_usize(i: usize) -> Self {
        NodeId(i as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Discovery-order index of the function a node belongs to.
pub type FunctionId = u16;

/// One graph node per unique executed instruction.
#[derive(Debug)]
pub struct CfgNode {
    insn: Instruction,
    in_degree: u32,
    successors: Vec<NodeId>,
    function: FunctionId,
    label: String,
}

impl CfgNode {
    /// A basic instruction can only ever have one successor; everything else
    /// starts with room for two.
    pub fn new(insn: Instruction, label: String) -> Self {
        let cap = match insn.kind() {
            InsnKind::Basic => 1,
            _ => 2,
        };
        CfgNode {
            insn,
            in_degree: 0,
            successors: Vec::with_capacity(cap),
            function: 0,
            label,
        }
    }

    pub fn instruction(&self) -> &Instruction {
        &self.insn
    }

    pub fn kind(&self) -> InsnKind {
        self.insn.kind()
    }

    /// Count of edges terminating at this node.
    pub fn in_degree(&self) -> u32 {
        self.in_degree
    }

    pub fn out_degree(&self) -> usize {
        self.successors.len()
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    /// Allocated successor slots; grown in powers of two.
    pub fn successor_capacity(&self) -> usize {
        self.successors.capacity()
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Pre-formatted `"<hex addr>  <hex bytes>  <mnemonic>  <operands>"` line.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn push_successor(&mut self, id: NodeId) {
        if self.successors.len() == self.successors.capacity() {
            // Keep the capacity a power of two while appending in O(1) amortized.
            self.successors.reserve_exact(self.successors.capacity());
        }
        self.successors.push(id);
    }

    fn add_predecessor(&mut self) {
        self.in_degree += 1;
    }

    fn set_function(&mut self, tag: FunctionId) {
        self.function = tag;
    }
}

/// Function roots in the order they were first entered at runtime.
/// Element 0 is the program entry point.
#[derive(Debug, Default)]
pub struct FunctionRoster {
    roots: Vec<NodeId>,
}

impl FunctionRoster {
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<NodeId> {
        self.roots.get(i).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.iter().copied()
    }

    fn push(&mut self, id: NodeId) {
        self.roots.push(id);
    }
}

/// Stateful CFG construction over a linear stream of executed instructions.
pub struct CfgBuilder {
    index: InstructionIndex,
    roster: FunctionRoster,
    /// Unmatched call sites on the current dynamic path, last-in first-out.
    shadow: Vec<NodeId>,
    prev: Option<NodeId>,
    observed: u64,
}

impl CfgBuilder {
    pub fn new() -> Self {
        Self::with_bucket_count(crate::index::DEFAULT_BUCKET_COUNT)
    }

    pub fn with_bucket_count(bucket_count: usize) -> Self {
        CfgBuilder {
            index: InstructionIndex::with_bucket_count(bucket_count),
            roster: FunctionRoster::default(),
            shadow: Vec::new(),
            prev: None,
            observed: 0,
        }
    }

    /// Begin a fresh dynamic path: clears the previous-node cursor and the
    /// shadow stack, keeping the graph and roster. Call this before each
    /// traced run so the last instruction of one run is not wired to the
    /// entry of the next.
    pub fn start_path(&mut self) {
        self.prev = None;
        self.shadow.clear();
    }

    /// Feed one executed instruction.
    ///
    /// `label` is the pre-formatted display line for the instruction; it is
    /// cached on first sight and ignored on re-observation.
    pub fn observe(
        &mut self,
        addr: Address,
        size: u8,
        opcodes: &[u8],
        label: &str,
    ) -> Result<(), TraceError> {
        let insn = Instruction::new(addr, size, opcodes)?;
        self.observed += 1;

        let (node, first_seen) = match self.index.lookup(&insn) {
            Some(id) => (id, false),
            None => {
                let id = self.index.insert(CfgNode::new(insn, label.to_string()));
                (id, true)
            }
        };

        let prev = match self.prev {
            Some(p) => p,
            None => {
                if self.roster.is_empty() {
                    // The first instruction ever seen roots function 0.
                    self.roster.push(node);
                }
                self.prev = Some(node);
                return Ok(());
            }
        };

        let mut promoted = false;
        if self.index.node(prev).kind() == InsnKind::Call {
            // The call site may still be returned to later, so it is pushed
            // even when the callee was seen before.
            self.shadow.push(prev);
            if first_seen {
                // First-seen call target: a newly discovered function.
                let tag = self.roster.len() as FunctionId;
                self.index.node_mut(node).set_function(tag);
                self.roster.push(node);
                promoted = true;
            }
        }

        self.link(prev, node, first_seen && !promoted)?;
        self.prev = Some(node);
        Ok(())
    }

    /// Install the edge `prev -> node` under the per-kind successor policy.
    fn link(&mut self, prev: NodeId, node: NodeId, inherit_tag: bool) -> Result<(), TraceError> {
        if self.index.node(prev).successors().contains(&node) {
            return Ok(());
        }

        let pkind = self.index.node(prev).kind();
        if self.index.node(prev).out_degree() == 0 && pkind != InsnKind::Ret {
            self.attach(prev, node, inherit_tag);
            return Ok(());
        }

        match pkind {
            InsnKind::Basic => Err(self.contract_violation(prev)),
            InsnKind::Branch => {
                if self.index.node(prev).out_degree() >= 2 {
                    return Err(self.contract_violation(prev));
                }
                self.attach(prev, node, inherit_tag);
                Ok(())
            }
            // A call keeps its single direct successor; continuation edges
            // are credited to it by the callee's return below.
            InsnKind::Call => Ok(()),
            InsnKind::Jump => {
                self.attach(prev, node, inherit_tag);
                Ok(())
            }
            InsnKind::Ret => {
                let mut src = prev;
                if let Some(&call_site) = self.shadow.last() {
                    let returns_to = self.index.node(node).instruction().addr();
                    if returns_to == self.index.node(call_site).instruction().next_addr() {
                        // Normal fall-through return: draw the edge from the
                        // call site, and retire it from the shadow stack.
                        src = call_site;
                        self.shadow.pop();
                        if self.index.node(src).successors().contains(&node) {
                            return Ok(());
                        }
                    }
                }
                // Mismatched or unmatched returns (tail calls, longjmp) leave
                // the ret attached as an ordinary multi-successor node.
                self.attach(src, node, inherit_tag);
                Ok(())
            }
        }
    }

    fn attach(&mut self, from: NodeId, to: NodeId, inherit_tag: bool) {
        let tag = self.index.node(from).function();
        self.index.node_mut(from).push_successor(to);
        let to_node = self.index.node_mut(to);
        to_node.add_predecessor();
        if inherit_tag {
            to_node.set_function(tag);
        }
    }

    fn contract_violation(&self, id: NodeId) -> TraceError {
        let insn = self.index.node(id).instruction();
        TraceError::ClassifierContract {
            addr: insn.addr(),
            kind: insn.kind(),
        }
    }

    /// Total observations fed in, repeats included.
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Depth of the shadow call stack on the current path.
    pub fn shadow_depth(&self) -> usize {
        self.shadow.len()
    }

    pub fn index(&self) -> &InstructionIndex {
        &self.index
    }

    pub fn roster(&self) -> &FunctionRoster {
        &self.roster
    }

    /// Seal the builder into an immutable graph. Stopping mid-trace is fine:
    /// every completed `observe` leaves the graph coherent.
    pub fn finish(self) -> Cfg {
        Cfg {
            index: self.index,
            roster: self.roster,
            observed: self.observed,
        }
    }
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The finished (or interrupted) observed-execution graph.
pub struct Cfg {
    index: InstructionIndex,
    roster: FunctionRoster,
    observed: u64,
}

impl Cfg {
    pub fn node(&self, id: NodeId) -> &CfgNode {
        self.index.node(id)
    }

    pub fn roster(&self) -> &FunctionRoster {
        &self.roster
    }

    /// Root node of the `i`-th discovered function.
    pub fn function_root(&self, i: usize) -> Option<NodeId> {
        self.roster.get(i)
    }

    pub fn entries(&self) -> usize {
        self.index.entries()
    }

    pub fn collisions(&self) -> usize {
        self.index.collisions()
    }

    pub fn bucket_count(&self) -> usize {
        self.index.bucket_count()
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOP: &[u8] = &[0x90];
    const RET: &[u8] = &[0xC3];
    const CALL5: &[u8] = &[0xE8, 0x00, 0x00, 0x00, 0x00];
    const JZ: &[u8] = &[0x74, 0x05];
    const JMP_RAX: &[u8] = &[0xFF, 0xE0];

    fn obs(b: &mut CfgBuilder, addr: Address, bytes: &[u8]) {
        b.observe(addr, bytes.len() as u8, bytes, &format!("0x{addr:x}  insn"))
            .unwrap();
    }

    fn node_at(b: &CfgBuilder, addr: Address) -> NodeId {
        b.index()
            .node_ids()
            .find(|&id| b.index().node(id).instruction().addr() == addr)
            .expect("node should exist")
    }

    /// Check the structural invariants over the whole graph.
    fn assert_invariants(b: &CfgBuilder) {
        let ids: Vec<NodeId> = b.index().node_ids().collect();
        for &n in &ids {
            let node = b.index().node(n);
            assert!(node.out_degree() <= node.successor_capacity());
            assert!(node.successor_capacity().is_power_of_two());
            match node.kind() {
                InsnKind::Basic => assert!(node.out_degree() <= 1),
                InsnKind::Branch => assert!(node.out_degree() <= 2),
                _ => {}
            }
            let preds = ids
                .iter()
                .filter(|&&m| b.index().node(m).successors().contains(&n))
                .count();
            assert_eq!(node.in_degree() as usize, preds);
            assert_eq!(b.index().lookup(node.instruction()), Some(n));
        }
    }

    #[test]
    fn test_linear_basics() {
        // S1: nop, nop, ret in a straight line.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, NOP);
        obs(&mut b, 0x1001, NOP);
        obs(&mut b, 0x1002, RET);

        assert_eq!(b.index().entries(), 3);
        assert_eq!(b.roster().len(), 1);
        assert_eq!(b.roster().get(0), Some(node_at(&b, 0x1000)));

        let first = b.index().node(node_at(&b, 0x1000));
        assert_eq!(first.kind(), InsnKind::Basic);
        assert_eq!(first.successors(), &[node_at(&b, 0x1001)]);
        let second = b.index().node(node_at(&b, 0x1001));
        assert_eq!(second.successors(), &[node_at(&b, 0x1002)]);
        let last = b.index().node(node_at(&b, 0x1002));
        assert_eq!(last.kind(), InsnKind::Ret);
        assert_eq!(last.out_degree(), 0);
        assert_invariants(&b);
    }

    #[test]
    fn test_call_return_matching() {
        // S2: call into a tiny function, return to the fall-through.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, CALL5);
        obs(&mut b, 0x2000, NOP);
        assert_eq!(b.shadow_depth(), 1);
        obs(&mut b, 0x2001, RET);
        obs(&mut b, 0x1005, NOP);
        assert_eq!(b.shadow_depth(), 0);

        assert_eq!(b.roster().len(), 2);
        assert_eq!(b.roster().get(1), Some(node_at(&b, 0x2000)));

        let call = b.index().node(node_at(&b, 0x1000));
        // Direct edge into the callee plus the continuation edge added by ret.
        assert_eq!(
            call.successors(),
            &[node_at(&b, 0x2000), node_at(&b, 0x1005)]
        );
        // The ret itself keeps no successor.
        assert_eq!(b.index().node(node_at(&b, 0x2001)).out_degree(), 0);

        // Function tags: callee gets a fresh tag, continuation stays caller's.
        assert_eq!(b.index().node(node_at(&b, 0x2000)).function(), 1);
        assert_eq!(b.index().node(node_at(&b, 0x2001)).function(), 1);
        assert_eq!(b.index().node(node_at(&b, 0x1005)).function(), 0);
        assert_invariants(&b);
    }

    #[test]
    fn test_branch_both_arms() {
        // S3: a conditional observed taken in one run, falling through in another.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, NOP);
        obs(&mut b, 0x1001, JZ);
        obs(&mut b, 0x1008, NOP);

        b.start_path();
        obs(&mut b, 0x1000, NOP);
        obs(&mut b, 0x1001, JZ);
        obs(&mut b, 0x1003, NOP);

        let branch = b.index().node(node_at(&b, 0x1001));
        assert_eq!(branch.kind(), InsnKind::Branch);
        assert_eq!(branch.out_degree(), 2);
        // Successors in insertion order: taken first, fall-through second.
        assert_eq!(
            branch.successors(),
            &[node_at(&b, 0x1008), node_at(&b, 0x1003)]
        );
        assert_invariants(&b);
    }

    #[test]
    fn test_indirect_jump_divergence() {
        // S4: one indirect jump, four targets over four runs.
        let mut b = CfgBuilder::new();
        for (i, target) in [0x2000u64, 0x3000, 0x4000, 0x5000].iter().enumerate() {
            b.start_path();
            obs(&mut b, 0x1000, JMP_RAX);
            obs(&mut b, *target, NOP);
            let jump = b.index().node(node_at(&b, 0x1000));
            assert_eq!(jump.out_degree(), i + 1);
        }
        let jump = b.index().node(node_at(&b, 0x1000));
        assert_eq!(jump.out_degree(), 4);
        assert_eq!(jump.successor_capacity(), 4);
        assert_invariants(&b);
    }

    #[test]
    fn test_direct_self_loop() {
        // S5 precondition: a basic instruction re-entered immediately.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, NOP);
        obs(&mut b, 0x1000, NOP);
        let node = b.index().node(node_at(&b, 0x1000));
        assert_eq!(node.successors(), &[node_at(&b, 0x1000)]);
        assert_eq!(node.in_degree(), 1);
        // Re-observing the loop adds nothing.
        obs(&mut b, 0x1000, NOP);
        let node = b.index().node(node_at(&b, 0x1000));
        assert_eq!(node.out_degree(), 1);
        assert_eq!(b.index().entries(), 1);
        assert_invariants(&b);
    }

    #[test]
    fn test_repeat_run_is_idempotent() {
        // S6: the call/ret/fall-through pattern run twice.
        let mut b = CfgBuilder::new();
        for _ in 0..2 {
            b.start_path();
            obs(&mut b, 0x1000, CALL5);
            obs(&mut b, 0x2000, NOP);
            obs(&mut b, 0x2001, RET);
            obs(&mut b, 0x1005, NOP);
        }
        assert_eq!(b.roster().len(), 2);
        assert_eq!(b.index().entries(), 4);
        assert_eq!(b.shadow_depth(), 0);
        let call = b.index().node(node_at(&b, 0x1000));
        assert_eq!(call.out_degree(), 2);
        // in-degrees unchanged by the second run.
        assert_eq!(b.index().node(node_at(&b, 0x1005)).in_degree(), 1);
        assert_eq!(b.observed(), 8);
        assert_invariants(&b);
    }

    #[test]
    fn test_tail_call_to_bare_ret() {
        // A call whose target is immediately a ret still pops correctly.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, CALL5);
        obs(&mut b, 0x3000, RET);
        obs(&mut b, 0x1005, NOP);

        assert_eq!(b.shadow_depth(), 0);
        let call = b.index().node(node_at(&b, 0x1000));
        assert_eq!(
            call.successors(),
            &[node_at(&b, 0x3000), node_at(&b, 0x1005)]
        );
        assert_eq!(b.roster().len(), 2);
        assert_invariants(&b);
    }

    #[test]
    fn test_unmatched_ret_appends() {
        // Empty shadow stack: the edge lands on the ret node itself.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x2001, RET);
        obs(&mut b, 0x5000, NOP);
        let ret = b.index().node(node_at(&b, 0x2001));
        assert_eq!(ret.successors(), &[node_at(&b, 0x5000)]);
        assert_invariants(&b);
    }

    #[test]
    fn test_mismatched_ret_leaves_stack() {
        // Shadow top does not match the returned-to address: no pop, edge on ret.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, CALL5);
        obs(&mut b, 0x2000, NOP);
        obs(&mut b, 0x2001, RET);
        obs(&mut b, 0x9000, NOP);
        assert_eq!(b.shadow_depth(), 1);
        let ret = b.index().node(node_at(&b, 0x2001));
        assert_eq!(ret.successors(), &[node_at(&b, 0x9000)]);
        assert_invariants(&b);
    }

    #[test]
    fn test_basic_overdegree_aborts() {
        // A basic instruction followed by two different addresses can only
        // mean the classifier mislabeled it.
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, NOP);
        obs(&mut b, 0x1001, NOP);
        b.start_path();
        obs(&mut b, 0x1000, NOP);
        let err = b.observe(0x2000, 1, NOP, "0x2000  nop").unwrap_err();
        assert!(matches!(
            err,
            TraceError::ClassifierContract {
                addr: 0x1000,
                kind: InsnKind::Basic
            }
        ));
    }

    #[test]
    fn test_branch_overdegree_aborts() {
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, JZ);
        obs(&mut b, 0x2000, NOP);
        b.start_path();
        obs(&mut b, 0x1000, JZ);
        obs(&mut b, 0x3000, NOP);
        b.start_path();
        obs(&mut b, 0x1000, JZ);
        let err = b.observe(0x4000, 1, NOP, "0x4000  nop").unwrap_err();
        assert!(matches!(
            err,
            TraceError::ClassifierContract {
                kind: InsnKind::Branch,
                ..
            }
        ));
    }

    #[test]
    fn test_roster_counts_first_seen_call_targets() {
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, CALL5);
        obs(&mut b, 0x2000, RET);
        obs(&mut b, 0x1005, CALL5);
        obs(&mut b, 0x3000, RET);
        obs(&mut b, 0x100a, NOP);
        // Entry plus two first-seen call targets.
        assert_eq!(b.roster().len(), 3);
        let roots: Vec<Address> = b
            .roster()
            .iter()
            .map(|id| b.index().node(id).instruction().addr())
            .collect();
        assert_eq!(roots, vec![0x1000, 0x2000, 0x3000]);

        // Calling an already-known target discovers nothing new.
        b.start_path();
        obs(&mut b, 0x1005, CALL5);
        obs(&mut b, 0x3000, RET);
        assert_eq!(b.roster().len(), 3);
        assert_invariants(&b);
    }

    #[test]
    fn test_max_size_instruction() {
        let mut b = CfgBuilder::new();
        let long = [0x66u8; 15];
        b.observe(0x1000, 15, &long, "0x1000  long").unwrap();
        let node = b.index().node(node_at(&b, 0x1000));
        assert_eq!(node.instruction().size(), 15);
        assert_eq!(node.instruction().bytes().len(), 15);
    }

    #[test]
    fn test_first_label_is_kept() {
        let mut b = CfgBuilder::new();
        b.observe(0x1000, 1, NOP, "first").unwrap();
        b.observe(0x1000, 1, NOP, "second").unwrap();
        assert_eq!(b.index().node(node_at(&b, 0x1000)).label(), "first");
    }

    #[test]
    fn test_finish_preserves_counters() {
        let mut b = CfgBuilder::new();
        obs(&mut b, 0x1000, NOP);
        obs(&mut b, 0x1001, RET);
        let cfg = b.finish();
        assert_eq!(cfg.entries(), 2);
        assert_eq!(cfg.observed(), 2);
        assert!(cfg.function_root(0).is_some());
        assert!(cfg.function_root(1).is_none());
    }
}
