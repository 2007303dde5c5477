//! The node-list builder.

use super::{
    AlignMode, FuncData, InstNode, InstOptions, NodeData, NodeId, NodeVisitor, Operand, RegClass,
    Signature, VReg,
};
use crate::labels::Label;
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;

struct Node {
    data: NodeData,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Per-vreg information the builder tracks itself; use lists are built by
/// the allocator.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VRegInfo {
    pub class: RegClass,
    pub size: u8,
}

/// Records instructions, labels, and data in program order without emitting
/// anything. Nodes live in an arena and link to each other by index.
#[derive(Default)]
pub struct Builder {
    nodes: Vec<Option<Node>>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    vregs: Vec<VRegInfo>,
    labels: u32,
    open_func: bool,
}

impl Builder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh label in the builder's namespace. The serializer
    /// maps builder labels onto holder labels one-to-one.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    /// Number of labels allocated.
    pub fn label_count(&self) -> u32 {
        self.labels
    }

    /// Request a new virtual register of `class` with `size` bytes.
    pub fn new_vreg(&mut self, class: RegClass, size: u8) -> VReg {
        let vreg = VReg(u32::try_from(self.vregs.len()).unwrap());
        self.vregs.push(VRegInfo { class, size });
        vreg
    }

    /// Number of virtual registers requested.
    pub fn vreg_count(&self) -> usize {
        self.vregs.len()
    }

    pub(crate) fn vreg_class(&self, vreg: VReg) -> RegClass {
        self.vregs[vreg.index()].class
    }

    pub(crate) fn vreg_size(&self, vreg: VReg) -> u8 {
        self.vregs[vreg.index()].size
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap());
        self.nodes.push(Some(Node {
            data,
            prev: self.tail,
            next: None,
        }));
        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.index()].as_ref().expect("node was removed")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.index()].as_mut().expect("node was removed")
    }

    /// The node's payload.
    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.node(id).data
    }

    /// Mutable access to a node's payload, used by the allocator's rewriter.
    pub fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.node_mut(id).data
    }

    /// First node in program order.
    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    /// Last node in program order.
    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    /// Successor of `id` in program order.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).next
    }

    /// Predecessor of `id` in program order.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).prev
    }

    /// Append an instruction node.
    pub fn inst(
        &mut self,
        opcode: impl Into<u16>,
        operands: impl IntoIterator<Item = Operand>,
        options: InstOptions,
    ) -> NodeId {
        self.push(NodeData::Inst(InstNode {
            opcode: opcode.into(),
            operands: operands.into_iter().collect::<SmallVec<[Operand; 4]>>(),
            options,
        }))
    }

    /// Append a label-bind node.
    pub fn bind(&mut self, label: Label) -> NodeId {
        self.push(NodeData::BindLabel(label))
    }

    /// Append an alignment node.
    pub fn align(&mut self, mode: AlignMode, align: u32) -> NodeId {
        debug_assert!(align.is_power_of_two());
        self.push(NodeData::Align { mode, align })
    }

    /// Append embedded data.
    pub fn embed_data(&mut self, data: &[u8], elem_size: u8) -> NodeId {
        self.push(NodeData::EmbedData {
            data: data.to_vec(),
            elem_size,
        })
    }

    /// Append a comment node.
    pub fn comment(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Comment(text.to_string()))
    }

    /// Append a sentinel node.
    pub fn sentinel(&mut self, kind: u32) -> NodeId {
        self.push(NodeData::Sentinel(kind))
    }

    /// Open a function region. `args` names the virtual register that
    /// receives each parameter, in order.
    pub fn func_begin(&mut self, signature: Signature, args: &[VReg]) -> CodegenResult<NodeId> {
        if self.open_func {
            return Err(CodegenError::StateError(
                "func_begin inside an open function".to_string(),
            ));
        }
        if signature.params.len() != args.len() {
            return Err(CodegenError::StateError(format!(
                "signature has {} parameters but {} argument registers were supplied",
                signature.params.len(),
                args.len()
            )));
        }
        self.open_func = true;
        Ok(self.push(NodeData::FuncBegin(Box::new(FuncData {
            signature,
            args: args.to_vec(),
        }))))
    }

    /// Close the open function region.
    pub fn func_end(&mut self) -> CodegenResult<NodeId> {
        if !self.open_func {
            return Err(CodegenError::StateError(
                "func_end without func_begin".to_string(),
            ));
        }
        self.open_func = false;
        Ok(self.push(NodeData::FuncEnd))
    }

    /// Insert a new node after `after`, preserving list integrity.
    pub fn insert_after(&mut self, after: NodeId, data: NodeData) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap());
        let next = self.node(after).next;
        self.nodes.push(Some(Node {
            data,
            prev: Some(after),
            next,
        }));
        self.node_mut(after).next = Some(id);
        match next {
            Some(next) => self.node_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }
        id
    }

    /// Insert a new node before `before`.
    pub fn insert_before(&mut self, before: NodeId, data: NodeData) -> NodeId {
        match self.node(before).prev {
            Some(prev) => self.insert_after(prev, data),
            None => {
                let id = NodeId(u32::try_from(self.nodes.len()).unwrap());
                self.nodes.push(Some(Node {
                    data,
                    prev: None,
                    next: Some(before),
                }));
                self.node_mut(before).prev = Some(id);
                self.head = Some(id);
                id
            }
        }
    }

    /// Unlink and discard a node.
    pub fn remove(&mut self, id: NodeId) {
        let (prev, next) = {
            let node = self.node(id);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
        self.nodes[id.index()] = None;
    }

    /// Iterate node ids in program order.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter {
            builder: self,
            cursor: self.head,
        }
    }

    /// Walk the list exactly once, in forward order, invoking the visitor's
    /// callbacks.
    pub fn visit(&self, visitor: &mut impl NodeVisitor) -> CodegenResult<()> {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            match self.data(id) {
                NodeData::Inst(inst) => visitor.on_inst(inst)?,
                NodeData::BindLabel(label) => visitor.on_label(*label)?,
                NodeData::Align { mode, align } => visitor.on_align(*mode, *align)?,
                NodeData::EmbedData { data, elem_size } => {
                    visitor.on_embed_data(data, *elem_size)?
                }
                NodeData::Comment(text) => visitor.on_comment(text)?,
                NodeData::Sentinel(kind) => visitor.on_sentinel(*kind)?,
                NodeData::FuncBegin(func) => visitor.on_func_begin(func)?,
                NodeData::FuncEnd => visitor.on_func_end()?,
            }
            cursor = self.next(id);
        }
        Ok(())
    }
}

/// Iterator over live node ids in program order.
pub struct NodeIter<'a> {
    builder: &'a Builder,
    cursor: Option<NodeId>,
}

impl Iterator for NodeIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.builder.next(id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_preserve_links() {
        let mut b = Builder::new();
        let first = b.comment("first");
        let third = b.comment("third");
        let second = b.insert_after(first, NodeData::Comment("second".to_string()));
        let order: Vec<NodeId> = b.iter().collect();
        assert_eq!(order, vec![first, second, third]);

        b.remove(second);
        let order: Vec<NodeId> = b.iter().collect();
        assert_eq!(order, vec![first, third]);

        let zeroth = b.insert_before(first, NodeData::Comment("zeroth".to_string()));
        let order: Vec<NodeId> = b.iter().collect();
        assert_eq!(order, vec![zeroth, first, third]);
        assert_eq!(b.head(), Some(zeroth));
        assert_eq!(b.tail(), Some(third));
    }

    #[test]
    fn nested_functions_are_rejected() {
        let mut b = Builder::new();
        let sig = Signature {
            params: vec![],
            ret: None,
            call_conv: crate::env::CallConv::SystemV,
        };
        b.func_begin(sig.clone(), &[]).unwrap();
        assert!(b.func_begin(sig, &[]).is_err());
        b.func_end().unwrap();
        assert!(b.func_end().is_err());
    }
}
