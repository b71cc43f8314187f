//! Electrical nodes and their alias chains.
//!
//! The same table shape serves both a cell definition's local nodes and the
//! global flattened graph.  Nodes live in an arena and are threaded onto a
//! circular doubly-linked list through index fields, so merging two nodes
//! unlinks one in constant time without disturbing iteration order.  Every
//! node heads a singly linked chain of name bindings; the first binding in
//! the chain is the canonical name and decides how the node prints.

use arcstr::ArcStr;
use indexmap::IndexMap;

use crate::geom::Rect;
use crate::hiername::{HierId, HierPool};

/// An opaque handle to a node within one [`NodeTable`].
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(u32);

/// An opaque handle to a name binding within one [`NodeTable`].
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NameId(u32);

const SENTINEL: NodeId = NodeId(0);

/// Node state flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags(u16);

impl NodeFlags {
    /// The node was killed; neither it nor anything connected to it is
    /// output.
    pub const KILLED: NodeFlags = NodeFlags(0x01);
    /// Created as a device substrate terminal; merges silently with other
    /// nodes of the same name after flattening.
    pub const DEVTERM: NodeFlags = NodeFlags(0x02);
    /// General-purpose marker for special nets.
    pub const SPECIAL: NodeFlags = NodeFlags(0x04);
    /// The node is a subcircuit port.
    pub const PORT: NodeFlags = NodeFlags(0x08);
    /// A substrate node with a local name, i.e. an implicitly defined port.
    pub const SUBS_PORT: NodeFlags = NodeFlags(0x10);
    /// A substrate node declared by a `substrate` record.
    pub const SUBS_NODE: NodeFlags = NodeFlags(0x20);
    /// Declared after the first `killnode` line of its file.
    pub const AFTER_KILL: NodeFlags = NodeFlags(0x40);

    /// The empty flag set.
    pub const fn empty() -> Self {
        NodeFlags(0)
    }

    /// Whether all flags in `other` are set.
    pub const fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets all flags in `other`.
    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    /// Clears all flags in `other`.
    pub fn remove(&mut self, other: NodeFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;
    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// A text attribute attached to a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attr {
    /// Attribute text.
    pub text: ArcStr,
    /// Location of the attribute label.
    pub loc: Rect,
    /// Layer-type index the label is attached to.
    pub layer: usize,
}

/// Accumulated area and perimeter for one resistance class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PerimArea {
    /// Total area.
    pub area: i64,
    /// Total perimeter.
    pub perim: i64,
}

/// A single electrical node.
#[derive(Clone, Debug)]
pub struct Node {
    /// State flags.
    pub flags: NodeFlags,
    /// Capacitance to substrate, in attofarads.
    pub cap: f64,
    /// Index into the layer-name table.
    pub layer: usize,
    /// A 1x1 rectangle contained in the node, for locating it in the layout.
    pub loc: Rect,
    /// Attribute labels, most recently read first.
    pub attrs: Vec<Attr>,
    /// Per-resistance-class accumulated (area, perimeter).
    pub pa: Vec<PerimArea>,
    name: Option<NameId>,
    next: NodeId,
    prev: NodeId,
}

/// A binding from a hierarchical name to a node.
#[derive(Clone, Debug)]
pub struct NodeName {
    /// The interned name.
    pub hier: HierId,
    /// Port index, when the name declares a port.
    pub port: Option<usize>,
    node: NodeId,
    next: Option<NameId>,
}

impl NodeName {
    /// The node this binding points at.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The next binding in the node's alias chain.
    pub fn next(&self) -> Option<NameId> {
        self.next
    }
}

/// A table of nodes and name bindings.
pub struct NodeTable {
    nodes: Vec<Node>,
    names: Vec<NodeName>,
    by_name: IndexMap<HierId, NameId>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        let sentinel = Node {
            flags: NodeFlags::empty(),
            cap: 0.0,
            layer: 0,
            loc: Rect::default(),
            attrs: Vec::new(),
            pa: Vec::new(),
            name: None,
            next: SENTINEL,
            prev: SENTINEL,
        };
        Self {
            nodes: vec![sentinel],
            names: Vec::new(),
            by_name: IndexMap::new(),
        }
    }

    /// The node for a handle.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Mutable access to a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// The name binding for a handle.
    pub fn name(&self, id: NameId) -> &NodeName {
        &self.names[id.0 as usize]
    }

    /// Mutable access to a name binding.
    pub fn name_mut(&mut self, id: NameId) -> &mut NodeName {
        &mut self.names[id.0 as usize]
    }

    /// Looks up a binding by interned name.
    pub fn lookup(&self, hier: HierId) -> Option<NameId> {
        self.by_name.get(&hier).copied()
    }

    /// Resolves a name straight to its node.
    pub fn lookup_node(&self, hier: HierId) -> Option<NodeId> {
        self.lookup(hier).map(|nn| self.name(nn).node)
    }

    /// The canonical binding of a node.
    ///
    /// # Panics
    ///
    /// Panics if the node has no names, which only happens transiently
    /// while the flattener is populating it.
    pub fn canonical(&self, node: NodeId) -> NameId {
        self.node(node).name.expect("node has no canonical name")
    }

    /// The canonical binding, if any name has been attached yet.
    pub fn try_canonical(&self, node: NodeId) -> Option<NameId> {
        self.node(node).name
    }

    /// The canonical hierarchical name of a node.
    pub fn canonical_hier(&self, node: NodeId) -> HierId {
        self.name(self.canonical(node)).hier
    }

    /// Number of live nodes (excluding the list sentinel).
    pub fn num_nodes(&self) -> usize {
        self.iter().count()
    }

    /// All name bindings, in creation order.
    pub fn bindings(&self) -> impl Iterator<Item = (HierId, NameId)> + '_ {
        self.by_name.iter().map(|(&h, &n)| (h, n))
    }

    /// Iterates over the alias chain of a node, canonical name first.
    pub fn chain(&self, node: NodeId) -> impl Iterator<Item = NameId> + '_ {
        let mut cur = self.node(node).name;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.name(id).next;
            Some(id)
        })
    }

    /// Iterates over live nodes, most recently created first.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut cur = self.node(SENTINEL).next;
        std::iter::from_fn(move || {
            if cur == SENTINEL {
                return None;
            }
            let id = cur;
            cur = self.node(id).next;
            Some(id)
        })
    }

    /// Creates a new node with `nclasses` empty resistance-class slots and
    /// links it at the head of the node list.
    pub fn make_node(&mut self, flags: NodeFlags, nclasses: usize) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let head = self.node(SENTINEL).next;
        self.nodes.push(Node {
            flags,
            cap: 0.0,
            layer: 0,
            loc: Rect::default(),
            attrs: Vec::new(),
            pa: vec![PerimArea::default(); nclasses],
            name: None,
            next: head,
            prev: SENTINEL,
        });
        self.node_mut(head).prev = id;
        self.node_mut(SENTINEL).next = id;
        id
    }

    /// Creates a binding for `hier` and makes it the canonical name of a
    /// node that has none yet.
    ///
    /// # Panics
    ///
    /// Panics if the name is already bound or the node already has names.
    pub fn bind_first(&mut self, hier: HierId, node: NodeId) -> NameId {
        assert!(self.node(node).name.is_none());
        let id = self.push_name(hier, node);
        self.node_mut(node).name = Some(id);
        id
    }

    /// Adds `hier` as another name for `node`, electing it canonical iff it
    /// beats the current canonical name in precedence; otherwise it is
    /// linked immediately after the head so the canonical name is stable.
    pub fn add_name(&mut self, pool: &HierPool, node: NodeId, hier: HierId) -> NameId {
        let id = self.push_name(hier, node);
        match self.node(node).name {
            None => self.node_mut(node).name = Some(id),
            Some(head) => {
                if pool.best(hier, self.name(head).hier) {
                    self.name_mut(id).next = Some(head);
                    self.node_mut(node).name = Some(id);
                } else {
                    let after = self.name(head).next;
                    self.name_mut(id).next = after;
                    self.name_mut(head).next = Some(id);
                }
            }
        }
        id
    }

    /// Adds `hier` as the new canonical name of `node`, unconditionally.
    ///
    /// Used by the global-name merge, which always promotes the bare global
    /// name.
    pub fn add_name_front(&mut self, hier: HierId, node: NodeId) -> NameId {
        let id = self.push_name(hier, node);
        let head = self.node(node).name;
        self.name_mut(id).next = head;
        self.node_mut(node).name = Some(id);
        id
    }

    /// Adds `hier` for `node` behind the canonical name without a
    /// precedence check.
    ///
    /// The flattener copies alias chains in canonical-first order and only
    /// guarantees that the first name stays first; the rest end up reversed.
    pub fn add_name_behind(&mut self, hier: HierId, node: NodeId) -> NameId {
        let id = self.push_name(hier, node);
        match self.node(node).name {
            None => self.node_mut(node).name = Some(id),
            Some(head) => {
                let after = self.name(head).next;
                self.name_mut(id).next = after;
                self.name_mut(head).next = Some(id);
            }
        }
        id
    }

    fn push_name(&mut self, hier: HierId, node: NodeId) -> NameId {
        let id = NameId(self.names.len() as u32);
        self.names.push(NodeName {
            hier,
            port: None,
            node,
            next: None,
        });
        let prev = self.by_name.insert(hier, id);
        debug_assert!(prev.is_none(), "name bound twice");
        id
    }

    /// Merges `from` into `into`.
    ///
    /// Capacitance and per-class (area, perimeter) are summed, attribute
    /// lists are concatenated, every binding of `from` is rewritten to point
    /// at `into`, and the alias chains are spliced so that the
    /// better-precedence canonical name wins.  `from` is unlinked from the
    /// node list and must not be used afterwards.
    pub fn merge(&mut self, pool: &HierPool, into: NodeId, from: NodeId) {
        if into == from {
            return;
        }

        let (from_cap, from_pa, from_attrs, from_flags, from_loc, from_layer) = {
            let f = self.node_mut(from);
            (
                f.cap,
                std::mem::take(&mut f.pa),
                std::mem::take(&mut f.attrs),
                f.flags,
                f.loc,
                f.layer,
            )
        };
        {
            let n = self.node_mut(into);
            n.cap += from_cap;
            for (dst, src) in n.pa.iter_mut().zip(from_pa.iter()) {
                dst.area += src.area;
                dst.perim += src.perim;
            }
        }

        // Splice the alias chains, preserving whichever canonical name has
        // higher precedence.
        if let Some(from_head) = self.node(from).name {
            let mut last = from_head;
            loop {
                self.name_mut(last).node = into;
                match self.name(last).next {
                    Some(next) => last = next,
                    None => break,
                }
            }
            match self.node(into).name {
                None => self.node_mut(into).name = Some(from_head),
                Some(into_head) => {
                    let from_best =
                        pool.best(self.name(from_head).hier, self.name(into_head).hier);
                    if from_best {
                        self.name_mut(last).next = Some(into_head);
                        self.node_mut(into).name = Some(from_head);
                        if from_layer > 0 {
                            let n = self.node_mut(into);
                            n.loc = from_loc;
                            n.layer = from_layer;
                        }
                    } else {
                        let after = self.name(into_head).next;
                        self.name_mut(last).next = after;
                        self.name_mut(into_head).next = Some(from_head);
                    }
                }
            }
            self.node_mut(from).name = None;
        }

        // The absorbed node's attributes go in front.
        {
            let n = self.node_mut(into);
            let mut attrs = from_attrs;
            attrs.append(&mut n.attrs);
            n.attrs = attrs;

            if from_layer > 0 && n.layer == 0 {
                n.loc = from_loc;
                n.layer = from_layer;
            } else if from_layer == 0 && n.layer == 0 {
                // Neither side is typed; keep the lower-leftmost location.
                if (from_loc.bot(), from_loc.left()) < (n.loc.bot(), n.loc.left()) {
                    n.loc = from_loc;
                }
            }

            // DEVTERM survives only if both sides had it; the port and
            // substrate markers survive if either did.
            if !from_flags.contains(NodeFlags::DEVTERM) {
                n.flags.remove(NodeFlags::DEVTERM);
            }
            if from_flags.contains(NodeFlags::PORT) {
                n.flags.insert(NodeFlags::PORT);
            }
            if from_flags.contains(NodeFlags::SUBS_NODE) {
                n.flags.insert(NodeFlags::SUBS_NODE);
            }
            if from_flags.contains(NodeFlags::SUBS_PORT) {
                n.flags.insert(NodeFlags::SUBS_PORT);
            }
            if from_flags.contains(NodeFlags::KILLED) {
                n.flags.insert(NodeFlags::KILLED);
            }
        }

        self.unlink(from);
    }

    fn unlink(&mut self, node: NodeId) {
        let (prev, next) = {
            let n = self.node(node);
            (n.prev, n.next)
        };
        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;
        let n = self.node_mut(node);
        n.next = node;
        n.prev = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(names: &[&str]) -> (HierPool, Vec<HierId>) {
        let mut pool = HierPool::new();
        let ids = names.iter().map(|n| pool.from_path(None, n)).collect();
        (pool, ids)
    }

    #[test]
    fn merge_sums_values_and_splices_chains() {
        let (pool, ids) = pool_with(&["a", "b"]);
        let mut t = NodeTable::new();
        let na = t.make_node(NodeFlags::empty(), 2);
        t.bind_first(ids[0], na);
        let nb = t.make_node(NodeFlags::empty(), 2);
        t.bind_first(ids[1], nb);
        t.node_mut(na).cap = 10.0;
        t.node_mut(nb).cap = 10.0;
        t.node_mut(na).pa[0] = PerimArea { area: 4, perim: 8 };
        t.node_mut(nb).pa[0] = PerimArea { area: 6, perim: 2 };

        t.merge(&pool, na, nb);

        assert_eq!(t.node(na).cap, 20.0);
        assert_eq!(t.node(na).pa[0], PerimArea { area: 10, perim: 10 });
        // "a" beats "b" lexicographically, so it stays canonical.
        assert_eq!(t.canonical_hier(na), ids[0]);
        let chain: Vec<_> = t.chain(na).map(|n| t.name(n).hier).collect();
        assert_eq!(chain, vec![ids[0], ids[1]]);
        // Every binding now resolves to the surviving node.
        assert_eq!(t.lookup_node(ids[1]), Some(na));
        assert_eq!(t.iter().count(), 1);
    }

    #[test]
    fn merge_prefers_global_canonical() {
        let (pool, ids) = pool_with(&["n1", "Vdd!"]);
        let mut t = NodeTable::new();
        let a = t.make_node(NodeFlags::empty(), 0);
        t.bind_first(ids[0], a);
        let b = t.make_node(NodeFlags::empty(), 0);
        t.bind_first(ids[1], b);

        t.merge(&pool, a, b);
        assert_eq!(t.canonical_hier(a), ids[1]);
    }

    #[test]
    fn add_name_keeps_canonical_stable() {
        let (pool, ids) = pool_with(&["b", "z", "a"]);
        let mut t = NodeTable::new();
        let n = t.make_node(NodeFlags::empty(), 0);
        t.bind_first(ids[0], n);
        // Worse name goes behind the head.
        t.add_name(&pool, n, ids[1]);
        assert_eq!(t.canonical_hier(n), ids[0]);
        // Better name is elected.
        t.add_name(&pool, n, ids[2]);
        assert_eq!(t.canonical_hier(n), ids[2]);
        let chain: Vec<_> = t.chain(n).map(|x| t.name(x).hier).collect();
        assert_eq!(chain, vec![ids[2], ids[0], ids[1]]);
    }

    #[test]
    fn list_order_is_most_recent_first() {
        let (_, ids) = pool_with(&["a", "b", "c"]);
        let mut t = NodeTable::new();
        let mut made = Vec::new();
        for id in ids {
            let n = t.make_node(NodeFlags::empty(), 0);
            t.bind_first(id, n);
            made.push(n);
        }
        let order: Vec<_> = t.iter().collect();
        assert_eq!(order, vec![made[2], made[1], made[0]]);
    }
}
