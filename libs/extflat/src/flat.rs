//! Flattening the def/use tree into a single electrical graph.
//!
//! Flattening runs in passes: node population (a depth-first post-order
//! walk cloning every def instance's nodes into the global table),
//! connections (forced merges and parasitic adjustments), kills, global
//! name merging, coupling capacitors, and distances.  The result is a
//! [`Flat`] holding the global node table and the cap and distance tables,
//! all iterated in deterministic order.

use indexmap::IndexMap;

use crate::def::{Connection, DefFlags, DefId, Distance, Use};
use crate::geom::Transform;
use crate::hiername::HierId;
use crate::issues::{ErrorKind, Issues};
use crate::node::{Attr, NodeFlags, NodeId, NodeTable};
use crate::Session;

/// Flags selecting what [`flat_build`] builds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlatFlags(u8);

impl FlatFlags {
    /// Build the flat node table.
    pub const NODES: FlatFlags = FlatFlags(0x01);
    /// Build the internodal capacitor table (implies [`FlatFlags::NODES`]).
    pub const CAPS: FlatFlags = FlatFlags(0x02);
    /// Flatten explicit resistors.
    pub const RESISTS: FlatFlags = FlatFlags(0x04);
    /// Build the distance table.
    pub const DISTS: FlatFlags = FlatFlags(0x08);
    /// Stop at defs marked as subcircuits, exposing only their ports.
    pub const NO_FLAT_SUBCKT: FlatFlags = FlatFlags(0x10);
    /// Do not merge disconnected nets that share a global name.
    pub const NO_NAME_MERGE: FlatFlags = FlatFlags(0x20);

    /// The empty flag set.
    pub const fn empty() -> Self {
        FlatFlags(0)
    }

    /// Whether all flags in `other` are set.
    pub const fn contains(self, other: FlatFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FlatFlags {
    type Output = FlatFlags;
    fn bitor(self, rhs: FlatFlags) -> FlatFlags {
        FlatFlags(self.0 | rhs.0)
    }
}

/// Position within the hierarchy during traversal: the def being visited,
/// the hierarchical prefix down to it, the transform to root coordinates,
/// and the array element indices.
#[derive(Clone, Debug)]
pub struct HierContext {
    /// The def being visited.
    pub def: DefId,
    /// Hierarchical prefix, `None` at the root.
    pub prefix: Option<HierId>,
    /// Transform from this def's coordinates to the root's.
    pub trans: Transform,
    /// x array index of this instance.
    pub x: i32,
    /// y array index of this instance.
    pub y: i32,
}

impl HierContext {
    /// The root context for a def.
    pub fn root(def: DefId) -> Self {
        Self {
            def,
            prefix: None,
            trans: Transform::identity(),
            x: 0,
            y: 0,
        }
    }
}

/// The flattened circuit.
pub struct Flat {
    root: DefId,
    /// The global node table, keyed by full hierarchical names.
    pub nodes: NodeTable,
    /// Internodal coupling capacitors, keyed by ordered node pairs, in
    /// attofarads.
    pub caps: IndexMap<(NodeId, NodeId), f64>,
    /// Signal-to-signal distances, canonically keyed.
    pub dists: IndexMap<(HierId, HierId), Distance>,
    /// Problems found while flattening.
    pub issues: Issues,
}

impl Flat {
    /// The def this circuit was flattened from.
    pub fn root(&self) -> DefId {
        self.root
    }

    /// Resolves a hierarchical prefix plus a local name chain to a flat
    /// node.
    ///
    /// Device substrate terminals and globals enter the table by their bare
    /// local names, so those are tried when the full path misses.
    pub fn resolve(&self, sess: &Session, prefix: Option<HierId>, suffix: HierId) -> Option<NodeId> {
        if let Some(full) = sess.pool.find_concat(prefix, suffix) {
            if let Some(n) = self.nodes.lookup_node(full) {
                return Some(n);
            }
        }
        self.nodes.lookup_node(suffix)
    }
}

/// Expands every child instance of a context, in traversal order.
///
/// Array uses expand over their full subscript grid, x varying slowest;
/// every element gets its own path component and a transform translated by
/// its grid offsets.
pub(crate) fn child_contexts(sess: &mut Session, hc: &HierContext) -> Vec<HierContext> {
    let uses: Vec<Use> = sess.def(hc.def).uses.to_vec();
    let mut out = Vec::new();
    for u in uses {
        let t = u.trans.then(&hc.trans);
        if !u.array.is_array() {
            let prefix = sess.pool.intern(hc.prefix, &u.id);
            out.push(HierContext {
                def: u.child,
                prefix: Some(prefix),
                trans: t,
                x: 0,
                y: 0,
            });
            continue;
        }
        let a = u.array;
        let (xlo, xhi, xsep) = if a.xlo <= a.xhi {
            (a.xlo, a.xhi, a.xsep)
        } else {
            (a.xhi, a.xlo, -a.xsep)
        };
        let (ylo, yhi, ysep) = if a.ylo <= a.yhi {
            (a.ylo, a.yhi, a.ysep)
        } else {
            (a.yhi, a.ylo, -a.ysep)
        };
        for x in xlo..=xhi {
            for y in ylo..=yhi {
                let xbase = xsep * (x - a.xlo);
                let ybase = ysep * (y - a.ylo);
                let prefix = sess.pool.intern(hc.prefix, &u.element_id(x, y));
                out.push(HierContext {
                    def: u.child,
                    prefix: Some(prefix),
                    trans: t.translated(xbase, ybase),
                    x,
                    y,
                });
            }
        }
    }
    out
}

/// Read-only variant of [`child_contexts`] for post-flatten traversals;
/// skips subtrees whose prefixes were never interned (and therefore never
/// flattened).
pub(crate) fn child_contexts_ro(sess: &Session, hc: &HierContext) -> Vec<HierContext> {
    let mut out = Vec::new();
    for u in &sess.def(hc.def).uses {
        let t = u.trans.then(&hc.trans);
        if !u.array.is_array() {
            if let Some(prefix) = sess.pool.find(hc.prefix, &u.id) {
                out.push(HierContext {
                    def: u.child,
                    prefix: Some(prefix),
                    trans: t,
                    x: 0,
                    y: 0,
                });
            }
            continue;
        }
        let a = u.array;
        let (xlo, xhi, xsep) = if a.xlo <= a.xhi {
            (a.xlo, a.xhi, a.xsep)
        } else {
            (a.xhi, a.xlo, -a.xsep)
        };
        let (ylo, yhi, ysep) = if a.ylo <= a.yhi {
            (a.ylo, a.yhi, a.ysep)
        } else {
            (a.yhi, a.ylo, -a.ysep)
        };
        for x in xlo..=xhi {
            for y in ylo..=yhi {
                let xbase = xsep * (x - a.xlo);
                let ybase = ysep * (y - a.ylo);
                if let Some(prefix) = sess.pool.find(hc.prefix, &u.element_id(x, y)) {
                    out.push(HierContext {
                        def: u.child,
                        prefix: Some(prefix),
                        trans: t.translated(xbase, ybase),
                        x,
                        y,
                    });
                }
            }
        }
    }
    out
}

/// Performs a full flatten of the tree rooted at `root`.
pub fn flat_build(sess: &mut Session, root: DefId, flags: FlatFlags) -> Flat {
    let mut fl = Flattener::new(sess, flags);
    let ctx = HierContext::root(root);

    if flags.contains(FlatFlags::NODES) || flags.contains(FlatFlags::CAPS) {
        if flags.contains(FlatFlags::NO_FLAT_SUBCKT) {
            fl.flat_nodes_stdcell(&ctx);
        } else {
            fl.flat_nodes(&ctx);
        }
        fl.flat_kills(&ctx);
        if !flags.contains(FlatFlags::NO_NAME_MERGE) {
            fl.flat_glob();
        }
    }

    // Caps fold into nodes, so kills must already be marked.
    if flags.contains(FlatFlags::CAPS) {
        fl.flat_caps(&ctx);
    }

    if flags.contains(FlatFlags::DISTS) {
        fl.flat_dists(&ctx);
    }

    fl.finish(root)
}

/// Expands only one hierarchy level below `root`: the ports of every direct
/// child, plus the full contents of child subtrees that contain no devices
/// (those are absorbed, and marked [`DefFlags::NODEVICES`]).
///
/// Used by the hierarchical netlist writers, which emit each def once.
pub fn flat_build_one_level(sess: &mut Session, root: DefId, flags: FlatFlags) -> Flat {
    let mut fl = Flattener::new(sess, flags);
    let ctx = HierContext::root(root);

    let children = child_contexts(fl.sess, &ctx);
    for child in &children {
        fl.add_nodes(child, true);
    }

    let mut remaining = children.len();
    for child in &children {
        if fl.flat_nodes_deviceless(child) {
            remaining -= 1;
        }
    }
    if remaining == 0 && fl.sess.def(root).devs.is_empty() {
        fl.sess.def_mut(root).flags.insert(DefFlags::NODEVICES);
    }

    fl.add_nodes(&ctx, false);
    fl.add_conns(&ctx);
    fl.flat_kills(&ctx);
    if !flags.contains(FlatFlags::NO_NAME_MERGE) {
        fl.flat_glob();
    }
    if flags.contains(FlatFlags::CAPS) {
        fl.flat_caps_deviceless(&ctx);
    }
    if flags.contains(FlatFlags::DISTS) {
        fl.flat_dists(&ctx);
    }

    fl.finish(root)
}

struct Flattener<'s> {
    sess: &'s mut Session,
    nodes: NodeTable,
    caps: IndexMap<(NodeId, NodeId), f64>,
    dists: IndexMap<(HierId, HierId), Distance>,
    issues: Issues,
}

impl<'s> Flattener<'s> {
    fn new(sess: &'s mut Session, _flags: FlatFlags) -> Self {
        Self {
            sess,
            nodes: NodeTable::new(),
            caps: IndexMap::new(),
            dists: IndexMap::new(),
            issues: Issues::new(),
        }
    }

    fn finish(self, root: DefId) -> Flat {
        Flat {
            root,
            nodes: self.nodes,
            caps: self.caps,
            dists: self.dists,
            issues: self.issues,
        }
    }

    fn flat_nodes(&mut self, hc: &HierContext) {
        for child in child_contexts(self.sess, hc) {
            if self.sess.interrupted() {
                return;
            }
            self.flat_nodes(&child);
        }
        self.add_nodes(hc, false);
        self.add_conns(hc);
    }

    fn flat_nodes_stdcell(&mut self, hc: &HierContext) {
        let is_subckt = self
            .sess
            .def(hc.def)
            .flags
            .contains(DefFlags::SUBCIRCUIT);
        if !is_subckt {
            for child in child_contexts(self.sess, hc) {
                if self.sess.interrupted() {
                    return;
                }
                self.flat_nodes_stdcell(&child);
            }
        }
        self.add_nodes(hc, true);
        if !is_subckt {
            self.add_conns(hc);
        }
    }

    fn flat_nodes_deviceless(&mut self, hc: &HierContext) -> bool {
        let children = child_contexts(self.sess, hc);
        let mut remaining = children.len();
        for child in &children {
            if self.flat_nodes_deviceless(child) {
                remaining -= 1;
            }
        }
        if remaining == 0 && self.sess.def(hc.def).devs.is_empty() {
            self.add_nodes(hc, true);
            self.add_conns(hc);
            self.sess.def_mut(hc.def).flags.insert(DefFlags::NODEVICES);
            true
        } else {
            false
        }
    }

    /// Clones every local node of `hc`'s def into the global table, with
    /// its names prefixed by the hierarchical context.
    ///
    /// In `ports_only` mode, defs marked as subcircuits contribute only
    /// their ports, and capacitance and area/perimeter are zeroed since the
    /// per-def values are emitted with the def itself.
    fn add_nodes(&mut self, hc: &HierContext, ports_only: bool) {
        let nclasses = self.sess.nclasses();
        let def = self.sess.def(hc.def);
        let scale = def.scale;
        let is_subckt = def.flags.contains(DefFlags::SUBCIRCUIT);
        let locals: Vec<NodeId> = def.nodes.iter().collect();

        for local in locals {
            let def = self.sess.def(hc.def);
            let lnode = def.nodes.node(local);
            if ports_only && is_subckt && !lnode.flags.contains(NodeFlags::PORT) {
                continue;
            }

            let flags = lnode.flags;
            let cap = if ports_only { 0.0 } else { lnode.cap };
            let layer = lnode.layer;
            let loc = hc.trans.apply_rect(&lnode.loc).scale(scale);
            let pa = if ports_only {
                vec![Default::default(); nclasses]
            } else {
                let mut pa = lnode.pa.clone();
                pa.resize(nclasses, Default::default());
                pa
            };
            // Attribute locations move with the instance; list order ends
            // up reversed, like the names below.
            let attrs: Vec<Attr> = lnode
                .attrs
                .iter()
                .rev()
                .map(|a| Attr {
                    text: a.text.clone(),
                    loc: hc.trans.apply_rect(&a.loc).scale(scale),
                    layer: a.layer,
                })
                .collect();
            let names: Vec<HierId> = def.nodes.chain(local).map(|nn| def.nodes.name(nn).hier).collect();

            let mut newnode = self.nodes.make_node(flags, nclasses);
            {
                let n = self.nodes.node_mut(newnode);
                n.cap = cap;
                n.layer = layer;
                n.loc = loc;
                n.pa = pa;
                n.attrs = attrs;
            }

            for hier in names {
                // Substrate terminals used before declaration refer to
                // default global names; they enter the table unprefixed so
                // every occurrence lands on one node.
                let full = if flags.contains(NodeFlags::DEVTERM) {
                    hier
                } else {
                    self.sess.pool.concat(hc.prefix, hier)
                };

                if let Some(existing) = self.nodes.lookup(full) {
                    let into = self.nodes.name(existing).node();
                    if into != newnode {
                        self.nodes.merge(&self.sess.pool, into, newnode);
                    }
                    newnode = into;
                    continue;
                }

                // Only the canonical (first) name is guaranteed to stay
                // first; the rest of the chain ends up reversed.
                if self.nodes.try_canonical(newnode).is_none() {
                    self.nodes.bind_first(full, newnode);
                } else {
                    self.nodes.add_name_behind(full, newnode);
                }
            }
        }
    }

    fn add_conns(&mut self, hc: &HierContext) {
        let nconns = self.sess.def(hc.def).conns.len();
        for i in 0..nconns {
            let conn = self.sess.def(hc.def).conns[i].clone();
            let _ = conn.expand_each::<std::convert::Infallible>(|n1, n2| {
                self.add_one_conn(hc, n1, n2, &conn);
                Ok(())
            });
        }
    }

    fn add_one_conn(&mut self, hc: &HierContext, name1: &str, name2: Option<&str>, conn: &Connection) {
        let Some(node) = self.lookup_str(hc.prefix, name1, "connect(1)") else {
            return;
        };
        {
            let n = self.nodes.node_mut(node);
            n.cap += conn.value.cap();
            for (dst, src) in n.pa.iter_mut().zip(conn.pa.iter()) {
                dst.area += src.area;
                dst.perim += src.perim;
            }
        }
        if let Some(name2) = name2 {
            let Some(other) = self.lookup_str(hc.prefix, name2, "connect(2)") else {
                return;
            };
            if node != other {
                self.nodes.merge(&self.sess.pool, node, other);
            }
        }
    }

    /// Resolves a textual name under a prefix against the flat table,
    /// warning and recording a `NodeMissing` issue on a miss.
    fn lookup_str(&mut self, prefix: Option<HierId>, name: &str, what: &str) -> Option<NodeId> {
        let full = self.sess.pool.from_path(prefix, name);
        if let Some(n) = self.nodes.lookup_node(full) {
            return Some(n);
        }
        // Globals and substrate terminals may be registered bare.
        if !name.contains('/') {
            let bare = self.sess.pool.from_path(None, name);
            if let Some(n) = self.nodes.lookup_node(bare) {
                return Some(n);
            }
        }
        tracing::warn!(
            "{what}: no such node {}",
            self.sess.pool.path_string(full)
        );
        self.issues.record(ErrorKind::NodeMissing);
        None
    }

    fn flat_kills(&mut self, hc: &HierContext) {
        for child in child_contexts(self.sess, hc) {
            self.flat_kills(&child);
        }
        let kills = self.sess.def(hc.def).kills.clone();
        for kill in kills {
            let full = self.sess.pool.concat(hc.prefix, kill.name);
            match self.nodes.lookup_node(full) {
                Some(node) => {
                    self.nodes.node_mut(node).flags.insert(NodeFlags::KILLED);
                }
                None => {
                    tracing::warn!(
                        "kill: no such node {}",
                        self.sess.pool.path_string(full)
                    );
                    self.issues.record(ErrorKind::NodeMissing);
                }
            }
        }
    }

    /// Merges all occurrences of each global name into one node and gives
    /// the node its bare global name as canonical.
    ///
    /// Relies on name precedence: a global name, if present anywhere in a
    /// node's chain, is its canonical name, so only canonical names need
    /// inspecting.  Distinct nets sharing a global leaf are a warning
    /// (unless implicit substrate terminals are involved) but are still
    /// merged.
    fn flat_glob(&mut self) {
        let live: Vec<NodeId> = self.nodes.iter().collect();
        let mut table: IndexMap<arcstr::ArcStr, NodeId> = IndexMap::new();

        for node in live {
            if self.nodes.try_canonical(node).is_none() {
                continue;
            }
            let canon = self.nodes.canonical_hier(node);
            if !self.sess.pool.is_global(canon) {
                continue;
            }
            let leaf = self.sess.pool.leaf(canon).clone();
            match table.get(&leaf).copied() {
                None => {
                    table.insert(leaf, node);
                }
                Some(reg) if reg == node => {}
                Some(reg) => {
                    let reg_dt = self.nodes.node(reg).flags.contains(NodeFlags::DEVTERM);
                    let cur_dt = self.nodes.node(node).flags.contains(NodeFlags::DEVTERM);
                    if !reg_dt && !cur_dt {
                        self.global_split_warning(&leaf, reg, node);
                        self.issues.record(ErrorKind::GlobalSplit);
                    }
                    self.nodes.merge(&self.sess.pool, node, reg);
                    table.insert(leaf, node);
                }
            }
        }

        for (leaf, node) in table {
            let bare = self.sess.pool.intern(None, &leaf);
            if self.nodes.lookup(bare).is_none() {
                self.nodes.add_name_front(bare, node);
            }
        }
    }

    fn global_split_warning(&self, leaf: &str, a: NodeId, b: NodeId) {
        let list = |node: NodeId| {
            self.nodes
                .chain(node)
                .take(10)
                .map(|nn| self.sess.pool.path_string(self.nodes.name(nn).hier))
                .collect::<Vec<_>>()
                .join(", ")
        };
        tracing::warn!(
            "global name {leaf} not fully connected; one portion contains [{}], the other [{}]; \
             merging them anyway",
            list(a),
            list(b)
        );
    }

    fn flat_caps(&mut self, hc: &HierContext) {
        for child in child_contexts(self.sess, hc) {
            if self.sess.interrupted() {
                return;
            }
            self.flat_caps(&child);
        }
        self.own_caps(hc);
    }

    fn flat_caps_deviceless(&mut self, hc: &HierContext) {
        for child in child_contexts(self.sess, hc) {
            self.flat_caps_deviceless(&child);
        }
        let flags = self.sess.def(hc.def).flags;
        if !flags.contains(DefFlags::NODEVICES) && flags.contains(DefFlags::PROCESSED) {
            return;
        }
        self.own_caps(hc);
    }

    fn own_caps(&mut self, hc: &HierContext) {
        let ncaps = self.sess.def(hc.def).caps.len();
        for i in 0..ncaps {
            let conn = self.sess.def(hc.def).caps[i].clone();
            let _ = conn.expand_each::<std::convert::Infallible>(|n1, n2| {
                self.single_cap(hc, n1, n2, &conn);
                Ok(())
            });
        }
    }

    fn single_cap(&mut self, hc: &HierContext, name1: &str, name2: Option<&str>, conn: &Connection) {
        let Some(name2) = name2 else { return };
        let Some(n1) = self.lookup_str(hc.prefix, name1, "cap(1)") else {
            return;
        };
        if self.nodes.node(n1).flags.contains(NodeFlags::KILLED) {
            return;
        }
        let Some(n2) = self.lookup_str(hc.prefix, name2, "cap(2)") else {
            return;
        };
        if self.nodes.node(n2).flags.contains(NodeFlags::KILLED) {
            return;
        }
        if n1 == n2 {
            return;
        }

        // A capacitor to the substrate folds into the other node's lumped
        // capacitance instead of the coupling table.
        if self.nodes.node(n1).flags.contains(NodeFlags::SUBS_NODE) {
            self.nodes.node_mut(n2).cap += conn.value.cap();
        } else if self.nodes.node(n2).flags.contains(NodeFlags::SUBS_NODE) {
            self.nodes.node_mut(n1).cap += conn.value.cap();
        } else {
            let key = if n1 < n2 { (n1, n2) } else { (n2, n1) };
            *self.caps.entry(key).or_insert(0.0) += conn.value.cap();
        }
    }

    fn flat_dists(&mut self, hc: &HierContext) {
        for child in child_contexts(self.sess, hc) {
            self.flat_dists(&child);
        }
        let dists: Vec<((HierId, HierId), Distance)> = self
            .sess
            .def(hc.def)
            .dists
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect();
        for ((a, b), d) in dists {
            let fa = self.sess.pool.concat(hc.prefix, a);
            let fb = self.sess.pool.concat(hc.prefix, b);
            let key = if self.sess.pool.best(fa, fb) {
                (fa, fb)
            } else {
                (fb, fa)
            };
            // A parent's distance information overrides whatever was
            // computed in the child, so this replaces rather than widens.
            self.dists.insert(key, d);
        }
    }
}
