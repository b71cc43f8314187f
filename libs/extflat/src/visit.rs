//! Ordered traversals of the flattened circuit.
//!
//! Emitters walk devices, resistors, capacitors, and nodes through these
//! functions.  The orders are deterministic: devices and resistors follow
//! each def's stored order within a depth-first post-order walk of the use
//! tree, capacitors and distances follow table insertion order, and nodes
//! follow the global list.  Devices connected to killed nodes are never
//! passed through.

use crate::def::{DefFlags, DefId};
use crate::dev::Dev;
use crate::flat::{child_contexts_ro, Flat, HierContext};
use crate::geom::Transform;
use crate::hiername::HierId;
use crate::node::{Node, NodeFlags, NodeId};
use crate::Session;

/// A device presented to a visitor.
pub struct DevVisit<'a> {
    /// The device.
    pub dev: &'a Dev,
    /// The def the device belongs to.
    pub def: DefId,
    /// Hierarchical prefix of the instance being visited.
    pub prefix: Option<HierId>,
    /// Per-def output scale; 1.0 unless the source files disagreed on
    /// scale.
    pub scale: f64,
    /// Transform from the def's coordinates to the root's.
    pub trans: Transform,
}

/// Visits every device in the flattened circuit.
///
/// Defs marked as subcircuits are opaque: neither their own devices nor
/// their children are visited.
pub fn visit_devs<E, F>(sess: &Session, flat: &Flat, mut f: F) -> Result<(), E>
where
    F: FnMut(&Session, &DevVisit) -> Result<(), E>,
{
    let ctx = HierContext::root(flat.root());
    visit_devs_inner(sess, flat, &ctx, &mut f)
}

fn visit_devs_inner<E>(
    sess: &Session,
    flat: &Flat,
    hc: &HierContext,
    f: &mut dyn FnMut(&Session, &DevVisit) -> Result<(), E>,
) -> Result<(), E> {
    if sess.def(hc.def).flags.contains(DefFlags::SUBCIRCUIT) {
        return Ok(());
    }
    for child in child_contexts_ro(sess, hc) {
        visit_devs_inner(sess, flat, &child, f)?;
    }
    visit_local_devs(sess, flat, hc, f)
}

/// Visits only the devices of `hc`'s own def, without recursion.  Used by
/// the hierarchical writers together with a one-level flatten.
pub fn visit_devs_local<E, F>(sess: &Session, flat: &Flat, f: F) -> Result<(), E>
where
    F: FnMut(&Session, &DevVisit) -> Result<(), E>,
{
    let ctx = HierContext::root(flat.root());
    let mut f = f;
    visit_local_devs(sess, flat, &ctx, &mut f)
}

fn visit_local_devs<E>(
    sess: &Session,
    flat: &Flat,
    hc: &HierContext,
    f: &mut dyn FnMut(&Session, &DevVisit) -> Result<(), E>,
) -> Result<(), E> {
    let def = sess.def(hc.def);
    let scale = if sess.scale_changed && def.scale != 1.0 {
        def.scale
    } else {
        1.0
    };
    for dev in &def.devs {
        if dev_killed(sess, flat, hc.prefix, hc.def, dev) {
            continue;
        }
        f(
            sess,
            &DevVisit {
                dev,
                def: hc.def,
                prefix: hc.prefix,
                scale,
                trans: hc.trans,
            },
        )?;
    }
    Ok(())
}

/// Whether any terminal of `dev` lands on a killed flat node.
pub fn dev_killed(
    sess: &Session,
    flat: &Flat,
    prefix: Option<HierId>,
    def: DefId,
    dev: &Dev,
) -> bool {
    let nodes = &sess.def(def).nodes;
    dev.terms.iter().any(|t| {
        let suffix = nodes.canonical_hier(t.node);
        match flat.resolve(sess, prefix, suffix) {
            Some(n) => flat.nodes.node(n).flags.contains(NodeFlags::KILLED),
            None => false,
        }
    })
}

/// A resistor presented to a visitor: the two flat nodes it connects and
/// its value in milliohms.
pub struct ResistVisit {
    /// First terminal.
    pub node1: NodeId,
    /// Second terminal.
    pub node2: NodeId,
    /// Resistance in milliohms.
    pub res: f64,
}

/// Visits every explicit resistor, skipping subcircuit defs and resistors
/// touching killed nodes.
pub fn visit_resists<E, F>(sess: &Session, flat: &Flat, mut f: F) -> Result<(), E>
where
    F: FnMut(&Session, &ResistVisit) -> Result<(), E>,
{
    let ctx = HierContext::root(flat.root());
    visit_resists_inner(sess, flat, &ctx, &mut f)
}

fn visit_resists_inner<E>(
    sess: &Session,
    flat: &Flat,
    hc: &HierContext,
    f: &mut dyn FnMut(&Session, &ResistVisit) -> Result<(), E>,
) -> Result<(), E> {
    if sess.def(hc.def).flags.contains(DefFlags::SUBCIRCUIT) {
        return Ok(());
    }
    for child in child_contexts_ro(sess, hc) {
        visit_resists_inner(sess, flat, &child, f)?;
    }
    visit_local_resists(sess, flat, hc, f)
}

/// Visits only the resistors of the root def, without recursion.
pub fn visit_resists_local<E, F>(sess: &Session, flat: &Flat, f: F) -> Result<(), E>
where
    F: FnMut(&Session, &ResistVisit) -> Result<(), E>,
{
    let ctx = HierContext::root(flat.root());
    let mut f = f;
    visit_local_resists(sess, flat, &ctx, &mut f)
}

fn visit_local_resists<E>(
    sess: &Session,
    flat: &Flat,
    hc: &HierContext,
    f: &mut dyn FnMut(&Session, &ResistVisit) -> Result<(), E>,
) -> Result<(), E> {
    for conn in &sess.def(hc.def).resistors {
        let mut out = Ok(());
        let _ = conn.expand_each::<std::convert::Infallible>(|n1, n2| {
            if out.is_err() {
                return Ok(());
            }
            let Some(n2) = n2 else { return Ok(()) };
            let r1 = sess
                .pool
                .find_path(hc.prefix, n1)
                .and_then(|h| flat.nodes.lookup_node(h));
            let r2 = sess
                .pool
                .find_path(hc.prefix, n2)
                .and_then(|h| flat.nodes.lookup_node(h));
            let (Some(node1), Some(node2)) = (r1, r2) else {
                return Ok(());
            };
            if node1 == node2
                || flat.nodes.node(node1).flags.contains(NodeFlags::KILLED)
                || flat.nodes.node(node2).flags.contains(NodeFlags::KILLED)
            {
                return Ok(());
            }
            out = f(
                sess,
                &ResistVisit {
                    node1,
                    node2,
                    res: conn.value.res(),
                },
            );
            Ok(())
        });
        out?;
    }
    Ok(())
}

/// Visits every internodal coupling capacitor, in table order.  Values are
/// in attofarads.
pub fn visit_caps<E, F>(sess: &Session, flat: &Flat, mut f: F) -> Result<(), E>
where
    F: FnMut(&Session, NodeId, NodeId, f64) -> Result<(), E>,
{
    for (&(n1, n2), &cap) in &flat.caps {
        f(sess, n1, n2, cap)?;
    }
    Ok(())
}

/// A node presented to a visitor.
pub struct NodeVisit {
    /// The flat node.
    pub node: NodeId,
    /// Lumped resistance estimate, in milliohms.
    pub res: i64,
    /// Capacitance to substrate, in attofarads; zeroed for the substrate
    /// itself.
    pub cap: f64,
}

/// Visits every live flat node.  Killed nodes are skipped; the substrate
/// node's capacitance is reported as zero.
pub fn visit_nodes<E, F>(sess: &Session, flat: &Flat, mut f: F) -> Result<(), E>
where
    F: FnMut(&Session, &NodeVisit) -> Result<(), E>,
{
    for node in flat.nodes.iter() {
        if flat.nodes.try_canonical(node).is_none() {
            continue;
        }
        let n = flat.nodes.node(node);
        if n.flags.contains(NodeFlags::KILLED) {
            continue;
        }
        let res = node_resist(n, &sess.resists);
        let mut cap = n.cap;
        if sess.compat {
            let canon = flat.nodes.canonical_hier(node);
            if sess.pool.depth(canon) == 1 && sess.pool.leaf(canon).as_str() == "GND!" {
                cap = 0.0;
            }
        } else if n.flags.contains(NodeFlags::SUBS_NODE) {
            cap = 0.0;
        }
        f(sess, &NodeVisit { node, res, cap })?;
    }
    Ok(())
}

/// A subcircuit instance presented to a visitor.
pub struct SubcktVisit {
    /// The instantiated def.
    pub def: DefId,
    /// Hierarchical prefix of the instance, including its own use id.
    pub prefix: Option<HierId>,
    /// Whether this is the top-level cell itself.
    pub is_top: bool,
}

/// Visits the top cell (if it is a subcircuit) and every instance of a def
/// marked as a subcircuit, without descending into them.
pub fn visit_subcircuits<E, F>(sess: &Session, flat: &Flat, mut f: F) -> Result<(), E>
where
    F: FnMut(&Session, &SubcktVisit) -> Result<(), E>,
{
    let ctx = HierContext::root(flat.root());
    if sess.def(ctx.def).flags.contains(DefFlags::SUBCIRCUIT) {
        f(
            sess,
            &SubcktVisit {
                def: ctx.def,
                prefix: None,
                is_top: true,
            },
        )?;
    }
    visit_subcircuits_inner(sess, &ctx, &mut f)
}

fn visit_subcircuits_inner<E>(
    sess: &Session,
    hc: &HierContext,
    f: &mut dyn FnMut(&Session, &SubcktVisit) -> Result<(), E>,
) -> Result<(), E> {
    for child in child_contexts_ro(sess, hc) {
        if sess.def(child.def).flags.contains(DefFlags::SUBCIRCUIT) {
            f(
                sess,
                &SubcktVisit {
                    def: child.def,
                    prefix: child.prefix,
                    is_top: false,
                },
            )?;
        } else {
            visit_subcircuits_inner(sess, &child, f)?;
        }
    }
    Ok(())
}

/// Visits every direct child instance of the root def, subcircuit or not.
/// Used by the hierarchical writers to emit calls one level at a time.
pub fn visit_children<E, F>(sess: &Session, flat: &Flat, mut f: F) -> Result<(), E>
where
    F: FnMut(&Session, &SubcktVisit) -> Result<(), E>,
{
    let ctx = HierContext::root(flat.root());
    for child in child_contexts_ro(sess, &ctx) {
        f(
            sess,
            &SubcktVisit {
                def: child.def,
                prefix: child.prefix,
                is_top: false,
            },
        )?;
    }
    Ok(())
}

/// Estimates a node's lumped resistance from its per-class area and
/// perimeter.
///
/// Each class is modeled as a rectangle of area A and perimeter P; solving
/// `2L^2 - P*L + 2A = 0` gives `L/W = (P + S)/(P - S)` squares with
/// `S = sqrt(P^2 - 16A)` (taken as 0 when the discriminant goes negative),
/// times that class's sheet resistance.
pub fn node_resist(node: &Node, resists: &[i64]) -> i64 {
    let mut total: f64 = 0.0;
    for (pa, &sheet) in node.pa.iter().zip(resists.iter()) {
        if pa.area > 0 && pa.perim > 0 {
            let p = pa.perim as f64;
            let v = p * p - 16.0 * pa.area as f64;
            let s = if v < 0.0 { 0.0 } else { v.sqrt() };
            total += (p + s) / (p - s) * sheet as f64;
        }
    }
    if total >= i64::MAX as f64 {
        i64::MAX
    } else {
        total as i64
    }
}
