//! Hierarchical SPICE output: every cell definition is emitted once as its
//! own `.subckt`, with one level of hierarchy flattened inside it and
//! children appearing as subcircuit calls.
//!
//! Before emission, a port-discovery pass scans each def's connection
//! records for names that reach down into child cells and marks the
//! corresponding child nodes as ports, propagating the substrate-port
//! marking across the merge graph with a union-find.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use ena::unify::{InPlaceUnificationTable, UnifyKey, UnifyValue};

use extflat::def::{Connection, DefFlags, DefId};
use extflat::dev::{merge_parallel_local, MergeMode};
use extflat::flat::{flat_build_one_level, FlatFlags};
use extflat::visit::{visit_caps, visit_children, visit_devs_local, visit_nodes, visit_resists_local};
use extflat::{is_finite_threshold, Issues, NodeFlags, Session};

use crate::{si_value, EmitState, Emitter, NetlistError, SpiceFormat, SpiceOptions, TopMode};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct NameKey(u32);

impl UnifyKey for NameKey {
    type Value = SubsPort;
    fn index(&self) -> u32 {
        self.0
    }
    fn from_index(u: u32) -> Self {
        Self(u)
    }
    fn tag() -> &'static str {
        "NameKey"
    }
}

/// Whether any name in a merged set reaches a substrate port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct SubsPort(bool);

impl UnifyValue for SubsPort {
    type Error = ena::unify::NoError;
    fn unify_values(a: &Self, b: &Self) -> Result<Self, Self::Error> {
        Ok(SubsPort(a.0 || b.0))
    }
}

/// Writes a hierarchical SPICE netlist for the def tree rooted at `root`.
pub fn write_hier_spice<W: Write>(
    sess: &mut Session,
    root: DefId,
    opts: &SpiceOptions,
    cell: &str,
    out: &mut W,
) -> Result<Issues, NetlistError> {
    let mut issues = Issues::new();

    writeln!(
        out,
        "* {} file created from {}.ext - technology: {}\n",
        opts.format,
        cell,
        sess.tech.as_deref().unwrap_or("unknown")
    )?;
    if opts.scale_card {
        writeln!(
            out,
            ".option scale={}\n",
            si_value(1.0e-6 * sess.scale() / 100.0)
        )?;
    }

    // Global supply nets named by the device-type table, under a .global
    // card.
    let mut globals: Vec<String> = Vec::new();
    for info in &opts.dev_info {
        if let Some(subs) = &info.default_subs {
            let name = subs.trim_end_matches('!');
            let lower = name.to_lowercase();
            if lower.starts_with("err") || lower.contains("error") || lower.eq("none") {
                continue;
            }
            if !globals.iter().any(|g| g == name) {
                globals.push(name.to_string());
            }
        }
    }
    if !globals.is_empty() {
        write!(out, ".global ")?;
        for g in &globals {
            write!(out, "{g} ")?;
        }
        writeln!(out, "\n")?;
    }

    let order = postorder_defs(sess, root);
    for &def in &order {
        make_ports(sess, def, opts);
    }
    for def in order {
        if sess.interrupted() {
            break;
        }
        if sess.def(def).flags.contains(DefFlags::PRIMITIVE) {
            continue;
        }
        if sess.def(def).flags.contains(DefFlags::PROCESSED) {
            continue;
        }
        emit_def(sess, def, def == root, opts, out, &mut issues)?;
        sess.def_mut(def).flags.insert(DefFlags::PROCESSED);
    }
    Ok(issues)
}

/// Every def reachable from `root`, children before parents, each once.
fn postorder_defs(sess: &Session, root: DefId) -> Vec<DefId> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    fn walk(sess: &Session, def: DefId, seen: &mut HashSet<DefId>, order: &mut Vec<DefId>) {
        if !seen.insert(def) {
            return;
        }
        for u in &sess.def(def).uses {
            walk(sess, u.child, seen, order);
        }
        order.push(def);
    }
    walk(sess, root, &mut seen, &mut order);
    order
}

/// Port discovery for one def: any connection name reaching into a child
/// (it contains `/`) makes the named node a port of that child, and
/// substrate-port markings propagate across the whole merge graph of the
/// def's connections.
fn make_ports(sess: &mut Session, def: DefId, opts: &SpiceOptions) {
    if sess.def(def).uses.is_empty() {
        return;
    }

    let mut uf: InPlaceUnificationTable<NameKey> = InPlaceUnificationTable::new();
    let mut keys: HashMap<String, NameKey> = HashMap::new();

    let conns: Vec<Connection> = sess.def(def).conns.clone();
    let caps: Vec<Connection> = sess
        .def(def)
        .caps
        .iter()
        .filter(|c| (c.value.cap() / 1000.0).abs() >= opts.cap_threshold)
        .cloned()
        .collect();

    for conn in conns.iter().chain(caps.iter()) {
        let _ = conn.expand_each::<std::convert::Infallible>(|n1, n2| {
            let Some(n2) = n2 else { return Ok(()) };
            let k1 = *keys
                .entry(n1.to_string())
                .or_insert_with(|| uf.new_key(SubsPort(false)));
            let k2 = *keys
                .entry(n2.to_string())
                .or_insert_with(|| uf.new_key(SubsPort(false)));
            uf.union(k1, k2);
            for name in [n1, n2] {
                if name.contains('/') {
                    if mark_port_path(sess, def, name, opts) {
                        let _ = uf.unify_var_value(keys[name], SubsPort(true));
                    }
                }
            }
            Ok(())
        });
    }

    // Apply propagated substrate-port markings to this def's local nodes.
    let local: Vec<(String, NameKey)> = keys
        .iter()
        .filter(|(name, _)| !name.contains('/'))
        .map(|(n, &k)| (n.clone(), k))
        .collect();
    for (name, key) in local {
        if !uf.probe_value(key).0 {
            continue;
        }
        if let Some(hier) = sess.pool.find_path(None, &name) {
            let d = sess.def_mut(def);
            if let Some(node) = d.nodes.lookup_node(hier) {
                d.nodes.node_mut(node).flags.insert(NodeFlags::SUBS_PORT);
            }
        }
    }
}

/// Walks a slash-separated name down the use tree from `def`, marking the
/// addressed node a port in each child def along the way (creating it when
/// missing).  Returns whether the final node is a substrate port.
fn mark_port_path(sess: &mut Session, def: DefId, name: &str, opts: &SpiceOptions) -> bool {
    let mut updef = def;
    let mut segments = name.split('/').peekable();
    let mut is_subs = false;

    while let Some(seg) = segments.next() {
        if segments.peek().is_none() {
            break;
        }
        // The segment may carry an array subscript that is not part of the
        // use id proper.
        let child = {
            let d = sess.def(updef);
            let found = d.uses.iter().find(|u| u.id.as_str() == seg).or_else(|| {
                let base = seg.split('[').next().unwrap_or(seg);
                d.uses.iter().find(|u| u.id.as_str() == base)
            });
            match found {
                Some(u) => u.child,
                None => return false,
            }
        };

        // The addressed node's name within the child is the whole
        // remaining path; hierarchically extracted node names may
        // themselves contain slashes.
        let portname: String = segments.clone().collect::<Vec<_>>().join("/");
        if !portname.is_empty() {
            let hier = sess.pool.from_path(None, &portname);
            let node = match sess.def(child).nodes.lookup_node(hier) {
                Some(n) => n,
                None => {
                    let nclasses = sess.nclasses();
                    let d = sess.def_mut(child);
                    let n = d.nodes.make_node(NodeFlags::empty(), nclasses);
                    d.nodes.bind_first(hier, n);
                    n
                }
            };
            let d = sess.def_mut(child);
            let flags = d.nodes.node(node).flags;
            is_subs = flags.contains(NodeFlags::SUBS_PORT);
            if !flags.contains(NodeFlags::PORT) {
                // A substrate node that connects to no devices only becomes
                // a port when parasitic output is enabled.
                let forced = is_finite_threshold(opts.cap_threshold)
                    || !flags.contains(NodeFlags::SUBS_NODE)
                    || flags.contains(NodeFlags::SUBS_PORT);
                if forced {
                    d.nodes.node_mut(node).flags.insert(NodeFlags::PORT);
                    d.flags.insert(DefFlags::SUBCIRCUIT);
                }
            }
        }
        updef = child;
    }
    is_subs
}

/// Emits one def as a subcircuit (or, for the top cell without ports, as
/// the bare circuit body).
fn emit_def<W: Write>(
    sess: &mut Session,
    def: DefId,
    is_top: bool,
    opts: &SpiceOptions,
    out: &mut W,
    issues: &mut Issues,
) -> Result<(), NetlistError> {
    // Contentless defs are absorbed into their parents; their ports are
    // dropped unless the subcircuit policy keeps them.
    if !is_top && sess.def(def).devs.is_empty() && sess.def(def).uses.is_empty() {
        let has_ports = sess.def(def).nodes.iter().any(|n| {
            sess.def(def)
                .nodes
                .node(n)
                .flags
                .contains(NodeFlags::PORT)
                || sess
                    .def(def)
                    .nodes
                    .node(n)
                    .flags
                    .contains(NodeFlags::SUBS_PORT)
        });
        let keep = match opts.top {
            TopMode::On => true,
            TopMode::Off => false,
            TopMode::Auto => has_ports,
        };
        if !keep {
            let nodes: Vec<_> = sess.def(def).nodes.iter().collect();
            let d = sess.def_mut(def);
            for n in nodes {
                d.nodes
                    .node_mut(n)
                    .flags
                    .remove(NodeFlags::PORT | NodeFlags::SUBS_PORT);
            }
            return Ok(());
        }
    }

    let mut flags = FlatFlags::NODES;
    if is_finite_threshold(opts.cap_threshold) {
        flags = flags | FlatFlags::CAPS;
    }
    if !opts.merge_names {
        flags = flags | FlatFlags::NO_NAME_MERGE;
    }
    let flat = flat_build_one_level(sess, def, flags);
    issues.merge(&flat.issues);

    let do_stub = sess.def(def).flags.contains(DefFlags::ABSTRACT) && opts.blackbox;
    if !is_top && sess.def(def).flags.contains(DefFlags::NODEVICES) && !do_stub {
        return Ok(());
    }

    let has_ports = sess.def(def).nodes.iter().any(|n| {
        let f = sess.def(def).nodes.node(n).flags;
        f.contains(NodeFlags::PORT) || f.contains(NodeFlags::SUBS_PORT)
    });
    let wrapper = !is_top
        || sess.def(def).flags.contains(DefFlags::SUBCIRCUIT)
        || match opts.top {
            TopMode::On => true,
            TopMode::Off => false,
            TopMode::Auto => has_ports,
        };

    let sess_ro: &Session = sess;
    let mut em = Emitter {
        sess: sess_ro,
        flat: &flat,
        opts,
        out,
        st: EmitState::new(),
        es_scale: if opts.scale_card {
            None
        } else {
            Some(sess_ro.scale() / 100.0)
        },
        cap_node: String::new(),
    };

    if do_stub {
        writeln!(
            em.out,
            "* Black-box entry subcircuit for {} abstract view",
            em.sess.def(def).name
        )?;
    }
    if wrapper {
        em.top_visit(def, do_stub)?;
    } else {
        writeln!(em.out, "\n* Top level circuit {}\n", em.sess.def(def).name)?;
    }

    if !do_stub {
        // Child instances become subcircuit calls, except absorbed
        // (deviceless) cells, which were flattened into this body.
        visit_children(sess_ro, &flat, |s, c| {
            if s.def(c.def).flags.contains(DefFlags::NODEVICES) {
                return Ok(());
            }
            em.subckt_call(c.def, c.prefix)
        })?;

        if opts.merge != MergeMode::None {
            let (mult, mi) = merge_parallel_local(sess_ro, &flat, opts.merge, opts.hier_ap);
            tracing::info!(merged = mult.merged, "parallel devices merged");
            em.st.mult = mult;
            em.st.issues.merge(&mi);
            em.st.mult_idx = 0;
        }

        visit_devs_local(sess_ro, &flat, |_, v| em.dev_visit(v))?;
        visit_resists_local(sess_ro, &flat, |_, r| {
            em.resist_visit(r.node1, r.node2, r.res)
        })?;
        visit_caps(sess_ro, &flat, |_, n1, n2, cap| em.cap_visit(n1, n2, cap))?;

        if !sess_ro.compat {
            em.cap_node = em.substrate_name()?;
            visit_nodes(sess_ro, &flat, |_, nv| em.node_visit(nv.node, nv.cap))?;
        }
    }

    if wrapper {
        writeln!(em.out, ".ends\n")?;
    } else {
        writeln!(em.out, ".end\n")?;
    }

    if opts.format == SpiceFormat::Hspice && !em.st.shorten.is_empty() {
        em.shorten_dict()?;
    }
    issues.merge(&em.st.issues);
    Ok(())
}
