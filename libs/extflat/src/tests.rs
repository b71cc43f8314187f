use test_log::test;

use crate::flat::{flat_build, FlatFlags};
use crate::read::{read_hierarchy, MapResolver, ReadError};
use crate::*;

fn session_from(cells: &[(&str, &str)]) -> (Session, DefId, Issues) {
    let mut sess = Session::new();
    let resolver = MapResolver::from_cells(cells.iter().copied());
    let (root, issues) = read_hierarchy(&mut sess, cells[0].0, &resolver).expect("read failed");
    (sess, root, issues)
}

fn all_flags() -> FlatFlags {
    FlatFlags::NODES | FlatFlags::CAPS | FlatFlags::RESISTS | FlatFlags::DISTS
}

#[test]
fn alias_merge_accumulates_cap_and_elects_canonical() {
    let (mut sess, root, issues) = session_from(&[(
        "cell",
        "tech scmos\n\
         scale 1 1 100\n\
         resistclasses 10\n\
         node a 0 10 0 0 metal1 4 8\n\
         node b 0 10 1 1 metal1 6 2\n\
         equiv a b\n",
    )]);
    assert!(issues.is_empty());
    let flat = flat_build(&mut sess, root, all_flags());

    let a = sess.pool.find_path(None, "a").unwrap();
    let node = flat.nodes.lookup_node(a).expect("node a");
    assert_eq!(flat.nodes.num_nodes(), 1);
    assert_eq!(flat.nodes.node(node).cap, 20.0);
    assert_eq!(flat.nodes.node(node).pa[0].area, 10);
    assert_eq!(flat.nodes.node(node).pa[0].perim, 10);
    assert_eq!(sess.pool.path_string(flat.nodes.canonical_hier(node)), "a");
    // Both names resolve to the same node.
    let b = sess.pool.find_path(None, "b").unwrap();
    assert_eq!(flat.nodes.lookup_node(b), Some(node));
}

#[test]
fn duplicate_node_records_accumulate() {
    let (mut sess, root, _) = session_from(&[(
        "cell",
        "resistclasses 10\n\
         node n 0 5 0 0 metal1 1 2\n\
         node n 0 7 0 0 metal1 3 4\n",
    )]);
    let flat = flat_build(&mut sess, root, all_flags());
    let n = sess.pool.find_path(None, "n").unwrap();
    let node = flat.nodes.lookup_node(n).unwrap();
    assert_eq!(flat.nodes.node(node).cap, 12.0);
    assert_eq!(flat.nodes.node(node).pa[0].area, 4);
    assert_eq!(flat.nodes.node(node).pa[0].perim, 6);
}

#[test]
fn global_across_array_hierarchy_merges_to_one_node() {
    let (mut sess, root, issues) = session_from(&[
        (
            "top",
            "resistclasses 10\n\
             use sub sub[0:3:10][0:0:0] 1 0 0 0 1 0\n\
             node w 0 1 0 0 metal1 0 0\n",
        ),
        (
            "sub",
            "resistclasses 10\n\
             node Vdd! 0 5 0 0 metal1 0 0\n",
        ),
    ]);
    assert!(issues.is_empty());
    let flat = flat_build(&mut sess, root, all_flags());

    let vdd = sess.pool.find_path(None, "Vdd!").expect("bare global interned");
    let node = flat.nodes.lookup_node(vdd).expect("one global node");
    assert_eq!(flat.nodes.node(node).cap, 20.0);
    assert_eq!(
        sess.pool.path_string(flat.nodes.canonical_hier(node)),
        "Vdd!"
    );
    // Each arrayed occurrence is an alias of the same node.
    let elem = sess.pool.find_path(None, "sub[2]/Vdd!").unwrap();
    assert_eq!(flat.nodes.lookup_node(elem), Some(node));
    // The occurrences were only connected by name, which is worth a
    // warning, but they still merge.
    assert!(flat.issues.has(ErrorKind::GlobalSplit));
}

#[test]
fn disconnected_globals_warn_but_merge() {
    let (mut sess, root, _) = session_from(&[
        (
            "top",
            "resistclasses\n\
             use a u1 1 0 0 0 1 0\n\
             use a u2 1 0 100 0 1 0\n",
        ),
        (
            "a",
            "resistclasses\n\
             node Clk! 0 5 0 0 metal1\n",
        ),
    ]);
    let flat = flat_build(&mut sess, root, all_flags());
    assert!(flat.issues.has(ErrorKind::GlobalSplit));
    let clk = sess.pool.find_path(None, "Clk!").unwrap();
    let node = flat.nodes.lookup_node(clk).unwrap();
    assert_eq!(flat.nodes.node(node).cap, 10.0);
}

#[test]
fn merge_record_connects_across_hierarchy() {
    let (mut sess, root, _) = session_from(&[
        (
            "top",
            "resistclasses 10\n\
             use sub s0 1 0 0 0 1 0\n\
             node out 0 3 0 0 metal1 1 1\n\
             merge out s0/a 5 2 2\n",
        ),
        (
            "sub",
            "resistclasses 10\n\
             node a 0 4 0 0 metal1 1 1\n",
        ),
    ]);
    let flat = flat_build(&mut sess, root, all_flags());
    let out = sess.pool.find_path(None, "out").unwrap();
    let node = flat.nodes.lookup_node(out).unwrap();
    // 3 (out) + 4 (s0/a) + 5 (merge adjustment)
    assert_eq!(flat.nodes.node(node).cap, 12.0);
    assert_eq!(flat.nodes.node(node).pa[0].area, 4);
    let sub_a = sess.pool.find_path(None, "s0/a").unwrap();
    assert_eq!(flat.nodes.lookup_node(sub_a), Some(node));
    // "out" is shorter than "s0/a", so it stays canonical.
    assert_eq!(
        sess.pool.path_string(flat.nodes.canonical_hier(node)),
        "out"
    );
}

#[test]
fn arrayed_merge_expands_pairwise() {
    let (mut sess, root, _) = session_from(&[
        (
            "top",
            "resistclasses\n\
             use sub s[0:1:10][0:0:0] 1 0 0 0 1 0\n\
             merge s[0:1]/a q[4:5] 0\n\
             node q[4] 0 1 0 0 metal1\n\
             node q[5] 0 1 0 0 metal1\n",
        ),
        (
            "sub",
            "resistclasses\n\
             node a 0 1 0 0 metal1\n",
        ),
    ]);
    let flat = flat_build(&mut sess, root, all_flags());
    for (elem, q) in [("s[0]/a", "q[4]"), ("s[1]/a", "q[5]")] {
        let e = sess.pool.find_path(None, elem).unwrap();
        let q = sess.pool.find_path(None, q).unwrap();
        assert_eq!(flat.nodes.lookup_node(e), flat.nodes.lookup_node(q));
    }
    // The two array elements stay distinct nets.
    let a0 = sess.pool.find_path(None, "s[0]/a").unwrap();
    let a1 = sess.pool.find_path(None, "s[1]/a").unwrap();
    assert_ne!(flat.nodes.lookup_node(a0), flat.nodes.lookup_node(a1));
}

#[test]
fn coupling_caps_sum_per_ordered_pair() {
    let (mut sess, root, _) = session_from(&[(
        "cell",
        "resistclasses\n\
         node a 0 0 0 0 metal1\n\
         node b 0 0 1 0 metal1\n\
         cap a b 50\n\
         cap b a 70\n",
    )]);
    let flat = flat_build(&mut sess, root, all_flags());
    assert_eq!(flat.caps.len(), 1);
    let (_, &cap) = flat.caps.first().unwrap();
    assert_eq!(cap, 120.0);
}

#[test]
fn cap_to_substrate_folds_into_lumped_cap() {
    let (mut sess, root, _) = session_from(&[(
        "cell",
        "resistclasses\n\
         substrate Gnd! 0 0 0 0 metal1\n\
         node a 0 10 1 0 metal1\n\
         cap a Gnd! 50\n",
    )]);
    let flat = flat_build(&mut sess, root, all_flags());
    assert!(flat.caps.is_empty());
    let a = sess.pool.find_path(None, "a").unwrap();
    let node = flat.nodes.lookup_node(a).unwrap();
    assert_eq!(flat.nodes.node(node).cap, 60.0);
}

#[test]
fn killnode_suppresses_node_and_attached_devices() {
    let (mut sess, root, _) = session_from(&[
        (
            "top",
            "resistclasses\n\
             use sub s0 1 0 0 0 1 0\n\
             node x 0 1 0 0 metal1\n\
             node y 0 1 1 0 metal1\n\
             killnode s0/n7\n\
             device res None 0 0 1 1 17.5 x 1 0 y 1 0\n",
        ),
        (
            "sub",
            "resistclasses\n\
             node n7 0 1 0 0 metal1\n\
             node g 0 1 1 0 metal1\n\
             device mosfet nfet 0 0 1 1 2 4 None g 2 0 n7 2 0 n7 2 0\n",
        ),
    ]);
    let flat = flat_build(&mut sess, root, all_flags());

    let n7 = sess.pool.find_path(None, "s0/n7").unwrap();
    let killed = flat.nodes.lookup_node(n7).unwrap();
    assert!(flat.nodes.node(killed).flags.contains(NodeFlags::KILLED));

    let mut seen = Vec::new();
    visit::visit_devs::<(), _>(&sess, &flat, |sess, v| {
        seen.push(sess.dev_types[v.dev.ty].to_string());
        Ok(())
    })
    .unwrap();
    // Only the replacement resistor in the parent survives.
    assert_eq!(seen, vec!["None".to_string()]);
}

#[test]
fn device_and_use_orders_are_deterministic() {
    let (mut sess, root, _) = session_from(&[
        (
            "top",
            "resistclasses\n\
             use sub sa 1 0 0 0 1 0\n\
             use sub sb 1 0 50 0 1 0\n\
             node w1 0 1 0 0 metal1\n\
             node w2 0 1 1 0 metal1\n\
             device mosfet nfet 0 0 1 1 2 2 None w1 2 0 w2 2 0 w2 2 0\n\
             device mosfet pfet 0 0 1 1 2 2 None w1 2 0 w2 2 0 w2 2 0\n",
        ),
        (
            "sub",
            "resistclasses\n\
             node g 0 1 0 0 metal1\n\
             node d 0 1 1 0 metal1\n\
             device mosfet nfet 0 0 1 1 2 2 None g 2 0 d 2 0 d 2 0\n",
        ),
    ]);
    let flat = flat_build(&mut sess, root, all_flags());
    let mut order = Vec::new();
    visit::visit_devs::<(), _>(&sess, &flat, |sess, v| {
        let prefix = v
            .prefix
            .map(|p| sess.pool.path_string(p))
            .unwrap_or_default();
        order.push(format!("{prefix}:{}", sess.dev_types[v.dev.ty]));
        Ok(())
    })
    .unwrap();
    // Children first, uses in reverse source order, then own devices in
    // file order.
    assert_eq!(
        order,
        vec![
            "sb:nfet".to_string(),
            "sa:nfet".to_string(),
            ":nfet".to_string(),
            ":pfet".to_string(),
        ]
    );
}

#[test]
fn distances_canonicalize_and_parent_overrides() {
    let (mut sess, root, _) = session_from(&[
        (
            "top",
            "resistclasses\n\
             use sub s0 1 0 0 0 1 0\n\
             node p 0 1 0 0 metal1\n\
             distance s0/a s0/b 3 9\n",
        ),
        (
            "sub",
            "resistclasses\n\
             node a 0 1 0 0 metal1\n\
             node b 0 1 1 0 metal1\n\
             distance a b 4 7\n\
             distance b a 2 8\n",
        ),
    ]);
    // Within the child, repeats widen to [2, 8]; the parent's [3, 9] then
    // replaces it during flattening.
    assert_eq!(sess.def(sess.def_lookup("sub").unwrap()).dists.len(), 1);
    let flat = flat_build(&mut sess, root, all_flags());
    assert_eq!(flat.dists.len(), 1);
    let (_, d) = flat.dists.first().unwrap();
    assert_eq!((d.min, d.max), (3, 9));
}

#[test]
fn ports_get_indices_and_flag_the_def() {
    let (sess, root, _) = session_from(&[(
        "cell",
        "resistclasses\n\
         node in 0 1 0 0 metal1\n\
         subcircuit in 0 0 0 metal1\n",
    )]);
    let def = sess.def(root);
    assert!(def.flags.contains(DefFlags::SUBCIRCUIT));
    let hier = sess.pool.find_path(None, "in").unwrap();
    let nn = def.nodes.lookup(hier).unwrap();
    assert_eq!(def.nodes.name(nn).port, Some(0));
    assert!(def
        .nodes
        .node(def.nodes.name(nn).node())
        .flags
        .contains(NodeFlags::PORT));
    assert_eq!(def.port_max(), (Some(0), None));
}

#[test]
fn bad_record_reports_file_and_line() {
    let mut sess = Session::new();
    let resolver = MapResolver::from_cells([(
        "cell",
        "resistclasses 10\nnode broken NOT_A_NUMBER 0 0 0 metal1\n",
    )]);
    let err = read_hierarchy(&mut sess, "cell", &resolver).unwrap_err();
    match err {
        ReadError::BadFile { line, token, .. } => {
            assert_eq!(line, 2);
            assert_eq!(token, "NOT_A_NUMBER");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_use_target_is_no_such_def() {
    let mut sess = Session::new();
    let resolver = MapResolver::from_cells([(
        "top",
        "resistclasses\nuse ghost g0 1 0 0 0 1 0\n",
    )]);
    let err = read_hierarchy(&mut sess, "top", &resolver).unwrap_err();
    assert!(matches!(err, ReadError::NoSuchDef { ref name, .. } if name == "ghost"));
}

#[test]
fn resistclass_count_mismatch_is_fatal() {
    let mut sess = Session::new();
    let resolver = MapResolver::from_cells([
        ("top", "resistclasses 10 20\nuse sub s0 1 0 0 0 1 0\n"),
        ("sub", "resistclasses 10\n"),
    ]);
    let err = read_hierarchy(&mut sess, "top", &resolver).unwrap_err();
    assert!(matches!(
        err,
        ReadError::ClassMismatch {
            found: 1,
            expected: 2,
            ..
        }
    ));
}

#[test]
fn legacy_fet_recovers_length_and_width() {
    let (sess, root, _) = session_from(&[(
        "cell",
        "resistclasses\n\
         node g 0 1 0 0 metal1\n\
         node s 0 1 1 0 metal1\n\
         fet nfet 0 0 1 1 8 12 Gnd! g 4 0 s 4 0\n",
    )]);
    let dev = &sess.def(root).devs[0];
    // 2L^2 - 12L + 16 = 0 has roots 2 and 4; the larger root is taken
    // as the length.
    let (l, w) = dev.length_width();
    assert_eq!((l, w), (4, 2));
}

#[test]
fn node_resist_estimate() {
    let (mut sess, root, _) = session_from(&[(
        "cell",
        "resistclasses 1000\n\
         node a 0 0 0 0 metal1 4 10\n",
    )]);
    let flat = flat_build(&mut sess, root, all_flags());
    let a = sess.pool.find_path(None, "a").unwrap();
    let node = flat.nodes.lookup_node(a).unwrap();
    // P=10, A=4: S = sqrt(100-64) = 6, R = (16/4) * 1000 = 4000.
    assert_eq!(visit::node_resist(flat.nodes.node(node), &sess.resists), 4000);
}
