use test_log::test;

use extflat::dev::MergeMode;
use extflat::read::{read_hierarchy, MapResolver};
use extflat::{DefId, Session};

use crate::hier::write_hier_spice;
use crate::*;

fn session_from(cells: &[(&str, &str)]) -> (Session, DefId) {
    let mut sess = Session::new();
    let resolver = MapResolver::from_cells(cells.iter().copied());
    let (root, issues) = read_hierarchy(&mut sess, cells[0].0, &resolver).expect("read failed");
    assert!(!issues.has_fatal());
    (sess, root)
}

fn emit(cells: &[(&str, &str)], opts: &SpiceOptions) -> String {
    let (mut sess, root) = session_from(cells);
    let (flat, wrapper) = prepare_flat(&mut sess, root, opts);
    let mut out = Vec::new();
    write_flat_spice(&sess, &flat, opts, cells[0].0, wrapper, &mut out).expect("emit failed");
    String::from_utf8(out).unwrap()
}

const INV: &str = "tech scmos\n\
    scale 1 1 100\n\
    resistclasses\n\
    node in 0 0 0 0 metal1\n\
    node out 0 0 1 0 metal1\n\
    node Vdd! 0 0 2 0 metal1\n\
    node Gnd! 0 0 3 0 metal1\n\
    subcircuit in 0 0 0 metal1\n\
    subcircuit out 1 1 0 metal1\n\
    subcircuit Vdd! 2 2 0 metal1\n\
    subcircuit Gnd! 3 3 0 metal1\n\
    device mosfet nfet 0 0 1 1 1 2 Gnd! in 2 0 Gnd! 2 0 out 2 0\n\
    device mosfet pfet 0 0 1 1 1 4 Vdd! in 2 0 Vdd! 2 0 out 2 0\n";

fn baked_options() -> SpiceOptions {
    SpiceOptions {
        scale_card: false,
        ..SpiceOptions::default()
    }
}

#[test]
fn two_fet_inverter() {
    let text = emit(&[("inv", INV)], &baked_options());
    let expected = ".subckt inv in out Vdd Gnd\n\
         M1000 out in Gnd Gnd nfet w=2u l=1u\n\
         M1001 out in Vdd Vdd pfet w=4u l=1u\n\
         .ends\n";
    assert!(
        text.contains(expected),
        "expected block not found in output:\n{text}"
    );
}

#[test]
fn emission_is_reproducible() {
    let opts = baked_options();
    let (mut sess, root) = session_from(&[("inv", INV)]);
    let (flat, wrapper) = prepare_flat(&mut sess, root, &opts);
    let mut a = Vec::new();
    write_flat_spice(&sess, &flat, &opts, "inv", wrapper, &mut a).unwrap();
    let mut b = Vec::new();
    write_flat_spice(&sess, &flat, &opts, "inv", wrapper, &mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn port_header_round_trips_declared_order() {
    let text = emit(&[("inv", INV)], &baked_options());
    let header = text
        .lines()
        .find(|l| l.starts_with(".subckt"))
        .expect("subckt header");
    let ports: Vec<&str> = header.split_whitespace().skip(2).collect();
    assert_eq!(ports, vec!["in", "out", "Vdd", "Gnd"]);
}

#[test]
fn spice2_numbers_nodes_with_comment_key() {
    let opts = SpiceOptions {
        format: SpiceFormat::Spice2,
        ..baked_options()
    };
    let text = emit(
        &[(
            "cell",
            "tech scmos\n\
             resistclasses\n\
             node a 0 9000 0 0 metal1\n\
             node b 0 8000 1 0 metal1\n\
             device mosfet nfet 0 0 1 1 1 2 None a 2 0 b 2 0 b 2 0\n",
        )],
        &opts,
    );
    // Nodes become small integers, with comments mapping them back.
    assert!(text.lines().any(|l| l.starts_with("M1000 ")));
    assert!(text.contains("** a == ") || text.contains("** b == "));
    for l in text.lines().filter(|l| l.starts_with("M1000")) {
        for tok in l.split_whitespace().skip(1).take(3) {
            assert!(tok.parse::<u64>().is_ok(), "node {tok} is not numeric");
        }
    }
}

#[test]
fn aggressive_merge_accumulates_width_ratio() {
    let opts = SpiceOptions {
        merge: MergeMode::Aggressive,
        ..baked_options()
    };
    let text = emit(
        &[(
            "par",
            "tech scmos\n\
             scale 1 1 100\n\
             resistclasses\n\
             node g 0 0 0 0 metal1\n\
             node d 0 0 1 0 metal1\n\
             node s 0 0 2 0 metal1\n\
             device mosfet nfet 0 0 1 1 1 2 Gnd! g 2 0 s 2 0 d 2 0\n\
             device mosfet nfet 2 0 3 1 1 3 Gnd! g 2 0 s 2 0 d 2 0\n",
        )],
        &opts,
    );
    let dev_lines: Vec<&str> = text.lines().filter(|l| l.starts_with('M')).collect();
    assert_eq!(dev_lines.len(), 1, "devices were not merged:\n{text}");
    assert!(dev_lines[0].contains("w=2u"), "{}", dev_lines[0]);
    assert!(dev_lines[0].contains("M=2.5"), "{}", dev_lines[0]);
}

#[test]
fn conservative_merge_requires_equal_width() {
    let opts = SpiceOptions {
        merge: MergeMode::Conservative,
        ..baked_options()
    };
    let text = emit(
        &[(
            "par",
            "tech scmos\n\
             resistclasses\n\
             node g 0 0 0 0 metal1\n\
             node d 0 0 1 0 metal1\n\
             node s 0 0 2 0 metal1\n\
             device mosfet nfet 0 0 1 1 1 2 Gnd! g 2 0 s 2 0 d 2 0\n\
             device mosfet nfet 2 0 3 1 1 3 Gnd! g 2 0 s 2 0 d 2 0\n\
             device mosfet nfet 4 0 5 1 1 2 Gnd! g 2 0 s 2 0 d 2 0\n",
        )],
        &opts,
    );
    let dev_lines: Vec<&str> = text.lines().filter(|l| l.starts_with('M')).collect();
    // The two w=2 devices merge (M=2); the w=3 one stays separate.
    assert_eq!(dev_lines.len(), 2, "{text}");
    assert!(dev_lines.iter().any(|l| l.contains("M=2")));
    assert!(dev_lines.iter().any(|l| l.contains("w=3u") && !l.contains("M=")));
}

#[test]
fn antiparallel_fets_merge_but_asymmetric_do_not() {
    let base = "tech scmos\n\
         resistclasses\n\
         node g 0 0 0 0 metal1\n\
         node d 0 0 1 0 metal1\n\
         node s 0 0 2 0 metal1\n";
    let opts = SpiceOptions {
        merge: MergeMode::Conservative,
        ..baked_options()
    };

    let sym = format!(
        "{base}device mosfet nfet 0 0 1 1 1 2 Gnd! g 2 0 s 2 0 d 2 0\n\
         device mosfet nfet 2 0 3 1 1 2 Gnd! g 2 0 d 2 0 s 2 0\n"
    );
    let text = emit(&[("sym", &sym)], &opts);
    assert_eq!(text.lines().filter(|l| l.starts_with('M')).count(), 1);

    let asym = format!(
        "{base}device asymmetric anfet 0 0 1 1 1 2 Gnd! g 2 0 s 2 0 d 2 0\n\
         device asymmetric anfet 2 0 3 1 1 2 Gnd! g 2 0 d 2 0 s 2 0\n"
    );
    let text = emit(&[("asym", &asym)], &opts);
    assert_eq!(text.lines().filter(|l| l.starts_with('M')).count(), 2);
}

#[test]
fn hspice_shortening_with_dictionary() {
    let opts = SpiceOptions {
        format: SpiceFormat::Hspice,
        ..baked_options()
    };
    let text = emit(
        &[(
            "deep",
            "tech scmos\n\
             resistclasses\n\
             node top/a/b/c/na234567 0 5000 0 0 metal1\n\
             node top/a/b/c/nb234567 0 5000 1 0 metal1\n\
             node top/a/b/c/nc234567 0 5000 2 0 metal1\n",
        )],
        &opts,
    );
    for leaf in ["na234567", "nb234567", "nc234567"] {
        assert!(
            text.contains(&format!("x1/{leaf}")),
            "missing shortened {leaf} in:\n{text}"
        );
    }
    assert!(text.contains("* x1\ttop/a/b/c"), "{text}");
}

#[test]
fn coupling_caps_and_node_caps_respect_threshold() {
    let opts = baked_options();
    let text = emit(
        &[(
            "caps",
            "tech scmos\n\
             resistclasses\n\
             node a 0 9000 0 0 metal1\n\
             node b 0 500 1 0 metal1\n\
             cap a b 7000\n",
        )],
        &opts,
    );
    // 7000 aF = 7 fF coupling cap and the 9 fF node cap survive the 2 fF
    // threshold; the 0.5 fF node cap does not.
    assert!(text.contains("C0 a b 7f"), "{text}");
    assert!(text.contains("a 0 9f"), "{text}");
    assert!(!text.contains(" b 0 "), "{text}");
}

#[test]
fn explicit_resistor_line() {
    let text = emit(
        &[(
            "rr",
            "tech scmos\n\
             resistclasses\n\
             node a 0 0 0 0 metal1\n\
             node b 0 0 1 0 metal1\n\
             resist a b 1500000\n",
        )],
        &baked_options(),
    );
    // 1.5e6 milliohms = 1500 ohms.
    assert!(text.contains("R0 a b 1500"), "{text}");
}

#[test]
fn subcircuit_calls_preserve_port_order_and_instance_names() {
    let opts = baked_options();
    let text = emit(
        &[
            (
                "top",
                "tech scmos\n\
                 resistclasses\n\
                 node w1 0 0 0 0 metal1\n\
                 node w2 0 0 1 0 metal1\n\
                 use gate g0 1 0 0 0 1 0\n\
                 merge w1 g0/a 0\n\
                 merge w2 g0/z 0\n",
            ),
            (
                "gate",
                "tech scmos\n\
                 resistclasses\n\
                 node a 0 0 0 0 metal1\n\
                 node z 0 0 1 0 metal1\n\
                 subcircuit a 0 0 0 metal1\n\
                 subcircuit z 1 1 0 metal1\n\
                 device mosfet nfet 0 0 1 1 1 2 Gnd! a 2 0 z 2 0 z 2 0\n",
            ),
        ],
        &opts,
    );
    assert!(text.contains("Xg0 w1 w2 gate"), "{text}");
    // The gate's internals are not flattened into the parent.
    assert!(!text.lines().any(|l| l.starts_with('M')), "{text}");
}

#[test]
fn renumbered_subcircuit_calls() {
    let opts = SpiceOptions {
        renumber: true,
        ..baked_options()
    };
    let text = emit(
        &[
            (
                "top",
                "tech scmos\n\
                 resistclasses\n\
                 node w1 0 0 0 0 metal1\n\
                 use gate g0 1 0 0 0 1 0\n\
                 merge w1 g0/a 0\n",
            ),
            (
                "gate",
                "tech scmos\n\
                 resistclasses\n\
                 node a 0 0 0 0 metal1\n\
                 subcircuit a 0 0 0 metal1\n\
                 device mosfet nfet 0 0 1 1 1 2 Gnd! a 2 0 a 2 0 a 2 0\n",
            ),
        ],
        &opts,
    );
    assert!(text.contains("X0 w1 gate"), "{text}");
}

#[test]
fn parameter_templates_fill_device_values() {
    let text = emit(
        &[(
            "ptest",
            "tech scmos\n\
             scale 1 1 100\n\
             resistclasses\n\
             parameters nsub w=w*1e-6 l=l*1e-6\n\
             node g 0 0 0 0 metal1\n\
             node s 0 0 1 0 metal1\n\
             node d 0 0 2 0 metal1\n\
             device subckt nsub 0 0 1 1 vt=0.35 g 2 0 s 2 0 d 2 0\n",
        )],
        &baked_options(),
    );
    let xline = text
        .lines()
        .find(|l| l.starts_with('X'))
        .expect("subckt device line");
    // Templated w/l come from the (zero) device dimensions; the unknown
    // vt=0.35 token passes through verbatim.
    assert!(xline.contains("nsub"), "{xline}");
    assert!(xline.contains("vt=0.35"), "{xline}");
    assert!(xline.contains(" w=") && xline.contains(" l="), "{xline}");
}

#[test]
fn resistor_tee_splits_into_two_halves() {
    let opts = SpiceOptions {
        resistor_tee: true,
        ..baked_options()
    };
    let text = emit(
        &[(
            "tee",
            "tech scmos\n\
             resistclasses\n\
             node mid 0 0 0 0 metal1\n\
             node a 0 0 1 0 metal1\n\
             node b 0 0 2 0 metal1\n\
             device res None 0 0 1 1 2000 mid 1 0 a 1 0 b 1 0\n",
        )],
        &opts,
    );
    // Two halves around the center node, each at half the value.
    assert!(text.contains("R0A mid a 1000.000000"), "{text}");
    assert!(text.contains("R0B mid b 1000.000000"), "{text}");
}

#[test]
fn hierarchical_output_emits_one_subckt_per_def() {
    let (mut sess, root) = session_from(&[
        (
            "top",
            "tech scmos\n\
             scale 1 1 100\n\
             resistclasses\n\
             node w1 0 0 0 0 metal1\n\
             node w2 0 0 1 0 metal1\n\
             use gate g0 1 0 0 0 1 0\n\
             use gate g1 1 0 10 0 1 0\n\
             merge w1 g0/a 0\n\
             merge w2 g0/z 0\n\
             merge w2 g1/a 0\n",
        ),
        (
            "gate",
            "tech scmos\n\
             scale 1 1 100\n\
             resistclasses\n\
             node a 0 0 0 0 metal1\n\
             node z 0 0 1 0 metal1\n\
             device mosfet nfet 0 0 1 1 1 2 Gnd! a 2 0 z 2 0 z 2 0\n",
        ),
    ]);
    let opts = SpiceOptions {
        hierarchy: true,
        scale_card: false,
        ..SpiceOptions::default()
    };
    let mut out = Vec::new();
    write_hier_spice(&mut sess, root, &opts, "top", &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    // The child is emitted once as a subcircuit whose ports were derived
    // from the parent's merge records.
    assert_eq!(text.matches(".subckt gate").count(), 1, "{text}");
    let header = text
        .lines()
        .find(|l| l.starts_with(".subckt gate"))
        .unwrap();
    assert!(header.contains('a') && header.contains('z'), "{header}");
    // The parent calls it twice, one level deep.
    assert!(text.contains("Xg0"), "{text}");
    assert!(text.contains("Xg1"), "{text}");
    // The child's device appears exactly once (inside the gate subckt).
    assert_eq!(
        text.lines().filter(|l| l.starts_with('M')).count(),
        1,
        "{text}"
    );
}

#[test]
fn scale_card_mode_emits_option_line() {
    let opts = SpiceOptions::default();
    let text = emit(&[("inv", INV)], &opts);
    assert!(text.contains(".option scale=1u"), "{text}");
    // Dimensions stay in internal units under the scale card.
    assert!(text.contains("w=2 l=1"), "{text}");
}

#[test]
fn lvs_options_combo() {
    let opts = SpiceOptions::lvs();
    assert_eq!(opts.format, SpiceFormat::Ngspice);
    assert!(opts.hierarchy && opts.blackbox);
    assert!(!opts.renumber && !opts.scale_card && !opts.merge_names);
    assert!(!extflat::is_finite_threshold(opts.cap_threshold));
    assert!(!extflat::is_finite_threshold(opts.res_threshold));
}
