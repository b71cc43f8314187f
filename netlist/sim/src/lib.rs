//! `.sim` netlist emission from flattened circuit extraction data.
//!
//! The `.sim` format is a flat, line-oriented netlist for switch-level
//! simulators: one device per line with a single-character type code,
//! followed by node capacitance, resistance, attribute, and alias lines.
//! Aliases and label locations can be diverted to `.al` and `.nodes`
//! sidecar files.

#![warn(missing_docs)]

use std::fmt::Display;
use std::io::Write;
use std::str::FromStr;

use arcstr::ArcStr;

use extflat::dev::{merge_parallel, DevClass, DevMultipliers, MergeMode};
use extflat::flat::Flat;
use extflat::visit::{visit_caps, visit_devs, visit_nodes, visit_resists, DevVisit};
use extflat::{HierId, Issues, NodeId, OutputFlags, Session};

/// The `.sim` output dialect.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SimFormat {
    /// The original MIT format.
    #[default]
    Mit,
    /// Stanford format: devices carry substrate and area/perimeter fields.
    Su,
    /// LBL format: substrate nodes appear on device lines.
    Lbl,
}

impl Display for SimFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mit => write!(f, "MIT"),
            Self::Su => write!(f, "SU"),
            Self::Lbl => write!(f, "LBL"),
        }
    }
}

/// An error parsing a sim format name.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("sim output formats are MIT, LBL, or SU")]
pub struct ParseFormatError;

impl FromStr for SimFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MIT" => Ok(Self::Mit),
            "SU" => Ok(Self::Su),
            "LBL" => Ok(Self::Lbl),
            _ => Err(ParseFormatError),
        }
    }
}

/// Per-device-type information needed by the SU format: resistance classes
/// for the source/drain/substrate terminals and the default substrate name.
#[derive(Clone, Debug, Default)]
pub struct DevTypeInfo {
    /// Resistance class of the source terminal.
    pub res_class_source: Option<usize>,
    /// Resistance class of the drain terminal.
    pub res_class_drain: Option<usize>,
    /// Resistance class of the substrate.
    pub res_class_sub: Option<usize>,
    /// Default substrate node name.
    pub default_subs: Option<ArcStr>,
}

/// Options controlling `.sim` output.
#[derive(Clone, Debug)]
pub struct SimOptions {
    /// Output dialect.
    pub format: SimFormat,
    /// Capacitances below this many femtofarads are dropped.
    pub cap_threshold: f64,
    /// Node resistances below this many ohms are dropped.
    pub res_threshold: f64,
    /// Parallel-device merging; merged widths fold into the surviving
    /// device.
    pub merge: MergeMode,
    /// Default to hierarchical per-parent area/perimeter accounting.
    pub hier_ap: bool,
    /// Suppress attribute output.
    pub no_attrs: bool,
    /// Per-device-type style information.
    pub dev_info: Vec<DevTypeInfo>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            format: SimFormat::Mit,
            cap_threshold: 2.0,
            res_threshold: extflat::INFINITE_THRESHOLD,
            merge: MergeMode::None,
            hier_ap: false,
            no_attrs: false,
            dev_info: Vec::new(),
        }
    }
}

/// Errors while writing a `.sim` file.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Output stream failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const OUT_FLAGS: OutputFlags = OutputFlags::TRIM_GLOB.union(OutputFlags::COMMA_TO_SEMI);

struct SimEmitter<'a, W: Write> {
    sess: &'a Session,
    flat: &'a Flat,
    opts: &'a SimOptions,
    out: &'a mut W,
    alias: Option<&'a mut dyn Write>,
    labels: Option<&'a mut dyn Write>,
    mult: DevMultipliers,
    mult_idx: usize,
    ap_visited: std::collections::HashMap<NodeId, u64>,
    connected: std::collections::HashSet<NodeId>,
    issues: Issues,
}

/// Writes a `.sim` netlist for the flattened circuit.
///
/// When `alias` or `labels` streams are given, alias lines and label
/// locations go there instead of (respectively, in addition to) the main
/// file, as the `.al` and `.nodes` sidecars.
pub fn write_sim<'a, W: Write>(
    sess: &'a Session,
    flat: &'a Flat,
    opts: &'a SimOptions,
    out: &'a mut W,
    alias: Option<&'a mut dyn Write>,
    labels: Option<&'a mut dyn Write>,
) -> Result<Issues, SimError> {
    let mut em = SimEmitter {
        sess,
        flat,
        opts,
        out,
        alias,
        labels,
        mult: DevMultipliers::default(),
        mult_idx: 0,
        ap_visited: std::collections::HashMap::new(),
        connected: std::collections::HashSet::new(),
        issues: Issues::new(),
    };

    writeln!(
        em.out,
        "| units: {} tech: {} format: {}",
        sess.scale(),
        sess.tech.as_deref().unwrap_or("unknown"),
        opts.format
    )?;

    if opts.merge != MergeMode::None {
        let (mult, mi) = merge_parallel(sess, flat, opts.merge, opts.hier_ap);
        tracing::info!(merged = mult.merged, "parallel devices merged");
        em.mult = mult;
        em.issues.merge(&mi);
    }

    visit_devs(sess, flat, |_, v| em.dev_visit(v))?;
    visit_caps(sess, flat, |_, n1, n2, cap| em.cap_visit(n1, n2, cap))?;
    visit_resists(sess, flat, |_, r| em.resist_visit(r.node1, r.node2, r.res))?;
    visit_nodes(sess, flat, |_, nv| em.node_visit(nv.node, nv.res, nv.cap))?;

    Ok(em.issues)
}

impl<'a, W: Write> SimEmitter<'a, W> {
    fn name_of(&self, node: NodeId) -> String {
        self.sess
            .pool
            .render(self.flat.nodes.canonical_hier(node), OUT_FLAGS)
    }

    fn resolve(&self, prefix: Option<HierId>, suffix: HierId) -> Option<NodeId> {
        self.flat.resolve(self.sess, prefix, suffix)
    }

    /// Writes ` <node name>`, or ` GND` when the node cannot be found.
    fn out_node(&mut self, v: &DevVisit, term: usize) -> Result<(), SimError> {
        let hier = self
            .sess
            .def(v.def)
            .nodes
            .canonical_hier(v.dev.terms[term].node);
        self.out_hier(v, hier)
    }

    fn out_hier(&mut self, v: &DevVisit, hier: HierId) -> Result<(), SimError> {
        match self.resolve(v.prefix, hier) {
            Some(node) => {
                let name = self.name_of(node);
                write!(self.out, " {name}")?;
                self.connected.insert(node);
            }
            None => {
                write!(self.out, " GND")?;
            }
        }
        Ok(())
    }

    fn dev_info(&self, ty: usize) -> DevTypeInfo {
        self.opts.dev_info.get(ty).cloned().unwrap_or_default()
    }

    fn dev_visit(&mut self, v: &DevVisit) -> Result<(), SimError> {
        let dev = v.dev;
        let nterm = dev.terms.len();
        if nterm < 2 {
            return Ok(());
        }
        if self.opts.merge != MergeMode::None {
            let idx = self.mult_idx;
            self.mult_idx += 1;
            if self.mult.is_killed(idx) {
                return Ok(());
            }
        }

        let (l, mut w) = dev.length_width();
        if self.opts.merge != MergeMode::None {
            w = (w as f64 * self.mult.multiplier(self.mult_idx - 1)) as i64;
        }

        let gate = 0usize;
        let source = 1usize;
        let drain = if nterm >= 3 { 2 } else { source };
        let ty_name = self.sess.dev_types[dev.ty].clone();

        // The format allows only one character of device type.
        let mut is_subckt = false;
        match dev.class {
            DevClass::Bjt => write!(self.out, "b")?,
            DevClass::Diode | DevClass::NDiode | DevClass::PDiode => {
                is_subckt = true;
                write!(self.out, "x")?;
            }
            DevClass::Res => write!(self.out, "r")?,
            DevClass::Cap | DevClass::CapRev => write!(self.out, "c")?,
            DevClass::Fet | DevClass::Mosfet | DevClass::Asymmetric => {
                let first = ty_name.chars().next().unwrap_or('n');
                if first == 'n' || first == 'p' {
                    write!(self.out, "{first}")?;
                } else {
                    tracing::warn!(
                        "MOSFET device type \"{ty_name}\" does not start with \"n\" or \"p\" \
                         as the .sim format requires; defaulting to \"n\""
                    );
                    write!(self.out, "n")?;
                }
            }
            DevClass::Subckt | DevClass::MSubckt | DevClass::RSubckt | DevClass::CSubckt => {
                is_subckt = true;
                write!(self.out, "x")?;
            }
            DevClass::Volt => write!(self.out, "{}", ty_name.chars().next().unwrap_or('v'))?,
        }

        // Resistors have no gate terminal in this format.
        if dev.class != DevClass::Res {
            self.out_node(v, gate)?;
        }
        self.out_node(v, source)?;

        let subs_hier = dev
            .subs
            .map(|n| self.sess.def(v.def).nodes.canonical_hier(n));
        let is_diode = matches!(
            dev.class,
            DevClass::Diode | DevClass::NDiode | DevClass::PDiode
        );
        if dev.class == DevClass::Bjt && subs_hier.is_some() {
            self.out_hier(v, subs_hier.unwrap())?;
        } else if is_diode && nterm == 1 && subs_hier.is_some() {
            self.out_hier(v, subs_hier.unwrap())?;
        } else if nterm > 2 {
            self.out_node(v, drain)?;
        }
        for i in 3..nterm {
            self.out_node(v, i)?;
        }

        if !is_diode {
            if is_subckt && subs_hier.is_some() {
                // The substrate is the last port of subcircuit devices, so
                // resistance-extracted netlists keep it.
                self.write_substrate(v, subs_hier.unwrap(), dev.ty, false)?;
            } else if self.opts.format == SimFormat::Lbl && subs_hier.is_some() {
                self.write_substrate(v, subs_hier.unwrap(), dev.ty, false)?;
            }
        }

        let r = v.trans.apply_rect(&dev.rect);
        let scale = v.scale;

        if dev.class == DevClass::Bjt {
            // The collector well's length and width are recovered from the
            // substrate node's area and perimeter.
            let (mut ca, mut chp) = (0.0f64, 0.0f64);
            if let Some(sub) = dev.subs {
                let n = self.sess.def(v.def).nodes.node(sub);
                for pa in &n.pa {
                    ca += pa.area as f64;
                    chp += 0.5 * pa.perim as f64;
                }
            }
            let cl = 0.5 * (chp + (chp * chp - 4.0 * ca).max(0.0).sqrt());
            let cw = if cl > 0.0 { ca / cl } else { 0.0 };
            writeln!(
                self.out,
                " {} {} {} {}",
                cl as i64,
                cw as i64,
                r.left() as f64 * scale,
                r.bot() as f64 * scale
            )?;
            return Ok(());
        }

        match dev.class {
            DevClass::Res => {
                writeln!(self.out, " {:.6}", dev.res)?;
            }
            DevClass::Cap | DevClass::CapRev => {
                writeln!(self.out, " {:.6}", dev.cap)?;
            }
            _ if is_subckt => {
                if let Some(s) = dev.terms[source].attrs.as_deref() {
                    write!(self.out, " s={s}")?;
                }
                if source != drain {
                    if let Some(d) = dev.terms[drain].attrs.as_deref() {
                        write!(self.out, " d={d}")?;
                    }
                }
                write!(
                    self.out,
                    " l={} w={} x={} y={}",
                    l as f64 * scale,
                    w as f64 * scale,
                    r.left() as f64 * scale,
                    r.bot() as f64 * scale
                )?;
                writeln!(self.out, " {ty_name}")?;
            }
            _ if is_diode => {
                writeln!(self.out, " {ty_name}")?;
            }
            _ => {
                write!(
                    self.out,
                    " {} {} {} {}",
                    l as f64 * scale,
                    w as f64 * scale,
                    r.left() as f64 * scale,
                    r.bot() as f64 * scale
                )?;
                if !self.opts.no_attrs {
                    self.fet_attrs(v, gate, source, drain, subs_hier, scale)?;
                }
                writeln!(self.out)?;
            }
        }
        Ok(())
    }

    /// Attribute fields after a FET line; the SU format extends them with
    /// substrate and area/perimeter information.
    fn fet_attrs(
        &mut self,
        v: &DevVisit,
        gate: usize,
        source: usize,
        drain: usize,
        subs_hier: Option<HierId>,
        scale: f64,
    ) -> Result<(), SimError> {
        let dev = v.dev;
        let su = self.opts.format == SimFormat::Su;

        if let Some(g) = dev.terms[gate].attrs.as_deref() {
            write!(self.out, " g={g}")?;
            if su {
                write!(self.out, ",")?;
            }
        } else if su {
            write!(self.out, " g=")?;
        }
        if su {
            if let Some(sub) = subs_hier {
                self.write_substrate(v, sub, dev.ty, true)?;
            }
        }

        for (term, key, class) in [
            (source, "s", self.dev_info(dev.ty).res_class_source),
            (drain, "d", self.dev_info(dev.ty).res_class_drain),
        ] {
            if let Some(a) = dev.terms[term].attrs.as_deref() {
                write!(self.out, " {key}={a}")?;
                if su {
                    write!(self.out, ",")?;
                }
            } else if su {
                write!(self.out, " {key}=")?;
            }
            if su {
                let node = self.resolve(
                    v.prefix,
                    self.sess.def(v.def).nodes.canonical_hier(dev.terms[term].node),
                );
                self.write_ap(node, class, scale)?;
            }
        }
        Ok(())
    }

    /// `A_<area>,P_<perim>` for one node and class, printed once per
    /// (node, class) and as zeros afterwards.
    fn write_ap(
        &mut self,
        node: Option<NodeId>,
        class: Option<usize>,
        scale: f64,
    ) -> Result<(), SimError> {
        let (Some(node), Some(class)) = (node, class) else {
            write!(self.out, "A_0,P_0")?;
            return Ok(());
        };
        let bits = self.ap_visited.entry(node).or_insert(0);
        if *bits & (1 << class) != 0 {
            write!(self.out, "A_0,P_0")?;
            return Ok(());
        }
        *bits |= 1 << class;
        let pa = self
            .flat
            .nodes
            .node(node)
            .pa
            .get(class)
            .copied()
            .unwrap_or_default();
        let a = ((pa.area as f64 * scale * scale) as i64).max(0);
        let p = ((pa.perim as f64 * scale) as i64).max(0);
        write!(self.out, "A_{a},P_{p}")?;
        Ok(())
    }

    /// The substrate terminal: the default substrate prints by name, other
    /// nodes resolve through the flat table.  The SU format prefixes the
    /// name with `S_`.
    fn write_substrate(
        &mut self,
        v: &DevVisit,
        sub: HierId,
        ty: usize,
        in_attr: bool,
    ) -> Result<(), SimError> {
        let su = self.opts.format == SimFormat::Su;
        let suffix = self.sess.pool.path_string(sub);
        let info = self.dev_info(ty);
        if let Some(default) = &info.default_subs {
            if suffix.eq_ignore_ascii_case(default) {
                if !in_attr {
                    write!(self.out, " ")?;
                }
                if su {
                    write!(self.out, "S_")?;
                }
                let rendered = self.sess.pool.render(sub, OUT_FLAGS);
                write!(self.out, "{rendered}")?;
                return Ok(());
            }
        }
        match self.resolve(v.prefix, sub) {
            Some(node) => {
                let name = self.name_of(node);
                if !in_attr {
                    write!(self.out, " ")?;
                }
                if su {
                    write!(self.out, "S_")?;
                }
                write!(self.out, "{name}")?;
                self.connected.insert(node);
            }
            None => {
                if !in_attr {
                    write!(self.out, " ")?;
                }
                write!(self.out, "errGnd!")?;
            }
        }
        Ok(())
    }

    fn cap_visit(&mut self, n1: NodeId, n2: NodeId, cap_af: f64) -> Result<(), SimError> {
        let cap = cap_af / 1000.0;
        if cap <= self.opts.cap_threshold {
            return Ok(());
        }
        let name1 = self.name_of(n1);
        let name2 = self.name_of(n2);
        writeln!(self.out, "C {name1} {name2} {cap:.1}")?;
        Ok(())
    }

    fn resist_visit(&mut self, n1: NodeId, n2: NodeId, res_mohm: f64) -> Result<(), SimError> {
        let name1 = self.name_of(n1);
        let name2 = self.name_of(n2);
        writeln!(self.out, "r {name1} {name2} {}", res_mohm / 1000.0)?;
        self.connected.insert(n1);
        self.connected.insert(n2);
        Ok(())
    }

    fn node_visit(&mut self, node: NodeId, res_mohm: i64, cap_af: f64) -> Result<(), SimError> {
        let name = self.name_of(node);
        let cap = cap_af / 1000.0;
        let res = (res_mohm + 500) / 1000;

        if cap > self.opts.cap_threshold {
            writeln!(self.out, "C {name} GND {cap:.1}")?;
        }
        if (res as f64) > self.opts.res_threshold {
            writeln!(self.out, "R {name} {res}")?;
        }
        let n = self.flat.nodes.node(node);
        if !n.attrs.is_empty() && !self.opts.no_attrs {
            let joined: Vec<&str> = n.attrs.iter().map(|a| a.text.as_str()).collect();
            writeln!(self.out, "A {name} {}", joined.join(","))?;
        }

        // Alias lines, to the sidecar when one is open.  A global alias of
        // a global canonical name carries no information.
        let canon = self.flat.nodes.canonical_hier(node);
        let is_glob = self.sess.pool.is_global(canon);
        let mut aliases: Vec<HierId> = Vec::new();
        for nn in self.flat.nodes.chain(node).skip(1) {
            let hier = self.flat.nodes.name(nn).hier;
            if is_glob && self.sess.pool.is_global(hier) {
                continue;
            }
            aliases.push(hier);
        }
        for hier in aliases {
            let alias = self.sess.pool.render(hier, OUT_FLAGS);
            match self.alias.as_deref_mut() {
                Some(f) => writeln!(f, "= {name} {alias}")?,
                None => writeln!(self.out, "= {name} {alias}")?,
            }
        }

        if let Some(f) = self.labels.as_deref_mut() {
            writeln!(
                f,
                "{name} {} {} {}",
                n.loc.left(),
                n.loc.bot(),
                self.sess.layer_names[n.layer]
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use extflat::flat::{flat_build, FlatFlags};
    use extflat::read::{read_hierarchy, MapResolver};

    use super::*;

    fn emit(cells: &[(&str, &str)], opts: &SimOptions) -> (String, String, String) {
        let mut sess = Session::new();
        let resolver = MapResolver::from_cells(cells.iter().copied());
        let (root, _) = read_hierarchy(&mut sess, cells[0].0, &resolver).unwrap();
        let flat = flat_build(&mut sess, root, FlatFlags::NODES | FlatFlags::CAPS);
        let mut out = Vec::new();
        let mut al = Vec::new();
        let mut lab = Vec::new();
        write_sim(
            &sess,
            &flat,
            opts,
            &mut out,
            Some(&mut al),
            Some(&mut lab),
        )
        .unwrap();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(al).unwrap(),
            String::from_utf8(lab).unwrap(),
        )
    }

    const CELL: &str = "tech scmos\n\
        scale 1 1 100\n\
        resistclasses 10\n\
        node in 0 0 0 0 metal1 0 0\n\
        node out 0 9000 1 0 metal1 0 0\n\
        node Gnd! 0 0 3 0 metal1 0 0\n\
        equiv out outalias\n\
        device mosfet nfet 0 0 1 1 1 2 Gnd! in 2 0 Gnd! 2 0 out 2 0\n";

    #[test]
    fn header_and_device_line() {
        let (out, _, _) = emit(&[("cell", CELL)], &SimOptions::default());
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("| units: 100 tech: scmos format: MIT"));
        assert!(
            out.contains("n in Gnd out 1 2 0 0"),
            "device line missing in:\n{out}"
        );
    }

    #[test]
    fn node_caps_and_aliases() {
        let (out, al, labels) = emit(&[("cell", CELL)], &SimOptions::default());
        // 9000 aF = 9 fF survives the 2 fF threshold.
        assert!(out.contains("C out GND 9.0"), "{out}");
        // The alias goes to the sidecar, not the main file.
        assert!(!out.contains("= out outalias"), "{out}");
        assert!(al.contains("= out outalias"), "{al}");
        // Labels list every node's location and layer.
        assert!(labels.lines().any(|l| l.starts_with("out 1 0 metal1")), "{labels}");
    }

    #[test]
    fn mosfet_type_must_start_with_n_or_p() {
        let cell = "tech scmos\n\
            resistclasses\n\
            node a 0 0 0 0 metal1\n\
            node b 0 0 1 0 metal1\n\
            device mosfet weird 0 0 1 1 1 2 None a 2 0 b 2 0 b 2 0\n";
        let (out, _, _) = emit(&[("cell", cell)], &SimOptions::default());
        assert!(out.lines().any(|l| l.starts_with("n a b")), "{out}");
    }

    #[test]
    fn su_format_carries_area_perimeter() {
        let cell = "tech scmos\n\
            resistclasses 10\n\
            node a 0 0 0 0 metal1 0 0\n\
            node s 0 0 1 0 metal1 100 40\n\
            device mosfet nfet 0 0 1 1 1 2 None a 2 0 s 2 0 s 2 0\n";
        let opts = SimOptions {
            format: SimFormat::Su,
            dev_info: vec![
                DevTypeInfo {
                    res_class_source: Some(0),
                    res_class_drain: Some(0),
                    ..Default::default()
                };
                1
            ],
            ..Default::default()
        };
        let (out, _, _) = emit(&[("cell", cell)], &opts);
        // First use prints the real values, the second zeros.
        assert!(out.contains("s=A_100,P_40"), "{out}");
        assert!(out.contains("d=A_0,P_0"), "{out}");
    }

    #[test]
    fn resistor_and_capacitor_devices() {
        let cell = "tech scmos\n\
            resistclasses\n\
            node m 0 0 0 0 metal1\n\
            node a 0 0 1 0 metal1\n\
            node b 0 0 2 0 metal1\n\
            device res None 0 0 1 1 250.5 m 1 0 a 1 0 b 1 0\n\
            device cap None 0 0 1 1 17.25 a 1 0 b 1 0\n";
        let (out, _, _) = emit(&[("cell", cell)], &SimOptions::default());
        assert!(out.contains("r a b 250.500000"), "{out}");
        assert!(out.contains("c a b 17.250000"), "{out}");
    }
}
