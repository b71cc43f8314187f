//! SPICE netlist emission from flattened circuit extraction data.
//!
//! Writes the flat graph built by [`extflat`] as a SPICE deck in one of
//! four flavors (SPICE2, SPICE3, HSPICE, NGSPICE), either fully flat or —
//! via [`hier`] — as one subcircuit per cell definition.  Output is
//! deterministic: emitting the same flattened circuit twice yields
//! byte-identical text.

#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::io::Write;
use std::str::FromStr;

use arcstr::ArcStr;
use indexmap::IndexMap;

use itertools::Itertools;

use extflat::def::DefId;
use extflat::dev::{
    attrs_contain, merge_parallel, term_cached_ap, term_wants_hier_ap, DevClass, DevMultipliers,
    MergeMode,
};
use extflat::flat::Flat;
use extflat::node::NameId;
use extflat::visit::{
    visit_caps, visit_devs, visit_nodes, visit_resists, visit_subcircuits, DevVisit,
};
use extflat::{ErrorKind, HierId, Issues, NodeFlags, NodeId, OutputFlags, Session};

pub mod hier;
mod value;

#[cfg(test)]
mod tests;

pub use value::{g_format, si_value};

/// HSPICE's node name length limit.
const HSPICE_NAME_MAX: usize = 15;

/// The SPICE dialect to write.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SpiceFormat {
    /// Nodes become integers; comments carry the real names.
    Spice2,
    /// Full hierarchical node names.
    #[default]
    Spice3,
    /// Hierarchical names shortened to 15 characters.
    Hspice,
    /// As SPICE3, with `$`-prefixed inline comments.
    Ngspice,
}

impl Display for SpiceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spice2 => write!(f, "SPICE2"),
            Self::Spice3 => write!(f, "SPICE3"),
            Self::Hspice => write!(f, "HSPICE"),
            Self::Ngspice => write!(f, "NGSPICE"),
        }
    }
}

/// An error parsing a SPICE format name.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("unknown SPICE format")]
pub struct ParseFormatError;

impl FromStr for SpiceFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spice2" => Ok(Self::Spice2),
            "spice3" => Ok(Self::Spice3),
            "hspice" => Ok(Self::Hspice),
            "ngspice" => Ok(Self::Ngspice),
            _ => Err(ParseFormatError),
        }
    }
}

/// How to keep shorted subcircuit ports distinguishable.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ShortMode {
    /// Merge them; only the canonical name appears.
    #[default]
    None,
    /// Separate them with a zero-ohm resistor.
    Resistor,
    /// Separate them with a zero-volt source.
    Voltage,
}

/// Whether the top cell gets a `.subckt` wrapper.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TopMode {
    /// Always.
    On,
    /// Never.
    Off,
    /// Only when the top cell declares ports.
    #[default]
    Auto,
}

/// Per-device-type information from the extraction style: which resistance
/// classes govern the source, drain, and substrate terminals, and the
/// default substrate node name.
#[derive(Clone, Debug, Default)]
pub struct DevTypeInfo {
    /// Resistance class of the source terminal.
    pub res_class_source: Option<usize>,
    /// Resistance class of the drain terminal.
    pub res_class_drain: Option<usize>,
    /// Resistance class of the substrate.
    pub res_class_sub: Option<usize>,
    /// Default substrate node name (e.g. `Gnd!`).
    pub default_subs: Option<ArcStr>,
}

/// Options controlling SPICE output.
#[derive(Clone, Debug)]
pub struct SpiceOptions {
    /// Output dialect.
    pub format: SpiceFormat,
    /// Capacitors below this many femtofarads are dropped;
    /// [`extflat::INFINITE_THRESHOLD`] drops them all.
    pub cap_threshold: f64,
    /// Node resistances below this many ohms are dropped.
    pub res_threshold: f64,
    /// Parallel-device merging policy.
    pub merge: MergeMode,
    /// Emit subcircuit calls for cells with ports instead of descending.
    pub subckts: bool,
    /// `.subckt` wrapper policy for the top cell.
    pub top: TopMode,
    /// Emit hierarchical output: one subcircuit per def.
    pub hierarchy: bool,
    /// Emit abstract views as black-box subcircuit stubs.
    pub blackbox: bool,
    /// Number subcircuit instances `X1, X2, ...` instead of keeping
    /// instance names.
    pub renumber: bool,
    /// Merge disconnected nets that share a global name.
    pub merge_names: bool,
    /// Separation of shorted ports.
    pub short: ShortMode,
    /// Emit a `.option scale=` card instead of baking the scale into every
    /// value.
    pub scale_card: bool,
    /// Model each resistor as a tee network around its center node.
    pub resistor_tee: bool,
    /// Default to hierarchical per-parent source/drain area-perimeter.
    pub hier_ap: bool,
    /// Suppress attribute comments.
    pub no_attrs: bool,
    /// Per-device-type style information, indexed like the session's
    /// device-type table.
    pub dev_info: Vec<DevTypeInfo>,
}

impl Default for SpiceOptions {
    fn default() -> Self {
        Self {
            format: SpiceFormat::Spice3,
            cap_threshold: 2.0,
            res_threshold: extflat::INFINITE_THRESHOLD,
            merge: MergeMode::None,
            subckts: true,
            top: TopMode::Auto,
            hierarchy: false,
            blackbox: false,
            renumber: false,
            merge_names: true,
            short: ShortMode::None,
            scale_card: true,
            resistor_tee: false,
            hier_ap: false,
            no_attrs: false,
            dev_info: Vec::new(),
        }
    }
}

impl SpiceOptions {
    /// The conventional option combination for LVS runs.
    pub fn lvs() -> Self {
        Self {
            format: SpiceFormat::Ngspice,
            cap_threshold: extflat::INFINITE_THRESHOLD,
            res_threshold: extflat::INFINITE_THRESHOLD,
            hierarchy: true,
            renumber: false,
            scale_card: false,
            blackbox: true,
            merge_names: false,
            top: TopMode::Auto,
            ..Self::default()
        }
    }

    fn out_flags(&self) -> OutputFlags {
        let base = OutputFlags::TRIM_GLOB
            | OutputFlags::EQUAL_TO_COLON
            | OutputFlags::COMMA_TO_BAR;
        match self.format {
            SpiceFormat::Hspice => base | OutputFlags::TRIM_LOCAL | OutputFlags::DOT_TO_AT,
            _ => base,
        }
    }
}

/// Errors while writing a netlist.
#[derive(Debug, thiserror::Error)]
pub enum NetlistError {
    /// Output stream failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An HSPICE node name could not be shortened to 15 characters.
    #[error("node name `{name}` cannot be shortened for HSPICE output")]
    NamesTooLong {
        /// The unshortenable name.
        name: String,
    },
}

/// Clears the subcircuit marking from every def, so the emitters descend
/// into everything.  Used when subcircuit calls are disabled.
pub fn undef_subcircuits(sess: &mut Session) {
    let ids: Vec<DefId> = sess.defs().map(|(id, _)| id).collect();
    for id in ids {
        sess.def_mut(id)
            .flags
            .remove(extflat::DefFlags::SUBCIRCUIT);
    }
}

/// Flattens the circuit for flat SPICE output and decides whether the deck
/// gets a `.subckt` wrapper.
///
/// Applies the subcircuit policy first (subcircuit markings are cleared
/// entirely when calls are disabled, and always from the root so its own
/// contents are visited), then flattens with the flags the options imply.
pub fn prepare_flat(
    sess: &mut Session,
    root: DefId,
    opts: &SpiceOptions,
) -> (Flat, bool) {
    use extflat::flat::{flat_build, FlatFlags};

    let root_is_subckt = sess
        .def(root)
        .flags
        .contains(extflat::DefFlags::SUBCIRCUIT);
    let wrapper = match opts.top {
        TopMode::On => true,
        TopMode::Off => false,
        TopMode::Auto => root_is_subckt,
    };
    if !opts.subckts {
        undef_subcircuits(sess);
    }
    sess.def_mut(root)
        .flags
        .remove(extflat::DefFlags::SUBCIRCUIT);

    let mut flags = FlatFlags::NODES;
    if extflat::is_finite_threshold(opts.cap_threshold) {
        flags = flags | FlatFlags::CAPS;
    }
    if !opts.merge_names {
        flags = flags | FlatFlags::NO_NAME_MERGE;
    }
    (flat_build(sess, root, flags), wrapper)
}

/// Mutable bookkeeping for one emission run: instance counters, the node
/// name cache, the HSPICE shortening dictionary, and the visited-once marks
/// for area/perimeter output.
struct EmitState {
    cap_num: usize,
    dev_num: usize,
    res_num: usize,
    diode_num: usize,
    volt_num: usize,
    node_num: usize,
    sbck_num: usize,
    shorten_num: usize,
    node_names: HashMap<NodeId, String>,
    shorten: IndexMap<String, usize>,
    ap_visited: HashMap<NodeId, u64>,
    ap_prefix: HashMap<NodeId, Option<HierId>>,
    connected: HashSet<NodeId>,
    mult: DevMultipliers,
    mult_idx: usize,
    issues: Issues,
}

impl EmitState {
    fn new() -> Self {
        Self {
            cap_num: 0,
            dev_num: 1000,
            res_num: 0,
            diode_num: 0,
            volt_num: 0,
            node_num: 10,
            sbck_num: 0,
            shorten_num: 1,
            node_names: HashMap::new(),
            shorten: IndexMap::new(),
            ap_visited: HashMap::new(),
            ap_prefix: HashMap::new(),
            connected: HashSet::new(),
            mult: DevMultipliers::default(),
            mult_idx: 0,
            issues: Issues::new(),
        }
    }

    fn mark_ap_visited(&mut self, node: NodeId, class: usize) -> bool {
        let bits = self.ap_visited.entry(node).or_insert(0);
        let seen = *bits & (1 << class) != 0;
        *bits |= 1 << class;
        seen
    }
}

struct Emitter<'a, W> {
    sess: &'a Session,
    flat: &'a Flat,
    opts: &'a SpiceOptions,
    out: &'a mut W,
    st: EmitState,
    /// `None` while a `.option scale=` card carries the scale; otherwise
    /// the baked-in multiplier (centimicrons per lambda / 100).
    es_scale: Option<f64>,
    cap_node: String,
}

/// Writes a fully flat SPICE netlist for the flattened circuit.
///
/// `cell` is the root cell name for the header comment; `wrapper` selects a
/// `.subckt`/`.ends` wrapper around the whole deck (decided by the caller
/// from [`TopMode`] and whether the root declares ports).
pub fn write_flat_spice<W: Write>(
    sess: &Session,
    flat: &Flat,
    opts: &SpiceOptions,
    cell: &str,
    wrapper: bool,
    out: &mut W,
) -> Result<Issues, NetlistError> {
    let mut em = Emitter {
        sess,
        flat,
        opts,
        out,
        st: EmitState::new(),
        es_scale: if opts.scale_card {
            None
        } else {
            Some(sess.scale() / 100.0)
        },
        cap_node: String::new(),
    };
    em.prelude(cell)?;
    if wrapper {
        em.top_visit(flat.root(), false)?;
    }
    em.body()?;
    if wrapper {
        writeln!(em.out, ".ends")?;
    }
    if opts.format == SpiceFormat::Hspice {
        em.shorten_dict()?;
    }
    Ok(em.st.issues)
}

impl<'a, W: Write> Emitter<'a, W> {
    fn prelude(&mut self, cell: &str) -> Result<(), NetlistError> {
        writeln!(
            self.out,
            "* {} file created from {}.ext - technology: {}\n",
            self.opts.format,
            cell,
            self.sess
                .tech
                .as_deref()
                .unwrap_or("unknown")
        )?;
        if self.es_scale.is_none() {
            writeln!(
                self.out,
                ".option scale={}\n",
                si_value(1.0e-6 * self.sess.scale() / 100.0)
            )?;
        }
        Ok(())
    }

    /// Devices, coupling caps, explicit resistors, subcircuit calls, and
    /// node parasitics, in that order.
    fn body(&mut self) -> Result<(), NetlistError> {
        if self.opts.merge != MergeMode::None {
            let (mult, mi) = merge_parallel(self.sess, self.flat, self.opts.merge, self.opts.hier_ap);
            tracing::info!(merged = mult.merged, "parallel devices merged");
            self.st.mult = mult;
            self.st.issues.merge(&mi);
            self.st.mult_idx = 0;
        }

        let (sess, flat) = (self.sess, self.flat);
        visit_devs(sess, flat, |_, v| self.dev_visit(v))?;
        visit_caps(sess, flat, |_, n1, n2, cap| self.cap_visit(n1, n2, cap))?;
        visit_resists(sess, flat, |_, r| self.resist_visit(r.node1, r.node2, r.res))?;
        visit_subcircuits(sess, flat, |_, s| {
            if s.is_top {
                return Ok(());
            }
            self.subckt_call(s.def, s.prefix)
        })?;

        self.cap_node = self.substrate_name()?;
        visit_nodes(sess, flat, |_, nv| self.node_visit(nv.node, nv.cap))?;
        Ok(())
    }

    fn comment_lead(&mut self) -> std::io::Result<()> {
        if self.opts.format == SpiceFormat::Ngspice {
            write!(self.out, "$ ")?;
        }
        Ok(())
    }

    /// The name a node prints as, cached per node.
    fn node_name(&mut self, node: NodeId) -> Result<String, NetlistError> {
        if let Some(name) = self.st.node_names.get(&node) {
            return Ok(name.clone());
        }
        let name = match self.opts.format {
            SpiceFormat::Spice2 => {
                let n = self.st.node_num;
                self.st.node_num += 1;
                n.to_string()
            }
            SpiceFormat::Spice3 | SpiceFormat::Ngspice => {
                let hier = self.flat.nodes.canonical_hier(node);
                self.sess.pool.render(hier, self.opts.out_flags())
            }
            SpiceFormat::Hspice => {
                let hier = self.flat.nodes.canonical_hier(node);
                let full = self.sess.pool.render(hier, self.opts.out_flags());
                self.shorten_name(full)?
            }
        };
        self.st.node_names.insert(node, name.clone());
        Ok(name)
    }

    /// HSPICE name shortening: replace the path prefix with a dictionary
    /// entry `x<N>`, falling back to `z@<K>` names.
    fn shorten_name(&mut self, full: String) -> Result<String, NetlistError> {
        if full.len() <= HSPICE_NAME_MAX {
            return Ok(full);
        }
        if let Some(slash) = full.rfind('/') {
            let prefix = &full[..slash];
            let leaf = &full[slash + 1..];
            let n = match self.st.shorten.get(prefix) {
                Some(&n) => n,
                None => {
                    let n = self.st.shorten_num;
                    self.st.shorten_num += 1;
                    self.st.shorten.insert(prefix.to_string(), n);
                    n
                }
            };
            let cand = format!("x{n}/{leaf}");
            if cand.len() <= HSPICE_NAME_MAX {
                return Ok(cand);
            }
        }
        let z = format!("z@{}", self.st.node_num);
        self.st.node_num += 1;
        if z.len() > HSPICE_NAME_MAX {
            self.st.issues.record(ErrorKind::NamesTooLong);
            return Err(NetlistError::NamesTooLong { name: full });
        }
        Ok(z)
    }

    /// The trailing dictionary comment mapping `x<N>` entries back to full
    /// path prefixes, in insertion order.
    fn shorten_dict(&mut self) -> Result<(), NetlistError> {
        writeln!(self.out, "\n** hspice subcircuit dictionary")?;
        let entries: Vec<(String, usize)> = self
            .st
            .shorten
            .iter()
            .map(|(k, &v)| (k.clone(), v))
            .collect();
        for (prefix, n) in entries {
            writeln!(self.out, "* x{n}\t{prefix}")?;
        }
        Ok(())
    }

    /// Writes ` <node name>` for the node `suffix` resolves to under
    /// `prefix`, or ` errGnd!` when it cannot be found.  Returns the number
    /// of characters written.
    fn out_node(
        &mut self,
        prefix: Option<HierId>,
        suffix: HierId,
    ) -> Result<usize, NetlistError> {
        match self.flat.resolve(self.sess, prefix, suffix) {
            Some(node) => {
                let name = self.node_name(node)?;
                write!(self.out, " {name}")?;
                self.st.connected.insert(node);
                Ok(1 + name.len())
            }
            None => {
                write!(self.out, " errGnd!")?;
                Ok(8)
            }
        }
    }

    fn term_flat_node(&self, v: &DevVisit, term: usize) -> Option<NodeId> {
        let hier = self
            .sess
            .def(v.def)
            .nodes
            .canonical_hier(v.dev.terms[term].node);
        self.flat.resolve(self.sess, v.prefix, hier)
    }

    fn term_hier(&self, v: &DevVisit, term: usize) -> HierId {
        self.sess
            .def(v.def)
            .nodes
            .canonical_hier(v.dev.terms[term].node)
    }

    fn dev_info(&self, ty: usize) -> DevTypeInfo {
        self.opts.dev_info.get(ty).cloned().unwrap_or_default()
    }

    /// Emits one device line (or several, for resistor tee networks).
    fn dev_visit(&mut self, v: &DevVisit) -> Result<(), NetlistError> {
        let dev = v.dev;
        if dev.terms.is_empty() {
            return Ok(());
        }
        if self.opts.merge != MergeMode::None {
            let idx = self.st.mult_idx;
            self.st.mult_idx += 1;
            if self.st.mult.is_killed(idx) {
                return Ok(());
            }
        }
        let sd_m = if self.opts.merge != MergeMode::None {
            self.st.mult.multiplier(self.st.mult_idx - 1)
        } else {
            1.0
        };

        let (l, w) = dev.length_width();
        let nterm = dev.terms.len();
        let gate = 0usize;
        let mut source = if nterm >= 2 { 1 } else { 0 };
        let mut drain = if nterm >= 3 { 2 } else { source };
        // Explicit S/D labels at the poly-diffusion interface override the
        // default source/drain ordering.
        if nterm >= 3 {
            let a1 = dev.terms[1].attrs.as_deref();
            let a2 = dev.terms[2].attrs.as_deref();
            if a1 == Some("D") || a2 == Some("S") {
                std::mem::swap(&mut source, &mut drain);
            }
        }

        let ty_name = self.sess.dev_types[dev.ty].clone();
        let mut class = dev.class;
        if ty_name.as_str() == "npn" {
            class = DevClass::Bjt;
        }
        let has_model = ty_name.as_str() != "None";

        match class {
            DevClass::Subckt | DevClass::RSubckt | DevClass::CSubckt | DevClass::MSubckt => {}
            DevClass::Diode | DevClass::NDiode | DevClass::PDiode => {
                if nterm < 2 && dev.subs.is_none() {
                    tracing::warn!("diode has only one terminal");
                    return Ok(());
                }
            }
            _ => {
                if nterm < 2 {
                    tracing::warn!("device other than subcircuit has only one terminal");
                    return Ok(());
                }
            }
        }

        // Flag electrically shorted devices.
        if nterm >= 2 {
            let tied = match class {
                DevClass::Mosfet | DevClass::Asymmetric | DevClass::Fet => {
                    (self.term_flat_node(v, source), "** SOURCE/DRAIN TIED")
                }
                _ => (self.term_flat_node(v, gate), "** SHORTED DEVICE"),
            };
            let other = match class {
                DevClass::Mosfet | DevClass::Asymmetric | DevClass::Fet => {
                    self.term_flat_node(v, drain)
                }
                _ => self.term_flat_node(v, source),
            };
            if tied.0.is_some() && tied.0 == other {
                self.comment_lead()?;
                writeln!(self.out, "{}", tied.1)?;
            }
        }

        let letter = match class {
            DevClass::Mosfet | DevClass::Asymmetric | DevClass::Fet => 'M',
            DevClass::Bjt => 'Q',
            DevClass::Diode | DevClass::NDiode | DevClass::PDiode => 'D',
            DevClass::Res => 'R',
            DevClass::Volt => 'V',
            DevClass::Cap | DevClass::CapRev => 'C',
            DevClass::Subckt | DevClass::RSubckt | DevClass::CSubckt | DevClass::MSubckt => 'X',
        };
        write!(self.out, "{letter}")?;

        // The instance id comes from the gate attributes when present, so
        // names stay stable across re-extraction.
        if let Some(attrs) = dev.terms[gate].attrs.as_deref() {
            let prefix = v
                .prefix
                .map(|p| self.sess.pool.path_string(p))
                .unwrap_or_default();
            write!(self.out, "{prefix}{attrs}")?;
        } else {
            match class {
                DevClass::Res => {
                    write!(self.out, "{}", self.st.res_num)?;
                    self.st.res_num += 1;
                    if self.opts.resistor_tee {
                        write!(self.out, "A")?;
                    }
                }
                DevClass::Diode | DevClass::NDiode | DevClass::PDiode => {
                    write!(self.out, "{}", self.st.diode_num)?;
                    self.st.diode_num += 1;
                }
                DevClass::Cap | DevClass::CapRev => {
                    write!(self.out, "{}", self.st.cap_num)?;
                    self.st.cap_num += 1;
                }
                DevClass::Volt => {
                    write!(self.out, "{}", self.st.volt_num)?;
                    self.st.volt_num += 1;
                }
                DevClass::Subckt | DevClass::RSubckt | DevClass::CSubckt | DevClass::MSubckt => {
                    write!(self.out, "{}", self.st.sbck_num)?;
                    self.st.sbck_num += 1;
                }
                _ => {
                    write!(self.out, "{}", self.st.dev_num)?;
                    self.st.dev_num += 1;
                }
            }
        }

        match class {
            DevClass::Bjt => {
                // Qnnn collector emitter base model: collector is the
                // substrate, emitter the gate, and base whichever of
                // source/drain is not the gate's net.
                if let Some(sub) = dev.subs {
                    let hier = self.sess.def(v.def).nodes.canonical_hier(sub);
                    self.out_node(v.prefix, hier)?;
                }
                self.out_node(v.prefix, self.term_hier(v, gate))?;
                let base = if self.term_flat_node(v, gate) == self.term_flat_node(v, source) {
                    drain
                } else {
                    source
                };
                self.out_node(v.prefix, self.term_hier(v, base))?;
                write!(self.out, " {ty_name}")?;
                self.write_params(v, l, w, sd_m)?;
            }

            DevClass::Subckt | DevClass::MSubckt | DevClass::CSubckt | DevClass::RSubckt => {
                // Xnnn gate [source [drain [sub]]] ... model, with
                // MOS-like subcircuits drain-first and R/C-like ones
                // omitting the gate (it is an identifier only).
                if class == DevClass::MSubckt {
                    self.out_node(v.prefix, self.term_hier(v, drain))?;
                }
                if matches!(class, DevClass::Subckt | DevClass::MSubckt | DevClass::CSubckt) {
                    self.out_node(v.prefix, self.term_hier(v, gate))?;
                }
                if class == DevClass::MSubckt {
                    if nterm > 2 {
                        self.out_node(v.prefix, self.term_hier(v, source))?;
                    }
                } else {
                    if nterm > 1 {
                        self.out_node(v.prefix, self.term_hier(v, source))?;
                    }
                    if nterm > 2 {
                        self.out_node(v.prefix, self.term_hier(v, drain))?;
                    }
                }
                for i in 3..nterm {
                    self.out_node(v.prefix, self.term_hier(v, i))?;
                }

                // The substrate may be passed as a parameter instead of a
                // node.
                let has_sub_param = self
                    .sess
                    .device_params(&ty_name)
                    .iter()
                    .any(|p| p.template.starts_with('s'));
                if !has_sub_param {
                    if let Some(sub) = dev.subs {
                        write!(self.out, " ")?;
                        self.substrate(v, sub, dev.ty)?;
                    }
                }
                write!(self.out, " {ty_name}")?;
                self.write_params(v, l, w, sd_m)?;
                if sd_m != 1.0 {
                    write!(self.out, " M={}", g_format(sd_m, 6))?;
                }
            }

            DevClass::Res => {
                if self.opts.resistor_tee {
                    self.one_resistor(v, gate, source, has_model, l, w, 2, sd_m)?;
                    write!(self.out, "\n{letter}")?;
                    if let Some(attrs) = dev.terms[gate].attrs.as_deref() {
                        let prefix = v
                            .prefix
                            .map(|p| self.sess.pool.path_string(p))
                            .unwrap_or_default();
                        write!(self.out, "{prefix}{attrs}B")?;
                    } else {
                        write!(self.out, "{}B", self.st.res_num - 1)?;
                    }
                    self.one_resistor(v, gate, drain, has_model, l, w, 2, sd_m)?;
                } else {
                    self.one_resistor(v, source, drain, has_model, l, w, 1, sd_m)?;
                }
            }

            DevClass::Volt => {
                // Zero-volt source separating shorted port names.
                if nterm > 1 {
                    self.out_node(v.prefix, self.term_hier(v, source))?;
                }
                if nterm > 2 {
                    self.out_node(v.prefix, self.term_hier(v, drain))?;
                }
                write!(self.out, " 0.0")?;
            }

            DevClass::Diode | DevClass::PDiode => {
                // Dnnn top bottom model.
                self.out_node(v.prefix, self.term_hier(v, gate))?;
                if nterm > 1 {
                    self.out_node(v.prefix, self.term_hier(v, source))?;
                } else if let Some(sub) = dev.subs {
                    let hier = self.sess.def(v.def).nodes.canonical_hier(sub);
                    self.out_node(v.prefix, hier)?;
                }
                write!(self.out, " {ty_name}")?;
                self.write_params(v, l, w, sd_m)?;
            }

            DevClass::NDiode => {
                // Dnnn bottom top model.
                if nterm > 1 {
                    self.out_node(v.prefix, self.term_hier(v, source))?;
                } else if let Some(sub) = dev.subs {
                    let hier = self.sess.def(v.def).nodes.canonical_hier(sub);
                    self.out_node(v.prefix, hier)?;
                }
                self.out_node(v.prefix, self.term_hier(v, gate))?;
                write!(self.out, " {ty_name}")?;
                self.write_params(v, l, w, sd_m)?;
            }

            DevClass::Cap | DevClass::CapRev => {
                let (top, bottom) = if class == DevClass::Cap {
                    (gate, source)
                } else {
                    (source, gate)
                };
                self.out_node(v.prefix, self.term_hier(v, top))?;
                self.out_node(v.prefix, self.term_hier(v, bottom))?;
                if !has_model {
                    write!(self.out, " {}", si_value(1.0e-15 * sd_m * dev.cap))?;
                    self.write_params(v, l, w, sd_m)?;
                } else {
                    write!(self.out, " {ty_name}")?;
                    self.write_lw(l, w, v.scale, 1)?;
                    self.write_params(v, l, w, sd_m)?;
                    if sd_m != 1.0 {
                        write!(self.out, " M={}", g_format(sd_m, 6))?;
                    }
                }
            }

            DevClass::Fet | DevClass::Mosfet | DevClass::Asymmetric => {
                // Mnnn drain gate source [substrate] model w= l=
                self.out_node(v.prefix, self.term_hier(v, drain))?;
                self.out_node(v.prefix, self.term_hier(v, gate))?;
                self.out_node(v.prefix, self.term_hier(v, source))?;
                if let Some(sub) = dev.subs {
                    write!(self.out, " ")?;
                    self.substrate(v, sub, dev.ty)?;
                }
                write!(self.out, " {ty_name}")?;
                self.write_lw(l, w, v.scale, 1)?;
                self.write_params(v, l, w, sd_m)?;
                if sd_m != 1.0 {
                    write!(self.out, " M={}", g_format(sd_m, 6))?;
                }

                // Source/drain area and perimeter, each printed once per
                // (node, class).
                let info = self.dev_info(dev.ty);
                if info.res_class_source.is_some() || info.res_class_drain.is_some() {
                    let hier_s = term_wants_hier_ap(&dev.terms[source], self.opts.hier_ap);
                    let hier_d = term_wants_hier_ap(&dev.terms[drain], self.opts.hier_ap);
                    write!(self.out, "\n+ ")?;
                    self.terminal_ap(v, drain, info.res_class_drain, "ad", "pd", sd_m, hier_d)?;
                    self.terminal_ap(v, source, info.res_class_source, "as", "ps", sd_m, hier_s)?;

                    let sub_ap = dev.terms[gate]
                        .attrs
                        .as_deref()
                        .map(|a| attrs_contain(a, "ext:aps"))
                        .unwrap_or(false);
                    if sub_ap {
                        write!(self.out, " * ")?;
                        match (info.res_class_sub, dev.subs) {
                            (Some(class), Some(sub)) => {
                                let hier = self.sess.def(v.def).nodes.canonical_hier(sub);
                                let node = self.flat.resolve(self.sess, v.prefix, hier);
                                self.node_ap(node, None, Some(class), v.scale, "asub", "psub", sd_m)?;
                            }
                            _ => {
                                write!(self.out, "asub=0 psub=0")?;
                            }
                        }
                    }
                }

                // Attribute comments.
                if !self.opts.no_attrs {
                    let g = dev.terms[gate].attrs.as_deref().filter(|a| !a.is_empty());
                    let s = dev.terms[source].attrs.as_deref().filter(|a| !a.is_empty());
                    let d = dev.terms[drain].attrs.as_deref().filter(|a| !a.is_empty());
                    if g.is_some() || s.is_some() || d.is_some() {
                        write!(self.out, "\n**devattr")?;
                        if let Some(g) = g {
                            write!(self.out, " g={g}")?;
                        }
                        if let Some(s) = s {
                            write!(self.out, " s={s}")?;
                        }
                        if let Some(d) = d {
                            write!(self.out, " d={d}")?;
                        }
                    }
                }
            }
        }
        writeln!(self.out)?;
        Ok(())
    }

    /// One half (or the whole) of a resistor device line, after the name.
    #[allow(clippy::too_many_arguments)]
    fn one_resistor(
        &mut self,
        v: &DevVisit,
        t1: usize,
        t2: usize,
        has_model: bool,
        l: i64,
        w: i64,
        dscale: i64,
        sd_m: f64,
    ) -> Result<(), NetlistError> {
        self.out_node(v.prefix, self.term_hier(v, t1))?;
        self.out_node(v.prefix, self.term_hier(v, t2))?;
        if !has_model {
            write!(
                self.out,
                " {:.6}",
                v.dev.res / dscale as f64 / sd_m
            )?;
            self.write_params(v, l, w, sd_m)?;
        } else {
            write!(self.out, " {}", self.sess.dev_types[v.dev.ty])?;
            self.write_lw(l, w, v.scale, dscale)?;
            self.write_params(v, l, w, sd_m)?;
            if sd_m != 1.0 {
                write!(self.out, " M={}", g_format(sd_m, 6))?;
            }
        }
        Ok(())
    }

    /// ` w=... l=...`, in raw units under a scale card, in SI units
    /// otherwise.
    fn write_lw(&mut self, l: i64, w: i64, scale: f64, dscale: i64) -> Result<(), NetlistError> {
        match self.es_scale {
            None => write!(
                self.out,
                " w={} l={}",
                g_format(w as f64 * scale, 6),
                g_format(l as f64 * scale / dscale as f64, 6)
            )?,
            Some(es) => write!(
                self.out,
                " w={} l={}",
                si_value(1.0e-6 * w as f64 * scale * es),
                si_value(1.0e-6 * l as f64 * scale * es / dscale as f64)
            )?,
        }
        Ok(())
    }

    /// Writes the device's templated parameters followed by its verbatim
    /// pass-through parameters.
    fn write_params(&mut self, v: &DevVisit, l: i64, w: i64, sd_m: f64) -> Result<(), NetlistError> {
        let dev = v.dev;
        let ty_name = self.sess.dev_types[dev.ty].clone();
        let params = self.sess.device_params(&ty_name).to_vec();
        let scale = v.scale;

        let mut i = 0;
        while i < params.len() {
            let p = &params[i];
            let (letter, digit) = template_kind(&p.template);
            match letter {
                Some('a') if digit.map_or(true, |d| d == 0) => {
                    write!(self.out, " {}=", p.key)?;
                    self.area_value(dev.area as f64, scale, p.scale)?;
                }
                Some('p') if digit.map_or(true, |d| d == 0) => {
                    write!(self.out, " {}=", p.key)?;
                    self.length_value(dev.perim as f64, scale, p.scale)?;
                }
                Some('a') | Some('p') => {
                    // a<n> and p<n> address a terminal; a following
                    // template for the same terminal's other quantity is
                    // printed in the same visit so the visited-once marks
                    // don't zero it.
                    let d = digit.unwrap();
                    let term = (d as usize).min(dev.terms.len() - 1);
                    let info = self.dev_info(dev.ty);
                    let class = if term > 1 {
                        info.res_class_drain
                    } else {
                        info.res_class_source
                    };
                    let mut akey: Option<&str> = None;
                    let mut pkey: Option<&str> = None;
                    if letter == Some('a') {
                        akey = Some(&p.key);
                    } else {
                        pkey = Some(&p.key);
                    }
                    if let Some(next) = params.get(i + 1) {
                        let (nl, nd) = template_kind(&next.template);
                        if nd == digit && (nl == Some('a') || nl == Some('p')) {
                            if nl == Some('a') {
                                akey = Some(&next.key);
                            } else {
                                pkey = Some(&next.key);
                            }
                            i += 1;
                        }
                    }
                    let hier = term_wants_hier_ap(&dev.terms[term], self.opts.hier_ap);
                    let akey = akey.map(|s| s.to_string());
                    let pkey = pkey.map(|s| s.to_string());
                    self.terminal_ap_keys(v, term, class, akey.as_deref(), pkey.as_deref(), sd_m, hier)?;
                }
                Some('l') => match digit {
                    None | Some(0) => {
                        write!(self.out, " {}=", p.key)?;
                        self.length_value(l as f64, scale, p.scale)?;
                    }
                    Some(d) => {
                        // l<n> names a terminal length passed through the
                        // device's own parameter list.
                        let want = format!("l{d}=");
                        if let Some(dp) = dev.params.iter().find(|s| s.starts_with(&want)) {
                            if let Ok(val) = dp[want.len()..].parse::<f64>() {
                                write!(self.out, " {}=", p.key)?;
                                self.length_value(val, scale, p.scale)?;
                            }
                        }
                    }
                },
                Some('w') => {
                    write!(self.out, " {}=", p.key)?;
                    self.length_value(w as f64, scale, p.scale)?;
                }
                Some('s') => {
                    write!(self.out, " {}=", p.key)?;
                    if let Some(sub) = dev.subs {
                        self.substrate(v, sub, dev.ty)?;
                    }
                }
                Some('x') => {
                    write!(self.out, " {}=", p.key)?;
                    self.length_value(dev.rect.left() as f64, scale, p.scale)?;
                }
                Some('y') => {
                    write!(self.out, " {}=", p.key)?;
                    self.length_value(dev.rect.bot() as f64, scale, p.scale)?;
                }
                Some('r') => {
                    write!(self.out, " {}={:.6}", p.key, dev.res)?;
                }
                Some('c') => {
                    write!(self.out, " {}={:.6}f", p.key, dev.cap)?;
                }
                _ => {
                    // Unknown templates are emitted verbatim.
                    if p.template.is_empty() {
                        write!(self.out, " {}", p.key)?;
                    } else {
                        write!(self.out, " {}={}", p.key, p.template)?;
                    }
                }
            }
            i += 1;
        }

        for p in &dev.params {
            write!(self.out, " {p}")?;
        }
        Ok(())
    }

    /// A linear quantity: raw under a scale card, SI-scaled otherwise.
    fn length_value(&mut self, val: f64, scale: f64, pscale: f64) -> Result<(), NetlistError> {
        match self.es_scale {
            None => write!(self.out, "{}", g_format(val * scale, 6))?,
            Some(es) if pscale != 1.0 => {
                write!(self.out, "{}", g_format(val * scale * es * pscale * 1.0e-6, 6))?
            }
            Some(es) => write!(self.out, "{}", si_value(1.0e-6 * val * scale * es))?,
        }
        Ok(())
    }

    /// An area quantity; scales quadratically.
    fn area_value(&mut self, val: f64, scale: f64, pscale: f64) -> Result<(), NetlistError> {
        match self.es_scale {
            None => write!(self.out, "{}", g_format(val * scale * scale, 6))?,
            Some(es) if pscale != 1.0 => write!(
                self.out,
                "{}",
                g_format(val * scale * scale * es * es * pscale * 1.0e-12, 6)
            )?,
            Some(es) => write!(
                self.out,
                "{}",
                si_value(1.0e-12 * val * scale * scale * es * es)
            )?,
        }
        Ok(())
    }

    fn terminal_ap(
        &mut self,
        v: &DevVisit,
        term: usize,
        class: Option<usize>,
        akey: &str,
        pkey: &str,
        m: f64,
        hier: bool,
    ) -> Result<(), NetlistError> {
        self.terminal_ap_keys(v, term, class, Some(akey), Some(pkey), m, hier)
    }

    /// Area/perimeter for one device terminal.
    ///
    /// Cached values in the terminal's attribute string win over the node's
    /// accumulated totals; totals are printed once per (node, class) and as
    /// zero afterwards, so shared junctions are not double-counted.  In
    /// hierarchical mode the local (per-def) node values are used and the
    /// visited marks reset whenever the instance prefix changes.
    #[allow(clippy::too_many_arguments)]
    fn terminal_ap_keys(
        &mut self,
        v: &DevVisit,
        term: usize,
        class: Option<usize>,
        akey: Option<&str>,
        pkey: Option<&str>,
        m: f64,
        hier: bool,
    ) -> Result<(), NetlistError> {
        let dev = v.dev;
        let cached = dev
            .terms[term]
            .attrs
            .as_deref()
            .and_then(term_cached_ap);

        if hier {
            let local = dev.terms[term].node;
            if self.st.ap_prefix.get(&local).copied().flatten() != v.prefix {
                self.st.ap_visited.remove(&local);
                self.st.ap_prefix.insert(local, v.prefix);
            }
            let node = self.sess.def(v.def).nodes.node(local);
            let (area, perim, live) = match cached {
                Some((a, p)) => (a, p, true),
                None => match class {
                    Some(c) => {
                        let seen = self.st.mark_ap_visited(local, c);
                        let pa = node.pa.get(c).copied().unwrap_or_default();
                        (pa.area, pa.perim, !seen)
                    }
                    None => (0, 0, false),
                },
            };
            let scale = if live { v.scale } else { 0.0 };
            self.emit_ap(akey, pkey, area as f64, perim as f64, scale, m)?;
            return Ok(());
        }

        let flat_node = self.term_flat_node(v, term);
        self.node_ap_inner(flat_node, cached, class, v.scale, akey, pkey, m)
    }

    fn node_ap(
        &mut self,
        node: Option<NodeId>,
        cached: Option<(i64, i64)>,
        class: Option<usize>,
        scale: f64,
        akey: &str,
        pkey: &str,
        m: f64,
    ) -> Result<(), NetlistError> {
        self.node_ap_inner(node, cached, class, scale, Some(akey), Some(pkey), m)
    }

    #[allow(clippy::too_many_arguments)]
    fn node_ap_inner(
        &mut self,
        node: Option<NodeId>,
        cached: Option<(i64, i64)>,
        class: Option<usize>,
        scale: f64,
        akey: Option<&str>,
        pkey: Option<&str>,
        m: f64,
    ) -> Result<(), NetlistError> {
        let (area, perim, live) = match cached {
            Some((a, p)) => (a, p, true),
            None => match (node, class) {
                (Some(n), Some(c)) => {
                    let seen = self.st.mark_ap_visited(n, c);
                    let pa = self.flat.nodes.node(n).pa.get(c).copied().unwrap_or_default();
                    (pa.area, pa.perim, !seen)
                }
                _ => (0, 0, false),
            },
        };
        let scale = if live { scale } else { 0.0 };
        self.emit_ap(akey, pkey, area as f64, perim as f64, scale, m)
    }

    fn emit_ap(
        &mut self,
        akey: Option<&str>,
        pkey: Option<&str>,
        area: f64,
        perim: f64,
        scale: f64,
        m: f64,
    ) -> Result<(), NetlistError> {
        match self.es_scale {
            None => {
                if let Some(akey) = akey {
                    write!(
                        self.out,
                        " {akey}={}",
                        si_value(1.0e-12 * area * scale * scale / m)
                    )?;
                }
                if let Some(pkey) = pkey {
                    write!(self.out, " {pkey}={}", si_value(1.0e-6 * perim * scale / m))?;
                }
            }
            Some(es) => {
                if let Some(akey) = akey {
                    write!(
                        self.out,
                        " {akey}={}",
                        si_value(1.0e-12 * area * scale * scale * es * es)
                    )?;
                }
                if let Some(pkey) = pkey {
                    write!(
                        self.out,
                        " {pkey}={}",
                        si_value(1.0e-6 * perim * scale * es)
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Writes a device's substrate terminal.  The default substrate for the
    /// device type prints by name without a node lookup; anything else is
    /// resolved through the flat table.
    fn substrate(&mut self, v: &DevVisit, sub: NodeId, ty: usize) -> Result<(), NetlistError> {
        let hier = self.sess.def(v.def).nodes.canonical_hier(sub);
        let suffix = self.sess.pool.path_string(hier);
        let info = self.dev_info(ty);
        if let Some(default) = &info.default_subs {
            if suffix.eq_ignore_ascii_case(default) {
                let formatted = self.sess.pool.render(hier, self.opts.out_flags());
                write!(self.out, "{formatted}")?;
                return Ok(());
            }
        }
        match self.flat.resolve(self.sess, v.prefix, hier) {
            Some(node) => {
                let name = self.node_name(node)?;
                write!(self.out, "{name}")?;
                self.st.connected.insert(node);
            }
            None => {
                write!(self.out, "errGnd!")?;
            }
        }
        Ok(())
    }

    /// One coupling capacitor line.
    fn cap_visit(&mut self, n1: NodeId, n2: NodeId, cap_af: f64) -> Result<(), NetlistError> {
        let cap = cap_af / 1000.0;
        if cap <= self.opts.cap_threshold {
            return Ok(());
        }
        let name1 = self.node_name(n1)?;
        let name2 = self.node_name(n2)?;
        writeln!(
            self.out,
            "C{} {} {} {}",
            self.st.cap_num,
            name1,
            name2,
            si_value(1.0e-15 * cap)
        )?;
        self.st.cap_num += 1;
        Ok(())
    }

    /// One explicit resistor line.
    fn resist_visit(&mut self, n1: NodeId, n2: NodeId, res_mohm: f64) -> Result<(), NetlistError> {
        let name1 = self.node_name(n1)?;
        let name2 = self.node_name(n2)?;
        writeln!(
            self.out,
            "R{} {} {} {}",
            self.st.res_num,
            name1,
            name2,
            g_format(res_mohm / 1000.0, 6)
        )?;
        self.st.res_num += 1;
        self.st.connected.insert(n1);
        self.st.connected.insert(n2);
        Ok(())
    }

    /// The node to which lumped capacitances connect: the substrate node
    /// when one was declared, `0` otherwise.
    fn substrate_name(&mut self) -> Result<String, NetlistError> {
        if !self.sess.compat {
            let mut found = None;
            let _ = visit_nodes::<(), _>(self.sess, self.flat, |sess, nv| {
                if found.is_none() {
                    let n = self.flat.nodes.node(nv.node);
                    if n.flags.contains(NodeFlags::SUBS_NODE)
                        && sess.pool.is_global(self.flat.nodes.canonical_hier(nv.node))
                    {
                        found = Some(nv.node);
                    }
                }
                Ok(())
            });
            if let Some(node) = found {
                return self.node_name(node);
            }
        }
        Ok("0".to_string())
    }

    /// Lumped capacitance and attribute comments for one node.
    fn node_visit(&mut self, node: NodeId, cap_af: f64) -> Result<(), NetlistError> {
        let is_connected = self.st.connected.contains(&node)
            || self
                .flat
                .nodes
                .node(node)
                .flags
                .contains(NodeFlags::PORT);
        let name = self.node_name(node)?;

        // SPICE2 numbers and HSPICE fallback names get a comment tying
        // them back to the real hierarchical name.
        if self.opts.format == SpiceFormat::Spice2
            || (self.opts.format == SpiceFormat::Hspice && name.starts_with("z@"))
        {
            let full = self
                .sess
                .pool
                .render(self.flat.nodes.canonical_hier(node), self.opts.out_flags());
            writeln!(self.out, "** {full} == {name}")?;
        }

        let cap = cap_af / 1000.0;
        if cap > self.opts.cap_threshold {
            write!(
                self.out,
                "C{} {} {} {}",
                self.st.cap_num,
                name,
                self.cap_node,
                si_value(1.0e-15 * cap)
            )?;
            self.st.cap_num += 1;
            if !is_connected {
                if self.opts.format == SpiceFormat::Ngspice {
                    write!(self.out, " $")?;
                }
                write!(self.out, " **FLOATING")?;
            }
            writeln!(self.out)?;
        }

        let attrs = &self.flat.nodes.node(node).attrs;
        if !attrs.is_empty() && !self.opts.no_attrs {
            if self.opts.format == SpiceFormat::Ngspice {
                write!(self.out, " $ ")?;
            }
            let joined = attrs.iter().map(|a| a.text.as_str()).join(",");
            writeln!(self.out, "**nodeattr {name} : {joined}")?;
        }
        Ok(())
    }

    /// The port list of a def, ordered by port index.
    ///
    /// Explicit indices come from the `.ext` file; port nodes without any
    /// indexed name are given the next free indices, in name table order.
    /// For black-box abstract defs, implicit ports are left unindexed.
    fn port_list(&self, def: DefId) -> Vec<Option<NameId>> {
        let d = self.sess.def(def);
        let mut by_index: Vec<(usize, NameId)> = Vec::new();
        let mut max = None::<usize>;
        for (_, nn) in d.nodes.bindings() {
            let name = d.nodes.name(nn);
            let node = d.nodes.node(name.node());
            if !node.flags.contains(NodeFlags::PORT) {
                continue;
            }
            if let Some(p) = name.port {
                by_index.push((p, nn));
                max = Some(max.map_or(p, |m| m.max(p)));
            }
        }

        let assign_implicit = !(self.opts.blackbox
            && d.flags.contains(extflat::DefFlags::ABSTRACT));
        if assign_implicit {
            let mut seen_nodes: HashSet<NodeId> =
                by_index.iter().map(|&(_, nn)| d.nodes.name(nn).node()).collect();
            for (_, nn) in d.nodes.bindings() {
                let node = d.nodes.name(nn).node();
                if !d.nodes.node(node).flags.contains(NodeFlags::PORT) {
                    continue;
                }
                if seen_nodes.contains(&node) {
                    continue;
                }
                if d.nodes.chain(node).any(|n| d.nodes.name(n).port.is_some()) {
                    continue;
                }
                let idx = max.map_or(0, |m| m + 1);
                max = Some(idx);
                by_index.push((idx, nn));
                seen_nodes.insert(node);
            }
        }

        let Some(max) = max else { return Vec::new() };
        let mut out: Vec<Option<NameId>> = vec![None; max + 1];
        for (idx, nn) in by_index {
            match out[idx] {
                None => out[idx] = Some(nn),
                Some(cur) => {
                    // Several names may claim the same index; the best one
                    // under the precedence order wins, deterministically.
                    let d = self.sess.def(def);
                    if self
                        .sess
                        .pool
                        .best(d.nodes.name(nn).hier, d.nodes.name(cur).hier)
                    {
                        out[idx] = Some(nn);
                    }
                }
            }
        }
        out
    }

    /// A subcircuit model name; SPICE requires it to begin with a letter.
    fn subckt_model_name(&self, def: DefId) -> String {
        let name = self.sess.def(def).name.to_string();
        if name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            name
        } else {
            format!("x{name}")
        }
    }

    /// Emits the `.subckt` definition line for a def, with ports in index
    /// order.
    ///
    /// With `stub` set (black-box views), port names print verbatim rather
    /// than through the flat table, since artifacts of an abstract view may
    /// merge nodes and lose names.
    fn top_visit(&mut self, def: DefId, stub: bool) -> Result<(), NetlistError> {
        let model = self.subckt_model_name(def);
        write!(self.out, ".subckt {model}")?;
        let mut tchars = 8 + model.len();

        let ports = self.port_list(def);
        let mut printed: HashMap<String, usize> = HashMap::new();
        let mut separators: Vec<(String, String)> = Vec::new();

        for (idx, slot) in ports.iter().enumerate() {
            let Some(nn) = slot else { continue };
            let d = self.sess.def(def);
            let hier = d.nodes.name(*nn).hier;
            let use_own_name =
                stub || self.sess.def(def).flags.contains(extflat::DefFlags::ABSTRACT);
            let pname = if use_own_name {
                self.sess.pool.render(hier, self.opts.out_flags())
            } else {
                match self.flat.resolve(self.sess, None, hier) {
                    Some(node) => self.node_name(node)?,
                    None => {
                        tracing::warn!(
                            "port {} was optimized out of {}",
                            self.sess.pool.path_string(hier),
                            self.sess.def(def).name
                        );
                        self.st.issues.record(ErrorKind::PortOptimizedOut);
                        continue;
                    }
                }
            };
            match printed.get(&pname) {
                Some(_) if self.opts.short == ShortMode::None => continue,
                Some(_) => {
                    // Shorted ports keep their own names, separated by a
                    // zero-valued element.
                    let own = self.sess.pool.render(hier, self.opts.out_flags());
                    if own == pname || printed.contains_key(&own) {
                        continue;
                    }
                    separators.push((own.clone(), pname.clone()));
                    printed.insert(own.clone(), idx);
                    if tchars > 80 {
                        write!(self.out, "\n+")?;
                        tchars = 1;
                    }
                    write!(self.out, " {own}")?;
                    tchars += own.len() + 1;
                }
                None => {
                    printed.insert(pname.clone(), idx);
                    if tchars > 80 {
                        write!(self.out, "\n+")?;
                        tchars = 1;
                    }
                    write!(self.out, " {pname}")?;
                    tchars += pname.len() + 1;
                }
            }
        }

        // Parameters declared for the cell itself.
        let key = format!(":{}", self.sess.def(def).name);
        for p in self.sess.device_params(&key) {
            if tchars > 80 {
                write!(self.out, "\n+")?;
                tchars = 1;
            }
            write!(self.out, " {}", p.key)?;
            tchars += p.key.len() + 1;
        }
        writeln!(self.out)?;

        for (a, b) in &separators {
            match self.opts.short {
                ShortMode::Resistor => {
                    writeln!(self.out, "R{} {a} {b} 0", self.st.res_num)?;
                    self.st.res_num += 1;
                }
                ShortMode::Voltage => {
                    writeln!(self.out, "V{} {a} {b} 0.0", self.st.volt_num)?;
                    self.st.volt_num += 1;
                }
                ShortMode::None => {}
            }
        }
        Ok(())
    }

    /// Emits one subcircuit call.
    fn subckt_call(&mut self, def: DefId, prefix: Option<HierId>) -> Result<(), NetlistError> {
        // Instance naming keeps the full hierarchical id unless renumbering
        // was requested (SPICE2 always renumbers).
        let mut tchars;
        if self.opts.renumber || self.opts.format == SpiceFormat::Spice2 || prefix.is_none() {
            write!(self.out, "X{}", self.st.sbck_num)?;
            self.st.sbck_num += 1;
            tchars = 5;
        } else {
            let flags = OutputFlags::COMMA_TO_BAR;
            let name = self.sess.pool.render(prefix.unwrap(), flags);
            write!(self.out, "X{name}")?;
            tchars = 1 + name.len();
        }

        let ports = self.port_list(def);
        if ports.is_empty() {
            // No declared order: every port name prints as encountered.
            let d = self.sess.def(def);
            let names: Vec<HierId> = d
                .nodes
                .bindings()
                .filter(|&(_, nn)| {
                    let name = d.nodes.name(nn);
                    d.nodes.node(name.node()).flags.contains(NodeFlags::PORT)
                })
                .map(|(h, _)| h)
                .collect();
            for hier in names {
                if tchars > 80 {
                    write!(self.out, "\n+")?;
                    tchars = 1;
                }
                tchars += self.out_node(prefix, hier)?;
            }
        } else {
            let slots: Vec<HierId> = ports
                .iter()
                .flatten()
                .map(|&nn| self.sess.def(def).nodes.name(nn).hier)
                .collect();
            for hier in slots {
                if tchars > 80 {
                    write!(self.out, "\n+")?;
                    tchars = 1;
                }
                tchars += self.out_node(prefix, hier)?;
            }
        }

        if tchars > 80 {
            write!(self.out, "\n+")?;
        }
        write!(self.out, " {}", self.subckt_model_name(def))?;

        let key = format!(":{}", self.sess.def(def).name);
        for p in self.sess.device_params(&key) {
            write!(self.out, " {}", p.key)?;
        }
        writeln!(self.out)?;
        Ok(())
    }
}

/// Classifies a parameter template: a known type letter plus an optional
/// terminal digit, or nothing for verbatim templates.
fn template_kind(template: &str) -> (Option<char>, Option<u8>) {
    let mut chars = template.chars();
    let Some(c) = chars.next() else {
        return (None, None);
    };
    let c = c.to_ascii_lowercase();
    if !matches!(c, 'a' | 'p' | 'l' | 'w' | 's' | 'x' | 'y' | 'r' | 'c') {
        return (None, None);
    }
    match chars.next() {
        None => (Some(c), None),
        Some(d) if d.is_ascii_digit() && chars.next().is_none() => {
            (Some(c), Some(d as u8 - b'0'))
        }
        _ => (None, None),
    }
}
