//! Devices, their terminals, and parallel-device merging.

use arcstr::ArcStr;

use crate::flat::Flat;
use crate::geom::Rect;
use crate::issues::{ErrorKind, Issues};
use crate::node::NodeId;
use crate::visit;
use crate::{HierId, Session};

/// Device classes, as declared by `device` records (plus the legacy `fet`
/// form).
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum DevClass {
    /// Legacy `fet` record; L and W are recovered from area and perimeter.
    Fet,
    /// MOSFET with explicit L and W.
    Mosfet,
    /// MOSFET whose source and drain must never be swapped.
    Asymmetric,
    /// Bipolar transistor.
    Bjt,
    /// Diode.
    Diode,
    /// Diode emitted cathode-first.
    NDiode,
    /// Diode emitted anode-first.
    PDiode,
    /// Resistor.
    Res,
    /// Capacitor.
    Cap,
    /// Capacitor emitted bottom-first.
    CapRev,
    /// Zero-volt source used only to separate shorted ports.
    Volt,
    /// Subcircuit call.
    Subckt,
    /// Subcircuit with MOS-like pin order (drain first).
    MSubckt,
    /// Subcircuit whose gate terminal is an identifier only.
    RSubckt,
    /// Capacitor-like subcircuit.
    CSubckt,
}

impl DevClass {
    /// Parses the class keyword of a `device` record.
    pub fn from_keyword(kw: &str) -> Option<Self> {
        Some(match kw {
            "fet" => DevClass::Fet,
            "mosfet" => DevClass::Mosfet,
            "asymmetric" => DevClass::Asymmetric,
            "bjt" => DevClass::Bjt,
            "diode" => DevClass::Diode,
            "ndiode" => DevClass::NDiode,
            "pdiode" => DevClass::PDiode,
            "res" | "resistor" => DevClass::Res,
            "cap" | "capacitor" => DevClass::Cap,
            "caprev" => DevClass::CapRev,
            "volt" => DevClass::Volt,
            "subckt" => DevClass::Subckt,
            "msubckt" => DevClass::MSubckt,
            "rsubckt" => DevClass::RSubckt,
            "csubckt" => DevClass::CSubckt,
            _ => return None,
        })
    }

    /// Whether this class has a MOS-like channel (gate/source/drain).
    pub fn is_fet_like(self) -> bool {
        matches!(
            self,
            DevClass::Fet | DevClass::Mosfet | DevClass::Asymmetric
        )
    }

    /// Whether this class is emitted as a subcircuit call.
    pub fn is_subckt(self) -> bool {
        matches!(
            self,
            DevClass::Subckt | DevClass::MSubckt | DevClass::RSubckt | DevClass::CSubckt
        )
    }
}

/// One device terminal.
#[derive(Clone, Debug)]
pub struct DevTerm {
    /// The local node the terminal connects to.
    pub node: NodeId,
    /// Length of the terminal's connection to the gate; for FETs this is
    /// half the channel-edge length.
    pub len: i64,
    /// Comma-separated attribute string, if any.
    pub attrs: Option<ArcStr>,
}

/// A device.
#[derive(Clone, Debug)]
pub struct Dev {
    /// Device class.
    pub class: DevClass,
    /// Index into the session's device-type table.
    pub ty: usize,
    /// Substrate node, when one applies.
    pub subs: Option<NodeId>,
    /// A 1x1 rectangle inside the device.
    pub rect: Rect,
    /// Capacitance for capacitor-like classes, in femtofarads.
    pub cap: f64,
    /// Resistance for resistor-like classes, in ohms.
    pub res: f64,
    /// Channel area (legacy `fet` records).
    pub area: i64,
    /// Channel perimeter (legacy `fet` records).
    pub perim: i64,
    /// Channel length.
    pub length: i64,
    /// Channel width.
    pub width: i64,
    /// Verbatim `key=value` parameters to pass through to the netlist.
    pub params: Vec<ArcStr>,
    /// Terminals, gate first.
    pub terms: Vec<DevTerm>,
}

/// A parameter template installed by a `parameters` record.
///
/// `key` is the netlist parameter name; `template` names the quantity it is
/// filled from, as a type letter (`a p l w s x y r c`) with an optional
/// terminal digit; unrecognized templates are emitted verbatim.  `scale`
/// multiplies the value.
#[derive(Clone, Debug, PartialEq)]
pub struct DevParam {
    /// Netlist parameter name.
    pub key: ArcStr,
    /// Value template.
    pub template: ArcStr,
    /// Scale factor from a `*<mult>` suffix, 1.0 if absent.
    pub scale: f64,
}

impl Dev {
    /// The channel length and width for output.
    ///
    /// `device` records carry both explicitly.  The legacy `fet` record
    /// infers them: a two-terminal fet solves `2L^2 - P*L + 2A = 0` and
    /// takes the larger root as L, which is wrong for L-shaped channels but
    /// is kept for compatibility with existing netlists; with three or more
    /// terminals L is half the gate edge and W averages the source and
    /// drain edges.  A gate attribute `ext:l=`/`ext:w=` overrides either.
    pub fn length_width(&self) -> (i64, i64) {
        let (mut l, mut w) = match self.class {
            DevClass::Fet => {
                if self.terms.len() == 2 {
                    let perim = self.perim as f64;
                    let disc = (perim * perim - 16.0 * self.area as f64).max(0.0);
                    // The larger root is not always the length for L-shaped
                    // channels; existing netlists depend on this choice.
                    let l = ((self.perim + disc.sqrt() as i64) >> 2).max(1);
                    (l, self.area / l)
                } else if self.terms.len() >= 3 {
                    let gate = &self.terms[0];
                    let source = &self.terms[1];
                    let drain = &self.terms[2];
                    (gate.len / 2, (source.len + drain.len) / 2)
                } else {
                    (0, 0)
                }
            }
            _ => (self.length, self.width),
        };

        if self.class == DevClass::Fet {
            if let Some(attrs) = self.terms.first().and_then(|t| t.attrs.as_ref()) {
                for field in attrs.split(',') {
                    if let Some(v) = field.strip_prefix("ext:l=").or(field.strip_prefix("ext:L="))
                    {
                        if let Ok(v) = v.parse() {
                            l = v;
                        }
                    } else if let Some(v) =
                        field.strip_prefix("ext:w=").or(field.strip_prefix("ext:W="))
                    {
                        if let Ok(v) = v.parse() {
                            w = v;
                        }
                    }
                }
            }
        }

        (l, w)
    }
}

/// Case-insensitive test for an `ext:` attribute within a comma-separated
/// attribute list.
pub fn attrs_contain(attrs: &str, what: &str) -> bool {
    attrs
        .split(',')
        .any(|f| f.eq_ignore_ascii_case(what))
}

/// Extracts a cached `(area, perimeter)` pair from a terminal attribute
/// string.
///
/// Newer extractors append the terminal's own area and perimeter as the
/// last two values of the comma-separated list; these take precedence over
/// the node's accumulated totals.
pub fn term_cached_ap(attrs: &str) -> Option<(i64, i64)> {
    let fields: Vec<&str> = attrs.split(',').collect();
    for i in 0..fields.len().saturating_sub(1) {
        if let (Ok(area), Ok(perim)) = (fields[i].parse(), fields[i + 1].parse()) {
            return Some((area, perim));
        }
    }
    None
}

/// Whether a terminal asks for hierarchical (per-parent) area/perimeter
/// accounting, given the session-wide default.
pub fn term_wants_hier_ap(term: &DevTerm, default: bool) -> bool {
    match term.attrs.as_deref() {
        Some(attrs) if attrs_contain(attrs, "ext:aph") => true,
        Some(attrs) if attrs_contain(attrs, "ext:apf") => false,
        _ => default,
    }
}

/// Parallel-device merging policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Every device is emitted individually.
    #[default]
    None,
    /// Merge devices matching in class, type, substrate, terminals, L, and
    /// W.
    Conservative,
    /// As conservative, but W may differ; the multiplier accumulates
    /// fractional width contributions.
    Aggressive,
}

/// The multiplier table produced by a merge pass.
///
/// Indexed by the position of each device in the deterministic visit order;
/// a merged-away device holds a negative multiplier and is skipped at emit
/// time.
#[derive(Clone, Debug, Default)]
pub struct DevMultipliers {
    mult: Vec<f64>,
    /// Number of devices merged away.
    pub merged: usize,
}

const DEV_KILLED: f64 = -1.0;

impl DevMultipliers {
    /// Whether the device at visit index `i` was merged into another.
    pub fn is_killed(&self, i: usize) -> bool {
        self.mult.get(i).copied().unwrap_or(1.0) <= 0.0
    }

    /// The multiplier for the device at visit index `i`.
    pub fn multiplier(&self, i: usize) -> f64 {
        self.mult.get(i).copied().unwrap_or(1.0)
    }
}

#[derive(Debug)]
enum Parallel {
    No,
    Same,
    /// Matched with source and drain exchanged.
    Swapped,
}

struct MergeCand {
    class: DevClass,
    ty: usize,
    l: f64,
    w: f64,
    cap: f64,
    has_model: bool,
    g: Option<NodeId>,
    s: Option<NodeId>,
    d: Option<NodeId>,
    b: Option<NodeId>,
    hier_s: bool,
    hier_d: bool,
    prefix: Option<HierId>,
    index: usize,
}

fn parallel_devs(a: &MergeCand, b: &MergeCand, aggressive: bool) -> Parallel {
    if a.class != b.class || a.ty != b.ty {
        return Parallel::No;
    }
    match a.class {
        DevClass::Mosfet | DevClass::Fet | DevClass::MSubckt => {
            if a.b != b.b {
                return Parallel::No;
            }
            if a.g == b.g && a.l == b.l && (aggressive || a.w == b.w) {
                if a.d == b.d && a.s == b.s {
                    return Parallel::Same;
                }
                if a.s == b.d && a.d == b.s {
                    return Parallel::Swapped;
                }
            }
            Parallel::No
        }
        DevClass::Asymmetric => {
            if a.b == b.b
                && a.g == b.g
                && a.d == b.d
                && a.s == b.s
                && a.l == b.l
                && (aggressive || a.w == b.w)
            {
                Parallel::Same
            } else {
                Parallel::No
            }
        }
        // Capacitor top and bottom are never swapped; there is no way to
        // know when that is electrically safe.
        DevClass::Cap | DevClass::CapRev => {
            if a.g != b.g || a.s != b.s {
                Parallel::No
            } else if !a.has_model {
                if aggressive || a.cap == b.cap {
                    Parallel::Same
                } else {
                    Parallel::No
                }
            } else if aggressive || (a.l == b.l && a.w == b.w) {
                Parallel::Same
            } else {
                Parallel::No
            }
        }
        // Resistors accumulate capacitance on their center node, and the
        // remaining classes have no length/width model to merge under.
        _ => Parallel::No,
    }
}

/// Runs the parallel-merge pass over the flattened circuit, producing the
/// multiplier table consulted by the emitters.
///
/// `hier_ap_default` is the session-wide default for hierarchical
/// source/drain area-perimeter accounting; a device terminal's `ext:aph` /
/// `ext:apf` attributes override it.  Devices whose terminals disagree on
/// that accounting merge under protest: a `ParallelMergeConflict` warning is
/// recorded and the more specific (hierarchical) attribute wins.
pub fn merge_parallel(
    sess: &Session,
    flat: &Flat,
    mode: MergeMode,
    hier_ap_default: bool,
) -> (DevMultipliers, Issues) {
    merge_inner(sess, flat, mode, hier_ap_default, false)
}

/// As [`merge_parallel`], but over the root def's own devices only, for
/// use with a one-level flatten during hierarchical output.
pub fn merge_parallel_local(
    sess: &Session,
    flat: &Flat,
    mode: MergeMode,
    hier_ap_default: bool,
) -> (DevMultipliers, Issues) {
    merge_inner(sess, flat, mode, hier_ap_default, true)
}

fn merge_inner(
    sess: &Session,
    flat: &Flat,
    mode: MergeMode,
    hier_ap_default: bool,
    local: bool,
) -> (DevMultipliers, Issues) {
    let mut table = DevMultipliers::default();
    let mut issues = Issues::new();
    if mode == MergeMode::None {
        return (table, issues);
    }
    let aggressive = mode == MergeMode::Aggressive;
    let mut cands: Vec<MergeCand> = Vec::new();

    let mut handler = |sess: &Session, v: &visit::DevVisit| -> Result<(), ()> {
        let index = table.mult.len();
        table.mult.push(1.0);
        let dev = v.dev;
        if dev.terms.len() < 2 {
            return Ok(());
        }

        let def = sess.def(v.def);
        let drain_idx = dev.terms.len().min(3) - 1;
        let g_h = def.nodes.canonical_hier(dev.terms[0].node);
        let s_h = def.nodes.canonical_hier(dev.terms[1].node);
        let d_h = def.nodes.canonical_hier(dev.terms[drain_idx].node);
        let b_h = dev.subs.map(|n| def.nodes.canonical_hier(n));
        let (l, w) = dev.length_width();
        let cand = MergeCand {
            class: dev.class,
            ty: dev.ty,
            l: l as f64 * v.scale,
            w: w as f64 * v.scale,
            cap: dev.cap,
            has_model: sess.dev_types[dev.ty] != "None",
            g: flat.resolve(sess, v.prefix, g_h),
            s: flat.resolve(sess, v.prefix, s_h),
            d: flat.resolve(sess, v.prefix, d_h),
            b: b_h.and_then(|h| flat.resolve(sess, v.prefix, h)),
            hier_s: term_wants_hier_ap(&dev.terms[1], hier_ap_default),
            hier_d: term_wants_hier_ap(&dev.terms[drain_idx], hier_ap_default),
            prefix: v.prefix,
            index,
        };
        if cand.g.is_none() || cand.s.is_none() || cand.d.is_none() {
            return Ok(());
        }

        for prev in &cands {
            let pmode = parallel_devs(&cand, prev, aggressive);
            if matches!(pmode, Parallel::No) {
                continue;
            }
            let (prev_s, prev_d) = match pmode {
                Parallel::Swapped => (prev.hier_d, prev.hier_s),
                _ => (prev.hier_s, prev.hier_d),
            };
            if prev.prefix != cand.prefix
                && (prev_s != cand.hier_s || prev_d != cand.hier_d)
            {
                tracing::warn!(
                    class = ?cand.class,
                    "conflicting source/drain area-perimeter attributes on parallel devices"
                );
                issues.record(ErrorKind::ParallelMergeConflict);
            }

            let mut m = table.mult[prev.index] + table.mult[cand.index];
            match cand.class {
                DevClass::Mosfet
                | DevClass::Fet
                | DevClass::Asymmetric
                | DevClass::MSubckt => {
                    if prev.w > 0.0 {
                        m = table.mult[prev.index] + cand.w / prev.w;
                    }
                }
                DevClass::Cap | DevClass::CapRev | DevClass::CSubckt => {
                    if !cand.has_model {
                        if prev.cap > 0.0 {
                            m = table.mult[prev.index] + cand.cap / prev.cap;
                        }
                    } else if prev.l > 0.0 && prev.w > 0.0 {
                        m = table.mult[prev.index] + (cand.l * cand.w) / (prev.l * prev.w);
                    }
                }
                _ => {}
            }
            table.mult[prev.index] = m;
            table.mult[cand.index] = DEV_KILLED;
            table.merged += 1;
            return Ok(());
        }

        cands.push(cand);
        Ok(())
    };

    let _ = if local {
        visit::visit_devs_local(sess, flat, &mut handler)
    } else {
        visit::visit_devs(sess, flat, &mut handler)
    };

    (table, issues)
}
