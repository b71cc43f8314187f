//! Cell definitions and instantiations.
//!
//! A [`Def`] holds everything read from one `.ext` file: its local node
//! table, child uses, forced connections, parasitics, devices, kills, and
//! distance records.  Defs are owned by the [`Session`](crate::Session)
//! registry and referred to by [`DefId`] handles.

use arcstr::ArcStr;
use indexmap::IndexMap;

use crate::dev::Dev;
use crate::geom::Transform;
use crate::hiername::{HierId, HierPool};
use crate::node::{NodeTable, PerimArea};

/// An opaque handle to a cell definition in a session.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct DefId(pub(crate) u32);

/// Def state flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefFlags(u16);

impl DefFlags {
    /// The `.ext` file for this def has been read.
    pub const AVAILABLE: DefFlags = DefFlags(0x01);
    /// The def declares subcircuit ports.
    pub const SUBCIRCUIT: DefFlags = DefFlags(0x02);
    /// Already handled during hierarchical output.
    pub const PROCESSED: DefFlags = DefFlags(0x04);
    /// The def contains no devices anywhere below it.
    pub const NODEVICES: DefFlags = DefFlags(0x08);
    /// The def contains implicit substrate nodes.
    pub const SUBSNODES: DefFlags = DefFlags(0x10);
    /// The def is an abstract (black-box) view.
    pub const ABSTRACT: DefFlags = DefFlags(0x20);
    /// The def is primitive and is never emitted.
    pub const PRIMITIVE: DefFlags = DefFlags(0x40);

    /// The empty flag set.
    pub const fn empty() -> Self {
        DefFlags(0)
    }

    /// Whether all flags in `other` are set.
    pub const fn contains(self, other: DefFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets all flags in `other`.
    pub fn insert(&mut self, other: DefFlags) {
        self.0 |= other.0;
    }

    /// Clears all flags in `other`.
    pub fn remove(&mut self, other: DefFlags) {
        self.0 &= !other.0;
    }
}

/// Array bounds and element separation for an arrayed use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArrayInfo {
    /// Low x subscript.
    pub xlo: i32,
    /// High x subscript.
    pub xhi: i32,
    /// x separation between elements.
    pub xsep: i32,
    /// Low y subscript.
    pub ylo: i32,
    /// High y subscript.
    pub yhi: i32,
    /// y separation between elements.
    pub ysep: i32,
}

impl ArrayInfo {
    /// Whether this use is an array at all.
    pub fn is_array(&self) -> bool {
        self.xlo != self.xhi || self.ylo != self.yhi
    }
}

/// One instantiation of a child def.
#[derive(Clone, Debug)]
pub struct Use {
    /// Use identifier; appears as a component of hierarchical paths.
    pub id: ArcStr,
    /// The instantiated def.
    pub child: DefId,
    /// Transform from child to parent coordinates.
    pub trans: Transform,
    /// Array subscripts; lo == hi in both dimensions for a simple use.
    pub array: ArrayInfo,
}

impl Use {
    /// The hierarchical path component for element `(x, y)`.
    pub fn element_id(&self, x: i32, y: i32) -> String {
        let a = &self.array;
        match (a.xlo != a.xhi, a.ylo != a.yhi) {
            (false, false) => self.id.to_string(),
            (true, false) => format!("{}[{}]", self.id, x),
            (false, true) => format!("{}[{}]", self.id, y),
            (true, true) => format!("{}[{},{}]", self.id, x, y),
        }
    }
}

/// An inclusive subscript range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range {
    /// Low bound.
    pub lo: i32,
    /// High bound.
    pub hi: i32,
}

/// One side of a connection: a name template plus up to two subscript
/// ranges.
///
/// `x[1:3]/n` is stored as prefix `x`, suffix `/n`, and one range; expansion
/// substitutes concrete subscripts back into the bracket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnName {
    prefix: String,
    suffix: String,
    /// Subscript ranges; empty for a scalar name.
    pub subs: Vec<Range>,
}

/// Malformed subscript syntax in a connection name.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnNameError {
    /// More than two subscript ranges.
    #[error("too many array subscripts (maximum 2)")]
    TooManySubscripts,
    /// Unparseable range.
    #[error("subscript syntax error")]
    Syntax,
    /// `lo > hi`.
    #[error("backwards subscript range [{lo}:{hi}]")]
    Backwards {
        /// Low bound given.
        lo: i32,
        /// High bound given.
        hi: i32,
    },
}

impl ConnName {
    /// Parses a name, splitting out trailing subscript ranges of the forms
    /// `[lo:hi]`, `[lo:hi,lo:hi]`, or `[lo:hi][lo:hi]`.
    pub fn parse(name: &str) -> Result<Self, ConnNameError> {
        // Find the first bracket that actually contains a range; plain
        // subscripts like `x[3]` are part of the name proper.
        let mut search_from = 0;
        let open = loop {
            let Some(rel) = name[search_from..].find('[') else {
                return Ok(Self {
                    prefix: name.to_string(),
                    suffix: String::new(),
                    subs: Vec::new(),
                });
            };
            let open = search_from + rel;
            let rest = &name[open + 1..];
            let is_range = rest
                .find(|c| c == ':' || c == ']')
                .map(|i| rest.as_bytes()[i] == b':')
                .unwrap_or(false);
            if is_range {
                break open;
            }
            search_from = open + 1;
        };

        let prefix = name[..open].to_string();
        let mut subs = Vec::new();
        let mut rest = &name[open..];
        loop {
            let c = rest.as_bytes().first().copied();
            if c != Some(b'[') && c != Some(b',') {
                break;
            }
            if subs.len() >= 2 {
                return Err(ConnNameError::TooManySubscripts);
            }
            rest = &rest[1..];
            let end = rest
                .find(|c| c == ']' || c == ',')
                .ok_or(ConnNameError::Syntax)?;
            let (lo, hi) = rest[..end]
                .split_once(':')
                .ok_or(ConnNameError::Syntax)?;
            // A per-element separation may trail the range; it is not
            // meaningful for connections and is ignored here.
            let hi = hi.split(':').next().unwrap_or(hi);
            let lo: i32 = lo.trim().parse().map_err(|_| ConnNameError::Syntax)?;
            let hi: i32 = hi.trim().parse().map_err(|_| ConnNameError::Syntax)?;
            if lo > hi {
                return Err(ConnNameError::Backwards { lo, hi });
            }
            subs.push(Range { lo, hi });
            rest = &rest[end..];
            if rest.as_bytes().first() == Some(&b']') {
                rest = &rest[1..];
            }
        }

        Ok(Self {
            prefix,
            suffix: rest.to_string(),
            subs,
        })
    }

    /// Expands the template for concrete subscripts, which must match
    /// `self.subs.len()`.
    pub fn expand(&self, idx: &[i32]) -> String {
        match idx.len() {
            0 => format!("{}{}", self.prefix, self.suffix),
            1 => format!("{}[{}]{}", self.prefix, idx[0], self.suffix),
            _ => format!("{}[{},{}]{}", self.prefix, idx[0], idx[1], self.suffix),
        }
    }

    /// The scalar name, valid when there are no subscripts.
    pub fn scalar(&self) -> String {
        self.expand(&[])
    }
}

/// The value carried by a connection record.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConnValue {
    /// Capacitance, in attofarads.
    Cap(f64),
    /// Resistance, in milliohms.
    Res(f64),
}

impl ConnValue {
    /// The capacitance, or 0 for a resistance record.
    pub fn cap(&self) -> f64 {
        match self {
            ConnValue::Cap(c) => *c,
            ConnValue::Res(_) => 0.0,
        }
    }

    /// The resistance, or 0 for a capacitance record.
    pub fn res(&self) -> f64 {
        match self {
            ConnValue::Res(r) => *r,
            ConnValue::Cap(_) => 0.0,
        }
    }
}

/// A forced merge, parasitic adjustment, two-node capacitor, or two-node
/// resistor, depending on which def list it lives on.
#[derive(Clone, Debug)]
pub struct Connection {
    /// First name.
    pub name1: ConnName,
    /// Second name; absent for a pure single-node adjustment.
    pub name2: Option<ConnName>,
    /// Capacitance or resistance value.
    pub value: ConnValue,
    /// Per-resistance-class (area, perimeter) adjustments.
    pub pa: Vec<PerimArea>,
}

impl Connection {
    /// Expands the subscript ranges over their Cartesian product, calling
    /// `f` once per element with the resolved names.  Subscripts on the
    /// second name are mapped pairwise from the first's ranges.
    pub fn expand_each<E>(
        &self,
        mut f: impl FnMut(&str, Option<&str>) -> Result<(), E>,
    ) -> Result<(), E> {
        let c1 = &self.name1;
        let c2 = self.name2.as_ref();
        match c1.subs.len() {
            0 => f(&c1.scalar(), c2.map(|c| c.scalar()).as_deref()),
            1 => {
                let r1 = c1.subs[0];
                for i in r1.lo..=r1.hi {
                    let n1 = c1.expand(&[i]);
                    let n2 = c2.map(|c| {
                        let lo2 = c.subs.first().map(|r| r.lo).unwrap_or(r1.lo);
                        c.expand(&[i - r1.lo + lo2])
                    });
                    f(&n1, n2.as_deref())?;
                }
                Ok(())
            }
            _ => {
                let (rx, ry) = (c1.subs[0], c1.subs[1]);
                for i in rx.lo..=rx.hi {
                    for j in ry.lo..=ry.hi {
                        let n1 = c1.expand(&[i, j]);
                        let n2 = c2.map(|c| {
                            let lox = c.subs.first().map(|r| r.lo).unwrap_or(rx.lo);
                            let loy = c.subs.get(1).map(|r| r.lo).unwrap_or(ry.lo);
                            c.expand(&[i - rx.lo + lox, j - ry.lo + loy])
                        });
                        f(&n1, n2.as_deref())?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// A node to erase after its def has been read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Kill {
    /// The doomed node's name.
    pub name: HierId,
}

/// Min and max routed distance between two named signals.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Distance {
    /// Minimum distance, in lambda.
    pub min: i32,
    /// Maximum distance, in lambda.
    pub max: i32,
}

/// A cell definition; the contents of one `.ext` file.
pub struct Def {
    /// Cell name.
    pub name: ArcStr,
    /// Multiply all integer dimensions in this def by this on output.
    pub scale: f64,
    /// State flags.
    pub flags: DefFlags,
    /// Local node table.
    pub nodes: NodeTable,
    /// Child uses.  The reader prepends, so traversal order is the reverse
    /// of source order.
    pub uses: Vec<Use>,
    /// Forced merges and parasitic adjustments, in file order.
    pub conns: Vec<Connection>,
    /// Two-terminal coupling capacitors.
    pub caps: Vec<Connection>,
    /// Explicit two-terminal resistors.
    pub resistors: Vec<Connection>,
    /// Devices, in file order.
    pub devs: Vec<Dev>,
    /// Nodes to erase after reading.
    pub kills: Vec<Kill>,
    /// Distance records, keyed by canonically ordered name pairs.
    pub dists: IndexMap<(HierId, HierId), Distance>,
}

impl Def {
    pub(crate) fn new(name: ArcStr) -> Self {
        Self {
            name,
            scale: 1.0,
            flags: DefFlags::empty(),
            nodes: NodeTable::new(),
            uses: Vec::new(),
            conns: Vec::new(),
            caps: Vec::new(),
            resistors: Vec::new(),
            devs: Vec::new(),
            kills: Vec::new(),
            dists: IndexMap::new(),
        }
    }

    /// Whether the def's file has been read.
    pub fn is_available(&self) -> bool {
        self.flags.contains(DefFlags::AVAILABLE)
    }

    /// Records a distance between two signals, canonically ordered so that
    /// "A to B" and "B to A" collide; repeats widen the stored interval.
    pub fn add_dist(&mut self, pool: &HierPool, a: HierId, b: HierId, min: i32, max: i32) {
        let key = if pool.best(a, b) { (a, b) } else { (b, a) };
        self.dists
            .entry(key)
            .and_modify(|d| {
                d.min = d.min.min(min);
                d.max = d.max.max(max);
            })
            .or_insert(Distance { min, max });
    }

    /// The highest explicit port index on any node name, or `None` when no
    /// ports carry indices.  `imp_max` is the same for implicit substrate
    /// ports.
    pub fn port_max(&self) -> (Option<usize>, Option<usize>) {
        use crate::node::NodeFlags;
        let mut portmax = None;
        let mut impmax = None;
        for node in self.nodes.iter() {
            let flags = self.nodes.node(node).flags;
            if flags.contains(NodeFlags::SUBS_PORT) && !flags.contains(NodeFlags::PORT) {
                if let Some(p) = self.nodes.name(self.nodes.canonical(node)).port {
                    impmax = Some(impmax.map_or(p, |m: usize| m.max(p)));
                }
            } else if flags.contains(NodeFlags::PORT) {
                for nn in self.nodes.chain(node) {
                    if let Some(p) = self.nodes.name(nn).port {
                        portmax = Some(portmax.map_or(p, |m: usize| m.max(p)));
                    }
                }
            }
        }
        (portmax, impmax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_name_scalar() {
        let c = ConnName::parse("a/b/c").unwrap();
        assert!(c.subs.is_empty());
        assert_eq!(c.scalar(), "a/b/c");
    }

    #[test]
    fn conn_name_plain_subscript_is_not_a_range() {
        let c = ConnName::parse("bit[3]/q").unwrap();
        assert!(c.subs.is_empty());
        assert_eq!(c.scalar(), "bit[3]/q");
    }

    #[test]
    fn conn_name_one_range() {
        let c = ConnName::parse("bit[0:3]/q").unwrap();
        assert_eq!(c.subs, vec![Range { lo: 0, hi: 3 }]);
        assert_eq!(c.expand(&[2]), "bit[2]/q");
    }

    #[test]
    fn conn_name_two_ranges() {
        let c = ConnName::parse("m[0:1,0:2]").unwrap();
        assert_eq!(c.subs.len(), 2);
        assert_eq!(c.expand(&[1, 2]), "m[1,2]");
        let c = ConnName::parse("m[0:1][0:2]").unwrap();
        assert_eq!(c.subs.len(), 2);
    }

    #[test]
    fn conn_name_backwards_range() {
        assert_eq!(
            ConnName::parse("a[3:1]"),
            Err(ConnNameError::Backwards { lo: 3, hi: 1 })
        );
    }

    #[test]
    fn connection_pairwise_expansion() {
        let conn = Connection {
            name1: ConnName::parse("a[0:2]").unwrap(),
            name2: Some(ConnName::parse("b[4:6]").unwrap()),
            value: ConnValue::Cap(0.0),
            pa: Vec::new(),
        };
        let mut pairs = Vec::new();
        conn.expand_each::<()>(|a, b| {
            pairs.push((a.to_string(), b.unwrap().to_string()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a[0]".to_string(), "b[4]".to_string()),
                ("a[1]".to_string(), "b[5]".to_string()),
                ("a[2]".to_string(), "b[6]".to_string()),
            ]
        );
    }

    #[test]
    fn dist_widens() {
        let mut pool = HierPool::new();
        let a = pool.from_path(None, "a");
        let b = pool.from_path(None, "b");
        let mut def = Def::new("cell".into());
        def.add_dist(&pool, a, b, 10, 20);
        def.add_dist(&pool, b, a, 5, 30);
        assert_eq!(def.dists.len(), 1);
        assert_eq!(def.dists[&(a, b)], Distance { min: 5, max: 30 });
    }
}
