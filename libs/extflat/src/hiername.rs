//! Interned hierarchical node names.
//!
//! Full hierarchical names are the dominant memory cost of a flattened
//! circuit, and most of that text is shared prefixes.  Names are therefore
//! stored as chains of components pointing back toward the root and interned
//! in a [`HierPool`]; a name is a small [`HierId`] handle, comparison is
//! handle equality, and the hash of a full path is precomputed at intern
//! time.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;

use arcstr::ArcStr;

/// An opaque handle to an interned hierarchical name.
///
/// Handles are only meaningful within the [`HierPool`] that produced them.
/// Two handles from the same pool are equal iff the full paths they denote
/// are equal.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct HierId(u32);

impl HierId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct HierEntry {
    parent: Option<HierId>,
    leaf: ArcStr,
    hash: u32,
    depth: u32,
}

/// Flags controlling how names are printed.
///
/// The trim flags strip the trailing global (`!`) or local (`#`) marker from
/// the final path component; the convert flags substitute characters the
/// target netlist format cannot digest.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputFlags(u16);

impl OutputFlags {
    /// Strip a trailing `!` from the leaf component.
    pub const TRIM_GLOB: OutputFlags = OutputFlags(0x01);
    /// Strip a trailing `#` from the leaf component.
    pub const TRIM_LOCAL: OutputFlags = OutputFlags(0x02);
    /// Change `,` to `;`.
    pub const COMMA_TO_SEMI: OutputFlags = OutputFlags(0x04);
    /// Change `,` to `|`.
    pub const COMMA_TO_BAR: OutputFlags = OutputFlags(0x08);
    /// Change `=` to `:`.
    pub const EQUAL_TO_COLON: OutputFlags = OutputFlags(0x10);
    /// Change `[` and `]` to `_`.
    pub const BRACKETS_TO_UNDERSCORE: OutputFlags = OutputFlags(0x20);
    /// Change `.` to `@` (HSPICE reserves `.` for its own separator).
    pub const DOT_TO_AT: OutputFlags = OutputFlags(0x40);

    /// No conversions at all.
    pub const fn empty() -> Self {
        OutputFlags(0)
    }

    /// Returns whether every flag in `other` is set in `self`.
    pub const fn contains(self, other: OutputFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The union of two flag sets.
    pub const fn union(self, other: OutputFlags) -> OutputFlags {
        OutputFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for OutputFlags {
    type Output = OutputFlags;
    fn bitor(self, rhs: OutputFlags) -> OutputFlags {
        self.union(rhs)
    }
}

/// Folds one byte into a running path hash.
///
/// The 4-bit rotate makes "ab" and "ba" hash differently and gives short
/// strings large hash values.  Changing this constant changes every cached
/// hash in a pool.
#[inline]
fn hash_add(sum: u32, val: u8) -> u32 {
    ((sum >> 28) | (sum << 4)).wrapping_add(val as u32)
}

fn hash_component(parent_hash: u32, leaf: &str) -> u32 {
    leaf.bytes().fold(parent_hash, hash_add)
}

/// The intern pool for hierarchical names.
#[derive(Default)]
pub struct HierPool {
    entries: Vec<HierEntry>,
    index: HashMap<(Option<HierId>, ArcStr), HierId>,
}

impl HierPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a single component under `parent`.
    pub fn intern(&mut self, parent: Option<HierId>, leaf: &str) -> HierId {
        let key = (parent, ArcStr::from(leaf));
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let parent_hash = parent.map(|p| self.hash(p)).unwrap_or(0);
        let depth = parent.map(|p| self.depth(p) + 1).unwrap_or(1);
        let id = HierId(self.entries.len() as u32);
        self.entries.push(HierEntry {
            parent,
            leaf: key.1.clone(),
            hash: hash_component(parent_hash, leaf),
            depth,
        });
        self.index.insert(key, id);
        id
    }

    /// Interns a slash-separated path under `parent`, one component per
    /// segment.
    pub fn from_path(&mut self, parent: Option<HierId>, path: &str) -> HierId {
        let mut cur = parent;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = Some(self.intern(cur, seg));
        }
        cur.expect("empty hierarchical path")
    }

    /// Re-parents the chain of `suffix` onto `prefix`, interning each
    /// component along the way.
    pub fn concat(&mut self, prefix: Option<HierId>, suffix: HierId) -> HierId {
        let leaf = self.leaf(suffix).clone();
        let new_parent = match self.parent(suffix) {
            Some(p) => Some(self.concat(prefix, p)),
            None => prefix,
        };
        self.intern(new_parent, &leaf)
    }

    /// Looks up a single component under `parent` without interning.
    pub fn find(&self, parent: Option<HierId>, leaf: &str) -> Option<HierId> {
        self.index.get(&(parent, ArcStr::from(leaf))).copied()
    }

    /// Looks up a slash-separated path under `parent` without interning.
    ///
    /// A miss means the name was never seen while reading or flattening,
    /// so it cannot exist in any table keyed by interned names.
    pub fn find_path(&self, parent: Option<HierId>, path: &str) -> Option<HierId> {
        let mut cur = parent;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = Some(self.find(cur, seg)?);
        }
        cur
    }

    /// Looks up the re-parenting of `suffix` onto `prefix` without
    /// interning.
    pub fn find_concat(&self, prefix: Option<HierId>, suffix: HierId) -> Option<HierId> {
        let new_parent = match self.parent(suffix) {
            Some(p) => Some(self.find_concat(prefix, p)?),
            None => prefix,
        };
        self.find(new_parent, self.leaf(suffix))
    }

    /// The final path component.
    pub fn leaf(&self, id: HierId) -> &ArcStr {
        &self.entries[id.index()].leaf
    }

    /// The parent chain, or `None` at the root.
    pub fn parent(&self, id: HierId) -> Option<HierId> {
        self.entries[id.index()].parent
    }

    /// The cached hash of the full path.
    pub fn hash(&self, id: HierId) -> u32 {
        self.entries[id.index()].hash
    }

    /// Number of components in the path.
    pub fn depth(&self, id: HierId) -> u32 {
        self.entries[id.index()].depth
    }

    /// Whether the leaf carries the global marker `!`.
    pub fn is_global(&self, id: HierId) -> bool {
        self.leaf(id).ends_with('!')
    }

    /// Whether the leaf carries the generated-name marker `#`.
    pub fn is_local(&self, id: HierId) -> bool {
        self.leaf(id).ends_with('#')
    }

    /// Renders the `/`-joined path without any conversions.
    pub fn path_string(&self, id: HierId) -> String {
        let mut out = String::new();
        self.write_path(&mut out, id, OutputFlags::empty());
        out
    }

    /// Renders the path with the given trim and conversion flags applied.
    pub fn render(&self, id: HierId, flags: OutputFlags) -> String {
        let mut out = String::new();
        self.write_path(&mut out, id, flags);
        out
    }

    fn write_path(&self, out: &mut String, id: HierId, flags: OutputFlags) {
        if let Some(p) = self.parent(id) {
            self.write_path(out, p, flags);
            out.push('/');
        }
        let leaf = self.leaf(id);
        let last = leaf.len() - 1;
        for (i, c) in leaf.char_indices() {
            if i == last {
                if c == '!' && flags.contains(OutputFlags::TRIM_GLOB) {
                    break;
                }
                if c == '#' && flags.contains(OutputFlags::TRIM_LOCAL) {
                    break;
                }
            }
            let c = match c {
                ',' if flags.contains(OutputFlags::COMMA_TO_SEMI) => ';',
                ',' if flags.contains(OutputFlags::COMMA_TO_BAR) => '|',
                '=' if flags.contains(OutputFlags::EQUAL_TO_COLON) => ':',
                '[' | ']' if flags.contains(OutputFlags::BRACKETS_TO_UNDERSCORE) => '_',
                '.' if flags.contains(OutputFlags::DOT_TO_AT) => '@',
                c => c,
            };
            let _ = out.write_char(c);
        }
    }

    /// Whether `a` takes precedence over `b` as the canonical name of a
    /// merged node.
    ///
    /// Precedence prefers, in order: fewer path components, a global `!`
    /// leaf, a leaf without the generated `#` marker, a shorter leaf, and
    /// finally the lexicographically smaller path.  The result is a strict
    /// total order over distinct names, so repeated runs elect the same
    /// canonical names.
    pub fn best(&self, a: HierId, b: HierId) -> bool {
        self.cmp_precedence(a, b) == Ordering::Less
    }

    /// Total precedence order; `Ordering::Less` means higher precedence.
    pub fn cmp_precedence(&self, a: HierId, b: HierId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        self.depth(a)
            .cmp(&self.depth(b))
            .then_with(|| self.is_global(b).cmp(&self.is_global(a)))
            .then_with(|| self.is_local(a).cmp(&self.is_local(b)))
            .then_with(|| self.leaf(a).len().cmp(&self.leaf(b).len()))
            .then_with(|| self.leaf(a).cmp(self.leaf(b)))
            .then_with(|| match (self.parent(a), self.parent(b)) {
                (Some(pa), Some(pb)) => self.cmp_precedence(pa, pb),
                _ => Ordering::Equal,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedups() {
        let mut pool = HierPool::new();
        let a = pool.intern(None, "top");
        let b = pool.intern(Some(a), "sub");
        assert_eq!(pool.from_path(None, "top/sub"), b);
        assert_eq!(pool.intern(None, "top"), a);
    }

    #[test]
    fn hash_depends_on_order() {
        let mut pool = HierPool::new();
        let ab = pool.intern(None, "ab");
        let ba = pool.intern(None, "ba");
        assert_ne!(pool.hash(ab), pool.hash(ba));
    }

    #[test]
    fn path_hash_folds_parent() {
        let mut pool = HierPool::new();
        let parent = pool.intern(None, "p");
        let child = pool.intern(Some(parent), "c");
        assert_eq!(
            pool.hash(child),
            hash_component(pool.hash(parent), "c"),
        );
    }

    #[test]
    fn precedence_rules() {
        let mut pool = HierPool::new();
        let shallow = pool.from_path(None, "a");
        let deep = pool.from_path(None, "x/a");
        assert!(pool.best(shallow, deep));

        let glob = pool.intern(None, "Vdd!");
        let plain = pool.intern(None, "n");
        assert!(pool.best(glob, plain));

        let gen = pool.intern(None, "n17#");
        assert!(pool.best(plain, gen));

        let long = pool.intern(None, "nn");
        assert!(pool.best(plain, long));

        let a = pool.intern(None, "a");
        let b = pool.intern(None, "b");
        assert!(pool.best(a, b));
    }

    #[test]
    fn precedence_is_a_total_order() {
        let mut pool = HierPool::new();
        let names = [
            pool.from_path(None, "a"),
            pool.from_path(None, "b"),
            pool.from_path(None, "Vdd!"),
            pool.from_path(None, "n7#"),
            pool.from_path(None, "x/a"),
            pool.from_path(None, "y/a"),
            pool.from_path(None, "x/Vdd!"),
        ];
        for &a in &names {
            assert_eq!(pool.cmp_precedence(a, a), Ordering::Equal);
            for &b in &names {
                if a != b {
                    assert_ne!(pool.cmp_precedence(a, b), Ordering::Equal);
                    assert_eq!(
                        pool.cmp_precedence(a, b),
                        pool.cmp_precedence(b, a).reverse()
                    );
                }
                for &c in &names {
                    if pool.cmp_precedence(a, b) == Ordering::Less
                        && pool.cmp_precedence(b, c) == Ordering::Less
                    {
                        assert_eq!(pool.cmp_precedence(a, c), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn render_applies_trims_and_conversions() {
        let mut pool = HierPool::new();
        let n = pool.from_path(None, "top/a,b=c/Gnd!");
        let flags = OutputFlags::TRIM_GLOB
            | OutputFlags::COMMA_TO_BAR
            | OutputFlags::EQUAL_TO_COLON;
        assert_eq!(pool.render(n, flags), "top/a|b:c/Gnd");
        assert_eq!(pool.path_string(n), "top/a,b=c/Gnd!");
    }
}
