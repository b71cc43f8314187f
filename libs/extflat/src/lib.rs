//! Flattening of hierarchical circuit extraction (`.ext`) files.
//!
//! A hierarchically extracted circuit is a tree of per-cell files linked by
//! `use` records, each carrying its own scale and transform.  This crate
//! reads that tree into a [`Session`], flattens it into a single electrical
//! graph of nodes, devices, and parasitics, and exposes deterministic
//! visitors over the result for netlist emitters to consume.
//!
//! The pieces, bottom up:
//!
//! - [`hiername`]: interned hierarchical names with cached hashes and the
//!   precedence order that elects canonical node names.
//! - [`node`]: node arenas with alias chains and constant-time merging.
//! - [`def`]: per-cell definitions, uses, connections, kills, distances.
//! - [`read`]: the `.ext` record reader.
//! - [`flat`]: the flattener.
//! - [`dev`]: the device model and parallel-device merging.
//! - [`visit`]: ordered traversals of the flattened circuit.
#![warn(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arcstr::ArcStr;
use indexmap::IndexMap;

pub mod def;
pub mod dev;
pub mod flat;
pub mod geom;
pub mod hiername;
pub mod issues;
pub mod node;
pub mod read;
pub mod visit;

#[cfg(test)]
mod tests;

pub use def::{Def, DefFlags, DefId};
pub use hiername::{HierId, HierPool, OutputFlags};
pub use issues::{ErrorKind, Issues};
pub use node::{NameId, NodeFlags, NodeId, NodeTable};

use dev::DevParam;

/// A capacitance or resistance threshold that filters nothing.
pub const INFINITE_THRESHOLD: f64 = 1.0e38;

/// Whether a threshold is finite, i.e. actually filters.
pub fn is_finite_threshold(v: f64) -> bool {
    v < INFINITE_THRESHOLD
}

/// All state for one extract-and-emit command.
///
/// Owns the name pool, the def registry, the shared device-type and
/// layer-name tables, and the per-device-type parameter templates.  Dropping
/// the session tears everything down; nothing is retained across commands.
pub struct Session {
    /// The hierarchical name pool.
    pub pool: HierPool,
    defs: Vec<Def>,
    by_name: IndexMap<ArcStr, DefId>,
    /// Device type names, indexed by `Dev::ty`.
    pub dev_types: Vec<ArcStr>,
    /// Layer names, indexed by node layer type.  Index 0 is `space`.
    pub layer_names: Vec<ArcStr>,
    /// Sheet resistance per resistance class, in milliohms per square.
    pub resists: Vec<i64>,
    /// Technology name from the first file read.
    pub tech: Option<ArcStr>,
    /// Extraction style name.
    pub style: Option<ArcStr>,
    pub(crate) scale: Option<f64>,
    /// Set when files disagreed on scale, forcing per-def scaling.
    pub scale_changed: bool,
    /// True until a `substrate` record is seen; selects the old
    /// global-substrate handling.
    pub compat: bool,
    /// Per-device-type parameter templates from `parameters` records.
    pub dev_params: IndexMap<ArcStr, Vec<DevParam>>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self {
            pool: HierPool::new(),
            defs: Vec::new(),
            by_name: IndexMap::new(),
            dev_types: Vec::new(),
            layer_names: vec![arcstr::literal!("space")],
            resists: Vec::new(),
            tech: None,
            style: None,
            scale: None,
            scale_changed: false,
            compat: true,
            dev_params: IndexMap::new(),
            interrupt: None,
        }
    }

    /// The number of resistance classes.
    pub fn nclasses(&self) -> usize {
        self.resists.len()
    }

    /// The scale factor established by the first `scale` record read, in
    /// centimicrons per lambda; 1.0 if none was seen.
    pub fn scale(&self) -> f64 {
        self.scale.unwrap_or(1.0)
    }

    /// Looks up an existing def by name.
    pub fn def_lookup(&self, name: &str) -> Option<DefId> {
        self.by_name.get(name).copied()
    }

    /// Creates an empty def, marked not yet read.
    ///
    /// # Panics
    ///
    /// Panics if the name is already registered.
    pub fn def_new(&mut self, name: &str) -> DefId {
        let name = ArcStr::from(name);
        assert!(
            !self.by_name.contains_key(&name),
            "def {name} created twice"
        );
        let id = DefId(self.defs.len() as u32);
        self.defs.push(Def::new(name.clone()));
        self.by_name.insert(name, id);
        id
    }

    /// The def for a handle.
    pub fn def(&self, id: DefId) -> &Def {
        &self.defs[id.0 as usize]
    }

    /// Mutable access to a def.
    pub fn def_mut(&mut self, id: DefId) -> &mut Def {
        &mut self.defs[id.0 as usize]
    }

    /// Mutable access to a def together with the (shared) name pool, for
    /// operations like merging that need both.
    pub fn def_and_pool(&mut self, id: DefId) -> (&mut Def, &HierPool) {
        (&mut self.defs[id.0 as usize], &self.pool)
    }

    /// Iterates over all defs in registration order.
    pub fn defs(&self) -> impl Iterator<Item = (DefId, &Def)> {
        self.defs.iter().enumerate().map(|(i, d)| (DefId(i as u32), d))
    }

    /// Returns the index of `name` in the device-type table, adding it if
    /// new.
    pub fn add_dev_type(&mut self, name: &str) -> usize {
        if let Some(i) = self.dev_types.iter().position(|t| t == name) {
            return i;
        }
        self.dev_types.push(ArcStr::from(name));
        self.dev_types.len() - 1
    }

    /// Returns the index of `name` in the layer table, adding it if new.
    pub fn add_layer(&mut self, name: &str) -> usize {
        if let Some(i) = self.layer_names.iter().position(|t| t == name) {
            return i;
        }
        self.layer_names.push(ArcStr::from(name));
        self.layer_names.len() - 1
    }

    /// Parameter templates for a device type, if any were declared.
    pub fn device_params(&self, ty: &str) -> &[DevParam] {
        self.dev_params.get(ty).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Installs a cooperative interrupt flag.
    ///
    /// Long passes poll the flag between per-def and per-net iterations and
    /// return cleanly with their in-memory state intact when it is set.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    /// Whether the interrupt flag is currently set.
    pub fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}
