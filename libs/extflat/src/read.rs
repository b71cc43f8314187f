//! The `.ext` file reader.
//!
//! `.ext` files are line-oriented: each line is a record beginning with a
//! keyword, with whitespace-separated fields and `#` comment lines.  Reading
//! starts from a root cell; `use` records name child cells, whose files are
//! queued and read in turn.  Structurally malformed records abort the whole
//! read; unknown keywords and missing nodes are warnings.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use nom::bytes::complete::{take_till, take_while};
use nom::IResult;

use crate::def::{ConnName, Connection, ConnValue, DefFlags, DefId, Kill};
use crate::dev::{Dev, DevClass, DevParam, DevTerm};
use crate::geom::{Rect, Transform};
use crate::issues::Issues;
use crate::node::{NodeFlags, NodeId, PerimArea};
use crate::Session;

/// Supplies `.ext` source text for cells by name.
///
/// The production implementation is [`DirResolver`]; tests use
/// [`MapResolver`] to read from memory.
pub trait SourceResolver {
    /// Returns the source text for the named cell.
    fn source(&self, name: &str) -> std::io::Result<String>;

    /// A human-readable location for the cell's file, used in error
    /// messages.
    fn location(&self, name: &str) -> String {
        format!("{name}.ext")
    }
}

/// Resolves cells to `<dir>/<name>.ext` along a search path.
pub struct DirResolver {
    /// Directories to search, in order.
    pub search: Vec<PathBuf>,
}

impl DirResolver {
    /// Creates a resolver over the given search directories.
    pub fn new(search: Vec<PathBuf>) -> Self {
        Self { search }
    }

    fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.search
            .iter()
            .map(|d| d.join(format!("{name}.ext")))
            .find(|p| p.exists())
    }
}

impl SourceResolver for DirResolver {
    fn source(&self, name: &str) -> std::io::Result<String> {
        match self.path_of(name) {
            Some(p) => std::fs::read_to_string(p),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{name}.ext not found on search path"),
            )),
        }
    }

    fn location(&self, name: &str) -> String {
        self.path_of(name)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{name}.ext"))
    }
}

/// An in-memory resolver mapping cell names to source text.
#[derive(Default)]
pub struct MapResolver(pub std::collections::HashMap<String, String>);

impl MapResolver {
    /// Builds a resolver from `(name, source)` pairs.
    pub fn from_cells<'a>(cells: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            cells
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl SourceResolver for MapResolver {
    fn source(&self, name: &str) -> std::io::Result<String> {
        self.0.get(name).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no cell {name}"))
        })
    }
}

/// Fatal reader errors.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// A structurally malformed record.
    #[error("{file}:{line}: malformed record near `{token}`")]
    BadFile {
        /// File the record came from.
        file: String,
        /// 1-based line number.
        line: usize,
        /// The offending token or record keyword.
        token: String,
    },
    /// A `use` named a cell whose file cannot be located.
    #[error("cannot read cell `{name}`")]
    NoSuchDef {
        /// The missing cell.
        name: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// Files disagree on the number of resistance classes.
    #[error("{file}: {found} resistance classes, but earlier files declared {expected}")]
    ClassMismatch {
        /// File with the disagreeing declaration.
        file: String,
        /// Count found in this file.
        found: usize,
        /// Count established earlier.
        expected: usize,
    },
}

/// Reads the `.ext` tree rooted at `root`, returning its def and any
/// non-fatal issues.
pub fn read_hierarchy(
    sess: &mut Session,
    root: &str,
    resolver: &impl SourceResolver,
) -> Result<(DefId, Issues), ReadError> {
    let mut issues = Issues::new();
    let root_id = match sess.def_lookup(root) {
        Some(id) => id,
        None => sess.def_new(root),
    };
    let mut queue: VecDeque<DefId> = VecDeque::new();
    queue.push_back(root_id);

    loop {
        // Pick up defs created by `use` records of files already read.
        if queue.is_empty() {
            for (id, def) in sess.defs() {
                if !def.is_available() {
                    queue.push_back(id);
                    break;
                }
            }
        }
        let Some(def) = queue.pop_front() else { break };
        if sess.def(def).is_available() {
            continue;
        }
        let name = sess.def(def).name.clone();
        let src = resolver
            .source(&name)
            .map_err(|source| ReadError::NoSuchDef {
                name: name.to_string(),
                source,
            })?;
        let file = resolver.location(&name);
        sess.def_mut(def).flags.insert(DefFlags::AVAILABLE);
        let mut reader = DefReader {
            sess: &mut *sess,
            def,
            file,
            line: 0,
            after_kill: false,
            unknown: HashSet::new(),
            issues: &mut issues,
        };
        reader.read(&src)?;
    }

    Ok((root_id, issues))
}

fn lex_token(input: &str) -> IResult<&str, &str> {
    let (input, _) = take_while(|c: char| c.is_ascii_whitespace())(input)?;
    if let Some(rest) = input.strip_prefix('"') {
        let (rest, tok) = take_till(|c| c == '"')(rest)?;
        Ok((rest.strip_prefix('"').unwrap_or(rest), tok))
    } else {
        take_till(|c: char| c.is_ascii_whitespace())(input)
    }
}

fn tokenize(mut line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    while !line.trim_start().is_empty() {
        match lex_token(line) {
            Ok((rest, tok)) => {
                out.push(tok);
                line = rest;
            }
            Err(_) => break,
        }
    }
    out
}

struct DefReader<'a> {
    sess: &'a mut Session,
    def: DefId,
    file: String,
    line: usize,
    after_kill: bool,
    unknown: HashSet<String>,
    issues: &'a mut Issues,
}

impl<'a> DefReader<'a> {
    fn read(&mut self, src: &str) -> Result<(), ReadError> {
        for (i, line) in src.lines().enumerate() {
            self.line = i + 1;
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let toks = tokenize(line);
            if toks.is_empty() {
                continue;
            }
            self.record(&toks)?;
        }
        Ok(())
    }

    fn bad(&self, token: &str) -> ReadError {
        ReadError::BadFile {
            file: self.file.clone(),
            line: self.line,
            token: token.to_string(),
        }
    }

    fn int(&self, tok: &str) -> Result<i64, ReadError> {
        tok.parse().map_err(|_| self.bad(tok))
    }

    fn coord(&self, tok: &str) -> Result<i32, ReadError> {
        tok.parse().map_err(|_| self.bad(tok))
    }

    fn float(&self, tok: &str) -> Result<f64, ReadError> {
        tok.parse().map_err(|_| self.bad(tok))
    }

    fn arg<'t>(&self, toks: &[&'t str], i: usize) -> Result<&'t str, ReadError> {
        toks.get(i).copied().ok_or_else(|| self.bad(toks[0]))
    }

    fn pa_pairs(&self, toks: &[&str]) -> Result<Vec<PerimArea>, ReadError> {
        let mut out = Vec::new();
        let mut it = toks.chunks_exact(2);
        for pair in &mut it {
            out.push(PerimArea {
                area: self.int(pair[0])?,
                perim: self.int(pair[1])?,
            });
        }
        Ok(out)
    }

    fn record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        match toks[0] {
            "tech" => self.sess.tech = Some(self.arg(toks, 1)?.into()),
            "style" => self.sess.style = Some(self.arg(toks, 1)?.into()),
            "version" | "timestamp" => {
                self.arg(toks, 1)?;
            }
            "scale" => self.scale_record(toks)?,
            "resistclasses" => self.resistclasses(toks)?,
            "use" => self.use_record(toks)?,
            "node" => self.node_record(toks, false)?,
            "substrate" => self.node_record(toks, true)?,
            "equiv" => {
                let n1 = self.arg(toks, 1)?;
                let n2 = self.arg(toks, 2)?;
                self.build_equiv(n1, n2);
            }
            "attr" => self.attr_record(toks)?,
            "merge" => self.merge_record(toks)?,
            "cap" => {
                let conn = self.two_node_conn(toks, ConnValue::Cap(self.float(self.arg(toks, 3)?)?))?;
                self.sess.def_mut(self.def).caps.push(conn);
            }
            "resist" => {
                let conn = self.two_node_conn(toks, ConnValue::Res(self.float(self.arg(toks, 3)?)?))?;
                self.sess.def_mut(self.def).resistors.push(conn);
            }
            "device" => {
                let class_arg = self.arg(toks, 1)?;
                let class = DevClass::from_keyword(class_arg)
                    .ok_or_else(|| self.bad(class_arg))?;
                self.device_record(class, &toks[2..])?;
            }
            "fet" => self.device_record(DevClass::Fet, &toks[1..])?,
            "killnode" => {
                let name = self.arg(toks, 1)?;
                let hier = self.sess.pool.from_path(None, name);
                self.sess.def_mut(self.def).kills.push(Kill { name: hier });
                self.after_kill = true;
            }
            "subcircuit" | "port" => self.port_record(toks)?,
            "distance" => {
                let a = self.arg(toks, 1)?;
                let b = self.arg(toks, 2)?;
                let min = self.coord(self.arg(toks, 3)?)?;
                let max = self.coord(self.arg(toks, 4)?)?;
                let ha = self.sess.pool.from_path(None, a);
                let hb = self.sess.pool.from_path(None, b);
                let (def, pool) = self.sess.def_and_pool(self.def);
                def.add_dist(pool, ha, hb, min, max);
            }
            "parameters" => self.parameters_record(toks)?,
            "subcap" => {
                let name = self.arg(toks, 1)?;
                let delta = self.float(self.arg(toks, 2)?)?;
                self.adjust_subcap(name, delta);
            }
            "abstract" => self
                .sess
                .def_mut(self.def)
                .flags
                .insert(DefFlags::ABSTRACT),
            "primitive" => self
                .sess
                .def_mut(self.def)
                .flags
                .insert(DefFlags::PRIMITIVE),
            kw => {
                if self.unknown.insert(kw.to_string()) {
                    tracing::warn!("{}:{}: skipping unknown record `{kw}`", self.file, self.line);
                }
            }
        }
        Ok(())
    }

    fn scale_record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let internal = self.float(self.arg(toks, 1)?)?;
        let lambda = self.float(self.arg(toks, 2)?)?;
        let cif = self.float(self.arg(toks, 3)?)?;
        if lambda == 0.0 {
            return Err(self.bad(toks[2]));
        }
        let file_scale = cif * internal / lambda;
        match self.sess.scale {
            None => {
                self.sess.scale = Some(file_scale);
                self.sess.def_mut(self.def).scale = 1.0;
            }
            Some(s) if s == file_scale => {
                self.sess.def_mut(self.def).scale = 1.0;
            }
            Some(s) => {
                self.sess.scale_changed = true;
                self.sess.def_mut(self.def).scale = file_scale / s;
            }
        }
        Ok(())
    }

    fn resistclasses(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let vals: Vec<i64> = toks[1..]
            .iter()
            .map(|t| self.int(t))
            .collect::<Result<_, _>>()?;
        if self.sess.resists.is_empty() {
            self.sess.resists = vals;
        } else if self.sess.resists.len() != vals.len() {
            return Err(ReadError::ClassMismatch {
                file: self.file.clone(),
                found: vals.len(),
                expected: self.sess.resists.len(),
            });
        } else if self.sess.resists != vals {
            tracing::warn!(
                "{}: resistance class values differ from earlier files",
                self.file
            );
        }
        Ok(())
    }

    fn use_record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let child_name = self.arg(toks, 1)?;
        let use_id = self.arg(toks, 2)?;
        let mut t = [0i32; 6];
        for (i, v) in t.iter_mut().enumerate() {
            *v = self.coord(self.arg(toks, 3 + i)?)?;
        }
        let child = match self.sess.def_lookup(child_name) {
            Some(id) => id,
            None => self.sess.def_new(child_name),
        };

        let (id, array) = match use_id.find('[') {
            None => (use_id, Default::default()),
            Some(b) => {
                let mut dims = [[0i32; 3]; 2];
                let mut rest = &use_id[b..];
                for dim in dims.iter_mut() {
                    let rest2 = rest.strip_prefix('[').ok_or_else(|| self.bad(use_id))?;
                    let close = rest2.find(']').ok_or_else(|| self.bad(use_id))?;
                    let parts: Vec<&str> = rest2[..close].split(':').collect();
                    if parts.len() != 3 {
                        return Err(self.bad(use_id));
                    }
                    for (d, p) in dim.iter_mut().zip(parts) {
                        *d = self.coord(p)?;
                    }
                    rest = &rest2[close + 1..];
                }
                (
                    &use_id[..b],
                    crate::def::ArrayInfo {
                        xlo: dims[0][0],
                        xhi: dims[0][1],
                        xsep: dims[0][2],
                        ylo: dims[1][0],
                        yhi: dims[1][1],
                        ysep: dims[1][2],
                    },
                )
            }
        };

        let u = crate::def::Use {
            id: id.into(),
            child,
            trans: Transform::from_elements(t[0], t[1], t[2], t[3], t[4], t[5]),
            array,
        };
        // Prepending makes traversal order the reverse of source order,
        // which the emitters and the parallel-merge pass both rely on.
        self.sess.def_mut(self.def).uses.insert(0, u);
        Ok(())
    }

    fn node_record(&mut self, toks: &[&str], is_subs: bool) -> Result<(), ReadError> {
        let name = self.arg(toks, 1)?;
        // The lumped resistance estimate is recomputed from the class
        // area/perimeter values, so the recorded one is skipped.
        self.float(self.arg(toks, 2)?)?;
        let cap = self.float(self.arg(toks, 3)?)?;
        let x = self.coord(self.arg(toks, 4)?)?;
        let y = self.coord(self.arg(toks, 5)?)?;
        let layer = self.arg(toks, 6).ok();
        let pairs = self.pa_pairs(&toks[7.min(toks.len())..])?;
        self.build_node(is_subs, name, cap, x, y, layer, &pairs);
        Ok(())
    }

    fn attr_record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let name = self.arg(toks, 1)?;
        let r = Rect::from_sides(
            self.coord(self.arg(toks, 2)?)?,
            self.coord(self.arg(toks, 3)?)?,
            self.coord(self.arg(toks, 4)?)?,
            self.coord(self.arg(toks, 5)?)?,
        );
        let layer = self.arg(toks, 6)?;
        let text = self.arg(toks, 7)?;

        let hier = self.sess.pool.from_path(None, name);
        let layer = self.sess.add_layer(layer);
        let text = arcstr::ArcStr::from(text);
        let def = self.sess.def_mut(self.def);
        match def.nodes.lookup_node(hier) {
            Some(node) => {
                // Attribute lists are kept most-recently-read first.
                def.nodes
                    .node_mut(node)
                    .attrs
                    .insert(0, crate::node::Attr { text, loc: r, layer });
            }
            None => {
                tracing::warn!(
                    "{}:{}: attribute for nonexistent node {name} ignored",
                    self.file,
                    self.line
                );
                self.issues.record(crate::ErrorKind::NodeMissing);
            }
        }
        Ok(())
    }

    fn merge_record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let n1 = self.conn_name(self.arg(toks, 1)?)?;
        let n2 = self.conn_name(self.arg(toks, 2)?)?;
        let cap = match toks.get(3) {
            Some(t) => self.float(t)?,
            None => 0.0,
        };
        let mut pa = self.pa_pairs(&toks[4.min(toks.len())..])?;
        pa.resize(self.sess.nclasses(), Default::default());
        self.check_subs_match(&n1, &n2, toks[0])?;
        self.sess.def_mut(self.def).conns.push(Connection {
            name1: n1,
            name2: Some(n2),
            value: ConnValue::Cap(cap),
            pa,
        });
        Ok(())
    }

    fn two_node_conn(&mut self, toks: &[&str], value: ConnValue) -> Result<Connection, ReadError> {
        let n1 = self.conn_name(self.arg(toks, 1)?)?;
        let n2 = self.conn_name(self.arg(toks, 2)?)?;
        self.check_subs_match(&n1, &n2, toks[0])?;
        Ok(Connection {
            name1: n1,
            name2: Some(n2),
            value,
            pa: Vec::new(),
        })
    }

    fn conn_name(&self, name: &str) -> Result<ConnName, ReadError> {
        ConnName::parse(name).map_err(|e| {
            tracing::error!("{}:{}: {e}", self.file, self.line);
            self.bad(name)
        })
    }

    fn check_subs_match(&self, n1: &ConnName, n2: &ConnName, kw: &str) -> Result<(), ReadError> {
        if n1.subs.len() != n2.subs.len() {
            return Err(self.bad(kw));
        }
        for (a, b) in n1.subs.iter().zip(n2.subs.iter()) {
            if a.hi - a.lo != b.hi - b.lo {
                return Err(self.bad(kw));
            }
        }
        Ok(())
    }

    fn port_record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let name = self.arg(toks, 1)?;
        let idx = self.int(self.arg(toks, 2)?)? as usize;
        let x = self.coord(self.arg(toks, 3)?)?;
        let y = self.coord(self.arg(toks, 4)?)?;
        // Either `x y layer` or a full `xbot ybot xtop ytop layer`.
        let layer = match toks.len() {
            0..=5 => None,
            6 => Some(toks[5]),
            _ => Some(toks[7.min(toks.len() - 1)]),
        };

        let hier = self.sess.pool.from_path(None, name);
        let existing = self.sess.def(self.def).nodes.lookup(hier);
        let nn = match existing {
            Some(nn) => nn,
            None => {
                self.build_node(false, name, 0.0, x, y, layer, &[]);
                self.sess
                    .def(self.def)
                    .nodes
                    .lookup(hier)
                    .expect("port node just created")
            }
        };
        let def = self.sess.def_mut(self.def);
        let node = def.nodes.name(nn).node();
        def.nodes.node_mut(node).flags.insert(NodeFlags::PORT);
        def.nodes.name_mut(nn).port = Some(idx);
        def.flags.insert(DefFlags::SUBCIRCUIT);
        Ok(())
    }

    fn parameters_record(&mut self, toks: &[&str]) -> Result<(), ReadError> {
        let ty = self.arg(toks, 1)?;
        if self.sess.dev_params.contains_key(ty) {
            return Ok(());
        }
        let mut params = Vec::new();
        for assign in &toks[2..] {
            let Some((key, tmpl)) = assign.split_once('=') else {
                tracing::warn!(
                    "{}:{}: bad parameter assignment `{assign}` for device `{ty}`",
                    self.file,
                    self.line
                );
                continue;
            };
            let (template, scale) = match tmpl.split_once('*') {
                Some((t, mult)) => (t, self.float(mult)?),
                None => (tmpl, 1.0),
            };
            params.push(DevParam {
                key: key.into(),
                template: template.into(),
                scale,
            });
        }
        self.sess.dev_params.insert(ty.into(), params);
        Ok(())
    }

    fn adjust_subcap(&mut self, name: &str, delta: f64) {
        let hier = self.sess.pool.from_path(None, name);
        let def = self.sess.def_mut(self.def);
        match def.nodes.lookup_node(hier) {
            Some(node) => def.nodes.node_mut(node).cap += delta,
            None => {
                tracing::warn!(
                    "{}:{}: subcap names unknown node {name}",
                    self.file,
                    self.line
                );
                self.issues.record(crate::ErrorKind::NodeMissing);
            }
        }
    }

    /// Creates the node `name`, or folds the given values into it if it
    /// already exists.
    fn build_node(
        &mut self,
        is_subs: bool,
        name: &str,
        cap: f64,
        x: i32,
        y: i32,
        layer: Option<&str>,
        pairs: &[PerimArea],
    ) -> NodeId {
        let hier = self.sess.pool.from_path(None, name);
        let nclasses = self.sess.nclasses();
        if let Some(node) = self.sess.def(self.def).nodes.lookup_node(hier) {
            let def = self.sess.def_mut(self.def);
            let n = def.nodes.node_mut(node);
            n.cap += cap;
            for (dst, src) in n.pa.iter_mut().zip(pairs.iter()) {
                dst.area += src.area;
                dst.perim += src.perim;
            }
            return node;
        }

        let layer = layer.map(|l| self.sess.add_layer(l)).unwrap_or(0);
        let mut flags = NodeFlags::empty();
        if is_subs {
            flags.insert(NodeFlags::SUBS_NODE);
            self.sess.compat = false;
        }
        if self.after_kill {
            flags.insert(NodeFlags::AFTER_KILL);
        }
        let def = self.sess.def_mut(self.def);
        let node = def.nodes.make_node(flags, nclasses);
        {
            let n = def.nodes.node_mut(node);
            n.cap = cap;
            n.layer = layer;
            n.loc = Rect::unit(x, y);
            for (dst, src) in n.pa.iter_mut().zip(pairs.iter()) {
                *dst = *src;
            }
        }
        def.nodes.bind_first(hier, node);
        node
    }

    /// Resolves a device terminal or substrate node, creating it if
    /// missing.
    fn build_dev_node(&mut self, name: &str, is_subs: bool) -> NodeId {
        let hier = self.sess.pool.from_path(None, name);
        if let Some(node) = self.sess.def(self.def).nodes.lookup_node(hier) {
            return node;
        }
        if !is_subs {
            tracing::warn!(
                "{}:{}: node {name} doesn't exist, so creating it",
                self.file,
                self.line
            );
        }
        let node = self.build_node(is_subs, name, 0.0, 0, 0, None, &[]);
        if is_subs {
            let global = self.sess.pool.is_global(hier);
            let def = self.sess.def_mut(self.def);
            let n = def.nodes.node_mut(node);
            n.flags.insert(NodeFlags::DEVTERM | NodeFlags::SUBS_NODE);
            if !global {
                // A substrate node with a local name is an implicitly
                // declared port.
                n.flags.insert(NodeFlags::SUBS_PORT);
                def.flags.insert(DefFlags::SUBSNODES);
            }
        }
        node
    }

    fn build_equiv(&mut self, name1: &str, name2: &str) {
        let h1 = self.sess.pool.from_path(None, name1);
        let h2 = self.sess.pool.from_path(None, name2);
        let nn1 = self.sess.def(self.def).nodes.lookup(h1);
        let nn2 = self.sess.def(self.def).nodes.lookup(h2);

        match (nn1, nn2) {
            (_, None) => {
                let node1 = match nn1 {
                    Some(nn) => self.sess.def(self.def).nodes.name(nn).node(),
                    None => {
                        tracing::warn!(
                            "{}:{}: equiv creating new node {name1}",
                            self.file,
                            self.line
                        );
                        self.build_node(false, name1, 0.0, 0, 0, None, &[])
                    }
                };
                let (def, pool) = self.sess.def_and_pool(self.def);
                def.nodes.add_name(pool, node1, h2);
            }
            (Some(nn1), Some(nn2)) => {
                let def = self.sess.def(self.def);
                let (n1, n2) = (def.nodes.name(nn1).node(), def.nodes.name(nn2).node());
                if n1 != n2 {
                    tracing::warn!(
                        "{}:{}: equiv merges nodes {name1} and {name2}",
                        self.file,
                        self.line
                    );
                    let (def, pool) = self.sess.def_and_pool(self.def);
                    def.nodes.merge(pool, n1, n2);
                }
            }
            (None, Some(nn2)) => {
                let node2 = self.sess.def(self.def).nodes.name(nn2).node();
                let (def, pool) = self.sess.def_and_pool(self.def);
                def.nodes.add_name(pool, node2, h1);
            }
        }
    }

    fn device_record(&mut self, class: DevClass, args: &[&str]) -> Result<(), ReadError> {
        if args.len() < 5 {
            return Err(self.bad(args.first().copied().unwrap_or("device")));
        }
        let ty = args[0];
        let rect = Rect::from_sides(
            self.coord(args[1])?,
            self.coord(args[2])?,
            self.coord(args[3])?,
            self.coord(args[4])?,
        );
        let args = &args[5..];
        let has_model = ty != "None";

        let mut dev = Dev {
            class,
            ty: self.sess.add_dev_type(ty),
            subs: None,
            rect,
            cap: 0.0,
            res: 0.0,
            area: 0,
            perim: 0,
            length: 0,
            width: 0,
            params: Vec::new(),
            terms: Vec::new(),
        };

        let mut argstart = match class {
            DevClass::Fet | DevClass::Mosfet | DevClass::Asymmetric | DevClass::Bjt => 3,
            DevClass::Diode | DevClass::NDiode | DevClass::PDiode => 0,
            DevClass::Res | DevClass::Cap | DevClass::CapRev => {
                if has_model {
                    2
                } else {
                    1
                }
            }
            DevClass::Subckt | DevClass::MSubckt | DevClass::RSubckt | DevClass::CSubckt => 0,
            DevClass::Volt => 1,
        };
        if argstart > args.len() {
            return Err(self.bad(ty));
        }

        // key=value tokens between the fixed fields and the terminal list
        // either override a templated quantity or pass through verbatim.
        let templates: Vec<DevParam> = self.sess.device_params(ty).to_vec();
        while argstart < args.len() {
            let Some((key, value)) = args[argstart].split_once('=') else {
                break;
            };
            let known = templates.iter().any(|p| p.key.eq_ignore_ascii_case(key));
            if !known {
                dev.params.push(args[argstart].into());
                argstart += 1;
                continue;
            }
            match key.as_bytes()[0].to_ascii_lowercase() {
                b'a' if key.len() == 1 || key.as_bytes()[1] == b'0' => {
                    dev.area = self.int(value)?;
                }
                b'p' if key.len() == 1 || key.as_bytes()[1] == b'0' => {
                    dev.perim = self.int(value)?;
                }
                b'l' => dev.length = self.int(value)?,
                b'w' => dev.width = self.int(value)?,
                b'c' => dev.cap = self.float(value)?,
                b'r' => dev.res = self.float(value)?,
                _ => dev.params.push(args[argstart].into()),
            }
            argstart += 1;
        }

        // An odd token before the terminal triples is an optional substrate
        // node for these classes.
        if matches!(
            class,
            DevClass::Res
                | DevClass::Cap
                | DevClass::CapRev
                | DevClass::Subckt
                | DevClass::MSubckt
                | DevClass::RSubckt
                | DevClass::CSubckt
                | DevClass::Diode
                | DevClass::NDiode
                | DevClass::PDiode
        ) && (args.len() - argstart) % 3 == 1
        {
            if args[argstart] != "None" {
                dev.subs = Some(self.build_dev_node(args[argstart], true));
            }
            argstart += 1;
        }

        match class {
            DevClass::Fet => {
                dev.area = self.int(args[0])?;
                dev.perim = self.int(args[1])?;
                dev.subs = Some(self.build_dev_node(args[2], true));
            }
            DevClass::Mosfet | DevClass::Asymmetric | DevClass::Bjt => {
                dev.length = self.int(args[0])?;
                dev.width = self.int(args[1])?;
                if args[2] != "None" {
                    dev.subs = Some(self.build_dev_node(args[2], true));
                }
            }
            DevClass::Res => {
                if has_model {
                    dev.length = self.int(args[0])?;
                    dev.width = self.int(args[1])?;
                } else {
                    dev.res = self.float(args[0])?;
                }
            }
            DevClass::Cap | DevClass::CapRev => {
                if has_model {
                    dev.length = self.int(args[0])?;
                    dev.width = self.int(args[1])?;
                } else {
                    dev.cap = self.float(args[0])?;
                }
            }
            _ => {}
        }

        let terms = &args[argstart..];
        if terms.len() % 3 != 0 {
            return Err(self.bad(ty));
        }
        for triple in terms.chunks_exact(3) {
            let node = self.build_dev_node(triple[0], false);
            let len = self.int(triple[1])?;
            let attrs = if triple[2] == "0" {
                None
            } else {
                Some(arcstr::ArcStr::from(triple[2]))
            };
            dev.terms.push(DevTerm { node, len, attrs });
        }

        self.sess.def_mut(self.def).devs.push(dev);
        Ok(())
    }
}
