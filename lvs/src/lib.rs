//! Netlist verification against extracted layout connectivity.
//!
//! A net list is a plain text file: one net per paragraph, one terminal
//! name per line.  Verification walks each net, traces the paint reachable
//! from its terminals through a [`Connectivity`] source (the layout
//! database, behind a trait), and reports *opens* (declared terminals the
//! trace never reached) and *shorts* (reached terminals the net never
//! declared) as feedback areas.  Ripup erases a net's traced paint and
//! labels; cull drops correctly wired nets from the list.

#![warn(missing_docs)]

use std::collections::HashSet;

use extflat::geom::Rect;
use extflat::{ErrorKind, Issues};

/// One net: the terminal names that must be electrically connected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Net {
    /// Terminal names, in file order.
    pub terms: Vec<String>,
}

/// An ordered list of nets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetList {
    /// The nets, in file order.
    pub nets: Vec<Net>,
}

/// Errors reading a net-list file.
#[derive(Debug, thiserror::Error)]
pub enum NetListError {
    /// The file could not be read.
    #[error("cannot read net list {path}")]
    Io {
        /// The offending path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

impl NetList {
    /// Reads and parses a net-list file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, NetListError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| NetListError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Parses the net-list file format: nets are paragraphs separated by
    /// blank lines, each non-blank line a terminal name.  `#` lines are
    /// comments.
    pub fn parse(text: &str) -> Self {
        let mut nets = Vec::new();
        let mut cur = Net::default();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if line.is_empty() {
                if !cur.terms.is_empty() {
                    nets.push(std::mem::take(&mut cur));
                }
            } else {
                cur.terms.push(line.to_string());
            }
        }
        if !cur.terms.is_empty() {
            nets.push(cur);
        }
        Self { nets }
    }

    /// Renders the list back to its file format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for net in &self.nets {
            for t in &net.terms {
                out.push_str(t);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

/// A label in the layout: a terminal name and where it sits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelLoc {
    /// The label text (a terminal name).
    pub name: String,
    /// The label's location.
    pub area: Rect,
}

/// Everything electrically reachable from one starting label.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    /// Every label attached to the reached paint, including the start.
    pub labels: Vec<LabelLoc>,
}

/// The layout database's view of connectivity, as the verifier needs it.
///
/// Implemented by the layout system; tests use an in-memory mock.
pub trait Connectivity {
    /// All instances of a named label in the edit cell.
    fn find_labels(&self, name: &str) -> Vec<LabelLoc>;

    /// Traces connected paint from a label through the connect table,
    /// collecting every label reached.
    fn trace(&self, from: &LabelLoc) -> Trace;

    /// Every label in the edit cell, in a stable order.
    fn all_labels(&self) -> Vec<LabelLoc>;

    /// Erases the paint reached by a trace (only the types actually
    /// present) together with the attached labels.
    fn erase(&mut self, trace: &Trace);
}

/// A rectangle plus message queued for the user to inspect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feedback {
    /// Where to look.
    pub area: Rect,
    /// What went wrong.
    pub message: String,
}

/// The outcome of a verification run.
#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    /// Feedback areas, one per error found.
    pub feedback: Vec<Feedback>,
    /// Problem kinds and counts.
    pub issues: Issues,
}

impl VerifyReport {
    /// The user-facing summary line.
    pub fn summary(&self) -> String {
        match self.feedback.len() {
            0 => "No wiring errors found.".to_string(),
            1 => "One feedback area generated (you're getting close!).".to_string(),
            n => format!("{n} feedback areas generated."),
        }
    }
}

/// Checks that every net in the list is wired exactly as declared: fully
/// connected, and connected to nothing else in the list.
pub fn verify(netlist: &NetList, conn: &impl Connectivity) -> VerifyReport {
    let mut report = VerifyReport::default();
    for net in &netlist.nets {
        verify_net(net, conn, true, &mut report);
    }
    report
}

/// Verifies a single net; with `report` errors are recorded, otherwise the
/// return value only says whether the net was clean.
fn verify_net(
    net: &Net,
    conn: &impl Connectivity,
    record: bool,
    report: &mut VerifyReport,
) -> bool {
    // Collect everything reachable from the first locatable terminal.
    // Multiple labels with the same name are assumed connected, so the
    // trace starts from every instance.
    let mut start = None;
    for term in &net.terms {
        let labels = conn.find_labels(term);
        if labels.is_empty() {
            tracing::error!("terminal \"{term}\" not found");
            continue;
        }
        start = Some(labels);
        break;
    }
    let Some(start) = start else {
        return false;
    };

    let mut collected: Vec<LabelLoc> = Vec::new();
    for label in &start {
        for reached in conn.trace(label).labels {
            if !collected.contains(&reached) {
                collected.push(reached);
            }
        }
    }

    // Every declared terminal must appear in the collected set.
    let mut clean = true;
    let mut open_reported = false;
    let mut matched = vec![false; collected.len()];
    for term in &net.terms {
        let mut found = false;
        for (i, l) in collected.iter().enumerate() {
            if &l.name == term {
                matched[i] = true;
                found = true;
            }
        }
        if !found {
            clean = false;
            // One open report per net is enough to localize the problem.
            if record && !open_reported {
                open_reported = true;
                tracing::error!("terminal \"{term}\" not connected");
                let area = conn
                    .find_labels(term)
                    .first()
                    .map(|l| l.area)
                    .unwrap_or_default();
                report.feedback.push(Feedback {
                    area: area.expand_all(1),
                    message: format!("Terminal \"{term}\" not connected."),
                });
                report.issues.record(ErrorKind::VerifyOpen);
            }
        }
    }

    // Anything collected but not declared is a short to another net.
    let declared: HashSet<&str> = net.terms.iter().map(String::as_str).collect();
    for l in &collected {
        if !declared.contains(l.name.as_str()) {
            clean = false;
            if record {
                let first = &net.terms[0];
                tracing::error!("net \"{first}\" shorted to net \"{}\"", l.name);
                report.feedback.push(Feedback {
                    area: l.area.expand_all(1),
                    message: format!(
                        "Net \"{first}\" shorted to net \"{}\".",
                        l.name
                    ),
                });
                report.issues.record(ErrorKind::VerifyShort);
            }
            break;
        }
    }
    clean
}

/// Removes every correctly wired net from the list, shrinking the work
/// left after hand routing.  Returns the number removed.
pub fn cull(netlist: &mut NetList, conn: &impl Connectivity) -> usize {
    let mut dummy = VerifyReport::default();
    let before = netlist.nets.len();
    netlist
        .nets
        .retain(|net| !verify_net(net, conn, false, &mut dummy));
    let removed = before - netlist.nets.len();
    match removed {
        0 => tracing::info!("No fully-wired nets found."),
        1 => tracing::info!("One fully-wired net deleted from the netlist."),
        n => tracing::info!("{n} fully-wired nets deleted from the netlist."),
    }
    removed
}

/// Erases the wiring of every net in the list: the exact paint types
/// present in each trace, plus the attached labels.  Returns the number of
/// nets ripped up.
pub fn ripup(netlist: &NetList, conn: &mut impl Connectivity) -> usize {
    let mut count = 0;
    for net in &netlist.nets {
        let mut ripped = false;
        for term in &net.terms {
            for label in conn.find_labels(term) {
                let trace = conn.trace(&label);
                if !trace.labels.is_empty() {
                    conn.erase(&trace);
                    ripped = true;
                }
            }
        }
        if ripped {
            count += 1;
        }
    }
    count
}

/// Derives a net list from the geometry: every group of electrically
/// connected labels becomes one net.
pub fn extract(conn: &impl Connectivity) -> NetList {
    let mut seen: HashSet<String> = HashSet::new();
    let mut nets = Vec::new();
    for label in conn.all_labels() {
        if seen.contains(&label.name) {
            continue;
        }
        let mut terms: Vec<String> = Vec::new();
        for reached in conn.trace(&label).labels {
            if seen.insert(reached.name.clone()) {
                terms.push(reached.name);
            }
        }
        if terms.len() > 1 {
            nets.push(Net { terms });
        }
    }
    NetList { nets }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    /// An in-memory connectivity source: labels grouped by electrical
    /// island.
    #[derive(Default)]
    struct MockLayout {
        islands: Vec<Vec<LabelLoc>>,
    }

    impl MockLayout {
        fn island(mut self, names: &[&str]) -> Self {
            let base = self.islands.iter().map(|i| i.len()).sum::<usize>() as i32;
            self.islands.push(
                names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| LabelLoc {
                        name: n.to_string(),
                        area: Rect::unit(base + i as i32, 0),
                    })
                    .collect(),
            );
            self
        }
    }

    impl Connectivity for MockLayout {
        fn find_labels(&self, name: &str) -> Vec<LabelLoc> {
            self.islands
                .iter()
                .flatten()
                .filter(|l| l.name == name)
                .cloned()
                .collect()
        }

        fn trace(&self, from: &LabelLoc) -> Trace {
            for island in &self.islands {
                if island.iter().any(|l| l == from) {
                    return Trace {
                        labels: island.clone(),
                    };
                }
            }
            Trace::default()
        }

        fn all_labels(&self) -> Vec<LabelLoc> {
            self.islands.iter().flatten().cloned().collect()
        }

        fn erase(&mut self, trace: &Trace) {
            self.islands
                .retain(|island| !island.iter().any(|l| trace.labels.contains(l)));
        }
    }

    #[test]
    fn parse_paragraphs() {
        let nl = NetList::parse("a\nb\n\n# comment\nc/d!\ne\n\n");
        assert_eq!(nl.nets.len(), 2);
        assert_eq!(nl.nets[0].terms, vec!["a", "b"]);
        assert_eq!(nl.nets[1].terms, vec!["c/d!", "e"]);
    }

    #[test]
    fn fully_wired_net_is_clean() {
        let layout = MockLayout::default().island(&["a", "b", "c"]);
        let nl = NetList::parse("a\nb\nc\n");
        let report = verify(&nl, &layout);
        assert!(report.feedback.is_empty());
        assert!(report.issues.is_empty());
        assert_eq!(report.summary(), "No wiring errors found.");
    }

    #[test]
    fn open_reported_once_per_net() {
        let layout = MockLayout::default()
            .island(&["a"])
            .island(&["b"])
            .island(&["c"]);
        let nl = NetList::parse("a\nb\nc\n");
        let report = verify(&nl, &layout);
        // Both b and c are disconnected, but the net gets one open report.
        assert_eq!(report.feedback.len(), 1);
        assert!(report.issues.has(ErrorKind::VerifyOpen));
        assert!(report.feedback[0].message.contains("\"b\" not connected"));
        assert_eq!(
            report.summary(),
            "One feedback area generated (you're getting close!)."
        );
    }

    #[test]
    fn short_reported_against_other_net() {
        let layout = MockLayout::default().island(&["a", "b", "x"]);
        let nl = NetList::parse("a\nb\n");
        let report = verify(&nl, &layout);
        assert_eq!(report.feedback.len(), 1);
        assert!(report.issues.has(ErrorKind::VerifyShort));
        assert!(report.feedback[0]
            .message
            .contains("Net \"a\" shorted to net \"x\""));
    }

    #[test]
    fn symmetric_nets_never_report_opens() {
        // Tracing from any member reaches the full set, so no open is
        // possible regardless of which terminal is listed first.
        let layout = MockLayout::default().island(&["p", "q", "r"]);
        for order in [["p", "q", "r"], ["r", "p", "q"], ["q", "r", "p"]] {
            let nl = NetList {
                nets: vec![Net {
                    terms: order.iter().map(|s| s.to_string()).collect(),
                }],
            };
            let report = verify(&nl, &layout);
            assert!(!report.issues.has(ErrorKind::VerifyOpen));
        }
    }

    #[test]
    fn cull_removes_only_clean_nets() {
        let layout = MockLayout::default()
            .island(&["a", "b"])
            .island(&["c"])
            .island(&["d"]);
        let mut nl = NetList::parse("a\nb\n\nc\nd\n");
        let removed = cull(&mut nl, &layout);
        assert_eq!(removed, 1);
        assert_eq!(nl.nets.len(), 1);
        assert_eq!(nl.nets[0].terms, vec!["c", "d"]);
    }

    #[test]
    fn ripup_erases_traced_paint() {
        let mut layout = MockLayout::default()
            .island(&["a", "b"])
            .island(&["keep"]);
        let nl = NetList::parse("a\nb\n");
        let ripped = ripup(&nl, &mut layout);
        assert_eq!(ripped, 1);
        assert!(layout.find_labels("a").is_empty());
        assert!(!layout.find_labels("keep").is_empty());
    }

    #[test]
    fn extract_groups_labels_into_nets() {
        let layout = MockLayout::default()
            .island(&["a", "b"])
            .island(&["lonely"])
            .island(&["c", "d", "e"]);
        let nl = extract(&layout);
        assert_eq!(nl.nets.len(), 2);
        assert_eq!(nl.nets[0].terms, vec!["a", "b"]);
        assert_eq!(nl.nets[1].terms, vec!["c", "d", "e"]);
    }

    #[test]
    fn netlist_round_trips_through_text() {
        let nl = NetList::parse("a\nb\n\nc\n d \n");
        let again = NetList::parse(&nl.to_text());
        assert_eq!(nl, again);
    }
}
