use std::path::PathBuf;

use anyhow::Context;
use clap::Parser as ClapParser;

use extflat::dev::MergeMode;
use extflat::flat::{flat_build, FlatFlags};
use extflat::read::{read_hierarchy, DirResolver};
use extflat::Session;
use sim::{write_sim, SimFormat, SimOptions};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    exttosim(args)?;
    println!("exttosim finished.");
    Ok(())
}

/// Arguments to [`exttosim`].
#[derive(ClapParser)]
#[command(
    version,
    about,
    long_about = "Flatten a hierarchically extracted (.ext) circuit and write a .sim netlist"
)]
pub struct Args {
    /// The root cell to flatten.
    cell: String,
    /// The path where the output netlist should be saved.
    ///
    /// Defaults to <cell>.sim; the alias and label sidecars take the same
    /// stem with .al and .nodes suffixes.
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// Directories to search for .ext files.
    #[arg(long = "path", default_value = ".")]
    search: Vec<PathBuf>,
    /// Output format.
    #[arg(long, default_value = "mit")]
    format: SimFormat,
    /// Capacitance threshold in femtofarads, or "infinite".
    #[arg(long, default_value = "2", value_parser = parse_threshold)]
    cthresh: f64,
    /// Resistance threshold in ohms, or "infinite".
    #[arg(long, default_value = "infinite", value_parser = parse_threshold)]
    rthresh: f64,
    /// Parallel device merging.
    #[arg(long, default_value = "none", value_parser = parse_merge)]
    merge: MergeMode,
    /// Divert alias lines to a .al sidecar file.
    #[arg(long, default_value = "off", value_parser = parse_on_off)]
    alias: bool,
    /// Write node label locations to a .nodes sidecar file.
    #[arg(long, default_value = "off", value_parser = parse_on_off)]
    labels: bool,
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => Err("expected on or off".to_string()),
    }
}

fn parse_threshold(s: &str) -> Result<f64, String> {
    if s.to_lowercase().starts_with("inf") {
        return Ok(extflat::INFINITE_THRESHOLD);
    }
    s.parse()
        .map_err(|_| "numeric value or \"infinite\" expected".to_string())
}

fn parse_merge(s: &str) -> Result<MergeMode, String> {
    match s.to_lowercase().as_str() {
        "none" => Ok(MergeMode::None),
        "conservative" => Ok(MergeMode::Conservative),
        "aggressive" => Ok(MergeMode::Aggressive),
        _ => Err("merge types are none, conservative, and aggressive".to_string()),
    }
}

/// Runs the full read → flatten → emit pipeline.
pub fn exttosim(args: Args) -> anyhow::Result<()> {
    let opts = SimOptions {
        format: args.format,
        cap_threshold: args.cthresh,
        res_threshold: args.rthresh,
        merge: args.merge,
        ..SimOptions::default()
    };
    let stem = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.sim", args.cell)));

    let mut sess = Session::new();
    let resolver = DirResolver::new(args.search.clone());
    let (root, read_issues) = read_hierarchy(&mut sess, &args.cell, &resolver)
        .with_context(|| format!("failed to read {}.ext", args.cell))?;

    let mut flags = FlatFlags::NODES | FlatFlags::RESISTS;
    if extflat::is_finite_threshold(opts.cap_threshold) {
        flags = flags | FlatFlags::CAPS;
    }
    let flat = flat_build(&mut sess, root, flags);

    let file = std::fs::File::create(&stem)
        .with_context(|| format!("unable to open {} for writing", stem.display()))?;
    let mut out = std::io::BufWriter::new(file);

    let mut alias_file = if args.alias {
        let p = stem.with_extension("al");
        Some(std::io::BufWriter::new(std::fs::File::create(&p).with_context(
            || format!("unable to open {} for writing", p.display()),
        )?))
    } else {
        None
    };
    let mut label_file = if args.labels {
        let p = stem.with_extension("nodes");
        Some(std::io::BufWriter::new(std::fs::File::create(&p).with_context(
            || format!("unable to open {} for writing", p.display()),
        )?))
    } else {
        None
    };

    let mut issues = write_sim(
        &sess,
        &flat,
        &opts,
        &mut out,
        alias_file.as_mut().map(|f| f as &mut dyn std::io::Write),
        label_file.as_mut().map(|f| f as &mut dyn std::io::Write),
    )
    .with_context(|| format!("failed to write {}", stem.display()))?;
    issues.merge(&read_issues);
    issues.merge(&flat.issues);

    if !issues.is_empty() {
        eprintln!("{} problems reported; see the log above.", issues.total());
    }
    Ok(())
}
