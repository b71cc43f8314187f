use std::path::PathBuf;

use anyhow::Context;
use clap::Parser as ClapParser;

use extflat::dev::MergeMode;
use extflat::read::{read_hierarchy, DirResolver};
use extflat::Session;
use spice::hier::write_hier_spice;
use spice::{
    prepare_flat, write_flat_spice, NetlistError, ShortMode, SpiceFormat, SpiceOptions, TopMode,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    exttospice(args)?;
    println!("exttospice finished.");
    Ok(())
}

/// Arguments to [`exttospice`].
#[derive(ClapParser)]
#[command(
    version,
    about,
    long_about = "Flatten a hierarchically extracted (.ext) circuit and write a SPICE netlist"
)]
pub struct Args {
    /// The root cell to flatten.
    cell: String,
    /// The path where the output netlist should be saved.
    ///
    /// Defaults to <cell>.spice in the current directory.
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// Directories to search for .ext files.
    #[arg(long = "path", default_value = ".")]
    search: Vec<PathBuf>,
    /// Output format.
    #[arg(long, default_value = "spice3")]
    format: SpiceFormat,
    /// Capacitance threshold in femtofarads, or "infinite".
    #[arg(long, default_value = "2", value_parser = parse_threshold)]
    cthresh: f64,
    /// Resistance threshold in ohms, or "infinite".
    #[arg(long, default_value = "infinite", value_parser = parse_threshold)]
    rthresh: f64,
    /// Parallel device merging.
    #[arg(long, default_value = "none", value_parser = parse_merge)]
    merge: MergeMode,
    /// Emit subcircuit calls for cells with ports instead of descending.
    #[arg(long, default_value = "on", value_parser = parse_on_off)]
    subcircuits: bool,
    /// Wrap the top cell in a .subckt record.
    #[arg(long, default_value = "auto", value_parser = parse_top)]
    top: TopMode,
    /// Write hierarchical output (one subcircuit per cell), e.g. for LVS.
    #[arg(long, default_value = "off", value_parser = parse_on_off)]
    hierarchy: bool,
    /// Emit abstract views as black-box subcircuit stubs.
    #[arg(long, default_value = "off", value_parser = parse_on_off)]
    blackbox: bool,
    /// Number instances X1, X2, ... instead of keeping instance names.
    #[arg(long, default_value = "off", value_parser = parse_on_off)]
    renumber: bool,
    /// Merge unconnected nets that share a global name.
    #[arg(long = "global", default_value = "on", value_parser = parse_on_off)]
    merge_names: bool,
    /// How to keep shorted ports apart.
    #[arg(long, default_value = "none", value_parser = parse_short)]
    short: ShortMode,
    /// Use a .option card for scaling instead of baking it into values.
    #[arg(long, default_value = "on", value_parser = parse_on_off)]
    scale: bool,
    /// Model resistor capacitance as a tee network.
    #[arg(long = "resistor-tee", default_value = "off", value_parser = parse_on_off)]
    resistor_tee: bool,
    /// Apply the conventional option combination for LVS.
    #[arg(long)]
    lvs: bool,
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

fn parse_top(s: &str) -> Result<TopMode, String> {
    match s.to_lowercase().as_str() {
        "on" | "yes" | "true" => Ok(TopMode::On),
        "off" | "no" | "false" => Ok(TopMode::Off),
        "auto" | "automatic" => Ok(TopMode::Auto),
        _ => Err("expected on, off, or auto".to_string()),
    }
}

fn parse_short(s: &str) -> Result<ShortMode, String> {
    match s.to_lowercase().as_str() {
        "none" => Ok(ShortMode::None),
        "resistor" => Ok(ShortMode::Resistor),
        "voltage" => Ok(ShortMode::Voltage),
        _ => Err("short types are none, resistor, and voltage".to_string()),
    }
}

impl Args {
    fn options(&self) -> SpiceOptions {
        if self.lvs {
            return SpiceOptions::lvs();
        }
        SpiceOptions {
            format: self.format,
            cap_threshold: self.cthresh,
            res_threshold: self.rthresh,
            merge: self.merge,
            subckts: self.subcircuits,
            top: self.top,
            hierarchy: self.hierarchy,
            blackbox: self.blackbox,
            renumber: self.renumber,
            merge_names: self.merge_names,
            short: self.short,
            scale_card: self.scale,
            resistor_tee: self.resistor_tee,
            ..SpiceOptions::default()
        }
    }
}

/// Runs the full read → flatten → emit pipeline.
pub fn exttospice(args: Args) -> anyhow::Result<()> {
    let opts = args.options();
    let out_path = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.spice", args.cell)));

    let mut sess = Session::new();
    let resolver = DirResolver::new(args.search.clone());
    let (root, read_issues) = read_hierarchy(&mut sess, &args.cell, &resolver)
        .with_context(|| format!("failed to read {}.ext", args.cell))?;

    let file = std::fs::File::create(&out_path)
        .with_context(|| format!("unable to open {} for writing", out_path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    let result = if opts.hierarchy {
        write_hier_spice(&mut sess, root, &opts, &args.cell, &mut out)
    } else {
        let (flat, wrapper) = prepare_flat(&mut sess, root, &opts);
        let mut issues = flat.issues.clone();
        write_flat_spice(&sess, &flat, &opts, &args.cell, wrapper, &mut out).map(|i| {
            issues.merge(&i);
            issues
        })
    };

    match result {
        Ok(mut issues) => {
            issues.merge(&read_issues);
            drop(out);
            if issues.has_fatal() {
                anyhow::bail!("netlist written with fatal errors");
            }
            if !issues.is_empty() {
                eprintln!("{} problems reported; see the log above.", issues.total());
            }
            Ok(())
        }
        Err(NetlistError::NamesTooLong { name }) => {
            // A partial deck with unusable names would only mislead.
            drop(out);
            let _ = std::fs::remove_file(&out_path);
            anyhow::bail!(
                "too many nodes in this circuit to be output as names ({name}); \
                 use the spice2 format instead"
            );
        }
        Err(e) => Err(e).with_context(|| format!("failed to write {}", out_path.display())),
    }
}
