use std::io::BufReader;
use std::path::PathBuf;

use fs_err as fs;
use lifecycle_archive::{Extractor, Platform};
use miette::{Context, IntoDiagnostic};

use super::LayoutArg;

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// Path to the layer archive (an uncompressed tar file)
    #[clap(required = true)]
    archive: PathBuf,

    /// Directory the layer is applied to
    #[clap(short, long, env = "CNB_EXTRACT_DESTINATION")]
    destination: Option<PathBuf>,

    /// Layout rules to apply, defaults to the layout of this machine
    #[clap(long, value_enum, env = "CNB_EXTRACT_LAYOUT")]
    layout: Option<LayoutArg>,
}

pub fn extract(opt: Opt) -> miette::Result<()> {
    let platform = opt.layout.map_or_else(Platform::current, Platform::from);
    let file = fs::File::open(&opt.archive).into_diagnostic()?;

    let summary = Extractor::new(platform)
        .extract(BufReader::new(file), opt.destination.as_deref())
        .into_diagnostic()
        .with_context(|| format!("Failed to extract layer: {}", opt.archive.display()))?;

    println!(
        "{} Successfully extracted layer",
        console::style("✓").green(),
    );
    println!("  Files: {}", summary.files);
    println!("  Directories: {}", summary.directories);
    println!("  Links: {}", summary.links);
    println!("  Whiteouts: {}", summary.whiteouts);

    Ok(())
}
