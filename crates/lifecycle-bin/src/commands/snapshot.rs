use std::path::PathBuf;
use std::process::Command;

use lifecycle_env::{Env, RootDirEnv};
use lifecycle_snapshot::{Snapshotter, SnapshotterOptions};
use miette::{Context, IntoDiagnostic};

use super::LayoutArg;

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// Directory that is watched for changes
    #[clap(long, env = "CNB_SNAPSHOT_ROOT")]
    root: PathBuf,

    /// Paths below the root that are never captured
    #[clap(long = "ignore", env = "CNB_SNAPSHOT_IGNORE", value_delimiter = ',')]
    ignored_paths: Vec<PathBuf>,

    /// Where to write the layer archive
    #[clap(short, long, env = "CNB_SNAPSHOT_OUTPUT")]
    output: PathBuf,

    /// Also ignore every mount point below the root
    #[clap(long, env = "CNB_DETECT_MOUNTS")]
    detect_mounts: bool,

    /// Name entries for this layout, `windows` writes split `Hives`/`Files`
    /// names
    #[clap(long, value_enum, default_value = "posix", env = "CNB_SNAPSHOT_LAYOUT")]
    layout: LayoutArg,

    /// Layer directories whose `bin`, `lib`, ... and `env` directories are
    /// added to the environment of the build command
    #[clap(long = "layer", env = "CNB_SNAPSHOT_LAYERS", value_delimiter = ',')]
    layers: Vec<PathBuf>,

    /// The build command and its arguments
    #[clap(required = true, last = true)]
    command: Vec<String>,
}

pub fn snapshot(opt: Opt) -> miette::Result<()> {
    let options = SnapshotterOptions {
        root_dir: opt.root.clone(),
        ignored_paths: opt.ignored_paths,
        detect_filesystem_ignore_list: opt.detect_mounts,
        split_layout: opt.layout == LayoutArg::Windows,
    };
    let mut snapshotter = Snapshotter::from_options(options);
    snapshotter
        .init()
        .into_diagnostic()
        .context("Failed to record the initial state")?;

    let mut env = Env::build(std::env::vars_os().filter_map(|(key, value)| {
        Some(format!("{}={}", key.to_str()?, value.to_str()?))
    }));
    for layer in &opt.layers {
        env.add_root_dir(layer)
            .into_diagnostic()
            .with_context(|| format!("Failed to add layer: {}", layer.display()))?;
        env.add_env_dir(&layer.join("env"))
            .into_diagnostic()
            .with_context(|| format!("Failed to read environment of: {}", layer.display()))?;
    }

    let (program, args) = opt
        .command
        .split_first()
        .ok_or_else(|| miette::miette!("No build command given"))?;
    tracing::info!("running {}", opt.command.join(" "));
    let status = Command::new(program)
        .args(args)
        .current_dir(&opt.root)
        .env_clear()
        .envs(env.vars())
        .status()
        .into_diagnostic()
        .with_context(|| format!("Failed to run {program}"))?;
    if !status.success() {
        miette::bail!("{program} failed with {status}");
    }

    let summary = snapshotter
        .take_snapshot(&opt.output)
        .into_diagnostic()
        .context("Failed to snapshot the changes")?;

    println!(
        "{} Successfully captured layer",
        console::style("✓").green(),
    );
    println!("  Archive: {}", opt.output.display());
    println!("  Added: {}", summary.added);
    println!("  Modified: {}", summary.modified);
    println!("  Deleted: {}", summary.deleted);
    println!("  Entries: {}", summary.entries);

    Ok(())
}
