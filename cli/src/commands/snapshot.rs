//! `toolgear snapshot`: merge, diff and summarize saved databases

use crate::{output, report};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use toolgear_client::ProgramDatabase;
use toolgear_shared::types::program::StatKind;
use tracing::debug;

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub command: SnapshotCommand,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Sum several snapshots of the same program into one
    Merge {
        /// Snapshots to merge (.json or .mdb)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output snapshot
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show what changed between two snapshots (other minus base)
    Diff {
        /// Baseline snapshot
        base: PathBuf,

        /// Snapshot compared against the baseline
        other: PathBuf,

        #[command(flatten)]
        view: ViewArgs,

        /// Also write the difference as a snapshot
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print roll-up statistics for a snapshot
    Stats {
        /// Snapshot to summarize
        input: PathBuf,

        #[command(flatten)]
        view: ViewArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ViewArgs {
    /// Only this data attribute (default: all)
    #[arg(short, long)]
    pub attr: Option<String>,

    /// Statistic over each entry's values (sum, mean, max, min, count, stddev)
    #[arg(long)]
    pub per_entry: Option<StatKind>,

    /// Statistic over entries, functions and files
    #[arg(long)]
    pub rollup: Option<StatKind>,

    /// Rows per table
    #[arg(long, default_value = "10")]
    pub top: usize,

    /// Print JSON instead of tables
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: SnapshotArgs) -> Result<()> {
    match args.command {
        SnapshotCommand::Merge { inputs, output: out } => merge(&inputs, &out),
        SnapshotCommand::Diff {
            base,
            other,
            view,
            output: out,
        } => {
            let mut db = diff(&base, &other)?;
            if let Some(path) = out {
                db.write_snapshot(&path)?;
                output::success(&format!("Difference written to {}", path.display()));
            }
            show(&mut db, &view, true)
        }
        SnapshotCommand::Stats { input, view } => {
            let mut db = load(&input)?;
            show(&mut db, &view, false)
        }
    }
}

fn load(path: &Path) -> Result<ProgramDatabase> {
    let mut db = ProgramDatabase::default();
    db.add_snapshot(path, 1)
        .with_context(|| format!("Failed to load snapshot {}", path.display()))?;
    Ok(db)
}

/// Merge every input into one database and write it out.
pub fn merge(inputs: &[PathBuf], out: &Path) -> Result<()> {
    let pb = ProgressBar::new(inputs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );

    let mut db = ProgramDatabase::default();
    let mut skipped = 0;
    for path in inputs {
        pb.set_message(path.display().to_string());
        let report = db
            .add_snapshot(path, 1)
            .with_context(|| format!("Failed to merge snapshot {}", path.display()))?;
        debug!("merged {} ({} values)", path.display(), report.values);
        skipped += report.skipped_messages;
        pb.inc(1);
    }
    pb.finish_and_clear();

    db.write_snapshot(out)?;
    if skipped > 0 {
        output::warning(&format!("{} messages were not merged", skipped));
    }
    output::success(&format!(
        "Merged {} snapshots into {}",
        inputs.len(),
        out.display()
    ));
    Ok(())
}

/// `other - base`, as a database of its own.
pub fn diff(base: &Path, other: &Path) -> Result<ProgramDatabase> {
    let mut db = load(other)?;
    db.add_snapshot(base, -1)
        .with_context(|| format!("Failed to subtract snapshot {}", base.display()))?;
    Ok(db)
}

fn show(db: &mut ProgramDatabase, view: &ViewArgs, as_diff: bool) -> Result<()> {
    let summaries = match &view.attr {
        Some(attr) => vec![report::summarize(db, attr, view.per_entry, view.rollup)?],
        None => {
            let attrs: Vec<String> = db.data_attrs().iter().map(|a| a.tag.clone()).collect();
            attrs
                .iter()
                .map(|attr| report::summarize(db, attr, view.per_entry, view.rollup))
                .collect::<Result<Vec<_>>>()?
        }
    };

    if view.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        output::info("Snapshot declares no data attributes");
    }
    for summary in &summaries {
        output::print_summary(summary, view.top, as_diff);
    }
    Ok(())
}
