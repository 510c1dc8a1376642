//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use console::style;

use crate::application::RunSummary;
use crate::domain::models::record::ClassificationLevel;
use crate::services::history::IterationHistory;

/// Process exit codes.
pub const EXIT_OK: i32 = 0;
/// Fatal infrastructure error.
pub const EXIT_FATAL: i32 = 1;
/// Cancelled by signal.
pub const EXIT_CANCELLED: i32 = 130;

/// Autonomous discovery engine for Taiwan-market trading strategies.
#[derive(Parser, Debug)]
#[command(name = "alphaloop", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the learning loop.
    Run {
        /// Iteration budget for this run.
        #[arg(long)]
        max_iterations: Option<u64>,

        /// Configuration file (defaults to the .alphaloop/ chain).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Continue an existing history file.
        #[arg(long)]
        resume: bool,

        /// History file location override.
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Summarize an existing history file.
    Summary {
        /// History file location override.
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

/// Render the final run summary as a table.
pub fn render_run_summary(summary: &RunSummary) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Outcome", "Count"]);
    for (level, count) in ClassificationLevel::ALL.iter().zip(summary.level_counts) {
        table.add_row(vec![Cell::new(level.as_str()), Cell::new(count)]);
    }
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} iterations in {:.1}s\n",
        style("Run complete:").bold(),
        summary.iterations_run,
        summary.wall_time.as_secs_f64()
    ));
    out.push_str(&table.to_string());
    out.push('\n');
    match summary.best_sharpe {
        Some(sharpe) => out.push_str(&format!("Best Sharpe seen: {sharpe:.3}\n")),
        None => out.push_str("Best Sharpe seen: none (no metrics produced)\n"),
    }
    match summary.champion_sharpe {
        Some(sharpe) => out.push_str(&format!("Champion Sharpe: {sharpe:.3}\n")),
        None => out.push_str("Champion: none\n"),
    }
    if summary.cancelled {
        out.push_str(&format!("{}\n", style("Cancelled by signal").yellow()));
    }
    out
}

/// Summarize a history file on disk without running anything.
pub fn render_history_summary(path: &std::path::Path) -> anyhow::Result<String> {
    let history = IterationHistory::open(path)?;
    let mut counts = [0u64; 4];
    let mut best: Option<f64> = None;
    for record in history.iter_all() {
        let idx = match record.classification_level {
            ClassificationLevel::Level0Failed => 0,
            ClassificationLevel::Level1Executed => 1,
            ClassificationLevel::Level2Valid => 2,
            ClassificationLevel::Level3Acceptable => 3,
        };
        counts[idx] += 1;
        if let Some(metrics) = &record.metrics {
            best = Some(best.map_or(metrics.sharpe_ratio, |b: f64| b.max(metrics.sharpe_ratio)));
        }
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Outcome", "Count"]);
    for (level, count) in ClassificationLevel::ALL.iter().zip(counts) {
        table.add_row(vec![Cell::new(level.as_str()), Cell::new(count)]);
    }
    let mut out = format!("{} records in {}\n", history.len(), path.display());
    out.push_str(&table.to_string());
    out.push('\n');
    if let Some(best) = best {
        out.push_str(&format!("Best Sharpe: {best:.3}\n"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::parse_from([
            "alphaloop",
            "run",
            "--max-iterations",
            "5",
            "--resume",
            "--history",
            "/tmp/h.jsonl",
        ]);
        let Commands::Run {
            max_iterations,
            resume,
            history,
            config,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(max_iterations, Some(5));
        assert!(resume);
        assert_eq!(history, Some(PathBuf::from("/tmp/h.jsonl")));
        assert!(config.is_none());
    }

    #[test]
    fn test_summary_renders_counts() {
        let summary = RunSummary {
            iterations_run: 3,
            level_counts: [1, 0, 2, 0],
            best_sharpe: Some(1.234),
            champion_sharpe: Some(1.234),
            wall_time: std::time::Duration::from_secs(2),
            cancelled: false,
        };
        let text = render_run_summary(&summary);
        assert!(text.contains("level_2_valid"));
        assert!(text.contains("1.234"));
    }
}
