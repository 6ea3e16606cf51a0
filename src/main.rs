mod args;
mod tee;

use crate::args::{Commands, ARGS};
use itertools::Itertools;
use log::{info, warn, LevelFilter};
use sqlcover::{CodeCoverage, CoverageResult, Severity};
use std::fs::File;
use std::time::Instant;
use tee::Tee;

pub type ResultT<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> ResultT<()> {
    let start = Instant::now();

    let log_target = Box::new(Tee::new(std::io::stdout(), File::create(&ARGS.log_file)?));

    // Logger Setup
    env_logger::Builder::new()
        .filter_level(if ARGS.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .target(env_logger::Target::Pipe(log_target))
        .format_level(true)
        .format_timestamp_secs()
        .try_init()?;

    let mut coverage = CodeCoverage::connect(ARGS.coverage_config()?)?;
    info!(
        "Measuring '{}' on '{}'",
        coverage.config().database,
        coverage.config().connection.server
    );

    let result = match &ARGS.command {
        Commands::Cover { command } => coverage.cover(command),
        Commands::Workload {
            exe,
            args,
            working_dir,
        } => coverage.cover_workload(exe, args, working_dir.as_deref()),
    };
    report(&result, !ARGS.verbose);

    let duration = start.elapsed();
    info!("Total time taken: {} milliseconds", duration.as_millis());

    Ok(())
}

/// Diagnostics were already logged as they happened when `verbose` is set.
fn report(result: &CoverageResult, list_diagnostics: bool) {
    for object in result
        .objects
        .values()
        .sorted_by(|a, b| a.stats.percentage.total_cmp(&b.stats.percentage))
    {
        info!(
            "{:<10} {:<50} {}",
            object.kind.to_string(),
            object.name,
            object.stats
        );
    }

    let summary = &result.correlation;
    info!(
        "Trace events: {} read, {} matched, {} discarded, {} unmapped",
        summary.events, summary.matched, summary.discarded, summary.unmapped
    );
    let errors = result
        .diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    if list_diagnostics {
        for d in &result.diagnostics {
            warn!("{}", d);
        }
    }
    if !result.diagnostics.is_empty() {
        warn!(
            "{} diagnostics ({} errors) recorded during the run",
            result.diagnostics.len(),
            errors
        );
    }
    info!("Overall coverage: {}", result.overall);
}
