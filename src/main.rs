use std::process;

use anyhow::{Context, Result};
use tracing::warn;

use boxbuild::build::{BuildRunner, Outcome};
use boxbuild::config;
use boxbuild::docker::{self, CancelToken, CliEngine};
use boxbuild::{interrupt, logging};

fn main() {
    logging::init();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    process::exit(code);
}

fn run() -> Result<i32> {
    let cwd = std::env::current_dir().context("failed to determine working directory")?;
    let cfg = config::load(&cwd)?;

    let mut run_args = Vec::new();
    if cfg.run_as_invoking_user {
        run_args.extend(docker::user_args());
    }
    let engine = CliEngine::new(&cfg.engine)?
        .with_run_args(run_args)
        .with_build_command(cfg.command.clone())
        .with_timeout(cfg.timeout());

    let cancel = CancelToken::new();
    interrupt::install(cancel.clone())?;

    let runner = BuildRunner::new(&engine, &cfg, &cwd).with_cancel(cancel);
    let output_dir = runner.output_dir();
    let (outcome, report) = runner.run_with_report();

    if let Some(path) = &cfg.report
        && let Err(e) = report.write(&cwd.join(path))
    {
        warn!(error = %e, "could not write run report");
    }

    match &outcome {
        Outcome::Success => {
            println!(
                "Build completed successfully. Artifacts are in {}",
                output_dir.display()
            );
        }
        Outcome::Failure(e) => eprintln!("error: {e}"),
    }
    Ok(outcome.exit_code())
}
