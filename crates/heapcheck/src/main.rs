use anyhow::Context;
use clap::Parser;
use heapcheck::cli::{Cli, Command};
use heapcheck::error::exit_code;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(heapcheck_err) = e.downcast_ref::<heapcheck::Error>() {
                ExitCode::from(heapcheck_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    // Validate CLI arguments
    cli.validate()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid arguments")?;

    match cli.command {
        Command::List { dir } => {
            heapcheck::commands::list::run(dir.as_deref())?;
        }
        Command::Summary { dump, top } => {
            heapcheck::commands::summary::run(&dump, top)
                .with_context(|| format!("cannot summarize {}", dump.display()))?;
        }
        Command::Diff {
            begin,
            end,
            same_heap,
            top,
            json,
        } => {
            let differ = heapcheck::commands::diff::run(&begin, &end, same_heap, top, json)
                .with_context(|| format!("cannot compare {} with {}", begin.display(), end.display()))?;
            if differ {
                return Ok(exit_code::LEAKS_FOUND);
            }
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "heapcheck", &mut std::io::stdout());
        }
    }

    Ok(exit_code::SUCCESS)
}
