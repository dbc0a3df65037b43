use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "heapcheck")]
#[command(about = "Inspect and compare heap dumps written by heap-checked programs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List heap dumps in a directory
    List {
        /// Directory to search (defaults to the system temp directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show totals and the largest call sites of one dump
    Summary {
        /// Heap dump file
        dump: PathBuf,

        /// Number of call sites to display
        #[arg(long, short = 'n', default_value = "10")]
        top: usize,
    },

    /// Compare a begin dump with an end dump, call site by call site
    Diff {
        /// Dump taken when the checker started
        begin: PathBuf,

        /// Dump taken when the checker was verified
        end: PathBuf,

        /// Report any change, not just growth
        #[arg(long)]
        same_heap: bool,

        /// Number of call sites to display
        #[arg(long, short = 'n', default_value = "20")]
        top: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Command::Summary { top: 0, .. } | Command::Diff { top: 0, .. } => {
                Err("--top must be at least 1".to_string())
            }
            Command::Diff { begin, end, .. } if begin == end => Err(format!(
                "begin and end are the same file: {}",
                begin.display()
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_diff() {
        let cli = Cli::parse_from(["heapcheck", "diff", "a.heap", "b.heap", "--same-heap", "-n", "5"]);
        match cli.command {
            Command::Diff {
                same_heap, top, json, ..
            } => {
                assert!(same_heap);
                assert_eq!(top, 5);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn rejects_same_file_diff() {
        let cli = Cli::parse_from(["heapcheck", "diff", "a.heap", "a.heap"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn rejects_zero_top() {
        let cli = Cli::parse_from(["heapcheck", "summary", "a.heap", "--top", "0"]);
        assert!(cli.validate().is_err());
    }
}
