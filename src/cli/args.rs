// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the log, clean and history subcommands over cached runs

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "headway")]
#[command(about = "Inspect and clean the task cache and run history of a workflow project")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,

    #[arg(
        long,
        global = true,
        help = "Project base directory holding the history file and cache",
        default_value = "."
    )]
    pub base_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the task records of one or more runs
    Log {
        #[arg(help = "Run name, session id prefix, or 'last'")]
        run: Option<String>,

        #[arg(short = 's', long = "sep", help = "Field separator", default_value = "\t")]
        separator: String,

        #[arg(
            short = 'f',
            long = "fields",
            help = "Comma-separated fields to print per record"
        )]
        fields: Option<String>,

        #[arg(
            short = 't',
            long = "template",
            help = "Template rendered once per record",
            conflicts_with = "fields"
        )]
        template: Option<String>,

        #[arg(
            short = 'l',
            long = "list-lines",
            help = "Lines fetched for stdout/stderr/log/env keys",
            default_value_t = 100
        )]
        list_lines: usize,

        #[arg(short = 'F', long = "filter", help = "Boolean predicate over record fields")]
        filter: Option<String>,

        #[arg(long, help = "Runs executed before the matching one")]
        before: Option<String>,

        #[arg(long, help = "Runs executed after the matching one")]
        after: Option<String>,

        #[arg(long, help = "All runs except the matching one")]
        but: Option<String>,
    },

    /// Delete cached work dirs, cache entries and history lines
    Clean {
        #[arg(help = "Run name, session id prefix, or 'last'")]
        run: Option<String>,

        #[arg(short = 'n', long = "dry-run", help = "Report what would be removed")]
        dry_run: bool,

        #[arg(short = 'f', long = "force", help = "Actually remove")]
        force: bool,

        #[arg(short = 'q', long = "quiet", help = "Suppress per-entry output")]
        quiet: bool,

        #[arg(long, help = "Runs executed before the matching one")]
        before: Option<String>,

        #[arg(long, help = "Runs executed after the matching one")]
        after: Option<String>,

        #[arg(long, help = "All runs except the matching one")]
        but: Option<String>,
    },

    /// Print the run history table
    History,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_args_parse() {
        let args = Args::parse_from([
            "headway", "log", "last", "-f", "folder,exit", "-F", "exit == 0",
        ]);
        match args.command {
            Commands::Log {
                run,
                fields,
                filter,
                list_lines,
                ..
            } => {
                assert_eq!(run.as_deref(), Some("last"));
                assert_eq!(fields.as_deref(), Some("folder,exit"));
                assert_eq!(filter.as_deref(), Some("exit == 0"));
                assert_eq!(list_lines, 100);
            }
            _ => panic!("expected log subcommand"),
        }
    }

    #[test]
    fn test_clean_args_parse() {
        let args = Args::parse_from(["headway", "clean", "-n", "--but", "last", "old_run"]);
        match args.command {
            Commands::Clean {
                run,
                dry_run,
                force,
                but,
                ..
            } => {
                assert_eq!(run.as_deref(), Some("old_run"));
                assert!(dry_run);
                assert!(!force);
                assert_eq!(but.as_deref(), Some("last"));
            }
            _ => panic!("expected clean subcommand"),
        }
    }

    #[test]
    fn test_fields_and_template_conflict() {
        let result =
            Args::try_parse_from(["headway", "log", "-f", "folder", "-t", "{{folder}}"]);
        assert!(result.is_err());
    }
}
