// ABOUTME: Main application orchestration for the headway CLI
// ABOUTME: Coordinates logging setup and command dispatch

use anyhow::Result;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use super::{clean, log, Args, Commands};

pub struct App;

impl App {
    pub fn new() -> Self {
        Self
    }

    /// Initialize logging based on the global flags.
    pub fn init_logging(&self, verbose: bool, no_color: bool) {
        let level = if verbose { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        let _ = tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .with_ansi(!no_color)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();

        debug!("Logging initialized with level: {}", level);
    }

    /// Run the application with parsed arguments.
    pub async fn run(&self, args: Args) -> Result<()> {
        self.init_logging(args.verbose, args.no_color);

        match args.command {
            Commands::Log {
                run,
                separator,
                fields,
                template,
                list_lines,
                filter,
                before,
                after,
                but,
            } => {
                log::run_log(
                    &args.base_dir,
                    run,
                    separator,
                    fields,
                    template,
                    list_lines,
                    filter,
                    before,
                    after,
                    but,
                )
                .await
            }

            Commands::Clean {
                run,
                dry_run,
                force,
                quiet,
                before,
                after,
                but,
            } => {
                clean::run_clean(
                    &args.base_dir,
                    run,
                    dry_run,
                    force,
                    quiet,
                    before,
                    after,
                    but,
                )
                .await
            }

            Commands::History => log::run_history(&args.base_dir),
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
