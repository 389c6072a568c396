mod commands;
mod terminal;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Vigil -- answers routine prompts of terminal coding agents.
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a shell on a supervised pseudo-terminal
    Run {
        /// Configuration file (defaults to ./vigil.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Process name of the program to supervise
        #[arg(long)]
        target: Option<String>,

        /// Write logs here instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Append supervisor events to this file as JSON lines
        #[arg(long)]
        events: Option<PathBuf>,

        /// Shell and arguments to run (defaults to $SHELL)
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Print the effective rule table in scan order
    Rules {
        /// Configuration file with custom rules
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show what a chunk of output would be classified as
    Classify {
        /// Configuration file with custom rules
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output text to classify; `\n`, `\r`, `\t` and `\e` are unescaped
        text: String,
    },
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run { log_file, .. } => log_file.as_deref(),
        _ => None,
    };
    init_tracing(log_file)?;

    match cli.command {
        Commands::Run {
            config,
            target,
            log_file: _,
            events,
            command,
        } => {
            let code = commands::run::run(commands::run::RunOptions {
                config,
                target,
                events,
                command,
            })?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Rules { config } => commands::rules::run(config.as_deref()),
        Commands::Classify { config, text } => commands::classify::run(config.as_deref(), &text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parse_run_defaults() {
        let cli = Cli::try_parse_from(["vigil", "run"]);
        assert!(cli.is_ok(), "should parse bare run: {cli:?}");
        match cli.unwrap().command {
            Commands::Run {
                config,
                target,
                log_file,
                events,
                command,
            } => {
                assert!(config.is_none());
                assert!(target.is_none());
                assert!(log_file.is_none());
                assert!(events.is_none());
                assert!(command.is_empty());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parse_run_with_shell() {
        let cli = Cli::try_parse_from([
            "vigil",
            "run",
            "--target",
            "codex",
            "--log-file",
            "/tmp/vigil.log",
            "--",
            "bash",
            "--norc",
        ]);
        assert!(cli.is_ok(), "should parse run with shell: {cli:?}");
        match cli.unwrap().command {
            Commands::Run {
                target,
                log_file,
                command,
                ..
            } => {
                assert_eq!(target.as_deref(), Some("codex"));
                assert_eq!(log_file, Some(PathBuf::from("/tmp/vigil.log")));
                assert_eq!(command, vec!["bash", "--norc"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parse_classify() {
        let cli = Cli::try_parse_from(["vigil", "classify", "Shall I proceed?"]);
        assert!(cli.is_ok(), "should parse classify: {cli:?}");
        match cli.unwrap().command {
            Commands::Classify { config, text } => {
                assert!(config.is_none());
                assert_eq!(text, "Shall I proceed?");
            }
            _ => panic!("expected Classify command"),
        }
    }

    #[test]
    fn cli_parse_rules_with_config() {
        let cli = Cli::try_parse_from(["vigil", "rules", "--config", "custom.toml"]);
        assert!(cli.is_ok(), "should parse rules: {cli:?}");
        match cli.unwrap().command {
            Commands::Rules { config } => {
                assert_eq!(config, Some(PathBuf::from("custom.toml")));
            }
            _ => panic!("expected Rules command"),
        }
    }

    #[test]
    fn cli_requires_text_for_classify() {
        assert!(Cli::try_parse_from(["vigil", "classify"]).is_err());
    }
}
