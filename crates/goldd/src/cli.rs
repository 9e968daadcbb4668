use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Gold blame and triage server")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .gold/config.toml"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Serve the JSON API (the default).
    Serve(ServeArgs),
    /// Print blame groups for one corpus as JSON.
    #[command(name = "byblame")]
    ByBlame(ByBlameArgs),
    /// Print a page of the triage log as JSON.
    Log(LogArgs),
    /// Reverse a triage record.
    Undo(UndoArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Args)]
pub struct ServeArgs {
    #[arg(long, help = "Override [server] bind from the config")]
    pub bind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ByBlameArgs {
    #[arg(long, help = "Corpus (source_type) to group")]
    pub corpus: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ScopeArgs {
    #[arg(long, help = "Changelist id; omit or 0 for the primary branch")]
    pub issue: Option<String>,

    #[arg(long, help = "Code review system of the changelist")]
    pub crs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LogArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    #[arg(long, default_value_t = gold_web::DEFAULT_LOG_PAGE_SIZE)]
    pub size: usize,

    #[arg(long, help = "Include per-digest details")]
    pub details: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct UndoArgs {
    #[arg(long, help = "Triage record id to reverse")]
    pub id: String,

    #[arg(long, help = "User recorded as the author of the undo")]
    pub user: String,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn no_subcommand_defaults_to_serving() {
        let cli = Cli::try_parse_from(["goldd", "--workspace", "/tmp/gold"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.workspace, PathBuf::from("/tmp/gold"));
        assert_eq!(cli.log_format, LogFormat::Human);
    }

    #[test]
    fn log_subcommand_parses_scope_and_paging() {
        let cli = Cli::try_parse_from([
            "goldd",
            "log",
            "--issue",
            "42",
            "--crs",
            "gerrit",
            "--size",
            "5",
            "--details",
            "--log-format",
            "json",
        ])
        .expect("log should parse");

        assert_eq!(cli.log_format.as_str(), "json");
        match cli.command {
            Some(Commands::Log(args)) => {
                assert_eq!(args.scope.issue.as_deref(), Some("42"));
                assert_eq!(args.scope.crs.as_deref(), Some("gerrit"));
                assert_eq!(args.offset, 0);
                assert_eq!(args.size, 5);
                assert!(args.details);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn undo_requires_id_and_user() {
        assert!(Cli::try_parse_from(["goldd", "undo", "--id", "3"]).is_err());
        let cli = Cli::try_parse_from(["goldd", "undo", "--id", "3", "--user", "dev@example.com"])
            .expect("undo should parse");
        assert_eq!(
            cli.command,
            Some(Commands::Undo(UndoArgs {
                id: "3".to_owned(),
                user: "dev@example.com".to_owned(),
            }))
        );
    }

    #[test]
    fn byblame_subcommand_takes_a_corpus() {
        let cli = Cli::try_parse_from(["goldd", "byblame", "--corpus", "gm"]).expect("parse");
        assert_eq!(
            cli.command,
            Some(Commands::ByBlame(ByBlameArgs {
                corpus: "gm".to_owned(),
            }))
        );
    }

    #[test]
    fn invalid_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["goldd", "--log-format", "xml"]).is_err());
    }
}
