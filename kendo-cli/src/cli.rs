use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "kendo")]
#[command(about = "Log in to a Kendo tournament manager backend and keep the session alive")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend root URL
    #[arg(long, global = true, env = "KENDO_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Renew this many milliseconds before the token expires
    #[arg(long, global = true)]
    pub margin_ms: Option<u64>,

    /// File the session is persisted to
    #[arg(long, global = true)]
    pub session_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate and persist the issued session
    Login {
        /// Account name
        #[arg(short, long, env = "KENDO_USERNAME")]
        username: Option<String>,

        /// Password; read from stdin when omitted
        #[arg(short, long, env = "KENDO_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Keep running and renew the session after logging in
        #[arg(long)]
        stay: bool,
    },

    /// Resume the persisted session and keep renewing it until interrupted
    Run,

    /// Show the persisted session
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value = "pretty")]
        output: OutputFormat,
    },

    /// Close the session and remove everything persisted for it
    Logout,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "kendo",
            "status",
            "--output",
            "json",
            "--margin-ms",
            "5000",
            "--session-file",
            "/tmp/session.json",
        ])
        .unwrap();

        assert_eq!(args.margin_ms, Some(5_000));
        assert_eq!(args.session_file, Some(PathBuf::from("/tmp/session.json")));
        assert!(matches!(
            args.command,
            Commands::Status {
                output: OutputFormat::Json
            }
        ));
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["kendo", "-v", "-q", "logout"]).is_err());
    }
}
