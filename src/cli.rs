//! Command-line surface (spec section 6): `boundary [flags] -- <command>
//! [args...]`. Parsed with `clap`'s derive API, matching the flag table
//! verbatim.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "boundary",
    about = "Runs a child command under an enforced, allow-listed network egress policy.",
    trailing_var_arg = true
)]
pub struct Cli {
    /// Adds one allow rule; repeatable. An empty set denies everything.
    #[arg(long = "allow", value_name = "SPEC")]
    pub allow: Vec<String>,

    /// Minimum level of log line to emit.
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn")]
    pub log_level: LogLevel,

    /// Use the environment-variable-only jailer instead of a privileged one.
    #[arg(long = "unprivileged")]
    pub unprivileged: bool,

    /// The child command and its arguments, after `--`.
    #[arg(required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}
