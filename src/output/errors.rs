// Human-readable error messages for Cumin

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // Check NO_COLOR environment variable first (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Errors are written to stderr
    std::io::stderr().is_terminal()
}

/// All error types in Cumin.
///
/// Host-scoped failures (a command failing or timing out on a node) are not
/// errors: they are aggregated into the run's success ratio by the scheduler.
/// Everything that does surface through the call stack is one of these.
#[derive(Debug)]
pub enum CuminError {
    /// Malformed or unreadable configuration, fatal at startup
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Syntactic error in a query string
    Parse(Box<ParseError>),

    /// An alias references itself, directly or through other aliases
    CyclicAlias { alias: String, path: Vec<String> },

    /// An alias is not present in the aliases table
    UnknownAlias { alias: String },

    /// A backend rejected its query payload
    InvalidQuery {
        backend: &'static str,
        message: String,
    },

    /// I/O failure while a backend was resolving hosts
    BackendUnreachable {
        backend: &'static str,
        message: String,
    },

    /// A backend's credentials were rejected
    BackendAuth {
        backend: &'static str,
        message: String,
    },

    /// Executor misuse: no hosts, no commands, invalid parameters
    Worker {
        message: String,
        suggestion: Option<String>,
    },

    /// An invalid node state transition was attempted
    StateTransition { current: String, requested: String },

    /// Failure in the transport layer while reaching a host
    Transport {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// I/O errors outside the backends (files, log setup)
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// The whole run exceeded the global timeout
    GlobalTimeout { duration_secs: u64 },

    /// User-initiated interruption
    Cancelled,
}

/// Parse error details with position info when available
#[derive(Debug)]
pub struct ParseError {
    pub message: String,
    pub query: String,
    pub position: Option<usize>,
    pub suggestion: Option<String>,
}

impl CuminError {
    /// Shorthand used by the query layer and the parsers
    pub fn parse(message: impl Into<String>, query: impl Into<String>) -> Self {
        CuminError::Parse(Box::new(ParseError {
            message: message.into(),
            query: query.into(),
            position: None,
            suggestion: None,
        }))
    }
}

impl std::error::Error for CuminError {}

impl fmt::Display for CuminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let use_colors = should_use_colors();
        if !use_colors {
            colored::control::set_override(false);
        }

        match self {
            CuminError::Config { message, path } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            CuminError::Parse(err) => {
                writeln!(f, "{}: {}", "PARSE ERROR".red().bold(), err.message)?;
                writeln!(f, "  {} {}", "Query:".dimmed(), err.query)?;

                if let Some(pos) = err.position {
                    // Caret under the offending character, aligned with the Query: prefix
                    let spaces = " ".repeat(9 + pos);
                    writeln!(f, "{}{}", spaces, "^".red())?;
                }

                if let Some(ref suggestion) = err.suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            CuminError::CyclicAlias { alias, path } => {
                writeln!(
                    f,
                    "{}: alias '{}' expands to itself",
                    "CYCLIC ALIAS".red().bold(),
                    alias
                )?;
                writeln!(f, "  {} {}", "Chain:".dimmed(), path.join(" -> "))?;
                Ok(())
            }

            CuminError::UnknownAlias { alias } => {
                writeln!(
                    f,
                    "{}: no replacement for alias '{}'",
                    "UNKNOWN ALIAS".red().bold(),
                    alias
                )?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: define it in aliases.yaml next to the configuration file",
                    "Hint".yellow().bold()
                )?;
                Ok(())
            }

            CuminError::InvalidQuery { backend, message } => {
                writeln!(f, "{}: {}", "INVALID QUERY".red().bold(), message)?;
                writeln!(f, "  {} {}", "Backend:".dimmed(), backend)?;
                Ok(())
            }

            CuminError::BackendUnreachable { backend, message } => {
                writeln!(f, "{}: {}", "BACKEND UNREACHABLE".red().bold(), message)?;
                writeln!(f, "  {} {}", "Backend:".dimmed(), backend)?;
                Ok(())
            }

            CuminError::BackendAuth { backend, message } => {
                writeln!(f, "{}: {}", "BACKEND AUTH".red().bold(), message)?;
                writeln!(f, "  {} {}", "Backend:".dimmed(), backend)?;
                Ok(())
            }

            CuminError::Worker {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "WORKER ERROR".red().bold(), message)?;
                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            CuminError::StateTransition { current, requested } => {
                writeln!(
                    f,
                    "{}: cannot move a node from '{}' to '{}'",
                    "STATE ERROR".red().bold(),
                    current,
                    requested
                )?;
                Ok(())
            }

            CuminError::Transport {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "TRANSPORT ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            CuminError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            CuminError::GlobalTimeout { duration_secs } => {
                writeln!(
                    f,
                    "{}: the whole run exceeded {}s",
                    "GLOBAL TIMEOUT".red().bold(),
                    duration_secs
                )?;
                Ok(())
            }

            CuminError::Cancelled => {
                writeln!(f, "{}: execution interrupted", "CANCELLED".red().bold())?;
                Ok(())
            }
        }
    }
}

/// Helper used by the executor validators, mirrors the property setters
pub fn worker_error(property: &str, message: &str) -> CuminError {
    CuminError::Worker {
        message: format!("{} {}", property, message),
        suggestion: None,
    }
}
