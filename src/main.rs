// Cumin CLI - execute commands on hosts selected by a query

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cumin::backends::BackendRegistry;
use cumin::config::{Config, DEFAULT_CONFIG_PATH};
use cumin::executor::{new_transport, Command, Mode, Scheduler, SchedulerConfig, Target};
use cumin::nodeset::NodeSet;
use cumin::output::errors::CuminError;
use cumin::output::{
    create_event_channel, spawn_reporter, GroupedReporter, JsonReporter, Reporter, TxtReporter,
};
use cumin::query::Query;

/// Batch size as an absolute count or a percentage of the matched hosts
#[derive(Debug, Clone, Copy)]
enum BatchSize {
    Absolute(usize),
    Ratio(f64),
}

fn parse_batch_size(value: &str) -> Result<BatchSize, String> {
    if let Some(percent) = value.strip_suffix('%') {
        let percent: u32 = percent
            .parse()
            .map_err(|_| format!("'{}' is not a valid percentage", value))?;
        if percent == 0 || percent > 100 {
            return Err(format!(
                "'{}' is not a valid percentage, expected in range 1%-100%",
                value
            ));
        }
        Ok(BatchSize::Ratio(f64::from(percent) / 100.0))
    } else {
        let size: usize = value
            .parse()
            .map_err(|_| format!("'{}' is not a valid batch size", value))?;
        if size == 0 {
            return Err(format!(
                "'{}' is not a valid batch size, expected a positive integer or a percentage",
                value
            ));
        }
        Ok(BatchSize::Absolute(size))
    }
}

#[derive(Parser)]
#[command(
    name = "cumin",
    about = "Automation and orchestration framework",
    version,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Global timeout in seconds for the whole execution
    #[arg(long)]
    global_timeout: Option<u64>,

    /// Timeout in seconds for the execution of every command on each host
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Execution mode (sync or async), required when there are multiple
    /// commands. In sync mode each command must reach the success percentage
    /// across the fleet before the next one starts; in async mode every host
    /// runs the whole list independently, stopping at its first failure.
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<Mode>,

    /// Percentage threshold to consider the execution successful
    #[arg(short = 'p', long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(0..=100))]
    success_percentage: u8,

    /// Execute with a sliding batch of this size, an absolute number (10)
    /// or a percentage of the matched hosts (50%)
    #[arg(short, long, value_parser = parse_batch_size)]
    batch_size: Option<BatchSize>,

    /// Seconds to sleep before starting the execution on the next host
    /// when a batch size is set
    #[arg(short = 's', long)]
    batch_sleep: Option<f64>,

    /// USE WITH CAUTION! Treat any executed command as successful,
    /// ignoring the exit codes
    #[arg(short = 'x', long)]
    ignore_exit_codes: bool,

    /// Output format (txt or json), only with a single command
    #[arg(short, long)]
    output: Option<String>,

    /// USE WITH CAUTION! Execute without confirmation of the affected hosts
    #[arg(long)]
    force: bool,

    /// Override the default backend for this execution
    #[arg(long)]
    backend: Option<String>,

    /// Override the configured transport for this execution
    #[arg(long)]
    transport: Option<String>,

    /// Do not execute, just print the matching hosts
    #[arg(long)]
    dry_run: bool,

    /// Set log level to DEBUG
    #[arg(short, long)]
    debug: bool,

    /// Set log level to TRACE, intended for development debugging
    #[arg(long)]
    trace: bool,

    /// Hosts selection query
    #[arg(value_name = "HOSTS_QUERY")]
    hosts: String,

    /// Commands to execute; with none, --dry-run is implied
    #[arg(value_name = "COMMAND")]
    commands: Vec<String>,
}

fn parse_mode(value: &str) -> Result<Mode, String> {
    value.parse().map_err(|_| {
        format!("'{}' is not a valid mode, expected 'sync' or 'async'", value)
    })
}

fn stderr(message: impl AsRef<str>) {
    eprintln!("{}", message.as_ref().yellow());
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let mut cli = Cli::parse();

    // Validation and defaults
    match cli.commands.len() {
        0 => cli.dry_run = true,
        1 => {
            if cli.mode.is_none() {
                cli.mode = Some(Mode::Sync);
            }
        }
        _ => {
            if cli.mode.is_none() {
                stderr("-m/--mode is required when there are multiple commands");
                return 3;
            }
            if cli.output.is_some() {
                stderr("-o/--output can be used only with one command");
                return 3;
            }
        }
    }

    if let Some(format) = &cli.output {
        if format != "txt" && format != "json" {
            stderr(format!("invalid output format '{}', expected txt or json", format));
            return 3;
        }
    }

    if cli.ignore_exit_codes {
        stderr("IGNORE EXIT CODES mode enabled, all commands executed will be considered successful");
    }

    // Setup
    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprint!("{}", e);
            return 3;
        }
    };

    if let Some(backend) = &cli.backend {
        config.default_backend = Some(backend.clone());
    }
    if let Some(transport) = &cli.transport {
        config.transport = Some(transport.clone());
    }

    let _log_guard = match setup_logging(&config, cli.debug, cli.trace) {
        Ok(guard) => guard,
        Err(e) => {
            eprint!("{}", e);
            return 3;
        }
    };

    if let Err(e) = ensure_kerberos_ticket(&config) {
        eprint!("{}", e);
        return 3;
    }

    info!(query = %cli.hosts, commands = ?cli.commands, "cumin called");

    // Execution
    match execute(&cli, &config).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            eprint!("{}", e);
            match e {
                CuminError::Cancelled => 98,
                _ => 99,
            }
        }
    }
}

async fn execute(cli: &Cli, config: &Config) -> Result<i32, CuminError> {
    let registry = BackendRegistry::with_builtins(config)?;
    let query = Query::new(config, registry);

    let hosts = get_hosts(cli, &query).await?;
    if hosts.is_empty() {
        return Ok(0);
    }

    let mut target = Target::new(hosts)?;
    match cli.batch_size {
        Some(BatchSize::Absolute(size)) => target = target.with_batch_size(size)?,
        Some(BatchSize::Ratio(ratio)) => target = target.with_batch_size_ratio(ratio)?,
        None => {}
    }
    if let Some(sleep) = cli.batch_sleep {
        target = target.with_batch_sleep(Duration::from_secs_f64(sleep));
    }

    let mut commands = Vec::with_capacity(cli.commands.len());
    for text in &cli.commands {
        let mut command = Command::new(text.clone())?;
        if let Some(timeout) = cli.timeout {
            command = command.with_timeout(Duration::from_secs(timeout))?;
        }
        if cli.ignore_exit_codes {
            command = command.with_ok_codes(Vec::new())?;
        }
        commands.push(command);
    }

    let scheduler_config = SchedulerConfig {
        mode: cli.mode.unwrap_or(Mode::Sync),
        fanout: config.clustershell.fanout,
        success_threshold: f64::from(cli.success_percentage) / 100.0,
        global_timeout: cli.global_timeout.map(Duration::from_secs),
    };

    let transport = new_transport(config)?;
    let (emitter, events) = create_event_channel();
    let reporter: Box<dyn Reporter> = match cli.output.as_deref() {
        Some("txt") => Box::new(TxtReporter::new()),
        Some("json") => Box::new(JsonReporter::new()),
        _ => Box::new(GroupedReporter::new()),
    };
    let reporter_handle = spawn_reporter(events, reporter);

    let scheduler = Scheduler::new(scheduler_config, transport, emitter)?;

    // Ctrl+c stops new dispatches and terminates what is in flight
    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stderr("Execution interrupted by Ctrl+c/SIGINT");
            cancel.cancel();
        }
    });

    let exit_code = scheduler.execute(&target, &commands).await?;

    // Hang up the event channel so the reporter can finish
    drop(scheduler);
    let _ = reporter_handle.await;

    Ok(exit_code)
}

/// Resolve the query and ask for confirmation before proceeding
async fn get_hosts(cli: &Cli, query: &Query) -> Result<NodeSet, CuminError> {
    let hosts = query.execute(&cli.hosts).await?;

    if hosts.is_empty() {
        stderr("No hosts found that matches the query");
        return Ok(hosts);
    }

    stderr(format!("{} hosts will be targeted:", hosts.len()));
    eprintln!("{}", hosts.to_string().cyan());

    if cli.dry_run {
        stderr("DRY-RUN mode enabled, aborting");
        return Ok(NodeSet::new());
    }

    if cli.force {
        stderr("FORCE mode enabled, continuing without confirmation");
        return Ok(hosts);
    }

    if !io::stdout().is_terminal() {
        return Err(CuminError::Worker {
            message: "not in a TTY but neither DRY-RUN nor FORCE mode were specified".to_string(),
            suggestion: Some("use --dry-run or --force".to_string()),
        });
    }

    let stdin = io::stdin();
    for _ in 0..10 {
        eprint!("{} ", "Confirm to continue [y/n]?".yellow());
        io::stderr().flush().ok();

        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            break;
        }

        match answer.trim() {
            "y" | "Y" => return Ok(hosts),
            "n" | "N" => return Err(CuminError::Cancelled),
            _ => continue,
        }
    }

    stderr("Got too many invalid answers");
    Err(CuminError::Cancelled)
}

/// Route the operational log to the configured file, or warnings to stderr
fn setup_logging(
    config: &Config,
    debug: bool,
    trace: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, CuminError> {
    let level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };

    match &config.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let filename = path
                .file_name()
                .ok_or_else(|| CuminError::Config {
                    message: "log_file must point to a file".to_string(),
                    path: Some(path.clone()),
                })?;

            std::fs::create_dir_all(directory).map_err(|e| CuminError::Io {
                message: format!("unable to create the log directory: {}", e),
                path: Some(directory.to_path_buf()),
            })?;

            let appender = tracing_appender::rolling::never(directory, filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(format!("cumin={}", level)))
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("cumin=warn"))
                .with_writer(io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Require a valid Kerberos ticket when the configuration asks for one
fn ensure_kerberos_ticket(config: &Config) -> Result<(), CuminError> {
    if !config.kerberos.ensure_ticket {
        return Ok(());
    }

    let is_root = std::env::var("USER").map(|user| user == "root").unwrap_or(false);
    if is_root && !config.kerberos.ensure_ticket_root {
        return Ok(());
    }

    let valid = std::process::Command::new("klist")
        .arg("-s")
        .status()
        .map(|status| status.success())
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(CuminError::Config {
            message: "no valid Kerberos ticket found".to_string(),
            path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_size() {
        assert!(matches!(parse_batch_size("10"), Ok(BatchSize::Absolute(10))));
        assert!(matches!(parse_batch_size("50%"), Ok(BatchSize::Ratio(r)) if (r - 0.5).abs() < 1e-9));
        assert!(parse_batch_size("0").is_err());
        assert!(parse_batch_size("0%").is_err());
        assert!(parse_batch_size("150%").is_err());
        assert!(parse_batch_size("ten").is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "cumin",
            "--force",
            "-m",
            "async",
            "-b",
            "25%",
            "D{host[1-5]}",
            "uptime",
            "uname -r",
        ]);
        assert_eq!(cli.hosts, "D{host[1-5]}");
        assert_eq!(cli.commands.len(), 2);
        assert_eq!(cli.mode, Some(Mode::Async));
        assert!(cli.force);
        assert!(matches!(cli.batch_size, Some(BatchSize::Ratio(_))));
    }

    #[test]
    fn test_cli_query_only() {
        let cli = Cli::parse_from(["cumin", "D{host1}"]);
        assert!(cli.commands.is_empty());
        assert!(!cli.dry_run); // implied later by the command-count validation
    }
}
