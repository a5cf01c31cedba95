// Executor module: commands, targets and the per-node lifecycle

pub mod scheduler;
pub mod transport;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::nodeset::NodeSet;
use crate::output::errors::{worker_error, CuminError};

pub use scheduler::{CancelHandle, ExecutionReport, HostReport, Scheduler, SchedulerConfig};
pub use transport::{new_transport, ExecStatus, SshTransport, Transport};

/// A single command to execute, with its timeout and acceptable exit codes
#[derive(Debug, Clone)]
pub struct Command {
    text: String,
    timeout: Option<Duration>,
    ok_codes: Option<Vec<i32>>,
}

impl Command {
    /// Create a command; the text must be non-empty
    pub fn new(text: impl Into<String>) -> Result<Self, CuminError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(worker_error("command", "must be a non-empty string"));
        }

        Ok(Command {
            text,
            timeout: None,
            ok_codes: None,
        })
    }

    /// Set the per-host execution timeout, which must be non-zero
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, CuminError> {
        if timeout.is_zero() {
            return Err(worker_error("timeout", "must be a positive duration"));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Set the exit codes considered successful, each in 0-255.
    /// An explicit empty list means any exit code is successful.
    pub fn with_ok_codes(mut self, codes: Vec<i32>) -> Result<Self, CuminError> {
        if codes.iter().any(|c| !(0..=255).contains(c)) {
            return Err(worker_error(
                "ok_codes",
                "must be a list of integers in the range 0-255",
            ));
        }
        self.ok_codes = Some(codes);
        Ok(self)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The effective acceptable exit codes; defaults to `[0]` when unset
    pub fn ok_codes(&self) -> Vec<i32> {
        match &self.ok_codes {
            Some(codes) => codes.clone(),
            None => vec![0],
        }
    }

    /// Whether an exit code counts as success for this command
    pub fn is_success_code(&self, code: i32) -> bool {
        match &self.ok_codes {
            Some(codes) if codes.is_empty() => true,
            Some(codes) => codes.contains(&code),
            None => code == 0,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl PartialEq for Command {
    /// Structural equality over text, timeout and the effective ok codes
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
            && self.timeout == other.timeout
            && self.ok_codes() == other.ok_codes()
    }
}

impl Eq for Command {}

/// Immutable description of the hosts to target and their batching
#[derive(Debug, Clone)]
pub struct Target {
    hosts: NodeSet,
    batch_size: usize,
    batch_sleep: Duration,
}

impl Target {
    /// Create a target; the host set must be non-empty. The batch size
    /// defaults to all the hosts and the batch sleep to zero.
    pub fn new(hosts: NodeSet) -> Result<Self, CuminError> {
        if hosts.is_empty() {
            return Err(worker_error("hosts", "must be a non-empty NodeSet"));
        }

        Ok(Target {
            batch_size: hosts.len(),
            hosts,
            batch_sleep: Duration::ZERO,
        })
    }

    /// Set an absolute batch size; clamped to the number of hosts
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, CuminError> {
        if batch_size == 0 {
            return Err(worker_error("batch_size", "must be a positive integer"));
        }
        self.batch_size = batch_size.min(self.hosts.len());
        Ok(self)
    }

    /// Set the batch size as a ratio in (0, 1] of the host count,
    /// rounded up with a minimum of one host
    pub fn with_batch_size_ratio(mut self, ratio: f64) -> Result<Self, CuminError> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(worker_error(
                "batch_size_ratio",
                "must be a float between 0 and 1",
            ));
        }
        self.batch_size = ((ratio * self.hosts.len() as f64).ceil() as usize).max(1);
        Ok(self)
    }

    /// Sleep between the end of execution on one host and the start on the next
    pub fn with_batch_sleep(mut self, batch_sleep: Duration) -> Self {
        self.batch_sleep = batch_sleep;
        self
    }

    pub fn hosts(&self) -> &NodeSet {
        &self.hosts
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_sleep(&self) -> Duration {
        self.batch_sleep
    }

    /// The first batch of hosts in sorted order
    pub fn first_batch(&self) -> Vec<String> {
        self.hosts.first_batch(self.batch_size)
    }
}

/// Execution mode of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Per-command barrier: a command starts only after the previous one
    /// met the success threshold across the fleet
    Sync,
    /// Per-host pipeline: each host runs the whole command list on its own
    Async,
}

impl FromStr for Mode {
    type Err = CuminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Mode::Sync),
            "async" => Ok(Mode::Async),
            other => Err(worker_error(
                "mode",
                &format!("must be one of 'sync', 'async', got '{}'", other),
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Sync => write!(f, "sync"),
            Mode::Async => write!(f, "async"),
        }
    }
}

/// Lifecycle state of a node inside the executor.
///
/// Transitions are monotone except for the sync-mode reset of a successful
/// node back to pending for the next command. `Failed` and `Timeout` are
/// sinks: such a node is never scheduled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Scheduled,
    Running,
    Success,
    Failed,
    Timeout,
}

impl NodeState {
    fn allowed_transitions(self) -> &'static [NodeState] {
        match self {
            NodeState::Pending => &[NodeState::Scheduled],
            NodeState::Scheduled => &[NodeState::Running],
            NodeState::Running => &[
                NodeState::Running,
                NodeState::Success,
                NodeState::Failed,
                NodeState::Timeout,
            ],
            NodeState::Success => &[NodeState::Pending],
            NodeState::Failed | NodeState::Timeout => &[],
        }
    }

    /// Transition to a new state, failing on a disallowed move
    pub fn update(&mut self, new: NodeState) -> Result<(), CuminError> {
        if !self.allowed_transitions().contains(&new) {
            return Err(CuminError::StateTransition {
                current: self.as_str().to_string(),
                requested: new.as_str().to_string(),
            });
        }
        *self = new;
        Ok(())
    }

    /// Whether the state contributes to the end-of-run accounting
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Success | NodeState::Failed | NodeState::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Scheduled => "scheduled",
            NodeState::Running => "running",
            NodeState::Success => "success",
            NodeState::Failed => "failed",
            NodeState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_defaults() {
        let command = Command::new("echo a").unwrap();
        assert_eq!(command.ok_codes(), vec![0]);
        assert!(command.is_success_code(0));
        assert!(!command.is_success_code(1));
        assert!(command.timeout().is_none());
    }

    #[test]
    fn test_command_empty_rejected() {
        assert!(Command::new("").is_err());
        assert!(Command::new("   ").is_err());
    }

    #[test]
    fn test_command_ok_codes() {
        let command = Command::new("x").unwrap().with_ok_codes(vec![0, 2]).unwrap();
        assert!(command.is_success_code(2));
        assert!(!command.is_success_code(1));

        // An explicit empty list accepts any exit code
        let command = Command::new("x").unwrap().with_ok_codes(vec![]).unwrap();
        assert!(command.is_success_code(0));
        assert!(command.is_success_code(127));

        assert!(Command::new("x").unwrap().with_ok_codes(vec![300]).is_err());
        assert!(Command::new("x").unwrap().with_ok_codes(vec![-1]).is_err());
    }

    #[test]
    fn test_command_equality() {
        let a = Command::new("echo a").unwrap();
        let b = Command::new("echo a").unwrap().with_ok_codes(vec![0]).unwrap();
        // Unset ok_codes and an explicit [0] are the same set
        assert_eq!(a, b);

        let c = Command::new("echo a").unwrap().with_ok_codes(vec![]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_command_zero_timeout_rejected() {
        assert!(Command::new("x")
            .unwrap()
            .with_timeout(Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_target_refuses_empty() {
        assert!(Target::new(NodeSet::new()).is_err());
    }

    #[test]
    fn test_target_batch_size_clamped() {
        let target = Target::new(NodeSet::parse("host[1-5]").unwrap())
            .unwrap()
            .with_batch_size(100)
            .unwrap();
        assert_eq!(target.batch_size(), 5);
    }

    #[test]
    fn test_target_batch_size_ratio() {
        let hosts = NodeSet::parse("host[1-10]").unwrap();
        let target = Target::new(hosts.clone())
            .unwrap()
            .with_batch_size_ratio(0.25)
            .unwrap();
        assert_eq!(target.batch_size(), 3); // ceil(2.5)

        // Tiny ratios still select at least one host
        let target = Target::new(hosts.clone())
            .unwrap()
            .with_batch_size_ratio(0.01)
            .unwrap();
        assert_eq!(target.batch_size(), 1);

        assert!(Target::new(hosts.clone())
            .unwrap()
            .with_batch_size_ratio(0.0)
            .is_err());
        assert!(Target::new(hosts).unwrap().with_batch_size_ratio(1.5).is_err());
    }

    #[test]
    fn test_target_first_batch() {
        let target = Target::new(NodeSet::parse("host[1-5]").unwrap())
            .unwrap()
            .with_batch_size(2)
            .unwrap();
        assert_eq!(target.first_batch(), vec!["host1", "host2"]);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("sync".parse::<Mode>().unwrap(), Mode::Sync);
        assert_eq!("async".parse::<Mode>().unwrap(), Mode::Async);
        assert!("banana".parse::<Mode>().is_err());
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut state = NodeState::Pending;
        state.update(NodeState::Scheduled).unwrap();
        state.update(NodeState::Running).unwrap();
        state.update(NodeState::Success).unwrap();
        // Sync-mode reset for the next command
        state.update(NodeState::Pending).unwrap();
        state.update(NodeState::Scheduled).unwrap();
    }

    #[test]
    fn test_state_machine_terminal_sinks() {
        let mut state = NodeState::Failed;
        assert!(state.update(NodeState::Scheduled).is_err());
        assert!(state.update(NodeState::Running).is_err());

        let mut state = NodeState::Timeout;
        assert!(state.update(NodeState::Pending).is_err());
    }

    #[test]
    fn test_state_machine_invalid_transitions() {
        let mut state = NodeState::Pending;
        assert!(state.update(NodeState::Running).is_err());
        assert!(state.update(NodeState::Success).is_err());

        let mut state = NodeState::Scheduled;
        assert!(state.update(NodeState::Success).is_err());

        // Running may stay running across commands of a host pipeline
        let mut state = NodeState::Running;
        state.update(NodeState::Running).unwrap();
    }
}
