// Fan-out scheduler: sliding-window execution with a per-node state machine

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::transport::{CancelWatch, ExecStatus, OutputFn, Transport};
use super::{Command, Mode, NodeState, Target};
use crate::nodeset::NodeSet;
use crate::output::errors::{worker_error, CuminError};
use crate::output::events::{EventEmitter, StreamKind};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Execution mode: per-command barrier or per-host pipeline
    pub mode: Mode,
    /// Max concurrent hosts across the whole run
    pub fanout: usize,
    /// Share of hosts that must end in success, in [0, 1]
    pub success_threshold: f64,
    /// Deadline for the whole run
    pub global_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            mode: Mode::Sync,
            fanout: 64,
            success_threshold: 1.0,
            global_timeout: None,
        }
    }
}

/// Handle to request cancellation of a running execution
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Stop new dispatches and terminate in-flight commands
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Per-node bookkeeping
struct Node {
    state: NodeState,
    running_command_index: Option<usize>,
    exit_codes: Vec<Option<i32>>,
    output: Vec<u8>,
}

impl Node {
    fn new(command_count: usize) -> Self {
        Node {
            state: NodeState::Pending,
            running_command_index: None,
            exit_codes: vec![None; command_count],
            output: Vec::new(),
        }
    }
}

/// State shared by the dispatcher and the per-host tasks, behind one mutex.
/// The lock is only taken for short transitions, never across a suspension.
struct RunState {
    nodes: HashMap<String, Node>,
    total: usize,
    exit_code: Option<i32>,
}

impl RunState {
    fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }
}

struct Shared {
    config: SchedulerConfig,
    transport: Arc<dyn Transport>,
    emitter: EventEmitter,
    state: Mutex<RunState>,
    cancel_rx: CancelWatch,
}

/// Final state of a run, retrievable after `execute`
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub exit_code: i32,
    pub hosts: BTreeMap<String, HostReport>,
    /// Hosts grouped by identical output blobs
    pub grouped_outputs: Vec<(NodeSet, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct HostReport {
    pub state: NodeState,
    pub exit_codes: Vec<Option<i32>>,
    pub output: Vec<u8>,
}

/// The fan-out command scheduler.
///
/// Drives a list of commands across the target hosts with a sliding window of
/// `min(batch_size, fanout)` concurrent hosts, per-node state tracking, the
/// configured success threshold and per-command timeouts. Exit code 0 means
/// the share of hosts ending in success reached the threshold, 2 anything
/// else (threshold missed, aborted, interrupted).
pub struct Scheduler {
    shared: Arc<Shared>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        transport: Arc<dyn Transport>,
        emitter: EventEmitter,
    ) -> Result<Self, CuminError> {
        if !(0.0..=1.0).contains(&config.success_threshold) {
            return Err(worker_error(
                "success_threshold",
                "must be a float between 0 and 1",
            ));
        }
        if config.fanout == 0 {
            return Err(worker_error("fanout", "must be a positive integer"));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Scheduler {
            shared: Arc::new(Shared {
                config,
                transport,
                emitter,
                state: Mutex::new(RunState {
                    nodes: HashMap::new(),
                    total: 0,
                    exit_code: None,
                }),
                cancel_rx,
            }),
            cancel_tx: Arc::new(cancel_tx),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    /// Execute the commands on the target and return the exit code
    pub async fn execute(
        &self,
        target: &Target,
        commands: &[Command],
    ) -> Result<i32, CuminError> {
        if commands.is_empty() {
            return Err(CuminError::Worker {
                message: "no commands provided".to_string(),
                suggestion: Some("pass at least one command to execute".to_string()),
            });
        }

        {
            let mut st = self.shared.state.lock();
            st.nodes = target
                .hosts()
                .iter()
                .map(|host| (host.to_string(), Node::new(commands.len())))
                .collect();
            st.total = st.nodes.len();
            st.exit_code = None;
        }

        info!(
            hosts = target.hosts().len(),
            commands = commands.len(),
            mode = %self.shared.config.mode,
            "executing commands on {}",
            target.hosts()
        );
        self.shared
            .emitter
            .run_started(target.hosts().clone(), commands.to_vec());

        let commands = Arc::new(commands.to_vec());
        let mut tasks: JoinSet<()> = JoinSet::new();

        let drive = async {
            match self.shared.config.mode {
                Mode::Sync => run_sync(&self.shared, target, &commands, &mut tasks).await,
                Mode::Async => run_async(&self.shared, target, &commands, &mut tasks).await,
            }
        };

        let timed_out = match self.shared.config.global_timeout {
            Some(timeout) => tokio::time::timeout(timeout, drive).await.is_err(),
            None => {
                drive.await;
                false
            }
        };

        if timed_out {
            // Stop everything still in flight before reporting
            tasks.shutdown().await;
            self.handle_global_timeout();
        }

        let cancelled = *self.shared.cancel_rx.borrow();
        let (exit_code, grouped) = {
            let mut st = self.shared.state.lock();
            let ratio = st.count(NodeState::Success) as f64 / st.total as f64;
            let exit_code = if cancelled {
                2
            } else if ratio >= self.shared.config.success_threshold {
                0
            } else {
                2
            };
            st.exit_code = Some(exit_code);
            (exit_code, group_outputs(&st))
        };

        info!(exit_code, cancelled, timed_out, "run finished");
        self.shared.emitter.run_finished(exit_code, grouped);

        Ok(exit_code)
    }

    /// Per-host states and outputs of the last execution
    pub fn report(&self) -> ExecutionReport {
        let st = self.shared.state.lock();
        ExecutionReport {
            exit_code: st.exit_code.unwrap_or(2),
            hosts: st
                .nodes
                .iter()
                .map(|(host, node)| {
                    (
                        host.clone(),
                        HostReport {
                            state: node.state,
                            exit_codes: node.exit_codes.clone(),
                            output: node.output.clone(),
                        },
                    )
                })
                .collect(),
            grouped_outputs: group_outputs(&st),
        }
    }

    /// Running hosts timed out, pending and scheduled ones keep their state
    fn handle_global_timeout(&self) {
        let mut interrupted = Vec::new();
        {
            let mut st = self.shared.state.lock();
            for (host, node) in st.nodes.iter_mut() {
                if node.state == NodeState::Running {
                    let _ = node.state.update(NodeState::Timeout);
                    interrupted.push((host.clone(), node.running_command_index.unwrap_or(0)));
                }
            }
        }

        warn!(
            hosts = interrupted.len(),
            "global timeout reached while commands were executing"
        );
        for (host, command_index) in interrupted {
            self.shared
                .emitter
                .host_finished(host, command_index, None, NodeState::Timeout);
        }
    }
}

/// sync mode: one command at a time across the fleet, with a success-ratio
/// barrier between commands
async fn run_sync(
    shared: &Arc<Shared>,
    target: &Target,
    commands: &Arc<Vec<Command>>,
    tasks: &mut JoinSet<()>,
) {
    let mut eligible: Vec<String> = target.hosts().iter().map(String::from).collect();

    for index in 0..commands.len() {
        if index > 0 {
            // Survivors of the previous command go back to pending
            let mut st = shared.state.lock();
            for host in &eligible {
                if let Some(node) = st.nodes.get_mut(host) {
                    let _ = node.state.update(NodeState::Pending);
                }
            }
        }

        debug!(command = %commands[index], hosts = eligible.len(), "starting command");
        run_phase(shared, target, commands, index, &eligible, tasks).await;

        let ratio = {
            let st = shared.state.lock();
            st.count(NodeState::Success) as f64 / st.total as f64
        };

        if ratio < shared.config.success_threshold {
            warn!(
                ratio,
                threshold = shared.config.success_threshold,
                "success ratio below threshold, aborting"
            );
            return;
        }

        if *shared.cancel_rx.borrow() {
            return;
        }

        eligible = {
            let st = shared.state.lock();
            st.nodes
                .iter()
                .filter(|(_, node)| node.state == NodeState::Success)
                .map(|(host, _)| host.clone())
                .collect()
        };
        eligible.sort();
    }
}

/// Dispatch one command over a set of hosts with the sliding window
async fn run_phase(
    shared: &Arc<Shared>,
    target: &Target,
    commands: &Arc<Vec<Command>>,
    index: usize,
    hosts: &[String],
    tasks: &mut JoinSet<()>,
) {
    let window = target.batch_size().min(shared.config.fanout).max(1);
    let mut queue: VecDeque<String> = hosts.iter().cloned().collect();

    while tasks.len() < window && !*shared.cancel_rx.borrow() {
        if !launch_sync_host(shared, &mut queue, tasks, commands, index) {
            break;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if joined.is_err() {
            continue;
        }
        if queue.is_empty() {
            continue;
        }
        if *shared.cancel_rx.borrow() || !threshold_attainable(shared) {
            // In-flight hosts complete, nothing new starts
            queue.clear();
            continue;
        }

        if !target.batch_sleep().is_zero() {
            tokio::time::sleep(target.batch_sleep()).await;
        }
        launch_sync_host(shared, &mut queue, tasks, commands, index);
    }
}

fn launch_sync_host(
    shared: &Arc<Shared>,
    queue: &mut VecDeque<String>,
    tasks: &mut JoinSet<()>,
    commands: &Arc<Vec<Command>>,
    index: usize,
) -> bool {
    let Some(host) = queue.pop_front() else {
        return false;
    };

    mark_scheduled(shared, &host);
    let shared = shared.clone();
    let commands = commands.clone();
    tasks.spawn(async move {
        run_host_command(&shared, &host, &commands[index], index, true).await;
    });

    true
}

/// async mode: each host runs the whole command list on its own, the window
/// slides over hosts
async fn run_async(
    shared: &Arc<Shared>,
    target: &Target,
    commands: &Arc<Vec<Command>>,
    tasks: &mut JoinSet<()>,
) {
    let window = target.batch_size().min(shared.config.fanout).max(1);
    let mut queue: VecDeque<String> =
        target.hosts().iter().map(String::from).collect();

    while tasks.len() < window && !*shared.cancel_rx.borrow() {
        if !launch_async_host(shared, &mut queue, tasks, commands) {
            break;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if joined.is_err() {
            continue;
        }
        if queue.is_empty() {
            continue;
        }
        if *shared.cancel_rx.borrow() || !threshold_attainable(shared) {
            debug!("not launching further hosts");
            queue.clear();
            continue;
        }

        if !target.batch_sleep().is_zero() {
            tokio::time::sleep(target.batch_sleep()).await;
        }
        launch_async_host(shared, &mut queue, tasks, commands);
    }
}

fn launch_async_host(
    shared: &Arc<Shared>,
    queue: &mut VecDeque<String>,
    tasks: &mut JoinSet<()>,
    commands: &Arc<Vec<Command>>,
) -> bool {
    let Some(host) = queue.pop_front() else {
        return false;
    };

    mark_scheduled(shared, &host);
    let shared = shared.clone();
    let commands = commands.clone();
    tasks.spawn(async move {
        let last = commands.len() - 1;
        for (index, command) in commands.iter().enumerate() {
            if !run_host_command(&shared, &host, command, index, index == last).await {
                break;
            }
        }
    });

    true
}

fn mark_scheduled(shared: &Arc<Shared>, host: &str) {
    let mut st = shared.state.lock();
    if let Some(node) = st.nodes.get_mut(host) {
        let _ = node.state.update(NodeState::Scheduled);
    }
}

/// Whether the success threshold can still be met given the failures so far
fn threshold_attainable(shared: &Arc<Shared>) -> bool {
    let st = shared.state.lock();
    let failed = st.count(NodeState::Failed) + st.count(NodeState::Timeout);
    1.0 - (failed as f64 / st.total as f64) >= shared.config.success_threshold
}

/// Run one command on one host and record the outcome.
///
/// Returns whether the host may continue: the command completed with an
/// acceptable exit code. With `terminal_on_success` the node moves to
/// `success`, otherwise it stays `running` for its next command.
async fn run_host_command(
    shared: &Arc<Shared>,
    host: &str,
    command: &Command,
    index: usize,
    terminal_on_success: bool,
) -> bool {
    {
        let mut st = shared.state.lock();
        if let Some(node) = st.nodes.get_mut(host) {
            let _ = node.state.update(NodeState::Running);
            node.running_command_index = Some(index);
        }
    }
    shared.emitter.host_started(host.to_string(), index);

    let outcome = shared
        .transport
        .exec_streaming(
            host,
            command.text(),
            command.timeout(),
            shared.cancel_rx.clone(),
            make_sink(shared.clone(), host.to_string(), index, StreamKind::Stdout),
            make_sink(shared.clone(), host.to_string(), index, StreamKind::Stderr),
        )
        .await;

    let (exit_code, new_state) = match outcome {
        Ok(ExecStatus::Completed(code)) => {
            if command.is_success_code(code) {
                let state = if terminal_on_success {
                    NodeState::Success
                } else {
                    NodeState::Running
                };
                (Some(code), state)
            } else {
                debug!(host, code, "command returned an unacceptable exit code");
                (Some(code), NodeState::Failed)
            }
        }
        Ok(ExecStatus::TimedOut) => (None, NodeState::Timeout),
        Ok(ExecStatus::Cancelled) => (None, NodeState::Failed),
        Err(error) => {
            // Transport failures count against the host, not the run
            let message = error.to_string().into_bytes();
            {
                let mut st = shared.state.lock();
                if let Some(node) = st.nodes.get_mut(host) {
                    node.output.extend_from_slice(&message);
                }
            }
            shared
                .emitter
                .host_output(host.to_string(), index, StreamKind::Stderr, message);
            (None, NodeState::Failed)
        }
    };

    let state_after = {
        let mut st = shared.state.lock();
        match st.nodes.get_mut(host) {
            Some(node) => {
                node.exit_codes[index] = exit_code;
                let _ = node.state.update(new_state);
                node.state
            }
            None => new_state,
        }
    };
    shared
        .emitter
        .host_finished(host.to_string(), index, exit_code, state_after);

    matches!(state_after, NodeState::Success | NodeState::Running)
}

/// Sink appending to the node's output blob and forwarding the chunk
fn make_sink(
    shared: Arc<Shared>,
    host: String,
    index: usize,
    stream: StreamKind,
) -> OutputFn {
    Box::new(move |bytes: &[u8]| {
        {
            let mut st = shared.state.lock();
            if let Some(node) = st.nodes.get_mut(&host) {
                node.output.extend_from_slice(bytes);
            }
        }
        shared
            .emitter
            .host_output(host.clone(), index, stream, bytes.to_vec());
    })
}

/// Group hosts by identical output blobs; hosts with no output are omitted
fn group_outputs(st: &RunState) -> Vec<(NodeSet, Vec<u8>)> {
    let mut names: Vec<&String> = st.nodes.keys().collect();
    names.sort();

    let mut groups: HashMap<[u8; 32], (NodeSet, Vec<u8>)> = HashMap::new();
    for name in names {
        let node = &st.nodes[name];
        if node.output.is_empty() {
            continue;
        }
        let digest: [u8; 32] = Sha256::digest(&node.output).into();
        groups
            .entry(digest)
            .or_insert_with(|| (NodeSet::new(), node.output.clone()))
            .0
            .insert(name.as_str());
    }

    let mut grouped: Vec<(NodeSet, Vec<u8>)> = groups.into_values().collect();
    grouped.sort_by_key(|(hosts, _)| hosts.to_string());
    grouped
}
