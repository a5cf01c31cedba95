// Event system feeding the reporters

use tokio::sync::mpsc;

use crate::executor::{Command, NodeState};
use crate::nodeset::NodeSet;

/// Which remote stream a chunk of output belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Events emitted by the scheduler during a run.
///
/// For one host the events are emitted in generation order; there is no
/// cross-host ordering guarantee beyond `RunStarted` first and `RunFinished`
/// last.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Execution started on the target
    RunStarted {
        hosts: NodeSet,
        commands: Vec<Command>,
    },

    /// A command started executing on a host
    HostStarted { host: String, command_index: usize },

    /// Output bytes arrived from a host. Each byte produced by the remote
    /// command appears in exactly one of these events.
    HostOutput {
        host: String,
        command_index: usize,
        stream: StreamKind,
        bytes: Vec<u8>,
    },

    /// A command finished on a host. `exit_code` is `None` on timeout or
    /// transport failure; `state` is the node's state after this command.
    HostFinished {
        host: String,
        command_index: usize,
        exit_code: Option<i32>,
        state: NodeState,
    },

    /// The whole run completed. `grouped_outputs` pairs each distinct output
    /// blob with the hosts that produced it.
    RunFinished {
        exit_code: i32,
        grouped_outputs: Vec<(NodeSet, Vec<u8>)>,
    },
}

/// Event emitter handed to the scheduler.
///
/// The channel is unbounded: a slow reporter must never block a transport.
/// Output bytes are buffered per host in the scheduler's state table, the
/// channel only carries them onward.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        EventEmitter { tx }
    }

    pub fn run_started(&self, hosts: NodeSet, commands: Vec<Command>) {
        let _ = self.tx.send(ExecutionEvent::RunStarted { hosts, commands });
    }

    pub fn host_started(&self, host: String, command_index: usize) {
        let _ = self
            .tx
            .send(ExecutionEvent::HostStarted {
                host,
                command_index,
            });
    }

    pub fn host_output(
        &self,
        host: String,
        command_index: usize,
        stream: StreamKind,
        bytes: Vec<u8>,
    ) {
        let _ = self.tx.send(ExecutionEvent::HostOutput {
            host,
            command_index,
            stream,
            bytes,
        });
    }

    pub fn host_finished(
        &self,
        host: String,
        command_index: usize,
        exit_code: Option<i32>,
        state: NodeState,
    ) {
        let _ = self.tx.send(ExecutionEvent::HostFinished {
            host,
            command_index,
            exit_code,
            state,
        });
    }

    pub fn run_finished(&self, exit_code: i32, grouped_outputs: Vec<(NodeSet, Vec<u8>)>) {
        let _ = self.tx.send(ExecutionEvent::RunFinished {
            exit_code,
            grouped_outputs,
        });
    }
}

/// Create a new event channel
pub fn create_event_channel() -> (EventEmitter, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter::new(tx), rx)
}
