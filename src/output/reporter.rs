// Reporters: consumers of the execution event stream

use std::collections::BTreeMap;

use colored::*;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::events::{ExecutionEvent, StreamKind};
use crate::executor::{Command, NodeState};
use crate::nodeset::NodeSet;

/// Sink for the ordered execution events.
///
/// For one host the calls arrive in generation order; `run_started` is always
/// first and `run_finished` always last.
pub trait Reporter: Send {
    fn run_started(&mut self, hosts: &NodeSet, commands: &[Command]);
    fn host_started(&mut self, host: &str, command_index: usize);
    fn host_output(&mut self, host: &str, command_index: usize, stream: StreamKind, bytes: &[u8]);
    fn host_finished(
        &mut self,
        host: &str,
        command_index: usize,
        exit_code: Option<i32>,
        state: NodeState,
    );
    fn run_finished(&mut self, exit_code: i32, grouped_outputs: &[(NodeSet, Vec<u8>)]);
}

/// Drive a reporter from the event channel until the scheduler hangs up
pub fn spawn_reporter(
    mut rx: UnboundedReceiver<ExecutionEvent>,
    mut reporter: Box<dyn Reporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::RunStarted { hosts, commands } => {
                    reporter.run_started(&hosts, &commands)
                }
                ExecutionEvent::HostStarted {
                    host,
                    command_index,
                } => reporter.host_started(&host, command_index),
                ExecutionEvent::HostOutput {
                    host,
                    command_index,
                    stream,
                    bytes,
                } => reporter.host_output(&host, command_index, stream, &bytes),
                ExecutionEvent::HostFinished {
                    host,
                    command_index,
                    exit_code,
                    state,
                } => reporter.host_finished(&host, command_index, exit_code, state),
                ExecutionEvent::RunFinished {
                    exit_code,
                    grouped_outputs,
                } => reporter.run_finished(exit_code, &grouped_outputs),
            }
        }
    })
}

/// Default reporter: groups identical outputs by host set.
///
/// With a single target host the output is streamed as it arrives; with many
/// hosts it is printed at the end as one block per distinct output.
#[derive(Default)]
pub struct GroupedReporter {
    total: usize,
    single_host: bool,
    commands: Vec<Command>,
    final_states: BTreeMap<String, NodeState>,
}

impl GroupedReporter {
    pub fn new() -> Self {
        GroupedReporter::default()
    }
}

impl Reporter for GroupedReporter {
    fn run_started(&mut self, hosts: &NodeSet, commands: &[Command]) {
        self.total = hosts.len();
        self.single_host = hosts.len() == 1;
        self.commands = commands.to_vec();
        self.final_states.clear();
    }

    fn host_started(&mut self, _host: &str, command_index: usize) {
        if self.single_host {
            if let Some(command) = self.commands.get(command_index) {
                println!(
                    "{}",
                    format!("----- OUTPUT of '{}' -----", short_command(command.text())).blue()
                );
            }
        }
    }

    fn host_output(&mut self, _host: &str, _command_index: usize, _stream: StreamKind, bytes: &[u8]) {
        if self.single_host {
            print!("{}", String::from_utf8_lossy(bytes));
        }
    }

    fn host_finished(
        &mut self,
        host: &str,
        _command_index: usize,
        _exit_code: Option<i32>,
        state: NodeState,
    ) {
        self.final_states.insert(host.to_string(), state);
    }

    fn run_finished(&mut self, exit_code: i32, grouped_outputs: &[(NodeSet, Vec<u8>)]) {
        if !self.single_host {
            if grouped_outputs.is_empty() {
                println!("{}", "===== NO OUTPUT =====".blue());
            }
            for (hosts, bytes) in grouped_outputs {
                println!("{}", "===== NODE GROUP =====".blue());
                println!("{}", format!("({}) {}", hosts.len(), hosts).cyan());
                println!("{}", "----- OUTPUT -----".blue());
                print!("{}", String::from_utf8_lossy(bytes));
                if !bytes.ends_with(b"\n") {
                    println!();
                }
            }
            println!("{}", "================".blue());
        }

        for state in [NodeState::Failed, NodeState::Timeout] {
            let hosts: NodeSet = self
                .final_states
                .iter()
                .filter(|(_, s)| **s == state)
                .map(|(h, _)| h.clone())
                .collect();
            if !hosts.is_empty() {
                eprintln!(
                    "{}{}",
                    format_ratio_line(hosts.len(), self.total, &format!("of nodes {}", state))
                        .red(),
                    format!(": {}", hosts).cyan()
                );
            }
        }

        let success = self
            .final_states
            .values()
            .filter(|s| **s == NodeState::Success)
            .count();
        let line = format_ratio_line(success, self.total, "success ratio");
        if exit_code == 0 && success == self.total {
            eprintln!("{}", line.green());
        } else if exit_code == 0 {
            eprintln!("{}", line.yellow());
        } else {
            eprintln!("{}", line.red());
        }
    }
}

/// Reporter printing one `host: line` pair per output line, sorted by host
#[derive(Default)]
pub struct TxtReporter {
    outputs: BTreeMap<String, Vec<u8>>,
}

impl TxtReporter {
    pub fn new() -> Self {
        TxtReporter::default()
    }
}

impl Reporter for TxtReporter {
    fn run_started(&mut self, _hosts: &NodeSet, _commands: &[Command]) {}

    fn host_started(&mut self, _host: &str, _command_index: usize) {}

    fn host_output(&mut self, host: &str, _command_index: usize, _stream: StreamKind, bytes: &[u8]) {
        self.outputs
            .entry(host.to_string())
            .or_default()
            .extend_from_slice(bytes);
    }

    fn host_finished(&mut self, _: &str, _: usize, _: Option<i32>, _: NodeState) {}

    fn run_finished(&mut self, _exit_code: i32, _grouped_outputs: &[(NodeSet, Vec<u8>)]) {
        print!("{}", format_txt(&self.outputs));
    }
}

/// Reporter printing a `{host: output}` JSON object at the end
#[derive(Default)]
pub struct JsonReporter {
    outputs: BTreeMap<String, Vec<u8>>,
}

impl JsonReporter {
    pub fn new() -> Self {
        JsonReporter::default()
    }
}

impl Reporter for JsonReporter {
    fn run_started(&mut self, _hosts: &NodeSet, _commands: &[Command]) {}

    fn host_started(&mut self, _host: &str, _command_index: usize) {}

    fn host_output(&mut self, host: &str, _command_index: usize, _stream: StreamKind, bytes: &[u8]) {
        self.outputs
            .entry(host.to_string())
            .or_default()
            .extend_from_slice(bytes);
    }

    fn host_finished(&mut self, _: &str, _: usize, _: Option<i32>, _: NodeState) {}

    fn run_finished(&mut self, _exit_code: i32, _grouped_outputs: &[(NodeSet, Vec<u8>)]) {
        println!("{}", format_json(&self.outputs));
    }
}

/// Reporter that reports nothing
pub struct QuietReporter;

impl Reporter for QuietReporter {
    fn run_started(&mut self, _: &NodeSet, _: &[Command]) {}
    fn host_started(&mut self, _: &str, _: usize) {}
    fn host_output(&mut self, _: &str, _: usize, _: StreamKind, _: &[u8]) {}
    fn host_finished(&mut self, _: &str, _: usize, _: Option<i32>, _: NodeState) {}
    fn run_finished(&mut self, _: i32, _: &[(NodeSet, Vec<u8>)]) {}
}

const SHORT_COMMAND_LENGTH: usize = 35;

/// Shorten a long command for display, omitting the central part
fn short_command(command: &str) -> String {
    let length = command.chars().count();
    if length <= SHORT_COMMAND_LENGTH {
        return command.to_string();
    }
    let sublen = (SHORT_COMMAND_LENGTH - 3) / 2;
    let head: String = command.chars().take(sublen).collect();
    let tail: String = command.chars().skip(length - sublen).collect();
    format!("{}...{}", head, tail)
}

fn format_ratio_line(num: usize, total: usize, message: &str) -> String {
    let percent = if total == 0 {
        0.0
    } else {
        num as f64 / total as f64 * 100.0
    };
    format!("{:.1}% ({}/{}) {}", percent, num, total, message)
}

fn format_txt(outputs: &BTreeMap<String, Vec<u8>>) -> String {
    let mut result = String::new();
    for (host, bytes) in outputs {
        for line in String::from_utf8_lossy(bytes).lines() {
            result.push_str(host);
            result.push_str(": ");
            result.push_str(line);
            result.push('\n');
        }
    }
    result
}

fn format_json(outputs: &BTreeMap<String, Vec<u8>>) -> String {
    let object: serde_json::Map<String, serde_json::Value> = outputs
        .iter()
        .map(|(host, bytes)| {
            (
                host.clone(),
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
            )
        })
        .collect();
    serde_json::to_string_pretty(&serde_json::Value::Object(object))
        .unwrap_or_else(|_| "{}".to_string())
}
