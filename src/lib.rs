// Cumin - Automation and orchestration framework
//
// Select a set of hosts with a compositional query language backed by
// pluggable backends, then run commands across them in parallel with a
// sliding-window scheduler.

pub mod backends;
pub mod config;
pub mod executor;
pub mod nodeset;
pub mod output;
pub mod query;

pub use backends::{Backend, BackendRegistry};
pub use config::Config;
pub use executor::{Command, Mode, NodeState, Scheduler, SchedulerConfig, Target};
pub use nodeset::NodeSet;
pub use output::{CuminError, Reporter};
pub use query::Query;

/// Version of the Cumin tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backends::{Backend, BackendRegistry};
    pub use crate::config::Config;
    pub use crate::executor::{Command, Mode, Scheduler, SchedulerConfig, Target};
    pub use crate::nodeset::NodeSet;
    pub use crate::output::{CuminError, GroupedReporter, Reporter};
    pub use crate::query::Query;
}
