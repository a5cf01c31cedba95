// Output module: errors, execution events and reporters

pub mod errors;
pub mod events;
pub mod reporter;

pub use errors::{CuminError, ParseError};
pub use events::{create_event_channel, EventEmitter, ExecutionEvent, StreamKind};
pub use reporter::{
    spawn_reporter, GroupedReporter, JsonReporter, QuietReporter, Reporter, TxtReporter,
};
