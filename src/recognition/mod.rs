//! The per-chunk recognition state machine and its consumer loop.

pub mod debounce;
pub mod emitter;
pub mod listener;
pub mod pipeline;

pub use debounce::{cooldown_override, DebounceState, Debouncer};
pub use emitter::{Detection, EventEmitter};
pub use listener::run_listener;
pub use pipeline::{PipelineStats, RecognitionPipeline};
