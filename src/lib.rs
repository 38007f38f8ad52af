//! A staged pipeline engine built on freshness-first relay buffers.
//!
//! Each stage runs as its own execution unit (a thread, or a forked process)
//! and hands results to the next stage through a bounded relay buffer. Relay
//! buffers never make a producer wait: when a consumer falls behind, old
//! entries are evicted and the consumer picks up the freshest value on its
//! next read. This suits real-time work such as sensor or frame processing,
//! where latency matters more than processing every sample.
//!
//! # Features
//!
//! - Timestamp-gated buffers: a reader never sees the same entry twice
//! - Two read modes: freshest single value, or an exact batch of `capacity`
//! - Two backends behind one API: threads on a shared heap, or forked
//!   processes over process-shared memory
//! - Cooperative stop for threads, forceful kill-and-reap for processes
//! - Builder and serde-loadable configuration
//!
//! # Example
//!
//! ```ignore
//! use relay_pipeline::{MapStage, PassthroughStage, PipelineBuilder, Result, StageInput};
//!
//! let mut pipeline = PipelineBuilder::<u32>::new()
//!     .add_stage(MapStage::new("double", |input: StageInput<u32>| -> Result<u32> {
//!         Ok(input.into_newest().unwrap_or(0) * 2)
//!     }))
//!     .terminal(PassthroughStage)
//!     .capacity(2)
//!     .build()?;
//!
//! pipeline.start()?;
//! pipeline.put(21)?;
//! assert_eq!(pipeline.get()?, 42);
//! pipeline.stop()?;
//! ```

pub mod buffer;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pipeline;
pub mod stage;

// Re-exports for convenience
pub use buffer::{
    Backend, EntryStore, Monitor, Payload, ReadCursor, ReadMode, Relay, RelayBuffer, StageInput,
    DEFAULT_SLOT_SIZE,
};
pub use error::{PipelineError, Result};
pub use executor::{ExitOutcome, UnitExit};
pub use metrics::{RelayStats, StatsSnapshot};
pub use pipeline::{BufferCapacity, Pipeline, PipelineBuilder, PipelineConfig};
pub use stage::{MapStage, PassthroughStage, SinkStage, Stage, StageRunner, StopSignal};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
