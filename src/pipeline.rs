use crate::buffer::{Backend, Payload, ReadCursor, ReadMode, RelayBuffer, DEFAULT_SLOT_SIZE};
use crate::error::{PipelineError, Result};
use crate::executor::{ExecutionUnits, UnitExit};
use crate::metrics::StatsSnapshot;
use crate::stage::{Stage, StageRunner};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Buffer sizes for a pipeline: one value for every buffer, or one per buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BufferCapacity {
    Uniform(usize),
    PerBuffer(Vec<usize>),
}

impl BufferCapacity {
    /// Expand to exactly `buffers` capacities
    pub fn resolve(&self, buffers: usize) -> Result<Vec<usize>> {
        let capacities = match self {
            BufferCapacity::Uniform(capacity) => vec![*capacity; buffers],
            BufferCapacity::PerBuffer(capacities) => {
                if capacities.len() != buffers {
                    return Err(PipelineError::ConfigError(format!(
                        "expected {buffers} buffer capacities (one per stage), got {}",
                        capacities.len()
                    )));
                }
                capacities.clone()
            }
        };
        if let Some(index) = capacities.iter().position(|&c| c == 0) {
            return Err(PipelineError::ConfigError(format!(
                "capacity of buffer {index} must be greater than 0"
            )));
        }
        Ok(capacities)
    }
}

impl Default for BufferCapacity {
    fn default() -> Self {
        BufferCapacity::Uniform(1)
    }
}

impl From<usize> for BufferCapacity {
    fn from(capacity: usize) -> Self {
        BufferCapacity::Uniform(capacity)
    }
}

impl From<Vec<usize>> for BufferCapacity {
    fn from(capacities: Vec<usize>) -> Self {
        BufferCapacity::PerBuffer(capacities)
    }
}

impl From<&[usize]> for BufferCapacity {
    fn from(capacities: &[usize]) -> Self {
        BufferCapacity::PerBuffer(capacities.to_vec())
    }
}

fn default_slot_size() -> usize {
    DEFAULT_SLOT_SIZE
}

/// Shape of a pipeline that does not depend on its stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Buffer capacity, a single value or one per stage
    #[serde(default)]
    pub capacity: BufferCapacity,

    /// Threads or processes, for every stage and buffer alike
    #[serde(default)]
    pub backend: Backend,

    /// Largest encoded payload a process-shared buffer slot can hold
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: BufferCapacity::default(),
            backend: Backend::default(),
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

/// Builder for constructing pipelines
pub struct PipelineBuilder<T> {
    stages: Vec<Box<dyn Stage<T>>>,
    terminal: Option<Box<dyn Stage<T>>>,
    config: PipelineConfig,
}

impl<T: Payload> PipelineBuilder<T> {
    /// Create a new pipeline builder
    pub fn new() -> Self {
        Self::from_config(PipelineConfig::default())
    }

    /// Start from a loaded configuration
    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            stages: Vec::new(),
            terminal: None,
            config,
        }
    }

    /// Add a stage to the end of the chain
    pub fn add_stage(self, stage: impl Stage<T>) -> Self {
        self.add_boxed_stage(Box::new(stage))
    }

    pub fn add_boxed_stage(mut self, stage: Box<dyn Stage<T>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage appended after all others as the end of the chain
    pub fn terminal(mut self, stage: impl Stage<T>) -> Self {
        self.terminal = Some(Box::new(stage));
        self
    }

    /// Buffer capacity: a `usize` for all buffers or a `Vec<usize>` with
    /// one entry per stage (terminal included)
    pub fn capacity(mut self, capacity: impl Into<BufferCapacity>) -> Self {
        self.config.capacity = capacity.into();
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Slot size for process-shared buffers
    pub fn slot_size(mut self, slot_size: usize) -> Self {
        self.config.slot_size = slot_size;
        self
    }

    /// Build the pipeline. Nothing is started; on error nothing is left
    /// allocated.
    pub fn build(self) -> Result<Pipeline<T>> {
        let mut stages = self.stages;
        stages.extend(self.terminal);
        if stages.is_empty() {
            return Err(PipelineError::NoStages);
        }

        let capacities = self.config.capacity.resolve(stages.len())?;
        let backend = self.config.backend;

        let buffers = capacities
            .iter()
            .map(|&capacity| RelayBuffer::new(capacity, backend, self.config.slot_size))
            .collect::<Result<Vec<_>>>()?;

        let mut runners: Vec<StageRunner<T>> = stages.into_iter().map(StageRunner::new).collect();
        if let Some(last) = runners.last_mut() {
            last.mark_terminal();
        }

        tracing::debug!(
            stages = runners.len(),
            ?backend,
            ?capacities,
            "pipeline built"
        );

        Ok(Pipeline {
            stage_names: runners.iter().map(|r| r.name().to_string()).collect(),
            runners,
            buffers,
            backend,
            units: None,
            state: PipelineState::Built,
            sink_cursor: Mutex::new(ReadCursor::new()),
        })
    }
}

impl<T: Payload> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Built,
    Running,
    Stopped,
}

/// A chain of stages joined by relay buffers.
///
/// `buffers[i]` is the input of stage `i`; `buffers[0]` is fed by
/// [`put`](Self::put) and the last buffer is the terminal stage's input,
/// which [`get`](Self::get) also observes through its own cursor.
pub struct Pipeline<T: Payload> {
    stage_names: Vec<String>,
    runners: Vec<StageRunner<T>>,
    buffers: Vec<RelayBuffer<T>>,
    backend: Backend,
    units: Option<ExecutionUnits>,
    state: PipelineState,
    sink_cursor: Mutex<ReadCursor>,
}

impl<T: Payload> Pipeline<T> {
    pub fn builder() -> PipelineBuilder<T> {
        PipelineBuilder::new()
    }

    /// Number of stages, terminal included
    pub fn len(&self) -> usize {
        self.stage_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stage_names.is_empty()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Change how stage `index` reads its input. Only allowed before start.
    pub fn configure_read_mode(&mut self, index: usize, mode: ReadMode) -> Result<()> {
        if self.state != PipelineState::Built {
            return Err(PipelineError::ConfigError(
                "read mode can only be changed before the pipeline starts".into(),
            ));
        }
        let count = self.runners.len();
        let runner = self.runners.get_mut(index).ok_or_else(|| {
            PipelineError::ConfigError(format!("no stage {index} in a pipeline of {count}"))
        })?;
        runner.configure_read_mode(mode);
        Ok(())
    }

    /// Current read mode of stage `index`, while not yet started
    pub fn read_mode(&self, index: usize) -> Option<ReadMode> {
        self.runners.get(index).map(|r| r.read_mode())
    }

    /// Launch one execution unit per stage and return immediately.
    ///
    /// On Linux, stage processes are killed when the thread calling `start`
    /// exits, so call it from a thread that outlives the pipeline.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Built => {}
            PipelineState::Running => return Err(PipelineError::AlreadyStarted),
            PipelineState::Stopped => return Err(PipelineError::AlreadyStopped),
        }

        let runners = std::mem::take(&mut self.runners);
        let units = ExecutionUnits::launch(self.backend, runners, &self.buffers)?;
        debug_assert_eq!(units.len(), self.buffers.len());

        self.units = Some(units);
        self.state = PipelineState::Running;
        tracing::debug!(stages = self.len(), backend = ?self.backend, "pipeline started");
        Ok(())
    }

    /// Publish into the first buffer. Never blocks.
    pub fn put(&self, value: T) -> Result<()> {
        self.ensure_not_stopped()?;
        self.buffers[0].put(value)
    }

    /// Block until the last buffer holds a value newer than the previous
    /// `get` and return the freshest one
    pub fn get(&self) -> Result<T> {
        self.ensure_not_stopped()?;
        let mut cursor = self.sink_cursor.lock();
        self.sink().get_latest(&mut cursor)
    }

    /// Block until the last buffer is exactly full with fresh data and
    /// return all of it, oldest first
    pub fn get_batch(&self) -> Result<Vec<T>> {
        self.ensure_not_stopped()?;
        let mut cursor = self.sink_cursor.lock();
        self.sink().get_batch(&mut cursor)
    }

    /// Non-blocking [`get`](Self::get)
    pub fn try_get(&self) -> Result<Option<T>> {
        self.ensure_not_stopped()?;
        let mut cursor = self.sink_cursor.lock();
        self.sink().try_get_latest(&mut cursor)
    }

    /// Stop every execution unit.
    ///
    /// With [`Backend::Threads`] this is cooperative: stop flags are set and
    /// each stage exits at its next check. A stage waiting inside `run` or on
    /// an input buffer that never refreshes is not interrupted and is left
    /// detached. A stage that passed its post-read check just before the flag
    /// was set still completes that one `run` after this returns; it starts
    /// no further `run` after that.
    ///
    /// With [`Backend::Processes`] every stage process is killed and reaped
    /// before this returns. Kill or reap failures are returned and leave the
    /// pipeline running, so calling `stop` again retries the processes that
    /// were not reaped.
    ///
    /// Once stopped, the pipeline cannot be restarted.
    pub fn stop(&mut self) -> Result<Vec<UnitExit>> {
        match self.state {
            PipelineState::Running => {}
            PipelineState::Built => return Err(PipelineError::NotStarted),
            PipelineState::Stopped => return Err(PipelineError::AlreadyStopped),
        }
        // Stays Running on failure so a later stop (or drop) retries the
        // units that were not reaped
        let exits = match self.units.as_mut() {
            Some(units) => units.stop()?,
            None => Vec::new(),
        };
        self.state = PipelineState::Stopped;
        tracing::debug!(backend = ?self.backend, exited = exits.len(), "pipeline stopped");
        Ok(exits)
    }

    /// Exit reports of units that have ended since the last call
    pub fn exits(&mut self) -> Result<Vec<UnitExit>> {
        match self.units.as_mut() {
            Some(units) => units.exits(),
            None => Ok(Vec::new()),
        }
    }

    /// Check if pipeline is running
    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running
    }

    /// Handle to the first buffer
    pub fn input(&self) -> RelayBuffer<T> {
        self.buffers[0].clone()
    }

    /// Handle to the input buffer of stage `index`
    pub fn buffer(&self, index: usize) -> Option<RelayBuffer<T>> {
        self.buffers.get(index).cloned()
    }

    /// Counters of the input buffer of stage `index`
    pub fn buffer_stats(&self, index: usize) -> Option<Result<StatsSnapshot>> {
        self.buffers.get(index).map(|b| b.stats())
    }

    /// Get a summary of all buffer counters
    pub fn metrics_summary(&self) -> Result<String> {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for (i, (name, buffer)) in self.stage_names.iter().zip(&self.buffers).enumerate() {
            let snapshot = buffer.stats()?;
            summary.push_str(&format!("  Stage {i} ({name}): {}\n", snapshot.format()));
        }
        Ok(summary)
    }

    fn sink(&self) -> &RelayBuffer<T> {
        &self.buffers[self.buffers.len() - 1]
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        if self.state == PipelineState::Stopped {
            Err(PipelineError::AlreadyStopped)
        } else {
            Ok(())
        }
    }
}

impl<T: Payload> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "failed to stop pipeline on drop");
            }
        }
    }
}
