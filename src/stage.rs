use crate::buffer::{Payload, ReadCursor, ReadMode, RelayBuffer, StageInput};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Trait for a processing stage in the pipeline.
///
/// Every stage of a pipeline transforms the same payload type `T`. A stage
/// is invoked repeatedly by its execution unit and should return within the
/// pipeline's latency budget.
pub trait Stage<T>: Send + 'static {
    /// Transform one read of the input buffer.
    /// `None` forwards nothing for this read.
    fn run(&mut self, input: StageInput<T>) -> Result<Option<T>>;

    /// Read mode the stage starts with. The pipeline may override it before
    /// start.
    fn read_mode(&self) -> ReadMode {
        ReadMode::Single
    }

    /// Called by the execution unit before the first read
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the execution unit leaves its loop after a stop request
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// Cooperative stop flag shared between a stage and whoever stops it.
/// It goes from clear to set once and is never reset.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A user stage wrapped with the lifecycle state the pipeline drives:
/// read mode, terminal flag and stop signal.
pub struct StageRunner<T> {
    stage: Box<dyn Stage<T>>,
    read_mode: ReadMode,
    terminal: bool,
    shutdown: StopSignal,
}

impl<T: Payload> StageRunner<T> {
    /// Wrap a stage, taking its preferred read mode
    pub fn new(stage: Box<dyn Stage<T>>) -> Self {
        let read_mode = stage.read_mode();
        Self {
            stage,
            read_mode,
            terminal: false,
            shutdown: StopSignal::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    /// Choose how the input buffer is read. Only meaningful before the
    /// execution unit starts.
    pub fn configure_read_mode(&mut self, mode: ReadMode) {
        self.read_mode = mode;
    }

    /// Mark this stage as the end of the chain; its results are not
    /// forwarded.
    pub fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Get the shutdown signal
    pub fn shutdown_signal(&self) -> StopSignal {
        self.shutdown.clone()
    }

    /// Ask the loop to exit at its next check
    pub fn request_stop(&self) {
        self.shutdown.request();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Run the stage loop until a stop is requested or the stage fails.
    ///
    /// The stop flag is checked before each read and again after the read
    /// returns, so no new `run` starts once a stop is observed. A read that is
    /// already waiting is not interrupted, and a stop requested between the
    /// post-read check and `run` takes effect after that `run`.
    pub fn run(&mut self, input: &RelayBuffer<T>, output: Option<&RelayBuffer<T>>) -> Result<()> {
        self.stage.on_start()?;
        let mut cursor = ReadCursor::new();

        while !self.is_stopped() {
            let item = input.read(self.read_mode, &mut cursor)?;
            if self.is_stopped() {
                break;
            }

            let result = self.stage.run(item)?;

            if self.terminal {
                continue;
            }
            if let (Some(result), Some(output)) = (result, output) {
                output.put(result)?;
            }
        }

        self.stage.on_shutdown()
    }
}

/// A simple pass-through stage forwarding the newest value of each read
#[derive(Debug, Default)]
pub struct PassthroughStage;

impl<T: Payload> Stage<T> for PassthroughStage {
    fn run(&mut self, input: StageInput<T>) -> Result<Option<T>> {
        Ok(input.into_newest())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// A mapping stage that transforms each read into one output
pub struct MapStage<F> {
    name: String,
    read_mode: ReadMode,
    mapper: F,
}

impl<F> MapStage<F> {
    /// Create a new map stage reading single values
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            read_mode: ReadMode::Single,
            mapper,
        }
    }

    /// Start in the given read mode instead
    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }
}

impl<T, F> Stage<T> for MapStage<F>
where
    T: Payload,
    F: FnMut(StageInput<T>) -> Result<T> + Send + 'static,
{
    fn run(&mut self, input: StageInput<T>) -> Result<Option<T>> {
        (self.mapper)(input).map(Some)
    }

    fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A consuming stage for the end of a chain
pub struct SinkStage<F> {
    name: String,
    read_mode: ReadMode,
    consumer: F,
}

impl<F> SinkStage<F> {
    pub fn new(name: impl Into<String>, consumer: F) -> Self {
        Self {
            name: name.into(),
            read_mode: ReadMode::Single,
            consumer,
        }
    }

    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }
}

impl<T, F> Stage<T> for SinkStage<F>
where
    T: Payload,
    F: FnMut(StageInput<T>) -> Result<()> + Send + 'static,
{
    fn run(&mut self, input: StageInput<T>) -> Result<Option<T>> {
        (self.consumer)(input)?;
        Ok(None)
    }

    fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_passthrough_stage() {
        let mut stage = PassthroughStage;
        let output = Stage::<u32>::run(&mut stage, StageInput::Batch(vec![1, 2, 3])).unwrap();
        assert_eq!(output, Some(3));
    }

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new("double", |input: StageInput<u32>| -> Result<u32> {
            Ok(input.into_vec().iter().sum::<u32>() * 2)
        });
        assert_eq!(Stage::<u32>::run(&mut stage, StageInput::Single(5)).unwrap(), Some(10));
        assert_eq!(
            Stage::<u32>::run(&mut stage, StageInput::Batch(vec![1, 2])).unwrap(),
            Some(6)
        );
        assert_eq!(Stage::<u32>::name(&stage), "double");
    }

    #[test]
    fn test_runner_takes_stage_read_mode() {
        let stage = MapStage::new("batch", |input: StageInput<u32>| -> Result<u32> {
            Ok(input.len() as u32)
        })
        .with_read_mode(ReadMode::Batch);
        let mut runner = StageRunner::<u32>::new(Box::new(stage));
        assert_eq!(runner.read_mode(), ReadMode::Batch);
        runner.configure_read_mode(ReadMode::Single);
        assert_eq!(runner.read_mode(), ReadMode::Single);
        assert!(!runner.is_terminal());
        runner.mark_terminal();
        assert!(runner.is_terminal());
    }

    #[test]
    fn test_runner_forwards_results() {
        let input = RelayBuffer::<u32>::shared(2).unwrap();
        let output = RelayBuffer::<u32>::shared(2).unwrap();
        let mut runner = StageRunner::<u32>::new(Box::new(MapStage::new(
            "inc",
            |input: StageInput<u32>| -> Result<u32> { Ok(input.into_newest().unwrap_or(0) + 1) },
        )));
        let signal = runner.shutdown_signal();

        let (runner_input, runner_output) = (input.clone(), output.clone());
        let handle = thread::spawn(move || runner.run(&runner_input, Some(&runner_output)));

        input.put(41).unwrap();
        let mut cursor = ReadCursor::new();
        assert_eq!(output.get_latest(&mut cursor).unwrap(), 42);

        signal.request();
        // Unblock the pending read so the loop can observe the stop
        input.put(0).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(output.try_get_latest(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_terminal_runner_does_not_forward() {
        let input = RelayBuffer::<u32>::shared(1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut runner = StageRunner::<u32>::new(Box::new(SinkStage::new(
            "collect",
            move |input: StageInput<u32>| -> Result<()> {
                sink_seen.lock().extend(input.into_vec());
                Ok(())
            },
        )));
        runner.mark_terminal();
        let signal = runner.shutdown_signal();

        let runner_input = input.clone();
        let handle = thread::spawn(move || runner.run(&runner_input, None));

        input.put(7).unwrap();
        assert!(wait_for(Duration::from_secs(2), || *seen.lock() == vec![7]));

        signal.request();
        input.put(8).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn test_stop_during_run_finishes_that_run_only() {
        let input = RelayBuffer::<u32>::shared(1).unwrap();
        let output = RelayBuffer::<u32>::shared(1).unwrap();
        let runs = Arc::new(Mutex::new(0));
        let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(1);

        let stage_runs = Arc::clone(&runs);
        let mut runner = StageRunner::<u32>::new(Box::new(MapStage::new(
            "gated",
            move |input: StageInput<u32>| -> Result<u32> {
                *stage_runs.lock() += 1;
                let _ = gate_rx.recv();
                Ok(input.into_newest().unwrap_or(0))
            },
        )));
        let signal = runner.shutdown_signal();

        let (runner_input, runner_output) = (input.clone(), output.clone());
        let handle = thread::spawn(move || runner.run(&runner_input, Some(&runner_output)));

        input.put(1).unwrap();
        assert!(wait_for(Duration::from_secs(2), || *runs.lock() == 1));

        // Stop while inside run, with fresh input already waiting
        signal.request();
        input.put(2).unwrap();
        gate_tx.send(()).unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(*runs.lock(), 1);
        let mut cursor = ReadCursor::new();
        assert_eq!(output.try_get_latest(&mut cursor).unwrap(), Some(1));
    }

    #[test]
    fn test_stage_failure_ends_loop() {
        let input = RelayBuffer::<u32>::shared(1).unwrap();
        let mut runner = StageRunner::<u32>::new(Box::new(MapStage::new(
            "fails",
            |_input: StageInput<u32>| -> Result<u32> {
                Err(PipelineError::StageError("bad frame".into()))
            },
        )));
        input.put(1).unwrap();
        let result = runner.run(&input, None);
        assert!(matches!(result, Err(PipelineError::StageError(_))));
    }

    #[test]
    fn test_stop_signal_is_sticky() {
        let signal = StopSignal::new();
        assert!(!signal.is_requested());
        signal.request();
        signal.request();
        assert!(signal.is_requested());
    }
}
