//! Execution units: one per stage, on threads or forked processes.
//!
//! The two backends stop differently and that difference is kept visible:
//!
//! - threads are stopped cooperatively. Each stage's stop flag is set and the
//!   loop exits at its next check. A thread blocked in `run` or waiting on an
//!   empty buffer keeps waiting; it is detached rather than joined.
//! - processes are stopped forcefully with `SIGKILL` and reaped with
//!   `waitpid`, so they are gone when `stop` returns whatever they were doing.

use crate::buffer::{Backend, Payload, RelayBuffer};
use crate::error::{PipelineError, Result};
use crate::stage::{StageRunner, StopSignal};
use crossbeam::channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

const EXIT_FAILED: i32 = 1;
const EXIT_PANICKED: i32 = 101;

/// How an execution unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Left its loop after a stop request
    Stopped,
    /// The stage returned an error
    Failed(String),
    /// The stage panicked
    Panicked(String),
    /// Process killed by a signal
    Killed(String),
}

/// Exit report for one execution unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    /// Stage position in the pipeline
    pub index: usize,
    /// Stage name
    pub stage: String,
    pub outcome: ExitOutcome,
}

/// Running execution units of one pipeline
pub(crate) enum ExecutionUnits {
    Threads(ThreadUnits),
    Processes(ProcessUnits),
}

impl ExecutionUnits {
    /// Launch one unit per runner. `runners[i]` reads `buffers[i]` and, unless
    /// terminal, writes `buffers[i + 1]`.
    pub(crate) fn launch<T: Payload>(
        backend: Backend,
        runners: Vec<StageRunner<T>>,
        buffers: &[RelayBuffer<T>],
    ) -> Result<Self> {
        match backend {
            Backend::Threads => ThreadUnits::launch(runners, buffers).map(ExecutionUnits::Threads),
            Backend::Processes => {
                ProcessUnits::launch(runners, buffers).map(ExecutionUnits::Processes)
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            ExecutionUnits::Threads(units) => units.units.len(),
            ExecutionUnits::Processes(units) => units.units.len(),
        }
    }

    pub(crate) fn stop(&mut self) -> Result<Vec<UnitExit>> {
        match self {
            ExecutionUnits::Threads(units) => Ok(units.stop()),
            ExecutionUnits::Processes(units) => units.stop(),
        }
    }

    pub(crate) fn exits(&mut self) -> Result<Vec<UnitExit>> {
        match self {
            ExecutionUnits::Threads(units) => Ok(units.exits()),
            ExecutionUnits::Processes(units) => units.exits(),
        }
    }

    /// Track an extra process as if it had been launched as stage `index`
    #[cfg(test)]
    pub(crate) fn adopt_process(&mut self, index: usize, name: &str, pid: Pid) {
        if let ExecutionUnits::Processes(units) = self {
            units.units.push(ProcessUnit {
                index,
                name: name.to_string(),
                pid,
                reaped: false,
            });
        }
    }
}

fn bind<T>(buffers: &[RelayBuffer<T>], index: usize, terminal: bool) -> Option<&RelayBuffer<T>> {
    if terminal {
        None
    } else {
        buffers.get(index + 1)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct ThreadUnit {
    index: usize,
    name: String,
    shutdown: StopSignal,
    handle: Option<JoinHandle<()>>,
}

/// Stage threads, stopped cooperatively
pub(crate) struct ThreadUnits {
    units: Vec<ThreadUnit>,
    exit_tx: Sender<UnitExit>,
    exit_rx: Receiver<UnitExit>,
}

impl ThreadUnits {
    fn launch<T: Payload>(runners: Vec<StageRunner<T>>, buffers: &[RelayBuffer<T>]) -> Result<Self> {
        let (exit_tx, exit_rx) = unbounded();
        let mut launched = Self {
            units: Vec::with_capacity(runners.len()),
            exit_tx,
            exit_rx,
        };

        for (index, mut runner) in runners.into_iter().enumerate() {
            let name = runner.name().to_string();
            let shutdown = runner.shutdown_signal();
            let input = buffers[index].clone();
            let output = bind(buffers, index, runner.is_terminal()).cloned();
            let exit_tx = launched.exit_tx.clone();
            let thread_name = name.clone();

            let spawned = thread::Builder::new()
                .name(format!("stage-{index}-{name}"))
                .spawn(move || {
                    let outcome = match catch_unwind(AssertUnwindSafe(|| {
                        runner.run(&input, output.as_ref())
                    })) {
                        Ok(Ok(())) => ExitOutcome::Stopped,
                        Ok(Err(e)) => {
                            tracing::warn!(stage = %thread_name, error = %e, "stage failed");
                            ExitOutcome::Failed(e.to_string())
                        }
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            tracing::warn!(stage = %thread_name, panic = %message, "stage panicked");
                            ExitOutcome::Panicked(message)
                        }
                    };
                    let _ = exit_tx.send(UnitExit {
                        index,
                        stage: thread_name,
                        outcome,
                    });
                });

            match spawned {
                Ok(handle) => {
                    tracing::debug!(index, stage = %name, "stage thread started");
                    launched.units.push(ThreadUnit {
                        index,
                        name,
                        shutdown,
                        handle: Some(handle),
                    });
                }
                Err(e) => {
                    launched.stop();
                    return Err(PipelineError::ThreadError(format!(
                        "failed to spawn stage {index} ({name}): {e}"
                    )));
                }
            }
        }

        Ok(launched)
    }

    /// Set every stop flag, join threads that have already left their loop
    /// and detach the rest.
    fn stop(&mut self) -> Vec<UnitExit> {
        for unit in &self.units {
            unit.shutdown.request();
        }

        for unit in &mut self.units {
            let Some(handle) = unit.handle.take() else {
                continue;
            };
            if handle.is_finished() {
                // Outcome already sent; panics are caught inside the closure
                let _ = handle.join();
            } else {
                tracing::debug!(
                    index = unit.index,
                    stage = %unit.name,
                    "stage still busy after stop request; detaching"
                );
            }
        }

        self.exits()
    }

    fn exits(&mut self) -> Vec<UnitExit> {
        self.exit_rx.try_iter().collect()
    }
}

struct ProcessUnit {
    index: usize,
    name: String,
    pid: Pid,
    reaped: bool,
}

/// Forked stage processes, stopped forcefully
pub(crate) struct ProcessUnits {
    units: Vec<ProcessUnit>,
}

impl ProcessUnits {
    fn launch<T: Payload>(runners: Vec<StageRunner<T>>, buffers: &[RelayBuffer<T>]) -> Result<Self> {
        let mut launched = Self {
            units: Vec::with_capacity(runners.len()),
        };

        for (index, mut runner) in runners.into_iter().enumerate() {
            let name = runner.name().to_string();

            // SAFETY: the child only runs the stage loop over process-shared
            // buffers and leaves through `_exit`, never returning into the
            // caller's stack.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let output = bind(buffers, index, runner.is_terminal());
                    run_child(&mut runner, &buffers[index], output)
                }
                Ok(ForkResult::Parent { child }) => {
                    tracing::debug!(index, stage = %name, pid = %child, "stage process started");
                    launched.units.push(ProcessUnit {
                        index,
                        name,
                        pid: child,
                        reaped: false,
                    });
                }
                Err(e) => {
                    if let Err(stop_err) = launched.stop() {
                        tracing::warn!(error = %stop_err, "failed to clean up stage processes");
                    }
                    return Err(PipelineError::ProcessError(format!(
                        "failed to fork stage {index} ({name}): {e}"
                    )));
                }
            }
        }

        Ok(launched)
    }

    /// Kill and reap every process that has not been reaped yet
    fn stop(&mut self) -> Result<Vec<UnitExit>> {
        let mut exits = Vec::new();
        let mut failures = Vec::new();

        for unit in &mut self.units {
            if unit.reaped {
                continue;
            }
            match kill(unit.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    failures.push(format!("kill stage {} (pid {}): {e}", unit.index, unit.pid));
                    continue;
                }
            }
            match waitpid(unit.pid, None) {
                Ok(status) => {
                    unit.reaped = true;
                    if let Some(exit) = exit_from_status(unit, status) {
                        exits.push(exit);
                    }
                }
                Err(e) => {
                    failures.push(format!("reap stage {} (pid {}): {e}", unit.index, unit.pid));
                }
            }
        }

        if failures.is_empty() {
            Ok(exits)
        } else {
            Err(PipelineError::ShutdownError(failures.join("; ")))
        }
    }

    /// Reap processes that already exited without blocking
    fn exits(&mut self) -> Result<Vec<UnitExit>> {
        let mut exits = Vec::new();
        for unit in &mut self.units {
            if unit.reaped {
                continue;
            }
            let status = waitpid(unit.pid, Some(WaitPidFlag::WNOHANG))?;
            if let Some(exit) = exit_from_status(unit, status) {
                unit.reaped = true;
                exits.push(exit);
            }
        }
        Ok(exits)
    }
}

fn run_child<T: Payload>(
    runner: &mut StageRunner<T>,
    input: &RelayBuffer<T>,
    output: Option<&RelayBuffer<T>>,
) -> ! {
    tie_to_parent();

    let code = match catch_unwind(AssertUnwindSafe(|| runner.run(input, output))) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::warn!(stage = %runner.name(), error = %e, "stage failed");
            EXIT_FAILED
        }
        Err(_) => EXIT_PANICKED,
    };
    // SAFETY: leaves the forked child without unwinding into the parent's
    // copied stack or running its exit handlers
    unsafe { libc::_exit(code) }
}

/// Have the kernel kill this stage process if the pipeline's process dies
#[cfg(target_os = "linux")]
fn tie_to_parent() {
    if let Err(e) = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL) {
        tracing::warn!(error = %e, "failed to tie stage process to its parent");
    }
}

#[cfg(not(target_os = "linux"))]
fn tie_to_parent() {}

fn exit_from_status(unit: &ProcessUnit, status: WaitStatus) -> Option<UnitExit> {
    let outcome = match status {
        WaitStatus::Exited(_, 0) => ExitOutcome::Stopped,
        WaitStatus::Exited(_, EXIT_PANICKED) => {
            ExitOutcome::Panicked(format!("stage process exited with {EXIT_PANICKED}"))
        }
        WaitStatus::Exited(_, code) => {
            ExitOutcome::Failed(format!("stage process exited with {code}"))
        }
        WaitStatus::Signaled(_, signal, _) => ExitOutcome::Killed(signal.as_str().to_string()),
        _ => return None,
    };
    Some(UnitExit {
        index: unit.index,
        stage: unit.name.clone(),
        outcome,
    })
}
