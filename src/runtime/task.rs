use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, never, select, Receiver, Select, Sender};
use tracing::debug;

use crate::runtime::error::{Error, UnhandledTaskError};
use crate::runtime::value::Value;

/// The pair of broadcast receivers every blocking primitive selects on next
/// to its own event: the current task's cancellation and the runtime's fatal
/// signal. Both fire by sender-drop, never by message.
pub struct WaitContext {
    pub cancel: Receiver<()>,
    pub fatal: Receiver<()>,
}

impl WaitContext {
    /// A context that never interrupts; used outside any task and runtime.
    pub fn detached() -> WaitContext {
        WaitContext {
            cancel: never(),
            fatal: never(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
    Canceled,
}

struct TaskOutcome {
    state: TaskState,
    value: Value,
    error: Option<Error>,
}

/// An independently scheduled evaluation unit. The done and cancel channels
/// broadcast by dropping their sender; the outcome is written exactly once.
pub struct Task {
    id: u64,
    parent: Option<u64>,
    detached: bool,
    observed: AtomicBool,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    outcome: Mutex<TaskOutcome>,
}

/// How a blocking wait on a task ended.
pub enum TaskWait {
    Done,
    Canceled,
    Fatal,
}

impl Task {
    fn new(id: u64, parent: Option<u64>, detached: bool) -> Task {
        let (done_tx, done_rx) = bounded(0);
        let (cancel_tx, cancel_rx) = bounded(0);
        Task {
            id,
            parent,
            detached,
            observed: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            outcome: Mutex::new(TaskOutcome {
                state: TaskState::Pending,
                value: Value::Unit,
                error: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Register consumer interest. Must happen before any continuation or
    /// awaiting worker starts, so the fail-fast scan never sees a consumed
    /// task as detached.
    pub fn mark_observed(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }

    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TaskState {
        self.outcome.lock().unwrap().state
    }

    pub fn cancel_signal(&self) -> Receiver<()> {
        self.cancel_rx.clone()
    }

    pub fn done_signal(&self) -> Receiver<()> {
        self.done_rx.clone()
    }

    /// Close the cancel channel. Monotonic: later calls are no-ops.
    pub fn cancel(&self) {
        if self.cancel_tx.lock().unwrap().take().is_some() {
            debug!(task = self.id, "task canceled");
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_tx.lock().unwrap().is_none()
    }

    /// Record the successful result and broadcast completion. The first
    /// terminal transition wins; anything after it is dropped.
    pub fn complete(&self, value: Value) {
        {
            let mut outcome = self.outcome.lock().unwrap();
            if outcome.state != TaskState::Pending {
                return;
            }
            outcome.state = TaskState::Completed;
            outcome.value = value;
        }
        debug!(task = self.id, "task completed");
        self.done_tx.lock().unwrap().take();
    }

    /// Record a failure (or cancellation, when the error is the canceled
    /// kind) and broadcast completion.
    pub fn fail(&self, error: Error) {
        let state = if error.is_canceled() {
            TaskState::Canceled
        } else {
            TaskState::Failed
        };
        {
            let mut outcome = self.outcome.lock().unwrap();
            if outcome.state != TaskState::Pending {
                return;
            }
            outcome.state = state;
            outcome.error = Some(error);
        }
        debug!(task = self.id, state = ?state, "task failed");
        self.done_tx.lock().unwrap().take();
    }

    /// Block until this task completes, the waiting context is canceled, or
    /// the runtime goes fatal.
    pub fn wait(&self, wait: &WaitContext) -> TaskWait {
        select! {
            recv(self.done_rx) -> _ => TaskWait::Done,
            recv(wait.cancel) -> _ => TaskWait::Canceled,
            recv(wait.fatal) -> _ => TaskWait::Fatal,
        }
    }

    /// The terminal outcome. Every await on a finished task sees the same
    /// value or error.
    pub fn result(&self) -> Result<Value, Error> {
        let outcome = self.outcome.lock().unwrap();
        match outcome.state {
            TaskState::Completed => Ok(outcome.value.clone()),
            TaskState::Failed => Err(outcome.error.clone().unwrap_or_else(|| {
                Error::runtime("task failed without an error")
            })),
            TaskState::Canceled => Err(outcome.error.clone().unwrap_or_else(Error::canceled)),
            TaskState::Pending => Err(Error::runtime("task has not finished")),
        }
    }
}

/// Race over already-spawned tasks: the index of the first one to finish.
pub enum RaceWait {
    Winner(usize),
    Canceled,
    Fatal,
}

pub fn race(tasks: &[Arc<Task>], wait: &WaitContext) -> RaceWait {
    let done: Vec<Receiver<()>> = tasks.iter().map(|t| t.done_signal()).collect();
    let mut sel = Select::new();
    for rx in &done {
        sel.recv(rx);
    }
    let cancel_index = sel.recv(&wait.cancel);
    let fatal_index = sel.recv(&wait.fatal);
    let op = sel.select();
    let index = op.index();
    if index == cancel_index {
        let _ = op.recv(&wait.cancel);
        return RaceWait::Canceled;
    }
    if index == fatal_index {
        let _ = op.recv(&wait.fatal);
        return RaceWait::Fatal;
    }
    let _ = op.recv(&done[index]);
    RaceWait::Winner(index)
}

enum InputSource {
    Stdin,
    Reader(Box<dyn BufRead + Send>),
}

enum OutputSink {
    Stdout,
    Buffer(String),
}

/// Process-wide runtime state: task ids, the write-once fatal slot with its
/// broadcast channel, the collected messages of unobserved task failures,
/// and the process surface (argv, program path, stdin, log output).
pub struct Runtime {
    next_task_id: AtomicU64,
    fatal_tx: Mutex<Option<Sender<()>>>,
    fatal_rx: Receiver<()>,
    fatal_error: Mutex<Option<Error>>,
    unhandled: Mutex<Vec<String>>,
    program_args: Vec<String>,
    program_path: Option<String>,
    input: Mutex<InputSource>,
    output: Mutex<OutputSink>,
}

impl Runtime {
    pub fn new() -> Runtime {
        let (fatal_tx, fatal_rx) = bounded(0);
        Runtime {
            next_task_id: AtomicU64::new(1),
            fatal_tx: Mutex::new(Some(fatal_tx)),
            fatal_rx,
            fatal_error: Mutex::new(None),
            unhandled: Mutex::new(Vec::new()),
            program_args: Vec::new(),
            program_path: None,
            input: Mutex::new(InputSource::Stdin),
            output: Mutex::new(OutputSink::Stdout),
        }
    }

    pub fn with_program_args(mut self, args: Vec<String>) -> Runtime {
        self.program_args = args;
        self
    }

    pub fn with_program_path(mut self, path: impl Into<String>) -> Runtime {
        self.program_path = Some(path.into());
        self
    }

    /// Route `log` output into an in-memory buffer; used by tests and
    /// embedders that capture program output.
    pub fn with_buffered_output(self) -> Runtime {
        *self.output.lock().unwrap() = OutputSink::Buffer(String::new());
        self
    }

    /// Replace stdin as the `readLine` source.
    pub fn with_input(self, reader: Box<dyn BufRead + Send>) -> Runtime {
        *self.input.lock().unwrap() = InputSource::Reader(reader);
        self
    }

    pub fn new_task(&self, parent: Option<u64>, detached: bool) -> Arc<Task> {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        debug!(task = id, ?parent, detached, "task spawned");
        Arc::new(Task::new(id, parent, detached))
    }

    pub fn fatal_signal(&self) -> Receiver<()> {
        self.fatal_rx.clone()
    }

    /// Record the formatted failure of a task nobody observed. The first one
    /// latches the fatal slot and broadcasts the fatal signal so every
    /// blocked primitive aborts.
    pub fn record_unhandled_failure(&self, error: Error, formatted: String) {
        self.unhandled.lock().unwrap().push(formatted);
        let mut slot = self.fatal_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
            drop(slot);
            debug!("fatal signal latched");
            self.fatal_tx.lock().unwrap().take();
        }
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal_error.lock().unwrap().is_some()
    }

    /// The aggregated error blocked primitives return once the fatal signal
    /// has fired.
    pub fn fatal_task_failure(&self) -> Error {
        let messages = self.unhandled.lock().unwrap().clone();
        if messages.is_empty() {
            Error::runtime("runtime terminated")
        } else {
            Error::UnhandledTasks(UnhandledTaskError { messages })
        }
    }

    pub fn check_unhandled_task_failures(&self) -> Option<UnhandledTaskError> {
        let messages = self.unhandled.lock().unwrap().clone();
        if messages.is_empty() {
            None
        } else {
            Some(UnhandledTaskError { messages })
        }
    }

    pub fn program_args(&self) -> &[String] {
        &self.program_args
    }

    pub fn program_path(&self) -> Option<&str> {
        self.program_path.as_deref()
    }

    pub fn environ(&self) -> Vec<String> {
        let mut entries: Vec<String> = std::env::vars()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        entries.sort();
        entries
    }

    pub fn lookup_env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    /// One line from the input source, without its trailing newline.
    /// `Ok(None)` is end of input.
    pub fn read_line(&self) -> std::io::Result<Option<String>> {
        let mut buf = String::new();
        let read = match &mut *self.input.lock().unwrap() {
            InputSource::Stdin => std::io::stdin().read_line(&mut buf)?,
            InputSource::Reader(reader) => reader.read_line(&mut buf)?,
        };
        if read == 0 {
            return Ok(None);
        }
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        Ok(Some(buf))
    }

    pub fn write_log_line(&self, line: &str) {
        match &mut *self.output.lock().unwrap() {
            OutputSink::Stdout => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                let _ = writeln!(handle, "{}", line);
            }
            OutputSink::Buffer(buf) => {
                buf.push_str(line);
                buf.push('\n');
            }
        }
    }

    /// Drain the buffered output sink. Empty when logging goes to stdout.
    pub fn take_output(&self) -> String {
        match &mut *self.output.lock().unwrap() {
            OutputSink::Buffer(buf) => std::mem::take(buf),
            OutputSink::Stdout => String::new(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn repeated_awaits_see_the_same_outcome() {
        let runtime = Runtime::new();
        let task = runtime.new_task(None, false);
        task.complete(Value::Integer(9));
        task.complete(Value::Integer(10));
        for _ in 0..3 {
            let wait = WaitContext::detached();
            assert!(matches!(task.wait(&wait), TaskWait::Done));
            assert!(matches!(task.result(), Ok(Value::Integer(9))));
        }
    }

    #[test]
    fn cancel_is_monotonic() {
        let runtime = Runtime::new();
        let task = runtime.new_task(None, false);
        assert!(!task.is_canceled());
        task.cancel();
        task.cancel();
        assert!(task.is_canceled());
        // The cancel broadcast is observable through the signal.
        assert!(task.cancel_signal().recv().is_err());
    }

    #[test]
    fn failing_marks_terminal_state() {
        let runtime = Runtime::new();
        let task = runtime.new_task(None, false);
        task.fail(Error::runtime("boom"));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.result().is_err());

        let canceled = runtime.new_task(None, false);
        canceled.fail(Error::canceled());
        assert_eq!(canceled.state(), TaskState::Canceled);
        assert!(canceled.result().unwrap_err().is_canceled());
    }

    #[test]
    fn fatal_latch_wakes_blocked_waiters() {
        let runtime = Arc::new(Runtime::new());
        let task = runtime.new_task(None, false);
        let waiter_runtime = runtime.clone();
        let waiter_task = task.clone();
        let handle = thread::spawn(move || {
            let wait = WaitContext {
                cancel: never(),
                fatal: waiter_runtime.fatal_signal(),
            };
            matches!(waiter_task.wait(&wait), TaskWait::Fatal)
        });
        thread::sleep(Duration::from_millis(20));
        runtime.record_unhandled_failure(Error::runtime("boom"), "runtime error: boom".into());
        assert!(handle.join().unwrap());
        let unhandled = runtime.check_unhandled_task_failures().unwrap();
        assert_eq!(unhandled.messages, vec!["runtime error: boom".to_string()]);
    }

    #[test]
    fn only_the_first_fatal_error_latches() {
        let runtime = Runtime::new();
        runtime.record_unhandled_failure(Error::runtime("first"), "first".into());
        runtime.record_unhandled_failure(Error::runtime("second"), "second".into());
        match runtime.fatal_task_failure() {
            Error::UnhandledTasks(e) => assert_eq!(e.messages.len(), 2),
            other => panic!("unexpected fatal error: {other:?}"),
        }
    }

    #[test]
    fn race_reports_the_first_finisher() {
        let runtime = Runtime::new();
        let slow = runtime.new_task(None, false);
        let fast = runtime.new_task(None, false);
        let fast_clone = fast.clone();
        let slow_clone = slow.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            slow_clone.complete(Value::Integer(1));
        });
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            fast_clone.complete(Value::Integer(2));
        });
        let wait = WaitContext::detached();
        match race(&[slow, fast], &wait) {
            RaceWait::Winner(index) => assert_eq!(index, 1),
            _ => panic!("expected a winner"),
        }
    }
}
