use std::thread;

use crate::runtime::channel::{RecvWait, SendWait};
use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::value::Value;

pub(crate) fn register(env: &Environment) {
    super::register(env, "then", builtin_then);
    super::register(env, "send", builtin_send);
    super::register(env, "recv", builtin_recv);
    super::register(env, "done", builtin_done);
}

/// `then(task, fn)` schedules `fn(await task)` as a new task.
pub(crate) fn builtin_then(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("then expects task and function"));
    }
    let upstream = match &args[0] {
        Value::Task(task) => task.clone(),
        _ => return Err(Error::runtime("then expects task as receiver")),
    };
    // Observation registers at chaining time, before the continuation worker
    // starts, so the fail-fast scan never sees the upstream as detached.
    upstream.mark_observed();

    let continuation = ev
        .runtime()
        .new_task(ev.current_task.as_ref().map(|t| t.id()), false);
    let worker = ev.clone_for_task(continuation.clone());
    let continuation_task = continuation.clone();
    let f = args[1].clone();
    thread::spawn(move || match worker.await_task(&upstream) {
        Ok(value) => match worker.apply_function(&f, vec![value]) {
            Ok(result) => continuation_task.complete(result),
            Err(err) => worker.handle_async_error(&continuation_task, err),
        },
        Err(err) => worker.handle_async_error(&continuation_task, err),
    });
    Ok(Value::Task(continuation))
}

pub(crate) fn builtin_send(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("send expects channel and value"));
    }
    let channel = match &args[0] {
        Value::Channel(ch) => ch,
        _ => return Err(Error::runtime("send expects channel")),
    };
    if channel.is_closed() {
        return Err(Error::runtime("send on closed channel"));
    }
    match channel.send(args[1].clone(), &ev.wait_context()) {
        SendWait::Sent => Ok(Value::Unit),
        SendWait::Closed => Err(Error::runtime("send on closed channel")),
        SendWait::Canceled => Err(Error::canceled()),
        SendWait::Fatal => Err(ev.runtime().fatal_task_failure()),
    }
}

/// Returns `[value, false]`, or `[null, true]` once the channel is closed
/// and drained.
pub(crate) fn builtin_recv(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("recv expects channel"));
    }
    let channel = match &args[0] {
        Value::Channel(ch) => ch,
        _ => return Err(Error::runtime("recv expects channel")),
    };
    match channel.recv(&ev.wait_context()) {
        RecvWait::Received(value) => Ok(Value::array(vec![value, Value::Boolean(false)])),
        RecvWait::Drained => Ok(Value::array(vec![Value::Null, Value::Boolean(true)])),
        RecvWait::Canceled => Err(Error::canceled()),
        RecvWait::Fatal => Err(ev.runtime().fatal_task_failure()),
    }
}

pub(crate) fn builtin_done(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("done expects channel"));
    }
    match &args[0] {
        Value::Channel(ch) => {
            ch.close();
            Ok(Value::Unit)
        }
        _ => Err(Error::runtime("done expects channel")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel::Channel;
    use crate::runtime::task::Runtime;
    use std::sync::Arc;
    use std::time::Duration;

    fn ev() -> Evaluator {
        Evaluator::new(Arc::new(Runtime::new()))
    }

    #[test]
    fn send_then_recv_yields_value_and_not_done() {
        let e = ev();
        let ch = Value::Channel(Arc::new(Channel::new(1)));
        builtin_send(&e, &[ch.clone(), Value::Integer(42)]).unwrap();
        let out = builtin_recv(&e, &[ch]).unwrap();
        assert_eq!(out.inspect(), "[42, false]");
    }

    #[test]
    fn recv_after_done_reports_end_of_stream() {
        let e = ev();
        let ch = Value::Channel(Arc::new(Channel::new(1)));
        builtin_done(&e, &[ch.clone()]).unwrap();
        builtin_done(&e, &[ch.clone()]).unwrap();
        let out = builtin_recv(&e, &[ch.clone()]).unwrap();
        assert_eq!(out.inspect(), "[null, true]");
        let err = builtin_send(&e, &[ch, Value::Integer(1)]).unwrap_err();
        assert!(err.to_string().contains("send on closed channel"));
    }

    #[test]
    fn then_runs_the_continuation_on_the_task_value() {
        let e = ev();
        let upstream = e.runtime().new_task(None, false);
        upstream.complete(Value::Integer(20));

        let doubler = Value::builtin("double", |_ev, args: &[Value]| match &args[0] {
            Value::Integer(v) => Ok(Value::Integer(v * 2)),
            _ => Err(Error::runtime("expected integer")),
        });
        let chained = builtin_then(&e, &[Value::Task(upstream.clone()), doubler]).unwrap();
        assert!(upstream.is_observed());
        let task = match chained {
            Value::Task(task) => task,
            other => panic!("expected task, got {other:?}"),
        };
        // The continuation runs on its own worker; give it a moment.
        for _ in 0..100 {
            if !matches!(task.state(), crate::runtime::task::TaskState::Pending) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(task.result(), Ok(Value::Integer(40))));
    }

    #[test]
    fn then_propagates_upstream_failure() {
        let e = ev();
        let upstream = e.runtime().new_task(None, false);
        upstream.fail(Error::runtime("boom"));

        let identity = Value::builtin("id", |_ev, args: &[Value]| Ok(args[0].clone()));
        let chained = builtin_then(&e, &[Value::Task(upstream), identity]).unwrap();
        let task = match chained {
            Value::Task(task) => task,
            other => panic!("expected task, got {other:?}"),
        };
        for _ in 0..100 {
            if !matches!(task.state(), crate::runtime::task::TaskState::Pending) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(task.result().unwrap_err().to_string(), "boom");
    }
}
