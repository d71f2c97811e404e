//! Built-in functions, registered once into the base environment at
//! evaluator construction.

pub mod async_ops;
pub mod collections;
pub mod numeric;
pub mod strings;
pub mod system;

use std::time::Duration;

use crossbeam_channel::{after, select};

use crate::runtime::channel::{Channel, MAX_CHANNEL_CAPACITY};
use crate::runtime::environment::Environment;
use crate::runtime::error::{Error, ExitError};
use crate::runtime::evaluator::Evaluator;
use crate::runtime::value::{format_log_value, Value};

pub fn base_environment() -> Environment {
    let env = Environment::new();
    register(&env, "exit", builtin_exit);
    register(&env, "fail", builtin_fail);
    register(&env, "channel", builtin_channel);
    register(&env, "rendezvous", builtin_channel);
    register(&env, "buffered", builtin_buffered);
    register(&env, "sleep", builtin_sleep);
    register(&env, "log", builtin_log);
    register(&env, "str", builtin_str);
    strings::register(&env);
    collections::register(&env);
    numeric::register(&env);
    system::register(&env);
    async_ops::register(&env);
    env
}

pub(crate) fn register(
    env: &Environment,
    name: &str,
    f: fn(&Evaluator, &[Value]) -> Result<Value, Error>,
) {
    env.define(name, Value::builtin(name, f));
}

fn builtin_exit(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    let (message, code) = match args.first() {
        None => (String::new(), 0),
        Some(Value::Integer(n)) => (n.to_string(), *n as i32),
        Some(other) => (other.inspect(), 0),
    };
    Err(Error::Exit(ExitError { message, code }))
}

fn builtin_fail(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() > 1 {
        return Err(Error::runtime("fail expects 0 or 1 argument"));
    }
    let message = match args.first() {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(Error::runtime("fail expects string message")),
    };
    Err(Error::recoverable("fail", message))
}

fn builtin_channel(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("channel expects no arguments"));
    }
    Ok(Value::Channel(std::sync::Arc::new(Channel::new(0))))
}

fn builtin_buffered(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("buffered expects 1 argument (buffer size)"));
    }
    let size = match &args[0] {
        Value::Integer(n) => *n,
        _ => return Err(Error::runtime("buffered expects integer buffer size")),
    };
    if size < 0 {
        return Err(Error::runtime("buffered expects non-negative buffer size"));
    }
    if size > MAX_CHANNEL_CAPACITY {
        return Err(Error::runtime("buffered buffer size too large (max 1000000)"));
    }
    Ok(Value::Channel(std::sync::Arc::new(Channel::new(
        size as usize,
    ))))
}

fn builtin_sleep(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("sleep expects 1 argument"));
    }
    let ms = match &args[0] {
        Value::Integer(n) => *n,
        _ => return Err(Error::runtime("sleep expects integer milliseconds")),
    };
    if ms <= 0 {
        return Ok(Value::Unit);
    }
    let wait = ev.wait_context();
    let timer = after(Duration::from_millis(ms as u64));
    select! {
        recv(timer) -> _ => Ok(Value::Unit),
        recv(wait.cancel) -> _ => Err(Error::canceled()),
        recv(wait.fatal) -> _ => Err(ev.runtime().fatal_task_failure()),
    }
}

fn builtin_log(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    let parts: Vec<String> = args.iter().map(format_log_value).collect();
    ev.runtime().write_log_line(&parts.join(" "));
    Ok(Value::Unit)
}

fn builtin_str(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("str expects 1 argument"));
    }
    Ok(Value::String(format_log_value(&args[0])))
}
