//! Process-surface and utility built-ins: argv, environment, stdin, random
//! numbers, parsing and the clock.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::value::{number_arg, Value};

pub(crate) fn register(env: &Environment) {
    super::register(env, "argv", builtin_argv);
    super::register(env, "programPath", builtin_program_path);
    super::register(env, "environ", builtin_environ);
    super::register(env, "env", builtin_env);
    super::register(env, "readLine", builtin_read_line);
    super::register(env, "rand", builtin_rand);
    super::register(env, "randInt", builtin_rand_int);
    super::register(env, "randFloat", builtin_rand_float);
    super::register(env, "parseInt", builtin_parse_int);
    super::register(env, "now", builtin_now);
}

fn builtin_argv(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("argv expects no arguments"));
    }
    let out: Vec<Value> = ev
        .runtime()
        .program_args()
        .iter()
        .map(|arg| Value::String(arg.clone()))
        .collect();
    Ok(Value::array(out))
}

fn builtin_program_path(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("programPath expects no arguments"));
    }
    match ev.runtime().program_path() {
        Some(path) => Ok(Value::String(path.to_string())),
        None => Ok(Value::Null),
    }
}

fn builtin_environ(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("environ expects no arguments"));
    }
    let out: Vec<Value> = ev
        .runtime()
        .environ()
        .into_iter()
        .map(Value::String)
        .collect();
    Ok(Value::array(out))
}

fn builtin_env(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("env expects 1 argument"));
    }
    let name = match &args[0] {
        Value::String(name) => name,
        _ => return Err(Error::runtime("env expects string argument")),
    };
    match ev.runtime().lookup_env(name) {
        Some(value) => Ok(Value::String(value)),
        None => Ok(Value::Null),
    }
}

fn builtin_read_line(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("readLine expects no arguments"));
    }
    match ev.runtime().read_line() {
        Ok(Some(line)) => Ok(Value::String(line)),
        Ok(None) => Ok(Value::Null),
        Err(e) => Err(Error::recoverable(
            "readLine",
            format!("readLine error: {}", e),
        )),
    }
}

fn builtin_rand(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("rand expects no arguments"));
    }
    Ok(Value::Integer(rand::thread_rng().gen_range(0..i64::MAX)))
}

/// Inclusive on both ends; the span must fit in i64.
fn builtin_rand_int(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("randInt expects min and max"));
    }
    let min = match &args[0] {
        Value::Integer(v) => *v,
        _ => return Err(Error::runtime("randInt expects integer min")),
    };
    let max = match &args[1] {
        Value::Integer(v) => *v,
        _ => return Err(Error::runtime("randInt expects integer max")),
    };
    if max < min {
        return Err(Error::runtime("randInt expects min <= max"));
    }
    if max == min {
        return Ok(Value::Integer(min));
    }
    match max.checked_sub(min) {
        Some(diff) if diff < i64::MAX => {}
        _ => return Err(Error::runtime("randInt range too large")),
    }
    Ok(Value::Integer(rand::thread_rng().gen_range(min..=max)))
}

fn builtin_rand_float(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("randFloat expects min and max"));
    }
    let (min, _) =
        number_arg(&args[0]).ok_or_else(|| Error::runtime("randFloat expects numeric min"))?;
    let (max, _) =
        number_arg(&args[1]).ok_or_else(|| Error::runtime("randFloat expects numeric max"))?;
    if max < min {
        return Err(Error::runtime("randFloat expects min <= max"));
    }
    let sample: f64 = rand::thread_rng().gen();
    Ok(Value::Float(min + sample * (max - min)))
}

fn builtin_parse_int(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("parseInt expects 1 argument"));
    }
    let s = match &args[0] {
        Value::String(s) => s,
        _ => return Err(Error::runtime("parseInt expects string")),
    };
    s.parse::<i64>()
        .map(Value::Integer)
        .map_err(|_| Error::runtime(format!("invalid integer: {}", s)))
}

/// Milliseconds since the Unix epoch.
fn builtin_now(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if !args.is_empty() {
        return Err(Error::runtime("now expects no arguments"));
    }
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::runtime("system clock before epoch"))?;
    Ok(Value::Integer(elapsed.as_millis() as i64))
}
