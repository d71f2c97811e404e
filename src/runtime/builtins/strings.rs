use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::value::{string_arg, Value};

pub(crate) fn register(env: &Environment) {
    super::register(env, "split", builtin_split);
    super::register(env, "chars", builtin_chars);
    super::register(env, "trim", builtin_trim);
    super::register(env, "toLower", builtin_to_lower);
    super::register(env, "toUpper", builtin_to_upper);
    super::register(env, "contains", builtin_contains);
    super::register(env, "startsWith", builtin_starts_with);
    super::register(env, "endsWith", builtin_ends_with);
    super::register(env, "replace", builtin_replace);
}

fn receiver<'a>(args: &'a [Value], name: &str) -> Result<&'a str, Error> {
    match args.first() {
        Some(Value::String(s)) => Ok(s.as_str()),
        _ => Err(Error::runtime(format!(
            "{} expects string as first argument",
            name
        ))),
    }
}

pub(crate) fn builtin_split(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("split expects string and separator"));
    }
    let s = receiver(args, "split")?;
    let sep = string_arg(&args[1]).ok_or_else(|| Error::runtime("split expects string separator"))?;
    // An empty separator splits into individual runes.
    if sep.is_empty() {
        let out: Vec<Value> = s.chars().map(|c| Value::String(c.to_string())).collect();
        return Ok(Value::array(out));
    }
    let out: Vec<Value> = s
        .split(sep)
        .map(|part| Value::String(part.to_string()))
        .collect();
    Ok(Value::array(out))
}

pub(crate) fn builtin_chars(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("chars expects string"));
    }
    let s = receiver(args, "chars")?;
    let out: Vec<Value> = s.chars().map(|c| Value::Char(c.to_string())).collect();
    Ok(Value::array(out))
}

pub(crate) fn builtin_trim(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("trim expects string"));
    }
    Ok(Value::String(receiver(args, "trim")?.trim().to_string()))
}

pub(crate) fn builtin_to_lower(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("toLower expects string"));
    }
    Ok(Value::String(receiver(args, "toLower")?.to_lowercase()))
}

pub(crate) fn builtin_to_upper(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("toUpper expects string"));
    }
    Ok(Value::String(receiver(args, "toUpper")?.to_uppercase()))
}

pub(crate) fn builtin_contains(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("contains expects string and substring"));
    }
    let s = receiver(args, "contains")?;
    let sub =
        string_arg(&args[1]).ok_or_else(|| Error::runtime("contains expects string substring"))?;
    Ok(Value::Boolean(s.contains(sub)))
}

pub(crate) fn builtin_starts_with(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("startsWith expects string and prefix"));
    }
    let s = receiver(args, "startsWith")?;
    let prefix =
        string_arg(&args[1]).ok_or_else(|| Error::runtime("startsWith expects string prefix"))?;
    Ok(Value::Boolean(s.starts_with(prefix)))
}

pub(crate) fn builtin_ends_with(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("endsWith expects string and suffix"));
    }
    let s = receiver(args, "endsWith")?;
    let suffix =
        string_arg(&args[1]).ok_or_else(|| Error::runtime("endsWith expects string suffix"))?;
    Ok(Value::Boolean(s.ends_with(suffix)))
}

pub(crate) fn builtin_replace(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 3 {
        return Err(Error::runtime("replace expects string, old, new"));
    }
    let s = receiver(args, "replace")?;
    let old =
        string_arg(&args[1]).ok_or_else(|| Error::runtime("replace expects string old value"))?;
    let new =
        string_arg(&args[2]).ok_or_else(|| Error::runtime("replace expects string new value"))?;
    Ok(Value::String(s.replace(old, new)))
}
