use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::value::{string_arg, MapKey, Value};

pub(crate) fn register(env: &Environment) {
    super::register(env, "map", builtin_map);
    super::register(env, "get", builtin_get);
    super::register(env, "set", builtin_set);
    super::register(env, "add", builtin_add);
    super::register(env, "has", builtin_has);
    super::register(env, "delete", builtin_delete);
    super::register(env, "keys", builtin_keys);
    super::register(env, "values", builtin_values);
}

/// `map()` builds an empty map; `map(arr, fn)` transforms an array.
pub(crate) fn builtin_map(ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.is_empty() {
        return Ok(Value::empty_map());
    }
    if args.len() != 2 {
        return Err(Error::runtime("map expects no arguments or array and function"));
    }
    let elements = match &args[0] {
        Value::Array(arr) => arr.lock().unwrap().clone(),
        _ => return Err(Error::runtime("map expects array as first argument")),
    };
    let f = &args[1];
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        out.push(ev.apply_function(f, vec![element])?);
    }
    Ok(Value::array(out))
}

pub(crate) fn builtin_get(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("get expects map/object and key"));
    }
    match &args[0] {
        Value::Map(map) => {
            let key = MapKey::for_value(&args[1])?;
            Ok(map.lock().unwrap().get(&key).cloned().unwrap_or(Value::Null))
        }
        Value::Object(obj) => {
            let key = string_arg(&args[1])
                .ok_or_else(|| Error::runtime("get on object expects string key"))?;
            Ok(obj.lock().unwrap().get(key).cloned().unwrap_or(Value::Null))
        }
        _ => Err(Error::runtime("get expects map or object as first argument")),
    }
}

/// Overloaded by arity: `set()` is an empty set, `set(arr)` builds a set
/// from an array, `set(container, key, value)` inserts into a map or object.
pub(crate) fn builtin_set(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.is_empty() {
        return Ok(Value::empty_set());
    }
    if args.len() == 1 {
        let elements = match &args[0] {
            Value::Array(arr) => arr.lock().unwrap().clone(),
            _ => return Err(Error::runtime("set expects array when called with 1 argument")),
        };
        let out = Value::empty_set();
        if let Value::Set(set) = &out {
            let mut set = set.lock().unwrap();
            for element in &elements {
                set.insert(MapKey::for_value(element)?);
            }
        }
        return Ok(out);
    }
    if args.len() != 3 {
        return Err(Error::runtime("set expects: (), (array), or (map/object, key, value)"));
    }
    match &args[0] {
        Value::Map(map) => {
            let key = MapKey::for_value(&args[1])?;
            map.lock().unwrap().insert(key, args[2].clone());
            Ok(args[0].clone())
        }
        Value::Object(obj) => {
            let key = string_arg(&args[1])
                .ok_or_else(|| Error::runtime("set on object expects string key"))?;
            obj.lock().unwrap().insert(key.to_string(), args[2].clone());
            Ok(args[0].clone())
        }
        _ => Err(Error::runtime(
            "set expects map or object as first argument for key insertion",
        )),
    }
}

pub(crate) fn builtin_add(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("add expects set and value"));
    }
    match &args[0] {
        Value::Set(set) => {
            let key = MapKey::for_value(&args[1])?;
            set.lock().unwrap().insert(key);
            Ok(args[0].clone())
        }
        _ => Err(Error::runtime("add expects set as first argument")),
    }
}

pub(crate) fn builtin_has(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("has expects container and key"));
    }
    match &args[0] {
        Value::Map(map) => {
            let key = MapKey::for_value(&args[1])?;
            Ok(Value::Boolean(map.lock().unwrap().contains_key(&key)))
        }
        Value::Set(set) => {
            let key = MapKey::for_value(&args[1])?;
            Ok(Value::Boolean(set.lock().unwrap().contains(&key)))
        }
        Value::Object(obj) => {
            let key = string_arg(&args[1])
                .ok_or_else(|| Error::runtime("has on object expects string key"))?;
            Ok(Value::Boolean(obj.lock().unwrap().contains_key(key)))
        }
        _ => Err(Error::runtime("has expects map, set, or object")),
    }
}

/// Removes a key; reports whether it was present.
pub(crate) fn builtin_delete(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime("delete expects container and key"));
    }
    match &args[0] {
        Value::Map(map) => {
            let key = MapKey::for_value(&args[1])?;
            Ok(Value::Boolean(map.lock().unwrap().remove(&key).is_some()))
        }
        Value::Set(set) => {
            let key = MapKey::for_value(&args[1])?;
            Ok(Value::Boolean(set.lock().unwrap().remove(&key)))
        }
        Value::Object(obj) => {
            let key = string_arg(&args[1])
                .ok_or_else(|| Error::runtime("delete on object expects string key"))?;
            Ok(Value::Boolean(obj.lock().unwrap().remove(key).is_some()))
        }
        _ => Err(Error::runtime("delete expects map, set, or object")),
    }
}

pub(crate) fn builtin_keys(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("keys expects map/object"));
    }
    match &args[0] {
        Value::Map(map) => {
            let out: Vec<Value> = map.lock().unwrap().keys().map(|k| k.to_value()).collect();
            Ok(Value::array(out))
        }
        Value::Object(obj) => {
            let out: Vec<Value> = obj
                .lock()
                .unwrap()
                .keys()
                .map(|k| Value::String(k.clone()))
                .collect();
            Ok(Value::array(out))
        }
        _ => Err(Error::runtime("keys expects map or object")),
    }
}

pub(crate) fn builtin_values(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime("values expects map/object"));
    }
    match &args[0] {
        Value::Map(map) => {
            let out: Vec<Value> = map.lock().unwrap().values().cloned().collect();
            Ok(Value::array(out))
        }
        Value::Object(obj) => {
            let out: Vec<Value> = obj.lock().unwrap().values().cloned().collect();
            Ok(Value::array(out))
        }
        _ => Err(Error::runtime("values expects map or object")),
    }
}
