use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::language::ast::{Expression, Pattern};
use crate::runtime::channel::Channel;
use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::task::Task;

pub type ArrayRef = Arc<Mutex<Vec<Value>>>;
pub type ObjectRef = Arc<Mutex<HashMap<String, Value>>>;
pub type MapRef = Arc<Mutex<HashMap<MapKey, Value>>>;
pub type SetRef = Arc<Mutex<HashSet<MapKey>>>;

pub type BuiltinFn = dyn Fn(&Evaluator, &[Value]) -> Result<Value, Error> + Send + Sync;

/// Runtime value. Primitives are immutable and compare by content; arrays,
/// objects, maps and sets are shared mutable cells that compare by identity.
#[derive(Clone)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Char(String),
    Null,
    Unit,
    Array(ArrayRef),
    Object(ObjectRef),
    Module(Environment),
    Map(MapRef),
    Set(SetRef),
    Function(Arc<FunctionValue>),
    Builtin(BuiltinValue),
    Task(Arc<Task>),
    Channel(Arc<Channel>),
    Partial(Arc<PartialValue>),
}

/// Closure: parameter patterns, body expression, captured environment.
pub struct FunctionValue {
    pub parameters: Vec<Pattern>,
    pub body: Expression,
    pub env: Environment,
}

#[derive(Clone)]
pub struct BuiltinValue {
    pub name: String,
    pub func: Arc<BuiltinFn>,
}

impl BuiltinValue {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&Evaluator, &[Value]) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }
}

/// A deferred call: the target plus argv where `None` marks a placeholder
/// hole. Applying a partial fills holes left to right.
pub struct PartialValue {
    pub target: Value,
    pub args: Vec<Option<Value>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Integer,
    Float,
    Boolean,
    String,
    Char,
    Null,
    Unit,
    Array,
    Object,
    Map,
    Set,
    Function,
    Builtin,
    Task,
    Channel,
    Partial,
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Boolean => "boolean",
            ValueKind::String => "string",
            ValueKind::Char => "char",
            ValueKind::Null => "null",
            ValueKind::Unit => "unit",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Map => "map",
            ValueKind::Set => "set",
            ValueKind::Function => "function",
            ValueKind::Builtin => "builtin",
            ValueKind::Task => "task",
            ValueKind::Channel => "channel",
            ValueKind::Partial => "partial",
        }
    }
}

/// Hashable key for maps and sets: the kind plus a canonical text rendering.
/// Only hashable primitive kinds are admitted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapKey {
    pub kind: ValueKind,
    pub text: String,
}

impl MapKey {
    pub fn for_value(value: &Value) -> Result<MapKey, Error> {
        let (kind, text) = match value {
            Value::Integer(v) => (ValueKind::Integer, v.to_string()),
            Value::Float(v) => (ValueKind::Float, float_repr(*v)),
            Value::Boolean(v) => (ValueKind::Boolean, v.to_string()),
            Value::String(v) => (ValueKind::String, v.clone()),
            Value::Char(v) => (ValueKind::Char, v.clone()),
            Value::Null => (ValueKind::Null, "null".to_string()),
            other => {
                return Err(Error::runtime(format!(
                    "value not usable as map key: {}",
                    other.kind().name()
                )));
            }
        };
        Ok(MapKey { kind, text })
    }

    /// Reconstruct the value form of a key, for `keys(m)` and set iteration.
    pub fn to_value(&self) -> Value {
        match self.kind {
            ValueKind::Integer => Value::Integer(self.text.parse().unwrap_or(0)),
            ValueKind::Float => Value::Float(self.text.parse().unwrap_or(0.0)),
            ValueKind::Boolean => Value::Boolean(self.text == "true"),
            ValueKind::String => Value::String(self.text.clone()),
            ValueKind::Char => Value::Char(self.text.clone()),
            _ => Value::Null,
        }
    }

    /// Inspect form used inside `map{…}` and `set{…}` renderings.
    pub fn display(&self) -> String {
        match self.kind {
            ValueKind::String => format!("{:?}", self.text),
            ValueKind::Char => format!("'{}'", self.text),
            _ => self.text.clone(),
        }
    }
}

impl Value {
    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(elements)))
    }

    pub fn object(pairs: HashMap<String, Value>) -> Value {
        Value::Object(Arc::new(Mutex::new(pairs)))
    }

    pub fn empty_map() -> Value {
        Value::Map(Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn empty_set() -> Value {
        Value::Set(Arc::new(Mutex::new(HashSet::new())))
    }

    pub fn builtin<F>(name: &str, func: F) -> Value
    where
        F: Fn(&Evaluator, &[Value]) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Value::Builtin(BuiltinValue::new(name, func))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::String(_) => ValueKind::String,
            Value::Char(_) => ValueKind::Char,
            Value::Null => ValueKind::Null,
            Value::Unit => ValueKind::Unit,
            Value::Array(_) => ValueKind::Array,
            // A module value presents itself as an object.
            Value::Object(_) | Value::Module(_) => ValueKind::Object,
            Value::Map(_) => ValueKind::Map,
            Value::Set(_) => ValueKind::Set,
            Value::Function(_) => ValueKind::Function,
            Value::Builtin(_) => ValueKind::Builtin,
            Value::Task(_) => ValueKind::Task,
            Value::Channel(_) => ValueKind::Channel,
            Value::Partial(_) => ValueKind::Partial,
        }
    }

    /// Truthiness: null and unit are falsy, booleans by content, numbers
    /// falsy iff zero, strings and containers falsy iff empty, all other
    /// values truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Unit => false,
            Value::Boolean(v) => *v,
            Value::Integer(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::String(v) => !v.is_empty(),
            Value::Array(v) => !v.lock().unwrap().is_empty(),
            Value::Object(v) => !v.lock().unwrap().is_empty(),
            Value::Module(env) => !env.snapshot().is_empty(),
            Value::Map(v) => !v.lock().unwrap().is_empty(),
            Value::Set(v) => !v.lock().unwrap().is_empty(),
            _ => true,
        }
    }

    pub fn inspect(&self) -> String {
        match self {
            Value::Integer(v) => v.to_string(),
            Value::Float(v) => float_repr(*v),
            Value::Boolean(v) => v.to_string(),
            Value::String(v) => format!("{:?}", v),
            Value::Char(v) => format!("'{}'", v),
            Value::Null => "null".to_string(),
            Value::Unit => "()".to_string(),
            Value::Array(v) => {
                let elements = v.lock().unwrap();
                let parts: Vec<String> = elements.iter().map(|e| e.inspect()).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Object(v) => inspect_object_pairs(&v.lock().unwrap()),
            Value::Module(env) => inspect_object_pairs(&env.snapshot()),
            Value::Map(v) => {
                let pairs = v.lock().unwrap();
                let mut parts: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.display(), v.inspect()))
                    .collect();
                parts.sort();
                format!("map{{{}}}", parts.join(", "))
            }
            Value::Set(v) => {
                let elements = v.lock().unwrap();
                let mut parts: Vec<String> = elements.iter().map(|k| k.display()).collect();
                parts.sort();
                format!("set{{{}}}", parts.join(", "))
            }
            Value::Function(f) => {
                let params: Vec<&str> = f.parameters.iter().map(pattern_label).collect();
                format!("fn({})", params.join(", "))
            }
            Value::Builtin(b) => format!("builtin {}", b.name),
            Value::Task(t) => format!("task #{}", t.id()),
            Value::Channel(_) => "channel".to_string(),
            Value::Partial(p) => format!("partial of {}", p.target.inspect()),
        }
    }
}

fn pattern_label(pattern: &Pattern) -> &str {
    match pattern {
        Pattern::Identifier(ident) => ident.name.as_str(),
        _ => "_",
    }
}

/// Object rendering shared by objects and module views: identifier-shaped
/// keys print bare, the rest print quoted. Keys are sorted for determinism.
pub fn inspect_object_pairs(pairs: &HashMap<String, Value>) -> String {
    let mut keys: Vec<&String> = pairs.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys
        .into_iter()
        .map(|k| format!("{}: {}", inspect_object_key(k), pairs[k].inspect()))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

pub fn inspect_object_key(key: &str) -> String {
    if is_identifier_key(key) {
        key.to_string()
    } else {
        format!("{:?}", key)
    }
}

fn is_identifier_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Log rendering: strings and chars print raw, the rest via inspect.
pub fn format_log_value(value: &Value) -> String {
    match value {
        Value::String(v) => v.clone(),
        Value::Char(v) => v.clone(),
        Value::Null => "null".to_string(),
        Value::Unit => "()".to_string(),
        other => other.inspect(),
    }
}

pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    value.to_string()
}

/// Widen a numeric value to f64, tagging whether it started as an integer.
pub fn number_arg(value: &Value) -> Option<(f64, bool)> {
    match value {
        Value::Integer(v) => Some((*v as f64, true)),
        Value::Float(v) => Some((*v, false)),
        _ => None,
    }
}

/// String-or-char argument, as text.
pub fn string_arg(value: &Value) -> Option<&str> {
    match value {
        Value::String(v) => Some(v.as_str()),
        Value::Char(v) => Some(v.as_str()),
        _ => None,
    }
}

/// Strict equality: primitives by content, aggregates and callables by
/// identity of the underlying allocation.
pub fn strict_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Char(a), Value::Char(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Unit, Value::Unit) => true,
        (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
        (Value::Module(a), Value::Module(b)) => a.same(b),
        (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
        (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => Arc::ptr_eq(&a.func, &b.func),
        (Value::Task(a), Value::Task(b)) => Arc::ptr_eq(a, b),
        (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
        (Value::Partial(a), Value::Partial(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Structural equivalence, the `eqv` relation. Same kind required; containers
/// compare element-wise, callables and runtime handles fall back to identity.
pub fn equivalent(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(a), Value::Array(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (a.lock().unwrap(), b.lock().unwrap());
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| equivalent(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (a.lock().unwrap(), b.lock().unwrap());
            equivalent_pairs(&a, &b)
        }
        (Value::Module(a), Value::Module(b)) => {
            a.same(b) || equivalent_pairs(&a.snapshot(), &b.snapshot())
        }
        (Value::Map(a), Value::Map(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (a.lock().unwrap(), b.lock().unwrap());
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| equivalent(v, w)))
        }
        (Value::Set(a), Value::Set(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (a.lock().unwrap(), b.lock().unwrap());
            a.len() == b.len() && a.iter().all(|k| b.contains(k))
        }
        _ => strict_equal(left, right),
    }
}

fn equivalent_pairs(a: &HashMap<String, Value>, b: &HashMap<String, Value>) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.get(k).is_some_and(|w| equivalent(v, w)))
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inspect())
    }
}
