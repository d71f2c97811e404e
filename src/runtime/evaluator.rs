use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crate::language::ast::{
    AwaitExpression, BlockExpression, CallExpression, Expression, ForExpression, IfExpression,
    ImportExpression, IndexExpression, LambdaExpression, MatchExpression, MemberExpression,
    Pattern, Program, QueryExpression, RaceExpression, RangeExpression, RecoverExpression,
    SliceExpression, SpawnExpression, Statement,
};
use crate::runtime::builtins;
use crate::runtime::environment::Environment;
use crate::runtime::error::{format_runtime_error, Error, UnhandledTaskError};
use crate::runtime::modules::{resolve_import_path, ModuleState, ParseFn};
use crate::runtime::task::{self, RaceWait, Runtime, Task, TaskWait, WaitContext};
use crate::runtime::value::{
    strict_equal, string_arg, FunctionValue, PartialValue, Value, ValueKind,
};
use crossbeam_channel::never;

/// Out-of-band loop control consumed by `for`.
#[derive(Clone, Debug)]
pub enum Signal {
    Break(Option<Value>),
    Continue,
}

/// What an expression evaluated to: a value, or a signal travelling up to
/// the enclosing loop.
#[derive(Debug)]
pub enum Evaluated {
    Value(Value),
    Signal(Signal),
}

pub type EvalResult = Result<Evaluated, Error>;

/// Unwrap a value out of an `EvalResult`, letting signals bubble to the
/// caller unchanged.
macro_rules! try_value {
    ($e:expr) => {
        match $e? {
            $crate::runtime::evaluator::Evaluated::Value(v) => v,
            other => return Ok(other),
        }
    };
}
pub(crate) use try_value;

/// Walks the AST. Cloning an evaluator is cheap; every spawned task gets its
/// own clone with `current_task` swapped so concurrent tasks never share
/// mutable evaluator state. The module cache, runtime and base environment
/// are the shared, concurrency-safe parts.
#[derive(Clone)]
pub struct Evaluator {
    pub(crate) source: String,
    pub(crate) filename: String,
    pub(crate) project_root: Option<PathBuf>,
    pub(crate) parse: Option<ParseFn>,
    pub(crate) modules: Arc<ModuleState>,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) base: Environment,
    pub(crate) current_task: Option<Arc<Task>>,
}

impl Evaluator {
    pub fn new(runtime: Arc<Runtime>) -> Evaluator {
        Evaluator {
            source: String::new(),
            filename: "<stdin>".to_string(),
            project_root: None,
            parse: None,
            modules: Arc::new(ModuleState::new()),
            runtime,
            base: builtins::base_environment(),
            current_task: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>, filename: impl Into<String>) -> Self {
        self.source = source.into();
        self.filename = filename.into();
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn with_parser(mut self, parse: ParseFn) -> Self {
        self.parse = Some(parse);
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The environment holding every registered builtin. Programs run in a
    /// child of this scope.
    pub fn base_environment(&self) -> Environment {
        self.base.clone()
    }

    pub(crate) fn clone_for_task(&self, task: Arc<Task>) -> Evaluator {
        let mut clone = self.clone();
        clone.current_task = Some(task);
        clone
    }

    pub(crate) fn wait_context(&self) -> WaitContext {
        WaitContext {
            cancel: match &self.current_task {
                Some(task) => task.cancel_signal(),
                None => never(),
            },
            fatal: self.runtime.fatal_signal(),
        }
    }

    /// Run a program to completion. The program's value is its last
    /// statement's value; a break or continue escaping to the top level is
    /// an error.
    pub fn evaluate(&self, program: &Program, env: &Environment) -> Result<Value, Error> {
        let mut result = Value::Unit;
        for statement in &program.statements {
            match self.eval_statement(statement, env)? {
                Evaluated::Value(v) => result = v,
                Evaluated::Signal(_) => {
                    return Err(
                        Error::runtime("break/continue outside loop").with_token(statement.token())
                    );
                }
            }
        }
        Ok(result)
    }

    /// Failures of tasks nobody awaited, aggregated for the caller to print
    /// verbatim after the program ends.
    pub fn check_unhandled_task_failures(&self) -> Option<UnhandledTaskError> {
        self.runtime.check_unhandled_task_failures()
    }

    fn eval_statement(&self, statement: &Statement, env: &Environment) -> EvalResult {
        match statement {
            Statement::Let(stmt) => {
                let value = try_value!(self.eval(&stmt.value, env));
                if !self.match_pattern(&stmt.pattern, &value, env)? {
                    return Err(
                        Error::runtime("let pattern did not match").with_token(&stmt.token)
                    );
                }
                Ok(Evaluated::Value(Value::Unit))
            }
            Statement::Expression(stmt) => self.eval(&stmt.expression, env),
        }
    }

    /// Evaluate one expression. Errors bubbling out of a node without a
    /// source position pick up that node's token.
    pub fn eval(&self, node: &Expression, env: &Environment) -> EvalResult {
        match self.eval_expression(node, env) {
            Err(err) => Err(err.with_token(node.token())),
            ok => ok,
        }
    }

    fn eval_expression(&self, node: &Expression, env: &Environment) -> EvalResult {
        match node {
            Expression::Identifier(ident) => match env.get(&ident.name) {
                Some(value) => Ok(Evaluated::Value(value)),
                None => Err(Error::runtime(format!(
                    "undefined identifier: {}",
                    ident.name
                ))),
            },
            Expression::Placeholder(_) => {
                Err(Error::runtime("placeholder outside call arguments"))
            }
            Expression::Integer(lit) => Ok(Evaluated::Value(Value::Integer(lit.value))),
            Expression::Float(lit) => Ok(Evaluated::Value(Value::Float(lit.value))),
            Expression::Boolean(lit) => Ok(Evaluated::Value(Value::Boolean(lit.value))),
            Expression::Str(lit) => Ok(Evaluated::Value(Value::String(lit.value.clone()))),
            Expression::Char(lit) => Ok(Evaluated::Value(Value::Char(lit.value.clone()))),
            Expression::Null(_) => Ok(Evaluated::Value(Value::Null)),
            Expression::Unit(_) => Ok(Evaluated::Value(Value::Unit)),
            Expression::Array(lit) => {
                let mut elements = Vec::with_capacity(lit.elements.len());
                for element in &lit.elements {
                    elements.push(try_value!(self.eval(element, env)));
                }
                Ok(Evaluated::Value(Value::array(elements)))
            }
            Expression::Object(lit) => {
                let mut pairs = std::collections::HashMap::new();
                for (key, value) in &lit.pairs {
                    let value = try_value!(self.eval(value, env));
                    pairs.insert(key.clone(), value);
                }
                Ok(Evaluated::Value(Value::object(pairs)))
            }
            Expression::Prefix(n) => self.eval_prefix(n, env),
            Expression::Infix(n) => self.eval_infix(n, env),
            Expression::Assign(n) => self.eval_assign(n, env),
            Expression::Postfix(n) => self.eval_postfix(n, env),
            Expression::If(n) => self.eval_if(n, env),
            Expression::Block(n) => self.eval_block(n, env),
            Expression::For(n) => self.eval_for(n, env),
            Expression::Match(n) => self.eval_match(n, env),
            Expression::Lambda(n) => self.eval_lambda(n, env),
            Expression::Call(n) => self.eval_call(n, env),
            Expression::Member(n) => self.eval_member(n, env),
            Expression::Index(n) => self.eval_index(n, env),
            Expression::Slice(n) => self.eval_slice(n, env),
            Expression::Range(n) => self.eval_range(n, env),
            Expression::Query(n) => self.eval_query(n, env),
            Expression::Spawn(n) => self.eval_spawn(n, env),
            Expression::Await(n) => self.eval_await(n, env),
            Expression::Race(n) => self.eval_race(n, env),
            Expression::Break(n) => match &n.value {
                None => Ok(Evaluated::Signal(Signal::Break(None))),
                Some(expr) => {
                    let value = try_value!(self.eval(expr, env));
                    Ok(Evaluated::Signal(Signal::Break(Some(value))))
                }
            },
            Expression::Continue(_) => Ok(Evaluated::Signal(Signal::Continue)),
            Expression::Recover(n) => self.eval_recover(n, env),
            Expression::Import(n) => self.eval_import(n, env),
        }
    }

    fn eval_if(&self, node: &IfExpression, env: &Environment) -> EvalResult {
        let condition = try_value!(self.eval(&node.condition, env));
        if condition.is_truthy() {
            self.eval(&node.consequence, env)
        } else if let Some(alternative) = &node.alternative {
            self.eval(alternative, env)
        } else {
            Ok(Evaluated::Value(Value::Unit))
        }
    }

    fn eval_block(&self, block: &BlockExpression, env: &Environment) -> EvalResult {
        let block_env = Environment::new_enclosed(env);
        let mut result = Value::Unit;
        for statement in &block.statements {
            result = try_value!(self.eval_statement(statement, &block_env));
        }
        Ok(Evaluated::Value(result))
    }

    fn eval_for(&self, node: &ForExpression, env: &Environment) -> EvalResult {
        let loop_env = Environment::new_enclosed(env);
        for binding in &node.bindings {
            let value = try_value!(self.eval(&binding.value, &loop_env));
            if !self.match_pattern(&binding.pattern, &value, &loop_env)? {
                return Err(Error::runtime("for binding pattern did not match"));
            }
        }

        loop {
            let condition = try_value!(self.eval(&node.condition, &loop_env));
            if !condition.is_truthy() {
                break;
            }
            match self.eval(&node.body, &loop_env)? {
                Evaluated::Value(_) | Evaluated::Signal(Signal::Continue) => {}
                Evaluated::Signal(Signal::Break(Some(value))) => {
                    return Ok(Evaluated::Value(value));
                }
                Evaluated::Signal(Signal::Break(None)) => {
                    return self.eval_for_then(node, &loop_env);
                }
            }
            if let Some(update) = &node.update {
                try_value!(self.eval(update, &loop_env));
            }
        }
        self.eval_for_then(node, &loop_env)
    }

    fn eval_for_then(&self, node: &ForExpression, env: &Environment) -> EvalResult {
        match &node.then {
            None => Ok(Evaluated::Value(Value::Unit)),
            Some(then) => self.eval(then, env),
        }
    }

    fn eval_match(&self, node: &MatchExpression, env: &Environment) -> EvalResult {
        let value = try_value!(self.eval(&node.value, env));
        for arm in &node.arms {
            let arm_env = Environment::new_enclosed(env);
            if !self.match_pattern(&arm.pattern, &value, &arm_env)? {
                continue;
            }
            if let Some(guard) = &arm.guard {
                let guard_value = try_value!(self.eval(guard, &arm_env));
                if !guard_value.is_truthy() {
                    continue;
                }
            }
            return self.eval(&arm.body, &arm_env);
        }
        Err(Error::runtime("non-exhaustive match"))
    }

    /// Pattern matching contract: binds names into `env` and reports whether
    /// the pattern accepted the value.
    pub(crate) fn match_pattern(
        &self,
        pattern: &Pattern,
        value: &Value,
        env: &Environment,
    ) -> Result<bool, Error> {
        match pattern {
            Pattern::Wildcard(_) => Ok(true),
            Pattern::Identifier(ident) => {
                env.define(&ident.name, value.clone());
                Ok(true)
            }
            Pattern::Integer(lit) => Ok(strict_equal(value, &Value::Integer(lit.value))),
            Pattern::Float(lit) => Ok(strict_equal(value, &Value::Float(lit.value))),
            Pattern::Boolean(lit) => Ok(strict_equal(value, &Value::Boolean(lit.value))),
            Pattern::Str(lit) => Ok(strict_equal(value, &Value::String(lit.value.clone()))),
            Pattern::Char(lit) => Ok(strict_equal(value, &Value::Char(lit.value.clone()))),
            Pattern::Null(_) => Ok(matches!(value, Value::Null)),
            Pattern::Array(pat) => {
                let elements = match value {
                    Value::Array(arr) => arr.lock().unwrap().clone(),
                    _ => return Ok(false),
                };
                if elements.len() != pat.elements.len() {
                    return Ok(false);
                }
                for (sub, element) in pat.elements.iter().zip(elements.iter()) {
                    if !self.match_pattern(sub, element, env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn eval_lambda(&self, node: &LambdaExpression, env: &Environment) -> EvalResult {
        Ok(Evaluated::Value(Value::Function(Arc::new(FunctionValue {
            parameters: node.parameters.clone(),
            body: node.body.clone(),
            env: env.clone(),
        }))))
    }

    fn eval_call(&self, node: &CallExpression, env: &Environment) -> EvalResult {
        let function = try_value!(self.eval(&node.function, env));

        let mut args: Vec<Option<Value>> = Vec::with_capacity(node.arguments.len());
        let mut has_hole = false;
        for argument in &node.arguments {
            if matches!(argument, Expression::Placeholder(_)) {
                args.push(None);
                has_hole = true;
                continue;
            }
            args.push(Some(try_value!(self.eval(argument, env))));
        }

        if has_hole {
            return Ok(Evaluated::Value(Value::Partial(Arc::new(PartialValue {
                target: function,
                args,
            }))));
        }
        let argv: Vec<Value> = args.into_iter().map(|a| a.unwrap_or(Value::Null)).collect();
        Ok(Evaluated::Value(self.apply_function(&function, argv)?))
    }

    /// Apply a function, builtin or partial to already-evaluated arguments.
    pub(crate) fn apply_function(&self, function: &Value, args: Vec<Value>) -> Result<Value, Error> {
        match function {
            Value::Function(f) => {
                if f.parameters.len() != args.len() {
                    return Err(Error::runtime(format!(
                        "function expects {} arguments, got {}",
                        f.parameters.len(),
                        args.len()
                    )));
                }
                let call_env = Environment::new_enclosed(&f.env);
                for (parameter, argument) in f.parameters.iter().zip(args.into_iter()) {
                    if !self.match_pattern(parameter, &argument, &call_env)? {
                        return Err(Error::runtime("argument does not match parameter pattern"));
                    }
                }
                match self.eval(&f.body, &call_env)? {
                    Evaluated::Value(value) => Ok(value),
                    Evaluated::Signal(_) => Err(Error::runtime("break/continue outside loop")),
                }
            }
            Value::Builtin(builtin) => (builtin.func)(self, &args),
            Value::Partial(partial) => {
                let mut filled = partial.args.clone();
                let mut supply = args.into_iter();
                for slot in filled.iter_mut() {
                    if slot.is_none() {
                        match supply.next() {
                            Some(value) => *slot = Some(value),
                            None => break,
                        }
                    }
                }
                let extra: Vec<Value> = supply.collect();
                if filled.iter().any(|slot| slot.is_none()) {
                    return Ok(Value::Partial(Arc::new(PartialValue {
                        target: partial.target.clone(),
                        args: filled,
                    })));
                }
                let mut argv: Vec<Value> = filled
                    .into_iter()
                    .map(|slot| slot.unwrap_or(Value::Null))
                    .collect();
                argv.extend(extra);
                self.apply_function(&partial.target, argv)
            }
            other => Err(Error::runtime(format!(
                "not a function: {}",
                other.kind().name()
            ))),
        }
    }

    fn eval_member(&self, node: &MemberExpression, env: &Environment) -> EvalResult {
        let object = try_value!(self.eval(&node.object, env));
        Ok(Evaluated::Value(
            self.member_access(object, &node.property.name)?,
        ))
    }

    /// Member dispatch: objects and modules resolve properties, builtin
    /// kinds expose a small method table of bound builtins.
    fn member_access(&self, object: Value, property: &str) -> Result<Value, Error> {
        match object {
            Value::Object(obj) => match obj.lock().unwrap().get(property) {
                Some(value) => Ok(value.clone()),
                None => Err(Error::runtime(format!("missing property: {}", property))),
            },
            Value::Module(env) => match env.get_local(property) {
                Some(value) => Ok(value),
                None => Err(Error::runtime(format!("missing property: {}", property))),
            },
            Value::Array(arr) => match property {
                "length" => Ok(Value::Integer(arr.lock().unwrap().len() as i64)),
                "map" => Ok(bind_method("map", Value::Array(arr), builtins::collections::builtin_map)),
                _ => Err(Error::runtime(format!("unknown array method: {}", property))),
            },
            Value::String(s) => match property {
                "length" => Ok(Value::Integer(s.chars().count() as i64)),
                _ => string_method(property, Value::String(s)),
            },
            Value::Map(map) => match property {
                "size" => Ok(Value::Integer(map.lock().unwrap().len() as i64)),
                "get" => Ok(bind_method("get", Value::Map(map), builtins::collections::builtin_get)),
                "set" => Ok(bind_method("set", Value::Map(map), builtins::collections::builtin_set)),
                "has" => Ok(bind_method("has", Value::Map(map), builtins::collections::builtin_has)),
                "delete" => Ok(bind_method(
                    "delete",
                    Value::Map(map),
                    builtins::collections::builtin_delete,
                )),
                "keys" => Ok(bind_method("keys", Value::Map(map), builtins::collections::builtin_keys)),
                "values" => Ok(bind_method(
                    "values",
                    Value::Map(map),
                    builtins::collections::builtin_values,
                )),
                _ => Err(Error::runtime(format!("unknown map method: {}", property))),
            },
            Value::Set(set) => match property {
                "size" => Ok(Value::Integer(set.lock().unwrap().len() as i64)),
                "add" => Ok(bind_method("add", Value::Set(set), builtins::collections::builtin_add)),
                "has" => Ok(bind_method("has", Value::Set(set), builtins::collections::builtin_has)),
                "delete" => Ok(bind_method(
                    "delete",
                    Value::Set(set),
                    builtins::collections::builtin_delete,
                )),
                _ => Err(Error::runtime(format!("unknown set method: {}", property))),
            },
            Value::Channel(ch) => match property {
                "send" => Ok(bind_method("send", Value::Channel(ch), builtins::async_ops::builtin_send)),
                "recv" => Ok(bind_method("recv", Value::Channel(ch), builtins::async_ops::builtin_recv)),
                "done" => Ok(bind_method("done", Value::Channel(ch), builtins::async_ops::builtin_done)),
                _ => Err(Error::runtime(format!(
                    "unknown channel method: {}",
                    property
                ))),
            },
            Value::Task(task) => match property {
                "then" => Ok(bind_method("then", Value::Task(task), builtins::async_ops::builtin_then)),
                _ => Err(Error::runtime(format!("unknown task method: {}", property))),
            },
            other => Err(Error::runtime(format!(
                "member access on non-object ({}.{})",
                other.kind().name(),
                property
            ))),
        }
    }

    fn eval_index(&self, node: &IndexExpression, env: &Environment) -> EvalResult {
        let left = try_value!(self.eval(&node.left, env));
        let index = try_value!(self.eval(&node.index, env));
        let value = match left {
            Value::Array(arr) => {
                let idx = match index {
                    Value::Integer(i) => i,
                    _ => return Err(Error::runtime("index must be integer")),
                };
                let elements = arr.lock().unwrap();
                if idx < 0 || idx as usize >= elements.len() {
                    return Err(Error::runtime("index out of bounds"));
                }
                elements[idx as usize].clone()
            }
            Value::Object(obj) => {
                let key = match string_arg(&index) {
                    Some(key) => key.to_string(),
                    None => return Err(Error::runtime("object index must be string or char")),
                };
                match obj.lock().unwrap().get(&key) {
                    Some(value) => value.clone(),
                    None => return Err(Error::runtime(format!("missing property: {}", key))),
                }
            }
            Value::Module(module_env) => {
                let key = match string_arg(&index) {
                    Some(key) => key.to_string(),
                    None => return Err(Error::runtime("object index must be string or char")),
                };
                match module_env.get_local(&key) {
                    Some(value) => value,
                    None => return Err(Error::runtime(format!("missing property: {}", key))),
                }
            }
            _ => return Err(Error::runtime("indexing requires array or object")),
        };
        Ok(Evaluated::Value(value))
    }

    fn eval_slice(&self, node: &SliceExpression, env: &Environment) -> EvalResult {
        let left = try_value!(self.eval(&node.left, env));
        let arr = match left {
            Value::Array(arr) => arr,
            _ => return Err(Error::runtime("slice requires array")),
        };
        let elements = arr.lock().unwrap().clone();
        let len = elements.len();

        let mut start = 0_i64;
        let mut end = len as i64;
        if let Some(expr) = &node.start {
            let value = try_value!(self.eval(expr, env));
            start = match value {
                Value::Integer(i) => normalize_index(i, len),
                _ => return Err(Error::runtime("slice start must be integer")),
            };
        }
        if let Some(expr) = &node.end {
            let value = try_value!(self.eval(expr, env));
            end = match value {
                Value::Integer(i) => normalize_index(i, len),
                _ => return Err(Error::runtime("slice end must be integer")),
            };
        }

        if start < 0 || start > len as i64 || end < 0 || end > len as i64 {
            return Err(Error::runtime("slice bounds out of range"));
        }
        if start >= end {
            return Ok(Evaluated::Value(Value::array(Vec::new())));
        }
        Ok(Evaluated::Value(Value::array(
            elements[start as usize..end as usize].to_vec(),
        )))
    }

    fn eval_range(&self, node: &RangeExpression, env: &Environment) -> EvalResult {
        let start = match try_value!(self.eval(&node.start, env)) {
            Value::Integer(v) => v,
            _ => return Err(Error::runtime("range bounds must be integers")),
        };
        let end = match try_value!(self.eval(&node.end, env)) {
            Value::Integer(v) => v,
            _ => return Err(Error::runtime("range bounds must be integers")),
        };
        let step = match &node.step {
            None => 1,
            Some(expr) => match try_value!(self.eval(expr, env)) {
                Value::Integer(0) => return Err(Error::runtime("range step must not be zero")),
                Value::Integer(v) => v,
                _ => return Err(Error::runtime("range step must be integer")),
            },
        };

        let mut out = Vec::new();
        let mut v = start;
        while (step > 0 && v < end) || (step < 0 && v > end) {
            out.push(Value::Integer(v));
            v = match v.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(Evaluated::Value(Value::array(out)))
    }

    fn eval_query(&self, node: &QueryExpression, env: &Environment) -> EvalResult {
        let source = match try_value!(self.eval(&node.source, env)) {
            Value::Array(arr) => arr.lock().unwrap().clone(),
            _ => return Err(Error::runtime("query source must be array")),
        };

        let mut rows: Vec<(Value, Option<Value>)> = Vec::new();
        for item in source {
            let row_env = Environment::new_enclosed(env);
            row_env.define(&node.var.name, item.clone());

            let mut keep = true;
            for filter in &node.wheres {
                let value = try_value!(self.eval(filter, &row_env));
                if !value.is_truthy() {
                    keep = false;
                    break;
                }
            }
            if !keep {
                continue;
            }

            let key = match &node.order_by {
                Some(order_by) => Some(try_value!(self.eval(order_by, &row_env))),
                None => None,
            };
            rows.push((item, key));
        }

        if node.order_by.is_some() {
            sort_rows(&mut rows)?;
        }

        let mut results = Vec::with_capacity(rows.len());
        for (item, _) in rows {
            let row_env = Environment::new_enclosed(env);
            row_env.define(&node.var.name, item);
            results.push(try_value!(self.eval(&node.select, &row_env)));
        }
        Ok(Evaluated::Value(Value::array(results)))
    }

    fn eval_spawn(&self, node: &SpawnExpression, env: &Environment) -> EvalResult {
        let task = self
            .runtime
            .new_task(self.current_task.as_ref().map(|t| t.id()), false);
        let worker = self.clone_for_task(task.clone());
        let worker_task = task.clone();
        let body = node.body.clone();
        let task_env = Environment::new_enclosed(env);
        thread::spawn(move || match worker.eval(&body, &task_env) {
            Ok(Evaluated::Value(value)) => worker_task.complete(value),
            Ok(Evaluated::Signal(_)) => worker.handle_async_error(
                &worker_task,
                Error::runtime("break/continue outside loop"),
            ),
            Err(err) => worker.handle_async_error(&worker_task, err),
        });
        Ok(Evaluated::Value(Value::Task(task)))
    }

    /// Record a task's failure. When nobody has observed the task, a fatal
    /// failure latches the runtime's fatal slot and fans out cancellation.
    pub(crate) fn handle_async_error(&self, task: &Arc<Task>, err: Error) {
        task.fail(err.clone());
        if task.is_observed() {
            return;
        }
        if matches!(err, Error::Runtime(_) | Error::Exit(_)) {
            let formatted = format_runtime_error(&err, &self.source, &self.filename);
            self.runtime.record_unhandled_failure(err, formatted);
        }
    }

    fn eval_await(&self, node: &AwaitExpression, env: &Environment) -> EvalResult {
        let value = try_value!(self.eval(&node.value, env));
        let task = match value {
            Value::Task(task) => task,
            other => {
                return Err(Error::runtime(format!(
                    "await expects task, got {}",
                    other.kind().name()
                )));
            }
        };
        Ok(Evaluated::Value(self.await_task(&task)?))
    }

    /// Block on a task: its value on success, its error on failure, a
    /// canceled error when the wait itself is canceled.
    pub(crate) fn await_task(&self, task: &Arc<Task>) -> Result<Value, Error> {
        task.mark_observed();
        match task.wait(&self.wait_context()) {
            TaskWait::Done => task.result(),
            TaskWait::Canceled => Err(Error::canceled()),
            TaskWait::Fatal => Err(self.runtime.fatal_task_failure()),
        }
    }

    fn eval_race(&self, node: &RaceExpression, env: &Environment) -> EvalResult {
        let mut tasks: Vec<Arc<Task>> = Vec::with_capacity(node.tasks.len());
        for expr in &node.tasks {
            match try_value!(self.eval(expr, env)) {
                Value::Task(task) => {
                    task.mark_observed();
                    tasks.push(task);
                }
                other => {
                    return Err(Error::runtime(format!(
                        "race expects tasks, got {}",
                        other.kind().name()
                    )));
                }
            }
        }
        if tasks.is_empty() {
            return Err(Error::runtime("race expects at least one task"));
        }

        match task::race(&tasks, &self.wait_context()) {
            RaceWait::Winner(winner) => {
                for (index, task) in tasks.iter().enumerate() {
                    if index != winner {
                        task.cancel();
                    }
                }
                Ok(Evaluated::Value(tasks[winner].result()?))
            }
            RaceWait::Canceled => Err(Error::canceled()),
            RaceWait::Fatal => Err(self.runtime.fatal_task_failure()),
        }
    }

    fn eval_recover(&self, node: &RecoverExpression, env: &Environment) -> EvalResult {
        match self.eval(&node.target, env) {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_recover_catchable() => {
                let fallback_env = Environment::new_enclosed(env);
                fallback_env.define("error", error_value(&err));
                self.eval(&node.fallback, &fallback_env)
            }
            Err(err) => Err(err),
        }
    }

    fn eval_import(&self, node: &ImportExpression, _env: &Environment) -> EvalResult {
        let parse = match &self.parse {
            Some(parse) => parse.clone(),
            None => return Err(Error::runtime("import requires a parser")),
        };
        let resolved = resolve_import_path(
            &node.path.value,
            &self.filename,
            self.project_root.as_deref(),
        );
        let module = self.modules.load(&resolved, &parse)?;

        // Each call builds a fresh module instance; only the parsed program
        // is shared.
        let factory_module = module.clone();
        Ok(Evaluated::Value(Value::builtin(
            "moduleFactory",
            move |ev: &Evaluator, args: &[Value]| {
                if !args.is_empty() {
                    return Err(Error::runtime("module factory expects no arguments"));
                }
                let module_env = Environment::new_enclosed(&ev.base);
                let module_eval = Evaluator {
                    source: factory_module.source.clone(),
                    filename: factory_module.filename.clone(),
                    ..ev.clone()
                };
                match module_eval.evaluate(&factory_module.program, &module_env) {
                    Ok(_) => Ok(Value::Module(module_env)),
                    Err(err @ Error::Exit(_)) => Err(err),
                    Err(err) => Err(Error::Module(format_runtime_error(
                        &err,
                        &module_eval.source,
                        &module_eval.filename,
                    ))),
                }
            },
        )))
    }
}

/// A builtin with its receiver pre-bound, produced by member dispatch.
fn bind_method(
    name: &str,
    receiver: Value,
    f: fn(&Evaluator, &[Value]) -> Result<Value, Error>,
) -> Value {
    Value::builtin(name, move |ev: &Evaluator, args: &[Value]| {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver.clone());
        full.extend_from_slice(args);
        f(ev, &full)
    })
}

fn string_method(property: &str, receiver: Value) -> Result<Value, Error> {
    use builtins::strings;
    let method: fn(&Evaluator, &[Value]) -> Result<Value, Error> = match property {
        "split" => strings::builtin_split,
        "chars" => strings::builtin_chars,
        "trim" => strings::builtin_trim,
        "toLower" => strings::builtin_to_lower,
        "toUpper" => strings::builtin_to_upper,
        "contains" => strings::builtin_contains,
        "startsWith" => strings::builtin_starts_with,
        "endsWith" => strings::builtin_ends_with,
        "replace" => strings::builtin_replace,
        _ => {
            return Err(Error::runtime(format!(
                "unknown string method: {}",
                property
            )));
        }
    };
    Ok(bind_method(property, receiver, method))
}

fn normalize_index(index: i64, len: usize) -> i64 {
    if index < 0 {
        len as i64 + index
    } else {
        index
    }
}

/// The value bound as `error` inside a recover fallback.
fn error_value(err: &Error) -> Value {
    let (message, kind) = match err {
        Error::Runtime(e) => (e.message.clone(), "runtime".to_string()),
        Error::Recoverable(e) => (e.message.clone(), e.kind.clone()),
        other => (other.to_string(), "error".to_string()),
    };
    let mut pairs = std::collections::HashMap::new();
    pairs.insert("message".to_string(), Value::String(message));
    pairs.insert("kind".to_string(), Value::String(kind));
    Value::object(pairs)
}

/// Stable sort for `orderby`: every key must exist and all keys must share
/// one primitive kind.
fn sort_rows(rows: &mut [(Value, Option<Value>)]) -> Result<(), Error> {
    if rows.is_empty() {
        return Ok(());
    }
    for (_, key) in rows.iter() {
        if key.is_none() {
            return Err(Error::runtime("orderby requires comparable key"));
        }
    }
    let first_kind = rows[0].1.as_ref().map(|k| k.kind());
    let comparable = matches!(
        first_kind,
        Some(ValueKind::Integer) | Some(ValueKind::Float) | Some(ValueKind::String)
    );
    if !comparable {
        return Err(Error::runtime("orderby key must be int, float, or string"));
    }
    for (_, key) in rows.iter() {
        if key.as_ref().map(|k| k.kind()) != first_kind {
            return Err(Error::runtime("orderby keys must be the same type"));
        }
    }
    rows.sort_by(|a, b| {
        let (a, b) = (a.1.as_ref(), b.1.as_ref());
        match (a, b) {
            (Some(Value::Integer(x)), Some(Value::Integer(y))) => x.cmp(y),
            (Some(Value::Float(x)), Some(Value::Float(y))) => {
                x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
            }
            (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
            _ => std::cmp::Ordering::Equal,
        }
    });
    Ok(())
}
