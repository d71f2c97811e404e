//! Prefix, infix, assignment and postfix operator semantics, plus assignable
//! resolution for the left side of assignments.

use crate::language::ast::{
    AssignExpression, AssignOp, Expression, InfixExpression, InfixOp, PostfixExpression,
    PostfixOp, PrefixExpression, PrefixOp,
};
use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::{try_value, Evaluated, EvalResult, Evaluator};
use crate::runtime::value::{equivalent, strict_equal, ArrayRef, ObjectRef, Value};

/// A resolved assignment target: the current value plus where to store the
/// replacement.
pub(crate) enum AssignTarget {
    Binding(Environment, String),
    ObjectMember(ObjectRef, String),
    ModuleMember(Environment, String),
    ArrayIndex(ArrayRef, usize),
}

impl AssignTarget {
    pub(crate) fn store(self, value: Value) {
        match self {
            AssignTarget::Binding(env, name) => {
                env.set(&name, value);
            }
            AssignTarget::ObjectMember(obj, key) => {
                obj.lock().unwrap().insert(key, value);
            }
            AssignTarget::ModuleMember(env, key) => env.define(&key, value),
            AssignTarget::ArrayIndex(arr, index) => {
                let mut elements = arr.lock().unwrap();
                if index < elements.len() {
                    elements[index] = value;
                }
            }
        }
    }
}

pub(crate) enum Resolved {
    Target(Value, AssignTarget),
    Signal(crate::runtime::evaluator::Signal),
}

impl Evaluator {
    pub(crate) fn eval_prefix(&self, node: &PrefixExpression, env: &Environment) -> EvalResult {
        let right = try_value!(self.eval(&node.right, env));
        match node.operator {
            PrefixOp::Not => Ok(Evaluated::Value(Value::Boolean(!right.is_truthy()))),
            PrefixOp::Neg => match right {
                Value::Integer(v) => Ok(Evaluated::Value(Value::Integer(v.wrapping_neg()))),
                Value::Float(v) => Ok(Evaluated::Value(Value::Float(-v))),
                _ => Err(Error::runtime("operator - expects number")),
            },
        }
    }

    pub(crate) fn eval_infix(&self, node: &InfixExpression, env: &Environment) -> EvalResult {
        let left = try_value!(self.eval(&node.left, env));

        // && and || short-circuit on truthiness and always yield a boolean.
        if node.operator == InfixOp::And || node.operator == InfixOp::Or {
            let left_truthy = left.is_truthy();
            if node.operator == InfixOp::And && !left_truthy {
                return Ok(Evaluated::Value(Value::Boolean(false)));
            }
            if node.operator == InfixOp::Or && left_truthy {
                return Ok(Evaluated::Value(Value::Boolean(true)));
            }
            let right = try_value!(self.eval(&node.right, env));
            return Ok(Evaluated::Value(Value::Boolean(right.is_truthy())));
        }

        let right = try_value!(self.eval(&node.right, env));
        match node.operator {
            InfixOp::Eq => Ok(Evaluated::Value(Value::Boolean(strict_equal(&left, &right)))),
            InfixOp::NotEq => Ok(Evaluated::Value(Value::Boolean(!strict_equal(
                &left, &right,
            )))),
            InfixOp::Eqv => Ok(Evaluated::Value(Value::Boolean(equivalent(&left, &right)))),
            op => Ok(Evaluated::Value(apply_binary(op, &left, &right)?)),
        }
    }

    pub(crate) fn eval_assign(&self, node: &AssignExpression, env: &Environment) -> EvalResult {
        let (target, slot) = match self.resolve_assignable(&node.target, env)? {
            Resolved::Target(value, slot) => (value, slot),
            Resolved::Signal(sig) => return Ok(Evaluated::Signal(sig)),
        };
        let right = try_value!(self.eval(&node.value, env));

        let new_value = match node.operator {
            AssignOp::Assign => right,
            AssignOp::AddAssign => apply_binary(InfixOp::Add, &target, &right)?,
            AssignOp::SubAssign => apply_binary(InfixOp::Sub, &target, &right)?,
            AssignOp::MulAssign => apply_binary(InfixOp::Mul, &target, &right)?,
            AssignOp::DivAssign => apply_binary(InfixOp::Div, &target, &right)?,
            AssignOp::RemAssign => apply_binary(InfixOp::Rem, &target, &right)?,
        };
        slot.store(new_value.clone());
        Ok(Evaluated::Value(new_value))
    }

    pub(crate) fn eval_postfix(&self, node: &PostfixExpression, env: &Environment) -> EvalResult {
        let (target, slot) = match self.resolve_assignable(&node.target, env)? {
            Resolved::Target(value, slot) => (value, slot),
            Resolved::Signal(sig) => return Ok(Evaluated::Signal(sig)),
        };
        let delta = match node.operator {
            PostfixOp::Increment => 1,
            PostfixOp::Decrement => -1,
        };
        let new_value = match target {
            Value::Integer(v) => Value::Integer(v.wrapping_add(delta)),
            Value::Float(v) => Value::Float(v + delta as f64),
            _ => return Err(Error::runtime("increment/decrement requires number")),
        };
        slot.store(new_value.clone());
        Ok(Evaluated::Value(new_value))
    }

    /// The left side of an assignment: an identifier, an object or module
    /// member, or an array/object index.
    pub(crate) fn resolve_assignable(
        &self,
        node: &Expression,
        env: &Environment,
    ) -> Result<Resolved, Error> {
        match node {
            Expression::Identifier(ident) => {
                let current = env
                    .get(&ident.name)
                    .ok_or_else(|| Error::runtime(format!("undefined identifier: {}", ident.name)))?;
                Ok(Resolved::Target(
                    current,
                    AssignTarget::Binding(env.clone(), ident.name.clone()),
                ))
            }
            Expression::Member(member) => {
                let object = match self.eval(&member.object, env)? {
                    Evaluated::Value(v) => v,
                    Evaluated::Signal(sig) => return Ok(Resolved::Signal(sig)),
                };
                let key = member.property.name.clone();
                match object {
                    Value::Object(obj) => {
                        let current = obj.lock().unwrap().get(&key).cloned().unwrap_or(Value::Null);
                        Ok(Resolved::Target(current, AssignTarget::ObjectMember(obj, key)))
                    }
                    Value::Module(module_env) => {
                        let current = module_env.get_local(&key).unwrap_or(Value::Null);
                        Ok(Resolved::Target(
                            current,
                            AssignTarget::ModuleMember(module_env, key),
                        ))
                    }
                    _ => Err(Error::runtime("member assignment requires object")),
                }
            }
            Expression::Index(index) => {
                let left = match self.eval(&index.left, env)? {
                    Evaluated::Value(v) => v,
                    Evaluated::Signal(sig) => return Ok(Resolved::Signal(sig)),
                };
                let index_value = match self.eval(&index.index, env)? {
                    Evaluated::Value(v) => v,
                    Evaluated::Signal(sig) => return Ok(Resolved::Signal(sig)),
                };
                match left {
                    Value::Array(arr) => {
                        let idx = match index_value {
                            Value::Integer(i) => i,
                            _ => return Err(Error::runtime("index must be integer")),
                        };
                        let len = arr.lock().unwrap().len();
                        if idx < 0 || idx as usize >= len {
                            return Err(Error::runtime("index out of bounds"));
                        }
                        let idx = idx as usize;
                        let current = arr.lock().unwrap()[idx].clone();
                        Ok(Resolved::Target(current, AssignTarget::ArrayIndex(arr, idx)))
                    }
                    Value::Object(obj) => {
                        let key = object_index_key(&index_value)
                            .ok_or_else(|| Error::runtime("object index must be string or char"))?;
                        let current = obj.lock().unwrap().get(&key).cloned().unwrap_or(Value::Null);
                        Ok(Resolved::Target(current, AssignTarget::ObjectMember(obj, key)))
                    }
                    Value::Module(module_env) => {
                        let key = object_index_key(&index_value)
                            .ok_or_else(|| Error::runtime("object index must be string or char"))?;
                        let current = module_env.get_local(&key).unwrap_or(Value::Null);
                        Ok(Resolved::Target(
                            current,
                            AssignTarget::ModuleMember(module_env, key),
                        ))
                    }
                    _ => Err(Error::runtime("index assignment requires array or object")),
                }
            }
            _ => Err(Error::runtime("invalid assignment target")),
        }
    }
}

pub(crate) fn object_index_key(index: &Value) -> Option<String> {
    match index {
        Value::String(s) => Some(s.clone()),
        Value::Char(c) => Some(c.clone()),
        _ => None,
    }
}

/// Dispatch a binary operator by the left operand's kind. Shared between
/// infix expressions and compound assignment.
pub(crate) fn apply_binary(op: InfixOp, left: &Value, right: &Value) -> Result<Value, Error> {
    match left {
        Value::Integer(a) => eval_integer_infix(op, *a, right),
        Value::Float(a) => eval_float_infix(op, *a, right),
        Value::String(a) => eval_string_infix(op, a, right),
        Value::Char(a) => eval_string_infix(op, a, right),
        Value::Array(a) => eval_array_infix(op, a, right),
        _ => Err(Error::runtime(format!(
            "unsupported operand for operator: {}",
            left.kind().name()
        ))),
    }
}

fn eval_integer_infix(op: InfixOp, left: i64, right: &Value) -> Result<Value, Error> {
    match right {
        Value::Integer(b) => eval_int_int(op, left, *b),
        Value::Float(b) => eval_float_float(op, left as f64, *b),
        _ => Err(Error::runtime("type mismatch in integer operation")),
    }
}

fn eval_float_infix(op: InfixOp, left: f64, right: &Value) -> Result<Value, Error> {
    match right {
        Value::Integer(b) => eval_float_float(op, left, *b as f64),
        Value::Float(b) => eval_float_float(op, left, *b),
        _ => Err(Error::runtime("type mismatch in float operation")),
    }
}

/// int∘int: wrapping two's-complement arithmetic; division always widens to
/// float; modulo stays integral and rejects a zero divisor.
fn eval_int_int(op: InfixOp, a: i64, b: i64) -> Result<Value, Error> {
    let value = match op {
        InfixOp::Add => Value::Integer(a.wrapping_add(b)),
        InfixOp::Sub => Value::Integer(a.wrapping_sub(b)),
        InfixOp::Mul => Value::Integer(a.wrapping_mul(b)),
        InfixOp::Div => Value::Float(a as f64 / b as f64),
        InfixOp::Rem => {
            if b == 0 {
                return Err(Error::runtime("division by zero"));
            }
            Value::Integer(a.wrapping_rem(b))
        }
        InfixOp::Lt => Value::Boolean(a < b),
        InfixOp::LtEq => Value::Boolean(a <= b),
        InfixOp::Gt => Value::Boolean(a > b),
        InfixOp::GtEq => Value::Boolean(a >= b),
        _ => return Err(Error::runtime("unsupported numeric operator")),
    };
    Ok(value)
}

fn eval_float_float(op: InfixOp, a: f64, b: f64) -> Result<Value, Error> {
    let value = match op {
        InfixOp::Add => Value::Float(a + b),
        InfixOp::Sub => Value::Float(a - b),
        InfixOp::Mul => Value::Float(a * b),
        InfixOp::Div => Value::Float(a / b),
        InfixOp::Rem => return Err(Error::runtime("modulo requires integers")),
        InfixOp::Lt => Value::Boolean(a < b),
        InfixOp::LtEq => Value::Boolean(a <= b),
        InfixOp::Gt => Value::Boolean(a > b),
        InfixOp::GtEq => Value::Boolean(a >= b),
        _ => return Err(Error::runtime("unsupported numeric operator")),
    };
    Ok(value)
}

/// Strings order byte-lexicographically; a char on either side behaves as a
/// one-rune string.
fn eval_string_infix(op: InfixOp, left: &str, right: &Value) -> Result<Value, Error> {
    let right = match right {
        Value::String(s) => s.as_str(),
        Value::Char(c) => c.as_str(),
        _ => return Err(Error::runtime("string operations require strings")),
    };
    let value = match op {
        InfixOp::Add => Value::String(format!("{}{}", left, right)),
        InfixOp::Eq => Value::Boolean(left == right),
        InfixOp::NotEq => Value::Boolean(left != right),
        InfixOp::Lt => Value::Boolean(left < right),
        InfixOp::LtEq => Value::Boolean(left <= right),
        InfixOp::Gt => Value::Boolean(left > right),
        InfixOp::GtEq => Value::Boolean(left >= right),
        _ => return Err(Error::runtime("unsupported string operator")),
    };
    Ok(value)
}

/// `+` on arrays concatenates into a fresh array.
fn eval_array_infix(op: InfixOp, left: &ArrayRef, right: &Value) -> Result<Value, Error> {
    let right = match right {
        Value::Array(r) => r,
        _ => return Err(Error::runtime("array operation requires array")),
    };
    match op {
        InfixOp::Add => {
            let mut out = left.lock().unwrap().clone();
            out.extend(right.lock().unwrap().iter().cloned());
            Ok(Value::array(out))
        }
        _ => Err(Error::runtime("unsupported array operator")),
    }
}
