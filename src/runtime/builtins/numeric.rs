//! Math built-ins, all generated from three templates: float-valued unary
//! functions, integral unary functions that must land back inside i64, and
//! the two-argument min/max pair that keeps integer inputs integral.

use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::value::{number_arg, Value};

pub(crate) fn register(env: &Environment) {
    super::register(env, "abs", builtin_abs);
    super::register(env, "sqrt", builtin_sqrt);
    super::register(env, "floor", builtin_floor);
    super::register(env, "ceil", builtin_ceil);
    super::register(env, "round", builtin_round);
    super::register(env, "min", builtin_min);
    super::register(env, "max", builtin_max);
}

fn unary_math(args: &[Value], name: &str, f: fn(f64) -> f64) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime(format!("{} expects 1 argument", name)));
    }
    let (value, _) =
        number_arg(&args[0]).ok_or_else(|| Error::runtime(format!("{} expects number", name)))?;
    let result = f(value);
    if !result.is_finite() {
        return Err(Error::runtime(format!("{} result not finite", name)));
    }
    Ok(Value::Float(result))
}

fn integral_math(args: &[Value], name: &str, f: fn(f64) -> f64) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime(format!("{} expects 1 argument", name)));
    }
    let (value, _) =
        number_arg(&args[0]).ok_or_else(|| Error::runtime(format!("{} expects number", name)))?;
    let result = f(value);
    if result.is_nan() {
        return Err(Error::runtime(format!("{} result not finite", name)));
    }
    if result > i64::MAX as f64 || result < i64::MIN as f64 {
        return Err(Error::runtime(format!("{} overflow", name)));
    }
    Ok(Value::Integer(result as i64))
}

fn min_max(args: &[Value], name: &str, take_max: bool) -> Result<Value, Error> {
    if args.len() != 2 {
        return Err(Error::runtime(format!("{} expects 2 arguments", name)));
    }
    let (left, left_int) =
        number_arg(&args[0]).ok_or_else(|| Error::runtime(format!("{} expects number", name)))?;
    let (right, right_int) =
        number_arg(&args[1]).ok_or_else(|| Error::runtime(format!("{} expects number", name)))?;
    let out = if take_max {
        left.max(right)
    } else {
        left.min(right)
    };
    if left_int && right_int {
        Ok(Value::Integer(out as i64))
    } else {
        Ok(Value::Float(out))
    }
}

pub(crate) fn builtin_abs(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    unary_math(args, "abs", f64::abs)
}

pub(crate) fn builtin_sqrt(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    unary_math(args, "sqrt", f64::sqrt)
}

pub(crate) fn builtin_floor(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    integral_math(args, "floor", f64::floor)
}

pub(crate) fn builtin_ceil(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    integral_math(args, "ceil", f64::ceil)
}

pub(crate) fn builtin_round(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    integral_math(args, "round", f64::round)
}

pub(crate) fn builtin_min(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    min_max(args, "min", false)
}

pub(crate) fn builtin_max(_ev: &Evaluator, args: &[Value]) -> Result<Value, Error> {
    min_max(args, "max", true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::Runtime;
    use std::sync::Arc;

    fn ev() -> Evaluator {
        Evaluator::new(Arc::new(Runtime::new()))
    }

    #[test]
    fn integral_helpers_return_integers() {
        assert!(matches!(
            builtin_floor(&ev(), &[Value::Float(2.9)]).unwrap(),
            Value::Integer(2)
        ));
        assert!(matches!(
            builtin_ceil(&ev(), &[Value::Float(2.1)]).unwrap(),
            Value::Integer(3)
        ));
        assert!(matches!(
            builtin_round(&ev(), &[Value::Float(2.5)]).unwrap(),
            Value::Integer(3)
        ));
    }

    #[test]
    fn integral_overflow_is_detected() {
        let err = builtin_floor(&ev(), &[Value::Float(1e300)]).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn non_finite_results_error() {
        let err = builtin_sqrt(&ev(), &[Value::Integer(-4)]).unwrap_err();
        assert!(err.to_string().contains("not finite"));
    }

    #[test]
    fn min_max_keep_integer_inputs_integral() {
        assert!(matches!(
            builtin_min(&ev(), &[Value::Integer(3), Value::Integer(5)]).unwrap(),
            Value::Integer(3)
        ));
        assert!(matches!(
            builtin_max(&ev(), &[Value::Integer(3), Value::Float(5.5)]).unwrap(),
            Value::Float(v) if v == 5.5
        ));
    }
}
