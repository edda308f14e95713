//! Binary and unary arithmetic/comparison semantics for the VM's
//! `Add`..`UnarySizeOf` opcodes. Kept independent of `Vm` (no heap access
//! needed except for `Concatenate`/`Add` on managed types, which take a
//! callback for the one allocation they need) so these rules can be unit
//! tested in isolation.

use element_core::heap::{ArrayObj, ObjectObj};
use element_core::value::Value;

#[derive(Debug)]
pub enum ArithError {
    DivisionByZero,
    TypeMismatch(&'static str),
}

impl ArithError {
    pub fn message(&self) -> String {
        match self {
            ArithError::DivisionByZero => "Division by 0".to_string(),
            ArithError::TypeMismatch(op) => format!("type mismatch in {op}"),
        }
    }
}

fn as_f64_pair(a: Value, b: Value) -> Option<(f64, f64, bool)> {
    let (af, is_a_float) = match a {
        Value::Int(i) => (i as f64, false),
        Value::Float(f) => (f as f64, true),
        _ => return None,
    };
    let (bf, is_b_float) = match b {
        Value::Int(i) => (i as f64, false),
        Value::Float(f) => (f as f64, true),
        _ => return None,
    };
    Some((af, bf, is_a_float || is_b_float))
}

/// `+`: numeric addition (float iff either operand is float), Array
/// concatenation, or Object merge (right wins on a duplicate hash). Arrays
/// and Objects are handled by the caller (`Vm::op_add`) since they need
/// heap allocation; this only covers the numeric case.
pub fn add_numeric(a: Value, b: Value) -> Result<Value, ArithError> {
    match as_f64_pair(a, b) {
        Some((x, y, true)) => Ok(Value::Float((x + y) as f32)),
        Some((x, y, false)) => Ok(Value::Int((x as i32).wrapping_add(y as i32))),
        None => Err(ArithError::TypeMismatch("+")),
    }
}

pub fn subtract(a: Value, b: Value) -> Result<Value, ArithError> {
    match as_f64_pair(a, b) {
        Some((x, y, true)) => Ok(Value::Float((x - y) as f32)),
        Some((x, y, false)) => Ok(Value::Int((x as i32).wrapping_sub(y as i32))),
        None => Err(ArithError::TypeMismatch("-")),
    }
}

pub fn multiply(a: Value, b: Value) -> Result<Value, ArithError> {
    match as_f64_pair(a, b) {
        Some((x, y, true)) => Ok(Value::Float((x * y) as f32)),
        Some((x, y, false)) => Ok(Value::Int((x as i32).wrapping_mul(y as i32))),
        None => Err(ArithError::TypeMismatch("*")),
    }
}

/// Integer division by zero is a runtime error; float division by zero
/// follows IEEE-754 (±inf/NaN) and does not set an error.
pub fn divide(a: Value, b: Value) -> Result<Value, ArithError> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(ArithError::DivisionByZero),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_div(y))),
        _ => match as_f64_pair(a, b) {
            Some((x, y, _)) => Ok(Value::Float((x / y) as f32)),
            None => Err(ArithError::TypeMismatch("/")),
        },
    }
}

pub fn modulo(a: Value, b: Value) -> Result<Value, ArithError> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(ArithError::DivisionByZero),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(y))),
        _ => match as_f64_pair(a, b) {
            Some((x, y, _)) => Ok(Value::Float((x % y) as f32)),
            None => Err(ArithError::TypeMismatch("%")),
        },
    }
}

/// `^`: float if the LHS is float, otherwise int — even when the RHS is
/// fractional, matching the source implementation's documented quirk
/// (truncates a fractional exponent when the base is an int).
pub fn power(a: Value, b: Value) -> Result<Value, ArithError> {
    let (base, exp, lhs_is_float) = match (a, b) {
        (Value::Int(x), Value::Int(y)) => (x as f64, y as f64, false),
        (Value::Int(x), Value::Float(y)) => (x as f64, y as f64, false),
        (Value::Float(x), Value::Int(y)) => (x as f64, y as f64, true),
        (Value::Float(x), Value::Float(y)) => (x as f64, y as f64, true),
        _ => return Err(ArithError::TypeMismatch("^")),
    };
    let result = base.powf(exp);
    if lhs_is_float {
        Ok(Value::Float(result as f32))
    } else {
        Ok(Value::Int(result as i32))
    }
}

/// Bitwise xor for two ints, logical xor (by truthiness) otherwise. Never
/// reachable from the parser/lexer (no surface syntax emits it) but the
/// opcode is part of the bytecode format, so hand-assembled bytecode can
/// still use it.
pub fn xor(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::Int(x ^ y),
        _ => Value::Bool(a.is_truthy() != b.is_truthy()),
    }
}

#[derive(Copy, Clone)]
pub enum Ordering3 {
    Less,
    Equal,
    Greater,
    Unordered,
}

/// Numeric or lexicographic-byte ordering; anything else is `Unordered`
/// (the caller turns that into a runtime error for the four ordering ops,
/// but `Equal`/`NotEqual` treat it as simply not equal).
pub fn compare(a: Value, b: Value) -> Ordering3 {
    if let Some((x, y, _)) = as_f64_pair(a, b) {
        return if x < y {
            Ordering3::Less
        } else if x > y {
            Ordering3::Greater
        } else {
            Ordering3::Equal
        };
    }
    Ordering3::Unordered
}

/// Every other managed-type comparison (and mismatched-type comparisons in
/// general) falls back to `Value::ptr_eq`, which only matches for
/// identical pointers. `Nil` compares trivially equal only to `Nil`
/// (§4.5's "type match" rule for nil). String and Error equality compare
/// by content rather than pointer identity; since that needs a heap
/// dereference, the caller (`Vm`) special-cases those two variants before
/// falling back to this function for everything else.
pub fn values_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Nil, _) | (_, Value::Nil) => false,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Hash(x), Value::Hash(y)) => x == y,
        _ => {
            if let Some((x, y, _)) = as_f64_pair(a, b) {
                return x == y;
            }
            a.ptr_eq(&b)
        }
    }
}

/// Merges two Objects' sorted member vectors, right-hand side winning on a
/// duplicate hash (used by `+` on two Objects).
pub fn merge_object_members(lhs: &[(u32, Value)], rhs: &[(u32, Value)]) -> Vec<(u32, Value)> {
    let mut merged: Vec<(u32, Value)> = lhs.to_vec();
    for &(hash, value) in rhs {
        match merged.binary_search_by_key(&hash, |(h, _)| *h) {
            Ok(i) => merged[i].1 = value,
            Err(i) => merged.insert(i, (hash, value)),
        }
    }
    merged
}

pub fn concat_arrays(lhs: &ArrayObj, rhs: &ArrayObj) -> Vec<Value> {
    let mut out = lhs.elements.borrow().clone();
    out.extend(rhs.elements.borrow().iter().copied());
    out
}

pub fn merge_objects(lhs: &ObjectObj, rhs: &ObjectObj) -> Vec<(u32, Value)> {
    merge_object_members(&lhs.members.borrow(), &rhs.members.borrow())
}

pub fn unary_minus(v: Value) -> Result<Value, ArithError> {
    match v {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(ArithError::TypeMismatch("unary -")),
    }
}

pub fn unary_plus(v: Value) -> Result<Value, ArithError> {
    match v {
        Value::Int(_) | Value::Float(_) => Ok(v),
        _ => Err(ArithError::TypeMismatch("unary +")),
    }
}

pub fn unary_not(v: Value) -> Value {
    Value::Bool(!v.is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_promotes_to_float_if_either_operand_is() {
        assert!(matches!(add_numeric(Value::Int(1), Value::Float(2.5)).unwrap(), Value::Float(f) if f == 3.5));
        assert!(matches!(add_numeric(Value::Int(1), Value::Int(2)).unwrap(), Value::Int(3)));
    }

    #[test]
    fn integer_division_truncates_toward_zero() {
        assert!(matches!(divide(Value::Int(-7), Value::Int(2)).unwrap(), Value::Int(-3)));
    }

    #[test]
    fn integer_division_by_zero_errors() {
        assert!(matches!(divide(Value::Int(1), Value::Int(0)), Err(ArithError::DivisionByZero)));
    }

    #[test]
    fn float_division_by_zero_is_ieee_not_an_error() {
        let r = divide(Value::Float(1.0), Value::Float(0.0)).unwrap();
        assert!(matches!(r, Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn power_keeps_int_result_when_lhs_is_int_even_with_fractional_exponent() {
        let r = power(Value::Int(4), Value::Float(0.5)).unwrap();
        assert!(matches!(r, Value::Int(2)));
    }

    #[test]
    fn merge_object_members_prefers_right_hand_side() {
        let lhs = vec![(1u32, Value::Int(1)), (3, Value::Int(3))];
        let rhs = vec![(2u32, Value::Int(20)), (3, Value::Int(30))];
        let merged = merge_object_members(&lhs, &rhs);
        assert_eq!(merged, vec![(1, Value::Int(1)), (2, Value::Int(20)), (3, Value::Int(30))]);
        assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
