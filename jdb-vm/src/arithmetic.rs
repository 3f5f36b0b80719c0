//! Arithmetic, comparison, and broadcasting (§4.1). Centralized here so
//! `PRINT`, `+`/`-`/`*`/`/` and comparisons all share one set of rules,
//! per SPEC_FULL's "one coercion module" note.

use crate::tensor;
use crate::value::{to_bool, to_number, ArrayData, Value};
use arcstr::ArcStr;
use jdb_compiler::errors;
use jdb_compiler::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn apply_f64(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        // MOD on floats truncates both operands to integers first
        // (SPEC_FULL §9 open-question resolution).
        ArithOp::Mod => {
            let (ai, bi) = (a as i64, b as i64);
            if bi == 0 {
                f64::NAN
            } else {
                (ai % bi) as f64
            }
        }
        ArithOp::Pow => a.powf(b),
    }
}

fn apply_cmp_f64(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Ge => a >= b,
    }
}

/// Broadcast two array shapes per §4.1: scalar-vs-array, row-vs-matrix,
/// identical shapes. Returns the output shape or a type-mismatch error.
fn broadcast_shapes(a: &[usize], b: &[usize], line: u32) -> Result<Vec<usize>, ScriptError> {
    if a == b {
        return Ok(a.to_vec());
    }
    let a_len: usize = a.iter().product();
    let b_len: usize = b.iter().product();
    if a_len == 1 {
        return Ok(b.to_vec());
    }
    if b_len == 1 {
        return Ok(a.to_vec());
    }
    // row [C] against matrix [R, C]
    if let (Some(&_r), Some(&c)) = (a.first(), a.get(1)) {
        if b.len() == 1 && b[0] == c {
            return Ok(a.to_vec());
        }
    }
    if let (Some(&_r), Some(&c)) = (b.first(), b.get(1)) {
        if a.len() == 1 && a[0] == c {
            return Ok(b.to_vec());
        }
    }
    // row literal [1, C] against matrix [R, C] -- this VM's array
    // literals are always rank-2 (even a single-row `[[1,2]]` gets shape
    // `[1,2]`), so a rank-1 `[C]` row never actually appears at runtime;
    // the broadcast has to be recognized in its rank-2 form instead.
    if a.len() == 2 && b.len() == 2 && a[0] == 1 && a[1] == b[1] {
        return Ok(b.to_vec());
    }
    if a.len() == 2 && b.len() == 2 && b[0] == 1 && b[1] == a[1] {
        return Ok(a.to_vec());
    }
    Err(ScriptError::new(errors::TYPE_MISMATCH, line))
}

fn at_broadcast(data: &[Value], shape: &[usize], target: &[usize], flat: usize) -> Value {
    if shape == target {
        return data[flat].clone();
    }
    let len: usize = shape.iter().product();
    if len == 1 {
        return data[0].clone();
    }
    let cols = *shape.last().unwrap_or(&1);
    data[flat % cols].clone()
}

fn array_arith(op: ArithOp, a: &ArrayData, b: &ArrayData, line: u32) -> Result<Value, ScriptError> {
    let out_shape = broadcast_shapes(&a.shape, &b.shape, line)?;
    let n: usize = out_shape.iter().product();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let av = at_broadcast(&a.data, &a.shape, &out_shape, i);
        let bv = at_broadcast(&b.data, &b.shape, &out_shape, i);
        out.push(eval_arith(op, &av, &bv, line)?);
    }
    Ok(Value::array(out_shape, out))
}

fn array_arith_scalar(op: ArithOp, a: &ArrayData, scalar: &Value, line: u32) -> Result<Value, ScriptError> {
    let out: Result<Vec<Value>, ScriptError> = a.data.iter().map(|v| eval_arith(op, v, scalar, line)).collect();
    Ok(Value::array(a.shape.clone(), out?))
}

fn is_tensor(v: &Value) -> bool {
    matches!(v, Value::Tensor(_))
}

fn as_tensor(v: &Value) -> crate::value::TensorRef {
    match v {
        Value::Tensor(t) => t.clone(),
        other => {
            let n = to_number(other);
            tensor::leaf(vec![n], vec![1])
        }
    }
}

/// Arithmetic dispatch (§4.1): tensors route through the autodiff
/// engine, arrays broadcast, strings concatenate under `+` only,
/// everything else coerces to `f64`.
pub fn eval_arith(op: ArithOp, a: &Value, b: &Value, line: u32) -> Result<Value, ScriptError> {
    if is_tensor(a) || is_tensor(b) {
        let ta = as_tensor(a);
        let tb = as_tensor(b);
        let result = match op {
            ArithOp::Add => tensor::add(&ta, &tb),
            ArithOp::Sub => tensor::sub(&ta, &tb),
            ArithOp::Mul => tensor::mul(&ta, &tb),
            ArithOp::Div => {
                let scalar = tb.lock().data.first().copied().unwrap_or(1.0);
                tensor::div_scalar(&ta, scalar)
            }
            ArithOp::Pow => {
                let n = tb.lock().data.first().copied().unwrap_or(1.0);
                tensor::pow_scalar(&ta, n)
            }
            ArithOp::Mod => return Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        };
        return Ok(Value::Tensor(result));
    }

    match (a, b) {
        (Value::Str(s), _) | (_, Value::Str(s)) if op == ArithOp::Add => {
            let _ = s;
            let mut out = crate::value::to_display_string(a).to_string();
            out.push_str(&crate::value::to_display_string(b));
            Ok(Value::Str(ArcStr::from(out)))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        (Value::Array(ar_a), Value::Array(ar_b)) => {
            let (ga, gb) = (ar_a.lock(), ar_b.lock());
            array_arith(op, &ga, &gb, line)
        }
        (Value::Array(ar_a), other) => {
            let ga = ar_a.lock();
            array_arith_scalar(op, &ga, other, line)
        }
        (other, Value::Array(ar_b)) => {
            let gb = ar_b.lock();
            // scalar-vs-array: broadcast scalar to every element, same
            // op orientation (a op element), so swap operand order per
            // element rather than reusing array_arith_scalar verbatim.
            let out: Result<Vec<Value>, ScriptError> = gb.data.iter().map(|v| eval_arith(op, other, v, line)).collect();
            Ok(Value::array(gb.shape.clone(), out?))
        }
        _ => {
            let (na, nb) = (to_number(a), to_number(b));
            if (op == ArithOp::Div || op == ArithOp::Mod) && nb == 0.0 {
                return Err(ScriptError::new(errors::CALCULATION, line));
            }
            let result = apply_f64(op, na, nb);
            if matches!(a, Value::Integer(_)) && matches!(b, Value::Integer(_)) && op != ArithOp::Div && op != ArithOp::Pow {
                Ok(Value::Integer(result as i64))
            } else {
                Ok(Value::Double(result))
            }
        }
    }
}

/// Comparison dispatch (§4.1): same broadcast rules as arithmetic,
/// yielding booleans (scalar → bool, array → array-of-bool).
pub fn eval_cmp(op: CmpOp, a: &Value, b: &Value, line: u32) -> Result<Value, ScriptError> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Value::Bool(apply_cmp_str(op, x, y))),
        (Value::Array(ar_a), Value::Array(ar_b)) => {
            let (ga, gb) = (ar_a.lock(), ar_b.lock());
            let out_shape = broadcast_shapes(&ga.shape, &gb.shape, line)?;
            let n: usize = out_shape.iter().product();
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let av = at_broadcast(&ga.data, &ga.shape, &out_shape, i);
                let bv = at_broadcast(&gb.data, &gb.shape, &out_shape, i);
                out.push(eval_cmp(op, &av, &bv, line)?);
            }
            Ok(Value::array(out_shape, out))
        }
        (Value::Array(ar_a), other) => {
            let ga = ar_a.lock();
            let out: Result<Vec<Value>, ScriptError> = ga.data.iter().map(|v| eval_cmp(op, v, other, line)).collect();
            Ok(Value::array(ga.shape.clone(), out?))
        }
        (other, Value::Array(ar_b)) => {
            let gb = ar_b.lock();
            let out: Result<Vec<Value>, ScriptError> = gb.data.iter().map(|v| eval_cmp(op, other, v, line)).collect();
            Ok(Value::array(gb.shape.clone(), out?))
        }
        _ => Ok(Value::Bool(apply_cmp_f64(op, to_number(a), to_number(b)))),
    }
}

fn apply_cmp_str(op: CmpOp, a: &str, b: &str) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Ge => a >= b,
    }
}

pub fn eval_logical_and(a: &Value, b: &Value) -> Value {
    Value::Bool(to_bool(a) && to_bool(b))
}

pub fn eval_logical_or(a: &Value, b: &Value) -> Value {
    Value::Bool(to_bool(a) || to_bool(b))
}

pub fn eval_not(a: &Value) -> Value {
    Value::Bool(!to_bool(a))
}

pub fn eval_neg(a: &Value, line: u32) -> Result<Value, ScriptError> {
    match a {
        Value::Integer(i) => Ok(Value::Integer(-i)),
        Value::Double(d) => Ok(Value::Double(-d)),
        Value::Tensor(t) => {
            let neg_one = tensor::leaf(vec![-1.0], vec![1]);
            Ok(Value::Tensor(tensor::mul(t, &neg_one)))
        }
        Value::Array(ar) => {
            let g = ar.lock();
            let out: Result<Vec<Value>, ScriptError> = g.data.iter().map(|v| eval_neg(v, line)).collect();
            Ok(Value::array(g.shape.clone(), out?))
        }
        _ => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_vs_array_broadcasts() {
        let arr = Value::array(vec![2], vec![Value::Integer(1), Value::Integer(2)]);
        let result = eval_arith(ArithOp::Add, &arr, &Value::Integer(10), 1).unwrap();
        match result {
            Value::Array(a) => {
                let g = a.lock();
                assert!(matches!(g.data[0], Value::Integer(11)));
                assert!(matches!(g.data[1], Value::Integer(12)));
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn string_concat() {
        let r = eval_arith(ArithOp::Add, &Value::Str(ArcStr::from("a")), &Value::Str(ArcStr::from("b")), 1).unwrap();
        match r {
            Value::Str(s) => assert_eq!(s.as_str(), "ab"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn string_sub_is_type_mismatch() {
        let r = eval_arith(ArithOp::Sub, &Value::Str(ArcStr::from("a")), &Value::Integer(1), 7);
        assert!(matches!(r, Err(e) if e.code == errors::TYPE_MISMATCH && e.line == 7));
    }

    #[test]
    fn comparison_broadcasts_to_bool_array() {
        let arr = Value::array(vec![2], vec![Value::Integer(1), Value::Integer(5)]);
        let r = eval_cmp(CmpOp::Gt, &arr, &Value::Integer(3), 1).unwrap();
        match r {
            Value::Array(a) => {
                let g = a.lock();
                assert!(matches!(g.data[0], Value::Bool(false)));
                assert!(matches!(g.data[1], Value::Bool(true)));
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn division_by_zero_is_calculation_error() {
        let r = eval_arith(ArithOp::Div, &Value::Integer(1), &Value::Integer(0), 4);
        assert!(matches!(r, Err(e) if e.code == errors::CALCULATION && e.line == 4));
    }

    #[test]
    fn mod_by_zero_is_calculation_error() {
        let r = eval_arith(ArithOp::Mod, &Value::Integer(7), &Value::Double(0.0), 9);
        assert!(matches!(r, Err(e) if e.code == errors::CALCULATION));
    }

    #[test]
    fn broadcast_is_symmetric() {
        let arr = Value::array(vec![2], vec![Value::Integer(1), Value::Integer(2)]);
        let left = eval_arith(ArithOp::Add, &arr, &Value::Integer(10), 1).unwrap();
        let right = eval_arith(ArithOp::Add, &Value::Integer(10), &arr, 1).unwrap();
        let (Value::Array(l), Value::Array(r)) = (left, right) else { panic!("expected arrays") };
        let (lg, rg) = (l.lock(), r.lock());
        let l_nums: Vec<f64> = lg.data.iter().map(to_number).collect();
        let r_nums: Vec<f64> = rg.data.iter().map(to_number).collect();
        assert_eq!(l_nums, r_nums);
    }

    #[test]
    fn row_literal_broadcasts_against_matrix() {
        // [[1,2]] has shape [1,2] (every bracket literal is rank-2 in this
        // VM), not the rank-1 [2] the naive row-broadcast check expects.
        let row = Value::array(
            vec![1, 2],
            vec![Value::Integer(1), Value::Integer(2)],
        );
        let matrix = Value::array(
            vec![2, 2],
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3), Value::Integer(4)],
        );
        let r = eval_arith(ArithOp::Add, &row, &matrix, 1).unwrap();
        let Value::Array(a) = r else { panic!("expected array") };
        let g = a.lock();
        assert_eq!(g.shape, vec![2, 2]);
        let nums: Vec<f64> = g.data.iter().map(to_number).collect();
        assert_eq!(nums, vec![2.0, 4.0, 4.0, 6.0]);
    }
}
