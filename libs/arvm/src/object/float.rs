// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{CompareMode, OpSlots, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, boolean, error};

static FLOAT_OPS: LazyLock<OpSlots> = LazyLock::new(|| OpSlots {
    add: Some(|a, b| arith(a, b, |x, y| x + y)),
    sub: Some(|a, b| arith(a, b, |x, y| x - y)),
    mul: Some(|a, b| arith(a, b, |x, y| x * y)),
    div: Some(|a, b| {
        let (lhs, rhs) = operands(a, b)?;
        Some(float_div(lhs, rhs).unwrap_or_else(|| Err(error::zero_division_error())))
    }),
    idiv: Some(|a, b| {
        let (lhs, rhs) = operands(a, b)?;
        if rhs == 0.0 {
            return Some(Err(error::zero_division_error()));
        }
        Some(Ok(float((lhs / rhs).floor())))
    }),
    rem: Some(|a, b| {
        let (lhs, rhs) = operands(a, b)?;
        if rhs == 0.0 {
            return Some(Err(error::zero_division_error()));
        }
        Some(Ok(float(lhs.rem_euclid(rhs))))
    }),
    neg: Some(|a| Ok(float(-float_value(a)))),
    pos: Some(|a| Ok(Arc::clone(a))),
    inc: Some(|a| Ok(float(float_value(a) + 1.0))),
    dec: Some(|a| Ok(float(float_value(a) - 1.0))),
    inp_add: Some(|a, b| arith(a, b, |x, y| x + y)),
    inp_sub: Some(|a, b| arith(a, b, |x, y| x - y)),
    ..OpSlots::default()
});

pub static FLOAT_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("float");
    typ.truth = Some(|obj| float_value(obj) != 0.0);
    typ.repr = Some(|obj| {
        let v = float_value(obj);
        if v.fract() == 0.0 && v.is_finite() {
            Ok(format!("{v:.1}"))
        } else {
            Ok(v.to_string())
        }
    });
    typ.compare = Some(|a, b, mode| {
        let (lhs, rhs) = operands(a, b)?;
        compare_f64(lhs, rhs, mode)
    });
    typ.hash = Some(|obj| Ok(float_hash(float_value(obj))));
    typ.ops = Some(LazyLock::force(&FLOAT_OPS));
    Arc::new(typ)
});

pub fn float(value: f64) -> ObjRef {
    Object::new(Arc::clone(&FLOAT_TYPE), Payload::Float(value))
}

pub fn float_value(obj: &ObjRef) -> f64 {
    match obj.payload() {
        Payload::Float(v) => *v,
        _ => 0.0,
    }
}

/// Hash consistent with integer hashing for integral values, so `1` and
/// `1.0` address the same dict slot.
#[expect(clippy::cast_possible_truncation, reason = "integral check precedes the cast")]
pub fn float_hash(v: f64) -> u64 {
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        (v as i64).cast_unsigned()
    } else {
        v.to_bits()
    }
}

/// Division with a zero check; `None` when the divisor is zero so the caller
/// picks the error.
pub fn float_div(lhs: f64, rhs: f64) -> Option<OpResult> {
    if rhs == 0.0 {
        return None;
    }
    Some(Ok(float(lhs / rhs)))
}

#[expect(clippy::cast_precision_loss, reason = "int to float promotion")]
fn operands(a: &ObjRef, b: &ObjRef) -> Option<(f64, f64)> {
    let Payload::Float(lhs) = a.payload() else {
        return None;
    };

    match b.payload() {
        Payload::Float(rhs) => Some((*lhs, *rhs)),
        Payload::Int(rhs) => Some((*lhs, *rhs as f64)),
        _ => None,
    }
}

#[expect(clippy::float_cmp, reason = "language-level float equality is exact")]
pub fn compare_f64(lhs: f64, rhs: f64, mode: CompareMode) -> Option<OpResult> {
    Some(Ok(boolean::boolean(match mode {
        CompareMode::Eq => lhs == rhs,
        CompareMode::Ne => lhs != rhs,
        CompareMode::Lt => lhs < rhs,
        CompareMode::Le => lhs <= rhs,
        CompareMode::Gt => lhs > rhs,
        CompareMode::Ge => lhs >= rhs,
    })))
}
