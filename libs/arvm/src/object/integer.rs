// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! 64-bit signed integers.
//!
//! Arithmetic is checked: wrap-around raises `OverflowError`, division by
//! zero raises `ZeroDivisionError`. Mixed int/float expressions promote to
//! float through the reflected slot mechanism.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{CompareMode, OpSlots, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, boolean, error, float};

static INT_OPS: LazyLock<OpSlots> = LazyLock::new(|| OpSlots {
    add: Some(|a, b| arith(a, b, "+", i64::checked_add, |x, y| x + y)),
    sub: Some(|a, b| arith(a, b, "-", i64::checked_sub, |x, y| x - y)),
    mul: Some(|a, b| arith(a, b, "*", i64::checked_mul, |x, y| x * y)),
    div: Some(int_div),
    idiv: Some(int_idiv),
    rem: Some(int_rem),
    shl: Some(int_shl),
    shr: Some(int_shr),
    and: Some(|a, b| bitwise(a, b, |x, y| x & y)),
    or: Some(|a, b| bitwise(a, b, |x, y| x | y)),
    xor: Some(|a, b| bitwise(a, b, |x, y| x ^ y)),
    neg: Some(int_neg),
    pos: Some(|a| Ok(Arc::clone(a))),
    invert: Some(|a| Ok(integer(!int_value(a)))),
    inc: Some(|a| {
        int_value(a)
            .checked_add(1)
            .map(integer)
            .ok_or_else(|| error::overflow_error("integer overflow in '++'".to_string()))
    }),
    dec: Some(|a| {
        int_value(a)
            .checked_sub(1)
            .map(integer)
            .ok_or_else(|| error::overflow_error("integer overflow in '--'".to_string()))
    }),
    // integers are immutable, in place addition builds a new object
    inp_add: Some(|a, b| arith(a, b, "+=", i64::checked_add, |x, y| x + y)),
    inp_sub: Some(|a, b| arith(a, b, "-=", i64::checked_sub, |x, y| x - y)),
});

pub static INT_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("int");
    typ.truth = Some(|obj| int_value(obj) != 0);
    typ.repr = Some(|obj| Ok(int_value(obj).to_string()));
    typ.compare = Some(int_compare);
    typ.hash = Some(|obj| Ok(int_value(obj).cast_unsigned()));
    typ.ops = Some(LazyLock::force(&INT_OPS));
    Arc::new(typ)
});

pub fn integer(value: i64) -> ObjRef {
    Object::new(Arc::clone(&INT_TYPE), Payload::Int(value))
}

pub fn int_value(obj: &ObjRef) -> i64 {
    match obj.payload() {
        Payload::Int(v) => *v,
        _ => 0,
    }
}

/// Extract an `i64`, raising `TypeError` for anything else.
pub fn expect_int(obj: &ObjRef, what: &str) -> OpResult<i64> {
    match obj.payload() {
        Payload::Int(v) => Ok(*v),
        _ => Err(error::type_error(format!(
            "{what} expects an 'int', got '{}'",
            obj.type_name()
        ))),
    }
}

fn arith(
    a: &ObjRef,
    b: &ObjRef,
    symbol: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<OpResult> {
    let Payload::Int(lhs) = a.payload() else {
        return None;
    };

    match b.payload() {
        Payload::Int(rhs) => Some(
            int_op(*lhs, *rhs)
                .map(integer)
                .ok_or_else(|| error::overflow_error(format!("integer overflow in '{symbol}'"))),
        ),
        #[expect(clippy::cast_precision_loss, reason = "int to float promotion")]
        Payload::Float(rhs) => Some(Ok(float::float(float_op(*lhs as f64, *rhs)))),
        _ => None,
    }
}

#[expect(clippy::cast_precision_loss, reason = "true division promotes to float")]
fn int_div(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let Payload::Int(lhs) = a.payload() else {
        return None;
    };

    match b.payload() {
        Payload::Int(0) => Some(Err(error::zero_division_error())),
        Payload::Int(rhs) => Some(Ok(float::float(*lhs as f64 / *rhs as f64))),
        Payload::Float(rhs) => Some(
            float::float_div(*lhs as f64, *rhs)
                .unwrap_or_else(|| Err(error::zero_division_error())),
        ),
        _ => None,
    }
}

fn int_idiv(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Int(lhs), Payload::Int(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    if *rhs == 0 {
        return Some(Err(error::zero_division_error()));
    }

    Some(
        lhs.checked_div_euclid(*rhs)
            .map(integer)
            .ok_or_else(|| error::overflow_error("integer overflow in '//'".to_string())),
    )
}

fn int_rem(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Int(lhs), Payload::Int(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    if *rhs == 0 {
        return Some(Err(error::zero_division_error()));
    }

    Some(
        lhs.checked_rem_euclid(*rhs)
            .map(integer)
            .ok_or_else(|| error::overflow_error("integer overflow in '%'".to_string())),
    )
}

fn int_shl(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Int(lhs), Payload::Int(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    Some(match u32::try_from(*rhs) {
        Ok(shift) => lhs
            .checked_shl(shift)
            .map(integer)
            .ok_or_else(|| error::overflow_error("shift count out of range".to_string())),
        Err(_) => Err(error::value_error("negative shift count".to_string())),
    })
}

fn int_shr(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Int(lhs), Payload::Int(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    Some(match u32::try_from(*rhs) {
        Ok(shift) => lhs
            .checked_shr(shift)
            .map(integer)
            .ok_or_else(|| error::overflow_error("shift count out of range".to_string())),
        Err(_) => Err(error::value_error("negative shift count".to_string())),
    })
}

fn bitwise(a: &ObjRef, b: &ObjRef, op: fn(i64, i64) -> i64) -> Option<OpResult> {
    let (Payload::Int(lhs), Payload::Int(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    Some(Ok(integer(op(*lhs, *rhs))))
}

fn int_neg(a: &ObjRef) -> OpResult {
    int_value(a)
        .checked_neg()
        .map(integer)
        .ok_or_else(|| error::overflow_error("integer overflow in unary '-'".to_string()))
}

#[expect(clippy::cast_precision_loss, reason = "int to float comparison")]
fn int_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let Payload::Int(lhs) = a.payload() else {
        return None;
    };

    let ord = match b.payload() {
        Payload::Int(rhs) => lhs.cmp(rhs),
        Payload::Float(rhs) => return float::compare_f64(*lhs as f64, *rhs, mode),
        _ => return None,
    };

    Some(Ok(boolean::boolean(match mode {
        CompareMode::Eq => ord.is_eq(),
        CompareMode::Ne => ord.is_ne(),
        CompareMode::Lt => ord.is_lt(),
        CompareMode::Le => ord.is_le(),
        CompareMode::Gt => ord.is_gt(),
        CompareMode::Ge => ord.is_ge(),
    })))
}
