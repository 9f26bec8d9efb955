// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mutable byte buffers, the workhorse of the I/O layer.

use std::sync::{Arc, LazyLock, Mutex};

use crate::object::bounds::Bounds;
use crate::object::typeinfo::{
    BufferSlots, CompareMode, IterSlots, OpSlots, SubscriptSlots, TypeHandle, TypeInfo,
};
use crate::object::{ObjRef, Object, OpResult, Payload, boolean, error, integer, iterator};

static BYTES_OPS: LazyLock<OpSlots> = LazyLock::new(|| OpSlots {
    add: Some(bytes_concat),
    inp_add: Some(bytes_concat),
    ..OpSlots::default()
});

static BYTES_SUBSCRIPT: SubscriptSlots = SubscriptSlots {
    get_item: Some(bytes_get_item),
    set_item: Some(bytes_set_item),
    get_slice: Some(bytes_get_slice),
    set_slice: None,
    item_in: Some(bytes_item_in),
};

static BYTES_BUFFER: BufferSlots = BufferSlots {
    read: |obj, f| {
        with_bytes(obj, |data| f(data));
        Ok(())
    },
    write: Some(|obj, f| {
        let Payload::Bytes(lock) = obj.payload() else {
            return Err(error::buffer_error("not a bytes object".to_string()));
        };
        f(&mut lock.lock().unwrap());
        Ok(())
    }),
};

static BYTES_ITER: IterSlots = IterSlots {
    iter: |obj, reversed| Ok(iterator::iterator_new(Arc::clone(obj), reversed)),
    next: None,
};

pub static BYTES_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("bytes");
    typ.truth = Some(|obj| bytes_len(obj) != 0);
    typ.repr = Some(bytes_repr);
    typ.compare = Some(bytes_compare);
    typ.ops = Some(LazyLock::force(&BYTES_OPS));
    typ.subscript = Some(&BYTES_SUBSCRIPT);
    typ.buffer = Some(&BYTES_BUFFER);
    typ.iter = Some(&BYTES_ITER);
    Arc::new(typ)
});

pub fn bytes(data: Vec<u8>) -> ObjRef {
    Object::new(Arc::clone(&BYTES_TYPE), Payload::Bytes(Mutex::new(data)))
}

pub fn bytes_len(obj: &ObjRef) -> usize {
    with_bytes(obj, <[u8]>::len)
}

pub fn with_bytes<R>(obj: &ObjRef, f: impl FnOnce(&[u8]) -> R) -> R {
    match obj.payload() {
        Payload::Bytes(lock) => f(&lock.lock().unwrap()),
        _ => f(&[]),
    }
}

fn bytes_concat(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Bytes(_), Payload::Bytes(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    let mut out = with_bytes(a, <[u8]>::to_vec);
    out.extend_from_slice(&rhs.lock().unwrap());
    Some(Ok(bytes(out)))
}

fn bytes_get_item(obj: &ObjRef, index: &ObjRef) -> OpResult {
    let idx = integer::expect_int(index, "bytes index")?;

    with_bytes(obj, |data| {
        crate::object::string::normalize_index(idx, data.len())
            .map(|i| integer::integer(i64::from(data[i])))
            .ok_or_else(|| error::value_error(format!("bytes index '{idx}' out of range")))
    })
}

fn bytes_set_item(obj: &ObjRef, index: &ObjRef, value: &ObjRef) -> OpResult<()> {
    let idx = integer::expect_int(index, "bytes index")?;
    let byte = integer::expect_int(value, "bytes store")?;

    let Ok(byte) = u8::try_from(byte) else {
        return Err(error::value_error(format!("byte value '{byte}' out of range")));
    };

    let Payload::Bytes(lock) = obj.payload() else {
        return Err(error::type_error("not a bytes object".to_string()));
    };

    let mut data = lock.lock().unwrap();
    let Some(i) = crate::object::string::normalize_index(idx, data.len()) else {
        return Err(error::value_error(format!("bytes index '{idx}' out of range")));
    };

    data[i] = byte;
    Ok(())
}

fn bytes_get_slice(obj: &ObjRef, bounds: &ObjRef) -> OpResult {
    with_bytes(obj, |data| {
        let (start, stop) = Bounds::clamp(bounds, data.len())?;
        Ok(bytes(data[start..stop.max(start)].to_vec()))
    })
}

fn bytes_item_in(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    let byte = integer::expect_int(item, "'in' on bytes")?;
    let Ok(byte) = u8::try_from(byte) else {
        return Ok(false);
    };

    Ok(with_bytes(obj, |data| data.contains(&byte)))
}

fn bytes_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Bytes(_), Payload::Bytes(_)) = (a.payload(), b.payload()) else {
        return None;
    };

    let ord = if Arc::ptr_eq(a, b) {
        std::cmp::Ordering::Equal
    } else {
        with_bytes(a, |lhs| with_bytes(b, |rhs| lhs.cmp(rhs)))
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

fn bytes_repr(obj: &ObjRef) -> OpResult<String> {
    with_bytes(obj, |data| {
        let mut out = String::from("b\"");
        for byte in data {
            match byte {
                b'"' => out.push_str("\\\""),
                0x20..=0x7e => out.push(char::from(*byte)),
                _ => out.push_str(&format!("\\x{byte:02x}")),
            }
        }
        out.push('"');
        Ok(out)
    })
}
