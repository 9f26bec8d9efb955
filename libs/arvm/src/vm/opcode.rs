// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The instruction set.
//!
//! Opcodes are one byte. Every opcode has a fixed total width of 1, 2 or 4
//! bytes, recorded in a static table:
//!
//! - width 1: bare opcode;
//! - width 2: opcode plus an 8-bit operand;
//! - width 4: opcode plus a 24-bit little-endian operand, of which
//!   flag-carrying instructions (calls, `INIT`, `MKFN`, `NGV`) use the low
//!   16 bits as the argument and the top byte as packed flags.
//!
//! Jump operands are absolute byte offsets into the owning code object.

use bitflags::bitflags;

macro_rules! opcodes {
    ($(($name:ident, $mnemonic:literal, $width:literal)),* $(,)?) => {
        /// One opcode byte. Discriminants are dense and stable.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum OpCode {
            $($name),*
        }

        impl OpCode {
            pub const COUNT: usize = 0 $(+ { let _ = $width; 1 })*;

            pub fn from_byte(byte: u8) -> Option<Self> {
                $(if byte == OpCode::$name as u8 {
                    return Some(Self::$name);
                })*
                None
            }

            /// Total instruction width in bytes, including the opcode byte.
            pub fn width(self) -> usize {
                match self {
                    $(Self::$name => $width),*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$name => $mnemonic),*
                }
            }

            pub fn from_mnemonic(s: &str) -> Option<Self> {
                match s {
                    $($mnemonic => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    (Add, "add", 1),
    (Await, "await", 1),
    (Call, "call", 4),
    (Cmp, "cmp", 2),
    (Cnt, "cnt", 2),
    (Dec, "dec", 1),
    (Dfr, "dfr", 4),
    (Div, "div", 1),
    (DtMerge, "dtmerge", 1),
    (Dup, "dup", 2),
    (EqSt, "eqst", 2),
    (Extd, "extd", 1),
    (IDiv, "idiv", 1),
    (ImpAll, "impall", 1),
    (ImpFrm, "impfrm", 4),
    (ImpMod, "impmod", 4),
    (Inc, "inc", 1),
    (Init, "init", 4),
    (Inv, "inv", 1),
    (IpAdd, "ipadd", 1),
    (IpSub, "ipsub", 1),
    (Jex, "jex", 4),
    (Jf, "jf", 4),
    (Jfop, "jfop", 4),
    (Jmp, "jmp", 4),
    (Jnil, "jnil", 4),
    (Jnn, "jnn", 4),
    (Jt, "jt", 4),
    (Jtop, "jtop", 4),
    (LAnd, "land", 1),
    (LdAttr, "ldattr", 4),
    (LdEnc, "ldenc", 2),
    (LdGbl, "ldgbl", 4),
    (LdIter, "lditer", 1),
    (LdLc, "ldlc", 2),
    (LdMeth, "ldmeth", 4),
    (LdScope, "ldscope", 4),
    (LOr, "lor", 1),
    (LStatic, "lstatic", 4),
    (LXor, "lxor", 1),
    (MkBnd, "mkbnd", 1),
    (MkDt, "mkdt", 4),
    (MkFn, "mkfn", 4),
    (MkLt, "mklt", 4),
    (MkSt, "mkst", 4),
    (MkStruct, "mkstruct", 4),
    (MkTp, "mktp", 4),
    (MkTrait, "mktrait", 4),
    (Mod, "mod", 1),
    (Mth, "mth", 2),
    (Mul, "mul", 1),
    (Neg, "neg", 1),
    (Ngv, "ngv", 4),
    (Not, "not", 1),
    (Nxt, "nxt", 1),
    (Panic, "panic", 1),
    (PbHead, "pbhead", 2),
    (Plt, "plt", 1),
    (Pop, "pop", 1),
    (PopC, "popc", 1),
    (PopGt, "popgt", 2),
    (Pos, "pos", 1),
    (PshC, "pshc", 1),
    (PshN, "pshn", 1),
    (Ret, "ret", 1),
    (Shl, "shl", 1),
    (Shr, "shr", 1),
    (Spw, "spw", 4),
    (St, "st", 4),
    (StAttr, "stattr", 4),
    (StEnc, "stenc", 2),
    (StGbl, "stgbl", 4),
    (StLc, "stlc", 2),
    (StScope, "stscope", 4),
    (StSubscr, "stsubscr", 1),
    (Sub, "sub", 1),
    (Subscr, "subscr", 1),
    (Sync, "sync", 1),
    (Test, "test", 1),
    (Trap, "trap", 4),
    (TStore, "tstore", 2),
    (Unpack, "unpack", 2),
    (UnSync, "unsync", 1),
    (Yld, "yld", 1),
}

bitflags! {
    /// Call-mode flags packed into the top byte of `CALL`/`DFR`/`SPW`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallMode: u8 {
        /// The trailing argument is a dict of keyword arguments.
        const KW_PARAMS = 1 << 0;
        /// The first argument is a list to spread into positionals.
        const REST_PARAMS = 1 << 1;
    }
}

bitflags! {
    /// Construction mode packed into the top byte of `INIT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InitMode: u8 {
        /// Arguments are (name, value) pairs instead of positional fields.
        const KW_INIT = 1 << 0;
    }
}

/// Decoded instruction operands.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub op: OpCode,
    /// 24-bit operand for width-4 instructions, 8-bit for width-2, else 0.
    pub arg: u32,
}

impl Instr {
    /// The low 16 bits of the operand.
    #[expect(clippy::cast_possible_truncation, reason = "explicitly the low half")]
    pub fn arg16(self) -> u16 {
        (self.arg & 0xffff) as u16
    }

    /// The packed flag byte of a width-4 instruction.
    #[expect(clippy::cast_possible_truncation, reason = "explicitly the top byte")]
    pub fn flags(self) -> u8 {
        (self.arg >> 16) as u8
    }

    pub fn arg_usize(self) -> usize {
        self.arg as usize
    }
}

/// Decode the instruction at `offset`, if any.
pub fn decode(instr: &[u8], offset: usize) -> Option<Instr> {
    let op = OpCode::from_byte(*instr.get(offset)?)?;

    let arg = match op.width() {
        1 => 0,
        2 => u32::from(*instr.get(offset + 1)?),
        4 => {
            let b1 = u32::from(*instr.get(offset + 1)?);
            let b2 = u32::from(*instr.get(offset + 2)?);
            let b3 = u32::from(*instr.get(offset + 3)?);
            b1 | (b2 << 8) | (b3 << 16)
        }
        _ => unreachable!("instruction widths are 1, 2 or 4"),
    };

    Some(Instr { op, arg })
}

/// Static stack effect of an instruction given its operand, as declared to
/// the compiler. `None` for instructions whose effect depends on runtime
/// state (`IPADD`/`IPSUB` store skipping, `POPGT`, `TRAP`).
pub fn stack_delta(op: OpCode, arg: u32) -> Option<i64> {
    use OpCode::*;

    let arg = i64::from(arg);
    let arg16 = arg & 0xffff;

    Some(match op {
        Add | Sub | Mul | Div | IDiv | Mod | Shl | Shr | LAnd | LOr | LXor => -1,
        Cmp | EqSt | Cnt | Test => -1,
        Not | Neg | Pos | Inv | Inc | Dec => 0,
        Await | LdIter | LdAttr | LdScope | Jmp | Jnil | Jnn | Mth | PbHead | St => 0,
        PopC | UnSync => 0,
        Dup => arg,
        Pop | Panic | Plt | Extd | DtMerge | MkBnd | Jf | Jt | Jfop | Jtop => -1,
        Ngv | StGbl | StLc | StEnc | Sync | PshC | Ret | Yld | ImpAll => -1,
        PshN | LdGbl | LdLc | LdEnc | LStatic | Nxt | LdMeth | ImpMod | ImpFrm => 1,
        StAttr | StScope | TStore => -2,
        StSubscr => -3,
        Subscr => -1,
        MkLt | MkTp | MkSt | MkDt => 1 - arg,
        MkStruct | MkTrait => -(arg + 2),
        MkFn => -2,
        Init => -arg16,
        Call => -arg16,
        Dfr | Spw => -(arg16 + 1),
        Unpack => arg - 1,
        Jex => 0,
        IpAdd | IpSub | PopGt | Trap => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_roundtrip() {
        let mut code = Vec::new();
        code.push(OpCode::PshN as u8);
        code.push(OpCode::LdLc as u8);
        code.push(3);
        code.push(OpCode::Call as u8);
        code.extend_from_slice(&[2, 0, CallMode::KW_PARAMS.bits()]);

        let i0 = decode(&code, 0).unwrap();
        assert_eq!(i0.op, OpCode::PshN);

        let i1 = decode(&code, 1).unwrap();
        assert_eq!(i1.op, OpCode::LdLc);
        assert_eq!(i1.arg, 3);

        let i2 = decode(&code, 3).unwrap();
        assert_eq!(i2.op, OpCode::Call);
        assert_eq!(i2.arg16(), 2);
        assert_eq!(CallMode::from_bits_truncate(i2.flags()), CallMode::KW_PARAMS);
    }

    #[test]
    fn every_opcode_roundtrips_through_byte_and_mnemonic() {
        for byte in 0..=u8::MAX {
            let Some(op) = OpCode::from_byte(byte) else {
                continue;
            };
            assert_eq!(op as u8, byte);
            assert_eq!(OpCode::from_mnemonic(op.mnemonic()), Some(op));
            assert!(matches!(op.width(), 1 | 2 | 4));
        }
    }
}
