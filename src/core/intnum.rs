// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Arbitrary-precision integers used as expression leaves.
//!
//! Constant folding, section offsets, and data values all flow through
//! `IntNum` so that intermediate arithmetic never silently wraps. Fixed-width
//! truncation happens only at byte-emission time, where it is classified as
//! signed or unsigned overflow according to the caller's warn mode.

use num_bigint::{BigInt, Sign};
use num_traits::{One, Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;

use super::arch::Endian;
use super::error::{CoreError, CoreErrorKind};
use super::expr::Op;

/// Largest shift count accepted by `<<` and `>>`.
///
/// Anything larger is a malformed expression rather than a request for a
/// multi-gigabyte intermediate.
const MAX_SHIFT: u64 = 0xffff;

/// Result classification of a fixed-width write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    None,
    Signed,
    Unsigned,
}

/// Arbitrary-precision signed integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IntNum {
    val: BigInt,
}

impl IntNum {
    pub fn new(val: i64) -> Self {
        Self {
            val: BigInt::from(val),
        }
    }

    pub fn from_u64(val: u64) -> Self {
        Self {
            val: BigInt::from(val),
        }
    }

    pub fn zero() -> Self {
        Self {
            val: BigInt::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.val.is_zero()
    }

    pub fn is_pos1(&self) -> bool {
        self.val.is_one()
    }

    pub fn is_neg1(&self) -> bool {
        self.val == BigInt::from(-1)
    }

    pub fn is_negative(&self) -> bool {
        self.val.is_negative()
    }

    pub fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }

    pub fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }

    /// Whether the value is representable in `bits` bits.
    pub fn fits(&self, bits: u32, signed: bool) -> bool {
        if signed {
            let bound = BigInt::one() << (bits - 1);
            self.val >= -&bound && self.val < bound
        } else {
            let bound = BigInt::one() << bits;
            !self.val.is_negative() && self.val < bound
        }
    }

    /// Apply an operator in place. `rhs` is `None` for unary operators.
    pub fn calc(&mut self, op: Op, rhs: Option<&IntNum>) -> Result<(), CoreError> {
        fn need(rhs: Option<&IntNum>) -> Result<&BigInt, CoreError> {
            rhs.map(|r| &r.val).ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InternalConsistency,
                    "binary integer operation missing right operand",
                )
            })
        }
        match op {
            Op::Ident => {}
            Op::Add => self.val += need(rhs)?,
            Op::Sub => self.val -= need(rhs)?,
            Op::Mul => self.val *= need(rhs)?,
            Op::Div | Op::SignDiv => {
                let r = need(rhs)?;
                if r.is_zero() {
                    return Err(CoreError::new(
                        CoreErrorKind::DivisionByZero,
                        "division by zero",
                    ));
                }
                self.val = &self.val / r;
            }
            Op::Mod | Op::SignMod => {
                let r = need(rhs)?;
                if r.is_zero() {
                    return Err(CoreError::new(
                        CoreErrorKind::DivisionByZero,
                        "modulo by zero",
                    ));
                }
                self.val = &self.val % r;
            }
            Op::Neg => self.val = -std::mem::take(&mut self.val),
            Op::Not => self.val = -std::mem::take(&mut self.val) - 1,
            Op::Or => self.val = &self.val | need(rhs)?,
            Op::And => self.val = &self.val & need(rhs)?,
            Op::Xor => self.val = &self.val ^ need(rhs)?,
            Op::Xnor => self.val = -(&self.val ^ need(rhs)?) - 1,
            Op::Nor => self.val = -(&self.val | need(rhs)?) - 1,
            Op::Shl => {
                let n = Self::shift_count(need(rhs)?)?;
                self.val = &self.val << n;
            }
            Op::Shr => {
                let n = Self::shift_count(need(rhs)?)?;
                self.val = &self.val >> n;
            }
            Op::Lnot => self.val = BigInt::from(self.val.is_zero() as i64),
            Op::Lor => {
                let r = need(rhs)?;
                self.val = BigInt::from((!self.val.is_zero() || !r.is_zero()) as i64);
            }
            Op::Land => {
                let r = need(rhs)?;
                self.val = BigInt::from((!self.val.is_zero() && !r.is_zero()) as i64);
            }
            Op::Lxor => {
                let r = need(rhs)?;
                self.val = BigInt::from((!self.val.is_zero() ^ !r.is_zero()) as i64);
            }
            Op::Lxnor => {
                let r = need(rhs)?;
                self.val = BigInt::from((!self.val.is_zero() == !r.is_zero()) as i64);
            }
            Op::Lnor => {
                let r = need(rhs)?;
                self.val = BigInt::from((self.val.is_zero() && r.is_zero()) as i64);
            }
            Op::Eq => self.val = BigInt::from((&self.val == need(rhs)?) as i64),
            Op::Ne => self.val = BigInt::from((&self.val != need(rhs)?) as i64),
            Op::Lt => self.val = BigInt::from((self.val.cmp(need(rhs)?) == Ordering::Less) as i64),
            Op::Le => {
                self.val = BigInt::from((self.val.cmp(need(rhs)?) != Ordering::Greater) as i64)
            }
            Op::Gt => {
                self.val = BigInt::from((self.val.cmp(need(rhs)?) == Ordering::Greater) as i64)
            }
            Op::Ge => self.val = BigInt::from((self.val.cmp(need(rhs)?) != Ordering::Less) as i64),
            Op::Seg | Op::Wrt | Op::SegOff | Op::Cond => {
                return Err(CoreError::new(
                    CoreErrorKind::MalformedExpression,
                    format!("operator {op:?} has no integer evaluation"),
                ))
            }
        }
        Ok(())
    }

    fn shift_count(rhs: &BigInt) -> Result<u64, CoreError> {
        match rhs.to_u64() {
            Some(n) if n <= MAX_SHIFT => Ok(n),
            _ => Err(CoreError::new(
                CoreErrorKind::MalformedExpression,
                "invalid shift count",
            )),
        }
    }

    /// Write the low bits into `buf` as two's complement, returning the
    /// overflow classification requested by `warn`: positive checks the
    /// unsigned range, negative the signed range, zero suppresses the check.
    pub fn write_to(&self, buf: &mut [u8], endian: Endian, warn: i32) -> Overflow {
        let bits = (buf.len() * 8) as u32;
        let mask = (BigInt::one() << bits) - 1;
        let low = &self.val & &mask;
        let (sign, bytes) = low.to_bytes_le();
        debug_assert_ne!(sign, Sign::Minus);

        buf.fill(0);
        for (dst, src) in buf.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        if endian == Endian::Big {
            buf.reverse();
        }

        if warn > 0 && !self.fits(bits, false) {
            Overflow::Unsigned
        } else if warn < 0 && !self.fits(bits, true) {
            Overflow::Signed
        } else {
            Overflow::None
        }
    }
}

impl From<BigInt> for IntNum {
    fn from(val: BigInt) -> Self {
        Self { val }
    }
}

impl From<i64> for IntNum {
    fn from(val: i64) -> Self {
        Self::new(val)
    }
}

impl fmt::Display for IntNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.val)
    }
}

impl fmt::LowerHex for IntNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.val, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(lhs: i64, op: Op, rhs: i64) -> IntNum {
        let mut v = IntNum::new(lhs);
        v.calc(op, Some(&IntNum::new(rhs))).unwrap();
        v
    }

    #[test]
    fn arithmetic_folds_exactly() {
        assert_eq!(calc(10, Op::Add, 5), IntNum::new(15));
        assert_eq!(calc(10, Op::Sub, 5), IntNum::new(5));
        assert_eq!(calc(10, Op::Mul, 5), IntNum::new(50));
        assert_eq!(calc(10, Op::Div, 3), IntNum::new(3));
        assert_eq!(calc(10, Op::Mod, 3), IntNum::new(1));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let mut v = IntNum::new(10);
        let err = v.calc(Op::Div, Some(&IntNum::zero())).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::DivisionByZero);
        let err = v.calc(Op::SignMod, Some(&IntNum::zero())).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::DivisionByZero);
    }

    #[test]
    fn bitwise_ops_follow_twos_complement() {
        assert_eq!(calc(0xf0, Op::And, 0x3c), IntNum::new(0x30));
        assert_eq!(calc(0xf0, Op::Or, 0x0f), IntNum::new(0xff));
        assert_eq!(calc(0xff, Op::Xor, 0x0f), IntNum::new(0xf0));
        let mut v = IntNum::new(0);
        v.calc(Op::Not, None).unwrap();
        assert_eq!(v, IntNum::new(-1));
        assert_eq!(calc(0b1010, Op::Xnor, 0b0110), IntNum::new(!0b1100));
        assert_eq!(calc(0b1010, Op::Nor, 0b0110), IntNum::new(!0b1110));
    }

    #[test]
    fn shifts_grow_past_machine_width() {
        let v = calc(1, Op::Shl, 100);
        assert!(v.to_u64().is_none());
        assert!(v.fits(101, false));
        assert!(!v.fits(100, false));
        assert_eq!(calc(-8, Op::Shr, 1), IntNum::new(-4));
    }

    #[test]
    fn oversized_shift_count_rejected() {
        let mut v = IntNum::new(1);
        let err = v
            .calc(Op::Shl, Some(&IntNum::from_u64(1 << 40)))
            .unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
    }

    #[test]
    fn logical_ops_return_zero_or_one() {
        assert_eq!(calc(5, Op::Land, -3), IntNum::new(1));
        assert_eq!(calc(5, Op::Land, 0), IntNum::new(0));
        assert_eq!(calc(0, Op::Lor, 0), IntNum::new(0));
        assert_eq!(calc(1, Op::Lxor, 1), IntNum::new(0));
        assert_eq!(calc(1, Op::Lxnor, 1), IntNum::new(1));
        assert_eq!(calc(0, Op::Lnor, 0), IntNum::new(1));
    }

    #[test]
    fn comparisons_are_signed() {
        assert_eq!(calc(-1, Op::Lt, 0), IntNum::new(1));
        assert_eq!(calc(-1, Op::Ge, 0), IntNum::new(0));
        assert_eq!(calc(3, Op::Eq, 3), IntNum::new(1));
        assert_eq!(calc(3, Op::Ne, 3), IntNum::new(0));
    }

    #[test]
    fn write_to_truncates_twos_complement() {
        let mut buf = [0u8; 2];
        IntNum::new(-1).write_to(&mut buf, Endian::Little, 0);
        assert_eq!(buf, [0xff, 0xff]);
        IntNum::new(0x1234).write_to(&mut buf, Endian::Little, 0);
        assert_eq!(buf, [0x34, 0x12]);
        IntNum::new(0x1234).write_to(&mut buf, Endian::Big, 0);
        assert_eq!(buf, [0x12, 0x34]);
    }

    #[test]
    fn write_to_classifies_overflow_by_warn_mode() {
        let mut buf = [0u8; 1];
        assert_eq!(
            IntNum::new(300).write_to(&mut buf, Endian::Little, 1),
            Overflow::Unsigned
        );
        assert_eq!(buf, [0x2c]);
        assert_eq!(
            IntNum::new(200).write_to(&mut buf, Endian::Little, -1),
            Overflow::Signed
        );
        assert_eq!(
            IntNum::new(200).write_to(&mut buf, Endian::Little, 1),
            Overflow::None
        );
        assert_eq!(
            IntNum::new(-1).write_to(&mut buf, Endian::Little, 0),
            Overflow::None
        );
    }
}
