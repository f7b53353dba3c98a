// Copyright (c) 2017-2019 Fabian Schuiki

//! Symbolic value ranges of small integers.

use crate::ir::{is_valid_smi, Inst, SMI_MAX, SMI_MIN};
use std::fmt;

/// One end of a range.
///
/// Constant boundaries may lie one step outside the small integer range to
/// signal that a computation overflowed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RangeBoundary {
    Unknown,
    Constant(i64),
    /// The value of a definition plus a constant offset.
    Symbol(Inst, i64),
}

impl Default for RangeBoundary {
    fn default() -> Self {
        RangeBoundary::Unknown
    }
}

impl RangeBoundary {
    pub fn min_smi() -> Self {
        RangeBoundary::Constant(SMI_MIN)
    }

    pub fn max_smi() -> Self {
        RangeBoundary::Constant(SMI_MAX)
    }

    pub fn overflowed_min_smi() -> Self {
        RangeBoundary::Constant(SMI_MIN - 1)
    }

    pub fn overflowed_max_smi() -> Self {
        RangeBoundary::Constant(SMI_MAX + 1)
    }

    pub fn is_unknown(&self) -> bool {
        *self == RangeBoundary::Unknown
    }

    pub fn is_constant(&self) -> bool {
        match self {
            RangeBoundary::Constant(_) => true,
            _ => false,
        }
    }

    pub fn is_symbol(&self) -> bool {
        match self {
            RangeBoundary::Symbol(..) => true,
            _ => false,
        }
    }

    /// The value of a constant boundary.
    ///
    /// Panics if the boundary is not a constant.
    pub fn value(&self) -> i64 {
        match *self {
            RangeBoundary::Constant(v) => v,
            ref b => panic!("{} is not a constant boundary", b),
        }
    }

    /// The offset of a symbolic boundary, or zero.
    pub fn offset(&self) -> i64 {
        match *self {
            RangeBoundary::Symbol(_, offset) => offset,
            _ => 0,
        }
    }

    /// The definition of a symbolic boundary.
    pub fn symbol(&self) -> Option<Inst> {
        match *self {
            RangeBoundary::Symbol(def, _) => Some(def),
            _ => None,
        }
    }

    /// Check whether this constant lies outside the small integer range.
    pub fn overflowed(&self) -> bool {
        match *self {
            RangeBoundary::Constant(v) => !is_valid_smi(v),
            _ => false,
        }
    }

    /// Clamp an overflowed constant back into the small integer range.
    pub fn clamp(self) -> Self {
        match self {
            RangeBoundary::Constant(v) if v > SMI_MAX => RangeBoundary::max_smi(),
            RangeBoundary::Constant(v) if v < SMI_MIN => RangeBoundary::min_smi(),
            b => b,
        }
    }

    /// Add two constant boundaries, producing `overflow` if the result leaves
    /// the small integer range.
    pub fn add(a: Self, b: Self, overflow: Self) -> Self {
        match a.value().checked_add(b.value()) {
            Some(v) if is_valid_smi(v) => RangeBoundary::Constant(v),
            _ => overflow,
        }
    }

    /// Subtract two constant boundaries, producing `overflow` if the result
    /// leaves the small integer range.
    pub fn sub(a: Self, b: Self, overflow: Self) -> Self {
        match a.value().checked_sub(b.value()) {
            Some(v) if is_valid_smi(v) => RangeBoundary::Constant(v),
            _ => overflow,
        }
    }
}

impl fmt::Display for RangeBoundary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RangeBoundary::Unknown => write!(f, "_"),
            RangeBoundary::Constant(v) if v == SMI_MIN => write!(f, "-inf"),
            RangeBoundary::Constant(v) if v == SMI_MAX => write!(f, "+inf"),
            RangeBoundary::Constant(v) => write!(f, "{}", v),
            RangeBoundary::Symbol(def, 0) => write!(f, "{}", def),
            RangeBoundary::Symbol(def, offset) if offset < 0 => write!(f, "{} - {}", def, -offset),
            RangeBoundary::Symbol(def, offset) => write!(f, "{} + {}", def, offset),
        }
    }
}

/// A closed interval of small integers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Range {
    pub min: RangeBoundary,
    pub max: RangeBoundary,
}

impl Range {
    pub fn new(min: RangeBoundary, max: RangeBoundary) -> Self {
        Self { min, max }
    }

    /// The range of all small integers.
    pub fn unknown() -> Self {
        Self::new(RangeBoundary::min_smi(), RangeBoundary::max_smi())
    }

    /// A range containing exactly one constant.
    pub fn constant(value: i64) -> Self {
        Self::new(RangeBoundary::Constant(value), RangeBoundary::Constant(value))
    }

    /// A range between two constants.
    pub fn between(min: i64, max: i64) -> Self {
        Self::new(RangeBoundary::Constant(min), RangeBoundary::Constant(max))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_arithmetic_overflows() {
        let max = RangeBoundary::max_smi();
        let one = RangeBoundary::Constant(1);
        let of = RangeBoundary::overflowed_max_smi();
        assert_eq!(RangeBoundary::add(max, one, of), of);
        assert!(of.overflowed());
        assert_eq!(of.clamp(), max);
        assert_eq!(
            RangeBoundary::sub(RangeBoundary::Constant(3), one, of),
            RangeBoundary::Constant(2)
        );
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Range::unknown()), "[-inf, +inf]");
        assert_eq!(format!("{}", Range::between(0, 9)), "[0, 9]");
    }
}
