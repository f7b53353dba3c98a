// Copyright (c) 2017-2019 Fabian Schuiki

//! Operator tokens carried by calls and arithmetic instructions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The operator a call site or arithmetic instruction implements.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    Add,
    Sub,
    Mul,
    Div,
    TruncDiv,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Negate,
    BitNot,
    Not,
    Eq,
    Ne,
    EqStrict,
    NeStrict,
    Lt,
    Gt,
    Lte,
    Gte,
    Index,
    AssignIndex,
    Get,
    Set,
    Is,
    IsNot,
    /// A plain method call without operator semantics.
    Illegal,
}

impl Token {
    /// Check whether this is a binary arithmetic or bitwise operator.
    pub fn is_binary_arithmetic(self) -> bool {
        match self {
            Token::Add
            | Token::Sub
            | Token::Mul
            | Token::Div
            | Token::TruncDiv
            | Token::Mod
            | Token::BitAnd
            | Token::BitOr
            | Token::BitXor
            | Token::Shl
            | Token::Shr => true,
            _ => false,
        }
    }

    /// Check whether this is a unary prefix operator.
    pub fn is_unary(self) -> bool {
        match self {
            Token::Negate | Token::BitNot => true,
            _ => false,
        }
    }

    /// Check whether this is a relational operator.
    pub fn is_relational(self) -> bool {
        match self {
            Token::Lt | Token::Gt | Token::Lte | Token::Gte => true,
            _ => false,
        }
    }

    /// Check whether this is an equality operator.
    pub fn is_equality(self) -> bool {
        match self {
            Token::Eq | Token::Ne | Token::EqStrict | Token::NeStrict => true,
            _ => false,
        }
    }

    /// Check whether this is a type test operator.
    pub fn is_type_test(self) -> bool {
        self == Token::Is || self == Token::IsNot
    }

    /// Check whether the operands of this operator can be swapped.
    pub fn is_commutative(self) -> bool {
        match self {
            Token::Add | Token::Mul | Token::BitAnd | Token::BitOr | Token::BitXor => true,
            _ => false,
        }
    }

    /// The comparison that holds exactly when this one does not.
    pub fn negate_comparison(self) -> Token {
        match self {
            Token::Eq => Token::Ne,
            Token::Ne => Token::Eq,
            Token::EqStrict => Token::NeStrict,
            Token::NeStrict => Token::EqStrict,
            Token::Lt => Token::Gte,
            Token::Gt => Token::Lte,
            Token::Lte => Token::Gt,
            Token::Gte => Token::Lt,
            t => panic!("{:?} is not a comparison", t),
        }
    }

    /// The comparison that holds with swapped operands.
    pub fn flip_comparison(self) -> Token {
        match self {
            Token::Lt => Token::Gt,
            Token::Gt => Token::Lt,
            Token::Lte => Token::Gte,
            Token::Gte => Token::Lte,
            t => t,
        }
    }

    /// The source-level spelling of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            Token::Add => "+",
            Token::Sub => "-",
            Token::Mul => "*",
            Token::Div => "/",
            Token::TruncDiv => "~/",
            Token::Mod => "%",
            Token::BitAnd => "&",
            Token::BitOr => "|",
            Token::BitXor => "^",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::Negate => "unary-",
            Token::BitNot => "~",
            Token::Not => "!",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::EqStrict => "===",
            Token::NeStrict => "!==",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Lte => "<=",
            Token::Gte => ">=",
            Token::Index => "[]",
            Token::AssignIndex => "[]=",
            Token::Get => "get",
            Token::Set => "set",
            Token::Is => "is",
            Token::IsNot => "is!",
            Token::Illegal => "call",
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}
