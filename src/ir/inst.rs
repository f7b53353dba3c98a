// Copyright (c) 2017-2019 Fabian Schuiki

//! Representation of instructions.
//!
//! Instructions form a closed set. Every cross-cutting property (inputs,
//! successors, effects, representations, value numbering) is an exhaustive
//! match over `InstData`.

use crate::ir::{Block, ClassId, Constant, FunctionId, IcData, Inst, Range, RecognizedMethod, Token};
use std::{fmt, sync::Arc};

/// The kind of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Constant,
    Parameter,
    LoadLocal,
    StoreLocal,
    PushArgument,
    Phi,
    InstanceCall,
    PolymorphicInstanceCall,
    StaticCall,
    AllocateObject,
    CreateArray,
    CheckSmi,
    CheckClass,
    CheckEitherNonSmi,
    CheckArrayBound,
    BinarySmiOp,
    BinaryMintOp,
    ShiftMintOp,
    BinaryDoubleOp,
    UnarySmiOp,
    UnaryMintOp,
    BoxDouble,
    UnboxDouble,
    BoxInteger,
    UnboxInteger,
    MathSqrt,
    InvokeMathCFunction,
    DoubleToSmi,
    DoubleToInteger,
    SmiToDouble,
    DoubleTruncate,
    DoubleRound,
    DoubleFloor,
    DoubleCeil,
    BooleanNegate,
    StringFromCharCode,
    LoadField,
    StoreField,
    LoadIndexed,
    StoreIndexed,
    StrictCompare,
    EqualityCompare,
    RelationalOp,
    InstanceOf,
    AssertAssignable,
    AssertBoolean,
    Constraint,
    Goto,
    Branch,
    Return,
    Throw,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a value is stored by the generated code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Representation {
    /// A tagged pointer or small integer.
    Tagged,
    UnboxedDouble,
    /// An unboxed 64 bit integer.
    UnboxedMint,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Representation::Tagged => write!(f, "tagged"),
            Representation::UnboxedDouble => write!(f, "double"),
            Representation::UnboxedMint => write!(f, "mint"),
        }
    }
}

/// The flavour of a comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareKind {
    /// Identity comparison (`===`, `!==`).
    Strict,
    /// User-definable equality (`==`, `!=`).
    Equality,
    /// Ordering (`<`, `>`, `<=`, `>=`).
    Relational,
}

/// A comparison, either standing alone or embedded in a branch.
#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub kind: CompareKind,
    pub op: Token,
    pub args: [Inst; 2],
    /// The class both operands are known to have, or `ClassId::DYNAMIC` for
    /// a generic comparison that dispatches through a call.
    pub operands_cid: ClassId,
    pub ic: Option<Arc<IcData>>,
    /// Whether boxed numbers need to be compared by value.
    pub needs_number_check: bool,
}

impl Comparison {
    /// Create a strict identity comparison.
    pub fn strict(op: Token, left: Inst, right: Inst) -> Self {
        Self {
            kind: CompareKind::Strict,
            op,
            args: [left, right],
            operands_cid: ClassId::DYNAMIC,
            ic: None,
            needs_number_check: true,
        }
    }

    /// Create an equality comparison with optional type feedback.
    pub fn equality(op: Token, left: Inst, right: Inst, ic: Option<Arc<IcData>>) -> Self {
        Self {
            kind: CompareKind::Equality,
            op,
            args: [left, right],
            operands_cid: ClassId::DYNAMIC,
            ic,
            needs_number_check: false,
        }
    }

    /// Create a relational comparison with optional type feedback.
    pub fn relational(op: Token, left: Inst, right: Inst, ic: Option<Arc<IcData>>) -> Self {
        Self {
            kind: CompareKind::Relational,
            op,
            args: [left, right],
            operands_cid: ClassId::DYNAMIC,
            ic,
            needs_number_check: false,
        }
    }

    /// Check whether the comparison still dispatches through a call.
    pub fn is_generic(&self) -> bool {
        self.kind != CompareKind::Strict
            && self.operands_cid != ClassId::SMI
            && self.operands_cid != ClassId::DOUBLE
            && self.operands_cid != ClassId::MINT
    }

    pub fn opcode(&self) -> Opcode {
        match self.kind {
            CompareKind::Strict => Opcode::StrictCompare,
            CompareKind::Equality => Opcode::EqualityCompare,
            CompareKind::Relational => Opcode::RelationalOp,
        }
    }

    fn operand_representation(&self) -> Representation {
        match (self.kind, self.operands_cid) {
            (CompareKind::Strict, _) => Representation::Tagged,
            (_, ClassId::DOUBLE) => Representation::UnboxedDouble,
            (_, ClassId::MINT) => Representation::UnboxedMint,
            _ => Representation::Tagged,
        }
    }
}

/// A dynamically dispatched call.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceCall {
    /// The selector.
    pub name: Arc<str>,
    pub token: Token,
    /// The pushed arguments, receiver first.
    pub arguments: Vec<Inst>,
    pub ic: Option<Arc<IcData>>,
    /// The number of leading arguments whose classes the inline cache tests.
    pub checked_argument_count: usize,
}

/// An instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum InstData {
    Constant {
        value: Constant,
    },
    Parameter {
        index: usize,
    },
    /// Read a local variable slot. Only present before SSA construction.
    LoadLocal {
        slot: usize,
    },
    /// Write a local variable slot. Only present before SSA construction.
    StoreLocal {
        slot: usize,
        args: [Inst; 1],
    },
    PushArgument {
        args: [Inst; 1],
    },
    Phi {
        slot: Option<usize>,
        args: Vec<Inst>,
        alive: bool,
        representation: Representation,
    },
    InstanceCall(Box<InstanceCall>),
    /// A call that dispatches on a small set of receiver classes.
    PolymorphicInstanceCall {
        call: Box<InstanceCall>,
        ic: Arc<IcData>,
        with_checks: bool,
    },
    StaticCall {
        function: FunctionId,
        arguments: Vec<Inst>,
        /// The class of the result if the callee is a known constructor.
        result_cid: ClassId,
    },
    AllocateObject {
        class_id: ClassId,
        arguments: Vec<Inst>,
    },
    /// Allocate a fixed-length array holding the pushed arguments.
    CreateArray {
        arguments: Vec<Inst>,
    },
    Unary {
        opcode: Opcode,
        args: [Inst; 1],
    },
    Binary {
        opcode: Opcode,
        args: [Inst; 2],
    },
    BinaryOp {
        opcode: Opcode,
        op: Token,
        args: [Inst; 2],
        /// Whether the result may leave the small integer range.
        overflow: bool,
    },
    UnaryOp {
        opcode: Opcode,
        op: Token,
        args: [Inst; 1],
    },
    CheckClass {
        checks: Arc<IcData>,
        args: [Inst; 1],
    },
    CheckArrayBound {
        array_cid: ClassId,
        args: [Inst; 2],
    },
    LoadField {
        offset: usize,
        result_cid: ClassId,
        recognized: RecognizedMethod,
        immutable: bool,
        args: [Inst; 1],
    },
    StoreField {
        offset: usize,
        needs_barrier: bool,
        args: [Inst; 2],
    },
    LoadIndexed {
        class_id: ClassId,
        args: [Inst; 2],
    },
    StoreIndexed {
        class_id: ClassId,
        needs_barrier: bool,
        args: [Inst; 3],
    },
    Compare(Comparison),
    InstanceOf {
        ty: ClassId,
        negate: bool,
        args: [Inst; 1],
    },
    AssertAssignable {
        ty: ClassId,
        args: [Inst; 1],
    },
    InvokeMathCFunction {
        function: RecognizedMethod,
        args: Vec<Inst>,
    },
    /// A value restricted to a range by a dominating check or branch. The
    /// optional second input is the instruction the restriction depends on.
    Constraint {
        range: Range,
        args: Vec<Inst>,
    },
    Goto {
        target: Block,
    },
    Branch {
        comparison: Comparison,
        targets: [Block; 2],
    },
}

impl InstData {
    /// Create a unary instruction.
    pub fn unary(opcode: Opcode, arg: Inst) -> Self {
        InstData::Unary {
            opcode,
            args: [arg],
        }
    }

    /// Create a binary small integer operation.
    pub fn binary_smi_op(op: Token, left: Inst, right: Inst) -> Self {
        InstData::BinaryOp {
            opcode: Opcode::BinarySmiOp,
            op,
            args: [left, right],
            overflow: true,
        }
    }

    /// Create a binary operation of the given kind.
    pub fn binary_op(opcode: Opcode, op: Token, left: Inst, right: Inst) -> Self {
        InstData::BinaryOp {
            opcode,
            op,
            args: [left, right],
            overflow: true,
        }
    }

    /// The opcode of the instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            InstData::Constant { .. } => Opcode::Constant,
            InstData::Parameter { .. } => Opcode::Parameter,
            InstData::LoadLocal { .. } => Opcode::LoadLocal,
            InstData::StoreLocal { .. } => Opcode::StoreLocal,
            InstData::PushArgument { .. } => Opcode::PushArgument,
            InstData::Phi { .. } => Opcode::Phi,
            InstData::InstanceCall(..) => Opcode::InstanceCall,
            InstData::PolymorphicInstanceCall { .. } => Opcode::PolymorphicInstanceCall,
            InstData::StaticCall { .. } => Opcode::StaticCall,
            InstData::AllocateObject { .. } => Opcode::AllocateObject,
            InstData::CreateArray { .. } => Opcode::CreateArray,
            InstData::Unary { opcode, .. } => *opcode,
            InstData::Binary { opcode, .. } => *opcode,
            InstData::BinaryOp { opcode, .. } => *opcode,
            InstData::UnaryOp { opcode, .. } => *opcode,
            InstData::CheckClass { .. } => Opcode::CheckClass,
            InstData::CheckArrayBound { .. } => Opcode::CheckArrayBound,
            InstData::LoadField { .. } => Opcode::LoadField,
            InstData::StoreField { .. } => Opcode::StoreField,
            InstData::LoadIndexed { .. } => Opcode::LoadIndexed,
            InstData::StoreIndexed { .. } => Opcode::StoreIndexed,
            InstData::Compare(c) => c.opcode(),
            InstData::InstanceOf { .. } => Opcode::InstanceOf,
            InstData::AssertAssignable { .. } => Opcode::AssertAssignable,
            InstData::InvokeMathCFunction { .. } => Opcode::InvokeMathCFunction,
            InstData::Constraint { .. } => Opcode::Constraint,
            InstData::Goto { .. } => Opcode::Goto,
            InstData::Branch { .. } => Opcode::Branch,
        }
    }

    /// The value inputs of the instruction.
    pub fn args(&self) -> &[Inst] {
        match self {
            InstData::StoreLocal { args, .. }
            | InstData::PushArgument { args }
            | InstData::Unary { args, .. }
            | InstData::UnaryOp { args, .. }
            | InstData::CheckClass { args, .. }
            | InstData::LoadField { args, .. }
            | InstData::InstanceOf { args, .. }
            | InstData::AssertAssignable { args, .. } => &args[..],
            InstData::Binary { args, .. }
            | InstData::BinaryOp { args, .. }
            | InstData::CheckArrayBound { args, .. }
            | InstData::StoreField { args, .. }
            | InstData::LoadIndexed { args, .. } => &args[..],
            InstData::StoreIndexed { args, .. } => &args[..],
            InstData::Phi { args, .. }
            | InstData::InvokeMathCFunction { args, .. }
            | InstData::Constraint { args, .. } => &args[..],
            InstData::Compare(c) => &c.args[..],
            InstData::Branch { comparison, .. } => &comparison.args[..],
            InstData::Constant { .. }
            | InstData::Parameter { .. }
            | InstData::LoadLocal { .. }
            | InstData::InstanceCall(..)
            | InstData::PolymorphicInstanceCall { .. }
            | InstData::StaticCall { .. }
            | InstData::AllocateObject { .. }
            | InstData::CreateArray { .. }
            | InstData::Goto { .. } => &[],
        }
    }

    /// Mutable access to the value inputs of the instruction.
    pub fn args_mut(&mut self) -> &mut [Inst] {
        match self {
            InstData::StoreLocal { args, .. }
            | InstData::PushArgument { args }
            | InstData::Unary { args, .. }
            | InstData::UnaryOp { args, .. }
            | InstData::CheckClass { args, .. }
            | InstData::LoadField { args, .. }
            | InstData::InstanceOf { args, .. }
            | InstData::AssertAssignable { args, .. } => &mut args[..],
            InstData::Binary { args, .. }
            | InstData::BinaryOp { args, .. }
            | InstData::CheckArrayBound { args, .. }
            | InstData::StoreField { args, .. }
            | InstData::LoadIndexed { args, .. } => &mut args[..],
            InstData::StoreIndexed { args, .. } => &mut args[..],
            InstData::Phi { args, .. }
            | InstData::InvokeMathCFunction { args, .. }
            | InstData::Constraint { args, .. } => &mut args[..],
            InstData::Compare(c) => &mut c.args[..],
            InstData::Branch { comparison, .. } => &mut comparison.args[..],
            _ => &mut [],
        }
    }

    /// The pushed arguments of a call-like instruction.
    ///
    /// These are `PushArgument` instructions rather than value inputs.
    pub fn arguments(&self) -> &[Inst] {
        match self {
            InstData::InstanceCall(call) => &call.arguments,
            InstData::PolymorphicInstanceCall { call, .. } => &call.arguments,
            InstData::StaticCall { arguments, .. }
            | InstData::AllocateObject { arguments, .. }
            | InstData::CreateArray { arguments } => arguments,
            _ => &[],
        }
    }

    /// The number of expression stack entries the instruction consumes in
    /// addition to its value inputs.
    pub fn argument_count(&self) -> usize {
        self.arguments().len()
    }

    /// The control flow successors of a block terminator.
    pub fn blocks(&self) -> &[Block] {
        match self {
            InstData::Goto { target } => std::slice::from_ref(target),
            InstData::Branch { targets, .. } => &targets[..],
            _ => &[],
        }
    }

    /// Mutable access to the control flow successors.
    pub fn blocks_mut(&mut self) -> &mut [Block] {
        match self {
            InstData::Goto { target } => std::slice::from_mut(target),
            InstData::Branch { targets, .. } => &mut targets[..],
            _ => &mut [],
        }
    }

    /// The comparison of a compare or branch instruction.
    pub fn comparison(&self) -> Option<&Comparison> {
        match self {
            InstData::Compare(c) => Some(c),
            InstData::Branch { comparison, .. } => Some(comparison),
            _ => None,
        }
    }

    /// Mutable access to the comparison of a compare or branch instruction.
    pub fn comparison_mut(&mut self) -> Option<&mut Comparison> {
        match self {
            InstData::Compare(c) => Some(c),
            InstData::Branch { comparison, .. } => Some(comparison),
            _ => None,
        }
    }

    /// The constant value of a constant instruction.
    pub fn constant(&self) -> Option<&Constant> {
        match self {
            InstData::Constant { value } => Some(value),
            _ => None,
        }
    }

    /// Check whether the instruction ends a block.
    pub fn is_terminator(&self) -> bool {
        match self.opcode() {
            Opcode::Goto | Opcode::Branch | Opcode::Return | Opcode::Throw => true,
            _ => false,
        }
    }

    /// Check whether the instruction produces a value.
    pub fn is_definition(&self) -> bool {
        match self.opcode() {
            Opcode::CheckSmi
            | Opcode::CheckClass
            | Opcode::CheckEitherNonSmi
            | Opcode::CheckArrayBound
            | Opcode::Goto
            | Opcode::Branch
            | Opcode::Return
            | Opcode::Throw => false,
            _ => true,
        }
    }

    /// Check whether this is a type assertion that must stay in place.
    pub fn is_type_assertion(&self) -> bool {
        match self.opcode() {
            Opcode::AssertAssignable | Opcode::AssertBoolean => true,
            _ => false,
        }
    }

    /// Check whether the instruction may fail a speculation at runtime and
    /// therefore needs a deoptimization environment.
    pub fn can_deoptimize(&self) -> bool {
        match self {
            InstData::InstanceCall(..)
            | InstData::PolymorphicInstanceCall { .. }
            | InstData::StaticCall { .. }
            | InstData::CheckClass { .. }
            | InstData::CheckArrayBound { .. }
            | InstData::InstanceOf { .. }
            | InstData::AssertAssignable { .. } => true,
            InstData::Unary { opcode, .. } => match opcode {
                Opcode::CheckSmi
                | Opcode::UnboxDouble
                | Opcode::UnboxInteger
                | Opcode::DoubleToSmi
                | Opcode::DoubleToInteger
                | Opcode::AssertBoolean
                | Opcode::Throw => true,
                _ => false,
            },
            InstData::Binary { .. } => true,
            InstData::BinaryOp {
                opcode, op, overflow, ..
            } => match (opcode, op) {
                (Opcode::BinaryDoubleOp, _) => false,
                (_, Token::BitAnd) | (_, Token::BitOr) | (_, Token::BitXor) => false,
                (Opcode::BinarySmiOp, Token::Add)
                | (Opcode::BinarySmiOp, Token::Sub)
                | (Opcode::BinarySmiOp, Token::Mul) => *overflow,
                _ => true,
            },
            InstData::UnaryOp { op, .. } => *op == Token::Negate,
            InstData::Compare(c) => c.is_generic(),
            InstData::Branch { comparison, .. } => comparison.is_generic(),
            _ => false,
        }
    }

    /// Check whether the instruction may write memory or call out.
    pub fn has_side_effect(&self) -> bool {
        match self {
            InstData::InstanceCall(..)
            | InstData::PolymorphicInstanceCall { .. }
            | InstData::StaticCall { .. }
            | InstData::StoreLocal { .. }
            | InstData::StoreField { .. }
            | InstData::StoreIndexed { .. } => true,
            InstData::Unary { opcode, .. } => *opcode == Opcode::Throw,
            InstData::Compare(c) => c.is_generic(),
            InstData::Branch { comparison, .. } => comparison.is_generic(),
            _ => false,
        }
    }

    /// Check whether the result of the instruction may change when memory is
    /// written, or whether the instruction must otherwise stay where it is.
    ///
    /// Instructions for which this returns false are pure functions of their
    /// inputs and may be value numbered and moved.
    pub fn affected_by_side_effect(&self) -> bool {
        match self {
            InstData::Constant { .. }
            | InstData::Binary { .. }
            | InstData::BinaryOp { .. }
            | InstData::UnaryOp { .. }
            | InstData::CheckArrayBound { .. }
            | InstData::InstanceOf { .. }
            | InstData::AssertAssignable { .. }
            | InstData::InvokeMathCFunction { .. } => false,
            InstData::Unary { opcode, .. } => match opcode {
                Opcode::Return | Opcode::Throw => true,
                _ => false,
            },
            // String class ids change when strings are externalized.
            InstData::CheckClass { checks, .. } => {
                checks.has_receiver_class_id(ClassId::ONE_BYTE_STRING)
                    || checks.has_receiver_class_id(ClassId::TWO_BYTE_STRING)
            }
            InstData::LoadField { immutable, .. } => !immutable,
            InstData::Compare(c) => c.is_generic(),
            _ => true,
        }
    }

    /// The class of the result as far as the instruction itself determines it.
    pub fn result_cid(&self) -> ClassId {
        match self {
            InstData::Constant { value } => value.class_id(),
            InstData::BinaryOp { opcode, .. } => match opcode {
                Opcode::BinarySmiOp => ClassId::SMI,
                Opcode::BinaryDoubleOp => ClassId::DOUBLE,
                _ => ClassId::DYNAMIC,
            },
            InstData::UnaryOp { opcode, .. } => match opcode {
                Opcode::UnarySmiOp => ClassId::SMI,
                _ => ClassId::DYNAMIC,
            },
            InstData::Unary { opcode, .. } => match opcode {
                Opcode::BoxDouble
                | Opcode::UnboxDouble
                | Opcode::MathSqrt
                | Opcode::SmiToDouble
                | Opcode::DoubleTruncate
                | Opcode::DoubleRound
                | Opcode::DoubleFloor
                | Opcode::DoubleCeil => ClassId::DOUBLE,
                Opcode::UnboxInteger => ClassId::MINT,
                Opcode::DoubleToSmi => ClassId::SMI,
                Opcode::BooleanNegate | Opcode::AssertBoolean => ClassId::BOOL,
                Opcode::StringFromCharCode => ClassId::ONE_BYTE_STRING,
                _ => ClassId::DYNAMIC,
            },
            InstData::InvokeMathCFunction { .. } => ClassId::DOUBLE,
            InstData::Compare(..) | InstData::InstanceOf { .. } => ClassId::BOOL,
            InstData::LoadField { result_cid, .. } => *result_cid,
            InstData::LoadIndexed { class_id, .. } => element_cid(*class_id),
            InstData::StaticCall { result_cid, .. } => *result_cid,
            InstData::AllocateObject { class_id, .. } => *class_id,
            InstData::CreateArray { .. } => ClassId::ARRAY,
            InstData::Constraint { .. } => ClassId::SMI,
            _ => ClassId::DYNAMIC,
        }
    }

    /// The representation of the value the instruction produces.
    pub fn representation(&self) -> Representation {
        match self {
            InstData::Phi { representation, .. } => *representation,
            InstData::BinaryOp { opcode, .. } => match opcode {
                Opcode::BinaryDoubleOp => Representation::UnboxedDouble,
                Opcode::BinaryMintOp | Opcode::ShiftMintOp => Representation::UnboxedMint,
                _ => Representation::Tagged,
            },
            InstData::UnaryOp { opcode, .. } => match opcode {
                Opcode::UnaryMintOp => Representation::UnboxedMint,
                _ => Representation::Tagged,
            },
            InstData::Unary { opcode, .. } => match opcode {
                Opcode::UnboxDouble
                | Opcode::MathSqrt
                | Opcode::SmiToDouble
                | Opcode::DoubleTruncate
                | Opcode::DoubleRound
                | Opcode::DoubleFloor
                | Opcode::DoubleCeil => Representation::UnboxedDouble,
                Opcode::UnboxInteger => Representation::UnboxedMint,
                _ => Representation::Tagged,
            },
            InstData::InvokeMathCFunction { .. } => Representation::UnboxedDouble,
            _ => Representation::Tagged,
        }
    }

    /// The representation the instruction expects for one of its inputs.
    pub fn required_input_representation(&self, index: usize) -> Representation {
        match self {
            InstData::Phi { representation, .. } => *representation,
            InstData::BinaryOp { opcode, .. } => match opcode {
                Opcode::BinaryDoubleOp => Representation::UnboxedDouble,
                Opcode::BinaryMintOp => Representation::UnboxedMint,
                Opcode::ShiftMintOp if index == 0 => Representation::UnboxedMint,
                _ => Representation::Tagged,
            },
            InstData::UnaryOp { opcode, .. } => match opcode {
                Opcode::UnaryMintOp => Representation::UnboxedMint,
                _ => Representation::Tagged,
            },
            InstData::Unary { opcode, .. } => match opcode {
                Opcode::BoxDouble
                | Opcode::MathSqrt
                | Opcode::DoubleToSmi
                | Opcode::DoubleToInteger
                | Opcode::DoubleTruncate
                | Opcode::DoubleRound
                | Opcode::DoubleFloor
                | Opcode::DoubleCeil => Representation::UnboxedDouble,
                Opcode::BoxInteger => Representation::UnboxedMint,
                _ => Representation::Tagged,
            },
            InstData::InvokeMathCFunction { .. } => Representation::UnboxedDouble,
            InstData::Compare(c) => c.operand_representation(),
            InstData::Branch { comparison, .. } => comparison.operand_representation(),
            _ => Representation::Tagged,
        }
    }

    /// The structural identity of the instruction used for value numbering.
    ///
    /// Two instructions with equal keys compute the same value, provided
    /// neither is affected by side effects.
    pub fn value_number_key(&self) -> ValueNumberKey {
        let attrs = match self {
            InstData::Constant { value } => KeyAttrs::Constant(format!("{:?}", value)),
            InstData::BinaryOp { op, overflow, .. } => KeyAttrs::Op(*op, *overflow),
            InstData::UnaryOp { op, .. } => KeyAttrs::Op(*op, false),
            InstData::CheckClass { checks, .. } => {
                KeyAttrs::Classes(checks.checks().map(|c| c.class_ids[0]).collect())
            }
            InstData::CheckArrayBound { array_cid, .. } => KeyAttrs::Class(*array_cid),
            InstData::LoadField { offset, .. } => KeyAttrs::Offset(*offset),
            InstData::LoadIndexed { class_id, .. } => KeyAttrs::Class(*class_id),
            InstData::Compare(c) => KeyAttrs::Compare(c.op, c.operands_cid),
            InstData::InstanceOf { ty, negate, .. } => KeyAttrs::Type(*ty, *negate),
            InstData::AssertAssignable { ty, .. } => KeyAttrs::Type(*ty, false),
            InstData::InvokeMathCFunction { function, .. } => KeyAttrs::Recognized(*function),
            _ => KeyAttrs::None,
        };
        ValueNumberKey {
            opcode: self.opcode(),
            args: self.args().to_vec(),
            attrs,
        }
    }
}

/// The class of elements loaded from an array-like object.
pub fn element_cid(array_cid: ClassId) -> ClassId {
    match array_cid {
        ClassId::FLOAT32_ARRAY | ClassId::FLOAT64_ARRAY => ClassId::DOUBLE,
        ClassId::INT8_ARRAY
        | ClassId::UINT8_ARRAY
        | ClassId::UINT8_CLAMPED_ARRAY
        | ClassId::EXTERNAL_UINT8_ARRAY
        | ClassId::INT16_ARRAY
        | ClassId::UINT16_ARRAY
        | ClassId::ONE_BYTE_STRING
        | ClassId::TWO_BYTE_STRING => ClassId::SMI,
        _ => ClassId::DYNAMIC,
    }
}

/// The structural identity of an instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueNumberKey {
    opcode: Opcode,
    args: Vec<Inst>,
    attrs: KeyAttrs,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum KeyAttrs {
    None,
    Constant(String),
    Op(Token, bool),
    Classes(Vec<ClassId>),
    Class(ClassId),
    Offset(usize),
    Compare(Token, ClassId),
    Type(ClassId, bool),
    Recognized(RecognizedMethod),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableKey;

    #[test]
    fn smi_add_key_includes_operator() {
        let a = Inst::new(1);
        let b = Inst::new(2);
        let add = InstData::binary_smi_op(Token::Add, a, b);
        let sub = InstData::binary_smi_op(Token::Sub, a, b);
        assert_eq!(add.value_number_key(), add.clone().value_number_key());
        assert_ne!(add.value_number_key(), sub.value_number_key());
        assert!(!add.affected_by_side_effect());
        assert!(add.can_deoptimize());
        assert_eq!(add.result_cid(), ClassId::SMI);
    }

    #[test]
    fn field_loads_depend_on_mutability() {
        let obj = Inst::new(0);
        let load = |immutable| InstData::LoadField {
            offset: 16,
            result_cid: ClassId::DYNAMIC,
            recognized: RecognizedMethod::Unknown,
            immutable,
            args: [obj],
        };
        assert!(load(false).affected_by_side_effect());
        assert!(!load(true).affected_by_side_effect());
        assert!(!load(false).has_side_effect());
    }

    #[test]
    fn double_ops_take_unboxed_inputs() {
        let a = Inst::new(1);
        let op = InstData::binary_op(Opcode::BinaryDoubleOp, Token::Mul, a, a);
        assert_eq!(op.representation(), Representation::UnboxedDouble);
        assert_eq!(op.required_input_representation(1), Representation::UnboxedDouble);
        let shift = InstData::binary_op(Opcode::ShiftMintOp, Token::Shl, a, a);
        assert_eq!(shift.required_input_representation(0), Representation::UnboxedMint);
        assert_eq!(shift.required_input_representation(1), Representation::Tagged);
    }
}
