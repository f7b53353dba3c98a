// Copyright (c) 2017-2020 Fabian Schuiki

//! Specialization of calls using type feedback.
//!
//! Instance calls carry the inline cache of the unoptimized code. Where the
//! cache shows a small set of receiver classes, the call is replaced by a
//! typed instruction guarded by class checks, which deoptimize if a different
//! class shows up at runtime.

use crate::ir::{
    prelude::*, CompareKind, DeoptReasons, FunctionKind, RecognizedMethod, ARRAY_LENGTH_OFFSET,
    GROWABLE_ARRAY_DATA_OFFSET, STRING_LENGTH_OFFSET,
};
use crate::opt::prelude::*;
use std::sync::Arc;

/// Call Specialization
///
/// Replaces instance calls, static calls of recognized methods, and generic
/// comparisons by specialized instructions where the type feedback allows.
pub struct Specialize;

impl Pass for Specialize {
    fn run_on_inst(ctx: &PassContext, inst: Inst, graph: &mut FlowGraph) -> bool {
        match graph.opcode(inst) {
            Opcode::InstanceCall => visit_instance_call(ctx, graph, inst),
            Opcode::StaticCall => visit_static_call(ctx, graph, inst),
            Opcode::EqualityCompare
            | Opcode::RelationalOp
            | Opcode::StrictCompare
            | Opcode::Branch => visit_comparison(ctx, graph, inst),
            _ => false,
        }
    }
}

/// Class Id Application
///
/// Revisits calls whose receiver class became known through type
/// propagation. Calls that were never executed get a synthesized inline cache
/// and are specialized again; polymorphic calls with a known receiver drop
/// their dispatch checks.
pub struct ApplyClassIds;

impl Pass for ApplyClassIds {
    fn run_on_inst(ctx: &PassContext, inst: Inst, graph: &mut FlowGraph) -> bool {
        match graph.opcode(inst) {
            Opcode::InstanceCall => {
                if try_create_ic_data(ctx, graph, inst) {
                    visit_instance_call(ctx, graph, inst);
                    true
                } else {
                    false
                }
            }
            Opcode::PolymorphicInstanceCall => specialize_polymorphic_call(graph, inst),
            Opcode::StrictCompare => visit_strict_compare(graph, inst),
            Opcode::Branch => match graph.inst(inst).comparison() {
                Some(c) if c.kind == CompareKind::Strict => visit_strict_compare(graph, inst),
                _ => false,
            },
            _ => false,
        }
    }
}

/// A snapshot of an instance call that does not borrow the graph.
struct CallSite {
    inst: Inst,
    name: Arc<str>,
    token: Token,
    ic: Arc<IcData>,
}

impl CallSite {
    fn new(graph: &FlowGraph, inst: Inst) -> Option<CallSite> {
        match graph.inst(inst) {
            InstData::InstanceCall(call) => Some(CallSite {
                inst,
                name: call.name.clone(),
                token: call.token,
                ic: call.ic.clone()?,
            }),
            _ => None,
        }
    }
}

fn visit_instance_call(ctx: &PassContext, graph: &mut FlowGraph, call: Inst) -> bool {
    let site = match CallSite::new(graph, call) {
        Some(site) if !site.ic.is_empty() => site,
        _ => return false,
    };

    // Type tests always become inline code.
    if site.token == Token::Is || site.token == Token::IsNot {
        return replace_with_instance_of(ctx, graph, &site);
    }

    let unary_checks = site.ic.as_unary_class_checks();
    if unary_checks.number_of_checks() > ctx.config.max_polymorphic_checks
        && instance_call_needs_class_check(ctx, graph, &site)
    {
        trace!("{} is megamorphic, keeping receiver checks only", call);
        if let InstData::InstanceCall(data) = &mut graph[call].data {
            data.ic = Some(Arc::new(unary_checks));
        }
        return true;
    }

    if site.token == Token::AssignIndex && try_replace_with_store_indexed(graph, &site) {
        return true;
    }
    if site.token == Token::Index && try_replace_with_load_indexed(graph, &site) {
        return true;
    }
    if site.token.is_binary_arithmetic() && try_replace_with_binary_op(ctx, graph, &site) {
        return true;
    }
    if (site.token == Token::Negate || site.token == Token::BitNot)
        && try_replace_with_unary_op(ctx, graph, &site)
    {
        return true;
    }
    if site.token == Token::Get && try_inline_instance_getter(ctx, graph, &site) {
        return true;
    }
    if site.token == Token::Set && try_inline_instance_setter(ctx, graph, &site, &unary_checks) {
        return true;
    }
    if try_inline_instance_method(ctx, graph, &site) {
        return true;
    }

    let has_one_target = unary_checks.has_one_target();
    if has_one_target && !instance_call_needs_class_check(ctx, graph, &site) {
        replace_with_polymorphic_call(graph, call, unary_checks, false);
        return true;
    }
    if unary_checks.number_of_checks() <= ctx.config.max_polymorphic_checks {
        let with_checks = if has_one_target {
            add_receiver_check(graph, &site);
            false
        } else {
            true
        };
        replace_with_polymorphic_call(graph, call, unary_checks, with_checks);
        return true;
    }
    false
}

fn replace_with_polymorphic_call(graph: &mut FlowGraph, call: Inst, ic: IcData, with_checks: bool) {
    let data = match graph.inst(call) {
        InstData::InstanceCall(data) => data.clone(),
        _ => return,
    };
    trace!(
        "Replacing {} by polymorphic call over {} ({})",
        call,
        ic,
        if with_checks { "with checks" } else { "no checks" }
    );
    let poly = graph.add_inst(InstData::PolymorphicInstanceCall {
        call: data,
        ic: Arc::new(ic),
        with_checks,
    });
    graph.replace_inst(call, poly);
}

/// Check whether the receiver class must be checked before a call.
///
/// A call on the receiver of the method being compiled needs no check if no
/// subclass of the method's owner overrides the selector.
fn instance_call_needs_class_check(ctx: &PassContext, graph: &FlowGraph, site: &CallSite) -> bool {
    if !ctx.config.use_cha {
        return true;
    }
    let receiver = argument_value(graph, site.inst, 0);
    match (graph.inst(receiver), graph.owner) {
        (InstData::Parameter { index: 0 }, Some(owner)) => {
            ctx.classes.has_override(owner, &site.name)
        }
        _ => true,
    }
}

/// The value pushed as argument `index` of a call.
fn argument_value(graph: &FlowGraph, call: Inst, index: usize) -> Inst {
    let push = graph.inst(call).arguments()[index];
    graph.arg(push, 0)
}

/// Insert a check before a call, deoptimizing to the call's state.
fn insert_check(graph: &mut FlowGraph, call: Inst, data: InstData) -> Inst {
    let check = graph.add_inst(data);
    graph.copy_deopt_target(check, call);
    graph.insert_before(call, check);
    check
}

/// Insert a value computation before a call.
fn insert_value(graph: &mut FlowGraph, call: Inst, data: InstData) -> Inst {
    let def = graph.add_inst(data);
    graph.insert_before(call, def);
    graph.alloc_ssa_index(def);
    def
}

fn add_check_smi(graph: &mut FlowGraph, call: Inst, value: Inst) {
    if graph.cid(value) != ClassId::SMI {
        insert_check(graph, call, InstData::unary(Opcode::CheckSmi, value));
    }
}

/// Insert a check that `value` has one of the classes in `checks`.
fn add_check_class(graph: &mut FlowGraph, call: Inst, value: Inst, checks: IcData) {
    if checks.number_of_checks() == 1 && checks.receiver_class_id_at(0) == ClassId::SMI {
        insert_check(graph, call, InstData::unary(Opcode::CheckSmi, value));
    } else {
        insert_check(
            graph,
            call,
            InstData::CheckClass {
                checks: Arc::new(checks),
                args: [value],
            },
        );
    }
}

fn add_receiver_check(graph: &mut FlowGraph, site: &CallSite) {
    let receiver = argument_value(graph, site.inst, 0);
    add_check_class(graph, site.inst, receiver, site.ic.as_unary_class_checks());
}

/// Replace a call by a new instruction and drop its pushed arguments.
fn replace_call(graph: &mut FlowGraph, call: Inst, data: InstData) -> Inst {
    let pushes = graph.inst(call).arguments().to_vec();
    let new = graph.add_inst(data);
    trace!("Replacing {} by {:?}", call, graph.inst(new).opcode());
    graph.replace_inst(call, new);
    remove_push_arguments(graph, &pushes);
    new
}

fn remove_push_arguments(graph: &mut FlowGraph, pushes: &[Inst]) {
    for &push in pushes {
        let value = graph.arg(push, 0);
        graph.replace_uses_with(push, value);
        graph.remove_inst(push);
    }
}

fn has_only_two_smis(ic: &IcData) -> bool {
    ic.number_of_checks() == 1 && ic.check_at(0).class_ids[..2] == [ClassId::SMI, ClassId::SMI]
}

fn has_two_mint_or_smi(ic: &IcData) -> bool {
    ic.all_checks_within(2, &[ClassId::SMI, ClassId::MINT])
}

fn has_only_one_smi(ic: &IcData) -> bool {
    ic.number_of_checks() == 1 && ic.receiver_class_id_at(0) == ClassId::SMI
}

fn has_only_one_double(ic: &IcData) -> bool {
    ic.number_of_checks() == 1 && ic.receiver_class_id_at(0) == ClassId::DOUBLE
}

/// Check whether both operands were always numbers and at least once a
/// double. Observations with two small integers are handled by the guard
/// the double operation gets.
fn should_specialize_for_double(ic: &IcData) -> bool {
    ic.all_checks_within(2, &[ClassId::SMI, ClassId::DOUBLE])
        && ic
            .checks()
            .any(|c| c.class_ids[..2].contains(&ClassId::DOUBLE))
}

/// Check whether argument `arg` was always a small integer.
fn arg_is_always_smi(ic: &IcData, arg: usize) -> bool {
    arg < ic.num_args_tested
        && !ic.is_empty()
        && ic.checks().all(|c| c.class_ids[arg] == ClassId::SMI)
}

/// The single receiver class of a call, if there is exactly one.
fn receiver_class_id(site: &CallSite) -> Option<ClassId> {
    let unary = site.ic.as_unary_class_checks();
    if unary.number_of_checks() == 1 {
        Some(unary.receiver_class_id_at(0))
    } else {
        None
    }
}

fn try_replace_with_binary_op(ctx: &PassContext, graph: &mut FlowGraph, site: &CallSite) -> bool {
    let ic = &*site.ic;
    if ic.num_args_tested < 2 {
        return false;
    }
    let op = site.token;
    let unboxed_mints = ctx.config.unboxed_mints;
    let operands_type = match op {
        Token::Add | Token::Sub => {
            if has_only_two_smis(ic) {
                if ic.has_deopt_reason(DeoptReasons::BINARY_SMI_OP) {
                    ClassId::MINT
                } else {
                    ClassId::SMI
                }
            } else if has_two_mint_or_smi(ic) && unboxed_mints {
                if ic.has_deopt_reason(DeoptReasons::BINARY_MINT_OP) {
                    return false;
                }
                ClassId::MINT
            } else if should_specialize_for_double(ic) {
                ClassId::DOUBLE
            } else {
                return false;
            }
        }
        Token::Mul => {
            if has_only_two_smis(ic) {
                if ic.has_deopt_reason(DeoptReasons::BINARY_SMI_OP) {
                    return false;
                }
                ClassId::SMI
            } else if should_specialize_for_double(ic) {
                ClassId::DOUBLE
            } else {
                return false;
            }
        }
        Token::Div if should_specialize_for_double(ic) => ClassId::DOUBLE,
        Token::Mod if has_only_two_smis(ic) => ClassId::SMI,
        Token::BitAnd | Token::BitOr | Token::BitXor => {
            if has_only_two_smis(ic) {
                ClassId::SMI
            } else if has_two_mint_or_smi(ic) {
                ClassId::MINT
            } else {
                return false;
            }
        }
        Token::Shl | Token::Shr => {
            if has_only_two_smis(ic) {
                if ic.has_deopt_reason(DeoptReasons::SHIFT_MINT_OP) {
                    return false;
                }
                if ic.has_deopt_reason(DeoptReasons::BINARY_SMI_OP) {
                    ClassId::MINT
                } else {
                    ClassId::SMI
                }
            } else if has_two_mint_or_smi(ic)
                && has_only_one_smi(&ic.as_unary_class_checks_for_argument(1))
            {
                if ic.has_deopt_reason(DeoptReasons::SHIFT_MINT_OP) {
                    return false;
                }
                ClassId::MINT
            } else {
                return false;
            }
        }
        Token::TruncDiv if has_only_two_smis(ic) => {
            if ic.has_deopt_reason(DeoptReasons::BINARY_SMI_OP) {
                return false;
            }
            ClassId::SMI
        }
        _ => return false,
    };

    let call = site.inst;
    let mut left = argument_value(graph, call, 0);
    let mut right = argument_value(graph, call, 1);
    match operands_type {
        ClassId::DOUBLE => {
            insert_check(
                graph,
                call,
                InstData::Binary {
                    opcode: Opcode::CheckEitherNonSmi,
                    args: [left, right],
                },
            );
            replace_call(
                graph,
                call,
                InstData::binary_op(Opcode::BinaryDoubleOp, op, left, right),
            );
        }
        ClassId::MINT => {
            if !unboxed_mints {
                return false;
            }
            let opcode = match op {
                Token::Shl | Token::Shr => Opcode::ShiftMintOp,
                _ => Opcode::BinaryMintOp,
            };
            replace_call(graph, call, InstData::binary_op(opcode, op, left, right));
        }
        _ if op == Token::Mod => {
            let value = match graph.smi_constant_of(right) {
                Some(v) if v > 0 && (v & (v - 1)) == 0 => v,
                _ => return false,
            };
            insert_check(graph, call, InstData::unary(Opcode::CheckSmi, left));
            let mask = graph.get_constant(Constant::Smi(value - 1));
            replace_call(graph, call, InstData::binary_smi_op(Token::BitAnd, left, mask));
        }
        _ => {
            add_check_smi(graph, call, left);
            add_check_smi(graph, call, right);
            if graph.constant_of(left).is_some() && (op == Token::Add || op == Token::Mul) {
                std::mem::swap(&mut left, &mut right);
            }
            replace_call(graph, call, InstData::binary_smi_op(op, left, right));
        }
    }
    true
}

fn try_replace_with_unary_op(ctx: &PassContext, graph: &mut FlowGraph, site: &CallSite) -> bool {
    let call = site.inst;
    let op = site.token;
    let input = argument_value(graph, call, 0);
    let ic = &*site.ic;
    let data = if has_only_one_smi(ic) {
        insert_check(graph, call, InstData::unary(Opcode::CheckSmi, input));
        InstData::UnaryOp {
            opcode: Opcode::UnarySmiOp,
            op,
            args: [input],
        }
    } else if op == Token::BitNot
        && ic.all_checks_within(1, &[ClassId::SMI, ClassId::MINT])
        && ctx.config.unboxed_mints
    {
        InstData::UnaryOp {
            opcode: Opcode::UnaryMintOp,
            op,
            args: [input],
        }
    } else if op == Token::Negate && has_only_one_double(ic) {
        add_receiver_check(graph, site);
        let minus_one = graph.get_constant(Constant::Double(-1.0));
        InstData::binary_op(Opcode::BinaryDoubleOp, Token::Mul, input, minus_one)
    } else {
        return false;
    };
    replace_call(graph, call, data);
    true
}

/// Insert the receiver check, index check, and bounds check of an indexed
/// access. Returns the array and class to access, which differ from the
/// receiver for growable arrays.
fn prepare_indexed_op(graph: &mut FlowGraph, site: &CallSite, class_id: ClassId) -> (Inst, ClassId) {
    let call = site.inst;
    let array = argument_value(graph, call, 0);
    let index = argument_value(graph, call, 1);
    add_check_class(graph, call, array, site.ic.as_unary_class_checks());
    insert_check(graph, call, InstData::unary(Opcode::CheckSmi, index));

    let skip_check = match (graph.constant_of(array), graph.smi_constant_of(index)) {
        (Some(Constant::Array(elements)), Some(i)) => i >= 0 && (i as usize) < elements.len(),
        _ => false,
    };
    if !skip_check {
        insert_check(
            graph,
            call,
            InstData::CheckArrayBound {
                array_cid: class_id,
                args: [array, index],
            },
        );
    }

    if class_id == ClassId::GROWABLE_ARRAY {
        let data = insert_value(
            graph,
            call,
            InstData::LoadField {
                offset: GROWABLE_ARRAY_DATA_OFFSET,
                result_cid: ClassId::ARRAY,
                recognized: RecognizedMethod::Unknown,
                immutable: false,
                args: [array],
            },
        );
        (data, ClassId::ARRAY)
    } else {
        (array, class_id)
    }
}

fn try_replace_with_load_indexed(graph: &mut FlowGraph, site: &CallSite) -> bool {
    let class_id = match receiver_class_id(site) {
        Some(cid) => cid,
        None => return false,
    };
    match class_id {
        ClassId::ARRAY | ClassId::IMMUTABLE_ARRAY | ClassId::GROWABLE_ARRAY => (),
        c if c.is_typed_data() => (),
        _ => return false,
    }
    let index = argument_value(graph, site.inst, 1);
    let (array, array_cid) = prepare_indexed_op(graph, site, class_id);
    replace_call(
        graph,
        site.inst,
        InstData::LoadIndexed {
            class_id: array_cid,
            args: [array, index],
        },
    );
    true
}

fn try_replace_with_store_indexed(graph: &mut FlowGraph, site: &CallSite) -> bool {
    let class_id = match receiver_class_id(site) {
        Some(cid) => cid,
        None => return false,
    };
    let ic = &*site.ic;
    let value_check = match class_id {
        ClassId::ARRAY | ClassId::GROWABLE_ARRAY => {
            if arg_is_always_smi(ic, 2) {
                Some(ic.as_unary_class_checks_for_argument(2))
            } else {
                None
            }
        }
        ClassId::INT8_ARRAY
        | ClassId::UINT8_ARRAY
        | ClassId::UINT8_CLAMPED_ARRAY
        | ClassId::INT16_ARRAY
        | ClassId::UINT16_ARRAY
        | ClassId::FLOAT32_ARRAY
        | ClassId::FLOAT64_ARRAY => {
            if ic.num_args_tested <= 2 {
                return false;
            }
            let expected = if class_id == ClassId::FLOAT32_ARRAY || class_id == ClassId::FLOAT64_ARRAY {
                ClassId::DOUBLE
            } else {
                ClassId::SMI
            };
            let checks = ic.as_unary_class_checks_for_argument(2);
            if checks.number_of_checks() != 1 || checks.receiver_class_id_at(0) != expected {
                return false;
            }
            Some(checks)
        }
        _ => return false,
    };

    let call = site.inst;
    let index = argument_value(graph, call, 1);
    let value = argument_value(graph, call, 2);
    let (array, array_cid) = prepare_indexed_op(graph, site, class_id);
    let needs_barrier = value_check.is_none();
    if let Some(checks) = value_check {
        add_check_class(graph, call, value, checks);
    }
    replace_call(
        graph,
        call,
        InstData::StoreIndexed {
            class_id: array_cid,
            needs_barrier,
            args: [array, index, value],
        },
    );
    true
}

fn try_inline_instance_getter(ctx: &PassContext, graph: &mut FlowGraph, site: &CallSite) -> bool {
    let ic = &*site.ic;
    let target = ctx.classes.function(ic.target_at(0));
    if let FunctionKind::ImplicitGetter(field) = &target.kind {
        if !ic.has_one_target() {
            return false;
        }
        if instance_call_needs_class_check(ctx, graph, site) {
            add_receiver_check(graph, site);
        }
        let receiver = argument_value(graph, site.inst, 0);
        let load = replace_call(
            graph,
            site.inst,
            InstData::LoadField {
                offset: field.offset,
                result_cid: field.guarded_cid,
                recognized: RecognizedMethod::Unknown,
                immutable: field.is_final,
                args: [receiver],
            },
        );
        // The load cannot deoptimize.
        graph.set_env(load, None);
        return true;
    }

    let recognized = target.recognized;
    let (offset, immutable) = match recognized {
        RecognizedMethod::ObjectArrayLength | RecognizedMethod::ImmutableArrayLength => {
            (ARRAY_LENGTH_OFFSET, true)
        }
        RecognizedMethod::GrowableArrayLength => {
            (crate::ir::GROWABLE_ARRAY_LENGTH_OFFSET, false)
        }
        RecognizedMethod::ByteArrayBaseLength => (crate::ir::TYPED_DATA_LENGTH_OFFSET, true),
        RecognizedMethod::StringBaseLength => (STRING_LENGTH_OFFSET, true),
        RecognizedMethod::GrowableArrayCapacity => {
            return inline_growable_array_capacity(graph, site);
        }
        RecognizedMethod::StringBaseIsEmpty => {
            if !ic.has_one_target() {
                return false;
            }
            return inline_string_is_empty(graph, site);
        }
        _ => return false,
    };
    if !ic.has_one_target() {
        return false;
    }
    add_receiver_check(graph, site);
    let receiver = argument_value(graph, site.inst, 0);
    let load = replace_call(
        graph,
        site.inst,
        InstData::LoadField {
            offset,
            result_cid: ClassId::SMI,
            recognized,
            immutable,
            args: [receiver],
        },
    );
    graph.set_env(load, None);
    true
}

fn inline_growable_array_capacity(graph: &mut FlowGraph, site: &CallSite) -> bool {
    add_receiver_check(graph, site);
    let receiver = argument_value(graph, site.inst, 0);
    let data = insert_value(
        graph,
        site.inst,
        InstData::LoadField {
            offset: GROWABLE_ARRAY_DATA_OFFSET,
            result_cid: ClassId::ARRAY,
            recognized: RecognizedMethod::Unknown,
            immutable: false,
            args: [receiver],
        },
    );
    let load = replace_call(
        graph,
        site.inst,
        InstData::LoadField {
            offset: ARRAY_LENGTH_OFFSET,
            result_cid: ClassId::SMI,
            recognized: RecognizedMethod::ObjectArrayLength,
            immutable: true,
            args: [data],
        },
    );
    graph.set_env(load, None);
    true
}

fn inline_string_is_empty(graph: &mut FlowGraph, site: &CallSite) -> bool {
    add_receiver_check(graph, site);
    let receiver = argument_value(graph, site.inst, 0);
    let length = insert_value(
        graph,
        site.inst,
        InstData::LoadField {
            offset: STRING_LENGTH_OFFSET,
            result_cid: ClassId::SMI,
            recognized: RecognizedMethod::StringBaseLength,
            immutable: true,
            args: [receiver],
        },
    );
    let zero = graph.get_constant(Constant::Smi(0));
    let compare = replace_call(
        graph,
        site.inst,
        InstData::Compare(Comparison::strict(Token::EqStrict, length, zero)),
    );
    graph.set_env(compare, None);
    true
}

fn try_inline_instance_setter(
    ctx: &PassContext,
    graph: &mut FlowGraph,
    site: &CallSite,
    unary_checks: &IcData,
) -> bool {
    if unary_checks.is_empty() || !unary_checks.has_one_target() {
        return false;
    }
    let field = match &ctx.classes.function(unary_checks.target_at(0)).kind {
        FunctionKind::ImplicitSetter(field) => field.clone(),
        _ => return false,
    };
    if instance_call_needs_class_check(ctx, graph, site) {
        add_receiver_check(graph, site);
    }
    let receiver = argument_value(graph, site.inst, 0);
    let value = argument_value(graph, site.inst, 1);
    let needs_barrier = if arg_is_always_smi(&site.ic, 1) {
        insert_check(graph, site.inst, InstData::unary(Opcode::CheckSmi, value));
        false
    } else {
        true
    };
    let store = replace_call(
        graph,
        site.inst,
        InstData::StoreField {
            offset: field.offset,
            needs_barrier,
            args: [receiver, value],
        },
    );
    graph.set_env(store, None);
    true
}

fn try_inline_instance_method(ctx: &PassContext, graph: &mut FlowGraph, site: &CallSite) -> bool {
    let ic = &*site.ic;
    if ic.is_empty() || !ic.has_one_target() {
        return false;
    }
    let receiver_cid = ic.receiver_class_id_at(0);
    let recognized = ctx.classes.function(ic.target_at(0)).recognized;
    let call = site.inst;
    let receiver = argument_value(graph, call, 0);

    match recognized {
        RecognizedMethod::StringBaseCharCodeAt
            if ic.number_of_checks() == 1 && receiver_cid.is_string() =>
        {
            let data = build_string_char_code_at(graph, site, receiver_cid);
            replace_call(graph, call, data);
            true
        }
        RecognizedMethod::StringBaseCharAt
            if ic.number_of_checks() == 1 && receiver_cid == ClassId::ONE_BYTE_STRING =>
        {
            let data = build_string_char_code_at(graph, site, receiver_cid);
            let char_code = insert_value(graph, call, data);
            replace_call(
                graph,
                call,
                InstData::unary(Opcode::StringFromCharCode, char_code),
            );
            true
        }
        RecognizedMethod::IntegerToDouble if receiver_cid == ClassId::SMI => {
            add_receiver_check(graph, site);
            replace_call(graph, call, InstData::unary(Opcode::SmiToDouble, receiver));
            true
        }
        _ if receiver_cid != ClassId::DOUBLE => false,
        RecognizedMethod::DoubleToInteger => {
            add_receiver_check(graph, site);
            let opcode = if ic.has_deopt_reason(DeoptReasons::DOUBLE_TO_SMI) {
                Opcode::DoubleToInteger
            } else {
                Opcode::DoubleToSmi
            };
            replace_call(graph, call, InstData::unary(opcode, receiver));
            true
        }
        RecognizedMethod::DoubleMod | RecognizedMethod::DoublePow => {
            replace_with_math_c_function(graph, site, recognized);
            true
        }
        RecognizedMethod::DoubleTruncate
        | RecognizedMethod::DoubleRound
        | RecognizedMethod::DoubleFloor
        | RecognizedMethod::DoubleCeil => {
            add_receiver_check(graph, site);
            let opcode = match recognized {
                RecognizedMethod::DoubleTruncate => Opcode::DoubleTruncate,
                RecognizedMethod::DoubleRound => Opcode::DoubleRound,
                RecognizedMethod::DoubleFloor => Opcode::DoubleFloor,
                _ => Opcode::DoubleCeil,
            };
            replace_call(graph, call, InstData::unary(opcode, receiver));
            true
        }
        _ => false,
    }
}

fn build_string_char_code_at(graph: &mut FlowGraph, site: &CallSite, cid: ClassId) -> InstData {
    let call = site.inst;
    let string = argument_value(graph, call, 0);
    let index = argument_value(graph, call, 1);
    add_receiver_check(graph, site);
    insert_check(graph, call, InstData::unary(Opcode::CheckSmi, index));
    insert_check(
        graph,
        call,
        InstData::CheckArrayBound {
            array_cid: cid,
            args: [string, index],
        },
    );
    InstData::LoadIndexed {
        class_id: cid,
        args: [string, index],
    }
}

fn replace_with_math_c_function(graph: &mut FlowGraph, site: &CallSite, function: RecognizedMethod) {
    add_receiver_check(graph, site);
    let args = (0..graph.inst(site.inst).argument_count())
        .map(|i| argument_value(graph, site.inst, i))
        .collect();
    replace_call(graph, site.inst, InstData::InvokeMathCFunction { function, args });
}

/// Check whether every receiver class gives the same answer to a type test.
fn instance_of_as_bool(ctx: &PassContext, checks: &IcData, ty: ClassId) -> Option<bool> {
    let mut result = None;
    for check in checks.checks() {
        let cid = check.class_ids[0];
        if cid == ClassId::NULL {
            return None;
        }
        let is_subtype = ctx.classes.is_subtype(cid, ty);
        match result {
            None => result = Some(is_subtype),
            Some(prev) if prev != is_subtype => return None,
            _ => (),
        }
    }
    result
}

fn replace_with_instance_of(ctx: &PassContext, graph: &mut FlowGraph, site: &CallSite) -> bool {
    let call = site.inst;
    if graph.inst(call).argument_count() < 2 {
        return false;
    }
    let value = argument_value(graph, call, 0);
    let ty = match graph.constant_of(argument_value(graph, call, 1)) {
        Some(&Constant::Type(ty)) => ty,
        _ => return false,
    };
    let negate = site.token == Token::IsNot;
    let unary_checks = site.ic.as_unary_class_checks();
    if unary_checks.number_of_checks() <= ctx.config.max_polymorphic_checks {
        if let Some(outcome) = instance_of_as_bool(ctx, &unary_checks, ty) {
            trace!("Type test {} always gives {}", call, outcome != negate);
            add_check_class(graph, call, value, unary_checks);
            let pushes = graph.inst(call).arguments().to_vec();
            let result = graph.get_constant(Constant::Bool(outcome != negate));
            graph.replace_with_existing(call, result);
            remove_push_arguments(graph, &pushes);
            return true;
        }
    }
    replace_call(
        graph,
        call,
        InstData::InstanceOf {
            ty,
            negate,
            args: [value],
        },
    );
    true
}

/// Replace calls of recognized math functions by intrinsics.
fn visit_static_call(ctx: &PassContext, graph: &mut FlowGraph, call: Inst) -> bool {
    let function = match graph.inst(call) {
        InstData::StaticCall { function, .. } => *function,
        _ => return false,
    };
    let recognized = ctx.classes.function(function).recognized;
    let args: Vec<Inst> = (0..graph.inst(call).argument_count())
        .map(|i| argument_value(graph, call, i))
        .collect();
    match recognized {
        RecognizedMethod::MathSqrt if args.len() == 1 => {
            replace_call(graph, call, InstData::unary(Opcode::MathSqrt, args[0]));
            true
        }
        RecognizedMethod::MathSin | RecognizedMethod::MathCos if args.len() == 1 => {
            replace_call(
                graph,
                call,
                InstData::InvokeMathCFunction {
                    function: recognized,
                    args,
                },
            );
            true
        }
        _ => false,
    }
}

/// Specialize a comparison instruction or a branch's embedded comparison in
/// place, inserting checks before `inst`.
fn visit_comparison(ctx: &PassContext, graph: &mut FlowGraph, inst: Inst) -> bool {
    let comparison = match graph.inst(inst).comparison() {
        Some(c) => c.clone(),
        None => return false,
    };
    match comparison.kind {
        CompareKind::Strict => visit_strict_compare(graph, inst),
        CompareKind::Equality => handle_equality_compare(ctx, graph, inst, comparison),
        CompareKind::Relational => handle_relational_op(ctx, graph, inst, comparison),
    }
}

fn set_operands_cid(graph: &mut FlowGraph, inst: Inst, cid: ClassId) {
    if let Some(c) = graph[inst].data.comparison_mut() {
        c.operands_cid = cid;
    }
}

fn handle_relational_op(
    ctx: &PassContext,
    graph: &mut FlowGraph,
    inst: Inst,
    comparison: Comparison,
) -> bool {
    if comparison.operands_cid != ClassId::DYNAMIC {
        return false;
    }
    let ic = match &comparison.ic {
        Some(ic) if !ic.is_empty() && ic.num_args_tested >= 2 => ic.clone(),
        _ => return false,
    };
    let [left, right] = comparison.args;
    let cid = if ic.number_of_checks() == 1 {
        if has_only_two_smis(&ic) {
            insert_check(graph, inst, InstData::unary(Opcode::CheckSmi, left));
            insert_check(graph, inst, InstData::unary(Opcode::CheckSmi, right));
            ClassId::SMI
        } else if should_specialize_for_double(&ic) {
            ClassId::DOUBLE
        } else {
            return false;
        }
    } else if has_two_mint_or_smi(&ic) && ctx.config.unboxed_mints {
        ClassId::MINT
    } else if should_specialize_for_double(&ic) {
        ClassId::DOUBLE
    } else {
        return false;
    };
    trace!("Specializing comparison {} for {}", inst, cid);
    set_operands_cid(graph, inst, cid);
    true
}

fn handle_equality_compare(
    ctx: &PassContext,
    graph: &mut FlowGraph,
    inst: Inst,
    comparison: Comparison,
) -> bool {
    if comparison.operands_cid != ClassId::DYNAMIC {
        return false;
    }
    let [left, right] = comparison.args;
    let is_null = |def: Inst| graph.constant_of(def).map(Constant::is_null).unwrap_or(false);
    if is_null(left) || is_null(right) {
        let op = if comparison.op == Token::Eq {
            Token::EqStrict
        } else {
            Token::NeStrict
        };
        trace!("Turning null comparison {} into a strict compare", inst);
        if let Some(c) = graph[inst].data.comparison_mut() {
            *c = Comparison::strict(op, left, right);
        }
        return true;
    }

    let ic = match &comparison.ic {
        Some(ic) if !ic.is_empty() && ic.num_args_tested >= 2 => ic.clone(),
        _ => return false,
    };
    let mut cid = ClassId::DYNAMIC;
    if ic.number_of_checks() == 1 {
        if has_only_two_smis(&ic) {
            insert_check(graph, inst, InstData::unary(Opcode::CheckSmi, left));
            insert_check(graph, inst, InstData::unary(Opcode::CheckSmi, right));
            cid = ClassId::SMI;
        } else if should_specialize_for_double(&ic) {
            cid = ClassId::DOUBLE;
        } else if has_two_mint_or_smi(&ic) && ctx.config.unboxed_mints {
            cid = ClassId::MINT;
        }
    } else if has_two_mint_or_smi(&ic) && ctx.config.unboxed_mints {
        cid = ClassId::MINT;
    }

    // Small integers mixed with null still allow the small integer
    // comparison, guarded by class checks that admit null.
    let smi_or_null = [ClassId::SMI, ClassId::NULL];
    if cid == ClassId::DYNAMIC && ic.all_checks_within(2, &smi_or_null) {
        add_check_class(graph, inst, left, ic.as_unary_class_checks());
        add_check_class(graph, inst, right, ic.as_unary_class_checks_for_argument(1));
        cid = ClassId::SMI;
    }
    if cid == ClassId::DYNAMIC {
        return false;
    }
    trace!("Specializing equality {} for {}", inst, cid);
    set_operands_cid(graph, inst, cid);
    true
}

fn may_be_boxable_number(cid: ClassId) -> bool {
    cid == ClassId::DYNAMIC || cid.is_boxed_number()
}

/// Drop the number check of a strict comparison if one operand cannot be a
/// boxed number.
fn visit_strict_compare(graph: &mut FlowGraph, inst: Inst) -> bool {
    let [left, right] = match graph.inst(inst).comparison() {
        Some(c) if c.kind == CompareKind::Strict && c.needs_number_check => c.args,
        _ => return false,
    };
    if may_be_boxable_number(graph.cid(left)) && may_be_boxable_number(graph.cid(right)) {
        return false;
    }
    if let Some(c) = graph[inst].data.comparison_mut() {
        c.needs_number_check = false;
    }
    true
}

/// Synthesize an inline cache for a call that was never executed but whose
/// receiver class is known.
fn try_create_ic_data(ctx: &PassContext, graph: &mut FlowGraph, call: Inst) -> bool {
    let (name, checked) = match graph.inst(call) {
        InstData::InstanceCall(data) => match &data.ic {
            Some(ic) if ic.is_empty() => (data.name.clone(), ic.num_args_tested),
            _ => return false,
        },
        _ => return false,
    };
    if checked != 1 {
        return false;
    }
    let receiver_cid = graph.cid(argument_value(graph, call, 0));
    if receiver_cid == ClassId::DYNAMIC || receiver_cid == ClassId::ILLEGAL {
        return false;
    }
    let target = match ctx.classes.resolve_dynamic(receiver_cid, &name) {
        Some(target) => target,
        None => return false,
    };
    let mut ic = IcData::new(name.to_string(), 1);
    ic.add_receiver_check(receiver_cid, target, 1);
    trace!("Synthesized {} for {}", ic, call);
    if let InstData::InstanceCall(data) = &mut graph[call].data {
        data.ic = Some(Arc::new(ic));
    }
    true
}

/// Drop the dispatch checks of a polymorphic call whose receiver class is
/// known.
fn specialize_polymorphic_call(graph: &mut FlowGraph, call: Inst) -> bool {
    let (data, ic) = match graph.inst(call) {
        InstData::PolymorphicInstanceCall {
            call: data,
            ic,
            with_checks: true,
        } => (data.clone(), ic.clone()),
        _ => return false,
    };
    let receiver_cid = graph.cid(argument_value(graph, call, 0));
    if receiver_cid == ClassId::DYNAMIC {
        return false;
    }
    let target = match ic.target_for_receiver(receiver_cid) {
        Some(target) => target,
        None => return false,
    };
    let mut narrowed = IcData::new(ic.target_name.clone(), 1);
    narrowed.add_receiver_check(receiver_cid, target, 1);
    trace!("Receiver of {} is {}, dropping dispatch checks", call, receiver_cid);
    let specialized = graph.add_inst(InstData::PolymorphicInstanceCall {
        call: data,
        ic: Arc::new(narrowed),
        with_checks: false,
    });
    graph.replace_inst(call, specialized);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OptimizerConfig, ir::ClassTable, ssa::compute_ssa};

    fn ctx_with(classes: ClassTable) -> PassContext {
        PassContext::new(OptimizerConfig::default(), Arc::new(classes))
    }

    fn opcodes(graph: &FlowGraph) -> Vec<Opcode> {
        graph.insts(graph.normal_entry()).map(|i| graph.opcode(i)).collect()
    }

    fn find(graph: &FlowGraph, opcode: Opcode) -> Inst {
        graph
            .insts(graph.normal_entry())
            .find(|&i| graph.opcode(i) == opcode)
            .unwrap()
    }

    /// `return a <op> b;` with the given feedback on both operands.
    fn binary(op: Token, classes: &ClassTable, cids: [ClassId; 2]) -> FlowGraph {
        let target = classes.resolve_dynamic(cids[0], op.symbol()).unwrap();
        let mut ic = IcData::new(op.symbol(), 2);
        ic.add_check(cids.to_vec(), target);
        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load_local(0);
        let y = b.load_local(1);
        let sum = b.binary_call(op, x, y, Some(ic));
        b.return_value(sum);
        compute_ssa(&mut graph).unwrap();
        graph
    }

    #[test]
    fn smi_addition_becomes_checked_smi_op() {
        let _ = env_logger::try_init();
        let classes = ClassTable::new();
        let mut graph = binary(Token::Add, &classes, [ClassId::SMI, ClassId::SMI]);
        assert!(Specialize::run_on_graph(&ctx_with(classes), &mut graph));
        assert_eq!(
            opcodes(&graph),
            vec![
                Opcode::CheckSmi,
                Opcode::CheckSmi,
                Opcode::BinarySmiOp,
                Opcode::Return
            ]
        );
        let op = find(&graph, Opcode::BinarySmiOp);
        let params: Vec<_> = graph
            .args(op)
            .iter()
            .map(|&arg| graph.inst(arg).clone())
            .collect();
        assert_eq!(
            params,
            vec![
                InstData::Parameter { index: 0 },
                InstData::Parameter { index: 1 }
            ]
        );
    }

    #[test]
    fn double_feedback_becomes_double_op() {
        let classes = ClassTable::new();
        let mut graph = binary(Token::Mul, &classes, [ClassId::DOUBLE, ClassId::DOUBLE]);
        assert!(Specialize::run_on_graph(&ctx_with(classes), &mut graph));
        assert_eq!(
            opcodes(&graph),
            vec![
                Opcode::CheckEitherNonSmi,
                Opcode::BinaryDoubleOp,
                Opcode::Return
            ]
        );
    }

    #[test]
    fn mint_feedback_stays_call_without_unboxed_mints() {
        let classes = ClassTable::new();
        let mut graph = binary(Token::BitAnd, &classes, [ClassId::MINT, ClassId::SMI]);
        let mut ctx = ctx_with(classes);
        ctx.config.unboxed_mints = false;
        Specialize::run_on_graph(&ctx, &mut graph);
        assert!(!opcodes(&graph).contains(&Opcode::BinaryMintOp));
    }

    #[test]
    fn field_getter_becomes_load() {
        let mut classes = ClassTable::new();
        let point = classes.add_class("Point", None);
        let field = classes.add_field(point, "x", false, ClassId::DYNAMIC);
        let getter = classes.resolve_dynamic(point, "get:x").unwrap();
        let mut ic = IcData::new("get:x", 1);
        ic.add_receiver_check(point, getter, 10);

        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let p = b.load_local(0);
        let x = b.getter_call("x", p, Some(ic));
        b.return_value(x);
        compute_ssa(&mut graph).unwrap();

        assert!(Specialize::run_on_graph(&ctx_with(classes), &mut graph));
        assert_eq!(
            opcodes(&graph),
            vec![Opcode::CheckClass, Opcode::LoadField, Opcode::Return]
        );
        match graph.inst(find(&graph, Opcode::LoadField)) {
            InstData::LoadField {
                offset, immutable, ..
            } => {
                assert_eq!(*offset, field.offset);
                assert!(!immutable);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn array_index_becomes_bounds_checked_load() {
        let classes = ClassTable::new();
        let target = classes.resolve_dynamic(ClassId::ARRAY, "[]").unwrap();
        let mut ic = IcData::new("[]", 2);
        ic.add_check(vec![ClassId::ARRAY, ClassId::SMI], target);

        let mut graph = FlowGraph::new("f", 2, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let a = b.load_local(0);
        let i = b.load_local(1);
        let value = b.instance_call("[]", Token::Index, &[a, i], 2, Some(ic));
        b.return_value(value);
        compute_ssa(&mut graph).unwrap();

        assert!(Specialize::run_on_graph(&ctx_with(classes), &mut graph));
        assert_eq!(
            opcodes(&graph),
            vec![
                Opcode::CheckClass,
                Opcode::CheckSmi,
                Opcode::CheckArrayBound,
                Opcode::LoadIndexed,
                Opcode::Return
            ]
        );
    }

    #[test]
    fn megamorphic_call_is_kept() {
        let mut classes = ClassTable::new();
        let mut ic = IcData::new("foo", 1);
        for n in 0..5 {
            let class = classes.add_class(format!("C{}", n), None);
            let foo = classes.add_method(class, "foo", FunctionKind::Regular, RecognizedMethod::Unknown);
            ic.add_receiver_check(class, foo, 1);
        }

        let mut graph = FlowGraph::new("f", 1, 0);
        let mut b = GraphBuilder::new(&mut graph);
        let o = b.load_local(0);
        let call = b.instance_call("foo", Token::Illegal, &[o], 1, Some(ic));
        b.return_value(call);
        compute_ssa(&mut graph).unwrap();

        Specialize::run_on_graph(&ctx_with(classes), &mut graph);
        assert!(graph.is_inst_inserted(call));
        assert_eq!(graph.opcode(call), Opcode::InstanceCall);
    }
}
