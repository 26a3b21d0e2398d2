// This module implements the AAPCS64 procedure call standard as far as this backend needs
// it: integer and pointer arguments only, no floating point. It provides the CCAssigner
// trait and the Aapcs64Assigner that walks a parameter list handing out x0-x7 and then
// stack slots. A value that needs N words takes N consecutive registers when all of them
// are still free; otherwise it goes to the stack and no later argument may use a register
// again. One-word stack arguments are 8-byte aligned, two-word ones 16-byte aligned, and
// the whole outgoing area is rounded to 16 bytes. Results of up to two words come back in
// x0/x1; wider results are written through the address the caller passes in x8, which does
// not consume an argument register. Variadic arguments are always passed on the stack.
// On top of the assigner sit Signature, which describes the incoming side of the function
// being compiled, and CallLayout, which expands one call site into per-word moves that the
// code generator sequentializes.

//! AAPCS64 argument and result assignment.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, RegBitSet};
use crate::core::types::{align_to, TypeId, TypeRegistry, WORD_SIZE};
use crate::core::value_assignment::{PartLocation, StackSlot, ValueLocation, STACK_ALIGN};
use crate::ssa::{Aux, Func, Op, ValueId};

/// Integer argument registers in assignment order.
pub const ARG_REGS: [AsmReg; 8] = [
    AsmReg::new(0),
    AsmReg::new(1),
    AsmReg::new(2),
    AsmReg::new(3),
    AsmReg::new(4),
    AsmReg::new(5),
    AsmReg::new(6),
    AsmReg::new(7),
];

/// Result registers.
pub const RET_REGS: [AsmReg; 2] = [AsmReg::X0, AsmReg::X1];

/// Register carrying the address of an indirect result.
pub const INDIRECT_RESULT_REG: AsmReg = AsmReg::X8;

/// Fewest and most registers the allocator may be configured with.
pub const MIN_ALLOCATABLE: u8 = 4;
pub const MAX_ALLOCATABLE: u8 = 16;

/// Argument attributes for calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAttribute {
    None,
    /// Indirect result address, passed in `x8`.
    StructRet,
    /// Argument past the declared parameter count.
    Variadic,
}

/// Placement of one argument or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    /// Size of the value in bytes.
    pub size: u32,
    pub align: u32,
    /// Number of consecutive registers (or stack words) needed.
    pub consecutive: u32,
    /// First assigned register, if passed in registers.
    pub reg: Option<AsmReg>,
    /// Offset inside the argument area, if passed on the stack.
    pub stack_off: Option<u32>,
    pub attribute: ArgAttribute,
}

impl CCAssignment {
    pub fn new(size: u32, align: u32) -> Self {
        Self::with_attribute(size, align, ArgAttribute::None)
    }

    pub fn with_attribute(size: u32, align: u32, attribute: ArgAttribute) -> Self {
        Self {
            size,
            align,
            consecutive: size.div_ceil(WORD_SIZE).max(1),
            reg: None,
            stack_off: None,
            attribute,
        }
    }

    /// Assignment for a register value of type `ty`.
    pub fn for_type(types: &TypeRegistry, ty: TypeId, attribute: ArgAttribute) -> Self {
        Self::with_attribute(types.size(ty), types.align(ty), attribute)
    }

    /// Registers holding the value, lowest part first.
    pub fn regs(&self) -> Vec<AsmReg> {
        match self.reg {
            Some(first) => (0..self.consecutive)
                .map(|i| AsmReg::new(first.id() + i as u8))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Where the value is seen from inside the callee (`incoming`) or from
    /// the caller setting up the call.
    pub fn location(&self, incoming: bool) -> Option<ValueLocation> {
        if self.reg.is_some() {
            return ValueLocation::from_regs(&self.regs());
        }
        self.stack_off.map(|off| {
            ValueLocation::Stack(if incoming {
                StackSlot::Incoming(off)
            } else {
                StackSlot::Outgoing(off)
            })
        })
    }

    /// Location of word `part`.
    pub fn part(&self, part: u32, incoming: bool) -> Option<PartLocation> {
        self.location(incoming).map(|loc| loc.part(part))
    }
}

/// Information about a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers available for allocation.
    pub allocatable_regs: RegBitSet,
    /// Registers that must be preserved by the callee.
    pub callee_saved_regs: RegBitSet,
    /// Registers used for argument passing.
    pub arg_regs: RegBitSet,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    fn get_ccinfo(&self) -> &CCInfo;

    /// Assign the next argument.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a result; leaves `reg` empty when it must be returned
    /// indirectly.
    fn assign_ret(&mut self, ret: &mut CCAssignment);

    /// Forget all assignments made so far.
    fn reset(&mut self);

    /// Bytes of stack needed for the arguments assigned so far.
    fn get_stack_size(&self) -> u32;
}

/// AAPCS64 integer-only assigner.
pub struct Aapcs64Assigner {
    cc_info: CCInfo,
    /// Next free argument register index.
    gp_cnt: usize,
    /// Next free stack offset.
    stack: u32,
    /// Result registers handed out so far.
    ret_gp_cnt: usize,
}

impl Default for Aapcs64Assigner {
    fn default() -> Self {
        Self::new(MAX_ALLOCATABLE)
    }
}

impl Aapcs64Assigner {
    /// Assigner whose allocatable set is `x0` through `x{allocatable-1}`.
    pub fn new(allocatable: u8) -> Self {
        let mut arg_regs = RegBitSet::new();
        for reg in ARG_REGS {
            arg_regs.set(reg);
        }
        let mut callee_saved = RegBitSet::new();
        for id in 19..=28 {
            callee_saved.set(AsmReg::new(id));
        }
        let count = allocatable.clamp(MIN_ALLOCATABLE, MAX_ALLOCATABLE);
        Self {
            cc_info: CCInfo {
                allocatable_regs: RegBitSet::first_n(count),
                callee_saved_regs: callee_saved,
                arg_regs,
            },
            gp_cnt: 0,
            stack: 0,
            ret_gp_cnt: 0,
        }
    }

    fn assign_stack(&mut self, arg: &mut CCAssignment) {
        let align = if arg.consecutive >= 2 { STACK_ALIGN } else { WORD_SIZE };
        self.stack = align_to(self.stack, align);
        arg.reg = None;
        arg.stack_off = Some(self.stack);
        self.stack += arg.consecutive * WORD_SIZE;
    }
}

impl CCAssigner for Aapcs64Assigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        match arg.attribute {
            ArgAttribute::StructRet => {
                arg.reg = Some(INDIRECT_RESULT_REG);
                arg.stack_off = None;
            }
            ArgAttribute::Variadic => self.assign_stack(arg),
            ArgAttribute::None => {
                let needed = arg.consecutive as usize;
                if self.gp_cnt + needed <= ARG_REGS.len() {
                    arg.reg = Some(ARG_REGS[self.gp_cnt]);
                    arg.stack_off = None;
                    self.gp_cnt += needed;
                } else {
                    // Once an argument spills to the stack, so do all later ones.
                    self.gp_cnt = ARG_REGS.len();
                    self.assign_stack(arg);
                }
            }
        }
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        let needed = ret.consecutive as usize;
        if self.ret_gp_cnt + needed <= RET_REGS.len() {
            ret.reg = Some(RET_REGS[self.ret_gp_cnt]);
            self.ret_gp_cnt += needed;
        } else {
            ret.reg = None;
        }
        ret.stack_off = None;
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.stack = 0;
        self.ret_gp_cnt = 0;
    }

    fn get_stack_size(&self) -> u32 {
        align_to(self.stack, STACK_ALIGN)
    }
}

fn unsupported(func: &Func, reason: String) -> CompileError {
    CompileError::UnsupportedType {
        func: func.name.clone(),
        reason,
    }
}

/// Register view of a declared parameter or result type: memory aggregates
/// travel as pointers.
fn passed_type(types: &TypeRegistry, ty: TypeId) -> TypeId {
    if types.is_memory_aggregate(ty) {
        TypeId::PTR
    } else {
        ty
    }
}

/// Incoming side of the function being compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<CCAssignment>,
    /// Direct result, if any.
    pub result: Option<CCAssignment>,
    /// The caller passes a result address in `x8`.
    pub indirect_result: bool,
    /// Bytes of incoming stack arguments.
    pub stack_size: u32,
}

impl Signature {
    pub fn of(func: &Func, types: &TypeRegistry) -> CompileResult<Self> {
        let mut cc = Aapcs64Assigner::default();
        let mut params = Vec::with_capacity(func.params.len());
        for (i, &ty) in func.params.iter().enumerate() {
            let ty = passed_type(types, ty);
            if types.parts(ty) == 0 {
                return Err(unsupported(func, format!("parameter {i} of type {}", types.name(ty))));
            }
            let mut arg = CCAssignment::for_type(types, ty, ArgAttribute::None);
            cc.assign_arg(&mut arg);
            params.push(arg);
        }

        let (result, indirect_result) = if func.result == TypeId::VOID {
            (None, false)
        } else if types.is_memory_aggregate(func.result) {
            (None, true)
        } else if types.parts(func.result) == 0 {
            return Err(unsupported(func, format!("result of type {}", types.name(func.result))));
        } else {
            let mut ret = CCAssignment::for_type(types, func.result, ArgAttribute::None);
            cc.assign_ret(&mut ret);
            (Some(ret), false)
        };

        Ok(Self {
            params,
            result,
            indirect_result,
            stack_size: cc.get_stack_size(),
        })
    }

    /// Location of the incoming parameter `index`.
    pub fn param_location(&self, index: usize) -> Option<ValueLocation> {
        self.params.get(index).and_then(|p| p.location(true))
    }

    /// Whether any parameter arrives on the stack.
    pub fn uses_stack(&self) -> bool {
        self.params.iter().any(|p| p.stack_off.is_some())
    }
}

/// One word of one call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallArgPart {
    pub value: ValueId,
    pub part: u32,
    pub dest: PartLocation,
}

/// A call site expanded into per-word argument placements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLayout {
    pub parts: Vec<CallArgPart>,
    /// Outgoing stack bytes, rounded to 16.
    pub stack_size: u32,
    /// Registers the callee returns the result in.
    pub result: Option<ValueLocation>,
}

/// Expand the call value `call` according to AAPCS64.
pub fn expand_call(func: &Func, types: &TypeRegistry, call: ValueId) -> CompileResult<CallLayout> {
    let value = func.value(call);
    let (fixed_args, indirect_result) = match (&value.op, &value.aux) {
        (Op::Call, Aux::Call(info)) => (info.fixed_args as usize, info.indirect_result),
        _ => return Err(unsupported(func, format!("{call} is not a call"))),
    };

    let mut cc = Aapcs64Assigner::default();
    let mut parts = Vec::new();
    for (i, &arg) in func.data_args(call).iter().enumerate() {
        let ty = func.value(arg).ty;
        let words = types.parts(ty);
        if words == 0 {
            return Err(unsupported(func, format!("argument {i} of {call} has type {}", types.name(ty))));
        }
        let attribute = if indirect_result && i == 0 {
            ArgAttribute::StructRet
        } else if i >= fixed_args {
            ArgAttribute::Variadic
        } else {
            ArgAttribute::None
        };
        let mut assignment = CCAssignment::for_type(types, ty, attribute);
        cc.assign_arg(&mut assignment);
        for part in 0..words {
            if let Some(dest) = assignment.part(part, false) {
                parts.push(CallArgPart { value: arg, part, dest });
            }
        }
    }

    let result = if value.has_result() {
        let mut ret = CCAssignment::for_type(types, value.ty, ArgAttribute::None);
        cc.assign_ret(&mut ret);
        match ret.location(false) {
            Some(loc) => Some(loc),
            None => return Err(unsupported(func, format!("{call} returns {} in registers", types.name(value.ty)))),
        }
    } else {
        None
    };

    Ok(CallLayout {
        parts,
        stack_size: cc.get_stack_size(),
        result,
    })
}
