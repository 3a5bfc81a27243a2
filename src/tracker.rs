use std::collections::{BTreeMap, VecDeque};

use crate::cfg::BasicBlock;
use crate::descriptor::parse_method_descriptor;
use crate::ir::{Instruction, InstructionKind, Method};
use crate::opcodes;

/// Flat lattice of tracked operand values: a known string constant or Top.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum TrackedValue {
    Const(String),
    Top,
}

/// Abstract state at a program point. Locals only record known constants;
/// an absent slot is Top. When an opcode with an ambiguous value-level
/// stack effect is seen the stack depth is no longer trusted and every
/// later argument in the affected region resolves as Top.
#[derive(Clone, Debug, Eq, PartialEq)]
struct State {
    locals: BTreeMap<u16, String>,
    stack: Vec<TrackedValue>,
    stack_trusted: bool,
}

impl State {
    fn entry() -> Self {
        Self {
            locals: BTreeMap::new(),
            stack: Vec::new(),
            stack_trusted: true,
        }
    }

    /// Exception handler entry: locals unknown, the thrown value on stack.
    fn handler() -> Self {
        Self {
            locals: BTreeMap::new(),
            stack: vec![TrackedValue::Top],
            stack_trusted: true,
        }
    }

    fn untrusted() -> Self {
        Self {
            locals: BTreeMap::new(),
            stack: Vec::new(),
            stack_trusted: false,
        }
    }

    fn push(&mut self, value: TrackedValue) {
        if self.stack_trusted {
            self.stack.push(value);
        }
    }

    fn pop(&mut self) -> TrackedValue {
        if self.stack_trusted {
            self.stack.pop().unwrap_or(TrackedValue::Top)
        } else {
            TrackedValue::Top
        }
    }

    fn invalidate_stack(&mut self) {
        self.stack.clear();
        self.stack_trusted = false;
    }
}

/// Resolve, per invocation instruction offset, the values of its actual
/// arguments in source order (receiver excluded). Forward dataflow with a
/// worklist over basic blocks; at control-flow joins a position stays
/// `Const(s)` only when every predecessor agrees on `s`.
pub(crate) fn resolve_invocation_args(method: &Method) -> BTreeMap<u32, Vec<TrackedValue>> {
    let mut block_map: BTreeMap<u32, &BasicBlock> = BTreeMap::new();
    for block in &method.cfg.blocks {
        block_map.insert(block.start_offset, block);
    }
    let mut successors: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for edge in &method.cfg.edges {
        successors.entry(edge.from).or_default().push(edge.to);
    }

    let mut in_states: BTreeMap<u32, State> = BTreeMap::new();
    let mut worklist = VecDeque::new();
    if block_map.contains_key(&0) {
        in_states.insert(0, State::entry());
        worklist.push_back(0);
    }
    for handler in &method.exception_handlers {
        if block_map.contains_key(&handler.handler_pc) {
            let seed = match in_states.get(&handler.handler_pc) {
                Some(existing) => join_states(existing, &State::handler()),
                None => State::handler(),
            };
            in_states.insert(handler.handler_pc, seed);
            worklist.push_back(handler.handler_pc);
        }
    }

    while let Some(block_start) = worklist.pop_front() {
        let Some(block) = block_map.get(&block_start) else {
            continue;
        };
        let mut state = match in_states.get(&block_start) {
            Some(state) => state.clone(),
            None => continue,
        };
        transfer_block(block, &method.bytecode, &mut state, None);

        if let Some(succs) = successors.get(&block_start) {
            for succ in succs {
                let updated = match in_states.get(succ) {
                    Some(existing) => join_states(existing, &state),
                    None => state.clone(),
                };
                let changed = in_states.get(succ) != Some(&updated);
                if changed {
                    in_states.insert(*succ, updated);
                    worklist.push_back(*succ);
                }
            }
        }
    }

    // Capture pass: replay each block once from its fixpoint input so the
    // recorded arguments are the final merged values.
    let mut args_by_offset = BTreeMap::new();
    for block in &method.cfg.blocks {
        let mut state = in_states
            .get(&block.start_offset)
            .cloned()
            .unwrap_or_else(State::untrusted);
        transfer_block(block, &method.bytecode, &mut state, Some(&mut args_by_offset));
    }
    args_by_offset
}

fn transfer_block(
    block: &BasicBlock,
    code: &[u8],
    state: &mut State,
    mut sink: Option<&mut BTreeMap<u32, Vec<TrackedValue>>>,
) {
    for inst in &block.instructions {
        match &inst.kind {
            InstructionKind::ConstString(value) => {
                state.push(TrackedValue::Const(value.clone()));
            }
            InstructionKind::LoadLocal(slot) => {
                let value = state
                    .locals
                    .get(slot)
                    .map(|s| TrackedValue::Const(s.clone()))
                    .unwrap_or(TrackedValue::Top);
                state.push(value);
            }
            InstructionKind::StoreLocal(slot) => {
                let value = state.pop();
                match value {
                    TrackedValue::Const(s) if inst.opcode == opcodes::ASTORE
                        || (opcodes::ASTORE_0..=opcodes::ASTORE_3).contains(&inst.opcode)
                        || is_wide_astore(code, inst) =>
                    {
                        state.locals.insert(*slot, s);
                    }
                    _ => {
                        state.locals.remove(slot);
                    }
                }
                if is_category_two_store(code, inst) {
                    state.locals.remove(&(slot + 1));
                }
            }
            InstructionKind::Invoke(call) => {
                let Ok(sig) = parse_method_descriptor(&call.descriptor) else {
                    state.invalidate_stack();
                    continue;
                };
                let arity = sig.param_count();
                if let Some(recorded) = sink.as_mut() {
                    let args = if state.stack_trusted && state.stack.len() >= arity {
                        state.stack[state.stack.len() - arity..].to_vec()
                    } else {
                        vec![TrackedValue::Top; arity]
                    };
                    recorded.insert(call.offset, args);
                }
                for _ in 0..arity {
                    state.pop();
                }
                if call.has_receiver() {
                    state.pop();
                }
                if sig.returns_value() {
                    state.push(TrackedValue::Top);
                }
            }
            InstructionKind::Other(_) => {
                apply_opaque_effect(state, inst, code);
            }
        }
    }
}

/// Apply the value-level operand stack effect of an instruction the tracker
/// does not interpret. Unknown or type-ambiguous opcodes invalidate the
/// stack rather than risk misaligning later argument positions.
fn apply_opaque_effect(state: &mut State, inst: &Instruction, code: &[u8]) {
    match inst.opcode {
        opcodes::DUP => {
            if let Some(top) = state.stack.last().cloned() {
                state.push(top);
            } else if state.stack_trusted {
                state.push(TrackedValue::Top);
            }
        }
        opcodes::DUP_X1 => {
            if state.stack_trusted && state.stack.len() >= 2 {
                let top = state.stack[state.stack.len() - 1].clone();
                state.stack.insert(state.stack.len() - 2, top);
            } else {
                state.invalidate_stack();
            }
        }
        opcodes::SWAP => {
            if state.stack_trusted && state.stack.len() >= 2 {
                let len = state.stack.len();
                state.stack.swap(len - 1, len - 2);
            } else {
                state.invalidate_stack();
            }
        }
        // The cast does not change the value, so a tracked constant survives.
        opcodes::CHECKCAST => {}
        opcodes::POP2
        | opcodes::DUP_X2
        | opcodes::DUP2
        | opcodes::DUP2_X1
        | opcodes::DUP2_X2 => {
            state.invalidate_stack();
        }
        opcodes::WIDE => match code.get(inst.offset as usize + 1).copied() {
            Some(wide_opcode) => match wide_opcode {
                opcodes::ILOAD..=opcodes::DLOAD => state.push(TrackedValue::Top),
                opcodes::IINC | opcodes::RET => {}
                _ => state.invalidate_stack(),
            },
            None => state.invalidate_stack(),
        },
        opcodes::MULTIANEWARRAY => {
            let dims = code
                .get(inst.offset as usize + 3)
                .copied()
                .unwrap_or(0) as usize;
            for _ in 0..dims {
                state.pop();
            }
            state.push(TrackedValue::Top);
        }
        _ => match stack_effect(inst.opcode) {
            Some((pops, pushes)) => {
                for _ in 0..pops {
                    state.pop();
                }
                for _ in 0..pushes {
                    state.push(TrackedValue::Top);
                }
            }
            None => state.invalidate_stack(),
        },
    }
}

/// `(pops, pushes)` in value terms for opcodes with a fixed effect.
fn stack_effect(opcode: u8) -> Option<(usize, usize)> {
    let effect = match opcode {
        opcodes::NOP => (0, 0),
        // Constant pushes: aconst_null through dconst_1, bipush, sipush,
        // and non-string ldc variants.
        0x01..=0x0f | opcodes::BIPUSH | opcodes::SIPUSH => (0, 1),
        opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W => (0, 1),
        // Primitive local loads; reference loads are handled structurally.
        0x15..=0x18 | 0x1a..=0x29 => (0, 1),
        // Array element loads and stores.
        0x2e..=0x35 => (2, 1),
        0x4f..=0x56 => (3, 0),
        opcodes::POP => (1, 0),
        // Binary arithmetic, shifts, and bitwise ops.
        0x60..=0x73 | 0x78..=0x83 => (2, 1),
        // Negations and primitive conversions.
        0x74..=0x77 | 0x85..=0x93 => (1, 1),
        // lcmp, fcmpl, fcmpg, dcmpl, dcmpg.
        0x94..=0x98 => (2, 1),
        opcodes::IINC => (0, 0),
        // Single-operand and two-operand conditional branches.
        0x99..=0x9e | opcodes::IFNULL | opcodes::IFNONNULL => (1, 0),
        0x9f..=0xa6 => (2, 0),
        opcodes::GOTO | opcodes::GOTO_W | opcodes::RET => (0, 0),
        opcodes::JSR | opcodes::JSR_W => (0, 1),
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => (1, 0),
        opcodes::IRETURN..=opcodes::ARETURN | opcodes::ATHROW => (1, 0),
        opcodes::RETURN => (0, 0),
        opcodes::GETSTATIC => (0, 1),
        opcodes::PUTSTATIC => (1, 0),
        opcodes::GETFIELD => (1, 1),
        opcodes::PUTFIELD => (2, 0),
        opcodes::NEW => (0, 1),
        opcodes::NEWARRAY | opcodes::ANEWARRAY | opcodes::ARRAYLENGTH => (1, 1),
        opcodes::INSTANCEOF => (1, 1),
        opcodes::MONITORENTER | opcodes::MONITOREXIT => (1, 0),
        // breakpoint / impdep reserved opcodes.
        0xca | 0xfe | 0xff => (0, 0),
        _ => return None,
    };
    Some(effect)
}

fn is_wide_astore(code: &[u8], inst: &Instruction) -> bool {
    inst.opcode == opcodes::WIDE
        && code.get(inst.offset as usize + 1).copied() == Some(opcodes::ASTORE)
}

fn is_category_two_store(code: &[u8], inst: &Instruction) -> bool {
    match inst.opcode {
        opcodes::LSTORE | opcodes::DSTORE => true,
        // lstore_0..3 and dstore_0..3.
        0x3f..=0x42 | 0x47..=0x4a => true,
        opcodes::WIDE => matches!(
            code.get(inst.offset as usize + 1).copied(),
            Some(opcodes::LSTORE) | Some(opcodes::DSTORE)
        ),
        _ => false,
    }
}

fn join_states(left: &State, right: &State) -> State {
    let mut locals = BTreeMap::new();
    for (slot, value) in &left.locals {
        if right.locals.get(slot) == Some(value) {
            locals.insert(*slot, value.clone());
        }
    }
    let (stack, stack_trusted) =
        if left.stack_trusted && right.stack_trusted && left.stack.len() == right.stack.len() {
            let stack = left
                .stack
                .iter()
                .zip(right.stack.iter())
                .map(|(l, r)| if l == r { l.clone() } else { TrackedValue::Top })
                .collect();
            (stack, true)
        } else {
            (Vec::new(), false)
        };
    State {
        locals,
        stack,
        stack_trusted,
    }
}
