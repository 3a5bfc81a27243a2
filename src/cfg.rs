use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::ir::Instruction;
use crate::opcodes;

/// Basic block graph for method bytecode.
#[derive(Clone, Debug)]
pub(crate) struct ControlFlowGraph {
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) edges: Vec<FlowEdge>,
}

/// Basic block covering a range of bytecode offsets.
#[derive(Clone, Debug)]
pub(crate) struct BasicBlock {
    pub(crate) start_offset: u32,
    pub(crate) instructions: Vec<Instruction>,
}

/// Edge between basic blocks, identified by their start offsets.
#[derive(Clone, Debug)]
pub(crate) struct FlowEdge {
    pub(crate) from: u32,
    pub(crate) to: u32,
}

/// Build a control flow graph from decoded bytecode instructions.
///
/// Exception handler entry points are treated as block leaders so the
/// tracker can seed them with a conservative state.
pub(crate) fn build_cfg(
    code: &[u8],
    instructions: &[Instruction],
    handlers: &[u32],
) -> Result<ControlFlowGraph> {
    let mut leaders = BTreeSet::new();
    leaders.insert(0u32);
    for handler in handlers {
        leaders.insert(*handler);
    }
    for inst in instructions {
        if let Some(targets) = branch_targets(code, inst.offset as usize)? {
            for target in targets {
                leaders.insert(target);
            }
            let next = inst.offset + opcode_length(code, inst.offset as usize)? as u32;
            leaders.insert(next);
        }
        if is_exit_opcode(inst.opcode) {
            let next = inst.offset + opcode_length(code, inst.offset as usize)? as u32;
            leaders.insert(next);
        }
    }

    let mut leader_list: Vec<u32> = leaders.into_iter().collect();
    leader_list.retain(|offset| *offset < code.len() as u32);

    let mut blocks = Vec::new();
    for (index, start) in leader_list.iter().copied().enumerate() {
        let end = leader_list
            .get(index + 1)
            .copied()
            .unwrap_or(code.len() as u32);
        let block_instructions = instructions
            .iter()
            .filter(|inst| inst.offset >= start && inst.offset < end)
            .cloned()
            .collect();
        blocks.push(BasicBlock {
            start_offset: start,
            instructions: block_instructions,
        });
    }

    let block_starts: BTreeSet<u32> = blocks.iter().map(|block| block.start_offset).collect();
    let mut edges = Vec::new();
    for (index, block) in blocks.iter().enumerate() {
        let Some(last_inst) = block.instructions.last() else {
            continue;
        };
        let fall_through = blocks.get(index + 1).map(|next| next.start_offset);
        if let Some(targets) = branch_targets(code, last_inst.offset as usize)? {
            for target in targets {
                if block_starts.contains(&target) {
                    edges.push(FlowEdge {
                        from: block.start_offset,
                        to: target,
                    });
                }
            }
            if !is_unconditional_branch(last_inst.opcode) {
                if let Some(next) = fall_through {
                    edges.push(FlowEdge {
                        from: block.start_offset,
                        to: next,
                    });
                }
            }
        } else if !is_exit_opcode(last_inst.opcode) {
            if let Some(next) = fall_through {
                edges.push(FlowEdge {
                    from: block.start_offset,
                    to: next,
                });
            }
        }
    }

    Ok(ControlFlowGraph { blocks, edges })
}

fn is_exit_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::IRETURN
            | opcodes::LRETURN
            | opcodes::FRETURN
            | opcodes::DRETURN
            | opcodes::ARETURN
            | opcodes::RETURN
            | opcodes::ATHROW
            | opcodes::RET
    )
}

fn is_unconditional_branch(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::GOTO | opcodes::JSR | opcodes::GOTO_W | opcodes::JSR_W
    )
}

fn branch_targets(code: &[u8], offset: usize) -> Result<Option<Vec<u32>>> {
    let opcode = code[offset];
    let targets = match opcode {
        opcodes::IFEQ..=opcodes::IF_ACMPNE
        | opcodes::GOTO
        | opcodes::JSR
        | opcodes::IFNULL
        | opcodes::IFNONNULL => {
            let branch = read_i16(code, offset + 1)?;
            vec![(offset as i64 + branch as i64) as u32]
        }
        opcodes::GOTO_W | opcodes::JSR_W => {
            let branch = read_i32(code, offset + 1)?;
            vec![(offset as i64 + branch as i64) as u32]
        }
        opcodes::TABLESWITCH => tableswitch_targets(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_targets(code, offset)?,
        _ => return Ok(None),
    };
    Ok(Some(targets))
}

fn tableswitch_targets(code: &[u8], offset: usize) -> Result<Vec<u32>> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let default = read_i32(code, base)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    let mut targets = Vec::new();
    targets.push((offset as i64 + default as i64) as u32);
    let mut idx = base + 12;
    for _ in 0..count {
        let target = read_i32(code, idx)?;
        targets.push((offset as i64 + target as i64) as u32);
        idx += 4;
    }
    Ok(targets)
}

fn lookupswitch_targets(code: &[u8], offset: usize) -> Result<Vec<u32>> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let default = read_i32(code, base)?;
    let npairs = read_i32(code, base + 4)?;
    let mut targets = Vec::new();
    targets.push((offset as i64 + default as i64) as u32);
    let mut idx = base + 8;
    for _ in 0..npairs {
        let target = read_i32(code, idx + 4)?;
        targets.push((offset as i64 + target as i64) as u32);
        idx += 8;
    }
    Ok(targets)
}

fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    crate::scan::opcode_length(code, offset)
}

fn padding(offset: usize) -> usize {
    crate::scan::padding(offset)
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    let value = crate::scan::read_u16(code, offset)?;
    Ok(i16::from_be_bytes(value.to_be_bytes()))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = crate::scan::read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}
