//! Flattening of call graphs into single self-contained instruction buffers.

use crate::{
    ebpf::{BYTE_OFFSET_IMMEDIATE, INSN_SIZE},
    program::{MapPatch, ProgramUnit, UnresolvedSymbol},
};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssemblyError {
    /// The call graph reachable from an entry program contains a cycle.
    /// Only the entry program touching the cycle is rejected.
    #[error("cyclic call graph: `{program}` is reentered while still being assembled (called from `{caller}`)")]
    CyclicCallGraph {
        /// The function reentered by the cycle
        program: String,
        /// The function whose call closes the cycle
        caller: String,
    },
}

/// A fully linked program: flattened instructions plus patch bookkeeping
/// remapped into the flattened buffer
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct AssembledProgram {
    pub insns: Vec<u8>,
    pub map_patches: Vec<MapPatch>,
    pub warnings: Vec<UnresolvedSymbol>,
}

/// Flatten the call graph reachable from `entry` into one buffer.
///
/// The entry unit's instructions come first, followed by every transitively
/// called unit exactly once in discovery order; call immediates are rewritten
/// to instruction offsets relative to the call site. Units not reachable from
/// any entry are never emitted.
pub(crate) fn assemble(entry: usize, units: &[ProgramUnit]) -> Result<AssembledProgram, AssemblyError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    // depth-first traversal with explicit coloring; an edge into a grey
    // unit is a cycle
    let mut color = vec![Color::White; units.len()];
    let mut order = Vec::new();
    let mut stack: Vec<(usize, usize)> = vec![(entry, 0)];
    color[entry] = Color::Grey;
    order.push(entry);
    while let Some(frame) = stack.last_mut() {
        let (unit, edge) = *frame;
        if edge == units[unit].calls.len() {
            color[unit] = Color::Black;
            stack.pop();
            continue;
        }
        frame.1 = edge.saturating_add(1);
        let target = units[unit].calls[edge].target;
        match color[target] {
            Color::White => {
                color[target] = Color::Grey;
                order.push(target);
                stack.push((target, 0));
            }
            Color::Grey => {
                return Err(AssemblyError::CyclicCallGraph {
                    program: units[target].name.clone(),
                    caller: units[unit].name.clone(),
                });
            }
            Color::Black => {}
        }
    }

    // instruction base of every emitted unit within the flattened buffer
    let mut base = vec![0usize; units.len()];
    let mut pc = 0usize;
    for &unit in &order {
        base[unit] = pc;
        pc = pc.saturating_add(units[unit].insn_count());
    }

    let mut insns = Vec::with_capacity(pc.saturating_mul(INSN_SIZE));
    let mut map_patches = Vec::new();
    let mut warnings = Vec::new();
    for &unit in &order {
        insns.extend_from_slice(&units[unit].insns);
        map_patches.extend(units[unit].map_patches.iter().map(|patch| MapPatch {
            insn_index: base[unit].saturating_add(patch.insn_index),
            map_index: patch.map_index,
        }));
        warnings.extend(units[unit].warnings.iter().map(|warning| UnresolvedSymbol {
            name: warning.name.clone(),
            insn_index: base[unit].saturating_add(warning.insn_index),
        }));
    }

    // call targets become offsets relative to the slot after the call
    for &unit in &order {
        for call in &units[unit].calls {
            let call_pc = base[unit].saturating_add(call.insn_index);
            let imm = (base[call.target] as i64)
                .saturating_sub(call_pc as i64)
                .saturating_sub(1);
            let offset = call_pc
                .saturating_mul(INSN_SIZE)
                .saturating_add(BYTE_OFFSET_IMMEDIATE);
            LittleEndian::write_i32(
                &mut insns[offset..offset.saturating_add(4)],
                imm as i32,
            );
        }
    }

    debug!(
        "assembled `{}`: {} units, {} instructions",
        units[entry].name,
        order.len(),
        pc
    );
    Ok(AssembledProgram {
        insns,
        map_patches,
        warnings,
    })
}
