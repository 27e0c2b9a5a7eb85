//! Assembly and frame-map emission.
//!
//! Drives the per-function back-end pipeline (instruction selection, the
//! sink instruction, register allocation, prologue/epilogue) and writes
//! the textual output: text section, functions, the read-only descriptor
//! strings, and the frame-map records.
//!
//! Each frame-map record is 8-byte aligned and laid out as
//!
//! ```text
//! .quad   previous record (0 for the first)
//! .quad   the call's return-address label      — the lookup key
//! .long   callee-save bitmap, 2 bits per register:
//!         00 non-pointer, 01 pointer, 10 inherit-from-caller
//! .short  number of argument words
//! .short  number of local words
//! .byte×5 spill-register indices, 10 4-bit entries
//! .byte   padding
//! .quad×  argument bitmap, locals bitmap, spill-inherit bitmap
//! ```
//!
//! The head of the list is exported as `sl_rt_frame_maps`; the runtime
//! walks the chain and matches return addresses found on the stack.

use crate::back::assem::format_instr;
use crate::back::regalloc::{self, RegAllocResult};
use crate::back::target::Target;
use crate::common::{bitset_len, Bitmap};
use crate::middle::fragment::{Fragment, FinalFrameMap};
use crate::middle::frame::{callee_save_index, local_word_index, CallSiteMap, Frame};
use crate::middle::temp::{Label, PtrDispo, TempState};
use crate::middle::tree::Stm;

/// Select instructions for a whole canonical function body; also returns
/// the call-site maps produced at each call.
pub fn select_instructions(
    ts: &mut TempState,
    target: &'static Target,
    frame: &mut Frame,
    body: &[Stm],
) -> (Vec<crate::back::assem::Instr>, Vec<(CallSiteMap, Label)>) {
    let mut instrs = Vec::new();
    let mut maps = Vec::new();
    for stm in body {
        let munched = target.backend.codegen(ts, frame, stm);
        instrs.extend(munched.instrs);
        for frag in munched.frame_maps {
            let Fragment::FrameMap { map, ret_label } = frag else {
                unreachable!("instruction selection only adds frame maps");
            };
            maps.push((map, ret_label));
        }
    }
    (instrs, maps)
}

/// Compile translated-and-canonicalised fragments down to assembly text.
pub fn compile_fragments(
    ts: &mut TempState,
    target: &'static Target,
    fragments: Vec<Fragment>,
    coalesce: bool,
) -> String {
    let mut out = String::new();
    let mut strings: Vec<(Label, String)> = Vec::new();
    let mut records: Vec<(Label, FinalFrameMap)> = Vec::new();
    let mut emitted_header = false;

    for frag in fragments {
        match frag {
            Fragment::Str { label, value } => strings.push((label, value)),
            Fragment::FrameMap { .. } => {
                unreachable!("frame maps appear during instruction selection only")
            }
            Fragment::Code { body, mut frame } => {
                let (mut instrs, maps) = select_instructions(ts, target, &mut frame, &body);
                target.backend.proc_entry_exit_2(&frame, &mut instrs);

                let result = regalloc::alloc(ts, &mut frame, instrs, coalesce);

                if !emitted_header {
                    out.push_str(target.backend.text_segment_header());
                    emitted_header = true;
                }
                let (prologue, epilogue) = target.backend.proc_entry_exit_3(&frame);
                out.push_str(&prologue);
                for instr in &result.instrs {
                    out.push_str(&format_instr(instr, &result.allocation, target));
                }
                out.push_str(&epilogue);

                for (map, ret_label) in maps {
                    let record = finalise_frame_map(&frame, &map, ret_label, &result);
                    records.push((ret_label, record));
                }
            }
        }
    }

    if !strings.is_empty() {
        out.push_str(target.backend.string_section_header());
        for (label, value) in &strings {
            out.push_str(&format!("{}:\n\t.asciz\t{}\n", label, escape(value)));
        }
    }

    if !records.is_empty() {
        let comment = target.comment_prefix;
        out.push_str(target.backend.data_section_header());
        for (entry, (ret_label, record)) in records.iter().enumerate() {
            out.push_str("\t.p2align\t3\n");
            out.push_str(&format!("Lptrmap{}:\n", entry));
            if entry == 0 {
                out.push_str("\t.quad\t0\n");
            } else {
                out.push_str(&format!("\t.quad\tLptrmap{}\n", entry - 1));
            }
            out.push_str(&format!(
                "\t.quad\t{}\t{} return address - the key\n",
                ret_label, comment
            ));
            out.push_str(&format!(
                "\t.long\t{}\t{} callee-save bitmap\n",
                record.cs_bitmap, comment
            ));
            out.push_str(&format!(
                "\t.short\t{}\t{} number of argument words\n",
                record.num_arg_words, comment
            ));
            out.push_str(&format!(
                "\t.short\t{}\t{} number of local words\n",
                record.num_local_words, comment
            ));
            let nibbles = pack_nibbles(&record.spill_regs);
            out.push_str(&format!(
                "\t.byte\t{}, {}, {}, {}, {}\t{} spill-register indices\n",
                nibbles[0], nibbles[1], nibbles[2], nibbles[3], nibbles[4], comment
            ));
            out.push_str("\t.byte\t0\n");
            for word in record.args.words() {
                out.push_str(&format!("\t.quad\t{}\t{} argument bitmap\n", word, comment));
            }
            for word in record.locals.words() {
                out.push_str(&format!("\t.quad\t{}\t{} locals bitmap\n", word, comment));
            }
            for word in record.spill_inherit.words() {
                out.push_str(&format!(
                    "\t.quad\t{}\t{} spill-inherit bitmap\n",
                    word, comment
                ));
            }
        }
        // the exported head points at the last record emitted
        let prefix = target.label_prefix;
        out.push_str(&format!(
            "\t.globl\t{}sl_rt_frame_maps\n\t.p2align\t3\n{}sl_rt_frame_maps:\n\t.quad\tLptrmap{}\n",
            prefix,
            prefix,
            records.len() - 1
        ));
    }

    out
}

/// Complete a call site's pointer map once registers are assigned: spill
/// slots live across the call enter the locals bitmap (or the
/// spill-inherit records), and the callee-save bitmap reflects which
/// registers hold pointers there.
fn finalise_frame_map(
    frame: &Frame,
    map: &CallSiteMap,
    ret_label: Label,
    ra: &RegAllocResult,
) -> FinalFrameMap {
    let num_arg_words = frame.num_arg_words();
    let num_local_words = frame.num_local_words();

    let mut args = Bitmap::new(num_arg_words);
    for word in &map.arg_words {
        args.set(*word);
    }
    let mut locals = Bitmap::new(num_local_words);
    for word in &map.local_words {
        locals.set(*word);
    }

    let mut spill_inherit = Bitmap::new(if frame.spills.is_empty() {
        0
    } else {
        num_local_words
    });
    let mut spill_regs = Vec::new();
    if let Some(live) = ra.spill_live_by_label.get(&ret_label) {
        for slot in &frame.spills {
            if !live.contains(&slot.temp) {
                continue;
            }
            match slot.temp.dispo {
                PtrDispo::Ptr => locals.set(local_word_index(slot.offset)),
                PtrDispo::Inherit => {
                    // a fresh temp introduced by an earlier spill rewrite
                    // is a copy of a value already covered by its own slot
                    let Some(cs) = callee_save_index(frame, slot.temp) else {
                        continue;
                    };
                    spill_inherit.set(local_word_index(slot.offset));
                    spill_regs.push(cs as u8);
                }
                PtrDispo::NotPtr => {}
            }
        }
    }
    assert!(
        spill_regs.len() <= 10,
        "more inherit spill slots than the record format can carry"
    );

    let mut cs_bitmap = 0u32;
    if let Some(live) = ra.live_outs_by_label.get(&ret_label) {
        for (i, cs) in frame.target.callee_saves.iter().enumerate() {
            let reg_name = frame.target.registers[cs.id as usize];
            for t in live {
                if t.is_machine() {
                    continue;
                }
                if ra.allocation.get(&t.id) == Some(&reg_name) {
                    let code = match t.dispo {
                        PtrDispo::Ptr => 0b01,
                        PtrDispo::Inherit => 0b10,
                        PtrDispo::NotPtr => 0b00,
                    };
                    cs_bitmap |= code << (2 * i);
                }
            }
        }
    }

    debug_assert_eq!(args.words().len(), bitset_len(num_arg_words));
    FinalFrameMap {
        cs_bitmap,
        num_arg_words: num_arg_words as u16,
        num_local_words: num_local_words as u16,
        spill_regs,
        args,
        locals,
        spill_inherit,
    }
}

/// Pack up to ten 4-bit register indices into five bytes.
fn pack_nibbles(regs: &[u8]) -> [u8; 5] {
    let mut bytes = [0u8; 5];
    for (i, reg) in regs.iter().enumerate() {
        debug_assert!(*reg < 16);
        if i % 2 == 0 {
            bytes[i / 2] |= reg & 0xf;
        } else {
            bytes[i / 2] |= (reg & 0xf) << 4;
        }
    }
    bytes
}

/// Escape a descriptor for `.asciz`.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_strings() {
        assert_eq!(escape("np"), "\"np\"");
        assert_eq!(escape("a\"b\\c\nd\te"), "\"a\\\"b\\\\c\\nd\\te\"");
    }

    #[test]
    fn nibble_packing() {
        assert_eq!(pack_nibbles(&[]), [0; 5]);
        assert_eq!(pack_nibbles(&[3]), [3, 0, 0, 0, 0]);
        assert_eq!(pack_nibbles(&[3, 9]), [3 | (9 << 4), 0, 0, 0, 0]);
        assert_eq!(pack_nibbles(&[1, 2, 3]), [1 | (2 << 4), 3, 0, 0, 0]);
    }
}
