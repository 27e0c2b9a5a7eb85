//! Compilation output units.
//!
//! Translation produces one `Code` fragment per function plus a `Str`
//! fragment per distinct allocation descriptor; instruction selection
//! appends a `FrameMap` fragment per call site.  Emission walks the list
//! in order.

use crate::common::Bitmap;
use crate::middle::frame::{CallSiteMap, Frame};
use crate::middle::temp::Label;
use crate::middle::tree::Stm;

#[derive(Debug)]
pub enum Fragment {
    /// A function body.  One statement after translation; the
    /// canonicaliser replaces it with the trace-scheduled list.
    Code { body: Vec<Stm>, frame: Frame },
    /// A read-only string: an allocation descriptor.
    Str { label: Label, value: String },
    /// A call-site pointer map, keyed by the call's return label.
    FrameMap { map: CallSiteMap, ret_label: Label },
}

impl Fragment {
    pub fn code(body: Stm, frame: Frame) -> Fragment {
        Fragment::Code {
            body: vec![body],
            frame,
        }
    }
}

/// A `FrameMap` fragment completed by the register allocator: the spill
/// and callee-save information only exists once colours are assigned.
/// See the emitter for the on-disk record layout.
#[derive(Debug, Default, Clone)]
pub struct FinalFrameMap {
    /// Two bits per callee-save register: 00 non-pointer, 01 pointer,
    /// 10 inherit-from-caller.
    pub cs_bitmap: u32,
    pub num_arg_words: u16,
    pub num_local_words: u16,
    /// Callee-save register indices for inherit-disposition spill slots,
    /// packed as 4-bit nibbles at emission.
    pub spill_regs: Vec<u8>,
    pub args: Bitmap,
    pub locals: Bitmap,
    /// Selector bits marking which spill slots inherit, one bit per
    /// locals word.
    pub spill_inherit: Bitmap,
}
