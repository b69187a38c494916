//! Array copies lowered to an element loop.
//!
//! ```text
//! ArrayCopyK:        count = len / width; empty? -> AfterArrayCopyK
//! ArrayCopyHeaderK:  phi count, src, dst; count > 0? -> body : after
//! ArrayCopyBodyK:    *dst = *src; step both pointers; count -= 1
//! AfterArrayCopyK:
//! ```
//!
//! A backward copy starts at the last element and steps down.

use crate::error::Result;
use crate::ir::NodeId;
use crate::{bail_fatal, bail_invalid};

use super::EmitContext;

impl EmitContext<'_> {
    pub(super) fn render_array_copy(&mut self, id: NodeId, width: u8, backward: bool) -> Result<()> {
        let node = self.method.node(id);
        // With five children the first two are the array objects.
        let (src, dst, len) = match node.children.as_slice() {
            &[src, dst, len] | &[_, _, src, dst, len] => (src, dst, len),
            _ => bail_fatal!(Some(id), "array copy with {} operands", node.children.len()),
        };
        let elem = match width {
            1 => "i8",
            2 => "i16",
            4 => "i32",
            8 => "i64",
            w => bail_invalid!(id, "array copy of {}-byte elements", w),
        };
        let s = self.value(src)?;
        let d = self.value(dst)?;
        let n = self.value(len)?;
        let lt = self.ty(self.method.node(len).ty, len)?;

        let k = self.array_copies;
        self.array_copies += 1;
        let step: i32 = if backward { -1 } else { 1 };
        let out = &mut self.body;

        ir!(out, "  br label %ArrayCopy{}", k);
        ir!(out, "ArrayCopy{}:", k);
        ir!(out, "  %ac{k}.n0 = sdiv {lt} {n}, {width}");
        if backward {
            ir!(out, "  %ac{k}.last = sub {lt} {n}, {width}");
            ir!(out, "  %ac{k}.sb = getelementptr inbounds i8* {s}, {lt} %ac{k}.last");
            ir!(out, "  %ac{k}.db = getelementptr inbounds i8* {d}, {lt} %ac{k}.last");
            ir!(out, "  %ac{k}.s0 = bitcast i8* %ac{k}.sb to {elem}*");
            ir!(out, "  %ac{k}.d0 = bitcast i8* %ac{k}.db to {elem}*");
        } else {
            ir!(out, "  %ac{k}.s0 = bitcast i8* {s} to {elem}*");
            ir!(out, "  %ac{k}.d0 = bitcast i8* {d} to {elem}*");
        }
        ir!(out, "  %ac{k}.empty = icmp sle {lt} %ac{k}.n0, 0");
        ir!(out, "  br i1 %ac{k}.empty, label %AfterArrayCopy{k}, label %ArrayCopyHeader{k}");

        ir!(out, "ArrayCopyHeader{}:", k);
        ir!(out, "  %ac{k}.n = phi {lt} [ %ac{k}.n0, %ArrayCopy{k} ], [ %ac{k}.n1, %ArrayCopyBody{k} ]");
        ir!(out, "  %ac{k}.s = phi {elem}* [ %ac{k}.s0, %ArrayCopy{k} ], [ %ac{k}.s1, %ArrayCopyBody{k} ]");
        ir!(out, "  %ac{k}.d = phi {elem}* [ %ac{k}.d0, %ArrayCopy{k} ], [ %ac{k}.d1, %ArrayCopyBody{k} ]");
        ir!(out, "  %ac{k}.more = icmp sgt {lt} %ac{k}.n, 0");
        ir!(out, "  br i1 %ac{k}.more, label %ArrayCopyBody{k}, label %AfterArrayCopy{k}");

        ir!(out, "ArrayCopyBody{}:", k);
        ir!(out, "  %ac{k}.v = load {elem}* %ac{k}.s, align {width}");
        ir!(out, "  store {elem} %ac{k}.v, {elem}* %ac{k}.d, align {width}");
        ir!(out, "  %ac{k}.s1 = getelementptr inbounds {elem}* %ac{k}.s, i32 {step}");
        ir!(out, "  %ac{k}.d1 = getelementptr inbounds {elem}* %ac{k}.d, i32 {step}");
        ir!(out, "  %ac{k}.n1 = sub {lt} %ac{k}.n, 1");
        ir!(out, "  br label %ArrayCopyHeader{}", k);

        ir!(out, "AfterArrayCopy{}:", k);
        Ok(())
    }
}
