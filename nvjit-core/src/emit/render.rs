//! Rendering of value and statement nodes.

use crate::analysis::invariance::same_value;
use crate::analysis::offload::resolve_array_base;
use crate::classify::mnemonic;
use crate::error::Result;
use crate::ir::{DataType, Literal, NodeId, Opcode, Recognized};
use crate::{bail_fatal, bail_invalid, err_invalid};

use super::intrinsics;
use super::{EmitContext, Space};

impl EmitContext<'_> {
    /// Name bound to a node, rendering it first when needed.
    pub(super) fn value(&mut self, id: NodeId) -> Result<String> {
        self.render(id)?;
        match self.names.get(&id) {
            Some(name) => Ok(name.clone()),
            None => bail_fatal!(Some(id), "node {} has no value", id),
        }
    }

    /// Render a node once per epoch. Shared nodes keep the name they got at
    /// their first reference.
    pub(super) fn render(&mut self, id: NodeId) -> Result<()> {
        if self.visited.get(&id) == Some(&self.epoch) {
            return Ok(());
        }
        self.visited.insert(id, self.epoch);

        let method = self.method;
        let node = method.node(id);
        match node.op {
            Opcode::Const => {
                let text = self.constant(id)?;
                self.names.insert(id, text);
            }
            Opcode::Load => self.render_load(id)?,
            Opcode::Store => {
                let (Some(sym), Some(c)) = (node.symbol, node.child(0)) else {
                    bail_fatal!(Some(id), "store without a symbol or value");
                };
                let v = self.value(c)?;
                let slot = self.slot_name(sym, id)?;
                let ty = self.ty(node.ty, id)?;
                ir!(self.body, "  store {} {}, {}* {}, align {}", ty, v, ty, slot, node.ty.size());
            }
            Opcode::LoadIndirect => self.render_load_indirect(id)?,
            Opcode::StoreIndirect => self.render_store_indirect(id)?,
            Opcode::LoadAddr => {
                bail_invalid!(id, "address of a local cannot be taken in a kernel")
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::UDiv
            | Opcode::Rem
            | Opcode::URem
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::UShr => self.render_binary(id)?,
            Opcode::Neg => self.render_neg(id)?,
            Opcode::Abs => self.render_abs(id)?,
            Opcode::Rol => self.render_rol(id)?,
            Opcode::MulHigh | Opcode::UMulHigh => self.render_mul_high(id)?,

            Opcode::Convert | Opcode::UConvert | Opcode::BitsCast => self.render_convert(id)?,
            Opcode::AddrAdd => {
                let (Some(base), Some(off)) = (node.child(0), node.child(1)) else {
                    bail_fatal!(Some(id), "address add needs two operands");
                };
                let b = self.value(base)?;
                let o = self.value(off)?;
                let off_ty = self.ty(method.node(off).ty, off)?;
                let n = self.fresh();
                ir!(self.body, "  {} = getelementptr inbounds i8* {}, {} {}", n, b, off_ty, o);
                self.names.insert(id, n);
            }
            Opcode::Compare(cond, mode) => {
                let (Some(a), Some(b)) = (node.child(0), node.child(1)) else {
                    bail_fatal!(Some(id), "compare needs two operands");
                };
                let operand = method.node(a).ty;
                let va = self.value(a)?;
                let vb = self.value(b)?;
                let mn = crate::classify::compare(cond, mode, operand)
                    .ok_or_else(|| err_invalid!(id, "cannot compare values of type {}", operand))?;
                let ty = self.ty(operand, a)?;
                let bit = self.fresh();
                ir!(self.body, "  {} = {} {} {}, {}", bit, mn, ty, va, vb);
                let n = self.fresh();
                ir!(self.body, "  {} = zext i1 {} to i32", n, bit);
                self.names.insert(id, n);
            }

            Opcode::NullCheck => self.render_null_check(id)?,
            Opcode::BoundCheck => self.render_bound_check(id)?,
            Opcode::DivCheck => self.render_div_check(id)?,
            Opcode::ArrayLength => self.render_array_length(id)?,
            Opcode::ArrayCopy { width, backward } => self.render_array_copy(id, width, backward)?,
            Opcode::Call => self.render_call(id)?,
            Opcode::TreeTop => {
                if let Some(c) = node.child(0) {
                    self.render(c)?;
                }
            }
            Opcode::PassThrough => {
                let Some(c) = node.child(0) else {
                    bail_fatal!(Some(id), "pass-through without an operand");
                };
                let v = self.value(c)?;
                self.names.insert(id, v);
            }

            Opcode::NewArray => bail_invalid!(id, "allocation inside a kernel"),
            Opcode::Splat | Opcode::GetElem | Opcode::LaneIndex => {
                bail_invalid!(id, "vector opcode {:?} in a kernel", node.op)
            }
            Opcode::If(..) | Opcode::Goto | Opcode::Return | Opcode::Lookup | Opcode::Table => {
                bail_fatal!(Some(id), "control transfer {} used as a value", id)
            }
        }
        Ok(())
    }

    fn constant(&self, id: NodeId) -> Result<String> {
        let node = self.method.node(id);
        if node.ty == DataType::Address {
            if node.is_null_const() {
                return Ok("null".to_string());
            }
            bail_invalid!(id, "address constant cannot be embedded in a kernel");
        }
        let text = match (node.literal, node.ty) {
            (Some(Literal::Int(v)), ty) if ty.is_integral() => v.to_string(),
            (Some(Literal::Float(v)), DataType::Float) => hex_float((v as f32) as f64),
            (Some(Literal::Float(v)), DataType::Double) => hex_float(v),
            (Some(Literal::Int(v)), DataType::Float) => hex_float((v as f32) as f64),
            (Some(Literal::Int(v)), DataType::Double) => hex_float(v as f64),
            _ => bail_invalid!(id, "malformed constant of type {}", node.ty),
        };
        Ok(text)
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn render_load(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let Some(sym) = node.symbol else {
            bail_fatal!(Some(id), "load without a symbol");
        };
        let slot = self.slot_name(sym, id)?;
        let ty = self.ty(node.ty, id)?;
        let n = self.fresh();
        ir!(self.body, "  {} = load {}* {}, align {}", n, ty, slot, node.ty.size());
        self.names.insert(id, n);
        Ok(())
    }

    /// Kernel parameter slot standing for an invariant indirect load.
    fn mapped_indirect(&self, id: NodeId) -> Option<u32> {
        let k = self.kernel.as_ref()?;
        let sym = self.method.node(id).symbol?;
        let entry = k.map.get(sym)?;
        let n = entry.node?;
        (entry.is_parameter() && same_value(self.method, n, id)).then_some(entry.slot as u32)
    }

    /// Reference to an array living in shared memory.
    pub(super) fn is_shared_ref(&self, id: NodeId) -> bool {
        let node = self.method.node(id);
        node.op == Opcode::LoadIndirect
            && node
                .symbol
                .is_some_and(|s| self.method.symbol(s).shared_memory_len().is_some())
    }

    fn address_space(&self, addr: NodeId, is_load: bool) -> Space {
        let a = self.method.node(addr);
        let base = match (a.op, a.child(0)) {
            (Opcode::AddrAdd, Some(b)) => b,
            _ => addr,
        };
        if self.is_shared_ref(base) {
            return Space::Shared;
        }
        if is_load && self.ldg_array.is_some() && self.is_read_only_array(addr) {
            return Space::ReadOnly;
        }
        Space::Default
    }

    fn is_read_only_array(&self, addr: NodeId) -> bool {
        let Some(k) = self.kernel.as_ref() else {
            return false;
        };
        resolve_array_base(self.method, k.usedef, k.map, addr)
            .and_then(|base| k.map.get(base))
            .is_some_and(|e| e.is_array() && !e.writes())
    }

    fn render_load_indirect(&mut self, id: NodeId) -> Result<()> {
        let method = self.method;
        let node = method.node(id);
        let ty = self.ty(node.ty, id)?;

        if let Some(slot) = self.mapped_indirect(id) {
            let n = self.fresh();
            ir!(self.body, "  {} = load {}* %p{}.addr, align {}", n, ty, slot, node.ty.size());
            self.names.insert(id, n);
            return Ok(());
        }

        if let Some(len) = node.symbol.and_then(|s| method.symbol(s).shared_memory_len()) {
            let Some(field) = node.symbol else {
                bail_fatal!(Some(id), "shared load without a field");
            };
            let symbol = method.symbol(field);
            let elem = symbol
                .signature
                .as_deref()
                .and_then(intrinsics::signature_element_type)
                .ok_or_else(|| err_invalid!(id, "shared field {} is not an array", symbol.name))?;
            let header = self.object_model.array_header_size;
            let raw = self.fresh();
            let start = self.fresh();
            let n = self.fresh();
            ir!(
                self.body,
                "  {} = bitcast [{} x {}] addrspace(3)* @{} to i8 addrspace(3)*",
                raw,
                len,
                elem,
                symbol.name
            );
            ir!(self.body, "  {} = getelementptr inbounds i8 addrspace(3)* {}, i64 -{}", start, raw, header);
            ir!(self.body, "  {} = addrspacecast i8 addrspace(3)* {} to i8*", n, start);
            self.names.insert(id, n);
            return Ok(());
        }

        let Some(addr) = node.child(0) else {
            bail_fatal!(Some(id), "indirect load without an address");
        };
        let a = self.value(addr)?;
        let align = node.ty.size();
        let n = match self.address_space(addr, true) {
            Space::Shared => {
                let p = self.fresh();
                ir!(self.body, "  {} = addrspacecast i8* {} to {} addrspace(3)*", p, a, ty);
                let n = self.fresh();
                ir!(self.body, "  {} = load {} addrspace(3)* {}, align {}", n, ty, p, align);
                n
            }
            Space::ReadOnly => {
                let two_param = self.ldg_array.unwrap_or(false);
                let p = self.fresh();
                ir!(self.body, "  {} = bitcast i8* {} to {}*", p, a, ty);
                self.ldg(ty, &p, align, two_param, id)?
            }
            Space::Default => {
                let p = self.fresh();
                ir!(self.body, "  {} = bitcast i8* {} to {}*", p, a, ty);
                let n = self.fresh();
                ir!(self.body, "  {} = load {}* {}, align {}", n, ty, p, align);
                n
            }
        };
        self.names.insert(id, n);
        Ok(())
    }

    /// Read-only cached load through `ptr`.
    fn ldg(&mut self, ty: &str, ptr: &str, align: u32, two_param: bool, id: NodeId) -> Result<String> {
        let name = intrinsics::ldg_name(ty, two_param)
            .ok_or_else(|| err_invalid!(id, "no read-only load for type {}", ty))?;
        let n = self.fresh();
        if two_param {
            ir!(self.body, "  {} = call {} @{}({}* {}, i32 {})", n, ty, name, ty, ptr, align);
        } else {
            ir!(self.body, "  {} = call {} @{}({}* {})", n, ty, name, ty, ptr);
        }
        Ok(n)
    }

    fn render_store_indirect(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let (Some(addr), Some(value)) = (node.child(0), node.child(1)) else {
            bail_fatal!(Some(id), "indirect store needs an address and a value");
        };
        let ty = self.ty(node.ty, id)?;
        let a = self.value(addr)?;
        let v = self.value(value)?;
        let align = node.ty.size();
        let p = self.fresh();
        if self.address_space(addr, false) == Space::Shared {
            ir!(self.body, "  {} = addrspacecast i8* {} to {} addrspace(3)*", p, a, ty);
            ir!(self.body, "  store {} {}, {} addrspace(3)* {}, align {}", ty, v, ty, p, align);
        } else {
            ir!(self.body, "  {} = bitcast i8* {} to {}*", p, a, ty);
            ir!(self.body, "  store {} {}, {}* {}, align {}", ty, v, ty, p, align);
        }
        Ok(())
    }

    fn render_array_length(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let Some(array) = node.child(0) else {
            bail_fatal!(Some(id), "array length without an array");
        };
        if self.is_shared_ref(array) {
            let array_node = self.method.node(array);
            if let Some(len) = array_node
                .symbol
                .and_then(|s| self.method.symbol(s).shared_memory_len())
            {
                self.names.insert(id, len.to_string());
                return Ok(());
            }
        }
        let r = self.value(array)?;
        let field = self.fresh();
        let p = self.fresh();
        ir!(
            self.body,
            "  {} = getelementptr inbounds i8* {}, i32 {}",
            field,
            r,
            self.object_model.array_length_offset
        );
        ir!(self.body, "  {} = bitcast i8* {} to i32*", p, field);
        let n = match self.ldg_header {
            Some(two_param) => self.ldg("i32", &p, 4, two_param, id)?,
            None => {
                let n = self.fresh();
                ir!(self.body, "  {} = load i32* {}, align 4", n, p);
                n
            }
        };
        self.names.insert(id, n);
        Ok(())
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn operands(&mut self, id: NodeId) -> Result<(NodeId, String, NodeId, String)> {
        let node = self.method.node(id);
        let (Some(a), Some(b)) = (node.child(0), node.child(1)) else {
            bail_fatal!(Some(id), "{:?} needs two operands", node.op);
        };
        let va = self.value(a)?;
        let vb = self.value(b)?;
        Ok((a, va, b, vb))
    }

    /// Shift amounts are 32-bit; a 64-bit shift needs them widened.
    fn widen_shift_amount(&mut self, ty: DataType, amount: NodeId, value: String) -> String {
        if ty == DataType::Int64 && self.method.node(amount).ty == DataType::Int32 {
            let w = self.fresh();
            ir!(self.body, "  {} = zext i32 {} to i64", w, value);
            w
        } else {
            value
        }
    }

    fn render_binary(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let (op, ty) = (node.op, node.ty);
        let (a, va, b, vb) = self.operands(id)?;
        let mn = mnemonic(op, ty, self.method.node(a).ty)
            .ok_or_else(|| err_invalid!(id, "no NVVM instruction for {:?} on {}", op, ty))?;
        let vb = if matches!(op, Opcode::Shl | Opcode::Shr | Opcode::UShr) {
            self.widen_shift_amount(ty, b, vb)
        } else {
            vb
        };
        let t = self.ty(ty, id)?;
        let n = self.fresh();
        ir!(self.body, "  {} = {} {} {}, {}", n, mn, t, va, vb);
        self.names.insert(id, n);
        Ok(())
    }

    fn render_neg(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let ty = node.ty;
        let Some(c) = node.child(0) else {
            bail_fatal!(Some(id), "negation without an operand");
        };
        let v = self.value(c)?;
        let t = self.ty(ty, id)?;
        let n = self.fresh();
        if ty.is_integral() {
            ir!(self.body, "  {} = sub {} 0, {}", n, t, v);
        } else if ty.is_floating_point() {
            ir!(self.body, "  {} = fsub {} {}, {}", n, t, hex_float(-0.0), v);
        } else {
            bail_invalid!(id, "cannot negate a value of type {}", ty);
        }
        self.names.insert(id, n);
        Ok(())
    }

    /// `(x ^ (x >> bits-1)) - (x >> bits-1)` for integers.
    fn render_abs(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let ty = node.ty;
        let Some(c) = node.child(0) else {
            bail_fatal!(Some(id), "abs without an operand");
        };
        if ty.is_floating_point() {
            if !self.options.enable_math {
                bail_invalid!(id, "floating-point abs needs math intrinsics");
            }
            let v = self.value(c)?;
            let (name, t) = if ty == DataType::Float {
                ("__nv_fabsf", "float")
            } else {
                ("__nv_fabs", "double")
            };
            let n = self.fresh();
            ir!(self.body, "  {} = call {} @{}({} {})", n, t, name, t, v);
            self.names.insert(id, n);
            return Ok(());
        }
        if !ty.is_integral() {
            bail_invalid!(id, "abs of a value of type {}", ty);
        }
        let v = self.value(c)?;
        let t = self.ty(ty, id)?;
        let bits = ty.size() * 8;
        let sign = self.fresh();
        let flipped = self.fresh();
        let n = self.fresh();
        ir!(self.body, "  {} = ashr {} {}, {}", sign, t, v, bits - 1);
        ir!(self.body, "  {} = xor {} {}, {}", flipped, t, v, sign);
        ir!(self.body, "  {} = sub {} {}, {}", n, t, flipped, sign);
        self.names.insert(id, n);
        Ok(())
    }

    fn render_rol(&mut self, id: NodeId) -> Result<()> {
        let ty = self.method.node(id).ty;
        if !ty.is_integral() {
            bail_invalid!(id, "rotate of a value of type {}", ty);
        }
        let (_, va, b, vb) = self.operands(id)?;
        let vb = self.widen_shift_amount(ty, b, vb);
        let t = self.ty(ty, id)?;
        let bits = ty.size() * 8;
        let left = self.fresh();
        let complement = self.fresh();
        let right = self.fresh();
        let n = self.fresh();
        ir!(self.body, "  {} = shl {} {}, {}", left, t, va, vb);
        ir!(self.body, "  {} = sub {} {}, {}", complement, t, bits, vb);
        ir!(self.body, "  {} = lshr {} {}, {}", right, t, va, complement);
        ir!(self.body, "  {} = or {} {}, {}", n, t, left, right);
        self.names.insert(id, n);
        Ok(())
    }

    /// Widen both operands, multiply, shift the high half down and truncate.
    fn render_mul_high(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let unsigned = node.op == Opcode::UMulHigh;
        let (t, wide, bits) = match node.ty {
            DataType::Int32 => ("i32", "i64", 32),
            DataType::Int64 => ("i64", "i128", 64),
            other => bail_invalid!(id, "high multiply of type {}", other),
        };
        let (_, va, _, vb) = self.operands(id)?;
        let ext = if unsigned { "zext" } else { "sext" };
        let shift = if unsigned { "lshr" } else { "ashr" };
        let wa = self.fresh();
        let wb = self.fresh();
        let product = self.fresh();
        let high = self.fresh();
        let n = self.fresh();
        ir!(self.body, "  {} = {} {} {} to {}", wa, ext, t, va, wide);
        ir!(self.body, "  {} = {} {} {} to {}", wb, ext, t, vb, wide);
        ir!(self.body, "  {} = mul {} {}, {}", product, wide, wa, wb);
        ir!(self.body, "  {} = {} {} {}, {}", high, shift, wide, product, bits);
        ir!(self.body, "  {} = trunc {} {} to {}", n, wide, high, t);
        self.names.insert(id, n);
        Ok(())
    }

    fn render_convert(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let (op, ty) = (node.op, node.ty);
        let Some(c) = node.child(0) else {
            bail_fatal!(Some(id), "conversion without an operand");
        };
        let from = self.method.node(c).ty;
        let v = self.value(c)?;
        // Same-width integer conversions are no-ops.
        if op != Opcode::BitsCast && from == ty {
            self.names.insert(id, v);
            return Ok(());
        }
        if op != Opcode::BitsCast && from.is_integral() && ty.is_integral() && from.size() == ty.size() {
            self.names.insert(id, v);
            return Ok(());
        }
        let mn = mnemonic(op, ty, from)
            .ok_or_else(|| err_invalid!(id, "no conversion from {} to {}", from, ty))?;
        let tf = self.ty(from, c)?;
        let tt = self.ty(ty, id)?;
        let n = self.fresh();
        ir!(self.body, "  {} = {} {} {} to {}", n, mn, tf, v, tt);
        self.names.insert(id, n);
        Ok(())
    }

    // =========================================================================
    // Exception checks
    // =========================================================================

    fn render_null_check(&mut self, id: NodeId) -> Result<()> {
        let Some(reference) = self.method.node(id).child(0) else {
            bail_fatal!(Some(id), "null check without a reference");
        };
        let r = self.value(reference)?;
        self.names.insert(id, r.clone());
        if self.options.disable_exception_checks
            || self.is_shared_ref(reference)
            || self.eliminated.contains(&id)
        {
            return Ok(());
        }
        self.need_null = true;
        let test = self.fresh();
        let ok = self.fresh_label("NullCheckOK");
        ir!(self.body, "  {} = icmp eq i8* {}, null", test, r);
        ir!(self.body, "  br i1 {}, label %NullException, label %{}", test, ok);
        ir!(self.body, "{}:", ok);
        Ok(())
    }

    /// Children are the array length and the index.
    fn render_bound_check(&mut self, id: NodeId) -> Result<()> {
        let node = self.method.node(id);
        let (Some(length), Some(index)) = (node.child(0), node.child(1)) else {
            bail_fatal!(Some(id), "bound check needs a length and an index");
        };
        let len = self.value(length)?;
        let idx = self.value(index)?;
        let len_node = self.method.node(length);
        let shared = len_node.op == Opcode::ArrayLength
            && len_node.child(0).is_some_and(|a| self.is_shared_ref(a));
        if self.options.disable_exception_checks || shared {
            return Ok(());
        }
        self.need_bnd = true;
        let t = self.ty(self.method.node(index).ty, index)?;
        let test = self.fresh();
        let ok = self.fresh_label("BndCheckOK");
        ir!(self.body, "  {} = icmp ult {} {}, {}", test, t, idx, len);
        ir!(self.body, "  br i1 {}, label %{}, label %BndException", test, ok);
        ir!(self.body, "{}:", ok);
        Ok(())
    }

    fn render_div_check(&mut self, id: NodeId) -> Result<()> {
        let Some(divisor) = self.method.node(id).child(0) else {
            bail_fatal!(Some(id), "divide check without a divisor");
        };
        let d = self.value(divisor)?;
        if self.options.disable_exception_checks {
            return Ok(());
        }
        self.need_div = true;
        let t = self.ty(self.method.node(divisor).ty, divisor)?;
        let test = self.fresh();
        let ok = self.fresh_label("DivCheckOK");
        ir!(self.body, "  {} = icmp eq {} {}, 0", test, t, d);
        ir!(self.body, "  br i1 {}, label %DivException, label %{}", test, ok);
        ir!(self.body, "{}:", ok);
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn render_call(&mut self, id: NodeId) -> Result<()> {
        let method = self.method;
        let node = method.node(id);
        let Some(sym) = node.symbol else {
            bail_fatal!(Some(id), "call without a target");
        };
        let callee = method.symbol(sym);
        let Some(recognized) = callee.recognized else {
            bail_invalid!(id, "call to unrecognized method {}", callee.name);
        };

        if let Some(reg) = intrinsics::sreg_name(recognized) {
            let n = self.fresh();
            ir!(self.body, "  {} = call i32 @{}()", n, reg);
            self.names.insert(id, n);
            return Ok(());
        }
        if recognized == Recognized::SyncThreads {
            ir!(self.body, "  call void @llvm.nvvm.barrier0()");
            return Ok(());
        }
        if let Some((name, ty)) = intrinsics::math_builtin(recognized) {
            if !self.options.enable_math {
                bail_invalid!(id, "math intrinsic {} is not enabled", callee.name);
            }
            let Some(arg) = node.child(0) else {
                bail_fatal!(Some(id), "{} needs an argument", callee.name);
            };
            let v = self.value(arg)?;
            let t = self.ty(ty, id)?;
            let n = self.fresh();
            ir!(self.body, "  {} = call {} @{}({} {})", n, t, name, t, v);
            self.names.insert(id, n);
            return Ok(());
        }
        bail_invalid!(id, "call to {} cannot run on the GPU", callee.name)
    }
}

/// NVVM spells floating-point literals as the hex bits of the double.
fn hex_float(v: f64) -> String {
    format!("0x{:016X}", v.to_bits())
}
