//! IL code streams: ordered instruction buffers with label bindings.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::fmt;

use super::eh::{ClauseBuilder, FinishedClause};
use super::opcode::{OperandKind, Opcode, StackEffect};
use super::StreamContext;

// ─── StreamKind ────────────────────────────────────────────

/// Role of a code stream.  Streams are concatenated in creation order, not
/// in the order of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamKind {
    /// Argument validation and local initialization.
    Setup,
    /// Converting arguments to their native form.
    Marshal,
    /// The call itself.
    Dispatch,
    /// Converting the return value back.
    ReturnUnmarshal,
    /// Converting by-ref arguments back.
    Unmarshal,
    /// Cleanup that runs only when an exception escapes.
    ExceptionCleanup,
    /// Cleanup that always runs.
    Cleanup,
    /// Catch/fault handler bodies.
    ExceptionHandler,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Setup => "setup",
            StreamKind::Marshal => "marshal",
            StreamKind::Dispatch => "dispatch",
            StreamKind::ReturnUnmarshal => "return-unmarshal",
            StreamKind::Unmarshal => "unmarshal",
            StreamKind::ExceptionCleanup => "exception-cleanup",
            StreamKind::Cleanup => "cleanup",
            StreamKind::ExceptionHandler => "exception-handler",
        };
        f.write_str(name)
    }
}

// ─── Labels and instructions ───────────────────────────────

/// A position in the concatenated IL of one [`IlStubLinker`](super::IlStubLinker).
///
/// Labels are allocated by the linker or any of its streams, bound once with
/// [`IlCodeStream::emit_label`], and may be targeted from any stream.  A
/// handle from another linker is rejected even when its id is in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IlCodeLabel(pub(crate) u32, pub(crate) u32);

impl IlCodeLabel {
    /// Numeric id, unique within its linker.
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Inline argument of an [`IlInstruction`].
#[derive(Debug, Clone, PartialEq)]
pub enum IlArg {
    /// No argument.
    None,
    /// 32-bit integer constant.
    I32(i32),
    /// 64-bit integer constant.
    I64(i64),
    /// 32-bit float, as raw bits.
    F32(u32),
    /// 64-bit float, as raw bits.
    F64(u64),
    /// Metadata token.
    Token(u32),
    /// Argument or local slot (or the alignment of `unaligned.`).
    Index(u16),
    /// Branch target.
    Label(IlCodeLabel),
    /// `switch` targets.
    Switch(Vec<IlCodeLabel>),
}

impl IlArg {
    /// Numeric payload, for writing fixed-size operands.
    pub(crate) fn raw(&self) -> i64 {
        match *self {
            IlArg::I32(v) => v as i64,
            IlArg::I64(v) => v,
            IlArg::F32(bits) => bits as i64,
            IlArg::F64(bits) => bits as i64,
            IlArg::Token(t) => t as i64,
            IlArg::Index(i) => i as i64,
            IlArg::None | IlArg::Label(_) | IlArg::Switch(_) => 0,
        }
    }

    /// Labels this argument refers to.
    pub(crate) fn targets(&self) -> &[IlCodeLabel] {
        match self {
            IlArg::Label(label) => core::slice::from_ref(label),
            IlArg::Switch(labels) => labels,
            _ => &[],
        }
    }
}

/// One emitted instruction, before lowering.
#[derive(Debug, Clone, PartialEq)]
pub struct IlInstruction {
    /// Opcode as emitted (long forms for indices, constants and branches).
    pub opcode: Opcode,
    /// Net change of the operand stack depth.
    pub stack_delta: i32,
    /// Inline argument.
    pub arg: IlArg,
}

const LDC_I4_SMALL: [Opcode; 9] = [
    Opcode::LdcI4_0,
    Opcode::LdcI4_1,
    Opcode::LdcI4_2,
    Opcode::LdcI4_3,
    Opcode::LdcI4_4,
    Opcode::LdcI4_5,
    Opcode::LdcI4_6,
    Opcode::LdcI4_7,
    Opcode::LdcI4_8,
];

impl IlInstruction {
    /// The smallest opcode equivalent to this instruction.
    ///
    /// Integer constants, argument and local accesses pick their fixed-index
    /// or short forms.  Branches are left alone.
    pub fn lowered(&self) -> Opcode {
        /// Fixed-index form for 0..=3, short form for one-byte indices.
        fn by_index(index: u16, fixed: Option<[Opcode; 4]>, short: Opcode, long: Opcode) -> Opcode {
            match (fixed, index) {
                (Some(table), 0..=3) => table[index as usize],
                (_, 0..=255) => short,
                _ => long,
            }
        }

        match (self.opcode, &self.arg) {
            (Opcode::LdcI4, &IlArg::I32(v)) => match v {
                -1 => Opcode::LdcI4M1,
                0..=8 => LDC_I4_SMALL[v as usize],
                v if i8::try_from(v).is_ok() => Opcode::LdcI4S,
                _ => Opcode::LdcI4,
            },
            (Opcode::Ldarg, &IlArg::Index(i)) => by_index(
                i,
                Some([Opcode::Ldarg0, Opcode::Ldarg1, Opcode::Ldarg2, Opcode::Ldarg3]),
                Opcode::LdargS,
                Opcode::Ldarg,
            ),
            (Opcode::Ldloc, &IlArg::Index(i)) => by_index(
                i,
                Some([Opcode::Ldloc0, Opcode::Ldloc1, Opcode::Ldloc2, Opcode::Ldloc3]),
                Opcode::LdlocS,
                Opcode::Ldloc,
            ),
            (Opcode::Stloc, &IlArg::Index(i)) => by_index(
                i,
                Some([Opcode::Stloc0, Opcode::Stloc1, Opcode::Stloc2, Opcode::Stloc3]),
                Opcode::StlocS,
                Opcode::Stloc,
            ),
            (Opcode::Ldarga, &IlArg::Index(i)) => by_index(i, None, Opcode::LdargaS, Opcode::Ldarga),
            (Opcode::Starg, &IlArg::Index(i)) => by_index(i, None, Opcode::StargS, Opcode::Starg),
            (Opcode::Ldloca, &IlArg::Index(i)) => by_index(i, None, Opcode::LdlocaS, Opcode::Ldloca),
            (op, _) => op,
        }
    }
}

/// An entry of a stream: an instruction, or a label binding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamItem {
    Instruction(IlInstruction),
    /// Binds `label` here.  A catch handler's entry carries `+1` for the
    /// exception object the runtime pushes.
    Label {
        label: IlCodeLabel,
        stack_delta: i32,
    },
}

// ─── IlCodeStream ──────────────────────────────────────────

/// One named, ordered instruction buffer.
///
/// Obtained from [`IlStubLinker::stream`](super::IlStubLinker::stream).
/// Emit methods return `&mut Self` so calls chain.
///
/// # Panics
///
/// Every emit method panics once the owning linker has been linked.
pub struct IlCodeStream {
    pub(super) kind: StreamKind,
    pub(super) ctx: Rc<StreamContext>,
    pub(super) items: Vec<StreamItem>,
    /// Open exception clauses, innermost last.
    pub(super) open: Vec<ClauseBuilder>,
    /// Finished clauses, innermost first.
    pub(super) finished: Vec<FinishedClause>,
}

impl fmt::Debug for IlCodeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IlCodeStream")
            .field("kind", &self.kind)
            .field("items", &self.items.len())
            .field("open_clauses", &self.open.len())
            .field("finished_clauses", &self.finished.len())
            .finish()
    }
}

macro_rules! simple_emitters {
    ($( $fn_name:ident => $op:ident; )*) => {
        $(
            #[doc = concat!("Emit `", stringify!($op), "`.")]
            pub fn $fn_name(&mut self) -> &mut Self {
                self.emit(Opcode::$op)
            }
        )*
    };
}

macro_rules! token_emitters {
    ($( $fn_name:ident => $op:ident; )*) => {
        $(
            #[doc = concat!("Emit `", stringify!($op), "` with a metadata token.")]
            pub fn $fn_name(&mut self, token: u32) -> &mut Self {
                self.emit_token(Opcode::$op, token)
            }
        )*
    };
}

macro_rules! branch_emitters {
    ($( $fn_name:ident => $op:ident; )*) => {
        $(
            #[doc = concat!("Emit `", stringify!($op), "` to `target`.")]
            pub fn $fn_name(&mut self, target: IlCodeLabel) -> &mut Self {
                self.emit_branch(Opcode::$op, target)
            }
        )*
    };
}

impl IlCodeStream {
    pub(super) fn new(kind: StreamKind, ctx: Rc<StreamContext>) -> Self {
        Self {
            kind,
            ctx,
            items: Vec::new(),
            open: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Role of this stream.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Instructions emitted so far (label bindings excluded).
    pub fn instructions(&self) -> impl Iterator<Item = &IlInstruction> {
        self.items.iter().filter_map(|item| match item {
            StreamItem::Instruction(ins) => Some(ins),
            StreamItem::Label { .. } => None,
        })
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.instructions().count()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Net stack change of everything emitted so far.
    pub fn stack_delta(&self) -> i64 {
        self.items
            .iter()
            .map(|item| match item {
                StreamItem::Instruction(ins) => i64::from(ins.stack_delta),
                StreamItem::Label { stack_delta, .. } => i64::from(*stack_delta),
            })
            .sum()
    }

    /// Discard every instruction, label binding and exception clause.
    pub fn clear_code(&mut self) {
        self.assert_building();
        log::trace!("IlCodeStream({}): clear {} item(s)", self.kind, self.items.len());
        self.items.clear();
        self.open.clear();
        self.finished.clear();
    }

    // ── labels ─────────────────────────────────────────────

    /// Allocate an unbound label.
    pub fn new_code_label(&self) -> IlCodeLabel {
        self.ctx.new_label()
    }

    /// Bind `label` to the current position.  Binding a label twice is
    /// reported by [`IlStubLinker::link`](super::IlStubLinker::link).
    pub fn emit_label(&mut self, label: IlCodeLabel) -> &mut Self {
        self.bind(label, 0)
    }

    pub(super) fn bind(&mut self, label: IlCodeLabel, stack_delta: i32) -> &mut Self {
        self.assert_building();
        self.items.push(StreamItem::Label { label, stack_delta });
        self
    }

    // ── generic emitters ───────────────────────────────────

    fn push(&mut self, opcode: Opcode, stack_delta: i32, arg: IlArg) -> &mut Self {
        self.assert_building();
        self.items.push(StreamItem::Instruction(IlInstruction {
            opcode,
            stack_delta,
            arg,
        }));
        self
    }

    fn assert_building(&self) {
        assert!(
            !self.ctx.is_linked(),
            "IlCodeStream({}): emit after link",
            self.kind
        );
    }

    fn static_delta(opcode: Opcode) -> i32 {
        match opcode.stack() {
            StackEffect::Fixed { pop, push } => i32::from(push) - i32::from(pop),
            StackEffect::Variable => panic!("{} needs an explicit stack delta", opcode),
        }
    }

    /// Emit an opcode without an operand.
    ///
    /// # Panics
    ///
    /// Panics if `opcode` takes an operand or has a signature-dependent
    /// stack effect (use the dedicated emitters for those).
    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        assert_eq!(
            opcode.operand(),
            OperandKind::None,
            "{} takes an operand",
            opcode
        );
        let delta = Self::static_delta(opcode);
        self.push(opcode, delta, IlArg::None)
    }

    /// Emit an opcode taking a metadata token.
    ///
    /// # Panics
    ///
    /// Panics if `opcode` does not take a token or is a call.
    pub fn emit_token(&mut self, opcode: Opcode, token: u32) -> &mut Self {
        assert_eq!(
            opcode.operand(),
            OperandKind::Token,
            "{} does not take a token",
            opcode
        );
        let delta = Self::static_delta(opcode);
        self.push(opcode, delta, IlArg::Token(token))
    }

    /// Emit a branch.  Short forms are accepted and stored as their long
    /// form; the linker picks the final width.
    ///
    /// # Panics
    ///
    /// Panics if `opcode` is not a single-target branch.
    pub fn emit_branch(&mut self, opcode: Opcode, target: IlCodeLabel) -> &mut Self {
        let long = opcode
            .long_form()
            .unwrap_or_else(|| panic!("{} is not a branch", opcode));
        let delta = Self::static_delta(long);
        self.push(long, delta, IlArg::Label(target))
    }

    // ── constants ──────────────────────────────────────────

    /// Load a 32-bit integer constant.
    pub fn emit_ldc(&mut self, value: i32) -> &mut Self {
        self.push(Opcode::LdcI4, 1, IlArg::I32(value))
    }

    /// Load a 64-bit integer constant.
    pub fn emit_ldc_i8(&mut self, value: i64) -> &mut Self {
        self.push(Opcode::LdcI8, 1, IlArg::I64(value))
    }

    /// Load a 32-bit float constant.
    pub fn emit_ldc_r4(&mut self, value: f32) -> &mut Self {
        self.push(Opcode::LdcR4, 1, IlArg::F32(value.to_bits()))
    }

    /// Load a 64-bit float constant.  NaN payloads are kept bit-exact.
    pub fn emit_ldc_r8(&mut self, value: f64) -> &mut Self {
        self.push(Opcode::LdcR8, 1, IlArg::F64(value.to_bits()))
    }

    // ── arguments and locals ───────────────────────────────

    /// Argument slot for a declared argument index.
    fn arg_slot(&self, index: u16) -> u16 {
        if self.ctx.options.has_this {
            index
                .checked_add(1)
                .unwrap_or_else(|| panic!("argument index {} out of range", index))
        } else {
            index
        }
    }

    /// Load argument `index` (not counting `this`).
    pub fn emit_ldarg(&mut self, index: u16) -> &mut Self {
        let slot = self.arg_slot(index);
        self.push(Opcode::Ldarg, 1, IlArg::Index(slot))
    }

    /// Load the address of argument `index` (not counting `this`).
    pub fn emit_ldarga(&mut self, index: u16) -> &mut Self {
        let slot = self.arg_slot(index);
        self.push(Opcode::Ldarga, 1, IlArg::Index(slot))
    }

    /// Store into argument `index` (not counting `this`).
    pub fn emit_starg(&mut self, index: u16) -> &mut Self {
        let slot = self.arg_slot(index);
        self.push(Opcode::Starg, -1, IlArg::Index(slot))
    }

    /// Load the `this` argument.
    ///
    /// # Panics
    ///
    /// Panics unless the linker was created with `has_this`.
    pub fn emit_load_this(&mut self) -> &mut Self {
        assert!(self.ctx.options.has_this, "stub has no `this` argument");
        self.push(Opcode::Ldarg, 1, IlArg::Index(0))
    }

    /// Load local `index`.
    pub fn emit_ldloc(&mut self, index: u16) -> &mut Self {
        self.push(Opcode::Ldloc, 1, IlArg::Index(index))
    }

    /// Load the address of local `index`.
    pub fn emit_ldloca(&mut self, index: u16) -> &mut Self {
        self.push(Opcode::Ldloca, 1, IlArg::Index(index))
    }

    /// Store into local `index`.
    pub fn emit_stloc(&mut self, index: u16) -> &mut Self {
        self.push(Opcode::Stloc, -1, IlArg::Index(index))
    }

    // ── calls ──────────────────────────────────────────────

    /// `call` a method taking `num_args` stack arguments (including `this`)
    /// and returning `num_rets` values (0 or 1).
    pub fn emit_call(&mut self, token: u32, num_args: u16, num_rets: u16) -> &mut Self {
        let delta = i32::from(num_rets) - i32::from(num_args);
        self.push(Opcode::Call, delta, IlArg::Token(token))
    }

    /// `callvirt`; see [`IlCodeStream::emit_call`].
    pub fn emit_callvirt(&mut self, token: u32, num_args: u16, num_rets: u16) -> &mut Self {
        let delta = i32::from(num_rets) - i32::from(num_args);
        self.push(Opcode::Callvirt, delta, IlArg::Token(token))
    }

    /// `calli` through the function pointer on top of the stack; `token`
    /// is a stand-alone signature.
    pub fn emit_calli(&mut self, token: u32, num_args: u16, num_rets: u16) -> &mut Self {
        let delta = i32::from(num_rets) - i32::from(num_args) - 1;
        self.push(Opcode::Calli, delta, IlArg::Token(token))
    }

    /// `newobj` with a constructor taking `num_args` arguments (excluding
    /// the object being created).
    pub fn emit_newobj(&mut self, token: u32, num_args: u16) -> &mut Self {
        let delta = 1 - i32::from(num_args);
        self.push(Opcode::Newobj, delta, IlArg::Token(token))
    }

    /// `jmp` to a method with the same signature.
    pub fn emit_jmp(&mut self, token: u32) -> &mut Self {
        self.push(Opcode::Jmp, 0, IlArg::Token(token))
    }

    /// `ret`; pops the return value if the stub returns one.
    pub fn emit_ret(&mut self) -> &mut Self {
        let delta = if self.ctx.options.returns_value { -1 } else { 0 };
        self.push(Opcode::Ret, delta, IlArg::None)
    }

    // ── control flow ───────────────────────────────────────

    /// `switch` over `targets`; falls through when out of range.
    pub fn emit_switch(&mut self, targets: &[IlCodeLabel]) -> &mut Self {
        self.push(Opcode::Switch, -1, IlArg::Switch(targets.to_vec()))
    }

    /// `unaligned.` prefix.
    pub fn emit_unaligned(&mut self, alignment: u8) -> &mut Self {
        self.push(Opcode::Unaligned, 0, IlArg::Index(alignment as u16))
    }

    branch_emitters! {
        emit_br => Br;
        emit_brfalse => Brfalse;
        emit_brtrue => Brtrue;
        emit_beq => Beq;
        emit_bge => Bge;
        emit_bge_un => BgeUn;
        emit_bgt => Bgt;
        emit_bgt_un => BgtUn;
        emit_ble => Ble;
        emit_ble_un => BleUn;
        emit_blt => Blt;
        emit_blt_un => BltUn;
        emit_bne_un => BneUn;
        emit_leave => Leave;
    }

    simple_emitters! {
        emit_nop => Nop;
        emit_break => Break;
        emit_ldnull => Ldnull;
        emit_dup => Dup;
        emit_pop => Pop;
        emit_add => Add;
        emit_add_ovf => AddOvf;
        emit_sub => Sub;
        emit_mul => Mul;
        emit_div => Div;
        emit_rem => Rem;
        emit_and => And;
        emit_or => Or;
        emit_xor => Xor;
        emit_shl => Shl;
        emit_shr => Shr;
        emit_shr_un => ShrUn;
        emit_neg => Neg;
        emit_not => Not;
        emit_ceq => Ceq;
        emit_cgt => Cgt;
        emit_cgt_un => CgtUn;
        emit_clt => Clt;
        emit_clt_un => CltUn;
        emit_conv_i => ConvI;
        emit_conv_i1 => ConvI1;
        emit_conv_i2 => ConvI2;
        emit_conv_i4 => ConvI4;
        emit_conv_i8 => ConvI8;
        emit_conv_u => ConvU;
        emit_conv_u1 => ConvU1;
        emit_conv_u2 => ConvU2;
        emit_conv_u4 => ConvU4;
        emit_conv_u8 => ConvU8;
        emit_conv_r4 => ConvR4;
        emit_conv_r8 => ConvR8;
        emit_conv_ovf_i4 => ConvOvfI4;
        emit_conv_ovf_u => ConvOvfU;
        emit_ldind_i => LdindI;
        emit_ldind_i1 => LdindI1;
        emit_ldind_i2 => LdindI2;
        emit_ldind_i4 => LdindI4;
        emit_ldind_i8 => LdindI8;
        emit_ldind_u1 => LdindU1;
        emit_ldind_u2 => LdindU2;
        emit_ldind_u4 => LdindU4;
        emit_ldind_r4 => LdindR4;
        emit_ldind_r8 => LdindR8;
        emit_ldind_ref => LdindRef;
        emit_stind_i => StindI;
        emit_stind_i1 => StindI1;
        emit_stind_i2 => StindI2;
        emit_stind_i4 => StindI4;
        emit_stind_i8 => StindI8;
        emit_stind_r4 => StindR4;
        emit_stind_r8 => StindR8;
        emit_stind_ref => StindRef;
        emit_ldlen => Ldlen;
        emit_ldelem_ref => LdelemRef;
        emit_stelem_ref => StelemRef;
        emit_localloc => Localloc;
        emit_cpblk => Cpblk;
        emit_initblk => Initblk;
        emit_arglist => Arglist;
        emit_throw => Throw;
        emit_rethrow => Rethrow;
        emit_endfinally => Endfinally;
    }

    token_emitters! {
        emit_box => Box;
        emit_unbox => Unbox;
        emit_unbox_any => UnboxAny;
        emit_castclass => Castclass;
        emit_isinst => Isinst;
        emit_cpobj => Cpobj;
        emit_initobj => Initobj;
        emit_ldobj => Ldobj;
        emit_stobj => Stobj;
        emit_ldfld => Ldfld;
        emit_ldflda => Ldflda;
        emit_stfld => Stfld;
        emit_ldsfld => Ldsfld;
        emit_ldsflda => Ldsflda;
        emit_stsfld => Stsfld;
        emit_ldstr => Ldstr;
        emit_ldtoken => Ldtoken;
        emit_ldftn => Ldftn;
        emit_ldvirtftn => Ldvirtftn;
        emit_newarr => Newarr;
        emit_ldelema => Ldelema;
        emit_ldelem => Ldelem;
        emit_stelem => Stelem;
        emit_sizeof => Sizeof;
        emit_mkrefany => Mkrefany;
        emit_refanyval => Refanyval;
        emit_constrained => Constrained;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(opcode: Opcode, arg: IlArg) -> IlInstruction {
        IlInstruction {
            opcode,
            stack_delta: 0,
            arg,
        }
    }

    #[test]
    fn ldc_lowering() {
        let cases = [
            (-1, Opcode::LdcI4M1),
            (0, Opcode::LdcI4_0),
            (5, Opcode::LdcI4_5),
            (8, Opcode::LdcI4_8),
            (9, Opcode::LdcI4S),
            (-128, Opcode::LdcI4S),
            (127, Opcode::LdcI4S),
            (128, Opcode::LdcI4),
            (-129, Opcode::LdcI4),
            (i32::MIN, Opcode::LdcI4),
        ];
        for (value, expected) in cases {
            assert_eq!(
                ins(Opcode::LdcI4, IlArg::I32(value)).lowered(),
                expected,
                "ldc {}",
                value
            );
        }
    }

    #[test]
    fn index_lowering() {
        assert_eq!(ins(Opcode::Ldarg, IlArg::Index(3)).lowered(), Opcode::Ldarg3);
        assert_eq!(ins(Opcode::Ldarg, IlArg::Index(4)).lowered(), Opcode::LdargS);
        assert_eq!(ins(Opcode::Ldarg, IlArg::Index(255)).lowered(), Opcode::LdargS);
        assert_eq!(ins(Opcode::Ldarg, IlArg::Index(256)).lowered(), Opcode::Ldarg);
        assert_eq!(ins(Opcode::Stloc, IlArg::Index(0)).lowered(), Opcode::Stloc0);
        assert_eq!(ins(Opcode::Ldloc, IlArg::Index(17)).lowered(), Opcode::LdlocS);
        // no fixed-index forms for address loads and stores to arguments
        assert_eq!(ins(Opcode::Ldarga, IlArg::Index(0)).lowered(), Opcode::LdargaS);
        assert_eq!(ins(Opcode::Starg, IlArg::Index(1000)).lowered(), Opcode::Starg);
        assert_eq!(ins(Opcode::Ldloca, IlArg::Index(2)).lowered(), Opcode::LdlocaS);
    }

    #[test]
    fn branches_are_not_lowered() {
        let br = ins(Opcode::Br, IlArg::Label(IlCodeLabel(0, 0)));
        assert_eq!(br.lowered(), Opcode::Br);
    }

    #[test]
    fn stream_kind_display() {
        assert_eq!(alloc::format!("{}", StreamKind::ReturnUnmarshal), "return-unmarshal");
        assert_eq!(alloc::format!("{}", StreamKind::Marshal), "marshal");
    }
}
