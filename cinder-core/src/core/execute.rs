use super::{Core, ExecutionResult, Halt};
use crate::bus::AccessWidth;
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, CsrSource, Instruction, LoadWidth, MulDivOp, RegImmOp,
    RegRegOp, RegShiftImmOp, StoreWidth,
};
use crate::registers::Specifier;
use crate::system_bus::SystemBus;

/// Executes one decoded instruction against the core and the fabric.
///
/// `step_len` is the encoded length of the instruction (2 for expanded
/// compressed forms, 4 otherwise); it determines the fall-through program
/// counter and the link value of jumps, so a rewritten 16-bit instruction
/// keeps its 16-bit advance.
#[derive(Debug)]
pub(super) struct Executor<'a> {
    pub core: &'a mut Core,
    pub bus: &'a mut SystemBus,
    pub step_len: u32,
}

impl Executor<'_> {
    pub fn execute(mut self, instruction: Instruction) -> ExecutionResult {
        use Instruction::*;
        match instruction {
            OpImm {
                op,
                dest,
                src,
                immediate,
            } => self.op_imm(op, dest, src, immediate),
            OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => self.op_shift_imm(op, dest, src, shift_amount_u5),
            Lui { dest, immediate } => self.lui(dest, immediate),
            Auipc { dest, immediate } => self.auipc(dest, immediate),
            Op {
                op,
                dest,
                src1,
                src2,
            } => self.op(op, dest, src1, src2),
            MulDiv {
                op,
                dest,
                src1,
                src2,
            } => self.mul_div(op, dest, src1, src2),
            Jal { dest, offset } => self.jal(dest, offset),
            Jalr { dest, base, offset } => self.jalr(dest, base, offset),
            Branch {
                condition,
                src1,
                src2,
                offset,
            } => self.branch(condition, src1, src2, offset),
            Load {
                width,
                dest,
                base,
                offset,
            } => self.load(width, dest, base, offset),
            Store {
                width,
                src,
                base,
                offset,
            } => self.store(width, src, base, offset),
            Amo {
                op,
                dest,
                addr,
                src,
            } => self.amo(op, dest, addr, src),
            // Fences order memory accesses across harts; with a single hart
            // they retire with no further effect.
            Fence | FenceI => {
                self.increment_pc();
                Ok(())
            }
            Ecall => self.ecall(),
            Ebreak => Err(Halt::Break {
                pc: self.core.registers.pc(),
            }),
            Csr {
                op,
                dest,
                csr,
                src,
            } => self.csr_op(op, dest, csr, src),
        }
    }

    fn op_imm(
        &mut self,
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    ) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| match op {
            RegImmOp::Addi => s.wrapping_add_signed(imm),
            RegImmOp::Slti => u32::from((s as i32) < imm),
            RegImmOp::Sltiu => u32::from(s < imm as u32),
            RegImmOp::Xori => s ^ imm as u32,
            RegImmOp::Ori => s | imm as u32,
            RegImmOp::Andi => s & imm as u32,
        })
    }

    fn op_shift_imm(
        &mut self,
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    ) -> ExecutionResult {
        debug_assert!(shift_amount_u5 < 32);
        self.reg_imm_op(dest, src, 0, |s, _| match op {
            RegShiftImmOp::Slli => s << shift_amount_u5,
            RegShiftImmOp::Srli => s >> shift_amount_u5,
            RegShiftImmOp::Srai => ((s as i32) >> shift_amount_u5) as u32,
        })
    }

    /// The low 12 bits of a U-immediate are zero by decoding, so `lui` just
    /// writes the immediate.
    fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        self.core.registers.set_x(dest, immediate as u32);
        self.increment_pc();
        Ok(())
    }

    fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let result = self.core.registers.pc().wrapping_add_signed(immediate);
        self.core.registers.set_x(dest, result);
        self.increment_pc();
        Ok(())
    }

    fn op(
        &mut self,
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        // Register-sourced shift amounts take the low 5 bits of rs2.
        self.reg_reg_op(dest, src1, src2, |s1, s2| match op {
            RegRegOp::Add => s1.wrapping_add(s2),
            RegRegOp::Sub => s1.wrapping_sub(s2),
            RegRegOp::Sll => s1 << (s2 & 0x1F),
            RegRegOp::Slt => u32::from((s1 as i32) < (s2 as i32)),
            RegRegOp::Sltu => u32::from(s1 < s2),
            RegRegOp::Xor => s1 ^ s2,
            RegRegOp::Srl => s1 >> (s2 & 0x1F),
            RegRegOp::Sra => ((s1 as i32) >> (s2 & 0x1F)) as u32,
            RegRegOp::Or => s1 | s2,
            RegRegOp::And => s1 & s2,
        })
    }

    /// Multiply/divide never traps. Division by zero returns all-ones for
    /// quotients and the dividend for remainders; the most-negative value
    /// divided by minus one returns the most-negative value (quotient) or
    /// zero (remainder). Guest compilers assume exactly these results.
    fn mul_div(
        &mut self,
        op: MulDivOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| match op {
            MulDivOp::Mul => s1.wrapping_mul(s2),
            MulDivOp::Mulh => ((i64::from(s1 as i32) * i64::from(s2 as i32)) >> 32) as u32,
            MulDivOp::Mulhsu => ((i64::from(s1 as i32) * s2 as i64) >> 32) as u32,
            MulDivOp::Mulhu => ((u64::from(s1) * u64::from(s2)) >> 32) as u32,
            MulDivOp::Div => {
                if s2 == 0 {
                    u32::MAX
                } else if s1 as i32 == i32::MIN && s2 as i32 == -1 {
                    s1
                } else {
                    ((s1 as i32) / (s2 as i32)) as u32
                }
            }
            MulDivOp::Divu => {
                if s2 == 0 {
                    u32::MAX
                } else {
                    s1 / s2
                }
            }
            MulDivOp::Rem => {
                if s2 == 0 {
                    s1
                } else if s1 as i32 == i32::MIN && s2 as i32 == -1 {
                    0
                } else {
                    ((s1 as i32) % (s2 as i32)) as u32
                }
            }
            MulDivOp::Remu => {
                if s2 == 0 {
                    s1
                } else {
                    s1 % s2
                }
            }
        })
    }

    fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| registers.pc().wrapping_add_signed(offset))
    }

    /// The indirect jump clears bit 0 of the computed target.
    fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| {
            registers.x(base).wrapping_add_signed(offset) & !1
        })
    }

    fn branch(
        &mut self,
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| match condition {
            BranchCondition::Beq => s1 == s2,
            BranchCondition::Bne => s1 != s2,
            BranchCondition::Blt => (s1 as i32) < (s2 as i32),
            BranchCondition::Bge => (s1 as i32) >= (s2 as i32),
            BranchCondition::Bltu => s1 < s2,
            BranchCondition::Bgeu => s1 >= s2,
        })
    }

    fn load(
        &mut self,
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        let address = self.core.registers.x(base).wrapping_add_signed(offset);
        let value = match width {
            LoadWidth::Lb => self.read(address, AccessWidth::Byte)? as i8 as u32,
            LoadWidth::Lbu => self.read(address, AccessWidth::Byte)?,
            LoadWidth::Lh => self.read(address, AccessWidth::Halfword)? as i16 as u32,
            LoadWidth::Lhu => self.read(address, AccessWidth::Halfword)?,
            LoadWidth::Lw => self.read(address, AccessWidth::Word)?,
        };
        self.core.registers.set_x(dest, value);
        self.increment_pc();
        Ok(())
    }

    fn store(
        &mut self,
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        let address = self.core.registers.x(base).wrapping_add_signed(offset);
        let value = self.core.registers.x(src);
        let width = match width {
            StoreWidth::Sb => AccessWidth::Byte,
            StoreWidth::Sh => AccessWidth::Halfword,
            StoreWidth::Sw => AccessWidth::Word,
        };
        self.write(address, value, width)?;
        self.increment_pc();
        Ok(())
    }

    /// Word atomics. Load-reserved records the accessed address;
    /// store-conditional succeeds only while that reservation is intact and
    /// clears it either way. The read-modify-write forms return the
    /// pre-image of the memory word.
    fn amo(
        &mut self,
        op: AmoOp,
        dest: Specifier,
        addr: Specifier,
        src: Specifier,
    ) -> ExecutionResult {
        let address = self.core.registers.x(addr);
        match op {
            AmoOp::Lr => {
                let value = self.read(address, AccessWidth::Word)?;
                self.core.reservation = Some(address);
                self.core.registers.set_x(dest, value);
            }
            AmoOp::Sc => {
                if self.core.reservation == Some(address) {
                    let value = self.core.registers.x(src);
                    self.write(address, value, AccessWidth::Word)?;
                    self.core.registers.set_x(dest, 0);
                } else {
                    self.core.registers.set_x(dest, 1);
                }
                self.core.reservation = None;
            }
            _ => {
                let old = self.read(address, AccessWidth::Word)?;
                let rhs = self.core.registers.x(src);
                let new = match op {
                    AmoOp::Swap => rhs,
                    AmoOp::Add => old.wrapping_add(rhs),
                    AmoOp::Xor => old ^ rhs,
                    AmoOp::Or => old | rhs,
                    AmoOp::And => old & rhs,
                    AmoOp::Min => (old as i32).min(rhs as i32) as u32,
                    AmoOp::Max => (old as i32).max(rhs as i32) as u32,
                    AmoOp::Minu => old.min(rhs),
                    AmoOp::Maxu => old.max(rhs),
                    AmoOp::Lr | AmoOp::Sc => unreachable!(),
                };
                self.write(address, new, AccessWidth::Word)?;
                self.core.registers.set_x(dest, old);
            }
        }
        self.increment_pc();
        Ok(())
    }

    fn ecall(&mut self) -> ExecutionResult {
        self.core.environment_call(self.bus)?;
        self.increment_pc();
        Ok(())
    }

    /// CSR accesses follow the gated-write rule: a write only happens for
    /// the read-write form, or when the set/clear mask comes from a
    /// register other than `x0` / a non-zero immediate. The destination
    /// always receives the pre-write value (discarded for `x0`).
    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: u16,
        src: CsrSource,
    ) -> ExecutionResult {
        let src_value = match src {
            CsrSource::Register(reg) => (op == CsrOp::ReadWrite || reg != Specifier::X0)
                .then(|| self.core.registers.x(reg)),
            CsrSource::Immediate(imm) => (op == CsrOp::ReadWrite || imm != 0).then_some(imm),
        };
        let old_value = self.core.read_csr(self.bus, csr);
        self.core.registers.set_x(dest, old_value);
        if let Some(src_value) = src_value {
            let new_value = match op {
                CsrOp::ReadWrite => src_value,
                CsrOp::ReadSet => old_value | src_value,
                CsrOp::ReadClear => old_value & !src_value,
            };
            self.core.write_csr(csr, new_value);
        }
        self.increment_pc();
        Ok(())
    }

    // Private generic implementations

    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, i32) -> u32,
    {
        let registers = &mut self.core.registers;
        registers.set_x(dest, op(registers.x(src), immediate));
        self.increment_pc();
        Ok(())
    }

    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = &mut self.core.registers;
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        self.increment_pc();
        Ok(())
    }

    fn jump_op<F>(&mut self, dest: Specifier, compute_target: F) -> ExecutionResult
    where
        F: FnOnce(&crate::registers::Registers) -> u32,
    {
        let registers = &mut self.core.registers;
        let new_pc = compute_target(registers);
        let link = registers.pc().wrapping_add(self.step_len);
        *registers.pc_mut() = new_pc;
        registers.set_x(dest, link);
        Ok(())
    }

    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u32, u32) -> bool,
    {
        let registers = &mut self.core.registers;
        if predicate(registers.x(src1), registers.x(src2)) {
            let new_pc = registers.pc().wrapping_add_signed(offset);
            *registers.pc_mut() = new_pc;
        } else {
            self.increment_pc();
        }
        Ok(())
    }

    fn read(&mut self, address: u32, width: AccessWidth) -> Result<u32, Halt> {
        self.bus.read(address, width).map_err(|_| Halt::AccessFault {
            pc: self.core.registers.pc(),
            address,
        })
    }

    fn write(&mut self, address: u32, value: u32, width: AccessWidth) -> Result<(), Halt> {
        self.bus
            .write(address, value, width)
            .map_err(|_| Halt::AccessFault {
                pc: self.core.registers.pc(),
                address,
            })?;
        self.core.note_store(address, width.size());
        Ok(())
    }

    fn increment_pc(&mut self) {
        let pc = self.core.registers.pc_mut();
        *pc = pc.wrapping_add(self.step_len);
    }
}
