//! Textual assembly and disassembly.
//!
//! The disassembler renders from the decoded [`Instruction`] record, so it
//! stays in lockstep with what the executor accepts. The assembler is the
//! inverse on the canonical mnemonic set: for every word the disassembler
//! can render, feeding that text back through [`assemble`] reproduces the
//! word.
//!
//! Source format, line oriented:
//! - `;` starts a comment running to end of line;
//! - a line ending in `:` declares a label at the current address;
//! - every other non-empty line is `mnemonic op1, op2, ...`;
//! - registers accept numeric (`x0`..`x31`) and ABI (`zero`, `ra`, ...)
//!   names;
//! - immediates accept decimal, `0x` hex, `0b` binary, `0` octal, and a
//!   trailing `h`/`H` hex form;
//! - memory operands are written `imm(reg)`;
//! - branch and jump targets are a numeric byte offset or a label.
//!
//! Assembly is two-pass: labels are collected first (each non-label line
//! occupies 4 bytes), then every line encodes to one little-endian word.

use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, CsrSource, Instruction, LoadWidth, MulDivOp, RegImmOp,
    RegRegOp, RegShiftImmOp, StoreWidth,
};
use crate::registers::Specifier;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A line-level assembly failure. The machine state is never touched by a
/// failed assembly.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("line {line}: {message}")]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

/// Render a 32-bit instruction word as text. Words that do not decode
/// render as `illegal`.
pub fn disassemble(word: u32) -> String {
    match Instruction::decode(word) {
        Ok(instruction) => instruction.to_string(),
        Err(_) => "illegal".to_string(),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let mnemonic = match op {
                    RegImmOp::Addi => "addi",
                    RegImmOp::Slti => "slti",
                    RegImmOp::Sltiu => "sltiu",
                    RegImmOp::Xori => "xori",
                    RegImmOp::Ori => "ori",
                    RegImmOp::Andi => "andi",
                };
                write!(f, "{mnemonic} {dest}, {src}, {immediate}")
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let mnemonic = match op {
                    RegShiftImmOp::Slli => "slli",
                    RegShiftImmOp::Srli => "srli",
                    RegShiftImmOp::Srai => "srai",
                };
                write!(f, "{mnemonic} {dest}, {src}, {shift_amount_u5}")
            }
            Instruction::Lui { dest, immediate } => {
                write!(f, "lui {dest}, {:#x}", (immediate as u32) >> 12)
            }
            Instruction::Auipc { dest, immediate } => {
                write!(f, "auipc {dest}, {:#x}", (immediate as u32) >> 12)
            }
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let mnemonic = match op {
                    RegRegOp::Add => "add",
                    RegRegOp::Sub => "sub",
                    RegRegOp::Sll => "sll",
                    RegRegOp::Slt => "slt",
                    RegRegOp::Sltu => "sltu",
                    RegRegOp::Xor => "xor",
                    RegRegOp::Srl => "srl",
                    RegRegOp::Sra => "sra",
                    RegRegOp::Or => "or",
                    RegRegOp::And => "and",
                };
                write!(f, "{mnemonic} {dest}, {src1}, {src2}")
            }
            Instruction::MulDiv {
                op,
                dest,
                src1,
                src2,
            } => {
                let mnemonic = match op {
                    MulDivOp::Mul => "mul",
                    MulDivOp::Mulh => "mulh",
                    MulDivOp::Mulhsu => "mulhsu",
                    MulDivOp::Mulhu => "mulhu",
                    MulDivOp::Div => "div",
                    MulDivOp::Divu => "divu",
                    MulDivOp::Rem => "rem",
                    MulDivOp::Remu => "remu",
                };
                write!(f, "{mnemonic} {dest}, {src1}, {src2}")
            }
            Instruction::Jal { dest, offset } => write!(f, "jal {dest}, {offset}"),
            Instruction::Jalr { dest, base, offset } => {
                write!(f, "jalr {dest}, {offset}({base})")
            }
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let mnemonic = match condition {
                    BranchCondition::Beq => "beq",
                    BranchCondition::Bne => "bne",
                    BranchCondition::Blt => "blt",
                    BranchCondition::Bge => "bge",
                    BranchCondition::Bltu => "bltu",
                    BranchCondition::Bgeu => "bgeu",
                };
                write!(f, "{mnemonic} {src1}, {src2}, {offset}")
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let mnemonic = match width {
                    LoadWidth::Lb => "lb",
                    LoadWidth::Lh => "lh",
                    LoadWidth::Lw => "lw",
                    LoadWidth::Lbu => "lbu",
                    LoadWidth::Lhu => "lhu",
                };
                write!(f, "{mnemonic} {dest}, {offset}({base})")
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let mnemonic = match width {
                    StoreWidth::Sb => "sb",
                    StoreWidth::Sh => "sh",
                    StoreWidth::Sw => "sw",
                };
                write!(f, "{mnemonic} {src}, {offset}({base})")
            }
            Instruction::Amo {
                op,
                dest,
                addr,
                src,
            } => match op {
                AmoOp::Lr => write!(f, "lr.w {dest}, ({addr})"),
                AmoOp::Sc => write!(f, "sc.w {dest}, {src}, ({addr})"),
                _ => {
                    let mnemonic = match op {
                        AmoOp::Swap => "amoswap.w",
                        AmoOp::Add => "amoadd.w",
                        AmoOp::Xor => "amoxor.w",
                        AmoOp::Or => "amoor.w",
                        AmoOp::And => "amoand.w",
                        AmoOp::Min => "amomin.w",
                        AmoOp::Max => "amomax.w",
                        AmoOp::Minu => "amominu.w",
                        AmoOp::Maxu => "amomaxu.w",
                        AmoOp::Lr | AmoOp::Sc => unreachable!(),
                    };
                    write!(f, "{mnemonic} {dest}, {src}, ({addr})")
                }
            },
            Instruction::Fence => write!(f, "fence"),
            Instruction::FenceI => write!(f, "fence.i"),
            Instruction::Ecall => write!(f, "ecall"),
            Instruction::Ebreak => write!(f, "ebreak"),
            Instruction::Csr {
                op,
                dest,
                csr,
                src,
            } => match src {
                CsrSource::Register(src) => {
                    let mnemonic = match op {
                        CsrOp::ReadWrite => "csrrw",
                        CsrOp::ReadSet => "csrrs",
                        CsrOp::ReadClear => "csrrc",
                    };
                    write!(f, "{mnemonic} {dest}, {csr:#x}, {src}")
                }
                CsrSource::Immediate(imm) => {
                    let mnemonic = match op {
                        CsrOp::ReadWrite => "csrrwi",
                        CsrOp::ReadSet => "csrrsi",
                        CsrOp::ReadClear => "csrrci",
                    };
                    write!(f, "{mnemonic} {dest}, {csr:#x}, {imm}")
                }
            },
        }
    }
}

/// Assemble a complete source text into a little-endian byte image.
pub fn assemble(source: &str) -> Result<Vec<u8>, AsmError> {
    let lines: Vec<(usize, &str)> = source
        .lines()
        .enumerate()
        .map(|(i, line)| {
            let line = match line.find(';') {
                Some(pos) => &line[..pos],
                None => line,
            };
            (i + 1, line.trim())
        })
        .filter(|(_, line)| !line.is_empty())
        .collect();

    // First pass: collect label addresses.
    let mut labels = HashMap::new();
    let mut address = 0u32;
    for &(line_no, text) in &lines {
        if let Some(label) = text.strip_suffix(':') {
            let label = label.trim();
            if label.is_empty() || label.contains(char::is_whitespace) {
                return Err(AsmError {
                    line: line_no,
                    message: format!("malformed label declaration: {text}"),
                });
            }
            if labels.insert(label.to_string(), address).is_some() {
                return Err(AsmError {
                    line: line_no,
                    message: format!("duplicate label: {label}"),
                });
            }
        } else {
            address += 4;
        }
    }

    // Second pass: encode.
    let mut image = Vec::with_capacity(lines.len() * 4);
    let mut address = 0u32;
    for &(line_no, text) in &lines {
        if text.ends_with(':') {
            continue;
        }
        let word = encode_line(text, address, &labels)
            .map_err(|message| AsmError { line: line_no, message })?;
        image.extend_from_slice(&word.to_le_bytes());
        address += 4;
    }
    Ok(image)
}

fn encode_line(text: &str, address: u32, labels: &HashMap<String, u32>) -> Result<u32, String> {
    let (mnemonic, rest) = match text.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest),
        None => (text, ""),
    };
    let mnemonic = mnemonic.to_ascii_lowercase();
    let operands: Vec<&str> = rest
        .split(',')
        .map(str::trim)
        .filter(|op| !op.is_empty())
        .collect();

    let want = |n: usize| -> Result<(), String> {
        if operands.len() == n {
            Ok(())
        } else {
            Err(format!(
                "{mnemonic} expects {n} operands, found {}",
                operands.len()
            ))
        }
    };

    match mnemonic.as_str() {
        "lui" | "auipc" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let imm = parse_imm(operands[1])?;
            if !(0..=0xF_FFFF).contains(&imm) {
                return Err(format!("upper immediate {imm} out of range"));
            }
            let opcode = if mnemonic == "lui" { 0x37 } else { 0x17 };
            Ok(ujtype(imm as u32, rd, opcode))
        }
        "jal" => {
            // Single-operand form links through ra.
            let (rd, target) = match operands.len() {
                1 => (1, operands[0]),
                2 => (parse_reg(operands[0])?, operands[1]),
                n => return Err(format!("jal expects 1 or 2 operands, found {n}")),
            };
            let offset = parse_offset(target, address, labels)?;
            Ok(ujtype(jtype_imm_field(offset)?, rd, 0x6F))
        }
        "jalr" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let (offset, base) = parse_mem_operand(operands[1])?;
            Ok(itype(encode_i_imm(offset)?, base, 0b000, rd, 0x67))
        }
        "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" => {
            want(3)?;
            let rs1 = parse_reg(operands[0])?;
            let rs2 = parse_reg(operands[1])?;
            let offset = parse_offset(operands[2], address, labels)?;
            encode_branch(&mnemonic, rs1, rs2, offset)
        }
        "lb" | "lh" | "lw" | "lbu" | "lhu" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let (offset, base) = parse_mem_operand(operands[1])?;
            let funct3 = match mnemonic.as_str() {
                "lb" => 0b000,
                "lh" => 0b001,
                "lw" => 0b010,
                "lbu" => 0b100,
                _ => 0b101,
            };
            Ok(itype(encode_i_imm(offset)?, base, funct3, rd, 0x03))
        }
        "sb" | "sh" | "sw" => {
            want(2)?;
            let rs2 = parse_reg(operands[0])?;
            let (offset, base) = parse_mem_operand(operands[1])?;
            let funct3 = match mnemonic.as_str() {
                "sb" => 0b000,
                "sh" => 0b001,
                _ => 0b010,
            };
            let imm = encode_i_imm(offset)?;
            Ok(rstype(imm >> 5, rs2, base, funct3, imm & 0x1F, 0x23))
        }
        "addi" | "slti" | "sltiu" | "xori" | "ori" | "andi" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            let imm = encode_i_imm(parse_imm(operands[2])?)?;
            let funct3 = match mnemonic.as_str() {
                "addi" => 0b000,
                "slti" => 0b010,
                "sltiu" => 0b011,
                "xori" => 0b100,
                "ori" => 0b110,
                _ => 0b111,
            };
            Ok(itype(imm, rs1, funct3, rd, 0x13))
        }
        "slli" | "srli" | "srai" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            let shamt = parse_imm(operands[2])?;
            if !(0..=31).contains(&shamt) {
                return Err(format!("shift amount {shamt} out of range"));
            }
            let (upper, funct3) = match mnemonic.as_str() {
                "slli" => (0b0000000, 0b001),
                "srli" => (0b0000000, 0b101),
                _ => (0b0100000, 0b101),
            };
            Ok(itype((upper << 5) | shamt as u32, rs1, funct3, rd, 0x13))
        }
        "add" | "sub" | "sll" | "slt" | "sltu" | "xor" | "srl" | "sra" | "or" | "and" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            let rs2 = parse_reg(operands[2])?;
            let (funct7, funct3) = match mnemonic.as_str() {
                "add" => (0b0000000, 0b000),
                "sub" => (0b0100000, 0b000),
                "sll" => (0b0000000, 0b001),
                "slt" => (0b0000000, 0b010),
                "sltu" => (0b0000000, 0b011),
                "xor" => (0b0000000, 0b100),
                "srl" => (0b0000000, 0b101),
                "sra" => (0b0100000, 0b101),
                "or" => (0b0000000, 0b110),
                _ => (0b0000000, 0b111),
            };
            Ok(rstype(funct7, rs2, rs1, funct3, rd, 0x33))
        }
        "mul" | "mulh" | "mulhsu" | "mulhu" | "div" | "divu" | "rem" | "remu" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            let rs2 = parse_reg(operands[2])?;
            let funct3 = match mnemonic.as_str() {
                "mul" => 0b000,
                "mulh" => 0b001,
                "mulhsu" => 0b010,
                "mulhu" => 0b011,
                "div" => 0b100,
                "divu" => 0b101,
                "rem" => 0b110,
                _ => 0b111,
            };
            Ok(rstype(0b0000001, rs2, rs1, funct3, rd, 0x33))
        }
        "lr.w" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_amo_addr(operands[1])?;
            Ok(amotype(0b00010, 0, rs1, rd))
        }
        "sc.w" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let rs2 = parse_reg(operands[1])?;
            let rs1 = parse_amo_addr(operands[2])?;
            Ok(amotype(0b00011, rs2, rs1, rd))
        }
        "amoswap.w" | "amoadd.w" | "amoxor.w" | "amoor.w" | "amoand.w" | "amomin.w"
        | "amomax.w" | "amominu.w" | "amomaxu.w" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let rs2 = parse_reg(operands[1])?;
            let rs1 = parse_amo_addr(operands[2])?;
            let funct5 = match mnemonic.as_str() {
                "amoswap.w" => 0b00001,
                "amoadd.w" => 0b00000,
                "amoxor.w" => 0b00100,
                "amoor.w" => 0b01000,
                "amoand.w" => 0b01100,
                "amomin.w" => 0b10000,
                "amomax.w" => 0b10100,
                "amominu.w" => 0b11000,
                _ => 0b11100,
            };
            Ok(amotype(funct5, rs2, rs1, rd))
        }
        "fence" => {
            want(0)?;
            Ok(0x0000_000F)
        }
        "fence.i" => {
            want(0)?;
            Ok(0x0000_100F)
        }
        "ecall" => {
            want(0)?;
            Ok(0x0000_0073)
        }
        "ebreak" => {
            want(0)?;
            Ok(0x0010_0073)
        }
        "csrrw" | "csrrs" | "csrrc" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let csr = parse_csr(operands[1])?;
            let rs1 = parse_reg(operands[2])?;
            let funct3 = match mnemonic.as_str() {
                "csrrw" => 0b001,
                "csrrs" => 0b010,
                _ => 0b011,
            };
            Ok(itype(csr, rs1, funct3, rd, 0x73))
        }
        "csrrwi" | "csrrsi" | "csrrci" => {
            want(3)?;
            let rd = parse_reg(operands[0])?;
            let csr = parse_csr(operands[1])?;
            let uimm = parse_imm(operands[2])?;
            if !(0..=31).contains(&uimm) {
                return Err(format!("csr immediate {uimm} out of range"));
            }
            let funct3 = match mnemonic.as_str() {
                "csrrwi" => 0b101,
                "csrrsi" => 0b110,
                _ => 0b111,
            };
            Ok(itype(csr, uimm as u32, funct3, rd, 0x73))
        }
        // Pseudo-instructions, each a single encoded word.
        "nop" => {
            want(0)?;
            Ok(0x0000_0013)
        }
        "mv" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            Ok(itype(0, rs1, 0b000, rd, 0x13))
        }
        "not" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            Ok(itype(0xFFF, rs1, 0b100, rd, 0x13))
        }
        "li" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let imm = parse_imm(operands[1])?;
            if (-2048..=2047).contains(&imm) {
                Ok(itype(imm as u32 & 0xFFF, 0, 0b000, rd, 0x13))
            } else if imm & 0xFFF == 0 && (0..=u32::MAX as i64).contains(&imm) {
                Ok(ujtype((imm as u32) >> 12, rd, 0x37))
            } else {
                Err(format!("li immediate {imm} does not fit one instruction"))
            }
        }
        "j" => {
            want(1)?;
            let offset = parse_offset(operands[0], address, labels)?;
            Ok(ujtype(jtype_imm_field(offset)?, 0, 0x6F))
        }
        "jr" => {
            want(1)?;
            let rs1 = parse_reg(operands[0])?;
            Ok(itype(0, rs1, 0b000, 0, 0x67))
        }
        "ret" => {
            want(0)?;
            Ok(itype(0, 1, 0b000, 0, 0x67))
        }
        "seqz" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let rs1 = parse_reg(operands[1])?;
            Ok(itype(1, rs1, 0b011, rd, 0x13))
        }
        "snez" => {
            want(2)?;
            let rd = parse_reg(operands[0])?;
            let rs2 = parse_reg(operands[1])?;
            Ok(rstype(0b0000000, rs2, 0, 0b011, rd, 0x33))
        }
        "beqz" | "bnez" => {
            want(2)?;
            let rs1 = parse_reg(operands[0])?;
            let offset = parse_offset(operands[1], address, labels)?;
            let base = if mnemonic == "beqz" { "beq" } else { "bne" };
            encode_branch(base, rs1, 0, offset)
        }
        _ => Err(format!("unknown mnemonic: {mnemonic}")),
    }
}

// Field packers. These produce valid encodings only for in-range fields;
// all range checking happens in the callers above.

fn itype(imm12: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    imm12 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

/// R- and S-type share a field layout; `a`/`b` are funct7/rd for R-type and
/// the split immediate for S-type.
fn rstype(a: u32, rs2: u32, rs1: u32, funct3: u32, b: u32, opcode: u32) -> u32 {
    a << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | b << 7 | opcode
}

fn ujtype(imm20: u32, rd: u32, opcode: u32) -> u32 {
    imm20 << 12 | rd << 7 | opcode
}

fn amotype(funct5: u32, rs2: u32, rs1: u32, rd: u32) -> u32 {
    funct5 << 27 | rs2 << 20 | rs1 << 15 | 0b010 << 12 | rd << 7 | 0x2F
}

/// Shuffle a jump offset into the 20-bit U-field layout used by `ujtype`.
fn jtype_imm_field(offset: i32) -> Result<u32, String> {
    if offset % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&offset) {
        return Err(format!("jump offset {offset} not encodable"));
    }
    let offset = offset as u32;
    let imm20 = (offset >> 20) & 1;
    let imm19_12 = (offset >> 12) & 0xFF;
    let imm11 = (offset >> 11) & 1;
    let imm10_1 = (offset >> 1) & 0x3FF;
    Ok((imm20 << 19) | (imm10_1 << 9) | (imm11 << 8) | imm19_12)
}

fn encode_branch(mnemonic: &str, rs1: u32, rs2: u32, offset: i32) -> Result<u32, String> {
    if offset % 2 != 0 || !(-4096..4096).contains(&offset) {
        return Err(format!("branch offset {offset} not encodable"));
    }
    let funct3 = match mnemonic {
        "beq" => 0b000,
        "bne" => 0b001,
        "blt" => 0b100,
        "bge" => 0b101,
        "bltu" => 0b110,
        _ => 0b111,
    };
    let offset = offset as u32;
    let imm12 = (offset >> 12) & 1;
    let imm11 = (offset >> 11) & 1;
    let imm10_5 = (offset >> 5) & 0x3F;
    let imm4_1 = (offset >> 1) & 0xF;
    let a = (imm12 << 6) | imm10_5;
    let b = (imm4_1 << 1) | imm11;
    Ok(rstype(a, rs2, rs1, funct3, b, 0x63))
}

fn encode_i_imm(imm: i64) -> Result<u32, String> {
    if !(-2048..=2047).contains(&imm) {
        return Err(format!("immediate {imm} out of 12-bit range"));
    }
    Ok(imm as u32 & 0xFFF)
}

fn parse_reg(operand: &str) -> Result<u32, String> {
    Specifier::parse(operand)
        .map(u32::from)
        .ok_or_else(|| format!("unknown register: {operand}"))
}

fn parse_csr(operand: &str) -> Result<u32, String> {
    let value = parse_imm(operand)?;
    if (0..=0xFFF).contains(&value) {
        Ok(value as u32)
    } else {
        Err(format!("csr number {value} out of range"))
    }
}

/// Parse an immediate in any of the accepted radix notations.
fn parse_imm(operand: &str) -> Result<i64, String> {
    let (negative, digits) = match operand.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, operand),
    };
    let magnitude = parse_unsigned(digits).ok_or_else(|| format!("invalid immediate: {operand}"))?;
    Ok(if negative {
        -(magnitude as i64)
    } else {
        magnitude as i64
    })
}

fn parse_unsigned(digits: &str) -> Option<u32> {
    if digits.is_empty() {
        return None;
    }
    if let Some(hex) = digits.strip_suffix(['h', 'H']) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        return u32::from_str_radix(bin, 2).ok();
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return u32::from_str_radix(&digits[1..], 8).ok();
    }
    digits.parse().ok()
}

/// A branch or jump target: a numeric byte offset, or a label resolved
/// relative to the instruction's own address.
fn parse_offset(
    operand: &str,
    address: u32,
    labels: &HashMap<String, u32>,
) -> Result<i32, String> {
    if let Ok(imm) = parse_imm(operand) {
        return i32::try_from(imm).map_err(|_| format!("offset {imm} out of range"));
    }
    match labels.get(operand) {
        Some(&target) => Ok(target.wrapping_sub(address) as i32),
        None => Err(format!("undefined label: {operand}")),
    }
}

/// `imm(reg)` with an optional immediate part.
fn parse_mem_operand(operand: &str) -> Result<(i64, u32), String> {
    let open = operand
        .find('(')
        .ok_or_else(|| format!("invalid memory operand: {operand}"))?;
    let close = operand
        .strip_suffix(')')
        .ok_or_else(|| format!("invalid memory operand: {operand}"))?;
    let imm_part = &operand[..open];
    let reg_part = &close[open + 1..];
    let imm = if imm_part.is_empty() {
        0
    } else {
        parse_imm(imm_part)?
    };
    Ok((imm, parse_reg(reg_part)?))
}

/// `(reg)`, the address operand of the atomic instructions.
fn parse_amo_addr(operand: &str) -> Result<u32, String> {
    let inner = operand
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("invalid address operand: {operand}"))?;
    parse_reg(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_line(line: &str) -> u32 {
        let bytes = assemble(line).unwrap();
        assert_eq!(4, bytes.len());
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn test_assemble_known_words() {
        assert_eq!(0x0010_0E13, assemble_line("addi x28, x0, 1"));
        assert_eq!(0x8000_0137, assemble_line("lui x2, 0x80000"));
        assert_eq!(0x01DE_0F33, assemble_line("add x30, x28, x29"));
        assert_eq!(0x0000_0073, assemble_line("ecall"));
        assert_eq!(0x0000_0013, assemble_line("nop"));
    }

    #[test]
    fn test_register_name_forms() {
        assert_eq!(
            assemble_line("addi sp, sp, -16"),
            assemble_line("addi x2, x2, -16")
        );
        assert_eq!(assemble_line("mv a0, t6"), assemble_line("mv x10, x31"));
    }

    #[test]
    fn test_immediate_radixes() {
        let decimal = assemble_line("addi x1, x0, 255");
        assert_eq!(decimal, assemble_line("addi x1, x0, 0xFF"));
        assert_eq!(decimal, assemble_line("addi x1, x0, 0b11111111"));
        assert_eq!(decimal, assemble_line("addi x1, x0, 0377"));
        assert_eq!(decimal, assemble_line("addi x1, x0, 0FFh"));
    }

    #[test]
    fn test_memory_operands() {
        assert_eq!(assemble_line("lw x1, (x2)"), assemble_line("lw x1, 0(x2)"));
        let word = assemble_line("sw x5, -4(x6)");
        assert_eq!(
            "sw x5, -4(x6)",
            Instruction::decode(word).unwrap().to_string()
        );
    }

    #[test]
    fn test_labels_resolve_both_directions() {
        let source = "\
top:
    addi x1, x1, 1
    beq x1, x2, done
    jal x0, top
done:
    ecall
";
        let bytes = assemble(source).unwrap();
        assert_eq!(16, bytes.len());
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // beq at address 4 targets address 12: offset +8
        assert_eq!("beq x1, x2, 8", disassemble(words[1]));
        // jal at address 8 targets address 0: offset -8
        assert_eq!("jal x0, -8", disassemble(words[2]));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let bytes = assemble("; leading comment\n\n  nop ; trailing\n").unwrap();
        assert_eq!(4, bytes.len());
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = assemble("nop\nbogus x1, x2\n").unwrap_err();
        assert_eq!(2, err.line);
        assert!(err.message.contains("bogus"));

        let err = assemble("beq x1, x2, nowhere\n").unwrap_err();
        assert!(err.message.contains("undefined label"));

        let err = assemble("addi x1, x0, 5000\n").unwrap_err();
        assert!(err.message.contains("12-bit range"));

        let err = assemble("addi x1, q9, 0\n").unwrap_err();
        assert!(err.message.contains("unknown register"));
    }

    #[test]
    fn test_li_forms() {
        assert_eq!(assemble_line("li x5, -1"), assemble_line("addi x5, x0, -1"));
        assert_eq!(
            assemble_line("li x5, 0x12000"),
            assemble_line("lui x5, 0x12")
        );
        assert!(assemble("li x5, 0x12345\n").is_err());
    }

    #[test]
    fn test_disassemble_illegal() {
        assert_eq!("illegal", disassemble(0xFFFF_FFFF));
        assert_eq!("illegal", disassemble(0x0000_0000));
    }

    #[test]
    fn test_round_trip_canonical_set() {
        let source = "\
lui x2, 0x80000
auipc x5, 0x1
jal x1, 2048
jal x0, -4
jalr x1, 4(x2)
beq x1, x2, 8
bne x3, x4, -8
blt x5, x6, 16
bge x7, x8, 32
bltu x9, x10, 64
bgeu x11, x12, 128
lb x1, -1(x2)
lh x3, 2(x4)
lw x5, 4(x6)
lbu x7, 8(x8)
lhu x9, 10(x10)
sb x1, 1(x2)
sh x3, 2(x4)
sw x5, 4(x6)
addi x1, x2, -2048
slti x3, x4, 2047
sltiu x5, x6, 1
xori x7, x8, -1
ori x9, x10, 255
andi x11, x12, 15
slli x1, x2, 1
srli x3, x4, 31
srai x5, x6, 7
add x1, x2, x3
sub x4, x5, x6
sll x7, x8, x9
slt x10, x11, x12
sltu x13, x14, x15
xor x16, x17, x18
srl x19, x20, x21
sra x22, x23, x24
or x25, x26, x27
and x28, x29, x30
mul x1, x2, x3
mulh x4, x5, x6
mulhsu x7, x8, x9
mulhu x10, x11, x12
div x13, x14, x15
divu x16, x17, x18
rem x19, x20, x21
remu x22, x23, x24
lr.w x10, (x11)
sc.w x12, x13, (x14)
amoswap.w x1, x2, (x3)
amoadd.w x4, x5, (x6)
amoxor.w x7, x8, (x9)
amoor.w x10, x11, (x12)
amoand.w x13, x14, (x15)
amomin.w x16, x17, (x18)
amomax.w x19, x20, (x21)
amominu.w x22, x23, (x24)
amomaxu.w x25, x26, (x27)
fence
fence.i
ecall
ebreak
csrrw x1, 0xc00, x2
csrrs x3, 0x340, x4
csrrc x5, 0xc01, x6
csrrwi x7, 0x340, 31
csrrsi x8, 0x341, 1
csrrci x9, 0x342, 0
";
        let bytes = assemble(source).unwrap();
        for chunk in bytes.chunks(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            let text = disassemble(word);
            assert_ne!("illegal", text, "word {word:#010x}");
            let again = assemble(&text).unwrap();
            let word_again = u32::from_le_bytes(again.try_into().unwrap());
            assert_eq!(word, word_again, "{text} round-tripped differently");
        }
    }
}
