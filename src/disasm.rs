//! Instruction disassembly
//!
//! Pure text rendering for host debuggers: no architectural state changes.
//! Bytes are read through the CS descriptor base without paging bookkeeping
//! (no accessed/dirty updates), so a disassembly pass is invisible to the
//! guest. NEC parts render their own mnemonic set (AW/CW/DW/BW, IX/IY,
//! DS0/DS1/PS).

use crate::bus::Bus;
use crate::cpu::{Cpu, OpSize};
use crate::regs::seg;
use crate::traits::CpuFamily;

const REG8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
const REG8_REX: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const REG16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const REG16_NEC: [&str; 8] = ["aw", "cw", "dw", "bw", "sp", "bp", "ix", "iy"];
const REG32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const REG64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const SEGMENT: [&str; 8] = ["es", "cs", "ss", "ds", "fs", "gs", "ds3", "ds2"];
const SEGMENT_NEC: [&str; 8] = ["ds1", "ps", "ss", "ds0", "fs", "gs", "ds3", "ds2"];
const CONDITION: [&str; 16] = [
    "o", "no", "b", "nb", "z", "nz", "be", "nbe", "s", "ns", "p", "np", "l", "nl", "le", "nle",
];
const ALU: [&str; 8] = ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"];
const SHIFT: [&str; 8] = ["rol", "ror", "rcl", "rcr", "shl", "shr", "sal", "sar"];

struct Disassembler<'a> {
    cpu: &'a Cpu,
    bus: &'a mut dyn Bus,
    position: u64,
    nec: bool,
    operand_size: OpSize,
    address_size: OpSize,
    segment_override: Option<usize>,
    rex: u8,
    text: String,
}

impl<'a> Disassembler<'a> {
    fn fetch8(&mut self) -> u8 {
        let linear = self.cpu.sr[seg::CS]
            .base
            .wrapping_add(self.position)
            & self.cpu.traits.memory_mask();
        let mut byte = [0u8];
        self.bus
            .memory_read(crate::bus::AddressSpace::Supervisor, linear, &mut byte);
        self.position = self.position.wrapping_add(1);
        byte[0]
    }

    fn fetch16(&mut self) -> u16 {
        u16::from(self.fetch8()) | (u16::from(self.fetch8()) << 8)
    }

    fn fetch32(&mut self) -> u32 {
        u32::from(self.fetch16()) | (u32::from(self.fetch16()) << 16)
    }

    fn fetch_immediate(&mut self) -> u64 {
        match self.operand_size {
            OpSize::Byte => u64::from(self.fetch8()),
            OpSize::Word => u64::from(self.fetch16()),
            _ => u64::from(self.fetch32()),
        }
    }

    fn reg8_name(&self, number: usize) -> &'static str {
        if self.rex != 0 {
            REG8_REX[number & 15]
        } else {
            REG8[number & 7]
        }
    }

    fn reg_name(&self, size: OpSize, number: usize) -> &'static str {
        match size {
            OpSize::Byte => self.reg8_name(number),
            OpSize::Word => {
                if self.nec {
                    REG16_NEC[number & 7]
                } else {
                    REG16[number & 15]
                }
            }
            OpSize::Dword => REG32[number & 15],
            OpSize::Qword => REG64[number & 15],
        }
    }

    fn segment_name(&self, number: usize) -> &'static str {
        if self.nec {
            SEGMENT_NEC[number & 7]
        } else {
            SEGMENT[number & 7]
        }
    }

    /// Decode a ModRM byte into (reg field, operand text).
    fn modrm(&mut self, size: OpSize) -> (usize, String) {
        let modrm = self.fetch8();
        let reg = usize::from((modrm >> 3) & 7) | usize::from(self.rex & 4) << 1;
        if modrm >= 0xC0 {
            let rm = usize::from(modrm & 7) | usize::from(self.rex & 1) << 3;
            return (reg, self.reg_name(size, rm).to_string());
        }

        let segment = self
            .segment_override
            .map(|s| self.segment_name(s))
            .unwrap_or("");
        let prefix = if segment.is_empty() {
            String::new()
        } else {
            format!("{segment}:")
        };

        let text = if self.address_size == OpSize::Word {
            let base = match modrm & 7 {
                0 => {
                    if self.nec {
                        "bw+ix"
                    } else {
                        "bx+si"
                    }
                }
                1 => {
                    if self.nec {
                        "bw+iy"
                    } else {
                        "bx+di"
                    }
                }
                2 => "bp+si",
                3 => "bp+di",
                4 => {
                    if self.nec {
                        "ix"
                    } else {
                        "si"
                    }
                }
                5 => {
                    if self.nec {
                        "iy"
                    } else {
                        "di"
                    }
                }
                6 => "bp",
                _ => {
                    if self.nec {
                        "bw"
                    } else {
                        "bx"
                    }
                }
            };
            match modrm >> 6 {
                0 if modrm & 7 == 6 => format!("[{prefix}{:#x}]", self.fetch16()),
                0 => format!("[{prefix}{base}]"),
                1 => format!("[{prefix}{base}{:+#x}]", self.fetch8() as i8),
                _ => format!("[{prefix}{base}{:+#x}]", self.fetch16() as i16),
            }
        } else {
            let rm = modrm & 7;
            let mut parts = String::new();
            let mut disp_size = modrm >> 6;
            if rm == 4 {
                let sib = self.fetch8();
                let base = usize::from(sib & 7) | usize::from(self.rex & 1) << 3;
                let index = usize::from((sib >> 3) & 7) | usize::from(self.rex & 2) << 2;
                let scale = 1 << (sib >> 6);
                if !(sib & 7 == 5 && modrm >> 6 == 0) {
                    parts.push_str(self.reg_name(self.address_size, base));
                } else {
                    disp_size = 2;
                }
                if index != 4 {
                    if !parts.is_empty() {
                        parts.push('+');
                    }
                    parts.push_str(self.reg_name(self.address_size, index));
                    if scale > 1 {
                        parts.push_str(&format!("*{scale}"));
                    }
                }
            } else if rm == 5 && modrm >> 6 == 0 {
                if self.address_size == OpSize::Qword {
                    parts.push_str("rip");
                }
                disp_size = 2;
            } else {
                parts.push_str(
                    self.reg_name(self.address_size, usize::from(rm) | usize::from(self.rex & 1) << 3),
                );
            }
            match disp_size {
                1 => parts.push_str(&format!("{:+#x}", self.fetch8() as i8)),
                2 => {
                    let displacement = self.fetch32() as i32;
                    if parts.is_empty() {
                        parts.push_str(&format!("{:#x}", displacement as u32));
                    } else {
                        parts.push_str(&format!("{displacement:+#x}"));
                    }
                }
                _ => {}
            }
            format!("[{prefix}{parts}]")
        };
        (reg, text)
    }

    fn emit(&mut self, text: String) {
        self.text = text;
    }

    fn run(&mut self) {
        loop {
            let opcode = self.fetch8();
            match opcode {
                0x26 => self.segment_override = Some(seg::ES),
                0x2E => self.segment_override = Some(seg::CS),
                0x36 => self.segment_override = Some(seg::SS),
                0x3E => self.segment_override = Some(seg::DS),
                0x64 if !self.nec => self.segment_override = Some(seg::FS),
                0x65 if !self.nec => self.segment_override = Some(seg::GS),
                0x66 => {
                    self.operand_size = if self.operand_size == OpSize::Word {
                        OpSize::Dword
                    } else {
                        OpSize::Word
                    };
                }
                0x67 => {
                    self.address_size = if self.address_size == OpSize::Word {
                        OpSize::Dword
                    } else {
                        OpSize::Word
                    };
                }
                0xF0 => {
                    self.text.push_str("lock ");
                }
                0xF2 => self.text.push_str("repnz "),
                0xF3 => self.text.push_str("rep "),
                0x40..=0x4F if self.cpu.is_64bit_mode() => {
                    self.rex = opcode & 0x0F;
                    if self.rex & 8 != 0 {
                        self.operand_size = OpSize::Qword;
                    }
                    let next = self.fetch8();
                    self.primary(next);
                    return;
                }
                _ => {
                    let prefix = core::mem::take(&mut self.text);
                    self.primary(opcode);
                    self.text = format!("{prefix}{}", self.text);
                    return;
                }
            }
        }
    }

    fn primary(&mut self, opcode: u8) {
        let size = self.operand_size;
        match opcode {
            0x00..=0x3D
                if opcode & 7 <= 5 && !matches!(opcode, 0x0F | 0x26 | 0x2E | 0x36 | 0x3E) =>
            {
                let mnemonic = ALU[usize::from(opcode >> 3) & 7];
                match opcode & 7 {
                    0 | 1 => {
                        let width = if opcode & 1 == 0 { OpSize::Byte } else { size };
                        let (reg, rm) = self.modrm(width);
                        let reg = self.reg_name(width, reg);
                        self.emit(format!("{mnemonic} {rm}, {reg}"));
                    }
                    2 | 3 => {
                        let width = if opcode & 1 == 0 { OpSize::Byte } else { size };
                        let (reg, rm) = self.modrm(width);
                        let reg = self.reg_name(width, reg);
                        self.emit(format!("{mnemonic} {reg}, {rm}"));
                    }
                    _ => {
                        let width = if opcode & 1 == 0 { OpSize::Byte } else { size };
                        let accumulator = self.reg_name(width, 0);
                        let immediate = if width == OpSize::Byte {
                            u64::from(self.fetch8())
                        } else {
                            self.fetch_immediate()
                        };
                        self.emit(format!("{mnemonic} {accumulator}, {immediate:#x}"));
                    }
                }
            }
            0x06 | 0x0E | 0x16 | 0x1E => {
                let segment = self.segment_name(usize::from(opcode >> 3));
                self.emit(format!("push {segment}"));
            }
            0x07 | 0x17 | 0x1F => {
                let segment = self.segment_name(usize::from(opcode >> 3));
                self.emit(format!("pop {segment}"));
            }
            0x27 => self.emit("daa".into()),
            0x2F => self.emit("das".into()),
            0x37 => self.emit("aaa".into()),
            0x3F => self.emit("aas".into()),
            0x40..=0x47 => {
                let register = self.reg_name(size, usize::from(opcode & 7));
                self.emit(format!("inc {register}"));
            }
            0x48..=0x4F => {
                let register = self.reg_name(size, usize::from(opcode & 7));
                self.emit(format!("dec {register}"));
            }
            0x50..=0x57 => {
                let register = self.reg_name(size, usize::from(opcode & 7) | usize::from(self.rex & 1) << 3);
                self.emit(format!("push {register}"));
            }
            0x58..=0x5F => {
                let register = self.reg_name(size, usize::from(opcode & 7) | usize::from(self.rex & 1) << 3);
                self.emit(format!("pop {register}"));
            }
            0x60 => self.emit("pusha".into()),
            0x61 => self.emit("popa".into()),
            0x62 => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                self.emit(format!("bound {reg}, {rm}"));
            }
            0x68 => {
                let immediate = self.fetch_immediate();
                self.emit(format!("push {immediate:#x}"));
            }
            0x69 | 0x6B => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let immediate = if opcode == 0x6B {
                    u64::from(self.fetch8())
                } else {
                    self.fetch_immediate()
                };
                self.emit(format!("imul {reg}, {rm}, {immediate:#x}"));
            }
            0x6C => self.emit("insb".into()),
            0x6D => self.emit("insw".into()),
            0x6E => self.emit("outsb".into()),
            0x6F => self.emit("outsw".into()),
            0x70..=0x7F => {
                let displacement = self.fetch8() as i8 as i64;
                let target = self.position.wrapping_add(displacement as u64) & 0xFFFF_FFFF;
                let condition = CONDITION[usize::from(opcode & 0x0F)];
                self.emit(format!("j{condition} {target:#x}"));
            }
            0x80..=0x83 => {
                let width = if opcode & 1 == 0 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let mnemonic = ALU[reg & 7];
                let immediate = if opcode == 0x81 {
                    self.fetch_immediate()
                } else {
                    u64::from(self.fetch8())
                };
                self.emit(format!("{mnemonic} {rm}, {immediate:#x}"));
            }
            0x84 | 0x85 => {
                let width = if opcode == 0x84 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let reg = self.reg_name(width, reg);
                self.emit(format!("test {rm}, {reg}"));
            }
            0x86 | 0x87 => {
                let width = if opcode == 0x86 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let reg = self.reg_name(width, reg);
                self.emit(format!("xchg {rm}, {reg}"));
            }
            0x88 | 0x89 => {
                let width = if opcode == 0x88 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let reg = self.reg_name(width, reg);
                self.emit(format!("mov {rm}, {reg}"));
            }
            0x8A | 0x8B => {
                let width = if opcode == 0x8A { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let reg = self.reg_name(width, reg);
                self.emit(format!("mov {reg}, {rm}"));
            }
            0x8C => {
                let (reg, rm) = self.modrm(OpSize::Word);
                let segment = self.segment_name(reg);
                self.emit(format!("mov {rm}, {segment}"));
            }
            0x8D => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                self.emit(format!("lea {reg}, {rm}"));
            }
            0x8E => {
                let (reg, rm) = self.modrm(OpSize::Word);
                let segment = self.segment_name(reg);
                self.emit(format!("mov {segment}, {rm}"));
            }
            0x8F => {
                let (_, rm) = self.modrm(size);
                self.emit(format!("pop {rm}"));
            }
            0x90 => self.emit("nop".into()),
            0x91..=0x97 => {
                let register = self.reg_name(size, usize::from(opcode & 7));
                let accumulator = self.reg_name(size, 0);
                self.emit(format!("xchg {accumulator}, {register}"));
            }
            0x98 => {
                let mnemonic = if size == OpSize::Word { "cbw" } else { "cwde" };
                self.emit(mnemonic.into());
            }
            0x99 => {
                let mnemonic = if size == OpSize::Word { "cwd" } else { "cdq" };
                self.emit(mnemonic.into());
            }
            0x9A => {
                let offset = self.fetch_immediate();
                let segment = self.fetch16();
                self.emit(format!("call {segment:#x}:{offset:#x}"));
            }
            0x9B => self.emit("wait".into()),
            0x9C => self.emit("pushf".into()),
            0x9D => self.emit("popf".into()),
            0x9E => self.emit("sahf".into()),
            0x9F => self.emit("lahf".into()),
            0xA0..=0xA3 => {
                let offset = if self.address_size == OpSize::Word {
                    u64::from(self.fetch16())
                } else {
                    u64::from(self.fetch32())
                };
                let width = if opcode & 1 == 0 { OpSize::Byte } else { size };
                let accumulator = self.reg_name(width, 0);
                if opcode < 0xA2 {
                    self.emit(format!("mov {accumulator}, [{offset:#x}]"));
                } else {
                    self.emit(format!("mov [{offset:#x}], {accumulator}"));
                }
            }
            0xA4 => self.emit("movsb".into()),
            0xA5 => self.emit("movsw".into()),
            0xA6 => self.emit("cmpsb".into()),
            0xA7 => self.emit("cmpsw".into()),
            0xA8 | 0xA9 => {
                let width = if opcode == 0xA8 { OpSize::Byte } else { size };
                let accumulator = self.reg_name(width, 0);
                let immediate = if width == OpSize::Byte {
                    u64::from(self.fetch8())
                } else {
                    self.fetch_immediate()
                };
                self.emit(format!("test {accumulator}, {immediate:#x}"));
            }
            0xAA => self.emit("stosb".into()),
            0xAB => self.emit("stosw".into()),
            0xAC => self.emit("lodsb".into()),
            0xAD => self.emit("lodsw".into()),
            0xAE => self.emit("scasb".into()),
            0xAF => self.emit("scasw".into()),
            0xB0..=0xB7 => {
                let register = self.reg8_name(usize::from(opcode & 7));
                let immediate = self.fetch8();
                self.emit(format!("mov {register}, {immediate:#x}"));
            }
            0xB8..=0xBF => {
                let register = self.reg_name(size, usize::from(opcode & 7) | usize::from(self.rex & 1) << 3);
                let immediate = self.fetch_immediate();
                self.emit(format!("mov {register}, {immediate:#x}"));
            }
            0xC0 | 0xC1 | 0xD0..=0xD3 => {
                let width = if opcode & 1 == 0 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let mnemonic = SHIFT[reg & 7];
                let count = match opcode {
                    0xC0 | 0xC1 => format!("{:#x}", self.fetch8()),
                    0xD0 | 0xD1 => "1".into(),
                    _ => "cl".into(),
                };
                self.emit(format!("{mnemonic} {rm}, {count}"));
            }
            0xC2 => {
                let bytes = self.fetch16();
                self.emit(format!("ret {bytes:#x}"));
            }
            0xC3 => self.emit("ret".into()),
            0xC4 | 0xC5 => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let mnemonic = if opcode == 0xC4 { "les" } else { "lds" };
                self.emit(format!("{mnemonic} {reg}, {rm}"));
            }
            0xC6 | 0xC7 => {
                let width = if opcode == 0xC6 { OpSize::Byte } else { size };
                let (_, rm) = self.modrm(width);
                let immediate = if width == OpSize::Byte {
                    u64::from(self.fetch8())
                } else {
                    self.fetch_immediate()
                };
                self.emit(format!("mov {rm}, {immediate:#x}"));
            }
            0xC8 => {
                let frame = self.fetch16();
                let nesting = self.fetch8();
                self.emit(format!("enter {frame:#x}, {nesting:#x}"));
            }
            0xC9 => self.emit("leave".into()),
            0xCA => {
                let bytes = self.fetch16();
                self.emit(format!("retf {bytes:#x}"));
            }
            0xCB => self.emit("retf".into()),
            0xCC => self.emit("int3".into()),
            0xCD => {
                let number = self.fetch8();
                self.emit(format!("int {number:#x}"));
            }
            0xCE => self.emit("into".into()),
            0xCF => self.emit("iret".into()),
            0xD4 => {
                let base = self.fetch8();
                self.emit(format!("aam {base:#x}"));
            }
            0xD5 => {
                let base = self.fetch8();
                self.emit(format!("aad {base:#x}"));
            }
            0xD6 => self.emit("salc".into()),
            0xD7 => self.emit("xlat".into()),
            0xD8..=0xDF => {
                let (_, rm) = self.modrm(OpSize::Dword);
                self.emit(format!("fpu({opcode:#04x}) {rm}"));
            }
            0xE0 => self.relative8("loopnz"),
            0xE1 => self.relative8("loopz"),
            0xE2 => self.relative8("loop"),
            0xE3 => self.relative8("jcxz"),
            0xE4 | 0xE5 => {
                let port = self.fetch8();
                let width = if opcode == 0xE4 { OpSize::Byte } else { size };
                let accumulator = self.reg_name(width, 0);
                self.emit(format!("in {accumulator}, {port:#x}"));
            }
            0xE6 | 0xE7 => {
                let port = self.fetch8();
                let width = if opcode == 0xE6 { OpSize::Byte } else { size };
                let accumulator = self.reg_name(width, 0);
                self.emit(format!("out {port:#x}, {accumulator}"));
            }
            0xE8 => {
                let displacement = self.fetch_immediate() as i32 as i64;
                let target = self.position.wrapping_add(displacement as u64);
                self.emit(format!("call {target:#x}"));
            }
            0xE9 => {
                let displacement = self.fetch_immediate() as i32 as i64;
                let target = self.position.wrapping_add(displacement as u64);
                self.emit(format!("jmp {target:#x}"));
            }
            0xEA => {
                let offset = self.fetch_immediate();
                let segment = self.fetch16();
                self.emit(format!("jmp {segment:#x}:{offset:#x}"));
            }
            0xEB => self.relative8("jmp"),
            0xEC | 0xED => {
                let width = if opcode == 0xEC { OpSize::Byte } else { size };
                let accumulator = self.reg_name(width, 0);
                self.emit(format!("in {accumulator}, dx"));
            }
            0xEE | 0xEF => {
                let width = if opcode == 0xEE { OpSize::Byte } else { size };
                let accumulator = self.reg_name(width, 0);
                self.emit(format!("out dx, {accumulator}"));
            }
            0xF1 => self.emit("icebp".into()),
            0xF4 => self.emit("hlt".into()),
            0xF5 => self.emit("cmc".into()),
            0xF6 | 0xF7 => {
                let width = if opcode == 0xF6 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                const GROUP3: [&str; 8] =
                    ["test", "test", "not", "neg", "mul", "imul", "div", "idiv"];
                let mnemonic = GROUP3[reg & 7];
                if reg & 7 <= 1 {
                    let immediate = if width == OpSize::Byte {
                        u64::from(self.fetch8())
                    } else {
                        self.fetch_immediate()
                    };
                    self.emit(format!("{mnemonic} {rm}, {immediate:#x}"));
                } else {
                    self.emit(format!("{mnemonic} {rm}"));
                }
            }
            0xF8 => self.emit("clc".into()),
            0xF9 => self.emit("stc".into()),
            0xFA => self.emit("cli".into()),
            0xFB => self.emit("sti".into()),
            0xFC => self.emit("cld".into()),
            0xFD => self.emit("std".into()),
            0xFE => {
                let (reg, rm) = self.modrm(OpSize::Byte);
                let mnemonic = if reg & 7 == 0 { "inc" } else { "dec" };
                self.emit(format!("{mnemonic} {rm}"));
            }
            0xFF => {
                let (reg, rm) = self.modrm(size);
                const GROUP5: [&str; 8] =
                    ["inc", "dec", "call", "callf", "jmp", "jmpf", "push", "(bad)"];
                let mnemonic = GROUP5[reg & 7];
                self.emit(format!("{mnemonic} {rm}"));
            }
            0x0F => {
                let second = self.fetch8();
                self.secondary(second);
            }
            _ => self.emit(format!("db {opcode:#04x}")),
        }
    }

    fn relative8(&mut self, mnemonic: &str) {
        let displacement = self.fetch8() as i8 as i64;
        let target = self.position.wrapping_add(displacement as u64) & 0xFFFF_FFFF;
        self.emit(format!("{mnemonic} {target:#x}"));
    }

    fn secondary(&mut self, opcode: u8) {
        let size = self.operand_size;
        match opcode {
            0x00 => {
                let (reg, rm) = self.modrm(OpSize::Word);
                const GROUP6: [&str; 8] =
                    ["sldt", "str", "lldt", "ltr", "verr", "verw", "(bad)", "(bad)"];
                self.emit(format!("{} {rm}", GROUP6[reg & 7]));
            }
            0x01 => {
                let (reg, rm) = self.modrm(size);
                const GROUP7: [&str; 8] =
                    ["sgdt", "sidt", "lgdt", "lidt", "smsw", "(bad)", "lmsw", "invlpg"];
                self.emit(format!("{} {rm}", GROUP7[reg & 7]));
            }
            0x02 | 0x03 => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let mnemonic = if opcode == 0x02 { "lar" } else { "lsl" };
                self.emit(format!("{mnemonic} {reg}, {rm}"));
            }
            0x06 => self.emit("clts".into()),
            0x08 => self.emit("invd".into()),
            0x09 => self.emit("wbinvd".into()),
            0x0B => self.emit("ud2".into()),
            0x20..=0x23 => {
                let (reg, rm) = self.modrm(OpSize::Dword);
                let system = if opcode & 1 == 0 { "cr" } else { "dr" };
                if opcode < 0x22 {
                    self.emit(format!("mov {rm}, {system}{reg}"));
                } else {
                    self.emit(format!("mov {system}{reg}, {rm}"));
                }
            }
            0x30 => self.emit("wrmsr".into()),
            0x31 => self.emit("rdtsc".into()),
            0x32 => self.emit("rdmsr".into()),
            0x34 => self.emit("sysenter".into()),
            0x35 => self.emit("sysexit".into()),
            0x40..=0x4F => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let condition = CONDITION[usize::from(opcode & 0x0F)];
                self.emit(format!("cmov{condition} {reg}, {rm}"));
            }
            0x80..=0x8F => {
                let displacement = self.fetch_immediate() as i32 as i64;
                let target = self.position.wrapping_add(displacement as u64);
                let condition = CONDITION[usize::from(opcode & 0x0F)];
                self.emit(format!("j{condition} {target:#x}"));
            }
            0x90..=0x9F => {
                let (_, rm) = self.modrm(OpSize::Byte);
                let condition = CONDITION[usize::from(opcode & 0x0F)];
                self.emit(format!("set{condition} {rm}"));
            }
            0xA0 => self.emit("push fs".into()),
            0xA1 => self.emit("pop fs".into()),
            0xA2 => self.emit("cpuid".into()),
            0xA3 | 0xAB | 0xB3 | 0xBB => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let mnemonic = match opcode {
                    0xA3 => "bt",
                    0xAB => "bts",
                    0xB3 => "btr",
                    _ => "btc",
                };
                self.emit(format!("{mnemonic} {rm}, {reg}"));
            }
            0xA4 | 0xAC => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let count = self.fetch8();
                let mnemonic = if opcode == 0xA4 { "shld" } else { "shrd" };
                self.emit(format!("{mnemonic} {rm}, {reg}, {count:#x}"));
            }
            0xA5 | 0xAD => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let mnemonic = if opcode == 0xA5 { "shld" } else { "shrd" };
                self.emit(format!("{mnemonic} {rm}, {reg}, cl"));
            }
            0xA8 => self.emit("push gs".into()),
            0xA9 => self.emit("pop gs".into()),
            0xAA => self.emit("rsm".into()),
            0xAF => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                self.emit(format!("imul {reg}, {rm}"));
            }
            0xB0 | 0xB1 => {
                let width = if opcode == 0xB0 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let reg = self.reg_name(width, reg);
                self.emit(format!("cmpxchg {rm}, {reg}"));
            }
            0xB2 | 0xB4 | 0xB5 => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let mnemonic = match opcode {
                    0xB2 => "lss",
                    0xB4 => "lfs",
                    _ => "lgs",
                };
                self.emit(format!("{mnemonic} {reg}, {rm}"));
            }
            0xB6 | 0xB7 | 0xBE | 0xBF => {
                let from = if opcode & 1 == 0 { OpSize::Byte } else { OpSize::Word };
                let (reg, rm) = self.modrm(from);
                let reg = self.reg_name(size, reg);
                let mnemonic = if opcode < 0xBE { "movzx" } else { "movsx" };
                self.emit(format!("{mnemonic} {reg}, {rm}"));
            }
            0xBC | 0xBD => {
                let (reg, rm) = self.modrm(size);
                let reg = self.reg_name(size, reg);
                let mnemonic = if opcode == 0xBC { "bsf" } else { "bsr" };
                self.emit(format!("{mnemonic} {reg}, {rm}"));
            }
            0xC0 | 0xC1 => {
                let width = if opcode == 0xC0 { OpSize::Byte } else { size };
                let (reg, rm) = self.modrm(width);
                let reg = self.reg_name(width, reg);
                self.emit(format!("xadd {rm}, {reg}"));
            }
            0xC8..=0xCF => {
                let register = self.reg_name(OpSize::Dword, usize::from(opcode & 7));
                self.emit(format!("bswap {register}"));
            }
            _ => self.emit(format!("db 0x0f, {opcode:#04x}")),
        }
    }
}

impl Cpu {
    /// Render the instruction at CS:`offset` as text. Reads go straight to
    /// the host bus; no architectural state changes.
    pub fn disassemble(&self, bus: &mut dyn Bus, offset: u64) -> String {
        let nec = matches!(
            self.traits.family,
            CpuFamily::V20
                | CpuFamily::V25
                | CpuFamily::V33
                | CpuFamily::V55
                | CpuFamily::Upd9002
        );
        let code_size = self.code_size();
        let mut disassembler = Disassembler {
            cpu: self,
            bus,
            position: offset,
            nec,
            operand_size: if code_size == OpSize::Word { OpSize::Word } else { OpSize::Dword },
            address_size: code_size,
            segment_override: None,
            rex: 0,
            text: String::new(),
        };
        disassembler.run();
        disassembler.text
    }
}
