//! VEX / EVEX byte encoding for the vector instructions the builders use.
//!
//! `dynasm` covers the general-purpose side of the kernels but has no
//! EVEX encoder, so every vector instruction goes through this module and
//! is pushed into the assembler as raw bytes. Memory operands always use a
//! 32-bit displacement: EVEX only compresses 8-bit displacements, so
//! `disp32` keeps the two encodings identical apart from the prefix.

/// General-purpose registers by hardware number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gp {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gp {
    #[inline]
    fn num(self) -> u8 {
        self as u8
    }
}

/// `[base + index + disp]` with an implicit scale of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gp,
    pub index: Option<Gp>,
    pub disp: i32,
}

impl Mem {
    /// `[base + disp]`
    pub fn base(base: Gp, disp: i32) -> Self {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    /// `[base + index + disp]`
    pub fn indexed(base: Gp, index: Gp, disp: i32) -> Self {
        debug_assert!(index != Gp::Rsp, "rsp cannot be an index register");
        Mem {
            base,
            index: Some(index),
            disp,
        }
    }
}

/// The `r/m` operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    /// Register number (vector, opmask or general purpose, per opcode).
    Reg(u8),
    Mem(Mem),
}

/// Opcode map selected by the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Map {
    M0F = 1,
    M0F38 = 2,
    M0F3A = 3,
}

/// Implied legacy prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pp {
    None = 0,
    P66 = 1,
    PF3 = 2,
    PF2 = 3,
}

/// Prefix flavour and vector length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// VEX with L=0 (scalar/opmask moves).
    Vex128,
    /// VEX with L=1 (ymm).
    Vex256,
    /// EVEX with L'L=10 (zmm).
    Evex512,
}

/// Opcode identity shared by the VEX and EVEX forms of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub map: Map,
    pub pp: Pp,
    pub op: u8,
    pub w: bool,
}

const fn opc(map: Map, pp: Pp, op: u8) -> Opcode {
    Opcode {
        map,
        pp,
        op,
        w: false,
    }
}

pub const VMOVUPS_LOAD: Opcode = opc(Map::M0F, Pp::None, 0x10);
pub const VMOVUPS_STORE: Opcode = opc(Map::M0F, Pp::None, 0x11);
pub const VADDPS: Opcode = opc(Map::M0F, Pp::None, 0x58);
pub const VMULPS: Opcode = opc(Map::M0F, Pp::None, 0x59);
pub const VCVTDQ2PS: Opcode = opc(Map::M0F, Pp::None, 0x5B);
pub const VDIVPS: Opcode = opc(Map::M0F, Pp::None, 0x5E);
pub const KMOVW_FROM_GP: Opcode = opc(Map::M0F, Pp::None, 0x92);
pub const VPMADDWD: Opcode = opc(Map::M0F, Pp::P66, 0xF5);
pub const VPXOR: Opcode = opc(Map::M0F, Pp::P66, 0xEF);
pub const VPADDD: Opcode = opc(Map::M0F, Pp::P66, 0xFE);
pub const VPMADDUBSW: Opcode = opc(Map::M0F38, Pp::P66, 0x04);
pub const VBROADCASTSS: Opcode = opc(Map::M0F38, Pp::P66, 0x18);
pub const VMASKMOVPS_LOAD: Opcode = opc(Map::M0F38, Pp::P66, 0x2C);
pub const VMASKMOVPS_STORE: Opcode = opc(Map::M0F38, Pp::P66, 0x2E);
pub const VPMOVZXBD: Opcode = opc(Map::M0F38, Pp::P66, 0x31);
pub const VPBROADCASTD: Opcode = opc(Map::M0F38, Pp::P66, 0x58);
pub const VFMADD231PS: Opcode = opc(Map::M0F38, Pp::P66, 0xB8);

/// One fully described instruction.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    pub opcode: Opcode,
    /// ModRM.reg operand (destination for most instructions).
    pub reg: u8,
    /// Second source in VEX.vvvv; 0 when the instruction has none.
    pub vvvv: u8,
    pub rm: Rm,
    /// Opmask register for EVEX predication, 0 for none.
    pub mask: u8,
}

/// Appends the encoding of `insn` to `out`.
pub fn encode(out: &mut Vec<u8>, enc: Encoding, insn: &Insn) {
    let reg = insn.reg;
    let vvvv = insn.vvvv;
    // (X, B) extension bits before inversion
    let (x, b) = match insn.rm {
        Rm::Reg(r) => ((r >> 4) & 1, (r >> 3) & 1),
        Rm::Mem(m) => (m.index.map_or(0, |i| (i.num() >> 3) & 1), (m.base.num() >> 3) & 1),
    };
    let r = (reg >> 3) & 1;
    let map = insn.opcode.map as u8;
    let pp = insn.opcode.pp as u8;
    let w = insn.opcode.w as u8;

    match enc {
        Encoding::Vex128 | Encoding::Vex256 => {
            debug_assert!(reg < 16 && vvvv < 16 && insn.mask == 0);
            debug_assert!(!matches!(insn.rm, Rm::Reg(rr) if rr >= 16));
            let l = (enc == Encoding::Vex256) as u8;
            out.push(0xC4);
            out.push(((r ^ 1) << 7) | ((x ^ 1) << 6) | ((b ^ 1) << 5) | map);
            out.push((w << 7) | ((!vvvv & 0x0F) << 3) | (l << 2) | pp);
        }
        Encoding::Evex512 => {
            debug_assert!(reg < 32 && vvvv < 32 && insn.mask < 8);
            let r_hi = (reg >> 4) & 1;
            let v_hi = (vvvv >> 4) & 1;
            out.push(0x62);
            out.push(((r ^ 1) << 7) | ((x ^ 1) << 6) | ((b ^ 1) << 5) | ((r_hi ^ 1) << 4) | map);
            out.push((w << 7) | ((!vvvv & 0x0F) << 3) | 0x04 | pp);
            out.push((0b10 << 5) | ((v_hi ^ 1) << 3) | insn.mask);
        }
    }

    out.push(insn.opcode.op);
    encode_modrm(out, reg, &insn.rm);
}

/// ModRM (+ SIB + disp32) for a register field and an r/m operand.
fn encode_modrm(out: &mut Vec<u8>, reg: u8, rm: &Rm) {
    match *rm {
        Rm::Reg(r) => out.push(0xC0 | ((reg & 7) << 3) | (r & 7)),
        Rm::Mem(m) => {
            let base = m.base.num() & 7;
            match m.index {
                Some(index) => {
                    out.push(0x80 | ((reg & 7) << 3) | 0b100);
                    out.push(((index.num() & 7) << 3) | base);
                }
                // rsp/r12 as base needs a SIB byte with "no index"
                None if base == 0b100 => {
                    out.push(0x80 | ((reg & 7) << 3) | 0b100);
                    out.push(0x24);
                }
                None => out.push(0x80 | ((reg & 7) << 3) | base),
            }
            out.extend_from_slice(&m.disp.to_le_bytes());
        }
    }
}

/// `prefetcht0 m8`
pub fn encode_prefetcht0(out: &mut Vec<u8>, mem: Mem) {
    let x = mem.index.map_or(0, |i| (i.num() >> 3) & 1);
    let b = (mem.base.num() >> 3) & 1;
    if x | b != 0 {
        out.push(0x40 | (x << 1) | b);
    }
    out.extend_from_slice(&[0x0F, 0x18]);
    encode_modrm(out, 1, &Rm::Mem(mem));
}

/// `movsxd dst, DWORD [mem]`
pub fn encode_movsxd(out: &mut Vec<u8>, dst: Gp, mem: Mem) {
    let r = (dst.num() >> 3) & 1;
    let x = mem.index.map_or(0, |i| (i.num() >> 3) & 1);
    let b = (mem.base.num() >> 3) & 1;
    out.push(0x48 | (r << 2) | (x << 1) | b);
    out.push(0x63);
    encode_modrm(out, dst.num(), &Rm::Mem(mem));
}

/// `vzeroupper`
pub fn encode_vzeroupper(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0xC5, 0xF8, 0x77]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(enc: Encoding, insn: Insn) -> Vec<u8> {
        let mut out = Vec::new();
        encode(&mut out, enc, &insn);
        out
    }

    fn rr(opcode: Opcode, reg: u8, vvvv: u8, rm: u8, mask: u8) -> Insn {
        Insn {
            opcode,
            reg,
            vvvv,
            rm: Rm::Reg(rm),
            mask,
        }
    }

    #[test]
    fn test_vex_register_form() {
        // vaddps ymm0, ymm1, ymm2
        assert_eq!(
            bytes(Encoding::Vex256, rr(VADDPS, 0, 1, 2, 0)),
            vec![0xC4, 0xE1, 0x74, 0x58, 0xC2]
        );
    }

    #[test]
    fn test_evex_register_forms() {
        // vaddps zmm0, zmm1, zmm2
        assert_eq!(
            bytes(Encoding::Evex512, rr(VADDPS, 0, 1, 2, 0)),
            vec![0x62, 0xF1, 0x74, 0x48, 0x58, 0xC2]
        );
        // vfmadd231ps zmm0{k1}, zmm1, zmm2
        assert_eq!(
            bytes(Encoding::Evex512, rr(VFMADD231PS, 0, 1, 2, 1)),
            vec![0x62, 0xF2, 0x75, 0x49, 0xB8, 0xC2]
        );
        // vpxord zmm16, zmm16, zmm16
        assert_eq!(
            bytes(Encoding::Evex512, rr(VPXOR, 16, 16, 16, 0)),
            vec![0x62, 0xA1, 0x7D, 0x40, 0xEF, 0xC0]
        );
    }

    #[test]
    fn test_memory_operands() {
        // vmovups ymm3, [rcx + r13 + 0x10]
        let insn = Insn {
            opcode: VMOVUPS_LOAD,
            reg: 3,
            vvvv: 0,
            rm: Rm::Mem(Mem::indexed(Gp::Rcx, Gp::R13, 0x10)),
            mask: 0,
        };
        assert_eq!(
            bytes(Encoding::Vex256, insn),
            vec![0xC4, 0xA1, 0x7C, 0x10, 0x9C, 0x29, 0x10, 0x00, 0x00, 0x00]
        );

        // vbroadcastss ymm1, [rsp + 32]
        let insn = Insn {
            opcode: VBROADCASTSS,
            reg: 1,
            vvvv: 0,
            rm: Rm::Mem(Mem::base(Gp::Rsp, 32)),
            mask: 0,
        };
        assert_eq!(
            bytes(Encoding::Vex256, insn),
            vec![0xC4, 0xE2, 0x7D, 0x18, 0x8C, 0x24, 0x20, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_kmovw_and_prefetch() {
        // kmovw k1, eax
        assert_eq!(
            bytes(Encoding::Vex128, rr(KMOVW_FROM_GP, 1, 0, 0, 0)),
            vec![0xC4, 0xE1, 0x78, 0x92, 0xC8]
        );

        let mut out = Vec::new();
        encode_prefetcht0(&mut out, Mem::indexed(Gp::Rcx, Gp::R14, 0x40));
        assert_eq!(out, vec![0x42, 0x0F, 0x18, 0x8C, 0x31, 0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_movsxd() {
        let mut out = Vec::new();
        encode_movsxd(&mut out, Gp::R13, Mem::base(Gp::R8, 0));
        assert_eq!(out, vec![0x4D, 0x63, 0xA8, 0x00, 0x00, 0x00, 0x00]);

        out.clear();
        encode_movsxd(&mut out, Gp::Rax, Mem::base(Gp::Rax, 0));
        assert_eq!(out, vec![0x48, 0x63, 0x80, 0x00, 0x00, 0x00, 0x00]);
    }
}
