// 32-bit instruction words
//
//   bits    31..24  23..16  15  14..7  6..0
//   ABC       C       B     k     A     op
//   ABx       ------ Bx ------    A     op
//   AsBx      ------ sBx -----    A     op
//   Ax        ---------- Ax ----------  op
//   sJ        ---------- sJ ----------  op
//
// Signed fields are stored with a bias of half their unsigned range.

use crate::vm::OpCode;

/// Position and width of one operand field
#[derive(Clone, Copy)]
struct Field {
    pos: u32,
    size: u32,
}

impl Field {
    const fn mask(self) -> u32 {
        ((1u64 << self.size) - 1) as u32
    }

    #[inline(always)]
    const fn read(self, word: u32) -> u32 {
        (word >> self.pos) & self.mask()
    }

    #[inline(always)]
    const fn write(self, word: u32, v: u32) -> u32 {
        (word & !(self.mask() << self.pos)) | ((v & self.mask()) << self.pos)
    }
}

const OP: Field = Field { pos: 0, size: 7 };
const A: Field = Field { pos: 7, size: 8 };
const K: Field = Field { pos: 15, size: 1 };
const B: Field = Field { pos: 16, size: 8 };
const C: Field = Field { pos: 24, size: 8 };
const BX: Field = Field { pos: 15, size: 17 };
const AX: Field = Field { pos: 7, size: 25 };

/// One encoded instruction
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction(u32);

impl Instruction {
    pub const SIZE_BX: u32 = BX.size;
    pub const MAX_BX: u32 = BX.mask();
    pub const OFFSET_SBX: i32 = (BX.mask() >> 1) as i32;
    pub const OFFSET_SJ: i32 = (AX.mask() >> 1) as i32;
    pub const MIN_SBX: i32 = -Self::OFFSET_SBX;
    pub const MAX_SBX: i32 = BX.mask() as i32 - Self::OFFSET_SBX;
    pub const MIN_SJ: i32 = -Self::OFFSET_SJ;
    pub const MAX_SJ: i32 = AX.mask() as i32 - Self::OFFSET_SJ;

    #[inline(always)]
    pub const fn from_u32(word: u32) -> Self {
        Self(word)
    }

    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Opcode of this instruction, `None` for an undefined byte
    #[inline(always)]
    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_u8(OP.read(self.0) as u8)
    }

    #[inline(always)]
    pub fn get_a(self) -> u32 {
        A.read(self.0)
    }

    #[inline(always)]
    pub fn get_b(self) -> u32 {
        B.read(self.0)
    }

    #[inline(always)]
    pub fn get_c(self) -> u32 {
        C.read(self.0)
    }

    #[inline(always)]
    pub fn get_k(self) -> bool {
        K.read(self.0) != 0
    }

    #[inline(always)]
    pub fn get_bx(self) -> u32 {
        BX.read(self.0)
    }

    #[inline(always)]
    pub fn get_sbx(self) -> i32 {
        BX.read(self.0) as i32 - Self::OFFSET_SBX
    }

    #[inline(always)]
    pub fn get_ax(self) -> u32 {
        AX.read(self.0)
    }

    #[inline(always)]
    pub fn get_sj(self) -> i32 {
        AX.read(self.0) as i32 - Self::OFFSET_SJ
    }

    /// Rewrite the signed Bx operand, keeping opcode and A
    #[inline(always)]
    pub fn set_sbx(&mut self, offset: i32) {
        self.0 = BX.write(self.0, (offset + Self::OFFSET_SBX) as u32);
    }

    pub fn fits_sbx(offset: i64) -> bool {
        (Self::MIN_SBX as i64..=Self::MAX_SBX as i64).contains(&offset)
    }

    pub fn fits_sj(offset: i64) -> bool {
        (Self::MIN_SJ as i64..=Self::MAX_SJ as i64).contains(&offset)
    }

    pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        Self::create_abck(op, a, b, c, false)
    }

    pub fn create_abck(op: OpCode, a: u32, b: u32, c: u32, k: bool) -> Self {
        let mut w = OP.write(0, op as u32);
        w = A.write(w, a);
        w = K.write(w, k as u32);
        w = B.write(w, b);
        Self(C.write(w, c))
    }

    pub fn create_abx(op: OpCode, a: u32, bx: u32) -> Self {
        Self(BX.write(A.write(OP.write(0, op as u32), a), bx))
    }

    pub fn create_asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::create_abx(op, a, (sbx + Self::OFFSET_SBX) as u32)
    }

    pub fn create_sj(op: OpCode, sj: i32) -> Self {
        Self(AX.write(OP.write(0, op as u32), (sj + Self::OFFSET_SJ) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::opcode::OpMode;

    #[test]
    fn test_abc_fields() {
        let instr = Instruction::create_abck(OpCode::Resume, 5, 10, 20, true);
        assert_eq!(instr.opcode(), Some(OpCode::Resume));
        assert_eq!((instr.get_a(), instr.get_b(), instr.get_c()), (5, 10, 20));
        assert!(instr.get_k());
        assert!(!Instruction::create_abc(OpCode::Move, 1, 2, 3).get_k());
    }

    #[test]
    fn test_field_positions() {
        let raw = Instruction::create_abck(OpCode::Eq, 10, 20, 30, true).as_u32();
        assert_eq!(raw & 0x7F, OpCode::Eq as u32);
        assert_eq!((raw >> 7) & 0xFF, 10);
        assert_eq!((raw >> 15) & 0x1, 1);
        assert_eq!((raw >> 16) & 0xFF, 20);
        assert_eq!(raw >> 24, 30);
    }

    #[test]
    fn test_signed_operands() {
        let back = Instruction::create_asbx(OpCode::Jmp, 0, -100);
        assert_eq!(back.get_sbx(), -100);
        let mut fwd = Instruction::create_asbx(OpCode::JmpIf, 4, Instruction::MAX_SBX);
        assert_eq!(fwd.get_sbx(), Instruction::MAX_SBX);
        fwd.set_sbx(7);
        assert_eq!((fwd.get_a(), fwd.get_sbx()), (4, 7));
        assert_eq!(fwd.opcode(), Some(OpCode::JmpIf));

        let far = Instruction::create_sj(OpCode::JmpX, -500_000);
        assert_eq!(far.get_sj(), -500_000);
    }

    #[test]
    fn test_operand_ranges() {
        assert_eq!(Instruction::OFFSET_SBX, 65535);
        assert_eq!(Instruction::OFFSET_SJ, 16777215);
        assert!(Instruction::fits_sbx(65536));
        assert!(!Instruction::fits_sbx(65537));
        assert!(Instruction::fits_sbx(-65535));
        assert!(!Instruction::fits_sbx(-65536));
        assert!(Instruction::fits_sj(1_000_000));
    }

    #[test]
    fn test_opcode_modes() {
        assert_eq!(OpCode::Move.get_mode(), OpMode::IABC);
        assert_eq!(OpCode::LoadK.get_mode(), OpMode::IABx);
        assert_eq!(OpCode::Jmp.get_mode(), OpMode::IAsBx);
        assert_eq!(OpCode::JmpX.get_mode(), OpMode::IsJ);
        assert_eq!(OpCode::ExtraArg.get_mode(), OpMode::IAx);
    }

    #[test]
    fn test_undefined_opcode() {
        assert_eq!(Instruction::from_u32(0x7F).opcode(), None);
    }
}
