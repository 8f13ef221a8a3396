//! P-code: the final bytecode emitted by the lowerer (§4.7) and the
//! `Program` value handed to the VM loader (§6). Execution is the VM's
//! responsibility and out of scope here; this module fixes only the
//! opcode enumeration and the in-memory layout.

/// P-code opcode. Binary operations that took a register/literal choice
/// in Q-code expand here into `_RR`/`_RL`/`_LR`/`_LL` forms selected by
/// the lowerer (§4.7, "Opcode selection").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum POpcode {
    Nop = 0x00,
    LdNum = 0x01,
    LdInt = 0x02,
    LdFlt = 0x03,
    LdBlF = 0x04,
    LdBlT = 0x05,
    LdStr = 0x06,
    LdNul = 0x07,
    LdStk = 0x08,
    LdPub = 0x09,
    LdBind = 0x0A,
    LdStkN = 0x0B,
    LdAttr = 0x0C,
    LdAttrQ = 0x0D,
    LdIndx = 0x0E,
    LdIndxQ = 0x0F,
    Mov = 0x10,
    StPub = 0x11,
    StAttr = 0x14,
    StWith = 0x15,
    StIndx = 0x16,
    StStk = 0x18,
    StBind = 0x1A,
    DePub = 0x21,
    DeAttr = 0x24,
    DeIndx = 0x26,
    LdAttrF = 0x3C,

    AddRR = 0x40,
    SubRR = 0x41,
    MulRR = 0x42,
    DivRR = 0x43,
    IdivRR = 0x44,
    ModRR = 0x45,
    AndRR = 0x46,
    BorRR = 0x47,
    XorRR = 0x48,
    ShlRR = 0x49,
    ShrRR = 0x4A,
    CatRR = 0x4B,
    CeqRR = 0x4C,
    CltRR = 0x4D,

    AddRL = 0x50,
    SubRL = 0x51,
    MulRL = 0x52,
    DivRL = 0x53,
    IdivRL = 0x54,
    ModRL = 0x55,
    AndRL = 0x56,
    BorRL = 0x57,
    XorRL = 0x58,
    ShlRL = 0x59,
    ShrRL = 0x5A,
    CatRL = 0x5B,
    CeqRL = 0x5C,
    CltRL = 0x5D,

    AddLR = 0x60,
    SubLR = 0x61,
    MulLR = 0x62,
    DivLR = 0x63,
    IdivLR = 0x64,
    ModLR = 0x65,
    AndLR = 0x66,
    BorLR = 0x67,
    XorLR = 0x68,
    ShlLR = 0x69,
    ShrLR = 0x6A,
    CatLR = 0x6B,
    CeqLR = 0x6C,
    CltLR = 0x6D,

    AddLL = 0x70,
    SubLL = 0x71,
    MulLL = 0x72,
    DivLL = 0x73,
    IdivLL = 0x74,
    ModLL = 0x75,
    AndLL = 0x76,
    BorLL = 0x77,
    XorLL = 0x78,
    ShlLL = 0x79,
    ShrLL = 0x7A,
    CatLL = 0x7B,
    CeqLL = 0x7C,
    CltLL = 0x7D,

    LnotR = 0x80,
    UposR = 0x81,
    UnegR = 0x82,
    UxorR = 0x83,

    LnotL = 0x90,
    UposL = 0x91,
    UnegL = 0x92,
    UxorL = 0x93,

    /// Jumps are absolute within a function but relative to the
    /// function's own base when laid out in `code_bytes`.
    Iff = 0xC0,
    Ift = 0xC1,
    Jmp = 0xC2,
    Exit = 0xC3,
    Exit0 = 0xC4,
    Exit1 = 0xC5,
    Wpush = 0xC6,
    Wpop = 0xC7,
    Rpush = 0xC8,
    Rpop = 0xC9,
    Xpush = 0xCA,
    Xpop = 0xCB,
    Lsprs = 0xCC,
    Lspr = 0xCD,
    Cstk = 0xCE,
    CstkG = 0xCF,
    Mlist = 0xD0,
    Ndict = 0xD1,
    MlistP = 0xD2,
    Iiter = 0xD3,
    Fmake = 0xD4,
    Fbind = 0xD5,
    InextS = 0xD6,
    Inext = 0xD7,
    DcallS = 0xD8,
    Dcall = 0xD9,
    Dtail = 0xDA,
    FcallS = 0xDC,
    Fcall = 0xDD,
    Ftail = 0xDE,

    /// Never a valid instruction; a disassembler or VM that encounters it
    /// treats it as a NOP. Lowered dead code is never actually emitted —
    /// this exists only as the shared sentinel value with the Q-code
    /// `Delete` opcode.
    Del = 0xFF,
}

/// Tag distinguishing the four literal kinds a `LDNUM`-family instruction
/// can carry (used by the disassembler/loader, not interpreted here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LitKind {
    Nul = 0,
    Int = 1,
    Flt = 2,
    Str = 3,
}

/// Per-function header emitted into `data_bytes` (§4.7, "Layout").
/// The exact byte layout is an implementation detail of the VM's loader
/// contract; this struct is the in-memory shape the lowerer builds before
/// serializing it.
#[derive(Debug, Clone)]
pub struct FunctionHeader {
    pub arg_count: u32,
    pub optional_arg_count: u32,
    pub temp_count: u32,
    pub local_count: u32,
    pub exhale_count: u32,
    pub inhale_count: u32,
    /// Byte offset of this function's first instruction within
    /// `code_bytes`.
    pub entry_offset: u32,
    /// Identifier-pool (remapped, compacted) offset of the function's
    /// name, or `FUNC_NONAME`.
    pub name_pool_offset: u32,
    /// Width in bytes (1..=4) chosen for this function's jump operands.
    pub jump_width: u8,
    /// `(is_exhale, index)` pairs, one per inhale slot, naming where in
    /// the parent's operand space the source value lives.
    pub inhale_sources: Vec<(bool, u32)>,
}

/// The final output of the pipeline: compact bytecode plus the pool and
/// per-function metadata needed to load it (§6).
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
}

impl Program {
    /// Bytecode format version stamped into `data_bytes`'s header by the
    /// lowerer. Bumped only when the opcode table changes.
    pub const VERSION: u8 = 1;

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_match_the_fixed_byte_assignment() {
        assert_eq!(POpcode::Nop as u8, 0x00);
        assert_eq!(POpcode::AddRR as u8, 0x40);
        assert_eq!(POpcode::AddLL as u8, 0x70);
        assert_eq!(POpcode::Jmp as u8, 0xC2);
        assert_eq!(POpcode::Del as u8, 0xFF);
    }
}
