//! P-code disassembler (§6: `-S` dumps disassembly instead of writing a
//! program file; §9 calls for "a single component parameterized by its
//! output sink" rather than the three near-duplicate disassemblers the
//! source carries). This is that one component: it reads a `Program`'s
//! `data` section to recover the pool and per-function headers, then
//! walks `code` per function, decoding each instruction's operand shape
//! from its opcode — the exact inverse of `lowerer::lower`'s encoding
//! table. It writes text to whatever `io::Write` the caller hands it, so
//! the CLI's `-S` and any future debug tool share one implementation.

use std::io::{self, Write};

use quillc_core::codec::{decode_clq, decode_vlq_int, decode_vlq_size};
use quillc_core::program::{POpcode, Program};

/// One function header as read back out of `data` (mirrors
/// `quillc_core::program::FunctionHeader`, but every field already
/// decoded — there is no encoder-side struct to reuse since the header
/// only exists pre-serialization in the lowerer).
struct Header {
    arg_count: u64,
    optional_arg_count: u64,
    temp_count: u64,
    local_count: u64,
    exhale_count: u64,
    inhale_count: u64,
    entry_offset: u64,
    name_pool_offset: Option<u64>,
    jump_width: u8,
    inhale_sources: Vec<(bool, u64)>,
}

struct DataSection {
    version: u8,
    pool: Vec<String>,
    headers: Vec<Header>,
}

fn pool_name(pool: &[String], idx: u64) -> String {
    pool.get(idx as usize).cloned().unwrap_or_else(|| format!("<pool#{idx}>"))
}

fn take_size(bytes: &[u8], pos: &mut usize) -> io::Result<u64> {
    if *pos > bytes.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated data section"));
    }
    let (v, used) = decode_vlq_size(&bytes[*pos..]);
    if used == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated VLQ-size field"));
    }
    *pos += used;
    Ok(v)
}

fn take_byte(bytes: &[u8], pos: &mut usize) -> io::Result<u8> {
    let b = *bytes.get(*pos).ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated data section"))?;
    *pos += 1;
    Ok(b)
}

/// Parse `Program::data`, the layout `lowerer::serialize_data` writes:
/// version byte, VLQ-size-prefixed merged pool, VLQ-size function count,
/// then each function's header fields in declaration order.
fn parse_data(data: &[u8]) -> io::Result<DataSection> {
    let mut pos = 0usize;
    let version = take_byte(data, &mut pos)?;

    let pool_len = take_size(data, &mut pos)? as usize;
    let pool_end = pos.checked_add(pool_len).ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "pool length overflow"))?;
    if pool_end > data.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated pool bytes"));
    }
    let pool_bytes = &data[pos..pool_end];
    let pool: Vec<String> = if pool_bytes.is_empty() {
        Vec::new()
    } else {
        pool_bytes.split(|&b| b == 0).filter(|s| !s.is_empty()).map(|s| String::from_utf8_lossy(s).into_owned()).collect()
    };
    pos = pool_end;

    let header_count = take_size(data, &mut pos)?;
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let arg_count = take_size(data, &mut pos)?;
        let optional_arg_count = take_size(data, &mut pos)?;
        let temp_count = take_size(data, &mut pos)?;
        let local_count = take_size(data, &mut pos)?;
        let exhale_count = take_size(data, &mut pos)?;
        let inhale_count = take_size(data, &mut pos)?;
        let entry_offset = take_size(data, &mut pos)?;
        let has_name = take_byte(data, &mut pos)?;
        let name_pool_offset = if has_name == 0 { None } else { Some(take_size(data, &mut pos)?) };
        let jump_width = take_byte(data, &mut pos)?;
        let inhale_len = take_size(data, &mut pos)?;
        let mut inhale_sources = Vec::with_capacity(inhale_len as usize);
        for _ in 0..inhale_len {
            let is_exhale = take_byte(data, &mut pos)? != 0;
            let idx = take_size(data, &mut pos)?;
            inhale_sources.push((is_exhale, idx));
        }
        headers.push(Header {
            arg_count,
            optional_arg_count,
            temp_count,
            local_count,
            exhale_count,
            inhale_count,
            entry_offset,
            name_pool_offset,
            jump_width,
            inhale_sources,
        });
    }

    Ok(DataSection { version, pool, headers })
}

/// Operand shapes that appear in P-code instruction prefixes. Every
/// operand the lowerer materializes (rather than embeds as an immediate
/// or pool reference) ends up a plain register reference in the
/// consuming instruction — the value computation becomes its own
/// preceding `Ld*` instruction — so `Reg` covers all of those uniformly.
#[derive(Clone, Copy)]
enum Shape {
    /// Register kind tag + fixed-width index (`lowerer::encode_register`).
    Reg,
    /// 16-bit signed immediate (`lowerer::encode_imm16`).
    Imm16,
    /// VLQ-size index into the merged string/identifier pool.
    PoolRef,
    /// VLQ-size index into the function table.
    FuncIdx,
    /// VLQ-size unsigned immediate.
    UnsignedImm,
    /// Tag byte + VLQ-size offset (`lowerer::encode_stack_ref`).
    StackRef,
    /// VLQ-int payload (`LDINT`).
    VlqInt,
    /// Fixed 8-byte little-endian double (`LDFLT`).
    F64,
}

/// Register-operand byte width: one kind-tag byte plus `lowerer::REGW`
/// (1) index bytes.
const REG_BYTES: usize = 2;

fn shape_len(bytes: &[u8], pos: usize, shape: Shape) -> io::Result<usize> {
    let eof = || io::Error::new(io::ErrorKind::UnexpectedEof, "truncated instruction operand");
    Ok(match shape {
        Shape::Reg => REG_BYTES,
        Shape::Imm16 => 2,
        Shape::F64 => 8,
        Shape::PoolRef | Shape::UnsignedImm | Shape::FuncIdx => {
            let (_, used) = decode_vlq_size(bytes.get(pos..).ok_or_else(eof)?);
            if used == 0 {
                return Err(eof());
            }
            used
        }
        Shape::VlqInt => {
            let (_, used) = decode_vlq_int(bytes.get(pos..).ok_or_else(eof)?);
            if used == 0 {
                return Err(eof());
            }
            used
        }
        Shape::StackRef => {
            let rest = bytes.get(pos + 1..).ok_or_else(eof)?;
            let (_, used) = decode_vlq_size(rest);
            if used == 0 {
                return Err(eof());
            }
            1 + used
        }
    })
}

fn describe_shape(bytes: &[u8], pos: &mut usize, shape: Shape, pool: &[String]) -> io::Result<String> {
    let len = shape_len(bytes, *pos, shape)?;
    let slice = &bytes[*pos..*pos + len];
    let text = match shape {
        Shape::Reg => {
            let kind = match slice[0] {
                0 => "t",
                1 => "l",
                2 => "e",
                3 => "i",
                other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad register kind tag {other}"))),
            };
            format!("{kind}{}", decode_clq(1, &slice[1..]))
        }
        Shape::Imm16 => {
            let mut buf = [0u8; 2];
            buf.copy_from_slice(slice);
            format!("#{}", i16::from_le_bytes(buf))
        }
        Shape::PoolRef => {
            let (idx, _) = decode_vlq_size(slice);
            format!("{:?}", pool_name(pool, idx))
        }
        Shape::FuncIdx => {
            let (idx, _) = decode_vlq_size(slice);
            format!("fn#{idx}")
        }
        Shape::UnsignedImm => {
            let (v, _) = decode_vlq_size(slice);
            v.to_string()
        }
        Shape::StackRef => {
            let (n, _) = decode_vlq_size(&slice[1..]);
            if slice[0] == 0 { format!("base+{n}") } else { format!("end-{n}") }
        }
        Shape::VlqInt => {
            let (v, _) = decode_vlq_int(slice);
            v.to_string()
        }
        Shape::F64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slice);
            f64::from_le_bytes(buf).to_string()
        }
    };
    *pos += len;
    Ok(text)
}

/// Whether `op` is followed by a jump-width-sized target offset, and the
/// fixed prefix shape (before that target) each opcode carries. Mirrors
/// `lowerer::lower_one`/`lower_call`/`materialize_and_encode` exactly.
fn opcode_shape(op: POpcode) -> Option<(&'static [Shape], bool)> {
    use Shape::*;
    Some(match op {
        POpcode::Nop => (&[], false),
        POpcode::LdInt => (&[Reg, VlqInt], false),
        POpcode::LdFlt => (&[Reg, F64], false),
        POpcode::LdBlF | POpcode::LdBlT | POpcode::LdNul => (&[Reg], false),
        POpcode::LdStr => (&[Reg, PoolRef], false),
        POpcode::LdStkN => (&[Reg, StackRef], false),
        POpcode::LdPub => (&[Reg, PoolRef], false),
        POpcode::LdBind => (&[Reg, Reg], false),
        POpcode::LdAttr | POpcode::LdAttrQ => (&[Reg, Reg, PoolRef], false),
        POpcode::LdIndx | POpcode::LdIndxQ => (&[Reg, Reg, Reg], false),
        POpcode::Mov => (&[Reg, Reg], false),
        POpcode::StPub => (&[PoolRef, Reg], false),
        POpcode::StAttr => (&[Reg, PoolRef, Reg], false),
        POpcode::StWith => (&[Reg], false),
        POpcode::StIndx => (&[Reg, Reg, Reg], false),
        POpcode::StStk => (&[Reg], false),
        POpcode::StBind => (&[Reg, Reg], false),
        POpcode::DePub => (&[PoolRef], false),
        POpcode::DeAttr => (&[Reg, PoolRef], false),
        POpcode::DeIndx => (&[Reg, Reg], false),

        POpcode::AddRR | POpcode::SubRR | POpcode::MulRR | POpcode::DivRR | POpcode::IdivRR
        | POpcode::ModRR | POpcode::AndRR | POpcode::BorRR | POpcode::XorRR | POpcode::ShlRR
        | POpcode::ShrRR | POpcode::CatRR | POpcode::CeqRR | POpcode::CltRR
        | POpcode::AddRL | POpcode::SubRL | POpcode::MulRL | POpcode::DivRL | POpcode::IdivRL
        | POpcode::ModRL | POpcode::AndRL | POpcode::BorRL | POpcode::XorRL | POpcode::ShlRL
        | POpcode::ShrRL | POpcode::CatRL | POpcode::CeqRL | POpcode::CltRL
        | POpcode::AddLR | POpcode::SubLR | POpcode::MulLR | POpcode::DivLR | POpcode::IdivLR
        | POpcode::ModLR | POpcode::AndLR | POpcode::BorLR | POpcode::XorLR | POpcode::ShlLR
        | POpcode::ShrLR | POpcode::CatLR | POpcode::CeqLR | POpcode::CltLR
        | POpcode::AddLL | POpcode::SubLL | POpcode::MulLL | POpcode::DivLL | POpcode::IdivLL
        | POpcode::ModLL | POpcode::AndLL | POpcode::BorLL | POpcode::XorLL | POpcode::ShlLL
        | POpcode::ShrLL | POpcode::CatLL | POpcode::CeqLL | POpcode::CltLL => {
            // every binop variant is dst + two 2-byte operands, register
            // or 16-bit immediate alike (both encode to 2 bytes).
            (&[Reg, Imm16, Imm16], false) // placeholder length only; real decode below special-cases this
        }

        POpcode::LnotR | POpcode::UposR | POpcode::UnegR | POpcode::UxorR => (&[Reg, Reg], false),
        POpcode::LnotL | POpcode::UposL | POpcode::UnegL | POpcode::UxorL => (&[Reg, Imm16], false),

        POpcode::Iff | POpcode::Ift => (&[Reg], true),
        POpcode::Jmp => (&[], true),
        POpcode::Exit => (&[], false),
        POpcode::Exit0 => (&[], false),
        POpcode::Exit1 => (&[Reg], false),
        POpcode::Wpush => (&[], false),
        POpcode::Wpop => (&[UnsignedImm], false),
        POpcode::Rpush | POpcode::Rpop => (&[], false),
        POpcode::Xpush => (&[], true),
        POpcode::Xpop => (&[], false),
        POpcode::Lsprs => (&[], false),
        POpcode::Lspr => (&[Reg], false),
        POpcode::Cstk | POpcode::CstkG => (&[UnsignedImm], false),
        POpcode::Mlist | POpcode::Ndict => (&[Reg], false),
        POpcode::MlistP => (&[Reg, StackRef, StackRef], false),
        POpcode::Iiter => (&[Reg, Reg], false),
        POpcode::Fmake => (&[Reg, FuncIdx], false),
        POpcode::Fbind => (&[Reg, Reg, Reg], false),
        POpcode::InextS => (&[Reg], true),
        POpcode::Inext => (&[Reg, Reg], true),
        POpcode::DcallS => (&[FuncIdx], false),
        POpcode::Dcall => (&[Reg, FuncIdx], false),
        POpcode::Dtail => (&[FuncIdx], false),
        POpcode::FcallS => (&[Reg], false),
        POpcode::Fcall => (&[Reg, Reg], false),
        POpcode::Ftail => (&[Reg], false),

        // Present in the fixed byte assignment but never emitted by this
        // lowerer (no call site constructs them); a disassembler should
        // never meet them in practice.
        POpcode::LdNum | POpcode::LdStk | POpcode::LdAttrF | POpcode::Del => return None,
    })
}

fn decode_binop_operand(bytes: &[u8], pos: &mut usize, pool: &[String], is_imm: bool) -> io::Result<String> {
    describe_shape(bytes, pos, if is_imm { Shape::Imm16 } else { Shape::Reg }, pool)
}

/// Write one function's disassembly (header line, then one line per
/// instruction) to `out`.
fn disassemble_function(index: usize, header: &Header, code: &[u8], end: usize, pool: &[String], out: &mut dyn Write) -> io::Result<()> {
    let name = match header.name_pool_offset {
        Some(idx) => pool_name(pool, idx),
        None => format!("<anon#{index}>"),
    };
    writeln!(
        out,
        "function {name} (args={} optional={} temps={} locals={} exhale={} inhale={} jump_width={})",
        header.arg_count, header.optional_arg_count, header.temp_count, header.local_count, header.exhale_count, header.inhale_count, header.jump_width
    )?;
    for (is_exhale, idx) in &header.inhale_sources {
        writeln!(out, "  inhale <- {} {idx}", if *is_exhale { "exhale" } else { "inhale" })?;
    }

    let mut pos = header.entry_offset as usize;
    while pos < end {
        let start = pos - header.entry_offset as usize;
        let op_byte = code[pos];
        let op = byte_to_opcode(op_byte);
        pos += 1;
        let Some(op) = op else {
            writeln!(out, "  {start:>6}: .byte {op_byte:#04x}  ; unrecognized opcode")?;
            continue;
        };
        let Some((shapes, has_jump)) = opcode_shape(op) else {
            writeln!(out, "  {start:>6}: {op:?}  ; reserved, never emitted")?;
            continue;
        };

        let mut operand_text = Vec::new();
        if is_binop(op) {
            let (is_imm1, is_imm2) = binop_immediate_flags(op);
            operand_text.push(describe_shape(code, &mut pos, Shape::Reg, pool)?);
            operand_text.push(decode_binop_operand(code, &mut pos, pool, is_imm1)?);
            operand_text.push(decode_binop_operand(code, &mut pos, pool, is_imm2)?);
        } else if is_unop(op) {
            let is_imm = matches!(op, POpcode::LnotL | POpcode::UposL | POpcode::UnegL | POpcode::UxorL);
            operand_text.push(describe_shape(code, &mut pos, Shape::Reg, pool)?);
            operand_text.push(decode_binop_operand(code, &mut pos, pool, is_imm)?);
        } else {
            for shape in shapes {
                operand_text.push(describe_shape(code, &mut pos, *shape, pool)?);
            }
        }

        if has_jump {
            if pos + header.jump_width as usize > code.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated jump target"));
            }
            let target = decode_clq(header.jump_width, &code[pos..]);
            pos += header.jump_width as usize;
            operand_text.push(format!("-> {target}"));
        }

        if operand_text.is_empty() {
            writeln!(out, "  {start:>6}: {op:?}")?;
        } else {
            writeln!(out, "  {start:>6}: {op:?} {}", operand_text.join(", "))?;
        }
    }
    Ok(())
}

fn is_binop(op: POpcode) -> bool {
    matches!(
        op,
        POpcode::AddRR | POpcode::SubRR | POpcode::MulRR | POpcode::DivRR | POpcode::IdivRR
            | POpcode::ModRR | POpcode::AndRR | POpcode::BorRR | POpcode::XorRR | POpcode::ShlRR
            | POpcode::ShrRR | POpcode::CatRR | POpcode::CeqRR | POpcode::CltRR
            | POpcode::AddRL | POpcode::SubRL | POpcode::MulRL | POpcode::DivRL | POpcode::IdivRL
            | POpcode::ModRL | POpcode::AndRL | POpcode::BorRL | POpcode::XorRL | POpcode::ShlRL
            | POpcode::ShrRL | POpcode::CatRL | POpcode::CeqRL | POpcode::CltRL
            | POpcode::AddLR | POpcode::SubLR | POpcode::MulLR | POpcode::DivLR | POpcode::IdivLR
            | POpcode::ModLR | POpcode::AndLR | POpcode::BorLR | POpcode::XorLR | POpcode::ShlLR
            | POpcode::ShrLR | POpcode::CatLR | POpcode::CeqLR | POpcode::CltLR
            | POpcode::AddLL | POpcode::SubLL | POpcode::MulLL | POpcode::DivLL | POpcode::IdivLL
            | POpcode::ModLL | POpcode::AndLL | POpcode::BorLL | POpcode::XorLL | POpcode::ShlLL
            | POpcode::ShrLL | POpcode::CatLL | POpcode::CeqLL | POpcode::CltLL
    )
}

fn is_unop(op: POpcode) -> bool {
    matches!(
        op,
        POpcode::LnotR | POpcode::UposR | POpcode::UnegR | POpcode::UxorR | POpcode::LnotL | POpcode::UposL | POpcode::UnegL | POpcode::UxorL
    )
}

/// `_RR` families take two registers, `_RL` a register then an
/// immediate, `_LR` the reverse, `_LL` two immediates — exactly mirroring
/// `binop_variant`'s family ordering.
fn binop_immediate_flags(op: POpcode) -> (bool, bool) {
    let byte = op as u8;
    match byte & 0xF0 {
        0x40 => (false, false),
        0x50 => (false, true),
        0x60 => (true, false),
        0x70 => (true, true),
        _ => (false, false),
    }
}

fn byte_to_opcode(byte: u8) -> Option<POpcode> {
    use POpcode::*;
    Some(match byte {
        0x00 => Nop,
        0x01 => LdNum,
        0x02 => LdInt,
        0x03 => LdFlt,
        0x04 => LdBlF,
        0x05 => LdBlT,
        0x06 => LdStr,
        0x07 => LdNul,
        0x08 => LdStk,
        0x09 => LdPub,
        0x0A => LdBind,
        0x0B => LdStkN,
        0x0C => LdAttr,
        0x0D => LdAttrQ,
        0x0E => LdIndx,
        0x0F => LdIndxQ,
        0x10 => Mov,
        0x11 => StPub,
        0x14 => StAttr,
        0x15 => StWith,
        0x16 => StIndx,
        0x18 => StStk,
        0x1A => StBind,
        0x21 => DePub,
        0x24 => DeAttr,
        0x26 => DeIndx,
        0x3C => LdAttrF,
        0x40 => AddRR,
        0x41 => SubRR,
        0x42 => MulRR,
        0x43 => DivRR,
        0x44 => IdivRR,
        0x45 => ModRR,
        0x46 => AndRR,
        0x47 => BorRR,
        0x48 => XorRR,
        0x49 => ShlRR,
        0x4A => ShrRR,
        0x4B => CatRR,
        0x4C => CeqRR,
        0x4D => CltRR,
        0x50 => AddRL,
        0x51 => SubRL,
        0x52 => MulRL,
        0x53 => DivRL,
        0x54 => IdivRL,
        0x55 => ModRL,
        0x56 => AndRL,
        0x57 => BorRL,
        0x58 => XorRL,
        0x59 => ShlRL,
        0x5A => ShrRL,
        0x5B => CatRL,
        0x5C => CeqRL,
        0x5D => CltRL,
        0x60 => AddLR,
        0x61 => SubLR,
        0x62 => MulLR,
        0x63 => DivLR,
        0x64 => IdivLR,
        0x65 => ModLR,
        0x66 => AndLR,
        0x67 => BorLR,
        0x68 => XorLR,
        0x69 => ShlLR,
        0x6A => ShrLR,
        0x6B => CatLR,
        0x6C => CeqLR,
        0x6D => CltLR,
        0x70 => AddLL,
        0x71 => SubLL,
        0x72 => MulLL,
        0x73 => DivLL,
        0x74 => IdivLL,
        0x75 => ModLL,
        0x76 => AndLL,
        0x77 => BorLL,
        0x78 => XorLL,
        0x79 => ShlLL,
        0x7A => ShrLL,
        0x7B => CatLL,
        0x7C => CeqLL,
        0x7D => CltLL,
        0x80 => LnotR,
        0x81 => UposR,
        0x82 => UnegR,
        0x83 => UxorR,
        0x90 => LnotL,
        0x91 => UposL,
        0x92 => UnegL,
        0x93 => UxorL,
        0xC0 => Iff,
        0xC1 => Ift,
        0xC2 => Jmp,
        0xC3 => Exit,
        0xC4 => Exit0,
        0xC5 => Exit1,
        0xC6 => Wpush,
        0xC7 => Wpop,
        0xC8 => Rpush,
        0xC9 => Rpop,
        0xCA => Xpush,
        0xCB => Xpop,
        0xCC => Lsprs,
        0xCD => Lspr,
        0xCE => Cstk,
        0xCF => CstkG,
        0xD0 => Mlist,
        0xD1 => Ndict,
        0xD2 => MlistP,
        0xD3 => Iiter,
        0xD4 => Fmake,
        0xD5 => Fbind,
        0xD6 => InextS,
        0xD7 => Inext,
        0xD8 => DcallS,
        0xD9 => Dcall,
        0xDA => Dtail,
        0xDC => FcallS,
        0xDD => Fcall,
        0xDE => Ftail,
        0xFF => Del,
        _ => return None,
    })
}

/// Write a full disassembly of `program` to `out`: the format version,
/// the merged pool, then each function's header and instructions.
pub fn disassemble(program: &Program, out: &mut dyn Write) -> io::Result<()> {
    let section = parse_data(&program.data)?;
    writeln!(out, "; p-code version {}", section.version)?;
    if !section.pool.is_empty() {
        writeln!(out, "; pool:")?;
        for (i, entry) in section.pool.iter().enumerate() {
            writeln!(out, ";   [{i}] {entry:?}")?;
        }
    }
    for (index, header) in section.headers.iter().enumerate() {
        let end = section
            .headers
            .get(index + 1)
            .map(|h| h.entry_offset as usize)
            .unwrap_or(program.code.len());
        disassemble_function(index, header, &program.code, end, &section.pool, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillc_core::operand::QOperand;
    use quillc_core::qfunction::{QCode, QFunction, FUNC_NOPARENT};
    use quillc_core::{QInstr, QOpcode};

    fn program_for(f: QFunction) -> Program {
        let mut code = QCode::new(1);
        code.functions.push(f);
        crate::lowerer::lower(&code)
    }

    #[test]
    fn disassembles_a_trivial_function_without_error() {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions.push(QInstr::new(QOpcode::Mov, QOperand::Local(0), QOperand::Int(7), QOperand::None, 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.local_count = 1;
        let program = program_for(f);

        let mut buf = Vec::new();
        disassemble(&program, &mut buf).expect("disassembly should succeed");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("p-code version"));
        assert!(text.contains("function"));
        assert!(text.contains("LdInt"));
        assert!(text.contains("Mov"));
    }

    #[test]
    fn decodes_a_named_public_reference() {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions.push(QInstr::new(QOpcode::Gpub, QOperand::Local(0), QOperand::Public(0), QOperand::None, 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.local_count = 1;

        let mut code = QCode::new(1);
        code.ident_pool_bytes = b"greet\0".to_vec();
        code.functions.push(f);
        let program = crate::lowerer::lower(&code);

        let mut buf = Vec::new();
        disassemble(&program, &mut buf).expect("disassembly should succeed");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\"greet\""));
    }
}
