//! Just enough of the Dalvik instruction set to walk code and relocate the
//! index operands of each instruction.

use once_cell::sync::Lazy;

use crate::dex::error::DexError;

/// What kind of id an instruction's index operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind
{
    None,
    String,
    /// `const-string/jumbo`: 32-bit string index.
    StringJumbo,
    Type,
    Field,
    Method,
    /// `invoke-polymorphic`: method index in unit 1, proto index in unit 3.
    MethodAndProto,
    Proto,
    CallSite,
    MethodHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpInfo
{
    pub units: usize,
    pub kind: RefKind,
}

const fn op(units: usize, kind: RefKind) -> Option<OpInfo>
{
    Some(OpInfo { units, kind })
}

const fn classify(opcode: u8) -> Option<OpInfo>
{
    use RefKind::*;
    match opcode
    {
        0x00 | 0x01 | 0x04 | 0x07 => op(1, None),
        0x02 | 0x05 | 0x08 => op(2, None),
        0x03 | 0x06 | 0x09 => op(3, None),
        0x0a..=0x12 => op(1, None),
        0x13 => op(2, None),
        0x14 => op(3, None),
        0x15 | 0x16 => op(2, None),
        0x17 => op(3, None),
        0x18 => op(5, None),
        0x19 => op(2, None),
        0x1a => op(2, String),
        0x1b => op(3, StringJumbo),
        0x1c => op(2, Type),
        0x1d | 0x1e => op(1, None),
        0x1f | 0x20 => op(2, Type),
        0x21 => op(1, None),
        0x22 | 0x23 => op(2, Type),
        0x24 | 0x25 => op(3, Type),
        0x26 => op(3, None),
        0x27 | 0x28 => op(1, None),
        0x29 => op(2, None),
        0x2a..=0x2c => op(3, None),
        0x2d..=0x3d => op(2, None),
        0x44..=0x51 => op(2, None),
        0x52..=0x6d => op(2, Field),
        0x6e..=0x72 => op(3, Method),
        0x74..=0x78 => op(3, Method),
        0x7b..=0x8f => op(1, None),
        0x90..=0xaf => op(2, None),
        0xb0..=0xcf => op(1, None),
        0xd0..=0xe2 => op(2, None),
        0xfa | 0xfb => op(4, MethodAndProto),
        0xfc | 0xfd => op(3, CallSite),
        0xfe => op(2, MethodHandle),
        0xff => op(2, Proto),
        _ => Option::None,
    }
}

static OPCODES: Lazy<[Option<OpInfo>; 256]> = Lazy::new(|| {
    let mut table = [None; 256];
    for (op, slot) in table.iter_mut().enumerate()
    {
        *slot = classify(op as u8);
    }
    table
});

/// Size and reference kind for an opcode; `None` for unused and odex-only opcodes.
pub(crate) fn info(opcode: u8) -> Option<OpInfo>
{
    OPCODES[opcode as usize]
}

pub(crate) const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub(crate) const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub(crate) const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

/// Size in code units of the payload pseudo-instruction at `pc`, if any.
fn payload_units(insns: &[u16], pc: usize) -> Result<Option<usize>, DexError>
{
    let ident = insns[pc];
    let field = |i: usize| -> Result<u16, DexError> {
        insns.get(pc + i).copied().ok_or_else(|| err!("truncated payload at {}", pc))
    };
    let units = match ident
    {
        PACKED_SWITCH_PAYLOAD => field(1)? as usize * 2 + 4,
        SPARSE_SWITCH_PAYLOAD => field(1)? as usize * 4 + 2,
        FILL_ARRAY_DATA_PAYLOAD =>
        {
            let width = field(1)? as usize;
            let size = field(2)? as usize | ((field(3)? as usize) << 16);
            (size * width + 1) / 2 + 4
        }
        _ => return Ok(None),
    };
    Ok(Some(units))
}

/// Call `f(pc, info)` for every real instruction, skipping payloads.
pub(crate) fn walk<F>(insns: &[u16], mut f: F) -> Result<(), DexError>
where
    F: FnMut(usize, OpInfo) -> Result<(), DexError>,
{
    let mut pc = 0;
    while pc < insns.len()
    {
        if let Some(units) = payload_units(insns, pc)?
        {
            pc += units;
            continue;
        }
        let opcode = (insns[pc] & 0xff) as u8;
        let info = info(opcode).ok_or_else(|| err!("unsupported opcode 0x{:02x} at {}", opcode, pc))?;
        if pc + info.units > insns.len()
        {
            fail!("instruction 0x{:02x} at {} runs past the end of the code", opcode, pc);
        }
        f(pc, info)?;
        pc += info.units;
    }
    if pc != insns.len()
    {
        fail!("payload runs past the end of the code");
    }
    Ok(())
}
