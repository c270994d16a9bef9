use std::{
    error::Error,
    io::{self, ErrorKind, Read, Write},
    marker::PhantomData,
    mem, slice,
    str::{self, FromStr},
};

pub const OBJ_MAGIC: &[u8; 4] = b"RGB9";
pub const OBJ_REV: u32 = 9;

pub const BANK_SIZE: u32 = 0x4000;

pub struct StrInterner<'a> {
    pub storages: Vec<String>,
    pub marker: PhantomData<&'a ()>,
}

impl<'a> StrInterner<'a> {
    pub fn new() -> Self {
        Self {
            storages: Vec::new(),
            marker: PhantomData,
        }
    }

    pub fn intern(&mut self, string: &str) -> &'a str {
        let mut has_space = None;
        for (i, storage) in self.storages.iter().enumerate() {
            // pre-check if we have space for the string in case we have a cache miss
            if has_space.is_none() && ((storage.capacity() - storage.len()) >= string.len()) {
                has_space = Some(i);
            }
            if let Some(index) = storage.find(string) {
                // SAFETY: the assumption is that we never re-allocate storages
                unsafe {
                    return str::from_utf8_unchecked(slice::from_raw_parts(
                        storage.as_ptr().add(index),
                        string.len(),
                    ));
                }
            }
        }
        // cache miss, add to a storage if possible
        let storage = if let Some(index) = has_space {
            &mut self.storages[index]
        } else {
            self.storages
                .push(String::with_capacity(string.len().max(4096)));
            self.storages.last_mut().unwrap()
        };
        let index = storage.len();
        storage.push_str(string);
        // SAFETY: the assumption is that we never re-allocate storages
        unsafe {
            str::from_utf8_unchecked(slice::from_raw_parts(
                storage.as_ptr().add(index),
                string.len(),
            ))
        }
    }
}

pub struct SliceInterner<T> {
    pub storages: Vec<Vec<T>>,
}

impl<'a, T> SliceInterner<T>
where
    T: PartialEq + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            storages: Vec::new(),
        }
    }

    pub fn intern(&mut self, values: &[T]) -> &'a [T] {
        let mut has_space = None;
        for (i, storage) in self.storages.iter().enumerate() {
            if has_space.is_none() && ((storage.capacity() - storage.len()) >= values.len()) {
                has_space = Some(i);
            }
            if let Some(index) = storage.windows(values.len()).position(|win| win == values) {
                // SAFETY: the assumption is that we never re-allocate storages
                unsafe {
                    return slice::from_raw_parts(storage.as_ptr().add(index), values.len());
                }
            }
        }
        // cache miss, add to a storage if possible
        let storage = if let Some(index) = has_space {
            &mut self.storages[index]
        } else {
            self.storages
                .push(Vec::with_capacity(values.len().max(256)));
            self.storages.last_mut().unwrap()
        };
        let index = storage.len();
        storage.extend_from_slice(values);
        // SAFETY: the assumption is that we never re-allocate storages
        unsafe { slice::from_raw_parts(storage.as_ptr().add(index), values.len()) }
    }
}

pub fn parse_defines<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid SYMBOL=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectKind {
    Rom0,
    Romx,
    Vram,
    Sram,
    Wram0,
    Wramx,
    Oam,
    Hram,
}

impl SectKind {
    // Also the order banks are walked for the ROM, sym, and map outputs.
    pub const ALL: [SectKind; 8] = [
        SectKind::Rom0,
        SectKind::Romx,
        SectKind::Vram,
        SectKind::Sram,
        SectKind::Wram0,
        SectKind::Wramx,
        SectKind::Oam,
        SectKind::Hram,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SectKind::Rom0 => "ROM0",
            SectKind::Romx => "ROMX",
            SectKind::Vram => "VRAM",
            SectKind::Sram => "SRAM",
            SectKind::Wram0 => "WRAM0",
            SectKind::Wramx => "WRAMX",
            SectKind::Oam => "OAM",
            SectKind::Hram => "HRAM",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SectKind::ALL
            .iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
            .copied()
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        SectKind::ALL.get(value as usize).copied()
    }

    pub fn has_data(self) -> bool {
        matches!(self, SectKind::Rom0 | SectKind::Romx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectMod {
    Normal,
    Union,
    Fragment,
}

impl SectMod {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(SectMod::Normal),
            1 => Some(SectMod::Union),
            2 => Some(SectMod::Fragment),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            SectMod::Normal => 0,
            SectMod::Union => 1,
            SectMod::Fragment => 2,
        }
    }
}

/// Address-space geometry. `tiny` is the 32KiB no-mapper mode and widens
/// ROM0 to cover the whole ROM window; `big_wram0` merges WRAMX into a
/// single 8KiB WRAM0 bank.
#[derive(Debug, Clone, Copy, Default)]
pub struct Layout {
    pub tiny: bool,
    pub big_wram0: bool,
}

impl Layout {
    pub fn start(self, kind: SectKind) -> u16 {
        match kind {
            SectKind::Rom0 => 0x0000,
            SectKind::Romx => 0x4000,
            SectKind::Vram => 0x8000,
            SectKind::Sram => 0xA000,
            SectKind::Wram0 => 0xC000,
            SectKind::Wramx => 0xD000,
            SectKind::Oam => 0xFE00,
            SectKind::Hram => 0xFF80,
        }
    }

    pub fn len(self, kind: SectKind) -> u32 {
        match kind {
            SectKind::Rom0 => {
                if self.tiny {
                    0x8000
                } else {
                    0x4000
                }
            }
            SectKind::Romx => 0x4000,
            SectKind::Vram | SectKind::Sram => 0x2000,
            SectKind::Wram0 => {
                if self.big_wram0 {
                    0x2000
                } else {
                    0x1000
                }
            }
            SectKind::Wramx => 0x1000,
            SectKind::Oam => 0xA0,
            SectKind::Hram => 0x7F,
        }
    }

    pub fn first_bank(self, kind: SectKind) -> u32 {
        match kind {
            SectKind::Romx | SectKind::Wramx => 1,
            _ => 0,
        }
    }

    pub fn last_bank(self, kind: SectKind) -> u32 {
        match kind {
            SectKind::Romx => 511,
            SectKind::Vram => 1,
            SectKind::Sram => 15,
            SectKind::Wramx => 7,
            _ => 0,
        }
    }

    pub fn banked(self, kind: SectKind) -> bool {
        self.first_bank(kind) != self.last_bank(kind)
    }
}

/// RPN opcodes as serialized into object files. `CONST` and `SYM` carry
/// operands, as do the `BANK`/`SIZEOF`/`STARTOF` family.
pub struct RpnOp;

#[rustfmt::skip]
impl RpnOp {
    pub const ADD: u8 = 0x00;
    pub const SUB: u8 = 0x01;
    pub const MUL: u8 = 0x02;
    pub const DIV: u8 = 0x03;
    pub const MOD: u8 = 0x04;
    pub const NEG: u8 = 0x05;
    pub const EXP: u8 = 0x06;
    pub const OR: u8 = 0x10;
    pub const AND: u8 = 0x11;
    pub const XOR: u8 = 0x12;
    pub const NOT: u8 = 0x13;
    pub const LOGAND: u8 = 0x21;
    pub const LOGOR: u8 = 0x22;
    pub const LOGNOT: u8 = 0x23;
    pub const LOGEQ: u8 = 0x30;
    pub const LOGNE: u8 = 0x31;
    pub const LOGGT: u8 = 0x32;
    pub const LOGLT: u8 = 0x33;
    pub const LOGGE: u8 = 0x34;
    pub const LOGLE: u8 = 0x35;
    pub const SHL: u8 = 0x40;
    pub const SHR: u8 = 0x41;
    pub const USHR: u8 = 0x42;
    pub const BANK_SYM: u8 = 0x50;
    pub const BANK_SECT: u8 = 0x51;
    pub const BANK_SELF: u8 = 0x52;
    pub const SIZEOF_SECT: u8 = 0x53;
    pub const STARTOF_SECT: u8 = 0x54;
    pub const HRAM_CHECK: u8 = 0x60;
    pub const RST_CHECK: u8 = 0x61;
    pub const CONST: u8 = 0x80;
    pub const SYM: u8 = 0x81;
}

/// One element of a postfix expression stream. `Sym`/`BankSym` hold indices
/// into the owning object's symbol list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprNode<'a> {
    Const(i32),
    Sym(u32),
    Op(u8),
    BankSym(u32),
    BankSect(&'a str),
    BankSelf,
    Sizeof(&'a str),
    Startof(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Byte,
    Word,
    Long,
    Jr,
}

impl PatchKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PatchKind::Byte),
            1 => Some(PatchKind::Word),
            2 => Some(PatchKind::Long),
            3 => Some(PatchKind::Jr),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PatchKind::Byte => 0,
            PatchKind::Word => 1,
            PatchKind::Long => 2,
            PatchKind::Jr => 3,
        }
    }

    pub fn width(self) -> u32 {
        match self {
            PatchKind::Byte | PatchKind::Jr => 1,
            PatchKind::Word => 2,
            PatchKind::Long => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Patch<'a> {
    pub node: u32,
    pub line: u32,
    pub offset: u32,
    pub pc_sect: i32,
    pub pc_offset: u32,
    pub kind: PatchKind,
    pub expr: &'a [ExprNode<'a>],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjSymKind {
    Local,
    Import,
    Export,
}

impl ObjSymKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ObjSymKind::Local),
            1 => Some(ObjSymKind::Import),
            2 => Some(ObjSymKind::Export),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ObjSymKind::Local => 0,
            ObjSymKind::Import => 1,
            ObjSymKind::Export => 2,
        }
    }
}

/// A symbol as serialized. `sect` is an index into the object's section
/// list, or -1 for constants; `value` is the section offset for labels.
#[derive(Debug, Clone, Copy)]
pub struct ObjSym<'a> {
    pub name: &'a str,
    pub kind: ObjSymKind,
    pub node: u32,
    pub line: u32,
    pub sect: i32,
    pub value: i32,
}

#[derive(Debug)]
pub struct Sect<'a> {
    pub name: &'a str,
    pub kind: SectKind,
    pub modif: SectMod,
    pub size: u32,
    pub org: i32,
    pub bank: i32,
    pub align: u8,
    pub align_ofs: u32,
    pub data: Vec<u8>,
    pub patches: Vec<Patch<'a>>,
}

/// File-stack nodes reconstruct include/macro/rept chains for link-time
/// diagnostics. A `Rept` node carries the iteration indices of every rept
/// enclosing the recorded point, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeInfo<'a> {
    Rept(Vec<u32>),
    File(&'a str),
    Macro(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<'a> {
    pub parent: i32,
    pub parent_line: u32,
    pub info: NodeInfo<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertLevel {
    Warn,
    Error,
    Fatal,
}

impl AssertLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AssertLevel::Warn),
            1 => Some(AssertLevel::Error),
            2 => Some(AssertLevel::Fatal),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AssertLevel::Warn => 0,
            AssertLevel::Error => 1,
            AssertLevel::Fatal => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Assertion<'a> {
    pub node: u32,
    pub line: u32,
    pub offset: u32,
    pub pc_sect: i32,
    pub pc_offset: u32,
    pub level: AssertLevel,
    pub expr: &'a [ExprNode<'a>],
    pub msg: &'a str,
}

/// One compilation unit: everything the assembler hands to the linker.
#[derive(Debug)]
pub struct Object<'a> {
    pub nodes: Vec<Node<'a>>,
    pub syms: Vec<ObjSym<'a>>,
    pub sects: Vec<Sect<'a>>,
    pub asserts: Vec<Assertion<'a>>,
}

impl<'a> Object<'a> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            syms: Vec::new(),
            sects: Vec::new(),
            asserts: Vec::new(),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(OBJ_MAGIC)?;
        w.write_all(&OBJ_REV.to_le_bytes())?;
        w.write_all(&(self.syms.len() as u32).to_le_bytes())?;
        w.write_all(&(self.sects.len() as u32).to_le_bytes())?;
        w.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        for node in &self.nodes {
            w.write_all(&node.parent.to_le_bytes())?;
            w.write_all(&node.parent_line.to_le_bytes())?;
            match &node.info {
                NodeInfo::Rept(iters) => {
                    w.write_all(&[0])?;
                    w.write_all(&(iters.len() as u32).to_le_bytes())?;
                    for iter in iters {
                        w.write_all(&iter.to_le_bytes())?;
                    }
                }
                NodeInfo::File(name) => {
                    w.write_all(&[1])?;
                    write_cstr(w, name)?;
                }
                NodeInfo::Macro(name) => {
                    w.write_all(&[2])?;
                    write_cstr(w, name)?;
                }
            }
        }
        for sym in &self.syms {
            write_cstr(w, sym.name)?;
            w.write_all(&[sym.kind.to_u8()])?;
            if sym.kind != ObjSymKind::Import {
                w.write_all(&sym.node.to_le_bytes())?;
                w.write_all(&sym.line.to_le_bytes())?;
                w.write_all(&sym.sect.to_le_bytes())?;
                w.write_all(&sym.value.to_le_bytes())?;
            }
        }
        for sect in &self.sects {
            write_cstr(w, sect.name)?;
            w.write_all(&sect.size.to_le_bytes())?;
            w.write_all(&[(sect.modif.to_bits() << 6) | sect.kind as u8])?;
            w.write_all(&sect.org.to_le_bytes())?;
            w.write_all(&sect.bank.to_le_bytes())?;
            w.write_all(&[sect.align])?;
            w.write_all(&sect.align_ofs.to_le_bytes())?;
            if sect.kind.has_data() {
                w.write_all(&sect.data)?;
                w.write_all(&(sect.patches.len() as u32).to_le_bytes())?;
                for patch in &sect.patches {
                    w.write_all(&patch.node.to_le_bytes())?;
                    w.write_all(&patch.line.to_le_bytes())?;
                    w.write_all(&patch.offset.to_le_bytes())?;
                    w.write_all(&patch.pc_sect.to_le_bytes())?;
                    w.write_all(&patch.pc_offset.to_le_bytes())?;
                    w.write_all(&[patch.kind.to_u8()])?;
                    write_rpn(w, patch.expr)?;
                }
            }
        }
        w.write_all(&(self.asserts.len() as u32).to_le_bytes())?;
        for assert in &self.asserts {
            w.write_all(&assert.node.to_le_bytes())?;
            w.write_all(&assert.line.to_le_bytes())?;
            w.write_all(&assert.offset.to_le_bytes())?;
            w.write_all(&assert.pc_sect.to_le_bytes())?;
            w.write_all(&assert.pc_offset.to_le_bytes())?;
            w.write_all(&[0])?;
            write_rpn(w, assert.expr)?;
            w.write_all(&[assert.level.to_u8()])?;
            write_cstr(w, assert.msg)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(
        file: &str,
        r: &mut R,
        str_int: &mut StrInterner<'a>,
        expr_int: &mut SliceInterner<ExprNode<'a>>,
    ) -> io::Result<Object<'a>> {
        let bad = |msg: &str| io::Error::new(ErrorKind::InvalidData, format!("{file}: {msg}"));
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != OBJ_MAGIC {
            return Err(bad("bad magic"));
        }
        let rev: u32 = read_int(r)?;
        if rev != OBJ_REV {
            return Err(bad(&format!(
                "object revision {rev} does not match expected {OBJ_REV}"
            )));
        }
        let nb_syms: u32 = read_int(r)?;
        let nb_sects: u32 = read_int(r)?;
        let nb_nodes: u32 = read_int(r)?;
        let mut obj = Object::new();
        for _ in 0..nb_nodes {
            let parent: i32 = read_int(r)?;
            let parent_line: u32 = read_int(r)?;
            let ty: u8 = read_int(r)?;
            let info = match ty {
                0 => {
                    let depth: u32 = read_int(r)?;
                    let mut iters = Vec::with_capacity(depth as usize);
                    for _ in 0..depth {
                        iters.push(read_int(r)?);
                    }
                    NodeInfo::Rept(iters)
                }
                1 => NodeInfo::File(str_int.intern(&read_cstr(r)?)),
                2 => NodeInfo::Macro(str_int.intern(&read_cstr(r)?)),
                _ => return Err(bad("malformed node table")),
            };
            obj.nodes.push(Node {
                parent,
                parent_line,
                info,
            });
        }
        for _ in 0..nb_syms {
            let name = str_int.intern(&read_cstr(r)?);
            let ty: u8 = read_int(r)?;
            let kind = ObjSymKind::from_u8(ty).ok_or_else(|| bad("malformed symbol table"))?;
            let (node, line, sect, value) = if kind != ObjSymKind::Import {
                (read_int(r)?, read_int(r)?, read_int(r)?, read_int(r)?)
            } else {
                (0, 0, -1, 0)
            };
            obj.syms.push(ObjSym {
                name,
                kind,
                node,
                line,
                sect,
                value,
            });
        }
        for _ in 0..nb_sects {
            let name = str_int.intern(&read_cstr(r)?);
            let size: u32 = read_int(r)?;
            let ty: u8 = read_int(r)?;
            let kind = SectKind::from_u8(ty & 0x3F).ok_or_else(|| bad("bad section type"))?;
            let modif = SectMod::from_bits(ty >> 6).ok_or_else(|| bad("bad section modifier"))?;
            let org: i32 = read_int(r)?;
            let bank: i32 = read_int(r)?;
            let align: u8 = read_int(r)?;
            let align_ofs: u32 = read_int(r)?;
            let mut sect = Sect {
                name,
                kind,
                modif,
                size,
                org,
                bank,
                align,
                align_ofs,
                data: Vec::new(),
                patches: Vec::new(),
            };
            if kind.has_data() {
                sect.data = vec![0; size as usize];
                r.read_exact(&mut sect.data)?;
                let nb_patches: u32 = read_int(r)?;
                for _ in 0..nb_patches {
                    let node: u32 = read_int(r)?;
                    let line: u32 = read_int(r)?;
                    let offset: u32 = read_int(r)?;
                    let pc_sect: i32 = read_int(r)?;
                    let pc_offset: u32 = read_int(r)?;
                    let ty: u8 = read_int(r)?;
                    let kind = PatchKind::from_u8(ty).ok_or_else(|| bad("bad patch type"))?;
                    let expr = read_rpn(file, r, str_int, expr_int)?;
                    sect.patches.push(Patch {
                        node,
                        line,
                        offset,
                        pc_sect,
                        pc_offset,
                        kind,
                        expr,
                    });
                }
            }
            obj.sects.push(sect);
        }
        let nb_asserts: u32 = read_int(r)?;
        for _ in 0..nb_asserts {
            let node: u32 = read_int(r)?;
            let line: u32 = read_int(r)?;
            let offset: u32 = read_int(r)?;
            let pc_sect: i32 = read_int(r)?;
            let pc_offset: u32 = read_int(r)?;
            let _ty: u8 = read_int(r)?;
            let expr = read_rpn(file, r, str_int, expr_int)?;
            let level: u8 = read_int(r)?;
            let level = AssertLevel::from_u8(level).ok_or_else(|| bad("bad assertion type"))?;
            let msg = str_int.intern(&read_cstr(r)?);
            obj.asserts.push(Assertion {
                node,
                line,
                offset,
                pc_sect,
                pc_offset,
                level,
                expr,
                msg,
            });
        }
        Ok(obj)
    }
}

fn write_cstr<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(&[0])
}

fn read_cstr<R: Read>(r: &mut R) -> io::Result<String> {
    let mut buf = Vec::new();
    loop {
        let b: u8 = read_int(r)?;
        if b == 0 {
            break;
        }
        buf.push(b);
    }
    // invalid sequences decode as U+FFFD
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn rpn_len(expr: &[ExprNode<'_>]) -> u32 {
    expr.iter().fold(0, |len, node| {
        len + match node {
            ExprNode::Const(_) | ExprNode::Sym(_) | ExprNode::BankSym(_) => 5,
            ExprNode::Op(_) | ExprNode::BankSelf => 1,
            ExprNode::BankSect(name) | ExprNode::Sizeof(name) | ExprNode::Startof(name) => {
                name.len() as u32 + 2
            }
        }
    })
}

fn write_rpn<W: Write>(w: &mut W, expr: &[ExprNode<'_>]) -> io::Result<()> {
    w.write_all(&rpn_len(expr).to_le_bytes())?;
    for node in expr {
        match node {
            ExprNode::Const(value) => {
                w.write_all(&[RpnOp::CONST])?;
                w.write_all(&value.to_le_bytes())?;
            }
            ExprNode::Sym(index) => {
                w.write_all(&[RpnOp::SYM])?;
                w.write_all(&index.to_le_bytes())?;
            }
            ExprNode::Op(op) => w.write_all(&[*op])?,
            ExprNode::BankSym(index) => {
                w.write_all(&[RpnOp::BANK_SYM])?;
                w.write_all(&index.to_le_bytes())?;
            }
            ExprNode::BankSect(name) => {
                w.write_all(&[RpnOp::BANK_SECT])?;
                write_cstr(w, name)?;
            }
            ExprNode::BankSelf => w.write_all(&[RpnOp::BANK_SELF])?,
            ExprNode::Sizeof(name) => {
                w.write_all(&[RpnOp::SIZEOF_SECT])?;
                write_cstr(w, name)?;
            }
            ExprNode::Startof(name) => {
                w.write_all(&[RpnOp::STARTOF_SECT])?;
                write_cstr(w, name)?;
            }
        }
    }
    Ok(())
}

fn read_rpn<'a, R: Read>(
    file: &str,
    r: &mut R,
    str_int: &mut StrInterner<'a>,
    expr_int: &mut SliceInterner<ExprNode<'a>>,
) -> io::Result<&'a [ExprNode<'a>]> {
    let len: u32 = read_int(r)?;
    let mut left = len as i64;
    let mut nodes = Vec::new();
    while left > 0 {
        let op: u8 = read_int(r)?;
        left -= 1;
        let node = match op {
            RpnOp::CONST => {
                left -= 4;
                ExprNode::Const(read_int(r)?)
            }
            RpnOp::SYM => {
                left -= 4;
                ExprNode::Sym(read_int(r)?)
            }
            RpnOp::BANK_SYM => {
                left -= 4;
                ExprNode::BankSym(read_int(r)?)
            }
            RpnOp::BANK_SECT => {
                let name = read_cstr(r)?;
                left -= name.len() as i64 + 1;
                ExprNode::BankSect(str_int.intern(&name))
            }
            RpnOp::BANK_SELF => ExprNode::BankSelf,
            RpnOp::SIZEOF_SECT => {
                let name = read_cstr(r)?;
                left -= name.len() as i64 + 1;
                ExprNode::Sizeof(str_int.intern(&name))
            }
            RpnOp::STARTOF_SECT => {
                let name = read_cstr(r)?;
                left -= name.len() as i64 + 1;
                ExprNode::Startof(str_int.intern(&name))
            }
            op => ExprNode::Op(op),
        };
        nodes.push(node);
    }
    if left != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("{file}: malformed RPN stream"),
        ));
    }
    Ok(expr_int.intern(&nodes))
}

pub fn read_int<R: Read, T: FromLeBytes>(reader: &mut R) -> io::Result<T>
where
    T::Buf: Default + AsMut<[u8]>,
{
    let mut buf = T::Buf::default();
    reader.read_exact(buf.as_mut())?;
    Ok(T::from_le_bytes(buf))
}

pub trait FromLeBytes {
    type Buf;

    fn from_le_bytes(buf: Self::Buf) -> Self;
}

macro_rules! impl_le_bytes (( $($int:ident),* ) => {
    $(
        impl FromLeBytes for $int {
            type Buf = [u8; mem::size_of::<$int>()];

            fn from_le_bytes(buf: Self::Buf) -> Self {
                Self::from_le_bytes(buf)
            }
        }
    )*
});

impl_le_bytes!(u8, u16, u32, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    Assert,
    BuiltinArg,
    Charmap,
    Div,
    EmptyStrrpl,
    LongString,
    NumericString,
    Obsolete,
    Purge,
    Shift,
    Truncation,
    UnmatchedDirective,
    User,
}

impl Warning {
    pub const ALL: [Warning; 13] = [
        Warning::Assert,
        Warning::BuiltinArg,
        Warning::Charmap,
        Warning::Div,
        Warning::EmptyStrrpl,
        Warning::LongString,
        Warning::NumericString,
        Warning::Obsolete,
        Warning::Purge,
        Warning::Shift,
        Warning::Truncation,
        Warning::UnmatchedDirective,
        Warning::User,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Warning::Assert => "assert",
            Warning::BuiltinArg => "builtin-arg",
            Warning::Charmap => "charmap",
            Warning::Div => "div",
            Warning::EmptyStrrpl => "empty-strrpl",
            Warning::LongString => "long-string",
            Warning::NumericString => "numeric-string",
            Warning::Obsolete => "obsolete",
            Warning::Purge => "purge",
            Warning::Shift => "shift",
            Warning::Truncation => "truncation",
            Warning::UnmatchedDirective => "unmatched-directive",
            Warning::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnState {
    Allow,
    Warn,
    Error,
}

/// Per-category warning settings, fed by repeated `-W` flags. Accepted
/// forms: `NAME`, `no-NAME`, `error`, `error=NAME`.
pub struct Warnings {
    states: [WarnState; Warning::ALL.len()],
}

impl Warnings {
    pub fn new() -> Self {
        Self {
            states: [WarnState::Warn; Warning::ALL.len()],
        }
    }

    pub fn set(&mut self, spec: &str) -> Result<(), String> {
        if spec == "error" {
            for state in &mut self.states {
                if *state == WarnState::Warn {
                    *state = WarnState::Error;
                }
            }
            return Ok(());
        }
        let (state, name) = if let Some(name) = spec.strip_prefix("error=") {
            (WarnState::Error, name)
        } else if let Some(name) = spec.strip_prefix("no-") {
            (WarnState::Allow, name)
        } else {
            (WarnState::Warn, spec)
        };
        let index = Warning::ALL
            .iter()
            .position(|warning| warning.name() == name)
            .ok_or_else(|| format!("unknown warning flag \"{name}\""))?;
        self.states[index] = state;
        Ok(())
    }

    pub fn state(&self, warning: Warning) -> WarnState {
        let index = Warning::ALL
            .iter()
            .position(|other| *other == warning)
            .unwrap();
        self.states[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_expr<'a>(expr_int: &mut SliceInterner<ExprNode<'a>>) -> &'a [ExprNode<'a>] {
        expr_int.intern(&[
            ExprNode::Sym(0),
            ExprNode::Const(1),
            ExprNode::Op(RpnOp::ADD),
            ExprNode::BankSect("Home"),
            ExprNode::Op(RpnOp::MUL),
        ])
    }

    #[test]
    fn object_roundtrip() {
        let mut str_int = StrInterner::new();
        let mut expr_int = SliceInterner::new();
        let mut obj = Object::new();
        obj.nodes.push(Node {
            parent: -1,
            parent_line: 0,
            info: NodeInfo::File("top.asm"),
        });
        obj.nodes.push(Node {
            parent: 0,
            parent_line: 4,
            info: NodeInfo::Rept(vec![2]),
        });
        obj.syms.push(ObjSym {
            name: "Entry",
            kind: ObjSymKind::Export,
            node: 0,
            line: 3,
            sect: 0,
            value: 1,
        });
        obj.syms.push(ObjSym {
            name: "External",
            kind: ObjSymKind::Import,
            node: 0,
            line: 0,
            sect: -1,
            value: 0,
        });
        let expr = sample_expr(&mut expr_int);
        obj.sects.push(Sect {
            name: "Home",
            kind: SectKind::Rom0,
            modif: SectMod::Fragment,
            size: 3,
            org: -1,
            bank: -1,
            align: 4,
            align_ofs: 2,
            data: vec![0x3E, 0x00, 0xC9],
            patches: vec![Patch {
                node: 1,
                line: 5,
                offset: 1,
                pc_sect: 0,
                pc_offset: 0,
                kind: PatchKind::Byte,
                expr,
            }],
        });
        obj.sects.push(Sect {
            name: "Vars",
            kind: SectKind::Wram0,
            modif: SectMod::Union,
            size: 8,
            org: 0xC000,
            bank: 0,
            align: 0,
            align_ofs: 0,
            data: Vec::new(),
            patches: Vec::new(),
        });
        obj.asserts.push(Assertion {
            node: 0,
            line: 9,
            offset: 0,
            pc_sect: 0,
            pc_offset: 0,
            level: AssertLevel::Error,
            expr,
            msg: "boom",
        });

        let mut buf = Vec::new();
        obj.write(&mut buf).unwrap();
        let back = Object::read("test", &mut buf.as_slice(), &mut str_int, &mut expr_int).unwrap();

        assert_eq!(back.nodes, obj.nodes);
        assert_eq!(back.syms.len(), 2);
        assert_eq!(back.syms[0].name, "Entry");
        assert_eq!(back.syms[0].kind, ObjSymKind::Export);
        assert_eq!(back.syms[1].kind, ObjSymKind::Import);
        assert_eq!(back.sects.len(), 2);
        assert_eq!(back.sects[0].data, obj.sects[0].data);
        assert_eq!(back.sects[0].modif, SectMod::Fragment);
        assert_eq!(back.sects[0].align, 4);
        assert_eq!(back.sects[0].patches.len(), 1);
        assert_eq!(back.sects[0].patches[0].expr, expr);
        assert_eq!(back.sects[1].org, 0xC000);
        assert_eq!(back.sects[1].size, 8);
        assert_eq!(back.asserts.len(), 1);
        assert_eq!(back.asserts[0].msg, "boom");
        assert_eq!(back.asserts[0].level, AssertLevel::Error);
    }

    #[test]
    fn rpn_wire_bytes() {
        let mut buf = Vec::new();
        write_rpn(
            &mut buf,
            &[
                ExprNode::Const(0x0102),
                ExprNode::Sym(7),
                ExprNode::Op(RpnOp::SUB),
                ExprNode::BankSelf,
            ],
        )
        .unwrap();
        // length prefix, then CONST, SYM, SUB, BANK_SELF
        assert_eq!(
            buf,
            [
                12, 0, 0, 0, // rpnLen
                0x80, 0x02, 0x01, 0x00, 0x00, // CONST $0102
                0x81, 0x07, 0x00, 0x00, 0x00, // SYM 7
                0x01, // SUB
                0x52, // BANK_SELF
            ]
        );
    }

    #[test]
    fn bad_magic_is_fatal() {
        let buf = b"NOPE\x09\x00\x00\x00";
        let mut str_int = StrInterner::new();
        let mut expr_int = SliceInterner::new();
        let err = Object::read("x.o", &mut buf.as_slice(), &mut str_int, &mut expr_int)
            .err()
            .unwrap();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn layout_geometry() {
        let layout = Layout::default();
        assert_eq!(layout.start(SectKind::Romx), 0x4000);
        assert_eq!(layout.len(SectKind::Rom0), 0x4000);
        assert_eq!(layout.first_bank(SectKind::Romx), 1);
        assert_eq!(layout.last_bank(SectKind::Vram), 1);
        assert!(layout.banked(SectKind::Sram));
        assert!(!layout.banked(SectKind::Hram));
        let tiny = Layout {
            tiny: true,
            ..Layout::default()
        };
        assert_eq!(tiny.len(SectKind::Rom0), 0x8000);
    }

    #[test]
    fn warning_flags() {
        let mut warnings = Warnings::new();
        assert_eq!(warnings.state(Warning::Shift), WarnState::Warn);
        warnings.set("no-shift").unwrap();
        assert_eq!(warnings.state(Warning::Shift), WarnState::Allow);
        warnings.set("error=obsolete").unwrap();
        assert_eq!(warnings.state(Warning::Obsolete), WarnState::Error);
        warnings.set("error").unwrap();
        assert_eq!(warnings.state(Warning::User), WarnState::Error);
        // `error` must not resurrect disabled warnings
        assert_eq!(warnings.state(Warning::Shift), WarnState::Allow);
        assert!(warnings.set("bogus").is_err());
    }

    #[test]
    fn interners_dedup() {
        let mut str_int = StrInterner::new();
        let a = str_int.intern("Section");
        let b = str_int.intern("Section");
        assert_eq!(a.as_ptr(), b.as_ptr());
        let mut expr_int: SliceInterner<ExprNode<'_>> = SliceInterner::new();
        let x = expr_int.intern(&[ExprNode::Const(1), ExprNode::Const(2)]);
        let y = expr_int.intern(&[ExprNode::Const(1), ExprNode::Const(2)]);
        assert_eq!(x.as_ptr(), y.as_ptr());
    }
}
