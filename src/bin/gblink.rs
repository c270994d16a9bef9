use std::{
    collections::HashMap,
    error::Error,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use gbasm::{
    AssertLevel, Assertion, BANK_SIZE, ExprNode, Layout, NodeInfo, ObjSymKind, Object, Patch,
    PatchKind, RpnOp, SectKind, SectMod, SliceInterner, StrInterner, WarnState, Warning, Warnings,
};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, de};
use serde_derive::Deserialize;
use tracing::Level;

/// Linker for `gbasm` object modules. Places sections into banks and
/// emits the ROM image plus optional symbol and map listings.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Object files
    objects: Vec<PathBuf>,

    /// Output ROM image
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output symbol file
    #[arg(short = 's', long)]
    sym: Option<PathBuf>,

    /// Output map file
    #[arg(short = 'm', long)]
    map: Option<PathBuf>,

    /// Overlay ROM to fill the gaps between sections
    #[arg(short = 'O', long)]
    overlay: Option<PathBuf>,

    /// Pad byte for the gaps between sections
    #[arg(short, long, default_value = "0", value_parser = parse_byte)]
    pad: u8,

    /// 32KiB mode: ROM0 covers the whole $0000-$7FFF window, no ROMX
    #[arg(short, long)]
    tiny: bool,

    /// Merge WRAMX into a single 8KiB WRAM0 bank
    #[arg(short, long)]
    wram: bool,

    /// Linker script pinning named sections to a bank and/or org
    #[arg(short = 'l', long)]
    script: Option<PathBuf>,

    /// Warning control: NAME, no-NAME, error, or error=NAME (repeatable)
    #[arg(short = 'W', long = "warning", value_name = "NAME")]
    warnings: Vec<String>,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short = 'v', long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let (digits, radix) = if let Some(rest) = s.strip_prefix('$') {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix('%') {
        (rest, 2)
    } else {
        (s, 10)
    };
    u8::from_str_radix(digits, radix).map_err(|e| format!("bad pad byte \"{s}\": {e}"))
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 64 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    match main_real(args) {
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
        Ok(errors) if errors > 0 => {
            tracing::error!("linking failed with {errors} error(s)");
            ExitCode::FAILURE
        }
        Ok(_) => ExitCode::SUCCESS,
    }
}

fn main_real(args: Args) -> Result<usize, Box<dyn Error>> {
    let mut warnings = Warnings::new();
    for spec in &args.warnings {
        warnings.set(spec)?;
    }
    let layout = Layout {
        tiny: args.tiny,
        big_wram0: args.wram,
    };
    let mut ld = Ld::new(layout, warnings);

    if args.objects.is_empty() {
        return Err("no object files given".into());
    }
    tracing::trace!("loading objects");
    for path in &args.objects {
        let name = path.to_str().ok_or("object path is not valid UTF-8")?;
        let file = File::open(path).map_err(|e| format!("cant open file {name}: {e}"))?;
        let mut reader = BufReader::new(file);
        ld.load(name, &mut reader)?;
    }

    if let Some(path) = &args.script {
        let text = fs::read_to_string(path).map_err(|e| format!("cant open file: {e}"))?;
        let script: Script = toml::from_str(&text)?;
        ld.apply_script(&script)?;
    }

    tracing::trace!("resolving imports");
    ld.resolve_refs();

    tracing::trace!("placing sections");
    ld.place();

    tracing::trace!("resolving patches");
    ld.resolve_patches();
    ld.check_asserts()?;

    let overlay = match &args.overlay {
        Some(path) => Some(fs::read(path).map_err(|e| format!("cant open file: {e}"))?),
        None => None,
    };

    if ld.errors == 0 {
        if let Some(path) = &args.output {
            tracing::trace!("writing ROM");
            let mut out = BufWriter::new(
                File::options()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| format!("cant open file: {e}"))?,
            );
            ld.write_rom(&mut out, overlay.as_deref(), args.pad)?;
            out.flush()?;
        }
        if let Some(path) = &args.sym {
            tracing::trace!("writing symbol file");
            let mut out = BufWriter::new(
                File::options()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| format!("cant open file: {e}"))?,
            );
            ld.write_sym(&mut out)?;
            out.flush()?;
        }
        if let Some(path) = &args.map {
            tracing::trace!("writing map file");
            let mut out = BufWriter::new(
                File::options()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| format!("cant open file: {e}"))?,
            );
            ld.write_map(&mut out)?;
            out.flush()?;
        }
    }

    Ok(ld.errors)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkVal {
    Label,
    Const,
    Ref(Option<usize>),
}

#[derive(Debug, Clone, Copy)]
struct LinkSym<'a> {
    name: &'a str,
    obj: usize,
    node: u32,
    line: u32,
    sect: i32,
    value: i32,
    val: LinkVal,
}

struct LinkPatch<'a> {
    obj: usize,
    patch: Patch<'a>,
}

struct LinkSect<'a> {
    name: &'a str,
    kind: SectKind,
    modif: SectMod,
    size: u32,
    org: i32,
    bank: i32,
    align: u8,
    align_ofs: u32,
    data: Vec<u8>,
    patches: Vec<LinkPatch<'a>>,
    syms: Vec<usize>,
}

struct ObjMeta<'a> {
    name: &'a str,
    nodes: Vec<gbasm::Node<'a>>,
}

struct Ld<'a> {
    str_int: StrInterner<'a>,
    expr_int: SliceInterner<ExprNode<'a>>,
    layout: Layout,
    sections: Vec<LinkSect<'a>>,
    sect_names: HashMap<&'a str, usize>,
    syms: Vec<LinkSym<'a>>,
    exports: HashMap<&'a str, usize>,
    objs: Vec<ObjMeta<'a>>,
    asserts: Vec<(usize, Assertion<'a>)>,
    warnings: Warnings,
    errors: usize,
}

impl<'a> Ld<'a> {
    fn new(layout: Layout, warnings: Warnings) -> Self {
        Self {
            str_int: StrInterner::new(),
            expr_int: SliceInterner::new(),
            layout,
            sections: Vec::new(),
            sect_names: HashMap::new(),
            syms: Vec::new(),
            exports: HashMap::new(),
            objs: Vec::new(),
            asserts: Vec::new(),
            warnings,
            errors: 0,
        }
    }

    fn error(&mut self, msg: &str) {
        tracing::error!("{msg}");
        self.errors += 1;
    }

    fn warn(&mut self, warning: Warning, msg: &str) {
        match self.warnings.state(warning) {
            WarnState::Allow => {}
            WarnState::Warn => tracing::warn!("{msg} [-W{}]", warning.name()),
            WarnState::Error => {
                tracing::error!("{msg} [-Werror={}]", warning.name());
                self.errors += 1;
            }
        }
    }

    /// Reconstruct `outer(line) -> ... -> inner(line)` from an object's
    /// node table.
    fn where_in(&self, obj: usize, node: u32, line: u32) -> String {
        let nodes = &self.objs[obj].nodes;
        let mut chain = Vec::new();
        let mut cur = node as i64;
        let mut cur_line = line;
        while cur >= 0 && (cur as usize) < nodes.len() {
            let n = &nodes[cur as usize];
            let name = match &n.info {
                NodeInfo::File(path) => path.to_string(),
                NodeInfo::Macro(name) => name.to_string(),
                NodeInfo::Rept(iters) => match iters.last() {
                    Some(iter) => format!("REPT~{}", iter + 1),
                    None => String::from("REPT"),
                },
            };
            chain.push(format!("{name}({cur_line})"));
            cur_line = n.parent_line;
            cur = n.parent as i64;
        }
        if chain.is_empty() {
            return format!("{}: ", self.objs[obj].name);
        }
        chain.reverse();
        format!("{}: {}: ", self.objs[obj].name, chain.join(" -> "))
    }

    fn load<R: io::Read>(&mut self, name: &str, reader: &mut R) -> io::Result<()> {
        let mut obj = Object::read(name, reader, &mut self.str_int, &mut self.expr_int)?;
        let obj_index = self.objs.len();
        let obj_name = self.str_int.intern(name);
        // registered up front so diagnostics during the merge can walk
        // this object's node table
        self.objs.push(ObjMeta {
            name: obj_name,
            nodes: std::mem::take(&mut obj.nodes),
        });

        // first the sections, so symbols and patches can be rebased onto
        // the merged table
        let mut sect_map: Vec<(usize, u32)> = Vec::new();
        let mut pending: Vec<(usize, u32, Vec<Patch<'a>>)> = Vec::new();
        for mut sect in obj.sects {
            let mut bank = sect.bank;
            if !self.layout.banked(sect.kind) {
                bank = self.layout.first_bank(sect.kind) as i32;
            }
            if self.layout.tiny && sect.kind == SectKind::Romx {
                self.error(&format!(
                    "{obj_name}: section \"{}\" is ROMX, which does not exist in 32KiB mode",
                    sect.name
                ));
            }
            if self.layout.big_wram0 && sect.kind == SectKind::Wramx {
                self.error(&format!(
                    "{obj_name}: section \"{}\" is WRAMX, but WRAM is a single bank",
                    sect.name
                ));
            }
            let patches = std::mem::take(&mut sect.patches);
            if let Some(&index) = self.sect_names.get(sect.name) {
                let base = match self.merge_sect(obj_name, index, &sect, bank) {
                    Some(base) => base,
                    None => {
                        // merge failed; drop the piece but keep indices sane
                        sect_map.push((index, 0));
                        continue;
                    }
                };
                let merged = &mut self.sections[index];
                if sect.modif == SectMod::Fragment {
                    merged.data.extend_from_slice(&sect.data);
                    merged.size += sect.size;
                } else {
                    merged.size = merged.size.max(sect.size);
                }
                sect_map.push((index, base));
                pending.push((index, base, patches));
            } else {
                let index = self.sections.len();
                self.sect_names.insert(sect.name, index);
                self.sections.push(LinkSect {
                    name: sect.name,
                    kind: sect.kind,
                    modif: sect.modif,
                    size: sect.size,
                    org: sect.org,
                    bank,
                    align: sect.align,
                    align_ofs: sect.align_ofs,
                    data: sect.data,
                    patches: Vec::new(),
                    syms: Vec::new(),
                });
                sect_map.push((index, 0));
                pending.push((index, 0, patches));
            }
        }

        // then the symbols
        let mut sym_map: Vec<u32> = Vec::with_capacity(obj.syms.len());
        for sym in obj.syms {
            let index = self.syms.len();
            match sym.kind {
                ObjSymKind::Import => {
                    self.syms.push(LinkSym {
                        name: sym.name,
                        obj: obj_index,
                        node: sym.node,
                        line: sym.line,
                        sect: -1,
                        value: 0,
                        val: LinkVal::Ref(None),
                    });
                }
                kind => {
                    let (sect, value, val) = if sym.sect >= 0 {
                        let (global, base) = sect_map[sym.sect as usize];
                        self.sections[global].syms.push(index);
                        (
                            global as i32,
                            sym.value.wrapping_add(base as i32),
                            LinkVal::Label,
                        )
                    } else {
                        (-1, sym.value, LinkVal::Const)
                    };
                    if kind == ObjSymKind::Export {
                        if let Some(&other) = self.exports.get(sym.name) {
                            let msg = format!(
                                "{}duplicate exported symbol \"{}\", first defined at {}",
                                self.where_in(obj_index, sym.node, sym.line),
                                sym.name,
                                self.where_in(
                                    self.syms[other].obj,
                                    self.syms[other].node,
                                    self.syms[other].line
                                ),
                            );
                            self.error(&msg);
                        } else {
                            self.exports.insert(sym.name, index);
                        }
                    }
                    self.syms.push(LinkSym {
                        name: sym.name,
                        obj: obj_index,
                        node: sym.node,
                        line: sym.line,
                        sect,
                        value,
                        val,
                    });
                }
            }
            sym_map.push(index as u32);
        }

        // and finally the patches and assertions, rebased and with their
        // RPN symbol indices rewritten into the global table
        for (index, base, patches) in pending {
            for patch in patches {
                let expr = self.translate_expr(&sym_map, patch.expr);
                let (pc_sect, pc_offset) = if patch.pc_sect >= 0 {
                    let (global, pc_base) = sect_map[patch.pc_sect as usize];
                    (global as i32, patch.pc_offset + pc_base)
                } else {
                    (-1, patch.pc_offset)
                };
                self.sections[index].patches.push(LinkPatch {
                    obj: obj_index,
                    patch: Patch {
                        offset: patch.offset + base,
                        pc_sect,
                        pc_offset,
                        expr,
                        ..patch
                    },
                });
            }
        }
        for assert in obj.asserts {
            let expr = self.translate_expr(&sym_map, assert.expr);
            let (pc_sect, pc_offset) = if assert.pc_sect >= 0 {
                let (global, base) = sect_map[assert.pc_sect as usize];
                (global as i32, assert.pc_offset + base)
            } else {
                (-1, assert.pc_offset)
            };
            self.asserts.push((
                obj_index,
                Assertion {
                    pc_sect,
                    pc_offset,
                    expr,
                    ..assert
                },
            ));
        }

        Ok(())
    }

    /// Reconcile a section piece with the merged section of the same
    /// name. Returns the base offset for the piece's symbols and patches,
    /// or None after diagnosing a conflict.
    fn merge_sect(
        &mut self,
        obj_name: &str,
        index: usize,
        sect: &gbasm::Sect<'a>,
        bank: i32,
    ) -> Option<u32> {
        let merged = &self.sections[index];
        let name = merged.name;
        if merged.kind != sect.kind {
            self.error(&format!(
                "{obj_name}: section \"{name}\" is {}, but was already declared as {}",
                sect.kind.name(),
                merged.kind.name()
            ));
            return None;
        }
        if merged.modif != sect.modif || sect.modif == SectMod::Normal {
            self.error(&format!(
                "{obj_name}: section \"{name}\" is declared in multiple objects \
                 without UNION or FRAGMENT"
            ));
            return None;
        }
        if merged.org >= 0 && sect.org >= 0 && merged.org != sect.org {
            self.error(&format!(
                "{obj_name}: section \"{name}\" is fixed at two different addresses"
            ));
            return None;
        }
        if merged.bank >= 0 && bank >= 0 && merged.bank != bank {
            self.error(&format!(
                "{obj_name}: section \"{name}\" is fixed in two different banks"
            ));
            return None;
        }
        let base = if sect.modif == SectMod::Fragment {
            self.sections[index].size
        } else {
            0
        };
        let merged = &mut self.sections[index];
        if merged.org < 0 {
            merged.org = sect.org;
        }
        if merged.bank < 0 {
            merged.bank = bank;
        }
        if sect.align > merged.align {
            merged.align = sect.align;
            merged.align_ofs = sect.align_ofs;
        }
        Some(base)
    }

    fn translate_expr(&mut self, sym_map: &[u32], expr: &'a [ExprNode<'a>]) -> &'a [ExprNode<'a>] {
        if !expr
            .iter()
            .any(|node| matches!(node, ExprNode::Sym(_) | ExprNode::BankSym(_)))
        {
            return expr;
        }
        let nodes: Vec<ExprNode<'a>> = expr
            .iter()
            .map(|node| match *node {
                ExprNode::Sym(index) => ExprNode::Sym(sym_map[index as usize]),
                ExprNode::BankSym(index) => ExprNode::BankSym(sym_map[index as usize]),
                node => node,
            })
            .collect();
        self.expr_int.intern(&nodes)
    }

    fn resolve_refs(&mut self) {
        for index in 0..self.syms.len() {
            if let LinkVal::Ref(None) = self.syms[index].val {
                let name = self.syms[index].name;
                if let Some(&target) = self.exports.get(name) {
                    self.syms[index].val = LinkVal::Ref(Some(target));
                } else {
                    let msg = format!(
                        "{}undefined symbol \"{name}\"",
                        self.where_in(self.syms[index].obj, self.syms[index].node, 0),
                    );
                    self.error(&msg);
                }
            }
        }
    }

    fn apply_script(&mut self, script: &Script) -> io::Result<()> {
        for (name, pin) in &script.sections {
            let Some(&index) = self.sect_names.get(name.as_str()) else {
                self.error(&format!("linker script names unknown section \"{name}\""));
                continue;
            };
            if let Some(org) = pin.org {
                let sect = &self.sections[index];
                if sect.org >= 0 && sect.org != org as i32 {
                    self.error(&format!(
                        "linker script pins section \"{name}\" at ${org:04X}, \
                         but it is fixed at ${:04X}",
                        sect.org
                    ));
                } else {
                    self.sections[index].org = org as i32;
                }
            }
            if let Some(bank) = pin.bank {
                let sect = &self.sections[index];
                if sect.bank >= 0 && sect.bank != bank as i32 {
                    self.error(&format!(
                        "linker script pins section \"{name}\" in bank {bank}, \
                         but it is fixed in bank {}",
                        sect.bank
                    ));
                } else {
                    self.sections[index].bank = bank as i32;
                }
            }
        }
        Ok(())
    }

    /// First-fit placement, most-constrained first. Ordering is fully
    /// deterministic so a given set of objects always produces the same
    /// image.
    fn place(&mut self) {
        let mut spaces: Spaces = HashMap::new();
        let mut groups: [Vec<usize>; 4] = Default::default();
        for index in 0..self.sections.len() {
            let sect = &self.sections[index];
            let group = match (sect.org >= 0, sect.bank >= 0) {
                (true, true) => 0,
                (false, true) => 1,
                (true, false) => 2,
                (false, false) => 3,
            };
            groups[group].push(index);
        }
        // large sections first, names breaking ties
        for group in &mut groups {
            group.sort_by(|&a, &b| {
                self.sections[b]
                    .size
                    .cmp(&self.sections[a].size)
                    .then_with(|| self.sections[a].name.cmp(self.sections[b].name))
            });
        }

        for &index in &groups[0] {
            let (kind, bank, org, size) = self.sect_geometry(index);
            if let Err(msg) = carve(
                &mut spaces,
                self.layout,
                kind,
                bank,
                org,
                size,
                self.sections[index].name,
            ) {
                self.error(&msg);
            }
        }
        for &index in &groups[1] {
            let (kind, bank, _, size) = self.sect_geometry(index);
            let sect = &self.sections[index];
            match fit(
                &mut spaces,
                self.layout,
                kind,
                bank,
                size,
                sect.align,
                sect.align_ofs,
            ) {
                Some(org) => self.sections[index].org = org as i32,
                None => {
                    let msg = format!(
                        "no room left for section \"{}\" (${size:04X} bytes) in {} bank {bank}",
                        sect.name,
                        kind.name()
                    );
                    self.error(&msg);
                }
            }
        }
        for &index in &groups[2] {
            let (kind, _, org, size) = self.sect_geometry(index);
            let name = self.sections[index].name;
            let mut placed = false;
            for bank in self.layout.first_bank(kind)..=self.layout.last_bank(kind) {
                if carve(&mut spaces, self.layout, kind, bank, org, size, name).is_ok() {
                    self.sections[index].bank = bank as i32;
                    placed = true;
                    break;
                }
            }
            if !placed {
                let msg = format!(
                    "no bank has room for section \"{name}\" at ${org:04X} (${size:04X} bytes)"
                );
                self.error(&msg);
            }
        }
        for &index in &groups[3] {
            let (kind, _, _, size) = self.sect_geometry(index);
            let sect = &self.sections[index];
            let (name, align, align_ofs) = (sect.name, sect.align, sect.align_ofs);
            let mut placed = false;
            for bank in self.layout.first_bank(kind)..=self.layout.last_bank(kind) {
                if let Some(org) = fit(&mut spaces, self.layout, kind, bank, size, align, align_ofs)
                {
                    self.sections[index].org = org as i32;
                    self.sections[index].bank = bank as i32;
                    placed = true;
                    break;
                }
            }
            if !placed {
                let msg = format!(
                    "no room left for section \"{name}\" (${size:04X} bytes) in {}",
                    kind.name()
                );
                self.error(&msg);
            }
        }
    }

    fn sect_geometry(&self, index: usize) -> (SectKind, u32, u32, u32) {
        let sect = &self.sections[index];
        (
            sect.kind,
            sect.bank.max(0) as u32,
            sect.org.max(0) as u32,
            sect.size,
        )
    }

    fn sym_value(&self, index: usize) -> Option<i32> {
        let sym = &self.syms[index];
        match sym.val {
            LinkVal::Const => Some(sym.value),
            LinkVal::Label => {
                let org = self.sections[sym.sect as usize].org;
                if org < 0 {
                    return None;
                }
                Some(org.wrapping_add(sym.value))
            }
            LinkVal::Ref(Some(target)) => self.sym_value(target),
            LinkVal::Ref(None) => None,
        }
    }

    fn sym_bank(&self, index: usize) -> Option<i32> {
        let sym = &self.syms[index];
        match sym.val {
            LinkVal::Label => {
                let bank = self.sections[sym.sect as usize].bank;
                (bank >= 0).then_some(bank)
            }
            LinkVal::Ref(Some(target)) => self.sym_bank(target),
            _ => None,
        }
    }

    fn eval_rpn(&self, expr: &[ExprNode<'a>], pc_sect: i32) -> Result<i32, String> {
        let mut scratch: Vec<i32> = Vec::new();
        for node in expr {
            match *node {
                ExprNode::Const(value) => scratch.push(value),
                ExprNode::Sym(index) => {
                    let value = self
                        .sym_value(index as usize)
                        .ok_or_else(|| {
                            format!("symbol \"{}\" has no value", self.syms[index as usize].name)
                        })?;
                    scratch.push(value);
                }
                ExprNode::BankSym(index) => {
                    let bank = self.sym_bank(index as usize).ok_or_else(|| {
                        format!(
                            "BANK(\"{}\") is not a banked label",
                            self.syms[index as usize].name
                        )
                    })?;
                    scratch.push(bank);
                }
                ExprNode::BankSect(name) => {
                    let index = self
                        .sect_names
                        .get(name)
                        .ok_or_else(|| format!("BANK of unknown section \"{name}\""))?;
                    scratch.push(self.sections[*index].bank);
                }
                ExprNode::BankSelf => {
                    if pc_sect < 0 {
                        return Err(String::from("BANK(@) outside of a section"));
                    }
                    scratch.push(self.sections[pc_sect as usize].bank);
                }
                ExprNode::Sizeof(name) => {
                    let index = self
                        .sect_names
                        .get(name)
                        .ok_or_else(|| format!("SIZEOF of unknown section \"{name}\""))?;
                    scratch.push(self.sections[*index].size as i32);
                }
                ExprNode::Startof(name) => {
                    let index = self
                        .sect_names
                        .get(name)
                        .ok_or_else(|| format!("STARTOF of unknown section \"{name}\""))?;
                    scratch.push(self.sections[*index].org);
                }
                ExprNode::Op(op) => {
                    let rhs = scratch.pop().ok_or("malformed expression")?;
                    match op {
                        RpnOp::NEG => scratch.push(rhs.wrapping_neg()),
                        RpnOp::NOT => scratch.push(!rhs),
                        RpnOp::LOGNOT => scratch.push((rhs == 0) as i32),
                        RpnOp::HRAM_CHECK => {
                            // either a bare low byte or a full high-page
                            // address, capped at $FFFE
                            let addr = rhs as u32;
                            if addr > 0xFE && !(0xFF00..=0xFFFE).contains(&addr) {
                                return Err(format!("address ${addr:04X} is not in high RAM"));
                            }
                            scratch.push(rhs & 0xFF);
                        }
                        RpnOp::RST_CHECK => {
                            if rhs as u32 & !0x38 != 0 {
                                return Err(format!(
                                    "${:04X} is not an rst target",
                                    rhs as u32
                                ));
                            }
                            scratch.push(rhs);
                        }
                        op => {
                            let lhs = scratch.pop().ok_or("malformed expression")?;
                            let value = match op {
                                RpnOp::ADD => lhs.wrapping_add(rhs),
                                RpnOp::SUB => lhs.wrapping_sub(rhs),
                                RpnOp::MUL => lhs.wrapping_mul(rhs),
                                RpnOp::DIV => {
                                    if rhs == 0 {
                                        return Err(String::from("division by zero"));
                                    }
                                    lhs.wrapping_div(rhs)
                                }
                                RpnOp::MOD => {
                                    if rhs == 0 {
                                        return Err(String::from("division by zero"));
                                    }
                                    lhs.wrapping_rem(rhs)
                                }
                                RpnOp::EXP => {
                                    if rhs < 0 {
                                        return Err(String::from("negative exponent"));
                                    }
                                    lhs.wrapping_pow(rhs as u32)
                                }
                                RpnOp::AND => lhs & rhs,
                                RpnOp::OR => lhs | rhs,
                                RpnOp::XOR => lhs ^ rhs,
                                RpnOp::SHL => {
                                    (lhs as u32).checked_shl(rhs as u32).unwrap_or(0) as i32
                                }
                                RpnOp::SHR => {
                                    if (rhs as u32) >= 32 {
                                        lhs >> 31
                                    } else {
                                        lhs >> rhs
                                    }
                                }
                                RpnOp::USHR => {
                                    ((lhs as u32).checked_shr(rhs as u32).unwrap_or(0)) as i32
                                }
                                RpnOp::LOGAND => ((lhs != 0) && (rhs != 0)) as i32,
                                RpnOp::LOGOR => ((lhs != 0) || (rhs != 0)) as i32,
                                RpnOp::LOGEQ => (lhs == rhs) as i32,
                                RpnOp::LOGNE => (lhs != rhs) as i32,
                                RpnOp::LOGGT => (lhs > rhs) as i32,
                                RpnOp::LOGLT => (lhs < rhs) as i32,
                                RpnOp::LOGGE => (lhs >= rhs) as i32,
                                RpnOp::LOGLE => (lhs <= rhs) as i32,
                                _ => return Err(format!("unknown RPN opcode ${op:02X}")),
                            };
                            scratch.push(value);
                        }
                    }
                }
            }
        }
        scratch.pop().ok_or_else(|| String::from("empty expression"))
    }

    /// Fold every patch and write the little-endian result into its
    /// section. A failed patch is diagnosed and leaves zeroes behind.
    fn resolve_patches(&mut self) {
        for index in 0..self.sections.len() {
            let patches = std::mem::take(&mut self.sections[index].patches);
            for lp in &patches {
                let at = self.where_in(lp.obj, lp.patch.node, lp.patch.line);
                let value = match self.eval_rpn(lp.patch.expr, lp.patch.pc_sect) {
                    Ok(value) => value,
                    Err(msg) => {
                        self.error(&format!("{at}{msg}"));
                        continue;
                    }
                };
                let offset = lp.patch.offset as usize;
                let data = &mut self.sections[index].data;
                match lp.patch.kind {
                    PatchKind::Byte => {
                        if value < -0x80 || value > 0xFF {
                            let msg =
                                format!("{at}expression ${:04X} does not fit in 1 byte", value);
                            self.error(&msg);
                            continue;
                        }
                        data[offset] = (value as u32 & 0xFF) as u8;
                    }
                    PatchKind::Word => {
                        if value < -0x8000 || value > 0xFFFF {
                            let msg =
                                format!("{at}expression ${:04X} does not fit in 2 bytes", value);
                            self.error(&msg);
                            continue;
                        }
                        data[offset] = (value as u32 & 0xFF) as u8;
                        data[offset + 1] = ((value as u32 >> 8) & 0xFF) as u8;
                    }
                    PatchKind::Long => {
                        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
                    }
                    PatchKind::Jr => {
                        if lp.patch.pc_sect < 0 {
                            let msg = format!("{at}jr patch has no section");
                            self.error(&msg);
                            continue;
                        }
                        let base = self.sections[lp.patch.pc_sect as usize].org
                            + lp.patch.pc_offset as i32;
                        let disp = value.wrapping_sub(base + 1);
                        if !(-128..=127).contains(&disp) {
                            let msg = format!("{at}jr target out of range ({disp} bytes)");
                            self.error(&msg);
                            continue;
                        }
                        self.sections[index].data[offset] = (disp as u32 & 0xFF) as u8;
                    }
                }
            }
        }
    }

    fn check_asserts(&mut self) -> io::Result<()> {
        let asserts = std::mem::take(&mut self.asserts);
        for (obj, assert) in &asserts {
            let at = self.where_in(*obj, assert.node, assert.line);
            match self.eval_rpn(assert.expr, assert.pc_sect) {
                Ok(value) if value != 0 => {}
                Ok(_) => match assert.level {
                    AssertLevel::Warn => {
                        let msg = format!("{at}{}", assert.msg);
                        self.warn(Warning::Assert, &msg);
                    }
                    AssertLevel::Error => {
                        let msg = format!("{at}{}", assert.msg);
                        self.error(&msg);
                    }
                    AssertLevel::Fatal => {
                        return Err(io::Error::other(format!("{at}{}", assert.msg)));
                    }
                },
                Err(msg) => {
                    let msg = format!("{at}assertion cannot be evaluated: {msg}");
                    self.error(&msg);
                }
            }
        }
        Ok(())
    }

    fn max_bank(&self, kind: SectKind) -> Option<u32> {
        self.sections
            .iter()
            .filter(|sect| sect.kind == kind && sect.bank >= 0)
            .map(|sect| sect.bank as u32)
            .max()
    }

    fn bank_sections(&self, kind: SectKind, bank: u32) -> Vec<usize> {
        let mut list: Vec<usize> = (0..self.sections.len())
            .filter(|&index| {
                let sect = &self.sections[index];
                sect.kind == kind && sect.bank == bank as i32 && sect.org >= 0
            })
            .collect();
        list.sort_by_key(|&index| self.sections[index].org);
        list
    }

    /// Walk ROM0 then every ROMX bank in order, padding the gaps between
    /// sections with the pad byte or the overlay's bytes. An overlay can
    /// also force extra ROMX banks into the image.
    fn write_rom<W: Write>(
        &self,
        out: &mut W,
        overlay: Option<&[u8]>,
        pad: u8,
    ) -> io::Result<()> {
        let overlay_banks = if let Some(ov) = overlay {
            if ov.len() % BANK_SIZE as usize != 0 {
                return Err(io::Error::other(
                    "overlay file must have a size multiple of $4000",
                ));
            }
            let n = (ov.len() / BANK_SIZE as usize) as u32;
            if self.layout.tiny && n != 2 {
                return Err(io::Error::other(
                    "overlay must be exactly $8000 bytes large in 32KiB mode",
                ));
            }
            if n < 2 {
                return Err(io::Error::other("overlay must be at least $8000 bytes large"));
            }
            n
        } else {
            0
        };
        let rom0_banks = self.layout.len(SectKind::Rom0) / BANK_SIZE;
        let mut nb_romx = self.max_bank(SectKind::Romx).unwrap_or(0);
        if overlay_banks > rom0_banks {
            nb_romx = nb_romx.max(overlay_banks - rom0_banks);
        }
        self.write_rom_bank(out, SectKind::Rom0, 0, 0, overlay, pad)?;
        for bank in 1..=nb_romx {
            self.write_rom_bank(out, SectKind::Romx, bank, bank, overlay, pad)?;
        }
        Ok(())
    }

    fn write_rom_bank<W: Write>(
        &self,
        out: &mut W,
        kind: SectKind,
        bank: u32,
        file_bank: u32,
        overlay: Option<&[u8]>,
        pad: u8,
    ) -> io::Result<()> {
        let base = self.layout.start(kind) as u32;
        let len = self.layout.len(kind);
        let ov = overlay.and_then(|ov| {
            let off = file_bank as usize * BANK_SIZE as usize;
            (off < ov.len()).then(|| &ov[off..])
        });
        let gap = |offset: u32| {
            ov.and_then(|ov| ov.get(offset as usize))
                .copied()
                .unwrap_or(pad)
        };
        let mut offset = 0u32;
        for index in self.bank_sections(kind, bank) {
            let sect = &self.sections[index];
            if sect.size == 0 {
                continue;
            }
            let start = sect.org as u32 - base;
            while offset < start {
                out.write_all(&[gap(offset)])?;
                offset += 1;
            }
            out.write_all(&sect.data)?;
            offset += sect.size;
        }
        while offset < len {
            out.write_all(&[gap(offset)])?;
            offset += 1;
        }
        Ok(())
    }

    /// `BB:AAAA name` per symbol, banks walked in the documented type
    /// order, symbols sorted by address with locals grouped under their
    /// parent label.
    fn write_sym<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "; File generated by gblink")?;
        for kind in SectKind::ALL {
            let Some(max_bank) = self.max_bank(kind) else {
                continue;
            };
            for bank in self.layout.first_bank(kind)..=max_bank {
                let mut list: Vec<(u16, &str)> = Vec::new();
                for index in self.bank_sections(kind, bank) {
                    let sect = &self.sections[index];
                    for &si in &sect.syms {
                        let sym = &self.syms[si];
                        if !sym
                            .name
                            .chars()
                            .next()
                            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                        {
                            continue;
                        }
                        list.push(((sect.org + sym.value) as u16, sym.name));
                    }
                }
                list.sort_by(|a, b| sym_order(a, b));
                for (addr, name) in list {
                    write!(out, "{bank:02x}:{addr:04x} ")?;
                    write_sym_name(out, name)?;
                    writeln!(out)?;
                }
            }
        }
        Ok(())
    }

    fn write_map<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "SUMMARY:")?;
        for kind in SectKind::ALL {
            // usage of the graphics and sprite windows is not meaningful
            if matches!(kind, SectKind::Vram | SectKind::Oam) {
                continue;
            }
            let Some(max_bank) = self.max_bank(kind) else {
                continue;
            };
            let nb_banks = max_bank - self.layout.first_bank(kind) + 1;
            let used: u32 = self
                .sections
                .iter()
                .filter(|sect| sect.kind == kind)
                .map(|sect| sect.size)
                .sum();
            write!(
                out,
                "\t{}: {used} byte{} used / {} free",
                kind.name(),
                if used == 1 { "" } else { "s" },
                nb_banks * self.layout.len(kind) - used
            )?;
            if self.layout.banked(kind) || nb_banks > 1 {
                write!(
                    out,
                    " in {nb_banks} bank{}",
                    if nb_banks == 1 { "" } else { "s" }
                )?;
            }
            writeln!(out)?;
        }
        for kind in SectKind::ALL {
            let Some(max_bank) = self.max_bank(kind) else {
                continue;
            };
            for bank in self.layout.first_bank(kind)..=max_bank {
                self.write_map_bank(out, kind, bank)?;
            }
        }
        Ok(())
    }

    fn write_map_bank<W: Write>(&self, out: &mut W, kind: SectKind, bank: u32) -> io::Result<()> {
        writeln!(out, "\n{} bank #{bank}:", kind.name())?;
        let mut used = 0u32;
        let mut prev_end = self.layout.start(kind) as u32;
        let sects = self.bank_sections(kind, bank);
        for &index in &sects {
            let sect = &self.sections[index];
            let org = sect.org as u32;
            used += sect.size;
            write_empty_space(out, prev_end, org)?;
            prev_end = org + sect.size;
            if sect.size != 0 {
                writeln!(
                    out,
                    "\tSECTION: ${org:04x}-${:04x} (${:04x} byte{}) [\"{}\"]",
                    prev_end - 1,
                    sect.size,
                    if sect.size == 1 { "" } else { "s" },
                    sect.name
                )?;
            } else {
                writeln!(out, "\tSECTION: ${org:04x} (0 bytes) [\"{}\"]", sect.name)?;
            }
            let mut symbols: Vec<(u32, &str)> = sect
                .syms
                .iter()
                .map(|&si| (org + self.syms[si].value as u32, self.syms[si].name))
                .filter(|(_, name)| {
                    name.chars()
                        .next()
                        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                })
                .collect();
            symbols.sort_by_key(|&(addr, _)| addr);
            for (addr, name) in symbols {
                // space matches "\tSECTION: $xxxx ..."
                writeln!(out, "\t         ${addr:04x} = {name}")?;
            }
        }
        if used == 0 && sects.is_empty() {
            writeln!(out, "\tEMPTY")?;
        } else {
            let bank_end = self.layout.start(kind) as u32 + self.layout.len(kind);
            write_empty_space(out, prev_end, bank_end)?;
            let slack = self.layout.len(kind) - used;
            writeln!(
                out,
                "\tTOTAL EMPTY: ${slack:04x} byte{}",
                if slack == 1 { "" } else { "s" }
            )?;
        }
        Ok(())
    }
}

fn write_empty_space<W: Write>(out: &mut W, begin: u32, end: u32) -> io::Result<()> {
    if begin < end {
        let len = end - begin;
        writeln!(
            out,
            "\tEMPTY: ${begin:04x}-${:04x} (${len:04x} byte{})",
            end - 1,
            if len == 1 { "" } else { "s" }
        )?;
    }
    Ok(())
}

/// Symbols are ordered by address, then by enclosing scope so a parent
/// label sorts directly before its local children. The key is a total
/// order, so sorting is insensitive to input order.
fn sym_order(a: &(u16, &str), b: &(u16, &str)) -> std::cmp::Ordering {
    fn scope(name: &str) -> (&str, bool) {
        match name.find('.') {
            Some(index) => (&name[..index], true),
            None => (name, false),
        }
    }
    let (a_scope, a_local) = scope(a.1);
    let (b_scope, b_local) = scope(b.1);
    a.0.cmp(&b.0)
        .then_with(|| a_scope.cmp(b_scope))
        .then_with(|| a_local.cmp(&b_local))
        .then_with(|| a.1.cmp(b.1))
}

/// Non-ASCII name characters are emitted as `\uXXXX`/`\UXXXXXXXX`
/// escapes so the sym file stays 7-bit clean.
fn write_sym_name<W: Write>(out: &mut W, name: &str) -> io::Result<()> {
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || "_@#$.".contains(c) {
            write!(out, "{c}")?;
        } else if (c as u32) <= 0xFFFF {
            write!(out, "\\u{:04x}", c as u32)?;
        } else {
            write!(out, "\\U{:08x}", c as u32)?;
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct Script {
    #[serde(rename = "SECTIONS", default)]
    sections: IndexMap<String, Pin>,
}

#[derive(Deserialize)]
struct Pin {
    #[serde(default, deserialize_with = "deserialize_bases_u32")]
    org: Option<u32>,

    #[serde(default, deserialize_with = "deserialize_bases_u32")]
    bank: Option<u32>,
}

fn deserialize_bases_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|buf| {
            if let Some(rest) = buf.strip_prefix('$') {
                u32::from_str_radix(rest, 16).map_err(|e| {
                    de::Error::custom(format!("{buf} is not a valid base 16 value: {e}"))
                })
            } else if let Some(rest) = buf.strip_prefix('%') {
                u32::from_str_radix(rest, 2).map_err(|e| {
                    de::Error::custom(format!("{buf} is not a valid base 2 value: {e}"))
                })
            } else {
                buf.parse().map_err(|e| {
                    de::Error::custom(format!("{buf} is not a valid base 10 value: {e}"))
                })
            }
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbasm::{Node, ObjSym, Sect};

    fn obj(sects: Vec<Sect<'static>>, syms: Vec<ObjSym<'static>>) -> Object<'static> {
        let mut obj = Object::new();
        obj.nodes.push(Node {
            parent: -1,
            parent_line: 0,
            info: NodeInfo::File("test.asm"),
        });
        obj.sects = sects;
        obj.syms = syms;
        obj
    }

    fn rom_sect(
        name: &'static str,
        modif: SectMod,
        org: i32,
        data: Vec<u8>,
        patches: Vec<Patch<'static>>,
    ) -> Sect<'static> {
        Sect {
            name,
            kind: SectKind::Rom0,
            modif,
            size: data.len() as u32,
            org,
            bank: 0,
            align: 0,
            align_ofs: 0,
            data,
            patches,
        }
    }

    fn label(name: &'static str, kind: ObjSymKind, sect: i32, value: i32) -> ObjSym<'static> {
        ObjSym {
            name,
            kind,
            node: 0,
            line: 1,
            sect,
            value,
        }
    }

    fn link(objs: Vec<Object<'static>>, layout: Layout) -> Ld<'static> {
        let mut ld = Ld::new(layout, Warnings::new());
        for (i, obj) in objs.iter().enumerate() {
            let mut buf = Vec::new();
            obj.write(&mut buf).unwrap();
            ld.load(&format!("obj{i}.o"), &mut buf.as_slice()).unwrap();
        }
        ld.resolve_refs();
        ld.place();
        ld.resolve_patches();
        ld.check_asserts().unwrap();
        ld
    }

    #[test]
    fn fragments_concatenate_across_objects() {
        let a = obj(
            vec![rom_sect("A", SectMod::Fragment, -1, vec![1], vec![])],
            vec![label("Label", ObjSymKind::Export, 0, 0)],
        );
        let b = obj(
            vec![rom_sect("A", SectMod::Fragment, -1, vec![2], vec![])],
            vec![],
        );
        let ld = link(vec![a, b], Layout::default());
        assert_eq!(ld.errors, 0);
        assert_eq!(ld.sections.len(), 1);
        assert_eq!(ld.sections[0].size, 2);
        assert_eq!(ld.sections[0].data, [1, 2]);
        assert_eq!(ld.sections[0].org, 0x0000);
        let entry = ld.exports["Label"];
        assert_eq!(ld.sym_value(entry), Some(0x0000));
    }

    #[test]
    fn union_sections_overlay() {
        let mk = |size: u32| Sect {
            name: "Vars",
            kind: SectKind::Wram0,
            modif: SectMod::Union,
            size,
            org: -1,
            bank: 0,
            align: 0,
            align_ofs: 0,
            data: Vec::new(),
            patches: Vec::new(),
        };
        let a = obj(vec![mk(4)], vec![]);
        let b = obj(vec![mk(16)], vec![]);
        let ld = link(vec![a, b], Layout::default());
        assert_eq!(ld.errors, 0);
        assert_eq!(ld.sections[0].size, 16);
        assert_eq!(ld.sections[0].org, 0xC000);
    }

    #[test]
    fn jr_displacement_resolves() {
        let a = obj(
            vec![
                rom_sect(
                    "A",
                    SectMod::Normal,
                    0x0000,
                    vec![0x18, 0x00],
                    vec![Patch {
                        node: 0,
                        line: 2,
                        offset: 1,
                        pc_sect: 0,
                        pc_offset: 1,
                        kind: PatchKind::Jr,
                        expr: &[ExprNode::Sym(0)],
                    }],
                ),
                rom_sect("B", SectMod::Normal, 0x0010, vec![0xC9], vec![]),
            ],
            vec![label("Target", ObjSymKind::Local, 1, 0)],
        );
        let ld = link(vec![a], Layout::default());
        assert_eq!(ld.errors, 0);
        // $0010 - ($0001 + 1)
        assert_eq!(ld.sections[0].data, [0x18, 0x0E]);
    }

    #[test]
    fn jr_out_of_range_is_diagnosed() {
        let a = obj(
            vec![
                rom_sect(
                    "A",
                    SectMod::Normal,
                    0x0000,
                    vec![0x18, 0x00],
                    vec![Patch {
                        node: 0,
                        line: 2,
                        offset: 1,
                        pc_sect: 0,
                        pc_offset: 1,
                        kind: PatchKind::Jr,
                        expr: &[ExprNode::Sym(0)],
                    }],
                ),
                rom_sect("B", SectMod::Normal, 0x0082, vec![0xC9], vec![]),
            ],
            vec![label("Target", ObjSymKind::Local, 1, 0)],
        );
        let ld = link(vec![a], Layout::default());
        assert!(ld.errors > 0);
    }

    #[test]
    fn overlay_fills_the_gaps() {
        let layout = Layout {
            tiny: true,
            ..Layout::default()
        };
        let a = obj(
            vec![rom_sect(
                "S",
                SectMod::Normal,
                0x0100,
                vec![0x55; 16],
                vec![],
            )],
            vec![],
        );
        let ld = link(vec![a], layout);
        assert_eq!(ld.errors, 0);
        let overlay = vec![0xAA; 0x8000];
        let mut rom = Vec::new();
        ld.write_rom(&mut rom, Some(&overlay), 0).unwrap();
        assert_eq!(rom.len(), 0x8000);
        assert!(rom[..0x100].iter().all(|&b| b == 0xAA));
        assert!(rom[0x100..0x110].iter().all(|&b| b == 0x55));
        assert!(rom[0x110..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn pad_byte_fills_without_an_overlay() {
        let a = obj(
            vec![rom_sect("S", SectMod::Normal, 0x0000, vec![1, 2], vec![])],
            vec![],
        );
        let ld = link(vec![a], Layout::default());
        let mut rom = Vec::new();
        ld.write_rom(&mut rom, None, 0xFF).unwrap();
        assert_eq!(rom.len(), 0x4000);
        assert_eq!(&rom[..2], &[1, 2]);
        assert!(rom[2..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn floating_sections_respect_alignment() {
        let fixed = rom_sect("Fixed", SectMod::Normal, 0x0000, vec![9, 9, 9], vec![]);
        let mut aligned = rom_sect("Aligned", SectMod::Normal, -1, vec![1, 2, 3, 4], vec![]);
        aligned.align = 8;
        let ld = link(vec![obj(vec![fixed, aligned], vec![])], Layout::default());
        assert_eq!(ld.errors, 0);
        let sect = &ld.sections[ld.sect_names["Aligned"]];
        assert_eq!(sect.org, 0x0100);
    }

    #[test]
    fn overlapping_fixed_sections_are_diagnosed() {
        let a = obj(
            vec![rom_sect("A", SectMod::Normal, 0x0000, vec![0; 8], vec![])],
            vec![],
        );
        let b = obj(
            vec![rom_sect("B", SectMod::Normal, 0x0004, vec![0; 8], vec![])],
            vec![],
        );
        let ld = link(vec![a, b], Layout::default());
        assert!(ld.errors > 0);
    }

    #[test]
    fn romx_banks_are_created_on_demand() {
        let mk = |name: &'static str| Sect {
            name,
            kind: SectKind::Romx,
            modif: SectMod::Normal,
            size: 0x4000,
            org: -1,
            bank: -1,
            align: 0,
            align_ofs: 0,
            data: vec![0; 0x4000],
            patches: Vec::new(),
        };
        let ld = link(vec![obj(vec![mk("X"), mk("Y")], vec![])], Layout::default());
        assert_eq!(ld.errors, 0);
        let mut banks: Vec<i32> = ld.sections.iter().map(|sect| sect.bank).collect();
        banks.sort();
        assert_eq!(banks, [1, 2]);
    }

    #[test]
    fn hram_check_masks_or_rejects() {
        let mk = |expr: &'static [ExprNode<'static>]| {
            obj(
                vec![rom_sect(
                    "A",
                    SectMod::Normal,
                    0x0000,
                    vec![0xF0, 0x00],
                    vec![Patch {
                        node: 0,
                        line: 1,
                        offset: 1,
                        pc_sect: 0,
                        pc_offset: 1,
                        kind: PatchKind::Byte,
                        expr,
                    }],
                )],
                vec![],
            )
        };
        let ld = link(
            vec![mk(&[
                ExprNode::Const(0xFF80),
                ExprNode::Op(RpnOp::HRAM_CHECK),
            ])],
            Layout::default(),
        );
        assert_eq!(ld.errors, 0);
        assert_eq!(ld.sections[0].data, [0xF0, 0x80]);

        let ld = link(
            vec![mk(&[
                ExprNode::Const(0xC000),
                ExprNode::Op(RpnOp::HRAM_CHECK),
            ])],
            Layout::default(),
        );
        assert!(ld.errors > 0);
    }

    #[test]
    fn undefined_imports_are_diagnosed() {
        let a = obj(
            vec![rom_sect(
                "A",
                SectMod::Normal,
                0x0000,
                vec![0, 0],
                vec![Patch {
                    node: 0,
                    line: 1,
                    offset: 0,
                    pc_sect: 0,
                    pc_offset: 0,
                    kind: PatchKind::Word,
                    expr: &[ExprNode::Sym(0)],
                }],
            )],
            vec![label("Nowhere", ObjSymKind::Import, -1, 0)],
        );
        let ld = link(vec![a], Layout::default());
        assert!(ld.errors > 0);
    }

    #[test]
    fn imports_resolve_across_objects() {
        let a = obj(
            vec![rom_sect(
                "A",
                SectMod::Normal,
                0x0000,
                vec![0, 0],
                vec![Patch {
                    node: 0,
                    line: 1,
                    offset: 0,
                    pc_sect: 0,
                    pc_offset: 0,
                    kind: PatchKind::Word,
                    expr: &[ExprNode::Sym(0), ExprNode::Const(1), ExprNode::Op(RpnOp::ADD)],
                }],
            )],
            vec![label("Entry", ObjSymKind::Import, -1, 0)],
        );
        let b = obj(
            vec![rom_sect("B", SectMod::Normal, 0x0200, vec![0xC9], vec![])],
            vec![label("Entry", ObjSymKind::Export, 0, 0)],
        );
        let ld = link(vec![a, b], Layout::default());
        assert_eq!(ld.errors, 0);
        assert_eq!(ld.sections[0].data, [0x01, 0x02]);
    }

    #[test]
    fn sym_file_ordering_is_stable() {
        let syms = vec![
            label("Zed", ObjSymKind::Local, 0, 1),
            label("Parent.child", ObjSymKind::Local, 0, 1),
            label("Parent", ObjSymKind::Local, 0, 0),
            label("Pair.x", ObjSymKind::Local, 0, 2),
            label("Pair", ObjSymKind::Local, 0, 2),
        ];
        let a = obj(
            vec![rom_sect("A", SectMod::Normal, 0x0000, vec![0; 4], vec![])],
            syms,
        );
        let ld = link(vec![a], Layout::default());
        let mut out = Vec::new();
        ld.write_sym(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "; File generated by gblink\n\
             00:0000 Parent\n\
             00:0001 Parent.child\n\
             00:0001 Zed\n\
             00:0002 Pair\n\
             00:0002 Pair.x\n"
        );
    }

    #[test]
    fn sym_names_escape_non_ascii() {
        let mut out = Vec::new();
        write_sym_name(&mut out, "Héllo").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "H\\u00e9llo");
    }

    #[test]
    fn map_file_shape() {
        let a = obj(
            vec![rom_sect("Home", SectMod::Normal, 0x0000, vec![0; 4], vec![])],
            vec![label("Start", ObjSymKind::Local, 0, 0)],
        );
        let ld = link(vec![a], Layout::default());
        let mut out = Vec::new();
        ld.write_map(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("SUMMARY:\n"));
        assert!(text.contains("\tROM0: 4 bytes used / 16380 free"));
        assert!(text.contains("ROM0 bank #0:"));
        assert!(text.contains("\tSECTION: $0000-$0003 ($0004 bytes) [\"Home\"]"));
        assert!(text.contains("\t         $0000 = Start"));
        assert!(text.contains("\tEMPTY: $0004-$3fff ($3ffc bytes)"));
        assert!(text.contains("\tTOTAL EMPTY: $3ffc bytes"));
    }

    #[test]
    fn linker_script_pins_sections() {
        let script: Script =
            toml::from_str("[SECTIONS.\"Home\"]\norg = \"$0150\"\nbank = \"0\"\n").unwrap();
        let a = obj(
            vec![rom_sect("Home", SectMod::Normal, -1, vec![1, 2], vec![])],
            vec![],
        );
        let mut ld = Ld::new(Layout::default(), Warnings::new());
        let mut buf = Vec::new();
        a.write(&mut buf).unwrap();
        ld.load("a.o", &mut buf.as_slice()).unwrap();
        ld.apply_script(&script).unwrap();
        ld.resolve_refs();
        ld.place();
        assert_eq!(ld.errors, 0);
        assert_eq!(ld.sections[0].org, 0x0150);
    }

    #[test]
    fn duplicate_exports_are_diagnosed() {
        let mk = || {
            obj(
                vec![rom_sect("A", SectMod::Fragment, -1, vec![0], vec![])],
                vec![label("Twice", ObjSymKind::Export, 0, 0)],
            )
        };
        let ld = link(vec![mk(), mk()], Layout::default());
        assert!(ld.errors > 0);
    }

    #[test]
    fn bank_fixed_sections_fill_their_bank_in_order() {
        let mk = |name: &'static str, size: u32| Sect {
            name,
            kind: SectKind::Romx,
            modif: SectMod::Normal,
            size,
            org: -1,
            bank: 3,
            align: 0,
            align_ofs: 0,
            data: vec![0; size as usize],
            patches: Vec::new(),
        };
        let ld = link(
            vec![obj(vec![mk("Big", 0x100), mk("Small", 0x10)], vec![])],
            Layout::default(),
        );
        assert_eq!(ld.errors, 0);
        let big = &ld.sections[ld.sect_names["Big"]];
        let small = &ld.sections[ld.sect_names["Small"]];
        // larger sections place first, so they pack from the bank start
        assert_eq!((big.bank, big.org), (3, 0x4000));
        assert_eq!((small.bank, small.org), (3, 0x4100));
    }
}

type Spaces = HashMap<(SectKind, u32), Vec<(u32, u32)>>;

fn space_for<'s>(
    spaces: &'s mut Spaces,
    layout: Layout,
    kind: SectKind,
    bank: u32,
) -> &'s mut Vec<(u32, u32)> {
    spaces.entry((kind, bank)).or_insert_with(|| {
        let start = layout.start(kind) as u32;
        vec![(start, start + layout.len(kind))]
    })
}

/// Claim `[org, org+size)` in the given bank; on overlap the caller gets
/// a message naming the conflict.
fn carve(
    spaces: &mut Spaces,
    layout: Layout,
    kind: SectKind,
    bank: u32,
    org: u32,
    size: u32,
    name: &str,
) -> Result<(), String> {
    let window = layout.start(kind) as u32;
    let window_end = window + layout.len(kind);
    if org < window || org + size > window_end {
        return Err(format!(
            "section \"{name}\" (${org:04X}-${:04X}) does not fit the {} window \
             (${window:04X}-${:04X})",
            org + size,
            kind.name(),
            window_end - 1
        ));
    }
    if size == 0 {
        return Ok(());
    }
    let free = space_for(spaces, layout, kind, bank);
    for i in 0..free.len() {
        let (start, end) = free[i];
        if org >= start && org + size <= end {
            free.remove(i);
            if org > start {
                free.insert(i, (start, org));
            }
            if org + size < end {
                let at = if org > start { i + 1 } else { i };
                free.insert(at, (org + size, end));
            }
            return Ok(());
        }
    }
    Err(format!(
        "section \"{name}\" (${org:04X}-${:04X}) overlaps another section in {} bank {bank}",
        org + size - 1,
        kind.name()
    ))
}

/// First-fit scan of a bank's free list, honoring the section's
/// alignment constraint. Returns the chosen org.
fn fit(
    spaces: &mut Spaces,
    layout: Layout,
    kind: SectKind,
    bank: u32,
    size: u32,
    align: u8,
    align_ofs: u32,
) -> Option<u32> {
    let free = space_for(spaces, layout, kind, bank);
    for i in 0..free.len() {
        let (start, end) = free[i];
        let org = if align == 0 {
            start
        } else {
            let mask = (1u32 << align) - 1;
            start + (align_ofs.wrapping_sub(start) & mask)
        };
        if org + size > end {
            continue;
        }
        if size > 0 {
            free.remove(i);
            if org > start {
                free.insert(i, (start, org));
            }
            if org + size < end {
                let at = if org > start { i + 1 } else { i };
                free.insert(at, (org + size, end));
            }
        }
        return Some(org);
    }
    None
}
