use std::{
    error::Error,
    fs::{self, File},
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use gbasm::{
    AssertLevel, Assertion, ExprNode, Layout, Node, NodeInfo, ObjSym, ObjSymKind, Object, Patch,
    PatchKind, RpnOp, Sect, SectKind, SectMod, SliceInterner, StrInterner, WarnState, Warning,
    Warnings,
};
use indexmap::IndexMap;
use tracing::Level;

/// Assembler for the Game Boy SM83 CPU. Produces relocatable object
/// modules for `gblink`.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source file
    source: PathBuf,

    /// Output object file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Search directories for included files (repeatable)
    #[arg(short, long)]
    include: Vec<PathBuf>,

    /// Pre-defined symbols (repeatable)
    #[arg(short = 'D', long, value_name = "SYMBOL=val", value_parser = gbasm::parse_defines::<String, i32>)]
    define: Vec<(String, i32)>,

    /// Write Makefile dependency lines to this file
    #[arg(short = 'M', long)]
    depend: Option<PathBuf>,

    /// Disable the automatic `ld` to `ldh` rewrite for high-page addresses
    #[arg(short = 'L', long)]
    no_ldh: bool,

    /// Maximum include/macro/rept nesting depth
    #[arg(short, long, default_value_t = 64)]
    recursion_depth: usize,

    /// Warning control: NAME, no-NAME, error, or error=NAME (repeatable)
    #[arg(short = 'W', long = "warning", value_name = "NAME")]
    warnings: Vec<String>,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short = 'v', long, default_value_t = Level::INFO)]
    log_level: Level,
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
            tracing::error!("assembly failed with {errors} error(s)");
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

    let input = fs::canonicalize(&args.source)?;
    let input = input.to_str().ok_or("source path is not valid UTF-8")?;
    let text = fs::read_to_string(input).map_err(|e| format!("cant open file {input}: {e}"))?;

    let mut asm = Asm::new(args.include.clone(), args.recursion_depth, warnings);
    asm.opt_ldh = !args.no_ldh;
    let path = asm.str_int.intern(input);
    let text = asm.str_int.intern(&text);
    for (name, val) in &args.define {
        let name = asm.str_int.intern(name);
        asm.syms.push(Sym {
            name,
            val: SymVal::Equ(*val),
            exported: false,
            builtin: false,
            purged: false,
            referenced: false,
            node: 0,
            line: 0,
        });
    }
    asm.push_file(path, text);

    tracing::trace!("assembling {input}");
    asm.pass()?;

    if asm.errors == 0 {
        let mut output: Box<dyn Write> = match &args.output {
            Some(path) => Box::new(BufWriter::new(
                File::options()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| format!("cant open file: {e}"))?,
            )),
            None => Box::new(io::stdout()),
        };
        tracing::trace!("writing object");
        let errors = asm.errors;
        let obj = asm.to_object();
        obj.write(&mut output)?;
        output.flush()?;

        if let Some(path) = &args.depend {
            let mut depend = File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| format!("cant open file: {e}"))?;
            let mut target = args.source.clone();
            target.set_extension("o");
            writeln!(depend, "{}: {}", target.display(), args.source.display())?;
            for include in &asm.included {
                writeln!(depend, "{}: {}", target.display(), include.display())?;
            }
        }

        tracing::debug!("symbols: {}", obj.syms.len());
        tracing::debug!("sections: {}", obj.sects.len());
        tracing::debug!(
            "string heap: {} bytes",
            asm.str_int
                .storages
                .iter()
                .fold(0, |accum, storage| accum + storage.len())
        );
        return Ok(errors);
    }

    Ok(asm.errors)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymVal<'a> {
    Label { sect: i32, offset: u32 },
    Equ(i32),
    Var(i32),
    Equs(&'a str),
    Mac { body: &'a str, body_line: u32 },
    Ref,
}

#[derive(Debug, Clone, Copy)]
struct Sym<'a> {
    name: &'a str,
    val: SymVal<'a>,
    exported: bool,
    builtin: bool,
    purged: bool,
    referenced: bool,
    node: u32,
    line: u32,
}

/// An in-flight char-level expansion: macro args, `\@`, `{sym}`
/// interpolation, and EQUS splices all flow through here.
struct Exp<'a> {
    text: &'a str,
    offset: usize,
}

enum FrameKind<'a> {
    File {
        path: &'a str,
    },
    Macro {
        name: &'a str,
        args: Vec<&'a str>,
        shift: usize,
        unique: u32,
    },
    Rept {
        count: u32,
        iter: u32,
        unique: u32,
        var: Option<&'a str>,
        start: i32,
        step: i32,
    },
}

struct Frame<'a> {
    kind: FrameKind<'a>,
    src: &'a str,
    offset: usize,
    line: u32,
    body_line: u32,
    parent_line: u32,
    if_depth: usize,
    node: i32,
    node_iter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IfLevel {
    Taken,
    TakenElse,
}

#[derive(Debug, Clone, Copy)]
struct Load {
    sect: usize,
}

struct Charmap<'a> {
    name: &'a str,
    map: IndexMap<String, Vec<u8>>,
}

impl<'a> Charmap<'a> {
    /// Longest-prefix-match encode. Returns false if any character had no
    /// mapping and was copied through as raw UTF-8.
    fn encode(&self, s: &str, out: &mut Vec<u8>) -> bool {
        let mut rest = s;
        let mut clean = true;
        while !rest.is_empty() {
            let mut best: Option<(&str, &Vec<u8>)> = None;
            for (key, bytes) in &self.map {
                if rest.starts_with(key.as_str())
                    && best.is_none_or(|(prev, _)| key.len() > prev.len())
                {
                    best = Some((key, bytes));
                }
            }
            if let Some((key, bytes)) = best {
                out.extend_from_slice(bytes);
                rest = &rest[key.len()..];
            } else {
                let c = rest.chars().next().unwrap();
                out.extend_from_slice(c.to_string().as_bytes());
                rest = &rest[c.len_utf8()..];
                if !self.map.is_empty() {
                    clean = false;
                }
            }
        }
        clean
    }

    /// Number of charmap units in `s` (unmapped characters count as one
    /// unit each).
    fn units(&self, s: &str) -> Vec<usize> {
        let mut lens = Vec::new();
        let mut rest = s;
        while !rest.is_empty() {
            let mut best = 0;
            for key in self.map.keys() {
                if rest.starts_with(key.as_str()) && key.len() > best {
                    best = key.len();
                }
            }
            if best == 0 {
                best = rest.chars().next().unwrap().len_utf8();
            }
            lens.push(best);
            rest = &rest[best..];
        }
        lens
    }
}

struct SectData<'a> {
    sect: Sect<'a>,
    pc: u32,
    union_stack: Vec<(u32, u32)>,
}

impl<'a> SectData<'a> {
    fn new(
        name: &'a str,
        kind: SectKind,
        modif: SectMod,
        org: i32,
        bank: i32,
        align: u8,
        align_ofs: u32,
    ) -> Self {
        Self {
            sect: Sect {
                name,
                kind,
                modif,
                size: 0,
                org,
                bank,
                align,
                align_ofs,
                data: Vec::new(),
                patches: Vec::new(),
            },
            pc: 0,
            union_stack: Vec::new(),
        }
    }

    fn offset(&self) -> u32 {
        if self.sect.kind.has_data() {
            self.sect.data.len() as u32
        } else {
            self.pc
        }
    }
}

struct Asm<'a> {
    str_int: StrInterner<'a>,
    expr_int: SliceInterner<ExprNode<'a>>,

    frames: Vec<Frame<'a>>,
    exps: Vec<Exp<'a>>,
    stash: Option<Tok>,
    string: String,
    number: i32,
    tok_line: u32,
    no_expand: bool,

    nodes: Vec<Node<'a>>,

    syms: Vec<Sym<'a>>,
    scope: Option<&'a str>,
    anon: u32,
    unique: u32,

    sections: Vec<SectData<'a>>,
    cur: Option<usize>,
    sect_stack: Vec<(Option<usize>, Option<Load>)>,
    load: Option<Load>,

    asserts: Vec<Assertion<'a>>,

    charmaps: Vec<Charmap<'a>>,
    charmap: usize,
    charmap_stack: Vec<usize>,

    if_stack: Vec<IfLevel>,

    opt_q: u8,
    opt_pad: u8,
    opt_ldh: bool,

    warnings: Warnings,
    errors: usize,

    includes: Vec<PathBuf>,
    included: Vec<PathBuf>,
    depth: usize,

    layout: Layout,
}

impl<'a> Asm<'a> {
    fn new(includes: Vec<PathBuf>, depth: usize, warnings: Warnings) -> Self {
        let mut asm = Self {
            str_int: StrInterner::new(),
            expr_int: SliceInterner::new(),
            frames: Vec::new(),
            exps: Vec::new(),
            stash: None,
            string: String::new(),
            number: 0,
            tok_line: 1,
            no_expand: false,
            nodes: Vec::new(),
            syms: Vec::new(),
            scope: None,
            anon: 0,
            unique: 0,
            sections: Vec::new(),
            cur: None,
            sect_stack: Vec::new(),
            load: None,
            asserts: Vec::new(),
            charmaps: Vec::new(),
            charmap: 0,
            charmap_stack: Vec::new(),
            if_stack: Vec::new(),
            opt_q: 16,
            opt_pad: 0,
            opt_ldh: true,
            warnings,
            errors: 0,
            includes,
            included: Vec::new(),
            depth,
            layout: Layout::default(),
        };
        let main = asm.str_int.intern("main");
        asm.charmaps.push(Charmap {
            name: main,
            map: IndexMap::new(),
        });
        asm.install_builtins();
        asm
    }

    fn install_builtins(&mut self) {
        let (year, month, day, hour, min, sec) = utc_now();
        let date = self.str_int.intern(&format!("{year:04}-{month:02}-{day:02}"));
        let time = self.str_int.intern(&format!("{hour:02}:{min:02}:{sec:02}"));
        let iso = self
            .str_int
            .intern(&format!("{date}T{time}Z"));
        let equs = |name: &'static str, text: &'a str, syms: &mut Vec<Sym<'a>>| {
            syms.push(Sym {
                name,
                val: SymVal::Equs(text),
                exported: false,
                builtin: true,
                purged: false,
                referenced: false,
                node: 0,
                line: 0,
            });
        };
        equs("__DATE__", date, &mut self.syms);
        equs("__TIME__", time, &mut self.syms);
        // no timezone database is linked, so local time renders as UTC
        equs("__ISO_8601_LOCAL__", iso, &mut self.syms);
        equs("__ISO_8601_UTC__", iso, &mut self.syms);
        let equ = |name: &'static str, value: i32, syms: &mut Vec<Sym<'a>>| {
            syms.push(Sym {
                name,
                val: SymVal::Equ(value),
                exported: false,
                builtin: true,
                purged: false,
                referenced: false,
                node: 0,
                line: 0,
            });
        };
        equ("__UTC_YEAR__", year, &mut self.syms);
        equ("__UTC_MONTH__", month, &mut self.syms);
        equ("__UTC_DAY__", day, &mut self.syms);
        equ("__UTC_HOUR__", hour, &mut self.syms);
        equ("__UTC_MINUTE__", min, &mut self.syms);
        equ("__UTC_SECOND__", sec, &mut self.syms);
        let version = |var: &str| var.parse().unwrap_or(0);
        equ(
            "__GBASM_MAJOR__",
            version(env!("CARGO_PKG_VERSION_MAJOR")),
            &mut self.syms,
        );
        equ(
            "__GBASM_MINOR__",
            version(env!("CARGO_PKG_VERSION_MINOR")),
            &mut self.syms,
        );
        equ(
            "__GBASM_PATCH__",
            version(env!("CARGO_PKG_VERSION_PATCH")),
            &mut self.syms,
        );
        self.syms.push(Sym {
            name: "_RS",
            val: SymVal::Var(0),
            exported: false,
            builtin: true,
            purged: false,
            referenced: false,
            node: 0,
            line: 0,
        });
    }

    fn push_file(&mut self, path: &'a str, text: &'a str) {
        let parent_line = self.frames.last().map(|frame| frame.line).unwrap_or(0);
        self.frames.push(Frame {
            kind: FrameKind::File { path },
            src: text,
            offset: 0,
            line: 1,
            body_line: 1,
            parent_line,
            if_depth: self.if_stack.len(),
            node: -1,
            node_iter: 0,
        });
        self.node();
    }

    /// The whole assembly is a single pass; anything unknown becomes a
    /// patch for the linker. Recoverable errors are counted, the line is
    /// discarded, and parsing continues.
    fn pass(&mut self) -> io::Result<()> {
        loop {
            let tok = self.peek()?;
            if tok == Tok::EOF {
                break;
            }
            if let Err(e) = self.statement(tok) {
                if e.kind() != ErrorKind::InvalidData {
                    return Err(e);
                }
                tracing::error!("{e}");
                self.errors += 1;
                self.sync_line();
            }
        }
        if !self.if_stack.is_empty() {
            tracing::error!("{}", self.trace("unterminated IF block"));
            self.errors += 1;
        }
        if self.load.is_some() {
            tracing::error!("{}", self.trace("unterminated LOAD block"));
            self.errors += 1;
        }
        Ok(())
    }

    fn statement(&mut self, tok: Tok) -> io::Result<()> {
        match tok {
            Tok::NEWLINE => {
                self.eat();
                Ok(())
            }
            Tok::ID => self.ident_statement(),
            // a lone `:` defines an anonymous label
            Tok::COLON => {
                self.eat();
                let name = self.str_int.intern(&format!("@{}", self.anon));
                self.anon += 1;
                self.def_label(name, false)
            }
            tok => self.directive(tok),
        }
    }

    fn ident_statement(&mut self) -> io::Result<()> {
        if let Some(mne) = MNEMONICS
            .iter()
            .find(|mne| self.str_like(mne.0))
            .map(|mne| mne.1)
        {
            self.eat();
            self.instruction(mne)?;
            return self.eol();
        }
        if let Some(index) = self.find_sym(self.string.as_str())
            && let SymVal::Mac { .. } = self.syms[index].val
        {
            return self.invoke_macro(index);
        }
        // must be a label (or a constant definition in the legacy spelling)
        let name = self.label_name()?;
        self.eat();
        match self.peek()? {
            Tok::COLON => {
                self.eat();
                // `name: MACRO` is the legacy macro definition
                if self.peek()? == Tok::MACRO {
                    self.warn(Warning::Obsolete, "legacy macro syntax; use `MACRO name`");
                    self.eat();
                    self.eol()?;
                    return self.def_macro(name);
                }
                self.def_label(name, false)
            }
            Tok::DUB => {
                self.eat();
                self.def_label(name, true)
            }
            tok @ (Tok::EQU | Tok::EQUS | Tok::EQUAL | Tok::RB | Tok::RW) => {
                self.warn(
                    Warning::Obsolete,
                    "constant definition without DEF; use `DEF name ...`",
                );
                self.eat();
                self.def_constant(name, tok, false)?;
                self.eol()
            }
            Tok::NEWLINE | Tok::EOF => {
                self.warn(Warning::Obsolete, "label without a colon");
                self.def_label(name, false)
            }
            _ => Err(self.err(&format!(
                "\"{name}\" is not a mnemonic, directive, or defined macro \
                 (macros must be defined before use)"
            ))),
        }
    }

    /// Resolve the identifier in `self.string` to a full symbol name,
    /// composing local labels against the enclosing global scope.
    fn label_name(&mut self) -> io::Result<&'a str> {
        if self.string.starts_with('.') {
            let Some(scope) = self.scope else {
                return Err(self.err("local label outside of a global label scope"));
            };
            let name = format!("{scope}{}", self.string);
            Ok(self.str_int.intern(&name))
        } else {
            Ok(self.str_int.intern(&self.string.clone()))
        }
    }

    fn def_label(&mut self, name: &'a str, exported: bool) -> io::Result<()> {
        let Some((sect, offset)) = self.label_loc() else {
            return Err(self.err("label defined outside of a section"));
        };
        let node = self.node();
        let line = self.tok_line;
        if let Some(index) = self.find_sym(name) {
            if self.syms[index].builtin {
                return Err(self.err("built-in symbol cannot be redefined"));
            }
            if self.syms[index].val != SymVal::Ref {
                return Err(self.err(&format!("symbol \"{name}\" already defined")));
            }
            self.syms[index].val = SymVal::Label { sect, offset };
            self.syms[index].exported |= exported;
            self.syms[index].node = node;
            self.syms[index].line = line;
        } else {
            self.syms.push(Sym {
                name,
                val: SymVal::Label { sect, offset },
                exported,
                builtin: false,
                purged: false,
                referenced: false,
                node,
                line,
            });
        }
        if !name.contains('.') && !name.starts_with('@') {
            self.scope = Some(name);
        }
        Ok(())
    }

    /// The address-space location labels bind to: the LOAD target section
    /// when a load block is open, the active section otherwise.
    fn label_loc(&self) -> Option<(i32, u32)> {
        if let Some(load) = self.load {
            return Some((load.sect as i32, self.sections[load.sect].offset()));
        }
        let cur = self.cur?;
        Some((cur as i32, self.sections[cur].offset()))
    }

    fn find_sym(&self, name: &str) -> Option<usize> {
        self.syms
            .iter()
            .position(|sym| !sym.purged && sym.name == name)
    }

    /// Find the symbol or create a forward reference for it.
    fn find_or_ref(&mut self, name: &'a str) -> usize {
        if let Some(index) = self.find_sym(name) {
            return index;
        }
        let node = self.node();
        let line = self.tok_line;
        self.syms.push(Sym {
            name,
            val: SymVal::Ref,
            exported: false,
            builtin: false,
            purged: false,
            referenced: false,
            node,
            line,
        });
        self.syms.len() - 1
    }

    fn directive(&mut self, tok: Tok) -> io::Result<()> {
        match tok {
            Tok::DB => {
                self.eat();
                loop {
                    if self.peek()? == Tok::STR {
                        let s = self.string.clone();
                        self.eat();
                        let mut bytes = Vec::new();
                        if !self.charmaps[self.charmap].encode(&s, &mut bytes) {
                            self.warn(Warning::Charmap, "character has no charmap mapping");
                        }
                        self.emit(&bytes)?;
                    } else {
                        let expr = self.expr()?;
                        self.emit_byte_expr(expr)?;
                    }
                    if self.peek()? != Tok::COMMA {
                        break;
                    }
                    self.eat();
                }
                self.eol()
            }
            Tok::DW => {
                self.eat();
                loop {
                    let expr = self.expr()?;
                    self.emit_word_expr(expr)?;
                    if self.peek()? != Tok::COMMA {
                        break;
                    }
                    self.eat();
                }
                self.eol()
            }
            Tok::DL => {
                self.eat();
                loop {
                    let expr = self.expr()?;
                    self.emit_long_expr(expr)?;
                    if self.peek()? != Tok::COMMA {
                        break;
                    }
                    self.eat();
                }
                self.eol()
            }
            Tok::DS => {
                self.eat();
                let count = self.const_expr()?;
                if count < 0 {
                    return Err(self.err("negative skip count"));
                }
                let mut fill = Vec::new();
                while self.peek()? == Tok::COMMA {
                    self.eat();
                    let value = self.const_expr()?;
                    self.check_n(value, 8);
                    fill.push((value as u32 & 0xFF) as u8);
                }
                self.skip_bytes(count as u32, &fill)?;
                self.eol()
            }
            Tok::SECTION => {
                self.eat();
                self.parse_section(false)?;
                self.eol()
            }
            Tok::ENDSECTION => {
                self.eat();
                if self.load.is_some() {
                    return Err(self.err("ENDSECTION inside a LOAD block"));
                }
                let Some(cur) = self.cur else {
                    return Err(self.err("ENDSECTION outside of a section"));
                };
                if !self.sections[cur].union_stack.is_empty() {
                    return Err(self.err("ENDSECTION inside a UNION block"));
                }
                self.cur = None;
                self.scope = None;
                self.eol()
            }
            Tok::PUSHS => {
                self.eat();
                self.sect_stack.push((self.cur, self.load));
                self.cur = None;
                self.load = None;
                self.scope = None;
                self.eol()
            }
            Tok::POPS => {
                self.eat();
                let Some((cur, load)) = self.sect_stack.pop() else {
                    return Err(self.err("POPS without a matching PUSHS"));
                };
                self.cur = cur;
                self.load = load;
                self.scope = None;
                self.eol()
            }
            Tok::LOAD => {
                self.eat();
                if self.load.is_some() {
                    return Err(self.err("LOAD blocks cannot be nested"));
                }
                let Some(cur) = self.cur else {
                    return Err(self.err("LOAD outside of a section"));
                };
                if !self.sections[cur].sect.kind.has_data() {
                    return Err(self.err("LOAD must be used inside a ROM section"));
                }
                self.parse_section(true)?;
                self.eol()
            }
            Tok::ENDL => {
                self.eat();
                let Some(load) = self.load.take() else {
                    return Err(self.err("ENDL without a matching LOAD"));
                };
                if !self.sections[load.sect].union_stack.is_empty() {
                    return Err(self.err("ENDL inside a UNION block"));
                }
                self.eol()
            }
            Tok::UNION => {
                self.eat();
                let index = self.union_sect()?;
                let pc = self.sections[index].pc;
                self.sections[index].union_stack.push((pc, pc));
                self.eol()
            }
            Tok::NEXTU => {
                self.eat();
                let index = self.union_sect()?;
                let pc = self.sections[index].pc;
                let Some(top) = self.sections[index].union_stack.last_mut() else {
                    return Err(self.err("NEXTU without a matching UNION"));
                };
                top.1 = top.1.max(pc);
                let start = top.0;
                self.sections[index].pc = start;
                self.eol()
            }
            Tok::ENDU => {
                self.eat();
                let index = self.union_sect()?;
                let Some((start, max)) = self.sections[index].union_stack.pop() else {
                    return Err(self.err("ENDU without a matching UNION"));
                };
                let _ = start;
                let pc = self.sections[index].pc.max(max);
                self.sections[index].pc = pc;
                self.sections[index].sect.size = self.sections[index].sect.size.max(pc);
                self.eol()
            }
            Tok::ALIGN => {
                self.eat();
                let n = self.const_expr()?;
                if !(0..=16).contains(&n) {
                    return Err(self.err("alignment must be between 0 and 16"));
                }
                let mut ofs = 0;
                if self.peek()? == Tok::COMMA {
                    self.eat();
                    ofs = self.const_expr()?;
                    if ofs < 0 || (n < 32 && ofs >= (1 << n)) {
                        return Err(self.err("alignment offset out of range"));
                    }
                }
                self.align_here(n as u8, ofs as u32)?;
                self.eol()
            }
            Tok::INCLUDE => {
                self.eat();
                if self.peek()? != Tok::STR {
                    return Err(self.err("expected file name"));
                }
                let name = self.string.clone();
                self.eat();
                self.eol()?;
                let path = self.find_file(&name)?;
                let text = fs::read_to_string(&path)?;
                self.included.push(path.clone());
                let path = self
                    .str_int
                    .intern(path.to_str().ok_or_else(|| self.err("path is not valid UTF-8"))?);
                let text = self.str_int.intern(&text);
                self.check_depth()?;
                self.push_file(path, text);
                Ok(())
            }
            Tok::INCBIN => {
                self.eat();
                if self.peek()? != Tok::STR {
                    return Err(self.err("expected file name"));
                }
                let name = self.string.clone();
                self.eat();
                let mut start = 0;
                let mut len = None;
                if self.peek()? == Tok::COMMA {
                    self.eat();
                    start = self.const_expr()?;
                    if self.peek()? == Tok::COMMA {
                        self.eat();
                        len = Some(self.const_expr()?);
                    }
                }
                let path = self.find_file(&name)?;
                self.included.push(path.clone());
                let bytes = fs::read(&path)?;
                if start < 0 || (start as usize) > bytes.len() {
                    return Err(self.err("INCBIN start offset is past the end of the file"));
                }
                let bytes = &bytes[start as usize..];
                let bytes = match len {
                    Some(len) if len < 0 || (len as usize) > bytes.len() => {
                        return Err(self.err("INCBIN length is past the end of the file"));
                    }
                    Some(len) => &bytes[..len as usize],
                    None => bytes,
                };
                self.emit(&bytes.to_vec())?;
                self.eol()
            }
            Tok::IF => {
                self.eat();
                let value = self.const_expr()?;
                self.eol()?;
                self.if_branch(value != 0)
            }
            Tok::ELIF => match self.if_stack.last() {
                None => Err(self.err("ELIF outside of an IF block")),
                Some(IfLevel::TakenElse) => Err(self.err("ELIF after ELSE")),
                Some(IfLevel::Taken) => {
                    self.eat();
                    self.skip_to_endc()?;
                    self.if_stack.pop();
                    self.eol()
                }
            },
            Tok::ELSE => match self.if_stack.last() {
                None => Err(self.err("ELSE outside of an IF block")),
                Some(IfLevel::TakenElse) => Err(self.err("ELSE after ELSE")),
                Some(IfLevel::Taken) => {
                    self.eat();
                    self.skip_to_endc()?;
                    self.if_stack.pop();
                    self.eol()
                }
            },
            Tok::ENDC => {
                if self.if_stack.pop().is_none() {
                    return Err(self.err("ENDC outside of an IF block"));
                }
                self.eat();
                self.eol()
            }
            Tok::REPT => {
                self.eat();
                let count = self.const_expr()?;
                if count < 0 {
                    return Err(self.err("negative REPT count"));
                }
                self.eol()?;
                let (body, body_line) = self.capture_body(Capture::Rept)?;
                if count > 0 {
                    self.unique += 1;
                    let unique = self.unique;
                    self.check_depth()?;
                    self.push_body(
                        FrameKind::Rept {
                            count: count as u32,
                            iter: 0,
                            unique,
                            var: None,
                            start: 0,
                            step: 0,
                        },
                        body,
                        body_line,
                    );
                }
                Ok(())
            }
            Tok::FOR => {
                self.eat();
                self.no_expand = true;
                let tok = self.peek();
                self.no_expand = false;
                if tok? != Tok::ID {
                    return Err(self.err("expected loop variable name"));
                }
                let var = self.label_name()?;
                self.eat();
                self.expect(Tok::COMMA)?;
                let first = self.const_expr()?;
                let (start, stop, step) = if self.peek()? == Tok::COMMA {
                    self.eat();
                    let second = self.const_expr()?;
                    if self.peek()? == Tok::COMMA {
                        self.eat();
                        let third = self.const_expr()?;
                        (first, second, third)
                    } else {
                        (first, second, 1)
                    }
                } else {
                    (0, first, 1)
                };
                self.eol()?;
                let (body, body_line) = self.capture_body(Capture::Rept)?;
                if step == 0 {
                    return Err(self.err("FOR step cannot be zero"));
                }
                let count = if step > 0 {
                    ((stop as i64 - start as i64) + step as i64 - 1).div_euclid(step as i64)
                } else {
                    ((start as i64 - stop as i64) + (-step) as i64 - 1).div_euclid((-step) as i64)
                }
                .max(0) as u32;
                self.set_var(var, start)?;
                if count > 0 {
                    self.unique += 1;
                    let unique = self.unique;
                    self.check_depth()?;
                    self.push_body(
                        FrameKind::Rept {
                            count,
                            iter: 0,
                            unique,
                            var: Some(var),
                            start,
                            step,
                        },
                        body,
                        body_line,
                    );
                }
                Ok(())
            }
            Tok::ENDR => Err(self.err("ENDR without a matching REPT or FOR")),
            Tok::BREAK => {
                self.eat();
                self.eol()?;
                match self.frames.last() {
                    Some(frame) if matches!(frame.kind, FrameKind::Rept { .. }) => {
                        let frame = self.frames.pop().unwrap();
                        self.if_stack.truncate(frame.if_depth);
                        Ok(())
                    }
                    _ => Err(self.err("BREAK outside of a REPT or FOR body")),
                }
            }
            Tok::MACRO => {
                self.eat();
                self.no_expand = true;
                let tok = self.peek();
                self.no_expand = false;
                if tok? != Tok::ID {
                    return Err(self.err("expected macro name"));
                }
                if self.string.starts_with('.') {
                    return Err(self.err("macro names cannot be local"));
                }
                let name = self.str_int.intern(&self.string.clone());
                self.eat();
                self.eol()?;
                self.def_macro(name)
            }
            Tok::ENDM => Err(self.err("ENDM without a matching MACRO")),
            Tok::SHIFT => {
                self.eat();
                let amount = match self.peek()? {
                    Tok::NEWLINE | Tok::EOF => 1,
                    _ => self.const_expr()?,
                };
                self.eol()?;
                let mut shifted = false;
                for frame in self.frames.iter_mut().rev() {
                    if let FrameKind::Macro { args, shift, .. } = &mut frame.kind {
                        let target = *shift as i64 + amount as i64;
                        if target < 0 || target > args.len() as i64 {
                            *shift = target.clamp(0, args.len() as i64) as usize;
                            shifted = true;
                            break;
                        }
                        *shift = target as usize;
                        return Ok(());
                    }
                }
                if shifted {
                    self.warn(Warning::Shift, "SHIFT past the end of the argument list");
                    return Ok(());
                }
                Err(self.err("SHIFT outside of a macro"))
            }
            Tok::DEF => {
                self.eat();
                self.no_expand = true;
                let tok = self.peek();
                self.no_expand = false;
                if tok? != Tok::ID {
                    return Err(self.err("expected symbol name"));
                }
                let name = self.label_name()?;
                self.eat();
                let tok = self.peek()?;
                match tok {
                    Tok::EQU | Tok::EQUS | Tok::EQUAL | Tok::RB | Tok::RW => {
                        self.eat();
                        self.def_constant(name, tok, false)?;
                    }
                    Tok::ID if self.str_like("RL") => {
                        self.eat();
                        self.def_constant(name, Tok::RL, false)?;
                    }
                    _ => return Err(self.err("expected EQU, EQUS, =, RB, RW, or RL")),
                }
                self.eol()
            }
            Tok::REDEF => {
                self.eat();
                self.no_expand = true;
                let tok = self.peek();
                self.no_expand = false;
                if tok? != Tok::ID {
                    return Err(self.err("expected symbol name"));
                }
                let name = self.label_name()?;
                self.eat();
                let tok = self.peek()?;
                match tok {
                    Tok::EQUS | Tok::EQUAL => {
                        self.eat();
                        self.def_constant(name, tok, true)?;
                    }
                    Tok::EQU => return Err(self.err("EQU constants cannot be redefined")),
                    _ => return Err(self.err("expected EQUS or =")),
                }
                self.eol()
            }
            Tok::EXPORT => {
                self.eat();
                loop {
                    if self.peek()? != Tok::ID {
                        return Err(self.err("expected symbol name"));
                    }
                    let name = self.label_name()?;
                    self.eat();
                    let index = self.find_or_ref(name);
                    if self.syms[index].builtin {
                        return Err(self.err("built-in symbols cannot be exported"));
                    }
                    self.syms[index].exported = true;
                    if self.peek()? != Tok::COMMA {
                        break;
                    }
                    self.eat();
                }
                self.eol()
            }
            Tok::PURGE => {
                self.eat();
                loop {
                    self.no_expand = true;
                    let tok = self.peek();
                    self.no_expand = false;
                    if tok? != Tok::ID {
                        return Err(self.err("expected symbol name"));
                    }
                    let name = self.label_name()?;
                    self.eat();
                    self.purge(name)?;
                    if self.peek()? != Tok::COMMA {
                        break;
                    }
                    self.eat();
                }
                self.eol()
            }
            Tok::RSRESET => {
                self.eat();
                self.set_rs(0);
                self.eol()
            }
            Tok::RSSET => {
                self.eat();
                let value = self.const_expr()?;
                self.set_rs(value);
                self.eol()
            }
            Tok::CHARMAP => {
                self.eat();
                let key = self.string_arg()?;
                if key.is_empty() {
                    return Err(self.err("charmap entry cannot be empty"));
                }
                self.expect(Tok::COMMA)?;
                let mut bytes = Vec::new();
                loop {
                    let value = self.const_expr()?;
                    self.check_n(value, 8);
                    bytes.push((value as u32 & 0xFF) as u8);
                    if self.peek()? != Tok::COMMA {
                        break;
                    }
                    self.eat();
                }
                self.charmaps[self.charmap].map.insert(key, bytes);
                self.eol()
            }
            Tok::NEWCHARMAP => {
                self.eat();
                if self.peek()? != Tok::ID {
                    return Err(self.err("expected charmap name"));
                }
                let name = self.str_int.intern(&self.string.clone());
                self.eat();
                if self.charmaps.iter().any(|map| map.name == name) {
                    return Err(self.err(&format!("charmap \"{name}\" already exists")));
                }
                let mut map = IndexMap::new();
                if self.peek()? == Tok::COMMA {
                    self.eat();
                    if self.peek()? != Tok::ID {
                        return Err(self.err("expected base charmap name"));
                    }
                    let base = self
                        .charmaps
                        .iter()
                        .find(|map| map.name == self.string)
                        .ok_or_else(|| self.err("base charmap is not defined"))?;
                    map = base.map.clone();
                    self.eat();
                }
                self.charmaps.push(Charmap { name, map });
                self.charmap = self.charmaps.len() - 1;
                self.eol()
            }
            Tok::SETCHARMAP => {
                self.eat();
                if self.peek()? != Tok::ID {
                    return Err(self.err("expected charmap name"));
                }
                let index = self
                    .charmaps
                    .iter()
                    .position(|map| map.name == self.string)
                    .ok_or_else(|| self.err("charmap is not defined"))?;
                self.charmap = index;
                self.eat();
                self.eol()
            }
            Tok::PUSHC => {
                self.eat();
                self.charmap_stack.push(self.charmap);
                self.eol()
            }
            Tok::POPC => {
                self.eat();
                let Some(index) = self.charmap_stack.pop() else {
                    return Err(self.err("POPC without a matching PUSHC"));
                };
                self.charmap = index;
                self.eol()
            }
            Tok::ASSERT | Tok::STATIC_ASSERT => {
                let static_assert = tok == Tok::STATIC_ASSERT;
                self.eat();
                let level = match self.peek()? {
                    Tok::WARN => {
                        self.eat();
                        self.expect(Tok::COMMA)?;
                        AssertLevel::Warn
                    }
                    Tok::FAIL => {
                        self.eat();
                        self.expect(Tok::COMMA)?;
                        AssertLevel::Fatal
                    }
                    Tok::ID if self.str_like("ERROR") => {
                        self.eat();
                        self.expect(Tok::COMMA)?;
                        AssertLevel::Error
                    }
                    _ => AssertLevel::Error,
                };
                let expr = self.expr()?;
                let msg = if self.peek()? == Tok::COMMA {
                    self.eat();
                    self.string_arg()?
                } else {
                    String::from("assertion failed")
                };
                match expr {
                    Expr::Const(value) => {
                        if value == 0 {
                            self.assert_fail(level, &msg)?;
                        }
                    }
                    Expr::Rpn(nodes) => {
                        if static_assert {
                            return Err(self.err("STATIC_ASSERT condition must be constant"));
                        }
                        let node = self.node();
                        let line = self.tok_line;
                        let (pc_sect, pc_offset) = self.label_loc().unwrap_or((-1, 0));
                        let msg = self.str_int.intern(&msg);
                        self.asserts.push(Assertion {
                            node,
                            line,
                            offset: pc_offset,
                            pc_sect,
                            pc_offset,
                            level,
                            expr: nodes,
                            msg,
                        });
                    }
                }
                self.eol()
            }
            Tok::FAIL => {
                self.eat();
                let msg = self.string_arg()?;
                Err(self.err(&msg))
            }
            Tok::WARN => {
                self.eat();
                let msg = self.string_arg()?;
                self.warn(Warning::User, &msg);
                self.eol()
            }
            Tok::OPT => {
                self.eat();
                let items = self.raw_args()?;
                for item in items {
                    self.set_opt(item)?;
                }
                self.eol()
            }
            Tok::PRINTLN => {
                self.eat();
                let mut out = String::new();
                if !matches!(self.peek()?, Tok::NEWLINE | Tok::EOF) {
                    loop {
                        if self.peek()? == Tok::STR {
                            out.push_str(&self.string);
                            self.eat();
                        } else {
                            let value = self.const_expr()?;
                            out.push_str(&format!("${value:X}"));
                        }
                        if self.peek()? != Tok::COMMA {
                            break;
                        }
                        self.eat();
                    }
                }
                println!("{out}");
                self.eol()
            }
            _ => Err(self.err("syntax error")),
        }
    }

    /// Parse `[UNION|FRAGMENT] "name", TYPE[org][, BANK[n]][, ALIGN[n, o]]`
    /// and make the section current (or the LOAD target).
    fn parse_section(&mut self, load: bool) -> io::Result<()> {
        let modif = match self.peek()? {
            Tok::UNION => {
                self.eat();
                SectMod::Union
            }
            Tok::FRAGMENT => {
                self.eat();
                SectMod::Fragment
            }
            _ => SectMod::Normal,
        };
        if self.peek()? != Tok::STR {
            return Err(self.err("expected section name"));
        }
        let name = self.str_int.intern(&self.string.clone());
        self.eat();
        self.expect(Tok::COMMA)?;
        if self.peek()? != Tok::ID {
            return Err(self.err("expected section type"));
        }
        let Some(kind) = SectKind::from_name(&self.string) else {
            return Err(self.err(&format!("unknown section type \"{}\"", self.string)));
        };
        self.eat();
        let window = self.layout.start(kind) as i32;
        let window_len = self.layout.len(kind) as i32;
        let mut org = -1;
        if self.peek()? == Tok::LBRACKET {
            self.eat();
            let value = self.const_expr()?;
            self.expect(Tok::RBRACKET)?;
            if value < window || value >= window + window_len {
                return Err(self.err(&format!(
                    "org ${value:04X} is outside the {} window",
                    kind.name()
                )));
            }
            org = value;
        }
        let mut bank = -1;
        let mut align = 0u8;
        let mut align_ofs = 0u32;
        while self.peek()? == Tok::COMMA {
            self.eat();
            match self.peek()? {
                Tok::BANK => {
                    self.eat();
                    self.expect(Tok::LBRACKET)?;
                    let value = self.const_expr()?;
                    self.expect(Tok::RBRACKET)?;
                    let first = self.layout.first_bank(kind) as i32;
                    let last = self.layout.last_bank(kind) as i32;
                    if value < first || value > last {
                        return Err(self.err(&format!(
                            "bank {value} is outside the {} range {first}..{last}",
                            kind.name()
                        )));
                    }
                    bank = value;
                }
                Tok::ALIGN => {
                    self.eat();
                    self.expect(Tok::LBRACKET)?;
                    let n = self.const_expr()?;
                    if !(0..=16).contains(&n) {
                        return Err(self.err("alignment must be between 0 and 16"));
                    }
                    align = n as u8;
                    if self.peek()? == Tok::COMMA {
                        self.eat();
                        let ofs = self.const_expr()?;
                        if ofs < 0 || (n < 32 && ofs >= (1 << n)) {
                            return Err(self.err("alignment offset out of range"));
                        }
                        align_ofs = ofs as u32;
                    }
                }
                _ => return Err(self.err("expected BANK or ALIGN")),
            }
        }
        if modif == SectMod::Union && kind.has_data() {
            return Err(self.err("UNION sections cannot live in ROM"));
        }
        if !self.layout.banked(kind) {
            bank = self.layout.first_bank(kind) as i32;
        }
        if org >= 0 && align > 0 {
            let mask = (1u32 << align) - 1;
            if (org as u32).wrapping_sub(align_ofs) & mask != 0 {
                return Err(self.err("fixed org conflicts with the requested alignment"));
            }
            // org pins the address; the alignment adds nothing
            align = 0;
            align_ofs = 0;
        }
        let index = if let Some(index) = self.sections.iter().position(|sd| sd.sect.name == name) {
            let sd = &self.sections[index];
            if sd.sect.kind != kind || sd.sect.modif != modif {
                return Err(self.err(&format!(
                    "section \"{name}\" redeclared with different type or modifier"
                )));
            }
            if sd.sect.org != org || sd.sect.bank != bank {
                return Err(self.err(&format!(
                    "section \"{name}\" redeclared with a different org or bank"
                )));
            }
            match modif {
                SectMod::Normal => {
                    return Err(self.err(&format!("section \"{name}\" already defined")));
                }
                // a new union arm starts back at the section top
                SectMod::Union => self.sections[index].pc = 0,
                // fragments keep appending
                SectMod::Fragment => {}
            }
            index
        } else {
            self.sections
                .push(SectData::new(name, kind, modif, org, bank, align, align_ofs));
            self.sections.len() - 1
        };
        if load {
            if kind.has_data() {
                return Err(self.err("LOAD target must be a RAM section"));
            }
            self.load = Some(Load { sect: index });
        } else {
            self.cur = Some(index);
        }
        self.scope = None;
        Ok(())
    }

    /// The section UNION/NEXTU/ENDU blocks apply to: the LOAD target if a
    /// load block is open, the active section otherwise. ROM sections
    /// cannot overlay data.
    fn union_sect(&mut self) -> io::Result<usize> {
        let index = if let Some(load) = self.load {
            load.sect
        } else {
            self.cur
                .ok_or_else(|| self.err("UNION outside of a section"))?
        };
        if self.sections[index].sect.kind.has_data() {
            return Err(self.err("UNION blocks are only allowed in RAM sections"));
        }
        Ok(index)
    }

    fn align_here(&mut self, n: u8, ofs: u32) -> io::Result<()> {
        let index = if let Some(load) = self.load {
            load.sect
        } else {
            self.cur
                .ok_or_else(|| self.err("ALIGN outside of a section"))?
        };
        let mask = (1u32 << n) - 1;
        let offset = self.sections[index].offset();
        let sect = &mut self.sections[index].sect;
        let pad = if sect.org >= 0 {
            (ofs.wrapping_sub(sect.org as u32 + offset)) & mask
        } else if sect.align >= n {
            (ofs.wrapping_sub(sect.align_ofs + offset)) & mask
        } else {
            // grow the floating section's alignment requirement instead
            let new_ofs = ofs.wrapping_sub(offset) & mask;
            if sect.align > 0 && new_ofs & ((1 << sect.align) - 1) != sect.align_ofs {
                return Err(self.err("requested alignment conflicts with the section's"));
            }
            sect.align = n;
            sect.align_ofs = new_ofs;
            0
        };
        if pad > 0 {
            self.skip_bytes(pad, &[])?;
        }
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let Some(cur) = self.cur else {
            return Err(self.err("code or data outside of a section"));
        };
        if !self.sections[cur].sect.kind.has_data() {
            return Err(self.err(&format!(
                "cannot emit data into a {} section",
                self.sections[cur].sect.kind.name()
            )));
        }
        self.sections[cur].sect.data.extend_from_slice(bytes);
        let len = self.sections[cur].sect.data.len() as u32;
        if len > self.layout.len(self.sections[cur].sect.kind) {
            return Err(self.err(&format!(
                "section \"{}\" grew past the {} window",
                self.sections[cur].sect.name,
                self.sections[cur].sect.kind.name()
            )));
        }
        self.sections[cur].sect.size = len;
        if let Some(load) = self.load {
            self.advance(load.sect, bytes.len() as u32)?;
        }
        Ok(())
    }

    fn advance(&mut self, index: usize, amount: u32) -> io::Result<()> {
        let sd = &mut self.sections[index];
        sd.pc += amount;
        if sd.pc > self.layout.len(sd.sect.kind) {
            let name = sd.sect.name;
            let kind_name = sd.sect.kind.name();
            return Err(self.err(&format!(
                "section \"{}\" grew past the {} window",
                name,
                kind_name
            )));
        }
        sd.sect.size = sd.sect.size.max(sd.pc);
        Ok(())
    }

    /// `DS`: fill bytes in ROM sections (and LOAD blocks), bare space in
    /// RAM sections.
    fn skip_bytes(&mut self, count: u32, fill: &[u8]) -> io::Result<()> {
        let rom = self.load.is_some()
            || self
                .cur
                .is_some_and(|cur| self.sections[cur].sect.kind.has_data());
        if rom {
            let mut bytes = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                bytes.push(if fill.is_empty() {
                    self.opt_pad
                } else {
                    fill[i % fill.len()]
                });
            }
            self.emit(&bytes)
        } else {
            if !fill.is_empty() {
                return Err(self.err("fill values are only allowed in ROM sections"));
            }
            let Some(cur) = self.cur else {
                return Err(self.err("DS outside of a section"));
            };
            self.advance(cur, count)
        }
    }

    fn emit_byte_expr(&mut self, expr: Expr<'a>) -> io::Result<()> {
        match expr {
            Expr::Const(value) => {
                self.check_n(value, 8);
                self.emit(&[(value as u32 & 0xFF) as u8])
            }
            Expr::Rpn(nodes) => self.patch(PatchKind::Byte, nodes),
        }
    }

    fn emit_word_expr(&mut self, expr: Expr<'a>) -> io::Result<()> {
        match expr {
            Expr::Const(value) => {
                self.check_n(value, 16);
                self.emit(&(value as u16).to_le_bytes())
            }
            Expr::Rpn(nodes) => self.patch(PatchKind::Word, nodes),
        }
    }

    fn emit_long_expr(&mut self, expr: Expr<'a>) -> io::Result<()> {
        match expr {
            Expr::Const(value) => self.emit(&value.to_le_bytes()),
            Expr::Rpn(nodes) => self.patch(PatchKind::Long, nodes),
        }
    }

    fn patch(&mut self, kind: PatchKind, expr: &'a [ExprNode<'a>]) -> io::Result<()> {
        let node = self.node();
        let line = self.tok_line;
        let (pc_sect, pc_offset) = self
            .label_loc()
            .ok_or_else(|| self.err("relocation outside of a section"))?;
        let Some(cur) = self.cur else {
            return Err(self.err("relocation outside of a section"));
        };
        let offset = self.sections[cur].sect.data.len() as u32;
        self.sections[cur].sect.patches.push(Patch {
            node,
            line,
            offset,
            pc_sect,
            pc_offset,
            kind,
            expr,
        });
        // placeholder bytes, overwritten at link time
        self.emit(&vec![0; kind.width() as usize])
    }

    fn check_n(&mut self, value: i32, bits: u32) {
        if value < -(1 << (bits - 1)) || value >= (1 << bits) {
            self.warn(
                Warning::Truncation,
                &format!("expression does not fit in {bits} bits"),
            );
        }
    }

    fn def_constant(&mut self, name: &'a str, tok: Tok, redef: bool) -> io::Result<()> {
        let node = self.node();
        let line = self.tok_line;
        match tok {
            Tok::EQU => {
                let value = self.const_expr()?;
                self.def_sym(name, SymVal::Equ(value), redef, node, line)
            }
            Tok::EQUAL => {
                let value = self.const_expr()?;
                self.set_var(name, value)
            }
            Tok::EQUS => {
                let text = self.string_arg()?;
                let text = self.str_int.intern(&text);
                self.def_sym(name, SymVal::Equs(text), redef, node, line)
            }
            Tok::RB | Tok::RW | Tok::RL => {
                let count = match self.peek()? {
                    Tok::NEWLINE | Tok::EOF | Tok::COMMA => 1,
                    _ => self.const_expr()?,
                };
                let width = match tok {
                    Tok::RB => 1,
                    Tok::RW => 2,
                    _ => 4,
                };
                let rs = self.get_rs();
                self.def_sym(name, SymVal::Equ(rs), redef, node, line)?;
                self.set_rs(rs.wrapping_add(count.wrapping_mul(width)));
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn def_sym(
        &mut self,
        name: &'a str,
        val: SymVal<'a>,
        redef: bool,
        node: u32,
        line: u32,
    ) -> io::Result<()> {
        if let Some(index) = self.find_sym(name) {
            if self.syms[index].builtin {
                return Err(self.err("built-in symbol cannot be redefined"));
            }
            let replaceable = match (self.syms[index].val, &val) {
                (SymVal::Ref, _) => true,
                (SymVal::Equs(_), SymVal::Equs(_)) => redef,
                _ => false,
            };
            if !replaceable {
                return Err(self.err(&format!("symbol \"{name}\" already defined")));
            }
            self.syms[index].val = val;
            self.syms[index].node = node;
            self.syms[index].line = line;
        } else {
            self.syms.push(Sym {
                name,
                val,
                exported: false,
                builtin: false,
                purged: false,
                referenced: false,
                node,
                line,
            });
        }
        Ok(())
    }

    fn set_var(&mut self, name: &'a str, value: i32) -> io::Result<()> {
        if let Some(index) = self.find_sym(name) {
            match self.syms[index].val {
                SymVal::Var(_) => {
                    self.syms[index].val = SymVal::Var(value);
                    Ok(())
                }
                SymVal::Ref => {
                    self.syms[index].val = SymVal::Var(value);
                    Ok(())
                }
                _ => Err(self.err(&format!("symbol \"{name}\" already defined"))),
            }
        } else {
            let node = self.node();
            let line = self.tok_line;
            self.syms.push(Sym {
                name,
                val: SymVal::Var(value),
                exported: false,
                builtin: false,
                purged: false,
                referenced: false,
                node,
                line,
            });
            Ok(())
        }
    }

    fn get_rs(&self) -> i32 {
        match self.syms[self.find_sym("_RS").unwrap()].val {
            SymVal::Var(value) => value,
            _ => unreachable!(),
        }
    }

    fn set_rs(&mut self, value: i32) {
        let index = self.find_sym("_RS").unwrap();
        self.syms[index].val = SymVal::Var(value);
    }

    fn purge(&mut self, name: &'a str) -> io::Result<()> {
        let Some(index) = self.find_sym(name) else {
            return Err(self.err(&format!("cannot purge undefined symbol \"{name}\"")));
        };
        if self.syms[index].builtin {
            return Err(self.err("built-in symbols cannot be purged"));
        }
        if self.syms[index].referenced {
            return Err(self.err(&format!(
                "cannot purge symbol \"{name}\": it is referenced by an unresolved patch"
            )));
        }
        if matches!(self.syms[index].val, SymVal::Mac { .. }) {
            for frame in &self.frames {
                if let FrameKind::Macro { name: active, .. } = frame.kind
                    && active == name
                {
                    return Err(self.err(&format!(
                        "cannot purge macro \"{name}\" while it is expanding"
                    )));
                }
            }
        }
        self.syms[index].purged = true;
        Ok(())
    }

    fn def_macro(&mut self, name: &'a str) -> io::Result<()> {
        let node = self.node();
        let line = self.tok_line;
        let (body, body_line) = self.capture_body(Capture::Macro)?;
        self.def_sym(name, SymVal::Mac { body, body_line }, false, node, line)
    }

    fn invoke_macro(&mut self, index: usize) -> io::Result<()> {
        let SymVal::Mac { body, body_line } = self.syms[index].val else {
            unreachable!()
        };
        let name = self.syms[index].name;
        self.eat();
        let args = self.raw_args()?;
        self.unique += 1;
        let unique = self.unique;
        self.check_depth()?;
        self.push_body(
            FrameKind::Macro {
                name,
                args,
                shift: 0,
                unique,
            },
            body,
            body_line,
        );
        Ok(())
    }

    fn if_branch(&mut self, taken: bool) -> io::Result<()> {
        if taken {
            self.if_stack.push(IfLevel::Taken);
            return Ok(());
        }
        loop {
            match self.skip_conditional(false)? {
                SkipStop::Elif => {
                    let value = self.const_expr()?;
                    self.eol()?;
                    if value != 0 {
                        self.if_stack.push(IfLevel::Taken);
                        return Ok(());
                    }
                }
                SkipStop::Else => {
                    self.eol()?;
                    self.if_stack.push(IfLevel::TakenElse);
                    return Ok(());
                }
                SkipStop::Endc => {
                    return self.eol();
                }
            }
        }
    }

    fn skip_to_endc(&mut self) -> io::Result<()> {
        // discard the rest of the current line first
        self.sync_line();
        match self.skip_conditional(true)? {
            SkipStop::Endc => Ok(()),
            _ => unreachable!(),
        }
    }

    fn assert_fail(&mut self, level: AssertLevel, msg: &str) -> io::Result<()> {
        match level {
            AssertLevel::Warn => {
                self.warn(Warning::Assert, msg);
                Ok(())
            }
            AssertLevel::Error => Err(self.err(msg)),
            AssertLevel::Fatal => Err(self.fatal(msg)),
        }
    }

    fn set_opt(&mut self, item: &str) -> io::Result<()> {
        let item = item.trim();
        if item == "l" {
            self.opt_ldh = true;
        } else if item == "!l" {
            self.opt_ldh = false;
        } else if let Some(rest) = item.strip_prefix('p') {
            let value = parse_num(rest).ok_or_else(|| self.err("bad pad value"))?;
            self.opt_pad = (value as u32 & 0xFF) as u8;
        } else if let Some(rest) = item.strip_prefix('Q') {
            let value = parse_num(rest).ok_or_else(|| self.err("bad fixed-point precision"))?;
            if !(1..=31).contains(&value) {
                self.warn(
                    Warning::BuiltinArg,
                    "fixed-point precision must be between 1 and 31",
                );
            } else {
                self.opt_q = value as u8;
            }
        } else if let Some(rest) = item.strip_prefix('W') {
            if let Err(msg) = self.warnings.set(rest) {
                return Err(self.err(&msg));
            }
        } else {
            return Err(self.err(&format!("unknown option \"{item}\"")));
        }
        Ok(())
    }

    fn find_file(&self, name: &str) -> io::Result<PathBuf> {
        let explicit_rel = name.starts_with("./") || name.starts_with("../");
        let base = self
            .frames
            .iter()
            .rev()
            .find_map(|frame| match frame.kind {
                FrameKind::File { path } => Path::new(path).parent().map(Path::to_path_buf),
                _ => None,
            })
            .unwrap_or_default();
        let mut candidates = vec![base.join(name)];
        if !explicit_rel {
            for include in &self.includes {
                candidates.push(include.join(name));
            }
        }
        for candidate in candidates {
            if let Ok(path) = fs::canonicalize(&candidate)
                && path.is_file()
            {
                return Ok(path);
            }
        }
        Err(io::Error::new(
            ErrorKind::NotFound,
            self.trace(&format!("file not found: {name}")),
        ))
    }

    fn check_depth(&self) -> io::Result<()> {
        if self.frames.len() + 1 > self.depth {
            return Err(self.fatal(&format!("recursion limit ({}) exceeded", self.depth)));
        }
        Ok(())
    }

    fn push_body(&mut self, kind: FrameKind<'a>, body: &'a str, body_line: u32) {
        let parent_line = self.frames.last().map(|frame| frame.line).unwrap_or(0);
        self.frames.push(Frame {
            kind,
            src: body,
            offset: 0,
            line: body_line,
            body_line,
            parent_line,
            if_depth: self.if_stack.len(),
            node: -1,
            node_iter: 0,
        });
    }

    /// Get (or lazily create) the file-stack node describing the current
    /// frame chain, for symbols, patches, and assertions.
    fn node(&mut self) -> u32 {
        let mut parent = -1;
        let mut iters = Vec::new();
        for i in 0..self.frames.len() {
            let parent_line = self.frames[i].parent_line;
            let info = match &self.frames[i].kind {
                FrameKind::File { path } => {
                    if self.frames[i].node < 0 {
                        Some(NodeInfo::File(path))
                    } else {
                        None
                    }
                }
                FrameKind::Macro { name, .. } => {
                    if self.frames[i].node < 0 {
                        Some(NodeInfo::Macro(name))
                    } else {
                        None
                    }
                }
                FrameKind::Rept { iter, .. } => {
                    iters.push(*iter);
                    if self.frames[i].node < 0 || self.frames[i].node_iter != *iter {
                        Some(NodeInfo::Rept(iters.clone()))
                    } else {
                        None
                    }
                }
            };
            if let Some(info) = info {
                self.nodes.push(Node {
                    parent,
                    parent_line,
                    info,
                });
                self.frames[i].node = (self.nodes.len() - 1) as i32;
                if let FrameKind::Rept { iter, .. } = self.frames[i].kind {
                    self.frames[i].node_iter = iter;
                }
            }
            parent = self.frames[i].node;
        }
        parent.max(0) as u32
    }

    fn err(&self, msg: &str) -> io::Error {
        io::Error::new(ErrorKind::InvalidData, self.trace(msg))
    }

    fn fatal(&self, msg: &str) -> io::Error {
        io::Error::other(self.trace(msg))
    }

    /// Diagnostics carry the whole context stack: `outer(line) -> inner(line)`.
    fn trace(&self, msg: &str) -> String {
        let mut out = String::new();
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                out.push_str(" -> ");
            }
            let line = match self.frames.get(i + 1) {
                Some(inner) => inner.parent_line,
                None => self.tok_line,
            };
            match &frame.kind {
                FrameKind::File { path } => out.push_str(path),
                FrameKind::Macro { name, .. } => out.push_str(name),
                FrameKind::Rept { iter, .. } => {
                    out.push_str(&format!("REPT~{}", iter + 1));
                }
            }
            out.push_str(&format!("({line})"));
        }
        if self.frames.is_empty() {
            out.push_str("<command line>");
        }
        out.push_str(": ");
        out.push_str(msg);
        out
    }

    fn warn(&mut self, warning: Warning, msg: &str) {
        match self.warnings.state(warning) {
            WarnState::Allow => {}
            WarnState::Warn => {
                tracing::warn!("{} [-W{}]", self.trace(msg), warning.name());
            }
            WarnState::Error => {
                tracing::error!("{} [-Werror={}]", self.trace(msg), warning.name());
                self.errors += 1;
            }
        }
    }

    fn str_like(&self, string: &str) -> bool {
        self.string.eq_ignore_ascii_case(string)
    }

    fn expect(&mut self, tok: Tok) -> io::Result<()> {
        if self.peek()? != tok {
            return Err(self.err("unexpected token"));
        }
        self.eat();
        Ok(())
    }

    fn eol(&mut self) -> io::Result<()> {
        match self.peek()? {
            Tok::NEWLINE => {
                self.eat();
                Ok(())
            }
            Tok::EOF => Ok(()),
            _ => Err(self.err("expected end of line")),
        }
    }

    fn const_expr(&mut self) -> io::Result<i32> {
        match self.expr()? {
            Expr::Const(value) => Ok(value),
            Expr::Rpn(_) => Err(self.err("expression must be constant")),
        }
    }

    /// Shunting-yard into an RPN node list, folding to a constant when
    /// every leaf is known. Anything else is interned and becomes patch
    /// material for the linker.
    fn expr(&mut self) -> io::Result<Expr<'a>> {
        let mut out: Vec<ExprNode<'a>> = Vec::new();
        let mut ops: Vec<Op> = Vec::new();
        let mut seen_val = false;
        let mut paren = 0u32;
        loop {
            match self.peek()? {
                // optionally unary
                tok @ (Tok::PLUS | Tok::MINUS) => {
                    if seen_val {
                        self.push_op(&mut ops, &mut out, Op::Binary(tok));
                    } else {
                        ops.push(Op::Unary(tok));
                    }
                    seen_val = false;
                    self.eat();
                }
                // always unary
                tok @ (Tok::BANG | Tok::TILDE) => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    ops.push(Op::Unary(tok));
                    self.eat();
                }
                #[rustfmt::skip]
                tok @ (Tok::STAR | Tok::SOLIDUS | Tok::MODULUS | Tok::EXP | Tok::AMP | Tok::PIPE
                    | Tok::CARET | Tok::SHL | Tok::SHR | Tok::USHR | Tok::LAND | Tok::LOR
                    | Tok::DEQ | Tok::NEQ | Tok::LT | Tok::GT | Tok::LTE | Tok::GTE) => {
                    if !seen_val {
                        return Err(self.err("expected value"));
                    }
                    self.push_op(&mut ops, &mut out, Op::Binary(tok));
                    seen_val = false;
                    self.eat();
                }
                Tok::NUM => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    out.push(ExprNode::Const(self.number));
                    seen_val = true;
                    self.eat();
                }
                Tok::STR => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    let s = self.string.clone();
                    self.eat();
                    let value = self.str_to_num(&s);
                    out.push(ExprNode::Const(value));
                    seen_val = true;
                }
                Tok::LPAREN => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    paren += 1;
                    ops.push(Op::Paren);
                    self.eat();
                }
                Tok::RPAREN => {
                    if paren == 0 {
                        break;
                    }
                    if !seen_val {
                        return Err(self.err("expected value"));
                    }
                    paren -= 1;
                    loop {
                        match ops.pop() {
                            Some(Op::Paren) => break,
                            Some(op) => self.apply_op(&mut out, op),
                            None => return Err(self.err("unbalanced parentheses")),
                        }
                    }
                    self.eat();
                }
                Tok::ID => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    self.expr_ident(&mut out)?;
                    seen_val = true;
                }
                Tok::ANON => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    let name = self.anon_ref(self.number)?;
                    self.eat();
                    let index = self.find_or_ref(name);
                    out.push(ExprNode::Sym(index as u32));
                    seen_val = true;
                }
                tok @ (Tok::HIGH | Tok::LOW) => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    self.eat();
                    self.expect(Tok::LPAREN)?;
                    let inner = self.expr()?;
                    self.expect(Tok::RPAREN)?;
                    match inner {
                        Expr::Const(value) => {
                            let value = if tok == Tok::HIGH {
                                ((value as u32 >> 8) & 0xFF) as i32
                            } else {
                                (value as u32 & 0xFF) as i32
                            };
                            out.push(ExprNode::Const(value));
                        }
                        Expr::Rpn(nodes) => {
                            out.extend_from_slice(nodes);
                            if tok == Tok::HIGH {
                                out.push(ExprNode::Const(8));
                                out.push(ExprNode::Op(RpnOp::SHR));
                            }
                            out.push(ExprNode::Const(0xFF));
                            out.push(ExprNode::Op(RpnOp::AND));
                        }
                    }
                    seen_val = true;
                }
                Tok::ISCONST => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    self.eat();
                    self.expect(Tok::LPAREN)?;
                    let inner = self.expr()?;
                    self.expect(Tok::RPAREN)?;
                    let value = matches!(inner, Expr::Const(_)) as i32;
                    out.push(ExprNode::Const(value));
                    seen_val = true;
                }
                Tok::DEF => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    self.eat();
                    self.expect(Tok::LPAREN)?;
                    self.no_expand = true;
                    let tok = self.peek();
                    self.no_expand = false;
                    if tok? != Tok::ID {
                        return Err(self.err("expected symbol name"));
                    }
                    let name = self.label_name()?;
                    self.eat();
                    self.expect(Tok::RPAREN)?;
                    let defined = self
                        .find_sym(name)
                        .is_some_and(|index| self.syms[index].val != SymVal::Ref);
                    out.push(ExprNode::Const(defined as i32));
                    seen_val = true;
                }
                Tok::BANK => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    self.eat();
                    self.expect(Tok::LPAREN)?;
                    self.expr_bank(&mut out)?;
                    self.expect(Tok::RPAREN)?;
                    seen_val = true;
                }
                tok @ (Tok::SIZEOF | Tok::STARTOF) => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    self.eat();
                    self.expect(Tok::LPAREN)?;
                    if self.peek()? != Tok::STR {
                        return Err(self.err("expected section name"));
                    }
                    let name = self.str_int.intern(&self.string.clone());
                    self.eat();
                    self.expect(Tok::RPAREN)?;
                    out.push(if tok == Tok::SIZEOF {
                        ExprNode::Sizeof(name)
                    } else {
                        ExprNode::Startof(name)
                    });
                    seen_val = true;
                }
                tok @ (Tok::STRLEN | Tok::STRCMP | Tok::STRIN | Tok::CHARLEN) => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    let value = self.string_num_fn(tok)?;
                    out.push(ExprNode::Const(value));
                    seen_val = true;
                }
                tok @ (Tok::STRCAT | Tok::STRSUB | Tok::STRUPR | Tok::STRLWR | Tok::STRRPL
                | Tok::CHARSUB) => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    let s = self.string_fn(tok)?;
                    let value = self.str_to_num(&s);
                    out.push(ExprNode::Const(value));
                    seen_val = true;
                }
                #[rustfmt::skip]
                tok @ (Tok::FMUL | Tok::FDIV | Tok::FMOD | Tok::POW | Tok::LOG | Tok::SIN
                    | Tok::COS | Tok::TAN | Tok::ASIN | Tok::ACOS | Tok::ATAN | Tok::ATAN2
                    | Tok::ROUND | Tok::CEIL | Tok::FLOOR) => {
                    if seen_val {
                        return Err(self.err("expected operator"));
                    }
                    let value = self.fixed_fn(tok)?;
                    out.push(ExprNode::Const(value));
                    seen_val = true;
                }
                _ => {
                    if !seen_val {
                        return Err(self.err("expected value"));
                    }
                    if paren != 0 {
                        return Err(self.err("unbalanced parentheses"));
                    }
                    break;
                }
            }
        }
        while let Some(op) = ops.pop() {
            if op == Op::Paren {
                return Err(self.err("unbalanced parentheses"));
            }
            self.apply_op(&mut out, op);
        }
        self.finish_expr(out)
    }

    fn expr_ident(&mut self, out: &mut Vec<ExprNode<'a>>) -> io::Result<()> {
        // dynamic builtins first
        if self.string == "@" {
            self.eat();
            let index = self.pc_sym()?;
            out.push(ExprNode::Sym(index as u32));
            return Ok(());
        }
        if self.string == "_NARG" {
            self.eat();
            let value = self.narg()?;
            out.push(ExprNode::Const(value));
            return Ok(());
        }
        if self.string == "__LINE__" {
            self.eat();
            out.push(ExprNode::Const(self.tok_line as i32));
            return Ok(());
        }
        let name = self.label_name()?;
        self.eat();
        match self.find_sym(name).map(|index| (index, self.syms[index].val)) {
            Some((_, SymVal::Equ(value) | SymVal::Var(value))) => {
                out.push(ExprNode::Const(value));
            }
            Some((index, SymVal::Label { .. } | SymVal::Ref)) => {
                out.push(ExprNode::Sym(index as u32));
            }
            Some((_, SymVal::Equs(_))) => {
                return Err(self.err(&format!("string symbol \"{name}\" used in an expression")));
            }
            Some((_, SymVal::Mac { .. })) => {
                return Err(self.err(&format!("macro \"{name}\" used in an expression")));
            }
            None => {
                let index = self.find_or_ref(name);
                out.push(ExprNode::Sym(index as u32));
            }
        }
        Ok(())
    }

    fn expr_bank(&mut self, out: &mut Vec<ExprNode<'a>>) -> io::Result<()> {
        match self.peek()? {
            Tok::STR => {
                let name = self.str_int.intern(&self.string.clone());
                self.eat();
                out.push(ExprNode::BankSect(name));
            }
            Tok::ID if self.string == "@" => {
                self.eat();
                out.push(ExprNode::BankSelf);
            }
            Tok::ID => {
                let name = self.label_name()?;
                self.eat();
                let index = self.find_or_ref(name);
                match self.syms[index].val {
                    SymVal::Label { .. } | SymVal::Ref => {
                        out.push(ExprNode::BankSym(index as u32));
                    }
                    _ => return Err(self.err("BANK argument must be a label")),
                }
            }
            _ => return Err(self.err("expected a label, section name, or @")),
        }
        Ok(())
    }

    fn narg(&mut self) -> io::Result<i32> {
        for frame in self.frames.iter().rev() {
            if let FrameKind::Macro { args, shift, .. } = &frame.kind {
                return Ok((args.len() - shift) as i32);
            }
        }
        Err(self.err("_NARG used outside of a macro"))
    }

    /// `@` in an expression pins the current location as a hidden local
    /// label so it can ride through the object file as a plain symbol
    /// reference. The `@` prefix keeps it out of the sym and map outputs.
    fn pc_sym(&mut self) -> io::Result<usize> {
        let Some((sect, offset)) = self.label_loc() else {
            return Err(self.err("PC used outside of a section"));
        };
        let name = self.str_int.intern(&format!("@@{}", self.syms.len()));
        let node = self.node();
        let line = self.tok_line;
        self.syms.push(Sym {
            name,
            val: SymVal::Label { sect, offset },
            exported: false,
            builtin: false,
            purged: false,
            referenced: false,
            node,
            line,
        });
        Ok(self.syms.len() - 1)
    }

    fn anon_ref(&mut self, rel: i32) -> io::Result<&'a str> {
        let index = if rel > 0 {
            self.anon as i64 + rel as i64 - 1
        } else {
            self.anon as i64 + rel as i64
        };
        if index < 0 {
            return Err(self.err("anonymous label reference before the first one"));
        }
        Ok(self.str_int.intern(&format!("@{index}")))
    }

    fn push_op(&mut self, ops: &mut Vec<Op>, out: &mut Vec<ExprNode<'a>>, op: Op) {
        let right_assoc = op == Op::Binary(Tok::EXP);
        while let Some(&top) = ops.last() {
            if top == Op::Paren {
                break;
            }
            let tp = prec(top);
            let cp = prec(op);
            if tp < cp || (tp == cp && !right_assoc) {
                ops.pop();
                self.apply_op(out, top);
            } else {
                break;
            }
        }
        ops.push(op);
    }

    fn apply_op(&mut self, out: &mut Vec<ExprNode<'a>>, op: Op) {
        match op {
            Op::Unary(Tok::PLUS) => {}
            Op::Unary(Tok::MINUS) => out.push(ExprNode::Op(RpnOp::NEG)),
            Op::Unary(Tok::TILDE) => out.push(ExprNode::Op(RpnOp::NOT)),
            Op::Unary(Tok::BANG) => out.push(ExprNode::Op(RpnOp::LOGNOT)),
            Op::Binary(tok) => out.push(ExprNode::Op(rpn_binop(tok))),
            _ => unreachable!(),
        }
    }

    fn finish_expr(&mut self, nodes: Vec<ExprNode<'a>>) -> io::Result<Expr<'a>> {
        if nodes.is_empty() {
            return Err(self.err("expected expression"));
        }
        if let Some(value) = self.expr_eval(&nodes) {
            return Ok(Expr::Const(value));
        }
        for node in &nodes {
            if let ExprNode::Sym(index) | ExprNode::BankSym(index) = node {
                self.syms[*index as usize].referenced = true;
            }
        }
        Ok(Expr::Rpn(self.expr_int.intern(&nodes)))
    }

    /// Evaluate an RPN stream now if every leaf is known. Constant folding
    /// must not change the observable value, so anything link-dependent
    /// returns None.
    fn expr_eval(&mut self, nodes: &[ExprNode<'a>]) -> Option<i32> {
        let mut scratch: Vec<i32> = Vec::new();
        for node in nodes {
            match *node {
                ExprNode::Const(value) => scratch.push(value),
                ExprNode::Sym(index) => match self.syms[index as usize].val {
                    SymVal::Equ(value) | SymVal::Var(value) => scratch.push(value),
                    SymVal::Label { sect, offset } => {
                        let org = self.sections[sect as usize].sect.org;
                        if org < 0 {
                            return None;
                        }
                        scratch.push(org.wrapping_add(offset as i32));
                    }
                    _ => return None,
                },
                ExprNode::BankSym(index) => match self.syms[index as usize].val {
                    SymVal::Label { sect, .. } => {
                        let bank = self.sections[sect as usize].sect.bank;
                        if bank < 0 {
                            return None;
                        }
                        scratch.push(bank);
                    }
                    _ => return None,
                },
                ExprNode::BankSect(name) => {
                    let sd = self.sections.iter().find(|sd| sd.sect.name == name)?;
                    if sd.sect.bank < 0 {
                        return None;
                    }
                    scratch.push(sd.sect.bank);
                }
                ExprNode::BankSelf => {
                    let (sect, _) = self.label_loc()?;
                    let bank = self.sections[sect as usize].sect.bank;
                    if bank < 0 {
                        return None;
                    }
                    scratch.push(bank);
                }
                ExprNode::Sizeof(_) | ExprNode::Startof(_) => return None,
                ExprNode::Op(op) => {
                    let rhs = scratch.pop()?;
                    match op {
                        RpnOp::NEG => scratch.push(rhs.wrapping_neg()),
                        RpnOp::NOT => scratch.push(!rhs),
                        RpnOp::LOGNOT => scratch.push((rhs == 0) as i32),
                        op => {
                            let lhs = scratch.pop()?;
                            let value = match op {
                                RpnOp::ADD => lhs.wrapping_add(rhs),
                                RpnOp::SUB => lhs.wrapping_sub(rhs),
                                RpnOp::MUL => lhs.wrapping_mul(rhs),
                                RpnOp::DIV => {
                                    if rhs == 0 {
                                        self.div_zero();
                                        0
                                    } else {
                                        lhs.wrapping_div(rhs)
                                    }
                                }
                                RpnOp::MOD => {
                                    if rhs == 0 {
                                        self.div_zero();
                                        0
                                    } else {
                                        lhs.wrapping_rem(rhs)
                                    }
                                }
                                RpnOp::EXP => {
                                    if rhs < 0 {
                                        self.warn(
                                            Warning::BuiltinArg,
                                            "exponent cannot be negative",
                                        );
                                        0
                                    } else {
                                        lhs.wrapping_pow(rhs as u32)
                                    }
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
                                _ => return None,
                            };
                            scratch.push(value);
                        }
                    }
                }
            }
        }
        scratch.pop()
    }

    fn div_zero(&mut self) {
        tracing::error!("{}", self.trace("division by zero"));
        self.errors += 1;
    }

    /// Strings in numeric contexts encode through the active charmap into
    /// a big-endian value.
    fn str_to_num(&mut self, s: &str) -> i32 {
        let mut bytes = Vec::new();
        self.charmaps[self.charmap].encode(s, &mut bytes);
        if bytes.len() != 1 {
            self.warn(Warning::NumericString, "multi-character string as a number");
        }
        if bytes.len() > 4 {
            self.warn(
                Warning::LongString,
                "string is longer than 4 bytes; only the last 4 are kept",
            );
            bytes.drain(..bytes.len() - 4);
        }
        bytes.iter().fold(0i32, |v, b| (v << 8) | *b as i32)
    }

    fn string_num_fn(&mut self, tok: Tok) -> io::Result<i32> {
        self.eat();
        self.expect(Tok::LPAREN)?;
        let value = match tok {
            Tok::STRLEN => {
                let s = self.string_arg()?;
                s.chars().count() as i32
            }
            Tok::STRCMP => {
                let a = self.string_arg()?;
                self.expect(Tok::COMMA)?;
                let b = self.string_arg()?;
                match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }
            }
            Tok::STRIN => {
                let big = self.string_arg()?;
                self.expect(Tok::COMMA)?;
                let little = self.string_arg()?;
                match big.find(&little) {
                    Some(pos) => big[..pos].chars().count() as i32 + 1,
                    None => 0,
                }
            }
            Tok::CHARLEN => {
                let s = self.string_arg()?;
                self.charmaps[self.charmap].units(&s).len() as i32
            }
            _ => unreachable!(),
        };
        self.expect(Tok::RPAREN)?;
        Ok(value)
    }

    fn string_arg(&mut self) -> io::Result<String> {
        match self.peek()? {
            Tok::STR => {
                let s = self.string.clone();
                self.eat();
                Ok(s)
            }
            tok @ (Tok::STRCAT | Tok::STRSUB | Tok::STRUPR | Tok::STRLWR | Tok::STRRPL
            | Tok::CHARSUB) => self.string_fn(tok),
            _ => Err(self.err("expected a string")),
        }
    }

    fn string_fn(&mut self, tok: Tok) -> io::Result<String> {
        self.eat();
        self.expect(Tok::LPAREN)?;
        let result = match tok {
            Tok::STRCAT => {
                let mut out = String::new();
                if self.peek()? != Tok::RPAREN {
                    loop {
                        out.push_str(&self.string_arg()?);
                        if self.peek()? != Tok::COMMA {
                            break;
                        }
                        self.eat();
                    }
                }
                out
            }
            Tok::STRSUB => {
                let s = self.string_arg()?;
                self.expect(Tok::COMMA)?;
                let pos = self.const_expr()?;
                let chars: Vec<char> = s.chars().collect();
                let len = if self.peek()? == Tok::COMMA {
                    self.eat();
                    self.const_expr()?
                } else {
                    chars.len() as i32
                };
                if pos < 1 {
                    return Err(self.err("string positions are 1-based"));
                }
                // a zero-length slice just past the end is fine; asking for
                // characters there is not
                if len > 0 && pos as usize > chars.len() + 1 {
                    self.warn(Warning::BuiltinArg, "STRSUB position is past the end");
                }
                let start = (pos as usize - 1).min(chars.len());
                let end = (start + len.max(0) as usize).min(chars.len());
                chars[start..end].iter().collect()
            }
            Tok::STRUPR => {
                let s = self.string_arg()?;
                s.to_uppercase()
            }
            Tok::STRLWR => {
                let s = self.string_arg()?;
                s.to_lowercase()
            }
            Tok::STRRPL => {
                let s = self.string_arg()?;
                self.expect(Tok::COMMA)?;
                let old = self.string_arg()?;
                self.expect(Tok::COMMA)?;
                let new = self.string_arg()?;
                if old.is_empty() {
                    self.warn(Warning::EmptyStrrpl, "STRRPL needle is empty");
                    s
                } else {
                    s.replace(&old, &new)
                }
            }
            Tok::CHARSUB => {
                let s = self.string_arg()?;
                self.expect(Tok::COMMA)?;
                let pos = self.const_expr()?;
                let units = self.charmaps[self.charmap].units(&s);
                if pos < 1 || pos as usize > units.len() {
                    self.warn(Warning::BuiltinArg, "CHARSUB position is out of range");
                    String::new()
                } else {
                    let start: usize = units[..pos as usize - 1].iter().sum();
                    s[start..start + units[pos as usize - 1]].to_string()
                }
            }
            _ => unreachable!(),
        };
        self.expect(Tok::RPAREN)?;
        Ok(result)
    }

    /// Fixed-point intrinsics. Values are Q(32-q).(q); angles are turns
    /// (a full circle is 1.0). An optional trailing argument overrides the
    /// `Q` precision.
    fn fixed_fn(&mut self, tok: Tok) -> io::Result<i32> {
        let two_args = matches!(
            tok,
            Tok::FMUL | Tok::FDIV | Tok::FMOD | Tok::POW | Tok::LOG | Tok::ATAN2
        );
        self.eat();
        self.expect(Tok::LPAREN)?;
        let a = self.const_expr()?;
        let b = if two_args {
            self.expect(Tok::COMMA)?;
            self.const_expr()?
        } else {
            0
        };
        let mut q = self.opt_q;
        if self.peek()? == Tok::COMMA {
            self.eat();
            let value = self.const_expr()?;
            if !(1..=31).contains(&value) {
                self.warn(
                    Warning::BuiltinArg,
                    "fixed-point precision must be between 1 and 31",
                );
            } else {
                q = value as u8;
            }
        }
        self.expect(Tok::RPAREN)?;
        let one = 1i64 << q;
        let to_f = |v: i32| v as f64 / one as f64;
        let from_f = |x: f64| ((x * one as f64).round() as i64) as i32;
        let value = match tok {
            Tok::FMUL => ((a as i64 * b as i64) >> q) as i32,
            Tok::FDIV => {
                if b == 0 {
                    self.div_zero();
                    0
                } else {
                    (((a as i64) << q) / b as i64) as i32
                }
            }
            Tok::FMOD => {
                if b == 0 {
                    self.div_zero();
                    0
                } else {
                    (a as i64 % b as i64) as i32
                }
            }
            Tok::POW => self.fixed_pow(a, b, q),
            Tok::LOG => {
                if a <= 0 || b <= 0 {
                    self.warn(Warning::BuiltinArg, "LOG arguments must be positive");
                    0
                } else {
                    from_f(to_f(a).ln() / to_f(b).ln())
                }
            }
            Tok::SIN => from_f((to_f(a) * std::f64::consts::TAU).sin()),
            Tok::COS => from_f((to_f(a) * std::f64::consts::TAU).cos()),
            Tok::TAN => from_f((to_f(a) * std::f64::consts::TAU).tan()),
            Tok::ASIN => from_f(to_f(a).asin() / std::f64::consts::TAU),
            Tok::ACOS => from_f(to_f(a).acos() / std::f64::consts::TAU),
            Tok::ATAN => from_f(to_f(a).atan() / std::f64::consts::TAU),
            Tok::ATAN2 => from_f(to_f(a).atan2(to_f(b)) / std::f64::consts::TAU),
            Tok::ROUND => {
                let half = 1i64 << (q - 1);
                (((a as i64 + half) >> q) << q) as i32
            }
            Tok::CEIL => ((((a as i64) + (one - 1)) >> q << q) as i64) as i32,
            Tok::FLOOR => (((a as i64) >> q) << q) as i32,
            _ => unreachable!(),
        };
        Ok(value)
    }

    /// Integer exponents use exact repeated squaring on Q values;
    /// fractional exponents fall back to floats.
    fn fixed_pow(&mut self, a: i32, b: i32, q: u8) -> i32 {
        let one = 1i64 << q;
        if b as i64 % one == 0 {
            let mut n = (b as i64 >> q).unsigned_abs();
            let mut base = if (b as i64) < 0 {
                if a == 0 {
                    self.div_zero();
                    return 0;
                }
                ((one << q) / a as i64) as i32
            } else {
                a
            };
            let mut result = one as i32;
            while n > 0 {
                if n & 1 != 0 {
                    result = ((result as i64 * base as i64) >> q) as i32;
                }
                base = ((base as i64 * base as i64) >> q) as i32;
                n >>= 1;
            }
            result
        } else {
            let to_f = |v: i32| v as f64 / one as f64;
            ((to_f(a).powf(to_f(b)) * one as f64).round() as i64) as i32
        }
    }

    fn instruction(&mut self, mne: Mne) -> io::Result<()> {
        match mne {
            Mne::Nop => self.emit(&[0x00]),
            Mne::Halt => self.emit(&[0x76]),
            Mne::Stop => self.emit(&[0x10, 0x00]),
            Mne::Di => self.emit(&[0xF3]),
            Mne::Ei => self.emit(&[0xFB]),
            Mne::Daa => self.emit(&[0x27]),
            Mne::Cpl => self.emit(&[0x2F]),
            Mne::Scf => self.emit(&[0x37]),
            Mne::Ccf => self.emit(&[0x3F]),
            Mne::Rlca => self.emit(&[0x07]),
            Mne::Rrca => self.emit(&[0x0F]),
            Mne::Rla => self.emit(&[0x17]),
            Mne::Rra => self.emit(&[0x1F]),
            Mne::Reti => self.emit(&[0xD9]),
            Mne::Ld => self.ins_ld(),
            Mne::Ldh => self.ins_ldh(),
            Mne::Ldi => self.ins_ldid(0x22, 0x2A),
            Mne::Ldd => self.ins_ldid(0x32, 0x3A),
            Mne::Inc => self.ins_incdec(true),
            Mne::Dec => self.ins_incdec(false),
            Mne::Add => self.ins_add(),
            Mne::Adc => self.ins_alu(0x88, 0xCE),
            Mne::Sub => self.ins_alu(0x90, 0xD6),
            Mne::Sbc => self.ins_alu(0x98, 0xDE),
            Mne::And => self.ins_alu(0xA0, 0xE6),
            Mne::Xor => self.ins_alu(0xA8, 0xEE),
            Mne::Or => self.ins_alu(0xB0, 0xF6),
            Mne::Cp => self.ins_alu(0xB8, 0xFE),
            Mne::Jp => self.ins_jp(),
            Mne::Jr => self.ins_jr(),
            Mne::Call => self.ins_call(),
            Mne::Ret => self.ins_ret(),
            Mne::Rst => self.ins_rst(),
            Mne::Push => self.ins_pushpop(0xC5),
            Mne::Pop => self.ins_pushpop(0xC1),
            Mne::Rlc => self.ins_cb(0x00),
            Mne::Rrc => self.ins_cb(0x08),
            Mne::Rl => self.ins_cb(0x10),
            Mne::Rr => self.ins_cb(0x18),
            Mne::Sla => self.ins_cb(0x20),
            Mne::Sra => self.ins_cb(0x28),
            Mne::Swap => self.ins_cb(0x30),
            Mne::Srl => self.ins_cb(0x38),
            Mne::Bit => self.ins_cb_bit(0x40),
            Mne::Res => self.ins_cb_bit(0x80),
            Mne::Set => self.ins_cb_bit(0xC0),
        }
    }

    fn mem_operand(&mut self) -> io::Result<Mem<'a>> {
        self.expect(Tok::LBRACKET)?;
        let mem = if self.peek()? == Tok::ID {
            if self.str_like("bc") {
                self.eat();
                Mem::Bc
            } else if self.str_like("de") {
                self.eat();
                Mem::De
            } else if self.str_like("hl") {
                self.eat();
                match self.peek()? {
                    Tok::PLUS => {
                        self.eat();
                        Mem::Hli
                    }
                    Tok::MINUS => {
                        self.eat();
                        Mem::Hld
                    }
                    _ => Mem::Hl,
                }
            } else if self.str_like("hli") {
                self.eat();
                Mem::Hli
            } else if self.str_like("hld") {
                self.eat();
                Mem::Hld
            } else if self.str_like("c") {
                self.eat();
                Mem::C
            } else {
                Mem::Addr(self.expr()?)
            }
        } else {
            Mem::Addr(self.expr()?)
        };
        self.expect(Tok::RBRACKET)?;
        Ok(mem)
    }

    /// Consume a register-or-memory operand for the `r8` encoding slot,
    /// or fall back to an immediate expression.
    fn alu_operand(&mut self) -> io::Result<AluOp<'a>> {
        if self.peek()? == Tok::LBRACKET {
            match self.mem_operand()? {
                Mem::Hl => Ok(AluOp::Reg(6)),
                _ => Err(self.err("illegal address mode")),
            }
        } else if self.peek()? == Tok::ID
            && let Some(r) = reg8(&self.string)
        {
            self.eat();
            Ok(AluOp::Reg(r))
        } else {
            Ok(AluOp::Imm(self.expr()?))
        }
    }

    fn expect_a(&mut self) -> io::Result<()> {
        if self.peek()? == Tok::ID && self.str_like("a") {
            self.eat();
            Ok(())
        } else {
            Err(self.err("expected the a register"))
        }
    }

    fn ins_ld(&mut self) -> io::Result<()> {
        if self.peek()? == Tok::LBRACKET {
            let mem = self.mem_operand()?;
            self.expect(Tok::COMMA)?;
            return match mem {
                Mem::Bc => {
                    self.expect_a()?;
                    self.emit(&[0x02])
                }
                Mem::De => {
                    self.expect_a()?;
                    self.emit(&[0x12])
                }
                Mem::Hli => {
                    self.expect_a()?;
                    self.emit(&[0x22])
                }
                Mem::Hld => {
                    self.expect_a()?;
                    self.emit(&[0x32])
                }
                Mem::C => {
                    self.expect_a()?;
                    self.emit(&[0xE2])
                }
                Mem::Hl => {
                    if self.peek()? == Tok::ID
                        && let Some(r) = reg8(&self.string)
                    {
                        self.eat();
                        self.emit(&[0x70 | r])
                    } else {
                        let expr = self.expr()?;
                        self.emit(&[0x36])?;
                        self.emit_byte_expr(expr)
                    }
                }
                Mem::Addr(addr) => {
                    if self.peek()? == Tok::ID && self.str_like("sp") {
                        self.eat();
                        self.emit(&[0x08])?;
                        self.emit_word_expr(addr)
                    } else {
                        self.expect_a()?;
                        // absolute store to high-page store rewrite
                        if self.opt_ldh
                            && let Expr::Const(value) = addr
                            && (0xFF00..=0xFFFE).contains(&(value as u32))
                        {
                            self.emit(&[0xE0, (value as u32 & 0xFF) as u8])
                        } else {
                            self.emit(&[0xEA])?;
                            self.emit_word_expr(addr)
                        }
                    }
                }
            };
        }
        if self.peek()? != Tok::ID {
            return Err(self.err("bad ld destination"));
        }
        if self.str_like("a") {
            self.eat();
            self.expect(Tok::COMMA)?;
            if self.peek()? == Tok::LBRACKET {
                let mem = self.mem_operand()?;
                return match mem {
                    Mem::Bc => self.emit(&[0x0A]),
                    Mem::De => self.emit(&[0x1A]),
                    Mem::Hli => self.emit(&[0x2A]),
                    Mem::Hld => self.emit(&[0x3A]),
                    Mem::C => self.emit(&[0xF2]),
                    Mem::Hl => self.emit(&[0x7E]),
                    Mem::Addr(addr) => {
                        // absolute load to high-page load rewrite
                        if self.opt_ldh
                            && let Expr::Const(value) = addr
                            && (0xFF00..=0xFFFE).contains(&(value as u32))
                        {
                            self.emit(&[0xF0, (value as u32 & 0xFF) as u8])
                        } else {
                            self.emit(&[0xFA])?;
                            self.emit_word_expr(addr)
                        }
                    }
                };
            }
            if self.peek()? == Tok::ID
                && let Some(r) = reg8(&self.string)
            {
                self.eat();
                return self.emit(&[0x78 | r]);
            }
            let expr = self.expr()?;
            self.emit(&[0x3E])?;
            return self.emit_byte_expr(expr);
        }
        if let Some(r) = reg8(&self.string) {
            self.eat();
            self.expect(Tok::COMMA)?;
            if self.peek()? == Tok::LBRACKET {
                match self.mem_operand()? {
                    Mem::Hl => return self.emit(&[0x46 | (r << 3)]),
                    _ => return Err(self.err("illegal address mode")),
                }
            }
            if self.peek()? == Tok::ID
                && let Some(s) = reg8(&self.string)
            {
                self.eat();
                return self.emit(&[0x40 | (r << 3) | s]);
            }
            let expr = self.expr()?;
            self.emit(&[0x06 | (r << 3)])?;
            return self.emit_byte_expr(expr);
        }
        if self.str_like("bc") || self.str_like("de") {
            let op = if self.str_like("bc") { 0x01 } else { 0x11 };
            self.eat();
            self.expect(Tok::COMMA)?;
            let expr = self.expr()?;
            self.emit(&[op])?;
            return self.emit_word_expr(expr);
        }
        if self.str_like("hl") {
            self.eat();
            self.expect(Tok::COMMA)?;
            if self.peek()? == Tok::ID && self.str_like("sp") {
                self.eat();
                // `ld hl, sp + e8` (also `ld hl, sp - e8`)
                let expr = match self.peek()? {
                    Tok::PLUS | Tok::MINUS => self.expr_signed_tail()?,
                    _ => return Err(self.err("expected a signed offset after sp")),
                };
                self.emit(&[0xF8])?;
                return self.emit_signed_byte(expr);
            }
            let expr = self.expr()?;
            self.emit(&[0x21])?;
            return self.emit_word_expr(expr);
        }
        if self.str_like("sp") {
            self.eat();
            self.expect(Tok::COMMA)?;
            if self.peek()? == Tok::ID && self.str_like("hl") {
                self.eat();
                return self.emit(&[0xF9]);
            }
            let expr = self.expr()?;
            self.emit(&[0x31])?;
            return self.emit_word_expr(expr);
        }
        Err(self.err("bad ld destination"))
    }

    /// Parse `+ e` / `- e` as a full signed expression (the sign is folded
    /// into the expression).
    fn expr_signed_tail(&mut self) -> io::Result<Expr<'a>> {
        let negate = self.peek()? == Tok::MINUS;
        self.eat();
        let expr = self.expr()?;
        if !negate {
            return Ok(expr);
        }
        match expr {
            Expr::Const(value) => Ok(Expr::Const(value.wrapping_neg())),
            Expr::Rpn(nodes) => {
                let mut nodes = nodes.to_vec();
                nodes.push(ExprNode::Op(RpnOp::NEG));
                Ok(Expr::Rpn(self.expr_int.intern(&nodes)))
            }
        }
    }

    fn emit_signed_byte(&mut self, expr: Expr<'a>) -> io::Result<()> {
        match expr {
            Expr::Const(value) => {
                if !(-128..=127).contains(&value) {
                    self.warn(Warning::Truncation, "signed offset does not fit in 8 bits");
                }
                self.emit(&[(value as u32 & 0xFF) as u8])
            }
            Expr::Rpn(nodes) => self.patch(PatchKind::Byte, nodes),
        }
    }

    fn ins_ldh(&mut self) -> io::Result<()> {
        if self.peek()? == Tok::LBRACKET {
            let mem = self.mem_operand()?;
            self.expect(Tok::COMMA)?;
            self.expect_a()?;
            return match mem {
                Mem::C => self.emit(&[0xE2]),
                Mem::Addr(addr) => {
                    self.emit(&[0xE0])?;
                    self.emit_hram(addr)
                }
                _ => Err(self.err("illegal address mode")),
            };
        }
        self.expect_a()?;
        self.expect(Tok::COMMA)?;
        match self.mem_operand()? {
            Mem::C => self.emit(&[0xF2]),
            Mem::Addr(addr) => {
                self.emit(&[0xF0])?;
                self.emit_hram(addr)
            }
            _ => Err(self.err("illegal address mode")),
        }
    }

    /// High-page operands: a constant must land in $FF00-$FFFE once OR'd
    /// with $FF00; deferred operands get an HRAM check tag for the linker.
    fn emit_hram(&mut self, expr: Expr<'a>) -> io::Result<()> {
        match expr {
            Expr::Const(value) => {
                // either a bare low byte or a full high-page address,
                // capped at $FFFE
                let addr = value as u32;
                if addr > 0xFE && !(0xFF00..=0xFFFE).contains(&addr) {
                    return Err(self.err("address is not in high RAM"));
                }
                self.emit(&[(value as u32 & 0xFF) as u8])
            }
            Expr::Rpn(nodes) => {
                let mut nodes = nodes.to_vec();
                nodes.push(ExprNode::Op(RpnOp::HRAM_CHECK));
                let nodes = self.expr_int.intern(&nodes);
                self.patch(PatchKind::Byte, nodes)
            }
        }
    }

    fn ins_ldid(&mut self, store: u8, load: u8) -> io::Result<()> {
        if self.peek()? == Tok::LBRACKET {
            match self.mem_operand()? {
                Mem::Hl => {}
                _ => return Err(self.err("illegal address mode")),
            }
            self.expect(Tok::COMMA)?;
            self.expect_a()?;
            self.emit(&[store])
        } else {
            self.expect_a()?;
            self.expect(Tok::COMMA)?;
            match self.mem_operand()? {
                Mem::Hl => {}
                _ => return Err(self.err("illegal address mode")),
            }
            self.emit(&[load])
        }
    }

    fn ins_incdec(&mut self, inc: bool) -> io::Result<()> {
        if self.peek()? == Tok::LBRACKET {
            match self.mem_operand()? {
                Mem::Hl => {}
                _ => return Err(self.err("illegal address mode")),
            }
            return self.emit(&[if inc { 0x34 } else { 0x35 }]);
        }
        if self.peek()? != Tok::ID {
            return Err(self.err("expected register"));
        }
        if let Some(r) = reg8(&self.string) {
            self.eat();
            return self.emit(&[if inc { 0x04 } else { 0x05 } | (r << 3)]);
        }
        if let Some(rr) = reg16(&self.string) {
            self.eat();
            return self.emit(&[if inc { 0x03 } else { 0x0B } | (rr << 4)]);
        }
        Err(self.err("expected register"))
    }

    fn ins_add(&mut self) -> io::Result<()> {
        if self.peek()? == Tok::ID && self.str_like("hl") {
            self.eat();
            self.expect(Tok::COMMA)?;
            if self.peek()? != Tok::ID {
                return Err(self.err("expected register"));
            }
            let Some(rr) = reg16(&self.string) else {
                return Err(self.err("expected register"));
            };
            self.eat();
            return self.emit(&[0x09 | (rr << 4)]);
        }
        if self.peek()? == Tok::ID && self.str_like("sp") {
            self.eat();
            self.expect(Tok::COMMA)?;
            let expr = self.expr()?;
            self.emit(&[0xE8])?;
            return self.emit_signed_byte(expr);
        }
        self.ins_alu(0x80, 0xC6)
    }

    fn ins_alu(&mut self, base: u8, imm_op: u8) -> io::Result<()> {
        let first = self.alu_operand()?;
        let operand = if self.peek()? == Tok::COMMA {
            // the two-operand spelling `op a, x`
            match first {
                AluOp::Reg(7) => {}
                _ => return Err(self.err("destination must be the a register")),
            }
            self.eat();
            self.alu_operand()?
        } else {
            first
        };
        match operand {
            AluOp::Reg(r) => self.emit(&[base | r]),
            AluOp::Imm(expr) => {
                self.emit(&[imm_op])?;
                self.emit_byte_expr(expr)
            }
        }
    }

    fn get_cond(&mut self) -> io::Result<Option<u8>> {
        if self.peek()? == Tok::ID
            && let Some(cc) = cond(&self.string)
        {
            self.eat();
            return Ok(Some(cc));
        }
        Ok(None)
    }

    fn ins_jp(&mut self) -> io::Result<()> {
        if self.peek()? == Tok::ID && self.str_like("hl") {
            self.eat();
            return self.emit(&[0xE9]);
        }
        if let Some(cc) = self.get_cond()? {
            self.expect(Tok::COMMA)?;
            let expr = self.expr()?;
            self.emit(&[0xC2 | (cc << 3)])?;
            return self.emit_word_expr(expr);
        }
        let expr = self.expr()?;
        self.emit(&[0xC3])?;
        self.emit_word_expr(expr)
    }

    fn ins_jr(&mut self) -> io::Result<()> {
        let op = match self.get_cond()? {
            Some(cc) => {
                self.expect(Tok::COMMA)?;
                0x20 | (cc << 3)
            }
            None => 0x18,
        };
        self.emit(&[op])?;
        let expr = self.expr()?;
        match expr {
            // the displacement is relative to the byte after the operand
            Expr::Const(target) => {
                let (sect, offset) = self
                    .label_loc()
                    .ok_or_else(|| self.err("jr outside of a section"))?;
                let org = self.sections[sect as usize].sect.org;
                if org >= 0 {
                    let disp = target.wrapping_sub(org.wrapping_add(offset as i32 + 1));
                    if !(-128..=127).contains(&disp) {
                        return Err(self.err(&format!("jr target out of range ({disp} bytes)")));
                    }
                    self.emit(&[(disp as u32 & 0xFF) as u8])
                } else {
                    let nodes = self.expr_int.intern(&[ExprNode::Const(target)]);
                    self.patch(PatchKind::Jr, nodes)
                }
            }
            Expr::Rpn(nodes) => self.patch(PatchKind::Jr, nodes),
        }
    }

    fn ins_call(&mut self) -> io::Result<()> {
        let op = match self.get_cond()? {
            Some(cc) => {
                self.expect(Tok::COMMA)?;
                0xC4 | (cc << 3)
            }
            None => 0xCD,
        };
        let expr = self.expr()?;
        self.emit(&[op])?;
        self.emit_word_expr(expr)
    }

    fn ins_ret(&mut self) -> io::Result<()> {
        match self.get_cond()? {
            Some(cc) => self.emit(&[0xC0 | (cc << 3)]),
            None => self.emit(&[0xC9]),
        }
    }

    /// `rst` targets must be one of $00, $08, ..., $38; deferred operands
    /// get the RST validity tag and the opcode OR folded into the patch.
    fn ins_rst(&mut self) -> io::Result<()> {
        let expr = self.expr()?;
        match expr {
            Expr::Const(value) => {
                if value as u32 & !0x38 != 0 {
                    return Err(self.err("rst target must be one of $00,$08,...,$38"));
                }
                self.emit(&[0xC7 | value as u8])
            }
            Expr::Rpn(nodes) => {
                let mut nodes = nodes.to_vec();
                nodes.push(ExprNode::Op(RpnOp::RST_CHECK));
                nodes.push(ExprNode::Const(0xC7));
                nodes.push(ExprNode::Op(RpnOp::OR));
                let nodes = self.expr_int.intern(&nodes);
                self.patch(PatchKind::Byte, nodes)
            }
        }
    }

    fn ins_pushpop(&mut self, base: u8) -> io::Result<()> {
        if self.peek()? != Tok::ID {
            return Err(self.err("expected register pair"));
        }
        let rr = if self.str_like("bc") {
            0
        } else if self.str_like("de") {
            1
        } else if self.str_like("hl") {
            2
        } else if self.str_like("af") {
            3
        } else {
            return Err(self.err("expected register pair"));
        };
        self.eat();
        self.emit(&[base | (rr << 4)])
    }

    fn ins_cb(&mut self, base: u8) -> io::Result<()> {
        let r = match self.alu_operand()? {
            AluOp::Reg(r) => r,
            AluOp::Imm(_) => return Err(self.err("expected register")),
        };
        self.emit(&[0xCB, base | r])
    }

    fn ins_cb_bit(&mut self, base: u8) -> io::Result<()> {
        let bit = self.const_expr()?;
        if !(0..=7).contains(&bit) {
            return Err(self.err("bit index must be between 0 and 7"));
        }
        self.expect(Tok::COMMA)?;
        let r = match self.alu_operand()? {
            AluOp::Reg(r) => r,
            AluOp::Imm(_) => return Err(self.err("expected register")),
        };
        self.emit(&[0xCB, base | ((bit as u8) << 3) | r])
    }

    fn peek(&mut self) -> io::Result<Tok> {
        if let Some(tok) = self.stash {
            return Ok(tok);
        }
        loop {
            let tok = self.lex()?;
            if tok == Tok::EOF && self.frame_end()? {
                continue;
            }
            self.stash = Some(tok);
            return Ok(tok);
        }
    }

    fn eat(&mut self) {
        self.stash = None;
    }

    /// Called when the top frame runs dry: iterate a rept/for body, or
    /// pop back to the enclosing frame. Returns false at real EOF.
    fn frame_end(&mut self) -> io::Result<bool> {
        if self.frames.len() <= 1 {
            return Ok(false);
        }
        let iterate = match &self.frames.last().unwrap().kind {
            FrameKind::Rept { count, iter, .. } => iter + 1 < *count,
            _ => false,
        };
        if iterate {
            self.unique += 1;
            let next_unique = self.unique;
            let frame = self.frames.last_mut().unwrap();
            let binding = match &mut frame.kind {
                FrameKind::Rept {
                    iter,
                    unique,
                    var,
                    start,
                    step,
                    ..
                } => {
                    *iter += 1;
                    *unique = next_unique;
                    var.map(|var| (var, start.wrapping_add(step.wrapping_mul(*iter as i32))))
                }
                _ => unreachable!(),
            };
            frame.offset = 0;
            frame.line = frame.body_line;
            if let Some((var, value)) = binding {
                self.set_var(var, value)?;
            }
            return Ok(true);
        }
        let frame = self.frames.pop().unwrap();
        if self.if_stack.len() != frame.if_depth {
            self.if_stack.truncate(frame.if_depth);
            return Err(self.err("unterminated IF block"));
        }
        Ok(true)
    }

    fn cur_line(&self) -> u32 {
        self.frames.last().map(|frame| frame.line).unwrap_or(0)
    }

    fn peek_byte(&mut self) -> Option<u8> {
        while let Some(exp) = self.exps.last() {
            if exp.offset < exp.text.len() {
                return Some(exp.text.as_bytes()[exp.offset]);
            }
            self.exps.pop();
        }
        let frame = self.frames.last()?;
        frame.src.as_bytes().get(frame.offset).copied()
    }

    fn bump(&mut self) {
        if let Some(exp) = self.exps.last_mut() {
            exp.offset += 1;
            return;
        }
        if let Some(frame) = self.frames.last_mut()
            && let Some(&c) = frame.src.as_bytes().get(frame.offset)
        {
            frame.offset += 1;
            if c == b'\n' {
                frame.line += 1;
            }
        }
    }

    /// Copy one (possibly multi-byte) character into the token buffer.
    fn push_char(&mut self) {
        let Some(c) = self.peek_byte() else {
            return;
        };
        let len = match c {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            _ => 4,
        };
        let mut buf = [0u8; 4];
        let mut n = 0;
        for slot in buf.iter_mut().take(len) {
            let Some(c) = self.peek_byte() else { break };
            *slot = c;
            self.bump();
            n += 1;
        }
        match std::str::from_utf8(&buf[..n]) {
            Ok(s) => self.string.push_str(s),
            Err(_) => self.string.push('\u{FFFD}'),
        }
    }

    fn push_exp(&mut self, text: &'a str) -> io::Result<()> {
        if self.exps.len() >= self.depth {
            return Err(self.fatal(&format!("recursion limit ({}) exceeded", self.depth)));
        }
        self.exps.push(Exp { text, offset: 0 });
        Ok(())
    }

    /// `\@` expands to the decimal unique id of the innermost macro
    /// invocation or rept iteration, so it works both as a bare number
    /// and pasted into label names.
    fn push_unique_exp(&mut self) -> io::Result<()> {
        let mut found = None;
        for frame in self.frames.iter().rev() {
            match frame.kind {
                FrameKind::Macro { unique, .. } | FrameKind::Rept { unique, .. } => {
                    found = Some(unique);
                    break;
                }
                _ => {}
            }
        }
        let Some(unique) = found else {
            return Err(self.err("\\@ used outside of a macro or rept block"));
        };
        let text = self.str_int.intern(&unique.to_string());
        self.push_exp(text)
    }

    fn push_arg_exp(&mut self, n: usize) -> io::Result<()> {
        if n == 0 {
            return Err(self.err("macro arguments are numbered from 1"));
        }
        let mut found = None;
        for frame in self.frames.iter().rev() {
            if let FrameKind::Macro { args, shift, .. } = &frame.kind {
                found = Some(args.get(shift + n - 1).copied());
                break;
            }
        }
        match found {
            Some(Some(text)) => self.push_exp(text),
            Some(None) => Err(self.err(&format!("macro argument \\{n} is not defined"))),
            None => Err(self.err("macro argument used outside of a macro")),
        }
    }

    fn lex(&mut self) -> io::Result<Tok> {
        self.string.clear();
        // skip whitespace, comments, continuations, and spliced expansions
        loop {
            match self.peek_byte() {
                Some(b' ' | b'\t' | b'\r') => self.bump(),
                Some(b';') => {
                    while !matches!(self.peek_byte(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek_byte() {
                        Some(b'\n') => self.bump(),
                        Some(b'@') => {
                            self.bump();
                            self.push_unique_exp()?;
                        }
                        Some(d) if d.is_ascii_digit() => {
                            self.bump();
                            self.push_arg_exp((d - b'0') as usize)?;
                        }
                        _ => return Err(self.err("invalid character escape")),
                    }
                }
                _ => break,
            }
        }
        self.tok_line = self.cur_line();
        let Some(c) = self.peek_byte() else {
            return Ok(Tok::EOF);
        };
        match c {
            b'\n' => {
                self.bump();
                Ok(Tok::NEWLINE)
            }
            b'$' => {
                self.bump();
                let mut any = false;
                let mut value = 0u32;
                while let Some(c) = self.peek_byte() {
                    if c == b'_' {
                        self.bump();
                        continue;
                    }
                    let Some(digit) = (c as char).to_digit(16) else {
                        break;
                    };
                    value = value.wrapping_mul(16).wrapping_add(digit);
                    any = true;
                    self.bump();
                }
                if !any {
                    return Err(self.err("expected hexadecimal digits"));
                }
                self.number = value as i32;
                Ok(Tok::NUM)
            }
            b'%' => {
                self.bump();
                if !matches!(self.peek_byte(), Some(b'0' | b'1')) {
                    return Ok(Tok::MODULUS);
                }
                let mut value = 0u32;
                while let Some(c) = self.peek_byte() {
                    match c {
                        b'_' => {}
                        b'0' => value = value.wrapping_mul(2),
                        b'1' => value = value.wrapping_mul(2).wrapping_add(1),
                        _ => break,
                    }
                    self.bump();
                }
                self.number = value as i32;
                Ok(Tok::NUM)
            }
            b'&' => {
                self.bump();
                if self.peek_byte() == Some(b'&') {
                    self.bump();
                    return Ok(Tok::LAND);
                }
                if !matches!(self.peek_byte(), Some(b'0'..=b'7')) {
                    return Ok(Tok::AMP);
                }
                let mut value = 0u32;
                while let Some(c) = self.peek_byte() {
                    match c {
                        b'_' => {}
                        b'0'..=b'7' => value = value.wrapping_mul(8).wrapping_add((c - b'0') as u32),
                        _ => break,
                    }
                    self.bump();
                }
                self.number = value as i32;
                Ok(Tok::NUM)
            }
            // 2bpp graphics constant: up to 8 pixels, leftmost first
            b'`' => {
                self.bump();
                let mut plane0 = 0u16;
                let mut plane1 = 0u16;
                let mut any = false;
                while let Some(c @ b'0'..=b'3') = self.peek_byte() {
                    let d = c - b'0';
                    plane0 = (plane0 << 1) | (d & 1) as u16;
                    plane1 = (plane1 << 1) | (d >> 1) as u16;
                    any = true;
                    self.bump();
                }
                if !any {
                    return Err(self.err("expected graphics digits (0-3)"));
                }
                self.number = (((plane1 as u32) << 8) | plane0 as u32) as i32;
                Ok(Tok::NUM)
            }
            b'0'..=b'9' => {
                let mut value = 0u32;
                while let Some(c) = self.peek_byte() {
                    match c {
                        b'_' => {}
                        b'0'..=b'9' => {
                            value = value.wrapping_mul(10).wrapping_add((c - b'0') as u32)
                        }
                        _ => break,
                    }
                    self.bump();
                }
                if self.peek_byte() == Some(b'.') {
                    // fixed-point literal at the current Q precision
                    self.bump();
                    let mut frac = 0f64;
                    let mut scale = 0.1f64;
                    let mut any = false;
                    while let Some(c @ b'0'..=b'9') = self.peek_byte() {
                        frac += (c - b'0') as f64 * scale;
                        scale /= 10.0;
                        any = true;
                        self.bump();
                    }
                    if !any {
                        return Err(self.err("expected digits after the decimal point"));
                    }
                    let fixed = (value as f64 + frac) * (1i64 << self.opt_q) as f64;
                    self.number = (fixed.round() as i64) as i32;
                } else {
                    self.number = value as i32;
                }
                Ok(Tok::NUM)
            }
            b'"' => {
                self.bump();
                self.lex_string()
            }
            b'\'' => {
                self.bump();
                let value = match self.peek_byte() {
                    None | Some(b'\n') => return Err(self.err("unterminated character literal")),
                    Some(b'\\') => {
                        self.bump();
                        let c = match self.peek_byte() {
                            Some(b'n') => b'\n',
                            Some(b'r') => b'\r',
                            Some(b't') => b'\t',
                            Some(b'0') => b'\0',
                            Some(b'\\') => b'\\',
                            Some(b'\'') => b'\'',
                            Some(b'"') => b'"',
                            _ => return Err(self.err("invalid character escape")),
                        };
                        self.bump();
                        c as i32
                    }
                    Some(c) => {
                        self.bump();
                        c as i32
                    }
                };
                if self.peek_byte() != Some(b'\'') {
                    return Err(self.err("unterminated character literal"));
                }
                self.bump();
                self.number = value;
                Ok(Tok::NUM)
            }
            b':' => {
                self.bump();
                match self.peek_byte() {
                    Some(b':') => {
                        self.bump();
                        Ok(Tok::DUB)
                    }
                    Some(b'+') => {
                        let mut count = 0;
                        while self.peek_byte() == Some(b'+') {
                            self.bump();
                            count += 1;
                        }
                        self.number = count;
                        Ok(Tok::ANON)
                    }
                    Some(b'-') => {
                        let mut count = 0;
                        while self.peek_byte() == Some(b'-') {
                            self.bump();
                            count += 1;
                        }
                        self.number = -count;
                        Ok(Tok::ANON)
                    }
                    _ => Ok(Tok::COLON),
                }
            }
            b'<' => {
                self.bump();
                match self.peek_byte() {
                    Some(b'<') => {
                        self.bump();
                        Ok(Tok::SHL)
                    }
                    Some(b'=') => {
                        self.bump();
                        Ok(Tok::LTE)
                    }
                    _ => Ok(Tok::LT),
                }
            }
            b'>' => {
                self.bump();
                match self.peek_byte() {
                    Some(b'>') => {
                        self.bump();
                        if self.peek_byte() == Some(b'>') {
                            self.bump();
                            Ok(Tok::USHR)
                        } else {
                            Ok(Tok::SHR)
                        }
                    }
                    Some(b'=') => {
                        self.bump();
                        Ok(Tok::GTE)
                    }
                    _ => Ok(Tok::GT),
                }
            }
            b'=' => {
                self.bump();
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    Ok(Tok::DEQ)
                } else {
                    Ok(Tok::EQUAL)
                }
            }
            b'!' => {
                self.bump();
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    Ok(Tok::NEQ)
                } else {
                    Ok(Tok::BANG)
                }
            }
            b'|' => {
                self.bump();
                if self.peek_byte() == Some(b'|') {
                    self.bump();
                    Ok(Tok::LOR)
                } else {
                    Ok(Tok::PIPE)
                }
            }
            b'*' => {
                self.bump();
                if self.peek_byte() == Some(b'*') {
                    self.bump();
                    Ok(Tok::EXP)
                } else {
                    Ok(Tok::STAR)
                }
            }
            b'@' => {
                self.bump();
                self.string.push('@');
                Ok(Tok::ID)
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'.' => self.lex_ident(),
            b'+' | b'-' | b'/' | b'(' | b')' | b'[' | b']' | b',' | b'^' | b'~' => {
                self.bump();
                Ok(Tok(c))
            }
            _ => Err(self.err("unexpected character")),
        }
    }

    fn lex_ident(&mut self) -> io::Result<Tok> {
        loop {
            match self.peek_byte() {
                Some(c) if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' => {
                    self.string.push(c as char);
                    self.bump();
                }
                // `\@` and `\1` paste into identifiers
                Some(b'\\') => {
                    self.bump();
                    match self.peek_byte() {
                        Some(b'@') => {
                            self.bump();
                            self.push_unique_exp()?;
                        }
                        Some(d) if d.is_ascii_digit() => {
                            self.bump();
                            self.push_arg_exp((d - b'0') as usize)?;
                        }
                        _ => return Err(self.err("invalid character escape")),
                    }
                }
                _ => break,
            }
        }
        if let Some(tok) = KEYWORDS
            .iter()
            .find_map(|(name, tok)| self.str_like(name).then_some(*tok))
        {
            return Ok(tok);
        }
        if !self.no_expand {
            if self.string == "__FILE__" {
                let path = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|frame| match frame.kind {
                        FrameKind::File { path } => Some(path),
                        _ => None,
                    })
                    .unwrap_or("<none>");
                let text = self.str_int.intern(&format!("\"{path}\""));
                self.push_exp(text)?;
                self.string.clear();
                return self.lex();
            }
            if let Some(index) = self.find_sym(&self.string)
                && let SymVal::Equs(text) = self.syms[index].val
            {
                self.push_exp(text)?;
                self.string.clear();
                return self.lex();
            }
        }
        Ok(Tok::ID)
    }

    fn lex_string(&mut self) -> io::Result<Tok> {
        loop {
            match self.peek_byte() {
                None | Some(b'\n') => return Err(self.err("unterminated string")),
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek_byte() {
                        Some(b'n') => {
                            self.string.push('\n');
                            self.bump();
                        }
                        Some(b'r') => {
                            self.string.push('\r');
                            self.bump();
                        }
                        Some(b't') => {
                            self.string.push('\t');
                            self.bump();
                        }
                        Some(b'0') => {
                            self.string.push('\0');
                            self.bump();
                        }
                        Some(c @ (b'\\' | b'"' | b'\'' | b'{' | b'}')) => {
                            self.string.push(c as char);
                            self.bump();
                        }
                        Some(b'@') => {
                            self.bump();
                            self.push_unique_exp()?;
                        }
                        Some(d) if d.is_ascii_digit() => {
                            self.bump();
                            self.push_arg_exp((d - b'0') as usize)?;
                        }
                        _ => return Err(self.err("invalid string escape")),
                    }
                }
                Some(b'{') => {
                    self.bump();
                    self.interpolate()?;
                }
                Some(c) if c < 0x80 => {
                    self.string.push(c as char);
                    self.bump();
                }
                Some(_) => self.push_char(),
            }
        }
        Ok(Tok::STR)
    }

    /// `{sym}` inside a string splices the symbol's value: EQUS text
    /// verbatim, numbers as `$` hex.
    fn interpolate(&mut self) -> io::Result<()> {
        let mut name = String::new();
        loop {
            match self.peek_byte() {
                Some(b'}') => {
                    self.bump();
                    break;
                }
                None | Some(b'\n') => return Err(self.err("unterminated interpolation")),
                Some(c) => {
                    name.push(c as char);
                    self.bump();
                }
            }
        }
        if name == "__LINE__" {
            let text = self.str_int.intern(&self.tok_line.to_string());
            return self.push_exp(text);
        }
        if name == "__FILE__" {
            let path = self
                .frames
                .iter()
                .rev()
                .find_map(|frame| match frame.kind {
                    FrameKind::File { path } => Some(path),
                    _ => None,
                })
                .unwrap_or("<none>");
            let text = self.str_int.intern(path);
            return self.push_exp(text);
        }
        let full;
        let name = if let Some(rest) = name.strip_prefix('.') {
            let Some(scope) = self.scope else {
                return Err(self.err("local symbol interpolated outside of a scope"));
            };
            full = format!("{scope}.{rest}");
            full.as_str()
        } else {
            name.as_str()
        };
        let Some(index) = self.find_sym(name) else {
            return Err(self.err(&format!("undefined symbol \"{name}\" in interpolation")));
        };
        match self.syms[index].val {
            SymVal::Equs(text) => self.push_exp(text),
            SymVal::Equ(value) | SymVal::Var(value) => {
                let text = self.str_int.intern(&format!("${value:X}"));
                self.push_exp(text)
            }
            SymVal::Label { sect, offset } => {
                let org = self.sections[sect as usize].sect.org;
                if org < 0 {
                    return Err(self.err("interpolated label address is not known yet"));
                }
                let text = self
                    .str_int
                    .intern(&format!("${:X}", org.wrapping_add(offset as i32)));
                self.push_exp(text)
            }
            _ => Err(self.err(&format!("symbol \"{name}\" cannot be interpolated"))),
        }
    }

    /// Raw comma-separated capture for macro arguments and OPT lists.
    /// Strings and bracketed groups protect their commas; surrounding
    /// blanks are trimmed.
    fn raw_args(&mut self) -> io::Result<Vec<&'a str>> {
        let mut args = Vec::new();
        let mut buf = String::new();
        let mut depth = 0i32;
        let mut in_string = false;
        let mut any = false;
        loop {
            match self.peek_byte() {
                None | Some(b'\n') => break,
                Some(b';') if !in_string => {
                    while !matches!(self.peek_byte(), None | Some(b'\n')) {
                        self.bump();
                    }
                    break;
                }
                Some(b'"') => {
                    in_string = !in_string;
                    buf.push('"');
                    self.bump();
                }
                Some(b'\\') if in_string => {
                    buf.push('\\');
                    self.bump();
                    if let Some(c) = self.peek_byte() {
                        buf.push(c as char);
                        self.bump();
                    }
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek_byte() {
                        Some(b'\n') => self.bump(),
                        Some(b'@') => {
                            self.bump();
                            self.push_unique_exp()?;
                        }
                        Some(d) if d.is_ascii_digit() => {
                            self.bump();
                            self.push_arg_exp((d - b'0') as usize)?;
                        }
                        _ => return Err(self.err("invalid character escape")),
                    }
                }
                Some(c @ (b'(' | b'[')) if !in_string => {
                    depth += 1;
                    buf.push(c as char);
                    self.bump();
                }
                Some(c @ (b')' | b']')) if !in_string => {
                    depth -= 1;
                    buf.push(c as char);
                    self.bump();
                }
                Some(b',') if !in_string && depth == 0 => {
                    self.bump();
                    args.push(self.str_int.intern(buf.trim()));
                    buf.clear();
                    any = true;
                }
                Some(c) if c < 0x80 => {
                    buf.push(c as char);
                    self.bump();
                }
                Some(_) => {
                    let keep = std::mem::take(&mut self.string);
                    self.push_char();
                    buf.push_str(&self.string);
                    self.string = keep;
                }
            }
        }
        if any || !buf.trim().is_empty() {
            args.push(self.str_int.intern(buf.trim()));
        }
        Ok(args)
    }

    fn sync_line(&mut self) {
        self.stash = None;
        self.exps.clear();
        if let Some(frame) = self.frames.last_mut() {
            let bytes = frame.src.as_bytes();
            while frame.offset < bytes.len() {
                let c = bytes[frame.offset];
                frame.offset += 1;
                if c == b'\n' {
                    frame.line += 1;
                    break;
                }
            }
        }
    }

    /// Capture a REPT/FOR or MACRO body verbatim from the current frame's
    /// source, balancing nested block openers. The body is a zero-copy
    /// slice of the frame text; the same definition is replayed by
    /// reference, never duplicated.
    fn capture_body(&mut self, kind: Capture) -> io::Result<(&'a str, u32)> {
        if !self.exps.is_empty() || self.stash == Some(Tok::EOF) {
            return Err(self.err("block body cannot start inside an expansion"));
        }
        self.stash = None;
        let (src, start, start_line) = {
            let frame = self.frames.last().ok_or_else(|| self.err("unexpected end of input"))?;
            (frame.src, frame.offset, frame.line)
        };
        let bytes = src.as_bytes();
        let mut pos = start;
        let mut line = start_line;
        let mut depth = 0i32;
        loop {
            if pos >= bytes.len() {
                return Err(self.err(match kind {
                    Capture::Rept => "REPT or FOR block has no matching ENDR",
                    Capture::Macro => "MACRO has no matching ENDM",
                }));
            }
            let line_start = pos;
            while pos < bytes.len() && bytes[pos] != b'\n' {
                match bytes[pos] {
                    b'"' => {
                        pos += 1;
                        while pos < bytes.len() && bytes[pos] != b'"' && bytes[pos] != b'\n' {
                            if bytes[pos] == b'\\' {
                                pos += 1;
                            }
                            pos += 1;
                        }
                        if pos < bytes.len() && bytes[pos] == b'"' {
                            pos += 1;
                        }
                    }
                    b';' => {
                        while pos < bytes.len() && bytes[pos] != b'\n' {
                            pos += 1;
                        }
                    }
                    _ => pos += 1,
                }
            }
            let end = pos;
            if pos < bytes.len() {
                pos += 1;
                line += 1;
            }
            match classify_line(&src[line_start..end]) {
                Some(Kw::Opener) => depth += 1,
                Some(Kw::Endr) => {
                    if depth == 0 {
                        if kind != Capture::Rept {
                            return Err(self.err("ENDR without a matching REPT or FOR"));
                        }
                        let frame = self.frames.last_mut().unwrap();
                        frame.offset = pos;
                        frame.line = line;
                        return Ok((&src[start..line_start], start_line));
                    }
                    depth -= 1;
                }
                Some(Kw::Endm) => {
                    if depth == 0 {
                        if kind != Capture::Macro {
                            return Err(self.err("ENDM without a matching MACRO"));
                        }
                        let frame = self.frames.last_mut().unwrap();
                        frame.offset = pos;
                        frame.line = line;
                        return Ok((&src[start..line_start], start_line));
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// Scan past a false conditional branch without evaluating anything,
    /// counting nested IF/REPT/FOR/MACRO blocks so the right terminator
    /// matches. Leaves the lexer just after the stopping keyword.
    fn skip_conditional(&mut self, to_endc: bool) -> io::Result<SkipStop> {
        self.stash = None;
        self.exps.clear();
        let (src, start, start_line) = {
            let frame = self.frames.last().ok_or_else(|| self.err("unexpected end of input"))?;
            (frame.src, frame.offset, frame.line)
        };
        let bytes = src.as_bytes();
        let mut pos = start;
        let mut line = start_line;
        let mut depth = 0i32;
        loop {
            if pos >= bytes.len() {
                return Err(self.err("IF block has no matching ENDC"));
            }
            let line_start = pos;
            while pos < bytes.len() && bytes[pos] != b'\n' {
                match bytes[pos] {
                    b'"' => {
                        pos += 1;
                        while pos < bytes.len() && bytes[pos] != b'"' && bytes[pos] != b'\n' {
                            if bytes[pos] == b'\\' {
                                pos += 1;
                            }
                            pos += 1;
                        }
                        if pos < bytes.len() && bytes[pos] == b'"' {
                            pos += 1;
                        }
                    }
                    b';' => {
                        while pos < bytes.len() && bytes[pos] != b'\n' {
                            pos += 1;
                        }
                    }
                    _ => pos += 1,
                }
            }
            let end = pos;
            let this_line = line;
            if pos < bytes.len() {
                pos += 1;
                line += 1;
            }
            let (kw, kw_end) = classify_skip_line(&src[line_start..end]);
            match kw {
                Some(SkipKw::If) => depth += 1,
                Some(SkipKw::Opener) => depth += 1,
                Some(SkipKw::Closer) => {
                    if depth > 0 {
                        depth -= 1;
                    }
                }
                Some(SkipKw::Endc) => {
                    if depth == 0 {
                        let frame = self.frames.last_mut().unwrap();
                        frame.offset = line_start + kw_end;
                        frame.line = this_line;
                        return Ok(SkipStop::Endc);
                    }
                    depth -= 1;
                }
                Some(SkipKw::Elif) if depth == 0 && !to_endc => {
                    let frame = self.frames.last_mut().unwrap();
                    frame.offset = line_start + kw_end;
                    frame.line = this_line;
                    return Ok(SkipStop::Elif);
                }
                Some(SkipKw::Else) if depth == 0 && !to_endc => {
                    let frame = self.frames.last_mut().unwrap();
                    frame.offset = line_start + kw_end;
                    frame.line = this_line;
                    return Ok(SkipStop::Else);
                }
                _ => {}
            }
        }
    }

    /// Reshape the assembler state into the interchange object. EQUS and
    /// macro symbols are lexical and stay behind; everything else keeps
    /// its relative order, with patch RPN symbol indices rewritten to
    /// match.
    fn to_object(&mut self) -> Object<'a> {
        let mut obj = Object::new();
        let mut remap = vec![-1i32; self.syms.len()];
        for (i, sym) in self.syms.iter().enumerate() {
            if sym.builtin || sym.purged {
                continue;
            }
            let entry = match sym.val {
                SymVal::Label { sect, offset } => ObjSym {
                    name: sym.name,
                    kind: if sym.exported {
                        ObjSymKind::Export
                    } else {
                        ObjSymKind::Local
                    },
                    node: sym.node,
                    line: sym.line,
                    sect,
                    value: offset as i32,
                },
                SymVal::Equ(value) | SymVal::Var(value) => ObjSym {
                    name: sym.name,
                    kind: if sym.exported {
                        ObjSymKind::Export
                    } else {
                        ObjSymKind::Local
                    },
                    node: sym.node,
                    line: sym.line,
                    sect: -1,
                    value,
                },
                SymVal::Ref => ObjSym {
                    name: sym.name,
                    kind: ObjSymKind::Import,
                    node: sym.node,
                    line: sym.line,
                    sect: -1,
                    value: 0,
                },
                SymVal::Equs(_) | SymVal::Mac { .. } => continue,
            };
            remap[i] = obj.syms.len() as i32;
            obj.syms.push(entry);
        }
        obj.nodes = std::mem::take(&mut self.nodes);
        for index in 0..self.sections.len() {
            let data = std::mem::take(&mut self.sections[index].sect.data);
            let patches = std::mem::take(&mut self.sections[index].sect.patches);
            let patches = patches
                .into_iter()
                .map(|patch| Patch {
                    expr: self.translate_expr(&remap, patch.expr),
                    ..patch
                })
                .collect();
            let sd = &self.sections[index];
            let size = if sd.sect.kind.has_data() {
                data.len() as u32
            } else {
                sd.sect.size
            };
            obj.sects.push(Sect {
                name: sd.sect.name,
                kind: sd.sect.kind,
                modif: sd.sect.modif,
                size,
                org: sd.sect.org,
                bank: sd.sect.bank,
                align: sd.sect.align,
                align_ofs: sd.sect.align_ofs,
                data,
                patches,
            });
        }
        for assert in std::mem::take(&mut self.asserts) {
            obj.asserts.push(Assertion {
                expr: self.translate_expr(&remap, assert.expr),
                ..assert
            });
        }
        obj
    }

    fn translate_expr(
        &mut self,
        remap: &[i32],
        expr: &'a [ExprNode<'a>],
    ) -> &'a [ExprNode<'a>] {
        if !expr
            .iter()
            .any(|node| matches!(node, ExprNode::Sym(_) | ExprNode::BankSym(_)))
        {
            return expr;
        }
        let nodes: Vec<ExprNode<'a>> = expr
            .iter()
            .map(|node| match *node {
                ExprNode::Sym(index) => ExprNode::Sym(remap[index as usize] as u32),
                ExprNode::BankSym(index) => ExprNode::BankSym(remap[index as usize] as u32),
                node => node,
            })
            .collect();
        self.expr_int.intern(&nodes)
    }
}

#[derive(Debug, Clone, Copy)]
enum Expr<'a> {
    Const(i32),
    Rpn(&'a [ExprNode<'a>]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Binary(Tok),
    Unary(Tok),
    Paren,
}

enum Mem<'a> {
    Bc,
    De,
    Hl,
    Hli,
    Hld,
    C,
    Addr(Expr<'a>),
}

enum AluOp<'a> {
    Reg(u8),
    Imm(Expr<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Rept,
    Macro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipStop {
    Elif,
    Else,
    Endc,
}

enum Kw {
    Opener,
    Endr,
    Endm,
}

enum SkipKw {
    If,
    Opener,
    Closer,
    Endc,
    Elif,
    Else,
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start_matches([' ', '\t']);
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || "_.@\\".contains(c)))
        .unwrap_or(s.len());
    (&s[..end], &s[end..])
}

fn classify_line(line: &str) -> Option<Kw> {
    fn kw_of(word: &str) -> Option<Kw> {
        if word.eq_ignore_ascii_case("REPT")
            || word.eq_ignore_ascii_case("FOR")
            || word.eq_ignore_ascii_case("MACRO")
        {
            Some(Kw::Opener)
        } else if word.eq_ignore_ascii_case("ENDR") {
            Some(Kw::Endr)
        } else if word.eq_ignore_ascii_case("ENDM") {
            Some(Kw::Endm)
        } else {
            None
        }
    }
    let (word, rest) = split_word(line);
    if word.is_empty() {
        return None;
    }
    if let Some(kw) = kw_of(word) {
        return Some(kw);
    }
    // a label may precede the keyword
    let rest = rest.trim_start_matches(':');
    let (word, _) = split_word(rest);
    kw_of(word)
}

/// Classify a line for conditional skipping; returns the keyword and the
/// byte offset just past it, so the parser can resume at an ELIF
/// condition.
fn classify_skip_line(line: &str) -> (Option<SkipKw>, usize) {
    let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
    let (word, _) = split_word(line);
    let end = indent + word.len();
    let kw = if word.eq_ignore_ascii_case("IF") {
        Some(SkipKw::If)
    } else if word.eq_ignore_ascii_case("REPT")
        || word.eq_ignore_ascii_case("FOR")
        || word.eq_ignore_ascii_case("MACRO")
    {
        Some(SkipKw::Opener)
    } else if word.eq_ignore_ascii_case("ENDR") || word.eq_ignore_ascii_case("ENDM") {
        Some(SkipKw::Closer)
    } else if word.eq_ignore_ascii_case("ENDC") {
        Some(SkipKw::Endc)
    } else if word.eq_ignore_ascii_case("ELIF") {
        Some(SkipKw::Elif)
    } else if word.eq_ignore_ascii_case("ELSE") {
        Some(SkipKw::Else)
    } else {
        None
    };
    (kw, end)
}

fn prec(op: Op) -> u8 {
    match op {
        Op::Paren => 0xFF,
        Op::Unary(_) => 2,
        Op::Binary(tok) => match tok {
            Tok::EXP => 1,
            Tok::STAR | Tok::SOLIDUS | Tok::MODULUS => 3,
            Tok::SHL | Tok::SHR | Tok::USHR => 4,
            Tok::AMP | Tok::PIPE | Tok::CARET => 5,
            Tok::PLUS | Tok::MINUS => 6,
            Tok::DEQ | Tok::NEQ | Tok::LT | Tok::GT | Tok::LTE | Tok::GTE => 7,
            Tok::LAND => 8,
            Tok::LOR => 9,
            _ => unreachable!(),
        },
    }
}

fn rpn_binop(tok: Tok) -> u8 {
    match tok {
        Tok::PLUS => RpnOp::ADD,
        Tok::MINUS => RpnOp::SUB,
        Tok::STAR => RpnOp::MUL,
        Tok::SOLIDUS => RpnOp::DIV,
        Tok::MODULUS => RpnOp::MOD,
        Tok::EXP => RpnOp::EXP,
        Tok::AMP => RpnOp::AND,
        Tok::PIPE => RpnOp::OR,
        Tok::CARET => RpnOp::XOR,
        Tok::SHL => RpnOp::SHL,
        Tok::SHR => RpnOp::SHR,
        Tok::USHR => RpnOp::USHR,
        Tok::LAND => RpnOp::LOGAND,
        Tok::LOR => RpnOp::LOGOR,
        Tok::DEQ => RpnOp::LOGEQ,
        Tok::NEQ => RpnOp::LOGNE,
        Tok::GT => RpnOp::LOGGT,
        Tok::LT => RpnOp::LOGLT,
        Tok::GTE => RpnOp::LOGGE,
        Tok::LTE => RpnOp::LOGLE,
        _ => unreachable!(),
    }
}

fn reg8(s: &str) -> Option<u8> {
    const NAMES: [(&str, u8); 7] = [
        ("b", 0),
        ("c", 1),
        ("d", 2),
        ("e", 3),
        ("h", 4),
        ("l", 5),
        ("a", 7),
    ];
    NAMES
        .iter()
        .find_map(|(name, r)| s.eq_ignore_ascii_case(name).then_some(*r))
}

fn reg16(s: &str) -> Option<u8> {
    const NAMES: [(&str, u8); 4] = [("bc", 0), ("de", 1), ("hl", 2), ("sp", 3)];
    NAMES
        .iter()
        .find_map(|(name, r)| s.eq_ignore_ascii_case(name).then_some(*r))
}

fn cond(s: &str) -> Option<u8> {
    const NAMES: [(&str, u8); 4] = [("nz", 0), ("z", 1), ("nc", 2), ("c", 3)];
    NAMES
        .iter()
        .find_map(|(name, cc)| s.eq_ignore_ascii_case(name).then_some(*cc))
}

fn parse_num(s: &str) -> Option<i32> {
    if let Some(rest) = s.strip_prefix('$') {
        u32::from_str_radix(rest, 16).ok().map(|v| v as i32)
    } else if let Some(rest) = s.strip_prefix('%') {
        u32::from_str_radix(rest, 2).ok().map(|v| v as i32)
    } else if let Some(rest) = s.strip_prefix('&') {
        u32::from_str_radix(rest, 8).ok().map(|v| v as i32)
    } else {
        s.parse().ok()
    }
}

fn utc_now() -> (i32, i32, i32, i32, i32, i32) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);
    let (year, month, day) = civil_from_days(days);
    (
        year,
        month,
        day,
        (rem / 3600) as i32,
        (rem % 3600 / 60) as i32,
        (rem % 60) as i32,
    )
}

// Gregorian date from days since the Unix epoch
fn civil_from_days(z: i64) -> (i32, i32, i32) {
    let z = z + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y as i32, m as i32, d as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tok(u8);

#[rustfmt::skip]
impl Tok {
    const NEWLINE: Self = Self(b'\n');
    const MODULUS: Self = Self(b'%');
    const AMP: Self = Self(b'&');
    const LPAREN: Self = Self(b'(');
    const RPAREN: Self = Self(b')');
    const STAR: Self = Self(b'*');
    const PLUS: Self = Self(b'+');
    const COMMA: Self = Self(b',');
    const MINUS: Self = Self(b'-');
    const SOLIDUS: Self = Self(b'/');
    const COLON: Self = Self(b':');
    const LT: Self = Self(b'<');
    const EQUAL: Self = Self(b'=');
    const GT: Self = Self(b'>');
    const LBRACKET: Self = Self(b'[');
    const RBRACKET: Self = Self(b']');
    const CARET: Self = Self(b'^');
    const PIPE: Self = Self(b'|');
    const TILDE: Self = Self(b'~');
    const BANG: Self = Self(b'!');

    const EOF: Self = Self(0x80);
    const ID: Self = Self(0x81);
    const NUM: Self = Self(0x82);
    const STR: Self = Self(0x83);
    const ANON: Self = Self(0x84);
    const DUB: Self = Self(0x85); // ::

    const SHL: Self = Self(0x90); // <<
    const SHR: Self = Self(0x91); // >>
    const USHR: Self = Self(0x92); // >>>
    const LTE: Self = Self(0x93); // <=
    const GTE: Self = Self(0x94); // >=
    const DEQ: Self = Self(0x95); // ==
    const NEQ: Self = Self(0x96); // !=
    const LAND: Self = Self(0x97); // &&
    const LOR: Self = Self(0x98); // ||
    const EXP: Self = Self(0x99); // **

    const DB: Self = Self(0xA0);
    const DW: Self = Self(0xA1);
    const DL: Self = Self(0xA2);
    const DS: Self = Self(0xA3);
    const SECTION: Self = Self(0xA4);
    const ENDSECTION: Self = Self(0xA5);
    const PUSHS: Self = Self(0xA6);
    const POPS: Self = Self(0xA7);
    const LOAD: Self = Self(0xA8);
    const ENDL: Self = Self(0xA9);
    const UNION: Self = Self(0xAA);
    const NEXTU: Self = Self(0xAB);
    const ENDU: Self = Self(0xAC);
    const FRAGMENT: Self = Self(0xAD);
    const ALIGN: Self = Self(0xAE);
    const INCLUDE: Self = Self(0xAF);
    const INCBIN: Self = Self(0xB0);
    const IF: Self = Self(0xB1);
    const ELIF: Self = Self(0xB2);
    const ELSE: Self = Self(0xB3);
    const ENDC: Self = Self(0xB4);
    const REPT: Self = Self(0xB5);
    const FOR: Self = Self(0xB6);
    const ENDR: Self = Self(0xB7);
    const BREAK: Self = Self(0xB8);
    const MACRO: Self = Self(0xB9);
    const ENDM: Self = Self(0xBA);
    const SHIFT: Self = Self(0xBB);
    const DEF: Self = Self(0xBC);
    const REDEF: Self = Self(0xBD);
    const EQU: Self = Self(0xBE);
    const EQUS: Self = Self(0xBF);
    const RB: Self = Self(0xC0);
    const RW: Self = Self(0xC1);
    const RL: Self = Self(0xC2);
    const RSRESET: Self = Self(0xC3);
    const RSSET: Self = Self(0xC4);
    const EXPORT: Self = Self(0xC5);
    const PURGE: Self = Self(0xC6);
    const CHARMAP: Self = Self(0xC7);
    const NEWCHARMAP: Self = Self(0xC8);
    const SETCHARMAP: Self = Self(0xC9);
    const PUSHC: Self = Self(0xCA);
    const POPC: Self = Self(0xCB);
    const ASSERT: Self = Self(0xCC);
    const STATIC_ASSERT: Self = Self(0xCD);
    const FAIL: Self = Self(0xCE);
    const WARN: Self = Self(0xCF);
    const OPT: Self = Self(0xD0);
    const PRINTLN: Self = Self(0xD1);

    const HIGH: Self = Self(0xD8);
    const LOW: Self = Self(0xD9);
    const BANK: Self = Self(0xDA);
    const SIZEOF: Self = Self(0xDB);
    const STARTOF: Self = Self(0xDC);
    const ISCONST: Self = Self(0xDD);
    const FMUL: Self = Self(0xDE);
    const FDIV: Self = Self(0xDF);
    const FMOD: Self = Self(0xE0);
    const POW: Self = Self(0xE1);
    const LOG: Self = Self(0xE2);
    const SIN: Self = Self(0xE3);
    const COS: Self = Self(0xE4);
    const TAN: Self = Self(0xE5);
    const ASIN: Self = Self(0xE6);
    const ACOS: Self = Self(0xE7);
    const ATAN: Self = Self(0xE8);
    const ATAN2: Self = Self(0xE9);
    const ROUND: Self = Self(0xEA);
    const CEIL: Self = Self(0xEB);
    const FLOOR: Self = Self(0xEC);
    const STRLEN: Self = Self(0xED);
    const STRCAT: Self = Self(0xEE);
    const STRCMP: Self = Self(0xEF);
    const STRIN: Self = Self(0xF0);
    const STRSUB: Self = Self(0xF1);
    const STRUPR: Self = Self(0xF2);
    const STRLWR: Self = Self(0xF3);
    const STRRPL: Self = Self(0xF4);
    const CHARLEN: Self = Self(0xF5);
    const CHARSUB: Self = Self(0xF6);
}

const KEYWORDS: &[(&str, Tok)] = &[
    ("DB", Tok::DB),
    ("DW", Tok::DW),
    ("DL", Tok::DL),
    ("DS", Tok::DS),
    ("SECTION", Tok::SECTION),
    ("ENDSECTION", Tok::ENDSECTION),
    ("PUSHS", Tok::PUSHS),
    ("POPS", Tok::POPS),
    ("LOAD", Tok::LOAD),
    ("ENDL", Tok::ENDL),
    ("UNION", Tok::UNION),
    ("NEXTU", Tok::NEXTU),
    ("ENDU", Tok::ENDU),
    ("FRAGMENT", Tok::FRAGMENT),
    ("ALIGN", Tok::ALIGN),
    ("INCLUDE", Tok::INCLUDE),
    ("INCBIN", Tok::INCBIN),
    ("IF", Tok::IF),
    ("ELIF", Tok::ELIF),
    ("ELSE", Tok::ELSE),
    ("ENDC", Tok::ENDC),
    ("REPT", Tok::REPT),
    ("FOR", Tok::FOR),
    ("ENDR", Tok::ENDR),
    ("BREAK", Tok::BREAK),
    ("MACRO", Tok::MACRO),
    ("ENDM", Tok::ENDM),
    ("SHIFT", Tok::SHIFT),
    ("DEF", Tok::DEF),
    ("REDEF", Tok::REDEF),
    ("EQU", Tok::EQU),
    ("EQUS", Tok::EQUS),
    ("RB", Tok::RB),
    ("RW", Tok::RW),
    // `RL` stays an identifier: it is also the rotate-left mnemonic, so
    // the DEF/REDEF parser matches it by name instead
    ("RSRESET", Tok::RSRESET),
    ("RSSET", Tok::RSSET),
    ("EXPORT", Tok::EXPORT),
    ("PURGE", Tok::PURGE),
    ("CHARMAP", Tok::CHARMAP),
    ("NEWCHARMAP", Tok::NEWCHARMAP),
    ("SETCHARMAP", Tok::SETCHARMAP),
    ("PUSHC", Tok::PUSHC),
    ("POPC", Tok::POPC),
    ("ASSERT", Tok::ASSERT),
    ("STATIC_ASSERT", Tok::STATIC_ASSERT),
    ("FAIL", Tok::FAIL),
    ("WARN", Tok::WARN),
    ("OPT", Tok::OPT),
    ("PRINTLN", Tok::PRINTLN),
    ("HIGH", Tok::HIGH),
    ("LOW", Tok::LOW),
    ("BANK", Tok::BANK),
    ("SIZEOF", Tok::SIZEOF),
    ("STARTOF", Tok::STARTOF),
    ("ISCONST", Tok::ISCONST),
    ("MUL", Tok::FMUL),
    ("FMUL", Tok::FMUL),
    ("DIV", Tok::FDIV),
    ("FDIV", Tok::FDIV),
    ("FMOD", Tok::FMOD),
    ("POW", Tok::POW),
    ("LOG", Tok::LOG),
    ("SIN", Tok::SIN),
    ("COS", Tok::COS),
    ("TAN", Tok::TAN),
    ("ASIN", Tok::ASIN),
    ("ACOS", Tok::ACOS),
    ("ATAN", Tok::ATAN),
    ("ATAN2", Tok::ATAN2),
    ("ROUND", Tok::ROUND),
    ("CEIL", Tok::CEIL),
    ("FLOOR", Tok::FLOOR),
    ("STRLEN", Tok::STRLEN),
    ("STRCAT", Tok::STRCAT),
    ("STRCMP", Tok::STRCMP),
    ("STRIN", Tok::STRIN),
    ("STRSUB", Tok::STRSUB),
    ("STRUPR", Tok::STRUPR),
    ("STRLWR", Tok::STRLWR),
    ("STRRPL", Tok::STRRPL),
    ("CHARLEN", Tok::CHARLEN),
    ("CHARSUB", Tok::CHARSUB),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mne {
    Nop,
    Ld,
    Ldh,
    Ldi,
    Ldd,
    Inc,
    Dec,
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Xor,
    Or,
    Cp,
    Jp,
    Jr,
    Call,
    Ret,
    Reti,
    Rst,
    Push,
    Pop,
    Rlc,
    Rrc,
    Rl,
    Rr,
    Sla,
    Sra,
    Swap,
    Srl,
    Bit,
    Res,
    Set,
    Daa,
    Cpl,
    Scf,
    Ccf,
    Rlca,
    Rrca,
    Rla,
    Rra,
    Halt,
    Stop,
    Di,
    Ei,
}

const MNEMONICS: &[(&str, Mne)] = &[
    ("NOP", Mne::Nop),
    ("LD", Mne::Ld),
    ("LDH", Mne::Ldh),
    ("LDI", Mne::Ldi),
    ("LDD", Mne::Ldd),
    ("INC", Mne::Inc),
    ("DEC", Mne::Dec),
    ("ADD", Mne::Add),
    ("ADC", Mne::Adc),
    ("SUB", Mne::Sub),
    ("SBC", Mne::Sbc),
    ("AND", Mne::And),
    ("XOR", Mne::Xor),
    ("OR", Mne::Or),
    ("CP", Mne::Cp),
    ("JP", Mne::Jp),
    ("JR", Mne::Jr),
    ("CALL", Mne::Call),
    ("RET", Mne::Ret),
    ("RETI", Mne::Reti),
    ("RST", Mne::Rst),
    ("PUSH", Mne::Push),
    ("POP", Mne::Pop),
    ("RLC", Mne::Rlc),
    ("RRC", Mne::Rrc),
    ("RL", Mne::Rl),
    ("RR", Mne::Rr),
    ("SLA", Mne::Sla),
    ("SRA", Mne::Sra),
    ("SWAP", Mne::Swap),
    ("SRL", Mne::Srl),
    ("BIT", Mne::Bit),
    ("RES", Mne::Res),
    ("SET", Mne::Set),
    ("DAA", Mne::Daa),
    ("CPL", Mne::Cpl),
    ("SCF", Mne::Scf),
    ("CCF", Mne::Ccf),
    ("RLCA", Mne::Rlca),
    ("RRCA", Mne::Rrca),
    ("RLA", Mne::Rla),
    ("RRA", Mne::Rra),
    ("HALT", Mne::Halt),
    ("STOP", Mne::Stop),
    ("DI", Mne::Di),
    ("EI", Mne::Ei),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn try_assemble(src: &str) -> (Asm<'static>, io::Result<()>) {
        let mut asm = Asm::new(Vec::new(), 64, Warnings::new());
        let path = asm.str_int.intern("test.asm");
        let text = asm.str_int.intern(src);
        asm.push_file(path, text);
        let result = asm.pass();
        (asm, result)
    }

    fn assemble(src: &str) -> Asm<'static> {
        let (asm, result) = try_assemble(src);
        result.unwrap();
        assert_eq!(asm.errors, 0, "unexpected assembly errors");
        asm
    }

    fn data(asm: &Asm<'_>, name: &str) -> Vec<u8> {
        asm.sections
            .iter()
            .find(|sd| sd.sect.name == name)
            .unwrap()
            .sect
            .data
            .clone()
    }

    #[test]
    fn constants_and_byte_math() {
        let asm = assemble(
            "SECTION \"A\", ROM0[$0000]\n\
             DEF N EQU 3\n\
             DB N+1, N*N, HIGH($1234), LOW($1234)\n",
        );
        assert_eq!(data(&asm, "A"), [0x04, 0x09, 0x12, 0x34]);
    }

    #[test]
    fn number_formats() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             DB %1010, &17, $0F, 'A', 1_000/10\n\
             DW `33221100\n",
        );
        assert_eq!(data(&asm, "A"), [10, 15, 15, 65, 100, 0xCC, 0xF0]);
    }

    #[test]
    fn rept_and_for() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             REPT 3\n\
             DB 1\n\
             ENDR\n\
             FOR I, 3\n\
             DB I\n\
             ENDR\n\
             FOR J, 6, 0, -2\n\
             DB J\n\
             ENDR\n",
        );
        assert_eq!(data(&asm, "A"), [1, 1, 1, 0, 1, 2, 6, 4, 2]);
    }

    #[test]
    fn rept_unique_ids_are_distinct() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             REPT 3\n\
             DB \\@\n\
             ENDR\n",
        );
        let bytes = data(&asm, "A");
        assert_eq!(bytes.len(), 3);
        assert!(bytes[0] != bytes[1] && bytes[1] != bytes[2] && bytes[0] != bytes[2]);
    }

    #[test]
    fn macro_args_and_narg() {
        let asm = assemble(
            "MACRO add3\n\
             DB \\1+\\2+\\3, _NARG\n\
             ENDM\n\
             SECTION \"A\", ROM0\n\
             add3 1, 2, 3\n",
        );
        assert_eq!(data(&asm, "A"), [6, 3]);
    }

    #[test]
    fn macro_shift() {
        let asm = assemble(
            "MACRO m\n\
             SHIFT\n\
             DB \\1, _NARG\n\
             ENDM\n\
             SECTION \"A\", ROM0\n\
             m 1, 2\n",
        );
        assert_eq!(data(&asm, "A"), [2, 1]);
    }

    #[test]
    fn macro_unique_labels() {
        let asm = assemble(
            "MACRO wait\n\
             .loop\\@\n\
             DB LOW(.loop\\@)\n\
             ENDM\n\
             SECTION \"A\", ROM0[$0000]\n\
             Main:\n\
             wait\n\
             wait\n",
        );
        assert_eq!(data(&asm, "A"), [0, 1]);
    }

    #[test]
    fn conditional_branches() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             IF 0\n\
             DB 1\n\
             ELIF 1\n\
             DB 2\n\
             ELSE\n\
             DB 3\n\
             ENDC\n\
             IF 1\n\
             DB 4\n\
             ELSE\n\
             DB 5\n\
             ENDC\n",
        );
        assert_eq!(data(&asm, "A"), [2, 4]);
    }

    #[test]
    fn nested_conditionals_skip_cleanly() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             IF 0\n\
             IF 1\n\
             DB 1\n\
             ENDC\n\
             REPT 2\n\
             DB 2\n\
             ENDR\n\
             ELSE\n\
             DB 6\n\
             ENDC\n",
        );
        assert_eq!(data(&asm, "A"), [6]);
    }

    #[test]
    fn anonymous_labels_and_jr() {
        let asm = assemble(
            "SECTION \"A\", ROM0[0]\n\
             :\n\
             jr :-\n",
        );
        assert_eq!(data(&asm, "A"), [0x18, 0xFE]);
    }

    #[test]
    fn jr_out_of_range_is_an_error() {
        let (asm, result) = try_assemble(
            "SECTION \"A\", ROM0[0]\n\
             jr $200\n",
        );
        assert!(result.is_ok());
        assert!(asm.errors > 0);
    }

    #[test]
    fn high_page_load_rewrite() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             ld a, [$FF80]\n\
             OPT !l\n\
             ld a, [$FF80]\n",
        );
        assert_eq!(data(&asm, "A"), [0xF0, 0x80, 0xFA, 0x80, 0xFF]);
    }

    #[test]
    fn instruction_forms() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             nop\n\
             ld a, b\n\
             ld b, $12\n\
             ld [hl], a\n\
             ld a, [hl+]\n\
             ld hl, $1234\n\
             add a, b\n\
             sub b\n\
             and $0F\n\
             bit 7, h\n\
             swap a\n\
             rst $18\n\
             push af\n\
             pop bc\n\
             jp hl\n\
             ret nz\n\
             reti\n\
             add sp, -2\n\
             ld hl, sp + 4\n",
        );
        assert_eq!(
            data(&asm, "A"),
            [
                0x00, // nop
                0x78, // ld a, b
                0x06, 0x12, // ld b, $12
                0x77, // ld [hl], a
                0x2A, // ld a, [hl+]
                0x21, 0x34, 0x12, // ld hl, $1234
                0x80, // add a, b
                0x90, // sub b
                0xE6, 0x0F, // and $0F
                0xCB, 0x7C, // bit 7, h
                0xCB, 0x37, // swap a
                0xDF, // rst $18
                0xF5, // push af
                0xC1, // pop bc
                0xE9, // jp hl
                0xC0, // ret nz
                0xD9, // reti
                0xE8, 0xFE, // add sp, -2
                0xF8, 0x04, // ld hl, sp + 4
            ]
        );
    }

    #[test]
    fn fixed_point_math() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             DB FMUL(2.0, 3.5) >> 16\n\
             DB FDIV(1.0, 2.0) >> 8\n\
             DB SIN(0.25) >> 16\n\
             DB POW(2.0, 10.0) >> 16\n\
             DB ROUND(1.5) >> 16, FLOOR(1.5) >> 16, CEIL(1.25) >> 16\n",
        );
        assert_eq!(data(&asm, "A"), [7, 0x80, 1, 0x00, 2, 1, 2]);
    }

    #[test]
    fn string_functions() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             DB STRLEN(\"abc\"), STRIN(\"hello\", \"ll\"), STRCMP(\"a\", \"b\") + 2\n\
             DEF S EQUS STRSUB(\"hello\", 2, 3)\n\
             DB \"{S}\"\n",
        );
        assert_eq!(data(&asm, "A"), [3, 3, 1, b'e', b'l', b'l']);
    }

    #[test]
    fn equs_expansion_replays_text() {
        let asm = assemble(
            "DEF five EQUS \"DB 5\"\n\
             SECTION \"A\", ROM0\n\
             five\n",
        );
        assert_eq!(data(&asm, "A"), [5]);
    }

    #[test]
    fn interpolation_formats_numbers_as_hex() {
        let asm = assemble(
            "DEF V EQU 10\n\
             SECTION \"A\", ROM0\n\
             DB STRLEN(\"{V}\")\n",
        );
        // "$A"
        assert_eq!(data(&asm, "A"), [2]);
    }

    #[test]
    fn charmap_encoding() {
        let asm = assemble(
            "CHARMAP \"A\", 1\n\
             CHARMAP \"BC\", 2, 3\n\
             SECTION \"A\", ROM0\n\
             DB \"ABCA\"\n",
        );
        assert_eq!(data(&asm, "A"), [1, 2, 3, 1]);
    }

    #[test]
    fn rs_counters() {
        let asm = assemble(
            "RSRESET\n\
             DEF F1 RB 1\n\
             DEF F2 RW 2\n\
             DEF SZ RB 0\n\
             SECTION \"A\", ROM0\n\
             DB F1, F2, SZ\n",
        );
        assert_eq!(data(&asm, "A"), [0, 1, 5]);
    }

    #[test]
    fn union_blocks_overlay() {
        let asm = assemble(
            "SECTION \"V\", WRAM0\n\
             UNION\n\
             DS 4\n\
             NEXTU\n\
             DS 10\n\
             ENDU\n\
             DS 1\n",
        );
        let sd = asm.sections.iter().find(|sd| sd.sect.name == "V").unwrap();
        assert_eq!(sd.sect.size, 11);
    }

    #[test]
    fn local_labels_resolve_against_scope() {
        let asm = assemble(
            "SECTION \"A\", ROM0[0]\n\
             Main:\n\
             .loop\n\
             DB 1\n\
             Other:\n\
             .loop\n\
             DB 2\n\
             DW Main.loop, Other.loop\n",
        );
        assert_eq!(data(&asm, "A"), [1, 2, 0, 0, 1, 0]);
    }

    #[test]
    fn purge_allows_redefinition() {
        let asm = assemble(
            "DEF X EQU 1\n\
             PURGE X\n\
             DEF X EQU 2\n\
             SECTION \"A\", ROM0\n\
             DB X\n",
        );
        assert_eq!(data(&asm, "A"), [2]);
    }

    #[test]
    fn purge_of_patched_symbol_is_an_error() {
        let (asm, _) = try_assemble(
            "SECTION \"A\", ROM0\n\
             DW Target\n\
             PURGE Target\n",
        );
        assert!(asm.errors > 0);
    }

    #[test]
    fn ds_fill_pattern() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             DS 4, 1, 2\n",
        );
        assert_eq!(data(&asm, "A"), [1, 2, 1, 2]);
    }

    #[test]
    fn align_pads_fixed_sections() {
        let asm = assemble(
            "SECTION \"A\", ROM0[0]\n\
             DB 1\n\
             ALIGN 2\n\
             DB 2\n",
        );
        assert_eq!(data(&asm, "A"), [1, 0, 0, 0, 2]);
    }

    #[test]
    fn align_raises_floating_section_requirement() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             DB 1\n\
             ALIGN 4\n\
             DB 2\n",
        );
        let sd = asm.sections.iter().find(|sd| sd.sect.name == "A").unwrap();
        assert_eq!(sd.sect.align, 4);
        assert_eq!(sd.sect.align_ofs, 15);
        // no padding was emitted
        assert_eq!(sd.sect.data, [1, 2]);
    }

    #[test]
    fn bank_of_fixed_section_folds() {
        let asm = assemble(
            "SECTION \"B\", ROMX, BANK[2]\n\
             DB BANK(@)\n",
        );
        assert_eq!(data(&asm, "B"), [2]);
    }

    #[test]
    fn pc_symbol_folds_when_org_is_fixed() {
        let asm = assemble(
            "SECTION \"A\", ROM0[$150]\n\
             DB 1\n\
             DW @\n",
        );
        assert_eq!(data(&asm, "A"), [0x01, 0x51, 0x01]);
    }

    #[test]
    fn forward_references_become_patches() {
        let mut asm = assemble(
            "SECTION \"A\", ROM0\n\
             DW Later\n\
             Later:\n\
             DB 9\n",
        );
        let obj = asm.to_object();
        assert_eq!(obj.sects[0].patches.len(), 1);
        assert_eq!(obj.sects[0].patches[0].kind, PatchKind::Word);
        assert_eq!(obj.sects[0].data, [0, 0, 9]);
        // `Later` resolved in place, so it serializes as a defined label
        let later = obj.syms.iter().find(|sym| sym.name == "Later").unwrap();
        assert_eq!(later.kind, ObjSymKind::Local);
        assert_eq!(later.value, 2);
    }

    #[test]
    fn undefined_symbols_serialize_as_imports() {
        let mut asm = assemble(
            "SECTION \"A\", ROM0\n\
             DW External\n",
        );
        let obj = asm.to_object();
        let sym = obj.syms.iter().find(|sym| sym.name == "External").unwrap();
        assert_eq!(sym.kind, ObjSymKind::Import);
    }

    #[test]
    fn object_roundtrips_through_the_wire_format() {
        let mut asm = assemble(
            "SECTION \"A\", ROM0\n\
             Entry::\n\
             DW External, Entry\n\
             ASSERT SIZEOF(\"A\") == 4, \"entry must live in home\"\n",
        );
        let obj = asm.to_object();
        let mut buf = Vec::new();
        obj.write(&mut buf).unwrap();
        let mut str_int = StrInterner::new();
        let mut expr_int = SliceInterner::new();
        let back = Object::read("test.o", &mut buf.as_slice(), &mut str_int, &mut expr_int)
            .unwrap();
        assert_eq!(back.syms.len(), obj.syms.len());
        assert_eq!(back.sects.len(), obj.sects.len());
        assert_eq!(back.sects[0].data, obj.sects[0].data);
        assert_eq!(back.sects[0].patches.len(), obj.sects[0].patches.len());
        assert_eq!(back.asserts.len(), 1);
        assert_eq!(back.asserts[0].msg, "entry must live in home");
    }

    #[test]
    fn fragment_sections_append() {
        let asm = assemble(
            "SECTION FRAGMENT \"A\", ROM0\n\
             DB 1\n\
             SECTION FRAGMENT \"A\", ROM0\n\
             DB 2\n",
        );
        assert_eq!(data(&asm, "A"), [1, 2]);
    }

    #[test]
    fn load_blocks_split_code_and_labels() {
        let mut asm = assemble(
            "SECTION \"Code\", ROM0[0]\n\
             LOAD \"Vars\", WRAM0[$C000]\n\
             Counter:\n\
             DB 1, 2\n\
             ENDL\n\
             DW Counter\n",
        );
        let obj = asm.to_object();
        let counter = obj.syms.iter().find(|sym| sym.name == "Counter").unwrap();
        // the label lives in the RAM section, the bytes in the ROM one
        assert_eq!(obj.sects[counter.sect as usize].name, "Vars");
        assert_eq!(counter.value, 0);
        assert_eq!(obj.sects[0].name, "Code");
        assert_eq!(obj.sects[0].data, [1, 2, 0x00, 0xC0]);
    }

    #[test]
    fn assert_failure_is_counted() {
        let (asm, _) = try_assemble("ASSERT 1 == 2, \"numbers changed\"\n");
        assert!(asm.errors > 0);
    }

    #[test]
    fn break_stops_the_innermost_loop() {
        let asm = assemble(
            "SECTION \"A\", ROM0\n\
             FOR I, 10\n\
             DB I\n\
             IF I == 2\n\
             BREAK\n\
             ENDC\n\
             ENDR\n",
        );
        assert_eq!(data(&asm, "A"), [0, 1, 2]);
    }

    #[test]
    fn includes_are_fatal_when_missing() {
        let (_, result) = try_assemble("INCLUDE \"definitely-not-here.inc\"\n");
        assert!(result.is_err());
    }
}
