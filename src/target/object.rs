//! Minimal ELF64 relocatable object writer and symbol reader.
//!
//! Layout: ELF header, `.text`, `.symtab`, `.strtab`, `.shstrtab`, then the
//! section header table. Every function gets a global `STT_FUNC` symbol
//! whose value is its offset in `.text`.

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const TEXT_ALIGN: usize = 16;

const ET_REL: u16 = 1;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;

/// Section indices in the header table.
const TEXT_INDEX: u16 = 1;
const STRTAB_INDEX: u32 = 3;
const SHSTRTAB_INDEX: u16 = 4;

fn align_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// A string table under construction.
struct StrTab {
    bytes: Vec<u8>,
}

impl StrTab {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let at = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        at
    }
}

struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

impl SectionHeader {
    fn null() -> Self {
        Self {
            name: 0,
            kind: 0,
            flags: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            align: 0,
            entsize: 0,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.name);
        put_u32(buf, self.kind);
        put_u64(buf, self.flags);
        put_u64(buf, 0);
        put_u64(buf, self.offset);
        put_u64(buf, self.size);
        put_u32(buf, self.link);
        put_u32(buf, self.info);
        put_u64(buf, self.align);
        put_u64(buf, self.entsize);
    }
}

/// Write a relocatable object holding `functions` (name, code bytes).
pub fn write_relocatable(e_machine: u16, functions: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![0u8; EHDR_SIZE];

    // .text
    let text_offset = out.len();
    let mut symbols = Vec::with_capacity(functions.len());
    for (name, code) in functions {
        align_to(&mut out, TEXT_ALIGN);
        let value = (out.len() - text_offset) as u64;
        out.extend_from_slice(code);
        symbols.push((name.as_str(), value, code.len() as u64));
    }
    let text_size = out.len() - text_offset;

    // .strtab and .symtab
    let mut strtab = StrTab::new();
    let mut symtab = vec![0u8; SYM_SIZE];
    for (name, value, size) in &symbols {
        put_u32(&mut symtab, strtab.add(name));
        symtab.push((STB_GLOBAL << 4) | STT_FUNC);
        symtab.push(0);
        put_u16(&mut symtab, TEXT_INDEX);
        put_u64(&mut symtab, *value);
        put_u64(&mut symtab, *size);
    }
    align_to(&mut out, 8);
    let symtab_offset = out.len();
    out.extend_from_slice(&symtab);
    let strtab_offset = out.len();
    out.extend_from_slice(&strtab.bytes);

    // .shstrtab
    let mut shstrtab = StrTab::new();
    let text_name = shstrtab.add(".text");
    let symtab_name = shstrtab.add(".symtab");
    let strtab_name = shstrtab.add(".strtab");
    let shstrtab_name = shstrtab.add(".shstrtab");
    let shstrtab_offset = out.len();
    out.extend_from_slice(&shstrtab.bytes);

    let headers = [
        SectionHeader::null(),
        SectionHeader {
            name: text_name,
            kind: SHT_PROGBITS,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            offset: text_offset as u64,
            size: text_size as u64,
            link: 0,
            info: 0,
            align: TEXT_ALIGN as u64,
            entsize: 0,
        },
        SectionHeader {
            name: symtab_name,
            kind: SHT_SYMTAB,
            flags: 0,
            offset: symtab_offset as u64,
            size: symtab.len() as u64,
            link: STRTAB_INDEX,
            // Index of the first global symbol: only the null symbol is local.
            info: 1,
            align: 8,
            entsize: SYM_SIZE as u64,
        },
        SectionHeader {
            name: strtab_name,
            kind: SHT_STRTAB,
            flags: 0,
            offset: strtab_offset as u64,
            size: strtab.bytes.len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        },
        SectionHeader {
            name: shstrtab_name,
            kind: SHT_STRTAB,
            flags: 0,
            offset: shstrtab_offset as u64,
            size: shstrtab.bytes.len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        },
    ];
    align_to(&mut out, 8);
    let shoff = out.len();
    for h in &headers {
        h.write(&mut out);
    }

    let mut ehdr = Vec::with_capacity(EHDR_SIZE);
    ehdr.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    ehdr.extend_from_slice(&[0; 8]);
    put_u16(&mut ehdr, ET_REL);
    put_u16(&mut ehdr, e_machine);
    put_u32(&mut ehdr, 1);
    put_u64(&mut ehdr, 0);
    put_u64(&mut ehdr, 0);
    put_u64(&mut ehdr, shoff as u64);
    put_u32(&mut ehdr, 0);
    put_u16(&mut ehdr, EHDR_SIZE as u16);
    put_u16(&mut ehdr, 0);
    put_u16(&mut ehdr, 0);
    put_u16(&mut ehdr, SHDR_SIZE as u16);
    put_u16(&mut ehdr, headers.len() as u16);
    put_u16(&mut ehdr, SHSTRTAB_INDEX);
    out[..EHDR_SIZE].copy_from_slice(&ehdr);
    out
}

/// A symbol read back from an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
}

fn read_u16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(b: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(at..at + 8)?.try_into().ok()?))
}

/// `e_machine` of an ELF64 little-endian object, if `bytes` is one.
pub fn elf_machine(bytes: &[u8]) -> Option<u16> {
    if bytes.get(..6)? != [0x7f, b'E', b'L', b'F', 2, 1] {
        return None;
    }
    read_u16(bytes, 18)
}

/// Function symbols of an ELF64 little-endian object.
pub fn read_function_symbols(bytes: &[u8]) -> Option<Vec<ObjectSymbol>> {
    elf_machine(bytes)?;
    let shoff = read_u64(bytes, 40)? as usize;
    let shnum = read_u16(bytes, 60)? as usize;
    let section = |i: usize| shoff + i * SHDR_SIZE;

    let symtab = (0..shnum).find(|&i| read_u32(bytes, section(i) + 4) == Some(SHT_SYMTAB))?;
    let sym_off = read_u64(bytes, section(symtab) + 24)? as usize;
    let sym_size = read_u64(bytes, section(symtab) + 32)? as usize;
    let str_index = read_u32(bytes, section(symtab) + 40)? as usize;
    let str_off = read_u64(bytes, section(str_index) + 24)? as usize;

    let mut out = Vec::new();
    for i in 1..sym_size / SYM_SIZE {
        let at = sym_off + i * SYM_SIZE;
        if bytes.get(at + 4)? & 0xf != STT_FUNC {
            continue;
        }
        let name_at = str_off + read_u32(bytes, at)? as usize;
        let name_len = bytes.get(name_at..)?.iter().position(|&c| c == 0)?;
        out.push(ObjectSymbol {
            name: String::from_utf8_lossy(&bytes[name_at..name_at + name_len]).into_owned(),
            value: read_u64(bytes, at + 8)?,
            size: read_u64(bytes, at + 16)?,
        });
    }
    Some(out)
}
