//! ELF CORE crash-container parsing.
//!
//! A Xen crash dump (`/proc/vmcore` in the kdump environment) is an ELF
//! core file: PT_LOAD program headers describe where physical memory ranges
//! sit in the file, and PT_NOTE segments carry per-CPU register state
//! captured at crash time. Both 32-bit and 64-bit containers are accepted;
//! every field is widened to 64 bits here so later stages are
//! class-independent.
//!
//! The exact byte layout this module accepts is documented in `FORMATS.md`.

use byteorder::{ByteOrder, LE};
use thiserror::Error;
use tracing::{debug, info};

use crate::image::{MemoryRegion, Width};

/// Errors from container identification and parsing.
#[derive(Debug, Error)]
pub enum ElfError {
    /// The magic bytes are not `\x7fELF`.
    #[error("not an ELF file (bad magic)")]
    UnrecognizedFormat,

    /// Recognisably ELF, but not a variant this tool handles.
    #[error("unsupported ELF variant: {0}")]
    UnsupportedClass(String),

    /// A declared header, table or segment extends past the end of the file.
    #[error("truncated file: {what} needs {need:#x} bytes, have {have:#x}")]
    TruncatedFile {
        what: &'static str,
        need: u64,
        have: u64,
    },

    /// A note header is inconsistent with its segment.
    #[error("invalid note segment at offset {offset:#x}: {reason}")]
    InvalidNote { offset: u64, reason: String },
}

/// 32-bit vs 64-bit container variant.
///
/// Selected once by [`identify`]; everything downstream operates on widened
/// 64-bit addresses and only consults the class for pointer-field widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerClass {
    Elf32,
    Elf64,
}

impl ContainerClass {
    /// Width of a pointer-sized field in dumped structures.
    pub fn pointer_width(self) -> Width {
        match self {
            ContainerClass::Elf32 => Width::Dword,
            ContainerClass::Elf64 => Width::Qword,
        }
    }
}

impl std::fmt::Display for ContainerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerClass::Elf32 => write!(f, "ELF32"),
            ContainerClass::Elf64 => write!(f, "ELF64"),
        }
    }
}

/// Kind of a per-CPU register note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    /// `CORE` / NT_PRSTATUS: kernel-format register block.
    Prstatus,
    /// `Xen` / XEN_ELFNOTE_CRASH_REGS: hypervisor crash-time registers.
    XenCrashRegs,
}

impl std::fmt::Display for NoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoteKind::Prstatus => write!(f, "PRSTATUS"),
            NoteKind::XenCrashRegs => write!(f, "Xen crash regs"),
        }
    }
}

/// One per-CPU register note.
///
/// The payload is architecture-selected and kept opaque; the CPU index is
/// assigned by order of appearance within the container, which is how kdump
/// emits them.
#[derive(Debug, Clone)]
pub struct RegisterNote {
    /// Logical CPU index.
    pub cpu: u32,
    pub kind: NoteKind,
    /// Raw note descriptor bytes.
    pub desc: Vec<u8>,
}

/// Parsed crash container: region table, register notes and geometry.
#[derive(Debug)]
pub struct CoreFile {
    pub class: ContainerClass,
    /// `e_machine` value, recorded but otherwise opaque.
    pub machine: u16,
    /// Physical memory regions, in file order.
    pub regions: Vec<MemoryRegion>,
    /// Per-CPU register notes, in file order.
    pub registers: Vec<RegisterNote>,
    /// Raw `XEN_ELFNOTE_CRASH_INFO` payload, if the dump carries one.
    pub crash_info: Option<Vec<u8>>,
    /// Page size of the dumped host.
    pub page_size: u64,
}

impl CoreFile {
    /// Number of physical CPUs, derived from PRSTATUS note count.
    pub fn cpu_count(&self) -> u32 {
        self.registers
            .iter()
            .filter(|n| n.kind == NoteKind::Prstatus)
            .count() as u32
    }

    /// The PRSTATUS note for a given physical CPU, if captured.
    pub fn prstatus_for(&self, cpu: u32) -> Option<&RegisterNote> {
        self.registers
            .iter()
            .find(|n| n.kind == NoteKind::Prstatus && n.cpu == cpu)
    }
}

const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_CORE: u16 = 4;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_PRSTATUS: u32 = 1;
const XEN_ELFNOTE_CRASH_INFO: u32 = 0x0100_0001;
const XEN_ELFNOTE_CRASH_REGS: u32 = 0x0100_0002;

/// Hosts this tool analyses use 4K pages; the container itself carries no
/// page-size field.
const DEFAULT_PAGE_SIZE: u64 = 4096;

const EHDR_SIZE_32: u64 = 52;
const EHDR_SIZE_64: u64 = 64;
const PHENT_SIZE_32: u64 = 32;
const PHENT_SIZE_64: u64 = 56;

/// Inspect the identification bytes and select a container class.
///
/// Checks the magic / class / machine-word triplet: the file must be ELF,
/// little-endian, of core type, and of a class we know how to walk. The
/// machine value itself is not restricted; register payloads stay opaque.
pub fn identify(raw: &[u8]) -> Result<ContainerClass, ElfError> {
    if raw.len() < 20 {
        return Err(ElfError::TruncatedFile {
            what: "ELF identification",
            need: 20,
            have: raw.len() as u64,
        });
    }
    if raw[0..4] != ELFMAG {
        return Err(ElfError::UnrecognizedFormat);
    }

    let class = match raw[4] {
        ELFCLASS32 => ContainerClass::Elf32,
        ELFCLASS64 => ContainerClass::Elf64,
        c => {
            return Err(ElfError::UnsupportedClass(format!(
                "unknown EI_CLASS {}",
                c
            )))
        }
    };
    if raw[5] != ELFDATA2LSB {
        return Err(ElfError::UnsupportedClass(format!(
            "non-little-endian data encoding {}",
            raw[5]
        )));
    }
    let e_type = LE::read_u16(&raw[16..18]);
    if e_type != ET_CORE {
        return Err(ElfError::UnsupportedClass(format!(
            "e_type {} is not a core file",
            e_type
        )));
    }

    Ok(class)
}

fn need(data: &[u8], what: &'static str, end: u64) -> Result<(), ElfError> {
    if end > data.len() as u64 {
        return Err(ElfError::TruncatedFile {
            what,
            need: end,
            have: data.len() as u64,
        });
    }
    Ok(())
}

/// Program header with every field already widened to 64 bits.
struct Phdr {
    p_type: u32,
    p_offset: u64,
    p_paddr: u64,
    p_filesz: u64,
}

fn read_phdr(class: ContainerClass, ent: &[u8]) -> Phdr {
    match class {
        ContainerClass::Elf64 => Phdr {
            p_type: LE::read_u32(&ent[0..4]),
            p_offset: LE::read_u64(&ent[8..16]),
            p_paddr: LE::read_u64(&ent[24..32]),
            p_filesz: LE::read_u64(&ent[32..40]),
        },
        ContainerClass::Elf32 => Phdr {
            p_type: LE::read_u32(&ent[0..4]),
            p_offset: u64::from(LE::read_u32(&ent[4..8])),
            p_paddr: u64::from(LE::read_u32(&ent[12..16])),
            p_filesz: u64::from(LE::read_u32(&ent[16..20])),
        },
    }
}

/// Parse a crash container into regions, register notes and geometry.
///
/// Pure transform from bytes to metadata; the same bytes later back the
/// [`crate::image::MemoryImage`] built from the returned region table.
pub fn parse(data: &[u8]) -> Result<CoreFile, ElfError> {
    let class = identify(data)?;

    let (ehdr_size, phent_expect) = match class {
        ContainerClass::Elf32 => (EHDR_SIZE_32, PHENT_SIZE_32),
        ContainerClass::Elf64 => (EHDR_SIZE_64, PHENT_SIZE_64),
    };
    need(data, "ELF header", ehdr_size)?;

    let machine = LE::read_u16(&data[18..20]);
    let (e_phoff, e_phentsize, e_phnum) = match class {
        ContainerClass::Elf64 => (
            LE::read_u64(&data[32..40]),
            u64::from(LE::read_u16(&data[54..56])),
            u64::from(LE::read_u16(&data[56..58])),
        ),
        ContainerClass::Elf32 => (
            u64::from(LE::read_u32(&data[28..32])),
            u64::from(LE::read_u16(&data[42..44])),
            u64::from(LE::read_u16(&data[44..46])),
        ),
    };

    if e_phentsize < phent_expect {
        return Err(ElfError::UnsupportedClass(format!(
            "program header entries of {} bytes, expected at least {}",
            e_phentsize, phent_expect
        )));
    }
    let table_end = e_phoff
        .checked_add(e_phnum.checked_mul(e_phentsize).ok_or(
            ElfError::TruncatedFile {
                what: "program header table",
                need: u64::MAX,
                have: data.len() as u64,
            },
        )?)
        .ok_or(ElfError::TruncatedFile {
            what: "program header table",
            need: u64::MAX,
            have: data.len() as u64,
        })?;
    need(data, "program header table", table_end)?;

    let mut regions = Vec::new();
    let mut registers = Vec::new();
    let mut crash_info = None;

    for idx in 0..e_phnum {
        let off = (e_phoff + idx * e_phentsize) as usize;
        let phdr = read_phdr(class, &data[off..off + phent_expect as usize]);

        match phdr.p_type {
            PT_LOAD => {
                if phdr.p_filesz == 0 {
                    continue;
                }
                let end = phdr.p_offset.checked_add(phdr.p_filesz).ok_or(
                    ElfError::TruncatedFile {
                        what: "PT_LOAD segment",
                        need: u64::MAX,
                        have: data.len() as u64,
                    },
                )?;
                need(data, "PT_LOAD segment", end)?;
                debug!(
                    paddr = format_args!("{:#x}", phdr.p_paddr),
                    length = format_args!("{:#x}", phdr.p_filesz),
                    offset = format_args!("{:#x}", phdr.p_offset),
                    "memory region"
                );
                regions.push(MemoryRegion {
                    start: phdr.p_paddr,
                    length: phdr.p_filesz,
                    source_offset: phdr.p_offset,
                });
            }
            PT_NOTE => {
                let end = phdr.p_offset.checked_add(phdr.p_filesz).ok_or(
                    ElfError::TruncatedFile {
                        what: "PT_NOTE segment",
                        need: u64::MAX,
                        have: data.len() as u64,
                    },
                )?;
                need(data, "PT_NOTE segment", end)?;
                parse_notes(
                    &data[phdr.p_offset as usize..end as usize],
                    phdr.p_offset,
                    &mut registers,
                    &mut crash_info,
                )?;
            }
            _ => {}
        }
    }

    let core = CoreFile {
        class,
        machine,
        regions,
        registers,
        crash_info,
        page_size: DEFAULT_PAGE_SIZE,
    };
    info!(
        "parsed {} core: {} regions, {} CPUs",
        core.class,
        core.regions.len(),
        core.cpu_count()
    );
    Ok(core)
}

fn align4(v: u64) -> u64 {
    (v + 3) & !3
}

/// Walk one PT_NOTE segment, collecting per-CPU register notes.
///
/// CPU indices are assigned per note kind in order of appearance. Notes we
/// do not care about are still validated and stepped over; a header whose
/// declared sizes run past the segment is `InvalidNote`.
fn parse_notes(
    seg: &[u8],
    seg_offset: u64,
    registers: &mut Vec<RegisterNote>,
    crash_info: &mut Option<Vec<u8>>,
) -> Result<(), ElfError> {
    let mut cur: u64 = 0;
    let mut prstatus_seen: u32 = 0;
    let mut crash_regs_seen: u32 = 0;

    while cur < seg.len() as u64 {
        let remaining = seg.len() as u64 - cur;
        if remaining < 12 {
            // Some dumpers round the segment up with zero padding.
            if seg[cur as usize..].iter().all(|&b| b == 0) {
                break;
            }
            return Err(ElfError::InvalidNote {
                offset: seg_offset + cur,
                reason: format!("{} trailing bytes, too short for a note header", remaining),
            });
        }

        let hdr = &seg[cur as usize..cur as usize + 12];
        let namesz = u64::from(LE::read_u32(&hdr[0..4]));
        let descsz = u64::from(LE::read_u32(&hdr[4..8]));
        let ntype = LE::read_u32(&hdr[8..12]);

        if namesz == 0 && descsz == 0 && ntype == 0 {
            // All-zero header: padding terminator.
            break;
        }

        let name_end = 12u64.checked_add(namesz);
        let desc_start = name_end.map(align4);
        let desc_end = desc_start.and_then(|s| s.checked_add(descsz));
        let next = desc_end.map(align4);
        let (name_end, desc_start, desc_end, next) = match (name_end, desc_start, desc_end, next) {
            (Some(a), Some(b), Some(c), Some(d)) if d <= remaining => (a, b, c, d),
            _ => {
                return Err(ElfError::InvalidNote {
                    offset: seg_offset + cur,
                    reason: format!(
                        "declared sizes (namesz {:#x}, descsz {:#x}) exceed segment",
                        namesz, descsz
                    ),
                })
            }
        };

        let name_bytes = &seg[(cur + 12) as usize..(cur + name_end) as usize];
        let name = name_bytes.split(|&b| b == 0).next().unwrap_or(&[]);
        let desc = seg[(cur + desc_start) as usize..(cur + desc_end) as usize].to_vec();

        match (name, ntype) {
            (b"CORE", NT_PRSTATUS) => {
                debug!(cpu = prstatus_seen, bytes = desc.len(), "PRSTATUS note");
                registers.push(RegisterNote {
                    cpu: prstatus_seen,
                    kind: NoteKind::Prstatus,
                    desc,
                });
                prstatus_seen += 1;
            }
            (b"Xen", XEN_ELFNOTE_CRASH_REGS) => {
                debug!(cpu = crash_regs_seen, bytes = desc.len(), "crash regs note");
                registers.push(RegisterNote {
                    cpu: crash_regs_seen,
                    kind: NoteKind::XenCrashRegs,
                    desc,
                });
                crash_regs_seen += 1;
            }
            (b"Xen", XEN_ELFNOTE_CRASH_INFO) => {
                if crash_info.is_none() {
                    *crash_info = Some(desc);
                }
            }
            _ => {}
        }

        cur += next;
    }

    Ok(())
}
