//! # xendump
//!
//! Xen crash dump analysis library.
//!
//! Reconstructs human-readable hypervisor and guest state from an ELF CORE
//! snapshot of a crashed Xen host. No compiled-in type information is used:
//! structure layouts come entirely from symbol-table and field-offset
//! metadata supplied at run time.
//!
//! The pipeline has four stages:
//! - Parse the ELF CORE container ([`elf::parse`]) into memory regions and
//!   per-CPU register notes
//! - Build a [`image::MemoryImage`] over the physical regions
//! - Load symbol and offset metadata ([`symbols::SymbolTable`],
//!   [`symbols::OffsetTable`])
//! - Walk the hypervisor structures ([`decode::Decoder`]) and render the
//!   result ([`report::render_document`])
//!
//! ## Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! use xendump::decode::{DecodeConfig, Decoder};
//! use xendump::image::{MemoryImage, MmapSource};
//! use xendump::symbols::{Namespace, OffsetTable, SymbolTable};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = MmapSource::open("/proc/vmcore")?;
//! let core = xendump::elf::parse(source.bytes())?;
//! let image = MemoryImage::build(core.regions.clone(), Box::new(source))?;
//!
//! let mut symbols = SymbolTable::new();
//! symbols.load(BufReader::new(File::open("xen-syms.map")?), Namespace::Xen)?;
//! let offsets = OffsetTable::parse(BufReader::new(File::open("xen.offsets")?))?;
//!
//! let decoder = Decoder::new(&image, &symbols, &offsets, core.class, DecodeConfig::default());
//! let hypervisor = decoder.decode_hypervisor(&core)?;
//! let domains = decoder.decode_domains(&hypervisor);
//!
//! print!("{}", xendump::report::render_document(&core, &hypervisor, &domains));
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod elf;
pub mod image;
pub mod report;
pub mod symbols;

// Re-export commonly used items
#[doc(inline)]
pub use decode::{DecodeConfig, DecodeError, Decoder, DomainSummary, HypervisorReport};
#[doc(inline)]
pub use elf::{ContainerClass, CoreFile, ElfError, RegisterNote};
#[doc(inline)]
pub use image::{ImageError, MemoryImage, MemoryRegion, MmapSource};
#[doc(inline)]
pub use symbols::{Namespace, OffsetTable, SymbolError, SymbolTable};
