//! Crash analysis orchestration.
//!
//! Sequences the pipeline the way the tool has always run in the kdump
//! environment: load metadata, parse the container, build the memory image,
//! decode, render, write `xen.log` into the output directory. Xen-side
//! metadata failures are fatal; dom0-side failures only degrade domain
//! decoding.

use std::fs::{self, File};
use std::io::BufReader;

use anyhow::{Context, Result};
use tracing::{info, warn};

use xendump::decode::{DecodeConfig, Decoder};
use xendump::image::{MemoryImage, MmapSource};
use xendump::symbols::{Namespace, OffsetTable, SymbolTable};

use crate::cli::Cli;

pub fn run(args: &Cli) -> Result<()> {
    fs::create_dir_all(&args.outdir).with_context(|| {
        format!(
            "unable to create output directory \"{}\"",
            args.outdir.display()
        )
    })?;
    info!("output directory: {}/", args.outdir.display());
    info!("Xen symbol table: {}", args.xen_symtab.display());
    info!("Xen offsets file: {}", args.xen_offsets.display());
    info!("dom0 symbol table: {}", args.dom0_symtab.display());
    info!("ELF CORE crash file: {}", args.core.display());

    let mut symbols = SymbolTable::new();
    let xen_symtab = File::open(&args.xen_symtab)
        .with_context(|| format!("unable to open {}", args.xen_symtab.display()))?;
    symbols
        .load(BufReader::new(xen_symtab), Namespace::Xen)
        .context("failed to parse the Xen symbol table file")?;

    // Dom0 metadata problems degrade domain-level decoding but never stop
    // the hypervisor-side analysis.
    match File::open(&args.dom0_symtab) {
        Ok(f) => {
            if let Err(e) = symbols.load(BufReader::new(f), Namespace::Dom0) {
                warn!("failed to parse the dom0 symbol table file: {}", e);
            }
        }
        Err(e) => warn!(
            "unable to open dom0 symbol table {}: {}",
            args.dom0_symtab.display(),
            e
        ),
    }

    let offsets_file = File::open(&args.xen_offsets)
        .with_context(|| format!("unable to open {}", args.xen_offsets.display()))?;
    let offsets = OffsetTable::parse(BufReader::new(offsets_file))
        .context("failed to parse the Xen offsets file")?;

    let source = MmapSource::open(&args.core)
        .with_context(|| format!("unable to open crash file {}", args.core.display()))?;
    let core = xendump::elf::parse(source.bytes()).context("failed to parse the crash file")?;
    let image = MemoryImage::build(core.regions.clone(), Box::new(source))
        .context("failed to set up memory regions from crash file")?;

    let config = DecodeConfig {
        anchor_symbol: args.anchor.clone(),
        dom0_globals: args.dom0_globals.clone(),
        ..DecodeConfig::default()
    };
    let decoder = Decoder::new(&image, &symbols, &offsets, core.class, config);
    let hypervisor = decoder
        .decode_hypervisor(&core)
        .context("failed to decode xen structures")?;
    let domains = decoder.decode_domains(&hypervisor);

    let document = xendump::report::render_document(&core, &hypervisor, &domains);
    let out_path = args.outdir.join("xen.log");
    fs::write(&out_path, document)
        .with_context(|| format!("unable to write {}", out_path.display()))?;
    info!("wrote report to {}", out_path.display());
    info!(
        "successfully decoded {} of {} domains",
        domains.success, domains.attempted
    );
    info!("COMPLETE");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;

    /// Minimal little-endian ELF64 core: one PT_LOAD segment carrying
    /// `contents` at physical address `paddr`.
    fn write_core(path: &Path, paddr: u64, contents: &[u8]) {
        let mut out = vec![0u8; 64];
        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1;
        out[16..18].copy_from_slice(&4u16.to_le_bytes()); // ET_CORE
        out[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        out[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let mut phdr = [0u8; 56];
        phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        phdr[8..16].copy_from_slice(&120u64.to_le_bytes()); // p_offset
        phdr[24..32].copy_from_slice(&paddr.to_le_bytes());
        phdr[32..40].copy_from_slice(&(contents.len() as u64).to_le_bytes());
        phdr[40..48].copy_from_slice(&(contents.len() as u64).to_le_bytes());
        out.extend_from_slice(&phdr);
        out.extend_from_slice(contents);
        fs::write(path, out).unwrap();
    }

    #[test]
    fn pipeline_writes_report_from_synthetic_dump() {
        let dir = tempfile::tempdir().unwrap();

        // Physical memory at 0x1000: the anchor pointer, then one domain
        // with a null next link and no vcpus.
        let mut ram = vec![0u8; 0x100];
        ram[0..8].copy_from_slice(&0x1020u64.to_le_bytes()); // domain_list
        ram[0x20..0x22].copy_from_slice(&7u16.to_le_bytes()); // domain_id
        write_core(&dir.path().join("vmcore"), 0x1000, &ram);

        fs::write(dir.path().join("xen.map"), "1000 D domain_list\n").unwrap();
        fs::write(
            dir.path().join("xen.offsets"),
            "domain.domain_id 0x0 2\n\
             domain.next_in_list 0x8 ptr\n\
             domain.vcpu_list 0x10 ptr\n\
             vcpu.vcpu_id 0x0 4\n\
             vcpu.next_in_list 0x8 ptr\n",
        )
        .unwrap();

        let args = Cli {
            core: dir.path().join("vmcore"),
            outdir: dir.path().join("out"),
            xen_symtab: dir.path().join("xen.map"),
            xen_offsets: dir.path().join("xen.offsets"),
            // Absent on purpose: dom0 metadata failures must not be fatal.
            dom0_symtab: dir.path().join("dom0.map"),
            anchor: "domain_list".to_string(),
            dom0_globals: Vec::new(),
            quiet: true,
            verbose: 0,
        };
        run(&args).unwrap();

        let report = fs::read_to_string(dir.path().join("out/xen.log")).unwrap();
        assert!(report.contains("Domain at 0x1020"));
        assert!(report.contains("domain_id = 0x7"));
        assert!(report.contains("Domains decoded: 1 of 1"));
    }
}
