//! Rendering decode results into the output document.
//!
//! Pure functions from report structures to text: rendering never touches
//! the memory image. Output is deterministic (fields in offset-table order,
//! domains and VCPUs in traversal order), so two runs over the same dump
//! and metadata produce identical documents.

use std::fmt::Write;

use crate::decode::{
    CpuState, DecodedStruct, DomainReport, DomainSummary, EntityOutcome, HypervisorReport,
};
use crate::elf::CoreFile;

/// Render the complete analysis document: container summary, hypervisor
/// state, per-CPU notes, then every domain in traversal order, ending with
/// the success tally. The tally line is always present, partial failures
/// included.
pub fn render_document(core: &CoreFile, hv: &HypervisorReport, domains: &DomainSummary) -> String {
    let mut out = String::new();

    out.push_str("Xen crash-dump analysis\n");
    out.push_str("=======================\n\n");

    render_container(&mut out, core);
    render_hypervisor(&mut out, hv);
    for cpu in &hv.cpus {
        render_cpu(&mut out, cpu);
    }
    out.push('\n');

    for domain in &domains.domains {
        render_domain(&mut out, domain);
    }
    if let Some(reason) = &domains.halted {
        let _ = writeln!(out, "Domain chain halted: {}\n", reason);
    }

    let _ = writeln!(
        out,
        "Domains decoded: {} of {}",
        domains.success, domains.attempted
    );
    out
}

fn render_container(out: &mut String, core: &CoreFile) {
    let _ = writeln!(
        out,
        "Container: {} core (machine {}), page size {}",
        core.class, core.machine, core.page_size
    );
    for r in &core.regions {
        let _ = writeln!(
            out,
            "  region: {:#018x} - {:#018x} (file offset {:#x})",
            r.start,
            r.start + r.length - 1,
            r.source_offset
        );
    }
    if let Some(info) = &core.crash_info {
        let _ = writeln!(out, "  crash info note: {} bytes", info.len());
    }
    out.push('\n');
}

fn render_hypervisor(out: &mut String, hv: &HypervisorReport) {
    out.push_str("Hypervisor\n----------\n");
    let _ = writeln!(
        out,
        "anchor: {} at {:#x}, domain list head {:#x}",
        hv.anchor_symbol, hv.anchor_address, hv.domain_list_head
    );
    for global in &hv.globals {
        render_global(out, global);
    }
    if !hv.dom0_globals.is_empty() {
        out.push_str("dom0:\n");
        for global in &hv.dom0_globals {
            render_global(out, global);
        }
    }
    out.push('\n');
}

fn render_global(out: &mut String, global: &crate::decode::GlobalValue) {
    match global.address {
        Some(addr) => {
            let _ = writeln!(out, "{} @ {:#x} = {}", global.name, addr, global.value);
        }
        None => {
            let _ = writeln!(out, "{} = {}", global.name, global.value);
        }
    }
}

fn render_cpu(out: &mut String, cpu: &CpuState) {
    let _ = writeln!(out, "PCPU{} ({}, {} bytes)", cpu.cpu, cpu.kind, cpu.size);
    if !cpu.preview.is_empty() {
        let _ = writeln!(out, "  {}", hex::encode(&cpu.preview));
    }
}

fn render_struct(out: &mut String, body: &DecodedStruct, indent: &str) {
    for (field, value) in &body.fields {
        let _ = writeln!(out, "{}{} = {}", indent, field, value);
    }
}

fn render_domain(out: &mut String, domain: &DomainReport) {
    match &domain.outcome {
        EntityOutcome::Decoded(body) => {
            let _ = writeln!(out, "Domain at {:#x}", domain.address);
            render_struct(out, body, "  ");
            for vcpu in &domain.vcpus {
                match &vcpu.outcome {
                    EntityOutcome::Decoded(body) => {
                        let _ = writeln!(out, "  VCPU at {:#x}", vcpu.address);
                        render_struct(out, body, "    ");
                        if let Some(cpu) = vcpu.note_cpu {
                            let _ = writeln!(
                                out,
                                "    running on PCPU{}: crash-time registers in CPU note",
                                cpu
                            );
                        }
                    }
                    EntityOutcome::Failed { reason } => {
                        let _ =
                            writeln!(out, "  VCPU at {:#x}: FAILED: {}", vcpu.address, reason);
                    }
                }
            }
            if let Some(fault) = &domain.vcpu_chain_fault {
                let _ = writeln!(out, "  vcpu chain halted: {}", fault);
            }
            if !domain.vcpus.is_empty() || domain.vcpu_chain_fault.is_some() {
                let _ = writeln!(
                    out,
                    "  vcpus decoded: {} of {}",
                    domain.vcpus_decoded(),
                    domain.vcpus.len()
                );
            }
        }
        EntityOutcome::Failed { reason } => {
            let _ = writeln!(out, "Domain at {:#x}: FAILED: {}", domain.address, reason);
        }
    }
    out.push('\n');
}
