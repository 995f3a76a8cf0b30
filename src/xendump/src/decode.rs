//! Structure-decoding engine.
//!
//! Walks the hypervisor's global structures through the memory image using
//! only run-time metadata: the anchor symbol gives the entry point, the
//! offset table gives field layouts, and linked structures are enumerated
//! by chasing `next` pointers.
//!
//! Decoding is best-effort by design. A missing symbol or field offset is a
//! decode gap (recorded as unknown), and a corrupt domain or VCPU is
//! recorded as failed without disturbing its siblings: metadata drifting
//! from the running hypervisor build is a normal operating condition here,
//! and one trashed control structure is often precisely what crashed the
//! host.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::elf::{ContainerClass, CoreFile, NoteKind};
use crate::image::{ImageError, MemoryImage, Scalar, Width};
use crate::symbols::{FieldWidth, Namespace, OffsetTable, SymbolError, SymbolTable};

/// Errors from hypervisor and domain decoding.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The configured anchor symbol is absent. Fatal: without it there is
    /// nothing to report.
    #[error("anchor symbol '{0}' is not present in the Xen symbol table")]
    MissingAnchor(String),

    /// A chain revisited a node or exceeded its traversal cap.
    #[error("corrupt chain at {head:#x}: {reason}")]
    CorruptChain { head: u64, reason: String },

    /// No layout entries at all for a structure kind.
    #[error("no field layout for struct '{0}'")]
    NoLayout(String),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

/// Tunables for a decode run.
///
/// Which symbols are mandatory shifts across hypervisor versions, so the
/// anchor and the sampled globals are configuration rather than code.
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Symbol holding the head of the domain list. Mandatory.
    pub anchor_symbol: String,
    /// Hypervisor globals sampled into the report. All optional; an
    /// unresolvable name becomes a decode gap.
    pub globals: Vec<String>,
    /// Dom0 kernel globals to sample, resolved in the dom0 namespace.
    pub dom0_globals: Vec<String>,
    /// Cap on domain-chain traversal before declaring the chain corrupt.
    pub max_domains: usize,
    /// Cap on each VCPU-chain traversal.
    pub max_vcpus: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        DecodeConfig {
            anchor_symbol: "domain_list".to_string(),
            globals: vec!["max_page".to_string(), "total_pages".to_string()],
            dom0_globals: Vec::new(),
            max_domains: 256,
            max_vcpus: 512,
        }
    }
}

/// A decoded field value, widened to 64 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    Pointer(u64),
    /// Decode gap: the field could not be resolved or read.
    Unknown(String),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Unsigned(v) => write!(f, "{:#x}", v),
            FieldValue::Signed(v) => write!(f, "{}", v),
            FieldValue::Pointer(v) => write!(f, "{:#x}", v),
            FieldValue::Unknown(reason) => write!(f, "<unknown: {}>", reason),
        }
    }
}

/// Which structure kind an instance was decoded as. The name doubles as
/// the struct key in the offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructKind {
    Domain,
    Vcpu,
}

impl StructKind {
    pub fn name(self) -> &'static str {
        match self {
            StructKind::Domain => "domain",
            StructKind::Vcpu => "vcpu",
        }
    }
}

/// One decoded structure instance: field values in offset-table order,
/// tagged with the source address.
#[derive(Debug, Clone)]
pub struct DecodedStruct {
    pub kind: StructKind,
    pub address: u64,
    pub fields: Vec<(String, FieldValue)>,
}

impl DecodedStruct {
    /// Value of a field by name, if the table listed it.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find_map(|(f, v)| (f == name).then_some(v))
    }

    /// Raw unsigned interpretation of a field.
    pub fn unsigned(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            FieldValue::Unsigned(v) | FieldValue::Pointer(v) => Some(*v),
            FieldValue::Signed(v) => Some(*v as u64),
            FieldValue::Unknown(_) => None,
        }
    }
}

/// Outcome of decoding one entity (domain or VCPU).
#[derive(Debug, Clone)]
pub enum EntityOutcome {
    Decoded(DecodedStruct),
    Failed { reason: String },
}

impl EntityOutcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, EntityOutcome::Decoded(_))
    }
}

/// A sampled hypervisor global.
#[derive(Debug, Clone)]
pub struct GlobalValue {
    pub name: String,
    /// Resolved address, when the symbol was known.
    pub address: Option<u64>,
    pub value: FieldValue,
}

/// Register state of one physical CPU, lifted from a container note.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub cpu: u32,
    pub kind: NoteKind,
    /// Size of the opaque register payload.
    pub size: usize,
    /// Leading payload bytes for the rendered hex preview.
    pub preview: Vec<u8>,
}

/// Hypervisor-wide decode result (pass 1).
#[derive(Debug)]
pub struct HypervisorReport {
    pub anchor_symbol: String,
    pub anchor_address: u64,
    /// First node of the domain chain; zero when no domains exist.
    pub domain_list_head: u64,
    pub globals: Vec<GlobalValue>,
    /// Sampled dom0 kernel globals, when configured.
    pub dom0_globals: Vec<GlobalValue>,
    pub cpus: Vec<CpuState>,
}

/// One VCPU's decode result.
#[derive(Debug)]
pub struct VcpuReport {
    pub address: u64,
    pub outcome: EntityOutcome,
    /// Physical CPU whose register note covers this VCPU, when it was
    /// running at crash time.
    pub note_cpu: Option<u32>,
}

/// One domain's decode result, owning its VCPU sub-reports.
#[derive(Debug)]
pub struct DomainReport {
    pub address: u64,
    pub outcome: EntityOutcome,
    pub vcpus: Vec<VcpuReport>,
    /// Why VCPU enumeration stopped early, if it did.
    pub vcpu_chain_fault: Option<String>,
}

impl DomainReport {
    pub fn vcpus_decoded(&self) -> u32 {
        self.vcpus.iter().filter(|v| v.outcome.is_decoded()).count() as u32
    }

    /// Fully decoded: body, every VCPU, and an intact VCPU chain.
    pub fn is_success(&self) -> bool {
        self.outcome.is_decoded()
            && self.vcpu_chain_fault.is_none()
            && self.vcpus.iter().all(|v| v.outcome.is_decoded())
    }
}

/// Domain enumeration result (pass 2), with the success tally.
#[derive(Debug)]
pub struct DomainSummary {
    pub domains: Vec<DomainReport>,
    pub attempted: u32,
    pub success: u32,
    /// Why the domain chain itself stopped early, if it did.
    pub halted: Option<String>,
}

/// Bounded linked-chain traversal with cycle detection.
///
/// Per traversal the states are: Start -> Resolving(head) ->
/// {Decoding(node) -> Resolving(next)}* -> Done | Aborted. `current`
/// yields the node being decoded; `advance` moves to the next link and
/// aborts on a revisit or on exceeding the cap. The sentinel is null or a
/// return to the head.
struct ChainWalker {
    head: u64,
    current: Option<u64>,
    visited: HashSet<u64>,
    max: usize,
}

impl ChainWalker {
    fn new(head: u64, max: usize) -> Self {
        let mut visited = HashSet::new();
        visited.insert(head);
        ChainWalker {
            head,
            current: (head != 0).then_some(head),
            visited,
            max,
        }
    }

    fn current(&self) -> Option<u64> {
        self.current
    }

    fn advance(&mut self, next: u64) -> Result<(), DecodeError> {
        if next == 0 || next == self.head {
            self.current = None;
            return Ok(());
        }
        if !self.visited.insert(next) {
            self.current = None;
            return Err(DecodeError::CorruptChain {
                head: self.head,
                reason: format!("node {:#x} revisited (pointer cycle)", next),
            });
        }
        if self.visited.len() > self.max {
            self.current = None;
            return Err(DecodeError::CorruptChain {
                head: self.head,
                reason: format!("more than {} nodes", self.max),
            });
        }
        self.current = Some(next);
        Ok(())
    }
}

/// The decoding engine. Read-only over the image and metadata, so one
/// decoder serves both passes.
pub struct Decoder<'a> {
    image: &'a MemoryImage,
    symbols: &'a SymbolTable,
    offsets: &'a OffsetTable,
    ptr_width: Width,
    config: DecodeConfig,
}

impl<'a> Decoder<'a> {
    pub fn new(
        image: &'a MemoryImage,
        symbols: &'a SymbolTable,
        offsets: &'a OffsetTable,
        class: ContainerClass,
        config: DecodeConfig,
    ) -> Self {
        Decoder {
            image,
            symbols,
            offsets,
            ptr_width: class.pointer_width(),
            config,
        }
    }

    /// Pass 1: hypervisor-wide decode.
    ///
    /// Resolves the anchor symbol (fatal if absent), reads the domain-list
    /// head, samples the configured globals (gaps on drift) and lifts
    /// per-CPU register state from the container notes.
    pub fn decode_hypervisor(&self, core: &CoreFile) -> Result<HypervisorReport, DecodeError> {
        let anchor_address = self
            .symbols
            .resolve_address(Namespace::Xen, &self.config.anchor_symbol)
            .map_err(|_| DecodeError::MissingAnchor(self.config.anchor_symbol.clone()))?;
        let domain_list_head = self.image.read_pointer(anchor_address, self.ptr_width)?;
        info!(
            "anchor {} at {:#x}, domain list head {:#x}",
            self.config.anchor_symbol, anchor_address, domain_list_head
        );

        let globals = self.sample_globals(Namespace::Xen, &self.config.globals);
        let dom0_globals = self.sample_globals(Namespace::Dom0, &self.config.dom0_globals);

        let cpus = core
            .registers
            .iter()
            .map(|n| CpuState {
                cpu: n.cpu,
                kind: n.kind,
                size: n.desc.len(),
                preview: n.desc.iter().copied().take(32).collect(),
            })
            .collect();

        Ok(HypervisorReport {
            anchor_symbol: self.config.anchor_symbol.clone(),
            anchor_address,
            domain_list_head,
            globals,
            dom0_globals,
            cpus,
        })
    }

    /// Sample optional globals by value. Drifted-away symbols and
    /// unreadable addresses become decode gaps, never failures.
    fn sample_globals(&self, ns: Namespace, names: &[String]) -> Vec<GlobalValue> {
        names
            .iter()
            .map(|name| match self.symbols.resolve_address(ns, name) {
                Ok(addr) => {
                    let value = match self.image.read_pointer(addr, self.ptr_width) {
                        Ok(v) => FieldValue::Unsigned(v),
                        Err(e) => {
                            warn!("{} global {} at {:#x} unreadable: {}", ns, name, addr, e);
                            FieldValue::Unknown(e.to_string())
                        }
                    };
                    GlobalValue {
                        name: name.clone(),
                        address: Some(addr),
                        value,
                    }
                }
                Err(e) => {
                    warn!("{} global {} unresolved: {}", ns, name, e);
                    GlobalValue {
                        name: name.clone(),
                        address: None,
                        value: FieldValue::Unknown("symbol not in table".to_string()),
                    }
                }
            })
            .collect()
    }

    /// Pass 2: enumerate and decode the domain chain.
    ///
    /// Never fails as a whole: per-entity failures are recorded in the
    /// reports and the tally always reflects every visited node.
    pub fn decode_domains(&self, hv: &HypervisorReport) -> DomainSummary {
        let mut summary = DomainSummary {
            domains: Vec::new(),
            attempted: 0,
            success: 0,
            halted: None,
        };

        let next_layout = match self.offsets.resolve_field("domain", "next_in_list") {
            Ok(entry) => (u64::from(entry.offset), entry.width.resolve(self.ptr_width)),
            Err(e) => {
                warn!("cannot enumerate domains: {}", e);
                summary.halted = Some(e.to_string());
                return summary;
            }
        };

        let mut walker = ChainWalker::new(hv.domain_list_head, self.config.max_domains);
        while let Some(node) = walker.current() {
            summary.attempted += 1;

            // Capture the next link before decoding the body, so one corrupt
            // domain does not take its siblings with it.
            let next = self.read_link(node, next_layout);
            let report = self.decode_domain(node, hv);
            if let EntityOutcome::Failed { reason } = &report.outcome {
                warn!("domain at {:#x} failed to decode: {}", node, reason);
            }
            summary.domains.push(report);

            match next {
                Ok(next) => {
                    if let Err(e) = walker.advance(next) {
                        warn!("domain chain aborted: {}", e);
                        summary.halted = Some(e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    // Next link unretrievable: this chain halts early, the
                    // failed entity is already recorded.
                    debug!("domain chain halts at {:#x}: next link unreadable", node);
                    summary.halted = Some(format!("next link at {:#x} unreadable: {}", node, e));
                    break;
                }
            }
        }

        summary.success = summary.domains.iter().filter(|d| d.is_success()).count() as u32;
        info!(
            "decoded {} of {} domains",
            summary.success, summary.attempted
        );
        summary
    }

    /// Follow a `next` pointer field out of `node`. Corrupt node addresses
    /// that would wrap the address space read as out-of-range.
    fn read_link(&self, node: u64, layout: (u64, Width)) -> Result<u64, DecodeError> {
        let addr = node
            .checked_add(layout.0)
            .ok_or(ImageError::OutOfRange {
                address: node,
                length: layout.1.bytes(),
            })?;
        Ok(self.image.read_pointer(addr, layout.1)?)
    }

    /// Decode every field the offset table lists for one structure kind.
    ///
    /// Any unreadable field fails the whole instance; missing table entries
    /// for a whole struct are `NoLayout`.
    fn decode_struct(&self, kind: StructKind, address: u64) -> Result<DecodedStruct, DecodeError> {
        let entries = self
            .offsets
            .fields_of(kind.name())
            .ok_or_else(|| DecodeError::NoLayout(kind.name().to_string()))?;

        let mut fields = Vec::with_capacity(entries.len());
        for entry in entries {
            let width = entry.width.resolve(self.ptr_width);
            let field_addr = address
                .checked_add(u64::from(entry.offset))
                .ok_or(ImageError::OutOfRange {
                    address,
                    length: width.bytes(),
                })?;
            let scalar = self.image.read_scalar(field_addr, width, entry.signedness)?;
            let value = match (entry.width, scalar) {
                (FieldWidth::Ptr, s) => FieldValue::Pointer(s.raw()),
                (_, Scalar::Unsigned(v)) => FieldValue::Unsigned(v),
                (_, Scalar::Signed(v)) => FieldValue::Signed(v),
            };
            fields.push((entry.field.clone(), value));
        }

        Ok(DecodedStruct {
            kind,
            address,
            fields,
        })
    }

    fn decode_domain(&self, address: u64, hv: &HypervisorReport) -> DomainReport {
        debug!("decoding domain at {:#x}", address);
        let body = match self.decode_struct(StructKind::Domain, address) {
            Ok(body) => body,
            Err(e) => {
                return DomainReport {
                    address,
                    outcome: EntityOutcome::Failed {
                        reason: e.to_string(),
                    },
                    vcpus: Vec::new(),
                    vcpu_chain_fault: None,
                }
            }
        };

        let (vcpus, vcpu_chain_fault) = self.decode_vcpus(&body, hv);
        DomainReport {
            address,
            outcome: EntityOutcome::Decoded(body),
            vcpus,
            vcpu_chain_fault,
        }
    }

    /// Enumerate a domain's VCPU chain with the same traversal discipline
    /// as the domain chain.
    fn decode_vcpus(
        &self,
        domain: &DecodedStruct,
        hv: &HypervisorReport,
    ) -> (Vec<VcpuReport>, Option<String>) {
        let mut vcpus = Vec::new();

        let head = match domain.get("vcpu_list") {
            Some(FieldValue::Pointer(p)) => *p,
            Some(other) => {
                return (
                    vcpus,
                    Some(format!("domain.vcpu_list is not a pointer: {}", other)),
                )
            }
            // Decode gap: layout has no vcpu_list, so no enumeration.
            None => return (vcpus, Some("no layout for domain.vcpu_list".to_string())),
        };
        let next_layout = match self.offsets.resolve_field("vcpu", "next_in_list") {
            Ok(entry) => (u64::from(entry.offset), entry.width.resolve(self.ptr_width)),
            Err(e) => return (vcpus, Some(e.to_string())),
        };

        let mut fault = None;
        let mut walker = ChainWalker::new(head, self.config.max_vcpus);
        while let Some(node) = walker.current() {
            let next = self.read_link(node, next_layout);
            vcpus.push(self.decode_vcpu(node, hv));

            match next {
                Ok(next) => {
                    if let Err(e) = walker.advance(next) {
                        warn!("vcpu chain aborted: {}", e);
                        fault = Some(e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    fault = Some(format!("next link at {:#x} unreadable: {}", node, e));
                    break;
                }
            }
        }

        (vcpus, fault)
    }

    fn decode_vcpu(&self, address: u64, hv: &HypervisorReport) -> VcpuReport {
        debug!("decoding vcpu at {:#x}", address);
        match self.decode_struct(StructKind::Vcpu, address) {
            Ok(body) => {
                // A VCPU running at crash time has its real register state
                // in the matching CPU note rather than in saved context.
                let note_cpu = match (body.unsigned("is_running"), body.unsigned("processor")) {
                    (Some(running), Some(cpu)) if running != 0 => {
                        let cpu = cpu as u32;
                        hv.cpus
                            .iter()
                            .any(|c| c.kind == NoteKind::Prstatus && c.cpu == cpu)
                            .then_some(cpu)
                    }
                    _ => None,
                };
                VcpuReport {
                    address,
                    outcome: EntityOutcome::Decoded(body),
                    note_cpu,
                }
            }
            Err(e) => {
                warn!("vcpu at {:#x} failed to decode: {}", address, e);
                VcpuReport {
                    address,
                    outcome: EntityOutcome::Failed {
                        reason: e.to_string(),
                    },
                    note_cpu: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use byteorder::{ByteOrder, LE};

    use super::*;
    use crate::image::{BufSource, MemoryImage, MemoryRegion};
    use crate::symbols::{Namespace, OffsetTable, SymbolTable};

    const OFFSETS: &str = "\
domain.domain_id 0x0 2
domain.max_vcpus 0x4 4
domain.next_in_list 0x8 ptr
domain.vcpu_list 0x10 ptr
vcpu.vcpu_id 0x0 4
vcpu.processor 0x4 4
vcpu.is_running 0x8 1
vcpu.rip 0x10 8
vcpu.next_in_list 0x18 ptr
";

    /// One region of raw memory with poke helpers for building structures.
    struct Ram {
        base: u64,
        data: Vec<u8>,
    }

    impl Ram {
        fn new(base: u64, size: usize) -> Self {
            Ram {
                base,
                data: vec![0u8; size],
            }
        }

        fn put_u16(&mut self, addr: u64, v: u16) {
            let off = (addr - self.base) as usize;
            LE::write_u16(&mut self.data[off..off + 2], v);
        }

        fn put_u32(&mut self, addr: u64, v: u32) {
            let off = (addr - self.base) as usize;
            LE::write_u32(&mut self.data[off..off + 4], v);
        }

        fn put_u64(&mut self, addr: u64, v: u64) {
            let off = (addr - self.base) as usize;
            LE::write_u64(&mut self.data[off..off + 8], v);
        }

        fn put_u8(&mut self, addr: u64, v: u8) {
            let off = (addr - self.base) as usize;
            self.data[off] = v;
        }

        fn domain(&mut self, addr: u64, id: u16, next: u64, vcpu_list: u64) {
            self.put_u16(addr, id);
            self.put_u32(addr + 0x4, 1);
            self.put_u64(addr + 0x8, next);
            self.put_u64(addr + 0x10, vcpu_list);
        }

        fn vcpu(&mut self, addr: u64, id: u32, processor: u32, running: bool, next: u64) {
            self.put_u32(addr, id);
            self.put_u32(addr + 0x4, processor);
            self.put_u8(addr + 0x8, u8::from(running));
            self.put_u64(addr + 0x10, 0xdead_beef);
            self.put_u64(addr + 0x18, next);
        }

        fn into_image(self) -> MemoryImage {
            MemoryImage::build(
                vec![MemoryRegion {
                    start: self.base,
                    length: self.data.len() as u64,
                    source_offset: 0,
                }],
                Box::new(BufSource(self.data)),
            )
            .unwrap()
        }
    }

    fn metadata(anchor_addr: u64) -> (SymbolTable, OffsetTable) {
        let mut symbols = SymbolTable::new();
        symbols
            .load(
                Cursor::new(format!("{:x} D domain_list\n", anchor_addr)),
                Namespace::Xen,
            )
            .unwrap();
        let offsets = OffsetTable::parse(Cursor::new(OFFSETS)).unwrap();
        (symbols, offsets)
    }

    fn empty_core() -> CoreFile {
        CoreFile {
            class: ContainerClass::Elf64,
            machine: 62,
            regions: Vec::new(),
            registers: Vec::new(),
            crash_info: None,
            page_size: 4096,
        }
    }

    fn run(
        image: &MemoryImage,
        symbols: &SymbolTable,
        offsets: &OffsetTable,
        config: DecodeConfig,
    ) -> (HypervisorReport, DomainSummary) {
        let decoder = Decoder::new(image, symbols, offsets, ContainerClass::Elf64, config);
        let hv = decoder.decode_hypervisor(&empty_core()).unwrap();
        let domains = decoder.decode_domains(&hv);
        (hv, domains)
    }

    #[test]
    fn traversal_visits_each_node_once_and_terminates() {
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100); // domain_list -> d0
        ram.domain(0x1100, 0, 0x1200, 0);
        ram.domain(0x1200, 1, 0x1300, 0);
        ram.domain(0x1300, 2, 0, 0);
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.success, 3);
        assert!(summary.halted.is_none());

        let ids: Vec<u64> = summary
            .domains
            .iter()
            .filter_map(|d| match &d.outcome {
                EntityOutcome::Decoded(s) => s.unsigned("domain_id"),
                EntityOutcome::Failed { .. } => None,
            })
            .collect();
        assert_eq!(ids, [0, 1, 2]);
    }

    #[test]
    fn empty_domain_list_is_fine() {
        let mut ram = Ram::new(0x1000, 0x100);
        ram.put_u64(0x1000, 0); // null head
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.success, 0);
        assert!(summary.halted.is_none());
    }

    #[test]
    fn cycle_terminates_with_corrupt_chain() {
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100);
        ram.domain(0x1100, 0, 0x1200, 0);
        ram.domain(0x1200, 1, 0x1300, 0);
        ram.domain(0x1300, 2, 0x1200, 0); // cycle back into the middle
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 3);
        assert!(summary.halted.is_some(), "cycle must abort the chain");
        assert!(summary.halted.unwrap().contains("corrupt chain"));
    }

    #[test]
    fn chain_returning_to_head_is_a_sentinel() {
        // Circular lists terminate at the head, not with a corruption
        // verdict.
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100);
        ram.domain(0x1100, 0, 0x1200, 0);
        ram.domain(0x1200, 1, 0x1100, 0); // back to the head
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.success, 2);
        assert!(summary.halted.is_none());
    }

    #[test]
    fn traversal_cap_bounds_long_chains() {
        let mut ram = Ram::new(0x1000, 0x2000);
        ram.put_u64(0x1000, 0x1100);
        for i in 0..8u64 {
            let addr = 0x1100 + i * 0x100;
            ram.domain(addr, i as u16, addr + 0x100, 0);
        }
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let config = DecodeConfig {
            max_domains: 3,
            ..DecodeConfig::default()
        };
        let (_, summary) = run(&image, &symbols, &offsets, config);
        assert_eq!(summary.attempted, 3);
        assert!(summary.halted.unwrap().contains("corrupt chain"));
    }

    #[test]
    fn body_failure_does_not_disturb_siblings() {
        // d1 sits at the very end of the region: its next pointer is still
        // readable but vcpu_list at +0x10 runs off the map, so the body
        // decode fails after the next link was captured.
        let bad = 0x1000 + 0x1000 - 0x10;
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100);
        ram.domain(0x1100, 0, bad, 0);
        ram.put_u16(bad, 1);
        ram.put_u64(bad + 0x8, 0x1300); // next link still on the map
        ram.domain(0x1300, 2, 0, 0);
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.success, 2);
        assert!(!summary.domains[1].outcome.is_decoded());
        assert!(summary.domains[2].outcome.is_decoded());
    }

    #[test]
    fn unmapped_node_halts_chain_but_keeps_tally() {
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100);
        ram.domain(0x1100, 0, 0x1200, 0);
        ram.domain(0x1200, 1, 0xbad0_0000, 0); // next points off the map
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.success, 2);
        assert!(matches!(
            summary.domains[2].outcome,
            EntityOutcome::Failed { .. }
        ));
        assert!(summary.halted.is_some());
    }

    #[test]
    fn vcpu_chain_decodes_and_cross_references_notes() {
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100);
        ram.domain(0x1100, 7, 0, 0x1500);
        ram.vcpu(0x1500, 0, 0, true, 0x1600); // running on pcpu 0
        ram.vcpu(0x1600, 1, 2, false, 0);
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let mut core = empty_core();
        core.registers.push(crate::elf::RegisterNote {
            cpu: 0,
            kind: NoteKind::Prstatus,
            desc: vec![0; 336],
        });

        let decoder = Decoder::new(
            &image,
            &symbols,
            &offsets,
            ContainerClass::Elf64,
            DecodeConfig::default(),
        );
        let hv = decoder.decode_hypervisor(&core).unwrap();
        let summary = decoder.decode_domains(&hv);

        assert_eq!(summary.success, 1);
        let d = &summary.domains[0];
        assert_eq!(d.vcpus.len(), 2);
        assert_eq!(d.vcpus_decoded(), 2);
        assert_eq!(d.vcpus[0].note_cpu, Some(0));
        assert_eq!(d.vcpus[1].note_cpu, None); // not running
    }

    #[test]
    fn failing_vcpu_spoils_only_its_domain() {
        let mut ram = Ram::new(0x1000, 0x1000);
        ram.put_u64(0x1000, 0x1100);
        ram.domain(0x1100, 0, 0x1200, 0x1500);
        ram.domain(0x1200, 1, 0, 0);
        ram.vcpu(0x1500, 0, 0, false, 0xcafe_0000); // next vcpu unmapped
        let image = ram.into_image();
        let (symbols, offsets) = metadata(0x1000);

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 2);
        // d0's vcpu chain halts early, so d0 is not fully decoded; d1 is.
        assert_eq!(summary.success, 1);
        assert!(summary.domains[0].vcpu_chain_fault.is_some());
        assert!(summary.domains[1].is_success());
    }

    #[test]
    fn missing_anchor_is_fatal() {
        let ram = Ram::new(0x1000, 0x100);
        let image = ram.into_image();
        let symbols = SymbolTable::new();
        let offsets = OffsetTable::parse(Cursor::new(OFFSETS)).unwrap();

        let decoder = Decoder::new(
            &image,
            &symbols,
            &offsets,
            ContainerClass::Elf64,
            DecodeConfig::default(),
        );
        assert!(matches!(
            decoder.decode_hypervisor(&empty_core()),
            Err(DecodeError::MissingAnchor(_))
        ));
    }

    #[test]
    fn unresolvable_globals_become_decode_gaps() {
        let mut ram = Ram::new(0x1000, 0x100);
        ram.put_u64(0x1000, 0);
        ram.put_u64(0x1008, 0x12345);
        let image = ram.into_image();

        let mut symbols = SymbolTable::new();
        symbols
            .load(
                Cursor::new("1000 D domain_list\n1008 D max_page\n"),
                Namespace::Xen,
            )
            .unwrap();
        let offsets = OffsetTable::parse(Cursor::new(OFFSETS)).unwrap();

        let config = DecodeConfig {
            globals: vec!["max_page".to_string(), "frame_table".to_string()],
            ..DecodeConfig::default()
        };
        let decoder = Decoder::new(&image, &symbols, &offsets, ContainerClass::Elf64, config);
        let hv = decoder.decode_hypervisor(&empty_core()).unwrap();

        assert_eq!(hv.globals[0].value, FieldValue::Unsigned(0x12345));
        assert!(matches!(hv.globals[1].value, FieldValue::Unknown(_)));
        assert_eq!(hv.globals[1].address, None);
    }

    #[test]
    fn dom0_globals_resolve_in_their_own_namespace() {
        let mut ram = Ram::new(0x1000, 0x100);
        ram.put_u64(0x1000, 0);
        ram.put_u64(0x1010, 0x5555);
        let image = ram.into_image();

        let mut symbols = SymbolTable::new();
        symbols
            .load(Cursor::new("1000 D domain_list\n"), Namespace::Xen)
            .unwrap();
        symbols
            .load(Cursor::new("1010 D init_task\n"), Namespace::Dom0)
            .unwrap();
        let offsets = OffsetTable::parse(Cursor::new(OFFSETS)).unwrap();

        let config = DecodeConfig {
            dom0_globals: vec!["init_task".to_string()],
            ..DecodeConfig::default()
        };
        let decoder = Decoder::new(&image, &symbols, &offsets, ContainerClass::Elf64, config);
        let hv = decoder.decode_hypervisor(&empty_core()).unwrap();

        assert_eq!(hv.dom0_globals.len(), 1);
        assert_eq!(hv.dom0_globals[0].value, FieldValue::Unsigned(0x5555));
    }

    #[test]
    fn end_to_end_synthetic_container() {
        // Full pipeline: container bytes -> parse -> image -> metadata ->
        // decode -> render. Two memory regions, one CPU note, a three-entry
        // domain chain whose last link points off the map.
        let mut r1 = Ram::new(0x0, 0x1000);
        r1.put_u64(0x100, 0x200); // domain_list -> d0
        r1.domain(0x200, 0, 0x2100, 0x300);
        r1.vcpu(0x300, 0, 0, true, 0);
        let mut r2 = Ram::new(0x2000, 0x1000);
        r2.domain(0x2100, 1, 0x5000, 0); // next points outside both regions

        let container = crate::elf::fixture::CoreBuilder::new()
            .prstatus(vec![0x11; 336])
            .load(0x0, r1.data)
            .load(0x2000, r2.data)
            .build();

        let core = crate::elf::parse(&container).unwrap();
        assert_eq!(core.regions.len(), 2);
        assert_eq!(core.cpu_count(), 1);

        let image = MemoryImage::build(
            core.regions.clone(),
            Box::new(BufSource(container.clone())),
        )
        .unwrap();
        let (symbols, offsets) = metadata(0x100);

        let decoder = Decoder::new(
            &image,
            &symbols,
            &offsets,
            core.class,
            DecodeConfig::default(),
        );
        let hv = decoder.decode_hypervisor(&core).unwrap();
        let summary = decoder.decode_domains(&hv);

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.success, 2);
        assert_eq!(summary.domains[0].vcpus[0].note_cpu, Some(0));

        let doc = crate::report::render_document(&core, &hv, &summary);
        assert_eq!(doc.matches("Domain at ").count(), 3);
        assert_eq!(doc.matches("Domain at 0x5000: FAILED").count(), 1);
        assert!(doc.contains("Domains decoded: 2 of 3"));
    }

    #[test]
    fn missing_domain_layout_degrades_gracefully() {
        let mut ram = Ram::new(0x1000, 0x100);
        ram.put_u64(0x1000, 0x1100);
        let image = ram.into_image();
        let (symbols, _) = metadata(0x1000);
        let offsets = OffsetTable::parse(Cursor::new("vcpu.vcpu_id 0 4\n")).unwrap();

        let (_, summary) = run(&image, &symbols, &offsets, DecodeConfig::default());
        assert_eq!(summary.attempted, 0);
        assert!(summary.halted.is_some());
    }
}
