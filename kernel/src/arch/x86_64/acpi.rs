//! ACPI table access
//!
//! Walks the RSDP to the RSDT/XSDT, verifies checksums, answers signature
//! queries, and digs the processor list and the I/O APIC base out of the
//! MADT. A root-table checksum mismatch is an invariant violation and
//! panics.

use alloc::vec::Vec;
use spin::Once;

/// Root System Description Pointer.
#[repr(C, packed)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oemid: [u8; 6],
    pub revision: u8,
    pub rsdt_addr: u32,
    pub length: u32,
    pub xsdt_addr: u64,
    pub ext_checksum: u8,
    pub reserved: [u8; 3],
}

/// Common header of every System Description Table.
#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oemid: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

pub const SDT_HEADER_LEN: usize = core::mem::size_of::<SdtHeader>();

/// ACPI checksum: the bytes of a table must sum to zero modulo 256. The
/// accumulator is deliberately 8 bits wide with wrapping arithmetic.
pub fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

struct RootSdt {
    /// Virtual address of the root SDT header.
    hdr: u64,
    /// XSDT (8-byte entries) or RSDT (4-byte entries).
    xsdt: bool,
    /// Number of table pointers.
    count: usize,
}

static ROOT_SDT: Once<RootSdt> = Once::new();

/// Processor and interrupt-router information from the MADT.
pub struct MadtInfo {
    /// APIC ids of enabled processors, in table order.
    pub lapic_ids: Vec<u32>,
    /// Physical base of the first I/O APIC.
    pub ioapic_addr: u64,
    /// Global system interrupt base of that I/O APIC.
    pub ioapic_gsi_base: u32,
}

static MADT: Once<MadtInfo> = Once::new();

unsafe fn hdr_length(hdr: *const SdtHeader) -> usize {
    // SAFETY: caller hands a mapped table header; packed field read.
    unsafe { core::ptr::addr_of!((*hdr).length).read_unaligned() as usize }
}

unsafe fn table_bytes(hdr: *const SdtHeader) -> &'static [u8] {
    // SAFETY: ACPI tables are `length` bytes long starting at the header,
    // and stay mapped for the kernel's lifetime.
    unsafe { core::slice::from_raw_parts(hdr as *const u8, hdr_length(hdr)) }
}

/// Locate the root SDT from the boot-vars RSDP and verify it.
pub fn early_init() {
    let Some(rsdp_pa) = crate::bootvars::read().rsdp else {
        panic!("acpi: bootloader provided no RSDP");
    };

    let rsdp = crate::mm::phys_to_virt(rsdp_pa) as *const Rsdp;
    // SAFETY: the RSDP address comes from the bootloader and is covered by
    // the physical mapping; fields are read unaligned.
    let (revision, rsdt_addr, xsdt_addr) = unsafe {
        (
            core::ptr::addr_of!((*rsdp).revision).read_unaligned(),
            core::ptr::addr_of!((*rsdp).rsdt_addr).read_unaligned(),
            core::ptr::addr_of!((*rsdp).xsdt_addr).read_unaligned(),
        )
    };

    let (root_pa, xsdt) = if revision >= 2 {
        log::info!("acpi: using XSDT as root SDT");
        (xsdt_addr, true)
    } else {
        log::info!("acpi: using RSDT as root SDT");
        (rsdt_addr as u64, false)
    };

    let hdr = crate::mm::phys_to_virt(root_pa) as *const SdtHeader;
    // SAFETY: root table mapped through the physical mapping.
    let bytes = unsafe { table_bytes(hdr) };
    if !checksum_ok(bytes) {
        panic!("acpi: root SDT checksum is invalid");
    }

    let entry_size = if xsdt { 8 } else { 4 };
    let count = (bytes.len() - SDT_HEADER_LEN) / entry_size;

    ROOT_SDT.call_once(|| RootSdt {
        hdr: hdr as u64,
        xsdt,
        count,
    });
}

/// Look up a table by its four-byte signature.
pub fn query(sig: &[u8; 4]) -> Option<*const SdtHeader> {
    let root = ROOT_SDT.get()?;
    let entries = (root.hdr as usize + SDT_HEADER_LEN) as *const u8;

    for i in 0..root.count {
        // SAFETY: `i` is within the entry array counted at init; entries
        // are unaligned 4- or 8-byte physical pointers.
        let pa = unsafe {
            if root.xsdt {
                (entries.add(i * 8) as *const u64).read_unaligned()
            } else {
                (entries.add(i * 4) as *const u32).read_unaligned() as u64
            }
        };
        let hdr = crate::mm::phys_to_virt(pa) as *const SdtHeader;
        // SAFETY: table mapped through the physical mapping.
        let signature = unsafe { core::ptr::addr_of!((*hdr).signature).read_unaligned() };
        if &signature == sig {
            return Some(hdr);
        }
    }
    None
}

/// Parse MADT bytes (header included) into processor/IOAPIC info.
///
/// Entry types: 0 is a processor-local APIC (enabled if bit 0 of its flags
/// is set), 1 is an I/O APIC. Other types are skipped by length.
fn parse_madt(bytes: &[u8]) -> MadtInfo {
    let mut info = MadtInfo {
        lapic_ids: Vec::new(),
        ioapic_addr: 0,
        ioapic_gsi_base: 0,
    };

    // 36-byte SDT header, then the 4-byte local APIC address and 4 bytes
    // of flags, then the variable entries.
    let mut off = SDT_HEADER_LEN + 8;
    while off + 2 <= bytes.len() {
        let etype = bytes[off];
        let elen = bytes[off + 1] as usize;
        if elen < 2 || off + elen > bytes.len() {
            break;
        }

        match etype {
            0 if elen >= 8 => {
                let apic_id = bytes[off + 3] as u32;
                let flags = u32::from_le_bytes([
                    bytes[off + 4],
                    bytes[off + 5],
                    bytes[off + 6],
                    bytes[off + 7],
                ]);
                if flags & 1 != 0 {
                    info.lapic_ids.push(apic_id);
                }
            }
            1 if elen >= 12 => {
                if info.ioapic_addr == 0 {
                    info.ioapic_addr = u32::from_le_bytes([
                        bytes[off + 4],
                        bytes[off + 5],
                        bytes[off + 6],
                        bytes[off + 7],
                    ]) as u64;
                    info.ioapic_gsi_base = u32::from_le_bytes([
                        bytes[off + 8],
                        bytes[off + 9],
                        bytes[off + 10],
                        bytes[off + 11],
                    ]);
                }
            }
            _ => {}
        }
        off += elen;
    }

    info
}

/// MADT-derived info, parsed on first use.
pub fn madt_info() -> Option<&'static MadtInfo> {
    if let Some(info) = MADT.get() {
        return Some(info);
    }
    let hdr = query(b"APIC")?;
    // SAFETY: `query` returned a mapped table.
    let bytes = unsafe { table_bytes(hdr) };
    if !checksum_ok(bytes) {
        log::warn!("acpi: MADT checksum mismatch, ignoring table");
        return None;
    }
    Some(MADT.call_once(|| parse_madt(bytes)))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;

    fn with_checksum(mut table: std::vec::Vec<u8>) -> std::vec::Vec<u8> {
        let sum: u8 = table.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        // Slot 9 is the checksum byte of the SDT header.
        table[9] = table[9].wrapping_sub(sum);
        table
    }

    fn synthetic_madt() -> std::vec::Vec<u8> {
        let mut t = vec![0u8; SDT_HEADER_LEN];
        t[0..4].copy_from_slice(b"APIC");
        // lapic addr + flags
        t.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes());
        // processor 0, apic id 0, enabled
        t.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        // processor 1, apic id 1, enabled
        t.extend_from_slice(&[0, 8, 1, 1, 1, 0, 0, 0]);
        // processor 2, apic id 2, disabled
        t.extend_from_slice(&[0, 8, 2, 2, 0, 0, 0, 0]);
        // ioapic id 0 at 0xFEC00000, gsi base 0
        let mut ioapic = vec![1u8, 12, 0, 0];
        ioapic.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        ioapic.extend_from_slice(&0u32.to_le_bytes());
        t.extend_from_slice(&ioapic);

        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        with_checksum(t)
    }

    #[test]
    fn checksum_requires_zero_sum_mod_256() {
        let table = synthetic_madt();
        assert!(checksum_ok(&table));

        let mut bad = table.clone();
        bad[10] = bad[10].wrapping_add(1);
        assert!(!checksum_ok(&bad));
    }

    #[test]
    fn checksum_accumulator_wraps_in_eight_bits() {
        // 256 bytes of 0x01 sum to 256 == 0 (mod 256): valid.
        let table = vec![1u8; 256];
        assert!(checksum_ok(&table));
    }

    #[test]
    fn madt_parse_finds_enabled_processors_and_ioapic() {
        let table = synthetic_madt();
        let info = parse_madt(&table);
        assert_eq!(info.lapic_ids, vec![0, 1], "disabled processor skipped");
        assert_eq!(info.ioapic_addr, 0xFEC0_0000);
        assert_eq!(info.ioapic_gsi_base, 0);
    }
}
