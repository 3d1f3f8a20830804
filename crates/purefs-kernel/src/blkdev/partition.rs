//! MBR partition table discovery.
//!
//! Primary partitions are numbered 1-4 by slot; logical partitions found by
//! walking the extended boot record chain are numbered from 5.

use purefs_types::{Errno, VfsResult};

use super::{BlockDevice, InfoType};

const MBR_SIGNATURE_OFFS: usize = 0x1FE;
const PTBL_OFFS: usize = 0x1BE;
const PTBL_ENTRY_SIZE: usize = 16;
const PTBL_ACTIVE: usize = 0x0;
const PTBL_TYPE: usize = 0x4;
const PTBL_LBA: usize = 0x8;
const PTBL_SECT_CNT: usize = 0xC;
const NUM_PRIMARY: usize = 4;
const MIN_SECTOR_SIZE: u64 = 512;
const FIRST_LOGICAL: u32 = 5;
/// Upper bound on EBR hops, against looping chains.
const MAX_EBR_HOPS: usize = 100;

const EXT_PART: u8 = 0x05;
const EXT_WIN98_PART: u8 = 0x0F;
const EXT_LINUX_PART: u8 = 0x85;

/// One discovered partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Registry name, `<disk>part<N>`.
    pub name: String,
    /// Partition number (1-4 primary, 5+ logical).
    pub number: u32,
    pub partition_type: u8,
    pub bootable: bool,
    /// First sector, absolute within hardware partition 0.
    pub start_sector: u64,
    pub num_sectors: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RawEntry {
    bootable: bool,
    partition_type: u8,
    start: u32,
    count: u32,
}

fn is_extended(ty: u8) -> bool {
    matches!(ty, EXT_PART | EXT_WIN98_PART | EXT_LINUX_PART)
}

fn le32(buf: &[u8], offs: usize) -> u32 {
    u32::from_le_bytes([buf[offs], buf[offs + 1], buf[offs + 2], buf[offs + 3]])
}

fn has_signature(sector: &[u8]) -> bool {
    sector[MBR_SIGNATURE_OFFS] == 0x55 && sector[MBR_SIGNATURE_OFFS + 1] == 0xAA
}

fn read_entries(sector: &[u8]) -> [RawEntry; NUM_PRIMARY] {
    let mut entries = [RawEntry::default(); NUM_PRIMARY];
    for (i, entry) in entries.iter_mut().enumerate() {
        let offs = PTBL_OFFS + i * PTBL_ENTRY_SIZE;
        *entry = RawEntry {
            bootable: sector[offs + PTBL_ACTIVE] & 0x80 != 0,
            partition_type: sector[offs + PTBL_TYPE],
            start: le32(sector, offs + PTBL_LBA),
            count: le32(sector, offs + PTBL_SECT_CNT),
        };
    }
    entries
}

/// Scan hardware partition 0 of `device` for an MBR partition table.
///
/// Fails with `ENXIO` when the sector size is too small or sector 0 carries
/// no MBR signature; device errors propagate unchanged.
pub fn scan(device: &dyn BlockDevice, disk_name: &str) -> VfsResult<Vec<Partition>> {
    let sector_size = device.get_info(InfoType::SectorSize, 0)?;
    let disk_sectors = device.get_info(InfoType::SectorCount, 0)?;
    if sector_size < MIN_SECTOR_SIZE {
        tracing::error!(disk_name, sector_size, "cannot scan partitions with sector size < 512");
        return Err(Errno::ENXIO);
    }
    let mut sector = vec![0u8; sector_size as usize];
    device.read(&mut sector, 0, 1, 0)?;
    if !has_signature(&sector) {
        return Err(Errno::ENXIO);
    }

    let mut parts = Vec::new();
    let primaries = read_entries(&sector);
    for (slot, entry) in primaries.iter().enumerate() {
        if entry.count == 0 || is_extended(entry.partition_type) {
            continue;
        }
        let start = u64::from(entry.start);
        let count = u64::from(entry.count);
        if start + count > disk_sectors {
            tracing::warn!(disk_name, slot, start, count, disk_sectors, "partition overruns disk, skipping");
            continue;
        }
        let number = slot as u32 + 1;
        parts.push(Partition {
            name: format!("{disk_name}part{number}"),
            number,
            partition_type: entry.partition_type,
            bootable: entry.bootable,
            start_sector: start,
            num_sectors: count,
        });
    }

    if let Some(ext) = primaries.iter().find(|e| e.count != 0 && is_extended(e.partition_type)) {
        let logical = scan_extended(
            device,
            disk_name,
            &mut sector,
            u64::from(ext.start),
            u64::from(ext.count),
            disk_sectors,
        )?;
        parts.extend(logical);
    }
    Ok(parts)
}

/// Follow the EBR chain of the extended partition `[base, base + size)`.
fn scan_extended(
    device: &dyn BlockDevice,
    disk_name: &str,
    sector: &mut [u8],
    base: u64,
    size: u64,
    disk_sectors: u64,
) -> VfsResult<Vec<Partition>> {
    let mut parts = Vec::new();
    let area_end = (base + size).min(disk_sectors);
    let mut current = base;
    let mut number = FIRST_LOGICAL;

    for _ in 0..MAX_EBR_HOPS {
        if current >= area_end {
            break;
        }
        device.read(sector, current, 1, 0)?;
        if !has_signature(sector) {
            tracing::error!(disk_name, ebr = current, "extended boot record without signature");
            break;
        }
        let entries = read_entries(sector);
        let mut next = None;
        for entry in entries.iter().filter(|e| e.count != 0) {
            if is_extended(entry.partition_type) {
                // Links are relative to the start of the extended partition.
                next.get_or_insert(base + u64::from(entry.start));
                continue;
            }
            let start = current + u64::from(entry.start);
            let count = u64::from(entry.count);
            if start < base || start + count > area_end {
                tracing::warn!(disk_name, ebr = current, start, count, "logical partition looks strange, skipping");
                continue;
            }
            parts.push(Partition {
                name: format!("{disk_name}part{number}"),
                number,
                partition_type: entry.partition_type,
                bootable: entry.bootable,
                start_sector: start,
                num_sectors: count,
            });
            number += 1;
        }
        match next {
            Some(n) if n > current => current = n,
            Some(_) => {
                tracing::warn!(disk_name, ebr = current, "extended chain goes backwards, stopping");
                break;
            }
            None => {
                tracing::debug!(disk_name, "no more extended partitions");
                break;
            }
        }
    }
    Ok(parts)
}

/// Write a primary MBR entry into `sector` (test and tooling helper).
pub fn write_entry(sector: &mut [u8], slot: usize, partition_type: u8, start: u32, count: u32, bootable: bool) {
    let offs = PTBL_OFFS + slot * PTBL_ENTRY_SIZE;
    sector[offs + PTBL_ACTIVE] = if bootable { 0x80 } else { 0 };
    sector[offs + PTBL_TYPE] = partition_type;
    sector[offs + PTBL_LBA..offs + PTBL_LBA + 4].copy_from_slice(&start.to_le_bytes());
    sector[offs + PTBL_SECT_CNT..offs + PTBL_SECT_CNT + 4].copy_from_slice(&count.to_le_bytes());
    sector[MBR_SIGNATURE_OFFS] = 0x55;
    sector[MBR_SIGNATURE_OFFS + 1] = 0xAA;
}
