//! MBR / protective-MBR + GPT / EBR chain parser.
//!
//! Reads raw sectors from anything that is `Read + Seek` (an image file, a
//! `\\.\PhysicalDriveN` handle, an in-memory buffer) and produces a typed
//! list of partitions. Parsing is best-effort: a missing boot signature or an
//! I/O error yields an empty list, never an error.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::{debug, warn};

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Partitions smaller than this are never offered as OS partitions.
pub const MIN_CANDIDATE_BYTES: u64 = 1024 * 1024 * 1024;

const BOOT_SIGNATURE: u16 = 0xAA55;
const BOOT_SIGNATURE_OFFSET: usize = 510;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const PROTECTIVE_GPT_TYPE: u8 = 0xEE;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_ENTRY_SIZE: usize = 128;
/// Upper bound on the entry array we are willing to read in one go.
const GPT_MAX_ARRAY_BYTES: u64 = 16 * 1024 * 1024;

/// Guard against EBR chains that loop back on themselves.
const MAX_LOGICAL_PARTITIONS: usize = 128;
const FIRST_LOGICAL_INDEX: u32 = 5;

/// Operating-system class inferred from the partition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OsClass {
    Windows,
    Linux,
    Other,
}

/// One partition found on a block device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Partition {
    /// 1-based: primary slot or GPT array position; logical partitions from 5.
    pub index: u32,
    pub start_offset_bytes: u64,
    pub size_bytes: u64,
    pub os_class: OsClass,
    pub description: String,
}

impl Partition {
    pub fn end_offset_bytes(&self) -> u64 {
        self.start_offset_bytes.saturating_add(self.size_bytes)
    }

    /// Whether this partition may be presented to the orchestrator.
    pub fn is_candidate(&self) -> bool {
        self.size_bytes >= MIN_CANDIDATE_BYTES && self.os_class != OsClass::Other
    }
}

/// Parse with the default 512-byte logical sector size.
pub fn parse_partitions<D: Read + Seek>(device: &mut D) -> Vec<Partition> {
    parse_partitions_with_sector_size(device, DEFAULT_SECTOR_SIZE)
}

pub fn parse_partitions_with_sector_size<D: Read + Seek>(
    device: &mut D,
    sector_size: u64,
) -> Vec<Partition> {
    match try_parse(device, sector_size) {
        Ok(partitions) => {
            debug!(count = partitions.len(), "partition table parsed");
            partitions
        }
        Err(e) => {
            warn!(error = %e, "partition table read failed, treating device as empty");
            Vec::new()
        }
    }
}

/// Drop partitions below 1 GiB and those of class `Other`.
///
/// Idempotent: filtering an already filtered list returns it unchanged.
pub fn candidate_partitions<I>(partitions: I) -> Vec<Partition>
where
    I: IntoIterator<Item = Partition>,
{
    partitions.into_iter().filter(Partition::is_candidate).collect()
}

fn try_parse<D: Read + Seek>(device: &mut D, sector_size: u64) -> io::Result<Vec<Partition>> {
    if sector_size < 512 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported sector size {sector_size}"),
        ));
    }

    let device_size = device_size(device);
    let mbr = read_sector(device, 0, sector_size)?;
    if !has_boot_signature(&mbr) {
        debug!("no MBR boot signature");
        return Ok(Vec::new());
    }

    let partitions = if is_protective_mbr(&mbr) {
        parse_gpt(device, sector_size)?
    } else {
        parse_mbr(device, &mbr, sector_size)?
    };

    Ok(match device_size {
        Some(size) => partitions
            .into_iter()
            .filter(|p| {
                let fits = p.end_offset_bytes() <= size;
                if !fits {
                    warn!(index = p.index, end = p.end_offset_bytes(), device_size = size,
                          "partition extends past end of device, skipped");
                }
                fits
            })
            .collect(),
        None => partitions,
    })
}

/// Size of the device, or `None` when the handle cannot report it (some raw
/// disk handles refuse `SeekFrom::End`).
fn device_size<D: Seek>(device: &mut D) -> Option<u64> {
    match device.seek(SeekFrom::End(0)) {
        Ok(0) | Err(_) => None,
        Ok(size) => Some(size),
    }
}

fn read_at<D: Read + Seek>(device: &mut D, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    device.seek(SeekFrom::Start(offset))?;
    device.read_exact(buf)
}

fn read_sector<D: Read + Seek>(device: &mut D, lba: u64, sector_size: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; sector_size as usize];
    read_at(device, lba * sector_size, &mut buf)?;
    Ok(buf)
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn has_boot_signature(sector: &[u8]) -> bool {
    sector.len() >= 512 && le_u16(sector, BOOT_SIGNATURE_OFFSET) == BOOT_SIGNATURE
}

fn is_protective_mbr(mbr: &[u8]) -> bool {
    (0..4).any(|i| mbr[MBR_TABLE_OFFSET + i * MBR_ENTRY_SIZE + 4] == PROTECTIVE_GPT_TYPE)
}

// ---------------------------------------------------------------------------
// MBR + EBR chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct MbrEntry {
    type_byte: u8,
    start_lba: u32,
    sectors: u32,
}

impl MbrEntry {
    fn read(sector: &[u8], slot: usize) -> Self {
        let at = MBR_TABLE_OFFSET + slot * MBR_ENTRY_SIZE;
        Self {
            type_byte: sector[at + 4],
            start_lba: le_u32(sector, at + 8),
            sectors: le_u32(sector, at + 12),
        }
    }

    fn is_empty(&self) -> bool {
        self.type_byte == 0x00
    }

    fn is_extended(&self) -> bool {
        matches!(self.type_byte, 0x05 | 0x0F)
    }
}

fn classify_mbr_type(type_byte: u8) -> (OsClass, String) {
    match type_byte {
        0x07 => (OsClass::Windows, "Windows (NTFS/exFAT)".into()),
        0x0B => (OsClass::Windows, "Windows (FAT32)".into()),
        0x0C => (OsClass::Windows, "Windows (FAT32 LBA)".into()),
        0x83 => (OsClass::Linux, "Linux".into()),
        0x8E => (OsClass::Linux, "Linux LVM".into()),
        0x82 => (OsClass::Other, "Linux swap".into()),
        0xEF => (OsClass::Other, "EFI System Partition".into()),
        other => (OsClass::Other, format!("Unknown (type 0x{other:02X})")),
    }
}

fn parse_mbr<D: Read + Seek>(
    device: &mut D,
    mbr: &[u8],
    sector_size: u64,
) -> io::Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let mut extended_base = None;

    for slot in 0..4 {
        let entry = MbrEntry::read(mbr, slot);
        if entry.is_empty() {
            continue;
        }
        let start = u64::from(entry.start_lba) * sector_size;
        if entry.is_extended() {
            extended_base = Some(start);
            continue;
        }
        let (os_class, description) = classify_mbr_type(entry.type_byte);
        partitions.push(Partition {
            index: slot as u32 + 1,
            start_offset_bytes: start,
            size_bytes: u64::from(entry.sectors) * sector_size,
            os_class,
            description,
        });
    }

    if let Some(base) = extended_base.filter(|b| *b > 0) {
        partitions.extend(walk_ebr_chain(device, base, sector_size));
    }
    Ok(partitions)
}

/// Follow the EBR linked list inside an extended partition.
///
/// The logical entry's start is relative to the current EBR; the link entry's
/// start is relative to the extended partition's base. A read failure or a
/// bad signature ends the walk but keeps what was found so far.
fn walk_ebr_chain<D: Read + Seek>(device: &mut D, base: u64, sector_size: u64) -> Vec<Partition> {
    let mut partitions = Vec::new();
    let mut visited = Vec::new();
    let mut current = base;
    let mut index = FIRST_LOGICAL_INDEX;

    while partitions.len() < MAX_LOGICAL_PARTITIONS && !visited.contains(&current) {
        visited.push(current);

        let mut ebr = vec![0u8; sector_size as usize];
        if let Err(e) = read_at(device, current, &mut ebr) {
            warn!(offset = current, error = %e, "EBR read failed, stopping chain walk");
            break;
        }
        if !has_boot_signature(&ebr) {
            break;
        }

        let logical = MbrEntry::read(&ebr, 0);
        if !logical.is_empty() {
            let (os_class, description) = classify_mbr_type(logical.type_byte);
            partitions.push(Partition {
                index,
                start_offset_bytes: current + u64::from(logical.start_lba) * sector_size,
                size_bytes: u64::from(logical.sectors) * sector_size,
                os_class,
                description,
            });
            index += 1;
        }

        let link = MbrEntry::read(&ebr, 1);
        if !link.is_extended() || link.start_lba == 0 {
            break;
        }
        current = base + u64::from(link.start_lba) * sector_size;
    }

    partitions
}

// ---------------------------------------------------------------------------
// GPT
// ---------------------------------------------------------------------------

const WINDOWS_BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";
const LINUX_FILESYSTEM: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
const LINUX_LVM: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";
const EFI_SYSTEM: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const MICROSOFT_RESERVED: &str = "E3C9E316-0B5C-4DB8-817D-F92DF00215AE";
const WINDOWS_RECOVERY: &str = "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC";

/// Render an on-disk (mixed-endian) GUID in its canonical text form.
fn guid_string(raw: &[u8]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        le_u32(raw, 0),
        le_u16(raw, 4),
        le_u16(raw, 6),
        raw[8],
        raw[9],
        raw[10],
        raw[11],
        raw[12],
        raw[13],
        raw[14],
        raw[15],
    )
}

fn classify_gpt_type(guid: &str) -> (OsClass, String) {
    match guid {
        WINDOWS_BASIC_DATA => (OsClass::Windows, "Windows (Basic Data)".into()),
        LINUX_FILESYSTEM => (OsClass::Linux, "Linux Filesystem".into()),
        LINUX_LVM => (OsClass::Linux, "Linux LVM".into()),
        EFI_SYSTEM => (OsClass::Other, "EFI System Partition".into()),
        MICROSOFT_RESERVED => (OsClass::Other, "Microsoft Reserved".into()),
        WINDOWS_RECOVERY => (OsClass::Other, "Windows Recovery".into()),
        other => (OsClass::Other, format!("Unknown ({other})")),
    }
}

fn parse_gpt<D: Read + Seek>(device: &mut D, sector_size: u64) -> io::Result<Vec<Partition>> {
    let header = read_sector(device, 1, sector_size)?;
    if &header[0..8] != GPT_SIGNATURE {
        debug!("protective MBR without GPT header");
        return Ok(Vec::new());
    }

    let entry_lba = le_u64(&header, 72);
    let entry_count = u64::from(le_u32(&header, 80));
    let entry_size = le_u32(&header, 84) as usize;
    if entry_size < GPT_MIN_ENTRY_SIZE {
        warn!(entry_size, "GPT entry size too small");
        return Ok(Vec::new());
    }

    let array_bytes = entry_count.saturating_mul(entry_size as u64);
    if array_bytes > GPT_MAX_ARRAY_BYTES {
        warn!(entry_count, entry_size, "GPT entry array unreasonably large");
        return Ok(Vec::new());
    }

    let mut array = vec![0u8; array_bytes as usize];
    read_at(device, entry_lba * sector_size, &mut array)?;

    let mut partitions = Vec::new();
    for (position, entry) in array.chunks_exact(entry_size).enumerate() {
        let type_guid = &entry[0..16];
        if type_guid.iter().all(|b| *b == 0) {
            continue;
        }
        let first_lba = le_u64(entry, 32);
        let last_lba = le_u64(entry, 40);
        if last_lba < first_lba {
            warn!(position, first_lba, last_lba, "GPT entry with inverted range skipped");
            continue;
        }
        let (os_class, description) = classify_gpt_type(&guid_string(type_guid));
        partitions.push(Partition {
            index: position as u32 + 1,
            start_offset_bytes: first_lba * sector_size,
            size_bytes: (last_lba - first_lba + 1) * sector_size,
            os_class,
            description,
        });
    }
    Ok(partitions)
}
