//! FAT Directory Entry Structures
//!
//! Directory entries are 32 bytes each and contain:
//! - File name (8.3 short alias)
//! - Attributes
//! - Timestamps
//! - First cluster
//! - File size
//!
//! # Long File Names (LFN)
//! LFN entries precede the short entry and store up to 13 UTF-16 code
//! units each. They are stored in reverse order: the slot written first
//! carries the highest sequence number and the 0x40 "last" flag. Every slot
//! holds the checksum of the short alias it belongs to.
//!
//! Records are decoded from and encoded into plain byte buffers at fixed
//! offsets; nothing here depends on struct layout.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use crate::fs::vfs::DateTime;
use super::error::{FatError, Resource, Result};
use super::{le16, le32, put16, put32};

/// Directory entry size
pub const DIR_ENTRY_SIZE: usize = 32;

/// UTF-16 code units per LFN entry
pub const LFN_CHARS_PER_ENTRY: usize = 13;

/// Maximum LFN entries for one name
pub const MAX_LFN_ENTRIES: usize = 20;

bitflags::bitflags! {
    /// Short entry attribute byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FatAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// Attribute byte of a long file name entry
pub const ATTR_LFN: u8 = 0x0F;

/// Bits compared when detecting an LFN entry
const ATTR_LFN_MASK: u8 = 0x3F;

/// Special first byte values
pub mod entry_status {
    /// Entry is free
    pub const FREE: u8 = 0xE5;
    /// Entry is free and all following entries are free
    pub const END: u8 = 0x00;
    /// First byte was 0xE5, stored as 0x05
    pub const KANJI: u8 = 0x05;
}

/// Field offsets within a 32-byte record
mod field {
    pub const NAME: usize = 0x00;
    pub const ATTR: usize = 0x0B;
    pub const RESERVED: usize = 0x0C;
    pub const CREATE_TENTHS: usize = 0x0D;
    pub const CREATE_TIME: usize = 0x0E;
    pub const CREATE_DATE: usize = 0x10;
    pub const ACCESS_DATE: usize = 0x12;
    pub const CLUSTER_HI: usize = 0x14;
    pub const MODIFY_TIME: usize = 0x16;
    pub const MODIFY_DATE: usize = 0x18;
    pub const CLUSTER_LO: usize = 0x1A;
    pub const SIZE: usize = 0x1C;

    pub const LFN_SEQUENCE: usize = 0x00;
    pub const LFN_CHECKSUM: usize = 0x0D;
    /// Offsets of the 13 UTF-16 units in an LFN entry
    pub const LFN_CHARS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
}

/// Flag on the LFN entry with the highest sequence number
const LFN_LAST_ENTRY: u8 = 0x40;

/// Sequence number bits of an LFN entry
const LFN_SEQUENCE_MASK: u8 = 0x1F;

/// One decoded directory record: a short entry and its long name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub name: String,
    /// 8.3 alias, space padded, first byte already unescaped
    pub alias: [u8; 11],
    pub attributes: FatAttributes,
    pub reserved: u8,
    pub creation_tenths: u8,
    pub created: DateTime,
    pub modified: DateTime,
    pub accessed: DateTime,
    pub start_cluster: u32,
    /// Size field as stored; zero for directories
    pub size: u32,
}

impl DirRecord {
    pub fn new(name: &str, alias: [u8; 11], attributes: FatAttributes) -> Self {
        Self {
            name: String::from(name),
            alias,
            attributes,
            reserved: 0,
            creation_tenths: 0,
            created: DateTime::default(),
            modified: DateTime::default(),
            accessed: DateTime::default(),
            start_cluster: 0,
            size: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FatAttributes::DIRECTORY)
    }

    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// Directory entries this record occupies, LFN entries included
    pub fn entry_count(&self) -> usize {
        if self.is_dot() {
            1
        } else {
            1 + self.name.encode_utf16().count().div_ceil(LFN_CHARS_PER_ENTRY)
        }
    }
}

/// Calculate checksum for short name
pub fn lfn_checksum(alias: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in alias.iter() {
        sum = sum.rotate_right(1).wrapping_add(b);
    }
    sum
}

/// Readable form of an 8.3 alias: lowercase "base.ext"
pub fn alias_to_name(alias: &[u8; 11]) -> String {
    fn trimmed(part: &[u8]) -> &[u8] {
        let end = part.iter().rposition(|&b| b != b' ').map(|p| p + 1).unwrap_or(0);
        &part[..end]
    }

    let base = trimmed(&alias[..8]);
    let ext = trimmed(&alias[8..]);

    let mut name = String::with_capacity(12);
    name.extend(base.iter().map(|&b| (b as char).to_ascii_lowercase()));
    if !ext.is_empty() {
        name.push('.');
        name.extend(ext.iter().map(|&b| (b as char).to_ascii_lowercase()));
    }
    name
}

/// Total directory entries needed to store `records`
pub fn required_entries(records: &[DirRecord]) -> usize {
    records.iter().map(DirRecord::entry_count).sum()
}

fn is_lfn(record: &[u8]) -> bool {
    record[field::ATTR] & ATTR_LFN_MASK == ATTR_LFN
}

/// Long name being collected from LFN entries
struct PendingName {
    units: Vec<u16>,
    checksum: u8,
    /// Sequence number the next LFN entry must carry
    next: u8,
}

impl PendingName {
    fn store(&mut self, sequence: u8, record: &[u8]) {
        let base = (sequence as usize - 1) * LFN_CHARS_PER_ENTRY;
        for (i, &offset) in field::LFN_CHARS.iter().enumerate() {
            self.units[base + i] = le16(record, offset);
        }
    }

    /// The name, if the sequence completed and belongs to `alias`
    fn finish(self, alias: &[u8; 11]) -> Option<String> {
        if self.next != 0 || self.checksum != lfn_checksum(alias) {
            return None;
        }
        let end = self
            .units
            .iter()
            .position(|&u| u == 0x0000 || u == 0xFFFF)
            .unwrap_or(self.units.len());
        if end == 0 {
            return None;
        }
        Some(
            char::decode_utf16(self.units[..end].iter().copied())
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        )
    }
}

/// Decode the records of a raw directory.
///
/// Stops at the first entry starting with 0x00. Deleted entries and volume
/// labels are skipped. A long name whose sequence is broken or whose
/// checksum does not match its short entry is dropped and the alias is
/// used instead.
pub fn scan_directory(raw: &[u8]) -> Vec<DirRecord> {
    let mut records = Vec::new();
    let mut pending: Option<PendingName> = None;

    for record in raw.chunks_exact(DIR_ENTRY_SIZE) {
        let first = record[field::NAME];
        if first == entry_status::END {
            break;
        }
        if first == entry_status::FREE {
            pending = None;
            continue;
        }

        if is_lfn(record) {
            let sequence = record[field::LFN_SEQUENCE];
            let number = sequence & LFN_SEQUENCE_MASK;
            let checksum = record[field::LFN_CHECKSUM];

            if sequence & LFN_LAST_ENTRY != 0 {
                pending = None;
                if number >= 1 && number as usize <= MAX_LFN_ENTRIES {
                    let mut name = PendingName {
                        units: vec![0xFFFF; number as usize * LFN_CHARS_PER_ENTRY],
                        checksum,
                        next: number - 1,
                    };
                    name.store(number, record);
                    pending = Some(name);
                }
            } else {
                pending = match pending.take() {
                    Some(mut name) if number != 0 && number == name.next && checksum == name.checksum => {
                        name.store(number, record);
                        name.next -= 1;
                        Some(name)
                    }
                    _ => None,
                };
            }
            continue;
        }

        let attributes = FatAttributes::from_bits_retain(record[field::ATTR]);
        if attributes.contains(FatAttributes::VOLUME_ID) {
            pending = None;
            continue;
        }

        let mut alias = [0u8; 11];
        alias.copy_from_slice(&record[field::NAME..field::NAME + 11]);

        let name = pending
            .take()
            .and_then(|p| p.finish(&alias))
            .unwrap_or_else(|| {
                let mut unescaped = alias;
                if unescaped[0] == entry_status::KANJI {
                    unescaped[0] = entry_status::FREE;
                }
                alias_to_name(&unescaped)
            });
        if alias[0] == entry_status::KANJI {
            alias[0] = entry_status::FREE;
        }

        let start_cluster =
            ((le16(record, field::CLUSTER_HI) as u32) << 16) | le16(record, field::CLUSTER_LO) as u32;

        records.push(DirRecord {
            name,
            alias,
            attributes,
            reserved: record[field::RESERVED],
            creation_tenths: record[field::CREATE_TENTHS],
            created: datetime::decode(
                le16(record, field::CREATE_DATE),
                le16(record, field::CREATE_TIME),
            ),
            modified: datetime::decode(
                le16(record, field::MODIFY_DATE),
                le16(record, field::MODIFY_TIME),
            ),
            accessed: datetime::decode(le16(record, field::ACCESS_DATE), 0),
            start_cluster,
            size: le32(record, field::SIZE),
        });
    }

    records
}

fn encode_lfn_entries(out: &mut [u8], record: &DirRecord, checksum: u8) -> Result<usize> {
    let units: Vec<u16> = record.name.encode_utf16().collect();
    let count = units.len().div_ceil(LFN_CHARS_PER_ENTRY);
    if count == 0 || count > MAX_LFN_ENTRIES {
        return Err(FatError::Validation("long name does not fit in LFN entries"));
    }

    for (slot, sequence) in (1..=count).rev().enumerate() {
        let entry = &mut out[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE];
        entry.fill(0);

        let mut seq = sequence as u8;
        if sequence == count {
            seq |= LFN_LAST_ENTRY;
        }
        entry[field::LFN_SEQUENCE] = seq;
        entry[field::ATTR] = ATTR_LFN;
        entry[field::LFN_CHECKSUM] = checksum;

        let base = (sequence - 1) * LFN_CHARS_PER_ENTRY;
        for (i, &offset) in field::LFN_CHARS.iter().enumerate() {
            let unit = match base + i {
                n if n < units.len() => units[n],
                n if n == units.len() => 0x0000,
                _ => 0xFFFF,
            };
            put16(entry, offset, unit);
        }
    }
    Ok(count)
}

/// Alias bytes as written to disk, with a leading 0xE5 escaped
fn stored_alias(alias: &[u8; 11]) -> [u8; 11] {
    let mut stored = *alias;
    if stored[0] == entry_status::FREE {
        stored[0] = entry_status::KANJI;
    }
    stored
}

fn encode_short_entry(entry: &mut [u8], record: &DirRecord) {
    entry.fill(0);
    entry[field::NAME..field::NAME + 11].copy_from_slice(&stored_alias(&record.alias));
    entry[field::ATTR] = record.attributes.bits();
    entry[field::RESERVED] = record.reserved;
    entry[field::CREATE_TENTHS] = record.creation_tenths;

    let (date, time) = datetime::encode(&record.created);
    put16(entry, field::CREATE_TIME, time);
    put16(entry, field::CREATE_DATE, date);
    let (date, _) = datetime::encode(&record.accessed);
    put16(entry, field::ACCESS_DATE, date);
    let (date, time) = datetime::encode(&record.modified);
    put16(entry, field::MODIFY_TIME, time);
    put16(entry, field::MODIFY_DATE, date);

    put16(entry, field::CLUSTER_HI, (record.start_cluster >> 16) as u16);
    put16(entry, field::CLUSTER_LO, (record.start_cluster & 0xFFFF) as u16);
    let size = if record.is_directory() { 0 } else { record.size };
    put32(entry, field::SIZE, size);
}

/// Encode records into a zeroed directory buffer of `len` bytes.
///
/// Every record except "." and ".." is preceded by its LFN entries. Fails
/// with `ResourceExhausted` if the records do not fit.
pub fn fill_directory(records: &[DirRecord], len: usize) -> Result<Vec<u8>> {
    if required_entries(records) * DIR_ENTRY_SIZE > len {
        return Err(FatError::ResourceExhausted(Resource::DirectoryEntries));
    }

    let mut buf = vec![0u8; len];
    let mut pos = 0usize;
    for record in records {
        if !record.is_dot() {
            let checksum = lfn_checksum(&stored_alias(&record.alias));
            let slots = encode_lfn_entries(&mut buf[pos..], record, checksum)?;
            pos += slots * DIR_ENTRY_SIZE;
        }
        encode_short_entry(&mut buf[pos..pos + DIR_ENTRY_SIZE], record);
        pos += DIR_ENTRY_SIZE;
    }
    Ok(buf)
}

/// Packed FAT date and time
///
/// Dates count years from 1980 in 7 bits; times keep seconds in units of
/// two.
pub mod datetime {
    use crate::fs::vfs::DateTime;

    pub const MIN_YEAR: u16 = 1980;
    pub const MAX_YEAR: u16 = 1980 + 127;

    /// Convert FAT time to (hour, minute, second)
    pub fn decode_time(time: u16) -> (u8, u8, u8) {
        let second = ((time & 0x1F) * 2) as u8;
        let minute = ((time >> 5) & 0x3F) as u8;
        let hour = ((time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    /// Convert (hour, minute, second) to FAT time
    pub fn encode_time(hour: u8, minute: u8, second: u8) -> u16 {
        ((hour as u16 & 0x1F) << 11) | ((minute as u16 & 0x3F) << 5) | ((second as u16 / 2) & 0x1F)
    }

    /// Convert FAT date to (year, month, day)
    pub fn decode_date(date: u16) -> (u16, u8, u8) {
        let day = (date & 0x1F) as u8;
        let month = ((date >> 5) & 0x0F) as u8;
        let year = MIN_YEAR + ((date >> 9) & 0x7F);
        (year, month, day)
    }

    /// Convert (year, month, day) to FAT date. Years outside 1980..=2107
    /// are clamped.
    pub fn encode_date(year: u16, month: u8, day: u8) -> u16 {
        let year_offset = year.clamp(MIN_YEAR, MAX_YEAR) - MIN_YEAR;
        (year_offset << 9) | ((month as u16 & 0x0F) << 5) | (day as u16 & 0x1F)
    }

    /// Packed (date, time) for a calendar time
    pub fn encode(dt: &DateTime) -> (u16, u16) {
        (
            encode_date(dt.year, dt.month, dt.day),
            encode_time(dt.hour, dt.minute, dt.second),
        )
    }

    pub fn decode(date: u16, time: u16) -> DateTime {
        let (year, month, day) = decode_date(date);
        let (hour, minute, second) = decode_time(time);
        DateTime { year, month, day, hour, minute, second }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::alias::{DOTDOT_ALIAS, DOT_ALIAS};

    fn alias(s: &[u8; 11]) -> [u8; 11] {
        *s
    }

    fn stamped(mut record: DirRecord) -> DirRecord {
        let t = DateTime::new(2020, 1, 2, 3, 4, 6);
        record.created = t;
        record.modified = t;
        record.accessed = DateTime::new(2020, 1, 2, 0, 0, 0);
        record
    }

    fn sample() -> Vec<DirRecord> {
        let mut dot = stamped(DirRecord::new(".", DOT_ALIAS, FatAttributes::DIRECTORY));
        dot.start_cluster = 9;
        let dotdot = stamped(DirRecord::new("..", DOTDOT_ALIAS, FatAttributes::DIRECTORY));

        let mut long = DirRecord::new(
            "Quarterly Report for the Board.pdf",
            alias(b"QUARTE~1PDF"),
            FatAttributes::ARCHIVE,
        );
        long.start_cluster = 0x0001_2345;
        long.size = 123_456;
        long.created = DateTime::new(2023, 7, 14, 9, 30, 42);
        long.modified = DateTime::new(2024, 2, 29, 23, 59, 58);
        long.accessed = DateTime::new(2024, 3, 1, 0, 0, 0);
        long.creation_tenths = 150;
        long.reserved = 0x18;

        let mut sub = stamped(DirRecord::new("src", alias(b"SRC        "), FatAttributes::DIRECTORY));
        sub.start_cluster = 17;
        sub.size = 4096;

        let mut kanji = stamped(DirRecord::new("\u{e5}x", alias(b"\xE5X         "), FatAttributes::ARCHIVE));
        kanji.size = 1;

        vec![dot, dotdot, long, sub, kanji]
    }

    #[test]
    fn test_directory_round_trip() {
        let records = sample();
        // 1 + 1 + (3 + 1) + (1 + 1) + (1 + 1)
        assert_eq!(required_entries(&records), 10);

        let raw = fill_directory(&records, 16 * DIR_ENTRY_SIZE).unwrap();
        let decoded = scan_directory(&raw);
        assert_eq!(decoded.len(), records.len());

        for (got, want) in decoded.iter().zip(records.iter()) {
            assert_eq!(got.name, want.name);
            assert_eq!(got.alias, want.alias);
            assert_eq!(got.attributes, want.attributes);
            assert_eq!(got.start_cluster, want.start_cluster);
            assert_eq!(got.reserved, want.reserved);
            assert_eq!(got.creation_tenths, want.creation_tenths);
            assert_eq!(got.created, want.created);
            assert_eq!(got.modified, want.modified);
            assert_eq!(got.accessed.year, want.accessed.year);
        }
        // Directories are stored with size 0
        assert_eq!(decoded[3].size, 0);
        assert_eq!(decoded[2].size, 123_456);
    }

    #[test]
    fn test_lfn_layout() {
        let records = sample();
        let raw = fill_directory(&records[2..3], 4 * DIR_ENTRY_SIZE).unwrap();
        let checksum = lfn_checksum(b"QUARTE~1PDF");

        assert_eq!(raw[0], 0x43);
        assert_eq!(raw[DIR_ENTRY_SIZE], 0x02);
        assert_eq!(raw[2 * DIR_ENTRY_SIZE], 0x01);
        for slot in 0..3 {
            assert_eq!(raw[slot * DIR_ENTRY_SIZE + 0x0B], ATTR_LFN);
            assert_eq!(raw[slot * DIR_ENTRY_SIZE + 0x0D], checksum);
        }
        // 34 units: slot 3 holds 8, then the terminator, then padding
        let last = &raw[..DIR_ENTRY_SIZE];
        assert_eq!(le16(last, 1), b'o' as u16);
        assert_eq!(le16(last, 14 + 2 * 3), 0x0000);
        assert_eq!(le16(last, 30), 0xFFFF);
        assert_eq!(&raw[3 * DIR_ENTRY_SIZE..3 * DIR_ENTRY_SIZE + 11], b"QUARTE~1PDF");
    }

    #[test]
    fn test_checksum_mismatch_falls_back_to_alias() {
        let records = sample();
        let mut raw = fill_directory(&records[2..3], 4 * DIR_ENTRY_SIZE).unwrap();
        raw[DIR_ENTRY_SIZE + 0x0D] ^= 0xFF;
        let decoded = scan_directory(&raw);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "quarte~1.pdf");
    }

    #[test]
    fn test_scan_skips_and_stops() {
        let records = sample();
        let mut raw = fill_directory(&records, 16 * DIR_ENTRY_SIZE).unwrap();

        // Delete "src" (its LFN entry and short entry)
        raw[6 * DIR_ENTRY_SIZE] = entry_status::FREE;
        raw[7 * DIR_ENTRY_SIZE] = entry_status::FREE;

        // A volume label after the end marker is never seen
        let label = 11 * DIR_ENTRY_SIZE;
        raw[label..label + 11].copy_from_slice(b"LABEL      ");
        raw[label + 0x0B] = FatAttributes::VOLUME_ID.bits();

        let names: Vec<String> = scan_directory(&raw).into_iter().map(|r| r.name).collect();
        assert_eq!(names, [".", "..", "Quarterly Report for the Board.pdf", "\u{e5}x"]);

        // Stored with the 0x05 escape
        assert_eq!(raw[9 * DIR_ENTRY_SIZE], entry_status::KANJI);
    }

    #[test]
    fn test_volume_label_skipped() {
        let mut raw = vec![0u8; 2 * DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(b"MYDISK     ");
        raw[0x0B] = FatAttributes::VOLUME_ID.bits() | FatAttributes::ARCHIVE.bits();
        raw[DIR_ENTRY_SIZE..DIR_ENTRY_SIZE + 11].copy_from_slice(b"README  TXT");
        raw[DIR_ENTRY_SIZE + 0x0B] = FatAttributes::ARCHIVE.bits();

        let decoded = scan_directory(&raw);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "readme.txt");
    }

    #[test]
    fn test_fill_overflow() {
        let records = sample();
        assert_eq!(
            fill_directory(&records, 9 * DIR_ENTRY_SIZE),
            Err(FatError::ResourceExhausted(Resource::DirectoryEntries))
        );
        assert!(fill_directory(&records, 10 * DIR_ENTRY_SIZE).is_ok());
    }

    #[test]
    fn test_datetime_granularity() {
        let dt = DateTime::new(2001, 9, 9, 1, 46, 39);
        let (date, time) = datetime::encode(&dt);
        let back = datetime::decode(date, time);
        assert_eq!(back, DateTime::new(2001, 9, 9, 1, 46, 38));

        let (date, _) = datetime::encode(&DateTime::new(1970, 1, 1, 0, 0, 0));
        assert_eq!(datetime::decode_date(date).0, 1980);
        let (date, _) = datetime::encode(&DateTime::new(2200, 1, 1, 0, 0, 0));
        assert_eq!(datetime::decode_date(date).0, 2107);
    }

    #[test]
    fn test_checksum_known_value() {
        // Rotate-right-and-add over "README  TXT"
        let mut sum = 0u8;
        for &b in b"README  TXT" {
            sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
        }
        assert_eq!(lfn_checksum(b"README  TXT"), sum);
    }
}
