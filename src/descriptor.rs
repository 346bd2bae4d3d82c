//! HID report descriptor parsing.
//!
//! Only as much of the descriptor grammar is understood as is needed to compute
//! the size of the largest input report, which is the size the kernel HID gadget
//! driver uses for every report transferred through a `hidg` device.

use std::{fmt, fs, num::NonZeroU32, path::Path};

use crate::{Error, Result};

/// Prefix byte introducing a long item.
const LONG_ITEM: u8 = 0xfe;

/// Report length used if a descriptor declares no input items.
pub const DEFAULT_REPORT_LEN: u32 = 8;

/// Item type encoded in the item prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// Main item (input, output, feature, collection).
    Main,
    /// Global item (report size, report count, report id, ...).
    Global,
    /// Local item (usage, ...).
    Local,
    /// Reserved item type.
    Reserved,
}

impl ItemType {
    fn from_prefix(prefix: u8) -> Self {
        match (prefix >> 2) & 0x03 {
            0 => Self::Main,
            1 => Self::Global,
            2 => Self::Local,
            _ => Self::Reserved,
        }
    }
}

/// Main item tags.
pub mod main_tag {
    /// Input item.
    pub const INPUT: u8 = 0x08;
}

/// Global item tags.
pub mod global_tag {
    /// Report size in bits.
    pub const REPORT_SIZE: u8 = 0x07;
    /// Report id.
    pub const REPORT_ID: u8 = 0x08;
    /// Report count.
    pub const REPORT_COUNT: u8 = 0x09;
}

/// Item of a report descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item<'a> {
    /// Short item.
    Short {
        /// Item type.
        item_type: ItemType,
        /// Item tag.
        tag: u8,
        /// Item data, 0, 1, 2 or 4 bytes.
        data: &'a [u8],
    },
    /// Long item.
    Long {
        /// Long item tag.
        tag: u8,
        /// Item data.
        data: &'a [u8],
    },
}

impl Item<'_> {
    /// Unsigned little-endian value of the item data.
    pub fn value(&self) -> u32 {
        let data = match self {
            Self::Short { data, .. } => data,
            Self::Long { .. } => return 0,
        };
        data.iter().take(4).enumerate().fold(0, |acc, (i, b)| acc | u32::from(*b) << (8 * i))
    }
}

/// Iterator over the items of a report descriptor.
///
/// Yields an error and stops if an item is truncated.
#[derive(Debug, Clone)]
pub struct Items<'a> {
    desc: &'a [u8],
    pos: usize,
}

impl<'a> Items<'a> {
    /// Iterates over the items of the specified descriptor.
    pub fn new(desc: &'a [u8]) -> Self {
        Self { desc, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.pos;
        let data = start
            .checked_add(len)
            .and_then(|end| self.desc.get(start..end))
            .ok_or_else(|| {
                Error::MalformedDescriptor(format!(
                    "item at offset {} needs {len} bytes but only {} remain",
                    start.saturating_sub(1),
                    self.desc.len() - start
                ))
            })?;
        self.pos += len;
        Ok(data)
    }

    fn parse_item(&mut self, prefix: u8) -> Result<Item<'a>> {
        if prefix == LONG_ITEM {
            let header = self.take(2)?;
            let (size, tag) = (header[0], header[1]);
            let data = self.take(size.into())?;
            return Ok(Item::Long { tag, data });
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n.into(),
        };
        let data = self.take(size)?;
        Ok(Item::Short { item_type: ItemType::from_prefix(prefix), tag: prefix >> 4, data })
    }
}

impl<'a> Iterator for Items<'a> {
    type Item = Result<Item<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let prefix = *self.desc.get(self.pos)?;
        self.pos += 1;

        let res = self.parse_item(prefix);
        if res.is_err() {
            self.pos = self.desc.len();
        }
        Some(res)
    }
}

/// Length of a report in bytes, including the report id prefix if present.
///
/// Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportLength(NonZeroU32);

impl ReportLength {
    /// Creates a report length, substituting [`DEFAULT_REPORT_LEN`] for zero.
    pub fn new(len: u32) -> Self {
        Self(NonZeroU32::new(len).unwrap_or(NonZeroU32::MIN.saturating_add(DEFAULT_REPORT_LEN - 1)))
    }

    /// Length in bytes.
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Length in bytes as `usize`.
    pub const fn bytes(self) -> usize {
        self.0.get() as usize
    }
}

impl Default for ReportLength {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_LEN)
    }
}

impl fmt::Display for ReportLength {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ReportLength> for u32 {
    fn from(len: ReportLength) -> Self {
        len.get()
    }
}

/// Accumulates input bits per report and tracks the largest report.
#[derive(Debug, Default)]
struct Accumulator {
    report_size: u32,
    report_count: u32,
    bits: u64,
    has_report_ids: bool,
    max_len: u64,
}

impl Accumulator {
    fn flush(&mut self) {
        if self.bits == 0 {
            return;
        }
        let len = self.bits.div_ceil(8) + u64::from(self.has_report_ids);
        self.max_len = self.max_len.max(len);
        self.bits = 0;
    }

    fn item(&mut self, item: &Item) -> Result<()> {
        let Item::Short { item_type, tag, .. } = *item else { return Ok(()) };
        match (item_type, tag) {
            (ItemType::Global, global_tag::REPORT_SIZE) => self.report_size = item.value(),
            (ItemType::Global, global_tag::REPORT_COUNT) => self.report_count = item.value(),
            (ItemType::Global, global_tag::REPORT_ID) => {
                self.flush();
                self.has_report_ids = true;
            }
            (ItemType::Main, main_tag::INPUT) => {
                self.bits = u64::from(self.report_size)
                    .checked_mul(u64::from(self.report_count))
                    .and_then(|bits| self.bits.checked_add(bits))
                    .ok_or_else(|| Error::MalformedDescriptor("input report size overflows".to_string()))?;
            }
            _ => (),
        }
        Ok(())
    }
}

/// Computes the length of the largest input report declared by a report descriptor.
///
/// If any report id item is present, one byte for the report id prefix is included.
/// If no input items are declared, [`DEFAULT_REPORT_LEN`] is returned.
pub fn report_length(desc: &[u8]) -> Result<ReportLength> {
    let mut acc = Accumulator::default();
    for item in Items::new(desc) {
        acc.item(&item?)?;
    }
    acc.flush();

    let len = u32::try_from(acc.max_len)
        .map_err(|_| Error::MalformedDescriptor(format!("report length of {} bytes is too large", acc.max_len)))?;
    Ok(ReportLength::new(len))
}

/// Reads a report descriptor from a file and computes its report length.
pub fn report_length_from_file(path: impl AsRef<Path>) -> Result<ReportLength> {
    let path = path.as_ref();
    let desc = fs::read(path).map_err(|err| Error::device(path, err))?;
    let len = report_length(&desc)?;
    log::debug!("report descriptor {} ({} bytes) has report length {len}", path.display(), desc.len());
    Ok(len)
}
