//! Decoded container contents.
//!
//! A bank is an ordered list of typed sections. A package is a header with a
//! string table and a flat table of audio entries. Neither type carries file
//! I/O; loading and saving is the codec's job.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::hierarchy::HierarchyEntry;
use super::ids::AudioId;

/// Section kinds a bank can be filtered on when loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    /// Bank header (`BKHD`).
    Header,
    /// Payload index (`DIDX`).
    Index,
    /// Object hierarchy (`HIRC`).
    Hierarchy,
    /// Embedded payload (`DATA`).
    Payload,
}

impl SectionKind {
    /// Four-character section tag.
    pub fn magic(self) -> &'static str {
        match self {
            Self::Header => "BKHD",
            Self::Index => "DIDX",
            Self::Hierarchy => "HIRC",
            Self::Payload => "DATA",
        }
    }

    /// Sections loaded when opening a bank for editing.
    pub fn editing_set() -> &'static [SectionKind] {
        &[Self::Header, Self::Index, Self::Hierarchy, Self::Payload]
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.magic())
    }
}

/// Which container family a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Hierarchical bank.
    Bank,
    /// Flat package.
    Package,
}

impl ContainerKind {
    /// Four-byte file signature.
    pub fn signature(self) -> &'static [u8; 4] {
        match self {
            Self::Bank => b"BKHD",
            Self::Package => b"AKPK",
        }
    }

    /// Identify a container from the first bytes of its file.
    pub fn sniff(head: &[u8]) -> Option<Self> {
        let magic = head.get(..4)?;
        [Self::Bank, Self::Package]
            .into_iter()
            .find(|kind| kind.signature().as_slice() == magic)
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bank => f.write_str("bank"),
            Self::Package => f.write_str("package"),
        }
    }
}

/// Bank header section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BankHeader {
    /// Format version.
    pub version: u32,
    /// Bank id.
    pub bank_id: u32,
    /// Remaining header bytes, kept verbatim.
    #[serde(default)]
    pub data: Vec<u8>,
}

/// One entry of the payload index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Audio id.
    pub id: u32,
    /// Byte offset into the payload section.
    pub offset: u32,
    /// Byte length.
    pub length: u32,
}

impl IndexEntry {
    /// Entry whose offset and length the codec fills in on save.
    pub fn placeholder(id: AudioId) -> Self {
        Self {
            id: id.get(),
            offset: 0,
            length: 0,
        }
    }

    /// Reset offset and length so the codec recomputes them on save.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
    }
}

/// Payload index section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexSection {
    /// Entries in file order.
    pub entries: Vec<IndexEntry>,
}

impl IndexSection {
    /// Find the entry for an id.
    pub fn entry_mut(&mut self, id: AudioId) -> Option<&mut IndexEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id.get())
    }

    /// Set of valid ids present in the index.
    pub fn ids(&self) -> BTreeSet<AudioId> {
        self.entries
            .iter()
            .filter_map(|entry| AudioId::new(entry.id))
            .collect()
    }
}

/// Object hierarchy section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HierarchySection {
    /// Entries in file order.
    pub entries: Vec<HierarchyEntry>,
}

/// Embedded payload section, addressed by index offsets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PayloadSection {
    /// Concatenated audio bytes.
    pub data: Vec<u8>,
}

/// One bank section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section")]
pub enum Section {
    /// `BKHD`.
    Header(BankHeader),
    /// `DIDX`.
    Index(IndexSection),
    /// `HIRC`.
    Hierarchy(HierarchySection),
    /// `DATA`.
    Payload(PayloadSection),
    /// Any other section, passed through untouched.
    Unknown {
        /// Four-character tag.
        magic: String,
        /// Raw body.
        data: Vec<u8>,
    },
}

impl Section {
    /// Kind of a known section, `None` for passthrough sections.
    pub fn kind(&self) -> Option<SectionKind> {
        match self {
            Self::Header(_) => Some(SectionKind::Header),
            Self::Index(_) => Some(SectionKind::Index),
            Self::Hierarchy(_) => Some(SectionKind::Hierarchy),
            Self::Payload(_) => Some(SectionKind::Payload),
            Self::Unknown { .. } => None,
        }
    }
}

/// Decoded bank.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BankData {
    /// Sections in file order.
    pub sections: Vec<Section>,
}

impl BankData {
    /// Whether a section of this kind is present.
    pub fn has_section(&self, kind: SectionKind) -> bool {
        self.sections.iter().any(|s| s.kind() == Some(kind))
    }

    /// Whether payload bytes are embedded.
    pub fn has_payload(&self) -> bool {
        self.has_section(SectionKind::Payload)
    }

    /// Hierarchy entries, empty when the bank has no hierarchy section.
    pub fn hierarchy(&self) -> &[HierarchyEntry] {
        self.sections
            .iter()
            .find_map(|s| match s {
                Section::Hierarchy(h) => Some(h.entries.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Mutable hierarchy entries.
    pub fn hierarchy_mut(&mut self) -> Option<&mut Vec<HierarchyEntry>> {
        self.sections.iter_mut().find_map(|s| match s {
            Section::Hierarchy(h) => Some(&mut h.entries),
            _ => None,
        })
    }

    /// Payload index, if present.
    pub fn index(&self) -> Option<&IndexSection> {
        self.sections.iter().find_map(|s| match s {
            Section::Index(index) => Some(index),
            _ => None,
        })
    }

    /// Embedded payload, if present.
    pub fn payload(&self) -> Option<&PayloadSection> {
        self.sections.iter().find_map(|s| match s {
            Section::Payload(payload) => Some(payload),
            _ => None,
        })
    }

    /// Get the index section, inserting an empty one right after the header
    /// when missing.
    pub fn ensure_index(&mut self) -> &mut IndexSection {
        let position = match self.position(SectionKind::Index) {
            Some(position) => position,
            None => {
                let at = self
                    .position(SectionKind::Header)
                    .map(|header| header + 1)
                    .unwrap_or(0);
                self.sections.insert(at, Section::Index(IndexSection::default()));
                at
            }
        };
        match &mut self.sections[position] {
            Section::Index(index) => index,
            _ => unreachable!("position() matched an index section"),
        }
    }

    /// Insert an empty payload section after the index when missing.
    ///
    /// Returns `true` when a section was added.
    pub fn ensure_payload(&mut self) -> bool {
        if self.has_payload() {
            return false;
        }
        let at = self
            .position(SectionKind::Index)
            .or_else(|| self.position(SectionKind::Header))
            .map(|p| p + 1)
            .unwrap_or(self.sections.len());
        self.sections
            .insert(at, Section::Payload(PayloadSection::default()));
        true
    }

    fn position(&self, kind: SectionKind) -> Option<usize> {
        self.sections.iter().position(|s| s.kind() == Some(kind))
    }
}

/// One audio entry of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    /// Audio id.
    pub id: u32,
    /// Block size multiplier for `offset`.
    pub block_size: u32,
    /// Byte length.
    pub length: u32,
    /// Byte offset (in blocks).
    pub offset: u32,
    /// Language id, resolved through the string table.
    pub language_id: u32,
}

/// Package header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageHeader {
    /// Format version.
    pub version: u32,
    /// Language id to name.
    pub string_table: BTreeMap<u32, String>,
    /// Streamed audio entries.
    pub entries: Vec<PackageEntry>,
}

/// Decoded package.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageData {
    /// Header with the entry table.
    pub header: PackageHeader,
    /// Whether payload bytes are embedded in the file.
    pub has_payload: bool,
}

impl PackageData {
    /// Ids listed in the entry table, in table order.
    pub fn entry_ids(&self) -> Vec<AudioId> {
        self.header
            .entries
            .iter()
            .filter_map(|entry| AudioId::new(entry.id))
            .collect()
    }

    /// Whether the entry table lists an id.
    pub fn contains(&self, id: AudioId) -> bool {
        self.header.entries.iter().any(|entry| entry.id == id.get())
    }
}

/// Decoded contents of either container family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum ContainerData {
    /// Hierarchical bank.
    Bank(BankData),
    /// Flat package.
    Package(PackageData),
}

impl ContainerData {
    /// Container family.
    pub fn kind(&self) -> ContainerKind {
        match self {
            Self::Bank(_) => ContainerKind::Bank,
            Self::Package(_) => ContainerKind::Package,
        }
    }

    /// Whether payload bytes are embedded.
    pub fn has_payload(&self) -> bool {
        match self {
            Self::Bank(bank) => bank.has_payload(),
            Self::Package(package) => package.has_payload,
        }
    }

    /// Hierarchy entries; packages have none.
    pub fn hierarchy(&self) -> &[HierarchyEntry] {
        match self {
            Self::Bank(bank) => bank.hierarchy(),
            Self::Package(_) => &[],
        }
    }
}
