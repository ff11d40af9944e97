//! Fixed-layout records: the file header tag, the `Ehfa_File` record and
//! the per-entry header.

use crate::error::{HfaError, Result};
use crate::pack;

pub const MAGIC: [u8; 16] = *b"EHFA_HEADER_TAG\0";

/// Offset of the `Ehfa_File` record in files this crate creates
pub const HEADER_POS: u32 = 20;

/// Offset of the dictionary text in files this crate creates
pub const DICTIONARY_POS: u32 = 38;

pub const FILE_VERSION: i32 = 1;

/// Conventional entry header length
pub const ENTRY_HEADER_LEN: u16 = 128;

/// Bytes actually used inside an entry header
pub const ENTRY_HEADER_USED: usize = 6 * 4 + NAME_LEN + TYPE_LEN + 4;

pub const NAME_LEN: usize = 64;
pub const TYPE_LEN: usize = 32;

/// Size of the tag plus header pointer
pub const TAG_LEN: usize = 20;

/// Size of the `Ehfa_File` record
pub const RECORD_LEN: usize = 18;

/// Offset of `rootEntryPtr` inside the record
pub const ROOT_PTR_OFFSET: u32 = 8;

/// Offset of `dictionaryPtr` inside the record
pub const DICTIONARY_PTR_OFFSET: u32 = 14;

/// Container file header
///
/// The 16-byte tag and the header pointer occupy bytes 0-19. The
/// `Ehfa_File` record lives wherever the pointer says, which is byte 20
/// for every file this crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Offset of the `Ehfa_File` record
    pub header_pos: u32,

    pub version: i32,

    /// Unused free-list pointer (always written as 0)
    pub free_list: u32,

    /// Offset of the root entry
    pub root_pos: u32,

    /// Length reserved for each entry header
    pub entry_header_length: u16,

    /// Offset of the NUL-terminated dictionary text
    pub dictionary_pos: u32,
}

impl FileHeader {
    pub fn new() -> Self {
        FileHeader {
            header_pos: HEADER_POS,
            version: FILE_VERSION,
            free_list: 0,
            root_pos: 0,
            entry_header_length: ENTRY_HEADER_LEN,
            dictionary_pos: DICTIONARY_POS,
        }
    }

    /// Check the tag and return the header pointer
    pub fn read_tag(bytes: &[u8]) -> Result<u32> {
        let tag = bytes.get(..15).ok_or(HfaError::InvalidMagic)?;
        if !tag.eq_ignore_ascii_case(&MAGIC[..15]) {
            return Err(HfaError::InvalidMagic);
        }
        pack::get_u32(bytes, 16).ok_or_else(|| {
            HfaError::Corrupt("file too short to hold a header pointer".to_string())
        })
    }

    /// Parse the `Ehfa_File` record found at `header_pos`
    pub fn from_record(header_pos: u32, bytes: &[u8]) -> Result<Self> {
        let short = || HfaError::Corrupt("truncated Ehfa_File record".to_string());
        let header = FileHeader {
            header_pos,
            version: pack::get_i32(bytes, 0).ok_or_else(short)?,
            free_list: pack::get_u32(bytes, 4).ok_or_else(short)?,
            root_pos: pack::get_u32(bytes, 8).ok_or_else(short)?,
            entry_header_length: pack::get_u16(bytes, 12).ok_or_else(short)?,
            dictionary_pos: pack::get_u32(bytes, 14).ok_or_else(short)?,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if usize::from(self.entry_header_length) < ENTRY_HEADER_USED {
            return Err(HfaError::Corrupt(format!(
                "entry header length {} is shorter than {} bytes",
                self.entry_header_length, ENTRY_HEADER_USED
            )));
        }
        if self.root_pos == 0 {
            return Err(HfaError::Corrupt("root entry pointer is zero".to_string()));
        }
        if self.dictionary_pos == 0 {
            return Err(HfaError::Corrupt("dictionary pointer is zero".to_string()));
        }
        Ok(())
    }

    /// Serialize the tag, the header pointer and the record
    ///
    /// Only meaningful when `header_pos` is [`HEADER_POS`], which is how
    /// new files are laid out.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TAG_LEN + RECORD_LEN);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&self.header_pos.to_le_bytes());
        bytes.extend_from_slice(&self.record_bytes());
        bytes
    }

    pub fn record_bytes(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&self.version.to_le_bytes());
        record[4..8].copy_from_slice(&self.free_list.to_le_bytes());
        record[8..12].copy_from_slice(&self.root_pos.to_le_bytes());
        record[12..14].copy_from_slice(&self.entry_header_length.to_le_bytes());
        record[14..18].copy_from_slice(&self.dictionary_pos.to_le_bytes());
        record
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk header of one entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryHeader {
    pub next: u32,
    pub prev: u32,
    pub parent: u32,
    pub child: u32,
    pub data_pos: u32,
    pub data_size: u32,
    pub name: String,
    pub type_name: String,
    pub mod_time: u32,
}

impl EntryHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_HEADER_USED {
            return Err(HfaError::Corrupt(format!(
                "entry header needs {} bytes, got {}",
                ENTRY_HEADER_USED,
                bytes.len()
            )));
        }

        let word = |i: usize| pack::get_u32(bytes, i * 4).unwrap_or(0);
        let data_size = pack::get_i32(bytes, 20).unwrap_or(0);
        if data_size < 0 {
            return Err(HfaError::Corrupt(format!(
                "negative entry payload size {}",
                data_size
            )));
        }

        Ok(EntryHeader {
            next: word(0),
            prev: word(1),
            parent: word(2),
            child: word(3),
            data_pos: word(4),
            data_size: data_size as u32,
            name: c_string(&bytes[24..24 + NAME_LEN]),
            type_name: c_string(&bytes[24 + NAME_LEN..24 + NAME_LEN + TYPE_LEN]),
            mod_time: pack::get_u32(bytes, 24 + NAME_LEN + TYPE_LEN).unwrap_or(0),
        })
    }

    /// Serialize, padded with zeros to `header_len`
    pub fn to_bytes(&self, header_len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(header_len.max(ENTRY_HEADER_USED));
        for word in [
            self.next,
            self.prev,
            self.parent,
            self.child,
            self.data_pos,
            self.data_size,
        ] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.extend_from_slice(&fixed_text(&self.name, NAME_LEN));
        bytes.extend_from_slice(&fixed_text(&self.type_name, TYPE_LEN));
        bytes.extend_from_slice(&self.mod_time.to_le_bytes());
        bytes.resize(header_len.max(ENTRY_HEADER_USED), 0);
        bytes
    }
}

/// Text up to the first NUL
pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Zero-padded field that always keeps a terminating NUL
fn fixed_text(text: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let raw = text.as_bytes();
    let n = raw.len().min(len - 1);
    out[..n].copy_from_slice(&raw[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = FileHeader::new();
        header.root_pos = 4000;
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), DICTIONARY_POS as usize);
        assert_eq!(&bytes[..15], b"EHFA_HEADER_TAG");
        assert_eq!(FileHeader::read_tag(&bytes).unwrap(), HEADER_POS);

        let parsed = FileHeader::from_record(HEADER_POS, &bytes[HEADER_POS as usize..]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(
            pack::get_u32(&bytes, (HEADER_POS + ROOT_PTR_OFFSET) as usize),
            Some(4000)
        );
        assert_eq!(
            pack::get_u32(&bytes, (HEADER_POS + DICTIONARY_PTR_OFFSET) as usize),
            Some(DICTIONARY_POS)
        );
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = FileHeader::new().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            FileHeader::read_tag(&bytes),
            Err(HfaError::InvalidMagic)
        ));
    }

    #[test]
    fn test_magic_case_insensitive() {
        let mut bytes = FileHeader::new().to_bytes();
        bytes[..15].copy_from_slice(b"ehfa_header_tag");
        assert!(FileHeader::read_tag(&bytes).is_ok());
    }

    #[test]
    fn test_short_entry_header_length_rejected() {
        let mut header = FileHeader::new();
        header.root_pos = 100;
        header.entry_header_length = 64;
        assert!(matches!(header.validate(), Err(HfaError::Corrupt(_))));
    }

    #[test]
    fn test_entry_header_round_trip() {
        let header = EntryHeader {
            next: 1,
            prev: 2,
            parent: 3,
            child: 4,
            data_pos: 5,
            data_size: 6,
            name: "Layer_1".to_string(),
            type_name: "Eimg_Layer".to_string(),
            mod_time: 0,
        };
        let bytes = header.to_bytes(ENTRY_HEADER_LEN as usize);
        assert_eq!(bytes.len(), ENTRY_HEADER_LEN as usize);
        assert_eq!(EntryHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_entry_name_truncated() {
        let header = EntryHeader {
            name: "n".repeat(100),
            ..Default::default()
        };
        let parsed = EntryHeader::from_bytes(&header.to_bytes(128)).unwrap();
        assert_eq!(parsed.name.len(), NAME_LEN - 1);
    }
}
