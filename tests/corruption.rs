//! Corruption detection tests
//!
//! Damaged files must fail with an error, never panic.

use hfa_rs::{Access, Container, CreateOptions, HfaError, PixelType};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

/// Helper: Overwrite bytes at a file offset
fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}

fn small_image(dir: &TempDir, options: &CreateOptions) -> std::path::PathBuf {
    let path = dir.path().join("damaged.img");
    let mut img = Container::create(&path, 128, 128, 1, PixelType::U8, options).unwrap();
    let block: Vec<u8> = (0..64 * 64).map(|i| (i / 512) as u8).collect();
    img.write_block(0, 0, 0, &block).unwrap();
    img.close().unwrap();
    path
}

fn block_offset(path: &Path, block: usize) -> u64 {
    let mut img = Container::open(path, Access::ReadOnly).unwrap();
    let node = img.band(0).unwrap().node();
    let tree = img.tree();
    let dms = tree.named_child(node, "RasterDMS").unwrap().unwrap();
    tree.get_int(dms, &format!("blockinfo[{}].offset", block)).unwrap() as u64
}

#[test]
fn test_bad_magic() {
    let dir = TempDir::new().unwrap();
    let path = small_image(&dir, &CreateOptions::default());
    overwrite(&path, 0, b"NOT_AN_HFA_FILE");

    assert!(matches!(
        Container::open(&path, Access::ReadOnly),
        Err(HfaError::InvalidMagic)
    ));
}

#[test]
fn test_empty_and_tiny_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiny.img");

    std::fs::write(&path, b"").unwrap();
    assert!(Container::open(&path, Access::ReadOnly).is_err());

    std::fs::write(&path, b"EHFA_HEADER_TAG\0").unwrap();
    assert!(matches!(
        Container::open(&path, Access::ReadOnly),
        Err(HfaError::Corrupt(_))
    ));
}

#[test]
fn test_zero_root_pointer() {
    let dir = TempDir::new().unwrap();
    let path = small_image(&dir, &CreateOptions::default());
    // rootEntryPtr sits 8 bytes into the record at offset 20
    overwrite(&path, 28, &0u32.to_le_bytes());

    assert!(matches!(
        Container::open(&path, Access::ReadOnly),
        Err(HfaError::Corrupt(_))
    ));
}

#[test]
fn test_root_pointer_past_end() {
    let dir = TempDir::new().unwrap();
    let path = small_image(&dir, &CreateOptions::default());
    overwrite(&path, 28, &0x7fff_0000u32.to_le_bytes());

    assert!(Container::open(&path, Access::ReadOnly).is_err());
}

#[test]
fn test_garbled_dictionary_is_survivable() {
    let dir = TempDir::new().unwrap();
    let path = small_image(&dir, &CreateOptions::default());
    // Break the first definition; the built-in types still describe the file
    overwrite(&path, 38, b"{1:?");

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.band_count(), 1);
    assert!(img.read_block(0, 0, 0).is_ok());
}

#[test]
fn test_corrupt_compressed_block() {
    let dir = TempDir::new().unwrap();
    let options = CreateOptions {
        compressed: true,
        ..CreateOptions::default()
    };
    let path = small_image(&dir, &options);
    let offset = block_offset(&path, 0);
    // Bits per value of 3 is not a valid width
    overwrite(&path, offset + 12, &[3]);

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert!(matches!(
        img.read_block(0, 0, 0),
        Err(HfaError::CorruptBlock { block: 0, .. })
    ));
    // Other blocks are unaffected
    assert_eq!(img.read_block(0, 1, 1).unwrap(), vec![0u8; 64 * 64]);
}

#[test]
fn test_truncated_raw_block_reads_zero() {
    let dir = TempDir::new().unwrap();
    let path = small_image(&dir, &CreateOptions::default());
    let offset = block_offset(&path, 0);
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(offset + 100).unwrap();
    drop(file);

    match Container::open(&path, Access::ReadOnly) {
        Ok(mut img) => {
            // A raw block cut short reads as zeros rather than garbage
            assert_eq!(img.read_block(0, 0, 0).unwrap(), vec![0u8; 64 * 64]);
        }
        Err(_) => {
            // Entries after the cut may be lost - also acceptable
        }
    }
}

#[test]
fn test_short_block_table() {
    let dir = TempDir::new().unwrap();
    let path = small_image(&dir, &CreateOptions::default());

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    let node = img.band(0).unwrap().node();
    let tree = img.tree();
    let dms = tree.named_child(node, "RasterDMS").unwrap().unwrap();
    // blockinfo count lives 14 bytes into the payload
    let count_pos = tree.data_pos(dms) as u64 + 14;
    drop(img);
    overwrite(&path, count_pos, &2u32.to_le_bytes());

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert!(matches!(img.read_block(0, 0, 0), Err(HfaError::Corrupt(_))));
}
