use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::error::EmberError;
use crate::storage::checksum::{ChecksummedReader, ChecksummedWriter};

const INTERVAL: u32 = 256;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn roundtrip_across_intervals() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data");
    let payload = pattern(5000);

    let mut writer = ChecksummedWriter::new(File::create(&path).unwrap(), INTERVAL);
    writer.write_all(&payload).unwrap();
    assert_eq!(writer.offset(), payload.len() as u64);
    writer.close().unwrap();

    // Physical size: one checksum per interval, final partial included.
    let intervals = payload.len().div_ceil(INTERVAL as usize);
    let physical = std::fs::metadata(&path).unwrap().len();
    assert_eq!(physical, (payload.len() + intervals * 4) as u64);

    let mut reader = ChecksummedReader::new(File::open(&path).unwrap(), INTERVAL);
    let mut out = vec![0u8; payload.len()];
    reader.seek(0);
    reader.read_exact(&mut out).unwrap();
    assert_eq!(out, payload);

    // Random-access reads spanning interval boundaries.
    for (start, len) in [(0usize, 10usize), (250, 20), (255, 2), (4090, 900), (4999, 1)] {
        let mut out = vec![0u8; len];
        reader.seek(start as u64);
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, payload[start..start + len], "read at {start}+{len}");
    }
}

#[test]
fn read_past_end_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data");
    let mut writer = ChecksummedWriter::new(File::create(&path).unwrap(), INTERVAL);
    writer.write_all(&pattern(100)).unwrap();
    writer.close().unwrap();

    let mut reader = ChecksummedReader::new(File::open(&path).unwrap(), INTERVAL);
    let mut out = vec![0u8; 200];
    reader.seek(0);
    assert!(matches!(
        reader.read_exact(&mut out),
        Err(EmberError::Io(_))
    ));
}

#[test]
fn detects_flipped_byte() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data");
    let payload = pattern(1000);
    let mut writer = ChecksummedWriter::new(File::create(&path).unwrap(), INTERVAL);
    writer.write_all(&payload).unwrap();
    writer.close().unwrap();

    {
        let mut fp = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        fp.seek(SeekFrom::Start(300)).unwrap();
        let mut byte = [0u8; 1];
        fp.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xff;
        fp.seek(SeekFrom::Start(300)).unwrap();
        fp.write_all(&byte).unwrap();
    }

    let mut reader = ChecksummedReader::new(File::open(&path).unwrap(), INTERVAL);
    // The first interval is untouched.
    let mut out = vec![0u8; 100];
    reader.seek(0);
    reader.read_exact(&mut out).unwrap();
    assert_eq!(out, payload[..100]);
    // The second interval's checksum no longer matches.
    let mut out = vec![0u8; 100];
    reader.seek(280);
    assert!(matches!(
        reader.read_exact(&mut out),
        Err(EmberError::Corrupt(_))
    ));
}
