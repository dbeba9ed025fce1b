use std::fs;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngCore;
use tempfile::tempdir;

use flashpipe::{
    CancelFlag, ChannelSource, FileDeviceWriter, FileSource, FlashError, TelemetrySink, VsiCodec,
    VsiOptions,
};

const BLOCK_SIZE: u32 = 4096;

enum Block {
    Data(Vec<u8>),
    Sparse,
}

/// Serialize blocks into the delimiter-framed payload, compress it with
/// zlib, and prepend a valid 128-byte header.
fn build_vsi(block_size: u32, blocks: &[Block]) -> Vec<u8> {
    let mut payload = Vec::new();
    for block in blocks {
        match block {
            Block::Data(data) => {
                assert_eq!(data.len(), block_size as usize);
                payload.push(0x01);
                payload.extend_from_slice(data);
            }
            Block::Sparse => payload.push(0x00),
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&payload).unwrap();
    let compressed = encoder.finish().unwrap();

    let uncompressed_size = blocks.len() as i64 * block_size as i64;
    let digest = md5::compute(&compressed);

    let mut out = vec![0u8; 128];
    out[0..4].copy_from_slice(b"VSI1");
    out[4..8].copy_from_slice(&(block_size as i32).to_le_bytes());
    out[8..16].copy_from_slice(&uncompressed_size.to_le_bytes());
    out[16..32].copy_from_slice(&digest.0);
    out[32..37].copy_from_slice(b"image");
    out[96..99].copy_from_slice(b"1.0");
    out.extend_from_slice(&compressed);
    out
}

fn expected_bytes(block_size: u32, blocks: &[Block]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        match block {
            Block::Data(data) => out.extend_from_slice(data),
            Block::Sparse => out.extend_from_slice(&vec![0u8; block_size as usize]),
        }
    }
    out
}

fn random_block() -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE as usize];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn decode_to_file(vsi: &[u8], opts: Option<VsiOptions>) -> (tempfile::TempDir, Result<u64, FlashError>) {
    let dir = tempdir().unwrap();
    let src_path = dir.path().join("image.vsi");
    let dst_path = dir.path().join("out.img");
    fs::write(&src_path, vsi).unwrap();

    let source = FileSource::open(&src_path).unwrap();
    let writer = FileDeviceWriter::create(&dst_path).unwrap();
    let mut codec = VsiCodec::new(
        Box::new(source),
        Box::new(writer),
        CancelFlag::new(),
        TelemetrySink::disabled(),
    );
    if let Some(opts) = opts {
        codec = codec.with_options(opts);
    }
    let result = codec.run().map(|summary| summary.bytes_written);
    (dir, result)
}

#[test]
fn well_formed_image_decodes_exactly() {
    let blocks = vec![
        Block::Data(random_block()),
        Block::Sparse,
        Block::Data(random_block()),
        Block::Sparse,
        Block::Sparse,
        Block::Data(random_block()),
    ];
    let vsi = build_vsi(BLOCK_SIZE, &blocks);

    let (dir, result) = decode_to_file(&vsi, None);
    let written = result.unwrap();
    assert_eq!(written, 6 * BLOCK_SIZE as u64);

    let out = fs::read(dir.path().join("out.img")).unwrap();
    assert_eq!(out, expected_bytes(BLOCK_SIZE, &blocks));
}

#[test]
fn sparse_block_emits_exactly_one_block_of_zeros() {
    let blocks = vec![Block::Sparse];
    let vsi = build_vsi(BLOCK_SIZE, &blocks);

    let (dir, result) = decode_to_file(&vsi, None);
    assert_eq!(result.unwrap(), BLOCK_SIZE as u64);

    let out = fs::read(dir.path().join("out.img")).unwrap();
    assert_eq!(out.len(), BLOCK_SIZE as usize);
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn data_block_survives_chunk_boundaries() {
    // A tiny input buffer forces the compressed stream through the inflate
    // loop a handful of bytes at a time, so block payloads land split
    // across many output chunks.
    let blocks = vec![
        Block::Data(random_block()),
        Block::Data(random_block()),
        Block::Sparse,
        Block::Data(random_block()),
    ];
    let vsi = build_vsi(BLOCK_SIZE, &blocks);

    let opts = VsiOptions { input_buffer_size: 7, ..VsiOptions::default() };
    let (dir, result) = decode_to_file(&vsi, Some(opts));
    assert_eq!(result.unwrap(), 4 * BLOCK_SIZE as u64);

    let out = fs::read(dir.path().join("out.img")).unwrap();
    assert_eq!(out, expected_bytes(BLOCK_SIZE, &blocks));
}

#[test]
fn corrupted_md5_fails_at_verification_not_earlier() {
    let blocks = vec![Block::Data(random_block()), Block::Sparse];
    let mut vsi = build_vsi(BLOCK_SIZE, &blocks);
    vsi[16] ^= 0xff;

    let (dir, result) = decode_to_file(&vsi, None);
    assert!(matches!(result, Err(FlashError::Integrity(_))));

    // The whole payload decoded fine before verification rejected it.
    let out = fs::read(dir.path().join("out.img")).unwrap();
    assert_eq!(out.len(), 2 * BLOCK_SIZE as usize);
}

#[test]
fn size_mismatch_is_an_integrity_error() {
    let blocks = vec![Block::Data(random_block())];
    let mut vsi = build_vsi(BLOCK_SIZE, &blocks);
    // Header promises one block more than the payload carries. Recompute
    // nothing else; the MD5 still matches, so only the size check trips.
    let lied = 2 * BLOCK_SIZE as i64;
    vsi[8..16].copy_from_slice(&lied.to_le_bytes());

    let (_dir, result) = decode_to_file(&vsi, None);
    match result {
        Err(FlashError::Integrity(msg)) => assert!(msg.contains("size mismatch"), "{}", msg),
        other => panic!("expected size-mismatch integrity error, got {:?}", other),
    }
}

#[test]
fn unknown_delimiter_is_a_format_error() {
    let mut payload = vec![0x02u8];
    payload.extend_from_slice(&vec![0u8; BLOCK_SIZE as usize]);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&payload).unwrap();
    let compressed = encoder.finish().unwrap();
    let digest = md5::compute(&compressed);

    let mut vsi = vec![0u8; 128];
    vsi[0..4].copy_from_slice(b"VSI1");
    vsi[4..8].copy_from_slice(&(BLOCK_SIZE as i32).to_le_bytes());
    vsi[8..16].copy_from_slice(&(BLOCK_SIZE as i64).to_le_bytes());
    vsi[16..32].copy_from_slice(&digest.0);
    vsi.extend_from_slice(&compressed);

    let (_dir, result) = decode_to_file(&vsi, None);
    assert!(matches!(result, Err(FlashError::ContainerFormat(_))));
}

#[test]
fn truncated_payload_fails_checksum_after_consumption() {
    let blocks = vec![Block::Data(random_block()), Block::Data(random_block())];
    let mut vsi = build_vsi(BLOCK_SIZE, &blocks);
    vsi.truncate(vsi.len() - 16);

    let (_dir, result) = decode_to_file(&vsi, None);
    assert!(matches!(result, Err(FlashError::Integrity(_))));
}

#[test]
fn bad_header_is_rejected_before_any_decode() {
    let mut vsi = build_vsi(BLOCK_SIZE, &[Block::Sparse]);
    vsi[0] = b'X';

    let (dir, result) = decode_to_file(&vsi, None);
    assert!(matches!(result, Err(FlashError::HeaderValidation(_))));
    assert_eq!(fs::read(dir.path().join("out.img")).unwrap().len(), 0);
}

#[test]
fn pre_cancelled_session_reports_cancelled() {
    let vsi = build_vsi(BLOCK_SIZE, &[Block::Sparse]);
    let dir = tempdir().unwrap();
    let src_path = dir.path().join("image.vsi");
    let dst_path = dir.path().join("out.img");
    fs::write(&src_path, &vsi).unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let codec = VsiCodec::new(
        Box::new(FileSource::open(&src_path).unwrap()),
        Box::new(FileDeviceWriter::create(&dst_path).unwrap()),
        cancel,
        TelemetrySink::disabled(),
    );
    match codec.run() {
        Err(err) => assert!(err.is_cancelled()),
        Ok(_) => panic!("cancelled session must not succeed"),
    }
}

#[test]
fn cancellation_mid_decode_returns_cancelled_promptly() {
    // Feed the header plus a sliver of payload and then go quiet: the
    // decode loop blocks on the channel until the flag is raised from
    // another thread, and must not reach integrity verification.
    let vsi = build_vsi(BLOCK_SIZE, &[Block::Data(random_block()), Block::Sparse]);

    let cancel = CancelFlag::new();
    let (tx, source) = ChannelSource::with_capacity(4, cancel.clone());
    tx.send(vsi[..140].to_vec()).unwrap();

    let dir = tempdir().unwrap();
    let dst_path = dir.path().join("out.img");
    let codec = VsiCodec::new(
        Box::new(source),
        Box::new(FileDeviceWriter::create(&dst_path).unwrap()),
        cancel.clone(),
        TelemetrySink::disabled(),
    );

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });

    let started = Instant::now();
    let result = codec.run();
    canceller.join().unwrap();
    drop(tx);

    match result {
        Err(err) => assert!(err.is_cancelled()),
        Ok(_) => panic!("mid-decode cancellation must not succeed"),
    }
    // Well before any multi-second stall; bounded by the poll interval.
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
}
