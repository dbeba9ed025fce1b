use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::thread;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use tempfile::tempdir;
use xz2::write::XzEncoder;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use flashpipe::{
    ArchiveEntrySource, ArchivePipeline, ByteSource, CancelFlag, ChannelSource, ExtractOptions,
    FileDeviceWriter, FileSource, FlashError, TelemetryEvent, TelemetrySink, ThreadedDeviceWriter,
};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn xz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 1);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Build a ZIP in memory with the given stored entries.
fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

fn run_pipeline(
    zip_path: &std::path::Path,
    out_path: &std::path::Path,
    target: Option<&str>,
) -> Result<flashpipe::PipelineSummary, FlashError> {
    let source = FileSource::open(zip_path).unwrap();
    let writer = FileDeviceWriter::create(out_path).unwrap();
    let opts = ExtractOptions {
        target_entry: target.map(|s| s.to_string()),
        ..ExtractOptions::default()
    };
    ArchivePipeline::new(
        Box::new(source),
        Box::new(writer),
        opts,
        CancelFlag::new(),
        TelemetrySink::disabled(),
    )
    .run()
}

#[test]
fn two_stage_extraction_yields_exact_image() {
    // 10 MiB image, xz-compressed, nested in a subdirectory of the outer
    // container. Basename matching must select it.
    let image = random_bytes(10 * 1024 * 1024);
    let archive = make_zip(&[
        ("a/b/image.wic.xz", &xz_compress(&image)),
        ("readme.txt", b"hello"),
    ]);

    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    let summary = run_pipeline(&zip_path, &out_path, Some("image.wic.xz")).unwrap();
    assert_eq!(summary.entry_name, "a/b/image.wic.xz");

    let out = fs::read(&out_path).unwrap();
    // 10 MiB is already sector-aligned: no padding.
    assert_eq!(out.len(), image.len());
    assert_eq!(out, image);
    assert_eq!(summary.bytes_written, image.len() as u64);
}

#[test]
fn uncompressed_entry_is_padded_to_sector_boundary() {
    let image = random_bytes(1024 * 1024 + 100);
    let archive = make_zip(&[("notes.txt", b"skip me"), ("disk.wic", &image)]);

    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    // No target: suffix policy picks the first .wic entry.
    let summary = run_pipeline(&zip_path, &out_path, None).unwrap();
    assert_eq!(summary.entry_name, "disk.wic");

    let out = fs::read(&out_path).unwrap();
    assert_eq!(out.len(), 1024 * 1024 + 512);
    assert_eq!(&out[..image.len()], &image[..]);
    assert!(out[image.len()..].iter().all(|&b| b == 0));
}

#[test]
fn missing_target_entry_is_reported_distinctly() {
    let archive = make_zip(&[("readme.txt", b"nothing here")]);
    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    match run_pipeline(&zip_path, &out_path, Some("missing.wic.xz")) {
        Err(FlashError::EntryNotFound(msg)) => assert!(msg.contains("missing.wic.xz")),
        other => panic!("expected EntryNotFound, got {:?}", other),
    }
}

#[test]
fn archive_without_image_entry_is_reported() {
    let archive = make_zip(&[("readme.txt", b"nothing here")]);
    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    assert!(matches!(
        run_pipeline(&zip_path, &out_path, None),
        Err(FlashError::EntryNotFound(_))
    ));
}

#[test]
fn unsupported_inner_compression_is_rejected() {
    let archive = make_zip(&[("image.wic.bz2", b"not actually bzip2")]);
    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    assert!(matches!(
        run_pipeline(&zip_path, &out_path, Some("image.wic.bz2")),
        Err(FlashError::ContainerFormat(_))
    ));
}

#[test]
fn threaded_writer_preserves_stream_order() {
    let image = random_bytes(3 * 1024 * 1024 + 300);
    let archive = make_zip(&[("disk.wic.gz", &gz_compress(&image))]);

    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    let source = FileSource::open(&zip_path).unwrap();
    let writer = ThreadedDeviceWriter::new(File::create(&out_path).unwrap(), &out_path, 4);
    let summary = ArchivePipeline::new(
        Box::new(source),
        Box::new(writer),
        ExtractOptions {
            target_entry: Some("disk.wic.gz".to_string()),
            ..ExtractOptions::default()
        },
        CancelFlag::new(),
        TelemetrySink::disabled(),
    )
    .run()
    .unwrap();

    let out = fs::read(&out_path).unwrap();
    let padded_len = image.len().div_ceil(512) * 512;
    assert_eq!(out.len(), padded_len);
    assert_eq!(&out[..image.len()], &image[..]);
    assert!(out[image.len()..].iter().all(|&b| b == 0));
    assert_eq!(summary.bytes_written, padded_len as u64);
}

#[test]
fn channel_source_feeds_the_pipeline() {
    let image = random_bytes(2 * 1024 * 1024);
    let archive = make_zip(&[("disk.wic", &image)]);

    let cancel = CancelFlag::new();
    let (tx, source) = ChannelSource::with_capacity(4, cancel.clone());
    let feeder = thread::spawn(move || {
        for chunk in archive.chunks(64 * 1024) {
            if tx.send(chunk.to_vec()).is_err() {
                return;
            }
        }
        // Dropping the sender signals EOF.
    });

    let dir = tempdir().unwrap();
    let out_path = dir.path().join("out.img");
    let writer = FileDeviceWriter::create(&out_path).unwrap();
    let summary = ArchivePipeline::new(
        Box::new(source),
        Box::new(writer),
        ExtractOptions::default(),
        cancel,
        TelemetrySink::disabled(),
    )
    .run()
    .unwrap();
    feeder.join().unwrap();

    assert_eq!(summary.entry_name, "disk.wic");
    assert_eq!(fs::read(&out_path).unwrap(), image);
}

#[test]
fn telemetry_reports_the_discovered_entry() {
    let image = random_bytes(256 * 1024);
    let archive = make_zip(&[("disk.wic", &image)]);
    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);
    let out_path = dir.path().join("out.img");

    let (tx, rx) = crossbeam_channel::unbounded();
    let source = FileSource::open(&zip_path).unwrap();
    let writer = FileDeviceWriter::create(&out_path).unwrap();
    ArchivePipeline::new(
        Box::new(source),
        Box::new(writer),
        ExtractOptions::default(),
        CancelFlag::new(),
        TelemetrySink::new(tx),
    )
    .run()
    .unwrap();

    let events: Vec<TelemetryEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        TelemetryEvent::EntryDiscovered { name, .. } if name == "disk.wic"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, TelemetryEvent::SlotPoolStats(_))));
}

#[test]
fn channel_source_wait_counters_surface_in_ring_wait_telemetry() {
    let image = random_bytes(1024 * 1024);
    let archive = make_zip(&[("disk.wic", &image)]);
    let archive_len = archive.len() as u64;

    let cancel = CancelFlag::new();
    let (tx, source) = ChannelSource::with_capacity(2, cancel.clone());
    let feeder = thread::spawn(move || {
        for chunk in archive.chunks(32 * 1024) {
            // Trickle the input so the pipeline actually waits on it.
            thread::sleep(Duration::from_millis(1));
            if tx.send(chunk.to_vec()).is_err() {
                return;
            }
        }
    });

    let dir = tempdir().unwrap();
    let out_path = dir.path().join("out.img");
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let summary = ArchivePipeline::new(
        Box::new(source),
        Box::new(FileDeviceWriter::create(&out_path).unwrap()),
        ExtractOptions::default(),
        cancel,
        TelemetrySink::new(events_tx),
    )
    .run()
    .unwrap();
    feeder.join().unwrap();

    // Even on the uncompressed path the input-side counters are reported.
    let ring = events_rx.try_iter().find_map(|e| match e {
        TelemetryEvent::RingWaitTime { ms, bytes } => Some((ms, bytes)),
        _ => None,
    });
    let (ms, bytes) = ring.expect("ring-wait event missing");
    assert!(bytes > 0 && bytes <= archive_len);
    assert_eq!(summary.ring_wait_ms, ms);
}

#[test]
fn archive_entry_source_streams_one_entry() {
    let payload = random_bytes(700 * 1024);
    let archive = make_zip(&[("dir/firmware.bin", &payload), ("other.txt", b"x")]);
    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);

    // Basename match is enough to locate the entry.
    let mut source =
        ArchiveEntrySource::open(&zip_path, "firmware.bin", CancelFlag::new()).unwrap();
    assert_eq!(source.entry_name(), "dir/firmware.bin");
    assert_eq!(source.entry_size(), payload.len() as u64);

    let mut collected = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, payload);
}

#[test]
fn archive_entry_source_reports_missing_entry() {
    let archive = make_zip(&[("a.txt", b"a")]);
    let dir = tempdir().unwrap();
    let zip_path = write_temp(&dir, "bundle.zip", &archive);

    assert!(matches!(
        ArchiveEntrySource::open(&zip_path, "nope.bin", CancelFlag::new()),
        Err(FlashError::EntryNotFound(_))
    ));
}
