//! Files served by worker processes.
//!
//! These tests fork, so they run one at a time.

use mf_core::{Asset, Error, FileFormat, FileStatus, Preferences};
use mf_decode::DecoderRegistry;
use mf_file::{MediaFile, WorkerPool};
use mf_media::{ColorModel, Samples, VideoFrame};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serial_test::serial;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn isolated(use_pool: bool) -> Preferences {
    let mut prefs = Preferences::default();
    prefs.isolation.enabled = true;
    prefs.isolation.use_pool = use_pool;
    prefs.isolation.read_timeout_ms = 100;
    prefs
}

fn in_process() -> Preferences {
    let mut prefs = Preferences::default();
    prefs.isolation.enabled = false;
    prefs
}

/// Mono ramp: sample `i` holds `i % 2000`.
fn write_ramp(path: &Path, frames: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        writer.write_sample((i % 2000) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

fn ramp(from: usize, len: usize) -> Vec<f64> {
    (from..from + len)
        .map(|i| (i % 2000) as f64 / 32767.0)
        .collect()
}

fn open(prefs: &Preferences, path: &Path) -> MediaFile {
    let mut file = MediaFile::new();
    file.open_file(prefs, &mut Asset::new(path), true, false).unwrap();
    file
}

#[test]
#[serial]
fn remote_samples_match_local() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.wav");
    write_ramp(&path, 10_000);

    let mut local = open(&in_process(), &path);
    let mut remote = open(&isolated(false), &path);
    assert!(remote.is_remote());
    assert_ne!(remote.worker_pid(), Some(std::process::id() as i32));
    assert_eq!(remote.get_audio_length().unwrap(), 10_000);

    local.set_audio_position(4_000).unwrap();
    remote.set_audio_position(4_000).unwrap();

    let mut heap = Samples::new(512);
    let mut shared = Samples::new_shared(512).unwrap();
    let mut expected = Samples::new(512);
    remote.read_samples(&mut heap, 512).unwrap();
    remote.read_samples(&mut shared, 512).unwrap();
    local.read_samples(&mut expected, 512).unwrap();
    assert_eq!(heap.as_slice(), expected.as_slice());
    local.read_samples(&mut expected, 512).unwrap();
    assert_eq!(shared.as_slice(), expected.as_slice());

    assert_eq!(remote.get_audio_position().unwrap(), 5_024);
    assert!(remote.get_memory_usage() >= mf_core::MIN_CACHEITEM_SIZE);
}

#[test]
#[serial]
fn remote_frames_come_back_through_scratch_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("card.png");
    let card = image::RgbaImage::from_fn(6, 4, |x, y| image::Rgba([x as u8 * 40, y as u8 * 60, 7, 255]));
    card.save(&path).unwrap();

    let mut file = open(&isolated(false), &path);
    assert_eq!(
        file.colormodel_supported(ColorModel::Rgb888).unwrap(),
        ColorModel::Rgba8888
    );

    let mut heap = VideoFrame::new(6, 4, ColorModel::Rgb888);
    file.read_frame(&mut heap).unwrap();
    assert_eq!(&heap.data()[..3], &[0, 0, 7]);
    assert_eq!(&heap.data()[(3 * 6 + 5) * 3..], &[200, 180, 7]);
    assert_eq!(heap.position, 0);
    assert_eq!(file.get_video_position().unwrap(), 1);

    file.set_video_position(0).unwrap();
    file.set_video_position(5).unwrap();
    file.set_video_position(0).unwrap();
    let mut shared = VideoFrame::new_shared(6, 4, ColorModel::Rgba8888).unwrap();
    file.read_frame(&mut shared).unwrap();
    assert_eq!(shared.data(), card.as_raw().as_slice());
}

#[test]
#[serial]
fn remote_video_positioning_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("card.png");
    image::RgbaImage::from_pixel(4, 4, image::Rgba([9, 8, 7, 255]))
        .save(&path)
        .unwrap();

    let mut file = open(&isolated(false), &path);
    let mut frame = VideoFrame::new(4, 4, ColorModel::Rgba8888);
    file.read_frame(&mut frame).unwrap();
    assert_eq!(file.get_video_position().unwrap(), 1);

    file.set_video_position(0).unwrap();
    file.read_frame(&mut frame).unwrap();
    assert_eq!(frame.position, 0);
    // Served from the worker's cache, so the cursor stays on frame 0.
    assert_eq!(file.get_video_position().unwrap(), 0);

    file.set_video_position(1).unwrap();
    file.read_frame(&mut frame).unwrap();
    assert_eq!(frame.position, 1);
    assert_eq!(file.get_video_position().unwrap(), 2);
}

#[test]
#[serial]
fn waveform_index_crosses_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.wav");
    write_ramp(&path, 1_000);

    // WAV keeps no table of contents, so there is no index on either side.
    let mut local = open(&in_process(), &path);
    let mut remote = open(&isolated(false), &path);
    assert_eq!(local.get_waveform_index(0).unwrap(), None);
    assert_eq!(remote.get_waveform_index(0).unwrap(), None);

    remote.close_file().unwrap();
    assert_eq!(remote.get_waveform_index(0).unwrap(), None);
}

#[test]
#[serial]
fn failures_keep_their_status_across_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("cut.xml");
    std::fs::write(&project, b"<EDL VERSION=\"1\"></EDL>").unwrap();

    let mut file = MediaFile::new();
    let err = file
        .open_file(&isolated(false), &mut Asset::new(&project), true, false)
        .unwrap_err();
    assert_eq!(err.status(), FileStatus::IsXml);
    assert!(!file.is_open());

    let err = file
        .open_file(&isolated(false), &mut Asset::new(dir.path().join("gone.wav")), true, false)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
#[serial]
fn pooled_worker_serves_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.wav");
    write_ramp(&path, 3_000);

    let pool = Arc::new(WorkerPool::start(DecoderRegistry::default()).unwrap());
    let mut file = MediaFile::new().with_pool(Arc::clone(&pool));
    let mut asset = Asset::new(&path);
    file.open_file(&isolated(true), &mut asset, true, false).unwrap();
    assert_eq!(asset.format, FileFormat::Wav);
    assert_ne!(file.worker_pid(), Some(pool.pid()));

    let mut buf = Samples::new(100);
    file.set_audio_position(2_500).unwrap();
    file.read_samples(&mut buf, 100).unwrap();
    assert_eq!(buf.as_slice(), ramp(2_500, 100).as_slice());

    let closed = file.close_file().unwrap().unwrap();
    assert_eq!(closed.audio_length, 3_000);
    assert!(file.close_file().unwrap().is_none());
    assert!(pool.is_running());
}

/// SIGKILL the file's worker and wait until it is a zombie or gone.
fn kill_worker(file: &MediaFile) {
    let pid = file.worker_pid().unwrap();
    kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
    for _ in 0..500 {
        let dead = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => true,
        };
        if dead {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("worker {pid} survived SIGKILL");
}

#[test]
#[serial]
fn killed_worker_is_reopened_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.wav");
    write_ramp(&path, 20_000);

    let mut file = open(&isolated(false), &path);
    file.set_cache_size(1 << 20).unwrap();
    let mut buf = Samples::new(256);
    file.set_audio_position(12_000).unwrap();
    file.read_samples(&mut buf, 256).unwrap();
    let first = file.worker_pid();

    kill_worker(&file);
    file.read_samples(&mut buf, 256).unwrap();
    assert_eq!(buf.as_slice(), ramp(12_256, 256).as_slice());
    assert_ne!(file.worker_pid(), first);
    assert_eq!(file.get_audio_position().unwrap(), 12_512);
}

#[test]
#[serial]
fn killed_pooled_worker_is_reopened_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.wav");
    write_ramp(&path, 5_000);

    let pool = Arc::new(WorkerPool::start(DecoderRegistry::default()).unwrap());
    let mut file = MediaFile::new().with_pool(Arc::clone(&pool));
    file.open_file(&isolated(true), &mut Asset::new(&path), true, false)
        .unwrap();
    let mut buf = Samples::new(64);
    file.read_samples(&mut buf, 64).unwrap();

    kill_worker(&file);
    file.read_samples(&mut buf, 64).unwrap();
    assert_eq!(buf.as_slice(), ramp(64, 64).as_slice());
    assert!(pool.is_running());
}

#[test]
#[serial]
fn writes_through_a_worker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("render.wav");
    let mut asset = Asset::new(&path);
    asset.format = FileFormat::Wav;
    asset.channels = 2;
    asset.sample_rate = 44100;
    asset.bits = 16;

    let mut file = MediaFile::new();
    file.open_file(&isolated(false), &mut asset, false, true).unwrap();

    let left = Samples::from_vec(vec![0.5; 300]);
    let right = Samples::from_vec(vec![-0.5; 300]);
    file.write_samples(&[left, right], 300).unwrap();

    file.start_audio_thread(128, 3).unwrap();
    for _ in 0..4 {
        let mut buffer = file.get_audio_buffer().unwrap();
        for channel in buffer.iter_mut() {
            channel.as_mut_slice().fill(0.25);
        }
        drop(buffer);
        file.write_audio_buffer(100).unwrap();
    }
    file.stop_audio_thread().unwrap();

    let closed = file.close_file().unwrap().unwrap();
    assert_eq!(closed.audio_length, 700);

    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.duration(), 700);
    let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(samples[0], 16384);
    assert_eq!(samples[1], -16384);
    assert_eq!(samples[600], 8192);
}
