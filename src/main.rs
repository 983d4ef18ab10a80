mod cli;

use mediafork::report::{SampleStats, TocSummary};
use mf_core::{Asset, Preferences, STILL_PHOTO_LENGTH};
use mf_decode::{toc_path, DecoderRegistry, TocFile};
use mf_file::{MediaFile, WorkerPool};
use mf_media::{ColorModel, Samples, VideoFrame};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mediafork=trace,mf_file=debug,mf_decode=debug,mf_ipc=debug,mf_media=debug,mf_core=debug"
                .to_string()
        } else {
            "mediafork=info,mf_file=info,mf_decode=info,mf_ipc=warn,mf_core=info".to_string()
        }
    });

    // Logs go to stderr so JSON output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut prefs = Preferences::load_or_default(cli.config.as_deref());
    if cli.in_process {
        prefs.isolation.enabled = false;
    }

    match cli.command {
        Commands::Probe { file, json } => probe_file(&prefs, &file, json),
        Commands::Toc { file, check, force } => {
            if check {
                check_toc(&file)
            } else {
                build_toc(&prefs, &file, force)
            }
        }
        Commands::Frame {
            file,
            position,
            layer,
            output,
        } => write_frame(&prefs, &file, position, layer, &output),
        Commands::Samples {
            file,
            channel,
            start,
            len,
            json,
        } => sample_stats(&prefs, &file, channel, start, len, json),
        Commands::Config { strict } => show_config(&prefs, strict),
    }
}

/// Open `path` for reading the way the editor would: through a worker
/// when isolation is on, from a pool when one is configured.
fn open_media(prefs: &Preferences, path: &Path) -> Result<(MediaFile, Asset)> {
    if !path.exists() {
        anyhow::bail!("File does not exist: {:?}", path);
    }

    let mut file = MediaFile::new();
    if prefs.isolation.enabled && prefs.isolation.use_pool {
        let pool = WorkerPool::start(DecoderRegistry::default())
            .context("failed to start the worker pool")?;
        file = file.with_pool(Arc::new(pool));
    }

    let mut asset = Asset::new(path);
    file.open_file(prefs, &mut asset, true, false)
        .with_context(|| format!("failed to open {}", path.display()))?;
    tracing::debug!(
        remote = file.is_remote(),
        pid = ?file.worker_pid(),
        "opened {}",
        path.display()
    );
    Ok((file, asset))
}

fn probe_file(prefs: &Preferences, path: &Path, json: bool) -> Result<()> {
    let (mut file, asset) = open_media(prefs, path)?;
    file.close_file()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&asset)?);
        return Ok(());
    }

    println!("File: {}", asset.path.display());
    if asset.container.is_empty() {
        println!("Format: {}", asset.format);
    } else {
        println!("Format: {} ({})", asset.format, asset.container);
    }

    if asset.audio_data {
        print!(
            "Audio: {}ch {} Hz, {} bit",
            asset.channels, asset.sample_rate, asset.bits
        );
        if !asset.audio_codec.is_empty() {
            print!(", {}", asset.audio_codec);
        }
        println!(", {} samples", asset.audio_length);
    }

    if asset.video_data {
        print!(
            "Video: {} layer(s) {}x{}",
            asset.layers, asset.width, asset.height
        );
        if !asset.video_codec.is_empty() {
            print!(", {}", asset.video_codec);
        }
        if asset.video_length == STILL_PHOTO_LENGTH {
            println!(", still");
        } else if !asset.is_seekable() {
            println!(", {:.3} fps, not seekable", asset.frame_rate);
        } else {
            println!(
                ", {:.3} fps, {} frames",
                asset.frame_rate, asset.video_length
            );
        }
    }

    Ok(())
}

fn print_toc(path: &Path, summary: &TocSummary) {
    println!(
        "Table of contents: {} ({})",
        path.display(),
        if summary.fresh { "fresh" } else { "stale" }
    );
    for (i, audio) in summary.audio.iter().enumerate() {
        println!(
            "  audio [{}] {} chunks, {} samples",
            i, audio.chunks, audio.samples
        );
    }
    for (i, video) in summary.video.iter().enumerate() {
        println!(
            "  video [{}] {} frames, {} keyframes",
            i, video.frames, video.keyframes
        );
    }
    println!("  waveforms: {}", summary.waveforms);
}

fn check_toc(source: &Path) -> Result<()> {
    let sidecar = toc_path(source);
    if !sidecar.exists() {
        anyhow::bail!("No table of contents at {}", sidecar.display());
    }

    let toc = TocFile::load(&sidecar, true)
        .with_context(|| format!("invalid table of contents {}", sidecar.display()))?;
    let fresh = TocFile::load_if_fresh(source)?.is_some();
    print_toc(&sidecar, &TocSummary::new(&toc, fresh));
    Ok(())
}

fn build_toc(prefs: &Preferences, source: &Path, force: bool) -> Result<()> {
    let sidecar = toc_path(source);
    if force && sidecar.exists() {
        tracing::info!("Removing {}", sidecar.display());
        std::fs::remove_file(&sidecar)?;
    }

    let mut prefs = prefs.clone();
    prefs.toc.enabled = true;
    prefs.toc.always = true;
    let (mut file, asset) = open_media(&prefs, source)?;
    file.close_file()?;

    if !sidecar.exists() {
        println!(
            "{}: {} files need no table of contents",
            source.display(),
            asset.format
        );
        return Ok(());
    }

    let toc = TocFile::load(&sidecar, true)?;
    let fresh = TocFile::load_if_fresh(source)?.is_some();
    print_toc(&sidecar, &TocSummary::new(&toc, fresh));
    Ok(())
}

fn write_frame(
    prefs: &Preferences,
    path: &Path,
    position: i64,
    layer: i32,
    output: &Path,
) -> Result<()> {
    let (mut file, asset) = open_media(prefs, path)?;
    if !asset.video_data {
        anyhow::bail!("{} has no video", path.display());
    }
    let (width, height) = (asset.width.max(0) as usize, asset.height.max(0) as usize);

    file.set_layer(layer)?;
    file.set_video_position(position)?;
    let mut frame = VideoFrame::new(width, height, ColorModel::Rgba8888);
    file.read_frame(&mut frame)?;
    file.close_file()?;

    let image = image::RgbaImage::from_raw(width as u32, height as u32, frame.data().to_vec())
        .context("decoded frame does not match the asset dimensions")?;
    image
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Wrote frame {} ({}x{}) to {}",
        frame.position,
        width,
        height,
        output.display()
    );
    Ok(())
}

fn sample_stats(
    prefs: &Preferences,
    path: &Path,
    channel: i32,
    start: i64,
    len: Option<usize>,
    json: bool,
) -> Result<()> {
    let (mut file, asset) = open_media(prefs, path)?;
    if !asset.audio_data {
        anyhow::bail!("{} has no audio", path.display());
    }
    if channel < 0 || channel >= asset.channels {
        anyhow::bail!(
            "channel {} out of range; {} has {} channel(s)",
            channel,
            path.display(),
            asset.channels
        );
    }

    file.set_channel(channel)?;
    let length = file.get_audio_length()?;
    let len = len.unwrap_or_else(|| (length - start).max(0) as usize);

    file.set_audio_position(start)?;
    let behind = (start - file.get_audio_position()?).max(0) as usize;
    if behind > 0 {
        let mut skip = Samples::new(behind);
        file.read_samples(&mut skip, behind)?;
    }

    let mut buffer = Samples::new(len);
    if len > 0 {
        file.read_samples(&mut buffer, len)?;
    }
    file.close_file()?;

    let stats = SampleStats::compute(channel, start, &buffer.as_slice()[..len]);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Channel: {}", stats.channel);
        println!("Range: {}..{}", stats.start, stats.start + stats.len as i64);
        println!("Min: {:.6}", stats.min);
        println!("Max: {:.6}", stats.max);
        println!("RMS: {:.6}", stats.rms);
        println!("Peak: {:.2} dBFS", stats.peak_db());
    }
    Ok(())
}

fn show_config(prefs: &Preferences, strict: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(prefs)?);

    let warnings = prefs.validate();
    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }
    if strict && !warnings.is_empty() {
        anyhow::bail!("{} preference warning(s)", warnings.len());
    }
    Ok(())
}
