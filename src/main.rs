//! multi-cam-recorder binary: records every configured camera until
//! interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use multi_cam_recorder::config::{Cli, ControlBackend};
use multi_cam_recorder::control::{ControlPort, DeviceControlPort, V4l2CtlPort};
use multi_cam_recorder::encoder::{EncoderFactory, MjpegEncoderFactory};
use multi_cam_recorder::mock::{LumaSource, MockOpener, SimulatedControls};
use multi_cam_recorder::shutdown::StopSignal;
use multi_cam_recorder::supervisor::{Pipeline, PipelineConfig};
use multi_cam_recorder::V4L2Opener;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("multi_cam_recorder=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline_config()?;

    let stop = StopSignal::new();
    ctrlc::set_handler({
        let stop = stop.clone();
        move || stop.trigger()
    })
    .context("failed to install the interrupt handler")?;

    let encoder: Arc<dyn EncoderFactory> = Arc::new(MjpegEncoderFactory::new(cli.jpeg_quality));
    let pipeline = if cli.simulate {
        start_simulated(&cli, config, encoder)?
    } else {
        start_hardware(&cli, config, encoder)?
    };

    wait_for_stop(&cli, &pipeline, &stop);

    if let Some(dir) = &cli.snapshot_dir {
        match pipeline.save_snapshots(dir, cli.jpeg_quality) {
            Ok(saved) => info!(count = saved.len(), dir = %dir.display(), "snapshots written"),
            Err(err) => warn!(error = %err, "snapshots failed"),
        }
    }

    pipeline.shutdown();
    log_stats(&pipeline);
    Ok(())
}

fn start_hardware(
    cli: &Cli,
    config: PipelineConfig,
    encoder: Arc<dyn EncoderFactory>,
) -> Result<Pipeline> {
    let port: Arc<dyn ControlPort> = match cli.control_backend {
        ControlBackend::V4l2Ctl => Arc::new(V4l2CtlPort::new("v4l2-ctl", cli.control_timeout())),
        ControlBackend::Ioctl => Arc::new(DeviceControlPort),
    };
    Pipeline::start(config, Arc::new(V4L2Opener::default()), port, encoder)
        .context("failed to start the pipeline")
}

fn start_simulated(
    cli: &Cli,
    config: PipelineConfig,
    encoder: Arc<dyn EncoderFactory>,
) -> Result<Pipeline> {
    let controls = Arc::new(SimulatedControls::new());
    let scene = cli.simulate_scene;
    let luma: LumaSource = {
        let controls = Arc::clone(&controls);
        Arc::new(move |device: &Path| controls.simulated_luma(device, scene))
    };
    let opener = MockOpener::new()
        .with_luma_source(luma)
        .with_frame_interval(Duration::from_secs(1) / config.capture.fps.max(1));

    info!(scene, "running against simulated cameras");
    Pipeline::start(config, Arc::new(opener), controls, encoder)
        .context("failed to start the simulated pipeline")
}

fn wait_for_stop(cli: &Cli, pipeline: &Pipeline, stop: &StopSignal) {
    let started = Instant::now();
    let deadline = cli.run_for.map(|secs| started + Duration::from_secs(secs));
    let stats_interval = cli.stats_interval();
    let mut next_stats = stats_interval.map(|interval| started + interval);

    while !stop.wait_timeout(Duration::from_millis(250)) {
        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            info!("run time elapsed");
            return;
        }
        if let (Some(next), Some(interval)) = (next_stats, stats_interval) {
            if now >= next {
                log_stats(pipeline);
                next_stats = Some(next + interval);
            }
        }
        if pipeline
            .cameras()
            .all(|camera| matches!(camera.state(), multi_cam_recorder::CameraState::Disabled(_)))
        {
            error!("every camera is disabled, stopping");
            return;
        }
    }
    info!("interrupted");
}

fn log_stats(pipeline: &Pipeline) {
    for stats in pipeline.stats() {
        info!(
            camera = %stats.name,
            state = ?stats.state,
            fps = format_args!("{:.1}", stats.fps),
            frames = stats.frame_count,
            dropped_live = stats.dropped_live,
            dropped_recorder = stats.dropped_recorder,
            live_queue = format_args!("{}/{}", stats.live_queue_len, stats.live_queue_capacity),
            clips = stats.recording.clips_opened,
            clip = ?stats.open_clip,
            "camera stats"
        );
    }
}
