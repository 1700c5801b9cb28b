use anyhow::{Context, bail};
use clap::{Arg, ArgAction, Command, value_parser};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use tunnelplay::config::{PlayerSettings, app_name, version};
use tunnelplay::pipeline::{Codec, HealthMonitor, MediaInfo, SampleFormat, StreamDescriptor};
use tunnelplay::{PlaybackController, PlaybackEvent, Sinks};

mod demux;

use demux::SyntheticDemuxer;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("settings")
                .short('c')
                .long("settings")
                .value_name("FILE")
                .help("JSON settings file."),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Frame rate of the synthetic video stream.")
                .value_parser(value_parser!(f64))
                .default_value("30"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Length of the synthetic stream.")
                .value_parser(value_parser!(f64))
                .default_value("10"),
        )
        .arg(
            Arg::new("no-audio")
                .long("no-audio")
                .help("Play the video stream only.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("speed")
                .short('s')
                .long("speed")
                .value_name("MULTIPLIER")
                .help("Playback rate once the first frame is up, negative for reverse.")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32)),
        )
        .arg(
            Arg::new("seek")
                .long("seek")
                .value_name("SECONDS")
                .help("Seek here once the first frame is up.")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("loop")
                .short('l')
                .long("loop")
                .help("Restart at end of stream.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("time-limit")
                .short('t')
                .long("time-limit")
                .value_name("SECONDS")
                .help("Stop after this much wall time.")
                .value_parser(value_parser!(f64)),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();

    let mut settings = match matches.get_one::<String>("settings") {
        Some(path) => PlayerSettings::load(path)?,
        None => PlayerSettings::default(),
    };
    if matches.get_flag("loop") {
        settings.loop_playback = true;
    }
    if matches.get_flag("no-audio") {
        settings.enable_audio = false;
    }

    let fps = *matches.get_one::<f64>("fps").context("missing fps")?;
    let seconds = *matches.get_one::<f64>("duration").context("missing duration")?;
    let info = MediaInfo {
        video: Some(StreamDescriptor::video(Codec::H264, 1280, 720, fps)),
        audio: Some(StreamDescriptor::audio(Codec::Aac, 48_000, 2, SampleFormat::S16)),
        duration_micros: (seconds.max(0.0) * 1_000_000.0) as i64,
    };

    let mut player = PlaybackController::new();
    player.set_listener(|| log::info!("{}: playback finished", app_name()));
    player.try_open(&info, settings, Sinks::default())?;

    let (Some(clock), Some(stop)) = (player.clock(), player.cancel_handle()) else {
        bail!("player closed right after open");
    };

    let mut demuxers = Vec::new();
    let streams = [
        (player.video_feeder(), info.video.as_ref()),
        (player.audio_feeder(), info.audio.as_ref()),
    ];
    for (feeder, descriptor) in streams {
        if let (Some(feeder), Some(descriptor)) = (feeder, descriptor) {
            let demuxer =
                SyntheticDemuxer::new(feeder, descriptor, info.duration(), clock.clone(), stop.clone());
            demuxers.push(demuxer.spawn()?);
        }
    }

    let (alert_tx, mut alert_rx) = mpsc::channel(16);
    for (kind, health) in player.pipeline_health() {
        let monitor = HealthMonitor::new(kind, health, alert_tx.clone()).with_stop_signal(stop.clone());
        tokio::spawn(async move { monitor.run().await });
    }
    drop(alert_tx);

    let speed = matches.get_one::<i32>("speed").copied();
    let seek = matches.get_one::<f64>("seek").copied();
    let limit = matches
        .get_one::<f64>("time-limit")
        .map(|s| Duration::from_secs_f64(s.max(0.0)));

    let started = Instant::now();
    let mut last_status = Instant::now();
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    let outcome = loop {
        tokio::select! {
            _ = poll.tick() => {
                match player.poll() {
                    Some(PlaybackEvent::FirstFrame) => {
                        log::info!("{}: first frame after {:?}", app_name(), started.elapsed());
                        if let Some(position) = seek {
                            player.seek_to_time_seconds(position)?;
                        }
                        if let Some(rate) = speed {
                            player.set_speed(rate)?;
                        }
                    }
                    Some(PlaybackEvent::Looped(reposition)) => {
                        log::info!("{}: looped to frame {}", app_name(), reposition.frame);
                    }
                    Some(PlaybackEvent::ReverseStartReached) => {
                        log::info!("{}: reverse playback reached the start", app_name());
                    }
                    Some(PlaybackEvent::Finished) => break Ok(()),
                    Some(PlaybackEvent::Error(kind)) => break Err(anyhow::anyhow!("playback failed: {:?}", kind)),
                    None => {}
                }

                if last_status.elapsed() >= STATUS_INTERVAL {
                    log::info!(
                        "{}: {} {:.2}s / {:.2}s, frame {} / {}, {}x",
                        app_name(),
                        player.state(),
                        player.current_time_seconds(),
                        player.duration_seconds(),
                        player.current_frame(),
                        player.total_frames(),
                        player.speed()
                    );
                    last_status = Instant::now();
                }

                if limit.is_some_and(|limit| started.elapsed() >= limit) {
                    log::info!("{}: time limit reached", app_name());
                    break Ok(());
                }
            }
            Some(alert) = alert_rx.recv() => {
                log::warn!("{}: {}", app_name(), alert);
            }
        }
    };

    for (kind, summary) in player.health_summary() {
        log::info!("{} {}", kind, summary);
    }
    player.close();
    for demuxer in demuxers {
        if demuxer.join().is_err() {
            log::error!("{}: demuxer panicked", app_name());
        }
    }

    outcome
}
