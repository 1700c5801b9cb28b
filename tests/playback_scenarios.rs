//! End-to-end playback scenarios on a manual clock

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tunnelplay::PipelineError;
use tunnelplay::config::PlayerSettings;
use tunnelplay::display::SinkProbe;
use tunnelplay::pipeline::catalog::{ComponentCatalog, ComponentRole};
use tunnelplay::pipeline::graph::{ComponentGraph, ViolationPolicy};
use tunnelplay::pipeline::{
    Codec, ManualTime, MediaInfo, OutputSink, Packet, PipelineContext, PipelineOptions,
    PlaybackClock, PlaybackState, SampleFormat, SoftwareCatalog, StreamDescriptor,
    StreamPipeline, Timestamp,
};
use tunnelplay::player::{PlaybackController, PlaybackEvent};

const FPS: f64 = 30.0;

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn movie(seconds: i64) -> MediaInfo {
    MediaInfo {
        video: Some(StreamDescriptor::video(Codec::H264, 640, 480, FPS)),
        audio: None,
        duration_micros: seconds * 1_000_000,
    }
}

fn settings() -> PlayerSettings {
    PlayerSettings {
        violation_policy: ViolationPolicy::Report,
        ..PlayerSettings::default()
    }
}

fn frame(index: i64) -> Packet {
    Packet::new(
        vec![7u8; 512],
        Some(Timestamp::from_micros(index * 1_000_000 / FPS as i64)),
    )
}

fn big_packet() -> Packet {
    Packet::new(vec![0u8; 80 * 1024], None)
}

fn far_ahead_packet() -> Packet {
    Packet::new(vec![0u8; 80 * 1024], Some(Timestamp::from_seconds(9.0)))
}

struct Session {
    time: ManualTime,
    probe: SinkProbe,
    player: PlaybackController,
}

impl Session {
    fn open(info: &MediaInfo, settings: PlayerSettings) -> Self {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = PlaybackController::new().with_time_source(Arc::new(time.clone()));
        assert!(player.open(info, settings, probe.sinks()));
        Self {
            time,
            probe,
            player,
        }
    }

    /// Open, feed the first `frames` frames and wait until playback starts
    fn playing(info: &MediaInfo, settings: PlayerSettings, frames: i64) -> Self {
        let mut session = Self::open(info, settings);
        let feeder = session.player.video_feeder().unwrap();
        for i in 0..frames {
            feeder.try_feed(&frame(i)).unwrap();
        }
        let player = &mut session.player;
        assert!(wait_for(|| player.poll() == Some(PlaybackEvent::FirstFrame)));
        assert!(session.player.is_playing());
        session
    }
}

#[test]
fn test_seek_to_frame_positions_clock_and_feeder() {
    let mut session = Session::playing(&movie(10), settings(), 3);
    let mut feeder = session.player.video_feeder().unwrap();

    let reposition = session.player.seek_to_frame(150).unwrap();
    assert_eq!(reposition.time, Timestamp::from_seconds(5.0));
    assert_eq!(reposition.frame, 150);
    assert_eq!(session.player.current_time_seconds(), 5.0);
    assert_eq!(session.player.current_frame(), 150);
    assert!(session.player.is_playing());

    assert!(matches!(
        feeder.try_feed(&frame(3)),
        Err(PipelineError::Discontinuity { .. })
    ));
    assert_eq!(
        feeder.acknowledge_discontinuity(),
        Ok(Timestamp::from_seconds(5.0))
    );
    assert!(feeder.try_feed(&frame(150)).is_ok());
}

#[test]
fn test_feeder_blocked_across_seek_restarts_cleanly() {
    let mut session = Session::playing(&movie(10), settings(), 1);
    let feeder = session.player.video_feeder().unwrap();
    while feeder.try_feed(&far_ahead_packet()).is_ok() {}
    std::thread::sleep(Duration::from_millis(50));
    while feeder.try_feed(&far_ahead_packet()).is_ok() {}

    let blocked = std::thread::spawn(move || {
        feeder.feed_timeout(&far_ahead_packet(), Duration::from_secs(30))
    });
    std::thread::sleep(Duration::from_millis(30));
    session.player.seek_to_frame(0).unwrap();

    let result = blocked.join().unwrap();
    assert!(matches!(
        result,
        Err(PipelineError::Discontinuity { .. }) | Err(PipelineError::Quiesced)
    ));

    let feeder = session.player.video_feeder().unwrap();
    for i in 0..10 {
        feeder.try_feed(&frame(i)).unwrap();
    }
    let shown = |pts: i64| {
        session
            .probe
            .last_frame()
            .is_some_and(|f| f.pts == Timestamp::from_micros(pts))
    };
    session.time.advance(Duration::from_millis(100));
    assert!(wait_for(|| shown(100_000)));
}

#[test]
fn test_speed_change_flushes_once_and_doubles_cadence() {
    let mut session = Session::playing(&movie(10), settings(), 1);
    session.player.set_speed(2).unwrap();

    let health = session.player.pipeline_health();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].1.flushes(), 1);
    assert_eq!(session.player.speed(), 2);

    let shown = session.probe.frame_count();
    let feeder = session.player.video_feeder().unwrap();
    for i in 1..=6 {
        feeder.try_feed(&frame(i)).unwrap();
    }

    // 50ms of wall time is 100ms of media time: frames 1, 2 and 3 fall due
    session.time.advance(Duration::from_millis(50));
    assert_eq!(session.player.media_time_micros(), 100_000);
    assert!(wait_for(|| session.probe.frame_count() == shown + 3));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(session.probe.frame_count(), shown + 3);

    // Same rate again is a no-op
    session.player.set_speed(2).unwrap();
    assert_eq!(health[0].1.flushes(), 1);
}

#[test]
fn test_loop_restarts_without_finishing() {
    let settings = PlayerSettings {
        loop_playback: true,
        ..settings()
    };
    let mut session = Session::playing(&movie(1), settings, 1);
    let mut feeder = session.player.video_feeder().unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    session.player.set_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.time.advance(Duration::from_millis(500));
    session.player.signal_end_of_stream();
    let player = &mut session.player;
    assert!(wait_for(|| matches!(
        player.poll(),
        Some(PlaybackEvent::Looped(reposition)) if reposition.frame == 0
    )));

    assert!(session.player.is_playing());
    assert_eq!(session.player.current_frame(), 0);
    assert_eq!(session.player.media_time_micros(), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // The demuxer restarts from the top and the next frame shown is frame 0
    assert_eq!(feeder.acknowledge_discontinuity(), Ok(Timestamp::ZERO));
    let shown = session.probe.frame_count();
    feeder.try_feed(&frame(0)).unwrap();
    assert!(wait_for(|| session.probe.frame_count() == shown + 1));
    assert_eq!(session.probe.last_frame().unwrap().pts, Timestamp::ZERO);
    assert_eq!(session.player.current_frame(), 0);
}

#[test]
fn test_full_input_buffer_left_unchanged() {
    let time = ManualTime::new();
    let clock = Arc::new(PlaybackClock::with_time_source(Arc::new(time)));
    let pipeline = StreamPipeline::open(
        &StreamDescriptor::video(Codec::H264, 640, 480, FPS),
        PipelineContext::new(clock),
        PipelineOptions {
            violation_policy: ViolationPolicy::Report,
            ..PipelineOptions::default()
        },
        &SoftwareCatalog::new(),
        OutputSink::Discard,
    )
    .unwrap();

    // The clock never starts, so the graph backs up into the input buffer
    while pipeline.decode(&big_packet()) {}
    std::thread::sleep(Duration::from_millis(50));
    while pipeline.decode(&big_packet()) {}

    let queued = pipeline.queued_packets();
    assert!(queued > 0);
    assert!(matches!(
        pipeline.try_decode(&big_packet()),
        Err(PipelineError::Backpressure { .. })
    ));
    assert_eq!(pipeline.queued_packets(), queued);
    assert!(pipeline.health().backpressure_refusals() >= 1);
}

#[test]
fn test_second_tunnel_on_a_port_is_a_violation() {
    let catalog = SoftwareCatalog::new();
    let descriptor = StreamDescriptor::video(Codec::H264, 640, 480, FPS);
    let mut graph = ComponentGraph::new(ViolationPolicy::Report);

    let mut add = |role: ComponentRole| {
        let backend = catalog.create(role, &descriptor).unwrap();
        graph.add_component(role.name(), role.ports(), backend).unwrap()
    };
    let decoder = add(ComponentRole::VideoDecode);
    let renderer = add(ComponentRole::VideoRender);

    let tunnel = graph.tunnel(decoder, 131, renderer, 90).unwrap();
    assert!(matches!(
        graph.tunnel(decoder, 131, renderer, 90),
        Err(PipelineError::TunnelViolation(_))
    ));

    graph.activate_tunnel(tunnel).unwrap();
    assert!(matches!(
        graph.destroy_component(renderer),
        Err(PipelineError::TunnelViolation(_))
    ));
    graph.teardown().unwrap();
}

#[test]
fn test_pause_freezes_media_time() {
    let mut session = Session::playing(&movie(10), settings(), 1);
    session.time.advance(Duration::from_millis(100));
    assert_eq!(session.player.media_time_micros(), 100_000);

    session.player.pause(true).unwrap();
    session.player.pause(true).unwrap();
    session.time.advance(Duration::from_secs(1));
    assert_eq!(session.player.media_time_micros(), 100_000);
    assert!(session.player.is_paused());

    session.player.toggle_pause().unwrap();
    session.time.advance(Duration::from_millis(50));
    assert_eq!(session.player.media_time_micros(), 150_000);
    assert!(session.player.is_playing());
}

#[test]
fn test_media_time_scales_with_rate() {
    let mut session = Session::playing(&movie(10), settings(), 1);

    session.player.set_speed(4).unwrap();
    session.time.advance(Duration::from_millis(250));
    assert_eq!(session.player.media_time_micros(), 1_000_000);

    session.player.set_speed(-2).unwrap();
    session.time.advance(Duration::from_millis(100));
    assert_eq!(session.player.media_time_micros(), 800_000);
    assert_eq!(session.player.speed(), -2);
}

#[test]
fn test_cancel_interrupts_blocked_feeder() {
    let session = Session::open(&movie(10), settings());
    let feeder = session.player.video_feeder().unwrap();

    // Never polled, so the clock stays paused and the input fills up
    while feeder.try_feed(&big_packet()).is_ok() {}
    std::thread::sleep(Duration::from_millis(50));
    while feeder.try_feed(&big_packet()).is_ok() {}

    let blocked = std::thread::spawn(move || {
        let start = Instant::now();
        let result = feeder.feed_timeout(&big_packet(), Duration::from_secs(30));
        (result, start.elapsed())
    });
    std::thread::sleep(Duration::from_millis(30));
    session.player.cancel_handle().unwrap().cancel();

    let (result, elapsed) = blocked.join().unwrap();
    assert_eq!(result, Err(PipelineError::Cancelled));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_step_rejected_unless_paused_video() {
    let mut session = Session::playing(&movie(10), settings(), 2);
    assert!(matches!(
        session.player.step(1),
        Err(PipelineError::InvalidState { .. })
    ));
    assert_eq!(session.player.state(), PlaybackState::Playing);

    let mut audio_only = PlaybackController::new();
    let info = MediaInfo {
        video: None,
        audio: Some(StreamDescriptor::audio(Codec::Aac, 48_000, 2, SampleFormat::S16)),
        duration_micros: 5_000_000,
    };
    let probe = SinkProbe::new();
    assert!(audio_only.open(&info, settings(), probe.sinks()));
    assert!(audio_only.step(1).is_err());
}
