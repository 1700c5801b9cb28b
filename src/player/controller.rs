//! Playback state machine
//!
//! The [`PlaybackController`] owns the clock and the stream pipelines of one
//! open session and is the only thing that changes them. Every command checks
//! the transition table in [`PlaybackState`] first.
//!
//! Jumps (seek, loop, rate change) follow one quiesce order:
//!
//! 1. stop feeding both pipelines
//! 2. flush both pipelines
//! 3. move the clock (discontinuity or new rate) and rebase frame accounting
//! 4. resume feeding from the new position

use parking_lot::Mutex;
use std::sync::Arc;

use super::events::{PlaybackEvent, PlaybackListener, Reposition, SeekTarget};
use super::speed;
use crate::config::PlayerSettings;
use crate::display::volume;
use crate::display::{DisplayRegion, Sinks};
use crate::error::{PipelineError, Result};
use crate::pipeline::catalog::{ComponentCatalog, SoftwareCatalog};
use crate::pipeline::clock::{MonotonicTime, PlaybackClock, TimeSource};
use crate::pipeline::frames::FrameAccountant;
use crate::pipeline::health::{HealthSummary, PipelineHealth};
use crate::pipeline::state::{ErrorKind, PlaybackState, ResumeState};
use crate::pipeline::stream::{OutputSink, PacketFeeder, PipelineContext, StreamPipeline};
use crate::pipeline::types::{MediaInfo, MediaKind, Timestamp};
use crate::utils::sos::SignalOfStop;

/// Everything that exists only while a stream is open
struct Session {
    info: MediaInfo,
    clock: Arc<PlaybackClock>,
    stop: SignalOfStop,
    frames: Arc<Mutex<FrameAccountant>>,
    video: Option<StreamPipeline>,
    audio: Option<StreamPipeline>,
}

impl Session {
    fn pipelines(&self) -> impl Iterator<Item = &StreamPipeline> {
        self.video.iter().chain(self.audio.iter())
    }

    /// The pipeline whose first frame ends the Opening state
    fn primary(&self) -> Option<&StreamPipeline> {
        self.video.as_ref().or(self.audio.as_ref())
    }

    fn current_frame(&self) -> u64 {
        let snapshot = self.clock.snapshot();
        self.frames
            .lock()
            .current_frame(snapshot.media_time, snapshot.rate)
    }

    fn total_frames(&self) -> u64 {
        self.total_frames_at(self.frames.lock().fps())
    }

    fn total_frames_at(&self, fps: f64) -> u64 {
        (self.info.duration().as_seconds() * fps).round() as u64
    }

    fn close(&mut self) {
        self.stop.cancel();
        if let Some(mut audio) = self.audio.take() {
            audio.close();
        }
        if let Some(mut video) = self.video.take() {
            video.close();
        }
    }
}

pub struct PlaybackController {
    state: PlaybackState,
    settings: PlayerSettings,
    catalog: Arc<dyn ComponentCatalog>,
    time: Arc<dyn TimeSource>,
    session: Option<Session>,
    listener: Option<Box<dyn PlaybackListener>>,
    looping: bool,
    volume_millibels: i32,
    region: DisplayRegion,
    /// `pause(true)` arrived before the first frame
    pause_requested: bool,
}

impl PlaybackController {
    /// Controller on the software catalog and the monotonic clock
    pub fn new() -> Self {
        Self::with_catalog(Arc::new(SoftwareCatalog::new()))
    }

    pub fn with_catalog(catalog: Arc<dyn ComponentCatalog>) -> Self {
        let settings = PlayerSettings::default();
        Self {
            state: PlaybackState::Closed,
            looping: settings.loop_playback,
            volume_millibels: volume::normalized_to_millibels(settings.initial_volume),
            region: settings.display_region,
            settings,
            catalog,
            time: Arc::new(MonotonicTime::new()),
            session: None,
            listener: None,
            pause_requested: false,
        }
    }

    /// Drive session clocks from `time` instead of the system clock
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn set_listener(&mut self, listener: impl PlaybackListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Open a stream, returning false on failure (the reason is logged)
    pub fn open(&mut self, info: &MediaInfo, settings: PlayerSettings, sinks: Sinks) -> bool {
        match self.try_open(info, settings, sinks) {
            Ok(()) => true,
            Err(e) => {
                log::error!("PlaybackController: open failed: {}", e);
                false
            }
        }
    }

    /// Build the clock and pipelines for `info` and enter Opening
    ///
    /// A configuration problem leaves the controller Closed; running out of
    /// resources leaves it in Error until `close`.
    pub fn try_open(
        &mut self,
        info: &MediaInfo,
        settings: PlayerSettings,
        sinks: Sinks,
    ) -> Result<()> {
        self.close();

        match self.build_session(info, &settings, sinks) {
            Ok(session) => {
                self.looping = settings.loop_playback;
                self.region = settings.display_region;
                self.volume_millibels = volume::normalized_to_millibels(settings.initial_volume);
                if let Some(audio) = &session.audio {
                    audio.set_gain(self.volume_millibels);
                }
                self.settings = settings;
                self.session = Some(session);
                self.transition("open", PlaybackState::Opening)?;
                log::info!(
                    "PlaybackController: opened ({:.2}s, {} fps)",
                    info.duration().as_seconds(),
                    self.fps()
                );
                Ok(())
            }
            Err(e) => {
                if let Some(kind) = ErrorKind::of(&e) {
                    self.state = PlaybackState::Error { kind };
                }
                Err(e)
            }
        }
    }

    fn build_session(
        &self,
        info: &MediaInfo,
        settings: &PlayerSettings,
        sinks: Sinks,
    ) -> Result<Session> {
        let audio_info = info.audio.as_ref().filter(|_| settings.enable_audio);
        if info.video.is_none() && audio_info.is_none() {
            return Err(PipelineError::Configuration("no playable stream".into()));
        }

        let clock = Arc::new(PlaybackClock::with_time_source(self.time.clone()));
        let stop = SignalOfStop::new();
        let fps = info.video.as_ref().map_or(0.0, |v| v.frame_rate);
        let frames = Arc::new(Mutex::new(FrameAccountant::new(
            fps,
            settings.prefer_exact_frame_count,
        )));
        let options = settings.pipeline_options();

        let mut session = Session {
            info: info.clone(),
            clock: clock.clone(),
            stop: stop.clone(),
            frames: frames.clone(),
            video: None,
            audio: None,
        };

        let Sinks {
            video: video_sink,
            audio: audio_sink,
        } = sinks;

        let opened = (|| -> Result<()> {
            if let Some(descriptor) = &info.video {
                let context = PipelineContext::new(clock.clone())
                    .with_stop(stop.clone())
                    .with_frames(frames.clone());
                let output = video_sink.map_or(OutputSink::Discard, OutputSink::Video);
                session.video = Some(StreamPipeline::open(
                    descriptor,
                    context,
                    options.clone(),
                    self.catalog.as_ref(),
                    output,
                )?);
            }
            if let Some(descriptor) = audio_info {
                let context = PipelineContext::new(clock.clone()).with_stop(stop.clone());
                let output = audio_sink.map_or(OutputSink::Discard, OutputSink::Audio);
                session.audio = Some(StreamPipeline::open(
                    descriptor,
                    context,
                    options.clone(),
                    self.catalog.as_ref(),
                    output,
                )?);
            }
            Ok(())
        })();

        match opened {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    fn transition(&mut self, operation: &'static str, target: PlaybackState) -> Result<()> {
        if !self.state.can_transition_to(&target) {
            return Err(PipelineError::invalid_state(operation, self.state));
        }
        if self.state != target {
            log::debug!("PlaybackController: {} -> {}", self.state, target);
        }
        self.state = target;
        Ok(())
    }

    /// Move to Error if `error` is a fault. Returns the error for `?` chains.
    fn escalate(&mut self, error: PipelineError) -> PipelineError {
        if let Some(kind) = ErrorKind::of(&error)
            && !self.state.is_error()
        {
            log::error!("PlaybackController: {}, entering error state", error);
            if let Some(session) = &self.session {
                session.pipelines().for_each(|p| p.set_accepting(false));
                session.clock.pause(true);
            }
            self.state = PlaybackState::Error { kind };
        }
        error
    }

    fn session(&self, operation: &'static str) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state(operation, self.state))
    }

    /// Stop feed, flush both pipelines, let `apply` move the clock, resume
    /// feed from the position it returns, then settle into `resume`
    fn quiesce(
        &mut self,
        operation: &'static str,
        resume: ResumeState,
        apply: impl FnOnce(&Session) -> Result<Timestamp>,
    ) -> Result<Timestamp> {
        self.transition(operation, PlaybackState::Seeking { resume })?;
        let timeout = self.settings.flush_timeout();

        let result = (|| -> Result<Timestamp> {
            let session = self.session(operation)?;
            for pipeline in session.pipelines() {
                pipeline.set_accepting(false);
            }
            for pipeline in session.pipelines() {
                pipeline.flush(timeout)?;
            }
            let restart = apply(session)?;
            for pipeline in session.pipelines() {
                pipeline.resume_feed(restart);
            }
            Ok(restart)
        })();

        match result {
            Ok(restart) => {
                self.transition(operation, resume.into_state())?;
                Ok(restart)
            }
            Err(e) => {
                let error = self.escalate(e);
                if !self.state.is_error() {
                    // Nothing moved: reopen the feed where the clock stands
                    if let Some(session) = &self.session {
                        let restart = session.clock.media_time();
                        session.pipelines().for_each(|p| p.resume_feed(restart));
                    }
                    self.state = resume.into_state();
                }
                Err(error)
            }
        }
    }

    pub fn play(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Opening => {
                self.pause_requested = false;
                Ok(())
            }
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused => {
                self.session("play")?.clock.pause(false);
                self.transition("play", PlaybackState::Playing)
            }
            state => Err(PipelineError::invalid_state("play", state)),
        }
    }

    /// Freeze (`true`) or resume (`false`) playback. Idempotent.
    pub fn pause(&mut self, pause: bool) -> Result<()> {
        if !pause {
            return self.play();
        }
        match self.state {
            PlaybackState::Opening => {
                self.pause_requested = true;
                Ok(())
            }
            PlaybackState::Paused => Ok(()),
            PlaybackState::Playing => {
                self.session("pause")?.clock.pause(true);
                self.transition("pause", PlaybackState::Paused)
            }
            state => Err(PipelineError::invalid_state("pause", state)),
        }
    }

    pub fn toggle_pause(&mut self) -> Result<()> {
        let paused = match self.state {
            PlaybackState::Opening => self.pause_requested,
            state => state.is_paused(),
        };
        self.pause(!paused)
    }

    /// Change the rate multiplier (negative plays in reverse)
    ///
    /// A real change flushes both pipelines once and restarts feeding from
    /// the current position, which also covers forward/reverse flips.
    pub fn set_speed(&mut self, rate: i32) -> Result<()> {
        if !speed::is_valid(rate) {
            return Err(PipelineError::InvalidArgument(format!(
                "speed {} outside ±{}",
                rate,
                speed::MAX_SPEED
            )));
        }

        if self.state == PlaybackState::Opening {
            return self.session("set_speed")?.clock.set_rate(rate);
        }
        let resume = match self.state {
            PlaybackState::Playing => ResumeState::Playing,
            PlaybackState::Paused => ResumeState::Paused,
            state => return Err(PipelineError::invalid_state("set_speed", state)),
        };

        let session = self.session("set_speed")?;
        let previous = session.clock.rate();
        if previous == rate {
            return Ok(());
        }

        let restart = self.quiesce("set_speed", resume, |session| {
            let snapshot = session.clock.snapshot();
            let frame = session
                .frames
                .lock()
                .current_frame(snapshot.media_time, snapshot.rate);
            session.clock.set_rate(rate)?;
            session.clock.packet_boundary();
            session.clock.notify_discontinuity(snapshot.media_time);
            session.frames.lock().rebase(frame, snapshot.media_time);
            Ok(snapshot.media_time)
        })?;

        log::info!(
            "PlaybackController: speed {}x -> {}x at {:.3}s",
            previous,
            rate,
            restart.as_seconds()
        );
        Ok(())
    }

    pub fn increase_speed(&mut self) -> Result<()> {
        self.set_speed(speed::faster(self.speed()))
    }

    pub fn decrease_speed(&mut self) -> Result<()> {
        self.set_speed(speed::slower(self.speed()))
    }

    pub fn set_normal_speed(&mut self) -> Result<()> {
        self.set_speed(speed::NORMAL_SPEED)
    }

    pub fn fast_forward(&mut self) -> Result<()> {
        self.set_speed(speed::fast_forward(self.speed()))
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.set_speed(speed::rewind(self.speed()))
    }

    /// Jump to a time or frame, keeping the current play/pause state
    /// (a finished stream resumes paused)
    pub fn seek(&mut self, target: SeekTarget) -> Result<Reposition> {
        let resume = self
            .state
            .seek_resume()
            .ok_or_else(|| PipelineError::invalid_state("seek", self.state))?;
        let session = self.session("seek")?;

        let (time, frame) = {
            let frames = session.frames.lock();
            let duration = session.info.duration();
            match target {
                SeekTarget::Time(time) => {
                    let time = if duration > Timestamp::ZERO {
                        time.clamp(Timestamp::ZERO, duration)
                    } else {
                        time.max(Timestamp::ZERO)
                    };
                    (time, frames.time_to_frame(time))
                }
                SeekTarget::Frame(frame) => {
                    let total = session.total_frames_at(frames.fps());
                    let frame = if total > 0 { frame.min(total) } else { frame };
                    (frames.frame_to_time(frame), frame)
                }
            }
        };

        let restart = self.quiesce("seek", resume, |session| {
            session.clock.notify_discontinuity(time);
            session.frames.lock().rebase(frame, time);
            Ok(time)
        })?;

        let reposition = Reposition {
            time: restart,
            frame,
            rate: self.speed(),
        };
        log::info!(
            "PlaybackController: seek to {:.3}s (frame {})",
            restart.as_seconds(),
            frame
        );
        Ok(reposition)
    }

    pub fn seek_to_time_seconds(&mut self, seconds: f64) -> Result<Reposition> {
        self.seek(SeekTarget::Time(Timestamp::from_seconds(seconds.max(0.0))))
    }

    pub fn seek_to_frame(&mut self, frame: u64) -> Result<Reposition> {
        self.seek(SeekTarget::Frame(frame))
    }

    /// Back to frame 0 and playing
    pub fn restart(&mut self) -> Result<Reposition> {
        let reposition = self.seek(SeekTarget::Frame(0))?;
        self.play()?;
        Ok(reposition)
    }

    /// Present `frames` more video frames while paused, without touching the
    /// rate. Returns how many were presented within the step timeout.
    pub fn step(&mut self, frames: u32) -> Result<u32> {
        if !self.state.is_paused() {
            return Err(PipelineError::invalid_state("step", self.state));
        }
        let timeout = self.settings.step_timeout();
        let video = self
            .session("step")?
            .video
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state("step", "playing audio only"))?;
        if frames == 0 {
            return Ok(0);
        }

        let advanced = video.request_step(frames, timeout)?;
        if advanced < frames {
            log::warn!(
                "PlaybackController: stepped {} of {} frames within {:?}",
                advanced,
                frames,
                timeout
            );
        }
        Ok(advanced)
    }

    pub fn step_frame_forward(&mut self) -> Result<u32> {
        self.step(1)
    }

    pub fn enable_looping(&mut self) {
        self.looping = true;
    }

    pub fn disable_looping(&mut self) {
        self.looping = false;
    }

    pub fn is_looping_enabled(&self) -> bool {
        self.looping
    }

    pub fn set_volume_normalized(&mut self, volume: f64) {
        self.set_volume_millibels(volume::normalized_to_millibels(volume));
    }

    pub fn volume_normalized(&self) -> f64 {
        volume::millibels_to_normalized(self.volume_millibels)
    }

    pub fn volume_millibels(&self) -> i32 {
        self.volume_millibels
    }

    pub fn increase_volume(&mut self) {
        self.set_volume_millibels(volume::step_millibels(self.volume_millibels, 1));
    }

    pub fn decrease_volume(&mut self) {
        self.set_volume_millibels(volume::step_millibels(self.volume_millibels, -1));
    }

    fn set_volume_millibels(&mut self, millibels: i32) {
        self.volume_millibels = millibels.clamp(volume::MIN_MILLIBELS, volume::MAX_MILLIBELS);
        if let Some(audio) = self.session.as_ref().and_then(|s| s.audio.as_ref()) {
            audio.set_gain(self.volume_millibels);
        }
    }

    pub fn set_display_region(&mut self, region: DisplayRegion) {
        self.region = region;
        if let Some(video) = self.session.as_ref().and_then(|s| s.video.as_ref()) {
            video.set_region(region);
        }
    }

    pub fn display_region(&self) -> DisplayRegion {
        self.region
    }

    /// Observe pipeline progress and advance the state machine
    ///
    /// Call on the facade's own cadence. Handles pipeline faults, the first
    /// frame, reverse playback reaching the start, and end of stream.
    pub fn poll(&mut self) -> Option<PlaybackEvent> {
        let session = self.session.as_ref()?;
        if self.state.is_error() {
            return None;
        }

        let fault = session.pipelines().find_map(|p| p.fault());
        if let Some(fault) = fault {
            let error = self.escalate(fault);
            return ErrorKind::of(&error).map(PlaybackEvent::Error);
        }

        match self.state {
            PlaybackState::Opening => {
                if !session.primary().is_some_and(|p| p.is_first_frame_ready()) {
                    return None;
                }
                session.clock.start(Timestamp::ZERO);
                let target = if self.pause_requested {
                    session.clock.pause(true);
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                };
                self.pause_requested = false;
                self.transition("first frame", target).ok()?;
                log::info!("PlaybackController: first frame ready, {}", self.state);
                Some(PlaybackEvent::FirstFrame)
            }
            PlaybackState::Playing | PlaybackState::Paused => {
                let snapshot = session.clock.snapshot();
                if snapshot.rate < 0 && snapshot.media_time == Timestamp::ZERO {
                    log::info!("PlaybackController: reverse playback reached the start");
                    return match self.set_speed(speed::NORMAL_SPEED) {
                        Ok(()) => Some(PlaybackEvent::ReverseStartReached),
                        Err(e) => {
                            log::error!("PlaybackController: leaving reverse failed: {}", e);
                            ErrorKind::of(&e).map(PlaybackEvent::Error)
                        }
                    };
                }

                let finished = session
                    .pipelines()
                    .all(|p| p.end_of_stream() && p.is_drained());
                if !finished {
                    return None;
                }
                if self.looping {
                    self.loop_to_start()
                } else {
                    self.finish()
                }
            }
            _ => None,
        }
    }

    fn loop_to_start(&mut self) -> Option<PlaybackEvent> {
        match self.seek(SeekTarget::Frame(0)) {
            Ok(reposition) => {
                log::info!("PlaybackController: looped");
                Some(PlaybackEvent::Looped(reposition))
            }
            Err(e) => {
                log::error!("PlaybackController: loop failed: {}", e);
                ErrorKind::of(&e).map(PlaybackEvent::Error)
            }
        }
    }

    fn finish(&mut self) -> Option<PlaybackEvent> {
        self.transition("finish", PlaybackState::Finished).ok()?;
        if let Some(session) = &self.session {
            session.clock.pause(true);
        }
        log::info!("PlaybackController: finished");
        if let Some(listener) = self.listener.as_mut() {
            listener.on_finished();
        }
        Some(PlaybackEvent::Finished)
    }

    /// Cancel everything, join the workers and drop the session. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            log::info!("PlaybackController: closed");
        }
        self.state = PlaybackState::Closed;
        self.pause_requested = false;
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Rate multiplier in effect, 1 when closed
    pub fn speed(&self) -> i32 {
        self.session
            .as_ref()
            .map_or(speed::NORMAL_SPEED, |s| s.clock.rate())
    }

    pub fn media_time_micros(&self) -> i64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.clock.media_time_micros())
    }

    pub fn current_time_seconds(&self) -> f64 {
        self.media_time_micros() as f64 / 1_000_000.0
    }

    pub fn current_frame(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.current_frame())
    }

    pub fn total_frames(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.total_frames())
    }

    pub fn duration_seconds(&self) -> f64 {
        self.session
            .as_ref()
            .map_or(0.0, |s| s.info.duration().as_seconds())
    }

    pub fn fps(&self) -> f64 {
        self.session
            .as_ref()
            .and_then(|s| s.info.video.as_ref())
            .map_or(0.0, |v| v.frame_rate)
    }

    /// Video frame size, (0, 0) without a video stream
    pub fn dimensions(&self) -> (u32, u32) {
        self.session
            .as_ref()
            .and_then(|s| s.info.video.as_ref())
            .map_or((0, 0), |v| (v.width, v.height))
    }

    pub fn health_summary(&self) -> Vec<(MediaKind, HealthSummary)> {
        self.session
            .as_ref()
            .map(|s| {
                s.pipelines()
                    .map(|p| (p.kind(), p.health().summary()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live health counters, one per open pipeline
    pub fn pipeline_health(&self) -> Vec<(MediaKind, Arc<PipelineHealth>)> {
        self.session
            .as_ref()
            .map(|s| s.pipelines().map(|p| (p.kind(), p.health())).collect())
            .unwrap_or_default()
    }

    pub fn video_feeder(&self) -> Option<PacketFeeder> {
        self.session
            .as_ref()
            .and_then(|s| s.video.as_ref())
            .map(|p| p.feeder())
    }

    pub fn audio_feeder(&self) -> Option<PacketFeeder> {
        self.session
            .as_ref()
            .and_then(|s| s.audio.as_ref())
            .map(|p| p.feeder())
    }

    /// Mark the end of every stream; `poll` reports it once drained
    pub fn signal_end_of_stream(&self) {
        if let Some(session) = &self.session {
            session.pipelines().for_each(|p| p.signal_end_of_stream());
        }
    }

    /// Token that interrupts blocked feeders and flushes when cancelled
    pub fn cancel_handle(&self) -> Option<SignalOfStop> {
        self.session.as_ref().map(|s| s.stop.clone())
    }

    pub fn clock(&self) -> Option<Arc<PlaybackClock>> {
        self.session.as_ref().map(|s| s.clock.clone())
    }
}

impl Default for PlaybackController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("state", &self.state)
            .field("speed", &self.speed())
            .field("media_time", &self.media_time_micros())
            .field("looping", &self.looping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::SinkProbe;
    use crate::pipeline::catalog::{BufferLease, ComponentBackend, ComponentRole};
    use crate::pipeline::clock::ManualTime;
    use crate::pipeline::graph::ViolationPolicy;
    use crate::pipeline::types::{Codec, MediaUnit, Packet, SampleFormat, StreamDescriptor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Knobs for a video decoder that can hang, fail or make flushes slow
    #[derive(Clone, Default)]
    struct DecoderScript {
        stuck: Arc<AtomicBool>,
        failing: Arc<AtomicBool>,
        flush_cost: Option<(ManualTime, Duration)>,
    }

    struct ScriptedDecoder(DecoderScript);

    impl ComponentBackend for ScriptedDecoder {
        fn role(&self) -> ComponentRole {
            ComponentRole::VideoDecode
        }

        fn process(&mut self, unit: MediaUnit) -> Result<Option<MediaUnit>> {
            if self.0.failing.load(Ordering::SeqCst) {
                return Err(PipelineError::ResourceExhausted("decoder memory".into()));
            }
            Ok(Some(unit))
        }

        fn flush(&mut self) {
            if let Some((time, cost)) = &self.0.flush_cost {
                time.advance(*cost);
            }
        }

        fn is_drained(&self) -> bool {
            !self.0.stuck.load(Ordering::SeqCst)
        }

        fn queue_depth(&self) -> usize {
            4
        }
    }

    struct ScriptedCatalog {
        software: SoftwareCatalog,
        script: DecoderScript,
    }

    impl ComponentCatalog for ScriptedCatalog {
        fn create(
            &self,
            role: ComponentRole,
            descriptor: &StreamDescriptor,
        ) -> Result<Box<dyn ComponentBackend>> {
            match role {
                ComponentRole::VideoDecode => Ok(Box::new(ScriptedDecoder(self.script.clone()))),
                _ => self.software.create(role, descriptor),
            }
        }

        fn reserve_buffers(&self, bytes: usize) -> Result<BufferLease> {
            self.software.reserve_buffers(bytes)
        }
    }

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

    fn movie(seconds: i64, with_audio: bool) -> MediaInfo {
        MediaInfo {
            video: Some(StreamDescriptor::video(Codec::H264, 640, 480, 30.0)),
            audio: with_audio
                .then(|| StreamDescriptor::audio(Codec::Aac, 48_000, 2, SampleFormat::S16)),
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
        Packet::new(vec![1u8; 256], Some(Timestamp::from_micros(index * 1_000_000 / 30)))
    }

    fn open(time: &ManualTime, probe: &SinkProbe, info: &MediaInfo) -> PlaybackController {
        let mut player = PlaybackController::new().with_time_source(Arc::new(time.clone()));
        assert!(player.open(info, settings(), probe.sinks()));
        assert_eq!(player.state(), PlaybackState::Opening);
        player
    }

    fn open_scripted(
        time: &ManualTime,
        probe: &SinkProbe,
        script: &DecoderScript,
        settings: PlayerSettings,
    ) -> PlaybackController {
        let catalog = ScriptedCatalog {
            software: SoftwareCatalog::new(),
            script: script.clone(),
        };
        let mut player = PlaybackController::with_catalog(Arc::new(catalog))
            .with_time_source(Arc::new(time.clone()));
        assert!(player.open(&movie(10, false), settings, probe.sinks()));
        player
    }

    fn feed_and_start(player: &mut PlaybackController, frames: i64) {
        let feeder = player.video_feeder().unwrap();
        for i in 0..frames {
            feeder.try_feed(&frame(i)).unwrap();
        }
        assert!(wait_for(|| player.poll() == Some(PlaybackEvent::FirstFrame)));
    }

    #[test]
    fn test_open_without_streams_fails() {
        let mut player = PlaybackController::new();
        let info = MediaInfo {
            video: None,
            audio: None,
            duration_micros: 0,
        };
        assert!(!player.open(&info, settings(), Sinks::default()));
        assert_eq!(player.state(), PlaybackState::Closed);
        assert!(!player.is_open());
    }

    #[test]
    fn test_exhausted_resources_enter_error_state() {
        let mut player =
            PlaybackController::with_catalog(Arc::new(SoftwareCatalog::with_budget(1024)));
        let result = player.try_open(&movie(10, false), settings(), Sinks::default());
        assert!(matches!(result, Err(PipelineError::ResourceExhausted(_))));
        assert_eq!(
            player.state(),
            PlaybackState::Error {
                kind: ErrorKind::ResourceExhausted
            }
        );
        assert!(player.play().is_err());

        player.close();
        assert_eq!(player.state(), PlaybackState::Closed);
    }

    #[test]
    fn test_first_frame_starts_playback() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));
        feed_and_start(&mut player, 3);

        assert!(player.is_playing());
        assert_eq!(probe.frame_count(), 1);
        assert_eq!(player.dimensions(), (640, 480));
        assert_eq!(player.total_frames(), 300);

        time.advance(Duration::from_millis(70));
        assert!(wait_for(|| probe.frame_count() == 3));
        assert_eq!(player.current_frame(), 2);
    }

    #[test]
    fn test_pause_before_first_frame_lands_paused() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));
        player.pause(true).unwrap();
        feed_and_start(&mut player, 2);

        assert!(player.is_paused());
        time.advance(Duration::from_secs(1));
        assert_eq!(player.media_time_micros(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.frame_count(), 1);
    }

    #[test]
    fn test_step_only_while_paused() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));
        feed_and_start(&mut player, 5);

        assert!(matches!(
            player.step(1),
            Err(PipelineError::InvalidState { .. })
        ));

        player.pause(true).unwrap();
        assert_eq!(player.step(2).unwrap(), 2);
        assert_eq!(probe.frame_count(), 3);
        assert_eq!(player.current_frame(), 2);
        assert_eq!(player.media_time_micros(), 66_666);
        assert_eq!(player.speed(), 1);
        assert!(player.is_paused());
    }

    #[test]
    fn test_seek_clamps_to_stream_end() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));
        feed_and_start(&mut player, 1);

        let reposition = player.seek_to_frame(1_000).unwrap();
        assert_eq!(reposition.frame, 300);
        assert_eq!(reposition.time, Timestamp::from_seconds(10.0));
        assert!(player.is_playing());

        let reposition = player.seek_to_time_seconds(-3.0).unwrap();
        assert_eq!(reposition.time, Timestamp::ZERO);
        assert_eq!(player.current_frame(), 0);
    }

    #[test]
    fn test_finished_notifies_listener_once() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(1, false));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        player.set_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        feed_and_start(&mut player, 1);

        player.signal_end_of_stream();
        assert!(wait_for(|| player.poll() == Some(PlaybackEvent::Finished)));
        assert!(player.is_finished());
        assert_eq!(player.poll(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(player.play().is_err());
        player.seek_to_frame(0).unwrap();
        assert!(player.is_paused());
    }

    #[test]
    fn test_reverse_start_returns_to_normal_speed() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));
        feed_and_start(&mut player, 1);

        player.rewind().unwrap();
        assert_eq!(player.speed(), -2);
        assert_eq!(player.poll(), Some(PlaybackEvent::ReverseStartReached));
        assert_eq!(player.speed(), 1);
        assert!(player.is_playing());
    }

    #[test]
    fn test_speed_validation_and_opening_rate() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));

        assert!(matches!(
            player.set_speed(0),
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(player.set_speed(12).is_err());

        player.set_speed(2).unwrap();
        assert_eq!(player.speed(), 1);
        feed_and_start(&mut player, 1);
        assert_eq!(player.speed(), 2);
    }

    #[test]
    fn test_volume_reaches_audio_sink() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, true));
        assert_eq!(probe.gain(), Some(volume::normalized_to_millibels(0.5)));

        player.set_volume_normalized(1.0);
        player.increase_volume();
        assert_eq!(probe.gain(), Some(volume::MAX_MILLIBELS));
        player.decrease_volume();
        assert_eq!(player.volume_millibels(), volume::MAX_MILLIBELS - volume::STEP_MILLIBELS);
        assert_eq!(probe.gain(), Some(player.volume_millibels()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, true));
        let stop = player.cancel_handle().unwrap();

        player.close();
        player.close();
        assert!(stop.cancelled());
        assert_eq!(player.state(), PlaybackState::Closed);
        assert!(player.video_feeder().is_none());
        assert_eq!(player.current_frame(), 0);
    }

    #[test]
    fn test_late_drops_keep_frame_count_on_screen() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let mut player = open(&time, &probe, &movie(10, false));
        feed_and_start(&mut player, 1);

        // Most of the first second arrives too late to show
        time.advance(Duration::from_secs(1));
        let feeder = player.video_feeder().unwrap();
        for i in 1..=30 {
            feeder.feed(&frame(i)).unwrap();
        }
        assert!(wait_for(|| player.current_frame() == 30));
        assert!(player.pipeline_health()[0].1.late_drops() > 0);
        assert_eq!(probe.last_frame().unwrap().pts, Timestamp::from_seconds(1.0));
    }

    #[test]
    fn test_stalled_flush_enters_error_state() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let script = DecoderScript::default();
        let settings = PlayerSettings {
            flush_timeout_ms: 20,
            ..settings()
        };
        let mut player = open_scripted(&time, &probe, &script, settings);
        feed_and_start(&mut player, 1);

        script.stuck.store(true, Ordering::SeqCst);
        assert!(matches!(
            player.seek_to_frame(60),
            Err(PipelineError::StallTimeout { .. })
        ));
        assert_eq!(
            player.state(),
            PlaybackState::Error {
                kind: ErrorKind::StallTimeout
            }
        );

        script.stuck.store(false, Ordering::SeqCst);
        assert!(player.play().is_err());
        assert!(player.seek_to_frame(0).is_err());
        assert!(player.set_speed(2).is_err());
        assert_eq!(player.poll(), None);
        assert!(player.state().is_error());

        player.close();
        assert_eq!(player.state(), PlaybackState::Closed);
    }

    #[test]
    fn test_stalled_speed_change_enters_error_state() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let script = DecoderScript::default();
        let settings = PlayerSettings {
            flush_timeout_ms: 20,
            ..settings()
        };
        let mut player = open_scripted(&time, &probe, &script, settings);
        feed_and_start(&mut player, 1);
        player.pause(true).unwrap();

        script.stuck.store(true, Ordering::SeqCst);
        assert!(player.set_speed(4).is_err());
        assert_eq!(
            player.state(),
            PlaybackState::Error {
                kind: ErrorKind::StallTimeout
            }
        );
        assert!(player.step(1).is_err());
        assert!(player.pause(false).is_err());
    }

    #[test]
    fn test_pacer_fault_surfaces_from_poll() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let script = DecoderScript::default();
        let mut player = open_scripted(&time, &probe, &script, settings());
        feed_and_start(&mut player, 1);

        script.failing.store(true, Ordering::SeqCst);
        let feeder = player.video_feeder().unwrap();
        feeder.try_feed(&frame(1)).unwrap();
        assert!(wait_for(|| {
            player.poll() == Some(PlaybackEvent::Error(ErrorKind::ResourceExhausted))
        }));
        assert_eq!(
            player.state(),
            PlaybackState::Error {
                kind: ErrorKind::ResourceExhausted
            }
        );
        assert_eq!(feeder.try_feed(&frame(2)), Err(PipelineError::Quiesced));
        assert!(player.play().is_err());
    }

    #[test]
    fn test_cancelled_seek_keeps_feeding() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let script = DecoderScript::default();
        let mut player = open_scripted(&time, &probe, &script, settings());
        feed_and_start(&mut player, 1);
        time.advance(Duration::from_millis(500));

        script.stuck.store(true, Ordering::SeqCst);
        player.cancel_handle().unwrap().cancel();
        assert!(matches!(
            player.seek_to_frame(200),
            Err(PipelineError::Cancelled)
        ));

        assert!(player.is_playing());
        assert_eq!(player.media_time_micros(), 500_000);
        let video = player.session.as_ref().unwrap().video.as_ref().unwrap();
        assert!(video.is_accepting());
    }

    #[test]
    fn test_speed_change_rebases_after_flush() {
        let time = ManualTime::new();
        let probe = SinkProbe::new();
        let script = DecoderScript {
            flush_cost: Some((time.clone(), Duration::from_millis(500))),
            ..DecoderScript::default()
        };
        let settings = PlayerSettings {
            prefer_exact_frame_count: false,
            ..settings()
        };
        let mut player = open_scripted(&time, &probe, &script, settings);
        feed_and_start(&mut player, 1);
        time.advance(Duration::from_secs(1));
        assert_eq!(player.current_frame(), 30);

        // The flush itself takes half a second of wall time
        player.set_speed(2).unwrap();
        assert_eq!(player.media_time_micros(), 1_500_000);
        assert_eq!(player.current_frame(), 45);

        time.advance(Duration::from_millis(500));
        assert_eq!(player.current_frame(), 75);
    }
}
