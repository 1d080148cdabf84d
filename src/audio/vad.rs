//! Energy-based end-of-turn detection.
//!
//! [`SilenceDetector`] is the pure decision rule: any sample above the
//! threshold refreshes the last-speech timestamp, and once the gap since the
//! last speech exceeds the hold the turn ends, exactly once.
//!
//! [`run_silence_monitor`] drives it from the live capture: it drains frames
//! from the recorder every poll interval, feeds the analyser and reports why
//! the turn ended. A monitor that is told to stop, or whose frame source goes
//! away, returns `None` and never reports an end of turn.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::analyser::{AnalyserConfig, FrequencyAnalyser};
use super::{AudioError, FrameReceiver};

/// What a single energy observation meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Speech,
    Silence,
    /// The hold elapsed on this observation. Reported once per detector.
    EndOfTurn,
    /// The detector already fired; later observations are ignored.
    Finished,
}

#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold: f32,
    hold: Duration,
    last_speech: Instant,
    fired: bool,
}

impl SilenceDetector {
    /// `now` seeds the last-speech timestamp, so a capture that never hears
    /// speech still ends after one hold.
    pub fn new(threshold: f32, hold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            hold,
            last_speech: now,
            fired: false,
        }
    }

    pub fn observe(&mut self, energy: f32, now: Instant) -> Activity {
        if self.fired {
            return Activity::Finished;
        }

        if energy > self.threshold {
            self.last_speech = now;
            return Activity::Speech;
        }

        if now.saturating_duration_since(self.last_speech) > self.hold {
            self.fired = true;
            return Activity::EndOfTurn;
        }

        Activity::Silence
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn last_speech(&self) -> Instant {
        self.last_speech
    }
}

/// Why a listening turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEnd {
    Silence,
    MaxDuration,
}

impl std::fmt::Display for TurnEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnEnd::Silence => write!(f, "silence"),
            TurnEnd::MaxDuration => write!(f, "max duration"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub analyser: AnalyserConfig,
    pub energy_threshold: f32,
    pub silence_hold: Duration,
    pub poll_interval: Duration,
    pub max_listen: Duration,
}

/// Poll the capture until the turn ends or the monitor is stopped.
pub async fn run_silence_monitor(
    mut frames: FrameReceiver,
    mut stop_rx: oneshot::Receiver<()>,
    config: MonitorConfig,
) -> Result<Option<TurnEnd>, AudioError> {
    let mut analyser = FrequencyAnalyser::new(config.analyser)?;
    let started = Instant::now();
    let mut detector = SilenceDetector::new(config.energy_threshold, config.silence_hold, started);

    let mut tick = interval(config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::debug!(
        "VAD: monitor started (threshold={}, hold={:?}, poll={:?})",
        config.energy_threshold,
        config.silence_hold,
        config.poll_interval
    );

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                log::debug!("VAD: monitor stopped");
                return Ok(None);
            }
            _ = tick.tick() => {
                loop {
                    match frames.try_recv() {
                        Ok(samples) => analyser.push_samples(&samples),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            log::debug!("VAD: frame source closed, monitor exiting");
                            return Ok(None);
                        }
                    }
                }

                let now = Instant::now();
                let energy = analyser.average_energy();
                match detector.observe(energy, now) {
                    Activity::EndOfTurn => {
                        log::info!(
                            "VAD: end of turn after {:?} of silence",
                            now.saturating_duration_since(detector.last_speech())
                        );
                        return Ok(Some(TurnEnd::Silence));
                    }
                    Activity::Finished => return Ok(None),
                    Activity::Speech | Activity::Silence => {}
                }

                if now.saturating_duration_since(started) >= config.max_listen {
                    log::info!("VAD: listening cap of {:?} reached", config.max_listen);
                    return Ok(Some(TurnEnd::MaxDuration));
                }
            }
        }
    }
}
