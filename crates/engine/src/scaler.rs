//! Adaptive auto-scaler driving stream activation from producer/drain
//! rates.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use transport::CancelToken;

use crate::counters::{RateCounters, RateSample};

/// Scale-up threshold: producer outpacing the network.
const EFFICIENCY_HIGH: f64 = 1.0;
/// Scale-down threshold in efficiency mode.
const EFFICIENCY_LOW: f64 = 0.7;
/// Scale-down threshold in adaptive mode.
const ADAPTIVE_LOW: f64 = 0.5;
/// Windows a probe runs before it concludes.
const PROBE_WINDOWS: u32 = 3;
/// Windows to hold off after a scale-down or a failed probe.
const COOLDOWN_WINDOWS: u32 = 3;
/// Minimum aggregate gain for a probe to keep its stream.
const PROBE_GAIN: f64 = 1.05;
/// Dominance margin for the bottleneck tag.
const BOTTLENECK_MARGIN: Duration = Duration::from_millis(100);

/// Scaling strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScalerMode {
    /// Classical thresholds with hysteresis.
    #[default]
    Efficiency,
    /// Probe-and-measure experiments.
    Adaptive,
}

/// Auto-scaler parameters.
#[derive(Clone, Copy, Debug)]
pub struct ScalerConfig {
    /// Scaling strategy.
    pub mode: ScalerMode,
    /// Consecutive windows a condition must hold before acting.
    pub hysteresis: u32,
    /// Evaluation period.
    pub interval: Duration,
    /// When `false`, evaluation still runs and snapshots are still
    /// published, but no scaling action is ever taken.
    pub enabled: bool,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            mode: ScalerMode::Efficiency,
            hysteresis: 3,
            interval: Duration::from_secs(15),
            enabled: true,
        }
    }
}

/// What the scaler believes limits throughput right now.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Bottleneck {
    /// Producer-blocked time dominates: the network is the constraint.
    Network,
    /// Sender-idle time dominates: the producer is the constraint.
    Producer,
    /// Neither side dominates.
    #[default]
    Balanced,
}

/// Scaler state tag, reported over the control channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScalerState {
    /// No recent action.
    #[default]
    Steady,
    /// A stream was just added (or a probe succeeded).
    ScalingUp,
    /// A stream was just removed.
    ScalingDown,
    /// A probe experiment is running.
    Probing,
    /// Holding off after a scale-down or failed probe.
    Cooldown,
}

impl ScalerState {
    /// Wire byte for the `CASS` frame.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Steady => 0,
            Self::ScalingUp => 1,
            Self::ScalingDown => 2,
            Self::Probing => 3,
            Self::Cooldown => 4,
        }
    }
}

/// Thread-safe snapshot of the last evaluation, consumed by the control
/// channel's stats sender.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScaleSnapshot {
    /// Producer-to-drain efficiency of the last window.
    pub efficiency: f64,
    /// Producer rate in bytes per second.
    pub producer_bps: f64,
    /// Aggregate drain rate in bytes per second.
    pub drain_bps: f64,
    /// Active streams after the evaluation.
    pub active_streams: u8,
    /// Configured maximum.
    pub max_streams: u8,
    /// State tag after the evaluation.
    pub state: ScalerState,
    /// Whether a probe is in flight.
    pub probe_active: bool,
    /// Derived bottleneck tag.
    pub bottleneck: Bottleneck,
}

/// The surface the scaler drives; implemented by the parallel dispatcher.
pub trait ScaleTarget: Send + Sync {
    /// Streams currently accepting chunks.
    fn active_streams(&self) -> u8;
    /// Configured stream-slot count.
    fn max_streams(&self) -> u8;
    /// Activates the lowest inactive, non-dead stream. Returns `false`
    /// when there is nothing to activate or activation failed.
    fn activate_next(&self) -> bool;
    /// Deactivates the highest active stream, never going below one.
    fn deactivate_highest(&self) -> bool;
}

#[derive(Clone, Copy, Debug)]
enum Probe {
    Idle,
    Probing { baseline: f64, windows: u32 },
    Cooldown { windows: u32 },
}

struct EvalState {
    up: u32,
    down: u32,
    probe: Probe,
}

/// Periodic evaluator of producer/drain rates.
pub struct AutoScaler<T: ScaleTarget> {
    config: ScalerConfig,
    target: Arc<T>,
    counters: Arc<RateCounters>,
    state: Mutex<EvalState>,
    snapshot: Mutex<ScaleSnapshot>,
}

impl<T: ScaleTarget> AutoScaler<T> {
    /// Creates a scaler over `target`, sampling `counters`.
    #[must_use]
    pub fn new(config: ScalerConfig, target: Arc<T>, counters: Arc<RateCounters>) -> Self {
        Self {
            config,
            target,
            counters,
            state: Mutex::new(EvalState {
                up: 0,
                down: 0,
                probe: Probe::Idle,
            }),
            snapshot: Mutex::new(ScaleSnapshot::default()),
        }
    }

    /// Returns the last published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ScaleSnapshot {
        *lock(&self.snapshot)
    }

    /// Runs the evaluation loop until `cancel` fires.
    pub fn run(&self, cancel: &CancelToken) {
        let mut last = Instant::now();
        loop {
            if cancel.wait_timeout(self.config.interval) {
                return;
            }
            let now = Instant::now();
            let sample = self.counters.sample_and_reset(now - last);
            last = now;
            self.evaluate_window(sample);
        }
    }

    /// Evaluates one sampled window and possibly scales. Split from the
    /// timer loop so tests can drive windows directly.
    pub fn evaluate_window(&self, sample: RateSample) {
        let active = self.target.active_streams();
        let bottleneck = derive_bottleneck(&sample);

        // Efficiency is undefined with no drain or no streams; publish the
        // snapshot but take no action and leave hysteresis untouched.
        if sample.drain_bps <= 0.0 || active == 0 {
            self.publish(0.0, &sample, bottleneck, None);
            return;
        }
        let efficiency = sample.producer_bps / sample.drain_bps;

        if !self.config.enabled {
            self.publish(efficiency, &sample, bottleneck, None);
            return;
        }

        let state = match self.config.mode {
            ScalerMode::Efficiency => self.evaluate_efficiency(efficiency, active),
            ScalerMode::Adaptive => self.evaluate_adaptive(efficiency, &sample, active),
        };
        self.publish(efficiency, &sample, bottleneck, Some(state));
    }

    fn evaluate_efficiency(&self, efficiency: f64, active: u8) -> ScalerState {
        let mut state = lock(&self.state);
        if efficiency > EFFICIENCY_HIGH {
            state.up += 1;
            state.down = 0;
        } else if efficiency < EFFICIENCY_LOW {
            state.down += 1;
            state.up = 0;
        } else {
            state.up = 0;
            state.down = 0;
        }

        if state.up >= self.config.hysteresis {
            state.up = 0;
            if active < self.target.max_streams() && self.target.activate_next() {
                info!(active = active + 1, "scaled up");
                return ScalerState::ScalingUp;
            }
        } else if state.down >= self.config.hysteresis {
            state.down = 0;
            if active > 1 && self.target.deactivate_highest() {
                info!(active = active - 1, "scaled down");
                return ScalerState::ScalingDown;
            }
        }
        ScalerState::Steady
    }

    fn evaluate_adaptive(&self, efficiency: f64, sample: &RateSample, active: u8) -> ScalerState {
        let mut state = lock(&self.state);
        match state.probe {
            Probe::Cooldown { windows } => {
                state.probe = if windows <= 1 {
                    Probe::Idle
                } else {
                    Probe::Cooldown {
                        windows: windows - 1,
                    }
                };
                ScalerState::Cooldown
            }
            Probe::Probing { baseline, windows } => {
                let windows = windows + 1;
                if windows < PROBE_WINDOWS {
                    state.probe = Probe::Probing { baseline, windows };
                    return ScalerState::Probing;
                }
                let total = sample.producer_bps + sample.drain_bps;
                if total >= baseline * PROBE_GAIN {
                    debug!(total, baseline, "probe kept its stream");
                    state.probe = Probe::Idle;
                    ScalerState::ScalingUp
                } else {
                    debug!(total, baseline, "probe reverted");
                    self.target.deactivate_highest();
                    state.probe = Probe::Cooldown {
                        windows: COOLDOWN_WINDOWS,
                    };
                    ScalerState::Cooldown
                }
            }
            Probe::Idle => {
                if efficiency < ADAPTIVE_LOW {
                    state.down += 1;
                    state.up = 0;
                } else if efficiency > EFFICIENCY_HIGH {
                    state.up += 1;
                    state.down = 0;
                } else {
                    state.up = 0;
                    state.down = 0;
                }

                if state.down >= self.config.hysteresis {
                    state.down = 0;
                    if active > 1 {
                        self.target.deactivate_highest();
                    }
                    state.probe = Probe::Cooldown {
                        windows: COOLDOWN_WINDOWS,
                    };
                    return ScalerState::ScalingDown;
                }
                if state.up >= self.config.hysteresis && active < self.target.max_streams() {
                    state.up = 0;
                    let baseline = sample.producer_bps + sample.drain_bps;
                    if self.target.activate_next() {
                        info!(baseline, "probe started");
                        state.probe = Probe::Probing {
                            baseline,
                            windows: 0,
                        };
                        return ScalerState::Probing;
                    }
                }
                ScalerState::Steady
            }
        }
    }

    fn publish(
        &self,
        efficiency: f64,
        sample: &RateSample,
        bottleneck: Bottleneck,
        state: Option<ScalerState>,
    ) {
        let probe_active = matches!(lock(&self.state).probe, Probe::Probing { .. });
        let mut snapshot = lock(&self.snapshot);
        let previous_state = snapshot.state;
        *snapshot = ScaleSnapshot {
            efficiency,
            producer_bps: sample.producer_bps,
            drain_bps: sample.drain_bps,
            active_streams: self.target.active_streams(),
            max_streams: self.target.max_streams(),
            state: state.unwrap_or(previous_state),
            probe_active,
            bottleneck,
        };
    }
}

fn derive_bottleneck(sample: &RateSample) -> Bottleneck {
    if sample.producer_blocked > sample.sender_idle + BOTTLENECK_MARGIN {
        Bottleneck::Network
    } else if sample.sender_idle > sample.producer_blocked + BOTTLENECK_MARGIN {
        Bottleneck::Producer
    } else {
        Bottleneck::Balanced
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct MockTarget {
        active: AtomicU8,
        max: u8,
    }

    impl MockTarget {
        fn new(active: u8, max: u8) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicU8::new(active),
                max,
            })
        }
    }

    impl ScaleTarget for MockTarget {
        fn active_streams(&self) -> u8 {
            self.active.load(Ordering::SeqCst)
        }

        fn max_streams(&self) -> u8 {
            self.max
        }

        fn activate_next(&self) -> bool {
            let active = self.active.load(Ordering::SeqCst);
            if active < self.max {
                self.active.store(active + 1, Ordering::SeqCst);
                true
            } else {
                false
            }
        }

        fn deactivate_highest(&self) -> bool {
            let active = self.active.load(Ordering::SeqCst);
            if active > 1 {
                self.active.store(active - 1, Ordering::SeqCst);
                true
            } else {
                false
            }
        }
    }

    fn sample(producer: f64, drain: f64) -> RateSample {
        RateSample {
            producer_bps: producer,
            drain_bps: drain,
            producer_blocked: Duration::ZERO,
            sender_idle: Duration::ZERO,
        }
    }

    fn scaler(mode: ScalerMode, target: &Arc<MockTarget>) -> AutoScaler<MockTarget> {
        AutoScaler::new(
            ScalerConfig {
                mode,
                hysteresis: 3,
                interval: Duration::from_secs(15),
                enabled: true,
            },
            Arc::clone(target),
            Arc::new(RateCounters::new()),
        )
    }

    // ========================================================================
    // Efficiency mode
    // ========================================================================

    #[test]
    fn scale_up_needs_full_hysteresis() {
        let target = MockTarget::new(1, 4);
        let scaler = scaler(ScalerMode::Efficiency, &target);

        scaler.evaluate_window(sample(120.0, 100.0));
        scaler.evaluate_window(sample(120.0, 100.0));
        assert_eq!(target.active_streams(), 1, "two windows must not act");
        scaler.evaluate_window(sample(120.0, 100.0));
        assert_eq!(target.active_streams(), 2);
        assert_eq!(scaler.snapshot().state, ScalerState::ScalingUp);
    }

    #[test]
    fn single_out_of_band_window_never_acts() {
        let target = MockTarget::new(2, 4);
        let scaler = scaler(ScalerMode::Efficiency, &target);

        scaler.evaluate_window(sample(120.0, 100.0));
        scaler.evaluate_window(sample(90.0, 100.0)); // back in band; resets
        scaler.evaluate_window(sample(120.0, 100.0));
        scaler.evaluate_window(sample(120.0, 100.0));
        assert_eq!(target.active_streams(), 2);
    }

    #[test]
    fn scale_down_at_low_efficiency() {
        let target = MockTarget::new(3, 4);
        let scaler = scaler(ScalerMode::Efficiency, &target);
        for _ in 0..3 {
            scaler.evaluate_window(sample(50.0, 100.0));
        }
        assert_eq!(target.active_streams(), 2);
        assert_eq!(scaler.snapshot().state, ScalerState::ScalingDown);
    }

    #[test]
    fn never_scales_below_one_stream() {
        let target = MockTarget::new(1, 4);
        let scaler = scaler(ScalerMode::Efficiency, &target);
        for _ in 0..10 {
            scaler.evaluate_window(sample(10.0, 100.0));
        }
        assert_eq!(target.active_streams(), 1);
    }

    #[test]
    fn never_scales_above_max() {
        let target = MockTarget::new(2, 2);
        let scaler = scaler(ScalerMode::Efficiency, &target);
        for _ in 0..10 {
            scaler.evaluate_window(sample(200.0, 100.0));
        }
        assert_eq!(target.active_streams(), 2);
    }

    #[test]
    fn undefined_efficiency_takes_no_action() {
        let target = MockTarget::new(2, 4);
        let scaler = scaler(ScalerMode::Efficiency, &target);
        for _ in 0..5 {
            scaler.evaluate_window(sample(100.0, 0.0));
        }
        assert_eq!(target.active_streams(), 2);
        assert_eq!(scaler.snapshot().efficiency, 0.0);
    }

    #[test]
    fn disabled_scaler_still_publishes_snapshots() {
        let target = MockTarget::new(1, 4);
        let scaler = AutoScaler::new(
            ScalerConfig {
                mode: ScalerMode::Efficiency,
                hysteresis: 3,
                interval: Duration::from_secs(15),
                enabled: false,
            },
            Arc::clone(&target),
            Arc::new(RateCounters::new()),
        );
        for _ in 0..5 {
            scaler.evaluate_window(sample(200.0, 100.0));
        }
        assert_eq!(target.active_streams(), 1);
        let snapshot = scaler.snapshot();
        assert!((snapshot.efficiency - 2.0).abs() < 1e-9);
    }

    // ========================================================================
    // Adaptive mode
    // ========================================================================

    #[test]
    fn successful_probe_keeps_the_stream() {
        let target = MockTarget::new(1, 4);
        let scaler = scaler(ScalerMode::Adaptive, &target);

        // Three high-efficiency windows begin a probe with baseline 100.
        for _ in 0..3 {
            scaler.evaluate_window(sample(60.0, 40.0));
        }
        assert_eq!(target.active_streams(), 2);
        assert!(scaler.snapshot().probe_active);
        assert_eq!(scaler.snapshot().state, ScalerState::Probing);

        // Probe runs its three windows; the third observes total 110.
        scaler.evaluate_window(sample(60.0, 45.0));
        scaler.evaluate_window(sample(60.0, 45.0));
        scaler.evaluate_window(sample(62.0, 48.0));

        let snapshot = scaler.snapshot();
        assert_eq!(target.active_streams(), 2, "probe stream kept");
        assert_eq!(snapshot.state, ScalerState::ScalingUp);
        assert!(!snapshot.probe_active);
    }

    #[test]
    fn failed_probe_is_reverted_with_cooldown() {
        let target = MockTarget::new(1, 4);
        let scaler = scaler(ScalerMode::Adaptive, &target);

        for _ in 0..3 {
            scaler.evaluate_window(sample(60.0, 40.0)); // baseline 100
        }
        assert_eq!(target.active_streams(), 2);

        // No gain at all across the probe windows.
        scaler.evaluate_window(sample(60.0, 40.0));
        scaler.evaluate_window(sample(60.0, 40.0));
        scaler.evaluate_window(sample(60.0, 41.0)); // 101 < 105

        assert_eq!(target.active_streams(), 1, "failed probe reverted");
        assert_eq!(scaler.snapshot().state, ScalerState::Cooldown);

        // Cooldown suppresses new probes for three windows.
        for _ in 0..COOLDOWN_WINDOWS {
            scaler.evaluate_window(sample(60.0, 40.0));
            assert_eq!(scaler.snapshot().state, ScalerState::Cooldown);
        }
        assert_eq!(target.active_streams(), 1);
    }

    #[test]
    fn short_probe_never_concludes() {
        let target = MockTarget::new(1, 4);
        let scaler = scaler(ScalerMode::Adaptive, &target);
        for _ in 0..3 {
            scaler.evaluate_window(sample(60.0, 40.0));
        }
        // Only two probe windows: no conclusion either way.
        scaler.evaluate_window(sample(0.0, 1.0));
        scaler.evaluate_window(sample(0.0, 1.0));
        assert!(scaler.snapshot().probe_active);
        assert_eq!(target.active_streams(), 2);
    }

    #[test]
    fn adaptive_low_efficiency_scales_down_into_cooldown() {
        let target = MockTarget::new(3, 4);
        let scaler = scaler(ScalerMode::Adaptive, &target);
        for _ in 0..3 {
            scaler.evaluate_window(sample(30.0, 100.0));
        }
        assert_eq!(target.active_streams(), 2);
        assert_eq!(scaler.snapshot().state, ScalerState::ScalingDown);
        scaler.evaluate_window(sample(30.0, 100.0));
        assert_eq!(scaler.snapshot().state, ScalerState::Cooldown);
    }

    // ========================================================================
    // Bottleneck tagging
    // ========================================================================

    #[test]
    fn bottleneck_tags_follow_dominant_wait() {
        let blocked = RateSample {
            producer_blocked: Duration::from_millis(300),
            sender_idle: Duration::from_millis(50),
            ..sample(1.0, 1.0)
        };
        assert_eq!(derive_bottleneck(&blocked), Bottleneck::Network);

        let idle = RateSample {
            producer_blocked: Duration::from_millis(10),
            sender_idle: Duration::from_millis(200),
            ..sample(1.0, 1.0)
        };
        assert_eq!(derive_bottleneck(&idle), Bottleneck::Producer);

        let balanced = RateSample {
            producer_blocked: Duration::from_millis(80),
            sender_idle: Duration::from_millis(50),
            ..sample(1.0, 1.0)
        };
        assert_eq!(derive_bottleneck(&balanced), Bottleneck::Balanced);
    }
}
