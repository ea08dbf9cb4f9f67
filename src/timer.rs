//! Drift-free wall-clock scheduler.
//!
//! A [`PrecisionTimer`] fires at a target millisecond offset within a
//! minute (or multi-minute) cycle, or at an absolute time of day. The next
//! delay is recomputed from the current clock reading after every firing
//! instead of repeating a fixed period, which bounds timing error to the
//! scheduling tolerance no matter how long callbacks take.
//!
//! Consumers run the returned tick receiver inside their own task; the
//! handle aborts the timer task on drop so nothing fires against a
//! torn-down canvas.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, Timelike};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// What the timer aims at.
#[derive(Debug, Clone, Copy)]
pub enum TimerTarget {
    /// Millisecond offset within a wall-clock cycle. A target above 59999
    /// implies a multi-minute cycle: `target / 60000` minutes with a
    /// `target % 60000` offset inside the firing minute.
    Cyclic { target_ms: u32 },
    /// Absolute time of day, firing once per day.
    Daily(NaiveTime),
}

/// Wall-clock-aligned timer specification.
#[derive(Debug, Clone, Copy)]
pub struct PrecisionTimer {
    pub target: TimerTarget,
    pub tolerance_ms: u32,
}

impl PrecisionTimer {
    pub fn cyclic(target_ms: u32, tolerance_ms: u32) -> Self {
        Self {
            target: TimerTarget::Cyclic { target_ms },
            tolerance_ms,
        }
    }

    pub fn daily(at: NaiveTime, tolerance_ms: u32) -> Self {
        Self {
            target: TimerTarget::Daily(at),
            tolerance_ms,
        }
    }

    /// Milliseconds until the next firing, computed from `now`.
    ///
    /// A delay at or below the tolerance gets a full cycle added so a
    /// firing that lands right at a boundary cannot fire twice in quick
    /// succession.
    pub fn next_delay_ms(&self, now: NaiveDateTime) -> i64 {
        match self.target {
            TimerTarget::Cyclic { target_ms } => {
                let (target_minute, target_in_minute) = if target_ms > 59_999 {
                    ((target_ms / 60_000) as i64, (target_ms % 60_000) as i64)
                } else {
                    (0, target_ms as i64)
                };

                let now_in_minute =
                    now.second() as i64 * 1000 + (now.and_utc().timestamp_subsec_millis()) as i64;
                let mut next = target_in_minute - now_in_minute;
                if next <= self.tolerance_ms as i64 {
                    next += MINUTE_MS;
                }

                if target_minute > 0 {
                    let due = now + ChronoDuration::milliseconds(next);
                    next += (target_minute - (due.minute() as i64 % target_minute)) * MINUTE_MS;
                }
                next
            }
            TimerTarget::Daily(at) => {
                let mut next = (at - now.time()).num_milliseconds();
                if next <= self.tolerance_ms as i64 {
                    next += DAY_MS;
                }
                next
            }
        }
    }

    /// Arm the timer. Ticks arrive on the returned receiver; the handle
    /// can override the next firing delay or cancel the timer outright.
    pub fn spawn(self) -> (TimerHandle, mpsc::Receiver<()>) {
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let (override_tx, mut override_rx) = mpsc::unbounded_channel::<Duration>();

        let task = tokio::spawn(async move {
            let mut pending: Option<Duration> = None;
            loop {
                let delay = pending.take().unwrap_or_else(|| {
                    let ms = self.next_delay_ms(Local::now().naive_local()).max(1);
                    Duration::from_millis(ms as u64)
                });
                debug!(?delay, "timer armed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if tick_tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    ovr = override_rx.recv() => {
                        match ovr {
                            Some(d) => pending = Some(d),
                            // Handle gone; the abort is already on its way.
                            None => return,
                        }
                    }
                }
            }
        });

        (
            TimerHandle {
                override_tx,
                task,
            },
            tick_rx,
        )
    }
}

/// Owner handle for a running timer task.
pub struct TimerHandle {
    override_tx: mpsc::UnboundedSender<Duration>,
    task: tokio::task::JoinHandle<()>,
}

impl TimerHandle {
    /// Replace the next firing with one `delay` from now. The firing after
    /// that reverts to the computed wall-clock schedule.
    pub fn fire_in(&self, delay: Duration) {
        let _ = self.override_tx.send(delay);
    }

    /// Stop the timer permanently.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_milli_opt(h, m, s, ms)
            .unwrap()
    }

    #[test]
    fn cyclic_targets_offset_within_minute() {
        let timer = PrecisionTimer::cyclic(55_000, 5_000);
        // At :10.000 the 55s mark is 45s away.
        assert_eq!(timer.next_delay_ms(at(12, 0, 10, 0)), 45_000);
    }

    #[test]
    fn cyclic_skips_boundary_inside_tolerance() {
        let timer = PrecisionTimer::cyclic(55_000, 5_000);
        // At :52 the 55s mark is only 3s away, inside tolerance: skip a minute.
        assert_eq!(timer.next_delay_ms(at(12, 0, 52, 0)), 63_000);
    }

    #[test]
    fn cyclic_multi_minute_aligns_to_cycle() {
        let timer = PrecisionTimer::cyclic(300_000, 5_000);
        let delay = timer.next_delay_ms(at(12, 2, 30, 0));
        let due = at(12, 2, 30, 0) + ChronoDuration::milliseconds(delay);
        assert_eq!(due.minute() % 5, 0);
        assert_eq!(due.second(), 0);
        assert!(delay > 0);
    }

    #[test]
    fn daily_rolls_over_when_past_target() {
        let target = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        let timer = PrecisionTimer::daily(target, 180_000);
        // 15:00 -> 3:00 next day is 12h away.
        assert_eq!(timer.next_delay_ms(at(15, 0, 0, 0)), 12 * 60 * 60_000);
        // 2:00 -> 3:00 same day.
        assert_eq!(timer.next_delay_ms(at(2, 0, 0, 0)), 60 * 60_000);
    }

    #[test]
    fn cyclic_firings_never_accumulate_drift() {
        let timer = PrecisionTimer::cyclic(55_000, 5_000);
        let mut now = at(0, 0, 7, 123);
        // Cheap deterministic pseudo-random callback latency (0..4s).
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..1000 {
            let delay = timer.next_delay_ms(now);
            let fired = now + ChronoDuration::milliseconds(delay);
            // Each firing lands exactly on the 55s mark of some minute.
            let offset = fired.second() as i64 * 1000
                + fired.and_utc().timestamp_subsec_millis() as i64;
            assert_eq!(offset, 55_000, "fired at {fired}");
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let latency = (seed >> 33) % 4_000;
            now = fired + ChronoDuration::milliseconds(latency as i64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn override_replaces_next_firing_only() {
        let (handle, mut ticks) = PrecisionTimer::cyclic(55_000, 5_000).spawn();
        handle.fire_in(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(1), ticks.recv())
            .await
            .expect("override firing should arrive quickly")
            .expect("timer alive");
        drop(handle);
    }
}
