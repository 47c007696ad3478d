//! Frame pacing and presentation-time synchronization.
//!
//! The redraw loop is gated by one-shot frame callbacks: after a submission
//! we arm exactly one callback and wait for it with a deadline derived from
//! the best vblank estimate available. When the compositor supports
//! `wp_presentation`, per-frame feedback supplies a monotonic timestamp and
//! sequence counter which drive an OML-style sync clock.

use smithay_client_toolkit::reexports::client::{Connection, Dispatch, QueueHandle};
use smithay_client_toolkit::reexports::protocols::wp::presentation_time::client::{
    wp_presentation, wp_presentation_feedback,
};
use smithay_client_toolkit::shell::WaylandSurface;
use tracing::{debug, trace};

use playercore::VsyncInfo;

use crate::state::State;

const CLOCK_MONOTONIC: u32 = 1;
const CLOCK_MONOTONIC_RAW: u32 = 4;

/// Rolling sync state fed by presentation feedback.
///
/// The feedback timestamp is the `ust` and the sequence counter the `msc` of
/// classic OML sync-control pacing; every feedback event means a buffer swap
/// has already happened.
#[derive(Debug, Default)]
pub struct PresentClock {
    last_ust: i64,
    last_msc: i64,
    vsync_duration: i64,
    last_skipped_vsyncs: i64,
    last_queue_display_time: i64,
}

impl PresentClock {
    /// Folds one feedback sample into the clock.
    pub fn update_sync_values(&mut self, ust: i64, msc: i64) {
        if self.last_ust > 0 && msc > self.last_msc {
            self.vsync_duration = (ust - self.last_ust) / (msc - self.last_msc);
            self.last_skipped_vsyncs = (msc - self.last_msc - 1).max(0);
        }
        self.last_ust = ust;
        self.last_msc = msc;
    }

    /// Records a swap; estimates when the queued frame will display.
    pub fn swap(&mut self) {
        self.last_queue_display_time = self.last_ust + self.vsync_duration;
    }

    pub fn vsync_duration(&self) -> i64 {
        self.vsync_duration
    }

    pub fn info(&self) -> VsyncInfo {
        VsyncInfo {
            vsync_duration: self.vsync_duration,
            skipped_vsyncs: self.last_skipped_vsyncs,
            last_queue_display_time: self.last_queue_display_time,
        }
    }
}

/// Frame-callback bookkeeping for the redraw loop.
#[derive(Debug, Default)]
pub struct FrameClock {
    /// Presentation protocol bound and its clock is monotonic.
    pub use_present: bool,
    /// Refresh interval reported with feedback, microseconds.
    pub refresh_interval: i64,
    /// A submission is waiting for its frame callback.
    pub frame_wait: bool,
    /// A frame callback is outstanding; never arm a second one.
    pub callback_armed: bool,
    /// The compositor stopped delivering callbacks; skip redraws.
    pub hidden: bool,
    timeout_count: u32,
}

impl FrameClock {
    /// Deadline for one frame wait, microseconds, in preference order:
    /// measured vsync, compositor refresh interval, output nominal rate,
    /// 60 Hz. Padded by 5%.
    pub fn vblank_interval(&self, clock: &PresentClock, output_refresh_hz: f64) -> i64 {
        let mut vblank = 0;
        if self.use_present {
            vblank = clock.vsync_duration();
        }
        if vblank <= 0 && self.refresh_interval > 0 {
            vblank = self.refresh_interval;
        }
        if vblank <= 0 && output_refresh_hz > 0.0 {
            vblank = (1e6 / output_refresh_hz) as i64;
        }
        // Ideally never reached.
        if vblank <= 0 {
            vblank = 1_000_000 / 60;
        }
        vblank + vblank / 20
    }

    /// One deadline elapsed without a callback. A single miss is tolerated;
    /// the second consecutive miss marks the surface hidden.
    pub fn note_timeout(&mut self) {
        if self.timeout_count >= 1 {
            self.hidden = true;
        } else {
            self.timeout_count += 1;
        }
    }

    /// The callback arrived within the deadline.
    pub fn note_on_time(&mut self) {
        self.timeout_count = 0;
    }
}

impl State {
    /// Arms the per-frame callback unless one is already outstanding.
    pub(crate) fn arm_frame_callback(&mut self) {
        if self.pacer.callback_armed {
            return;
        }
        let surface = self.window.xdg.wl_surface();
        surface.frame(&self.qh, surface.clone());
        self.pacer.callback_armed = true;
    }

    /// Runs when the compositor signals the current frame slot is done.
    pub(crate) fn on_frame_callback(&mut self) {
        self.pacer.callback_armed = false;
        self.arm_frame_callback();

        if let Some(presentation) = &self.protocols.presentation {
            presentation.feedback(self.window.xdg.wl_surface(), &self.qh, ());
        }

        self.pacer.frame_wait = false;
        self.pacer.hidden = false;
    }
}

impl Dispatch<wp_presentation::WpPresentation, ()> for State {
    fn event(
        state: &mut State,
        _presentation: &wp_presentation::WpPresentation,
        event: wp_presentation::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        if let wp_presentation::Event::ClockId { clk_id } = event {
            if clk_id == CLOCK_MONOTONIC || clk_id == CLOCK_MONOTONIC_RAW {
                state.pacer.use_present = true;
            } else {
                debug!(clk_id, "presentation clock is not monotonic; ignoring feedback");
            }
        }
    }
}

impl Dispatch<wp_presentation_feedback::WpPresentationFeedback, ()> for State {
    fn event(
        state: &mut State,
        _feedback: &wp_presentation_feedback::WpPresentationFeedback,
        event: wp_presentation_feedback::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        match event {
            wp_presentation_feedback::Event::Presented {
                tv_sec_hi,
                tv_sec_lo,
                tv_nsec,
                refresh,
                seq_hi,
                seq_lo,
                ..
            } => {
                if !state.pacer.use_present {
                    return;
                }
                state.pacer.refresh_interval = refresh as i64 / 1000;

                let sec = (tv_sec_lo as u64) | ((tv_sec_hi as u64) << 32);
                let ust = sec as i64 * 1_000_000 + tv_nsec as i64 / 1000;
                let msc = ((seq_lo as u64) | ((seq_hi as u64) << 32)) as i64;
                state.clock.update_sync_values(ust, msc);
                trace!(ust, msc, "presentation feedback");
            }
            wp_presentation_feedback::Event::Discarded => {
                trace!("presentation feedback discarded");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_duration_from_consecutive_samples() {
        let mut clock = PresentClock::default();
        clock.update_sync_values(1_000_000, 100);
        assert_eq!(clock.vsync_duration(), 0);
        clock.update_sync_values(1_016_666, 101);
        assert_eq!(clock.vsync_duration(), 16_666);
        // Two vsyncs between samples average out.
        clock.update_sync_values(1_049_998, 103);
        assert_eq!(clock.vsync_duration(), 16_666);
        assert_eq!(clock.info().skipped_vsyncs, 1);
    }

    #[test]
    fn swap_estimates_display_time() {
        let mut clock = PresentClock::default();
        clock.update_sync_values(1_000_000, 1);
        clock.update_sync_values(1_016_666, 2);
        clock.swap();
        assert_eq!(clock.info().last_queue_display_time, 1_016_666 + 16_666);
    }

    #[test]
    fn vblank_source_priority() {
        let mut clock = PresentClock::default();
        clock.update_sync_values(0, 1);
        clock.update_sync_values(10_000, 2);

        let mut pacer = FrameClock {
            use_present: true,
            refresh_interval: 20_000,
            ..Default::default()
        };
        // Measured vsync wins, padded by 5%.
        assert_eq!(pacer.vblank_interval(&clock, 50.0), 10_000 + 500);

        pacer.use_present = false;
        assert_eq!(pacer.vblank_interval(&clock, 50.0), 20_000 + 1_000);

        pacer.refresh_interval = 0;
        assert_eq!(pacer.vblank_interval(&clock, 50.0), 20_000 + 1_000);

        let hz_free = pacer.vblank_interval(&clock, 0.0);
        assert_eq!(hz_free, 16_666 + 16_666 / 20);
    }

    #[test]
    fn two_consecutive_misses_hide_the_surface() {
        let mut pacer = FrameClock::default();
        pacer.note_timeout();
        assert!(!pacer.hidden);
        pacer.note_timeout();
        assert!(pacer.hidden);
        // A third miss changes nothing further.
        pacer.note_timeout();
        assert!(pacer.hidden);
        // A callback clears the counter; one later miss is tolerated again.
        pacer.note_on_time();
        pacer.hidden = false;
        pacer.note_timeout();
        assert!(!pacer.hidden);
    }
}
