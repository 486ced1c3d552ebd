//! Output cadence control for the render pump.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Frames kept for the running fps estimate (one second at 25fps).
const FPS_WINDOW: usize = 25;

/// Paces frame emission to a target rate and measures the rate achieved.
#[derive(Debug)]
pub struct FrameRateController {
    target_fps: f64,
    interval: Duration,
    last_frame: Option<Instant>,
    history: VecDeque<Instant>,
}

impl FrameRateController {
    pub fn new(target_fps: f64) -> Self {
        let target_fps = if target_fps > 0.0 { target_fps } else { 25.0 };
        Self {
            target_fps,
            interval: Duration::from_secs_f64(1.0 / target_fps),
            last_frame: None,
            history: VecDeque::with_capacity(FPS_WINDOW + 1),
        }
    }

    /// How long to wait before the next frame is due. Zero when late.
    pub fn time_until_next_frame(&self) -> Duration {
        match self.last_frame {
            Some(last) => (last + self.interval).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Record that a frame slot was used, whether or not anything was sent.
    pub fn update(&mut self) {
        let now = Instant::now();
        self.last_frame = Some(now);
        self.history.push_back(now);
        while self.history.len() > FPS_WINDOW {
            self.history.pop_front();
        }
    }

    /// Frames per second over the recent window; the target until there is data.
    pub fn average_fps(&self) -> f64 {
        match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) if self.history.len() >= 2 => {
                let elapsed = last.duration_since(*first).as_secs_f64();
                if elapsed > 0.0 {
                    (self.history.len() - 1) as f64 / elapsed
                } else {
                    self.target_fps
                }
            }
            _ => self.target_fps,
        }
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    #[cfg(test)]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_frame_is_immediate() {
        let pacer = FrameRateController::new(25.0);
        assert_eq!(pacer.time_until_next_frame(), Duration::ZERO);
        assert!((pacer.average_fps() - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_one_interval_after_update() {
        let mut pacer = FrameRateController::new(25.0);
        pacer.update();
        assert_eq!(pacer.time_until_next_frame(), Duration::from_millis(40));

        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(pacer.time_until_next_frame(), Duration::from_millis(25));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(pacer.time_until_next_frame(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_tracks_actual_cadence() {
        let mut pacer = FrameRateController::new(25.0);
        for _ in 0..10 {
            pacer.update();
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        // Slower than target: 20fps
        assert!((pacer.average_fps() - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_invalid_target_falls_back() {
        let pacer = FrameRateController::new(0.0);
        assert_eq!(pacer.target_fps(), 25.0);
        assert_eq!(pacer.interval(), Duration::from_millis(40));
    }
}
