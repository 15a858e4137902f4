// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Adaptive-bitrate controller.
//!
//! One closed loop per (source, client): the client reports how full its
//! playback buffer is, the controller walks the encoding quality up or down
//! one step at a time, never faster than one adjustment per interval.

use core::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct AbrConfig {
    pub q_min: u8,
    pub q_max: u8,
    pub q_start: u8,
    /// Below this buffer fill ratio, quality steps down
    pub low_threshold: f64,
    /// Above this buffer fill ratio, quality steps up
    pub high_threshold: f64,
    pub step: u8,
    /// Minimum spacing between adjustments
    pub min_interval: Duration,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            q_min: 40,
            q_max: 90,
            q_start: 70,
            low_threshold: 0.10,
            high_threshold: 0.30,
            step: 5,
            min_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct QualityController {
    config: AbrConfig,
    quality: u8,
    last_adjusted: Option<Instant>,
    last_buffer_level: Option<f64>,
}

impl QualityController {
    pub fn new(config: AbrConfig) -> Self {
        Self {
            quality: config.q_start.clamp(config.q_min, config.q_max),
            config,
            last_adjusted: None,
            last_buffer_level: None,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn last_buffer_level(&self) -> Option<f64> {
        self.last_buffer_level
    }

    /// Applies one feedback sample; returns the new quality if it changed
    pub fn on_feedback(&mut self, buffer_level: f64, now: Instant) -> Option<u8> {
        self.last_buffer_level = Some(buffer_level);

        if let Some(last) = self.last_adjusted {
            if now.duration_since(last) < self.config.min_interval {
                return None;
            }
        }

        let next = if buffer_level < self.config.low_threshold {
            self.quality
                .saturating_sub(self.config.step)
                .max(self.config.q_min)
        } else if buffer_level > self.config.high_threshold {
            self.quality
                .saturating_add(self.config.step)
                .min(self.config.q_max)
        } else {
            self.quality
        };

        if next == self.quality {
            return None;
        }

        self.quality = next;
        self.last_adjusted = Some(now);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> QualityController {
        QualityController::new(AbrConfig::default())
    }

    #[test]
    fn holds_without_feedback() {
        assert_eq!(controller().quality(), 70);
    }

    #[test]
    fn consecutive_low_feedback_walks_down_to_the_floor() {
        let mut controller = controller();
        let mut now = Instant::now();
        let mut qualities = Vec::new();

        for _ in 0..10 {
            if let Some(quality) = controller.on_feedback(0.02, now) {
                qualities.push(quality);
            }
            now += Duration::from_secs(1);
        }

        assert_eq!(qualities, vec![65, 60, 55, 50, 45, 40]);
        assert_eq!(controller.quality(), 40);
    }

    #[test]
    fn consecutive_high_feedback_walks_up_to_the_cap() {
        let mut controller = controller();
        let mut now = Instant::now();

        for _ in 0..10 {
            controller.on_feedback(0.9, now);
            now += Duration::from_secs(1);
        }

        assert_eq!(controller.quality(), 90);
    }

    #[test]
    fn midband_feedback_holds() {
        let mut controller = controller();
        let mut now = Instant::now();

        for _ in 0..5 {
            assert_eq!(controller.on_feedback(0.2, now), None);
            now += Duration::from_secs(1);
        }
        assert_eq!(controller.quality(), 70);
    }

    #[test]
    fn adjustments_are_rate_limited() {
        let mut controller = controller();
        let now = Instant::now();

        assert_eq!(controller.on_feedback(0.02, now), Some(65));
        // a burst of feedback inside the interval changes nothing
        assert_eq!(controller.on_feedback(0.02, now + Duration::from_millis(100)), None);
        assert_eq!(controller.on_feedback(0.02, now + Duration::from_millis(900)), None);
        // the next interval boundary allows the next step
        assert_eq!(controller.on_feedback(0.02, now + Duration::from_secs(1)), Some(60));
    }

    #[test]
    fn direction_can_reverse() {
        let mut controller = controller();
        let now = Instant::now();

        assert_eq!(controller.on_feedback(0.02, now), Some(65));
        assert_eq!(
            controller.on_feedback(0.9, now + Duration::from_secs(1)),
            Some(70)
        );
    }
}
