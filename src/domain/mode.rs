//! Per-call pipeline mode.
//!
//! The rectifier and the global-context fusion can be switched between forward
//! calls. Rather than flipping flags on the network, callers pass a
//! [`PipelineMode`] to every forward call. [`RectifierSchedule`] captures the
//! usual one-way transition: train with the rectifier disabled until the
//! backbone has converged, then enable it for good.

use serde::{Deserialize, Serialize};

/// Whether the spatial rectifier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RectifierState {
    #[default]
    Disabled,
    Enabled,
}

/// Stage toggles consulted on every forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMode {
    pub rectifier: RectifierState,
    pub global_context: bool,
}

impl PipelineMode {
    /// Every stage enabled; the mode for trained weights.
    pub fn inference() -> Self {
        Self {
            rectifier: RectifierState::Enabled,
            global_context: true,
        }
    }

    /// Rectifier disabled, fusion enabled; the mode at the start of training.
    pub fn warmup() -> Self {
        Self {
            rectifier: RectifierState::Disabled,
            global_context: true,
        }
    }

    pub fn with_rectifier(mut self, state: RectifierState) -> Self {
        self.rectifier = state;
        self
    }

    pub fn with_global_context(mut self, enabled: bool) -> Self {
        self.global_context = enabled;
        self
    }

    pub fn rectifier_enabled(&self) -> bool {
        self.rectifier == RectifierState::Enabled
    }
}

impl Default for PipelineMode {
    fn default() -> Self {
        Self::inference()
    }
}

/// Enables the rectifier once training passes a milestone epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectifierSchedule {
    /// The rectifier is enabled for epochs strictly after this one.
    pub enable_after_epoch: usize,
}

impl RectifierSchedule {
    pub fn new(enable_after_epoch: usize) -> Self {
        Self { enable_after_epoch }
    }

    /// Returns the mode to use for `epoch`.
    ///
    /// The transition is one-way: an enabled rectifier is never disabled again.
    pub fn advance(&self, mode: PipelineMode, epoch: usize) -> PipelineMode {
        if !mode.rectifier_enabled() && epoch > self.enable_after_epoch {
            tracing::info!(epoch, "spatial rectifier enabled");
            return mode.with_rectifier(RectifierState::Enabled);
        }
        mode
    }
}

impl Default for RectifierSchedule {
    fn default() -> Self {
        Self::new(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_enables_after_milestone() {
        let schedule = RectifierSchedule::new(3);
        let mut mode = PipelineMode::warmup();
        for epoch in 1..=3 {
            mode = schedule.advance(mode, epoch);
            assert!(!mode.rectifier_enabled(), "epoch {epoch}");
        }
        mode = schedule.advance(mode, 4);
        assert!(mode.rectifier_enabled());
        assert!(mode.global_context);
    }

    #[test]
    fn schedule_never_disables() {
        let schedule = RectifierSchedule::new(10);
        let mode = schedule.advance(PipelineMode::inference(), 1);
        assert_eq!(mode, PipelineMode::inference());
    }

    #[test]
    fn builders_toggle_stages() {
        let mode = PipelineMode::inference()
            .with_rectifier(RectifierState::Disabled)
            .with_global_context(false);
        assert!(!mode.rectifier_enabled());
        assert!(!mode.global_context);
    }
}
