//! Admission control over the background build budget.
//!
//! Builds run in one of two modes. Slow-mode builds (small parts, parts with
//! legacy row-id maps) get their own budget so they never starve fast-mode
//! builds of large parts.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SettingsHandle;

/// Budget class of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Slow,
    Fast,
}

impl BuildMode {
    pub fn from_slow_flag(slow: bool) -> Self {
        if slow { BuildMode::Slow } else { BuildMode::Fast }
    }

    pub fn is_slow(&self) -> bool {
        matches!(self, BuildMode::Slow)
    }

    fn slot(&self) -> usize {
        match self {
            BuildMode::Slow => 0,
            BuildMode::Fast => 1,
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Slow => write!(f, "slow"),
            BuildMode::Fast => write!(f, "fast"),
        }
    }
}

/// Pure capacity check against the configured budgets. Budgets are read on
/// every call.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    settings: SettingsHandle,
}

impl AdmissionController {
    pub fn new(settings: SettingsHandle) -> Self {
        AdmissionController { settings }
    }

    pub fn budget(&self, mode: BuildMode) -> usize {
        let settings = self.settings.load();
        match mode {
            BuildMode::Slow => settings.slow_mode_budget,
            BuildMode::Fast => settings.fast_mode_budget,
        }
    }

    /// Whether one more build of `mode` may start while `in_flight` builds of
    /// that mode are queued or running.
    pub fn allowed(&self, mode: BuildMode, in_flight: usize) -> bool {
        in_flight < self.budget(mode)
    }
}

/// In-flight build counters per mode.
#[derive(Debug, Clone, Default)]
pub struct BuildSlots {
    counts: Arc<Mutex<[usize; 2]>>,
}

impl BuildSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot of `mode` if the controller admits one more build.
    pub fn try_admit(&self, controller: &AdmissionController, mode: BuildMode) -> Option<BuildSlot> {
        let mut counts = self.counts.lock();
        if !controller.allowed(mode, counts[mode.slot()]) {
            return None;
        }
        counts[mode.slot()] += 1;
        Some(BuildSlot {
            counts: self.counts.clone(),
            mode,
        })
    }

    pub fn in_flight(&self, mode: BuildMode) -> usize {
        self.counts.lock()[mode.slot()]
    }
}

/// A taken slot; released on drop.
#[derive(Debug)]
pub struct BuildSlot {
    counts: Arc<Mutex<[usize; 2]>>,
    mode: BuildMode,
}

impl BuildSlot {
    pub fn mode(&self) -> BuildMode {
        self.mode
    }
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        self.counts.lock()[self.mode.slot()] -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuilderSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn controller(slow: usize, fast: usize) -> AdmissionController {
        AdmissionController::new(SettingsHandle::new(BuilderSettings {
            slow_mode_budget: slow,
            fast_mode_budget: fast,
            ..Default::default()
        }))
    }

    #[test]
    fn test_allowed() {
        let controller = controller(1, 3);
        assert!(controller.allowed(BuildMode::Slow, 0));
        assert!(!controller.allowed(BuildMode::Slow, 1));
        assert!(controller.allowed(BuildMode::Fast, 2));
        assert!(!controller.allowed(BuildMode::Fast, 3));
    }

    #[test]
    fn test_budget_is_read_at_call_time() {
        let settings = SettingsHandle::default();
        let controller = AdmissionController::new(settings.clone());
        settings
            .update(BuilderSettings {
                slow_mode_budget: 0,
                ..Default::default()
            })
            .unwrap();
        assert!(!controller.allowed(BuildMode::Slow, 0));
    }

    #[test]
    fn test_slots_never_exceed_budget() {
        let controller = controller(2, 4);
        let slots = BuildSlots::new();
        let peak = [AtomicUsize::new(0), AtomicUsize::new(0)];
        let live = [AtomicUsize::new(0), AtomicUsize::new(0)];

        thread::scope(|s| {
            for t in 0..8 {
                let (controller, slots, peak, live) = (&controller, &slots, &peak, &live);
                s.spawn(move || {
                    let mode = BuildMode::from_slow_flag(t % 2 == 0);
                    for _ in 0..200 {
                        if let Some(slot) = slots.try_admit(controller, mode) {
                            let now = live[mode.slot()].fetch_add(1, Ordering::SeqCst) + 1;
                            peak[mode.slot()].fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            live[mode.slot()].fetch_sub(1, Ordering::SeqCst);
                            drop(slot);
                        }
                    }
                });
            }
        });

        assert!(peak[BuildMode::Slow.slot()].load(Ordering::SeqCst) <= 2);
        assert!(peak[BuildMode::Fast.slot()].load(Ordering::SeqCst) <= 4);
        assert_eq!(slots.in_flight(BuildMode::Slow), 0);
        assert_eq!(slots.in_flight(BuildMode::Fast), 0);
    }
}
