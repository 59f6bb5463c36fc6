//! Power readings on Linux: battery state from sysfs, or pushed by an embedding host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::power::LOW_BATTERY_LEVEL;
use lanlink_core::{PowerMode, PowerState, PowerStateProvider};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

#[derive(Debug, Clone, Copy, PartialEq)]
struct BatteryReading {
    level: f32,
    charging: bool,
}

impl BatteryReading {
    const MAINS: BatteryReading = BatteryReading {
        level: 1.0,
        charging: true,
    };

    fn low_power(self) -> bool {
        !self.charging && self.level <= LOW_BATTERY_LEVEL
    }

    fn mode(self) -> PowerMode {
        PowerMode::classify(self.level, self.low_power(), self.charging)
    }
}

/// Reads `/sys/class/power_supply/*/{type,capacity,status}`. A daemon is never backgrounded.
pub struct SysfsPowerProvider {
    root: PathBuf,
}

impl SysfsPowerProvider {
    pub fn new() -> Self {
        Self::with_root(POWER_SUPPLY_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// First battery found; no battery means mains power.
    fn read(&self) -> BatteryReading {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return BatteryReading::MAINS;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if read_trimmed(&dir.join("type")).as_deref() != Some("Battery") {
                continue;
            }
            let Some(capacity) = read_trimmed(&dir.join("capacity")).and_then(|s| s.parse::<u8>().ok())
            else {
                continue;
            };
            let status = read_trimmed(&dir.join("status")).unwrap_or_default();
            return BatteryReading {
                level: (f32::from(capacity) / 100.0).clamp(0.0, 1.0),
                charging: status != "Discharging",
            };
        }
        BatteryReading::MAINS
    }
}

impl Default for SysfsPowerProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

impl PowerStateProvider for SysfsPowerProvider {
    fn is_low_power_mode(&self) -> bool {
        self.read().low_power()
    }

    fn is_in_background(&self) -> bool {
        false
    }

    fn battery_level(&self) -> f32 {
        self.read().level
    }

    fn suggested_polling_interval(&self) -> Duration {
        self.read().mode().suggested_interval()
    }

    fn power_mode(&self) -> PowerMode {
        self.read().mode()
    }

    fn snapshot(&self) -> PowerState {
        let reading = self.read();
        let mode = reading.mode();
        PowerState {
            battery_level: reading.level,
            low_power_mode: reading.low_power(),
            in_background: false,
            power_mode: mode,
            suggested_polling_interval: mode.suggested_interval(),
        }
    }
}

/// Holds whatever the host last pushed.
#[derive(Debug, Default)]
pub struct ManualPowerProvider {
    state: RwLock<PowerState>,
}

impl ManualPowerProvider {
    pub fn new(state: PowerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn set(&self, state: PowerState) {
        *self.state.write() = state;
    }

    pub fn set_low_power(&self, on: bool) {
        let mut s = self.state.write();
        *s = s.clone().with_low_power(on);
    }

    pub fn set_background(&self, on: bool) {
        self.state.write().in_background = on;
    }

    pub fn set_battery(&self, level: f32) {
        let mut s = self.state.write();
        *s = s.clone().with_battery(level);
    }
}

impl PowerStateProvider for ManualPowerProvider {
    fn is_low_power_mode(&self) -> bool {
        self.state.read().low_power_mode
    }

    fn is_in_background(&self) -> bool {
        self.state.read().in_background
    }

    fn battery_level(&self) -> f32 {
        self.state.read().battery_level
    }

    fn suggested_polling_interval(&self) -> Duration {
        self.state.read().suggested_polling_interval
    }

    fn power_mode(&self) -> PowerMode {
        self.state.read().power_mode
    }

    fn snapshot(&self) -> PowerState {
        self.state.read().clone()
    }
}

/// Re-read `provider` every `every` and call `on_change` when the reading differs from the
/// previous one. Runs until `cancel` fires.
pub async fn watch_power<F>(
    provider: Arc<dyn PowerStateProvider>,
    every: Duration,
    cancel: CancellationToken,
    on_change: F,
) where
    F: Fn(&PowerState) + Send,
{
    let mut last = provider.snapshot();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let now = provider.snapshot();
        if now != last {
            tracing::info!(
                mode = ?now.power_mode,
                battery = now.battery_level,
                low_power = now.low_power_mode,
                background = now.in_background,
                "power state changed"
            );
            on_change(&now);
            last = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn battery(root: &Path, name: &str, capacity: &str, status: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("type"), "Battery\n").unwrap();
        std::fs::write(dir.join("capacity"), format!("{capacity}\n")).unwrap();
        std::fs::write(dir.join("status"), format!("{status}\n")).unwrap();
    }

    #[test]
    fn no_battery_is_mains() {
        let dir = tempfile::tempdir().unwrap();
        let ac = dir.path().join("AC");
        std::fs::create_dir_all(&ac).unwrap();
        std::fs::write(ac.join("type"), "Mains\n").unwrap();
        let p = SysfsPowerProvider::with_root(dir.path());
        let s = p.snapshot();
        assert_eq!(s.battery_level, 1.0);
        assert!(!s.low_power_mode);
        assert_eq!(s.power_mode, PowerMode::Performance);
        assert!(!s.in_background);
    }

    #[test]
    fn discharging_low_battery_is_low_power() {
        let dir = tempfile::tempdir().unwrap();
        battery(dir.path(), "BAT0", "15", "Discharging");
        let p = SysfsPowerProvider::with_root(dir.path());
        assert!(p.is_low_power_mode());
        assert_eq!(p.power_mode(), PowerMode::LowPower);
        assert_eq!(p.suggested_polling_interval(), Duration::from_secs(300));
    }

    #[test]
    fn charging_low_battery_is_not_low_power() {
        let dir = tempfile::tempdir().unwrap();
        battery(dir.path(), "BAT0", "15", "Charging");
        let p = SysfsPowerProvider::with_root(dir.path());
        assert!(!p.is_low_power_mode());
        assert!((p.battery_level() - 0.15).abs() < 1e-6);
        assert_eq!(p.power_mode(), PowerMode::Performance);
    }

    #[test]
    fn half_battery_is_balanced() {
        let dir = tempfile::tempdir().unwrap();
        battery(dir.path(), "BAT1", "45", "Discharging");
        let s = SysfsPowerProvider::with_root(dir.path()).snapshot();
        assert_eq!(s.power_mode, PowerMode::Balanced);
        assert_eq!(s.suggested_polling_interval, Duration::from_secs(60));
    }

    #[test]
    fn manual_setters() {
        let p = ManualPowerProvider::default();
        p.set_low_power(true);
        assert_eq!(p.power_mode(), PowerMode::LowPower);
        p.set_background(true);
        assert!(p.is_in_background());
        p.set_low_power(false);
        p.set_battery(0.1);
        assert!(p.snapshot().is_constrained());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reports_changes_only() {
        let manual = Arc::new(ManualPowerProvider::default());
        let changes = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = changes.clone();
        let task = tokio::spawn(watch_power(
            manual.clone(),
            Duration::from_secs(5),
            cancel.clone(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        manual.set_low_power(true);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
