//! Power state as reported by the host. The core only reads it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Battery fraction at or below which the device is treated as constrained.
pub const LOW_BATTERY_LEVEL: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Performance,
    Balanced,
    Conservative,
    LowPower,
}

impl PowerMode {
    /// Pick a mode from a battery reading. `battery` is 0.0..=1.0.
    pub fn classify(battery: f32, low_power_mode: bool, charging: bool) -> Self {
        if low_power_mode {
            PowerMode::LowPower
        } else if charging {
            PowerMode::Performance
        } else if battery <= LOW_BATTERY_LEVEL {
            PowerMode::Conservative
        } else if battery <= 0.5 {
            PowerMode::Balanced
        } else {
            PowerMode::Performance
        }
    }

    pub fn suggested_interval(self) -> Duration {
        match self {
            PowerMode::Performance => Duration::from_secs(30),
            PowerMode::Balanced => Duration::from_secs(60),
            PowerMode::Conservative => Duration::from_secs(120),
            PowerMode::LowPower => Duration::from_secs(300),
        }
    }
}

/// One reading of the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerState {
    pub battery_level: f32,
    pub low_power_mode: bool,
    pub in_background: bool,
    pub power_mode: PowerMode,
    pub suggested_polling_interval: Duration,
}

impl PowerState {
    /// Foreground, full battery, performance mode.
    pub fn nominal() -> Self {
        Self {
            battery_level: 1.0,
            low_power_mode: false,
            in_background: false,
            power_mode: PowerMode::Performance,
            suggested_polling_interval: PowerMode::Performance.suggested_interval(),
        }
    }

    pub fn with_low_power(mut self, on: bool) -> Self {
        self.low_power_mode = on;
        self.power_mode = PowerMode::classify(self.battery_level, on, false);
        self.suggested_polling_interval = self.power_mode.suggested_interval();
        self
    }

    pub fn with_background(mut self, on: bool) -> Self {
        self.in_background = on;
        self
    }

    pub fn with_battery(mut self, level: f32) -> Self {
        self.battery_level = level.clamp(0.0, 1.0);
        self.power_mode = PowerMode::classify(self.battery_level, self.low_power_mode, false);
        self.suggested_polling_interval = self.power_mode.suggested_interval();
        self
    }

    /// Low-power flag set or battery at/below [`LOW_BATTERY_LEVEL`].
    pub fn is_constrained(&self) -> bool {
        self.low_power_mode || self.battery_level <= LOW_BATTERY_LEVEL
    }
}

impl Default for PowerState {
    fn default() -> Self {
        Self::nominal()
    }
}

/// Injected by the host in place of a global power monitor.
pub trait PowerStateProvider: Send + Sync {
    fn is_low_power_mode(&self) -> bool;
    fn is_in_background(&self) -> bool;
    /// 0.0..=1.0
    fn battery_level(&self) -> f32;
    fn suggested_polling_interval(&self) -> Duration;
    fn power_mode(&self) -> PowerMode;

    fn snapshot(&self) -> PowerState {
        PowerState {
            battery_level: self.battery_level(),
            low_power_mode: self.is_low_power_mode(),
            in_background: self.is_in_background(),
            power_mode: self.power_mode(),
            suggested_polling_interval: self.suggested_polling_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_modes() {
        assert_eq!(PowerMode::classify(0.9, true, false), PowerMode::LowPower);
        assert_eq!(PowerMode::classify(0.1, false, true), PowerMode::Performance);
        assert_eq!(PowerMode::classify(0.15, false, false), PowerMode::Conservative);
        assert_eq!(PowerMode::classify(0.4, false, false), PowerMode::Balanced);
        assert_eq!(PowerMode::classify(0.8, false, false), PowerMode::Performance);
    }

    #[test]
    fn low_power_lengthens_suggested_interval() {
        let normal = PowerState::nominal();
        let low = PowerState::nominal().with_low_power(true);
        assert!(low.suggested_polling_interval > normal.suggested_polling_interval);
        assert!(low.is_constrained());
        assert!(PowerState::nominal().with_battery(0.1).is_constrained());
        assert!(!normal.is_constrained());
    }
}
