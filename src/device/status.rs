// src/device/status.rs
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Last known state of the controller, replaced wholesale on every good read.
///
/// Wire format: `{"moistureLevel":2850,"pumpStatus":false,"autoMode":false}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "moistureLevel")]
    pub moisture_level: i64,
    #[serde(rename = "pumpStatus")]
    pub pump_running: bool,
    #[serde(rename = "autoMode")]
    pub auto_mode_enabled: bool,
}

impl DeviceStatus {
    pub fn new(moisture_level: i64, pump_running: bool, auto_mode_enabled: bool) -> Self {
        Self {
            moisture_level,
            pump_running,
            auto_mode_enabled,
        }
    }

    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Recent moisture readings, oldest first. Display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoistureHistory {
    readings: VecDeque<i64>,
    capacity: usize,
}

impl MoistureHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, reading: i64) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<i64> {
        self.readings.iter().copied().collect()
    }
}

impl Default for MoistureHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoistureBand {
    VeryDry,
    Dry,
    Moist,
    VeryMoist,
}

impl MoistureBand {
    pub fn label(&self) -> &'static str {
        match self {
            MoistureBand::VeryDry => "Very Dry",
            MoistureBand::Dry => "Dry",
            MoistureBand::Moist => "Moist",
            MoistureBand::VeryMoist => "Very Moist",
        }
    }
}

impl std::fmt::Display for MoistureBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Band boundaries in raw ADC units. Higher readings mean drier soil, so a
/// reading strictly above `very_dry` is `VeryDry`, and so on downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoistureThresholds {
    pub very_dry: i64,
    pub dry: i64,
    pub moist: i64,
}

impl Default for MoistureThresholds {
    fn default() -> Self {
        Self {
            very_dry: 2900,
            dry: 2800,
            moist: 2700,
        }
    }
}

impl MoistureThresholds {
    pub fn classify(&self, level: i64) -> MoistureBand {
        if level > self.very_dry {
            MoistureBand::VeryDry
        } else if level > self.dry {
            MoistureBand::Dry
        } else if level > self.moist {
            MoistureBand::Moist
        } else {
            MoistureBand::VeryMoist
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.very_dry > self.dry && self.dry > self.moist
    }
}
