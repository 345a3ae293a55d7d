use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LogicError;

/// Trigger condition applied to the digital trigger channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    High,
    Low,
    Negedge,
    #[default]
    Posedge,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::High => "high",
            TriggerMode::Low => "low",
            TriggerMode::Negedge => "negedge",
            TriggerMode::Posedge => "posedge",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerMode {
    type Err = LogicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(TriggerMode::High),
            "low" => Ok(TriggerMode::Low),
            "negedge" => Ok(TriggerMode::Negedge),
            "posedge" => Ok(TriggerMode::Posedge),
            other => Err(LogicError::Config(format!("unknown trigger mode '{other}'"))),
        }
    }
}

/// One entry of the connected-device list.
///
/// The Logic application reports devices as comma separated fields. The first
/// field is the selector index, the last two characters of the second field
/// encode the total channel number of the device. The highest channel is
/// reserved for the digital trigger, the remaining ones are recordable analog
/// channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub index: String,
    pub name: String,
    pub total_channels: u32,
}

impl DeviceEntry {
    pub fn parse(token: &str) -> Result<Self, LogicError> {
        let mut fields = token.split(',');
        let index = fields
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LogicError::InvalidDevice(token.to_string()))?;
        let name = fields
            .next()
            .map(str::trim)
            .ok_or_else(|| LogicError::InvalidDevice(token.to_string()))?;

        let suffix: String = {
            let chars: Vec<char> = name.chars().collect();
            let start = chars.len().saturating_sub(2);
            chars[start..].iter().collect()
        };
        let total_channels: u32 = suffix
            .trim()
            .parse()
            .map_err(|_| LogicError::InvalidDevice(token.to_string()))?;

        if total_channels < 2 {
            return Err(LogicError::InvalidDevice(format!(
                "{token} (needs a trigger channel and at least one analog channel)"
            )));
        }

        Ok(Self {
            index: index.to_string(),
            name: name.to_string(),
            total_channels,
        })
    }

    /// Digital channel used as trigger source.
    pub fn trigger_channel(&self) -> u32 {
        self.total_channels - 1
    }

    /// Number of analog channels the operator may choose to record.
    pub fn channel_choices(&self) -> Vec<u32> {
        (1..self.total_channels).collect()
    }
}

/// A `digital,analog` sample rate pair as listed by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate {
    pub digital: f64,
    pub analog: f64,
}

impl SampleRate {
    pub fn parse(token: &str) -> Result<Self, LogicError> {
        let invalid = || LogicError::InvalidSampleRate(token.to_string());
        let mut fields = token.split(',');
        let digital = fields
            .next()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(invalid)?;
        let analog = fields
            .next()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(invalid)?;
        if fields.next().is_some() || !digital.is_finite() || !analog.is_finite() {
            return Err(invalid());
        }
        Ok(Self { digital, analog })
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.digital, self.analog)
    }
}
