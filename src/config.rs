//! Deployment configuration and presets

use core::fmt;

use strum::{Display, EnumString};

/// Largest payload carried by a single data frame (255 byte FIFO less the frame header)
pub const MAX_PAYLOAD_LEN: usize = 253;

/// Named parameter bundles for common deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Preset {
    /// Hundreds of co-located nodes, maximum range
    Dense,
    /// Small bench setup, fast modulation
    Testing,
    /// Sparse deployment, maximum power and coding
    LongRange,
    /// Faster modulation and no carrier sense to save power
    LowPower,
}

/// Behaviour of `send` while a payload is already pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendPolicy {
    /// Fail with `MacError::Busy`
    Reject,
    /// Hold the payload in a bounded backlog until the pending send completes
    Queue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Expected number of nodes sharing the channel
    pub node_count: u32,

    /// LoRa spreading factor (7-12)
    pub spreading_factor: u8,
    /// LoRa bandwidth in Hz
    pub bandwidth_hz: u32,
    /// Coding rate denominator (5-8 for 4/5 to 4/8)
    pub coding_rate: u8,
    /// Preamble length in symbols
    pub preamble_symbols: u16,
    /// Carrier frequency in Hz
    pub frequency_hz: f32,
    /// Transmit power in dBm, applied by the radio driver
    pub tx_power_dbm: i8,

    /// Fixed probability of escalating a clear sense to a reservation,
    /// derived from `node_count` when unset
    pub reservation_probability_override: Option<f32>,
    /// Fixed backoff window (in DIFS units), derived from `node_count` when unset
    pub backoff_window_override: Option<u32>,
    /// Base time unit in ms, one preamble duration when unset
    pub difs_ms: Option<u32>,
    /// Delay between reservation and data in ms, one DIFS when unset
    pub guard_ms: Option<u32>,

    /// Maximum accepted payload length
    pub max_payload_bytes: usize,

    /// Check channel energy before each reservation attempt
    pub use_carrier_sense: bool,
    /// RSSI threshold for a channel to be determined to be clear
    pub channel_clear_threshold: i16,

    /// Behaviour when sending with a payload already pending
    pub send_policy: SendPolicy,
    /// Abandon a payload after this many unsuccessful sense rounds
    pub max_sense_attempts: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_preset(Preset::Dense, 500)
    }
}

impl Config {
    /// Resolve a preset for the expected population
    pub fn from_preset(preset: Preset, node_count: u32) -> Self {
        let base = Self {
            node_count,
            spreading_factor: 12,
            bandwidth_hz: 125_000,
            coding_rate: 5,
            preamble_symbols: 8,
            frequency_hz: 915.0e6,
            tx_power_dbm: 14,

            reservation_probability_override: None,
            backoff_window_override: None,
            difs_ms: Some(400),
            guard_ms: None,

            max_payload_bytes: MAX_PAYLOAD_LEN,

            use_carrier_sense: true,
            channel_clear_threshold: -90,

            send_policy: SendPolicy::Reject,
            max_sense_attempts: None,
        };

        match preset {
            // Window and probability tiers follow the population
            Preset::Dense => base,
            Preset::Testing => Self {
                spreading_factor: 7,
                difs_ms: Some(100),
                reservation_probability_override: Some(0.1),
                backoff_window_override: Some(7),
                ..base
            },
            Preset::LongRange => Self {
                coding_rate: 8,
                tx_power_dbm: 22,
                reservation_probability_override: Some(0.15),
                backoff_window_override: Some(7),
                ..base
            },
            Preset::LowPower => Self {
                spreading_factor: 9,
                difs_ms: Some(200),
                tx_power_dbm: 10,
                use_carrier_sense: false,
                reservation_probability_override: Some(0.1),
                backoff_window_override: Some(7),
                ..base
            },
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::NodeCount);
        }
        if !(7..=12).contains(&self.spreading_factor) {
            return Err(ConfigError::SpreadingFactor(self.spreading_factor));
        }
        if self.bandwidth_hz == 0 || self.bandwidth_hz > 500_000 {
            return Err(ConfigError::Bandwidth(self.bandwidth_hz));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(ConfigError::CodingRate(self.coding_rate));
        }
        if self.preamble_symbols == 0 {
            return Err(ConfigError::Preamble);
        }
        if let Some(p) = self.reservation_probability_override {
            if !(p > 0.0 && p <= 1.0) {
                return Err(ConfigError::Probability);
            }
        }
        if self.backoff_window_override == Some(0) {
            return Err(ConfigError::Window);
        }
        if self.difs_ms == Some(0) {
            return Err(ConfigError::Difs);
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadSize(self.max_payload_bytes));
        }
        if self.channel_clear_threshold > -40 || self.channel_clear_threshold < -140 {
            return Err(ConfigError::Threshold(self.channel_clear_threshold));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    NodeCount,
    SpreadingFactor(u8),
    Bandwidth(u32),
    CodingRate(u8),
    Preamble,
    Probability,
    Window,
    Difs,
    PayloadSize(usize),
    Threshold(i16),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeCount => write!(f, "node_count must be > 0"),
            Self::SpreadingFactor(sf) => write!(f, "spreading factor {} outside 7..=12", sf),
            Self::Bandwidth(bw) => write!(f, "bandwidth {} Hz outside 1..=500000", bw),
            Self::CodingRate(cr) => write!(f, "coding rate 4/{} outside 4/5..=4/8", cr),
            Self::Preamble => write!(f, "preamble_symbols must be > 0"),
            Self::Probability => write!(f, "reservation probability must be in (0, 1]"),
            Self::Window => write!(f, "backoff window must be > 0"),
            Self::Difs => write!(f, "difs_ms must be > 0"),
            Self::PayloadSize(n) => write!(f, "max payload {} outside 1..={}", n, MAX_PAYLOAD_LEN),
            Self::Threshold(t) => write!(f, "channel clear threshold {} dBm outside -140..=-40", t),
        }
    }
}
