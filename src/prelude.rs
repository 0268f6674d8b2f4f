//! LoRa NAV MAC crate prelude
//
// Copyright 2021 Ryan Kurte

pub use crate::{Radio, RxInfo, LinkInfo, Ts};

pub use crate::mac::{Mac, NavMac, ChannelState, MacEvent, MacStats, Priority, TxOutcome};

pub use crate::config::{Config, ConfigError, Preset, SendPolicy};

pub use crate::error::MacError;
pub use crate::timer::{Timer as MacTimer};

pub use crate::frame::{Frame, DecodeError};
pub use crate::timing::{Timing, LoRaParams};
