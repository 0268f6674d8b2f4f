//! Medium Access Control (MAC) layer module.
//! Contains MAC traits and the reservation MAC implementation.

use strum::Display;

use crate::RxInfo;

pub mod nav;
pub use nav::NavMac;

/// Generic MAC trait, implemented by all MACs
pub trait Mac {
    type Error;

    /// Queue a payload for transmission
    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error>;

    /// Fetch a received payload (if available) into the provided buffer
    fn receive(&mut self, data: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error>;

    /// Check whether the MAC has a send in progress
    fn busy(&self) -> bool;

    /// Update the MAC state, returning the outcome of any completed send
    fn tick(&mut self) -> Result<Option<TxOutcome>, Self::Error>;
}

/// Channel access state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// Not listening, nothing to send
    Idle,
    /// Waiting out backoff before the next channel check
    Sensing,
    /// Reservation on air or in the guard interval that follows it
    Reserving,
    /// Silent until the NAV deadline passes
    NavDefer,
    /// Data frame on air
    TransmitData,
    /// Listening, nothing to send
    AwaitData,
}

/// Events driving the MAC state machine
#[derive(Debug, Clone, PartialEq)]
pub enum MacEvent<'a> {
    /// Frame received from the radio
    Received(&'a [u8], RxInfo),
    /// Radio finished the current transmission
    TransmitDone,
    /// Time has advanced, deadlines may have expired
    Timer,
}

/// Final outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxOutcome {
    /// Data frame transmitted
    Sent,
    /// Sense attempts exhausted, payload dropped
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Normal,
    /// Reserve on the first clear sense, skipping probabilistic thinning
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacStats {
    pub tx_data: u32,
    pub tx_reservation: u32,
    pub rx_data: u32,
    pub rx_reservation: u32,
    /// Times a NAV was set or extended by a received reservation
    pub nav_count: u32,
    /// Sense attempts that found the carrier busy
    pub carrier_busy: u32,
    /// Random delays applied before sensing
    pub backoff_count: u32,
    pub rx_unparseable: u32,
    pub abandoned: u32,
}

impl MacStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percentage of channel access attempts that ended in our own data
    /// rather than deferring to a peer, `None` before the first send
    pub fn efficiency(&self) -> Option<f32> {
        if self.tx_data == 0 {
            return None;
        }

        let total = self.tx_data as f32 + self.nav_count as f32;
        Some(self.tx_data as f32 / total * 100.0)
    }
}
