//! Density-aware reservation MAC for shared LoRa links
//
// Copyright 2021 Ryan Kurte

#![no_std]

use core::fmt::Debug;

use radio::{State, Transmit, Receive, Rssi, ReceiveInfo};

#[cfg(any(test, feature="std"))]
extern crate std;

#[cfg(feature="alloc")]
extern crate alloc;

pub mod timer;

pub mod config;

pub mod timing;

pub mod frame;

pub mod mac;

pub mod error;

#[cfg(any(test, feature="mocks"))]
pub mod sim;

pub mod prelude;


/// Timestamps are 64-bit in milliseconds
pub type Ts = u64;

/// Link quality for a received frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxInfo {
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    pub snr: i16,
}

/// Extends [`radio::ReceiveInfo`] with the SNR estimate LoRa modems report
pub trait LinkInfo: ReceiveInfo {
    /// Signal to noise ratio in dB, zero where the radio does not provide one
    fn snr(&self) -> i16 {
        0
    }
}

impl LinkInfo for radio::BasicInfo {}

impl RxInfo {
    pub fn from_info<I: LinkInfo>(info: &I) -> Self {
        Self {
            rssi: info.rssi(),
            snr: info.snr(),
        }
    }
}

/// Radio interface combines `radio` traits
pub trait Radio<S: radio::RadioState, I: LinkInfo, E: Debug>: radio::State<State=S, Error=E> + radio::Transmit<Error=E> + radio::Receive<Info=I, Error=E> + radio::Rssi<Error=E> {}

/// Default Radio impl for radio devices
impl <T, S: radio::RadioState, I: LinkInfo, E: Debug> Radio<S, I, E> for T where
    T: State<State=S, Error=E> + Transmit<Error=E> + Receive<Info=I, Error=E> + Rssi<Error=E>,
{}
