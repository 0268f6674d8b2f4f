//! Simulated shared radio medium
//!
//! Every [`SimRadio`] attached to a [`Medium`] hears every other one, frames
//! that overlap on air are lost to all receivers. Time comes from a shared
//! [`MockTimer`] so whole networks can be stepped deterministically.
//
// Copyright 2021 Ryan Kurte

use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use log::{trace, debug};
use rand_core::RngCore;

use crate::{LinkInfo, Ts};
use crate::config::Config;
use crate::error::MacError;
use crate::mac::{Mac, NavMac};
use crate::timer::mock::MockTimer;
use crate::timing::{estimate_airtime_ms, LoRaParams};

/// RSSI reported while another node is on air
pub const RSSI_BUSY: i16 = -60;
/// RSSI reported on a quiet channel
pub const RSSI_NOISE: i16 = -120;
/// SNR reported for delivered frames
pub const SNR_RX: i16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Idle,
    Sleep,
    Receive,
    Transmit,
}

impl radio::RadioState for SimState {
    fn idle() -> Self {
        SimState::Idle
    }

    fn sleep() -> Self {
        SimState::Sleep
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// Medium lock poisoned by a panicking node
    Poisoned,
    /// `get_received` called with no frame available
    NoFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SimInfo {
    pub rssi: i16,
    pub snr: i16,
}

impl radio::ReceiveInfo for SimInfo {
    fn rssi(&self) -> i16 {
        self.rssi
    }
}

impl LinkInfo for SimInfo {
    fn snr(&self) -> i16 {
        self.snr
    }
}

/// Medium level counters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediumStats {
    /// Frames put on air
    pub frames: u32,
    /// Frame copies handed to receivers
    pub delivered: u32,
    /// Frames lost to overlap
    pub collisions: u32,
}

#[derive(Debug)]
struct Node {
    state: SimState,
    rx: Option<Vec<u8>>,
    tx_end: Ts,
}

#[derive(Debug)]
struct Air {
    from: usize,
    start: Ts,
    end: Ts,
    data: Vec<u8>,
    collided: bool,
    /// Nodes that were not receiving at some point during the frame
    deaf: Vec<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<Node>,
    airs: Vec<Air>,
    stats: MediumStats,
}

impl Inner {
    /// Deliver frames that have finished by `now`
    fn settle(&mut self, now: Ts) {
        let mut i = 0;

        while i < self.airs.len() {
            if self.airs[i].end > now {
                i += 1;
                continue;
            }

            let air = self.airs.remove(i);
            if air.collided {
                trace!("Frame from {} lost to collision", air.from);
                self.stats.collisions += 1;
                continue;
            }

            for (id, node) in self.nodes.iter_mut().enumerate() {
                if id == air.from || air.deaf.contains(&id) || node.state != SimState::Receive {
                    continue;
                }

                // Single frame buffer, unread frames are not overwritten
                if node.rx.is_none() {
                    node.rx = Some(air.data.clone());
                    self.stats.delivered += 1;
                }
            }
        }
    }

    /// Mark a node leaving receive as deaf to frames currently on air
    fn leave_receive(&mut self, id: usize, now: Ts) {
        for air in self.airs.iter_mut().filter(|a| a.start <= now && a.end > now) {
            if !air.deaf.contains(&id) {
                air.deaf.push(id);
            }
        }
    }

    fn set_state(&mut self, id: usize, state: SimState, now: Ts) {
        if self.nodes[id].state == SimState::Receive && state != SimState::Receive {
            self.leave_receive(id, now);
        }
        self.nodes[id].state = state;
    }
}

/// Shared channel connecting simulated radios
#[derive(Clone)]
pub struct Medium {
    inner: Arc<Mutex<Inner>>,
    timer: MockTimer,
    params: LoRaParams,
}

impl Medium {
    pub fn new(timer: MockTimer, params: LoRaParams) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            timer,
            params,
        }
    }

    /// Attach a new radio to the medium
    pub fn radio(&self) -> Result<SimRadio, SimError> {
        let mut inner = self.lock()?;

        let id = inner.nodes.len();
        inner.nodes.push(Node{ state: SimState::Idle, rx: None, tx_end: 0 });

        Ok(SimRadio{ id, medium: self.clone() })
    }

    /// End of the next frame on air
    pub fn next_event(&self) -> Option<Ts> {
        let inner = self.lock().ok()?;
        let next = inner.airs.iter().map(|a| a.end).min();
        next
    }

    pub fn stats(&self) -> MediumStats {
        self.lock().map(|i| i.stats.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, SimError> {
        self.inner.lock().map_err(|_| SimError::Poisoned)
    }
}

/// Radio attached to a simulated [`Medium`]
#[derive(Clone)]
pub struct SimRadio {
    id: usize,
    medium: Medium,
}

impl SimRadio {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Lock the medium with frames finished by now delivered
    fn settled(&self) -> Result<(MutexGuard<'_, Inner>, Ts), SimError> {
        let now = self.medium.timer.val();
        let mut inner = self.medium.lock()?;
        inner.settle(now);
        Ok((inner, now))
    }
}

impl radio::State for SimRadio {
    type State = SimState;
    type Error = SimError;

    fn set_state(&mut self, state: Self::State) -> Result<(), Self::Error> {
        let (mut inner, now) = self.settled()?;
        inner.set_state(self.id, state, now);
        Ok(())
    }

    fn get_state(&mut self) -> Result<Self::State, Self::Error> {
        let (inner, _now) = self.settled()?;
        let state = inner.nodes[self.id].state;
        Ok(state)
    }
}

impl radio::Transmit for SimRadio {
    type Error = SimError;

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let airtime = estimate_airtime_ms(data.len(), &self.medium.params) as Ts;
        let (mut inner, now) = self.settled()?;

        inner.set_state(self.id, SimState::Transmit, now);
        inner.nodes[self.id].tx_end = now + airtime;

        // Anything still on air overlaps the new frame
        let collided = !inner.airs.is_empty();
        for air in inner.airs.iter_mut() {
            air.collided = true;
        }

        let deaf = inner.nodes.iter().enumerate()
            .filter(|(_, n)| n.state != SimState::Receive)
            .map(|(id, _)| id)
            .collect();

        debug!("Node {} on air for {} ms at {} ms ({} bytes)", self.id, airtime, now, data.len());

        inner.airs.push(Air{
            from: self.id,
            start: now,
            end: now + airtime,
            data: data.to_vec(),
            collided,
            deaf,
        });
        inner.stats.frames += 1;

        Ok(())
    }

    fn check_transmit(&mut self) -> Result<bool, Self::Error> {
        let (mut inner, now) = self.settled()?;

        let node = &mut inner.nodes[self.id];
        if node.state == SimState::Transmit && now >= node.tx_end {
            node.state = SimState::Idle;
            return Ok(true);
        }

        Ok(false)
    }
}

impl radio::Receive for SimRadio {
    type Error = SimError;
    type Info = SimInfo;

    fn start_receive(&mut self) -> Result<(), Self::Error> {
        let (mut inner, now) = self.settled()?;
        inner.set_state(self.id, SimState::Receive, now);
        Ok(())
    }

    fn check_receive(&mut self, _restart: bool) -> Result<bool, Self::Error> {
        let (inner, _now) = self.settled()?;
        let ready = inner.nodes[self.id].rx.is_some();
        Ok(ready)
    }

    fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, Self::Info), Self::Error> {
        let (mut inner, _now) = self.settled()?;

        let data = inner.nodes[self.id].rx.take().ok_or(SimError::NoFrame)?;

        let n = data.len().min(buff.len());
        buff[..n].copy_from_slice(&data[..n]);

        Ok((n, SimInfo{ rssi: RSSI_BUSY, snr: SNR_RX }))
    }
}

impl radio::Rssi for SimRadio {
    type Error = SimError;

    fn poll_rssi(&mut self) -> Result<i16, Self::Error> {
        let (inner, now) = self.settled()?;

        let busy = inner.airs.iter()
            .any(|a| a.from != self.id && a.start <= now && a.end > now);

        match busy {
            true => Ok(RSSI_BUSY),
            false => Ok(RSSI_NOISE),
        }
    }
}

/// MAC running over a simulated radio
pub type SimMac<G> = NavMac<SimRadio, SimState, SimInfo, SimError, MockTimer, G>;

/// A set of MACs sharing one medium and one clock
pub struct Network<G> {
    timer: MockTimer,
    medium: Medium,
    nodes: Vec<SimMac<G>>,
}

impl <G: RngCore> Network<G> {
    pub fn new(params: LoRaParams) -> Self {
        let timer = MockTimer::new();

        Self {
            medium: Medium::new(timer.clone(), params),
            timer,
            nodes: Vec::new(),
        }
    }

    /// Add a MAC to the network, returning its index
    pub fn add_node(&mut self, config: Config, rng: G) -> Result<usize, MacError<SimError>> {
        let radio = self.medium.radio().map_err(MacError::Radio)?;
        let mac = NavMac::new(config, radio, self.timer.clone(), rng)?;

        self.nodes.push(mac);

        Ok(self.nodes.len() - 1)
    }

    pub fn node(&self, index: usize) -> Option<&SimMac<G>> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut SimMac<G>> {
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> &[SimMac<G>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [SimMac<G>] {
        &mut self.nodes
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn now(&self) -> Ts {
        self.timer.val()
    }

    /// Advance to the next node deadline or frame end and tick every node,
    /// returning the new time or `None` when nothing is scheduled
    pub fn step(&mut self) -> Result<Option<Ts>, MacError<SimError>> {
        let now = self.timer.val();

        let next = self.nodes.iter()
            .filter_map(|n| n.next_wake())
            .chain(self.medium.next_event())
            .min();

        let t = match next {
            Some(t) => t.max(now + 1),
            None => return Ok(None),
        };

        self.timer.set_ms(t);

        for n in self.nodes.iter_mut() {
            n.tick()?;
        }

        Ok(Some(t))
    }
}
