//! Density-aware reservation MAC
//!
//! Senders thin themselves probabilistically before claiming the channel with
//! a short reservation frame, peers that hear the reservation hold off (NAV)
//! for the announced data airtime.
//
// Copyright 2021 Ryan Kurte

use core::{fmt::Debug, marker::PhantomData};

use log::{trace, debug, info, warn, error};
use heapless::Deque;
use rand_core::RngCore;

#[cfg(feature = "alloc")]
use alloc::boxed::Box;

use crate::{Radio, LinkInfo, RxInfo, Ts};
use crate::config::{Config, SendPolicy};
use crate::error::MacError;
use crate::frame::{Frame, Payload, MAX_FRAME_LEN};
use crate::timer::Timer;
use crate::timing::Timing;

use super::{Mac, ChannelState, MacEvent, MacStats, Priority, TxOutcome};

/// Payloads held behind the pending send with [`SendPolicy::Queue`]
pub const BACKLOG_LEN: usize = 4;

/// Received payloads held for [`Mac::receive`] when no callback is registered
pub const RX_QUEUE_LEN: usize = 8;

/// Receive callback, called with the payload and link quality of each data frame
#[cfg(feature = "alloc")]
pub type ReceiveCallback = Box<dyn FnMut(&[u8], RxInfo) + Send>;

#[derive(Debug, Clone, PartialEq)]
struct Outbound {
    payload: Payload,
    priority: Priority,
    /// Airtime announced by our reservation, zero until reserving
    declared_ms: u32,
}

pub struct NavMac<R, S, I, E, T, G> {
    config: Config,
    timing: Timing,

    radio: R,
    timer: T,
    rng: G,

    state: ChannelState,
    listening: bool,
    receiving: bool,
    transmitting: bool,

    nav_deadline: Ts,
    backoff_until: Ts,
    guard_until: Option<Ts>,

    pending: Option<Outbound>,
    backlog: Deque<(Payload, Priority), BACKLOG_LEN>,
    consecutive: u32,
    attempts: u16,

    rx_queue: Deque<(Payload, RxInfo), RX_QUEUE_LEN>,
    #[cfg(feature = "alloc")]
    callback: Option<ReceiveCallback>,

    stats: MacStats,

    _state: PhantomData<S>,
    _info: PhantomData<I>,
    _err: PhantomData<E>,
}

impl <R, S, I, E, T, G> NavMac<R, S, I, E, T, G>
where
    R: Radio<S, I, E>,
    S: radio::RadioState,
    I: LinkInfo + Debug,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    /// Create a new MAC, taking ownership of the radio.
    ///
    /// The radio is not touched until [`NavMac::start_listening`] or a send.
    pub fn new(config: Config, radio: R, timer: T, rng: G) -> Result<Self, MacError<E>> {
        config.validate()?;

        let timing = Timing::new(&config);

        debug!("Setup MAC for {} nodes (p: {} W: {} DIFS: {} ms guard: {} ms)",
            config.node_count, timing.probability(), timing.window(), timing.difs_ms(), timing.guard_ms());

        Ok(Self {
            config,
            timing,

            radio,
            timer,
            rng,

            state: ChannelState::Idle,
            listening: false,
            receiving: false,
            transmitting: false,

            nav_deadline: 0,
            backoff_until: 0,
            guard_until: None,

            pending: None,
            backlog: Deque::new(),
            consecutive: 0,
            attempts: 0,

            rx_queue: Deque::new(),
            #[cfg(feature = "alloc")]
            callback: None,

            stats: MacStats::new(),

            _state: PhantomData,
            _info: PhantomData,
            _err: PhantomData,
        })
    }

    /// Fetch the current channel access state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Time until which the channel is treated as reserved by a peer
    pub fn nav_deadline(&self) -> Ts {
        self.nav_deadline
    }

    /// Fetch MAC layer statistics
    pub fn stats(&self) -> MacStats {
        self.stats.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Payload awaiting transmission, if any
    pub fn pending(&self) -> Option<&[u8]> {
        self.pending.as_ref().map(|p| p.payload.as_slice())
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Earliest time at which [`Mac::tick`] has timer work to do,
    /// `None` while only waiting on the radio
    pub fn next_wake(&self) -> Option<Ts> {
        match self.state {
            ChannelState::Sensing => Some(self.backoff_until),
            ChannelState::NavDefer => Some(self.nav_deadline),
            ChannelState::Reserving => self.guard_until,
            _ => None,
        }
    }

    /// Register a callback for received payloads, replacing the receive queue
    #[cfg(feature = "alloc")]
    pub fn on_receive<F>(&mut self, f: F)
    where
        F: FnMut(&[u8], RxInfo) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
    }

    /// Enter receive mode
    pub fn start_listening(&mut self) -> Result<(), MacError<E>> {
        debug!("Start listening");

        self.listening = true;
        self.ensure_receive()?;

        if self.state == ChannelState::Idle {
            self.state = ChannelState::AwaitData;
        }

        Ok(())
    }

    /// Leave receive mode, the radio keeps receiving while a send is pending
    pub fn stop_listening(&mut self) -> Result<(), MacError<E>> {
        debug!("Stop listening");

        self.listening = false;

        if self.state == ChannelState::AwaitData {
            self.state = ChannelState::Idle;
        }

        if self.pending.is_some() {
            debug!("Send pending, radio remains in receive");
            return Ok(());
        }

        self.release_radio()
    }

    /// Queue a payload for transmission with the provided priority
    pub fn send_with_priority(&mut self, payload: &[u8], priority: Priority) -> Result<(), MacError<E>> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(MacError::PayloadTooLarge(payload.len()));
        }

        let data = Payload::from_slice(payload)
            .map_err(|_| MacError::PayloadTooLarge(payload.len()))?;

        if self.pending.is_some() {
            return match self.config.send_policy {
                SendPolicy::Reject => {
                    debug!("Send rejected, payload already pending");
                    Err(MacError::Busy)
                },
                SendPolicy::Queue => {
                    self.backlog.push_back((data, priority)).map_err(|_| {
                        warn!("Send backlog full");
                        MacError::Busy
                    })?;

                    debug!("Queued {} byte payload ({} in backlog)", payload.len(), self.backlog.len());

                    Ok(())
                },
            };
        }

        let now = self.timer.ticks_ms();

        info!("Send {} byte payload ({:?} priority) at {} ms", payload.len(), priority, now);

        self.begin(now, data, priority)
    }

    /// Cancel the pending send.
    ///
    /// Returns the payload while still sensing or deferring, fails with
    /// [`MacError::Committed`] once the reservation has gone out.
    pub fn cancel(&mut self) -> Result<Option<Payload>, MacError<E>> {
        if let ChannelState::Reserving | ChannelState::TransmitData = self.state {
            return Err(MacError::Committed);
        }

        let p = match self.pending.take() {
            Some(p) => p,
            None => return Ok(None),
        };

        let now = self.timer.ticks_ms();

        info!("Cancelled {} byte payload at {} ms", p.payload.len(), now);

        self.settle(now)?;

        Ok(Some(p.payload))
    }

    /// Dispatch a single event through the state machine
    pub fn handle(&mut self, now: Ts, event: MacEvent) -> Result<Option<TxOutcome>, MacError<E>> {
        match event {
            MacEvent::Received(data, info) => {
                self.handle_received(now, data, info);
                Ok(None)
            },
            MacEvent::TransmitDone => self.handle_transmit_done(now),
            MacEvent::Timer => self.handle_timer(now),
        }
    }

    fn nav_active(&self, now: Ts) -> bool {
        now < self.nav_deadline
    }

    fn resting_state(&self, now: Ts) -> ChannelState {
        if self.nav_active(now) {
            ChannelState::NavDefer
        } else if self.listening {
            ChannelState::AwaitData
        } else {
            ChannelState::Idle
        }
    }

    fn ensure_receive(&mut self) -> Result<(), MacError<E>> {
        if !self.receiving && !self.transmitting {
            trace!("Start receive");

            self.radio.start_receive().map_err(MacError::Radio)?;
            self.receiving = true;
        }

        Ok(())
    }

    fn release_radio(&mut self) -> Result<(), MacError<E>> {
        if self.receiving {
            trace!("Set radio idle");

            self.radio.set_state(S::idle()).map_err(MacError::Radio)?;
            self.receiving = false;
        }

        Ok(())
    }

    /// Make `payload` the pending send and start contention, dropping it
    /// again if the radio cannot be put into receive
    fn begin(&mut self, now: Ts, payload: Payload, priority: Priority) -> Result<(), MacError<E>> {
        self.pending = Some(Outbound{ payload, priority, declared_ms: 0 });
        self.attempts = 0;

        if let Err(e) = self.arm(now) {
            error!("Failed to start contention at {} ms: {:?}", now, e);

            self.pending = None;
            self.state = self.resting_state(now);

            return Err(e);
        }

        Ok(())
    }

    /// Start contention for the pending payload
    fn arm(&mut self, now: Ts) -> Result<(), MacError<E>> {
        // Reservations must be heard while a send is pending
        self.ensure_receive()?;

        if self.nav_active(now) {
            debug!("NAV active until {} ms, deferring send", self.nav_deadline);
            self.state = ChannelState::NavDefer;
        } else {
            let delay = self.timing.listen_delay(&mut self.rng);
            self.schedule_sense(now, delay);
        }

        Ok(())
    }

    /// Pick up the next backlog entry or return to rest
    fn settle(&mut self, now: Ts) -> Result<(), MacError<E>> {
        self.guard_until = None;

        if let Some((payload, priority)) = self.backlog.pop_front() {
            debug!("Promoting {} byte payload from backlog", payload.len());

            return self.begin(now, payload, priority);
        }

        self.state = self.resting_state(now);

        match self.listening {
            true => self.ensure_receive(),
            false => self.release_radio(),
        }
    }

    fn schedule_sense(&mut self, now: Ts, delay_ms: u32) {
        self.backoff_until = now + delay_ms as Ts;
        self.state = ChannelState::Sensing;
        self.stats.backoff_count = self.stats.backoff_count.saturating_add(1);

        trace!("Sense scheduled for {} ms", self.backoff_until);
    }

    fn handle_received(&mut self, now: Ts, data: &[u8], info: RxInfo) {
        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                debug!("Dropping unparseable frame ({} bytes): {}", data.len(), e);
                self.stats.rx_unparseable = self.stats.rx_unparseable.saturating_add(1);
                return;
            },
        };

        match frame {
            Frame::Reservation{ duration_ms } => {
                self.stats.rx_reservation = self.stats.rx_reservation.saturating_add(1);
                self.enter_nav(now, duration_ms);
            },
            Frame::Data{ payload } => {
                debug!("Received {} byte payload at {} ms (rssi: {} snr: {})",
                    payload.len(), now, info.rssi, info.snr);

                self.stats.rx_data = self.stats.rx_data.saturating_add(1);
                self.deliver(payload, info);
            },
        }
    }

    fn enter_nav(&mut self, now: Ts, declared_ms: u32) {
        let nav = self.timing.nav_duration(&mut self.rng, declared_ms, self.consecutive);

        self.consecutive = self.consecutive.saturating_add(1);
        self.stats.nav_count = self.stats.nav_count.saturating_add(1);

        let deadline = now + nav as Ts;
        if deadline > self.nav_deadline {
            self.nav_deadline = deadline;
        }

        debug!("Reservation for {} ms, NAV until {} ms (defer #{})",
            declared_ms, self.nav_deadline, self.consecutive);

        match self.state {
            ChannelState::Reserving | ChannelState::TransmitData => {
                warn!("Competing reservation during our send, NAV extended");
            },
            _ => self.state = ChannelState::NavDefer,
        }
    }

    fn deliver(&mut self, payload: Payload, info: RxInfo) {
        #[cfg(feature = "alloc")]
        {
            if let Some(cb) = self.callback.as_mut() {
                cb(&payload, info);
                return;
            }
        }

        if self.rx_queue.push_back((payload, info)).is_err() {
            warn!("Receive queue full, dropping payload");
        }
    }

    fn handle_transmit_done(&mut self, now: Ts) -> Result<Option<TxOutcome>, MacError<E>> {
        if !self.transmitting {
            return Ok(None);
        }

        self.transmitting = false;

        match self.state {
            ChannelState::Reserving => {
                let t = now + self.timing.guard_ms() as Ts;
                self.guard_until = Some(t);

                debug!("Reservation sent, data at {} ms", t);

                // Keep hearing peers through the guard interval
                self.ensure_receive()?;

                Ok(None)
            },
            ChannelState::TransmitData => {
                self.stats.tx_data = self.stats.tx_data.saturating_add(1);
                self.consecutive = 0;
                self.attempts = 0;

                if let Some(p) = self.pending.take() {
                    info!("Sent {} byte payload at {} ms", p.payload.len(), now);
                }

                self.settle(now)?;

                Ok(Some(TxOutcome::Sent))
            },
            _ => Ok(None),
        }
    }

    fn handle_timer(&mut self, now: Ts) -> Result<Option<TxOutcome>, MacError<E>> {
        match self.state {
            ChannelState::NavDefer if !self.nav_active(now) => {
                debug!("NAV expired at {} ms", now);

                if self.pending.is_some() {
                    let delay = self.timing.listen_delay(&mut self.rng);
                    self.schedule_sense(now, delay);
                } else {
                    self.state = self.resting_state(now);
                }

                Ok(None)
            },
            ChannelState::Sensing if now >= self.backoff_until => self.sense(now),
            ChannelState::Reserving => match self.guard_until {
                Some(t) if now >= t => {
                    self.transmit_data(now)?;
                    Ok(None)
                },
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn channel_clear(&mut self) -> Result<bool, MacError<E>> {
        let rssi = self.radio.poll_rssi().map_err(MacError::Radio)?;

        if rssi > self.config.channel_clear_threshold {
            debug!("Channel busy (rssi: {} dBm)", rssi);
            return Ok(false);
        }

        Ok(true)
    }

    fn sense(&mut self, now: Ts) -> Result<Option<TxOutcome>, MacError<E>> {
        if self.nav_active(now) {
            self.state = ChannelState::NavDefer;
            return Ok(None);
        }

        let priority = match &self.pending {
            Some(p) => p.priority,
            None => {
                self.state = self.resting_state(now);
                return Ok(None);
            },
        };

        if self.config.use_carrier_sense && !self.channel_clear()? {
            let delay = self.timing.busy_defer(&mut self.rng, self.consecutive);

            self.consecutive = self.consecutive.saturating_add(1);
            self.stats.carrier_busy = self.stats.carrier_busy.saturating_add(1);

            debug!("Carrier busy at {} ms, deferring {} ms (defer #{})", now, delay, self.consecutive);

            self.schedule_sense(now, delay);
            return self.count_attempt(now);
        }

        if priority == Priority::High || self.timing.reserve(&mut self.rng) {
            self.transmit_reservation(now)?;
            return Ok(None);
        }

        let delay = self.timing.listen_delay(&mut self.rng);

        trace!("Channel clear, listening again for {} ms", delay);

        self.schedule_sense(now, delay);
        self.count_attempt(now)
    }

    fn count_attempt(&mut self, now: Ts) -> Result<Option<TxOutcome>, MacError<E>> {
        self.attempts = self.attempts.saturating_add(1);

        match self.config.max_sense_attempts {
            Some(max) if self.attempts >= max => {
                if let Some(p) = self.pending.take() {
                    warn!("Abandoning {} byte payload after {} sense attempts", p.payload.len(), self.attempts);
                }

                self.stats.abandoned = self.stats.abandoned.saturating_add(1);
                self.settle(now)?;

                Ok(Some(TxOutcome::Abandoned))
            },
            _ => Ok(None),
        }
    }

    fn transmit_reservation(&mut self, now: Ts) -> Result<(), MacError<E>> {
        let declared_ms = match self.pending.as_mut() {
            Some(p) => {
                p.declared_ms = self.timing.data_airtime_ms(p.payload.len());
                p.declared_ms
            },
            None => return Ok(()),
        };

        info!("Reserving channel for {} ms at {} ms", declared_ms, now);

        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = Frame::reservation(declared_ms).encode(&mut buff);

        self.state = ChannelState::Reserving;
        self.guard_until = None;

        self.start_transmit(now, &buff[..n])?;

        self.stats.tx_reservation = self.stats.tx_reservation.saturating_add(1);

        Ok(())
    }

    fn transmit_data(&mut self, now: Ts) -> Result<(), MacError<E>> {
        let mut buff = [0u8; MAX_FRAME_LEN];

        let n = match &self.pending {
            Some(p) => {
                debug_assert!(p.declared_ms >= self.timing.data_airtime_ms(p.payload.len()),
                    "reservation of {} ms does not cover data airtime", p.declared_ms);

                Frame::Data{ payload: p.payload.clone() }.encode(&mut buff)
            },
            None => return Ok(()),
        };

        debug!("Transmitting data at {} ms", now);

        self.state = ChannelState::TransmitData;
        self.guard_until = None;

        self.start_transmit(now, &buff[..n])
    }

    fn start_transmit(&mut self, now: Ts, data: &[u8]) -> Result<(), MacError<E>> {
        trace!("Transmitting ({} bytes): {:?}", data.len(), data);

        if let Err(e) = self.radio.start_transmit(data) {
            error!("Transmit failed at {} ms: {:?}", now, e);

            self.pending = None;
            self.transmitting = false;

            // Radio state is unknown after a failed transmit
            self.receiving = false;
            if let Err(se) = self.radio.set_state(S::idle()) {
                error!("Failed to idle radio: {:?}", se);
            }

            if let Err(se) = self.settle(now) {
                error!("Failed to restore receive: {:?}", se);
            }

            return Err(MacError::TransmitFailed(e));
        }

        self.receiving = false;
        self.transmitting = true;

        Ok(())
    }
}

impl <R, S, I, E, T, G> Mac for NavMac<R, S, I, E, T, G>
where
    R: Radio<S, I, E>,
    S: radio::RadioState,
    I: LinkInfo + Debug,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    type Error = MacError<E>;

    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        self.send_with_priority(payload, Priority::Normal)
    }

    fn receive(&mut self, data: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error> {
        let n = match self.rx_queue.front() {
            Some((payload, _)) => payload.len(),
            None => return Ok(None),
        };

        // Payloads are never truncated, the entry stays queued
        if n > data.len() {
            return Err(MacError::BufferTooSmall(n));
        }

        let (payload, info) = match self.rx_queue.pop_front() {
            Some(rx) => rx,
            None => return Ok(None),
        };

        data[..n].copy_from_slice(&payload);

        Ok(Some((n, info)))
    }

    fn busy(&self) -> bool {
        self.pending.is_some()
    }

    fn tick(&mut self) -> Result<Option<TxOutcome>, Self::Error> {
        let now = self.timer.ticks_ms();
        let mut outcome = None;

        trace!("Tick at {} ms state: {}", now, self.state);

        if self.transmitting && self.radio.check_transmit().map_err(MacError::Radio)? {
            outcome = outcome.or(self.handle(now, MacEvent::TransmitDone)?);
        }

        // NAV updates from a received frame land before any timer work
        if self.receiving && self.radio.check_receive(true).map_err(MacError::Radio)? {
            let mut buff = [0u8; MAX_FRAME_LEN];

            let (n, info) = self.radio.get_received(&mut buff).map_err(MacError::Radio)?;
            let n = n.min(buff.len());

            trace!("Received ({} bytes): {:?}", n, &buff[..n]);

            self.radio.start_receive().map_err(MacError::Radio)?;

            let info = RxInfo::from_info(&info);
            outcome = outcome.or(self.handle(now, MacEvent::Received(&buff[..n], info))?);
        }

        outcome = outcome.or(self.handle(now, MacEvent::Timer)?);

        Ok(outcome)
    }
}

#[cfg(test)]
mod test {
    use std::vec::Vec;

    use radio::BasicInfo;
    use radio::mock::*;
    use rand::rngs::mock::StepRng;

    use crate::config::{Preset, ConfigError};
    use crate::timer::mock::MockTimer;
    use super::*;

    fn config() -> Config {
        Config::from_preset(Preset::Testing, 2)
    }

    fn init_log() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
    }

    #[test]
    fn invalid_config_rejected() {
        let radio = MockRadio::new(&[]);
        let timer = MockTimer::new();

        let cfg = Config{ node_count: 0, ..config() };
        let mac = NavMac::new(cfg, radio, timer, StepRng::new(0, 0));

        assert!(matches!(mac, Err(MacError::InvalidConfig(ConfigError::NodeCount))));
    }

    #[test]
    fn receive_data_frame() {
        init_log();

        let mut radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        assert_eq!(mac.state(), ChannelState::Idle);

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.start_listening().unwrap();
        assert_eq!(mac.state(), ChannelState::AwaitData);

        let data: Vec<u8> = Frame::data(b"hello").unwrap().into();
        radio.expect(&[
            Transaction::check_receive(true, Ok(true)),
            Transaction::get_received(Ok((data, BasicInfo::default()))),
            Transaction::start_receive(None),
        ]);
        assert_eq!(mac.tick().unwrap(), None);
        radio.done();

        // Short buffers fail without losing the payload
        let mut short = [0u8; 3];
        assert!(matches!(mac.receive(&mut short), Err(MacError::BufferTooSmall(5))));

        let mut buff = [0u8; 64];
        let (n, _info) = mac.receive(&mut buff).unwrap().unwrap();
        assert_eq!(&buff[..n], b"hello");
        assert_eq!(mac.receive(&mut buff).unwrap(), None);

        assert_eq!(mac.stats().rx_data, 1);
        assert_eq!(mac.state(), ChannelState::AwaitData);
    }

    #[test]
    fn nav_is_monotonic() {
        init_log();

        let radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio, timer, StepRng::new(0, 0)).unwrap();

        let long: Vec<u8> = Frame::reservation(1_000).into();
        mac.handle(0, MacEvent::Received(&long, RxInfo::default())).unwrap();

        assert_eq!(mac.state(), ChannelState::NavDefer);
        let first = mac.nav_deadline();
        assert!(first >= 1_000);

        // Shorter reservation never shortens the wait
        let short: Vec<u8> = Frame::reservation(10).into();
        mac.handle(10, MacEvent::Received(&short, RxInfo::default())).unwrap();
        assert_eq!(mac.nav_deadline(), first);

        let longer: Vec<u8> = Frame::reservation(5_000).into();
        mac.handle(20, MacEvent::Received(&longer, RxInfo::default())).unwrap();
        assert!(mac.nav_deadline() >= 20 + 5_000);
        assert!(mac.nav_deadline() > first);

        assert_eq!(mac.stats().rx_reservation, 3);
        assert_eq!(mac.stats().nav_count, 3);

        // Expiry returns to rest
        let nav = mac.nav_deadline();
        mac.handle(nav - 1, MacEvent::Timer).unwrap();
        assert_eq!(mac.state(), ChannelState::NavDefer);

        mac.handle(nav, MacEvent::Timer).unwrap();
        assert_eq!(mac.state(), ChannelState::Idle);
    }

    #[test]
    fn malformed_frame_ignored() {
        let radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio, timer, StepRng::new(0, 0)).unwrap();

        mac.handle(0, MacEvent::Received(&[0x01], RxInfo::default())).unwrap();
        mac.handle(0, MacEvent::Received(&[0x02, 4, 0xaa], RxInfo::default())).unwrap();

        assert_eq!(mac.nav_deadline(), 0);
        assert_eq!(mac.state(), ChannelState::Idle);
        assert_eq!(mac.stats().rx_unparseable, 2);
        assert_eq!(mac.stats().rx_data, 0);

        let mut buff = [0u8; 16];
        assert_eq!(mac.receive(&mut buff).unwrap(), None);
    }

    #[test]
    fn send_during_nav_waits() {
        init_log();

        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.start_listening().unwrap();

        // Peer reservation sets NAV
        let res: Vec<u8> = Frame::reservation(1_000).into();
        radio.expect(&[
            Transaction::check_receive(true, Ok(true)),
            Transaction::get_received(Ok((res, BasicInfo::default()))),
            Transaction::start_receive(None),
        ]);
        mac.tick().unwrap();

        assert_eq!(mac.state(), ChannelState::NavDefer);
        let nav = mac.nav_deadline();

        timer.set_ms(10);
        mac.send(b"hello").unwrap();
        assert_eq!(mac.state(), ChannelState::NavDefer);

        // Silent for the remainder of the NAV
        for t in (100..nav).step_by(100) {
            timer.set_ms(t);

            radio.expect(&[
                Transaction::check_receive(true, Ok(false)),
            ]);
            assert_eq!(mac.tick().unwrap(), None);
            assert_eq!(mac.state(), ChannelState::NavDefer);
        }
        radio.done();

        // Expiry schedules a sense after the minimum listen delay
        timer.set_ms(nav);
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
        ]);
        mac.tick().unwrap();

        assert_eq!(mac.state(), ChannelState::Sensing);
        let sense_at = mac.next_wake().unwrap();
        assert_eq!(sense_at, nav + 100 + 5);

        // Clear channel, zero rng always reserves
        let declared = mac.timing().data_airtime_ms(5);
        let res: Vec<u8> = Frame::reservation(declared).into();

        timer.set_ms(sense_at);
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-120i16)),
            Transaction::start_transmit(res, None),
        ]);
        mac.tick().unwrap();

        assert_eq!(mac.state(), ChannelState::Reserving);
        assert_eq!(mac.stats().tx_reservation, 1);
        radio.done();

        // Reservation complete, receive through the guard interval
        let res_done = sense_at + mac.timing().reservation_airtime_ms() as u64;
        timer.set_ms(res_done);
        radio.expect(&[
            Transaction::check_transmit(Ok(true)),
            Transaction::start_receive(None),
            Transaction::check_receive(true, Ok(false)),
        ]);
        mac.tick().unwrap();

        let data_at = mac.next_wake().unwrap();
        assert_eq!(data_at, res_done + mac.timing().guard_ms() as u64);

        // Guard expiry sends data
        let data: Vec<u8> = Frame::data(b"hello").unwrap().into();
        timer.set_ms(data_at);
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::start_transmit(data, None),
        ]);
        mac.tick().unwrap();
        assert_eq!(mac.state(), ChannelState::TransmitData);

        timer.set_ms(data_at + declared as u64);
        radio.expect(&[
            Transaction::check_transmit(Ok(true)),
            Transaction::start_receive(None),
            Transaction::check_receive(true, Ok(false)),
        ]);
        assert_eq!(mac.tick().unwrap(), Some(TxOutcome::Sent));

        assert_eq!(mac.state(), ChannelState::AwaitData);
        assert_eq!(mac.stats().tx_data, 1);
        assert!(!mac.busy());

        radio.done();
    }

    #[test]
    fn second_send_rejected() {
        let mut radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.send(b"first").unwrap();
        assert_eq!(mac.state(), ChannelState::Sensing);
        assert!(mac.busy());

        assert!(matches!(mac.send(b"second"), Err(MacError::Busy)));
        assert_eq!(mac.pending(), Some(&b"first"[..]));

        radio.done();
    }

    #[test]
    fn receive_start_failure_drops_send() {
        let mut radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(Some(MockError::Timeout)),
        ]);
        assert!(matches!(mac.send(b"first"), Err(MacError::Radio(MockError::Timeout))));

        assert!(!mac.busy());
        assert_eq!(mac.pending(), None);
        assert_eq!(mac.state(), ChannelState::Idle);
        assert_eq!(mac.next_wake(), None);
        radio.done();

        // Node is usable again once the radio recovers
        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.send(b"second").unwrap();

        assert_eq!(mac.pending(), Some(&b"second"[..]));
        assert_eq!(mac.state(), ChannelState::Sensing);
        radio.done();
    }

    #[test]
    fn transmit_failure_promotes_backlog() {
        init_log();

        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();

        let cfg = Config{ send_policy: SendPolicy::Queue, ..config() };
        let mut mac = NavMac::new(cfg, radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.send(b"first").unwrap();
        mac.send(b"second").unwrap();
        radio.done();

        let declared = mac.timing().data_airtime_ms(5);
        let res: Vec<u8> = Frame::reservation(declared).into();

        timer.set_ms(mac.next_wake().unwrap());
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-120i16)),
            Transaction::start_transmit(res, Some(MockError::Timeout)),
            Transaction::set_state(MockState::Idle, None),
            Transaction::start_receive(None),
        ]);
        assert!(matches!(mac.tick(), Err(MacError::TransmitFailed(MockError::Timeout))));

        assert_eq!(mac.pending(), Some(&b"second"[..]));
        assert_eq!(mac.state(), ChannelState::Sensing);
        assert_eq!(mac.stats().tx_reservation, 0);
        radio.done();
    }

    #[test]
    fn transmit_failure_idles_radio() {
        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.send(b"hello").unwrap();

        let declared = mac.timing().data_airtime_ms(5);
        let res: Vec<u8> = Frame::reservation(declared).into();

        timer.set_ms(mac.next_wake().unwrap());
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-120i16)),
            Transaction::start_transmit(res, Some(MockError::Timeout)),
            Transaction::set_state(MockState::Idle, None),
        ]);
        assert!(matches!(mac.tick(), Err(MacError::TransmitFailed(MockError::Timeout))));

        assert!(!mac.busy());
        assert_eq!(mac.state(), ChannelState::Idle);
        radio.done();

        // Radio is idle, nothing to poll
        timer.set_ms(1_000_000);
        assert_eq!(mac.tick().unwrap(), None);
        radio.done();
    }

    #[test]
    fn stop_listening() {
        let mut radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
            Transaction::set_state(MockState::Idle, None),
        ]);
        mac.start_listening().unwrap();
        assert!(mac.is_listening());

        mac.stop_listening().unwrap();
        assert!(!mac.is_listening());
        assert_eq!(mac.state(), ChannelState::Idle);
        radio.done();

        // Pending send keeps the radio receiving
        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.start_listening().unwrap();
        mac.send(b"hello").unwrap();

        mac.stop_listening().unwrap();
        assert_eq!(mac.state(), ChannelState::Sensing);
        radio.done();

        // Radio released once nothing is left to send
        radio.expect(&[
            Transaction::set_state(MockState::Idle, None),
        ]);
        mac.cancel().unwrap();
        assert_eq!(mac.state(), ChannelState::Idle);
        radio.done();
    }

    #[test]
    fn competing_reservation_in_guard() {
        init_log();

        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.start_listening().unwrap();
        mac.send(b"hello").unwrap();

        let declared = mac.timing().data_airtime_ms(5);
        let res: Vec<u8> = Frame::reservation(declared).into();

        let sense_at = mac.next_wake().unwrap();
        timer.set_ms(sense_at);
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-120i16)),
            Transaction::start_transmit(res, None),
        ]);
        mac.tick().unwrap();
        assert_eq!(mac.state(), ChannelState::Reserving);

        // Peer reservation arrives as ours completes
        let res_done = sense_at + mac.timing().reservation_airtime_ms() as u64;
        let peer: Vec<u8> = Frame::reservation(2_000).into();
        timer.set_ms(res_done);
        radio.expect(&[
            Transaction::check_transmit(Ok(true)),
            Transaction::start_receive(None),
            Transaction::check_receive(true, Ok(true)),
            Transaction::get_received(Ok((peer, BasicInfo::default()))),
            Transaction::start_receive(None),
        ]);
        mac.tick().unwrap();

        assert_eq!(mac.state(), ChannelState::Reserving);
        assert!(mac.nav_deadline() >= res_done + 2_000);
        assert_eq!(mac.stats().nav_count, 1);

        // Data still goes out at the end of the guard interval
        let data_at = mac.next_wake().unwrap();
        let data: Vec<u8> = Frame::data(b"hello").unwrap().into();
        timer.set_ms(data_at);
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::start_transmit(data, None),
        ]);
        mac.tick().unwrap();
        assert_eq!(mac.state(), ChannelState::TransmitData);

        timer.set_ms(data_at + declared as u64);
        radio.expect(&[
            Transaction::check_transmit(Ok(true)),
            Transaction::start_receive(None),
            Transaction::check_receive(true, Ok(false)),
        ]);
        assert_eq!(mac.tick().unwrap(), Some(TxOutcome::Sent));

        // Then honours the peer's NAV
        assert_eq!(mac.state(), ChannelState::NavDefer);
        assert_eq!(mac.stats().tx_data, 1);
        radio.done();
    }

    #[test]
    fn oversize_send_rejected() {
        let radio = MockRadio::new(&[]);
        let timer = MockTimer::new();

        let cfg = Config{ max_payload_bytes: 16, ..config() };
        let mut mac = NavMac::new(cfg, radio, timer, StepRng::new(0, 0)).unwrap();

        assert!(matches!(mac.send(&[0u8; 17]), Err(MacError::PayloadTooLarge(17))));
        assert!(!mac.busy());
    }

    #[test]
    fn queue_policy() {
        let mut radio = MockRadio::new(&[]);
        let timer = MockTimer::new();

        let cfg = Config{ send_policy: SendPolicy::Queue, ..config() };
        let mut mac = NavMac::new(cfg, radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);

        mac.send(b"first").unwrap();
        for i in 0..BACKLOG_LEN as u8 {
            mac.send(&[i]).unwrap();
        }
        assert!(matches!(mac.send(b"overflow"), Err(MacError::Busy)));
        assert_eq!(mac.pending(), Some(&b"first"[..]));

        // Cancelling promotes the next queued payload
        let p = mac.cancel().unwrap();
        assert_eq!(p.as_deref(), Some(&b"first"[..]));
        assert_eq!(mac.pending(), Some(&[0u8][..]));
        assert_eq!(mac.state(), ChannelState::Sensing);

        radio.done();
    }

    #[test]
    fn cancel_while_sensing() {
        let mut radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
            Transaction::set_state(MockState::Idle, None),
        ]);

        mac.send(b"hello").unwrap();
        assert_eq!(mac.state(), ChannelState::Sensing);

        let p = mac.cancel().unwrap();
        assert_eq!(p.as_deref(), Some(&b"hello"[..]));
        assert_eq!(mac.state(), ChannelState::Idle);
        assert!(!mac.busy());

        assert_eq!(mac.cancel().unwrap(), None);

        radio.done();
    }

    #[test]
    fn high_priority_reserves_and_commits() {
        init_log();

        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();

        // Saturated rng never wins the coin flip
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(u64::MAX, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.send_with_priority(b"urgent", Priority::High).unwrap();

        let declared = mac.timing().data_airtime_ms(6);
        let res: Vec<u8> = Frame::reservation(declared).into();

        timer.set_ms(mac.next_wake().unwrap());
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-120i16)),
            Transaction::start_transmit(res, None),
        ]);
        mac.tick().unwrap();

        assert_eq!(mac.state(), ChannelState::Reserving);
        assert!(matches!(mac.cancel(), Err(MacError::Committed)));
        assert_eq!(mac.pending(), Some(&b"urgent"[..]));

        radio.done();
    }

    #[test]
    fn busy_carrier_defers() {
        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.send(b"hello").unwrap();

        let at = mac.next_wake().unwrap();
        timer.set_ms(at);
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-60i16)),
        ]);
        assert_eq!(mac.tick().unwrap(), None);

        assert_eq!(mac.state(), ChannelState::Sensing);
        assert_eq!(mac.stats().carrier_busy, 1);
        assert_eq!(mac.next_wake(), Some(at + mac.timing().listen_window_ms() as u64 + 5));

        radio.done();
    }

    #[test]
    fn abandon_after_sense_attempts() {
        let mut radio = MockRadio::new(&[]);
        let mut timer = MockTimer::new();

        let cfg = Config{ use_carrier_sense: false, max_sense_attempts: Some(2), ..config() };
        let mut mac = NavMac::new(cfg, radio.clone(), timer.clone(), StepRng::new(u64::MAX, 0)).unwrap();

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        mac.start_listening().unwrap();
        mac.send(b"hello").unwrap();

        timer.set_ms(mac.next_wake().unwrap());
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
        ]);
        assert_eq!(mac.tick().unwrap(), None);
        assert_eq!(mac.state(), ChannelState::Sensing);

        timer.set_ms(mac.next_wake().unwrap());
        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
        ]);
        assert_eq!(mac.tick().unwrap(), Some(TxOutcome::Abandoned));

        assert_eq!(mac.state(), ChannelState::AwaitData);
        assert_eq!(mac.stats().abandoned, 1);
        assert!(!mac.busy());

        radio.done();
    }

    #[test]
    #[cfg(feature = "alloc")]
    fn receive_callback() {
        use std::sync::{Arc, Mutex};

        let radio = MockRadio::new(&[]);
        let timer = MockTimer::new();
        let mut mac = NavMac::new(config(), radio, timer, StepRng::new(0, 0)).unwrap();

        let rx = Arc::new(Mutex::new(Vec::new()));
        let rx2 = rx.clone();
        mac.on_receive(move |data, info| {
            rx2.lock().unwrap().push((data.to_vec(), info));
        });

        let info = RxInfo{ rssi: -70, snr: 5 };
        let data: Vec<u8> = Frame::data(b"hello").unwrap().into();
        mac.handle(0, MacEvent::Received(&data, info)).unwrap();

        let rx = rx.lock().unwrap();
        assert_eq!(rx.len(), 1);
        assert_eq!(&rx[0].0[..], b"hello");
        assert_eq!(rx[0].1, info);

        let mut buff = [0u8; 16];
        assert_eq!(mac.receive(&mut buff).unwrap(), None);
    }
}
