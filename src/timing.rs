//! Airtime, reservation probability and backoff timing
//!
//! All durations derive from the static [`Config`] plus frame lengths,
//! random draws take an injected [`RngCore`] so tests can force outcomes.

use rand_core::RngCore;

use crate::config::Config;
use crate::frame::{DATA_HEADER_LEN, RESERVATION_LEN};

/// Small prime offsets added to random delays, these break up nodes that
/// happen to draw identical backoff values
pub const PRIME_OFFSETS_MS: [u32; 5] = [5, 7, 11, 13, 17];

/// Symbol durations above this (in us) require low data rate optimisation
const LDRO_SYMBOL_US: u64 = 16_000;

/// Modulation parameters used for airtime estimation
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoRaParams {
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    /// Coding rate denominator (5-8)
    pub coding_rate: u8,
    pub preamble_symbols: u16,
}

impl LoRaParams {
    pub fn from_config(c: &Config) -> Self {
        Self {
            spreading_factor: c.spreading_factor,
            bandwidth_hz: c.bandwidth_hz,
            coding_rate: c.coding_rate,
            preamble_symbols: c.preamble_symbols,
        }
    }

    /// Whether low data rate optimisation is in use
    pub fn low_data_rate(&self) -> bool {
        (1u64 << self.spreading_factor) * 1_000_000 > LDRO_SYMBOL_US * self.bandwidth_hz as u64
    }

    /// Convert quarter-symbols to microseconds, rounding up
    fn quarters_to_us(&self, quarters: u64) -> u64 {
        let num = quarters * (1u64 << self.spreading_factor) * 1_000_000;
        let den = 4 * self.bandwidth_hz as u64;
        (num + den - 1) / den
    }

    /// Preamble duration (preamble symbols + 4.25 sync symbols) in quarter-symbols
    fn preamble_quarters(&self) -> u64 {
        self.preamble_symbols as u64 * 4 + 17
    }

    /// Duration of the preamble and sync word in microseconds
    pub fn preamble_us(&self) -> u64 {
        self.quarters_to_us(self.preamble_quarters())
    }
}

/// Estimate time on air in microseconds for a frame of `len` bytes
/// (explicit header, CRC enabled).
///
/// Every step rounds up so the estimate is never shorter than the real frame.
pub fn estimate_airtime_us(len: usize, p: &LoRaParams) -> u64 {
    let sf = p.spreading_factor as i64;
    let de = if p.low_data_rate() { 1 } else { 0 };

    let num = 8 * len as i64 - 4 * sf + 28 + 16;
    let den = 4 * (sf - 2 * de);

    let blocks = if num > 0 { (num + den - 1) / den } else { 0 };
    let payload_symbols = 8 + blocks as u64 * p.coding_rate as u64;

    p.quarters_to_us(p.preamble_quarters() + payload_symbols * 4)
}

/// Estimate time on air in whole milliseconds, rounded up
pub fn estimate_airtime_ms(len: usize, p: &LoRaParams) -> u32 {
    let us = estimate_airtime_us(len, p);
    ((us + 999) / 1000).min(u32::MAX as u64) as u32
}

/// Fraction of clear senses that escalate to a reservation for a population
pub fn reservation_probability(node_count: u32) -> f32 {
    match node_count {
        0..=50 => 0.10,
        51..=200 => 0.08,
        _ => 0.05,
    }
}

/// Backoff window width (in DIFS units) for a population
pub fn backoff_window(node_count: u32) -> u32 {
    match node_count {
        0..=50 => 7,
        51..=200 => 15,
        _ => 23,
    }
}

/// Uniform draw in `[lo, hi]`
pub fn uniform<G: RngCore>(rng: &mut G, lo: u32, hi: u32) -> u32 {
    if hi <= lo {
        return lo;
    }

    let span = (hi - lo) as u64 + 1;
    lo + (rng.next_u32() as u64 % span) as u32
}

/// Bernoulli draw with probability `p`
pub fn coin<G: RngCore>(rng: &mut G, p: f32) -> bool {
    (rng.next_u32() as f64 / 4_294_967_296.0) < p as f64
}

/// Scale a delay by the consecutive deferral multiplier `min(1 + 0.3n, 2.5)`
pub fn scale_deferral(ms: u32, consecutive: u32) -> u32 {
    let tenths = 10u64.saturating_add(3 * consecutive as u64).min(25);
    clamp_ms(ms as u64 * tenths / 10)
}

fn clamp_ms(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

/// Timing engine, resolved once from a validated configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    params: LoRaParams,
    probability: f32,
    window: u32,
    difs_ms: u32,
    guard_ms: u32,
    reservation_airtime_ms: u32,
}

impl Timing {
    pub fn new(config: &Config) -> Self {
        let params = LoRaParams::from_config(config);

        let difs_ms = match config.difs_ms {
            Some(d) => d,
            None => clamp_ms((params.preamble_us() + 999) / 1000),
        };

        Self {
            params,
            probability: config.reservation_probability_override
                .unwrap_or_else(|| reservation_probability(config.node_count)),
            window: config.backoff_window_override
                .unwrap_or_else(|| backoff_window(config.node_count)),
            difs_ms,
            guard_ms: config.guard_ms.unwrap_or(difs_ms),
            reservation_airtime_ms: estimate_airtime_ms(RESERVATION_LEN, &params),
        }
    }

    pub fn params(&self) -> &LoRaParams {
        &self.params
    }

    /// Probability of escalating a clear sense to a reservation
    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Backoff window in DIFS units
    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn difs_ms(&self) -> u32 {
        self.difs_ms
    }

    /// Delay between the end of a reservation and the start of data
    pub fn guard_ms(&self) -> u32 {
        self.guard_ms
    }

    pub fn reservation_airtime_ms(&self) -> u32 {
        self.reservation_airtime_ms
    }

    /// Airtime of a data frame carrying `payload_len` bytes
    pub fn data_airtime_ms(&self, payload_len: usize) -> u32 {
        estimate_airtime_ms(DATA_HEADER_LEN + payload_len, &self.params)
    }

    /// Jitter window for listen-again and initial send delays
    pub fn backoff_range(&self) -> (u32, u32) {
        (self.difs_ms, self.window.saturating_mul(self.difs_ms))
    }

    /// Time for a full contention round to play out
    pub fn listen_window_ms(&self) -> u32 {
        self.window.saturating_mul(self.difs_ms).saturating_add(self.reservation_airtime_ms)
    }

    pub fn prime_offset<G: RngCore>(&self, rng: &mut G) -> u32 {
        PRIME_OFFSETS_MS[rng.next_u32() as usize % PRIME_OFFSETS_MS.len()]
    }

    /// Draw whether a clear sense escalates to a reservation
    pub fn reserve<G: RngCore>(&self, rng: &mut G) -> bool {
        coin(rng, self.probability)
    }

    /// Delay before sensing again after declining to reserve
    pub fn listen_delay<G: RngCore>(&self, rng: &mut G) -> u32 {
        let (lo, hi) = self.backoff_range();
        uniform(rng, lo, hi).saturating_add(self.prime_offset(rng))
    }

    /// Delay before sensing again after finding the carrier busy
    pub fn busy_defer<G: RngCore>(&self, rng: &mut G, consecutive: u32) -> u32 {
        let lw = self.listen_window_ms();
        let base = uniform(rng, lw, lw.saturating_mul(3));
        scale_deferral(base, consecutive).saturating_add(self.prime_offset(rng))
    }

    /// NAV length for a reservation declaring `declared_ms` of data airtime.
    ///
    /// Always at least `declared_ms + guard_ms`.
    pub fn nav_duration<G: RngCore>(&self, rng: &mut G, declared_ms: u32, consecutive: u32) -> u32 {
        let base = declared_ms as u64 + self.guard_ms as u64 + self.prime_offset(rng) as u64;
        let jitter = base * uniform(rng, 5, 15) as u64 / 100;

        scale_deferral(clamp_ms(base + jitter), consecutive)
    }
}
