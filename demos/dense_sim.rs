//! Dense network simulation
//!
//! Runs a population of reservation MACs over a simulated shared channel
//! and reports per-node and medium statistics.
//
// Copyright 2021 Ryan Kurte

use log::{debug, info, warn};

use structopt::StructOpt;
use humantime::Duration;

use rand::{rngs::StdRng, SeedableRng};

use lora_nav_mac::prelude::*;
use lora_nav_mac::sim::Network;


#[derive(Debug, StructOpt)]
struct Options {

    #[structopt(long, default_value = "dense")]
    /// Deployment preset (dense, testing, long-range, low-power)
    pub preset: Preset,

    #[structopt(long, default_value = "20")]
    /// Number of simulated nodes
    pub nodes: u32,

    #[structopt(long)]
    /// Expected population used for density tiers (defaults to --nodes)
    pub node_count: Option<u32>,

    #[structopt(long, default_value = "3")]
    /// Messages sent by each node
    pub messages: u32,

    #[structopt(long, default_value = "32")]
    /// Payload length in bytes
    pub payload_len: usize,

    #[structopt(long, default_value = "2h")]
    /// Simulated time limit
    pub limit: Duration,

    #[structopt(long, default_value = "1")]
    /// Base RNG seed
    pub seed: u64,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}


fn main() -> anyhow::Result<()> {
    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("lora_nav_mac::sim")
        .build();
    let _ = simplelog::SimpleLogger::init(opts.log_level, log_cfg);

    let config = Config::from_preset(opts.preset, opts.node_count.unwrap_or(opts.nodes));
    config.validate().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    if opts.payload_len > config.max_payload_bytes {
        return Err(anyhow::anyhow!("Payload length {} exceeds maximum {}", opts.payload_len, config.max_payload_bytes));
    }

    let timing = Timing::new(&config);
    info!("Preset {}: SF{} DIFS {} ms W {} p {} data airtime {} ms",
        opts.preset, config.spreading_factor, timing.difs_ms(), timing.window(),
        timing.probability(), timing.data_airtime_ms(opts.payload_len));

    let mut net = Network::new(LoRaParams::from_config(&config));

    for i in 0..opts.nodes as u64 {
        let n = net.add_node(config.clone(), StdRng::seed_from_u64(opts.seed + i))
            .map_err(|e| anyhow::anyhow!("Error initialising node {}: {:?}", i, e))?;

        if let Some(mac) = net.node_mut(n) {
            mac.start_listening().map_err(|e| anyhow::anyhow!("Listen error: {:?}", e))?;
        }
    }

    let limit = opts.limit.as_millis() as u64;
    let mut remaining = vec![opts.messages; opts.nodes as usize];
    let mut received = vec![0u32; opts.nodes as usize];
    let mut buff = [0u8; 256];

    info!("Starting simulation of {} nodes", opts.nodes);

    loop {
        // Queue the next message on idle nodes
        for (i, mac) in net.nodes_mut().iter_mut().enumerate() {
            if remaining[i] > 0 && !mac.busy() {
                let payload = vec![i as u8; opts.payload_len];
                mac.send(&payload).map_err(|e| anyhow::anyhow!("Send error: {:?}", e))?;
                remaining[i] -= 1;
            }

            while let Some((n, info)) = mac.receive(&mut buff).map_err(|e| anyhow::anyhow!("Receive error: {:?}", e))? {
                debug!("Node {} received {} bytes (rssi: {})", i, n, info.rssi);
                received[i] += 1;
            }
        }

        let now = match net.step().map_err(|e| anyhow::anyhow!("MAC error: {:?}", e))? {
            Some(t) => t,
            None => break,
        };

        if now > limit {
            warn!("Simulation time limit reached at {}", humantime::format_duration(std::time::Duration::from_millis(now)));
            break;
        }
    }

    let elapsed = std::time::Duration::from_millis(net.now());
    info!("Simulation complete after {} simulated", humantime::format_duration(elapsed));

    let mut sent = 0;
    for (i, mac) in net.nodes().iter().enumerate() {
        let s = mac.stats();
        sent += s.tx_data;

        info!("Node {:3}: tx {} rx {} res tx/rx {}/{} nav {} busy {} abandoned {} efficiency {}",
            i, s.tx_data, received[i], s.tx_reservation, s.rx_reservation, s.nav_count,
            s.carrier_busy, s.abandoned,
            s.efficiency().map(|e| format!("{:.1}%", e)).unwrap_or_else(|| "-".to_string()));
    }

    let m = net.medium().stats();
    info!("Sent {} of {} messages, {} frames on air, {} delivered, {} lost to collision",
        sent, opts.nodes * opts.messages, m.frames, m.delivered, m.collisions);

    Ok(())
}
