use std::collections::HashMap;

use cbq::config::ClassCfg;
use cbq::{CbqConfig, CbqScheduler, Link, Pkt};
use color_eyre::{
    eyre::{eyre, Report},
    Help,
};
use rand::Rng;
use structopt::StructOpt;
use tracing::{info, warn};

#[derive(StructOpt, Debug)]
#[structopt(name = "cbq")]
struct Opt {
    #[structopt(short, long)]
    cfg: std::path::PathBuf,

    #[structopt(short, long)]
    rate_bytes_per_sec: Option<usize>,

    /// Number of synthetic packets to push through the link.
    #[structopt(short, long, default_value = "10000")]
    num_packets: usize,
}

/// A packet that the config's classifier maps to class `c`, if any does.
fn tag_for(c: &ClassCfg, idx: usize) -> Option<([u8; 4], u16)> {
    let tag = 50_000 + idx as u16;
    if let Some(port) = c.dport {
        Some(([10, 255, 255, 254], port))
    } else if let Some(ip) = c.ips.first() {
        Some((ip.to_be_bytes(), tag))
    } else if c.fallback {
        Some(([10, 255, 255, 254], tag))
    } else {
        None
    }
}

fn make_pkt(dst: [u8; 4], dport: u16, len: usize) -> Pkt {
    Pkt::new(
        etherparse::Ipv4Header::new(
            len as u16,
            64,
            etherparse::IpNumber::Udp,
            [10, 0, 0, 1],
            dst,
        ),
        4242,
        dport,
        vec![0u8; len],
    )
}

pub fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let cfg = CbqConfig::from_file(&opt.cfg)?;

    let mut targets = Vec::new();
    for (idx, c) in cfg.root.walk().into_iter().enumerate() {
        if !c.children.is_empty() {
            continue;
        }

        match tag_for(c, idx) {
            Some(t) => targets.push((c.name.clone(), t)),
            None => warn!(class = %c.name, "no rule reaches class, not generating traffic for it"),
        }
    }

    if targets.is_empty() {
        return Err(eyre!("no leaf class is reachable"))
            .note("give leaf classes a dport or ips, or mark one as fallback");
    }

    let clk = quanta::Clock::new();
    let sch: CbqScheduler = CbqScheduler::from_config(&cfg, clk.clone())?;
    let (out_s, out_r) = flume::unbounded();
    let mut link = Link::new(sch, clk.clone(), out_s);
    if let Some(rate) = opt.rate_bytes_per_sec {
        link = link.with_pacing(rate);
    }

    let (s, jh) = link.start();
    let counter = std::thread::spawn(move || {
        let mut bytes: HashMap<([u8; 4], u16), usize> = HashMap::new();
        for p in out_r.iter() {
            *bytes.entry((p.hdr().destination, p.dport())).or_default() += p.len();
        }

        bytes
    });

    let start = clk.now();
    let mut rng = rand::thread_rng();
    for _ in 0..opt.num_packets {
        let (_, (dst, dport)) = &targets[rng.gen_range(0..targets.len())];
        let len = rng.gen_range(64..=cfg.mtu as usize);
        s.send(make_pkt(*dst, *dport, len))
            .map_err(|_| eyre!("link stopped early"))?;
    }
    drop(s);

    let sch = jh.join().map_err(|_| eyre!("link thread panicked"))??;
    let bytes = counter
        .join()
        .map_err(|_| eyre!("counter thread panicked"))?;
    let el = clk.now().saturating_duration_since(start);
    let total: usize = bytes.values().sum();
    info!(?el, total_bytes = total, stats = ?sch.stats(), "done");

    for (name, tag) in &targets {
        let b = bytes.get(tag).copied().unwrap_or_default();
        let share = if total > 0 { b as f64 / total as f64 } else { 0. };
        info!(class = %name, bytes = b, ?share, "class share");
    }

    Ok(())
}
