//! YAML description of a CBQ class tree.

use std::time::Duration;

use color_eyre::eyre::{bail, ensure, eyre, Report, WrapErr};
use yaml_rust::{yaml::Hash, Yaml};

use crate::scheduler::cbq::{ClassSpec, RateTable};
use crate::scheduler::classify::Match;
use crate::scheduler::{CbqScheduler, Fifo, InnerQueue, RuleClassifier, TokenBucket};
use crate::time::TimeSource;
use crate::ClassId;

pub const DEFAULT_MTU: u32 = 1500;

/// One class and its subtree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassCfg {
    pub name: String,
    pub priority: u8,
    /// Relative quantum.
    pub weight: u32,
    pub rate_bytes_per_sec: Option<u64>,
    /// Pace the class's own queue with a token bucket at this rate.
    pub shape_bytes_per_sec: Option<u64>,
    pub filter_log: Option<u8>,
    pub max_idle: Option<Duration>,
    pub min_idle: Option<Duration>,
    pub extra_delay: Option<Duration>,
    pub bounded: bool,
    pub fallback: bool,
    pub queue_limit_bytes: Option<usize>,
    pub dport: Option<u16>,
    pub ips: Vec<u32>,
    pub children: Vec<ClassCfg>,
}

impl ClassCfg {
    pub fn new(name: impl Into<String>, priority: u8, weight: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            weight,
            rate_bytes_per_sec: None,
            shape_bytes_per_sec: None,
            filter_log: None,
            max_idle: None,
            min_idle: None,
            extra_delay: None,
            bounded: false,
            fallback: false,
            queue_limit_bytes: None,
            dport: None,
            ips: Vec::new(),
            children: Vec::new(),
        }
    }

    /// This class followed by its descendants, depth first.
    pub fn walk(&self) -> Vec<&ClassCfg> {
        let mut v = vec![self];
        for c in &self.children {
            v.extend(c.walk());
        }

        v
    }
}

/// A class tree for one link.
///
/// # Example
/// ```yaml
/// mtu: 1500
/// root:
///   name: link
///   priority: 7
///   weight: 1
///   rate_bytes_per_sec: 1250000
///   children:
///     - name: ssh
///       dport: 22
///       priority: 0
///       weight: 1
///       rate_bytes_per_sec: 125000
///     - name: bulk
///       ips: ["10.0.0.2"]
///       priority: 1
///       weight: 3
///       bounded: true
///       fallback: true
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CbqConfig {
    pub mtu: u32,
    pub root: ClassCfg,
}

pub fn parse_ip(ip: &str) -> Result<u32, Report> {
    let ip: Vec<_> = ip.split('.').collect();
    ensure!(ip.len() == 4, "ip must be a.b.c.d");
    let (a, b, c, d) = match &ip[..] {
        &[a, b, c, d] => (a.parse()?, b.parse()?, c.parse()?, d.parse()?),
        _ => unreachable!(),
    };

    Ok(u32::from_be_bytes([a, b, c, d]))
}

fn key(k: &str) -> Yaml {
    Yaml::String(k.to_owned())
}

fn take_uint(node: &mut Hash, k: &str) -> Result<Option<u64>, Report> {
    node.remove(&key(k))
        .map(|v| {
            v.into_i64()
                .filter(|&i| i >= 0)
                .map(|i| i as u64)
                .ok_or_else(|| eyre!("{} must be a non-negative integer", k))
        })
        .transpose()
}

fn take_narrow<N: TryFrom<u64>>(node: &mut Hash, k: &str) -> Result<Option<N>, Report> {
    take_uint(node, k)?
        .map(|v| N::try_from(v).map_err(|_| eyre!("{} out of range: {}", k, v)))
        .transpose()
}

fn take_micros(node: &mut Hash, k: &str) -> Result<Option<Duration>, Report> {
    Ok(take_uint(node, k)?.map(Duration::from_micros))
}

fn take_bool(node: &mut Hash, k: &str) -> Result<bool, Report> {
    node.remove(&key(k))
        .map(|v| v.into_bool().ok_or_else(|| eyre!("{} must be a bool", k)))
        .transpose()
        .map(|b| b.unwrap_or(false))
}

fn class_from_yaml(yaml: Yaml) -> Result<ClassCfg, Report> {
    let mut node = yaml
        .into_hash()
        .ok_or_else(|| eyre!("Class must be dictionary"))?;
    let name = node
        .remove(&key("name"))
        .ok_or_else(|| eyre!("Need name key"))?
        .into_string()
        .ok_or_else(|| eyre!("name must be a string"))?;
    let priority = take_narrow(&mut node, "priority")
        .and_then(|p| p.ok_or_else(|| eyre!("Need priority key")))
        .wrap_err_with(|| format!("class {}", name))?;
    let weight = take_narrow(&mut node, "weight")
        .and_then(|w| w.ok_or_else(|| eyre!("Need weight key")))
        .wrap_err_with(|| format!("class {}", name))?;

    let mut cfg = ClassCfg::new(name, priority, weight);
    class_options(&mut cfg, node).wrap_err_with(|| format!("class {}", cfg.name))?;
    Ok(cfg)
}

fn class_options(cfg: &mut ClassCfg, mut node: Hash) -> Result<(), Report> {
    cfg.rate_bytes_per_sec = take_uint(&mut node, "rate_bytes_per_sec")?;
    cfg.shape_bytes_per_sec = take_uint(&mut node, "shape_bytes_per_sec")?;
    cfg.filter_log = take_narrow(&mut node, "filter_log")?;
    cfg.max_idle = take_micros(&mut node, "max_idle_us")?;
    cfg.min_idle = take_micros(&mut node, "min_idle_us")?;
    cfg.extra_delay = take_micros(&mut node, "extra_delay_us")?;
    cfg.bounded = take_bool(&mut node, "bounded")?;
    cfg.fallback = take_bool(&mut node, "fallback")?;
    cfg.queue_limit_bytes = take_narrow(&mut node, "queue_limit_bytes")?;
    cfg.dport = take_narrow(&mut node, "dport")?;

    if let Some(ips) = node.remove(&key("ips")) {
        cfg.ips = ips
            .into_vec()
            .ok_or_else(|| eyre!("ips must be string array"))?
            .into_iter()
            .map(|ip_yaml| {
                let ip_str = ip_yaml
                    .into_string()
                    .ok_or_else(|| eyre!("ip must be a string"))?;
                parse_ip(&ip_str)
            })
            .collect::<Result<_, Report>>()?;
    }

    if let Some(children) = node.remove(&key("children")) {
        cfg.children = children
            .into_vec()
            .ok_or_else(|| eyre!("children must be a list of classes"))?
            .into_iter()
            .map(class_from_yaml)
            .collect::<Result<_, Report>>()?;
    }

    if let Some((k, _)) = node.into_iter().next() {
        bail!("Unknown key {:?}", k);
    }

    Ok(())
}

impl CbqConfig {
    pub fn from_file(file: impl AsRef<std::path::Path>) -> Result<Self, Report> {
        let cfg_str = std::fs::read_to_string(file.as_ref())
            .wrap_err(eyre!("Could not read {:?}", file.as_ref()))?;
        Self::from_str(&cfg_str)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(cfg: &str) -> Result<Self, Report> {
        let yaml =
            yaml_rust::YamlLoader::load_from_str(cfg).wrap_err(eyre!("Error reading {:?}", cfg))?;
        ensure!(yaml.len() == 1, "Class cfg needs exactly one document");
        let mut top = yaml
            .into_iter()
            .next()
            .and_then(Yaml::into_hash)
            .ok_or_else(|| eyre!("Need dictionary structure"))?;

        let mtu = take_narrow(&mut top, "mtu")?.unwrap_or(DEFAULT_MTU);
        ensure!(mtu > 0, "mtu must be positive");
        let root = top
            .remove(&key("root"))
            .ok_or_else(|| eyre!("Toplevel key must be `root`"))?;
        if let Some((k, _)) = top.into_iter().next() {
            bail!("Unknown toplevel key {:?}", k);
        }

        let root = class_from_yaml(root)?;

        let classes = root.walk();
        let mut names: Vec<_> = classes.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            bail!("Duplicate class name {}", w[0]);
        }

        ensure!(
            classes.iter().filter(|c| c.fallback).count() <= 1,
            "At most one fallback class"
        );

        Ok(Self { mtu, root })
    }

    /// Build the scheduler, and return the ids of the classes by name.
    pub fn build<T>(&self, clock: T) -> Result<(CbqScheduler<T>, Vec<(String, ClassId)>), Report>
    where
        T: TimeSource + Clone + 'static,
    {
        let mut sch = CbqScheduler::new(clock.clone(), self.mtu);
        let mut rules = RuleClassifier::new();
        let mut names = Vec::new();
        self.attach(&mut sch, &clock, None, &self.root, &mut rules, &mut names)?;
        sch.set_classifier(rules);
        Ok((sch, names))
    }

    fn attach<T>(
        &self,
        sch: &mut CbqScheduler<T>,
        clock: &T,
        parent: Option<ClassId>,
        c: &ClassCfg,
        rules: &mut RuleClassifier,
        names: &mut Vec<(String, ClassId)>,
    ) -> Result<(), Report>
    where
        T: TimeSource + Clone + 'static,
    {
        let mut spec = ClassSpec::new(c.priority, c.weight);
        if let Some(r) = c.rate_bytes_per_sec {
            spec = spec.rate(RateTable::from_rate(r, self.mtu)?);
        }
        if let Some(f) = c.filter_log {
            spec = spec.filter_log(f);
        }
        if let Some(d) = c.max_idle {
            spec = spec.max_idle(d);
        }
        if let Some(d) = c.min_idle {
            spec = spec.min_idle(d);
        }
        if let Some(d) = c.extra_delay {
            spec = spec.extra_delay(d);
        }
        if c.bounded {
            spec = spec.bounded();
        }

        let limit = c
            .queue_limit_bytes
            .unwrap_or(100 * self.mtu as usize);
        let q: Box<dyn InnerQueue> = match c.shape_bytes_per_sec {
            Some(r) => Box::new(TokenBucket::new(
                clock.clone(),
                r as usize,
                self.mtu as usize,
                limit,
            )),
            None => Box::new(Fifo::new(limit)),
        };
        spec = spec.inner_queue(q);

        let id = sch
            .attach_class(parent, spec)
            .wrap_err_with(|| eyre!("Could not attach class {}", c.name))?;
        if let Some(port) = c.dport {
            rules.add_rule(Match::Dport(port), id);
        }
        for &ip in &c.ips {
            rules.add_rule(Match::DstIp(ip), id);
        }
        if c.fallback {
            sch.set_fallback_class(id)?;
        }
        names.push((c.name.clone(), id));

        for child in &c.children {
            self.attach(sch, clock, Some(id), child, rules, names)?;
        }

        Ok(())
    }
}

impl<T: TimeSource + Clone + 'static> CbqScheduler<T> {
    pub fn from_config(cfg: &CbqConfig, clock: T) -> Result<Self, Report> {
        cfg.build(clock).map(|(sch, _)| sch)
    }
}
