//! Build a scheduler from a class tree config and print it.
//!
//! cargo run --example class_tree -- configs/three_class.yaml

use cbq::scheduler::cbq::ClassNode;
use cbq::{CbqConfig, CbqScheduler};
use color_eyre::eyre::{eyre, Report};

fn show(sch: &CbqScheduler, names: &[(String, cbq::ClassId)], node: &ClassNode, depth: usize) {
    let name = names
        .iter()
        .find(|(_, id)| *id == node.id())
        .map_or("?", |(n, _)| n.as_str());
    println!(
        "{:indent$}{} [{}] prio={} level={} quantum={} borrows={}",
        "",
        name,
        node.id(),
        node.priority(),
        node.level(),
        node.quantum(),
        node.borrow_target().map_or("-".to_owned(), |b| b.to_string()),
        indent = depth * 2,
    );

    for &c in node.children() {
        if let Some(child) = sch.class(c) {
            show(sch, names, child, depth + 1);
        }
    }
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| eyre!("usage: class_tree <config.yaml>"))?;
    let cfg = CbqConfig::from_file(&path)?;
    let (sch, names) = cfg.build(quanta::Clock::new())?;

    let root = sch
        .tree()
        .root()
        .and_then(|r| sch.class(r))
        .ok_or_else(|| eyre!("config has no root class"))?;
    println!("mtu {}", sch.mtu());
    show(&sch, &names, root, 0);
    if let Some(fb) = sch.tree().fallback() {
        println!("fallback {}", fb);
    }

    Ok(())
}
