/// Engine load balancing.
///
/// Each cluster owns a DMA engine. Runs sorted by address hand the
/// transfers of one cluster to the hardware back to back; interleaving them
/// cluster by cluster spreads the work over all engines. Only the order
/// changes.
use std::collections::BTreeMap;

use tracing::info;

use super::rewrite_runs;
use crate::ir::{Segment, Transfer};

/// Round-robin over per-cluster queues, each keeping its relative order.
pub fn interleave(run: Vec<Transfer>) -> Vec<Transfer> {
    let mut queues: BTreeMap<u32, std::collections::VecDeque<Transfer>> = BTreeMap::new();
    let len = run.len();
    for t in run {
        queues.entry(t.cluster).or_default().push_back(t);
    }
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        for queue in queues.values_mut() {
            if let Some(t) = queue.pop_front() {
                out.push(t);
            }
        }
    }
    out
}

/// Interleave every run of same-direction transfers.
///
/// Load runs keep their order unless `include_loads` is set.
pub fn balance(segments: Vec<Segment>, include_loads: bool) -> Vec<Segment> {
    let mut reordered = 0usize;
    let out = rewrite_runs(
        segments,
        |a, b| a.direction == b.direction,
        |run| {
            if run.len() < 2 || !(include_loads || run[0].direction.is_store()) {
                return run;
            }
            let mixed = interleave(run.clone());
            if mixed != run {
                reordered += 1;
            }
            mixed
        },
    );
    info!(runs = reordered, include_loads, "engine load balance");
    out
}
