//! Command stream optimization.
//!
//! Each pass consumes one owned segment list and returns a new one. The
//! per-layer pipeline runs:
//!
//!   preconditions → merge → blocks → merge → split stores → loops → balance
//!
//! Passes that may find a local region unsafe to rewrite go through
//! [`attempt`], which keeps the original region when the candidate fails
//! verification.

pub mod balance;
pub mod block;
pub mod looping;
pub mod merge;
pub mod split;

use rayon::prelude::*;
use tracing::{debug, info, info_span};

use crate::blob::Net;
use crate::config::{CompilerConfig, HardwareConfig};
use crate::error::{Result, StreamError};
use crate::ir::{self, Layer, PadConfig, PadFlags, Segment, Transfer};

pub use balance::balance;
pub use block::form_blocks;
pub use looping::extract_loops;
pub use merge::merge;
pub use split::split_stores;

// ─── Verify-then-commit ────────────────────────────────────────────

/// Outcome of a guarded rewrite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    Committed(T),
    Rejected { original: T, reason: String },
}

impl<T> Attempt<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Attempt::Committed(_))
    }

    /// The committed value, or the original on rejection.
    pub fn into_inner(self) -> T {
        match self {
            Attempt::Committed(value) => value,
            Attempt::Rejected { original, .. } => original,
        }
    }
}

/// Run `transform` on `original` and keep the result only if `verify`
/// accepts it against the input.
pub fn attempt<T>(
    original: T,
    transform: impl FnOnce(&T) -> std::result::Result<T, String>,
    verify: impl FnOnce(&T, &T) -> std::result::Result<(), String>,
) -> Attempt<T> {
    let candidate = match transform(&original) {
        Ok(candidate) => candidate,
        Err(reason) => return Attempt::Rejected { original, reason },
    };
    match verify(&original, &candidate) {
        Ok(()) => Attempt::Committed(candidate),
        Err(reason) => Attempt::Rejected { original, reason },
    }
}

// ─── Runs ──────────────────────────────────────────────────────────

/// Apply `f` to every maximal run of consecutive plain transfers whose
/// neighbours satisfy `joins`. Every other segment is a barrier and stays
/// in place.
pub(crate) fn rewrite_runs(
    segments: Vec<Segment>,
    joins: impl Fn(&Transfer, &Transfer) -> bool,
    mut f: impl FnMut(Vec<Transfer>) -> Vec<Transfer>,
) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    let mut run: Vec<Transfer> = Vec::new();
    for seg in segments {
        match seg {
            Segment::Transfer(t) => {
                if run.last().is_some_and(|p| !joins(p, &t)) {
                    out.extend(f(std::mem::take(&mut run)).into_iter().map(Segment::Transfer));
                }
                run.push(t);
            }
            other => {
                if !run.is_empty() {
                    out.extend(f(std::mem::take(&mut run)).into_iter().map(Segment::Transfer));
                }
                out.push(other);
            }
        }
    }
    if !run.is_empty() {
        out.extend(f(run).into_iter().map(Segment::Transfer));
    }
    out
}

// ─── Preconditions ─────────────────────────────────────────────────

fn check_padding(index: usize, t: &Transfer, pad: &PadConfig) -> Result<()> {
    let width = |edge: u8, value: i32| if t.padding.has(edge) { value.max(0) as u32 } else { 0 };
    let horizontal = width(PadFlags::LEFT, pad.left) + width(PadFlags::RIGHT, pad.right);
    let vertical = width(PadFlags::TOP, pad.top) + width(PadFlags::BOTTOM, pad.bottom);
    if horizontal > t.x_size as u32 {
        return Err(StreamError::PaddingExceedsTransfer {
            index,
            detail: format!("{} padded columns, x size {}", horizontal, t.x_size),
        });
    }
    if vertical > t.y_size as u32 {
        return Err(StreamError::PaddingExceedsTransfer {
            index,
            detail: format!("{} padded rows, y size {}", vertical, t.y_size),
        });
    }
    Ok(())
}

fn check_masks(index: usize, t: &Transfer, hw: &HardwareConfig) -> Result<()> {
    if t.cluster & !hw.cluster_mask() != 0 {
        return Err(StreamError::MaskOutOfRange {
            index,
            what: "cluster",
            mask: t.cluster,
            limit: hw.clusters,
        });
    }
    if t.unit_mask & !hw.unit_mask() != 0 {
        return Err(StreamError::MaskOutOfRange {
            index,
            what: "unit",
            mask: t.unit_mask,
            limit: hw.units,
        });
    }
    Ok(())
}

/// Reject streams the hardware cannot execute.
///
/// `pad` is the padding configuration in effect at the start of the
/// stream; padding commands inside the stream replace it.
pub fn check_preconditions(segments: &[Segment], hw: &HardwareConfig, pad: PadConfig) -> Result<()> {
    let mut pad = pad;
    for (index, seg) in segments.iter().enumerate() {
        let t = match seg {
            Segment::Transfer(t) => t,
            Segment::Loop(l) => &l.base,
            Segment::Padding(p) => {
                pad = *p;
                continue;
            }
            _ => continue,
        };
        check_masks(index, t, hw)?;
        if !t.padding.is_empty() {
            check_padding(index, t, &pad)?;
        }
    }
    Ok(())
}

/// Everything a finished layer must satisfy before it reaches hardware:
/// masks and padding within the configuration, and consistent blocks.
pub fn validate_layer(layer: &Layer, hw: &HardwareConfig) -> Result<()> {
    check_preconditions(&layer.segments, hw, layer.params.pad)?;
    ir::check_blocks(&layer.segments)
}

/// [`validate_layer`] over every layer of a network.
pub fn validate_net(net: &Net, hw: &HardwareConfig) -> Result<()> {
    net.layers.iter().try_for_each(|layer| validate_layer(layer, hw))
}

// ─── Pipeline ──────────────────────────────────────────────────────

/// Record counts around one pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassStats {
    pub name: &'static str,
    pub records_in: usize,
    pub records_out: usize,
    pub elements: u64,
}

impl PassStats {
    /// Wire bytes removed by the stage.
    pub fn bytes_saved(&self) -> i64 {
        (self.records_in as i64 - self.records_out as i64) * ir::wire::RECORD_SIZE as i64
    }
}

fn stage(
    name: &'static str,
    segments: Vec<Segment>,
    stats: &mut Vec<PassStats>,
    pass: impl FnOnce(Vec<Segment>) -> Result<Vec<Segment>>,
) -> Result<Vec<Segment>> {
    let span = info_span!("pass", pass = name);
    let _enter = span.enter();
    let records_in = ir::record_len(&segments);
    let out = pass(segments)?;
    ir::check_blocks(&out)?;
    let entry = PassStats {
        name,
        records_in,
        records_out: ir::record_len(&out),
        elements: ir::count_elements(&out),
    };
    debug!(records_in, records_out = entry.records_out, bytes_saved = entry.bytes_saved(), "stage done");
    stats.push(entry);
    Ok(out)
}

/// Optimize one layer's stream; also returns the per-stage statistics.
pub fn compile_with_stats(
    segments: Vec<Segment>,
    pad: PadConfig,
    cfg: &CompilerConfig,
) -> Result<(Vec<Segment>, Vec<PassStats>)> {
    let p = &cfg.pipeline;
    let max_elements = cfg.hardware.max_transfer_elements;
    check_preconditions(&segments, &cfg.hardware, pad)?;

    let mut stats = Vec::new();
    let mut s = segments;
    if p.merge {
        s = stage("merge", s, &mut stats, |s| merge(s, max_elements))?;
    }
    if p.blocks {
        s = stage("blocks", s, &mut stats, |s| form_blocks(s, p.block_split))?;
        if p.merge {
            s = stage("merge", s, &mut stats, |s| merge(s, max_elements))?;
        }
    }
    if p.split_stores {
        s = stage("split", s, &mut stats, split_stores)?;
    }
    if p.loops {
        s = stage("loops", s, &mut stats, |s| extract_loops(s, p.min_loop_len))?;
    }
    if p.balance {
        s = stage("balance", s, &mut stats, |s| Ok(balance(s, p.balance_loads)))?;
    }
    Ok((s, stats))
}

/// Optimize one layer's stream with no padding configured up front.
pub fn compile(segments: Vec<Segment>, cfg: &CompilerConfig) -> Result<Vec<Segment>> {
    compile_with_stats(segments, PadConfig::default(), cfg).map(|(s, _)| s)
}

/// Optimize a layer, starting from the padding its header configures.
pub fn compile_layer(layer: &Layer, cfg: &CompilerConfig) -> Result<(Layer, Vec<PassStats>)> {
    let span = info_span!("layer", number = layer.params.number);
    let _enter = span.enter();
    let (segments, stats) = compile_with_stats(layer.segments.clone(), layer.params.pad, cfg)?;
    Ok((Layer::new(layer.params.clone(), segments), stats))
}

/// Optimize every layer of a network. Layers are independent and compile
/// in parallel; the first failing layer aborts the whole network.
pub fn compile_net(net: &Net, cfg: &CompilerConfig) -> Result<(Net, Vec<Vec<PassStats>>)> {
    let compiled: Vec<(Layer, Vec<PassStats>)> = net
        .layers
        .par_iter()
        .map(|layer| compile_layer(layer, cfg))
        .collect::<Result<_>>()?;
    let records_in: usize = net.layers.iter().map(|l| ir::record_len(&l.segments)).sum();
    let (layers, stats): (Vec<Layer>, Vec<Vec<PassStats>>) = compiled.into_iter().unzip();
    let records_out: usize = layers.iter().map(|l| ir::record_len(&l.segments)).sum();
    info!(layers = layers.len(), records_in, records_out, "network compiled");
    Ok((
        Net {
            layers,
            exec_list: net.exec_list.clone(),
        },
        stats,
    ))
}

#[cfg(test)]
mod tests;
