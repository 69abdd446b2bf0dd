/// Transfer merger.
///
/// Coalesces adjacent transfers into fewer, larger ones: drops exact
/// duplicates, turns gapless 2D transfers into 1D ones, trims the
/// over-fetched tail of 1D transfers and concatenates transfers whose host
/// and local regions continue each other. Only neighbours in the stream are
/// ever combined, so every other segment acts as a barrier.
use tracing::{debug, info};

use super::rewrite_runs;
use crate::error::{Result, StreamError};
use crate::ir::{self, Segment, Transfer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub duplicates: usize,
    pub flattened: usize,
    pub merged_1d: usize,
    pub merged_2d: usize,
}

/// Run the merger over a whole stream.
///
/// `max_elements` bounds the size of a 2D transfer that is flattened.
pub fn merge(segments: Vec<Segment>, max_elements: u32) -> Result<Vec<Segment>> {
    merge_with_stats(segments, max_elements).map(|(out, _)| out)
}

pub fn merge_with_stats(segments: Vec<Segment>, max_elements: u32) -> Result<(Vec<Segment>, MergeStats)> {
    let before = ir::count_elements(&segments);
    let records_in = ir::record_len(&segments);
    let mut stats = MergeStats::default();
    let mut dropped = 0u64;

    let mut s = rewrite_runs(segments, same_class, |run| sorted(run, host_order_key));
    s = drop_duplicates(s, &mut stats, &mut dropped);
    s = flatten_2d(s, max_elements, &mut stats);
    s = trim_discards(s)?;
    s = concat_1d(s, &mut stats);
    s = concat_2d(s, &mut stats);

    s = rewrite_runs(s, same_class, |run| sorted(run, local_order_key));
    s = drop_duplicates(s, &mut stats, &mut dropped);
    s = flatten_2d(s, max_elements, &mut stats);
    s = concat_1d(s, &mut stats);
    s = concat_2d(s, &mut stats);

    let after = ir::count_elements(&s);
    if before - dropped != after {
        return Err(StreamError::ElementCountMismatch {
            pass: "merge",
            before: before - dropped,
            after,
        });
    }

    s = rewrite_runs(s, same_class, |run| sorted(run, address_key));
    ir::refresh_block_counts(&mut s);

    let records_out = ir::record_len(&s);
    info!(
        records_in,
        records_out,
        duplicates = stats.duplicates,
        flattened = stats.flattened,
        merged_1d = stats.merged_1d,
        merged_2d = stats.merged_2d,
        "transfer merge"
    );
    Ok((s, stats))
}

fn same_class(a: &Transfer, b: &Transfer) -> bool {
    a.direction.is_store() == b.direction.is_store()
}

fn sorted<K: Ord>(mut run: Vec<Transfer>, key: fn(&Transfer) -> K) -> Vec<Transfer> {
    run.sort_by_key(key);
    run
}

fn host_order_key(t: &Transfer) -> (u32, u32, u64, u32) {
    (t.cluster, t.unit_mask, t.mm_addr, t.lm_addr)
}

fn local_order_key(t: &Transfer) -> (u32, u32, u32, u64) {
    (t.cluster, t.unit_mask, t.lm_addr, t.mm_addr)
}

/// Host address first, the order the loop extractor expects.
pub(crate) fn address_key(t: &Transfer) -> (u64, u32, u32, u32) {
    (t.mm_addr, t.lm_addr, t.unit_mask, t.cluster)
}

// ─── Rewrites ──────────────────────────────────────────────────────

/// Equal in everything the hardware looks at.
fn same_command(a: &Transfer, b: &Transfer) -> bool {
    Transfer { skipped: 0, ..*a } == Transfer { skipped: 0, ..*b }
}

fn drop_duplicates(segments: Vec<Segment>, stats: &mut MergeStats, dropped: &mut u64) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let (Some(Segment::Transfer(lst)), Segment::Transfer(it)) = (out.last(), &seg) {
            if same_command(lst, it) {
                debug!(transfer = %it, "dropping duplicate transfer");
                *dropped += it.elements();
                stats.duplicates += 1;
                continue;
            }
        }
        out.push(seg);
    }
    out
}

fn flattenable(t: &Transfer, max_elements: u32) -> bool {
    t.y_size > 1
        && t.y_leap == 1
        && t.padding.is_empty()
        && t.x_size as u32 * t.y_size as u32 <= max_elements.min(u16::MAX as u32)
}

fn flatten_2d(segments: Vec<Segment>, max_elements: u32, stats: &mut MergeStats) -> Vec<Segment> {
    segments
        .into_iter()
        .map(|seg| match seg {
            Segment::Transfer(t) if t.direction.is_2d() => {
                if flattenable(&t, max_elements) {
                    stats.flattened += 1;
                    Segment::Transfer(Transfer {
                        direction: t.direction.to_1d(),
                        x_size: t.x_size * t.y_size,
                        y_size: 1,
                        ..t
                    })
                } else if t.y_size == 1 {
                    Segment::Transfer(Transfer {
                        direction: t.direction.to_1d(),
                        ..t
                    })
                } else {
                    seg
                }
            }
            other => other,
        })
        .collect()
}

/// Drop the over-fetched tail of 1D transfers. Runs after flattening, so a
/// 2D transfer still carrying a discard count cannot be expressed.
fn trim_discards(segments: Vec<Segment>) -> Result<Vec<Segment>> {
    segments
        .into_iter()
        .enumerate()
        .map(|(index, seg)| match seg {
            Segment::Transfer(t) if t.skipped != 0 => {
                if t.direction.is_2d() {
                    return Err(StreamError::DiscardOn2d {
                        index,
                        skipped: t.skipped,
                    });
                }
                Ok(Segment::Transfer(Transfer {
                    x_size: t.x_size.saturating_sub(t.skipped as u16),
                    skipped: 0,
                    ..t
                }))
            }
            other => Ok(other),
        })
        .collect()
}

/// Fold each transfer into its predecessor when `join` allows it.
fn fold_adjacent(
    segments: Vec<Segment>,
    join: impl Fn(&Transfer, &Transfer) -> Option<Transfer>,
) -> (Vec<Segment>, usize) {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    let mut merges = 0;
    for seg in segments {
        if let (Some(Segment::Transfer(lst)), Segment::Transfer(it)) = (out.last_mut(), &seg) {
            if let Some(joined) = join(lst, it) {
                *lst = joined;
                merges += 1;
                continue;
            }
        }
        out.push(seg);
    }
    (out, merges)
}

fn same_target(a: &Transfer, b: &Transfer) -> bool {
    a.direction == b.direction
        && a.bias_offset == b.bias_offset
        && a.kernel_offset == b.kernel_offset
        && a.cluster == b.cluster
        && a.unit_mask == b.unit_mask
        && a.padding == b.padding
        && a.skipped == 0
        && b.skipped == 0
}

/// `second` starts where `first` ends, in host and local memory.
fn continues(first: &Transfer, second: &Transfer) -> bool {
    first.mm_addr.checked_add(first.host_span()) == Some(second.mm_addr)
        && first.lm_addr.checked_add(first.local_span()) == Some(second.lm_addr)
}

fn join_1d(lst: &Transfer, it: &Transfer) -> Option<Transfer> {
    if lst.direction.is_2d() || !same_target(lst, it) {
        return None;
    }
    let x_size = u16::try_from(lst.x_size as u32 + it.x_size as u32).ok()?;
    if continues(lst, it) {
        Some(Transfer { x_size, ..*lst })
    } else if continues(it, lst) {
        Some(Transfer {
            x_size,
            mm_addr: it.mm_addr,
            lm_addr: it.lm_addr,
            ..*lst
        })
    } else {
        None
    }
}

fn join_2d(lst: &Transfer, it: &Transfer) -> Option<Transfer> {
    if !lst.direction.is_2d() || !same_target(lst, it) || lst.y_leap != it.y_leap || lst.x_size != it.x_size {
        return None;
    }
    let y_size = u16::try_from(lst.y_size as u32 + it.y_size as u32).ok()?;
    if continues(lst, it) {
        Some(Transfer { y_size, ..*lst })
    } else if continues(it, lst) {
        Some(Transfer {
            y_size,
            mm_addr: it.mm_addr,
            lm_addr: it.lm_addr,
            ..*lst
        })
    } else {
        None
    }
}

fn concat_1d(segments: Vec<Segment>, stats: &mut MergeStats) -> Vec<Segment> {
    let (out, merges) = fold_adjacent(segments, join_1d);
    stats.merged_1d += merges;
    out
}

fn concat_2d(segments: Vec<Segment>, stats: &mut MergeStats) -> Vec<Segment> {
    let (out, merges) = fold_adjacent(segments, join_2d);
    stats.merged_2d += merges;
    out
}
