/// Store splitting.
///
/// A batch of result stores normally drains completely before the next
/// loads start. The splitter spreads those stores over the blocks that
/// follow, up to the next batch that stores again, so that stores overlap
/// with the loads and compute of later steps.
use tracing::{debug, info, warn};

use super::{attempt, Attempt};
use crate::error::Result;
use crate::ir::{self, Segment, Transfer};

/// Whether the block marker at `index` covers at least one store.
fn block_has_store(segments: &[Segment], index: usize) -> Result<bool> {
    Ok(ir::block_body(segments, index)?.iter().any(Segment::is_store))
}

/// Order stores so that consecutive ones target different clusters.
///
/// Buckets by the highest cluster bit, latest host address first within a
/// bucket, then takes one store per bucket in turn.
pub fn resort_stores(stores: Vec<Transfer>) -> Vec<Transfer> {
    let mut buckets: Vec<Vec<Transfer>> = vec![Vec::new(); 32];
    let len = stores.len();
    for t in stores {
        let bucket = 31u32.saturating_sub(t.cluster.leading_zeros()) as usize;
        buckets[bucket].push(t);
    }
    for bucket in &mut buckets {
        // popped from the back
        bucket.sort_by_key(|t| t.mm_addr);
    }
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        for bucket in &mut buckets {
            if let Some(t) = bucket.pop() {
                out.push(t);
            }
        }
    }
    out
}

/// Redistribute the stores of the span's first block over all its blocks.
fn split_span(span: &[Segment]) -> std::result::Result<Vec<Segment>, String> {
    if span.iter().any(|s| matches!(s, Segment::Loop(_))) {
        return Err("span contains loop transfers".to_string());
    }
    let stores: Vec<Transfer> = span
        .iter()
        .filter(|s| s.is_store())
        .filter_map(|s| s.as_transfer().copied())
        .collect();
    let leading = span[1..].iter().take_while(|s| s.is_store()).count();
    if leading != stores.len() {
        return Err("stores are not contiguous at the front of the first block".to_string());
    }

    let mut others: Vec<Segment> = span.iter().filter(|s| !s.is_store()).copied().collect();
    let blocks = others.iter().filter(|s| matches!(s, Segment::Block { .. })).count();
    let per_block = stores.len().div_ceil(blocks.max(1));
    let mut pending = resort_stores(stores).into_iter();

    let mut out = Vec::with_capacity(span.len());
    for seg in others.drain(..) {
        let is_block = matches!(seg, Segment::Block { .. });
        out.push(seg);
        if is_block {
            out.extend(pending.by_ref().take(per_block).map(Segment::Transfer));
        }
    }
    ir::refresh_block_counts(&mut out);
    debug!(blocks, per_block, "stores split");
    Ok(out)
}

fn same_stores(original: &[Segment], candidate: &[Segment]) -> bool {
    let mut a: Vec<Transfer> = original.iter().filter_map(Segment::as_transfer).copied().collect();
    let mut b: Vec<Transfer> = candidate.iter().filter_map(Segment::as_transfer).copied().collect();
    let key = |t: &Transfer| (t.direction, t.mm_addr, t.lm_addr, t.cluster, t.unit_mask, t.x_size, t.y_size);
    a.sort_by_key(key);
    b.sort_by_key(key);
    a == b
}

/// Spread store batches over the following blocks.
///
/// A span starts at a block that stores and ends before the next such
/// block. Spans whose stores are not all at the front of their first block
/// are left unchanged.
pub fn split_stores(segments: Vec<Segment>) -> Result<Vec<Segment>> {
    let mut starts = Vec::new();
    for (index, seg) in segments.iter().enumerate() {
        if let Segment::Block { .. } = seg {
            if block_has_store(&segments, index)? {
                starts.push(index);
            }
        }
    }
    let Some(&first) = starts.first() else {
        return Ok(segments);
    };

    let mut out = Vec::with_capacity(segments.len());
    out.extend_from_slice(&segments[..first]);
    let (mut split, mut kept) = (0usize, 0usize);
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(segments.len());
        let span = segments[start..end].to_vec();
        let outcome = attempt(
            span,
            |span| split_span(span),
            |original, candidate| {
                ir::check_blocks(candidate).map_err(|e| e.to_string())?;
                if ir::count_elements(original) != ir::count_elements(candidate) || !same_stores(original, candidate) {
                    return Err("store set changed".to_string());
                }
                Ok(())
            },
        );
        match outcome {
            Attempt::Committed(span) => {
                split += 1;
                out.extend(span);
            }
            Attempt::Rejected { original, reason } => {
                warn!(at = start, %reason, "store split skipped");
                kept += 1;
                out.extend(original);
            }
        }
    }
    info!(spans = starts.len(), split, kept, "store split");
    Ok(out)
}
