/// DMA batch formation.
///
/// Groups the transfers between two synchronization points into blocks the
/// DMA engine fetches in one go, folding transfers that differ only in
/// their cluster into a single cluster broadcast.
use tracing::{debug, info};

use super::merge::address_key;
use crate::error::{Result, StreamError};
use crate::ir::{self, Segment, Transfer};

/// Segments that close a batch window and are emitted after it.
fn is_boundary(seg: &Segment) -> bool {
    matches!(seg, Segment::Sync(_) | Segment::Padding(_) | Segment::Scatter(_))
}

fn sort_key(seg: &Segment) -> (u64, u32, u32, u32) {
    match seg {
        Segment::Transfer(t) => address_key(t),
        Segment::Loop(l) => address_key(&l.base),
        _ => (0, 0, 0, 0),
    }
}

fn size_of(seg: &Segment) -> u32 {
    match seg {
        Segment::Transfer(t) => t.x_size as u32 * t.y_size as u32,
        Segment::Loop(l) => l.base.x_size as u32 * l.base.y_size as u32,
        _ => 0,
    }
}

/// Same transfer for a different, disjoint set of clusters.
fn cluster_sibling(a: &Transfer, b: &Transfer) -> bool {
    a.cluster & b.cluster == 0 && Transfer { cluster: 0, ..*a } == Transfer { cluster: 0, ..*b }
}

/// Transfers of one direction class between two boundaries.
#[derive(Default)]
struct Window {
    dma: Vec<Segment>,
    store: Option<bool>,
}

/// Accumulated batch up to the next boundary.
#[derive(Default)]
struct Pending {
    dma: Vec<Segment>,
    compute: Vec<Segment>,
}

struct Former {
    block_split: usize,
    out: Vec<Segment>,
    folded: usize,
    blocks: usize,
}

impl Former {
    /// Sort, fold cluster siblings, largest transfers first.
    fn close_window(&mut self, window: &mut Window, pending: &mut Pending) {
        let mut dma = std::mem::take(&mut window.dma);
        window.store = None;
        if dma.is_empty() {
            return;
        }
        dma.sort_by_key(sort_key);
        let mut folded: Vec<Segment> = Vec::with_capacity(dma.len());
        for seg in dma {
            if let (Some(Segment::Transfer(lst)), Segment::Transfer(it)) = (folded.last_mut(), &seg) {
                if cluster_sibling(lst, it) {
                    lst.cluster |= it.cluster;
                    self.folded += 1;
                    continue;
                }
            }
            folded.push(seg);
        }
        folded.sort_by_key(|s| std::cmp::Reverse(size_of(s)));
        pending.dma.extend(folded);
    }

    fn emit_block(&mut self, dma: Vec<Segment>) {
        if dma.is_empty() {
            return;
        }
        let count = ir::record_len(&dma) as u32;
        self.out.push(Segment::Block { count });
        self.out.extend(dma);
        self.blocks += 1;
    }

    fn flush(&mut self, pending: &mut Pending) {
        let mut dma = std::mem::take(&mut pending.dma);
        let compute = std::mem::take(&mut pending.compute);
        if compute.is_empty() {
            self.emit_block(dma);
        } else if dma.is_empty() {
            self.out.extend(compute);
        } else {
            let rest = dma.split_off(dma.len().min(self.block_split));
            debug!(first = dma.len(), rest = rest.len(), computes = compute.len(), "split batch");
            self.emit_block(dma);
            self.out.extend(compute);
            self.emit_block(rest);
        }
    }
}

/// Insert block markers and cluster broadcasts.
///
/// `block_split` is the number of transfers issued ahead of the compute
/// commands when a batch holds both.
pub fn form_blocks(segments: Vec<Segment>, block_split: usize) -> Result<Vec<Segment>> {
    let before = ir::count_elements(&segments);
    let records_in = ir::record_len(&segments);
    let mut former = Former {
        block_split,
        out: Vec::with_capacity(segments.len() + segments.len() / 4),
        folded: 0,
        blocks: 0,
    };
    let mut window = Window::default();
    let mut pending = Pending::default();

    for seg in segments {
        match seg {
            Segment::Transfer(_) | Segment::Loop(_) => {
                let store = seg.is_store();
                if window.store.is_some_and(|s| s != store) {
                    former.close_window(&mut window, &mut pending);
                }
                window.store = Some(store);
                window.dma.push(seg);
            }
            Segment::Compute(_) => pending.compute.push(seg),
            Segment::Block { .. } => {}
            boundary => {
                debug_assert!(is_boundary(&boundary));
                former.close_window(&mut window, &mut pending);
                former.flush(&mut pending);
                former.out.push(boundary);
            }
        }
    }
    former.close_window(&mut window, &mut pending);
    former.flush(&mut pending);

    let after = ir::count_elements(&former.out);
    if before != after {
        return Err(StreamError::ElementCountMismatch {
            pass: "blocks",
            before,
            after,
        });
    }
    info!(
        records_in,
        records_out = ir::record_len(&former.out),
        blocks = former.blocks,
        broadcasts = former.folded,
        "block formation"
    );
    Ok(former.out)
}
