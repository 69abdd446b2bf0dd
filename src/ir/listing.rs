//! Human-readable one-line-per-segment rendering.

use std::fmt;

use super::{Compute, LoopTransfer, Segment, SyncKind, Transfer};

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cluster {:#b} unit {:#b} mm {:#010x} lm {:#06x} x {} y {} leap {}",
            self.direction.name(),
            self.cluster,
            self.unit_mask,
            self.mm_addr,
            self.lm_addr,
            self.x_size,
            self.y_size,
            self.y_leap,
        )?;
        if !self.padding.is_empty() {
            let p = self.padding.0;
            write!(f, " pad trbl {}{}{}{}", p & 1, (p >> 1) & 1, (p >> 2) & 1, (p >> 3) & 1)?;
        }
        if self.skipped != 0 {
            write!(f, " skip {}", self.skipped)?;
        }
        if self.bias_offset {
            write!(f, " bias")?;
        }
        if self.kernel_offset {
            write!(f, " kernel")?;
        }
        Ok(())
    }
}

impl fmt::Display for LoopTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loop x{} cluster {}/{:+} unit {}/{:+} inter {} lm {:+} mm {:+} | {}",
            self.count,
            self.cluster_len,
            self.cluster_shift,
            self.unit_len,
            self.unit_shift,
            self.inter_unit_len,
            self.lm_incr,
            self.mm_incr,
            self.base,
        )
    }
}

impl fmt::Display for Compute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compute {:?} lane {:#b} buffer {} end {}x{}x{} offset {} shr {}",
            self.op, self.lane, self.buffer, self.xend, self.yend, self.zend, self.offset, self.shift_right,
        )?;
        if self.nops != 0 {
            write!(f, " nops {}", self.nops)?;
        }
        Ok(())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Transfer(t) => write!(f, "{}", t),
            Segment::Loop(l) => write!(f, "{}", l),
            Segment::Compute(c) => write!(f, "{}", c),
            Segment::Block { count } => write!(f, "block {}", count),
            Segment::Sync(SyncKind::Dma) => write!(f, "wait dma"),
            Segment::Sync(SyncKind::Lanes) => write!(f, "wait lanes"),
            Segment::Sync(SyncKind::Both) => write!(f, "sync"),
            Segment::Padding(p) => write!(
                f,
                "padding top {} left {} bottom {} right {} value {}",
                p.top, p.left, p.bottom, p.right, p.value
            ),
            Segment::Scatter(s) => write!(
                f,
                "scatter coords {:#x} features {:#x} grid {:#x} size {} shift {} via {}",
                s.mm_addr_coords,
                s.mm_addr_features,
                s.mm_addr_grid,
                s.memcopy_size,
                s.index_shift,
                if s.use_vpro_dma { "dma" } else { "cpu" },
            ),
        }
    }
}

/// Numbered listing, one segment per line.
pub fn listing(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        out.push_str(&format!("{:<5} {}\n", i, seg));
    }
    out
}
