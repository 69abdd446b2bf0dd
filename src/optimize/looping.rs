/// Loop extraction.
///
/// Replaces runs of same-shaped transfers whose addresses and target masks
/// progress regularly with one loop transfer. Masks are compared against
/// the first transfer of the candidate run: the shift that maps the base
/// mask onto a later one tells which counter (inter-unit, unit or cluster)
/// advanced.
use tracing::{debug, info, warn};

use super::{attempt, Attempt};
use crate::error::{Result, StreamError};
use crate::ir::{self, LoopTransfer, Segment, Transfer};

/// Trailing zeros with an empty mask counting as 32.
fn trailing_zeros(mask: u32) -> i32 {
    mask.trailing_zeros() as i32
}

/// Signed host address step from `from` to `to`, if it fits an `i64`.
fn host_delta(from: u64, to: u64) -> Option<i64> {
    i64::try_from(to as i128 - from as i128).ok()
}

/// Shift that turns `base` into `other`, if `other` is a shifted copy.
pub fn mask_shift(base: u32, other: u32) -> Option<i32> {
    let shift = trailing_zeros(other) - trailing_zeros(base);
    let shifted_back = if shift >= 0 {
        other.checked_shr(shift as u32).unwrap_or(0)
    } else {
        other.checked_shl(shift.unsigned_abs()).unwrap_or(0)
    };
    (shifted_back == base).then_some(shift)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    InterUnit,
    Unit,
    Cluster,
}

/// A candidate run being grown one transfer at a time.
struct LoopBuilder {
    list: Vec<Transfer>,
    mm_incr: i64,
    lm_incr: i64,
    cluster_len: u32,
    unit_len: u32,
    inter_unit_len: u32,
    cluster_shift: Option<i32>,
    unit_shift: Option<i32>,
    cluster_last: i32,
    unit_last: i32,
    level: Level,
}

impl LoopBuilder {
    fn start(base: Transfer, second: Transfer) -> Option<Self> {
        let cs = mask_shift(base.cluster, second.cluster)?;
        let us = mask_shift(base.unit_mask, second.unit_mask)?;
        let mm_incr = host_delta(base.mm_addr, second.mm_addr)?;
        let mut builder = Self {
            list: vec![base, second],
            mm_incr,
            lm_incr: second.lm_addr as i64 - base.lm_addr as i64,
            cluster_len: 0,
            unit_len: 0,
            inter_unit_len: 0,
            cluster_shift: None,
            unit_shift: None,
            cluster_last: cs,
            unit_last: us,
            level: Level::InterUnit,
        };
        if cs == 0 && us == 0 {
            builder.inter_unit_len = 1;
        } else if cs == 0 {
            builder.unit_len = 1;
            builder.level = Level::Unit;
        } else {
            builder.cluster_len = 1;
            builder.level = Level::Cluster;
        }
        builder.note_shifts(cs, us);
        Some(builder)
    }

    fn note_shifts(&mut self, cs: i32, us: i32) {
        if cs != 0 && self.cluster_shift.is_none() {
            self.cluster_shift = Some(cs);
        }
        if cs == 0 && us != 0 && self.unit_shift.is_none() {
            self.unit_shift = Some(us);
        }
    }

    /// Try to append `next`; false leaves the builder unusable for `next`.
    fn push(&mut self, next: Transfer) -> bool {
        let base = self.list[0];
        let previous = self.list[self.list.len() - 1];
        let (Some(cs), Some(us)) = (
            mask_shift(base.cluster, next.cluster),
            mask_shift(base.unit_mask, next.unit_mask),
        ) else {
            return false;
        };
        if host_delta(previous.mm_addr, next.mm_addr) != Some(self.mm_incr) {
            return false;
        }

        if self.level == Level::InterUnit && cs == 0 && us == 0 {
            if self.lm_incr != next.lm_addr as i64 - previous.lm_addr as i64 {
                return false;
            }
            self.inter_unit_len += 1;
        } else if self.level == Level::InterUnit {
            self.level = Level::Unit;
        }

        if self.level == Level::Unit && cs == 0 && us != 0 && us != self.unit_last {
            // units advance in the direction of the first unit shift
            let direction = self.unit_shift.unwrap_or(us).signum();
            if (us - self.unit_last).signum() != direction {
                return false;
            }
            self.unit_last = us;
            self.unit_len += 1;
        } else if self.level == Level::Unit && cs != 0 {
            self.level = Level::Cluster;
        }

        if self.level == Level::Cluster && cs != 0 && cs != self.cluster_last {
            self.cluster_last = cs;
            self.cluster_len += 1;
        }

        self.note_shifts(cs, us);
        self.list.push(next);
        true
    }

    /// Encode the collected parameters, if every field fits.
    fn build(&self) -> std::result::Result<LoopTransfer, String> {
        let byte = |what: &str, v: u32| u8::try_from(v).map_err(|_| format!("{} {} exceeds 255", what, v));
        let shift = |v: Option<i32>| i8::try_from(v.unwrap_or(0)).map_err(|_| "mask shift out of range".to_string());
        // The local increment is never observed without inter-unit iterations.
        let lm_incr = if self.inter_unit_len == 0 { 0 } else { self.lm_incr };
        if !(LoopTransfer::LM_INCR_MIN as i64..=LoopTransfer::LM_INCR_MAX as i64).contains(&lm_incr) {
            return Err(format!("lm increment {} does not fit 13 bits", lm_incr));
        }
        Ok(LoopTransfer {
            cluster_len: byte("cluster length", self.cluster_len)?,
            cluster_shift: shift(self.cluster_shift)?,
            unit_len: byte("unit length", self.unit_len)?,
            unit_shift: shift(self.unit_shift)?,
            inter_unit_len: byte("inter-unit length", self.inter_unit_len)?,
            lm_incr: lm_incr as i16,
            mm_incr: i32::try_from(self.mm_incr).map_err(|_| format!("mm increment {} does not fit", self.mm_incr))?,
            count: u16::try_from(self.list.len()).map_err(|_| format!("{} transfers exceed the loop count", self.list.len()))?,
            base: self.list[0],
        })
    }
}

#[derive(Default)]
struct Extractor {
    min_len: usize,
    out: Vec<Segment>,
    loops: usize,
    encoded: usize,
    rejected: usize,
}

impl Extractor {
    fn emit_plain(&mut self, list: Vec<Transfer>) {
        self.out.extend(list.into_iter().map(Segment::Transfer));
    }

    fn finish(&mut self, builder: LoopBuilder) {
        if builder.list.len() < self.min_len {
            debug!(len = builder.list.len(), min = self.min_len, "run too short for a loop");
            self.emit_plain(builder.list);
            return;
        }
        let original: Vec<Segment> = builder.list.iter().copied().map(Segment::Transfer).collect();
        let outcome = attempt(
            original,
            |_| builder.build().map(|l| vec![Segment::Loop(l)]),
            |original, candidate| {
                if ir::unroll(candidate) == *original {
                    Ok(())
                } else {
                    Err("expansion does not reproduce the run".to_string())
                }
            },
        );
        match outcome {
            Attempt::Committed(segments) => {
                if let Some(Segment::Loop(l)) = segments.first() {
                    debug!(loop_transfer = %l, "loop accepted");
                }
                self.loops += 1;
                self.encoded += builder.list.len();
                self.out.extend(segments);
            }
            Attempt::Rejected { original, reason } => {
                warn!(len = original.len(), %reason, "loop candidate rejected, keeping transfers");
                self.rejected += 1;
                self.out.extend(original);
            }
        }
    }

    fn run(&mut self, run: Vec<Transfer>) {
        let mut iter = run.into_iter();
        let Some(mut base) = iter.next() else {
            return;
        };
        let mut builder: Option<LoopBuilder> = None;
        for next in iter {
            match builder.as_mut() {
                Some(b) => {
                    if !b.push(next) {
                        if let Some(done) = builder.take() {
                            self.finish(done);
                        }
                        base = next;
                    }
                }
                None => match LoopBuilder::start(base, next) {
                    Some(b) => builder = Some(b),
                    None => {
                        self.out.push(Segment::Transfer(base));
                        base = next;
                    }
                },
            }
        }
        match builder {
            Some(b) => self.finish(b),
            None => self.out.push(Segment::Transfer(base)),
        }
    }
}

/// Replace regular transfer runs by loop transfers.
///
/// Runs shorter than `min_len` and candidates whose expansion does not
/// reproduce the run are kept as individual transfers.
pub fn extract_loops(segments: Vec<Segment>, min_len: usize) -> Result<Vec<Segment>> {
    let input = ir::unrolled_len(&segments);
    let before = ir::count_elements(&segments);
    let records_in = ir::record_len(&segments);
    let mut ex = Extractor {
        min_len: min_len.max(2),
        out: Vec::with_capacity(segments.len()),
        ..Extractor::default()
    };

    let mut run: Vec<Transfer> = Vec::new();
    for seg in segments {
        match seg {
            Segment::Transfer(t) if run.last().map_or(true, |p| p.same_shape(&t)) => run.push(t),
            Segment::Transfer(t) => {
                ex.run(std::mem::take(&mut run));
                run.push(t);
            }
            other => {
                ex.run(std::mem::take(&mut run));
                ex.out.push(other);
            }
        }
    }
    ex.run(run);

    let mut out = ex.out;
    ir::refresh_block_counts(&mut out);

    let unrolled = ir::unrolled_len(&out);
    if unrolled != input {
        return Err(StreamError::UnrolledLengthMismatch {
            pass: "loops",
            input,
            unrolled,
        });
    }
    let after = ir::count_elements(&out);
    if after != before {
        return Err(StreamError::ElementCountMismatch {
            pass: "loops",
            before,
            after,
        });
    }
    info!(
        records_in,
        records_out = ir::record_len(&out),
        loops = ex.loops,
        encoded = ex.encoded,
        rejected = ex.rejected,
        "loop extraction"
    );
    Ok(out)
}
