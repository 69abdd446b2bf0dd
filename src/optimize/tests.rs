use std::collections::HashMap;

use proptest::prelude::*;

use super::*;
use crate::ir::{Compute, Direction, LoopTransfer, Opcode, SyncKind};

fn load(cluster: u32, unit: u32, mm: u64, lm: u32, len: u16) -> Segment {
    Segment::Transfer(Transfer::load_1d(cluster, unit, mm, lm, len))
}

fn store(cluster: u32, unit: u32, mm: u64, lm: u32, len: u16) -> Segment {
    Segment::Transfer(Transfer::store_1d(cluster, unit, mm, lm, len))
}

fn compute() -> Segment {
    Segment::Compute(Compute::new(Opcode::ConvStart))
}

fn transfers(segments: &[Segment]) -> Vec<Transfer> {
    segments.iter().filter_map(Segment::as_transfer).copied().collect()
}

fn syncs(segments: &[Segment]) -> Vec<Segment> {
    segments
        .iter()
        .filter(|s| matches!(s, Segment::Sync(_) | Segment::Padding(_) | Segment::Scatter(_)))
        .copied()
        .collect()
}

fn multiset(list: &[Transfer]) -> HashMap<Transfer, usize> {
    let mut counts = HashMap::new();
    for t in list {
        *counts.entry(*t).or_insert(0) += 1;
    }
    counts
}

// ─── Combinator ────────────────────────────────────────────────────

#[test]
fn test_attempt_commits_verified_candidate() {
    let outcome = attempt(vec![1, 2, 3], |v| Ok(v.iter().rev().copied().collect()), |_, _| Ok(()));
    assert!(outcome.is_committed());
    assert_eq!(outcome.into_inner(), vec![3, 2, 1]);
}

#[test]
fn test_attempt_keeps_original_on_failure() {
    let outcome = attempt(vec![1, 2], |_| Err("no".to_string()), |_, _| Ok(()));
    assert_eq!(
        outcome,
        Attempt::Rejected {
            original: vec![1, 2],
            reason: "no".to_string()
        }
    );

    let outcome = attempt(
        vec![1, 2],
        |v| Ok(v[..1].to_vec()),
        |a, b| if a.len() == b.len() { Ok(()) } else { Err("length".to_string()) },
    );
    assert!(!outcome.is_committed());
    assert_eq!(outcome.into_inner(), vec![1, 2]);
}

#[test]
fn test_rewrite_runs_respects_barriers() {
    let segments = vec![
        load(1, 1, 40, 0, 4),
        load(1, 1, 0, 0, 4),
        Segment::Sync(SyncKind::Dma),
        load(1, 1, 20, 0, 4),
        store(1, 1, 10, 0, 4),
    ];
    let mut runs = Vec::new();
    let out = rewrite_runs(
        segments,
        |a, b| a.direction == b.direction,
        |run| {
            runs.push(run.len());
            run
        },
    );
    assert_eq!(runs, vec![2, 1, 1]);
    assert!(matches!(out[2], Segment::Sync(SyncKind::Dma)));
}

// ─── Merger ────────────────────────────────────────────────────────

#[test]
fn test_merge_contiguous_loads() {
    let segments = vec![load(1, 1, 40, 20, 10), load(1, 1, 0, 0, 10), load(1, 1, 20, 10, 10)];
    let out = merge(segments, 8192).unwrap();
    assert_eq!(out, vec![load(1, 1, 0, 0, 30)]);
}

#[test]
fn test_merge_drops_duplicates() {
    let segments = vec![load(1, 1, 0, 0, 10), load(1, 1, 0, 0, 10)];
    let (out, stats) = merge::merge_with_stats(segments, 8192).unwrap();
    assert_eq!(out, vec![load(1, 1, 0, 0, 10)]);
    assert_eq!(stats.duplicates, 1);
}

#[test]
fn test_merge_flattens_gapless_2d() {
    let t = Transfer::new_2d(Direction::Load2d, 1, 1, 0, 0, 8, 4, 1);
    let out = merge(vec![Segment::Transfer(t)], 8192).unwrap();
    assert_eq!(out, vec![load(1, 1, 0, 0, 32)]);

    // too large for one hardware transfer
    let out = merge(vec![Segment::Transfer(t)], 16).unwrap();
    assert_eq!(out, vec![Segment::Transfer(t)]);
}

#[test]
fn test_merge_single_row_becomes_1d() {
    let t = Transfer::new_2d(Direction::Store2d, 1, 1, 0, 0, 8, 1, 5);
    let out = merge(vec![Segment::Transfer(t)], 8192).unwrap();
    let merged = out[0].as_transfer().unwrap();
    assert_eq!(merged.direction, Direction::Store1d);
    assert_eq!(merged.x_size, 8);
}

#[test]
fn test_merge_concatenates_2d_blocks() {
    let a = Transfer::new_2d(Direction::Load2d, 1, 1, 0, 0, 8, 4, 3);
    let b = Transfer::new_2d(Direction::Load2d, 1, 1, 80, 32, 8, 4, 3);
    let (out, stats) = merge::merge_with_stats(vec![Segment::Transfer(b), Segment::Transfer(a)], 8192).unwrap();
    assert_eq!(out, vec![Segment::Transfer(Transfer { y_size: 8, ..a })]);
    assert_eq!(stats.merged_2d, 1);
}

#[test]
fn test_merge_trims_discarded_tail_once() {
    let t = Transfer::load_1d(1, 1, 0, 0, 12).with_skipped(2);
    let out = merge(vec![Segment::Transfer(t)], 8192).unwrap();
    assert_eq!(out, vec![load(1, 1, 0, 0, 10)]);
    let again = merge(out.clone(), 8192).unwrap();
    assert_eq!(again, out);
}

#[test]
fn test_merge_rejects_discard_on_2d() {
    let t = Transfer::new_2d(Direction::Load2d, 1, 1, 0, 0, 8, 4, 3).with_skipped(2);
    let err = merge(vec![Segment::Transfer(t)], 8192).unwrap_err();
    assert!(matches!(err, StreamError::DiscardOn2d { skipped: 2, .. }));
}

#[test]
fn test_merge_never_crosses_sync() {
    let segments = vec![load(1, 1, 0, 0, 10), Segment::Sync(SyncKind::Dma), load(1, 1, 20, 10, 10)];
    let out = merge(segments.clone(), 8192).unwrap();
    assert_eq!(out, segments);
}

#[test]
fn test_merge_keeps_different_units_apart() {
    let segments = vec![load(1, 1, 0, 0, 10), load(1, 2, 20, 10, 10)];
    let out = merge(segments, 8192).unwrap();
    assert_eq!(out.len(), 2);
}

// ─── Block formation ───────────────────────────────────────────────

#[test]
fn test_blocks_fold_cluster_siblings() {
    let segments = vec![
        load(0b01, 1, 0, 0, 16),
        load(0b10, 1, 0, 0, 16),
        compute(),
        Segment::Sync(SyncKind::Dma),
    ];
    let out = form_blocks(segments, 65535).unwrap();
    assert_eq!(
        out,
        vec![
            Segment::Block { count: 1 },
            load(0b11, 1, 0, 0, 16),
            compute(),
            Segment::Sync(SyncKind::Dma),
        ]
    );
}

#[test]
fn test_blocks_keep_overlapping_clusters() {
    let segments = vec![load(0b11, 1, 0, 0, 16), load(0b10, 1, 0, 0, 16)];
    let out = form_blocks(segments, 65535).unwrap();
    assert_eq!(out[0], Segment::Block { count: 2 });
    assert_eq!(out.len(), 3);
}

#[test]
fn test_blocks_split_around_compute() {
    let segments = vec![
        load(1, 1, 0, 0, 10),
        load(1, 1, 100, 10, 20),
        compute(),
        Segment::Sync(SyncKind::Both),
    ];
    let out = form_blocks(segments, 1).unwrap();
    assert_eq!(
        out,
        vec![
            Segment::Block { count: 1 },
            load(1, 1, 100, 10, 20),
            compute(),
            Segment::Block { count: 1 },
            load(1, 1, 0, 0, 10),
            Segment::Sync(SyncKind::Both),
        ]
    );
}

#[test]
fn test_blocks_regenerate_existing_markers() {
    let segments = vec![Segment::Block { count: 5 }, load(1, 1, 0, 0, 10), Segment::Sync(SyncKind::Dma)];
    let out = form_blocks(segments, 65535).unwrap();
    assert_eq!(
        out,
        vec![
            Segment::Block { count: 1 },
            load(1, 1, 0, 0, 10),
            Segment::Sync(SyncKind::Dma)
        ]
    );
}

#[test]
fn test_blocks_flush_trailing_window() {
    let out = form_blocks(vec![store(1, 1, 0, 0, 4), load(1, 1, 0, 0, 4)], 65535).unwrap();
    assert_eq!(out[0], Segment::Block { count: 2 });
    assert!(out[1].is_store());
    ir::check_blocks(&out).unwrap();
}

#[test]
fn test_blocks_compute_only() {
    let segments = vec![compute(), Segment::Sync(SyncKind::Lanes)];
    assert_eq!(form_blocks(segments.clone(), 65535).unwrap(), segments);
}

// ─── Loop extraction ───────────────────────────────────────────────

#[test]
fn test_loops_unit_sweep() {
    let segments: Vec<Segment> = (0..8).map(|u| load(1, 1 << u, 64 * u as u64, 0, 32)).collect();
    let out = extract_loops(segments.clone(), 5).unwrap();
    assert_eq!(out.len(), 1);
    let Segment::Loop(l) = out[0] else {
        panic!("expected a loop, got {:?}", out[0]);
    };
    assert_eq!(l.unit_len, 7);
    assert_eq!(l.unit_shift, 1);
    assert_eq!(l.mm_incr, 64);
    assert_eq!(l.count, 8);
    assert_eq!(ir::unroll(&out), segments);
}

#[test]
fn test_loops_pattern_break() {
    let segments = vec![
        load(1, 0b1, 0, 0, 8),
        load(1, 0b1, 64, 8, 8),
        load(1, 0b1, 1000, 16, 8),
        load(1, 0b11, 1064, 24, 8),
    ];
    let out = extract_loops(segments.clone(), 2).unwrap();
    assert_eq!(ir::record_len(&out), 4);
    assert!(matches!(out[0], Segment::Loop(LoopTransfer { count: 2, .. })));
    assert_eq!(&out[1..], &segments[2..]);
}

#[test]
fn test_loops_short_run_untouched() {
    let segments: Vec<Segment> = (0..3).map(|u| load(1, 1 << u, 64 * u as u64, 0, 32)).collect();
    assert_eq!(extract_loops(segments.clone(), 5).unwrap(), segments);
}

#[test]
fn test_loops_cluster_sweep() {
    let segments: Vec<Segment> = (0..4).map(|c| store(1 << c, 0b11, 256 * c as u64, 0x40, 16)).collect();
    let out = extract_loops(segments.clone(), 2).unwrap();
    let Segment::Loop(l) = out[0] else {
        panic!("expected a loop");
    };
    assert_eq!((l.cluster_len, l.cluster_shift, l.unit_len), (3, 1, 0));
    assert_eq!(ir::unroll(&out), segments);
}

#[test]
fn test_loops_nested_unit_and_inter_unit() {
    let segments: Vec<Segment> = (0..6u32)
        .map(|i| load(1, 1 << (i / 2), 32 * i as u64, 16 * (i % 2), 16))
        .collect();
    let out = extract_loops(segments.clone(), 5).unwrap();
    let Segment::Loop(l) = out[0] else {
        panic!("expected a loop");
    };
    assert_eq!((l.unit_len, l.inter_unit_len, l.lm_incr), (2, 1, 16));
    assert_eq!(ir::unroll(&out), segments);
}

#[test]
fn test_loops_rejected_candidate_keeps_transfers() {
    let mut segments: Vec<Segment> = (0..6u32)
        .map(|i| load(1, 1 << (i / 2), 32 * i as u64, 16 * (i % 2), 16))
        .collect();
    segments[3] = load(1, 0b10, 96, 20, 16);
    assert_eq!(extract_loops(segments.clone(), 5).unwrap(), segments);
}

#[test]
fn test_loops_lm_increment_overflow_rejected() {
    let segments: Vec<Segment> = (0..6u32).map(|i| load(1, 1, 64 * i as u64, 5000 * i, 32)).collect();
    assert_eq!(extract_loops(segments.clone(), 5).unwrap(), segments);
}

#[test]
fn test_loops_refresh_block_count() {
    let mut segments = vec![Segment::Block { count: 8 }];
    segments.extend((0..8).map(|u| load(1, 1 << u, 64 * u as u64, 0, 32)));
    let out = extract_loops(segments, 5).unwrap();
    assert_eq!(out[0], Segment::Block { count: 2 });
    ir::check_blocks(&out).unwrap();
}

// ─── Store splitting ───────────────────────────────────────────────

fn double_buffered() -> Vec<Segment> {
    vec![
        Segment::Block { count: 3 },
        store(0b001, 1, 0x100, 0, 8),
        store(0b010, 1, 0x200, 0, 8),
        store(0b100, 1, 0x300, 0, 8),
        Segment::Sync(SyncKind::Dma),
        Segment::Block { count: 2 },
        load(1, 1, 0x1000, 0x40, 8),
        load(2, 1, 0x1000, 0x40, 8),
        compute(),
        Segment::Sync(SyncKind::Both),
        Segment::Block { count: 1 },
        load(4, 1, 0x2000, 0x40, 8),
        compute(),
        Segment::Sync(SyncKind::Both),
    ]
}

#[test]
fn test_split_spreads_stores() {
    let out = split_stores(double_buffered()).unwrap();
    assert_eq!(
        out,
        vec![
            Segment::Block { count: 1 },
            store(0b001, 1, 0x100, 0, 8),
            Segment::Sync(SyncKind::Dma),
            Segment::Block { count: 3 },
            store(0b010, 1, 0x200, 0, 8),
            load(1, 1, 0x1000, 0x40, 8),
            load(2, 1, 0x1000, 0x40, 8),
            compute(),
            Segment::Sync(SyncKind::Both),
            Segment::Block { count: 2 },
            store(0b100, 1, 0x300, 0, 8),
            load(4, 1, 0x2000, 0x40, 8),
            compute(),
            Segment::Sync(SyncKind::Both),
        ]
    );
}

#[test]
fn test_split_falls_back_when_stores_scattered() {
    let segments = vec![
        Segment::Block { count: 3 },
        load(1, 1, 0, 0, 8),
        store(1, 1, 0x100, 0, 8),
        store(2, 1, 0x100, 0, 8),
        Segment::Block { count: 1 },
        load(2, 1, 0, 0, 8),
        Segment::Sync(SyncKind::Both),
    ];
    assert_eq!(split_stores(segments.clone()).unwrap(), segments);
}

#[test]
fn test_split_without_store_blocks() {
    let segments = vec![Segment::Block { count: 1 }, load(1, 1, 0, 0, 8), compute()];
    assert_eq!(split_stores(segments.clone()).unwrap(), segments);
}

#[test]
fn test_resort_stores_rotates_clusters() {
    let list = vec![
        Transfer::store_1d(0b01, 1, 0x100, 0, 4),
        Transfer::store_1d(0b01, 1, 0x300, 0, 4),
        Transfer::store_1d(0b10, 1, 0x200, 0, 4),
        Transfer::store_1d(0b10, 1, 0x400, 0, 4),
    ];
    let mm: Vec<u64> = split::resort_stores(list).iter().map(|t| t.mm_addr).collect();
    assert_eq!(mm, vec![0x300, 0x400, 0x100, 0x200]);
}

// ─── Load balancing ────────────────────────────────────────────────

#[test]
fn test_balance_interleaves_store_clusters() {
    let segments = vec![
        store(1, 1, 0, 0, 4),
        store(1, 1, 8, 0, 4),
        store(2, 1, 16, 0, 4),
        store(2, 1, 24, 0, 4),
        store(4, 1, 32, 0, 4),
    ];
    let out = balance(segments, false);
    let clusters: Vec<u32> = transfers(&out).iter().map(|t| t.cluster).collect();
    let mm: Vec<u64> = transfers(&out).iter().map(|t| t.mm_addr).collect();
    assert_eq!(clusters, vec![1, 2, 4, 1, 2]);
    assert_eq!(mm, vec![0, 16, 32, 8, 24]);
}

#[test]
fn test_balance_leaves_loads_by_default() {
    let segments = vec![load(1, 1, 0, 0, 4), load(1, 1, 8, 0, 4), load(2, 1, 16, 0, 4)];
    assert_eq!(balance(segments.clone(), false), segments);
    let out = balance(segments, true);
    assert_eq!(transfers(&out)[1].cluster, 2);
}

#[test]
fn test_balance_stops_at_barriers() {
    let segments = vec![
        store(1, 1, 0, 0, 4),
        store(1, 1, 8, 0, 4),
        compute(),
        store(2, 1, 16, 0, 4),
    ];
    assert_eq!(balance(segments.clone(), false), segments);
}

// ─── Preconditions ─────────────────────────────────────────────────

#[test]
fn test_preconditions_mask_range() {
    let hw = HardwareConfig::default();
    let err = check_preconditions(&[load(1 << 8, 1, 0, 0, 4)], &hw, PadConfig::default()).unwrap_err();
    assert!(matches!(err, StreamError::MaskOutOfRange { what: "cluster", limit: 8, .. }));
    let err = check_preconditions(&[compute(), load(1, 1 << 9, 0, 0, 4)], &hw, PadConfig::default()).unwrap_err();
    assert!(matches!(err, StreamError::MaskOutOfRange { index: 1, what: "unit", .. }));
}

#[test]
fn test_preconditions_padding_width() {
    let hw = HardwareConfig::default();
    let padded = Transfer::new_2d(Direction::Load2d, 1, 1, 0, 0, 4, 4, 1)
        .with_padding(PadFlags(PadFlags::LEFT | PadFlags::RIGHT));
    let wide = PadConfig {
        left: 3,
        right: 3,
        ..PadConfig::default()
    };
    let narrow = PadConfig {
        left: 1,
        right: 1,
        ..PadConfig::default()
    };
    assert!(check_preconditions(&[Segment::Transfer(padded)], &hw, narrow).is_ok());
    let err = check_preconditions(&[Segment::Transfer(padded)], &hw, wide).unwrap_err();
    assert!(matches!(err, StreamError::PaddingExceedsTransfer { index: 0, .. }));
    // a padding command inside the stream replaces the initial widths
    let stream = [Segment::Padding(wide), Segment::Transfer(padded)];
    assert!(check_preconditions(&stream, &hw, narrow).is_err());
}

// ─── Pipeline ──────────────────────────────────────────────────────

/// Eight units load two halves each, compute, then store.
fn layer_stream() -> Vec<Segment> {
    let mut segments = Vec::new();
    for u in 0..8u32 {
        let mm = 0x1000 + 128 * u as u64;
        segments.push(load(1, 1 << u, mm + 64, 32, 32));
        segments.push(load(1, 1 << u, mm, 0, 32));
    }
    segments.push(Segment::Sync(SyncKind::Dma));
    segments.push(compute());
    segments.push(Segment::Sync(SyncKind::Lanes));
    for u in 0..8u32 {
        segments.push(store(1, 1 << u, 0x8000 + 64 * u as u64, 0x100, 32));
    }
    segments.push(Segment::Sync(SyncKind::Both));
    segments
}

#[test]
fn test_compile_layer_stream() {
    let input = layer_stream();
    let (out, stats) = compile_with_stats(input.clone(), PadConfig::default(), &CompilerConfig::default()).unwrap();
    assert_eq!(ir::record_len(&out), 10);
    assert_eq!(ir::count_elements(&out), ir::count_elements(&input));
    assert_eq!(syncs(&out), syncs(&input));
    ir::check_blocks(&out).unwrap();
    let names: Vec<&str> = stats.iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["merge", "blocks", "merge", "split", "loops", "balance"]);
    assert_eq!(stats[0].records_out, 8 + 3 + 8 + 1);

    let Segment::Loop(stores) = out[6] else {
        panic!("expected store loop, got {:?}", out[6]);
    };
    assert_eq!((stores.unit_shift, stores.mm_incr, stores.count), (-1, -64, 8));
}

#[test]
fn test_compile_respects_disabled_passes() {
    let mut cfg = CompilerConfig::default();
    cfg.pipeline.merge = false;
    cfg.pipeline.blocks = false;
    cfg.pipeline.split_stores = false;
    cfg.pipeline.loops = false;
    cfg.pipeline.balance = false;
    let input = layer_stream();
    let (out, stats) = compile_with_stats(input.clone(), PadConfig::default(), &cfg).unwrap();
    assert_eq!(out, input);
    assert!(stats.is_empty());
}

#[test]
fn test_compile_net_keeps_layer_order() {
    let layers: Vec<Layer> = (0..4u16)
        .map(|n| {
            let mut params = crate::ir::LayerParams::new(crate::ir::LayerKind::Conv2);
            params.number = n;
            Layer::new(params, layer_stream())
        })
        .collect();
    let net = Net {
        layers,
        exec_list: vec![0, 1, 2, 3],
    };
    let (compiled, stats) = compile_net(&net, &CompilerConfig::default()).unwrap();
    assert_eq!(stats.len(), 4);
    let numbers: Vec<u16> = compiled.layers.iter().map(|l| l.params.number).collect();
    assert_eq!(numbers, vec![0, 1, 2, 3]);
    assert_eq!(compiled.exec_list, net.exec_list);
}

// ─── Properties ────────────────────────────────────────────────────

/// Contiguous regions cut into pieces, one region per distinct target.
fn arb_fragments() -> impl Strategy<Value = Vec<Segment>> {
    prop::collection::vec((any::<bool>(), prop::collection::vec(1u16..40, 1..8)), 1..6)
        .prop_map(|regions| {
            let mut out = Vec::new();
            for (i, (is_store, pieces)) in regions.into_iter().enumerate() {
                let (cluster, unit) = (1u32 << (i % 4), 1u32 << (i / 4));
                let base = 0x10000 * i as u64;
                let mut offset = 0u32;
                for len in pieces {
                    let direction = if is_store { Direction::Store1d } else { Direction::Load1d };
                    let t = Transfer::new_1d(direction, cluster, unit, base + 2 * offset as u64, offset, len);
                    out.push(Segment::Transfer(t));
                    offset += len as u32;
                }
            }
            out
        })
        .prop_shuffle()
}

fn arb_loop() -> impl Strategy<Value = LoopTransfer> {
    (0u8..3, 0u8..4, 0u8..3, -64i16..64, -256i32..256, 1u16..64).prop_map(
        |(cluster_len, unit_len, inter_unit_len, lm_incr, mm_incr, count)| {
            let full = (cluster_len as u16 + 1) * (unit_len as u16 + 1) * (inter_unit_len as u16 + 1);
            LoopTransfer {
                cluster_len,
                cluster_shift: 1,
                unit_len,
                unit_shift: 1,
                inter_unit_len,
                lm_incr,
                mm_incr,
                count: count.min(full),
                base: Transfer::load_1d(1, 1, 0x100000, 0x1000, 16),
            }
        },
    )
}

fn arb_stores() -> impl Strategy<Value = Vec<Transfer>> {
    prop::collection::vec((0u32..8, 0u64..64), 1..24).prop_map(|list| {
        list.into_iter()
            .map(|(c, slot)| Transfer::store_1d(1 << c, 1, slot * 64, 0, 8))
            .collect()
    })
}

#[test]
fn test_merge_near_top_of_host_memory() {
    let top = u64::MAX - 7;
    let segments = vec![load(1, 1, top, 0, 8), load(1, 1, 0, 8, 8)];
    let out = merge(segments.clone(), 8192).unwrap();
    assert_eq!(ir::count_elements(&out), ir::count_elements(&segments));
    assert_eq!(transfers(&out).len(), 2);
}

#[test]
fn test_loops_skip_unrepresentable_address_steps() {
    let high = 1u64 << 63;
    let segments: Vec<Segment> = (0..6)
        .map(|i| load(1, 1, if i % 2 == 0 { 0 } else { high }, 16 * i, 8))
        .collect();
    let out = extract_loops(segments.clone(), 5).unwrap();
    assert_eq!(ir::unroll(&out), segments);
    assert!(!out.iter().any(|s| matches!(s, Segment::Loop(_))));
}

proptest! {
    #[test]
    fn prop_merge_preserves_elements(segments in arb_fragments()) {
        let before = ir::count_elements(&segments);
        let out = merge(segments, 8192).unwrap();
        prop_assert_eq!(ir::count_elements(&out), before);
    }

    #[test]
    fn prop_merge_is_idempotent(segments in arb_fragments()) {
        let once = merge(segments, 8192).unwrap();
        let twice = merge(once.clone(), 8192).unwrap();
        prop_assert_eq!(ir::record_len(&twice), ir::record_len(&once));
    }

    #[test]
    fn prop_pipeline_preserves_elements_and_blocks(segments in arb_fragments()) {
        let mut stream = segments;
        stream.push(Segment::Sync(SyncKind::Both));
        let before = ir::count_elements(&stream);
        let out = compile(stream.clone(), &CompilerConfig::default()).unwrap();
        prop_assert_eq!(ir::count_elements(&out), before);
        prop_assert!(ir::check_blocks(&out).is_ok());
        prop_assert_eq!(syncs(&out), syncs(&stream));
    }

    #[test]
    fn prop_loop_roundtrip(l in arb_loop()) {
        let full = (l.cluster_len as u16 + 1) * (l.unit_len as u16 + 1) * (l.inter_unit_len as u16 + 1);
        let run: Vec<Segment> = l.expand().into_iter().map(Segment::Transfer).collect();
        let out = extract_loops(run.clone(), 2).unwrap();
        prop_assert_eq!(ir::unroll(&out), run.clone());
        if l.count == full && run.len() >= 2 {
            prop_assert_eq!(out.len(), 1);
            prop_assert!(matches!(out[0], Segment::Loop(_)));
        }
    }

    #[test]
    fn prop_balance_only_reorders(list in arb_stores()) {
        let segments: Vec<Segment> = list.iter().copied().map(Segment::Transfer).collect();
        let out = transfers(&balance(segments, false));
        prop_assert_eq!(multiset(&out), multiset(&list));
        for cluster in 0..8 {
            let keep = |l: &[Transfer]| -> Vec<Transfer> {
                l.iter().filter(|t| t.cluster == 1 << cluster).copied().collect()
            };
            prop_assert_eq!(keep(&out), keep(&list));
        }
    }

    #[test]
    fn prop_split_conserves_stores(list in arb_stores(), blocks in 1usize..5) {
        let mut stream = vec![Segment::Block { count: list.len() as u32 }];
        stream.extend(list.iter().copied().map(Segment::Transfer));
        stream.push(Segment::Sync(SyncKind::Dma));
        for b in 0..blocks {
            stream.push(Segment::Block { count: 1 });
            stream.push(load(1, 1, 0x10000 * b as u64, 0, 8));
            stream.push(compute());
            stream.push(Segment::Sync(SyncKind::Both));
        }
        let out = split_stores(stream.clone()).unwrap();
        prop_assert!(ir::check_blocks(&out).is_ok());
        prop_assert_eq!(multiset(&transfers(&out)), multiset(&transfers(&stream)));
        prop_assert_eq!(syncs(&out), syncs(&stream));
        let per_block = list.len().div_ceil(blocks + 1);
        for (index, seg) in out.iter().enumerate() {
            if let Segment::Block { .. } = seg {
                let stores = ir::block_body(&out, index).unwrap().iter().filter(|s| s.is_store()).count();
                prop_assert!(stores <= per_block);
            }
        }
    }
}
