//! End to end: describe a network, pack it, optimize it and schedule both
//! versions on the recording accelerator.

use vstream::ir::{Compute, LayerKind, Opcode, SyncKind, Transfer};
use vstream::runtime::sim::Recorder;
use vstream::runtime::Kernel;
use vstream::{CompilerConfig, HardwareConfig, Layer, LayerParams, Net, NetBlob, Segment, StreamError};

/// Two double-buffered tiles of a convolution over eight units.
fn conv_layer(number: u16) -> Layer {
    let mut params = LayerParams::new(LayerKind::Conv2);
    params.number = number;
    params.kernel_length = 3;
    params.seg_out_w = 8;
    params.seg_out_h = 8;

    let mut segments = Vec::new();
    for tile in 0..2u64 {
        let buffer = (tile as u32) * 0x800;
        for half in 0..2u64 {
            for unit in 0..8u64 {
                let mm = 0x1_0000 + tile * 0x1000 + unit * 128 + half * 64;
                segments.push(Segment::Transfer(Transfer::load_1d(
                    1,
                    1 << unit,
                    mm,
                    buffer + half as u32 * 32,
                    32,
                )));
            }
        }
        segments.push(Segment::Sync(SyncKind::Dma));
        let mut conv = Compute::new(Opcode::ConvStart);
        conv.buffer = buffer as u16;
        segments.push(Segment::Compute(conv));
        segments.push(Segment::Sync(SyncKind::Lanes));
        for unit in 0..8u64 {
            let mm = 0x8_0000 + tile * 0x1000 + unit * 128;
            segments.push(Segment::Transfer(Transfer::store_1d(1, 1 << unit, mm, buffer + 0x400, 64)));
        }
        segments.push(Segment::Sync(SyncKind::Both));
    }
    Layer::new(params, segments)
}

fn sample_net() -> Net {
    Net {
        layers: vec![conv_layer(0), conv_layer(1)],
        exec_list: vec![0, 1],
    }
}

fn execute(blob: &[u8]) -> Recorder {
    let mut acc = Recorder::new();
    vstream::run_net(&mut acc, blob, &HardwareConfig::default()).unwrap();
    acc
}

fn moved_elements(acc: &Recorder) -> u64 {
    acc.transfers().iter().map(Transfer::elements).sum()
}

#[test]
fn test_optimized_blob_executes_the_same_work() {
    let original = NetBlob::from_net(&sample_net()).unwrap();
    let (optimized, stats) = vstream::optimize_blob(original.as_bytes(), &CompilerConfig::default()).unwrap();
    assert!(optimized.as_bytes().len() < original.as_bytes().len());
    assert_eq!(stats.len(), 2);

    let before = execute(original.as_bytes());
    let after = execute(optimized.as_bytes());
    assert_eq!(moved_elements(&before), moved_elements(&after));
    assert_eq!(before.waits(), after.waits());
    let kernels = |acc: &Recorder| acc.kernels().iter().map(|k| k.kernel).collect::<Vec<Kernel>>();
    assert_eq!(kernels(&before), kernels(&after));
}

#[test]
fn test_optimized_layers_are_batched_and_looped() {
    let (net, _) = vstream::compile_net(&sample_net(), &CompilerConfig::default()).unwrap();
    for layer in &net.layers {
        vstream::ir::check_blocks(&layer.segments).unwrap();
        assert!(layer.segments.iter().any(|s| matches!(s, Segment::Block { .. })));
        assert!(layer.segments.iter().any(|s| matches!(s, Segment::Loop(_))));
        assert_eq!(
            vstream::ir::count_elements(&layer.segments),
            vstream::ir::count_elements(&conv_layer(layer.params.number).segments)
        );
    }
}

#[test]
fn test_disabled_pipeline_keeps_blob_bytes() {
    let mut config = CompilerConfig::default();
    let p = &mut config.pipeline;
    p.merge = false;
    p.blocks = false;
    p.split_stores = false;
    p.loops = false;
    p.balance = false;
    let original = NetBlob::from_net(&sample_net()).unwrap();
    let (optimized, _) = vstream::optimize_blob(original.as_bytes(), &config).unwrap();
    assert_eq!(optimized.digest(), original.digest());
}

#[test]
fn test_pack_json_file_roundtrip() {
    let text = r#"{
        "layers": [{
            "params": { "number": 3, "kind": "conv2", "kernel_length": 1 },
            "segments": [
                { "transfer": { "direction": "load1d", "cluster": 1, "unit_mask": 3,
                                "mm_addr": 4096, "lm_addr": 0, "x_size": 64 } },
                { "sync": "dma" },
                { "compute": { "op": "conv_start" } },
                { "sync": "both" }
            ]
        }],
        "exec_list": [0, 0]
    }"#;
    let blob = vstream::pack_json(text, &HardwareConfig::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("net.bin");
    std::fs::write(&path, blob.as_bytes()).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    let net = NetBlob::parse(&bytes).unwrap();
    assert_eq!(net.exec_list, vec![0, 0]);
    assert_eq!(net.layers[0].params.number, 3);
    assert_eq!(net.layers[0].segments.len(), 4);
    assert_eq!(net.layers[0].segments[0].as_transfer().map(Transfer::elements), Some(128));

    let acc = execute(&bytes);
    assert_eq!(acc.transfers().len(), 2);
}

#[test]
fn test_relocated_blob_parses_identically() {
    let blob = NetBlob::from_net(&sample_net()).unwrap();
    let mut shifted = vec![0u8; 7];
    shifted.extend_from_slice(blob.as_bytes());
    assert_eq!(NetBlob::parse(&shifted[7..]).unwrap(), sample_net());
}

#[test]
fn test_corrupt_blob_rejected() {
    let mut bytes = NetBlob::from_net(&sample_net()).unwrap().into_bytes();
    bytes.truncate(bytes.len() - 8);
    let err = vstream::optimize_blob(&bytes, &CompilerConfig::default()).unwrap_err();
    assert!(matches!(err, StreamError::Truncated { .. }));
}

#[test]
fn test_precondition_failure_aborts_network() {
    let mut net = sample_net();
    net.layers[1]
        .segments
        .insert(0, Segment::Transfer(Transfer::load_1d(1 << 12, 1, 0, 0, 8)));
    let err = vstream::compile_net(&net, &CompilerConfig::default()).unwrap_err();
    assert!(matches!(err, StreamError::MaskOutOfRange { what: "cluster", .. }));
}

#[test]
fn test_pack_rejects_missing_units() {
    let text = r#"{
        "layers": [{
            "params": { "number": 0, "kind": "conv2" },
            "segments": [
                { "transfer": { "direction": "load1d", "cluster": 1, "unit_mask": 512,
                                "mm_addr": 0, "lm_addr": 0, "x_size": 8 } }
            ]
        }],
        "exec_list": [0]
    }"#;
    let err = vstream::pack_json(text, &HardwareConfig::default()).unwrap_err();
    assert!(matches!(err, StreamError::MaskOutOfRange { what: "unit", .. }));
}
