use std::path::PathBuf;

use clap::Args;
use vstream::ir::listing::listing;
use vstream::{NetBlob, Segment};

use super::{fail, read_bytes};

#[derive(Args)]
pub struct InspectArgs {
    /// Blob to inspect
    pub input: PathBuf,
    /// Only list the segments of this layer (blob order)
    #[arg(long)]
    pub layer: Option<usize>,
    /// Print the decoded network as JSON instead
    #[arg(long)]
    pub json: bool,
}

pub fn cmd_inspect(args: InspectArgs) {
    let bytes = read_bytes(&args.input);
    let summary = NetBlob::summary(&bytes).unwrap_or_else(|e| fail(format!("{}: {}", args.input.display(), e)));
    let net = NetBlob::parse(&bytes).unwrap_or_else(|e| fail(format!("{}: {}", args.input.display(), e)));

    if let Some(wanted) = args.layer {
        if wanted >= net.layers.len() {
            fail(format!("layer {} out of range ({} layers)", wanted, net.layers.len()));
        }
    }

    if args.json {
        match net.to_json() {
            Ok(text) => println!("{}", text),
            Err(e) => fail(e),
        }
        return;
    }

    println!("blob      {} bytes, blake3 {}", summary.blob_size, blake3::hash(&bytes[..summary.blob_size as usize]).to_hex());
    println!("layers    {}", summary.layer_count);
    println!("exec list {:?}", net.exec_list);

    for (index, layer) in net.layers.iter().enumerate() {
        if args.layer.is_some_and(|wanted| wanted != index) {
            continue;
        }
        let records: usize = layer.segments.iter().map(Segment::wire_len).sum();
        println!();
        println!(
            "layer {} (#{} {:?}) at {:#x}: {} records",
            index, layer.params.number, layer.params.kind, summary.layer_offsets[index], records
        );
        print!("{}", listing(&layer.segments));
    }
}
