use std::path::PathBuf;

use clap::Args;

use super::{fail, load_config, read_bytes, write_bytes};

#[derive(Args)]
pub struct OptimizeArgs {
    /// Input blob
    pub input: PathBuf,
    /// Output blob (default: <input>.opt.bin)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Compiler configuration file ([hardware] / [pipeline] sections)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Skip the transfer merger
    #[arg(long)]
    pub no_merge: bool,
    /// Skip batch formation
    #[arg(long)]
    pub no_blocks: bool,
    /// Skip the store splitter
    #[arg(long)]
    pub no_split: bool,
    /// Skip loop extraction
    #[arg(long)]
    pub no_loops: bool,
    /// Skip engine load balancing
    #[arg(long)]
    pub no_balance: bool,
    /// Also interleave load runs across clusters
    #[arg(long)]
    pub balance_loads: bool,
}

pub fn cmd_optimize(args: OptimizeArgs) {
    let mut config = load_config(args.config.as_deref());
    let p = &mut config.pipeline;
    p.merge &= !args.no_merge;
    p.blocks &= !args.no_blocks;
    p.split_stores &= !args.no_split;
    p.loops &= !args.no_loops;
    p.balance &= !args.no_balance;
    p.balance_loads |= args.balance_loads;

    let bytes = read_bytes(&args.input);
    let (blob, stats) = match vstream::optimize_blob(&bytes, &config) {
        Ok(result) => result,
        Err(e) => fail(format!("{}: {}", args.input.display(), e)),
    };

    for (layer, passes) in stats.iter().enumerate() {
        let (Some(first), Some(last)) = (passes.first(), passes.last()) else {
            println!("layer {:>3}: unchanged", layer);
            continue;
        };
        let saved: i64 = passes.iter().map(|p| p.bytes_saved()).sum();
        println!(
            "layer {:>3}: {:>6} -> {:>6} records ({:+} bytes)",
            layer, first.records_in, last.records_out, -saved
        );
    }

    let output = args.output.unwrap_or_else(|| args.input.with_extension("opt.bin"));
    write_bytes(&output, blob.as_bytes());
    eprintln!(
        "Wrote {} bytes ({} before) to {}",
        blob.as_bytes().len(),
        bytes.len(),
        output.display()
    );
}
