use std::path::PathBuf;

use clap::Args;
use vstream::runtime::run_net;
use vstream::runtime::sim::Recorder;

use super::{fail, load_config, read_bytes};

#[derive(Args)]
pub struct RunArgs {
    /// Blob to execute
    pub input: PathBuf,
    /// Compiler configuration file (only [hardware] applies)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Points per pillar reported to point-pillar layers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub pillar_points: Option<Vec<u16>>,
    /// Print per-layer statistics as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn cmd_run(args: RunArgs) {
    let config = load_config(args.config.as_deref());
    let bytes = read_bytes(&args.input);
    let mut acc = Recorder::new().with_pillar_points(args.pillar_points.unwrap_or_default());

    let stats = match run_net(&mut acc, &bytes, &config.hardware) {
        Ok(stats) => stats,
        Err(e) => fail(format!("{}: {}", args.input.display(), e)),
    };

    if args.json {
        match serde_json::to_string_pretty(&stats) {
            Ok(text) => println!("{}", text),
            Err(e) => fail(e),
        }
        return;
    }
    for (entry, layer) in stats.iter().enumerate() {
        let segments: Vec<String> = layer.segments.iter().map(|(kind, n)| format!("{} {}", n, kind)).collect();
        println!(
            "{:>3} layer {:>3} {:<16} {:>8} transfers {:>10} cycles  [{}]",
            entry,
            layer.number,
            format!("{:?}", layer.kind),
            layer.transfers,
            layer.cycles,
            segments.join(", ")
        );
    }
    let total: u64 = stats.iter().map(|s| s.cycles).sum();
    println!("total {} cycles, {} events", total, acc.events.len());
}
