use std::path::PathBuf;

use clap::Args;

use super::{fail, load_config, read_text, write_bytes};

#[derive(Args)]
pub struct PackArgs {
    /// JSON network description (layers and execution list)
    pub input: PathBuf,
    /// Output blob (default: <input>.bin)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Compiler configuration file (only [hardware] applies)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

pub fn cmd_pack(args: PackArgs) {
    let config = load_config(args.config.as_deref());
    let text = read_text(&args.input);
    let blob = match vstream::pack_json(&text, &config.hardware) {
        Ok(blob) => blob,
        Err(e) => fail(format!("{}: {}", args.input.display(), e)),
    };
    let output = args.output.unwrap_or_else(|| args.input.with_extension("bin"));
    write_bytes(&output, blob.as_bytes());
    eprintln!(
        "Packed {} bytes to {} ({})",
        blob.as_bytes().len(),
        output.display(),
        blob.digest().to_hex()
    );
}
