pub mod blob;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod log;
pub mod optimize;
pub mod runtime;
pub mod span;

// Wire records and blob headers are cast straight from memory.
#[cfg(target_endian = "big")]
compile_error!("vstream reads and writes little-endian records and supports little-endian targets only");

pub use blob::{Net, NetBlob};
pub use config::{CompilerConfig, HardwareConfig, PipelineConfig};
pub use error::{Result, StreamError};
pub use ir::{Layer, LayerParams, Segment};
pub use optimize::{compile, compile_net, PassStats};
pub use runtime::{run_layer, run_net, Accelerator};

/// Decode a blob, optimize every layer and encode the result.
///
/// The execution list is carried over unchanged.
pub fn optimize_blob(bytes: &[u8], cfg: &CompilerConfig) -> Result<(NetBlob, Vec<Vec<PassStats>>)> {
    let net = NetBlob::parse(bytes)?;
    let (optimized, stats) = compile_net(&net, cfg)?;
    Ok((NetBlob::from_net(&optimized)?, stats))
}

/// Pack a JSON network description into a blob.
///
/// Every layer is checked against `hw` first, so a blob never carries
/// transfers the configured hardware cannot execute.
pub fn pack_json(text: &str, hw: &HardwareConfig) -> Result<NetBlob> {
    let net = Net::from_json(text)?;
    optimize::validate_net(&net, hw)?;
    NetBlob::from_net(&net)
}
