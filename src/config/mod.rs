use std::path::Path;

use crate::diagnostic::Diagnostic;
use crate::span::Span;

/// Accelerator geometry and timing the compiler and scheduler target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareConfig {
    /// Parallel clusters, one DMA engine each.
    pub clusters: u32,
    /// Units per cluster.
    pub units: u32,
    /// Compute lanes per unit.
    pub lanes: u32,
    /// Register-file entries per lane.
    pub rf_size: u32,
    /// Local memory per unit, in 16-bit words.
    pub lm_size: u32,
    /// Largest element count a single hardware transfer may move.
    pub max_transfer_elements: u32,
    /// Write-to-read pipeline bubble in cycles.
    pub w2r_bubble: u32,
    /// Vector length below which the scheduler pads with nops.
    pub min_vector_length: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            clusters: 8,
            units: 8,
            lanes: 2,
            rf_size: 1024,
            lm_size: 8192,
            max_transfer_elements: 8192,
            w2r_bubble: 6,
            min_vector_length: 6,
        }
    }
}

impl HardwareConfig {
    /// Mask with one bit per configured cluster.
    pub fn cluster_mask(&self) -> u32 {
        full_mask(self.clusters)
    }

    /// Mask with one bit per configured unit.
    pub fn unit_mask(&self) -> u32 {
        full_mask(self.units)
    }
}

fn full_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Which passes run and how they are tuned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub merge: bool,
    pub blocks: bool,
    pub split_stores: bool,
    pub loops: bool,
    pub balance: bool,
    /// Interleave load runs too, not only stores.
    pub balance_loads: bool,
    /// Shortest run the loop extractor replaces.
    pub min_loop_len: usize,
    /// Transfers placed ahead of the compute commands when a batch window
    /// holds both.
    pub block_split: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            merge: true,
            blocks: true,
            split_stores: true,
            loops: true,
            balance: true,
            balance_loads: false,
            min_loop_len: 5,
            block_split: 65535,
        }
    }
}

/// Complete compiler configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilerConfig {
    pub hardware: HardwareConfig,
    pub pipeline: PipelineConfig,
}

impl CompilerConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, Diagnostic> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error(
                format!("cannot read config '{}': {}", path.display(), e),
                Span::dummy(),
            )
        })?;
        Self::parse_toml(&content, path)
    }

    /// Parse `[hardware]` / `[pipeline]` sections of `key = value` lines.
    ///
    /// Keys not present keep their default. Errors carry the span of the
    /// offending line.
    pub fn parse_toml(content: &str, path: &Path) -> Result<Self, Diagnostic> {
        let mut config = Self::default();
        let mut section = String::new();
        let mut offset = 0usize;

        for line in content.split_inclusive('\n') {
            let line_start = offset;
            offset += line.len();

            let body = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };
            let trimmed = body.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lead = body.len() - body.trim_start().len();
            let span = Span::at(line_start + lead, trimmed.len());

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                if section != "hardware" && section != "pipeline" {
                    return Err(Diagnostic::error(
                        format!("{}: unknown section [{}]", path.display(), section),
                        span,
                    )
                    .with_help("known sections are [hardware] and [pipeline]".to_string()));
                }
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(Diagnostic::error(
                    format!("{}: expected `key = value`", path.display()),
                    span,
                ));
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            let number = |field: &str| -> Result<u32, Diagnostic> {
                value.parse().map_err(|_| {
                    Diagnostic::error(
                        format!("{}: invalid {}.{}: {}", path.display(), section, field, value),
                        span,
                    )
                    .with_note(format!("{}.{} takes an unsigned integer", section, field))
                })
            };
            let flag = |field: &str| -> Result<bool, Diagnostic> {
                match value {
                    "true" => Ok(true),
                    "false" => Ok(false),
                    _ => Err(Diagnostic::error(
                        format!("{}: invalid {}.{}: {}", path.display(), section, field, value),
                        span,
                    )
                    .with_help("expected true or false".to_string())),
                }
            };

            let hw = &mut config.hardware;
            let pl = &mut config.pipeline;
            match (section.as_str(), key) {
                ("hardware", "clusters") => hw.clusters = number(key)?,
                ("hardware", "units") => hw.units = number(key)?,
                ("hardware", "lanes") => hw.lanes = number(key)?,
                ("hardware", "rf_size") => hw.rf_size = number(key)?,
                ("hardware", "lm_size") => hw.lm_size = number(key)?,
                ("hardware", "max_transfer_elements") => hw.max_transfer_elements = number(key)?,
                ("hardware", "w2r_bubble") => hw.w2r_bubble = number(key)?,
                ("hardware", "min_vector_length") => hw.min_vector_length = number(key)?,
                ("pipeline", "merge") => pl.merge = flag(key)?,
                ("pipeline", "blocks") => pl.blocks = flag(key)?,
                ("pipeline", "split_stores") => pl.split_stores = flag(key)?,
                ("pipeline", "loops") => pl.loops = flag(key)?,
                ("pipeline", "balance") => pl.balance = flag(key)?,
                ("pipeline", "balance_loads") => pl.balance_loads = flag(key)?,
                ("pipeline", "min_loop_len") => pl.min_loop_len = number(key)? as usize,
                ("pipeline", "block_split") => pl.block_split = number(key)? as usize,
                ("", _) => {
                    return Err(Diagnostic::error(
                        format!("{}: key '{}' outside of a section", path.display(), key),
                        span,
                    ))
                }
                _ => {
                    return Err(Diagnostic::error(
                        format!("{}: unknown key '{}' in [{}]", path.display(), key, section),
                        span,
                    ))
                }
            }
        }

        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), Diagnostic> {
        let err = |msg: String| Diagnostic::error(format!("{}: {}", path.display(), msg), Span::dummy());
        let hw = &self.hardware;
        if hw.clusters == 0 || hw.clusters > 32 {
            return Err(err(format!("hardware.clusters must be 1..=32, got {}", hw.clusters)));
        }
        if hw.units == 0 || hw.units > 32 {
            return Err(err(format!("hardware.units must be 1..=32, got {}", hw.units)));
        }
        if hw.lanes == 0 {
            return Err(err("hardware.lanes must be at least 1".to_string()));
        }
        if self.pipeline.min_loop_len < 2 {
            return Err(err(format!(
                "pipeline.min_loop_len must be at least 2, got {}",
                self.pipeline.min_loop_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
