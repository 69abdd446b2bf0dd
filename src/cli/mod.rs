pub mod inspect;
pub mod optimize;
pub mod pack;
pub mod run;

use std::path::Path;
use std::process;

use vstream::CompilerConfig;

/// Print `error: <message>` and exit with status 1.
pub fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}

pub fn read_bytes(path: &Path) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => fail(format!("cannot read '{}': {}", path.display(), e)),
    }
}

pub fn read_text(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => fail(format!("cannot read '{}': {}", path.display(), e)),
    }
}

pub fn write_bytes(path: &Path, bytes: &[u8]) {
    if let Err(e) = std::fs::write(path, bytes) {
        fail(format!("cannot write '{}': {}", path.display(), e));
    }
}

/// Load a configuration file, or the built-in defaults when none is given.
/// Problems in the file are rendered against its source before exiting.
pub fn load_config(path: Option<&Path>) -> CompilerConfig {
    let Some(path) = path else {
        return CompilerConfig::default();
    };
    let source = read_text(path);
    match CompilerConfig::parse_toml(&source, path) {
        Ok(config) => config,
        Err(diag) => {
            diag.render(&path.display().to_string(), &source);
            process::exit(1);
        }
    }
}
