use crate::compile::{CompileOptions, DEFAULT_BLOCK_SIZE, DEFAULT_GROWTH_INCREMENT};
use crate::types::NodeGroupLayout;
use crate::update::EmStep;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML formats read and written by the engine.

/// Tuning knobs for compiling and replaying a schedule. Every field is optional
/// in the TOML file and falls back to its default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entries per block; a power of two.
    pub block_size: usize,
    /// Descriptor buffer growth granularity.
    pub growth_increment: usize,
    pub step_size: f32,
    pub pseudocount: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
            step_size: 1.0,
            pseudocount: 0.0,
        }
    }
}

impl EngineConfig {
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            block_size: self.block_size,
            growth_increment: self.growth_increment,
        }
    }

    pub fn em_step(&self) -> EmStep {
        EmStep {
            step_size: self.step_size,
            pseudocount: self.pseudocount,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }
}

/// A self-contained circuit snapshot: node-group layouts in traversal order,
/// the flat parameter array, and the flows of one forward/backward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitFile {
    pub groups: Vec<NodeGroupLayout>,
    pub params: Vec<f32>,
    pub flows: Vec<f32>,
}

impl CircuitFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }
}

/// Custom error type for reading and writing the TOML files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML file '{path}': {source}")]
    TomlParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::TomlParse {
        path: path.display().to_string(),
        source,
    })
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let toml_string = toml::to_string_pretty(value)?;
    let io_error = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = BufWriter::new(fs::File::create(path).map_err(io_error)?);
    file.write_all(toml_string.as_bytes()).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    Ok(())
}
