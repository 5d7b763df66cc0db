//! Runtime configuration for ShadowKV.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. ShadowKV's sizing knobs (chunking, rank, sparse
//! budget) live in [`ShadowConfig`] and are validated at construction (§6).

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::dtype::StorageDtype;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "shadowkv", about = "Sparse-attention KV cache inference server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("max_length ({max_length}) must be a positive multiple of chunk_size ({chunk_size})")]
    MaxLengthNotDivisible { max_length: usize, chunk_size: usize },

    #[error("sparse_budget ({sparse_budget}) must be a multiple of chunk_size ({chunk_size})")]
    SparseBudgetNotDivisible { sparse_budget: usize, chunk_size: usize },

    #[error("chunk_size must be positive")]
    ZeroChunkSize,

    #[error("rank must be positive")]
    ZeroRank,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub shadow: ShadowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            shadow: ShadowConfig::default(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 300,
        }
    }
}

/// Model architecture settings, used to size the cache's per-layer buffers.
///
/// Non-goal: per-layer-varying kv-head counts — every layer shares the same
/// `n_kv_heads`/`head_dim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Number of attention heads.
    pub n_heads: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Number of layers in the model.
    pub n_layers: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            n_heads: 32,
            n_kv_heads: 8,
            head_dim: 128,
            n_layers: 32,
        }
    }
}

/// ShadowKV cache configuration (§6): every field validated at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// `N_max`: maximum sequence length a cache instance will ever serve.
    pub max_length: usize,

    /// `B`: batch size.
    pub batch_size: usize,

    /// `S·C`: sparse budget in positions (must be divisible by `chunk_size`).
    pub sparse_budget: usize,

    /// `r`: low-rank factorization rank.
    pub rank: usize,

    /// `C`: chunk size.
    pub chunk_size: usize,

    /// `T_local`: number of most-recent chunks always kept resident.
    pub local_chunk: usize,

    /// `K_outlier`: number of outlier chunks kept resident.
    pub outlier_chunk: usize,

    /// Target device identifier (e.g. `"cuda:0"`, `"cpu"`).
    pub device: String,

    /// Storage precision for landmark/factor tables.
    pub dtype: StorageDtype,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            max_length: 131_072,
            batch_size: 1,
            sparse_budget: 2048,
            rank: 160,
            chunk_size: 8,
            local_chunk: 4,
            outlier_chunk: 48,
            device: "cpu".to_string(),
            dtype: StorageDtype::default(),
        }
    }
}

impl ShadowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.rank == 0 {
            return Err(ConfigError::ZeroRank);
        }
        if self.max_length == 0 || self.max_length % self.chunk_size != 0 {
            return Err(ConfigError::MaxLengthNotDivisible {
                max_length: self.max_length,
                chunk_size: self.chunk_size,
            });
        }
        if self.sparse_budget % self.chunk_size != 0 {
            return Err(ConfigError::SparseBudgetNotDivisible {
                sparse_budget: self.sparse_budget,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config: Config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.shadow.validate()?;
        Ok(config)
    }

    /// Number of chunks a full prefill of `max_length` positions spans.
    pub fn n_chunks(&self) -> usize {
        self.shadow.max_length / self.shadow.chunk_size
    }
}
