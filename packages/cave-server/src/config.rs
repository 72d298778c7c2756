use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use tome::{CaveConfig, TomeConfig};

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// JSON file describing the cave and its tomes
    pub cave_config: Option<PathBuf>,
    /// Mount `GET /registry`
    pub registry_enabled: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            cave_config: env::var("CAVE_CONFIG").ok().map(PathBuf::from),
            registry_enabled: env::var("CAVE_REGISTRY_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Contents of the `CAVE_CONFIG` file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaveFile {
    #[serde(default)]
    pub cave: Option<CaveConfig>,
    #[serde(default)]
    pub tomes: Vec<TomeConfig>,
}

impl CaveFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cave config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse cave config {}", path.display()))
    }
}
