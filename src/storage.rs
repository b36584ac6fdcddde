// Copyright 2026 Muvon Un Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

/// Get the system-wide storage directory for groundwork
/// Following XDG Base Directory specification on Unix-like systems
/// and proper conventions on other systems
pub fn get_system_storage_dir() -> Result<PathBuf> {
    let base_dir = if cfg!(target_os = "macos") {
        // macOS: ~/.local/share/groundwork
        dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
            .join(".local")
            .join("share")
            .join("groundwork")
    } else if cfg!(target_os = "windows") {
        // Windows: %APPDATA%/groundwork
        dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine data directory"))?
            .join("groundwork")
    } else {
        // Linux and other Unix-like: ~/.local/share/groundwork or $XDG_DATA_HOME/groundwork
        if let Ok(xdg_data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data_home).join("groundwork")
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
                .join(".local")
                .join("share")
                .join("groundwork")
        }
    };

    if !base_dir.exists() {
        fs::create_dir_all(&base_dir)?;
    }

    Ok(base_dir)
}

/// Get the system config file path
/// Stored directly under ~/.local/share/groundwork/ on all systems
pub fn get_system_config_path() -> Result<PathBuf> {
    let system_dir = get_system_storage_dir()?;
    Ok(system_dir.join("config.toml"))
}

/// Directory holding the LanceDB knowledge tables
pub fn get_knowledge_database_path() -> Result<PathBuf> {
    let path = get_system_storage_dir()?.join("knowledge");
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub fn get_log_dir() -> Result<PathBuf> {
    let path = get_system_storage_dir()?.join("logs");
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// SHA256 of content, hex encoded
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short stable identifier derived from content (first 16 hex chars of its hash)
pub fn short_hash(content: &str) -> String {
    content_hash(content)[..16].to_string()
}
