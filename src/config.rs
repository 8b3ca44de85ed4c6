//! Configuration management
//!
//! Stores settings in ~/.config/fathom/config.json. The OPENAI_API_KEY
//! environment variable always takes precedence over the config file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub openai_api_key: Option<String>,
    /// Model identifier sent to the chat-completions endpoint.
    pub model: Option<String>,
    /// Directory for the on-disk explanation store. Defaults to the
    /// platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fathom"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        write_config_atomic(&path, &content)
    }

    /// Get the OpenAI API key (environment variable takes precedence).
    pub fn get_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                return Some(key);
            }
        }
        self.openai_api_key.clone()
    }

    /// Set and save the API key
    pub fn set_api_key(&mut self, key: &str) -> anyhow::Result<()> {
        self.openai_api_key = Some(key.to_string());
        self.save()
    }

    /// Model identifier, falling back to the fixed default.
    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(crate::gateway::DEFAULT_MODEL)
    }

    /// Directory holding the on-disk store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fathom")
        })
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/fathom/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &std::path::Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Interactive prompt to set up the API key
pub fn setup_api_key_interactive() -> anyhow::Result<()> {
    use std::io::{self, Write};

    println!();
    println!("  Fathom uses the OpenAI API to generate explanations.");
    println!("  Paste your API key below (saved to the config file).");
    println!();
    print!("  API Key: ");
    io::stdout().flush()?;

    let mut key = String::new();
    io::stdin().read_line(&mut key)?;
    let key = key.trim();

    if key.is_empty() {
        anyhow::bail!("No API key provided");
    }

    let mut config = Config::load();
    config.set_api_key(key)?;

    println!();
    println!("  + API key saved to {}", Config::config_location());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_key() {
        let config = Config::default();
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.model_id(), crate::gateway::DEFAULT_MODEL);
    }
}
