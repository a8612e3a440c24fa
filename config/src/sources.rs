//! The two file sources behind environment layering: a project `.env` and
//! the `[env]` table of the XDG `config.toml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::EnvLayerError;

/// Minimal .env grammar: `KEY=VALUE` lines, `#` comments, trimmed keys and
/// values, double quotes with `\"` escapes, single quotes verbatim. No
/// multiline values.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key, value);
    }
    out
}

/// Reads `.env` from `project_dir` (or the current directory). A missing
/// file yields an empty map.
pub fn dotenv_map(project_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let dir = match project_dir {
        Some(dir) => dir.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(_) => return Ok(HashMap::new()),
        },
    };
    let path = dir.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    Ok(parse_dotenv(&std::fs::read_to_string(path)?))
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

fn xdg_config_path(app_name: &str) -> Option<PathBuf> {
    let base = dirs::config_dir()?;
    let path = base.join(app_name).join("config.toml");
    path.is_file().then_some(path)
}

/// Reads the `[env]` table from the app's XDG `config.toml`. A missing file
/// or section yields an empty map.
pub fn xdg_env_map(app_name: &str) -> Result<HashMap<String, String>, EnvLayerError> {
    let Some(path) = xdg_config_path(app_name) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(EnvLayerError::XdgRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env)
}
