//! Process-environment layering for the underwrite host.
//!
//! Keys are gathered from the project `.env` and from the `[env]` table of
//! `$XDG_CONFIG_HOME/underwrite/config.toml`, then applied to the process
//! environment for keys that are not already set. Precedence:
//! **existing env > .env > XDG config**.

mod sources;

use std::path::Path;

use thiserror::Error;

/// The application directory under the XDG config home.
pub const APP_NAME: &str = "underwrite";

#[derive(Debug, Error)]
pub enum EnvLayerError {
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg config: {0}")]
    XdgParse(#[from] toml::de::Error),
}

/// Applies layered configuration to the process environment.
///
/// * `project_dir`: where to look for `.env`; `None` means the current
///   working directory.
///
/// Keys already present in the environment are never overwritten, so
/// operator overrides always win over files.
pub fn layer_process_env(project_dir: Option<&Path>) -> Result<(), EnvLayerError> {
    layer_for_app(APP_NAME, project_dir)
}

fn layer_for_app(app_name: &str, project_dir: Option<&Path>) -> Result<(), EnvLayerError> {
    let xdg = sources::xdg_env_map(app_name)?;
    let dotenv = sources::dotenv_map(project_dir).map_err(EnvLayerError::DotenvRead)?;

    let mut keys: std::collections::BTreeSet<&String> = xdg.keys().collect();
    keys.extend(dotenv.keys());

    for key in keys {
        if std::env::var(key).is_ok() {
            continue;
        }
        if let Some(value) = dotenv.get(key).or_else(|| xdg.get(key)) {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins_over_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "UW_TEST_EXISTING=from_dotenv\n").unwrap();
        env::set_var("UW_TEST_EXISTING", "from_env");
        layer_for_app("underwrite-test-none", Some(dir.path())).unwrap();
        assert_eq!(env::var("UW_TEST_EXISTING").as_deref(), Ok("from_env"));
        env::remove_var("UW_TEST_EXISTING");
    }

    /// XDG-dependent cases share one test so parallel tests never race on
    /// the process-wide XDG_CONFIG_HOME variable.
    #[test]
    fn xdg_layering_behaviors() {
        let xdg_dir = tempfile::tempdir().unwrap();
        for (app, content) in [
            ("underwrite-test-prio", "[env]\nUW_TEST_PRIORITY = \"from_xdg\"\n"),
            ("underwrite-test-xdg", "[env]\nUW_TEST_XDG_ONLY = \"from_xdg\"\n"),
            ("underwrite-test-bad", "not toml [[[\n"),
        ] {
            let app_dir = xdg_dir.path().join(app);
            std::fs::create_dir_all(&app_dir).unwrap();
            std::fs::write(app_dir.join("config.toml"), content).unwrap();
        }
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(".env"), "UW_TEST_PRIORITY=from_dotenv\n").unwrap();
        let empty_project = tempfile::tempdir().unwrap();

        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());
        env::remove_var("UW_TEST_PRIORITY");
        env::remove_var("UW_TEST_XDG_ONLY");

        // .env beats the XDG table for the same key.
        layer_for_app("underwrite-test-prio", Some(project.path())).unwrap();
        let priority = env::var("UW_TEST_PRIORITY").ok();

        // The XDG table applies when .env is absent.
        layer_for_app("underwrite-test-xdg", Some(empty_project.path())).unwrap();
        let xdg_only = env::var("UW_TEST_XDG_ONLY").ok();

        // Malformed TOML surfaces as a parse error.
        let bad = layer_for_app("underwrite-test-bad", Some(empty_project.path()));

        env::remove_var("UW_TEST_PRIORITY");
        env::remove_var("UW_TEST_XDG_ONLY");
        restore("XDG_CONFIG_HOME", prev);

        assert_eq!(priority.as_deref(), Some("from_dotenv"));
        assert_eq!(xdg_only.as_deref(), Some("from_xdg"));
        assert!(matches!(bad, Err(EnvLayerError::XdgParse(_))));
    }

    #[test]
    fn missing_files_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        assert!(layer_for_app("underwrite-test-absent", Some(dir.path())).is_ok());
    }
}
