use std::path::PathBuf;

use dendrimer_core::{DEFAULT_PLACEHOLDER, LoadOptions, LoadPolicy, ROOT_SENTINEL};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DmrError;

const DEFAULT_OUTPUT_DIR: &str = "./exports";

/// Settings read from `~/.config/dendrimer/config.toml`; command-line flags
/// take precedence over every field.
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct Config {
    pub include_metadata: Option<bool>,
    pub skip_malformed: Option<bool>,
    pub placeholder: Option<String>,
    pub root_sentinels: Option<Vec<String>>,
    pub output_dir: Option<PathBuf>,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, DmrError> {
        Ok(toml::from_str(content)?)
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dendrimer").join("config.toml"))
}

pub fn load_config() -> Config {
    let Some(path) = config_path() else {
        return Config::default();
    };

    let Ok(content) = std::fs::read_to_string(&path) else {
        return Config::default();
    };

    match Config::parse(&content) {
        Ok(config) => {
            debug!(path = %path.display(), "loaded config");
            config
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring invalid config");
            Config::default()
        }
    }
}

pub fn resolve_load_options(config: &Config, cli_skip_malformed: bool) -> LoadOptions {
    let skip = cli_skip_malformed || config.skip_malformed.unwrap_or(false);

    LoadOptions {
        policy: if skip {
            LoadPolicy::SkipMalformed
        } else {
            LoadPolicy::Strict
        },
        placeholder: config
            .placeholder
            .clone()
            .unwrap_or_else(|| DEFAULT_PLACEHOLDER.to_string()),
        root_sentinels: config
            .root_sentinels
            .clone()
            .unwrap_or_else(|| vec![ROOT_SENTINEL.to_string()]),
    }
}

pub fn resolve_include_metadata(config: &Config, cli_no_metadata: bool) -> bool {
    !cli_no_metadata && config.include_metadata.unwrap_or(true)
}

pub fn resolve_output_dir(config: &Config, cli_output: Option<PathBuf>) -> PathBuf {
    cli_output
        .or_else(|| config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_key() {
        let config = Config::parse(
            r#"
            include_metadata = false
            skip_malformed = true
            placeholder = "[tool]"
            root_sentinels = ["root", "none"]
            output_dir = "/tmp/out"
            "#,
        )
        .unwrap();

        assert_eq!(config.include_metadata, Some(false));
        assert_eq!(config.skip_malformed, Some(true));
        assert_eq!(config.placeholder.as_deref(), Some("[tool]"));
        assert_eq!(config.root_sentinels, Some(vec!["root".to_string(), "none".to_string()]));
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn wrong_type_is_a_config_error() {
        let err = Config::parse("skip_malformed = \"yes\"").unwrap_err();
        assert!(matches!(err, DmrError::Config(_)));
    }

    #[test]
    fn defaults_without_config() {
        let config = Config::default();
        let options = resolve_load_options(&config, false);

        assert_eq!(options.policy, LoadPolicy::Strict);
        assert_eq!(options.placeholder, DEFAULT_PLACEHOLDER);
        assert_eq!(options.root_sentinels, [ROOT_SENTINEL]);
        assert!(resolve_include_metadata(&config, false));
        assert_eq!(resolve_output_dir(&config, None), PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn flags_override_config() {
        let config = Config {
            include_metadata: Some(true),
            skip_malformed: Some(false),
            output_dir: Some(PathBuf::from("from-config")),
            ..Config::default()
        };

        assert_eq!(resolve_load_options(&config, true).policy, LoadPolicy::SkipMalformed);
        assert!(!resolve_include_metadata(&config, true));
        assert_eq!(
            resolve_output_dir(&config, Some(PathBuf::from("from-cli"))),
            PathBuf::from("from-cli")
        );
        assert_eq!(resolve_output_dir(&config, None), PathBuf::from("from-config"));
    }

    #[test]
    fn config_overrides_defaults() {
        let config = Config {
            include_metadata: Some(false),
            skip_malformed: Some(true),
            placeholder: Some("[tool]".to_string()),
            ..Config::default()
        };

        let options = resolve_load_options(&config, false);
        assert_eq!(options.policy, LoadPolicy::SkipMalformed);
        assert_eq!(options.placeholder, "[tool]");
        assert!(!resolve_include_metadata(&config, false));
    }
}
