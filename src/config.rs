//! Runtime settings, read through the `config` crate.
//!
//! Settings are layered: built-in defaults, then an optional settings file,
//! then `BQL_*` environment variables (for example `BQL_MUTINF_SAMPLES=500`).

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Backend used by CREATE GENERATOR when no USING clause is given.
    pub default_backend: Option<String>,
    /// Monte Carlo samples for mutual information when the query names none.
    pub mutinf_samples: u32,
    /// Samples used by PREDICT and INFER when the query names none.
    pub predict_samples: u32,
    /// Accuracy hint handed to the backend by SIMULATE without ACCURACY.
    pub simulate_accuracy: Option<u32>,
    /// Prefix of the temporary tables SIMULATE materializes into.
    pub temp_prefix: String,
    /// Numeric columns with at most this many distinct values guess as nominal.
    pub guess_nominal_cutoff: u32,
    /// `tracing` filter directives used by [`crate::init_logging`].
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            default_backend: None,
            mutinf_samples: 100,
            predict_samples: 50,
            simulate_accuracy: None,
            temp_prefix: "bql_sim".to_string(),
            guess_nominal_cutoff: 20,
            log_filter: "bqlite=info".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if it exists) and the environment.
    pub fn load(path: Option<&str>) -> Result<Settings> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("mutinf_samples", defaults.mutinf_samples)?
            .set_default("predict_samples", defaults.predict_samples)?
            .set_default("temp_prefix", defaults.temp_prefix)?
            .set_default("guess_nominal_cutoff", defaults.guess_nominal_cutoff)?
            .set_default("log_filter", defaults.log_filter)?;
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("BQL"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let valid_prefix = !self.temp_prefix.is_empty()
            && self
                .temp_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_prefix {
            return Err(crate::error::BqlError::Config(format!(
                "temp_prefix must be a plain identifier, got {:?}",
                self.temp_prefix
            )));
        }
        if self.mutinf_samples == 0 || self.predict_samples == 0 {
            return Err(crate::error::BqlError::Config(
                "sample counts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_without_a_file() {
        let settings = Settings::load(Some("no-such-bqlite-settings")).unwrap();
        assert_eq!(settings.temp_prefix, "bql_sim");
        assert_eq!(settings.mutinf_samples, 100);
        assert!(settings.default_backend.is_none());
        assert_eq!(settings.log_filter, "bqlite=info");
    }

    #[test]
    fn a_settings_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("bqlite-settings-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "default_backend = \"scripted\"\nlog_filter = \"bqlite=debug\"\npredict_samples = 7\n",
        )
        .unwrap();
        let settings = Settings::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(settings.default_backend.as_deref(), Some("scripted"));
        assert_eq!(settings.log_filter, "bqlite=debug");
        assert_eq!(settings.predict_samples, 7);
        assert_eq!(settings.mutinf_samples, 100);
    }

    #[test]
    fn bad_prefixes_are_refused() {
        let path = std::env::temp_dir().join(format!("bqlite-prefix-{}.toml", std::process::id()));
        std::fs::write(&path, "temp_prefix = \"bad name\"\n").unwrap();
        let outcome = Settings::load(path.to_str());
        std::fs::remove_file(&path).unwrap();
        assert!(outcome.is_err());
    }
}
