use crate::{LevelFilter, Logger, LoggerError, Rotation};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// The `logging` section of a service configuration file.
///
/// ```toml
/// [logging]
/// name = "orders"
/// level = "debug"
/// env_filter = "courier_event_bus=trace"
/// directory = "./logs"
/// rotation = "hourly"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub name: String,
    pub level: String,
    pub env_filter: Option<String>,
    pub console: bool,
    pub directory: Option<PathBuf>,
    pub rotation: String,
    pub max_files: usize,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            name: "courier".to_owned(),
            level: "info".to_owned(),
            env_filter: None,
            console: true,
            directory: None,
            rotation: "daily".to_owned(),
            max_files: crate::DEFAULT_MAX_FILES,
            json: false,
        }
    }
}

impl LogSettings {
    /// Parses the textual level (`trace` .. `error`, `off`).
    ///
    /// # Errors
    /// Returns [`LoggerError::InvalidConfiguration`] for unknown levels.
    pub fn level_filter(&self) -> Result<LevelFilter, LoggerError> {
        LevelFilter::from_str(&self.level).map_err(|e| LoggerError::InvalidConfiguration {
            message: format!("Unknown log level '{}': {e}", self.level).into(),
            context: None,
        })
    }

    /// Parses the textual rotation (`minutely`, `hourly`, `daily`, `never`).
    ///
    /// # Errors
    /// Returns [`LoggerError::InvalidConfiguration`] for unknown rotations.
    pub fn rotation(&self) -> Result<Rotation, LoggerError> {
        match self.rotation.to_ascii_lowercase().as_str() {
            "minutely" => Ok(Rotation::MINUTELY),
            "hourly" => Ok(Rotation::HOURLY),
            "daily" => Ok(Rotation::DAILY),
            "never" => Ok(Rotation::NEVER),
            other => Err(LoggerError::InvalidConfiguration {
                message: format!("Unknown log rotation '{other}'").into(),
                context: None,
            }),
        }
    }
}

impl Logger {
    /// Initializes the global subscriber from a [`LogSettings`] section.
    ///
    /// # Errors
    /// Same as [`crate::LoggerBuilder::init`], plus invalid level/rotation strings.
    pub fn from_settings(settings: &LogSettings) -> Result<Self, LoggerError> {
        let level = settings.level_filter()?;
        let mut builder = Self::builder().name(&settings.name).console(settings.console).level(level);
        if let Some(filter) = &settings.env_filter {
            builder = builder.env_filter(filter);
        }

        let Some(directory) = &settings.directory else {
            return builder.init();
        };

        let builder =
            builder.path(directory).rotation(settings.rotation()?).max_files(settings.max_files);
        if settings.json { builder.json().init() } else { builder.init() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_console_info_daily() {
        let settings = LogSettings::default();
        assert!(settings.console);
        assert_eq!(settings.level_filter().unwrap(), LevelFilter::INFO);
        assert_eq!(settings.rotation().unwrap(), Rotation::DAILY);
        assert!(settings.directory.is_none());
    }

    #[test]
    fn rejects_unknown_level_and_rotation() {
        let settings = LogSettings {
            level: "loud".into(),
            rotation: "weekly".into(),
            ..LogSettings::default()
        };
        assert!(matches!(settings.level_filter(), Err(LoggerError::InvalidConfiguration { .. })));
        assert!(matches!(settings.rotation(), Err(LoggerError::InvalidConfiguration { .. })));
    }

    #[test]
    fn rotation_is_case_insensitive() {
        let settings = LogSettings { rotation: "Hourly".into(), ..LogSettings::default() };
        assert_eq!(settings.rotation().unwrap(), Rotation::HOURLY);
    }
}
