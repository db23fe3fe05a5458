//! Service configuration read from `trilha.toml`.
//!
//! Layering is file → environment → CLI flags. A missing file yields the
//! defaults. Environment overrides (`TRILHA_HOST`, `TRILHA_PORT`,
//! `TRILHA_DB_PATH`, `TRILHA_LOG_FORMAT`) are applied after `.env` is loaded.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3150
//! db_path = ".trilha/trilha.db"
//! cors_permissive = false
//! broadcast_capacity = 256
//!
//! [logging]
//! filter = "info,trilha=debug"
//! format = "pretty"          # or "json"
//! directory = "logs"         # optional daily rolling file
//!
//! [pipeline]
//! sessions_per_schedule = 1
//! utc_offset_minutes = -180
//!
//! [pendency]
//! lookback_days = 30
//! birthday_window_days = 7
//!
//! [[board.views]]
//! name = "entrada"
//! label = "Entrada"
//! statuses = ["intake-documents", "awaiting-triage", "triage-scheduled"]
//!
//! [messages.templates]
//! alta = "Olá {first_name}, seu acompanhamento foi encerrado."
//!
//! [[occupancy]]
//! weekday = "monday"
//! time = "14:00"
//! room = "Sala 1"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use trilha_common::DayOfWeek;

use crate::pipeline::PipelineSettings;
use crate::pipeline::board::BoardView;
use crate::pipeline::collaborators::{OccupancyMap, RoomTrack, TemplateComposer};
use crate::pipeline::pendency::PendencySettings;

pub const DEFAULT_CONFIG_FILE: &str = "trilha.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Allow any origin. Meant for local frontend development.
    #[serde(default)]
    pub cors_permissive: bool,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".trilha/trilha.db")
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors_permissive: false,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `EnvFilter` directives. `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    #[serde(default = "default_sessions_per_schedule")]
    pub sessions_per_schedule: usize,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

fn default_sessions_per_schedule() -> usize {
    1
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            sessions_per_schedule: default_sessions_per_schedule(),
            utc_offset_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendencySection {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_birthday_window_days")]
    pub birthday_window_days: i64,
}

const MAX_LOOKBACK_DAYS: i64 = 3650;
const MAX_BIRTHDAY_WINDOW_DAYS: i64 = 366;

fn default_lookback_days() -> i64 {
    PendencySettings::default().lookback_days
}

fn default_birthday_window_days() -> i64 {
    PendencySettings::default().birthday_window_days
}

impl Default for PendencySection {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            birthday_window_days: default_birthday_window_days(),
        }
    }
}

/// Board views. Empty means the built-in presets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoardSection {
    #[serde(default)]
    pub views: Vec<BoardView>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagesSection {
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

/// A recurring slot already taken: a room, or the online track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OccupancyEntry {
    pub weekday: DayOfWeek,
    /// `HH:MM`
    pub time: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub online: bool,
}

impl OccupancyEntry {
    fn parsed_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.time, "%H:%M").ok()
    }

    fn track(&self) -> Option<RoomTrack> {
        if self.online {
            return Some(RoomTrack::Online);
        }
        self.room
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| RoomTrack::Room(r.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrilhaConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub pendency: PendencySection,
    #[serde(default)]
    pub board: BoardSection,
    #[serde(default)]
    pub messages: MessagesSection,
    #[serde(default)]
    pub occupancy: Vec<OccupancyEntry>,
}

impl TrilhaConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse trilha.toml")
    }

    /// Defaults when `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize trilha.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TRILHA_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("TRILHA_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TRILHA_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid TRILHA_PORT '{}'", port))?;
        }
        if let Some(db_path) = lookup("TRILHA_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(format) = lookup("TRILHA_LOG_FORMAT") {
            self.logging.format = format
                .parse()
                .with_context(|| "Invalid TRILHA_LOG_FORMAT".to_string())?;
        }
        Ok(())
    }

    /// Problems worth reporting; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.sessions_per_schedule == 0 {
            warnings.push("pipeline.sessions_per_schedule must be at least 1".to_string());
        }
        if let Some(offset) = self.pipeline.utc_offset_minutes
            && !(-14 * 60..=14 * 60).contains(&offset)
        {
            warnings.push(format!(
                "pipeline.utc_offset_minutes {} is outside -840..=840",
                offset
            ));
        }
        if self.server.broadcast_capacity == 0 {
            warnings.push("server.broadcast_capacity must be at least 1".to_string());
        }
        if !(1..=MAX_LOOKBACK_DAYS).contains(&self.pendency.lookback_days) {
            warnings.push(format!(
                "pendency.lookback_days {} is outside 1..={}",
                self.pendency.lookback_days, MAX_LOOKBACK_DAYS
            ));
        }
        if !(0..=MAX_BIRTHDAY_WINDOW_DAYS).contains(&self.pendency.birthday_window_days) {
            warnings.push(format!(
                "pendency.birthday_window_days {} is outside 0..={}",
                self.pendency.birthday_window_days, MAX_BIRTHDAY_WINDOW_DAYS
            ));
        }

        let mut names = HashSet::new();
        for view in &self.board.views {
            if view.statuses.is_empty() {
                warnings.push(format!("Board view '{}' has no statuses", view.name));
            }
            if !names.insert(view.name.as_str()) {
                warnings.push(format!("Duplicate board view name '{}'", view.name));
            }
        }

        for (i, entry) in self.occupancy.iter().enumerate() {
            if entry.parsed_time().is_none() {
                warnings.push(format!(
                    "occupancy[{}]: time '{}' is not HH:MM",
                    i, entry.time
                ));
            }
            if entry.track().is_none() {
                warnings.push(format!(
                    "occupancy[{}]: set a room or online = true",
                    i
                ));
            }
        }

        for (id, template) in &self.messages.templates {
            if template.trim().is_empty() {
                warnings.push(format!("Message template '{}' is empty", id));
            }
        }

        warnings
    }

    /// Configured views, or the presets when none are configured.
    pub fn views(&self) -> Vec<BoardView> {
        if self.board.views.is_empty() {
            BoardView::presets()
        } else {
            self.board.views.clone()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            sessions_per_schedule: self.pipeline.sessions_per_schedule.max(1),
            utc_offset_minutes: self.pipeline.utc_offset_minutes,
            pendency: PendencySettings {
                lookback_days: self.pendency.lookback_days,
                birthday_window_days: self.pendency.birthday_window_days,
            },
        }
    }

    /// Entries that fail validation are skipped.
    pub fn occupancy_map(&self) -> OccupancyMap {
        let mut map = OccupancyMap::new();
        for entry in &self.occupancy {
            if let (Some(time), Some(track)) = (entry.parsed_time(), entry.track()) {
                map.mark_occupied(entry.weekday, time, track);
            }
        }
        map
    }

    pub fn composer(&self) -> TemplateComposer {
        TemplateComposer::new(self.messages.templates.clone())
    }
}

/// The starter file written by `trilha init`.
pub fn starter_config() -> String {
    let mut templates = HashMap::new();
    templates.insert(
        "alta".to_string(),
        "Olá {first_name}, seu acompanhamento na clínica foi encerrado. Estamos à disposição."
            .to_string(),
    );
    let config = TrilhaConfig {
        messages: MessagesSection { templates },
        ..Default::default()
    };
    toml::to_string_pretty(&config).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::collaborators::RoomOccupancy;
    use trilha_common::StageKey;

    // =========================================
    // Parsing
    // =========================================

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = TrilhaConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3150);
        assert_eq!(config.server.db_path, PathBuf::from(".trilha/trilha.db"));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.pipeline.sessions_per_schedule, 1);
        assert_eq!(config.pendency.lookback_days, 30);
        assert_eq!(config.views().len(), 5);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[server]
port = 4000
cors_permissive = true

[logging]
format = "json"
directory = "logs"

[pipeline]
sessions_per_schedule = 4
utc_offset_minutes = -180

[[board.views]]
name = "triagem"
label = "Triagem"
statuses = ["awaiting-triage", "triage-scheduled"]

[messages.templates]
alta = "Olá {first_name}"

[[occupancy]]
weekday = "monday"
time = "14:00"
room = "Sala 1"
"#;
        let config = TrilhaConfig::parse(content).unwrap();
        assert_eq!(config.server.port, 4000);
        assert!(config.server.cors_permissive);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.directory, Some(PathBuf::from("logs")));
        assert_eq!(config.pipeline_settings().sessions_per_schedule, 4);
        let views = config.views();
        assert_eq!(views.len(), 1);
        assert_eq!(
            views[0].statuses,
            vec![StageKey::AwaitingTriage, StageKey::TriageScheduled]
        );
        let map = config.occupancy_map();
        assert!(map.is_occupied(
            DayOfWeek::Monday,
            NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            &RoomTrack::Room("Sala 1".into())
        ));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_unknown_status_is_a_parse_error() {
        let content = r#"
[[board.views]]
name = "x"
label = "X"
statuses = ["in-limbo"]
"#;
        assert!(TrilhaConfig::parse(content).is_err());
    }

    // =========================================
    // Validation
    // =========================================

    #[test]
    fn test_validate_reports_problems() {
        let content = r#"
[pipeline]
sessions_per_schedule = 0

[[board.views]]
name = "a"
label = "A"
statuses = []

[[board.views]]
name = "a"
label = "A again"
statuses = ["discharged"]

[[occupancy]]
weekday = "friday"
time = "late"
"#;
        let warnings = TrilhaConfig::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("sessions_per_schedule")));
        assert!(warnings.iter().any(|w| w.contains("no statuses")));
        assert!(warnings.iter().any(|w| w.contains("Duplicate board view")));
        assert!(warnings.iter().any(|w| w.contains("not HH:MM")));
        assert!(warnings.iter().any(|w| w.contains("set a room")));
    }

    #[test]
    fn test_validate_bounds_day_windows() {
        let content = r#"
[pipeline]
utc_offset_minutes = 2147483647

[pendency]
lookback_days = 9223372036854775807
birthday_window_days = 400
"#;
        let warnings = TrilhaConfig::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 3, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("pendency.lookback_days")));
        assert!(warnings.iter().any(|w| w.contains("pendency.birthday_window_days")));
        assert!(warnings.iter().any(|w| w.contains("utc_offset_minutes")));

        let mut config = TrilhaConfig::default();
        config.pendency.lookback_days = 3650;
        config.pendency.birthday_window_days = 366;
        assert!(config.validate().is_empty());
    }

    // =========================================
    // Layering
    // =========================================

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = TrilhaConfig::parse("[server]\nport = 4000\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("TRILHA_PORT", "5000"),
            ("TRILHA_DB_PATH", "/tmp/other.db"),
            ("TRILHA_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_bad_env_port_is_an_error() {
        let mut config = TrilhaConfig::default();
        let result =
            config.apply_env_from(|k| (k == "TRILHA_PORT").then(|| "not-a-port".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrilhaConfig::load_or_default(&dir.path().join("trilha.toml")).unwrap();
        assert_eq!(config, TrilhaConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trilha.toml");
        std::fs::write(&path, starter_config()).unwrap();
        let config = TrilhaConfig::load(&path).unwrap();
        assert!(config.messages.templates.contains_key("alta"));
        assert!(config.validate().is_empty());
    }
}
