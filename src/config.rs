//! Poller configuration.
//!
//! Values come from `KEY=value` sources layered in increasing precedence:
//!
//! 1. `~/.gitlab-poller/.env`, or `./.env` when that file does not exist
//! 2. the process environment
//! 3. the legacy `~/.gitlab-poller/config` file (or the file given with `--config`)
//! 4. command line flags
//!
//! [`PollerConfig::resolve`] validates the merged values before anything is
//! constructed; every problem is reported in a single initialization error.

use crate::error::PollError;
use crate::services::fetcher::ScopeTarget;
use crate::services::scheduler::DEFAULT_POLL_INTERVAL;
use crate::store::rest::{RestStoreConfig, DEFAULT_EVENTS_TABLE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://gitlab.com";

/// Default polling interval in minutes.
pub const DEFAULT_INTERVAL_MINUTES: u64 = 1;

/// Raw key/value pairs after layering.
pub type ConfigValues = HashMap<String, String>;

/// What the poller watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Open merge requests for a reviewer.
    MergeRequests,

    /// The activity event stream.
    Events,
}

/// Which store records are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    Sqlite,
    Rest,
}

/// Settings that only the command line provides or overrides.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub interval_minutes: Option<u64>,
    pub db_path: Option<PathBuf>,
    pub store: Option<StoreKind>,
    pub reviewer: Option<String>,
    pub project: Option<String>,
    pub group: Option<String>,
    pub no_notify: bool,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub mode: PollMode,
    pub base_url: String,
    pub access_token: String,
    pub group_id: Option<String>,
    pub project_id: Option<String>,

    /// Numeric user id or username. Always set in merge request mode.
    pub reviewer: Option<String>,

    pub interval: Duration,
    pub store: StoreKind,
    pub db_path: PathBuf,

    /// Present when the REST store is selected.
    pub rest: Option<RestStoreConfig>,

    pub notify: bool,
}

/// Parse the legacy `config` file.
///
/// One `KEY=value` per line, split at the first `=` and trimmed. Blank lines
/// and lines starting with `#` are skipped. No quoting or escapes.
pub fn parse_legacy_config(content: &str) -> ConfigValues {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Read a legacy `config` file. A missing file yields no values.
pub fn read_legacy_config(path: &Path) -> Result<ConfigValues, PollError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            log::info!("Loaded configuration from {} (legacy format)", path.display());
            Ok(parse_legacy_config(&content))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigValues::new()),
        Err(e) => Err(PollError::initialization(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Read a `.env` file. `Ok(None)` when it does not exist.
pub fn read_dotenv(path: &Path) -> Result<Option<ConfigValues>, PollError> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(None),
        Err(e) => {
            return Err(PollError::initialization(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let values = iter
        .collect::<Result<ConfigValues, _>>()
        .map_err(|e| PollError::initialization(format!("Failed to parse {}: {}", path.display(), e)))?;
    log::info!("Loaded configuration from {}", path.display());
    Ok(Some(values))
}

/// Merge sources; later layers win. Empty values do not override.
pub fn layer<I>(layers: I) -> ConfigValues
where
    I: IntoIterator<Item = ConfigValues>,
{
    let mut merged = ConfigValues::new();
    for values in layers {
        merged.extend(values.into_iter().filter(|(_, v)| !v.trim().is_empty()));
    }
    merged
}

/// Load the file and environment layers.
///
/// `data_dir` is normally `~/.gitlab-poller`; its `.env` is used when present,
/// otherwise the `.env` in `working_dir`. `config_file` replaces the legacy
/// `config` file inside `data_dir`.
pub fn load_values<E>(
    data_dir: Option<&Path>,
    working_dir: Option<&Path>,
    config_file: Option<&Path>,
    env: E,
) -> Result<ConfigValues, PollError>
where
    E: IntoIterator<Item = (String, String)>,
{
    let home_dotenv = match data_dir {
        Some(dir) => read_dotenv(&dir.join(".env"))?,
        None => None,
    };
    let dotenv = match (home_dotenv, working_dir) {
        (Some(values), _) => values,
        (None, Some(dir)) => read_dotenv(&dir.join(".env"))?.unwrap_or_default(),
        (None, None) => ConfigValues::new(),
    };

    let legacy = match (config_file, data_dir) {
        (Some(file), _) => {
            if !file.exists() {
                return Err(PollError::initialization(format!(
                    "Config file {} does not exist",
                    file.display()
                )));
            }
            read_legacy_config(file)?
        }
        (None, Some(dir)) => read_legacy_config(&dir.join("config"))?,
        (None, None) => ConfigValues::new(),
    };

    Ok(layer([dotenv, env.into_iter().collect(), legacy]))
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

impl PollerConfig {
    /// Validate merged values and CLI overrides into a configuration.
    pub fn resolve(
        mode: PollMode,
        values: &ConfigValues,
        overrides: &CliOverrides,
        default_db_path: Option<PathBuf>,
    ) -> Result<Self, PollError> {
        let get = |key: &str| values.get(key).map(|v| v.trim().to_string());

        let mut missing = Vec::new();
        let mut problems = Vec::new();

        let base_url = get("GITLAB_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            problems.push(format!("GITLAB_BASE_URL must be an http(s) URL, got '{}'", base_url));
        }

        let access_token = get("GITLAB_ACCESS_TOKEN").unwrap_or_default();
        if access_token.is_empty() {
            missing.push("GITLAB_ACCESS_TOKEN");
        }

        let reviewer = overrides.reviewer.clone().or_else(|| get("GITLAB_REVIEWER_ID"));
        if mode == PollMode::MergeRequests && reviewer.is_none() {
            missing.push("GITLAB_REVIEWER_ID");
        }

        let interval_minutes = match overrides.interval_minutes {
            Some(minutes) => Some(minutes),
            None => match get("POLLING_INTERVAL") {
                Some(raw) => match raw.parse::<u64>() {
                    Ok(minutes) => Some(minutes),
                    Err(_) => {
                        problems.push(format!("POLLING_INTERVAL must be a whole number of minutes, got '{}'", raw));
                        None
                    }
                },
                None => Some(DEFAULT_INTERVAL_MINUTES),
            },
        };
        if interval_minutes == Some(0) {
            problems.push("POLLING_INTERVAL must be at least 1 minute".to_string());
        }
        let interval = interval_minutes.and_then(|minutes| minutes.checked_mul(60).map(Duration::from_secs));
        if let (Some(minutes), None) = (interval_minutes, interval) {
            problems.push(format!("POLLING_INTERVAL of {} minutes is too large", minutes));
        }

        let supabase_url = get("SUPABASE_URL");
        let supabase_key = get("SUPABASE_SECRET_KEY");
        let store = overrides.store.unwrap_or(if supabase_url.is_some() {
            StoreKind::Rest
        } else {
            StoreKind::Sqlite
        });

        let rest = match store {
            StoreKind::Rest => {
                if supabase_url.is_none() {
                    missing.push("SUPABASE_URL");
                }
                if supabase_key.is_none() {
                    missing.push("SUPABASE_SECRET_KEY");
                }
                match (supabase_url, supabase_key) {
                    (Some(url), Some(key)) => {
                        let mut rest = RestStoreConfig::new(url, key);
                        rest.events_table = get("SUPABASE_TABLE_NAME")
                            .unwrap_or_else(|| DEFAULT_EVENTS_TABLE.to_string());
                        Some(rest)
                    }
                    _ => None,
                }
            }
            StoreKind::Sqlite => None,
        };

        let db_path = overrides
            .db_path
            .clone()
            .or_else(|| get("GITLAB_POLLER_DB").map(PathBuf::from))
            .or(default_db_path);
        if store == StoreKind::Sqlite && db_path.is_none() {
            problems.push("No home directory found; set GITLAB_POLLER_DB".to_string());
        }

        if !missing.is_empty() {
            problems.insert(
                0,
                format!("Missing required configuration: {}", missing.join(", ")),
            );
        }
        if !problems.is_empty() {
            return Err(PollError::initialization(problems.join("; ")));
        }

        let notify = !overrides.no_notify && get("GITLAB_POLLER_NOTIFY").map_or(true, |v| is_truthy(&v));

        Ok(Self {
            mode,
            base_url,
            access_token,
            group_id: overrides.group.clone().or_else(|| get("GITLAB_GROUP_ID")),
            project_id: overrides.project.clone().or_else(|| get("GITLAB_PROJECT_ID")),
            reviewer,
            interval: interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            store,
            db_path: db_path.unwrap_or_default(),
            rest,
            notify,
        })
    }

    /// Where to look, given the mode.
    ///
    /// A project narrows a group. `GITLAB_PROJECT_ID=all` means every
    /// accessible project. The events API has no group scope, so events
    /// ignore the group.
    pub fn scope(&self) -> ScopeTarget {
        let project = self
            .project_id
            .as_deref()
            .filter(|p| !p.eq_ignore_ascii_case("all"));

        match (project, self.group_id.as_deref(), self.mode) {
            (Some(project), _, _) => ScopeTarget::Project(project.to_string()),
            (None, Some(group), PollMode::MergeRequests) => ScopeTarget::Group(group.to_string()),
            _ => ScopeTarget::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn values(pairs: &[(&str, &str)]) -> ConfigValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resolve(mode: PollMode, pairs: &[(&str, &str)]) -> Result<PollerConfig, PollError> {
        PollerConfig::resolve(
            mode,
            &values(pairs),
            &CliOverrides::default(),
            Some(PathBuf::from("/tmp/db.sqlite")),
        )
    }

    #[test]
    fn test_parse_legacy_config() {
        let parsed = parse_legacy_config(
            r#"
            # comment
            GITLAB_BASE_URL=https://gitlab.example.com
            GITLAB_ACCESS_TOKEN=glpat-abc==
            POLLING_INTERVAL = 5
            NOT_A_PAIR
            =missing-key
            "#,
        );

        assert_eq!(parsed["GITLAB_BASE_URL"], "https://gitlab.example.com");
        assert_eq!(parsed["GITLAB_ACCESS_TOKEN"], "glpat-abc==");
        assert_eq!(parsed["POLLING_INTERVAL"], "5");
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_dotenv_syntax() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# poller\nGITLAB_GROUP_ID=acme # team group\nexport GITLAB_ACCESS_TOKEN=\"glpat-abc==\"\nGITLAB_REVIEWER_ID='alice'\n",
        )
        .unwrap();

        let values = read_dotenv(&path).unwrap().unwrap();
        assert_eq!(values["GITLAB_GROUP_ID"], "acme");
        assert_eq!(values["GITLAB_ACCESS_TOKEN"], "glpat-abc==");
        assert_eq!(values["GITLAB_REVIEWER_ID"], "alice");
        assert!(read_dotenv(&dir.path().join("absent.env")).unwrap().is_none());
    }

    #[test]
    fn test_working_dir_dotenv_is_a_fallback() {
        let home = tempdir().unwrap();
        let cwd = tempdir().unwrap();
        std::fs::write(cwd.path().join(".env"), "GITLAB_GROUP_ID=from-cwd\n").unwrap();

        let merged = load_values(Some(home.path()), Some(cwd.path()), None, Vec::new()).unwrap();
        assert_eq!(merged["GITLAB_GROUP_ID"], "from-cwd");

        std::fs::write(home.path().join(".env"), "GITLAB_PROJECT_ID=from-home\n").unwrap();
        let merged = load_values(Some(home.path()), Some(cwd.path()), None, Vec::new()).unwrap();
        assert_eq!(merged["GITLAB_PROJECT_ID"], "from-home");
        assert!(!merged.contains_key("GITLAB_GROUP_ID"));
    }

    #[test]
    fn test_layer_precedence() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "GITLAB_ACCESS_TOKEN=from-dotenv\nGITLAB_GROUP_ID=dotenv-group\nPOLLING_INTERVAL=3\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("config"), "GITLAB_ACCESS_TOKEN=from-legacy\n").unwrap();

        let env = vec![
            ("GITLAB_GROUP_ID".to_string(), "env-group".to_string()),
            ("GITLAB_ACCESS_TOKEN".to_string(), "from-env".to_string()),
        ];
        let merged = load_values(Some(dir.path()), None, None, env).unwrap();

        assert_eq!(merged["GITLAB_ACCESS_TOKEN"], "from-legacy");
        assert_eq!(merged["GITLAB_GROUP_ID"], "env-group");
        assert_eq!(merged["POLLING_INTERVAL"], "3");
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        let dir = tempdir().unwrap();
        let err = load_values(None, None, Some(&dir.path().join("nope")), Vec::new()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_directory_files_are_ignored() {
        let dir = tempdir().unwrap();
        let merged = load_values(Some(&dir.path().join("absent")), None, None, Vec::new()).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = resolve(
            PollMode::MergeRequests,
            &[("GITLAB_ACCESS_TOKEN", "t"), ("GITLAB_REVIEWER_ID", "alice")],
        )
        .unwrap();

        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.store, StoreKind::Sqlite);
        assert!(config.notify);
        assert_eq!(config.scope(), ScopeTarget::All);
    }

    #[test]
    fn test_missing_keys_are_all_reported() {
        let err = resolve(PollMode::MergeRequests, &[]).unwrap_err();
        let message = err.to_string();

        assert!(err.is_fatal());
        assert!(message.contains("GITLAB_ACCESS_TOKEN"));
        assert!(message.contains("GITLAB_REVIEWER_ID"));
    }

    #[test]
    fn test_events_mode_does_not_need_reviewer() {
        let config = resolve(PollMode::Events, &[("GITLAB_ACCESS_TOKEN", "t")]).unwrap();
        assert!(config.reviewer.is_none());
    }

    #[test]
    fn test_invalid_interval() {
        for raw in ["abc", "0", "-1"] {
            let err = resolve(
                PollMode::Events,
                &[("GITLAB_ACCESS_TOKEN", "t"), ("POLLING_INTERVAL", raw)],
            )
            .unwrap_err();
            assert!(err.to_string().contains("POLLING_INTERVAL"), "{}", raw);
        }
    }

    #[test]
    fn test_oversized_interval_is_rejected() {
        let overrides = CliOverrides {
            interval_minutes: Some(u64::MAX),
            ..Default::default()
        };
        let err = PollerConfig::resolve(
            PollMode::Events,
            &values(&[("GITLAB_ACCESS_TOKEN", "t")]),
            &overrides,
            None,
        )
        .unwrap_err();

        assert!(err.is_fatal());
        assert!(err.to_string().contains("too large"));

        let err = resolve(
            PollMode::Events,
            &[("GITLAB_ACCESS_TOKEN", "t"), ("POLLING_INTERVAL", "307445734561825861")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let overrides = CliOverrides {
            interval_minutes: Some(10),
            db_path: Some(PathBuf::from("/data/poller.db")),
            reviewer: Some("bob".to_string()),
            no_notify: true,
            ..Default::default()
        };
        let config = PollerConfig::resolve(
            PollMode::MergeRequests,
            &values(&[
                ("GITLAB_ACCESS_TOKEN", "t"),
                ("GITLAB_REVIEWER_ID", "alice"),
                ("POLLING_INTERVAL", "2"),
                ("GITLAB_POLLER_DB", "/env/db.sqlite"),
            ]),
            &overrides,
            None,
        )
        .unwrap();

        assert_eq!(config.interval, Duration::from_secs(600));
        assert_eq!(config.db_path, PathBuf::from("/data/poller.db"));
        assert_eq!(config.reviewer.as_deref(), Some("bob"));
        assert!(!config.notify);
    }

    #[test]
    fn test_rest_store_selected_by_supabase_url() {
        let config = resolve(
            PollMode::Events,
            &[
                ("GITLAB_ACCESS_TOKEN", "t"),
                ("SUPABASE_URL", "https://xyz.supabase.co"),
                ("SUPABASE_SECRET_KEY", "key"),
                ("SUPABASE_TABLE_NAME", "events_log"),
            ],
        )
        .unwrap();

        assert_eq!(config.store, StoreKind::Rest);
        let rest = config.rest.unwrap();
        assert_eq!(rest.events_table, "events_log");
    }

    #[test]
    fn test_rest_store_requires_key() {
        let overrides = CliOverrides {
            store: Some(StoreKind::Rest),
            ..Default::default()
        };
        let err = PollerConfig::resolve(
            PollMode::Events,
            &values(&[("GITLAB_ACCESS_TOKEN", "t")]),
            &overrides,
            None,
        )
        .unwrap_err();

        assert!(err.to_string().contains("SUPABASE_URL"));
        assert!(err.to_string().contains("SUPABASE_SECRET_KEY"));
    }

    #[test]
    fn test_scope_selection() {
        let base = [("GITLAB_ACCESS_TOKEN", "t"), ("GITLAB_REVIEWER_ID", "alice")];

        let mut pairs = base.to_vec();
        pairs.push(("GITLAB_GROUP_ID", "my-group"));
        let config = resolve(PollMode::MergeRequests, &pairs).unwrap();
        assert_eq!(config.scope(), ScopeTarget::Group("my-group".to_string()));

        pairs.push(("GITLAB_PROJECT_ID", "my-group/app"));
        let config = resolve(PollMode::MergeRequests, &pairs).unwrap();
        assert_eq!(config.scope(), ScopeTarget::Project("my-group/app".to_string()));

        let config = resolve(
            PollMode::Events,
            &[
                ("GITLAB_ACCESS_TOKEN", "t"),
                ("GITLAB_GROUP_ID", "my-group"),
                ("GITLAB_PROJECT_ID", "all"),
            ],
        )
        .unwrap();
        assert_eq!(config.scope(), ScopeTarget::All);
    }

    #[test]
    fn test_notify_flag_from_values() {
        let config = resolve(
            PollMode::Events,
            &[("GITLAB_ACCESS_TOKEN", "t"), ("GITLAB_POLLER_NOTIFY", "false")],
        )
        .unwrap();
        assert!(!config.notify);
    }
}
