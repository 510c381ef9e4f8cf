use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// A named, fixed selection of state-store collections to back up.
///
/// The strategy table is a closed set built at startup and validated; hosts
/// pick a strategy by name, they never define new ones at runtime.
#[derive(Clone, Debug)]
pub struct BackupStrategy {
    pub name: String,
    pub collections: Vec<String>,
    pub priority: u8,
}

/// Cron cadence for one strategy, consumed by the scheduler collaborator.
#[derive(Clone, Debug)]
pub struct BackupSchedule {
    pub strategy: String,
    pub cron: String,
}

/// Optional S3-compatible remote storage settings.
///
/// Absent (no `S3_BUCKET`) means cloud backup is disabled and runs succeed
/// with `uploaded = false`.
#[derive(Clone, Debug)]
pub struct RemoteStorageConfig {
    pub bucket: String,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
    pub key_prefix: String,
    pub force_path_style: bool,
}

/// Typed configuration, loaded once at process start and passed by reference
/// into every component.
#[derive(Clone, Debug)]
pub struct Config {
    /// Passphrase the cipher key is derived from. Never written to output.
    pub encryption_key: String,

    // Session vault
    pub sessions_dir: PathBuf,
    pub creds_staging_path: PathBuf,

    // Backup
    pub backup_dir: PathBuf,
    pub max_local_archives: usize,
    pub strategies: Vec<BackupStrategy>,
    pub schedules: Vec<BackupSchedule>,

    // Remote storage
    pub remote: Option<RemoteStorageConfig>,
    pub upload_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let encryption_key = env_str("ENCRYPTION_KEY").and_then(non_empty).ok_or_else(|| {
            Error::Config("ENCRYPTION_KEY environment variable is required".to_string())
        })?;

        let sessions_dir = env_path("SESSIONS_DIR").unwrap_or_else(|| PathBuf::from("sessions"));
        let creds_staging_path =
            env_path("CREDS_STAGING_PATH").unwrap_or_else(|| PathBuf::from("creds.json"));

        let backup_dir = env_path("BACKUP_DIR").unwrap_or_else(|| PathBuf::from("backups"));
        let max_local_archives = env_usize("MAX_LOCAL_BACKUPS").unwrap_or(7);
        if max_local_archives == 0 {
            return Err(Error::Config(
                "MAX_LOCAL_BACKUPS must be at least 1".to_string(),
            ));
        }

        let strategies = default_strategies();
        validate_strategies(&strategies)?;

        let schedules = parse_schedules(
            env_str("BACKUP_SCHEDULES")
                .or_else(|| Some("DAILY=0 0 * * *;FULL=0 1 * * 0".to_string())),
            &strategies,
        )?;

        let remote = load_remote_config();
        let upload_timeout = Duration::from_secs(env_u64("UPLOAD_TIMEOUT_SECS").unwrap_or(120));

        Ok(Self {
            encryption_key,
            sessions_dir,
            creds_staging_path,
            backup_dir,
            max_local_archives,
            strategies,
            schedules,
            remote,
            upload_timeout,
        })
    }

    /// Look up a strategy by name (case-insensitive, so `DAILY` and `daily`
    /// address the same entry).
    pub fn strategy(&self, name: &str) -> Option<&BackupStrategy> {
        self.strategies
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

fn default_strategies() -> Vec<BackupStrategy> {
    vec![
        BackupStrategy {
            name: "full".to_string(),
            collections: vec![
                "users".to_string(),
                "groups".to_string(),
                "chats".to_string(),
            ],
            priority: 1,
        },
        BackupStrategy {
            name: "daily".to_string(),
            collections: vec!["users".to_string(), "groups".to_string()],
            priority: 2,
        },
        BackupStrategy {
            name: "light".to_string(),
            collections: vec!["users".to_string()],
            priority: 3,
        },
    ]
}

fn validate_strategies(strategies: &[BackupStrategy]) -> Result<()> {
    for (i, s) in strategies.iter().enumerate() {
        if s.name.trim().is_empty() {
            return Err(Error::Config("backup strategy with empty name".to_string()));
        }
        if s.name.contains('_') || s.name.contains('/') {
            // The name is embedded in archive file names and remote keys.
            return Err(Error::Config(format!(
                "backup strategy name contains reserved character: {}",
                s.name
            )));
        }
        if s.collections.is_empty() {
            return Err(Error::Config(format!(
                "backup strategy {} has no collections",
                s.name
            )));
        }
        if strategies[..i]
            .iter()
            .any(|o| o.name.eq_ignore_ascii_case(&s.name))
        {
            return Err(Error::Config(format!(
                "duplicate backup strategy name: {}",
                s.name
            )));
        }
    }
    Ok(())
}

fn parse_schedules(
    raw: Option<String>,
    strategies: &[BackupStrategy],
) -> Result<Vec<BackupSchedule>> {
    let mut out = Vec::new();
    for entry in raw.unwrap_or_default().split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((name, cron)) = entry.split_once('=') else {
            return Err(Error::Config(format!(
                "invalid BACKUP_SCHEDULES entry (expected strategy=cron): {entry}"
            )));
        };
        let name = name.trim();
        let cron = cron.trim();
        if !strategies.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
            return Err(Error::Config(format!(
                "BACKUP_SCHEDULES references unknown strategy: {name}"
            )));
        }
        out.push(BackupSchedule {
            strategy: name.to_lowercase(),
            cron: cron.to_string(),
        });
    }
    Ok(out)
}

fn load_remote_config() -> Option<RemoteStorageConfig> {
    let bucket = env_str("S3_BUCKET").and_then(non_empty)?;

    Some(RemoteStorageConfig {
        bucket,
        region: env_str("S3_REGION")
            .and_then(non_empty)
            .unwrap_or_else(|| "us-east-1".to_string()),
        access_key: env_str("S3_ACCESS_KEY").and_then(non_empty),
        secret_key: env_str("S3_SECRET_KEY").and_then(non_empty),
        endpoint: env_str("S3_ENDPOINT").and_then(non_empty),
        key_prefix: env_str("S3_KEY_PREFIX")
            .and_then(non_empty)
            .unwrap_or_else(|| "backups".to_string()),
        force_path_style: env_bool("S3_FORCE_PATH_STYLE").unwrap_or(false),
    })
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_table_is_valid() {
        let strategies = default_strategies();
        validate_strategies(&strategies).unwrap();
        assert_eq!(strategies.len(), 3);
        assert_eq!(strategies[0].collections.len(), 3);
    }

    #[test]
    fn strategy_lookup_is_case_insensitive() {
        let cfg = Config {
            encryption_key: "k".to_string(),
            sessions_dir: "/tmp".into(),
            creds_staging_path: "/tmp/creds.json".into(),
            backup_dir: "/tmp".into(),
            max_local_archives: 7,
            strategies: default_strategies(),
            schedules: vec![],
            remote: None,
            upload_timeout: Duration::from_secs(1),
        };
        assert!(cfg.strategy("DAILY").is_some());
        assert!(cfg.strategy("daily").is_some());
        assert!(cfg.strategy("hourly").is_none());
    }

    #[test]
    fn parse_schedules_accepts_known_strategies() {
        let strategies = default_strategies();
        let out = parse_schedules(
            Some("DAILY=0 0 * * *;FULL=0 1 * * 0".to_string()),
            &strategies,
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].strategy, "daily");
        assert_eq!(out[0].cron, "0 0 * * *");
    }

    #[test]
    fn parse_schedules_rejects_unknown_strategy() {
        let strategies = default_strategies();
        let err = parse_schedules(Some("HOURLY=0 * * * *".to_string()), &strategies).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn parse_schedules_rejects_malformed_entry() {
        let strategies = default_strategies();
        let err = parse_schedules(Some("DAILY 0 0 * * *".to_string()), &strategies).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
