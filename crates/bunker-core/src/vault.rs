use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::Config, crypto::Cipher, errors::Error, Result};

/// Artifacts the external protocol library persists per session. The names
/// and the `.enc` suffix are a fixed on-disk contract; do not change them.
pub const TRACKED_ARTIFACTS: [&str; 2] = ["creds.json", "keys.json"];

/// Minimum artifact set a usable session must have.
const REQUIRED_ARTIFACTS: [&str; 1] = ["creds.json"];

pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Result of [`SessionVault::load`]: where the plaintext working copies live
/// and which artifacts are available to the protocol library.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub session_dir: PathBuf,
    /// Tracked artifacts present in plaintext after the load.
    pub artifacts: Vec<String>,
    /// True when no prior session material existed at all.
    pub fresh: bool,
}

/// Manages one directory of per-session secret artifacts, encrypting on
/// `save` and decrypting on `load`.
///
/// The protocol library expects plaintext files at fixed paths, so a
/// decrypted working copy exists on disk for the lifetime of the process.
/// That window is the accepted compromise; outside it only `<name>.enc`
/// remains. All directory mutation is serialized through one in-process
/// mutex — concurrent encrypt/delete sequences on the same files would lose
/// artifacts.
pub struct SessionVault {
    cfg: Arc<Config>,
    cipher: Arc<Cipher>,
    lock: Mutex<()>,
}

impl SessionVault {
    pub fn new(cfg: Arc<Config>, cipher: Arc<Cipher>) -> Self {
        Self {
            cfg,
            cipher,
            lock: Mutex::new(()),
        }
    }

    /// Decrypt all session artifacts into working plaintext form, adopting a
    /// staged credential bundle first if one is present. Returns a
    /// fresh-empty state when no session material exists yet.
    pub async fn load(&self, session_id: &str) -> Result<SessionState> {
        let _guard = self.lock.lock().await;

        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir)?;

        self.adopt_staged_bundle(&dir)?;

        let mut artifacts = Vec::new();
        let mut any_encrypted = false;

        for name in TRACKED_ARTIFACTS {
            let plain = dir.join(name);
            let enc = encrypted_path(&dir, name);

            if enc.exists() {
                any_encrypted = true;
                // An already-present plaintext copy (e.g. a just-adopted
                // bundle) supersedes the encrypted form.
                if !plain.exists() {
                    let sealed = fs::read(&enc)?;
                    let payload = self.cipher.open(&sealed)?;
                    fs::write(&plain, payload)?;
                    debug!(session = session_id, artifact = name, "decrypted session artifact");
                }
            }

            if plain.exists() {
                artifacts.push(name.to_string());
            }
        }

        let fresh = artifacts.is_empty() && !any_encrypted;
        if fresh {
            info!(session = session_id, "no session material found, starting fresh");
        }

        Ok(SessionState {
            session_dir: dir,
            artifacts,
            fresh,
        })
    }

    /// Encrypt every tracked plaintext artifact and remove its plaintext
    /// predecessor. Encrypt-then-delete: the plaintext file is only removed
    /// once its encrypted replacement is fully on disk.
    pub async fn save(&self, session_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let dir = self.session_dir(session_id)?;
        if !dir.exists() {
            return Err(Error::Config(format!(
                "no session directory for {session_id}"
            )));
        }

        for name in TRACKED_ARTIFACTS {
            let plain = dir.join(name);
            if !plain.exists() {
                continue;
            }

            let payload = fs::read(&plain)?;
            let sealed = self.cipher.seal(&payload)?;

            let enc = encrypted_path(&dir, name);
            let tmp = enc.with_extension("enc.tmp");
            fs::write(&tmp, &sealed)?;
            fs::rename(&tmp, &enc)?;

            fs::remove_file(&plain)?;
            debug!(session = session_id, artifact = name, "encrypted session artifact");
        }

        Ok(())
    }

    /// Health check: can the session's artifacts be decrypted, and is the
    /// minimum required set present? Never exposes contents; any failure
    /// reads as "not valid".
    pub async fn validate(&self, session_id: &str) -> bool {
        let _guard = self.lock.lock().await;

        let Ok(dir) = self.session_dir(session_id) else {
            return false;
        };
        if !dir.exists() {
            return false;
        }

        for name in TRACKED_ARTIFACTS {
            let enc = encrypted_path(&dir, name);
            if !enc.exists() {
                continue;
            }
            let sealed = match fs::read(&enc) {
                Ok(v) => v,
                Err(e) => {
                    warn!(session = session_id, artifact = name, error = %e, "unreadable session artifact");
                    return false;
                }
            };
            if let Err(e) = self.cipher.open(&sealed) {
                warn!(session = session_id, artifact = name, error = %e, "session artifact failed validation");
                return false;
            }
        }

        REQUIRED_ARTIFACTS.iter().all(|name| {
            dir.join(name).exists() || encrypted_path(&dir, name).exists()
        })
    }

    /// Explicit session teardown (logout): removes both plaintext and
    /// encrypted forms of every artifact.
    pub async fn invalidate(&self, session_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let dir = self.session_dir(session_id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!(session = session_id, "session invalidated");
        }
        Ok(())
    }

    /// Move an externally supplied plaintext credential bundle from the
    /// staging location into the managed session directory. The staging copy
    /// must never remain readable after adoption.
    fn adopt_staged_bundle(&self, dir: &Path) -> Result<()> {
        let staging = &self.cfg.creds_staging_path;
        if !staging.exists() {
            return Ok(());
        }

        let target = dir.join(REQUIRED_ARTIFACTS[0]);
        if fs::rename(staging, &target).is_err() {
            // Cross-device staging location: fall back to copy + remove.
            fs::copy(staging, &target)?;
            fs::remove_file(staging)?;
        }

        info!(path = %target.display(), "adopted staged credential bundle");
        Ok(())
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "invalid session id: {session_id}"
            )));
        }
        Ok(self.cfg.sessions_dir.join(format!("session_{session_id}")))
    }
}

fn encrypted_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{ENCRYPTED_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        let dir = PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_vault(base: &Path) -> SessionVault {
        let cfg = Arc::new(Config {
            encryption_key: "test-passphrase".to_string(),
            sessions_dir: base.join("sessions"),
            creds_staging_path: base.join("creds.json"),
            backup_dir: base.join("backups"),
            max_local_archives: 7,
            strategies: vec![],
            schedules: vec![],
            remote: None,
            upload_timeout: Duration::from_secs(1),
        });
        let cipher = Arc::new(Cipher::new(&cfg.encryption_key).unwrap());
        SessionVault::new(cfg, cipher)
    }

    fn seed_plaintext(vault_base: &Path, session_id: &str) -> PathBuf {
        let dir = vault_base.join("sessions").join(format!("session_{session_id}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("creds.json"), br#"{"me":"100@s"}"#).unwrap();
        fs::write(dir.join("keys.json"), br#"{"signal":[1,2,3]}"#).unwrap();
        dir
    }

    #[tokio::test]
    async fn save_encrypts_and_removes_plaintext() {
        let base = tmp("bunker-vault-save");
        let vault = test_vault(&base);
        let dir = seed_plaintext(&base, "main");

        vault.save("main").await.unwrap();

        for name in TRACKED_ARTIFACTS {
            assert!(!dir.join(name).exists(), "plaintext {name} must be gone");
            assert!(dir.join(format!("{name}.enc")).exists());
        }
    }

    #[tokio::test]
    async fn load_restores_plaintext_working_copies() {
        let base = tmp("bunker-vault-load");
        let vault = test_vault(&base);
        let dir = seed_plaintext(&base, "main");
        vault.save("main").await.unwrap();

        let state = vault.load("main").await.unwrap();
        assert!(!state.fresh);
        assert_eq!(state.session_dir, dir);
        assert_eq!(state.artifacts, vec!["creds.json", "keys.json"]);
        assert_eq!(
            fs::read(dir.join("creds.json")).unwrap(),
            br#"{"me":"100@s"}"#
        );
    }

    #[tokio::test]
    async fn load_without_material_is_fresh_empty() {
        let base = tmp("bunker-vault-fresh");
        let vault = test_vault(&base);

        let state = vault.load("new").await.unwrap();
        assert!(state.fresh);
        assert!(state.artifacts.is_empty());
    }

    #[tokio::test]
    async fn staged_bundle_is_adopted_and_staging_copy_removed() {
        let base = tmp("bunker-vault-staging");
        let vault = test_vault(&base);
        fs::write(base.join("creds.json"), br#"{"uploaded":true}"#).unwrap();

        let state = vault.load("main").await.unwrap();
        assert!(!base.join("creds.json").exists(), "staging copy must be gone");
        assert!(state.artifacts.contains(&"creds.json".to_string()));
        assert_eq!(
            fs::read(state.session_dir.join("creds.json")).unwrap(),
            br#"{"uploaded":true}"#
        );

        // The adopted bundle is encrypted on the next save.
        vault.save("main").await.unwrap();
        assert!(state.session_dir.join("creds.json.enc").exists());
        assert!(!state.session_dir.join("creds.json").exists());
    }

    #[tokio::test]
    async fn adopted_bundle_supersedes_old_encrypted_creds() {
        let base = tmp("bunker-vault-supersede");
        let vault = test_vault(&base);
        seed_plaintext(&base, "main");
        vault.save("main").await.unwrap();

        fs::write(base.join("creds.json"), br#"{"uploaded":2}"#).unwrap();
        let state = vault.load("main").await.unwrap();
        assert_eq!(
            fs::read(state.session_dir.join("creds.json")).unwrap(),
            br#"{"uploaded":2}"#
        );
    }

    #[tokio::test]
    async fn validate_accepts_saved_session_and_rejects_tampering() {
        let base = tmp("bunker-vault-validate");
        let vault = test_vault(&base);
        let dir = seed_plaintext(&base, "main");
        vault.save("main").await.unwrap();

        assert!(vault.validate("main").await);
        assert!(!vault.validate("other").await);

        // Flip one byte of the encrypted credentials.
        let enc = dir.join("creds.json.enc");
        let mut sealed = fs::read(&enc).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        fs::write(&enc, sealed).unwrap();

        assert!(!vault.validate("main").await);
    }

    #[tokio::test]
    async fn validate_requires_credentials_artifact() {
        let base = tmp("bunker-vault-required");
        let vault = test_vault(&base);
        let dir = base.join("sessions").join("session_main");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("keys.json"), b"{}").unwrap();
        vault.save("main").await.unwrap();

        // keys.json alone is not a usable session.
        assert!(!vault.validate("main").await);
    }

    #[tokio::test]
    async fn invalidate_removes_both_forms() {
        let base = tmp("bunker-vault-invalidate");
        let vault = test_vault(&base);
        let dir = seed_plaintext(&base, "main");
        vault.save("main").await.unwrap();

        vault.invalidate("main").await.unwrap();
        assert!(!dir.exists());
        assert!(!vault.validate("main").await);
    }

    #[tokio::test]
    async fn rejects_path_traversal_session_ids() {
        let base = tmp("bunker-vault-traversal");
        let vault = test_vault(&base);
        for bad in ["../etc", "a/b", ""] {
            let err = vault.load(bad).await.unwrap_err();
            assert!(matches!(err, Error::Config(_)), "id {bad:?}");
        }
    }
}
