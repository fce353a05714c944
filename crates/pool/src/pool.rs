//! The multi-account pool with file-locked atomic persistence.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use swarm_domain::error::{Error, Result};

use crate::fernet;
use crate::store::{
    AccountInfo, OAuthAccount, OAuthCredentials, PoolState, RateLimitEntry, EXPIRY_MARGIN_SECS,
};

/// How long to wait for the advisory file lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(90);
const LOCK_POLL: Duration = Duration::from_millis(100);

const CREDENTIALS_FILE: &str = "credentials.json";
const CREDENTIALS_TMP: &str = "credentials.json.tmp";
const LOCK_FILE: &str = "credentials.lock";
const KEY_FILE: &str = ".key";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File lock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Advisory lock held for the duration of a pool file operation.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, exclusive: bool, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL),
                Err(e) => {
                    return Err(Error::Timeout(format!(
                        "credential lock not acquired within {}s: {e}",
                        timeout.as_secs()
                    )))
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AccountPool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Encrypted, file-locked, multi-account credential pool.
///
/// The pool never trusts an in-memory copy across call boundaries: every
/// external read reloads from disk under the lock, which is what makes a
/// refresh in one process visible to every other process on its next call.
pub struct AccountPool {
    credentials_file: PathBuf,
    credentials_tmp: PathBuf,
    lock_file: PathBuf,
    key_file: PathBuf,
}

impl AccountPool {
    /// Open a pool rooted at `config_dir`, or the default
    /// `~/.claude_cpp_sdk` when `None`.
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let dir = match config_dir {
            Some(d) => d,
            None => dirs::home_dir()
                .ok_or_else(|| Error::Auth("could not determine home directory".into()))?
                .join(".claude_cpp_sdk"),
        };
        Ok(Self {
            credentials_file: dir.join(CREDENTIALS_FILE),
            credentials_tmp: dir.join(CREDENTIALS_TMP),
            lock_file: dir.join(LOCK_FILE),
            key_file: dir.join(KEY_FILE),
        })
    }

    pub fn credentials_exist(&self) -> bool {
        self.credentials_file.exists() && self.key_file.exists()
    }

    // ── Disk I/O (callers hold the file lock) ───────────────────────

    fn read_state(&self) -> Result<PoolState> {
        if !self.credentials_file.exists() {
            return Err(Error::CredentialsMissing(
                self.credentials_file.display().to_string(),
            ));
        }
        let key = std::fs::read_to_string(&self.key_file)
            .map_err(|e| Error::CredentialsUnreadable(format!("key file: {e}")))?;
        let token = std::fs::read_to_string(&self.credentials_file)
            .map_err(|e| Error::CredentialsUnreadable(e.to_string()))?;
        let plaintext = fernet::decrypt(&token, &key)?;
        let raw = String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("decrypted payload is not UTF-8: {e}")))?;
        PoolState::from_json(&raw)
    }

    /// Like [`read_state`](Self::read_state) but a missing file yields an
    /// empty pool, for first-write paths.
    fn read_state_or_default(&self) -> Result<PoolState> {
        match self.read_state() {
            Ok(state) => Ok(state),
            Err(Error::CredentialsMissing(_)) => Ok(PoolState::default()),
            Err(e) => Err(e),
        }
    }

    fn write_state(&self, state: &PoolState) -> Result<()> {
        if let Some(parent) = self.credentials_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let key = if self.key_file.exists() {
            std::fs::read_to_string(&self.key_file)
                .map_err(|e| Error::CredentialsUnreadable(format!("key file: {e}")))?
        } else {
            let key = fernet::generate_key();
            std::fs::write(&self.key_file, &key)?;
            restrict_permissions(&self.key_file)?;
            key
        };

        let token = fernet::encrypt(state.to_json()?.as_bytes(), &key)?;
        std::fs::write(&self.credentials_tmp, token)?;
        restrict_permissions(&self.credentials_tmp)?;
        std::fs::rename(&self.credentials_tmp, &self.credentials_file)?;
        Ok(())
    }

    // ── Atomic read-modify-write ────────────────────────────────────

    /// Lock, re-read from disk, apply `modify`, and persist if it returns
    /// `true`. Returns whether a write happened.
    pub fn update_on_disk<F>(&self, modify: F) -> Result<bool>
    where
        F: FnOnce(&mut PoolState) -> bool,
    {
        let _lock = FileLock::acquire(&self.lock_file, true, LOCK_TIMEOUT)?;
        let mut state = self.read_state_or_default()?;
        if !modify(&mut state) {
            return Ok(false);
        }
        self.write_state(&state)?;
        Ok(true)
    }

    /// Read the pool state fresh from disk under a shared lock.
    pub fn load(&self) -> Result<PoolState> {
        let _lock = FileLock::acquire(&self.lock_file, false, LOCK_TIMEOUT)?;
        self.read_state()
    }

    // ── Selection & rate limits ─────────────────────────────────────

    /// Highest-priority account that is neither expired nor rate-limited.
    ///
    /// When every account is rate-limited, returns the one whose limit
    /// lifts soonest so the caller can wait the minimum time. `None` only
    /// when the pool holds no usable account at all.
    pub fn get_best_available_account(&self) -> Result<Option<OAuthCredentials>> {
        let state = self.load()?;

        for account in state.sorted_accounts() {
            if state.is_available(account) {
                return Ok(Some(account.credentials.clone()));
            }
        }

        // All rate-limited (or expired): pick the soonest-available
        // rate-limited account.
        let soonest = state
            .sorted_accounts()
            .into_iter()
            .filter(|a| !a.credentials.is_expired(EXPIRY_MARGIN_SECS))
            .filter_map(|a| {
                state
                    .rate_limits
                    .get(&a.credentials.account_uuid)
                    .map(|rl| (rl.until_epoch, a))
            })
            .min_by_key(|(until, _)| *until)
            .map(|(_, a)| a.credentials.clone());

        if soonest.is_some() {
            tracing::warn!("all accounts rate-limited, returning soonest-available");
        }
        Ok(soonest)
    }

    pub fn mark_rate_limited(&self, account_uuid: &str, retry_after_s: i64) -> Result<()> {
        let until = chrono::Utc::now().timestamp() + retry_after_s;
        tracing::info!(
            account_uuid,
            retry_after_s,
            "marking account rate-limited"
        );
        self.update_on_disk(|state| {
            state.rate_limits.insert(
                account_uuid.to_owned(),
                RateLimitEntry {
                    until_epoch: until,
                    retry_after_s,
                },
            );
            true
        })?;
        Ok(())
    }

    pub fn is_account_available(&self, account_uuid: &str) -> Result<bool> {
        let state = self.load()?;
        Ok(state
            .find_account(account_uuid)
            .map(|a| state.is_available(a))
            .unwrap_or(false))
    }

    pub fn clear_rate_limits(&self) -> Result<()> {
        self.update_on_disk(|state| {
            let had_any = !state.rate_limits.is_empty();
            state.rate_limits.clear();
            had_any
        })?;
        Ok(())
    }

    // ── Account management ──────────────────────────────────────────

    /// Insert an account, replacing any existing entry with the same UUID.
    pub fn add_account(&self, credentials: OAuthCredentials, priority: i32) -> Result<()> {
        self.update_on_disk(|state| {
            if let Some(existing) = state.find_account_mut(&credentials.account_uuid) {
                existing.credentials = credentials;
                existing.priority = priority;
            } else {
                state.accounts.push(OAuthAccount {
                    credentials,
                    priority,
                });
            }
            true
        })?;
        Ok(())
    }

    /// Remove an account. Returns whether it existed.
    pub fn remove_account(&self, account_uuid: &str) -> Result<bool> {
        self.update_on_disk(|state| {
            let before = state.accounts.len();
            state
                .accounts
                .retain(|a| a.credentials.account_uuid != account_uuid);
            state.rate_limits.remove(account_uuid);
            state.accounts.len() != before
        })
    }

    /// Replace an account's credentials after a refresh.
    pub fn update_account_credentials(
        &self,
        account_uuid: &str,
        new_credentials: OAuthCredentials,
    ) -> Result<bool> {
        self.update_on_disk(|state| match state.find_account_mut(account_uuid) {
            Some(account) => {
                account.credentials = new_credentials;
                true
            }
            None => false,
        })
    }

    /// Swap the priorities of two accounts. Returns whether both existed.
    pub fn swap_priorities(&self, uuid_a: &str, uuid_b: &str) -> Result<bool> {
        self.update_on_disk(|state| {
            let pa = state.find_account(uuid_a).map(|a| a.priority);
            let pb = state.find_account(uuid_b).map(|a| a.priority);
            match (pa, pb) {
                (Some(pa), Some(pb)) => {
                    if let Some(a) = state.find_account_mut(uuid_a) {
                        a.priority = pb;
                    }
                    if let Some(b) = state.find_account_mut(uuid_b) {
                        b.priority = pa;
                    }
                    true
                }
                _ => false,
            }
        })
    }

    pub fn account_count(&self) -> Result<usize> {
        Ok(self.load()?.accounts.len())
    }

    /// Per-account status for display and diagnostics.
    pub fn accounts_info(&self) -> Result<Vec<AccountInfo>> {
        let state = self.load()?;
        Ok(state
            .sorted_accounts()
            .into_iter()
            .map(|a| {
                let rl = state.rate_limits.get(&a.credentials.account_uuid);
                AccountInfo {
                    priority: a.priority,
                    account_uuid: a.credentials.account_uuid.clone(),
                    is_rate_limited: rl.map(RateLimitEntry::is_rate_limited).unwrap_or(false),
                    seconds_until_available: rl
                        .map(RateLimitEntry::seconds_until_available)
                        .unwrap_or(0),
                    expires_at: a.credentials.expires_at,
                    expires_soon: a.credentials.is_expired(EXPIRY_MARGIN_SECS),
                }
            })
            .collect())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
