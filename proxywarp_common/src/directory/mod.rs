//! Persistent bidirectional mapping between short tokens and upstream
//! origins.
//!
//! One mutex guards the whole directory state, including disk I/O during
//! load and save. The contention envelope is low (one write per token
//! creation, one timestamp refresh per request), so read concurrency is
//! traded for a simple locking story.

pub mod token;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::state::{Config, Protocol};

/// How long after a domain miss the file is considered stale enough to
/// reload before allocating a fresh token.
const DOMAIN_MISS_RELOAD: Duration = Duration::from_secs(60);
/// Same, for token lookups.
const TOKEN_MISS_RELOAD: Duration = Duration::from_secs(30);
/// A non-forced save younger than this is debounced instead.
const IMMEDIATE_SAVE_AFTER: Duration = Duration::from_secs(10);
/// Delay of a debounced save.
const DEBOUNCE_DELAY: Duration = Duration::from_secs(2);
/// Background flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Background reload cadence, for processes sharing one db file.
const RELOAD_INTERVAL: Duration = Duration::from_secs(120);

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One upstream origin, as persisted. The token is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub domain: String,
    pub protocol: Protocol,
    /// Last-access instant, unix ms. Refreshed on every lookup.
    pub timestamp: u64,
}

/// Last-resort copy of an entry, kept in memory so a corrupt db file can
/// be rebuilt without losing live tokens.
#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub entry: TokenEntry,
    pub source: &'static str,
}

pub struct DirectorySettings {
    pub db_file: PathBuf,
    pub token_length: usize,
    pub token_expiration: Duration,
    pub cleanup_interval: Duration,
}

impl DirectorySettings {
    pub fn from_config(config: &Config) -> Self {
        DirectorySettings {
            db_file: config.db_file.clone(),
            token_length: config.token_length,
            token_expiration: Duration::from_millis(config.token_expiration_ms),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
        }
    }
}

struct DirectoryInner {
    by_token: HashMap<String, TokenEntry>,
    by_domain: HashMap<String, String>,
    backup: HashMap<String, BackupEntry>,
    dirty: bool,
    save_scheduled: bool,
    loading: bool,
    last_save: Instant,
    last_load: Instant,
}

impl DirectoryInner {
    fn touch(&mut self, token: &str) {
        if let Some(entry) = self.by_token.get_mut(token) {
            entry.timestamp = unix_ms();
            if let Some(backed) = self.backup.get_mut(token) {
                backed.entry.timestamp = entry.timestamp;
            }
            self.dirty = true;
        }
    }
}

/// Cheaply cloneable handle over the shared directory state.
#[derive(Clone)]
pub struct TokenDirectory {
    inner: Arc<Mutex<DirectoryInner>>,
    settings: Arc<DirectorySettings>,
}

impl TokenDirectory {
    /// Create a directory backed by `settings.db_file` and load whatever
    /// the file currently holds (an absent file is materialised empty).
    pub fn open(settings: DirectorySettings) -> Self {
        let dir = TokenDirectory {
            inner: Arc::new(Mutex::new(DirectoryInner {
                by_token: HashMap::new(),
                by_domain: HashMap::new(),
                backup: HashMap::new(),
                dirty: false,
                save_scheduled: false,
                loading: false,
                last_save: Instant::now(),
                last_load: Instant::now(),
            })),
            settings: Arc::new(settings),
        };
        {
            let mut inner = dir.lock();
            dir.load_locked(&mut inner);
        }
        dir
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up (or lazily allocate) the token mapped to `domain`.
    ///
    /// A hit refreshes the entry timestamp. A miss against a stale file
    /// reloads once before allocating. Allocation persists immediately.
    pub fn token_for_domain(&self, domain: &str, protocol: Protocol) -> String {
        let domain = domain.to_ascii_lowercase();
        let mut inner = self.lock();

        if let Some(found) = inner.by_domain.get(&domain).cloned() {
            inner.touch(&found);
            self.save_locked(&mut inner, false);
            return found;
        }

        if inner.last_load.elapsed() > DOMAIN_MISS_RELOAD {
            self.load_locked(&mut inner);
            if let Some(found) = inner.by_domain.get(&domain).cloned() {
                inner.touch(&found);
                self.save_locked(&mut inner, false);
                return found;
            }
        }

        let generated = token::generate(self.settings.token_length, unix_ms(), |candidate| {
            inner.by_token.contains_key(candidate)
        });
        let entry = TokenEntry {
            domain: domain.clone(),
            protocol,
            timestamp: unix_ms(),
        };
        inner.by_token.insert(generated.clone(), entry.clone());
        inner.by_domain.insert(domain.clone(), generated.clone());
        inner.backup.insert(
            generated.clone(),
            BackupEntry {
                entry,
                source: "created",
            },
        );
        info!(token = %generated, domain = %domain, "allocated proxy token");
        self.save_locked(&mut inner, true);
        generated
    }

    /// Resolve a token to its upstream origin, refreshing the timestamp.
    ///
    /// Misses fall back to the in-memory backup (re-materialising the
    /// entry), then to one reload when the file is stale.
    pub fn domain_info_from_token(&self, token: &str) -> Option<TokenEntry> {
        if token.is_empty() || !token::TOKEN_RE.is_match(token) {
            return None;
        }
        let mut inner = self.lock();

        if let Some(found) = self.lookup_locked(&mut inner, token) {
            return Some(found);
        }

        if inner.last_load.elapsed() > TOKEN_MISS_RELOAD {
            self.load_locked(&mut inner);
            if let Some(found) = self.lookup_locked(&mut inner, token) {
                return Some(found);
            }
        }
        None
    }

    fn lookup_locked(&self, inner: &mut DirectoryInner, token: &str) -> Option<TokenEntry> {
        if inner.by_token.contains_key(token) {
            inner.touch(token);
            self.save_locked(inner, false);
            return inner.by_token.get(token).cloned();
        }
        if let Some(backed) = inner.backup.get(token).cloned() {
            debug!(token = %token, source = backed.source, "re-materialising entry from backup");
            inner
                .by_domain
                .insert(backed.entry.domain.clone(), token.to_string());
            inner.by_token.insert(token.to_string(), backed.entry);
            inner.touch(token);
            self.save_locked(inner, false);
            return inner.by_token.get(token).cloned();
        }
        None
    }

    /// Synchronous reload from disk; returns the resulting entry count.
    pub fn force_reload(&self) -> usize {
        let mut inner = self.lock();
        self.load_locked(&mut inner);
        inner.by_token.len()
    }

    /// Flush to disk now if the in-memory state has diverged.
    pub fn flush(&self) {
        let mut inner = self.lock();
        if inner.dirty {
            self.write_locked(&mut inner);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostics: every live `(token, entry)` pair.
    pub fn all_entries(&self) -> Vec<(String, TokenEntry)> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner
            .by_token
            .iter()
            .map(|(t, e)| (t.clone(), e.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Diagnostics: backup size and per-source counts.
    pub fn backup_info(&self) -> (usize, HashMap<&'static str, usize>) {
        let inner = self.lock();
        let mut by_source: HashMap<&'static str, usize> = HashMap::new();
        for backed in inner.backup.values() {
            *by_source.entry(backed.source).or_default() += 1;
        }
        (inner.backup.len(), by_source)
    }

    /// Mark dirty and either persist now or leave it to the debounce
    /// timer. Fresh allocations pass `force` so a crash right after a
    /// redirect cannot lose the token.
    fn save_locked(&self, inner: &mut DirectoryInner, force: bool) {
        inner.dirty = true;
        if force || inner.last_save.elapsed() > IMMEDIATE_SAVE_AFTER {
            self.write_locked(inner);
            return;
        }
        if inner.save_scheduled {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                inner.save_scheduled = true;
                let dir = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(DEBOUNCE_DELAY).await;
                    dir.flush_scheduled();
                });
            }
            // No timer wheel without a runtime; write inline.
            Err(_) => self.write_locked(inner),
        }
    }

    fn flush_scheduled(&self) {
        let mut inner = self.lock();
        inner.save_scheduled = false;
        if inner.dirty {
            self.write_locked(&mut inner);
        }
    }

    /// Serialise `by_token` and atomically rename it over the db file.
    /// Failures leave `dirty` set so the next tick retries.
    fn write_locked(&self, inner: &mut DirectoryInner) {
        match self.write_file(&inner.by_token) {
            Ok(()) => {
                inner.dirty = false;
                inner.last_save = Instant::now();
                debug!(entries = inner.by_token.len(), "token database saved");
            }
            Err(err) => {
                error!(error = %err, "failed to save token database");
            }
        }
    }

    fn write_file(&self, by_token: &HashMap<String, TokenEntry>) -> Result<(), GatewayError> {
        let path = &self.settings.db_file;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| GatewayError::Persistence(format!("mkdir {parent:?}: {e}")))?;
            }
        }
        // Stable key order so repeated saves of equal state are identical.
        let ordered: BTreeMap<&String, &TokenEntry> = by_token.iter().collect();
        let payload = serde_json::to_vec_pretty(&ordered)
            .map_err(|e| GatewayError::Persistence(format!("serialise: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .map_err(|e| GatewayError::Persistence(format!("write {tmp:?}: {e}")))?;
        fs::rename(&tmp, path)
            .map_err(|e| GatewayError::Persistence(format!("rename {tmp:?}: {e}")))?;
        Ok(())
    }

    /// Replace in-memory state from disk. Parse failures fall back to the
    /// in-memory backup; I/O failures with an empty backup reset to an
    /// empty, immediately persisted state.
    fn load_locked(&self, inner: &mut DirectoryInner) {
        if inner.loading {
            return;
        }
        inner.loading = true;

        let path = &self.settings.db_file;
        if !path.exists() {
            inner.by_token.clear();
            inner.by_domain.clear();
            self.write_locked(inner);
            inner.last_load = Instant::now();
            inner.loading = false;
            return;
        }

        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, TokenEntry>>(&bytes) {
                Ok(loaded) => {
                    inner.by_token.clear();
                    inner.by_domain.clear();
                    for (tok, entry) in loaded {
                        if !token::TOKEN_RE.is_match(&tok)
                            || !token::DOMAIN_RE.is_match(&entry.domain)
                        {
                            warn!(token = %tok, domain = %entry.domain, "skipping malformed entry");
                            continue;
                        }
                        inner.by_domain.insert(entry.domain.clone(), tok.clone());
                        inner.backup.insert(
                            tok.clone(),
                            BackupEntry {
                                entry: entry.clone(),
                                source: "file",
                            },
                        );
                        inner.by_token.insert(tok, entry);
                    }
                    inner.dirty = false;
                    debug!(entries = inner.by_token.len(), "token database loaded");
                }
                Err(err) => {
                    warn!(error = %err, "token database unparseable");
                    self.recover_locked(inner);
                }
            },
            Err(err) => {
                error!(error = %err, "token database unreadable");
                self.recover_locked(inner);
            }
        }
        inner.last_load = Instant::now();
        inner.loading = false;
    }

    /// Rebuild from backup if we have one, otherwise start over empty.
    /// Either way the recovered state is persisted at once.
    fn recover_locked(&self, inner: &mut DirectoryInner) {
        inner.by_token.clear();
        inner.by_domain.clear();
        if !inner.backup.is_empty() {
            let backup = inner.backup.clone();
            for (tok, backed) in backup {
                inner.by_domain.insert(backed.entry.domain.clone(), tok.clone());
                inner.by_token.insert(tok, backed.entry);
            }
            info!(entries = inner.by_token.len(), "token database rebuilt from backup");
        } else {
            warn!("token database reset to empty state");
        }
        self.write_locked(inner);
    }

    /// Drop every entry idle for longer than the configured expiration,
    /// from the live maps and the backup alike.
    pub fn cleanup(&self) {
        let horizon = unix_ms().saturating_sub(self.settings.token_expiration.as_millis() as u64);
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .by_token
            .iter()
            .filter(|(_, e)| e.timestamp < horizon)
            .map(|(t, _)| t.clone())
            .collect();
        for tok in &expired {
            if let Some(entry) = inner.by_token.remove(tok) {
                inner.by_domain.remove(&entry.domain);
            }
            inner.backup.remove(tok);
        }
        inner
            .backup
            .retain(|_, backed| backed.entry.timestamp >= horizon);
        if !expired.is_empty() {
            info!(removed = expired.len(), "expired tokens swept");
            self.save_locked(&mut inner, false);
        }
    }

    /// Spawn the background flush / reload / cleanup loops.
    pub fn spawn_maintenance(&self) {
        let flusher = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tick.tick().await;
                flusher.flush();
            }
        });

        let reloader = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RELOAD_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let mut inner = reloader.lock();
                // Best-effort cross-process pickup; never clobber unsaved
                // local changes.
                if !inner.loading && !inner.dirty {
                    reloader.load_locked(&mut inner);
                }
            }
        });

        let sweeper = self.clone();
        let cleanup_interval = self.settings.cleanup_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cleanup_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                sweeper.cleanup();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_db() -> PathBuf {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "proxywarp-dir-test-{}-{}-{}.json",
            std::process::id(),
            seq,
            unix_ms()
        ))
    }

    fn settings(db_file: PathBuf) -> DirectorySettings {
        DirectorySettings {
            db_file,
            token_length: 6,
            token_expiration: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
        }
    }

    #[test]
    fn token_for_domain_is_idempotent_and_refreshes_timestamp() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));

        let first = dir.token_for_domain("Example.com", Protocol::Https);
        let before = dir
            .domain_info_from_token(&first)
            .map(|e| e.timestamp)
            .unwrap_or_default();
        std::thread::sleep(Duration::from_millis(5));
        let second = dir.token_for_domain("example.com", Protocol::Https);
        assert_eq!(first, second);

        let after = dir
            .domain_info_from_token(&second)
            .map(|e| e.timestamp)
            .unwrap_or_default();
        assert!(after >= before, "timestamp must move forward");
        let _ = fs::remove_file(db);
    }

    #[test]
    fn bijection_holds_after_mixed_operations() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));

        for domain in ["a.com", "b.net", "c.org", "d.dev", "a.com"] {
            dir.token_for_domain(domain, Protocol::Https);
        }
        for (tok, _) in dir.all_entries() {
            dir.domain_info_from_token(&tok);
        }

        let entries = dir.all_entries();
        assert_eq!(entries.len(), 4);
        for (tok, entry) in &entries {
            let back = dir.token_for_domain(&entry.domain, entry.protocol);
            assert_eq!(&back, tok, "by_domain must invert by_token");
        }
        let _ = fs::remove_file(db);
    }

    #[test]
    fn lookup_rejects_malformed_tokens() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));
        assert!(dir.domain_info_from_token("").is_none());
        assert!(dir.domain_info_from_token("UPPER").is_none());
        assert!(dir.domain_info_from_token("with space").is_none());
        assert!(dir.domain_info_from_token("nope42").is_none());
        let _ = fs::remove_file(db);
    }

    #[test]
    fn persistence_round_trip() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));
        let token = dir.token_for_domain("example.com", Protocol::Http);
        dir.flush();

        let reopened = TokenDirectory::open(settings(db.clone()));
        let entry = reopened
            .domain_info_from_token(&token)
            .expect("entry must survive a reload");
        assert_eq!(entry.domain, "example.com");
        assert_eq!(entry.protocol, Protocol::Http);
        assert_eq!(reopened.force_reload(), 1);
        let _ = fs::remove_file(db);
    }

    #[test]
    fn unparseable_file_recovers_from_backup() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));
        let token = dir.token_for_domain("example.com", Protocol::Https);

        fs::write(&db, b"{ this is not json").expect("corrupt the db file");
        let count = dir.force_reload();
        assert_eq!(count, 1, "backup must rebuild the directory");
        assert!(dir.domain_info_from_token(&token).is_some());

        // The recovery path force-saved a clean file.
        let bytes = fs::read(&db).expect("db file must exist");
        let parsed: HashMap<String, TokenEntry> =
            serde_json::from_slice(&bytes).expect("recovered file must parse");
        assert_eq!(parsed.len(), 1);
        let _ = fs::remove_file(db);
    }

    #[test]
    fn save_is_atomic_under_a_stale_tmp_file() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));
        dir.token_for_domain("example.com", Protocol::Https);
        dir.flush();
        let saved = fs::read(&db).expect("saved db");

        // A crash between tmp write and rename leaves a stray tmp file;
        // the real db must be untouched by it.
        fs::write(db.with_extension("json.tmp"), b"garbage").expect("stray tmp");
        let reopened = TokenDirectory::open(settings(db.clone()));
        assert_eq!(reopened.len(), 1);
        assert_eq!(fs::read(&db).expect("db intact"), saved);
        let _ = fs::remove_file(&db);
        let _ = fs::remove_file(db.with_extension("json.tmp"));
    }

    #[test]
    fn cleanup_sweeps_expired_entries_everywhere() {
        let db = temp_db();
        let mut s = settings(db.clone());
        s.token_expiration = Duration::from_millis(0);
        let dir = TokenDirectory::open(s);
        let token = dir.token_for_domain("example.com", Protocol::Https);

        std::thread::sleep(Duration::from_millis(5));
        dir.cleanup();

        assert!(dir.is_empty());
        assert!(dir.domain_info_from_token(&token).is_none());
        let (backup_len, _) = dir.backup_info();
        assert_eq!(backup_len, 0, "backup is pruned alongside");
        let _ = fs::remove_file(db);
    }

    #[test]
    fn absent_file_materialises_empty_state() {
        let db = temp_db();
        let dir = TokenDirectory::open(settings(db.clone()));
        assert!(dir.is_empty());
        assert!(db.exists(), "open must force-save an empty db");
        let _ = fs::remove_file(db);
    }
}
