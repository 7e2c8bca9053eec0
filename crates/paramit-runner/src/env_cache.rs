//! Content-addressed store of provisioned environments.
//!
//! ```text
//! <root>/envs/<hash>/descriptor.json
//! <root>/envs/<hash>/env/
//! <root>/staging/<hash>.<pid>.<micros>/
//! <root>/locks/<hash>.lock
//! ```
//!
//! Reading a `Ready` entry takes no lock. Building one holds the per-hash
//! build lock for the whole Building -> Ready/Failed transition, and the
//! environment is provisioned in staging and renamed into place only on
//! success.

use crate::error::EnvironmentError;
use crate::lock::BuildLock;
use crate::manifest::DependencyManifest;
use crate::provision::Provisioner;
use chrono::Utc;
use paramit_core::{atomic_write_json_pretty, ensure_dir, scratch_suffix, sha256_bytes};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

const DESCRIPTOR_SCHEMA: &str = "env_descriptor_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Building,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub schema_version: String,
    pub manifest_hash: String,
    pub interpreter_version_pin: String,
    pub storage_location: PathBuf,
    pub status: EnvStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_source: Option<PathBuf>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl EnvironmentDescriptor {
    pub fn is_usable(&self) -> bool {
        self.status == EnvStatus::Ready && self.storage_location.is_dir()
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub descriptor: EnvironmentDescriptor,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub manifest_hash: String,
    pub descriptor: Option<EnvironmentDescriptor>,
    pub size_bytes: u64,
    pub locked: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClearSummary {
    pub removed: Vec<String>,
    pub skipped_locked: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EnvironmentCache {
    root: PathBuf,
    lock_timeout: Duration,
}

impl EnvironmentCache {
    /// Locate or create the cache root. There is no teardown.
    pub fn init(root: &Path) -> Result<Self, EnvironmentError> {
        for sub in ["envs", "staging", "locks"] {
            let dir = root.join(sub);
            ensure_dir(&dir).map_err(EnvironmentError::io(&dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            lock_timeout: Duration::from_secs(3600),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic key over the normalised manifest and interpreter pin.
    pub fn key(manifest: &DependencyManifest, interpreter_pin: &str) -> String {
        let material = format!("interpreter:{interpreter_pin}\n{}", manifest.normalized());
        sha256_bytes(material.as_bytes())
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.root.join("envs").join(hash)
    }

    fn descriptor_path(&self, hash: &str) -> PathBuf {
        self.entry_dir(hash).join("descriptor.json")
    }

    fn lock_path(&self, hash: &str) -> PathBuf {
        self.root.join("locks").join(format!("{hash}.lock"))
    }

    pub fn lookup(&self, hash: &str) -> Result<Option<EnvironmentDescriptor>, EnvironmentError> {
        let path = self.descriptor_path(hash);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EnvironmentError::io(&path)(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| EnvironmentError::CorruptDescriptor {
                path,
                detail: e.to_string(),
            })
    }

    fn write_descriptor(&self, descriptor: &EnvironmentDescriptor) -> Result<(), EnvironmentError> {
        let path = self.descriptor_path(&descriptor.manifest_hash);
        atomic_write_json_pretty(&path, descriptor).map_err(EnvironmentError::io(&path))
    }

    /// Return the environment for `manifest`, building it on a miss.
    ///
    /// Concurrent callers for the same key (threads or processes) wait on
    /// the build lock and then observe the winner's `Ready` entry.
    pub fn resolve(
        &self,
        manifest: &DependencyManifest,
        interpreter_pin: &str,
        provisioner: &dyn Provisioner,
    ) -> Result<Resolution, EnvironmentError> {
        let hash = Self::key(manifest, interpreter_pin);
        if let Some(descriptor) = self.ready(&hash)? {
            tracing::info!(manifest_hash = %hash, "environment cache hit");
            return Ok(Resolution {
                descriptor,
                cache_hit: true,
            });
        }

        let _lock = BuildLock::acquire(&self.lock_path(&hash), self.lock_timeout)?;
        if let Some(descriptor) = self.ready(&hash)? {
            tracing::info!(manifest_hash = %hash, "environment built by another requester");
            return Ok(Resolution {
                descriptor,
                cache_hit: true,
            });
        }

        let previous = self.lookup(&hash).ok().flatten();
        let now = Utc::now().to_rfc3339();
        let mut descriptor = EnvironmentDescriptor {
            schema_version: DESCRIPTOR_SCHEMA.to_string(),
            manifest_hash: hash.clone(),
            interpreter_version_pin: interpreter_pin.to_string(),
            storage_location: self.entry_dir(&hash).join("env"),
            status: EnvStatus::Building,
            manifest_source: manifest.path.clone(),
            created_at: previous.map(|p| p.created_at).unwrap_or_else(|| now.clone()),
            updated_at: now,
            failure: None,
        };
        self.write_descriptor(&descriptor)?;

        let staging = self
            .root
            .join("staging")
            .join(format!("{hash}.{}", scratch_suffix()));
        ensure_dir(&staging).map_err(EnvironmentError::io(&staging))?;
        tracing::info!(manifest_hash = %hash, staging = %staging.display(), "building environment");

        let built = provisioner
            .provision(manifest, &staging)
            .map_err(|e| format!("{e:#}"))
            .and_then(|()| self.publish(&staging, &descriptor.storage_location));

        descriptor.updated_at = Utc::now().to_rfc3339();
        match built {
            Ok(()) => {
                descriptor.status = EnvStatus::Ready;
                self.write_descriptor(&descriptor)?;
                tracing::info!(manifest_hash = %hash, "environment ready");
                Ok(Resolution {
                    descriptor,
                    cache_hit: false,
                })
            }
            Err(detail) => {
                let _ = fs::remove_dir_all(&staging);
                descriptor.status = EnvStatus::Failed;
                descriptor.failure = Some(detail.clone());
                self.write_descriptor(&descriptor)?;
                Err(EnvironmentError::Provisioning {
                    manifest_hash: hash,
                    manifest: manifest.content.clone(),
                    detail,
                })
            }
        }
    }

    fn ready(&self, hash: &str) -> Result<Option<EnvironmentDescriptor>, EnvironmentError> {
        Ok(match self.lookup(hash)? {
            Some(d) if d.is_usable() => Some(d),
            Some(d) if d.status == EnvStatus::Ready => {
                tracing::warn!(manifest_hash = %hash, "environment storage missing; rebuilding");
                None
            }
            _ => None,
        })
    }

    fn publish(&self, staging: &Path, target: &Path) -> Result<(), String> {
        if target.exists() {
            fs::remove_dir_all(target)
                .map_err(|e| format!("cannot clear {}: {e}", target.display()))?;
        }
        fs::rename(staging, target).map_err(|e| {
            format!(
                "cannot publish {} to {}: {e}",
                staging.display(),
                target.display()
            )
        })
    }

    pub fn list(&self) -> Result<Vec<CacheEntry>, EnvironmentError> {
        let envs = self.root.join("envs");
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&envs).map_err(EnvironmentError::io(&envs))? {
            let entry = entry.map_err(EnvironmentError::io(&envs))?;
            if entry.path().is_dir() {
                hashes.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        hashes.sort();

        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let descriptor = match self.lookup(&hash) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(manifest_hash = %hash, error = %err, "unreadable descriptor");
                    None
                }
            };
            out.push(CacheEntry {
                size_bytes: dir_size(&self.entry_dir(&hash)),
                locked: BuildLock::is_held(&self.lock_path(&hash)),
                manifest_hash: hash,
                descriptor,
            });
        }
        Ok(out)
    }

    /// Delete one entry. `Ok(false)` when it does not exist.
    pub fn remove(&self, hash: &str) -> Result<bool, EnvironmentError> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EnvironmentError::InvalidKey {
                manifest_hash: hash.to_string(),
            });
        }
        let dir = self.entry_dir(hash);
        if !dir.exists() {
            return Ok(false);
        }
        let Some(_lock) = BuildLock::try_acquire(&self.lock_path(hash))? else {
            return Err(EnvironmentError::Busy {
                manifest_hash: hash.to_string(),
            });
        };
        fs::remove_dir_all(&dir).map_err(EnvironmentError::io(&dir))?;
        tracing::info!(manifest_hash = %hash, "environment removed");
        Ok(true)
    }

    /// Delete every entry not currently being built, plus leftover staging.
    pub fn clear(&self) -> Result<ClearSummary, EnvironmentError> {
        let mut summary = ClearSummary::default();
        for entry in self.list()? {
            match self.remove(&entry.manifest_hash) {
                Ok(true) => summary.removed.push(entry.manifest_hash),
                Ok(false) => {}
                Err(EnvironmentError::Busy { manifest_hash }) => {
                    summary.skipped_locked.push(manifest_hash)
                }
                Err(err) => return Err(err),
            }
        }
        let staging = self.root.join("staging");
        for entry in fs::read_dir(&staging).map_err(EnvironmentError::io(&staging))? {
            let entry = entry.map_err(EnvironmentError::io(&staging))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let hash = name.split('.').next().unwrap_or_default();
            if !BuildLock::is_held(&self.lock_path(hash)) {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
        Ok(summary)
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestKind;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct CountingProvisioner {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingProvisioner {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
                delay: Duration::ZERO,
            }
        }
    }

    impl Provisioner for CountingProvisioner {
        fn provision(&self, manifest: &DependencyManifest, staging: &Path) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.fail {
                bail!("resolver could not satisfy {}", manifest.normalized());
            }
            fs::write(staging.join("installed.txt"), manifest.normalized())?;
            Ok(())
        }
    }

    fn scratch(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("paramit_cache_{label}_{}", scratch_suffix()))
    }

    fn manifest(content: &str) -> DependencyManifest {
        DependencyManifest {
            path: None,
            kind: ManifestKind::Requirements,
            content: content.to_string(),
        }
    }

    #[test]
    fn key_depends_on_normalized_content_and_pin() {
        let a = manifest("numpy\npandas\n");
        let b = manifest("\n# deps\npandas \nnumpy");
        assert_eq!(EnvironmentCache::key(&a, "3.11.4"), EnvironmentCache::key(&b, "3.11.4"));
        assert_ne!(EnvironmentCache::key(&a, "3.11.4"), EnvironmentCache::key(&a, "3.12.1"));
        assert_ne!(
            EnvironmentCache::key(&a, "3.11.4"),
            EnvironmentCache::key(&manifest("numpy"), "3.11.4")
        );
    }

    #[test]
    fn second_request_is_a_cache_hit() {
        let root = scratch("hit");
        let cache = EnvironmentCache::init(&root).expect("init");
        let provisioner = CountingProvisioner::new(false);
        let first = cache
            .resolve(&manifest("numpy\n"), "3.11", &provisioner)
            .expect("build");
        assert!(!first.cache_hit);
        assert_eq!(first.descriptor.status, EnvStatus::Ready);
        assert!(first.descriptor.storage_location.join("installed.txt").is_file());

        let second = cache
            .resolve(&manifest("  numpy  \n\n"), "3.11", &provisioner)
            .expect("hit");
        assert!(second.cache_hit);
        assert_eq!(second.descriptor, first.descriptor);
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_build_is_recorded_and_cleaned_up() {
        let root = scratch("fail");
        let cache = EnvironmentCache::init(&root).expect("init");
        let broken = CountingProvisioner::new(true);
        let err = cache
            .resolve(&manifest("nosuchpkg==0\n"), "3.11", &broken)
            .expect_err("fail");
        match &err {
            EnvironmentError::Provisioning {
                manifest, detail, ..
            } => {
                assert!(manifest.contains("nosuchpkg"));
                assert!(detail.contains("could not satisfy"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let hash = EnvironmentCache::key(&manifest("nosuchpkg==0\n"), "3.11");
        let descriptor = cache.lookup(&hash).expect("lookup").expect("descriptor");
        assert_eq!(descriptor.status, EnvStatus::Failed);
        let staging_left = fs::read_dir(root.join("staging")).expect("staging").count();
        assert_eq!(staging_left, 0);
        assert!(!BuildLock::is_held(&root.join("locks").join(format!("{hash}.lock"))));

        // A later request retries.
        let fixed = CountingProvisioner::new(false);
        let ok = cache
            .resolve(&manifest("nosuchpkg==0\n"), "3.11", &fixed)
            .expect("retry");
        assert!(!ok.cache_hit);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_storage_is_rebuilt() {
        let root = scratch("rebuild");
        let cache = EnvironmentCache::init(&root).expect("init");
        let provisioner = CountingProvisioner::new(false);
        let built = cache
            .resolve(&manifest("numpy\n"), "3.11", &provisioner)
            .expect("build");
        fs::remove_dir_all(&built.descriptor.storage_location).expect("rm env");
        let rebuilt = cache
            .resolve(&manifest("numpy\n"), "3.11", &provisioner)
            .expect("rebuild");
        assert!(!rebuilt.cache_hit);
        assert_eq!(rebuilt.descriptor.created_at, built.descriptor.created_at);
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn concurrent_requesters_share_one_build() {
        let root = scratch("concurrent");
        let cache = Arc::new(EnvironmentCache::init(&root).expect("init"));
        let provisioner = Arc::new(CountingProvisioner {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::from_millis(300),
        });
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let provisioner = Arc::clone(&provisioner);
                thread::spawn(move || {
                    cache
                        .resolve(&manifest("torch\n"), "3.11", provisioner.as_ref())
                        .expect("resolve")
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|r| !r.cache_hit).count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn maintenance_lists_and_clears() {
        let root = scratch("maint");
        let cache = EnvironmentCache::init(&root).expect("init");
        let provisioner = CountingProvisioner::new(false);
        let a = cache
            .resolve(&manifest("numpy\n"), "3.11", &provisioner)
            .expect("a");
        let b = cache
            .resolve(&manifest("scipy\n"), "3.11", &provisioner)
            .expect("b");
        let entries = cache.list().expect("list");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.size_bytes > 0 && !e.locked));

        let held = BuildLock::try_acquire(&cache.lock_path(&b.descriptor.manifest_hash))
            .expect("io")
            .expect("lock");
        let summary = cache.clear().expect("clear");
        assert_eq!(summary.removed, vec![a.descriptor.manifest_hash.clone()]);
        assert_eq!(summary.skipped_locked, vec![b.descriptor.manifest_hash.clone()]);
        drop(held);

        assert!(cache.remove(&b.descriptor.manifest_hash).expect("remove"));
        assert!(!cache.remove(&b.descriptor.manifest_hash).expect("absent"));
        assert!(matches!(
            cache.remove("../etc"),
            Err(EnvironmentError::InvalidKey { .. })
        ));
        let _ = fs::remove_dir_all(root);
    }
}
