//! 进程内文件缓存：远端标识到本地路径，按 TTL、总大小与条目数淘汰。

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, elapsed_between};
use crate::storage::is_within;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_app_bytes: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub last_accessed: SystemTime,
    pub created_at: SystemTime,
    /// 位于 scratch 目录，可由本服务删除。
    pub app_managed: bool,
}

/// 命中结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub ttl_evicted: usize,
    pub size_evicted: usize,
    pub index_evicted: usize,
    /// 索引之外、超过 TTL 的 scratch 残留文件（如重启前的下载）。
    pub untracked_removed: usize,
    pub bytes_freed: u64,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.ttl_evicted + self.size_evicted + self.index_evicted + self.untracked_removed
    }
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub app_managed_bytes: u64,
}

#[derive(Debug)]
pub struct FileCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    scratch_root: PathBuf,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl FileCache {
    pub fn new(scratch_root: PathBuf, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            scratch_root,
            config,
            clock,
        }
    }

    /// 查找缓存；路径已不存在的条目被移除并视为未命中。
    pub async fn lookup(&self, remote_id: &str) -> Option<CachedFile> {
        let path = {
            let entries = self.entries.lock().await;
            entries.get(remote_id)?.path.clone()
        };

        let exists = fs::try_exists(&path).await.unwrap_or(false);
        let mut entries = self.entries.lock().await;
        if !exists {
            if entries
                .get(remote_id)
                .is_some_and(|entry| entry.path == path)
            {
                entries.remove(remote_id);
                debug!(remote_id, path = ?path, "evicted stale cache entry");
            }
            return None;
        }

        let now = self.clock.now();
        let entry = entries.get_mut(remote_id)?;
        entry.last_accessed = now;
        Some(CachedFile {
            path: entry.path.clone(),
            size: entry.size,
        })
    }

    /// 登记已下载的文件。
    pub async fn insert(&self, remote_id: &str, path: &Path) -> io::Result<CachedFile> {
        let metadata = fs::metadata(path).await?;
        let app_managed = is_within(&self.scratch_root, path);
        let now = self.clock.now();
        let entry = CacheEntry {
            path: path.to_path_buf(),
            size: metadata.len(),
            last_accessed: now,
            created_at: now,
            app_managed,
        };
        let cached = CachedFile {
            path: entry.path.clone(),
            size: entry.size,
        };

        let replaced = {
            let mut entries = self.entries.lock().await;
            entries.insert(remote_id.to_string(), entry)
        };
        if let Some(old) = replaced
            && old.app_managed
            && old.path != cached.path
        {
            remove_app_file(&old.path).await;
        }
        debug!(remote_id, size = cached.size, app_managed, "cache insert");
        Ok(cached)
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        CacheStats {
            entries: entries.len(),
            app_managed_bytes: entries
                .values()
                .filter(|entry| entry.app_managed)
                .map(|entry| entry.size)
                .sum(),
        }
    }

    /// 依次执行 TTL、应用管理总大小、索引条目数三轮淘汰。
    ///
    /// 持锁时只移除索引；释放锁后再删除文件，且仅限应用管理的条目。
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut doomed: Vec<CacheEntry> = Vec::new();

        {
            let mut entries = self.entries.lock().await;

            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.app_managed
                        && elapsed_between(entry.last_accessed, now) > self.config.ttl
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(entry) = entries.remove(&id) {
                    report.ttl_evicted += 1;
                    doomed.push(entry);
                }
            }

            let mut app_bytes: u64 = entries
                .values()
                .filter(|entry| entry.app_managed)
                .map(|entry| entry.size)
                .sum();
            if app_bytes > self.config.max_app_bytes {
                let mut candidates: Vec<(String, SystemTime)> = entries
                    .iter()
                    .filter(|(_, entry)| entry.app_managed)
                    .map(|(id, entry)| (id.clone(), entry.last_accessed))
                    .collect();
                candidates.sort_by_key(|(_, accessed)| *accessed);
                for (id, _) in candidates {
                    if app_bytes <= self.config.max_app_bytes {
                        break;
                    }
                    if let Some(entry) = entries.remove(&id) {
                        app_bytes = app_bytes.saturating_sub(entry.size);
                        report.size_evicted += 1;
                        doomed.push(entry);
                    }
                }
            }

            if entries.len() > self.config.max_entries {
                let excess = entries.len() - self.config.max_entries;
                let mut candidates: Vec<(String, SystemTime)> = entries
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.last_accessed))
                    .collect();
                candidates.sort_by_key(|(_, accessed)| *accessed);
                for (id, _) in candidates.into_iter().take(excess) {
                    if let Some(entry) = entries.remove(&id) {
                        report.index_evicted += 1;
                        doomed.push(entry);
                    }
                }
            }
        }

        for entry in doomed {
            if entry.app_managed {
                report.bytes_freed += entry.size;
                remove_app_file(&entry.path).await;
            }
        }

        if let Err(err) = self.remove_untracked(now, &mut report).await {
            warn!(error = %err, "failed to scan scratch dir");
        }

        if report.total() > 0 {
            info!(
                ttl = report.ttl_evicted,
                size = report.size_evicted,
                index = report.index_evicted,
                untracked = report.untracked_removed,
                bytes_freed = report.bytes_freed,
                "cache sweep"
            );
        }
        report
    }

    /// 删除 scratch 下未被索引且修改时间早于 TTL 的文件。
    ///
    /// 索引只在内存中，重启前下载的文件只能由这一步回收。
    async fn remove_untracked(&self, now: SystemTime, report: &mut SweepReport) -> io::Result<()> {
        let tracked: HashSet<PathBuf> = {
            let entries = self.entries.lock().await;
            entries.values().map(|entry| entry.path.clone()).collect()
        };
        let mut dir = match fs::read_dir(&self.scratch_root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if tracked.contains(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if elapsed_between(modified, now) <= self.config.ttl {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = ?path, "removed untracked scratch file");
                    report.untracked_removed += 1;
                    report.bytes_freed += metadata.len();
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = ?path, error = %err, "failed to remove untracked scratch file"),
            }
        }
        Ok(())
    }
}

async fn remove_app_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = ?path, error = %err, "failed to remove cached file"),
    }
}
