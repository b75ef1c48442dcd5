use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::config::{BACKEND_STORE_DIR, SCRATCH_DIR, UPLOAD_TEMP_DIR};

/// 数据目录布局：上传暂存、应用管理的下载缓存、本地后端存储。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(self.upload_root()).await?;
        fs::create_dir_all(self.scratch_root()).await?;
        Ok(())
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 分片与单次上传的暂存目录。
    pub fn upload_root(&self) -> PathBuf {
        self.root.join(UPLOAD_TEMP_DIR)
    }

    /// 本服务写入的下载文件，全部由应用管理。
    pub fn scratch_root(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn backend_root(&self) -> PathBuf {
        self.root.join(BACKEND_STORE_DIR)
    }
}

/// 判断 `path` 是否位于 `root` 之内（按路径组件比较，拒绝 `..`）。
pub fn is_within(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// 将远端标识转换为安全的单层文件名。
pub fn scratch_file_name(remote_id: &str) -> String {
    let cleaned: String = remote_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
