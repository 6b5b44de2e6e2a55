//! 上传忙碌登记表：同一目标文件同一时间只允许一个写入者。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Set of upload keys currently being written.
///
/// A second request for a held key is refused immediately instead of
/// queueing behind the first one.
#[derive(Debug, Default)]
pub struct BusyRegistry {
    names: Arc<Mutex<HashSet<String>>>,
}

/// Hold on one upload key.
///
/// Clones share the hold and the key is released when the last clone drops,
/// so a blocking task that outlives its request keeps the file locked.
#[derive(Clone, Debug)]
pub struct BusyGuard {
    _held: Arc<HeldKey>,
}

#[derive(Debug)]
struct HeldKey {
    names: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl BusyRegistry {
    /// 创建新的忙碌登记表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用 `path`，已被占用时返回 None。
    pub fn try_acquire(&self, path: &str) -> Option<BusyGuard> {
        let key = normalize_lock_key(path);
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if !names.insert(key.clone()) {
            return None;
        }
        Some(BusyGuard {
            _held: Arc::new(HeldKey {
                names: self.names.clone(),
                key,
            }),
        })
    }
}

impl Drop for HeldKey {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

fn normalize_lock_key(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.trim_start_matches(['/', '\\']);
    trimmed.replace('\\', "/")
}
