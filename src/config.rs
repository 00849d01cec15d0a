//! Process-wide configuration, read once at startup: a plain struct of
//! defaults, overridable by environment variables, paired with the
//! `env_logger` / `log` setup every binary calls before doing anything
//! else.

use std::path::PathBuf;

/// Programmatic defaults, overridable by the environment variables named
/// in the external interfaces section: `OCT_MEM_QUOTA`, `OCT_WORKERS`,
/// `OCT_WORK_ITEM`, `OCT_DB_DIR`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Memory governor quota, in bytes.
    pub mem_quota: u64,
    /// Builder worker count.
    pub workers: usize,
    /// Points per leaf-assembly work item.
    pub work_item: usize,
    /// Directory holding the sibling-group store's blob file.
    pub db_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_quota: 512 * 1024 * 1024,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            work_item: 4096,
            db_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Layers `OCT_MEM_QUOTA`/`OCT_WORKERS`/`OCT_WORK_ITEM`/`OCT_DB_DIR`
    /// over `self` where present and parseable; malformed values are
    /// logged and ignored rather than treated as fatal, since they only
    /// ever override a working programmatic default.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_u64("OCT_MEM_QUOTA") {
            self.mem_quota = v;
        }
        if let Some(v) = env_usize("OCT_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_usize("OCT_WORK_ITEM") {
            self.work_item = v;
        }
        if let Ok(v) = std::env::var("OCT_DB_DIR") {
            self.db_dir = PathBuf::from(v);
        }
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(v) => v.parse().ok().or_else(|| {
            log::warn!("{name}={v:?} is not a valid integer, ignoring");
            None
        }),
        Err(_) => None,
    }
}

fn env_usize(name: &str) -> Option<usize> {
    match std::env::var(name) {
        Ok(v) => v.parse().ok().or_else(|| {
            log::warn!("{name}={v:?} is not a valid integer, ignoring");
            None
        }),
        Err(_) => None,
    }
}

/// Initializes the `env_logger` backend for the `log` facade. Safe to
/// call more than once; only the first call has an effect.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}
