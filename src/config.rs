use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "ClinicRecords";
pub const STORE_FILE_NAME: &str = "clinic.db";

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A SQLite file on disk.
    Disk(PathBuf),
    /// A private in-memory store (for testing). Always single-connection.
    Memory,
}

/// Synchronous-commit level applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// `synchronous=FULL` — a commit survives power loss.
    #[default]
    Full,
    /// `synchronous=NORMAL` — a commit survives an application crash but a
    /// power cut may lose the most recent transactions.
    Relaxed,
}

impl DurabilityMode {
    pub fn synchronous_pragma(self) -> &'static str {
        match self {
            DurabilityMode::Full => "FULL",
            DurabilityMode::Relaxed => "NORMAL",
        }
    }
}

/// Configuration surface consumed by the host application. Plain data, no
/// behavior of its own.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub location: StoreLocation,
    /// Number of pooled connections for a disk store. Small on purpose —
    /// pooling avoids open/close overhead, not multi-client contention.
    pub pool_size: usize,
    pub durability: DurabilityMode,
}

impl StoreConfig {
    /// Configuration for a store file at the given path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::Disk(path.into()),
            pool_size: 4,
            durability: DurabilityMode::Full,
        }
    }

    /// Configuration for an in-memory store (testing).
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory,
            pool_size: 1,
            durability: DurabilityMode::Full,
        }
    }
}

/// Get the application data directory
/// ~/ClinicRecords/ on all platforms (user-visible, per design requirement)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

/// Conventional location of the store file.
pub fn default_store_path() -> PathBuf {
    app_data_dir().join(STORE_FILE_NAME)
}
