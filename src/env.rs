//! Environment constants and path utilities for the orchestrator.
//!
//! All on-disk names used by the file storage backend and the configuration
//! discovery live here.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git)
pub const AURORA_DIR_NAME: &str = ".aurora";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name when placed directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "aurora.toml";

/// System-wide configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/aurora";

/// Default state directory, relative to the working directory
pub const DEFAULT_STATE_DIR: &str = ".aurora/state";

/// State directory layout
pub mod state {
    /// Task records, one JSON file per task
    pub const TASKS_DIR_NAME: &str = "tasks";

    /// Channel snapshots, one JSON file per channel
    pub const QUEUES_DIR_NAME: &str = "queues";

    /// Scratch space for atomic writes
    pub const TEMP_DIR_NAME: &str = "temp";

    /// Exclusive lock held by the process that owns the state directory
    pub const LOCK_FILE_NAME: &str = "LOCK";

    /// Suffix appended to records that failed to load
    pub const CORRUPT_SUFFIX: &str = "corrupt";
}

/// Build the tasks directory path
pub fn tasks_dir_path(state_dir: &Path) -> PathBuf {
    state_dir.join(state::TASKS_DIR_NAME)
}

/// Build the queues directory path
pub fn queues_dir_path(state_dir: &Path) -> PathBuf {
    state_dir.join(state::QUEUES_DIR_NAME)
}

/// Build the temp directory path
pub fn temp_dir_path(state_dir: &Path) -> PathBuf {
    state_dir.join(state::TEMP_DIR_NAME)
}

/// Build the lock file path
pub fn lock_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(state::LOCK_FILE_NAME)
}

/// Build a task record path
pub fn task_file_path(state_dir: &Path, task_id: &uuid::Uuid) -> PathBuf {
    tasks_dir_path(state_dir).join(format!("{}.json", task_id))
}

/// Build a channel snapshot path
pub fn channel_file_path(state_dir: &Path, channel: &str) -> PathBuf {
    queues_dir_path(state_dir).join(format!("{}.json", channel))
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    home_dir.join(AURORA_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build config file path in the hidden directory of the current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(AURORA_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build config file path directly in the current directory
pub fn workspace_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// Build system config file path
pub fn system_config_file_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_layout() {
        let root = Path::new("/var/lib/aurora");
        let id = uuid::Uuid::nil();

        assert_eq!(tasks_dir_path(root), PathBuf::from("/var/lib/aurora/tasks"));
        assert_eq!(
            task_file_path(root, &id),
            PathBuf::from(format!("/var/lib/aurora/tasks/{}.json", id))
        );
        assert_eq!(
            channel_file_path(root, "deadletter"),
            PathBuf::from("/var/lib/aurora/queues/deadletter.json")
        );
        assert_eq!(lock_file_path(root), PathBuf::from("/var/lib/aurora/LOCK"));
    }

    #[test]
    fn test_config_paths() {
        let home = Path::new("/home/ops");
        assert_eq!(
            user_config_file_path(home),
            PathBuf::from("/home/ops/.aurora/config.toml")
        );
        assert_eq!(
            workspace_config_file_path(Path::new("/srv/app")),
            PathBuf::from("/srv/app/aurora.toml")
        );
        assert_eq!(
            system_config_file_path(),
            PathBuf::from("/etc/aurora/config.toml")
        );
    }
}
