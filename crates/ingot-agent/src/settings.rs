use std::{path::PathBuf, time::Duration};

const DEFAULT_STOP_GRACE_SEC: u64 = 30;
const DEFAULT_TERM_GRACE_SEC: u64 = 10;
const DEFAULT_KILL_GRACE_SEC: u64 = 5;
const DEFAULT_RESTART_WAIT_SEC: u64 = 20;
const DEFAULT_DELETE_GRACE_SEC: u64 = 5;
const DEFAULT_RCON_TIMEOUT_MS: u64 = 5000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

pub const DEFAULT_SERVER_PORT: u16 = 25565;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(name: &str, default: u64, max: u64) -> Duration {
    Duration::from_secs(env_u64(name).map(|v| v.clamp(1, max)).unwrap_or(default))
}

fn env_millis(name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

fn absolutize(raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[derive(Debug, Clone)]
pub struct TailSettings {
    /// How far back the first read of a subscriber reaches.
    pub window_bytes: u64,
    /// Upper bound on bytes consumed in a single poll cycle.
    pub max_read_bytes: u64,
    pub poll_interval: Duration,
    pub missing_backoff: Duration,
    pub error_backoff: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            window_bytes: 4096,
            max_read_bytes: 1024 * 1024,
            poll_interval: Duration::from_millis(200),
            missing_backoff: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Runtime knobs for the supervisor. `from_env` is what the binary uses;
/// tests build this directly with short timeouts.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub binaries_dir: PathBuf,
    pub java_bin: String,
    pub screen_bin: String,
    pub stop_grace: Duration,
    pub term_grace: Duration,
    pub kill_grace: Duration,
    pub restart_wait: Duration,
    pub delete_grace: Duration,
    pub poll_interval: Duration,
    pub rcon_timeout: Duration,
    pub probe_timeout: Duration,
    pub tail: TailSettings,
}

impl Settings {
    pub fn with_data_root(data_root: PathBuf) -> Self {
        let binaries_dir = data_root.join("versions");
        Self {
            data_root,
            binaries_dir,
            java_bin: "java".to_string(),
            screen_bin: "screen".to_string(),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SEC),
            term_grace: Duration::from_secs(DEFAULT_TERM_GRACE_SEC),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SEC),
            restart_wait: Duration::from_secs(DEFAULT_RESTART_WAIT_SEC),
            delete_grace: Duration::from_secs(DEFAULT_DELETE_GRACE_SEC),
            poll_interval: Duration::from_secs(1),
            rcon_timeout: Duration::from_millis(DEFAULT_RCON_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            tail: TailSettings::default(),
        }
    }

    pub fn from_env() -> Self {
        let data_root = absolutize(
            &env_string("INGOT_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        );
        let mut s = Self::with_data_root(data_root);

        if let Some(dir) = env_string("INGOT_BINARIES_DIR") {
            s.binaries_dir = absolutize(&dir);
        }
        if let Some(java) = env_string("INGOT_JAVA_BIN") {
            s.java_bin = java;
        }
        if let Some(screen) = env_string("INGOT_SCREEN_BIN") {
            s.screen_bin = screen;
        }

        s.stop_grace = env_secs("INGOT_STOP_GRACE_SEC", DEFAULT_STOP_GRACE_SEC, 600);
        s.term_grace = env_secs("INGOT_TERM_GRACE_SEC", DEFAULT_TERM_GRACE_SEC, 300);
        s.kill_grace = env_secs("INGOT_KILL_GRACE_SEC", DEFAULT_KILL_GRACE_SEC, 60);
        s.restart_wait = env_secs("INGOT_RESTART_WAIT_SEC", DEFAULT_RESTART_WAIT_SEC, 600);
        s.delete_grace = env_secs("INGOT_DELETE_GRACE_SEC", DEFAULT_DELETE_GRACE_SEC, 120);
        s.rcon_timeout = env_millis(
            "INGOT_RCON_TIMEOUT_MS",
            DEFAULT_RCON_TIMEOUT_MS,
            100,
            120_000,
        );
        s.probe_timeout = env_millis(
            "INGOT_PROBE_TIMEOUT_MS",
            DEFAULT_PROBE_TIMEOUT_MS,
            100,
            60_000,
        );
        s
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_root.join("instances")
    }

    /// Callers must have validated `name` first.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir().join(name)
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("logs").join("latest.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_under_data_root() {
        let s = Settings::with_data_root(PathBuf::from("/srv/ingot"));
        assert_eq!(s.binaries_dir, PathBuf::from("/srv/ingot/versions"));
        assert_eq!(
            s.log_path("lobby"),
            PathBuf::from("/srv/ingot/instances/lobby/logs/latest.log")
        );
    }

    #[test]
    fn defaults_match_documented_bounds() {
        let s = Settings::with_data_root(PathBuf::from("/tmp/x"));
        assert_eq!(s.stop_grace, Duration::from_secs(30));
        assert_eq!(s.term_grace, Duration::from_secs(10));
        assert_eq!(s.restart_wait, Duration::from_secs(20));
        assert_eq!(s.tail.window_bytes, 4096);
    }
}
