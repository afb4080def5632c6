use std::path::PathBuf;

use ingot_process::LaunchMode;
use tokio::io::AsyncWriteExt;

use crate::error::SupervisorError;
use crate::settings::Settings;

pub const CONFIG_FILE: &str = "instance.json";

pub const DEFAULT_MIN_HEAP: &str = "1G";
pub const DEFAULT_MAX_HEAP: &str = "2G";
pub const DEFAULT_SERVER_ARGS: &str = "nogui";
pub const DEFAULT_JVM_ARGS: &str = "-XX:+UseG1GC -XX:+ParallelRefProcEnabled -XX:MaxGCPauseMillis=200 \
-XX:+UnlockExperimentalVMOptions -XX:+DisableExplicitGC -XX:+AlwaysPreTouch \
-XX:G1NewSizePercent=30 -XX:G1MaxNewSizePercent=40 -XX:G1HeapRegionSize=8M \
-XX:G1ReservePercent=20 -XX:G1HeapWastePercent=5 -XX:G1MixedGCCountTarget=4 \
-XX:InitiatingHeapOccupancyPercent=15 -XX:G1MixedGCLiveThresholdPercent=90 \
-XX:G1RSetUpdatingPauseTimePercent=5 -XX:SurvivorRatio=32 -XX:+PerfDisableSharedMem \
-XX:MaxTenuringThreshold=1";

/// Keep instance names safe for filesystem paths and session names.
pub fn validate_instance_name(name: &str) -> Result<&str, SupervisorError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SupervisorError::config("instance name must be non-empty"));
    }
    if name == "." || name == ".." {
        return Err(SupervisorError::config(format!(
            "invalid instance name: {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SupervisorError::config(format!(
            "invalid instance name '{name}': only letters, digits, '-', '_' and '.' are allowed"
        )));
    }
    Ok(name)
}

/// Heap sizes are a number followed by `M` or `G`, e.g. `512M`, `2G`.
fn normalize_heap(field: &str, raw: &str) -> Result<String, SupervisorError> {
    let v = raw.trim().to_ascii_uppercase();
    let valid = v.len() >= 2
        && (v.ends_with('M') || v.ends_with('G'))
        && v[..v.len() - 1].chars().all(|c| c.is_ascii_digit());
    if !valid {
        return Err(SupervisorError::config(format!(
            "{field} must be a number followed by M or G (e.g. 512M, 2G), got '{raw}'"
        )));
    }
    Ok(v)
}

pub fn default_session_name(instance: &str) -> String {
    format!("mc_{}", instance.replace(['.', '-'], "_"))
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub server_binary: String,
    pub min_heap: String,
    pub max_heap: String,
    pub jvm_args: String,
    pub server_args: String,
    pub launch_mode: LaunchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rcon_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rcon_password: Option<String>,
    pub eula_accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamemode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarding_secret: Option<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            server_binary: String::new(),
            min_heap: DEFAULT_MIN_HEAP.to_string(),
            max_heap: DEFAULT_MAX_HEAP.to_string(),
            jvm_args: DEFAULT_JVM_ARGS.to_string(),
            server_args: DEFAULT_SERVER_ARGS.to_string(),
            launch_mode: LaunchMode::Session,
            session_name: None,
            rcon_port: None,
            rcon_password: None,
            eula_accepted: false,
            level_name: None,
            gamemode: None,
            difficulty: None,
            max_players: None,
            online_mode: None,
            forwarding_secret: None,
        }
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl InstanceConfig {
    /// Port and password, only when both are set.
    pub fn rcon(&self) -> Option<(u16, &str)> {
        match (self.rcon_port, non_empty(&self.rcon_password)) {
            (Some(port), Some(password)) if port != 0 => Some((port, password)),
            _ => None,
        }
    }

    pub fn rcon_available(&self) -> bool {
        self.rcon().is_some()
    }

    pub fn forwarding_secret(&self) -> Option<&str> {
        non_empty(&self.forwarding_secret)
    }

    /// Rejects configs the launcher can't act on. Normalizes heap sizes in place.
    pub fn validate(&mut self) -> Result<(), SupervisorError> {
        if self.server_binary.trim().is_empty() {
            return Err(SupervisorError::config("server binary is not specified"));
        }
        self.min_heap = normalize_heap("min_heap", &self.min_heap)?;
        self.max_heap = normalize_heap("max_heap", &self.max_heap)?;

        let has_port = self.rcon_port.is_some_and(|p| p != 0);
        let has_password = non_empty(&self.rcon_password).is_some();
        if has_port != has_password {
            return Err(SupervisorError::config(
                "rcon requires both port and password (or neither)",
            ));
        }
        Ok(())
    }

    /// Fills blanks left by older or hand-edited configs.
    pub fn apply_defaults(&mut self, instance: &str) {
        if self.min_heap.trim().is_empty() {
            self.min_heap = DEFAULT_MIN_HEAP.to_string();
        }
        if self.max_heap.trim().is_empty() {
            self.max_heap = DEFAULT_MAX_HEAP.to_string();
        }
        if self.jvm_args.trim().is_empty() {
            self.jvm_args = DEFAULT_JVM_ARGS.to_string();
        }
        if self.server_args.trim().is_empty() {
            self.server_args = DEFAULT_SERVER_ARGS.to_string();
        }
        if self.launch_mode == LaunchMode::Session && non_empty(&self.session_name).is_none() {
            self.session_name = Some(default_session_name(instance));
        }
    }

    /// Copy safe to put in log fields.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if out.rcon_password.is_some() {
            out.rcon_password = Some("<redacted>".to_string());
        }
        if out.forwarding_secret.is_some() {
            out.forwarding_secret = Some("<redacted>".to_string());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    settings: Settings,
}

impl ConfigStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.settings.instance_dir(name).join(CONFIG_FILE)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::metadata(self.config_path(name))
            .await
            .is_ok_and(|m| m.is_file())
    }

    /// Missing, empty and corrupt files all read as "no config".
    pub async fn load(&self, name: &str) -> Option<InstanceConfig> {
        let path = self.config_path(name);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(instance = name, path = %path.display(), error = %e, "failed to read instance config");
                return None;
            }
        };
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            tracing::warn!(instance = name, path = %path.display(), "instance config is empty");
            return None;
        }
        match serde_json::from_slice::<InstanceConfig>(&raw) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::warn!(instance = name, path = %path.display(), error = %e, "instance config is corrupt");
                None
            }
        }
    }

    pub async fn save(&self, name: &str, config: &InstanceConfig) -> Result<(), SupervisorError> {
        let dir = self.settings.instance_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SupervisorError::fs(format!("create {}", dir.display()), e))?;

        let path = self.config_path(name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(config)
            .map_err(|e| SupervisorError::config(format!("serialize instance config: {e}")))?;

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| SupervisorError::fs(format!("create {}", tmp.display()), e))?;
        f.write_all(&data)
            .await
            .map_err(|e| SupervisorError::fs(format!("write {}", tmp.display()), e))?;
        f.flush()
            .await
            .map_err(|e| SupervisorError::fs(format!("flush {}", tmp.display()), e))?;
        f.sync_all().await.ok();
        drop(f);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SupervisorError::fs(format!("persist {}", path.display()), e))?;

        tracing::info!(instance = name, "instance config saved");
        Ok(())
    }

    /// Instance names that have a directory under the instances root.
    pub async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(self.settings.instances_dir()).await {
            Ok(v) => v,
            Err(_) => return out,
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_instance_name(name).is_ok()
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        out
    }
}
