use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    sync::Arc,
};

use ingot_process::LaunchMode;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::Mutex,
};

use crate::config_store::{InstanceConfig, default_session_name};
use crate::error::SupervisorError;
use crate::properties::{self, PROPERTIES_FILE};
use crate::settings::{DEFAULT_SERVER_PORT, Settings};

const EULA_FILE: &str = "eula.txt";

/// Result of a liveness probe. `Unknown` means the probe itself could not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

impl Liveness {
    /// An inconclusive probe is treated as alive so nothing gets launched twice.
    pub fn counts_as_alive(self) -> bool {
        !matches!(self, Liveness::Dead)
    }
}

/// Append-only log file owned by the supervisor for direct launches.
#[derive(Debug, Clone)]
pub struct OwnedLog {
    file: Arc<Mutex<Option<tokio::fs::File>>>,
}

impl OwnedLog {
    async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Writes are dropped once the log has been closed.
    pub async fn write(&self, bytes: &[u8]) {
        let mut guard = self.file.lock().await;
        if let Some(f) = guard.as_mut()
            && f.write_all(bytes).await.is_err()
        {
            tracing::debug!("owned log write failed");
        }
    }

    /// Errors are swallowed; closing must never block pruning.
    pub async fn close(&self) {
        let taken = self.file.lock().await.take();
        if let Some(mut f) = taken {
            let _ = f.flush().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    Direct { pid: u32 },
    Session { name: String },
}

#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub server_port: u16,
}

pub struct Spawned {
    pub target: LaunchTarget,
    pub child: Option<Child>,
    pub log: Option<OwnedLog>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLaunch;

#[derive(Debug, Clone, Copy)]
pub struct DirectLaunch;

#[derive(Debug, Clone, Copy)]
pub enum LaunchStrategy {
    Session(SessionLaunch),
    Direct(DirectLaunch),
}

impl LaunchStrategy {
    pub fn for_mode(mode: LaunchMode) -> Self {
        match mode {
            LaunchMode::Session => LaunchStrategy::Session(SessionLaunch),
            LaunchMode::Direct => LaunchStrategy::Direct(DirectLaunch),
        }
    }

    pub async fn spawn(
        &self,
        settings: &Settings,
        instance: &str,
        config: &InstanceConfig,
        plan: &LaunchPlan,
    ) -> Result<Spawned, SupervisorError> {
        match self {
            LaunchStrategy::Session(s) => s.spawn(settings, instance, config, plan).await,
            LaunchStrategy::Direct(d) => d.spawn(plan).await,
        }
    }
}

fn resolve_binary(settings: &Settings, config: &InstanceConfig) -> Result<PathBuf, SupervisorError> {
    let raw = config.server_binary.trim();
    // Only a bare file name is honored; the binaries directory is the sole source.
    let file_name = Path::new(raw)
        .file_name()
        .ok_or_else(|| SupervisorError::config("server binary is not specified"))?;
    let path = settings.binaries_dir.join(file_name);
    if !path.is_file() {
        return Err(SupervisorError::config(format!(
            "server binary '{}' not found in {}",
            raw,
            settings.binaries_dir.display()
        )));
    }
    Ok(path)
}

fn ensure_eula(instance_dir: &Path, accepted_in_panel: bool) -> Result<(), SupervisorError> {
    let path = instance_dir.join(EULA_FILE);
    let already = std::fs::read_to_string(&path)
        .map(|s| s.lines().any(|l| l.trim().eq_ignore_ascii_case("eula=true")))
        .unwrap_or(false);
    if already {
        return Ok(());
    }
    if !accepted_in_panel {
        return Err(SupervisorError::config(format!(
            "EULA is not accepted in {} and was not acknowledged in the admin interface",
            path.display()
        )));
    }

    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let body = format!("# EULA acknowledged via the ingot admin interface\n# {stamp}\neula=true\n");
    std::fs::write(&path, body.as_bytes())
        .map_err(|e| SupervisorError::fs(format!("write {}", path.display()), e))?;
    Ok(())
}

fn port_from_args(server_args: &str) -> Option<u16> {
    let tokens: Vec<&str> = server_args.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|w| w[0] == "--port" || w[0] == "-p")
        .and_then(|w| w[1].parse::<u16>().ok())
}

/// Server args first, then `server-port` in the properties file, then 25565.
pub fn resolve_server_port(server_args: &str, instance_dir: &Path) -> u16 {
    if let Some(p) = port_from_args(server_args) {
        return p;
    }
    let props = instance_dir.join(PROPERTIES_FILE);
    match std::fs::read_to_string(&props) {
        Ok(s) => properties::get_value(&s, "server-port")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_SERVER_PORT),
        Err(_) => DEFAULT_SERVER_PORT,
    }
}

fn managed_keys(config: &InstanceConfig, server_port: u16) -> Vec<(String, String)> {
    let mut out = vec![("server-port".to_string(), server_port.to_string())];
    let optional = [
        ("level-name", config.level_name.clone()),
        ("gamemode", config.gamemode.clone()),
        ("difficulty", config.difficulty.clone()),
        ("max-players", config.max_players.map(|v| v.to_string())),
        ("online-mode", config.online_mode.map(|v| v.to_string())),
    ];
    for (k, v) in optional {
        if let Some(v) = v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            out.push((k.to_string(), v));
        }
    }
    out
}

pub fn build_args(config: &InstanceConfig, binary: &Path) -> Vec<String> {
    let mut args = vec![
        format!("-Xms{}", config.min_heap),
        format!("-Xmx{}", config.max_heap),
    ];
    args.extend(config.jvm_args.split_whitespace().map(str::to_string));
    if let Some(secret) = config.forwarding_secret() {
        args.push(format!("-Dvelocity-forwarding-secret={secret}"));
    }
    args.push("-jar".to_string());
    args.push(binary.display().to_string());
    args.extend(config.server_args.split_whitespace().map(str::to_string));
    args
}

/// Everything both launch variants need before spawning: binary, EULA,
/// properties and a fresh log file.
pub fn prepare(
    settings: &Settings,
    instance: &str,
    config: &InstanceConfig,
) -> Result<LaunchPlan, SupervisorError> {
    let dir = settings.instance_dir(instance);
    std::fs::create_dir_all(&dir)
        .map_err(|e| SupervisorError::fs(format!("create {}", dir.display()), e))?;

    let binary = resolve_binary(settings, config)?;
    ensure_eula(&dir, config.eula_accepted)?;

    let server_port = resolve_server_port(&config.server_args, &dir);
    properties::apply_rcon(
        &dir.join(PROPERTIES_FILE),
        config.rcon(),
        &managed_keys(config, server_port),
    )?;

    let log_path = settings.log_path(instance);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SupervisorError::fs(format!("create {}", parent.display()), e))?;
    }
    let header = format!(
        "--- Log {} @ {} ---\n",
        instance,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    std::fs::write(&log_path, header.as_bytes())
        .map_err(|e| SupervisorError::fs(format!("initialize {}", log_path.display()), e))?;

    Ok(LaunchPlan {
        program: settings.java_bin.clone(),
        args: build_args(config, &binary),
        working_dir: dir,
        log_path,
        server_port,
    })
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    // If the supervisor dies, a directly owned child goes with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

impl DirectLaunch {
    async fn spawn(&self, plan: &LaunchPlan) -> Result<Spawned, SupervisorError> {
        let log = OwnedLog::open(&plan.log_path)
            .await
            .map_err(|e| SupervisorError::fs(format!("open {}", plan.log_path.display()), e))?;

        let mut cmd = Command::new(&plan.program);
        cmd.current_dir(&plan.working_dir)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                log.close().await;
                return Err(if e.kind() == io::ErrorKind::NotFound {
                    SupervisorError::config(format!("'{}' not found", plan.program))
                } else {
                    SupervisorError::fs(format!("spawn {}", plan.program), e)
                });
            }
        };

        let Some(pid) = child.id() else {
            log.close().await;
            return Err(SupervisorError::config("child exited before its pid was known"));
        };

        Ok(Spawned {
            target: LaunchTarget::Direct { pid },
            child: Some(child),
            log: Some(log),
        })
    }
}

impl SessionLaunch {
    async fn spawn(
        &self,
        settings: &Settings,
        instance: &str,
        config: &InstanceConfig,
        plan: &LaunchPlan,
    ) -> Result<Spawned, SupervisorError> {
        let session = config
            .session_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_session_name(instance));

        // A session left over from an earlier supervisor run would make the name ambiguous.
        match session_listing(settings).await {
            Ok(listing) => {
                if find_session(&listing, &session).is_some() {
                    tracing::warn!(instance, session = %session, "screen session already exists");
                    return Err(SupervisorError::AlreadyManaged(instance.to_string()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SupervisorError::config(format!(
                    "'{}' not found",
                    settings.screen_bin
                )));
            }
            Err(e) => {
                return Err(SupervisorError::config(format!(
                    "cannot query {} sessions: {e}",
                    settings.screen_bin
                )));
            }
        }

        let mut cmd = Command::new(&settings.screen_bin);
        cmd.current_dir(&plan.working_dir)
            .arg("-L")
            .arg("-Logfile")
            .arg(&plan.log_path)
            .arg("-dmS")
            .arg(&session)
            .arg(&plan.program)
            .args(&plan.args)
            // The detached screen daemon may keep inherited pipes open, so nothing is captured.
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let status = match tokio::time::timeout(settings.probe_timeout, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SupervisorError::config(format!(
                    "'{}' not found",
                    settings.screen_bin
                )));
            }
            Ok(Err(e)) => {
                return Err(SupervisorError::fs(
                    format!("spawn {} session", settings.screen_bin),
                    e,
                ));
            }
            Err(_) => {
                return Err(SupervisorError::config(format!(
                    "{} did not return within {:?}",
                    settings.screen_bin, settings.probe_timeout
                )));
            }
        };
        if !status.success() {
            return Err(SupervisorError::config(format!(
                "{} exited with {status} while creating session '{session}'",
                settings.screen_bin
            )));
        }
        tracing::info!(instance, session = %session, "screen session created");

        Ok(Spawned {
            target: LaunchTarget::Session { name: session },
            child: None,
            log: None,
        })
    }
}

async fn run_bounded(mut cmd: Command, settings: &Settings) -> io::Result<Output> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(settings.probe_timeout, cmd.output()).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("command timed out after {:?}", settings.probe_timeout),
        )),
    }
}

async fn session_listing(settings: &Settings) -> io::Result<String> {
    let mut cmd = Command::new(&settings.screen_bin);
    cmd.arg("-ls").stdin(Stdio::null());
    // `screen -ls` exits non-zero on some builds even when sessions exist; only stdout matters.
    let out = run_bounded(cmd, settings).await?;
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Matches `<pid>.<name>` tokens exactly, so `mc_a` never matches `mc_ab`.
/// Returns the session owner pid.
pub(crate) fn find_session(listing: &str, name: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let token = line.split_whitespace().next()?;
        let (pid, session) = token.split_once('.')?;
        let pid = pid.parse::<u32>().ok()?;
        (session == name).then_some(pid)
    })
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(-(pid as i32), sig) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn signal_pid(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, sig) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The ppid field of `/proc/<pid>/stat`. The command name may contain
/// spaces or parentheses, so fields are read after the last `)`.
#[cfg(any(target_os = "linux", test))]
fn parent_pid_from_stat(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

#[cfg(target_os = "linux")]
fn child_pids(parent: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| parent_pid_from_stat(&stat))
                == Some(parent)
        })
        .collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn child_pids(_parent: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(unix)]
fn pid_liveness(pid: u32) -> Liveness {
    match signal_pid(pid, 0) {
        Ok(()) => Liveness::Alive,
        Err(e) => match e.raw_os_error() {
            Some(libc::ESRCH) => Liveness::Dead,
            Some(libc::EPERM) => Liveness::Alive,
            _ => Liveness::Unknown,
        },
    }
}

#[cfg(not(unix))]
fn pid_liveness(_pid: u32) -> Liveness {
    Liveness::Unknown
}

impl LaunchTarget {
    pub fn describe(&self) -> String {
        match self {
            LaunchTarget::Direct { pid } => format!("pid {pid}"),
            LaunchTarget::Session { name } => format!("session '{name}'"),
        }
    }

    pub async fn is_alive(&self, settings: &Settings) -> Liveness {
        match self {
            LaunchTarget::Direct { pid } => pid_liveness(*pid),
            LaunchTarget::Session { name } => match session_listing(settings).await {
                Ok(listing) => {
                    if find_session(&listing, name).is_some() {
                        Liveness::Alive
                    } else {
                        Liveness::Dead
                    }
                }
                Err(e) => {
                    tracing::debug!(session = %name, error = %e, "session probe inconclusive");
                    Liveness::Unknown
                }
            },
        }
    }

    async fn screen_command(&self, settings: &Settings, session: &str, args: &[&str]) -> io::Result<()> {
        let mut cmd = Command::new(&settings.screen_bin);
        cmd.arg("-S").arg(session).args(args).stdin(Stdio::null());
        let out = run_bounded(cmd, settings).await?;
        if !out.status.success() {
            return Err(io::Error::other(format!(
                "{} -S {} {}: {}",
                settings.screen_bin,
                session,
                args.join(" "),
                String::from_utf8_lossy(&out.stdout).trim()
            )));
        }
        Ok(())
    }

    /// Polite request: `stop` typed into the session, or SIGINT to the group.
    pub async fn shutdown_request(&self, settings: &Settings) -> io::Result<()> {
        match self {
            LaunchTarget::Session { name } => {
                self.screen_command(settings, name, &["-X", "stuff", "stop\r"])
                    .await
            }
            #[cfg(unix)]
            LaunchTarget::Direct { pid } => signal_group(*pid, libc::SIGINT),
            #[cfg(not(unix))]
            LaunchTarget::Direct { .. } => Err(io::Error::other("signals unsupported")),
        }
    }

    pub async fn terminate(&self, settings: &Settings) -> io::Result<()> {
        match self {
            LaunchTarget::Session { name } => {
                self.screen_command(settings, name, &["-X", "quit"]).await
            }
            #[cfg(unix)]
            LaunchTarget::Direct { pid } => signal_group(*pid, libc::SIGTERM),
            #[cfg(not(unix))]
            LaunchTarget::Direct { .. } => Err(io::Error::other("signals unsupported")),
        }
    }

    pub async fn kill(&self, settings: &Settings) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            LaunchTarget::Session { name } => {
                let listing = session_listing(settings).await?;
                let Some(pid) = find_session(&listing, name) else {
                    return Ok(());
                };
                // The server runs under the screen daemon in its own group;
                // killing only the daemon would orphan it.
                for child in child_pids(pid) {
                    if signal_group(child, libc::SIGKILL).is_err() {
                        let _ = signal_pid(child, libc::SIGKILL);
                    }
                }
                signal_pid(pid, libc::SIGKILL)
            }
            #[cfg(unix)]
            LaunchTarget::Direct { pid } => signal_group(*pid, libc::SIGKILL),
            #[cfg(not(unix))]
            _ => Err(io::Error::other("signals unsupported")),
        }
    }
}
