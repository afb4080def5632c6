use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures_util::Stream;
use ingot_process::{ErrorCode, InstanceState, Outcome, Severity, StatusView};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::Mutex,
};

use crate::config_store::{ConfigStore, InstanceConfig, validate_instance_name};
use crate::error::SupervisorError;
use crate::launch::{self, LaunchStrategy, LaunchTarget, Liveness, OwnedLog};
use crate::log_tail;
use crate::rcon;
use crate::reconcile::StatusReconciler;
use crate::settings::Settings;

/// What the supervisor knows about one running instance.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    pub launch_id: u64,
    pub target: LaunchTarget,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    /// Present for direct launches only; session mode logs through screen.
    pub log: Option<OwnedLog>,
    pub config: InstanceConfig,
    pub server_port: u16,
    pub rcon_available: bool,
    pub started_at: Instant,
}

impl RuntimeHandle {
    /// Ports this launch listens on: game port first, then rcon if enabled.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.server_port];
        if let Some((port, _)) = self.config.rcon() {
            ports.push(port);
        }
        ports
    }
}

#[derive(Debug)]
pub(crate) enum Slot {
    /// Name and ports reserved by an in-flight `start`.
    Launching { launch_id: u64, ports: Vec<u16> },
    Live(RuntimeHandle),
    /// Name held while `delete` removes the instance directory.
    Deleting,
}

impl Slot {
    fn ports(&self) -> Vec<u16> {
        match self {
            Slot::Launching { ports, .. } => ports.clone(),
            Slot::Live(h) => h.ports(),
            Slot::Deleting => Vec::new(),
        }
    }
}

pub(crate) type HandleTable = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Debug, Clone, Copy)]
enum StopStep {
    Graceful,
    Terminate,
    Kill,
}

impl StopStep {
    fn label(self) -> &'static str {
        match self {
            StopStep::Graceful => "graceful stop request",
            StopStep::Terminate => "terminate",
            StopStep::Kill => "kill",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    settings: Settings,
    store: ConfigStore,
    table: HandleTable,
    reconciler: StatusReconciler,
    next_launch_id: Arc<AtomicU64>,
}

fn flatten(res: Result<Outcome, SupervisorError>) -> Outcome {
    res.unwrap_or_else(|e| e.to_outcome())
}

async fn pump_lines<R>(reader: Option<R>, log: OwnedLog)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => log.write(&line).await,
            Err(e) => {
                tracing::debug!(error = %e, "child output read failed");
                break;
            }
        }
    }
}

impl ProcessSupervisor {
    pub fn new(settings: Settings) -> Self {
        let table: HandleTable = Arc::new(Mutex::new(HashMap::new()));
        Self {
            store: ConfigStore::new(settings.clone()),
            reconciler: StatusReconciler::new(settings.clone(), table.clone()),
            settings,
            table,
            next_launch_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    async fn live_handle(&self, name: &str) -> Option<RuntimeHandle> {
        match self.table.lock().await.get(name) {
            Some(Slot::Live(h)) => Some(h.clone()),
            _ => None,
        }
    }

    /// Config the live process was launched with.
    pub async fn snapshot(&self, name: &str) -> Option<InstanceConfig> {
        self.live_handle(name).await.map(|h| h.config)
    }

    /// Claims `name` and `ports` in one step, so two launches can never
    /// share an instance name or a listening port.
    async fn reserve(&self, name: &str, ports: Vec<u16>) -> Result<u64, SupervisorError> {
        let mut table = self.table.lock().await;
        if table.contains_key(name) {
            return Err(SupervisorError::AlreadyManaged(name.to_string()));
        }
        for (other, slot) in table.iter() {
            if let Some(port) = slot.ports().into_iter().find(|p| ports.contains(p)) {
                return Err(SupervisorError::config(format!(
                    "port {port} is already used by instance {other}"
                )));
            }
        }
        let launch_id = self.next_launch_id.fetch_add(1, Ordering::Relaxed);
        table.insert(name.to_string(), Slot::Launching { launch_id, ports });
        Ok(launch_id)
    }

    async fn release(&self, name: &str, launch_id: u64) {
        let mut table = self.table.lock().await;
        if matches!(table.get(name), Some(Slot::Launching { launch_id: id, .. }) if *id == launch_id) {
            table.remove(name);
        }
    }

    async fn remove_if_current(&self, name: &str, launch_id: u64) -> Option<RuntimeHandle> {
        let removed = remove_live(&self.table, name, launch_id).await;
        if let Some(h) = &removed
            && let Some(log) = &h.log
        {
            log.close().await;
        }
        removed
    }

    pub async fn start(&self, name: &str, config: InstanceConfig) -> Outcome {
        flatten(self.try_start(name, config).await)
    }

    async fn try_start(&self, name: &str, mut config: InstanceConfig) -> Result<Outcome, SupervisorError> {
        let name = validate_instance_name(name)?.to_string();
        config.apply_defaults(&name);
        config.validate()?;

        let mut ports = vec![launch::resolve_server_port(
            &config.server_args,
            &self.settings.instance_dir(&name),
        )];
        if let Some((port, _)) = config.rcon() {
            ports.push(port);
        }

        self.reconciler.reconcile().await;
        let launch_id = self.reserve(&name, ports).await?;

        let res = self.launch_reserved(&name, launch_id, config).await;
        if let Err(e) = &res {
            tracing::warn!(instance = %name, error = %e, "launch failed");
            self.release(&name, launch_id).await;
        }
        res
    }

    async fn launch_reserved(
        &self,
        name: &str,
        launch_id: u64,
        config: InstanceConfig,
    ) -> Result<Outcome, SupervisorError> {
        self.store.save(name, &config).await?;

        let plan = launch::prepare(&self.settings, name, &config)?;
        let strategy = LaunchStrategy::for_mode(config.launch_mode);
        let spawned = strategy.spawn(&self.settings, name, &config, &plan).await?;

        let rcon = config.rcon().map(|(port, _)| port);
        tracing::info!(
            instance = %name,
            launch_id,
            mode = %config.launch_mode,
            target = %spawned.target.describe(),
            port = plan.server_port,
            config = ?config.redacted(),
            "instance started"
        );

        let handle = RuntimeHandle {
            launch_id,
            target: spawned.target.clone(),
            working_dir: plan.working_dir.clone(),
            log_path: plan.log_path.clone(),
            log: spawned.log.clone(),
            rcon_available: rcon.is_some(),
            config,
            server_port: plan.server_port,
            started_at: Instant::now(),
        };
        self.table
            .lock()
            .await
            .insert(name.to_string(), Slot::Live(handle));

        if let (Some(child), Some(log)) = (spawned.child, spawned.log) {
            self.spawn_direct_watcher(name.to_string(), launch_id, child, log);
        }

        let mut message = format!(
            "Started {name} ({} launch, {}, port {}",
            match spawned.target {
                LaunchTarget::Direct { .. } => "direct",
                LaunchTarget::Session { .. } => "session",
            },
            spawned.target.describe(),
            plan.server_port
        );
        if let Some(port) = rcon {
            message.push_str(&format!(", rcon {port}"));
        }
        message.push(')');
        Ok(Outcome::success(message))
    }

    /// One watcher per direct child: copies its output into the log, reaps it,
    /// then drops the handle if it still belongs to this launch.
    fn spawn_direct_watcher(&self, name: String, launch_id: u64, mut child: Child, log: OwnedLog) {
        let table = self.table.clone();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            tokio::join!(
                pump_lines(stdout, log.clone()),
                pump_lines(stderr, log.clone())
            );

            match child.wait().await {
                Ok(status) => {
                    tracing::info!(instance = %name, launch_id, status = %status, "direct child exited");
                    log.write(format!("[ingot] process exited: {status}\n").as_bytes())
                        .await;
                }
                Err(e) => tracing::warn!(instance = %name, launch_id, error = %e, "failed to reap direct child"),
            }

            remove_live(&table, &name, launch_id).await;
            log.close().await;
        });
    }

    /// Probes `target` until it is gone or `within` elapses.
    async fn wait_until_dead(&self, target: &LaunchTarget, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if target.is_alive(&self.settings).await == Liveness::Dead {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Escalates graceful, terminate, kill. The handle is only dropped once a
    /// probe confirms the process is gone.
    async fn stop_handle(&self, name: &str, handle: &RuntimeHandle) -> Result<(), SupervisorError> {
        let steps = [
            (StopStep::Graceful, self.settings.stop_grace),
            (StopStep::Terminate, self.settings.term_grace),
            (StopStep::Kill, self.settings.kill_grace),
        ];
        let mut waited = Duration::ZERO;

        for (step, grace) in steps {
            let sent = match step {
                StopStep::Graceful => handle.target.shutdown_request(&self.settings).await,
                StopStep::Terminate => handle.target.terminate(&self.settings).await,
                StopStep::Kill => handle.target.kill(&self.settings).await,
            };
            match sent {
                Ok(()) => tracing::info!(instance = %name, step = step.label(), target = %handle.target.describe(), "stop step sent"),
                Err(e) => tracing::warn!(instance = %name, step = step.label(), error = %e, "stop step failed"),
            }

            if self.wait_until_dead(&handle.target, grace).await {
                self.remove_if_current(name, handle.launch_id).await;
                tracing::info!(
                    instance = %name,
                    uptime_secs = handle.started_at.elapsed().as_secs(),
                    "instance stopped"
                );
                return Ok(());
            }
            waited += grace;
        }

        Err(SupervisorError::StopTimeout {
            name: name.to_string(),
            waited,
        })
    }

    pub async fn stop(&self, name: &str) -> Outcome {
        flatten(self.try_stop(name).await)
    }

    async fn try_stop(&self, name: &str) -> Result<Outcome, SupervisorError> {
        let name = validate_instance_name(name)?;
        self.reconciler.reconcile().await;
        let Some(handle) = self.live_handle(name).await else {
            return Err(SupervisorError::NotManaged(name.to_string()));
        };
        self.stop_handle(name, &handle).await?;
        Ok(Outcome::success(format!(
            "Stopped {name} ({})",
            handle.target.describe()
        )))
    }

    pub async fn restart(&self, name: &str) -> Outcome {
        flatten(self.try_restart(name).await)
    }

    async fn try_restart(&self, name: &str) -> Result<Outcome, SupervisorError> {
        let name = validate_instance_name(name)?;
        self.reconciler.reconcile().await;

        let live = self.live_handle(name).await;
        let snapshot = live.as_ref().map(|h| h.config.clone());

        if let Some(handle) = &live {
            if let Err(e) = self.stop_handle(name, handle).await
                && e.severity() == Severity::Error
            {
                return Err(e);
            }
            if !self
                .wait_until_dead(&handle.target, self.settings.restart_wait)
                .await
            {
                return Ok(Outcome::warning(
                    ErrorCode::StopTimeout,
                    format!(
                        "{name} is still running after {:?}; not relaunching",
                        self.settings.restart_wait
                    ),
                ));
            }
        }

        let config = match snapshot {
            Some(c) => c,
            None => {
                let mut c = self.store.load(name).await.ok_or_else(|| {
                    SupervisorError::config(format!("no configuration stored for {name}"))
                })?;
                c.apply_defaults(name);
                c
            }
        };

        let outcome = self.start(name, config).await;
        if outcome.is_success() {
            return Ok(Outcome::success(format!("Restarted: {}", outcome.message)));
        }
        Ok(outcome)
    }

    /// Launch from the stored config.
    pub async fn start_saved(&self, name: &str) -> Outcome {
        let name = match validate_instance_name(name) {
            Ok(n) => n,
            Err(e) => return e.to_outcome(),
        };
        match self.store.load(name).await {
            Some(mut config) => {
                config.apply_defaults(name);
                self.start(name, config).await
            }
            None => SupervisorError::config(format!("no configuration stored for {name}")).to_outcome(),
        }
    }

    /// Only a failed directory removal is returned as `Err`.
    pub async fn delete(&self, name: &str) -> Result<Outcome, SupervisorError> {
        let name = match validate_instance_name(name) {
            Ok(n) => n,
            Err(e) => return Ok(e.to_outcome()),
        };
        self.reconciler.reconcile().await;

        let stopped = self.live_handle(name).await;
        if let Some(handle) = &stopped {
            if let Err(e) = self.stop_handle(name, handle).await
                && e.severity() == Severity::Error
            {
                return Ok(e.to_outcome());
            }
            if !self
                .wait_until_dead(&handle.target, self.settings.delete_grace)
                .await
            {
                return Ok(Outcome::warning(
                    ErrorCode::StopTimeout,
                    format!("{name} is still running; nothing was deleted"),
                ));
            }
        }

        // Hold the name until the directory is gone; a start that got in
        // first keeps its files.
        let residual = {
            let mut table = self.table.lock().await;
            let stopped_id = stopped.as_ref().map(|h| h.launch_id);
            let busy = match table.get(name) {
                None => None,
                Some(Slot::Live(h)) if Some(h.launch_id) == stopped_id => None,
                Some(Slot::Live(_)) => Some("was started again"),
                Some(Slot::Launching { .. }) => Some("is starting"),
                Some(Slot::Deleting) => Some("is already being deleted"),
            };
            if let Some(why) = busy {
                return Ok(Outcome::warning(
                    ErrorCode::AlreadyManaged,
                    format!("{name} {why}; nothing was deleted"),
                ));
            }
            table.insert(name.to_string(), Slot::Deleting)
        };
        if let Some(Slot::Live(h)) = &residual
            && let Some(log) = &h.log
        {
            log.close().await;
        }

        let res = self
            .remove_instance_dir(name, matches!(residual, Some(Slot::Live(_))))
            .await;
        let mut table = self.table.lock().await;
        if matches!(table.get(name), Some(Slot::Deleting)) {
            table.remove(name);
        }
        res
    }

    async fn remove_instance_dir(&self, name: &str, had_handle: bool) -> Result<Outcome, SupervisorError> {
        let dir = self.settings.instance_dir(name);
        let dir_exists = tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir());
        if !dir_exists {
            if had_handle {
                return Ok(Outcome::success(format!("Cleared runtime state for {name}")));
            }
            return Ok(Outcome::warning(
                ErrorCode::NotManaged,
                format!("instance '{name}' does not exist"),
            ));
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| SupervisorError::fs(format!("remove {}", dir.display()), e))?;
        tracing::info!(instance = %name, path = %dir.display(), "instance deleted");
        Ok(Outcome::success(format!("Deleted {name}")))
    }

    async fn view(&self, name: &str, slot: Option<(InstanceState, Option<RuntimeHandle>)>) -> StatusView {
        let (state, handle) = slot.unwrap_or((InstanceState::Stopped, None));
        let stored = self.store.load(name).await;
        let has_config = self.store.exists(name).await;

        let (rcon_available, server_port) = match &handle {
            Some(h) => (h.rcon_available, h.server_port),
            None => {
                let args = stored.as_ref().map(|c| c.server_args.as_str()).unwrap_or("");
                (
                    stored.as_ref().is_some_and(InstanceConfig::rcon_available),
                    launch::resolve_server_port(args, &self.settings.instance_dir(name)),
                )
            }
        };
        let log_path = handle
            .as_ref()
            .map(|h| h.log_path.clone())
            .unwrap_or_else(|| self.settings.log_path(name));
        let log_exists = tokio::fs::metadata(&log_path)
            .await
            .is_ok_and(|m| m.is_file());

        StatusView {
            name: name.to_string(),
            state,
            has_config,
            rcon_available,
            server_port,
            log_exists,
        }
    }

    async fn slot_state(&self, name: &str) -> Option<(InstanceState, Option<RuntimeHandle>)> {
        match self.table.lock().await.get(name)? {
            Slot::Launching { .. } => Some((InstanceState::Starting, None)),
            Slot::Deleting => Some((InstanceState::Stopped, None)),
            Slot::Live(h) => {
                let state = match &h.target {
                    LaunchTarget::Direct { pid } => InstanceState::RunningDirect { pid: *pid },
                    LaunchTarget::Session { name } => InstanceState::RunningSession {
                        session: name.clone(),
                    },
                };
                Some((state, Some(h.clone())))
            }
        }
    }

    pub async fn status(&self, name: &str) -> Result<StatusView, SupervisorError> {
        let name = validate_instance_name(name)?;
        self.reconciler.reconcile().await;
        let slot = self.slot_state(name).await;
        Ok(self.view(name, slot).await)
    }

    pub async fn status_all(&self) -> Vec<StatusView> {
        self.reconciler.reconcile().await;
        let mut names: BTreeSet<String> = self.store.list_instances().await.into_iter().collect();
        names.extend(self.table.lock().await.keys().cloned());

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let slot = self.slot_state(&name).await;
            out.push(self.view(&name, slot).await);
        }
        out
    }

    /// Live log lines for `name`. The stream never ends on its own.
    pub async fn subscribe_log(
        &self,
        name: &str,
    ) -> Result<impl Stream<Item = String> + Send + 'static, SupervisorError> {
        let name = validate_instance_name(name)?;
        let path = self
            .live_handle(name)
            .await
            .map(|h| h.log_path)
            .unwrap_or_else(|| self.settings.log_path(name));
        Ok(log_tail::tail_lines(path, self.settings.tail.clone()))
    }

    pub async fn recent_log_lines(&self, name: &str, n: usize) -> Result<Vec<String>, SupervisorError> {
        let name = validate_instance_name(name)?;
        let path = self
            .live_handle(name)
            .await
            .map(|h| h.log_path)
            .unwrap_or_else(|| self.settings.log_path(name));
        match log_tail::read_last_lines(&path, n, self.settings.tail.max_read_bytes).await {
            Ok(lines) => Ok(lines),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SupervisorError::config(
                format!("no log file for {name} at {}", path.display()),
            )),
            Err(e) => Err(SupervisorError::fs(format!("read {}", path.display()), e)),
        }
    }

    pub async fn send_command(&self, name: &str, command: &str) -> Outcome {
        flatten(self.try_send_command(name, command).await)
    }

    async fn try_send_command(&self, name: &str, command: &str) -> Result<Outcome, SupervisorError> {
        let name = validate_instance_name(name)?;
        let command = command.trim();
        if command.is_empty() {
            return Err(SupervisorError::config("command is empty"));
        }

        let config = match self.snapshot(name).await {
            Some(c) => c,
            None => self.store.load(name).await.ok_or_else(|| {
                SupervisorError::config(format!("no configuration stored for {name}"))
            })?,
        };
        let Some((port, password)) = config.rcon() else {
            return Err(SupervisorError::config(format!(
                "rcon is not configured for {name}"
            )));
        };

        let response = rcon::exchange_async(
            port,
            password.to_string(),
            command.to_string(),
            self.settings.rcon_timeout,
        )
        .await?;
        tracing::info!(instance = %name, rcon_port = port, "rcon command relayed");

        if response.trim().is_empty() {
            return Ok(Outcome::success("(no output)"));
        }
        Ok(Outcome::success(response))
    }

    /// Sorted `*.jar` names available for new instances.
    pub async fn list_binaries(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(mut rd) = tokio::fs::read_dir(&self.settings.binaries_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if let Some(name) = entry.file_name().to_str()
                && is_file
                && name.to_ascii_lowercase().ends_with(".jar")
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        out
    }
}

async fn remove_live(table: &HandleTable, name: &str, launch_id: u64) -> Option<RuntimeHandle> {
    let mut table = table.lock().await;
    let current = matches!(table.get(name), Some(Slot::Live(h)) if h.launch_id == launch_id);
    if !current {
        return None;
    }
    match table.remove(name) {
        Some(Slot::Live(h)) => Some(h),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::tests::temp_dir_for;
    use ingot_process::LaunchMode;
    use std::path::Path;

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    /// Supervisor whose `java` is a shell script running `body`.
    fn supervisor_with(test: &str, body: &str) -> (ProcessSupervisor, PathBuf) {
        supervisor_tuned(test, body, |_, _| {})
    }

    fn supervisor_tuned(
        test: &str,
        body: &str,
        tune: impl FnOnce(&mut Settings, &Path),
    ) -> (ProcessSupervisor, PathBuf) {
        let root = temp_dir_for(test);
        let mut s = Settings::with_data_root(root.clone());
        std::fs::create_dir_all(&s.binaries_dir).unwrap();
        std::fs::write(s.binaries_dir.join("server.jar"), b"jar").unwrap();

        let java = root.join("fake-java");
        write_script(&java, body);
        s.java_bin = java.display().to_string();
        s.stop_grace = Duration::from_secs(2);
        s.term_grace = Duration::from_secs(1);
        s.kill_grace = Duration::from_secs(1);
        s.restart_wait = Duration::from_secs(2);
        s.delete_grace = Duration::from_secs(1);
        s.poll_interval = Duration::from_millis(50);
        tune(&mut s, &root);
        (ProcessSupervisor::new(s), root)
    }

    /// A `screen` stand-in keeping one `<name>.session` pid file per session
    /// under `<root>/screens`.
    fn fake_screen(settings: &mut Settings, root: &Path) {
        let state = root.join("screens");
        std::fs::create_dir_all(&state).unwrap();
        let screen = root.join("fake-screen");
        write_script(
            &screen,
            &format!(
                r#"state="{}"
case "$1" in
  -ls)
    found=0
    for f in "$state"/*.session; do
      [ -e "$f" ] || continue
      printf '\t%s.%s\t(Detached)\n' "$(cat "$f")" "$(basename "$f" .session)"
      found=1
    done
    [ "$found" = 1 ] || echo "No Sockets found in $state."
    exit 1
    ;;
  -L)
    log="$3"; name="$5"; shift 5
    "$@" >> "$log" 2>&1 &
    echo $! > "$state/$name.session"
    ;;
  -S)
    pid=$(cat "$state/$2.session" 2>/dev/null) || exit 1
    kill -TERM "$pid" 2>/dev/null
    rm -f "$state/$2.session"
    ;;
esac"#,
                state.display()
            ),
        );
        settings.screen_bin = screen.display().to_string();
    }

    fn session_config() -> InstanceConfig {
        InstanceConfig {
            launch_mode: LaunchMode::Session,
            ..direct_config()
        }
    }

    fn long_running(test: &str) -> (ProcessSupervisor, PathBuf) {
        supervisor_with(test, "echo \"fake server $*\"\nexec sleep 30")
    }

    fn direct_config() -> InstanceConfig {
        InstanceConfig {
            server_binary: "server.jar".to_string(),
            max_heap: "2G".to_string(),
            launch_mode: LaunchMode::Direct,
            eula_accepted: true,
            ..InstanceConfig::default()
        }
    }

    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn concurrent_starts_yield_one_success() {
        let (sup, root) = long_running("sup-concurrent");

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let sup = sup.clone();
            tasks.push(tokio::spawn(async move {
                sup.start("lobby", direct_config()).await
            }));
        }
        let mut outcomes = Vec::new();
        for t in tasks {
            outcomes.push(t.await.unwrap());
        }

        let ok = outcomes.iter().filter(|o| o.is_success()).count();
        assert_eq!(ok, 1, "{outcomes:?}");
        assert!(
            outcomes
                .iter()
                .filter(|o| !o.is_success())
                .all(|o| o.code == Some(ErrorCode::AlreadyManaged))
        );

        assert!(sup.stop("lobby").await.is_success());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn stop_without_handle_is_a_warning() {
        let (sup, root) = long_running("sup-stop-none");
        let o = sup.stop("ghost").await;
        assert!(o.is_warning());
        assert_eq!(o.code, Some(ErrorCode::NotManaged));
        assert!(sup.table.lock().await.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn start_then_stop_clears_the_handle() {
        let (sup, root) = long_running("sup-start-stop");
        let o = sup.start("lobby", direct_config()).await;
        assert!(o.is_success(), "{o:?}");
        assert!(o.message.contains("direct launch"));

        let view = sup.status("lobby").await.unwrap();
        assert!(matches!(view.state, InstanceState::RunningDirect { .. }));
        assert!(view.has_config);
        assert_eq!(view.server_port, 25565);

        let o = sup.stop("lobby").await;
        assert!(o.is_success(), "{o:?}");
        assert!(sup.snapshot("lobby").await.is_none());

        let view = sup.status("lobby").await.unwrap();
        assert_eq!(view.state, InstanceState::Stopped);
        assert!(view.log_exists);

        let again = sup.stop("lobby").await;
        assert!(again.is_warning());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn child_output_lands_in_the_log() {
        let (sup, root) = long_running("sup-log");
        assert!(sup.start("lobby", direct_config()).await.is_success());

        let s = &sup;
        let found = wait_for(move || async move {
            s.recent_log_lines("lobby", 10)
                .await
                .map(|lines| lines.iter().any(|l| l.contains("fake server") && l.contains("-Xmx2G")))
                .unwrap_or(false)
        })
        .await;
        assert!(found);

        let lines = sup.recent_log_lines("lobby", 10).await.unwrap();
        assert!(lines[0].starts_with("--- Log lobby @ "));

        sup.stop("lobby").await;
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn exited_child_is_pruned_by_its_watcher() {
        let (sup, root) = supervisor_with("sup-exit", "echo bye\nexit 0");
        assert!(sup.start("lobby", direct_config()).await.is_success());

        let s = &sup;
        let gone = wait_for(move || async move { s.snapshot("lobby").await.is_none() }).await;
        assert!(gone);
        let view = sup.status("lobby").await.unwrap();
        assert_eq!(view.state, InstanceState::Stopped);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn restart_prefers_the_live_snapshot() {
        let (sup, root) = long_running("sup-restart");
        assert!(sup.start("lobby", direct_config()).await.is_success());

        let stored = InstanceConfig {
            max_heap: "4G".to_string(),
            ..direct_config()
        };
        sup.store().save("lobby", &stored).await.unwrap();

        let o = sup.restart("lobby").await;
        assert!(o.is_success(), "{o:?}");
        assert_eq!(sup.snapshot("lobby").await.unwrap().max_heap, "2G");

        sup.stop("lobby").await;
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn restart_without_handle_or_config_is_a_configuration_error() {
        let (sup, root) = long_running("sup-restart-none");
        let o = sup.restart("ghost").await;
        assert!(o.is_error());
        assert_eq!(o.code, Some(ErrorCode::Configuration));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn delete_unknown_is_a_warning_without_writes() {
        let (sup, root) = long_running("sup-delete-none");
        let o = sup.delete("ghost").await.unwrap();
        assert!(o.is_warning());
        assert!(!sup.settings().instance_dir("ghost").exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn delete_stops_and_removes_the_directory() {
        let (sup, root) = long_running("sup-delete");
        assert!(sup.start("lobby", direct_config()).await.is_success());
        let dir = sup.settings().instance_dir("lobby");
        assert!(dir.exists());

        let o = sup.delete("lobby").await.unwrap();
        assert!(o.is_success(), "{o:?}");
        assert!(!dir.exists());
        assert!(sup.snapshot("lobby").await.is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn start_rejects_bad_input_without_leaving_a_handle() {
        let (sup, root) = long_running("sup-reject");

        let o = sup.start("../etc", direct_config()).await;
        assert_eq!(o.code, Some(ErrorCode::Configuration));

        let mut one_sided = direct_config();
        one_sided.rcon_port = Some(25575);
        let o = sup.start("lobby", one_sided).await;
        assert_eq!(o.code, Some(ErrorCode::Configuration));

        let missing = InstanceConfig {
            server_binary: "nope.jar".to_string(),
            ..direct_config()
        };
        let o = sup.start("lobby", missing).await;
        assert!(o.is_error());
        assert!(sup.table.lock().await.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn send_command_requires_rcon_config() {
        let (sup, root) = long_running("sup-rcon");
        sup.store().save("lobby", &direct_config()).await.unwrap();

        let o = sup.send_command("lobby", "list").await;
        assert_eq!(o.code, Some(ErrorCode::Configuration));
        let o = sup.send_command("lobby", "   ").await;
        assert_eq!(o.code, Some(ErrorCode::Configuration));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn status_all_lists_stored_instances() {
        let (sup, root) = long_running("sup-status-all");
        sup.store().save("b", &direct_config()).await.unwrap();
        sup.store().save("a", &direct_config()).await.unwrap();

        let views = sup.status_all().await;
        let names: Vec<&str> = views.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(views.iter().all(|v| v.state == InstanceState::Stopped && v.has_config));
        assert_eq!(sup.list_binaries().await, vec!["server.jar".to_string()]);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn delete_leaves_an_in_flight_start_alone() {
        let (sup, root) = long_running("sup-delete-launching");
        sup.store().save("lobby", &direct_config()).await.unwrap();
        sup.table.lock().await.insert(
            "lobby".into(),
            Slot::Launching {
                launch_id: 99,
                ports: vec![25565],
            },
        );

        let o = sup.delete("lobby").await.unwrap();
        assert!(o.is_warning(), "{o:?}");
        assert_eq!(o.code, Some(ErrorCode::AlreadyManaged));
        assert!(sup.settings().instance_dir("lobby").exists());
        assert!(matches!(
            sup.table.lock().await.get("lobby"),
            Some(Slot::Launching { launch_id: 99, .. })
        ));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn start_is_refused_while_a_delete_holds_the_name() {
        let (sup, root) = long_running("sup-start-deleting");
        sup.table.lock().await.insert("lobby".into(), Slot::Deleting);

        let o = sup.start("lobby", direct_config()).await;
        assert_eq!(o.code, Some(ErrorCode::AlreadyManaged));
        assert_eq!(sup.status("lobby").await.unwrap().state, InstanceState::Stopped);
        assert!(matches!(sup.table.lock().await.get("lobby"), Some(Slot::Deleting)));

        let o = sup.delete("lobby").await.unwrap();
        assert_eq!(o.code, Some(ErrorCode::AlreadyManaged));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn port_conflicts_are_rejected_at_start() {
        let (sup, root) = long_running("sup-ports");
        assert!(sup.start("a", direct_config()).await.is_success());

        let o = sup.start("b", direct_config()).await;
        assert!(o.is_error(), "{o:?}");
        assert_eq!(o.code, Some(ErrorCode::Configuration));
        assert!(o.message.contains("25565"));
        assert!(sup.snapshot("b").await.is_none());

        let mut rcon_clash = direct_config();
        rcon_clash.server_args = "nogui --port 25571".to_string();
        rcon_clash.rcon_port = Some(25565);
        rcon_clash.rcon_password = Some("pw".to_string());
        let o = sup.start("c", rcon_clash).await;
        assert_eq!(o.code, Some(ErrorCode::Configuration));

        let other_port = InstanceConfig {
            server_args: "nogui --port 25570".to_string(),
            ..direct_config()
        };
        let o = sup.start("d", other_port).await;
        assert!(o.is_success(), "{o:?}");

        assert!(sup.stop("a").await.is_success());
        assert!(sup.stop("d").await.is_success());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_escalates_to_kill_when_signals_are_ignored() {
        let (sup, root) = supervisor_tuned(
            "sup-escalate",
            "trap '' INT TERM\necho ready\nwhile true; do sleep 1; done",
            |s, _| {
                s.stop_grace = Duration::from_secs(1);
                s.term_grace = Duration::from_secs(1);
                s.kill_grace = Duration::from_secs(3);
            },
        );
        assert!(sup.start("lobby", direct_config()).await.is_success());
        let s = &sup;
        let ready = wait_for(move || async move {
            s.recent_log_lines("lobby", 10)
                .await
                .map(|lines| lines.iter().any(|l| l == "ready"))
                .unwrap_or(false)
        })
        .await;
        assert!(ready);

        let began = Instant::now();
        let o = sup.stop("lobby").await;
        assert!(o.is_success(), "{o:?}");
        assert!(began.elapsed() >= Duration::from_secs(2));
        assert!(sup.snapshot("lobby").await.is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_start_and_stop_go_through_screen() {
        let (sup, root) = supervisor_tuned("sup-session", "echo \"fake server $*\"\nexec sleep 30", fake_screen);

        let o = sup.start("lobby", session_config()).await;
        assert!(o.is_success(), "{o:?}");
        assert!(o.message.contains("session launch"));
        let view = sup.status("lobby").await.unwrap();
        assert_eq!(
            view.state,
            InstanceState::RunningSession {
                session: "mc_lobby".to_string()
            }
        );

        let o = sup.stop("lobby").await;
        assert!(o.is_success(), "{o:?}");
        assert!(!root.join("screens").join("mc_lobby.session").exists());
        assert_eq!(sup.status("lobby").await.unwrap().state, InstanceState::Stopped);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn leftover_screen_session_blocks_start() {
        let (sup, root) = supervisor_tuned("sup-session-leftover", "exec sleep 30", fake_screen);
        std::fs::write(root.join("screens").join("mc_lobby.session"), "4242\n").unwrap();

        let o = sup.start("lobby", session_config()).await;
        assert_eq!(o.code, Some(ErrorCode::AlreadyManaged), "{o:?}");
        assert!(sup.table.lock().await.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }
}
