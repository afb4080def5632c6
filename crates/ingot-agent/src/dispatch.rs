//! Runs console commands concurrently against one supervisor.
//!
//! Every command gets its own task, so a slow `stop` never holds up a
//! `status` typed after it. Results are JSON lines sent to a single writer.

use anyhow::Context;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};

use crate::config_store::InstanceConfig;
use crate::console::{self, ConsoleCommand};
use crate::supervisor::ProcessSupervisor;

/// One serialized JSON value per message.
pub type Output = mpsc::UnboundedSender<String>;

fn emit<T: Serialize>(out: &Output, value: &T) -> anyhow::Result<()> {
    let line = serde_json::to_string(value)?;
    out.send(line)
        .map_err(|_| anyhow::anyhow!("output writer has stopped"))
}

fn emit_error(out: &Output, message: impl Into<String>) -> anyhow::Result<()> {
    emit(out, &serde_json::json!({ "severity": "error", "message": message.into() }))
}

/// Drains `rx` to stdout until every sender is gone.
pub async fn write_stdout(mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn load_config_file(path: &std::path::Path) -> anyhow::Result<InstanceConfig> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let config = serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(config)
}

async fn follow(sup: &ProcessSupervisor, out: &Output, name: &str) -> anyhow::Result<()> {
    let stream = match sup.subscribe_log(name).await {
        Ok(s) => s,
        Err(e) => return emit(out, &e.to_outcome()),
    };
    let mut stream = std::pin::pin!(stream);
    loop {
        tokio::select! {
            line = stream.next() => match line {
                Some(line) => emit(out, &serde_json::json!({ "instance": name, "line": line }))?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn handle(sup: &ProcessSupervisor, out: &Output, cmd: ConsoleCommand) -> anyhow::Result<()> {
    match cmd {
        ConsoleCommand::Start { name, config } => match load_config_file(&config).await {
            Ok(cfg) => emit(out, &sup.start(&name, cfg).await),
            Err(e) => emit_error(out, format!("{e:#}")),
        },
        ConsoleCommand::QuickStart { name } => emit(out, &sup.start_saved(&name).await),
        ConsoleCommand::Stop { name } => emit(out, &sup.stop(&name).await),
        ConsoleCommand::Restart { name } => emit(out, &sup.restart(&name).await),
        ConsoleCommand::Delete { name } => match sup.delete(&name).await {
            Ok(outcome) => emit(out, &outcome),
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "delete failed");
                emit(out, &e.to_outcome())
            }
        },
        ConsoleCommand::Status { name: Some(name) } => match sup.status(&name).await {
            Ok(view) => emit(out, &view),
            Err(e) => emit(out, &e.to_outcome()),
        },
        ConsoleCommand::Status { name: None } => emit(out, &sup.status_all().await),
        ConsoleCommand::Logs { name, lines } => match sup.recent_log_lines(&name, lines).await {
            Ok(lines) => emit(out, &serde_json::json!({ "instance": name, "lines": lines })),
            Err(e) => emit(out, &e.to_outcome()),
        },
        ConsoleCommand::Follow { name } => follow(sup, out, &name).await,
        ConsoleCommand::Rcon { name, command } => emit(out, &sup.send_command(&name, &command).await),
        ConsoleCommand::Binaries => emit(out, &serde_json::json!({ "binaries": sup.list_binaries().await })),
        ConsoleCommand::Help => emit(
            out,
            &serde_json::json!({ "help": console::HELP.lines().collect::<Vec<_>>() }),
        ),
        // Handled by `run`.
        ConsoleCommand::Quit => Ok(()),
    }
}

fn log_join_error(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res
        && !e.is_cancelled()
    {
        tracing::error!(error = %e, "command task failed");
    }
}

/// Reads commands from `input` until EOF or `quit`. Commands already running
/// are awaited before returning; `follow` streams are cancelled.
pub async fn run<R>(sup: ProcessSupervisor, input: R, out: Output) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut commands = JoinSet::new();
    let mut follows = JoinSet::new();
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let cmd = match console::parse(&line) {
            Ok(None) => continue,
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(cmd)) => cmd,
            Err(msg) => {
                emit_error(&out, msg)?;
                continue;
            }
        };

        let tasks = if matches!(cmd, ConsoleCommand::Follow { .. }) {
            &mut follows
        } else {
            &mut commands
        };
        let (sup, out) = (sup.clone(), out.clone());
        tasks.spawn(async move {
            if let Err(e) = handle(&sup, &out, cmd).await {
                tracing::warn!(error = %e, "command aborted");
            }
        });

        while let Some(res) = commands.try_join_next() {
            log_join_error(res);
        }
    }

    follows.shutdown().await;
    while let Some(res) = commands.join_next().await {
        log_join_error(res);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::tests::temp_dir_for;
    use crate::settings::Settings;
    use ingot_process::LaunchMode;
    use std::time::Duration;

    fn stubborn_supervisor(test: &str) -> (ProcessSupervisor, std::path::PathBuf) {
        let root = temp_dir_for(test);
        let mut s = Settings::with_data_root(root.clone());
        std::fs::create_dir_all(&s.binaries_dir).unwrap();
        std::fs::write(s.binaries_dir.join("server.jar"), b"jar").unwrap();
        let java = root.join("fake-java");
        std::fs::write(
            &java,
            "#!/bin/sh\ntrap '' INT TERM\nwhile true; do sleep 1; done\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        s.java_bin = java.display().to_string();
        s.stop_grace = Duration::from_secs(1);
        s.term_grace = Duration::from_secs(1);
        s.kill_grace = Duration::from_secs(3);
        s.poll_interval = Duration::from_millis(50);
        (ProcessSupervisor::new(s), root)
    }

    fn config() -> InstanceConfig {
        InstanceConfig {
            server_binary: "server.jar".to_string(),
            launch_mode: LaunchMode::Direct,
            eula_accepted: true,
            ..InstanceConfig::default()
        }
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut values = Vec::new();
        while let Ok(line) = rx.try_recv() {
            values.push(serde_json::from_str(&line).unwrap());
        }
        values
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_stop_does_not_hold_up_later_commands() {
        let (sup, root) = stubborn_supervisor("dispatch-slow-stop");
        assert!(sup.start("lobby", config()).await.is_success());

        let (out, rx) = mpsc::unbounded_channel();
        run(sup.clone(), &b"stop lobby\nbinaries\n"[..], out)
            .await
            .unwrap();

        let values = drain(rx);
        assert_eq!(values.len(), 2, "{values:?}");
        assert_eq!(values[0]["binaries"], serde_json::json!(["server.jar"]));
        assert_eq!(values[1]["severity"], "success");
        assert!(sup.snapshot("lobby").await.is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn end_of_input_cancels_follow_streams() {
        let (sup, root) = stubborn_supervisor("dispatch-follow");
        let (out, rx) = mpsc::unbounded_channel();
        let input = &b"follow lobby\nbogus\nhelp\n"[..];

        tokio::time::timeout(Duration::from_secs(5), run(sup, input, out))
            .await
            .expect("run returned")
            .unwrap();

        let values = drain(rx);
        assert!(values.iter().any(|v| v["severity"] == "error"));
        assert!(values.iter().any(|v| v.get("help").is_some()));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn quit_stops_reading() {
        let (sup, root) = stubborn_supervisor("dispatch-quit");
        let (out, rx) = mpsc::unbounded_channel();
        run(sup, &b"quit\nbinaries\n"[..], out).await.unwrap();
        assert!(drain(rx).is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }
}
