use anyhow::Context;
use ingot_agent::{ProcessSupervisor, Settings, dispatch};
use tokio::{io::BufReader, sync::mpsc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries JSON results only; diagnostics go to stderr.
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(writer)
        .init();

    let settings = Settings::from_env();
    tokio::fs::create_dir_all(settings.instances_dir())
        .await
        .with_context(|| format!("create {}", settings.instances_dir().display()))?;
    tracing::info!(
        data_root = %settings.data_root.display(),
        binaries = %settings.binaries_dir.display(),
        "ingot-agent ready"
    );

    let sup = ProcessSupervisor::new(settings);
    let (out, rx) = mpsc::unbounded_channel();
    let stdout = tokio::spawn(dispatch::write_stdout(rx));

    dispatch::run(sup, BufReader::new(tokio::io::stdin()), out).await?;
    stdout.await?.context("write stdout")?;

    tracing::info!("ingot-agent exiting");
    Ok(())
}
