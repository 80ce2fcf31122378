use soffice_agent::{config::AgentConfig, office_process::OfficeProcess, process_manager, runner};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = AgentConfig::from_env()?;
    tracing::info!(
        office_home = %cfg.office_home.display(),
        work_dir = %cfg.work_dir.display(),
        endpoints = cfg.endpoints.len(),
        "soffice-agent starting"
    );

    let pm = process_manager::build(cfg.process_manager);
    tracing::debug!(process_manager = ?pm, "process manager selected");

    let settings = runner::RunnerSettings::from(&cfg);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(cfg.endpoints.len());
    for url in &cfg.endpoints {
        tracing::info!(uno_url = %url.uno_connection_url(), "supervising endpoint");
        let process = OfficeProcess::new(
            &cfg.office_home,
            url.clone(),
            cfg.run_as.clone(),
            cfg.template_profile_dir.clone(),
            &cfg.work_dir,
            pm.clone(),
        )
        .with_platform(cfg.platform);
        handles.push(runner::spawn(process, settings, stop_rx.clone()));
    }

    wait_for_shutdown_signal().await;
    let _ = stop_tx.send(true);

    let mut report = Vec::with_capacity(handles.len());
    for handle in handles {
        report.push(handle.join().await);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                    _ = int.recv() => tracing::info!("received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "failed to install signal handlers; falling back to ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for ctrl-c");
    }
}
