use crate::config::Config;
use crate::controller::Controller;
use crate::session::ObsLink;
use crate::supervisor::Supervisor;
use crate::window::DesktopWindows;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "check-window" {
            return handle_check_window(&config);
        }
        return Err(format!("unknown command: {command}").into());
    }

    tracing::info!(
        url = %config.obs_url(),
        app = %config.watch.app_name,
        indicators = ?config.watch.indicators,
        poll_ms = config.watch.poll_interval_ms,
        "call recorder starting"
    );

    let link = ObsLink::new(config.link_options());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(link.clone(), config.supervisor_options());
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    let controller = Controller::new(
        link.clone(),
        DesktopWindows::new(config.title_matcher()),
        config.poll_interval(),
        config.stop_grace(),
    );
    let mut controller_task = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::warn!(error = %err, "ctrl-c handler failed, shutting down");
            }
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            if let Err(err) = (&mut controller_task).await {
                tracing::warn!(error = %err, "controller task failed");
            }
        }
        res = &mut controller_task => {
            if let Err(err) = res {
                tracing::warn!(error = %err, "controller task failed");
            }
            let _ = shutdown_tx.send(true);
        }
    }

    if link.close() {
        tracing::debug!("close frame queued");
    }
    match tokio::time::timeout(config.shutdown_wait(), supervisor_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "supervisor task failed"),
        Err(_) => tracing::warn!("obs connection did not close in time"),
    }

    tracing::info!(state = %link.connection_state(), "call recorder stopped");
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_check_window(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let windows = DesktopWindows::new(config.title_matcher());
    let titles = windows.matching_titles()?;
    if titles.is_empty() {
        println!(
            "no window matches app \"{}\" with indicators {:?}",
            config.watch.app_name, config.watch.indicators
        );
    } else {
        for title in &titles {
            println!("match: {title}");
        }
    }
    println!("call active: {}", !titles.is_empty());
    Ok(())
}
