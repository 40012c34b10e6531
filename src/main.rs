// src/main.rs

mod cli;
mod console;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use console::Console;
use pkgmux::config::ClientConfig;
use pkgmux::resources::RepositoryHandles;
use pkgmux::ui::{self, UiLoop};
use pkgmux::{
    AppAction, AppRef, ControllerBuilder, DaemonBus, FileResourceLock, FlowHandle, FlowOutcome,
    ServiceController, SocketBus, StaticCatalog,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = ClientConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;

    let bus = Arc::new(
        SocketBus::connect(&config.daemon.socket_path, config.call_timeout()).with_context(
            || {
                format!(
                    "Cannot reach the package daemon at {}",
                    config.daemon.socket_path.display()
                )
            },
        )?,
    );

    let (ui, ui_loop) = ui::channel(config.ui.queue_capacity);
    let mut builder = ControllerBuilder::from_config(&config, bus.clone(), ui)?;
    if let Some(path) = &cli.catalog {
        let catalog = StaticCatalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?;
        builder = builder.catalog(Arc::new(catalog));
    }
    let controller = builder.build()?;

    // `run` drops the UI loop, so late events are discarded, not queued
    let result = run(&cli.command, &config, &controller, ui_loop);

    controller.shutdown();
    bus.shutdown();
    result
}

fn run(
    command: &Commands,
    config: &ClientConfig,
    controller: &ServiceController,
    ui_loop: UiLoop,
) -> Result<ExitCode> {
    let api = controller.check_api()?;
    info!("Daemon speaks API {}", api);

    let flow = match command {
        Commands::Update {
            repositories,
            force,
        } => controller.update_repositories(repositories.clone(), *force)?,
        Commands::Install {
            package_id,
            repository,
            simulate,
        } => controller.application_request(
            AppRef::new(*package_id, repository.as_str()),
            AppAction::Install,
            *simulate,
        )?,
        Commands::Remove {
            package_id,
            repository,
            simulate,
        } => controller.application_request(
            AppRef::new(*package_id, repository.as_str()),
            AppAction::Remove,
            *simulate,
        )?,
        Commands::Upgrade { simulate } => controller.upgrade_system(*simulate)?,
        Commands::Status => {
            drop(ui_loop);
            return status(api, config, controller);
        }
    };

    drive(&ui_loop, flow)
}

/// Render events on this thread until the flow returns
fn drive(ui_loop: &UiLoop, flow: FlowHandle<pkgmux::Result<FlowOutcome>>) -> Result<ExitCode> {
    let mut console = Console::new();
    ui_loop.run_until(|event| console.handle(event), || flow.is_finished());

    let name = flow.name().to_string();
    let outcome = flow
        .outcome()
        .with_context(|| format!("{} failed", name))?;
    info!("{} finished: {:?}", name, outcome);

    let code = match outcome {
        FlowOutcome::Completed { success, message } => {
            if let Some(message) = message {
                println!("{}", message);
            }
            if success { 0 } else { 1 }
        }
        FlowOutcome::Enqueued => {
            println!("Added to the running batch");
            0
        }
        FlowOutcome::Busy => 2,
        FlowOutcome::Rejected => 3,
        FlowOutcome::Declined => 4,
        FlowOutcome::Cancelled => {
            warn!("{} was cancelled", name);
            5
        }
    };
    Ok(ExitCode::from(code))
}

fn status(api: u32, config: &ClientConfig, controller: &ServiceController) -> Result<ExitCode> {
    let bus = controller.bus();

    println!("Daemon API:        {}", api);
    println!("Daemon activity:   {}", bus.activity()?);
    println!("Queued actions:    {}", bus.action_queue_length()?);
    println!(
        "Exclusive mode:    {}",
        if bus.exclusive()? { "yes" } else { "no" }
    );
    println!(
        "Resources lock:    {}",
        if FileResourceLock::is_exclusively_held(&config.resources.lock_path) {
            "held by the daemon"
        } else {
            "free"
        }
    );

    let handles = RepositoryHandles::new(&config.resources.repositories_dir);
    match handles.repositories() {
        Ok(repositories) if repositories.is_empty() => println!("Repositories:      none"),
        Ok(repositories) => println!("Repositories:      {}", repositories.join(", ")),
        Err(e) => warn!(
            "Cannot list repositories in {}: {}",
            handles.dir().display(),
            e
        ),
    }
    Ok(ExitCode::SUCCESS)
}
