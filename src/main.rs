#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;
use tokio::runtime::Builder;
use tokio::signal;

use adalight::{
    catalog::ScriptCatalog, controller::Controller, device::DeviceChannel, models::Config,
    scripts::Providers,
};

/// How long to wait for the startup script to show up in the catalog
const STARTUP_SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, StructOpt)]
struct Opts {
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u32,
    #[structopt(short, long = "config")]
    config_path: Option<PathBuf>,
    #[structopt(long)]
    dump_config: bool,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("adalight").join("config.toml"))
        .filter(|path| path.is_file())
}

async fn run(opts: Opts) -> color_eyre::eyre::Result<()> {
    // Load configuration
    let config = match opts.config_path.or_else(default_config_path) {
        Some(config_path) => {
            debug!(path = %config_path.display(), "loading configuration");
            Config::load_file(&config_path).await?
        }
        None => Config::default(),
    };

    // Dump configuration if this was asked
    if opts.dump_config {
        print!("{}", config.to_string()?);
        return Ok(());
    }

    // Open the device, the strip starts dark
    let device = Arc::new(DeviceChannel::new());
    device.set_led_count(config.device.led_count as usize)?;
    device.publish();

    match adalight::device::connect(&config.device.transport) {
        Ok(transport) => device.open(transport)?,
        Err(error) => {
            error!(error = %error, "cannot open device, frames will not be sent");
        }
    }

    // Watch the script directory
    let catalog =
        ScriptCatalog::start(config.scripts.path.clone(), Arc::new(Providers::new())).await?;

    // Start the controller
    let (controller, handle) = Controller::new(device.clone(), catalog.subscribe());
    let controller = tokio::spawn(controller.run());

    // Start the JSON server
    let json_server = if config.server.enable {
        Some(
            adalight::servers::bind(
                "JSON",
                config.server.address(),
                handle.clone(),
                adalight::servers::json::handle_client,
            )
            .await?,
        )
    } else {
        None
    };

    // Start the startup script once it is available
    if let Some(name) = config.scripts.startup.as_deref() {
        let mut scripts = catalog.subscribe();
        let available = tokio::time::timeout(
            STARTUP_SCRIPT_TIMEOUT,
            scripts.wait_for(|scripts| scripts.contains_key(name)),
        )
        .await
        .map_or(false, |result| result.is_ok());

        if available {
            if let Err(error) = handle.set_script(name, Default::default()).await {
                error!(name = %name, error = %error, "cannot start startup script");
            }
        } else {
            warn!(name = %name, "startup script not found");
        }
    }

    // Should we continue running?
    let mut abort = false;

    while !abort {
        tokio::select! {
            _ = signal::ctrl_c() => {
                abort = true;
            }
        }
    }

    info!("shutting down");

    drop(json_server);

    handle.shutdown().await?;
    if let Err(error) = controller.await {
        error!(error = %error, "controller task failed");
    }

    catalog.shutdown().await;
    device.close()?;

    Ok(())
}

fn install_tracing(opts: &Opts) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let fmt_layer = fmt::layer();

    let filter_layer = EnvFilter::try_from_env("ADALIGHT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(match opts.verbose {
            0 => "adalight=warn,adalightd=warn",
            1 => "adalight=info,adalightd=info",
            2 => "adalight=debug,adalightd=debug",
            _ => "adalight=trace,adalightd=trace",
        })
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()
}

#[paw::main]
fn main(opts: Opts) -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    install_tracing(&opts)?;

    // Create tokio runtime
    let thd_count = match num_cpus::get() {
        1 => 2,
        other => other.min(4),
    };

    let rt = Builder::new_multi_thread()
        .worker_threads(thd_count)
        .enable_all()
        .build()?;
    rt.block_on(run(opts))
}
