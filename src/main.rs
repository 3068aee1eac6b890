mod autoeq;
mod bluetooth;
mod config;
mod device;
mod dispatcher;
mod protocol;
mod session;
mod shell;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bluer::Address;
use clap::Parser;
use tracing::{error, info};

use bluetooth::gatt::GattTransport;
use config::AppConfig;
use session::Session;

#[derive(Parser)]
#[command(name = "fairbuds", about = "BLE equalizer control for Fairphone Fairbuds")]
struct Cli {
    /// BLE address of the earbuds (overrides the config file)
    address: Option<String>,

    /// List AutoEQ preset files and exit
    #[arg(long)]
    presets: bool,

    /// Config file to use instead of ~/.config/fairbuds/config.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr so the shell output on stdout stays readable
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("fairbuds=info".parse()?)
        .add_directive("bluer=warn".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(cli.config.as_deref());
    let presets_dir = config.presets_dir();

    if cli.presets {
        shell::print_presets(&presets_dir);
        return Ok(());
    }

    let address = resolve_address(cli.address.as_deref(), &config)?;
    let uuids = config.gatt_uuids()?;
    let timing = config.timing();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        info!("Connecting to {}", address);
        let mut session = Session::new(GattTransport::new(uuids), address, timing);
        if let Err(e) = session.connect().await {
            error!("Connection failed: {}", e);
            println!("Could not connect to {}.", address);
            println!("Make sure the earbuds are out of the case and not connected to another device.");
            return Err(anyhow::Error::from(e));
        }
        shell::run(session, timing, presets_dir).await
    })
}

fn resolve_address(arg: Option<&str>, config: &AppConfig) -> Result<Address> {
    let Some(raw) = arg.or(config.device_address.as_deref()) else {
        bail!(
            "No device address given. Pass one on the command line or set device_address in {}",
            AppConfig::path().display()
        );
    };
    raw.parse::<Address>()
        .with_context(|| format!("Invalid Bluetooth address '{}'", raw))
}
