use std::env;
use std::error::Error;
use std::process;

use crate::config::Config;
use crate::input::manager::Manager;

mod config;
mod drivers;
mod fastpath;
mod hid;
mod input;
mod sync;
mod timesync;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let log_level = match env::var("LOG_LEVEL") {
        Ok(value) => value,
        Err(_) => "info".to_string(),
    };
    env::set_var("RUST_LOG", log_level);
    env_logger::init();
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    log::info!("Starting hidpath v{}", VERSION);

    // Setup CTRL+C handler
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.unwrap();
        log::info!("Shutting down");
        process::exit(0);
    });

    let config = Config::load();

    // Create the manager. Devices published by the transport layer attach
    // through the manager client.
    let mut manager = Manager::new(config);

    if let Err(err) = manager.run().await {
        log::error!("Error running input manager: {err}");
        return Err(err);
    }

    log::info!("hidpath stopped");

    Ok(())
}
