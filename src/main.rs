use anyhow::{Context, Result};
use zbus::blocking::Connection;

mod daemon;
mod engine;
mod hotplug;
mod inhibit;
mod presence;
mod reader;
mod registry;

use daemon::Daemon;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| "padwake".to_string());
    if args.next().is_some() {
        println!("{argv0} takes no arguments.");
        std::process::exit(1);
    }

    let conn = Connection::session().context("can't connect to D-Bus")?;
    let mut daemon = Daemon::new(&conn)?;
    daemon.run()
}
