use atpneumatics::{PneumaticsServer, SimulatorConfig, SimulatorHandle};
use clap::{App, Arg};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("atpneumatics-simulator")
        .version("0.1.0")
        .about("ATPneumatics controller simulator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address to listen on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cmd-evt-port")
                .long("cmd-evt-port")
                .value_name("PORT")
                .help("Command/event port (default 5000)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("telemetry-port")
                .long("telemetry-port")
                .value_name("PORT")
                .help("Telemetry port (default 6000)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("More logging (-v debug, -vv trace)"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("🔭 ATPneumatics Simulator");
    println!("=========================");

    let mut config = match matches.value_of("config") {
        Some(path) => SimulatorConfig::load(path)?,
        None => SimulatorConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.host = host.to_owned();
    }
    config.cmd_evt_port = port_arg(matches.value_of("cmd-evt-port"), config.cmd_evt_port)?;
    config.telemetry_port = port_arg(matches.value_of("telemetry-port"), config.telemetry_port)?;
    config.validate()?;

    info!(
        "Covers close/open {}s/{}s, vents close/open {}s/{}s, telemetry every {}s",
        config.device.m1_covers_close_time,
        config.device.m1_covers_open_time,
        config.device.cell_vents_close_time,
        config.device.cell_vents_open_time,
        config.telemetry_interval
    );

    let simulator = SimulatorHandle::from_config(config.clone())?;
    let server = PneumaticsServer::bind(&config, simulator.clone()).await?;
    let server_task = server.spawn();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    server_task.abort();
    let stats = simulator.stats().await;
    info!(
        "Commands accepted {}, rejected {}, failed {}; events {}; telemetry samples {}",
        stats.commands_accepted,
        stats.commands_rejected,
        stats.commands_failed,
        stats.events_emitted,
        stats.telemetry_emitted
    );
    println!("ATPneumatics Simulator stopped");

    Ok(())
}

fn port_arg(value: Option<&str>, fallback: u16) -> Result<u16, Box<dyn std::error::Error>> {
    match value {
        Some(port) => Ok(port.parse::<u16>()?),
        None => Ok(fallback),
    }
}
