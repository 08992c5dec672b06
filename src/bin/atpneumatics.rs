use atpneumatics::protocol::{Ack, Command, CommandResponse, KEY_SEQUENCE_ID, KEY_VALUE};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "5000";
const DEFAULT_TELEMETRY_PORT: &str = "6000";
const DEFAULT_TIMEOUT_SECS: &str = "60";

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Everything the simulator sent back for one command.
struct Exchange {
    sequence_id: i64,
    /// Terminal (or NOACK) response.
    outcome: Ack,
    /// Events that arrived after the command was acknowledged.
    events: Vec<Value>,
    /// Every message received after the command was sent, in order.
    transcript: Vec<Value>,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("atpneumatics")
        .version("0.1.0")
        .author("Telescope and Site Software Team")
        .about("🔭 ATPneumatics simulator client")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Command/event port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("telemetry-port")
                .short("t")
                .long("telemetry-port")
                .value_name("PORT")
                .help("Telemetry port")
                .takes_value(true)
                .default_value(DEFAULT_TELEMETRY_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("How long to wait for a command to finish")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_SECS)
                .global(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Timeout must be a whole number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("cover")
                .about("🪞 Open or close the M1 mirror covers")
                .arg(direction_arg()),
        )
        .subcommand(
            SubCommand::with_name("vents")
                .about("🌬️  Open or close the M1 cell vents")
                .arg(direction_arg()),
        )
        .subcommand(
            SubCommand::with_name("valve")
                .about("🔧 Open or close an air valve")
                .arg(
                    Arg::with_name("valve")
                        .help("Valve to move")
                        .required(true)
                        .possible_values(&["instrument", "m1", "m2", "main"]),
                )
                .arg(direction_arg()),
        )
        .subcommand(
            SubCommand::with_name("pressure")
                .about("📈 Set an air line pressure")
                .arg(
                    Arg::with_name("line")
                        .help("Air line")
                        .required(true)
                        .possible_values(&["m1", "m2"]),
                )
                .arg(
                    Arg::with_name("pascals")
                        .help("Pressure in Pa")
                        .required(true)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(p) if p.is_finite() => Ok(()),
                            _ => Err("Pressure must be a number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("lifecycle")
                .about("🔁 Send a lifecycle command")
                .arg(
                    Arg::with_name("transition")
                        .help("Lifecycle command")
                        .required(true)
                        .possible_values(&["start", "enable", "disable", "standby", "exit-control"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("events")
                .about("📣 Stream events from the command/event port (Ctrl+C to stop)"),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📡 Stream telemetry (Ctrl+C to stop)"),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let telemetry_port = matches
        .value_of("telemetry-port")
        .unwrap_or(DEFAULT_TELEMETRY_PORT)
        .parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let timeout = Duration::from_secs(
        matches
            .value_of("timeout")
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .parse::<u64>()?,
    );
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "🔭 ATPneumatics client".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let command = match matches.subcommand() {
        ("events", _) => return stream_events(host, port, format).await,
        ("monitor", _) => return monitor_telemetry(host, telemetry_port, format).await,
        (name, Some(sub_matches)) => build_command(name, sub_matches)?,
        _ => return Err("No command specified. Use --help for usage information.".into()),
    };

    if verbose {
        println!("{} {}", "Sending".dimmed(), command.wire_id());
    }
    if command.is_timed() && format == "table" {
        println!(
            "{} {} waits for the actuator (up to {:?})",
            "⏳".yellow(),
            command.name().bright_white(),
            timeout
        );
    }
    let exchange = send_command(host, port, &command, timeout).await?;
    print_exchange(&command, &exchange, format, verbose);

    if exchange.outcome == Ack::Success {
        Ok(())
    } else {
        Err(format!("{} ended with {:?}", command.name(), exchange.outcome).into())
    }
}

fn direction_arg() -> Arg<'static, 'static> {
    Arg::with_name("direction")
        .help("Direction to move")
        .required(true)
        .possible_values(&["open", "close"])
}

fn build_command(name: &str, matches: &ArgMatches<'_>) -> CliResult<Command> {
    let opening = matches.value_of("direction") == Some("open");
    let command = match name {
        "cover" if opening => Command::OpenM1Cover,
        "cover" => Command::CloseM1Cover,
        "vents" if opening => Command::OpenM1CellVents,
        "vents" => Command::CloseM1CellVents,
        "valve" => match (matches.value_of("valve"), opening) {
            (Some("instrument"), true) => Command::OpenInstrumentAirValve,
            (Some("instrument"), false) => Command::CloseInstrumentAirValve,
            (Some("m1"), true) => Command::M1OpenAirValve,
            (Some("m1"), false) => Command::M1CloseAirValve,
            (Some("m2"), true) => Command::M2OpenAirValve,
            (Some("m2"), false) => Command::M2CloseAirValve,
            (Some("main"), true) => Command::OpenMasterAirSupply,
            (Some("main"), false) => Command::CloseMasterAirSupply,
            (other, _) => return Err(format!("Unknown valve {:?}", other).into()),
        },
        "pressure" => {
            let pressure = matches.value_of("pascals").unwrap_or_default().parse::<f64>()?;
            match matches.value_of("line") {
                Some("m2") => Command::M2SetPressure { pressure },
                _ => Command::M1SetPressure { pressure },
            }
        }
        "lifecycle" => match matches.value_of("transition") {
            Some("start") => Command::Start,
            Some("enable") => Command::Enable,
            Some("disable") => Command::Disable,
            Some("standby") => Command::Standby,
            Some("exit-control") => Command::ExitControl,
            other => return Err(format!("Unknown lifecycle command {:?}", other).into()),
        },
        other => return Err(format!("Unknown subcommand {}", other).into()),
    };
    Ok(command)
}

/// Each connection starts a fresh sequence, so the command goes out as
/// sequence id 1.
async fn send_command(
    host: &str,
    port: u16,
    command: &Command,
    timeout: Duration,
) -> CliResult<Exchange> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "atpneumatics-simulator".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let sequence_id = 1;
    let mut payload = serde_json::to_value(command)?;
    if let Some(object) = payload.as_object_mut() {
        object.insert(KEY_SEQUENCE_ID.to_owned(), Value::from(sequence_id));
        object.insert(KEY_VALUE.to_owned(), Value::Bool(true));
    }

    let (reader, mut writer) = stream.into_split();
    writer.write_all(payload.to_string().as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    match tokio::time::timeout(timeout, read_exchange(&mut lines, sequence_id)).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} Command timed out after {:?}", "⏰".yellow(), timeout);
            Err("Command timeout".into())
        }
    }
}

/// Read until the command's terminal response. Events only count once the
/// command has been acknowledged; earlier ones describe the connect-time
/// state.
async fn read_exchange(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    sequence_id: i64,
) -> CliResult<Exchange> {
    let mut acked = false;
    let mut events = Vec::new();
    let mut transcript = Vec::new();

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if let Ok(response) = serde_json::from_value::<CommandResponse>(message.clone()) {
            transcript.push(message);
            if response.sequence_id != sequence_id {
                continue;
            }
            match response.id {
                Ack::Ack => acked = true,
                outcome => {
                    return Ok(Exchange {
                        sequence_id,
                        outcome,
                        events,
                        transcript,
                    })
                }
            }
        } else if acked {
            transcript.push(message.clone());
            events.push(message);
        }
    }
    Err("Server closed connection".into())
}

fn print_exchange(command: &Command, exchange: &Exchange, format: &str, verbose: bool) {
    match format {
        "json" => {
            for message in &exchange.transcript {
                println!("{}", message);
            }
        }
        "compact" => {
            let label = match exchange.outcome {
                Ack::Success => "OK".bright_green(),
                Ack::Fail => "FAILED".bright_red(),
                Ack::Noack => "REJECTED".bright_red(),
                Ack::Ack => "PENDING".yellow(),
            };
            println!("{} {}", command.name(), label);
        }
        _ => {
            for event in &exchange.events {
                println!("  {} {}", "•".bright_blue(), format_event(event));
            }
            match exchange.outcome {
                Ack::Success => println!(
                    "{} {} completed",
                    "✅".green(),
                    command.name().bright_white()
                ),
                Ack::Fail => println!(
                    "{} {} failed in the simulator",
                    "⚠️".yellow(),
                    command.name().bright_white()
                ),
                Ack::Noack => println!(
                    "{} {} was rejected",
                    "❌".red(),
                    command.name().bright_white()
                ),
                Ack::Ack => println!("{} {} still running", "⏳".yellow(), command.name()),
            }
            if verbose {
                println!("{} sequence id {}", "ℹ️".dimmed(), exchange.sequence_id);
            }
        }
    }
}

fn format_event(event: &Value) -> String {
    let id = event["id"].as_str().unwrap_or("?");
    let fields: Vec<String> = event
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter(|(key, _)| key.as_str() != "id")
                .map(|(key, value)| format!("{}={}", key, value))
                .collect()
        })
        .unwrap_or_default();
    format!("{} {}", id.bright_white(), fields.join(" ").bright_cyan())
}

async fn stream_events(host: &str, port: u16, format: &str) -> CliResult<()> {
    println!("{}", "📣 Streaming events (Press Ctrl+C to stop)...".bright_blue().bold());
    let stream = TcpStream::connect((host, port)).await?;
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await? {
        match format {
            "json" => println!("{}", line),
            _ => {
                if let Ok(event) = serde_json::from_str::<Value>(&line) {
                    println!("{}", format_event(&event));
                }
            }
        }
    }
    Ok(())
}

async fn monitor_telemetry(host: &str, port: u16, format: &str) -> CliResult<()> {
    println!("{}", "📡 Monitoring telemetry (Press Ctrl+C to stop)...".bright_blue().bold());
    let stream = TcpStream::connect((host, port)).await?;
    let mut lines = BufReader::new(stream).lines();

    if format == "table" {
        println!("{}", "┌──────────────────────────┬──────────────┐".bright_white());
        println!("{}", "│ Telemetry                │        Value │".bright_white());
        println!("{}", "├──────────────────────────┼──────────────┤".bright_white());
    }

    while let Some(line) = lines.next_line().await? {
        let Ok(sample) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = sample["id"].as_str().unwrap_or("?");
        let value = sample
            .get("pressure")
            .or_else(|| sample.get("cellLoad"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        match format {
            "json" => println!("{}", line),
            "compact" => println!("{}={}", id, value),
            _ => {
                let value_str = if value > 0.0 {
                    format!("{:>12.2}", value).green()
                } else {
                    format!("{:>12.2}", value).yellow()
                };
                println!("│ {:<24} │ {} │", id, value_str);
            }
        }
    }
    Ok(())
}
