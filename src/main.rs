//! Command-line client for iRobot Roomba vacuums on the local network.
//!
//! Usage:
//!   roomba-client discover --broadcast 192.168.1.255
//!   roomba-client --host 192.168.1.20 --blid 3115850251687850 --password ... start
//!   roomba-client -c /etc/roomba-client.conf watch --schedule

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use roomba_client::config::{self, ClientConfig};
use roomba_client::credential::retrieve_credential;
use roomba_client::state::parse_schedule;
use roomba_client::tls::RobotConnector;
use roomba_client::{Command, Discovery, RoombaClient, ScheduleEntry, WeeklySchedule, WifiSecurity};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "roomba-client", about = "Local control client for iRobot Roomba vacuums")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log to stderr even if the config asks for syslog.
    #[arg(long)]
    stderr: bool,

    /// Robot address (overrides `host`).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Robot BLID (overrides `blid`).
    #[arg(long, global = true)]
    blid: Option<String>,

    /// Robot MQTT password (overrides `password`).
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Broadcast for robots and print each one with its password.
    Discover {
        #[arg(long)]
        broadcast: Option<IpAddr>,
        /// Listening time in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Fetch the MQTT password from one robot (HOME held until it beeps).
    Password {
        address: IpAddr,
    },
    Start,
    Stop,
    Pause,
    Resume,
    Dock,
    /// Set the robot clock; defaults to the local clock.
    SetTime {
        #[arg(long, requires = "offset")]
        utc: Option<i64>,
        /// Local minus UTC, in minutes.
        #[arg(long, requires = "utc", allow_hyphen_values = true)]
        offset: Option<i32>,
    },
    /// Move the robot to another access point.
    SetWifi {
        #[arg(long)]
        ssid: String,
        #[arg(long = "wifi-pass")]
        wifi_pass: String,
        /// none, wep-open, wep-shared, wpa, wpa2, wpa-wpa2, eap-tls, wildcard
        #[arg(long, default_value = "wpa2")]
        sec: WifiSecurity,
    },
    /// Seven `<start|none>@HH:MM` entries, Sunday first.
    SetSchedule {
        #[arg(num_args = 7, required = true)]
        days: Vec<ScheduleEntry>,
    },
    /// Print telemetry as it arrives.
    Watch {
        /// Stop after this many seconds (default: run until Ctrl-C).
        #[arg(long)]
        seconds: Option<u64>,
        /// Only print schedule reports.
        #[arg(long)]
        schedule: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("roomba-client: config error: {e}");
                process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };
    let cfg = apply_overrides(cfg, &cli);
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("roomba-client: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog) {
        eprintln!("roomba-client: logging: {e}");
        process::exit(1);
    }

    if let Err(e) = run(cli.action, cfg).await {
        error!("{e:#}");
        process::exit(1);
    }
}

fn apply_overrides(cfg: ClientConfig, cli: &Cli) -> ClientConfig {
    ClientConfig {
        host:     cli.host.clone().unwrap_or(cfg.host.clone()),
        blid:     cli.blid.clone().unwrap_or(cfg.blid.clone()),
        password: cli.password.clone().unwrap_or(cfg.password.clone()),
        ..cfg
    }
}

async fn run(action: Action, cfg: ClientConfig) -> anyhow::Result<()> {
    match action {
        Action::Discover { broadcast, timeout } => {
            let mut cfg = cfg;
            if let Some(t) = timeout {
                cfg.discovery_timeout = t;
            }
            let broadcast = broadcast.unwrap_or(cfg.broadcast_address);
            discover(&cfg, broadcast).await
        }
        Action::Password { address } => {
            let connector = RobotConnector::new()?;
            let password = retrieve_credential(&connector, address, &cfg.retriever_options())
                .await
                .with_context(|| format!("retrieving password from {address}"))?;
            if password.is_empty() {
                warn!("{address} returned no password; is the robot in pairing mode?");
            }
            println!("{password}");
            Ok(())
        }
        Action::Start  => command(&cfg, Command::Start).await,
        Action::Stop   => command(&cfg, Command::Stop).await,
        Action::Pause  => command(&cfg, Command::Pause).await,
        Action::Resume => command(&cfg, Command::Resume).await,
        Action::Dock   => command(&cfg, Command::Dock).await,
        Action::SetTime { utc, offset } => {
            let client = connect(&cfg).await?;
            match (utc, offset) {
                (Some(utc), Some(offset)) => client.set_time(utc, offset).await?,
                _ => client.set_current_time().await?,
            }
            client.disconnect().await?;
            Ok(())
        }
        Action::SetWifi { ssid, wifi_pass, sec } => {
            let client = connect(&cfg).await?;
            client.set_wifi(&ssid, &wifi_pass, sec).await?;
            info!("wifi settings sent; press START on the robot to apply");
            client.disconnect().await?;
            Ok(())
        }
        Action::SetSchedule { days } => {
            let schedule = WeeklySchedule::new(&days)?;
            let client = connect(&cfg).await?;
            client.set_schedule(&schedule).await?;
            client.disconnect().await?;
            Ok(())
        }
        Action::Watch { seconds, schedule } => watch(&cfg, seconds, schedule).await,
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn discover(cfg: &ClientConfig, broadcast: IpAddr) -> anyhow::Result<()> {
    let discovery = Discovery::new(cfg.discovery_options())?;
    info!(
        "discovering robots via {broadcast} for {}s",
        discovery.options().timeout.as_secs()
    );
    let roster = discovery.run(broadcast).await.context("discovery failed")?;
    for robot in &roster {
        let label = robot.reply().robotname.as_deref().unwrap_or("-");
        println!("{}\t{}\t{}\t{}", robot.host(), robot.name(), label, robot.credential());
    }
    if roster.is_empty() {
        warn!("no robots answered");
    }
    Ok(())
}

async fn connect(cfg: &ClientConfig) -> anyhow::Result<RoombaClient<roomba_client::MqttTransport>> {
    config::validate_session(cfg)?;
    let client = RoombaClient::connect(&cfg.session_options())
        .await
        .with_context(|| format!("connecting to {}", cfg.host))?;
    Ok(client)
}

async fn command(cfg: &ClientConfig, cmd: Command) -> anyhow::Result<()> {
    let client = connect(cfg).await?;
    client.execute(cmd).await.with_context(|| format!("sending {cmd}"))?;
    info!("{cmd} sent to {}", cfg.host);
    client.disconnect().await?;
    Ok(())
}

async fn watch(cfg: &ClientConfig, seconds: Option<u64>, schedule_only: bool) -> anyhow::Result<()> {
    let client = connect(cfg).await?;
    client.on_message(move |msg| {
        if schedule_only {
            if let Ok(view) = parse_schedule(&msg.text) {
                println!("cycle={:?} h={:?} m={:?}", view.cycle, view.h, view.m);
            }
            return;
        }
        match msg.snapshot.as_ref().and_then(|s| s.reported()) {
            Some(r) => {
                let phase = r
                    .clean_mission_status
                    .as_ref()
                    .and_then(|m| m.phase.as_deref())
                    .unwrap_or("-");
                match r.bat_pct {
                    Some(pct) => println!("{}: battery={pct}% phase={phase}", msg.topic),
                    None => println!("{}: {}", msg.topic, msg.text),
                }
            }
            None => println!("{}: {}", msg.topic, msg.text),
        }
    });

    match seconds {
        Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
        None => tokio::signal::ctrl_c().await?,
    }
    client.disconnect().await?;
    Ok(())
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "roomba-client".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .init();
    }
    Ok(())
}
