use clap::{Parser, Subcommand};
use homelink::hep::proto::Direction;
use homelink::session::SessionEvent;
use homelink_tools::{wait_ready, LinkOpts};

use chrono::{Local, TimeZone};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "hl-tool",
    version,
    about = "Controller signal inspection and control tool"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all signals announced by the controller
    List {
        #[command(flatten)]
        link: LinkOpts,
    },
    /// Print the current value of one signal
    Get {
        #[command(flatten)]
        link: LinkOpts,

        /// Full dotted signal name
        name: String,
    },
    /// Change the value of a sink signal
    Set {
        #[command(flatten)]
        link: LinkOpts,

        /// Full dotted signal name
        name: String,

        /// New value
        value: String,
    },
    /// Print session properties
    Props {
        #[command(flatten)]
        link: LinkOpts,
    },
    /// Dump the retained trace of a charted signal
    Trace {
        #[command(flatten)]
        link: LinkOpts,

        /// Full dotted signal name
        name: String,
    },
    /// Print live change events as they arrive
    Watch {
        #[command(flatten)]
        link: LinkOpts,
    },
}

/// Steady state must be reached within this long for one-shot commands.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

fn fmt_tstamp(t: i64) -> String {
    match Local.timestamp_millis_opt(t).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("@{}", t),
    }
}

fn list(opts: &LinkOpts) -> Result<(), ()> {
    let link = opts.supervisor();
    let dump = wait_ready(&link, READY_TIMEOUT)?;
    let width = dump
        .signals
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0);
    for signal in &dump.signals {
        let dir = match signal.direction {
            Direction::Source => "source",
            Direction::Sink => "sink",
        };
        println!(
            "{:<6} {:<width$}  {:<20} {}",
            dir,
            signal.name,
            signal.widget.to_string(),
            signal.value
        );
    }
    Ok(())
}

fn get(opts: &LinkOpts, name: &str) -> Result<(), ()> {
    let link = opts.supervisor();
    let dump = wait_ready(&link, READY_TIMEOUT)?;
    match dump.signals.iter().find(|s| s.name == name) {
        Some(signal) => {
            println!("{}", signal.value);
            Ok(())
        }
        None => {
            eprintln!("No such signal: {}", name);
            Err(())
        }
    }
}

fn set(opts: &LinkOpts, name: &str, value: &str) -> Result<(), ()> {
    let link = opts.supervisor();
    let dump = wait_ready(&link, READY_TIMEOUT)?;
    match dump.signals.iter().find(|s| s.name == name) {
        Some(signal) => {
            if signal.direction != Direction::Sink {
                eprintln!("Not a sink signal: {}", name);
                return Err(());
            }
        }
        None => {
            eprintln!("No such signal: {}", name);
            return Err(());
        }
    }
    // Drop events buffered during the handshake so the wait below only
    // sees the echo of this change.
    while link.events().try_recv().is_ok() {}
    link.set(name, value).map_err(|_| ())?;
    // Wait for the change to echo back as an event.
    let deadline = std::time::Instant::now() + READY_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        match link.events().recv_timeout(remaining) {
            Ok(SessionEvent::SignalChanged {
                name: n, value: v, ..
            }) if n == name => {
                println!("{} = {}", n, v);
                return Ok(());
            }
            Ok(_) => {}
            Err(_) => {
                eprintln!("No confirmation from controller");
                return Err(());
            }
        }
    }
}

fn props(opts: &LinkOpts) -> Result<(), ()> {
    let link = opts.supervisor();
    let dump = wait_ready(&link, READY_TIMEOUT)?;
    for (key, value) in &dump.props {
        println!("{}: {}", key, value);
    }
    Ok(())
}

fn trace(opts: &LinkOpts, name: &str) -> Result<(), ()> {
    let link = opts.supervisor();
    let dump = wait_ready(&link, READY_TIMEOUT)?;
    let leaf = name.rsplit('.').next().unwrap_or(name);
    for chart in &dump.charts {
        for (signal, points) in &chart.traces {
            if signal != leaf {
                continue;
            }
            for pt in points {
                println!(
                    "{} {}{}",
                    fmt_tstamp(pt.t),
                    pt.y,
                    if pt.ext { " (extrapolated)" } else { "" }
                );
            }
            return Ok(());
        }
    }
    eprintln!("No trace for signal: {}", name);
    Err(())
}

fn watch(opts: &LinkOpts) -> Result<(), ()> {
    let link = opts.supervisor();
    loop {
        let event = link.events().recv().map_err(|_| ())?;
        let now = Local::now().format("%H:%M:%S%.3f");
        match event {
            SessionEvent::SignalChanged { name, value, .. } => {
                println!("{} {} = {}", now, name, value);
            }
            SessionEvent::ConnectionChanged(up) => {
                println!("{} {}", now, if up { "connected" } else { "disconnected" });
            }
            SessionEvent::ChartDataChanged(chart) => {
                println!("{} chart {} updated", now, chart);
            }
            SessionEvent::SessionReady => {
                println!("{} session ready", now);
            }
            SessionEvent::RefreshRequested => {
                println!("{} refreshing snapshot", now);
            }
            SessionEvent::ProtocolError(e) => {
                eprintln!("{} protocol error: {:?}", now, e);
            }
            SessionEvent::ReconnectExhausted => {
                eprintln!("{} gave up reconnecting", now);
                return Err(());
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::List { link } => list(&link),
        Commands::Get { link, name } => get(&link, &name),
        Commands::Set { link, name, value } => set(&link, &name, &value),
        Commands::Props { link } => props(&link),
        Commands::Trace { link, name } => trace(&link, &name),
        Commands::Watch { link } => watch(&link),
    };

    if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        eprintln!("FAILED");
        ExitCode::FAILURE
    }
}
