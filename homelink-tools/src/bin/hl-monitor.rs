// hl-monitor
//
// Live signal table for a homelink controller.
//
// Quit: q / Esc / Ctrl-C

use clap::Parser;
use homelink::hep::proto::Direction;
use homelink::session::SessionEvent;
use homelink_tools::LinkOpts;

use chrono::{DateTime, Local};
use crossbeam::channel;
use crossterm::style::{Attribute, Color, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::{cursor, event, style, terminal, ExecutableCommand, QueueableCommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "hl-monitor", version, about = "Live controller signal monitor")]
struct Cli {
    #[command(flatten)]
    link: LinkOpts,

    /// YAML file selecting and ordering the displayed signals
    #[arg(short = 'l', long = "layout")]
    layout: Option<String>,

    /// UI refresh rate
    #[arg(long, default_value_t = 10)]
    fps: u64,

    /// Highlight signals updated within this many ms
    #[arg(long = "flash-ms", default_value_t = 1000)]
    flash_ms: u64,
}

/// Optional display layout: signals listed here are shown in this order,
/// everything else is hidden.
#[derive(Debug, Deserialize)]
struct Layout {
    signals: Vec<String>,
}

struct Row {
    value: String,
    direction: Option<Direction>,
    widget: Option<String>,
    updated: Instant,
}

struct Tui {
    stdout: io::Stdout,
}

impl Tui {
    fn setup() -> io::Result<Tui> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        stdout.execute(terminal::EnterAlternateScreen)?;
        stdout.execute(cursor::Hide)?;
        Ok(Tui { stdout })
    }

    fn teardown(&mut self) {
        let _ = self.stdout.execute(cursor::Show);
        let _ = self.stdout.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
        let _ = self.stdout.flush();
    }

    fn draw(
        &mut self,
        header: &str,
        connected: bool,
        rows: &[(String, String, String, String, bool)],
    ) -> io::Result<()> {
        self.stdout.queue(cursor::MoveTo(0, 0))?;
        self.stdout
            .queue(terminal::Clear(terminal::ClearType::All))?;

        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(style::Print(header))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;

        let status = if connected {
            ("connected", Color::Green)
        } else {
            ("disconnected", Color::Red)
        };
        self.stdout.queue(SetForegroundColor(status.1))?;
        self.stdout.queue(style::Print(status.0))?;
        self.stdout.queue(ResetColor)?;
        self.stdout.queue(cursor::MoveToNextLine(2))?;

        for (dir, name, widget, value, flash) in rows {
            if *flash {
                self.stdout.queue(SetForegroundColor(Color::Yellow))?;
            }
            self.stdout.queue(style::Print(format!(
                "{:<6} {:<24} {:<20} {}",
                dir, name, widget, value
            )))?;
            if *flash {
                self.stdout.queue(ResetColor)?;
            }
            self.stdout.queue(cursor::MoveToNextLine(1))?;
        }

        self.stdout.queue(cursor::MoveToNextLine(1))?;
        self.stdout.queue(style::Print("q/Esc to quit"))?;
        self.stdout.flush()
    }
}

fn load_layout(path: &str) -> Result<Layout, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;
    serde_yaml::from_str(&text).map_err(|e| format!("{}: {}", path, e))
}

fn main() {
    let cli = Cli::parse();

    let layout = match cli.layout.as_deref().map(load_layout) {
        Some(Ok(layout)) => Some(layout),
        Some(Err(e)) => {
            eprintln!("Cannot load layout: {}", e);
            std::process::exit(1);
        }
        None => None,
    };

    let link = cli.link.supervisor();

    let mut tui = Tui::setup().expect("TUI setup failed");
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let mut t = Tui {
            stdout: io::stdout(),
        };
        t.teardown();
        original_hook(panic_info);
    }));

    // Keyboard handler
    let (key_tx, key_rx) = channel::unbounded();
    std::thread::spawn(move || loop {
        if let Ok(ev) = event::read() {
            if key_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let mut rows = HashMap::<String, Row>::new();
    let mut order = Vec::<String>::new();
    let mut connected = false;
    let mut last_ready: Option<DateTime<Local>> = None;

    let flash_dur = Duration::from_millis(cli.flash_ms.max(1));
    let tick = channel::tick(Duration::from_millis(1000 / cli.fps.max(1)));

    'main: loop {
        crossbeam::select! {
            recv(key_rx) -> ev => {
                if let Ok(event::Event::Key(k)) = ev {
                    use event::{KeyCode, KeyModifiers};
                    let quit = k.code == KeyCode::Char('q')
                             || k.code == KeyCode::Esc
                             || (k.code == KeyCode::Char('c') && k.modifiers == KeyModifiers::CONTROL);
                    if quit { break 'main; }
                }
            }

            recv(link.events()) -> ev => {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(_) => break 'main,
                };
                match ev {
                    SessionEvent::SignalChanged { name, value, direction, widget } => {
                        match rows.get_mut(&name) {
                            Some(row) => {
                                row.value = value;
                                if direction.is_some() {
                                    row.direction = direction;
                                }
                                if let Some(w) = widget {
                                    row.widget = Some(w.to_string());
                                }
                                row.updated = Instant::now();
                            }
                            None => {
                                order.push(name.clone());
                                rows.insert(name, Row {
                                    value,
                                    direction,
                                    widget: widget.map(|w| w.to_string()),
                                    updated: Instant::now(),
                                });
                            }
                        }
                    }
                    SessionEvent::SessionReady => {
                        rows.clear();
                        order.clear();
                        last_ready = Some(Local::now());
                    }
                    SessionEvent::ConnectionChanged(up) => {
                        connected = up;
                    }
                    SessionEvent::ReconnectExhausted => {
                        break 'main;
                    }
                    _ => {}
                }
            }

            recv(tick) -> _ => {
                let now = Instant::now();
                let shown: Vec<&String> = match &layout {
                    Some(layout) => layout.signals.iter()
                        .filter(|name| rows.contains_key(*name))
                        .collect(),
                    None => order.iter().collect(),
                };
                let table: Vec<(String, String, String, String, bool)> = shown
                    .iter()
                    .map(|name| {
                        let row = &rows[*name];
                        let dir = match row.direction {
                            Some(Direction::Source) => "source",
                            Some(Direction::Sink) => "sink",
                            None => "?",
                        };
                        (
                            dir.to_string(),
                            (*name).clone(),
                            row.widget.clone().unwrap_or_default(),
                            row.value.clone(),
                            now.duration_since(row.updated) < flash_dur,
                        )
                    })
                    .collect();
                let header = format!(
                    "hl-monitor — {}  session: {}",
                    cli.link.root,
                    match last_ready {
                        Some(at) => at.format("%H:%M:%S").to_string(),
                        None => "-".to_string(),
                    }
                );
                if tui.draw(&header, connected, &table).is_err() {
                    break 'main;
                }
            }
        }
    }

    tui.teardown();
}
