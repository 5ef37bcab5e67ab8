//! Line grammar for the home events protocol.
//!
//! The protocol is UTF-8 text, one record per `\n`-terminated line. The
//! meaning of a line depends on the session phase (see `crate::session`);
//! this module only knows how to take a line apart and how to put outbound
//! commands back together.

use std::fmt::{Display, Formatter};

/// Direction of a signal relative to the remote controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Driven by the remote system.
    Source,
    /// Settable by this client.
    Sink,
}

impl Direction {
    pub fn from_wire(word: &str) -> Option<Direction> {
        match word {
            "source" => Some(Direction::Source),
            "sink" => Some(Direction::Sink),
            _ => None,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Source => write!(f, "source"),
            Direction::Sink => write!(f, "sink"),
        }
    }
}

/// A single `key=value` display option of a widget descriptor.
/// A bare flag without `=` keeps an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetOption {
    pub key: String,
    pub value: String,
}

fn parse_options(raw: &str) -> Vec<WidgetOption> {
    raw.split(',')
        .filter(|opt| !opt.is_empty())
        .map(|opt| match opt.split_once('=') {
            Some((key, value)) => WidgetOption {
                key: key.to_string(),
                value: value.to_string(),
            },
            None => WidgetOption {
                key: opt.to_string(),
                value: String::new(),
            },
        })
        .collect()
}

fn fmt_options(f: &mut Formatter<'_>, options: &[WidgetOption]) -> std::fmt::Result {
    for (i, opt) in options.iter().enumerate() {
        write!(f, "{}{}", if i == 0 { ":" } else { "," }, opt.key)?;
        if !opt.value.is_empty() {
            write!(f, "={}", opt.value)?;
        }
    }
    Ok(())
}

/// Display-widget descriptor attached to a signal. Parsed once at
/// ingestion; descriptors we do not recognize are kept verbatim so they
/// survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Widget {
    Led { style: String },
    SwitchSlide,
    SwitchPush,
    Meter { options: Vec<WidgetOption> },
    Slider { options: Vec<WidgetOption> },
    Unknown(String),
}

impl Widget {
    pub fn from_wire(word: &str) -> Widget {
        if let Some(style) = word.strip_prefix("led-") {
            return Widget::Led {
                style: style.to_string(),
            };
        }
        match word.split_once(':') {
            Some(("meter", opts)) => Widget::Meter {
                options: parse_options(opts),
            },
            Some(("slider", opts)) => Widget::Slider {
                options: parse_options(opts),
            },
            None if word == "meter" => Widget::Meter { options: vec![] },
            None if word == "slider" => Widget::Slider { options: vec![] },
            None if word == "switch-slide" => Widget::SwitchSlide,
            None if word == "switch-push" => Widget::SwitchPush,
            _ => Widget::Unknown(word.to_string()),
        }
    }
}

impl Display for Widget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Widget::Led { style } => write!(f, "led-{}", style),
            Widget::SwitchSlide => write!(f, "switch-slide"),
            Widget::SwitchPush => write!(f, "switch-push"),
            Widget::Meter { options } => {
                write!(f, "meter")?;
                fmt_options(f, options)
            }
            Widget::Slider { options } => {
                write!(f, "slider")?;
                fmt_options(f, options)
            }
            Widget::Unknown(word) => write!(f, "{}", word),
        }
    }
}

/// Chart membership of a signal: chart name plus optional secondary-axis
/// label, encoded on the wire as `<chart>[/<axis>]` (or `-` for none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSpec {
    pub chart: String,
    pub axis: Option<String>,
}

impl ChartSpec {
    /// Parses a chart-spec field. `-` means the signal belongs to no chart.
    pub fn from_wire(field: &str) -> Option<ChartSpec> {
        if field == "-" {
            return None;
        }
        match field.split_once('/') {
            Some((chart, axis)) => Some(ChartSpec {
                chart: chart.to_string(),
                axis: Some(axis.to_string()),
            }),
            None => Some(ChartSpec {
                chart: field.to_string(),
                axis: None,
            }),
        }
    }
}

/// One line of a bulk snapshot:
/// `<dir> <widget> <chart-spec> <name> <value...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub direction: Direction,
    pub widget: Widget,
    pub chart: Option<ChartSpec>,
    pub name: String,
    pub value: String,
}

/// One sample of a trace-replay line, still relative to the session epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSample {
    pub offset: i64,
    pub value: String,
    /// Set when the offset carried a `+` prefix: the controller emitted this
    /// point purely to extend the trace to its dump time, it is not a real
    /// sample.
    pub ext: bool,
}

/// One line of a trace replay: `<name> <offset>,<value> ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub name: String,
    pub samples: Vec<TraceSample>,
}

/// A steady-state change event, `!<tick>,<name>=<value>` or
/// `!<name>=<value>` (leading `!` already stripped by the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Relative tick of the change. Absent means registry-only update.
    pub tick: Option<i64>,
    pub name: String,
    pub value: String,
}

/// Problems taking a line apart. All of these are recoverable: the line is
/// dropped and reported, the session state never changes because of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Line is missing mandatory fields for its phase.
    TruncatedRecord(String),
    /// First snapshot field is neither `source` nor `sink`.
    BadDirection(String),
    /// A trace sample did not parse as `<offset>,<value>`.
    BadTraceSample(String),
    /// An event line without `name=value` shape.
    BadEvent(String),
    /// Line cannot mean anything in the current session state.
    UnexpectedLine(String),
    /// Error text reported by the controller (`.ERROR: ...`).
    ServerError(String),
    /// Trace data arrived before the session epoch was known.
    MissingTimeBase(String),
}

/// Parses a session-property line, `<key>: <value>`.
pub fn parse_prop(line: &str) -> Result<(String, String), Error> {
    match line.split_once(':') {
        Some((key, value)) => Ok((key.trim().to_string(), value.trim().to_string())),
        None => Err(Error::TruncatedRecord(line.to_string())),
    }
}

/// Parses a bulk-snapshot record line.
pub fn parse_snapshot(line: &str) -> Result<SnapshotRecord, Error> {
    let mut fields = line.splitn(5, ' ');
    let dir = fields.next().unwrap_or("");
    let widget = match fields.next() {
        Some(w) => w,
        None => return Err(Error::TruncatedRecord(line.to_string())),
    };
    let chart = match fields.next() {
        Some(c) => c,
        None => return Err(Error::TruncatedRecord(line.to_string())),
    };
    let name = match fields.next() {
        Some(n) if !n.is_empty() => n,
        _ => return Err(Error::TruncatedRecord(line.to_string())),
    };
    let direction = match Direction::from_wire(dir) {
        Some(d) => d,
        None => return Err(Error::BadDirection(line.to_string())),
    };
    Ok(SnapshotRecord {
        direction,
        widget: Widget::from_wire(widget),
        chart: ChartSpec::from_wire(chart),
        name: name.to_string(),
        value: fields.next().unwrap_or("").trim().to_string(),
    })
}

/// Parses a trace-replay line.
pub fn parse_trace(line: &str) -> Result<TraceRecord, Error> {
    let mut fields = line.split_whitespace();
    let name = match fields.next() {
        Some(n) => n.to_string(),
        None => return Err(Error::TruncatedRecord(line.to_string())),
    };
    let mut samples = Vec::new();
    for field in fields {
        let (raw_offset, ext) = match field.strip_prefix('+') {
            Some(rest) => (rest, true),
            None => (field, false),
        };
        let (offset, value) = match raw_offset.split_once(',') {
            Some((o, v)) => (o, v),
            None => return Err(Error::BadTraceSample(line.to_string())),
        };
        let offset = match offset.parse::<i64>() {
            Ok(o) => o,
            Err(_) => return Err(Error::BadTraceSample(line.to_string())),
        };
        samples.push(TraceSample {
            offset,
            value: value.to_string(),
            ext,
        });
    }
    Ok(TraceRecord { name, samples })
}

/// Parses a steady-state event (without the leading `!`).
pub fn parse_event(body: &str) -> Result<EventRecord, Error> {
    let (spec, value) = match body.split_once('=') {
        Some((s, v)) => (s, v),
        None => return Err(Error::BadEvent(body.to_string())),
    };
    // A numeric prefix before the first comma is the chart tick; anything
    // else is part of the signal name.
    let (tick, name) = match spec.split_once(',') {
        Some((prefix, rest)) => match prefix.parse::<i64>() {
            Ok(t) => (Some(t), rest),
            Err(_) => (None, spec),
        },
        None => (None, spec),
    };
    if name.is_empty() {
        return Err(Error::BadEvent(body.to_string()));
    }
    Ok(EventRecord {
        tick,
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Outbound command, rendered to its wire form by `Display`. The `\n`
/// terminator is appended by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Request session properties.
    Props,
    /// Request a full (or single-signal) snapshot.
    Get(Option<String>),
    /// Request historical trace replay.
    Trace,
    /// Request a sink signal change.
    Set { name: String, value: String },
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Props => write!(f, "props"),
            Command::Get(None) => write!(f, "get"),
            Command::Get(Some(name)) => write!(f, "get {}", name),
            Command::Trace => write!(f, "trace"),
            Command::Set { name, value } => write!(f, "set {}=\"{}\"", name, value),
        }
    }
}

/// Returns the last dot-separated segment of a signal spec, used for chart
/// lookups (registry lookups always use the full spec).
pub fn leaf_name(spec: &str) -> &str {
    spec.rsplit('.').next().unwrap_or(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_wire_words() {
        assert_eq!(Direction::from_wire("source"), Some(Direction::Source));
        assert_eq!(Direction::from_wire("sink"), Some(Direction::Sink));
        assert_eq!(Direction::from_wire("Source"), None);
    }

    #[test]
    fn widget_parses_closed_variants() {
        assert_eq!(
            Widget::from_wire("led-red"),
            Widget::Led {
                style: "red".to_string()
            }
        );
        assert_eq!(Widget::from_wire("switch-slide"), Widget::SwitchSlide);
        assert_eq!(Widget::from_wire("switch-push"), Widget::SwitchPush);
        assert_eq!(
            Widget::from_wire("meter:min=0,max=100"),
            Widget::Meter {
                options: vec![
                    WidgetOption {
                        key: "min".to_string(),
                        value: "0".to_string()
                    },
                    WidgetOption {
                        key: "max".to_string(),
                        value: "100".to_string()
                    },
                ]
            }
        );
        assert_eq!(Widget::from_wire("slider"), Widget::Slider { options: vec![] });
        assert_eq!(
            Widget::from_wire("gauge"),
            Widget::Unknown("gauge".to_string())
        );
    }

    #[test]
    fn widget_round_trips_to_wire_form() {
        for wire in ["led-green", "switch-push", "meter:min=0,max=100", "slider:step=5", "dial"] {
            assert_eq!(Widget::from_wire(wire).to_string(), wire);
        }
    }

    #[test]
    fn chart_spec_splits_axis() {
        assert_eq!(ChartSpec::from_wire("-"), None);
        assert_eq!(
            ChartSpec::from_wire("climate"),
            Some(ChartSpec {
                chart: "climate".to_string(),
                axis: None
            })
        );
        assert_eq!(
            ChartSpec::from_wire("climate/humidity"),
            Some(ChartSpec {
                chart: "climate".to_string(),
                axis: Some("humidity".to_string())
            })
        );
    }

    #[test]
    fn snapshot_record_keeps_value_remainder() {
        let rec = parse_snapshot("source led-red living living.light on and bright").unwrap();
        assert_eq!(rec.direction, Direction::Source);
        assert_eq!(rec.name, "living.light");
        assert_eq!(rec.value, "on and bright");
    }

    #[test]
    fn snapshot_record_value_may_be_empty() {
        let rec = parse_snapshot("sink switch-push - hall.button").unwrap();
        assert_eq!(rec.value, "");
        assert!(rec.chart.is_none());
    }

    #[test]
    fn snapshot_record_rejects_short_lines() {
        assert!(matches!(
            parse_snapshot("source led-red living"),
            Err(Error::TruncatedRecord(_))
        ));
        assert!(matches!(
            parse_snapshot("north led-red - x 1"),
            Err(Error::BadDirection(_))
        ));
    }

    #[test]
    fn trace_record_marks_plus_offsets_extrapolated() {
        let rec = parse_trace("temp 0,20.5 +120,21.0").unwrap();
        assert_eq!(rec.name, "temp");
        assert_eq!(
            rec.samples,
            vec![
                TraceSample {
                    offset: 0,
                    value: "20.5".to_string(),
                    ext: false
                },
                TraceSample {
                    offset: 120,
                    value: "21.0".to_string(),
                    ext: true
                },
            ]
        );
    }

    #[test]
    fn trace_record_rejects_malformed_samples() {
        assert!(matches!(
            parse_trace("temp 0:20.5"),
            Err(Error::BadTraceSample(_))
        ));
        assert!(matches!(
            parse_trace("temp x,1"),
            Err(Error::BadTraceSample(_))
        ));
    }

    #[test]
    fn event_with_and_without_tick() {
        assert_eq!(
            parse_event("1500,living.light=0").unwrap(),
            EventRecord {
                tick: Some(1500),
                name: "living.light".to_string(),
                value: "0".to_string()
            }
        );
        assert_eq!(
            parse_event("living.light=0").unwrap(),
            EventRecord {
                tick: None,
                name: "living.light".to_string(),
                value: "0".to_string()
            }
        );
        assert!(matches!(parse_event("living.light"), Err(Error::BadEvent(_))));
    }

    #[test]
    fn commands_render_wire_strings() {
        assert_eq!(Command::Props.to_string(), "props");
        assert_eq!(Command::Get(None).to_string(), "get");
        assert_eq!(
            Command::Get(Some("temp".to_string())).to_string(),
            "get temp"
        );
        assert_eq!(Command::Trace.to_string(), "trace");
        assert_eq!(
            Command::Set {
                name: "living.light".to_string(),
                value: "1".to_string()
            }
            .to_string(),
            "set living.light=\"1\""
        );
    }

    #[test]
    fn leaf_name_strips_tile_prefix() {
        assert_eq!(leaf_name("living.light"), "light");
        assert_eq!(leaf_name("temp"), "temp");
    }
}
