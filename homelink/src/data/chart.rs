//! Chart buffers.
//!
//! Per-chart ordered time series, one trace per member signal. Traces in
//! a shared chart update at different times, so live appends run an
//! alignment pass keeping every trace clipped to a common start and
//! extended to the newest timestamp with synthetic trailing points. Chart
//! membership uses leaf signal names (the last dot segment of the full
//! spec), which is also how trace replay lines address signals.

use crate::hep::proto::{leaf_name, ChartSpec};
use std::collections::{HashMap, VecDeque};

/// Retained points per trace when the session properties do not say.
pub const DEFAULT_TRACE_DEPTH: usize = 500;

/// Trace colors assigned to signals in rank order at chart initialization.
const PALETTE: [&str; 9] = [
    "#4dc9f6", "#f67019", "#f53794", "#537bc4", "#acc236", "#166a8f", "#00a950", "#58595b",
    "#8549ba",
];

/// One sample of a trace, on the absolute session clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePoint {
    pub t: i64,
    pub y: String,
    /// Synthetic point inserted for cross-trace alignment, or an anchor
    /// the controller marked as extrapolated in a replay. At most one
    /// trailing extrapolated point exists per trace.
    pub ext: bool,
}

/// A signal's membership in a chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSignal {
    /// Leaf signal name.
    pub name: String,
    /// Assigned at initialization, from the palette in rank order.
    pub color: Option<String>,
    /// Secondary axis label, if any.
    pub axis: Option<String>,
    pub rank: usize,
}

/// A named chart and its member signals in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    pub name: String,
    pub signals: Vec<ChartSignal>,
}

/// Time series of one chart signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    /// Index of the owning chart in `ChartSet::charts`.
    chart: usize,
    pub points: VecDeque<TracePoint>,
}

/// All charts of a session, plus the traces keyed by leaf signal name.
pub struct ChartSet {
    charts: Vec<Chart>,
    index: HashMap<String, usize>,
    traces: HashMap<String, Trace>,
    depth: usize,
}

impl ChartSet {
    pub fn new() -> ChartSet {
        ChartSet {
            charts: Vec::new(),
            index: HashMap::new(),
            traces: HashMap::new(),
            depth: DEFAULT_TRACE_DEPTH,
        }
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn trace(&self, signal_spec: &str) -> Option<&Trace> {
        self.traces.get(leaf_name(signal_spec))
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Forgets all charts and traces, for a session restart.
    pub fn clear(&mut self) {
        self.charts.clear();
        self.index.clear();
        self.traces.clear();
    }

    /// Registers a signal with a chart, creating the chart lazily. A leaf
    /// name already present in the chart is ignored.
    pub fn add_signal(&mut self, spec: &ChartSpec, signal_spec: &str) {
        let chart_idx = match self.index.get(&spec.chart) {
            Some(&i) => i,
            None => {
                self.index.insert(spec.chart.clone(), self.charts.len());
                self.charts.push(Chart {
                    name: spec.chart.clone(),
                    signals: Vec::new(),
                });
                self.charts.len() - 1
            }
        };
        let name = leaf_name(signal_spec);
        let chart = &mut self.charts[chart_idx];
        if chart.signals.iter().any(|s| s.name == name) {
            return;
        }
        chart.signals.push(ChartSignal {
            name: name.to_string(),
            color: None,
            axis: spec.axis.clone(),
            rank: chart.signals.len(),
        });
        self.traces.entry(name.to_string()).or_insert(Trace {
            chart: chart_idx,
            points: VecDeque::new(),
        });
    }

    /// Sets the trace depth and assigns palette colors to signals that do
    /// not have one yet. Idempotent, existing traces are kept.
    pub fn init(&mut self, depth: usize) {
        self.depth = depth;
        for chart in &mut self.charts {
            let mut color_index = 0;
            for signal in &mut chart.signals {
                if signal.color.is_none() {
                    signal.color = Some(PALETTE[color_index % PALETTE.len()].to_string());
                    color_index += 1;
                }
            }
        }
    }

    /// Replaces a signal's entire series with replayed points. Returns the
    /// owning chart's name, or None for a signal in no chart.
    pub fn replace_trace(&mut self, signal_spec: &str, points: Vec<TracePoint>) -> Option<&str> {
        let leaf = leaf_name(signal_spec);
        let trace = self.traces.get_mut(leaf)?;
        trace.points = points.into();
        Some(&self.charts[trace.chart].name)
    }

    /// Appends a live point to a signal's trace and, when the owning chart
    /// has more than one signal, aligns the other traces to it. Returns the
    /// owning chart's name, or None for a signal in no chart.
    pub fn append(&mut self, signal_spec: &str, pt: TracePoint) -> Option<&str> {
        let leaf = leaf_name(signal_spec);
        let t = pt.t;
        let chart_idx = {
            let trace = self.traces.get_mut(leaf)?;
            ext_remove(trace);
            if trace.points.len() >= self.depth {
                trace.points.pop_front();
            }
            trace.points.push_back(pt);
            trace.chart
        };
        let chart = &self.charts[chart_idx];
        if chart.signals.len() > 1 {
            cut_first(chart, &mut self.traces);
            extend_to(chart, leaf, t, &mut self.traces);
        }
        Some(&self.charts[chart_idx].name)
    }
}

impl Default for ChartSet {
    fn default() -> ChartSet {
        ChartSet::new()
    }
}

/// Drops a trailing extrapolated point, superseded by an incoming real one.
fn ext_remove(trace: &mut Trace) {
    if let Some(last) = trace.points.back() {
        if last.ext {
            trace.points.pop_back();
        }
    }
}

/// Left-clips all non-rank-0 traces to the first timestamp of the rank-0
/// trace: the last point older than it is snapped forward to it, anything
/// before that is dropped.
fn cut_first(chart: &Chart, traces: &mut HashMap<String, Trace>) {
    let t0 = match traces
        .get(&chart.signals[0].name)
        .and_then(|tr| tr.points.front())
    {
        Some(p) => p.t,
        None => return,
    };
    for signal in &chart.signals[1..] {
        let trace = match traces.get_mut(&signal.name) {
            Some(tr) => tr,
            None => continue,
        };
        let mut iprev = None;
        for (j, p) in trace.points.iter().enumerate() {
            if p.t >= t0 {
                break;
            }
            iprev = Some(j);
        }
        if let Some(i) = iprev {
            trace.points[i].t = t0;
            for _ in 0..i {
                trace.points.pop_front();
            }
        }
    }
}

/// Right-extends every other trace of the chart to timestamp `t`: a
/// trailing extrapolated point is advanced in place, otherwise a synthetic
/// point carrying the prior value is appended.
fn extend_to(chart: &Chart, updated: &str, t: i64, traces: &mut HashMap<String, Trace>) {
    for signal in &chart.signals {
        if signal.name == updated {
            continue;
        }
        let trace = match traces.get_mut(&signal.name) {
            Some(tr) => tr,
            None => continue,
        };
        let carry = match trace.points.back_mut() {
            Some(last) if last.t < t => {
                if last.ext {
                    last.t = t;
                    None
                } else {
                    Some(last.y.clone())
                }
            }
            _ => None,
        };
        if let Some(y) = carry {
            trace.points.push_back(TracePoint { t, y, ext: true });
        }
    }
}
