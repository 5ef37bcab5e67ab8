use clap::Parser;
use homelink::session::{SessionState, StateDump};
use homelink::supervisor::Config;
use homelink::Supervisor;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug, Clone)]
pub struct LinkOpts {
    /// Controller address (e.g., tcp://localhost, tcp://10.0.0.5:4640)
    #[arg(
        short = 'r',
        long = "root",
        default_value = "tcp://localhost",
        help = "Controller address"
    )]
    pub root: String,

    /// Skip the trace replay phase and keep no chart buffers
    #[arg(long = "no-charts")]
    pub no_charts: bool,
}

impl LinkOpts {
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::with_config(Config {
            url: self.root.clone(),
            charting: !self.no_charts,
        })
    }
}

/// Polls the supervisor until the session reaches steady state, returning
/// the state dump taken there.
pub fn wait_ready(link: &Supervisor, timeout: Duration) -> Result<StateDump, ()> {
    let deadline = Instant::now() + timeout;
    loop {
        match link.dump() {
            Ok(dump) if dump.state == SessionState::Ready => return Ok(dump),
            Ok(_) => {}
            Err(_) => return Err(()),
        }
        if Instant::now() >= deadline {
            return Err(());
        }
        thread::sleep(Duration::from_millis(50));
    }
}
