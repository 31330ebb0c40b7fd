use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// "Is the remote reachable", refreshed by [`run_probe`] or set directly.
#[derive(Clone, Debug)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Connectivity {
    pub fn new(initial: bool) -> Self {
        Self { online: Arc::new(AtomicBool::new(initial)) }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true when the value changed.
    pub fn set(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
        }
        was != online
    }
}

/// Polls `url` every `interval` until cancelled. Any HTTP response counts as
/// reachable; only transport failures mean offline.
pub async fn run_probe(conn: Connectivity, url: String, interval: Duration, cancel: CancellationToken) {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "connectivity: cannot build http client, probe disabled");
            return;
        }
    };
    info!(url = %url, every = ?interval, "connectivity: probe started");

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let reachable = client.get(&url).send().await.is_ok();
                conn.set(reachable);
            }
        }
    }
    info!("connectivity: probe stopped");
}
