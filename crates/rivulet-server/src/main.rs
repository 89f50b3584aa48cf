//! Rivulet standalone server
//!
//! Hosts the demo state tree behind a line-oriented transport on stdin and
//! stdout. Every scope gets its own replay hub; `watch` additionally opens a
//! push session backed by a broadcast core fed from that hub.

mod command;
mod config;
mod demo;
mod sink;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rivulet_core::broadcast::BroadcastCore;
use rivulet_core::protocol::Envelope;
use rivulet_core::replay::{HubManager, ReplayHub};
use rivulet_core::scheduler::TokioScheduler;
use rivulet_core::session::{SessionId, SessionSink};

use crate::command::Command;
use crate::config::ServerConfig;
use crate::demo::DemoState;
use crate::sink::StdoutSink;

/// Rivulet - reactive state synchronization server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "rivulet.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Clock tick interval in milliseconds (overrides the config file)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Session id used for every hub opened from this terminal
    #[arg(long, default_value = "local")]
    session: String,
}

/// Push session opened by `watch`.
struct Watcher {
    core: BroadcastCore,
    session: SessionId,
}

struct Server {
    config: ServerConfig,
    session: String,
    demo: DemoState,
    hubs: Arc<HubManager>,
    watchers: HashMap<String, Watcher>,
}

impl Server {
    fn hub(&self, scope: &str) -> Result<ReplayHub> {
        let demo = &self.demo;
        Ok(self.hubs.hub(&self.session, scope, || demo.registry())?)
    }

    fn dispatch(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Poll { scope, since } => {
                let envelope: Envelope = self.hub(&scope)?.poll(since);
                println!("{}", serde_json::to_string(&envelope)?);
            }
            Command::Set { scope, key, value } => {
                let hub = self.hub(&scope)?;
                match hub.set(&key, &value) {
                    Ok(outcome) => println!("ok {outcome:?}"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Command::Watch { scope, since } => {
                if self.watchers.contains_key(&scope) {
                    println!("error: already watching '{scope}'");
                    return Ok(());
                }
                // Hub-fed, so printed sequences are valid `since` values.
                let hub = self.hub(&scope)?;
                let core = BroadcastCore::builder(self.demo.registry()?)
                    .scheduler(Arc::new(TokioScheduler::current()))
                    .config(self.config.broadcast())
                    .replay(hub.clone())
                    .build();
                let sink = Arc::new(StdoutSink::new(scope.clone()));
                let session = sink.id();
                core.on_open(sink, Some(&hub), since)?;
                info!(scope = %scope, %session, "watch opened");
                self.watchers.insert(scope, Watcher { core, session });
            }
            Command::Unwatch { scope } => match self.watchers.remove(&scope) {
                Some(watcher) => {
                    watcher.core.on_close(watcher.session);
                    info!(scope = %scope, "watch closed");
                }
                None => println!("error: not watching '{scope}'"),
            },
            Command::Quit => {}
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.core.shutdown();
        }
        self.hubs.close_all();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays a clean envelope stream.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "rivulet_server={0},rivulet_core={0}",
                    args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Rivulet server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config);

    let config = ServerConfig::load(Path::new(&args.config))?;
    let tick = Duration::from_millis(args.tick_ms.unwrap_or(config.demo.tick_ms).max(1));

    let mut server = Server {
        hubs: Arc::new(HubManager::new(config.hub_manager())),
        config,
        session: args.session,
        demo: DemoState::new(),
        watchers: HashMap::new(),
    };

    let ticker = {
        let demo = server.demo.clone();
        let hubs = Arc::clone(&server.hubs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                // Listeners perform synchronous session writes.
                let demo = demo.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || demo.tick()).await {
                    warn!("clock tick failed: {e}");
                }
                let expired = hubs.evict_expired();
                if expired > 0 {
                    debug!(expired, "evicted idle hubs");
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = server.dispatch(command) {
                    println!("error: {e:#}");
                }
            }
            Err(e) => println!("error: {e:#}"),
        }
    }

    ticker.abort();
    server.shutdown();
    info!("Rivulet server stopped");
    Ok(())
}
