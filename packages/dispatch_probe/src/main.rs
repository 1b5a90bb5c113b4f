use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use client_dispatch::loopback::{LoopbackQuery, LoopbackTransport};
use client_dispatch::{
    ClientDispatcher, ClientId, ClientManager, Event, ExceptionHandler, StatsSnapshot,
    resolve_config,
};

#[derive(Clone, Copy, Debug, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
enum Mode {
    /// Batched updates handler
    Updates,
    /// One handler per update
    Single,
}

#[derive(Parser)]
#[command(name = "dispatch-probe")]
#[command(about = "Drive the client dispatcher against an in-memory transport")]
struct Args {
    /// Number of clients to create
    #[arg(short, long, default_value = "4")]
    clients: usize,

    /// Requests sent by each client
    #[arg(short, long, default_value = "100")]
    requests: usize,

    /// How clients receive updates
    #[arg(short, long, value_enum, default_value = "updates")]
    mode: Mode,

    /// Path to a dispatch.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    implementation: String,
    mode: Mode,
    clients: usize,
    requests: usize,
    updates_seen: usize,
    elapsed_ms: u128,
    stats: StatsSnapshot,
}

type Client = Arc<ClientDispatcher<LoopbackTransport>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "dispatch_probe=debug,client_dispatch=debug,info"
    } else {
        "dispatch_probe=info,client_dispatch=warn,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = resolve_config(args.config.as_deref()).context("Failed to load config")?;
    if config.receiver.threads == 0 {
        bail!("dispatch-probe needs at least one receiver thread");
    }

    let manager = ClientManager::start(LoopbackTransport::new(), config)
        .context("Failed to start client manager")?;
    info!(
        "Probing '{}' with {} client(s) x {} request(s)",
        manager.implementation_name(),
        args.clients,
        args.requests
    );

    let updates_seen = Arc::new(AtomicUsize::new(0));
    let on_error: ExceptionHandler = Arc::new(|err: anyhow::Error| warn!("Handler failed: {:#}", err));

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let client = manager.new_client();
        let client_id = initialize(&client, args.mode, &updates_seen, &on_error)
            .context("Failed to initialize client")?;
        tasks.push(tokio::spawn(drive(client, client_id, args.requests)));
    }
    for task in tasks {
        task.await.context("Client task panicked")??;
    }
    let elapsed = started.elapsed();

    // closing batches are handled on the receiver thread
    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager.client_ids().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = Report {
        implementation: manager.implementation_name().to_string(),
        mode: args.mode,
        clients: args.clients,
        requests: args.requests,
        updates_seen: updates_seen.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis(),
        stats: manager.stats().snapshot(),
    };
    manager.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn initialize(
    client: &Client,
    mode: Mode,
    updates_seen: &Arc<AtomicUsize>,
    on_error: &ExceptionHandler,
) -> Result<ClientId> {
    let seen = updates_seen.clone();
    let client_id = match mode {
        Mode::Updates => client.initialize_updates_mode(
            move |updates| {
                seen.fetch_add(updates.len(), Ordering::Relaxed);
                Ok(())
            },
            Some(on_error.clone()),
            Some(on_error.clone()),
        )?,
        Mode::Single => client.initialize_single_handler_mode(
            move |_| {
                seen.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Some(on_error.clone()),
            Some(on_error.clone()),
        )?,
    };
    Ok(client_id)
}

async fn drive(client: Client, client_id: ClientId, requests: usize) -> Result<()> {
    for n in 0..requests {
        let text = format!("{}:{}", client_id, n);
        match client.request(LoopbackQuery::Echo(text.clone())).await? {
            Event::Object(echo) if echo == text => {}
            other => bail!("Client {} got {:?} for request {}", client_id, other, n),
        }
    }

    let closed = client
        .request(LoopbackQuery::Close)
        .await
        .with_context(|| format!("Failed to close client {}", client_id))?;
    if !closed.is_ok() {
        warn!("Client {} closed with {:?}", client_id, closed);
    }
    Ok(())
}

fn print_report(report: &Report) {
    let stats = &report.stats;
    println!("implementation:        {}", report.implementation);
    println!("mode:                  {:?}", report.mode);
    println!("clients:               {}", report.clients);
    println!("requests per client:   {}", report.requests);
    println!("elapsed:               {} ms", report.elapsed_ms);
    println!("updates seen:          {}", report.updates_seen);
    println!("batches received:      {}", stats.batches_received);
    println!("responses delivered:   {}", stats.responses_delivered);
    println!("events dropped:        {}", stats.events_dropped);
    println!("aborts suppressed:     {}", stats.aborts_suppressed);
    println!("handler failures:      {}", stats.handler_failures);
    println!("requests force-closed: {}", stats.requests_force_closed);
    println!("clients still open:    {}", stats.clients_open());
}
