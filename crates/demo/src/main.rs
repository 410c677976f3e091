//! Lodestar walkthrough binary.
//!
//! Starts an in-process coordination ensemble, registers echo server
//! instances across zones, resolves them zone-first into an address list,
//! removes the preferred instance, and finally retries an echo call through a
//! flaky channel.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: three instances, client prefers zone-a
//! lodestar-demo
//!
//! # Environment variables
//! LODESTAR__ZONE=zone-b LODESTAR__FAILURES=4 lodestar-demo
//!
//! # CLI arguments override environment variables
//! LODESTAR__MAX_RETRIES=1 lodestar-demo --max-retries -1 --log-format json
//! ```

mod config;
mod echo;

use std::{io::IsTerminal, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use config::{Cli, LogFormat};
use echo::{DemoTransports, FlakyEchoChannel, OutcomeListener};
use lodestar_sdk::{
    AddressListBalancer, DiscoveryError, DnsLookup, ExponentialBackoff, MemoryEnsemble,
    ResolverRegistry, RetryInterceptor, RetryScheduler, RetryState, ServiceRegistry, ZoneAffinity,
    ZoneAwareResolverProvider,
    call::{CallOptions, Channel, InterceptedChannel, MethodDescriptor, MethodType},
};
use tonic::metadata::MetadataMap;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Zones the demo servers are spread across.
const ZONES: [&str; 2] = ["zone-a", "zone-b"];

/// First port handed to demo servers.
const BASE_PORT: u16 = 7000;

/// How long to wait for watch-driven updates.
const SETTLE: Duration = Duration::from_millis(200);

/// Top-level error type for the demo binary.
#[derive(Debug)]
enum DemoError {
    Discovery(DiscoveryError),
    Runtime(Box<dyn std::error::Error>),
}

impl std::fmt::Display for DemoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemoError::Discovery(e) => write!(f, "discovery error: {}", e),
            DemoError::Runtime(e) => write!(f, "runtime error: {}", e),
        }
    }
}

impl std::error::Error for DemoError {}

impl From<DiscoveryError> for DemoError {
    fn from(e: DiscoveryError) -> Self {
        DemoError::Discovery(e)
    }
}

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = cli.registry_config()?;
    tracing::info!(
        connect = %config.connect_string(),
        root = config.root_path(),
        service = %cli.service,
        "Starting Lodestar demo"
    );

    let ensemble = MemoryEnsemble::new();

    // Servers: one registry session per instance, spread across zones.
    let mut servers = Vec::with_capacity(usize::from(cli.instances));
    for i in 0..cli.instances {
        let zone = ZONES[usize::from(i) % ZONES.len()];
        let uri = Url::parse(&format!("http://127.0.0.{}:{}", i + 1, BASE_PORT + u16::from(i)))
            .map_err(|e| DemoError::Runtime(Box::new(e)))?;
        let server = ServiceRegistry::connect(&ensemble, config.clone()).await?;
        server.register_in_zone(&cli.service, &uri, zone).await?;
        servers.push((zone, server));
    }

    // Client: resolve `registry://<service>` into a balanced address list.
    let provider = ZoneAwareResolverProvider::builder()
        .coordinator(Arc::new(ensemble.clone()))
        .config(config)
        .lookup(Arc::new(DnsLookup::new()))
        .comparator(ZoneAffinity::prefer(cli.zone.as_str()))
        .build()?;
    let resolvers = ResolverRegistry::new();
    resolvers.register(Arc::new(provider));

    let balancer = Arc::new(AddressListBalancer::new(Arc::new(DemoTransports)));
    let mut resolver = resolvers.new_resolver(&format!("registry://{}", cli.service)).await?;
    resolver.start(balancer.clone()).await?;
    tracing::info!(
        servers = balancer.snapshot().len(),
        next = %balancer.pick(),
        "Initial selection"
    );

    // Losing the preferred instances moves selection to the next one.
    let (preferred, others): (Vec<_>, Vec<_>) =
        servers.into_iter().partition(|(zone, _)| *zone == cli.zone);
    for (_, server) in &preferred {
        server.close().await?;
    }
    tokio::time::sleep(SETTLE).await;
    tracing::info!(
        removed = preferred.len(),
        servers = balancer.snapshot().len(),
        next = %balancer.pick(),
        "Selection after preferred zone left"
    );

    call_with_retries(&cli).await?;

    resolver.shutdown().await?;
    for (_, server) in &others {
        server.close().await?;
    }
    tokio::time::sleep(SETTLE).await;
    tracing::info!(next = %balancer.pick(), "Selection with no servers left");

    if let Ok(scheduler) = RetryScheduler::shared() {
        scheduler.shutdown();
    }
    tracing::info!("Demo complete");
    Ok(())
}

/// Sends one echo call through the retry interceptor.
async fn call_with_retries(cli: &Cli) -> Result<(), DemoError> {
    let backoff = ExponentialBackoff::builder()
        .initial_delay(Duration::from_millis(20))
        .max_delay(Duration::from_millis(500))
        .build()?;
    let state = RetryState::create_default()
        .map_err(|e| DemoError::Runtime(Box::new(e)))?
        .with_backoff(backoff)
        .with_max_retries(cli.max_retries)
        .with_before_retry(|| tracing::debug!("Retrying echo call"));

    let flaky = Arc::new(FlakyEchoChannel::new(cli.service.as_str(), cli.failures));
    let channel = InterceptedChannel::new(flaky.clone(), Arc::new(RetryInterceptor::new(state)));

    let (listener, outcome) = OutcomeListener::new();
    let call = channel.new_call(
        &MethodDescriptor::new("lodestar.demo.Echo/Echo", MethodType::Unary),
        &CallOptions::default(),
    );
    call.start(listener, MetadataMap::new());
    call.request(1);
    call.send_message(Bytes::from_static(b"hello"));
    call.half_close();

    let outcome = outcome.await.map_err(|e| DemoError::Runtime(Box::new(e)))?;
    tracing::info!(
        code = ?outcome.status.code(),
        attempts = flaky.attempts(),
        responses = outcome.messages.len(),
        "Echo call finished"
    );
    Ok(())
}

/// Initializes logging.
///
/// Supports three formats:
/// - `Text`: Human-readable format (development)
/// - `Json`: JSON structured logging (production)
/// - `Auto`: JSON for non-TTY stdout, text otherwise
fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = match format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stdout().is_terminal(),
    };

    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
    }
}
