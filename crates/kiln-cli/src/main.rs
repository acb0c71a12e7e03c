//! # Kiln CLI Entry Point
//!
//! Main binary for the Kiln application-worker orchestration platform.
//!
//! ## Usage
//!
//! ```bash
//! # Start the engine host
//! kiln serve -c kiln.json
//!
//! # Run a job against an application (outputs raw JSON)
//! kiln call 127.0.0.1:5000 push -t TOKEN --targets '{"app": {"event": "emit"}}'
//!
//! # Fetch the running stats
//! kiln call 127.0.0.1:5000 stats -t TOKEN
//! ```

use anyhow::Result;
use argh::FromArgs;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kiln_common::auth::NoVerifier;
use kiln_common::config::Config;
use kiln_common::transport::{Client, PubChannel, RouterChannel};
use kiln_core::{Collaborators, Core, CoreIo, NullStore, Relinker, TcpLocator};
use kiln_engine::ProcessIsolate;

/// Kiln - distributed application-worker orchestration
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// start the engine host
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// path to the JSON configuration file
    ///
    /// Every section is optional; missing fields fall back to defaults.
    /// Without a config file the host binds the default local endpoints.
    #[argh(option, short = 'c')]
    config: Option<String>,
}

/// send one request to an engine host
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
struct CallArgs {
    /// address of the engine host router
    #[argh(positional)]
    address: String,

    /// action to request: push, drop, stats or history
    #[argh(positional)]
    action: String,

    /// security token
    #[argh(option, short = 't', default = "\"anonymous\".into()")]
    token: String,

    /// JSON object mapping target applications to their arguments
    ///
    /// Required by push, drop and history. Use `{}` per target for
    /// actions without arguments.
    #[argh(option, default = "\"{}\".into()")]
    targets: String,

    /// protocol version to speak
    #[argh(option, default = "1")]
    version: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep call output clean for unix tool usage (piping to jq, etc.)
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let shutdown = CancellationToken::new();

    let router = RouterChannel::bind(&config.net.listen).await?;
    let publisher = PubChannel::bind(&config.net.publish, config.net.watermark).await?;
    let router_handles = router.spawn(shutdown.clone());
    let publish_tx = publisher.spawn(shutdown.clone());

    // The slave event seam: a slave-facing listener feeds these senders.
    // Held here so the channels outlive the core.
    let (_slaves_tx, slaves_rx) = mpsc::unbounded_channel();
    let (_events_tx, events_rx) = mpsc::unbounded_channel();

    Relinker::from_config(&config.cluster, Arc::new(TcpLocator)).spawn(shutdown.clone());

    let core = Core::new(
        config,
        CoreIo {
            requests: router_handles.requests,
            replies: router_handles.replies,
            publish: publish_tx,
            slaves: slaves_rx,
            events: events_rx,
        },
        Collaborators {
            storage: Arc::new(NullStore),
            verifier: Arc::new(NoVerifier),
            isolate: Arc::new(ProcessIsolate),
        },
        shutdown.clone(),
    );

    tracing::info!("engine host started");
    let result = core.run().await;
    shutdown.cancel();

    Ok(result?)
}

async fn run_call(args: CallArgs) -> Result<()> {
    let targets: serde_json::Value = serde_json::from_str(&args.targets)
        .map_err(|e| anyhow::anyhow!("invalid JSON in targets: {e}"))?;

    let mut payload = serde_json::json!({
        "version": args.version,
        "token": args.token,
        "action": args.action,
    });
    if args.action != "stats" {
        payload["targets"] = targets;
    }

    let mut client = Client::connect(&args.address).await?;
    let response = client.request(&payload, None).await?;

    // Raw JSON to stdout for scripting
    println!("{}", serde_json::to_string(&response)?);

    Ok(())
}
