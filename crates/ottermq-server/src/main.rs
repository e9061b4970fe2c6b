//! OtterMQ server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:5672, vhost "/", guest/guest
//! ottermq-server
//!
//! # Custom listen address and tuning
//! ottermq-server --listen 127.0.0.1:5673 --heartbeat 30 --log-level debug
//! ```
//!
//! Exit codes: 0 clean shutdown on signal, 1 fatal startup error, 2
//! unrecoverable listener failure.

use clap::Parser;
use ottermq_core::{Broker, BrokerConfig};
use ottermq_proto::FRAME_MIN_SIZE;
use ottermq_server::Server;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// OtterMQ AMQP 0-9-1 message broker
#[derive(Parser, Debug)]
#[command(name = "ottermq-server")]
#[command(about = "OtterMQ AMQP 0-9-1 message broker")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:5672")]
    listen: String,

    /// Virtual host created at startup
    #[arg(long, default_value = "/")]
    default_vhost: String,

    /// Bootstrap username
    #[arg(long, default_value = "guest")]
    default_user: String,

    /// Bootstrap password
    #[arg(long, default_value = "guest")]
    default_pass: String,

    /// Channel limit offered at tune time (0 = unlimited)
    #[arg(long, default_value = "2047")]
    channel_max: u16,

    /// Frame size offered at tune time (min 4096)
    #[arg(long, default_value = "131072")]
    frame_max: u32,

    /// Heartbeat delay in seconds (0 disables heartbeats)
    #[arg(long, default_value = "60")]
    heartbeat: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap renders its own usage/error text
            let _ = err.print();
            return 1;
        },
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if args.frame_max != 0 && args.frame_max < FRAME_MIN_SIZE {
        tracing::error!(frame_max = args.frame_max, "frame-max below the protocol minimum 4096");
        return 1;
    }

    let config = BrokerConfig {
        listen_addr: args.listen,
        default_vhost: args.default_vhost,
        default_user: args.default_user,
        default_pass: args.default_pass,
        channel_max: args.channel_max,
        frame_max: args.frame_max,
        heartbeat: args.heartbeat,
    };

    tracing::info!("OtterMQ starting");
    let broker = Broker::with_defaults(config);

    let server = match Server::bind(broker).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "startup failed");
            return 1;
        },
    };

    match server.local_addr() {
        Ok(addr) => tracing::info!(%addr, "listening"),
        Err(err) => {
            tracing::error!(%err, "listener in a bad state");
            return 1;
        },
    }

    tokio::select! {
        result = server.run() => {
            match result {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(%err, "listener failed");
                    2
                },
            }
        },
        () = shutdown_signal() => {
            tracing::info!("shutting down");
            0
        },
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(_) => {
                ctrl_c.await;
                return;
            },
        };
        tokio::select! {
            () = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
