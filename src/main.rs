//! Argonaut node
//!
//! One process of the group. Broadcasts values (FIFO mode) or submits set
//! proposals (lattice mode) while logging deliveries and decisions, then
//! flushes the log and exits cleanly on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use argonaut::app::config;
use argonaut::app::logger::DeliveryLog;
use argonaut::broadcast::FifoBroadcast;
use argonaut::core::Membership;
use argonaut::lattice::LatticeAgreement;
use argonaut::network::MAX_CHUNKS;

/// Run mode; decides how the config file is interpreted.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Broadcast integers with FIFO delivery order.
    Fifo,
    /// Propose value sets and decide by lattice agreement.
    Lattice,
}

/// Reliable broadcast / lattice agreement node
#[derive(Parser, Debug)]
#[command(name = "argonaut")]
#[command(about = "Reliable broadcast and lattice agreement over UDP", long_about = None)]
struct Args {
    /// Own process id, as listed in the hosts file
    #[arg(long)]
    id: u8,

    /// Hosts file: one `id host port` line per process
    #[arg(long)]
    hosts: PathBuf,

    /// Run configuration file (mode-dependent format)
    #[arg(long)]
    config: PathBuf,

    /// Output log path
    #[arg(long)]
    output: PathBuf,

    #[arg(long, value_enum, default_value = "fifo")]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let membership = config::load_hosts(&args.hosts).context("invalid hosts file")?;
    let bind_addr = membership
        .addr_of(args.id)
        .with_context(|| format!("own id {} is absent from the hosts file", args.id))?;
    let log = Arc::new(DeliveryLog::create(&args.output).context("cannot create output log")?);

    match args.mode {
        Mode::Fifo => run_fifo(&args, membership, bind_addr, log).await,
        Mode::Lattice => run_lattice(&args, membership, bind_addr, log).await,
    }
}

async fn run_fifo(
    args: &Args,
    membership: Membership,
    bind_addr: SocketAddr,
    log: Arc<DeliveryLog>,
) -> Result<()> {
    let message_count = config::load_fifo_config(&args.config).context("invalid fifo config")?;

    let fifo = Arc::new(FifoBroadcast::new(args.id, membership));
    fifo.bind(bind_addr).await.context("bind failed")?;
    tracing::info!(id = args.id, %bind_addr, message_count, "fifo node up");

    let listener = {
        let fifo = Arc::clone(&fifo);
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            if let Err(error) = fifo
                .listen(move |sender, value| log.record_delivery(sender, value))
                .await
            {
                tracing::error!(%error, "listener stopped");
            }
        })
    };

    let sender = {
        let fifo = Arc::clone(&fifo);
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            let mut next = 1u32;
            // Full groups of eight share one datagram; the remainder goes
            // out one value per datagram.
            while next <= message_count && message_count - next >= MAX_CHUNKS as u32 - 1 {
                let batch_end = next + (MAX_CHUNKS as u32 - 1);
                let values: Vec<u32> = (next..=batch_end).collect();
                // Log before sending: a value counts as broadcast the moment
                // we commit to it.
                log.record_sent(batch_end);
                if let Err(error) = fifo.broadcast(&values).await {
                    tracing::error!(%error, "broadcast failed");
                    return;
                }
                next = batch_end + 1;
            }
            while next <= message_count {
                log.record_sent(next);
                if let Err(error) = fifo.broadcast(&[next]).await {
                    tracing::error!(%error, "broadcast failed");
                    return;
                }
                next += 1;
            }
            tracing::info!(message_count, "all broadcasts submitted");
        })
    };

    wait_for_shutdown().await?;

    log.freeze();
    log.flush().context("final log flush failed")?;
    fifo.shutdown();
    sender.abort();
    listener.abort();
    Ok(())
}

async fn run_lattice(
    args: &Args,
    membership: Membership,
    bind_addr: SocketAddr,
    log: Arc<DeliveryLog>,
) -> Result<()> {
    let lattice_config =
        config::load_lattice_config(&args.config).context("invalid lattice config")?;

    let agreement = {
        let log = Arc::clone(&log);
        Arc::new(LatticeAgreement::new(
            args.id,
            membership,
            lattice_config.unique_proposals,
            move |decision| log.record_decision(decision),
        ))
    };
    agreement.bind(bind_addr).await.context("bind failed")?;
    tracing::info!(
        id = args.id,
        %bind_addr,
        proposals = lattice_config.proposal_count,
        "lattice node up"
    );

    let listener = {
        let agreement = Arc::clone(&agreement);
        tokio::spawn(async move {
            if let Err(error) = agreement.listen().await {
                tracing::error!(%error, "listener stopped");
            }
        })
    };

    let proposer = {
        let agreement = Arc::clone(&agreement);
        let proposals = lattice_config.proposals;
        tokio::spawn(async move {
            for values in proposals {
                if let Err(error) = agreement.propose(&values).await {
                    tracing::error!(%error, "propose failed");
                    return;
                }
            }
            tracing::info!("all proposals submitted");
        })
    };

    wait_for_shutdown().await?;

    log.freeze();
    log.flush().context("final log flush failed")?;
    agreement.shutdown();
    proposer.abort();
    listener.abort();
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
    tokio::select! {
        _ = term.recv() => tracing::info!("SIGTERM, shutting down"),
        _ = int.recv() => tracing::info!("SIGINT, shutting down"),
    }
    Ok(())
}
