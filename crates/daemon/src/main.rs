//! Wirevend Daemon
//!
//! Provisions WireGuard peers for confirmed payments and reaps them on
//! expiry. The `run` subcommand starts the long-lived daemon; the remaining
//! subcommands are the administrative surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wirevend_common::{Database, PaymentMethod};
use wirevend_daemon::{
    config::DaemonConfig,
    gateway::WgGateway,
    notify::LogDelivery,
    payments::PaymentService,
    provision::{IssueOutcome, Provisioner},
    reaper::Reaper,
    ssh::SshExecutor,
};

#[derive(Parser)]
#[command(name = "wirevendd")]
#[command(about = "Wirevend daemon - WireGuard key vending")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.wirevend/config.toml")]
    config: PathBuf,

    /// Store directory (overrides the config file)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: expiry reaper and periodic reconciliation
    Run,

    /// Issue a key directly (admin grant, no payment)
    Issue {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        days: u32,
    },

    /// Revoke a key by name
    Revoke {
        #[arg(long)]
        name: String,
    },

    /// Run one reconciliation sweep and exit
    Reconcile,

    /// List a user's keys
    Keys {
        #[arg(long)]
        user: i64,
    },

    /// Open a payment for a user
    PaymentCreate {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        days: u32,
        #[arg(long, default_value = "card")]
        method: String,
    },

    /// Attach proof of payment
    PaymentPaid {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        proof: String,
    },

    /// Confirm a payment and provision its key
    PaymentConfirm {
        #[arg(long)]
        reference: String,
        #[arg(long, default_value = "confirmed by administrator")]
        comment: String,
    },

    /// Reject a payment
    PaymentReject {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        comment: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load or create configuration
    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if config.ssh.host.is_empty() {
        anyhow::bail!(
            "no gateway host configured; set [ssh] host in {}",
            cli.config.display()
        );
    }

    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = Database::open(config.db_path())?;

    let executor = Arc::new(SshExecutor::new(config.ssh.clone()));
    let gateway = Arc::new(WgGateway::new(
        executor,
        config.wireguard.clone(),
        config.endpoint_host(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        db.clone(),
        gateway,
        Arc::new(LogDelivery),
        &config,
    )?);
    let payments = PaymentService::new(db.clone(), config.payment.clone());

    match cli.command {
        Command::Run => run_daemon(db, provisioner, &config).await,
        Command::Issue { user, days } => {
            report_outcome(provisioner.issue(user, days, None).await)
        }
        Command::Revoke { name } => {
            let key = provisioner.revoke_by_name(&name).await?;
            println!("revoked {} ({})", key.name, key.address);
            Ok(())
        }
        Command::Reconcile => {
            let report = provisioner.reconcile().await?;
            println!(
                "reconciled: {} orphan peers removed, {} stuck provisionals cleared",
                report.orphan_peers_removed, report.stuck_provisionals_cleared
            );
            Ok(())
        }
        Command::Keys { user } => {
            let now = chrono::Utc::now().timestamp();
            for key in db.list_user_keys(user)? {
                println!(
                    "{}  {}  {}  {} days left",
                    key.name,
                    key.address,
                    key.status,
                    key.days_left(now)
                );
            }
            Ok(())
        }
        Command::PaymentCreate { user, days, method } => {
            let method: PaymentMethod = method
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let payment = payments.create(user, days, method)?;
            println!("{}", payment.reference);
            println!("{}", serde_json::to_string_pretty(&payment.details)?);
            Ok(())
        }
        Command::PaymentPaid { reference, proof } => {
            let payment = payments.by_reference(&reference)?;
            payments.submit_proof(payment.id, &proof)?;
            println!("payment {} marked paid", reference);
            Ok(())
        }
        Command::PaymentConfirm { reference, comment } => {
            let payment = payments.by_reference(&reference)?;
            let confirmed = payments.confirm(payment.id, &comment)?;
            report_outcome(provisioner.on_payment_confirmed(&confirmed).await)
        }
        Command::PaymentReject { reference, comment } => {
            let payment = payments.by_reference(&reference)?;
            payments.reject(payment.id, &comment)?;
            println!("payment {} rejected: {}", reference, comment);
            Ok(())
        }
    }
}

async fn run_daemon(
    db: Database,
    provisioner: Arc<Provisioner>,
    config: &DaemonConfig,
) -> anyhow::Result<()> {
    info!("wirevendd v{}", wirevend_common::VERSION);

    let token = CancellationToken::new();

    // Expiry reaper
    let reaper = Reaper::new(db, provisioner.clone(), &config.reaper);
    let reaper_token = token.clone();
    let reaper_handle = tokio::spawn(async move { reaper.run(reaper_token).await });

    // Periodic reconciliation sweep
    let sweep_interval = std::time::Duration::from_secs(config.reaper.cycle_secs);
    let sweep_provisioner = provisioner.clone();
    let sweep_token = token.clone();
    let sweep_handle = tokio::spawn(async move {
        loop {
            if let Err(e) = sweep_provisioner.reconcile().await {
                warn!("reconciliation sweep failed: {}", e);
            }
            tokio::select! {
                _ = sweep_token.cancelled() => break,
                _ = tokio::time::sleep(sweep_interval) => {}
            }
        }
    });

    info!("daemon started");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    token.cancel();

    let _ = reaper_handle.await;
    let _ = sweep_handle.await;

    info!("daemon shutdown complete");
    Ok(())
}

fn report_outcome(outcome: IssueOutcome) -> anyhow::Result<()> {
    match outcome {
        IssueOutcome::Committed(key) => {
            eprintln!(
                "issued {} at {} (expires at {})",
                key.name, key.address, key.expires_at
            );
            // The rendered profile goes to stdout so it can be piped to a file
            print!("{}", key.config_data);
            Ok(())
        }
        IssueOutcome::RolledBack(e) => {
            anyhow::bail!(
                "provisioning failed, nothing was changed; the payment is preserved and \
                 the attempt can be retried: {}",
                e
            )
        }
        IssueOutcome::NeedsReconciliation { key_name, error } => {
            anyhow::bail!(
                "provisioning of {} ended ambiguously ({}); the reconciliation sweep will \
                 resolve it, then retry",
                key_name, error
            )
        }
    }
}
