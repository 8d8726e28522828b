use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tokio::sync::{mpsc, watch};

use server::auth::TicketAuthenticator;
use server::config::Args;
use server::gc::Gc;
use server::matchmaking::MatchmakingConfig;
use server::moderation::{ModerationConfig, ReportNotifier};
use server::repository::{MemoryRepository, MySqlRepository, Repository};
use server::session::SessionConfig;
use server::social::SocialConfig;
use server::transport::{Router, TcpTransport, UdpTransport};
use shared::STEAM_APP_ID;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info ./server");
    }

    let args = Args::parse();
    info!(
        "starting game coordinator for app {} on {}",
        STEAM_APP_ID,
        args.bind_addr()
    );

    let repo: Arc<dyn Repository> = match &args.database_url {
        Some(url) => Arc::new(MySqlRepository::connect(url).await?),
        None => {
            warn!("GC_DATABASE_URL not set; running on the in-memory repository");
            Arc::new(MemoryRepository::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let next_peer = Arc::new(AtomicU64::new(1));

    // Client datagram endpoint and game-server TCP endpoint share the port.
    let udp = UdpTransport::bind(
        &args.bind_addr(),
        event_tx.clone(),
        Arc::clone(&next_peer),
        shutdown_rx.clone(),
    )
    .await?;
    let tcp = TcpTransport::bind(&args.bind_addr(), event_tx, next_peer, shutdown_rx.clone())
        .await?;
    let router = Arc::new(Router { udp, tcp });

    let notifier = ReportNotifier::spawn(
        ModerationConfig::new(args.webhook_url.clone(), args.moderator_role_id.clone()),
        shutdown_rx.clone(),
    );

    let gc = Gc::new(
        repo,
        Arc::new(TicketAuthenticator),
        router,
        notifier,
        SessionConfig::default(),
        MatchmakingConfig::default(),
        SocialConfig::default(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    gc.run(event_rx, shutdown_rx).await;
    info!("coordinator stopped cleanly");
    Ok(())
}
