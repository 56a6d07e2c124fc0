use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use matinee::config::Config;
use matinee::model::{ChatEntry, SeatMap, VisitorPosition};
use matinee::session::SessionCoordinator;
use matinee::session::seats::join_screening;
use matinee::sync::{HeadlessScreen, StreamingEngine};
use matinee::view::{ChatViewSink, PositionViewSink, SeatViewSink};

#[derive(Parser, Debug)]
#[command(
    name = "matinee",
    about = "Join a shared virtual screening and coordinate with fellow viewers",
    version
)]
struct Cli {
    /// Screening to attend
    screening: String,

    #[arg(
        long,
        env = "MATINEE_RELAY_SERVER",
        help = "Base URL of the relay server"
    )]
    server: Option<String>,

    #[arg(
        long,
        env = "MATINEE_VISITOR_NAME",
        help = "Display name used when requesting a credential"
    )]
    name: Option<String>,

    #[arg(
        long,
        env = "MATINEE_TOKEN",
        hide_env_values = true,
        help = "Reuse an existing bearer credential instead of joining"
    )]
    token: Option<String>,

    #[arg(
        long,
        value_name = "ROW,SEAT",
        value_parser = parse_seat,
        help = "Seat to claim after joining"
    )]
    seat: Option<(u32, u32)>,

    #[arg(
        long = "log-level",
        env = "MATINEE_LOG_LEVEL",
        default_value = "info",
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    log_level: String,
}

fn parse_seat(raw: &str) -> Result<(u32, u32), String> {
    let (row, seat) = raw
        .split_once(',')
        .ok_or_else(|| "expected ROW,SEAT".to_string())?;
    let row = row.trim().parse().map_err(|_| "invalid row".to_string())?;
    let seat = seat.trim().parse().map_err(|_| "invalid seat".to_string())?;
    Ok((row, seat))
}

/// Terminal rendering of the seat/chat/position snapshots the core pushes.
struct ConsoleView;

impl SeatViewSink for ConsoleView {
    fn seats_updated(&self, seats: &SeatMap) {
        tracing::info!(
            target = "view",
            occupied = seats.occupied.len(),
            total = seats.rows * seats.seats_per_row,
            "seat map updated"
        );
    }
}

impl ChatViewSink for ConsoleView {
    fn chat_updated(&self, log: &[ChatEntry]) {
        if let Some(entry) = log.last() {
            println!("[{}] {}", entry.sender, entry.text);
        }
    }
}

impl PositionViewSink for ConsoleView {
    fn positions_updated(&self, positions: &HashMap<String, VisitorPosition>) {
        tracing::debug!(
            target = "view",
            visitors = positions.len(),
            "positions updated"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.relay_server = server;
    }

    let token = match cli.token {
        Some(token) => token,
        None => {
            let name = cli
                .name
                .unwrap_or_else(|| format!("viewer-{}", uuid::Uuid::new_v4()));
            let base = config.relay_base_url().context("relay server url")?;
            let joined = join_screening(&base, &cli.screening, &name)
                .await
                .context("joining screening")?;
            tracing::info!(visitor = %joined.visitor_id, "credential issued");
            joined.token
        }
    };

    let engine = Arc::new(HeadlessScreen::new());
    let session = SessionCoordinator::start(config, &cli.screening, &token, engine.clone())
        .await
        .context("starting session")?;

    let view = Arc::new(ConsoleView);
    session.set_seat_view(view.clone());
    session.set_chat_view(view.clone());
    session.set_position_view(view);

    match session.screening_details().await {
        Ok(screening) => {
            tracing::info!(title = %screening.title, "attending screening");
            if !screening.magnet_link.is_empty() {
                engine.attach(&screening.magnet_link);
            }
        }
        Err(err) => tracing::warn!(error = %err, "could not fetch screening details"),
    }

    if let Some((row, seat)) = cli.seat {
        match session.select_seat(row, seat).await {
            Ok(lease) => tracing::info!(row = lease.row, seat = lease.seat, "seat claimed"),
            Err(err) => tracing::warn!(error = %err, "seat selection failed"),
        }
    }

    // Lines from stdin become chat messages until EOF or ctrl-c.
    let chat_session = Arc::clone(&session);
    let chat_loop = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = line.trim();
            if !text.is_empty() {
                chat_session.send_chat(text).await;
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    chat_loop.abort();
    session.teardown().await;
    Ok(())
}
