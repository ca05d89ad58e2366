use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rolekeeper::bot::Bot;
use rolekeeper::commands::CommandParser;
use rolekeeper::config::{BotConfig, Settings, read_credentials};
use rolekeeper::google::auth::{CALENDAR_SCOPE, SHEETS_SCOPE};
use rolekeeper::google::{
    CalendarSink, GoogleCalendar, GoogleSheets, ServiceAccountKey, SheetAuth, SheetStore,
    TokenSource,
};
use rolekeeper::http::{HttpState, http_routes};
use rolekeeper::notifier::{SheetNotifier, spawn_sheet_poller};
use rolekeeper::platform::{ChatPlatform, DiscordClient, GatewayConfig, spawn_gateway};
use rolekeeper::roles::RoleSync;

/// Buffered gateway events before the reader applies backpressure.
const EVENT_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BotConfig::from_env().context("Failed to read environment configuration")?;
    let settings = Settings::load(&config.settings_path).with_context(|| {
        format!("Failed to load settings from {}", config.settings_path.display())
    })?;
    let tz = settings.tz()?;

    eprintln!("🤖 Rolekeeper v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Guild: {}", config.guild_id);
    eprintln!("   Rules: {}", settings.rules.len());
    eprintln!("   Sheet jobs: {}", settings.sheets.len());
    eprintln!("   HTTP: http://0.0.0.0:{}/\n", config.http_port);

    let platform: Arc<dyn ChatPlatform> =
        Arc::new(DiscordClient::new(config.token.clone(), config.guild_id));

    // ── Google credentials ───────────────────────────────────────────────
    let tokens = match &config.google_credentials {
        Some(credentials) => {
            let json = read_credentials(credentials.expose_secret())
                .context("Failed to read GOOGLE_CREDENTIALS_JSON")?;
            let key = ServiceAccountKey::from_json(&json)?;
            let source = TokenSource::new(key, &[SHEETS_SCOPE, CALENDAR_SCOPE])?;
            info!(account = %source.client_email(), "Google service account loaded");
            Some(Arc::new(source))
        }
        None => None,
    };

    let sheet_auth = match (&tokens, &config.google_api_key) {
        (Some(tokens), _) => Some(SheetAuth::ServiceAccount(Arc::clone(tokens))),
        (None, Some(key)) => Some(SheetAuth::ApiKey(key.clone())),
        (None, None) => None,
    };
    if sheet_auth.is_some() {
        settings
            .check_sheet_access(tokens.is_some())
            .context("Sheet jobs need write access")?;
    }

    // ── Role sync ────────────────────────────────────────────────────────
    let sync = Arc::new(RoleSync::new(
        Arc::clone(&platform),
        settings.rules.clone(),
        &settings.timing,
    ));

    // ── Sheet pollers ────────────────────────────────────────────────────
    let mut pollers = Vec::new();
    match &sheet_auth {
        Some(auth) => {
            for job in &settings.sheets {
                let store: Arc<dyn SheetStore> =
                    Arc::new(GoogleSheets::new(&job.spreadsheet_id, auth.clone()));
                let calendar_id = job.calendar.as_ref().and_then(|c| c.calendar_id.as_ref());
                let calendar: Option<Arc<dyn CalendarSink>> = match (&tokens, calendar_id) {
                    (Some(tokens), Some(id)) => Some(Arc::new(GoogleCalendar::new(
                        id,
                        &settings.timezone,
                        Arc::clone(tokens),
                    ))),
                    _ => None,
                };
                let notifier = SheetNotifier::new(
                    job.clone(),
                    store,
                    Arc::clone(&platform),
                    calendar,
                    tz,
                );
                pollers.push(spawn_sheet_poller(Arc::new(notifier)));
            }
        }
        None if !settings.sheets.is_empty() => {
            warn!("Sheet jobs configured but no Google credentials; notifications disabled");
        }
        None => {}
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let links = match (&settings.links, &sheet_auth) {
        (Some(layout), Some(auth)) => {
            let store: Arc<dyn SheetStore> =
                Arc::new(GoogleSheets::new(&layout.spreadsheet_id, auth.clone()));
            Some((layout.clone(), store))
        }
        _ => None,
    };
    let app = http_routes(HttpState { links, tz });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", config.http_port))?;
    info!(port = config.http_port, "HTTP server started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server stopped");
        }
    });

    // ── Gateway + dispatcher ─────────────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (gateway_handle, gateway_shutdown) = spawn_gateway(
        GatewayConfig::new(config.token.clone(), config.guild_id),
        events_tx,
    );

    let parser = CommandParser::new(&settings.command_prefix)?;
    let bot = Arc::new(Bot::new(
        sync,
        Arc::clone(&platform),
        parser,
        settings.migration.clone(),
    ));
    let bot_task = tokio::spawn(bot.run(events_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        _ = bot_task => warn!("Gateway event loop ended"),
    }

    gateway_shutdown.store(true, Ordering::Relaxed);
    gateway_handle.abort();
    for (handle, shutdown) in pollers {
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
    }

    info!("Rolekeeper stopped");
    Ok(())
}
