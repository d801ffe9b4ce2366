// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use card_ledger_server::{
    api::router,
    config::{AppConfig, LogFormat},
    crypto::{FieldCipher, StaticKeyProvider},
    currency::CurrencyWorker,
    ingest::EventConsumer,
    notify,
    providers::{ExchangeRateHostClient, InvestecClient, SqsClient},
    state::AppState,
    storage::{LedgerDatabase, ProfileDatabase, LEDGER_DB_FILE, PROFILE_DB_FILE},
    sync::{trigger_channel, LedgerSync},
};

const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_target(false).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return Err(e.into());
        }
    };
    init_tracing(config.log_format);
    info!(data_dir = %config.data_dir.display(), "Starting card ledger server");

    // Stores
    std::fs::create_dir_all(&config.data_dir)?;
    let key_provider = StaticKeyProvider::from_base64(&config.field_encryption_key)?;
    let cipher = Arc::new(FieldCipher::new(&key_provider)?);
    let ledger = Arc::new(LedgerDatabase::open(&config.data_dir.join(LEDGER_DB_FILE))?);
    let profile = Arc::new(ProfileDatabase::open(
        &config.data_dir.join(PROFILE_DB_FILE),
        cipher,
    )?);

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    // Notifications
    let (notifications, notification_rx) = notify::channel();
    workers.push(tokio::spawn(notify::log_notifications(
        notification_rx,
        shutdown.clone(),
    )));

    // Event ingestion
    match &config.queue {
        Some(queue) => {
            let client = SqsClient::new(
                &queue.url,
                queue.endpoint.as_deref(),
                &queue.consumer.receive,
            )?;
            info!(queue = client.queue_name(), "Event consumer enabled");
            let consumer = EventConsumer::new(
                Arc::new(client),
                ledger.clone(),
                profile.clone(),
                notifications,
                queue.consumer.clone(),
            );
            workers.push(tokio::spawn(consumer.run(shutdown.clone())));
        }
        None => {
            warn!("QUEUE_URL not set, event consumer disabled");
            drop(notifications);
        }
    }

    // Reconciliation
    let bank = InvestecClient::new(&config.bank_api_base_url, &config.bank_account_currency)?;
    let (sync_handle, sync_rx) = trigger_channel();
    let synchronizer = LedgerSync::new(
        ledger.clone(),
        profile.clone(),
        Arc::new(bank),
        config.sync,
        sync_rx,
    );
    workers.push(tokio::spawn(synchronizer.run(shutdown.clone())));

    // Currency lookups
    let rates = ExchangeRateHostClient::new(
        &config.exchange_rate_base_url,
        config.exchange_rate_access_key.clone(),
    )?;
    let (currency_worker, currency_handle) = CurrencyWorker::new(
        Arc::new(rates),
        &config.local_currency,
        &config.local_currency_symbol,
    );
    workers.push(tokio::spawn(currency_worker.run(shutdown.clone())));

    // Operational API
    let app = router(AppState {
        ledger,
        profile,
        sync: sync_handle,
        currency: currency_handle,
        data_dir: config.data_dir.clone(),
    });
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!(addr = %listener.local_addr()?, "Operational API listening (docs at /docs)");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let server_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await;
    shutdown.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    info!("Card ledger server stopped");

    served.map_err(Into::into)
}
