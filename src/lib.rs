pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod services;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::api::ws_types::WsMessage;
use crate::config::AppConfig;
use crate::db::Store;
use crate::execution::PositionEngine;
use crate::services::{LiquidationMonitor, Notifier, PositionIndex, Subscription, UpdateBroadcaster};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PositionEngine>,
    pub monitor: Arc<LiquidationMonitor>,
    pub config: AppConfig,
    pub ws_tx: broadcast::Sender<WsMessage>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub notifier: Option<Arc<Notifier>>,
    /// Keeps the broadcaster listeners (WebSocket fan-out, notifier) alive.
    pub subscriptions: Arc<Vec<Subscription>>,
}

impl AppState {
    /// Wire engine, index, broadcaster and monitor over `store`. The
    /// monitor is created stopped.
    pub fn build(
        store: Arc<dyn Store>,
        config: AppConfig,
        metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Self {
        let broadcaster = UpdateBroadcaster::new();
        let engine = Arc::new(PositionEngine::new(
            store,
            Arc::new(PositionIndex::new()),
            broadcaster.clone(),
            config.engine_config(),
        ));
        let monitor = Arc::new(LiquidationMonitor::new(engine.clone(), config.monitor_config()));

        let (ws_tx, _) = broadcast::channel::<WsMessage>(256);
        let mut subscriptions = Vec::new();

        let tx = ws_tx.clone();
        subscriptions.push(broadcaster.subscribe(move |event| {
            // No connected clients is not a failure.
            let _ = tx.send(WsMessage::from(event));
            Ok(())
        }));

        let notifier = match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) if config.has_telegram() => {
                let notifier = Arc::new(Notifier::new(token.clone(), chat_id.clone()));
                subscriptions.push(notifier.subscribe(&broadcaster));
                Some(notifier)
            }
            _ => None,
        };

        Self {
            engine,
            monitor,
            config,
            ws_tx,
            metrics_handle,
            notifier,
            subscriptions: Arc::new(subscriptions),
        }
    }
}
