use std::sync::Arc;

use serde_json::json;

use crate::models::{CloseReason, PositionEvent};
use crate::services::broadcaster::{Subscription, UpdateBroadcaster};

/// Telegram notification service. Failures are logged but never block the main flow.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
        }
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }

    /// Forward close and liquidation events to Telegram. Each send runs on
    /// its own task so the publisher never waits on the network.
    pub fn subscribe(self: &Arc<Self>, broadcaster: &UpdateBroadcaster) -> Subscription {
        let notifier = Arc::clone(self);
        broadcaster.subscribe(move |event| {
            let Some(message) = format_position_close(event) else {
                return Ok(());
            };
            let runtime = tokio::runtime::Handle::try_current()?;
            let notifier = notifier.clone();
            runtime.spawn(async move {
                notifier.send(&message).await;
            });
            Ok(())
        })
    }
}

/// Format a close notification. Opens and updates are not notified.
pub fn format_position_close(event: &PositionEvent) -> Option<String> {
    let reason = event.reason?;
    let p = &event.position;
    let title = match reason {
        CloseReason::Liquidation => "*Position Liquidated*",
        CloseReason::TakeProfit => "*Take Profit Hit*",
        CloseReason::StopLoss => "*Stop Loss Hit*",
        CloseReason::Manual => "*Position Closed*",
        CloseReason::Reversal => "*Position Reversed*",
    };

    Some(format!(
        "{}\nOwner: `{}`\nPair: {}\nSide: {} {}x\nEntry: {}\nExit: {}\nPnL: {}\nReturned: {} {}",
        title,
        p.owner_id,
        p.pair(),
        p.side,
        p.leverage.normalize(),
        p.entry_price.normalize(),
        p.exit_price.map(|d| d.normalize().to_string()).unwrap_or_else(|| "-".into()),
        p.realized_pnl.unwrap_or_default().round_dp(2),
        event.settlement.unwrap_or_default().round_dp(2),
        p.base_currency,
    ))
}
