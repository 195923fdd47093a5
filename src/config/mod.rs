use rust_decimal::Decimal;
use std::env;
use std::time::Duration;

use crate::execution::EngineConfig;
use crate::ingestion::ReconnectPolicy;
use crate::services::MonitorConfig;

const DEFAULT_PRICE_FEED_URL: &str = "wss://stream.binance.com:9443/ws";
const DEFAULT_PRICE_FEED_STREAM: &str = "!miniTicker@arr";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Unset runs the engine on the in-memory store.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,

    // Price feed
    pub price_feed_url: String,
    pub price_feed_stream: String,
    pub price_feed_enabled: bool,
    pub feed_reconnect_delay_secs: u64,
    pub feed_max_connection_age_secs: u64,
    pub index_refresh_interval_secs: u64,

    // Engine
    pub fee_percentage: Decimal,
    pub max_leverage: Decimal,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub notifications_enabled: bool,

    pub api_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "0.0.0.0".into(),
            port: 8080,
            price_feed_url: DEFAULT_PRICE_FEED_URL.into(),
            price_feed_stream: DEFAULT_PRICE_FEED_STREAM.into(),
            price_feed_enabled: true,
            feed_reconnect_delay_secs: 5,
            feed_max_connection_age_secs: 84_600,
            index_refresh_interval_secs: 60,
            fee_percentage: Decimal::new(1, 1),
            max_leverage: Decimal::from(125),
            telegram_bot_token: None,
            telegram_chat_id: None,
            notifications_enabled: false,
            api_token: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,

            price_feed_url: env::var("PRICE_FEED_URL").unwrap_or(defaults.price_feed_url),
            price_feed_stream: env::var("PRICE_FEED_STREAM").unwrap_or(defaults.price_feed_stream),
            price_feed_enabled: parse_or("PRICE_FEED_ENABLED", defaults.price_feed_enabled),
            feed_reconnect_delay_secs: parse_or(
                "FEED_RECONNECT_DELAY_SECS",
                defaults.feed_reconnect_delay_secs,
            ),
            feed_max_connection_age_secs: parse_or(
                "FEED_MAX_CONNECTION_AGE_SECS",
                defaults.feed_max_connection_age_secs,
            ),
            index_refresh_interval_secs: parse_or(
                "INDEX_REFRESH_INTERVAL_SECS",
                defaults.index_refresh_interval_secs,
            ),

            fee_percentage: parse_or("FEE_PERCENTAGE", defaults.fee_percentage),
            max_leverage: parse_or("MAX_LEVERAGE", defaults.max_leverage),

            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty("TELEGRAM_CHAT_ID"),
            notifications_enabled: parse_or("NOTIFICATIONS_ENABLED", defaults.notifications_enabled),

            api_token: non_empty("API_TOKEN"),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            fee_percentage: self.fee_percentage,
            max_leverage: self.max_leverage,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            refresh_interval: Duration::from_secs(self.index_refresh_interval_secs.max(1)),
            reconnect: ReconnectPolicy {
                delay: Duration::from_secs(self.feed_reconnect_delay_secs),
                max_connection_age: Duration::from_secs(self.feed_max_connection_age_secs),
            },
        }
    }

    /// Returns true if Telegram notifications are enabled and configured.
    pub fn has_telegram(&self) -> bool {
        self.notifications_enabled
            && self.telegram_bot_token.is_some()
            && self.telegram_chat_id.is_some()
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.fee_percentage, Decimal::new(1, 1));
        assert_eq!(config.max_leverage, Decimal::from(125));
        assert!(!config.has_telegram());

        let monitor = config.monitor_config();
        assert_eq!(monitor.reconnect.delay, Duration::from_secs(5));
        assert_eq!(monitor.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_has_telegram_requires_flag_and_credentials() {
        let mut config = AppConfig {
            telegram_bot_token: Some("token".into()),
            telegram_chat_id: Some("42".into()),
            ..AppConfig::default()
        };
        assert!(!config.has_telegram());
        config.notifications_enabled = true;
        assert!(config.has_telegram());
    }
}
