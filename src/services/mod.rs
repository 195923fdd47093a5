pub mod broadcaster;
pub mod liquidation_monitor;
pub mod notifier;
pub mod position_index;

pub use broadcaster::{Subscription, UpdateBroadcaster};
pub use liquidation_monitor::{LiquidationMonitor, MonitorConfig, MonitorState};
pub use notifier::Notifier;
pub use position_index::PositionIndex;
