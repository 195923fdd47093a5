use serde::Serialize;

use crate::models::{CloseReason, Position, PositionAction, PositionEvent};

/// Messages broadcast to all connected WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    #[serde(rename = "position_update")]
    PositionUpdate(PositionUpdate),
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionUpdate {
    pub action: PositionAction,
    pub reason: Option<CloseReason>,
    pub is_liquidation: bool,
    pub position: Position,
}

impl From<&PositionEvent> for WsMessage {
    fn from(event: &PositionEvent) -> Self {
        WsMessage::PositionUpdate(PositionUpdate {
            action: event.action,
            reason: event.reason,
            is_liquidation: event.is_liquidation,
            position: event.position.clone(),
        })
    }
}
