use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::ws::handler::validate_room;
use axum::{
    extract::{Path, State},
    Json,
};
use parley_protocol::PresenceRecord;

pub async fn list_participants(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<Vec<PresenceRecord>>> {
    let room = validate_room(Some(room))?;
    let participants = state.presence.participants(&room).await;

    if participants.is_empty() {
        return Err(AppError::NotFound(format!("Room {} has no participants", room)));
    }

    Ok(Json(participants))
}
