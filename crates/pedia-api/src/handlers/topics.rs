//! /topics handlers: the in-memory membership directory.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use pedia_core::{PeerId, TopicId};
use pedia_services::TopicDirectory;

use super::{non_empty, ApiError, ApiState};

#[derive(Serialize)]
pub struct MembersResponse {
    pub topic_id: String,
    pub members: Vec<String>,
}

fn members(state: &ApiState, topic: &TopicId) -> MembersResponse {
    let mut members: Vec<String> = state
        .node
        .topics
        .get_topic_members(topic)
        .iter()
        .map(|p| p.to_string())
        .collect();
    members.sort();
    MembersResponse {
        topic_id: topic.to_string(),
        members,
    }
}

pub async fn handle_topic_members(
    State(state): State<ApiState>,
    Path(topic_id): Path<String>,
) -> Result<Json<MembersResponse>, ApiError> {
    non_empty("topic id", &topic_id)?;
    Ok(Json(members(&state, &TopicId::from(topic_id.as_str()))))
}

#[derive(Debug, Deserialize)]
pub struct MemberUpdate {
    pub peer_id: String,
    #[serde(default)]
    pub remove: bool,
}

pub async fn handle_topic_update(
    State(state): State<ApiState>,
    Path(topic_id): Path<String>,
    Json(update): Json<MemberUpdate>,
) -> Result<Json<MembersResponse>, ApiError> {
    non_empty("topic id", &topic_id)?;
    non_empty("peer id", &update.peer_id)?;
    let topic = TopicId::from(topic_id.as_str());
    let peer = PeerId::from(update.peer_id.as_str());
    if update.remove {
        state.node.topics.remove_member(&topic, &peer);
        tracing::info!(topic = %topic, peer = %peer, "topic member removed");
    } else {
        state.node.topics.add_member(&topic, peer.clone());
        tracing::info!(topic = %topic, peer = %peer, "topic member added");
    }
    Ok(Json(members(&state, &topic)))
}
