//! Depth of every slot queue.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

#[derive(Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<QueueInfo>,
}

#[derive(Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub exists: bool,
    pub ready: usize,
    pub in_flight: usize,
    pub dead: usize,
}

pub async fn handle_queues(State(state): State<ApiState>) -> Json<QueuesResponse> {
    let queues = state
        .topology
        .all_queues()
        .into_iter()
        .map(|name| {
            let depth = state.broker.depth(&name);
            let d = depth.unwrap_or_default();
            QueueInfo {
                name,
                exists: depth.is_some(),
                ready: d.ready,
                in_flight: d.in_flight,
                dead: d.dead,
            }
        })
        .collect();

    Json(QueuesResponse { queues })
}
