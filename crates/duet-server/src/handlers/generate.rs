use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use duet_core::{GenerateOptions, Generation};
use futures::{Stream, StreamExt as _};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::ApiResult;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: GenerateOptions,
}

/// Streams a generation as server-sent events.
///
/// Emits one `chunk` event per chunk, then exactly one of `done`
/// (`{conversationId}`) or `error` (`{message}`).
pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Generation {
        conversation_id,
        stream,
    } = state.generator.generate(&request.prompt, request.options)?;
    debug!(%conversation_id, "streaming generation");

    let events = async_stream::stream! {
        let chunks = stream.into_stream();
        futures::pin_mut!(chunks);
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => yield Ok(json_event("chunk", &chunk)),
                Err(err) => {
                    yield Ok(json_event("error", &json!({ "message": err.to_string() })));
                    return;
                }
            }
        }
        yield Ok(json_event("done", &json!({ "conversationId": conversation_id })));
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn json_event(name: &str, data: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|err| {
            warn!(event = name, error = %err, "failed to encode event");
            Event::default().event(name).data("null")
        })
}
