//! Executes one control-protocol invocation against an in-process handler.

use std::sync::Arc;

use agent_relay_core::{
    AgentMessage, AgentStream, Handler, HandlerError, HandlerMethod, RunRequest,
};
use futures::{StreamExt, stream};
use serde_json::Value;

use crate::protocol::RunPayload;

/// Run `method` on `handler` and express the outcome as a message stream.
///
/// `run` streams the handler's messages. `undo`/`redo` yield a single
/// `Done` or `Error`. `abort` yields nothing.
///
/// # Errors
/// Returns an error if a `run` payload cannot be decoded.
pub async fn dispatch(
    handler: Arc<dyn Handler>,
    method: HandlerMethod,
    session_id: &str,
    payload: Value,
) -> Result<AgentStream, HandlerError> {
    match method {
        HandlerMethod::Run => {
            let RunPayload { prompt, options } = serde_json::from_value(payload)
                .map_err(|err| HandlerError::Failed(format!("invalid run payload: {err}")))?;
            let request = RunRequest::new(session_id, prompt).with_options(options);
            Ok(handler.run(request).await)
        }
        HandlerMethod::Abort => {
            handler.abort(session_id).await;
            Ok(stream::empty().boxed())
        }
        HandlerMethod::Undo | HandlerMethod::Redo => {
            let target = (!session_id.is_empty()).then_some(session_id);
            let result = if method == HandlerMethod::Undo {
                handler.undo(target).await
            } else {
                handler.redo(target).await
            };
            let message = match result {
                Ok(()) => AgentMessage::Done,
                Err(err) => AgentMessage::error(err.to_string()),
            };
            Ok(stream::once(async move { message }).boxed())
        }
    }
}

/// Collapse an `undo`/`redo` stream into its result.
pub(crate) async fn replay_result(mut stream: AgentStream) -> Result<(), HandlerError> {
    while let Some(message) = stream.next().await {
        match message {
            AgentMessage::Done => return Ok(()),
            AgentMessage::Error(text) => return Err(HandlerError::Failed(text)),
            AgentMessage::Status(_) => {}
        }
    }
    Err(HandlerError::Failed("handler ended without a result".into()))
}
