//! Callback acknowledgement. Every callback id gets exactly one answer
//! (the adapter's guard enforces uniqueness) within the platform's timeout
//! window, so the acknowledgement goes out before any heavier work.

use async_trait::async_trait;
use tracing::debug;

use govorun_channels::types::{EventKind, IncomingEvent, OutgoingAction};

use crate::app::App;
use crate::error::Result;
use crate::handlers::{Flow, Handler};
use crate::settings::ResolvedSettings;

pub struct CallbackAck;

#[async_trait]
impl Handler for CallbackAck {
    fn name(&self) -> &'static str {
        "callback-ack"
    }

    fn matches(&self, event: &IncomingEvent, _settings: &ResolvedSettings) -> bool {
        matches!(event.kind, EventKind::Callback { .. })
    }

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        _settings: &ResolvedSettings,
    ) -> Result<Flow> {
        let EventKind::Callback { callback_id, data } = &event.kind else {
            return Ok(Flow::Continue);
        };
        debug!(callback_id = %callback_id, data = %data, "callback received");
        app.platform(&event.platform)?
            .outbox
            .submit(OutgoingAction::AnswerCallback {
                callback_id: callback_id.clone(),
                text: String::new(),
            })
            .await?;
        Ok(Flow::Halt)
    }
}
