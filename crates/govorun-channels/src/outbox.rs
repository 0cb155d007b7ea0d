//! Per-platform outbound queue.
//!
//! A single worker consumes queued actions in submission order, which also
//! serializes sends per chat. Every action passes the platform's rate-limit
//! queue (`<platform>-send`) before it reaches the network; transient
//! failures retry with backoff. On shutdown the queue drains under a grace
//! period before the worker exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use govorun_limiter::RateLimiter;

use crate::outbound::{ChannelError, Outbound};
use crate::types::OutgoingAction;

const QUEUE_DEPTH: usize = 256;
const SEND_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 300;
const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutgoingAction>,
    platform: &'static str,
}

impl Outbox {
    /// Spawn the worker for one platform adapter.
    pub fn start(
        outbound: Arc<dyn Outbound>,
        limiter: Arc<RateLimiter>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let platform = outbound.platform();
        let handle = tokio::spawn(worker(outbound, limiter, rx, shutdown));
        (Self { tx, platform }, handle)
    }

    /// Queue an action; resolves once it is accepted (not delivered).
    pub async fn submit(&self, action: OutgoingAction) -> Result<(), ChannelError> {
        self.tx
            .send(action)
            .await
            .map_err(|_| ChannelError::Api {
                status: 0,
                message: format!("{} outbox is closed", self.platform),
            })
    }
}

async fn worker(
    outbound: Arc<dyn Outbound>,
    limiter: Arc<RateLimiter>,
    mut rx: mpsc::Receiver<OutgoingAction>,
    mut shutdown: watch::Receiver<bool>,
) {
    let platform = outbound.platform();
    let queue = format!("{platform}-send");
    info!(platform, "outbox worker started");

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(action) => deliver(&*outbound, &limiter, &queue, action).await,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(platform, "outbox draining");
                    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
                    while let Ok(Some(action)) =
                        tokio::time::timeout_at(deadline, rx.recv()).await
                    {
                        deliver(&*outbound, &limiter, &queue, action).await;
                    }
                    break;
                }
            }
        }
    }
    info!(platform, "outbox worker stopped");
}

/// One delivery with rate limiting and bounded retry. Failures are logged
/// and dropped; the worker never dies over a bad send.
async fn deliver(
    outbound: &dyn Outbound,
    limiter: &RateLimiter,
    queue: &str,
    action: OutgoingAction,
) {
    if limiter.admit(queue, None, None).await.is_err() {
        warn!(queue, "rate limiter refused admission; dropping outbound action");
        return;
    }

    for attempt in 0..SEND_ATTEMPTS {
        match outbound.apply(&action).await {
            Ok(()) => return,
            Err(e) if e.is_transient() && attempt + 1 < SEND_ATTEMPTS => {
                warn!(queue, attempt, error = %e, "transient send failure; retrying");
                tokio::time::sleep(Duration::from_millis(RETRY_BASE_MS << attempt)).await;
            }
            Err(e) => {
                error!(queue, chat = ?action.chat_id(), error = %e, "outbound action failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use govorun_core::config::RateLimiterConfig;

    use crate::outbound::{Result as ChannelResult, SentMessage};
    use crate::types::OutgoingMedia;

    /// Records every applied action; optionally fails the first N sends.
    struct Recording {
        log: Mutex<Vec<String>>,
        fail_first: Mutex<u32>,
        transient: bool,
    }

    impl Recording {
        fn new(fail_first: u32, transient: bool) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
                transient,
            }
        }

        fn maybe_fail(&self) -> ChannelResult<()> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                let status = if self.transient { 503 } else { 400 };
                return Err(ChannelError::Api {
                    status,
                    message: "scripted failure".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Outbound for Recording {
        fn platform(&self) -> &'static str {
            "test"
        }
        async fn send_text(
            &self,
            chat_id: i64,
            _topic_id: i64,
            text: &str,
            _reply_to: Option<&str>,
        ) -> ChannelResult<SentMessage> {
            self.maybe_fail()?;
            self.log.lock().unwrap().push(format!("{chat_id}:{text}"));
            Ok(SentMessage {
                message_id: "1".to_string(),
            })
        }
        async fn edit_message(&self, _: i64, _: &str, _: &str) -> ChannelResult<()> {
            Ok(())
        }
        async fn delete_messages(&self, _: i64, _: &[String]) -> ChannelResult<()> {
            Ok(())
        }
        async fn send_action(&self, _: i64, _: &str) -> ChannelResult<()> {
            Ok(())
        }
        async fn pin_message(&self, _: i64, _: &str) -> ChannelResult<()> {
            Ok(())
        }
        async fn unpin_message(&self, _: i64, _: &str) -> ChannelResult<()> {
            Ok(())
        }
        async fn send_media(
            &self,
            _: i64,
            _: i64,
            _: &OutgoingMedia,
        ) -> ChannelResult<SentMessage> {
            Ok(SentMessage {
                message_id: "m".to_string(),
            })
        }
        async fn send_media_group(
            &self,
            _: i64,
            _: i64,
            _: &[OutgoingMedia],
        ) -> ChannelResult<Vec<SentMessage>> {
            Ok(Vec::new())
        }
        async fn download_file(&self, _: &str) -> ChannelResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn answer_callback(&self, _: &str, _: &str) -> ChannelResult<()> {
            Ok(())
        }
        async fn ban_user(&self, _: i64, _: i64) -> ChannelResult<()> {
            Ok(())
        }
        async fn unban_user(&self, _: i64, _: i64) -> ChannelResult<()> {
            Ok(())
        }
        async fn chat_admins(&self, _: i64) -> ChannelResult<Vec<i64>> {
            Ok(Vec::new())
        }
    }

    fn send(chat_id: i64, text: &str) -> OutgoingAction {
        OutgoingAction::SendText {
            chat_id,
            topic_id: 0,
            text: text.to_string(),
            reply_to: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn actions_deliver_in_submission_order() {
        let outbound = Arc::new(Recording::new(0, true));
        let limiter = Arc::new(RateLimiter::new(&RateLimiterConfig::default()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbox, handle) = Outbox::start(Arc::clone(&outbound) as _, limiter, shutdown_rx);

        for i in 0..5 {
            outbox.submit(send(-100, &format!("msg {i}"))).await.unwrap();
        }
        drop(outbox);
        handle.await.unwrap();

        let log = outbound.log.lock().unwrap();
        let expected: Vec<String> = (0..5).map(|i| format!("-100:msg {i}")).collect();
        assert_eq!(*log, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_then_succeeds() {
        let outbound = Arc::new(Recording::new(2, true));
        let limiter = Arc::new(RateLimiter::new(&RateLimiterConfig::default()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbox, handle) = Outbox::start(Arc::clone(&outbound) as _, limiter, shutdown_rx);

        outbox.submit(send(-100, "persistent")).await.unwrap();
        drop(outbox);
        handle.await.unwrap();

        assert_eq!(outbound.log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_dropped_without_retry() {
        let outbound = Arc::new(Recording::new(1, false));
        let limiter = Arc::new(RateLimiter::new(&RateLimiterConfig::default()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbox, handle) = Outbox::start(Arc::clone(&outbound) as _, limiter, shutdown_rx);

        outbox.submit(send(-100, "rejected")).await.unwrap();
        outbox.submit(send(-100, "next")).await.unwrap();
        drop(outbox);
        handle.await.unwrap();

        // First action dropped after one fatal error; second still delivered.
        assert_eq!(*outbound.log.lock().unwrap(), vec!["-100:next".to_string()]);
    }
}
