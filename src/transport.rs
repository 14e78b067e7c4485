use std::collections::VecDeque;

use tokio::{
    sync::oneshot,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

use crate::{
    error::{BushidoError, Result},
    link::DeviceLink,
    protocol::{Command, Frame, FrameDecoder},
    types::RetryConfig,
};

/// A command waiting in the outgoing queue
#[derive(Debug)]
pub struct OutgoingRequest {
    command: Command,
    frame: Frame,
    completion: Option<oneshot::Sender<()>>,
}

impl OutgoingRequest {
    fn new(command: Command, completion: Option<oneshot::Sender<()>>) -> Self {
        Self {
            command,
            frame: command.to_frame(),
            completion,
        }
    }

    fn complete(self) -> Command {
        if let Some(completion) = self.completion {
            // the requester may have stopped waiting
            let _ = completion.send(());
        }
        self.command
    }
}

/// Send/receive engine owning the device link
///
/// Only one request is in flight at a time: a request is transmitted and then
/// retransmitted at the configured interval until the stick acknowledges it.
pub struct Transport<L> {
    link: L,
    queue: VecDeque<OutgoingRequest>,
    decoder: FrameDecoder,
    retry: RetryConfig,
}

impl<L: DeviceLink> Transport<L> {
    /// Create a transport over `link`
    pub fn new(link: L, retry: RetryConfig) -> Self {
        Self {
            link,
            queue: VecDeque::new(),
            decoder: FrameDecoder::new(),
            retry,
        }
    }

    /// Queue a command; the returned receiver resolves once it is acknowledged
    ///
    /// The receiver fails with `RecvError` if the request is dropped before its
    /// acknowledgment, e.g. because the session ended.
    pub fn enqueue(&mut self, command: Command) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_with(command, Some(tx));
        rx
    }

    /// Queue a command nobody waits on
    pub fn enqueue_detached(&mut self, command: Command) {
        self.enqueue_with(command, None);
    }

    pub(crate) fn enqueue_with(&mut self, command: Command, completion: Option<oneshot::Sender<()>>) {
        trace!("Queueing {:?}", command);
        self.queue.push_back(OutgoingRequest::new(command, completion));
    }

    /// Number of queued requests
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drop every queued request
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Drain the queue until empty or until a broadcast command was sent
    ///
    /// Returns the acknowledged commands in the order they were sent.
    ///
    /// # Errors
    ///
    /// Returns link errors, [`BushidoError::Checksum`] for a corrupted inbound
    /// frame, or [`BushidoError::LinkTimeout`] when a retry bound is configured
    /// and exhausted.
    pub async fn send_step(&mut self) -> Result<Vec<Command>> {
        let mut acknowledged = Vec::new();

        while let Some(request) = self.queue.pop_front() {
            let broadcast = request.command.is_broadcast();
            self.transmit_until_acked(&request.frame).await?;
            acknowledged.push(request.complete());

            if broadcast {
                break;
            }
        }

        Ok(acknowledged)
    }

    /// Read exactly one inbound frame
    ///
    /// # Errors
    ///
    /// Returns link errors or [`BushidoError::Checksum`].
    pub async fn receive_step(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let chunk = self.link.transfer_in().await?;
            self.decoder.extend(&chunk);
        }
    }

    async fn transmit_until_acked(&mut self, frame: &Frame) -> Result<()> {
        let wire = frame.encode();
        let sent_type = frame.msg_type();

        self.link.transfer_out(&wire).await?;
        let mut attempts: u32 = 1;

        let period = self.retry.ack_retry_interval;
        let mut retry = time::interval_at(Instant::now() + period, period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            while let Some(inbound) = self.decoder.next_frame()? {
                if inbound.acknowledges(sent_type) {
                    trace!("Frame {:02X} acknowledged after {} attempt(s)", sent_type, attempts);
                    return Ok(());
                }
                trace!(
                    "Discarding frame {:02X} {:02X?} while awaiting acknowledgment",
                    inbound.msg_type(),
                    inbound.payload()
                );
            }

            tokio::select! {
                chunk = self.link.transfer_in() => self.decoder.extend(&chunk?),
                _ = retry.tick() => {
                    if let Some(max) = self.retry.max_ack_attempts {
                        if attempts >= max {
                            return Err(BushidoError::LinkTimeout {
                                command: sent_type,
                                attempts,
                            });
                        }
                    }
                    attempts += 1;
                    debug!("Retransmitting frame {:02X} (attempt {})", sent_type, attempts);
                    self.link.transfer_out(&wire).await?;
                }
            }
        }
    }
}
