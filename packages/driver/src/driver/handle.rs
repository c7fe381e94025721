use super::awaited::Predicate;
use super::transaction::Priority;
use super::{
    Driver, DriverInput, SendCommandOptions, SendCommandStatus, SendMessageOptions,
};
use crate::error::{Error, Result};
use futures::channel::oneshot;
use futures_timer::Delay;
use std::time::Duration;
use zwh_cc::prelude::*;
use zwh_core::prelude::*;
use zwh_logging::{LocalImmutableLogger, LogInfo, Loglevel};
use zwh_serial::prelude::*;

/// The startup backoff between controller identification attempts
const STARTUP_BACKOFF: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
];

/// How many nonce handshakes a single send may trigger before giving up
const MAX_NONCE_HANDSHAKES: u8 = 2;

impl Driver {
    fn dispatch(&self, input: DriverInput) -> Result<()> {
        self.input_tx
            .clone()
            .try_send(input)
            .map_err(|_| Error::Destroyed)
    }

    /// Enqueues a message as a transaction and awaits its result: the final
    /// message of the exchange, after retries.
    pub async fn send_message(
        &self,
        message: Message,
        options: SendMessageOptions,
    ) -> Result<Option<Message>> {
        let (result_tx, result_rx) = oneshot::channel();
        let (status_tx, status_rx) = oneshot::channel();
        self.dispatch(DriverInput::EnqueueTransaction {
            message,
            options,
            result_tx,
            status_tx,
        })?;
        status_rx.await.map_err(|_| Error::Destroyed)??;
        result_rx.await.map_err(|_| Error::Destroyed)?
    }

    /// Sends a command class to a node, applying the encapsulation the node
    /// requires, and returns the node's response when the command expects
    /// one. Security handshakes happen transparently.
    pub async fn send_command(
        &self,
        command: CC,
        destination: NodeId,
        options: SendCommandOptions,
    ) -> Result<Option<CC>> {
        if !self.storage.is_ready() {
            return Err(Error::NotReady);
        }

        // Register the response awaiter first, so a fast node cannot race
        // past us
        let awaited = if command.expects_response() {
            let matcher = command.clone();
            Some(self.awaited_ccs.add(
                Box::new(move |cc: &WithAddress<CC>| {
                    cc.address().source_node_id == destination
                        && matcher.test_response(cc.as_ref())
                }),
                Some(self.options.timeouts.report),
            ))
        } else {
            None
        };

        let mut handshakes = 0u8;
        loop {
            let (result_tx, result_rx) = oneshot::channel();
            let (status_tx, status_rx) = oneshot::channel();
            self.dispatch(DriverInput::EncapsulateAndSend {
                command: command.clone(),
                destination,
                options: options.clone(),
                result_tx,
                status_tx,
            })?;

            match status_rx.await.map_err(|_| Error::Destroyed)?? {
                SendCommandStatus::Enqueued => {
                    // Await radio-level delivery
                    result_rx.await.map_err(|_| Error::Destroyed)??;
                    break;
                }
                SendCommandStatus::NeedsS0Nonce => {
                    handshakes += 1;
                    if handshakes > MAX_NONCE_HANDSHAKES {
                        return Err(Error::Failed("S0 nonce handshake failed".to_string()));
                    }
                    self.request_nonce(destination, false).await?;
                }
                SendCommandStatus::NeedsS2Nonce => {
                    handshakes += 1;
                    if handshakes > MAX_NONCE_HANDSHAKES {
                        return Err(Error::Failed("S2 nonce handshake failed".to_string()));
                    }
                    self.request_nonce(destination, true).await?;
                }
            }
        }

        match awaited {
            Some(awaited) => Ok(Some(awaited.try_await().await?.unwrap())),
            None => Ok(None),
        }
    }

    /// Performs the Nonce Get/Report round trip that precedes a secure
    /// transmission. The dispatcher stores the received nonce material, so
    /// a subsequent encapsulation attempt will find it.
    async fn request_nonce(&self, destination: NodeId, s2: bool) -> Result<()> {
        let awaited = self.awaited_ccs.add(
            Box::new(move |cc: &WithAddress<CC>| {
                cc.address().source_node_id == destination
                    && match (s2, cc.as_ref()) {
                        (false, CC::SecurityCCNonceReport(_)) => true,
                        (true, CC::Security2CCNonceReport(_)) => true,
                        _ => false,
                    }
            }),
            Some(self.options.timeouts.nonce),
        );

        let (result_tx, result_rx) = oneshot::channel();
        self.dispatch(DriverInput::SendNonceGet {
            destination,
            s2,
            result_tx,
        })?;
        result_rx.await.map_err(|_| Error::Destroyed)??;

        awaited.try_await().await.map(|_| ())
    }

    /// Waits for a message matching the predicate. Awaiters are checked in
    /// insertion order before the unsolicited handlers run.
    pub async fn wait_for_message(
        &self,
        predicate: Predicate<Message>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.awaited_messages.add(predicate, timeout).try_await().await
    }

    /// Waits for a command class matching the predicate
    pub async fn wait_for_command(
        &self,
        predicate: Predicate<WithAddress<CC>>,
        timeout: Option<Duration>,
    ) -> Result<WithAddress<CC>> {
        self.awaited_ccs.add(predicate, timeout).try_await().await
    }

    /// Registers a handler for unsolicited requests of one function type.
    /// Handlers run in registration order until one returns true; one-shot
    /// handlers remove themselves after a successful run.
    pub fn register_request_handler(
        &self,
        function_type: FunctionType,
        handler: super::RequestHandler,
        once: bool,
    ) -> Result<()> {
        self.dispatch(DriverInput::RegisterRequestHandler {
            function_type,
            handler,
            once,
        })
    }

    /// Probes a node with a No Operation command. Returns whether it answered.
    pub async fn ping(&self, node_id: NodeId) -> Result<bool> {
        let options = SendCommandOptions {
            priority: Some(Priority::Ping),
            ..Default::default()
        };
        match self
            .send_command(NoOperationCC::default().into(), node_id, options)
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::NodeTimeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Supplies externally known facts about a node (normally the interview
    /// fills these in)
    pub fn setup_node(&self, node_id: NodeId, config: super::NodeConfig) -> Result<()> {
        self.dispatch(DriverInput::SetupNode { node_id, config })
    }

    /// Removes a node from the network state: all of its queued work is
    /// rejected, sessions and nonce tables are purged.
    pub fn remove_node(&self, node_id: NodeId) -> Result<()> {
        self.dispatch(DriverInput::RemoveNode { node_id })
    }

    pub fn pause_sends(&self) -> Result<()> {
        self.dispatch(DriverInput::PauseSends)
    }

    pub fn resume_sends(&self) -> Result<()> {
        self.dispatch(DriverInput::ResumeSends)
    }

    pub fn is_ready(&self) -> bool {
        self.storage.is_ready()
    }

    /// The startup sequence: optionally soft-reset the controller and wait
    /// for the Serial API to come back, then identify the controller, enable
    /// security and open the caches.
    pub async fn init(&self) -> Result<()> {
        if self.options.enable_soft_reset {
            // Register the awaiter before the reset goes out
            let awaited = self.awaited_messages.add(
                Box::new(|message: &Message| {
                    matches!(message, Message::SerialApiStartedRequest(_))
                }),
                Some(self.options.timeouts.serial_api_started),
            );

            // Pause the queue once the reset is dispatched, so nothing
            // collides with the controller reboot
            let options = SendMessageOptions {
                priority: Some(Priority::Controller),
                pause_after_dispatch: true,
                ..Default::default()
            };
            self.send_message(SoftResetRequest::default().into(), options)
                .await?;

            // Some controllers never announce themselves; proceed after the
            // timeout and let the identification below decide
            let _ = awaited.try_await().await;
            self.dispatch(DriverInput::ResumeSends)?;
        }

        // Identify the controller, backing off between attempts while it is
        // still starting up
        let version = {
            let mut attempt = 0usize;
            loop {
                let result = self
                    .send_message(
                        GetControllerVersionRequest::default().into(),
                        SendMessageOptions {
                            priority: Some(Priority::Controller),
                            ..Default::default()
                        },
                    )
                    .await;
                match result {
                    Ok(Some(Message::GetControllerVersionResponse(version))) => break version,
                    Ok(_) => return Err(Error::Internal),
                    Err(e) => {
                        if attempt >= STARTUP_BACKOFF.len() {
                            return Err(e);
                        }
                        Delay::new(STARTUP_BACKOFF[attempt]).await;
                        attempt += 1;
                    }
                }
            }
        };
        self.storage.set_library_version(version.library_version);

        let ids = self
            .send_message(
                GetControllerIdRequest::default().into(),
                SendMessageOptions {
                    priority: Some(Priority::Controller),
                    ..Default::default()
                },
            )
            .await?;
        let Some(Message::GetControllerIdResponse(ids)) = ids else {
            return Err(Error::Internal);
        };
        self.storage.set_home_id(ids.home_id);
        self.storage.set_own_node_id(ids.own_node_id);

        self.dispatch(DriverInput::InitSecurityManagers)?;
        self.dispatch(DriverInput::OpenCache)?;
        self.dispatch(DriverInput::MarkReady)?;
        Ok(())
    }

    /// Tears the driver down: the scheduler is cancelled first, timers
    /// drain, then persistence flushes and closes.
    pub async fn destroy(&self) -> Result<()> {
        let (callback, done) = oneshot::channel();
        self.dispatch(DriverInput::Destroy { callback })?;
        let _ = done.await;
        Ok(())
    }
}

impl LocalImmutableLogger for Driver {
    fn log(&self, log: LogInfo, level: Loglevel) {
        let _ = self.dispatch(DriverInput::Log { log, level });
    }

    fn log_level(&self) -> Loglevel {
        Loglevel::Debug
    }

    fn set_log_level(&self, _level: Loglevel) {}
}
