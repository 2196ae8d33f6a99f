//! Async request/reply client
//!
//! Registers itself with the engine as an external caller and turns each
//! request into a future resolved by the engine's reply delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use super::correlator::{CallerId, Origin, ReplyAction, ReplyStatus};
use super::engine::{Engine, Reply, ReplySink};
use super::message::Message;
use super::records::RcChannels;
use super::scheduler::Dispatch;
use super::{Function, ProtocolError};

type PendingReplies = Arc<Mutex<HashMap<u32, oneshot::Sender<Reply>>>>;

struct ClientSink {
    pending: PendingReplies,
}

impl ReplySink for ClientSink {
    fn deliver(&self, reply: Reply) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reply.context);
        match sender {
            // The receiver may already be gone if the request was cancelled
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(context = reply.context, "Reply for abandoned request"),
        }
    }
}

/// Flight controller client bound to one engine
///
/// Replies arrive only while something drives [`Engine::on_tick`]; without
/// ticks a lost reply is never turned into a timeout.
pub struct FcClient {
    engine: Arc<Engine>,
    caller: CallerId,
    pending: PendingReplies,
    next_context: AtomicU32,
}

impl FcClient {
    /// Register a new caller with `engine`
    pub fn attach(engine: &Arc<Engine>) -> Self {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let caller = engine.attach_caller(Arc::new(ClientSink {
            pending: pending.clone(),
        }));
        Self {
            engine: engine.clone(),
            caller,
            pending,
            next_context: AtomicU32::new(1),
        }
    }

    /// Id the engine routes this client's replies by
    pub fn caller(&self) -> CallerId {
        self.caller
    }

    /// Requests still waiting for a reply
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send `message` and wait for its reply
    ///
    /// Error replies and timeouts come back as `Err`.
    pub async fn request(&self, message: Message) -> Result<Reply, ProtocolError> {
        let function = message.function();
        let context = self.next_context.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(context, tx);

        if let Err(e) = self.engine.submit(
            message,
            Origin::External(self.caller),
            context,
            ReplyAction::Reply,
        ) {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&context);
            return Err(e);
        }

        let reply = rx
            .await
            .map_err(|_| ProtocolError::ReplyDropped { function })?;

        match reply.status {
            ReplyStatus::Ok => Ok(reply),
            ReplyStatus::Error => Err(ProtocolError::ErrorReply { function }),
            ReplyStatus::Timeout => Err(ProtocolError::Timeout { function }),
        }
    }

    /// Send `message` without waiting for, or hearing about, its reply
    pub fn send(&self, message: Message) -> Result<Dispatch, ProtocolError> {
        self.engine.submit(
            message,
            Origin::External(self.caller),
            0,
            ReplyAction::Ignore,
        )
    }

    /// Push RC channel values
    pub fn set_raw_rc(&self, channels: &RcChannels) -> Result<Dispatch, ProtocolError> {
        let message = Message::request(Function::MSP_SET_RAW_RC, &channels.to_payload())?;
        self.send(message)
    }
}

impl Drop for FcClient {
    fn drop(&mut self) {
        self.engine.detach_caller(self.caller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::config::EngineConfig;
    use crate::protocol::engine::{NullObserver, Transport};
    use crate::protocol::message::Direction;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    impl Transport for Recorder {
        fn transmit(&self, line: usize, frame: &[u8]) {
            self.frames.lock().unwrap().push((line, frame.to_vec()));
        }
    }

    fn setup() -> (Arc<Engine>, Arc<Recorder>) {
        let transport = Arc::new(Recorder::default());
        let config = EngineConfig {
            lines: 1,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, transport.clone(), Arc::new(NullObserver)).unwrap();
        (engine, transport)
    }

    async fn wait_for_frames(transport: &Recorder, count: usize) {
        for _ in 0..100 {
            if transport.frames.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request was never transmitted");
    }

    #[tokio::test]
    async fn test_request_resolves_on_reply() {
        let (engine, transport) = setup();
        let client = Arc::new(FcClient::attach(&engine));

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Message::new(Function::MSP_ALTITUDE)).await })
        };
        wait_for_frames(&transport, 1).await;

        let mut reply = Message::request(Function::MSP_ALTITUDE, &[1, 0, 0, 0]).unwrap();
        reply.set_direction(Direction::Response);
        engine.deliver_bytes(0, &reply.encode().unwrap()).unwrap();

        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.message.payload(), &[1, 0, 0, 0]);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (engine, transport) = setup();
        let client = Arc::new(FcClient::attach(&engine));

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Message::new(Function::MSP_STATUS)).await })
        };
        wait_for_frames(&transport, 1).await;
        engine.on_tick(Instant::now() + Duration::from_secs(2));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Timeout {
                function: Function::MSP_STATUS
            }
        ));
    }

    #[tokio::test]
    async fn test_error_reply() {
        let (engine, transport) = setup();
        let client = Arc::new(FcClient::attach(&engine));

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Message::new(Function::MSP_RAW_IMU)).await })
        };
        wait_for_frames(&transport, 1).await;

        let mut reply = Message::new(Function::MSP_RAW_IMU);
        reply.set_direction(Direction::Error);
        engine.deliver_bytes(0, &reply.encode().unwrap()).unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(ProtocolError::ErrorReply { .. })
        ));
    }

    #[test]
    fn test_set_raw_rc_is_fire_and_forget() {
        let (engine, transport) = setup();
        let client = FcClient::attach(&engine);
        let mut channels = RcChannels::centered();
        channels.set(2, 1000);

        assert_eq!(
            client.set_raw_rc(&channels).unwrap(),
            Dispatch::Sent { line: 0 }
        );
        let frames = transport.frames.lock().unwrap();
        let (decoded, _) = Message::decode(&frames[0].1, 0).unwrap();
        assert_eq!(decoded.function(), Function::MSP_SET_RAW_RC);
        assert_eq!(decoded.payload(), channels.to_payload().as_slice());
        assert_eq!(client.pending(), 0);
    }
}
