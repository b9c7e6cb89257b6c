use crate::engine::docker_api::DockerClient;
use crate::engine::transport::ByteStream;
use crate::engine::{EventSubscription, LifecycleEvent, RoleMatcher};
use crate::error::ProxyError;
use crate::parsers::event_types::EngineEvent;
use crate::parsers::ndjson::NdjsonBuffer;
use futures_util::StreamExt;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Why a single event stream stopped.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    /// Nobody is listening any more.
    ReceiverGone,
    Failed(ProxyError),
}

/// Spawn the background task feeding an [`EventSubscription`].
///
/// The task reopens the engine's event stream after every failure,
/// reporting each failure on the error channel, and exits once the
/// event receiver has been dropped.
pub(crate) fn spawn_event_pump(client: DockerClient) -> EventSubscription {
    let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (error_tx, errors) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        loop {
            let end = match client.open_event_stream().await {
                Ok(resp) => {
                    tracing::info!("Subscribed to engine events");
                    forward_events(resp.body, client.roles(), &event_tx).await
                }
                Err(e) => StreamEnd::Failed(e),
            };

            match end {
                StreamEnd::ReceiverGone => break,
                StreamEnd::Failed(e) => {
                    // A full or closed error channel must not stall reconnection.
                    let _ = error_tx.try_send(e);
                }
            }

            if event_tx.is_closed() {
                break;
            }
            tokio::time::sleep(client.reconnect_delay()).await;
        }
        tracing::debug!("Event pump stopped");
    });

    EventSubscription { events, errors }
}

/// Decode one NDJSON event stream and forward every record until it ends.
pub(crate) async fn forward_events(
    mut body: ByteStream,
    roles: &RoleMatcher,
    tx: &mpsc::Sender<LifecycleEvent>,
) -> StreamEnd {
    let mut buffer = NdjsonBuffer::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return StreamEnd::Failed(e),
        };
        for line in buffer.push(&chunk) {
            let event: EngineEvent = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Skipping malformed engine event: {e}");
                    continue;
                }
            };
            if tx.send(event.into_lifecycle(roles)).await.is_err() {
                return StreamEnd::ReceiverGone;
            }
        }
    }

    StreamEnd::Failed(ProxyError::EngineUnavailable(
        "engine event stream ended".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ActorRole, EventAction};
    use futures_util::stream;
    use hyper::body::Bytes;

    fn body(chunks: Vec<&'static str>) -> ByteStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes()))),
        )
        .boxed()
    }

    fn roles() -> RoleMatcher {
        RoleMatcher::new("com.massgrid.type", false)
    }

    #[tokio::test]
    async fn forwards_decoded_events_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let end = forward_events(
            body(vec![
                r#"{"Type":"container","Action":"start","Actor":{"ID":"w1","Attributes":{"com.massgrid.type":"worker"}}}"#,
                "\n{\"Type\":\"container\",\"Action\":\"kill\",\"Actor\":",
                r#"{"ID":"p1","Attributes":{"com.massgrid.type":"proxy"}}}"#,
                "\n",
            ]),
            &roles(),
            &tx,
        )
        .await;

        assert!(matches!(end, StreamEnd::Failed(ProxyError::EngineUnavailable(_))));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.action, EventAction::Start);
        assert_eq!(first.actor_role, ActorRole::Worker);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.action, EventAction::Kill);
        assert_eq!(second.actor_role, ActorRole::Proxy);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (tx, mut rx) = mpsc::channel(8);
        forward_events(
            body(vec!["garbage\n", "{\"Type\":\"container\",\"Action\":\"destroy\"}\n"]),
            &roles(),
            &tx,
        )
        .await;
        assert_eq!(rx.recv().await.unwrap().action, EventAction::Destroy);
    }

    #[tokio::test]
    async fn stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let end = forward_events(
            body(vec!["{\"Type\":\"container\",\"Action\":\"start\"}\n"]),
            &roles(),
            &tx,
        )
        .await;
        assert!(matches!(end, StreamEnd::ReceiverGone));
    }

    #[tokio::test]
    async fn stream_error_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let failing: ByteStream = stream::iter(vec![Err(ProxyError::EngineUnavailable(
            "connection reset".into(),
        ))])
        .boxed();
        match forward_events(failing, &roles(), &tx).await {
            StreamEnd::Failed(ProxyError::EngineUnavailable(msg)) => {
                assert_eq!(msg, "connection reset")
            }
            other => panic!("unexpected end: {other:?}"),
        }
    }
}
