//! End-to-end broker flows over the scriptable mock transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flotilla::transport::mock::MockFactory;
use flotilla::transport::{NegotiationState, TransportEvent, TransportFactory};
use flotilla::{
    ConnectOptions, DataEvent, MediaEvent, MediaStream, Payload, Session, SessionConfig,
    SessionEvent,
};

fn session_with_mock() -> (
    Arc<Session>,
    tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    Arc<MockFactory>,
) {
    let factory = Arc::new(MockFactory::new());
    let (session, events) = Session::builder()
        .config(SessionConfig::with_endpoint("relay.test", 9000, "/"))
        .id("local-peer")
        .transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();
    (session, events, factory)
}

async fn next_data_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<DataEvent>,
) -> DataEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event within a second")
        .expect("event stream alive")
}

#[tokio::test]
async fn dial_open_send_and_receive() {
    let (session, _session_events, factory) = session_with_mock();

    let connection = session
        .connect("remote-peer", ConnectOptions::default())
        .await
        .expect("connect");
    let mut events = connection.take_events().expect("events");

    let transport = factory.transport(0).expect("transport minted");
    assert!(transport.committed_local().is_some());
    assert!(transport.channel_request().is_some());

    // The transport reports its channel up; the connection opens.
    transport.emit(TransportEvent::ChannelOpen);
    assert!(matches!(next_data_event(&mut events).await, DataEvent::Open));
    assert!(connection.is_open());

    connection
        .send(Payload::Text("ahoy".into()))
        .await
        .expect("send");
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);

    // Loop the encoded bytes back as if the remote had sent them.
    transport.emit(TransportEvent::Data(sent[0].clone()));
    match next_data_event(&mut events).await {
        DataEvent::Data(Payload::Text(text)) => assert_eq!(text, "ahoy"),
        other => panic!("expected text payload, got {other:?}"),
    }
}

#[tokio::test]
async fn large_payload_round_trips_through_chunks() {
    let (session, _session_events, factory) = session_with_mock();
    let connection = session
        .connect("remote-peer", ConnectOptions::default())
        .await
        .expect("connect");
    let mut events = connection.take_events().expect("events");
    let transport = factory.transport(0).expect("transport");
    transport.emit(TransportEvent::ChannelOpen);
    assert!(matches!(next_data_event(&mut events).await, DataEvent::Open));

    let blob = Payload::Bytes(Bytes::from(vec![0xABu8; 100_000]));
    connection.send(blob.clone()).await.expect("send");
    let sent = transport.sent();
    assert!(sent.len() > 1, "payload should have been chunked");

    // Replay the chunks in reverse; reassembly is order-independent.
    for bytes in sent.iter().rev() {
        transport.emit(TransportEvent::Data(bytes.clone()));
    }
    match next_data_event(&mut events).await {
        DataEvent::Data(received) => assert_eq!(received, blob),
        other => panic!("expected reassembled payload, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_failure_surfaces_error_then_close() {
    let (session, _session_events, factory) = session_with_mock();
    let connection = session
        .connect("remote-peer", ConnectOptions::default())
        .await
        .expect("connect");
    let mut events = connection.take_events().expect("events");
    let transport = factory.transport(0).expect("transport");
    transport.emit(TransportEvent::ChannelOpen);
    assert!(matches!(next_data_event(&mut events).await, DataEvent::Open));

    transport.emit(TransportEvent::StateChange(NegotiationState::Failed));
    assert!(matches!(
        next_data_event(&mut events).await,
        DataEvent::Error(_)
    ));
    assert!(matches!(
        next_data_event(&mut events).await,
        DataEvent::Close
    ));
    assert!(!connection.is_open());
}

#[tokio::test]
async fn outgoing_call_surfaces_remote_stream() {
    let (session, _session_events, factory) = session_with_mock();
    let call = session
        .call(
            "remote-peer",
            MediaStream::new("cam"),
            flotilla::CallOptions::default(),
        )
        .await
        .expect("call");
    let mut events = call.take_events().expect("events");
    assert_eq!(call.local_stream().map(|s| s.id), Some("cam".into()));

    let transport = factory.transport(0).expect("transport");
    transport.emit(TransportEvent::RemoteTrack(MediaStream::new("their-cam")));
    match tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event within a second")
        .expect("event stream alive")
    {
        MediaEvent::Stream(stream) => assert_eq!(stream.id, "their-cam"),
        other => panic!("expected stream event, got {other:?}"),
    }
}

#[tokio::test]
async fn destroy_tears_down_open_connections() {
    let (session, mut session_events, factory) = session_with_mock();
    let connection = session
        .connect("remote-peer", ConnectOptions::default())
        .await
        .expect("connect");
    let mut events = connection.take_events().expect("events");
    let transport = factory.transport(0).expect("transport");
    transport.emit(TransportEvent::ChannelOpen);
    assert!(matches!(next_data_event(&mut events).await, DataEvent::Open));

    session.destroy();
    assert!(matches!(next_data_event(&mut events).await, DataEvent::Close));
    assert!(!connection.is_open());

    // Session side ends with disconnect then close, exactly once.
    assert!(matches!(
        session_events.try_recv(),
        Ok(SessionEvent::Disconnected(_))
    ));
    assert!(matches!(session_events.try_recv(), Ok(SessionEvent::Close)));
    assert!(session_events.try_recv().is_err());
    session.destroy();
    assert!(session_events.try_recv().is_err());
}
