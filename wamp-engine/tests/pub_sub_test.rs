use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    error::TryRecvError,
    unbounded_channel,
};
use wamp_engine::{
    core::{
        error::InteractionError,
        id::Id,
        options::PublishOptions,
        types::Value,
        uri::Uri,
    },
    peer::{
        peer::{
            Peer,
            PeerConfig,
        },
        publisher::Publication,
        subscriber::ReceivedEvent,
    },
    realm::realm::RealmConfig,
    router::router::{
        Router,
        RouterConfig,
    },
    transport::direct::direct_transport_pair,
};

const REALM: &str = "com.example.test";

async fn start_router() -> Result<Router, Error> {
    Router::new(RouterConfig {
        realms: vec![RealmConfig {
            name: "test".to_owned(),
            uri: Uri::try_from(REALM)?,
        }],
        ..Default::default()
    })
    .await
}

async fn create_and_join_peer(router: &Router, name: &str) -> Result<Peer, Error> {
    let peer = Peer::new(PeerConfig {
        name: name.to_owned(),
        ..Default::default()
    })?;
    let (router_end, peer_end) = direct_transport_pair(name);
    router.accept(Arc::new(router_end)).await;
    peer.connect(Arc::new(peer_end)).await?;
    peer.join_realm(REALM).await?;
    Ok(peer)
}

async fn subscribe(
    peer: &Peer,
    topic: &str,
) -> Result<(Id, UnboundedReceiver<ReceivedEvent>), Error> {
    let (tx, rx) = unbounded_channel();
    let subscription = peer.subscribe(Uri::try_from(topic)?, Arc::new(tx)).await?;
    Ok((subscription, rx))
}

async fn next_event(rx: &mut UnboundedReceiver<ReceivedEvent>) -> Option<ReceivedEvent> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()
        .flatten()
}

fn acknowledged(arguments: Vec<Value>) -> Publication {
    Publication {
        arguments,
        options: PublishOptions {
            acknowledge: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn subscriber_receives_published_event_once() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let subscriber = create_and_join_peer(&router, "subscriber").await.unwrap();
    let publisher = create_and_join_peer(&router, "publisher").await.unwrap();

    let (subscription, mut rx) = subscribe(&subscriber, "a.b").await.unwrap();
    assert_matches::assert_matches!(
        router
            .broker(&Uri::try_from(REALM).unwrap())
            .unwrap()
            .subscriber_count(&Uri::try_from("a.b").unwrap())
            .await,
        1
    );

    let publication = publisher
        .publish(
            Uri::try_from("a.b").unwrap(),
            acknowledged(vec![Value::Integer(1), Value::Integer(2)]),
        )
        .await
        .unwrap();
    assert_matches::assert_matches!(publication, Some(_));

    assert_matches::assert_matches!(next_event(&mut rx).await, Some(event) => {
        pretty_assertions::assert_eq!(event.subscription, subscription);
        pretty_assertions::assert_eq!(Some(event.publication), publication);
        pretty_assertions::assert_eq!(event.arguments, vec![Value::Integer(1), Value::Integer(2)]);
        assert!(!event.details.contains_key("publisher"));
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_matches::assert_matches!(rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn unsubscribed_peer_stops_receiving_events() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let subscriber = create_and_join_peer(&router, "subscriber").await.unwrap();
    let publisher = create_and_join_peer(&router, "publisher").await.unwrap();

    let (subscription, mut rx) = subscribe(&subscriber, "a.b").await.unwrap();
    assert_matches::assert_matches!(subscriber.unsubscribe(subscription).await, Ok(()));

    assert_matches::assert_matches!(
        publisher
            .publish(
                Uri::try_from("a.b").unwrap(),
                acknowledged(vec![Value::from("ignored")])
            )
            .await,
        Ok(Some(_))
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_matches::assert_matches!(rx.try_recv(), Err(_));
}

#[tokio::test]
async fn publisher_is_excluded_unless_requested() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let peer = create_and_join_peer(&router, "peer").await.unwrap();
    let (_, mut rx) = subscribe(&peer, "a.b").await.unwrap();

    assert_matches::assert_matches!(
        peer.publish(
            Uri::try_from("a.b").unwrap(),
            acknowledged(vec![Value::Integer(1)])
        )
        .await,
        Ok(Some(_))
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_matches::assert_matches!(rx.try_recv(), Err(TryRecvError::Empty));

    assert_matches::assert_matches!(
        peer.publish(
            Uri::try_from("a.b").unwrap(),
            Publication {
                arguments: vec![Value::Integer(2)],
                options: PublishOptions {
                    acknowledge: true,
                    exclude_me: false,
                    disclose_me: true,
                    ..Default::default()
                },
                ..Default::default()
            }
        )
        .await,
        Ok(Some(_))
    );
    assert_matches::assert_matches!(next_event(&mut rx).await, Some(event) => {
        pretty_assertions::assert_eq!(event.arguments, vec![Value::Integer(2)]);
        pretty_assertions::assert_eq!(
            event.details.get("publisher"),
            peer.current_session_id().await.map(Value::from).as_ref()
        );
    });
}

#[tokio::test]
async fn events_fan_out_to_every_subscriber() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let first = create_and_join_peer(&router, "first").await.unwrap();
    let second = create_and_join_peer(&router, "second").await.unwrap();
    let publisher = create_and_join_peer(&router, "publisher").await.unwrap();

    let (_, mut first_rx) = subscribe(&first, "a.b").await.unwrap();
    let (_, mut second_rx) = subscribe(&second, "a.b").await.unwrap();
    let (_, mut other_rx) = subscribe(&second, "a.c").await.unwrap();

    assert_matches::assert_matches!(
        publisher
            .publish(Uri::try_from("a.b").unwrap(), Publication::default())
            .await,
        Ok(None)
    );
    assert_matches::assert_matches!(next_event(&mut first_rx).await, Some(_));
    assert_matches::assert_matches!(next_event(&mut second_rx).await, Some(_));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_matches::assert_matches!(other_rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn reserved_topics_are_rejected() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let peer = create_and_join_peer(&router, "peer").await.unwrap();

    assert_matches::assert_matches!(subscribe(&peer, "wamp.session.on_join").await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::InvalidUri));
    });
    assert_matches::assert_matches!(
        peer.publish(
            Uri::try_from("wamp.session.on_join").unwrap(),
            acknowledged(Vec::default())
        )
        .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::InvalidUri));
        }
    );
}

#[tokio::test]
async fn unknown_subscription_cannot_be_unsubscribed() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let peer = create_and_join_peer(&router, "peer").await.unwrap();

    assert_matches::assert_matches!(peer.unsubscribe(Id::MIN).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::NoSuchSubscription));
    });
}

#[tokio::test]
async fn operations_require_joined_realm() {
    test_utils::setup::setup_test_environment();

    let peer = Peer::new(PeerConfig::default()).unwrap();
    assert_matches::assert_matches!(
        peer.publish(Uri::try_from("a.b").unwrap(), Publication::default())
            .await,
        Err(_)
    );
}
