use std::{
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::future::{
    BoxFuture,
    join_all,
};
use wamp_engine::{
    core::{
        cancel::CallCancelMode,
        error::{
            BasicError,
            InteractionError,
            InvocationError,
        },
        invocation_policy::InvocationPolicy,
        options::ProcedureOptions,
        types::Value,
        uri::Uri,
    },
    peer::{
        callee::{
            callee::CalleeConfig,
            invocation::{
                Invocation,
                RpcYield,
            },
        },
        caller::RpcCall,
        peer::{
            Peer,
            PeerConfig,
        },
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

async fn create_and_join_peer_with_config(
    router: &Router,
    name: &str,
    config: PeerConfig,
) -> Result<Peer, Error> {
    let peer = Peer::new(PeerConfig {
        name: name.to_owned(),
        ..config
    })?;
    let (router_end, peer_end) = direct_transport_pair(name);
    router.accept(Arc::new(router_end)).await;
    peer.connect(Arc::new(peer_end)).await?;
    peer.join_realm(REALM).await?;
    Ok(peer)
}

async fn create_and_join_peer(router: &Router, name: &str) -> Result<Peer, Error> {
    create_and_join_peer_with_config(router, name, PeerConfig::default()).await
}

fn callee_config(config: CalleeConfig) -> PeerConfig {
    PeerConfig {
        callee: config,
        ..Default::default()
    }
}

async fn echo(invocation: Invocation) -> Result<RpcYield> {
    Ok(RpcYield {
        arguments: invocation.arguments,
        arguments_keyword: invocation.arguments_keyword,
    })
}

async fn sleep_forever(_: Invocation) -> Result<RpcYield> {
    tokio::time::sleep(Duration::from_secs(60)).await;
    Ok(RpcYield::default())
}

fn reply_after(
    delay: Duration,
    reply: &'static str,
) -> impl Fn(Invocation) -> BoxFuture<'static, Result<RpcYield>> + Send + Sync + 'static {
    move |_: Invocation| {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(RpcYield {
                arguments: vec![Value::from(reply)],
                ..Default::default()
            })
        })
    }
}

async fn wait_for_running_calls(peer: &Peer, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while peer.callee().calls().running_count().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn procedure(name: &str) -> Uri {
    Uri::try_from(name).unwrap()
}

#[tokio::test]
async fn caller_receives_echoed_result() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(procedure("com.example.echo"), ProcedureOptions::default(), echo)
            .await,
        Ok(_)
    );
    assert_matches::assert_matches!(
        caller
            .call_and_wait(
                procedure("com.example.echo"),
                RpcCall {
                    arguments: vec![Value::from("hi")],
                    ..Default::default()
                }
            )
            .await,
        Ok(result) => {
            pretty_assertions::assert_eq!(result.arguments, vec![Value::from("hi")]);
            assert!(!result.progress);
        }
    );

    let statistics = callee.statistics().snapshot().await;
    assert_matches::assert_matches!(statistics.procedures.get("com.example.echo"), Some(snapshot) => {
        pretty_assertions::assert_eq!(snapshot.calls, 1);
        pretty_assertions::assert_eq!(snapshot.errors, 0);
    });
}

#[tokio::test]
async fn handler_error_surfaces_to_caller() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.fail"),
                ProcedureOptions::default(),
                |_: Invocation| async move {
                    Err::<RpcYield, Error>(BasicError::InvalidArgument("bad input".to_owned()).into())
                }
            )
            .await,
        Ok(_)
    );
    assert_matches::assert_matches!(
        caller
            .call_and_wait(procedure("com.example.fail"), RpcCall::default())
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<BasicError>(), Some(BasicError::InvalidArgument(_)));
        }
    );

    let statistics = callee.statistics().snapshot().await;
    assert_matches::assert_matches!(statistics.procedures.get("com.example.fail"), Some(snapshot) => {
        pretty_assertions::assert_eq!(snapshot.errors, 1);
    });
}

#[tokio::test]
async fn unknown_procedure_is_rejected() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        caller
            .call_and_wait(procedure("com.example.missing"), RpcCall::default())
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::NoSuchProcedure));
        }
    );
}

#[tokio::test]
async fn single_registration_cannot_be_shared() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let first = create_and_join_peer(&router, "first").await.unwrap();
    let second = create_and_join_peer(&router, "second").await.unwrap();

    assert_matches::assert_matches!(
        first
            .register(procedure("com.example.echo"), ProcedureOptions::default(), echo)
            .await,
        Ok(_)
    );
    assert_matches::assert_matches!(
        second
            .register(procedure("com.example.echo"), ProcedureOptions::default(), echo)
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::ProcedureAlreadyExists));
        }
    );
    assert_matches::assert_matches!(
        second
            .register(procedure("wamp.registration.list"), ProcedureOptions::default(), echo)
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::InvalidUri));
        }
    );
}

#[tokio::test]
async fn unregistered_procedure_can_no_longer_be_called() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    let registration = callee
        .register(procedure("com.example.echo"), ProcedureOptions::default(), echo)
        .await
        .unwrap();
    assert_matches::assert_matches!(callee.unregister(registration).await, Ok(()));
    assert_matches::assert_matches!(callee.unregister(registration).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::NoSuchRegistration));
    });
    assert_matches::assert_matches!(
        caller
            .call_and_wait(procedure("com.example.echo"), RpcCall::default())
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::NoSuchProcedure));
        }
    );
}

#[tokio::test]
async fn callee_discloses_caller_on_request() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.whoami"),
                ProcedureOptions {
                    disclose_caller: true,
                    ..Default::default()
                },
                |invocation: Invocation| async move {
                    Ok::<_, Error>(RpcYield {
                        arguments: invocation.details.caller.map(Value::from).into_iter().collect(),
                        ..Default::default()
                    })
                }
            )
            .await,
        Ok(_)
    );
    let caller_id = caller.current_session_id().await.unwrap();
    assert_matches::assert_matches!(
        caller
            .call_and_wait(procedure("com.example.whoami"), RpcCall::default())
            .await,
        Ok(result) => {
            pretty_assertions::assert_eq!(result.arguments, vec![Value::from(caller_id)]);
        }
    );
}

#[tokio::test]
async fn callee_limits_concurrent_invocations() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer_with_config(
        &router,
        "callee",
        callee_config(CalleeConfig {
            max_concurrent_tasks: 2,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let handler = {
        let running = running.clone();
        let max_running = max_running.clone();
        move |_: Invocation| {
            let running = running.clone();
            let max_running = max_running.clone();
            async move {
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(RpcYield::default())
            }
        }
    };
    assert_matches::assert_matches!(
        callee
            .register(procedure("com.example.work"), ProcedureOptions::default(), handler)
            .await,
        Ok(_)
    );

    let results = join_all(
        (0..6).map(|_| caller.call_and_wait(procedure("com.example.work"), RpcCall::default())),
    )
    .await;
    assert!(results.iter().all(|result| result.is_ok()));
    assert!(max_running.load(Ordering::SeqCst) <= 2);
    pretty_assertions::assert_eq!(running.load(Ordering::SeqCst), 0);

    let statistics = callee.statistics().snapshot().await;
    assert_matches::assert_matches!(statistics.procedures.get("com.example.work"), Some(snapshot) => {
        pretty_assertions::assert_eq!(snapshot.calls, 6);
    });
}

#[tokio::test]
async fn invocation_times_out() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.slow"),
                ProcedureOptions::default(),
                sleep_forever
            )
            .await,
        Ok(_)
    );
    assert_matches::assert_matches!(
        caller
            .call_and_wait(
                procedure("com.example.slow"),
                RpcCall {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                }
            )
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InvocationError>(), Some(InvocationError::Timeout));
        }
    );

    let statistics = callee.statistics().snapshot().await;
    assert_matches::assert_matches!(statistics.procedures.get("com.example.slow"), Some(snapshot) => {
        pretty_assertions::assert_eq!(snapshot.timeouts, 1);
    });
    pretty_assertions::assert_eq!(callee.callee().calls().call_count().await, 0);
}

#[tokio::test]
async fn caller_cancels_running_invocation() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.slow"),
                ProcedureOptions::default(),
                sleep_forever
            )
            .await,
        Ok(_)
    );
    let rpc = caller
        .call(procedure("com.example.slow"), RpcCall::default())
        .await
        .unwrap();
    wait_for_running_calls(&callee, 1).await;

    assert_matches::assert_matches!(rpc.cancel(CallCancelMode::KillNoWait).await, Ok(()));
    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::Canceled));
    });

    assert_matches::assert_matches!(
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let statistics = callee.statistics().snapshot().await;
                if statistics
                    .procedures
                    .get("com.example.slow")
                    .is_some_and(|snapshot| snapshot.cancels == 1)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await,
        Ok(())
    );
    pretty_assertions::assert_eq!(callee.callee().calls().call_count().await, 0);
}

#[tokio::test]
async fn caller_receives_progressive_results_in_order() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.count"),
                ProcedureOptions::default(),
                |invocation: Invocation| async move {
                    for i in 1..=3 {
                        invocation.progress(RpcYield {
                            arguments: vec![Value::Integer(i)],
                            ..Default::default()
                        })?;
                    }
                    Ok::<_, Error>(RpcYield {
                        arguments: vec![Value::from("done")],
                        ..Default::default()
                    })
                }
            )
            .await,
        Ok(_)
    );

    let mut rpc = caller
        .call_with_progress(procedure("com.example.count"), RpcCall::default())
        .await
        .unwrap();
    for i in 1..=3 {
        assert_matches::assert_matches!(rpc.next_result().await, Ok(Some(result)) => {
            assert!(result.progress);
            pretty_assertions::assert_eq!(result.arguments, vec![Value::Integer(i)]);
        });
    }
    assert_matches::assert_matches!(rpc.next_result().await, Ok(Some(result)) => {
        assert!(!result.progress);
        pretty_assertions::assert_eq!(result.arguments, vec![Value::from("done")]);
    });
    assert_matches::assert_matches!(rpc.next_result().await, Ok(None));
}

#[tokio::test]
async fn progress_is_dropped_for_simple_calls() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.count"),
                ProcedureOptions::default(),
                |invocation: Invocation| async move {
                    assert!(!invocation.receives_progress());
                    assert!(invocation.progress(RpcYield::default()).is_err());
                    Ok::<_, Error>(RpcYield {
                        arguments: vec![Value::from("done")],
                        ..Default::default()
                    })
                }
            )
            .await,
        Ok(_)
    );
    assert_matches::assert_matches!(
        caller
            .call_and_wait(procedure("com.example.count"), RpcCall::default())
            .await,
        Ok(result) => {
            pretty_assertions::assert_eq!(result.arguments, vec![Value::from("done")]);
        }
    );
}

#[tokio::test]
async fn callee_leaving_cancels_pending_calls() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer(&router, "callee").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.slow"),
                ProcedureOptions::default(),
                sleep_forever
            )
            .await,
        Ok(_)
    );
    let rpc = caller
        .call(procedure("com.example.slow"), RpcCall::default())
        .await
        .unwrap();
    wait_for_running_calls(&callee, 1).await;

    assert_matches::assert_matches!(callee.disconnect().await, Ok(()));
    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<InteractionError>(), Some(InteractionError::Canceled));
    });
    pretty_assertions::assert_eq!(
        router
            .dealer(&Uri::try_from(REALM).unwrap())
            .unwrap()
            .pending_invocations()
            .await,
        0
    );
}

#[tokio::test]
async fn saturated_callee_reroutes_to_another_callee() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let first = create_and_join_peer_with_config(
        &router,
        "first",
        callee_config(CalleeConfig {
            max_concurrent_tasks: 1,
            max_queued_tasks: 1,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    let second = create_and_join_peer(&router, "second").await.unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    let options = ProcedureOptions {
        invocation_policy: InvocationPolicy::First,
        ..Default::default()
    };
    assert_matches::assert_matches!(
        first
            .register(
                procedure("com.example.shared"),
                options.clone(),
                reply_after(Duration::from_millis(100), "first")
            )
            .await,
        Ok(_)
    );
    assert_matches::assert_matches!(
        second
            .register(
                procedure("com.example.shared"),
                options,
                reply_after(Duration::ZERO, "second")
            )
            .await,
        Ok(_)
    );
    pretty_assertions::assert_eq!(
        router
            .dealer(&Uri::try_from(REALM).unwrap())
            .unwrap()
            .callee_count(&procedure("com.example.shared"))
            .await,
        2
    );

    let first_rpc = caller
        .call(procedure("com.example.shared"), RpcCall::default())
        .await
        .unwrap();
    let second_rpc = caller
        .call(procedure("com.example.shared"), RpcCall::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(second_rpc.result().await, Ok(result) => {
        pretty_assertions::assert_eq!(result.arguments, vec![Value::from("second")]);
    });
    assert_matches::assert_matches!(first_rpc.result().await, Ok(result) => {
        pretty_assertions::assert_eq!(result.arguments, vec![Value::from("first")]);
    });
}

#[tokio::test]
async fn saturated_callee_holds_invocations_without_reroute() {
    test_utils::setup::setup_test_environment();

    let router = start_router().await.unwrap();
    let callee = create_and_join_peer_with_config(
        &router,
        "callee",
        callee_config(CalleeConfig {
            max_concurrent_tasks: 1,
            max_queued_tasks: 1,
            allow_reroute: false,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    let caller = create_and_join_peer(&router, "caller").await.unwrap();

    assert_matches::assert_matches!(
        callee
            .register(
                procedure("com.example.work"),
                ProcedureOptions::default(),
                reply_after(Duration::from_millis(50), "done")
            )
            .await,
        Ok(_)
    );

    let results = join_all(
        (0..2).map(|_| caller.call_and_wait(procedure("com.example.work"), RpcCall::default())),
    )
    .await;
    for result in results {
        assert_matches::assert_matches!(result, Ok(result) => {
            pretty_assertions::assert_eq!(result.arguments, vec![Value::from("done")]);
        });
    }
}
