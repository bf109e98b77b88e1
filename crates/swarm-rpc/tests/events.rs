//! End-to-end tests over real sockets: handshake, scalar and streamed
//! invocations, timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use swarm_rpc::{
    handler_fn, ClientConfig, Endpoint, EventClient, EventReply, EventServer, FieldValue,
    InvokeOptions, PeerCore, PipeTableConfig, RpcError, ServerConfig,
};

const TOKEN: &str = "sesame";

fn test_core(name: &str) -> PeerCore {
    let core = PeerCore::new(name, PipeTableConfig::default());
    core.register_event(
        "echo",
        handler_fn(|mut args| async move {
            let x = args.take_as::<i64>("x").map_err(|e| e.to_string())?;
            Ok(EventReply::Single(json!(x)))
        }),
    );
    core.register_event(
        "shift",
        handler_fn(|mut args| async move {
            let mut nums = args.take_stream("nums").map_err(|e| e.to_string())?;
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                while let Some(item) = nums.recv().await {
                    let forwarded = match item {
                        Ok(v) => Ok(json!(v.as_i64().unwrap_or(0) + 1)),
                        Err(reason) => Err(reason),
                    };
                    let stop = forwarded.is_err();
                    if tx.send(forwarded).await.is_err() || stop {
                        break;
                    }
                }
            });
            Ok(EventReply::Stream(rx))
        }),
    );
    core.register_event(
        "total",
        handler_fn(|mut args| async move {
            let mut nums = args.take_stream("nums").map_err(|e| e.to_string())?;
            let mut sum = 0i64;
            while let Some(item) = nums.recv().await {
                match item {
                    Ok(v) => sum += v.as_i64().unwrap_or(0),
                    Err(reason) => return Err(format!("input failed: {reason}")),
                }
            }
            Ok(EventReply::Single(json!(sum)))
        }),
    );
    core.register_event(
        "countdown_then_fail",
        handler_fn(|_args| async move {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send(Ok(json!(1))).await;
                let _ = tx.send(Err("ran out of numbers".to_owned())).await;
            });
            Ok(EventReply::Stream(rx))
        }),
    );
    core.register_event(
        "sleepy",
        handler_fn(|_args| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(EventReply::Single(json!(null)))
        }),
    );
    core.register_event(
        "boom",
        handler_fn(|_args| async move { Err("it broke".to_owned()) }),
    );
    core
}

async fn start_server() -> Arc<EventServer> {
    let mut config = ServerConfig::new("test-server", Endpoint::tcp("127.0.0.1", 0));
    config.auth = Some(TOKEN.to_owned());
    EventServer::start(config, test_core("test-server"))
        .await
        .unwrap()
}

async fn connect_client(server: &EventServer) -> EventClient {
    let port = server.bound_port().unwrap() as u16;
    let mut config = ClientConfig::new("test-client", Endpoint::tcp("127.0.0.1", port));
    config.auth = Some(TOKEN.to_owned());
    EventClient::connect(config, test_core("test-client"))
        .await
        .unwrap()
}

#[tokio::test]
async fn scalar_invoke_round_trip() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    let fields = HashMap::from([("x".to_owned(), FieldValue::Single(json!(41)))]);
    let got: i64 = client
        .invoke_as("echo", fields, InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(got, 41);

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn bad_auth_is_rejected_without_retry() {
    let server = start_server().await;
    let port = server.bound_port().unwrap() as u16;

    let mut config = ClientConfig::new("intruder", Endpoint::tcp("127.0.0.1", port));
    config.auth = Some("wrong".to_owned());
    let err = EventClient::connect(config, test_core("intruder"))
        .await
        .err()
        .expect("handshake must fail");
    assert!(matches!(err, RpcError::HandshakeRejected(_)), "{err}");

    server.shutdown().await;
}

#[tokio::test]
async fn streamed_parameter_and_result_preserve_order() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    let (tx, rx) = mpsc::channel(8);
    let fields = HashMap::from([("nums".to_owned(), FieldValue::Stream(rx))]);
    let feeder = tokio::spawn(async move {
        for n in [1, 2, 3] {
            tx.send(Ok(json!(n))).await.unwrap();
        }
    });

    let reply = client
        .invoke("shift", fields, InvokeOptions::default())
        .await
        .unwrap();
    let EventReply::Stream(mut out) = reply else {
        panic!("expected a streamed result");
    };
    let mut got = Vec::new();
    while let Some(item) = out.recv().await {
        got.push(item.unwrap().as_i64().unwrap());
    }
    assert_eq!(got, vec![2, 3, 4]);
    feeder.await.unwrap();

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn mid_stream_error_terminates_the_result_stream() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    let reply = client
        .invoke("countdown_then_fail", HashMap::new(), InvokeOptions::default())
        .await
        .unwrap();
    let EventReply::Stream(mut out) = reply else {
        panic!("expected a streamed result");
    };
    assert_eq!(out.recv().await, Some(Ok(json!(1))));
    assert_eq!(out.recv().await, Some(Err("ran out of numbers".to_owned())));
    assert_eq!(out.recv().await, None);
    assert_eq!(client.core().pending_pipes(), 0);

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn parameter_stream_error_reaches_the_handler() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    let (tx, rx) = mpsc::channel(8);
    let fields = HashMap::from([("nums".to_owned(), FieldValue::Stream(rx))]);
    let feeder = tokio::spawn(async move {
        tx.send(Ok(json!(1))).await.unwrap();
        tx.send(Ok(json!(2))).await.unwrap();
        tx.send(Err("upstream died".to_owned())).await.unwrap();
    });

    let err = client
        .invoke("total", fields, InvokeOptions::default())
        .await
        .err()
        .expect("must fail");
    match err {
        RpcError::EventInvoke { event, reason } => {
            assert_eq!(event, "total");
            assert!(reason.contains("upstream died"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    feeder.await.unwrap();

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn invoke_timeout_cleans_up_the_waiting_pipe() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    let opts = InvokeOptions {
        timeout: Duration::from_millis(200),
    };
    let err = client
        .invoke("sleepy", HashMap::new(), opts)
        .await
        .err()
        .expect("must time out");
    assert!(matches!(err, RpcError::ConnectionTimeout(_)), "{err}");
    assert_eq!(client.core().pending_pipes(), 0);

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn handler_failure_reaches_the_caller() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    let err = client
        .invoke("boom", HashMap::new(), InvokeOptions::default())
        .await
        .err()
        .expect("must fail");
    match err {
        RpcError::EventInvoke { event, reason } => {
            assert_eq!(event, "boom");
            assert_eq!(reason, "it broke");
        }
        other => panic!("unexpected error: {other}"),
    }

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_event_is_dropped_and_the_caller_times_out() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    // The remote logs and drops the invoke without replying, so the
    // only signal the caller gets is its own timeout.
    let opts = InvokeOptions {
        timeout: Duration::from_millis(300),
    };
    let err = client
        .invoke("no_such_event", HashMap::new(), opts)
        .await
        .err()
        .expect("must time out");
    assert!(matches!(err, RpcError::ConnectionTimeout(_)), "{err}");
    assert_eq!(client.core().pending_pipes(), 0);

    client.close();
    server.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_transport_works() {
    let name = format!("events-{}", std::process::id());
    let config = ServerConfig::new("unix-server", Endpoint::unix(name.clone()));
    let server = EventServer::start(config, test_core("unix-server"))
        .await
        .unwrap();

    let client_config = ClientConfig::new("unix-client", Endpoint::unix(name));
    let client = EventClient::connect(client_config, test_core("unix-client"))
        .await
        .unwrap();

    let fields = HashMap::from([("x".to_owned(), FieldValue::Single(json!(7)))]);
    let got: i64 = client
        .invoke_as("echo", fields, InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(got, 7);

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn server_can_invoke_back_on_the_client() {
    let server = start_server().await;
    let client = connect_client(&server).await;

    // The server learned the client's peer id at handshake time.
    let peer_id = server.core().peer_ids().pop().unwrap();
    let fields = HashMap::from([("x".to_owned(), FieldValue::Single(json!(5)))]);
    let got: i64 = server
        .core()
        .invoke_as(&peer_id, "echo", fields, InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(got, 5);

    client.close();
    server.shutdown().await;
}
