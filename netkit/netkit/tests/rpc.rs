// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use netkit::{
    rpc::{Registry, RpcClient, RpcServer},
    shutdown::Controller,
    Endpoint, Error,
};
use serde_json::{json, Map, Value};

const DIAL: Duration = Duration::from_secs(2);

async fn start_server() -> (Endpoint, Controller) {
    let registry = Registry::new()
        .register("add", |params, _kwargs| {
            let (Some(a), Some(b)) = (
                params.first().and_then(Value::as_i64),
                params.get(1).and_then(Value::as_i64),
            ) else {
                return Err("add takes two integers".into());
            };
            Ok(json!(a + b))
        })
        .register("div", |params, _kwargs| {
            let (Some(a), Some(b)) = (
                params.first().and_then(Value::as_f64),
                params.get(1).and_then(Value::as_f64),
            ) else {
                return Err("div takes two numbers".into());
            };
            if b == 0.0 {
                return Err("Division by zero is not allowed".into());
            }
            Ok(json!(a / b))
        })
        .register("echo", |mut params, kwargs| {
            if !kwargs.is_empty() {
                return Ok(Value::Object(kwargs));
            }
            Ok(params.pop().unwrap_or(Value::Null))
        });

    let server = RpcServer::bind(&Endpoint::stream("127.0.0.1", 0), registry)
        .await
        .unwrap();
    let endpoint = Endpoint::stream("127.0.0.1", server.local_addr().port());

    let controller = Controller::new();
    let mut signal = controller.subscribe();
    tokio::spawn(server.serve(async move { signal.recv().await }));

    (endpoint, controller)
}

#[tokio::test]
async fn call_result_error_and_unknown_method() {
    let (endpoint, _controller) = start_server().await;
    let mut client = RpcClient::connect(&endpoint, DIAL).await.unwrap();

    let sum = client.call("add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(sum, json!(5));

    let err = client
        .call("div", vec![json!(10), json!(0)])
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Rpc(message) if message == "Division by zero is not allowed"),
        "got {err:?}"
    );

    let err = client.call("missing", vec![]).await.unwrap_err();
    assert!(matches!(&err, Error::Rpc(message) if message == "method not found: missing"));
}

#[tokio::test]
async fn echo_round_trips_arbitrary_json() {
    let (endpoint, _controller) = start_server().await;
    let mut client = RpcClient::connect(&endpoint, DIAL).await.unwrap();

    for value in [
        json!(null),
        json!(42),
        json!("text"),
        json!([1, "two", {"three": 3}]),
        json!({"nested": {"deep": [true, false]}}),
    ] {
        let result = client.call("echo", vec![value.clone()]).await.unwrap();
        assert_eq!(result, value);
    }
}

#[tokio::test]
async fn kwargs_form() {
    let (endpoint, _controller) = start_server().await;
    let mut client = RpcClient::connect(&endpoint, DIAL).await.unwrap();

    let mut kwargs = Map::new();
    kwargs.insert("a".into(), json!(1));
    kwargs.insert("b".into(), json!("two"));

    let result = client.call_with("echo", vec![], kwargs).await.unwrap();
    assert_eq!(result, json!({"a": 1, "b": "two"}));
}

#[tokio::test]
async fn sequential_calls_reuse_the_connection() {
    let (endpoint, _controller) = start_server().await;
    let mut client = RpcClient::connect(&endpoint, DIAL).await.unwrap();

    for n in 0..20i64 {
        let sum = client.call("add", vec![json!(n), json!(1)]).await.unwrap();
        assert_eq!(sum, json!(n + 1));
    }
}

#[tokio::test]
async fn error_does_not_poison_the_connection() {
    let (endpoint, _controller) = start_server().await;
    let mut client = RpcClient::connect(&endpoint, DIAL).await.unwrap();

    assert!(client.call("missing", vec![]).await.is_err());
    let sum = client.call("add", vec![json!(1), json!(1)]).await.unwrap();
    assert_eq!(sum, json!(2));
}
