// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC engine.
//!
//! The protocol is deliberately correlation-free: a client writes one
//! request frame and reads exactly one response frame before its next
//! request. Failures inside a method never reach the transport; the
//! dispatcher marshals them into `{"error": …}`.

use crate::{
    endpoint::Endpoint,
    shutdown::Shutdown,
    transport::{dial_stream, Connection, ServerConfig, StreamServer},
    Error, Result,
};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tracing::debug;

/// A registered method: positional args and keyword args in, a value or an
/// error message out
pub type Method = Arc<dyn Fn(Vec<Value>, Map<String, Value>) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Deserialize, Serialize)]
struct Request {
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kwargs: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum Response {
    Result { result: Value },
    Error { error: String },
}

/// Builds the immutable method registry for an [`RpcServer`]
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, Method>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    fn dispatch(&self, request: Request) -> Response {
        let Some(method) = self.methods.get(&request.method) else {
            return Response::Error {
                error: format!("method not found: {}", request.method),
            };
        };

        let params = request.params.unwrap_or_default();
        let kwargs = request.kwargs.unwrap_or_default();

        match method.as_ref()(params, kwargs) {
            Ok(result) => Response::Result { result },
            Err(error) => Response::Error { error },
        }
    }
}

pub struct RpcServer {
    server: StreamServer,
    registry: Arc<Registry>,
}

impl RpcServer {
    pub async fn bind(endpoint: &Endpoint, registry: Registry) -> Result<Self> {
        Self::bind_with(endpoint, registry, ServerConfig::default()).await
    }

    pub async fn bind_with(
        endpoint: &Endpoint,
        registry: Registry,
        config: ServerConfig,
    ) -> Result<Self> {
        Ok(Self {
            server: StreamServer::bind_with(endpoint, config).await?,
            registry: Arc::new(registry),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub async fn serve(self, signal: impl core::future::Future<Output = ()>) -> Result<()> {
        let registry = self.registry;
        self.server
            .serve(
                move |conn, remote, shutdown| {
                    handle_connection(registry.clone(), conn, remote, shutdown)
                },
                signal,
            )
            .await
    }
}

async fn handle_connection(
    registry: Arc<Registry>,
    mut conn: Connection,
    remote: SocketAddr,
    mut shutdown: Shutdown,
) -> Result<()> {
    loop {
        tokio::select! {
            request = conn.read_json::<Request>() => {
                let request = match request {
                    Ok(request) => request,
                    Err(Error::ClosedByPeer) => return Ok(()),
                    Err(err) => return Err(err),
                };

                debug!(remote = %remote, method = %request.method, "dispatching");
                let response = registry.dispatch(request);
                conn.write_json(&response).await?;
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// Synchronous RPC client: one outstanding request at a time
pub struct RpcClient {
    conn: Connection,
}

impl RpcClient {
    pub async fn connect(endpoint: &Endpoint, deadline: Duration) -> Result<Self> {
        Ok(Self {
            conn: dial_stream(endpoint, deadline).await?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call_with(method, params, Map::new()).await
    }

    pub async fn call_with(
        &mut self,
        method: &str,
        params: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let request = Request {
            method: method.into(),
            params: (!params.is_empty()).then_some(params),
            kwargs: (!kwargs.is_empty()).then_some(kwargs),
        };

        self.conn.write_json(&request).await?;

        match self.conn.read_json::<Response>().await? {
            Response::Result { result } => Ok(result),
            Response::Error { error } => Err(Error::Rpc(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arithmetic() -> Registry {
        Registry::new()
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
                    params.first().and_then(Value::as_i64),
                    params.get(1).and_then(Value::as_i64),
                ) else {
                    return Err("div takes two integers".into());
                };
                if b == 0 {
                    return Err("Division by zero is not allowed".into());
                }
                Ok(json!(a / b))
            })
            .register("echo", |mut params, kwargs| {
                if !kwargs.is_empty() {
                    return Ok(Value::Object(kwargs));
                }
                Ok(params.pop().unwrap_or(Value::Null))
            })
    }

    #[test]
    fn dispatch_result_and_error() {
        let registry = arithmetic();

        let response = registry.dispatch(Request {
            method: "add".into(),
            params: Some(vec![json!(2), json!(3)]),
            kwargs: None,
        });
        assert!(matches!(response, Response::Result { result } if result == json!(5)));

        let response = registry.dispatch(Request {
            method: "div".into(),
            params: Some(vec![json!(10), json!(0)]),
            kwargs: None,
        });
        assert!(matches!(
            response,
            Response::Error { error } if error == "Division by zero is not allowed"
        ));
    }

    #[test]
    fn unknown_method() {
        let response = arithmetic().dispatch(Request {
            method: "missing".into(),
            params: None,
            kwargs: None,
        });
        assert!(matches!(
            response,
            Response::Error { error } if error == "method not found: missing"
        ));
    }

    #[test]
    fn response_wire_shape_is_result_xor_error() {
        let result = serde_json::to_value(Response::Result { result: json!(5) }).unwrap();
        assert_eq!(result, json!({"result": 5}));

        let error = serde_json::to_value(Response::Error {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(error, json!({"error": "boom"}));
    }

    #[test]
    fn kwargs_reach_the_method() {
        let registry = arithmetic();
        let mut kwargs = Map::new();
        kwargs.insert("name".into(), json!("netkit"));

        let response = registry.dispatch(Request {
            method: "echo".into(),
            params: None,
            kwargs: Some(kwargs),
        });
        assert!(matches!(
            response,
            Response::Result { result } if result == json!({"name": "netkit"})
        ));
    }
}
