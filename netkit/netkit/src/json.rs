// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! JSON-over-frames helpers.
//!
//! Every JSON-speaking service writes exactly one JSON object per frame;
//! decoding failures are protocol errors that poison only the offending
//! connection.

use crate::{transport::FramedWriter, Connection, Result};
use serde::Serialize;
use serde_json::json;

/// One-shot reply helper for handlers
pub async fn send_json_response<T: Serialize>(conn: &mut Connection, value: &T) -> Result<()> {
    conn.write_json(value).await
}

/// Writes the conventional `{"error": …}` frame services use to close an
/// offending connection
pub async fn send_json_error(writer: &mut FramedWriter, message: &str) -> Result<()> {
    writer.write_json(&json!({ "error": message })).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{transport::testing::connection_pair, Error};
    use serde_json::Value;

    #[tokio::test]
    async fn object_per_frame_round_trip() {
        let (mut client, mut server) = connection_pair().await;

        send_json_response(&mut client, &json!({"kind": "greeting", "n": 7}))
            .await
            .unwrap();

        let value: Value = server.read_json().await.unwrap();
        assert_eq!(value["kind"], "greeting");
        assert_eq!(value["n"], 7);
    }

    #[tokio::test]
    async fn malformed_json_is_a_protocol_error() {
        let (mut client, mut server) = connection_pair().await;

        client.write_frame(b"{not json").await.unwrap();

        let err = server.read_json::<Value>().await.unwrap_err();
        assert!(matches!(err, Error::InvalidJson(_)));
    }

    #[tokio::test]
    async fn error_frame_shape() {
        let (client, mut server) = connection_pair().await;
        let (_reader, mut writer) = client.split();

        send_json_error(&mut writer, "bad selection").await.unwrap();

        let value: Value = server.read_json().await.unwrap();
        assert_eq!(value["error"], "bad selection");
    }
}
