// modules/stratum_connector/src/tests/stub_pool.rs
//! A scripted pool on a loopback listener. Each test drives one accepted
//! connection through a closure and gets back every line the client sent.

use crate::types::PoolEndpoint;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct PoolConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    pub received: Vec<Value>,
    /// Lines that were not valid JSON.
    pub unparsed: usize,
}

impl PoolConn {
    /// Next request from the client; panics on EOF or silence.
    pub async fn next_request(&mut self) -> Value {
        let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("client went silent")
            .expect("read from client failed")
            .expect("client closed the connection");
        let value: Value = serde_json::from_str(&line).expect("client sent invalid JSON");
        self.received.push(value.clone());
        value
    }

    /// Next request, asserting its method.
    pub async fn expect(&mut self, method: &str) -> Value {
        let request = self.next_request().await;
        assert_eq!(request["method"], method, "unexpected request {}", request);
        request
    }

    pub async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write to client");
        self.writer.write_all(b"\n").await.expect("write to client");
        self.writer.flush().await.expect("flush to client");
    }

    /// Subscribe with extranonce1 `f8002c90` and a 4-byte extranonce2.
    pub async fn accept_subscribe(&mut self) {
        let request = self.expect("mining.subscribe").await;
        self.send(json!({"id": request["id"], "result": [["sub1"], "f8002c90", 4], "error": null}))
            .await;
    }

    /// Returns the authorize request id without answering it.
    pub async fn read_authorize(&mut self) -> Value {
        self.expect("mining.authorize").await["id"].clone()
    }

    pub async fn accept_handshake(&mut self) {
        self.accept_subscribe().await;
        let id = self.read_authorize().await;
        self.send(json!({"id": id, "result": true, "error": null})).await;
    }

    pub async fn notify(&mut self, job_id: &str, clean_jobs: bool) {
        self.send(notify_message(job_id, clean_jobs)).await;
    }

    /// Read until the client shuts its side down. Returns how many lines arrived.
    pub async fn read_to_eof(&mut self) -> usize {
        let mut count = 0;
        while let Ok(Ok(Some(line))) = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line()).await {
            match serde_json::from_str::<Value>(&line) {
                Ok(value) => self.received.push(value),
                Err(_) => self.unparsed += 1,
            }
            count += 1;
        }
        count
    }
}

pub(crate) fn notify_message(job_id: &str, clean_jobs: bool) -> Value {
    json!({
        "id": null,
        "method": "mining.notify",
        "params": [
            job_id,
            "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000",
            "01000000010000",
            "ffffffff0100f2052a",
            [],
            "20000000",
            "1a00ffff",
            "504e86b9",
            clean_jobs
        ]
    })
}

/// Bind a loopback listener and run `script` on the first connection.
/// The handle resolves to the connection once the script returns.
pub(crate) async fn spawn<F, Fut>(script: F) -> (PoolEndpoint, JoinHandle<PoolConn>)
where
    F: FnOnce(PoolConn) -> Fut + Send + 'static,
    Fut: Future<Output = PoolConn> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub pool");
    let port = listener.local_addr().expect("stub pool address").port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept client");
        let (read_half, writer) = stream.into_split();
        let conn = PoolConn {
            lines: BufReader::new(read_half).lines(),
            writer,
            received: Vec::new(),
            unparsed: 0,
        };
        script(conn).await
    });
    (PoolEndpoint::new("127.0.0.1", port, "alice.rig1", "x"), handle)
}
