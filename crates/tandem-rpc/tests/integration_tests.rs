//! Integration tests for the tandem-rpc control server.
//!
//! Each test spawns the binary, attaches a real TCP client to its bridge
//! port and drives the host through the JSON-RPC endpoint.

use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tandem_core::{BridgeClient, BridgeConfig, ConnectionState, TcpConnector};
use tokio::io::AsyncBufReadExt;

/// POST a JSON-RPC request and split the reply into `result` or `error`.
async fn rpc_call(port: u16, method: &str, params: Value) -> Result<Value, Value> {
    let reply: Value = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/rpc", port))
        .json(&json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1}))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| Value::String(e.to_string()))?
        .json()
        .await
        .map_err(|e| Value::String(e.to_string()))?;

    match reply.get("error") {
        Some(error) => Err(error.clone()),
        None => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
    }
}

/// A running `tandem-rpc` process. Killed when dropped.
struct RunningBridge {
    _child: tokio::process::Child,
    rpc_port: u16,
    bridge_port: u16,
}

/// Read `NAME=port` announcements until both ports are known.
async fn announced_ports(
    lines: &mut tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStdout>>,
) -> Result<(u16, u16), String> {
    let (mut bridge, mut rpc) = (None, None);
    loop {
        if let (Some(bridge), Some(rpc)) = (bridge, rpc) {
            return Ok((bridge, rpc));
        }
        let line = lines
            .next_line()
            .await
            .map_err(|e| format!("reading stdout: {e}"))?
            .ok_or_else(|| "tandem-rpc exited before announcing its ports".to_string())?;
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let port = value
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("bad port in '{line}': {e}"));
        match name {
            "BRIDGE_PORT" => bridge = Some(port?),
            "RPC_PORT" => rpc = Some(port?),
            _ => {}
        }
    }
}

/// Start the binary on ephemeral ports and wait until `/health` answers.
async fn start_rpc_server(extra_args: &[&str]) -> Result<RunningBridge, String> {
    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_tandem-rpc"))
        .args(["--host", "127.0.0.1", "--port", "0", "--bridge-port", "0"])
        .args(extra_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn tandem-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let (bridge_port, rpc_port) =
        tokio::time::timeout(Duration::from_secs(20), announced_ports(&mut lines))
            .await
            .map_err(|_| "tandem-rpc never announced its ports".to_string())??;
    // Keep the pipe drained so the child never blocks on stdout.
    tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    let health = format!("http://127.0.0.1:{}/health", rpc_port);
    let http = reqwest::Client::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let status = match http.get(&health).send().await {
            Ok(response) => response.json::<Value>().await.ok(),
            Err(_) => None,
        };
        if status.is_some_and(|s| s["status"] == "ok") {
            break;
        }
        if std::time::Instant::now() >= deadline {
            return Err(format!("tandem-rpc failed health check on port {rpc_port}"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(RunningBridge {
        _child: child,
        rpc_port,
        bridge_port,
    })
}

/// Connect a client with a `ping` handler and wait until the host lists it.
async fn attach_client(server: &RunningBridge, session_id: &str) -> BridgeClient {
    let client = BridgeClient::new(
        session_id,
        TcpConnector::new(format!("127.0.0.1:{}", server.bridge_port)),
        BridgeConfig::default(),
    )
    .expect("client config is valid");
    client.register_handler("ping", |_params: Value| async { Ok(json!("pong")) });
    client.register_handler("add", |params: Value| async move {
        let a = params["a"].as_i64().unwrap_or(0);
        let b = params["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    client.connect().expect("inside a runtime");
    client
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(10))
        .await
        .expect("client connects to the bridge port");

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let session = rpc_call(server.rpc_port, "get_session", json!({"session_id": session_id})).await;
        if matches!(&session, Ok(info) if info["connected"] == json!(true)) {
            return client;
        }
        assert!(std::time::Instant::now() < deadline, "host never listed {}", session_id);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_health_check() {
    let server = start_rpc_server(&[]).await.expect("server starts");

    let result = rpc_call(server.rpc_port, "health_check", json!({})).await.unwrap();
    assert_eq!(result["status"], "ok");

    drop(server);
}

#[tokio::test]
async fn test_call_reaches_client_handler() {
    let server = start_rpc_server(&[]).await.expect("server starts");
    let _client = attach_client(&server, "s1").await;

    let pong = rpc_call(
        server.rpc_port,
        "call",
        json!({"session_id": "s1", "method": "ping", "timeout_ms": 5000}),
    )
    .await
    .unwrap();
    assert_eq!(pong, json!("pong"));

    let sum = rpc_call(
        server.rpc_port,
        "call",
        json!({"session_id": "s1", "method": "add", "params": {"a": 2, "b": 40}}),
    )
    .await
    .unwrap();
    assert_eq!(sum, json!(42));

    drop(server);
}

#[tokio::test]
async fn test_call_error_codes() {
    let server = start_rpc_server(&[]).await.expect("server starts");
    let _client = attach_client(&server, "s1").await;

    let missing = rpc_call(
        server.rpc_port,
        "call",
        json!({"session_id": "s1", "method": "missing", "timeout_ms": 1000}),
    )
    .await
    .unwrap_err();
    assert_eq!(missing["code"], -32601);

    let offline = rpc_call(
        server.rpc_port,
        "call",
        json!({"session_id": "nobody", "method": "ping"}),
    )
    .await
    .unwrap_err();
    assert_eq!(offline["code"], -32001);

    let unknown = rpc_call(server.rpc_port, "reticulate", json!({})).await.unwrap_err();
    assert_eq!(unknown["code"], -32601);

    drop(server);
}

#[tokio::test]
async fn test_fire_and_broadcast() {
    let server = start_rpc_server(&[]).await.expect("server starts");
    let _first = attach_client(&server, "s1").await;
    let _second = attach_client(&server, "s2").await;

    let fired = rpc_call(
        server.rpc_port,
        "fire",
        json!({"session_id": "s1", "method": "ping"}),
    )
    .await
    .unwrap();
    assert_eq!(fired, json!({"sent": true}));

    let broadcast = rpc_call(server.rpc_port, "broadcast", json!({"method": "ping"}))
        .await
        .unwrap();
    assert_eq!(broadcast, json!({"delivered": 2}));

    drop(server);
}

#[tokio::test]
async fn test_session_listing_and_close() {
    let server = start_rpc_server(&[]).await.expect("server starts");
    let client = attach_client(&server, "s1").await;

    let sessions = rpc_call(server.rpc_port, "list_sessions", json!({})).await.unwrap();
    let sessions = sessions.as_array().expect("list_sessions returns an array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session_id"], "s1");
    assert_eq!(sessions[0]["connected"], true);

    let closed = rpc_call(server.rpc_port, "close_session", json!({"session_id": "s1"}))
        .await
        .unwrap();
    assert_eq!(closed, json!({"closed": true}));

    // The client notices and starts reconnecting.
    let mut states = client.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|s| *s != ConnectionState::Connected),
    )
    .await
    .expect("client sees the close")
    .unwrap();

    drop(server);
}
