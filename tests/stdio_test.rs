mod helpers;

use memhub::transport::stdio;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Feed `input` lines to a stdio session and collect every frame it writes.
async fn converse(input: &[Value], raw_tail: Option<&str>) -> Vec<Value> {
    let manager = helpers::manager();
    let (mut client_in, server_in) = tokio::io::duplex(1 << 20);
    let (server_out, mut client_out) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move { stdio::run(manager, "local", server_in, server_out).await });

    let mut text = String::new();
    for frame in input {
        text.push_str(&frame.to_string());
        text.push_str("\n\n");
    }
    if let Some(tail) = raw_tail {
        text.push_str(tail);
        text.push('\n');
    }
    client_in.write_all(text.as_bytes()).await.unwrap();
    drop(client_in);

    server.await.unwrap().unwrap();
    let mut output = String::new();
    client_out.read_to_string(&mut output).await.unwrap();
    output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn response(frames: &[Value], id: u64) -> &Value {
    frames
        .iter()
        .find(|f| f["id"] == id)
        .unwrap_or_else(|| panic!("no response with id {id}"))
}

fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"protocol": "memhub/1", "id": id, "method": method, "params": params})
}

#[tokio::test]
async fn local_session_runs_every_capability() {
    let frames = converse(
        &[
            request(1, "initialize", json!({"clientInfo": {"name": "test"}})),
            json!({"protocol": "memhub/1", "method": "notifications/initialized"}),
            request(
                2,
                "capabilities/call",
                json!({"name": "memory_store", "arguments": {"key": "lang_pref", "value": "prefers Go"}}),
            ),
            request(3, "capabilities/call", json!({"name": "memory_export", "arguments": {}})),
            request(4, "terminate", Value::Null),
        ],
        None,
    )
    .await;

    let init = response(&frames, 1);
    assert_eq!(init["result"]["trust"], "local");
    assert_eq!(init["result"]["owner"], "local");
    assert_eq!(init["result"]["capabilities"].as_array().unwrap().len(), 17);

    assert_eq!(response(&frames, 2)["result"]["created"], true);
    assert_eq!(response(&frames, 3)["result"]["manifest"]["records"], 1);
    assert_eq!(response(&frames, 4)["result"]["terminated"], true);

    // The notification produced no response frame.
    let responses = frames.iter().filter(|f| f.get("event").is_none()).count();
    assert_eq!(responses, 4);

    let events: Vec<&str> = frames.iter().filter_map(|f| f["event"].as_str()).collect();
    assert_eq!(events.first(), Some(&"session/ready"));
    assert!(events.contains(&"call/started"));
    assert!(events.contains(&"call/completed"));
}

#[tokio::test]
async fn malformed_line_ends_the_session() {
    let frames = converse(&[request(1, "initialize", json!({}))], Some("{this is not json")).await;
    let error = frames
        .iter()
        .find(|f| !f["error"].is_null())
        .expect("malformed frame got no error");
    assert_eq!(error["error"]["kind"], "invalid_request");
    assert!(error["id"].is_null());
}
