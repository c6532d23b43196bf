use anyhow::{Result, anyhow};
use heap_snapshot_proxy::{ProxyConfig, WorkerChannel, WorkerProxy};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::test]
async fn newline_json_transport_round_trips_calls_and_events() -> Result<()> {
    let (client, server) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, mut server_write) = tokio::io::split(server);

    let channel = WorkerChannel::connect_with_io(Box::new(client_write), Box::new(client_read))?;
    let (proxy, mut channels) = WorkerProxy::new(channel, ProxyConfig::default())?;

    let server_task = tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await? {
            let request: Value = serde_json::from_str(&line)?;
            let disposition = request["disposition"].as_str().unwrap_or_default().to_string();
            seen.push(disposition.clone());
            if disposition != "method" {
                continue;
            }

            server_write.write_all(b"this is not json\n").await?;
            let event = json!({"eventName": "ProgressUpdate", "data": {"step": 1}});
            server_write
                .write_all(format!("{event}\n").as_bytes())
                .await?;
            let reply = json!({
                "callId": request["callId"],
                "result": {"echo": request["methodArguments"]}
            });
            server_write
                .write_all(format!("{reply}\n").as_bytes())
                .await?;
            server_write.flush().await?;
            break;
        }
        Ok::<_, anyhow::Error>(seen)
    });

    let object = proxy.create_object("Thing")?;
    let result: Value = object
        .call_method_async("echo", vec![json!("hi"), json!(3)])
        .await?;
    assert_eq!(result, json!({"echo": ["hi", 3]}));

    let event = channels
        .events
        .recv()
        .await
        .ok_or_else(|| anyhow!("event stream ended"))?;
    assert_eq!(event.name, "ProgressUpdate");
    assert_eq!(event.data, json!({"step": 1}));

    let seen = server_task.await??;
    assert_eq!(seen, vec!["create".to_string(), "method".to_string()]);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn spawned_echo_worker_answers_every_call_with_null() -> Result<()> {
    use heap_snapshot_proxy::WorkerProcessConfig;

    let channel = WorkerChannel::spawn(&WorkerProcessConfig::new("cat"))?;
    let (proxy, _channels) = WorkerProxy::new(channel, ProxyConfig::default())?;
    let object = proxy.create_object("Thing")?;

    let result: Value = object.call_method_async("ping", Vec::new()).await?;
    assert_eq!(result, Value::Null);
    assert_eq!(proxy.pending_calls(), 0);

    proxy.dispose();
    assert!(proxy.is_disposed());
    Ok(())
}
