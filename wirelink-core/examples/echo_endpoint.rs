//! Endpoint demo: two endpoints over an in-memory transport.
//!
//! Walks through the core flows end to end: routed request/response,
//! error replies, fire-and-forget events, and the queued resend layer
//! riding out a simulated outage.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use wirelink_core::prelude::*;
use wirelink_core::test_utils::MockConnection;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("wirelink endpoint demo");
    println!("======================\n");

    let device_conn = MockConnection::new();
    let api_conn = MockConnection::new();
    let (shutdown, _) = broadcast::channel(1);

    // Device side: endpoint + router serving two actions.
    let device = Arc::new(Endpoint::new(
        device_conn.clone(),
        EndpointConfig::with_source(SOURCE_DEVICE),
    ));
    let mut router = Router::new();
    router.layer(middleware(|inner| {
        handler(move |request: Request, responder: Responder| {
            tracing::info!(action = request.action(), "handling request");
            inner(request, responder)
        })
    }));
    router.handle_fn("camera.list", |_| async {
        Ok(Some(json!([{"id": "front"}, {"id": "rear"}])))
    });
    router.handle(
        "camera.switch",
        handler(|request: Request, responder: Responder| async move {
            let target: String = request.decode_payload()?;
            if target == "front" {
                responder.ok(Some(json!({"active": target}))).await
            } else {
                Err(Error::handler(codes::NOT_FOUND, format!("no camera '{target}'")))
            }
        }),
    );

    let device_inbound = device.inbound().expect("device inbound");
    spawn_listen(&device, &shutdown);
    {
        let router = Arc::new(router);
        let sender: Arc<dyn MessageSender> = device.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { router.serve(sender, device_inbound, rx).await });
    }

    // API side: a plain endpoint issuing requests.
    let api = Arc::new(Endpoint::new(api_conn.clone(), EndpointConfig::with_source(SOURCE_API)));
    spawn_listen(&api, &shutdown);
    spawn_bridge(&api_conn, &device_conn);

    // 1. Routed request/response.
    let reply = api
        .send_and_await(Envelope::request("camera.list", SOURCE_API, None), Duration::from_secs(1))
        .await?;
    println!("camera.list -> {}", reply.payload().unwrap());

    // 2. Error reply surfaces as a structured peer error.
    let err = api
        .send_and_await(
            Envelope::request("camera.switch", SOURCE_API, Some(json!("basement"))),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    println!("camera.switch(basement) -> {err}");

    // 3. Queued resend across an outage.
    let queued = QueuedEndpoint::new(
        device.clone(),
        QueueConfig {
            flush_interval: Duration::from_millis(50),
            critical_action_prefixes: vec!["webrtc.session".into()],
            ..QueueConfig::default()
        },
    );

    device_conn.set_down(true);
    queued
        .send_event("webrtc.session.offer", Some(json!({"sdp": "..."})), "chan-1")
        .await?;
    println!(
        "outage: critical event queued without error ({} queued)",
        queued.size()
    );

    device_conn.set_down(false);
    if queued.wait_until_empty(Duration::from_secs(2)).await {
        println!("link restored: queue drained");
    }

    queued.close().await?;
    api.close().await?;
    let _ = shutdown.send(());
    println!("\ndone");
    Ok(())
}

fn spawn_listen(endpoint: &Arc<Endpoint>, shutdown: &broadcast::Sender<()>) {
    let endpoint = endpoint.clone();
    let rx = shutdown.subscribe();
    tokio::spawn(async move { endpoint.listen(rx).await });
}

/// Copy frames written by each side into the other side's read stream.
fn spawn_bridge(api_conn: &Arc<MockConnection>, device_conn: &Arc<MockConnection>) {
    let api_conn = api_conn.clone();
    let device_conn = device_conn.clone();
    tokio::spawn(async move {
        let (mut api_seen, mut device_seen) = (0usize, 0usize);
        loop {
            for frame in api_conn.sent_frames().iter().skip(api_seen) {
                device_conn.inject(frame.clone());
                api_seen += 1;
            }
            for frame in device_conn.sent_frames().iter().skip(device_seen) {
                api_conn.inject(frame.clone());
                device_seen += 1;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
}
