//! Basic driver-side usage: connect with a token and stream positions.
//! The buggy must already be marked running via the REST surface.
//!
//! ```bash
//! BUGGY_SERVER=ws://localhost:8000 BUGGY_TOKEN=<token> cargo run --example basic
//! ```

use std::time::Duration;

use buggy_client::BuggyClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let server = std::env::var("BUGGY_SERVER").unwrap_or_else(|_| "ws://localhost:8000".into());
    let token = std::env::var("BUGGY_TOKEN").expect("BUGGY_TOKEN must be set");

    let client = BuggyClient::connect(server, token).await;

    // Watch our own broadcasts come back (every viewer sees them too).
    let mut updates = client.updates();
    tokio::spawn(async move {
        while let Ok(event) = updates.recv().await {
            println!("server: {event:?}");
        }
    });

    // Simulated route: a few points along the campus loop.
    let route = [
        (40.4443, -79.9437, Some(90.0)),
        (40.4448, -79.9421, Some(75.0)),
        (40.4455, -79.9410, Some(60.0)),
    ];

    for (lat, lon, heading) in route {
        client
            .send_location(7, lat, lon, heading)
            .await
            .expect("send failed");
        println!("sent ({lat}, {lon}) connected={}", client.is_connected());
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    client.shutdown().await;
}
