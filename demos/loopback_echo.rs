use bytes::Bytes;
use rdma_direct::transport::framing::{read_frame, write_frame, DEFAULT_MAX_MESSAGE_SIZE};
use rdma_direct::{accept, connect, LoopbackFabric, TransportConfig};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rounds: usize = env::args()
        .nth(1)
        .map(|s| s.parse().expect("rounds must be a number"))
        .unwrap_or(1000);
    let addr: SocketAddr = "10.0.0.1:18515".parse().expect("valid address");

    let fabric = LoopbackFabric::new();
    let listener = fabric.listen(addr).expect("address free");

    let server = tokio::spawn(async move {
        let conn = accept(&listener, TransportConfig::default()).await?;
        println!("echo server accepted a connection");
        loop {
            let msg = match read_frame(&conn, DEFAULT_MAX_MESSAGE_SIZE).await {
                Ok(m) => m,
                Err(e) => {
                    eprintln!("recv error: {e}");
                    break;
                }
            };
            if let Err(e) = write_frame(&conn, msg, DEFAULT_MAX_MESSAGE_SIZE).await {
                eprintln!("send error: {e}");
                break;
            }
        }
        Ok::<_, rdma_direct::Error>(())
    });

    let client = connect(Arc::new(fabric.clone()), addr, TransportConfig::default()).await?;
    println!("connected: {:?}", client.params());

    let start = Instant::now();
    for i in 0..rounds {
        // Alternate small messages with ones that need several fragments.
        let len = if i % 2 == 0 { 64 } else { 16 * 1024 };
        let payload = Bytes::from(vec![(i % 256) as u8; len]);
        write_frame(&client, payload.clone(), DEFAULT_MAX_MESSAGE_SIZE).await?;
        let echoed = read_frame(&client, DEFAULT_MAX_MESSAGE_SIZE).await?;
        assert_eq!(echoed, payload, "echo mismatch in round {i}");
    }
    let elapsed = start.elapsed();
    println!(
        "{rounds} round trips in {elapsed:?} ({:.1} us/rt)",
        elapsed.as_secs_f64() * 1e6 / rounds as f64
    );
    println!("client stats: {:?}", client.stats());

    println!("teardown: {:?}", client.destroy().await);
    if let Ok(Err(e)) = server.await {
        eprintln!("server error: {e}");
    }
    Ok(())
}
