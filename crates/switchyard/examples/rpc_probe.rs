//! RPC Probe - Simple CLI tool to test broker connectivity and RPC calls
//!
//! Usage: cargo run --example rpc_probe -- [OPTIONS]
//!
//! Options:
//!   -H, --host <HOST>       Broker host [default: 127.0.0.1]
//!   -p, --port <PORT>       Broker port [default: 1883]
//!   -s, --service <NAME>    Target service [default: gateway]
//!   -m, --method <NAME>     Method to call [default: ping]
//!   -t, --timeout <MS>      Call timeout in milliseconds [default: 5000]
//!   -c, --count <N>         Number of calls to issue [default: 1]

use std::sync::Arc;
use std::time::Instant;

use switchyard::{BrokerSession, RpcClient};
use yardconf::BrokerConfig;
use yardproto::{Authority, TopicConfig};

fn parse_args() -> (String, u16, String, String, u64, usize) {
    let args: Vec<String> = std::env::args().collect();
    let mut host = "127.0.0.1".to_string();
    let mut port = 1883u16;
    let mut service = "gateway".to_string();
    let mut method = "ping".to_string();
    let mut timeout_ms = 5000u64;
    let mut count = 1usize;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-H" | "--host" => {
                i += 1;
                if i < args.len() {
                    host = args[i].clone();
                }
            }
            "-p" | "--port" => {
                i += 1;
                if i < args.len() {
                    port = args[i].parse().unwrap_or(1883);
                }
            }
            "-s" | "--service" => {
                i += 1;
                if i < args.len() {
                    service = args[i].clone();
                }
            }
            "-m" | "--method" => {
                i += 1;
                if i < args.len() {
                    method = args[i].clone();
                }
            }
            "-t" | "--timeout" => {
                i += 1;
                if i < args.len() {
                    timeout_ms = args[i].parse().unwrap_or(5000);
                }
            }
            "-c" | "--count" => {
                i += 1;
                if i < args.len() {
                    count = args[i].parse().unwrap_or(1);
                }
            }
            "-h" | "--help" => {
                println!("RPC Probe - Test broker connectivity and RPC calls");
                println!();
                println!("Usage: cargo run --example rpc_probe -- [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -H, --host <HOST>     Broker host [default: 127.0.0.1]");
                println!("  -p, --port <PORT>     Broker port [default: 1883]");
                println!("  -s, --service <NAME>  Target service [default: gateway]");
                println!("  -m, --method <NAME>   Method to call [default: ping]");
                println!("  -t, --timeout <MS>    Call timeout in ms [default: 5000]");
                println!("  -c, --count <N>       Number of calls [default: 1]");
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown option: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    (host, port, service, method, timeout_ms, count)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (host, port, service, method, timeout_ms, count) = parse_args();

    let mut config = BrokerConfig::default();
    config.client_id = format!("rpc-probe-{}", std::process::id());
    config.broker_host = host.clone();
    config.broker_port = port;

    println!("connecting to {}:{} as {}", host, port, config.client_id);
    let session = Arc::new(BrokerSession::new(config)?);
    let client = RpcClient::new(session.clone(), TopicConfig::default()).await?;
    session.start()?;

    // Give the session a moment to complete the handshake.
    for _ in 0..50 {
        if session.state() == switchyard::ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    println!("session state: {}", session.state().as_str());

    for n in 1..=count {
        let request = yardproto::RpcRequest::new(
            method.as_str(),
            service.as_str(),
            Authority::User,
            Some(serde_json::json!({"probe_sequence": n})),
            timeout_ms,
        );
        let id = request.transaction_id.clone();
        let started = Instant::now();
        print!("[{}/{}] {} {}/{} ... ", n, count, id, service, method);

        match client.call_sync(request, timeout_ms).await {
            Ok(response) => {
                println!(
                    "{} in {:?} (result: {})",
                    if response.success { "ok" } else { "rejected" },
                    started.elapsed(),
                    response
                        .result
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
            }
            Err(e) => {
                println!("failed in {:?}: {}", started.elapsed(), e);
            }
        }
    }

    let stats = session.statistics();
    println!(
        "stats: sent={} received={} requests={} responses={} errors={}",
        stats.messages_sent,
        stats.messages_received,
        stats.requests_sent,
        stats.responses_received,
        stats.errors
    );

    client.shutdown();
    session.stop().await;
    Ok(())
}
