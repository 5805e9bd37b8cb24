//! demos/test_backend.rs
//! Origin server for trying the gateway by hand.
//! Run: cargo run --example test_backend -- <port> [name]
//!
//! Env: BASE_DELAY_MS, JITTER_MS, FAIL_PCT, GZIP=1 (compress every body).

use flate2::{write::GzEncoder, Compression};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use rand::Rng;
use std::{
    convert::Infallible,
    io::Write,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;

#[derive(Clone)]
struct OriginState {
    port: u16,
    name: String,
    req_counter: Arc<AtomicU64>,
    base_delay: u64,
    jitter_ms: u64,
    fail_pct: f64,
    gzip: bool,
}

fn reply(status: StatusCode, body: String, state: &OriginState) -> Response<Body> {
    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Origin-Name", state.name.clone());

    let body = if state.gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(body.as_bytes())
            .and_then(|_| encoder.finish());
        match compressed {
            Ok(bytes) => {
                builder = builder.header("Content-Encoding", "gzip");
                Body::from(bytes)
            }
            Err(_) => Body::from(body),
        }
    } else {
        Body::from(body)
    };

    builder.body(body).unwrap_or_default()
}

async fn handle(req: Request<Body>, state: OriginState) -> Result<Response<Body>, Infallible> {
    let n = state.req_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let path = req.uri().path().to_owned();

    // Simulated latency; /slow always takes ten seconds
    let delay = if path == "/slow" {
        10_000
    } else {
        state.base_delay + rand::thread_rng().gen_range(0..=state.jitter_ms)
    };
    if delay > 0 {
        sleep(Duration::from_millis(delay)).await;
    }

    if state.fail_pct > 0.0 && rand::thread_rng().gen_bool((state.fail_pct / 100.0).min(1.0)) {
        let body = format!(r#"{{"origin":"{}","error":"injected failure"}}"#, state.name);
        return Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, body, &state));
    }

    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("<binary>").to_string()),
            )
        })
        .collect();

    let body = serde_json::json!({
        "origin": state.name,
        "port": state.port,
        "req": n,
        "method": req.method().as_str(),
        "path": path,
        "query": req.uri().query(),
        "delay_ms": delay,
        "headers": headers,
    });

    Ok(reply(StatusCode::OK, body.to_string(), &state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "8001".into())
        .parse()?;
    let name = std::env::args()
        .nth(2)
        .or_else(|| std::env::var("ORIGIN_NAME").ok())
        .unwrap_or_else(|| format!("origin-{port}"));

    let base_delay = std::env::var("BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let jitter_ms = std::env::var("JITTER_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let fail_pct = std::env::var("FAIL_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let gzip = std::env::var("GZIP").map(|v| v == "1").unwrap_or(false);

    let state = OriginState {
        port,
        name: name.clone(),
        req_counter: Arc::new(AtomicU64::new(0)),
        base_delay,
        jitter_ms,
        fail_pct,
        gzip,
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let make_svc = make_service_fn(move |_conn| {
        let st = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, st.clone()))) }
    });

    println!(
        "Origin '{}' on http://{}  [delay={}ms±{} fail={}% gzip={}]",
        name, addr, base_delay, jitter_ms, fail_pct, gzip
    );

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
