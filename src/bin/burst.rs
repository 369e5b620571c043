use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;

/// Fires a burst of identical requests at the idempotent endpoint and
/// tallies how each was answered.
#[derive(Parser)]
#[command(name = "idem-burst")]
#[command(about = "Concurrent duplicate-request driver for the idempotency service")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8080/")]
    url: String,
    #[arg(long, default_value_t = 10)]
    requests: usize,
    #[arg(long, default_value = r#"{"name":"test"}"#)]
    body: String,
    /// Sent as the idempotency key header when set.
    #[arg(long)]
    key: Option<String>,
    #[arg(long, default_value = "Idempotency-Key")]
    key_header: String,
}

#[derive(Debug)]
struct Answer {
    status: u16,
    replayed: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let payload: Value = serde_json::from_str(&cli.body).context("--body must be valid JSON")?;
    let client = reqwest::Client::new();

    let calls = (0..cli.requests).map(|_| {
        let mut request = client.post(&cli.url).json(&payload);
        if let Some(key) = &cli.key {
            request = request.header(cli.key_header.as_str(), key.as_str());
        }
        async move {
            let response = request.send().await?;
            let replayed = response
                .headers()
                .get("idempotency-replayed")
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string);
            Ok::<_, reqwest::Error>(Answer {
                status: response.status().as_u16(),
                replayed,
            })
        }
    });

    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    let mut executed = 0;
    for answer in join_all(calls).await {
        let label = match answer {
            Ok(Answer {
                status,
                replayed: Some(replayed),
            }) => {
                if replayed == "false" {
                    executed += 1;
                }
                format!("{} replayed={}", status, replayed)
            }
            Ok(Answer { status, .. }) => status.to_string(),
            Err(err) => format!("transport error: {}", err),
        };
        *tally.entry(label).or_default() += 1;
    }

    for (label, count) in &tally {
        println!("{:>4} x {}", count, label);
    }
    println!("executions observed: {}", executed);

    if executed > 1 {
        anyhow::bail!("business logic ran {} times for one logical request", executed);
    }
    Ok(())
}
