//! Fires a burst of concurrent votes at a running server and tallies what came back.
//!
//! Without `--shared-token` every request is a brand new voter, which exercises
//! the per-IP rate limit. With it, one vote mints a token and the burst reuses
//! it on the same question, so exactly zero more should be accepted.
use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:1111")]
    url: String,

    #[arg(long)]
    question: String,

    #[arg(long, default_value_t = 100)]
    count: usize,

    #[arg(long, default_value = "yes")]
    response: String,

    /// Reuse one voter token for the whole burst.
    #[arg(long)]
    shared_token: bool,

    /// Value sent as `X-Forwarded-For`. Only honored by a server started with
    /// `TRUSTED_PROXY_HOPS`, and then only the entries its proxies appended.
    #[arg(long)]
    forwarded_for: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    voter_token: String,
    xp_awarded: i64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Accepted,
    Duplicate,
    RateLimited,
    Other(u16),
    Failed,
}

impl From<StatusCode> for Outcome {
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::CREATED | StatusCode::OK => Outcome::Accepted,
            StatusCode::CONFLICT => Outcome::Duplicate,
            StatusCode::TOO_MANY_REQUESTS => Outcome::RateLimited,
            other => Outcome::Other(other.as_u16()),
        }
    }
}

struct Target {
    client: Client,
    endpoint: String,
    body: serde_json::Value,
    forwarded_for: Option<String>,
}

impl Target {
    async fn vote(&self, token: Option<&str>) -> reqwest::Result<reqwest::Response> {
        let mut request = self.client.post(&self.endpoint).json(&self.body);

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(ip) = &self.forwarded_for {
            request = request.header("X-Forwarded-For", ip);
        }

        request.send().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let target = Arc::new(Target {
        client: Client::new(),
        endpoint: format!("{}/votes", args.url.trim_end_matches('/')),
        body: json!({ "questionId": args.question, "response": args.response }),
        forwarded_for: args.forwarded_for,
    });

    let token = if args.shared_token {
        let res = target.vote(None).await.context("seeding vote failed")?;
        if !res.status().is_success() {
            bail!("seeding vote rejected with {}", res.status());
        }

        let receipt: Receipt = res.json().await.context("unreadable receipt")?;
        println!("Seeded voter, earned {} XP", receipt.xp_awarded);
        Some(receipt.voter_token)
    } else {
        None
    };

    let pb = ProgressBar::new(args.count as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("=> "),
    );

    let mut tasks = JoinSet::new();
    for _ in 0..args.count {
        let target = target.clone();
        let token = token.clone();

        tasks.spawn(async move {
            match target.vote(token.as_deref()).await {
                Ok(res) => Outcome::from(res.status()),
                Err(_) => Outcome::Failed,
            }
        });
    }

    let mut tally: BTreeMap<Outcome, usize> = BTreeMap::new();
    while let Some(outcome) = tasks.join_next().await {
        *tally.entry(outcome?).or_default() += 1;
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!("Requests: {}", args.count);
    for (outcome, count) in &tally {
        println!("{outcome:?}: {count}");
    }

    if args.shared_token && tally.contains_key(&Outcome::Accepted) {
        bail!("a shared token was accepted twice for the same question");
    }

    Ok(())
}
