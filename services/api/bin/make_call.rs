//! Command-line trigger for outbound test calls against a running API server.
//!
//! ```text
//! make_call                 list scenarios
//! make_call 3               run scenario 3
//! make_call all --delay 45  run every scenario, 45s apart
//! ```

use anyhow::{Context, bail};
use clap::Parser;
use patient_sim_api::models::{CallPlaced, ErrorResponse, ScenarioSummary};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    All,
    Index(usize),
}

fn parse_target(s: &str) -> Result<Target, String> {
    if s.eq_ignore_ascii_case("all") {
        return Ok(Target::All);
    }
    s.parse::<usize>()
        .map(Target::Index)
        .map_err(|_| format!("expected a scenario index or 'all', got '{s}'"))
}

/// Place patient-simulator test calls
#[derive(Parser, Debug)]
#[command(name = "make_call", version, about = "Place patient-simulator test calls")]
struct Cli {
    /// Scenario index, or `all`. Lists scenarios when omitted.
    #[arg(value_parser = parse_target)]
    scenario: Option<Target>,

    /// Seconds between calls when running all scenarios
    #[arg(long, value_name = "SECONDS", default_value = "30")]
    delay: u64,

    /// Base URL of the API server
    #[arg(long, value_name = "URL", default_value = "http://localhost:8000")]
    server: String,
}

struct ApiClient {
    http: reqwest::Client,
    server: String,
}

impl ApiClient {
    fn new(server: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
        })
    }

    async fn scenarios(&self) -> anyhow::Result<Vec<ScenarioSummary>> {
        let url = format!("{}/scenarios", self.server);
        let response = self.http.get(&url).send().await.with_context(|| {
            format!("Server not reachable at {}. Start it first with the `api` binary.", self.server)
        })?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn place(&self, index: usize) -> anyhow::Result<CallPlaced> {
        let url = format!("{}/calls/{index}", self.server);
        let response = self.http.post(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            bail!("{message}");
        }
        Ok(response.json().await?)
    }
}

async fn make_call(client: &ApiClient, index: usize) {
    println!("\nTriggering scenario {index}...");
    match client.place(index).await {
        Ok(placed) => {
            println!("   Call placed: {}", placed.scenario);
            println!("   Call ID: {}", placed.call_control_id);
        }
        Err(e) => println!("   Error: {e}"),
    }
}

async fn run_all(client: &ApiClient, scenarios: &[ScenarioSummary], delay: Duration) {
    let total = scenarios.len();
    for (i, scenario) in scenarios.iter().enumerate() {
        println!("\n{}", "=".repeat(60));
        println!("  [{}/{total}] {}", i + 1, scenario.name);
        println!("{}", "=".repeat(60));
        make_call(client, scenario.index).await;

        if i + 1 < total {
            println!("\n  Waiting {}s before next call...", delay.as_secs());
            tokio::time::sleep(delay).await;
        }
    }
    println!("\nAll {total} calls placed.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.server)?;
    let scenarios = client.scenarios().await?;

    match cli.scenario {
        None => {
            println!("\nAvailable scenarios:");
            for s in &scenarios {
                println!("  {:>2}: {}", s.index, s.name);
            }
            println!("\nUsage:");
            println!("  make_call <number>          run one scenario");
            println!("  make_call all               run all scenarios");
            println!("  make_call all --delay 45    custom delay between calls");
        }
        Some(Target::Index(index)) => make_call(&client, index).await,
        Some(Target::All) => run_all(&client, &scenarios, Duration::from_secs(cli.delay)).await,
    }
    Ok(())
}
