#!/usr/bin/env cargo
use std::collections::BTreeSet;
use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;

use meshgate::api::paths;

#[derive(Parser)]
#[command(name = "meshgate-admin")]
#[command(about = "meshgate cluster administration tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check health of nodes
    Health {
        /// Admin API addresses (e.g., "127.0.0.1:8510,127.0.0.1:8520")
        #[arg(long)]
        nodes: String,
    },
    /// Show each node's own status record and load
    Status {
        #[arg(long)]
        nodes: String,
    },
    /// List a service's registered nodes as seen from one node
    Nodes {
        /// Admin API address of the node to ask
        #[arg(long)]
        node: SocketAddr,
        #[arg(long)]
        service: String,
    },
    /// Ask one node which instance it would route a call for `service` to
    Select {
        #[arg(long)]
        node: SocketAddr,
        #[arg(long)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Health { nodes } => check_health(&client, &nodes).await?,
        Commands::Status { nodes } => show_status(&client, &nodes).await?,
        Commands::Nodes { node, service } => {
            let url = format!("http://{}{}", node, paths::nodes_path(&service));
            print_json(&client, &url).await?;
        }
        Commands::Select { node, service } => {
            let url = format!("http://{}{}", node, paths::select_path(&service));
            print_json(&client, &url).await?;
        }
    }

    Ok(())
}

async fn check_health(client: &Client, nodes: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Checking node health...");
    for node in parse_addresses(nodes)? {
        let url = format!("http://{}{}", node, paths::base::HEALTH);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => println!("OK   {}", node),
            Ok(response) => println!("FAIL {}: HTTP {}", node, response.status()),
            Err(e) => println!("FAIL {}: unreachable ({})", node, e),
        }
    }
    Ok(())
}

async fn show_status(client: &Client, nodes: &str) -> Result<(), Box<dyn std::error::Error>> {
    for node in parse_addresses(nodes)? {
        let url = format!("http://{}{}", node, paths::cluster::STATUS);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.json::<Value>().await {
                Ok(status) => println!(
                    "{} {} running={} executing={} pending={}",
                    node,
                    status["node_id"].as_str().unwrap_or("unknown"),
                    status["status"]["Running"],
                    status["executing"],
                    status["pending_calls"],
                ),
                Err(_) => println!("{}: invalid response format", node),
            },
            Ok(response) => println!("{}: HTTP {}", node, response.status()),
            Err(e) => println!("{}: unreachable ({})", node, e),
        }
    }
    Ok(())
}

async fn print_json(client: &Client, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.get(url).send().await?;
    let status = response.status();
    let body: Value = response.json().await?;
    if !status.is_success() {
        return Err(format!("HTTP {}: {}", status, body).into());
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn parse_addresses(addresses: &str) -> Result<BTreeSet<SocketAddr>, Box<dyn std::error::Error>> {
    addresses
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<SocketAddr>()
                .map_err(|e| format!("Invalid address '{}': {}", s, e).into())
        })
        .collect()
}
