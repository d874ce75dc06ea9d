//! gremlin-console - run one Gremlin query from the command line

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gremlin_session::{Client, ConnectArgs, Query};

#[derive(Parser, Debug)]
#[command(name = "gremlin-console")]
#[command(about = "Submit a Gremlin query over a WebSocket session")]
struct Args {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Gremlin script to evaluate
    #[arg(long, short)]
    query: String,

    /// Parameter binding as name=<json>, repeatable
    #[arg(long = "binding", short, value_parser = parse_binding)]
    bindings: Vec<(String, Value)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

fn parse_binding(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("binding '{raw}' must look like name=<json>"))?;
    if name.is_empty() {
        return Err(format!("binding '{raw}' has an empty name"));
    }
    // Bare words are taken as strings
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gremlin_session={},info", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match args.connect.to_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let mut query = Query::new(args.query.clone());
    for (name, value) in args.bindings {
        query = query.bind(name, value);
    }

    info!("Connecting to {}", config.address);
    let client = Client::connect(config)
        .await
        .context("failed to connect to Gremlin Server")?;

    let outcome = client.submit(query).await;
    client.close().await;

    let result = outcome.context("query failed")?;
    println!("{}", serde_json::to_string_pretty(&result.data)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        assert_eq!(parse_binding("x=1").unwrap(), ("x".to_string(), serde_json::json!(1)));
        assert_eq!(
            parse_binding("name=marko").unwrap(),
            ("name".to_string(), Value::String("marko".to_string()))
        );
        assert_eq!(
            parse_binding("ids=[1,2]").unwrap().1,
            serde_json::json!([1, 2])
        );
        assert!(parse_binding("novalue").is_err());
        assert!(parse_binding("=1").is_err());
    }
}
