use anyhow::{bail, Context, Result};
use caba_transit::{ParkingRulesClient, RouteCatalog, TransitConfig};
use tracing::debug;

const USAGE: &str =
    "usage: caba-transit search <line> | caba-transit parking <latitude> <longitude>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = TransitConfig::from_env().context("invalid configuration")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [command, line] if command == "search" => search(&config, line),
        [command, latitude, longitude] if command == "parking" => {
            parking(config, latitude, longitude).await
        }
        _ => bail!(USAGE),
    }
}

fn search(config: &TransitConfig, line: &str) -> Result<()> {
    // Never run with a partial catalog
    let catalog = RouteCatalog::load(&config.routes_file).with_context(|| {
        format!(
            "could not load routes catalog from {}",
            config.routes_file.display()
        )
    })?;

    let routes = catalog.search(line);
    if routes.is_empty() {
        println!("No routes found for line {line}.");
    }
    for route in routes {
        println!("{route}");
    }
    Ok(())
}

async fn parking(config: TransitConfig, latitude: &str, longitude: &str) -> Result<()> {
    let latitude: f64 = latitude
        .trim()
        .parse()
        .with_context(|| format!("invalid latitude value: {latitude}"))?;
    let longitude: f64 = longitude
        .trim()
        .parse()
        .with_context(|| format!("invalid longitude value: {longitude}"))?;

    let client = ParkingRulesClient::with_default_transport(config.parking)?;
    match client.fetch_rules(latitude, longitude).await {
        Ok(rules) => {
            for (address, sentences) in rules {
                println!("{address}");
                for sentence in sentences {
                    println!("  - {sentence}");
                }
            }
            Ok(())
        }
        Err(e) if e.is_no_rules_found() => {
            debug!(error = ?e, "no parking rules");
            println!("No parking rules found for the specified location.");
            Ok(())
        }
        Err(e) => Err(e).context("error calling parking rules service"),
    }
}
