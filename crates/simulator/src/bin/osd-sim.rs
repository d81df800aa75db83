//! osd-sim binary entry point
//!
//! Usage: `osd-sim <scenario.json> [report.json]`. Prints the report to
//! stdout when no output path is given.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simulator::SimulationConfig;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "osd_sim=info,simulator=info,optim_state=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let scenario = args
        .next()
        .ok_or("usage: osd-sim <scenario.json> [report.json]")?;
    let output = args.next();

    let config = SimulationConfig::from_file(&scenario)?;
    tracing::info!(
        "Running {} on {} ranks",
        scenario,
        config.world_size
    );
    let report = simulator::run(&config)?;

    match output {
        Some(path) => {
            report.write_to(&path)?;
            tracing::info!("Report written to {}", path);
        }
        None => println!("{}", report.to_json()?),
    }

    if !report.round_trip_ok() {
        return Err("saved state does not match the reference".into());
    }
    Ok(())
}
