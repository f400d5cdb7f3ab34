mod extract;
mod fetch;
mod output;
mod pipeline;
mod schema;
mod settings;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use extract::OpenAiExtractor;
use fetch::SpiderSource;
use output::OutputTarget;
use pipeline::{AbortReason, Outcome, Request};
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "harvester",
    about = "Extract structured data from a web page with an LLM"
)]
struct Cli {
    /// URL of the website to scrape
    #[arg(short, long, required_unless_present = "list_schemas")]
    url: Option<String>,
    /// Name of the schema to extract, as declared in the definitions file
    #[arg(short, long, required_unless_present = "list_schemas")]
    schema: Option<String>,
    /// Output file path (.json is overwritten, .csv is appended to)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Schema definitions file
    #[arg(short, long, default_value = schema::DEFAULT_DEFINITIONS)]
    definitions: PathBuf,
    /// Print the schemas found in the definitions file and exit
    #[arg(long)]
    list_schemas: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    if cli.list_schemas {
        for name in schema::list_schemas(&cli.definitions)? {
            println!("{}", name);
        }
        return Ok(());
    }

    let req = Request {
        url: cli.url.context("--url is required")?,
        schema: cli.schema.context("--schema is required")?,
        definitions: cli.definitions,
        output: cli.output.map(OutputTarget::from_path),
    };

    let settings = Settings::from_env()?;
    let source = SpiderSource::new(settings.spider_api_key.clone());
    let extractor = OpenAiExtractor::new(&settings);

    match pipeline::run(&req, &source, &extractor).await? {
        Outcome::Done(json) => println!("{}", json),
        Outcome::Aborted(AbortReason::SchemaUnavailable(json)) => println!("{}", json),
        Outcome::Aborted(AbortReason::NoContent) => println!("No markdown generated."),
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        info!("Done in {}", format_duration(elapsed));
    }

    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
