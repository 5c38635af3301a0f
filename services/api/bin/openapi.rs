//! Writes the service's OpenAPI document to disk.

use clap::Parser;
use patient_sim_api::router::ApiDoc;
use std::path::{Path, PathBuf};
use utoipa::OpenApi;

#[derive(Parser, Debug)]
#[command(name = "openapi", about = "Write the OpenAPI document for the patient simulator API")]
struct Cli {
    /// Output file
    #[arg(long, short, value_name = "PATH", default_value = "openapi.json")]
    out: PathBuf,
}

fn generate_spec(api_doc: utoipa::openapi::OpenApi, path: &Path) -> anyhow::Result<()> {
    let spec_json = api_doc.to_pretty_json()?;
    std::fs::write(path, spec_json)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    generate_spec(ApiDoc::openapi(), &cli.out)?;
    println!("Wrote {}", cli.out.display());
    Ok(())
}
