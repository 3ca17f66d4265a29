use std::env;
use std::error;
use std::process::ExitCode;

use reqwest::Url;
use serde::Deserialize;

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

fn main() -> Result<ExitCode, Box<dyn error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: classifier_runner_health <URL>");
        return Ok(ExitCode::from(2));
    }

    let url = Url::parse(&args[1])?;

    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        eprintln!("Health check failed with status {}", response.status());
        return Ok(ExitCode::FAILURE);
    }

    let body: HealthResponse = response.json()?;
    if body.status != "healthy" {
        eprintln!("Server reported status {}", body.status);
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}
