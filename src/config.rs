use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap_serde_derive::ClapSerde;
use tracing::info;

use crate::net::outbound_ip;

#[derive(ClapSerde, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(8080)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Bind to the detected outbound-facing IP instead of `address`
    #[default(false)]
    #[arg(long, env)]
    pub(crate) outbound_address: bool,

    /// Path to the ONNX model file
    #[default("./models/rf_iris.onnx".to_string())]
    #[arg(short, long, env)]
    pub(crate) model_file: String,

    /// Directory holding the ONNX Runtime shared libraries
    #[default("./third_party".to_string())]
    #[arg(short, long, env)]
    pub(crate) library_dir: String,

    /// Name of the model's feature input tensor
    #[default("X".to_string())]
    #[arg(long, env)]
    pub(crate) input_name: String,

    /// Name of the model's label output tensor
    #[default("output_label".to_string())]
    #[arg(long, env)]
    pub(crate) output_name: String,

    /// OTLP collector endpoint, telemetry is only exported when set
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) otel_endpoint: String,

    /// Log to the console even when exporting telemetry
    #[default(false)]
    #[arg(long, env)]
    pub(crate) console: bool,

    /// PEM certificate file, serves HTTPS together with `tls_key_file`
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) tls_cert_file: String,

    /// PEM private key file
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) tls_key_file: String,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<<Self as ClapSerde>::Opt> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }

    /// Whether `err` from [`Config::from_toml`] only means the file is absent.
    pub fn is_missing_file(err: &anyhow::Error) -> bool {
        err.downcast_ref::<io::Error>()
            .is_some_and(|err| err.kind() == io::ErrorKind::NotFound)
    }

    pub fn otel_endpoint(&self) -> Option<String> {
        Some(self.otel_endpoint.clone()).filter(|endpoint| !endpoint.is_empty())
    }

    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        if self.tls_cert_file.is_empty() || self.tls_key_file.is_empty() {
            return None;
        }
        Some((
            PathBuf::from(&self.tls_cert_file),
            PathBuf::from(&self.tls_key_file),
        ))
    }

    /// The IP the listener binds to, detecting the outbound one if asked to.
    pub fn bind_ip(&self) -> Result<IpAddr> {
        if self.outbound_address {
            let ip = outbound_ip().context("Failed to detect outbound IP")?;
            info!("Detected outbound IP {}", ip);
            return Ok(ip);
        }
        self.address
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.address))
    }
}
