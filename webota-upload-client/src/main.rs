//! Firmware upload client
//!
//! Sends a firmware image to a device running the update server, either as
//! the same multipart form the browser page posts or as a raw push.
//!
//! Usage: cargo run -p webota-upload-client -- --file firmware.bin [OPTIONS]

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Body, Client};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use webota_lib::format_bytes;
use webota_lib::upload::PASSWORD_FIELD;

#[derive(Parser, Debug)]
#[command(name = "webota-upload")]
#[command(about = "Upload a firmware image to a device")]
struct Args {
    /// Device address, with optional scheme and port
    #[arg(short, long, default_value = "webota-esp32.local")]
    address: String,

    /// Update password
    #[arg(short, long)]
    password: Option<String>,

    /// Firmware image to upload
    #[arg(short, long)]
    file: PathBuf,

    /// Use the raw push endpoint instead of the upload form
    #[arg(long)]
    push: bool,

    /// Seconds to wait for the whole exchange, device answer included
    #[arg(short, long, default_value = "60")]
    timeout: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// How the device answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Unauthorized,
    Busy,
    Rejected,
}

impl Verdict {
    fn from_status(status: u16) -> Self {
        match status {
            200 => Self::Success,
            401 => Self::Unauthorized,
            409 => Self::Busy,
            _ => Self::Rejected,
        }
    }

    const fn message(self) -> &'static str {
        match self {
            Self::Success => "Update successful, the device is restarting",
            Self::Unauthorized => "Wrong or missing password",
            Self::Busy => "Another update is already in progress",
            Self::Rejected => "Update failed",
        }
    }

    const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Rejected => 1,
            Self::Unauthorized => 2,
            Self::Busy => 3,
        }
    }
}

/// Base URL for `address`, which may be a bare host, `host:port` or a URL.
fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Multipart form the upload page posts. The password field goes first so
/// the device can check it before any flash is touched.
fn upload_form(password: Option<&str>, filename: &str, image: Part) -> Result<Form> {
    let mut form = Form::new();
    if let Some(password) = password {
        form = form.text(PASSWORD_FIELD, password.to_string());
    }
    let image = image
        .file_name(filename.to_string())
        .mime_str("application/octet-stream")?;
    Ok(form.part("firmware", image))
}

fn upload(args: &Args) -> Result<Verdict> {
    let image = File::open(&args.file).with_context(|| format!("opening {}", args.file.display()))?;
    let image_len = image.metadata()?.len();
    if image_len == 0 {
        bail!("{} is empty", args.file.display());
    }
    let filename = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("firmware.bin");

    let client = Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
        .context("building HTTP client")?;
    let base = base_url(&args.address);

    let pb = progress_bar(image_len)?;
    let reader = pb.wrap_read(image);
    let request = if args.push {
        info!("Pushing {} ({}) to {base}", filename, format_bytes(usize::try_from(image_len)?));
        let mut request = client
            .post(format!("{base}/api/ota/push"))
            .header("Content-Type", "application/octet-stream")
            .body(Body::sized(reader, image_len));
        if let Some(password) = &args.password {
            request = request.header("X-OTA-Password", password);
        }
        request
    } else {
        info!("Uploading {} ({}) to {base}", filename, format_bytes(usize::try_from(image_len)?));
        let part = Part::reader_with_length(reader, image_len);
        let form = upload_form(args.password.as_deref(), filename, part)?;
        client.post(format!("{base}/update")).multipart(form)
    };

    let result = request.send();
    pb.finish_and_clear();
    let response = result.with_context(|| format!("sending to {base}"))?;

    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    let body = body.trim();
    let verdict = Verdict::from_status(status);
    if body.is_empty() {
        info!("{} (HTTP {status})", verdict.message());
    } else {
        info!("{} (HTTP {status}): {body}", verdict.message());
    }
    Ok(verdict)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if !Path::new(&args.file).is_file() {
        log::error!("{} is not a file", args.file.display());
        return ExitCode::from(1);
    }

    match upload(&args) {
        Ok(verdict) => ExitCode::from(verdict.exit_code()),
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
