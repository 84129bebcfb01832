//! Mock device for exercising the upload page and the upload client
//!
//! Runs the same update core as the firmware behind a small HTTP server,
//! writing committed images to a file instead of flash.
//!
//! Usage: cargo run -p webota-mock-device -- --password secret
//! Then open http://127.0.0.1:8080/ or point webota-upload at it.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Request, Response, Server};
use webota_lib::{
    Config, LogObserver, OtaService, PushRequest, StatusReport, StatusTracker, UploadReport,
    UploadRequest, UploadResponse, INDEX_HTML,
};

mod file_sink;

use file_sink::FileSink;

const CHUNK_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "webota-mock-device")]
#[command(about = "Serve the firmware update page on the host")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Update password (overrides the config file; empty disables the check)
    #[arg(short, long)]
    password: Option<String>,

    /// Where committed images are written
    #[arg(short, long, default_value = "webota-image.bin")]
    output: PathBuf,

    /// Fail the n-th chunk written to the sink
    #[arg(long)]
    fail_after: Option<usize>,

    /// JSON config file, same format as the device config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

struct Device {
    service: OtaService<FileSink>,
    tracker: StatusTracker,
    hostname: String,
    started: Instant,
}

impl Device {
    fn new(config: &Config, sink: FileSink) -> Self {
        let tracker = StatusTracker::new();
        let service = OtaService::new(config.ota_settings(), sink);
        service.subscribe(Box::new(LogObserver::default()));
        service.subscribe(Box::new(tracker.clone()));
        Self {
            service,
            tracker,
            hostname: config.hostname.clone(),
            started: Instant::now(),
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            Config::from_json(&json).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(password) = &args.password {
        config.ota_password.clone_from(password);
    }
    if args.verbose {
        config.verbose = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    env_logger::Builder::new()
        .filter_level(config.level_filter())
        .parse_default_env()
        .init();

    let sink = FileSink::new(&args.output, args.fail_after);
    info!("Committed images go to {}", sink.output().display());
    let device = Arc::new(Device::new(&config, sink));

    let server = Server::http(&args.listen).map_err(|e| anyhow!("binding {}: {e}", args.listen))?;
    info!("Mock device '{}' ready", config.hostname);
    if let Some(local) = server.server_addr().to_ip() {
        info!("Upload URL: http://{local}/");
        if let std::net::SocketAddr::V4(v4) = local {
            device.service.notify_network_connected(*v4.ip());
        }
    }

    serve(&device, &server);
    device.service.shutdown();
    Ok(())
}

/// Handle each request on its own thread so a slow upload doesn't block
/// the status endpoint.
fn serve(device: &Arc<Device>, server: &Server) {
    for request in server.incoming_requests() {
        let device = device.clone();
        std::thread::spawn(move || {
            let peer = request.remote_addr().copied();
            if let Err(e) = handle_request(&device, request) {
                warn!("HTTP: client {peer:?}: {e:#}");
            }
        });
    }
}

fn header(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_string())
}

fn respond(request: Request, status: u16, content_type: &str, body: String) -> Result<()> {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes("Content-Type", content_type) {
        response.add_header(header);
    }
    request.respond(response).context("sending response")
}

fn handle_request(device: &Device, mut request: Request) -> Result<()> {
    // Query strings are not used by any route
    let path = request.url().split('?').next().unwrap_or_default().to_string();
    let method = request.method().clone();
    info!("HTTP: {method} {path}");

    match (method, path.as_str()) {
        (Method::Get, "/") => respond(request, 200, "text/html", INDEX_HTML.to_string()),
        (Method::Get, "/api/status") => {
            let report = StatusReport::new(
                &device.hostname,
                device.service.is_update_in_progress(),
                device.started.elapsed().as_secs(),
                device.tracker.snapshot(),
            );
            respond(request, 200, "application/json", report.to_json())
        }
        (Method::Post, "/update") => {
            let content_type = header(&request, "Content-Type").unwrap_or_default();
            let length = request.body_length();
            let response = form_upload(device, &content_type, length, request.as_reader());
            respond(request, response.status, "text/plain", response.body)
        }
        (Method::Post, "/api/ota/push") => {
            let password = header(&request, "X-OTA-Password");
            let length = request.body_length();
            let response = push_upload(device, password.as_deref(), length, request.as_reader());
            respond(request, response.status, "text/plain", response.body)
        }
        _ => respond(request, 404, "text/plain", "Not found".to_string()),
    }
}

/// Feed `body` to the request in chunks and return how many bytes arrived.
///
/// Once `feed` returns false the rest of the body is read and discarded.
fn pump(mut body: impl Read, mut feed: impl FnMut(&[u8]) -> bool) -> std::io::Result<usize> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0;
    loop {
        let n = body.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
        if !feed(&buf[..n]) {
            // Drain so the client sees the response instead of a reset
            let drained = std::io::copy(&mut body, &mut std::io::sink())?;
            total += usize::try_from(drained).unwrap_or(usize::MAX);
        }
    }
}

/// True when a declared length says the body stopped early.
fn cut_short(total: usize, length: Option<usize>) -> bool {
    length.is_some_and(|length| total < length)
}

fn form_upload(device: &Device, content_type: &str, length: Option<usize>, body: impl Read) -> UploadResponse {
    let mut upload = match UploadRequest::new(&device.service, content_type) {
        Ok(upload) => upload,
        Err(response) => return response,
    };

    let received = pump(body, |chunk| {
        upload.feed(chunk);
        !upload.is_finished()
    });
    match received {
        Ok(total) if cut_short(total, length) => {
            warn!("Upload body ended after {total} of {length:?} bytes");
            upload.abort();
        }
        Ok(total) => debug!("Upload body complete: {total} bytes"),
        Err(e) => {
            warn!("Upload connection lost: {e}");
            upload.abort();
        }
    }
    finish(&upload.finish())
}

fn push_upload(device: &Device, password: Option<&str>, length: Option<usize>, body: impl Read) -> UploadResponse {
    let mut push = match PushRequest::new(&device.service, password, length) {
        Ok(push) => push,
        Err(response) => return response,
    };

    let received = pump(body, |chunk| {
        push.feed(chunk);
        !push.is_finished()
    });
    match received {
        Ok(total) if cut_short(total, length) => {
            warn!("Push body ended after {total} of {length:?} bytes");
            push.abort();
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Push connection lost: {e}");
            push.abort();
        }
    }
    finish(&push.finish())
}

fn finish(report: &UploadReport) -> UploadResponse {
    if let Some(digest) = report.digest_hex() {
        info!("OTA: {} bytes committed, sha256 {digest}", report.bytes_written);
    }
    if let Some(delay) = report.restart_after {
        simulate_restart(delay);
    }
    report.response.clone()
}

fn simulate_restart(delay: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        info!("Simulated restart: the device would now boot the new image");
    });
}
