use anyhow::Result;
use embedded_svc::http::server::Request;
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer};
use esp_idf_svc::io::EspIOError;
use esp_idf_svc::sys::esp_get_free_heap_size;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use webota_lib::{
    OtaService, PushRequest, StatusReport, StatusTracker, UploadReport, UploadRequest,
    UploadResponse, INDEX_HTML,
};

use crate::config::{Config, ConfigStore};
use crate::flash_sink::EspFlashSink;

/// Body reads are fed to the session in pieces of this size.
const CHUNK_SIZE: usize = 4096;
const MAX_CONFIG_BODY: usize = 4096;
const CONFIG_RESTART_DELAY: Duration = Duration::from_secs(2);
const REBOOT_DELAY: Duration = Duration::from_secs(1);

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// Everything the handlers share.
pub struct State {
    pub service: Arc<OtaService<EspFlashSink>>,
    pub config: Mutex<Config>,
    pub store: ConfigStore,
    pub tracker: StatusTracker,
    pub started: Instant,
}

impl State {
    fn status_json(&self) -> String {
        let hostname = self
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hostname
            .clone();
        let mut report = StatusReport::new(
            &hostname,
            self.service.is_update_in_progress(),
            self.started.elapsed().as_secs(),
            self.tracker.snapshot(),
        );
        report.free_heap = Some(unsafe { esp_get_free_heap_size() });
        report.to_json()
    }
}

/// Restart the device from a helper thread after `delay`, so the
/// current response can still be flushed.
pub fn schedule_restart(delay: Duration) {
    info!("Restarting in {} ms", delay.as_millis());
    if let Err(e) = crate::thread_util::spawn_named(c"restart", move || {
        std::thread::sleep(delay);
        info!("Rebooting device now...");
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }) {
        warn!("Failed to spawn restart thread: {e}");
    }
}

fn send_text(req: HttpRequest<'_, '_>, response: &UploadResponse) -> Result<(), EspIOError> {
    let mut resp = req.into_response(
        response.status,
        None,
        &[("Content-Type", "text/plain"), ("Connection", "close")],
    )?;
    resp.write_all(response.body.as_bytes())?;
    Ok(())
}

fn send_json(req: HttpRequest<'_, '_>, status: u16, json: &str) -> Result<(), EspIOError> {
    let mut resp = req.into_response(status, None, &[("Content-Type", "application/json")])?;
    resp.write_all(json.as_bytes())?;
    Ok(())
}

/// Send the upload result and schedule the restart into the new image.
fn complete_upload(req: HttpRequest<'_, '_>, report: &UploadReport) -> Result<(), EspIOError> {
    if let Some(digest) = report.digest_hex() {
        info!(
            "OTA: {} bytes committed, sha256 {digest}",
            report.bytes_written
        );
    }
    send_text(req, &report.response)?;
    if let Some(delay) = report.restart_after {
        schedule_restart(delay);
    }
    Ok(())
}

/// Read the whole body and pass every chunk to `feed`.
///
/// A read error ends the loop early and is returned after `feed` saw
/// everything that did arrive.
fn stream_body(req: &mut HttpRequest<'_, '_>, mut feed: impl FnMut(&[u8])) -> Result<usize, EspIOError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0;
    loop {
        let n = req.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
        feed(&buf[..n]);
    }
}

fn read_body(req: &mut HttpRequest<'_, '_>, limit: usize) -> Result<Option<Vec<u8>>, EspIOError> {
    let mut body = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = req.read(&mut buf)?;
        if n == 0 {
            return Ok(Some(body));
        }
        if body.len() + n > limit {
            return Ok(None);
        }
        body.extend_from_slice(&buf[..n]);
    }
}

fn header_usize(req: &HttpRequest<'_, '_>, name: &str) -> Option<usize> {
    req.header(name).and_then(|v| v.trim().parse().ok())
}

#[allow(clippy::too_many_lines)] // Route registration function - length is proportional to endpoints
pub fn start_server(state: &Arc<State>, port: u16) -> Result<()> {
    info!("Web server starting...");

    // Uploads keep one socket busy for a while; the rest serve the page and status
    let server_config = Configuration {
        http_port: port,
        uri_match_wildcard: true,
        max_open_sockets: 4,
        session_timeout: Duration::from_secs(10),
        lru_purge_enable: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&server_config)?;

    server.fn_handler("/", Method::Get, |req| -> Result<(), EspIOError> {
        debug!("HTTP: GET /");
        let mut response = req.into_response(200, None, &[("Content-Type", "text/html")])?;
        response.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    // Browser form upload
    let state_clone = state.clone();
    server.fn_handler("/update", Method::Post, move |mut req| -> Result<(), EspIOError> {
        info!("HTTP: POST /update");
        let content_type = req.header("Content-Type").unwrap_or("").to_string();

        let mut upload = match UploadRequest::new(&state_clone.service, &content_type) {
            Ok(upload) => upload,
            Err(response) => {
                warn!("Upload rejected: {} {}", response.status, response.body);
                return send_text(req, &response);
            }
        };

        let received = stream_body(&mut req, |chunk| {
            if !upload.is_finished() {
                upload.feed(chunk);
            }
        });
        match received {
            Ok(total) => debug!("Upload body complete: {total} bytes"),
            Err(e) => {
                warn!("Upload connection lost: {e}");
                upload.abort();
            }
        }

        let report = upload.finish();
        complete_upload(req, &report)
    })?;

    // Raw image pushed by a companion tool
    let state_clone = state.clone();
    server.fn_handler("/api/ota/push", Method::Post, move |mut req| -> Result<(), EspIOError> {
        info!("HTTP: POST /api/ota/push");
        let password = req.header("X-OTA-Password").map(str::to_string);
        let expected_size = header_usize(&req, "Content-Length");

        let mut push = match PushRequest::new(&state_clone.service, password.as_deref(), expected_size) {
            Ok(push) => push,
            Err(response) => {
                warn!("Push rejected: {} {}", response.status, response.body);
                return send_text(req, &response);
            }
        };

        let received = stream_body(&mut req, |chunk| {
            if !push.is_finished() {
                push.feed(chunk);
            }
        });
        if let Err(e) = received {
            warn!("Push connection lost: {e}");
            push.abort();
        }

        let report = push.finish();
        complete_upload(req, &report)
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/status", Method::Get, move |req| -> Result<(), EspIOError> {
        debug!("HTTP: GET /api/status");
        send_json(req, 200, &state_clone.status_json())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/config", Method::Get, move |req| -> Result<(), EspIOError> {
        info!("HTTP: GET /api/config");
        let json = state_clone
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .redacted()
            .to_json();
        send_json(req, 200, &json)
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/config", Method::Post, move |mut req| -> Result<(), EspIOError> {
        info!("HTTP: POST /api/config");
        let Some(body) = read_body(&mut req, MAX_CONFIG_BODY)? else {
            warn!("Config body too large");
            return send_json(req, 413, r#"{"error":"config too large"}"#);
        };

        let mut new_config = match Config::from_json(&body) {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid config received: {e}");
                let json = serde_json::json!({ "error": e.to_string() }).to_string();
                return send_json(req, 400, &json);
            }
        };

        let mut config = state_clone.config.lock().unwrap_or_else(PoisonError::into_inner);
        new_config.restore_secrets(&config);

        if let Err(e) = state_clone.service.replace_settings(new_config.ota_settings()) {
            warn!("Config change refused: {e}");
            let json = serde_json::json!({ "error": e.to_string() }).to_string();
            return send_json(req, 409, &json);
        }

        if let Err(e) = state_clone.store.save(&new_config) {
            warn!("Failed to save config: {e}");
        }
        if let Err(e) = esp_idf_svc::log::set_target_level("*", new_config.level_filter()) {
            warn!("Failed to set log level: {e}");
        }

        let restart = new_config.network_changed(&config);
        *config = new_config;
        drop(config);

        send_json(req, 200, &serde_json::json!({ "restart": restart }).to_string())?;
        if restart {
            info!("Network settings changed");
            schedule_restart(CONFIG_RESTART_DELAY);
        }
        Ok(())
    })?;

    let state_clone = state.clone();
    server.fn_handler("/api/restart", Method::Post, move |req| -> Result<(), EspIOError> {
        info!("HTTP: POST /api/restart - Device restart requested");
        if state_clone.service.is_update_in_progress() {
            return send_text(req, &UploadResponse::busy());
        }
        req.into_ok_response()?;
        schedule_restart(REBOOT_DELAY);
        Ok(())
    })?;

    // Must be registered last as it's a wildcard that matches everything
    server.fn_handler("/*", Method::Get, |req| -> Result<(), EspIOError> {
        info!("HTTP: GET {} -> 404", req.uri());
        req.into_status_response(404)?;
        Ok(())
    })?;

    info!("Web server started on port {port}");

    // Keep server alive
    std::mem::forget(server);

    Ok(())
}
