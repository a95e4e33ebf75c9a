use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use embedded_svc::http::Method;
use embedded_svc::io::Write as _;
use embedded_svc::ws::FrameType;
use esp_idf_svc::http::server::ws::{EspHttpWsConnection, EspHttpWsDetachedSender};
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::io::EspIOError;
use esp_idf_svc::sys::EspError;
use serde_json::json;

use rc_vehicle::pipeline::ControlHandle;
use rc_vehicle::web::{render_index, WsApi};

/// 同时接收遥测的 WebSocket 客户端上限。
const WS_MAX_CLIENTS: usize = 4;
/// 单条入站消息上限。
const WS_RX_BUFFER_SIZE: usize = 1024;

struct WsClient {
    session: i32,
    sender: EspHttpWsDetachedSender,
}

/// 已连接的 WebSocket 客户端（遥测广播目标）。
#[derive(Clone, Default)]
pub struct WsClients {
    inner: Arc<Mutex<Vec<WsClient>>>,
}

impl WsClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, session: i32, sender: EspHttpWsDetachedSender) {
        if let Ok(mut clients) = self.inner.lock() {
            clients.retain(|client| client.session != session);
            if clients.len() >= WS_MAX_CLIENTS {
                log::warn!("WS client {} ignored: {} clients already connected", session, clients.len());
                return;
            }
            clients.push(WsClient { session, sender });
        }
    }

    fn remove(&self, session: i32) {
        if let Ok(mut clients) = self.inner.lock() {
            clients.retain(|client| client.session != session);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().map(|clients| clients.len()).unwrap_or(0)
    }

    /// 向全部客户端发送文本帧，发送失败的会话被移除。
    pub fn broadcast(&self, text: &str) {
        if let Ok(mut clients) = self.inner.lock() {
            clients.retain_mut(|client| match client.sender.send(FrameType::Text(false), text.as_bytes()) {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("WS client {} dropped: {:?}", client.session, err);
                    false
                }
            });
        }
    }
}

/// 启动内置 HTTP 服务（控制页 + WebSocket）。
pub fn start_server(handle: ControlHandle, clients: WsClients) -> Result<EspHttpServer<'static>, EspIOError> {
    let mut server = EspHttpServer::new(&Configuration {
        stack_size: 8192,
        ..Default::default()
    })?;

    // 首页：渲染 HTML
    server.fn_handler("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("content-type", "text/html; charset=utf-8")])?
            .write_all(render_index().as_bytes())
            .map(|_| ())
    })?;

    // 状态接口：JSON
    let handle_status = handle.clone();
    server.fn_handler("/status", Method::Get, move |req| {
        let status = handle_status
            .query_status()
            .ok()
            .and_then(|rx| rx.recv_timeout(Duration::from_millis(500)).ok());
        let payload = match status {
            Some(status) => json!({
                "status": status.vehicle_status().as_str(),
                "failsafe": status.failsafe.as_str(),
                "calib_status": status.calib_status.as_str(),
                "calib_stage": status.calib_stage,
                "calib_valid": status.calib.valid,
                "stab_enabled": status.stab_config.enabled,
                "stab_mode": status.stab_config.drive_mode().as_str(),
                "throttle": status.applied_throttle,
                "steering": status.applied_steering,
            }),
            None => json!({ "status": "unavailable" }),
        };
        let body = payload.to_string();
        req.into_response(200, Some("OK"), &[("content-type", "application/json")])?
            .write_all(body.as_bytes())
            .map(|_| ())
    })?;

    // WebSocket：指令、标定、稳定配置
    let api = WsApi::new(handle);
    let ws_clients = clients.clone();
    server.ws_handler("/ws", move |ws: &mut EspHttpWsConnection| -> Result<(), EspError> {
        let session = ws.session();
        if ws.is_new() {
            match ws.create_detached_sender() {
                Ok(sender) => ws_clients.add(session, sender),
                Err(err) => log::warn!("WS client {} has no telemetry sender: {:?}", session, err),
            }
            log::info!("WS client {} connected", session);
            return Ok(());
        }
        if ws.is_closed() {
            ws_clients.remove(session);
            log::info!("WS client {} disconnected", session);
            return Ok(());
        }

        let (frame_type, len) = ws.recv(&mut [])?;
        if len > WS_RX_BUFFER_SIZE {
            let reply = json!({ "type": "error", "message": "message too large" }).to_string();
            return ws.send(FrameType::Text(false), reply.as_bytes());
        }
        let mut buf = [0u8; WS_RX_BUFFER_SIZE];
        ws.recv(&mut buf[..len])?;
        if !matches!(frame_type, FrameType::Text(_)) {
            return Ok(());
        }
        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            log::warn!("WS client {} sent non UTF-8 text", session);
            return Ok(());
        };
        if let Some(reply) = api.handle_text(text.trim_end_matches('\0')) {
            ws.send(FrameType::Text(false), reply.as_bytes())?;
        }
        Ok(())
    })?;

    Ok(server)
}

/// 遥测广播线程：控制环只做非阻塞投递，由本线程逐个发送。
pub fn spawn_telem_broadcaster(clients: WsClients, telem_rx: Receiver<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(json) = telem_rx.recv() {
            clients.broadcast(&json);
        }
    })
}
