use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::pipeline::{CalibRequest, ControlHandle, ControlStatus, RequestError};
use crate::stabilization::StabilizationConfig;

/// 等待控制环应答的默认超时。
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// WebSocket 请求（按 `type` 字段区分）。
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsRequest {
    CalibrateImu {
        #[serde(default)]
        mode: Option<String>,
    },
    GetCalibStatus,
    SetForwardDirection {
        #[serde(default)]
        vec: Vec<f32>,
    },
    GetStabConfig,
    SetStabConfig(StabConfigPatch),
    Cmd {
        throttle: f32,
        steering: f32,
    },
}

/// `set_stab_config` 中可选的字段，缺省的保持当前值。
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct StabConfigPatch {
    pub enabled: Option<bool>,
    pub madgwick_beta: Option<f32>,
    pub lpf_cutoff_hz: Option<f32>,
    pub imu_sample_rate_hz: Option<f32>,
    pub mode: Option<u8>,
    pub pid_kp: Option<f32>,
    pub pid_ki: Option<f32>,
    pub pid_kd: Option<f32>,
    pub pid_max_integral: Option<f32>,
    pub pid_max_correction: Option<f32>,
    pub steer_to_yaw_rate_dps: Option<f32>,
    pub fade_ms: Option<u32>,
    pub pitch_comp_enabled: Option<bool>,
    pub pitch_comp_gain: Option<f32>,
    pub pitch_comp_max_correction: Option<f32>,
}

impl StabConfigPatch {
    /// 模式变化时先写入模式预设，再覆盖显式给出的字段。
    pub fn apply_to(&self, base: &StabilizationConfig) -> StabilizationConfig {
        let mut cfg = base.clone();
        if let Some(mode) = self.mode {
            if mode != cfg.mode {
                cfg.apply_mode_defaults(mode);
            }
        }
        macro_rules! patch {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    cfg.$field = value;
                })*
            };
        }
        patch!(
            enabled,
            madgwick_beta,
            lpf_cutoff_hz,
            imu_sample_rate_hz,
            pid_kp,
            pid_ki,
            pid_kd,
            pid_max_integral,
            pid_max_correction,
            steer_to_yaw_rate_dps,
            fade_ms,
            pitch_comp_enabled,
            pitch_comp_gain,
            pitch_comp_max_correction
        );
        cfg
    }
}

/// WebSocket JSON 接口：解析请求、转发给控制环并生成应答。
#[derive(Clone, Debug)]
pub struct WsApi {
    handle: ControlHandle,
    reply_timeout: Duration,
}

impl WsApi {
    pub fn new(handle: ControlHandle) -> Self {
        Self::with_timeout(handle, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn with_timeout(handle: ControlHandle, reply_timeout: Duration) -> Self {
        Self {
            handle,
            reply_timeout,
        }
    }

    /// 处理一条文本消息；返回需要回给客户端的 JSON（`cmd` 无应答）。
    pub fn handle_text(&self, text: &str) -> Option<String> {
        let request = match serde_json::from_str::<WsRequest>(text) {
            Ok(request) => request,
            Err(err) => return Some(error_reply(&format!("bad request: {}", err))),
        };
        let reply = match self.dispatch(request) {
            Ok(Some(reply)) => reply,
            Ok(None) => return None,
            Err(message) => return Some(error_reply(&message)),
        };
        Some(reply.to_string())
    }

    fn dispatch(&self, request: WsRequest) -> Result<Option<Value>, String> {
        match request {
            WsRequest::Cmd { throttle, steering } => {
                self.handle.send_command(throttle, steering);
                Ok(None)
            }
            WsRequest::CalibrateImu { mode } => self.calibrate(mode.as_deref()).map(Some),
            WsRequest::GetCalibStatus => {
                let status = self.query_status()?;
                Ok(Some(json!({
                    "type": "calib_status",
                    "status": status.calib_status.as_str(),
                    "stage": status.calib_stage,
                    "valid": status.calib.valid,
                })))
            }
            WsRequest::SetForwardDirection { vec } => {
                let mut forward = [1.0f32, 0.0, 0.0];
                if vec.len() >= 3 {
                    forward.copy_from_slice(&vec[..3]);
                }
                let rx = self
                    .handle
                    .set_forward_direction(forward)
                    .map_err(request_error)?;
                let saved = rx.recv_timeout(self.reply_timeout).map_err(|_| timeout_error())?;
                log::info!("WS: set_forward_direction {:?} (saved={})", forward, saved);
                Ok(Some(json!({
                    "type": "set_forward_direction_ack",
                    "ok": saved,
                })))
            }
            WsRequest::GetStabConfig => {
                let status = self.query_status()?;
                Ok(Some(config_reply("stab_config", &status.stab_config)))
            }
            WsRequest::SetStabConfig(patch) => {
                let current = self.query_status()?.stab_config;
                let config = patch.apply_to(&current);
                let rx = self
                    .handle
                    .set_stabilization_config(config, true)
                    .map_err(request_error)?;
                let result = rx.recv_timeout(self.reply_timeout).map_err(|_| timeout_error())?;
                let reply = match result {
                    Ok(applied) => {
                        log::info!(
                            "WS: set_stab_config OK (enabled={} beta={:.3} cutoff={:.1} mode={})",
                            applied.enabled,
                            applied.madgwick_beta,
                            applied.lpf_cutoff_hz,
                            applied.mode
                        );
                        json!({
                            "type": "set_stab_config_ack",
                            "ok": true,
                            "config": applied,
                        })
                    }
                    Err(err) => {
                        log::warn!("WS: set_stab_config failed: {}", err);
                        json!({
                            "type": "set_stab_config_ack",
                            "ok": false,
                            "message": err.to_string(),
                        })
                    }
                };
                Ok(Some(reply))
            }
        }
    }

    fn calibrate(&self, mode: Option<&str>) -> Result<Value, String> {
        if mode == Some("forward") {
            let rx = self
                .handle
                .start_forward_calibration()
                .map_err(request_error)?;
            let result = rx.recv_timeout(self.reply_timeout).map_err(|_| timeout_error())?;
            let ok = result.is_ok();
            log::info!(
                "WS: calibrate_imu mode=forward -> {}",
                if ok { "stage 2 started" } else { "rejected" }
            );
            return Ok(json!({
                "type": "calibrate_imu_ack",
                "status": if ok { "collecting" } else { "failed" },
                "stage": 2,
                "ok": ok,
                "mode": "forward",
            }));
        }

        // 未知模式按仅陀螺处理
        let (request, label) = if mode == Some("full") {
            (CalibRequest::Full, "full")
        } else {
            (CalibRequest::GyroOnly, "gyro")
        };
        self.handle
            .request_calibration(request)
            .map_err(request_error)?;
        log::info!("WS: calibrate_imu (stage 1, mode={})", label);
        Ok(json!({
            "type": "calibrate_imu_ack",
            "status": "collecting",
            "stage": 1,
            "ok": true,
            "mode": label,
        }))
    }

    fn query_status(&self) -> Result<ControlStatus, String> {
        let rx = self.handle.query_status().map_err(request_error)?;
        rx.recv_timeout(self.reply_timeout).map_err(|_| timeout_error())
    }
}

fn config_reply(kind: &str, config: &StabilizationConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::from(kind));
    }
    value
}

fn error_reply(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}

fn request_error(err: RequestError) -> String {
    match err {
        RequestError::Busy => "control loop busy".to_string(),
        RequestError::Disconnected => "control loop not running".to_string(),
    }
}

fn timeout_error() -> String {
    "control loop did not respond".to_string()
}

/// 控制页：WebSocket 连接、油门/转向滑块、标定按钮与遥测显示。
pub fn render_index() -> String {
    let mut html = String::new();
    html.push_str("<!doctype html><html><head><meta charset=\"utf-8\">");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">");
    html.push_str("<title>RC Vehicle</title>");
    html.push_str("<style>");
    html.push_str(":root{--bg:#0f172a;--panel:#0b1220;--text:#f8fafc;--muted:#94a3b8;--accent:#f59e0b;--stroke:rgba(148,163,184,0.25);}");
    html.push_str("*{box-sizing:border-box}body{margin:0;font-family:sans-serif;color:var(--text);background:linear-gradient(180deg,#0b1220,#111827);}");
    html.push_str(".screen{padding:20px;display:flex;flex-direction:column;gap:16px;}");
    html.push_str(".card{padding:14px;border-radius:14px;border:1px solid var(--stroke);background:rgba(15,23,42,0.6);}");
    html.push_str(".grid{display:grid;gap:12px;grid-template-columns:repeat(auto-fit,minmax(160px,1fr));}");
    html.push_str(".label{font-size:12px;color:var(--muted);text-transform:uppercase;letter-spacing:1px;}");
    html.push_str(".value{font-size:24px;font-weight:700;margin-top:4px;}");
    html.push_str("input[type=range]{width:100%}");
    html.push_str("button{padding:10px 14px;border-radius:12px;border:1px solid var(--stroke);background:#111827;color:var(--text);font-weight:600;}");
    html.push_str("button.primary{background:var(--accent);color:#0b1220;border-color:transparent;}");
    html.push_str(".dot{display:inline-block;width:8px;height:8px;border-radius:50%;margin-right:6px;}");
    html.push_str(".ok{background:#22c55e}.bad{background:#ef4444}");
    html.push_str("</style></head><body><section class=\"screen\">");
    html.push_str("<h2>RC Vehicle</h2>");
    html.push_str("<div class=\"grid\">");
    html.push_str("<div class=\"card\"><div class=\"label\">Link</div><div class=\"value\">");
    html.push_str("<span id=\"rc-dot\" class=\"dot bad\"></span>RC <span id=\"wifi-dot\" class=\"dot bad\"></span>Wi-Fi</div>");
    html.push_str("<div id=\"failsafe\" class=\"label\">failsafe: -</div></div>");
    html.push_str("<div class=\"card\"><div class=\"label\">Orientation</div><div class=\"value\" id=\"orient\">-</div></div>");
    html.push_str("<div class=\"card\"><div class=\"label\">Yaw rate</div><div class=\"value\" id=\"yaw-rate\">-</div></div>");
    html.push_str("<div class=\"card\"><div class=\"label\">Output</div><div class=\"value\" id=\"act\">-</div></div>");
    html.push_str("</div>");
    html.push_str("<div class=\"card\"><div class=\"label\">Throttle</div>");
    html.push_str("<input id=\"throttle\" type=\"range\" min=\"-100\" max=\"100\" value=\"0\">");
    html.push_str("<div class=\"label\">Steering</div>");
    html.push_str("<input id=\"steering\" type=\"range\" min=\"-100\" max=\"100\" value=\"0\">");
    html.push_str("<button onclick=\"stopAll()\">Stop</button></div>");
    html.push_str("<div class=\"card\"><div class=\"label\">Calibration</div>");
    html.push_str("<div id=\"calib\" class=\"value\">-</div>");
    html.push_str("<button onclick=\"send({type:'calibrate_imu',mode:'gyro'})\">Gyro</button> ");
    html.push_str("<button class=\"primary\" onclick=\"send({type:'calibrate_imu',mode:'full'})\">Full</button> ");
    html.push_str("<button onclick=\"send({type:'calibrate_imu',mode:'forward'})\">Forward</button></div>");
    html.push_str("<div class=\"card\"><div class=\"label\">Stabilization</div>");
    html.push_str("<label><input id=\"stab-en\" type=\"checkbox\" onchange=\"send({type:'set_stab_config',enabled:this.checked})\"> enabled</label> ");
    html.push_str("<select id=\"stab-mode\" onchange=\"send({type:'set_stab_config',mode:Number(this.value)})\">");
    html.push_str("<option value=\"0\">normal</option><option value=\"1\">sport</option><option value=\"2\">drift</option></select></div>");
    html.push_str("</section>");
    html.push_str("<script>");
    html.push_str("let ws;function connect(){ws=new WebSocket('ws://'+location.host+'/ws');");
    html.push_str("ws.onopen=()=>send({type:'get_stab_config'});ws.onclose=()=>setTimeout(connect,1000);");
    html.push_str("ws.onmessage=(e)=>{const m=JSON.parse(e.data);if(m.type==='telem')telem(m);");
    html.push_str("else if(m.type==='stab_config'){stab(m);}else if(m.type==='set_stab_config_ack'&&m.ok){stab(m.config);}};}");
    html.push_str("function send(o){if(ws&&ws.readyState===1)ws.send(JSON.stringify(o));}");
    html.push_str("function dot(id,ok){document.getElementById(id).className='dot '+(ok?'ok':'bad');}");
    html.push_str("function stab(c){document.getElementById('stab-en').checked=c.enabled;document.getElementById('stab-mode').value=c.mode;}");
    html.push_str("function telem(m){dot('rc-dot',m.link.rc_ok);dot('wifi-dot',m.link.wifi_ok);");
    html.push_str("document.getElementById('failsafe').textContent='failsafe: '+(m.link.failsafe?'ACTIVE':'off');");
    html.push_str("document.getElementById('act').textContent=m.act.throttle.toFixed(2)+' / '+m.act.steering.toFixed(2);");
    html.push_str("if(m.imu){const o=m.imu.orientation;document.getElementById('orient').textContent=");
    html.push_str("o.pitch.toFixed(1)+' / '+o.roll.toFixed(1)+' / '+o.yaw.toFixed(1);");
    html.push_str("document.getElementById('yaw-rate').textContent=m.imu.gyro_z_filtered.toFixed(1)+' dps';}");
    html.push_str("if(m.calib){document.getElementById('calib').textContent=m.calib.status+' (stage '+m.calib.stage+')';}}");
    html.push_str("function stopAll(){document.getElementById('throttle').value=0;document.getElementById('steering').value=0;}");
    html.push_str("setInterval(()=>{send({type:'cmd',throttle:document.getElementById('throttle').value/100,");
    html.push_str("steering:document.getElementById('steering').value/100});},50);");
    html.push_str("connect();");
    html.push_str("</script></body></html>");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CommandSlot, ControlChannels};

    #[test]
    fn test_parse_requests() {
        let req: WsRequest = serde_json::from_str(r#"{"type":"calibrate_imu","mode":"full"}"#).unwrap();
        assert_eq!(
            req,
            WsRequest::CalibrateImu {
                mode: Some("full".to_string())
            }
        );
        let req: WsRequest = serde_json::from_str(r#"{"type":"get_calib_status"}"#).unwrap();
        assert_eq!(req, WsRequest::GetCalibStatus);
        let req: WsRequest =
            serde_json::from_str(r#"{"type":"cmd","throttle":0.5,"steering":-0.25}"#).unwrap();
        assert_eq!(
            req,
            WsRequest::Cmd {
                throttle: 0.5,
                steering: -0.25
            }
        );
        let req: WsRequest =
            serde_json::from_str(r#"{"type":"set_stab_config","enabled":true,"mode":2}"#).unwrap();
        match req {
            WsRequest::SetStabConfig(patch) => {
                assert_eq!(patch.enabled, Some(true));
                assert_eq!(patch.mode, Some(2));
                assert_eq!(patch.pid_kp, None);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_patch_applies_mode_defaults_before_fields() {
        let base = StabilizationConfig::default();
        let patch = StabConfigPatch {
            mode: Some(1),
            pid_kp: Some(0.33),
            enabled: Some(true),
            ..Default::default()
        };
        let cfg = patch.apply_to(&base);
        assert_eq!(cfg.mode, 1);
        assert_eq!(cfg.pid_kp, 0.33);
        assert_eq!(cfg.steer_to_yaw_rate_dps, 120.0);
        assert!(cfg.enabled);

        // 模式不变时不重置参数
        let mut tuned = cfg.clone();
        tuned.steer_to_yaw_rate_dps = 200.0;
        let same_mode = StabConfigPatch {
            mode: Some(1),
            ..Default::default()
        };
        assert_eq!(same_mode.apply_to(&tuned).steer_to_yaw_rate_dps, 200.0);
    }

    #[test]
    fn test_cmd_goes_to_command_slot() {
        let commands = CommandSlot::new();
        let channels = ControlChannels::new(commands.clone());
        let api = WsApi::new(channels.handle.clone());
        assert_eq!(
            api.handle_text(r#"{"type":"cmd","throttle":2.0,"steering":-0.5}"#),
            None
        );
        let cmd = commands.try_take().unwrap();
        assert_eq!(cmd.throttle(), 1.0);
        assert_eq!(cmd.steering(), -0.5);
    }

    #[test]
    fn test_stage1_calibration_request_acknowledged() {
        let channels = ControlChannels::new(CommandSlot::new());
        let api = WsApi::new(channels.handle.clone());
        let reply = api
            .handle_text(r#"{"type":"calibrate_imu","mode":"full"}"#)
            .unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "calibrate_imu_ack");
        assert_eq!(value["ok"], true);
        assert_eq!(value["stage"], 1);
        assert_eq!(value["mode"], "full");
        assert!(matches!(
            channels.inbox.try_next(),
            Some(crate::pipeline::ControlRequest::Calibrate(CalibRequest::Full))
        ));
    }

    #[test]
    fn test_malformed_and_unknown_requests() {
        let channels = ControlChannels::new(CommandSlot::new());
        let api = WsApi::new(channels.handle.clone());
        for text in ["not json", r#"{"type":"self_destruct"}"#, r#"{"type":"cmd"}"#] {
            let reply = api.handle_text(text).unwrap();
            let value: Value = serde_json::from_str(&reply).unwrap();
            assert_eq!(value["type"], "error", "input {}", text);
        }
    }

    #[test]
    fn test_query_times_out_without_control_loop() {
        let channels = ControlChannels::new(CommandSlot::new());
        let api = WsApi::with_timeout(channels.handle.clone(), Duration::from_millis(10));
        let reply = api.handle_text(r#"{"type":"get_stab_config"}"#).unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "control loop did not respond");
    }

    #[test]
    fn test_index_page_connects_websocket() {
        let html = render_index();
        assert!(html.starts_with("<!doctype html>"));
        assert!(html.contains("/ws"));
        assert!(html.contains("calibrate_imu"));
    }
}
