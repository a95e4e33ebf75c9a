use core::convert::TryInto;
use std::fmt;

use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, Configuration};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::sys::EspError;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};

const WIFI_AP_SSID_PREFIX: &str = "RC-Vehicle";
const WIFI_AP_CHANNEL: u8 = 1;
const WIFI_AP_MAX_CONNECTIONS: u16 = 4;

#[derive(Debug)]
pub enum NetError {
    Esp(EspError),
    Config(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Esp(err) => write!(f, "esp error: {}", err),
            NetError::Config(msg) => write!(f, "wifi config: {}", msg),
        }
    }
}

impl From<EspError> for NetError {
    fn from(err: EspError) -> Self {
        NetError::Esp(err)
    }
}

/// 编译期 SSID，否则用前缀加 MAC 后两字节。
fn ap_ssid(mac: [u8; 6]) -> String {
    match option_env!("WIFI_AP_SSID") {
        Some(ssid) if !ssid.is_empty() => ssid.to_string(),
        _ => format!("{}-{:02X}{:02X}", WIFI_AP_SSID_PREFIX, mac[4], mac[5]),
    }
}

/// 启动软 AP（手机/浏览器直连车辆）。
pub fn start_access_point(
    modem: Modem,
    nvs: Option<EspDefaultNvsPartition>,
) -> Result<BlockingWifi<EspWifi<'static>>, NetError> {
    let sys_loop = EspSystemEventLoop::take()?;
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sys_loop.clone(), nvs)?, sys_loop)?;

    let password = option_env!("WIFI_AP_PASS").unwrap_or("");
    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    let ssid = ap_ssid(wifi.wifi().ap_netif().get_mac()?);

    let wifi_configuration = Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .as_str()
            .try_into()
            .map_err(|_| NetError::Config(format!("SSID too long: {}", ssid)))?,
        password: password
            .try_into()
            .map_err(|_| NetError::Config("password too long".to_string()))?,
        auth_method,
        channel: WIFI_AP_CHANNEL,
        max_connections: WIFI_AP_MAX_CONNECTIONS,
        ..Default::default()
    });

    wifi.set_configuration(&wifi_configuration)?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    let ip = wifi.wifi().ap_netif().get_ip_info()?.ip;
    log::info!("Wi-Fi AP '{}' up at http://{}/", ssid, ip);
    Ok(wifi)
}
