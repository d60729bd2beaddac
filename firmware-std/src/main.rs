//! QSY terminal — ESP-IDF std firmware
//!
//! Thin platform wiring around the `qsyterm` library: bring up the WiFi
//! access point that carries the isolated game network, start the node
//! pool server, and adapt NimBLE (via esp32-nimble) to the library's
//! GATT host interface. All protocol and routine logic lives in the
//! library.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::ipv4;
use esp_idf_svc::netif::{EspNetif, NetifConfiguration, NetifStack};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, BlockingWifi, Configuration, EspWifi, WifiDriver,
};

use esp32_nimble::utilities::mutex::Mutex as NimbleMutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLECharacteristic, BLEDevice, NimbleProperties};

use qsyterm::ble::{self, GattHost, NotifySink, ServiceSpec, WriteHandler};
use qsyterm::comm;
use qsyterm::server::{Server, ServerConfig, DEFAULT_LOCAL_ADDR};
use qsyterm::terminal::Terminal;

/// WiFi network the nodes join.
const AP_SSID: &str = "QSY";
const AP_CHANNEL: u8 = 1;

/// Number of connected BLE centrals.
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);

fn main() -> anyhow::Result<()> {
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!(
        "QSY terminal v{} starting (std)",
        env!("CARGO_PKG_VERSION")
    );

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // The terminal owns the game network: access point with the fixed
    // local address the nodes dial back to.
    let _wifi = start_access_point(peripherals.modem, sys_loop, nvs)
        .context("failed to start access point")?;

    let server = Server::new(ServerConfig::default()).context("failed to create QSY server")?;
    let terminal = Terminal::new(server.clone());
    server
        .listen_and_accept()
        .context("failed to start QSY server")?;

    let notifications = terminal
        .notifications()
        .ok_or_else(|| anyhow!("notification stream already taken"))?;
    let mut host = NimbleHost::new();
    ble::serve(&mut host, terminal.clone(), notifications, comm::ADV_NAME)
        .map_err(|err| anyhow!("failed to start BLE service: {err}"))?;

    // Blocks processing node and executor traffic.
    terminal.run();
    Ok(())
}

fn start_access_point(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let driver = WifiDriver::new(modem, sys_loop.clone(), Some(nvs))?;
    let ap_netif = EspNetif::new_with_conf(&NetifConfiguration {
        ip_configuration: Some(ipv4::Configuration::Router(ipv4::RouterConfiguration {
            subnet: ipv4::Subnet {
                gateway: DEFAULT_LOCAL_ADDR,
                mask: ipv4::Mask(24),
            },
            dhcp_enabled: true,
            dns: None,
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    })?;
    let esp_wifi = EspWifi::wrap_all(driver, EspNetif::new(NetifStack::Sta)?, ap_netif)?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: AP_SSID.try_into().map_err(|_| anyhow!("SSID too long"))?,
        channel: AP_CHANNEL,
        auth_method: AuthMethod::None,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    log::info!("access point '{AP_SSID}' up at {DEFAULT_LOCAL_ADDR}");
    Ok(wifi)
}

// ── NimBLE GATT host adapter ─────────────────────────────────────────

struct NimbleHost {
    device: &'static mut BLEDevice,
    service_uuid: Option<BleUuid>,
}

impl NimbleHost {
    fn new() -> NimbleHost {
        NimbleHost {
            device: BLEDevice::take(),
            service_uuid: None,
        }
    }
}

struct NimbleSink {
    characteristic: Arc<NimbleMutex<BLECharacteristic>>,
}

impl NotifySink for NimbleSink {
    fn notify(&mut self, chunk: &[u8]) {
        if BLE_CLIENTS.load(Ordering::Relaxed) == 0 {
            return;
        }
        self.characteristic.lock().set_value(chunk).notify();
    }
}

impl GattHost for NimbleHost {
    type Sink = NimbleSink;
    type Error = anyhow::Error;

    fn install(
        &mut self,
        spec: ServiceSpec,
        on_write: WriteHandler,
    ) -> anyhow::Result<NimbleSink> {
        let server = self.device.get_server();

        // NimBLE restarts advertising on disconnect by itself.
        server.on_connect(|_server, desc| {
            log::info!("BLE central connected: {}", desc.address());
            BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);
        });
        server.on_disconnect(|desc, _reason| {
            log::info!("BLE central disconnected: {}", desc.address());
            BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
        });

        let service_uuid = BleUuid::Uuid16(spec.service_uuid);
        let service = server.create_service(service_uuid);

        let notify_char = service
            .lock()
            .create_characteristic(BleUuid::Uuid16(spec.notify_uuid), NimbleProperties::NOTIFY);

        let write_char = service
            .lock()
            .create_characteristic(BleUuid::Uuid16(spec.write_uuid), NimbleProperties::WRITE);
        write_char.lock().on_write(move |args| {
            let status = on_write(args.recv_data());
            if status != ble::STATUS_SUCCESS {
                log::warn!("BLE write rejected with status {status:#04x}");
            }
        });

        self.service_uuid = Some(service_uuid);
        Ok(NimbleSink {
            characteristic: notify_char,
        })
    }

    fn advertise(&mut self, name: &str) -> anyhow::Result<()> {
        let mut adv_data = BLEAdvertisementData::new();
        adv_data.name(name);
        if let Some(service_uuid) = self.service_uuid {
            adv_data.add_service_uuid(service_uuid);
        }
        self.device
            .get_advertising()
            .lock()
            .set_data(&mut adv_data)
            .map_err(|err| anyhow!("BLE advertising data failed: {err:?}"))?;
        self.device
            .get_advertising()
            .lock()
            .start()
            .map_err(|err| anyhow!("BLE advertising start failed: {err:?}"))?;
        log::info!("BLE advertising as '{name}'");
        Ok(())
    }
}
