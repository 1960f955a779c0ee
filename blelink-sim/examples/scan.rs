use std::error::Error;

use blelink::{CentralSession, ConnectOutcome};
use blelink_sim::{CharacteristicSpec, DeviceSpec, ServiceSpec, Simulator};
use btuuid::BluetoothUuid;
use futures_lite::StreamExt;
use tracing::info;
use tracing::metadata::LevelFilter;

const BATTERY_SERVICE: BluetoothUuid = BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F));
const BATTERY_LEVEL: BluetoothUuid = BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A19));

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let sim = Simulator::new();
    let central = CentralSession::new(sim.backend());
    sim.attach(central.event_sink());

    sim.add_device(
        DeviceSpec::new().name("heart-rate-strap").rssi(-64).service(
            ServiceSpec::new(BATTERY_SERVICE)
                .characteristic(CharacteristicSpec::new(BATTERY_LEVEL).value(vec![87]).notifying()),
        ),
    );
    sim.power_on();

    info!("starting scan");
    let mut scan = central.start_scan(None).await?;
    let discovered = scan.next().await.expect("simulator advertises one device");
    info!(
        "{}{}: {:?}",
        discovered
            .advertisement
            .local_name
            .as_deref()
            .unwrap_or("(unknown)"),
        format!(" ({}dBm)", discovered.rssi),
        discovered.advertisement
    );
    central.stop_scan();

    let peripheral = match central.connect(discovered.link).await? {
        ConnectOutcome::Connected(peripheral) => peripheral,
        ConnectOutcome::Superseded => return Ok(()),
    };
    info!(link = %peripheral.id(), "connected");

    let services = peripheral.discover_services(Some(&[BATTERY_SERVICE])).await?;
    let characteristics = peripheral
        .discover_characteristics(&services[0], Some(&[BATTERY_LEVEL]))
        .await?;
    let battery_level = &characteristics[0];

    let level = peripheral.read(battery_level).await?;
    info!("battery level: {}%", level[0]);

    peripheral.set_notify(battery_level, true).await?;
    let mut updates = peripheral.value_updates(battery_level);
    sim.notify(peripheral.id(), battery_level.id, vec![86]);
    let update = updates.next().await.expect("notification pending")?;
    info!("battery level update: {}%", update[0]);

    central.disconnect(peripheral.id()).await?;
    info!("disconnected");
    Ok(())
}
