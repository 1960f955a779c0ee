use std::pin::pin;

use blelink::{
    AttributeId, BackendEvent, CentralSession, Characteristic, CharacteristicProperties, Command,
    ConnectionState, Descriptor, ErrorKind, LinkId, ProtocolError, Service,
};
use blelink_sim::{CharacteristicSpec, DeviceSpec, ServiceSpec, Simulator};
use btuuid::BluetoothUuid;
use futures_lite::{StreamExt, future};
use uuid::Uuid;

fn session() -> (Simulator, CentralSession) {
    let sim = Simulator::new();
    let central = CentralSession::new(sim.backend());
    sim.attach(central.event_sink());
    (sim, central)
}

fn link_id() -> LinkId {
    LinkId::new(Uuid::from_u128(0xD0))
}

fn service(id: u64, uuid: u16) -> Service {
    Service {
        id: AttributeId::new(id),
        uuid: BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(uuid)),
        is_primary: true,
    }
}

fn characteristic(id: u64) -> Characteristic {
    Characteristic {
        id: AttributeId::new(id),
        service: AttributeId::new(1),
        uuid: BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A19)),
        properties: CharacteristicProperties {
            read: true,
            write: true,
            notify: true,
            ..Default::default()
        },
    }
}

fn count_discover_services(commands: &[Command]) -> usize {
    commands
        .iter()
        .filter(|command| matches!(command, Command::DiscoverServices { .. }))
        .count()
}

#[tokio::test]
async fn same_kind_requests_resolve_in_issue_order() {
    let (sim, central) = session();
    sim.set_auto_respond(false);
    let peripheral = central.peripheral(link_id());

    let mut first = pin!(peripheral.discover_services(None));
    let mut second = pin!(peripheral.discover_services(None));
    assert!(future::poll_once(first.as_mut()).await.is_none());
    assert!(future::poll_once(second.as_mut()).await.is_none());

    // Only the FIFO head reaches the backend; the second request is held.
    assert_eq!(count_discover_services(&sim.issued()), 1);

    let ab = vec![service(1, 0x1800), service(2, 0x180F)];
    sim.emit(BackendEvent::ServicesDiscovered {
        link: link_id(),
        services: ab.clone(),
        error: None,
    });
    let resolved = future::poll_once(first.as_mut()).await.expect("first resolved");
    assert_eq!(resolved.unwrap(), ab);

    // Resolving the head dispatched the held request.
    assert_eq!(count_discover_services(&sim.issued()), 2);
    assert!(future::poll_once(second.as_mut()).await.is_none());

    let abc = vec![service(1, 0x1800), service(2, 0x180F), service(3, 0x181A)];
    sim.emit(BackendEvent::ServicesDiscovered {
        link: link_id(),
        services: abc.clone(),
        error: None,
    });
    let resolved = future::poll_once(second.as_mut()).await.expect("second resolved");
    assert_eq!(resolved.unwrap(), abc);
}

#[tokio::test]
async fn write_ack_for_another_attribute_does_not_resolve() {
    let (sim, central) = session();
    sim.set_auto_respond(false);
    let peripheral = central.peripheral(link_id());
    let a = characteristic(10);
    let b = characteristic(11);

    let mut write_a = pin!(peripheral.write(&a, vec![1]));
    let mut write_b = pin!(peripheral.write(&b, vec![2]));
    assert!(future::poll_once(write_a.as_mut()).await.is_none());
    assert!(future::poll_once(write_b.as_mut()).await.is_none());

    sim.emit(BackendEvent::CharacteristicWritten {
        link: link_id(),
        characteristic: b.id,
        error: None,
    });
    assert!(future::poll_once(write_a.as_mut()).await.is_none());
    assert_eq!(
        future::poll_once(write_b.as_mut()).await.expect("b resolved"),
        Ok(())
    );

    sim.emit(BackendEvent::CharacteristicWritten {
        link: link_id(),
        characteristic: a.id,
        error: None,
    });
    assert_eq!(
        future::poll_once(write_a.as_mut()).await.expect("a resolved"),
        Ok(())
    );
}

#[tokio::test]
async fn set_notify_short_circuits_when_state_matches() {
    let (sim, central) = session();
    let link = sim.add_device(
        DeviceSpec::new().service(
            ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180D)))
                .characteristic(CharacteristicSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A37))).notifying()),
        ),
    );
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();
    let services = peripheral.discover_services(None).await.unwrap();
    let characteristics = peripheral
        .discover_characteristics(&services[0], None)
        .await
        .unwrap();
    let measurement = &characteristics[0];

    peripheral.set_notify(measurement, true).await.unwrap();
    peripheral.set_notify(measurement, true).await.unwrap();

    let commands = sim.issued();
    assert_eq!(
        commands
            .iter()
            .filter(|command| matches!(command, Command::SetNotify { .. }))
            .count(),
        1
    );
    assert!(peripheral.is_notifying(measurement));
}

#[tokio::test]
async fn read_returns_stored_value() {
    let (sim, central) = session();
    let link = sim.add_device(
        DeviceSpec::new().service(
            ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F)))
                .characteristic(CharacteristicSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A19))).value(vec![87])),
        ),
    );
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();
    let services = peripheral.discover_services(None).await.unwrap();
    let characteristics = peripheral
        .discover_characteristics(&services[0], None)
        .await
        .unwrap();

    let value = peripheral.read(&characteristics[0]).await.unwrap();
    assert_eq!(value, vec![87]);
}

#[tokio::test]
async fn read_propagates_backend_error() {
    let (sim, central) = session();
    sim.set_auto_respond(false);
    let peripheral = central.peripheral(link_id());
    let battery = characteristic(5);

    let mut read = pin!(peripheral.read(&battery));
    assert!(future::poll_once(read.as_mut()).await.is_none());

    sim.emit(BackendEvent::CharacteristicUpdated {
        link: link_id(),
        characteristic: battery.id,
        value: Vec::new(),
        error: Some(ProtocolError::new("read failed")),
    });
    let err = future::poll_once(read.as_mut())
        .await
        .expect("read resolved")
        .unwrap_err();
    assert_eq!(
        err.kind(),
        &ErrorKind::Protocol(ProtocolError::new("read failed"))
    );
}

#[tokio::test]
async fn write_with_response_stores_and_acknowledges() {
    let (sim, central) = session();
    let link = sim.add_device(
        DeviceSpec::new().service(
            ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F)))
                .characteristic(CharacteristicSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A19))).writable()),
        ),
    );
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();
    let services = peripheral.discover_services(None).await.unwrap();
    let characteristics = peripheral
        .discover_characteristics(&services[0], None)
        .await
        .unwrap();
    let target = &characteristics[0];

    peripheral.write(target, vec![1, 2, 3]).await.unwrap();
    assert_eq!(sim.value(link, target.id), Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn write_without_response_issues_no_waiting() {
    let (sim, central) = session();
    sim.set_auto_respond(false);
    let peripheral = central.peripheral(link_id());
    let target = characteristic(7);

    // Fire and forget: no completion to await, the command goes
    // straight out even with a write already pending.
    let mut pending = pin!(peripheral.write(&target, vec![1]));
    assert!(future::poll_once(pending.as_mut()).await.is_none());
    peripheral.write_without_response(&target, vec![2]);

    let writes = sim
        .issued()
        .iter()
        .filter(|command| matches!(command, Command::WriteCharacteristic { .. }))
        .count();
    assert_eq!(writes, 2);
}

#[tokio::test]
async fn value_updates_stream_delivers_notifications() {
    let (sim, central) = session();
    let link = sim.add_device(
        DeviceSpec::new().service(
            ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F)))
                .characteristic(CharacteristicSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A19))).notifying()),
        ),
    );
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();
    let services = peripheral.discover_services(None).await.unwrap();
    let characteristics = peripheral
        .discover_characteristics(&services[0], None)
        .await
        .unwrap();
    let battery = &characteristics[0];

    peripheral.set_notify(battery, true).await.unwrap();
    let mut updates = peripheral.value_updates(battery);
    sim.notify(link, battery.id, vec![86]);
    sim.notify(link, battery.id, vec![85]);

    assert_eq!(updates.next().await.unwrap().unwrap(), vec![86]);
    assert_eq!(updates.next().await.unwrap().unwrap(), vec![85]);
}

#[tokio::test]
async fn discovery_filter_narrows_and_drops_missing() {
    let (sim, central) = session();
    let link = sim.add_device(
        DeviceSpec::new()
            .service(ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x1800))))
            .service(ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F)))),
    );
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();

    // One requested UUID exists, the other was never discovered; the
    // missing one is dropped without a signal.
    let filter = [BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F)), BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x1234))];
    let services = peripheral.discover_services(Some(&filter)).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid, BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F)));
}

#[tokio::test]
async fn descriptor_discovery_lists_descriptors() {
    let (sim, central) = session();
    let link = sim.add_device(
        DeviceSpec::new().service(
            ServiceSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x180F))).characteristic(
                CharacteristicSpec::new(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2A19)))
                    .notifying()
                    .descriptor(BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2902))),
            ),
        ),
    );
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();
    let services = peripheral.discover_services(None).await.unwrap();
    let characteristics = peripheral
        .discover_characteristics(&services[0], None)
        .await
        .unwrap();

    let descriptors = peripheral
        .discover_descriptors(&characteristics[0])
        .await
        .unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].uuid, BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2902)));
    assert_eq!(descriptors[0].characteristic, characteristics[0].id);
}

#[tokio::test]
async fn descriptor_io_is_unsupported() {
    let (_sim, central) = session();
    let peripheral = central.peripheral(link_id());
    let descriptor = Descriptor {
        id: AttributeId::new(9),
        characteristic: AttributeId::new(5),
        uuid: BluetoothUuid::Uuid16(btuuid::BluetoothUuid16::new(0x2902)),
    };

    let err = peripheral.read_descriptor(&descriptor).await.unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Unsupported);
    let err = peripheral
        .write_descriptor(&descriptor, vec![0])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Unsupported);
}

#[tokio::test]
async fn unexpected_completion_tears_down_the_link_session() {
    let (sim, central) = session();
    sim.set_auto_respond(false);
    let peripheral = central.peripheral(link_id());
    let battery = characteristic(5);

    let mut read = pin!(peripheral.read(&battery));
    assert!(future::poll_once(read.as_mut()).await.is_none());
    let mut updates = peripheral.value_updates(&battery);

    // A services completion nobody asked for.
    sim.emit(BackendEvent::ServicesDiscovered {
        link: link_id(),
        services: Vec::new(),
        error: None,
    });

    let err = future::poll_once(read.as_mut())
        .await
        .expect("read failed")
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::QueueCorruption);
    assert_eq!(updates.next().await, None);

    // The session rejects further requests...
    let err = peripheral.discover_services(None).await.unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::QueueCorruption);

    // ...and reports the teardown on its state observable.
    assert!(matches!(
        peripheral.state(),
        ConnectionState::Disconnected { error: Some(error) }
            if error.kind() == &ErrorKind::QueueCorruption
    ));
}

#[tokio::test]
async fn disconnect_cancels_pending_operations_and_ends_streams() {
    let (sim, central) = session();
    sim.set_auto_respond(false);
    let peripheral = central.peripheral(link_id());
    let battery = characteristic(5);

    let mut read = pin!(peripheral.read(&battery));
    assert!(future::poll_once(read.as_mut()).await.is_none());
    let mut updates = peripheral.value_updates(&battery);

    sim.emit(BackendEvent::LinkStateChanged {
        link: link_id(),
        state: ConnectionState::Disconnected { error: None },
    });

    let err = future::poll_once(read.as_mut())
        .await
        .expect("read canceled")
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Canceled);
    assert_eq!(updates.next().await, None);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected { error: None });

    // Teardown is not corruption: the session accepts new requests.
    let mut retry = pin!(peripheral.read(&battery));
    assert!(future::poll_once(retry.as_mut()).await.is_none());
}

#[tokio::test]
async fn link_state_watch_is_latest_first() {
    let (sim, central) = session();
    let link = sim.add_device(DeviceSpec::new());
    sim.power_on();
    let peripheral = central.connect(link).await.unwrap().session().unwrap();

    let mut states = peripheral.state_changes();
    assert_eq!(states.next().await, Some(ConnectionState::Connected));

    central.disconnect(link).await.unwrap();
    assert_eq!(states.next().await, Some(ConnectionState::Disconnected { error: None }));
}
