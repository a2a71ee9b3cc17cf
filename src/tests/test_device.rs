use std::time::Duration;

use crate::{
    adaptor::{channel_pair, DriverError, EmulatorConfig},
    protocol::{CanBusState, CanFrame, FirmwareVersion, RECEIVED_FRAME_RECORD_SIZE},
    DeviceConfig, McbaDevice, McbaDeviceBuilder, ReadMode,
};

async fn started(config: EmulatorConfig) -> McbaDevice {
    let (channel, emulator) = channel_pair(32, config).unwrap();
    emulator.spawn();
    let device = McbaDeviceBuilder::new(channel).build().unwrap();
    device.start().await.unwrap();
    device
}

/// Wait until `check` holds, the emulator answers asynchronously.
async fn eventually(device: &McbaDevice, check: impl Fn(&McbaDevice) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check(device) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

fn frames(n: usize) -> Vec<CanFrame> {
    (0..n)
        .map(|i| CanFrame::new_extended(0x100 + i as u32, &[i as u8; 8]).unwrap())
        .collect()
}

#[tokio::test]
async fn test_start_reads_firmware_versions() {
    let device = started(EmulatorConfig::default()).await;
    eventually(&device, |device| device.status().can_version.major != 0).await;
    eventually(&device, |device| device.status().usb_version.major != 0).await;

    let status = device.status();
    assert_eq!(status.usb_version, FirmwareVersion { major: 2, minor: 6 });
    assert_eq!(status.can_version, FirmwareVersion { major: 3, minor: 1 });
    assert_eq!(status.bitrate, 500_000);
    assert!(status.termination_enabled());
    assert_eq!(status.bus_state, CanBusState::ErrorActive);
    eventually(&device, |device| device.free_slots() == 16).await;
}

#[tokio::test]
async fn test_loopback_batch() {
    let device = started(EmulatorConfig::default()).await;
    let session = device.open_session();

    let sent = frames(16);
    let completion = session.write(&sent).await;
    assert_eq!(completion.into_result(), Ok(16 * 16));

    let mut received = Vec::new();
    while received.len() < sent.len() {
        let read = session.read(sent.len() - received.len(), ReadMode::ReadAtLeastOne);
        let batch = tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .unwrap()
            .unwrap();
        assert!(!batch.is_empty());
        received.extend(batch.into_iter().map(|frame| frame.frame));
    }
    // one sender, so arrival order is submission order
    assert_eq!(received, sent);
    assert_eq!(session.stats().rx_lost, 0);
    eventually(&device, |device| device.free_slots() == 16).await;
}

#[tokio::test]
async fn test_oversized_and_empty_writes() {
    let device = started(EmulatorConfig::default()).await;
    let session = device.open_session();
    assert_eq!(session.write(&[]).await.into_result(), Ok(0));
    assert!(matches!(
        session.write(&frames(17)).await.status,
        Err(DriverError::InvalidArgument(_))
    ));
    eventually(&device, |device| device.free_slots() == 16).await;
}

#[tokio::test]
async fn test_broadcast_to_sessions() {
    let device = started(EmulatorConfig::default()).await;
    let first = device.open_session();
    let second = device.open_session();
    assert_eq!(device.client_count(), 2);

    let frame = CanFrame::new_standard(0x7ff, &[0xaa]).unwrap();
    first.write(&[frame]).await.into_result().unwrap();

    for session in [&first, &second] {
        let read = session.read(1, ReadMode::ReadAll);
        let got = tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got[0].frame, frame);
        assert!(got[0].timestamp > 0);
    }

    drop(second);
    assert_eq!(device.client_count(), 1);
}

#[tokio::test]
async fn test_read_bytes_records() {
    let device = started(EmulatorConfig::default()).await;
    let session = device.open_session();
    let sent = frames(2);
    session.write(&sent).await.into_result().unwrap();
    eventually(&device, |_| session.buffered() == 2).await;

    let mut buf = [0u8; 4 * RECEIVED_FRAME_RECORD_SIZE];
    let n = session.read_bytes(&mut buf, ReadMode::NonBlocking).await.unwrap();
    assert_eq!(n, 2 * RECEIVED_FRAME_RECORD_SIZE);
    assert_eq!(&buf[..16], &sent[0].to_record());
    assert_eq!(&buf[24..40], &sent[1].to_record());
}

#[tokio::test]
async fn test_set_bitrate() {
    let device = started(EmulatorConfig::default()).await;
    for (bps, reported) in [(33_333, 33_333), (83_333, 83_333), (47_000, 47_000), (125_000, 125_000)] {
        device.set_bitrate(bps).await.unwrap();
        eventually(&device, |device| device.bitrate() == reported).await;
    }
    assert!(matches!(
        device.set_bitrate(70_000_000).await,
        Err(DriverError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_termination_and_stats() {
    let device = started(EmulatorConfig::default()).await;
    eventually(&device, |device| device.status().termination_enabled()).await;
    device.set_termination(false).await.unwrap();
    eventually(&device, |device| !device.status().termination_enabled()).await;

    device.clear_stats();
    assert_eq!(device.stats(), Default::default());
    assert_eq!(device.reset().await, Err(DriverError::NotImplemented));
}

#[tokio::test]
async fn test_stop_rejects_writes() {
    let device = started(EmulatorConfig::default()).await;
    let session = device.open_session();
    device.stop().await;
    assert_eq!(
        session.write(&frames(1)).await.status,
        Err(DriverError::DeviceStopped)
    );
    assert_eq!(
        session.write(&frames(3)).await.status,
        Err(DriverError::DeviceStopped)
    );
    eventually(&device, |device| device.free_slots() == 16).await;
}

#[tokio::test]
async fn test_small_config() {
    let (channel, emulator) = channel_pair(4, EmulatorConfig::default()).unwrap();
    emulator.spawn();
    let device = McbaDeviceBuilder::new(channel)
        .with_config(DeviceConfig {
            slot_count: 2,
            read_queue_capacity: 2,
            ..Default::default()
        })
        .build()
        .unwrap();
    device.start().await.unwrap();
    let session = device.open_session();

    assert!(matches!(
        session.write(&frames(3)).await.status,
        Err(DriverError::ResourceExhausted(_))
    ));
    for _ in 0..2 {
        session.write(&frames(2)).await.into_result().unwrap();
    }
    eventually(&device, |_| session.stats().rx_lost == 2).await;
    assert_eq!(session.buffered(), 2);
}

#[test]
fn test_invalid_config() {
    let (channel, _emulator) = channel_pair(4, EmulatorConfig::default()).unwrap();
    let result = McbaDeviceBuilder::new(channel)
        .with_config(DeviceConfig {
            slot_count: 17,
            ..Default::default()
        })
        .build();
    assert!(matches!(result, Err(DriverError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_cancelled_batch_returns_slots() {
    // one queued transfer fills the channel, nobody drains it
    let (channel, emulator) = channel_pair(1, EmulatorConfig::default()).unwrap();
    let device = McbaDeviceBuilder::new(channel).build().unwrap();
    let session = device.open_session();

    let batch = frames(3);
    let write = session.write(&batch);
    assert!(tokio::time::timeout(Duration::from_millis(50), write)
        .await
        .is_err());
    assert_eq!(device.free_slots(), 13);

    // the queued transfer settles as cancelled with its channel
    drop(emulator);
    assert_eq!(device.free_slots(), 16);
}

#[tokio::test]
async fn test_repeated_cancelled_batches() {
    let (channel, emulator) = channel_pair(1, EmulatorConfig::default()).unwrap();
    let device = McbaDeviceBuilder::new(channel).build().unwrap();
    let session = device.open_session();
    for _ in 0..4 {
        let batch = frames(16);
        let write = session.write(&batch);
        assert!(tokio::time::timeout(Duration::from_millis(10), write)
            .await
            .is_err());
    }
    drop(emulator);
    assert_eq!(device.free_slots(), 16);
}

#[tokio::test]
async fn test_start_with_one_slot() {
    let (channel, emulator) = channel_pair(4, EmulatorConfig::default()).unwrap();
    emulator.spawn();
    let device = McbaDeviceBuilder::new(channel)
        .with_config(DeviceConfig {
            slot_count: 1,
            ..Default::default()
        })
        .build()
        .unwrap();
    device.start().await.unwrap();
    eventually(&device, |device| {
        let status = device.status();
        status.usb_version.major != 0 && status.can_version.major != 0
    })
    .await;

    let session = device.open_session();
    assert_eq!(session.write(&frames(1)).await.into_result(), Ok(16));
    eventually(&device, |device| device.free_slots() == 1).await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let device = started(EmulatorConfig::default()).await;
    device.stop().await;
    device.start().await.unwrap();

    let session = device.open_session();
    let frame = CanFrame::new_standard(0x55, &[5]).unwrap();
    session.write(&[frame]).await.into_result().unwrap();
    let read = session.read(1, ReadMode::ReadAll);
    let got = tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got[0].frame, frame);
}
