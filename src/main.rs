use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use mcba::{
    channel_pair, CanFrame, DeviceConfig, EmulatorConfig, McbaDevice, McbaDeviceBuilder, ReadMode,
    Session,
};

#[derive(Parser)]
#[command(author, version, about = "MCBA USB-CAN adapter driver")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive an emulated adapter: set the bitrate, send frames and read
    /// the loopback.
    Simulate {
        #[arg(long, default_value_t = 500_000)]
        bitrate: u32,
        /// Frames per write, 1 to 16.
        #[arg(long, default_value_t = 8)]
        frames: usize,
        /// Concurrent writers.
        #[arg(long, default_value_t = 1)]
        writers: usize,
        #[arg(long, default_value_t = 16)]
        slot_count: usize,
        #[arg(long, default_value_t = 128)]
        read_queue_capacity: usize,
        #[arg(long, default_value_t = 4096)]
        message_page_size: usize,
        #[arg(long)]
        max_message_pages: Option<usize>,
        #[arg(long)]
        no_termination: bool,
        /// Emulated keep-alive period in milliseconds.
        #[arg(long)]
        keep_alive_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> mcba::Result<()> {
    env_logger::init();
    let Command::Simulate {
        bitrate,
        frames,
        writers,
        slot_count,
        read_queue_capacity,
        message_page_size,
        max_message_pages,
        no_termination,
        keep_alive_ms,
    } = Args::parse().command;

    let (channel, emulator) = channel_pair(
        64,
        EmulatorConfig {
            keep_alive_period: keep_alive_ms.map(Duration::from_millis),
            ..Default::default()
        },
    )?;
    let emulator = emulator.spawn();
    let device = McbaDeviceBuilder::new(channel)
        .with_config(DeviceConfig {
            slot_count,
            read_queue_capacity,
            message_page_size,
            max_message_pages,
        })
        .build()?;
    device.start().await?;

    let session = device.open_session();
    device.set_bitrate(bitrate).await?;
    device.set_termination(!no_termination).await?;

    let batch: Vec<CanFrame> = (0..frames)
        .filter_map(|i| CanFrame::new_standard(0x100 + i as u16, &(i as u64).to_be_bytes()))
        .collect();
    let completions = join_all((0..writers).map(|_| session.write(&batch))).await;
    for completion in completions {
        println!("write: {:?}, {} bytes", completion.status, completion.transferred);
    }

    let expected = frames * writers;
    read_back(&session, expected).await;
    // let the last keep-alives land
    tokio::time::sleep(Duration::from_millis(10)).await;
    report(&device, &session);

    drop(session);
    device.stop().await;
    emulator.abort();
    Ok(())
}

async fn read_back(session: &Session, expected: usize) {
    let mut received = 0;
    while received < expected {
        let read = session.read(expected - received, ReadMode::ReadAtLeastOne);
        match tokio::time::timeout(Duration::from_secs(1), read).await {
            Ok(Ok(batch)) => {
                for frame in &batch {
                    println!(
                        "{:>20} {:08x} [{}] {:02x?}",
                        frame.timestamp,
                        frame.frame.can_id(),
                        frame.frame.dlc_u8(),
                        frame.frame.data_bytes()
                    );
                }
                received += batch.len();
            }
            Ok(Err(e)) => {
                eprintln!("read failed: {}", e);
                break;
            }
            Err(_) => {
                eprintln!("timed out with {} of {} frames", received, expected);
                break;
            }
        }
    }
}

fn report(device: &McbaDevice, session: &Session) {
    let status = device.status();
    println!("bitrate: {}", status.bitrate);
    println!(
        "firmware: usb {}.{}, can {}.{}",
        status.usb_version.major,
        status.usb_version.minor,
        status.can_version.major,
        status.can_version.minor
    );
    println!("termination: {}", status.termination_enabled());
    println!("bus state: {:?}", status.bus_state);
    println!("device stats: {:?}", status.stats);
    println!("session stats: {:?}", session.stats());
}
