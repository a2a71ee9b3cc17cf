use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    adaptor::{BulkInSink, DriverError, Result, UsbTransport, Writer},
    config::DeviceConfig,
    demux::ReceiveDemux,
    protocol::{Codec, DeviceStats, DeviceStatus},
    session::{ClientList, MessageBufferPool, Session},
};

/// A USB to CAN adapter bound to a transport.
///
/// Cheap to clone; all clones drive the same adapter.
#[derive(Clone)]
pub struct McbaDevice(Arc<DeviceShared>);

struct DeviceShared {
    config: DeviceConfig,
    writer: Arc<Writer>,
    demux: Arc<ReceiveDemux>,
    status: Arc<Mutex<DeviceStatus>>,
    clients: Arc<ClientList>,
    buffers: Arc<MessageBufferPool>,
}

impl McbaDevice {
    /// Start the bulk-in reader and ask both firmware halves for their
    /// version. The pipes are stopped again if the requests cannot be sent.
    pub async fn start(&self) -> Result<()> {
        let transport = self.0.writer.transport();
        transport.start_continuous_read(BulkInSink::new(Arc::downgrade(&self.0.demux)))?;
        if let Err(e) = self.0.writer.send_firmware_requests().await {
            log::error!("device start failed: {}", e);
            transport.stop_pipes().await;
            return Err(e);
        }
        log::info!(
            "device started with {} slots",
            self.0.writer.pool().capacity()
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.0.writer.transport().stop_pipes().await;
        log::info!("device stopped");
    }

    /// Register a new client. It receives every frame that arrives from
    /// now on.
    pub fn open_session(&self) -> Session {
        Session::open(
            Arc::clone(&self.0.clients),
            Arc::clone(&self.0.writer),
            Arc::clone(&self.0.buffers),
            self.0.config.read_queue_capacity,
        )
    }

    /// Ask the adapter to switch bitrate. The new rate shows up in
    /// [`McbaDevice::bitrate`] once the adapter confirms it in a keep-alive.
    pub async fn set_bitrate(&self, bps: u32) -> Result<()> {
        let message = self.0.writer.codec().encode_change_bitrate(bps)?;
        log::info!("set bitrate {}", bps);
        self.0.writer.write_control(message).await
    }

    /// Last bitrate reported by the adapter, 0 if none yet.
    pub fn bitrate(&self) -> u32 {
        self.0.status.lock().bitrate
    }

    pub fn stats(&self) -> DeviceStats {
        self.0.status.lock().stats
    }

    pub fn clear_stats(&self) {
        self.0.status.lock().clear_stats();
    }

    pub fn status(&self) -> DeviceStatus {
        *self.0.status.lock()
    }

    pub async fn set_termination(&self, enabled: bool) -> Result<()> {
        let message = self.0.writer.codec().encode_termination(enabled);
        log::info!("set termination {}", if enabled { "on" } else { "off" });
        self.0.writer.write_control(message).await
    }

    /// The adapter has no reset command.
    pub async fn reset(&self) -> Result<()> {
        log::warn!("device reset requested");
        Err(DriverError::NotImplemented)
    }

    pub fn free_slots(&self) -> usize {
        self.0.writer.pool().free_count()
    }

    pub fn client_count(&self) -> usize {
        self.0.clients.len()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.0.config
    }

    /// Messages the receive path skipped for an unexpected command id.
    pub fn unsupported_messages(&self) -> u64 {
        self.0.demux.unsupported_messages()
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::debug!(
            "releasing device with {} message buffer pages",
            self.buffers.pages()
        );
    }
}

impl std::fmt::Debug for McbaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McbaDevice")
            .field("config", &self.0.config)
            .field("clients", &self.0.clients.len())
            .field("free_slots", &self.0.writer.pool().free_count())
            .finish()
    }
}

pub struct McbaDeviceBuilder {
    transport: Arc<dyn UsbTransport>,
    config: DeviceConfig,
}

impl McbaDeviceBuilder {
    pub fn new(transport: impl UsbTransport) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn UsbTransport>) -> Self {
        Self {
            transport,
            config: DeviceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<McbaDevice> {
        self.config.validate()?;
        let codec = Codec::detect()?;
        let status = Arc::new(Mutex::new(DeviceStatus::default()));
        let clients = Arc::new(ClientList::new());
        let demux = Arc::new(ReceiveDemux::new(
            codec,
            Arc::clone(&status),
            Arc::clone(&clients),
        ));
        let writer = Arc::new(Writer::new(self.transport, self.config.slot_count, codec)?);
        let buffers = Arc::new(MessageBufferPool::new(
            self.config.message_page_size,
            self.config.max_message_pages,
        ));
        Ok(McbaDevice(Arc::new(DeviceShared {
            config: self.config,
            writer,
            demux,
            status,
            clients,
            buffers,
        })))
    }
}
