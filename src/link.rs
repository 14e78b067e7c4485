use async_trait::async_trait;
use bytes::Bytes;
use nusb::transfer::{Bulk, In, Out};
use nusb::Endpoint;
use tracing::{debug, info};

use crate::{
    error::{BushidoError, Result},
    types::LinkParams,
};

/// Number of bulk IN transfers kept in flight
const PENDING_READS: usize = 4;

/// Byte-level link to the ANT stick
///
/// The transport engine is the only user of a link; it never issues two
/// transfers concurrently.
#[async_trait]
pub trait DeviceLink: Send {
    /// Transmit raw bytes
    async fn transfer_out(&mut self, data: &[u8]) -> Result<()>;

    /// Receive the next chunk of raw bytes
    ///
    /// Implementations must be cancel-safe: dropping the returned future
    /// before it completes must not lose received data.
    async fn transfer_in(&mut self) -> Result<Bytes>;
}

#[async_trait]
impl<L: DeviceLink + ?Sized> DeviceLink for Box<L> {
    async fn transfer_out(&mut self, data: &[u8]) -> Result<()> {
        (**self).transfer_out(data).await
    }

    async fn transfer_in(&mut self) -> Result<Bytes> {
        (**self).transfer_in().await
    }
}

/// USB bulk link to the Bushido ANT stick
pub struct UsbLink {
    bulk_out: Endpoint<Bulk, Out>,
    bulk_in: Endpoint<Bulk, In>,
    read_chunk_size: usize,
}

impl UsbLink {
    /// Find, open and claim the ANT stick
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::DeviceNotFound`] if no stick with the configured
    /// vendor/product id is attached, or [`BushidoError::Usb`] if opening the
    /// device, claiming the interface or opening an endpoint fails. Nothing is
    /// left claimed on error.
    pub async fn open(params: &LinkParams) -> Result<Self> {
        info!(
            "Looking for ANT stick {:04X}:{:04X}",
            params.vendor_id, params.product_id
        );

        let device_info = nusb::list_devices()
            .await?
            .find(|dev| dev.vendor_id() == params.vendor_id && dev.product_id() == params.product_id)
            .ok_or(BushidoError::DeviceNotFound)?;

        let device = device_info.open().await?;
        info!(
            "Device {}:{:03} opened",
            device_info.bus_id(),
            device_info.device_address()
        );

        let interface = device.claim_interface(params.interface).await?;
        info!("Interface {} claimed", params.interface);

        let bulk_out = interface.endpoint::<Bulk, Out>(params.out_endpoint)?;
        let mut bulk_in = interface.endpoint::<Bulk, In>(params.in_endpoint)?;

        for _ in 0..PENDING_READS {
            let buffer = bulk_in.allocate(params.read_chunk_size);
            bulk_in.submit(buffer);
        }

        Ok(Self {
            bulk_out,
            bulk_in,
            read_chunk_size: params.read_chunk_size,
        })
    }
}

#[async_trait]
impl DeviceLink for UsbLink {
    async fn transfer_out(&mut self, data: &[u8]) -> Result<()> {
        debug!("Sending frame: {:02X?}", data);

        let mut buffer = self.bulk_out.allocate(data.len());
        buffer.extend_from_slice(data);
        self.bulk_out.submit(buffer);

        let completion = self.bulk_out.next_complete().await;
        completion
            .status
            .map_err(|e| BushidoError::Transfer(format!("bulk OUT: {e:?}")))
    }

    async fn transfer_in(&mut self) -> Result<Bytes> {
        let completion = self.bulk_in.next_complete().await;
        completion
            .status
            .map_err(|e| BushidoError::Transfer(format!("bulk IN: {e:?}")))?;

        let chunk = Bytes::copy_from_slice(&completion.buffer[..completion.actual_len]);

        let buffer = self.bulk_in.allocate(self.read_chunk_size);
        self.bulk_in.submit(buffer);

        Ok(chunk)
    }
}
