use thiserror::Error;

/// Errors that can occur when driving a Bushido trainer
#[derive(Error, Debug)]
pub enum BushidoError {
    /// USB related errors (enumeration, open, claim)
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    /// A bulk transfer on the device link failed
    #[error("USB transfer failed: {0}")]
    Transfer(String),

    /// No ANT stick with the Bushido vendor/product id was found
    #[error("Bushido ANT stick not found")]
    DeviceNotFound,

    /// The device link was closed
    #[error("Device disconnected")]
    Disconnected,

    /// An inbound frame failed checksum validation
    #[error("Frame checksum mismatch: expected {expected:02X}, received {actual:02X}")]
    Checksum {
        /// Checksum computed over the received header and payload
        expected: u8,
        /// Checksum byte carried by the frame
        actual: u8,
    },

    /// A command was retransmitted the configured number of times without acknowledgment
    #[error("Command {command:02X} not acknowledged after {attempts} attempts")]
    LinkTimeout {
        /// Message type of the unacknowledged command
        command: u8,
        /// Number of transmissions performed
        attempts: u32,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Invalid session state for the requested operation
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },
}

/// Result type for Bushido operations
pub type Result<T> = std::result::Result<T, BushidoError>;

impl BushidoError {
    /// Check if this error indicates a link issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Usb(_)
                | Self::Transfer(_)
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is a wire protocol violation
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Checksum { .. } | Self::LinkTimeout { .. }
        )
    }

    /// Check if this error is recoverable without reopening the link
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidParameters(_) | Self::InvalidState { .. })
    }
}
