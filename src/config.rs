//! Peer configuration.

use std::time::Duration;

use crate::error::TransportError;

/// How the unreliable delivery methods treat messages above the current MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnreliableSizeMode {
    /// Send the oversized datagram anyway and let the network decide.
    #[default]
    IgnoreMtu,
    /// Fragment like the reliable methods do.
    NormalFragmentation,
    /// Drop the message and count it.
    DropAboveMtu,
}

/// Classes of library notifications that can be surfaced on the inbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageClass {
    Data = 1 << 0,
    StatusChanged = 1 << 1,
    ConnectionApproval = 1 << 2,
    UnconnectedData = 1 << 3,
    ConnectionLatencyUpdated = 1 << 4,
    DebugMessage = 1 << 5,
    WarningMessage = 1 << 6,
    ErrorMessage = 1 << 7,
}

const DEFAULT_CLASSES: u32 = MessageClass::Data as u32
    | MessageClass::StatusChanged as u32
    | MessageClass::WarningMessage as u32
    | MessageClass::ErrorMessage as u32;

/// Smallest MTU the transport will operate with.
pub const MINIMUM_MTU: usize = 512;
/// Default and largest configurable startup MTU; chosen to clear typical
/// internet paths without fragmentation.
pub const DEFAULT_MTU: usize = 1408;

/// Options for a [`crate::Peer`]. Constructed per peer and consumed by
/// `Peer::new`, so a running peer's configuration cannot change under it.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Identifies the application; peers with different identifiers refuse
    /// each other during the handshake.
    pub app_identifier: String,
    /// Local UDP port; 0 binds an ephemeral port.
    pub port: u16,
    pub maximum_transmission_unit: usize,
    pub auto_expand_mtu: bool,
    /// How long to wait for a probe reply before counting a timeout.
    pub expand_mtu_frequency: Duration,
    /// OS-level send failures tolerated before MTU probing gives up.
    pub expand_mtu_fail_attempts: u8,
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
    pub resend_handshake_interval: Duration,
    pub maximum_handshake_attempts: u8,
    /// Initial capacity in bytes for messages from `Peer::create_message`.
    pub default_outgoing_message_capacity: usize,
    pub unreliable_size_mode: UnreliableSizeMode,
    pub accept_incoming_connections: bool,
    pub maximum_connections: u32,
    /// Send queued messages on every heartbeat. When off, queued traffic
    /// waits for an explicit flush.
    pub auto_flush_send_queue: bool,
    pub use_message_recycling: bool,
    enabled_classes: u32,
}

impl PeerConfig {
    pub fn new(app_identifier: impl Into<String>) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            port: 0,
            maximum_transmission_unit: DEFAULT_MTU,
            auto_expand_mtu: false,
            expand_mtu_frequency: Duration::from_secs(2),
            expand_mtu_fail_attempts: 5,
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            resend_handshake_interval: Duration::from_secs(3),
            maximum_handshake_attempts: 5,
            default_outgoing_message_capacity: 16,
            unreliable_size_mode: UnreliableSizeMode::default(),
            accept_incoming_connections: false,
            maximum_connections: 32,
            auto_flush_send_queue: true,
            use_message_recycling: true,
            enabled_classes: DEFAULT_CLASSES,
        }
    }

    pub fn enable_class(&mut self, class: MessageClass) -> &mut Self {
        self.enabled_classes |= class as u32;
        self
    }

    pub fn disable_class(&mut self, class: MessageClass) -> &mut Self {
        self.enabled_classes &= !(class as u32);
        self
    }

    pub fn is_class_enabled(&self, class: MessageClass) -> bool {
        self.enabled_classes & class as u32 != 0
    }

    /// Checks the option set before the peer starts.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.app_identifier.is_empty() {
            return Err(TransportError::InvalidConfig(
                "app_identifier must not be empty".into(),
            ));
        }
        if self.maximum_transmission_unit < MINIMUM_MTU
            || self.maximum_transmission_unit > DEFAULT_MTU
        {
            return Err(TransportError::InvalidConfig(format!(
                "maximum_transmission_unit {} outside {}..={}",
                self.maximum_transmission_unit, MINIMUM_MTU, DEFAULT_MTU
            )));
        }
        if self.ping_interval >= self.connection_timeout {
            return Err(TransportError::InvalidConfig(
                "ping_interval must be below connection_timeout".into(),
            ));
        }
        if self.maximum_handshake_attempts == 0 {
            return Err(TransportError::InvalidConfig(
                "maximum_handshake_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
