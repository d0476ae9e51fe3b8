use std::time::Instant;

use thiserror::Error;

/// Scalar value exchanged with a radio driver through [`Radio::get_value`]
/// and [`Radio::set_value`].
pub type RadioValue = i32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    #[error("parameter not supported")]
    NotSupported,

    #[error("invalid parameter value")]
    InvalidValue,

    #[error("radio failure")]
    Failed,
}

pub type RadioResult<T> = Result<T, RadioError>;

/// Outcome of a single transmit primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Ok,
    Collision,
    Err,
}

/// Parameters addressable through the value accessors. Parameters prefixed
/// with `Const` are read-only for a given driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioParam {
    /// Bitmask of `RX_MODE_*` flags.
    RxMode,
    /// Bitmask of `TX_MODE_*` flags.
    TxMode,
    Channel,
    TxPower,
    /// Current RSSI reading on the selected interface.
    Rssi,
    /// RSSI of the most recently received frame.
    LastRssi,
    /// Link quality indicator of the most recently received frame.
    LastLinkQuality,
    /// Interface that delivered the most recently received frame.
    LastInterfaceId,
    CcaThreshold,
    ConstMaxPayloadLen,
    /// Selected interface of a multi-interface driver.
    SelIfId,
    /// Interface ID of the (selected) underlying radio.
    ConstInterfaceId,
    /// Nominal data rate of the (selected) underlying radio, in kbps.
    ConstDataRate,
    /// Whether the driver drives multiple concurrent interfaces.
    ConstMultiRf,
    /// Object-valued: timestamp of the most recently received frame.
    LastPacketTimestamp,
    /// Object-valued: the advertised `(if_id, data_rate)` set.
    ConstInterfaceIdCollection,
}

pub const RX_MODE_ADDRESS_FILTER: RadioValue = 1 << 0;
pub const RX_MODE_AUTOACK: RadioValue = 1 << 1;
pub const RX_MODE_POLL_MODE: RadioValue = 1 << 2;

pub const TX_MODE_SEND_ON_CCA: RadioValue = 1 << 0;

pub const MULTI_RF_EN: RadioValue = 1;
pub const MULTI_RF_DIS: RadioValue = 0;

/// An interface ID paired with the nominal data rate of that interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceDescriptor {
    pub if_id: u8,
    /// kbps
    pub data_rate: u16,
}

/// The ordered set of interfaces a multi-interface driver advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceIdCollection {
    entries: Vec<IfaceDescriptor>,
}

impl IfaceIdCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: IfaceDescriptor) {
        self.entries.push(entry);
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, if_id: u8) -> bool {
        self.entries.iter().any(|e| e.if_id == if_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IfaceDescriptor> {
        self.entries.iter()
    }
}

/// Structured objects exchanged through [`Radio::get_object`] and
/// [`Radio::set_object`].
#[derive(Debug, Clone)]
pub enum RadioObject {
    LastPacketTimestamp(Instant),
    InterfaceIdCollection(IfaceIdCollection),
}

/// The radio driver contract. Single-interface drivers implement the core
/// operations; composite drivers additionally override the multi-interface
/// extensions.
pub trait Radio {
    fn init(&mut self) -> RadioResult<()>;

    /// Load a payload into the transmit buffer.
    fn prepare(&mut self, payload: &[u8]) -> RadioResult<()>;

    /// Transmit `len` bytes of the prepared payload.
    fn transmit(&mut self, len: usize) -> TxOutcome;

    fn send(&mut self, payload: &[u8]) -> TxOutcome {
        if self.prepare(payload).is_err() {
            return TxOutcome::Err;
        }
        self.transmit(payload.len())
    }

    /// Copy a pending frame into `buf`, returning its length (0 if none).
    fn read(&mut self, buf: &mut [u8]) -> usize;

    fn channel_clear(&mut self) -> bool;

    fn receiving_packet(&mut self) -> bool;

    fn pending_packet(&mut self) -> bool;

    fn on(&mut self) -> RadioResult<()>;

    fn off(&mut self) -> RadioResult<()>;

    fn get_value(&self, param: RadioParam) -> RadioResult<RadioValue>;

    fn set_value(&mut self, param: RadioParam, value: RadioValue) -> RadioResult<()>;

    fn get_object(&self, param: RadioParam) -> RadioResult<RadioObject>;

    fn set_object(&mut self, param: RadioParam, object: &RadioObject) -> RadioResult<()>;

    /// Try-lock preventing interface re-selection while held. Single
    /// interface drivers have nothing to lock.
    fn lock_interface(&mut self) -> bool {
        false
    }

    fn unlock_interface(&mut self) {}

    fn channel_clear_all(&mut self) -> bool {
        self.channel_clear()
    }

    fn receiving_packet_all(&mut self) -> bool {
        self.receiving_packet()
    }

    fn pending_packet_all(&mut self) -> bool {
        self.pending_packet()
    }
}
