use std::collections::VecDeque;
use std::time::Instant;

use tracing::trace;

use crate::types::*;

const SIM_RADIO_BUFSIZE: usize = 125;
const DEFAULT_CCA_THRESHOLD: RadioValue = -85;
const DEFAULT_AMBIENT_RSSI: RadioValue = -100;

/// A frame sitting in a simulated radio's receive buffer.
#[derive(Debug, Clone)]
pub struct SimFrame {
    pub bytes: Vec<u8>,
    pub rssi: i16,
    pub lqi: u8,
}

/// An in-memory radio with a scriptable medium. The transmit path pops
/// outcomes off a script (defaulting to [`TxOutcome::Ok`]) and records
/// delivered frames; the receive path drains an inbox that tests or the
/// simulation harness fill with [`SimRadio::inject`].
#[derive(Debug)]
pub struct SimRadio {
    if_id: u8,
    data_rate: u16,
    channel: RadioValue,
    tx_power: RadioValue,
    cca_threshold: RadioValue,
    ambient_rssi: RadioValue,
    rx_mode: RadioValue,
    tx_mode: RadioValue,
    is_on: bool,
    receiving: bool,
    prepared: Vec<u8>,
    inbox: VecDeque<SimFrame>,
    transmitted: Vec<Vec<u8>>,
    tx_script: VecDeque<TxOutcome>,
    auto_ack: bool,
    auto_ack_dsn_offset: u8,
    last_rssi: i16,
    last_lqi: u8,
    last_packet_timestamp: Option<Instant>,
}

impl SimRadio {
    pub fn new(if_id: u8, data_rate: u16) -> Self {
        Self {
            if_id,
            data_rate,
            channel: 11,
            tx_power: 0,
            cca_threshold: DEFAULT_CCA_THRESHOLD,
            ambient_rssi: DEFAULT_AMBIENT_RSSI,
            rx_mode: RX_MODE_ADDRESS_FILTER | RX_MODE_AUTOACK,
            tx_mode: TX_MODE_SEND_ON_CCA,
            is_on: false,
            receiving: false,
            prepared: Vec::new(),
            inbox: VecDeque::new(),
            transmitted: Vec::new(),
            tx_script: VecDeque::new(),
            auto_ack: false,
            auto_ack_dsn_offset: 0,
            last_rssi: 0,
            last_lqi: 0,
            last_packet_timestamp: None,
        }
    }

    /// Queue a frame for reception.
    pub fn inject(&mut self, bytes: &[u8], rssi: i16) {
        self.inbox.push_back(SimFrame {
            bytes: bytes.to_vec(),
            rssi,
            lqi: 255,
        });
    }

    /// Script the outcome of upcoming transmissions, first in first out.
    pub fn script_tx(&mut self, outcome: TxOutcome) {
        self.tx_script.push_back(outcome);
    }

    pub fn set_receiving(&mut self, receiving: bool) {
        self.receiving = receiving;
    }

    /// Simulate a peer that acknowledges every delivered data frame: on a
    /// successful transmit, a 3-byte acknowledgment echoing the frame's
    /// sequence number (byte 2) lands in the receive buffer.
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.auto_ack = auto_ack;
    }

    /// Corrupt the echoed sequence number of simulated acknowledgments.
    pub fn set_auto_ack_dsn_offset(&mut self, offset: u8) {
        self.auto_ack_dsn_offset = offset;
    }

    pub fn set_ambient_rssi(&mut self, rssi: RadioValue) {
        self.ambient_rssi = rssi;
    }

    /// Frames delivered to the medium so far.
    pub fn transmitted(&self) -> &[Vec<u8>] {
        &self.transmitted
    }

    pub fn clear_transmitted(&mut self) {
        self.transmitted.clear();
    }
}

impl Radio for SimRadio {
    fn init(&mut self) -> RadioResult<()> {
        self.is_on = false;
        self.inbox.clear();
        self.transmitted.clear();
        Ok(())
    }

    fn prepare(&mut self, payload: &[u8]) -> RadioResult<()> {
        if payload.len() > SIM_RADIO_BUFSIZE {
            return Err(RadioError::InvalidValue);
        }
        self.prepared = payload.to_vec();
        Ok(())
    }

    fn transmit(&mut self, len: usize) -> TxOutcome {
        if !self.is_on || len > self.prepared.len() {
            return TxOutcome::Err;
        }
        let outcome = self.tx_script.pop_front().unwrap_or(TxOutcome::Ok);
        if outcome == TxOutcome::Ok {
            trace!(if_id = self.if_id, len, "sim transmit");
            self.transmitted.push(self.prepared[..len].to_vec());
            if self.auto_ack && len >= 3 && self.prepared[0] & 0x7 == 1 {
                let dsn = self.prepared[2].wrapping_add(self.auto_ack_dsn_offset);
                self.inbox.push_back(SimFrame {
                    bytes: vec![0x02, 0x00, dsn],
                    rssi: self.ambient_rssi as i16,
                    lqi: 255,
                });
            }
        }
        outcome
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.inbox.pop_front() {
            Some(frame) => {
                let len = frame.bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&frame.bytes[..len]);
                self.last_rssi = frame.rssi;
                self.last_lqi = frame.lqi;
                self.last_packet_timestamp = Some(Instant::now());
                len
            }
            None => 0,
        }
    }

    fn channel_clear(&mut self) -> bool {
        /* A reading at exactly the CCA threshold reports busy. */
        self.ambient_rssi < self.cca_threshold
    }

    fn receiving_packet(&mut self) -> bool {
        self.receiving
    }

    fn pending_packet(&mut self) -> bool {
        !self.inbox.is_empty()
    }

    fn on(&mut self) -> RadioResult<()> {
        self.is_on = true;
        Ok(())
    }

    fn off(&mut self) -> RadioResult<()> {
        self.is_on = false;
        Ok(())
    }

    fn get_value(&self, param: RadioParam) -> RadioResult<RadioValue> {
        match param {
            RadioParam::RxMode => Ok(self.rx_mode),
            RadioParam::TxMode => Ok(self.tx_mode),
            RadioParam::Channel => Ok(self.channel),
            RadioParam::TxPower => Ok(self.tx_power),
            RadioParam::Rssi => Ok(self.ambient_rssi),
            RadioParam::LastRssi => Ok(self.last_rssi as RadioValue),
            RadioParam::LastLinkQuality => Ok(self.last_lqi as RadioValue),
            RadioParam::LastInterfaceId => Ok(self.if_id as RadioValue),
            RadioParam::CcaThreshold => Ok(self.cca_threshold),
            RadioParam::ConstMaxPayloadLen => Ok(SIM_RADIO_BUFSIZE as RadioValue),
            RadioParam::ConstInterfaceId => Ok(self.if_id as RadioValue),
            RadioParam::ConstDataRate => Ok(self.data_rate as RadioValue),
            RadioParam::ConstMultiRf => Ok(MULTI_RF_DIS),
            _ => Err(RadioError::NotSupported),
        }
    }

    fn set_value(&mut self, param: RadioParam, value: RadioValue) -> RadioResult<()> {
        match param {
            RadioParam::RxMode => {
                if value & !(RX_MODE_ADDRESS_FILTER | RX_MODE_AUTOACK | RX_MODE_POLL_MODE) != 0 {
                    return Err(RadioError::InvalidValue);
                }
                self.rx_mode = value;
                Ok(())
            }
            RadioParam::TxMode => {
                if value & !TX_MODE_SEND_ON_CCA != 0 {
                    return Err(RadioError::InvalidValue);
                }
                self.tx_mode = value;
                Ok(())
            }
            RadioParam::Channel => {
                self.channel = value;
                Ok(())
            }
            RadioParam::TxPower => {
                self.tx_power = value;
                Ok(())
            }
            RadioParam::CcaThreshold => {
                self.cca_threshold = value;
                Ok(())
            }
            _ => Err(RadioError::NotSupported),
        }
    }

    fn get_object(&self, param: RadioParam) -> RadioResult<RadioObject> {
        match param {
            RadioParam::ConstInterfaceIdCollection => {
                let mut collection = IfaceIdCollection::new();
                collection.push(IfaceDescriptor {
                    if_id: self.if_id,
                    data_rate: self.data_rate,
                });
                Ok(RadioObject::InterfaceIdCollection(collection))
            }
            RadioParam::LastPacketTimestamp => match self.last_packet_timestamp {
                Some(ts) => Ok(RadioObject::LastPacketTimestamp(ts)),
                None => Err(RadioError::NotSupported),
            },
            _ => Err(RadioError::NotSupported),
        }
    }

    fn set_object(&mut self, _param: RadioParam, _object: &RadioObject) -> RadioResult<()> {
        Err(RadioError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_busy_at_exact_cca_threshold() {
        let mut radio = SimRadio::new(1, 250);
        radio.set_ambient_rssi(DEFAULT_CCA_THRESHOLD);
        assert!(!radio.channel_clear());
        radio.set_ambient_rssi(DEFAULT_CCA_THRESHOLD - 1);
        assert!(radio.channel_clear());
    }

    #[test]
    fn transmit_requires_power() {
        let mut radio = SimRadio::new(1, 250);
        assert_eq!(radio.send(&[1, 2, 3]), TxOutcome::Err);
        radio.on().unwrap();
        assert_eq!(radio.send(&[1, 2, 3]), TxOutcome::Ok);
        assert_eq!(radio.transmitted().len(), 1);
    }

    #[test]
    fn read_drains_inbox_and_records_rssi() {
        let mut radio = SimRadio::new(1, 250);
        radio.inject(&[0xAA, 0xBB], -71);
        assert!(radio.pending_packet());

        let mut buf = [0u8; 8];
        let len = radio.read(&mut buf);
        assert_eq!(len, 2);
        assert_eq!(&buf[..2], &[0xAA, 0xBB]);
        assert_eq!(radio.get_value(RadioParam::LastRssi).unwrap(), -71);
        assert!(!radio.pending_packet());
    }
}
