use tracing::{debug, warn};

use crate::types::*;

/// A composite driver presenting two or more underlying radios as a single
/// radio. Operations apply to the selected interface unless a `*_all`
/// variant is used; interface selection is serialized through a try-lock,
/// and a selection requested while the lock is held is deferred until the
/// lock is released.
pub struct MultiRadio {
    radios: Vec<Box<dyn Radio>>,
    if_ids: Vec<u8>,
    selected: usize,
    locked: bool,
    deferred_if_id: Option<u8>,
    last_if_id: u8,
    last_rssi: RadioValue,
    last_lqi: RadioValue,
}

impl MultiRadio {
    /// Compose `radios` into one driver. Every underlying radio must report
    /// a distinct non-zero `ConstInterfaceId`; the first radio starts out
    /// selected.
    pub fn new(radios: Vec<Box<dyn Radio>>) -> RadioResult<Self> {
        if radios.is_empty() {
            return Err(RadioError::InvalidValue);
        }
        let mut if_ids = Vec::with_capacity(radios.len());
        for radio in &radios {
            let if_id = radio.get_value(RadioParam::ConstInterfaceId)?;
            if if_id <= 0 || if_id > u8::MAX as RadioValue {
                return Err(RadioError::InvalidValue);
            }
            let if_id = if_id as u8;
            if if_ids.contains(&if_id) {
                return Err(RadioError::InvalidValue);
            }
            if_ids.push(if_id);
        }
        let last_if_id = if_ids[0];
        Ok(Self {
            radios,
            if_ids,
            selected: 0,
            locked: false,
            deferred_if_id: None,
            last_if_id,
            last_rssi: 0,
            last_lqi: 0,
        })
    }

    pub fn selected_if_id(&self) -> u8 {
        self.if_ids[self.selected]
    }

    fn index_of(&self, if_id: u8) -> Option<usize> {
        self.if_ids.iter().position(|&id| id == if_id)
    }

    fn select(&mut self, if_id: u8) -> RadioResult<()> {
        match self.index_of(if_id) {
            Some(index) => {
                if index != self.selected {
                    debug!(
                        from = self.if_ids[self.selected],
                        to = if_id,
                        "switching selected interface"
                    );
                    self.selected = index;
                }
                Ok(())
            }
            None => Err(RadioError::InvalidValue),
        }
    }

    fn selected_radio(&self) -> &dyn Radio {
        self.radios[self.selected].as_ref()
    }

    fn selected_radio_mut(&mut self) -> &mut dyn Radio {
        self.radios[self.selected].as_mut()
    }
}

impl Radio for MultiRadio {
    fn init(&mut self) -> RadioResult<()> {
        for radio in &mut self.radios {
            radio.init()?;
        }
        Ok(())
    }

    fn prepare(&mut self, payload: &[u8]) -> RadioResult<()> {
        self.selected_radio_mut().prepare(payload)
    }

    fn transmit(&mut self, len: usize) -> TxOutcome {
        self.selected_radio_mut().transmit(len)
    }

    /// Read the next pending frame from any interface, preferring the
    /// selected one, and remember which interface delivered it.
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let order: Vec<usize> = std::iter::once(self.selected)
            .chain((0..self.radios.len()).filter(|&i| i != self.selected))
            .collect();
        for index in order {
            if self.radios[index].pending_packet() {
                let len = self.radios[index].read(buf);
                if len > 0 {
                    self.last_if_id = self.if_ids[index];
                    self.last_rssi = self.radios[index]
                        .get_value(RadioParam::LastRssi)
                        .unwrap_or(0);
                    self.last_lqi = self.radios[index]
                        .get_value(RadioParam::LastLinkQuality)
                        .unwrap_or(0);
                    return len;
                }
            }
        }
        0
    }

    fn channel_clear(&mut self) -> bool {
        self.selected_radio_mut().channel_clear()
    }

    fn receiving_packet(&mut self) -> bool {
        self.selected_radio_mut().receiving_packet()
    }

    fn pending_packet(&mut self) -> bool {
        self.selected_radio_mut().pending_packet()
    }

    fn on(&mut self) -> RadioResult<()> {
        for radio in &mut self.radios {
            radio.on()?;
        }
        Ok(())
    }

    fn off(&mut self) -> RadioResult<()> {
        for radio in &mut self.radios {
            radio.off()?;
        }
        Ok(())
    }

    fn get_value(&self, param: RadioParam) -> RadioResult<RadioValue> {
        match param {
            RadioParam::SelIfId | RadioParam::ConstInterfaceId => {
                Ok(self.selected_if_id() as RadioValue)
            }
            RadioParam::ConstMultiRf => Ok(MULTI_RF_EN),
            RadioParam::LastInterfaceId => Ok(self.last_if_id as RadioValue),
            RadioParam::LastRssi => Ok(self.last_rssi),
            RadioParam::LastLinkQuality => Ok(self.last_lqi),
            _ => self.selected_radio().get_value(param),
        }
    }

    fn set_value(&mut self, param: RadioParam, value: RadioValue) -> RadioResult<()> {
        match param {
            RadioParam::SelIfId => {
                if value <= 0 || value > u8::MAX as RadioValue {
                    return Err(RadioError::InvalidValue);
                }
                let if_id = value as u8;
                if self.locked {
                    /* Selection is deferred, not refused, while the
                       interface lock is held. */
                    debug!(if_id, "interface locked, deferring selection");
                    self.deferred_if_id = Some(if_id);
                    return Ok(());
                }
                self.select(if_id)
            }
            _ => self.selected_radio_mut().set_value(param, value),
        }
    }

    fn get_object(&self, param: RadioParam) -> RadioResult<RadioObject> {
        match param {
            RadioParam::ConstInterfaceIdCollection => {
                let mut collection = IfaceIdCollection::new();
                for (index, radio) in self.radios.iter().enumerate() {
                    let data_rate = radio.get_value(RadioParam::ConstDataRate)?;
                    collection.push(IfaceDescriptor {
                        if_id: self.if_ids[index],
                        data_rate: data_rate as u16,
                    });
                }
                Ok(RadioObject::InterfaceIdCollection(collection))
            }
            _ => self.selected_radio().get_object(param),
        }
    }

    fn set_object(&mut self, param: RadioParam, object: &RadioObject) -> RadioResult<()> {
        self.selected_radio_mut().set_object(param, object)
    }

    fn lock_interface(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    fn unlock_interface(&mut self) {
        self.locked = false;
        if let Some(if_id) = self.deferred_if_id.take() {
            if self.select(if_id).is_err() {
                warn!(if_id, "deferred interface selection no longer valid");
            }
        }
    }

    fn channel_clear_all(&mut self) -> bool {
        self.radios.iter_mut().all(|radio| radio.channel_clear())
    }

    fn receiving_packet_all(&mut self) -> bool {
        self.radios.iter_mut().any(|radio| radio.receiving_packet())
    }

    fn pending_packet_all(&mut self) -> bool {
        self.radios.iter_mut().any(|radio| radio.pending_packet())
    }
}
