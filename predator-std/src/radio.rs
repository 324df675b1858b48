//! Simulated CC1101 front end for the std driver.
//!
//! Behaves like the real radio at the capability boundary: rejects carriers
//! outside the CC1101 bands, refuses to key while already keyed, and
//! reports not-ready when built without a radio. Nothing goes on-air.

use predator::subghz::{self, RadioError, SubGhzRadio};

pub struct SimulatedRadio {
    ready: bool,
    tuned_hz: Option<u32>,
    transmitting: bool,
    transmissions: u32,
}

impl SimulatedRadio {
    pub fn new(ready: bool) -> Self {
        Self {
            ready,
            tuned_hz: None,
            transmitting: false,
            transmissions: 0,
        }
    }

    /// Bursts keyed since construction.
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn tuned_hz(&self) -> Option<u32> {
        self.tuned_hz
    }
}

impl SubGhzRadio for SimulatedRadio {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn tune(&mut self, frequency_hz: u32) -> Result<u32, RadioError> {
        if !self.ready {
            return Err(RadioError::HardwareNotReady);
        }
        if !subghz::is_frequency_valid(frequency_hz) {
            return Err(RadioError::FrequencyNotSupported(frequency_hz));
        }
        self.tuned_hz = Some(frequency_hz);
        Ok(frequency_hz)
    }

    fn transmit_start(&mut self) -> Result<(), RadioError> {
        if !self.ready || self.tuned_hz.is_none() {
            return Err(RadioError::HardwareNotReady);
        }
        if self.transmitting {
            return Err(RadioError::Busy);
        }
        self.transmitting = true;
        self.transmissions += 1;
        log::trace!("TX burst on {:?} Hz", self.tuned_hz());
        Ok(())
    }

    fn transmit_stop(&mut self) {
        self.transmitting = false;
    }

    fn sleep(&mut self) {
        self.transmitting = false;
        self.tuned_hz = None;
        log::debug!("Radio asleep");
    }
}
