//! The protocol layer proper: one call per command kind on top of a
//! [Transport], plus the per-generation calibration that turns stimulus
//! intensities into bytes the actuators can feel.

use clap::ValueEnum;
use log::{debug, trace};

use std::time::Duration;

use crate::protocol::{Command, SoundBite};
use crate::transport::{Endpoint, Transport, TransportError};

/// Hardware revisions in the field. They differ in the weakest intensity the
/// actuators still render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceGeneration {
    /// First revision; needs a high floor.
    V1,
    /// Second revision.
    V2,
}

impl DeviceGeneration {
    /// The intensity floor this revision was calibrated with.
    pub fn intensity_floor(self) -> u8 {
        match self {
            DeviceGeneration::V1 => 200,
            DeviceGeneration::V2 => 144,
        }
    }
}

/// Calibration and link parameters for one deployed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Serial line speed.
    pub baud_rate: u32,
    /// Weakest intensity byte ever sent; stimulus intensities are rescaled
    /// into `intensity_floor..=255`.
    pub intensity_floor: u8,
    /// How long to wait on the device worker before giving up.
    pub reply_timeout: Duration,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::for_generation(DeviceGeneration::V2)
    }
}

impl DeviceProfile {
    /// Default link settings with the generation's floor.
    pub fn for_generation(generation: DeviceGeneration) -> Self {
        DeviceProfile {
            baud_rate: 115200,
            intensity_floor: generation.intensity_floor(),
            reply_timeout: Duration::from_secs(2),
        }
    }

    /// Replaces the floor.
    pub fn with_floor(self, intensity_floor: u8) -> Self {
        DeviceProfile {
            intensity_floor,
            ..self
        }
    }

    /// Replaces the baud rate.
    pub fn with_baud_rate(self, baud_rate: u32) -> Self {
        DeviceProfile { baud_rate, ..self }
    }

    /// Replaces the worker reply timeout.
    pub fn with_timeout(self, reply_timeout: Duration) -> Self {
        DeviceProfile {
            reply_timeout,
            ..self
        }
    }

    /// Rescales `0..=255` into `floor..=255`. Zero stays zero so silent
    /// samples remain silent.
    pub fn apply_floor(&self, intensity: u8) -> u8 {
        if intensity == 0 {
            return 0;
        }
        let floor = self.intensity_floor as u32;
        (floor + intensity as u32 * (255 - floor) / 255) as u8
    }
}

/// Something the engine can send device commands through. Implemented by the
/// direct [Device] and by the worker handle in [crate::component].
pub trait DeviceLink {
    /// Sends one command.
    fn send(&mut self, command: Command) -> Result<(), TransportError>;

    /// Where the device lives.
    fn endpoint(&self) -> Endpoint;
}

/// A device reached through one [Transport].
pub struct Device {
    transport: Box<dyn Transport>,
    profile: DeviceProfile,
    last_combined: Option<(u8, u8, u8)>,
}

impl Device {
    /// Wraps `transport`; nothing is opened yet.
    pub fn new(transport: Box<dyn Transport>, profile: DeviceProfile) -> Self {
        Device {
            transport,
            profile,
            last_combined: None,
        }
    }

    /// The calibration in use.
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Applies calibration and deduplication, then writes the frame.
    ///
    /// A [Command::CombinedSignal] identical to the previous one that went
    /// out is dropped. The comparison uses the payload as given, before the
    /// floor is applied.
    pub fn execute(&mut self, command: Command) -> Result<(), TransportError> {
        let framed = match command {
            Command::CombinedSignal {
                cell,
                pitch,
                intensity,
            } => {
                if self.last_combined == Some((cell, pitch, intensity)) {
                    trace!("dropping repeated combined signal for cell {cell}");
                    return Ok(());
                }
                let frame = Command::CombinedSignal {
                    cell,
                    pitch,
                    intensity: self.profile.apply_floor(intensity),
                };
                self.write(&frame)?;
                self.last_combined = Some((cell, pitch, intensity));
                return Ok(());
            }
            Command::SetActuatorIntensity { cell, intensity } => Command::SetActuatorIntensity {
                cell,
                intensity: self.profile.apply_floor(intensity),
            },
            Command::LoadSoundBite(bite) => {
                let profile = self.profile;
                Command::LoadSoundBite(bite.map_intensity(|i| profile.apply_floor(i)))
            }
            other => other,
        };

        let reset = framed == Command::Stop;
        self.write(&framed)?;
        if reset {
            self.last_combined = None;
        }
        Ok(())
    }

    fn write(&mut self, command: &Command) -> Result<(), TransportError> {
        debug!("-> {:?}", command.opcode());
        self.transport.write_all(&command.encode())
    }

    /// Runs the actuator self-calibration.
    pub fn calibrate(&mut self) -> Result<(), TransportError> {
        self.execute(Command::Calibrate)
    }

    /// Enables one actuator.
    pub fn enable(&mut self, cell: u8) -> Result<(), TransportError> {
        self.execute(Command::Enable(cell))
    }

    /// Disables one actuator.
    pub fn disable(&mut self, cell: u8) -> Result<(), TransportError> {
        self.execute(Command::Disable(cell))
    }

    /// Drives one cell; repeats of the previous call are not sent.
    pub fn combined_signal(
        &mut self,
        cell: u8,
        pitch: u8,
        intensity: u8,
    ) -> Result<(), TransportError> {
        self.execute(Command::CombinedSignal {
            cell,
            pitch,
            intensity,
        })
    }

    /// Silences every actuator.
    pub fn stop(&mut self) -> Result<(), TransportError> {
        self.execute(Command::Stop)
    }

    /// Uploads a sound bite.
    pub fn load_sound_bite(&mut self, bite: SoundBite) -> Result<(), TransportError> {
        self.execute(Command::LoadSoundBite(bite))
    }

    /// Plays a loaded sound bite.
    pub fn play_sound_bite(&mut self, id: u8) -> Result<(), TransportError> {
        self.execute(Command::PlaySoundBite(id))
    }

    /// Sets the resting intensity of one actuator.
    pub fn set_actuator_intensity(&mut self, cell: u8, intensity: u8) -> Result<(), TransportError> {
        self.execute(Command::SetActuatorIntensity { cell, intensity })
    }

    /// Fires one pulse.
    pub fn pulse_actuator(&mut self, cell: u8) -> Result<(), TransportError> {
        self.execute(Command::PulseActuator(cell))
    }

    /// Liveness probe.
    pub fn ping(&mut self) -> Result<(), TransportError> {
        self.execute(Command::Ping)
    }

    /// Drops the connection; the next command reopens it.
    pub fn close(&mut self) {
        self.transport.close();
        self.last_combined = None;
    }
}

impl DeviceLink for Device {
    fn send(&mut self, command: Command) -> Result<(), TransportError> {
        self.execute(command)
    }

    fn endpoint(&self) -> Endpoint {
        self.transport.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use crate::transport::mock::MockTransport;
    use crate::vtt_format::Sample;

    fn device(floor: u8) -> (Device, MockTransport) {
        let mock = MockTransport::new();
        let profile = DeviceProfile::default().with_floor(floor);
        (Device::new(Box::new(mock.clone()), profile), mock)
    }

    #[test]
    fn floor_rescales_into_perceptible_range() {
        let profile = DeviceProfile::for_generation(DeviceGeneration::V1);
        assert_eq!(profile.intensity_floor, 200);
        assert_eq!(profile.apply_floor(0), 0);
        assert_eq!(profile.apply_floor(1), 200);
        assert_eq!(profile.apply_floor(255), 255);

        let profile = DeviceProfile::for_generation(DeviceGeneration::V2);
        assert_eq!(profile.apply_floor(128), (144 + 128u32 * 111 / 255) as u8);
        assert_eq!(profile.with_floor(0).apply_floor(77), 77);
    }

    #[test]
    fn identical_combined_signals_are_sent_once() {
        let (mut device, mock) = device(0);

        device.combined_signal(3, 40, 90).unwrap();
        device.combined_signal(3, 40, 90).unwrap();
        assert_eq!(mock.write_count(), 1);

        device.combined_signal(3, 41, 90).unwrap();
        device.combined_signal(3, 40, 90).unwrap();
        assert_eq!(mock.write_count(), 3);
    }

    #[test]
    fn stop_forgets_the_last_combined_signal() {
        let (mut device, mock) = device(0);

        device.combined_signal(1, 1, 1).unwrap();
        device.stop().unwrap();
        device.combined_signal(1, 1, 1).unwrap();

        assert_eq!(
            mock.commands(),
            vec![
                Command::CombinedSignal {
                    cell: 1,
                    pitch: 1,
                    intensity: 1
                },
                Command::Stop,
                Command::CombinedSignal {
                    cell: 1,
                    pitch: 1,
                    intensity: 1
                },
            ]
        );
    }

    #[test]
    fn failed_combined_signal_is_retried() {
        let (mut device, mock) = device(0);
        mock.fail_opcode(Opcode::CombinedSignal, 1);

        assert!(device.combined_signal(2, 2, 2).is_err());
        device.combined_signal(2, 2, 2).unwrap();
        assert_eq!(mock.write_count(), 1);
    }

    #[test]
    fn floor_is_applied_to_sound_bites() {
        let (mut device, mock) = device(200);
        let bite = SoundBite::new(
            4,
            vec![
                Sample {
                    phone: 0,
                    pitch: 9,
                    intensity: 255,
                },
                Sample {
                    phone: 255,
                    pitch: 0,
                    intensity: 0,
                },
            ],
        )
        .unwrap();

        device.load_sound_bite(bite).unwrap();

        match &mock.commands()[..] {
            [Command::LoadSoundBite(sent)] => {
                assert_eq!(sent.samples()[0].intensity, 255);
                assert_eq!(sent.samples()[1].intensity, 0);
                assert_eq!(sent.period(), 4);
            }
            other => panic!("unexpected traffic {other:?}"),
        }
    }

    #[test]
    fn unopenable_device_reports_open_error() {
        let (mut device, mock) = device(0);
        mock.fail_open(1);
        assert!(matches!(device.ping(), Err(TransportError::Open { .. })));
        device.ping().unwrap();
        assert_eq!(mock.commands(), vec![Command::Ping]);
    }
}
