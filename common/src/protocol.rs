use crate::identity::DeviceIdentity;
use crate::types::{SensorSpeed, SensorType};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Representation of all commands that can be exchanged over a command channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Command {
    /// First command of every session, sent by the client
    ConnectionRequest { identity: DeviceIdentity },
    /// Sent by the server once the client was accepted, carries the ports of the session
    ConnectionAccepted { session: DeviceIdentity },
    /// Replaces the set of sensors the client must stream
    SetSensorList { required: BTreeSet<SensorType> },
    /// Changes how often the client samples a sensor
    SetSensorSpeed { sensor_type: SensorType, speed: SensorSpeed },
    /// The user changed the sensitivity of a sensor, `value` is between 0 and 100
    ChangeSensorSensitivity { sensor_type: SensorType, value: u8 },
    /// The client reports the maximum range of one of its sensors
    SensorRangeNotification { sensor_type: SensorType, range: f32 },
    /// A button on the client was pressed or released
    ButtonClick { id: i32, is_hold: bool },
    /// Replaces the client's button layout with a layout definition
    UpdateButtonLayout { definition: String },
    /// Replaces the client's buttons with a `id -> label` mapping
    UpdateButtonsMap { mapping: BTreeMap<i32, String> },
    /// Shows a notification on the client
    DisplayNotification {
        id: i32,
        title: String,
        content: String,
    },
    /// Keep alive request, answered by sending it back with `answerer` set
    ConnectionAliveCheck {
        requester: DeviceIdentity,
        answerer: Option<DeviceIdentity>,
    },
    /// The user requested the controlled object to be reset
    ResetToCenter,
    /// The sender is closing the session
    EndConnection,
}

impl Command {
    /// Short name of the command, used for logging
    pub fn tag(&self) -> &'static str {
        match self {
            Command::ConnectionRequest { .. } => "ConnectionRequest",
            Command::ConnectionAccepted { .. } => "ConnectionAccepted",
            Command::SetSensorList { .. } => "SetSensorList",
            Command::SetSensorSpeed { .. } => "SetSensorSpeed",
            Command::ChangeSensorSensitivity { .. } => "ChangeSensorSensitivity",
            Command::SensorRangeNotification { .. } => "SensorRangeNotification",
            Command::ButtonClick { .. } => "ButtonClick",
            Command::UpdateButtonLayout { .. } => "UpdateButtonLayout",
            Command::UpdateButtonsMap { .. } => "UpdateButtonsMap",
            Command::DisplayNotification { .. } => "DisplayNotification",
            Command::ConnectionAliveCheck { .. } => "ConnectionAliveCheck",
            Command::ResetToCenter => "ResetToCenter",
            Command::EndConnection => "EndConnection",
        }
    }

    /// Builds the answer to a keep alive request, `None` if this is not an unanswered request
    pub fn answer_alive_check(&self, answerer: &DeviceIdentity) -> Option<Command> {
        match self {
            Command::ConnectionAliveCheck {
                requester,
                answerer: None,
            } => Some(Command::ConnectionAliveCheck {
                requester: requester.clone(),
                answerer: Some(answerer.clone()),
            }),
            _ => None,
        }
    }
}

impl TryInto<Vec<u8>> for &Command {
    type Error = anyhow::Error;

    fn try_into(self) -> Result<Vec<u8>, Self::Error> {
        bincode::serialize(self).context("Encode command")
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        bincode::deserialize(bytes).context("Decode command")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_check_answer_keeps_requester() {
        let server = DeviceIdentity::with_ports("server1", 9000, 9001);
        let phone = DeviceIdentity::new("phone1");

        let request = Command::ConnectionAliveCheck {
            requester: server.clone(),
            answerer: None,
        };
        let answer = request.answer_alive_check(&phone).unwrap();

        assert_eq!(
            answer,
            Command::ConnectionAliveCheck {
                requester: server,
                answerer: Some(phone.clone()),
            }
        );
        assert_eq!(answer.answer_alive_check(&phone), None);
    }

    #[test]
    fn only_alive_checks_are_answered() {
        let phone = DeviceIdentity::new("phone1");

        assert_eq!(Command::ResetToCenter.answer_alive_check(&phone), None);
    }

    #[test]
    fn sensor_list_survives_encoding() {
        let command = Command::SetSensorList {
            required: [SensorType::Gyroscope, SensorType::Accelerometer].into(),
        };

        let bytes: Vec<u8> = (&command).try_into().unwrap();
        let decoded = Command::try_from(&bytes[..]).unwrap();

        assert_eq!(command, decoded);
        assert_eq!(decoded.tag(), "SetSensorList");
    }

    #[test]
    fn garbage_is_not_a_command() {
        assert!(Command::try_from(&[0xff, 0xff, 0xff, 0xff, 0x01][..]).is_err());
    }
}
