//! `STATUS` frame payload
//!
//! `STATUS|POSE=<16>|ANGLES=<6>|IO=<5>|GRIPPER=<6>`; every section is
//! optional and unknown sections are ignored.

use crate::command::JOINT_COUNT;
use crate::{FIELD_SEP, ProtocolError, parse_f64_list};

/// Flattened 4x4 homogeneous transform length.
pub const POSE_LEN: usize = 16;
const IO_LEN: usize = 5;
const GRIPPER_LEN: usize = 6;

/// Digital I/O state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IoState {
    pub in1: bool,
    pub in2: bool,
    pub out1: bool,
    pub out2: bool,
    pub estop: bool,
}

/// Electric gripper feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GripperState {
    pub device_id: i32,
    pub position: i32,
    pub speed: i32,
    pub current: i32,
    pub status: i32,
    pub object_detected: i32,
}

/// Decoded telemetry snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Telemetry {
    /// Joint angles in degrees.
    pub joint_angles: Option<[f64; JOINT_COUNT]>,
    /// Flattened end-effector pose (row-major).
    pub pose: Option<[f64; POSE_LEN]>,
    pub io: Option<IoState>,
    pub gripper: Option<GripperState>,
}

impl Telemetry {
    /// Parse the fields following the `STATUS` tag.
    pub fn parse_sections(rest: &str) -> Result<Self, ProtocolError> {
        let mut telemetry = Telemetry::default();
        for section in rest.split(FIELD_SEP).filter(|s| !s.trim().is_empty()) {
            let Some((key, value)) = section.split_once('=') else {
                return Err(ProtocolError::InvalidField {
                    field: "STATUS",
                    reason: format!("section without '=': {section:?}"),
                });
            };
            match key.trim() {
                "ANGLES" => {
                    telemetry.joint_angles = Some(fixed::<JOINT_COUNT>("ANGLES", value)?);
                },
                "POSE" => telemetry.pose = Some(fixed::<POSE_LEN>("POSE", value)?),
                "IO" => {
                    let v = fixed::<IO_LEN>("IO", value)?;
                    telemetry.io = Some(IoState {
                        in1: v[0] != 0.0,
                        in2: v[1] != 0.0,
                        out1: v[2] != 0.0,
                        out2: v[3] != 0.0,
                        estop: v[4] != 0.0,
                    });
                },
                "GRIPPER" => {
                    let v = fixed::<GRIPPER_LEN>("GRIPPER", value)?;
                    telemetry.gripper = Some(GripperState {
                        device_id: v[0] as i32,
                        position: v[1] as i32,
                        speed: v[2] as i32,
                        current: v[3] as i32,
                        status: v[4] as i32,
                        object_detected: v[5] as i32,
                    });
                },
                _ => {},
            }
        }
        Ok(telemetry)
    }

    /// Encode as a full `STATUS` frame.
    pub fn encode(&self) -> String {
        fn csv(values: &[f64]) -> String {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
        fn flag(b: bool) -> f64 {
            if b { 1.0 } else { 0.0 }
        }

        let mut out = String::from("STATUS");
        if let Some(pose) = &self.pose {
            out.push_str(&format!("{FIELD_SEP}POSE={}", csv(pose)));
        }
        if let Some(angles) = &self.joint_angles {
            out.push_str(&format!("{FIELD_SEP}ANGLES={}", csv(angles)));
        }
        if let Some(io) = &self.io {
            let v = [
                flag(io.in1),
                flag(io.in2),
                flag(io.out1),
                flag(io.out2),
                flag(io.estop),
            ];
            out.push_str(&format!("{FIELD_SEP}IO={}", csv(&v)));
        }
        if let Some(g) = &self.gripper {
            let v = [
                g.device_id,
                g.position,
                g.speed,
                g.current,
                g.status,
                g.object_detected,
            ]
            .map(f64::from);
            out.push_str(&format!("{FIELD_SEP}GRIPPER={}", csv(&v)));
        }
        out
    }
}

fn fixed<const N: usize>(field: &'static str, raw: &str) -> Result<[f64; N], ProtocolError> {
    let values = parse_f64_list(field, raw)?;
    let actual = values.len();
    values
        .try_into()
        .map_err(|_| ProtocolError::InvalidLength {
            field,
            expected: N,
            actual,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_status() {
        let pose = (0..16).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let raw = format!(
            "POSE={pose}|ANGLES=1,2,3,4,5,6.5|IO=1,0,0,1,1|GRIPPER=7,120,50,300,1,2"
        );
        let t = Telemetry::parse_sections(&raw).unwrap();
        assert_eq!(t.joint_angles, Some([1.0, 2.0, 3.0, 4.0, 5.0, 6.5]));
        assert_eq!(t.pose.unwrap()[15], 15.0);
        let io = t.io.unwrap();
        assert!(io.in1 && !io.in2 && io.out2 && io.estop);
        assert_eq!(t.gripper.unwrap().position, 120);
    }

    #[test]
    fn test_sections_are_optional() {
        let t = Telemetry::parse_sections("ANGLES=0,0,0,0,0,0|EXTRA=whatever").unwrap();
        assert!(t.joint_angles.is_some());
        assert!(t.pose.is_none() && t.io.is_none() && t.gripper.is_none());

        assert_eq!(Telemetry::parse_sections("").unwrap(), Telemetry::default());
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            Telemetry::parse_sections("ANGLES=1,2,3"),
            Err(ProtocolError::InvalidLength {
                field: "ANGLES",
                expected: 6,
                actual: 3
            })
        ));
        assert!(Telemetry::parse_sections("ANGLES").is_err());
    }

    #[test]
    fn test_encode_then_parse() {
        let t = Telemetry {
            joint_angles: Some([10.0, -20.0, 30.5, 0.0, 1.0, 2.0]),
            pose: None,
            io: Some(IoState {
                estop: true,
                ..IoState::default()
            }),
            gripper: None,
        };
        let frame = t.encode();
        assert!(frame.starts_with("STATUS|ANGLES="));
        let rest = frame.strip_prefix("STATUS|").unwrap();
        assert_eq!(Telemetry::parse_sections(rest).unwrap(), t);
    }
}
