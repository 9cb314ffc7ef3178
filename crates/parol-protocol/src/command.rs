//! Fire-and-forget commands
//!
//! Jog commands carry a duration: the controller's watchdog decays motion
//! to zero once it elapses without a fresh command.

use crate::{FIELD_SEP, LIST_SEP, ProtocolError};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use std::fmt::Write as _;
use std::time::Duration;

/// Number of arm joints.
pub const JOINT_COUNT: usize = 6;

/// Speed range accepted by the controller (percent of max speed).
pub const MIN_SPEED_PERCENT: u8 = 1;
pub const MAX_SPEED_PERCENT: u8 = 100;

/// Motion direction along a joint or Cartesian axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn from_sign(value: f64) -> Self {
        if value < 0.0 {
            Self::Negative
        } else {
            Self::Positive
        }
    }

    fn suffix(self) -> char {
        match self {
            Self::Positive => '+',
            Self::Negative => '-',
        }
    }
}

/// Cartesian jog reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ReferenceFrame {
    /// Tool reference frame (`TRF`).
    Tool,
    /// World reference frame (`WRF`).
    #[default]
    World,
}

impl ReferenceFrame {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Tool => "TRF",
            Self::World => "WRF",
        }
    }

    fn from_wire(raw: &str) -> Result<Self, ProtocolError> {
        match raw {
            "TRF" => Ok(Self::Tool),
            "WRF" => Ok(Self::World),
            other => Err(ProtocolError::InvalidField {
                field: "frame",
                reason: format!("unknown frame {other:?}"),
            }),
        }
    }
}

/// Cartesian jog axis, in the controller's axis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CartesianAxis {
    X = 0,
    Y = 1,
    Z = 2,
    Rx = 3,
    Ry = 4,
    Rz = 5,
}

impl CartesianAxis {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::Z => "Z",
            Self::Rx => "RX",
            Self::Ry => "RY",
            Self::Rz => "RZ",
        }
    }

    fn from_wire(raw: &str) -> Result<(Self, Direction), ProtocolError> {
        let invalid = || ProtocolError::InvalidField {
            field: "axis",
            reason: format!("unknown axis {raw:?}"),
        };
        let (name, direction) = match raw.as_bytes().last() {
            Some(b'+') => (&raw[..raw.len() - 1], Direction::Positive),
            Some(b'-') => (&raw[..raw.len() - 1], Direction::Negative),
            _ => return Err(invalid()),
        };
        let axis = match name {
            "X" => Self::X,
            "Y" => Self::Y,
            "Z" => Self::Z,
            "RX" => Self::Rx,
            "RY" => Self::Ry,
            "RZ" => Self::Rz,
            _ => return Err(invalid()),
        };
        Ok((axis, direction))
    }
}

/// Clamp a signed percentage to the controller's speed range.
///
/// Non-finite input maps to the minimum speed.
pub fn clamp_speed(percent: f64) -> u8 {
    if !percent.is_finite() {
        return MIN_SPEED_PERCENT;
    }
    percent
        .abs()
        .round()
        .clamp(MIN_SPEED_PERCENT as f64, MAX_SPEED_PERCENT as f64) as u8
}

/// One joint entry of a jog command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointJog {
    /// Joint index, `0..JOINT_COUNT`.
    pub joint: u8,
    pub direction: Direction,
    /// Percent of max speed, `1..=100`.
    pub speed: u8,
}

impl JointJog {
    pub fn new(joint: u8, direction: Direction, speed: u8) -> Self {
        Self {
            joint,
            direction,
            speed,
        }
    }

    /// Wire index: `j` for positive, `j + 6` for negative direction.
    pub fn wire_index(&self) -> u8 {
        match self.direction {
            Direction::Positive => self.joint,
            Direction::Negative => self.joint + JOINT_COUNT as u8,
        }
    }

    fn from_wire_index(index: u8, speed: u8) -> Result<Self, ProtocolError> {
        let count = JOINT_COUNT as u8;
        match index {
            i if i < count => Ok(Self::new(i, Direction::Positive, speed)),
            i if i < 2 * count => Ok(Self::new(i - count, Direction::Negative, speed)),
            i => Err(ProtocolError::InvalidField {
                field: "joint",
                reason: format!("index {i} out of range"),
            }),
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.joint as usize >= JOINT_COUNT {
            return Err(ProtocolError::InvalidCommand(format!(
                "joint {} out of range",
                self.joint
            )));
        }
        validate_speed(self.speed)
    }
}

fn validate_speed(speed: u8) -> Result<(), ProtocolError> {
    if !(MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT).contains(&speed) {
        return Err(ProtocolError::InvalidCommand(format!(
            "speed {speed} outside {MIN_SPEED_PERCENT}..={MAX_SPEED_PERCENT}"
        )));
    }
    Ok(())
}

/// Commands sent without waiting for a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `JOG|index|speed|duration|NONE`
    Jog { jog: JointJog, duration: Duration },
    /// `MULTIJOG|indices|speeds|duration`
    MultiJog {
        jogs: SmallVec<[JointJog; JOINT_COUNT]>,
        duration: Duration,
    },
    /// `CARTJOG|frame|axis|speed|duration`
    CartesianJog {
        frame: ReferenceFrame,
        axis: CartesianAxis,
        direction: Direction,
        speed: u8,
        duration: Duration,
    },
    Stop,
    Enable,
    Disable,
    Home,
    ClearError,
    /// `SET_PORT|port`
    SetPort(String),
}

impl Command {
    /// Build the jog command for a set of joint entries.
    ///
    /// A single entry uses `JOG`, several use `MULTIJOG`. Returns `None`
    /// when there is nothing to jog.
    pub fn joint_jog(jogs: &[JointJog], duration: Duration) -> Option<Self> {
        match jogs {
            [] => None,
            [jog] => Some(Self::Jog {
                jog: *jog,
                duration,
            }),
            many => Some(Self::MultiJog {
                jogs: many.iter().copied().collect(),
                duration,
            }),
        }
    }

    /// Message tag (first field on the wire).
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Jog { .. } => "JOG",
            Self::MultiJog { .. } => "MULTIJOG",
            Self::CartesianJog { .. } => "CARTJOG",
            Self::Stop => "STOP",
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
            Self::Home => "HOME",
            Self::ClearError => "CLEAR_ERROR",
            Self::SetPort(_) => "SET_PORT",
        }
    }

    /// Whether this command produces motion from operator input.
    pub fn is_jog(&self) -> bool {
        matches!(
            self,
            Self::Jog { .. } | Self::MultiJog { .. } | Self::CartesianJog { .. }
        )
    }

    /// Encode to the wire string.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut out = String::from(self.tag());
        match self {
            Self::Jog { jog, duration } => {
                jog.validate()?;
                let _ = write!(
                    out,
                    "{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{:.3}{FIELD_SEP}NONE",
                    jog.wire_index(),
                    jog.speed,
                    duration.as_secs_f64()
                );
            },
            Self::MultiJog { jogs, duration } => {
                if jogs.is_empty() {
                    return Err(ProtocolError::InvalidCommand(
                        "MULTIJOG without joints".to_string(),
                    ));
                }
                for jog in jogs {
                    jog.validate()?;
                }
                let indices = join_list(jogs.iter().map(|j| j.wire_index()));
                let speeds = join_list(jogs.iter().map(|j| j.speed));
                let _ = write!(
                    out,
                    "{FIELD_SEP}{indices}{FIELD_SEP}{speeds}{FIELD_SEP}{:.3}",
                    duration.as_secs_f64()
                );
            },
            Self::CartesianJog {
                frame,
                axis,
                direction,
                speed,
                duration,
            } => {
                validate_speed(*speed)?;
                let _ = write!(
                    out,
                    "{FIELD_SEP}{}{FIELD_SEP}{}{}{FIELD_SEP}{}{FIELD_SEP}{:.3}",
                    frame.wire_name(),
                    axis.wire_name(),
                    direction.suffix(),
                    speed,
                    duration.as_secs_f64()
                );
            },
            Self::SetPort(port) => {
                if port.is_empty() || port.contains(FIELD_SEP) {
                    return Err(ProtocolError::InvalidCommand(format!(
                        "invalid serial port {port:?}"
                    )));
                }
                out.push(FIELD_SEP);
                out.push_str(port);
            },
            Self::Stop | Self::Enable | Self::Disable | Self::Home | Self::ClearError => {},
        }
        Ok(out)
    }

    /// Decode a wire string (used by recording transports and fake controllers).
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let fields: Vec<&str> = raw.split(FIELD_SEP).collect();
        let arity = |n: usize| -> Result<(), ProtocolError> {
            if fields.len() == n {
                Ok(())
            } else {
                Err(ProtocolError::InvalidLength {
                    field: "command",
                    expected: n,
                    actual: fields.len(),
                })
            }
        };
        match fields[0] {
            "JOG" => {
                arity(5)?;
                let index = parse_u8("joint", fields[1])?;
                let speed = parse_u8("speed", fields[2])?;
                Ok(Self::Jog {
                    jog: JointJog::from_wire_index(index, speed)?,
                    duration: parse_duration(fields[3])?,
                })
            },
            "MULTIJOG" => {
                arity(4)?;
                let indices: Vec<&str> = fields[1].split(LIST_SEP).collect();
                let speeds: Vec<&str> = fields[2].split(LIST_SEP).collect();
                if indices.len() != speeds.len() {
                    return Err(ProtocolError::InvalidLength {
                        field: "speeds",
                        expected: indices.len(),
                        actual: speeds.len(),
                    });
                }
                let jogs = indices
                    .iter()
                    .zip(&speeds)
                    .map(|(i, s)| {
                        JointJog::from_wire_index(parse_u8("joint", i)?, parse_u8("speed", s)?)
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Self::MultiJog {
                    jogs,
                    duration: parse_duration(fields[3])?,
                })
            },
            "CARTJOG" => {
                arity(5)?;
                let (axis, direction) = CartesianAxis::from_wire(fields[2])?;
                Ok(Self::CartesianJog {
                    frame: ReferenceFrame::from_wire(fields[1])?,
                    axis,
                    direction,
                    speed: parse_u8("speed", fields[3])?,
                    duration: parse_duration(fields[4])?,
                })
            },
            "SET_PORT" => {
                arity(2)?;
                Ok(Self::SetPort(fields[1].to_string()))
            },
            "STOP" => Ok(Self::Stop),
            "ENABLE" => Ok(Self::Enable),
            "DISABLE" => Ok(Self::Disable),
            "HOME" => Ok(Self::Home),
            "CLEAR_ERROR" => Ok(Self::ClearError),
            other => Err(ProtocolError::UnknownTag {
                tag: other.to_string(),
            }),
        }
    }
}

fn join_list<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let mut out = String::new();
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(LIST_SEP);
        }
        let _ = write!(out, "{item}");
    }
    out
}

fn parse_u8(field: &'static str, raw: &str) -> Result<u8, ProtocolError> {
    raw.trim()
        .parse::<u8>()
        .map_err(|e| ProtocolError::InvalidField {
            field,
            reason: format!("{raw:?}: {e}"),
        })
}

fn parse_duration(raw: &str) -> Result<Duration, ProtocolError> {
    let secs = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| ProtocolError::InvalidField {
            field: "duration",
            reason: format!("{raw:?}: {e}"),
        })?;
    Duration::try_from_secs_f64(secs).map_err(|e| ProtocolError::InvalidField {
        field: "duration",
        reason: e.to_string(),
    })
}
