//! Jog intent
//!
//! Operator input is reduced to the latest desired motion. There is no
//! queue: a newer submission replaces the older one.

use arc_swap::ArcSwapOption;
use parol_protocol::{
    CartesianAxis, Command, Direction, JOINT_COUNT, JointJog, ReferenceFrame, clamp_speed,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Magnitudes below this are treated as zero.
const DEADBAND: f64 = 1e-6;

/// Jog space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JogMode {
    Joint,
    Cartesian {
        #[serde(default)]
        frame: ReferenceFrame,
    },
}

/// Latest desired motion.
#[derive(Debug, Clone, PartialEq)]
pub struct JogIntent {
    pub mode: JogMode,
    /// Signed percent of max speed per axis (joints J1..J6, or X Y Z RX RY RZ).
    pub axis_values: [f64; JOINT_COUNT],
    pub timestamp: Instant,
    /// Submission order, assigned by [`IntentSlot`].
    pub sequence: u64,
}

impl JogIntent {
    pub fn new(mode: JogMode, axis_values: [f64; JOINT_COUNT]) -> Self {
        Self {
            mode,
            axis_values,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    pub fn joint(axis_values: [f64; JOINT_COUNT]) -> Self {
        Self::new(JogMode::Joint, axis_values)
    }

    pub fn cartesian(frame: ReferenceFrame, axis_values: [f64; JOINT_COUNT]) -> Self {
        Self::new(JogMode::Cartesian { frame }, axis_values)
    }

    /// "No intent": every axis at zero.
    pub fn idle(mode: JogMode) -> Self {
        Self::new(mode, [0.0; JOINT_COUNT])
    }

    pub fn is_idle(&self) -> bool {
        self.axis_values
            .iter()
            .all(|v| !v.is_finite() || v.abs() < DEADBAND)
    }

    /// Jog command for this intent, `None` when idle.
    ///
    /// Cartesian intents jog the dominant axis only; ties go to the first
    /// axis in X Y Z RX RY RZ order.
    pub fn to_command(&self, duration: Duration) -> Option<Command> {
        if self.is_idle() {
            return None;
        }
        match self.mode {
            JogMode::Joint => {
                let jogs: SmallVec<[JointJog; JOINT_COUNT]> = self
                    .axis_values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.is_finite() && v.abs() >= DEADBAND)
                    .map(|(joint, v)| {
                        JointJog::new(joint as u8, Direction::from_sign(*v), clamp_speed(*v))
                    })
                    .collect();
                Command::joint_jog(&jogs, duration)
            },
            JogMode::Cartesian { frame } => {
                let (index, value) = self
                    .axis_values
                    .iter()
                    .copied()
                    .enumerate()
                    .filter(|(_, v)| v.is_finite())
                    .fold((0usize, 0.0f64), |best, (i, v)| {
                        if v.abs() > best.1.abs() { (i, v) } else { best }
                    });
                let axis = CartesianAxis::try_from(index as u8).ok()?;
                Some(Command::CartesianJog {
                    frame,
                    axis,
                    direction: Direction::from_sign(value),
                    speed: clamp_speed(value),
                    duration,
                })
            },
        }
    }
}

/// Last-write-wins intent storage, one slot per jog space.
///
/// Reads are wait-free; when both slots hold an intent the newer one wins.
#[derive(Debug, Default)]
pub struct IntentSlot {
    joint: ArcSwapOption<JogIntent>,
    cartesian: ArcSwapOption<JogIntent>,
    sequence: AtomicU64,
}

impl IntentSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `intent`, stamping its sequence number. Returns the sequence.
    pub fn submit(&self, mut intent: JogIntent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        intent.sequence = sequence;
        let slot = match intent.mode {
            JogMode::Joint => &self.joint,
            JogMode::Cartesian { .. } => &self.cartesian,
        };
        slot.store(Some(Arc::new(intent)));
        sequence
    }

    /// Submit "no intent" in the joint space, which is newer than anything stored.
    pub fn release(&self) -> u64 {
        self.submit(JogIntent::idle(JogMode::Joint))
    }

    pub fn latest(&self) -> Option<Arc<JogIntent>> {
        match (self.joint.load_full(), self.cartesian.load_full()) {
            (Some(j), Some(c)) => Some(if c.sequence > j.sequence { c } else { j }),
            (j, c) => j.or(c),
        }
    }

    pub fn clear(&self) {
        self.joint.store(None);
        self.cartesian.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Duration = Duration::from_millis(100);

    #[test]
    fn test_idle_intent_has_no_command() {
        let intent = JogIntent::joint([0.0; 6]);
        assert!(intent.is_idle());
        assert_eq!(intent.to_command(D), None);
    }

    #[test]
    fn test_single_joint_intent() {
        let intent = JogIntent::joint([0.0, -35.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(intent.to_command(D).unwrap().encode().unwrap(), "JOG|7|35|0.100|NONE");
    }

    #[test]
    fn test_multi_joint_intent() {
        let intent = JogIntent::joint([10.0, 0.0, 0.0, 0.0, 0.0, -150.0]);
        assert_eq!(
            intent.to_command(D).unwrap().encode().unwrap(),
            "MULTIJOG|0,11|10,100|0.100"
        );
    }

    #[test]
    fn test_cartesian_dominant_axis() {
        let intent = JogIntent::cartesian(ReferenceFrame::Tool, [5.0, 0.0, -60.0, 0.0, 0.0, 20.0]);
        assert_eq!(
            intent.to_command(D).unwrap().encode().unwrap(),
            "CARTJOG|TRF|Z-|60|0.100"
        );

        // tie: first axis wins
        let intent = JogIntent::cartesian(ReferenceFrame::World, [0.0, 40.0, 0.0, 40.0, 0.0, 0.0]);
        assert_eq!(
            intent.to_command(D).unwrap().encode().unwrap(),
            "CARTJOG|WRF|Y+|40|0.100"
        );
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let intent = JogIntent::joint([f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(intent.is_idle());
    }

    #[test]
    fn test_slot_last_write_wins() {
        let slot = IntentSlot::new();
        assert!(slot.latest().is_none());

        slot.submit(JogIntent::joint([10.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        slot.submit(JogIntent::joint([20.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(slot.latest().unwrap().axis_values[0], 20.0);
    }

    #[test]
    fn test_slot_most_recent_space_wins() {
        let slot = IntentSlot::new();
        slot.submit(JogIntent::joint([10.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        slot.submit(JogIntent::cartesian(ReferenceFrame::World, [0.0, 0.0, 5.0, 0.0, 0.0, 0.0]));
        assert!(matches!(
            slot.latest().unwrap().mode,
            JogMode::Cartesian { .. }
        ));

        slot.submit(JogIntent::joint([1.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(slot.latest().unwrap().mode, JogMode::Joint);

        slot.release();
        assert!(slot.latest().unwrap().is_idle());
        slot.clear();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn test_jog_mode_serde() {
        let mode: JogMode = serde_json::from_str(r#"{"mode":"cartesian","frame":"tool"}"#).unwrap();
        assert_eq!(
            mode,
            JogMode::Cartesian {
                frame: ReferenceFrame::Tool
            }
        );
        let mode: JogMode = serde_json::from_str(r#"{"mode":"joint"}"#).unwrap();
        assert_eq!(mode, JogMode::Joint);
    }
}
