use crate::config::{ActionTable, ChannelBinding};
use crate::types::{Action, ChannelId, Event, SensorId};

/// Per-channel state that survives across windows. Owned by one worker.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    /// Window means of the auxiliary sensors, refreshed every window
    pub aux_means: Vec<(SensorId, f64)>,
    /// Timestamp of the last action actually forwarded to the sink
    pub last_forwarded: Option<f64>,
    /// Decision of the most recent window, forwarded or not
    pub current_action: Option<Action>,
    pub windows: u64,
    pub forwarded: u64,
    pub suppressed: u64,
}

impl ChannelState {
    pub fn aux_mean(&self, sensor: SensorId) -> Option<f64> {
        self.aux_means
            .iter()
            .find(|(s, _)| *s == sensor)
            .map(|(_, m)| *m)
    }
}

/// Result of mapping one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// What the ladder chose, before debounce
    pub decided: Action,
    /// What goes to the sink: `decided`, or `Neutral` when suppressed
    pub output: Action,
}

impl Decision {
    pub fn forwarded(&self) -> bool {
        !self.output.is_neutral()
    }
}

/// The per-window decision ladder for one channel, plus its cooldown.
///
/// 1. Peaks on a primary channel whose gate sensor is below threshold → the channel's action.
/// 2. Else, if this channel evaluates sensor rules, the first sensor (table order)
///    whose mean exceeds its threshold → that sensor's action.
/// 3. Else `Neutral`.
///
/// A non-neutral decision reaches the sink only if `cooldown` seconds have
/// passed since the channel's last forwarded action.
pub struct ActionMapper {
    binding: ChannelBinding,
    table: ActionTable,
    cooldown: f64,
}

impl ActionMapper {
    pub fn new(channel: ChannelId, table: &ActionTable, cooldown: f64) -> Option<Self> {
        let binding = table.channel(channel)?.clone();
        Some(Self {
            binding,
            table: table.clone(),
            cooldown,
        })
    }

    /// Auxiliary sensors this channel needs means for.
    pub fn aux_sensors(&self) -> Vec<SensorId> {
        let mut sensors: Vec<SensorId> = Vec::new();
        if let Some(gate) = self.binding.gate {
            sensors.push(gate);
        }
        if self.binding.sensor_rules {
            for s in &self.table.sensors {
                if !sensors.contains(&s.sensor) {
                    sensors.push(s.sensor);
                }
            }
        }
        sensors
    }

    /// The ladder alone, without debounce.
    pub fn decide(&self, events: &[Event], aux_means: &[(SensorId, f64)]) -> Action {
        let mean = |id: SensorId| aux_means.iter().find(|(s, _)| *s == id).map(|(_, m)| *m);

        if self.binding.primary && !events.is_empty() {
            let gate_open = match self.binding.gate {
                // No readings yet counts as "not bent".
                Some(gate) => match (mean(gate), self.table.sensor(gate)) {
                    (Some(m), Some(sensor)) => m < sensor.threshold,
                    _ => true,
                },
                None => true,
            };
            if gate_open {
                return self.binding.action;
            }
        }

        if self.binding.sensor_rules {
            for sensor in &self.table.sensors {
                if let Some(m) = mean(sensor.sensor) {
                    if m > sensor.threshold {
                        return sensor.action;
                    }
                }
            }
        }

        Action::Neutral
    }

    /// Decide, apply the cooldown, and update `state`. `now` is the window's end time.
    pub fn map(&self, events: &[Event], state: &mut ChannelState, aux_means: Vec<(SensorId, f64)>, now: f64) -> Decision {
        let decided = self.decide(events, &aux_means);
        state.aux_means = aux_means;
        state.current_action = Some(decided);
        state.windows += 1;

        if decided.is_neutral() {
            return Decision {
                decided,
                output: Action::Neutral,
            };
        }

        let cooled = match state.last_forwarded {
            Some(last) => now - last >= self.cooldown,
            None => true,
        };
        if cooled {
            state.last_forwarded = Some(now);
            state.forwarded += 1;
            Decision {
                decided,
                output: decided,
            }
        } else {
            state.suppressed += 1;
            Decision {
                decided,
                output: Action::Neutral,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorBinding;

    fn event(i: usize) -> Event {
        Event {
            index_in_window: i,
            timestamp: 0.0,
            amplitude: 2.0,
            prominence: 2.0,
            width: 10.0,
        }
    }

    fn mapper(channel: ChannelId) -> ActionMapper {
        ActionMapper::new(channel, &ActionTable::default(), 0.3).unwrap()
    }

    #[test]
    fn test_primary_peak_with_gate_open() {
        let m = mapper(0);
        assert_eq!(m.decide(&[event(50)], &[(3, 0.05)]), Action::TurnLeft);
    }

    #[test]
    fn test_primary_beats_sensors() {
        // Gate sensor 3 is below threshold, but sensors 4 and 5 are both above theirs.
        let m = mapper(0);
        let action = m.decide(&[event(50)], &[(3, 0.0), (4, 0.9), (5, 0.9)]);
        assert_eq!(action, Action::TurnLeft);
    }

    #[test]
    fn test_closed_gate_falls_through_to_sensor() {
        // Sensor 3 is both the gate and the top-priority sensor.
        let m = mapper(0);
        assert_eq!(m.decide(&[event(50)], &[(3, 0.5)]), Action::Jump);
    }

    #[test]
    fn test_sensor_priority_order() {
        let m = mapper(0);
        assert_eq!(m.decide(&[], &[(4, 0.5), (5, 0.5)]), Action::MoveForward);
        assert_eq!(m.decide(&[], &[(5, 0.5)]), Action::MoveBack);
    }

    #[test]
    fn test_threshold_is_strict() {
        let m = mapper(0);
        assert_eq!(m.decide(&[], &[(4, 0.1)]), Action::Neutral);
    }

    #[test]
    fn test_channel_without_sensor_rules() {
        let m = mapper(1);
        assert_eq!(m.decide(&[], &[(4, 0.9)]), Action::Neutral);
        assert_eq!(m.decide(&[event(10)], &[(3, 0.0)]), Action::TurnRight);
        assert_eq!(m.aux_sensors(), vec![3]);
    }

    #[test]
    fn test_non_primary_channel_ignores_peaks() {
        let mut table = ActionTable::default();
        table.channels[0].primary = false;
        let m = ActionMapper::new(0, &table, 0.3).unwrap();
        assert_eq!(m.decide(&[event(50)], &[]), Action::Neutral);
    }

    #[test]
    fn test_missing_gate_reading_counts_as_open() {
        let m = mapper(0);
        assert_eq!(m.decide(&[event(50)], &[]), Action::TurnLeft);
    }

    #[test]
    fn test_nothing_is_neutral() {
        let m = mapper(0);
        let mut state = ChannelState::default();
        let d = m.map(&[], &mut state, vec![], 1.0);
        assert_eq!(d.output, Action::Neutral);
        assert!(!d.forwarded());
        assert_eq!(state.current_action, Some(Action::Neutral));
    }

    #[test]
    fn test_debounce_suppresses_repeat() {
        let m = mapper(0);
        let mut state = ChannelState::default();
        let first = m.map(&[event(50)], &mut state, vec![(3, 0.0)], 0.2);
        let second = m.map(&[event(50)], &mut state, vec![(3, 0.0)], 0.4);
        assert_eq!(first.output, Action::TurnLeft);
        assert_eq!(second.decided, Action::TurnLeft);
        assert_eq!(second.output, Action::Neutral);
        assert_eq!(state.forwarded, 1);
        assert_eq!(state.suppressed, 1);
        assert_eq!(state.last_forwarded, Some(0.2));
        assert_eq!(state.current_action, Some(Action::TurnLeft));

        // Cooldown measured from the last forwarded action
        let third = m.map(&[event(50)], &mut state, vec![(3, 0.0)], 0.5);
        assert_eq!(third.output, Action::TurnLeft);
    }

    #[test]
    fn test_debounce_applies_across_actions() {
        let m = mapper(0);
        let mut state = ChannelState::default();
        m.map(&[event(50)], &mut state, vec![(3, 0.0)], 1.0);
        let d = m.map(&[], &mut state, vec![(4, 0.9)], 1.1);
        assert_eq!(d.decided, Action::MoveForward);
        assert_eq!(d.output, Action::Neutral);
    }

    #[test]
    fn test_unknown_channel() {
        assert!(ActionMapper::new(7, &ActionTable::default(), 0.3).is_none());
    }

    #[test]
    fn test_custom_table_priority() {
        let table = ActionTable {
            channels: vec![ChannelBinding {
                channel: 2,
                name: String::new(),
                action: Action::Jump,
                primary: true,
                gate: None,
                sensor_rules: true,
                scale: 1000.0,
            }],
            sensors: vec![
                SensorBinding {
                    sensor: 6,
                    name: String::new(),
                    threshold: 0.5,
                    action: Action::MoveBack,
                    scale: 1.0,
                },
                SensorBinding {
                    sensor: 7,
                    name: String::new(),
                    threshold: 0.2,
                    action: Action::MoveForward,
                    scale: 1.0,
                },
            ],
        };
        let m = ActionMapper::new(2, &table, 0.3).unwrap();
        assert_eq!(m.decide(&[], &[(6, 0.6), (7, 0.6)]), Action::MoveBack);
        assert_eq!(m.decide(&[], &[(6, 0.4), (7, 0.6)]), Action::MoveForward);
        assert_eq!(m.decide(&[event(1)], &[(6, 0.9)]), Action::Jump);
    }
}
