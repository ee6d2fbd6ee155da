/// Disconnection countdown
///
/// The meter refreshes its own "remaining seconds" register less often than
/// we poll, so forwarding it as-is produces a stair-stepped countdown. This
/// state machine extrapolates from the last device value with wall-clock time
/// and snaps down whenever the device reports less than the extrapolation.
///
/// The machine is pure: callers pass `now` in epoch seconds, which keeps the
/// behaviour reproducible in tests.
use serde::Serialize;

/// Normalized "no alarm" event timestamp
pub const NO_ALARM: i64 = -1;

/// Map the raw "no alarm" encodings onto [`NO_ALARM`]
///
/// `65535` is the all-ones pattern of a single word. A real uint32 timestamp
/// can never be that small, but a register configured as uint32 that the
/// meter actually fills with one word would be indistinguishable from it.
pub fn normalize_sentinel(raw: i64) -> i64 {
    match raw {
        -1 | 65_535 | 4_294_967_295 => NO_ALARM,
        value => value,
    }
}

/// Notification produced by one update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CountdownEvent {
    /// Once per alarm episode, on the first counting cycle
    FirstWarning { seconds_remaining: i64 },
    /// Every counting cycle
    Warning { seconds_remaining: i64 },
    /// Once when an episode that produced a warning ends
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CountdownPhase {
    Idle,
    Counting,
}

/// Captured countdown anchor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CountdownState {
    pub countdown_start_time: Option<f64>,
    pub countdown_start_value: Option<i64>,
    pub warning_triggered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DisconnectionCountdown {
    state: CountdownState,
}

impl DisconnectionCountdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CountdownState {
        self.state
    }

    pub fn phase(&self) -> CountdownPhase {
        match (self.state.countdown_start_time, self.state.countdown_start_value) {
            (Some(_), Some(_)) => CountdownPhase::Counting,
            _ => CountdownPhase::Idle,
        }
    }

    /// Forget any running episode without emitting anything
    pub fn reset(&mut self) {
        self.state = CountdownState::default();
    }

    /// Feed the latest alarm register values
    ///
    /// `event_timestamp` is the raw register value; `None` means it has never
    /// been read and leaves the machine untouched. An alarm cannot start
    /// counting until `remaining_seconds` is known.
    pub fn update(&mut self, event_timestamp: Option<i64>, remaining_seconds: Option<i64>, now: f64) -> Vec<CountdownEvent> {
        let Some(raw) = event_timestamp else {
            return Vec::new();
        };
        let remaining = remaining_seconds.filter(|value| *value >= 0);

        if normalize_sentinel(raw) == NO_ALARM {
            return self.clear();
        }

        let mut events = Vec::with_capacity(2);
        match (self.state.countdown_start_time, self.state.countdown_start_value) {
            (Some(start_time), Some(start_value)) => {
                let extrapolated = (start_value as f64 - (now - start_time)).max(0.0);
                if let Some(device) = remaining {
                    if (device as f64) < extrapolated {
                        self.anchor(now, device);
                    }
                }
            }
            _ => {
                let Some(device) = remaining else {
                    return events;
                };
                self.anchor(now, device);
                events.push(CountdownEvent::FirstWarning {
                    seconds_remaining: self.seconds_remaining(now),
                });
            }
        }

        self.state.warning_triggered = true;
        events.push(CountdownEvent::Warning {
            seconds_remaining: self.seconds_remaining(now),
        });
        events
    }

    fn anchor(&mut self, now: f64, value: i64) {
        self.state.countdown_start_time = Some(now);
        self.state.countdown_start_value = Some(value);
    }

    fn seconds_remaining(&self, now: f64) -> i64 {
        match (self.state.countdown_start_time, self.state.countdown_start_value) {
            (Some(start_time), Some(start_value)) => (start_value as f64 - (now - start_time)).floor().max(0.0) as i64,
            _ => 0,
        }
    }

    fn clear(&mut self) -> Vec<CountdownEvent> {
        let warned = self.state.warning_triggered;
        self.state = CountdownState::default();
        if warned {
            vec![CountdownEvent::Stopped]
        } else {
            Vec::new()
        }
    }
}
