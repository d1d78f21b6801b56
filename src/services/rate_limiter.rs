use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-(session, student) gate in front of the evaluator. A new call is
/// refused while the previous accepted call is younger than the minimum
/// interval; idle slots self-expire after the retention window.
pub struct EvaluationGate {
    slots: Mutex<HashMap<(String, String), Instant>>,
    min_interval: Duration,
    retention: Duration,
}

impl EvaluationGate {
    pub fn new(min_interval: Duration, retention: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            min_interval,
            retention,
        }
    }

    /// True when the caller may invoke the evaluator for this student
    /// now. Accepting a call stamps the slot.
    pub fn try_acquire(&self, session_code: &str, student_name: &str) -> bool {
        self.try_acquire_at(session_code, student_name, Instant::now())
    }

    fn try_acquire_at(&self, session_code: &str, student_name: &str, now: Instant) -> bool {
        let mut slots = self.slots.lock().expect("evaluation gate lock");
        slots.retain(|_, last| now.duration_since(*last) < self.retention);

        let key = (session_code.to_string(), student_name.to_string());
        if let Some(last) = slots.get(&key) {
            if now.duration_since(*last) < self.min_interval {
                return false;
            }
        }
        slots.insert(key, now);
        true
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().expect("evaluation gate lock").len()
    }
}
