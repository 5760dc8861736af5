//! Task generation: expanding base task templates into concrete tasks.

use rolling_core::domain::{RollType, Segment, TaskDefinition, HANDLER_END_PATH};
use rolling_core::{CoreError, Result};
use serde_json::Value;

/// Expands one task definition into a family of concrete definitions.
pub trait TaskGen: Send + Sync {
    fn generate(&self, task: &TaskDefinition) -> Result<Vec<TaskDefinition>>;
}

/// Apply every generator in turn to all tasks produced so far.
///
/// With generators `g1, g2` each base task becomes `g2(g1(task))`, flattened in
/// order. No generators means the tasks are returned as-is.
pub fn task_generator(tasks: &[TaskDefinition], generators: &[&dyn TaskGen]) -> Result<Vec<TaskDefinition>> {
    let mut current = tasks.to_vec();
    for generator in generators {
        let mut next = Vec::new();
        for task in &current {
            next.extend(generator.generate(task)?);
        }
        current = next;
    }
    Ok(current)
}

/// Rolls the test segment of a task forward in fixed steps.
///
/// The base task's test segment declares the whole span to cover. Each
/// generated task tests on one window of `step_days` (the last one takes the
/// remainder); its other segments move along by the same offset.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingGen {
    pub step_days: u64,
    pub roll_type: RollType,
    pub trunc_days: u64,
    pub test_key: String,
    pub train_key: String,
}

impl RollingGen {
    pub fn new(step_days: u64, roll_type: RollType) -> Self {
        Self {
            step_days,
            roll_type,
            trunc_days: 0,
            test_key: "test".to_string(),
            train_key: "train".to_string(),
        }
    }

    /// Leave a gap of `days` between every non-test segment and its test window.
    pub fn with_trunc_days(mut self, days: u64) -> Self {
        self.trunc_days = days;
        self
    }

    pub fn with_keys(mut self, train_key: impl Into<String>, test_key: impl Into<String>) -> Self {
        self.train_key = train_key.into();
        self.test_key = test_key.into();
        self
    }

    /// Test windows covering `span`, contiguous and in order.
    pub fn windows(&self, span: Segment) -> Result<Vec<Segment>> {
        if self.step_days == 0 {
            return Err(CoreError::Validation("rolling step must be at least one day".to_string()));
        }

        let mut windows = Vec::new();
        let mut start = span.start;
        loop {
            let end = start
                .checked_add_days(chrono::Days::new(self.step_days - 1))
                .map_or(span.end, |end| end.min(span.end));
            windows.push(Segment::new(start, end)?);
            if end >= span.end {
                break;
            }
            start = end
                .succ_opt()
                .ok_or_else(|| CoreError::Validation(format!("date overflow after {}", end)))?;
        }
        Ok(windows)
    }

    fn roll_segment(&self, name: &str, base: Segment, offset: u64) -> Result<Segment> {
        let moved = match self.roll_type {
            RollType::Expanding if name == self.train_key => base.extend(offset)?,
            _ => base.shift(offset)?,
        };
        Ok(moved.truncate(self.trunc_days))
    }
}

impl TaskGen for RollingGen {
    fn generate(&self, task: &TaskDefinition) -> Result<Vec<TaskDefinition>> {
        let span = task.segment(&self.test_key)?.ok_or_else(|| {
            CoreError::Validation(format!("task has no '{}' segment to roll", self.test_key))
        })?;

        let mut others = Vec::new();
        for name in task.segment_names() {
            if name == self.test_key {
                continue;
            }
            if let Some(segment) = task.segment(&name)? {
                others.push((name, segment));
            }
        }

        let windows = self.windows(span)?;
        let mut tasks = Vec::with_capacity(windows.len());
        for window in windows {
            let offset = (window.start - span.start).num_days() as u64;
            let mut rolled = task.clone();

            for (name, base) in &others {
                rolled.set_segment(name, self.roll_segment(name, *base, offset)?)?;
            }
            rolled.set_segment(&self.test_key, window)?;
            extend_handler_end(&mut rolled, window)?;

            tasks.push(rolled);
        }

        tracing::debug!(
            "Generated {} rolling tasks ({} roll, step {} days)",
            tasks.len(),
            self.roll_type,
            self.step_days
        );
        Ok(tasks)
    }
}

/// The data handler must load data up to the end of the test window.
fn extend_handler_end(task: &mut TaskDefinition, window: Segment) -> Result<()> {
    let current = match task.lookup(HANDLER_END_PATH) {
        Some(Value::String(s)) => s.clone(),
        _ => return Ok(()),
    };
    let end = window.end.format("%Y-%m-%d").to_string();
    // ISO dates order lexicographically
    if current.as_str() < end.as_str() {
        task.set(HANDLER_END_PATH, Value::String(end))?;
    }
    Ok(())
}
