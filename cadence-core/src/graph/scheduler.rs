//! Node Scheduler
//!
//! Nodes declared with `uses_scheduler` can ask to be evaluated at future
//! times, independently of their inputs ticking. Each request is an event
//! `(time, tag)`; a tagged event replaces any earlier event with the same tag.
//!
//! # Algorithm
//!
//! 1. `schedule(when, tag)` stores the event if `when` is after the current
//!    evaluation time, and if it became the earliest pending event the
//!    owning graph is told to wake the node at that time.
//! 2. When the node evaluates at a scheduled time, `advance` drops every
//!    event at or before that time and re-schedules the node for the next
//!    one.
//! 3. In real-time runs an event can instead be placed on the wall clock as
//!    an alarm. When the alarm fires it is turned into an ordinary event at
//!    the alarm's evaluation time.

use std::collections::{BTreeSet, HashMap};

use super::NodeRef;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::time::{EngineTime, MIN_DT};

/// Pending wake-ups of one node.
#[derive(Debug, Clone, Default)]
pub struct NodeScheduler {
    /// Ordered by time; untagged events use the empty tag.
    events: BTreeSet<(EngineTime, String)>,
    tags: HashMap<String, EngineTime>,
    alarm_tags: HashMap<String, EngineTime>,
}

impl NodeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The earliest pending event, or `MIN_DT` if none.
    pub fn next_scheduled_time(&self) -> EngineTime {
        self.events.first().map_or(MIN_DT, |(t, _)| *t)
    }

    pub fn requires_scheduling(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn is_scheduled(&self) -> bool {
        !self.events.is_empty() || !self.alarm_tags.is_empty()
    }

    pub fn is_scheduled_now(&self, now: EngineTime) -> bool {
        self.events.first().is_some_and(|(t, _)| *t == now)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    pub fn tag_time(&self, tag: &str) -> Option<EngineTime> {
        self.tags.get(tag).copied()
    }

    pub fn has_alarm(&self, tag: &str) -> bool {
        self.alarm_tags.contains_key(tag)
    }

    /// Remove a tagged event, returning when it was due.
    pub fn pop_tag(&mut self, tag: &str) -> Option<EngineTime> {
        let when = self.tags.remove(tag)?;
        self.events.remove(&(when, tag.to_string()));
        Some(when)
    }

    /// Store an event. Returns the time the node must now be woken at, if
    /// the earliest pending event moved earlier.
    pub(crate) fn insert(&mut self, when: EngineTime, tag: Option<&str>, now: EngineTime) -> Option<EngineTime> {
        if let Some(tag) = tag {
            self.pop_tag(tag);
        }
        if when <= now {
            return None;
        }
        let current_first = self.events.first().map(|(t, _)| *t);
        let tag = tag.unwrap_or_default().to_string();
        if !tag.is_empty() {
            self.tags.insert(tag.clone(), when);
        }
        self.events.insert((when, tag));
        match current_first {
            Some(first) if first <= when => None,
            _ => Some(when),
        }
    }

    /// Drop events at or before `now`; returns the next pending time.
    pub(crate) fn advance(&mut self, now: EngineTime) -> Option<EngineTime> {
        while let Some((when, tag)) = self.events.first().cloned() {
            if when > now {
                return Some(when);
            }
            self.events.pop_first();
            if self.tags.get(&tag) == Some(&when) {
                self.tags.remove(&tag);
            }
        }
        None
    }

    pub(crate) fn add_alarm_tag(&mut self, tag: &str, when: EngineTime) {
        self.alarm_tags.insert(tag.to_string(), when);
    }

    pub(crate) fn remove_alarm_tag(&mut self, tag: &str) -> Option<EngineTime> {
        self.alarm_tags.remove(tag)
    }

    pub(crate) fn alarm_tags(&self) -> Vec<String> {
        self.alarm_tags.keys().cloned().collect()
    }

    pub fn reset(&mut self) {
        self.events.clear();
        self.tags.clear();
        self.alarm_tags.clear();
    }
}

/// Mutable access to one node's scheduler during its evaluation.
pub struct SchedulerHandle<'a> {
    rt: &'a mut Runtime,
    node: NodeRef,
}

impl<'a> SchedulerHandle<'a> {
    pub(crate) fn new(rt: &'a mut Runtime, node: NodeRef) -> Self {
        Self { rt, node }
    }

    /// Evaluate the node at `when`.
    pub fn schedule(&mut self, when: EngineTime, tag: Option<&str>) -> Result<()> {
        self.rt.schedule_node_event(self.node, when, tag)
    }

    /// Evaluate the node after `delay`.
    pub fn schedule_in(&mut self, delay: crate::time::EngineTimeDelta, tag: Option<&str>) -> Result<()> {
        let when = self.rt.evaluation_time() + delay;
        self.schedule(when, tag)
    }

    /// Evaluate the node when the wall clock reaches `when` (real-time only).
    pub fn schedule_alarm(&mut self, when: EngineTime, tag: &str) -> Result<()> {
        self.rt.schedule_node_alarm(self.node, when, tag)
    }

    pub fn un_schedule(&mut self, tag: &str) -> Result<()> {
        self.rt.un_schedule_node_event(self.node, tag)
    }

    pub fn pop_tag(&mut self, tag: &str) -> Result<Option<EngineTime>> {
        Ok(self.rt.node_record_mut(self.node)?.scheduler.pop_tag(tag))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.rt
            .node_record(self.node)
            .is_ok_and(|n| n.scheduler.has_tag(tag))
    }

    pub fn is_scheduled_now(&self) -> bool {
        let now = self.rt.evaluation_time();
        self.rt
            .node_record(self.node)
            .is_ok_and(|n| n.scheduler.is_scheduled_now(now))
    }

    pub fn next_scheduled_time(&self) -> EngineTime {
        self.rt
            .node_record(self.node)
            .map_or(MIN_DT, |n| n.scheduler.next_scheduled_time())
    }
}

impl Runtime {
    pub(crate) fn schedule_node_event(&mut self, node: NodeRef, when: EngineTime, tag: Option<&str>) -> Result<()> {
        let running = self.node_is_running(node);
        let now = if running { self.evaluation_time() } else { MIN_DT };
        let wake = self.node_record_mut(node)?.scheduler.insert(when, tag, now);
        match wake {
            Some(when) if running => self.schedule_node(node, when),
            _ => Ok(()),
        }
    }

    pub(crate) fn un_schedule_node_event(&mut self, node: NodeRef, tag: &str) -> Result<()> {
        let record = self.node_record_mut(node)?;
        record.scheduler.pop_tag(tag);
        if record.scheduler.remove_alarm_tag(tag).is_some() {
            let name = self.alarm_name(node, tag)?;
            self.clock_mut().cancel_alarm(&name);
        }
        Ok(())
    }

    /// Called after a scheduled evaluation: consume due events, wake for the next.
    pub(crate) fn advance_node_scheduler(&mut self, node: NodeRef) -> Result<()> {
        let now = self.evaluation_time();
        if let Some(next) = self.node_record_mut(node)?.scheduler.advance(now) {
            self.schedule_node(node, next)?;
        }
        Ok(())
    }

    fn alarm_name(&self, node: NodeRef, tag: &str) -> Result<String> {
        Ok(format!("{}:{tag}", self.wiring_path(node)?))
    }

    pub(crate) fn schedule_node_alarm(&mut self, node: NodeRef, when: EngineTime, tag: &str) -> Result<()> {
        self.un_schedule_node_event(node, tag)?;
        let name = self.alarm_name(node, tag)?;
        let owned_tag = tag.to_string();
        self.clock_mut().set_alarm(
            when,
            name,
            Box::new(move |rt: &mut Runtime, at: EngineTime| rt.on_node_alarm(node, &owned_tag, at)),
        )?;
        self.node_record_mut(node)?.scheduler.add_alarm_tag(tag, when);
        Ok(())
    }

    fn on_node_alarm(&mut self, node: NodeRef, tag: &str, at: EngineTime) -> Result<()> {
        if !self.node_is_running(node) {
            return Ok(());
        }
        // A late wake-up fires in the cycle that noticed it.
        let at = at.max(self.evaluation_time());
        let record = self.node_record_mut(node)?;
        record.scheduler.remove_alarm_tag(tag);
        record.scheduler.pop_tag(tag);
        record.scheduler.tags.insert(tag.to_string(), at);
        record.scheduler.events.insert((at, tag.to_string()));
        self.schedule_node(node, at)
    }

    /// Cancel any alarms still owned by a stopping node.
    pub(crate) fn cancel_node_alarms(&mut self, node: NodeRef) -> Result<()> {
        for tag in self.node_record(node)?.scheduler.alarm_tags() {
            let name = self.alarm_name(node, &tag)?;
            self.clock_mut().cancel_alarm(&name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> EngineTime {
        EngineTime::from_secs(secs)
    }

    #[test]
    fn earliest_event_requests_a_wake() {
        let mut scheduler = NodeScheduler::new();
        assert_eq!(scheduler.insert(t(5), None, t(1)), Some(t(5)));
        assert_eq!(scheduler.insert(t(7), None, t(1)), None);
        assert_eq!(scheduler.insert(t(3), None, t(1)), Some(t(3)));
        assert_eq!(scheduler.next_scheduled_time(), t(3));
    }

    #[test]
    fn past_events_are_ignored() {
        let mut scheduler = NodeScheduler::new();
        assert_eq!(scheduler.insert(t(1), None, t(1)), None);
        assert!(!scheduler.requires_scheduling());
    }

    #[test]
    fn tags_replace_earlier_events() {
        let mut scheduler = NodeScheduler::new();
        scheduler.insert(t(5), Some("timeout"), t(1));
        scheduler.insert(t(9), Some("timeout"), t(1));
        assert_eq!(scheduler.tag_time("timeout"), Some(t(9)));
        assert_eq!(scheduler.next_scheduled_time(), t(9));
        assert_eq!(scheduler.pop_tag("timeout"), Some(t(9)));
        assert!(!scheduler.requires_scheduling());
    }

    #[test]
    fn advance_consumes_due_events() {
        let mut scheduler = NodeScheduler::new();
        scheduler.insert(t(2), Some("a"), t(1));
        scheduler.insert(t(4), None, t(1));
        assert!(scheduler.is_scheduled_now(t(2)));
        assert_eq!(scheduler.advance(t(2)), Some(t(4)));
        assert!(!scheduler.has_tag("a"));
        assert_eq!(scheduler.advance(t(4)), None);
        assert_eq!(scheduler.next_scheduled_time(), MIN_DT);
    }
}
