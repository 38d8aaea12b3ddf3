//! Maintenance schedule types and pure schedule logic.
//!
//! Machine records carry more than the schedule encodes (mode, attached
//! agents), so schedule updates are applied as a diff rather than a rebuild.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Identifies a physical machine by hostname and/or IP.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl MachineId {
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ip: None,
        }
    }

    pub fn new(hostname: Option<String>, ip: Option<String>) -> Self {
        Self { hostname, ip }
    }

    /// Names ACLs may match the machine by.
    pub fn names(&self) -> Vec<String> {
        self.hostname.iter().chain(self.ip.iter()).cloned().collect()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.hostname, &self.ip) {
            (Some(h), Some(ip)) => write!(f, "{h} ({ip})"),
            (Some(h), None) => f.write_str(h),
            (None, Some(ip)) => f.write_str(ip),
            (None, None) => f.write_str("<empty machine id>"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineMode {
    #[default]
    Up,
    Draining,
    Down,
}

/// A time interval; open-ended when `duration_secs` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailability {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub mode: MachineMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailability: Option<Unavailability>,
}

impl MachineInfo {
    pub fn up(id: MachineId) -> Self {
        Self {
            id,
            mode: MachineMode::Up,
            unavailability: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub machine_ids: Vec<MachineId>,
    pub unavailability: Unavailability,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub windows: Vec<Window>,
}

impl Schedule {
    pub fn machine_ids(&self) -> impl Iterator<Item = &MachineId> {
        self.windows.iter().flat_map(|w| w.machine_ids.iter())
    }
}

// =============================================================================
// Validation
// =============================================================================

pub fn validate_machine_id(id: &MachineId) -> Result<(), String> {
    if id.hostname.is_none() && id.ip.is_none() {
        return Err("A machine id must specify a hostname or an IP".to_string());
    }
    if let Some(hostname) = &id.hostname {
        if hostname.trim().is_empty() {
            return Err("Machine hostname cannot be empty".to_string());
        }
    }
    if let Some(ip) = &id.ip {
        ip.parse::<IpAddr>()
            .map_err(|e| format!("Machine IP '{ip}' is invalid: {e}"))?;
    }
    Ok(())
}

/// Validates a machine list for start/stop maintenance.
pub fn validate_machine_ids(ids: &[MachineId]) -> Result<(), String> {
    if ids.is_empty() {
        return Err("List of machines is empty".to_string());
    }
    let mut seen = BTreeSet::new();
    for id in ids {
        validate_machine_id(id)?;
        if !seen.insert(id) {
            return Err(format!("Machine '{id}' appears more than once"));
        }
    }
    Ok(())
}

pub fn validate_unavailability(unavailability: &Unavailability) -> Result<(), String> {
    match unavailability.duration_secs {
        Some(d) if d < 0 => Err("Unavailability duration cannot be negative".to_string()),
        _ => Ok(()),
    }
}

/// Validates a proposed schedule against current machine modes.
pub fn validate_schedule(
    schedule: &Schedule,
    machines: &BTreeMap<MachineId, MachineInfo>,
) -> Result<(), String> {
    let mut scheduled = BTreeSet::new();

    for window in &schedule.windows {
        if window.machine_ids.is_empty() {
            return Err("List of machines in a maintenance window is empty".to_string());
        }
        validate_unavailability(&window.unavailability)?;
        for id in &window.machine_ids {
            validate_machine_id(id)?;
            if !scheduled.insert(id) {
                return Err(format!(
                    "Machine '{id}' appears more than once in the schedule"
                ));
            }
        }
    }

    for (id, info) in machines {
        if info.mode == MachineMode::Down && !scheduled.contains(id) {
            return Err(format!(
                "Machine '{id}' is deactivated and cannot be removed from the schedule"
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Diffing
// =============================================================================

/// Machine mode changes implied by replacing the active schedules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleDiff {
    /// UP or unknown machines that become DRAINING.
    pub draining: Vec<(MachineId, Unavailability)>,
    /// Already DRAINING or DOWN machines whose unavailability changes.
    pub updated: Vec<(MachineId, Unavailability)>,
    /// Machines no longer scheduled; they return to UP.
    pub released: Vec<MachineId>,
}

pub fn diff_schedule(
    mode_of: impl Fn(&MachineId) -> Option<MachineMode>,
    current: &[Schedule],
    next: &Schedule,
) -> ScheduleDiff {
    let mut diff = ScheduleDiff::default();
    let mut scheduled = BTreeSet::new();

    for window in &next.windows {
        for id in &window.machine_ids {
            scheduled.insert(id.clone());
            match mode_of(id) {
                Some(MachineMode::Draining | MachineMode::Down) => {
                    diff.updated.push((id.clone(), window.unavailability.clone()));
                }
                Some(MachineMode::Up) | None => {
                    diff.draining.push((id.clone(), window.unavailability.clone()));
                }
            }
        }
    }

    let mut released = BTreeSet::new();
    for id in current.iter().flat_map(Schedule::machine_ids) {
        if !scheduled.contains(id) && released.insert(id.clone()) {
            diff.released.push(id.clone());
        }
    }
    diff
}

/// Applies a diff to a machine table.
pub fn apply_diff(machines: &mut BTreeMap<MachineId, MachineInfo>, diff: &ScheduleDiff) {
    for (id, unavailability) in &diff.draining {
        let info = machines
            .entry(id.clone())
            .or_insert_with(|| MachineInfo::up(id.clone()));
        info.mode = MachineMode::Draining;
        info.unavailability = Some(unavailability.clone());
    }
    for (id, unavailability) in &diff.updated {
        if let Some(info) = machines.get_mut(id) {
            info.unavailability = Some(unavailability.clone());
        }
    }
    for id in &diff.released {
        if let Some(info) = machines.get_mut(id) {
            info.mode = MachineMode::Up;
            info.unavailability = None;
        }
    }
}

/// Removes machines from every window, dropping windows and schedules that
/// end up empty.
pub fn remove_from_schedules(schedules: &mut Vec<Schedule>, ids: &[MachineId]) {
    for schedule in schedules.iter_mut() {
        for window in schedule.windows.iter_mut() {
            window.machine_ids.retain(|m| !ids.contains(m));
        }
        schedule.windows.retain(|w| !w.machine_ids.is_empty());
    }
    schedules.retain(|s| !s.windows.is_empty());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn unavailability(hour: u32) -> Unavailability {
        Unavailability {
            start: Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap(),
            duration_secs: Some(3600),
        }
    }

    fn schedule(ids: &[&str], hour: u32) -> Schedule {
        Schedule {
            windows: vec![Window {
                machine_ids: ids.iter().map(|h| MachineId::hostname(*h)).collect(),
                unavailability: unavailability(hour),
            }],
        }
    }

    fn machines_from(schedule: &Schedule) -> BTreeMap<MachineId, MachineInfo> {
        let mut machines = BTreeMap::new();
        let diff = diff_schedule(|_| None, &[], schedule);
        apply_diff(&mut machines, &diff);
        machines
    }

    #[test]
    fn test_diff_ab_replacing_bc() {
        let old = schedule(&["b", "c"], 1);
        let mut machines = machines_from(&old);
        let new = schedule(&["a", "b"], 2);

        let diff = diff_schedule(|id| machines.get(id).map(|m| m.mode), &[old], &new);
        apply_diff(&mut machines, &diff);

        let a = &machines[&MachineId::hostname("a")];
        let b = &machines[&MachineId::hostname("b")];
        let c = &machines[&MachineId::hostname("c")];
        assert_eq!(a.mode, MachineMode::Draining);
        assert_eq!(b.mode, MachineMode::Draining);
        assert_eq!(b.unavailability, Some(unavailability(2)));
        assert_eq!(c.mode, MachineMode::Up);
        assert_eq!(c.unavailability, None);
    }

    #[test]
    fn test_diff_keeps_down_machine_down() {
        let old = schedule(&["a"], 1);
        let mut machines = machines_from(&old);
        machines.get_mut(&MachineId::hostname("a")).unwrap().mode = MachineMode::Down;

        let new = schedule(&["a"], 5);
        let diff = diff_schedule(|id| machines.get(id).map(|m| m.mode), &[old], &new);
        assert!(diff.draining.is_empty());
        apply_diff(&mut machines, &diff);

        let a = &machines[&MachineId::hostname("a")];
        assert_eq!(a.mode, MachineMode::Down);
        assert_eq!(a.unavailability, Some(unavailability(5)));
    }

    #[test]
    fn test_validate_rejects_machine_in_two_windows() {
        let mut s = schedule(&["a"], 1);
        s.windows.push(Window {
            machine_ids: vec![MachineId::hostname("a")],
            unavailability: unavailability(3),
        });
        assert!(validate_schedule(&s, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_validate_down_machine_must_stay_scheduled() {
        let old = schedule(&["a"], 1);
        let mut machines = machines_from(&old);
        machines.get_mut(&MachineId::hostname("a")).unwrap().mode = MachineMode::Down;

        let err = validate_schedule(&schedule(&["b"], 1), &machines).unwrap_err();
        assert!(err.contains("deactivated"));
        assert!(validate_schedule(&schedule(&["a", "b"], 1), &machines).is_ok());
    }

    #[test]
    fn test_validate_negative_duration() {
        let mut s = schedule(&["a"], 1);
        s.windows[0].unavailability.duration_secs = Some(-1);
        assert!(validate_schedule(&s, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_validate_machine_ids() {
        assert!(validate_machine_ids(&[]).is_err());
        assert!(validate_machine_ids(&[MachineId::new(None, None)]).is_err());
        assert!(validate_machine_ids(&[MachineId::new(None, Some("not-an-ip".into()))]).is_err());
        assert!(validate_machine_ids(&[MachineId::new(None, Some("10.0.0.1".into()))]).is_ok());
        assert!(validate_machine_ids(&[MachineId::hostname("a"), MachineId::hostname("a")]).is_err());
    }

    #[test]
    fn test_remove_from_schedules_drops_empty() {
        let mut schedules = vec![schedule(&["a", "b"], 1), schedule(&["c"], 2)];
        remove_from_schedules(&mut schedules, &[MachineId::hostname("c"), MachineId::hostname("a")]);
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].windows[0].machine_ids, vec![MachineId::hostname("b")]);
    }
}
