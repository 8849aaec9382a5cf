//! Named, ordered lists of systems.
//!
//! A label is a type; each registered system is an opaque callable tagged
//! with the [`QuerySignature`] it needs. Running a schedule builds a fresh
//! query per system and calls systems in registration order.

use crate::error::EcsError;
use crate::query::QuerySignature;
use crate::world::World;
use std::any::TypeId;
use std::collections::HashMap;

/// Type-level schedule name.
pub trait ScheduleLabel: 'static {
    fn name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Per-frame simulation systems.
pub struct Update;

/// Systems that turn scene state into draw submissions.
pub struct Render;

impl ScheduleLabel for Update {}
impl ScheduleLabel for Render {}

/// Descriptive record of a registered system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: String,
    pub signature: QuerySignature,
}

pub(crate) type BoxedSystem = Box<dyn FnMut(&World) -> Result<(), EcsError>>;

pub(crate) struct SystemEntry {
    pub(crate) info: SystemInfo,
    pub(crate) run: BoxedSystem,
}

struct ScheduleState {
    label: &'static str,
    systems: Vec<SystemEntry>,
    running: bool,
}

#[derive(Default)]
pub(crate) struct ScheduleRegistry {
    schedules: HashMap<TypeId, ScheduleState>,
}

impl ScheduleRegistry {
    pub(crate) fn push(&mut self, label: TypeId, name: &'static str, entry: SystemEntry) {
        self.schedules
            .entry(label)
            .or_insert_with(|| ScheduleState {
                label: name,
                systems: Vec::new(),
                running: false,
            })
            .systems
            .push(entry);
    }

    /// Take the systems out for a run. Systems registered meanwhile land in
    /// the (now empty) stored list and are merged back by [`Self::finish`].
    pub(crate) fn begin(
        &mut self,
        label: TypeId,
        name: &'static str,
    ) -> Result<Vec<SystemEntry>, EcsError> {
        let Some(state) = self.schedules.get_mut(&label) else {
            return Ok(Vec::new());
        };
        if state.running {
            return Err(EcsError::ScheduleReentrant { label: name });
        }
        state.running = true;
        Ok(std::mem::take(&mut state.systems))
    }

    pub(crate) fn finish(&mut self, label: TypeId, mut ran: Vec<SystemEntry>) {
        if let Some(state) = self.schedules.get_mut(&label) {
            ran.append(&mut state.systems);
            state.systems = ran;
            state.running = false;
        }
    }

    pub(crate) fn count(&self, label: TypeId) -> usize {
        self.schedules.get(&label).map_or(0, |s| s.systems.len())
    }

    pub(crate) fn infos(&self, label: TypeId) -> Vec<SystemInfo> {
        self.schedules
            .get(&label)
            .map(|s| s.systems.iter().map(|e| e.info.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn total(&self) -> usize {
        self.schedules.values().map(|s| s.systems.len()).sum()
    }

    pub(crate) fn labels(&self) -> Vec<&'static str> {
        let mut labels: Vec<_> = self.schedules.values().map(|s| s.label).collect();
        labels.sort_unstable();
        labels
    }
}

/// Readable name from a callable's type path, e.g. `spin_system` or
/// `build_scene::{closure}`.
pub(crate) fn short_system_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    let mut parts = base.rsplit("::");
    match parts.next() {
        Some("{{closure}}") => match parts.next() {
            Some(owner) => format!("{owner}::{{closure}}"),
            None => "{closure}".to_string(),
        },
        Some(name) => name.to_string(),
        None => full.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_names_strip_module_path() {
        assert_eq!(Update::name(), "Update");
        assert_eq!(Render::name(), "Render");
    }

    #[test]
    fn short_name_of_plain_function() {
        assert_eq!(short_system_name("my_game::systems::spin"), "spin");
    }

    #[test]
    fn short_name_of_closure_keeps_owner() {
        assert_eq!(
            short_system_name("my_game::setup::{{closure}}"),
            "setup::{closure}"
        );
    }

    #[test]
    fn begin_on_unknown_label_is_empty() {
        let mut registry = ScheduleRegistry::default();
        let systems = registry.begin(TypeId::of::<Update>(), "Update").unwrap();
        assert!(systems.is_empty());
        assert_eq!(registry.total(), 0);
    }
}
