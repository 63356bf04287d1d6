//! Canonical character facts for a run.
//!
//! Every read or write of a character descriptor by the pipeline goes through
//! [`ConsistencyManager`]. Profile changes are versioned: once a panel has
//! been drawn against a profile version, changing the descriptor opens a new
//! version and flags the affected panels stale instead of leaving them
//! silently inconsistent.

use crate::core::state::{CharacterProfile, GenerationStatus, Panel, PanelId, RunState};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};

/// Read-only profile copies handed to stages.
pub type ProfileSnapshot = BTreeMap<String, CharacterProfile>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Became the canonical profile without invalidating any panel.
    Accepted { version: u32 },
    /// Opened a new version; these generated panels are now stale.
    Superseded {
        version: u32,
        stale_panels: Vec<PanelId>,
    },
}

impl ProposalOutcome {
    pub fn version(&self) -> u32 {
        match self {
            ProposalOutcome::Accepted { version } | ProposalOutcome::Superseded { version, .. } => {
                *version
            }
        }
    }
}

/// Read access to the canonical profiles of a run.
#[derive(Clone, Copy)]
pub struct ConsistencyView<'a> {
    state: &'a RunState,
}

impl<'a> ConsistencyView<'a> {
    pub fn new(state: &'a RunState) -> Self {
        Self { state }
    }

    pub fn get_profile(&self, name: &str) -> CharacterProfile {
        profile_of(self.state, name)
    }

    /// Profile versions a panel is about to be drawn against.
    ///
    /// Nothing is written here: the bindings are stored on the panel by
    /// [`ConsistencyManager::record_generated`] once the image exists, so a
    /// panel that is being redrawn keeps describing its current image.
    pub fn bind_panel(&self, panel_id: PanelId) -> BTreeMap<String, u32> {
        let Some(panel) = self.state.script.panel(panel_id) else {
            return BTreeMap::new();
        };
        panel
            .character_refs
            .iter()
            .map(|n| (n.clone(), profile_of(self.state, n).profile_version))
            .collect()
    }

    pub fn stale_panels(&self) -> Vec<PanelId> {
        self.state
            .script
            .panels()
            .filter(|p| p.stale && p.generation_status == GenerationStatus::Generated)
            .map(|p| p.id)
            .collect()
    }

    pub fn snapshot<I, S>(&self, names: I) -> ProfileSnapshot
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|n| {
                let n = n.as_ref();
                (n.to_string(), profile_of(self.state, n))
            })
            .collect()
    }
}

/// Read and write access to the canonical profiles of a run.
pub struct ConsistencyManager<'a> {
    state: &'a mut RunState,
}

impl<'a> ConsistencyManager<'a> {
    pub fn new(state: &'a mut RunState) -> Self {
        Self { state }
    }

    pub fn view(&self) -> ConsistencyView<'_> {
        ConsistencyView::new(&*self.state)
    }

    pub fn get_profile(&self, name: &str) -> CharacterProfile {
        self.view().get_profile(name)
    }

    pub fn propose_profile(
        &mut self,
        name: &str,
        descriptor: &str,
        personality: Option<&str>,
    ) -> ProposalOutcome {
        let profiles = &mut self.state.characters.profiles;

        let Some(profile) = profiles.get_mut(name) else {
            profiles.insert(
                name.to_string(),
                CharacterProfile {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    personality: personality.map(str::to_string),
                    profile_version: 1,
                    generated_panels: BTreeMap::new(),
                },
            );
            info!("Character {} accepted at profile version 1", name);
            return ProposalOutcome::Accepted { version: 1 };
        };

        if profile.descriptor == descriptor
            && (personality.is_none() || profile.personality.as_deref() == personality)
        {
            return ProposalOutcome::Accepted {
                version: profile.profile_version,
            };
        }

        let drawn_against_current = profile
            .generated_panels
            .get(&profile.profile_version)
            .is_some_and(|ids| !ids.is_empty());

        profile.descriptor = descriptor.to_string();
        if personality.is_some() {
            profile.personality = personality.map(str::to_string);
        }
        profile.profile_version += 1;
        let version = profile.profile_version;

        if !drawn_against_current {
            info!("Character {} revised in place at version {}", name, version);
            return ProposalOutcome::Accepted { version };
        }

        let mut stale_panels = Vec::new();
        for panel in self.state.script.panels_mut() {
            if panel.generation_status != GenerationStatus::Generated {
                continue;
            }
            let bound = panel.profile_bindings.get(name).copied();
            let references = panel.character_refs.contains(name) || bound.is_some();
            if references && bound.map_or(true, |v| v < version) {
                panel.stale = true;
                stale_panels.push(panel.id);
            }
        }
        warn!(
            "Character {} superseded at version {}; {} panel(s) now stale",
            name,
            version,
            stale_panels.len()
        );
        ProposalOutcome::Superseded {
            version,
            stale_panels,
        }
    }

    pub fn bind_panel(&self, panel_id: PanelId) -> BTreeMap<String, u32> {
        self.view().bind_panel(panel_id)
    }

    /// Register a freshly drawn panel under the versions it was bound to.
    ///
    /// Returns whether the panel is stale, which happens when a profile moved
    /// on while the illustration was in flight.
    pub fn record_generated(&mut self, panel_id: PanelId, bindings: &BTreeMap<String, u32>) -> bool {
        let mut stale = false;
        for (name, version) in bindings {
            let Some(profile) = self.state.characters.profiles.get_mut(name) else {
                continue;
            };
            for ids in profile.generated_panels.values_mut() {
                ids.remove(&panel_id);
            }
            if *version > 0 {
                profile
                    .generated_panels
                    .entry(*version)
                    .or_default()
                    .insert(panel_id);
            }
            if *version < profile.profile_version {
                stale = true;
            }
        }

        if let Some(panel) = self.state.script.panel_mut(panel_id) {
            panel.profile_bindings = bindings.clone();
            panel.stale = stale;
        }
        stale
    }

    pub fn stale_panels(&self) -> Vec<PanelId> {
        self.view().stale_panels()
    }

    pub fn snapshot<I, S>(&self, names: I) -> ProfileSnapshot
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.view().snapshot(names)
    }
}

fn profile_of(state: &RunState, name: &str) -> CharacterProfile {
    state
        .characters
        .profiles
        .get(name)
        .cloned()
        .unwrap_or_else(|| CharacterProfile::unversioned(name))
}

/// Build the illustration prompt for a panel from its canonical facts.
pub fn compose_prompt(panel: &Panel, profiles: &ProfileSnapshot, style: &str) -> String {
    let mut parts = Vec::new();
    if !style.trim().is_empty() {
        parts.push(style.trim().to_string());
    }
    parts.push(panel.description.trim().to_string());

    let names: BTreeSet<&String> = panel.character_refs.iter().collect();
    for name in names {
        let Some(profile) = profiles.get(name.as_str()) else {
            continue;
        };
        if profile.descriptor.is_empty() {
            continue;
        }
        match &profile.personality {
            Some(p) if !p.is_empty() => {
                parts.push(format!("({}: {}, {} expression)", name, profile.descriptor, p))
            }
            _ => parts.push(format!("({}: {})", name, profile.descriptor)),
        }
    }

    if let Some(camera) = &panel.camera_angle {
        parts.push(format!("Camera: {}", camera));
    }
    if let Some(shot) = &panel.shot_type {
        parts.push(format!("Shot: {}", shot));
    }
    if let Some(lighting) = &panel.lighting {
        parts.push(format!("Lighting: {}", lighting));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{MasterScript, Scene};

    fn state_with_panels() -> RunState {
        let mut state = RunState::new("run", vec![]);
        state.script = MasterScript {
            scenes: vec![Scene {
                id: 1,
                location: "Harbor".into(),
                panels: vec![
                    Panel {
                        id: 1,
                        description: "Ava on the pier".into(),
                        character_refs: ["Ava".to_string()].into(),
                        ..Default::default()
                    },
                    Panel {
                        id: 2,
                        description: "Bo waves".into(),
                        character_refs: ["Bo".to_string()].into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        state
    }

    fn draw(state: &mut RunState, panel_id: PanelId) {
        let bindings = ConsistencyManager::new(state).bind_panel(panel_id);
        let panel = state.script.panel_mut(panel_id).unwrap();
        panel.generation_status = GenerationStatus::Generated;
        panel.image_path = Some(format!("{}.png", panel_id));
        ConsistencyManager::new(state).record_generated(panel_id, &bindings);
    }

    #[test]
    fn test_unknown_character_is_unversioned() {
        let mut state = state_with_panels();
        let cm = ConsistencyManager::new(&mut state);
        let profile = cm.get_profile("Nobody");
        assert_eq!(profile.profile_version, 0);
        assert!(profile.descriptor.is_empty());
        assert!(!profile.is_versioned());
    }

    #[test]
    fn test_first_proposal_becomes_version_one() {
        let mut state = state_with_panels();
        let mut cm = ConsistencyManager::new(&mut state);
        let outcome = cm.propose_profile("Ava", "red coat, short black hair", Some("stoic"));
        assert_eq!(outcome, ProposalOutcome::Accepted { version: 1 });
        assert_eq!(cm.get_profile("Ava").descriptor, "red coat, short black hair");
    }

    #[test]
    fn test_revision_before_any_drawing_is_in_place() {
        let mut state = state_with_panels();
        let mut cm = ConsistencyManager::new(&mut state);
        cm.propose_profile("Ava", "red coat", None);
        let outcome = cm.propose_profile("Ava", "blue coat", None);
        assert_eq!(outcome, ProposalOutcome::Accepted { version: 2 });
        assert!(cm.stale_panels().is_empty());
    }

    #[test]
    fn test_identical_proposal_is_a_no_op() {
        let mut state = state_with_panels();
        let mut cm = ConsistencyManager::new(&mut state);
        cm.propose_profile("Ava", "red coat", None);
        assert_eq!(
            cm.propose_profile("Ava", "red coat", None),
            ProposalOutcome::Accepted { version: 1 }
        );
    }

    #[test]
    fn test_revision_after_drawing_supersedes_and_marks_stale() {
        let mut state = state_with_panels();
        {
            let mut cm = ConsistencyManager::new(&mut state);
            cm.propose_profile("Ava", "red coat", None);
            cm.propose_profile("Bo", "tall, bald", None);
        }
        draw(&mut state, 1);
        draw(&mut state, 2);

        let outcome = ConsistencyManager::new(&mut state).propose_profile("Ava", "green coat", None);
        assert_eq!(
            outcome,
            ProposalOutcome::Superseded {
                version: 2,
                stale_panels: vec![1]
            }
        );

        let ava = &state.characters.profiles["Ava"];
        assert_eq!(ava.profile_version, 2);
        assert_eq!(ava.generated_panels[&1], BTreeSet::from([1]));

        let p1 = state.script.panel(1).unwrap();
        assert!(p1.stale);
        assert_eq!(p1.image_path.as_deref(), Some("1.png"));
        assert_eq!(p1.profile_bindings["Ava"], 1);
        assert!(!state.script.panel(2).unwrap().stale);
        assert_eq!(ConsistencyView::new(&state).stale_panels(), vec![1]);
    }

    #[test]
    fn test_view_reads_without_mutable_access() {
        let mut state = state_with_panels();
        ConsistencyManager::new(&mut state).propose_profile("Ava", "red coat", Some("stoic"));
        draw(&mut state, 1);
        ConsistencyManager::new(&mut state).propose_profile("Ava", "green coat", None);

        let frozen = state.clone();
        let view = ConsistencyView::new(&frozen);
        assert_eq!(view.get_profile("Ava").profile_version, 2);
        assert_eq!(view.bind_panel(1), BTreeMap::from([("Ava".to_string(), 2)]));
        assert_eq!(view.stale_panels(), vec![1]);
        let snapshot = view.snapshot(["Ava", "Nobody"]);
        assert_eq!(snapshot["Ava"].descriptor, "green coat");
        assert!(!snapshot["Nobody"].is_versioned());
        assert_eq!(frozen, state);
    }

    #[test]
    fn test_binding_is_written_only_when_generated() {
        let mut state = state_with_panels();
        let mut cm = ConsistencyManager::new(&mut state);
        cm.propose_profile("Ava", "red coat", None);
        let bound = cm.bind_panel(1);
        assert_eq!(bound, BTreeMap::from([("Ava".to_string(), 1)]));
        assert!(cm.bind_panel(99).is_empty());
        assert!(state.script.panel(1).unwrap().profile_bindings.is_empty());
    }

    #[test]
    fn test_profile_moving_during_drawing_marks_result_stale() {
        let mut state = state_with_panels();
        ConsistencyManager::new(&mut state).propose_profile("Ava", "red coat", None);
        let bindings = ConsistencyManager::new(&mut state).bind_panel(1);
        ConsistencyManager::new(&mut state).propose_profile("Ava", "green coat", None);

        state.script.panel_mut(1).unwrap().generation_status = GenerationStatus::Generated;
        let stale = ConsistencyManager::new(&mut state).record_generated(1, &bindings);
        assert!(stale);
        let p1 = state.script.panel(1).unwrap();
        assert!(p1.stale);
        assert_eq!(p1.profile_bindings["Ava"], 1);
    }

    #[test]
    fn test_redraw_clears_staleness() {
        let mut state = state_with_panels();
        ConsistencyManager::new(&mut state).propose_profile("Ava", "red coat", None);
        draw(&mut state, 1);
        ConsistencyManager::new(&mut state).propose_profile("Ava", "green coat", None);
        assert!(state.script.panel(1).unwrap().stale);

        draw(&mut state, 1);
        let p1 = state.script.panel(1).unwrap();
        assert!(!p1.stale);
        assert_eq!(p1.profile_bindings["Ava"], 2);
        let ava = &state.characters.profiles["Ava"];
        assert!(ava.generated_panels[&1].is_empty());
        assert_eq!(ava.generated_panels[&2], BTreeSet::from([1]));
    }

    #[test]
    fn test_compose_prompt_includes_canonical_facts() {
        let mut state = state_with_panels();
        ConsistencyManager::new(&mut state).propose_profile("Ava", "red coat", Some("stoic"));
        let panel = {
            let p = state.script.panel_mut(1).unwrap();
            p.camera_angle = Some("Low angle".into());
            p.lighting = Some("Neon backlight".into());
            p.clone()
        };
        let snapshot = ConsistencyManager::new(&mut state).snapshot(["Ava"]);
        let prompt = compose_prompt(&panel, &snapshot, "ink wash");
        assert_eq!(
            prompt,
            "ink wash, Ava on the pier, (Ava: red coat, stoic expression), Camera: Low angle, Lighting: Neon backlight"
        );
    }
}
