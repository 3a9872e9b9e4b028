//! Keyword-based skill assignment for tasks.

use operon_core::SkillRule;

/// Matches rules against a task description and accumulates skill packs.
///
/// Rules are checked in order; every rule whose pattern appears as a
/// case-insensitive substring contributes its skills. Duplicates keep
/// their first position.
pub fn assign_skills(text: &str, rules: &[SkillRule]) -> Vec<String> {
    let haystack = text.to_lowercase();
    let mut skills: Vec<String> = Vec::new();
    for rule in rules {
        if haystack.contains(&rule.pattern.to_lowercase()) {
            for skill in &rule.skills {
                if !skills.contains(skill) {
                    skills.push(skill.clone());
                }
            }
        }
    }
    skills
}
