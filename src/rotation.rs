// src/rotation.rs

use crate::error::{AppError, Result};
use crate::health::{HealthInfo, HealthStatus};
use crate::keys::{KeyRecord, Registry};
use crate::storage::RotationState;
use std::cmp::Ordering;
use std::collections::HashMap;

pub type HealthMap = HashMap<String, HealthInfo>;

/// Selection knobs lifted from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// Strict mode: keys with no health entry are not selectable.
    pub require_usage_ok: bool,
    /// With strict mode, an entirely empty cache is treated as unknown.
    pub fail_open_on_empty_cache: bool,
    /// Whether the round-robin fallback pass may pick `warn` keys.
    pub include_warn: bool,
}

/// Whether a key may be selected right now.
pub fn is_eligible(key: &KeyRecord, state: &RotationState, health: Option<&HealthMap>) -> bool {
    if key.disabled {
        return false;
    }
    if state.is_blocked(&key.label) {
        return false;
    }
    // A 401 invalidates the key until its state is manually reset.
    if state.key_state(&key.label).is_some_and(|k| k.err_401 > 0) {
        return false;
    }
    if state.is_exhausted(&key.label) {
        return false;
    }
    match health.and_then(|map| map.get(&key.label)) {
        Some(info) => !matches!(info.status, HealthStatus::Blocked | HealthStatus::Exhausted),
        None => true,
    }
}

fn usage_ok(health: Option<&HealthMap>, label: &str, opts: SelectOptions) -> bool {
    if !opts.require_usage_ok {
        return true;
    }
    let Some(map) = health.filter(|m| !m.is_empty()) else {
        return opts.fail_open_on_empty_cache;
    };
    match map.get(label) {
        Some(info) => info.usage_ok,
        None => opts.fail_open_on_empty_cache,
    }
}

fn selectable(
    key: &KeyRecord,
    state: &RotationState,
    health: Option<&HealthMap>,
    opts: SelectOptions,
) -> bool {
    is_eligible(key, state, health) && usage_ok(health, &key.label, opts)
}

/// First eligible index after `active_index`, wrapping; `None` when every
/// key is out.
pub fn next_eligible_index(
    registry: &Registry,
    state: &RotationState,
    health: Option<&HealthMap>,
    opts: SelectOptions,
) -> Option<usize> {
    if registry.is_empty() {
        return None;
    }
    let total = registry.len();
    let start = state.active_index % total;
    (1..=total)
        .map(|offset| (start + offset) % total)
        .find(|&idx| selectable(&registry.keys()[idx], state, health, opts))
}

fn status_of(health: Option<&HealthMap>, label: &str) -> Option<HealthStatus> {
    health.and_then(|map| map.get(label)).map(|info| info.status)
}

/// Round-robin selection starting at the rotation cursor.
///
/// With health data a first pass takes only `healthy` keys; the fallback
/// pass takes any eligible key, admitting `warn` only when configured.
/// A selection advances the cursor by exactly one (mod len) and stamps
/// `last_used`.
pub fn select_round_robin<'a>(
    registry: &'a Registry,
    state: &mut RotationState,
    health: Option<&HealthMap>,
    opts: SelectOptions,
) -> Option<&'a KeyRecord> {
    if registry.is_empty() {
        return None;
    }
    let total = registry.len();
    let start = state.rotation_index % total;

    if health.is_some_and(|map| !map.is_empty()) {
        for offset in 0..total {
            let idx = (start + offset) % total;
            let candidate = &registry.keys()[idx];
            if status_of(health, &candidate.label) == Some(HealthStatus::Healthy)
                && selectable(candidate, state, health, opts)
            {
                state.rotation_index = (idx + 1) % total;
                state.mark_last_used(&candidate.label);
                return Some(candidate);
            }
        }
    }

    for offset in 0..total {
        let idx = (start + offset) % total;
        let candidate = &registry.keys()[idx];
        if !selectable(candidate, state, health, opts) {
            continue;
        }
        if status_of(health, &candidate.label) == Some(HealthStatus::Warn) && !opts.include_warn {
            continue;
        }
        state.rotation_index = (idx + 1) % total;
        state.mark_last_used(&candidate.label);
        return Some(candidate);
    }
    None
}

/// Per-request selection: round-robin under auto-rotation, otherwise the
/// active key, falling back to the next eligible index (which becomes the
/// new active key).
pub fn select_for_request<'a>(
    registry: &'a Registry,
    state: &mut RotationState,
    auto_rotate: bool,
    health: Option<&HealthMap>,
    opts: SelectOptions,
) -> Option<&'a KeyRecord> {
    if auto_rotate {
        return select_round_robin(registry, state, health, opts);
    }
    let active_index = state.active_index;
    if let Some(active) = registry.active_key(active_index) {
        if selectable(active, state, health, opts) {
            return Some(active);
        }
    }
    let idx = next_eligible_index(registry, state, health, opts)?;
    state.active_index = idx;
    let key = &registry.keys()[idx];
    state.mark_last_used(&key.label);
    Some(key)
}

/// Lexicographic score for manual rotation; lower is better.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ManualScore {
    status_rank: u8,
    remaining_sort: f64,
    error_rate: f64,
}

impl ManualScore {
    fn compare(&self, other: &Self) -> Ordering {
        self.status_rank
            .cmp(&other.status_rank)
            .then_with(|| self.remaining_sort.total_cmp(&other.remaining_sort))
            .then_with(|| self.error_rate.total_cmp(&other.error_rate))
    }
}

fn resource_value(info: Option<&HealthInfo>) -> Option<f64> {
    let info = info?;
    if let Some(percent) = info.remaining_percent {
        return Some(percent);
    }
    match (info.remaining, info.limit) {
        (Some(remaining), Some(limit)) if limit > 0 => {
            Some((remaining as f64 / limit as f64) * 100.0)
        }
        _ => None,
    }
}

fn status_rank(info: Option<&HealthInfo>) -> u8 {
    match info.map(|i| i.status) {
        Some(HealthStatus::Healthy) => 0,
        Some(HealthStatus::Warn) => 1,
        _ => 2,
    }
}

fn manual_score(info: Option<&HealthInfo>) -> ManualScore {
    let remaining_sort = resource_value(info).map_or(1.0, |value| -value);
    ManualScore {
        status_rank: status_rank(info),
        remaining_sort,
        error_rate: info.map_or(0.0, |i| i.error_rate),
    }
}

/// Outcome of a manual rotation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualRotation {
    pub index: usize,
    pub label: String,
    pub rotated: bool,
    pub reason: Option<String>,
}

struct Candidate<'a> {
    index: usize,
    key: &'a KeyRecord,
    info: Option<&'a HealthInfo>,
}

fn manual_candidates<'a>(
    registry: &'a Registry,
    state: &RotationState,
    health: Option<&'a HealthMap>,
) -> Vec<Candidate<'a>> {
    registry
        .iter()
        .enumerate()
        .filter(|(_, key)| is_eligible(key, state, health))
        .map(|(index, key)| Candidate {
            index,
            key,
            info: health.and_then(|map| map.get(&key.label)),
        })
        .collect()
}

/// Resource-scored rotation to the best key, with deterministic stay
/// reasons when the current key already ranks best.
pub fn rotate_manual(
    registry: &Registry,
    state: &mut RotationState,
    health: Option<&HealthMap>,
    prefer_next_on_tie: bool,
) -> Result<ManualRotation> {
    let current_idx = state.active_index;

    let Some(health) = health else {
        // Without health data the best move is simply the next eligible key.
        let idx = next_eligible_index(registry, state, None, SelectOptions::default())
            .ok_or(AppError::NoEligibleKeys)?;
        let key = &registry.keys()[idx];
        if idx == current_idx {
            return Ok(ManualRotation {
                index: idx,
                label: key.label.clone(),
                rotated: false,
                reason: None,
            });
        }
        state.active_index = idx;
        state.mark_last_used(&key.label);
        return Ok(ManualRotation {
            index: idx,
            label: key.label.clone(),
            rotated: true,
            reason: None,
        });
    };

    let candidates = manual_candidates(registry, state, Some(health));
    if candidates.is_empty() {
        return Err(AppError::NoEligibleKeys);
    }

    let best_score = candidates
        .iter()
        .map(|c| manual_score(c.info))
        .reduce(|a, b| if b.compare(&a) == Ordering::Less { b } else { a })
        .expect("candidates is non-empty");
    let best_indices: Vec<usize> = candidates
        .iter()
        .filter(|c| manual_score(c.info).compare(&best_score) == Ordering::Equal)
        .map(|c| c.index)
        .collect();

    if best_indices.contains(&current_idx) {
        if prefer_next_on_tie && best_indices.len() > 1 {
            let pos = best_indices
                .iter()
                .position(|&idx| idx == current_idx)
                .expect("current index is among best");
            let idx = best_indices[(pos + 1) % best_indices.len()];
            let key = &registry.keys()[idx];
            state.active_index = idx;
            state.mark_last_used(&key.label);
            return Ok(ManualRotation {
                index: idx,
                label: key.label.clone(),
                rotated: true,
                reason: Some("Tie for best score; rotating to next eligible.".to_string()),
            });
        }
        let key = &registry.keys()[current_idx];
        let reason = stay_reason(&candidates, current_idx, health, &key.label);
        return Ok(ManualRotation {
            index: current_idx,
            label: key.label.clone(),
            rotated: false,
            reason,
        });
    }

    let idx = candidates
        .iter()
        .find(|c| manual_score(c.info).compare(&best_score) == Ordering::Equal)
        .map(|c| c.index)
        .expect("a best candidate exists");
    let key = &registry.keys()[idx];
    state.active_index = idx;
    state.mark_last_used(&key.label);
    Ok(ManualRotation {
        index: idx,
        label: key.label.clone(),
        rotated: true,
        reason: None,
    })
}

/// Builds the deterministic explanation for staying on the current key,
/// comparing it against the best non-current runner.
fn stay_reason(
    candidates: &[Candidate<'_>],
    current_idx: usize,
    health: &HealthMap,
    current_label: &str,
) -> Option<String> {
    let current_info = health.get(current_label);
    let mut others: Vec<&Candidate<'_>> =
        candidates.iter().filter(|c| c.index != current_idx).collect();
    others.sort_by(|a, b| {
        manual_score(a.info)
            .compare(&manual_score(b.info))
            .then_with(|| a.key.label.cmp(&b.key.label))
    });

    if let Some(runner) = others.first() {
        let runner_label = &runner.key.label;
        let cur_remaining = resource_value(current_info);
        let runner_remaining = resource_value(runner.info);
        let current_score = manual_score(current_info);
        let runner_score = manual_score(runner.info);

        if current_score.compare(&runner_score) == Ordering::Equal {
            return Some(match cur_remaining {
                Some(value) => format!(
                    "Current key ties for best remaining quota ({value:.0}%). Keeping current over {runner_label}."
                ),
                None => format!(
                    "Current key ties for best score. Keeping current over {runner_label}."
                ),
            });
        }
        if let (Some(cur), Some(next)) = (cur_remaining, runner_remaining) {
            return Some(format!(
                "Current key has higher remaining quota ({cur:.0}%), next best {runner_label} has {next:.0}%."
            ));
        }
        if let (Some(cur), Some(next)) = (current_info, runner.info) {
            if cur.error_rate != next.error_rate {
                return Some(format!(
                    "Current key has lower error rate ({:.1}%), next best {runner_label} has {:.1}%.",
                    cur.error_rate * 100.0,
                    next.error_rate * 100.0
                ));
            }
            if cur.status != next.status {
                return Some(format!(
                    "Current key has better status ({}), next best {runner_label} has ({}).",
                    cur.status, next.status
                ));
            }
        }
    }
    current_info.map(|info| format!("Current key already ranks best (status={}).", info.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthInfo;
    use crate::keys::KeyRecord;

    fn registry(labels: &[&str]) -> Registry {
        Registry::new(
            labels
                .iter()
                .map(|l| KeyRecord::new(*l, format!("sk-{l}-0000000000")))
                .collect(),
        )
        .unwrap()
    }

    fn info(status: HealthStatus, remaining: Option<f64>, error_rate: f64) -> HealthInfo {
        HealthInfo {
            status,
            remaining_percent: remaining,
            used: None,
            limit: None,
            remaining: None,
            reset_hint: None,
            limits: Vec::new(),
            error_rate,
            usage_ok: true,
            email: None,
        }
    }

    fn health(entries: &[(&str, HealthStatus, Option<f64>)]) -> HealthMap {
        entries
            .iter()
            .map(|(label, status, remaining)| {
                (label.to_string(), info(*status, *remaining, 0.0))
            })
            .collect()
    }

    #[test]
    fn eligibility_excludes_disabled_blocked_exhausted_and_401() {
        let registry = registry(&["a"]);
        let mut state = RotationState::default();
        let key = &registry.keys()[0];
        assert!(is_eligible(key, &state, None));

        state.record_request("a", 401);
        assert!(!is_eligible(key, &state, None));
        state.keys.get_mut("a").unwrap().err_401 = 0;

        state.mark_exhausted("a", 60);
        assert!(!is_eligible(key, &state, None));
        state.keys.get_mut("a").unwrap().exhausted_until = None;

        state.mark_blocked("a", crate::storage::BlockReason::Manual, 0);
        assert!(!is_eligible(key, &state, None));
        state.clear_blocked(Some("a"));
        assert!(is_eligible(key, &state, None));

        let disabled = KeyRecord::new("d", "sk-d-0000000000").with_disabled(true);
        assert!(!is_eligible(&disabled, &state, None));
    }

    #[test]
    fn eligibility_respects_health_status() {
        let registry = registry(&["a"]);
        let state = RotationState::default();
        let key = &registry.keys()[0];

        let map = health(&[("a", HealthStatus::Blocked, Some(0.0))]);
        assert!(!is_eligible(key, &state, Some(&map)));
        let map = health(&[("a", HealthStatus::Warn, Some(10.0))]);
        assert!(is_eligible(key, &state, Some(&map)));
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = RotationState::default();
        let mut picked = Vec::new();
        for _ in 0..9 {
            let key = select_round_robin(&registry, &mut state, None, SelectOptions::default())
                .expect("a key is always eligible");
            picked.push(key.label.clone());
        }
        assert_eq!(picked, ["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
        assert_eq!(state.rotation_index, 0);
    }

    #[test]
    fn round_robin_skips_exhausted_keys() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = RotationState::default();
        state.mark_exhausted("b", 300);

        let mut picked = Vec::new();
        for _ in 0..4 {
            let key = select_round_robin(&registry, &mut state, None, SelectOptions::default())
                .unwrap();
            picked.push(key.label.clone());
        }
        assert_eq!(picked, ["a", "c", "a", "c"]);
    }

    #[test]
    fn round_robin_prefers_healthy_keys_when_health_is_known() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let map = health(&[
            ("a", HealthStatus::Warn, Some(10.0)),
            ("b", HealthStatus::Healthy, Some(90.0)),
        ]);
        let key =
            select_round_robin(&registry, &mut state, Some(&map), SelectOptions::default())
                .unwrap();
        assert_eq!(key.label, "b");
        assert_eq!(state.rotation_index, 0);
    }

    #[test]
    fn fallback_pass_honors_include_warn() {
        let registry = registry(&["a"]);
        let map = health(&[("a", HealthStatus::Warn, Some(10.0))]);

        let mut state = RotationState::default();
        let opts = SelectOptions {
            include_warn: false,
            ..SelectOptions::default()
        };
        assert!(select_round_robin(&registry, &mut state, Some(&map), opts).is_none());

        let opts = SelectOptions {
            include_warn: true,
            ..SelectOptions::default()
        };
        assert_eq!(
            select_round_robin(&registry, &mut state, Some(&map), opts)
                .unwrap()
                .label,
            "a"
        );
    }

    #[test]
    fn strict_mode_requires_a_cache_entry() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let map = health(&[("a", HealthStatus::Healthy, Some(90.0))]);
        let opts = SelectOptions {
            require_usage_ok: true,
            fail_open_on_empty_cache: true,
            include_warn: true,
        };

        // "b" has no entry: only "a" may be selected.
        let mut picked = Vec::new();
        for _ in 0..2 {
            picked.push(
                select_round_robin(&registry, &mut state, Some(&map), opts)
                    .unwrap()
                    .label
                    .clone(),
            );
        }
        assert_eq!(picked, ["a", "a"]);

        // An entirely empty cache fails open.
        let empty = HealthMap::new();
        assert!(
            select_round_robin(&registry, &mut state, Some(&empty), opts).is_some()
        );
    }

    #[test]
    fn non_auto_selection_sticks_to_active_then_advances() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = RotationState::default();

        let key = select_for_request(&registry, &mut state, false, None, SelectOptions::default())
            .unwrap();
        assert_eq!(key.label, "a");
        assert_eq!(state.active_index, 0);

        state.mark_exhausted("a", 300);
        let key = select_for_request(&registry, &mut state, false, None, SelectOptions::default())
            .unwrap();
        assert_eq!(key.label, "b");
        assert_eq!(state.active_index, 1);
    }

    #[test]
    fn selection_returns_none_when_everything_is_out() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        state.mark_exhausted("a", 300);
        state.mark_blocked("b", crate::storage::BlockReason::PaymentRequired, 300);
        assert!(
            select_for_request(&registry, &mut state, true, None, SelectOptions::default())
                .is_none()
        );
        assert!(
            select_for_request(&registry, &mut state, false, None, SelectOptions::default())
                .is_none()
        );
    }

    #[test]
    fn manual_tie_stays_without_prefer_next() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let map = health(&[
            ("a", HealthStatus::Healthy, Some(100.0)),
            ("b", HealthStatus::Healthy, Some(100.0)),
        ]);

        let outcome = rotate_manual(&registry, &mut state, Some(&map), false).unwrap();
        assert!(!outcome.rotated);
        assert_eq!(outcome.label, "a");
        let reason = outcome.reason.unwrap();
        assert!(reason.contains("ties for best remaining quota (100%)"), "{reason}");
        assert!(reason.contains("Keeping current over b"), "{reason}");
    }

    #[test]
    fn manual_tie_rotates_with_prefer_next() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let map = health(&[
            ("a", HealthStatus::Healthy, Some(100.0)),
            ("b", HealthStatus::Healthy, Some(100.0)),
        ]);

        let outcome = rotate_manual(&registry, &mut state, Some(&map), true).unwrap();
        assert!(outcome.rotated);
        assert_eq!(outcome.label, "b");
        assert_eq!(state.active_index, 1);
        assert!(outcome.reason.unwrap().contains("rotating to next eligible"));
    }

    #[test]
    fn manual_rotation_moves_to_the_most_resourceful_key() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let map = health(&[
            ("a", HealthStatus::Healthy, Some(20.0)),
            ("b", HealthStatus::Healthy, Some(95.0)),
        ]);

        let outcome = rotate_manual(&registry, &mut state, Some(&map), false).unwrap();
        assert!(outcome.rotated);
        assert_eq!(outcome.label, "b");
        assert!(outcome.reason.is_none());
    }

    #[test]
    fn manual_stay_reason_names_quota_difference() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let map = health(&[
            ("a", HealthStatus::Healthy, Some(95.0)),
            ("b", HealthStatus::Healthy, Some(40.0)),
        ]);

        let outcome = rotate_manual(&registry, &mut state, Some(&map), false).unwrap();
        assert!(!outcome.rotated);
        let reason = outcome.reason.unwrap();
        assert!(
            reason.contains("higher remaining quota (95%)") && reason.contains("b has 40%"),
            "{reason}"
        );
    }

    #[test]
    fn manual_stay_reason_falls_back_to_status() {
        let registry = registry(&["a", "b"]);
        let mut state = RotationState::default();
        let mut map = HealthMap::new();
        map.insert("a".to_string(), info(HealthStatus::Healthy, None, 0.0));
        map.insert("b".to_string(), info(HealthStatus::Warn, None, 0.0));

        let outcome = rotate_manual(&registry, &mut state, Some(&map), false).unwrap();
        assert!(!outcome.rotated);
        let reason = outcome.reason.unwrap();
        assert!(
            reason.contains("better status (healthy)") && reason.contains("(warn)"),
            "{reason}"
        );
    }

    #[test]
    fn manual_rotation_without_candidates_fails() {
        let registry = registry(&["a"]);
        let mut state = RotationState::default();
        state.mark_exhausted("a", 300);
        let map = HealthMap::new();
        assert!(matches!(
            rotate_manual(&registry, &mut state, Some(&map), false),
            Err(AppError::NoEligibleKeys)
        ));
    }

    #[test]
    fn manual_rotation_without_health_advances_to_next_eligible() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = RotationState::default();
        let outcome = rotate_manual(&registry, &mut state, None, false).unwrap();
        assert!(outcome.rotated);
        assert_eq!(outcome.label, "b");
        assert_eq!(state.active_index, 1);
    }
}
