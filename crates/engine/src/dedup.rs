//! Duplicate command detection by semantic parameter similarity.
//!
//! Commands carry continuous parameters, so "the same action" means close
//! enough under a kind-specific rule rather than equal. Unknown kinds fall
//! back to a weighted key/value similarity score.

use crate::config::DedupConfig;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use viewlink_protocol::{CommandKind, Parameters};

const KEY_WEIGHT: f64 = 0.4;
const VALUE_WEIGHT: f64 = 0.6;
const NUMERIC_RELATIVE_TOLERANCE: f64 = 0.3;

const TARGET_KEYS: &[&str] = &["target", "targetId", "object", "name"];
const POSITION_KEYS: &[&str] = &["position", "point"];
const ZOOM_DIRECTION_KEYS: &[&str] = &["direction"];
const ZOOM_DISTANCE_KEYS: &[&str] = &["distance", "amount"];
const ZOOM_SCALE_KEYS: &[&str] = &["scale", "level"];
const ROTATE_AXIS_KEYS: &[&str] = &["axis", "direction"];
const ROTATE_ANGLE_KEYS: &[&str] = &["angle", "degrees"];

/// Kind-specific similarity thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityRules {
    pub focus_distance: f64,
    pub zoom_tolerance: f64,
    pub rotate_tolerance_deg: f64,
    pub threshold: f64,
}

impl Default for SimilarityRules {
    fn default() -> Self {
        Self::from(&DedupConfig::default())
    }
}

impl From<&DedupConfig> for SimilarityRules {
    fn from(config: &DedupConfig) -> Self {
        Self {
            focus_distance: config.focus_distance,
            zoom_tolerance: config.zoom_tolerance,
            rotate_tolerance_deg: config.rotate_tolerance_deg,
            threshold: config.similarity_threshold,
        }
    }
}

fn first<'a>(params: &'a Parameters, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| params.get(*k)).filter(|v| !v.is_null())
}

fn text(params: &Parameters, keys: &[&str]) -> Option<String> {
    first(params, keys)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

fn number(params: &Parameters, keys: &[&str]) -> Option<f64> {
    let value = first(params, keys)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// `[x, y, z]` or `{x, y, z}`; missing components count as 0.
fn position(params: &Parameters) -> Option<[f64; 3]> {
    match first(params, POSITION_KEYS)? {
        Value::Array(items) if !items.is_empty() => {
            let mut out = [0.0; 3];
            for (slot, item) in out.iter_mut().zip(items.iter()) {
                *slot = item.as_f64()?;
            }
            Some(out)
        }
        Value::Object(map) => {
            let axis = |k: &str| map.get(k).and_then(Value::as_f64);
            if axis("x").is_none() && axis("y").is_none() && axis("z").is_none() {
                return None;
            }
            Some([
                axis("x").unwrap_or(0.0),
                axis("y").unwrap_or(0.0),
                axis("z").unwrap_or(0.0),
            ])
        }
        _ => None,
    }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Both absent, or both present and within `tolerance`.
fn optional_close(a: Option<f64>, b: Option<f64>, tolerance: f64) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() < tolerance,
        _ => false,
    }
}

impl SimilarityRules {
    /// Whether two commands of `kind` describe the same action.
    pub fn similar(&self, kind: &CommandKind, a: &Parameters, b: &Parameters) -> bool {
        match kind {
            CommandKind::Focus => self.focus_similar(a, b),
            CommandKind::Zoom => self.zoom_similar(a, b),
            CommandKind::Rotate => self.rotate_similar(a, b),
            CommandKind::Reset => true,
            CommandKind::Other(_) => generic_similarity(a, b, self.threshold) >= self.threshold,
        }
    }

    fn focus_similar(&self, a: &Parameters, b: &Parameters) -> bool {
        if let (Some(ta), Some(tb)) = (text(a, TARGET_KEYS), text(b, TARGET_KEYS)) {
            return ta == tb;
        }
        match (position(a), position(b)) {
            (Some(pa), Some(pb)) => distance(pa, pb) < self.focus_distance,
            _ => false,
        }
    }

    fn zoom_similar(&self, a: &Parameters, b: &Parameters) -> bool {
        if let (Some(sa), Some(sb)) = (number(a, ZOOM_SCALE_KEYS), number(b, ZOOM_SCALE_KEYS)) {
            if (sa - sb).abs() < self.zoom_tolerance {
                return true;
            }
        }
        match (text(a, ZOOM_DIRECTION_KEYS), text(b, ZOOM_DIRECTION_KEYS)) {
            (Some(da), Some(db)) if da == db => optional_close(
                number(a, ZOOM_DISTANCE_KEYS),
                number(b, ZOOM_DISTANCE_KEYS),
                self.zoom_tolerance,
            ),
            _ => false,
        }
    }

    fn rotate_similar(&self, a: &Parameters, b: &Parameters) -> bool {
        if text(a, ROTATE_AXIS_KEYS) != text(b, ROTATE_AXIS_KEYS) {
            return false;
        }
        optional_close(
            number(a, ROTATE_ANGLE_KEYS),
            number(b, ROTATE_ANGLE_KEYS),
            self.rotate_tolerance_deg,
        )
    }
}

/// Weighted similarity of two parameter sets in `[0, 1]`:
/// `0.4 * jaccard(keys) + 0.6 * fraction of shared keys with similar values`.
///
/// `threshold` is used when comparing nested objects recursively.
pub fn generic_similarity(a: &Parameters, b: &Parameters, threshold: f64) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let shared: Vec<&String> = a.keys().filter(|k| b.contains_key(*k)).collect();
    let union = a.len() + b.len() - shared.len();
    let key_score = shared.len() as f64 / union as f64;

    let value_score = if shared.is_empty() {
        0.0
    } else {
        let similar = shared
            .iter()
            .filter(|k| values_similar(&a[k.as_str()], &b[k.as_str()], threshold))
            .count();
        similar as f64 / shared.len() as f64
    };

    KEY_WEIGHT * key_score + VALUE_WEIGHT * value_score
}

fn values_similar(a: &Value, b: &Value, threshold: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => numbers_similar(x, y),
            _ => false,
        },
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Null, Value::Null) => true,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_similar(p, q, threshold))
        }
        (Value::Object(x), Value::Object(y)) => generic_similarity(x, y, threshold) >= threshold,
        _ => false,
    }
}

fn numbers_similar(x: f64, y: f64) -> bool {
    let magnitude = x.abs().max(y.abs());
    if magnitude == 0.0 {
        return true;
    }
    (x - y).abs() <= NUMERIC_RELATIVE_TOLERANCE * magnitude
}

/// Memory of a command that finished executing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCommandRecord {
    pub kind: CommandKind,
    pub parameters: Parameters,
    pub completed_at: Instant,
    pub succeeded: bool,
}

/// Judges new submissions against recently executed commands.
pub struct DedupJudge {
    history: Mutex<VecDeque<ExecutedCommandRecord>>,
    retention: Duration,
    max_records: usize,
    rules: SimilarityRules,
}

impl DedupJudge {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            retention: config.retention(),
            max_records: config.max_records.max(1),
            rules: SimilarityRules::from(config),
        }
    }

    pub fn rules(&self) -> &SimilarityRules {
        &self.rules
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Whether `kind`/`parameters` repeats a command completed within the
    /// retention window. Read-only with respect to the command.
    pub fn is_duplicate(&self, kind: &CommandKind, parameters: &Parameters) -> bool {
        let now = Instant::now();
        let mut history = self.history.lock();
        Self::purge_locked(&mut history, now, self.retention);

        let matched = history
            .iter()
            .filter(|record| &record.kind == kind)
            .find(|record| self.rules.similar(kind, &record.parameters, parameters));

        if let Some(record) = matched {
            debug!(
                "Duplicate {} suppressed; matches command completed {:?} ago",
                kind,
                now.saturating_duration_since(record.completed_at)
            );
            return true;
        }
        false
    }

    /// Remember a completed command.
    pub fn record(&self, kind: CommandKind, parameters: Parameters, succeeded: bool) {
        let mut history = self.history.lock();
        if history.len() >= self.max_records {
            history.pop_front();
        }
        history.push_back(ExecutedCommandRecord {
            kind,
            parameters,
            completed_at: Instant::now(),
            succeeded,
        });
    }

    /// Drop records older than the retention window. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut history = self.history.lock();
        Self::purge_locked(&mut history, Instant::now(), self.retention)
    }

    fn purge_locked(
        history: &mut VecDeque<ExecutedCommandRecord>,
        now: Instant,
        retention: Duration,
    ) -> usize {
        let before = history.len();
        history.retain(|r| now.saturating_duration_since(r.completed_at) <= retention);
        before - history.len()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// Snapshot of the current history, oldest first.
    pub fn records(&self) -> Vec<ExecutedCommandRecord> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn judge() -> DedupJudge {
        DedupJudge::new(&DedupConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_within_tolerance_is_duplicate() {
        let judge = judge();
        judge.record(CommandKind::Rotate, params(json!({"direction": "left", "angle": 45})), true);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(judge.is_duplicate(
            &CommandKind::Rotate,
            &params(json!({"direction": "left", "angle": 50}))
        ));
        assert!(!judge.is_duplicate(
            &CommandKind::Rotate,
            &params(json!({"direction": "left", "angle": 90}))
        ));
        assert!(!judge.is_duplicate(
            &CommandKind::Rotate,
            &params(json!({"direction": "right", "angle": 45}))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire_after_retention() {
        let judge = judge();
        judge.record(CommandKind::Reset, Parameters::new(), true);
        assert!(judge.is_duplicate(&CommandKind::Reset, &Parameters::new()));

        tokio::time::advance(Duration::from_millis(6_001)).await;
        assert!(!judge.is_duplicate(&CommandKind::Reset, &Parameters::new()));
        assert!(judge.is_empty());
    }

    #[tokio::test]
    async fn test_kind_must_match() {
        let judge = judge();
        judge.record(CommandKind::Reset, Parameters::new(), true);
        assert!(!judge.is_duplicate(&CommandKind::Focus, &params(json!({"target": "chair"}))));
    }

    #[tokio::test]
    async fn test_zoom_scale_difference() {
        let judge = judge();
        judge.record(CommandKind::Zoom, params(json!({"scale": 1.5})), true);
        assert!(!judge.is_duplicate(&CommandKind::Zoom, &params(json!({"scale": 2.5}))));
        assert!(judge.is_duplicate(&CommandKind::Zoom, &params(json!({"scale": 1.7}))));
    }

    #[test]
    fn test_zoom_direction_and_distance() {
        let rules = SimilarityRules::default();
        let a = params(json!({"direction": "in", "distance": 1.0}));
        assert!(rules.similar(&CommandKind::Zoom, &a, &params(json!({"direction": "in", "distance": 1.2}))));
        assert!(!rules.similar(&CommandKind::Zoom, &a, &params(json!({"direction": "in", "distance": 1.5}))));
        assert!(!rules.similar(&CommandKind::Zoom, &a, &params(json!({"direction": "out", "distance": 1.0}))));
    }

    #[test]
    fn test_focus_by_target_and_position() {
        let rules = SimilarityRules::default();
        assert!(rules.similar(
            &CommandKind::Focus,
            &params(json!({"target": "Chair"})),
            &params(json!({"target": "chair"}))
        ));
        assert!(!rules.similar(
            &CommandKind::Focus,
            &params(json!({"target": "chair"})),
            &params(json!({"target": "table"}))
        ));
        assert!(rules.similar(
            &CommandKind::Focus,
            &params(json!({"position": [0.0, 0.0, 0.0]})),
            &params(json!({"position": {"x": 0.5, "y": 0.5, "z": 0.0}}))
        ));
        assert!(!rules.similar(
            &CommandKind::Focus,
            &params(json!({"position": [0.0, 0.0, 0.0]})),
            &params(json!({"position": [1.0, 1.0, 0.0]}))
        ));
    }

    #[test]
    fn test_generic_similarity_identical_and_disjoint() {
        let a = params(json!({"color": "red", "intensity": 10}));
        assert!((generic_similarity(&a, &a, 0.8) - 1.0).abs() < f64::EPSILON);

        let b = params(json!({"speed": 3}));
        assert!(generic_similarity(&a, &b, 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_generic_similarity_numeric_tolerance() {
        let rules = SimilarityRules::default();
        let kind = CommandKind::Other("highlight".into());
        let a = params(json!({"color": "red", "intensity": 10}));
        assert!(rules.similar(&kind, &a, &params(json!({"color": "red", "intensity": 12}))));
        assert!(!rules.similar(&kind, &a, &params(json!({"color": "red", "intensity": 20}))));
    }

    #[test]
    fn test_generic_similarity_nested_objects() {
        let rules = SimilarityRules::default();
        let kind = CommandKind::Other("light".into());
        let a = params(json!({"rgb": {"r": 100, "g": 50, "b": 0}}));
        let b = params(json!({"rgb": {"r": 110, "g": 50, "b": 0}}));
        let c = params(json!({"rgb": {"r": 0, "g": 250, "b": 255}}));
        assert!(rules.similar(&kind, &a, &b));
        assert!(!rules.similar(&kind, &a, &c));
    }

    #[test]
    fn test_history_is_bounded() {
        let judge = DedupJudge::new(&DedupConfig {
            max_records: 2,
            ..DedupConfig::default()
        });
        for angle in [10, 60, 120] {
            judge.record(CommandKind::Rotate, params(json!({"axis": "y", "angle": angle})), true);
        }
        let records = judge.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].parameters["angle"], json!(60));
    }

    proptest! {
        #[test]
        fn prop_rotate_within_tolerance_always_similar(angle in -720.0f64..720.0, delta in -14.9f64..14.9) {
            let rules = SimilarityRules::default();
            let a = params(json!({"direction": "left", "angle": angle}));
            let b = params(json!({"direction": "left", "angle": angle + delta}));
            prop_assert!(rules.similar(&CommandKind::Rotate, &a, &b));
        }

        #[test]
        fn prop_generic_similarity_is_symmetric_and_bounded(x in -100i64..100, y in -100i64..100, extra in proptest::bool::ANY) {
            let a = params(json!({"v": x, "flag": true}));
            let b = if extra {
                params(json!({"v": y, "flag": true, "more": 1}))
            } else {
                params(json!({"v": y}))
            };
            let ab = generic_similarity(&a, &b, 0.8);
            let ba = generic_similarity(&b, &a, 0.8);
            prop_assert!((ab - ba).abs() < 1e-12);
            prop_assert!((0.0..=1.0).contains(&ab));
        }
    }
}
