//! Static mapping from run mode to the ordered stages a run walks through.

use super::models::{RunInputs, RunMode, StageDefinition, StageId};

pub const INGEST: StageDefinition = StageDefinition {
    id: StageId::Ingest,
    label: "Ingest",
};
pub const GENERATE: StageDefinition = StageDefinition {
    id: StageId::Generate,
    label: "Generate",
};
pub const DRIFT: StageDefinition = StageDefinition {
    id: StageId::Drift,
    label: "Drift Check",
};
pub const REVIEW: StageDefinition = StageDefinition {
    id: StageId::Review,
    label: "Human Review",
};
pub const EXPORT: StageDefinition = StageDefinition {
    id: StageId::Export,
    label: "Export",
};

/// Ordered stage list for `mode`. Consulted once, when a run is created.
pub fn stages_for(mode: RunMode) -> &'static [StageDefinition] {
    match mode {
        RunMode::Full => &[INGEST, GENERATE, DRIFT, REVIEW, EXPORT],
        RunMode::Ingest => &[INGEST],
        RunMode::Images | RunMode::Video => &[GENERATE],
        RunMode::Drift => &[DRIFT],
        RunMode::Export => &[REVIEW, EXPORT],
    }
}

pub fn definition(id: StageId) -> StageDefinition {
    match id {
        StageId::Ingest => INGEST,
        StageId::Generate => GENERATE,
        StageId::Drift => DRIFT,
        StageId::Review => REVIEW,
        StageId::Export => EXPORT,
    }
}

/// Whether the engine should invoke the executor for `stage`.
///
/// Every stage in a run's frozen list is selected unless the run's inputs name
/// it in `skipStages`.
pub fn is_selected(stage: StageId, inputs: &RunInputs) -> bool {
    let Some(skip) = inputs.get("skipStages").and_then(|v| v.as_array()) else {
        return true;
    };
    !skip
        .iter()
        .filter_map(|v| v.as_str())
        .any(|s| s.eq_ignore_ascii_case(stage.as_str()))
}

/// Reject `skipStages` entries that do not name a stage.
pub fn validate_inputs(inputs: &RunInputs) -> Result<(), String> {
    match inputs.get("skipStages") {
        None => Ok(()),
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                let name = item
                    .as_str()
                    .ok_or_else(|| format!("skipStages entries must be strings, got {}", item))?;
                name.to_lowercase().parse::<StageId>()?;
            }
            Ok(())
        }
        Some(other) => Err(format!("skipStages must be an array, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(value: serde_json::Value) -> RunInputs {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_full_mode_has_all_five_stages_in_order() {
        let ids: Vec<StageId> = stages_for(RunMode::Full).iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                StageId::Ingest,
                StageId::Generate,
                StageId::Drift,
                StageId::Review,
                StageId::Export
            ]
        );
    }

    #[test]
    fn test_single_stage_modes() {
        assert_eq!(stages_for(RunMode::Drift), &[DRIFT]);
        assert_eq!(stages_for(RunMode::Ingest), &[INGEST]);
        assert_eq!(stages_for(RunMode::Images), &[GENERATE]);
        assert_eq!(stages_for(RunMode::Video), &[GENERATE]);
    }

    #[test]
    fn test_export_mode_passes_through_review_gate() {
        assert_eq!(stages_for(RunMode::Export), &[REVIEW, EXPORT]);
    }

    #[test]
    fn test_definition_matches_registry_labels() {
        for mode in RunMode::ALL {
            for def in stages_for(mode) {
                assert_eq!(definition(def.id), *def);
            }
        }
    }

    #[test]
    fn test_is_selected_defaults_to_true() {
        assert!(is_selected(StageId::Drift, &RunInputs::new()));
    }

    #[test]
    fn test_skip_stages_deselects() {
        let inputs = inputs(json!({"skipStages": ["drift", "Export"]}));
        assert!(!is_selected(StageId::Drift, &inputs));
        assert!(!is_selected(StageId::Export, &inputs));
        assert!(is_selected(StageId::Ingest, &inputs));
    }

    #[test]
    fn test_validate_inputs_rejects_unknown_stage() {
        assert!(validate_inputs(&inputs(json!({"skipStages": ["ingest"]}))).is_ok());
        assert!(validate_inputs(&inputs(json!({"skipStages": ["render"]}))).is_err());
        assert!(validate_inputs(&inputs(json!({"skipStages": "drift"}))).is_err());
        assert!(validate_inputs(&inputs(json!({"skipStages": [3]}))).is_err());
    }
}
