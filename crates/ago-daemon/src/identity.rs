use ago_core::{AgoError, AgoResult, InstanceId};

/// Resolve a user-facing name to the opaque canonical instance ID.
///
/// Accepts either a full instance ID (exact match) or a template name.
/// A template name resolves only when exactly one live instance of that
/// template exists; two or more is `AmbiguousAgent` with the candidates
/// listed, never a guess.
pub fn resolve_agent(live: &[InstanceId], name: &str) -> AgoResult<InstanceId> {
    if let Some(exact) = live.iter().find(|id| id.as_str() == name) {
        return Ok(exact.clone());
    }

    let candidates: Vec<&InstanceId> = live
        .iter()
        .filter(|id| id.template_name() == name)
        .collect();

    match candidates.as_slice() {
        [] => Err(AgoError::NoSuchAgent(name.to_string())),
        [only] => Ok((*only).clone()),
        many => Err(AgoError::AmbiguousAgent {
            name: name.to_string(),
            candidates: many.iter().map(|id| id.to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<InstanceId> {
        raw.iter()
            .map(|s| InstanceId::parse(s).expect("test id"))
            .collect()
    }

    #[test]
    fn test_exact_instance_id_wins() {
        let live = ids(&["researcher-a1b2c3d4", "researcher-e5f6a7b8"]);
        let found = resolve_agent(&live, "researcher-e5f6a7b8").unwrap();
        assert_eq!(found.as_str(), "researcher-e5f6a7b8");
    }

    #[test]
    fn test_unique_template_name_resolves() {
        let live = ids(&["researcher-a1b2c3d4", "helper-00ff00ff"]);
        let found = resolve_agent(&live, "researcher").unwrap();
        assert_eq!(found.as_str(), "researcher-a1b2c3d4");
    }

    #[test]
    fn test_ambiguous_template_name_lists_candidates() {
        let live = ids(&["researcher-a1b2c3d4", "researcher-e5f6a7b8"]);
        let err = resolve_agent(&live, "researcher").unwrap_err();
        match err {
            AgoError::AmbiguousAgent { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.contains(&"researcher-a1b2c3d4".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_name_is_no_such_agent() {
        let live = ids(&["helper-00ff00ff"]);
        let err = resolve_agent(&live, "researcher").unwrap_err();
        assert_eq!(err.kind(), "NoSuchAgent");
    }

    #[test]
    fn test_empty_live_set() {
        let err = resolve_agent(&[], "anything").unwrap_err();
        assert_eq!(err.kind(), "NoSuchAgent");
    }
}
