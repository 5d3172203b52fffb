//! Typed failure information attached to failed node executions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    UnknownFailure,
    ApplicationFailure,
    TimeoutFailure,
    AuthenticationFailure,
    AuthorizationFailure,
    ConnectivityFailure,
    DelegateProvisioningFailure,
    VerificationFailure,
    PolicyEvaluationFailure,
    InputTimeoutFailure,
    ApprovalRejection,
    UserMarkedFailure,
}

/// One failure datum, optionally carrying its own failure tags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureData {
    pub code: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub error_message: String,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    #[serde(default)]
    pub failure_data: Vec<FailureData>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.insert(failure_type);
        self
    }

    pub fn with_data(mut self, data: FailureData) -> Self {
        self.failure_data.push(data);
        self
    }

    /// Union of the top-level tags and every datum's tags.
    ///
    /// Falls back to `{UNKNOWN_FAILURE}` when neither source carries a tag, so
    /// advisers branching on failure type always see a non-empty set.
    pub fn all_failure_types(&self) -> BTreeSet<FailureType> {
        let mut types: BTreeSet<FailureType> = self
            .failure_types
            .iter()
            .chain(self.failure_data.iter().flat_map(|d| d.failure_types.iter()))
            .copied()
            .collect();
        if types.is_empty() {
            types.insert(FailureType::UnknownFailure);
        }
        types
    }

    /// Concatenate `other` into `self`; nothing from either side is dropped.
    pub fn absorb(&mut self, other: &FailureInfo) {
        if !other.error_message.is_empty() {
            if !self.error_message.is_empty() {
                self.error_message.push_str("; ");
            }
            self.error_message.push_str(&other.error_message);
        }
        self.failure_types.extend(other.failure_types.iter().copied());
        self.failure_data.extend(other.failure_data.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_types_union_top_level_and_nested() {
        let info = FailureInfo::new("boom")
            .with_type(FailureType::ApplicationFailure)
            .with_data(FailureData {
                code: "E1".into(),
                level: "ERROR".into(),
                message: "nested".into(),
                failure_types: BTreeSet::from([FailureType::ConnectivityFailure]),
            });
        assert_eq!(
            info.all_failure_types(),
            BTreeSet::from([
                FailureType::ApplicationFailure,
                FailureType::ConnectivityFailure
            ])
        );
    }

    #[test]
    fn missing_failure_types_fall_back_to_unknown() {
        let info = FailureInfo::new("no tags").with_data(FailureData::default());
        assert_eq!(
            info.all_failure_types(),
            BTreeSet::from([FailureType::UnknownFailure])
        );
    }

    #[test]
    fn absorb_concatenates() {
        let mut a = FailureInfo::new("a").with_type(FailureType::TimeoutFailure);
        let b = FailureInfo::new("b")
            .with_type(FailureType::ApplicationFailure)
            .with_data(FailureData::default());
        a.absorb(&b);
        assert_eq!(a.error_message, "a; b");
        assert_eq!(a.failure_types.len(), 2);
        assert_eq!(a.failure_data.len(), 1);
    }
}
